//! Live accelerator capabilities.

use serde::{Deserialize, Serialize};

use crate::descriptor::{Arch, CUDA_BACKEND};

/// One GPU's reported capability, as seen by the kernel compiler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceleratorDescriptor {
    /// Marketing name (e.g. "NVIDIA H100 80GB HBM3")
    #[serde(default)]
    pub name: String,

    /// Vendor unique identifier
    #[serde(default)]
    pub uuid: String,

    /// Compute backend ("cuda", "hip")
    pub backend: String,

    /// Architecture in the same normalized form descriptors use
    pub arch: Arch,

    /// Warp or wavefront width
    pub warp_size: u32,

    /// PTX ISA version supported by the installed CUDA stack
    #[serde(default)]
    pub ptx_version: Option<u32>,

    /// Total device memory in MiB
    #[serde(default)]
    pub memory_total_mb: u64,
}

impl AcceleratorDescriptor {
    /// Whether the backend belongs to the CUDA family.
    pub fn is_cuda(&self) -> bool {
        self.backend == CUDA_BACKEND || self.backend.starts_with("cuda")
    }
}
