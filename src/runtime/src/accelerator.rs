//! Accelerator probing.
//!
//! Probes ask vendor tools which GPUs are present and describe them in the
//! form kernel descriptors use, so the matcher can compare the two directly.

use std::path::PathBuf;

use async_trait::async_trait;
use kcache_core::descriptor::{Arch, CUDA_BACKEND};
use kcache_core::error::{CacheError, Result};
use kcache_core::AcceleratorDescriptor;
use serde::Deserialize;

use crate::command;

/// Backend name Triton uses for AMD GPUs.
pub const HIP_BACKEND: &str = "hip";

const NVIDIA_WARP_SIZE: u32 = 32;
const AMD_WAVEFRONT_SIZE: u32 = 64;

/// Reports the accelerators visible on this host.
#[async_trait]
pub trait AcceleratorProbe: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the probe's tool is installed.
    fn is_available(&self) -> bool;

    async fn probe(&self) -> Result<Vec<AcceleratorDescriptor>>;
}

/// NVIDIA GPUs through `nvidia-smi`.
#[derive(Debug, Default, Clone)]
pub struct NvidiaSmiProbe;

#[async_trait]
impl AcceleratorProbe for NvidiaSmiProbe {
    fn name(&self) -> &str {
        "nvidia-smi"
    }

    fn is_available(&self) -> bool {
        command::find_executable("nvidia-smi").is_some()
    }

    async fn probe(&self) -> Result<Vec<AcceleratorDescriptor>> {
        let csv = command::run_text(
            "nvidia-smi",
            [
                "--query-gpu=name,uuid,compute_cap,memory.total",
                "--format=csv,noheader,nounits",
            ],
        )
        .await?;
        let banner = command::run_text("nvidia-smi", std::iter::empty::<&str>()).await?;

        let ptx_version =
            parse_cuda_version(&banner).and_then(|(major, minor)| ptx_for_cuda(major, minor));
        if ptx_version.is_none() {
            tracing::warn!("Could not determine CUDA version from nvidia-smi; PTX checks disabled");
        }

        parse_nvidia_csv(&csv, ptx_version)
    }
}

/// Parse `--query-gpu=name,uuid,compute_cap,memory.total` CSV rows.
pub fn parse_nvidia_csv(csv: &str, ptx_version: Option<u32>) -> Result<Vec<AcceleratorDescriptor>> {
    let mut devices = Vec::new();

    for line in csv.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 4 {
            return Err(CacheError::Probe(format!(
                "unexpected nvidia-smi row '{}': expected 4 fields",
                line
            )));
        }
        // GPU names may contain commas; the last three fields never do
        let n = fields.len();
        let name = fields[..n - 3].join(", ");
        let uuid = fields[n - 3];
        let compute_cap = fields[n - 2];
        let memory = fields[n - 1];

        devices.push(AcceleratorDescriptor {
            name,
            uuid: uuid.to_string(),
            backend: CUDA_BACKEND.to_string(),
            arch: Arch::new(compute_cap.replace('.', "")),
            warp_size: NVIDIA_WARP_SIZE,
            ptx_version,
            memory_total_mb: memory.parse().unwrap_or(0),
        });
    }

    Ok(devices)
}

/// Extract `(major, minor)` from the `CUDA Version: 12.4` banner field.
pub fn parse_cuda_version(banner: &str) -> Option<(u32, u32)> {
    let rest = banner.split("CUDA Version:").nth(1)?;
    let version = rest.split_whitespace().next()?;
    let (major, minor) = version.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// PTX ISA version shipped with a CUDA release, following Triton's table.
pub fn ptx_for_cuda(major: u32, minor: u32) -> Option<u32> {
    match major {
        13 => Some(90 + minor),
        12 if minor < 6 => Some(80 + minor),
        12 => Some(79 + minor),
        11 => Some(70 + minor),
        10 => Some(63 + minor),
        _ => None,
    }
}

/// AMD GPUs through `rocm-smi --json`.
#[derive(Debug, Default, Clone)]
pub struct RocmSmiProbe;

#[derive(Debug, Deserialize)]
struct RocmCard {
    #[serde(rename = "Card Series", alias = "Card series", alias = "Card model", default)]
    name: Option<String>,
    #[serde(rename = "Unique ID", default)]
    uuid: Option<String>,
    #[serde(rename = "GFX Version", default)]
    gfx_version: Option<String>,
    #[serde(rename = "VRAM Total Memory (B)", default)]
    memory_total_b: Option<String>,
}

#[async_trait]
impl AcceleratorProbe for RocmSmiProbe {
    fn name(&self) -> &str {
        "rocm-smi"
    }

    fn is_available(&self) -> bool {
        command::find_executable("rocm-smi").is_some()
    }

    async fn probe(&self) -> Result<Vec<AcceleratorDescriptor>> {
        let stdout = command::run(
            "rocm-smi",
            [
                "--showproductname",
                "--showuniqueid",
                "--showmeminfo",
                "vram",
                "--json",
            ],
        )
        .await?;
        parse_rocm_json(&stdout)
    }
}

/// Parse `rocm-smi --json` output keyed by `card0`, `card1`, ...
pub fn parse_rocm_json(stdout: &[u8]) -> Result<Vec<AcceleratorDescriptor>> {
    let cards: std::collections::BTreeMap<String, serde_json::Value> =
        serde_json::from_slice(stdout)
            .map_err(|e| CacheError::Probe(format!("invalid rocm-smi output: {}", e)))?;

    let mut indexed = Vec::new();
    for (key, value) in cards {
        let index = match key
            .strip_prefix("card")
            .or_else(|| key.strip_prefix("GPU"))
            .and_then(|n| n.parse::<u32>().ok())
        {
            Some(index) => index,
            // "system" and other non-device sections
            None => continue,
        };
        let card: RocmCard = serde_json::from_value(value)
            .map_err(|e| CacheError::Probe(format!("invalid rocm-smi entry {}: {}", key, e)))?;

        let gfx = card.gfx_version.unwrap_or_default();
        if gfx.is_empty() {
            tracing::warn!(card = %key, "rocm-smi did not report a GFX version");
        }
        let memory_total_mb = card
            .memory_total_b
            .and_then(|b| b.trim().parse::<u64>().ok())
            .map(|b| b / (1024 * 1024))
            .unwrap_or(0);

        indexed.push((
            index,
            AcceleratorDescriptor {
                name: card.name.unwrap_or_default(),
                uuid: card.uuid.unwrap_or_default(),
                backend: HIP_BACKEND.to_string(),
                arch: Arch::new(gfx),
                warp_size: AMD_WAVEFRONT_SIZE,
                ptx_version: None,
                memory_total_mb,
            },
        ));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, device)| device).collect())
}

/// Accelerators listed in a JSON file, for hosts without vendor tools.
#[derive(Debug, Clone)]
pub struct StaticProbe {
    path: PathBuf,
}

impl StaticProbe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl AcceleratorProbe for StaticProbe {
    fn name(&self) -> &str {
        "static"
    }

    fn is_available(&self) -> bool {
        self.path.is_file()
    }

    async fn probe(&self) -> Result<Vec<AcceleratorDescriptor>> {
        let content = tokio::fs::read(&self.path).await.map_err(|e| {
            CacheError::Probe(format!("failed to read {}: {}", self.path.display(), e))
        })?;
        serde_json::from_slice(&content).map_err(|e| {
            CacheError::Probe(format!("invalid accelerator file {}: {}", self.path.display(), e))
        })
    }
}

/// Probes used when the caller does not supply a device file.
pub fn default_probes(static_file: Option<PathBuf>) -> Vec<Box<dyn AcceleratorProbe>> {
    match static_file {
        Some(path) => vec![Box::new(StaticProbe::new(path))],
        None => vec![Box::new(NvidiaSmiProbe), Box::new(RocmSmiProbe)],
    }
}

/// Run every available probe and concatenate the results.
///
/// Returns `None` when no probe is available. A failing probe is logged and
/// skipped; if every available probe fails, the last error is returned.
pub async fn probe_all(
    probes: &[Box<dyn AcceleratorProbe>],
) -> Result<Option<Vec<AcceleratorDescriptor>>> {
    let mut devices = Vec::new();
    let mut ran = 0usize;
    let mut succeeded = 0usize;
    let mut last_error = None;

    for probe in probes.iter().filter(|p| p.is_available()) {
        ran += 1;
        match probe.probe().await {
            Ok(found) => {
                tracing::debug!(probe = probe.name(), count = found.len(), "Probed accelerators");
                succeeded += 1;
                devices.extend(found);
            }
            Err(e) => {
                tracing::warn!(probe = probe.name(), error = %e, "Accelerator probe failed");
                last_error = Some(e);
            }
        }
    }

    if ran == 0 {
        return Ok(None);
    }
    match last_error {
        Some(e) if succeeded == 0 => Err(e),
        _ => Ok(Some(devices)),
    }
}
