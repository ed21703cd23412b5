//! Cache image builders.
//!
//! A builder turns an [`ImageDescription`] into an image: either through an
//! installed container tool fed a generated Dockerfile, or natively as an OCI
//! image layout directory.
//!
//! # Usage
//!
//! ```text
//! kcache create --dir ~/.triton/cache --image quay.io/org/kernels:v1 --builder podman
//! kcache create --dir ~/.triton/cache --image kernels --builder oci-layout --output ./kernels
//! ```

pub mod layer;
pub mod layout;
pub mod tool;

use std::path::PathBuf;

use async_trait::async_trait;
use kcache_core::error::{CacheError, Result};

use crate::assembler::ImageDescription;

pub use layer::LayerInfo;
pub use layout::OciLayoutWriter;
pub use tool::{BuildTool, ToolBuilder};

/// Result of a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutput {
    /// Builder that produced the image
    pub builder: String,
    /// Requested image name
    pub image: String,
    /// Every tag applied
    pub tags: Vec<String>,
    /// Manifest digest, when the builder reports one
    pub digest: Option<String>,
    /// Output location for on-disk builders
    pub location: Option<PathBuf>,
}

/// Produces an image from an assembled description.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the builder can run on this host.
    fn is_available(&self) -> bool;

    async fn build(&self, description: &ImageDescription, image: &str) -> Result<BuildOutput>;
}

/// Pick a tool builder: the requested one, or the first installed.
pub fn select_builder(preference: Option<BuildTool>) -> Result<Box<dyn ImageBuilder>> {
    let candidates: Vec<BuildTool> = match preference {
        Some(tool) => vec![tool],
        None => BuildTool::PREFERENCE.to_vec(),
    };

    for tool in candidates {
        let builder = ToolBuilder::new(tool);
        if builder.is_available() {
            tracing::debug!(builder = builder.name(), "Selected image builder");
            return Ok(Box::new(builder));
        }
    }

    Err(CacheError::Tool {
        tool: preference
            .map(|t| t.program().to_string())
            .unwrap_or_else(|| "buildah, podman, docker".to_string()),
        message: "no supported image builder found on PATH".to_string(),
    })
}
