//! Cache manager.
//!
//! Ties the pieces into the three user-facing workflows:
//!
//! - `extract`: fetch an image, resolve its variant, write the cache root
//! - `check`: compare an image's labels (or a directory's descriptors) with
//!   the accelerators on this host
//! - `create`: collect descriptors, stage the image context and build it

use std::path::{Path, PathBuf};

use kcache_core::config::KcacheConfig;
use kcache_core::descriptor::{CacheDescriptor, CacheSummary};
use kcache_core::error::{CacheError, Result};
use kcache_core::variant::ImageVariant;
use kcache_core::AcceleratorDescriptor;

use crate::accelerator::{default_probes, probe_all, AcceleratorProbe};
use crate::assembler::{assemble, image_title};
use crate::matcher::{matches, MatchVerdict};
use crate::metadata::find_descriptors;
use crate::oci::build::{BuildOutput, ImageBuilder};
use crate::oci::image::digest_hex;
use crate::oci::labels::CacheLabels;
use crate::oci::resolver::FormatResolver;
use crate::oci::variant::Payload;
use crate::source::{ImageRef, SourceChain};

/// What an extraction left in the cache root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractReport {
    pub reference: String,
    pub variant: ImageVariant,
    /// Cache root for tree variants, the persisted blob otherwise
    pub location: PathBuf,
    pub files: usize,
    /// Layer digest of an artifact blob
    pub digest: Option<String>,
}

/// Runs extract, check and create against one configuration.
pub struct CacheManager {
    config: KcacheConfig,
    sources: SourceChain,
    probes: Vec<Box<dyn AcceleratorProbe>>,
}

impl CacheManager {
    pub fn new(
        config: KcacheConfig,
        sources: SourceChain,
        probes: Vec<Box<dyn AcceleratorProbe>>,
    ) -> Self {
        Self {
            config,
            sources,
            probes,
        }
    }

    /// Default sources and vendor-tool probes.
    pub fn with_defaults(config: KcacheConfig) -> Self {
        let sources = SourceChain::standard(config.registry.as_ref());
        Self::new(config, sources, default_probes(None))
    }

    pub fn config(&self) -> &KcacheConfig {
        &self.config
    }

    /// Replace the accelerator probes.
    pub fn with_probes(mut self, probes: Vec<Box<dyn AcceleratorProbe>>) -> Self {
        self.probes = probes;
        self
    }

    /// Fetch `reference` and extract its cache into the cache root.
    ///
    /// Artifact blobs are stored as `<cache_root>/<digest hex>.blob`. The
    /// temporary workspace is removed when the call returns.
    pub async fn extract(&self, reference: &str) -> Result<ExtractReport> {
        let image_ref = ImageRef::parse(reference)?;
        let workspace = self.config.workspace("extract")?;

        tracing::info!(
            reference = %image_ref,
            cache_root = %self.config.cache_root.display(),
            "Extracting kernel cache"
        );

        let image = self.sources.fetch(&image_ref, workspace.path()).await?;
        std::fs::create_dir_all(&self.config.cache_root).map_err(|e| {
            CacheError::Other(format!(
                "failed to create cache root {}: {}",
                self.config.cache_root.display(),
                e
            ))
        })?;

        let outcome = FormatResolver::new(&self.config.cache_root).resolve(image.as_ref())?;

        let report = match outcome.payload {
            Payload::Directory { path, report } => ExtractReport {
                reference: reference.to_string(),
                variant: outcome.variant,
                location: path,
                files: report.files,
                digest: None,
            },
            Payload::Blob { digest, bytes } => {
                let location = self.persist_blob(&digest, &bytes)?;
                ExtractReport {
                    reference: reference.to_string(),
                    variant: outcome.variant,
                    location,
                    files: 1,
                    digest: Some(digest),
                }
            }
        };

        tracing::info!(
            variant = %report.variant,
            location = %report.location.display(),
            files = report.files,
            "Kernel cache extracted"
        );
        Ok(report)
    }

    fn persist_blob(&self, digest: &str, bytes: &[u8]) -> Result<PathBuf> {
        let hex = digest_hex(digest)?;
        let path = self.config.cache_root.join(format!("{}.blob", hex));
        std::fs::write(&path, bytes).map_err(|e| {
            CacheError::Other(format!("failed to write blob {}: {}", path.display(), e))
        })?;
        Ok(path)
    }

    /// Accelerators on this host; `None` when no probe is available.
    pub async fn accelerators(&self) -> Result<Option<Vec<AcceleratorDescriptor>>> {
        probe_all(&self.probes).await
    }

    /// Check an image's labels against this host's accelerators.
    ///
    /// Only the labels are fetched; no layer is downloaded.
    pub async fn check_image(&self, reference: &str) -> Result<MatchVerdict> {
        let cache_labels = self.image_labels(reference).await?;
        self.check_summaries(&cache_labels.entries).await
    }

    /// Decode the cache labels of an image.
    pub async fn image_labels(&self, reference: &str) -> Result<CacheLabels> {
        let image_ref = ImageRef::parse(reference)?;
        let workspace = self.config.workspace("labels")?;

        let labels = self
            .sources
            .fetch_labels(&image_ref, workspace.path())
            .await?;
        CacheLabels::from_labels(&labels)?.ok_or_else(|| {
            CacheError::Parse(format!("image {} carries no kernel cache labels", image_ref))
        })
    }

    /// Check the descriptors under `dir` against this host's accelerators.
    pub async fn check_dir(&self, dir: &Path) -> Result<MatchVerdict> {
        let summaries: Vec<CacheSummary> = find_descriptors(dir)?
            .iter()
            .map(|located| located.descriptor.summary())
            .collect();
        self.check_summaries(&summaries).await
    }

    async fn check_summaries(&self, summaries: &[CacheSummary]) -> Result<MatchVerdict> {
        let accelerators = self.accelerators().await?;
        if accelerators.is_none() {
            tracing::warn!("No accelerator probe available on this host");
        }
        matches(summaries, accelerators.as_deref(), self.config.match_policy)
    }

    /// Package the cache under `dir` as `image` with `builder`.
    pub async fn create(
        &self,
        dir: &Path,
        image: &str,
        builder: &dyn ImageBuilder,
    ) -> Result<BuildOutput> {
        let records: Vec<CacheDescriptor> = find_descriptors(dir)?
            .into_iter()
            .map(|located| located.descriptor)
            .collect();
        if records.is_empty() {
            return Err(CacheError::InvalidArgument(format!(
                "no kernel cache descriptors found under {}",
                dir.display()
            )));
        }

        let workspace = self.config.workspace("create")?;
        let description = assemble(&records, dir, workspace.path(), &image_title(image))?;

        tracing::info!(
            builder = builder.name(),
            image,
            records = records.len(),
            "Building kernel cache image"
        );
        builder.build(&description, image).await
    }
}
