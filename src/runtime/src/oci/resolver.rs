//! Format resolution.
//!
//! Decides which variants to try from the manifest media type, then tries
//! them in order. Only a format mismatch moves on to the next variant; a
//! corrupt payload in a variant whose preconditions held is returned as is.

use std::path::{Path, PathBuf};

use kcache_core::error::{CacheError, Result, VariantAttempt};
use kcache_core::variant::{ImageVariant, DOCKER_MANIFEST_V2};

use super::image::ImageHandle;
use super::variant::{extractor_for, ExtractionOutcome};

/// Variants to attempt, in order, for a manifest media type.
pub fn plan(manifest_media_type: Option<&str>) -> &'static [ImageVariant] {
    const DOCKER: [ImageVariant; 1] = [ImageVariant::DockerLegacyLayer];
    const OCI: [ImageVariant; 2] = [ImageVariant::OciStandardLayer, ImageVariant::OciArtifactLayer];

    if manifest_media_type == Some(DOCKER_MANIFEST_V2) {
        &DOCKER
    } else {
        &OCI
    }
}

/// Extracts cache payloads into one cache root.
#[derive(Debug, Clone)]
pub struct FormatResolver {
    cache_root: PathBuf,
}

impl FormatResolver {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
        }
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Resolve the image's variant and extract its payload.
    ///
    /// A Docker v2 manifest is only tried as the Docker legacy variant and
    /// that result is returned directly. Anything else is tried as the OCI
    /// standard layer, then the artifact layer; when both reject the image
    /// the error carries the manifest failure (if any) and both rejections.
    pub fn resolve(&self, image: &dyn ImageHandle) -> Result<ExtractionOutcome> {
        let (media_type, manifest_error) = match image.manifest_media_type() {
            Ok(media_type) => (media_type, None),
            Err(e) => {
                tracing::debug!(error = %e, "Manifest unavailable, trying OCI variants");
                (None, Some(e.to_string()))
            }
        };

        let variants = plan(media_type.as_deref());
        if let [only] = variants {
            return extractor_for(*only).run(image, &self.cache_root);
        }

        let mut attempts = Vec::with_capacity(variants.len());
        for &variant in variants {
            match extractor_for(variant).run(image, &self.cache_root) {
                Ok(outcome) => {
                    tracing::info!(variant = %variant, "Resolved image variant");
                    return Ok(outcome);
                }
                Err(CacheError::FormatMismatch { variant, reason }) => {
                    tracing::debug!(variant = %variant, reason = %reason, "Variant rejected");
                    attempts.push(VariantAttempt { variant, reason });
                }
                Err(e) => return Err(e),
            }
        }

        Err(CacheError::UnrecognizedImage {
            manifest_error,
            attempts,
        })
    }
}
