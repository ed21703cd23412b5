//! Variant extractors.
//!
//! Each image variant is one row of a fixed table: a precondition check over
//! the layer list and an extraction step over the selected layer. A failed
//! precondition is a [`CacheError::FormatMismatch`] and nothing is written.

use std::io::Read;
use std::path::{Path, PathBuf};

use kcache_core::error::{CacheError, Result};
use kcache_core::variant::{ImageVariant, CACHE_DIR_NAME};

use super::image::{ImageHandle, LayerDescriptor};
use crate::materialize::{materialize, MaterializeReport};

/// What an extraction produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// A cache tree written under the cache root
    Directory {
        path: PathBuf,
        report: MaterializeReport,
    },
    /// The raw bytes of a single-blob cache layer
    Blob { digest: String, bytes: Vec<u8> },
}

/// Successful extraction: which variant matched and what it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionOutcome {
    pub variant: ImageVariant,
    pub payload: Payload,
}

type SelectFn = fn(ImageVariant, &[LayerDescriptor]) -> Result<usize>;
type ExtractFn = fn(ImageVariant, &dyn ImageHandle, &LayerDescriptor, &Path) -> Result<Payload>;

/// One variant's precondition and extraction step.
pub struct VariantExtractor {
    pub variant: ImageVariant,
    select: SelectFn,
    extract: ExtractFn,
}

/// Extractors in resolution order.
pub static EXTRACTORS: [VariantExtractor; 3] = [
    VariantExtractor {
        variant: ImageVariant::DockerLegacyLayer,
        select: select_last_layer,
        extract: extract_tree,
    },
    VariantExtractor {
        variant: ImageVariant::OciStandardLayer,
        select: select_last_layer,
        extract: extract_tree,
    },
    VariantExtractor {
        variant: ImageVariant::OciArtifactLayer,
        select: select_single_layer,
        extract: extract_blob,
    },
];

/// The table row for `variant`.
pub fn extractor_for(variant: ImageVariant) -> &'static VariantExtractor {
    match variant {
        ImageVariant::DockerLegacyLayer => &EXTRACTORS[0],
        ImageVariant::OciStandardLayer => &EXTRACTORS[1],
        ImageVariant::OciArtifactLayer => &EXTRACTORS[2],
    }
}

impl VariantExtractor {
    /// Index of the payload layer if the image has this variant's shape.
    pub fn applies(&self, layers: &[LayerDescriptor]) -> Result<usize> {
        (self.select)(self.variant, layers)
    }

    /// Check the preconditions, then extract into `cache_root`.
    pub fn run(&self, image: &dyn ImageHandle, cache_root: &Path) -> Result<ExtractionOutcome> {
        let layers = image.layers()?;
        let index = self.applies(&layers)?;
        let layer = &layers[index];

        tracing::debug!(
            variant = %self.variant,
            digest = %layer.digest,
            media_type = %layer.media_type,
            "Extracting cache layer"
        );

        let payload = (self.extract)(self.variant, image, layer, cache_root)?;
        Ok(ExtractionOutcome {
            variant: self.variant,
            payload,
        })
    }
}

fn select_last_layer(variant: ImageVariant, layers: &[LayerDescriptor]) -> Result<usize> {
    let Some(last) = layers.last() else {
        return Err(CacheError::mismatch(variant, "image has no layers"));
    };
    check_media_type(variant, last)?;
    Ok(layers.len() - 1)
}

fn select_single_layer(variant: ImageVariant, layers: &[LayerDescriptor]) -> Result<usize> {
    if layers.len() != 1 {
        return Err(CacheError::mismatch(
            variant,
            format!("expected exactly 1 layer, found {}", layers.len()),
        ));
    }
    check_media_type(variant, &layers[0])?;
    Ok(0)
}

fn check_media_type(variant: ImageVariant, layer: &LayerDescriptor) -> Result<()> {
    let expected = variant.layer_media_type();
    if layer.media_type != expected {
        return Err(CacheError::mismatch(
            variant,
            format!(
                "layer media type is {}, expected {}",
                layer.media_type, expected
            ),
        ));
    }
    Ok(())
}

fn extract_tree(
    variant: ImageVariant,
    image: &dyn ImageHandle,
    layer: &LayerDescriptor,
    cache_root: &Path,
) -> Result<Payload> {
    let reader = image.open_layer(layer)?;
    let report = materialize(reader, CACHE_DIR_NAME, cache_root).map_err(|e| match e {
        CacheError::Parse(message) => CacheError::CorruptPayload { variant, message },
        other => other,
    })?;
    Ok(Payload::Directory {
        path: cache_root.to_path_buf(),
        report,
    })
}

fn extract_blob(
    variant: ImageVariant,
    image: &dyn ImageHandle,
    layer: &LayerDescriptor,
    _cache_root: &Path,
) -> Result<Payload> {
    let mut bytes = Vec::new();
    image
        .open_layer(layer)?
        .read_to_end(&mut bytes)
        .map_err(|e| CacheError::CorruptPayload {
            variant,
            message: format!("failed to read layer {}: {}", layer.digest, e),
        })?;
    Ok(Payload::Blob {
        digest: layer.digest.clone(),
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kcache_core::variant::{CACHE_CONTENT_LAYER, DOCKER_LAYER, OCI_LAYER_GZIP};

    fn layer(media_type: &str) -> LayerDescriptor {
        LayerDescriptor {
            media_type: media_type.to_string(),
            digest: "sha256:abc".to_string(),
            size: 1,
        }
    }

    #[test]
    fn test_table_order_matches_variants() {
        let order: Vec<ImageVariant> = EXTRACTORS.iter().map(|e| e.variant).collect();
        assert_eq!(order, ImageVariant::ALL.to_vec());
        for variant in ImageVariant::ALL {
            assert_eq!(extractor_for(variant).variant, variant);
        }
    }

    #[test]
    fn test_tree_variants_select_last_layer() {
        let layers = vec![layer("application/octet-stream"), layer(OCI_LAYER_GZIP)];
        assert_eq!(
            extractor_for(ImageVariant::OciStandardLayer)
                .applies(&layers)
                .unwrap(),
            1
        );

        let layers = vec![layer(DOCKER_LAYER), layer(DOCKER_LAYER)];
        assert_eq!(
            extractor_for(ImageVariant::DockerLegacyLayer)
                .applies(&layers)
                .unwrap(),
            1
        );
    }

    #[test]
    fn test_tree_variant_rejects_wrong_last_layer() {
        let layers = vec![layer(OCI_LAYER_GZIP), layer(DOCKER_LAYER)];
        let err = extractor_for(ImageVariant::OciStandardLayer)
            .applies(&layers)
            .unwrap_err();
        assert!(err.is_format_mismatch());
        assert!(err.to_string().contains(DOCKER_LAYER));
    }

    #[test]
    fn test_tree_variant_rejects_empty_image() {
        let err = extractor_for(ImageVariant::DockerLegacyLayer)
            .applies(&[])
            .unwrap_err();
        assert!(err.is_format_mismatch());
    }

    #[test]
    fn test_artifact_requires_exactly_one_layer() {
        let layers = vec![layer(CACHE_CONTENT_LAYER), layer(OCI_LAYER_GZIP)];
        let err = extractor_for(ImageVariant::OciArtifactLayer)
            .applies(&layers)
            .unwrap_err();
        assert!(err.is_format_mismatch());
        assert!(err.to_string().contains("expected exactly 1 layer, found 2"));
    }

    #[test]
    fn test_artifact_checks_media_type() {
        let err = extractor_for(ImageVariant::OciArtifactLayer)
            .applies(&[layer(OCI_LAYER_GZIP)])
            .unwrap_err();
        assert!(err.is_format_mismatch());
        assert_eq!(
            extractor_for(ImageVariant::OciArtifactLayer)
                .applies(&[layer(CACHE_CONTENT_LAYER)])
                .unwrap(),
            0
        );
    }
}
