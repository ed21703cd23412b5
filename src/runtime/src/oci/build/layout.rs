//! Native OCI image layout writer.
//!
//! Produces an image layout directory for any [`ImageVariant`] without an
//! external builder: the cache layer, a config carrying the labels, the
//! manifest and `index.json`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use kcache_core::error::{CacheError, Result};
use kcache_core::variant::ImageVariant;

use super::layer::{create_cache_layer, sha256_bytes};
use super::{BuildOutput, ImageBuilder};
use crate::assembler::ImageDescription;

const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Writes cache images as OCI image layout directories.
#[derive(Debug, Clone)]
pub struct OciLayoutWriter {
    output_dir: PathBuf,
    variant: ImageVariant,
}

impl OciLayoutWriter {
    pub fn new(output_dir: impl Into<PathBuf>, variant: ImageVariant) -> Self {
        Self {
            output_dir: output_dir.into(),
            variant,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Write the layout for `description`, tagged `image` in the index.
    pub fn write(&self, description: &ImageDescription, image: &str) -> Result<BuildOutput> {
        let blobs_dir = self.output_dir.join("blobs").join("sha256");
        std::fs::create_dir_all(&blobs_dir).map_err(|e| {
            CacheError::OciImage(format!("Failed to create output blobs dir: {}", e))
        })?;

        let staging = tempfile::Builder::new()
            .prefix("kcache-layer-")
            .tempdir_in(&self.output_dir)?;
        let layer = create_cache_layer(&description.cache_dir(), &staging.path().join("layer"))?;
        let layer_blob = blobs_dir.join(&layer.digest);
        if !layer_blob.exists() {
            std::fs::rename(&layer.path, &layer_blob).map_err(|e| {
                CacheError::OciImage(format!("Failed to store layer blob: {}", e))
            })?;
        }

        let diff_ids: Vec<String> = if self.variant.is_tree() {
            vec![format!("sha256:{}", layer.diff_id)]
        } else {
            Vec::new()
        };
        let config = serde_json::json!({
            "architecture": host_arch(),
            "os": "linux",
            "created": chrono::Utc::now().to_rfc3339(),
            "config": { "Labels": description.labels },
            "rootfs": { "type": "layers", "diff_ids": diff_ids },
            "history": [{ "created_by": format!("kcache {}", self.variant) }]
        });
        let config_bytes = serde_json::to_vec_pretty(&config)?;
        let config_digest = self.put_blob(&blobs_dir, &config_bytes)?;

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": self.variant.manifest_media_type(),
            "config": {
                "mediaType": self.variant.config_media_type(),
                "digest": format!("sha256:{}", config_digest),
                "size": config_bytes.len()
            },
            "layers": [{
                "mediaType": self.variant.layer_media_type(),
                "digest": layer.prefixed_digest(),
                "size": layer.size
            }]
        });
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;
        let manifest_digest = self.put_blob(&blobs_dir, &manifest_bytes)?;

        let index = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": OCI_INDEX,
            "manifests": [{
                "mediaType": self.variant.manifest_media_type(),
                "digest": format!("sha256:{}", manifest_digest),
                "size": manifest_bytes.len(),
                "annotations": { REF_NAME_ANNOTATION: image }
            }]
        });
        std::fs::write(
            self.output_dir.join("index.json"),
            serde_json::to_string_pretty(&index)?,
        )
        .map_err(|e| CacheError::OciImage(format!("Failed to write index.json: {}", e)))?;

        std::fs::write(
            self.output_dir.join("oci-layout"),
            r#"{"imageLayoutVersion":"1.0.0"}"#,
        )
        .map_err(|e| CacheError::OciImage(format!("Failed to write oci-layout: {}", e)))?;

        let digest = format!("sha256:{}", manifest_digest);
        tracing::info!(
            path = %self.output_dir.display(),
            variant = %self.variant,
            digest = %digest,
            "Wrote OCI image layout"
        );

        Ok(BuildOutput {
            builder: self.name().to_string(),
            image: image.to_string(),
            tags: vec![image.to_string()],
            digest: Some(digest),
            location: Some(self.output_dir.clone()),
        })
    }

    fn put_blob(&self, blobs_dir: &Path, bytes: &[u8]) -> Result<String> {
        let digest = sha256_bytes(bytes);
        std::fs::write(blobs_dir.join(&digest), bytes)
            .map_err(|e| CacheError::OciImage(format!("Failed to write blob {}: {}", digest, e)))?;
        Ok(digest)
    }
}

#[async_trait]
impl ImageBuilder for OciLayoutWriter {
    fn name(&self) -> &str {
        "oci-layout"
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn build(&self, description: &ImageDescription, image: &str) -> Result<BuildOutput> {
        self.write(description, image)
    }
}

fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::assemble;
    use crate::oci::image::{ImageHandle, OciLayoutImage};
    use kcache_core::descriptor::{Arch, CacheDescriptor, CacheTarget};
    use std::fs;
    use tempfile::TempDir;

    fn description(workspace: &Path) -> ImageDescription {
        let src = workspace.join("src");
        fs::create_dir_all(src.join("abc")).unwrap();
        fs::write(src.join("abc/add.json"), "{}").unwrap();
        let record = CacheDescriptor {
            hash: "abc".to_string(),
            target: CacheTarget {
                backend: "cuda".to_string(),
                arch: Arch::new("90"),
                warp_size: 32,
            },
            ..Default::default()
        };
        assemble(&[record], &src, &workspace.join("ctx"), "kernels").unwrap()
    }

    #[test]
    fn test_write_each_variant_reads_back() {
        for variant in ImageVariant::ALL {
            let workspace = TempDir::new().unwrap();
            let description = description(workspace.path());
            let out = workspace.path().join("layout");

            let output = OciLayoutWriter::new(&out, variant)
                .write(&description, "kernels:latest")
                .unwrap();

            assert!(output.digest.unwrap().starts_with("sha256:"));
            let image = OciLayoutImage::from_path(&out).unwrap();
            assert_eq!(
                image.manifest_media_type().unwrap().as_deref(),
                Some(variant.manifest_media_type())
            );
            let layers = image.layers().unwrap();
            assert_eq!(layers.len(), 1);
            assert_eq!(layers[0].media_type, variant.layer_media_type());
            assert_eq!(image.label("cache.triton.image/hash"), Some("abc"));
        }
    }

    #[test]
    fn test_staging_dir_is_removed() {
        let workspace = TempDir::new().unwrap();
        let description = description(workspace.path());
        let out = workspace.path().join("layout");

        OciLayoutWriter::new(&out, ImageVariant::OciStandardLayer)
            .write(&description, "kernels")
            .unwrap();

        let names: Vec<String> = fs::read_dir(&out)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert!(names.iter().all(|n| !n.starts_with("kcache-layer-")));
    }
}
