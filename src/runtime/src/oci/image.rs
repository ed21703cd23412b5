//! OCI image handles.
//!
//! An [`ImageHandle`] is the read-only view of an image the extractors work
//! against: manifest media type, ordered layers and a per-layer byte stream.
//! [`OciLayoutImage`] reads an OCI image layout directory.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use kcache_core::error::{CacheError, Result};
use oci_spec::image::{ImageIndex, ImageManifest};
use serde::Deserialize;

/// One layer as declared by the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerDescriptor {
    /// Declared media type
    pub media_type: String,
    /// Digest with algorithm prefix ("sha256:...")
    pub digest: String,
    /// Size in bytes as declared
    pub size: u64,
}

/// Read-only access to an image's structure and content.
pub trait ImageHandle: Send + Sync {
    /// Media type of the image manifest, if the manifest declares one.
    fn manifest_media_type(&self) -> Result<Option<String>>;

    /// Layers in order, bottom to top.
    fn layers(&self) -> Result<Vec<LayerDescriptor>>;

    /// Stream a layer's stored (compressed) bytes.
    fn open_layer(&self, layer: &LayerDescriptor) -> Result<Box<dyn Read + '_>>;

    /// Labels from the image configuration.
    fn labels(&self) -> Result<HashMap<String, String>>;
}

/// An image stored as an OCI image layout directory.
#[derive(Debug)]
pub struct OciLayoutImage {
    /// Root directory of the OCI image layout
    root_dir: PathBuf,

    /// Image manifest
    manifest: ImageManifest,

    /// Labels from the image config
    labels: HashMap<String, String>,
}

impl OciLayoutImage {
    /// Load an image from an OCI image layout directory.
    ///
    /// The directory must contain:
    /// - oci-layout file
    /// - index.json
    /// - blobs/sha256/ directory with manifest, config, and layers
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Directory doesn't exist
    /// - OCI layout is invalid
    /// - Manifest cannot be parsed
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let root_dir = path.as_ref().to_path_buf();

        Self::validate_oci_layout(&root_dir)?;

        let index = Self::load_index(&root_dir)?;
        let manifest_digest = index
            .manifests()
            .first()
            .ok_or_else(|| CacheError::OciImage("No manifests in index.json".to_string()))?
            .digest()
            .to_string();

        let manifest = Self::load_manifest(&root_dir, &manifest_digest)?;
        let labels = Self::load_labels(&root_dir, &manifest.config().digest().to_string())?;

        tracing::debug!(
            path = %root_dir.display(),
            manifest = %manifest_digest,
            layers = manifest.layers().len(),
            "Loaded OCI layout image"
        );

        Ok(Self {
            root_dir,
            manifest,
            labels,
        })
    }

    /// Root directory of the layout.
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Get a label value by key.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(|s| s.as_str())
    }

    /// Whether `path` looks like an OCI image layout.
    pub fn is_layout(path: &Path) -> bool {
        Self::validate_oci_layout(path).is_ok()
    }

    fn validate_oci_layout(root_dir: &Path) -> Result<()> {
        for required in ["oci-layout", "index.json", "blobs"] {
            if !root_dir.join(required).exists() {
                return Err(CacheError::OciImage(format!(
                    "Not a valid OCI layout: missing {} in {}",
                    required,
                    root_dir.display()
                )));
            }
        }
        Ok(())
    }

    fn load_index(root_dir: &Path) -> Result<ImageIndex> {
        let index_path = root_dir.join("index.json");
        let content = std::fs::read_to_string(&index_path).map_err(|e| {
            CacheError::OciImage(format!(
                "Failed to read index.json at {}: {}",
                index_path.display(),
                e
            ))
        })?;

        serde_json::from_str(&content)
            .map_err(|e| CacheError::OciImage(format!("Failed to parse index.json: {}", e)))
    }

    fn load_manifest(root_dir: &Path, digest: &str) -> Result<ImageManifest> {
        let blob_path = blob_path(root_dir, digest)?;
        let content = std::fs::read_to_string(&blob_path).map_err(|e| {
            CacheError::OciImage(format!(
                "Failed to read manifest at {}: {}",
                blob_path.display(),
                e
            ))
        })?;

        serde_json::from_str(&content)
            .map_err(|e| CacheError::OciImage(format!("Failed to parse manifest: {}", e)))
    }

    fn load_labels(root_dir: &Path, digest: &str) -> Result<HashMap<String, String>> {
        let blob_path = blob_path(root_dir, digest)?;
        let content = std::fs::read(&blob_path).map_err(|e| {
            CacheError::OciImage(format!(
                "Failed to read config at {}: {}",
                blob_path.display(),
                e
            ))
        })?;
        Ok(labels_from_config(&content))
    }
}

impl ImageHandle for OciLayoutImage {
    fn manifest_media_type(&self) -> Result<Option<String>> {
        Ok(self.manifest.media_type().as_ref().map(|m| m.to_string()))
    }

    fn layers(&self) -> Result<Vec<LayerDescriptor>> {
        Ok(self
            .manifest
            .layers()
            .iter()
            .map(|layer| LayerDescriptor {
                media_type: layer.media_type().to_string(),
                digest: layer.digest().to_string(),
                size: u64::try_from(layer.size()).unwrap_or(0),
            })
            .collect())
    }

    fn open_layer(&self, layer: &LayerDescriptor) -> Result<Box<dyn Read + '_>> {
        let path = blob_path(&self.root_dir, &layer.digest)?;
        let file = File::open(&path).map_err(|e| {
            CacheError::OciImage(format!(
                "Failed to open layer blob {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Box::new(file))
    }

    fn labels(&self) -> Result<HashMap<String, String>> {
        Ok(self.labels.clone())
    }
}

/// Hex part of a `sha256:<64 lowercase hex>` digest.
///
/// Digests come from manifests we do not control and end up as file names,
/// so anything else is rejected.
pub fn digest_hex(digest: &str) -> Result<&str> {
    let hex = digest
        .strip_prefix("sha256:")
        .filter(|h| h.len() == 64 && h.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')));
    hex.ok_or_else(|| CacheError::InvalidArgument(format!("invalid blob digest '{}'", digest)))
}

/// Path of a blob inside a layout, by digest.
pub fn blob_path(root_dir: &Path, digest: &str) -> Result<PathBuf> {
    Ok(root_dir.join("blobs").join("sha256").join(digest_hex(digest)?))
}

#[derive(Debug, Default, Deserialize)]
struct RawImageConfig {
    #[serde(default)]
    config: Option<RawContainerConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct RawContainerConfig {
    #[serde(rename = "Labels", default)]
    labels: Option<HashMap<String, String>>,
}

/// Labels from an image config blob (`config.Labels`).
///
/// Artifact images commonly carry an empty or non-image config; anything
/// that does not parse yields no labels.
pub fn labels_from_config(content: &[u8]) -> HashMap<String, String> {
    match serde_json::from_slice::<RawImageConfig>(content) {
        Ok(raw) => raw.config.and_then(|c| c.labels).unwrap_or_default(),
        Err(e) => {
            tracing::debug!(error = %e, "Image config carries no readable labels");
            HashMap::new()
        }
    }
}
