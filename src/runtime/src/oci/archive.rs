//! Docker archive images (`docker save` tarballs).
//!
//! The tarball is unpacked into a workspace and read through its
//! `manifest.json`. Layers are reported with the Docker layer media type and
//! the manifest with the Docker v2 manifest type, since that is the shape the
//! engine exported. Layers stored uncompressed are gzip-encoded on read so
//! every handle streams the compressed form.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzEncoder;
use flate2::Compression;
use kcache_core::error::{CacheError, Result};
use kcache_core::variant::{DOCKER_LAYER, DOCKER_MANIFEST_V2};
use serde::Deserialize;

use super::build::layer::sha256_file;
use super::image::{labels_from_config, ImageHandle, LayerDescriptor, OciLayoutImage};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ArchiveManifestEntry {
    config: String,
    #[serde(default)]
    repo_tags: Option<Vec<String>>,
    layers: Vec<String>,
}

/// An image exported by `docker save` / `podman save`, unpacked on disk.
#[derive(Debug)]
pub struct DockerArchiveImage {
    root_dir: PathBuf,
    layers: Vec<(LayerDescriptor, PathBuf)>,
    labels: HashMap<String, String>,
}

impl DockerArchiveImage {
    /// Read an unpacked archive directory.
    ///
    /// When the archive holds several images, `tag` selects the one whose
    /// `RepoTags` contains it; otherwise the first image is used.
    pub fn from_dir(dir: impl AsRef<Path>, tag: Option<&str>) -> Result<Self> {
        let root_dir = dir.as_ref().to_path_buf();
        let manifest_path = root_dir.join("manifest.json");
        let content = std::fs::read(&manifest_path).map_err(|e| {
            CacheError::OciImage(format!(
                "Failed to read {}: {}",
                manifest_path.display(),
                e
            ))
        })?;
        let entries: Vec<ArchiveManifestEntry> = serde_json::from_slice(&content)
            .map_err(|e| CacheError::OciImage(format!("Failed to parse manifest.json: {}", e)))?;

        let entry = select_entry(&entries, tag).ok_or_else(|| {
            CacheError::OciImage(format!(
                "No image{} in archive {}",
                tag.map(|t| format!(" tagged {}", t)).unwrap_or_default(),
                root_dir.display()
            ))
        })?;

        let config_path = archive_path(&root_dir, &entry.config)?;
        let config = std::fs::read(&config_path).map_err(|e| {
            CacheError::OciImage(format!(
                "Failed to read config {}: {}",
                config_path.display(),
                e
            ))
        })?;
        let labels = labels_from_config(&config);

        let mut layers = Vec::with_capacity(entry.layers.len());
        for layer in &entry.layers {
            let path = archive_path(&root_dir, layer)?;
            let size = std::fs::metadata(&path)?.len();
            let descriptor = LayerDescriptor {
                media_type: DOCKER_LAYER.to_string(),
                digest: format!("sha256:{}", sha256_file(&path)?),
                size,
            };
            layers.push((descriptor, path));
        }

        tracing::debug!(
            path = %root_dir.display(),
            layers = layers.len(),
            "Loaded docker archive image"
        );

        Ok(Self {
            root_dir,
            layers,
            labels,
        })
    }

    /// Root directory of the unpacked archive.
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }
}

impl ImageHandle for DockerArchiveImage {
    fn manifest_media_type(&self) -> Result<Option<String>> {
        Ok(Some(DOCKER_MANIFEST_V2.to_string()))
    }

    fn layers(&self) -> Result<Vec<LayerDescriptor>> {
        Ok(self.layers.iter().map(|(d, _)| d.clone()).collect())
    }

    fn open_layer(&self, layer: &LayerDescriptor) -> Result<Box<dyn Read + '_>> {
        let (_, path) = self
            .layers
            .iter()
            .find(|(d, _)| d.digest == layer.digest)
            .ok_or_else(|| CacheError::OciImage(format!("Unknown layer {}", layer.digest)))?;

        let mut file = File::open(path)?;
        let mut magic = [0u8; 2];
        let is_gzip = file.read_exact(&mut magic).is_ok() && magic == GZIP_MAGIC;
        file.seek(SeekFrom::Start(0))?;

        if is_gzip {
            Ok(Box::new(BufReader::new(file)))
        } else {
            Ok(Box::new(GzEncoder::new(
                BufReader::new(file),
                Compression::fast(),
            )))
        }
    }

    fn labels(&self) -> Result<HashMap<String, String>> {
        Ok(self.labels.clone())
    }
}

/// Unpack an image tarball into `dest` and open it.
///
/// Handles both `docker save` output (`manifest.json`) and OCI archives
/// (`oci-layout` + `index.json`).
pub fn open_archive(
    archive: &Path,
    dest: &Path,
    tag: Option<&str>,
) -> Result<Box<dyn ImageHandle>> {
    let file = File::open(archive).map_err(|e| {
        CacheError::OciImage(format!(
            "Failed to open archive {}: {}",
            archive.display(),
            e
        ))
    })?;
    std::fs::create_dir_all(dest)?;
    tar::Archive::new(BufReader::new(file))
        .unpack(dest)
        .map_err(|e| {
            CacheError::OciImage(format!(
                "Failed to unpack archive {}: {}",
                archive.display(),
                e
            ))
        })?;

    if dest.join("manifest.json").exists() {
        Ok(Box::new(DockerArchiveImage::from_dir(dest, tag)?))
    } else if OciLayoutImage::is_layout(dest) {
        Ok(Box::new(OciLayoutImage::from_path(dest)?))
    } else {
        Err(CacheError::OciImage(format!(
            "{} is neither a docker archive nor an OCI archive",
            archive.display()
        )))
    }
}

fn select_entry<'a>(
    entries: &'a [ArchiveManifestEntry],
    tag: Option<&str>,
) -> Option<&'a ArchiveManifestEntry> {
    match tag {
        Some(tag) => entries.iter().find(|e| {
            e.repo_tags
                .as_deref()
                .unwrap_or_default()
                .iter()
                .any(|t| t == tag)
        }),
        None => entries.first(),
    }
}

/// Resolve a manifest-relative path, refusing anything that leaves the archive.
fn archive_path(root: &Path, relative: &str) -> Result<PathBuf> {
    let relative = Path::new(relative);
    if !relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(CacheError::OciImage(format!(
            "Archive path escapes the archive: {}",
            relative.display()
        )));
    }
    Ok(root.join(relative))
}
