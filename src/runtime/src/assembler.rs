//! Image assembly: the build context and label set for a cache image.
//!
//! The assembler stages a cache directory under `io.triton.cache/` inside a
//! workspace and computes the labels that make the image checkable without
//! pulling its layers. Builders consume the resulting [`ImageDescription`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kcache_core::descriptor::{CacheDescriptor, CacheSummary};
use kcache_core::error::{CacheError, Result};
use kcache_core::variant::CACHE_DIR_NAME;

use crate::oci::labels::{CacheLabels, LABEL_TITLE};

/// Everything a builder needs to produce a cache image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescription {
    /// Build context; holds `io.triton.cache/`
    pub context_dir: PathBuf,
    /// Image title (`org.opencontainers.image.title`)
    pub title: String,
    /// Complete label set, cache labels plus title
    pub labels: BTreeMap<String, String>,
    /// Records carried by the image
    pub entries: Vec<CacheSummary>,
}

impl ImageDescription {
    /// Directory holding the staged cache tree.
    pub fn cache_dir(&self) -> PathBuf {
        self.context_dir.join(CACHE_DIR_NAME.trim_end_matches('/'))
    }

    /// Dockerfile consumed by external builders.
    pub fn dockerfile(&self) -> String {
        let mut out = String::from("FROM scratch\n");
        for (key, value) in &self.labels {
            out.push_str(&format!("LABEL {}=\"{}\"\n", key, escape_label(value)));
        }
        out.push_str(&format!("COPY {0} ./{0}\n", CACHE_DIR_NAME));
        out
    }

    /// Write the Dockerfile into the build context and return its path.
    pub fn write_dockerfile(&self) -> Result<PathBuf> {
        let path = self.context_dir.join("Dockerfile");
        std::fs::write(&path, self.dockerfile()).map_err(|e| {
            CacheError::Other(format!("failed to write {}: {}", path.display(), e))
        })?;
        tracing::debug!(path = %path.display(), "Generated Dockerfile");
        Ok(path)
    }

    /// Hash of the single record, for images that carry exactly one.
    pub fn single_hash(&self) -> Option<&str> {
        match self.entries.as_slice() {
            [only] => Some(only.hash.as_str()),
            _ => None,
        }
    }
}

/// Stage `source_dir` into `workspace` and compute the labels for `records`.
///
/// # Errors
///
/// Returns error if:
/// - `records` is empty
/// - The source directory cannot be copied
pub fn assemble(
    records: &[CacheDescriptor],
    source_dir: &Path,
    workspace: &Path,
    title: &str,
) -> Result<ImageDescription> {
    let cache_labels = CacheLabels::from_records(records)?;
    let mut labels = cache_labels.to_map()?;
    labels.insert(LABEL_TITLE.to_string(), title.to_string());

    let description = ImageDescription {
        context_dir: workspace.to_path_buf(),
        title: title.to_string(),
        labels,
        entries: cache_labels.entries,
    };

    copy_tree(source_dir, &description.cache_dir())?;

    tracing::info!(
        source = %source_dir.display(),
        context = %workspace.display(),
        entries = description.entries.len(),
        "Assembled cache image context"
    );
    Ok(description)
}

/// Title derived from an image name: last path segment without tag or digest.
pub fn image_title(image: &str) -> String {
    let last = image.rsplit('/').next().unwrap_or(image);
    let last = last.split('@').next().unwrap_or(last);
    last.split(':').next().unwrap_or(last).to_string()
}

fn escape_label(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst).map_err(|e| {
        CacheError::Other(format!("failed to create {}: {}", dst.display(), e))
    })?;
    for entry in std::fs::read_dir(src).map_err(|e| {
        CacheError::Other(format!("failed to read directory {}: {}", src.display(), e))
    })? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree(&src_path, &dst_path)?;
        } else if file_type.is_file() {
            std::fs::copy(&src_path, &dst_path).map_err(|e| {
                CacheError::Other(format!(
                    "failed to copy {} to {}: {}",
                    src_path.display(),
                    dst_path.display(),
                    e
                ))
            })?;
        } else {
            tracing::warn!(path = %src_path.display(), "Skipping non-regular file");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::labels::{LABEL_ENTRY_COUNT, LABEL_METADATA, LABEL_VARIANT};
    use kcache_core::descriptor::{Arch, CacheTarget};
    use std::fs;
    use tempfile::TempDir;

    fn descriptor(hash: &str) -> CacheDescriptor {
        CacheDescriptor {
            hash: hash.to_string(),
            target: CacheTarget {
                backend: "cuda".to_string(),
                arch: Arch::new("90"),
                warp_size: 32,
            },
            ptx_version: Some(83),
            ..Default::default()
        }
    }

    fn source_tree() -> TempDir {
        let src = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("abc")).unwrap();
        fs::write(src.path().join("abc/add.json"), "{}").unwrap();
        fs::write(src.path().join("abc/add.cubin"), b"\x7fELF").unwrap();
        src
    }

    #[test]
    fn test_assemble_single_record() {
        let src = source_tree();
        let workspace = TempDir::new().unwrap();

        let description =
            assemble(&[descriptor("abc")], src.path(), workspace.path(), "kernels").unwrap();

        assert!(workspace.path().join("io.triton.cache/abc/add.cubin").exists());
        assert_eq!(description.labels[LABEL_VARIANT], "compat");
        assert_eq!(description.labels[LABEL_TITLE], "kernels");
        assert_eq!(description.single_hash(), Some("abc"));
    }

    #[test]
    fn test_assemble_multi_record() {
        let src = source_tree();
        let workspace = TempDir::new().unwrap();

        let description = assemble(
            &[descriptor("a"), descriptor("b")],
            src.path(),
            workspace.path(),
            "kernels",
        )
        .unwrap();

        assert_eq!(description.labels[LABEL_VARIANT], "multi");
        assert_eq!(description.labels[LABEL_ENTRY_COUNT], "2");
        assert!(description.labels.contains_key(LABEL_METADATA));
        assert_eq!(description.single_hash(), None);
    }

    #[test]
    fn test_assemble_without_records_is_invalid() {
        let src = source_tree();
        let workspace = TempDir::new().unwrap();

        let result = assemble(&[], src.path(), workspace.path(), "kernels");

        assert!(matches!(result, Err(CacheError::InvalidArgument(_))));
        assert!(!workspace.path().join("io.triton.cache").exists());
    }

    #[test]
    fn test_dockerfile_rendering() {
        let src = source_tree();
        let workspace = TempDir::new().unwrap();
        let description = assemble(
            &[descriptor("a"), descriptor("b")],
            src.path(),
            workspace.path(),
            "kernels",
        )
        .unwrap();

        let dockerfile = description.dockerfile();

        assert!(dockerfile.starts_with("FROM scratch\n"));
        assert!(dockerfile.contains("LABEL org.opencontainers.image.title=\"kernels\"\n"));
        assert!(dockerfile.contains(r#"LABEL cache.triton.image/metadata="[{\"hash\":\"a\""#));
        assert!(dockerfile.ends_with("COPY io.triton.cache/ ./io.triton.cache/\n"));

        let path = description.write_dockerfile().unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), dockerfile);
    }

    #[test]
    fn test_image_title() {
        assert_eq!(image_title("quay.io/org/kernels:v1"), "kernels");
        assert_eq!(image_title("localhost:5000/kernels"), "kernels");
        assert_eq!(image_title("kernels@sha256:abc"), "kernels");
        assert_eq!(image_title("kernels"), "kernels");
    }
}
