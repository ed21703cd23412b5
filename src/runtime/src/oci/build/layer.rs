//! Layer creation for cache images.
//!
//! A cache layer is a gzip-compressed tar with the cache tree under
//! `io.triton.cache/`. Headers are written in deterministic mode so the same
//! tree produces the same digest.

use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use kcache_core::error::{CacheError, Result};
use kcache_core::variant::CACHE_DIR_NAME;
use sha2::{Digest, Sha256};

/// Information about a created layer.
#[derive(Debug, Clone)]
pub struct LayerInfo {
    /// Path to the layer tar.gz file
    pub path: PathBuf,
    /// SHA256 digest (hex string, without "sha256:" prefix)
    pub digest: String,
    /// SHA256 of the uncompressed tar (hex string)
    pub diff_id: String,
    /// Size in bytes
    pub size: u64,
}

impl LayerInfo {
    /// Get the digest with "sha256:" prefix.
    pub fn prefixed_digest(&self) -> String {
        format!("sha256:{}", self.digest)
    }
}

/// Create a tar.gz layer holding `cache_dir` under `io.triton.cache/`.
pub fn create_cache_layer(cache_dir: &Path, output_path: &Path) -> Result<LayerInfo> {
    let file = File::create(output_path).map_err(|e| {
        CacheError::Other(format!(
            "Failed to create layer file {}: {}",
            output_path.display(),
            e
        ))
    })?;

    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.mode(tar::HeaderMode::Deterministic);

    let prefix = Path::new(CACHE_DIR_NAME.trim_end_matches('/'));
    builder
        .append_dir(prefix, cache_dir)
        .map_err(|e| CacheError::Other(format!("Failed to add cache root to layer: {}", e)))?;
    add_dir_to_tar(&mut builder, cache_dir, cache_dir, prefix)?;

    builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .and_then(|mut file| file.flush())
        .map_err(|e| CacheError::Other(format!("Failed to finalize layer: {}", e)))?;

    let digest = sha256_file(output_path)?;
    let diff_id = sha256_decompressed(output_path)?;
    let size = std::fs::metadata(output_path)?.len();

    tracing::debug!(
        path = %output_path.display(),
        digest = %digest,
        size,
        "Created cache layer"
    );

    Ok(LayerInfo {
        path: output_path.to_path_buf(),
        digest,
        diff_id,
        size,
    })
}

/// Recursively add a directory's contents to a tar builder, sorted by name.
fn add_dir_to_tar<W: Write>(
    builder: &mut tar::Builder<W>,
    root: &Path,
    current: &Path,
    target_prefix: &Path,
) -> Result<()> {
    let mut entries = std::fs::read_dir(current)
        .map_err(|e| {
            CacheError::Other(format!(
                "Failed to read directory {}: {}",
                current.display(),
                e
            ))
        })?
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .map_err(|e| CacheError::Other(format!("Failed to strip prefix: {}", e)))?;
        let tar_path = target_prefix.join(relative);
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            builder.append_dir(&tar_path, &path).map_err(|e| {
                CacheError::Other(format!("Failed to add directory to layer: {}", e))
            })?;
            add_dir_to_tar(builder, root, &path, target_prefix)?;
        } else if file_type.is_file() {
            builder
                .append_path_with_name(&path, &tar_path)
                .map_err(|e| CacheError::Other(format!("Failed to add file to layer: {}", e)))?;
        } else {
            tracing::warn!(path = %path.display(), "Skipping non-regular file in cache layer");
        }
    }

    Ok(())
}

/// Compute SHA256 digest of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| {
        CacheError::Other(format!(
            "Failed to read file for hashing {}: {}",
            path.display(),
            e
        ))
    })?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Compute SHA256 digest of raw bytes.
pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn sha256_decompressed(path: &Path) -> Result<String> {
    let mut decoder = GzDecoder::new(BufReader::new(File::open(path)?));
    let mut hasher = Sha256::new();
    std::io::copy(&mut decoder, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn cache_tree() -> TempDir {
        let src = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("abc")).unwrap();
        fs::write(src.path().join("abc/add.json"), "{\"hash\":\"abc\"}").unwrap();
        fs::write(src.path().join("abc/add.cubin"), b"\x7fELF").unwrap();
        src
    }

    #[test]
    fn test_create_cache_layer_nests_under_cache_dir() {
        let src = cache_tree();
        let out = TempDir::new().unwrap();

        let info = create_cache_layer(src.path(), &out.path().join("layer.tar.gz")).unwrap();

        assert!(info.size > 0);
        assert_eq!(info.digest.len(), 64);
        assert_ne!(info.digest, info.diff_id);

        let file = fs::File::open(&info.path).unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        let paths: Vec<String> = archive
            .entries()
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path().unwrap().to_string_lossy().to_string())
            .collect();

        assert_eq!(paths[0].trim_end_matches('/'), "io.triton.cache");
        assert!(paths.iter().any(|p| p == "io.triton.cache/abc/add.cubin"));
    }

    #[test]
    fn test_create_cache_layer_is_deterministic() {
        let src = cache_tree();
        let out = TempDir::new().unwrap();

        let first = create_cache_layer(src.path(), &out.path().join("a.tar.gz")).unwrap();
        let second = create_cache_layer(src.path(), &out.path().join("b.tar.gz")).unwrap();

        assert_eq!(first.diff_id, second.diff_id);
    }

    #[test]
    fn test_sha256_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("test.txt");
        fs::write(&path, "hello").unwrap();

        assert_eq!(
            sha256_file(&path).unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_sha256_bytes() {
        assert_eq!(
            sha256_bytes(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_layer_info_prefixed_digest() {
        let info = LayerInfo {
            path: PathBuf::from("/tmp/layer.tar.gz"),
            digest: "abc123".to_string(),
            diff_id: "def456".to_string(),
            size: 100,
        };
        assert_eq!(info.prefixed_digest(), "sha256:abc123");
    }
}
