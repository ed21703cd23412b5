//! Descriptor files on disk.
//!
//! A cache directory holds one JSON descriptor per compiled kernel next to
//! its binaries. Descriptors with an empty hash are not entries and are
//! skipped silently.

use std::path::{Path, PathBuf};

use kcache_core::descriptor::CacheDescriptor;
use kcache_core::error::{CacheError, Result};

/// A descriptor and the file it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct LocatedDescriptor {
    pub path: PathBuf,
    pub descriptor: CacheDescriptor,
}

/// Parse one descriptor file.
///
/// Malformed JSON, a non-object document and a non-string `hash` are errors.
/// A missing or empty `hash` yields `Ok(None)`.
pub fn parse_descriptor_file(path: &Path) -> Result<Option<CacheDescriptor>> {
    let content = std::fs::read(path).map_err(|e| {
        CacheError::Other(format!("failed to read {}: {}", path.display(), e))
    })?;
    parse_descriptor(&content)
        .map_err(|e| CacheError::Parse(format!("{}: {}", path.display(), e)))
}

fn parse_descriptor(content: &[u8]) -> std::result::Result<Option<CacheDescriptor>, String> {
    let value: serde_json::Value = serde_json::from_slice(content).map_err(|e| e.to_string())?;
    let Some(object) = value.as_object() else {
        return Err("descriptor must be a JSON object".to_string());
    };

    // Descriptors without a hash are not required to carry a target either
    match object.get("hash") {
        None | Some(serde_json::Value::Null) => return Ok(None),
        Some(serde_json::Value::String(hash)) if hash.is_empty() => return Ok(None),
        Some(serde_json::Value::String(_)) => {}
        Some(other) => return Err(format!("hash must be a string, found {}", other)),
    }

    let descriptor: CacheDescriptor = serde_json::from_value(value).map_err(|e| e.to_string())?;
    Ok(Some(descriptor))
}

fn collect_json_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        CacheError::Other(format!("failed to read directory {}: {}", dir.display(), e))
    })?;

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_json_files(&path, out)?;
        } else if file_type.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            out.push(path);
        }
    }
    Ok(())
}
