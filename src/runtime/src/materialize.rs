//! Cache payload materialization.
//!
//! Streams a gzip-compressed tar and writes the entries found under a fixed
//! prefix into a destination directory. This knows nothing about image
//! variants; the extractors hand it a layer stream.

use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use kcache_core::error::{CacheError, Result};
use tar::{Archive, EntryType};

/// Counts of what a materialization wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializeReport {
    /// Regular files written
    pub files: usize,
    /// Directories created
    pub dirs: usize,
    /// Entries under the prefix that were skipped (links, devices, unsafe paths)
    pub skipped: usize,
}

/// Extract every entry under `prefix` from a tar.gz stream into `dest`.
///
/// The prefix is stripped from entry paths and the entry equal to the prefix
/// itself is skipped. Directories and regular files keep their recorded mode;
/// other entry types are logged and skipped. The first create or write
/// failure aborts extraction and leaves partial output in place.
///
/// # Errors
///
/// Returns error if:
/// - The stream is not gzip or not a tar archive
/// - A directory or file cannot be created or written
pub fn materialize<R: Read>(reader: R, prefix: &str, dest: &Path) -> Result<MaterializeReport> {
    let prefix_path = normalize_entry_path(Path::new(prefix));
    let mut report = MaterializeReport::default();

    std::fs::create_dir_all(dest).map_err(|e| {
        io_error(e, format!("failed to create target directory {}", dest.display()))
    })?;

    let mut archive = Archive::new(GzDecoder::new(reader));
    let entries = archive
        .entries()
        .map_err(|e| CacheError::Parse(format!("failed to parse layer as tar.gz: {}", e)))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| CacheError::Parse(format!("error reading tar archive: {}", e)))?;

        let raw_path = entry
            .path()
            .map_err(|e| CacheError::Parse(format!("invalid entry path: {}", e)))?
            .into_owned();
        let path = normalize_entry_path(&raw_path);

        // Outside the cache directory
        let Ok(relative) = path.strip_prefix(&prefix_path) else {
            continue;
        };
        // The cache directory marker itself
        if relative.as_os_str().is_empty() {
            continue;
        }
        if !is_contained(relative) {
            tracing::warn!(entry = %raw_path.display(), "Skipping entry escaping the cache root");
            report.skipped += 1;
            continue;
        }

        let target = dest.join(relative);
        let mode = match entry.header().mode() {
            Ok(mode) => Some(mode),
            Err(e) => {
                tracing::warn!(
                    entry = %raw_path.display(),
                    error = %e,
                    "Unreadable entry mode, keeping default permissions"
                );
                None
            }
        };

        match entry.header().entry_type() {
            EntryType::Directory => {
                std::fs::create_dir_all(&target).map_err(|e| {
                    io_error(e, format!("failed to create directory {}", target.display()))
                })?;
                set_mode(&target, mode)?;
                report.dirs += 1;
            }
            EntryType::Regular | EntryType::Continuous => {
                write_file(&target, &mut entry, mode)?;
                report.files += 1;
            }
            other => {
                tracing::warn!(
                    entry = %raw_path.display(),
                    kind = ?other,
                    "Skipping unsupported entry type"
                );
                report.skipped += 1;
            }
        }
    }

    tracing::debug!(
        target = %dest.display(),
        files = report.files,
        dirs = report.dirs,
        skipped = report.skipped,
        "Materialized cache payload"
    );

    Ok(report)
}

/// Copy one file's content from the archive to disk, then apply its mode.
fn write_file(path: &Path, content: &mut impl Read, mode: Option<u32>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            io_error(e, format!("failed to create parent directories for {}", path.display()))
        })?;
    }

    let mut out = File::create(path).map_err(|e| {
        io_error(e, format!("failed to create file {}", path.display()))
    })?;
    std::io::copy(content, &mut out).map_err(|e| {
        io_error(e, format!("failed to copy content to file {}", path.display()))
    })?;

    set_mode(path, mode)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: Option<u32>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let Some(mode) = mode else {
        return Ok(());
    };
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777)).map_err(|e| {
        io_error(e, format!("failed to set file permissions for {}", path.display()))
    })
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: Option<u32>) -> Result<()> {
    Ok(())
}

/// An I/O failure with the path it happened on.
fn io_error(e: std::io::Error, context: String) -> CacheError {
    CacheError::Io(std::io::Error::new(e.kind(), format!("{}: {}", context, e)))
}

/// Drop `.` components so `./io.triton.cache/x` and `io.triton.cache/x` agree.
fn normalize_entry_path(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// A relative path with no root and no `..` stays inside its base.
fn is_contained(relative: &Path) -> bool {
    relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
}
