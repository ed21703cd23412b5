//! Cache metadata carried in OCI image labels.
//!
//! Labels let a compatibility check run against a remote image without
//! pulling its layers. Keys live in the `cache.triton.image/` namespace.
//!
//! # Label Schema
//!
//! - `cache.triton.image/variant` - `compat` (one record) or `multi`
//! - `cache.triton.image/entry-count` - number of records
//!
//! ## compat
//! - `cache.triton.image/hash`
//! - `cache.triton.image/backend`
//! - `cache.triton.image/arch`
//! - `cache.triton.image/warp-size`
//! - `cache.triton.image/ptx-version` (optional)
//!
//! ## multi
//! - `cache.triton.image/metadata` - JSON array of `{hash, backend, arch, warp_size, ptx_version}`
//!
//! # Example
//!
//! ```dockerfile
//! LABEL cache.triton.image/variant="compat"
//! LABEL cache.triton.image/hash="c8f5e1b0..."
//! LABEL cache.triton.image/backend="cuda"
//! LABEL cache.triton.image/arch="90"
//! LABEL cache.triton.image/warp-size="32"
//! LABEL cache.triton.image/ptx-version="83"
//! LABEL cache.triton.image/entry-count="1"
//! ```

use std::collections::{BTreeMap, HashMap};

use kcache_core::descriptor::{Arch, CacheDescriptor, CacheSummary};
use kcache_core::error::{CacheError, Result};

pub const LABEL_VARIANT: &str = "cache.triton.image/variant";
pub const LABEL_HASH: &str = "cache.triton.image/hash";
pub const LABEL_BACKEND: &str = "cache.triton.image/backend";
pub const LABEL_ARCH: &str = "cache.triton.image/arch";
pub const LABEL_WARP_SIZE: &str = "cache.triton.image/warp-size";
pub const LABEL_PTX_VERSION: &str = "cache.triton.image/ptx-version";
pub const LABEL_ENTRY_COUNT: &str = "cache.triton.image/entry-count";
pub const LABEL_METADATA: &str = "cache.triton.image/metadata";
pub const LABEL_TITLE: &str = "org.opencontainers.image.title";

/// Discriminator stored under [`LABEL_VARIANT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelVariant {
    /// Single record, fields flattened into individual labels
    Compat,
    /// Several records, JSON-encoded under [`LABEL_METADATA`]
    Multi,
}

impl LabelVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            LabelVariant::Compat => "compat",
            LabelVariant::Multi => "multi",
        }
    }
}

impl std::str::FromStr for LabelVariant {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "compat" => Ok(LabelVariant::Compat),
            "multi" => Ok(LabelVariant::Multi),
            other => Err(CacheError::Parse(format!(
                "unknown {} label value '{}'",
                LABEL_VARIANT, other
            ))),
        }
    }
}

/// Cache records as stored in image labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLabels {
    pub variant: LabelVariant,
    pub entries: Vec<CacheSummary>,
}

impl CacheLabels {
    /// Labels for a set of descriptors: `compat` for one, `multi` for several.
    pub fn from_records(records: &[CacheDescriptor]) -> Result<Self> {
        Self::from_summaries(records.iter().map(CacheSummary::from).collect())
    }

    pub fn from_summaries(entries: Vec<CacheSummary>) -> Result<Self> {
        let variant = match entries.len() {
            0 => {
                return Err(CacheError::InvalidArgument(
                    "at least one cache record is required".to_string(),
                ))
            }
            1 => LabelVariant::Compat,
            _ => LabelVariant::Multi,
        };
        Ok(Self { variant, entries })
    }

    /// Render as label key/value pairs.
    pub fn to_map(&self) -> Result<BTreeMap<String, String>> {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_VARIANT.to_string(), self.variant.as_str().to_string());
        labels.insert(LABEL_ENTRY_COUNT.to_string(), self.entries.len().to_string());

        match self.variant {
            LabelVariant::Compat => {
                let entry = self.entries.first().ok_or_else(|| {
                    CacheError::InvalidArgument("compat labels need one record".to_string())
                })?;
                labels.insert(LABEL_HASH.to_string(), entry.hash.clone());
                labels.insert(LABEL_BACKEND.to_string(), entry.backend.clone());
                labels.insert(LABEL_ARCH.to_string(), entry.arch.to_string());
                labels.insert(LABEL_WARP_SIZE.to_string(), entry.warp_size.to_string());
                if let Some(ptx) = entry.ptx_version.filter(|v| *v != 0) {
                    labels.insert(LABEL_PTX_VERSION.to_string(), ptx.to_string());
                }
            }
            LabelVariant::Multi => {
                labels.insert(LABEL_METADATA.to_string(), encode_metadata(&self.entries)?);
            }
        }

        Ok(labels)
    }

    /// Parse cache labels.
    ///
    /// Returns `Ok(None)` when the labels carry no cache metadata at all. A
    /// hash label without a variant label is read as `compat`.
    pub fn from_labels(labels: &HashMap<String, String>) -> Result<Option<Self>> {
        let variant = match labels.get(LABEL_VARIANT) {
            Some(v) => v.parse()?,
            None if labels.contains_key(LABEL_HASH) => LabelVariant::Compat,
            None => return Ok(None),
        };

        let entries = match variant {
            LabelVariant::Compat => vec![compat_entry(labels)?],
            LabelVariant::Multi => {
                let raw = required(labels, LABEL_METADATA)?;
                decode_metadata(raw)?
            }
        };

        if let Some(count) = labels.get(LABEL_ENTRY_COUNT) {
            if count.trim().parse::<usize>().ok() != Some(entries.len()) {
                tracing::warn!(
                    declared = %count,
                    decoded = entries.len(),
                    "Entry count label disagrees with decoded records"
                );
            }
        }

        Ok(Some(Self { variant, entries }))
    }
}

fn compat_entry(labels: &HashMap<String, String>) -> Result<CacheSummary> {
    let warp_size = required(labels, LABEL_WARP_SIZE)?;
    let warp_size = warp_size.trim().parse::<u32>().map_err(|e| {
        CacheError::Parse(format!(
            "invalid {} '{}': {}",
            LABEL_WARP_SIZE, warp_size, e
        ))
    })?;

    let ptx_version = match labels.get(LABEL_PTX_VERSION).map(|v| v.trim()) {
        None | Some("") => None,
        Some(v) => {
            let n = v.parse::<u32>().map_err(|e| {
                CacheError::Parse(format!("invalid {} '{}': {}", LABEL_PTX_VERSION, v, e))
            })?;
            (n != 0).then_some(n)
        }
    };

    Ok(CacheSummary {
        hash: required(labels, LABEL_HASH)?.to_string(),
        backend: required(labels, LABEL_BACKEND)?.to_string(),
        arch: Arch::new(required(labels, LABEL_ARCH)?),
        warp_size,
        ptx_version,
    })
}

fn required<'a>(labels: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    labels
        .get(key)
        .map(|s| s.as_str())
        .ok_or_else(|| CacheError::Parse(format!("missing label {}", key)))
}

/// Encode summaries as the JSON array stored in [`LABEL_METADATA`].
pub fn encode_metadata(entries: &[CacheSummary]) -> Result<String> {
    Ok(serde_json::to_string(entries)?)
}

/// Decode the JSON array stored in [`LABEL_METADATA`].
///
/// `arch` may be a string or a number; a zero `ptx_version` means "none".
pub fn decode_metadata(raw: &str) -> Result<Vec<CacheSummary>> {
    let mut entries: Vec<CacheSummary> = serde_json::from_str(raw)
        .map_err(|e| CacheError::Parse(format!("invalid {} label: {}", LABEL_METADATA, e)))?;
    for entry in &mut entries {
        if entry.ptx_version == Some(0) {
            entry.ptx_version = None;
        }
    }
    Ok(entries)
}
