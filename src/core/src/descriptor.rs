//! Kernel cache descriptors.
//!
//! Every compiled kernel in a Triton cache directory is accompanied by a JSON
//! descriptor. Only `hash` and `target` (plus `ptx_version` for CUDA) take
//! part in compatibility decisions; the remaining compile parameters are
//! carried through untouched.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Backend name of the CUDA family.
pub const CUDA_BACKEND: &str = "cuda";

/// Normalized architecture identifier.
///
/// Producers disagree on whether the architecture is a JSON string (`"gfx90a"`,
/// `"90"`) or a number (`90`). Both shapes deserialize to the same canonical
/// string so they compare equal. A fractional number keeps its decimal point
/// (`9.0` stays `"9.0"`), so it never matches the integer `9`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Arch(String);

impl Arch {
    /// Build from any string-ish value, normalizing it.
    pub fn new(raw: impl AsRef<str>) -> Self {
        Arch(raw.as_ref().trim().to_string())
    }

    /// Build from a numeric literal.
    pub fn from_number(n: i64) -> Self {
        Arch(n.to_string())
    }

    /// Canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Arch {
    fn from(s: &str) -> Self {
        Arch::new(s)
    }
}

impl From<String> for Arch {
    fn from(s: String) -> Self {
        Arch::new(s)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawArch {
    Text(String),
    Int(i64),
    Float(f64),
}

impl<'de> Deserialize<'de> for Arch {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match RawArch::deserialize(deserializer)? {
            RawArch::Text(s) => Arch::new(s),
            RawArch::Int(n) => Arch::from_number(n),
            RawArch::Float(f) if f.fract() == 0.0 => Arch(format!("{:.1}", f)),
            RawArch::Float(f) => Arch(f.to_string()),
        })
    }
}

impl Serialize for Arch {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Compilation target of a kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheTarget {
    /// Compute backend ("cuda", "hip", ...)
    #[serde(default)]
    pub backend: String,

    /// Architecture identifier, normalized
    #[serde(default)]
    pub arch: Arch,

    /// Warp or wavefront width
    #[serde(default)]
    pub warp_size: u32,
}

/// One compiled-kernel record as written by the compiler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheDescriptor {
    /// Content identifier; empty means "not a cache entry"
    #[serde(default)]
    pub hash: String,

    #[serde(default)]
    pub target: CacheTarget,

    #[serde(default)]
    pub num_warps: Option<u32>,

    #[serde(default)]
    pub num_ctas: Option<u32>,

    #[serde(default)]
    pub num_stages: Option<u32>,

    #[serde(default)]
    pub maxnreg: Option<u32>,

    #[serde(default)]
    pub cluster_dims: Option<Vec<u32>>,

    /// PTX ISA version; only meaningful for the CUDA backend
    #[serde(default)]
    pub ptx_version: Option<u32>,

    #[serde(default)]
    pub enable_fp_fusion: Option<bool>,

    #[serde(default)]
    pub supported_fp8_dtypes: Option<Vec<String>>,

    #[serde(default)]
    pub deprecated_fp8_dtypes: Option<Vec<String>>,

    #[serde(default)]
    pub default_dot_input_precision: Option<String>,

    #[serde(default)]
    pub allowed_dot_input_precisions: Option<Vec<String>>,

    #[serde(default)]
    pub max_num_imprecise_acc_default: Option<i64>,

    #[serde(default)]
    pub extern_libs: Option<Vec<Vec<String>>>,

    #[serde(default)]
    pub debug: Option<bool>,

    #[serde(default)]
    pub backend_name: Option<String>,

    /// Top-level arch some backends repeat outside `target`
    #[serde(default)]
    pub arch: Option<Arch>,

    #[serde(default)]
    pub sanitize_overflow: Option<bool>,

    /// Shared memory in bytes
    #[serde(default)]
    pub shared: Option<u64>,

    #[serde(default)]
    pub global_scratch_size: Option<u64>,

    #[serde(default)]
    pub global_scratch_align: Option<u64>,

    /// Kernel name
    #[serde(default)]
    pub name: Option<String>,

    /// Keys this version does not know about, preserved verbatim
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl CacheDescriptor {
    /// Whether this descriptor names a real cache entry.
    pub fn is_entry(&self) -> bool {
        !self.hash.is_empty()
    }

    /// Reduce to the fields that take part in matching.
    pub fn summary(&self) -> CacheSummary {
        CacheSummary::from(self)
    }
}

/// Compact form of a descriptor, as carried in image labels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheSummary {
    pub hash: String,
    pub backend: String,
    pub arch: Arch,
    pub warp_size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ptx_version: Option<u32>,
}

impl From<&CacheDescriptor> for CacheSummary {
    fn from(d: &CacheDescriptor) -> Self {
        CacheSummary {
            hash: d.hash.clone(),
            backend: d.target.backend.clone(),
            arch: d.target.arch.clone(),
            warp_size: d.target.warp_size,
            ptx_version: d.ptx_version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arch_from_number_and_string_compare_equal() {
        let from_num: CacheTarget =
            serde_json::from_str(r#"{"backend":"cuda","arch":90,"warp_size":32}"#).unwrap();
        let from_str: CacheTarget =
            serde_json::from_str(r#"{"backend":"cuda","arch":"90","warp_size":32}"#).unwrap();
        assert_eq!(from_num.arch, from_str.arch);
        assert_eq!(from_num.arch.as_str(), "90");
    }

    #[test]
    fn test_float_arch_keeps_decimal_form() {
        let whole: Arch = serde_json::from_str("9.0").unwrap();
        let fractional: Arch = serde_json::from_str("8.6").unwrap();

        assert_eq!(whole.as_str(), "9.0");
        assert_eq!(fractional.as_str(), "8.6");
        assert_ne!(whole, Arch::from_number(9));
    }

    #[test]
    fn test_arch_string_is_trimmed() {
        let arch: Arch = serde_json::from_str(r#"" gfx90a ""#).unwrap();
        assert_eq!(arch.as_str(), "gfx90a");
    }

    #[test]
    fn test_arch_serializes_as_string() {
        let arch = Arch::from_number(80);
        assert_eq!(serde_json::to_string(&arch).unwrap(), r#""80""#);
    }

    #[test]
    fn test_parse_full_descriptor() {
        let json = r#"{
            "hash": "3f2a9c",
            "target": {"backend": "cuda", "arch": 90, "warp_size": 32},
            "num_warps": 4,
            "num_ctas": 1,
            "num_stages": 3,
            "maxnreg": null,
            "cluster_dims": [1, 1, 1],
            "ptx_version": 82,
            "enable_fp_fusion": true,
            "supported_fp8_dtypes": ["fp8e5", "fp8e4nv"],
            "deprecated_fp8_dtypes": [],
            "default_dot_input_precision": "tf32",
            "allowed_dot_input_precisions": ["tf32", "ieee"],
            "max_num_imprecise_acc_default": 0,
            "extern_libs": [["libdevice", "/opt/libdevice.10.bc"]],
            "debug": false,
            "backend_name": "cuda",
            "sanitize_overflow": true,
            "shared": 16384,
            "global_scratch_size": 0,
            "global_scratch_align": 1,
            "name": "add_kernel",
            "launch_cooperative_grid": false
        }"#;
        let d: CacheDescriptor = serde_json::from_str(json).unwrap();
        assert!(d.is_entry());
        assert_eq!(d.target.backend, "cuda");
        assert_eq!(d.target.arch.as_str(), "90");
        assert_eq!(d.ptx_version, Some(82));
        assert_eq!(d.shared, Some(16384));
        assert_eq!(d.name.as_deref(), Some("add_kernel"));
        assert_eq!(
            d.extra.get("launch_cooperative_grid"),
            Some(&serde_json::Value::Bool(false))
        );
    }

    #[test]
    fn test_missing_hash_is_not_an_entry() {
        let d: CacheDescriptor = serde_json::from_str(r#"{"child_paths": {}}"#).unwrap();
        assert!(!d.is_entry());
    }

    #[test]
    fn test_summary_reduces_fields() {
        let d: CacheDescriptor = serde_json::from_str(
            r#"{"hash":"abc","target":{"backend":"hip","arch":"gfx942","warp_size":64},"num_warps":8}"#,
        )
        .unwrap();
        let s = d.summary();
        assert_eq!(
            s,
            CacheSummary {
                hash: "abc".to_string(),
                backend: "hip".to_string(),
                arch: Arch::new("gfx942"),
                warp_size: 64,
                ptx_version: None,
            }
        );
    }
}
