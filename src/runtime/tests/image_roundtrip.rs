//! End-to-end tests: package a cache directory, read it back through the
//! resolver, and compare with the source tree.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use kcache_core::error::CacheError;
use kcache_core::variant::{ImageVariant, CACHE_CONTENT_LAYER, OCI_MANIFEST};
use kcache_core::CacheDescriptor;
use kcache_runtime::oci::labels::{LabelVariant, LABEL_ENTRY_COUNT, LABEL_TITLE};
use kcache_runtime::{
    assemble, find_descriptors, CacheLabels, FormatResolver, ImageHandle, OciLayoutImage,
    OciLayoutWriter, Payload,
};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

fn write_descriptor(dir: &Path, hash: &str, arch: &str, ptx: Option<u32>) {
    let kernel_dir = dir.join(hash);
    fs::create_dir_all(&kernel_dir).unwrap();
    let mut descriptor = serde_json::json!({
        "hash": hash,
        "target": {"backend": "cuda", "arch": arch, "warp_size": 32},
        "num_warps": 4,
        "name": "add_kernel"
    });
    if let Some(ptx) = ptx {
        descriptor["ptx_version"] = serde_json::json!(ptx);
    }
    fs::write(kernel_dir.join("add_kernel.json"), descriptor.to_string()).unwrap();
    fs::write(kernel_dir.join("add_kernel.cubin"), format!("cubin-{}", hash)).unwrap();
    // Group files carry no hash and are not entries
    fs::write(
        kernel_dir.join("__grp__add_kernel.json"),
        r#"{"child_paths": {}}"#,
    )
    .unwrap();
}

fn source_cache(root: &Path) -> PathBuf {
    let dir = root.join("source");
    write_descriptor(&dir, "aaa111", "90", Some(84));
    write_descriptor(&dir, "bbb222", "80", None);
    dir
}

fn records(dir: &Path) -> Vec<CacheDescriptor> {
    find_descriptors(dir)
        .unwrap()
        .into_iter()
        .map(|located| located.descriptor)
        .collect()
}

fn build_layout(root: &Path, variant: ImageVariant) -> (PathBuf, Vec<CacheDescriptor>) {
    let source = source_cache(root);
    let records = records(&source);
    let description = assemble(&records, &source, &root.join("context"), "kernels").unwrap();
    let layout = root.join(format!("layout-{}", variant));
    OciLayoutWriter::new(&layout, variant)
        .write(&description, "kernels:latest")
        .unwrap();
    (layout, records)
}

/// Relative path -> content of every regular file under `dir`.
fn snapshot(dir: &Path) -> BTreeMap<String, Vec<u8>> {
    fn walk(base: &Path, dir: &Path, out: &mut BTreeMap<String, Vec<u8>>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(base, &path, out);
            } else {
                let rel = path.strip_prefix(base).unwrap().to_string_lossy().to_string();
                out.insert(rel, fs::read(&path).unwrap());
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(dir, dir, &mut out);
    out
}

#[test]
fn test_tree_variants_reproduce_source_tree() {
    for variant in [ImageVariant::DockerLegacyLayer, ImageVariant::OciStandardLayer] {
        let temp_dir = TempDir::new().unwrap();
        let (layout, _) = build_layout(temp_dir.path(), variant);
        let cache_root = temp_dir.path().join("cache-root");

        let image = OciLayoutImage::from_path(&layout).unwrap();
        let outcome = FormatResolver::new(&cache_root).resolve(&image).unwrap();

        assert_eq!(outcome.variant, variant);
        assert!(matches!(outcome.payload, Payload::Directory { .. }));
        assert_eq!(
            snapshot(&cache_root),
            snapshot(&temp_dir.path().join("source")),
            "variant {}",
            variant
        );
    }
}

#[test]
fn test_artifact_variant_returns_layer_blob() {
    let temp_dir = TempDir::new().unwrap();
    let (layout, _) = build_layout(temp_dir.path(), ImageVariant::OciArtifactLayer);
    let cache_root = temp_dir.path().join("cache-root");

    let image = OciLayoutImage::from_path(&layout).unwrap();
    let outcome = FormatResolver::new(&cache_root).resolve(&image).unwrap();

    assert_eq!(outcome.variant, ImageVariant::OciArtifactLayer);
    let Payload::Blob { digest, bytes } = outcome.payload else {
        panic!("artifact variant must yield a blob");
    };
    assert_eq!(digest, format!("sha256:{}", hex::encode(Sha256::digest(&bytes))));

    // The blob is the gzip tar of the cache tree, stored verbatim
    let mut archive = tar::Archive::new(GzDecoder::new(bytes.as_slice()));
    let paths: Vec<String> = archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
        .collect();
    assert!(paths.contains(&"io.triton.cache/aaa111/add_kernel.cubin".to_string()));

    // Nothing was written to the cache root
    assert!(!cache_root.exists() || fs::read_dir(&cache_root).unwrap().count() == 0);
}

/// Relative path -> (content, permission bits) of every entry under `dir`.
fn snapshot_with_modes(dir: &Path) -> BTreeMap<String, (Vec<u8>, u32)> {
    fn mode(path: &Path) -> u32 {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::metadata(path).unwrap().permissions().mode() & 0o7777
        }
        #[cfg(not(unix))]
        {
            let _ = path;
            0
        }
    }
    fn walk(base: &Path, dir: &Path, out: &mut BTreeMap<String, (Vec<u8>, u32)>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            let rel = path.strip_prefix(base).unwrap().to_string_lossy().to_string();
            if path.is_dir() {
                out.insert(format!("{}/", rel), (Vec::new(), mode(&path)));
                walk(base, &path, out);
            } else {
                out.insert(rel, (fs::read(&path).unwrap(), mode(&path)));
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(dir, dir, &mut out);
    out
}

#[test]
fn test_extraction_into_fresh_roots_is_deterministic() {
    let temp_dir = TempDir::new().unwrap();
    let (layout, _) = build_layout(temp_dir.path(), ImageVariant::OciStandardLayer);
    let image = OciLayoutImage::from_path(&layout).unwrap();

    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    FormatResolver::new(first.path()).resolve(&image).unwrap();
    FormatResolver::new(second.path()).resolve(&image).unwrap();

    let first = snapshot_with_modes(first.path());
    assert!(first.contains_key("aaa111/add_kernel.cubin"));
    assert_eq!(first, snapshot_with_modes(second.path()));
}

#[test]
fn test_labels_round_trip_through_image_config() {
    let temp_dir = TempDir::new().unwrap();
    let (layout, records) = build_layout(temp_dir.path(), ImageVariant::OciStandardLayer);

    let image = OciLayoutImage::from_path(&layout).unwrap();
    let labels = image.labels().unwrap();
    let decoded = CacheLabels::from_labels(&labels).unwrap().unwrap();

    assert_eq!(decoded, CacheLabels::from_records(&records).unwrap());
    assert_eq!(decoded.variant, LabelVariant::Multi);
    assert_eq!(labels.get(LABEL_ENTRY_COUNT), Some(&"2".to_string()));
    assert_eq!(labels.get(LABEL_TITLE), Some(&"kernels".to_string()));
    assert_eq!(decoded.entries[1].ptx_version, None);
}

#[test]
fn test_single_record_uses_compat_labels() {
    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("source");
    write_descriptor(&source, "ccc333", "90", Some(84));
    let records = records(&source);

    let description = assemble(&records, &source, &temp_dir.path().join("ctx"), "k").unwrap();
    let layout = temp_dir.path().join("layout");
    OciLayoutWriter::new(&layout, ImageVariant::OciStandardLayer)
        .write(&description, "k")
        .unwrap();

    let image = OciLayoutImage::from_path(&layout).unwrap();
    let decoded = CacheLabels::from_labels(&image.labels().unwrap())
        .unwrap()
        .unwrap();

    assert_eq!(decoded.variant, LabelVariant::Compat);
    assert_eq!(decoded.entries[0].hash, "ccc333");
    assert_eq!(decoded.entries[0].ptx_version, Some(84));
}

/// A hand-written OCI layout whose two layers both carry the artifact media type.
fn write_two_layer_artifact(path: &Path) {
    let blobs = path.join("blobs/sha256");
    fs::create_dir_all(&blobs).unwrap();
    fs::write(path.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();

    let put = |bytes: &[u8]| {
        let digest = hex::encode(Sha256::digest(bytes));
        fs::write(blobs.join(&digest), bytes).unwrap();
        (format!("sha256:{}", digest), bytes.len())
    };

    let (config_digest, config_size) = put(br#"{"architecture":"amd64","os":"linux"}"#);
    let (first, first_size) = put(b"first");
    let (second, second_size) = put(b"second");
    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": OCI_MANIFEST,
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": config_digest,
            "size": config_size
        },
        "layers": [
            {"mediaType": CACHE_CONTENT_LAYER, "digest": first, "size": first_size},
            {"mediaType": CACHE_CONTENT_LAYER, "digest": second, "size": second_size}
        ]
    });
    let (manifest_digest, manifest_size) = put(&serde_json::to_vec(&manifest).unwrap());
    let index = serde_json::json!({
        "schemaVersion": 2,
        "manifests": [{
            "mediaType": OCI_MANIFEST,
            "digest": manifest_digest,
            "size": manifest_size
        }]
    });
    fs::write(path.join("index.json"), index.to_string()).unwrap();
}

#[test]
fn test_two_layer_artifact_is_unrecognized() {
    let temp_dir = TempDir::new().unwrap();
    let layout = temp_dir.path().join("layout");
    write_two_layer_artifact(&layout);
    let cache_root = temp_dir.path().join("cache-root");

    let image = OciLayoutImage::from_path(&layout).unwrap();
    let err = FormatResolver::new(&cache_root).resolve(&image).unwrap_err();

    let CacheError::UnrecognizedImage {
        manifest_error,
        attempts,
    } = err
    else {
        panic!("expected UnrecognizedImage");
    };
    assert_eq!(manifest_error, None);
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].variant, ImageVariant::OciStandardLayer);
    assert_eq!(attempts[1].variant, ImageVariant::OciArtifactLayer);
    assert!(attempts[1].reason.contains("found 2"));
    assert!(!cache_root.exists());
}

#[cfg(unix)]
#[test]
fn test_executable_mode_survives_round_trip() {
    use std::os::unix::fs::PermissionsExt;

    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("source");
    write_descriptor(&source, "ddd444", "90", None);
    let launcher = source.join("ddd444/launcher.so");
    fs::write(&launcher, b"\x7fELF").unwrap();
    fs::set_permissions(&launcher, fs::Permissions::from_mode(0o755)).unwrap();

    let description =
        assemble(&records(&source), &source, &temp_dir.path().join("ctx"), "k").unwrap();
    let layout = temp_dir.path().join("layout");
    OciLayoutWriter::new(&layout, ImageVariant::OciStandardLayer)
        .write(&description, "k")
        .unwrap();
    let cache_root = temp_dir.path().join("cache-root");
    FormatResolver::new(&cache_root)
        .resolve(&OciLayoutImage::from_path(&layout).unwrap())
        .unwrap();

    let mode = fs::metadata(cache_root.join("ddd444/launcher.so"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o755);
}
