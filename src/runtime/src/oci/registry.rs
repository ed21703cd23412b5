//! OCI registry client for pulling cache images.
//!
//! Uses the `oci-distribution` crate to talk to container registries
//! (Quay, GHCR, Docker Hub, ...). A full pull writes an OCI image layout;
//! a label pull fetches only the manifest and config.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use kcache_core::config::RegistryCredentials;
use kcache_core::error::{CacheError, Result};
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{ImageIndexEntry, OciDescriptor};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};

use super::image::{digest_hex, labels_from_config};

/// Registry auth for `credentials`, anonymous without them.
fn registry_auth(credentials: Option<&RegistryCredentials>) -> RegistryAuth {
    match credentials {
        Some(c) => RegistryAuth::Basic(c.username.clone(), c.token.clone()),
        None => RegistryAuth::Anonymous,
    }
}

/// Parse an image reference (`quay.io/org/kernels:v1`, `kernels@sha256:...`).
///
/// Short names resolve against Docker Hub and default to the `latest` tag.
pub fn parse_reference(reference: &str) -> Result<Reference> {
    reference.parse::<Reference>().map_err(|e| {
        CacheError::InvalidArgument(format!("Invalid image reference '{}': {}", reference, e))
    })
}

/// Pulls cache images from container registries.
pub struct RegistryPuller {
    client: Client,
    auth: RegistryAuth,
}

impl Default for RegistryPuller {
    fn default() -> Self {
        Self::new(None)
    }
}

impl RegistryPuller {
    /// Puller logging in with `credentials`, or pulling anonymously.
    pub fn new(credentials: Option<&RegistryCredentials>) -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            platform_resolver: Some(Box::new(linux_platform_resolver)),
            ..Default::default()
        };
        let client = Client::new(config);

        Self {
            client,
            auth: registry_auth(credentials),
        }
    }

    /// Pull an image and write it as an OCI image layout to `target_dir`.
    ///
    /// The manifest is stored as served, so a Docker v2 manifest keeps its
    /// media type and resolves as the Docker legacy variant.
    pub async fn pull(&self, reference: &Reference, target_dir: &Path) -> Result<PathBuf> {
        let registry = reference.registry().to_string();

        tracing::info!(
            reference = %reference,
            target = %target_dir.display(),
            "Pulling image from registry"
        );

        let blobs_dir = target_dir.join("blobs").join("sha256");
        std::fs::create_dir_all(&blobs_dir).map_err(|e| CacheError::Registry {
            registry: registry.clone(),
            message: format!("Failed to create blobs directory: {}", e),
        })?;

        let (manifest, manifest_digest) = self
            .client
            .pull_image_manifest(reference, &self.auth)
            .await
            .map_err(|e| CacheError::Registry {
                registry: registry.clone(),
                message: format!("Failed to pull manifest: {}", e),
            })?;

        let manifest_json = serde_json::to_vec(&manifest)?;
        write_blob(&blobs_dir, &manifest_digest, &manifest_json, &registry)?;

        self.pull_blob_to(reference, &manifest.config, &blobs_dir, &registry)
            .await?;
        for layer in &manifest.layers {
            tracing::debug!(
                digest = %layer.digest,
                size = layer.size,
                media_type = %layer.media_type,
                "Pulling layer"
            );
            self.pull_blob_to(reference, layer, &blobs_dir, &registry)
                .await?;
        }

        std::fs::write(
            target_dir.join("oci-layout"),
            r#"{"imageLayoutVersion":"1.0.0"}"#,
        )
        .map_err(|e| CacheError::Registry {
            registry: registry.clone(),
            message: format!("Failed to write oci-layout: {}", e),
        })?;

        let manifest_media_type = manifest
            .media_type
            .clone()
            .unwrap_or_else(|| kcache_core::variant::OCI_MANIFEST.to_string());
        let index = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [{
                "mediaType": manifest_media_type,
                "digest": manifest_digest,
                "size": manifest_json.len()
            }]
        });
        std::fs::write(
            target_dir.join("index.json"),
            serde_json::to_string_pretty(&index)?,
        )
        .map_err(|e| CacheError::Registry {
            registry: registry.clone(),
            message: format!("Failed to write index.json: {}", e),
        })?;

        tracing::info!(
            reference = %reference,
            digest = %manifest_digest,
            "Image pulled successfully"
        );

        Ok(target_dir.to_path_buf())
    }

    /// Fetch the image's labels without pulling any layer.
    pub async fn pull_labels(&self, reference: &Reference) -> Result<HashMap<String, String>> {
        let (_manifest, _digest, config) = self
            .client
            .pull_manifest_and_config(reference, &self.auth)
            .await
            .map_err(|e| CacheError::Registry {
                registry: reference.registry().to_string(),
                message: format!("Failed to pull manifest and config: {}", e),
            })?;

        Ok(labels_from_config(config.as_bytes()))
    }

    async fn pull_blob_to(
        &self,
        reference: &Reference,
        descriptor: &OciDescriptor,
        blobs_dir: &Path,
        registry: &str,
    ) -> Result<()> {
        let mut data: Vec<u8> = Vec::new();
        self.client
            .pull_blob(reference, descriptor, &mut data)
            .await
            .map_err(|e| CacheError::Registry {
                registry: registry.to_string(),
                message: format!("Failed to pull blob {}: {}", descriptor.digest, e),
            })?;
        write_blob(blobs_dir, &descriptor.digest, &data, registry)
    }
}

fn write_blob(blobs_dir: &Path, digest: &str, data: &[u8], registry: &str) -> Result<()> {
    let hex = digest_hex(digest)?;
    std::fs::write(blobs_dir.join(hex), data).map_err(|e| CacheError::Registry {
        registry: registry.to_string(),
        message: format!("Failed to write blob {}: {}", digest, e),
    })
}

/// Platform resolver that selects linux images matching the host architecture.
fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };

    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .is_some_and(|p| p.os == "linux" && p.architecture == arch)
        })
        .or_else(|| manifests.first())
        .map(|entry| entry.digest.clone())
}
