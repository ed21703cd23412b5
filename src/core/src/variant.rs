//! Physical layouts for embedding a kernel cache in an OCI image.

use serde::{Deserialize, Serialize};

/// Docker v2 image manifest media type.
pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Legacy Docker filesystem-diff layer (tar+gzip).
pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Docker image config media type.
pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";

/// OCI image manifest media type.
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// Standard OCI tar+gzip layer.
pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// OCI image config media type.
pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

/// Single-blob cache content layer used by the artifact variant.
pub const CACHE_CONTENT_LAYER: &str = "application/cache.triton.content.layer.v1+triton";

/// Directory inside the image that holds the cache tree.
pub const CACHE_DIR_NAME: &str = "io.triton.cache/";

/// The recognized image layouts.
///
/// Exactly one applies to a given image; detection inspects media types,
/// never a version field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageVariant {
    /// Last layer is a Docker `rootfs.diff.tar.gzip` containing `io.triton.cache/`
    DockerLegacyLayer,
    /// Last layer is an OCI `tar+gzip` layer containing `io.triton.cache/`
    OciStandardLayer,
    /// Single layer holding the raw cache blob
    OciArtifactLayer,
}

impl ImageVariant {
    /// All variants in resolution order.
    pub const ALL: [ImageVariant; 3] = [
        ImageVariant::DockerLegacyLayer,
        ImageVariant::OciStandardLayer,
        ImageVariant::OciArtifactLayer,
    ];

    /// Layer media type this variant requires.
    pub fn layer_media_type(&self) -> &'static str {
        match self {
            ImageVariant::DockerLegacyLayer => DOCKER_LAYER,
            ImageVariant::OciStandardLayer => OCI_LAYER_GZIP,
            ImageVariant::OciArtifactLayer => CACHE_CONTENT_LAYER,
        }
    }

    /// Manifest media type an image of this variant is written with.
    pub fn manifest_media_type(&self) -> &'static str {
        match self {
            ImageVariant::DockerLegacyLayer => DOCKER_MANIFEST_V2,
            _ => OCI_MANIFEST,
        }
    }

    /// Config media type an image of this variant is written with.
    pub fn config_media_type(&self) -> &'static str {
        match self {
            ImageVariant::DockerLegacyLayer => DOCKER_CONFIG,
            _ => OCI_CONFIG,
        }
    }

    /// Whether the payload is a directory tree (as opposed to one opaque blob).
    pub fn is_tree(&self) -> bool {
        !matches!(self, ImageVariant::OciArtifactLayer)
    }

    /// Short name used in diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageVariant::DockerLegacyLayer => "docker",
            ImageVariant::OciStandardLayer => "compat",
            ImageVariant::OciArtifactLayer => "oci",
        }
    }
}

impl std::fmt::Display for ImageVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ImageVariant {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "docker" => Ok(ImageVariant::DockerLegacyLayer),
            "compat" => Ok(ImageVariant::OciStandardLayer),
            "oci" => Ok(ImageVariant::OciArtifactLayer),
            other => Err(format!(
                "unknown image variant '{}' (expected docker, compat or oci)",
                other
            )),
        }
    }
}
