use thiserror::Error;

use crate::variant::ImageVariant;

/// One rejected image-format hypothesis collected by the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantAttempt {
    /// Variant that was tried
    pub variant: ImageVariant,
    /// Why it was rejected
    pub reason: String,
}

impl std::fmt::Display for VariantAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "could not parse as {} variant: {}", self.variant, self.reason)
    }
}

/// kcache error types
#[derive(Error, Debug)]
pub enum CacheError {
    /// An extractor's preconditions (layer count, media type) were not met
    #[error("Not a {variant}-variant image: {reason}")]
    FormatMismatch {
        variant: ImageVariant,
        reason: String,
    },

    /// The variant matched but its payload could not be read
    #[error("Corrupt {variant} payload: {message}")]
    CorruptPayload {
        variant: ImageVariant,
        message: String,
    },

    /// Every image-format hypothesis was rejected
    #[error("{}", unrecognized_message(.manifest_error, .attempts))]
    UnrecognizedImage {
        manifest_error: Option<String>,
        attempts: Vec<VariantAttempt>,
    },

    /// Malformed descriptor or label content
    #[error("Parse error: {0}")]
    Parse(String),

    /// No accelerator satisfies the cache
    #[error("Incompatible cache: {0}")]
    Incompatible(String),

    /// Caller passed an argument the operation cannot work with
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// External tool missing or failed
    #[error("Tool error: {tool} - {message}")]
    Tool { tool: String, message: String },

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    Registry { registry: String, message: String },

    /// OCI image error
    #[error("OCI image error: {0}")]
    OciImage(String),

    /// Accelerator probe error
    #[error("Probe error: {0}")]
    Probe(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CacheError {
    /// Whether this error only says "wrong variant" and the next variant may be tried.
    pub fn is_format_mismatch(&self) -> bool {
        matches!(self, CacheError::FormatMismatch { .. })
    }

    /// Whether this error is the "no compatible device" business outcome.
    pub fn is_incompatible(&self) -> bool {
        matches!(self, CacheError::Incompatible(_))
    }

    /// Shorthand for a format mismatch.
    pub fn mismatch(variant: ImageVariant, reason: impl Into<String>) -> Self {
        CacheError::FormatMismatch {
            variant,
            reason: reason.into(),
        }
    }
}

fn unrecognized_message(manifest_error: &Option<String>, attempts: &[VariantAttempt]) -> String {
    let mut parts = Vec::new();
    if let Some(err) = manifest_error {
        parts.push(format!("failed to fetch manifest: {}", err));
    }
    parts.extend(attempts.iter().map(|a| a.to_string()));
    format!(
        "the given image is in invalid format as an OCI image: {}",
        parts.join("; ")
    )
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

/// Result type alias for kcache operations
pub type Result<T> = std::result::Result<T, CacheError>;
