//! kcache core - foundational types and abstractions.
//!
//! Error taxonomy, process configuration and the data model shared by the
//! runtime and the CLI: cache descriptors, accelerator descriptors and the
//! recognized image variants.

pub mod accelerator;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod variant;

// Re-export commonly used types
pub use accelerator::AcceleratorDescriptor;
pub use config::{KcacheConfig, LogLevel, MatchPolicy, RegistryCredentials};
pub use descriptor::{Arch, CacheDescriptor, CacheSummary, CacheTarget};
pub use error::{CacheError, Result, VariantAttempt};
pub use variant::ImageVariant;

/// kcache version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
