//! kcache runtime - kernel cache engine.
//!
//! Packages Triton kernel caches into OCI images, extracts them again from
//! whichever image shape they arrive in, and decides from metadata alone
//! whether a cache can run on the accelerators of this host.

#![allow(clippy::result_large_err)]

pub mod accelerator;
pub mod assembler;
pub mod command;
pub mod manager;
pub mod materialize;
pub mod matcher;
pub mod metadata;
pub mod oci;
pub mod source;

// Re-export common types
pub use accelerator::{probe_all, AcceleratorProbe, NvidiaSmiProbe, RocmSmiProbe, StaticProbe};
pub use assembler::{assemble, ImageDescription};
pub use manager::{CacheManager, ExtractReport};
pub use materialize::{materialize, MaterializeReport};
pub use matcher::{check_record, matches, MatchVerdict, MismatchField, RecordVerdict, Unsatisfied};
pub use metadata::{find_descriptors, find_first_descriptor, parse_descriptor_file, LocatedDescriptor};
pub use oci::{CacheLabels, FormatResolver, ImageHandle, OciLayoutImage, OciLayoutWriter};
pub use oci::{ExtractionOutcome, Payload};
pub use oci::{select_builder, BuildOutput, BuildTool, ImageBuilder, ToolBuilder};
pub use source::{ImageRef, ImageSource, SourceChain};

/// kcache runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
