//! OCI image support for kernel caches.
//!
//! Reads cache images in any of the three supported shapes and writes them
//! back out:
//!
//! - image handles over OCI layouts and `docker save` archives
//! - variant extractors and the format resolver
//! - cache label encoding
//! - registry pulls
//! - image builders
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    OCI Image Layout                          │
//! │                                                              │
//! │  image/                                                      │
//! │  ├── oci-layout           (OCI layout marker)                │
//! │  ├── index.json           (Image index)                      │
//! │  └── blobs/                                                  │
//! │      └── sha256/                                             │
//! │          ├── <manifest>   (OCI or Docker v2 manifest)        │
//! │          ├── <config>     (config, cache labels)             │
//! │          └── <layer>      (io.triton.cache/ tree or blob)    │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod archive;
pub mod build;
pub mod image;
pub mod labels;
pub mod registry;
pub mod resolver;
pub mod variant;

pub use archive::{open_archive, DockerArchiveImage};
pub use build::{select_builder, BuildOutput, BuildTool, ImageBuilder, OciLayoutWriter, ToolBuilder};
pub use image::{ImageHandle, LayerDescriptor, OciLayoutImage};
pub use labels::{CacheLabels, LabelVariant};
pub use registry::RegistryPuller;
pub use resolver::FormatResolver;
pub use variant::{ExtractionOutcome, Payload, VariantExtractor, EXTRACTORS};
