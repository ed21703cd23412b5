//! Image sources.
//!
//! A source turns an image reference into an [`ImageHandle`]. References use
//! the transport prefixes understood by skopeo and podman:
//!
//! ```text
//! oci:/path/to/layout                 OCI image layout directory
//! docker-archive:/path/image.tar[:tag]  `docker save` tarball
//! quay.io/org/kernels:v1              local engine image, else registry
//! ```
//!
//! [`SourceChain`] tries every source that accepts the reference, in order,
//! and reports all failures when none succeeds.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use kcache_core::config::RegistryCredentials;
use kcache_core::error::{CacheError, Result};

use crate::command;
use crate::oci::archive::open_archive;
use crate::oci::image::{ImageHandle, OciLayoutImage};
use crate::oci::registry::{parse_reference, RegistryPuller};

const OCI_TRANSPORT: &str = "oci:";
const ARCHIVE_TRANSPORT: &str = "docker-archive:";

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    /// OCI image layout directory
    Layout(PathBuf),
    /// Image tarball, optionally selecting one tag inside it
    Archive { path: PathBuf, tag: Option<String> },
    /// Name resolved by a container engine or registry
    Named(String),
}

impl ImageRef {
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(CacheError::InvalidArgument(
                "image reference must not be empty".to_string(),
            ));
        }

        if let Some(path) = reference.strip_prefix(OCI_TRANSPORT) {
            return Ok(ImageRef::Layout(PathBuf::from(path)));
        }
        if let Some(rest) = reference.strip_prefix(ARCHIVE_TRANSPORT) {
            let (path, tag) = match rest.split_once(':') {
                Some((path, tag)) if !tag.is_empty() => (path, Some(tag.to_string())),
                _ => (rest.trim_end_matches(':'), None),
            };
            return Ok(ImageRef::Archive {
                path: PathBuf::from(path),
                tag,
            });
        }

        Ok(ImageRef::Named(reference.to_string()))
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageRef::Layout(path) => write!(f, "{}{}", OCI_TRANSPORT, path.display()),
            ImageRef::Archive { path, tag: None } => {
                write!(f, "{}{}", ARCHIVE_TRANSPORT, path.display())
            }
            ImageRef::Archive {
                path,
                tag: Some(tag),
            } => write!(f, "{}{}:{}", ARCHIVE_TRANSPORT, path.display(), tag),
            ImageRef::Named(name) => f.write_str(name),
        }
    }
}

impl std::str::FromStr for ImageRef {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        ImageRef::parse(s)
    }
}

/// Provides images for references it accepts.
#[async_trait]
pub trait ImageSource: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the source can run on this host.
    fn is_available(&self) -> bool;

    fn accepts(&self, reference: &ImageRef) -> bool;

    /// Materialize the image under `workspace` and open it.
    async fn fetch(&self, reference: &ImageRef, workspace: &Path)
        -> Result<Box<dyn ImageHandle>>;

    /// Read only the image labels.
    async fn fetch_labels(
        &self,
        reference: &ImageRef,
        workspace: &Path,
    ) -> Result<HashMap<String, String>>;
}

/// `oci:<dir>` references.
#[derive(Debug, Default, Clone)]
pub struct LayoutSource;

#[async_trait]
impl ImageSource for LayoutSource {
    fn name(&self) -> &str {
        "oci-layout"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn accepts(&self, reference: &ImageRef) -> bool {
        matches!(reference, ImageRef::Layout(_))
    }

    async fn fetch(
        &self,
        reference: &ImageRef,
        _workspace: &Path,
    ) -> Result<Box<dyn ImageHandle>> {
        match reference {
            ImageRef::Layout(path) => Ok(Box::new(OciLayoutImage::from_path(path)?)),
            other => Err(unsupported(self.name(), other)),
        }
    }

    async fn fetch_labels(
        &self,
        reference: &ImageRef,
        workspace: &Path,
    ) -> Result<HashMap<String, String>> {
        self.fetch(reference, workspace).await?.labels()
    }
}

/// `docker-archive:<file>[:tag]` references.
#[derive(Debug, Default, Clone)]
pub struct ArchiveSource;

#[async_trait]
impl ImageSource for ArchiveSource {
    fn name(&self) -> &str {
        "docker-archive"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn accepts(&self, reference: &ImageRef) -> bool {
        matches!(reference, ImageRef::Archive { .. })
    }

    async fn fetch(
        &self,
        reference: &ImageRef,
        workspace: &Path,
    ) -> Result<Box<dyn ImageHandle>> {
        match reference {
            ImageRef::Archive { path, tag } => {
                open_archive(path, &workspace.join("archive"), tag.as_deref())
            }
            other => Err(unsupported(self.name(), other)),
        }
    }

    async fn fetch_labels(
        &self,
        reference: &ImageRef,
        workspace: &Path,
    ) -> Result<HashMap<String, String>> {
        self.fetch(reference, workspace).await?.labels()
    }
}

/// Images held by a local docker or podman engine.
#[derive(Debug, Clone)]
pub struct EngineSource {
    program: String,
}

impl EngineSource {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn docker() -> Self {
        Self::new("docker")
    }

    pub fn podman() -> Self {
        Self::new("podman")
    }
}

#[async_trait]
impl ImageSource for EngineSource {
    fn name(&self) -> &str {
        &self.program
    }

    fn is_available(&self) -> bool {
        command::find_executable(&self.program).is_some()
    }

    fn accepts(&self, reference: &ImageRef) -> bool {
        matches!(reference, ImageRef::Named(_))
    }

    async fn fetch(
        &self,
        reference: &ImageRef,
        workspace: &Path,
    ) -> Result<Box<dyn ImageHandle>> {
        let ImageRef::Named(name) = reference else {
            return Err(unsupported(self.name(), reference));
        };

        // Fails fast when the engine does not have the image
        command::run(&self.program, ["image", "inspect", name.as_str()]).await?;

        std::fs::create_dir_all(workspace)?;
        let tarball = workspace.join("image.tar");
        let tarball_arg = tarball.to_string_lossy().into_owned();
        tracing::info!(engine = %self.program, image = %name, "Exporting image from engine");
        command::run(
            &self.program,
            ["save", "-o", tarball_arg.as_str(), name.as_str()],
        )
        .await?;

        open_archive(&tarball, &workspace.join("unpacked"), None)
    }

    async fn fetch_labels(
        &self,
        reference: &ImageRef,
        _workspace: &Path,
    ) -> Result<HashMap<String, String>> {
        let ImageRef::Named(name) = reference else {
            return Err(unsupported(self.name(), reference));
        };

        let stdout = command::run(
            &self.program,
            [
                "image",
                "inspect",
                "--format",
                "{{json .Config.Labels}}",
                name.as_str(),
            ],
        )
        .await?;
        parse_inspect_labels(&stdout)
    }
}

/// Parse the `{{json .Config.Labels}}` output of `image inspect`.
///
/// `null` (an image without labels) yields an empty map.
pub fn parse_inspect_labels(stdout: &[u8]) -> Result<HashMap<String, String>> {
    let labels: Option<HashMap<String, String>> = serde_json::from_slice(stdout)
        .map_err(|e| CacheError::Parse(format!("invalid image inspect output: {}", e)))?;
    Ok(labels.unwrap_or_default())
}

/// Images pulled straight from a registry.
pub struct RegistrySource {
    puller: RegistryPuller,
}

impl RegistrySource {
    pub fn new(credentials: Option<&RegistryCredentials>) -> Self {
        Self {
            puller: RegistryPuller::new(credentials),
        }
    }
}

impl Default for RegistrySource {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl ImageSource for RegistrySource {
    fn name(&self) -> &str {
        "registry"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn accepts(&self, reference: &ImageRef) -> bool {
        matches!(reference, ImageRef::Named(_))
    }

    async fn fetch(
        &self,
        reference: &ImageRef,
        workspace: &Path,
    ) -> Result<Box<dyn ImageHandle>> {
        let ImageRef::Named(name) = reference else {
            return Err(unsupported(self.name(), reference));
        };
        let parsed = parse_reference(name)?;
        let layout = self.puller.pull(&parsed, &workspace.join("layout")).await?;
        Ok(Box::new(OciLayoutImage::from_path(layout)?))
    }

    async fn fetch_labels(
        &self,
        reference: &ImageRef,
        _workspace: &Path,
    ) -> Result<HashMap<String, String>> {
        let ImageRef::Named(name) = reference else {
            return Err(unsupported(self.name(), reference));
        };
        self.puller.pull_labels(&parse_reference(name)?).await
    }
}

fn unsupported(source: &str, reference: &ImageRef) -> CacheError {
    CacheError::InvalidArgument(format!(
        "source {} cannot handle reference {}",
        source, reference
    ))
}

/// Ordered list of image sources.
pub struct SourceChain {
    sources: Vec<Box<dyn ImageSource>>,
}

impl Default for SourceChain {
    fn default() -> Self {
        Self::standard(None)
    }
}

impl SourceChain {
    pub fn new(sources: Vec<Box<dyn ImageSource>>) -> Self {
        Self { sources }
    }

    /// Explicit transports first, then local engines, then the registry.
    pub fn standard(registry: Option<&RegistryCredentials>) -> Self {
        Self::new(vec![
            Box::new(LayoutSource),
            Box::new(ArchiveSource),
            Box::new(EngineSource::docker()),
            Box::new(EngineSource::podman()),
            Box::new(RegistrySource::new(registry)),
        ])
    }

    /// Append a source at the end of the chain.
    pub fn push(&mut self, source: Box<dyn ImageSource>) {
        self.sources.push(source);
    }

    pub fn names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    fn candidates<'a>(
        &'a self,
        reference: &'a ImageRef,
    ) -> impl Iterator<Item = &'a Box<dyn ImageSource>> + 'a {
        self.sources
            .iter()
            .filter(move |s| s.accepts(reference))
            .filter(|s| {
                let available = s.is_available();
                if !available {
                    tracing::debug!(source = s.name(), "Image source not available, skipping");
                }
                available
            })
    }

    /// Fetch the image from the first source that succeeds.
    ///
    /// Each source works in its own subdirectory of `workspace`.
    pub async fn fetch(
        &self,
        reference: &ImageRef,
        workspace: &Path,
    ) -> Result<Box<dyn ImageHandle>> {
        let mut failures = Vec::new();
        for source in self.candidates(reference) {
            match source
                .fetch(reference, &workspace.join(source.name()))
                .await
            {
                Ok(image) => {
                    tracing::debug!(source = source.name(), reference = %reference, "Fetched image");
                    return Ok(image);
                }
                Err(e) => {
                    tracing::debug!(source = source.name(), error = %e, "Image source failed");
                    failures.push(format!("{}: {}", source.name(), e));
                }
            }
        }
        Err(exhausted(reference, failures))
    }

    /// Fetch the labels from the first source that succeeds.
    pub async fn fetch_labels(
        &self,
        reference: &ImageRef,
        workspace: &Path,
    ) -> Result<HashMap<String, String>> {
        let mut failures = Vec::new();
        for source in self.candidates(reference) {
            match source
                .fetch_labels(reference, &workspace.join(source.name()))
                .await
            {
                Ok(labels) => return Ok(labels),
                Err(e) => {
                    tracing::debug!(source = source.name(), error = %e, "Image source failed");
                    failures.push(format!("{}: {}", source.name(), e));
                }
            }
        }
        Err(exhausted(reference, failures))
    }
}

fn exhausted(reference: &ImageRef, failures: Vec<String>) -> CacheError {
    if failures.is_empty() {
        CacheError::OciImage(format!("no image source available for {}", reference))
    } else {
        CacheError::OciImage(format!(
            "no image source could provide {}: {}",
            reference,
            failures.join("; ")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::archive::tests::{plain_cache_tar, write_docker_archive};
    use crate::oci::image::tests::write_layout;
    use kcache_core::variant::{OCI_LAYER_GZIP, OCI_MANIFEST};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_parse_transports() {
        assert_eq!(
            ImageRef::parse("oci:/tmp/layout").unwrap(),
            ImageRef::Layout(PathBuf::from("/tmp/layout"))
        );
        assert_eq!(
            ImageRef::parse("docker-archive:/tmp/k.tar:kernels:v1").unwrap(),
            ImageRef::Archive {
                path: PathBuf::from("/tmp/k.tar"),
                tag: Some("kernels:v1".to_string()),
            }
        );
        assert_eq!(
            ImageRef::parse("docker-archive:/tmp/k.tar").unwrap(),
            ImageRef::Archive {
                path: PathBuf::from("/tmp/k.tar"),
                tag: None,
            }
        );
        assert_eq!(
            ImageRef::parse("quay.io/org/kernels:v1").unwrap(),
            ImageRef::Named("quay.io/org/kernels:v1".to_string())
        );
        assert!(ImageRef::parse("  ").is_err());
    }

    #[test]
    fn test_display_round_trips() {
        for raw in [
            "oci:/tmp/layout",
            "docker-archive:/tmp/k.tar:kernels:v1",
            "kernels:latest",
        ] {
            assert_eq!(ImageRef::parse(raw).unwrap().to_string(), raw);
        }
    }

    #[test]
    fn test_parse_inspect_labels() {
        let labels = parse_inspect_labels(br#"{"cache.triton.image/hash":"abc"}"#).unwrap();
        assert_eq!(labels.get("cache.triton.image/hash"), Some(&"abc".to_string()));
        assert!(parse_inspect_labels(b"null\n").unwrap().is_empty());
        assert!(parse_inspect_labels(b"not json").is_err());
    }

    #[tokio::test]
    async fn test_layout_source_fetch_and_labels() {
        let temp_dir = TempDir::new().unwrap();
        let layout = temp_dir.path().join("layout");
        write_layout(
            &layout,
            Some(OCI_MANIFEST),
            &[(OCI_LAYER_GZIP, vec![1, 2, 3])],
            &[("cache.triton.image/hash", "abc")],
        );
        let reference = ImageRef::Layout(layout);

        let image = LayoutSource.fetch(&reference, temp_dir.path()).await.unwrap();
        assert_eq!(image.layers().unwrap().len(), 1);

        let labels = LayoutSource
            .fetch_labels(&reference, temp_dir.path())
            .await
            .unwrap();
        assert_eq!(labels.get("cache.triton.image/hash"), Some(&"abc".to_string()));
    }

    #[tokio::test]
    async fn test_archive_source_fetch() {
        let temp_dir = TempDir::new().unwrap();
        let tarball = temp_dir.path().join("image.tar");
        write_docker_archive(
            &tarball,
            "kernels:latest",
            &plain_cache_tar("abc/add.json", b"{}"),
            &[],
        );
        let reference = ImageRef::parse(&format!("docker-archive:{}", tarball.display())).unwrap();

        let image = ArchiveSource
            .fetch(&reference, &temp_dir.path().join("ws"))
            .await
            .unwrap();

        assert_eq!(image.layers().unwrap().len(), 1);
    }

    struct FakeSource {
        name: &'static str,
        available: bool,
        fail: bool,
        calls: Arc<AtomicUsize>,
        layout: PathBuf,
    }

    #[async_trait]
    impl ImageSource for FakeSource {
        fn name(&self) -> &str {
            self.name
        }

        fn is_available(&self) -> bool {
            self.available
        }

        fn accepts(&self, reference: &ImageRef) -> bool {
            matches!(reference, ImageRef::Named(_))
        }

        async fn fetch(
            &self,
            _reference: &ImageRef,
            _workspace: &Path,
        ) -> Result<Box<dyn ImageHandle>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(CacheError::Other(format!("{} is down", self.name)));
            }
            Ok(Box::new(OciLayoutImage::from_path(&self.layout)?))
        }

        async fn fetch_labels(
            &self,
            _reference: &ImageRef,
            _workspace: &Path,
        ) -> Result<HashMap<String, String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(CacheError::Other(format!("{} is down", self.name)));
            }
            Ok(HashMap::from([("source".to_string(), self.name.to_string())]))
        }
    }

    fn fake(
        name: &'static str,
        available: bool,
        fail: bool,
        layout: &Path,
    ) -> (Box<dyn ImageSource>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let source = FakeSource {
            name,
            available,
            fail,
            calls: calls.clone(),
            layout: layout.to_path_buf(),
        };
        (Box::new(source), calls)
    }

    #[tokio::test]
    async fn test_chain_falls_through_failures() {
        let temp_dir = TempDir::new().unwrap();
        let layout = temp_dir.path().join("layout");
        write_layout(&layout, Some(OCI_MANIFEST), &[(OCI_LAYER_GZIP, vec![0])], &[]);

        let (down, down_calls) = fake("down", true, true, &layout);
        let (absent, absent_calls) = fake("absent", false, false, &layout);
        let (up, up_calls) = fake("up", true, false, &layout);
        let chain = SourceChain::new(vec![down, absent, up]);
        let reference = ImageRef::Named("kernels".to_string());

        let labels = chain
            .fetch_labels(&reference, temp_dir.path())
            .await
            .unwrap();

        assert_eq!(labels.get("source"), Some(&"up".to_string()));
        assert_eq!(down_calls.load(Ordering::SeqCst), 1);
        assert_eq!(absent_calls.load(Ordering::SeqCst), 0);
        assert_eq!(up_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_chain_aggregates_every_failure() {
        let temp_dir = TempDir::new().unwrap();
        let (first, _) = fake("first", true, true, temp_dir.path());
        let (second, _) = fake("second", true, true, temp_dir.path());
        let chain = SourceChain::new(vec![first, second]);

        let err = chain
            .fetch(&ImageRef::Named("kernels".to_string()), temp_dir.path())
            .await
            .err()
            .unwrap();

        let msg = err.to_string();
        assert!(msg.contains("first: first is down"));
        assert!(msg.contains("second: second is down"));
    }

    #[tokio::test]
    async fn test_chain_without_accepting_source() {
        let temp_dir = TempDir::new().unwrap();
        let (named_only, calls) = fake("named", true, false, temp_dir.path());
        let chain = SourceChain::new(vec![named_only]);

        let err = chain
            .fetch(&ImageRef::Layout(temp_dir.path().to_path_buf()), temp_dir.path())
            .await
            .err()
            .unwrap();

        assert!(err.to_string().contains("no image source available"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_default_chain_order() {
        let chain = SourceChain::default();
        assert_eq!(
            chain.names(),
            vec!["oci-layout", "docker-archive", "docker", "podman", "registry"]
        );
    }
}
