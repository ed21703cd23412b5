//! Builds through an installed container tool (docker, podman, buildah).

use async_trait::async_trait;
use kcache_core::error::{CacheError, Result};

use super::{BuildOutput, ImageBuilder};
use crate::assembler::ImageDescription;
use crate::command;

/// Supported build tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildTool {
    Docker,
    Podman,
    Buildah,
}

impl BuildTool {
    /// Preference order when none is requested.
    pub const PREFERENCE: [BuildTool; 3] = [BuildTool::Buildah, BuildTool::Podman, BuildTool::Docker];

    pub fn program(&self) -> &'static str {
        match self {
            BuildTool::Docker => "docker",
            BuildTool::Podman => "podman",
            BuildTool::Buildah => "buildah",
        }
    }

    fn build_args(&self, image: &str, dockerfile: &str, context: &str) -> Vec<String> {
        let mut args = match self {
            BuildTool::Buildah => vec!["bud".to_string()],
            BuildTool::Docker | BuildTool::Podman => vec!["build".to_string()],
        };
        args.extend(
            ["-t", image, "-f", dockerfile, context]
                .iter()
                .map(|s| s.to_string()),
        );
        args
    }
}

impl std::str::FromStr for BuildTool {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "docker" => Ok(BuildTool::Docker),
            "podman" => Ok(BuildTool::Podman),
            "buildah" => Ok(BuildTool::Buildah),
            other => Err(CacheError::InvalidArgument(format!(
                "unknown builder '{}' (expected docker, podman, buildah or oci-layout)",
                other
            ))),
        }
    }
}

/// An [`ImageBuilder`] that shells out to a container tool.
#[derive(Debug, Clone)]
pub struct ToolBuilder {
    tool: BuildTool,
}

impl ToolBuilder {
    pub fn new(tool: BuildTool) -> Self {
        Self { tool }
    }

    pub fn tool(&self) -> BuildTool {
        self.tool
    }
}

#[async_trait]
impl ImageBuilder for ToolBuilder {
    fn name(&self) -> &str {
        self.tool.program()
    }

    fn is_available(&self) -> bool {
        command::find_executable(self.tool.program()).is_some()
    }

    async fn build(&self, description: &ImageDescription, image: &str) -> Result<BuildOutput> {
        let dockerfile = description.write_dockerfile()?;
        let program = self.tool.program();
        let args = self.tool.build_args(
            image,
            &dockerfile.to_string_lossy(),
            &description.context_dir.to_string_lossy(),
        );

        tracing::info!(tool = program, image, "Building cache image");
        command::run(program, &args).await?;

        let mut tags = vec![image.to_string()];
        // Single-record images are also tagged with the kernel hash
        if let Some(hash) = description.single_hash() {
            let hash_tag = format!("{}:{}", repository(image), hash);
            command::run(program, ["tag", image, hash_tag.as_str()]).await?;
            tags.push(hash_tag);
        }

        Ok(BuildOutput {
            builder: program.to_string(),
            image: image.to_string(),
            tags,
            digest: None,
            location: None,
        })
    }
}

/// Image name without its digest or tag (a registry port is not a tag).
fn repository(image: &str) -> &str {
    let image = image.split_once('@').map_or(image, |(name, _)| name);
    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[name_start..].rfind(':') {
        Some(colon) => &image[..name_start + colon],
        None => image,
    }
}
