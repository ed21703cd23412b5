//! `kcache create` command.

use std::path::PathBuf;

use clap::Args;
use kcache_core::{ImageVariant, KcacheConfig};
use kcache_runtime::{select_builder, BuildTool, CacheManager, ImageBuilder, OciLayoutWriter};

const OCI_LAYOUT_BUILDER: &str = "oci-layout";

#[derive(Args)]
pub struct CreateArgs {
    /// Triton cache directory to package
    #[arg(short, long)]
    pub dir: PathBuf,

    /// Image name (e.g. quay.io/org/kernels:v1)
    #[arg(short, long)]
    pub image: String,

    /// Builder: buildah, podman, docker or oci-layout [default: first installed tool]
    #[arg(short, long)]
    pub builder: Option<String>,

    /// Image shape written by the oci-layout builder: docker, compat or oci
    #[arg(long, default_value = "compat")]
    pub variant: ImageVariant,

    /// Output directory for the oci-layout builder
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

pub async fn execute(
    args: CreateArgs,
    config: KcacheConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    if !args.dir.is_dir() {
        return Err(format!("cache directory not found: {}", args.dir.display()).into());
    }

    let builder: Box<dyn ImageBuilder> = match args.builder.as_deref() {
        Some(OCI_LAYOUT_BUILDER) => {
            let output = args
                .output
                .ok_or("--output is required with --builder oci-layout")?;
            Box::new(OciLayoutWriter::new(output, args.variant))
        }
        Some(tool) => select_builder(Some(tool.parse::<BuildTool>()?))?,
        None => select_builder(None)?,
    };

    let manager = CacheManager::with_defaults(config);
    let output = manager
        .create(&args.dir, &args.image, builder.as_ref())
        .await?;

    for tag in &output.tags {
        println!("{}", tag);
    }
    if let Some(digest) = &output.digest {
        println!("Digest: {}", digest);
    }
    if let Some(location) = &output.location {
        println!("Written to {}", location.display());
    }
    Ok(())
}
