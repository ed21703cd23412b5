//! `kcache extract` command.

use clap::Args;
use kcache_core::KcacheConfig;
use kcache_runtime::CacheManager;

#[derive(Args)]
pub struct ExtractArgs {
    /// Image reference (name, oci:<dir> or docker-archive:<file>[:tag])
    #[arg(short, long)]
    pub image: String,
}

pub async fn execute(
    args: ExtractArgs,
    config: KcacheConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let manager = CacheManager::with_defaults(config);
    let report = manager.extract(&args.image).await?;

    match &report.digest {
        Some(digest) => println!(
            "Extracted {} ({} variant, blob {}) to {}",
            report.reference,
            report.variant,
            digest,
            report.location.display()
        ),
        None => println!(
            "Extracted {} ({} variant, {} files) to {}",
            report.reference,
            report.variant,
            report.files,
            report.location.display()
        ),
    }
    Ok(())
}
