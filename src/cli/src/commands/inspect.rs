//! `kcache inspect` command - show the cache records in an image's labels.

use clap::Args;
use kcache_core::KcacheConfig;
use kcache_runtime::CacheManager;

use crate::output;

#[derive(Args)]
pub struct InspectArgs {
    /// Image reference to inspect
    #[arg(short, long)]
    pub image: String,

    /// Print the records as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(
    args: InspectArgs,
    config: KcacheConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let manager = CacheManager::with_defaults(config);
    let labels = manager.image_labels(&args.image).await?;

    if args.json {
        let output = serde_json::json!({
            "Image": args.image,
            "Variant": labels.variant.as_str(),
            "Entries": labels.entries,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let mut table = output::new_table(&["HASH", "BACKEND", "ARCH", "WARP", "PTX"]);
    for entry in &labels.entries {
        table.add_row(vec![
            entry.hash.clone(),
            entry.backend.clone(),
            entry.arch.to_string(),
            entry.warp_size.to_string(),
            output::format_ptx(entry.ptx_version),
        ]);
    }
    println!("{table}");
    Ok(())
}
