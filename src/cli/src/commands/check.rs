//! `kcache check` command.

use std::path::PathBuf;

use clap::Args;
use kcache_core::{KcacheConfig, MatchPolicy};
use kcache_runtime::accelerator::default_probes;
use kcache_runtime::{CacheManager, MatchVerdict, RecordVerdict};

use crate::output;

#[derive(Args)]
pub struct CheckArgs {
    /// Image reference whose labels are checked
    #[arg(short, long, conflicts_with = "dir", required_unless_present = "dir")]
    pub image: Option<String>,

    /// Cache directory whose descriptors are checked
    #[arg(short, long)]
    pub dir: Option<PathBuf>,

    /// any: one record must run; all: every record must run
    #[arg(long)]
    pub policy: Option<MatchPolicy>,

    /// JSON file listing accelerators, instead of probing with vendor tools
    #[arg(long)]
    pub accelerators: Option<PathBuf>,

    /// Print the verdict as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(
    args: CheckArgs,
    mut config: KcacheConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(policy) = args.policy {
        config.match_policy = policy;
    }
    let manager =
        CacheManager::with_defaults(config).with_probes(default_probes(args.accelerators));

    let verdict = match (&args.image, &args.dir) {
        (Some(image), _) => manager.check_image(image).await?,
        (None, Some(dir)) => manager.check_dir(dir).await?,
        (None, None) => return Err("either --image or --dir is required".into()),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&verdict)?);
    } else {
        print_verdict(&verdict);
    }

    verdict.into_result()?;
    Ok(())
}

fn print_verdict(verdict: &MatchVerdict) {
    let mut table = output::new_table(&["HASH", "BACKEND", "ARCH", "WARP", "PTX", "STATUS"]);
    for report in &verdict.records {
        let status = match &report.verdict {
            RecordVerdict::Satisfied { accelerator } => format!("ok (device {})", accelerator),
            RecordVerdict::Unsatisfied { diagnostic } => diagnostic.to_string(),
        };
        table.add_row(vec![
            output::short_hash(&report.record.hash),
            report.record.backend.clone(),
            report.record.arch.to_string(),
            report.record.warp_size.to_string(),
            output::format_ptx(report.record.ptx_version),
            status,
        ]);
    }
    println!("{table}");
    println!(
        "{}/{} records runnable: {}",
        verdict.satisfied_count(),
        verdict.records.len(),
        if verdict.compatible {
            "compatible"
        } else {
            "incompatible"
        }
    );
}
