//! `kcache accelerators` command.

use std::path::PathBuf;

use clap::Args;
use kcache_runtime::accelerator::{default_probes, probe_all};
use serde::Serialize;

use crate::output;

#[derive(Args)]
pub struct AcceleratorsArgs {
    /// JSON file listing accelerators, instead of probing with vendor tools
    #[arg(long)]
    pub accelerators: Option<PathBuf>,

    /// Print the accelerators as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct AcceleratorRow {
    index: usize,
    #[serde(flatten)]
    device: kcache_core::AcceleratorDescriptor,
}

pub async fn execute(args: AcceleratorsArgs) -> Result<(), Box<dyn std::error::Error>> {
    let devices = probe_all(&default_probes(args.accelerators))
        .await?
        .ok_or(
            "no accelerator probe available (install nvidia-smi or rocm-smi, or pass --accelerators)",
        )?;

    if args.json {
        let rows: Vec<AcceleratorRow> = devices
            .into_iter()
            .enumerate()
            .map(|(index, device)| AcceleratorRow { index, device })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    let mut table = output::new_table(&["#", "NAME", "BACKEND", "ARCH", "WARP", "PTX", "MEMORY"]);
    for (index, device) in devices.iter().enumerate() {
        table.add_row(vec![
            index.to_string(),
            device.name.clone(),
            device.backend.clone(),
            device.arch.to_string(),
            device.warp_size.to_string(),
            output::format_ptx(device.ptx_version),
            output::format_mb(device.memory_total_mb),
        ]);
    }
    println!("{table}");
    Ok(())
}
