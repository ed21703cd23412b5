//! Table formatting helpers for CLI output.

use comfy_table::{ContentArrangement, Table};

const SHORT_HASH_LEN: usize = 12;

/// Create a styled table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// Format a MiB count as a human-readable string.
pub fn format_mb(mb: u64) -> String {
    const GB: u64 = 1024;

    if mb == 0 {
        "-".to_string()
    } else if mb >= GB {
        format!("{:.1} GB", mb as f64 / GB as f64)
    } else {
        format!("{} MB", mb)
    }
}

/// PTX version column: `-` when the record or device has none.
pub fn format_ptx(ptx: Option<u32>) -> String {
    ptx.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

/// First characters of a kernel hash, enough to tell records apart.
pub fn short_hash(hash: &str) -> String {
    hash.chars().take(SHORT_HASH_LEN).collect()
}
