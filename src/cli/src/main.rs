//! kcache CLI entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use kcache_cli::commands::{dispatch, exit_code, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over --log-level / -v
    let level = cli.log_level();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(level.as_directive())),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let kind = cli.command.kind();
    if let Err(e) = dispatch(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(exit_code(kind, e.as_ref()));
    }
}
