//! CLI command definitions and dispatch.

mod accelerators;
mod check;
mod create;
mod extract;
mod inspect;
mod version;

use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser, Subcommand};
use kcache_core::config::ENV_LOG_LEVEL;
use kcache_core::{CacheError, KcacheConfig, LogLevel};

/// Exit code when extraction fails.
pub const EXIT_EXTRACT_ERROR: i32 = 1;
/// Exit code when image creation fails.
pub const EXIT_CREATE_ERROR: i32 = 2;
/// Exit code when no accelerator can run the cache.
pub const EXIT_INCOMPATIBLE: i32 = 3;
/// Exit code for every other failure.
pub const EXIT_OTHER_ERROR: i32 = 4;

/// kcache - GPU kernel cache image management.
#[derive(Parser)]
#[command(name = "kcache", version, about)]
pub struct Cli {
    /// Log level: trace, debug, info, warn, error, or a verbosity number (0 = minimal)
    #[arg(short = 'l', long, global = true)]
    pub log_level: Option<LogLevel>,

    /// Increase verbosity (repeatable)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Cache root [default: $TRITON_CACHE_DIR, then ~/.triton/cache]
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Effective log level: `--log-level`, then `-v`, then `KCACHE_LOG_LEVEL`.
    pub fn log_level(&self) -> LogLevel {
        if let Some(level) = self.log_level {
            return level;
        }
        if self.verbose > 0 {
            return LogLevel::from_verbosity(self.verbose);
        }
        std::env::var(ENV_LOG_LEVEL)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(LogLevel::Warn)
    }
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Package a Triton cache directory as an image
    Create(create::CreateArgs),
    /// Extract the kernel cache from an image into the cache root
    Extract(extract::ExtractArgs),
    /// Check whether a cache image or directory runs on this host's GPUs
    Check(check::CheckArgs),
    /// Show the cache records an image carries in its labels
    Inspect(inspect::InspectArgs),
    /// List the accelerators detected on this host
    #[command(alias = "gpus")]
    Accelerators(accelerators::AcceleratorsArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Which exit code family a command's failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Create,
    Extract,
    Other,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Create(_) => CommandKind::Create,
            Command::Extract(_) => CommandKind::Extract,
            _ => CommandKind::Other,
        }
    }
}

/// Process exit code for a failed command.
pub fn exit_code(kind: CommandKind, err: &(dyn std::error::Error + 'static)) -> i32 {
    if err
        .downcast_ref::<CacheError>()
        .is_some_and(CacheError::is_incompatible)
    {
        return EXIT_INCOMPATIBLE;
    }
    match kind {
        CommandKind::Extract => EXIT_EXTRACT_ERROR,
        CommandKind::Create => EXIT_CREATE_ERROR,
        CommandKind::Other => EXIT_OTHER_ERROR,
    }
}

/// Configuration from the environment with CLI overrides applied.
pub(crate) fn load_config(
    cache_dir: Option<&Path>,
) -> Result<KcacheConfig, Box<dyn std::error::Error>> {
    let mut config = KcacheConfig::from_env()?;
    if let Some(dir) = cache_dir {
        config.cache_root = dir.to_path_buf();
    }
    Ok(config)
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(cli.cache_dir.as_deref())?;
    tracing::debug!(cache_root = %config.cache_root.display(), "Loaded configuration");

    match cli.command {
        Command::Create(args) => create::execute(args, config).await,
        Command::Extract(args) => extract::execute(args, config).await,
        Command::Check(args) => check::execute(args, config).await,
        Command::Inspect(args) => inspect::execute(args, config).await,
        Command::Accelerators(args) => accelerators::execute(args).await,
        Command::Version(args) => version::execute(args).await,
    }
}
