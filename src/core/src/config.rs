use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{CacheError, Result};

/// Environment variable overriding the cache root.
pub const ENV_CACHE_DIR: &str = "TRITON_CACHE_DIR";

/// Environment variable overriding the temporary workspace directory.
pub const ENV_TMP_DIR: &str = "KCACHE_TMP_DIR";

/// Environment variable selecting the match policy ("any" or "all").
pub const ENV_MATCH_POLICY: &str = "KCACHE_MATCH_POLICY";

/// Environment variable selecting the log level.
pub const ENV_LOG_LEVEL: &str = "KCACHE_LOG_LEVEL";

/// Environment variable holding the registry user name.
pub const ENV_REGISTRY_USER: &str = "KCACHE_REGISTRY_USER";

/// Environment variable holding the registry password or token.
pub const ENV_REGISTRY_TOKEN: &str = "KCACHE_REGISTRY_TOKEN";

/// Process-wide kcache configuration.
///
/// Resolved once at the process boundary and passed explicitly to every
/// component that touches the cache root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KcacheConfig {
    /// Directory extracted kernels are written to
    pub cache_root: PathBuf,

    /// Parent directory for temporary workspaces
    pub tmp_dir: PathBuf,

    /// Prefix of temporary workspace names
    pub workspace_prefix: String,

    /// How per-record verdicts combine into an image verdict
    pub match_policy: MatchPolicy,

    /// Log level
    pub log_level: LogLevel,

    /// Registry login; anonymous pulls when unset
    #[serde(default, skip_serializing)]
    pub registry: Option<RegistryCredentials>,
}

/// User name and token for registry pulls.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct RegistryCredentials {
    pub username: String,
    pub token: String,
}

impl RegistryCredentials {
    /// Credentials only when both parts are present and non-empty.
    pub fn from_parts(username: Option<String>, token: Option<String>) -> Option<Self> {
        match (username, token) {
            (Some(username), Some(token)) if !username.is_empty() && !token.is_empty() => {
                Some(Self { username, token })
            }
            _ => None,
        }
    }
}

impl std::fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl Default for KcacheConfig {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
            tmp_dir: std::env::temp_dir(),
            workspace_prefix: "kcache-".to_string(),
            match_policy: MatchPolicy::AnyRecord,
            log_level: LogLevel::Warn,
            registry: None,
        }
    }
}

impl KcacheConfig {
    /// Defaults overlaid with environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(dir) = non_empty_env(ENV_CACHE_DIR) {
            config.cache_root = PathBuf::from(dir);
        }
        if let Some(dir) = non_empty_env(ENV_TMP_DIR) {
            config.tmp_dir = PathBuf::from(dir);
        }
        if let Some(policy) = non_empty_env(ENV_MATCH_POLICY) {
            config.match_policy = policy.parse().map_err(CacheError::Config)?;
        }
        if let Some(level) = non_empty_env(ENV_LOG_LEVEL) {
            config.log_level = level.parse().map_err(CacheError::Config)?;
        }
        config.registry = RegistryCredentials::from_parts(
            non_empty_env(ENV_REGISTRY_USER),
            non_empty_env(ENV_REGISTRY_TOKEN),
        );

        Ok(config)
    }

    /// Replace the cache root.
    pub fn with_cache_root(mut self, cache_root: impl Into<PathBuf>) -> Self {
        self.cache_root = cache_root.into();
        self
    }

    /// Create a fresh temporary workspace under `tmp_dir`.
    ///
    /// The caller owns cleanup; the returned guard removes the directory on drop.
    pub fn workspace(&self, purpose: &str) -> Result<tempfile::TempDir> {
        std::fs::create_dir_all(&self.tmp_dir)?;
        tempfile::Builder::new()
            .prefix(&format!("{}{}-", self.workspace_prefix, purpose))
            .tempdir_in(&self.tmp_dir)
            .map_err(CacheError::from)
    }
}

/// `$HOME/.triton/cache`, or `./.triton/cache` when no home directory is known.
pub fn default_cache_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".triton")
        .join("cache")
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Aggregate policy over multiple cache records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchPolicy {
    /// At least one record is satisfied by at least one device
    #[default]
    AnyRecord,
    /// Every record is satisfied by some device
    AllRecords,
}

impl std::str::FromStr for MatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "any" => Ok(MatchPolicy::AnyRecord),
            "all" => Ok(MatchPolicy::AllRecords),
            other => Err(format!("unknown match policy '{}' (expected any or all)", other)),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Map a numeric verbosity (0 = minimal) to a level.
    pub fn from_verbosity(v: u8) -> Self {
        match v {
            0 => LogLevel::Warn,
            1 => LogLevel::Info,
            2 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => other
                .parse::<u8>()
                .map(LogLevel::from_verbosity)
                .map_err(|_| format!("unknown log level '{}'", other)),
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}
