//! External tool invocation.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::Stdio;

use kcache_core::error::{CacheError, Result};
use tokio::process::Command;

/// Locate an executable on `PATH`.
pub fn find_executable(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Run `program` to completion and return its stdout.
///
/// Failure to spawn and a non-zero exit are both [`CacheError::Tool`]; the
/// error carries the tool's stderr.
pub async fn run<I, S>(program: &str, args: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<S> = args.into_iter().collect();
    tracing::debug!(
        program,
        args = ?args.iter().map(|a| a.as_ref().to_string_lossy().into_owned()).collect::<Vec<_>>(),
        "Running external tool"
    );

    let output = Command::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| CacheError::Tool {
            tool: program.to_string(),
            message: format!("failed to spawn: {} (is {} installed?)", e, program),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CacheError::Tool {
            tool: program.to_string(),
            message: format!("exited with {}: {}", output.status, stderr.trim()),
        });
    }

    Ok(output.stdout)
}

/// [`run`], decoding stdout as UTF-8 (lossily).
pub async fn run_text<I, S>(program: &str, args: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let stdout = run(program, args).await?;
    Ok(String::from_utf8_lossy(&stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_executable_missing() {
        assert_eq!(find_executable("kcache-definitely-not-installed"), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captures_stdout() {
        let out = run_text("sh", ["-c", "printf hello"]).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_reports_failure_with_stderr() {
        let err = run("sh", ["-c", "echo boom >&2; exit 3"]).await.unwrap_err();
        match err {
            CacheError::Tool { tool, message } => {
                assert_eq!(tool, "sh");
                assert!(message.contains("boom"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_is_tool_error() {
        let err = run("kcache-definitely-not-installed", ["--version"])
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Tool { .. }));
    }
}
