//! Shell script hooks around an extraction.
//!
//! Before/after scripts and the shell-command style all run through here:
//! one `sh -c` invocation, output captured and logged, nonzero exit mapped
//! to `ScriptFailure`. Scripts run to completion unless a timeout is
//! configured; there is no cancellation once started.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{error, info, warn};

use crate::error::ExtractionError;

/// Runs `command` through the platform shell and waits for it.
///
/// `label` names the hook in log lines ("before", "after", "command").
/// A `timeout` of `None` waits indefinitely; an elapsed timeout kills the
/// script and fails with exit code -1.
pub async fn run_script(
    label: &str,
    command: &str,
    timeout: Option<Duration>,
) -> Result<(), ExtractionError> {
    info!(script = label, command = %command, "Running script");

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let output = match timeout {
        None => cmd.output().await?,
        Some(limit) => match tokio::time::timeout(limit, cmd.output()).await {
            Ok(result) => result?,
            Err(_) => {
                error!(script = label, timeout_secs = limit.as_secs(), "Script timed out");
                return Err(ExtractionError::ScriptFailure {
                    script: command.to_string(),
                    code: -1,
                });
            }
        },
    };

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        if !line.trim().is_empty() {
            info!(script = label, stdout = %line, "Script output");
        }
    }
    for line in String::from_utf8_lossy(&output.stderr).lines() {
        if !line.trim().is_empty() {
            warn!(script = label, stderr = %line, "Script stderr");
        }
    }

    let code = output.status.code().unwrap_or(-1);
    if code != 0 {
        return Err(ExtractionError::ScriptFailure {
            script: command.to_string(),
            code,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_successful_script() {
        assert!(run_script("before", "true", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_script_with_output_succeeds() {
        assert!(run_script("before", "echo setting up; echo oops >&2", None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_failing_script_reports_exit_code() {
        let err = run_script("before", "exit 7", None).await.unwrap_err();
        match err {
            ExtractionError::ScriptFailure { script, code } => {
                assert_eq!(script, "exit 7");
                assert_eq!(code, 7);
            }
            other => panic!("expected ScriptFailure, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_command_reports_127() {
        let err = run_script("after", "no-such-command-qzv", None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExtractionError::ScriptFailure { code: 127, .. }
        ));
    }

    #[tokio::test]
    async fn test_script_timeout() {
        let err = run_script("before", "sleep 5", Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExtractionError::ScriptFailure { code: -1, .. }
        ));
    }
}
