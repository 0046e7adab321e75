//! Bounded subprocess execution for CLI-driven camera stacks.

use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use super::{BackendError, BackendResult};

/// Runs `program` to completion and returns its stdout.
///
/// The child is killed if it outlives `timeout` or the returned future is dropped.
/// A missing binary is reported as [`BackendError::NotDetected`].
pub async fn run(program: &str, args: &[String], timeout: Duration) -> BackendResult<Vec<u8>> {
    log::debug!("Running {} {}", program, args.join(" "));

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) if e.kind() == ErrorKind::NotFound => {
            return Err(BackendError::NotDetected(format!("{} is not installed", program)));
        }
        Ok(Err(e)) => return Err(BackendError::Io(e)),
        Err(_) => {
            return Err(BackendError::Timeout {
                what: program.to_string(),
                after: timeout,
            });
        }
    };

    if !output.status.success() {
        return Err(BackendError::Process {
            program: program.to_string(),
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(output.stdout)
}

/// [`run`], with stdout decoded as lossy UTF-8.
pub async fn run_text(program: &str, args: &[String], timeout: Duration) -> BackendResult<String> {
    let stdout = run(program, args, timeout).await?;
    Ok(String::from_utf8_lossy(&stdout).into_owned())
}

pub(crate) fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_of_successful_command() {
        let out = run_text("echo", &args(["hello"]), Duration::from_secs(5)).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn missing_binary_is_not_detected() {
        let err = run("definitely-not-a-camera-tool", &[], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::NotDetected(_)));
    }

    #[tokio::test]
    async fn non_zero_exit_is_process_error() {
        let err = run("sh", &args(["-c", "echo boom >&2; exit 3"]), Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            BackendError::Process { status, stderr, .. } => {
                assert_eq!(status, 3);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let err = run("sleep", &args(["5"]), Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, BackendError::Timeout { .. }));
    }
}
