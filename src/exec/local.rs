//! Subprocess executor for the bundled report tool.

use std::process::Stdio;

use tokio::process::Command;

use super::{ExecOutput, Executor};
use crate::error::CollectorError;
use crate::types::CollectionTarget;

/// Runs commands as child processes of the agent.
///
/// Children are not killed when the scheduler abandons a timed-out cycle;
/// they keep running detached and tokio reaps them when they exit.
#[derive(Debug, Clone, Default)]
pub struct LocalExecutor;

impl LocalExecutor {
    /// Create a local executor.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Executor for LocalExecutor {
    async fn execute(
        &self,
        target: &CollectionTarget,
        command: &[String],
    ) -> Result<ExecOutput, CollectorError> {
        if !target.is_local() {
            return Err(CollectorError::Execution(format!(
                "local executor cannot run on {}",
                target
            )));
        }
        let (program, args) = command
            .split_first()
            .ok_or_else(|| CollectorError::Execution("empty command".to_string()))?;

        tracing::info!(command = %command.join(" "), "Running local command");

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(false)
            .output()
            .await
            .map_err(|e| CollectorError::Execution(format!("failed to run {}: {}", program, e)))?;

        Ok(ExecOutput {
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn stream_file(
        &self,
        target: &CollectionTarget,
        path: &str,
    ) -> Result<Vec<u8>, CollectorError> {
        if !target.is_local() {
            return Err(CollectorError::Transfer(format!(
                "local executor cannot read from {}",
                target
            )));
        }
        tokio::fs::read(path)
            .await
            .map_err(|e| CollectorError::Transfer(format!("failed to read {}: {}", path, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn shell() -> CollectionTarget {
        CollectionTarget::LocalTool {
            path: PathBuf::from("/bin/sh"),
        }
    }

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_execute_captures_streams_and_exit_code() {
        let output = LocalExecutor::new()
            .execute(
                &shell(),
                &cmd(&["/bin/sh", "-c", "echo report; echo 'warning' >&2; exit 3"]),
            )
            .await
            .unwrap();

        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
        assert_eq!(output.stdout_lossy(), "report");
        assert_eq!(output.stderr_lossy(), "warning");
    }

    #[tokio::test]
    async fn test_execute_missing_program_is_execution_error() {
        let err = LocalExecutor::new()
            .execute(&shell(), &cmd(&["/nonexistent/nvidia-bug-report.sh"]))
            .await
            .unwrap_err();
        assert!(matches!(err, CollectorError::Execution(_)));
    }

    #[tokio::test]
    async fn test_execute_rejects_empty_command() {
        let err = LocalExecutor::new().execute(&shell(), &[]).await.unwrap_err();
        assert!(err.to_string().contains("empty command"));
    }

    #[tokio::test]
    async fn test_stream_file_reads_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.log.gz");
        std::fs::write(&path, b"\x1f\x8bdata").unwrap();

        let bytes = LocalExecutor::new()
            .stream_file(&shell(), path.to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(bytes, b"\x1f\x8bdata");

        let err = LocalExecutor::new()
            .stream_file(&shell(), "/nonexistent/report.log.gz")
            .await
            .unwrap_err();
        assert!(matches!(err, CollectorError::Transfer(_)));
    }
}
