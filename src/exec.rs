//! Remote Executor
//!
//! Runs the report command against a [`CollectionTarget`] and streams files
//! back from it. The two capabilities live behind the [`Executor`] trait,
//! implemented once for the bundled tool ([`LocalExecutor`], a subprocess)
//! and once for driver pods ([`PodExecutor`], Kubernetes exec).
//! [`TargetExecutor`] routes each call by target kind so the pipeline never
//! branches on hardware class.
//!
//! Executors perform no retries and impose no deadline; the scheduler bounds
//! wall-clock time and simply drops the in-flight future on expiry.

mod local;
mod pod;

use std::path::Path;

use crate::error::CollectorError;
use crate::types::CollectionTarget;

pub use local::LocalExecutor;
pub use pod::PodExecutor;

/// Captured output of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Process exit code; `None` if it was killed by a signal.
    pub exit_code: Option<i32>,
    /// Raw stdout.
    pub stdout: Vec<u8>,
    /// Raw stderr.
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    /// Whether the command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stdout as lossy UTF-8, trimmed.
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    /// Stderr as lossy UTF-8, trimmed.
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Command execution and file streaming against a collection target.
#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    /// Run `command` (program followed by arguments) on `target`.
    ///
    /// A non-zero exit code is returned in [`ExecOutput`], not as an error.
    ///
    /// # Errors
    /// `CollectorError::Execution` if the command could not be run at all.
    async fn execute(
        &self,
        target: &CollectionTarget,
        command: &[String],
    ) -> Result<ExecOutput, CollectorError>;

    /// Read the file at `path` on `target`.
    ///
    /// # Errors
    /// `CollectorError::Transfer` if the file cannot be read.
    async fn stream_file(
        &self,
        target: &CollectionTarget,
        path: &str,
    ) -> Result<Vec<u8>, CollectorError>;
}

/// Routes calls to the local or pod executor by target kind.
#[derive(Debug)]
pub struct TargetExecutor {
    local: LocalExecutor,
    pod: Option<PodExecutor>,
}

impl TargetExecutor {
    /// Create a router. `pod` is `None` when no cluster is reachable
    /// (bundled-tool-only deployments).
    pub fn new(local: LocalExecutor, pod: Option<PodExecutor>) -> Self {
        Self { local, pod }
    }

    fn pick(&self, target: &CollectionTarget) -> Result<&dyn Executor, CollectorError> {
        match target {
            CollectionTarget::LocalTool { .. } => Ok(&self.local as &dyn Executor),
            CollectionTarget::RemotePod { .. } => self
                .pod
                .as_ref()
                .map(|p| p as &dyn Executor)
                .ok_or_else(|| {
                    CollectorError::Execution(format!(
                        "no cluster access configured for {}",
                        target
                    ))
                }),
        }
    }
}

#[async_trait::async_trait]
impl Executor for TargetExecutor {
    async fn execute(
        &self,
        target: &CollectionTarget,
        command: &[String],
    ) -> Result<ExecOutput, CollectorError> {
        self.pick(target)?.execute(target, command).await
    }

    async fn stream_file(
        &self,
        target: &CollectionTarget,
        path: &str,
    ) -> Result<Vec<u8>, CollectorError> {
        self.pick(target)?.stream_file(target, path).await
    }
}

/// Build the report command for `target`, writing to `output_base`.
///
/// The bundled tool is invoked by its path; inside a driver pod the
/// `remote_tool` name is resolved through the container's `PATH`. The tool
/// appends `.gz` to `output_base`.
pub fn report_command(
    target: &CollectionTarget,
    remote_tool: &str,
    output_base: &Path,
) -> Vec<String> {
    let program = match target {
        CollectionTarget::LocalTool { path } => path.to_string_lossy().into_owned(),
        CollectionTarget::RemotePod { .. } => remote_tool.to_string(),
    };
    vec![
        program,
        "--output-file".to_string(),
        output_base.to_string_lossy().into_owned(),
    ]
}
