//! Kubernetes exec into a driver pod container.

use std::io::{Cursor, Read};
use std::sync::Arc;

use super::{ExecOutput, Executor};
use crate::cluster::ClusterApi;
use crate::error::CollectorError;
use crate::types::CollectionTarget;

/// Runs commands inside driver pod containers through the cluster API.
#[derive(Clone)]
pub struct PodExecutor {
    cluster: Arc<dyn ClusterApi>,
}

impl PodExecutor {
    /// Create an executor over `cluster`.
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }
}

impl std::fmt::Debug for PodExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PodExecutor").finish_non_exhaustive()
    }
}

fn pod_fields(target: &CollectionTarget) -> Option<(&str, &str, &str)> {
    match target {
        CollectionTarget::RemotePod {
            namespace,
            pod_name,
            container_name,
        } => Some((namespace, pod_name, container_name)),
        CollectionTarget::LocalTool { .. } => None,
    }
}

#[async_trait::async_trait]
impl Executor for PodExecutor {
    async fn execute(
        &self,
        target: &CollectionTarget,
        command: &[String],
    ) -> Result<ExecOutput, CollectorError> {
        let (namespace, pod, container) = pod_fields(target).ok_or_else(|| {
            CollectorError::Execution(format!("pod executor cannot run on {}", target))
        })?;

        tracing::info!(
            namespace = %namespace,
            pod = %pod,
            container = %container,
            command = %command.join(" "),
            "Executing in pod"
        );

        self.cluster
            .exec(namespace, pod, container, command)
            .await
            .map_err(|e| CollectorError::Execution(format!("{}: {}", target, e)))
    }

    /// Streams the file out of the container as a tar archive
    /// (`tar cf - <path>`) and unpacks it in memory.
    async fn stream_file(
        &self,
        target: &CollectionTarget,
        path: &str,
    ) -> Result<Vec<u8>, CollectorError> {
        let (namespace, pod, container) = pod_fields(target).ok_or_else(|| {
            CollectorError::Transfer(format!("pod executor cannot read from {}", target))
        })?;

        let command = vec![
            "tar".to_string(),
            "cf".to_string(),
            "-".to_string(),
            path.to_string(),
        ];
        let output = self
            .cluster
            .exec(namespace, pod, container, &command)
            .await
            .map_err(|e| CollectorError::Transfer(format!("{}: {}", target, e)))?;

        if !output.success() {
            return Err(CollectorError::Transfer(format!(
                "tar of {} exited with {:?}: {}",
                path,
                output.exit_code,
                output.stderr_lossy()
            )));
        }

        extract_file(&output.stdout, path)
    }
}

/// Pull `path` out of a tar stream.
///
/// `tar` strips the leading `/` from member names; if no member matches,
/// the first regular file is taken.
fn extract_file(archive: &[u8], path: &str) -> Result<Vec<u8>, CollectorError> {
    if archive.is_empty() {
        return Err(CollectorError::Transfer(format!(
            "empty archive streamed for {}",
            path
        )));
    }

    let wanted = path.trim_start_matches('/');
    let mut archive = tar::Archive::new(Cursor::new(archive));
    let entries = archive
        .entries()
        .map_err(|e| CollectorError::Transfer(format!("invalid archive: {}", e)))?;

    let mut first = None;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| CollectorError::Transfer(format!("invalid archive entry: {}", e)))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry
            .path()
            .map_err(|e| CollectorError::Transfer(format!("invalid entry path: {}", e)))?
            .to_string_lossy()
            .trim_start_matches('/')
            .to_string();

        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|e| CollectorError::Transfer(format!("reading {}: {}", name, e)))?;

        if name == wanted {
            return Ok(data);
        }
        if first.is_none() {
            first = Some(data);
        }
    }

    first.ok_or_else(|| CollectorError::Transfer(format!("archive for {} contained no file", path)))
}
