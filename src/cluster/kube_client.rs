//! `kube`-backed [`ClusterApi`].

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::Client;
use kube::api::{Api, AttachParams, ListParams};
use tokio::io::AsyncReadExt;

use super::{ClusterApi, ClusterError, PodSummary};
use crate::exec::ExecOutput;

/// Cluster access through the Kubernetes API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Wrap an existing client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using the ambient configuration: in-cluster service account
    /// first, then the local kubeconfig.
    pub async fn connect() -> Result<Self, ClusterError> {
        let client = Client::try_default().await?;
        tracing::info!(
            default_namespace = client.default_namespace(),
            "Kubernetes client initialized"
        );
        Ok(Self { client })
    }
}

impl std::fmt::Debug for KubeCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeCluster").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl ClusterApi for KubeCluster {
    async fn node_labels(&self, node: &str) -> Result<BTreeMap<String, String>, ClusterError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let node = nodes.get(node).await?;
        Ok(node.metadata.labels.unwrap_or_default())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        node: &str,
    ) -> Result<Vec<PodSummary>, ClusterError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().fields(&format!("spec.nodeName={}", node));
        let list = pods.list(&params).await?;
        Ok(list.items.into_iter().map(summarize).collect())
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput, ClusterError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);

        let mut attached = pods.exec(pod, command.to_vec(), &params).await?;

        let mut stdout_reader = attached
            .stdout()
            .ok_or_else(|| ClusterError::Exec("stdout not attached".to_string()))?;
        let mut stderr_reader = attached
            .stderr()
            .ok_or_else(|| ClusterError::Exec("stderr not attached".to_string()))?;
        let status = attached
            .take_status()
            .ok_or_else(|| ClusterError::Exec("status channel not attached".to_string()))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let (out, err) = tokio::join!(
            stdout_reader.read_to_end(&mut stdout),
            stderr_reader.read_to_end(&mut stderr)
        );
        out.map_err(|e| ClusterError::Exec(format!("reading stdout: {}", e)))?;
        err.map_err(|e| ClusterError::Exec(format!("reading stderr: {}", e)))?;

        let status = status.await;
        attached
            .join()
            .await
            .map_err(|e| ClusterError::Exec(e.to_string()))?;

        let exit_code = exit_code_from_status(status.as_ref())?;
        Ok(ExecOutput {
            exit_code: Some(exit_code),
            stdout,
            stderr,
        })
    }
}

fn summarize(pod: Pod) -> PodSummary {
    let name = pod.metadata.name.unwrap_or_default();
    let phase = pod.status.and_then(|s| s.phase);
    let (node_name, containers) = match pod.spec {
        Some(spec) => (
            spec.node_name,
            spec.containers.into_iter().map(|c| c.name).collect(),
        ),
        None => (None, Vec::new()),
    };
    PodSummary {
        name,
        node_name,
        phase,
        containers,
    }
}

/// Map the exec status frame to a process exit code.
///
/// A `Success` status is exit code 0; a failure carrying an `ExitCode` cause
/// is that code. Any other failure means the command never ran (missing
/// binary, container gone) and is reported as an error.
fn exit_code_from_status(status: Option<&Status>) -> Result<i32, ClusterError> {
    let status =
        status.ok_or_else(|| ClusterError::Exec("exec finished without a status".to_string()))?;

    if status.status.as_deref() == Some("Success") {
        return Ok(0);
    }

    let code = status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|c| c.reason.as_deref() == Some("ExitCode"))
        })
        .and_then(|c| c.message.as_deref())
        .and_then(|m| m.trim().parse::<i32>().ok());

    code.ok_or_else(|| {
        ClusterError::Exec(
            status
                .message
                .clone()
                .unwrap_or_else(|| "command failed without an exit code".to_string()),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, StatusCause, StatusDetails};

    fn failure(reason: Option<&str>, code: Option<&str>, message: Option<&str>) -> Status {
        Status {
            status: Some("Failure".to_string()),
            message: message.map(str::to_string),
            reason: Some("NonZeroExitCode".to_string()),
            details: Some(StatusDetails {
                causes: Some(vec![StatusCause {
                    reason: reason.map(str::to_string),
                    message: code.map(str::to_string),
                    field: None,
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_exit_code_success() {
        let status = Status {
            status: Some("Success".to_string()),
            ..Default::default()
        };
        assert_eq!(exit_code_from_status(Some(&status)).unwrap(), 0);
    }

    #[test]
    fn test_exit_code_non_zero() {
        let status = failure(Some("ExitCode"), Some("2"), None);
        assert_eq!(exit_code_from_status(Some(&status)).unwrap(), 2);
    }

    #[test]
    fn test_exit_code_missing_binary_is_error() {
        let status = failure(
            None,
            None,
            Some("executable file not found in $PATH"),
        );
        let err = exit_code_from_status(Some(&status)).unwrap_err();
        assert!(err.to_string().contains("executable file not found"));
    }

    #[test]
    fn test_exit_code_without_status_is_error() {
        assert!(exit_code_from_status(None).is_err());
    }

    #[test]
    fn test_summarize_pod() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("nvidia-gpu-driver-ubuntu22.04-abc123".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("gpu-node-1".to_string()),
                containers: vec![
                    Container {
                        name: "toolkit".to_string(),
                        ..Default::default()
                    },
                    Container {
                        name: "nvidia-driver-ctr".to_string(),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            }),
        };

        let summary = summarize(pod);
        assert_eq!(summary.name, "nvidia-gpu-driver-ubuntu22.04-abc123");
        assert_eq!(summary.node_name.as_deref(), Some("gpu-node-1"));
        assert!(summary.is_running());
        assert_eq!(summary.containers, vec!["toolkit", "nvidia-driver-ctr"]);
    }
}
