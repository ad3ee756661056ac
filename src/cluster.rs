//! Cluster Access
//!
//! The collector touches Kubernetes through exactly three calls: read a
//! node's labels, list the pods of a namespace on one node, and exec a
//! command in a container. [`ClusterApi`] captures those so the resolver and
//! the pod executor can be driven by an in-memory fake in tests;
//! [`KubeCluster`] is the production implementation on top of `kube`.

mod kube_client;

use std::collections::BTreeMap;

use thiserror::Error;

use crate::exec::ExecOutput;

pub use kube_client::KubeCluster;

/// Errors raised by cluster calls.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Kubernetes API or transport failure.
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    /// The exec channel broke or did not report a status.
    #[error("exec failed: {0}")]
    Exec(String),
}

/// The subset of a pod the resolver looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSummary {
    /// Pod name.
    pub name: String,
    /// Node the pod is scheduled on, if any.
    pub node_name: Option<String>,
    /// Pod phase (`Pending`, `Running`, ...).
    pub phase: Option<String>,
    /// Container names in pod spec order.
    pub containers: Vec<String>,
}

impl PodSummary {
    /// Whether the pod is in the `Running` phase.
    pub fn is_running(&self) -> bool {
        self.phase.as_deref() == Some("Running")
    }
}

/// Read-only cluster queries plus container exec.
#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync {
    /// Labels of `node`.
    async fn node_labels(&self, node: &str) -> Result<BTreeMap<String, String>, ClusterError>;

    /// Pods in `namespace` scheduled on `node`.
    async fn list_pods(&self, namespace: &str, node: &str)
    -> Result<Vec<PodSummary>, ClusterError>;

    /// Run `command` in a container and collect its output.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput, ClusterError>;
}
