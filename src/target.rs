//! Target Resolver
//!
//! Decides where the bug report is generated for this node: the bundled tool
//! on hosts whose GPUs are not managed by a driver pod, or the driver
//! container of the node's running driver pod.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;

use crate::cluster::{ClusterApi, PodSummary};
use crate::error::CollectorError;
use crate::types::CollectionTarget;

// =============================================================================
// Node label
// =============================================================================

/// Error parsing a `key=value` label selector.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid node label '{0}': expected key=value")]
pub struct InvalidNodeLabel(String);

/// A `key=value` node label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLabel {
    /// Label key, e.g. `nvidia.com/gpu.deploy.driver`.
    pub key: String,
    /// Expected value.
    pub value: String,
}

impl NodeLabel {
    /// Whether `labels` carries this key with this value.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        labels.get(&self.key) == Some(&self.value)
    }
}

impl FromStr for NodeLabel {
    type Err = InvalidNodeLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, value) = s
            .split_once('=')
            .ok_or_else(|| InvalidNodeLabel(s.to_string()))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(InvalidNodeLabel(s.to_string()));
        }
        Ok(Self {
            key: key.to_string(),
            value: value.trim().to_string(),
        })
    }
}

impl fmt::Display for NodeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

// =============================================================================
// Container selection
// =============================================================================

/// Picks the container to exec into within a driver pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSelector {
    hint: String,
    fallback: Option<String>,
}

impl ContainerSelector {
    /// `hint` is matched case-insensitively as a substring of container
    /// names; `fallback` names the container used when nothing matches.
    pub fn new(hint: impl Into<String>, fallback: Option<String>) -> Self {
        Self {
            hint: hint.into().to_lowercase(),
            fallback,
        }
    }

    /// Select from `containers` (in pod spec order). `None` if the pod has none.
    pub fn select<'a>(&self, containers: &'a [String]) -> Option<&'a str> {
        if let [only] = containers {
            return Some(only.as_str());
        }

        if !self.hint.is_empty() {
            if let Some(hit) = containers
                .iter()
                .find(|c| c.to_lowercase().contains(&self.hint))
            {
                return Some(hit.as_str());
            }
        }

        if let Some(fallback) = &self.fallback {
            if let Some(hit) = containers.iter().find(|c| *c == fallback) {
                return Some(hit.as_str());
            }
        }

        containers.first().map(String::as_str)
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// How the bundled tool is selected.
#[derive(Debug, Clone)]
pub struct LocalToolRule {
    /// Path of the bundled executable.
    pub path: PathBuf,
    /// Node label that selects the bundled tool.
    pub label: Option<NodeLabel>,
    /// Use the bundled tool unconditionally.
    pub force: bool,
}

/// Where driver pods live.
#[derive(Debug, Clone)]
pub struct DriverPodRule {
    /// Namespace of the driver pods.
    pub namespace: String,
    /// Driver pod name prefix.
    pub pod_prefix: String,
    /// Container choice within the pod.
    pub containers: ContainerSelector,
}

/// Resolves the [`CollectionTarget`] for a node.
#[derive(Clone)]
pub struct TargetResolver {
    cluster: Option<Arc<dyn ClusterApi>>,
    local_tool: LocalToolRule,
    driver: DriverPodRule,
}

impl fmt::Debug for TargetResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetResolver")
            .field("cluster", &self.cluster.is_some())
            .field("local_tool", &self.local_tool)
            .field("driver", &self.driver)
            .finish()
    }
}

impl TargetResolver {
    /// Create a resolver. `cluster` is `None` when running without
    /// Kubernetes access, in which case only the bundled tool is reachable.
    pub fn new(
        cluster: Option<Arc<dyn ClusterApi>>,
        local_tool: LocalToolRule,
        driver: DriverPodRule,
    ) -> Self {
        Self {
            cluster,
            local_tool,
            driver,
        }
    }

    fn local_target(&self) -> CollectionTarget {
        CollectionTarget::LocalTool {
            path: self.local_tool.path.clone(),
        }
    }

    /// Resolve the target for `node`.
    ///
    /// # Errors
    /// `CollectorError::TargetNotFound` if no running driver pod with a
    /// container is scheduled on the node, or the cluster cannot be queried.
    pub async fn resolve(&self, node: &str) -> Result<CollectionTarget, CollectorError> {
        if self.local_tool.force {
            tracing::debug!(node = %node, "Bundled tool forced by configuration");
            return Ok(self.local_target());
        }

        let cluster = self.cluster.as_ref().ok_or_else(|| {
            CollectorError::TargetNotFound(format!(
                "no cluster access to locate a driver pod on node {}",
                node
            ))
        })?;

        if let Some(label) = &self.local_tool.label {
            match cluster.node_labels(node).await {
                Ok(labels) if label.matches(&labels) => {
                    tracing::info!(node = %node, label = %label, "Node selects the bundled tool");
                    return Ok(self.local_target());
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(
                        node = %node,
                        error = %e,
                        "Could not read node labels, looking for a driver pod"
                    );
                }
            }
        }

        let pods = cluster
            .list_pods(&self.driver.namespace, node)
            .await
            .map_err(|e| {
                CollectorError::TargetNotFound(format!(
                    "listing pods in {}: {}",
                    self.driver.namespace, e
                ))
            })?;

        let pod = self.pick_pod(&pods, node).ok_or_else(|| {
            CollectorError::TargetNotFound(format!(
                "no running pod with prefix '{}' in namespace {} on node {}",
                self.driver.pod_prefix, self.driver.namespace, node
            ))
        })?;

        let container = self.driver.containers.select(&pod.containers).ok_or_else(|| {
            CollectorError::TargetNotFound(format!("pod {} has no containers", pod.name))
        })?;

        Ok(CollectionTarget::RemotePod {
            namespace: self.driver.namespace.clone(),
            pod_name: pod.name.clone(),
            container_name: container.to_string(),
        })
    }

    fn pick_pod<'a>(&self, pods: &'a [PodSummary], node: &str) -> Option<&'a PodSummary> {
        let mut candidates = pods
            .iter()
            .filter(|p| p.name.starts_with(&self.driver.pod_prefix))
            .filter(|p| p.node_name.as_deref() == Some(node));

        candidates.find(|pod| {
            if pod.is_running() {
                return true;
            }
            tracing::warn!(
                pod = %pod.name,
                phase = pod.phase.as_deref().unwrap_or("Unknown"),
                "Driver pod is not running"
            );
            false
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterError;
    use crate::exec::ExecOutput;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeCluster {
        labels: BTreeMap<String, String>,
        pods: Vec<PodSummary>,
        fail_labels: bool,
        label_calls: AtomicUsize,
        list_calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ClusterApi for FakeCluster {
        async fn node_labels(&self, _node: &str) -> Result<BTreeMap<String, String>, ClusterError> {
            self.label_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_labels {
                return Err(ClusterError::Exec("forbidden".to_string()));
            }
            Ok(self.labels.clone())
        }

        async fn list_pods(
            &self,
            _namespace: &str,
            _node: &str,
        ) -> Result<Vec<PodSummary>, ClusterError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.pods.clone())
        }

        async fn exec(
            &self,
            _namespace: &str,
            _pod: &str,
            _container: &str,
            _command: &[String],
        ) -> Result<ExecOutput, ClusterError> {
            unreachable!("resolver never execs")
        }
    }

    fn pod(name: &str, node: &str, phase: &str, containers: &[&str]) -> PodSummary {
        PodSummary {
            name: name.to_string(),
            node_name: Some(node.to_string()),
            phase: Some(phase.to_string()),
            containers: containers.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn resolver(cluster: Arc<FakeCluster>, force: bool) -> TargetResolver {
        TargetResolver::new(
            Some(cluster as Arc<dyn ClusterApi>),
            LocalToolRule {
                path: PathBuf::from("/usr/bin/nvidia-bug-report.sh"),
                label: Some("nvidia.com/gpu.deploy.driver=false".parse().unwrap()),
                force,
            },
            DriverPodRule {
                namespace: "nvidia-gpu-operator".to_string(),
                pod_prefix: "nvidia-gpu-driver".to_string(),
                containers: ContainerSelector::new("driver", None),
            },
        )
    }

    #[test]
    fn test_node_label_parse() {
        let label: NodeLabel = "nvidia.com/gpu.deploy.driver=false".parse().unwrap();
        assert_eq!(label.key, "nvidia.com/gpu.deploy.driver");
        assert_eq!(label.value, "false");
        assert_eq!(label.to_string(), "nvidia.com/gpu.deploy.driver=false");

        assert!("no-equals".parse::<NodeLabel>().is_err());
        assert!("=value".parse::<NodeLabel>().is_err());
    }

    #[test]
    fn test_container_selection() {
        let selector = ContainerSelector::new("driver", Some("main".to_string()));
        let names = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        assert_eq!(selector.select(&names(&["only"])), Some("only"));
        assert_eq!(
            selector.select(&names(&["toolkit", "nvidia-Driver-ctr"])),
            Some("nvidia-Driver-ctr")
        );
        assert_eq!(selector.select(&names(&["sidecar", "main"])), Some("main"));
        assert_eq!(selector.select(&names(&["sidecar", "other"])), Some("sidecar"));
        assert_eq!(selector.select(&[]), None);
    }

    #[tokio::test]
    async fn test_label_match_returns_local_tool_without_listing_pods() {
        let cluster = Arc::new(FakeCluster {
            labels: BTreeMap::from([(
                "nvidia.com/gpu.deploy.driver".to_string(),
                "false".to_string(),
            )]),
            pods: vec![pod("nvidia-gpu-driver-x", "node-1", "Running", &["driver"])],
            ..Default::default()
        });

        let target = resolver(cluster.clone(), false).resolve("node-1").await.unwrap();
        assert!(target.is_local());
        assert_eq!(cluster.list_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_force_skips_cluster_entirely() {
        let cluster = Arc::new(FakeCluster::default());
        let target = resolver(cluster.clone(), true).resolve("node-1").await.unwrap();
        assert!(target.is_local());
        assert_eq!(cluster.label_calls.load(Ordering::SeqCst), 0);
        assert_eq!(cluster.list_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_running_driver_pod_on_node() {
        let cluster = Arc::new(FakeCluster {
            pods: vec![
                pod("dcgm-exporter-1", "node-1", "Running", &["exporter"]),
                pod("nvidia-gpu-driver-old", "node-1", "Pending", &["driver"]),
                pod("nvidia-gpu-driver-other", "node-2", "Running", &["driver"]),
                pod(
                    "nvidia-gpu-driver-abc",
                    "node-1",
                    "Running",
                    &["toolkit-validation", "nvidia-driver-ctr"],
                ),
            ],
            ..Default::default()
        });

        let target = resolver(cluster, false).resolve("node-1").await.unwrap();
        assert_eq!(
            target,
            CollectionTarget::RemotePod {
                namespace: "nvidia-gpu-operator".to_string(),
                pod_name: "nvidia-gpu-driver-abc".to_string(),
                container_name: "nvidia-driver-ctr".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_no_running_pod_is_target_not_found() {
        let cluster = Arc::new(FakeCluster {
            pods: vec![pod("nvidia-gpu-driver-abc", "node-1", "CrashLoopBackOff", &["d"])],
            ..Default::default()
        });

        let err = resolver(cluster, false).resolve("node-1").await.unwrap_err();
        assert!(matches!(err, CollectorError::TargetNotFound(_)));
    }

    #[tokio::test]
    async fn test_pod_without_containers_is_target_not_found() {
        let cluster = Arc::new(FakeCluster {
            pods: vec![pod("nvidia-gpu-driver-abc", "node-1", "Running", &[])],
            ..Default::default()
        });

        let err = resolver(cluster, false).resolve("node-1").await.unwrap_err();
        assert!(err.to_string().contains("no containers"));
    }

    #[tokio::test]
    async fn test_label_lookup_failure_falls_through_to_pods() {
        let cluster = Arc::new(FakeCluster {
            fail_labels: true,
            pods: vec![pod("nvidia-gpu-driver-abc", "node-1", "Running", &["driver"])],
            ..Default::default()
        });

        let target = resolver(cluster.clone(), false).resolve("node-1").await.unwrap();
        assert!(!target.is_local());
        assert_eq!(cluster.list_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_without_cluster_only_forced_tool_resolves() {
        let resolver = TargetResolver::new(
            None,
            LocalToolRule {
                path: PathBuf::from("/opt/nvidia-bug-report.sh"),
                label: None,
                force: false,
            },
            DriverPodRule {
                namespace: "ns".to_string(),
                pod_prefix: "p".to_string(),
                containers: ContainerSelector::new("driver", None),
            },
        );
        assert!(matches!(
            resolver.resolve("n").await,
            Err(CollectorError::TargetNotFound(_))
        ));
    }
}
