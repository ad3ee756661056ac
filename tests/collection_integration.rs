//! End-to-end collection tests.
//!
//! Drives the scheduler through each policy with the real local executor,
//! a scripted cluster and a mock task API.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use gpu_log_collector::{
    ApiClient, ArtifactTransfer, ClusterApi, ClusterError, CollectionStatus, CollectionTask,
    ContainerSelector, DriverPodRule, ExecOutput, Executor, LocalExecutor, LocalToolRule, Mode,
    PodExecutor, PodSummary, RetentionManager, RetentionPolicy, RunOutcome, STAGING_DIR_NAME,
    Scheduler, TargetExecutor, TargetResolver, TaskPoller,
};
use wiremock::matchers::{body_partial_json, header_regex, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const NODE: &str = "gpu-node-1";

// =============================================================================
// Test Helpers
// =============================================================================

/// Cluster with one running driver pod on `NODE`.
struct ScriptedCluster {
    /// Exec fails as if the pod had been deleted.
    pod_gone: bool,
    exec_calls: AtomicUsize,
}

impl ScriptedCluster {
    fn new(pod_gone: bool) -> Arc<Self> {
        Arc::new(Self {
            pod_gone,
            exec_calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait::async_trait]
impl ClusterApi for ScriptedCluster {
    async fn node_labels(&self, _node: &str) -> Result<BTreeMap<String, String>, ClusterError> {
        Ok(BTreeMap::from([(
            "nvidia.com/gpu.present".to_string(),
            "true".to_string(),
        )]))
    }

    async fn list_pods(
        &self,
        _namespace: &str,
        node: &str,
    ) -> Result<Vec<PodSummary>, ClusterError> {
        Ok(vec![PodSummary {
            name: "nvidia-gpu-driver-ubuntu22.04-7c9f".to_string(),
            node_name: Some(node.to_string()),
            phase: Some("Running".to_string()),
            containers: vec!["nvidia-peermem-ctr".to_string(), "nvidia-driver-ctr".to_string()],
        }])
    }

    async fn exec(
        &self,
        _namespace: &str,
        pod: &str,
        _container: &str,
        _command: &[String],
    ) -> Result<ExecOutput, ClusterError> {
        self.exec_calls.fetch_add(1, Ordering::SeqCst);
        if self.pod_gone {
            return Err(ClusterError::Exec(format!("pods \"{}\" not found", pod)));
        }
        // Every command succeeds but produces no output, so the streamed
        // archive is empty.
        Ok(ExecOutput {
            exit_code: Some(0),
            ..Default::default()
        })
    }
}

/// Write an executable shell script standing in for the report tool.
#[cfg(unix)]
fn write_tool(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("nvidia-bug-report.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn build_scheduler(
    output: &Path,
    tool: PathBuf,
    cluster: Option<Arc<dyn ClusterApi>>,
    timeout: Duration,
) -> Scheduler {
    let force = cluster.is_none();
    let resolver = TargetResolver::new(
        cluster.clone(),
        LocalToolRule {
            path: tool,
            label: Some("nvidia.com/gpu.deploy.driver=false".parse().unwrap()),
            force,
        },
        DriverPodRule {
            namespace: "nvidia-gpu-operator".to_string(),
            pod_prefix: "nvidia-gpu-driver".to_string(),
            containers: ContainerSelector::new("driver", None),
        },
    );
    let executor: Arc<dyn Executor> = Arc::new(TargetExecutor::new(
        LocalExecutor::new(),
        cluster.map(PodExecutor::new),
    ));
    let transfer = ArtifactTransfer::new(executor.clone(), output, "/tmp");
    let retention = RetentionManager::new(output, RetentionPolicy::new(1).unwrap());
    Scheduler::new(NODE, resolver, executor, transfer, retention).timeout(timeout)
}

fn stored_reports(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect()
}

// =============================================================================
// One-shot
// =============================================================================

#[cfg(unix)]
#[tokio::test]
async fn test_one_shot_local_tool_stores_large_report() {
    let tools = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    // gzip magic followed by 10 MiB of payload, written to "$2.gz"
    let tool = write_tool(
        tools.path(),
        r#"out="$2.gz"
printf '\037\213' > "$out"
head -c 10485760 /dev/zero >> "$out""#,
    );
    let scheduler = build_scheduler(output.path(), tool, None, Duration::from_secs(60));

    let outcome = scheduler
        .run(Mode::OneShot, std::future::pending::<()>())
        .await
        .unwrap();

    let RunOutcome::Completed(result) = outcome else {
        panic!("one-shot run was stopped");
    };
    assert_eq!(result.status, CollectionStatus::Success, "{}", result.message);

    let reports = stored_reports(output.path());
    assert_eq!(reports.len(), 1);
    assert_eq!(Some(&reports[0]), result.artifact_path.as_ref());
    assert_eq!(std::fs::metadata(&reports[0]).unwrap().len(), 10 * 1024 * 1024 + 2);
    let name = reports[0].file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("nvidia-bug-report-gpu-node-1-"));
    assert!(name.ends_with(".log.gz"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_one_shot_timeout_is_reported_as_timeout() {
    let tools = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let tool = write_tool(tools.path(), "sleep 5");
    let scheduler = build_scheduler(output.path(), tool, None, Duration::from_millis(300));

    let outcome = scheduler
        .run(Mode::OneShot, std::future::pending::<()>())
        .await
        .unwrap();

    let RunOutcome::Completed(result) = outcome else {
        panic!("one-shot run was stopped");
    };
    assert_eq!(result.status, CollectionStatus::Timeout);
    assert!(result.artifact_path.is_none());
    assert!(stored_reports(output.path()).is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn test_late_report_from_timed_out_tool_is_swept() {
    let tools = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let tool = write_tool(tools.path(), r#"sleep 1
printf '\037\213late' > "$2.gz""#);
    let scheduler = build_scheduler(output.path(), tool, None, Duration::from_millis(300));
    let staging = output.path().join(STAGING_DIR_NAME);
    let task = CollectionTask::scheduled(NODE);

    let first = scheduler.run_cycle(&task).await;
    assert_eq!(first.status, CollectionStatus::Timeout);

    // The detached tool finishes after its cycle was abandoned.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 1);

    let second = scheduler.run_cycle(&task).await;
    assert_eq!(second.status, CollectionStatus::Timeout);
    assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);
    assert!(stored_reports(output.path()).is_empty());
}

// =============================================================================
// Interval
// =============================================================================

#[tokio::test]
async fn test_interval_pod_deleted_before_exec_keeps_running() {
    let output = tempfile::tempdir().unwrap();
    let cluster = ScriptedCluster::new(true);
    let scheduler = build_scheduler(
        output.path(),
        PathBuf::from("/usr/bin/nvidia-bug-report.sh"),
        Some(cluster.clone() as Arc<dyn ClusterApi>),
        Duration::from_secs(5),
    );

    let outcome = scheduler
        .run(
            Mode::Interval(Duration::from_millis(50)),
            tokio::time::sleep(Duration::from_millis(400)),
        )
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Stopped);
    assert!(
        cluster.exec_calls.load(Ordering::SeqCst) >= 2,
        "scheduler stopped after the first failed cycle"
    );
    assert!(stored_reports(output.path()).is_empty());
}

// =============================================================================
// API-driven
// =============================================================================

#[tokio::test]
async fn test_api_task_with_empty_transfer_reports_failure() {
    let output = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/agent/check-tasks"))
        .and(query_param("vm_id", "vm-abc"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"status": "success", "event_id": "12345"})),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/agent/check-tasks"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/agent/upload-logs"))
        .and(header_regex("content-type", "^multipart/form-data"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/agent/upload-logs"))
        .and(body_partial_json(serde_json::json!({
            "vm_id": "vm-abc",
            "event_id": "12345",
            "status": "failed",
            "node_name": NODE,
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let cluster = ScriptedCluster::new(false);
    let scheduler = build_scheduler(
        output.path(),
        PathBuf::from("/usr/bin/nvidia-bug-report.sh"),
        Some(cluster as Arc<dyn ClusterApi>),
        Duration::from_secs(5),
    );
    let client = Arc::new(
        ApiClient::new(&server.uri(), Some("token".to_string())).unwrap(),
    );
    let poller = TaskPoller::new(client, "vm-abc", Duration::from_millis(50));

    let reported = async {
        for _ in 0..100 {
            let requests = server.received_requests().await.unwrap_or_default();
            if requests.iter().any(|r| r.method.as_str() == "POST") {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };

    let outcome = scheduler.run(Mode::Api(poller), reported).await.unwrap();
    assert_eq!(outcome, RunOutcome::Stopped);

    let requests = server.received_requests().await.unwrap();
    let post = requests
        .iter()
        .find(|r| r.method.as_str() == "POST")
        .expect("failure report was sent");
    let body: serde_json::Value = serde_json::from_slice(&post.body).unwrap();
    assert!(
        body["message"].as_str().unwrap().contains("transfer error"),
        "unexpected message: {}",
        body["message"]
    );
    assert!(stored_reports(output.path()).is_empty());
}

#[tokio::test]
async fn test_api_auth_rejection_stops_the_loop() {
    let output = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/agent/check-tasks"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let scheduler = build_scheduler(
        output.path(),
        PathBuf::from("/usr/bin/nvidia-bug-report.sh"),
        None,
        Duration::from_secs(5),
    );
    let client = Arc::new(ApiClient::new(&server.uri(), None).unwrap());
    let poller = TaskPoller::new(client, "vm-abc", Duration::from_millis(50));

    let err = scheduler
        .run(Mode::Api(poller), std::future::pending::<()>())
        .await
        .unwrap_err();
    assert!(err.is_fatal());
}
