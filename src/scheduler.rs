//! Scheduler
//!
//! Drives collection cycles under one of three policies ([`Mode`]) around a
//! single shared [`Scheduler::run_cycle`]:
//!
//! ```text
//! Idle → Resolving → Executing → Transferring → Retaining → Idle
//!                        └───────────┴──→ TimedOut → Idle
//! ```
//!
//! Resolving through Transferring runs under the collection timeout. On
//! expiry the in-flight future is dropped; a local subprocess keeps running
//! detached and a remote one is left to finish on its own; whatever it
//! leaves in staging is swept once it is older than the timeout. Retention
//! runs outside the timeout, only after a successful transfer.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use strum_macros::{AsRefStr, Display};
use tokio::sync::watch;

use crate::api::{TaskPoller, TaskReport};
use crate::config::{DEFAULT_COLLECTION_TIMEOUT, DEFAULT_REMOTE_TOOL};
use crate::error::CollectorError;
use crate::exec::{Executor, report_command};
use crate::retention::RetentionManager;
use crate::target::TargetResolver;
use crate::transfer::ArtifactTransfer;
use crate::types::{ArtifactName, CollectionResult, CollectionStatus, CollectionTarget, CollectionTask};

/// Stage of the current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum CycleState {
    /// Between cycles.
    Idle,
    /// Looking up the target.
    Resolving,
    /// Report tool running.
    Executing,
    /// Report being copied into the output directory.
    Transferring,
    /// Old reports being trimmed.
    Retaining,
    /// The cycle exceeded its time bound.
    TimedOut,
}

/// Scheduling policy.
#[derive(Debug)]
pub enum Mode {
    /// Collect, then sleep the interval, forever.
    Interval(Duration),
    /// Collect once and return the result.
    OneShot,
    /// Collect whenever the task API delivers a request.
    Api(TaskPoller),
}

/// How [`Scheduler::run`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// One-shot mode finished its cycle.
    Completed(CollectionResult),
    /// The shutdown signal fired.
    Stopped,
}

/// Runs collection cycles for one node.
pub struct Scheduler {
    node_name: String,
    resolver: TargetResolver,
    executor: Arc<dyn Executor>,
    transfer: ArtifactTransfer,
    retention: RetentionManager,
    remote_tool: String,
    timeout: Duration,
    state: watch::Sender<CycleState>,
    last_target: Mutex<Option<CollectionTarget>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("node_name", &self.node_name)
            .field("resolver", &self.resolver)
            .field("transfer", &self.transfer)
            .field("retention", &self.retention)
            .field("timeout", &self.timeout)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Create a scheduler for `node_name`.
    pub fn new(
        node_name: impl Into<String>,
        resolver: TargetResolver,
        executor: Arc<dyn Executor>,
        transfer: ArtifactTransfer,
        retention: RetentionManager,
    ) -> Self {
        let (state, _) = watch::channel(CycleState::Idle);
        Self {
            node_name: node_name.into(),
            resolver,
            executor,
            transfer,
            retention,
            remote_tool: DEFAULT_REMOTE_TOOL.to_string(),
            timeout: DEFAULT_COLLECTION_TIMEOUT,
            state,
            last_target: Mutex::new(None),
        }
    }

    /// Set the bound on one cycle.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the report command used inside driver containers.
    pub fn remote_tool(mut self, tool: impl Into<String>) -> Self {
        self.remote_tool = tool.into();
        self
    }

    /// Node this scheduler collects for.
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Watch the cycle state.
    pub fn subscribe(&self) -> watch::Receiver<CycleState> {
        self.state.subscribe()
    }

    /// Current cycle state.
    pub fn state(&self) -> CycleState {
        *self.state.borrow()
    }

    fn set_state(&self, state: CycleState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Cycle state changed");
        }
    }

    fn remember_target(&self, target: Option<CollectionTarget>) {
        let mut guard = self
            .last_target
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = target;
    }

    fn target_label(&self) -> String {
        self.last_target
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "unresolved".to_string())
    }

    // =========================================================================
    // Cycle
    // =========================================================================

    /// Run one collection cycle. Never fails: every error becomes a
    /// non-success [`CollectionResult`].
    pub async fn run_cycle(&self, task: &CollectionTask) -> CollectionResult {
        let started = Instant::now();
        let name = ArtifactName::for_task(task);
        self.remember_target(None);

        tracing::info!(
            node = %task.node_name,
            event_id = task.event_id.as_deref().unwrap_or("-"),
            artifact = %name,
            "Starting collection cycle"
        );

        let outcome = tokio::time::timeout(self.timeout, self.collect(task, &name)).await;
        let elapsed = started.elapsed();

        let result = match outcome {
            Ok(Ok(artifact)) => {
                self.set_state(CycleState::Retaining);
                self.retain(&artifact).await;
                CollectionResult::success(artifact, elapsed)
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    node = %task.node_name,
                    collection_target = %self.target_label(),
                    kind = e.kind(),
                    error = %e,
                    "Collection failed"
                );
                CollectionResult::from_error(&e, elapsed)
            }
            Err(_) => {
                let stage = self.state();
                self.set_state(CycleState::TimedOut);
                tracing::warn!(
                    node = %task.node_name,
                    collection_target = %self.target_label(),
                    stage = %stage,
                    timeout = %humantime::format_duration(self.timeout),
                    "Collection timed out, abandoning in-flight work"
                );
                CollectionResult::from_error(&CollectorError::Timeout(self.timeout), elapsed)
            }
        };

        self.log_outcome(task, &result);
        self.set_state(CycleState::Idle);
        result
    }

    /// Trim old reports on the blocking pool, never removing `artifact`.
    async fn retain(&self, artifact: &Path) {
        let retention = self.retention.clone();
        let keep = artifact.to_path_buf();
        let outcome = tokio::task::spawn_blocking(move || retention.apply(Some(&keep))).await;
        match outcome {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(
                dir = %self.retention.dir().display(),
                error = %e,
                "Retention failed"
            ),
            Err(e) => tracing::warn!(
                dir = %self.retention.dir().display(),
                error = %e,
                "Retention task panicked"
            ),
        }
    }

    async fn collect(
        &self,
        task: &CollectionTask,
        name: &ArtifactName,
    ) -> Result<PathBuf, CollectorError> {
        self.transfer.prepare().await?;
        if let Err(e) = self.transfer.sweep_staging(self.timeout).await {
            tracing::warn!(
                dir = %self.transfer.staging_dir().display(),
                error = %e,
                "Failed to sweep staging directory"
            );
        }

        self.set_state(CycleState::Resolving);
        let target = self.resolver.resolve(&task.node_name).await?;
        self.remember_target(Some(target.clone()));
        tracing::info!(node = %task.node_name, collection_target = %target, "Resolved collection target");

        self.set_state(CycleState::Executing);
        let base = self.transfer.output_base(&target, name);
        let command = report_command(&target, &self.remote_tool, &base);
        let output = self.executor.execute(&target, &command).await?;
        if !output.success() {
            tracing::warn!(
                collection_target = %target,
                exit_code = ?output.exit_code,
                stderr = %output.stderr_lossy(),
                "Report tool exited with non-zero status"
            );
        }

        self.set_state(CycleState::Transferring);
        let produced = self.transfer.produced_path(&target, name);
        self.transfer.fetch(&target, &produced, name).await
    }

    fn log_outcome(&self, task: &CollectionTask, result: &CollectionResult) {
        let duration_ms = result.duration.as_millis() as u64;
        let event_id = task.event_id.as_deref().unwrap_or("-");
        let target = self.target_label();
        match result.status {
            CollectionStatus::Success => tracing::info!(
                node = %task.node_name,
                event_id,
                collection_target = %target,
                duration_ms,
                status = %result.status,
                artifact = ?result.artifact_path,
                "Collection cycle finished"
            ),
            CollectionStatus::Failure | CollectionStatus::Timeout => tracing::warn!(
                node = %task.node_name,
                event_id,
                collection_target = %target,
                duration_ms,
                status = %result.status,
                message = %result.message,
                "Collection cycle finished"
            ),
        }
    }

    // =========================================================================
    // Policies
    // =========================================================================

    /// Drive cycles under `mode` until it completes or `shutdown` resolves.
    ///
    /// Shutdown also interrupts a cycle in progress.
    ///
    /// # Errors
    /// `CollectorError::Auth` if the task API rejects the token.
    pub async fn run<F>(&self, mode: Mode, shutdown: F) -> Result<RunOutcome, CollectorError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        match mode {
            Mode::OneShot => {
                tracing::info!(node = %self.node_name, "Running single collection");
                let task = CollectionTask::scheduled(&self.node_name);
                tokio::select! {
                    result = self.run_cycle(&task) => Ok(RunOutcome::Completed(result)),
                    _ = &mut shutdown => Ok(RunOutcome::Stopped),
                }
            }

            Mode::Interval(every) => {
                tracing::info!(
                    node = %self.node_name,
                    interval = %humantime::format_duration(every),
                    "Running periodic collection"
                );
                loop {
                    let task = CollectionTask::scheduled(&self.node_name);
                    tokio::select! {
                        _ = self.run_cycle(&task) => {}
                        _ = &mut shutdown => return Ok(RunOutcome::Stopped),
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(every) => {}
                        _ = &mut shutdown => return Ok(RunOutcome::Stopped),
                    }
                }
            }

            Mode::Api(mut poller) => {
                tracing::info!(
                    node = %self.node_name,
                    vm_id = %poller.vm_id(),
                    "Waiting for collection tasks"
                );
                loop {
                    let pending = tokio::select! {
                        pending = poller.next_task() => pending?,
                        _ = &mut shutdown => return Ok(RunOutcome::Stopped),
                    };

                    let task =
                        CollectionTask::from_event(&self.node_name, poller.vm_id(), pending.event_id);
                    let result = tokio::select! {
                        result = self.run_cycle(&task) => result,
                        _ = &mut shutdown => return Ok(RunOutcome::Stopped),
                    };

                    let report = TaskReport::from_result(&task, poller.vm_id(), &result);
                    match poller.client().report(&report).await {
                        Ok(()) => {}
                        Err(e) if e.is_auth() => return Err(e.into()),
                        Err(e) => tracing::warn!(
                            event_id = %report.event_id,
                            error = %e,
                            "Failed to report collection result"
                        ),
                    }
                }
            }
        }
    }
}
