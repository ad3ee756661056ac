//! GPU Log Collector
//!
//! Collects `nvidia-bug-report.sh` bundles from the GPU driver stack of a
//! Kubernetes node (or from a bundled copy of the tool on hosts without a
//! driver pod), stores them locally and optionally answers collection
//! requests from a remote task API.
//!
//! # Architecture
//!
//! - **Target**: bundled tool or driver pod container for this node
//! - **Exec**: runs the report tool locally or through pod exec
//! - **Transfer**: brings the compressed report into the output directory
//! - **Retention**: keeps the newest N reports
//! - **Scheduler**: interval, one-shot and API-driven policies with a
//!   per-cycle timeout
//! - **API**: task polling and result reporting
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use gpu_log_collector::{
//!     ArtifactTransfer, LocalExecutor, Mode, RetentionManager, RetentionPolicy, Scheduler,
//!     TargetExecutor, TargetResolver,
//! };
//!
//! let executor = Arc::new(TargetExecutor::new(LocalExecutor::new(), None));
//! let transfer = ArtifactTransfer::new(executor.clone(), "/logs", "/tmp");
//! let retention = RetentionManager::new("/logs", RetentionPolicy::new(1)?);
//! let scheduler = Scheduler::new("gpu-node-1", resolver, executor, transfer, retention);
//! scheduler.run(Mode::OneShot, shutdown).await?;
//! ```

pub mod api;
pub mod cluster;
pub mod config;
pub mod error;
pub mod exec;
pub mod logging;
pub mod retention;
pub mod scheduler;
pub mod target;
pub mod transfer;
pub mod types;

pub use api::{ApiClient, ApiError, PendingTask, ReportStatus, TaskPoller, TaskReport};
pub use cluster::{ClusterApi, ClusterError, KubeCluster, PodSummary};
pub use config::{AppConfig, ConfigError};
pub use error::CollectorError;
pub use exec::{ExecOutput, Executor, LocalExecutor, PodExecutor, TargetExecutor};
pub use retention::{RetentionManager, RetentionPolicy, RetentionSummary};
pub use scheduler::{CycleState, Mode, RunOutcome, Scheduler};
pub use target::{ContainerSelector, DriverPodRule, LocalToolRule, NodeLabel, TargetResolver};
pub use transfer::{ArtifactTransfer, STAGING_DIR_NAME};
pub use types::{
    ArtifactName, CollectionResult, CollectionStatus, CollectionTarget, CollectionTask,
};
