//! GPU Log Collector Binary Entry Point
//!
//! Runs the collection agent for one node. Core functionality is provided by
//! the `gpu_log_collector` library crate.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use clap::builder::BoolishValueParser;
use gpu_log_collector::{
    ApiClient, ArtifactTransfer, ClusterApi, ContainerSelector, DriverPodRule, Executor,
    KubeCluster, LocalExecutor, LocalToolRule, Mode, PodExecutor, RetentionManager,
    RetentionPolicy, RunOutcome, Scheduler, TargetExecutor, TargetResolver, TaskPoller,
    api::detect_vm_id,
    config::{AppConfig, LogFormat, parse_seconds_or_duration},
    logging,
};

/// GPU Log Collector - NVIDIA driver bug report agent
#[derive(Parser, Debug)]
#[command(name = "gpu-log-collector", version, about, long_about = None)]
struct Cli {
    /// Path to an optional YAML configuration file
    #[arg(short, long, env = "GPU_LOG_COLLECTOR_CONFIG")]
    config: Option<PathBuf>,

    /// Node to collect for (default: hostname)
    #[arg(long, env = "NODE_NAME")]
    node_name: Option<String>,

    /// Directory receiving collected reports
    #[arg(long, env = "LOG_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Namespace of the driver pods
    #[arg(long, env = "NVIDIA_NAMESPACE")]
    namespace: Option<String>,

    /// Driver pod name prefix
    #[arg(long, env = "NVIDIA_DRIVER_POD_PREFIX")]
    pod_prefix: Option<String>,

    /// Interval between collections (seconds or "1h")
    #[arg(long, env = "COLLECTION_INTERVAL", value_parser = parse_seconds_or_duration)]
    interval: Option<Duration>,

    /// Collect once and exit
    #[arg(long, env = "RUN_ONCE", value_parser = BoolishValueParser::new(),
          num_args = 0..=1, default_missing_value = "true")]
    run_once: Option<bool>,

    /// Log filter, e.g. "info" or "gpu_log_collector=debug"
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum)]
    log_format: Option<LogFormat>,

    /// Number of reports to keep
    #[arg(long, env = "MAX_LOGS_TO_KEEP")]
    max_logs_to_keep: Option<usize>,

    /// Collect on requests from the task API
    #[arg(long, env = "API_ENABLED", value_parser = BoolishValueParser::new(),
          num_args = 0..=1, default_missing_value = "true")]
    api_enabled: Option<bool>,

    /// Task API base URL
    #[arg(long, env = "API_BASE_URL")]
    api_base_url: Option<String>,

    /// Task API poll interval (seconds or "1m")
    #[arg(long, env = "API_POLL_INTERVAL", value_parser = parse_seconds_or_duration)]
    api_poll_interval: Option<Duration>,

    /// Bound on one collection cycle (seconds or "5m")
    #[arg(long, env = "COLLECTION_TIMEOUT", value_parser = parse_seconds_or_duration)]
    collection_timeout: Option<Duration>,

    /// Bearer token for the task API
    #[arg(long, env = "CRUSOE_MONITORING_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// VM identity for the task API (default: DMI system uuid)
    #[arg(long, env = "VM_ID")]
    vm_id: Option<String>,

    /// Always use the bundled tool and never contact Kubernetes
    #[arg(long, env = "FORCE_LOCAL_TOOL", value_parser = BoolishValueParser::new(),
          num_args = 0..=1, default_missing_value = "true")]
    force_local_tool: Option<bool>,

    /// Path of the bundled report tool
    #[arg(long, env = "LOCAL_TOOL_PATH")]
    local_tool_path: Option<PathBuf>,

    /// Node label selecting the bundled tool (key=value, empty disables)
    #[arg(long, env = "LOCAL_TOOL_NODE_LABEL")]
    local_tool_node_label: Option<String>,

    /// Substring identifying the driver container
    #[arg(long, env = "DRIVER_CONTAINER_HINT")]
    container_hint: Option<String>,

    /// Container used when no name matches the hint
    #[arg(long, env = "DRIVER_CONTAINER_FALLBACK")]
    fallback_container: Option<String>,

    /// Directory inside the driver container for generated reports
    #[arg(long, env = "REMOTE_OUTPUT_DIR")]
    remote_output_dir: Option<String>,
}

impl Cli {
    /// Apply CLI/env overrides (CLI > ENV > config file).
    fn apply(self, config: &mut AppConfig) {
        if let Some(name) = self.node_name {
            config.node.name = Some(name);
        }
        if let Some(vm_id) = self.vm_id {
            config.node.vm_id = Some(vm_id);
        }
        if let Some(dir) = self.output_dir {
            config.output.dir = dir;
        }
        if let Some(max) = self.max_logs_to_keep {
            config.output.max_logs_to_keep = max;
        }
        if let Some(namespace) = self.namespace {
            config.driver.namespace = namespace;
        }
        if let Some(prefix) = self.pod_prefix {
            config.driver.pod_prefix = prefix;
        }
        if let Some(hint) = self.container_hint {
            config.driver.container_hint = hint;
        }
        if let Some(fallback) = self.fallback_container {
            config.driver.fallback_container = Some(fallback).filter(|f| !f.is_empty());
        }
        if let Some(dir) = self.remote_output_dir {
            config.driver.remote_dir = dir;
        }
        if let Some(force) = self.force_local_tool {
            config.local_tool.force = force;
        }
        if let Some(path) = self.local_tool_path {
            config.local_tool.path = path;
        }
        if let Some(label) = self.local_tool_node_label {
            config.local_tool.node_label = Some(label).filter(|l| !l.trim().is_empty());
        }
        if let Some(interval) = self.interval {
            config.schedule.interval = interval;
        }
        if let Some(run_once) = self.run_once {
            config.schedule.run_once = run_once;
        }
        if let Some(timeout) = self.collection_timeout {
            config.schedule.timeout = timeout;
        }
        if let Some(enabled) = self.api_enabled {
            config.api.enabled = enabled;
        }
        if let Some(url) = self.api_base_url {
            config.api.base_url = url;
        }
        if let Some(poll) = self.api_poll_interval {
            config.api.poll_interval = poll;
        }
        if let Some(token) = self.token {
            config.api.token = Some(token).filter(|t| !t.is_empty());
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match AppConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("failed to load {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        None => AppConfig::default(),
    };
    cli.apply(&mut config);

    if let Err(e) = config.validate() {
        eprintln!("invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }

    if let Err(e) = logging::init(&config.logging.level, config.logging.format) {
        eprintln!("failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "Collector stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AppConfig) -> Result<ExitCode, Box<dyn std::error::Error>> {
    tracing::info!("GPU Log Collector - NVIDIA driver bug report agent");

    let node_name = config.node_name()?;
    tracing::info!(
        node = %node_name,
        output_dir = %config.output.dir.display(),
        namespace = %config.driver.namespace,
        pod_prefix = %config.driver.pod_prefix,
        max_logs_to_keep = config.output.max_logs_to_keep,
        timeout = %humantime::format_duration(config.schedule.timeout),
        "Configuration loaded"
    );

    std::fs::create_dir_all(&config.output.dir)?;

    // Cluster access
    let cluster: Option<Arc<dyn ClusterApi>> = if config.local_tool.force {
        tracing::info!(
            tool = %config.local_tool.path.display(),
            "Bundled tool forced, Kubernetes access disabled"
        );
        None
    } else {
        let cluster = KubeCluster::connect().await.map_err(|e| {
            format!(
                "cannot reach Kubernetes ({}); set FORCE_LOCAL_TOOL=true on hosts without a cluster",
                e
            )
        })?;
        Some(Arc::new(cluster) as Arc<dyn ClusterApi>)
    };

    // Pipeline
    let resolver = TargetResolver::new(
        cluster.clone(),
        LocalToolRule {
            path: config.local_tool.path.clone(),
            label: config.local_tool_label(),
            force: config.local_tool.force,
        },
        DriverPodRule {
            namespace: config.driver.namespace.clone(),
            pod_prefix: config.driver.pod_prefix.clone(),
            containers: ContainerSelector::new(
                config.driver.container_hint.clone(),
                config.driver.fallback_container.clone(),
            ),
        },
    );
    let executor: Arc<dyn Executor> = Arc::new(TargetExecutor::new(
        LocalExecutor::new(),
        cluster.map(PodExecutor::new),
    ));
    let transfer = ArtifactTransfer::new(
        executor.clone(),
        config.output.dir.clone(),
        config.driver.remote_dir.clone(),
    );
    transfer.prepare().await?;
    let retention = RetentionManager::new(
        config.output.dir.clone(),
        RetentionPolicy::new(config.output.max_logs_to_keep)?,
    );
    let scheduler = Scheduler::new(node_name, resolver, executor, transfer, retention)
        .timeout(config.schedule.timeout)
        .remote_tool(config.driver.remote_tool.clone());

    // Scheduling policy
    let mode = if config.api.enabled {
        let vm_id = match config.node.vm_id.clone() {
            Some(id) => id,
            None => detect_vm_id()
                .await
                .ok_or("VM id unavailable: set VM_ID or run with access to dmidecode")?,
        };
        if config.api.token.is_none() {
            tracing::warn!("API mode enabled without CRUSOE_MONITORING_TOKEN; requests may be rejected");
        }
        let client = Arc::new(ApiClient::new(&config.api.base_url, config.api.token.clone())?);
        tracing::info!(
            vm_id = %vm_id,
            base_url = %config.api.base_url,
            poll_interval = %humantime::format_duration(config.api.poll_interval),
            "API-driven mode"
        );
        Mode::Api(TaskPoller::new(client, vm_id, config.api.poll_interval))
    } else if config.schedule.run_once {
        Mode::OneShot
    } else {
        Mode::Interval(config.schedule.interval)
    };

    let code = match scheduler.run(mode, shutdown_signal()).await? {
        RunOutcome::Completed(result) if result.is_success() => ExitCode::SUCCESS,
        RunOutcome::Completed(_) => ExitCode::FAILURE,
        RunOutcome::Stopped => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
    };
    Ok(code)
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }
}
