//! Application configuration structures.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::target::NodeLabel;

use super::validation::{ConfigError, expand_env_vars};

// =============================================================================
// Constants
// =============================================================================

/// Default output directory for collected reports.
pub const DEFAULT_OUTPUT_DIR: &str = "/logs";

/// Default namespace of the GPU operator driver pods.
pub const DEFAULT_NAMESPACE: &str = "nvidia-gpu-operator";

/// Default name prefix of driver pods.
pub const DEFAULT_POD_PREFIX: &str = "nvidia-gpu-driver";

/// Default collection interval (1 hour).
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(3600);

/// Default bound on one collection cycle (5 minutes).
pub const DEFAULT_COLLECTION_TIMEOUT: Duration = Duration::from_secs(300);

/// Default task API poll interval (60 seconds).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Default number of reports kept on disk.
pub const DEFAULT_MAX_LOGS_TO_KEEP: usize = 1;

/// Default task API base URL.
pub const DEFAULT_API_BASE_URL: &str = "https://cms-monitoring.crusoecloud.com";

/// Default path of the bundled report tool.
pub const DEFAULT_LOCAL_TOOL_PATH: &str = "/usr/bin/nvidia-bug-report.sh";

/// Node label marking hosts whose driver is not run by the GPU operator.
pub const DEFAULT_LOCAL_TOOL_LABEL: &str = "nvidia.com/gpu.deploy.driver=false";

/// Report command run inside the driver container.
pub const DEFAULT_REMOTE_TOOL: &str = "nvidia-bug-report.sh";

/// Directory inside the driver container where reports are written.
pub const DEFAULT_REMOTE_DIR: &str = "/tmp";

/// Substring identifying the driver container in multi-container pods.
pub const DEFAULT_CONTAINER_HINT: &str = "driver";

fn default_output_dir() -> PathBuf {
    PathBuf::from(DEFAULT_OUTPUT_DIR)
}

fn default_max_logs_to_keep() -> usize {
    DEFAULT_MAX_LOGS_TO_KEEP
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_pod_prefix() -> String {
    DEFAULT_POD_PREFIX.to_string()
}

fn default_container_hint() -> String {
    DEFAULT_CONTAINER_HINT.to_string()
}

fn default_remote_tool() -> String {
    DEFAULT_REMOTE_TOOL.to_string()
}

fn default_remote_dir() -> String {
    DEFAULT_REMOTE_DIR.to_string()
}

fn default_local_tool_path() -> PathBuf {
    PathBuf::from(DEFAULT_LOCAL_TOOL_PATH)
}

fn default_local_tool_label() -> Option<String> {
    Some(DEFAULT_LOCAL_TOOL_LABEL.to_string())
}

fn default_interval() -> Duration {
    DEFAULT_INTERVAL
}

fn default_timeout() -> Duration {
    DEFAULT_COLLECTION_TIMEOUT
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// =============================================================================
// Sections
// =============================================================================

/// Identity of the node this agent runs on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Kubernetes node name (default: hostname).
    #[serde(default)]
    pub name: Option<String>,

    /// VM identity for the task API (default: read from DMI).
    #[serde(default)]
    pub vm_id: Option<String>,
}

/// Local artifact storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory receiving collected reports (default: "/logs").
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,

    /// Number of reports retained per directory (default: 1).
    #[serde(default = "default_max_logs_to_keep")]
    pub max_logs_to_keep: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            max_logs_to_keep: DEFAULT_MAX_LOGS_TO_KEEP,
        }
    }
}

/// Driver pod discovery and remote report generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Namespace of the driver pods (default: "nvidia-gpu-operator").
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Driver pod name prefix (default: "nvidia-gpu-driver").
    #[serde(default = "default_pod_prefix")]
    pub pod_prefix: String,

    /// Substring matched against container names (default: "driver").
    #[serde(default = "default_container_hint")]
    pub container_hint: String,

    /// Container used when no name matches the hint (default: first container).
    #[serde(default)]
    pub fallback_container: Option<String>,

    /// Report command inside the driver container.
    #[serde(default = "default_remote_tool")]
    pub remote_tool: String,

    /// Directory inside the driver container for generated reports.
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            pod_prefix: default_pod_prefix(),
            container_hint: default_container_hint(),
            fallback_container: None,
            remote_tool: default_remote_tool(),
            remote_dir: default_remote_dir(),
        }
    }
}

/// Bundled report tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalToolConfig {
    /// Path of the bundled executable.
    #[serde(default = "default_local_tool_path")]
    pub path: PathBuf,

    /// `key=value` node label selecting the bundled tool; `None` disables the lookup.
    #[serde(default = "default_local_tool_label")]
    pub node_label: Option<String>,

    /// Always use the bundled tool and never talk to Kubernetes.
    #[serde(default)]
    pub force: bool,
}

impl Default for LocalToolConfig {
    fn default() -> Self {
        Self {
            path: default_local_tool_path(),
            node_label: default_local_tool_label(),
            force: false,
        }
    }
}

/// Scheduling policy and cycle bound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Interval between collections (default: 1h).
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Run one collection and exit.
    #[serde(default)]
    pub run_once: bool,

    /// Bound on one collection cycle (default: 5m).
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            run_once: false,
            timeout: DEFAULT_COLLECTION_TIMEOUT,
        }
    }
}

/// Task API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable API-driven collection.
    #[serde(default)]
    pub enabled: bool,

    /// Service root; `agent/check-tasks` and `agent/upload-logs` are resolved against it.
    #[serde(default = "default_api_base_url")]
    pub base_url: String,

    /// Poll interval (default: 60s).
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Bearer token. Supports `${VAR}` expansion when loaded from a file.
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_api_base_url(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            token: None,
        }
    }
}

/// Log output format.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, e.g. "info" or "gpu_log_collector=debug".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (default: text).
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Node identity.
    #[serde(default)]
    pub node: NodeConfig,

    /// Artifact storage and retention.
    #[serde(default)]
    pub output: OutputConfig,

    /// Driver pod discovery.
    #[serde(default)]
    pub driver: DriverConfig,

    /// Bundled tool selection.
    #[serde(default)]
    pub local_tool: LocalToolConfig,

    /// Scheduling policy.
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Task API.
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// `${VAR}` references in the API token are expanded.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config: Self = serde_yaml::from_str(&content)?;
        if let Some(token) = config.api.token.as_deref() {
            config.api.token = Some(expand_env_vars(token));
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self
            .node
            .name
            .as_deref()
            .is_some_and(|name| name.trim().is_empty())
        {
            return Err(ConfigError::ValidationError(
                "node name cannot be empty".to_string(),
            ));
        }

        if self.output.max_logs_to_keep == 0 {
            return Err(ConfigError::ValidationError(
                "max_logs_to_keep must be at least 1".to_string(),
            ));
        }

        if self.driver.namespace.is_empty() {
            return Err(ConfigError::ValidationError(
                "driver namespace cannot be empty".to_string(),
            ));
        }

        if self.driver.pod_prefix.is_empty() {
            return Err(ConfigError::ValidationError(
                "driver pod prefix cannot be empty".to_string(),
            ));
        }

        if !self.driver.remote_dir.starts_with('/') {
            return Err(ConfigError::ValidationError(format!(
                "remote output dir must be absolute: '{}'",
                self.driver.remote_dir
            )));
        }

        if let Some(label) = &self.local_tool.node_label {
            NodeLabel::from_str(label).map_err(|e| {
                ConfigError::ValidationError(format!("local tool node label: {}", e))
            })?;
        }

        if self.schedule.interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "collection interval must be non-zero".to_string(),
            ));
        }

        if self.schedule.timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "collection timeout must be non-zero".to_string(),
            ));
        }

        if self.api.enabled {
            if self.schedule.run_once {
                return Err(ConfigError::ValidationError(
                    "API-driven mode and run-once mode are mutually exclusive".to_string(),
                ));
            }

            if self.api.poll_interval.is_zero() {
                return Err(ConfigError::ValidationError(
                    "API poll interval must be non-zero".to_string(),
                ));
            }

            let url = url::Url::parse(&self.api.base_url).map_err(|e| {
                ConfigError::ValidationError(format!(
                    "invalid API base URL '{}': {}",
                    self.api.base_url, e
                ))
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ConfigError::ValidationError(format!(
                    "API base URL must be http or https: '{}'",
                    self.api.base_url
                )));
            }
        }

        Ok(())
    }

    /// Node name from configuration, falling back to the hostname.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` if neither is available.
    pub fn node_name(&self) -> Result<String, ConfigError> {
        if let Some(name) = &self.node.name {
            return Ok(name.clone());
        }
        whoami::fallible::hostname()
            .ok()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| {
                ConfigError::ValidationError(
                    "node name not set and hostname unavailable (set NODE_NAME)".to_string(),
                )
            })
    }

    /// Parsed bundled-tool node label, if configured.
    pub fn local_tool_label(&self) -> Option<NodeLabel> {
        self.local_tool
            .node_label
            .as_deref()
            .and_then(|label| NodeLabel::from_str(label).ok())
    }
}
