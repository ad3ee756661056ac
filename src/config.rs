//! Configuration module.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Node identity and artifact storage
//! - Driver pod discovery and the bundled report tool
//! - Scheduling policy (interval, one-shot, API-driven) and cycle timeout
//! - Task API endpoint and credential
//!
//! Every option can also be supplied through the command line or the
//! environment (see `main.rs`); those override the file.

mod app;
mod validation;

pub use app::{
    ApiConfig, AppConfig, DriverConfig, LocalToolConfig, LogFormat, LoggingConfig, NodeConfig,
    OutputConfig, ScheduleConfig,
};
pub use validation::{ConfigError, expand_env_vars, parse_duration, parse_seconds_or_duration};

// Re-export constants
pub use app::{
    DEFAULT_API_BASE_URL, DEFAULT_COLLECTION_TIMEOUT, DEFAULT_INTERVAL, DEFAULT_LOCAL_TOOL_LABEL,
    DEFAULT_LOCAL_TOOL_PATH, DEFAULT_MAX_LOGS_TO_KEEP, DEFAULT_NAMESPACE, DEFAULT_OUTPUT_DIR,
    DEFAULT_POD_PREFIX, DEFAULT_POLL_INTERVAL, DEFAULT_REMOTE_DIR, DEFAULT_REMOTE_TOOL,
};
