//! Collection error taxonomy.
//!
//! Every failure of a collection cycle maps onto one [`CollectorError`]
//! variant. All variants except [`CollectorError::Auth`] are caught at the
//! cycle boundary and converted into a failed
//! [`CollectionResult`](crate::CollectionResult); an auth failure stops the
//! API polling loop.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;

/// Errors that can occur while collecting a report.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// No eligible driver pod (or bundled tool) for this node.
    #[error("target not found: {0}")]
    TargetNotFound(String),

    /// The report command could not be invoked or crashed.
    #[error("execution error: {0}")]
    Execution(String),

    /// The artifact is missing, empty or unreadable after execution.
    #[error("transfer error: {0}")]
    Transfer(String),

    /// The cycle exceeded its time bound.
    #[error("collection timed out after {}", humantime::format_duration(*.0))]
    Timeout(Duration),

    /// The task API rejected our credential.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Local I/O failure outside of a transfer (e.g. preparing directories).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CollectorError {
    /// Short machine-friendly name of the error class, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TargetNotFound(_) => "target_not_found",
            Self::Execution(_) => "execution_error",
            Self::Transfer(_) => "transfer_error",
            Self::Timeout(_) => "timeout",
            Self::Auth(_) => "auth_error",
            Self::Config(_) => "config_error",
            Self::Io(_) => "io_error",
        }
    }

    /// Whether this error must stop the API polling loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CollectorError::TargetNotFound("no running driver pod on node-1".to_string());
        assert_eq!(
            err.to_string(),
            "target not found: no running driver pod on node-1"
        );

        let err = CollectorError::Timeout(Duration::from_secs(300));
        assert_eq!(err.to_string(), "collection timed out after 5m");
    }

    #[test]
    fn test_error_kind_distinguishes_transfer_from_execution() {
        let exec = CollectorError::Execution("pod deleted".to_string());
        let transfer = CollectorError::Transfer("zero-byte file".to_string());
        assert_eq!(exec.kind(), "execution_error");
        assert_eq!(transfer.kind(), "transfer_error");
        assert_ne!(exec.kind(), transfer.kind());
    }

    #[test]
    fn test_only_auth_is_fatal() {
        assert!(CollectorError::Auth("401".to_string()).is_fatal());
        assert!(!CollectorError::Timeout(Duration::from_secs(1)).is_fatal());
        assert!(!CollectorError::Execution("boom".to_string()).is_fatal());
    }
}
