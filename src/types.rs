//! Core data types shared by the collection pipeline.
//!
//! - [`CollectionTask`]: one collection attempt for this node
//! - [`CollectionTarget`]: where the report is generated (bundled tool or driver pod)
//! - [`CollectionResult`]: outcome of one attempt
//! - [`ArtifactName`]: the on-disk naming convention for collected reports

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::error::CollectorError;

/// File name prefix of every collected report.
pub const REPORT_PREFIX: &str = "nvidia-bug-report";

/// Extension of a compressed report.
pub const COMPRESSED_EXTENSION: &str = "log.gz";

/// Extension of an uncompressed report.
pub const UNCOMPRESSED_EXTENSION: &str = "log";

/// Timestamp layout embedded in artifact names.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Length of a rendered [`TIMESTAMP_FORMAT`] value.
const TIMESTAMP_LEN: usize = 15;

/// One collection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionTask {
    /// Node the report is collected for.
    pub node_name: String,
    /// Correlation id from the task API (API-driven mode only).
    pub event_id: Option<String>,
    /// VM identity the task API knows this node by.
    pub vm_id: Option<String>,
    /// When the attempt was requested.
    pub requested_at: DateTime<Utc>,
}

impl CollectionTask {
    /// A task created by the scheduler itself (interval or one-shot mode).
    pub fn scheduled(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            event_id: None,
            vm_id: None,
            requested_at: Utc::now(),
        }
    }

    /// A task delivered by the task API.
    pub fn from_event(
        node_name: impl Into<String>,
        vm_id: impl Into<String>,
        event_id: impl Into<String>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            event_id: Some(event_id.into()),
            vm_id: Some(vm_id.into()),
            requested_at: Utc::now(),
        }
    }
}

/// Where the report is generated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CollectionTarget {
    /// Report tool bundled into this agent's own container.
    LocalTool {
        /// Path of the bundled executable.
        path: PathBuf,
    },
    /// Driver container inside a GPU driver pod.
    RemotePod {
        /// Pod namespace.
        namespace: String,
        /// Pod name.
        pod_name: String,
        /// Container to exec into.
        container_name: String,
    },
}

impl CollectionTarget {
    /// Whether the target is the bundled local tool.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::LocalTool { .. })
    }
}

impl fmt::Display for CollectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalTool { path } => write!(f, "local:{}", path.display()),
            Self::RemotePod {
                namespace,
                pod_name,
                container_name,
            } => write!(f, "pod:{}/{}[{}]", namespace, pod_name, container_name),
        }
    }
}

/// Outcome class of a collection attempt.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum CollectionStatus {
    /// Report generated and stored.
    Success,
    /// Resolution, execution or transfer failed.
    Failure,
    /// The cycle exceeded its time bound.
    Timeout,
}

/// Result of one collection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionResult {
    /// Outcome class.
    pub status: CollectionStatus,
    /// Local artifact, present on success.
    pub artifact_path: Option<PathBuf>,
    /// Human-readable detail.
    pub message: String,
    /// Wall-clock time spent in the cycle.
    pub duration: Duration,
}

impl CollectionResult {
    /// Successful collection of `artifact`.
    pub fn success(artifact: PathBuf, duration: Duration) -> Self {
        let message = format!("collected {}", artifact.display());
        Self {
            status: CollectionStatus::Success,
            artifact_path: Some(artifact),
            message,
            duration,
        }
    }

    /// Failed collection. A [`CollectorError::Timeout`] yields
    /// [`CollectionStatus::Timeout`], everything else [`CollectionStatus::Failure`].
    pub fn from_error(err: &CollectorError, duration: Duration) -> Self {
        let status = match err {
            CollectorError::Timeout(_) => CollectionStatus::Timeout,
            _ => CollectionStatus::Failure,
        };
        Self {
            status,
            artifact_path: None,
            message: err.to_string(),
            duration,
        }
    }

    /// Whether the attempt succeeded.
    pub fn is_success(&self) -> bool {
        self.status == CollectionStatus::Success
    }
}

/// Deterministic artifact name:
/// `nvidia-bug-report-<node>[-<event_id>]-<YYYYMMDD_HHMMSS>.log.gz`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    node_name: String,
    event_id: Option<String>,
    timestamp: NaiveDateTime,
}

impl ArtifactName {
    /// Create a name for the given node, optional event and timestamp.
    ///
    /// Path separators inside the node name or event id are replaced so the
    /// result is always a single path component.
    pub fn new(
        node_name: impl AsRef<str>,
        event_id: Option<&str>,
        timestamp: NaiveDateTime,
    ) -> Self {
        Self {
            node_name: sanitize(node_name.as_ref()),
            event_id: event_id.map(sanitize),
            timestamp,
        }
    }

    /// Name for `task`, stamped with the current local time.
    pub fn for_task(task: &CollectionTask) -> Self {
        Self::new(
            &task.node_name,
            task.event_id.as_deref(),
            Local::now().naive_local(),
        )
    }

    /// Timestamp component.
    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }

    /// Name passed to `nvidia-bug-report.sh --output-file`; the tool appends `.gz`.
    pub fn output_base(&self) -> String {
        format!("{}.{}", self.stem(), UNCOMPRESSED_EXTENSION)
    }

    /// Final compressed file name.
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.stem(), COMPRESSED_EXTENSION)
    }

    fn stem(&self) -> String {
        let ts = self.timestamp.format(TIMESTAMP_FORMAT);
        match &self.event_id {
            Some(event_id) => format!("{}-{}-{}-{}", REPORT_PREFIX, self.node_name, event_id, ts),
            None => format!("{}-{}-{}", REPORT_PREFIX, self.node_name, ts),
        }
    }

    /// Whether `file_name` follows the report naming convention
    /// (compressed or uncompressed).
    pub fn is_report_file(file_name: &str) -> bool {
        file_name.starts_with(&format!("{}-", REPORT_PREFIX))
            && (file_name.ends_with(&format!(".{}", COMPRESSED_EXTENSION))
                || file_name.ends_with(&format!(".{}", UNCOMPRESSED_EXTENSION)))
    }

    /// Extract the timestamp component from a report file name.
    ///
    /// Returns `None` when the name does not follow the convention.
    pub fn parse_timestamp(file_name: &str) -> Option<NaiveDateTime> {
        if !Self::is_report_file(file_name) {
            return None;
        }
        let stem = file_name
            .strip_suffix(&format!(".{}", COMPRESSED_EXTENSION))
            .or_else(|| file_name.strip_suffix(&format!(".{}", UNCOMPRESSED_EXTENSION)))?;
        let split = stem.len().checked_sub(TIMESTAMP_LEN)?;
        if split == 0 || !stem.is_char_boundary(split) {
            return None;
        }
        let (head, ts) = stem.split_at(split);
        if !head.ends_with('-') {
            return None;
        }
        NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT).ok()
    }

    /// Path of this artifact inside `dir`.
    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(self.file_name())
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::str::FromStr;

    fn ts(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 14)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn test_artifact_name_without_event() {
        let name = ArtifactName::new("gpu-node-1", None, ts(9, 5, 7));
        assert_eq!(
            name.file_name(),
            "nvidia-bug-report-gpu-node-1-20250314_090507.log.gz"
        );
        assert_eq!(
            name.output_base(),
            "nvidia-bug-report-gpu-node-1-20250314_090507.log"
        );
    }

    #[test]
    fn test_artifact_name_with_event_is_distinct() {
        let plain = ArtifactName::new("gpu-node-1", None, ts(9, 5, 7));
        let evented = ArtifactName::new("gpu-node-1", Some("12345"), ts(9, 5, 7));

        assert_eq!(
            evented.file_name(),
            "nvidia-bug-report-gpu-node-1-12345-20250314_090507.log.gz"
        );
        assert_ne!(plain.file_name(), evented.file_name());

        // Both remain valid under the convention and carry the same timestamp.
        for name in [&plain, &evented] {
            assert!(ArtifactName::is_report_file(&name.file_name()));
            assert_eq!(
                ArtifactName::parse_timestamp(&name.file_name()),
                Some(ts(9, 5, 7))
            );
        }
    }

    #[test]
    fn test_artifact_name_sanitizes_separators() {
        let name = ArtifactName::new("node/a", Some("ev 1"), ts(0, 0, 0));
        assert_eq!(
            name.file_name(),
            "nvidia-bug-report-node_a-ev_1-20250314_000000.log.gz"
        );
    }

    #[test]
    fn test_artifact_names_order_by_time() {
        let earlier = ArtifactName::new("n", None, ts(1, 0, 0)).file_name();
        let later = ArtifactName::new("n", None, ts(13, 0, 0)).file_name();
        assert!(earlier < later);
    }

    #[test]
    fn test_parse_timestamp_rejects_foreign_names() {
        assert_eq!(ArtifactName::parse_timestamp("notes.txt"), None);
        assert_eq!(
            ArtifactName::parse_timestamp("nvidia-bug-report-node.log.gz"),
            None
        );
        assert_eq!(
            ArtifactName::parse_timestamp("nvidia-bug-report-node-2025_bad.log.gz"),
            None
        );
        assert_eq!(
            ArtifactName::parse_timestamp("nvidia-bug-report-n-20250314_090507.log"),
            Some(ts(9, 5, 7))
        );
    }

    #[test]
    fn test_collection_status_strings() {
        assert_eq!(CollectionStatus::Success.to_string(), "success");
        assert_eq!(CollectionStatus::Timeout.as_ref(), "timeout");
        assert_eq!(
            CollectionStatus::from_str("FAILURE").unwrap(),
            CollectionStatus::Failure
        );
    }

    #[test]
    fn test_result_from_timeout_error() {
        let err = CollectorError::Timeout(Duration::from_secs(5));
        let result = CollectionResult::from_error(&err, Duration::from_secs(5));
        assert_eq!(result.status, CollectionStatus::Timeout);
        assert!(!result.is_success());
        assert!(result.artifact_path.is_none());

        let err = CollectorError::Transfer("empty".to_string());
        let result = CollectionResult::from_error(&err, Duration::from_secs(1));
        assert_eq!(result.status, CollectionStatus::Failure);
        assert!(result.message.contains("empty"));
    }

    #[test]
    fn test_target_display() {
        let target = CollectionTarget::RemotePod {
            namespace: "nvidia-gpu-operator".to_string(),
            pod_name: "nvidia-gpu-driver-abc".to_string(),
            container_name: "nvidia-driver-ctr".to_string(),
        };
        assert_eq!(
            target.to_string(),
            "pod:nvidia-gpu-operator/nvidia-gpu-driver-abc[nvidia-driver-ctr]"
        );
        assert!(!target.is_local());

        let local = CollectionTarget::LocalTool {
            path: PathBuf::from("/usr/bin/nvidia-bug-report.sh"),
        };
        assert_eq!(local.to_string(), "local:/usr/bin/nvidia-bug-report.sh");
    }
}
