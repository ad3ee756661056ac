//! API Task Client
//!
//! In API-driven mode the agent does not collect on a timer. It polls
//! `GET <base>/check-tasks?vm_id=<id>` for a pending request and answers each
//! one with a single `POST <base>/upload-logs`:
//!
//! - success: multipart form with the report in a `file` part plus
//!   `vm_id`, `event_id`, `node_name`, `status=success`, `message`
//! - failure: JSON `{vm_id, event_id, status: "failed", message, node_name}`
//!
//! 401/403 responses are fatal; everything else is retried on the next tick.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{Interval, MissedTickBehavior};
use url::Url;

use crate::config::ConfigError;
use crate::error::CollectorError;
use crate::types::{CollectionResult, CollectionTask};

/// Path of the task poll endpoint, relative to the base URL.
pub const CHECK_TASKS_PATH: &str = "agent/check-tasks";

/// Path of the report endpoint, relative to the base URL.
pub const UPLOAD_LOGS_PATH: &str = "agent/upload-logs";

/// Timeout of a poll request.
const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout of a report upload.
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout of a status-only report.
const STATUS_TIMEOUT: Duration = Duration::from_secs(10);

/// Default message of a successful upload.
const SUCCESS_MESSAGE: &str = "Logs collected and uploaded successfully";

// =============================================================================
// Errors
// =============================================================================

/// Errors raised by the task API client.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The API rejected the bearer token.
    #[error("authentication rejected ({0})")]
    Auth(StatusCode),

    /// Transport failure (connect, timeout, TLS, body).
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Unexpected response status.
    #[error("unexpected response {status}: {body}")]
    Status {
        /// Response status.
        status: StatusCode,
        /// Response body, for diagnostics.
        body: String,
    },

    /// Reading the report file failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    /// Whether the error is an authentication failure.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

impl From<ApiError> for CollectorError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Auth(status) => {
                CollectorError::Auth(format!("task API returned {}", status))
            }
            ApiError::Io(e) => CollectorError::Io(e),
            other => CollectorError::Transfer(other.to_string()),
        }
    }
}

// =============================================================================
// Wire types
// =============================================================================

/// A collection request delivered by the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTask {
    /// Correlation id of the request.
    pub event_id: String,
}

#[derive(Debug, Deserialize)]
struct CheckTasksResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    event_id: Option<serde_json::Value>,
}

impl CheckTasksResponse {
    fn into_task(self) -> Option<PendingTask> {
        if self.status.as_deref() != Some("success") {
            return None;
        }
        let event_id = match self.event_id? {
            serde_json::Value::String(s) => s,
            serde_json::Value::Number(n) => n.to_string(),
            _ => return None,
        };
        (!event_id.is_empty()).then_some(PendingTask { event_id })
    }
}

/// Report status on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    /// Report attached.
    Success,
    /// Collection failed; message explains why.
    Failed,
}

impl ReportStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// The outcome of one task, as reported to the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    /// VM identity.
    pub vm_id: String,
    /// Correlation id of the task.
    pub event_id: String,
    /// Node the report was collected on.
    pub node_name: String,
    /// Outcome.
    pub status: ReportStatus,
    /// Human-readable detail.
    pub message: String,
    /// Report file (success only).
    pub artifact: Option<PathBuf>,
}

impl TaskReport {
    /// Build the report for `task` from a cycle result.
    ///
    /// Timeouts and failures are both reported as `failed`.
    pub fn from_result(task: &CollectionTask, vm_id: &str, result: &CollectionResult) -> Self {
        let (status, artifact) = match (&result.artifact_path, result.is_success()) {
            (Some(path), true) => (ReportStatus::Success, Some(path.clone())),
            _ => (ReportStatus::Failed, None),
        };
        Self {
            vm_id: vm_id.to_string(),
            event_id: task.event_id.clone().unwrap_or_default(),
            node_name: task.node_name.clone(),
            status,
            message: result.message.clone(),
            artifact,
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusBody<'a> {
    vm_id: &'a str,
    event_id: &'a str,
    status: ReportStatus,
    message: &'a str,
    node_name: &'a str,
}

// =============================================================================
// Client
// =============================================================================

/// HTTP client for the task API.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    check_url: Url,
    upload_url: Url,
    token: Option<String>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("check_url", &self.check_url.as_str())
            .field("upload_url", &self.upload_url.as_str())
            .field("token", &self.token.as_ref().map(|_| "***"))
            .finish()
    }
}

impl ApiClient {
    /// Create a client for `base_url`.
    ///
    /// # Errors
    /// `ConfigError::ValidationError` if the URL is invalid or the HTTP
    /// client cannot be built.
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, ConfigError> {
        let mut base = Url::parse(base_url).map_err(|e| {
            ConfigError::ValidationError(format!("invalid API base URL '{}': {}", base_url, e))
        })?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let join = |path: &str| {
            base.join(path).map_err(|e| {
                ConfigError::ValidationError(format!("invalid API URL for {}: {}", path, e))
            })
        };
        let check_url = join(CHECK_TASKS_PATH)?;
        let upload_url = join(UPLOAD_LOGS_PATH)?;

        let client = Client::builder()
            .user_agent(concat!("gpu-log-collector/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::ValidationError(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            check_url,
            upload_url,
            token: token.filter(|t| !t.is_empty()),
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Ask the API whether a collection is pending for `vm_id`.
    ///
    /// # Errors
    /// `ApiError::Auth` on 401/403; other errors are transient.
    pub async fn check_tasks(&self, vm_id: &str) -> Result<Option<PendingTask>, ApiError> {
        let request = self
            .client
            .get(self.check_url.clone())
            .query(&[("vm_id", vm_id)])
            .timeout(CHECK_TIMEOUT);
        let response = self.authorize(request).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response).await?;
        let body: CheckTasksResponse = response.json().await?;
        Ok(body.into_task())
    }

    /// Send one report.
    ///
    /// A rejected success upload is followed by one failure report so the
    /// API always learns the outcome of the task.
    ///
    /// # Errors
    /// `ApiError::Auth` on 401/403, or the error of the final request.
    pub async fn report(&self, report: &TaskReport) -> Result<(), ApiError> {
        let artifact = match (&report.artifact, report.status) {
            (Some(path), ReportStatus::Success) => path,
            _ => return self.send_status(report, ReportStatus::Failed, &report.message).await,
        };

        match self.upload(report, artifact).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_auth() => Err(e),
            Err(e) => {
                tracing::warn!(
                    event_id = %report.event_id,
                    error = %e,
                    "Report upload failed, sending failure status"
                );
                let message = format!("Log collection succeeded but upload failed: {}", e);
                self.send_status(report, ReportStatus::Failed, &message).await
            }
        }
    }

    async fn upload(&self, report: &TaskReport, artifact: &Path) -> Result<(), ApiError> {
        let data = tokio::fs::read(artifact).await?;
        let file_name = artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "report.log.gz".to_string());
        let size = data.len();

        let part = Part::bytes(data)
            .file_name(file_name.clone())
            .mime_str("application/gzip")?;
        let message = if report.message.is_empty() {
            SUCCESS_MESSAGE.to_string()
        } else {
            report.message.clone()
        };
        let form = Form::new()
            .part("file", part)
            .text("vm_id", report.vm_id.clone())
            .text("event_id", report.event_id.clone())
            .text("node_name", report.node_name.clone())
            .text("status", ReportStatus::Success.as_str())
            .text("message", message);

        tracing::info!(
            event_id = %report.event_id,
            file = %file_name,
            bytes = size,
            "Uploading report"
        );

        let request = self
            .client
            .post(self.upload_url.clone())
            .multipart(form)
            .timeout(UPLOAD_TIMEOUT);
        check_status(self.authorize(request).send().await?).await?;

        tracing::info!(event_id = %report.event_id, "Reported success");
        Ok(())
    }

    async fn send_status(
        &self,
        report: &TaskReport,
        status: ReportStatus,
        message: &str,
    ) -> Result<(), ApiError> {
        let body = StatusBody {
            vm_id: &report.vm_id,
            event_id: &report.event_id,
            status,
            message,
            node_name: &report.node_name,
        };

        tracing::info!(
            event_id = %report.event_id,
            status = status.as_str(),
            message = %message,
            "Reporting status"
        );

        let request = self
            .client
            .post(self.upload_url.clone())
            .json(&body)
            .timeout(STATUS_TIMEOUT);
        check_status(self.authorize(request).send().await?).await?;
        Ok(())
    }
}

async fn check_status(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ApiError::Auth(status));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ApiError::Status { status, body });
    }
    Ok(response)
}

// =============================================================================
// Poller
// =============================================================================

/// Fixed-interval poll loop over [`ApiClient::check_tasks`].
#[derive(Debug)]
pub struct TaskPoller {
    client: Arc<ApiClient>,
    vm_id: String,
    ticker: Interval,
    delivered: bool,
}

impl TaskPoller {
    /// Create a poller. The first poll happens immediately.
    pub fn new(client: Arc<ApiClient>, vm_id: impl Into<String>, poll_interval: Duration) -> Self {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            client,
            vm_id: vm_id.into(),
            ticker,
            delivered: false,
        }
    }

    /// VM identity being polled for.
    pub fn vm_id(&self) -> &str {
        &self.vm_id
    }

    /// The underlying client, used to report results.
    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    /// Wait for the next pending task.
    ///
    /// Transient poll errors are logged and retried on the next tick. After a
    /// delivered task the next poll waits a full interval, however long the
    /// task took to handle.
    ///
    /// # Errors
    /// `ApiError::Auth` if the API rejects the token.
    pub async fn next_task(&mut self) -> Result<PendingTask, ApiError> {
        if std::mem::take(&mut self.delivered) {
            self.ticker.reset();
        }
        loop {
            self.ticker.tick().await;
            match self.client.check_tasks(&self.vm_id).await {
                Ok(Some(task)) => {
                    tracing::info!(event_id = %task.event_id, "Received collection task");
                    self.delivered = true;
                    return Ok(task);
                }
                Ok(None) => tracing::debug!(vm_id = %self.vm_id, "No pending tasks"),
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => tracing::warn!(vm_id = %self.vm_id, error = %e, "Task poll failed"),
            }
        }
    }
}

/// Read the VM identity from DMI (`dmidecode -s system-uuid`).
pub async fn detect_vm_id() -> Option<String> {
    let output = tokio::process::Command::new("dmidecode")
        .args(["-s", "system-uuid"])
        .output();
    let output = match tokio::time::timeout(Duration::from_secs(5), output).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Failed to run dmidecode");
            return None;
        }
        Err(_) => {
            tracing::warn!("dmidecode timed out");
            return None;
        }
    };
    if !output.status.success() {
        tracing::warn!(
            exit_code = ?output.status.code(),
            "dmidecode did not report a system uuid"
        );
        return None;
    }
    let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!id.is_empty()).then_some(id)
}
