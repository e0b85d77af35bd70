use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Registered,
    Preparing,
    Downloading,
    Processing,
    Completed,
    Failed,
    Cancelled
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Preparing => "preparing",
            Self::Downloading => "downloading",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled"
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Registered => 0,
            Self::Preparing => 1,
            Self::Downloading => 2,
            Self::Processing => 3,
            Self::Completed | Self::Failed | Self::Cancelled => 4
        }
    }

    /// Forward-only: terminal states are sinks, and any non-terminal state may
    /// move to a later phase or straight to a terminal state.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        !self.is_terminal() && (next.is_terminal() || next.rank() > self.rank())
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Model snapshot fetched by the helper subprocess.
    #[default]
    Model,
    /// Single file streamed over HTTP.
    File
}

/// Full snapshot of one tracked download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub resource_key: String,
    pub status: JobStatus,
    pub progress: u8,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub speed: f64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub requires_license: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    pub start_time: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>
}

impl Job {
    pub fn new(id: impl Into<String>, metadata: JobMetadata) -> Self {
        Self {
            id: id.into(),
            kind: metadata.kind,
            resource_key: metadata.resource_key,
            status: JobStatus::Registered,
            progress: 0,
            bytes_downloaded: 0,
            total_bytes: metadata.total_bytes.unwrap_or(0),
            speed: 0.0,
            message: metadata.message.unwrap_or_else(|| "Registered".to_string()),
            error: None,
            requires_license: false,
            output_path: metadata.output_path,
            start_time: None,
            last_updated: Utc::now(),
            end_time: None
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Applies registration metadata to an existing job without touching its
    /// status. The resource key is fixed at creation, since the dedup guard
    /// holds it for the job's whole run.
    pub(crate) fn merge_metadata(&mut self, metadata: JobMetadata) {
        if !metadata.resource_key.is_empty() && metadata.resource_key != self.resource_key {
            tracing::warn!(
                job_id = %self.id,
                current = %self.resource_key,
                requested = %metadata.resource_key,
                "resource key change ignored"
            );
        }
        if let Some(message) = metadata.message {
            self.message = message;
        }
        if let Some(total) = metadata.total_bytes {
            self.total_bytes = total;
        }
        if metadata.output_path.is_some() {
            self.output_path = metadata.output_path;
        }
        self.last_updated = Utc::now();
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMetadata {
    pub resource_key: String,
    #[serde(default)]
    pub kind: JobKind,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub total_bytes: Option<u64>,
    #[serde(default)]
    pub output_path: Option<PathBuf>
}

impl JobMetadata {
    pub fn new(resource_key: impl Into<String>, kind: JobKind) -> Self {
        Self {
            resource_key: resource_key.into(),
            kind,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[must_use]
    pub fn total_bytes(mut self, total: u64) -> Self {
        self.total_bytes = Some(total);
        self
    }

    #[must_use]
    pub fn output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct StartInfo {
    pub status: JobStatus,
    pub message: Option<String>,
    pub total_bytes: Option<u64>
}

impl StartInfo {
    pub fn preparing(message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Preparing,
            message: Some(message.into()),
            total_bytes: None
        }
    }

    pub fn downloading(message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Downloading,
            message: Some(message.into()),
            total_bytes: None
        }
    }

    #[must_use]
    pub fn total_bytes(mut self, total: u64) -> Self {
        self.total_bytes = Some(total);
        self
    }
}

/// Partial update merged into a job; `None` fields are left as they are.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub bytes_downloaded: Option<u64>,
    pub total_bytes: Option<u64>,
    pub speed: Option<f64>,
    pub message: Option<String>
}

impl ProgressUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    #[must_use]
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompleteInfo {
    pub output_path: Option<PathBuf>,
    pub message: Option<String>
}

#[derive(Debug, Clone)]
pub struct FailInfo {
    pub error: String,
    pub message: Option<String>,
    pub requires_license: bool
}

impl FailInfo {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: None,
            requires_license: false
        }
    }
}

/// Exclusive cancellation capability held by a running job.
#[derive(Debug, Clone)]
pub enum CancelHandle {
    /// Abort signal for a streamed HTTP fetch.
    Abort(CancellationToken),
    /// Kill switch for a helper subprocess.
    Process {
        pid: Option<u32>,
        kill: CancellationToken
    }
}

impl CancelHandle {
    pub fn cancel(&self) {
        match self {
            Self::Abort(token) => token.cancel(),
            Self::Process { pid, kill } => {
                tracing::debug!(pid = ?pid, "killing model fetcher");
                kill.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_only_move_forward() {
        use JobStatus::*;
        assert!(Registered.can_transition_to(Preparing));
        assert!(Preparing.can_transition_to(Downloading));
        assert!(Downloading.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Downloading.can_transition_to(Failed));
        assert!(Preparing.can_transition_to(Cancelled));
        assert!(Registered.can_transition_to(Failed));
        assert!(Registered.can_transition_to(Cancelled));
        assert!(!Downloading.can_transition_to(Preparing));
        assert!(!Processing.can_transition_to(Downloading));
    }

    #[test]
    fn test_terminal_states_are_sinks() {
        use JobStatus::*;
        for terminal in [Completed, Failed, Cancelled] {
            for next in [Registered, Preparing, Downloading, Processing, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let job = Job::new("j1", JobMetadata::new("acme/7b", JobKind::Model));
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["resourceKey"], "acme/7b");
        assert_eq!(json["status"], "registered");
        assert_eq!(json["requiresLicense"], false);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_merge_metadata_keeps_status() {
        let mut job = Job::new("j1", JobMetadata::new("acme/7b", JobKind::Model));
        job.status = JobStatus::Downloading;
        job.merge_metadata(JobMetadata::new("", JobKind::Model).message("again").total_bytes(10));
        assert_eq!(job.status, JobStatus::Downloading);
        assert_eq!(job.resource_key, "acme/7b");
        assert_eq!(job.message, "again");
        assert_eq!(job.total_bytes, 10);
    }

    #[test]
    fn test_merge_metadata_never_changes_resource_key() {
        let mut job = Job::new("j1", JobMetadata::new("acme/7b", JobKind::Model));
        job.merge_metadata(JobMetadata::new("acme/13b", JobKind::Model).message("moved"));
        assert_eq!(job.resource_key, "acme/7b");
        assert_eq!(job.message, "moved");
    }
}
