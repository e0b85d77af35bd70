use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response}
};
use model_fetch::format_bytes;

use crate::models::FailInfo;

/// Why a download was rejected or how it ended unsuccessfully.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error(
        "insufficient disk space: {} required (including safety margin), {} available",
        human(.required),
        human(.available)
    )]
    InsufficientSpace { required: u64, available: u64 },

    #[error("transfer failed: {0}")]
    Transport(String),

    #[error("model {model_id} is gated: accept its license on the hub, then retry")]
    Gated { model_id: String },

    #[error("model fetcher exited with code {}: {message}", exit_code(.code))]
    ProcessExit { code: Option<i32>, message: String },

    #[error("model fetcher exited cleanly but could not find result in its output")]
    MissingResult,

    #[error("download failed: {0}")]
    Remote(String),

    #[error("download cancelled")]
    Cancelled,

    #[error("failed to run model fetcher: {0}")]
    Fetch(#[from] model_fetch::Error),

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error)
}

fn human(bytes: &u64) -> String {
    format_bytes(*bytes)
}

fn exit_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "none (killed by signal)".to_string(), |c| c.to_string())
}

impl DownloadError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Terminal failure record for the registry.
    pub fn to_fail_info(&self) -> FailInfo {
        match self {
            Self::Gated { .. } => FailInfo {
                error: "gated_repo".to_string(),
                message: Some(self.to_string()),
                requires_license: true
            },
            other => FailInfo::new(other.to_string())
        }
    }
}

#[derive(Debug)]
pub struct AppError {
    pub message: String,
    pub status: StatusCode
}

impl AppError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: StatusCode::NOT_FOUND
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: StatusCode::CONFLICT
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!("handler error: {}", self.message);
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

impl From<DownloadError> for AppError {
    fn from(err: DownloadError) -> Self {
        let status = match &err {
            DownloadError::Validation(_) => StatusCode::BAD_REQUEST,
            DownloadError::InsufficientSpace { .. } => StatusCode::INSUFFICIENT_STORAGE,
            DownloadError::Gated { .. } => StatusCode::FORBIDDEN,
            DownloadError::Transport(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR
        };
        Self {
            message: err.to_string(),
            status
        }
    }
}
