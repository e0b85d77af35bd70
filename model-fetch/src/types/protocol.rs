use std::path::PathBuf;

use serde::Deserialize;

/// A `{"type": "progress", ...}` line emitted while the helper runs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressLine {
    #[serde(default, alias = "download_id")]
    pub download_id: Option<String>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, alias = "downloaded_bytes")]
    pub downloaded_bytes: Option<u64>,
    #[serde(default, alias = "total_bytes")]
    pub total_bytes: Option<u64>
}

impl ProgressLine {
    /// Percentage rounded and clamped to `0..=100`.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn percent(&self) -> Option<u8> {
        self.progress
            .filter(|p| p.is_finite())
            .map(|p| p.round().clamp(0.0, 100.0) as u8)
    }
}

/// The final result object, recognised by the presence of a `success` key.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FetchResult {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, alias = "modelId")]
    pub model_id: Option<String>,
    #[serde(default, alias = "path", alias = "local_dir", alias = "outputPath")]
    pub output_path: Option<PathBuf>
}

impl FetchResult {
    pub fn is_gated(&self) -> bool {
        self.error.as_deref() == Some("gated_repo")
    }
}

/// How a helper run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Completed {
        output_path: Option<PathBuf>,
        message: Option<String>
    },
    /// The remote repository requires licence acceptance.
    Gated {
        model_id: Option<String>,
        message: Option<String>
    },
    Failed {
        error: String,
        exit_code: Option<i32>
    },
    /// Exit code 0 but no result object on stdout.
    MissingResult,
    /// Non-zero exit without a parseable result.
    Exited {
        exit_code: Option<i32>,
        stderr: String
    }
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Completed { .. })
    }
}

#[derive(Debug, Clone)]
pub enum FetchEvent {
    Spawned { pid: Option<u32> },
    Progress(ProgressLine),
    Finished(FetchOutcome)
}

impl FetchEvent {
    pub fn is_finished(&self) -> bool {
        matches!(self, FetchEvent::Finished(_))
    }
}
