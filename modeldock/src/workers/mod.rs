mod download;
mod preflight;
mod stream;

use std::io;
use std::path::Path;

use serde::Serialize;

pub use download::{ModelDownloader, ModelRequest};
pub use preflight::{DiskSpace, Fs2Disk, HubManifest, SizeProbe, DEFAULT_SPACE_MARGIN_PERCENT};
pub use stream::{FileDownloader, FileRequest};

#[cfg(test)]
pub(crate) use preflight::fakes;

/// Result of asking a worker to start a download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOutcome {
    pub job_id: String,
    /// Set when the resource was already downloading; `job_id` is that job.
    pub already_in_progress: bool
}

impl StartOutcome {
    fn started(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            already_in_progress: false
        }
    }

    fn existing(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            already_in_progress: true
        }
    }
}

/// Best-effort removal of partial output after a cancel or failure.
async fn remove_partial(path: &Path) {
    let result = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) => Err(e)
    };
    match result {
        Ok(()) => tracing::info!(path = %path.display(), "removed partial output"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), "failed to remove partial output: {}", e)
    }
}
