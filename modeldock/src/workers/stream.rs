use std::path::PathBuf;
use std::sync::Arc;

use model_fetch::format_bytes;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use super::preflight::{ensure_space, DiskSpace, DEFAULT_SPACE_MARGIN_PERCENT};
use super::{remove_partial, StartOutcome};
use crate::error::DownloadError;
use crate::jobs::{ActiveClaim, ActiveDownloads, Claim, JobRegistry, ProgressSampler};
use crate::models::{CancelHandle, CompleteInfo, JobKind, JobMetadata, ProgressUpdate, StartInfo};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRequest {
    pub url: String,
    /// Target file name; defaults to the last URL path segment.
    #[serde(default)]
    pub filename: Option<String>
}

/// Streams single files over HTTP to disk.
pub struct FileDownloader {
    registry: Arc<JobRegistry>,
    active: Arc<ActiveDownloads>,
    client: reqwest::Client,
    disk: Arc<dyn DiskSpace>,
    files_dir: PathBuf,
    margin_percent: u64
}

impl FileDownloader {
    pub fn new(
        registry: Arc<JobRegistry>,
        active: Arc<ActiveDownloads>,
        client: reqwest::Client,
        disk: Arc<dyn DiskSpace>,
        files_dir: impl Into<PathBuf>
    ) -> Self {
        Self {
            registry,
            active,
            client,
            disk,
            files_dir: files_dir.into(),
            margin_percent: DEFAULT_SPACE_MARGIN_PERCENT
        }
    }

    #[must_use]
    pub fn with_margin(mut self, percent: u64) -> Self {
        self.margin_percent = percent;
        self
    }

    pub fn start(&self, request: FileRequest) -> Result<StartOutcome, DownloadError> {
        let url = reqwest::Url::parse(request.url.trim())
            .map_err(|e| DownloadError::Validation(format!("invalid url: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(DownloadError::Validation(format!("unsupported scheme: {}", url.scheme())));
        }
        let filename = target_filename(&url, request.filename.as_deref())?;

        let job_id = uuid7::uuid7().to_string();
        let claim = match self.active.claim(url.as_str(), &job_id) {
            Claim::Acquired(claim) => claim,
            Claim::Existing(existing) => {
                tracing::info!(url = %url, job_id = %existing, "download already in progress");
                return Ok(StartOutcome::existing(existing));
            }
        };

        // Each job writes into its own directory, so two URLs sharing a file
        // name never touch each other's output.
        let job_dir = self.files_dir.join(&job_id);
        let dest = job_dir.join(&filename);
        self.registry.register(
            &job_id,
            JobMetadata::new(url.as_str(), JobKind::File).output_path(&dest)
        )?;
        let host = url.host_str().unwrap_or("host").to_string();
        self.registry.start(&job_id, StartInfo::downloading(format!("Connecting to {host}")));

        let abort = CancellationToken::new();
        self.registry.attach_cancel(&job_id, CancelHandle::Abort(abort.clone()));

        let transfer = Transfer {
            registry: Arc::clone(&self.registry),
            client: self.client.clone(),
            disk: Arc::clone(&self.disk),
            url,
            job_dir,
            dest,
            margin_percent: self.margin_percent
        };
        tracing::info!(job_id = %job_id, file = %filename, "starting file download");
        tokio::spawn(transfer.run(claim, abort));

        Ok(StartOutcome::started(job_id))
    }
}

fn target_filename(url: &reqwest::Url, requested: Option<&str>) -> Result<String, DownloadError> {
    let name = match requested.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => name.to_string(),
        None => url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|s| !s.is_empty())
            .unwrap_or("download")
            .to_string()
    };
    if name == "." || name == ".." || name.contains('/') || name.contains('\\') {
        return Err(DownloadError::Validation(format!("invalid file name: {name}")));
    }
    Ok(name)
}

struct Transfer {
    registry: Arc<JobRegistry>,
    client: reqwest::Client,
    disk: Arc<dyn DiskSpace>,
    url: reqwest::Url,
    job_dir: PathBuf,
    dest: PathBuf,
    margin_percent: u64
}

impl Transfer {
    async fn run(self, claim: ActiveClaim, abort: CancellationToken) {
        let job_id = claim.job_id().to_string();
        let result = tokio::select! {
            biased;
            () = abort.cancelled() => Err(DownloadError::Cancelled),
            result = self.copy_to_disk(&job_id) => result
        };

        match result {
            Ok(bytes) => {
                tracing::info!(job_id = %job_id, size = %format_bytes(bytes), "file written");
                self.registry.complete(&job_id, CompleteInfo {
                    output_path: Some(self.dest.clone()),
                    message: None
                });
            }
            Err(e) => {
                remove_partial(&self.job_dir).await;
                if e.is_cancellation() {
                    self.registry.mark_cancelled(&job_id, None);
                } else {
                    self.registry.fail(&job_id, e.to_fail_info());
                }
            }
        }
        drop(claim);
    }

    async fn copy_to_disk(&self, job_id: &str) -> Result<u64, DownloadError> {
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(transport)?;

        let total = response.content_length().unwrap_or(0);
        if total > 0 {
            ensure_space(self.disk.as_ref(), &self.job_dir, total, self.margin_percent)?;
            self.registry.update_progress(job_id, ProgressUpdate {
                total_bytes: Some(total),
                message: Some(format!("Downloading {}", format_bytes(total))),
                ..ProgressUpdate::default()
            });
        }

        tokio::fs::create_dir_all(&self.job_dir).await?;
        let mut file = tokio::fs::File::create(&self.dest).await?;
        let mut sampler = ProgressSampler::new(Instant::now());
        let mut downloaded: u64 = 0;
        let body = response.bytes_stream();
        tokio::pin!(body);

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(transport)?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            if let Some(update) = sampler.sample(downloaded, total, Instant::now()) {
                self.registry.update_progress(job_id, update);
            }
        }
        file.flush().await?;

        if total > 0 && downloaded < total {
            return Err(DownloadError::Transport(format!(
                "connection closed after {} of {}",
                format_bytes(downloaded),
                format_bytes(total)
            )));
        }
        Ok(downloaded)
    }
}

fn transport(err: reqwest::Error) -> DownloadError {
    DownloadError::Transport(err.to_string())
}
