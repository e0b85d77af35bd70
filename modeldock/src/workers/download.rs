use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use model_fetch::{FetchEvent, FetchOutcome, FetchRequest, ModelFetch, ProgressLine};
use serde::Deserialize;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use super::preflight::{ensure_space, DiskSpace, SizeProbe, DEFAULT_SPACE_MARGIN_PERCENT};
use super::{remove_partial, StartOutcome};
use crate::error::DownloadError;
use crate::jobs::{ActiveClaim, ActiveDownloads, Claim, JobRegistry};
use crate::models::{
    CancelHandle, CompleteInfo, JobKind, JobMetadata, JobStatus, ProgressUpdate, StartInfo
};

type FetchStream = Pin<Box<dyn Stream<Item = model_fetch::Result<FetchEvent>> + Send>>;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRequest {
    pub model_id: String,
    #[serde(default)]
    pub token: Option<String>
}

impl ModelRequest {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            token: None
        }
    }
}

/// Supervises model fetcher subprocesses and feeds their output into the
/// registry.
pub struct ModelDownloader {
    registry: Arc<JobRegistry>,
    active: Arc<ActiveDownloads>,
    fetcher: ModelFetch,
    probe: Arc<dyn SizeProbe>,
    disk: Arc<dyn DiskSpace>,
    models_dir: PathBuf,
    margin_percent: u64
}

impl ModelDownloader {
    pub fn new(
        registry: Arc<JobRegistry>,
        active: Arc<ActiveDownloads>,
        fetcher: ModelFetch,
        probe: Arc<dyn SizeProbe>,
        disk: Arc<dyn DiskSpace>,
        models_dir: impl Into<PathBuf>
    ) -> Self {
        Self {
            registry,
            active,
            fetcher,
            probe,
            disk,
            models_dir: models_dir.into(),
            margin_percent: DEFAULT_SPACE_MARGIN_PERCENT
        }
    }

    #[must_use]
    pub fn with_margin(mut self, percent: u64) -> Self {
        self.margin_percent = percent;
        self
    }

    /// Version string of the configured fetcher binary.
    pub async fn check_fetcher(&self) -> model_fetch::Result<String> {
        self.fetcher.check_binary().await
    }

    /// Snapshot directory for a model. Ids never contain `--`, so the
    /// mapping is one-to-one and cannot land on the files directory.
    pub fn output_dir_for(&self, model_id: &str) -> PathBuf {
        self.models_dir.join(format!("models--{}", model_id.replace('/', "--")))
    }

    /// Starts a model download, or returns the running job for the same model.
    ///
    /// The job is registered before the size probe so a concurrent request
    /// for the same model always gets an id it can look up. When the model
    /// does not fit on disk with the safety margin, that job fails and the
    /// call returns the error without spawning anything.
    pub async fn start(&self, request: ModelRequest) -> Result<StartOutcome, DownloadError> {
        let model_id = request.model_id.trim();
        validate_model_id(model_id)?;

        let job_id = uuid7::uuid7().to_string();
        let claim = match self.active.claim(model_id, &job_id) {
            Claim::Acquired(claim) => claim,
            Claim::Existing(existing) => {
                tracing::info!(model = %model_id, job_id = %existing, "download already in progress");
                return Ok(StartOutcome::existing(existing));
            }
        };

        let output_dir = self.output_dir_for(model_id);
        self.registry.register(
            &job_id,
            JobMetadata::new(model_id, JobKind::Model).output_path(&output_dir)
        )?;
        self.registry.start(&job_id, StartInfo::preparing(format!("Preparing download of {model_id}")));

        let kill = CancellationToken::new();
        self.registry.attach_cancel(&job_id, CancelHandle::Process {
            pid: None,
            kill: kill.clone()
        });

        match self.probe.remote_size(model_id).await {
            Ok(size) => {
                if let Err(e) = ensure_space(self.disk.as_ref(), &output_dir, size, self.margin_percent) {
                    self.registry.fail(&job_id, e.to_fail_info());
                    return Err(e);
                }
                if size > 0 {
                    self.registry.update_progress(&job_id, ProgressUpdate {
                        total_bytes: Some(size),
                        ..ProgressUpdate::default()
                    });
                }
            }
            Err(e) => {
                tracing::warn!(model = %model_id, "size probe failed, skipping space check: {}", e);
            }
        }

        if kill.is_cancelled() {
            tracing::info!(job_id = %job_id, "cancelled during preflight");
            self.registry.mark_cancelled(&job_id, None);
            return Ok(StartOutcome::started(job_id));
        }

        let fetch_request = FetchRequest::new(model_id, &output_dir, &job_id).token(request.token);
        let stream = self.fetcher.fetch_with_progress(&fetch_request);

        tracing::info!(job_id = %job_id, model = %model_id, "starting model download");
        tokio::spawn(supervise(
            Arc::clone(&self.registry),
            claim,
            stream,
            kill,
            output_dir,
            model_id.to_string()
        ));

        Ok(StartOutcome::started(job_id))
    }
}

fn validate_model_id(model_id: &str) -> Result<(), DownloadError> {
    if model_id.is_empty() {
        return Err(DownloadError::Validation("model id must not be empty".to_string()));
    }
    let malformed = model_id.starts_with('/')
        || model_id.contains('\\')
        || model_id.contains("--")
        || model_id.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if malformed {
        return Err(DownloadError::Validation(format!("malformed model id: {model_id}")));
    }
    Ok(())
}

async fn supervise(
    registry: Arc<JobRegistry>,
    claim: ActiveClaim,
    mut stream: FetchStream,
    kill: CancellationToken,
    output_dir: PathBuf,
    model_id: String
) {
    let job_id = claim.job_id().to_string();
    let result = drive(&registry, &job_id, &mut stream, &kill, &output_dir, &model_id).await;
    // Dropping the stream kills the child if it is still running.
    drop(stream);

    match result {
        Ok(info) => {
            registry.complete(&job_id, info);
        }
        Err(e) if e.is_cancellation() => {
            remove_partial(&output_dir).await;
            registry.mark_cancelled(&job_id, None);
        }
        Err(e) => {
            registry.fail(&job_id, e.to_fail_info());
        }
    }
    drop(claim);
}

async fn drive(
    registry: &JobRegistry,
    job_id: &str,
    stream: &mut FetchStream,
    kill: &CancellationToken,
    output_dir: &Path,
    model_id: &str
) -> Result<CompleteInfo, DownloadError> {
    loop {
        let event = tokio::select! {
            biased;
            () = kill.cancelled() => return Err(DownloadError::Cancelled),
            event = stream.next() => event
        };

        match event {
            Some(Ok(FetchEvent::Spawned { pid })) => {
                tracing::info!(job_id = %job_id, pid = ?pid, "model fetcher spawned");
                registry.attach_cancel(job_id, CancelHandle::Process {
                    pid,
                    kill: kill.clone()
                });
            }
            Some(Ok(FetchEvent::Progress(line))) => {
                if let Some(update) = progress_update(job_id, &line) {
                    registry.update_progress(job_id, update);
                }
            }
            Some(Ok(FetchEvent::Finished(outcome))) => {
                return outcome_to_result(outcome, output_dir, model_id);
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Err(DownloadError::MissingResult)
        }
    }
}

fn progress_update(job_id: &str, line: &ProgressLine) -> Option<ProgressUpdate> {
    if let Some(other) = line.download_id.as_deref().filter(|id| *id != job_id) {
        tracing::debug!(job_id = %job_id, other = %other, "progress line for another download ignored");
        return None;
    }

    Some(ProgressUpdate {
        status: Some(JobStatus::Downloading),
        progress: line.percent(),
        bytes_downloaded: line.downloaded_bytes,
        total_bytes: line.total_bytes.filter(|t| *t > 0),
        speed: None,
        message: line.message.clone()
    })
}

fn outcome_to_result(
    outcome: FetchOutcome,
    output_dir: &Path,
    model_id: &str
) -> Result<CompleteInfo, DownloadError> {
    match outcome {
        FetchOutcome::Completed { output_path, message } => Ok(CompleteInfo {
            output_path: output_path.or_else(|| Some(output_dir.to_path_buf())),
            message
        }),
        FetchOutcome::Gated { model_id: gated, .. } => Err(DownloadError::Gated {
            model_id: gated.unwrap_or_else(|| model_id.to_string())
        }),
        FetchOutcome::Failed { error, .. } => Err(DownloadError::Remote(error)),
        FetchOutcome::MissingResult => Err(DownloadError::MissingResult),
        FetchOutcome::Exited { exit_code, stderr } => {
            let message = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no diagnostic output")
                .to_string();
            Err(DownloadError::ProcessExit {
                code: exit_code,
                message
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::events::EventBus;
    use crate::models::Job;
    use crate::workers::preflight::fakes::{FailingProbe, FixedDisk, FixedSize, SlowSize};

    const GB: u64 = 1_000_000_000;

    struct Harness {
        dir: tempfile::TempDir,
        registry: Arc<JobRegistry>,
        active: Arc<ActiveDownloads>
    }

    impl Harness {
        fn new() -> Self {
            let bus = Arc::new(EventBus::new());
            Self {
                dir: tempfile::tempdir().unwrap(),
                registry: Arc::new(JobRegistry::with_retention(
                    bus,
                    Duration::from_secs(3600),
                    Duration::from_secs(60)
                )),
                active: ActiveDownloads::new()
            }
        }

        /// Writes an `sh` script standing in for the fetcher. `$OUT` holds
        /// the output directory and `$DIR` the temp dir.
        fn downloader(&self, body: &str, probe: Arc<dyn SizeProbe>, disk: Arc<dyn DiskSpace>) -> ModelDownloader {
            let script = self.dir.path().join("fetch.sh");
            let prelude = format!(
                "DIR='{}'\nwhile [ $# -gt 0 ]; do case \"$1\" in --output-dir) OUT=\"$2\"; shift;; esac; shift; done\n",
                self.dir.path().display()
            );
            std::fs::write(&script, format!("{prelude}{body}\n")).unwrap();

            let mut fetcher = ModelFetch::with_binary("sh");
            fetcher.set_script(Some(script));
            ModelDownloader::new(
                Arc::clone(&self.registry),
                Arc::clone(&self.active),
                fetcher,
                probe,
                disk,
                self.dir.path().join("models")
            )
        }

        fn simple(&self, body: &str) -> ModelDownloader {
            self.downloader(body, Arc::new(FixedSize(1024)), Arc::new(FixedDisk(u64::MAX)))
        }

        async fn wait_terminal(&self, id: &str) -> Job {
            for _ in 0..500 {
                if let Some(job) = self.registry.get(id).filter(Job::is_terminal) {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            panic!("job {id} never reached a terminal state");
        }

        async fn wait_for_file(&self, name: &str) {
            let path = self.dir.path().join(name);
            for _ in 0..500 {
                if path.exists() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            panic!("{name} was never written");
        }

        async fn wait_released(&self) {
            for _ in 0..500 {
                if self.active.is_empty() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            panic!("dedup claim never released");
        }
    }

    #[tokio::test]
    async fn test_successful_download_completes_job() {
        let h = Harness::new();
        let dl = h.simple(concat!(
            "mkdir -p \"$OUT\"\n",
            "echo '{\"type\":\"progress\",\"progress\":50,\"message\":\"half way\"}'\n",
            "echo 'plain log line'\n",
            "echo \"{\\\"success\\\":true,\\\"path\\\":\\\"$OUT\\\"}\""
        ));

        let outcome = dl.start(ModelRequest::new("acme/7b")).await.unwrap();
        assert!(!outcome.already_in_progress);

        let job = h.wait_terminal(&outcome.job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.total_bytes, 1024);
        assert_eq!(job.output_path, Some(dl.output_dir_for("acme/7b")));

        h.wait_released().await;
        let again = dl.start(ModelRequest::new("acme/7b")).await.unwrap();
        assert_ne!(again.job_id, outcome.job_id);
    }

    #[tokio::test]
    async fn test_gated_result_requires_license() {
        let h = Harness::new();
        let dl = h.simple(concat!(
            "echo '{\"type\":\"progress\",\"progress\":5}'\n",
            "echo '{\"success\":false,\"error\":\"gated_repo\",\"model_id\":\"acme/7b\"}'\n",
            "exit 1"
        ));

        let outcome = dl.start(ModelRequest::new("acme/7b")).await.unwrap();
        let job = h.wait_terminal(&outcome.job_id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.requires_license);
        assert_eq!(job.error.as_deref(), Some("gated_repo"));
        assert!(job.message.contains("license"), "{}", job.message);
    }

    #[tokio::test]
    async fn test_clean_exit_without_result_fails() {
        let h = Harness::new();
        let dl = h.simple("echo '{\"type\":\"progress\",\"progress\":100}'");

        let outcome = dl.start(ModelRequest::new("acme/7b")).await.unwrap();
        let job = h.wait_terminal(&outcome.job_id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.message.contains("could not find result"), "{}", job.message);
    }

    #[tokio::test]
    async fn test_nonzero_exit_reports_stderr() {
        let h = Harness::new();
        let dl = h.simple("echo 'Traceback: boom' >&2\nexit 3");

        let outcome = dl.start(ModelRequest::new("acme/7b")).await.unwrap();
        let job = h.wait_terminal(&outcome.job_id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.message.contains("code 3"), "{}", job.message);
        assert!(job.message.contains("boom"), "{}", job.message);
    }

    #[tokio::test]
    async fn test_insufficient_space_rejects_without_spawning() {
        let h = Harness::new();
        let dl = h.downloader(
            "touch \"$DIR/spawned\"",
            Arc::new(FixedSize(100 * GB)),
            Arc::new(FixedDisk(10 * GB))
        );

        let err = dl.start(ModelRequest::new("acme/7b")).await.unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, DownloadError::InsufficientSpace { .. }));
        assert!(msg.contains("110.00 GB") && msg.contains("10.00 GB"), "{msg}");
        assert!(h.active.is_empty());

        let jobs = h.registry.all();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert!(jobs[0].message.contains("insufficient disk space"), "{}", jobs[0].message);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!h.dir.path().join("spawned").exists());
    }

    #[tokio::test]
    async fn test_duplicate_start_during_preflight_gets_registered_job() {
        let h = Harness::new();
        let dl = Arc::new(h.downloader(
            "touch \"$DIR/spawned\"",
            Arc::new(SlowSize(100 * GB, Duration::from_millis(300))),
            Arc::new(FixedDisk(10 * GB))
        ));

        let first = tokio::spawn({
            let dl = Arc::clone(&dl);
            async move { dl.start(ModelRequest::new("acme/7b")).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = dl.start(ModelRequest::new("acme/7b")).await.unwrap();
        assert!(second.already_in_progress);
        let job = h.registry.get(&second.job_id).unwrap();
        assert_eq!(job.status, JobStatus::Preparing);

        let err = first.await.unwrap().unwrap_err();
        assert!(matches!(err, DownloadError::InsufficientSpace { .. }));
        let job = h.registry.get(&second.job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(!h.dir.path().join("spawned").exists());
    }

    #[tokio::test]
    async fn test_cancel_during_preflight_never_spawns() {
        let h = Harness::new();
        let dl = Arc::new(h.downloader(
            "touch \"$DIR/spawned\"",
            Arc::new(SlowSize(GB, Duration::from_millis(300))),
            Arc::new(FixedDisk(u64::MAX))
        ));

        let start = tokio::spawn({
            let dl = Arc::clone(&dl);
            async move { dl.start(ModelRequest::new("acme/7b")).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let id = h.active.active_job("acme/7b").unwrap();
        assert!(h.registry.cancel(&id));

        let outcome = start.await.unwrap().unwrap();
        assert_eq!(outcome.job_id, id);
        assert_eq!(h.registry.get(&id).unwrap().status, JobStatus::Cancelled);
        assert!(h.active.is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!h.dir.path().join("spawned").exists());
    }

    #[tokio::test]
    async fn test_failed_probe_skips_space_check() {
        let h = Harness::new();
        let dl = h.downloader(
            "echo '{\"success\":true}'",
            Arc::new(FailingProbe),
            Arc::new(FixedDisk(0))
        );

        let outcome = dl.start(ModelRequest::new("acme/7b")).await.unwrap();
        let job = h.wait_terminal(&outcome.job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_duplicate_start_returns_existing_job_and_cancel_cleans_up() {
        let h = Harness::new();
        let dl = h.simple(concat!(
            "mkdir -p \"$OUT\"\n",
            "echo partial > \"$OUT/weights.part\"\n",
            "echo run >> \"$DIR/spawns\"\n",
            "sleep 30\n",
            "echo '{\"success\":true}'"
        ));

        let first = dl.start(ModelRequest::new("acme/7b")).await.unwrap();
        let second = dl.start(ModelRequest::new("acme/7b")).await.unwrap();
        assert_eq!(second.job_id, first.job_id);
        assert!(second.already_in_progress);

        h.wait_for_file("spawns").await;
        assert!(h.registry.cancel(&first.job_id));

        let job = h.wait_terminal(&first.job_id).await;
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(!dl.output_dir_for("acme/7b").exists());

        let spawns = std::fs::read_to_string(h.dir.path().join("spawns")).unwrap();
        assert_eq!(spawns.lines().count(), 1);
        h.wait_released().await;
    }

    #[tokio::test]
    async fn test_concurrent_distinct_models_are_independent() {
        let h = Harness::new();
        let dl = h.simple(concat!(
            "echo '{\"type\":\"progress\",\"progress\":25}'\n",
            "sleep 1\n",
            "echo '{\"success\":true}'"
        ));

        let small = dl.start(ModelRequest::new("acme/7b")).await.unwrap();
        let large = dl.start(ModelRequest::new("acme/13b")).await.unwrap();
        assert_ne!(small.job_id, large.job_id);

        assert!(h.registry.cancel(&small.job_id));
        assert_eq!(h.wait_terminal(&small.job_id).await.status, JobStatus::Cancelled);

        let job = h.wait_terminal(&large.job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.resource_key, "acme/13b");
    }

    #[tokio::test]
    async fn test_malformed_model_ids_are_rejected() {
        let h = Harness::new();
        let dl = h.simple("touch \"$DIR/spawned\"");
        for bad in ["", "  ", "../etc", "acme//7b", "/abs", "acme\\7b", "acme--7b"] {
            let err = dl.start(ModelRequest::new(bad)).await.unwrap_err();
            assert!(matches!(err, DownloadError::Validation(_)), "{bad}: {err}");
        }
        assert!(h.registry.is_empty());
    }

    #[test]
    fn test_output_dirs_are_distinct_per_model() {
        let h = Harness::new();
        let dl = h.simple("true");
        let nested = dl.output_dir_for("acme/7b");
        assert_ne!(nested, dl.output_dir_for("acme"));
        assert_ne!(dl.output_dir_for("files"), h.dir.path().join("models").join("files"));
        assert!(nested.ends_with("models--acme--7b"));
    }

    #[test]
    fn test_progress_for_other_download_is_ignored() {
        let line = ProgressLine {
            download_id: Some("other".to_string()),
            progress: Some(10.0),
            message: None,
            downloaded_bytes: None,
            total_bytes: None
        };
        assert!(progress_update("mine", &line).is_none());

        let line = ProgressLine {
            download_id: Some("mine".to_string()),
            ..line
        };
        let update = progress_update("mine", &line).unwrap();
        assert_eq!(update.progress, Some(10));
        assert_eq!(update.status, Some(JobStatus::Downloading));
    }

    #[test]
    fn test_exit_message_uses_last_stderr_line() {
        let err = outcome_to_result(
            FetchOutcome::Exited {
                exit_code: Some(2),
                stderr: "first\nlast\n\n".to_string()
            },
            Path::new("/m"),
            "acme/7b"
        )
        .unwrap_err();
        assert!(matches!(err, DownloadError::ProcessExit { code: Some(2), ref message } if message == "last"));
    }
}
