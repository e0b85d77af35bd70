//! Authoritative in-memory job store and lifecycle state machine.
//!
//! Every successful mutation publishes the job's full snapshot on the
//! [`EventBus`]. Terminal jobs are immutable and are purged after a
//! retention period. Publishing happens after the map lock is released, so
//! listeners may call back into the registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use crate::error::DownloadError;
use crate::events::{EventBus, EventKind, JobEvent};
use crate::models::{
    CancelHandle, CompleteInfo, FailInfo, Job, JobMetadata, JobStatus, ProgressUpdate, StartInfo
};
use crate::sync;

pub const DEFAULT_JOB_TTL: Duration = Duration::from_secs(3600);

struct JobEntry {
    job: Job,
    cancel: Option<CancelHandle>,
    cancelling: bool
}

type JobMap = Arc<Mutex<HashMap<String, JobEntry>>>;

pub struct JobRegistry {
    jobs: JobMap,
    bus: Arc<EventBus>,
    job_ttl: Duration,
    cancelled_ttl: Duration
}

impl JobRegistry {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self::with_retention(bus, DEFAULT_JOB_TTL, Duration::ZERO)
    }

    pub fn with_retention(bus: Arc<EventBus>, job_ttl: Duration, cancelled_ttl: Duration) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            bus,
            job_ttl,
            cancelled_ttl
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Creates a job, or merges metadata into an existing one without
    /// resetting its status. Terminal jobs are returned untouched.
    pub fn register(&self, id: &str, metadata: JobMetadata) -> Result<Job, DownloadError> {
        if id.trim().is_empty() {
            return Err(DownloadError::Validation("job id must not be empty".to_string()));
        }

        let snapshot = {
            let mut jobs = sync::lock(&self.jobs);
            match jobs.get_mut(id) {
                Some(entry) if entry.job.is_terminal() => return Ok(entry.job.clone()),
                Some(entry) => {
                    entry.job.merge_metadata(metadata);
                    entry.job.clone()
                }
                None => {
                    if metadata.resource_key.trim().is_empty() {
                        return Err(DownloadError::Validation(
                            "resource key must not be empty".to_string()
                        ));
                    }
                    let job = Job::new(id, metadata);
                    jobs.insert(id.to_string(), JobEntry {
                        job: job.clone(),
                        cancel: None,
                        cancelling: false
                    });
                    job
                }
            }
        };

        tracing::debug!(job_id = %id, resource = %snapshot.resource_key, "job registered");
        self.publish(EventKind::Registered, snapshot.clone());
        Ok(snapshot)
    }

    /// Hands the job its cancellation capability, replacing any earlier one.
    pub fn attach_cancel(&self, id: &str, handle: CancelHandle) -> bool {
        let mut jobs = sync::lock(&self.jobs);
        match jobs.get_mut(id) {
            Some(entry) if !entry.job.is_terminal() => {
                entry.cancel = Some(handle);
                true
            }
            _ => false
        }
    }

    pub fn start(&self, id: &str, info: StartInfo) -> Option<Job> {
        if !matches!(info.status, JobStatus::Preparing | JobStatus::Downloading) {
            tracing::warn!(job_id = %id, status = %info.status, "start with non-start status ignored");
            return None;
        }

        self.mutate(id, EventKind::Start, |job| {
            if !job.status.can_transition_to(info.status) {
                return false;
            }
            job.status = info.status;
            if job.start_time.is_none() {
                job.start_time = Some(Utc::now());
            }
            if let Some(message) = info.message {
                job.message = message;
            }
            if let Some(total) = info.total_bytes {
                job.total_bytes = total;
            }
            true
        })
    }

    /// Merges `update` into a running job. A no-op once the job is terminal.
    pub fn update_progress(&self, id: &str, update: ProgressUpdate) -> Option<Job> {
        self.mutate(id, EventKind::Progress, |job| {
            if let Some(status) = update.status {
                if status.is_terminal() {
                    tracing::warn!(job_id = %job.id, "terminal status via progress update ignored");
                } else if job.status.can_transition_to(status) {
                    job.status = status;
                    if job.start_time.is_none() {
                        job.start_time = Some(Utc::now());
                    }
                }
            }
            if let Some(progress) = update.progress {
                job.progress = job.progress.max(progress.min(100));
            }
            if let Some(bytes) = update.bytes_downloaded {
                job.bytes_downloaded = bytes;
            }
            if let Some(total) = update.total_bytes {
                job.total_bytes = total;
            }
            if let Some(speed) = update.speed {
                job.speed = speed;
            }
            if let Some(message) = update.message {
                job.message = message;
            }
            true
        })
    }

    pub fn complete(&self, id: &str, info: CompleteInfo) -> Option<Job> {
        let snapshot = self.mutate(id, EventKind::Complete, |job| {
            job.status = JobStatus::Completed;
            job.progress = 100;
            if job.total_bytes > 0 {
                job.bytes_downloaded = job.total_bytes;
            }
            job.end_time = Some(Utc::now());
            job.message = info.message.unwrap_or_else(|| "Download complete".to_string());
            if info.output_path.is_some() {
                job.output_path = info.output_path;
            }
            true
        })?;

        tracing::info!(job_id = %id, path = ?snapshot.output_path, "job completed");
        self.schedule_purge(id, self.job_ttl);
        Some(snapshot)
    }

    pub fn fail(&self, id: &str, info: FailInfo) -> Option<Job> {
        let snapshot = self.mutate(id, EventKind::Error, |job| {
            job.status = JobStatus::Failed;
            job.end_time = Some(Utc::now());
            job.speed = 0.0;
            job.message = info.message.unwrap_or_else(|| info.error.clone());
            job.error = Some(info.error);
            job.requires_license = info.requires_license;
            true
        })?;

        tracing::error!(
            job_id = %id,
            requires_license = snapshot.requires_license,
            "job failed: {}",
            snapshot.error.as_deref().unwrap_or_default()
        );
        self.schedule_purge(id, self.job_ttl);
        Some(snapshot)
    }

    /// Requests cancellation. Jobs owning a cancel handle are signalled and
    /// reach `cancelled` once their worker has cleaned up; jobs without one
    /// are cancelled on the spot. Returns `false` for unknown or terminal jobs.
    pub fn cancel(&self, id: &str) -> bool {
        let handle = {
            let mut jobs = sync::lock(&self.jobs);
            let Some(entry) = jobs.get_mut(id) else {
                return false;
            };
            if entry.job.is_terminal() {
                return false;
            }
            if entry.cancelling {
                return true;
            }
            entry.cancelling = true;
            entry.cancel.take()
        };

        if let Some(handle) = handle {
            tracing::info!(job_id = %id, "cancellation requested");
            handle.cancel();
        } else {
            self.mark_cancelled(id, None);
        }
        true
    }

    /// Records the terminal `cancelled` state once cleanup is done.
    pub fn mark_cancelled(&self, id: &str, message: Option<String>) -> Option<Job> {
        let snapshot = self.mutate(id, EventKind::Cancel, |job| {
            job.status = JobStatus::Cancelled;
            job.end_time = Some(Utc::now());
            job.speed = 0.0;
            job.message = message.unwrap_or_else(|| "Download cancelled".to_string());
            true
        })?;

        tracing::info!(job_id = %id, "job cancelled");
        self.schedule_purge(id, self.cancelled_ttl);
        Some(snapshot)
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        sync::lock(&self.jobs).get(id).map(|entry| entry.job.clone())
    }

    pub fn all(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = sync::lock(&self.jobs)
            .values()
            .map(|entry| entry.job.clone())
            .collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    pub fn len(&self) -> usize {
        sync::lock(&self.jobs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies `f` to a non-terminal job, then publishes the resulting
    /// snapshot. Returns `None` when the job is missing, terminal, or `f`
    /// declined the change.
    fn mutate<F>(&self, id: &str, kind: EventKind, f: F) -> Option<Job>
    where
        F: FnOnce(&mut Job) -> bool
    {
        let snapshot = {
            let mut jobs = sync::lock(&self.jobs);
            let entry = jobs.get_mut(id)?;
            if entry.job.is_terminal() || !f(&mut entry.job) {
                return None;
            }
            entry.job.last_updated = Utc::now();
            if entry.job.is_terminal() {
                entry.cancel = None;
            }
            entry.job.clone()
        };

        self.publish(kind, snapshot.clone());
        Some(snapshot)
    }

    fn publish(&self, kind: EventKind, job: Job) {
        self.bus.publish(&JobEvent::new(kind, job));
    }

    fn schedule_purge(&self, id: &str, after: Duration) {
        if after.is_zero() {
            purge_terminal(&self.jobs, id);
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(job_id = %id, "no runtime available, terminal job will not be purged");
            return;
        };

        let jobs = Arc::clone(&self.jobs);
        let id = id.to_string();
        runtime.spawn(async move {
            tokio::time::sleep(after).await;
            purge_terminal(&jobs, &id);
        });
    }
}

fn purge_terminal(jobs: &JobMap, id: &str) {
    let mut jobs = sync::lock(jobs);
    if jobs.get(id).is_some_and(|entry| entry.job.is_terminal()) {
        jobs.remove(id);
        tracing::debug!(job_id = %id, "terminal job purged");
    }
}
