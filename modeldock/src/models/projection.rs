use serde::Serialize;

use super::{Job, JobStatus};

/// Coarse progress step shown to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Idle,
    Initiated,
    Downloading,
    Ready,
    Failed,
    Cancelled
}

impl Step {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed | Self::Cancelled)
    }

    fn from_status(status: JobStatus) -> Self {
        match status {
            JobStatus::Registered | JobStatus::Preparing => Self::Initiated,
            JobStatus::Downloading | JobStatus::Processing => Self::Downloading,
            JobStatus::Completed => Self::Ready,
            JobStatus::Failed => Self::Failed,
            JobStatus::Cancelled => Self::Cancelled
        }
    }
}

/// Consumer-side view of one job fed from pushed snapshots.
///
/// Each snapshot replaces the previous one, so duplicates and replays are
/// harmless. The derived step never moves backward and stays put once it is
/// terminal; only a snapshot for a different job id resets it.
#[derive(Debug, Clone)]
pub struct ClientProjection {
    job: Option<Job>,
    step: Step
}

impl Default for ClientProjection {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientProjection {
    pub fn new() -> Self {
        Self {
            job: None,
            step: Step::Idle
        }
    }

    pub fn apply(&mut self, job: Job) -> Step {
        let same_job = self.job.as_ref().is_some_and(|current| current.id == job.id);
        if !same_job {
            self.step = Step::Idle;
        }

        let next = Step::from_status(job.status);
        if !self.step.is_terminal() && next > self.step {
            self.step = next;
        }

        self.job = Some(job);
        self.step
    }

    pub fn job(&self) -> Option<&Job> {
        self.job.as_ref()
    }

    pub fn step(&self) -> Step {
        self.step
    }
}
