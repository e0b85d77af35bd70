//! In-process, synchronous publish/subscribe for job lifecycle snapshots.
//!
//! Delivery happens on the publisher's thread before `publish` returns. There
//! is no buffering: a listener registered after an event fired never sees it,
//! and late joiners read current state from the registry instead.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::models::Job;
use crate::sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Registered,
    Start,
    Progress,
    Complete,
    Error,
    Cancel
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Start => "start",
            Self::Progress => "progress",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Cancel => "cancel"
        }
    }
}

/// A lifecycle event carrying the job's full snapshot, never a diff.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub kind: EventKind,
    pub job_id: String,
    pub job: Job
}

impl JobEvent {
    pub fn new(kind: EventKind, job: Job) -> Self {
        Self {
            kind,
            job_id: job.id.clone(),
            job
        }
    }
}

pub type Listener = Arc<dyn Fn(&JobEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Subscription {
    id: ListenerId,
    kind: Option<EventKind>,
    listener: Listener
}

pub struct EventBus {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1)
        }
    }

    /// Listens to a single lifecycle topic.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&JobEvent) -> anyhow::Result<()> + Send + Sync + 'static
    {
        self.add(Some(kind), Arc::new(listener))
    }

    /// Listens to every topic.
    pub fn on_any<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&JobEvent) -> anyhow::Result<()> + Send + Sync + 'static
    {
        self.add(None, Arc::new(listener))
    }

    fn add(&self, kind: Option<EventKind>, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        sync::write(&self.subscriptions).push(Subscription { id, kind, listener });
        id
    }

    pub fn off(&self, id: ListenerId) -> bool {
        let mut subs = sync::write(&self.subscriptions);
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    pub fn listener_count(&self) -> usize {
        sync::read(&self.subscriptions).len()
    }

    /// Delivers `event` to every matching listener and returns how many
    /// accepted it. A listener that errors or panics is logged and skipped;
    /// the rest still receive the event.
    pub fn publish(&self, event: &JobEvent) -> usize {
        let targets: Vec<(ListenerId, Listener)> = sync::read(&self.subscriptions)
            .iter()
            .filter(|s| s.kind.is_none_or(|k| k == event.kind))
            .map(|s| (s.id, Arc::clone(&s.listener)))
            .collect();

        let mut delivered = 0;
        for (id, listener) in targets {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    tracing::warn!(
                        listener = id.0,
                        job_id = %event.job_id,
                        kind = event.kind.as_str(),
                        "event listener failed: {e:#}"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        listener = id.0,
                        job_id = %event.job_id,
                        kind = event.kind.as_str(),
                        "event listener panicked"
                    );
                }
            }
        }
        delivered
    }
}
