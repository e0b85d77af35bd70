use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::sync;

/// Dedup guard: at most one running job per resource key.
#[derive(Debug, Default)]
pub struct ActiveDownloads {
    by_key: Mutex<HashMap<String, String>>
}

#[derive(Debug)]
pub enum Claim {
    Acquired(ActiveClaim),
    /// Another job already holds the key; carries its id.
    Existing(String)
}

/// Holds a resource key until dropped.
#[derive(Debug)]
pub struct ActiveClaim {
    owner: Arc<ActiveDownloads>,
    key: String,
    job_id: String
}

impl ActiveClaim {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for ActiveClaim {
    fn drop(&mut self) {
        let mut by_key = sync::lock(&self.owner.by_key);
        if by_key.get(&self.key).is_some_and(|id| *id == self.job_id) {
            by_key.remove(&self.key);
            tracing::debug!(key = %self.key, job_id = %self.job_id, "resource released");
        }
    }
}

impl ActiveDownloads {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn claim(self: &Arc<Self>, key: &str, job_id: &str) -> Claim {
        let mut by_key = sync::lock(&self.by_key);
        if let Some(existing) = by_key.get(key) {
            return Claim::Existing(existing.clone());
        }
        by_key.insert(key.to_string(), job_id.to_string());
        Claim::Acquired(ActiveClaim {
            owner: Arc::clone(self),
            key: key.to_string(),
            job_id: job_id.to_string()
        })
    }

    pub fn active_job(&self, key: &str) -> Option<String> {
        sync::lock(&self.by_key).get(key).cloned()
    }

    pub fn len(&self) -> usize {
        sync::lock(&self.by_key).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
