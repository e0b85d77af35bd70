use std::io;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::DownloadError;

pub const DEFAULT_SPACE_MARGIN_PERCENT: u64 = 10;

/// Source of the total remote size of a model.
#[async_trait]
pub trait SizeProbe: Send + Sync {
    async fn remote_size(&self, model_id: &str) -> Result<u64, DownloadError>;
}

/// Source of free space on the volume holding a path.
pub trait DiskSpace: Send + Sync {
    fn available(&self, path: &Path) -> io::Result<u64>;
}

#[derive(Debug, Deserialize)]
struct ModelManifest {
    #[serde(default)]
    siblings: Vec<Sibling>
}

#[derive(Debug, Deserialize)]
struct Sibling {
    #[serde(default)]
    size: Option<u64>
}

/// Reads a model's file listing from the hub API and sums the blob sizes.
pub struct HubManifest {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>
}

impl HubManifest {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty())
        }
    }
}

#[async_trait]
impl SizeProbe for HubManifest {
    async fn remote_size(&self, model_id: &str) -> Result<u64, DownloadError> {
        let url = format!("{}/api/models/{}?blobs=true", self.base_url, model_id);
        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DownloadError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(DownloadError::Transport(format!(
                "manifest request for {model_id} returned {}",
                response.status()
            )));
        }

        let manifest: ModelManifest = response
            .json()
            .await
            .map_err(|e| DownloadError::Transport(e.to_string()))?;
        Ok(manifest.total_size())
    }
}

impl ModelManifest {
    fn total_size(&self) -> u64 {
        self.siblings.iter().filter_map(|s| s.size).sum()
    }
}

/// Free space of the nearest existing ancestor, so the target directory
/// itself does not have to exist yet.
pub struct Fs2Disk;

impl DiskSpace for Fs2Disk {
    fn available(&self, path: &Path) -> io::Result<u64> {
        let existing = path
            .ancestors()
            .find(|p| p.exists())
            .unwrap_or_else(|| Path::new("."));
        fs2::available_space(existing)
    }
}

/// Required bytes including the safety margin.
pub fn with_margin(size: u64, margin_percent: u64) -> u64 {
    size.saturating_add(size.saturating_mul(margin_percent) / 100)
}

/// Fails with both figures when `size` plus the margin does not fit.
pub fn ensure_space(
    disk: &dyn DiskSpace,
    target: &Path,
    size: u64,
    margin_percent: u64
) -> Result<(), DownloadError> {
    let required = with_margin(size, margin_percent);
    let available = disk.available(target)?;
    if required > available {
        return Err(DownloadError::InsufficientSpace { required, available });
    }
    tracing::debug!(required, available, path = %target.display(), "space check passed");
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::fakes::FixedDisk;
    use super::*;

    const GB: u64 = 1_000_000_000;

    #[test]
    fn test_margin_is_added() {
        assert_eq!(with_margin(100 * GB, 10), 110 * GB);
        assert_eq!(with_margin(0, 10), 0);
        assert_eq!(with_margin(u64::MAX, 10), u64::MAX);
    }

    #[test]
    fn test_insufficient_space_reports_both_figures() {
        let err = ensure_space(&FixedDisk(10 * GB), Path::new("/models"), 100 * GB, 10).unwrap_err();
        match &err {
            DownloadError::InsufficientSpace { required, available } => {
                assert_eq!(*required, 110 * GB);
                assert_eq!(*available, 10 * GB);
            }
            other => panic!("unexpected error: {other}")
        }
        let msg = err.to_string();
        assert!(msg.contains("110.00 GB") && msg.contains("10.00 GB"), "{msg}");
    }

    #[test]
    fn test_margin_can_tip_the_balance() {
        assert!(ensure_space(&FixedDisk(105), Path::new("."), 100, 0).is_ok());
        assert!(ensure_space(&FixedDisk(105), Path::new("."), 100, 10).is_err());
    }

    #[test]
    fn test_manifest_sums_sibling_sizes() {
        let manifest: ModelManifest = serde_json::from_str(
            r#"{"id":"acme/7b","siblings":[{"rfilename":"a","size":10},{"rfilename":"b"},{"rfilename":"c","size":32}]}"#
        )
        .unwrap();
        assert_eq!(manifest.total_size(), 42);
    }

    #[test]
    fn test_fs2_disk_walks_up_to_existing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("not").join("yet");
        assert!(Fs2Disk.available(&missing).unwrap() > 0);
    }
}
