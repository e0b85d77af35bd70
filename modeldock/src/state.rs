use std::sync::Arc;

use model_fetch::ModelFetch;

use crate::config::Config;
use crate::events::EventBus;
use crate::jobs::{ActiveDownloads, JobRegistry};
use crate::rooms::RoomBroadcaster;
use crate::workers::{DiskSpace, FileDownloader, Fs2Disk, HubManifest, ModelDownloader, SizeProbe};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<JobRegistry>,
    pub rooms: Arc<RoomBroadcaster>,
    pub models: Arc<ModelDownloader>,
    pub files: Arc<FileDownloader>
}

impl AppState {
    /// Composition root: one bus, registry and broadcaster per process.
    pub fn new(config: &Config) -> Self {
        let client = reqwest::Client::new();
        let probe = Arc::new(HubManifest::new(client.clone(), &config.hub_url, config.hf_token.clone()));
        Self::with_probes(config, client, probe, Arc::new(Fs2Disk))
    }

    pub fn with_probes(
        config: &Config,
        client: reqwest::Client,
        probe: Arc<dyn SizeProbe>,
        disk: Arc<dyn DiskSpace>
    ) -> Self {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(JobRegistry::with_retention(
            Arc::clone(&bus),
            config.job_ttl,
            config.cancelled_ttl
        ));
        let rooms = Arc::new(RoomBroadcaster::new(Arc::clone(&registry), config.leave_grace));
        rooms.attach(&bus);

        let mut fetcher = ModelFetch::with_binary(&config.fetch_binary);
        fetcher.set_script(config.fetch_script.clone());
        fetcher.set_token(config.hf_token.clone());

        let active = ActiveDownloads::new();
        let models = ModelDownloader::new(
            Arc::clone(&registry),
            Arc::clone(&active),
            fetcher,
            probe,
            Arc::clone(&disk),
            &config.models_dir
        )
        .with_margin(config.space_margin_percent);
        let files = FileDownloader::new(
            Arc::clone(&registry),
            active,
            client,
            disk,
            config.files_dir()
        )
        .with_margin(config.space_margin_percent);

        Self {
            registry,
            rooms,
            models: Arc::new(models),
            files: Arc::new(files)
        }
    }
}

#[cfg(test)]
pub(crate) fn test_state() -> (AppState, tempfile::TempDir) {
    use crate::workers::fakes::{FixedDisk, FixedSize};

    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        models_dir: dir.path().join("models"),
        fetch_binary: "sh".into(),
        ..Config::default()
    };
    let state = AppState::with_probes(
        &config,
        reqwest::Client::new(),
        Arc::new(FixedSize(0)),
        Arc::new(FixedDisk(u64::MAX))
    );
    (state, dir)
}
