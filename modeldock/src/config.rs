use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

use crate::jobs::DEFAULT_JOB_TTL;
use crate::rooms::DEFAULT_LEAVE_GRACE;
use crate::workers::DEFAULT_SPACE_MARGIN_PERCENT;

/// Server configuration loaded from environment variables.
///
/// | Env Var                | Default                  |
/// |------------------------|--------------------------|
/// | `HOST`                 | `0.0.0.0`                |
/// | `PORT`                 | `8000`                   |
/// | `MODELS_DIR`           | `./models`               |
/// | `FETCH_BINARY`         | `python3`                |
/// | `FETCH_SCRIPT`         | unset                    |
/// | `HF_TOKEN`             | unset                    |
/// | `HUB_URL`              | `https://huggingface.co` |
/// | `JOB_TTL_SECS`         | `3600`                   |
/// | `CANCELLED_TTL_SECS`   | `0`                      |
/// | `LEAVE_GRACE_SECS`     | `180`                    |
/// | `SPACE_MARGIN_PERCENT` | `10`                     |
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub models_dir: PathBuf,
    pub fetch_binary: PathBuf,
    pub fetch_script: Option<PathBuf>,
    pub hf_token: Option<String>,
    pub hub_url: String,
    /// Retention of completed and failed jobs.
    pub job_ttl: Duration,
    pub cancelled_ttl: Duration,
    /// Deferred-leave window for disconnected clients.
    pub leave_grace: Duration,
    pub space_margin_percent: u64
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            models_dir: PathBuf::from("./models"),
            fetch_binary: PathBuf::from("python3"),
            fetch_script: None,
            hf_token: None,
            hub_url: "https://huggingface.co".to_string(),
            job_ttl: DEFAULT_JOB_TTL,
            cancelled_ttl: Duration::ZERO,
            leave_grace: DEFAULT_LEAVE_GRACE,
            space_margin_percent: DEFAULT_SPACE_MARGIN_PERCENT
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| -> anyhow::Result<Duration> {
            parse(&var, key, default.as_secs()).map(Duration::from_secs)
        };

        Ok(Self {
            host: var("HOST").unwrap_or(defaults.host),
            port: parse(&var, "PORT", defaults.port)?,
            models_dir: var("MODELS_DIR").map_or(defaults.models_dir, PathBuf::from),
            fetch_binary: var("FETCH_BINARY").map_or(defaults.fetch_binary, PathBuf::from),
            fetch_script: var("FETCH_SCRIPT").map(PathBuf::from),
            hf_token: var("HF_TOKEN"),
            hub_url: var("HUB_URL").unwrap_or(defaults.hub_url),
            job_ttl: secs("JOB_TTL_SECS", defaults.job_ttl)?,
            cancelled_ttl: secs("CANCELLED_TTL_SECS", defaults.cancelled_ttl)?,
            leave_grace: secs("LEAVE_GRACE_SECS", defaults.leave_grace)?,
            space_margin_percent: parse(&var, "SPACE_MARGIN_PERCENT", defaults.space_margin_percent)?
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn files_dir(&self) -> PathBuf {
        self.models_dir.join("files")
    }
}

fn parse<T, F>(var: &F, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>
{
    match var(key) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("{key} must be a valid number, got {raw:?}")),
        None => Ok(default)
    }
}
