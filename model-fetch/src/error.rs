use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("model fetcher binary not executable: {0}")]
    BinaryNotExecutable(PathBuf),

    #[error("failed to execute model fetcher: {0}")]
    ExecutionFailed(#[from] std::io::Error),

    #[error("model fetcher {0} was not captured")]
    PipeUnavailable(&'static str),

    #[error("failed to parse JSON output: {0}")]
    JsonParseFailed(#[from] serde_json::Error),

    #[error("invalid fetch request: {0}")]
    InvalidRequest(String)
}

pub type Result<T> = std::result::Result<T, Error>;
