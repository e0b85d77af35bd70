use std::path::PathBuf;

/// Arguments for a single fetch helper invocation.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub model_id: String,
    pub output_dir: PathBuf,
    pub download_id: String,
    pub token: Option<String>
}

impl FetchRequest {
    pub fn new(
        model_id: impl Into<String>,
        output_dir: impl Into<PathBuf>,
        download_id: impl Into<String>
    ) -> Self {
        Self {
            model_id: model_id.into(),
            output_dir: output_dir.into(),
            download_id: download_id.into(),
            token: None
        }
    }

    #[must_use]
    pub fn token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }
}
