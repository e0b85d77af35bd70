use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::types::FetchRequest;

pub struct CommandBuilder {
    binary: PathBuf,
    args: Vec<String>
}

impl CommandBuilder {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn script_opt(self, script: Option<&PathBuf>) -> Self {
        match script {
            Some(p) => self.arg(p.to_string_lossy().to_string()),
            None => self
        }
    }

    pub fn model_id(self, model_id: impl Into<String>) -> Self {
        self.arg("--model-id").arg(model_id)
    }

    pub fn output_dir(self, path: impl AsRef<Path>) -> Self {
        self.arg("--output-dir").arg(path.as_ref().to_string_lossy().to_string())
    }

    pub fn download_id(self, id: impl Into<String>) -> Self {
        self.arg("--download-id").arg(id)
    }

    pub fn token_opt(self, token: Option<&str>) -> Self {
        match token {
            Some(t) if !t.is_empty() => self.arg("--token").arg(t),
            _ => self
        }
    }

    pub fn with_request(self, request: &FetchRequest) -> Self {
        self.model_id(request.model_id.clone())
            .output_dir(&request.output_dir)
            .download_id(request.download_id.clone())
            .token_opt(request.token.as_deref())
    }

    pub fn build_with_env(&self, env_vars: &HashMap<String, String>) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.args);

        for (key, value) in env_vars {
            cmd.env(key, value);
        }

        cmd
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// Arguments with the value following `--token` masked, for logging.
    pub fn redacted_args(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.args.len());
        let mut mask_next = false;
        for arg in &self.args {
            if mask_next {
                out.push("***".to_string());
                mask_next = false;
            } else {
                mask_next = arg == "--token";
                out.push(arg.clone());
            }
        }
        out
    }
}
