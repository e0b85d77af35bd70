use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::pin::Pin;

use futures_core::Stream;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use crate::command::CommandBuilder;
use crate::error::{Error, Result};
use crate::types::{FetchEvent, FetchOutcome, FetchRequest, FetchResult, ProgressLine};

/// Lines of stderr kept for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct ModelFetch {
    binary: PathBuf,
    script: Option<PathBuf>,
    token: Option<String>,
    env_vars: HashMap<String, String>
}

impl Default for ModelFetch {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelFetch {
    pub fn new() -> Self {
        Self::with_binary("python3")
    }

    pub fn with_binary(path: impl Into<PathBuf>) -> Self {
        Self {
            binary: path.into(),
            script: None,
            token: None,
            env_vars: HashMap::new()
        }
    }

    pub fn set_script(&mut self, path: Option<PathBuf>) {
        self.script = path;
    }

    /// Token used when a request does not carry its own.
    pub fn set_token(&mut self, token: Option<String>) {
        self.token = token.filter(|t| !t.is_empty());
    }

    pub fn set_env(&mut self, key: String, value: String) {
        self.env_vars.insert(key, value);
    }

    pub async fn check_binary(&self) -> Result<String> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .output()
            .await?;

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if stdout.is_empty() {
                Ok(String::from_utf8_lossy(&output.stderr).trim().to_string())
            } else {
                Ok(stdout)
            }
        } else {
            Err(Error::BinaryNotExecutable(self.binary.clone()))
        }
    }

    /// Spawns the helper and streams its progress.
    ///
    /// The stream always ends with [`FetchEvent::Finished`] unless spawning or
    /// reading stdout fails. Dropping the stream kills the child process.
    pub fn fetch_with_progress(
        &self,
        request: &FetchRequest
    ) -> Pin<Box<dyn Stream<Item = Result<FetchEvent>> + Send + 'static>> {
        let mut request = request.clone();
        if request.token.is_none() {
            request.token.clone_from(&self.token);
        }
        let binary = self.binary.clone();
        let script = self.script.clone();
        let env_vars = self.env_vars.clone();

        Box::pin(async_stream::try_stream! {
            if request.model_id.trim().is_empty() {
                Err::<(), _>(Error::InvalidRequest("model id is empty".to_string()))?;
            }

            let builder = CommandBuilder::new(&binary)
                .script_opt(script.as_ref())
                .with_request(&request);

            tracing::debug!(
                binary = %binary.display(),
                args = ?builder.redacted_args(),
                "spawning model fetcher"
            );

            let mut cmd = builder.build_with_env(&env_vars);
            cmd.stdout(std::process::Stdio::piped());
            cmd.stderr(std::process::Stdio::piped());
            cmd.kill_on_drop(true);

            let mut child = cmd.spawn()?;
            yield FetchEvent::Spawned { pid: child.id() };

            let stderr = child.stderr.take().ok_or(Error::PipeUnavailable("stderr"))?;
            let stderr_task = tokio::spawn(collect_tail(stderr));

            let stdout = child.stdout.take().ok_or(Error::PipeUnavailable("stdout"))?;
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            let mut lines = Vec::new();

            while let Some(line) = next_line_lossy(&mut reader, &mut buf).await? {
                match parse_line(&line) {
                    ParsedLine::Progress(progress) => {
                        tracing::trace!(line = %line, "model fetcher progress");
                        yield FetchEvent::Progress(progress);
                    }
                    ParsedLine::Json => {
                        tracing::trace!(line = %line, "model fetcher json");
                    }
                    ParsedLine::Text => {
                        tracing::debug!(line = %line, "model fetcher output");
                    }
                }
                lines.push(line);
            }

            let status = child.wait().await?;
            let stderr_tail = stderr_task.await.unwrap_or_default();

            tracing::debug!(
                model_id = %request.model_id,
                code = ?status.code(),
                "model fetcher exited"
            );

            yield FetchEvent::Finished(classify_exit(&lines, status.code(), &stderr_tail));
        })
    }
}

/// Reads one line, replacing invalid UTF-8 instead of failing on it.
async fn next_line_lossy<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>
) -> std::io::Result<Option<String>> {
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(buf);
    Ok(Some(line.trim_end_matches(['\n', '\r']).to_string()))
}

async fn collect_tail(stream: impl AsyncRead + Unpin) -> String {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Ok(Some(line)) = next_line_lossy(&mut reader, &mut buf).await {
        tracing::trace!(line = %line, "model fetcher stderr");
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n")
}

enum ParsedLine {
    Progress(ProgressLine),
    Json,
    Text
}

fn parse_line(line: &str) -> ParsedLine {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line.trim()) else {
        return ParsedLine::Text;
    };

    if value.get("type").and_then(serde_json::Value::as_str) == Some("progress")
        && let Ok(progress) = serde_json::from_value::<ProgressLine>(value)
    {
        return ParsedLine::Progress(progress);
    }

    ParsedLine::Json
}

/// Finds the authoritative result: the last stdout line that is a JSON object
/// with a `success` key. Earlier progress lines are valid JSON too, so the
/// scan runs backward and ignores objects without that key.
pub fn find_result(lines: &[String]) -> Option<FetchResult> {
    lines.iter().rev().find_map(|line| {
        let value: serde_json::Value = serde_json::from_str(line.trim()).ok()?;
        if value.as_object()?.contains_key("success") {
            serde_json::from_value(value).ok()
        } else {
            None
        }
    })
}

pub fn classify_exit(lines: &[String], exit_code: Option<i32>, stderr: &str) -> FetchOutcome {
    match find_result(lines) {
        Some(result) if result.success => FetchOutcome::Completed {
            output_path: result.output_path,
            message: result.message
        },
        Some(result) if result.is_gated() => FetchOutcome::Gated {
            model_id: result.model_id,
            message: result.message
        },
        Some(result) => FetchOutcome::Failed {
            error: result
                .error
                .or(result.message)
                .unwrap_or_else(|| "download failed".to_string()),
            exit_code
        },
        None if exit_code == Some(0) => FetchOutcome::MissingResult,
        None => FetchOutcome::Exited {
            exit_code,
            stderr: stderr.trim().to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_find_result_skips_trailing_progress_and_text() {
        let out = lines(&[
            r#"{"type":"progress","downloadId":"j","progress":10}"#,
            r#"{"success":true,"path":"/m/acme"}"#,
            r#"{"type":"progress","downloadId":"j","progress":100}"#,
            "Fetching 12 files: done"
        ]);
        let result = find_result(&out).unwrap();
        assert!(result.success);
        assert_eq!(result.output_path, Some(PathBuf::from("/m/acme")));
    }

    #[test]
    fn test_find_result_none_when_only_progress() {
        let out = lines(&[
            r#"{"type":"progress","progress":10}"#,
            "not json"
        ]);
        assert!(find_result(&out).is_none());
    }

    #[test]
    fn test_classify_gated() {
        let out = lines(&[
            r#"{"type":"progress","progress":0,"message":"starting"}"#,
            r#"{"success":false,"error":"gated_repo","model_id":"acme/7b"}"#
        ]);
        let outcome = classify_exit(&out, Some(1), "");
        assert_eq!(outcome, FetchOutcome::Gated {
            model_id: Some("acme/7b".to_string()),
            message: None
        });
    }

    #[test]
    fn test_classify_missing_result_on_clean_exit() {
        let out = lines(&["hello"]);
        assert_eq!(classify_exit(&out, Some(0), ""), FetchOutcome::MissingResult);
    }

    #[test]
    fn test_classify_nonzero_exit_without_result() {
        let outcome = classify_exit(&[], Some(2), "Traceback: boom\n");
        assert_eq!(outcome, FetchOutcome::Exited {
            exit_code: Some(2),
            stderr: "Traceback: boom".to_string()
        });
    }

    #[test]
    fn test_classify_generic_failure_keeps_error() {
        let out = lines(&[r#"{"success":false,"error":"disk full"}"#]);
        assert_eq!(classify_exit(&out, Some(1), ""), FetchOutcome::Failed {
            error: "disk full".to_string(),
            exit_code: Some(1)
        });
    }

    #[test]
    fn test_parse_line_kinds() {
        assert!(matches!(
            parse_line(r#"{"type":"progress","progress":5}"#),
            ParsedLine::Progress(_)
        ));
        assert!(matches!(parse_line(r#"{"success":true}"#), ParsedLine::Json));
        assert!(matches!(parse_line("plain text"), ParsedLine::Text));
    }

    #[test]
    fn test_model_fetch_defaults() {
        let client = ModelFetch::default();
        assert_eq!(client.binary, PathBuf::from("python3"));
        assert!(client.script.is_none());
        assert!(client.token.is_none());
    }

    #[test]
    fn test_empty_token_is_ignored() {
        let mut client = ModelFetch::new();
        client.set_token(Some(String::new()));
        assert!(client.token.is_none());
    }

    #[tokio::test]
    async fn test_fetch_with_progress_runs_script() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fetch.sh");
        std::fs::write(
            &script,
            concat!(
                "echo '{\"type\":\"progress\",\"downloadId\":\"j1\",\"progress\":50,\"message\":\"half\"}'\n",
                "echo 'some log line'\n",
                "echo 'warning' 1>&2\n",
                "echo '{\"success\":true,\"path\":\"/m/out\"}'\n"
            )
        )
        .unwrap();

        let mut client = ModelFetch::with_binary("sh");
        client.set_script(Some(script));
        let request = FetchRequest::new("acme/7b", dir.path(), "j1");

        let events: Vec<FetchEvent> = client
            .fetch_with_progress(&request)
            .collect::<Result<Vec<_>>>()
            .await
            .unwrap();

        assert!(matches!(events.first(), Some(FetchEvent::Spawned { .. })));
        let progress: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                FetchEvent::Progress(p) => p.percent(),
                _ => None
            })
            .collect();
        assert_eq!(progress, vec![50]);
        assert!(matches!(
            events.last(),
            Some(FetchEvent::Finished(FetchOutcome::Completed { .. }))
        ));
    }

    #[tokio::test]
    async fn test_fetch_with_progress_reports_stderr_on_crash() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("crash.sh");
        std::fs::write(&script, "echo 'boom' 1>&2\nexit 3\n").unwrap();

        let mut client = ModelFetch::with_binary("sh");
        client.set_script(Some(script));
        let request = FetchRequest::new("acme/7b", dir.path(), "j2");

        let events: Vec<FetchEvent> = client
            .fetch_with_progress(&request)
            .collect::<Result<Vec<_>>>()
            .await
            .unwrap();

        match events.last() {
            Some(FetchEvent::Finished(FetchOutcome::Exited { exit_code, stderr })) => {
                assert_eq!(*exit_code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected final event: {other:?}")
        }
    }

    #[tokio::test]
    async fn test_invalid_utf8_output_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("latin1.sh");
        std::fs::write(
            &script,
            concat!(
                "printf 'Fetching caf\\351\\n'\n",
                "printf 'warn \\377\\n' 1>&2\n",
                "echo '{\"success\":true}'\n"
            )
        )
        .unwrap();

        let mut client = ModelFetch::with_binary("sh");
        client.set_script(Some(script));
        let request = FetchRequest::new("acme/7b", dir.path(), "j3");

        let events: Vec<FetchEvent> = client
            .fetch_with_progress(&request)
            .collect::<Result<Vec<_>>>()
            .await
            .unwrap();

        assert!(matches!(
            events.last(),
            Some(FetchEvent::Finished(FetchOutcome::Completed { .. }))
        ));
    }

    #[tokio::test]
    async fn test_next_line_lossy_replaces_bad_bytes() {
        let mut reader = BufReader::new(&b"caf\xe9\r\nok"[..]);
        let mut buf = Vec::new();
        assert_eq!(
            next_line_lossy(&mut reader, &mut buf).await.unwrap().as_deref(),
            Some("caf\u{fffd}")
        );
        assert_eq!(next_line_lossy(&mut reader, &mut buf).await.unwrap().as_deref(), Some("ok"));
        assert!(next_line_lossy(&mut reader, &mut buf).await.unwrap().is_none());
    }
}
