//! File-based prompt rendezvous
//!
//! Each prompt request is written to `<prompts_dir>/<id>.request.json` and a
//! copy is appended to the notifier outbox. The channel then polls for
//! `<id>.response.json`; with a TTY and no UI observed it instead asks on
//! the terminal and resolves immediately. The first response wins. Resolved
//! requests delete both files; aborted runs mark pending requests cancelled.

use std::io::IsTerminal;
use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use colored::Colorize;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::domain::{PromptKind, PromptRequest, PromptResponse, Verdict, now_ms};

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("Prompt cancelled")]
    Cancelled,

    #[error("Deadline exceeded waiting for a response")]
    DeadlineExceeded,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Malformed response file: {0}")]
    Malformed(#[from] serde_json::Error),
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

/// Prompt channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PromptConfig {
    /// Response poll interval in milliseconds
    pub poll_interval_ms: u64,

    /// Default deadline for responses, in milliseconds; absent means wait
    /// indefinitely
    pub deadline_ms: Option<u64>,

    /// Allow the interactive terminal fallback
    pub terminal: bool,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            deadline_ms: None,
            terminal: true,
        }
    }
}

/// Bidirectional request/response mechanism for human input
pub struct PromptChannel {
    prompts_dir: PathBuf,
    config: PromptConfig,
    cancel: watch::Receiver<bool>,
    interactive: bool,
}

impl PromptChannel {
    pub fn new(prompts_dir: impl Into<PathBuf>, config: PromptConfig, cancel: watch::Receiver<bool>) -> Self {
        let interactive =
            config.terminal && std::io::stdin().is_terminal() && std::io::stdout().is_terminal();
        Self { prompts_dir: prompts_dir.into(), config, cancel, interactive }
    }

    /// Force the interactive flag (tests and UI-driven deployments)
    pub fn with_interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    fn request_path(&self, id: &str) -> PathBuf {
        self.prompts_dir.join(format!("{}.request.json", id))
    }

    fn response_path(&self, id: &str) -> PathBuf {
        self.prompts_dir.join(format!("{}.response.json", id))
    }

    /// Publish a request and wait for the first response
    pub async fn ask(&self, request: &PromptRequest) -> Result<PromptResponse, PromptError> {
        std::fs::create_dir_all(&self.prompts_dir)?;
        let request_path = self.request_path(&request.id);
        std::fs::write(&request_path, serde_json::to_vec_pretty(request)?)?;
        self.notify(request)?;
        info!(prompt_id = %request.id, kind = %request.kind, "Prompt request published");

        if self.interactive {
            let response = terminal_prompt(request.clone()).await?;
            let _ = std::fs::remove_file(&request_path);
            return Ok(response);
        }

        let deadline = request
            .deadline_ms
            .or_else(|| self.config.deadline_ms.map(|d| now_ms() + d as i64));
        let response_path = self.response_path(&request.id);
        let interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            if *self.cancel.borrow() {
                self.mark_cancelled(request);
                return Err(PromptError::Cancelled);
            }
            if let Some(deadline) = deadline {
                if now_ms() > deadline {
                    warn!(prompt_id = %request.id, "Prompt deadline exceeded");
                    self.mark_cancelled(request);
                    return Err(PromptError::DeadlineExceeded);
                }
            }

            if response_path.exists() {
                let content = std::fs::read_to_string(&response_path)?;
                let response: PromptResponse = serde_json::from_str(&content)?;
                let _ = std::fs::remove_file(&response_path);
                let _ = std::fs::remove_file(&request_path);
                info!(prompt_id = %request.id, "Prompt resolved");
                return Ok(response);
            }

            sleep(interval).await;
        }
    }

    /// Append a serialized copy of the request to the notifier outbox
    fn notify(&self, request: &PromptRequest) -> Result<(), PromptError> {
        let outbox = self.prompts_dir.join("outbox.jsonl");
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(outbox)?;
        writeln!(file, "{}", serde_json::to_string(request)?)?;
        Ok(())
    }

    fn mark_cancelled(&self, request: &PromptRequest) {
        let mut cancelled = request.clone();
        cancelled.cancelled = true;
        if let Ok(json) = serde_json::to_vec_pretty(&cancelled) {
            let _ = std::fs::write(self.request_path(&request.id), json);
        }
    }

    /// Mark every pending request cancelled; returns how many were marked
    pub fn cancel_pending(&self) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.prompts_dir) else {
            return 0;
        };
        let mut count = 0;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".request.json") {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            let Ok(mut request) = serde_json::from_str::<PromptRequest>(&content) else {
                continue;
            };
            if request.cancelled {
                continue;
            }
            request.cancelled = true;
            if let Ok(json) = serde_json::to_vec_pretty(&request) {
                let _ = std::fs::write(entry.path(), json);
                debug!(prompt_id = %request.id, "cancel_pending: marked request cancelled");
                count += 1;
            }
        }
        count
    }
}

/// Blocking terminal prompt, run off the async runtime
async fn terminal_prompt(request: PromptRequest) -> Result<PromptResponse, PromptError> {
    tokio::task::spawn_blocking(move || {
        let mut response = PromptResponse::default();
        println!("\n{} {}", "luigi needs input:".bold(), request.kind.to_string().cyan());
        for question in &request.questions {
            println!("  {}", question);
            print!("> ");
            std::io::stdout().flush()?;
            let mut line = String::new();
            std::io::stdin().read_line(&mut line)?;
            response.answers.push(line.trim().to_string());
        }
        if request.kind == PromptKind::AdminTiebreak {
            print!("{} ", "Winning candidate id:".bold());
            std::io::stdout().flush()?;
            let mut line = String::new();
            std::io::stdin().read_line(&mut line)?;
            response.winner = Some(line.trim().to_string());

            print!("{} ", "Verdict (approved/rejected):".bold());
            std::io::stdout().flush()?;
            let mut line = String::new();
            std::io::stdin().read_line(&mut line)?;
            response.verdict = match line.trim() {
                "approved" => Some(Verdict::Approved),
                _ => Some(Verdict::Rejected),
            };
        }
        Ok(response)
    })
    .await
    .map_err(|e| PromptError::Io(std::io::Error::other(e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn channel(dir: &std::path::Path, config: PromptConfig) -> (watch::Sender<bool>, Arc<PromptChannel>) {
        let (tx, rx) = watch::channel(false);
        let channel = PromptChannel::new(dir, config, rx).with_interactive(false);
        (tx, Arc::new(channel))
    }

    fn fast_config() -> PromptConfig {
        PromptConfig { poll_interval_ms: 20, ..Default::default() }
    }

    #[tokio::test]
    async fn test_ask_resolves_on_response_file() {
        let temp = tempdir().unwrap();
        let (_tx, channel) = channel(temp.path(), fast_config());
        let request = PromptRequest::new(
            PromptKind::ReviewerClarification,
            vec!["throw or return null?".into()],
        );
        let request_id = request.id.clone();

        let ask = tokio::spawn({
            let channel = channel.clone();
            let request = request.clone();
            async move { channel.ask(&request).await }
        });

        // Wait for the request file to appear, then answer it
        let request_path = temp.path().join(format!("{}.request.json", request_id));
        for _ in 0..100 {
            if request_path.exists() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(request_path.exists());

        let response = PromptResponse::answer("throw");
        std::fs::write(
            temp.path().join(format!("{}.response.json", request_id)),
            serde_json::to_vec(&response).unwrap(),
        )
        .unwrap();

        let resolved = ask.await.unwrap().unwrap();
        assert_eq!(resolved.answers, ["throw"]);

        // Both files are deleted after resolution
        assert!(!request_path.exists());
        assert!(!temp.path().join(format!("{}.response.json", request_id)).exists());
    }

    #[tokio::test]
    async fn test_outbox_receives_copy() {
        let temp = tempdir().unwrap();
        let (_tx, channel) = channel(temp.path(), fast_config());
        let request = PromptRequest::new(PromptKind::InitialTask, vec!["what should I do?".into()]);
        let request_id = request.id.clone();

        let ask = tokio::spawn({
            let channel = channel.clone();
            let request = request.clone();
            async move { channel.ask(&request).await }
        });

        sleep(Duration::from_millis(50)).await;
        let outbox = std::fs::read_to_string(temp.path().join("outbox.jsonl")).unwrap();
        assert!(outbox.contains(&request_id));

        std::fs::write(
            temp.path().join(format!("{}.response.json", request_id)),
            serde_json::to_vec(&PromptResponse::answer("fix the bug")).unwrap(),
        )
        .unwrap();
        ask.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_marks_request() {
        let temp = tempdir().unwrap();
        let (tx, channel) = channel(temp.path(), fast_config());
        let request = PromptRequest::new(PromptKind::AdminTiebreak, vec!["pick one".into()]);
        let request_id = request.id.clone();

        let ask = tokio::spawn({
            let channel = channel.clone();
            let request = request.clone();
            async move { channel.ask(&request).await }
        });

        sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let result = ask.await.unwrap();
        assert!(matches!(result, Err(PromptError::Cancelled)));

        let content =
            std::fs::read_to_string(temp.path().join(format!("{}.request.json", request_id))).unwrap();
        let persisted: PromptRequest = serde_json::from_str(&content).unwrap();
        assert!(persisted.cancelled);
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let temp = tempdir().unwrap();
        let config = PromptConfig {
            poll_interval_ms: 20,
            deadline_ms: Some(100),
            ..Default::default()
        };
        let (_tx, channel) = channel(temp.path(), config);
        let request = PromptRequest::new(PromptKind::SessionNextTask, vec![]);

        let result = channel.ask(&request).await;
        assert!(matches!(result, Err(PromptError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_cancel_pending_sweeps_requests() {
        let temp = tempdir().unwrap();
        let (_tx, channel) = channel(temp.path(), fast_config());

        for i in 0..2 {
            let request = PromptRequest::new(PromptKind::ReviewerClarification, vec![format!("q{}", i)]);
            std::fs::write(
                temp.path().join(format!("{}.request.json", request.id)),
                serde_json::to_vec(&request).unwrap(),
            )
            .unwrap();
        }

        assert_eq!(channel.cancel_pending(), 2);
        // Second sweep finds nothing new
        assert_eq!(channel.cancel_pending(), 0);
    }
}
