//! Child-process agent invocation
//!
//! Spawns an agent with the invocation contract: a working-directory flag,
//! an output flag naming the file the agent writes its final structured
//! message to, an optional session-resume flag, and the prompt as the final
//! positional argument. stdout/stderr go to a per-invocation log file.
//!
//! On timeout or cancellation the child gets SIGTERM, then SIGKILL after a
//! grace period.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Per-invocation failure
#[derive(Debug, Error)]
pub enum AgentInvocationError {
    #[error("Failed to spawn agent: {0}")]
    Spawn(std::io::Error),

    #[error("Agent timed out after {0:?}")]
    Timeout(Duration),

    #[error("Agent exited with {code:?} and produced no structured message")]
    NoMessage { code: Option<i32> },

    #[error("Invocation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Timeout and termination settings for one invocation
#[derive(Debug, Clone)]
pub struct InvocationConfig {
    /// Wall-clock bound on the child process
    pub timeout: Duration,
    /// Delay between SIGTERM and SIGKILL
    pub term_grace: Duration,
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            term_grace: Duration::from_secs(5),
        }
    }
}

/// One agent invocation
pub struct Invocation<'a> {
    /// Program and base arguments
    pub argv: &'a [String],
    /// Working directory passed via `--cwd`
    pub cwd: &'a Path,
    /// Prompt text, beginning with a phase sentinel
    pub prompt: &'a str,
    /// Session to resume, passed via `--resume`
    pub resume_session: Option<&'a str>,
    /// stdout/stderr capture file
    pub log_path: &'a Path,
    /// File the agent writes its final structured message to
    pub output_path: &'a Path,
}

/// Run an agent to completion and return its structured message text
pub async fn invoke(
    inv: Invocation<'_>,
    config: &InvocationConfig,
    cancel: &watch::Receiver<bool>,
) -> Result<String, AgentInvocationError> {
    if *cancel.borrow() {
        return Err(AgentInvocationError::Cancelled);
    }
    let (program, base_args) = inv
        .argv
        .split_first()
        .ok_or_else(|| AgentInvocationError::Spawn(std::io::Error::other("empty agent argv")))?;

    let log = std::fs::File::create(inv.log_path)?;
    let log_err = log.try_clone()?;

    let mut cmd = Command::new(program);
    cmd.args(base_args)
        .arg("--cwd")
        .arg(inv.cwd)
        .arg("--output-last-message")
        .arg(inv.output_path);
    if let Some(session) = inv.resume_session {
        cmd.arg("--resume").arg(session);
    }
    cmd.arg(inv.prompt)
        .current_dir(inv.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .kill_on_drop(true);

    debug!(%program, cwd = %inv.cwd.display(), resume = ?inv.resume_session, "invoke: spawning agent");
    let mut child = cmd.spawn().map_err(AgentInvocationError::Spawn)?;

    let mut cancel_rx = cancel.clone();
    let status = tokio::select! {
        status = child.wait() => status?,
        _ = sleep(config.timeout) => {
            warn!(%program, timeout = ?config.timeout, "invoke: agent timed out");
            terminate(&mut child, config.term_grace).await;
            return Err(AgentInvocationError::Timeout(config.timeout));
        }
        _ = cancelled(&mut cancel_rx) => {
            warn!(%program, "invoke: cancelled, terminating agent");
            terminate(&mut child, config.term_grace).await;
            return Err(AgentInvocationError::Cancelled);
        }
    };

    let message = std::fs::read_to_string(inv.output_path).unwrap_or_default();
    if message.trim().is_empty() {
        return Err(AgentInvocationError::NoMessage { code: status.code() });
    }
    // A non-zero exit with a structured message is the agent's to explain;
    // the message decides the outcome.
    debug!(%program, code = ?status.code(), "invoke: agent finished with message");
    Ok(message)
}

/// Resolve once the cancel flag flips to true; pend forever otherwise
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if *rx.borrow() {
        return;
    }
    while rx.changed().await.is_ok() {
        if *rx.borrow() {
            return;
        }
    }
    // Sender dropped without cancelling
    std::future::pending::<()>().await;
}

/// SIGTERM, grace period, then SIGKILL
async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        tokio::select! {
            _ = child.wait() => return,
            _ = sleep(grace) => {}
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}
