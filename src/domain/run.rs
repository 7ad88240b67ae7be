//! Run domain type
//!
//! The unit of work for one user task, from submission to terminal status.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::iteration::Iteration;
use super::now_ms;
use super::workspace::Workspace;

/// Run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not yet started
    #[default]
    Pending,
    /// Actively iterating
    Running,
    /// Session mode: waiting for the next task
    Idle,
    /// An iteration was approved and persistence (if requested) succeeded
    Completed,
    /// Terminal failure; see `failure`
    Failed,
    /// User or signal abort
    Aborted,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Idle => write!(f, "idle"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Machine-readable terminal failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailure {
    /// Stable failure kind, e.g. `max-iterations-exceeded`
    pub kind: String,
    /// Human-readable message
    pub message: String,
}

/// The lifecycle of one user task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Stable identifier
    pub id: String,

    /// Target repository path
    pub repo: PathBuf,

    /// Initial task text
    pub task: String,

    /// Current status
    pub status: RunStatus,

    /// Plan/execute/review cycles, in order
    pub iterations: Vec<Iteration>,

    /// Index of the approved iteration on completion
    pub winning_iteration: Option<u32>,

    /// Baseline workspace of the open iteration; carry-forward replaces it
    /// with a copy of the previous winner
    #[serde(default)]
    pub baseline: Option<Workspace>,

    /// Terminal failure details
    pub failure: Option<RunFailure>,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
}

impl Run {
    pub fn new(repo: impl Into<PathBuf>, task: impl Into<String>) -> Self {
        let task = task.into();
        let now = now_ms();
        Self {
            id: super::generate_id("run", &task),
            repo: repo.into(),
            task,
            status: RunStatus::Pending,
            iterations: Vec::new(),
            winning_iteration: None,
            baseline: None,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: RunStatus) {
        self.status = status;
        self.updated_at = now_ms();
    }

    pub fn fail(&mut self, kind: impl Into<String>, message: impl Into<String>) {
        self.failure = Some(RunFailure { kind: kind.into(), message: message.into() });
        self.set_status(RunStatus::Failed);
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, RunStatus::Completed | RunStatus::Failed | RunStatus::Aborted)
    }

    /// The iteration currently in flight (last one, if undecided)
    pub fn open_iteration(&self) -> Option<&Iteration> {
        self.iterations.last().filter(|it| !it.is_decided())
    }

    pub fn open_iteration_mut(&mut self) -> Option<&mut Iteration> {
        self.iterations.last_mut().filter(|it| !it.is_decided())
    }

    pub fn iteration(&self, index: u32) -> Option<&Iteration> {
        self.iterations.get(index as usize)
    }

    pub fn iteration_mut(&mut self, index: u32) -> Option<&mut Iteration> {
        self.iterations.get_mut(index as usize)
    }

    /// Start the next iteration and return its index
    pub fn push_iteration(&mut self) -> u32 {
        let index = self.iterations.len() as u32;
        self.iterations.push(Iteration::new(index));
        self.updated_at = now_ms();
        index
    }
}
