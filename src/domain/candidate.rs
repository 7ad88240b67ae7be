//! Candidate domain type
//!
//! One executor's attempt to implement one plan in a dedicated workspace.
//! The candidate carries the full state machine for execution, including
//! clarification rounds and the opaque session id used to resume the
//! executor's conversation.

use serde::{Deserialize, Serialize};

use super::now_ms;
use super::workspace::Workspace;

/// Candidate status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    /// Created, executor not yet dispatched
    #[default]
    Pending,
    /// Executor in flight
    Running,
    /// Executor asked a question; waiting on reviewer answers
    NeedsClarification,
    /// Executor finished and tests were recorded
    Done,
    /// Executor or workspace failed terminally
    Failed,
}

impl std::fmt::Display for CandidateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::NeedsClarification => write!(f, "needs_clarification"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Normalized executor result status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorResultStatus {
    Done,
    NeedsClarification,
    Failed,
}

/// Normalized structured result from an executor invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorResult {
    pub status: ExecutorResultStatus,
    pub summary: String,
    #[serde(default)]
    pub questions: Vec<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Outcome of one test command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCommandResult {
    /// Command that ran
    pub argv: Vec<String>,
    /// Exit code (-1 when killed by signal)
    pub exit_code: i32,
    /// Elapsed wall-clock milliseconds
    pub duration_ms: u64,
    /// Captured stdout, truncated to the configured cap
    pub stdout: String,
    /// Captured stderr, truncated to the configured cap
    pub stderr: String,
    /// Whether the command hit its timeout
    pub timed_out: bool,
}

impl TestCommandResult {
    pub fn passed(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Summary of what a candidate changed in its workspace
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeSummary {
    /// Changed paths, relative to the workspace root, sorted
    pub changed_paths: Vec<String>,
    /// Total size of changed files in bytes
    pub total_bytes: u64,
    /// Textual diff, truncated to a byte bound
    pub diff: String,
    /// Whether the diff was truncated
    pub truncated: bool,
}

/// One executor's attempt to implement a plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    /// Unique within the run; zero-padded so lexicographic order is
    /// creation order
    pub id: String,

    /// Assigned executor agent
    pub executor_id: String,

    /// Plan this candidate implements (same iteration)
    pub plan_id: String,

    /// Dedicated workspace, attached once provisioned
    pub workspace: Option<Workspace>,

    /// Current status
    pub status: CandidateStatus,

    /// Opaque executor session id for conversation resume
    pub session_id: Option<String>,

    /// Last structured executor result
    pub last_result: Option<ExecutorResult>,

    /// Accumulated test results
    pub test_results: Vec<TestCommandResult>,

    /// Summary of workspace changes
    pub diff_summary: Option<ChangeSummary>,

    /// Clarification rounds consumed so far
    pub clarification_rounds: u32,

    /// Terminal error message (failed candidates)
    pub error: Option<String>,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
}

impl Candidate {
    pub fn new(
        id: impl Into<String>,
        executor_id: impl Into<String>,
        plan_id: impl Into<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            id: id.into(),
            executor_id: executor_id.into(),
            plan_id: plan_id.into(),
            workspace: None,
            status: CandidateStatus::Pending,
            session_id: None,
            last_result: None,
            test_results: Vec::new(),
            diff_summary: None,
            clarification_rounds: 0,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: CandidateStatus) {
        self.status = status;
        self.updated_at = now_ms();
    }

    pub fn set_workspace(&mut self, workspace: Workspace) {
        self.workspace = Some(workspace);
        self.updated_at = now_ms();
    }

    pub fn record_result(&mut self, result: ExecutorResult) {
        if let Some(session) = &result.session_id {
            self.session_id = Some(session.clone());
        }
        self.last_result = Some(result);
        self.updated_at = now_ms();
    }

    pub fn record_tests(&mut self, results: Vec<TestCommandResult>) {
        self.test_results = results;
        self.updated_at = now_ms();
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
        self.set_status(CandidateStatus::Failed);
    }

    /// Terminal: done or failed
    pub fn is_settled(&self) -> bool {
        matches!(self.status, CandidateStatus::Done | CandidateStatus::Failed)
    }

    /// Whether tests have been recorded for this candidate
    pub fn has_test_results(&self) -> bool {
        !self.test_results.is_empty()
    }
}
