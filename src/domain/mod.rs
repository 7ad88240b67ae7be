//! Core data model
//!
//! Runs, iterations, plans, candidates, reviews, prompt requests, and
//! workspace handles. Everything here serializes into the run snapshot;
//! behavior lives in the component modules.

pub mod candidate;
pub mod id;
pub mod iteration;
pub mod plan;
pub mod prompt;
pub mod review;
pub mod run;
pub mod workspace;

pub use candidate::{
    Candidate, CandidateStatus, ChangeSummary, ExecutorResult, ExecutorResultStatus,
    TestCommandResult,
};
pub use id::generate_id;
pub use iteration::{Iteration, IterationDecision};
pub use plan::{Plan, TestCommand};
pub use prompt::{PromptKind, PromptRequest, PromptResponse};
pub use review::{Review, ReviewStatus, Verdict};
pub use run::{Run, RunFailure, RunStatus};
pub use workspace::{Workspace, WorkspaceStrategy};

/// Current wall-clock time as Unix milliseconds (UTC).
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
