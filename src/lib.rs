//! Luigi - multi-agent coding orchestrator
//!
//! Given a natural-language task and a target repository, Luigi drives a
//! loop of external agent programs (planners/reviewers and executors) that
//! produce, implement, and review code changes, running plan-provided test
//! commands and iterating until a reviewer approves or a bound is reached.
//!
//! # Core concepts
//!
//! - **Agents are child processes**: planners, executors, and reviewers are
//!   invoked with a small CLI contract and answer with structured JSON
//! - **State in files**: every run persists an atomically rewritten
//!   snapshot plus an append-only history log, so crashed runs resume at
//!   the right phase
//! - **Candidates compete**: each plan fans out to several executors in
//!   isolated workspaces; reviewer rankings pick the winner by consensus
//!
//! # Modules
//!
//! - [`domain`] - runs, iterations, plans, candidates, reviews
//! - [`state`] - snapshot/history persistence and resume classification
//! - [`workspace`] - in-place / copy / worktree working trees
//! - [`agent`] - child-process adapters and the wire protocol
//! - [`testrun`] - plan test-command execution
//! - [`prompt`] - file-based human input channel
//! - [`scheduler`] - the per-iteration coordinator and consensus
//! - [`orchestrator`] - the top-level run loop

pub mod agent;
pub mod cli;
pub mod config;
pub mod domain;
pub mod orchestrator;
pub mod prompt;
pub mod scheduler;
pub mod state;
pub mod testrun;
pub mod workspace;

pub use agent::{AgentAdapter, AgentError, AgentSpec, CliAgent, MockAgent};
pub use config::{Config, ConfigError};
pub use domain::{
    Candidate, CandidateStatus, Iteration, IterationDecision, Plan, PromptKind, PromptRequest,
    PromptResponse, Review, Run, RunStatus, Verdict, Workspace, WorkspaceStrategy,
};
pub use orchestrator::{Orchestrator, RunReport};
pub use prompt::{PromptChannel, PromptConfig, PromptError};
pub use scheduler::{IterationOutcome, IterationScheduler, SchedulerConfig};
pub use state::{ResumeStage, RunEvent, StateStore, StorageError};
pub use testrun::{TestRunConfig, TestRunError, run_tests};
pub use workspace::{DisposePolicy, WorkspaceConfig, WorkspaceError, WorkspaceManager};
