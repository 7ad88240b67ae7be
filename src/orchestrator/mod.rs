//! Run orchestration
//!
//! The top-level per-task state machine driving the iteration scheduler.

pub mod engine;

pub use engine::{AgentFactory, AgentSet, Orchestrator, RunReport};
