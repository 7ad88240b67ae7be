//! Agent adapters
//!
//! Planner/reviewer and executor programs are external child processes; this
//! module owns the invocation contract, the structured-message protocol, and
//! the capability trait the rest of the engine programs against.

pub mod adapter;
pub mod mock;
pub mod process;
pub mod protocol;

pub use adapter::{
    AgentAdapter, AgentError, AgentKind, AgentSpec, ClarifyRequest, CliAgent, ExecuteRequest,
    PlanDraft, PlanRequest, PlannerOutcome, RetryConfig, ReviewOutcome, ReviewRequest,
    build_agents,
};
pub use mock::{MockAgent, MockCall};
pub use process::{AgentInvocationError, Invocation, InvocationConfig, invoke};
pub use protocol::{
    AgentProtocolError, PHASE_EXECUTE, PHASE_PLAN, PHASE_REVIEW, parse_clarify, parse_executor,
    parse_planner, parse_review,
};
