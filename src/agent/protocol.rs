//! Agent wire protocol
//!
//! Every agent is a child process that writes its final structured message
//! as JSON to the path given by `--output-last-message`. This module parses
//! and validates those messages and converts them into domain records.
//!
//! Prompts are routed with a leading phase sentinel so mocks and future
//! agents can dispatch without real argument parsing.

use serde::Deserialize;
use thiserror::Error;

use crate::domain::{ExecutorResult, ExecutorResultStatus, TestCommand, Verdict};

/// Prompt sentinels, always the first line of the prompt text
pub const PHASE_PLAN: &str = "PHASE: PLAN";
pub const PHASE_EXECUTE: &str = "PHASE: EXECUTE";
pub const PHASE_REVIEW: &str = "PHASE: REVIEW";

/// The structured message failed validation
#[derive(Debug, Error)]
pub enum AgentProtocolError {
    #[error("Agent wrote an empty structured message")]
    EmptyMessage,

    #[error("Malformed structured message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Structured message does not validate: {0}")]
    Invalid(String),
}

/// One test command as reported by a planner
#[derive(Debug, Clone, Deserialize)]
pub struct TestCommandMsg {
    pub argv: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub timeout_sec: Option<u64>,
}

impl From<TestCommandMsg> for TestCommand {
    fn from(msg: TestCommandMsg) -> Self {
        TestCommand {
            argv: msg.argv,
            cwd: msg.cwd.map(Into::into),
            timeout_sec: msg.timeout_sec,
        }
    }
}

/// Planner output: the executor prompt, tasks, and test commands.
/// `test_commands: null` asks for the configured fallback commands.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanMessage {
    pub claude_prompt: String,
    #[serde(default)]
    pub tasks: Vec<String>,
    #[serde(default)]
    pub test_commands: Option<Vec<TestCommandMsg>>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
enum NeedsUserInputTag {
    #[serde(rename = "NEEDS_USER_INPUT")]
    NeedsUserInput,
}

/// A planner asking for human input instead of producing a plan
#[derive(Debug, Clone, Deserialize)]
pub struct PlannerQuestions {
    #[allow(dead_code)]
    status: NeedsUserInputTag,
    #[serde(default)]
    pub questions: Vec<String>,
}

/// Either a plan or a request for user input
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PlannerReply {
    NeedsInput(PlannerQuestions),
    Plan(PlanMessage),
}

/// Executor result status. `NEEDS_CODEX` is the historical spelling of
/// `NEEDS_REVIEWER` and must keep parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ExecutorStatusMsg {
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "NEEDS_REVIEWER", alias = "NEEDS_CODEX")]
    NeedsReviewer,
    #[serde(rename = "FAILED")]
    Failed,
}

/// Structured result from an executor invocation
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorMessage {
    pub status: ExecutorStatusMsg,
    pub summary: String,
    #[serde(default)]
    pub questions: Vec<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl From<ExecutorMessage> for ExecutorResult {
    fn from(msg: ExecutorMessage) -> Self {
        ExecutorResult {
            status: match msg.status {
                ExecutorStatusMsg::Done => ExecutorResultStatus::Done,
                ExecutorStatusMsg::NeedsReviewer => ExecutorResultStatus::NeedsClarification,
                ExecutorStatusMsg::Failed => ExecutorResultStatus::Failed,
            },
            summary: msg.summary,
            questions: msg.questions,
            session_id: msg.session_id,
            notes: msg.notes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ReviewStatusMsg {
    #[serde(rename = "APPROVED")]
    Approved,
    #[serde(rename = "REJECTED")]
    Rejected,
    #[serde(rename = "NEEDS_USER_INPUT")]
    NeedsUserInput,
}

/// Structured review from a reviewer invocation
#[derive(Debug, Clone, Deserialize)]
pub struct ReviewMessage {
    pub status: ReviewStatusMsg,
    #[serde(default)]
    pub ranking: Vec<String>,
    #[serde(default)]
    pub feedback: String,
    #[serde(default)]
    pub questions: Vec<String>,
}

impl ReviewMessage {
    pub fn verdict(&self) -> Option<Verdict> {
        match self.status {
            ReviewStatusMsg::Approved => Some(Verdict::Approved),
            ReviewStatusMsg::Rejected => Some(Verdict::Rejected),
            ReviewStatusMsg::NeedsUserInput => None,
        }
    }
}

/// Reviewer answers to an executor's questions
#[derive(Debug, Clone, Deserialize)]
struct ClarifyMessage {
    #[serde(default)]
    answers: Vec<String>,
}

/// Parse a planner's structured message
pub fn parse_planner(text: &str) -> Result<PlannerReply, AgentProtocolError> {
    let text = non_empty(text)?;
    let reply: PlannerReply = serde_json::from_str(text)?;
    if let PlannerReply::Plan(plan) = &reply {
        if plan.claude_prompt.trim().is_empty() {
            return Err(AgentProtocolError::Invalid("plan without an executor prompt".into()));
        }
        if matches!(&plan.test_commands, Some(cmds) if cmds.is_empty()) {
            return Err(AgentProtocolError::Invalid(
                "test_commands must be null or a non-empty list".into(),
            ));
        }
        if matches!(&plan.test_commands, Some(cmds) if cmds.iter().any(|c| c.argv.is_empty())) {
            return Err(AgentProtocolError::Invalid("test command with empty argv".into()));
        }
    }
    Ok(reply)
}

/// Parse an executor's structured message
pub fn parse_executor(text: &str) -> Result<ExecutorMessage, AgentProtocolError> {
    let text = non_empty(text)?;
    let msg: ExecutorMessage = serde_json::from_str(text)?;
    if msg.status == ExecutorStatusMsg::NeedsReviewer && msg.questions.is_empty() {
        return Err(AgentProtocolError::Invalid(
            "executor requested clarification without questions".into(),
        ));
    }
    Ok(msg)
}

/// Parse a reviewer's structured message
pub fn parse_review(text: &str) -> Result<ReviewMessage, AgentProtocolError> {
    let text = non_empty(text)?;
    Ok(serde_json::from_str(text)?)
}

/// Parse clarification answers. Lenient: an agent replying with plain text
/// instead of `{"answers": [...]}` contributes that text as a single answer.
pub fn parse_clarify(text: &str) -> Result<Vec<String>, AgentProtocolError> {
    let text = non_empty(text)?;
    match serde_json::from_str::<ClarifyMessage>(text) {
        Ok(msg) if !msg.answers.is_empty() => Ok(msg.answers),
        _ => Ok(vec![text.to_string()]),
    }
}

fn non_empty(text: &str) -> Result<&str, AgentProtocolError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(AgentProtocolError::EmptyMessage);
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plan() {
        let json = r#"{
            "claude_prompt": "implement divide-by-zero throw",
            "tasks": ["rewrite divide", "add guard"],
            "test_commands": [{"argv": ["node", "scripts/unit_test.js"]}]
        }"#;
        match parse_planner(json).unwrap() {
            PlannerReply::Plan(plan) => {
                assert_eq!(plan.tasks.len(), 2);
                let cmds = plan.test_commands.unwrap();
                assert_eq!(cmds[0].argv, ["node", "scripts/unit_test.js"]);
            }
            other => panic!("expected plan, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_plan_null_test_commands() {
        let json = r#"{"claude_prompt": "do it", "tasks": [], "test_commands": null}"#;
        match parse_planner(json).unwrap() {
            PlannerReply::Plan(plan) => assert!(plan.test_commands.is_none()),
            other => panic!("expected plan, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_plan_empty_test_commands_invalid() {
        let json = r#"{"claude_prompt": "do it", "test_commands": []}"#;
        assert!(matches!(parse_planner(json), Err(AgentProtocolError::Invalid(_))));
    }

    #[test]
    fn test_parse_planner_needs_input() {
        let json = r#"{"status": "NEEDS_USER_INPUT", "questions": ["which framework?"]}"#;
        match parse_planner(json).unwrap() {
            PlannerReply::NeedsInput(q) => assert_eq!(q.questions, ["which framework?"]),
            other => panic!("expected questions, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_executor_done() {
        let json = r#"{"status": "DONE", "summary": "rewrote divide", "session_id": "sess-1"}"#;
        let msg = parse_executor(json).unwrap();
        assert_eq!(msg.status, ExecutorStatusMsg::Done);
        assert_eq!(msg.session_id.as_deref(), Some("sess-1"));
    }

    #[test]
    fn test_needs_codex_alias() {
        let json = r#"{"status": "NEEDS_CODEX", "summary": "?", "questions": ["throw or null?"]}"#;
        let msg = parse_executor(json).unwrap();
        assert_eq!(msg.status, ExecutorStatusMsg::NeedsReviewer);

        let result: ExecutorResult = msg.into();
        assert_eq!(result.status, ExecutorResultStatus::NeedsClarification);
    }

    #[test]
    fn test_executor_clarification_requires_questions() {
        let json = r#"{"status": "NEEDS_REVIEWER", "summary": "stuck"}"#;
        assert!(matches!(parse_executor(json), Err(AgentProtocolError::Invalid(_))));
    }

    #[test]
    fn test_unknown_executor_status() {
        let json = r#"{"status": "MAYBE", "summary": "?"}"#;
        assert!(matches!(parse_executor(json), Err(AgentProtocolError::Json(_))));
    }

    #[test]
    fn test_parse_review() {
        let json = r#"{
            "status": "APPROVED",
            "ranking": ["cand-00-01", "cand-00-02"],
            "feedback": "clean fix"
        }"#;
        let msg = parse_review(json).unwrap();
        assert_eq!(msg.verdict(), Some(Verdict::Approved));
        assert_eq!(msg.ranking.len(), 2);
    }

    #[test]
    fn test_review_needs_user_input_has_no_verdict() {
        let json = r#"{"status": "NEEDS_USER_INPUT", "questions": ["is perf a goal?"]}"#;
        let msg = parse_review(json).unwrap();
        assert!(msg.verdict().is_none());
        assert_eq!(msg.questions.len(), 1);
    }

    #[test]
    fn test_parse_clarify_structured_and_lenient() {
        assert_eq!(parse_clarify(r#"{"answers": ["throw"]}"#).unwrap(), ["throw"]);
        assert_eq!(parse_clarify("just throw an error").unwrap(), ["just throw an error"]);
    }

    #[test]
    fn test_empty_message() {
        assert!(matches!(parse_executor("  \n"), Err(AgentProtocolError::EmptyMessage)));
    }
}
