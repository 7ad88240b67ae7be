//! Plan domain type
//!
//! Structured planner output: the executor prompt, ordered tasks, and the
//! test commands that decide whether an implementation passes. A plan with
//! `test_commands: None` asks for the configured fallback commands.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::now_ms;

/// One test command from a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCommand {
    /// Command and arguments
    pub argv: Vec<String>,

    /// Working directory override, relative to the workspace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    /// Per-command timeout in seconds (overrides the global timeout)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_sec: Option<u64>,
}

impl TestCommand {
    pub fn new(argv: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            cwd: None,
            timeout_sec: None,
        }
    }
}

/// Structured output from one planning reviewer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Unique identifier
    pub id: String,

    /// Reviewer that issued this plan
    pub reviewer_id: String,

    /// Prompt handed to executors
    pub executor_prompt: String,

    /// Ordered task list
    pub tasks: Vec<String>,

    /// Test commands; `None` means "use the configured fallback commands".
    /// When present the list is non-empty.
    pub test_commands: Option<Vec<TestCommand>>,

    /// Optional extra context from the planner
    pub notes: Option<String>,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,
}

impl Plan {
    pub fn new(
        id: impl Into<String>,
        reviewer_id: impl Into<String>,
        executor_prompt: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            reviewer_id: reviewer_id.into(),
            executor_prompt: executor_prompt.into(),
            tasks: Vec::new(),
            test_commands: None,
            notes: None,
            created_at: now_ms(),
        }
    }

    /// Whether this plan defers to the fallback test commands
    pub fn uses_fallback_tests(&self) -> bool {
        self.test_commands.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_fallback_sentinel() {
        let plan = Plan::new("plan-1", "rev-a", "do the thing");
        assert!(plan.uses_fallback_tests());

        let mut plan = plan;
        plan.test_commands = Some(vec![TestCommand::new(["node", "test.js"])]);
        assert!(!plan.uses_fallback_tests());
    }

    #[test]
    fn test_test_command_serde_optionals_omitted() {
        let cmd = TestCommand::new(["npm", "test"]);
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(!json.contains("cwd"));
        assert!(!json.contains("timeout_sec"));
    }

    #[test]
    fn test_test_command_roundtrip() {
        let cmd = TestCommand {
            argv: vec!["cargo".into(), "test".into()],
            cwd: Some(PathBuf::from("sub")),
            timeout_sec: Some(120),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        let back: TestCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(cmd, back);
    }
}
