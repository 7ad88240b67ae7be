//! Prompt request and response records
//!
//! A PromptRequest is an outstanding question for a human: the initial task,
//! a reviewer's clarification, an admin tie-break, or the next task in
//! session mode. Requests are written to the run's prompt directory and
//! resolved by whichever collaborator answers first (response file, external
//! notifier, or the terminal).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::now_ms;
use super::review::Verdict;

/// What kind of human input a prompt asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PromptKind {
    /// Ask for the initial task (UI-first start)
    InitialTask,
    /// A reviewer needs user input before finalizing
    ReviewerClarification,
    /// Reviewers disagree; an admin picks winner and verdict
    AdminTiebreak,
    /// Session mode: ask for the next task
    SessionNextTask,
}

impl std::fmt::Display for PromptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InitialTask => write!(f, "initial-task"),
            Self::ReviewerClarification => write!(f, "reviewer-clarification"),
            Self::AdminTiebreak => write!(f, "admin-tiebreak"),
            Self::SessionNextTask => write!(f, "session-next-task"),
        }
    }
}

/// Outstanding question awaiting a human
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRequest {
    /// Unique identifier
    pub id: String,

    /// Kind of input requested
    pub kind: PromptKind,

    /// The questions to answer, in order
    pub questions: Vec<String>,

    /// Candidate context for tie-breaks: reviews and diffs, as JSON
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Optional absolute deadline (Unix milliseconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<i64>,

    /// Set when the run aborts with the prompt still pending
    #[serde(default)]
    pub cancelled: bool,
}

impl PromptRequest {
    pub fn new(kind: PromptKind, questions: Vec<String>) -> Self {
        Self {
            id: super::generate_id("prompt", &kind.to_string()),
            kind,
            questions,
            context: None,
            created_at: now_ms(),
            deadline_ms: None,
            cancelled: false,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// Human answer to a prompt request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptResponse {
    /// Answers, aligned with the request's questions where applicable
    #[serde(default)]
    pub answers: Vec<String>,

    /// Tie-break only: chosen candidate id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<String>,

    /// Tie-break only: chosen verdict
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
}

impl PromptResponse {
    pub fn answer(text: impl Into<String>) -> Self {
        Self { answers: vec![text.into()], winner: None, verdict: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_kind_serde() {
        let json = serde_json::to_string(&PromptKind::AdminTiebreak).unwrap();
        assert_eq!(json, "\"admin-tiebreak\"");
    }

    #[test]
    fn test_request_id_carries_kind() {
        let req = PromptRequest::new(PromptKind::SessionNextTask, vec![]);
        assert!(req.id.contains("-prompt-"));
        assert!(req.id.contains("session-next-task"));
    }

    #[test]
    fn test_tiebreak_response_roundtrip() {
        let resp = PromptResponse {
            answers: vec![],
            winner: Some("cand-00-02".into()),
            verdict: Some(Verdict::Approved),
        };
        let json = serde_json::to_string(&resp).unwrap();
        let back: PromptResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back.winner.as_deref(), Some("cand-00-02"));
        assert_eq!(back.verdict, Some(Verdict::Approved));
    }

    #[test]
    fn test_response_defaults() {
        let back: PromptResponse = serde_json::from_str("{}").unwrap();
        assert!(back.answers.is_empty());
        assert!(back.winner.is_none());
    }
}
