//! Scripted in-process agent for tests
//!
//! Queues canned replies per operation and records every call, so scheduler
//! and orchestrator tests run without child processes. Falls back to benign
//! defaults (a trivial plan, DONE, APPROVED) when a queue runs dry.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::domain::{ExecutorResult, ExecutorResultStatus};

use super::adapter::{
    AgentAdapter, AgentError, ClarifyRequest, ExecuteRequest, PlanDraft, PlanRequest,
    PlannerOutcome, ReviewOutcome, ReviewRequest,
};

/// A recorded call against the mock
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Plan,
    Execute { candidate: String, session: Option<String> },
    Review { candidate: String },
    Clarify { questions: Vec<String> },
}

/// Scripted agent
pub struct MockAgent {
    id: String,
    plans: Mutex<VecDeque<PlannerOutcome>>,
    executions: Mutex<HashMap<String, VecDeque<ExecutorResult>>>,
    reviews: Mutex<HashMap<String, VecDeque<ReviewOutcome>>>,
    clarifications: Mutex<VecDeque<Vec<String>>>,
    calls: Mutex<Vec<MockCall>>,
}

impl MockAgent {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            plans: Mutex::new(VecDeque::new()),
            executions: Mutex::new(HashMap::new()),
            reviews: Mutex::new(HashMap::new()),
            clarifications: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push_plan(&self, outcome: PlannerOutcome) {
        self.plans.lock().unwrap().push_back(outcome);
    }

    /// Queue an execution result for a specific candidate
    pub fn push_execution(&self, candidate_id: impl Into<String>, result: ExecutorResult) {
        self.executions
            .lock()
            .unwrap()
            .entry(candidate_id.into())
            .or_default()
            .push_back(result);
    }

    /// Queue a review outcome for a specific candidate
    pub fn push_review(&self, candidate_id: impl Into<String>, outcome: ReviewOutcome) {
        self.reviews
            .lock()
            .unwrap()
            .entry(candidate_id.into())
            .or_default()
            .push_back(outcome);
    }

    pub fn push_clarification(&self, answers: Vec<String>) {
        self.clarifications.lock().unwrap().push_back(answers);
    }

    /// All calls recorded so far
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Sessions seen by execute calls for one candidate, in order
    pub fn execute_sessions(&self, candidate_id: &str) -> Vec<Option<String>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::Execute { candidate, session } if candidate == candidate_id => {
                    Some(session)
                }
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl AgentAdapter for MockAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn plan(&self, _req: PlanRequest<'_>) -> Result<PlannerOutcome, AgentError> {
        self.calls.lock().unwrap().push(MockCall::Plan);
        Ok(self.plans.lock().unwrap().pop_front().unwrap_or_else(|| {
            PlannerOutcome::Plan(PlanDraft {
                executor_prompt: "implement the task".into(),
                tasks: Vec::new(),
                test_commands: None,
                notes: None,
            })
        }))
    }

    async fn execute(&self, req: ExecuteRequest<'_>) -> Result<ExecutorResult, AgentError> {
        self.calls.lock().unwrap().push(MockCall::Execute {
            candidate: req.candidate_id.to_string(),
            session: req.session.map(String::from),
        });
        let queued = self
            .executions
            .lock()
            .unwrap()
            .get_mut(req.candidate_id)
            .and_then(VecDeque::pop_front);
        Ok(queued.unwrap_or(ExecutorResult {
            status: ExecutorResultStatus::Done,
            summary: "done".into(),
            questions: Vec::new(),
            session_id: None,
            notes: None,
        }))
    }

    async fn review(&self, req: ReviewRequest<'_>) -> Result<ReviewOutcome, AgentError> {
        self.calls.lock().unwrap().push(MockCall::Review {
            candidate: req.candidate_id.to_string(),
        });
        let queued = self
            .reviews
            .lock()
            .unwrap()
            .get_mut(req.candidate_id)
            .and_then(VecDeque::pop_front);
        Ok(queued.unwrap_or_else(|| ReviewOutcome::Review {
            verdict: crate::domain::Verdict::Approved,
            ranking: req.candidate_ids.to_vec(),
            feedback: "ok".into(),
        }))
    }

    async fn clarify(&self, req: ClarifyRequest<'_>) -> Result<Vec<String>, AgentError> {
        self.calls.lock().unwrap().push(MockCall::Clarify {
            questions: req.questions.to_vec(),
        });
        Ok(self
            .clarifications
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec!["proceed as planned".into()]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[tokio::test]
    async fn test_mock_defaults() {
        let agent = MockAgent::new("mock-1");

        let plan = agent
            .plan(PlanRequest { task: "t", context: None, cwd: Path::new("/tmp") })
            .await
            .unwrap();
        assert!(matches!(plan, PlannerOutcome::Plan(_)));

        let result = agent
            .execute(ExecuteRequest {
                candidate_id: "cand-00-01",
                prompt: "p",
                workspace: Path::new("/tmp"),
                session: None,
                answers: None,
            })
            .await
            .unwrap();
        assert_eq!(result.status, ExecutorResultStatus::Done);
    }

    #[tokio::test]
    async fn test_mock_records_sessions() {
        let agent = MockAgent::new("mock-1");

        for session in [None, Some("sess-1")] {
            agent
                .execute(ExecuteRequest {
                    candidate_id: "cand-00-01",
                    prompt: "p",
                    workspace: Path::new("/tmp"),
                    session,
                    answers: None,
                })
                .await
                .unwrap();
        }

        assert_eq!(
            agent.execute_sessions("cand-00-01"),
            vec![None, Some("sess-1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_mock_keyed_queues() {
        let agent = MockAgent::new("mock-1");
        agent.push_execution(
            "cand-00-02",
            ExecutorResult {
                status: ExecutorResultStatus::Failed,
                summary: "broke".into(),
                questions: Vec::new(),
                session_id: None,
                notes: None,
            },
        );

        // Unkeyed candidate gets the default
        let first = agent
            .execute(ExecuteRequest {
                candidate_id: "cand-00-01",
                prompt: "p",
                workspace: Path::new("/tmp"),
                session: None,
                answers: None,
            })
            .await
            .unwrap();
        assert_eq!(first.status, ExecutorResultStatus::Done);

        let second = agent
            .execute(ExecuteRequest {
                candidate_id: "cand-00-02",
                prompt: "p",
                workspace: Path::new("/tmp"),
                session: None,
                answers: None,
            })
            .await
            .unwrap();
        assert_eq!(second.status, ExecutorResultStatus::Failed);
    }
}
