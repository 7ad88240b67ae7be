//! History log events
//!
//! Every mutation of the run snapshot appends one of these to `history.log`
//! as a JSON line. The log is append-only and never rewritten; readers may
//! tail it without synchronization.

use serde::{Deserialize, Serialize};

use crate::domain::now_ms;

/// One event kind per snapshot mutation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunCreated { run_id: String, task: String },
    RunStatusChanged { status: String },
    IterationStarted { index: u32 },
    PlanRecorded { iteration: u32, plan_id: String, reviewer_id: String },
    CandidatesAssigned { iteration: u32, count: usize },
    CandidateUpdated { candidate_id: String, status: String },
    TestsRecorded { candidate_id: String, passed: usize, failed: usize },
    ReviewRecorded { candidate_id: String, reviewer_id: String, verdict: String },
    DecisionRecorded { iteration: u32, decision: String, winner: Option<String> },
    PromptOpened { prompt_id: String, kind: String },
    PromptResolved { prompt_id: String },
    PromptCancelled { prompt_id: String },
    WorkspaceProvisioned { owner: String, path: String },
    WorkspaceDisposed { path: String },
    MergeCompleted { target: String },
    MergeConflictDetected { message: String },
}

/// A history log line: timestamp plus event payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Unix milliseconds
    pub ts: i64,

    #[serde(flatten)]
    pub event: RunEvent,
}

impl HistoryEntry {
    pub fn new(event: RunEvent) -> Self {
        Self { ts: now_ms(), event }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_tagged() {
        let entry = HistoryEntry::new(RunEvent::IterationStarted { index: 2 });
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"event\":\"iteration_started\""));
        assert!(json.contains("\"index\":2"));
        assert!(json.contains("\"ts\""));
    }

    #[test]
    fn test_entry_roundtrip() {
        let entry = HistoryEntry::new(RunEvent::DecisionRecorded {
            iteration: 0,
            decision: "approved".into(),
            winner: Some("cand-00-01".into()),
        });
        let json = serde_json::to_string(&entry).unwrap();
        let back: HistoryEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event, entry.event);
    }
}
