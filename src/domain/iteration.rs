//! Iteration domain type
//!
//! One plan → execute → test → review cycle within a run. The iteration owns
//! its plans, candidates, and reviews; cross references between them are ids,
//! never owning links, so the snapshot stays acyclic.

use serde::{Deserialize, Serialize};

use super::candidate::Candidate;
use super::now_ms;
use super::plan::Plan;
use super::review::Review;

/// Iteration decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationDecision {
    Approved,
    Rejected,
    /// Reviewers disagreed; waiting on the admin tie-break
    AdminEscalated,
    Aborted,
}

impl std::fmt::Display for IterationDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
            Self::AdminEscalated => write!(f, "admin_escalated"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// One plan/execute/review cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iteration {
    /// 0-based index within the run
    pub index: u32,

    /// One plan per planning reviewer
    pub plans: Vec<Plan>,

    /// One candidate per (plan, executor) pair
    pub candidates: Vec<Candidate>,

    /// Final reviews, one per (reviewer, candidate) pair
    pub reviews: Vec<Review>,

    /// Decision, absent while the iteration is open
    pub decision: Option<IterationDecision>,

    /// Winning candidate id, if one was selected
    pub winner: Option<String>,

    /// Start timestamp (Unix milliseconds)
    pub started_at: i64,

    /// Decision timestamp (Unix milliseconds)
    pub decided_at: Option<i64>,
}

impl Iteration {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            plans: Vec::new(),
            candidates: Vec::new(),
            reviews: Vec::new(),
            decision: None,
            winner: None,
            started_at: now_ms(),
            decided_at: None,
        }
    }

    pub fn plan(&self, plan_id: &str) -> Option<&Plan> {
        self.plans.iter().find(|p| p.id == plan_id)
    }

    pub fn candidate(&self, candidate_id: &str) -> Option<&Candidate> {
        self.candidates.iter().find(|c| c.id == candidate_id)
    }

    pub fn candidate_mut(&mut self, candidate_id: &str) -> Option<&mut Candidate> {
        self.candidates.iter_mut().find(|c| c.id == candidate_id)
    }

    /// Final reviews recorded for a candidate
    pub fn reviews_for(&self, candidate_id: &str) -> Vec<&Review> {
        self.reviews.iter().filter(|r| r.candidate_id == candidate_id).collect()
    }

    /// All candidates reached a terminal status
    pub fn candidates_settled(&self) -> bool {
        !self.candidates.is_empty() && self.candidates.iter().all(Candidate::is_settled)
    }

    /// Every (reviewer, candidate) pair has a final review
    pub fn reviews_complete(&self, reviewer_count: usize) -> bool {
        !self.candidates.is_empty()
            && self.reviews.iter().filter(|r| r.is_final()).count()
                >= reviewer_count * self.candidates.len()
    }

    pub fn is_decided(&self) -> bool {
        matches!(
            self.decision,
            Some(IterationDecision::Approved)
                | Some(IterationDecision::Rejected)
                | Some(IterationDecision::Aborted)
        )
    }

    pub fn decide(&mut self, decision: IterationDecision, winner: Option<String>) {
        self.decision = Some(decision);
        self.winner = winner;
        self.decided_at = Some(now_ms());
    }

    /// Every candidate's `plan_id` resolves within this iteration
    pub fn candidates_reference_plans(&self) -> bool {
        self.candidates.iter().all(|c| self.plan(&c.plan_id).is_some())
    }
}
