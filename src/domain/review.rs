//! Review domain type

use serde::{Deserialize, Serialize};

use super::now_ms;

/// Reviewer verdict on a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    Rejected,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// Review lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    /// Verdict and ranking are usable
    Final,
    /// Reviewer asked for human input before finalizing
    NeedsUserInput,
}

/// One reviewer's evaluation of one candidate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    /// Reviewer that produced this review
    pub reviewer_id: String,

    /// Candidate under review
    pub candidate_id: String,

    /// Verdict on this candidate
    pub verdict: Verdict,

    /// Preference order over all candidates in the iteration, best first
    pub ranking: Vec<String>,

    /// Free-form feedback
    pub feedback: String,

    /// Lifecycle status
    pub status: ReviewStatus,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,
}

impl Review {
    pub fn new(
        reviewer_id: impl Into<String>,
        candidate_id: impl Into<String>,
        verdict: Verdict,
    ) -> Self {
        Self {
            reviewer_id: reviewer_id.into(),
            candidate_id: candidate_id.into(),
            verdict,
            ranking: Vec::new(),
            feedback: String::new(),
            status: ReviewStatus::Final,
            created_at: now_ms(),
        }
    }

    pub fn is_final(&self) -> bool {
        self.status == ReviewStatus::Final
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_serde() {
        assert_eq!(serde_json::to_string(&Verdict::Approved).unwrap(), "\"approved\"");
        let v: Verdict = serde_json::from_str("\"rejected\"").unwrap();
        assert_eq!(v, Verdict::Rejected);
    }

    #[test]
    fn test_review_defaults_final() {
        let review = Review::new("rev-a", "cand-00-01", Verdict::Approved);
        assert!(review.is_final());
        assert!(review.ranking.is_empty());
    }
}
