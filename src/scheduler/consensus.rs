//! Reviewer consensus
//!
//! Combines per-reviewer preference rankings with a Borda count: with M
//! candidates, rank position i scores M-1-i points, summed across reviewers.
//! Ties break toward the earliest candidate id (creation order). The
//! iteration verdict is unanimous agreement on the winner; disagreement
//! escalates to the admin.

use std::collections::BTreeMap;

use tracing::debug;

use crate::domain::{Review, Verdict};

/// Outcome of combining all reviews
#[derive(Debug, Clone)]
pub struct ConsensusResult {
    /// Borda winner, ties broken by earliest candidate id
    pub winner: String,

    /// Total Borda score per candidate
    pub scores: BTreeMap<String, usize>,

    /// Verdict shared by every reviewer on the winner; `None` means the
    /// reviewers disagree and the decision escalates to the admin
    pub unanimous_verdict: Option<Verdict>,
}

/// Compute the consensus over final reviews
///
/// Each reviewer's ranking counts once, regardless of how many reviews they
/// filed. Candidates missing from a ranking score nothing from it.
pub fn consensus(candidate_ids: &[String], reviews: &[Review]) -> Option<ConsensusResult> {
    if candidate_ids.is_empty() {
        return None;
    }

    let scores = borda_scores(candidate_ids, reviews);
    let top = scores.values().copied().max().unwrap_or(0);
    // BTreeMap iterates ids in order, so the first max is the earliest id
    let winner = scores
        .iter()
        .find(|(_, score)| **score == top)
        .map(|(id, _)| id.clone())?;

    // One verdict per reviewer on the winner; later reviews supersede
    let mut verdicts: BTreeMap<&str, Verdict> = BTreeMap::new();
    for review in reviews.iter().filter(|r| r.candidate_id == winner) {
        verdicts.insert(&review.reviewer_id, review.verdict);
    }
    let mut iter = verdicts.values();
    let unanimous_verdict = match iter.next() {
        Some(first) if iter.all(|v| v == first) => Some(*first),
        _ => None,
    };

    debug!(%winner, top, ?unanimous_verdict, "consensus computed");
    Some(ConsensusResult { winner, scores, unanimous_verdict })
}

/// Borda totals per candidate, one ranking per reviewer
fn borda_scores(candidate_ids: &[String], reviews: &[Review]) -> BTreeMap<String, usize> {
    let mut scores: BTreeMap<String, usize> =
        candidate_ids.iter().map(|id| (id.clone(), 0)).collect();

    // Last-filed ranking per reviewer wins
    let mut rankings: BTreeMap<&str, &[String]> = BTreeMap::new();
    for review in reviews {
        if !review.ranking.is_empty() {
            rankings.insert(&review.reviewer_id, &review.ranking);
        }
    }

    let m = candidate_ids.len();
    for ranking in rankings.values() {
        for (position, candidate_id) in ranking.iter().enumerate() {
            if let Some(score) = scores.get_mut(candidate_id) {
                *score += m.saturating_sub(position + 1);
            }
        }
    }
    scores
}
