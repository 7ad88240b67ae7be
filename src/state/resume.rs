//! Resume classification
//!
//! Maps a persisted run snapshot to the scheduler phase it should re-enter.
//! Classification is pure; workspace re-attachment happens later, when the
//! scheduler walks the open iteration's candidates.

use tracing::{debug, info};

use crate::domain::{IterationDecision, Run, RunStatus};

/// Where a resumed run re-enters the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeStage {
    /// No plans yet (or the next iteration hasn't started)
    Planning,
    /// Plans present, candidates incomplete; reuse workspaces where possible
    Execution,
    /// Candidates settled, reviews incomplete
    Review,
    /// Reviews complete, decision absent
    Consensus,
    /// Decision approved but the run never completed persistence
    Disposition,
    /// Nothing to do
    Terminal,
}

impl std::fmt::Display for ResumeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Planning => write!(f, "planning"),
            Self::Execution => write!(f, "execution"),
            Self::Review => write!(f, "review"),
            Self::Consensus => write!(f, "consensus"),
            Self::Disposition => write!(f, "disposition"),
            Self::Terminal => write!(f, "terminal"),
        }
    }
}

/// Classify a snapshot into the stage to re-enter
pub fn classify(run: &Run, reviewer_count: usize) -> ResumeStage {
    debug!(run_id = %run.id, status = %run.status, "classify: called");

    if run.is_terminal() {
        debug!("classify: run is terminal");
        return ResumeStage::Terminal;
    }

    let stage = match run.iterations.last() {
        None => ResumeStage::Planning,
        Some(it) if it.is_decided() => {
            if it.decision == Some(IterationDecision::Approved)
                && run.status != RunStatus::Completed
            {
                ResumeStage::Disposition
            } else {
                // Rejected last iteration: carry on with the next one
                ResumeStage::Planning
            }
        }
        Some(it) => {
            if it.plans.is_empty() {
                ResumeStage::Planning
            } else if !it.candidates_settled() {
                ResumeStage::Execution
            } else if !it.reviews_complete(reviewer_count) {
                ResumeStage::Review
            } else {
                ResumeStage::Consensus
            }
        }
    };

    info!(run_id = %run.id, %stage, "Resume stage classified");
    stage
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        Candidate, CandidateStatus, Plan, Review, Run, RunStatus, Verdict,
    };

    fn run_with_open_iteration() -> Run {
        let mut run = Run::new("/tmp/repo", "task");
        run.set_status(RunStatus::Running);
        run.push_iteration();
        run
    }

    #[test]
    fn test_fresh_run_plans() {
        let run = Run::new("/tmp/repo", "task");
        assert_eq!(classify(&run, 1), ResumeStage::Planning);
    }

    #[test]
    fn test_open_iteration_without_plans() {
        let run = run_with_open_iteration();
        assert_eq!(classify(&run, 1), ResumeStage::Planning);
    }

    #[test]
    fn test_plans_present_candidates_incomplete() {
        let mut run = run_with_open_iteration();
        let it = run.open_iteration_mut().unwrap();
        it.plans.push(Plan::new("plan-1", "rev-a", "do it"));
        assert_eq!(classify(&run, 1), ResumeStage::Execution);

        // A running candidate is still incomplete
        let it = run.open_iteration_mut().unwrap();
        let mut cand = Candidate::new("cand-00-01", "exec-a", "plan-1");
        cand.set_status(CandidateStatus::Running);
        it.candidates.push(cand);
        assert_eq!(classify(&run, 1), ResumeStage::Execution);
    }

    #[test]
    fn test_candidates_settled_reviews_absent() {
        let mut run = run_with_open_iteration();
        let it = run.open_iteration_mut().unwrap();
        it.plans.push(Plan::new("plan-1", "rev-a", "do it"));
        let mut cand = Candidate::new("cand-00-01", "exec-a", "plan-1");
        cand.set_status(CandidateStatus::Done);
        it.candidates.push(cand);

        assert_eq!(classify(&run, 1), ResumeStage::Review);
    }

    #[test]
    fn test_reviews_complete_decision_absent() {
        let mut run = run_with_open_iteration();
        let it = run.open_iteration_mut().unwrap();
        it.plans.push(Plan::new("plan-1", "rev-a", "do it"));
        let mut cand = Candidate::new("cand-00-01", "exec-a", "plan-1");
        cand.set_status(CandidateStatus::Done);
        it.candidates.push(cand);
        it.reviews.push(Review::new("rev-a", "cand-00-01", Verdict::Approved));

        assert_eq!(classify(&run, 1), ResumeStage::Consensus);
        // With two reviewers configured the single review is incomplete
        assert_eq!(classify(&run, 2), ResumeStage::Review);
    }

    #[test]
    fn test_approved_but_not_completed() {
        let mut run = run_with_open_iteration();
        let it = run.open_iteration_mut().unwrap();
        it.decide(IterationDecision::Approved, Some("cand-00-01".into()));

        assert_eq!(classify(&run, 1), ResumeStage::Disposition);
    }

    #[test]
    fn test_rejected_iteration_restarts_planning() {
        let mut run = run_with_open_iteration();
        let it = run.open_iteration_mut().unwrap();
        it.decide(IterationDecision::Rejected, Some("cand-00-01".into()));

        assert_eq!(classify(&run, 1), ResumeStage::Planning);
    }

    #[test]
    fn test_terminal_run() {
        let mut run = run_with_open_iteration();
        run.set_status(RunStatus::Completed);
        assert_eq!(classify(&run, 1), ResumeStage::Terminal);
    }

    #[test]
    fn test_classification_is_idempotent() {
        let mut run = run_with_open_iteration();
        let it = run.open_iteration_mut().unwrap();
        it.plans.push(Plan::new("plan-1", "rev-a", "do it"));

        let first = classify(&run, 1);
        let second = classify(&run, 1);
        assert_eq!(first, second);
    }
}
