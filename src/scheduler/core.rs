//! Per-iteration scheduler
//!
//! Drives one plan → execute → test → review → decide cycle: fans plans out
//! to the planning reviewers, assigns executors per plan, provisions a
//! workspace per candidate, runs executors (with capped clarification
//! rounds), tests each candidate as soon as its executor finishes, fans
//! reviews in, and computes the consensus decision or escalates to the
//! admin.
//!
//! A candidate's tests start the moment its executor returns done; its
//! reviews never start before those tests are recorded. Consensus waits for
//! every (reviewer, candidate) review.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use eyre::{Result, bail, eyre};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::agent::{
    AgentAdapter, ClarifyRequest, ExecuteRequest, PlanDraft, PlanRequest, PlannerOutcome,
    ReviewOutcome, ReviewRequest,
};
use crate::domain::{
    Candidate, CandidateStatus, ExecutorResultStatus, IterationDecision, Plan, PromptKind,
    PromptRequest, Review, ReviewStatus, Run, Verdict, Workspace,
};
use crate::prompt::PromptChannel;
use crate::state::{ResumeStage, RunEvent, StateStore};
use crate::testrun::{TestRunConfig, effective_commands, run_tests};
use crate::workspace::{WorkspaceManager, snapshot_changes};

fn default_executors_per_plan() -> usize {
    1
}

fn default_rounds() -> u32 {
    3
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SchedulerConfig {
    /// Executors assigned to each plan; candidate count is
    /// plans × executors-per-plan
    pub executors_per_plan: usize,

    /// Cap on reviewer needs-user-input rounds (planning and review)
    pub max_question_rounds: u32,

    /// Cap on executor clarification rounds per candidate
    pub max_clarification_rounds: u32,

    /// Re-invoke a FAILED executor once before failing the candidate
    pub retry_failed_executor: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            executors_per_plan: default_executors_per_plan(),
            max_question_rounds: default_rounds(),
            max_clarification_rounds: default_rounds(),
            retry_failed_executor: false,
        }
    }
}

/// Result of one scheduled iteration
#[derive(Debug, Clone)]
pub struct IterationOutcome {
    pub decision: IterationDecision,
    /// Winner snapshot, with its workspace still attached
    pub winner: Option<Candidate>,
}

/// Coordinates one iteration end to end
pub struct IterationScheduler {
    store: Arc<StateStore>,
    workspaces: Arc<WorkspaceManager>,
    reviewers: Vec<Arc<dyn AgentAdapter>>,
    executors: Vec<Arc<dyn AgentAdapter>>,
    prompts: Arc<PromptChannel>,
    config: SchedulerConfig,
    test_config: TestRunConfig,
    cancel: watch::Receiver<bool>,
}

impl IterationScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<StateStore>,
        workspaces: Arc<WorkspaceManager>,
        reviewers: Vec<Arc<dyn AgentAdapter>>,
        executors: Vec<Arc<dyn AgentAdapter>>,
        prompts: Arc<PromptChannel>,
        config: SchedulerConfig,
        test_config: TestRunConfig,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self { store, workspaces, reviewers, executors, prompts, config, test_config, cancel }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Run (or resume) the open iteration against `baseline`
    pub async fn run_iteration(
        &self,
        baseline: &Workspace,
        resume: ResumeStage,
    ) -> Result<IterationOutcome> {
        let index = self.ensure_iteration().await?;
        if self.is_cancelled() {
            return self.abort_iteration(index).await;
        }

        match self.run_phases(index, baseline, resume).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if self.is_cancelled() => {
                warn!(iteration = index, "Iteration interrupted by cancellation");
                self.abort_iteration(index).await.map_err(|_| e)
            }
            Err(e) => Err(e),
        }
    }

    async fn run_phases(
        &self,
        index: u32,
        baseline: &Workspace,
        resume: ResumeStage,
    ) -> Result<IterationOutcome> {
        let from = match resume {
            ResumeStage::Planning => 0,
            ResumeStage::Execution => 1,
            ResumeStage::Review => 2,
            _ => 3,
        };

        if from <= 0 {
            self.plan_phase(index, baseline).await?;
        }
        if from <= 1 {
            self.assign_phase(index).await?;
            self.execute_phase(index, baseline).await?;
        }
        if self.is_cancelled() {
            return self.abort_iteration(index).await;
        }
        if from <= 2 {
            self.review_phase(index).await?;
        }

        let outcome = self.consensus_phase(index).await?;
        self.disposition(index, &outcome).await?;
        Ok(outcome)
    }

    /// Open iteration index, creating one if none is open
    async fn ensure_iteration(&self) -> Result<u32> {
        if let Some(index) = self.store.with_run(|r| r.open_iteration().map(|it| it.index)).await {
            return Ok(index);
        }
        let next = self.store.with_run(|r| r.iterations.len() as u32).await;
        let index = self
            .store
            .mutate(RunEvent::IterationStarted { index: next }, |run| run.push_iteration())
            .await?;
        info!(iteration = index, "Iteration started");
        Ok(index)
    }

    async fn abort_iteration(&self, index: u32) -> Result<IterationOutcome> {
        self.store
            .mutate(
                RunEvent::DecisionRecorded {
                    iteration: index,
                    decision: IterationDecision::Aborted.to_string(),
                    winner: None,
                },
                |run| {
                    if let Some(it) = run.iteration_mut(index) {
                        it.decide(IterationDecision::Aborted, None);
                    }
                },
            )
            .await?;
        self.prompts.cancel_pending();
        Ok(IterationOutcome { decision: IterationDecision::Aborted, winner: None })
    }

    // === Phase 1: planning ===

    async fn plan_phase(&self, index: u32, baseline: &Workspace) -> Result<()> {
        let already_planned =
            self.store.with_run(|r| r.iteration(index).map(|it| !it.plans.is_empty())).await;
        if already_planned == Some(true) {
            debug!(iteration = index, "plan_phase: plans already recorded, skipping");
            return Ok(());
        }

        let (task, history) =
            self.store.with_run(|r| (r.task.clone(), iteration_history(r))).await;

        let futures = self.reviewers.iter().map(|reviewer| {
            self.plan_one(reviewer.clone(), task.clone(), history.clone(), baseline.path.clone())
        });
        let results = join_all(futures).await;

        let mut drafts: Vec<(String, PlanDraft)> = Vec::new();
        let mut last_err = None;
        for (reviewer, result) in self.reviewers.iter().zip(results) {
            match result {
                Ok(Some(draft)) => drafts.push((reviewer.id().to_string(), draft)),
                Ok(None) => {
                    warn!(reviewer = reviewer.id(), "Planner gave no plan within the question-round cap")
                }
                Err(e) if self.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(reviewer = reviewer.id(), error = %e, "Planner failed");
                    last_err = Some(e);
                }
            }
        }
        if drafts.is_empty() {
            return Err(match last_err {
                Some(e) => e.wrap_err(format!("all planners failed for iteration {}", index)),
                None => eyre!("all planners failed for iteration {}", index),
            });
        }

        for (n, (reviewer_id, draft)) in drafts.into_iter().enumerate() {
            let plan_id = format!("plan-{:02}-{:02}", index, n + 1);
            let plan = draft.into_plan(&plan_id, &reviewer_id);
            self.store
                .mutate(
                    RunEvent::PlanRecorded { iteration: index, plan_id, reviewer_id },
                    |run| {
                        if let Some(it) = run.iteration_mut(index) {
                            it.plans.push(plan);
                        }
                    },
                )
                .await?;
        }
        Ok(())
    }

    async fn plan_one(
        &self,
        reviewer: Arc<dyn AgentAdapter>,
        task: String,
        history: Option<String>,
        cwd: PathBuf,
    ) -> Result<Option<PlanDraft>> {
        let mut context = history;
        for round in 0..=self.config.max_question_rounds {
            let outcome = reviewer
                .plan(PlanRequest { task: &task, context: context.as_deref(), cwd: &cwd })
                .await?;
            match outcome {
                PlannerOutcome::Plan(draft) => return Ok(Some(draft)),
                PlannerOutcome::NeedsUserInput(questions) => {
                    if round == self.config.max_question_rounds {
                        return Ok(None);
                    }
                    let answers = self
                        .ask_user(PromptKind::ReviewerClarification, questions.clone(), None)
                        .await?;
                    append_qa(&mut context, &questions, &answers);
                }
            }
        }
        Ok(None)
    }

    // === Phase 2: assignment ===

    async fn assign_phase(&self, index: u32) -> Result<()> {
        let existing =
            self.store.with_run(|r| r.iteration(index).map(|it| it.candidates.len())).await;
        if existing.unwrap_or(0) > 0 {
            debug!(iteration = index, "assign_phase: candidates already assigned, skipping");
            return Ok(());
        }

        let plan_ids: Vec<String> = self
            .store
            .with_run(|r| {
                r.iteration(index)
                    .map(|it| it.plans.iter().map(|p| p.id.clone()).collect())
                    .unwrap_or_default()
            })
            .await;
        if self.executors.is_empty() {
            bail!("no executors configured");
        }

        // Round-robin over executors, stable across plans. The Cartesian
        // blow-up is deliberate: plans × executors-per-plan candidates.
        let mut candidates = Vec::new();
        let mut cursor = 0usize;
        let mut n = 0usize;
        for plan_id in &plan_ids {
            for _ in 0..self.config.executors_per_plan {
                let executor = &self.executors[cursor % self.executors.len()];
                cursor += 1;
                n += 1;
                candidates.push(Candidate::new(
                    format!("cand-{:02}-{:02}", index, n),
                    executor.id(),
                    plan_id,
                ));
            }
        }

        let count = candidates.len();
        self.store
            .mutate(RunEvent::CandidatesAssigned { iteration: index, count }, |run| {
                if let Some(it) = run.iteration_mut(index) {
                    it.candidates = candidates;
                }
            })
            .await?;
        info!(iteration = index, count, "Candidates assigned");
        Ok(())
    }

    // === Phases 3 and 4: execution and per-candidate testing ===

    async fn execute_phase(&self, index: u32, baseline: &Workspace) -> Result<()> {
        let run_id = self.store.with_run(|r| r.id.clone()).await;
        let run_hex = run_id.chars().take(6).collect::<String>();

        let pending: Vec<Candidate> = self
            .store
            .with_run(|r| {
                r.iteration(index)
                    .map(|it| {
                        it.candidates.iter().filter(|c| !c.is_settled()).cloned().collect()
                    })
                    .unwrap_or_default()
            })
            .await;

        let futures = pending
            .into_iter()
            .map(|cand| self.drive_candidate(index, cand, baseline, run_hex.clone()));
        for result in join_all(futures).await {
            result?;
        }

        let all_failed = self
            .store
            .with_run(|r| {
                r.iteration(index)
                    .map(|it| it.candidates.iter().all(|c| c.status == CandidateStatus::Failed))
                    .unwrap_or(true)
            })
            .await;
        if all_failed {
            bail!("all candidates failed in iteration {}", index);
        }
        Ok(())
    }

    /// Drive one candidate through execution, clarification rounds, change
    /// snapshot, and tests. Per-candidate failures are recorded, not
    /// returned; only cancellation and storage failures propagate.
    async fn drive_candidate(
        &self,
        index: u32,
        cand: Candidate,
        baseline: &Workspace,
        run_hex: String,
    ) -> Result<()> {
        let cand_id = cand.id.clone();

        // Re-attach a persisted workspace, or provision a fresh one
        let workspace = match cand.workspace.as_ref().and_then(|ws| self.workspaces.reattach(ws)) {
            Some(ws) => ws,
            None => {
                let purpose = format!("{}-{}", run_hex, cand_id);
                match self.workspaces.provision(&baseline.path, &purpose).await {
                    Ok(ws) => {
                        self.store
                            .mutate(
                                RunEvent::WorkspaceProvisioned {
                                    owner: cand_id.clone(),
                                    path: ws.path.display().to_string(),
                                },
                                |_| {},
                            )
                            .await?;
                        ws
                    }
                    Err(e) => {
                        warn!(candidate = %cand_id, error = %e, "Workspace provisioning failed");
                        self.fail_candidate(index, &cand_id, format!("workspace: {}", e)).await?;
                        return Ok(());
                    }
                }
            }
        };

        let Some((prompt, executor_id)) = self
            .store
            .with_run(|r| {
                let it = r.iteration(index)?;
                let plan = it.plan(&cand.plan_id)?;
                Some((plan.executor_prompt.clone(), cand.executor_id.clone()))
            })
            .await
        else {
            self.fail_candidate(index, &cand_id, "candidate references a missing plan").await?;
            return Ok(());
        };
        let Some(executor) = self.executors.iter().find(|e| e.id() == executor_id) else {
            self.fail_candidate(index, &cand_id, format!("unknown executor '{}'", executor_id))
                .await?;
            return Ok(());
        };

        self.store
            .mutate(
                RunEvent::CandidateUpdated {
                    candidate_id: cand_id.clone(),
                    status: CandidateStatus::Running.to_string(),
                },
                |run| {
                    if let Some(c) = run.iteration_mut(index).and_then(|it| it.candidate_mut(&cand_id)) {
                        c.set_workspace(workspace.clone());
                        c.set_status(CandidateStatus::Running);
                    }
                },
            )
            .await?;

        let mut session = cand.session_id.clone();
        let mut answers: Option<Vec<String>> = None;
        let mut rounds = cand.clarification_rounds;
        let mut retried_failed = false;

        loop {
            if self.is_cancelled() {
                bail!("cancelled");
            }
            let result = executor
                .execute(ExecuteRequest {
                    candidate_id: &cand_id,
                    prompt: &prompt,
                    workspace: &workspace.path,
                    session: session.as_deref(),
                    answers: answers.as_deref(),
                })
                .await;

            let result = match result {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => bail!("cancelled"),
                Err(e) => {
                    self.fail_candidate(index, &cand_id, format!("executor: {}", e)).await?;
                    return Ok(());
                }
            };

            session = result.session_id.clone().or(session);
            let status = result.status;
            let questions = result.questions.clone();
            self.store
                .mutate(
                    RunEvent::CandidateUpdated {
                        candidate_id: cand_id.clone(),
                        status: status_label(status).to_string(),
                    },
                    |run| {
                        if let Some(c) =
                            run.iteration_mut(index).and_then(|it| it.candidate_mut(&cand_id))
                        {
                            c.record_result(result);
                        }
                    },
                )
                .await?;

            match status {
                ExecutorResultStatus::Done => break,
                ExecutorResultStatus::Failed => {
                    if self.config.retry_failed_executor && !retried_failed {
                        warn!(candidate = %cand_id, "Executor reported FAILED; retrying once");
                        retried_failed = true;
                        continue;
                    }
                    self.fail_candidate(index, &cand_id, "executor reported FAILED").await?;
                    return Ok(());
                }
                ExecutorResultStatus::NeedsClarification => {
                    rounds += 1;
                    if rounds > self.config.max_clarification_rounds {
                        self.fail_candidate(
                            index,
                            &cand_id,
                            format!("exceeded {} clarification rounds", self.config.max_clarification_rounds),
                        )
                        .await?;
                        return Ok(());
                    }
                    self.store
                        .mutate(
                            RunEvent::CandidateUpdated {
                                candidate_id: cand_id.clone(),
                                status: CandidateStatus::NeedsClarification.to_string(),
                            },
                            |run| {
                                if let Some(c) = run
                                    .iteration_mut(index)
                                    .and_then(|it| it.candidate_mut(&cand_id))
                                {
                                    c.clarification_rounds = rounds;
                                    c.set_status(CandidateStatus::NeedsClarification);
                                }
                            },
                        )
                        .await?;

                    match self.gather_answers(&questions, &prompt, &workspace.path).await {
                        Ok(gathered) => answers = Some(gathered),
                        Err(e) => {
                            self.fail_candidate(index, &cand_id, format!("clarification: {}", e))
                                .await?;
                            return Ok(());
                        }
                    }
                }
            }
        }

        // Change snapshot, then tests; the candidate is done only once its
        // test results are recorded.
        let summary = match snapshot_changes(
            &workspace,
            &self.workspaces.config().excluded,
            self.workspaces.config().diff_limit_bytes,
        )
        .await
        {
            Ok(summary) => summary,
            Err(e) => {
                self.fail_candidate(index, &cand_id, format!("snapshot: {}", e)).await?;
                return Ok(());
            }
        };

        let plan_commands = self
            .store
            .with_run(|r| {
                r.iteration(index)
                    .and_then(|it| it.plan(&cand.plan_id))
                    .and_then(|p| p.test_commands.clone())
            })
            .await;
        let commands = effective_commands(plan_commands.as_deref(), &self.test_config);

        match run_tests(&commands, &workspace.path, &self.test_config).await {
            Ok(results) => {
                let passed = results.iter().filter(|r| r.passed()).count();
                let failed = results.len() - passed;
                self.store
                    .mutate(
                        RunEvent::TestsRecorded { candidate_id: cand_id.clone(), passed, failed },
                        |run| {
                            if let Some(c) =
                                run.iteration_mut(index).and_then(|it| it.candidate_mut(&cand_id))
                            {
                                c.diff_summary = Some(summary);
                                c.record_tests(results);
                                c.set_status(CandidateStatus::Done);
                            }
                        },
                    )
                    .await?;
                info!(candidate = %cand_id, passed, failed, "Candidate done");
            }
            Err(e) => {
                self.fail_candidate(index, &cand_id, format!("test runner: {}", e)).await?;
            }
        }
        Ok(())
    }

    /// Forward executor questions to every reviewer and pool their answers
    async fn gather_answers(
        &self,
        questions: &[String],
        conversation: &str,
        cwd: &std::path::Path,
    ) -> Result<Vec<String>> {
        let futures = self.reviewers.iter().map(|reviewer| {
            let reviewer = reviewer.clone();
            async move {
                reviewer
                    .clarify(ClarifyRequest { questions, context: conversation, cwd })
                    .await
            }
        });

        let mut answers = Vec::new();
        for (reviewer, result) in self.reviewers.iter().zip(join_all(futures).await) {
            match result {
                Ok(mut a) => answers.append(&mut a),
                Err(e) if e.is_cancelled() => bail!("cancelled"),
                Err(e) => warn!(reviewer = reviewer.id(), error = %e, "Clarification failed"),
            }
        }
        if answers.is_empty() {
            bail!("no reviewer produced clarification answers");
        }
        Ok(answers)
    }

    async fn fail_candidate(
        &self,
        index: u32,
        cand_id: &str,
        message: impl Into<String>,
    ) -> Result<()> {
        let message = message.into();
        warn!(candidate = %cand_id, %message, "Candidate failed");
        let cand_id = cand_id.to_string();
        self.store
            .mutate(
                RunEvent::CandidateUpdated {
                    candidate_id: cand_id.clone(),
                    status: CandidateStatus::Failed.to_string(),
                },
                move |run| {
                    if let Some(c) = run.iteration_mut(index).and_then(|it| it.candidate_mut(&cand_id)) {
                        c.fail(message);
                    }
                },
            )
            .await?;
        Ok(())
    }

    // === Phase 5: review ===

    async fn review_phase(&self, index: u32) -> Result<()> {
        let iteration = self
            .store
            .with_run(|r| r.iteration(index).cloned())
            .await
            .ok_or_else(|| eyre!("iteration {} missing", index))?;
        let repo = self.store.with_run(|r| r.repo.clone()).await;
        let candidate_ids: Vec<String> =
            iteration.candidates.iter().map(|c| c.id.clone()).collect();
        let existing: HashSet<(String, String)> = iteration
            .reviews
            .iter()
            .map(|r| (r.reviewer_id.clone(), r.candidate_id.clone()))
            .collect();

        let mut futures = Vec::new();
        for reviewer in &self.reviewers {
            for cand in &iteration.candidates {
                if existing.contains(&(reviewer.id().to_string(), cand.id.clone())) {
                    continue;
                }
                let Some(plan) = iteration.plan(&cand.plan_id).cloned() else {
                    bail!("candidate {} references a missing plan", cand.id);
                };
                futures.push(self.review_one(
                    reviewer.clone(),
                    cand.clone(),
                    plan,
                    candidate_ids.clone(),
                    repo.clone(),
                ));
            }
        }

        for result in join_all(futures).await {
            result?;
        }
        Ok(())
    }

    async fn review_one(
        &self,
        reviewer: Arc<dyn AgentAdapter>,
        cand: Candidate,
        plan: Plan,
        candidate_ids: Vec<String>,
        repo: PathBuf,
    ) -> Result<()> {
        let diff = cand.diff_summary.clone().unwrap_or_default();
        // A disposed workspace is no place to run a reviewer
        let cwd = cand
            .workspace
            .as_ref()
            .map(|ws| ws.path.clone())
            .filter(|p| p.exists())
            .unwrap_or(repo);
        let mut context: Option<String> = None;

        for round in 0..=self.config.max_question_rounds {
            let outcome = reviewer
                .review(ReviewRequest {
                    candidate_id: &cand.id,
                    candidate_ids: &candidate_ids,
                    plan: &plan,
                    diff: &diff,
                    test_results: &cand.test_results,
                    context: context.as_deref(),
                    cwd: &cwd,
                })
                .await?;

            match outcome {
                ReviewOutcome::Review { verdict, ranking, feedback } => {
                    let mut review = Review::new(reviewer.id(), &cand.id, verdict);
                    review.ranking = ranking;
                    review.feedback = feedback;
                    review.status = ReviewStatus::Final;

                    let cand_id = cand.id.clone();
                    self.store
                        .mutate(
                            RunEvent::ReviewRecorded {
                                candidate_id: cand_id,
                                reviewer_id: reviewer.id().to_string(),
                                verdict: verdict.to_string(),
                            },
                            |run| {
                                if let Some(it) = run.open_iteration_mut() {
                                    it.reviews.push(review);
                                }
                            },
                        )
                        .await?;
                    return Ok(());
                }
                ReviewOutcome::NeedsUserInput(questions) => {
                    if round == self.config.max_question_rounds {
                        bail!(
                            "reviewer {} exceeded question rounds on {}",
                            reviewer.id(),
                            cand.id
                        );
                    }
                    let answers = self
                        .ask_user(PromptKind::ReviewerClarification, questions.clone(), None)
                        .await?;
                    append_qa(&mut context, &questions, &answers);
                }
            }
        }
        unreachable!("review round loop is bounded");
    }

    // === Phase 6: consensus ===

    async fn consensus_phase(&self, index: u32) -> Result<IterationOutcome> {
        let iteration = self
            .store
            .with_run(|r| r.iteration(index).cloned())
            .await
            .ok_or_else(|| eyre!("iteration {} missing", index))?;
        let candidate_ids: Vec<String> =
            iteration.candidates.iter().map(|c| c.id.clone()).collect();

        let result = super::consensus::consensus(&candidate_ids, &iteration.reviews)
            .ok_or_else(|| eyre!("no candidates to decide over"))?;

        let (winner_id, verdict) = match result.unanimous_verdict {
            Some(verdict) => (result.winner, verdict),
            None => {
                info!(iteration = index, winner = %result.winner, "Reviewers disagree; escalating to admin");
                self.store
                    .mutate(
                        RunEvent::DecisionRecorded {
                            iteration: index,
                            decision: IterationDecision::AdminEscalated.to_string(),
                            winner: Some(result.winner.clone()),
                        },
                        |run| {
                            if let Some(it) = run.iteration_mut(index) {
                                it.decision = Some(IterationDecision::AdminEscalated);
                            }
                        },
                    )
                    .await?;

                let context = json!({
                    "scores": result.scores,
                    "reviews": iteration.reviews,
                    "candidates": iteration
                        .candidates
                        .iter()
                        .map(|c| json!({ "id": c.id, "diff": c.diff_summary }))
                        .collect::<Vec<_>>(),
                });
                let request = PromptRequest::new(
                    PromptKind::AdminTiebreak,
                    vec![format!(
                        "Reviewers disagree on the winner (Borda pick: {}). Choose a candidate and a verdict.",
                        result.winner
                    )],
                )
                .with_context(context);
                let response = self.ask_prompt(request).await?;

                let winner = response
                    .winner
                    .filter(|w| candidate_ids.contains(w))
                    .unwrap_or(result.winner);
                (winner, response.verdict.unwrap_or(Verdict::Rejected))
            }
        };

        let decision = match verdict {
            Verdict::Approved => IterationDecision::Approved,
            Verdict::Rejected => IterationDecision::Rejected,
        };
        let winner_for_event = winner_id.clone();
        self.store
            .mutate(
                RunEvent::DecisionRecorded {
                    iteration: index,
                    decision: decision.to_string(),
                    winner: Some(winner_for_event),
                },
                |run| {
                    if let Some(it) = run.iteration_mut(index) {
                        it.decide(decision, Some(winner_id.clone()));
                    }
                },
            )
            .await?;

        let winner = self
            .store
            .with_run(|r| {
                r.iteration(index)
                    .and_then(|it| it.winner.as_ref().and_then(|w| it.candidate(w)).cloned())
            })
            .await;
        info!(iteration = index, decision = %decision, winner = ?winner.as_ref().map(|c| &c.id), "Iteration decided");
        Ok(IterationOutcome { decision, winner })
    }

    // === Phase 7: disposition (non-winner cleanup) ===

    async fn disposition(&self, index: u32, outcome: &IterationOutcome) -> Result<()> {
        let winner_id = outcome.winner.as_ref().map(|c| c.id.clone());
        let losers: Vec<Candidate> = self
            .store
            .with_run(|r| {
                r.iteration(index)
                    .map(|it| {
                        it.candidates
                            .iter()
                            .filter(|c| Some(&c.id) != winner_id.as_ref())
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .await;

        let policy = self.workspaces.config().cleanup;
        for cand in losers {
            if let Some(ws) = &cand.workspace {
                self.workspaces.dispose(ws, policy, true).await;
                self.store
                    .mutate(
                        RunEvent::WorkspaceDisposed { path: ws.path.display().to_string() },
                        |_| {},
                    )
                    .await?;
            }
        }
        Ok(())
    }

    // === Prompt helpers ===

    async fn ask_user(
        &self,
        kind: PromptKind,
        questions: Vec<String>,
        context: Option<serde_json::Value>,
    ) -> Result<Vec<String>> {
        let mut request = PromptRequest::new(kind, questions);
        if let Some(context) = context {
            request = request.with_context(context);
        }
        let response = self.ask_prompt(request).await?;
        Ok(response.answers)
    }

    async fn ask_prompt(&self, request: PromptRequest) -> Result<crate::domain::PromptResponse> {
        self.store
            .mutate(
                RunEvent::PromptOpened { prompt_id: request.id.clone(), kind: request.kind.to_string() },
                |_| {},
            )
            .await?;
        let result = self.prompts.ask(&request).await;
        let event = match &result {
            Ok(_) => RunEvent::PromptResolved { prompt_id: request.id.clone() },
            Err(_) => RunEvent::PromptCancelled { prompt_id: request.id.clone() },
        };
        self.store.mutate(event, |_| {}).await?;
        Ok(result?)
    }
}

fn status_label(status: ExecutorResultStatus) -> &'static str {
    match status {
        ExecutorResultStatus::Done => "done",
        ExecutorResultStatus::NeedsClarification => "needs_clarification",
        ExecutorResultStatus::Failed => "failed",
    }
}

/// Feedback from decided iterations, handed to planners as context
fn iteration_history(run: &Run) -> Option<String> {
    let mut history = String::new();
    for it in run.iterations.iter().filter(|it| it.is_decided()) {
        let decision = it
            .decision
            .map(|d| d.to_string())
            .unwrap_or_else(|| "undecided".into());
        history.push_str(&format!("Iteration {} was {}.\n", it.index, decision));
        if let Some(winner) = &it.winner {
            for review in it.reviews_for(winner) {
                if !review.feedback.is_empty() {
                    history.push_str(&format!(
                        "- {} on {}: {}\n",
                        review.reviewer_id, winner, review.feedback
                    ));
                }
            }
        }
    }
    (!history.is_empty()).then_some(history)
}

fn append_qa(context: &mut Option<String>, questions: &[String], answers: &[String]) {
    let mut text = context.take().unwrap_or_default();
    for (i, question) in questions.iter().enumerate() {
        text.push_str(&format!(
            "Q: {}\nA: {}\n",
            question,
            answers.get(i).map(String::as_str).unwrap_or("(no answer)")
        ));
    }
    *context = Some(text);
}
