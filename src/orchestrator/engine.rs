//! Top-level run loop
//!
//! Owns the lifecycle of a run: create or load the snapshot, drive the
//! scheduler iteration by iteration, thread the carry-forward baseline,
//! persist the winner on approval (delegating merge conflicts to an
//! executor), and honor the iteration cap, abort signal, and session mode.

use std::path::Path;
use std::sync::Arc;

use eyre::{Result, eyre};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::agent::{AgentAdapter, AgentError, ExecuteRequest, build_agents};
use crate::config::{Config, ConfigError};
use crate::domain::{
    Candidate, ExecutorResultStatus, IterationDecision, PromptKind, PromptRequest, Run,
    RunFailure, RunStatus, Workspace, WorkspaceStrategy,
};
use crate::prompt::{PromptChannel, PromptError};
use crate::scheduler::IterationScheduler;
use crate::state::{ResumeStage, RunEvent, StateStore, StorageError, classify};
use crate::testrun::TestRunError;
use crate::workspace::{
    AppliedChanges, WorkspaceError, WorkspaceManager, apply_changes, commit_pending,
};

/// Reviewers and executors for one run
pub struct AgentSet {
    pub reviewers: Vec<Arc<dyn AgentAdapter>>,
    pub executors: Vec<Arc<dyn AgentAdapter>>,
}

/// Builds the agent roster for a run, given the run's agent-log directory
pub type AgentFactory = Box<dyn Fn(&Path) -> Result<AgentSet, String> + Send + Sync>;

/// Terminal summary of one run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    pub failure: Option<RunFailure>,
}

impl RunReport {
    /// Process exit code for this outcome
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Completed | RunStatus::Idle => 0,
            RunStatus::Aborted => 6,
            _ => match self.failure.as_ref().map(|f| f.kind.as_str()) {
                Some("config") => 2,
                Some("agent-invocation") => 3,
                Some("test-runner") => 4,
                Some("workspace") => 5,
                _ => 1,
            },
        }
    }
}

fn report_of(run: &Run) -> RunReport {
    RunReport { run_id: run.id.clone(), status: run.status, failure: run.failure.clone() }
}

/// Classify an iteration error into a machine-readable failure kind
fn failure_kind(error: &eyre::Report) -> &'static str {
    if error.downcast_ref::<StorageError>().is_some() {
        "storage"
    } else if error.downcast_ref::<AgentError>().is_some() {
        "agent-invocation"
    } else if error.downcast_ref::<WorkspaceError>().is_some() {
        "workspace"
    } else if error.downcast_ref::<TestRunError>().is_some() {
        "test-runner"
    } else if error.downcast_ref::<PromptError>().is_some() {
        "prompt"
    } else {
        "iteration-failed"
    }
}

/// Top-level per-task state machine
pub struct Orchestrator {
    config: Config,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel: watch::Receiver<bool>,
    factory: AgentFactory,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        let (tx, rx) = watch::channel(false);
        let agents = config.agents.clone();
        let invocation = config.invocation();
        let factory_cancel = rx.clone();
        let factory: AgentFactory = Box::new(move |agents_dir| {
            Ok(AgentSet {
                reviewers: build_agents(
                    &agents.reviewers,
                    agents_dir,
                    &invocation,
                    &agents.retry,
                    &factory_cancel,
                )?,
                executors: build_agents(
                    &agents.executors,
                    agents_dir,
                    &invocation,
                    &agents.retry,
                    &factory_cancel,
                )?,
            })
        });
        Self { config, cancel_tx: Arc::new(tx), cancel: rx, factory }
    }

    /// Replace the agent factory (tests inject scripted agents here)
    pub fn with_agent_factory(mut self, factory: AgentFactory) -> Self {
        self.factory = factory;
        self
    }

    /// Handle for signal wiring; sending `true` aborts in-flight work
    pub fn cancel_handle(&self) -> Arc<watch::Sender<bool>> {
        self.cancel_tx.clone()
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Entry point: run a task, prompting for one when given `.`, and stay
    /// resident for follow-up tasks in session mode.
    pub async fn run(&self, repo: &Path, initial_task: Option<String>) -> Result<RunReport> {
        let session_prompts = PromptChannel::new(
            self.config.runs_dir().join("session"),
            self.config.prompts.clone(),
            self.cancel.clone(),
        );

        let mut task = match initial_task {
            Some(task) if task != "." => task,
            _ => {
                let request = PromptRequest::new(
                    PromptKind::InitialTask,
                    vec!["What should luigi work on?".into()],
                );
                let response = session_prompts.ask(&request).await?;
                response
                    .answers
                    .first()
                    .filter(|t| !t.is_empty())
                    .cloned()
                    .ok_or_else(|| eyre!("empty initial task"))?
            }
        };

        loop {
            let report = self.start(repo, &task).await?;
            if !self.config.orchestrator.session_mode || self.is_cancelled() {
                return Ok(report);
            }

            info!("Session mode: run finished, waiting for the next task");
            let request = PromptRequest::new(
                PromptKind::SessionNextTask,
                vec!["Run finished. What should luigi work on next?".into()],
            );
            match session_prompts.ask(&request).await {
                Ok(response) => match response.answers.first() {
                    Some(next) if !next.is_empty() => task = next.clone(),
                    _ => return Ok(report),
                },
                Err(_) => return Ok(report),
            }
        }
    }

    /// Run a single task to a terminal status
    pub async fn start(&self, repo: &Path, task: &str) -> Result<RunReport> {
        let run = Run::new(repo, task);
        let run_id = run.id.clone();
        let store = Arc::new(StateStore::create(&self.config.runs_dir(), run)?);
        store
            .mutate(RunEvent::RunCreated { run_id, task: task.to_string() }, |_| {})
            .await?;
        self.drive(store).await
    }

    /// Resume a persisted run at the stage its snapshot calls for
    pub async fn resume(&self, run_id: &str) -> Result<RunReport> {
        let store = Arc::new(StateStore::load(&self.config.runs_dir(), run_id)?);
        self.drive(store).await
    }

    async fn drive(&self, store: Arc<StateStore>) -> Result<RunReport> {
        let run = store.snapshot().await;
        if run.is_terminal() {
            info!(run_id = %run.id, status = %run.status, "Run already terminal");
            return Ok(report_of(&run));
        }
        let repo = run.repo.clone();

        let agents = (self.factory)(&store.agents_dir())
            .map_err(|e| eyre::Report::new(ConfigError::Invalid(e)))?;
        let workspaces = Arc::new(WorkspaceManager::new(
            self.config.workspace.clone(),
            store.run_dir().join("work"),
        ));
        let prompts = Arc::new(PromptChannel::new(
            store.prompts_dir(),
            self.config.prompts.clone(),
            self.cancel.clone(),
        ));
        let scheduler = IterationScheduler::new(
            store.clone(),
            workspaces.clone(),
            agents.reviewers.clone(),
            agents.executors.clone(),
            prompts.clone(),
            self.config.scheduler.clone(),
            self.config.tests.clone(),
            self.cancel.clone(),
        );

        store
            .mutate(RunEvent::RunStatusChanged { status: RunStatus::Running.to_string() }, |run| {
                run.set_status(RunStatus::Running)
            })
            .await?;

        let reviewer_count = agents.reviewers.len();
        let mut baseline = match store.with_run(|r| r.baseline.clone()).await {
            Some(ws) if ws.path.exists() => ws,
            _ => Workspace::in_place(&repo),
        };

        loop {
            let snapshot = store.snapshot().await;
            let stage = classify(&snapshot, reviewer_count);
            if stage == ResumeStage::Terminal {
                break;
            }
            if self.is_cancelled() {
                self.mark_aborted(&store, &prompts).await?;
                break;
            }

            // The iteration cap applies when a fresh iteration would start
            if stage == ResumeStage::Planning && snapshot.open_iteration().is_none() {
                let decided = snapshot.iterations.iter().filter(|it| it.is_decided()).count() as u32;
                let max = self.config.orchestrator.max_iterations;
                if max > 0 && decided >= max {
                    warn!(run_id = %snapshot.id, max, "Iteration cap reached");
                    self.fail_run(
                        &store,
                        "max-iterations-exceeded",
                        format!("no approval within {} iterations", max),
                    )
                    .await?;
                    break;
                }
            }

            if stage == ResumeStage::Disposition {
                let (index, winner) = approved_winner(&snapshot)
                    .ok_or_else(|| eyre!("disposition stage without an approved winner"))?;
                self.persist_approval(&store, &workspaces, &agents, Some(winner), index).await?;
                break;
            }

            let outcome = match scheduler.run_iteration(&baseline, stage).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.fail_run(&store, failure_kind(&e), format!("{:#}", e)).await?;
                    break;
                }
            };

            match outcome.decision {
                IterationDecision::Aborted => {
                    self.mark_aborted(&store, &prompts).await?;
                    break;
                }
                IterationDecision::Approved => {
                    let index = store.with_run(|r| r.iterations.len() as u32 - 1).await;
                    self.persist_approval(&store, &workspaces, &agents, outcome.winner, index)
                        .await?;
                    break;
                }
                IterationDecision::Rejected | IterationDecision::AdminEscalated => {
                    match self.next_baseline(&store, &workspaces, outcome.winner, &repo).await {
                        Ok(next) => baseline = next,
                        Err(e) => {
                            self.fail_run(&store, "workspace", format!("{:#}", e)).await?;
                            break;
                        }
                    }
                }
            }
        }

        let run = store.snapshot().await;
        info!(run_id = %run.id, status = %run.status, "Run finished");
        Ok(report_of(&run))
    }

    /// Apply the approved winner to the target repository and close the run
    async fn persist_approval(
        &self,
        store: &Arc<StateStore>,
        workspaces: &Arc<WorkspaceManager>,
        agents: &AgentSet,
        winner: Option<Candidate>,
        index: u32,
    ) -> Result<()> {
        let repo = store.with_run(|r| r.repo.clone()).await;
        let Some(workspace) = winner.and_then(|c| c.workspace) else {
            self.fail_run(store, "approved-not-persisted", "approved winner has no workspace")
                .await?;
            return Ok(());
        };

        let mut result = self.apply_winner(workspaces, &workspace, &repo).await;

        if let Err(WorkspaceError::MergeConflict(message)) = &result {
            let message = message.clone();
            store
                .mutate(RunEvent::MergeConflictDetected { message: message.clone() }, |_| {})
                .await?;
            if self.delegate_conflict(agents, &workspace, &repo, &message).await {
                info!("Conflict delegation reported done; retrying merge");
                result = self.apply_winner(workspaces, &workspace, &repo).await;
            }
        }

        match result {
            Ok(applied) => {
                if !matches!(applied, AppliedChanges::None) {
                    store
                        .mutate(
                            RunEvent::MergeCompleted { target: repo.display().to_string() },
                            |_| {},
                        )
                        .await?;
                }
                store
                    .mutate(
                        RunEvent::RunStatusChanged { status: RunStatus::Completed.to_string() },
                        |run| {
                            run.winning_iteration = Some(index);
                            run.set_status(RunStatus::Completed);
                        },
                    )
                    .await?;
                workspaces.dispose(&workspace, workspaces.config().cleanup, true).await;
            }
            Err(WorkspaceError::MergeConflict(message)) => {
                self.fail_run(
                    store,
                    "approved-not-persisted",
                    format!("merge conflict unresolved: {}", message),
                )
                .await?;
            }
            Err(e) => {
                self.fail_run(store, "workspace", e.to_string()).await?;
            }
        }
        Ok(())
    }

    async fn apply_winner(
        &self,
        workspaces: &Arc<WorkspaceManager>,
        workspace: &Workspace,
        repo: &Path,
    ) -> Result<AppliedChanges, WorkspaceError> {
        // Without auto-merge, an approved worktree only commits its branch;
        // merging is left to a human.
        if workspace.strategy == WorkspaceStrategy::Worktree
            && !workspaces.config().auto_merge_on_approval
        {
            let branch = workspace.branch.as_deref().unwrap_or("(detached)");
            commit_pending(&workspace.path, &format!("luigi: approved changes on {}", branch))
                .await?;
            return Ok(AppliedChanges::None);
        }
        apply_changes(workspaces, workspace, repo).await
    }

    /// Hand a merge conflict to an executor; true when it reports done
    async fn delegate_conflict(
        &self,
        agents: &AgentSet,
        workspace: &Workspace,
        repo: &Path,
        conflict: &str,
    ) -> bool {
        let Some(executor) = agents.executors.first() else {
            return false;
        };
        let branch = workspace.branch.as_deref().unwrap_or_default();
        let prompt = format!(
            "Merging branch {} into the repository at {} failed with a conflict:\n\n{}\n\n\
             Resolve the conflict so the merge can be retried. Perform the merge of {} yourself \
             if that is the cleanest resolution, committing the result.",
            branch,
            repo.display(),
            conflict,
            branch,
        );
        match executor
            .execute(ExecuteRequest {
                candidate_id: "merge-conflict",
                prompt: &prompt,
                workspace: repo,
                session: None,
                answers: None,
            })
            .await
        {
            Ok(result) if result.status == ExecutorResultStatus::Done => true,
            Ok(result) => {
                warn!(status = ?result.status, "Conflict delegation did not finish");
                false
            }
            Err(e) => {
                warn!(error = %e, "Conflict delegation failed");
                false
            }
        }
    }

    /// Baseline for the next iteration: the rejected winner carried forward
    /// as a copy, or the repository itself.
    async fn next_baseline(
        &self,
        store: &Arc<StateStore>,
        workspaces: &Arc<WorkspaceManager>,
        winner: Option<Candidate>,
        repo: &Path,
    ) -> Result<Workspace> {
        let fallback = Workspace::in_place(repo);
        if !self.config.orchestrator.carry_forward {
            return Ok(fallback);
        }
        let Some(workspace) = winner.and_then(|c| c.workspace) else {
            return Ok(fallback);
        };

        let next_index = store.with_run(|r| r.iterations.len()).await;
        let purpose = format!("baseline-{:02}", next_index);
        let baseline = workspaces
            .adopt_as_baseline(&workspace, &purpose)
            .await
            .map_err(eyre::Report::new)?;

        let recorded = baseline.clone();
        store
            .mutate(
                RunEvent::WorkspaceProvisioned {
                    owner: "baseline".into(),
                    path: baseline.path.display().to_string(),
                },
                move |run| run.baseline = Some(recorded),
            )
            .await?;
        workspaces.dispose(&workspace, workspaces.config().cleanup, true).await;
        info!(baseline = %baseline.path.display(), "Carried rejected winner forward as baseline");
        Ok(baseline)
    }

    async fn fail_run(
        &self,
        store: &Arc<StateStore>,
        kind: &str,
        message: impl Into<String>,
    ) -> Result<()> {
        let kind = kind.to_string();
        let message = message.into();
        store
            .mutate(
                RunEvent::RunStatusChanged { status: RunStatus::Failed.to_string() },
                move |run| run.fail(kind, message),
            )
            .await?;
        Ok(())
    }

    async fn mark_aborted(&self, store: &Arc<StateStore>, prompts: &Arc<PromptChannel>) -> Result<()> {
        prompts.cancel_pending();
        store
            .mutate(
                RunEvent::RunStatusChanged { status: RunStatus::Aborted.to_string() },
                |run| {
                    if !run.is_terminal() {
                        run.set_status(RunStatus::Aborted);
                    }
                },
            )
            .await?;
        Ok(())
    }
}

/// The approved-but-unpersisted iteration's index and winner
fn approved_winner(run: &Run) -> Option<(u32, Candidate)> {
    run.iterations
        .iter()
        .rev()
        .find(|it| it.decision == Some(IterationDecision::Approved))
        .and_then(|it| {
            let winner = it.winner.as_ref().and_then(|w| it.candidate(w))?.clone();
            Some((it.index, winner))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{MockAgent, PlanDraft, PlannerOutcome, ReviewOutcome};
    use crate::domain::{TestCommand, Verdict};
    use crate::workspace::StrategyChoice;
    use std::fs;
    use tempfile::tempdir;

    fn mock_factory(
        reviewers: Vec<Arc<MockAgent>>,
        executors: Vec<Arc<MockAgent>>,
    ) -> AgentFactory {
        Box::new(move |_| {
            Ok(AgentSet {
                reviewers: reviewers.iter().map(|a| a.clone() as Arc<dyn AgentAdapter>).collect(),
                executors: executors.iter().map(|a| a.clone() as Arc<dyn AgentAdapter>).collect(),
            })
        })
    }

    fn base_config(runs_dir: &Path) -> Config {
        let mut config = Config::default();
        config.storage.runs_dir = Some(runs_dir.to_path_buf());
        config.workspace.strategy = StrategyChoice::Copy;
        config.prompts.poll_interval_ms = 20;
        config
    }

    fn trivial_plan() -> PlannerOutcome {
        PlannerOutcome::Plan(PlanDraft {
            executor_prompt: "implement it".into(),
            tasks: Vec::new(),
            test_commands: Some(vec![TestCommand::new(["true"])]),
            notes: None,
        })
    }

    fn rejection(candidate: &str) -> ReviewOutcome {
        ReviewOutcome::Review {
            verdict: Verdict::Rejected,
            ranking: vec![candidate.into()],
            feedback: "not good enough".into(),
        }
    }

    #[tokio::test]
    async fn test_happy_path_completes() {
        let runs = tempdir().unwrap();
        let repo = tempdir().unwrap();
        fs::write(repo.path().join("src.js"), "x").unwrap();

        let reviewer = Arc::new(MockAgent::new("rev-a"));
        reviewer.push_plan(trivial_plan());
        let executor = Arc::new(MockAgent::new("exec-a"));

        let orchestrator = Orchestrator::new(base_config(runs.path()))
            .with_agent_factory(mock_factory(vec![reviewer], vec![executor]));
        let report = orchestrator.start(repo.path(), "fix it").await.unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.exit_code(), 0);

        let run = crate::state::read_snapshot(
            &runs.path().join(&report.run_id).join("state.json"),
        )
        .unwrap();
        assert_eq!(run.winning_iteration, Some(0));
        assert_eq!(run.iterations.len(), 1);
    }

    #[tokio::test]
    async fn test_max_iterations_exceeded_with_carry_forward() {
        let runs = tempdir().unwrap();
        let repo = tempdir().unwrap();
        fs::write(repo.path().join("src.js"), "original").unwrap();

        let reviewer = Arc::new(MockAgent::new("rev-a"));
        for iteration in 0..2 {
            reviewer.push_plan(trivial_plan());
            reviewer.push_review(format!("cand-{:02}-01", iteration), rejection(&format!("cand-{:02}-01", iteration)));
        }
        let executor = Arc::new(MockAgent::new("exec-a"));

        let mut config = base_config(runs.path());
        config.orchestrator.max_iterations = 2;
        let orchestrator = Orchestrator::new(config)
            .with_agent_factory(mock_factory(vec![reviewer], vec![executor]));
        let report = orchestrator.start(repo.path(), "never good enough").await.unwrap();

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.failure.as_ref().unwrap().kind, "max-iterations-exceeded");

        let run = crate::state::read_snapshot(
            &runs.path().join(&report.run_id).join("state.json"),
        )
        .unwrap();
        assert_eq!(run.iterations.len(), 2);

        // Carry-forward: iteration 1 ran against a copied baseline holding
        // the iteration-0 winner's files
        let baseline = run.baseline.as_ref().expect("baseline persisted");
        assert_eq!(baseline.strategy, WorkspaceStrategy::Copy);
        assert!(baseline.path.join("src.js").exists());
    }

    #[tokio::test]
    async fn test_no_carry_forward_keeps_repo_baseline() {
        let runs = tempdir().unwrap();
        let repo = tempdir().unwrap();
        fs::write(repo.path().join("src.js"), "x").unwrap();

        let reviewer = Arc::new(MockAgent::new("rev-a"));
        reviewer.push_plan(trivial_plan());
        reviewer.push_review("cand-00-01", rejection("cand-00-01"));
        let executor = Arc::new(MockAgent::new("exec-a"));

        let mut config = base_config(runs.path());
        config.orchestrator.max_iterations = 1;
        config.orchestrator.carry_forward = false;
        let orchestrator = Orchestrator::new(config)
            .with_agent_factory(mock_factory(vec![reviewer], vec![executor]));
        let report = orchestrator.start(repo.path(), "task").await.unwrap();

        assert_eq!(report.failure.as_ref().unwrap().kind, "max-iterations-exceeded");
        let run = crate::state::read_snapshot(
            &runs.path().join(&report.run_id).join("state.json"),
        )
        .unwrap();
        assert!(run.baseline.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_run_is_aborted() {
        let runs = tempdir().unwrap();
        let repo = tempdir().unwrap();

        let orchestrator = Orchestrator::new(base_config(runs.path())).with_agent_factory(
            mock_factory(vec![Arc::new(MockAgent::new("rev-a"))], vec![Arc::new(MockAgent::new("exec-a"))]),
        );
        orchestrator.cancel_handle().send(true).unwrap();

        let report = orchestrator.start(repo.path(), "task").await.unwrap();
        assert_eq!(report.status, RunStatus::Aborted);
        assert_eq!(report.exit_code(), 6);
    }

    #[tokio::test]
    async fn test_resume_terminal_run_is_stable() {
        let runs = tempdir().unwrap();
        let repo = tempdir().unwrap();
        fs::write(repo.path().join("src.js"), "x").unwrap();

        let reviewer = Arc::new(MockAgent::new("rev-a"));
        reviewer.push_plan(trivial_plan());
        let executor = Arc::new(MockAgent::new("exec-a"));

        let orchestrator = Orchestrator::new(base_config(runs.path()))
            .with_agent_factory(mock_factory(vec![reviewer.clone()], vec![executor.clone()]));
        let report = orchestrator.start(repo.path(), "fix it").await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);

        // Resuming a terminal run changes nothing and invokes no agents
        let calls_before = executor.calls().len();
        let resumed = orchestrator.resume(&report.run_id).await.unwrap();
        assert_eq!(resumed.status, RunStatus::Completed);
        assert_eq!(executor.calls().len(), calls_before);
    }

    #[tokio::test]
    async fn test_resume_unknown_run() {
        let runs = tempdir().unwrap();
        let orchestrator = Orchestrator::new(base_config(runs.path()));
        assert!(orchestrator.resume("no-such-run").await.is_err());
    }

    #[test]
    fn test_exit_codes() {
        let report = |status, kind: Option<&str>| RunReport {
            run_id: "r".into(),
            status,
            failure: kind.map(|k| RunFailure { kind: k.into(), message: String::new() }),
        };
        assert_eq!(report(RunStatus::Completed, None).exit_code(), 0);
        assert_eq!(report(RunStatus::Aborted, None).exit_code(), 6);
        assert_eq!(report(RunStatus::Failed, Some("agent-invocation")).exit_code(), 3);
        assert_eq!(report(RunStatus::Failed, Some("test-runner")).exit_code(), 4);
        assert_eq!(report(RunStatus::Failed, Some("workspace")).exit_code(), 5);
        assert_eq!(report(RunStatus::Failed, Some("max-iterations-exceeded")).exit_code(), 1);
    }
}
