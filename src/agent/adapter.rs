//! Agent adapter
//!
//! The capability planner/reviewer and executor implementations live behind:
//! `plan`, `execute`, `review`, and the plan-like `clarify` used to answer
//! executor questions. Implementations are selected at config-load time from
//! a tagged variant per agent kind; no inheritance.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::domain::{ChangeSummary, ExecutorResult, Plan, TestCommand, TestCommandResult, Verdict};

use super::process::{AgentInvocationError, Invocation, InvocationConfig, invoke};
use super::protocol::{
    self, AgentProtocolError, PHASE_EXECUTE, PHASE_PLAN, PHASE_REVIEW, PlannerReply,
};

/// Environment variable overriding the interpreter for `python-module`
/// agents (legacy adapter mode).
pub const PYTHON_OVERRIDE_ENV: &str = "LUIGI_PYTHON";

/// Invocation or protocol failure, after retries
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Invocation(#[from] AgentInvocationError),

    #[error(transparent)]
    Protocol(#[from] AgentProtocolError),
}

impl AgentError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Invocation(AgentInvocationError::Cancelled))
    }
}

/// How an agent binary is launched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    /// An argv prefix; flags and prompt are appended
    #[default]
    Cli,
    /// A Python module run as `$LUIGI_PYTHON -m <module>`
    PythonModule,
}

/// One configured agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AgentSpec {
    /// Stable agent id, used in plans, candidates, and reviews
    pub id: String,

    #[serde(default)]
    pub kind: AgentKind,

    /// Program and base arguments (`cli` kind)
    #[serde(default)]
    pub command: Vec<String>,

    /// Module name (`python-module` kind)
    #[serde(default)]
    pub module: Option<String>,
}

impl AgentSpec {
    /// The argv prefix this spec launches
    pub fn argv(&self) -> Result<Vec<String>, String> {
        match self.kind {
            AgentKind::Cli => {
                if self.command.is_empty() {
                    return Err(format!("agent '{}' has an empty command", self.id));
                }
                Ok(self.command.clone())
            }
            AgentKind::PythonModule => {
                let module = self
                    .module
                    .as_ref()
                    .ok_or_else(|| format!("agent '{}' is python-module without a module", self.id))?;
                let python =
                    std::env::var(PYTHON_OVERRIDE_ENV).unwrap_or_else(|_| "python3".to_string());
                Ok(vec![python, "-m".to_string(), module.clone()])
            }
        }
    }
}

/// Retry policy for agent invocations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RetryConfig {
    /// Additional attempts after the first failure
    pub max_retries: u32,
    /// Base backoff, doubled per attempt
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: 2, backoff_ms: 500 }
    }
}

/// A plan produced by a planner, before the scheduler assigns ids
#[derive(Debug, Clone)]
pub struct PlanDraft {
    pub executor_prompt: String,
    pub tasks: Vec<String>,
    pub test_commands: Option<Vec<TestCommand>>,
    pub notes: Option<String>,
}

impl PlanDraft {
    /// Promote into a domain plan with assigned ids
    pub fn into_plan(self, id: impl Into<String>, reviewer_id: impl Into<String>) -> Plan {
        let mut plan = Plan::new(id, reviewer_id, self.executor_prompt);
        plan.tasks = self.tasks;
        plan.test_commands = self.test_commands;
        plan.notes = self.notes;
        plan
    }
}

/// Planner output
#[derive(Debug, Clone)]
pub enum PlannerOutcome {
    Plan(PlanDraft),
    NeedsUserInput(Vec<String>),
}

/// Reviewer output
#[derive(Debug, Clone)]
pub enum ReviewOutcome {
    Review { verdict: Verdict, ranking: Vec<String>, feedback: String },
    NeedsUserInput(Vec<String>),
}

/// Planning request
pub struct PlanRequest<'a> {
    pub task: &'a str,
    /// Accumulated context: iteration history, answered questions
    pub context: Option<&'a str>,
    pub cwd: &'a Path,
}

/// Execution request
pub struct ExecuteRequest<'a> {
    pub candidate_id: &'a str,
    pub prompt: &'a str,
    pub workspace: &'a Path,
    /// Session to resume after a clarification round
    pub session: Option<&'a str>,
    /// Reviewer answers to the executor's questions
    pub answers: Option<&'a [String]>,
}

/// Review request
pub struct ReviewRequest<'a> {
    pub candidate_id: &'a str,
    /// All candidate ids in the iteration, for the ranking
    pub candidate_ids: &'a [String],
    pub plan: &'a Plan,
    pub diff: &'a ChangeSummary,
    pub test_results: &'a [TestCommandResult],
    /// User answers when re-invoking after needs-user-input
    pub context: Option<&'a str>,
    pub cwd: &'a Path,
}

/// Clarification request (executor Q&A round)
pub struct ClarifyRequest<'a> {
    pub questions: &'a [String],
    pub context: &'a str,
    pub cwd: &'a Path,
}

/// The capability behind which agent implementations live
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    fn id(&self) -> &str;

    async fn plan(&self, req: PlanRequest<'_>) -> Result<PlannerOutcome, AgentError>;

    async fn execute(&self, req: ExecuteRequest<'_>) -> Result<ExecutorResult, AgentError>;

    async fn review(&self, req: ReviewRequest<'_>) -> Result<ReviewOutcome, AgentError>;

    async fn clarify(&self, req: ClarifyRequest<'_>) -> Result<Vec<String>, AgentError>;
}

/// Child-process agent
pub struct CliAgent {
    id: String,
    argv: Vec<String>,
    agents_dir: PathBuf,
    invocation: InvocationConfig,
    retry: RetryConfig,
    cancel: watch::Receiver<bool>,
    seq: AtomicU64,
}

impl CliAgent {
    pub fn new(
        id: impl Into<String>,
        argv: Vec<String>,
        agents_dir: impl Into<PathBuf>,
        invocation: InvocationConfig,
        retry: RetryConfig,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id: id.into(),
            argv,
            agents_dir: agents_dir.into(),
            invocation,
            retry,
            cancel,
            seq: AtomicU64::new(0),
        }
    }

    /// Invoke with retries, parsing inside the loop so protocol failures are
    /// retried the same way invocation failures are.
    async fn call<T>(
        &self,
        phase: &str,
        cwd: &Path,
        prompt: &str,
        resume: Option<&str>,
        parse: impl Fn(&str) -> Result<T, AgentProtocolError>,
    ) -> Result<T, AgentError> {
        let mut attempt: u32 = 0;
        loop {
            let n = self.seq.fetch_add(1, Ordering::SeqCst);
            let stem = format!("{:03}-{}-{}", n, self.id, phase);
            let result = invoke(
                Invocation {
                    argv: &self.argv,
                    cwd,
                    prompt,
                    resume_session: resume,
                    log_path: &self.agents_dir.join(format!("{}.log", stem)),
                    output_path: &self.agents_dir.join(format!("{}.json", stem)),
                },
                &self.invocation,
                &self.cancel,
            )
            .await;

            let err: AgentError = match result {
                Ok(message) => match parse(&message) {
                    Ok(parsed) => return Ok(parsed),
                    Err(e) => e.into(),
                },
                Err(e) => e.into(),
            };

            if err.is_cancelled() || attempt >= self.retry.max_retries {
                return Err(err);
            }
            let backoff = Duration::from_millis(self.retry.backoff_ms << attempt);
            warn!(agent = %self.id, %phase, attempt, error = %err, ?backoff, "Agent call failed; retrying");
            sleep(backoff).await;
            attempt += 1;
        }
    }

    fn plan_prompt(task: &str, context: Option<&str>) -> String {
        let mut prompt = format!(
            "{}\n\nTask:\n{}\n\nProduce an implementation plan as a JSON object:\n\
             {{\"claude_prompt\": string, \"tasks\": [string], \
             \"test_commands\": null | [{{\"argv\": [string], \"cwd\"?: string, \"timeout_sec\"?: number}}], \
             \"notes\"?: string}}\n\
             Use null test_commands to request the default test suite. \
             If you need human input first, reply with \
             {{\"status\": \"NEEDS_USER_INPUT\", \"questions\": [string]}}.",
            PHASE_PLAN, task
        );
        if let Some(ctx) = context {
            prompt.push_str("\n\nAdditional context:\n");
            prompt.push_str(ctx);
        }
        prompt
    }

    fn execute_prompt(req: &ExecuteRequest<'_>) -> String {
        let mut prompt = format!("{}\n\n{}", PHASE_EXECUTE, req.prompt);
        if let Some(answers) = req.answers {
            prompt.push_str("\n\nAnswers to your questions:\n");
            for answer in answers {
                prompt.push_str("- ");
                prompt.push_str(answer);
                prompt.push('\n');
            }
        }
        prompt.push_str(
            "\n\nWhen finished, report a JSON object: \
             {\"status\": \"DONE\"|\"NEEDS_REVIEWER\"|\"FAILED\", \"summary\": string, \
             \"questions\"?: [string], \"session_id\"?: string, \"notes\"?: string}",
        );
        prompt
    }

    fn review_prompt(req: &ReviewRequest<'_>) -> String {
        let mut prompt = format!(
            "{}\n\nCandidate under review: {}\nAll candidates: {}\n\nPlan:\n{}\n",
            PHASE_REVIEW,
            req.candidate_id,
            req.candidate_ids.join(", "),
            req.plan.executor_prompt,
        );
        if !req.plan.tasks.is_empty() {
            prompt.push_str("Tasks:\n");
            for task in &req.plan.tasks {
                prompt.push_str("- ");
                prompt.push_str(task);
                prompt.push('\n');
            }
        }
        prompt.push_str("\nChanged paths:\n");
        for path in &req.diff.changed_paths {
            prompt.push_str("- ");
            prompt.push_str(path);
            prompt.push('\n');
        }
        if !req.diff.diff.is_empty() {
            prompt.push_str("\nDiff:\n");
            prompt.push_str(&req.diff.diff);
            prompt.push('\n');
        }
        prompt.push_str("\nTest results:\n");
        for result in req.test_results {
            prompt.push_str(&format!(
                "- `{}` exit={} timed_out={} ({}ms)\n",
                result.argv.join(" "),
                result.exit_code,
                result.timed_out,
                result.duration_ms,
            ));
            if !result.stdout.is_empty() {
                prompt.push_str(&format!("  stdout: {}\n", result.stdout.trim_end()));
            }
            if !result.stderr.is_empty() {
                prompt.push_str(&format!("  stderr: {}\n", result.stderr.trim_end()));
            }
        }
        if let Some(ctx) = req.context {
            prompt.push_str("\nUser answers:\n");
            prompt.push_str(ctx);
            prompt.push('\n');
        }
        prompt.push_str(
            "\nReply with a JSON object: {\"status\": \"APPROVED\"|\"REJECTED\"|\"NEEDS_USER_INPUT\", \
             \"ranking\": [candidate ids, best first], \"feedback\": string, \"questions\"?: [string]}",
        );
        prompt
    }

    fn clarify_prompt(req: &ClarifyRequest<'_>) -> String {
        let mut prompt = format!(
            "{}\n\nAn executor implementing your plan needs answers before it can continue.\n\nQuestions:\n",
            PHASE_PLAN
        );
        for question in req.questions {
            prompt.push_str("- ");
            prompt.push_str(question);
            prompt.push('\n');
        }
        prompt.push_str("\nConversation context:\n");
        prompt.push_str(req.context);
        prompt.push_str("\n\nReply with a JSON object: {\"answers\": [string]}");
        prompt
    }
}

#[async_trait]
impl AgentAdapter for CliAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn plan(&self, req: PlanRequest<'_>) -> Result<PlannerOutcome, AgentError> {
        debug!(agent = %self.id, "plan: called");
        let prompt = Self::plan_prompt(req.task, req.context);
        let reply = self
            .call("plan", req.cwd, &prompt, None, protocol::parse_planner)
            .await?;
        Ok(match reply {
            PlannerReply::Plan(msg) => PlannerOutcome::Plan(PlanDraft {
                executor_prompt: msg.claude_prompt,
                tasks: msg.tasks,
                test_commands: msg
                    .test_commands
                    .map(|cmds| cmds.into_iter().map(Into::into).collect()),
                notes: msg.notes,
            }),
            PlannerReply::NeedsInput(q) => PlannerOutcome::NeedsUserInput(q.questions),
        })
    }

    async fn execute(&self, req: ExecuteRequest<'_>) -> Result<ExecutorResult, AgentError> {
        debug!(agent = %self.id, candidate = %req.candidate_id, session = ?req.session, "execute: called");
        let prompt = Self::execute_prompt(&req);
        let msg = self
            .call("execute", req.workspace, &prompt, req.session, protocol::parse_executor)
            .await?;
        Ok(msg.into())
    }

    async fn review(&self, req: ReviewRequest<'_>) -> Result<ReviewOutcome, AgentError> {
        debug!(agent = %self.id, candidate = %req.candidate_id, "review: called");
        let prompt = Self::review_prompt(&req);
        let msg = self
            .call("review", req.cwd, &prompt, None, protocol::parse_review)
            .await?;
        Ok(match msg.verdict() {
            Some(verdict) => ReviewOutcome::Review {
                verdict,
                ranking: msg.ranking,
                feedback: msg.feedback,
            },
            None => ReviewOutcome::NeedsUserInput(msg.questions),
        })
    }

    async fn clarify(&self, req: ClarifyRequest<'_>) -> Result<Vec<String>, AgentError> {
        debug!(agent = %self.id, questions = req.questions.len(), "clarify: called");
        let prompt = Self::clarify_prompt(&req);
        self.call("clarify", req.cwd, &prompt, None, protocol::parse_clarify)
            .await
    }
}

/// Build adapters for a list of agent specs
pub fn build_agents(
    specs: &[AgentSpec],
    agents_dir: &Path,
    invocation: &InvocationConfig,
    retry: &RetryConfig,
    cancel: &watch::Receiver<bool>,
) -> Result<Vec<Arc<dyn AgentAdapter>>, String> {
    specs
        .iter()
        .map(|spec| {
            let argv = spec.argv()?;
            Ok(Arc::new(CliAgent::new(
                spec.id.clone(),
                argv,
                agents_dir,
                invocation.clone(),
                retry.clone(),
                cancel.clone(),
            )) as Arc<dyn AgentAdapter>)
        })
        .collect()
}
