//! Luigi configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::{AgentSpec, InvocationConfig, RetryConfig};
use crate::prompt::PromptConfig;
use crate::scheduler::SchedulerConfig;
use crate::testrun::TestRunConfig;
use crate::workspace::{StrategyChoice, WorkspaceConfig};

/// Surfaced before any run starts; non-retryable
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main Luigi configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Reviewer and executor agents
    pub agents: AgentsConfig,

    /// Candidate fan-out and question-round caps
    pub scheduler: SchedulerConfig,

    /// Workspace strategy, cleanup, and merge policies
    pub workspace: WorkspaceConfig,

    /// Test runner settings and fallback commands
    pub tests: TestRunConfig,

    /// Prompt channel settings
    pub prompts: PromptConfig,

    /// Run loop settings
    pub orchestrator: OrchestratorConfig,

    /// Storage locations
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self, ConfigError> {
        if let Some(path) = config_path {
            return Self::load_from_file(path);
        }

        // Project-local config
        let local_config = PathBuf::from(".luigi.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // User config: ~/.config/luigi/luigi.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("luigi").join("luigi.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(&path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Reject configurations the engine cannot run
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agents.reviewers.is_empty() {
            return Err(ConfigError::Invalid("no reviewers configured".into()));
        }
        if self.agents.executors.is_empty() {
            return Err(ConfigError::Invalid("no executors configured".into()));
        }
        for spec in self.agents.reviewers.iter().chain(&self.agents.executors) {
            spec.argv().map_err(ConfigError::Invalid)?;
        }

        let mut ids: Vec<&str> = self
            .agents
            .reviewers
            .iter()
            .chain(&self.agents.executors)
            .map(|s| s.id.as_str())
            .collect();
        ids.sort_unstable();
        if ids.windows(2).any(|w| w[0] == w[1]) {
            return Err(ConfigError::Invalid("duplicate agent id".into()));
        }

        if self.scheduler.executors_per_plan == 0 {
            return Err(ConfigError::Invalid("executors-per-plan must be at least 1".into()));
        }
        if self.scheduler.executors_per_plan > self.agents.executors.len() {
            return Err(ConfigError::Invalid(
                "executors-per-plan exceeds the number of configured executors".into(),
            ));
        }

        // Two candidates cannot share one working tree
        let candidates_per_iteration =
            self.agents.reviewers.len() * self.scheduler.executors_per_plan;
        if self.workspace.strategy == StrategyChoice::InPlace && candidates_per_iteration > 1 {
            return Err(ConfigError::Invalid(
                "in-place strategy requires exactly one candidate per iteration".into(),
            ));
        }
        Ok(())
    }

    /// Directory run state lives under
    pub fn runs_dir(&self) -> PathBuf {
        self.storage.runs_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("luigi")
                .join("runs")
        })
    }

    /// Timeout/termination settings for agent invocations
    pub fn invocation(&self) -> InvocationConfig {
        InvocationConfig {
            timeout: Duration::from_millis(self.agents.invocation_timeout_ms),
            term_grace: Duration::from_millis(self.agents.term_grace_ms),
        }
    }
}

fn default_invocation_timeout_ms() -> u64 {
    600_000
}

fn default_term_grace_ms() -> u64 {
    5_000
}

/// Agent roster and invocation limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AgentsConfig {
    /// Planning/reviewing agents; every reviewer plans and reviews
    pub reviewers: Vec<AgentSpec>,

    /// Executor agents, assigned round-robin
    pub executors: Vec<AgentSpec>,

    /// Per-invocation timeout in milliseconds
    pub invocation_timeout_ms: u64,

    /// Delay between SIGTERM and SIGKILL in milliseconds
    pub term_grace_ms: u64,

    /// Retry policy for failed invocations
    pub retry: RetryConfig,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            reviewers: Vec::new(),
            executors: Vec::new(),
            invocation_timeout_ms: default_invocation_timeout_ms(),
            term_grace_ms: default_term_grace_ms(),
            retry: RetryConfig::default(),
        }
    }
}

/// Run loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct OrchestratorConfig {
    /// Iteration cap; 0 means unlimited
    pub max_iterations: u32,

    /// Reuse a rejected winner's workspace as the next baseline
    pub carry_forward: bool,

    /// Stay idle after a run and wait for the next task
    pub session_mode: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { max_iterations: 5, carry_forward: true, session_mode: false }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StorageConfig {
    /// Directory for run state; defaults to the platform data dir
    pub runs_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentKind;

    fn agent(id: &str) -> AgentSpec {
        AgentSpec {
            id: id.into(),
            kind: AgentKind::Cli,
            command: vec!["agent-bin".into()],
            module: None,
        }
    }

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.agents.reviewers = vec![agent("rev-a")];
        config.agents.executors = vec![agent("exec-a")];
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.orchestrator.max_iterations, 5);
        assert!(config.orchestrator.carry_forward);
        assert_eq!(config.scheduler.executors_per_plan, 1);
        assert_eq!(config.tests.fallback_unit, vec!["npm", "test"]);
    }

    #[test]
    fn test_validate_requires_agents() {
        let config = Config::default();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_executors_per_plan_bound() {
        let mut config = valid_config();
        config.scheduler.executors_per_plan = 2;
        assert!(config.validate().is_err());

        config.agents.executors.push(agent("exec-b"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_in_place_single_candidate() {
        let mut config = valid_config();
        config.workspace.strategy = StrategyChoice::InPlace;
        assert!(config.validate().is_ok());

        config.agents.reviewers.push(agent("rev-b"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_duplicate_ids() {
        let mut config = valid_config();
        config.agents.executors.push(agent("rev-a"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
agents:
  reviewers:
    - id: rev-a
      command: ["reviewer-bin", "--json"]
  executors:
    - id: exec-a
      command: ["executor-bin"]
    - id: legacy
      kind: python-module
      module: legacy.executor
  invocation-timeout-ms: 120000

scheduler:
  executors-per-plan: 2
  max-question-rounds: 1

workspace:
  strategy: worktree
  target-branch: develop
  dirty-target: abort

tests:
  timeout-ms: 60000
  fallback-unit: ["make", "test"]

orchestrator:
  max-iterations: 2
  carry-forward: false
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.agents.reviewers.len(), 1);
        assert_eq!(config.agents.executors[1].kind, AgentKind::PythonModule);
        assert_eq!(config.agents.invocation_timeout_ms, 120_000);
        assert_eq!(config.scheduler.executors_per_plan, 2);
        assert_eq!(config.workspace.strategy, StrategyChoice::Worktree);
        assert_eq!(config.workspace.target_branch, "develop");
        assert_eq!(config.tests.fallback_unit, vec!["make", "test"]);
        assert_eq!(config.orchestrator.max_iterations, 2);
        assert!(!config.orchestrator.carry_forward);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let yaml = r#"
orchestrator:
  max-iterations: 1
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.orchestrator.max_iterations, 1);
        assert!(config.orchestrator.carry_forward);
        assert_eq!(config.prompts.poll_interval_ms, 2_000);
    }
}
