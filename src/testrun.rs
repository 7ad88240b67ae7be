//! Test command execution
//!
//! Runs a plan's test commands inside a candidate workspace. Each command
//! gets its own timeout and capped output capture; a failing or timed-out
//! command is recorded and the remaining commands still run.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::domain::{TestCommand, TestCommandResult};

/// Fatal runner failure; individual command failures are data, not errors
#[derive(Debug, Error)]
pub enum TestRunError {
    #[error("Workspace directory missing: {0}")]
    WorkspaceMissing(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn default_timeout_ms() -> u64 {
    300_000
}

fn default_output_cap() -> usize {
    16_384
}

fn default_fallback_unit() -> Vec<String> {
    vec!["npm".into(), "test".into()]
}

fn default_fallback_e2e() -> Vec<String> {
    vec!["npx".into(), "playwright".into(), "test".into()]
}

/// Test runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TestRunConfig {
    /// Global per-command timeout in milliseconds; a command's
    /// `timeout_sec` overrides it
    pub timeout_ms: u64,

    /// Byte cap per captured stream
    pub output_cap_bytes: usize,

    /// Prepend a package install when a manifest exists without its
    /// dependency directory
    pub install_if_missing: bool,

    /// Unit-test command substituted when a plan reports null test commands
    pub fallback_unit: Vec<String>,

    /// End-to-end command substituted alongside the unit fallback
    pub fallback_e2e: Vec<String>,
}

impl Default for TestRunConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            output_cap_bytes: default_output_cap(),
            install_if_missing: false,
            fallback_unit: default_fallback_unit(),
            fallback_e2e: default_fallback_e2e(),
        }
    }
}

/// The commands to actually run: the plan's own, or the configured fallbacks
pub fn effective_commands(
    plan_commands: Option<&[TestCommand]>,
    config: &TestRunConfig,
) -> Vec<TestCommand> {
    match plan_commands {
        Some(commands) => commands.to_vec(),
        None => {
            debug!("effective_commands: plan deferred to fallback commands");
            [&config.fallback_unit, &config.fallback_e2e]
                .into_iter()
                .filter(|argv| !argv.is_empty())
                .map(|argv| TestCommand::new(argv.clone()))
                .collect()
        }
    }
}

/// Prepend a dependency install when the workspace needs one
fn with_install(
    commands: Vec<TestCommand>,
    workspace: &Path,
    config: &TestRunConfig,
) -> Vec<TestCommand> {
    if config.install_if_missing
        && workspace.join("package.json").exists()
        && !workspace.join("node_modules").exists()
    {
        debug!("with_install: package.json present without node_modules; prepending install");
        let mut all = vec![TestCommand::new(["npm", "install"])];
        all.extend(commands);
        all
    } else {
        commands
    }
}

/// Run each command in the workspace, recording every outcome
pub async fn run_tests(
    commands: &[TestCommand],
    workspace: &Path,
    config: &TestRunConfig,
) -> Result<Vec<TestCommandResult>, TestRunError> {
    if !workspace.is_dir() {
        return Err(TestRunError::WorkspaceMissing(workspace.to_path_buf()));
    }

    let commands = with_install(commands.to_vec(), workspace, config);
    let mut results = Vec::with_capacity(commands.len());

    for command in &commands {
        let result = run_one(command, workspace, config).await;
        if !result.passed() {
            warn!(argv = ?result.argv, exit_code = result.exit_code, timed_out = result.timed_out, "Test command failed");
        }
        results.push(result);
    }

    let passed = results.iter().filter(|r| r.passed()).count();
    info!(passed, total = results.len(), workspace = %workspace.display(), "Test run finished");
    Ok(results)
}

async fn run_one(command: &TestCommand, workspace: &Path, config: &TestRunConfig) -> TestCommandResult {
    let timeout = command
        .timeout_sec
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_millis(config.timeout_ms));
    let cwd = match &command.cwd {
        Some(rel) => workspace.join(rel),
        None => workspace.to_path_buf(),
    };

    let mut result = TestCommandResult {
        argv: command.argv.clone(),
        exit_code: -1,
        duration_ms: 0,
        stdout: String::new(),
        stderr: String::new(),
        timed_out: false,
    };
    let Some((program, args)) = command.argv.split_first() else {
        result.stderr = "empty test command".into();
        return result;
    };

    let start = Instant::now();
    let spawned = Command::new(program)
        .args(args)
        .current_dir(&cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let child = match spawned {
        Ok(child) => child,
        Err(e) => {
            result.duration_ms = start.elapsed().as_millis() as u64;
            result.stderr = cap(&e.to_string(), config.output_cap_bytes);
            return result;
        }
    };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            result.exit_code = output.status.code().unwrap_or(-1);
            result.stdout = cap(&String::from_utf8_lossy(&output.stdout), config.output_cap_bytes);
            result.stderr = cap(&String::from_utf8_lossy(&output.stderr), config.output_cap_bytes);
        }
        Ok(Err(e)) => {
            result.stderr = cap(&e.to_string(), config.output_cap_bytes);
        }
        Err(_) => {
            // Dropping the wait future kills the child
            result.timed_out = true;
        }
    }
    result.duration_ms = start.elapsed().as_millis() as u64;
    result
}

/// Cap a captured stream, appending a truncation marker when exceeded
fn cap(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[output truncated]", &text[..end])
}
