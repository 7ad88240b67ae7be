//! Workspace manager
//!
//! Provisions, disposes, and re-baselines the isolated working trees that
//! candidates run in: the source tree itself, a recursive copy, or a git
//! worktree on a dedicated branch. Operations on the source repository are
//! serialized; operations on distinct workspaces are independent.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::domain::{Workspace, WorkspaceStrategy, now_ms};

/// Error types for workspace operations
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Not a git repository with at least one commit: {0}")]
    NotAGitRepo(PathBuf),

    #[error("Failed to create workspace: {0}")]
    CreateFailed(String),

    #[error("Git command failed: {0}")]
    Git(String),

    #[error("Target has uncommitted changes; refusing to merge")]
    DirtyTarget,

    #[error("Merge conflict: {0}")]
    MergeConflict(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Configured strategy; `auto` picks worktree when the source is a git
/// repository with a commit, copy otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyChoice {
    #[default]
    Auto,
    InPlace,
    Copy,
    Worktree,
}

/// Disposal policy for candidate workspaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DisposePolicy {
    Always,
    #[default]
    OnSuccess,
    Never,
}

/// What to do when the merge target has uncommitted changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DirtyTargetPolicy {
    /// Auto-commit the target's changes with a templated message
    #[default]
    Commit,
    /// Refuse the merge
    Abort,
}

fn default_excluded() -> Vec<String> {
    ["node_modules", "target", "dist", "build", "__pycache__", ".venv"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_branch_prefix() -> String {
    "luigi".to_string()
}

fn default_target_branch() -> String {
    "main".to_string()
}

fn default_true() -> bool {
    true
}

fn default_diff_limit() -> usize {
    65536
}

/// Configuration for the workspace manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct WorkspaceConfig {
    /// Materialization strategy
    pub strategy: StrategyChoice,

    /// Directory names skipped by the copy strategy (deterministic per run).
    /// `.git` is copied so history and worktree support survive the copy.
    pub excluded: Vec<String>,

    /// Disposal policy for candidate workspaces
    pub cleanup: DisposePolicy,

    /// Branch prefix for worktree branches
    pub branch_prefix: String,

    /// Branch merged into on approval
    pub target_branch: String,

    /// Merge the winner into the target branch when an iteration is approved
    pub auto_merge_on_approval: bool,

    /// Dirty-target policy for merges
    pub dirty_target: DirtyTargetPolicy,

    /// Commit pending worktree changes before merging
    pub commit_before_merge: bool,

    /// Byte bound on captured textual diffs
    pub diff_limit_bytes: usize,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyChoice::Auto,
            excluded: default_excluded(),
            cleanup: DisposePolicy::OnSuccess,
            branch_prefix: default_branch_prefix(),
            target_branch: default_target_branch(),
            auto_merge_on_approval: true,
            dirty_target: DirtyTargetPolicy::Commit,
            commit_before_merge: default_true(),
            diff_limit_bytes: default_diff_limit(),
        }
    }
}

/// Manager for candidate and baseline workspaces
pub struct WorkspaceManager {
    config: WorkspaceConfig,

    /// Base directory for copies and worktrees (under the run directory)
    work_dir: PathBuf,

    /// Serializes worktree creation and merges against the source repository
    repo_lock: Mutex<()>,
}

impl WorkspaceManager {
    pub fn new(config: WorkspaceConfig, work_dir: impl Into<PathBuf>) -> Self {
        let work_dir = work_dir.into();
        debug!(?work_dir, "WorkspaceManager::new: called");
        Self { config, work_dir, repo_lock: Mutex::new(()) }
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    pub(crate) async fn lock_repo(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.repo_lock.lock().await
    }

    /// Resolve the configured strategy against a concrete source tree
    pub async fn resolve_strategy(&self, source: &Path) -> WorkspaceStrategy {
        match self.config.strategy {
            StrategyChoice::InPlace => WorkspaceStrategy::InPlace,
            StrategyChoice::Copy => WorkspaceStrategy::Copy,
            StrategyChoice::Worktree => WorkspaceStrategy::Worktree,
            StrategyChoice::Auto => {
                if has_commit(source).await {
                    WorkspaceStrategy::Worktree
                } else {
                    debug!(source = %source.display(), "resolve_strategy: no git history, falling back to copy");
                    WorkspaceStrategy::Copy
                }
            }
        }
    }

    /// Provision a workspace from `source` under the configured strategy
    pub async fn provision(&self, source: &Path, purpose: &str) -> Result<Workspace, WorkspaceError> {
        let strategy = self.resolve_strategy(source).await;
        self.provision_with(strategy, source, purpose).await
    }

    /// Provision a workspace with an explicit strategy
    pub async fn provision_with(
        &self,
        strategy: WorkspaceStrategy,
        source: &Path,
        purpose: &str,
    ) -> Result<Workspace, WorkspaceError> {
        debug!(%strategy, source = %source.display(), %purpose, "provision_with: called");
        match strategy {
            WorkspaceStrategy::InPlace => Ok(Workspace::in_place(source)),
            WorkspaceStrategy::Copy => self.provision_copy(source, purpose).await,
            WorkspaceStrategy::Worktree => self.provision_worktree(source, purpose).await,
        }
    }

    async fn provision_copy(&self, source: &Path, purpose: &str) -> Result<Workspace, WorkspaceError> {
        let dest = self.work_dir.join(purpose);
        if dest.exists() {
            return Err(WorkspaceError::CreateFailed(format!(
                "workspace directory already exists: {}",
                dest.display()
            )));
        }
        fs::create_dir_all(&self.work_dir)?;

        copy_tree(source, &dest, &self.config.excluded)?;
        info!(dest = %dest.display(), "Provisioned copy workspace");

        Ok(Workspace {
            strategy: WorkspaceStrategy::Copy,
            path: dest,
            source: source.to_path_buf(),
            branch: None,
            dirty: false,
            created_at: now_ms(),
        })
    }

    async fn provision_worktree(&self, source: &Path, purpose: &str) -> Result<Workspace, WorkspaceError> {
        if !has_commit(source).await {
            return Err(WorkspaceError::NotAGitRepo(source.to_path_buf()));
        }

        fs::create_dir_all(&self.work_dir)?;
        let path = self.work_dir.join(purpose);
        let branch = format!("{}/{}", self.config.branch_prefix, purpose);

        let _guard = self.repo_lock.lock().await;
        let output = Command::new("git")
            .args([
                "worktree",
                "add",
                &path.to_string_lossy(),
                "-b",
                &branch,
                "HEAD",
            ])
            .current_dir(source)
            .output()
            .await
            .map_err(|e| WorkspaceError::Git(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorkspaceError::CreateFailed(stderr.to_string()));
        }

        info!(path = %path.display(), %branch, "Provisioned worktree workspace");

        Ok(Workspace {
            strategy: WorkspaceStrategy::Worktree,
            path,
            source: source.to_path_buf(),
            branch: Some(branch),
            dirty: false,
            created_at: now_ms(),
        })
    }

    /// Re-attach a persisted workspace if its directory still exists
    pub fn reattach(&self, workspace: &Workspace) -> Option<Workspace> {
        if workspace.path.exists() {
            debug!(path = %workspace.path.display(), "reattach: workspace still present");
            Some(workspace.clone())
        } else {
            warn!(path = %workspace.path.display(), "reattach: workspace directory gone");
            None
        }
    }

    /// Carry a rejected-but-best candidate forward: always a copy, so
    /// uncommitted changes survive regardless of the run strategy.
    pub async fn adopt_as_baseline(
        &self,
        workspace: &Workspace,
        purpose: &str,
    ) -> Result<Workspace, WorkspaceError> {
        debug!(from = %workspace.path.display(), %purpose, "adopt_as_baseline: called");
        self.provision_copy(&workspace.path, purpose).await
    }

    /// Dispose a workspace under the given policy. Best-effort; never fatal.
    pub async fn dispose(&self, workspace: &Workspace, policy: DisposePolicy, success: bool) {
        let remove = match policy {
            DisposePolicy::Always => true,
            DisposePolicy::OnSuccess => success,
            DisposePolicy::Never => false,
        };
        if !remove || workspace.is_in_place() {
            debug!(path = %workspace.path.display(), ?policy, "dispose: keeping workspace");
            return;
        }

        if workspace.strategy == WorkspaceStrategy::Worktree {
            let _guard = self.repo_lock.lock().await;
            let result = Command::new("git")
                .args(["worktree", "remove", &workspace.path.to_string_lossy(), "--force"])
                .current_dir(&workspace.source)
                .output()
                .await;
            if let Err(e) = result {
                warn!(path = %workspace.path.display(), error = %e, "dispose: worktree removal failed");
            }
            if let Some(branch) = &workspace.branch {
                let _ = Command::new("git")
                    .args(["branch", "-D", branch])
                    .current_dir(&workspace.source)
                    .output()
                    .await;
            }
        }

        if workspace.path.exists() {
            if let Err(e) = fs::remove_dir_all(&workspace.path) {
                warn!(path = %workspace.path.display(), error = %e, "dispose: directory removal failed");
                return;
            }
        }
        info!(path = %workspace.path.display(), "Disposed workspace");
    }
}

/// Whether `path` is a git repository with at least one commit
pub async fn has_commit(path: &Path) -> bool {
    let output = Command::new("git")
        .args(["rev-parse", "--verify", "HEAD"])
        .current_dir(path)
        .output()
        .await;
    matches!(output, Ok(out) if out.status.success())
}

/// Recursively copy `source` into `dest`, skipping excluded directory names
fn copy_tree(source: &Path, dest: &Path, excluded: &[String]) -> Result<(), WorkspaceError> {
    for entry in WalkDir::new(source).into_iter().filter_entry(|e| {
        if e.depth() == 0 || !e.file_type().is_dir() {
            return true;
        }
        let name = e.file_name().to_string_lossy();
        !excluded.iter().any(|ex| ex == &*name)
    }) {
        let entry = entry.map_err(|e| WorkspaceError::CreateFailed(e.to_string()))?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| WorkspaceError::CreateFailed(e.to_string()))?;
        let target = dest.join(rel);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
        // Symlinks are skipped; agents work on regular trees
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn setup_git_repo(dir: &Path) {
        Command::new("git").args(["init"]).current_dir(dir).output().await.unwrap();
        Command::new("git")
            .args(["config", "user.email", "test@test.com"])
            .current_dir(dir)
            .output()
            .await
            .unwrap();
        Command::new("git")
            .args(["config", "user.name", "Test"])
            .current_dir(dir)
            .output()
            .await
            .unwrap();
        Command::new("git")
            .args(["commit", "--allow-empty", "-m", "initial"])
            .current_dir(dir)
            .output()
            .await
            .unwrap();
    }

    fn manager(work_dir: &Path, strategy: StrategyChoice) -> WorkspaceManager {
        let config = WorkspaceConfig { strategy, ..Default::default() };
        WorkspaceManager::new(config, work_dir)
    }

    #[tokio::test]
    async fn test_provision_in_place() {
        let repo = tempdir().unwrap();
        let work = tempdir().unwrap();
        let mgr = manager(work.path(), StrategyChoice::InPlace);

        let ws = mgr.provision(repo.path(), "base").await.unwrap();
        assert!(ws.is_in_place());
        assert_eq!(ws.path, repo.path());
    }

    #[tokio::test]
    async fn test_provision_copy_skips_excluded() {
        let repo = tempdir().unwrap();
        fs::create_dir_all(repo.path().join("src")).unwrap();
        fs::create_dir_all(repo.path().join("node_modules/dep")).unwrap();
        fs::write(repo.path().join("src/main.js"), "x").unwrap();
        fs::write(repo.path().join("node_modules/dep/index.js"), "y").unwrap();

        let work = tempdir().unwrap();
        let mgr = manager(work.path(), StrategyChoice::Copy);
        let ws = mgr.provision(repo.path(), "cand-00-01").await.unwrap();

        assert!(ws.path.join("src/main.js").exists());
        assert!(!ws.path.join("node_modules").exists());
    }

    #[tokio::test]
    async fn test_provision_copy_refuses_existing_dir() {
        let repo = tempdir().unwrap();
        let work = tempdir().unwrap();
        let mgr = manager(work.path(), StrategyChoice::Copy);

        mgr.provision(repo.path(), "cand-00-01").await.unwrap();
        let result = mgr.provision(repo.path(), "cand-00-01").await;
        assert!(matches!(result, Err(WorkspaceError::CreateFailed(_))));
    }

    #[tokio::test]
    async fn test_provision_worktree() {
        let repo = tempdir().unwrap();
        setup_git_repo(repo.path()).await;

        let work = tempdir().unwrap();
        let mgr = manager(work.path(), StrategyChoice::Worktree);
        let ws = mgr.provision(repo.path(), "cand-00-01").await.unwrap();

        assert_eq!(ws.strategy, WorkspaceStrategy::Worktree);
        assert!(ws.path.exists());
        assert_eq!(ws.branch.as_deref(), Some("luigi/cand-00-01"));
    }

    #[tokio::test]
    async fn test_worktree_requires_commit() {
        let repo = tempdir().unwrap();
        let work = tempdir().unwrap();
        let mgr = manager(work.path(), StrategyChoice::Worktree);

        let result = mgr.provision(repo.path(), "cand-00-01").await;
        assert!(matches!(result, Err(WorkspaceError::NotAGitRepo(_))));
    }

    #[tokio::test]
    async fn test_auto_falls_back_to_copy() {
        let repo = tempdir().unwrap();
        fs::write(repo.path().join("file.txt"), "data").unwrap();

        let work = tempdir().unwrap();
        let mgr = manager(work.path(), StrategyChoice::Auto);
        let ws = mgr.provision(repo.path(), "cand-00-01").await.unwrap();

        assert_eq!(ws.strategy, WorkspaceStrategy::Copy);
        assert!(ws.path.join("file.txt").exists());
    }

    #[tokio::test]
    async fn test_dispose_policies() {
        let repo = tempdir().unwrap();
        fs::write(repo.path().join("file.txt"), "data").unwrap();
        let work = tempdir().unwrap();
        let mgr = manager(work.path(), StrategyChoice::Copy);

        let ws = mgr.provision(repo.path(), "a").await.unwrap();
        mgr.dispose(&ws, DisposePolicy::Never, true).await;
        assert!(ws.path.exists());

        mgr.dispose(&ws, DisposePolicy::OnSuccess, false).await;
        assert!(ws.path.exists());

        mgr.dispose(&ws, DisposePolicy::OnSuccess, true).await;
        assert!(!ws.path.exists());
    }

    #[tokio::test]
    async fn test_dispose_worktree_removes_branch() {
        let repo = tempdir().unwrap();
        setup_git_repo(repo.path()).await;
        let work = tempdir().unwrap();
        let mgr = manager(work.path(), StrategyChoice::Worktree);

        let ws = mgr.provision(repo.path(), "cand-00-01").await.unwrap();
        mgr.dispose(&ws, DisposePolicy::Always, false).await;
        assert!(!ws.path.exists());

        let branches = Command::new("git")
            .args(["branch", "--list", "luigi/cand-00-01"])
            .current_dir(repo.path())
            .output()
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&branches.stdout).trim().is_empty());
    }

    #[tokio::test]
    async fn test_adopt_as_baseline_always_copies() {
        let repo = tempdir().unwrap();
        setup_git_repo(repo.path()).await;
        fs::write(repo.path().join("file.txt"), "committed").unwrap();

        let work = tempdir().unwrap();
        let mgr = manager(work.path(), StrategyChoice::Worktree);
        let ws = mgr.provision(repo.path(), "cand-00-01").await.unwrap();

        // Uncommitted change in the worktree survives adoption
        fs::write(ws.path.join("new.txt"), "uncommitted").unwrap();
        let baseline = mgr.adopt_as_baseline(&ws, "baseline-1").await.unwrap();

        assert_eq!(baseline.strategy, WorkspaceStrategy::Copy);
        assert!(baseline.path.join("new.txt").exists());
    }

    #[tokio::test]
    async fn test_reattach() {
        let repo = tempdir().unwrap();
        let work = tempdir().unwrap();
        let mgr = manager(work.path(), StrategyChoice::Copy);

        let ws = mgr.provision(repo.path(), "cand-00-01").await.unwrap();
        assert!(mgr.reattach(&ws).is_some());

        fs::remove_dir_all(&ws.path).unwrap();
        assert!(mgr.reattach(&ws).is_none());
    }
}
