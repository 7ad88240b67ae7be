//! Applying workspace changes back to the target repository
//!
//! Copy workspaces merge back with an overwrite-wins policy on changed
//! paths; worktrees commit and merge into the configured target branch. A
//! conflicting merge is aborted and surfaced so the orchestrator can
//! delegate resolution to an executor.

use std::fs;
use std::path::Path;

use tokio::process::Command;
use tracing::{info, warn};

use crate::domain::{Workspace, WorkspaceStrategy};

use super::manager::{DirtyTargetPolicy, WorkspaceError, WorkspaceManager};
use super::snapshot::changed_paths_between;

/// What applying a workspace did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppliedChanges {
    /// In-place workspace; the target already has the changes
    None,
    /// Files overwritten in the target
    Copied { paths: Vec<String> },
    /// Worktree branch merged into the target branch
    Merged { branch: String, target_branch: String },
}

impl AppliedChanges {
    /// Paths written into the target, when known
    pub fn paths(&self) -> &[String] {
        match self {
            Self::Copied { paths } => paths,
            _ => &[],
        }
    }
}

/// Apply a workspace's changes to `target` under the manager's policies
pub async fn apply_changes(
    manager: &WorkspaceManager,
    workspace: &Workspace,
    target: &Path,
) -> Result<AppliedChanges, WorkspaceError> {
    match workspace.strategy {
        WorkspaceStrategy::InPlace => Ok(AppliedChanges::None),
        WorkspaceStrategy::Copy => {
            let paths = overwrite_changed(workspace, target, &manager.config().excluded)?;
            info!(count = paths.len(), target = %target.display(), "Applied copy workspace changes");
            Ok(AppliedChanges::Copied { paths })
        }
        WorkspaceStrategy::Worktree => {
            let _guard = manager.lock_repo().await;
            merge_worktree(
                workspace,
                target,
                &manager.config().target_branch,
                manager.config().dirty_target,
                manager.config().commit_before_merge,
            )
            .await
        }
    }
}

/// Whole-file overwrite of changed paths; never deletes paths absent from
/// the workspace.
fn overwrite_changed(
    workspace: &Workspace,
    target: &Path,
    excluded: &[String],
) -> Result<Vec<String>, WorkspaceError> {
    let paths = changed_paths_between(target, &workspace.path, excluded)?;
    for rel in &paths {
        let dest = target.join(rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(workspace.path.join(rel), &dest)?;
    }
    Ok(paths)
}

/// Merge a worktree branch into the target branch
///
/// 1. Optionally commit pending changes in the worktree
/// 2. Apply the dirty-target policy in the target repository
/// 3. Check out the target branch and merge with `--no-ff`
///
/// A conflicting merge is aborted and returned as
/// [`WorkspaceError::MergeConflict`].
async fn merge_worktree(
    workspace: &Workspace,
    target: &Path,
    target_branch: &str,
    dirty_policy: DirtyTargetPolicy,
    commit_before_merge: bool,
) -> Result<AppliedChanges, WorkspaceError> {
    let branch = workspace
        .branch
        .clone()
        .ok_or_else(|| WorkspaceError::Git("worktree workspace without a branch".into()))?;

    if commit_before_merge {
        auto_commit(&workspace.path, &format!("luigi: changes on {}", branch)).await?;
    }

    // Dirty-target policy
    let status = git(target, &["status", "--porcelain"]).await?;
    if !status.trim().is_empty() {
        match dirty_policy {
            DirtyTargetPolicy::Abort => return Err(WorkspaceError::DirtyTarget),
            DirtyTargetPolicy::Commit => {
                warn!(target = %target.display(), "Target dirty; auto-committing before merge");
                auto_commit(target, &format!("luigi: auto-commit before merging {}", branch))
                    .await?;
            }
        }
    }

    git(target, &["checkout", target_branch]).await?;

    let merge_msg = format!("Merge {}", branch);
    let output = Command::new("git")
        .args(["merge", "--no-ff", &branch, "-m", &merge_msg])
        .current_dir(target)
        .output()
        .await
        .map_err(|e| WorkspaceError::Git(e.to_string()))?;

    if !output.status.success() {
        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        if combined.contains("CONFLICT") {
            warn!(%branch, "Merge conflict; aborting merge");
            let _ = Command::new("git")
                .args(["merge", "--abort"])
                .current_dir(target)
                .output()
                .await;
            return Err(WorkspaceError::MergeConflict(combined));
        }
        return Err(WorkspaceError::Git(combined));
    }

    info!(%branch, %target_branch, "Merged worktree branch");
    Ok(AppliedChanges::Merged { branch, target_branch: target_branch.to_string() })
}

/// Stage and commit any pending changes; no-op on a clean tree
pub async fn commit_pending(path: &Path, message: &str) -> Result<(), WorkspaceError> {
    auto_commit(path, message).await
}

async fn auto_commit(path: &Path, message: &str) -> Result<(), WorkspaceError> {
    let status = git(path, &["status", "--porcelain"]).await?;
    if status.trim().is_empty() {
        return Ok(());
    }

    git(path, &["add", "-A"]).await?;
    let output = Command::new("git")
        .args(["commit", "-m", message])
        .current_dir(path)
        .output()
        .await
        .map_err(|e| WorkspaceError::Git(e.to_string()))?;
    if !output.status.success() {
        // Might be nothing to commit after staging; don't fail the merge
        warn!(path = %path.display(), "auto_commit: commit failed");
    }
    Ok(())
}

async fn git(dir: &Path, args: &[&str]) -> Result<String, WorkspaceError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .map_err(|e| WorkspaceError::Git(e.to_string()))?;
    if !output.status.success() {
        return Err(WorkspaceError::Git(
            String::from_utf8_lossy(&output.stderr).to_string(),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
