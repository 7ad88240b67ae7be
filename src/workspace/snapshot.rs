//! Change snapshots
//!
//! Computes what a workspace changed relative to where it came from: the set
//! of changed paths, their total size, and a truncated textual diff. Never
//! mutates the workspace. Worktrees are inspected through git; copies are
//! compared file-by-file against their source tree.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use tokio::process::Command;
use tracing::debug;
use walkdir::WalkDir;

use crate::domain::{ChangeSummary, Workspace, WorkspaceStrategy};

use super::manager::WorkspaceError;

/// Summarize what `workspace` changed
pub async fn snapshot_changes(
    workspace: &Workspace,
    excluded: &[String],
    diff_limit: usize,
) -> Result<ChangeSummary, WorkspaceError> {
    debug!(path = %workspace.path.display(), strategy = %workspace.strategy, "snapshot_changes: called");

    match workspace.strategy {
        WorkspaceStrategy::Worktree => git_summary(&workspace.path, diff_limit).await,
        WorkspaceStrategy::Copy => {
            tree_summary(&workspace.path, &workspace.source, excluded, diff_limit).await
        }
        WorkspaceStrategy::InPlace => {
            if workspace.path.join(".git").exists() {
                git_summary(&workspace.path, diff_limit).await
            } else {
                // Nothing to compare against
                Ok(ChangeSummary::default())
            }
        }
    }
}

/// Changed paths and diff from git status/diff against HEAD
async fn git_summary(path: &Path, diff_limit: usize) -> Result<ChangeSummary, WorkspaceError> {
    let status = Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(path)
        .output()
        .await
        .map_err(|e| WorkspaceError::Git(e.to_string()))?;

    if !status.status.success() {
        return Err(WorkspaceError::Git(
            String::from_utf8_lossy(&status.stderr).to_string(),
        ));
    }

    let mut changed_paths: Vec<String> = String::from_utf8_lossy(&status.stdout)
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim_start();
            // Porcelain format: XY <path>
            trimmed.split_whitespace().nth(1).map(String::from)
        })
        .collect();
    changed_paths.sort();
    changed_paths.dedup();

    let total_bytes = changed_paths
        .iter()
        .filter_map(|p| fs::metadata(path.join(p)).ok())
        .map(|m| m.len())
        .sum();

    let diff_out = Command::new("git")
        .args(["diff", "HEAD"])
        .current_dir(path)
        .output()
        .await
        .map_err(|e| WorkspaceError::Git(e.to_string()))?;
    let (diff, truncated) = truncate(&String::from_utf8_lossy(&diff_out.stdout), diff_limit);

    Ok(ChangeSummary { changed_paths, total_bytes, diff, truncated })
}

/// Changed paths from a file-by-file comparison against the source tree
async fn tree_summary(
    path: &Path,
    source: &Path,
    excluded: &[String],
    diff_limit: usize,
) -> Result<ChangeSummary, WorkspaceError> {
    let changed_paths = changed_paths_between(source, path, excluded)?;
    let total_bytes = changed_paths
        .iter()
        .filter_map(|p| fs::metadata(path.join(p)).ok())
        .map(|m| m.len())
        .sum();

    // git diff --no-index produces a patch for arbitrary trees; exit code 1
    // just means "differences found".
    let diff_out = Command::new("git")
        .args(["diff", "--no-index", "--"])
        .arg(source)
        .arg(path)
        .output()
        .await;
    let (diff, truncated) = match diff_out {
        Ok(out) => truncate(&String::from_utf8_lossy(&out.stdout), diff_limit),
        Err(_) => (String::new(), false),
    };

    Ok(ChangeSummary { changed_paths, total_bytes, diff, truncated })
}

/// Relative paths whose content in `newer` differs from `older`, plus paths
/// only present in `newer`. Paths deleted from `newer` are not reported; the
/// overwrite-wins apply policy never deletes.
pub fn changed_paths_between(
    older: &Path,
    newer: &Path,
    excluded: &[String],
) -> Result<Vec<String>, WorkspaceError> {
    let old_files = collect_files(older, excluded)?;
    let new_files = collect_files(newer, excluded)?;

    let mut changed = Vec::new();
    for (rel, size) in &new_files {
        match old_files.get(rel) {
            None => changed.push(rel.clone()),
            Some(old_size) if old_size != size => changed.push(rel.clone()),
            Some(_) => {
                // Same size; compare bytes
                let old_bytes = fs::read(older.join(rel))?;
                let new_bytes = fs::read(newer.join(rel))?;
                if old_bytes != new_bytes {
                    changed.push(rel.clone());
                }
            }
        }
    }
    changed.sort();
    Ok(changed)
}

/// Relative path → size for every regular file under `root`, skipping
/// excluded directories and `.git`
fn collect_files(root: &Path, excluded: &[String]) -> Result<BTreeMap<String, u64>, WorkspaceError> {
    let mut files = BTreeMap::new();
    for entry in WalkDir::new(root).into_iter().filter_entry(|e| {
        if e.depth() == 0 || !e.file_type().is_dir() {
            return true;
        }
        let name = e.file_name().to_string_lossy();
        name != ".git" && !excluded.iter().any(|ex| ex == &*name)
    }) {
        let entry = entry.map_err(|e| WorkspaceError::CreateFailed(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| WorkspaceError::CreateFailed(e.to_string()))?
            .to_string_lossy()
            .into_owned();
        files.insert(rel, entry.metadata().map(|m| m.len()).unwrap_or(0));
    }
    Ok(files)
}

fn truncate(text: &str, limit: usize) -> (String, bool) {
    if text.len() <= limit {
        return (text.to_string(), false);
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    (format!("{}...\n[diff truncated]", &text[..end]), true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Workspace;
    use crate::workspace::manager::{StrategyChoice, WorkspaceConfig, WorkspaceManager};
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
            .args(["add", "-A"])
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

    #[tokio::test]
    async fn test_copy_workspace_changes() {
        let repo = tempdir().unwrap();
        fs::write(repo.path().join("a.txt"), "one").unwrap();
        fs::write(repo.path().join("b.txt"), "two").unwrap();

        let work = tempdir().unwrap();
        let mgr = WorkspaceManager::new(
            WorkspaceConfig { strategy: StrategyChoice::Copy, ..Default::default() },
            work.path(),
        );
        let ws = mgr.provision(repo.path(), "c1").await.unwrap();

        // Unchanged copy reports nothing
        let summary = snapshot_changes(&ws, &[], 4096).await.unwrap();
        assert!(summary.changed_paths.is_empty());

        // Modify one file, add another
        fs::write(ws.path.join("a.txt"), "changed").unwrap();
        fs::write(ws.path.join("new.txt"), "created").unwrap();
        let summary = snapshot_changes(&ws, &[], 4096).await.unwrap();
        assert_eq!(summary.changed_paths, vec!["a.txt", "new.txt"]);
        assert!(summary.total_bytes > 0);
    }

    #[tokio::test]
    async fn test_same_size_different_content_detected() {
        let older = tempdir().unwrap();
        let newer = tempdir().unwrap();
        fs::write(older.path().join("f.txt"), "aaaa").unwrap();
        fs::write(newer.path().join("f.txt"), "bbbb").unwrap();

        let changed = changed_paths_between(older.path(), newer.path(), &[]).unwrap();
        assert_eq!(changed, vec!["f.txt"]);
    }

    #[tokio::test]
    async fn test_deleted_paths_not_reported() {
        let older = tempdir().unwrap();
        let newer = tempdir().unwrap();
        fs::write(older.path().join("gone.txt"), "x").unwrap();

        let changed = changed_paths_between(older.path(), newer.path(), &[]).unwrap();
        assert!(changed.is_empty());
    }

    #[tokio::test]
    async fn test_worktree_changes_via_git() {
        let repo = tempdir().unwrap();
        fs::write(repo.path().join("tracked.txt"), "v1").unwrap();
        setup_git_repo(repo.path()).await;

        let work = tempdir().unwrap();
        let mgr = WorkspaceManager::new(
            WorkspaceConfig { strategy: StrategyChoice::Worktree, ..Default::default() },
            work.path(),
        );
        let ws = mgr.provision(repo.path(), "c1").await.unwrap();

        fs::write(ws.path.join("tracked.txt"), "v2").unwrap();
        let summary = snapshot_changes(&ws, &[], 4096).await.unwrap();
        assert_eq!(summary.changed_paths, vec!["tracked.txt"]);
        assert!(summary.diff.contains("tracked.txt"));
    }

    #[tokio::test]
    async fn test_in_place_without_git_is_empty() {
        let repo = tempdir().unwrap();
        fs::write(repo.path().join("f.txt"), "x").unwrap();
        let ws = Workspace::in_place(repo.path());

        let summary = snapshot_changes(&ws, &[], 4096).await.unwrap();
        assert!(summary.changed_paths.is_empty());
        assert!(summary.diff.is_empty());
    }

    #[test]
    fn test_truncate_marks() {
        let (text, truncated) = truncate("short", 100);
        assert_eq!(text, "short");
        assert!(!truncated);

        let (text, truncated) = truncate(&"x".repeat(200), 50);
        assert!(truncated);
        assert!(text.ends_with("[diff truncated]"));
    }
}
