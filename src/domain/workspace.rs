//! Workspace handle
//!
//! A materialized working tree: the source repository itself, a full copy,
//! or a git worktree on a dedicated branch. The handle is a plain record;
//! provisioning and disposal live in the workspace manager.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::now_ms;

/// How a workspace is materialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStrategy {
    /// Operate directly on the source tree
    InPlace,
    /// Full recursive copy of the source tree
    Copy,
    /// Git worktree on a dedicated branch
    Worktree,
}

impl std::fmt::Display for WorkspaceStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InPlace => write!(f, "in_place"),
            Self::Copy => write!(f, "copy"),
            Self::Worktree => write!(f, "worktree"),
        }
    }
}

/// A materialized working tree, owned by exactly one candidate or one
/// iteration baseline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    /// Materialization strategy
    pub strategy: WorkspaceStrategy,

    /// Path to the working tree
    pub path: PathBuf,

    /// Tree this workspace was materialized from
    pub source: PathBuf,

    /// Branch name (worktree strategy only)
    pub branch: Option<String>,

    /// Whether the workspace has been written to
    pub dirty: bool,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,
}

impl Workspace {
    /// Handle to the source tree itself
    pub fn in_place(source: impl Into<PathBuf>) -> Self {
        let source = source.into();
        Self {
            strategy: WorkspaceStrategy::InPlace,
            path: source.clone(),
            source,
            branch: None,
            dirty: false,
            created_at: now_ms(),
        }
    }

    pub fn is_in_place(&self) -> bool {
        self.strategy == WorkspaceStrategy::InPlace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_place_points_at_source() {
        let ws = Workspace::in_place("/tmp/repo");
        assert!(ws.is_in_place());
        assert_eq!(ws.path, ws.source);
        assert!(ws.branch.is_none());
    }

    #[test]
    fn test_strategy_serde() {
        let json = serde_json::to_string(&WorkspaceStrategy::Worktree).unwrap();
        assert_eq!(json, "\"worktree\"");
        let back: WorkspaceStrategy = serde_json::from_str("\"in_place\"").unwrap();
        assert_eq!(back, WorkspaceStrategy::InPlace);
    }
}
