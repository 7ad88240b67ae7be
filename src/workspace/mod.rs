//! Workspace management
//!
//! Provisioning, change snapshots, merge-back, and disposal of the working
//! trees candidates run in.

pub mod manager;
pub mod merge;
pub mod snapshot;

pub use manager::{
    DirtyTargetPolicy, DisposePolicy, StrategyChoice, WorkspaceConfig, WorkspaceError,
    WorkspaceManager, has_commit,
};
pub use merge::{AppliedChanges, apply_changes, commit_pending};
pub use snapshot::{changed_paths_between, snapshot_changes};
