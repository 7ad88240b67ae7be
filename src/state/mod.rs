//! Run persistence
//!
//! The snapshot/history pair that shadows every run, plus resume
//! classification over a loaded snapshot.

pub mod event;
pub mod resume;
pub mod store;

pub use event::{HistoryEntry, RunEvent};
pub use resume::{ResumeStage, classify};
pub use store::{StateStore, StorageError, read_history, read_snapshot};
