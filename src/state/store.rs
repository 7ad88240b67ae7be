//! StateStore - the run's persistent shadow
//!
//! Two artifacts per run under `<runs_dir>/<run_id>/`: `state.json`, the full
//! snapshot, rewritten atomically (temp file, fsync, rename); and
//! `history.log`, an append-only JSON-lines event log. Every mutation goes
//! through [`StateStore::mutate`] so the two advance together under one
//! mutex and readers never observe a torn snapshot.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::Run;

use super::event::{HistoryEntry, RunEvent};

/// Errors from the state store; fatal for the run
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Run directory not writable: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("No run found under {0}")]
    RunNotFound(PathBuf),
}

struct Inner {
    run: Run,
    history: File,
}

/// Persistent shadow of one run
pub struct StateStore {
    run_dir: PathBuf,
    inner: Mutex<Inner>,
}

impl StateStore {
    /// Create the run directory layout and persist the initial snapshot
    pub fn create(runs_dir: &Path, run: Run) -> Result<Self, StorageError> {
        let run_dir = runs_dir.join(&run.id);
        debug!(run_dir = %run_dir.display(), "StateStore::create: called");

        fs::create_dir_all(run_dir.join("prompts"))?;
        fs::create_dir_all(run_dir.join("agents"))?;

        let history = OpenOptions::new()
            .create(true)
            .append(true)
            .open(run_dir.join("history.log"))?;

        let store = Self {
            run_dir,
            inner: Mutex::new(Inner { run, history }),
        };
        info!(run_dir = %store.run_dir.display(), "Run directory initialized");
        Ok(store)
    }

    /// Load an existing run snapshot for resume
    pub fn load(runs_dir: &Path, run_id: &str) -> Result<Self, StorageError> {
        let run_dir = runs_dir.join(run_id);
        debug!(run_dir = %run_dir.display(), "StateStore::load: called");

        let run = read_snapshot(&run_dir.join("state.json"))
            .map_err(|_| StorageError::RunNotFound(run_dir.clone()))?;

        fs::create_dir_all(run_dir.join("prompts"))?;
        fs::create_dir_all(run_dir.join("agents"))?;

        let history = OpenOptions::new()
            .create(true)
            .append(true)
            .open(run_dir.join("history.log"))?;

        info!(run_id = %run.id, status = %run.status, "Loaded run snapshot");
        Ok(Self {
            run_dir,
            inner: Mutex::new(Inner { run, history }),
        })
    }

    /// The mutation funnel: apply `f` to the run, append the event to the
    /// history log, and rewrite the snapshot, all under one lock.
    pub async fn mutate<T>(
        &self,
        event: RunEvent,
        f: impl FnOnce(&mut Run) -> T,
    ) -> Result<T, StorageError> {
        let mut inner = self.inner.lock().await;
        let out = f(&mut inner.run);
        inner.run.updated_at = crate::domain::now_ms();

        let entry = HistoryEntry::new(event);
        let line = serde_json::to_string(&entry)?;
        writeln!(inner.history, "{}", line)?;
        inner.history.flush()?;

        write_snapshot_atomic(&self.run_dir, &inner.run)?;
        debug!(event = ?entry.event, "StateStore::mutate: snapshot advanced");
        Ok(out)
    }

    /// Clone of the current in-memory run
    pub async fn snapshot(&self) -> Run {
        self.inner.lock().await.run.clone()
    }

    /// Run a read-only closure against the current run
    pub async fn with_run<T>(&self, f: impl FnOnce(&Run) -> T) -> T {
        f(&self.inner.lock().await.run)
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn prompts_dir(&self) -> PathBuf {
        self.run_dir.join("prompts")
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.run_dir.join("agents")
    }
}

/// Write `state.json` via sibling temp file + fsync + rename
fn write_snapshot_atomic(run_dir: &Path, run: &Run) -> Result<(), StorageError> {
    let tmp_path = run_dir.join("state.json.tmp");
    let final_path = run_dir.join("state.json");

    let json = serde_json::to_vec_pretty(run)?;
    let mut tmp = File::create(&tmp_path)?;
    tmp.write_all(&json)?;
    tmp.sync_all()?;
    drop(tmp);

    fs::rename(&tmp_path, &final_path)?;
    Ok(())
}

/// Read a snapshot file directly (resume, tests, external readers)
pub fn read_snapshot(path: &Path) -> Result<Run, StorageError> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Read and parse the history log, skipping unparseable lines
pub fn read_history(run_dir: &Path) -> Result<Vec<HistoryEntry>, StorageError> {
    let path = run_dir.join("history.log");
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(&path)?;
    let mut entries = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<HistoryEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(line, error = %e, "read_history: skipping unparseable line"),
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RunStatus, now_ms};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_create_writes_layout() {
        let temp = tempdir().unwrap();
        let run = Run::new("/tmp/repo", "fix bug");
        let run_id = run.id.clone();
        let store = StateStore::create(temp.path(), run).unwrap();

        // mutate once so state.json exists
        store
            .mutate(
                RunEvent::RunCreated { run_id: run_id.clone(), task: "fix bug".into() },
                |_| {},
            )
            .await
            .unwrap();

        let run_dir = temp.path().join(&run_id);
        assert!(run_dir.join("state.json").exists());
        assert!(run_dir.join("history.log").exists());
        assert!(run_dir.join("prompts").is_dir());
        assert!(run_dir.join("agents").is_dir());
    }

    #[tokio::test]
    async fn test_mutate_advances_both_artifacts() {
        let temp = tempdir().unwrap();
        let run = Run::new("/tmp/repo", "task");
        let run_id = run.id.clone();
        let store = StateStore::create(temp.path(), run).unwrap();

        store
            .mutate(RunEvent::RunStatusChanged { status: "running".into() }, |run| {
                run.set_status(RunStatus::Running)
            })
            .await
            .unwrap();
        store
            .mutate(RunEvent::IterationStarted { index: 0 }, |run| {
                run.push_iteration();
            })
            .await
            .unwrap();

        // Snapshot parses and reflects both mutations
        let on_disk = read_snapshot(&temp.path().join(&run_id).join("state.json")).unwrap();
        assert_eq!(on_disk.status, RunStatus::Running);
        assert_eq!(on_disk.iterations.len(), 1);

        // History has one line per mutation
        let history = read_history(&temp.path().join(&run_id)).unwrap();
        assert_eq!(history.len(), 2);
        assert!(matches!(history[1].event, RunEvent::IterationStarted { index: 0 }));
    }

    #[tokio::test]
    async fn test_load_roundtrips_run() {
        let temp = tempdir().unwrap();
        let run = Run::new("/tmp/repo", "task");
        let run_id = run.id.clone();

        {
            let store = StateStore::create(temp.path(), run).unwrap();
            store
                .mutate(RunEvent::RunStatusChanged { status: "running".into() }, |run| {
                    run.set_status(RunStatus::Running)
                })
                .await
                .unwrap();
        }

        let store = StateStore::load(temp.path(), &run_id).unwrap();
        let run = store.snapshot().await;
        assert_eq!(run.id, run_id);
        assert_eq!(run.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn test_load_missing_run() {
        let temp = tempdir().unwrap();
        let result = StateStore::load(temp.path(), "nonexistent");
        assert!(matches!(result, Err(StorageError::RunNotFound(_))));
    }

    #[tokio::test]
    async fn test_snapshot_never_torn() {
        // After every mutation the on-disk snapshot parses; no partial writes
        let temp = tempdir().unwrap();
        let run = Run::new("/tmp/repo", "task");
        let run_id = run.id.clone();
        let store = StateStore::create(temp.path(), run).unwrap();
        let state_path = temp.path().join(&run_id).join("state.json");

        for i in 0..10 {
            store
                .mutate(RunEvent::IterationStarted { index: i }, |run| {
                    run.push_iteration();
                })
                .await
                .unwrap();
            let parsed = read_snapshot(&state_path).unwrap();
            assert_eq!(parsed.iterations.len(), (i + 1) as usize);
        }
    }

    #[test]
    fn test_read_history_skips_garbage() {
        let temp = tempdir().unwrap();
        let entry = HistoryEntry { ts: now_ms(), event: RunEvent::PromptResolved { prompt_id: "p-1".into() } };
        let good = serde_json::to_string(&entry).unwrap();
        fs::write(
            temp.path().join("history.log"),
            format!("{}\nnot json\n\n{}\n", good, good),
        )
        .unwrap();

        let entries = read_history(temp.path()).unwrap();
        assert_eq!(entries.len(), 2);
    }
}
