// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Persistent run index at `<output_dir>/run-index.json`.
//
// The whole document is rewritten on every change (the index holds dozens of
// small records, not thousands), and writes go through a temp file + rename so
// readers never observe a torn document. Mutations are serialized through a
// process-wide per-path mutex chain, so two stores opened on the same file
// cannot interleave their read-modify-write cycles; a failed write is logged
// and does not poison subsequent updates.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use blattwerk_core::error::{BlattwerkError, Result};
use blattwerk_core::types::{RunId, RunIndexEntry, RunIndexPatch, RunStatus};

const INDEX_FILE_NAME: &str = "run-index.json";

/// Write lock per index path, keyed by the path as given (stores for the
/// same output dir use the same path spelling).
fn lock_for(path: &Path) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<std::sync::Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    let locks = LOCKS.get_or_init(|| std::sync::Mutex::new(HashMap::new()));
    let mut locks = locks.lock().expect("index lock map poisoned");
    Arc::clone(locks.entry(path.to_path_buf()).or_default())
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RunIndexDocument {
    #[serde(default)]
    runs: Vec<RunIndexEntry>,
}

/// Serialized-write JSON store for run records.
#[derive(Clone)]
pub struct RunIndexStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl RunIndexStore {
    pub fn new(output_dir: impl AsRef<Path>) -> Self {
        let path = output_dir.as_ref().join(INDEX_FILE_NAME);
        let write_lock = lock_for(&path);
        Self { path, write_lock }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all run records, newest first. Any read or parse failure yields
    /// an empty list so a damaged index never blocks new runs.
    pub async fn read(&self) -> Vec<RunIndexEntry> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => match serde_json::from_slice::<RunIndexDocument>(&bytes) {
                Ok(doc) => doc.runs,
                Err(err) => {
                    warn!(path = %self.path.display(), "run index unparsable, treating as empty: {err}");
                    Vec::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                warn!(path = %self.path.display(), "run index unreadable, treating as empty: {err}");
                Vec::new()
            }
        }
    }

    /// Look up a single run record.
    pub async fn get(&self, run_id: RunId) -> Option<RunIndexEntry> {
        self.read().await.into_iter().find(|e| e.run_id == run_id)
    }

    /// Apply a merge-patch to an existing record, or prepend a fresh record
    /// when the run is not in the index yet.
    #[instrument(skip(self, patch), fields(run_id = %run_id))]
    pub async fn update(&self, run_id: RunId, patch: RunIndexPatch) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut runs = self.read().await;
        match runs.iter_mut().find(|e| e.run_id == run_id) {
            Some(entry) => entry.apply(&patch),
            None => {
                let project_id = patch.project_id.clone().unwrap_or_default();
                let mut entry = RunIndexEntry::new(run_id, project_id);
                entry.apply(&patch);
                runs.insert(0, entry);
            }
        }
        self.write(&runs).await
    }

    /// Set a run's status only when the move is legal per the run state
    /// machine (re-asserting the current status is allowed). Returns whether
    /// the status was written; an illegal move is logged and skipped so a
    /// late control request can never regress a terminal record.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn update_status_guarded(&self, run_id: RunId, status: RunStatus) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let mut runs = self.read().await;
        match runs.iter_mut().find(|e| e.run_id == run_id) {
            Some(entry) => {
                if entry.status != status && !entry.status.can_transition_to(status) {
                    warn!(current = ?entry.status, "illegal status transition skipped");
                    return Ok(false);
                }
                entry.apply(&RunIndexPatch::status(status));
            }
            None => {
                let mut entry = RunIndexEntry::new(run_id, String::new());
                if entry.status != status && !entry.status.can_transition_to(status) {
                    warn!("status for unknown run is unreachable from queued, skipped");
                    return Ok(false);
                }
                entry.apply(&RunIndexPatch::status(status));
                runs.insert(0, entry);
            }
        }
        self.write(&runs).await?;
        Ok(true)
    }

    /// Remove a run record. Removing an absent run is a no-op.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn remove(&self, run_id: RunId) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut runs = self.read().await;
        let before = runs.len();
        runs.retain(|e| e.run_id != run_id);
        if runs.len() == before {
            debug!("run not present in index");
            return Ok(());
        }
        self.write(&runs).await
    }

    /// Drop every record.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write(&Vec::new()).await
    }

    async fn write(&self, runs: &Vec<RunIndexEntry>) -> Result<()> {
        let doc = RunIndexDocument { runs: runs.clone() };
        let bytes = serde_json::to_vec_pretty(&doc)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(BlattwerkError::Io)?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(BlattwerkError::Io)?;
        debug!(path = %self.path.display(), runs = runs.len(), "run index written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blattwerk_core::types::RunStatus;
    use tempfile::TempDir;

    fn queued_patch(project_id: &str) -> RunIndexPatch {
        RunIndexPatch {
            project_id: Some(project_id.into()),
            status: Some(RunStatus::Queued),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn update_prepends_unknown_runs() {
        let tmp = TempDir::new().expect("tempdir");
        let store = RunIndexStore::new(tmp.path());
        let first = RunId::new();
        let second = RunId::new();

        store.update(first, queued_patch("p")).await.expect("first");
        store.update(second, queued_patch("p")).await.expect("second");

        let runs = store.read().await;
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, second);
        assert_eq!(runs[1].run_id, first);
    }

    #[tokio::test]
    async fn update_merges_into_existing_record() {
        let tmp = TempDir::new().expect("tempdir");
        let store = RunIndexStore::new(tmp.path());
        let run_id = RunId::new();

        store.update(run_id, queued_patch("p")).await.expect("create");
        store
            .update(
                run_id,
                RunIndexPatch {
                    status: Some(RunStatus::Running),
                    inferred_dpi: Some(300.0),
                    ..Default::default()
                },
            )
            .await
            .expect("patch");

        let runs = store.read().await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Running);
        assert_eq!(runs[0].project_id, "p");
        assert_eq!(runs[0].inferred_dpi, Some(300.0));
    }

    #[tokio::test]
    async fn concurrent_updates_for_different_runs_both_persist() {
        let tmp = TempDir::new().expect("tempdir");
        let store = RunIndexStore::new(tmp.path());
        let a = RunId::new();
        let b = RunId::new();

        let (ra, rb) = tokio::join!(
            store.update(a, queued_patch("p")),
            store.update(b, queued_patch("p")),
        );
        ra.expect("update a");
        rb.expect("update b");

        let runs = store.read().await;
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().any(|e| e.run_id == a));
        assert!(runs.iter().any(|e| e.run_id == b));
    }

    #[tokio::test]
    async fn damaged_index_reads_as_empty_and_recovers() {
        let tmp = TempDir::new().expect("tempdir");
        let store = RunIndexStore::new(tmp.path());
        tokio::fs::write(store.path(), b"{ not json").await.expect("damage");

        assert!(store.read().await.is_empty());

        let run_id = RunId::new();
        store.update(run_id, queued_patch("p")).await.expect("recover");
        assert_eq!(store.read().await.len(), 1);
    }

    #[tokio::test]
    async fn guarded_update_never_regresses_a_terminal_status() {
        let tmp = TempDir::new().expect("tempdir");
        let store = RunIndexStore::new(tmp.path());
        let run_id = RunId::new();
        store.update(run_id, queued_patch("p")).await.expect("create");

        assert!(store
            .update_status_guarded(run_id, RunStatus::Running)
            .await
            .expect("queued to running"));
        assert!(store
            .update_status_guarded(run_id, RunStatus::Success)
            .await
            .expect("running to success"));

        // A late pause must not overwrite the terminal record.
        assert!(!store
            .update_status_guarded(run_id, RunStatus::Paused)
            .await
            .expect("guarded call itself succeeds"));
        let entry = store.get(run_id).await.expect("entry");
        assert_eq!(entry.status, RunStatus::Success);
    }

    #[tokio::test]
    async fn guarded_update_rejects_moves_the_machine_forbids() {
        let tmp = TempDir::new().expect("tempdir");
        let store = RunIndexStore::new(tmp.path());
        let run_id = RunId::new();
        store.update(run_id, queued_patch("p")).await.expect("create");

        // Queued pages cannot pause; only running ones can.
        assert!(!store
            .update_status_guarded(run_id, RunStatus::Paused)
            .await
            .expect("guarded call itself succeeds"));
        assert_eq!(
            store.get(run_id).await.expect("entry").status,
            RunStatus::Queued
        );
    }

    #[tokio::test]
    async fn two_stores_on_one_path_serialize_their_writes() {
        let tmp = TempDir::new().expect("tempdir");
        let first_store = RunIndexStore::new(tmp.path());
        let second_store = RunIndexStore::new(tmp.path());
        let a = RunId::new();
        let b = RunId::new();

        let (ra, rb) = tokio::join!(
            first_store.update(a, queued_patch("p")),
            second_store.update(b, queued_patch("p")),
        );
        ra.expect("update via first store");
        rb.expect("update via second store");

        let runs = first_store.read().await;
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().any(|e| e.run_id == a));
        assert!(runs.iter().any(|e| e.run_id == b));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let tmp = TempDir::new().expect("tempdir");
        let store = RunIndexStore::new(tmp.path());
        let run_id = RunId::new();
        store.update(run_id, queued_patch("p")).await.expect("create");

        store.remove(run_id).await.expect("remove");
        store.remove(run_id).await.expect("remove again");
        assert!(store.read().await.is_empty());
    }
}
