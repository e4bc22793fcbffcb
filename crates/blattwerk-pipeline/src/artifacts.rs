// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Per-run artifact layout and mirrored status documents.
//
// Every run owns `<output_dir>/runs/<run_id>/` containing the normalized
// images, per-page sidecars, and three machine-readable status documents
// (index record, manifest, report) that external consumers poll
// independently. Status changes rewrite all three, so a consumer reading any
// one of them sees the current state.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use blattwerk_core::error::{BlattwerkError, Result};
use blattwerk_core::types::{RunId, RunStatus};

/// Resolved filesystem layout for one run.
#[derive(Debug, Clone)]
pub struct RunPaths {
    root: PathBuf,
}

impl RunPaths {
    pub fn new(output_dir: impl AsRef<Path>, run_id: RunId) -> Self {
        Self {
            root: output_dir.as_ref().join("runs").join(run_id.to_string()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    pub fn report_path(&self) -> PathBuf {
        self.root.join("report.json")
    }

    pub fn review_queue_path(&self) -> PathBuf {
        self.root.join("review-queue.json")
    }

    pub fn normalized_dir(&self) -> PathBuf {
        self.root.join("normalized")
    }

    pub fn sidecars_dir(&self) -> PathBuf {
        self.root.join("sidecars")
    }

    pub fn previews_dir(&self) -> PathBuf {
        self.root.join("previews")
    }

    /// Create the run directory tree.
    pub async fn create_layout(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.normalized_dir(),
            self.sidecars_dir(),
            self.previews_dir(),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        debug!(root = %self.root.display(), "run layout created");
        Ok(())
    }

    /// Delete the whole run directory.
    pub async fn remove(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(BlattwerkError::Io(err)),
        }
    }
}

/// Export manifest: what the run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunManifest {
    pub run_id: RunId,
    pub status: RunStatus,
    pub exported_at: DateTime<Utc>,
    pub count: usize,
    #[serde(default)]
    pub pages: Vec<String>,
}

/// Run report: lifecycle state for dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: RunId,
    pub project_id: String,
    pub status: RunStatus,
    pub updated_at: DateTime<Utc>,
}

/// One page flagged for human review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewEntry {
    pub page_id: String,
    pub reasons: Vec<String>,
}

/// The persisted review queue document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewQueue {
    pub run_id: RunId,
    #[serde(default)]
    pub entries: Vec<ReviewEntry>,
}

/// Write a JSON document atomically (temp file + rename).
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Rewrite manifest and report for a status change, preserving the page list
/// from an existing manifest. An unreadable manifest is replaced by a fresh
/// one rather than blocking the status change.
pub async fn mirror_status(
    paths: &RunPaths,
    run_id: RunId,
    project_id: &str,
    status: RunStatus,
) -> Result<()> {
    let now = Utc::now();
    let pages = match tokio::fs::read(paths.manifest_path()).await {
        Ok(bytes) => match serde_json::from_slice::<RunManifest>(&bytes) {
            Ok(existing) => existing.pages,
            Err(err) => {
                warn!(run_id = %run_id, "manifest unparsable, rewriting fresh: {err}");
                Vec::new()
            }
        },
        Err(_) => Vec::new(),
    };

    let manifest = RunManifest {
        run_id,
        status,
        exported_at: now,
        count: pages.len(),
        pages,
    };
    write_json_atomic(&paths.manifest_path(), &manifest).await?;

    let report = RunReport {
        run_id,
        project_id: project_id.into(),
        status,
        updated_at: now,
    };
    write_json_atomic(&paths.report_path(), &report).await
}

/// Replace the manifest with the final page list for a finished run.
pub async fn write_manifest(
    paths: &RunPaths,
    run_id: RunId,
    status: RunStatus,
    pages: Vec<String>,
) -> Result<()> {
    let manifest = RunManifest {
        run_id,
        status,
        exported_at: Utc::now(),
        count: pages.len(),
        pages,
    };
    write_json_atomic(&paths.manifest_path(), &manifest).await
}

/// Persist the review queue.
pub async fn write_review_queue(
    paths: &RunPaths,
    run_id: RunId,
    entries: &[ReviewEntry],
) -> Result<()> {
    let queue = ReviewQueue {
        run_id,
        entries: entries.to_vec(),
    };
    write_json_atomic(&paths.review_queue_path(), &queue).await
}
