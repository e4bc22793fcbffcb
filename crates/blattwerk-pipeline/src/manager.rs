// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Run lifecycle manager.
//
// At most one run is active at a time. Every status change is mirrored to
// three places (index record, manifest, report) so external consumers can
// poll whichever document is convenient. The manager is cheaply cloneable;
// all clones share the registry, index store, and progress broker.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use blattwerk_core::error::{BlattwerkError, Result, is_abort_error};
use blattwerk_core::settings::PipelineSettings;
use blattwerk_core::types::{
    RunConfig, RunId, RunIndexPatch, RunProgressEvent, RunStage, RunStatus,
};

use crate::artifacts::{RunPaths, mirror_status, write_manifest, write_review_queue};
use crate::index::RunIndexStore;
use crate::progress::ProgressBroker;
use crate::runner::{PauseGate, PipelineRunner, RunOutcome};
use crate::traits::{CorpusAnalyzer, CorpusScanner, PageNormalizer};

struct ActiveRun {
    run_id: RunId,
    project_id: String,
    total_pages: usize,
    pause: PauseGate,
    cancel: CancellationToken,
}

/// Snapshot of an active run's control handles.
struct RunControls {
    pause: PauseGate,
    cancel: CancellationToken,
    project_id: String,
    total_pages: usize,
}

/// Orchestrates run lifecycles over a pipeline runner.
pub struct RunManager<S, A, N> {
    runner: Arc<PipelineRunner<S, A, N>>,
    index: RunIndexStore,
    progress: ProgressBroker,
    output_dir: PathBuf,
    active: Arc<Mutex<Option<ActiveRun>>>,
    handles: Arc<tokio::sync::Mutex<HashMap<RunId, JoinHandle<()>>>>,
}

impl<S, A, N> Clone for RunManager<S, A, N> {
    fn clone(&self) -> Self {
        Self {
            runner: Arc::clone(&self.runner),
            index: self.index.clone(),
            progress: self.progress.clone(),
            output_dir: self.output_dir.clone(),
            active: Arc::clone(&self.active),
            handles: Arc::clone(&self.handles),
        }
    }
}

impl<S, A, N> RunManager<S, A, N>
where
    S: CorpusScanner + 'static,
    A: CorpusAnalyzer + 'static,
    N: PageNormalizer + 'static,
{
    pub fn new(
        output_dir: impl AsRef<Path>,
        scanner: S,
        analyzer: A,
        normalizer: N,
        settings: PipelineSettings,
    ) -> Self {
        let progress = ProgressBroker::new(settings.progress_min_interval);
        Self {
            runner: Arc::new(PipelineRunner::new(
                scanner,
                analyzer,
                normalizer,
                settings,
                progress.clone(),
            )),
            index: RunIndexStore::new(output_dir.as_ref()),
            progress,
            output_dir: output_dir.as_ref().to_path_buf(),
            active: Arc::new(Mutex::new(None)),
            handles: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    /// Progress fan-out point; subscribe before starting runs.
    pub fn progress(&self) -> &ProgressBroker {
        &self.progress
    }

    /// Persistent run index.
    pub fn index(&self) -> &RunIndexStore {
        &self.index
    }

    pub fn active_run_id(&self) -> Option<RunId> {
        self.active
            .lock()
            .expect("active lock poisoned")
            .as_ref()
            .map(|a| a.run_id)
    }

    /// Queue and launch a run over the given project root. Fails with
    /// `RunActive` while another run is still in flight.
    #[instrument(skip_all, fields(project_id = %config.project_id))]
    pub async fn start_run(
        &self,
        config: RunConfig,
        project_root: impl AsRef<Path>,
    ) -> Result<RunId> {
        let run_id = RunId::new();
        let project_root = project_root.as_ref().to_path_buf();
        let pause = PauseGate::new();
        let cancel = CancellationToken::new();

        // Check-and-claim under the lock so two concurrent starts cannot
        // both pass the gate.
        {
            let mut guard = self.active.lock().expect("active lock poisoned");
            if let Some(active) = guard.as_ref() {
                return Err(BlattwerkError::RunActive(active.run_id));
            }
            *guard = Some(ActiveRun {
                run_id,
                project_id: config.project_id.clone(),
                total_pages: config.pages.len(),
                pause: pause.clone(),
                cancel: cancel.clone(),
            });
        }

        let paths = RunPaths::new(&self.output_dir, run_id);
        let queued = async {
            paths.create_layout().await?;
            self.index
                .update(
                    run_id,
                    RunIndexPatch {
                        project_id: Some(config.project_id.clone()),
                        status: Some(RunStatus::Queued),
                        ..Default::default()
                    },
                )
                .await?;
            mirror_status(&paths, run_id, &config.project_id, RunStatus::Queued).await
        };
        if let Err(err) = queued.await {
            // Release the claim so the failed start does not wedge the manager.
            self.clear_active(run_id);
            return Err(err);
        }

        let mut handles = self.handles.lock().await;
        handles.retain(|_, handle| !handle.is_finished());

        let mgr = self.clone();
        let handle = tokio::spawn(async move {
            mgr.drive(run_id, config, project_root, paths, pause, cancel)
                .await;
        });
        handles.insert(run_id, handle);

        info!(run_id = %run_id, "run started");
        Ok(run_id)
    }

    async fn drive(
        &self,
        run_id: RunId,
        config: RunConfig,
        project_root: PathBuf,
        paths: RunPaths,
        pause: PauseGate,
        cancel: CancellationToken,
    ) {
        let project_id = config.project_id.clone();
        self.persist_status(run_id, &paths, &project_id, RunStatus::Running)
            .await;

        let result = self
            .runner
            .run(run_id, &config, &project_root, paths.root(), &pause, &cancel)
            .await;

        let (status, processed) = match &result {
            Ok(outcome) => {
                self.export_outcome(run_id, &paths, outcome).await;
                (RunStatus::Success, outcome.pages.len())
            }
            Err(err) if is_abort_error(err) => {
                info!(run_id = %run_id, "run cancelled");
                (RunStatus::Cancelled, 0)
            }
            Err(err) => {
                error!(run_id = %run_id, "run failed: {err}");
                (RunStatus::Error, 0)
            }
        };

        let patch = match &result {
            Ok(outcome) => RunIndexPatch {
                status: Some(status),
                phase: Some(RunStage::Aggregate),
                review_count: Some(outcome.review.len() as u32),
                inferred_width_mm: outcome.inferred.width_mm,
                inferred_height_mm: outcome.inferred.height_mm,
                inferred_dpi: outcome.inferred.dpi,
                dims_confidence: outcome.inferred.dims_confidence,
                dpi_confidence: outcome.inferred.dpi_confidence,
                ..Default::default()
            },
            Err(_) => RunIndexPatch::status(status),
        };
        // Terminal writes bypass the state-machine guard: they record what
        // actually happened, even if a control request briefly moved the
        // record to a state the machine would not reach the terminal from.
        if let Err(err) = self.index.update(run_id, patch).await {
            warn!(run_id = %run_id, "terminal index update failed: {err}");
        }
        if let Err(err) = mirror_status(&paths, run_id, &project_id, status).await {
            warn!(run_id = %run_id, "terminal artifact mirror failed: {err}");
        }

        // Terminal event is forced so listeners always see the final state.
        self.progress.publish(
            &RunProgressEvent {
                run_id,
                project_id,
                stage: RunStage::Aggregate,
                processed,
                total: config.pages.len(),
                timestamp: Utc::now(),
                throughput: None,
                current_page: None,
                recent_pages: Vec::new(),
            },
            true,
        );
        self.progress.clear(run_id);
        self.clear_active(run_id);
    }

    async fn export_outcome(&self, run_id: RunId, paths: &RunPaths, outcome: &RunOutcome) {
        let pages: Vec<String> = outcome.pages.iter().map(|p| p.page_id.clone()).collect();
        if let Err(err) = write_manifest(paths, run_id, RunStatus::Success, pages).await {
            warn!(run_id = %run_id, "manifest export failed: {err}");
        }
        if let Err(err) = write_review_queue(paths, run_id, &outcome.review).await {
            warn!(run_id = %run_id, "review queue export failed: {err}");
        }
    }

    /// Persist a non-terminal status change through the state-machine guard.
    /// An illegal move (a control request racing a terminal write, say) skips
    /// the index and artifact writes alike.
    async fn persist_status(
        &self,
        run_id: RunId,
        paths: &RunPaths,
        project_id: &str,
        status: RunStatus,
    ) {
        let accepted = match self.index.update_status_guarded(run_id, status).await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(run_id = %run_id, ?status, "index status update failed: {err}");
                return;
            }
        };
        if !accepted {
            return;
        }
        if let Err(err) = mirror_status(paths, run_id, project_id, status).await {
            warn!(run_id = %run_id, ?status, "artifact mirror failed: {err}");
        }
    }

    /// Park the active run at its next stage or page boundary. Returns
    /// `false` when `run_id` is not the active run.
    pub async fn pause_run(&self, run_id: RunId) -> bool {
        let Some(controls) = self.active_controls(run_id) else {
            return false;
        };
        controls.pause.pause();
        let paths = RunPaths::new(&self.output_dir, run_id);
        self.persist_status(run_id, &paths, &controls.project_id, RunStatus::Paused)
            .await;
        self.publish_transition(run_id, &controls).await;
        true
    }

    /// Release a paused run.
    pub async fn resume_run(&self, run_id: RunId) -> bool {
        let Some(controls) = self.active_controls(run_id) else {
            return false;
        };
        controls.pause.resume();
        let paths = RunPaths::new(&self.output_dir, run_id);
        self.persist_status(run_id, &paths, &controls.project_id, RunStatus::Running)
            .await;
        self.publish_transition(run_id, &controls).await;
        true
    }

    /// Request cancellation. The run winds down at its next boundary; a
    /// paused run is released first so it can observe the request.
    pub async fn cancel_run(&self, run_id: RunId) -> bool {
        let Some(controls) = self.active_controls(run_id) else {
            return false;
        };
        let paths = RunPaths::new(&self.output_dir, run_id);
        self.persist_status(run_id, &paths, &controls.project_id, RunStatus::Cancelling)
            .await;
        controls.cancel.cancel();
        controls.pause.resume();
        self.publish_transition(run_id, &controls).await;
        true
    }

    /// Forced progress event for a lifecycle transition, so listeners see
    /// pause/resume/cancel immediately regardless of throttling.
    async fn publish_transition(&self, run_id: RunId, controls: &RunControls) {
        let stage = self
            .index
            .get(run_id)
            .await
            .and_then(|entry| entry.phase)
            .unwrap_or(RunStage::Scan);
        self.progress.publish(
            &RunProgressEvent {
                run_id,
                project_id: controls.project_id.clone(),
                stage,
                processed: 0,
                total: controls.total_pages,
                timestamp: Utc::now(),
                throughput: None,
                current_page: None,
                recent_pages: Vec::new(),
            },
            true,
        );
    }

    /// Cancel (if active), wait for the run task to finish, then delete the
    /// run directory and its index record.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn cancel_run_and_delete(&self, run_id: RunId) -> Result<()> {
        if self.cancel_run(run_id).await {
            self.wait_for_completion(run_id).await;
        }
        RunPaths::new(&self.output_dir, run_id).remove().await?;
        self.index.remove(run_id).await?;
        info!("run deleted");
        Ok(())
    }

    /// Wait for a launched run task to finish. Returns `false` when no task
    /// for `run_id` is held (already collected, or never started).
    pub async fn wait_for_completion(&self, run_id: RunId) -> bool {
        let handle = {
            let mut handles = self.handles.lock().await;
            handles.remove(&run_id)
        };
        match handle {
            Some(handle) => {
                if let Err(err) = handle.await {
                    warn!(run_id = %run_id, "run task join failed: {err}");
                }
                true
            }
            None => false,
        }
    }

    fn active_controls(&self, run_id: RunId) -> Option<RunControls> {
        let guard = self.active.lock().expect("active lock poisoned");
        guard
            .as_ref()
            .filter(|a| a.run_id == run_id)
            .map(|a| RunControls {
                pause: a.pause.clone(),
                cancel: a.cancel.clone(),
                project_id: a.project_id.clone(),
                total_pages: a.total_pages,
            })
    }

    fn clear_active(&self, run_id: RunId) {
        let mut guard = self.active.lock().expect("active lock poisoned");
        if guard.as_ref().is_some_and(|a| a.run_id == run_id) {
            *guard = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use tokio::sync::Semaphore;

    use blattwerk_core::error::Result;
    use blattwerk_core::types::{
        CorpusSummary, NormalizationResult, PageBoundsEstimate, PageSource, PixelBox,
    };
    use blattwerk_core::types::{Corrections, DpiSource, PageStats, ShadowReport};

    fn config(page_ids: &[&str]) -> RunConfig {
        RunConfig {
            project_id: "test".into(),
            pages: page_ids
                .iter()
                .map(|id| PageSource {
                    id: (*id).into(),
                    file_name: format!("{id}.png"),
                    source_path: format!("/virtual/{id}.png").into(),
                    metadata_dpi: None,
                    confidence: BTreeMap::new(),
                })
                .collect(),
            target_dpi: 300.0,
            target_width_mm: 210.0,
            target_height_mm: 297.0,
        }
    }

    /// Scanner that parks until the test releases a permit.
    struct GatedScanner {
        gate: Arc<Semaphore>,
    }

    impl CorpusScanner for GatedScanner {
        async fn scan(&self, _root: &Path, request: &RunConfig) -> Result<RunConfig> {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| BlattwerkError::Scan("gate closed".into()))?;
            Ok(request.clone())
        }
    }

    struct InstantScanner;

    impl CorpusScanner for InstantScanner {
        async fn scan(&self, _root: &Path, request: &RunConfig) -> Result<RunConfig> {
            Ok(request.clone())
        }
    }

    struct InstantAnalyzer;

    impl CorpusAnalyzer for InstantAnalyzer {
        async fn analyze(&self, config: &RunConfig, pages: &[PageSource]) -> Result<CorpusSummary> {
            let mut summary = CorpusSummary::fallback(config);
            summary.notes = None;
            summary.page_count = pages.len();
            Ok(summary)
        }
    }

    struct InstantNormalizer {
        delay: Duration,
    }

    impl PageNormalizer for InstantNormalizer {
        fn normalize(
            &self,
            page: &PageSource,
            _estimate: Option<&PageBoundsEstimate>,
            _summary: &CorpusSummary,
            _book_prior: Option<&PixelBox>,
            _run_dir: &Path,
            _settings: &PipelineSettings,
        ) -> Result<NormalizationResult> {
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            Ok(NormalizationResult {
                page_id: page.id.clone(),
                output_path: format!("/virtual/out/{}.png", page.id).into(),
                crop_box: PixelBox::new(0, 0, 2480, 3508),
                mask_box: PixelBox::new(10, 10, 2460, 3488),
                width_mm: 210.0,
                height_mm: 297.0,
                dpi: 300.0,
                dpi_source: DpiSource::Inferred,
                trim_mm: 2.0,
                bleed_mm: 1.0,
                skew_angle: 0.0,
                shadow: ShadowReport::absent(),
                stats: PageStats {
                    background_mean: 230.0,
                    background_std: 5.0,
                    mask_coverage: 0.9,
                    skew_confidence: 0.8,
                    shadow_score: 0.0,
                    illumination_residual: 0.01,
                    spine_shadow_score: 0.0,
                },
                corrections: Corrections::default(),
                dhash: "00ff00ff00ff00ff".into(),
            })
        }
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_a_run_is_active() {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let gate = Arc::new(Semaphore::new(0));
        let manager = RunManager::new(
            tmp.path(),
            GatedScanner { gate: Arc::clone(&gate) },
            InstantAnalyzer,
            InstantNormalizer { delay: Duration::ZERO },
            PipelineSettings::default(),
        );

        let first = manager
            .start_run(config(&["p1"]), tmp.path())
            .await
            .expect("first run");
        let second = manager.start_run(config(&["p1"]), tmp.path()).await;
        match second {
            Err(BlattwerkError::RunActive(id)) => assert_eq!(id, first),
            other => panic!("expected RunActive, got {other:?}"),
        }

        gate.add_permits(1);
        assert!(manager.wait_for_completion(first).await);
        assert!(manager.active_run_id().is_none());

        // The slot is free again.
        gate.add_permits(1);
        let third = manager
            .start_run(config(&["p1"]), tmp.path())
            .await
            .expect("third run");
        manager.wait_for_completion(third).await;
    }

    #[tokio::test]
    async fn successful_run_mirrors_terminal_state_everywhere() {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let manager = RunManager::new(
            tmp.path(),
            InstantScanner,
            InstantAnalyzer,
            InstantNormalizer { delay: Duration::ZERO },
            PipelineSettings::default(),
        );

        let run_id = manager
            .start_run(config(&["p1", "p2"]), tmp.path())
            .await
            .expect("start");
        assert!(manager.wait_for_completion(run_id).await);

        let entry = manager.index().get(run_id).await.expect("index entry");
        assert_eq!(entry.status, RunStatus::Success);
        assert_eq!(entry.review_count, 0);
        assert_eq!(entry.inferred_dpi, Some(300.0));

        let paths = RunPaths::new(tmp.path(), run_id);
        let manifest: crate::artifacts::RunManifest = serde_json::from_slice(
            &tokio::fs::read(paths.manifest_path()).await.expect("manifest"),
        )
        .expect("manifest parses");
        assert_eq!(manifest.status, RunStatus::Success);
        assert_eq!(manifest.count, 2);

        let report: crate::artifacts::RunReport =
            serde_json::from_slice(&tokio::fs::read(paths.report_path()).await.expect("report"))
                .expect("report parses");
        assert_eq!(report.status, RunStatus::Success);
        assert!(paths.review_queue_path().is_file());

        // A late control request cannot drag the record out of its terminal
        // state: the run is no longer active, and the persisted status holds.
        assert!(!manager.pause_run(run_id).await);
        let entry = manager.index().get(run_id).await.expect("index entry");
        assert_eq!(entry.status, RunStatus::Success);
    }

    #[tokio::test]
    async fn controls_return_false_for_unknown_runs() {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let manager = RunManager::new(
            tmp.path(),
            InstantScanner,
            InstantAnalyzer,
            InstantNormalizer { delay: Duration::ZERO },
            PipelineSettings::default(),
        );

        let unknown = RunId::new();
        assert!(!manager.pause_run(unknown).await);
        assert!(!manager.resume_run(unknown).await);
        assert!(!manager.cancel_run(unknown).await);
        assert!(!manager.wait_for_completion(unknown).await);
    }

    /// Poll the index until the run reports `Running`, so control requests in
    /// tests cannot race the run task's own startup write.
    async fn wait_until_running<S, A, N>(manager: &RunManager<S, A, N>, run_id: RunId)
    where
        S: CorpusScanner + 'static,
        A: CorpusAnalyzer + 'static,
        N: PageNormalizer + 'static,
    {
        for _ in 0..200 {
            if let Some(entry) = manager.index().get(run_id).await {
                if entry.status == RunStatus::Running {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("run never reached Running");
    }

    #[tokio::test]
    async fn pause_persists_and_parks_the_run() {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let gate = Arc::new(Semaphore::new(0));
        let manager = RunManager::new(
            tmp.path(),
            GatedScanner { gate: Arc::clone(&gate) },
            InstantAnalyzer,
            InstantNormalizer { delay: Duration::ZERO },
            PipelineSettings::default(),
        );

        let run_id = manager
            .start_run(config(&["p1", "p2", "p3"]), tmp.path())
            .await
            .expect("start");
        wait_until_running(&manager, run_id).await;

        // Parked in the scanner, so the pause is the only writer.
        assert!(manager.pause_run(run_id).await);
        let entry = manager.index().get(run_id).await.expect("index entry");
        assert_eq!(entry.status, RunStatus::Paused);

        assert!(manager.resume_run(run_id).await);
        let entry = manager.index().get(run_id).await.expect("index entry");
        assert_eq!(entry.status, RunStatus::Running);

        gate.add_permits(1);
        manager.wait_for_completion(run_id).await;
        let entry = manager.index().get(run_id).await.expect("index entry");
        assert_eq!(entry.status, RunStatus::Success);
    }

    #[tokio::test]
    async fn lifecycle_controls_publish_a_forced_event() {
        crate::testutil::init_tracing();
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let gate = Arc::new(Semaphore::new(0));
        let manager = RunManager::new(
            tmp.path(),
            GatedScanner { gate: Arc::clone(&gate) },
            InstantAnalyzer,
            InstantNormalizer { delay: Duration::ZERO },
            PipelineSettings::default(),
        );

        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        manager.progress().subscribe(move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        let run_id = manager
            .start_run(config(&["p1", "p2", "p3"]), tmp.path())
            .await
            .expect("start");
        wait_until_running(&manager, run_id).await;

        // Each control call must reach listeners even inside the throttle
        // window of the preceding event.
        let before = seen.load(std::sync::atomic::Ordering::SeqCst);
        assert!(manager.pause_run(run_id).await);
        let after_pause = seen.load(std::sync::atomic::Ordering::SeqCst);
        assert!(after_pause > before, "pause published no event");

        assert!(manager.resume_run(run_id).await);
        let after_resume = seen.load(std::sync::atomic::Ordering::SeqCst);
        assert!(after_resume > after_pause, "resume published no event");

        assert!(manager.cancel_run(run_id).await);
        let after_cancel = seen.load(std::sync::atomic::Ordering::SeqCst);
        assert!(after_cancel > after_resume, "cancel published no event");

        gate.add_permits(1);
        manager.wait_for_completion(run_id).await;
    }

    #[tokio::test]
    async fn cancel_and_delete_removes_every_trace() {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let manager = RunManager::new(
            tmp.path(),
            InstantScanner,
            InstantAnalyzer,
            InstantNormalizer { delay: Duration::from_millis(30) },
            PipelineSettings::default(),
        );

        let run_id = manager
            .start_run(config(&["p1", "p2", "p3", "p4", "p5", "p6"]), tmp.path())
            .await
            .expect("start");
        manager
            .cancel_run_and_delete(run_id)
            .await
            .expect("cancel and delete");

        assert!(manager.active_run_id().is_none());
        assert!(!RunPaths::new(tmp.path(), run_id).root().exists());
        assert!(manager.index().get(run_id).await.is_none());
    }
}
