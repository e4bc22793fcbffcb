// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The four-stage pipeline: scan → analyze → normalize → aggregate.
//
// Scan failures are retried with exponential backoff; analysis failure
// degrades to a synthesized corpus summary instead of failing the run; and a
// page that cannot be normalized is recorded as a run error without touching
// its siblings. Pause and cancel are honoured at stage and page boundaries,
// never mid-page.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use blattwerk_core::error::{BlattwerkError, Result, is_abort_error};
use blattwerk_core::settings::PipelineSettings;
use blattwerk_core::types::{
    CorpusSummary, NormalizationResult, PageSource, RunConfig, RunId, RunProgressEvent, RunStage,
};
use blattwerk_normalize::median_trim_box;

use crate::artifacts::ReviewEntry;
use crate::progress::ProgressBroker;
use crate::traits::{CorpusAnalyzer, CorpusScanner, PageNormalizer};

/// Cooperative pause switch shared between a run task and its controller.
///
/// Pausing never interrupts in-flight work; the runner parks at the next
/// stage or page boundary until resumed.
#[derive(Clone)]
pub struct PauseGate {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl PauseGate {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn pause(&self) {
        self.tx.send_replace(true);
    }

    pub fn resume(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes immediately when not paused, otherwise waits for `resume`.
    pub async fn wait_until_resumed(&self) {
        let mut rx = self.rx.clone();
        // A closed channel means the controller is gone; treat as resumed.
        let _ = rx.wait_for(|paused| !*paused).await;
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

/// One recorded failure within an otherwise-continuing run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunError {
    pub stage: RunStage,
    pub page_id: Option<String>,
    pub message: String,
}

impl RunError {
    /// Phase tag for externally surfaced documents, which spell the phases
    /// out ("normalization") rather than using the internal stage idents.
    pub fn phase_label(&self) -> &'static str {
        match self.stage {
            RunStage::Scan => "scan",
            RunStage::Analyze => "analysis",
            RunStage::Normalize => "normalization",
            RunStage::Aggregate => "aggregation",
        }
    }
}

/// How a finished run completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunCompletion {
    Clean,
    CompletedWithErrors,
}

/// Corpus-level dimensions aggregated from the normalized pages.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InferredDimensions {
    pub width_mm: Option<f64>,
    pub height_mm: Option<f64>,
    pub dpi: Option<f64>,
    pub dims_confidence: Option<f64>,
    pub dpi_confidence: Option<f64>,
}

/// Everything a completed run produced.
#[derive(Debug)]
pub struct RunOutcome {
    /// Whether orchestration ran to completion. Per-page and analysis
    /// failures leave this true; they are listed in `errors`.
    pub success: bool,
    pub errors: Vec<RunError>,
    pub analysis: CorpusSummary,
    pub pages: Vec<NormalizationResult>,
    pub review: Vec<ReviewEntry>,
    pub inferred: InferredDimensions,
}

impl RunOutcome {
    pub fn completion(&self) -> RunCompletion {
        if self.errors.is_empty() {
            RunCompletion::Clean
        } else {
            RunCompletion::CompletedWithErrors
        }
    }
}

/// Drives one run through the four stages.
pub struct PipelineRunner<S, A, N> {
    scanner: S,
    analyzer: A,
    normalizer: Arc<N>,
    settings: PipelineSettings,
    progress: ProgressBroker,
}

impl<S, A, N> PipelineRunner<S, A, N>
where
    S: CorpusScanner,
    A: CorpusAnalyzer,
    N: PageNormalizer + 'static,
{
    pub fn new(
        scanner: S,
        analyzer: A,
        normalizer: N,
        settings: PipelineSettings,
        progress: ProgressBroker,
    ) -> Self {
        Self {
            scanner,
            analyzer,
            normalizer: Arc::new(normalizer),
            settings,
            progress,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Execute the run. Returns `Err(Cancelled)` when cancellation was
    /// requested; all other errors mean the run could not proceed at all
    /// (scan exhausted its retries, for instance).
    #[instrument(skip_all, fields(run_id = %run_id, project_id = %request.project_id))]
    pub async fn run(
        &self,
        run_id: RunId,
        request: &RunConfig,
        project_root: &Path,
        run_dir: &Path,
        pause: &PauseGate,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let mut errors = Vec::new();

        self.checkpoint(pause, cancel).await?;
        self.emit(run_id, request, RunStage::Scan, 0, request.pages.len(), None, None, true);
        let config = self.scan_with_retry(request, project_root, cancel).await?;
        let config = &config;
        let pages = config.pages.clone();
        let total = pages.len();
        info!(pages = total, "scan complete");

        self.checkpoint(pause, cancel).await?;
        self.emit(run_id, config, RunStage::Analyze, 0, total, None, None, true);
        let summary = match self.analyzer.analyze(config, &pages).await {
            Ok(summary) => summary,
            Err(err) if is_abort_error(&err) => return Err(err),
            Err(err) => {
                warn!("analysis degraded to fallback summary: {err}");
                errors.push(RunError {
                    stage: RunStage::Analyze,
                    page_id: None,
                    message: err.to_string(),
                });
                CorpusSummary::fallback(config)
            }
        };
        let book_prior = median_trim_box(&summary.estimates);

        self.checkpoint(pause, cancel).await?;
        self.emit(run_id, config, RunStage::Normalize, 0, total, None, None, true);
        let results = self
            .normalize_pool(run_id, config, pages, &summary, book_prior, run_dir, pause, cancel, &mut errors)
            .await?;

        self.checkpoint(pause, cancel).await?;
        self.emit(run_id, config, RunStage::Aggregate, total, total, None, None, true);
        let inferred = aggregate_dimensions(&results);
        let review = review_entries(&results, &self.settings);
        info!(
            pages = results.len(),
            errors = errors.len(),
            review = review.len(),
            "run complete"
        );

        Ok(RunOutcome {
            success: true,
            errors,
            analysis: summary,
            pages: results,
            review,
            inferred,
        })
    }

    async fn scan_with_retry(
        &self,
        request: &RunConfig,
        project_root: &Path,
        cancel: &CancellationToken,
    ) -> Result<RunConfig> {
        let policy = self.settings.scan_retry;
        let mut attempt = 0u32;
        loop {
            let scanned = tokio::select! {
                _ = cancel.cancelled() => return Err(BlattwerkError::Cancelled),
                scanned = self.scanner.scan(project_root, request) => scanned,
            };
            match scanned {
                Ok(config) if config.pages.is_empty() => {
                    return Err(BlattwerkError::Scan("scanner returned no pages".into()));
                }
                Ok(config) => return Ok(config),
                Err(err) if is_abort_error(&err) => return Err(err),
                Err(err) if attempt >= policy.max_retries => return Err(err),
                Err(err) => {
                    attempt += 1;
                    let delay = policy.delay_for(attempt);
                    warn!(attempt, ?delay, "scan failed, retrying: {err}");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(BlattwerkError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn normalize_pool(
        &self,
        run_id: RunId,
        config: &RunConfig,
        pages: Vec<PageSource>,
        summary: &CorpusSummary,
        book_prior: Option<blattwerk_core::types::PixelBox>,
        run_dir: &Path,
        pause: &PauseGate,
        cancel: &CancellationToken,
        errors: &mut Vec<RunError>,
    ) -> Result<Vec<NormalizationResult>> {
        let total = pages.len();
        let workers = self.settings.resolve_workers();
        let semaphore = Arc::new(Semaphore::new(workers));
        let summary = Arc::new(summary.clone());
        let settings = Arc::new(self.settings.clone());
        let run_dir: Arc<PathBuf> = Arc::new(run_dir.to_path_buf());

        let mut join_set: JoinSet<(String, Result<NormalizationResult>)> = JoinSet::new();
        let mut cancelled = false;

        for page in pages {
            if self.checkpoint(pause, cancel).await.is_err() {
                cancelled = true;
                break;
            }
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let normalizer = Arc::clone(&self.normalizer);
            let summary = Arc::clone(&summary);
            let settings = Arc::clone(&settings);
            let run_dir = Arc::clone(&run_dir);
            join_set.spawn(async move {
                let _permit = permit;
                let page_id = page.id.clone();
                let joined = tokio::task::spawn_blocking(move || {
                    let estimate = summary.estimate_for(&page.id);
                    normalizer.normalize(
                        &page,
                        estimate,
                        &summary,
                        book_prior.as_ref(),
                        &run_dir,
                        &settings,
                    )
                })
                .await;
                let result = match joined {
                    Ok(result) => result,
                    Err(err) => Err(BlattwerkError::Normalization(format!(
                        "normalize task for {page_id} failed: {err}"
                    ))),
                };
                (page_id, result)
            });
        }

        let mut results = Vec::with_capacity(total);
        let mut recent: Vec<String> = Vec::new();
        let started = Instant::now();
        let mut processed = 0usize;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((page_id, Ok(result))) => {
                    processed += 1;
                    recent.push(page_id.clone());
                    if recent.len() > 3 {
                        recent.remove(0);
                    }
                    let elapsed = started.elapsed().as_secs_f64();
                    let throughput = if elapsed > 0.0 {
                        Some(processed as f64 / elapsed)
                    } else {
                        None
                    };
                    self.emit_with_pages(
                        run_id,
                        config,
                        RunStage::Normalize,
                        processed,
                        total,
                        Some(page_id),
                        throughput,
                        recent.clone(),
                        false,
                    );
                    results.push(result);
                }
                Ok((page_id, Err(err))) => {
                    let failure = RunError {
                        stage: RunStage::Normalize,
                        page_id: Some(page_id),
                        message: err.to_string(),
                    };
                    warn!(
                        page_id = failure.page_id.as_deref().unwrap_or(""),
                        phase = failure.phase_label(),
                        "page normalization failed: {err}"
                    );
                    errors.push(failure);
                }
                Err(err) => {
                    errors.push(RunError {
                        stage: RunStage::Normalize,
                        page_id: None,
                        message: format!("worker panicked: {err}"),
                    });
                }
            }
        }

        if cancelled {
            return Err(BlattwerkError::Cancelled);
        }
        // Keep page order stable for manifests regardless of worker timing.
        results.sort_by(|a, b| a.page_id.cmp(&b.page_id));
        Ok(results)
    }

    async fn checkpoint(&self, pause: &PauseGate, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(BlattwerkError::Cancelled);
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(BlattwerkError::Cancelled),
            _ = pause.wait_until_resumed() => Ok(()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit(
        &self,
        run_id: RunId,
        config: &RunConfig,
        stage: RunStage,
        processed: usize,
        total: usize,
        current_page: Option<String>,
        throughput: Option<f64>,
        forced: bool,
    ) {
        self.emit_with_pages(
            run_id,
            config,
            stage,
            processed,
            total,
            current_page,
            throughput,
            Vec::new(),
            forced,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_with_pages(
        &self,
        run_id: RunId,
        config: &RunConfig,
        stage: RunStage,
        processed: usize,
        total: usize,
        current_page: Option<String>,
        throughput: Option<f64>,
        recent_pages: Vec<String>,
        forced: bool,
    ) {
        let event = RunProgressEvent {
            run_id,
            project_id: config.project_id.clone(),
            stage,
            processed,
            total,
            timestamp: Utc::now(),
            throughput,
            current_page,
            recent_pages,
        };
        self.progress.publish(&event, forced);
    }
}

/// Median physical dimensions and density over the normalized pages, with the
/// fraction of pages agreeing (within 2%) as the confidence.
fn aggregate_dimensions(results: &[NormalizationResult]) -> InferredDimensions {
    if results.is_empty() {
        return InferredDimensions::default();
    }
    let median = |mut values: Vec<f64>| -> f64 {
        values.sort_by(|a, b| a.total_cmp(b));
        values[values.len() / 2]
    };
    let width = median(results.iter().map(|r| r.width_mm).collect());
    let height = median(results.iter().map(|r| r.height_mm).collect());
    let dpi = median(results.iter().map(|r| r.dpi).collect());

    let within = |value: f64, reference: f64| -> bool {
        reference != 0.0 && ((value - reference) / reference).abs() <= 0.02
    };
    let dims_agree = results
        .iter()
        .filter(|r| within(r.width_mm, width) && within(r.height_mm, height))
        .count();
    let dpi_agree = results.iter().filter(|r| within(r.dpi, dpi)).count();
    let n = results.len() as f64;

    InferredDimensions {
        width_mm: Some(width),
        height_mm: Some(height),
        dpi: Some(dpi),
        dims_confidence: Some(dims_agree as f64 / n),
        dpi_confidence: Some(dpi_agree as f64 / n),
    }
}

/// Flag pages whose quality stats fall below the review floors.
fn review_entries(results: &[NormalizationResult], settings: &PipelineSettings) -> Vec<ReviewEntry> {
    let mut entries = Vec::new();
    for result in results {
        let mut reasons = Vec::new();
        if result.stats.skew_confidence < settings.review_skew_confidence_floor {
            reasons.push("low skew confidence".to_string());
        }
        if result.stats.mask_coverage < settings.review_mask_coverage_floor {
            reasons.push("low mask coverage".to_string());
        }
        if !reasons.is_empty() {
            entries.push(ReviewEntry {
                page_id: result.page_id.clone(),
                reasons,
            });
        }
    }
    entries
}
