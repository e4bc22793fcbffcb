// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Pipeline settings passed as plain data into the runner and the
// normalization engine. Loading and merging configuration files is the
// host's concern, not ours.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Hard ceiling for the page-worker pool.
pub const MAX_WORKERS: usize = 8;

/// Retry policy for the scan stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum retry attempts after the first failure.
    pub max_retries: u32,
    /// Base delay between retries (exponential backoff).
    pub base_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before retry attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Tunables for a pipeline run. All thresholds are plain data; defaults match
/// the production corpus profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Raw worker-count setting. Resolved through `resolve_workers`, which
    /// clamps to `[1, MAX_WORKERS]` and defaults on invalid input.
    pub workers: Option<f64>,
    /// Scan-stage retry policy.
    pub scan_retry: RetryPolicy,
    /// Whether the shading (illumination flattening) step runs.
    pub shading_enabled: bool,
    /// Relative aspect-ratio drift beyond which the crop is expanded toward
    /// the target ratio.
    pub aspect_drift_threshold: f64,
    /// Maximum centre drift (pixels) for snapping a page to the book-level
    /// median trim box.
    pub book_snap_max_drift_px: f64,
    /// Relative tolerance for DPI inference against known page sizes.
    pub dpi_tolerance: f64,
    /// Minimum interval between non-forced progress events per run.
    pub progress_min_interval: Duration,
    /// Pages with skew confidence below this go to the review queue.
    pub review_skew_confidence_floor: f64,
    /// Pages with mask coverage below this go to the review queue.
    pub review_mask_coverage_floor: f64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            workers: None,
            scan_retry: RetryPolicy::default(),
            shading_enabled: true,
            aspect_drift_threshold: 0.02,
            book_snap_max_drift_px: 24.0,
            dpi_tolerance: 0.05,
            progress_min_interval: Duration::from_millis(120),
            review_skew_confidence_floor: 0.25,
            review_mask_coverage_floor: 0.15,
        }
    }
}

impl PipelineSettings {
    /// Resolve the worker-pool size from the raw setting: NaN, non-positive,
    /// or absent values fall back to the default of 2; everything is clamped
    /// to `[1, MAX_WORKERS]`.
    pub fn resolve_workers(&self) -> usize {
        const DEFAULT_WORKERS: usize = 2;
        match self.workers {
            Some(raw) if raw.is_finite() && raw >= 1.0 => {
                (raw.floor() as usize).clamp(1, MAX_WORKERS)
            }
            _ => DEFAULT_WORKERS,
        }
    }
}
