// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the Blattwerk normalization pipeline.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle states of a pipeline run.
///
/// Allowed transitions:
/// `queued → running ⇄ paused → cancelling → {cancelled | error | success}`.
/// `running` may also terminate directly in `error` or `success`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Created and persisted, task not yet started.
    Queued,
    /// The pipeline task is making forward progress.
    Running,
    /// Forward progress suspended at the pause gate.
    Paused,
    /// Cancellation requested; in-flight work draining to its next checkpoint.
    Cancelling,
    /// Run ended because the operator cancelled it.
    Cancelled,
    /// Run ended with an orchestration-level failure.
    Error,
    /// Orchestration completed (individual pages may still have failed).
    Success,
}

impl RunStatus {
    /// Whether this status is a terminal state of the run machine.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Error | Self::Success)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (Queued, Running) | (Queued, Cancelling) => true,
            (Running, Paused) | (Running, Cancelling) => true,
            (Running, Error) | (Running, Success) => true,
            (Paused, Running) | (Paused, Cancelling) => true,
            (Cancelling, Cancelled) | (Cancelling, Error) | (Cancelling, Success) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
            Self::Success => "success",
        };
        f.write_str(label)
    }
}

/// Pipeline stages, used as progress-event phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStage {
    Scan,
    Analyze,
    Normalize,
    Aggregate,
}

/// Standard physical page sizes, used by DPI inference.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PaperSize {
    A4,
    A3,
    A5,
    B5,
    Letter,
    Legal,
    Custom { width_mm: f64, height_mm: f64 },
}

impl PaperSize {
    /// Dimensions in millimetres (width, height).
    pub fn dimensions_mm(&self) -> (f64, f64) {
        match self {
            Self::A4 => (210.0, 297.0),
            Self::A3 => (297.0, 420.0),
            Self::A5 => (148.0, 210.0),
            Self::B5 => (176.0, 250.0),
            Self::Letter => (215.9, 279.4),
            Self::Legal => (215.9, 355.6),
            Self::Custom {
                width_mm,
                height_mm,
            } => (*width_mm, *height_mm),
        }
    }

    /// The catalogue of known sizes checked by DPI inference.
    pub fn known_sizes() -> &'static [PaperSize] {
        &[
            Self::A4,
            Self::A3,
            Self::A5,
            Self::B5,
            Self::Letter,
            Self::Legal,
        ]
    }
}

/// One page of the corpus, as reported by the scanner collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageSource {
    pub id: String,
    pub file_name: String,
    pub source_path: PathBuf,
    /// Embedded density from the source image metadata, when the scanner
    /// found one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_dpi: Option<f64>,
    /// Named confidence scores attached by the scanner (ordering kept stable
    /// for deterministic serialization).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub confidence: BTreeMap<String, f64>,
}

/// Input to a run: the project's pages plus normalization targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    pub project_id: String,
    pub pages: Vec<PageSource>,
    pub target_dpi: f64,
    pub target_width_mm: f64,
    pub target_height_mm: f64,
}

/// Axis-aligned pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PixelBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Whether `other` lies entirely inside `self`.
    pub fn contains(&self, other: &PixelBox) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    /// Clamp `self` so that it lies entirely inside `bounds`.
    pub fn clamp_to(&self, bounds: &PixelBox) -> PixelBox {
        let x = self.x.max(bounds.x).min(bounds.right().saturating_sub(1));
        let y = self.y.max(bounds.y).min(bounds.bottom().saturating_sub(1));
        let right = self.right().min(bounds.right());
        let bottom = self.bottom().min(bounds.bottom());
        PixelBox {
            x,
            y,
            width: right.saturating_sub(x).max(1),
            height: bottom.saturating_sub(y).max(1),
        }
    }

    /// Centre point of the box.
    pub fn center(&self) -> (f64, f64) {
        (
            self.x as f64 + self.width as f64 / 2.0,
            self.y as f64 + self.height as f64 / 2.0,
        )
    }
}

/// Analysis-phase measurement of one page's geometry, prior to normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageBoundsEstimate {
    pub page_id: String,
    pub width_px: u32,
    pub height_px: u32,
    pub bleed_px: u32,
    pub trim_px: u32,
    pub page_bounds: PixelBox,
    pub content_bounds: PixelBox,
}

/// Marker placed in `CorpusSummary::notes` when analysis was degraded to the
/// synthesized fallback.
pub const FALLBACK_SUMMARY_NOTE: &str = "fallback summary: analysis unavailable";

/// Corpus-level analysis output consumed by normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorpusSummary {
    pub project_id: String,
    pub page_count: usize,
    pub dpi: f64,
    pub target_width_mm: f64,
    pub target_height_mm: f64,
    pub target_width_px: u32,
    pub target_height_px: u32,
    #[serde(default)]
    pub estimates: Vec<PageBoundsEstimate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl CorpusSummary {
    /// Synthesize a degraded summary from the run config's targets.
    /// Used when the analyzer collaborator fails: the run proceeds without
    /// per-page bounds estimates rather than aborting.
    pub fn fallback(config: &RunConfig) -> Self {
        let px = |mm: f64| (mm * config.target_dpi / 25.4).round().max(1.0) as u32;
        Self {
            project_id: config.project_id.clone(),
            page_count: config.pages.len(),
            dpi: config.target_dpi,
            target_width_mm: config.target_width_mm,
            target_height_mm: config.target_height_mm,
            target_width_px: px(config.target_width_mm),
            target_height_px: px(config.target_height_mm),
            estimates: Vec::new(),
            notes: Some(FALLBACK_SUMMARY_NOTE.to_string()),
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.notes
            .as_deref()
            .is_some_and(|n| n.contains("fallback summary"))
    }

    /// The bounds estimate for a given page, if analysis produced one.
    pub fn estimate_for(&self, page_id: &str) -> Option<&PageBoundsEstimate> {
        self.estimates.iter().find(|e| e.page_id == page_id)
    }
}

/// Provenance of a page's resolved DPI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DpiSource {
    /// Source-image metadata density, consistent with the measured pixels.
    Metadata,
    /// Inferred from pixel aspect ratio against a known physical page size.
    Inferred,
    /// Corpus/target DPI, used when neither of the above applied.
    Fallback,
}

/// Which page edge a spine/edge shadow sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShadowSide {
    Left,
    Right,
}

/// Edge-shadow measurement for one page.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShadowReport {
    pub present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side: Option<ShadowSide>,
    pub width_px: u32,
    pub confidence: f64,
    pub darkness: f64,
}

impl ShadowReport {
    pub fn absent() -> Self {
        Self {
            present: false,
            side: None,
            width_px: 0,
            confidence: 0.0,
            darkness: 0.0,
        }
    }
}

/// Quality statistics gathered for one normalized page.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageStats {
    pub background_mean: f64,
    pub background_std: f64,
    pub mask_coverage: f64,
    pub skew_confidence: f64,
    pub shadow_score: f64,
    pub illumination_residual: f64,
    pub spine_shadow_score: f64,
}

// -- Math-primitive result types ----------------------------------------------
//
// Shared here so the primitives, normalization, and pipeline crates all agree
// on the audit record shape.

/// Page skew estimate from the gradient-orientation histogram.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkewEstimate {
    pub angle: f64,
    pub confidence: f64,
}

impl SkewEstimate {
    pub fn zero() -> Self {
        Self {
            angle: 0.0,
            confidence: 0.0,
        }
    }
}

/// Periodic text-line structure detected from row-intensity peaks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaselineMetrics {
    pub line_consistency: f64,
    pub text_line_count: u32,
    pub spacing_norm: f64,
    pub spacing_mad_norm: f64,
    pub offset_norm: f64,
    pub angle_deg: f64,
    pub confidence: f64,
    pub peak_sharpness: f64,
    /// Peak y-positions normalized to [0, 1].
    pub peaks_y: Vec<f64>,
}

impl BaselineMetrics {
    pub fn zero() -> Self {
        Self {
            line_consistency: 0.0,
            text_line_count: 0,
            spacing_norm: 0.0,
            spacing_mad_norm: 0.0,
            offset_norm: 0.0,
            angle_deg: 0.0,
            confidence: 0.0,
            peak_sharpness: 0.0,
            peaks_y: Vec::new(),
        }
    }
}

/// Column structure detected from valleys in the column projection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMetrics {
    pub column_count: u32,
    pub column_separation: f64,
}

impl ColumnMetrics {
    pub fn zero() -> Self {
        Self {
            column_count: 0,
            column_separation: 0.0,
        }
    }
}

/// One detected layout element (text block, folio, ornament, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutElement {
    pub id: String,
    pub kind: String,
    /// `[x0, y0, x1, y1]` in pixels.
    pub bbox: [f64; 4],
    pub confidence: f64,
}

// -- Corrections --------------------------------------------------------------

/// Symmetric crop expansion toward the target aspect ratio.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlignmentCorrection {
    pub applied: bool,
    /// Relative aspect-ratio drift that was measured.
    pub drift: f64,
    /// Pixels added on each horizontal side.
    pub expanded_x: u32,
    /// Pixels added on each vertical side.
    pub expanded_y: u32,
}

/// Denoise / contrast flags driven by background statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MorphologyCorrection {
    pub denoise: bool,
    pub contrast_boost: bool,
    pub background_std: f64,
}

/// Snap of the measured trim box toward the book-level median.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookSnapCorrection {
    pub applied: bool,
    /// Centre drift from the book median, in pixels.
    pub drift_px: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapped_to: Option<PixelBox>,
}

/// Illumination flattening outcome.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShadingCorrection {
    pub applied: bool,
    pub residual_before: f64,
    pub residual_after: f64,
}

/// Per-page audit trail: every geometric or photometric decision is recorded
/// here, never applied silently. Absent fields mean the step did not run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Corrections {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alignment: Option<AlignmentCorrection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub morphology: Option<MorphologyCorrection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline: Option<BaselineMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<ColumnMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub book_snap: Option<BookSnapCorrection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skew_refined: Option<SkewEstimate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shading: Option<ShadingCorrection>,
}

/// Immutable record of one page's normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizationResult {
    pub page_id: String,
    pub output_path: PathBuf,
    pub crop_box: PixelBox,
    pub mask_box: PixelBox,
    pub width_mm: f64,
    pub height_mm: f64,
    pub dpi: f64,
    pub dpi_source: DpiSource,
    pub trim_mm: f64,
    pub bleed_mm: f64,
    pub skew_angle: f64,
    pub shadow: ShadowReport,
    pub stats: PageStats,
    pub corrections: Corrections,
    /// Perceptual hash of the normalized page (9×8 dhash, hex).
    pub dhash: String,
}

// -- Run index ----------------------------------------------------------------

/// One persisted run record in `run-index.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunIndexEntry {
    pub run_id: RunId,
    pub project_id: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub review_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<RunStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inferred_width_mm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inferred_height_mm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inferred_dpi: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dims_confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dpi_confidence: Option<f64>,
}

impl RunIndexEntry {
    /// A fresh `queued` entry with both timestamps set to now.
    pub fn new(run_id: RunId, project_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            project_id: project_id.into(),
            status: RunStatus::Queued,
            created_at: now,
            updated_at: now,
            review_count: 0,
            phase: None,
            inferred_width_mm: None,
            inferred_height_mm: None,
            inferred_dpi: None,
            dims_confidence: None,
            dpi_confidence: None,
        }
    }

    /// Merge-patch: only fields present in the patch overwrite; everything
    /// else retains its prior value. Bumps `updated_at`.
    pub fn apply(&mut self, patch: &RunIndexPatch) {
        if let Some(project_id) = &patch.project_id {
            self.project_id = project_id.clone();
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(review_count) = patch.review_count {
            self.review_count = review_count;
        }
        if let Some(phase) = patch.phase {
            self.phase = Some(phase);
        }
        if let Some(v) = patch.inferred_width_mm {
            self.inferred_width_mm = Some(v);
        }
        if let Some(v) = patch.inferred_height_mm {
            self.inferred_height_mm = Some(v);
        }
        if let Some(v) = patch.inferred_dpi {
            self.inferred_dpi = Some(v);
        }
        if let Some(v) = patch.dims_confidence {
            self.dims_confidence = Some(v);
        }
        if let Some(v) = patch.dpi_confidence {
            self.dpi_confidence = Some(v);
        }
        self.updated_at = Utc::now();
    }
}

/// All-optional mirror of `RunIndexEntry` used for merge-patch updates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunIndexPatch {
    pub project_id: Option<String>,
    pub status: Option<RunStatus>,
    pub review_count: Option<u32>,
    pub phase: Option<RunStage>,
    pub inferred_width_mm: Option<f64>,
    pub inferred_height_mm: Option<f64>,
    pub inferred_dpi: Option<f64>,
    pub dims_confidence: Option<f64>,
    pub dpi_confidence: Option<f64>,
}

impl RunIndexPatch {
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

// -- Progress -----------------------------------------------------------------

/// Transient progress notification published to external listeners.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunProgressEvent {
    pub run_id: RunId,
    pub project_id: String,
    pub stage: RunStage,
    pub processed: usize,
    pub total: usize,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throughput: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_page: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recent_pages: Vec<String>,
}
