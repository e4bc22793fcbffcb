// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// DPI resolution. Priority order: source-image metadata density (when
// consistent with the measured pixel size), aspect-ratio inference against
// known physical page sizes at common scan densities, then the corpus/target
// fallback. The chosen path is always recorded as the result's `DpiSource`.

use blattwerk_core::types::{CorpusSummary, DpiSource, PaperSize};
use tracing::debug;

/// Scan densities checked by the inference path, in dots per inch.
pub const COMMON_DPIS: &[f64] = &[150.0, 200.0, 240.0, 300.0, 400.0, 600.0];

/// Relative tolerance for "metadata density is consistent with the measured
/// pixel size": the implied physical dims must match a known page size or
/// the corpus target within this fraction.
const METADATA_DIMS_TOLERANCE: f64 = 0.10;

const MM_PER_INCH: f64 = 25.4;

/// Outcome of DPI resolution for one page.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DpiResolution {
    pub dpi: f64,
    pub source: DpiSource,
    /// Physical page dims implied by the resolved density.
    pub width_mm: f64,
    pub height_mm: f64,
    pub confidence: f64,
}

/// Resolve a page's DPI from metadata, inference, or the corpus fallback.
pub fn resolve_dpi(
    metadata_dpi: Option<f64>,
    width_px: u32,
    height_px: u32,
    summary: &CorpusSummary,
    tolerance: f64,
) -> DpiResolution {
    // Path 1: metadata density, accepted only when the physical size it
    // implies is plausible for this corpus.
    if let Some(dpi) = metadata_dpi.filter(|d| *d > 0.0) {
        let width_mm = width_px as f64 * MM_PER_INCH / dpi;
        let height_mm = height_px as f64 * MM_PER_INCH / dpi;
        if implied_dims_plausible(width_mm, height_mm, summary) {
            debug!(dpi, width_mm, height_mm, "metadata density accepted");
            return DpiResolution {
                dpi,
                source: DpiSource::Metadata,
                width_mm,
                height_mm,
                confidence: 0.9,
            };
        }
        debug!(
            dpi,
            width_mm, height_mm, "metadata density inconsistent with pixel size; ignoring"
        );
    }

    // Path 2: aspect-ratio inference against known page sizes.
    if let Some(inferred) = infer_from_aspect(width_px, height_px, tolerance) {
        return inferred;
    }

    // Path 3: corpus/target fallback.
    let dpi = if summary.dpi > 0.0 { summary.dpi } else { 300.0 };
    DpiResolution {
        dpi,
        source: DpiSource::Fallback,
        width_mm: width_px as f64 * MM_PER_INCH / dpi,
        height_mm: height_px as f64 * MM_PER_INCH / dpi,
        confidence: 0.2,
    }
}

/// Whether the implied physical dims match a known paper size or the corpus
/// target within `METADATA_DIMS_TOLERANCE` on both axes.
fn implied_dims_plausible(width_mm: f64, height_mm: f64, summary: &CorpusSummary) -> bool {
    let close = |a: f64, b: f64| b > 0.0 && ((a - b) / b).abs() <= METADATA_DIMS_TOLERANCE;

    if close(width_mm, summary.target_width_mm) && close(height_mm, summary.target_height_mm) {
        return true;
    }
    PaperSize::known_sizes().iter().any(|size| {
        let (pw, ph) = size.dimensions_mm();
        close(width_mm, pw) && close(height_mm, ph)
    })
}

/// Match the pixel aspect ratio against known page sizes; when the best match
/// also sits near a common scan density, report an inferred resolution.
fn infer_from_aspect(width_px: u32, height_px: u32, tolerance: f64) -> Option<DpiResolution> {
    if width_px == 0 || height_px == 0 {
        return None;
    }
    let aspect = width_px as f64 / height_px as f64;

    let mut best: Option<(PaperSize, f64)> = None;
    for size in PaperSize::known_sizes() {
        let (pw, ph) = size.dimensions_mm();
        let error = (aspect - pw / ph).abs() / (pw / ph);
        if error <= tolerance && best.is_none_or(|(_, prev)| error < prev) {
            best = Some((*size, error));
        }
    }
    let (size, aspect_error) = best?;
    let (paper_w_mm, paper_h_mm) = size.dimensions_mm();

    let raw_dpi = width_px as f64 * MM_PER_INCH / paper_w_mm;
    let snapped = COMMON_DPIS
        .iter()
        .copied()
        .min_by(|a, b| {
            (a - raw_dpi)
                .abs()
                .partial_cmp(&(b - raw_dpi).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .filter(|common| ((common - raw_dpi) / common).abs() <= tolerance)?;

    debug!(
        ?size,
        raw_dpi, snapped, aspect_error, "dpi inferred from aspect ratio"
    );
    Some(DpiResolution {
        dpi: snapped,
        source: DpiSource::Inferred,
        width_mm: paper_w_mm,
        height_mm: paper_h_mm,
        confidence: (1.0 - aspect_error / tolerance.max(f64::EPSILON)).clamp(0.0, 1.0),
    })
}
