// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Page geometry: content/page bounds from edge energy, crop and mask boxes,
// aspect-drift alignment, and book-level trim snapping.

use blattwerk_core::types::{
    AlignmentCorrection, BookSnapCorrection, PageBoundsEstimate, PixelBox,
};
use blattwerk_primitives::PixelKernel;
use tracing::debug;

/// Fraction of the peak edge energy a row/column must carry to count as
/// content.
const ENERGY_FLOOR_FRACTION: f64 = 0.10;

/// Padding added around the content bounds when no bleed estimate exists.
const DEFAULT_CROP_PAD_PX: u32 = 8;

/// Resolved geometry for one page.
#[derive(Debug, Clone)]
pub struct GeometryOutcome {
    pub crop_box: PixelBox,
    pub mask_box: PixelBox,
    pub alignment: AlignmentCorrection,
    pub book_snap: Option<BookSnapCorrection>,
    /// Mask area as a fraction of the page bounds area.
    pub mask_coverage: f64,
}

/// Detect the content bounding box from Sobel edge energy projections.
/// A uniform (edge-free) image falls back to the full frame.
pub fn detect_content_bounds(
    kernel: &dyn PixelKernel,
    data: &[u8],
    width: usize,
    height: usize,
) -> PixelBox {
    let full = PixelBox::new(0, 0, width.max(1) as u32, height.max(1) as u32);
    if width < 3 || height < 3 {
        return full;
    }

    let sobel = kernel.sobel_magnitude(data, width, height);
    if sobel.len() != width * height {
        return full;
    }

    let mut row_energy = vec![0f64; height];
    let mut col_energy = vec![0f64; width];
    for y in 0..height {
        let offset = y * width;
        for x in 0..width {
            let e = sobel[offset + x] as f64;
            row_energy[y] += e;
            col_energy[x] += e;
        }
    }

    let span = |energy: &[f64]| -> Option<(usize, usize)> {
        let peak = energy.iter().cloned().fold(0f64, f64::max);
        if peak <= 0.0 {
            return None;
        }
        let floor = peak * ENERGY_FLOOR_FRACTION;
        let first = energy.iter().position(|&e| e > floor)?;
        let last = energy.iter().rposition(|&e| e > floor)?;
        Some((first, last))
    };

    match (span(&row_energy), span(&col_energy)) {
        (Some((top, bottom)), Some((left, right))) => PixelBox::new(
            left as u32,
            top as u32,
            (right - left + 1) as u32,
            (bottom - top + 1) as u32,
        ),
        _ => full,
    }
}

/// Symmetrically expand `crop` toward the target aspect ratio when the
/// measured ratio drifts beyond `threshold`. Below threshold the box is
/// returned untouched with `applied = false`.
pub fn align_to_target_ratio(
    crop: PixelBox,
    target_width_mm: f64,
    target_height_mm: f64,
    threshold: f64,
    bounds: &PixelBox,
) -> (PixelBox, AlignmentCorrection) {
    if crop.height == 0 || target_height_mm <= 0.0 || target_width_mm <= 0.0 {
        return (
            crop,
            AlignmentCorrection {
                applied: false,
                drift: 0.0,
                expanded_x: 0,
                expanded_y: 0,
            },
        );
    }

    let measured = crop.width as f64 / crop.height as f64;
    let target = target_width_mm / target_height_mm;
    let drift = (measured - target).abs() / target;

    if drift <= threshold {
        return (
            crop,
            AlignmentCorrection {
                applied: false,
                drift,
                expanded_x: 0,
                expanded_y: 0,
            },
        );
    }

    let (expanded, expanded_x, expanded_y) = if measured < target {
        // Too narrow: grow symmetrically in x.
        let wanted = (crop.height as f64 * target).round() as u32;
        let grow = wanted.saturating_sub(crop.width);
        let half = grow / 2;
        (
            PixelBox::new(
                crop.x.saturating_sub(half),
                crop.y,
                crop.width + grow,
                crop.height,
            ),
            half,
            0,
        )
    } else {
        // Too wide: grow symmetrically in y.
        let wanted = (crop.width as f64 / target).round() as u32;
        let grow = wanted.saturating_sub(crop.height);
        let half = grow / 2;
        (
            PixelBox::new(
                crop.x,
                crop.y.saturating_sub(half),
                crop.width,
                crop.height + grow,
            ),
            0,
            half,
        )
    };

    debug!(drift, expanded_x, expanded_y, "crop expanded toward target ratio");
    (
        expanded.clamp_to(bounds),
        AlignmentCorrection {
            applied: true,
            drift,
            expanded_x,
            expanded_y,
        },
    )
}

/// Snap `crop` to the book-level median trim box when it drifts less than
/// `max_drift_px` from it (centre distance and dimension difference both
/// count). Outliers stay as measured.
pub fn snap_to_book_prior(
    crop: PixelBox,
    prior: &PixelBox,
    max_drift_px: f64,
    bounds: &PixelBox,
) -> (PixelBox, BookSnapCorrection) {
    let (cx, cy) = crop.center();
    let (px, py) = prior.center();
    let center_drift = ((cx - px).powi(2) + (cy - py).powi(2)).sqrt();
    let dim_drift = (crop.width as f64 - prior.width as f64)
        .abs()
        .max((crop.height as f64 - prior.height as f64).abs());
    let drift_px = center_drift.max(dim_drift);

    if drift_px <= max_drift_px {
        let snapped = prior.clamp_to(bounds);
        (
            snapped,
            BookSnapCorrection {
                applied: true,
                drift_px,
                snapped_to: Some(snapped),
            },
        )
    } else {
        (
            crop,
            BookSnapCorrection {
                applied: false,
                drift_px,
                snapped_to: None,
            },
        )
    }
}

/// The book prior: per-axis median of the estimates' content boxes.
/// `None` when fewer than three pages carry estimates.
pub fn median_trim_box(estimates: &[PageBoundsEstimate]) -> Option<PixelBox> {
    if estimates.len() < 3 {
        return None;
    }
    let median_u32 = |mut values: Vec<u32>| -> u32 {
        values.sort_unstable();
        values[values.len() / 2]
    };
    Some(PixelBox::new(
        median_u32(estimates.iter().map(|e| e.content_bounds.x).collect()),
        median_u32(estimates.iter().map(|e| e.content_bounds.y).collect()),
        median_u32(estimates.iter().map(|e| e.content_bounds.width).collect()),
        median_u32(estimates.iter().map(|e| e.content_bounds.height).collect()),
    ))
}

/// Full geometry resolution for one page: content bounds → padded crop →
/// aspect alignment → book snap, everything clamped inside the page bounds.
pub fn resolve_geometry(
    kernel: &dyn PixelKernel,
    data: &[u8],
    width: usize,
    height: usize,
    estimate: Option<&PageBoundsEstimate>,
    book_prior: Option<&PixelBox>,
    target_width_mm: f64,
    target_height_mm: f64,
    aspect_drift_threshold: f64,
    book_snap_max_drift_px: f64,
) -> GeometryOutcome {
    let frame = PixelBox::new(0, 0, width.max(1) as u32, height.max(1) as u32);
    let page_bounds = estimate
        .map(|e| e.page_bounds.clamp_to(&frame))
        .unwrap_or(frame);

    let content = detect_content_bounds(kernel, data, width, height).clamp_to(&page_bounds);

    let pad = estimate.map(|e| e.bleed_px).unwrap_or(DEFAULT_CROP_PAD_PX);
    let padded = PixelBox::new(
        content.x.saturating_sub(pad),
        content.y.saturating_sub(pad),
        content.width + pad * 2,
        content.height + pad * 2,
    )
    .clamp_to(&page_bounds);

    let (aligned, alignment) = align_to_target_ratio(
        padded,
        target_width_mm,
        target_height_mm,
        aspect_drift_threshold,
        &page_bounds,
    );

    let (crop_box, book_snap) = match book_prior {
        Some(prior) => {
            let (snapped, correction) =
                snap_to_book_prior(aligned, prior, book_snap_max_drift_px, &page_bounds);
            (snapped, Some(correction))
        }
        None => (aligned, None),
    };

    let mask_box = content;
    let mask_coverage = mask_box.area() as f64 / page_bounds.area().max(1) as f64;

    GeometryOutcome {
        crop_box,
        mask_box,
        alignment,
        book_snap,
        mask_coverage,
    }
}
