// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Per-page normalization: decode → geometry → DPI → metrics → shading →
// atomic output + sidecar. Every numeric decision is recorded on the result,
// never applied silently.

use std::fs;
use std::path::{Path, PathBuf};

use image::{GrayImage, ImageFormat};
use tracing::{info, instrument};

use blattwerk_core::error::{BlattwerkError, Result};
use blattwerk_core::settings::PipelineSettings;
use blattwerk_core::types::{
    CorpusSummary, Corrections, MorphologyCorrection, NormalizationResult, PageBoundsEstimate,
    PageSource, PageStats, PixelBox, ShadingCorrection,
};
use blattwerk_primitives::{PixelKernel, default_kernel};

use crate::dpi::resolve_dpi;
use crate::geometry::resolve_geometry;
use crate::shading::{IlluminationModel, detect_edge_shadow};

const MM_PER_INCH: f64 = 25.4;

/// Background noise level above which the denoise flag is raised.
const DENOISE_STD_FLOOR: f64 = 24.0;

/// Dynamic range (p95 − p5) below which the contrast-boost flag is raised.
const CONTRAST_RANGE_FLOOR: u32 = 120;

/// Normalize one page.
///
/// CPU-bound and synchronous; the pipeline runner wraps calls in
/// `spawn_blocking`. Output image and sidecar are written atomically
/// (temp file + rename), so cancellation never leaves partial artifacts.
#[instrument(skip_all, fields(page_id = %page.id))]
pub fn normalize_page(
    page: &PageSource,
    estimate: Option<&PageBoundsEstimate>,
    summary: &CorpusSummary,
    book_prior: Option<&PixelBox>,
    run_dir: &Path,
    settings: &PipelineSettings,
) -> Result<NormalizationResult> {
    let gray = image::open(&page.source_path)
        .map_err(|err| {
            BlattwerkError::Normalization(format!(
                "failed to decode {}: {err}",
                page.source_path.display()
            ))
        })?
        .to_luma8();
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 {
        return Err(BlattwerkError::Normalization(format!(
            "empty image: {}",
            page.source_path.display()
        )));
    }

    let kernel = default_kernel();
    let data = gray.as_raw();

    // Geometry is resolved on the untouched grayscale, before any shading,
    // so toggling shading cannot move the crop or mask.
    let geometry = resolve_geometry(
        kernel,
        data,
        width as usize,
        height as usize,
        estimate,
        book_prior,
        summary.target_width_mm,
        summary.target_height_mm,
        settings.aspect_drift_threshold,
        settings.book_snap_max_drift_px,
    );

    let resolution = resolve_dpi(
        page.metadata_dpi,
        width,
        height,
        summary,
        settings.dpi_tolerance,
    );

    // Metrics over the crop region feed the audit trail verbatim.
    let skew_page = kernel.estimate_skew_angle(data, width as usize, height as usize);
    let (crop_data, crop_w, crop_h) = crop_region(&gray, &geometry.crop_box);
    let skew_refined = kernel.estimate_skew_angle(&crop_data, crop_w, crop_h);
    let baseline = kernel.baseline_metrics(&crop_data, crop_w, crop_h);
    let columns = kernel.column_metrics(&crop_data, crop_w, crop_h);

    // Shading model and shadow detection run on the original intensities.
    let model = IlluminationModel::fit(&gray);
    let residual_before = model.residual(&gray);
    let (shadow, spine_shadow_score) = detect_edge_shadow(&gray);

    let (output_gray, residual_after) = if settings.shading_enabled {
        let flattened = model.flatten(&gray);
        let residual = IlluminationModel::fit(&flattened).residual(&flattened);
        (flattened, residual)
    } else {
        (gray.clone(), residual_before)
    };
    let shading = ShadingCorrection {
        applied: settings.shading_enabled,
        residual_before,
        residual_after,
    };

    let (background_mean, background_std) = background_stats(&gray, &geometry.mask_box);
    let morphology = MorphologyCorrection {
        denoise: background_std > DENOISE_STD_FLOOR,
        contrast_boost: dynamic_range(&crop_data) < CONTRAST_RANGE_FLOOR,
        background_std,
    };

    let cropped = image::imageops::crop_imm(
        &output_gray,
        geometry.crop_box.x,
        geometry.crop_box.y,
        geometry.crop_box.width,
        geometry.crop_box.height,
    )
    .to_image();
    let dhash = kernel.dhash9x8(&downsample_9x8(&cropped));

    let output_path = write_normalized_png(run_dir, &page.id, &cropped)?;

    let dpi = resolution.dpi;
    let to_mm = |px: f64| px * MM_PER_INCH / dpi;
    let result = NormalizationResult {
        page_id: page.id.clone(),
        output_path,
        crop_box: geometry.crop_box,
        mask_box: geometry.mask_box,
        width_mm: to_mm(geometry.crop_box.width as f64),
        height_mm: to_mm(geometry.crop_box.height as f64),
        dpi,
        dpi_source: resolution.source,
        trim_mm: to_mm(estimate.map(|e| e.trim_px).unwrap_or(0) as f64),
        bleed_mm: to_mm(estimate.map(|e| e.bleed_px).unwrap_or(0) as f64),
        skew_angle: skew_page.angle,
        shadow,
        stats: PageStats {
            background_mean,
            background_std,
            mask_coverage: geometry.mask_coverage,
            skew_confidence: skew_refined.confidence,
            shadow_score: shadow.darkness,
            illumination_residual: residual_after,
            spine_shadow_score,
        },
        corrections: Corrections {
            alignment: Some(geometry.alignment),
            morphology: Some(morphology),
            baseline: Some(baseline),
            columns: Some(columns),
            book_snap: geometry.book_snap,
            skew_refined: Some(skew_refined),
            shading: Some(shading),
        },
        dhash,
    };

    write_sidecar(run_dir, &result)?;

    info!(
        page_id = %page.id,
        dpi = result.dpi,
        dpi_source = ?result.dpi_source,
        crop = ?result.crop_box,
        "page normalized"
    );
    Ok(result)
}

/// Copy the crop region into a contiguous buffer for the pixel kernels.
fn crop_region(gray: &GrayImage, crop: &PixelBox) -> (Vec<u8>, usize, usize) {
    let view = image::imageops::crop_imm(gray, crop.x, crop.y, crop.width, crop.height).to_image();
    let (w, h) = view.dimensions();
    (view.into_raw(), w as usize, h as usize)
}

/// Mean/std of the pixels outside the mask box; a mask that covers the whole
/// frame falls back to full-image statistics.
fn background_stats(gray: &GrayImage, mask: &PixelBox) -> (f64, f64) {
    let (width, height) = gray.dimensions();
    let mut sum = 0f64;
    let mut sq_sum = 0f64;
    let mut count = 0u64;
    for y in 0..height {
        for x in 0..width {
            let inside = x >= mask.x && x < mask.right() && y >= mask.y && y < mask.bottom();
            if inside {
                continue;
            }
            let v = gray.get_pixel(x, y).0[0] as f64;
            sum += v;
            sq_sum += v * v;
            count += 1;
        }
    }
    if count == 0 {
        for pixel in gray.pixels() {
            let v = pixel.0[0] as f64;
            sum += v;
            sq_sum += v * v;
            count += 1;
        }
    }
    if count == 0 {
        return (0.0, 0.0);
    }
    let mean = sum / count as f64;
    let variance = (sq_sum / count as f64 - mean * mean).max(0.0);
    (mean, variance.sqrt())
}

/// p95 − p5 of the intensity histogram.
fn dynamic_range(data: &[u8]) -> u32 {
    if data.is_empty() {
        return 0;
    }
    let mut histogram = [0u64; 256];
    for &v in data {
        histogram[v as usize] += 1;
    }
    let total = data.len() as u64;
    let percentile = |p: f64| -> u32 {
        let target = (total as f64 * p) as u64;
        let mut running = 0u64;
        for (value, &count) in histogram.iter().enumerate() {
            running += count;
            if running >= target {
                return value as u32;
            }
        }
        255
    };
    percentile(0.95).saturating_sub(percentile(0.05))
}

/// Area-mean downsample to the 9×8 grid the perceptual hash consumes.
fn downsample_9x8(gray: &GrayImage) -> Vec<u8> {
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 {
        return Vec::new();
    }
    let mut sample = vec![0u8; 9 * 8];
    for cy in 0..8u32 {
        for cx in 0..9u32 {
            let x0 = cx * width / 9;
            let x1 = ((cx + 1) * width / 9).max(x0 + 1).min(width);
            let y0 = cy * height / 8;
            let y1 = ((cy + 1) * height / 8).max(y0 + 1).min(height);

            let mut sum = 0u64;
            let mut count = 0u64;
            for y in y0..y1 {
                for x in x0..x1 {
                    sum += gray.get_pixel(x, y).0[0] as u64;
                    count += 1;
                }
            }
            sample[(cy * 9 + cx) as usize] = (sum / count.max(1)) as u8;
        }
    }
    sample
}

/// Write the normalized page under `<run_dir>/normalized/` atomically.
fn write_normalized_png(run_dir: &Path, page_id: &str, img: &GrayImage) -> Result<PathBuf> {
    let dir = run_dir.join("normalized");
    fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{page_id}.png"));
    let tmp = dir.join(format!(".{page_id}.png.tmp"));
    img.save_with_format(&tmp, ImageFormat::Png)
        .map_err(|err| BlattwerkError::Image(format!("encode {page_id}: {err}")))?;
    fs::rename(&tmp, &path)?;
    Ok(path)
}

/// Write the page sidecar under `<run_dir>/sidecars/` atomically.
fn write_sidecar(run_dir: &Path, result: &NormalizationResult) -> Result<()> {
    let dir = run_dir.join("sidecars");
    fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{}.json", result.page_id));
    let tmp = dir.join(format!(".{}.json.tmp", result.page_id));
    fs::write(&tmp, serde_json::to_vec_pretty(result)?)?;
    fs::rename(&tmp, &path)?;
    Ok(())
}
