// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Shading correction: a coarse-grid background-illumination model plus a
// spine-shadow edge-band model. Fitting is read-only; flattening produces a
// new image, so geometry computed beforehand is never disturbed.

use image::{GrayImage, Luma};
use imageproc::filter::gaussian_blur_f32;
use tracing::debug;

use blattwerk_core::types::{ShadowReport, ShadowSide};

/// Tile edge length for the background grid, in pixels.
const TILE_PX: usize = 32;

/// Minimum per-column darkness (relative to the interior background) for a
/// column to count as shadowed.
const SHADOW_DARKNESS_FLOOR: f64 = 0.06;

/// An edge shadow wider than this fraction of the page is implausible and
/// capped.
const SHADOW_MAX_BAND_FRACTION: f64 = 0.15;

/// Confidence floor for reporting a shadow as present.
const SHADOW_PRESENT_FLOOR: f64 = 0.3;

/// Smooth background-illumination estimate over a coarse tile grid.
#[derive(Debug, Clone)]
pub struct IlluminationModel {
    grid: GrayImage,
    width: u32,
    height: u32,
    global_mean: f32,
}

impl IlluminationModel {
    /// Fit the model: per-tile intensity means, gaussian-smoothed.
    pub fn fit(gray: &GrayImage) -> Self {
        let (width, height) = gray.dimensions();
        let grid_w = (width as usize).div_ceil(TILE_PX).max(1) as u32;
        let grid_h = (height as usize).div_ceil(TILE_PX).max(1) as u32;

        let mut grid = GrayImage::new(grid_w, grid_h);
        let mut total = 0f64;
        for ty in 0..grid_h {
            for tx in 0..grid_w {
                let x0 = tx * TILE_PX as u32;
                let y0 = ty * TILE_PX as u32;
                let x1 = (x0 + TILE_PX as u32).min(width);
                let y1 = (y0 + TILE_PX as u32).min(height);

                let mut sum = 0u64;
                let mut count = 0u64;
                for y in y0..y1 {
                    for x in x0..x1 {
                        sum += gray.get_pixel(x, y).0[0] as u64;
                        count += 1;
                    }
                }
                let mean = if count > 0 {
                    (sum as f64 / count as f64).round() as u8
                } else {
                    128
                };
                grid.put_pixel(tx, ty, Luma([mean]));
                total += mean as f64;
            }
        }
        let global_mean = (total / (grid_w as f64 * grid_h as f64)) as f32;

        let smoothed = gaussian_blur_f32(&grid, 1.0);
        debug!(grid_w, grid_h, global_mean, "illumination model fitted");
        Self {
            grid: smoothed,
            width,
            height,
            global_mean,
        }
    }

    /// Bilinear background estimate at a pixel.
    pub fn background_at(&self, x: u32, y: u32) -> f32 {
        let (grid_w, grid_h) = self.grid.dimensions();
        let fx = ((x as f32 + 0.5) / TILE_PX as f32 - 0.5).clamp(0.0, (grid_w - 1) as f32);
        let fy = ((y as f32 + 0.5) / TILE_PX as f32 - 0.5).clamp(0.0, (grid_h - 1) as f32);

        let x0 = fx.floor() as u32;
        let y0 = fy.floor() as u32;
        let x1 = (x0 + 1).min(grid_w - 1);
        let y1 = (y0 + 1).min(grid_h - 1);
        let tx = fx - x0 as f32;
        let ty = fy - y0 as f32;

        let sample = |gx: u32, gy: u32| self.grid.get_pixel(gx, gy).0[0] as f32;
        let top = sample(x0, y0) * (1.0 - tx) + sample(x1, y0) * tx;
        let bottom = sample(x0, y1) * (1.0 - tx) + sample(x1, y1) * tx;
        top * (1.0 - ty) + bottom * ty
    }

    /// Mean absolute deviation of the image from its modeled background,
    /// normalized to [0, 1].
    pub fn residual(&self, gray: &GrayImage) -> f64 {
        let (width, height) = gray.dimensions();
        if width == 0 || height == 0 || width != self.width || height != self.height {
            return 0.0;
        }
        let mut sum = 0f64;
        for y in 0..height {
            for x in 0..width {
                let bg = self.background_at(x, y);
                sum += (gray.get_pixel(x, y).0[0] as f32 - bg).abs() as f64;
            }
        }
        sum / (width as f64 * height as f64 * 255.0)
    }

    /// Flatten illumination: shift each pixel by the difference between the
    /// global mean and the local background.
    pub fn flatten(&self, gray: &GrayImage) -> GrayImage {
        let (width, height) = gray.dimensions();
        let mut out = GrayImage::new(width, height);
        for y in 0..height {
            for x in 0..width {
                let bg = self.background_at(x, y);
                let value = gray.get_pixel(x, y).0[0] as f32 + (self.global_mean - bg);
                out.put_pixel(x, y, Luma([value.clamp(0.0, 255.0) as u8]));
            }
        }
        out
    }
}

/// Measure edge shadows (typically the spine side of a bound scan).
///
/// Returns the report for the stronger side plus a spine-shadow score in
/// [0, 1]. A page without a qualifying band reports `present = false`.
pub fn detect_edge_shadow(gray: &GrayImage) -> (ShadowReport, f64) {
    let (width, height) = gray.dimensions();
    if width < 8 || height == 0 {
        return (ShadowReport::absent(), 0.0);
    }

    let mut col_means = vec![0f64; width as usize];
    for (x, mean) in col_means.iter_mut().enumerate() {
        let mut sum = 0u64;
        for y in 0..height {
            sum += gray.get_pixel(x as u32, y).0[0] as u64;
        }
        *mean = sum as f64 / height as f64;
    }

    // Interior background: central half of the columns.
    let q = width as usize / 4;
    let interior = &col_means[q..width as usize - q];
    let interior_mean = interior.iter().sum::<f64>() / interior.len().max(1) as f64;

    let max_band = ((width as f64 * SHADOW_MAX_BAND_FRACTION) as usize).max(1);
    let darkness_floor = SHADOW_DARKNESS_FLOOR * 255.0;

    let measure = |columns: &mut dyn Iterator<Item = usize>| -> (u32, f64) {
        let mut band_width = 0u32;
        let mut darkness_sum = 0f64;
        for x in columns.take(max_band) {
            let darkness = interior_mean - col_means[x];
            if darkness < darkness_floor {
                break;
            }
            band_width += 1;
            darkness_sum += darkness;
        }
        if band_width == 0 {
            (0, 0.0)
        } else {
            (band_width, darkness_sum / band_width as f64 / 255.0)
        }
    };

    let (left_width, left_darkness) = measure(&mut (0..width as usize));
    let (right_width, right_darkness) = measure(&mut (0..width as usize).rev());

    let score = |band_width: u32, darkness: f64| -> f64 {
        if band_width == 0 {
            return 0.0;
        }
        let width_score = (band_width as f64 / (width as f64 * 0.04)).min(1.0);
        let darkness_score = (darkness / 0.15).min(1.0);
        darkness_score * width_score
    };
    let left_score = score(left_width, left_darkness);
    let right_score = score(right_width, right_darkness);

    let (side, band_width, darkness, confidence) = if left_score >= right_score {
        (ShadowSide::Left, left_width, left_darkness, left_score)
    } else {
        (ShadowSide::Right, right_width, right_darkness, right_score)
    };

    let present = confidence >= SHADOW_PRESENT_FLOOR;
    let report = ShadowReport {
        present,
        side: present.then_some(side),
        width_px: band_width,
        confidence,
        darkness,
    };
    (report, confidence)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Page with a left-to-right illumination ramp.
    fn ramped_page(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, _| {
            Luma([(120 + (x * 100 / width.max(1))) as u8])
        })
    }

    #[test]
    fn flatten_reduces_illumination_residual() {
        let gray = ramped_page(256, 256);
        let model = IlluminationModel::fit(&gray);
        let before = model.residual(&gray);

        let flattened = model.flatten(&gray);
        let remodeled = IlluminationModel::fit(&flattened);
        let after = remodeled.residual(&flattened);

        assert!(before > 0.0);
        assert!(after <= before);
    }

    #[test]
    fn uniform_page_has_negligible_residual() {
        let gray = GrayImage::from_pixel(128, 128, Luma([200u8]));
        let model = IlluminationModel::fit(&gray);
        assert!(model.residual(&gray) < 1e-6);
    }

    #[test]
    fn left_spine_shadow_is_detected() {
        let width = 200u32;
        let gray = GrayImage::from_fn(width, 100, |x, _| {
            if x < 14 { Luma([90u8]) } else { Luma([220u8]) }
        });
        let (report, score) = detect_edge_shadow(&gray);
        assert!(report.present);
        assert_eq!(report.side, Some(ShadowSide::Left));
        assert!(report.width_px >= 10);
        assert!(score >= SHADOW_PRESENT_FLOOR);
    }

    #[test]
    fn clean_page_reports_no_shadow() {
        let gray = GrayImage::from_pixel(200, 100, Luma([220u8]));
        let (report, score) = detect_edge_shadow(&gray);
        assert!(!report.present);
        assert!(report.side.is_none());
        assert_eq!(score, 0.0);
    }
}
