// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Deterministic pixel-buffer primitives: projection profiles, gradient
// magnitude, skew estimation, baseline/column metrics, layout-element
// detection, and perceptual hashing.
//
// Two kernels implement the same interface. `ReferenceKernel` is the portable
// correctness oracle; `AcceleratedKernel` (feature `accelerated`) parallelizes
// the hot loops with rayon while preserving observable behavior. All sums over
// pixel data are integer-valued in f64, so results are bit-identical across
// kernels; the one float accumulation that is not (the gradient histogram) is
// folded in row order on both paths.

mod common;
pub mod reference;

#[cfg(feature = "accelerated")]
pub mod accelerated;

pub use blattwerk_core::types::{BaselineMetrics, ColumnMetrics, LayoutElement, SkewEstimate};

pub use reference::ReferenceKernel;

#[cfg(feature = "accelerated")]
pub use accelerated::AcceleratedKernel;

/// Pure functions over a single-channel pixel buffer plus its dimensions.
///
/// Contracts shared by every implementation:
/// - No hidden state: identical input bytes produce identical output on
///   every call.
/// - Degenerate input (zero width/height, or a buffer shorter than
///   `width * height`) returns empty or zero-valued results, never panics.
pub trait PixelKernel: Send + Sync {
    /// Per-row intensity sums.
    fn projection_profile_y(&self, data: &[u8], width: usize, height: usize) -> Vec<u32>;

    /// Per-column intensity sums.
    fn projection_profile_x(&self, data: &[u8], width: usize, height: usize) -> Vec<u32>;

    /// Sobel gradient magnitude, same dimensions as the input.
    fn sobel_magnitude(&self, data: &[u8], width: usize, height: usize) -> Vec<u16>;

    /// Dominant skew angle from the gradient-orientation histogram.
    /// Degenerate or edge-free input yields `{angle: 0, confidence: 0}`.
    fn estimate_skew_angle(&self, data: &[u8], width: usize, height: usize) -> SkewEstimate;

    /// Periodic text-line structure from row-intensity peaks.
    fn baseline_metrics(&self, data: &[u8], width: usize, height: usize) -> BaselineMetrics;

    /// Column bands from the column projection. Degenerate input yields
    /// `column_count = 0`; any valid image yields at least 1.
    fn column_metrics(&self, data: &[u8], width: usize, height: usize) -> ColumnMetrics;

    /// Detected layout elements. Non-degenerate input always includes a
    /// synthetic `page-bounds` element first.
    fn detect_layout_elements(&self, data: &[u8], width: usize, height: usize)
    -> Vec<LayoutElement>;

    /// Perceptual hash over a 9×8 downsample: 16 hex digits, or the sentinel
    /// `"0"` for degenerate input.
    fn dhash9x8(&self, data: &[u8]) -> String;
}

/// The kernel the rest of the system should use: accelerated when compiled
/// in, otherwise the portable reference.
pub fn default_kernel() -> &'static dyn PixelKernel {
    #[cfg(feature = "accelerated")]
    {
        static KERNEL: AcceleratedKernel = AcceleratedKernel;
        &KERNEL
    }
    #[cfg(not(feature = "accelerated"))]
    {
        static KERNEL: ReferenceKernel = ReferenceKernel;
        &KERNEL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_image(width: usize, height: usize) -> Vec<u8> {
        let mut data = vec![0u8; width * height];
        for y in 0..height {
            for x in 0..width {
                data[y * width + x] = ((x * 255) / width.max(1)) as u8;
            }
        }
        data
    }

    fn text_like_image(width: usize, height: usize) -> Vec<u8> {
        // White page with dark rows every 8 px, mimicking text lines.
        let mut data = vec![255u8; width * height];
        for y in (4..height).step_by(8) {
            for x in 2..width.saturating_sub(2) {
                data[y * width + x] = 20;
            }
        }
        data
    }

    #[test]
    fn baseline_metrics_is_deterministic() {
        let kernel = default_kernel();
        let data = text_like_image(64, 96);
        let a = kernel.baseline_metrics(&data, 64, 96);
        let b = kernel.baseline_metrics(&data, 64, 96);
        assert_eq!(a.text_line_count, b.text_line_count);
        assert_eq!(a.line_consistency, b.line_consistency);
        assert_eq!(a.peaks_y, b.peaks_y);
    }

    #[test]
    fn degenerate_input_is_safe_everywhere() {
        let kernel = default_kernel();

        // Zero-width buffer.
        let skew = kernel.estimate_skew_angle(&[], 0, 10);
        assert_eq!(skew.angle, 0.0);
        assert_eq!(skew.confidence, 0.0);
        assert_eq!(kernel.baseline_metrics(&[], 0, 10).text_line_count, 0);
        assert_eq!(kernel.column_metrics(&[], 0, 10).column_count, 0);
        assert!(kernel.detect_layout_elements(&[], 0, 10).is_empty());
        assert!(kernel.projection_profile_y(&[], 0, 10).is_empty());
        assert_eq!(kernel.dhash9x8(&[1, 2, 3]), "0");

        // Uniform-intensity image: no edge points.
        let uniform = vec![180u8; 40 * 40];
        let skew = kernel.estimate_skew_angle(&uniform, 40, 40);
        assert_eq!(skew.angle, 0.0);
        assert_eq!(skew.confidence, 0.0);
        let baseline = kernel.baseline_metrics(&uniform, 40, 40);
        assert_eq!(baseline.text_line_count, 0);
    }

    #[test]
    fn text_rows_produce_baseline_peaks() {
        let kernel = default_kernel();
        let data = text_like_image(64, 96);
        let metrics = kernel.baseline_metrics(&data, 64, 96);
        assert!(metrics.text_line_count >= 3);
        assert!(metrics.confidence > 0.0);
        assert!(metrics.spacing_norm > 0.0);
        assert!(metrics.peaks_y.iter().all(|y| (0.0..=1.0).contains(y)));
    }

    #[test]
    fn layout_elements_lead_with_page_bounds() {
        let kernel = default_kernel();
        let mut data = vec![255u8; 100 * 100];
        for y in 20..80 {
            for x in 30..70 {
                data[y * 100 + x] = 0;
            }
        }
        let elements = kernel.detect_layout_elements(&data, 100, 100);
        assert!(!elements.is_empty());
        assert_eq!(elements[0].id, "page-bounds");
        assert!(elements.iter().any(|e| e.kind == "text_block"));
    }

    #[test]
    fn dhash_gradient_is_stable_hex() {
        let kernel = default_kernel();
        let mut sample = vec![0u8; 9 * 8];
        for y in 0..8 {
            for x in 0..9 {
                sample[y * 9 + x] = (x * 16) as u8;
            }
        }
        let hash = kernel.dhash9x8(&sample);
        assert_eq!(hash.len(), 16);
        assert_ne!(hash, "0000000000000000");
        assert_eq!(hash, kernel.dhash9x8(&sample));
    }

    #[test]
    fn projection_profiles_match_expected_sums() {
        let kernel = default_kernel();
        let data = vec![10u8; 16];
        let rows = kernel.projection_profile_y(&data, 4, 4);
        let cols = kernel.projection_profile_x(&data, 4, 4);
        assert_eq!(rows, vec![40, 40, 40, 40]);
        assert_eq!(cols, vec![40, 40, 40, 40]);
    }

    #[cfg(feature = "accelerated")]
    mod parity {
        use super::*;

        fn assert_parity(data: &[u8], width: usize, height: usize) {
            let reference = ReferenceKernel;
            let accelerated = AcceleratedKernel;

            assert_eq!(
                reference.projection_profile_y(data, width, height),
                accelerated.projection_profile_y(data, width, height)
            );
            assert_eq!(
                reference.projection_profile_x(data, width, height),
                accelerated.projection_profile_x(data, width, height)
            );
            assert_eq!(
                reference.sobel_magnitude(data, width, height),
                accelerated.sobel_magnitude(data, width, height)
            );
            assert_eq!(
                reference.estimate_skew_angle(data, width, height),
                accelerated.estimate_skew_angle(data, width, height)
            );
            assert_eq!(
                reference.baseline_metrics(data, width, height),
                accelerated.baseline_metrics(data, width, height)
            );
            assert_eq!(
                reference.column_metrics(data, width, height),
                accelerated.column_metrics(data, width, height)
            );
            assert_eq!(
                reference.detect_layout_elements(data, width, height),
                accelerated.detect_layout_elements(data, width, height)
            );
        }

        #[test]
        fn kernels_agree_on_edge_cases() {
            assert_parity(&[], 0, 0);
            assert_parity(&[], 0, 32);
            assert_parity(&vec![128u8; 32 * 32], 32, 32);
        }

        #[test]
        fn kernels_agree_on_structured_input() {
            assert_parity(&gradient_image(48, 64), 48, 64);
            assert_parity(&text_like_image(48, 64), 48, 64);
        }

        #[test]
        fn kernels_agree_on_dhash() {
            let sample: Vec<u8> = (0..72).map(|i| (i * 3) as u8).collect();
            assert_eq!(
                ReferenceKernel.dhash9x8(&sample),
                AcceleratedKernel.dhash9x8(&sample)
            );
        }
    }
}
