// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Portable reference kernel. Serial, dependency-free, and the correctness
// oracle for the accelerated kernel.

use blattwerk_core::types::{BaselineMetrics, ColumnMetrics, LayoutElement, SkewEstimate};

use crate::PixelKernel;
use crate::common;

/// Serial implementation of every pixel primitive.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceKernel;

impl PixelKernel for ReferenceKernel {
    fn projection_profile_y(&self, data: &[u8], width: usize, height: usize) -> Vec<u32> {
        if common::is_degenerate(data, width, height) {
            return Vec::new();
        }
        let mut rows = vec![0u32; height];
        for (y, row) in rows.iter_mut().enumerate() {
            let offset = y * width;
            let mut sum = 0u32;
            for x in 0..width {
                sum += data[offset + x] as u32;
            }
            *row = sum;
        }
        rows
    }

    fn projection_profile_x(&self, data: &[u8], width: usize, height: usize) -> Vec<u32> {
        if common::is_degenerate(data, width, height) {
            return Vec::new();
        }
        let mut cols = vec![0u32; width];
        for y in 0..height {
            let offset = y * width;
            for (x, col) in cols.iter_mut().enumerate() {
                *col += data[offset + x] as u32;
            }
        }
        cols
    }

    fn sobel_magnitude(&self, data: &[u8], width: usize, height: usize) -> Vec<u16> {
        if common::is_degenerate(data, width, height) || width < 3 || height < 3 {
            return vec![0u16; width.saturating_mul(height)];
        }
        let mut out = vec![0u16; width * height];
        for y in 1..height - 1 {
            for x in 1..width - 1 {
                let (sum_x, sum_y) = common::sobel_at(data, width, x, y);
                out[y * width + x] = ((sum_x * sum_x + sum_y * sum_y) as f64).sqrt() as u16;
            }
        }
        out
    }

    fn estimate_skew_angle(&self, data: &[u8], width: usize, height: usize) -> SkewEstimate {
        if common::is_degenerate(data, width, height) || width < 3 || height < 3 {
            return SkewEstimate::zero();
        }
        let mut histogram = [0f64; 181];
        for y in 1..height - 1 {
            let row = common::gradient_histogram_row(data, width, y);
            for (bucket, value) in histogram.iter_mut().zip(row.iter()) {
                *bucket += value;
            }
        }
        common::skew_from_histogram(&histogram, width, height)
    }

    fn baseline_metrics(&self, data: &[u8], width: usize, height: usize) -> BaselineMetrics {
        if common::is_degenerate(data, width, height) {
            return BaselineMetrics::zero();
        }
        let mut row_sums = vec![0f64; height];
        for (y, row_sum) in row_sums.iter_mut().enumerate() {
            let offset = y * width;
            let mut sum = 0f64;
            for x in 0..width {
                sum += 255f64 - data[offset + x] as f64;
            }
            *row_sum = sum;
        }
        common::baseline_from_row_sums(&row_sums, height)
    }

    fn column_metrics(&self, data: &[u8], width: usize, height: usize) -> ColumnMetrics {
        if common::is_degenerate(data, width, height) {
            return ColumnMetrics::zero();
        }
        let mut col_sums = vec![0f64; width];
        for y in 0..height {
            let offset = y * width;
            for (x, col) in col_sums.iter_mut().enumerate() {
                *col += 255f64 - data[offset + x] as f64;
            }
        }
        common::columns_from_col_sums(&col_sums)
    }

    fn detect_layout_elements(
        &self,
        data: &[u8],
        width: usize,
        height: usize,
    ) -> Vec<LayoutElement> {
        if common::is_degenerate(data, width, height) {
            return Vec::new();
        }

        let (mean, std) = common::mean_std(&data[..width * height]);
        let threshold = (mean - std * 0.5).clamp(10.0, 245.0);

        let mut min_x = width;
        let mut min_y = height;
        let mut max_x = 0usize;
        let mut max_y = 0usize;
        let mut found = false;
        for y in 0..height {
            let offset = y * width;
            for x in 0..width {
                if (data[offset + x] as f64) < threshold {
                    found = true;
                    min_x = min_x.min(x);
                    min_y = min_y.min(y);
                    max_x = max_x.max(x);
                    max_y = max_y.max(y);
                }
            }
        }

        let content = found.then_some((min_x, min_y, max_x, max_y));
        common::layout_from_content_box(content, width, height)
    }

    fn dhash9x8(&self, data: &[u8]) -> String {
        if data.len() < 9 * 8 {
            return "0".to_string();
        }
        format!("{:016x}", common::dhash_bits(&data[..9 * 8]))
    }
}
