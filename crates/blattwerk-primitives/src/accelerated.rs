// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Accelerated kernel: rayon row-parallel pixel loops feeding the same shared
// post-processing as the reference kernel. Per-row results are combined in
// row order, so output is bit-identical run to run (and, for the
// integer-valued sums, identical to the reference kernel).

use blattwerk_core::types::{BaselineMetrics, ColumnMetrics, LayoutElement, SkewEstimate};
use rayon::prelude::*;

use crate::PixelKernel;
use crate::common;

/// Data-parallel implementation of every pixel primitive.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceleratedKernel;

impl PixelKernel for AcceleratedKernel {
    fn projection_profile_y(&self, data: &[u8], width: usize, height: usize) -> Vec<u32> {
        if common::is_degenerate(data, width, height) {
            return Vec::new();
        }
        data[..width * height]
            .par_chunks_exact(width)
            .map(|row| row.iter().map(|&v| v as u32).sum())
            .collect()
    }

    fn projection_profile_x(&self, data: &[u8], width: usize, height: usize) -> Vec<u32> {
        if common::is_degenerate(data, width, height) {
            return Vec::new();
        }
        // Column sums via per-row partial vectors, reduced elementwise.
        // u32 addition is associative, so the reduce order is irrelevant.
        data[..width * height]
            .par_chunks_exact(width)
            .fold(
                || vec![0u32; width],
                |mut acc, row| {
                    for (a, &v) in acc.iter_mut().zip(row) {
                        *a += v as u32;
                    }
                    acc
                },
            )
            .reduce(
                || vec![0u32; width],
                |mut a, b| {
                    for (x, v) in a.iter_mut().zip(b) {
                        *x += v;
                    }
                    a
                },
            )
    }

    fn sobel_magnitude(&self, data: &[u8], width: usize, height: usize) -> Vec<u16> {
        if common::is_degenerate(data, width, height) || width < 3 || height < 3 {
            return vec![0u16; width.saturating_mul(height)];
        }
        let mut out = vec![0u16; width * height];
        out.par_chunks_exact_mut(width)
            .enumerate()
            .filter(|(y, _)| *y >= 1 && *y < height - 1)
            .for_each(|(y, row)| {
                for x in 1..width - 1 {
                    let (sum_x, sum_y) = common::sobel_at(data, width, x, y);
                    row[x] = ((sum_x * sum_x + sum_y * sum_y) as f64).sqrt() as u16;
                }
            });
        out
    }

    fn estimate_skew_angle(&self, data: &[u8], width: usize, height: usize) -> SkewEstimate {
        if common::is_degenerate(data, width, height) || width < 3 || height < 3 {
            return SkewEstimate::zero();
        }
        // Per-row histograms in parallel, folded sequentially in row order so
        // the float accumulation matches the reference kernel exactly.
        let rows: Vec<[f64; 181]> = (1..height - 1)
            .into_par_iter()
            .map(|y| common::gradient_histogram_row(data, width, y))
            .collect();
        let mut histogram = [0f64; 181];
        for row in rows {
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
        let row_sums: Vec<f64> = data[..width * height]
            .par_chunks_exact(width)
            .map(|row| row.iter().map(|&v| 255f64 - v as f64).sum())
            .collect();
        common::baseline_from_row_sums(&row_sums, height)
    }

    fn column_metrics(&self, data: &[u8], width: usize, height: usize) -> ColumnMetrics {
        if common::is_degenerate(data, width, height) {
            return ColumnMetrics::zero();
        }
        // Inverted column sums stay integer-valued in f64, so elementwise
        // reduction order cannot change the result.
        let col_sums = data[..width * height]
            .par_chunks_exact(width)
            .fold(
                || vec![0f64; width],
                |mut acc, row| {
                    for (a, &v) in acc.iter_mut().zip(row) {
                        *a += 255f64 - v as f64;
                    }
                    acc
                },
            )
            .reduce(
                || vec![0f64; width],
                |mut a, b| {
                    for (x, v) in a.iter_mut().zip(b) {
                        *x += v;
                    }
                    a
                },
            );
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

        // Per-row dark-pixel extents; min/max reduction is order-independent.
        let content = data[..width * height]
            .par_chunks_exact(width)
            .enumerate()
            .filter_map(|(y, row)| {
                let mut min_x = None;
                let mut max_x = 0usize;
                for (x, &v) in row.iter().enumerate() {
                    if (v as f64) < threshold {
                        min_x.get_or_insert(x);
                        max_x = x;
                    }
                }
                min_x.map(|min_x| (min_x, y, max_x, y))
            })
            .reduce_with(|a, b| (a.0.min(b.0), a.1.min(b.1), a.2.max(b.2), a.3.max(b.3)));

        common::layout_from_content_box(content, width, height)
    }

    fn dhash9x8(&self, data: &[u8]) -> String {
        if data.len() < 9 * 8 {
            return "0".to_string();
        }
        format!("{:016x}", common::dhash_bits(&data[..9 * 8]))
    }
}
