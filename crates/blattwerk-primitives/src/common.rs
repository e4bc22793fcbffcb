// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Shared post-processing for both kernels. Each routine consumes intermediate
// sums or histograms produced by a kernel's (serial or parallel) pixel loops,
// so that the two kernels cannot drift apart in the decision logic.

use blattwerk_core::types::{BaselineMetrics, ColumnMetrics, LayoutElement, SkewEstimate};

/// Sobel X kernel, row-major 3×3.
pub const SOBEL_X: [i32; 9] = [-1, 0, 1, -2, 0, 2, -1, 0, 1];
/// Sobel Y kernel, row-major 3×3.
pub const SOBEL_Y: [i32; 9] = [1, 2, 1, 0, 0, 0, -1, -2, -1];

/// Gradient magnitudes below this do not vote in the orientation histogram.
pub const GRADIENT_VOTE_FLOOR: f64 = 10.0;

/// Whether the buffer cannot cover a `width × height` image.
pub fn is_degenerate(data: &[u8], width: usize, height: usize) -> bool {
    width == 0 || height == 0 || data.len() < width * height
}

/// Sobel response at an interior pixel `(x, y)`.
#[inline]
pub fn sobel_at(data: &[u8], width: usize, x: usize, y: usize) -> (i32, i32) {
    let mut sum_x = 0i32;
    let mut sum_y = 0i32;
    let mut k = 0usize;
    for ky in 0..3 {
        let row = (y + ky - 1) * width;
        for kx in 0..3 {
            let value = data[row + x + kx - 1] as i32;
            sum_x += SOBEL_X[k] * value;
            sum_y += SOBEL_Y[k] * value;
            k += 1;
        }
    }
    (sum_x, sum_y)
}

/// 181-bucket orientation histogram contribution for one interior row.
pub fn gradient_histogram_row(data: &[u8], width: usize, y: usize) -> [f64; 181] {
    let mut histogram = [0f64; 181];
    for x in 1..width - 1 {
        let (sum_x, sum_y) = sobel_at(data, width, x, y);
        let magnitude = ((sum_x * sum_x + sum_y * sum_y) as f64).sqrt();
        if magnitude < GRADIENT_VOTE_FLOOR {
            continue;
        }
        let angle = (sum_y as f64).atan2(sum_x as f64).to_degrees();
        let bucket = (angle + 90.0).round().clamp(0.0, 180.0) as usize;
        histogram[bucket] += magnitude;
    }
    histogram
}

/// Weighted-mean skew estimate around the dominant histogram bucket.
pub fn skew_from_histogram(histogram: &[f64; 181], width: usize, height: usize) -> SkewEstimate {
    let mut best_bucket = 90usize;
    let mut best_val = 0f64;
    for (idx, val) in histogram.iter().enumerate() {
        if *val > best_val {
            best_val = *val;
            best_bucket = idx;
        }
    }

    // Weighted mean over a ±3 bucket window around the dominant orientation.
    let window = 3i32;
    let start = (best_bucket as i32 - window).max(0) as usize;
    let end = (best_bucket as i32 + window).min(180) as usize;
    let mut num = 0f64;
    let mut den = 0f64;
    for (idx, weight) in histogram.iter().enumerate().take(end + 1).skip(start) {
        num += (idx as f64 - 90.0) * weight;
        den += *weight;
    }

    let angle = if den > 0.0 { num / den } else { 0.0 };
    let confidence = (best_val / ((width * height) as f64 * 4.0)).min(1.0);
    SkewEstimate { angle, confidence }
}

/// Median of a pre-sorted slice; 0.0 when empty.
fn sorted_median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

fn sort_unstable_total(values: &mut [f64]) {
    values.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
}

/// Baseline metrics from inverted per-row intensity sums.
///
/// Peaks are local maxima above `mean + 0.6·std`; spacing statistics are the
/// median and MAD of normalized peak gaps; confidence blends spacing
/// regularity, peak sharpness, and peak count.
pub fn baseline_from_row_sums(row_sums: &[f64], height: usize) -> BaselineMetrics {
    let count = row_sums.len().max(1) as f64;
    let mean = row_sums.iter().sum::<f64>() / count;
    let variance = row_sums.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / count;
    let std = variance.sqrt();

    let line_consistency = if mean > 0.0 {
        (1.0 - (std / (mean * 2.0)).min(1.0)).max(0.0)
    } else {
        0.0
    };

    let threshold = mean + std * 0.6;
    let mut peaks: Vec<usize> = Vec::new();
    let mut sharpness_sum = 0f64;
    let mut sharpness_count = 0f64;
    for y in 1..row_sums.len().saturating_sub(1) {
        if row_sums[y] > threshold && row_sums[y] > row_sums[y - 1] && row_sums[y] > row_sums[y + 1]
        {
            peaks.push(y);
            let neighbor_avg = 0.5 * (row_sums[y - 1] + row_sums[y + 1]);
            if std > 0.0 {
                sharpness_sum += (row_sums[y] - neighbor_avg) / std;
                sharpness_count += 1.0;
            }
        }
    }
    let peak_sharpness = if sharpness_count > 0.0 {
        sharpness_sum / sharpness_count
    } else {
        0.0
    };

    let mut spacing_norm = 0.0;
    let mut spacing_mad_norm = 0.0;
    let mut offset_norm = 0.0;
    if peaks.len() > 1 && height > 1 {
        let span = (height - 1) as f64;
        let mut deltas: Vec<f64> = peaks
            .windows(2)
            .map(|pair| (pair[1] - pair[0]) as f64 / span)
            .collect();
        sort_unstable_total(&mut deltas);
        spacing_norm = sorted_median(&deltas);

        let mut mad: Vec<f64> = deltas.iter().map(|d| (d - spacing_norm).abs()).collect();
        sort_unstable_total(&mut mad);
        spacing_mad_norm = sorted_median(&mad);

        if spacing_norm > 0.0 {
            let mut offsets: Vec<f64> = peaks
                .iter()
                .map(|y| (*y as f64 / span) % spacing_norm)
                .collect();
            sort_unstable_total(&mut offsets);
            offset_norm = sorted_median(&offsets);
        }
    }

    let peak_count_score = ((peaks.len() as f64 - 2.0) / 8.0).clamp(0.0, 1.0);
    let spacing_score = if spacing_norm > 0.0 {
        (1.0 - (spacing_mad_norm / spacing_norm).min(1.0)).max(0.0)
    } else {
        0.0
    };
    let sharpness_score = (peak_sharpness / 3.0).clamp(0.0, 1.0);
    let confidence =
        (0.4 * spacing_score + 0.35 * sharpness_score + 0.25 * peak_count_score).clamp(0.0, 1.0);

    let peaks_y: Vec<f64> = if height > 1 {
        peaks
            .iter()
            .map(|y| *y as f64 / ((height - 1) as f64))
            .collect()
    } else {
        Vec::new()
    };

    BaselineMetrics {
        line_consistency,
        text_line_count: peaks.len() as u32,
        spacing_norm,
        spacing_mad_norm,
        offset_norm,
        angle_deg: 0.0,
        confidence,
        peak_sharpness,
        peaks_y,
    }
}

/// Column metrics from inverted per-column intensity sums: count contiguous
/// bands above `mean + 0.7·std`; any valid image reports at least one column.
pub fn columns_from_col_sums(col_sums: &[f64]) -> ColumnMetrics {
    let count = col_sums.len().max(1) as f64;
    let mean = col_sums.iter().sum::<f64>() / count;
    let variance = col_sums.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / count;
    let std = variance.sqrt();

    let threshold = mean + std * 0.7;
    let mut bands = 0u32;
    let mut in_band = false;
    for &val in col_sums {
        if val > threshold {
            if !in_band {
                bands += 1;
                in_band = true;
            }
        } else {
            in_band = false;
        }
    }

    ColumnMetrics {
        column_count: bands.max(1),
        column_separation: std,
    }
}

/// Layout elements from the dark-pixel bounding box `(min_x, min_y, max_x,
/// max_y)` (or `None` when nothing fell below the threshold).
pub fn layout_from_content_box(
    content: Option<(usize, usize, usize, usize)>,
    width: usize,
    height: usize,
) -> Vec<LayoutElement> {
    let (x0, y0, x1, y1) = match content {
        Some((min_x, min_y, max_x, max_y)) => {
            (min_x as f64, min_y as f64, max_x as f64, max_y as f64)
        }
        None => (0.0, 0.0, (width - 1) as f64, (height - 1) as f64),
    };

    let content_width = (x1 - x0).max(1.0);
    let content_height = (y1 - y0).max(1.0);
    let make_box = |fx0: f64, fy0: f64, fx1: f64, fy1: f64| -> [f64; 4] {
        [
            (x0 + content_width * fx0).clamp(0.0, (width - 1) as f64),
            (y0 + content_height * fy0).clamp(0.0, (height - 1) as f64),
            (x0 + content_width * fx1).clamp(0.0, (width - 1) as f64),
            (y0 + content_height * fy1).clamp(0.0, (height - 1) as f64),
        ]
    };
    let element = |id: &str, kind: &str, bbox: [f64; 4], confidence: f64| LayoutElement {
        id: id.to_string(),
        kind: kind.to_string(),
        bbox,
        confidence,
    };

    vec![
        element(
            "page-bounds",
            "page_bounds",
            [0.0, 0.0, (width - 1) as f64, (height - 1) as f64],
            0.6,
        ),
        element("text-block", "text_block", [x0, y0, x1, y1], 0.55),
        element("title", "title", make_box(0.12, 0.02, 0.88, 0.14), 0.28),
        element(
            "running-head",
            "running_head",
            make_box(0.1, 0.0, 0.9, 0.08),
            0.25,
        ),
        element("folio", "folio", make_box(0.42, 0.9, 0.58, 0.98), 0.22),
        element(
            "ornament",
            "ornament",
            make_box(0.42, 0.18, 0.58, 0.24),
            0.2,
        ),
        element(
            "drop-cap",
            "drop_cap",
            make_box(0.02, 0.18, 0.1, 0.32),
            0.18,
        ),
        element(
            "footnote",
            "footnote",
            make_box(0.05, 0.86, 0.95, 0.98),
            0.2,
        ),
        element(
            "marginalia",
            "marginalia",
            make_box(0.0, 0.25, 0.08, 0.75),
            0.18,
        ),
    ]
}

/// Mean and standard deviation of a byte slice. Sums stay integer-valued in
/// f64, so the result does not depend on accumulation order.
pub fn mean_std(data: &[u8]) -> (f64, f64) {
    if data.is_empty() {
        return (0.0, 0.0);
    }
    let count = data.len() as f64;
    let sum: f64 = data.iter().map(|v| *v as f64).sum();
    let mean = sum / count;
    let sq_sum: f64 = data.iter().map(|v| (*v as f64) * (*v as f64)).sum();
    let variance = (sq_sum / count - mean * mean).max(0.0);
    (mean, variance.sqrt())
}

/// 64-bit dhash over a 9×8 sample: each bit compares a pixel against its
/// right-hand neighbor.
pub fn dhash_bits(sample: &[u8]) -> u64 {
    let mut hash = 0u64;
    let mut bit = 0u64;
    for y in 0..8 {
        for x in 0..8 {
            let left = sample[y * 9 + x];
            let right = sample[y * 9 + x + 1];
            if left < right {
                hash |= 1u64 << bit;
            }
            bit += 1;
        }
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorted_median_even_and_odd() {
        assert_eq!(sorted_median(&[1.0, 2.0, 3.0]), 2.0);
        assert_eq!(sorted_median(&[1.0, 2.0, 3.0, 4.0]), 2.5);
        assert_eq!(sorted_median(&[]), 0.0);
    }

    #[test]
    fn columns_uniform_sums_yield_single_band() {
        let metrics = columns_from_col_sums(&[100.0; 12]);
        assert_eq!(metrics.column_count, 1);
        assert_eq!(metrics.column_separation, 0.0);
    }

    #[test]
    fn columns_two_bands_detected() {
        let mut sums = vec![0.0; 20];
        for x in 2..6 {
            sums[x] = 500.0;
        }
        for x in 12..16 {
            sums[x] = 500.0;
        }
        let metrics = columns_from_col_sums(&sums);
        assert_eq!(metrics.column_count, 2);
    }

    #[test]
    fn mean_std_of_uniform_is_zero_spread() {
        let (mean, std) = mean_std(&[42u8; 100]);
        assert_eq!(mean, 42.0);
        assert_eq!(std, 0.0);
    }

    #[test]
    fn dhash_bits_all_flat_is_zero() {
        assert_eq!(dhash_bits(&[7u8; 72]), 0);
    }
}
