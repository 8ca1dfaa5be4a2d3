//! Largest-Triangle-Three-Buckets downsampling
//!
//! Reduces a long, time-ordered series to a bounded number of points while
//! keeping the visually significant ones (spikes, bends). Runs in O(n).
//!
//! Reference: Sveinn Steinarsson, "Downsampling Time Series for Visual
//! Representation" (2013).

use crate::backend::RangeSeries;
use crate::models::SeriesPoint;

/// Downsample `points` to at most `max_points` entries
///
/// # Returns
/// * the input unchanged when `max_points == 0` or no reduction is needed
/// * exactly `max_points` points otherwise, always including the first and
///   last input points, in original order
pub fn downsample(points: Vec<SeriesPoint>, max_points: usize) -> Vec<SeriesPoint> {
    let len = points.len();
    if len == 0 || max_points == 0 || len <= max_points {
        return points;
    }

    match max_points {
        1 => return vec![points[0].clone()],
        2 => return vec![points[0].clone(), points[len - 1].clone()],
        _ => {}
    }

    let xs: Vec<f64> = points.iter().map(|p| p.timestamp as f64).collect();
    let ys: Vec<f64> = points.iter().map(SeriesPoint::numeric).collect();

    let bucket_count = max_points - 2;
    let interior = len - 2;
    let bucket_bound = |i: usize| i * interior / bucket_count + 1;

    let mut selected = Vec::with_capacity(max_points);
    selected.push(0);
    let mut prev = 0;

    for i in 0..bucket_count {
        let start = bucket_bound(i);
        let end = bucket_bound(i + 1);

        // Anchor: centroid of the next bucket, or the final point alone
        let next_end = if i + 1 < bucket_count {
            bucket_bound(i + 2)
        } else {
            len
        };
        let next_start = if i + 1 < bucket_count { end } else { len - 1 };
        let (anchor_x, anchor_y) = centroid(&xs[next_start..next_end], &ys[next_start..next_end]);

        let (prev_x, prev_y) = (xs[prev], ys[prev]);
        let mut max_area = -1.0;
        let mut chosen = start;

        for j in start..end {
            let area = ((prev_x - anchor_x) * (ys[j] - prev_y)
                - (prev_x - xs[j]) * (anchor_y - prev_y))
                .abs();
            if area > max_area {
                max_area = area;
                chosen = j;
            }
        }

        selected.push(chosen);
        prev = chosen;
    }

    selected.push(len - 1);

    let mut keep = selected.into_iter().peekable();
    points
        .into_iter()
        .enumerate()
        .filter_map(|(idx, point)| {
            if keep.peek() == Some(&idx) {
                keep.next();
                Some(point)
            } else {
                None
            }
        })
        .collect()
}

/// Downsample every series of a range query result in place
pub fn downsample_series(series: &mut [RangeSeries], max_points: usize) {
    for s in series.iter_mut() {
        let values = std::mem::take(&mut s.values);
        s.values = downsample(values, max_points);
    }
}

fn centroid(xs: &[f64], ys: &[f64]) -> (f64, f64) {
    let n = xs.len() as f64;
    let sum_x: f64 = xs.iter().sum();
    let sum_y: f64 = ys.iter().sum();
    (sum_x / n, sum_y / n)
}
