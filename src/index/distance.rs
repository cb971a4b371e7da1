//! Distance kernels used by the reference engine and the clustering
//! orchestrator.

use crate::types::MetricType;

/// Squared Euclidean distance.
#[inline]
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

#[inline]
pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Number of differing bits between two packed codes.
#[inline]
pub fn hamming(a: &[u8], b: &[u8]) -> i32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x ^ y).count_ones() as i32)
        .sum()
}

/// Float distance under `metric`. Hamming is not defined for floats and
/// falls back to L2.
#[inline]
pub fn float_distance(metric: MetricType, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        MetricType::InnerProduct => inner_product(a, b),
        MetricType::L2 | MetricType::Hamming => l2_squared(a, b),
    }
}

/// Whether `a` ranks strictly ahead of `b` under `metric`.
#[inline]
pub fn is_closer<D: PartialOrd>(metric: MetricType, a: D, b: D) -> bool {
    if metric.is_similarity() {
        a > b
    } else {
        a < b
    }
}
