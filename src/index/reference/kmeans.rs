//! Lloyd's k-means with k-means++ seeding, used to train inverted-file
//! quantizers and to serve single-shot clustering requests.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::index::distance::l2_squared;
use crate::index::traits::{EngineFailure, EngineResult};

/// Index of the nearest centroid and its squared distance.
pub(crate) fn nearest(d: usize, point: &[f32], centroids: &[f32]) -> (usize, f32) {
    centroids
        .chunks_exact(d)
        .enumerate()
        .map(|(c, centroid)| (c, l2_squared(point, centroid)))
        .fold((0, f32::INFINITY), |best, cur| if cur.1 < best.1 { cur } else { best })
}

fn kmeans_plus_plus(d: usize, x: &[f32], k: usize, rng: &mut StdRng) -> Vec<f32> {
    let n = x.len() / d;
    let mut centroids = Vec::with_capacity(k * d);
    let first = rng.gen_range(0..n);
    centroids.extend_from_slice(&x[first * d..(first + 1) * d]);

    let mut min_dist: Vec<f32> = x
        .chunks_exact(d)
        .map(|p| l2_squared(p, &centroids[..d]))
        .collect();

    while centroids.len() < k * d {
        let total: f64 = min_dist.iter().map(|&v| f64::from(v)).sum();
        let pick = if total <= 0.0 {
            rng.gen_range(0..n)
        } else {
            let mut target = rng.gen::<f64>() * total;
            let mut chosen = n - 1;
            for (i, &v) in min_dist.iter().enumerate() {
                target -= f64::from(v);
                if target <= 0.0 {
                    chosen = i;
                    break;
                }
            }
            chosen
        };
        let start = centroids.len();
        centroids.extend_from_slice(&x[pick * d..(pick + 1) * d]);
        let newest = &centroids[start..start + d];
        for (i, p) in x.chunks_exact(d).enumerate() {
            let dist = l2_squared(p, newest);
            if dist < min_dist[i] {
                min_dist[i] = dist;
            }
        }
    }
    centroids
}

/// Train `k` centroids over `x` (`n * d` floats). Returns the centroids and
/// the total squared quantization error of the final assignment.
pub(crate) fn train(d: usize, x: &[f32], k: usize, niter: usize, seed: u64) -> EngineResult<(Vec<f32>, f32)> {
    let n = if d == 0 { 0 } else { x.len() / d };
    if k == 0 {
        return Err(EngineFailure::new("number of clusters must be positive"));
    }
    if n < k {
        return Err(EngineFailure::new(format!(
            "Number of training points ({n}) should be at least as large as number of clusters ({k})"
        )));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut centroids = kmeans_plus_plus(d, x, k, &mut rng);
    let mut assign = vec![0usize; n];
    let mut obj = 0.0f32;

    for _ in 0..niter.max(1) {
        obj = 0.0;
        for (i, p) in x.chunks_exact(d).enumerate() {
            let (c, dist) = nearest(d, p, &centroids);
            assign[i] = c;
            obj += dist;
        }

        let mut sums = vec![0.0f32; k * d];
        let mut counts = vec![0usize; k];
        for (i, p) in x.chunks_exact(d).enumerate() {
            let c = assign[i];
            counts[c] += 1;
            for (s, v) in sums[c * d..(c + 1) * d].iter_mut().zip(p) {
                *s += v;
            }
        }
        for c in 0..k {
            let slot = &mut centroids[c * d..(c + 1) * d];
            if counts[c] == 0 {
                let pick = rng.gen_range(0..n);
                slot.copy_from_slice(&x[pick * d..(pick + 1) * d]);
                continue;
            }
            let inv = 1.0 / counts[c] as f32;
            for (dst, s) in slot.iter_mut().zip(&sums[c * d..(c + 1) * d]) {
                *dst = s * inv;
            }
        }
    }

    Ok((centroids, obj))
}
