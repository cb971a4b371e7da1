//! k-means training orchestration.
//!
//! [`kmeans_clustering`] is the single-shot entry: validate, hand the data to
//! the engine, return centroids and the mean quantization error.
//! [`Clustering`] runs the iterations itself, with restarts, frozen and
//! integer centroids, spherical normalization and an optional accelerating
//! index for the nearest-centroid assignment step.

use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::{QuiverError, Result};
use crate::index::reference::kmeans::nearest;
use crate::index::traits::VectorEngine;
use crate::index::FloatIndex;
use crate::metrics;

/// Relative perturbation applied when splitting a cluster to refill an empty
/// one.
const SPLIT_EPS: f32 = 1.0 / 1024.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringParameters {
    pub niter: usize,
    /// Independent restarts; the lowest-error run is kept.
    pub nredo: usize,
    /// Log every iteration at `info` instead of `debug`.
    pub verbose: bool,
    /// Normalize centroids to unit length after each update.
    pub spherical: bool,
    /// Round centroid coordinates to integers.
    pub int_centroids: bool,
    /// Retrain the accelerating index on the centroids every iteration.
    pub update_index: bool,
    /// Keep the caller-provided centroids fixed.
    pub frozen_centroids: bool,
    pub min_points_per_centroid: usize,
    pub max_points_per_centroid: usize,
    pub seed: u64,
    /// Training points per search call when an accelerating index performs
    /// the assignment step.
    pub decode_block_size: usize,
}

impl Default for ClusteringParameters {
    fn default() -> Self {
        Self {
            niter: 25,
            nredo: 1,
            verbose: false,
            spherical: false,
            int_centroids: false,
            update_index: false,
            frozen_centroids: false,
            min_points_per_centroid: 39,
            max_points_per_centroid: 256,
            seed: 1234,
            decode_block_size: 32768,
        }
    }
}

/// Statistics for one k-means iteration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IterationStats {
    /// Total squared quantization error of the assignment.
    pub obj: f32,
    /// `k * sum(size^2) / n^2`; `1.0` means perfectly balanced clusters.
    pub imbalance_factor: f64,
    /// Empty clusters refilled by splitting a populated one.
    pub nsplit: usize,
}

/// Stateful k-means trainer over `d`-dimensional float vectors.
#[derive(Debug, Clone)]
pub struct Clustering {
    d: usize,
    k: usize,
    params: ClusteringParameters,
    centroids: Vec<f32>,
    iteration_stats: Vec<IterationStats>,
    mean_error: Option<f32>,
}

impl Clustering {
    pub fn new(d: usize, k: usize) -> Result<Self> {
        Self::with_params(d, k, ClusteringParameters::default())
    }

    pub fn with_params(d: usize, k: usize, params: ClusteringParameters) -> Result<Self> {
        if d == 0 {
            return Err(QuiverError::invalid("dimension must be positive"));
        }
        if k == 0 {
            return Err(QuiverError::invalid("number of clusters must be positive"));
        }
        Ok(Self {
            d,
            k,
            params,
            centroids: Vec::new(),
            iteration_stats: Vec::new(),
            mean_error: None,
        })
    }

    pub fn d(&self) -> usize {
        self.d
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn params(&self) -> &ClusteringParameters {
        &self.params
    }

    /// Centroids after training, or the seeds set with
    /// [`Clustering::set_centroids`] before it.
    pub fn centroids(&self) -> &[f32] {
        &self.centroids
    }

    /// Per-iteration statistics across every restart, in run order.
    pub fn iteration_stats(&self) -> &[IterationStats] {
        &self.iteration_stats
    }

    /// Mean squared quantization error of the kept run.
    pub fn mean_error(&self) -> Option<f32> {
        self.mean_error
    }

    /// Seed the first `centroids.len() / d` centroids. With
    /// `frozen_centroids` they stay fixed during training.
    pub fn set_centroids(&mut self, centroids: &[f32]) -> Result<()> {
        if centroids.len() % self.d != 0 || centroids.len() / self.d > self.k {
            return Err(QuiverError::invalid(format!(
                "expected at most {} seed centroids of dimension {}, got {} floats",
                self.k,
                self.d,
                centroids.len()
            )));
        }
        self.centroids = centroids.to_vec();
        Ok(())
    }

    /// Train on `x`. When `index` is given, it performs the assignment step:
    /// it is reset and loaded with the current centroids every iteration, and
    /// holds the kept centroids afterwards.
    #[instrument(skip_all, fields(d = self.d, k = self.k, n = x.len() / self.d))]
    pub fn train(&mut self, x: &[f32], mut index: Option<&mut FloatIndex>) -> Result<()> {
        let d = self.d;
        let k = self.k;
        if x.is_empty() || x.len() % d != 0 {
            return Err(QuiverError::DimensionMismatch {
                expected: d,
                actual: x.len(),
            });
        }
        if let Some(index) = index.as_deref() {
            if index.d() != d {
                return Err(QuiverError::DimensionMismatch {
                    expected: d,
                    actual: index.d(),
                });
            }
        }

        let n_input = self.centroids.len() / d;
        if self.params.frozen_centroids && n_input == 0 {
            return Err(QuiverError::invalid(
                "frozen_centroids requires seed centroids",
            ));
        }
        let n_frozen = if self.params.frozen_centroids { n_input } else { 0 };

        let mut n = x.len() / d;
        if n < k {
            return Err(QuiverError::invalid(format!(
                "Number of training points ({n}) should be at least as large as number of clusters ({k})"
            )));
        }
        if n < k.saturating_mul(self.params.min_points_per_centroid) {
            warn!(
                n,
                k,
                min_points_per_centroid = self.params.min_points_per_centroid,
                "too few training points per centroid"
            );
        }

        let subsampled;
        let mut x = x;
        let cap = k.saturating_mul(self.params.max_points_per_centroid);
        if self.params.max_points_per_centroid > 0 && n > cap {
            warn!(n, cap, "sampling training points down to max_points_per_centroid * k");
            let mut rng = StdRng::seed_from_u64(self.params.seed);
            let mut picks = sample(&mut rng, n, cap).into_vec();
            picks.sort_unstable();
            subsampled = picks
                .iter()
                .flat_map(|&i| x[i * d..(i + 1) * d].iter().copied())
                .collect::<Vec<_>>();
            x = &subsampled;
            n = cap;
        }

        let seeds = self.centroids.clone();
        self.iteration_stats.clear();
        let mut best: Option<(f32, Vec<f32>)> = None;

        for redo in 0..self.params.nredo.max(1) {
            let mut rng = StdRng::seed_from_u64(self.params.seed.wrapping_add(redo as u64));
            let mut centroids = initial_centroids(d, k, x, &seeds, &mut rng);
            self.postprocess(&mut centroids, n_frozen);

            let mut obj = 0.0f32;
            for iter in 0..self.params.niter.max(1) {
                let (assign, dist) = self.assign(x, &centroids, index.as_deref_mut())?;
                obj = dist.iter().sum();

                let (sums, mut counts) = accumulate(d, k, x, &assign);
                for c in n_frozen..k {
                    if counts[c] > 0 {
                        let inv = 1.0 / counts[c] as f32;
                        for (dst, s) in centroids[c * d..(c + 1) * d].iter_mut().zip(&sums[c * d..(c + 1) * d]) {
                            *dst = s * inv;
                        }
                    }
                }
                let nsplit = split_clusters(d, k, n_frozen, &mut centroids, &mut counts, &mut rng);
                self.postprocess(&mut centroids, n_frozen);

                let stats = IterationStats {
                    obj,
                    imbalance_factor: imbalance_factor(&counts),
                    nsplit,
                };
                if self.params.verbose {
                    info!(redo, iter, obj, imbalance = stats.imbalance_factor, nsplit, "k-means iteration");
                } else {
                    debug!(redo, iter, obj, imbalance = stats.imbalance_factor, nsplit, "k-means iteration");
                }
                self.iteration_stats.push(stats);
            }

            if best.as_ref().is_none_or(|(best_obj, _)| obj < *best_obj) {
                debug!(redo, obj, "new best k-means run");
                best = Some((obj, centroids));
            }
        }

        let (obj, centroids) = best.ok_or_else(|| QuiverError::invalid("no k-means run completed"))?;
        if let Some(index) = index {
            load_centroids(index, &centroids, self.params.update_index)?;
        }
        self.centroids = centroids;
        self.mean_error = Some(obj / n as f32);
        metrics::KMEANS_RUNS_TOTAL.with_label_values(&["orchestrated"]).inc();
        Ok(())
    }

    fn assign(&self, x: &[f32], centroids: &[f32], index: Option<&mut FloatIndex>) -> Result<(Vec<usize>, Vec<f32>)> {
        let d = self.d;
        let Some(index) = index else {
            return Ok(x.chunks_exact(d).map(|p| nearest(d, p, centroids)).unzip());
        };

        load_centroids(index, centroids, self.params.update_index)?;
        let block = self.params.decode_block_size.max(1).saturating_mul(d);
        let mut assign = Vec::with_capacity(x.len() / d);
        let mut dist = Vec::with_capacity(x.len() / d);
        for chunk in x.chunks(block) {
            let result = index.search(chunk, 1)?;
            for &label in &result.labels {
                if label < 0 || label as usize >= self.k {
                    return Err(QuiverError::Engine(format!(
                        "accelerating index returned label {label} for {} centroids",
                        self.k
                    )));
                }
                assign.push(label as usize);
            }
            dist.extend(result.distances);
        }
        Ok((assign, dist))
    }

    fn postprocess(&self, centroids: &mut [f32], n_frozen: usize) {
        for c in centroids.chunks_exact_mut(self.d).skip(n_frozen) {
            if self.params.spherical {
                let norm = c.iter().map(|v| v * v).sum::<f32>().sqrt();
                if norm > 0.0 {
                    c.iter_mut().for_each(|v| *v /= norm);
                }
            }
            if self.params.int_centroids {
                c.iter_mut().for_each(|v| *v = v.round());
            }
        }
    }
}

fn load_centroids(index: &mut FloatIndex, centroids: &[f32], retrain: bool) -> Result<()> {
    index.reset()?;
    if retrain || !index.is_trained() {
        index.train(centroids)?;
    }
    index.add(centroids)
}

/// Seeds first, then distinct random training points.
fn initial_centroids(d: usize, k: usize, x: &[f32], seeds: &[f32], rng: &mut StdRng) -> Vec<f32> {
    let n = x.len() / d;
    let mut centroids = Vec::with_capacity(k * d);
    centroids.extend_from_slice(seeds);
    let missing = k - seeds.len() / d;
    for i in sample(rng, n, missing).into_iter() {
        centroids.extend_from_slice(&x[i * d..(i + 1) * d]);
    }
    centroids
}

fn accumulate(d: usize, k: usize, x: &[f32], assign: &[usize]) -> (Vec<f32>, Vec<usize>) {
    let mut sums = vec![0.0f32; k * d];
    let mut counts = vec![0usize; k];
    for (p, &c) in x.chunks_exact(d).zip(assign) {
        counts[c] += 1;
        for (s, v) in sums[c * d..(c + 1) * d].iter_mut().zip(p) {
            *s += v;
        }
    }
    (sums, counts)
}

/// Refill empty clusters by splitting large ones in two, picking the donor
/// with probability proportional to its size.
fn split_clusters(
    d: usize,
    k: usize,
    n_frozen: usize,
    centroids: &mut [f32],
    counts: &mut [usize],
    rng: &mut StdRng,
) -> usize {
    let mut nsplit = 0;
    for ci in n_frozen..k {
        if counts[ci] != 0 {
            continue;
        }
        let spare: usize = counts.iter().map(|&c| c.saturating_sub(1)).sum();
        if spare == 0 {
            break;
        }
        let mut p = rng.gen_range(0..spare);
        let mut cj = 0;
        for (j, &c) in counts.iter().enumerate() {
            let w = c.saturating_sub(1);
            if p < w {
                cj = j;
                break;
            }
            p -= w;
        }

        let donor: Vec<f32> = centroids[cj * d..(cj + 1) * d].to_vec();
        for (j, v) in donor.iter().enumerate() {
            let (a, b) = if j % 2 == 0 {
                (v * (1.0 + SPLIT_EPS), v * (1.0 - SPLIT_EPS))
            } else {
                (v * (1.0 - SPLIT_EPS), v * (1.0 + SPLIT_EPS))
            };
            centroids[ci * d + j] = a;
            if cj >= n_frozen {
                centroids[cj * d + j] = b;
            }
        }
        counts[ci] = counts[cj] / 2;
        counts[cj] -= counts[ci];
        nsplit += 1;
    }
    nsplit
}

fn imbalance_factor(counts: &[usize]) -> f64 {
    let total: f64 = counts.iter().map(|&c| c as f64).sum();
    if total == 0.0 {
        return 0.0;
    }
    let squares: f64 = counts.iter().map(|&c| (c as f64) * (c as f64)).sum();
    squares * counts.len() as f64 / (total * total)
}

/// Single-shot k-means through the engine. Returns `k * d` centroids and the
/// mean quantization error.
pub fn kmeans_clustering(
    engine: &dyn VectorEngine,
    d: usize,
    n: usize,
    k: usize,
    x: &[f32],
) -> Result<(Vec<f32>, f32)> {
    if n * d != x.len() {
        return Err(QuiverError::invalid(format!(
            "expected n * d = {} floats, got {}",
            n * d,
            x.len()
        )));
    }
    if k == 0 {
        return Err(QuiverError::invalid("number of clusters must be positive"));
    }
    let result = engine.kmeans_clustering(d, n, k, x)?;
    metrics::KMEANS_RUNS_TOTAL.with_label_values(&["single"]).inc();
    Ok(result)
}

/// Multi-restart k-means, optionally seeded with `initial_centroids` and
/// accelerated by `index`. Returns the trained [`Clustering`].
pub fn run_kmeans_advanced(
    d: usize,
    k: usize,
    params: ClusteringParameters,
    x: &[f32],
    initial_centroids: Option<&[f32]>,
    index: Option<&mut FloatIndex>,
) -> Result<Clustering> {
    let mut clustering = Clustering::with_params(d, k, params)?;
    if let Some(seeds) = initial_centroids {
        clustering.set_centroids(seeds)?;
    }
    clustering.train(x, index)?;
    Ok(clustering)
}
