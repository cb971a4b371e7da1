//! PCA projection for the reference engine.
//!
//! Training centers the data, diagonalizes the covariance with cyclic Jacobi
//! rotations and keeps the `d_out` leading eigenvectors as projection rows.

use std::any::Any;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::index::traits::{EngineFailure, EngineResult, VectorTransform};

const JACOBI_SWEEPS: usize = 64;

#[derive(Debug, Clone)]
pub struct PcaMatrix {
    d_in: usize,
    d_out: usize,
    eigen_power: f32,
    random_rotation: bool,
    seed: u64,
    mean: Vec<f32>,
    /// `d_out` rows of `d_in` coefficients, empty until trained.
    projection: Vec<f32>,
    eigenvalues: Vec<f32>,
}

impl PcaMatrix {
    pub fn new(d_in: usize, d_out: usize, eigen_power: f32, random_rotation: bool, seed: u64) -> EngineResult<Self> {
        if d_out == 0 || d_out > d_in {
            return Err(EngineFailure::new(format!(
                "PCA output dimension must be in 1..={d_in}, got {d_out}"
            )));
        }
        Ok(Self {
            d_in,
            d_out,
            eigen_power,
            random_rotation,
            seed,
            mean: Vec::new(),
            projection: Vec::new(),
            eigenvalues: Vec::new(),
        })
    }

    pub fn eigen_power(&self) -> f32 {
        self.eigen_power
    }

    pub fn random_rotation(&self) -> bool {
        self.random_rotation
    }

    /// Covariance eigenvalues of the kept components, largest first.
    pub fn eigenvalues(&self) -> &[f32] {
        &self.eigenvalues
    }

    fn rotate(&mut self) {
        let m = self.d_out;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut rotation: Vec<f64> = Vec::with_capacity(m * m);
        while rotation.len() < m * m {
            let mut row: Vec<f64> = (0..m).map(|_| rng.gen_range(-1.0..1.0)).collect();
            for prev in rotation.chunks_exact(m) {
                let dot: f64 = row.iter().zip(prev).map(|(a, b)| a * b).sum();
                row.iter_mut().zip(prev).for_each(|(a, b)| *a -= dot * b);
            }
            let norm = row.iter().map(|v| v * v).sum::<f64>().sqrt();
            if norm > 1e-6 {
                rotation.extend(row.iter().map(|v| v / norm));
            }
        }

        let d = self.d_in;
        let mut rotated = vec![0.0f32; m * d];
        for (i, r) in rotation.chunks_exact(m).enumerate() {
            for (j, &w) in r.iter().enumerate() {
                for c in 0..d {
                    rotated[i * d + c] += (w * f64::from(self.projection[j * d + c])) as f32;
                }
            }
        }
        self.projection = rotated;
    }
}

/// Eigen-decomposition of the symmetric `d * d` matrix `a`. Returns the
/// eigenvalues and the matrix whose column `i` is the `i`-th eigenvector.
fn symmetric_eigen(mut a: Vec<f64>, d: usize) -> (Vec<f64>, Vec<f64>) {
    let mut v = vec![0.0f64; d * d];
    for i in 0..d {
        v[i * d + i] = 1.0;
    }

    for _ in 0..JACOBI_SWEEPS {
        let off: f64 = (0..d)
            .flat_map(|p| (0..d).filter(move |&q| q != p).map(move |q| (p, q)))
            .map(|(p, q)| a[p * d + q] * a[p * d + q])
            .sum();
        if off < 1e-24 {
            break;
        }
        for p in 0..d {
            for q in p + 1..d {
                let apq = a[p * d + q];
                if apq.abs() < 1e-300 {
                    continue;
                }
                let theta = (a[q * d + q] - a[p * d + p]) / (2.0 * apq);
                let t = if theta == 0.0 {
                    1.0
                } else {
                    theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt())
                };
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;
                for k in 0..d {
                    let (akp, akq) = (a[k * d + p], a[k * d + q]);
                    a[k * d + p] = c * akp - s * akq;
                    a[k * d + q] = s * akp + c * akq;
                }
                for k in 0..d {
                    let (apk, aqk) = (a[p * d + k], a[q * d + k]);
                    a[p * d + k] = c * apk - s * aqk;
                    a[q * d + k] = s * apk + c * aqk;
                }
                for k in 0..d {
                    let (vkp, vkq) = (v[k * d + p], v[k * d + q]);
                    v[k * d + p] = c * vkp - s * vkq;
                    v[k * d + q] = s * vkp + c * vkq;
                }
            }
        }
    }

    ((0..d).map(|i| a[i * d + i]).collect(), v)
}

impl VectorTransform for PcaMatrix {
    fn d_in(&self) -> usize {
        self.d_in
    }

    fn d_out(&self) -> usize {
        self.d_out
    }

    fn is_trained(&self) -> bool {
        !self.projection.is_empty()
    }

    fn train(&mut self, n: usize, x: &[f32]) -> EngineResult<()> {
        let d = self.d_in;
        if n == 0 || x.len() < n * d {
            return Err(EngineFailure::new("PCA training needs at least one vector"));
        }
        let rows = || x.chunks_exact(d).take(n);

        let mut mean = vec![0.0f64; d];
        for row in rows() {
            mean.iter_mut().zip(row).for_each(|(m, &v)| *m += f64::from(v));
        }
        mean.iter_mut().for_each(|m| *m /= n as f64);

        let mut cov = vec![0.0f64; d * d];
        let mut centered = vec![0.0f64; d];
        for row in rows() {
            for (c, (&v, m)) in centered.iter_mut().zip(row.iter().zip(&mean)) {
                *c = f64::from(v) - m;
            }
            for i in 0..d {
                for j in i..d {
                    cov[i * d + j] += centered[i] * centered[j];
                }
            }
        }
        for i in 0..d {
            for j in i..d {
                cov[i * d + j] /= n as f64;
                cov[j * d + i] = cov[i * d + j];
            }
        }

        let (values, vectors) = symmetric_eigen(cov, d);
        let mut order: Vec<usize> = (0..d).collect();
        order.sort_by(|&a, &b| values[b].total_cmp(&values[a]));

        let power = f64::from(self.eigen_power);
        let mut projection = Vec::with_capacity(self.d_out * d);
        let mut kept = Vec::with_capacity(self.d_out);
        for &col in order.iter().take(self.d_out) {
            let value = values[col].max(0.0);
            let scale = if power == 0.0 {
                1.0
            } else {
                (value + f64::EPSILON).powf(power)
            };
            projection.extend((0..d).map(|r| (vectors[r * d + col] * scale) as f32));
            kept.push(value as f32);
        }

        self.mean = mean.into_iter().map(|m| m as f32).collect();
        self.projection = projection;
        self.eigenvalues = kept;
        if self.random_rotation {
            self.rotate();
        }
        debug!(d_in = d, d_out = self.d_out, n, "trained PCA matrix");
        Ok(())
    }

    fn apply(&self, n: usize, x: &[f32]) -> EngineResult<Vec<f32>> {
        if !self.is_trained() {
            return Err(EngineFailure::new("PCA matrix is not trained"));
        }
        let d = self.d_in;
        let mut out = Vec::with_capacity(n * self.d_out);
        for row in x.chunks_exact(d).take(n) {
            for coeffs in self.projection.chunks_exact(d) {
                let dot: f32 = coeffs
                    .iter()
                    .zip(row.iter().zip(&self.mean))
                    .map(|(w, (v, m))| w * (v - m))
                    .sum();
                out.push(dot);
            }
        }
        Ok(out)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
