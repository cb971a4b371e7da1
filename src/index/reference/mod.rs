//! Pure-Rust vector engine.
//!
//! Understands a small subset of composition descriptions:
//!
//! | description     | structure                          |
//! |-----------------|------------------------------------|
//! | `Flat`          | exhaustive float index             |
//! | `IVF<n>,Flat`   | float inverted file, `n` lists     |
//! | `IVF<n>`        | same as `IVF<n>,Flat`              |
//! | `BFlat`         | exhaustive binary index            |
//! | `BIVF<n>`       | binary inverted file, `n` lists    |
//!
//! Any description may be prefixed with `IDMap,` or `IDMap2,` to wrap the
//! structure in an identifier map (the `2` form can also reconstruct). The
//! wrapped structure stays reachable as the sub-index.
//!
//! Besides indexes the engine trains PCA transforms ([`PcaMatrix`]).

pub mod devices;
pub(crate) mod kmeans;
mod pca;
mod storage;

pub use devices::EmulatedDevices;
pub use pca::PcaMatrix;
pub use storage::{ReferenceIndex, Scalar};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::index::traits::{EngineFailure, EngineResult, NativeIndex, VectorEngine, VectorTransform};
use crate::types::MetricType;
use storage::{IdMapMode, InvertedList, IvfLayout, Layout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Structure {
    Flat,
    Ivf(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Description {
    id_map: Option<IdMapMode>,
    structure: Structure,
}

fn parse_error(description: &str) -> EngineFailure {
    EngineFailure::new(format!("could not parse index description: {description}"))
}

fn parse_nlist(raw: &str, description: &str) -> EngineResult<usize> {
    match raw.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(parse_error(description)),
    }
}

fn parse_description(description: &str, binary: bool) -> EngineResult<Description> {
    let trimmed = description.trim();
    let (id_map, body) = if let Some(rest) = trimmed.strip_prefix("IDMap2,") {
        (Some(IdMapMode::Reversible), rest)
    } else if let Some(rest) = trimmed.strip_prefix("IDMap,") {
        (Some(IdMapMode::Plain), rest)
    } else {
        (None, trimmed)
    };

    let structure = if binary {
        match body {
            "BFlat" => Structure::Flat,
            _ => match body.strip_prefix("BIVF") {
                Some(n) => Structure::Ivf(parse_nlist(n, description)?),
                None => return Err(parse_error(description)),
            },
        }
    } else {
        match body {
            "Flat" => Structure::Flat,
            _ => match body
                .strip_prefix("IVF")
                .map(|r| r.strip_suffix(",Flat").unwrap_or(r))
            {
                Some(n) => Structure::Ivf(parse_nlist(n, description)?),
                None => return Err(parse_error(description)),
            },
        }
    };
    Ok(Description { id_map, structure })
}

/// The reference engine. `train_iterations` and `seed` drive k-means for
/// every structure it builds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReferenceEngine {
    pub train_iterations: usize,
    pub seed: u64,
}

impl Default for ReferenceEngine {
    fn default() -> Self {
        Self {
            train_iterations: 10,
            seed: 1234,
        }
    }
}

impl ReferenceEngine {
    pub fn new(train_iterations: usize, seed: u64) -> Self {
        Self {
            train_iterations,
            seed,
        }
    }

    fn build<T: Scalar>(&self, d: usize, metric: MetricType, desc: Description) -> ReferenceIndex<T> {
        let layout = match desc.structure {
            Structure::Flat => Layout::Flat(InvertedList::default()),
            Structure::Ivf(nlist) => Layout::Ivf(IvfLayout::new(nlist)),
        };
        ReferenceIndex::new(d, metric, layout, desc.id_map, self.train_iterations, self.seed)
    }
}

impl VectorEngine for ReferenceEngine {
    fn index_factory(
        &self,
        d: usize,
        description: &str,
        metric: MetricType,
    ) -> EngineResult<Box<dyn NativeIndex<f32>>> {
        if metric == MetricType::Hamming {
            return Err(EngineFailure::new("hamming metric requires a binary index"));
        }
        let desc = parse_description(description, false)?;
        debug!(d, description, ?desc, "reference engine building float index");
        Ok(Box::new(self.build::<f32>(d, metric, desc)))
    }

    fn binary_index_factory(&self, d: usize, description: &str) -> EngineResult<Box<dyn NativeIndex<u8>>> {
        if d % 8 != 0 {
            return Err(EngineFailure::new(format!(
                "binary index dimension must be a multiple of 8, got {d}"
            )));
        }
        let desc = parse_description(description, true)?;
        debug!(d, description, ?desc, "reference engine building binary index");
        Ok(Box::new(self.build::<u8>(d, MetricType::Hamming, desc)))
    }

    fn read_index(&self, bytes: &[u8]) -> EngineResult<Box<dyn NativeIndex<f32>>> {
        let index: ReferenceIndex<f32> = bincode::deserialize(bytes)
            .map_err(|e| EngineFailure::new(format!("failed to read index: {e}")))?;
        Ok(Box::new(index))
    }

    fn read_binary_index(&self, bytes: &[u8]) -> EngineResult<Box<dyn NativeIndex<u8>>> {
        let index: ReferenceIndex<u8> = bincode::deserialize(bytes)
            .map_err(|e| EngineFailure::new(format!("failed to read binary index: {e}")))?;
        Ok(Box::new(index))
    }

    fn kmeans_clustering(&self, d: usize, n: usize, k: usize, x: &[f32]) -> EngineResult<(Vec<f32>, f32)> {
        let (centroids, obj) = kmeans::train(d, &x[..(n * d).min(x.len())], k, self.train_iterations, self.seed)?;
        Ok((centroids, obj / n.max(1) as f32))
    }

    fn pca_matrix(
        &self,
        d_in: usize,
        d_out: usize,
        eigen_power: f32,
        random_rotation: bool,
    ) -> EngineResult<Box<dyn VectorTransform>> {
        let pca = PcaMatrix::new(d_in, d_out, eigen_power, random_rotation, self.seed)?;
        Ok(Box::new(pca))
    }
}

