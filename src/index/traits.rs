//! Contract between the core and the vector engine that owns the actual
//! index structures.
//!
//! The core never inspects engine internals. It calls through these traits and
//! forwards engine diagnostics verbatim. Capability casts (is this index an
//! inverted file?) are expressed as `Option`-returning accessors: `None` means
//! the capability does not apply.

use std::any::Any;
use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::params::SearchParams;
use crate::selector::IdSelector;
use crate::types::{DirectMapType, MetricType, RangeSearchResult, SearchResult, StructuralKind, VectorId};

/// Failure reported by the engine. `message` is the engine's own diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineFailure {
    pub message: String,
}

impl EngineFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn unsupported(operation: &str) -> Self {
        Self::new(format!("{operation} not implemented for this type of index"))
    }
}

impl std::fmt::Display for EngineFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineFailure>;

mod sealed {
    pub trait Sealed {}
    impl Sealed for f32 {}
    impl Sealed for u8 {}
}

/// Element type of stored vectors: `f32` for float indexes, `u8` (packed
/// bits) for binary indexes.
pub trait Component:
    sealed::Sealed + Copy + Default + PartialEq + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Distance type reported by searches over this component.
    type Distance: Copy + PartialOrd + Debug + Send + Sync + Serialize + DeserializeOwned + 'static;

    /// Tag written into serialized envelopes.
    const TAG: u8;
    const NAME: &'static str;

    /// Number of elements one vector of dimension `d` occupies.
    fn code_len(d: usize) -> usize;

    fn create_native(
        engine: &dyn VectorEngine,
        d: usize,
        description: &str,
        metric: MetricType,
    ) -> EngineResult<Box<dyn NativeIndex<Self>>>;

    fn read_native(engine: &dyn VectorEngine, bytes: &[u8]) -> EngineResult<Box<dyn NativeIndex<Self>>>;
}

impl Component for f32 {
    type Distance = f32;
    const TAG: u8 = 1;
    const NAME: &'static str = "float";

    fn code_len(d: usize) -> usize {
        d
    }

    fn create_native(
        engine: &dyn VectorEngine,
        d: usize,
        description: &str,
        metric: MetricType,
    ) -> EngineResult<Box<dyn NativeIndex<f32>>> {
        engine.index_factory(d, description, metric)
    }

    fn read_native(engine: &dyn VectorEngine, bytes: &[u8]) -> EngineResult<Box<dyn NativeIndex<f32>>> {
        engine.read_index(bytes)
    }
}

impl Component for u8 {
    type Distance = i32;
    const TAG: u8 = 2;
    const NAME: &'static str = "binary";

    fn code_len(d: usize) -> usize {
        d / 8
    }

    fn create_native(
        engine: &dyn VectorEngine,
        d: usize,
        description: &str,
        metric: MetricType,
    ) -> EngineResult<Box<dyn NativeIndex<u8>>> {
        if metric != MetricType::Hamming {
            return Err(EngineFailure::new(format!(
                "binary indexes only support the hamming metric, got {metric}"
            )));
        }
        engine.binary_index_factory(d, description)
    }

    fn read_native(engine: &dyn VectorEngine, bytes: &[u8]) -> EngineResult<Box<dyn NativeIndex<u8>>> {
        engine.read_binary_index(bytes)
    }
}

/// An engine-owned index structure.
///
/// Vectors are passed as flat slices of `n * T::code_len(d)` elements.
pub trait NativeIndex<T: Component>: Send + Sync {
    fn d(&self) -> usize;

    fn metric(&self) -> MetricType;

    fn is_trained(&self) -> bool;

    fn ntotal(&self) -> usize;

    fn kind(&self) -> StructuralKind;

    /// Bytes held by stored codes, identifiers and quantizer state.
    fn size(&self) -> usize;

    fn train(&mut self, n: usize, x: &[T]) -> EngineResult<()>;

    fn add(&mut self, n: usize, x: &[T]) -> EngineResult<()>;

    fn add_with_ids(&mut self, n: usize, x: &[T], ids: &[VectorId]) -> EngineResult<()>;

    /// k-NN search. `params` carries an optional selector and, for inverted
    /// files, the per-query `nprobe` / `max_codes`.
    fn search(
        &self,
        n: usize,
        x: &[T],
        k: usize,
        params: Option<&SearchParams<'_>>,
    ) -> EngineResult<SearchResult<T::Distance>>;

    fn range_search(
        &self,
        _n: usize,
        _x: &[T],
        _radius: T::Distance,
    ) -> EngineResult<RangeSearchResult<T::Distance>> {
        Err(EngineFailure::unsupported("range_search"))
    }

    fn reset(&mut self) -> EngineResult<()>;

    /// Remove every vector the selector accepts; returns the count removed.
    fn remove_ids(&mut self, selector: &IdSelector) -> EngineResult<usize>;

    /// Stored codes for `id`, or `None` when absent or not retained.
    fn reconstruct(&self, _id: VectorId) -> EngineResult<Option<Vec<T>>> {
        Ok(None)
    }

    fn merge_from(&mut self, _other: &mut dyn NativeIndex<T>, _add_id: VectorId) -> EngineResult<()> {
        Err(EngineFailure::unsupported("merge_from"))
    }

    fn set_parameter(&mut self, name: &str, _value: f64) -> EngineResult<()> {
        Err(EngineFailure::new(format!("unknown parameter: {name}")))
    }

    fn serialize(&self) -> EngineResult<Vec<u8>> {
        Err(EngineFailure::unsupported("serialize"))
    }

    /// The index wrapped by a composite such as an identifier map.
    fn sub_index(&self) -> Option<&dyn NativeIndex<T>> {
        None
    }

    fn sub_index_mut(&mut self) -> Option<&mut dyn NativeIndex<T>> {
        None
    }

    /// Inverted-file facet, when this index has one.
    fn ivf(&self) -> Option<&dyn IvfFacet<T>> {
        None
    }

    fn ivf_mut(&mut self) -> Option<&mut dyn IvfFacet<T>> {
        None
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Operations available only on inverted-file indexes.
pub trait IvfFacet<T: Component>: Send + Sync {
    fn nlist(&self) -> usize;

    fn nprobe(&self) -> usize;

    fn set_nprobe(&mut self, nprobe: usize);

    fn direct_map(&self) -> DirectMapType {
        DirectMapType::NoMap
    }

    /// Switch the id -> (list, offset) lookup used by `reconstruct`.
    fn set_direct_map(&mut self, _kind: DirectMapType) -> EngineResult<()> {
        Err(EngineFailure::unsupported("set_direct_map"))
    }

    /// Identifiers stored in partition `list_no`, in list order.
    fn list_ids(&self, list_no: usize) -> Vec<VectorId>;

    /// Rank the partitions accepted by `eligible` by distance to the single
    /// query `x`, returning at most `limit` of them, closest first.
    fn closest_eligible_centroids(
        &self,
        x: &[T],
        eligible: &IdSelector,
        limit: usize,
    ) -> EngineResult<(Vec<i64>, Vec<T::Distance>)>;

    /// Search with partition assignment already decided by the caller:
    /// `assign` and `centroid_dis` hold `params.nprobe()` entries per query.
    fn search_preassigned(
        &self,
        n: usize,
        x: &[T],
        k: usize,
        assign: &[i64],
        centroid_dis: &[T::Distance],
        params: &SearchParams<'_>,
    ) -> EngineResult<SearchResult<T::Distance>>;
}

/// Factory side of the engine.
pub trait VectorEngine: Send + Sync {
    fn index_factory(
        &self,
        d: usize,
        description: &str,
        metric: MetricType,
    ) -> EngineResult<Box<dyn NativeIndex<f32>>>;

    fn binary_index_factory(&self, d: usize, description: &str) -> EngineResult<Box<dyn NativeIndex<u8>>>;

    fn read_index(&self, bytes: &[u8]) -> EngineResult<Box<dyn NativeIndex<f32>>>;

    fn read_binary_index(&self, bytes: &[u8]) -> EngineResult<Box<dyn NativeIndex<u8>>>;

    /// Single-shot k-means: `k * d` centroids and the mean quantization error.
    fn kmeans_clustering(&self, d: usize, n: usize, k: usize, x: &[f32]) -> EngineResult<(Vec<f32>, f32)>;

    /// PCA projection from `d_in` to `d_out` dimensions. Components are scaled
    /// by `eigenvalue ^ eigen_power`, so `0` keeps them as is and `-0.5`
    /// whitens.
    fn pca_matrix(
        &self,
        _d_in: usize,
        _d_out: usize,
        _eigen_power: f32,
        _random_rotation: bool,
    ) -> EngineResult<Box<dyn VectorTransform>> {
        Err(EngineFailure::new("vector transforms are not supported by this engine"))
    }
}

/// A trainable linear map from `d_in` to `d_out` dimensions.
pub trait VectorTransform: Send + Sync {
    fn d_in(&self) -> usize;

    fn d_out(&self) -> usize;

    fn is_trained(&self) -> bool;

    fn train(&mut self, n: usize, x: &[f32]) -> EngineResult<()>;

    /// Map `n` input vectors to `n * d_out` floats.
    fn apply(&self, n: usize, x: &[f32]) -> EngineResult<Vec<f32>>;

    fn as_any(&self) -> &dyn Any;
}
