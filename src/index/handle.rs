//! Owned index handles over engine structures.

use tracing::debug;

use crate::error::{QuiverError, Result};
use crate::index::traits::{Component, NativeIndex, VectorEngine};
use crate::params::SearchParams;
use crate::selector::IdSelector;
use crate::types::{
    ClusterAssignment, DirectMapType, MetricType, RangeSearchResult, SearchResult, StructuralKind, VectorId,
};

/// An exclusively owned index. Float and binary indexes share this type,
/// parameterized by their [`Component`].
///
/// Releasing is idempotent. Once released, accessors return neutral values
/// and every operation that would reach the engine fails with
/// `InvalidArgument`.
pub struct Index<T: Component> {
    native: Option<Box<dyn NativeIndex<T>>>,
}

pub type FloatIndex = Index<f32>;
pub type BinaryIndex = Index<u8>;

impl<T: Component> std::fmt::Debug for Index<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.native {
            Some(n) => f
                .debug_struct("Index")
                .field("component", &T::NAME)
                .field("kind", &n.kind())
                .field("d", &n.d())
                .field("ntotal", &n.ntotal())
                .finish(),
            None => f.debug_struct("Index").field("released", &true).finish(),
        }
    }
}

impl<T: Component> Index<T> {
    /// Build an index from a composition description such as `"IVF64,Flat"`.
    pub fn create(
        engine: &dyn VectorEngine,
        d: usize,
        description: &str,
        metric: MetricType,
    ) -> Result<Self> {
        if d == 0 {
            return Err(QuiverError::invalid("dimension must be positive"));
        }
        let native = T::create_native(engine, d, description, metric)
            .map_err(|e| QuiverError::Construction(e.message))?;
        debug!(component = T::NAME, d, description, kind = %native.kind(), "created index");
        Ok(Self::from_native(native))
    }

    /// Wrap an engine structure obtained elsewhere.
    pub fn from_native(native: Box<dyn NativeIndex<T>>) -> Self {
        Self {
            native: Some(native),
        }
    }

    pub(crate) fn native(&self) -> Result<&dyn NativeIndex<T>> {
        self.native
            .as_deref()
            .ok_or_else(|| QuiverError::invalid("index has been released"))
    }

    pub(crate) fn native_mut(&mut self) -> Result<&mut (dyn NativeIndex<T> + 'static)> {
        self.native
            .as_deref_mut()
            .ok_or_else(|| QuiverError::invalid("index has been released"))
    }

    pub(crate) fn take_native(&mut self) -> Option<Box<dyn NativeIndex<T>>> {
        self.native.take()
    }

    pub fn d(&self) -> usize {
        self.native.as_ref().map_or(0, |n| n.d())
    }

    pub fn is_trained(&self) -> bool {
        self.native.as_ref().is_some_and(|n| n.is_trained())
    }

    pub fn ntotal(&self) -> usize {
        self.native.as_ref().map_or(0, |n| n.ntotal())
    }

    pub fn metric(&self) -> Option<MetricType> {
        self.native.as_ref().map(|n| n.metric())
    }

    pub fn kind(&self) -> Option<StructuralKind> {
        self.native.as_ref().map(|n| n.kind())
    }

    /// Memory footprint in bytes as reported by the engine, `0` once
    /// released.
    pub fn size(&self) -> usize {
        self.native.as_ref().map_or(0, |n| n.size())
    }

    pub fn is_released(&self) -> bool {
        self.native.is_none()
    }

    /// The structure wrapped by an identifier-map composite. Tuning it (for
    /// example its `nprobe`) changes how the composite searches.
    pub fn sub_index(&self) -> Result<&dyn NativeIndex<T>> {
        self.native()?
            .sub_index()
            .ok_or_else(|| QuiverError::invalid("index is not an id map"))
    }

    pub fn sub_index_mut(&mut self) -> Result<&mut dyn NativeIndex<T>> {
        self.native_mut()?
            .sub_index_mut()
            .ok_or_else(|| QuiverError::invalid("index is not an id map"))
    }

    /// Whether the index exposes an inverted-file facet. Never fails.
    pub fn is_ivf(&self) -> bool {
        self.native.as_ref().is_some_and(|n| n.ivf().is_some())
    }

    /// Current `nprobe`, or `0` when the index is not an inverted file.
    pub fn nprobe(&self) -> usize {
        self.native
            .as_ref()
            .and_then(|n| n.ivf())
            .map_or(0, |ivf| ivf.nprobe())
    }

    /// Number of partitions, or `0` when the index is not an inverted file.
    pub fn nlist(&self) -> usize {
        self.native
            .as_ref()
            .and_then(|n| n.ivf())
            .map_or(0, |ivf| ivf.nlist())
    }

    /// Set the index-time `nprobe`. No-op on indexes without the facet.
    pub fn set_nprobe(&mut self, nprobe: usize) {
        if let Some(ivf) = self.native.as_deref_mut().and_then(|n| n.ivf_mut()) {
            ivf.set_nprobe(nprobe);
        }
    }

    /// Direct map of an inverted file, `NoMap` for every other index.
    pub fn direct_map(&self) -> DirectMapType {
        self.native
            .as_ref()
            .and_then(|n| n.ivf())
            .map_or(DirectMapType::NoMap, |ivf| ivf.direct_map())
    }

    /// Choose how an inverted file locates vectors for `reconstruct`.
    pub fn set_direct_map(&mut self, kind: DirectMapType) -> Result<()> {
        let ivf = self
            .native_mut()?
            .ivf_mut()
            .ok_or_else(|| QuiverError::invalid("unable to set direct map: index is not an inverted file"))?;
        ivf.set_direct_map(kind)?;
        debug!(component = T::NAME, ?kind, "set direct map");
        Ok(())
    }

    /// Split `x` into `n` vectors, checking the length against the dimension.
    pub(crate) fn count_vectors(&self, x: &[T]) -> Result<usize> {
        let code_len = T::code_len(self.native()?.d());
        if x.is_empty() {
            return Err(QuiverError::invalid("no vectors supplied"));
        }
        if code_len == 0 || x.len() % code_len != 0 {
            return Err(QuiverError::DimensionMismatch {
                expected: code_len,
                actual: x.len(),
            });
        }
        Ok(x.len() / code_len)
    }

    pub fn train(&mut self, x: &[T]) -> Result<()> {
        let n = self.count_vectors(x)?;
        self.native_mut()?.train(n, x)?;
        Ok(())
    }

    pub fn add(&mut self, x: &[T]) -> Result<()> {
        let n = self.count_vectors(x)?;
        self.native_mut()?.add(n, x)?;
        Ok(())
    }

    pub fn add_with_ids(&mut self, x: &[T], ids: &[VectorId]) -> Result<()> {
        let n = self.count_vectors(x)?;
        if ids.len() != n {
            return Err(QuiverError::invalid(format!(
                "got {} identifiers for {n} vectors",
                ids.len()
            )));
        }
        self.native_mut()?.add_with_ids(n, x, ids)?;
        Ok(())
    }

    pub fn search(&self, x: &[T], k: usize) -> Result<SearchResult<T::Distance>> {
        self.search_with_params(x, k, None)
    }

    pub fn search_with_params(
        &self,
        x: &[T],
        k: usize,
        params: Option<&SearchParams<'_>>,
    ) -> Result<SearchResult<T::Distance>> {
        if k == 0 {
            return Err(QuiverError::invalid("k must be positive"));
        }
        if let Some(sel) = params.and_then(|p| p.selector()) {
            sel.ensure_live()?;
        }
        let n = self.count_vectors(x)?;
        Ok(self.native()?.search(n, x, k, params)?)
    }

    /// All stored vectors within `radius` of each query.
    pub fn range_search(&self, x: &[T], radius: T::Distance) -> Result<RangeSearchResult<T::Distance>> {
        let n = self.count_vectors(x)?;
        Ok(self.native()?.range_search(n, x, radius)?)
    }

    pub fn reset(&mut self) -> Result<()> {
        self.native_mut()?.reset()?;
        Ok(())
    }

    /// Remove the vectors accepted by `selector`; returns how many were removed.
    pub fn remove_ids(&mut self, selector: &IdSelector) -> Result<usize> {
        selector.ensure_live()?;
        Ok(self.native_mut()?.remove_ids(selector)?)
    }

    pub fn reconstruct(&self, id: VectorId) -> Result<Vec<T>> {
        self.native()?
            .reconstruct(id)?
            .ok_or(QuiverError::NotFound { id })
    }

    /// Reconstruct several vectors into one flat buffer. Fails on the first
    /// absent identifier.
    pub fn reconstruct_batch(&self, ids: &[VectorId]) -> Result<Vec<T>> {
        let native = self.native()?;
        let mut out = Vec::with_capacity(ids.len() * T::code_len(native.d()));
        for &id in ids {
            let codes = native.reconstruct(id)?.ok_or(QuiverError::NotFound { id })?;
            out.extend_from_slice(&codes);
        }
        Ok(out)
    }

    /// Move every vector of `other` into this index, shifting ids by `add_id`.
    /// `other` is left empty.
    pub fn merge_from(&mut self, other: &mut Index<T>, add_id: VectorId) -> Result<()> {
        let other_native = other.native_mut()?;
        self.native_mut()?.merge_from(other_native, add_id)?;
        Ok(())
    }

    /// Partition -> member ids. Empty for indexes without the inverted-file
    /// facet.
    pub fn cluster_assignment(&self) -> Result<ClusterAssignment> {
        let mut assignment = ClusterAssignment::new();
        let Some(ivf) = self.native()?.ivf() else {
            return Ok(assignment);
        };
        for list_no in 0..ivf.nlist() {
            assignment.insert(list_no as i64, ivf.list_ids(list_no));
        }
        Ok(assignment)
    }

    /// Serialized engine payload for this index.
    pub(crate) fn serialize_native(&self) -> Result<Vec<u8>> {
        Ok(self.native()?.serialize()?)
    }

    /// Free the engine structure. Releasing twice is a no-op.
    pub fn release(&mut self) {
        if let Some(native) = self.native.take() {
            debug!(component = T::NAME, kind = %native.kind(), "released index");
        }
    }
}

/// Either index family, for code that picks the component at runtime.
#[derive(Debug)]
pub enum AnyIndex {
    Float(FloatIndex),
    Binary(BinaryIndex),
}

impl AnyIndex {
    pub fn d(&self) -> usize {
        match self {
            AnyIndex::Float(i) => i.d(),
            AnyIndex::Binary(i) => i.d(),
        }
    }

    pub fn ntotal(&self) -> usize {
        match self {
            AnyIndex::Float(i) => i.ntotal(),
            AnyIndex::Binary(i) => i.ntotal(),
        }
    }

    pub fn size(&self) -> usize {
        match self {
            AnyIndex::Float(i) => i.size(),
            AnyIndex::Binary(i) => i.size(),
        }
    }

    pub fn is_ivf(&self) -> bool {
        match self {
            AnyIndex::Float(i) => i.is_ivf(),
            AnyIndex::Binary(i) => i.is_ivf(),
        }
    }

    pub fn nprobe(&self) -> usize {
        match self {
            AnyIndex::Float(i) => i.nprobe(),
            AnyIndex::Binary(i) => i.nprobe(),
        }
    }

    pub fn set_nprobe(&mut self, nprobe: usize) {
        match self {
            AnyIndex::Float(i) => i.set_nprobe(nprobe),
            AnyIndex::Binary(i) => i.set_nprobe(nprobe),
        }
    }

    pub fn cluster_assignment(&self) -> Result<ClusterAssignment> {
        match self {
            AnyIndex::Float(i) => i.cluster_assignment(),
            AnyIndex::Binary(i) => i.cluster_assignment(),
        }
    }

    pub fn release(&mut self) {
        match self {
            AnyIndex::Float(i) => i.release(),
            AnyIndex::Binary(i) => i.release(),
        }
    }
}

impl From<FloatIndex> for AnyIndex {
    fn from(i: FloatIndex) -> Self {
        AnyIndex::Float(i)
    }
}

impl From<BinaryIndex> for AnyIndex {
    fn from(i: BinaryIndex) -> Self {
        AnyIndex::Binary(i)
    }
}
