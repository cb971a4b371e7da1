//! Flat and inverted-file storage for the reference engine.
//!
//! Both layouts store `(id, code)` pairs in [`InvertedList`]s: a flat index is
//! a single list, an inverted file has one list per partition plus a coarse
//! quantizer (the partition centroids). An identifier map is a thin wrapper
//! around one of those layouts, reachable as its sub-index.

use std::any::Any;
use std::collections::HashMap;
use std::mem::size_of;

use serde::{Deserialize, Serialize};

use crate::index::distance::{float_distance, hamming, is_closer};
use crate::index::reference::kmeans;
use crate::index::traits::{Component, EngineFailure, EngineResult, IvfFacet, NativeIndex};
use crate::params::SearchParams;
use crate::selector::IdSelector;
use crate::types::{
    DirectMapType, MetricType, RangeSearchResult, SearchResult, StructuralKind, VectorId, MISSING_LABEL,
};

/// Per-component kernels the reference engine needs on top of [`Component`].
pub trait Scalar: Component {
    fn distance(metric: MetricType, a: &[Self], b: &[Self]) -> Self::Distance;

    /// Distance that every real candidate beats.
    fn worst(metric: MetricType) -> Self::Distance;

    /// Expand one code into floats for k-means.
    fn decode(code: &[Self], out: &mut Vec<f32>);

    /// Quantize one float centroid back into a code.
    fn encode(v: &[f32]) -> Vec<Self>;
}

impl Scalar for f32 {
    fn distance(metric: MetricType, a: &[f32], b: &[f32]) -> f32 {
        float_distance(metric, a, b)
    }

    fn worst(metric: MetricType) -> f32 {
        if metric.is_similarity() {
            f32::NEG_INFINITY
        } else {
            f32::INFINITY
        }
    }

    fn decode(code: &[f32], out: &mut Vec<f32>) {
        out.extend_from_slice(code);
    }

    fn encode(v: &[f32]) -> Vec<f32> {
        v.to_vec()
    }
}

impl Scalar for u8 {
    fn distance(_metric: MetricType, a: &[u8], b: &[u8]) -> i32 {
        hamming(a, b)
    }

    fn worst(_metric: MetricType) -> i32 {
        i32::MAX
    }

    fn decode(code: &[u8], out: &mut Vec<f32>) {
        for byte in code {
            for bit in 0..8 {
                out.push(f32::from((byte >> bit) & 1));
            }
        }
    }

    fn encode(v: &[f32]) -> Vec<u8> {
        v.chunks(8)
            .map(|bits| {
                bits.iter()
                    .enumerate()
                    .fold(0u8, |acc, (bit, &b)| if b >= 0.5 { acc | (1 << bit) } else { acc })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct InvertedList<T> {
    pub ids: Vec<VectorId>,
    pub codes: Vec<T>,
}

impl<T: Copy> InvertedList<T> {
    fn len(&self) -> usize {
        self.ids.len()
    }

    fn push(&mut self, id: VectorId, code: &[T]) {
        self.ids.push(id);
        self.codes.extend_from_slice(code);
    }

    fn clear(&mut self) {
        self.ids.clear();
        self.codes.clear();
    }

    fn retain(&mut self, code_len: usize, mut keep: impl FnMut(VectorId) -> bool) -> usize {
        let before = self.ids.len();
        let mut ids = Vec::with_capacity(before);
        let mut codes = Vec::with_capacity(self.codes.len());
        for (i, &id) in self.ids.iter().enumerate() {
            if keep(id) {
                ids.push(id);
                codes.extend_from_slice(&self.codes[i * code_len..(i + 1) * code_len]);
            }
        }
        self.ids = ids;
        self.codes = codes;
        before - self.ids.len()
    }

    fn append(&mut self, other: &mut InvertedList<T>, add_id: VectorId) {
        self.ids.extend(other.ids.drain(..).map(|id| id + add_id));
        self.codes.append(&mut other.codes);
    }

    fn bytes(&self) -> usize {
        self.codes.len() * size_of::<T>() + self.ids.len() * size_of::<VectorId>()
    }
}

fn not_sequential() -> EngineFailure {
    EngineFailure::new("array direct map requires sequential ids starting at 0")
}

/// Where each stored id lives, as `(list, offset)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) enum DirectMap {
    #[default]
    NoMap,
    /// Slot `i` locates id `i`.
    Array(Vec<(usize, usize)>),
    Hashtable(HashMap<VectorId, (usize, usize)>),
}

impl DirectMap {
    fn build<T: Copy>(kind: DirectMapType, lists: &[InvertedList<T>]) -> EngineResult<Self> {
        let entries = lists
            .iter()
            .enumerate()
            .flat_map(|(l, list)| list.ids.iter().enumerate().map(move |(o, &id)| (id, (l, o))));
        match kind {
            DirectMapType::NoMap => Ok(DirectMap::NoMap),
            DirectMapType::Hashtable => Ok(DirectMap::Hashtable(entries.collect())),
            DirectMapType::Array => {
                let total = lists.iter().map(InvertedList::len).sum();
                let mut slots: Vec<Option<(usize, usize)>> = vec![None; total];
                for (id, at) in entries {
                    let slot = match usize::try_from(id) {
                        Ok(i) if i < total => &mut slots[i],
                        _ => return Err(not_sequential()),
                    };
                    if slot.replace(at).is_some() {
                        return Err(not_sequential());
                    }
                }
                slots
                    .into_iter()
                    .collect::<Option<Vec<_>>>()
                    .map(DirectMap::Array)
                    .ok_or_else(not_sequential)
            }
        }
    }

    fn kind(&self) -> DirectMapType {
        match self {
            DirectMap::NoMap => DirectMapType::NoMap,
            DirectMap::Array(_) => DirectMapType::Array,
            DirectMap::Hashtable(_) => DirectMapType::Hashtable,
        }
    }

    fn locate(&self, id: VectorId) -> EngineResult<Option<(usize, usize)>> {
        match self {
            DirectMap::NoMap => Err(EngineFailure::new(
                "direct map not initialized, set one to reconstruct from an inverted file",
            )),
            DirectMap::Array(slots) => Ok(usize::try_from(id).ok().and_then(|i| slots.get(i)).copied()),
            DirectMap::Hashtable(map) => Ok(map.get(&id).copied()),
        }
    }

    fn bytes(&self) -> usize {
        match self {
            DirectMap::NoMap => 0,
            DirectMap::Array(slots) => slots.len() * size_of::<(usize, usize)>(),
            DirectMap::Hashtable(map) => map.len() * size_of::<(VectorId, (usize, usize))>(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct IvfLayout<T> {
    pub nlist: usize,
    pub nprobe: usize,
    /// `nlist` coarse centroids, empty until trained.
    pub centroids: Vec<T>,
    pub lists: Vec<InvertedList<T>>,
    pub direct_map: DirectMap,
}

impl<T: Clone + Default> IvfLayout<T> {
    pub(crate) fn new(nlist: usize) -> Self {
        Self {
            nlist,
            nprobe: 1,
            centroids: Vec::new(),
            lists: vec![InvertedList::default(); nlist],
            direct_map: DirectMap::NoMap,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum Layout<T> {
    Flat(InvertedList<T>),
    Ivf(IvfLayout<T>),
}

/// Identifier remapping wrapper. `Reversible` also keeps enough state to
/// reconstruct vectors by external id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum IdMapMode {
    Plain,
    Reversible,
}

/// Fixed-capacity best-k collector.
struct TopK<D> {
    k: usize,
    metric: MetricType,
    items: Vec<(D, VectorId)>,
}

impl<D: Copy + PartialOrd> TopK<D> {
    fn new(k: usize, metric: MetricType) -> Self {
        Self {
            k,
            metric,
            items: Vec::with_capacity(k.min(1024)),
        }
    }

    fn push(&mut self, dist: D, id: VectorId) {
        if self.k == 0 {
            return;
        }
        if self.items.len() < self.k {
            self.items.push((dist, id));
            return;
        }
        let metric = self.metric;
        let worst = self
            .items
            .iter()
            .enumerate()
            .fold(0, |w, (i, item)| if is_closer(metric, self.items[w].0, item.0) { i } else { w });
        if is_closer(metric, dist, self.items[worst].0) {
            self.items[worst] = (dist, id);
        }
    }

    fn into_sorted(mut self) -> Vec<(D, VectorId)> {
        let metric = self.metric;
        self.items.sort_by(|a, b| {
            if is_closer(metric, a.0, b.0) {
                std::cmp::Ordering::Less
            } else if is_closer(metric, b.0, a.0) {
                std::cmp::Ordering::Greater
            } else {
                a.1.cmp(&b.1)
            }
        });
        self.items
    }
}

/// A flat or inverted-file structure with no identifier map around it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PlainIndex<T> {
    pub(crate) d: usize,
    pub(crate) metric: MetricType,
    pub(crate) layout: Layout<T>,
    pub(crate) train_iterations: usize,
    pub(crate) seed: u64,
}

/// Index structure of the reference engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceIndex<T> {
    pub(crate) plain: PlainIndex<T>,
    pub(crate) id_map: Option<IdMapMode>,
    /// Emulated accelerator device holding this copy, if any.
    #[serde(skip)]
    pub(crate) device: Option<usize>,
}

impl<T: Scalar> ReferenceIndex<T> {
    pub(crate) fn new(
        d: usize,
        metric: MetricType,
        layout: Layout<T>,
        id_map: Option<IdMapMode>,
        train_iterations: usize,
        seed: u64,
    ) -> Self {
        Self {
            plain: PlainIndex {
                d,
                metric,
                layout,
                train_iterations,
                seed,
            },
            id_map,
            device: None,
        }
    }

    /// Device this copy lives on, `None` for host memory.
    pub fn device(&self) -> Option<usize> {
        self.device
    }
}

/// The plain structure behind either a bare or a wrapped reference index.
fn plain_mut<T: Scalar>(index: &mut dyn NativeIndex<T>) -> Option<&mut PlainIndex<T>> {
    let any = index.as_any_mut();
    if any.is::<PlainIndex<T>>() {
        return any.downcast_mut::<PlainIndex<T>>();
    }
    any.downcast_mut::<ReferenceIndex<T>>().map(|r| &mut r.plain)
}

impl<T: Scalar> PlainIndex<T> {
    fn code_len(&self) -> usize {
        T::code_len(self.d)
    }

    fn ivf_layout(&self) -> Option<&IvfLayout<T>> {
        match &self.layout {
            Layout::Ivf(ivf) => Some(ivf),
            Layout::Flat(_) => None,
        }
    }

    fn lists(&self) -> &[InvertedList<T>] {
        match &self.layout {
            Layout::Flat(list) => std::slice::from_ref(list),
            Layout::Ivf(ivf) => &ivf.lists,
        }
    }

    fn lists_mut(&mut self) -> &mut [InvertedList<T>] {
        match &mut self.layout {
            Layout::Flat(list) => std::slice::from_mut(list),
            Layout::Ivf(ivf) => &mut ivf.lists,
        }
    }

    fn ensure_trained(&self) -> EngineResult<()> {
        if !self.is_trained() {
            return Err(EngineFailure::new("index is not trained"));
        }
        Ok(())
    }

    /// Partitions ordered by distance to `q`, filtered by `eligible`, capped
    /// at `limit`.
    fn rank_centroids(
        &self,
        ivf: &IvfLayout<T>,
        q: &[T],
        eligible: impl Fn(i64) -> bool,
        limit: usize,
    ) -> Vec<(i64, T::Distance)> {
        let code_len = self.code_len();
        let mut top = TopK::new(limit.min(ivf.nlist), self.metric);
        for (c, centroid) in ivf.centroids.chunks_exact(code_len).enumerate() {
            let c = c as i64;
            if eligible(c) {
                top.push(T::distance(self.metric, q, centroid), c);
            }
        }
        top.into_sorted().into_iter().map(|(dist, c)| (c, dist)).collect()
    }

    fn nearest_list(&self, ivf: &IvfLayout<T>, code: &[T]) -> usize {
        self.rank_centroids(ivf, code, |_| true, 1)
            .first()
            .map_or(0, |&(c, _)| c as usize)
    }

    /// Scan `visit` in order, stopping once `max_codes` codes were visited.
    fn scan_lists(
        &self,
        lists: &[InvertedList<T>],
        visit: impl IntoIterator<Item = i64>,
        q: &[T],
        k: usize,
        max_codes: usize,
        params: Option<&SearchParams<'_>>,
    ) -> EngineResult<Vec<(T::Distance, VectorId)>> {
        let code_len = self.code_len();
        let mut top = TopK::new(k, self.metric);
        let mut scanned = 0usize;
        for list_no in visit {
            if list_no < 0 {
                continue;
            }
            let list = lists.get(list_no as usize).ok_or_else(|| {
                EngineFailure::new(format!("invalid list number {list_no} (nlist = {})", lists.len()))
            })?;
            for (i, &id) in list.ids.iter().enumerate() {
                if params.is_some_and(|p| !p.accepts(id)) {
                    continue;
                }
                let code = &list.codes[i * code_len..(i + 1) * code_len];
                top.push(T::distance(self.metric, q, code), id);
            }
            scanned += list.len();
            if max_codes > 0 && scanned >= max_codes {
                break;
            }
        }
        Ok(top.into_sorted())
    }

    fn collect_results(&self, per_query: Vec<Vec<(T::Distance, VectorId)>>, k: usize) -> SearchResult<T::Distance> {
        let nq = per_query.len();
        let mut distances = vec![T::worst(self.metric); nq * k];
        let mut labels = vec![MISSING_LABEL; nq * k];
        for (q, hits) in per_query.into_iter().enumerate() {
            for (j, (dist, id)) in hits.into_iter().enumerate() {
                distances[q * k + j] = dist;
                labels[q * k + j] = id;
            }
        }
        SearchResult { k, distances, labels }
    }

    fn insert(&mut self, n: usize, x: &[T], ids: &[VectorId]) -> EngineResult<()> {
        self.ensure_trained()?;
        if let Layout::Ivf(IvfLayout {
            direct_map: DirectMap::Array(slots),
            ..
        }) = &self.layout
        {
            let next = slots.len() as VectorId;
            if ids.iter().take(n).zip(next..).any(|(&id, want)| id != want) {
                return Err(not_sequential());
            }
        }
        let code_len = self.code_len();
        for (code, &id) in x.chunks_exact(code_len).take(n).zip(ids) {
            let list_no = match &self.layout {
                Layout::Flat(_) => 0,
                Layout::Ivf(ivf) => self.nearest_list(ivf, code),
            };
            self.lists_mut()[list_no].push(id, code);
        }
        self.refresh_direct_map()
    }

    fn refresh_direct_map(&mut self) -> EngineResult<()> {
        if let Layout::Ivf(ivf) = &mut self.layout {
            let kind = ivf.direct_map.kind();
            if kind != DirectMapType::NoMap {
                ivf.direct_map = DirectMap::build(kind, &ivf.lists)?;
            }
        }
        Ok(())
    }

    fn has_array_map(&self) -> bool {
        matches!(
            self.layout,
            Layout::Ivf(IvfLayout {
                direct_map: DirectMap::Array(_),
                ..
            })
        )
    }
}

impl<T: Scalar> NativeIndex<T> for PlainIndex<T> {
    fn d(&self) -> usize {
        self.d
    }

    fn metric(&self) -> MetricType {
        self.metric
    }

    fn is_trained(&self) -> bool {
        match &self.layout {
            Layout::Flat(_) => true,
            Layout::Ivf(ivf) => !ivf.centroids.is_empty(),
        }
    }

    fn ntotal(&self) -> usize {
        self.lists().iter().map(InvertedList::len).sum()
    }

    fn kind(&self) -> StructuralKind {
        match &self.layout {
            Layout::Flat(_) => StructuralKind::Flat,
            Layout::Ivf(_) => StructuralKind::InvertedFile,
        }
    }

    fn size(&self) -> usize {
        let stored: usize = self.lists().iter().map(InvertedList::bytes).sum();
        match &self.layout {
            Layout::Flat(_) => stored,
            Layout::Ivf(ivf) => stored + ivf.centroids.len() * size_of::<T>() + ivf.direct_map.bytes(),
        }
    }

    fn train(&mut self, n: usize, x: &[T]) -> EngineResult<()> {
        let ntotal = self.ntotal();
        let code_len = self.code_len();
        let (iterations, seed) = (self.train_iterations, self.seed);
        let Layout::Ivf(ivf) = &mut self.layout else {
            return Ok(());
        };
        if ntotal > 0 {
            return Err(EngineFailure::new("cannot retrain an index that already holds vectors"));
        }

        let mut decoded = Vec::new();
        for code in x.chunks_exact(code_len).take(n) {
            T::decode(code, &mut decoded);
        }
        let dims = decoded.len() / n.max(1);
        let (centroids, _) = kmeans::train(dims, &decoded, ivf.nlist, iterations, seed)?;
        ivf.centroids = centroids.chunks_exact(dims).flat_map(T::encode).collect();
        Ok(())
    }

    fn add(&mut self, n: usize, x: &[T]) -> EngineResult<()> {
        let start = self.ntotal() as VectorId;
        let ids: Vec<VectorId> = (start..start + n as VectorId).collect();
        self.insert(n, x, &ids)
    }

    fn add_with_ids(&mut self, n: usize, x: &[T], ids: &[VectorId]) -> EngineResult<()> {
        self.insert(n, x, ids)
    }

    fn search(
        &self,
        n: usize,
        x: &[T],
        k: usize,
        params: Option<&SearchParams<'_>>,
    ) -> EngineResult<SearchResult<T::Distance>> {
        self.ensure_trained()?;
        let code_len = self.code_len();
        let mut per_query = Vec::with_capacity(n);
        for q in x.chunks_exact(code_len).take(n) {
            let hits = match &self.layout {
                Layout::Flat(list) => self.scan_lists(std::slice::from_ref(list), [0], q, k, 0, params)?,
                Layout::Ivf(ivf) => {
                    let nprobe = params.and_then(|p| p.nprobe()).unwrap_or(ivf.nprobe);
                    let max_codes = params.map_or(0, |p| p.max_codes());
                    let nearest = self.rank_centroids(ivf, q, |_| true, nprobe);
                    self.scan_lists(&ivf.lists, nearest.into_iter().map(|(c, _)| c), q, k, max_codes, params)?
                }
            };
            per_query.push(hits);
        }
        Ok(self.collect_results(per_query, k))
    }

    fn range_search(
        &self,
        n: usize,
        x: &[T],
        radius: T::Distance,
    ) -> EngineResult<RangeSearchResult<T::Distance>> {
        self.ensure_trained()?;
        let code_len = self.code_len();
        let mut result = RangeSearchResult {
            lims: vec![0],
            labels: Vec::new(),
            distances: Vec::new(),
        };
        for q in x.chunks_exact(code_len).take(n) {
            let visit: Vec<usize> = match &self.layout {
                Layout::Flat(_) => vec![0],
                Layout::Ivf(ivf) => self
                    .rank_centroids(ivf, q, |_| true, ivf.nprobe)
                    .into_iter()
                    .map(|(c, _)| c as usize)
                    .collect(),
            };
            for list_no in visit {
                let list = &self.lists()[list_no];
                for (i, &id) in list.ids.iter().enumerate() {
                    let dist = T::distance(self.metric, q, &list.codes[i * code_len..(i + 1) * code_len]);
                    if is_closer(self.metric, dist, radius) {
                        result.labels.push(id);
                        result.distances.push(dist);
                    }
                }
            }
            result.lims.push(result.labels.len());
        }
        Ok(result)
    }

    fn reset(&mut self) -> EngineResult<()> {
        self.lists_mut().iter_mut().for_each(InvertedList::clear);
        self.refresh_direct_map()
    }

    fn remove_ids(&mut self, selector: &IdSelector) -> EngineResult<usize> {
        if self.has_array_map() {
            return Err(EngineFailure::new("remove_ids not supported with an array direct map"));
        }
        let code_len = self.code_len();
        let removed: usize = self
            .lists_mut()
            .iter_mut()
            .map(|list| list.retain(code_len, |id| !selector.is_member(id)))
            .sum();
        self.refresh_direct_map()?;
        Ok(removed)
    }

    fn reconstruct(&self, id: VectorId) -> EngineResult<Option<Vec<T>>> {
        let code_len = self.code_len();
        let located = match &self.layout {
            Layout::Flat(list) => list.ids.iter().position(|&v| v == id).map(|o| (0, o)),
            Layout::Ivf(ivf) => ivf.direct_map.locate(id)?,
        };
        Ok(located.map(|(l, o)| self.lists()[l].codes[o * code_len..(o + 1) * code_len].to_vec()))
    }

    fn merge_from(&mut self, other: &mut dyn NativeIndex<T>, add_id: VectorId) -> EngineResult<()> {
        let other =
            plain_mut(other).ok_or_else(|| EngineFailure::new("merge api not supported for this index type"))?;
        if self.has_array_map() {
            return Err(EngineFailure::new("merge not supported with an array direct map"));
        }
        if other.d != self.d || other.metric != self.metric {
            return Err(EngineFailure::new("cannot merge indexes with different dimension or metric"));
        }
        match (&mut self.layout, &mut other.layout) {
            (Layout::Flat(dst), Layout::Flat(src)) => dst.append(src, add_id),
            (Layout::Ivf(dst), Layout::Ivf(src)) if dst.nlist == src.nlist => {
                for (d, s) in dst.lists.iter_mut().zip(src.lists.iter_mut()) {
                    d.append(s, add_id);
                }
            }
            _ => return Err(EngineFailure::new("cannot merge indexes with incompatible layouts")),
        }
        other.refresh_direct_map()?;
        self.refresh_direct_map()
    }

    fn set_parameter(&mut self, name: &str, value: f64) -> EngineResult<()> {
        match (name, &mut self.layout) {
            ("nprobe", Layout::Ivf(ivf)) => {
                ivf.nprobe = (value as usize).max(1);
                Ok(())
            }
            ("nprobe", _) => Err(EngineFailure::new("nprobe applies only to IVF indexes")),
            _ => Err(EngineFailure::new(format!("unknown parameter: {name}"))),
        }
    }

    fn ivf(&self) -> Option<&dyn IvfFacet<T>> {
        match &self.layout {
            Layout::Ivf(_) => Some(self),
            Layout::Flat(_) => None,
        }
    }

    fn ivf_mut(&mut self) -> Option<&mut dyn IvfFacet<T>> {
        if matches!(self.layout, Layout::Ivf(_)) {
            Some(self)
        } else {
            None
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl<T: Scalar> IvfFacet<T> for PlainIndex<T> {
    fn nlist(&self) -> usize {
        self.ivf_layout().map_or(0, |ivf| ivf.nlist)
    }

    fn nprobe(&self) -> usize {
        self.ivf_layout().map_or(0, |ivf| ivf.nprobe)
    }

    fn set_nprobe(&mut self, nprobe: usize) {
        if let Layout::Ivf(ivf) = &mut self.layout {
            ivf.nprobe = nprobe.max(1);
        }
    }

    fn direct_map(&self) -> DirectMapType {
        self.ivf_layout().map_or(DirectMapType::NoMap, |ivf| ivf.direct_map.kind())
    }

    fn set_direct_map(&mut self, kind: DirectMapType) -> EngineResult<()> {
        let Layout::Ivf(ivf) = &mut self.layout else {
            return Err(EngineFailure::new("index is not an IVF index"));
        };
        ivf.direct_map = DirectMap::build(kind, &ivf.lists)?;
        Ok(())
    }

    fn list_ids(&self, list_no: usize) -> Vec<VectorId> {
        self.ivf_layout()
            .and_then(|ivf| ivf.lists.get(list_no))
            .map(|list| list.ids.clone())
            .unwrap_or_default()
    }

    fn closest_eligible_centroids(
        &self,
        x: &[T],
        eligible: &IdSelector,
        limit: usize,
    ) -> EngineResult<(Vec<i64>, Vec<T::Distance>)> {
        self.ensure_trained()?;
        let ivf = self
            .ivf_layout()
            .ok_or_else(|| EngineFailure::new("index is not an IVF index"))?;
        Ok(self
            .rank_centroids(ivf, x, |c| eligible.is_member(c), limit)
            .into_iter()
            .unzip())
    }

    fn search_preassigned(
        &self,
        n: usize,
        x: &[T],
        k: usize,
        assign: &[i64],
        _centroid_dis: &[T::Distance],
        params: &SearchParams<'_>,
    ) -> EngineResult<SearchResult<T::Distance>> {
        self.ensure_trained()?;
        let ivf = self
            .ivf_layout()
            .ok_or_else(|| EngineFailure::new("index is not an IVF index"))?;
        let nprobe = params.nprobe().unwrap_or(ivf.nprobe);
        if assign.len() != n * nprobe {
            return Err(EngineFailure::new(format!(
                "expected {} preassigned lists for {n} queries with nprobe {nprobe}, got {}",
                n * nprobe,
                assign.len()
            )));
        }

        let code_len = self.code_len();
        let mut per_query = Vec::with_capacity(n);
        for (q, lists) in x.chunks_exact(code_len).take(n).zip(assign.chunks(nprobe.max(1))) {
            per_query.push(self.scan_lists(
                &ivf.lists,
                lists.iter().copied(),
                q,
                k,
                params.max_codes(),
                Some(params),
            )?);
        }
        Ok(self.collect_results(per_query, k))
    }
}

impl<T: Scalar> NativeIndex<T> for ReferenceIndex<T> {
    fn d(&self) -> usize {
        self.plain.d
    }

    fn metric(&self) -> MetricType {
        self.plain.metric
    }

    fn is_trained(&self) -> bool {
        self.plain.is_trained()
    }

    fn ntotal(&self) -> usize {
        self.plain.ntotal()
    }

    fn kind(&self) -> StructuralKind {
        match self.id_map {
            Some(_) => StructuralKind::IdMap,
            None => self.plain.kind(),
        }
    }

    fn size(&self) -> usize {
        self.plain.size()
    }

    fn train(&mut self, n: usize, x: &[T]) -> EngineResult<()> {
        self.plain.train(n, x)
    }

    fn add(&mut self, n: usize, x: &[T]) -> EngineResult<()> {
        if self.id_map.is_some() {
            return Err(EngineFailure::new("add does not assign ids on an IDMap index, use add_with_ids"));
        }
        self.plain.add(n, x)
    }

    fn add_with_ids(&mut self, n: usize, x: &[T], ids: &[VectorId]) -> EngineResult<()> {
        self.plain.add_with_ids(n, x, ids)
    }

    fn search(
        &self,
        n: usize,
        x: &[T],
        k: usize,
        params: Option<&SearchParams<'_>>,
    ) -> EngineResult<SearchResult<T::Distance>> {
        self.plain.search(n, x, k, params)
    }

    fn range_search(
        &self,
        n: usize,
        x: &[T],
        radius: T::Distance,
    ) -> EngineResult<RangeSearchResult<T::Distance>> {
        self.plain.range_search(n, x, radius)
    }

    fn reset(&mut self) -> EngineResult<()> {
        self.plain.reset()
    }

    fn remove_ids(&mut self, selector: &IdSelector) -> EngineResult<usize> {
        self.plain.remove_ids(selector)
    }

    fn reconstruct(&self, id: VectorId) -> EngineResult<Option<Vec<T>>> {
        if self.id_map == Some(IdMapMode::Plain) {
            return Ok(None);
        }
        self.plain.reconstruct(id)
    }

    fn merge_from(&mut self, other: &mut dyn NativeIndex<T>, add_id: VectorId) -> EngineResult<()> {
        self.plain.merge_from(other, add_id)
    }

    fn set_parameter(&mut self, name: &str, value: f64) -> EngineResult<()> {
        if self.id_map.is_some() && name == "nprobe" {
            return Err(EngineFailure::new("nprobe applies only to IVF indexes"));
        }
        self.plain.set_parameter(name, value)
    }

    fn serialize(&self) -> EngineResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| EngineFailure::new(format!("failed to serialize index: {e}")))
    }

    fn sub_index(&self) -> Option<&dyn NativeIndex<T>> {
        self.id_map.map(|_| &self.plain as &dyn NativeIndex<T>)
    }

    fn sub_index_mut(&mut self) -> Option<&mut dyn NativeIndex<T>> {
        match self.id_map {
            Some(_) => Some(&mut self.plain as &mut dyn NativeIndex<T>),
            None => None,
        }
    }

    fn ivf(&self) -> Option<&dyn IvfFacet<T>> {
        match self.id_map {
            Some(_) => None,
            None => self.plain.ivf(),
        }
    }

    fn ivf_mut(&mut self) -> Option<&mut dyn IvfFacet<T>> {
        match self.id_map {
            Some(_) => None,
            None => self.plain.ivf_mut(),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
