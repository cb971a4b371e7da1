use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identifier of a stored vector. Negative values are reserved: `-1` marks an
/// empty result slot.
pub type VectorId = i64;

/// Label written into result slots that could not be filled.
pub const MISSING_LABEL: VectorId = -1;

/// Distance metric for vector comparison.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    /// Squared Euclidean distance, smaller is closer.
    #[default]
    L2,
    /// Inner product similarity, larger is closer.
    InnerProduct,
    /// Bit-level Hamming distance over packed binary codes.
    Hamming,
}

impl MetricType {
    /// Whether a larger score means a closer match.
    pub fn is_similarity(self) -> bool {
        matches!(self, MetricType::InnerProduct)
    }
}

impl std::fmt::Display for MetricType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricType::L2 => write!(f, "l2"),
            MetricType::InnerProduct => write!(f, "inner_product"),
            MetricType::Hamming => write!(f, "hamming"),
        }
    }
}

/// Structural kind of an index, fixed when the index is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructuralKind {
    Flat,
    InvertedFile,
    /// Identifier-remapping composite around another index.
    IdMap,
}

impl std::fmt::Display for StructuralKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StructuralKind::Flat => write!(f, "flat"),
            StructuralKind::InvertedFile => write!(f, "inverted_file"),
            StructuralKind::IdMap => write!(f, "id_map"),
        }
    }
}

/// k-NN results for `nq` queries, stored row-major with `k` slots per query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult<D> {
    pub k: usize,
    pub distances: Vec<D>,
    pub labels: Vec<VectorId>,
}

impl<D: Copy> SearchResult<D> {
    pub fn empty() -> Self {
        Self {
            k: 0,
            distances: Vec::new(),
            labels: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Number of queries covered by this result.
    pub fn nq(&self) -> usize {
        if self.k == 0 {
            0
        } else {
            self.labels.len() / self.k
        }
    }

    /// Filled `(label, distance)` pairs for query `q`, in rank order.
    pub fn neighbors(&self, q: usize) -> Vec<(VectorId, D)> {
        if self.k == 0 {
            return Vec::new();
        }
        let start = q * self.k;
        let end = (start + self.k).min(self.labels.len());
        (start..end)
            .filter(|&i| self.labels[i] != MISSING_LABEL)
            .map(|i| (self.labels[i], self.distances[i]))
            .collect()
    }
}

/// Range search results: query `q` owns `labels[lims[q]..lims[q + 1]]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeSearchResult<D> {
    pub lims: Vec<usize>,
    pub labels: Vec<VectorId>,
    pub distances: Vec<D>,
}

impl<D: Copy> RangeSearchResult<D> {
    pub fn nq(&self) -> usize {
        self.lims.len().saturating_sub(1)
    }

    /// `(label, distance)` pairs for query `q`; empty when `q >= nq()`.
    pub fn neighbors(&self, q: usize) -> Vec<(VectorId, D)> {
        if q >= self.nq() {
            return Vec::new();
        }
        let (start, end) = (self.lims[q], self.lims[q + 1]);
        self.labels[start..end]
            .iter()
            .copied()
            .zip(self.distances[start..end].iter().copied())
            .collect()
    }
}

/// How an inverted file locates a stored vector by identifier.
///
/// `Array` needs identifiers to be assigned sequentially from zero and does
/// not support removal; `Hashtable` accepts arbitrary identifiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectMapType {
    #[default]
    NoMap,
    Array,
    Hashtable,
}

/// Partition id -> member identifiers, in list order.
pub type ClusterAssignment = BTreeMap<i64, Vec<VectorId>>;
