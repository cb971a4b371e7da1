//! Filtered and cluster-restricted search.
//!
//! Single-phase entry points (`search_with_ids`, `search_without_ids`) build a
//! selector, resolve parameters and run one filtered engine search. The
//! two-phase protocol first ranks a caller-chosen set of partitions
//! (`centroid_distances`) and then scans exactly those partitions
//! (`search_specified_clusters`).
//!
//! Selectors and resolved parameters live on the stack of each call and are
//! dropped on every exit path.

use std::time::Instant;

use tracing::{debug, instrument};

use crate::error::{QuiverError, Result};
use crate::index::traits::Component;
use crate::index::Index;
use crate::metrics;
use crate::params::{resolve_search_params, PercentageOverride, SearchParams, TempOverrides};
use crate::selector::IdSelector;
use crate::types::{SearchResult, VectorId};

/// Record a finished query under `kind`.
fn observe<R>(kind: &str, start: Instant, result: &Result<R>) {
    metrics::SEARCHES_TOTAL.with_label_values(&[kind]).inc();
    metrics::SEARCH_DURATION
        .with_label_values(&[kind])
        .observe(start.elapsed().as_secs_f64());
    if let Err(e) = result {
        metrics::SEARCH_FAILURES_TOTAL.with_label_values(&[kind]).inc();
        debug!(kind, error = %e, "search failed");
    }
}

impl<T: Component> Index<T> {
    /// Search every stored vector except `exclude`.
    ///
    /// For inverted files the eligible population used by `ivf_max_codes_pct`
    /// is `ntotal - |exclude|`, not the raw stored count.
    #[instrument(skip_all, fields(component = T::NAME, k, excluded = exclude.len()))]
    pub fn search_without_ids(
        &self,
        x: &[T],
        k: usize,
        exclude: &[VectorId],
        overrides: Option<&PercentageOverride>,
    ) -> Result<SearchResult<T::Distance>> {
        let start = Instant::now();
        let result = self.search_without_ids_inner(x, k, exclude, overrides);
        observe("exclude", start, &result);
        result
    }

    fn search_without_ids_inner(
        &self,
        x: &[T],
        k: usize,
        exclude: &[VectorId],
        overrides: Option<&PercentageOverride>,
    ) -> Result<SearchResult<T::Distance>> {
        if overrides.is_none() && exclude.is_empty() {
            return self.search(x, k);
        }

        let selector = if exclude.is_empty() {
            None
        } else {
            Some(IdSelector::exclude(exclude)?)
        };

        let temp = if self.is_ivf() {
            Some(TempOverrides {
                nvecs: self.ntotal().saturating_sub(exclude.len()),
                ..Default::default()
            })
        } else {
            None
        };

        let params = resolve_search_params(self, overrides, selector.as_ref(), temp.as_ref())?;
        self.search_with_params(x, k, Some(&params))
    }

    /// Search only among `include`.
    #[instrument(skip_all, fields(component = T::NAME, k, included = include.len()))]
    pub fn search_with_ids(
        &self,
        x: &[T],
        k: usize,
        include: &[VectorId],
        overrides: Option<&PercentageOverride>,
    ) -> Result<SearchResult<T::Distance>> {
        let start = Instant::now();
        let result = (|| {
            let selector = IdSelector::include(include)?;
            let params = resolve_search_params(self, overrides, Some(&selector), None)?;
            self.search_with_params(x, k, Some(&params))
        })();
        observe("include", start, &result);
        result
    }

    /// Rank the candidate partitions `centroid_ids` by distance to the single
    /// query `x`, closest first.
    ///
    /// Returns empty lists on indexes without the inverted-file facet.
    #[instrument(skip_all, fields(component = T::NAME, candidates = centroid_ids.len()))]
    pub fn centroid_distances(
        &self,
        x: &[T],
        centroid_ids: &[i64],
    ) -> Result<(Vec<i64>, Vec<T::Distance>)> {
        let native = self.native()?;
        let Some(ivf) = native.ivf() else {
            debug!("centroid ranking requested on a non-IVF index");
            return Ok((Vec::new(), Vec::new()));
        };
        self.expect_single_query(x)?;

        let eligible = IdSelector::include(centroid_ids)?;
        let (ids, distances) = ivf.closest_eligible_centroids(x, &eligible, centroid_ids.len())?;
        Ok((ids, distances))
    }

    /// Scan exactly the partitions in `eligible_centroid_ids`, restricted to
    /// the vectors in `include`.
    ///
    /// `eligible_centroid_ids` and `centroid_distances` must already be in
    /// ascending-distance order (as returned by [`Index::centroid_distances`]).
    /// They are truncated to the effective `nprobe`, resolved with
    /// `min_eligible_centroids` standing in for the index's `nprobe` and the
    /// eligible count standing in for `nlist`. They are never re-sorted.
    ///
    /// Returns an empty result on indexes without the inverted-file facet.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all, fields(
        component = T::NAME,
        k,
        eligible = eligible_centroid_ids.len(),
        min_eligible_centroids
    ))]
    pub fn search_specified_clusters(
        &self,
        include: &[VectorId],
        eligible_centroid_ids: &[i64],
        min_eligible_centroids: usize,
        k: usize,
        x: &[T],
        centroid_distances: &[T::Distance],
        overrides: Option<&PercentageOverride>,
    ) -> Result<SearchResult<T::Distance>> {
        let start = Instant::now();
        let result = self.search_specified_clusters_inner(
            include,
            eligible_centroid_ids,
            min_eligible_centroids,
            k,
            x,
            centroid_distances,
            overrides,
        );
        observe("clusters", start, &result);
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn search_specified_clusters_inner(
        &self,
        include: &[VectorId],
        eligible_centroid_ids: &[i64],
        min_eligible_centroids: usize,
        k: usize,
        x: &[T],
        centroid_distances: &[T::Distance],
        overrides: Option<&PercentageOverride>,
    ) -> Result<SearchResult<T::Distance>> {
        let native = self.native()?;
        let Some(ivf) = native.ivf() else {
            debug!("cluster-restricted search requested on a non-IVF index");
            return Ok(SearchResult::empty());
        };

        if k == 0 {
            return Err(QuiverError::invalid("k must be positive"));
        }
        if eligible_centroid_ids.is_empty() {
            return Err(QuiverError::invalid("no eligible centroids supplied"));
        }
        if centroid_distances.len() != eligible_centroid_ids.len() {
            return Err(QuiverError::invalid(format!(
                "got {} centroid distances for {} eligible centroids",
                centroid_distances.len(),
                eligible_centroid_ids.len()
            )));
        }
        self.expect_single_query(x)?;

        let selector = IdSelector::include(include)?;
        let temp = TempOverrides {
            nlist: eligible_centroid_ids.len(),
            nprobe: min_eligible_centroids,
            nvecs: include.len(),
        };
        let params = resolve_search_params(self, overrides, Some(&selector), Some(&temp))?;

        let resolved = params.nprobe().unwrap_or(eligible_centroid_ids.len());
        let effective = resolved.min(eligible_centroid_ids.len());
        let params = match params {
            SearchParams::Ivf {
                selector,
                max_codes,
                ..
            } => SearchParams::Ivf {
                selector,
                nprobe: effective,
                max_codes,
            },
            base => base,
        };

        debug!(
            resolved_nprobe = resolved,
            forwarded = effective,
            dropped = eligible_centroid_ids.len() - effective,
            "truncated eligible centroids"
        );

        let assign = &eligible_centroid_ids[..effective];
        let coarse = &centroid_distances[..effective];
        Ok(ivf.search_preassigned(1, x, k, assign, coarse, &params)?)
    }

    fn expect_single_query(&self, x: &[T]) -> Result<()> {
        let code_len = T::code_len(self.d());
        if x.len() != code_len {
            return Err(QuiverError::DimensionMismatch {
                expected: code_len,
                actual: x.len(),
            });
        }
        Ok(())
    }
}
