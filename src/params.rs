//! Per-query search parameter resolution.
//!
//! Callers tune inverted-file searches with percentages (`ivf_nprobe_pct`,
//! `ivf_max_codes_pct`) instead of absolute counts. The resolver turns those
//! into the `nprobe` / `max_codes` the engine understands, starting from the
//! index's current state and optional one-shot overrides.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{QuiverError, Result};
use crate::index::traits::Component;
use crate::index::Index;
use crate::selector::IdSelector;

/// Resolved parameters for one query. The selector is borrowed, so the
/// parameters cannot outlive the call that owns the selector.
#[derive(Debug, Clone, Copy)]
pub enum SearchParams<'s> {
    /// Index has no inverted-file facet: only a filter applies.
    Base { selector: Option<&'s IdSelector> },
    Ivf {
        selector: Option<&'s IdSelector>,
        nprobe: usize,
        /// Cap on distance computations per query, `0` for unbounded.
        max_codes: usize,
    },
}

impl<'s> SearchParams<'s> {
    pub fn base(selector: Option<&'s IdSelector>) -> Self {
        SearchParams::Base { selector }
    }

    pub fn selector(&self) -> Option<&'s IdSelector> {
        match *self {
            SearchParams::Base { selector } | SearchParams::Ivf { selector, .. } => selector,
        }
    }

    pub fn nprobe(&self) -> Option<usize> {
        match *self {
            SearchParams::Ivf { nprobe, .. } => Some(nprobe),
            SearchParams::Base { .. } => None,
        }
    }

    pub fn max_codes(&self) -> usize {
        match *self {
            SearchParams::Ivf { max_codes, .. } => max_codes,
            SearchParams::Base { .. } => 0,
        }
    }

    /// Whether `id` passes the attached selector (if any).
    #[inline]
    pub fn accepts(&self, id: i64) -> bool {
        self.selector().is_none_or(|s| s.is_member(id))
    }
}

/// Caller-facing percentage knobs. `0` keeps the index's own value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PercentageOverride {
    #[serde(rename = "ivf_nprobe_pct", default)]
    pub nprobe_pct: f32,
    #[serde(rename = "ivf_max_codes_pct", default)]
    pub max_codes_pct: f32,
}

impl PercentageOverride {
    pub fn new(nprobe_pct: f32, max_codes_pct: f32) -> Self {
        Self {
            nprobe_pct,
            max_codes_pct,
        }
    }

    /// Parse a JSON payload such as `{"ivf_nprobe_pct": 10}`. An empty payload
    /// means no override.
    pub fn from_json(payload: &[u8]) -> Result<Option<Self>> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        let parsed: Self = serde_json::from_slice(payload).map_err(|e| {
            QuiverError::invalid(format!("failed to unmarshal IVF search params, err: {e}"))
        })?;
        parsed.validate()?;
        Ok(Some(parsed))
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.nprobe_pct) {
            return Err(QuiverError::invalid(format!(
                "invalid IVF search params, ivf_nprobe_pct:{} out of range, should be in range [0, 100]",
                self.nprobe_pct
            )));
        }
        if !(0.0..=100.0).contains(&self.max_codes_pct) {
            return Err(QuiverError::invalid(format!(
                "invalid IVF search params, ivf_max_codes_pct:{} out of range, should be in range [0, 100]",
                self.max_codes_pct
            )));
        }
        Ok(())
    }
}

/// One-shot replacements for the index's own `nprobe` / `nlist` / `ntotal`.
/// Zero fields are ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TempOverrides {
    pub nprobe: usize,
    pub nlist: usize,
    pub nvecs: usize,
}

/// `max(floor(nlist * pct / 100), 1)`: a positive percentage always scans at
/// least one partition.
///
/// The product is taken in single precision, matching the precision the
/// percentage arrives in. Widening first would expose the representation
/// error of values like `0.9` and land one below the decimal result.
pub fn nprobe_from_pct(nlist: usize, pct: f32) -> usize {
    ((nlist as f32 * (pct / 100.0)) as usize).max(1)
}

/// `floor(nvecs * pct / 100)`, with no lower clamp.
pub fn max_codes_from_pct(nvecs: usize, pct: f32) -> usize {
    (nvecs as f32 * (pct / 100.0)) as usize
}

/// Build the parameters for one query against `index`.
///
/// Percentages are validated up front, before anything reaches the engine,
/// even for indexes where they would not apply.
pub fn resolve_search_params<'s, T: Component>(
    index: &Index<T>,
    overrides: Option<&PercentageOverride>,
    selector: Option<&'s IdSelector>,
    temp: Option<&TempOverrides>,
) -> Result<SearchParams<'s>> {
    if let Some(o) = overrides {
        o.validate()?;
    }
    if let Some(s) = selector {
        s.ensure_live()?;
    }

    let native = index.native()?;
    let Some(ivf) = native.ivf() else {
        return Ok(SearchParams::Base { selector });
    };

    let mut nlist = ivf.nlist();
    let mut nprobe = ivf.nprobe();
    let mut nvecs = native.ntotal();

    if let Some(t) = temp {
        if t.nlist > 0 {
            nlist = t.nlist;
        }
        if t.nprobe > 0 {
            nprobe = t.nprobe;
        }
        if t.nvecs > 0 {
            nvecs = t.nvecs;
        }
    }

    let mut max_codes = 0;
    if let Some(o) = overrides {
        if o.nprobe_pct > 0.0 {
            nprobe = nprobe_from_pct(nlist, o.nprobe_pct);
        }
        if o.max_codes_pct > 0.0 {
            max_codes = max_codes_from_pct(nvecs, o.max_codes_pct);
        }
    }

    debug!(nlist, nprobe, nvecs, max_codes, "resolved IVF search params");

    Ok(SearchParams::Ivf {
        selector,
        nprobe,
        max_codes,
    })
}
