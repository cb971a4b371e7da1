//! Identifier selectors: predicates restricting which stored vectors take part
//! in a search or a removal.
//!
//! Include and exclude selectors copy the identifier set into a compressed
//! bitmap owned by the selector. A selector is scoped to one call: build it,
//! hand a reference to the search, and let it drop (or `release()` it).

use roaring::RoaringTreemap;

use crate::error::{QuiverError, Result};
use crate::types::VectorId;

#[derive(Debug, Clone)]
enum SelectorKind {
    AcceptAll,
    Include(RoaringTreemap),
    Exclude(RoaringTreemap),
}

/// A predicate over vector identifiers.
#[derive(Debug, Clone)]
pub struct IdSelector {
    kind: Option<SelectorKind>,
}

fn to_bitmap(ids: &[VectorId]) -> RoaringTreemap {
    // Bit-preserving cast: membership only, ordering is irrelevant.
    ids.iter().map(|&id| id as u64).collect()
}

impl IdSelector {
    /// Select exactly the given identifiers.
    pub fn include(ids: &[VectorId]) -> Result<Self> {
        if ids.is_empty() {
            return Err(QuiverError::invalid(
                "include selector requires at least one identifier",
            ));
        }
        Ok(Self {
            kind: Some(SelectorKind::Include(to_bitmap(ids))),
        })
    }

    /// Select every identifier except the given ones.
    pub fn exclude(ids: &[VectorId]) -> Result<Self> {
        if ids.is_empty() {
            return Err(QuiverError::invalid(
                "exclude selector requires at least one identifier",
            ));
        }
        Ok(Self {
            kind: Some(SelectorKind::Exclude(to_bitmap(ids))),
        })
    }

    pub fn accept_all() -> Self {
        Self {
            kind: Some(SelectorKind::AcceptAll),
        }
    }

    /// Whether `id` passes the predicate. A released selector accepts nothing.
    #[inline]
    pub fn is_member(&self, id: VectorId) -> bool {
        match &self.kind {
            Some(SelectorKind::AcceptAll) => true,
            Some(SelectorKind::Include(set)) => set.contains(id as u64),
            Some(SelectorKind::Exclude(set)) => !set.contains(id as u64),
            None => false,
        }
    }

    /// Number of identifiers named by an include/exclude selector.
    pub fn len(&self) -> usize {
        match &self.kind {
            Some(SelectorKind::Include(set)) | Some(SelectorKind::Exclude(set)) => {
                set.len() as usize
            }
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_accept_all(&self) -> bool {
        matches!(self.kind, Some(SelectorKind::AcceptAll))
    }

    pub fn is_released(&self) -> bool {
        self.kind.is_none()
    }

    /// Free the identifier copy. Releasing twice is a no-op.
    pub fn release(&mut self) {
        self.kind = None;
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.is_released() {
            return Err(QuiverError::invalid("selector has been released"));
        }
        Ok(())
    }
}
