//! Span placement hints and span-size statistics.

use serde::Serialize;

use crate::pages::{Length, MAX_SMALL_PAGES};

/// Predicted access density of a span, chosen by the caller. Sparse spans
/// are packed together (and may share donated huge pages); dense spans get
/// their own tracker population.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum AccessDensity {
    #[default]
    Sparse,
    Dense,
}

/// Number of density classes, for stats arrays indexed by density.
pub const DENSITY_CLASSES: usize = 2;

impl AccessDensity {
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            AccessDensity::Sparse => 0,
            AccessDensity::Dense => 1,
        }
    }

    #[must_use]
    pub const fn all() -> [AccessDensity; DENSITY_CLASSES] {
        [AccessDensity::Sparse, AccessDensity::Dense]
    }

    /// Human label used by the stats printer.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            AccessDensity::Sparse => "sparsely-accessed",
            AccessDensity::Dense => "densely-accessed",
        }
    }
}

/// Allocation hint passed through from span construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SpanAllocInfo {
    pub objects_per_span: usize,
    pub density: AccessDensity,
}

impl SpanAllocInfo {
    #[must_use]
    pub const fn new(objects_per_span: usize, density: AccessDensity) -> Self {
        Self {
            objects_per_span,
            density,
        }
    }
}

/// Entries in the small-span histograms, indexed by span length in pages.
pub const SMALL_SPAN_BUCKETS: usize = MAX_SMALL_PAGES.raw() as usize + 1;

/// Histogram of free spans no longer than [`MAX_SMALL_PAGES`], split by
/// whether the span's pages are backed (`normal`) or returned to the OS.
#[derive(Clone, Copy)]
pub struct SmallSpanStats {
    pub normal_length: [usize; SMALL_SPAN_BUCKETS],
    pub returned_length: [usize; SMALL_SPAN_BUCKETS],
}

impl Default for SmallSpanStats {
    fn default() -> Self {
        Self {
            normal_length: [0; SMALL_SPAN_BUCKETS],
            returned_length: [0; SMALL_SPAN_BUCKETS],
        }
    }
}

impl std::fmt::Debug for SmallSpanStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmallSpanStats")
            .field("normal", &self.normal_length.iter().sum::<usize>())
            .field("returned", &self.returned_length.iter().sum::<usize>())
            .finish()
    }
}

/// Aggregate over free spans longer than [`MAX_SMALL_PAGES`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LargeSpanStats {
    pub spans: usize,
    pub normal_pages: Length,
    pub returned_pages: Length,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn density_indices_are_stable() {
        assert_eq!(AccessDensity::Sparse.index(), 0);
        assert_eq!(AccessDensity::Dense.index(), 1);
        assert_eq!(AccessDensity::all().len(), DENSITY_CLASSES);
    }

    #[test]
    fn labels() {
        assert_eq!(AccessDensity::Sparse.label(), "sparsely-accessed");
        assert_eq!(AccessDensity::Dense.label(), "densely-accessed");
    }

    #[test]
    fn small_span_stats_default_is_empty() {
        let s = SmallSpanStats::default();
        assert!(s.normal_length.iter().all(|&c| c == 0));
        assert!(s.returned_length.iter().all(|&c| c == 0));
    }
}
