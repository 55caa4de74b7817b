//! Filler configuration.
//!
//! The dense-tracker policy is set programmatically or via the
//! `HUGEFILL_DENSE_TRACKER` environment variable:
//! - `lfr-chunks` (default): densely-accessed trackers are ordered like
//!   sparse ones, by longest free range with a fragmentation tie-break.
//! - `spans-allocated`: densely-accessed trackers are ordered by lifetime
//!   allocation count, and dense requests are placed one page at a time.

use serde::Serialize;

/// Ordering policy for densely-accessed tracker lists.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DenseTrackerPolicy {
    /// Order by longest free range, tie-break on fragmentation.
    #[default]
    LongestFreeRangeAndChunks,
    /// Order by lifetime allocation count, fullest history first.
    SpansAllocated,
}

impl DenseTrackerPolicy {
    /// Parse from string (case-insensitive). Unknown values fall back to
    /// the default policy.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "spans-allocated" | "spans_allocated" | "spans" | "nalloc" => Self::SpansAllocated,
            _ => Self::LongestFreeRangeAndChunks,
        }
    }

    /// Reads `HUGEFILL_DENSE_TRACKER`, defaulting when unset.
    #[must_use]
    pub fn from_env() -> Self {
        std::env::var("HUGEFILL_DENSE_TRACKER")
            .map(|v| Self::from_str_loose(&v))
            .unwrap_or_default()
    }
}

/// Knobs the filler is constructed with.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FillerConfig {
    pub dense_tracker: DenseTrackerPolicy,
}

impl FillerConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            dense_tracker: DenseTrackerPolicy::from_env(),
        }
    }
}
