//! # hugefill-core
//!
//! A huge-page-aware filler for page-level allocations: packs small,
//! variable-length spans onto a pool of aligned huge-page regions and
//! decides, from recent demand history, when backing memory can safely be
//! returned to the operating system.
//!
//! The crate is a logical model of page state. It never maps or unmaps
//! memory itself; virtual-memory acquisition and the unback primitive are
//! collaborator traits, and time comes from an injected clock. No `unsafe`
//! code is permitted at the crate level.

#![deny(unsafe_code)]

pub mod bitmap;
pub mod clock;
pub mod config;
pub mod filler;
pub mod heap;
pub mod pages;
pub mod range_tracker;
pub mod report;
pub mod residency;
pub mod span;
pub mod stats;
pub mod subrelease;
pub mod tracker;

pub use clock::{Clock, FakeClock, MonotonicClock};
pub use config::{DenseTrackerPolicy, FillerConfig};
pub use filler::{
    BackingStats, FillerAllocation, FillerStatsSnapshot, HugePageFiller, ReleaseLogRecord,
    TrackerClass, TrackerId, CANDIDATES_FOR_RELEASE,
};
pub use heap::{HeapAllocation, PageHeap};
pub use pages::{
    n_huge_pages, HugeLength, HugePage, Length, PageId, Range, MAX_RESIDENCY_BITS,
    MAX_SMALL_PAGES, PAGES_PER_HUGE_PAGE,
};
pub use report::{FillerReport, PbtxtRegion, Printer, PRINTER_LIMIT};
pub use residency::{FakeResidency, Residency, ResidencyError, SinglePageBitmaps};
pub use span::{AccessDensity, LargeSpanStats, SmallSpanStats, SpanAllocInfo};
pub use subrelease::{
    DemandRecorder, SkipSubreleaseIntervals, SkippedSubreleaseTotals, SubreleaseStats,
};
pub use tracker::{MemoryModifyFunction, NativePageCounterInfo, PageAllocation, PageTracker};
