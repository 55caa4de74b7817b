//! Locked page-heap facade over the filler.
//!
//! The filler itself is single-writer and assumes its caller serializes
//! access. `PageHeap` is that caller: one mutex around the filler plus the
//! collaborator that supplies fresh huge-page regions. Everything the
//! lock protects happens inside short critical sections; the unback
//! collaborator is invoked while holding the lock, matching the filler's
//! ordering contract.

use parking_lot::Mutex;

use crate::clock::Clock;
use crate::config::FillerConfig;
use crate::filler::{FillerAllocation, HugePageFiller, TrackerId};
use crate::pages::{HugePage, Length, Range};
use crate::report::{FillerReport, Printer};
use crate::span::SpanAllocInfo;
use crate::subrelease::SkipSubreleaseIntervals;
use crate::tracker::{MemoryModifyFunction, PageTracker};

/// A live allocation handed out by [`PageHeap::allocate`].
#[derive(Clone, Copy, Debug)]
pub struct HeapAllocation {
    tracker: TrackerId,
    range: Range,
    /// Pages that must be re-backed before use.
    pub previously_released: Length,
}

impl HeapAllocation {
    #[must_use]
    pub fn range(&self) -> Range {
        self.range
    }
}

/// Serializes a filler behind the page-heap lock.
pub struct PageHeap<C: Clock, U: MemoryModifyFunction, V: FnMut() -> HugePage> {
    inner: Mutex<Inner<C, U, V>>,
}

struct Inner<C: Clock, U: MemoryModifyFunction, V: FnMut() -> HugePage> {
    filler: HugePageFiller<C, U>,
    grow: V,
}

impl<C: Clock, U: MemoryModifyFunction, V: FnMut() -> HugePage> PageHeap<C, U, V> {
    /// `grow` supplies fresh huge-page regions when no tracker fits.
    pub fn new(clock: C, config: FillerConfig, unback: U, grow: V) -> Self {
        Self {
            inner: Mutex::new(Inner {
                filler: HugePageFiller::new(clock, config, unback),
                grow,
            }),
        }
    }

    /// Places a span, growing by one huge page when nothing fits.
    pub fn allocate(&self, n: Length, info: SpanAllocInfo) -> HeapAllocation {
        let mut inner = self.inner.lock();
        if let Some(FillerAllocation {
            tracker,
            page,
            previously_released,
        }) = inner.filler.try_get(n, info)
        {
            return HeapAllocation {
                tracker,
                range: Range::new(page, n),
                previously_released,
            };
        }
        let hp = (inner.grow)();
        let now = inner.filler.clock().now();
        let mut tracker = PageTracker::new(hp, false, now);
        let page = tracker.get(n).page;
        let id = inner.filler.contribute(tracker, false, info);
        HeapAllocation {
            tracker: id,
            range: Range::new(page, n),
            previously_released: Length::zero(),
        }
    }

    /// Returns a span. Yields the backing huge page to the caller when it
    /// went empty.
    pub fn deallocate(&self, allocation: HeapAllocation) -> Option<HugePage> {
        let mut inner = self.inner.lock();
        inner
            .filler
            .put(allocation.tracker, allocation.range)
            .map(|tracker| tracker.location())
    }

    /// Background subrelease entry point.
    pub fn release(&self, desired: Length, intervals: SkipSubreleaseIntervals) -> Length {
        self.inner
            .lock()
            .filler
            .release_pages(desired, intervals, false, false)
    }

    /// Subrelease that drains partially released huge pages first.
    pub fn release_partial(&self, desired: Length, intervals: SkipSubreleaseIntervals) -> Length {
        self.inner.lock().filler.release_partial_pages(desired, intervals)
    }

    #[must_use]
    pub fn report(&self) -> FillerReport {
        self.inner.lock().filler.report()
    }

    /// Renders the text report under the lock.
    #[must_use]
    pub fn print_to_string(&self, everything: bool) -> String {
        let mut printer = Printer::default();
        self.inner.lock().filler.print(&mut printer, everything, None);
        printer.into_string()
    }

    /// Runs `f` with the locked filler, for statistics consumers that need
    /// a consistent multi-field view.
    pub fn with_filler<R>(&self, f: impl FnOnce(&HugePageFiller<C, U>) -> R) -> R {
        f(&self.inner.lock().filler)
    }
}
