//! Per-huge-page allocation tracking.
//!
//! A `PageTracker` owns the page-level state of one huge-page region: a
//! live-page bitmap, a released-page bitmap and the bookkeeping the filler
//! sorts on. Releasing is delegated to a fallible collaborator; a failed
//! unback leaves the affected pages free and backed, to be retried by a
//! later sweep.

use crate::bitmap::{PageBitmap, PAGE_WORDS};
use crate::pages::{HugePage, Length, PageId, Range, MAX_SMALL_PAGES, PAGES_PER_HUGE_PAGE};
use crate::range_tracker::RangeTracker;
use crate::residency::SinglePageBitmaps;
use crate::span::{LargeSpanStats, SmallSpanStats};

/// Collaborator that returns a page range to the operating system.
///
/// `false` means the range is still backed; the caller must not mark it
/// released. No other rollback happens on failure.
pub trait MemoryModifyFunction {
    fn unback(&mut self, r: Range) -> bool;
}

impl<F: FnMut(Range) -> bool> MemoryModifyFunction for F {
    fn unback(&mut self, r: Range) -> bool {
        self(r)
    }
}

/// Result of [`PageTracker::get`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageAllocation {
    pub page: PageId,
    /// Pages in the returned range that had been unbacked; the caller must
    /// treat them as needing backing.
    pub previously_released: Length,
}

/// Residency classification of the native pages under one huge page.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NativePageCounterInfo {
    pub n_free_swapped: usize,
    pub n_used_swapped: usize,
    pub n_used_unbacked: usize,
    pub n_non_free_non_used_unbacked: usize,
}

pub struct PageTracker {
    location: HugePage,
    pages: RangeTracker<PAGE_WORDS>,
    released_map: PageBitmap,
    released_count: usize,
    donated: bool,
    /// Cleared the first time any page of this region is subreleased.
    unbroken: bool,
    alloc_time: i64,
}

const CAPACITY: usize = PAGES_PER_HUGE_PAGE.raw() as usize;

impl PageTracker {
    #[must_use]
    pub fn new(location: HugePage, donated: bool, now: i64) -> Self {
        Self {
            location,
            pages: RangeTracker::new(),
            released_map: PageBitmap::new(),
            released_count: 0,
            donated,
            unbroken: true,
            alloc_time: now,
        }
    }

    #[must_use]
    pub fn location(&self) -> HugePage {
        self.location
    }

    #[must_use]
    pub fn used_pages(&self) -> Length {
        Length(self.pages.used() as u64)
    }

    /// Free and still backed pages.
    #[must_use]
    pub fn free_pages(&self) -> Length {
        Length((self.pages.total_free() - self.released_count) as u64)
    }

    #[must_use]
    pub fn released_pages(&self) -> Length {
        Length(self.released_count as u64)
    }

    #[must_use]
    pub fn longest_free_range(&self) -> Length {
        Length(self.pages.longest_free() as u64)
    }

    /// Number of maximal free runs, the fragmentation tie-breaker for list
    /// ordering.
    #[must_use]
    pub fn free_chunks(&self) -> usize {
        self.pages.free_chunks()
    }

    #[must_use]
    pub fn empty(&self) -> bool {
        self.pages.used() == 0
    }

    /// Whether any page is currently unbacked.
    #[must_use]
    pub fn released(&self) -> bool {
        self.released_count > 0
    }

    /// Whether this region ever had pages subreleased.
    #[must_use]
    pub fn broken(&self) -> bool {
        !self.unbroken
    }

    #[must_use]
    pub fn donated(&self) -> bool {
        self.donated
    }

    pub(crate) fn set_donated(&mut self, donated: bool) {
        self.donated = donated;
    }

    #[must_use]
    pub fn nalloc(&self) -> u64 {
        self.pages.allocs()
    }

    #[must_use]
    pub fn alloc_time(&self) -> i64 {
        self.alloc_time
    }

    /// Allocates the lowest-indexed run of `n` pages.
    ///
    /// The caller must have checked `longest_free_range() >= n`; anything
    /// else is a programming error.
    pub fn get(&mut self, n: Length) -> PageAllocation {
        assert!(n <= PAGES_PER_HUGE_PAGE, "oversized request: {n:?}");
        let want = n.raw() as usize;
        let index = self
            .pages
            .find_and_mark(want)
            .expect("caller must consult longest_free_range first");
        let previously_released = self.released_map.count_set_in_range(index, want);
        if previously_released > 0 {
            self.released_map.clear_range(index, want);
            self.released_count -= previously_released;
        }
        PageAllocation {
            page: self.location.first_page() + Length(index as u64),
            previously_released: Length(previously_released as u64),
        }
    }

    /// Returns a range allocated by [`get`](Self::get). Released state is
    /// untouched; freed pages coalesce implicitly through the bitmap.
    pub fn put(&mut self, r: Range) {
        let index = (r.start - self.location.first_page()).raw() as usize;
        let n = r.n.raw() as usize;
        assert!(index + n <= CAPACITY, "put outside tracker: {r:?}");
        self.pages.unmark(index, n);
    }

    /// Unbacks every free, not-yet-released page, coalescing each candidate
    /// with a trailing already-released run when that run extends to a live
    /// page or the end of the region. Returns the number of pages newly
    /// released; a second call with no intervening `put` releases nothing.
    pub fn release_free(&mut self, unback: &mut impl MemoryModifyFunction) -> Length {
        let mut newly_released = 0usize;
        let candidates = self.pages.bits().union(&self.released_map);
        let mut cursor = 0usize;
        while let Some(start) = candidates.find_clear(cursor) {
            let end = candidates.find_set(start).unwrap_or(CAPACITY);
            // Fold a trailing released run into the same call unless it
            // borders another free unreleased candidate.
            let mut call_end = end;
            if end < CAPACITY && self.released_map.get(end) {
                let released_end = self.released_map.find_clear(end).unwrap_or(CAPACITY);
                if released_end == CAPACITY || self.pages.get(released_end) {
                    call_end = released_end;
                }
            }
            let range = Range::new(
                self.location.first_page() + Length(start as u64),
                Length((call_end - start) as u64),
            );
            if unback.unback(range) {
                // Only [start, end) is newly released; the folded tail
                // already was.
                self.released_map.set_range(start, end - start);
                self.released_count += end - start;
                newly_released += end - start;
                self.unbroken = false;
            }
            cursor = call_end;
            if cursor >= CAPACITY {
                break;
            }
        }
        Length(newly_released as u64)
    }

    /// Accumulates free-span statistics from this region. Scans stop at the
    /// last valid bit even when a free run ends exactly there.
    pub fn add_span_stats(&self, small: &mut SmallSpanStats, large: &mut LargeSpanStats) {
        let mut cursor = 0usize;
        while let Some(start) = self.pages.bits().find_clear(cursor) {
            let end = self.pages.bits().find_set(start).unwrap_or(CAPACITY);
            let len = end - start;
            let released = self.released_map.count_set_in_range(start, len);
            if len <= MAX_SMALL_PAGES.raw() as usize {
                // Majority of the run decides which histogram it lands in.
                if released * 2 > len {
                    small.returned_length[len] += 1;
                } else {
                    small.normal_length[len] += 1;
                }
            } else {
                large.spans += 1;
                large.normal_pages += Length((len - released) as u64);
                large.returned_pages += Length(released as u64);
            }
            cursor = end;
            if cursor >= CAPACITY {
                break;
            }
        }
    }

    /// Classifies the region's native pages against the residency oracle's
    /// bitmaps. `native_pages_in_hp` is the kernel's page count for one
    /// huge page and may be smaller or larger than the allocator's.
    #[must_use]
    pub fn count_info_in_huge_page(
        &self,
        bitmaps: &SinglePageBitmaps,
        native_pages_in_hp: usize,
    ) -> NativePageCounterInfo {
        let mut info = NativePageCounterInfo::default();
        for native in 0..native_pages_in_hp {
            let (used, free_backed) = self.native_page_state(native, native_pages_in_hp);
            let unbacked = bitmaps.unbacked.get(native);
            let swapped = bitmaps.swapped.get(native);
            if swapped {
                if used {
                    info.n_used_swapped += 1;
                } else if free_backed {
                    info.n_free_swapped += 1;
                }
            }
            if unbacked {
                if used {
                    info.n_used_unbacked += 1;
                } else if !free_backed {
                    info.n_non_free_non_used_unbacked += 1;
                }
            }
        }
        info
    }

    /// (used, free_and_backed) for one native page, scaling between the
    /// allocator's page size and the kernel's.
    fn native_page_state(&self, native: usize, native_pages_in_hp: usize) -> (bool, bool) {
        if native_pages_in_hp >= CAPACITY {
            let ratio = native_pages_in_hp / CAPACITY;
            let page = native / ratio;
            (self.pages.get(page), !self.pages.get(page) && !self.released_map.get(page))
        } else {
            let ratio = CAPACITY / native_pages_in_hp;
            let start = native * ratio;
            let used = self.pages.bits().count_set_in_range(start, ratio) > 0;
            let released = self.released_map.count_set_in_range(start, ratio);
            let free_backed = !used && released < ratio;
            (used, free_backed)
        }
    }

    #[cfg(debug_assertions)]
    pub(crate) fn check_invariants(&self) {
        let mut overlap = 0;
        for i in 0..CAPACITY {
            if self.pages.get(i) && self.released_map.get(i) {
                overlap += 1;
            }
        }
        assert_eq!(overlap, 0, "allocated and released overlap");
        assert_eq!(
            self.used_pages() + self.free_pages() + self.released_pages(),
            PAGES_PER_HUGE_PAGE
        );
    }
}

impl std::fmt::Debug for PageTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageTracker")
            .field("location", &self.location)
            .field("used", &self.used_pages())
            .field("free", &self.free_pages())
            .field("released", &self.released_pages())
            .field("donated", &self.donated)
            .finish()
    }
}
