//! Skip-subrelease policy end-to-end: demand patterns, retrospective
//! correctness judgments and the report lines monitoring scrapes.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use hugefill_core::pages::HUGE_PAGE_SIZE;
use hugefill_core::{
    AccessDensity, Clock, FakeClock, FillerConfig, HugePage, HugePageFiller, Length, PageId,
    PageTracker, Printer, Range, SkipSubreleaseIntervals, SpanAllocInfo, TrackerId,
    PAGES_PER_HUGE_PAGE,
};

const N: Length = PAGES_PER_HUGE_PAGE;
const SPARSE: SpanAllocInfo = SpanAllocInfo::new(1, AccessDensity::Sparse);

fn minutes(m: u64) -> Duration {
    Duration::from_secs(m * 60)
}

struct Alloc {
    tracker: TrackerId,
    page: PageId,
    n: Length,
}

struct Harness {
    clock: Rc<FakeClock>,
    filler: HugePageFiller<Rc<FakeClock>, Box<dyn FnMut(Range) -> bool>>,
    next_hp: u64,
}

impl Harness {
    fn new() -> Self {
        let clock = Rc::new(FakeClock::new());
        let ok = Rc::new(Cell::new(true));
        let unback: Box<dyn FnMut(Range) -> bool> = Box::new(move |_| ok.get());
        Self {
            filler: HugePageFiller::new(Rc::clone(&clock), FillerConfig::default(), unback),
            clock,
            next_hp: 0,
        }
    }

    fn advance(&self, d: Duration) {
        self.clock.advance(d);
    }

    fn allocate(&mut self, n: Length) -> Alloc {
        if let Some(a) = self.filler.try_get(n, SPARSE) {
            return Alloc {
                tracker: a.tracker,
                page: a.page,
                n,
            };
        }
        let hp = HugePage::containing(self.next_hp * HUGE_PAGE_SIZE as u64);
        self.next_hp += 1;
        let mut tracker = PageTracker::new(hp, false, self.clock.now());
        let page = tracker.get(n).page;
        let tracker = self.filler.contribute(tracker, false, SPARSE);
        Alloc { tracker, page, n }
    }

    fn delete(&mut self, a: Alloc) {
        self.filler.put(a.tracker, Range::new(a.page, a.n));
    }

    fn release(&mut self, desired: Length, intervals: SkipSubreleaseIntervals) -> Length {
        self.filler.release_pages(desired, intervals, false, false)
    }

    fn release_partial(&mut self, desired: Length, intervals: SkipSubreleaseIntervals) -> Length {
        self.filler.release_partial_pages(desired, intervals)
    }

    fn print(&self) -> String {
        let mut printer = Printer::default();
        self.filler.print(&mut printer, true, None);
        printer.into_string()
    }
}

/// Generates a long-term demand peak, waits `a`, generates a higher peak
/// plus a short-term fluctuation, waits `b`, dips and tries to
/// subrelease, then waits `c` and produces the highest peak so the
/// subrelease decision can be judged. Mirrors the filler's production
/// demand shape: peaks are built from 3/4 + 1/4 huge-page pairs.
fn demand_pattern(
    h: &mut Harness,
    partial: bool,
    a: Duration,
    b: Duration,
    c: Duration,
    intervals: SkipSubreleaseIntervals,
    expected_subrelease: bool,
) {
    // First peak: min demand 3/4 N, max demand N.
    let peak1a = h.allocate(N * 3 / 4);
    let peak1b = h.allocate(N / 4);
    h.advance(a);
    // Second peak: min demand 0, max demand 2N.
    h.delete(peak1a);
    h.delete(peak1b);

    let half = h.allocate(N / 2);
    let tiny1 = h.allocate(N / 4);
    let tiny2 = h.allocate(N / 4);

    let peak2a = h.allocate(N * 3 / 4);
    let peak2b = h.allocate(N / 4);
    assert_eq!(h.filler.used_pages(), N * 2);
    h.delete(peak2a);
    h.delete(peak2b);
    h.advance(b);
    h.delete(half);
    assert_eq!(h.filler.free_pages(), N / 2);

    // Released pages are limited to the pages currently free.
    let expected = if expected_subrelease { N / 2 } else { Length(0) };
    let released = if partial {
        h.release_partial(N * 10, intervals)
    } else {
        h.release(N * 10, intervals)
    };
    assert_eq!(released, expected);

    h.advance(c);
    // Third peak: min demand 1/2 N, max demand 2 + 1/2 N.
    let peak3a = h.allocate(N * 3 / 4);
    let peak3b = h.allocate(N / 4);
    let peak4a = h.allocate(N * 3 / 4);
    let peak4b = h.allocate(N / 4);

    h.delete(tiny1);
    h.delete(tiny2);
    h.delete(peak3a);
    h.delete(peak3b);
    h.delete(peak4a);
    h.delete(peak4b);

    assert_eq!(h.filler.used_pages(), Length(0));
    assert_eq!(h.filler.unmapped_pages(), Length(0));
    assert_eq!(h.filler.free_pages(), Length(0));

    // When the dip was subreleased, the third peak refilled those pages
    // (re-backing them), so nothing is left to release or to credit.
    let released = if partial {
        h.release_partial(N * 10, SkipSubreleaseIntervals::default())
    } else {
        h.release(N * 10, SkipSubreleaseIntervals::default())
    };
    assert_eq!(released, Length(0));
}

fn run_demand_patterns(h: &mut Harness, partial: bool) {
    // Peak interval alone: correctly skips half a huge page.
    demand_pattern(
        h,
        partial,
        minutes(2),
        minutes(1),
        minutes(3),
        SkipSubreleaseIntervals {
            peak: minutes(3),
            ..Default::default()
        },
        false,
    );
    h.advance(minutes(30));

    // Short/long intervals are ignored while a peak interval is set.
    demand_pattern(
        h,
        partial,
        minutes(2),
        minutes(1),
        minutes(3),
        SkipSubreleaseIntervals {
            peak: minutes(3),
            short: Duration::from_millis(10),
            long: Duration::from_millis(20),
        },
        false,
    );
    h.advance(minutes(30));

    // The demand peaks have aged out of a two-minute window; everything
    // free is subreleased.
    demand_pattern(
        h,
        partial,
        minutes(6),
        minutes(3),
        minutes(3),
        SkipSubreleaseIntervals {
            peak: minutes(2),
            short: minutes(5),
            ..Default::default()
        },
        true,
    );
    h.advance(minutes(30));

    // All intervals zero disables the policy.
    demand_pattern(
        h,
        partial,
        minutes(1),
        minutes(1),
        minutes(4),
        SkipSubreleaseIntervals::default(),
        true,
    );
    h.advance(minutes(30));

    // Short+long fluctuations: skips, but the next peak arrives too late,
    // so this one is judged incorrect.
    demand_pattern(
        h,
        partial,
        minutes(3),
        minutes(2),
        minutes(7),
        SkipSubreleaseIntervals {
            short: minutes(3),
            long: minutes(6),
            ..Default::default()
        },
        false,
    );
    h.advance(minutes(30));

    // Short+long with tight windows: recent demand justifies the release.
    demand_pattern(
        h,
        partial,
        minutes(4),
        minutes(2),
        minutes(3),
        SkipSubreleaseIntervals {
            short: minutes(1),
            long: minutes(2),
            ..Default::default()
        },
        true,
    );
    h.advance(minutes(30));

    // Short interval alone: correctly skips.
    demand_pattern(
        h,
        partial,
        minutes(4),
        minutes(2),
        minutes(3),
        SkipSubreleaseIntervals {
            short: minutes(3),
            ..Default::default()
        },
        false,
    );
    h.advance(minutes(30));

    // Long interval alone: releases everything free.
    demand_pattern(
        h,
        partial,
        minutes(4),
        minutes(2),
        minutes(3),
        SkipSubreleaseIntervals {
            long: minutes(2),
            ..Default::default()
        },
        true,
    );
    h.advance(minutes(30));

    // A peak in the same epoch as the decision never vindicates it.
    demand_pattern(
        h,
        partial,
        Duration::from_millis(10),
        Duration::from_millis(10),
        Duration::from_millis(10),
        SkipSubreleaseIntervals {
            peak: minutes(2),
            ..Default::default()
        },
        false,
    );
    demand_pattern(
        h,
        partial,
        Duration::from_millis(10),
        Duration::from_millis(10),
        Duration::from_millis(10),
        SkipSubreleaseIntervals {
            short: minutes(1),
            long: minutes(2),
            ..Default::default()
        },
        false,
    );
    h.advance(minutes(30));

    // Make sure the demand history advances past the last decisions.
    let tiny = h.allocate(Length(1));
    h.delete(tiny);
}

#[test]
fn skip_subrelease_demand_patterns() {
    let mut h = Harness::new();
    run_demand_patterns(&mut h, false);

    let text = h.print();
    assert!(
        text.contains(
            "HugePageFiller: Since the start of the execution, 6 subreleases (768 pages) were \
             skipped due to either recent (120s) peaks, or the sum of short-term (60s) \
             fluctuations and long-term (120s) trends."
        ),
        "skip summary missing in:\n{text}"
    );
    assert!(
        text.contains(
            "HugePageFiller: 50.0000% of decisions confirmed correct, 0 pending (50.0000% of \
             pages, 0 pending), as per anticipated 300s realized fragmentation."
        ),
        "correctness summary missing in:\n{text}"
    );
}

#[test]
fn skip_subrelease_demand_patterns_partial_variant() {
    let mut h = Harness::new();
    run_demand_patterns(&mut h, true);

    let text = h.print();
    assert!(text.contains("6 subreleases (768 pages) were skipped"));
    assert!(text.contains("50.0000% of decisions confirmed correct, 0 pending"));
}

#[test]
fn skip_subrelease_caps_at_observed_demand_peak() {
    // Short-term fluctuation plus long-term trend exceeds the measured
    // peak; the cap lets the filler release down to that peak.
    let mut h = Harness::new();
    let peak1a = h.allocate(N * 3 / 4);
    let peak1b = h.allocate(N * 3 / 4);
    let half1a = h.allocate(N / 2);
    let half1b = h.allocate(N / 2);
    assert_eq!(h.filler.used_pages(), N * 2 + N / 2);
    h.advance(minutes(1));

    h.delete(half1b);
    let half1c = h.allocate(N / 2);
    assert_eq!(h.filler.used_pages(), N * 2 + N / 2);
    assert_eq!(h.filler.free_pages(), N / 2);
    h.advance(minutes(1));

    // Fluctuation 1.75N plus trend 2N would forbid any release; the
    // observed peak of 2.5N caps the requirement at current usage.
    assert_eq!(
        h.release(
            N * 10,
            SkipSubreleaseIntervals {
                short: minutes(2),
                long: minutes(2),
                ..Default::default()
            }
        ),
        N / 2
    );
    h.delete(peak1a);
    h.delete(peak1b);
    h.delete(half1a);
    h.delete(half1c);
}

#[test]
fn skipped_subrelease_is_judged_against_capacity() {
    let mut h = Harness::new();

    // Three huge pages; recent peak 2.5N is below the 3N capacity, so the
    // skip is reported against the peak.
    let peak1a = h.allocate(N * 3 / 4);
    let peak1b = h.allocate(N / 4);
    let peak2a = h.allocate(N * 3 / 4);
    let peak2b = h.allocate(N / 4);
    let half1 = h.allocate(N / 2);
    assert_eq!(h.filler.used_pages(), N * 2 + N / 2);
    h.advance(minutes(2));
    h.delete(half1);
    h.delete(peak1b);
    h.delete(peak2b);
    let peak3a = h.allocate(N * 3 / 4);
    assert_eq!(h.filler.free_pages(), N * 3 / 4);
    // Skips a quarter huge page, releases half.
    assert_eq!(
        h.release(
            N * 10,
            SkipSubreleaseIntervals {
                peak: minutes(3),
                ..Default::default()
            }
        ),
        N / 2
    );
    h.advance(minutes(3));
    // Demand returns to the anticipated 2.5N: the skip was correct.
    let tiny1 = h.allocate(N / 4);
    assert_eq!(h.filler.used_pages(), N * 2 + N / 2);
    h.delete(peak1a);
    h.delete(peak2a);
    h.delete(peak3a);
    h.delete(tiny1);
    assert_eq!(h.filler.used_pages(), Length(0));
    // Emptied released trackers leave their backed remainders as credit.
    assert_eq!(h.release(N * 10, SkipSubreleaseIntervals::default()), N * 3 / 4);

    h.advance(minutes(30));

    // Now the capacity (one huge page) is below the recent peak (2N); the
    // report anticipates only the capacity, and demand reaches it.
    let peak4a = h.allocate(N * 3 / 4);
    let peak4b = h.allocate(N / 4);
    let peak5a = h.allocate(N * 3 / 4);
    let peak5b = h.allocate(N / 4);
    h.advance(minutes(2));
    h.delete(peak4a);
    h.delete(peak4b);
    h.delete(peak5a);
    h.delete(peak5b);
    let half2 = h.allocate(N / 2);
    assert_eq!(
        h.release(
            N * 10,
            SkipSubreleaseIntervals {
                peak: minutes(3),
                ..Default::default()
            }
        ),
        Length(0)
    );
    h.advance(minutes(3));
    let half3 = h.allocate(N / 2);
    h.delete(half2);
    h.delete(half3);
    assert_eq!(h.filler.used_pages(), Length(0));
    assert_eq!(h.release(N * 10, SkipSubreleaseIntervals::default()), Length(0));
    h.advance(minutes(30));
    let tiny2 = h.allocate(Length(1));
    h.delete(tiny2);

    let text = h.print();
    assert!(
        text.contains(
            "HugePageFiller: Since the start of the execution, 2 subreleases (192 pages) were \
             skipped due to either recent (180s) peaks, or the sum of short-term (0s) \
             fluctuations and long-term (0s) trends."
        ),
        "skip summary missing in:\n{text}"
    );
    assert!(
        text.contains(
            "HugePageFiller: 100.0000% of decisions confirmed correct, 0 pending (100.0000% of \
             pages, 0 pending), as per anticipated 300s realized fragmentation."
        ),
        "correctness summary missing in:\n{text}"
    );
}

#[test]
fn release_zero_pages_with_intervals_is_harmless() {
    let mut h = Harness::new();
    assert_eq!(
        h.release(
            Length(0),
            SkipSubreleaseIntervals {
                peak: Duration::from_secs(1),
                ..Default::default()
            }
        ),
        Length(0)
    );
}

#[test]
fn subrelease_stats_roll_across_the_window() {
    let mut h = Harness::new();
    h.advance(minutes(1));
    // Ten huge pages with shrinking spare room.
    let mut keepers = Vec::new();
    for i in 0..10u64 {
        keepers.push(h.allocate(N - Length(i + 1)));
    }

    // Two huge pages broken under a hard limit: 10 + 9 pages.
    assert_eq!(
        h.filler
            .release_pages(Length(10), SkipSubreleaseIntervals::default(), false, true),
        Length(10)
    );
    assert_eq!(
        h.filler
            .release_pages(Length(9), SkipSubreleaseIntervals::default(), false, true),
        Length(9)
    );

    h.advance(minutes(1));
    let stats = h.filler.subrelease_stats();
    assert_eq!(stats.total_pages_subreleased, Length(0));
    assert_eq!(stats.num_pages_subreleased, Length(19));
    assert_eq!(stats.num_hugepages_broken.raw(), 2);
    assert_eq!(stats.total_pages_subreleased_due_to_limit, Length(19));
    assert_eq!(stats.total_hugepages_broken_due_to_limit.raw(), 2);

    // Activity rolls the window counters into the totals.
    for _ in 0..5 {
        keepers.push(h.allocate(Length(1)));
    }
    let stats = h.filler.subrelease_stats();
    assert_eq!(stats.total_pages_subreleased, Length(19));
    assert_eq!(stats.total_hugepages_broken.raw(), 2);
    assert_eq!(stats.num_pages_subreleased, Length(0));

    // Three more huge pages broken by the background path: 8 + 7 + 6.
    assert_eq!(h.release(Length(8), SkipSubreleaseIntervals::default()), Length(8));
    assert_eq!(h.release(Length(7), SkipSubreleaseIntervals::default()), Length(7));
    assert_eq!(h.release(Length(6), SkipSubreleaseIntervals::default()), Length(6));

    let stats = h.filler.subrelease_stats();
    assert_eq!(stats.total_pages_subreleased, Length(19));
    assert_eq!(stats.num_pages_subreleased, Length(21));
    assert_eq!(stats.num_hugepages_broken.raw(), 3);
    assert_eq!(stats.total_pages_subreleased_due_to_limit, Length(19));

    h.advance(minutes(10));
    for _ in 0..5 {
        keepers.push(h.allocate(Length(1)));
    }
    let stats = h.filler.subrelease_stats();
    assert_eq!(stats.total_pages_subreleased, Length(40));
    assert_eq!(stats.total_hugepages_broken.raw(), 5);
    assert_eq!(stats.num_pages_subreleased, Length(0));
    assert_eq!(stats.total_pages_subreleased_due_to_limit, Length(19));
    assert_eq!(stats.total_hugepages_broken_due_to_limit.raw(), 2);

    let text = h.print();
    assert!(
        text.contains(
            "HugePageFiller: Since startup, 40 pages subreleased, 5 hugepages broken, (19 \
             pages, 2 hugepages due to reaching memory limit)"
        ),
        "startup summary missing in:\n{text}"
    );
    assert!(
        text.ends_with(
            "HugePageFiller: Subrelease stats last 10 min: total 21 pages subreleased (0 pages \
             from partial allocs), 3 hugepages broken\n"
        ),
        "window summary missing in:\n{text}"
    );
}
