//! Demand history and the skip-subrelease policy.
//!
//! The filler reports its demand (used pages) after every mutation. The
//! recorder files those reports into a ring of one-second epochs and
//! answers the questions the release driver asks: how high did demand get
//! recently, how much does it fluctuate, and were past decisions to skip a
//! subrelease vindicated by demand actually returning.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;

use crate::pages::{HugeLength, Length};

/// Epochs kept in the demand ring. One-second epochs, ten-minute window.
pub const DEMAND_EPOCHS: usize = 600;

/// Seconds covered by one epoch.
pub const EPOCH_SECONDS: u64 = 1;

/// How long after a skipped subrelease its correctness is judged.
pub const SKIP_SUBRELEASE_EVAL_SECONDS: u64 = 300;

/// Window used for the peak-demand section of the report.
pub const SUMMARY_WINDOW_SECONDS: u64 = 300;

/// Look-back intervals steering the skip-subrelease policy. A zero
/// interval disables that term; all three zero disables the policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SkipSubreleaseIntervals {
    pub peak: Duration,
    pub short: Duration,
    pub long: Duration,
}

impl SkipSubreleaseIntervals {
    #[must_use]
    pub fn enabled(&self) -> bool {
        !self.peak.is_zero() || !self.short.is_zero() || !self.long.is_zero()
    }
}

/// Cumulative and recent subrelease accounting. The `num_*` fields cover
/// the window since the demand ring last advanced; they roll into the
/// `total_*` fields on the next epoch boundary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SubreleaseStats {
    pub num_pages_subreleased: Length,
    pub num_partial_alloc_pages_subreleased: Length,
    pub num_hugepages_broken: HugeLength,
    pub total_pages_subreleased: Length,
    pub total_partial_alloc_pages_subreleased: Length,
    pub total_hugepages_broken: HugeLength,
    pub total_pages_subreleased_due_to_limit: Length,
    pub total_hugepages_broken_due_to_limit: HugeLength,
}

impl SubreleaseStats {
    pub(crate) fn record(
        &mut self,
        pages: Length,
        partial_alloc_pages: Length,
        broken: HugeLength,
        due_to_limit: bool,
    ) {
        self.num_pages_subreleased += pages;
        self.num_partial_alloc_pages_subreleased += partial_alloc_pages;
        self.num_hugepages_broken += broken;
        if due_to_limit {
            self.total_pages_subreleased_due_to_limit += pages;
            self.total_hugepages_broken_due_to_limit += broken;
        }
    }

    fn roll(&mut self) -> (Length, Length, HugeLength) {
        let rolled = (
            self.num_pages_subreleased,
            self.num_partial_alloc_pages_subreleased,
            self.num_hugepages_broken,
        );
        self.total_pages_subreleased += self.num_pages_subreleased;
        self.total_partial_alloc_pages_subreleased += self.num_partial_alloc_pages_subreleased;
        self.total_hugepages_broken += self.num_hugepages_broken;
        self.num_pages_subreleased = Length::zero();
        self.num_partial_alloc_pages_subreleased = Length::zero();
        self.num_hugepages_broken = HugeLength(0);
        rolled
    }
}

/// Huge-page population at one demand sample.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HugePageBreakdown {
    pub regular: u64,
    pub donated: u64,
    pub partial_released: u64,
    pub released: u64,
}

impl HugePageBreakdown {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.regular + self.donated + self.partial_released + self.released
    }
}

/// One demand sample, taken after a filler mutation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DemandSnapshot {
    pub used: Length,
    pub free: Length,
    pub unmapped: Length,
    pub huge_pages: HugePageBreakdown,
}

#[derive(Clone, Copy, Debug, Default)]
struct Epoch {
    has_data: bool,
    min_demand: Length,
    max_demand: Length,
    at_peak: DemandSnapshot,
    min_free: Length,
    min_free_backed: Length,
    subreleased: Length,
    partial_subreleased: Length,
    broken: HugeLength,
}

#[derive(Clone, Copy, Debug)]
struct SkipDecision {
    epoch: i64,
    pages: Length,
    anticipated_demand: Length,
}

/// Verdict totals for skipped subreleases.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SkippedSubreleaseTotals {
    pub count: u64,
    pub pages: Length,
    pub correct_count: u64,
    pub correct_pages: Length,
    pub pending_count: u64,
    pub pending_pages: Length,
}

/// Interval echo for the report: the last non-zero value supplied for each
/// policy term.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IntervalEcho {
    pub peak_secs: u64,
    pub short_secs: u64,
    pub long_secs: u64,
}

pub struct DemandRecorder {
    epochs: Vec<Epoch>,
    /// Absolute epoch number of the newest entry, -1 before the first
    /// report.
    last_epoch: i64,
    ticks_per_epoch: f64,
    pending: VecDeque<SkipDecision>,
    skipped: SkippedSubreleaseTotals,
    echo: IntervalEcho,
    /// True once any skip decision was ever recorded; the report prints a
    /// zero evaluation interval until then.
    any_decision: bool,
}

impl DemandRecorder {
    #[must_use]
    pub fn new(clock_freq: f64) -> Self {
        Self {
            epochs: vec![Epoch::default(); DEMAND_EPOCHS],
            last_epoch: -1,
            ticks_per_epoch: clock_freq * EPOCH_SECONDS as f64,
            pending: VecDeque::new(),
            skipped: SkippedSubreleaseTotals::default(),
            echo: IntervalEcho::default(),
            any_decision: false,
        }
    }

    fn epoch_of(&self, now: i64) -> i64 {
        (now as f64 / self.ticks_per_epoch) as i64
    }

    fn slot(&self, epoch: i64) -> usize {
        epoch.rem_euclid(DEMAND_EPOCHS as i64) as usize
    }

    /// Files a demand sample, advancing the ring to the epoch of `now`.
    pub fn report(&mut self, now: i64, snapshot: DemandSnapshot, stats: &mut SubreleaseStats) {
        let epoch = self.epoch_of(now);
        if epoch != self.last_epoch {
            self.advance_to(epoch, stats);
        }
        let slot = self.slot(epoch);
        let entry = &mut self.epochs[slot];
        let free_total = snapshot.free + snapshot.unmapped;
        if !entry.has_data {
            entry.has_data = true;
            entry.min_demand = snapshot.used;
            entry.max_demand = snapshot.used;
            entry.at_peak = snapshot;
            entry.min_free = free_total;
            entry.min_free_backed = snapshot.free;
        } else {
            entry.min_demand = entry.min_demand.min(snapshot.used);
            if snapshot.used > entry.max_demand {
                entry.max_demand = snapshot.used;
                entry.at_peak = snapshot;
            }
            entry.min_free = entry.min_free.min(free_total);
            entry.min_free_backed = entry.min_free_backed.min(snapshot.free);
        }
    }

    fn advance_to(&mut self, epoch: i64, stats: &mut SubreleaseStats) {
        // Judge decisions whose window closed before their evidence is
        // overwritten below.
        self.evaluate_pending(epoch);
        let rolled = if self.last_epoch >= 0 {
            Some(stats.roll())
        } else {
            None
        };
        let first_new = if self.last_epoch < 0 {
            epoch
        } else {
            (self.last_epoch + 1).max(epoch - DEMAND_EPOCHS as i64 + 1)
        };
        for e in first_new..=epoch {
            let slot = self.slot(e);
            self.epochs[slot] = Epoch::default();
        }
        self.last_epoch = epoch;
        // Rolled subrelease counts land in the epoch that closed them, so
        // "last 10 min" sums keep them for a full window from here.
        if let Some((pages, partial, broken)) = rolled {
            let slot = self.slot(epoch);
            self.epochs[slot].subreleased += pages;
            self.epochs[slot].partial_subreleased += partial;
            self.epochs[slot].broken += broken;
        }
    }

    fn evaluate_pending(&mut self, current_epoch: i64) {
        let window = (SKIP_SUBRELEASE_EVAL_SECONDS / EPOCH_SECONDS) as i64;
        while let Some(decision) = self.pending.front().copied() {
            if current_epoch <= decision.epoch + window {
                break;
            }
            self.pending.pop_front();
            // Peaks in the decision's own epoch never vindicate it.
            let realized = self.max_demand_in(decision.epoch + 1, decision.epoch + window);
            if realized >= decision.anticipated_demand {
                self.skipped.correct_count += 1;
                self.skipped.correct_pages += decision.pages;
            }
        }
    }

    fn max_demand_in(&self, from_epoch: i64, to_epoch: i64) -> Length {
        let mut max = Length::zero();
        let lowest = self.last_epoch - DEMAND_EPOCHS as i64 + 1;
        for e in from_epoch.max(lowest).max(0)..=to_epoch.min(self.last_epoch) {
            let entry = &self.epochs[self.slot(e)];
            if entry.has_data {
                max = max.max(entry.max_demand);
            }
        }
        max
    }

    fn window_epochs(&self, interval: Duration) -> i64 {
        let secs = interval.as_secs_f64() / EPOCH_SECONDS as f64;
        (secs.ceil() as i64).min(DEMAND_EPOCHS as i64)
    }

    fn for_each_in_window<F: FnMut(&Epoch)>(&self, epochs: i64, mut f: F) {
        if self.last_epoch < 0 {
            return;
        }
        let from = (self.last_epoch - epochs + 1).max(0);
        for e in from..=self.last_epoch {
            let entry = &self.epochs[self.slot(e)];
            if entry.has_data || entry.subreleased > Length::zero() {
                f(entry);
            }
        }
    }

    /// Demand the policy says must stay satisfiable, before subtracting
    /// current usage. Peak look-back takes precedence over the combined
    /// short-fluctuation/long-trend estimate, which in turn is capped by
    /// the demand peak actually observed over those intervals.
    #[must_use]
    pub fn required_demand(&self, intervals: SkipSubreleaseIntervals) -> Length {
        if !intervals.peak.is_zero() {
            let mut peak = Length::zero();
            self.for_each_in_window(self.window_epochs(intervals.peak), |e| {
                peak = peak.max(e.max_demand);
            });
            return peak;
        }
        if intervals.short.is_zero() && intervals.long.is_zero() {
            return Length::zero();
        }
        let mut fluctuation = Length::zero();
        if !intervals.short.is_zero() {
            self.for_each_in_window(self.window_epochs(intervals.short), |e| {
                fluctuation = fluctuation.max(e.max_demand - e.min_demand);
            });
        }
        let mut trend = Length::zero();
        if !intervals.long.is_zero() {
            self.for_each_in_window(self.window_epochs(intervals.long), |e| {
                trend = trend.max(e.min_demand);
            });
        }
        let mut observed_peak = Length::zero();
        let cap_window = self.window_epochs(intervals.short.max(intervals.long));
        self.for_each_in_window(cap_window, |e| {
            observed_peak = observed_peak.max(e.max_demand);
        });
        (fluctuation + trend).min(observed_peak)
    }

    /// Records one skipped subrelease for later judgment.
    pub fn report_skipped_subrelease(
        &mut self,
        now: i64,
        pages: Length,
        anticipated_demand: Length,
    ) {
        let epoch = self.epoch_of(now);
        self.pending.push_back(SkipDecision {
            epoch,
            pages,
            anticipated_demand,
        });
        self.skipped.count += 1;
        self.skipped.pages += pages;
        self.any_decision = true;
    }

    /// Remembers the intervals supplied to a release call so the report
    /// can echo them.
    pub fn note_intervals(&mut self, intervals: SkipSubreleaseIntervals) {
        if !intervals.peak.is_zero() {
            self.echo.peak_secs = intervals.peak.as_secs();
        }
        if !intervals.short.is_zero() {
            self.echo.short_secs = intervals.short.as_secs();
        }
        if !intervals.long.is_zero() {
            self.echo.long_secs = intervals.long.as_secs();
        }
    }

    #[must_use]
    pub fn interval_echo(&self) -> IntervalEcho {
        self.echo
    }

    /// Seconds printed as the correctness evaluation interval: zero until
    /// the first skip decision exists.
    #[must_use]
    pub fn evaluation_interval_secs(&self) -> u64 {
        if self.any_decision {
            SKIP_SUBRELEASE_EVAL_SECONDS
        } else {
            0
        }
    }

    #[must_use]
    pub fn skipped_totals(&self) -> SkippedSubreleaseTotals {
        let mut totals = self.skipped;
        totals.pending_count = self.pending.len() as u64;
        totals.pending_pages = self
            .pending
            .iter()
            .fold(Length::zero(), |acc, d| acc + d.pages);
        totals
    }

    /// (min free pages, min free backed pages) over the summary window.
    #[must_use]
    pub fn min_free_over_window(&self) -> (Length, Length) {
        let mut min_free = Length(u64::MAX);
        let mut min_backed = Length(u64::MAX);
        let mut any = false;
        self.for_each_in_window(
            self.window_epochs(Duration::from_secs(SUMMARY_WINDOW_SECONDS)),
            |e| {
                any = true;
                min_free = min_free.min(e.min_free);
                min_backed = min_backed.min(e.min_free_backed);
            },
        );
        if any {
            (min_free, min_backed)
        } else {
            (Length::zero(), Length::zero())
        }
    }

    /// Snapshot at the highest demand seen in the summary window.
    #[must_use]
    pub fn peak_snapshot_over_window(&self) -> DemandSnapshot {
        let mut best: Option<DemandSnapshot> = None;
        let mut best_demand = Length::zero();
        self.for_each_in_window(
            self.window_epochs(Duration::from_secs(SUMMARY_WINDOW_SECONDS)),
            |e| {
                if best.is_none() || e.max_demand > best_demand {
                    best_demand = e.max_demand;
                    best = Some(e.at_peak);
                }
            },
        );
        best.unwrap_or_default()
    }

    /// Sums of (pages, partial-alloc pages, broken hugepages) subreleased
    /// over the whole ring, for the "last 10 min" report line.
    #[must_use]
    pub fn subreleased_over_window(&self) -> (Length, Length, HugeLength) {
        let mut pages = Length::zero();
        let mut partial = Length::zero();
        let mut broken = HugeLength(0);
        self.for_each_in_window(DEMAND_EPOCHS as i64, |e| {
            pages += e.subreleased;
            partial += e.partial_subreleased;
            broken += e.broken;
        });
        (pages, partial, broken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, FakeClock};

    fn snapshot(used: u64, free: u64) -> DemandSnapshot {
        DemandSnapshot {
            used: Length(used),
            free: Length(free),
            unmapped: Length::zero(),
            huge_pages: HugePageBreakdown::default(),
        }
    }

    #[test]
    fn empty_intervals_are_disabled() {
        assert!(!SkipSubreleaseIntervals::default().enabled());
        assert!(SkipSubreleaseIntervals {
            peak: Duration::from_secs(1),
            ..Default::default()
        }
        .enabled());
    }

    #[test]
    fn peak_interval_takes_precedence() {
        let clock = FakeClock::new();
        let mut recorder = DemandRecorder::new(clock.freq());
        let mut stats = SubreleaseStats::default();

        recorder.report(clock.now(), snapshot(512, 0), &mut stats);
        clock.advance(Duration::from_secs(60));
        recorder.report(clock.now(), snapshot(128, 128), &mut stats);

        let with_peak = SkipSubreleaseIntervals {
            peak: Duration::from_secs(180),
            short: Duration::from_millis(10),
            long: Duration::from_millis(20),
        };
        let peak_only = SkipSubreleaseIntervals {
            peak: Duration::from_secs(180),
            ..Default::default()
        };
        assert_eq!(
            recorder.required_demand(with_peak),
            recorder.required_demand(peak_only)
        );
        assert_eq!(recorder.required_demand(peak_only), Length(512));
    }

    #[test]
    fn short_long_sum_is_capped_by_observed_peak() {
        let clock = FakeClock::new();
        let mut recorder = DemandRecorder::new(clock.freq());
        let mut stats = SubreleaseStats::default();

        // One epoch swinging 192..640, the next holding at 512.
        recorder.report(clock.now(), snapshot(192, 0), &mut stats);
        recorder.report(clock.now(), snapshot(640, 0), &mut stats);
        clock.advance(Duration::from_secs(60));
        recorder.report(clock.now(), snapshot(512, 128), &mut stats);

        let intervals = SkipSubreleaseIntervals {
            short: Duration::from_secs(120),
            long: Duration::from_secs(120),
            ..Default::default()
        };
        // fluctuation 448 + trend 512 = 960, capped at the 640 peak.
        assert_eq!(recorder.required_demand(intervals), Length(640));
    }

    #[test]
    fn old_epochs_fall_out_of_the_window() {
        let clock = FakeClock::new();
        let mut recorder = DemandRecorder::new(clock.freq());
        let mut stats = SubreleaseStats::default();

        recorder.report(clock.now(), snapshot(1000, 0), &mut stats);
        clock.advance(Duration::from_secs(170));
        recorder.report(clock.now(), snapshot(100, 0), &mut stats);

        let two_minutes = SkipSubreleaseIntervals {
            peak: Duration::from_secs(120),
            ..Default::default()
        };
        assert_eq!(recorder.required_demand(two_minutes), Length(100));
        let three_minutes = SkipSubreleaseIntervals {
            peak: Duration::from_secs(180),
            ..Default::default()
        };
        assert_eq!(recorder.required_demand(three_minutes), Length(1000));
    }

    #[test]
    fn skipped_decision_confirmed_when_demand_returns() {
        let clock = FakeClock::new();
        let mut recorder = DemandRecorder::new(clock.freq());
        let mut stats = SubreleaseStats::default();

        recorder.report(clock.now(), snapshot(100, 100), &mut stats);
        recorder.report_skipped_subrelease(clock.now(), Length(100), Length(200));

        // Demand does return within five minutes.
        clock.advance(Duration::from_secs(120));
        recorder.report(clock.now(), snapshot(250, 0), &mut stats);

        clock.advance(Duration::from_secs(600));
        recorder.report(clock.now(), snapshot(0, 0), &mut stats);

        let totals = recorder.skipped_totals();
        assert_eq!(totals.count, 1);
        assert_eq!(totals.pages, Length(100));
        assert_eq!(totals.correct_count, 1);
        assert_eq!(totals.correct_pages, Length(100));
        assert_eq!(totals.pending_count, 0);
    }

    #[test]
    fn same_epoch_peak_does_not_confirm() {
        let clock = FakeClock::new();
        let mut recorder = DemandRecorder::new(clock.freq());
        let mut stats = SubreleaseStats::default();

        recorder.report(clock.now(), snapshot(100, 100), &mut stats);
        recorder.report_skipped_subrelease(clock.now(), Length(100), Length(200));
        // The peak lands in the decision's own epoch.
        recorder.report(clock.now(), snapshot(300, 0), &mut stats);

        clock.advance(Duration::from_secs(600));
        recorder.report(clock.now(), snapshot(0, 0), &mut stats);

        let totals = recorder.skipped_totals();
        assert_eq!(totals.count, 1);
        assert_eq!(totals.correct_count, 0);
        assert_eq!(totals.pending_count, 0);
    }

    #[test]
    fn decisions_stay_pending_inside_the_window() {
        let clock = FakeClock::new();
        let mut recorder = DemandRecorder::new(clock.freq());
        let mut stats = SubreleaseStats::default();

        recorder.report(clock.now(), snapshot(100, 100), &mut stats);
        recorder.report_skipped_subrelease(clock.now(), Length(64), Length(128));
        clock.advance(Duration::from_secs(100));
        recorder.report(clock.now(), snapshot(100, 100), &mut stats);

        let totals = recorder.skipped_totals();
        assert_eq!(totals.pending_count, 1);
        assert_eq!(totals.pending_pages, Length(64));
    }

    #[test]
    fn subrelease_stats_roll_on_epoch_advance() {
        let clock = FakeClock::new();
        let mut recorder = DemandRecorder::new(clock.freq());
        let mut stats = SubreleaseStats::default();

        recorder.report(clock.now(), snapshot(10, 10), &mut stats);
        stats.record(Length(19), Length::zero(), HugeLength(2), true);
        assert_eq!(stats.num_pages_subreleased, Length(19));
        assert_eq!(stats.total_pages_subreleased, Length::zero());
        assert_eq!(stats.total_pages_subreleased_due_to_limit, Length(19));

        clock.advance(Duration::from_secs(2));
        recorder.report(clock.now(), snapshot(10, 10), &mut stats);
        assert_eq!(stats.num_pages_subreleased, Length::zero());
        assert_eq!(stats.total_pages_subreleased, Length(19));
        assert_eq!(stats.total_hugepages_broken, HugeLength(2));

        let (pages, partial, broken) = recorder.subreleased_over_window();
        assert_eq!(pages, Length(19));
        assert_eq!(partial, Length::zero());
        assert_eq!(broken, HugeLength(2));
    }

    #[test]
    fn window_sums_age_out_after_ten_minutes() {
        let clock = FakeClock::new();
        let mut recorder = DemandRecorder::new(clock.freq());
        let mut stats = SubreleaseStats::default();

        recorder.report(clock.now(), snapshot(10, 10), &mut stats);
        stats.record(Length(21), Length::zero(), HugeLength(3), false);
        clock.advance(Duration::from_secs(2));
        recorder.report(clock.now(), snapshot(10, 10), &mut stats);
        assert_eq!(recorder.subreleased_over_window().0, Length(21));

        clock.advance(Duration::from_secs(700));
        recorder.report(clock.now(), snapshot(10, 10), &mut stats);
        assert_eq!(recorder.subreleased_over_window().0, Length::zero());
        // Cumulative totals survive the wrap.
        assert_eq!(stats.total_pages_subreleased, Length(21));
    }

    #[test]
    fn interval_echo_keeps_last_nonzero_values() {
        let clock = FakeClock::new();
        let mut recorder = DemandRecorder::new(clock.freq());
        recorder.note_intervals(SkipSubreleaseIntervals {
            peak: Duration::from_secs(120),
            ..Default::default()
        });
        recorder.note_intervals(SkipSubreleaseIntervals {
            short: Duration::from_secs(60),
            long: Duration::from_secs(120),
            ..Default::default()
        });
        let echo = recorder.interval_echo();
        assert_eq!(echo.peak_secs, 120);
        assert_eq!(echo.short_secs, 60);
        assert_eq!(echo.long_secs, 120);
    }

    #[test]
    fn evaluation_interval_is_zero_until_first_decision() {
        let clock = FakeClock::new();
        let mut recorder = DemandRecorder::new(clock.freq());
        assert_eq!(recorder.evaluation_interval_secs(), 0);
        recorder.report_skipped_subrelease(clock.now(), Length(1), Length(1));
        assert_eq!(recorder.evaluation_interval_secs(), 300);
    }

    #[test]
    fn peak_snapshot_reports_population_at_peak() {
        let clock = FakeClock::new();
        let mut recorder = DemandRecorder::new(clock.freq());
        let mut stats = SubreleaseStats::default();

        let mut peak = snapshot(500, 20);
        peak.huge_pages = HugePageBreakdown {
            regular: 2,
            donated: 1,
            partial_released: 0,
            released: 1,
        };
        recorder.report(clock.now(), snapshot(100, 0), &mut stats);
        recorder.report(clock.now(), peak, &mut stats);
        recorder.report(clock.now(), snapshot(50, 0), &mut stats);

        let got = recorder.peak_snapshot_over_window();
        assert_eq!(got.used, Length(500));
        assert_eq!(got.huge_pages.total(), 4);
    }
}
