//! Human-readable and machine-readable filler reports.
//!
//! Every text line carries the stable `HugePageFiller:` prefix downstream
//! monitoring greps for; histogram lines wrap at six buckets. Output goes
//! through a bounded [`Printer`] so a report can never outgrow the 1 MiB
//! buffer the caller hands to the status page.

use std::fmt::Write as _;

use serde::Serialize;

use crate::clock::Clock;
use crate::filler::{BackingStats, FillerStatsSnapshot, HugePageFiller, TrackerClass};
use crate::pages::PAGES_PER_HUGE_PAGE;
use crate::residency::Residency;
use crate::span::{AccessDensity, DENSITY_CLASSES};
use crate::stats::{
    allocation_histogram_edges, native_histogram_edges, page_histogram_edges, Histogram,
    LifetimeHistogram, LIFETIME_EDGES_MS,
};
use crate::subrelease::{SkippedSubreleaseTotals, SubreleaseStats};
use crate::tracker::MemoryModifyFunction;

/// Report buffer cap.
pub const PRINTER_LIMIT: usize = 1024 * 1024;

/// Append-only text sink truncated at a byte limit. `space_required`
/// reports how much an unbounded buffer would have needed.
pub struct Printer {
    buf: String,
    limit: usize,
    required: usize,
}

impl Default for Printer {
    fn default() -> Self {
        Self::new(PRINTER_LIMIT)
    }
}

impl Printer {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            buf: String::new(),
            limit,
            required: 0,
        }
    }

    pub fn push(&mut self, s: &str) {
        self.required += s.len();
        let room = self.limit.saturating_sub(self.buf.len());
        if room == 0 {
            return;
        }
        let mut take = room.min(s.len());
        while take > 0 && !s.is_char_boundary(take) {
            take -= 1;
        }
        self.buf.push_str(&s[..take]);
    }

    pub fn line(&mut self, args: std::fmt::Arguments<'_>) {
        let mut s = String::new();
        let _ = s.write_fmt(args);
        s.push('\n');
        self.push(&s);
    }

    #[must_use]
    pub fn space_required(&self) -> usize {
        self.required
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.buf
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.buf
    }
}

/// Protobuf-text-style nested key/value emitter over a [`Printer`].
pub struct PbtxtRegion<'a> {
    printer: &'a mut Printer,
    depth: usize,
}

impl<'a> PbtxtRegion<'a> {
    #[must_use]
    pub fn new(printer: &'a mut Printer) -> Self {
        Self { printer, depth: 0 }
    }

    fn indent(&mut self) {
        for _ in 0..self.depth {
            self.printer.push("  ");
        }
    }

    pub fn print_i64(&mut self, name: &str, value: i64) {
        self.indent();
        self.printer.line(format_args!("{name}: {value}"));
    }

    pub fn print_double(&mut self, name: &str, value: f64) {
        self.indent();
        self.printer.line(format_args!("{name}: {value}"));
    }

    pub fn print_bool(&mut self, name: &str, value: bool) {
        self.indent();
        self.printer.line(format_args!("{name}: {value}"));
    }

    pub fn sub_region<F: FnOnce(&mut PbtxtRegion<'_>)>(&mut self, name: &str, body: F) {
        self.indent();
        self.printer.line(format_args!("{name} {{"));
        let mut sub = PbtxtRegion {
            printer: &mut *self.printer,
            depth: self.depth + 1,
        };
        body(&mut sub);
        self.indent();
        self.printer.push("}\n");
    }
}

/// Serializable summary of the filler's state.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct FillerReport {
    pub size_huge_pages: u64,
    pub used_pages: u64,
    pub free_pages: u64,
    pub unmapped_pages: u64,
    pub used_pages_in_released: u64,
    pub used_pages_in_partial_released: u64,
    pub previously_released_huge_pages: u64,
    pub hugepage_frac: f64,
    pub backing: BackingStats,
    pub population: FillerStatsSnapshot,
    pub subrelease: SubreleaseStats,
    pub skipped_subrelease: SkippedSubreleaseTotals,
}

/// The seven tracker groupings the report breaks histograms down by.
const CLASS_LABELS: [(&str, TrackerClass); 7] = [
    ("sparsely-accessed regular", TrackerClass::Regular),
    ("densely-accessed regular", TrackerClass::Regular),
    ("donated", TrackerClass::Donated),
    ("sparsely-accessed partial released", TrackerClass::PartialReleased),
    ("densely-accessed partial released", TrackerClass::PartialReleased),
    ("sparsely-accessed released", TrackerClass::Released),
    ("densely-accessed released", TrackerClass::Released),
];

fn class_index(density: AccessDensity, class: TrackerClass) -> usize {
    match (class, density) {
        (TrackerClass::Regular | TrackerClass::Full, AccessDensity::Sparse) => 0,
        (TrackerClass::Regular | TrackerClass::Full, AccessDensity::Dense) => 1,
        (TrackerClass::Donated, _) => 2,
        (TrackerClass::PartialReleased, AccessDensity::Sparse) => 3,
        (TrackerClass::PartialReleased, AccessDensity::Dense) => 4,
        (TrackerClass::Released, AccessDensity::Sparse) => 5,
        (TrackerClass::Released, AccessDensity::Dense) => 6,
    }
}

enum HistoStyle {
    Pages,
    Lifetime,
}

fn print_histogram(
    out: &mut Printer,
    header: &str,
    edges: &[usize],
    counts: &[usize],
    style: HistoStyle,
) {
    out.push("\n");
    out.line(format_args!("{header}"));
    print_histogram_body(out, edges, counts, style);
}

/// Per-class histogram bundle gathered in one pass over the trackers.
struct ClassHistograms {
    free_pages: Vec<Histogram>,
    longest_free: Vec<Histogram>,
    allocations: Vec<Histogram>,
    lifetimes: Vec<LifetimeHistogram>,
    lifetimes_mostly_free: Vec<LifetimeHistogram>,
    allocations_long_lived: Vec<Histogram>,
}

impl ClassHistograms {
    fn new() -> Self {
        Self {
            free_pages: (0..7).map(|_| Histogram::new(page_histogram_edges())).collect(),
            longest_free: (0..7).map(|_| Histogram::new(page_histogram_edges())).collect(),
            allocations: (0..7)
                .map(|_| Histogram::new(allocation_histogram_edges()))
                .collect(),
            lifetimes: (0..7).map(|_| LifetimeHistogram::default()).collect(),
            lifetimes_mostly_free: (0..7).map(|_| LifetimeHistogram::default()).collect(),
            allocations_long_lived: (0..7)
                .map(|_| Histogram::new(page_histogram_edges()))
                .collect(),
        }
    }
}

/// Free-page threshold for the "mostly free" lifetime section.
const MOSTLY_FREE_PAGES: u64 = PAGES_PER_HUGE_PAGE.raw() - 32;

/// Lifetime threshold for the long-lived allocation-count section, in ms.
const LONG_LIVED_MS: u64 = 100_000;

impl<C: Clock, U: MemoryModifyFunction> HugePageFiller<C, U> {
    /// Serializable summary snapshot.
    #[must_use]
    pub fn report(&self) -> FillerReport {
        FillerReport {
            size_huge_pages: self.size().raw(),
            used_pages: self.used_pages().raw(),
            free_pages: self.free_pages().raw(),
            unmapped_pages: self.unmapped_pages().raw(),
            used_pages_in_released: self.used_pages_in_released().raw(),
            used_pages_in_partial_released: self.used_pages_in_partial_released().raw(),
            previously_released_huge_pages: self.previously_released_huge_pages().raw(),
            hugepage_frac: self.hugepage_frac(),
            backing: self.stats(),
            population: self.get_stats(),
            subrelease: self.subrelease_stats(),
            skipped_subrelease: self.demand_recorder().skipped_totals(),
        }
    }

    /// Writes the status-page text report. `everything` adds the histogram
    /// and time-series sections; `residency` adds native-page residency
    /// histograms.
    pub fn print(&self, out: &mut Printer, everything: bool, residency: Option<&dyn Residency>) {
        self.print_summary(out);
        if !everything {
            return;
        }

        let mut histos = ClassHistograms::new();
        let now = self.clock().now();
        let freq = self.clock().freq();
        self.for_each_huge_page(|id, tracker| {
            let class = class_index(self.tracker_density(id), self.tracker_class(id));
            histos.free_pages[class].record(tracker.free_pages().raw() as usize);
            histos.longest_free[class].record(tracker.longest_free_range().raw() as usize);
            histos.allocations[class].record(tracker.nalloc() as usize);
            let lifetime_ms = ((now - tracker.alloc_time()).max(0) as f64 / freq * 1000.0) as u64;
            histos.lifetimes[class].record(lifetime_ms);
            if tracker.free_pages().raw() >= MOSTLY_FREE_PAGES {
                histos.lifetimes_mostly_free[class].record(lifetime_ms);
            }
            if lifetime_ms >= LONG_LIVED_MS {
                histos.allocations_long_lived[class].record(tracker.nalloc() as usize);
            }
        });

        out.push("\nHugePageFiller: fullness histograms\n");
        for (i, (label, _)) in CLASS_LABELS.iter().enumerate() {
            print_histogram(
                out,
                &format!("HugePageFiller: # of {label} hps with a<= # of free pages <b"),
                histos.free_pages[i].edges(),
                histos.free_pages[i].counts(),
                HistoStyle::Pages,
            );
        }
        for (i, (label, class)) in CLASS_LABELS.iter().enumerate() {
            if *class == TrackerClass::Donated {
                continue;
            }
            print_histogram(
                out,
                &format!("HugePageFiller: # of {label} hps with a<= longest free range <b"),
                histos.longest_free[i].edges(),
                histos.longest_free[i].counts(),
                HistoStyle::Pages,
            );
        }
        for (i, (label, class)) in CLASS_LABELS.iter().enumerate() {
            if *class == TrackerClass::Donated {
                continue;
            }
            print_histogram(
                out,
                &format!("HugePageFiller: # of {label} hps with a<= # of allocations <b"),
                histos.allocations[i].edges(),
                histos.allocations[i].counts(),
                HistoStyle::Pages,
            );
        }
        let lifetime_edges: Vec<usize> = LIFETIME_EDGES_MS.iter().map(|&e| e as usize).collect();
        for (i, (label, _)) in CLASS_LABELS.iter().enumerate() {
            print_histogram(
                out,
                &format!("HugePageFiller: # of {label} hps with lifetime a <= # hps < b"),
                &lifetime_edges,
                histos.lifetimes[i].counts(),
                HistoStyle::Lifetime,
            );
        }

        out.push(&format!(
            "\nHugePageFiller: # of hps with >= {MOSTLY_FREE_PAGES} free pages, with different lifetimes.\n"
        ));
        for (i, (label, _)) in CLASS_LABELS.iter().enumerate() {
            let header =
                format!("HugePageFiller: # of {label} hps with lifetime a <= # hps < b");
            if i == 0 {
                // The section header runs straight into the first block.
                out.line(format_args!("{header}"));
                print_histogram_body(
                    out,
                    &lifetime_edges,
                    histos.lifetimes_mostly_free[i].counts(),
                    HistoStyle::Lifetime,
                );
            } else {
                print_histogram(
                    out,
                    &header,
                    &lifetime_edges,
                    histos.lifetimes_mostly_free[i].counts(),
                    HistoStyle::Lifetime,
                );
            }
        }

        out.push(&format!(
            "\nHugePageFiller: # of hps with lifetime >= {LONG_LIVED_MS} ms.\n"
        ));
        for (i, (label, _)) in CLASS_LABELS.iter().enumerate() {
            let header =
                format!("HugePageFiller: # of {label} hps with a <= # of allocations < b");
            if i == 0 {
                out.line(format_args!("{header}"));
                print_histogram_body(
                    out,
                    histos.allocations_long_lived[i].edges(),
                    histos.allocations_long_lived[i].counts(),
                    HistoStyle::Pages,
                );
            } else {
                print_histogram(
                    out,
                    &header,
                    histos.allocations_long_lived[i].edges(),
                    histos.allocations_long_lived[i].counts(),
                    HistoStyle::Pages,
                );
            }
        }

        if let Some(oracle) = residency {
            self.print_residency(out, oracle);
        }

        self.print_time_series(out);
    }

    fn print_summary(&self, out: &mut Printer) {
        let stats = self.get_stats();
        let combined = DENSITY_CLASSES;
        out.push("HugePageFiller: densely pack small requests into hugepages\n");
        let overall = |name: &str, i: usize, out: &mut Printer| {
            out.line(format_args!(
                "HugePageFiller: {name}, {} total, {} full, {} partial, {} released ({} partially), 0 quarantined",
                stats.n_total[i].raw(),
                stats.n_full[i].raw(),
                stats.n_partial[i].raw(),
                stats.n_released[i].raw(),
                stats.n_partial_released[i].raw(),
            ));
        };
        overall("Overall", combined, out);
        overall("those with sparsely-accessed spans", AccessDensity::Sparse.index(), out);
        overall("those with densely-accessed spans", AccessDensity::Dense.index(), out);

        let size_pages = self.size().in_pages();
        let free = self.free_pages();
        let free_frac = if size_pages.is_zero() {
            0.0
        } else {
            free.raw() as f64 / size_pages.raw() as f64
        };
        out.line(format_args!(
            "HugePageFiller: {} pages free in {} hugepages, {:.4} free",
            free.raw(),
            self.size().raw(),
            free_frac
        ));
        let non_full = stats.n_total[combined].raw() - stats.n_full[combined].raw();
        let non_full_frac = if non_full == 0 {
            0.0
        } else {
            free.raw() as f64 / (non_full * PAGES_PER_HUGE_PAGE.raw()) as f64
        };
        out.line(format_args!(
            "HugePageFiller: among non-fulls, {non_full_frac:.4} free"
        ));
        out.line(format_args!(
            "HugePageFiller: {} used pages in subreleased hugepages ({} of them in partially released)",
            self.used_pages_in_any_subreleased().raw(),
            self.used_pages_in_partial_released().raw(),
        ));
        let released_hps = stats.n_released[combined].raw();
        let released_frac = if released_hps == 0 {
            0.0
        } else {
            self.unmapped_pages().raw() as f64 / (released_hps * PAGES_PER_HUGE_PAGE.raw()) as f64
        };
        out.line(format_args!(
            "HugePageFiller: {released_hps} hugepages partially released, {released_frac:.4} released"
        ));
        out.line(format_args!(
            "HugePageFiller: {:.4} of used pages hugepageable",
            self.hugepage_frac()
        ));
        let sub = self.subrelease_stats();
        out.line(format_args!(
            "HugePageFiller: Since startup, {} pages subreleased, {} hugepages broken, ({} pages, {} hugepages due to reaching memory limit)",
            (sub.total_pages_subreleased + sub.num_pages_subreleased).raw(),
            (sub.total_hugepages_broken + sub.num_hugepages_broken).raw(),
            sub.total_pages_subreleased_due_to_limit.raw(),
            sub.total_hugepages_broken_due_to_limit.raw(),
        ));
        out.line(format_args!(
            "HugePageFiller: {} hugepages became full after being previously released, out of which 0 pages are hugepage backed.",
            self.previously_released_huge_pages().raw()
        ));
    }

    fn print_residency(&self, out: &mut Printer, oracle: &dyn Residency) {
        let native = oracle.native_pages_in_huge_page();
        let edges = native_histogram_edges(native);
        let mut unbacked: Vec<Histogram> = (0..7).map(|_| Histogram::new(edges.clone())).collect();
        let mut swapped: Vec<Histogram> = (0..7).map(|_| Histogram::new(edges.clone())).collect();
        let mut used_swapped: Vec<Histogram> =
            (0..7).map(|_| Histogram::new(edges.clone())).collect();
        let mut used_unbacked: Vec<Histogram> =
            (0..7).map(|_| Histogram::new(edges.clone())).collect();
        let mut fully_backed = [0u64; 7];
        let mut class_counts = [0u64; 7];

        self.for_each_huge_page(|id, tracker| {
            let class = class_index(self.tracker_density(id), self.tracker_class(id));
            class_counts[class] += 1;
            let Ok(bitmaps) = oracle.get_unbacked_and_swapped(tracker.location().start_addr())
            else {
                return;
            };
            let info = tracker.count_info_in_huge_page(&bitmaps, native);
            unbacked[class].record(bitmaps.unbacked.count_set());
            swapped[class].record(bitmaps.swapped.count_set());
            used_swapped[class].record(info.n_used_swapped);
            used_unbacked[class].record(info.n_used_unbacked);
            if bitmaps.unbacked.is_zero() {
                fully_backed[class] += 1;
            }
        });

        let kinds: [(&str, &Vec<Histogram>); 4] = [
            ("unbacked", &unbacked),
            ("swapped", &swapped),
            ("used and swapped", &used_swapped),
            ("used and unbacked", &used_unbacked),
        ];
        for (kind, histograms) in kinds {
            for (i, (label, _)) in CLASS_LABELS.iter().enumerate() {
                print_histogram(
                    out,
                    &format!("HugePageFiller: # of {label} hps with a <= # of {kind} < b"),
                    histograms[i].edges(),
                    histograms[i].counts(),
                    HistoStyle::Pages,
                );
            }
        }

        out.push("\n");
        for (i, (label, _)) in CLASS_LABELS.iter().enumerate() {
            out.line(format_args!(
                "HugePageFiller: {} of {label} pages hugepage backed out of {}.",
                fully_backed[i], class_counts[i]
            ));
        }
    }

    fn print_time_series(&self, out: &mut Printer) {
        let recorder = self.demand_recorder();
        out.push("\nHugePageFiller: time series over 5 min interval\n\n");
        let (min_free, min_free_backed) = recorder.min_free_over_window();
        out.line(format_args!(
            "HugePageFiller: realized fragmentation: {:.1} MiB",
            min_free_backed.in_bytes() as f64 / (1024.0 * 1024.0)
        ));
        out.line(format_args!(
            "HugePageFiller: minimum free pages: {} ({} backed)",
            min_free.raw(),
            min_free_backed.raw()
        ));
        let peak = recorder.peak_snapshot_over_window();
        out.line(format_args!(
            "HugePageFiller: at peak demand: {} pages (and {} free, {} unmapped)",
            peak.used.raw(),
            peak.free.raw(),
            peak.unmapped.raw()
        ));
        out.line(format_args!(
            "HugePageFiller: at peak demand: {} hps ({} regular, {} donated, {} partial, {} released)",
            peak.huge_pages.total(),
            peak.huge_pages.regular,
            peak.huge_pages.donated,
            peak.huge_pages.partial_released,
            peak.huge_pages.released
        ));

        let totals = recorder.skipped_totals();
        let echo = recorder.interval_echo();
        out.push("\n");
        out.line(format_args!(
            "HugePageFiller: Since the start of the execution, {} subreleases ({} pages) were skipped due to either recent ({}s) peaks, or the sum of short-term ({}s) fluctuations and long-term ({}s) trends.",
            totals.count,
            totals.pages.raw(),
            echo.peak_secs,
            echo.short_secs,
            echo.long_secs
        ));
        let pct = |part: u64, whole: u64| {
            if whole == 0 {
                0.0
            } else {
                part as f64 / whole as f64 * 100.0
            }
        };
        out.line(format_args!(
            "HugePageFiller: {:.4}% of decisions confirmed correct, {} pending ({:.4}% of pages, {} pending), as per anticipated {}s realized fragmentation.",
            pct(totals.correct_count, totals.count),
            totals.pending_count,
            pct(totals.correct_pages.raw(), totals.pages.raw()),
            totals.pending_count,
            recorder.evaluation_interval_secs()
        ));
        let (window_pages, window_partial, window_broken) = recorder.subreleased_over_window();
        let sub = self.subrelease_stats();
        out.line(format_args!(
            "HugePageFiller: Subrelease stats last 10 min: total {} pages subreleased ({} pages from partial allocs), {} hugepages broken",
            (window_pages + sub.num_pages_subreleased).raw(),
            (window_partial + sub.num_partial_alloc_pages_subreleased).raw(),
            (window_broken + sub.num_hugepages_broken).raw()
        ));
    }

    /// Emits the machine-readable region used by allocation profiles.
    pub fn print_in_pbtxt(&self, region: &mut PbtxtRegion<'_>) {
        let stats = self.get_stats();
        let combined = DENSITY_CLASSES;
        region.sub_region("filler", |r| {
            r.print_i64("full_huge_pages", stats.n_full[combined].raw() as i64);
            r.print_i64("partial_huge_pages", stats.n_partial[combined].raw() as i64);
            r.print_i64("released_huge_pages", stats.n_released[combined].raw() as i64);
            r.print_i64(
                "partially_released_huge_pages",
                stats.n_partial_released[combined].raw() as i64,
            );
            r.print_i64("used_pages", self.used_pages().raw() as i64);
            r.print_i64("free_pages", self.free_pages().raw() as i64);
            r.print_i64("unmapped_pages", self.unmapped_pages().raw() as i64);
            r.print_i64(
                "used_pages_in_subreleased_hugepages",
                self.used_pages_in_any_subreleased().raw() as i64,
            );
            r.print_i64(
                "previously_released_huge_pages",
                self.previously_released_huge_pages().raw() as i64,
            );
            r.print_double("hugepageable_used_fraction", self.hugepage_frac());
            let sub = self.subrelease_stats();
            r.print_i64(
                "pages_subreleased",
                (sub.total_pages_subreleased + sub.num_pages_subreleased).raw() as i64,
            );
            r.print_i64(
                "partial_alloc_pages_subreleased",
                (sub.total_partial_alloc_pages_subreleased
                    + sub.num_partial_alloc_pages_subreleased)
                    .raw() as i64,
            );
            r.print_i64(
                "broken_hugepages",
                (sub.total_hugepages_broken + sub.num_hugepages_broken).raw() as i64,
            );
            let totals = self.demand_recorder().skipped_totals();
            r.sub_region("skipped_subrelease", |s| {
                s.print_i64("skipped_subrelease_count", totals.count as i64);
                s.print_i64("skipped_subrelease_pages", totals.pages.raw() as i64);
                s.print_i64(
                    "correctly_skipped_subrelease_count",
                    totals.correct_count as i64,
                );
                s.print_i64(
                    "correctly_skipped_subrelease_pages",
                    totals.correct_pages.raw() as i64,
                );
                s.print_i64(
                    "pending_skipped_subrelease_count",
                    totals.pending_count as i64,
                );
                s.print_i64(
                    "pending_skipped_subrelease_pages",
                    totals.pending_pages.raw() as i64,
                );
            });
            for density in AccessDensity::all() {
                let d = density.index();
                r.sub_region("tracker_population", |s| {
                    s.print_bool("sparse", density == AccessDensity::Sparse);
                    s.print_i64("total", stats.n_total[d].raw() as i64);
                    s.print_i64("full", stats.n_full[d].raw() as i64);
                    s.print_i64("partial", stats.n_partial[d].raw() as i64);
                    s.print_i64("released", stats.n_fully_released[d].raw() as i64);
                    s.print_i64(
                        "partially_released",
                        stats.n_partial_released[d].raw() as i64,
                    );
                });
            }
        });
    }
}

fn print_histogram_body(out: &mut Printer, edges: &[usize], counts: &[usize], style: HistoStyle) {
    for chunk in edges.iter().zip(counts.iter()).collect::<Vec<_>>().chunks(6) {
        let mut line = String::from("HugePageFiller: ");
        for (i, (edge, count)) in chunk.iter().enumerate() {
            if i > 0 {
                line.push(' ');
            }
            match style {
                HistoStyle::Pages => {
                    let _ = write!(line, "<{edge:>3}<= {count:>5}");
                }
                HistoStyle::Lifetime => {
                    let _ = write!(line, "< {edge:>3} ms <= {count:>6}");
                }
            }
        }
        out.line(format_args!("{line}"));
    }
}
