//! The huge-page filler: placement and subrelease over many trackers.
//!
//! Trackers live in a slab arena and are threaded through per-state
//! ordered lists, partitioned by the access density of the spans they
//! host. Placement walks the lists that re-fill broken huge pages first;
//! the release driver picks the emptiest trackers so a subrelease breaks
//! as few well-filled huge pages as possible.

use serde::Serialize;

use crate::clock::Clock;
use crate::config::{DenseTrackerPolicy, FillerConfig};
use crate::pages::{HugeLength, Length, PageId, Range, PAGES_PER_HUGE_PAGE};
use crate::span::{AccessDensity, LargeSpanStats, SmallSpanStats, SpanAllocInfo, DENSITY_CLASSES};
use crate::subrelease::{
    DemandRecorder, DemandSnapshot, HugePageBreakdown, SkipSubreleaseIntervals, SubreleaseStats,
};
use crate::tracker::{MemoryModifyFunction, PageTracker};

/// Most trackers examined as candidates by one release call.
pub const CANDIDATES_FOR_RELEASE: usize = PAGES_PER_HUGE_PAGE.raw() as usize;

/// Most release-decision log records retained.
const MAX_RELEASE_LOGS: usize = 1024;

/// Handle to a tracker owned by the filler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TrackerId(usize);

/// Result of a successful placement.
#[derive(Clone, Copy, Debug)]
pub struct FillerAllocation {
    pub tracker: TrackerId,
    pub page: PageId,
    /// Pages in the returned range that were unbacked before this
    /// allocation; the caller must back them.
    pub previously_released: Length,
}

impl FillerAllocation {
    #[must_use]
    pub fn from_released(&self) -> bool {
        self.previously_released > Length::zero()
    }
}

/// Byte-level view of the filler's footprint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BackingStats {
    pub system_bytes: u64,
    pub free_bytes: u64,
    pub unmapped_bytes: u64,
}

/// Tracker population counts, per density plus a combined column.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FillerStatsSnapshot {
    pub n_total: [HugeLength; DENSITY_CLASSES + 1],
    pub n_full: [HugeLength; DENSITY_CLASSES + 1],
    pub n_partial: [HugeLength; DENSITY_CLASSES + 1],
    pub n_released: [HugeLength; DENSITY_CLASSES + 1],
    pub n_fully_released: [HugeLength; DENSITY_CLASSES + 1],
    pub n_partial_released: [HugeLength; DENSITY_CLASSES + 1],
}

/// Structured record of one release decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ReleaseLogRecord {
    pub decision_id: u64,
    pub desired: Length,
    pub required_demand: Length,
    pub skipped: Length,
    pub credit_used: Length,
    pub released: Length,
    pub release_partial_alloc_pages: bool,
    pub hit_limit: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TrackerState {
    Regular,
    Donated,
    PartialReleased,
    Released,
    Full,
}

/// Where a tracker currently files, as the report groups them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum TrackerClass {
    Regular,
    Donated,
    PartialReleased,
    Released,
    Full,
}

struct Slot {
    tracker: PageTracker,
    density: AccessDensity,
    state: TrackerState,
    /// In the previously-released-became-full count.
    counted_previously_released: bool,
}

/// Slab of tracker slots with index reuse.
#[derive(Default)]
struct TrackerArena {
    slots: Vec<Option<Slot>>,
    free_list: Vec<usize>,
}

impl TrackerArena {
    fn insert(&mut self, slot: Slot) -> TrackerId {
        if let Some(index) = self.free_list.pop() {
            self.slots[index] = Some(slot);
            TrackerId(index)
        } else {
            self.slots.push(Some(slot));
            TrackerId(self.slots.len() - 1)
        }
    }

    fn remove(&mut self, id: TrackerId) -> Slot {
        let slot = self.slots[id.0].take().expect("stale tracker id");
        self.free_list.push(id.0);
        slot
    }

    fn get(&self, id: TrackerId) -> &Slot {
        self.slots[id.0].as_ref().expect("stale tracker id")
    }

    fn get_mut(&mut self, id: TrackerId) -> &mut Slot {
        self.slots[id.0].as_mut().expect("stale tracker id")
    }
}

/// Ordered list of tracker ids; the sort key depends on the list kind.
#[derive(Default)]
struct TrackerList {
    ids: Vec<TrackerId>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ListOrder {
    /// Longest free range ascending, more-fragmented first on ties.
    LfrChunks,
    /// Lifetime allocation count descending.
    NallocDesc,
}

fn sort_key(slot: &Slot, order: ListOrder) -> u128 {
    let t = &slot.tracker;
    match order {
        ListOrder::LfrChunks => {
            let lfr = t.longest_free_range().raw() as u128;
            let chunks_inv = (4096 - t.free_chunks() as u128) & 0xffff;
            (lfr << 32) | (chunks_inv << 16)
        }
        ListOrder::NallocDesc => {
            let nalloc_inv = (u64::MAX - t.nalloc()) as u128;
            (nalloc_inv << 16) | (t.longest_free_range().raw() as u128 & 0xffff)
        }
    }
}

impl TrackerList {
    fn insert_sorted(&mut self, arena: &TrackerArena, id: TrackerId, order: ListOrder) {
        let key = sort_key(arena.get(id), order);
        let pos = self
            .ids
            .partition_point(|&other| sort_key(arena.get(other), order) <= key);
        self.ids.insert(pos, id);
    }

    fn remove(&mut self, id: TrackerId) {
        let pos = self
            .ids
            .iter()
            .position(|&x| x == id)
            .expect("tracker missing from its list");
        self.ids.remove(pos);
    }
}

pub struct HugePageFiller<C: Clock, U: MemoryModifyFunction> {
    clock: C,
    unback: U,
    config: FillerConfig,
    arena: TrackerArena,
    regular: [TrackerList; DENSITY_CLASSES],
    donated: TrackerList,
    partial_released: [TrackerList; DENSITY_CLASSES],
    released_lists: [TrackerList; DENSITY_CLASSES],
    full: [Vec<TrackerId>; DENSITY_CLASSES],
    size: HugeLength,
    allocated: [Length; DENSITY_CLASSES],
    unmapped: Length,
    /// Pages eagerly unmapped outside a release call (an emptied tracker's
    /// backed remainder); the next release call claims this credit first.
    unmapping_unaccounted: Length,
    previously_released_full: HugeLength,
    recorder: DemandRecorder,
    sub_stats: SubreleaseStats,
    release_logs: Vec<ReleaseLogRecord>,
    next_decision_id: u64,
}

impl<C: Clock, U: MemoryModifyFunction> HugePageFiller<C, U> {
    #[must_use]
    pub fn new(clock: C, config: FillerConfig, unback: U) -> Self {
        let recorder = DemandRecorder::new(clock.freq());
        Self {
            clock,
            unback,
            config,
            arena: TrackerArena::default(),
            regular: Default::default(),
            donated: TrackerList::default(),
            partial_released: Default::default(),
            released_lists: Default::default(),
            full: Default::default(),
            size: HugeLength(0),
            allocated: [Length::zero(); DENSITY_CLASSES],
            unmapped: Length::zero(),
            unmapping_unaccounted: Length::zero(),
            previously_released_full: HugeLength(0),
            recorder,
            sub_stats: SubreleaseStats::default(),
            release_logs: Vec::new(),
            next_decision_id: 1,
        }
    }

    #[must_use]
    pub fn clock(&self) -> &C {
        &self.clock
    }

    #[must_use]
    pub fn config(&self) -> FillerConfig {
        self.config
    }

    #[must_use]
    pub fn size(&self) -> HugeLength {
        self.size
    }

    #[must_use]
    pub fn used_pages(&self) -> Length {
        self.allocated[0] + self.allocated[1]
    }

    #[must_use]
    pub fn pages_allocated(&self) -> Length {
        self.used_pages()
    }

    #[must_use]
    pub fn pages_allocated_for(&self, density: AccessDensity) -> Length {
        self.allocated[density.index()]
    }

    #[must_use]
    pub fn unmapped_pages(&self) -> Length {
        self.unmapped
    }

    #[must_use]
    pub fn free_pages(&self) -> Length {
        self.size.in_pages() - self.used_pages() - self.unmapped
    }

    #[must_use]
    pub fn previously_released_huge_pages(&self) -> HugeLength {
        self.previously_released_full
    }

    #[must_use]
    pub fn subrelease_stats(&self) -> SubreleaseStats {
        self.sub_stats
    }

    #[must_use]
    pub fn demand_recorder(&self) -> &DemandRecorder {
        &self.recorder
    }

    #[must_use]
    pub fn stats(&self) -> BackingStats {
        BackingStats {
            system_bytes: self.size.in_bytes(),
            free_bytes: self.free_pages().in_bytes(),
            unmapped_bytes: self.unmapped.in_bytes(),
        }
    }

    fn sum_used(&self, lists: impl IntoIterator<Item = TrackerId>) -> Length {
        lists
            .into_iter()
            .fold(Length::zero(), |acc, id| acc + self.arena.get(id).tracker.used_pages())
    }

    #[must_use]
    pub fn used_pages_in_released(&self) -> Length {
        self.sum_used(self.released_lists.iter().flat_map(|l| l.ids.iter().copied()))
    }

    #[must_use]
    pub fn used_pages_in_partial_released(&self) -> Length {
        self.sum_used(
            self.partial_released
                .iter()
                .flat_map(|l| l.ids.iter().copied()),
        )
    }

    #[must_use]
    pub fn used_pages_in_any_subreleased(&self) -> Length {
        self.used_pages_in_released() + self.used_pages_in_partial_released()
    }

    /// Fraction of live pages sitting on huge pages no part of which is
    /// currently unbacked.
    #[must_use]
    pub fn hugepage_frac(&self) -> f64 {
        let used = self.used_pages();
        if used.is_zero() {
            return 1.0;
        }
        let subreleased = self.used_pages_in_any_subreleased();
        (used - subreleased).raw() as f64 / used.raw() as f64
    }

    #[must_use]
    pub fn get_stats(&self) -> FillerStatsSnapshot {
        let mut snapshot = FillerStatsSnapshot::default();
        for density in AccessDensity::all() {
            let d = density.index();
            let full = self.full[d].len() as u64;
            let fully_released = self.released_lists[d].ids.len() as u64;
            let partial_released = self.partial_released[d].ids.len() as u64;
            let mut partial = self.regular[d].ids.len() as u64;
            if density == AccessDensity::Sparse {
                partial += self.donated.ids.len() as u64;
            }
            snapshot.n_full[d] = HugeLength(full);
            snapshot.n_partial[d] = HugeLength(partial);
            snapshot.n_fully_released[d] = HugeLength(fully_released);
            snapshot.n_partial_released[d] = HugeLength(partial_released);
            snapshot.n_released[d] = HugeLength(fully_released + partial_released);
            snapshot.n_total[d] =
                HugeLength(full + partial + fully_released + partial_released);
        }
        let combined = DENSITY_CLASSES;
        snapshot.n_full[combined] = snapshot.n_full[0] + snapshot.n_full[1];
        snapshot.n_partial[combined] = snapshot.n_partial[0] + snapshot.n_partial[1];
        snapshot.n_released[combined] = snapshot.n_released[0] + snapshot.n_released[1];
        snapshot.n_fully_released[combined] =
            snapshot.n_fully_released[0] + snapshot.n_fully_released[1];
        snapshot.n_partial_released[combined] =
            snapshot.n_partial_released[0] + snapshot.n_partial_released[1];
        snapshot.n_total[combined] = snapshot.n_total[0] + snapshot.n_total[1];
        snapshot
    }

    /// Visits every tracker currently owned by the filler.
    pub fn for_each_huge_page(&self, mut f: impl FnMut(TrackerId, &PageTracker)) {
        for (index, slot) in self.arena.slots.iter().enumerate() {
            if let Some(slot) = slot {
                f(TrackerId(index), &slot.tracker);
            }
        }
    }

    /// Read access to one tracker, for tests and the report writer.
    #[must_use]
    pub fn tracker(&self, id: TrackerId) -> &PageTracker {
        &self.arena.get(id).tracker
    }

    /// Density class a tracker serves.
    #[must_use]
    pub fn tracker_density(&self, id: TrackerId) -> AccessDensity {
        self.arena.get(id).density
    }

    /// Report grouping of a tracker.
    #[must_use]
    pub fn tracker_class(&self, id: TrackerId) -> TrackerClass {
        match self.arena.get(id).state {
            TrackerState::Regular => TrackerClass::Regular,
            TrackerState::Donated => TrackerClass::Donated,
            TrackerState::PartialReleased => TrackerClass::PartialReleased,
            TrackerState::Released => TrackerClass::Released,
            TrackerState::Full => TrackerClass::Full,
        }
    }

    pub fn add_span_stats(&self, small: &mut SmallSpanStats, large: &mut LargeSpanStats) {
        self.for_each_huge_page(|_, tracker| tracker.add_span_stats(small, large));
    }

    #[must_use]
    pub fn release_logs(&self) -> &[ReleaseLogRecord] {
        &self.release_logs
    }

    pub fn drain_release_logs(&mut self) -> Vec<ReleaseLogRecord> {
        std::mem::take(&mut self.release_logs)
    }

    fn classify(slot: &Slot) -> TrackerState {
        let t = &slot.tracker;
        if t.free_pages().is_zero() {
            if t.released_pages().is_zero() {
                TrackerState::Full
            } else {
                TrackerState::Released
            }
        } else if t.released_pages().is_zero() {
            if t.donated() {
                TrackerState::Donated
            } else {
                TrackerState::Regular
            }
        } else {
            TrackerState::PartialReleased
        }
    }

    fn list_order_for(&self, state: TrackerState, density: AccessDensity) -> ListOrder {
        if density == AccessDensity::Dense
            && self.config.dense_tracker == DenseTrackerPolicy::SpansAllocated
            && state != TrackerState::Donated
        {
            ListOrder::NallocDesc
        } else {
            ListOrder::LfrChunks
        }
    }

    fn remove_from_state_list(&mut self, id: TrackerId) {
        let slot = self.arena.get(id);
        let d = slot.density.index();
        match slot.state {
            TrackerState::Regular => self.regular[d].remove(id),
            TrackerState::Donated => self.donated.remove(id),
            TrackerState::PartialReleased => self.partial_released[d].remove(id),
            TrackerState::Released => self.released_lists[d].remove(id),
            TrackerState::Full => {
                let pos = self.full[d]
                    .iter()
                    .position(|&x| x == id)
                    .expect("tracker missing from full list");
                self.full[d].remove(pos);
                let slot = self.arena.get_mut(id);
                if slot.counted_previously_released {
                    slot.counted_previously_released = false;
                    self.previously_released_full -= HugeLength(1);
                }
            }
        }
    }

    fn insert_into_state_list(&mut self, id: TrackerId) {
        let (new_state, density, was_subreleased) = {
            let slot = self.arena.get_mut(id);
            let old_state = slot.state;
            // A donated region reverts to regular on its first full use.
            if slot.tracker.donated() && slot.tracker.free_pages().is_zero() {
                slot.tracker.set_donated(false);
            }
            let new_state = Self::classify(slot);
            slot.state = new_state;
            let was_subreleased = matches!(
                old_state,
                TrackerState::Released | TrackerState::PartialReleased
            );
            (new_state, slot.density, was_subreleased)
        };
        let d = density.index();
        let order = self.list_order_for(new_state, density);
        match new_state {
            TrackerState::Regular => self.regular[d].insert_sorted(&self.arena, id, order),
            TrackerState::Donated => self.donated.insert_sorted(&self.arena, id, order),
            TrackerState::PartialReleased => {
                self.partial_released[d].insert_sorted(&self.arena, id, order)
            }
            TrackerState::Released => self.released_lists[d].insert_sorted(&self.arena, id, order),
            TrackerState::Full => {
                self.full[d].push(id);
                if was_subreleased {
                    let slot = self.arena.get_mut(id);
                    slot.counted_previously_released = true;
                    self.previously_released_full += HugeLength(1);
                }
            }
        }
    }

    fn demand_snapshot(&self) -> DemandSnapshot {
        let regular = self.regular.iter().map(|l| l.ids.len()).sum::<usize>()
            + self.full.iter().map(|l| l.len()).sum::<usize>();
        DemandSnapshot {
            used: self.used_pages(),
            free: self.free_pages(),
            unmapped: self.unmapped,
            huge_pages: HugePageBreakdown {
                regular: regular as u64,
                donated: self.donated.ids.len() as u64,
                partial_released: self
                    .partial_released
                    .iter()
                    .map(|l| l.ids.len())
                    .sum::<usize>() as u64,
                released: self
                    .released_lists
                    .iter()
                    .map(|l| l.ids.len())
                    .sum::<usize>() as u64,
            },
        }
    }

    fn report_demand(&mut self) {
        let snapshot = self.demand_snapshot();
        self.recorder
            .report(self.clock.now(), snapshot, &mut self.sub_stats);
    }

    /// Places `n` pages on an existing tracker, or returns `None` so the
    /// caller can construct a fresh huge page and `contribute` it.
    pub fn try_get(&mut self, n: Length, info: SpanAllocInfo) -> Option<FillerAllocation> {
        if n > PAGES_PER_HUGE_PAGE {
            return None;
        }
        if info.density == AccessDensity::Dense
            && self.config.dense_tracker == DenseTrackerPolicy::SpansAllocated
        {
            debug_assert_eq!(
                n,
                Length(1),
                "dense spans are placed page-at-a-time under SpansAllocated"
            );
        }
        let d = info.density.index();
        let id = self.find_fit(n, info.density)?;

        self.remove_from_state_list(id);
        let allocation = self.arena.get_mut(id).tracker.get(n);
        self.allocated[d] += n;
        self.unmapped -= allocation.previously_released;
        self.insert_into_state_list(id);
        self.report_demand();

        #[cfg(debug_assertions)]
        self.arena.get(id).tracker.check_invariants();

        Some(FillerAllocation {
            tracker: id,
            page: allocation.page,
            previously_released: allocation.previously_released,
        })
    }

    /// First tracker able to host `n` pages, searching partially released
    /// huge pages first so broken pages are refilled before fresh ones are
    /// fragmented. Dense requests never touch donated regions.
    fn find_fit(&self, n: Length, density: AccessDensity) -> Option<TrackerId> {
        let d = density.index();
        let search: [&TrackerList; 3] = [
            &self.partial_released[d],
            &self.released_lists[d],
            &self.regular[d],
        ];
        for list in search {
            if let Some(id) = self.first_fitting(list, n) {
                return Some(id);
            }
        }
        if density == AccessDensity::Sparse {
            if let Some(id) = self.first_fitting(&self.donated, n) {
                return Some(id);
            }
        }
        None
    }

    fn first_fitting(&self, list: &TrackerList, n: Length) -> Option<TrackerId> {
        list.ids
            .iter()
            .copied()
            .find(|&id| self.arena.get(id).tracker.longest_free_range() >= n)
    }

    /// Adopts a tracker built on a fresh huge page. The caller has already
    /// placed its first allocation.
    pub fn contribute(
        &mut self,
        tracker: PageTracker,
        donated: bool,
        info: SpanAllocInfo,
    ) -> TrackerId {
        debug_assert!(
            !donated || info.density == AccessDensity::Sparse,
            "donated regions host sparse spans only"
        );
        debug_assert_eq!(tracker.donated(), donated);
        let density = if donated {
            AccessDensity::Sparse
        } else {
            info.density
        };
        self.allocated[density.index()] += tracker.used_pages();
        self.unmapped += tracker.released_pages();
        self.size += HugeLength(1);
        let id = self.arena.insert(Slot {
            tracker,
            density,
            // Placeholder; insert_into_state_list assigns the real state.
            state: TrackerState::Regular,
            counted_previously_released: false,
        });
        self.insert_into_state_list(id);
        self.report_demand();
        id
    }

    /// Returns a range. Yields the tracker back to the caller when the
    /// huge page became empty; the caller frees the backing region.
    pub fn put(&mut self, id: TrackerId, range: Range) -> Option<PageTracker> {
        self.remove_from_state_list(id);
        let d = self.arena.get(id).density.index();
        self.arena.get_mut(id).tracker.put(range);
        self.allocated[d] -= range.n;

        let empty = self.arena.get(id).tracker.empty();
        if empty {
            let slot = self.arena.remove(id);
            self.size -= HugeLength(1);
            let released = slot.tracker.released_pages();
            if released > Length::zero() {
                // The caller unbacks the whole region; its still-backed
                // remainder becomes release credit.
                self.unmapped -= released;
                self.unmapping_unaccounted += PAGES_PER_HUGE_PAGE - released;
            }
            self.report_demand();
            return Some(slot.tracker);
        }
        self.insert_into_state_list(id);
        self.report_demand();
        None
    }

    /// Variant of [`release_pages`](Self::release_pages) that drains all
    /// free pages from partially released trackers first.
    pub fn release_partial_pages(
        &mut self,
        desired: Length,
        intervals: SkipSubreleaseIntervals,
    ) -> Length {
        self.release_pages(desired, intervals, true, false)
    }

    /// Subreleases up to `desired` pages and returns the number released,
    /// including credit for pages unmapped eagerly since the last call.
    pub fn release_pages(
        &mut self,
        desired: Length,
        intervals: SkipSubreleaseIntervals,
        release_partial_alloc_pages: bool,
        hit_limit: bool,
    ) -> Length {
        let mut released = Length::zero();

        let credit = self.unmapping_unaccounted.min(desired);
        if credit > Length::zero() {
            self.unmapping_unaccounted -= credit;
            released += credit;
        }

        if intervals.enabled() {
            self.recorder.note_intervals(intervals);
        }

        let mut target = desired.saturating_sub(released);
        let mut required = Length::zero();
        let mut skipped = Length::zero();
        if target > Length::zero() && intervals.enabled() && !hit_limit {
            required = self.recorder.required_demand(intervals);
            let used = self.used_pages();
            let free = self.free_pages();
            let preserve = required.saturating_sub(used);
            if preserve > Length::zero() {
                let releasable = free.saturating_sub(preserve);
                let new_target = target.min(releasable);
                skipped = target.min(free) - new_target;
                if skipped > Length::zero() {
                    let capacity = used + free;
                    self.recorder.report_skipped_subrelease(
                        self.clock.now(),
                        skipped,
                        required.min(capacity),
                    );
                }
                target = new_target;
            }
        }

        let mut subreleased = Length::zero();
        let mut partial_subreleased = Length::zero();
        let mut broken = HugeLength(0);

        if release_partial_alloc_pages && target > subreleased {
            // Drain entire partially released trackers first; everything
            // over the target is attributed to the partial-alloc policy.
            let candidates = self.select_candidates(true);
            for id in candidates {
                if subreleased >= target {
                    break;
                }
                subreleased += self.release_one(id, &mut broken);
            }
            partial_subreleased = subreleased.saturating_sub(target);
        }

        if subreleased < target {
            let candidates = self.select_candidates(false);
            for id in candidates {
                if subreleased >= target {
                    break;
                }
                subreleased += self.release_one(id, &mut broken);
            }
        }

        released += subreleased;
        self.sub_stats
            .record(subreleased, partial_subreleased, broken, hit_limit);

        if self.release_logs.len() < MAX_RELEASE_LOGS {
            let decision_id = self.next_decision_id;
            self.next_decision_id = self.next_decision_id.wrapping_add(1);
            self.release_logs.push(ReleaseLogRecord {
                decision_id,
                desired,
                required_demand: required,
                skipped,
                credit_used: credit,
                released,
                release_partial_alloc_pages,
                hit_limit,
            });
        }

        self.report_demand();
        released
    }

    /// Candidate trackers for one release pass: the
    /// [`CANDIDATES_FOR_RELEASE`] with the fewest used pages among trackers
    /// that still have backed free pages. Fully released trackers have
    /// nothing left to give and are never considered.
    fn select_candidates(&self, partial_only: bool) -> Vec<TrackerId> {
        let mut candidates: Vec<(Length, Length, usize, TrackerId)> = Vec::new();
        let mut seq = 0usize;
        let mut visit = |list: &TrackerList, candidates: &mut Vec<_>| {
            for &id in &list.ids {
                let tracker = &self.arena.get(id).tracker;
                if tracker.free_pages() > Length::zero() {
                    candidates.push((tracker.used_pages(), tracker.longest_free_range(), seq, id));
                    seq += 1;
                }
            }
        };
        if partial_only {
            visit(&self.partial_released[0], &mut candidates);
            visit(&self.partial_released[1], &mut candidates);
        } else {
            visit(&self.regular[0], &mut candidates);
            visit(&self.donated, &mut candidates);
            visit(&self.regular[1], &mut candidates);
            visit(&self.partial_released[0], &mut candidates);
            visit(&self.partial_released[1], &mut candidates);
        }
        // Fewest used pages first; longer free runs win ties, then the
        // list visit order above.
        candidates.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then(b.1.cmp(&a.1))
                .then(a.2.cmp(&b.2))
        });
        candidates.truncate(CANDIDATES_FOR_RELEASE);
        candidates.into_iter().map(|(_, _, _, id)| id).collect()
    }

    /// Releases all free pages of one tracker and refiles it.
    fn release_one(&mut self, id: TrackerId, broken: &mut HugeLength) -> Length {
        self.remove_from_state_list(id);
        let slot = self.arena.slots[id.0].as_mut().expect("stale tracker id");
        let was_broken = slot.tracker.broken();
        let newly = slot.tracker.release_free(&mut self.unback);
        if !was_broken && slot.tracker.broken() {
            *broken += HugeLength(1);
        }
        self.unmapped += newly;
        self.insert_into_state_list(id);
        newly
    }
}
