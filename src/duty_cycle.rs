//! Active/idle interval accounting per core and per chip.

use std::collections::BTreeMap;

use crate::Timespan;

/// Sorted, disjoint, non-adjacent spans.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct IntervalSet {
    spans: Vec<Timespan>,
}

impl IntervalSet {
    fn insert(&mut self, span: Timespan) {
        if span.is_empty() {
            return;
        }
        let mut begin = span.begin_ps;
        let mut end = span.end_ps();
        // First span that ends at or after `begin` may touch the new one.
        let start = self.spans.partition_point(|s| s.end_ps() < begin);
        let mut stop = start;
        while stop < self.spans.len() && self.spans[stop].begin_ps <= end {
            begin = begin.min(self.spans[stop].begin_ps);
            end = end.max(self.spans[stop].end_ps());
            stop += 1;
        }
        let merged = Timespan::from_end_points(begin, end);
        if stop > start {
            self.spans[start] = merged;
            self.spans.drain(start + 1..stop);
        } else {
            self.spans.insert(start, merged);
        }
    }

    fn union(&mut self, other: &IntervalSet) {
        for span in &other.spans {
            self.insert(*span);
        }
    }

    fn total_ps(&self) -> u64 {
        self.spans.iter().map(|s| s.duration_ps).sum()
    }

    /// Parts of `self` not covered by `other`.
    fn difference(&self, other: &IntervalSet) -> Vec<Timespan> {
        let mut out = Vec::new();
        for span in &self.spans {
            let mut cursor = span.begin_ps;
            for cut in other.spans.iter().filter(|c| c.overlaps(span)) {
                if cut.begin_ps > cursor {
                    out.push(Timespan::from_end_points(cursor, cut.begin_ps));
                }
                cursor = cursor.max(cut.end_ps());
            }
            if cursor < span.end_ps() {
                out.push(Timespan::from_end_points(cursor, span.end_ps()));
            }
        }
        out
    }
}

/// Tracks which parts of one core's timeline were busy. The tracked span is
/// the hull of every interval added; whatever of it is not active is idle,
/// including gaps no interval covers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DutyCycleTracker {
    active: IntervalSet,
    tracked: Option<Timespan>,
}

impl DutyCycleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_interval(&mut self, span: Timespan, is_active: bool) {
        if span.is_empty() {
            return;
        }
        if is_active {
            self.active.insert(span);
        }
        self.extend_tracked(span);
    }

    fn extend_tracked(&mut self, span: Timespan) {
        self.tracked = Some(self.tracked.map_or(span, |t| t.hull(&span)));
    }

    pub fn union(&mut self, other: &DutyCycleTracker) {
        self.active.union(&other.active);
        if let Some(span) = other.tracked {
            self.extend_tracked(span);
        }
    }

    pub fn tracked_span(&self) -> Option<Timespan> {
        self.tracked
    }

    pub fn active_intervals(&self) -> &[Timespan] {
        &self.active.spans
    }

    pub fn idle_intervals(&self) -> Vec<Timespan> {
        let Some(tracked) = self.tracked else {
            return Vec::new();
        };
        let all = IntervalSet {
            spans: vec![tracked],
        };
        all.difference(&self.active)
    }

    pub fn total_tracked_time_ps(&self) -> u64 {
        self.tracked_span().map(|t| t.duration_ps).unwrap_or_default()
    }

    pub fn total_active_time_ps(&self) -> u64 {
        self.active.total_ps()
    }

    pub fn total_idle_time_ps(&self) -> u64 {
        self.total_tracked_time_ps()
            .saturating_sub(self.total_active_time_ps())
    }

    pub fn duty_cycle(&self) -> f64 {
        crate::safe_divide(
            self.total_active_time_ps() as f64,
            self.total_tracked_time_ps() as f64,
        )
    }
}

/// Reduces per-core trackers. Cores of the same chip are unioned so that
/// concurrent activity counts once; trackers without a chip identity are
/// added to an unattributed total.
#[derive(Debug, Clone, Default)]
pub struct DutyCycleCombiner {
    chips: BTreeMap<u32, DutyCycleTracker>,
    unattributed_active_ps: u64,
    unattributed_idle_ps: u64,
}

impl DutyCycleCombiner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn combine_core(&mut self, tracker: &DutyCycleTracker, chip_id: u32) {
        self.chips.entry(chip_id).or_default().union(tracker);
    }

    pub fn combine_chip(&mut self, tracker: &DutyCycleTracker) {
        self.unattributed_active_ps = self
            .unattributed_active_ps
            .saturating_add(tracker.total_active_time_ps());
        self.unattributed_idle_ps = self
            .unattributed_idle_ps
            .saturating_add(tracker.total_idle_time_ps());
    }

    pub fn total_active_time_ps(&self) -> u64 {
        self.chips
            .values()
            .map(DutyCycleTracker::total_active_time_ps)
            .fold(self.unattributed_active_ps, u64::saturating_add)
    }

    pub fn total_idle_time_ps(&self) -> u64 {
        self.chips
            .values()
            .map(DutyCycleTracker::total_idle_time_ps)
            .fold(self.unattributed_idle_ps, u64::saturating_add)
    }
}
