//! Picosecond time intervals.

use serde::{Deserialize, Serialize};

/// Half-open interval `[begin_ps, begin_ps + duration_ps)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timespan {
    pub begin_ps: u64,
    pub duration_ps: u64,
}

impl Timespan {
    pub fn new(begin_ps: u64, duration_ps: u64) -> Self {
        Self { begin_ps, duration_ps }
    }

    pub fn from_end_points(begin_ps: u64, end_ps: u64) -> Self {
        Self {
            begin_ps,
            duration_ps: end_ps.saturating_sub(begin_ps),
        }
    }

    pub fn end_ps(&self) -> u64 {
        self.begin_ps.saturating_add(self.duration_ps)
    }

    pub fn is_empty(&self) -> bool {
        self.duration_ps == 0
    }

    pub fn overlaps(&self, other: &Timespan) -> bool {
        self.begin_ps < other.end_ps() && other.begin_ps < self.end_ps()
    }

    pub fn includes(&self, other: &Timespan) -> bool {
        self.begin_ps <= other.begin_ps && other.end_ps() <= self.end_ps()
    }

    /// Smallest span covering both.
    pub fn hull(&self, other: &Timespan) -> Timespan {
        Timespan::from_end_points(
            self.begin_ps.min(other.begin_ps),
            self.end_ps().max(other.end_ps()),
        )
    }

    /// Overlap of both spans. Disjoint spans yield an empty span anchored at
    /// the later begin.
    pub fn intersection(&self, other: &Timespan) -> Timespan {
        let begin = self.begin_ps.max(other.begin_ps);
        let end = self.end_ps().min(other.end_ps());
        Timespan::from_end_points(begin, end.max(begin))
    }
}
