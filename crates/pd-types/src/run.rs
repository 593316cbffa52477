//! Compact key-range sets.
//!
//! Damage reports describe the keys an unreadable region would have held.
//! Corruption usually covers contiguous keys (a whole missing subtree), so
//! keys are stored as sorted, coalesced, closed intervals rather than as an
//! exhaustive list.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A closed interval of keys, `begin..=end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Run {
    pub begin: u64,
    pub end: u64,
}

impl Run {
    /// Interval covering `begin..=end`. Bounds are reordered if reversed.
    #[must_use]
    pub fn new(begin: u64, end: u64) -> Self {
        if begin <= end {
            Self { begin, end }
        } else {
            Self {
                begin: end,
                end: begin,
            }
        }
    }

    /// Interval holding exactly one key.
    #[must_use]
    pub fn single(key: u64) -> Self {
        Self {
            begin: key,
            end: key,
        }
    }

    /// Interval covering every `u64`.
    #[must_use]
    pub fn full() -> Self {
        Self {
            begin: 0,
            end: u64::MAX,
        }
    }

    #[must_use]
    pub fn contains(&self, key: u64) -> bool {
        self.begin <= key && key <= self.end
    }

    /// Number of keys in the interval.
    #[must_use]
    pub fn width(&self) -> u128 {
        u128::from(self.end - self.begin) + 1
    }

    /// `other` lies entirely inside `self`.
    #[must_use]
    pub fn covers(&self, other: &Self) -> bool {
        self.begin <= other.begin && other.end <= self.end
    }

    /// Overlapping or directly adjacent intervals can be coalesced.
    fn touches(&self, other: &Self) -> bool {
        let (lo, hi) = if self.begin <= other.begin {
            (self, other)
        } else {
            (other, self)
        };
        lo.end == u64::MAX || hi.begin <= lo.end + 1
    }
}

impl fmt::Display for Run {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.begin == self.end {
            write!(f, "[{}]", self.begin)
        } else {
            write!(f, "[{}..={}]", self.begin, self.end)
        }
    }
}

/// Sorted set of disjoint, non-adjacent closed intervals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunSet {
    runs: Vec<Run>,
}

impl RunSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set holding the keys of a single interval.
    #[must_use]
    pub fn from_run(run: Run) -> Self {
        Self { runs: vec![run] }
    }

    /// Add `run`, merging it with any interval it overlaps or abuts.
    pub fn insert(&mut self, run: Run) {
        let mut merged = run;
        let start = self
            .runs
            .partition_point(|existing| existing.end < merged.begin && !existing.touches(&merged));
        let mut stop = start;
        while stop < self.runs.len() && self.runs[stop].touches(&merged) {
            merged = Run {
                begin: merged.begin.min(self.runs[stop].begin),
                end: merged.end.max(self.runs[stop].end),
            };
            stop += 1;
        }
        self.runs.splice(start..stop, std::iter::once(merged));
    }

    /// Add the single key `key`.
    pub fn insert_key(&mut self, key: u64) {
        self.insert(Run::single(key));
    }

    #[must_use]
    pub fn contains(&self, key: u64) -> bool {
        let pos = self.runs.partition_point(|run| run.end < key);
        self.runs.get(pos).is_some_and(|run| run.contains(key))
    }

    /// Every key of `self` is also in `outer`.
    #[must_use]
    pub fn is_subset_of(&self, outer: &Run) -> bool {
        self.runs.iter().all(|run| outer.covers(run))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Number of intervals (not keys).
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// Total number of keys covered.
    #[must_use]
    pub fn key_count(&self) -> u128 {
        self.runs.iter().map(Run::width).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Run> {
        self.runs.iter()
    }

    #[must_use]
    pub fn runs(&self) -> &[Run] {
        &self.runs
    }
}

impl From<Run> for RunSet {
    fn from(run: Run) -> Self {
        Self::from_run(run)
    }
}

impl FromIterator<Run> for RunSet {
    fn from_iter<I: IntoIterator<Item = Run>>(iter: I) -> Self {
        let mut set = Self::new();
        for run in iter {
            set.insert(run);
        }
        set
    }
}

impl fmt::Display for RunSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, run) in self.runs.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{run}")?;
        }
        f.write_str("}")
    }
}
