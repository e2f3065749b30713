//! Bounded string-frequency tables.
//!
//! A [`FrequencyCounter`] tracks how often each of an unbounded set of
//! strings is observed, over the rolling windows of a
//! [`MultilevelCount`] per string. Growth is bounded by [`Trim`]: each
//! flush keeps the top `capacity + oversample` strings by longest-window
//! total and reclaims the counters of everything below the cut for reuse,
//! so the number of live counters is bounded by peak key cardinality.
//!
//! [`Trim`]: FrequencyCounter::trim

use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use crate::multilevel::MultilevelCount;

/// A top-K table of string observation frequencies.
#[derive(Debug)]
pub struct FrequencyCounter {
    capacity: usize,
    oversample_capacity: usize,
    intervals: Vec<Duration>,
    total_observed: f64,
    frequencies: FxHashMap<String, MultilevelCount>,
    reclamation: Vec<MultilevelCount>,
}

impl FrequencyCounter {
    /// Build a table keeping roughly `capacity` strings, tracked over the
    /// given rolling windows. Twice the capacity is retained between
    /// trims so strings hovering near the cut keep their history.
    #[must_use]
    pub fn new(capacity: usize, intervals: Vec<Duration>) -> Self {
        Self {
            capacity,
            oversample_capacity: capacity,
            intervals,
            total_observed: 0.0,
            frequencies: FxHashMap::default(),
            reclamation: Vec::new(),
        }
    }

    /// Total weight observed over the table's lifetime, trimmed strings
    /// included.
    #[must_use]
    pub fn total_observed(&self) -> f64 {
        self.total_observed
    }

    /// The number of strings currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frequencies.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frequencies.is_empty()
    }

    /// Record `value` observations of `key`, installing a counter for the
    /// key if it is new. Reclaimed counters are reused before anything is
    /// allocated.
    pub fn count(&mut self, key: &str, value: f64) {
        self.total_observed += value;
        if let Some(counter) = self.frequencies.get_mut(key) {
            counter.count(value);
            return;
        }
        let mut counter = self
            .reclamation
            .pop()
            .unwrap_or_else(|| MultilevelCount::new(&self.intervals));
        counter.count(value);
        self.frequencies.insert(key.to_owned(), counter);
    }

    /// Fold a child table into this one. Each child string contributes its
    /// longest-window total.
    pub fn aggregate(&mut self, child: &FrequencyCounter) {
        for (key, counter) in &child.frequencies {
            self.count(key, counter.total());
        }
    }

    /// Advance time for the strings that stay and evict the rest.
    ///
    /// Strings rank by longest-window total, descending. Those within
    /// `capacity + oversample` have their counters rolled up; everything
    /// below the cut is reset and pushed on the reclamation stack.
    pub fn trim(&mut self) {
        self.trim_at(Instant::now());
    }

    pub(crate) fn trim_at(&mut self, now: Instant) {
        let keep = self.capacity + self.oversample_capacity;
        let mut items: Vec<(String, MultilevelCount)> = self.frequencies.drain().collect();
        items.sort_by(|a, b| b.1.total().total_cmp(&a.1.total()));
        for (rank, (key, mut counter)) in items.into_iter().enumerate() {
            if rank < keep {
                counter.rollup_at(now);
                self.frequencies.insert(key, counter);
            } else {
                counter.reset_at(now);
                self.reclamation.push(counter);
            }
        }
    }

    /// All tracked strings with their counters, sorted by longest-window
    /// total, descending. Ties keep an arbitrary but stable order.
    #[must_use]
    pub fn sorted_items(&self) -> Vec<(&str, &MultilevelCount)> {
        let mut items: Vec<(&str, &MultilevelCount)> = self
            .frequencies
            .iter()
            .map(|(key, counter)| (key.as_str(), counter))
            .collect();
        items.sort_by(|a, b| b.1.total().total_cmp(&a.1.total()));
        items
    }
}
