//! Cascading time-bucketed counters.
//!
//! A [`MultilevelCount`] tracks one quantity over several rolling windows
//! at once: level 0 is the write tier and each level above it covers a
//! strictly longer interval. Counting deposits into the newest bucket of
//! every level, so each level's running sum is always the sum of its live
//! buckets. Rolling up expires buckets whose age has passed their level's
//! interval; a unit therefore contributes to every level's sum until it
//! ages out of that level.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct CountBucket {
    value: f64,
    timestamp: Instant,
}

/// One tier of a [`MultilevelCount`].
#[derive(Debug, Clone)]
pub struct CountLevel {
    current: f64,
    interval: Duration,
    buckets: VecDeque<CountBucket>,
}

impl CountLevel {
    fn new(interval: Duration, now: Instant) -> Self {
        let mut buckets = VecDeque::with_capacity(4);
        buckets.push_back(CountBucket {
            value: 0.0,
            timestamp: now,
        });
        Self {
            current: 0.0,
            interval,
            buckets,
        }
    }

    /// The running sum of this level's live buckets.
    #[must_use]
    pub fn current(&self) -> f64 {
        self.current
    }

    /// The window this level covers. Zero for the write tier.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// How much wall time this level's live buckets span.
    #[must_use]
    pub fn span(&self) -> Duration {
        self.span_at(Instant::now())
    }

    pub(crate) fn span_at(&self, now: Instant) -> Duration {
        match self.buckets.front() {
            Some(oldest) => now.saturating_duration_since(oldest.timestamp),
            None => Duration::ZERO,
        }
    }

    /// The level's current sum expressed as a rate per `unit`.
    #[must_use]
    pub fn rate_per(&self, unit: Duration) -> f64 {
        self.rate_per_at(unit, Instant::now())
    }

    pub(crate) fn rate_per_at(&self, unit: Duration, now: Instant) -> f64 {
        let span = self.span_at(now).as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        self.current / (span / unit.as_secs_f64())
    }

    fn count(&mut self, value: f64) {
        self.current += value;
        if let Some(newest) = self.buckets.back_mut() {
            newest.value += value;
        }
    }

    fn new_bucket(&mut self, now: Instant) {
        self.buckets.push_back(CountBucket {
            value: 0.0,
            timestamp: now,
        });
    }

    /// Detach every bucket older than this level's interval, returning
    /// whether any were detached.
    fn expire(&mut self, now: Instant) -> bool {
        let mut total = 0.0;
        let mut expired = false;
        while let Some(oldest) = self.buckets.front() {
            if now.saturating_duration_since(oldest.timestamp) < self.interval {
                break;
            }
            total += oldest.value;
            self.buckets.pop_front();
            expired = true;
        }
        if expired {
            self.current -= total;
        }
        expired
    }

    #[cfg(test)]
    fn bucket_sum(&self) -> f64 {
        self.buckets.iter().map(|b| b.value).sum()
    }

    #[cfg(test)]
    fn bucket_len(&self) -> usize {
        self.buckets.len()
    }
}

/// A counter observed simultaneously over several rolling windows.
#[derive(Debug, Clone)]
pub struct MultilevelCount {
    levels: Vec<CountLevel>,
}

impl MultilevelCount {
    /// Build a counter with one level per interval, plus the interval-zero
    /// write tier in front. Intervals must be given shortest first.
    #[must_use]
    pub fn new(intervals: &[Duration]) -> Self {
        Self::new_at(intervals, Instant::now())
    }

    pub(crate) fn new_at(intervals: &[Duration], now: Instant) -> Self {
        let mut levels = Vec::with_capacity(intervals.len() + 1);
        levels.push(CountLevel::new(Duration::ZERO, now));
        for &interval in intervals {
            levels.push(CountLevel::new(interval, now));
        }
        Self { levels }
    }

    /// Add `value` to the newest bucket of every level.
    pub fn count(&mut self, value: f64) {
        for level in &mut self.levels {
            level.count(value);
        }
    }

    /// The longest-window running sum.
    #[must_use]
    pub fn total(&self) -> f64 {
        self.levels.last().map_or(0.0, CountLevel::current)
    }

    /// The levels, write tier first.
    #[must_use]
    pub fn levels(&self) -> &[CountLevel] {
        &self.levels
    }

    /// Expire aged buckets out of each level and open a fresh bucket at
    /// the front of the cascade. Levels past the first only advance when
    /// the level before them had something expire.
    pub fn rollup(&mut self) {
        self.rollup_at(Instant::now());
    }

    pub(crate) fn rollup_at(&mut self, now: Instant) {
        Self::rollup_levels(&mut self.levels, now);
    }

    fn rollup_levels(levels: &mut [CountLevel], now: Instant) {
        let Some((head, rest)) = levels.split_first_mut() else {
            return;
        };
        if head.interval.is_zero() && rest.is_empty() {
            // A single-level counter never expires anything; this keeps
            // degenerate counters inert.
            return;
        }
        if head.expire(now) {
            Self::rollup_levels(rest, now);
        }
        head.new_bucket(now);
    }

    /// Drop all accumulated mass, leaving one fresh empty bucket per
    /// level. Used when a counter is reclaimed for a new key.
    pub fn reset(&mut self) {
        self.reset_at(Instant::now());
    }

    pub(crate) fn reset_at(&mut self, now: Instant) {
        for level in &mut self.levels {
            level.buckets.clear();
            level.new_bucket(now);
            level.current = 0.0;
        }
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);
    const HOUR: Duration = Duration::from_secs(3600);
    const DAY: Duration = Duration::from_secs(86400);

    #[test]
    fn count_reaches_every_level() {
        let mut counter = MultilevelCount::new(&[MINUTE, HOUR]);
        counter.count(1.0);
        for level in counter.levels() {
            assert_eq!(level.current(), 1.0);
        }
        assert_eq!(counter.total(), 1.0);
    }

    #[test]
    fn rollup_expires_by_level_interval() {
        let start = Instant::now();
        let mut counter = MultilevelCount::new_at(&[MINUTE, HOUR, DAY], start);
        counter.count(1.0);

        // An hour in, everything but the day level has aged out.
        let later = start + HOUR;
        counter.rollup_at(later);
        for level in &counter.levels[..3] {
            assert_eq!(level.current(), 0.0);
            assert_eq!(level.bucket_len(), 1);
        }
        assert_eq!(counter.levels[3].current(), 1.0);
        assert_eq!(counter.levels[3].bucket_len(), 2);

        counter.count(2.0);
        assert_eq!(counter.total(), 3.0);

        // A day past the first bucket: it expires out of the day level,
        // while the second bucket is still inside the window.
        counter.rollup_at(start + DAY + MINUTE);
        for level in &counter.levels[..3] {
            assert_eq!(level.current(), 0.0);
        }
        assert_eq!(counter.total(), 2.0);
    }

    #[test]
    fn reset_leaves_an_empty_counter() {
        let mut counter = MultilevelCount::new(&[MINUTE]);
        counter.count(5.0);
        counter.reset();
        assert_eq!(counter.total(), 0.0);
        for level in counter.levels() {
            assert_eq!(level.current(), 0.0);
            assert_eq!(level.bucket_sum(), 0.0);
        }
    }

    #[test]
    fn rate_per_scales_by_span() {
        let start = Instant::now();
        let mut counter = MultilevelCount::new_at(&[MINUTE], start);
        counter.count(30.0);
        let rate = counter.levels()[1].rate_per_at(MINUTE, start + 2 * MINUTE);
        assert!((rate - 15.0).abs() < 1e-9);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Count(f64),
        Advance(u64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0.0..100.0f64).prop_map(Op::Count),
            (0u64..30).prop_map(Op::Advance),
        ]
    }

    proptest! {
        // After any interleaving of counts and rollups, each level's
        // running sum matches its live buckets, and no mass leaves the
        // cascade before the top level's horizon elapses.
        #[test]
        fn level_sums_match_buckets(ops in prop::collection::vec(op_strategy(), 1..64)) {
            let start = Instant::now();
            let mut counter = MultilevelCount::new_at(&[Duration::from_secs(1), HOUR], start);
            let mut now = start;
            let mut counted = 0.0;
            for op in ops {
                match op {
                    Op::Count(value) => {
                        counter.count(value);
                        counted += value;
                    }
                    Op::Advance(secs) => {
                        now += Duration::from_secs(secs);
                        counter.rollup_at(now);
                    }
                }
                for level in counter.levels() {
                    let sum = level.bucket_sum();
                    prop_assert!((level.current() - sum).abs() < 1e-6);
                }
            }
            // Total elapsed time stays under the top window, so the top
            // level has expired nothing.
            prop_assert!((counter.total() - counted).abs() < 1e-6);
        }
    }
}
