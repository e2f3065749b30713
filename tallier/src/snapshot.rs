//! Per-window stat accumulation.
//!
//! A [`Snapshot`] holds everything one worker has observed since the last
//! flush: counter sums, raw timer samples, point-in-time reports, and
//! per-key string frequencies. At flush time the per-worker snapshots are
//! folded into one, rendered into graphite's plaintext line protocol, and
//! then reset for the next window.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rustc_hash::FxHashMap;
use tallier_statgram::{Kind, Statgram};

use crate::frequency::FrequencyCounter;

/// Initial capacity of a key's timing vector.
pub const TIMINGS_INITIAL_CAPACITY: usize = 1024;
/// How many strings each frequency table keeps per key.
pub const STRING_COUNT_CAPACITY: usize = 1024;

/// The synthetic string-count key tallying one unit per processed sample,
/// keyed by the sample's metric name. This is the "which keys are hot"
/// introspection surface.
pub const SAMPLES_KEY: &str = "tallier.samples";

const MESSAGES_CHILD_PREFIX: &str = "tallier.messages.child_";
const MESSAGES_TOTAL: &str = "tallier.messages.total";
const BYTES_CHILD_PREFIX: &str = "tallier.bytes.child_";
const BYTES_TOTAL: &str = "tallier.bytes.total";

/// A point-in-time observation carrying its own timestamp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Report {
    pub value: f64,
    pub timestamp: SystemTime,
}

/// One flush window's worth of accumulated observations.
#[derive(Debug)]
pub struct Snapshot {
    counts: FxHashMap<String, f64>,
    timings: FxHashMap<String, Vec<f64>>,
    reports: FxHashMap<String, Report>,
    string_counts: FxHashMap<String, FrequencyCounter>,
    string_count_intervals: Vec<Duration>,
    /// When this window opened. Stamps every non-report graphite line.
    pub start: SystemTime,
    /// How long the window ran. Scales counter rates at reporting time.
    pub duration: Duration,
    num_children: usize,
}

impl Snapshot {
    /// An empty snapshot whose string-frequency tables will track the
    /// given rolling windows.
    #[must_use]
    pub fn new(string_count_intervals: Vec<Duration>) -> Self {
        Self {
            counts: FxHashMap::default(),
            timings: FxHashMap::default(),
            reports: FxHashMap::default(),
            string_counts: FxHashMap::default(),
            string_count_intervals,
            start: SystemTime::now(),
            duration: Duration::ZERO,
            num_children: 0,
        }
    }

    /// The number of distinct counter and timer keys in this window.
    #[must_use]
    pub fn num_stats(&self) -> usize {
        self.counts.len() + self.timings.len()
    }

    /// How many child snapshots have been folded in since the last flush.
    #[must_use]
    pub fn num_children(&self) -> usize {
        self.num_children
    }

    #[must_use]
    pub fn counts(&self) -> &FxHashMap<String, f64> {
        &self.counts
    }

    #[must_use]
    pub fn timings(&self) -> &FxHashMap<String, Vec<f64>> {
        &self.timings
    }

    #[must_use]
    pub fn reports(&self) -> &FxHashMap<String, Report> {
        &self.reports
    }

    #[must_use]
    pub fn string_counts(&self) -> &FxHashMap<String, FrequencyCounter> {
        &self.string_counts
    }

    /// The rolling windows every string-frequency table tracks.
    #[must_use]
    pub fn string_count_intervals(&self) -> &[Duration] {
        &self.string_count_intervals
    }

    /// Add `value` to the counter for `key`.
    pub fn count(&mut self, key: &str, value: f64) {
        match self.counts.get_mut(key) {
            Some(current) => *current += value,
            None => {
                self.counts.insert(key.to_owned(), value);
            }
        }
    }

    /// Append one timing observation for `key`.
    pub fn time(&mut self, key: &str, value: f64) {
        self.timings
            .entry(key.to_owned())
            .or_insert_with(|| Vec::with_capacity(TIMINGS_INITIAL_CAPACITY))
            .push(value);
    }

    /// Record `count` observations of the string `value` under `key`.
    pub fn count_string(&mut self, key: &str, value: &str, count: f64) {
        if let Some(frequencies) = self.string_counts.get_mut(key) {
            frequencies.count(value, count);
            return;
        }
        let mut frequencies =
            FrequencyCounter::new(STRING_COUNT_CAPACITY, self.string_count_intervals.clone());
        frequencies.count(value, count);
        self.string_counts.insert(key.to_owned(), frequencies);
    }

    /// Record a point-in-time report, stamped now. Last write wins.
    pub fn report(&mut self, key: &str, value: f64) {
        self.report_at(key, value, SystemTime::now());
    }

    /// Record a point-in-time report with an explicit timestamp.
    pub fn report_at(&mut self, key: &str, value: f64, timestamp: SystemTime) {
        self.reports
            .insert(key.to_owned(), Report { value, timestamp });
    }

    /// Accumulate every sample of a statgram.
    ///
    /// Counter and string weights are divided by their sample rate to
    /// recover unbiased sums. Gauges either replace the key's report or
    /// shift it by a signed delta. Every sample additionally tallies one
    /// unit under [`SAMPLES_KEY`].
    pub fn process_statgram(&mut self, statgram: &Statgram) {
        for sample in statgram {
            match &sample.kind {
                Kind::Counter => self.count(&sample.key, sample.value / sample.sample_rate),
                Kind::Timer => self.time(&sample.key, sample.value),
                Kind::Str(observed) => {
                    self.count_string(&sample.key, observed, sample.value / sample.sample_rate);
                }
                Kind::Gauge { replace } => {
                    let level = if *replace {
                        sample.value
                    } else {
                        self.reports.get(&sample.key).map_or(0.0, |r| r.value) + sample.value
                    };
                    self.report(&sample.key, level);
                }
            }
            self.count_string(SAMPLES_KEY, &sample.key, 1.0);
        }
    }

    /// Fold a child snapshot into this one.
    ///
    /// Counter sums add; per-child traffic counters additionally feed the
    /// process-wide totals. Timing vectors concatenate (ordering is
    /// unspecified until reporting sorts them). String-frequency tables
    /// fold by longest-window totals. Reports are not merged: they are
    /// whole-process telemetry stamped at the flush layer.
    pub fn aggregate(&mut self, child: Snapshot) {
        for (key, value) in child.counts {
            if key.starts_with(MESSAGES_CHILD_PREFIX) {
                self.count(MESSAGES_TOTAL, value);
            } else if key.starts_with(BYTES_CHILD_PREFIX) {
                self.count(BYTES_TOTAL, value);
            }
            self.count(&key, value);
        }
        for (key, mut timings) in child.timings {
            match self.timings.get_mut(&key) {
                Some(existing) => existing.append(&mut timings),
                None => {
                    self.timings.insert(key, timings);
                }
            }
        }
        for (key, frequencies) in &child.string_counts {
            if let Some(existing) = self.string_counts.get_mut(key) {
                existing.aggregate(frequencies);
                continue;
            }
            let mut fresh =
                FrequencyCounter::new(STRING_COUNT_CAPACITY, self.string_count_intervals.clone());
            fresh.aggregate(frequencies);
            self.string_counts.insert(key.clone(), fresh);
        }
        self.num_children += 1;
    }

    /// Render this window as graphite plaintext lines, newline included.
    ///
    /// Counters emit a rate-scaled `stats.` line and a raw `stats_counts.`
    /// line; each non-empty timing series emits its lower/upper/upper_90/
    /// mean/count/rate summary; reports emit one line stamped with their
    /// own timestamp. Timing vectors are sorted in place.
    pub fn graphite_report(&mut self) -> Vec<String> {
        let stamp = unix_seconds(self.start);
        let mut report =
            Vec::with_capacity(2 * self.counts.len() + 6 * self.timings.len() + self.reports.len());
        let window = self.duration.as_secs_f64();
        let scale = if window > 0.0 { 1.0 / window } else { 0.0 };
        for (key, value) in &self.counts {
            report.push(format!("stats.{key} {:.6} {stamp}\n", value * scale));
            report.push(format!("stats_counts.{key} {value:.6} {stamp}\n"));
        }
        for (key, timings) in &mut self.timings {
            if timings.is_empty() {
                continue;
            }
            timings.sort_by(f64::total_cmp);
            let count = timings.len();
            let sum: f64 = timings.iter().sum();
            #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            let upper_90 = timings[(0.9 * count as f64).ceil() as usize - 1];
            report.push(format!("stats.timers.{key}.lower {:.6} {stamp}\n", timings[0]));
            report.push(format!(
                "stats.timers.{key}.upper {:.6} {stamp}\n",
                timings[count - 1]
            ));
            report.push(format!("stats.timers.{key}.upper_90 {upper_90:.6} {stamp}\n"));
            report.push(format!(
                "stats.timers.{key}.mean {:.6} {stamp}\n",
                sum / count as f64
            ));
            report.push(format!("stats.timers.{key}.count {count} {stamp}\n"));
            report.push(format!(
                "stats.timers.{key}.rate {:.6} {stamp}\n",
                count as f64 * scale
            ));
        }
        for (key, observed) in &self.reports {
            report.push(format!(
                "stats.{key} {:.6} {}\n",
                observed.value,
                unix_seconds(observed.timestamp)
            ));
        }
        report
    }

    /// Open the next window: counters, timings, and reports are dropped
    /// (maps resized to their previous occupancy), while string-frequency
    /// tables survive and are trimmed to capacity.
    pub fn flush(&mut self) {
        self.counts = FxHashMap::with_capacity_and_hasher(self.counts.len(), Default::default());
        self.timings = FxHashMap::with_capacity_and_hasher(self.timings.len(), Default::default());
        self.reports = FxHashMap::with_capacity_and_hasher(self.reports.len(), Default::default());
        for frequencies in self.string_counts.values_mut() {
            frequencies.trim();
        }
        self.num_children = 0;
    }
}

fn unix_seconds(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod test {
    use tallier_statgram::Sample;

    use super::*;

    fn sample(key: &str, value: f64, sample_rate: f64, kind: Kind) -> Sample {
        Sample {
            key: key.to_owned(),
            value,
            sample_rate,
            kind,
        }
    }

    fn string_totals(snapshot: &Snapshot, key: &str) -> Vec<(String, f64)> {
        snapshot.string_counts()[key]
            .sorted_items()
            .into_iter()
            .map(|(value, counter)| (value.to_owned(), counter.total()))
            .collect()
    }

    #[test]
    fn process_statgram_accumulates_by_kind() {
        let mut snapshot = Snapshot::new(Vec::new());
        snapshot.process_statgram(&vec![
            sample("x", 1.0, 1.0, Kind::Counter),
            sample("x", 2.0, 1.0, Kind::Counter),
            sample("y", 1.0, 0.5, Kind::Timer),
            sample("z", 0.1, 1.0, Kind::Counter),
            sample("s", 0.0, 1.0, Kind::Str("hello".to_owned())),
        ]);

        assert_eq!(snapshot.counts()["x"], 3.0);
        assert_eq!(snapshot.counts()["z"], 0.1);
        assert!(!snapshot.counts().contains_key("y"));
        assert_eq!(snapshot.timings()["y"], vec![1.0]);
        assert_eq!(
            string_totals(&snapshot, "s"),
            vec![("hello".to_owned(), 0.0)]
        );

        // Sampled counters are unbiased by their rate.
        snapshot.process_statgram(&vec![sample("y2", 3.0, 0.5, Kind::Counter)]);
        assert_eq!(snapshot.counts()["y2"], 6.0);
    }

    #[test]
    fn every_sample_tallies_under_the_samples_key() {
        let mut snapshot = Snapshot::new(Vec::new());
        snapshot.process_statgram(&vec![
            sample("x", 1.0, 1.0, Kind::Counter),
            sample("x", 2.0, 1.0, Kind::Counter),
            sample("y", 1.0, 0.5, Kind::Timer),
            sample("z", 0.1, 1.0, Kind::Counter),
        ]);
        let samples = string_totals(&snapshot, SAMPLES_KEY);
        assert_eq!(samples[0], ("x".to_owned(), 2.0));
        let mut tail = samples[1..].to_vec();
        tail.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(tail, vec![("y".to_owned(), 1.0), ("z".to_owned(), 1.0)]);
    }

    #[test]
    fn gauges_replace_or_accumulate() {
        let mut snapshot = Snapshot::new(Vec::new());
        snapshot.process_statgram(&vec![sample("w", 120.0, 1.0, Kind::Gauge { replace: true })]);
        assert_eq!(snapshot.reports()["w"].value, 120.0);

        snapshot.process_statgram(&vec![sample("w", 5.0, 1.0, Kind::Gauge { replace: false })]);
        assert_eq!(snapshot.reports()["w"].value, 125.0);

        snapshot.process_statgram(&vec![sample("w", -25.0, 1.0, Kind::Gauge { replace: false })]);
        assert_eq!(snapshot.reports()["w"].value, 100.0);

        snapshot.process_statgram(&vec![sample("w", 7.0, 1.0, Kind::Gauge { replace: true })]);
        assert_eq!(snapshot.reports()["w"].value, 7.0);
    }

    #[test]
    fn aggregate_folds_children_and_traffic_totals() {
        let mut a = Snapshot::new(Vec::new());
        a.process_statgram(&vec![
            sample("x", 1.0, 1.0, Kind::Counter),
            sample("y", 0.5, 0.5, Kind::Counter),
        ]);
        for i in 0..10 {
            a.time("z", f64::from(i));
        }
        a.count("tallier.messages.child_1", 2.0);
        a.count("tallier.bytes.child_1", 20.0);

        let mut b = Snapshot::new(Vec::new());
        b.process_statgram(&vec![
            sample("y", 3.0, 1.0, Kind::Counter),
            sample("z", 4.0, 1.0, Kind::Counter),
        ]);
        for i in 0..5 {
            b.time("z", 2.0 * f64::from(i));
        }
        b.count("tallier.messages.child_2", 3.0);
        b.count("tallier.bytes.child_2", 30.0);

        let mut parent = Snapshot::new(Vec::new());
        parent.aggregate(a);
        parent.aggregate(b);

        assert_eq!(parent.counts()["x"], 1.0);
        assert_eq!(parent.counts()["y"], 4.0);
        assert_eq!(parent.counts()["z"], 4.0);
        assert_eq!(parent.counts()["tallier.messages.child_1"], 2.0);
        assert_eq!(parent.counts()["tallier.messages.child_2"], 3.0);
        assert_eq!(parent.counts()["tallier.messages.total"], 5.0);
        assert_eq!(parent.counts()["tallier.bytes.total"], 50.0);
        assert_eq!(parent.num_children(), 2);

        let mut timings = parent.timings()["z"].clone();
        timings.sort_by(f64::total_cmp);
        assert_eq!(
            timings,
            vec![0.0, 0.0, 1.0, 2.0, 2.0, 3.0, 4.0, 4.0, 5.0, 6.0, 6.0, 7.0, 8.0, 8.0, 9.0]
        );
    }

    #[test]
    fn aggregation_order_does_not_change_counts() {
        let build = || {
            let mut a = Snapshot::new(Vec::new());
            a.count("x", 1.0);
            a.count("y", 2.0);
            let mut b = Snapshot::new(Vec::new());
            b.count("y", 3.0);
            b.count("z", 4.0);
            (a, b)
        };

        let (a, b) = build();
        let mut forward = Snapshot::new(Vec::new());
        forward.aggregate(a);
        forward.aggregate(b);

        let (a, b) = build();
        let mut backward = Snapshot::new(Vec::new());
        backward.aggregate(b);
        backward.aggregate(a);

        assert_eq!(forward.counts(), backward.counts());
    }

    #[test]
    fn graphite_report_renders_counts_timers_and_reports() {
        let now = SystemTime::now();
        let stamp = now.duration_since(UNIX_EPOCH).unwrap().as_secs();

        let mut snapshot = Snapshot::new(Vec::new());
        snapshot.start = now;
        snapshot.duration = Duration::from_secs(10);
        assert!(snapshot.graphite_report().is_empty());

        let mut child = Snapshot::new(Vec::new());
        child.count("x", 100.0);
        for i in 0..10 {
            child.time("y", 10.0 - f64::from(i));
        }
        snapshot.aggregate(child);
        snapshot.report_at("tallier.num_workers", 1.0, now);

        let mut report = snapshot.graphite_report();
        report.sort();
        let mut expected = vec![
            format!("stats.x 10.000000 {stamp}\n"),
            format!("stats_counts.x 100.000000 {stamp}\n"),
            format!("stats.timers.y.lower 1.000000 {stamp}\n"),
            format!("stats.timers.y.upper 10.000000 {stamp}\n"),
            format!("stats.timers.y.upper_90 9.000000 {stamp}\n"),
            format!("stats.timers.y.mean 5.500000 {stamp}\n"),
            format!("stats.timers.y.count 10 {stamp}\n"),
            format!("stats.timers.y.rate 1.000000 {stamp}\n"),
            format!("stats.tallier.num_workers 1.000000 {stamp}\n"),
        ];
        expected.sort();
        assert_eq!(report, expected);
    }

    #[test]
    fn single_timing_summarizes_to_itself() {
        let mut snapshot = Snapshot::new(Vec::new());
        snapshot.duration = Duration::from_secs(1);
        snapshot.time("t", 42.0);
        let report = snapshot.graphite_report();
        for suffix in ["lower", "upper", "upper_90", "mean"] {
            assert!(report
                .iter()
                .any(|line| line.starts_with(&format!("stats.timers.t.{suffix} 42.000000"))));
        }
    }

    #[test]
    fn flush_drops_the_window_but_keeps_string_counts() {
        let mut snapshot = Snapshot::new(Vec::new());
        snapshot.count("x", 1.0);
        snapshot.time("y", 2.0);
        snapshot.report("r", 3.0);
        snapshot.count_string("s", "hello", 1.0);
        let mut child = Snapshot::new(Vec::new());
        child.count("z", 1.0);
        snapshot.aggregate(child);

        snapshot.flush();
        assert_eq!(snapshot.num_stats(), 0);
        assert!(snapshot.reports().is_empty());
        assert_eq!(snapshot.num_children(), 0);
        assert_eq!(
            string_totals(&snapshot, "s"),
            vec![("hello".to_owned(), 1.0)]
        );
    }
}
