use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::FactoryConfig;
use crate::error::ErrorKind;

/// Fixed-capacity circular buffer. Once full, every push overwrites the oldest slot.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    slots: Vec<Option<T>>,
    cursor: usize,
    len: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            cursor: 0,
            len: 0,
        }
    }

    pub fn push(&mut self, item: T) {
        let capacity = self.slots.len();
        self.slots[self.cursor] = Some(item);
        self.cursor = (self.cursor + 1) % capacity;
        if self.len < capacity {
            self.len += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.cursor = 0;
        self.len = 0;
    }

    /// Iterates oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let capacity = self.slots.len();
        let start = (self.cursor + capacity - self.len) % capacity;
        (0..self.len).filter_map(move |offset| self.slots[(start + offset) % capacity].as_ref())
    }
}

impl<T: Clone> RingBuffer<T> {
    /// The most recent `limit` items, oldest first.
    pub fn snapshot(&self, limit: usize) -> Vec<T> {
        let skip = self.len.saturating_sub(limit);
        self.iter().skip(skip).cloned().collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectionSample {
    pub objective_length: usize,
    pub required_capabilities: Vec<String>,
    pub winner: Option<String>,
    pub score: Option<f64>,
    pub candidate_count: usize,
    pub deep_context: bool,
    pub hotspot_count: usize,
    pub breakdown: BTreeMap<String, f64>,
    pub duration_ms: f64,
    pub config: BTreeMap<String, String>,
    pub error: Option<ErrorKind>,
    pub recorded_at: DateTime<Utc>,
}

impl SelectionSample {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstantiationSample {
    pub name: String,
    pub duration_ms: f64,
    pub success: bool,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TelemetrySummary {
    pub selections_total: u64,
    pub selection_failures: u64,
    pub instantiations_total: u64,
    pub instantiation_failures: u64,
    pub buffered_selections: usize,
    pub buffered_instantiations: usize,
    pub selection_success_rate: Option<f64>,
    pub mean_selection_ms: Option<f64>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // a panic while pushing a sample cannot leave the buffer half-written
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
pub struct SelectionProfiler {
    enabled: bool,
    buffer: Mutex<RingBuffer<SelectionSample>>,
}

impl SelectionProfiler {
    pub fn new(capacity: usize, enabled: bool) -> Self {
        Self {
            enabled,
            buffer: Mutex::new(RingBuffer::new(capacity)),
        }
    }

    pub fn record(&self, sample: SelectionSample) {
        if self.enabled {
            lock(&self.buffer).push(sample);
        }
    }

    pub fn samples(&self, limit: usize) -> Vec<SelectionSample> {
        lock(&self.buffer).snapshot(limit)
    }

    fn stats(&self) -> (usize, Option<f64>) {
        let buffer = lock(&self.buffer);
        let count = buffer.len();
        let mean = if count == 0 {
            None
        } else {
            Some(buffer.iter().map(|sample| sample.duration_ms).sum::<f64>() / count as f64)
        };
        (count, mean)
    }
}

#[derive(Debug)]
pub struct InstantiationProfiler {
    enabled: bool,
    buffer: Mutex<RingBuffer<InstantiationSample>>,
}

impl InstantiationProfiler {
    pub fn new(capacity: usize, enabled: bool) -> Self {
        Self {
            enabled,
            buffer: Mutex::new(RingBuffer::new(capacity)),
        }
    }

    pub fn record(&self, name: &str, duration: Duration, success: bool) {
        if self.enabled {
            lock(&self.buffer).push(InstantiationSample {
                name: name.to_string(),
                duration_ms: duration.as_secs_f64() * 1000.0,
                success,
                recorded_at: Utc::now(),
            });
        }
    }

    pub fn samples(&self, limit: usize) -> Vec<InstantiationSample> {
        lock(&self.buffer).snapshot(limit)
    }

    fn len(&self) -> usize {
        lock(&self.buffer).len()
    }
}

/// Owns both profilers. Its locks are never taken while registry locks are
/// needed, so recording cannot stall selection.
#[derive(Debug)]
pub struct TelemetryManager {
    selection: SelectionProfiler,
    instantiation: InstantiationProfiler,
    selections_total: AtomicU64,
    selection_failures: AtomicU64,
    instantiations_total: AtomicU64,
    instantiation_failures: AtomicU64,
}

impl TelemetryManager {
    pub fn new(config: &FactoryConfig) -> Self {
        Self {
            selection: SelectionProfiler::new(config.max_profiles, config.profile_selection),
            instantiation: InstantiationProfiler::new(
                config.max_profiles,
                config.profile_instantiation,
            ),
            selections_total: AtomicU64::new(0),
            selection_failures: AtomicU64::new(0),
            instantiations_total: AtomicU64::new(0),
            instantiation_failures: AtomicU64::new(0),
        }
    }

    pub fn record_selection(&self, sample: SelectionSample) {
        self.selections_total.fetch_add(1, Ordering::Relaxed);
        if !sample.succeeded() {
            self.selection_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.selection.record(sample);
    }

    pub fn record_instantiation(&self, name: &str, duration: Duration, success: bool) {
        self.instantiations_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.instantiation_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.instantiation.record(name, duration, success);
    }

    pub fn get_selection_samples(&self, limit: usize) -> Vec<SelectionSample> {
        self.selection.samples(limit)
    }

    pub fn get_instantiation_samples(&self, limit: usize) -> Vec<InstantiationSample> {
        self.instantiation.samples(limit)
    }

    pub fn summary(&self) -> TelemetrySummary {
        let (buffered_selections, mean_selection_ms) = self.selection.stats();
        let selections_total = self.selections_total.load(Ordering::Relaxed);
        let selection_failures = self.selection_failures.load(Ordering::Relaxed);
        let selection_success_rate = (selections_total > 0).then(|| {
            (selections_total - selection_failures) as f64 / selections_total as f64
        });
        TelemetrySummary {
            selections_total,
            selection_failures,
            instantiations_total: self.instantiations_total.load(Ordering::Relaxed),
            instantiation_failures: self.instantiation_failures.load(Ordering::Relaxed),
            buffered_selections,
            buffered_instantiations: self.instantiation.len(),
            selection_success_rate,
            mean_selection_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(winner: &str, duration_ms: f64) -> SelectionSample {
        SelectionSample {
            objective_length: 4,
            required_capabilities: vec![],
            winner: Some(winner.to_string()),
            score: Some(1.0),
            candidate_count: 1,
            deep_context: false,
            hotspot_count: 0,
            breakdown: BTreeMap::new(),
            duration_ms,
            config: BTreeMap::new(),
            error: None,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn ring_keeps_only_most_recent() {
        let mut ring = RingBuffer::new(3);
        for value in 0..10 {
            ring.push(value);
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.capacity(), 3);
        assert_eq!(ring.snapshot(10), vec![7, 8, 9]);
        assert_eq!(ring.snapshot(2), vec![8, 9]);
    }

    #[test]
    fn snapshot_before_wraparound() {
        let mut ring = RingBuffer::new(5);
        ring.push("a");
        ring.push("b");
        assert_eq!(ring.snapshot(5), vec!["a", "b"]);
        assert_eq!(ring.snapshot(1), vec!["b"]);
        assert_eq!(ring.snapshot(0), Vec::<&str>::new());
        assert_eq!(ring.len(), 2, "snapshot must not consume");
    }

    #[test]
    fn every_overflow_length_keeps_capacity_items() {
        for capacity in 1..6 {
            for pushed in capacity + 1..capacity * 4 {
                let mut ring = RingBuffer::new(capacity);
                for value in 0..pushed {
                    ring.push(value);
                }
                let expected: Vec<usize> = (pushed - capacity..pushed).collect();
                assert_eq!(ring.snapshot(usize::MAX), expected);
            }
        }
    }

    #[test]
    fn zero_capacity_is_promoted() {
        let mut ring = RingBuffer::new(0);
        ring.push(1);
        ring.push(2);
        assert_eq!(ring.snapshot(5), vec![2]);
        ring.clear();
        assert!(ring.is_empty());
    }

    #[test]
    fn disabled_profiler_records_nothing_but_counts() {
        let config = FactoryConfig {
            profile_selection: false,
            ..FactoryConfig::default()
        };
        let telemetry = TelemetryManager::new(&config);
        telemetry.record_selection(sample("a", 1.0));
        assert!(telemetry.get_selection_samples(10).is_empty());
        assert_eq!(telemetry.summary().selections_total, 1);
    }

    #[test]
    fn summary_tracks_failures_and_means() {
        let telemetry = TelemetryManager::new(&FactoryConfig::default().with_max_profiles(2));
        telemetry.record_selection(sample("a", 2.0));
        let mut failed = sample("b", 4.0);
        failed.winner = None;
        failed.error = Some(ErrorKind::NoActivePlanners);
        telemetry.record_selection(failed);
        telemetry.record_selection(sample("c", 6.0));
        telemetry.record_instantiation("c", Duration::from_millis(3), false);

        let summary = telemetry.summary();
        assert_eq!(summary.selections_total, 3);
        assert_eq!(summary.selection_failures, 1);
        assert_eq!(summary.buffered_selections, 2);
        assert_eq!(summary.mean_selection_ms, Some(5.0));
        assert_eq!(summary.selection_success_rate, Some(2.0 / 3.0));
        assert_eq!(summary.instantiation_failures, 1);

        let recent = telemetry.get_selection_samples(5);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].winner.as_deref(), Some("c"));
        assert!(!telemetry.get_instantiation_samples(1)[0].success);
    }
}
