// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Metrics collection for performance monitoring.
//!
//! Lightweight in-process counters and latency histograms. Each agent process
//! keeps its own registry; nothing is exported over the network.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

/// Global metrics instance.
pub static GLOBAL_METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

/// Supervision events counted by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    Spawns,
    SpawnFailures,
    SpawnsSkipped,
    MessagesDispatched,
    MessagesDropped,
    MessagesFailed,
    MessagesMalformed,
    DieMarkers,
    Sigterms,
    Sigkills,
}

impl Counter {
    pub const ALL: [Counter; 10] = [
        Counter::Spawns,
        Counter::SpawnFailures,
        Counter::SpawnsSkipped,
        Counter::MessagesDispatched,
        Counter::MessagesDropped,
        Counter::MessagesFailed,
        Counter::MessagesMalformed,
        Counter::DieMarkers,
        Counter::Sigterms,
        Counter::Sigkills,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Counter::Spawns => "spawns",
            Counter::SpawnFailures => "spawn_failures",
            Counter::SpawnsSkipped => "spawns_skipped",
            Counter::MessagesDispatched => "messages_dispatched",
            Counter::MessagesDropped => "messages_dropped",
            Counter::MessagesFailed => "messages_failed",
            Counter::MessagesMalformed => "messages_malformed",
            Counter::DieMarkers => "die_markers",
            Counter::Sigterms => "sigterms",
            Counter::Sigkills => "sigkills",
        }
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Central metrics collection.
#[derive(Debug)]
pub struct Metrics {
    counters: [AtomicU64; Counter::ALL.len()],

    /// Per message-type handler metrics, keyed `<channel>:<type>`.
    handlers: RwLock<HashMap<String, HandlerMetrics>>,

    /// General operation metrics.
    operations: RwLock<HashMap<String, OperationMetrics>>,

    start_time: Instant,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Metrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            counters: Default::default(),
            handlers: RwLock::new(HashMap::new()),
            operations: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Increment a counter by one.
    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        self.counters[counter.index()].fetch_add(n, Ordering::Relaxed);
    }

    pub fn count(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    /// Record one handler invocation.
    pub fn record_handler(&self, channel: &str, kind: &str, duration: Duration, success: bool) {
        let mut handlers = write(&self.handlers);
        let metrics = handlers
            .entry(format!("{}:{}", channel, kind))
            .or_insert_with(HandlerMetrics::new);
        metrics.record(duration, success);
    }

    /// Record a generic operation.
    pub fn record_operation(&self, name: &str, duration: Duration) {
        let mut ops = write(&self.operations);
        let metrics = ops.entry(name.to_string()).or_insert_with(OperationMetrics::new);
        metrics.record(duration);
    }

    pub fn handler_metrics(&self, key: &str) -> Option<HandlerMetrics> {
        read(&self.handlers).get(key).cloned()
    }

    pub fn operation_metrics(&self, name: &str) -> Option<OperationMetrics> {
        read(&self.operations).get(name).cloned()
    }

    /// Get uptime since metrics were initialized.
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Take a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: Counter::ALL.iter().map(|c| (*c, self.count(*c))).collect(),
            handlers: read(&self.handlers).clone(),
            operations: read(&self.operations).clone(),
            uptime: self.uptime(),
        }
    }

    /// Reset all metrics.
    pub fn reset(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
        write(&self.handlers).clear();
        write(&self.operations).clear();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics for one message handler.
#[derive(Debug, Clone)]
pub struct HandlerMetrics {
    pub invocations: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_duration: Duration,
    pub max_duration: Duration,
}

impl HandlerMetrics {
    pub fn new() -> Self {
        Self {
            invocations: 0,
            successes: 0,
            failures: 0,
            total_duration: Duration::ZERO,
            max_duration: Duration::ZERO,
        }
    }

    pub fn record(&mut self, duration: Duration, success: bool) {
        self.invocations += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.total_duration += duration;
        self.max_duration = self.max_duration.max(duration);
    }

    pub fn avg_duration(&self) -> Duration {
        if self.invocations == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.invocations as u32
        }
    }

    /// Success rate (0.0 to 1.0).
    pub fn success_rate(&self) -> f64 {
        if self.invocations == 0 {
            1.0
        } else {
            self.successes as f64 / self.invocations as f64
        }
    }
}

impl Default for HandlerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Generic operation metrics with histogram.
#[derive(Debug, Clone)]
pub struct OperationMetrics {
    pub count: u64,
    pub total_duration: Duration,
    pub min_duration: Duration,
    pub max_duration: Duration,
    /// Histogram buckets for latency distribution.
    pub histogram: Histogram,
}

impl OperationMetrics {
    pub fn new() -> Self {
        Self {
            count: 0,
            total_duration: Duration::ZERO,
            min_duration: Duration::MAX,
            max_duration: Duration::ZERO,
            histogram: Histogram::default(),
        }
    }

    pub fn record(&mut self, duration: Duration) {
        self.count += 1;
        self.total_duration += duration;
        self.min_duration = self.min_duration.min(duration);
        self.max_duration = self.max_duration.max(duration);
        self.histogram.record(duration);
    }

    pub fn avg_duration(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.count as u32
        }
    }
}

impl Default for OperationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Simple histogram with fixed buckets for latency tracking.
#[derive(Debug, Clone)]
pub struct Histogram {
    /// Bucket boundaries in microseconds.
    buckets: Vec<u64>,
    counts: Vec<u64>,
}

impl Histogram {
    /// Create a histogram with custom bucket boundaries (in microseconds).
    pub fn with_buckets(buckets: Vec<u64>) -> Self {
        let counts = vec![0; buckets.len() + 1];
        Self { buckets, counts }
    }

    pub fn record(&mut self, duration: Duration) {
        let micros = duration.as_micros() as u64;
        let bucket_idx = self
            .buckets
            .iter()
            .position(|&b| micros <= b)
            .unwrap_or(self.buckets.len());
        self.counts[bucket_idx] += 1;
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Approximate percentile, reported as the upper bound of its bucket.
    pub fn percentile(&self, p: f64) -> Duration {
        let total: u64 = self.counts.iter().sum();
        if total == 0 {
            return Duration::ZERO;
        }

        let target = (total as f64 * p / 100.0).ceil() as u64;
        let mut cumulative = 0u64;

        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                let micros = if i < self.buckets.len() {
                    self.buckets[i]
                } else {
                    self.buckets.last().copied().unwrap_or(0) * 10
                };
                return Duration::from_micros(micros);
            }
        }

        Duration::ZERO
    }

    pub fn p50(&self) -> Duration {
        self.percentile(50.0)
    }

    pub fn p99(&self) -> Duration {
        self.percentile(99.0)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        // 1ms, 10ms, 100ms, 1s, 10s, 60s
        Self::with_buckets(vec![
            1_000,
            10_000,
            100_000,
            1_000_000,
            10_000_000,
            60_000_000,
        ])
    }
}

/// A snapshot of all metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub counters: Vec<(Counter, u64)>,
    pub handlers: HashMap<String, HandlerMetrics>,
    pub operations: HashMap<String, OperationMetrics>,
    pub uptime: Duration,
}

impl MetricsSnapshot {
    pub fn counter(&self, counter: Counter) -> u64 {
        self.counters
            .iter()
            .find(|(c, _)| *c == counter)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }

    /// Format as a human-readable report.
    pub fn format_report(&self) -> String {
        let mut report = String::new();

        report.push_str("=== Metrics Report ===\n\n");
        report.push_str(&format!("Uptime: {:.2?}\n\n", self.uptime));

        report.push_str("Counters:\n");
        for (counter, value) in &self.counters {
            report.push_str(&format!("  {}: {}\n", counter, value));
        }
        report.push('\n');

        if !self.handlers.is_empty() {
            report.push_str("Handler Metrics:\n");
            let mut names: Vec<_> = self.handlers.keys().collect();
            names.sort();
            for name in names {
                let metrics = &self.handlers[name];
                report.push_str(&format!(
                    "  {}: {} calls, {:.1}% success, avg {:.2?}\n",
                    name,
                    metrics.invocations,
                    metrics.success_rate() * 100.0,
                    metrics.avg_duration()
                ));
            }
            report.push('\n');
        }

        if !self.operations.is_empty() {
            report.push_str("Operation Metrics:\n");
            let mut names: Vec<_> = self.operations.keys().collect();
            names.sort();
            for name in names {
                let metrics = &self.operations[name];
                report.push_str(&format!(
                    "  {}: {} ops, avg {:.2?}, p99 {:.2?}\n",
                    name,
                    metrics.count,
                    metrics.avg_duration(),
                    metrics.histogram.p99()
                ));
            }
        }

        report
    }
}

/// Increment a counter on the global registry.
pub fn incr(counter: Counter) {
    GLOBAL_METRICS.incr(counter);
}

/// Record an operation to global metrics.
pub fn record_operation(name: &str, duration: Duration) {
    GLOBAL_METRICS.record_operation(name, duration);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = Metrics::new();
        metrics.incr(Counter::Spawns);
        metrics.incr(Counter::Spawns);
        metrics.add(Counter::Sigkills, 3);

        assert_eq!(metrics.count(Counter::Spawns), 2);
        assert_eq!(metrics.count(Counter::Sigkills), 3);
        assert_eq!(metrics.count(Counter::Sigterms), 0);
    }

    #[test]
    fn test_handler_metrics() {
        let mut metrics = HandlerMetrics::new();
        metrics.record(Duration::from_millis(100), true);
        metrics.record(Duration::from_millis(200), true);
        metrics.record(Duration::from_millis(50), false);

        assert_eq!(metrics.invocations, 3);
        assert_eq!(metrics.failures, 1);
        assert!((metrics.success_rate() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_operation_metrics() {
        let mut metrics = OperationMetrics::new();
        metrics.record(Duration::from_millis(10));
        metrics.record(Duration::from_millis(20));
        metrics.record(Duration::from_millis(30));

        assert_eq!(metrics.count, 3);
        assert_eq!(metrics.avg_duration(), Duration::from_millis(20));
    }

    #[test]
    fn test_histogram_percentiles() {
        let mut hist = Histogram::default();
        for _ in 0..100 {
            hist.record(Duration::from_micros(500));
        }
        assert_eq!(hist.p50(), Duration::from_millis(1));
        assert_eq!(hist.p99(), Duration::from_millis(1));
    }

    #[test]
    fn test_snapshot_and_report() {
        let metrics = Metrics::new();
        metrics.incr(Counter::DieMarkers);
        metrics.record_handler("command", "inject", Duration::from_millis(3), true);
        metrics.record_operation("reconcile", Duration::from_millis(4));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.counter(Counter::DieMarkers), 1);
        let report = snapshot.format_report();
        assert!(report.contains("die_markers: 1"));
        assert!(report.contains("command:inject"));
        assert!(report.contains("reconcile"));
    }

    #[test]
    fn test_metrics_reset() {
        let metrics = Metrics::new();
        metrics.incr(Counter::Spawns);
        metrics.record_operation("x", Duration::from_millis(1));
        metrics.reset();

        assert_eq!(metrics.count(Counter::Spawns), 0);
        assert!(metrics.operation_metrics("x").is_none());
    }
}
