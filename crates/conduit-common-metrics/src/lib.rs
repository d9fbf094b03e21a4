//! Metrics collection for Conduit.
//!
//! Counters, gauges and histograms backed by shared atomics, grouped in a
//! [`MetricsRegistry`] that renders the Prometheus text format. Registries
//! are plain values: each owner (typically one database service) keeps its
//! own, so tests and multiple pools in one process never share counters.
//!
//! ```rust
//! use conduit_common_metrics::MetricsRegistry;
//!
//! let registry = MetricsRegistry::new();
//! let counter = registry.counter("test_counter");
//! counter.inc_by(5);
//!
//! assert!(registry.export_prometheus().contains("test_counter 5"));
//! ```

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Metrics registry.
#[derive(Default)]
pub struct MetricsRegistry {
    counters: RwLock<BTreeMap<&'static str, Counter>>,
    gauges: RwLock<BTreeMap<&'static str, Gauge>>,
    histograms: RwLock<BTreeMap<&'static str, Histogram>>,
    help: RwLock<BTreeMap<&'static str, &'static str>>,
}

impl MetricsRegistry {
    /// Create a new registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a `# HELP` line to a metric name.
    pub fn describe(&self, name: &'static str, help: &'static str) {
        self.help.write().insert(name, help);
    }

    /// Get or create a counter.
    pub fn counter(&self, name: &'static str) -> Counter {
        if let Some(counter) = self.counters.read().get(name) {
            return counter.clone();
        }
        self.counters
            .write()
            .entry(name)
            .or_insert_with(|| Counter::new(name))
            .clone()
    }

    /// Get or create a gauge.
    pub fn gauge(&self, name: &'static str) -> Gauge {
        if let Some(gauge) = self.gauges.read().get(name) {
            return gauge.clone();
        }
        self.gauges
            .write()
            .entry(name)
            .or_insert_with(|| Gauge::new(name))
            .clone()
    }

    /// Get or create a histogram with the default buckets.
    pub fn histogram(&self, name: &'static str) -> Histogram {
        if let Some(histogram) = self.histograms.read().get(name) {
            return histogram.clone();
        }
        self.histograms
            .write()
            .entry(name)
            .or_insert_with(|| Histogram::new(name))
            .clone()
    }

    /// Export metrics in Prometheus format, sorted by name within each type.
    pub fn export_prometheus(&self) -> String {
        let help = self.help.read();
        let mut output = String::new();

        let header = |output: &mut String, name: &str, kind: &str| {
            if let Some(text) = help.get(name) {
                let _ = writeln!(output, "# HELP {} {}", name, text);
            }
            let _ = writeln!(output, "# TYPE {} {}", name, kind);
        };

        for (name, counter) in self.counters.read().iter() {
            header(&mut output, name, "counter");
            let _ = writeln!(output, "{} {}", name, counter.get());
        }

        for (name, gauge) in self.gauges.read().iter() {
            header(&mut output, name, "gauge");
            let _ = writeln!(output, "{} {}", name, gauge.get());
        }

        for (name, histogram) in self.histograms.read().iter() {
            header(&mut output, name, "histogram");
            let (count, sum) = histogram.get_count_and_sum();
            for (le, bucket) in histogram.get_buckets() {
                let _ = writeln!(output, "{}_bucket{{le=\"{}\"}} {}", name, le, bucket);
            }
            let _ = writeln!(output, "{}_bucket{{le=\"+Inf\"}} {}", name, count);
            let _ = writeln!(output, "{}_sum {}", name, sum);
            let _ = writeln!(output, "{}_count {}", name, count);
        }

        output
    }
}

/// A counter metric (monotonically increasing).
#[derive(Clone, Debug)]
pub struct Counter {
    name: &'static str,
    value: Arc<AtomicU64>,
}

impl Counter {
    /// Create a new counter.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            value: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Increment by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by a value.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A gauge metric (can go up and down, never below zero).
#[derive(Clone, Debug)]
pub struct Gauge {
    name: &'static str,
    value: Arc<AtomicU64>,
}

impl Gauge {
    /// Create a new gauge.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            value: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Set the value.
    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    /// Increment by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement by 1, saturating at zero.
    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A histogram metric (tracks distribution of values).
///
/// The sum is kept in micro-units so it fits an atomic integer.
#[derive(Clone, Debug)]
pub struct Histogram {
    name: &'static str,
    count: Arc<AtomicU64>,
    sum_micros: Arc<AtomicU64>,
    buckets: Arc<[(f64, AtomicU64)]>,
}

impl Histogram {
    /// Default bucket boundaries, in seconds.
    pub const DEFAULT_BUCKETS: &'static [f64] =
        &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

    /// Create a new histogram.
    pub fn new(name: &'static str) -> Self {
        Self::with_buckets(name, Self::DEFAULT_BUCKETS)
    }

    /// Create a histogram with custom bucket upper bounds (ascending).
    pub fn with_buckets(name: &'static str, bounds: &[f64]) -> Self {
        Self {
            name,
            count: Arc::new(AtomicU64::new(0)),
            sum_micros: Arc::new(AtomicU64::new(0)),
            buckets: bounds
                .iter()
                .map(|&upper_bound| (upper_bound, AtomicU64::new(0)))
                .collect(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Observe a value. Negative values are recorded as zero.
    pub fn observe(&self, value: f64) {
        let value = value.max(0.0);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((value * 1_000_000.0) as u64, Ordering::Relaxed);

        for (upper_bound, count) in self.buckets.iter() {
            if value <= *upper_bound {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Get count and sum.
    pub fn get_count_and_sum(&self) -> (u64, f64) {
        let count = self.count.load(Ordering::Relaxed);
        let sum = self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        (count, sum)
    }

    /// Get cumulative bucket counts.
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        self.buckets
            .iter()
            .map(|(upper_bound, count)| (*upper_bound, count.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Metric names used by the database layer.
pub mod names {
    pub const DB_ACQUISITIONS: &str = "conduit_db_acquisitions_total";
    pub const DB_ACQUIRE_TIMEOUTS: &str = "conduit_db_acquire_timeouts_total";
    pub const DB_ACQUIRE_WAIT: &str = "conduit_db_acquire_wait_seconds";
    pub const DB_CONNECTIONS_OPENED: &str = "conduit_db_connections_opened_total";
    pub const DB_CONNECTIONS_CLOSED: &str = "conduit_db_connections_closed_total";
    pub const DB_CONNECTIONS_RECYCLED: &str = "conduit_db_connections_recycled_total";
    pub const DB_CONNECT_RETRIES: &str = "conduit_db_connect_retries_total";
    pub const DB_COMMITS: &str = "conduit_db_commits_total";
    pub const DB_ROLLBACKS: &str = "conduit_db_rollbacks_total";
    pub const DB_CHECKED_OUT: &str = "conduit_db_checked_out";
    pub const DB_IDLE: &str = "conduit_db_idle";
    pub const DB_OVERFLOW: &str = "conduit_db_overflow";
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new("test");
        assert_eq!(counter.get(), 0);
        counter.inc();
        assert_eq!(counter.get(), 1);
        counter.inc_by(5);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn test_gauge_saturates_at_zero() {
        let gauge = Gauge::new("test");
        gauge.set(1);
        gauge.dec();
        gauge.dec();
        assert_eq!(gauge.get(), 0);
        gauge.inc();
        assert_eq!(gauge.get(), 1);
    }

    #[test]
    fn test_histogram() {
        let histogram = Histogram::new("test_histogram");

        histogram.observe(0.5);
        histogram.observe(1.5);
        histogram.observe(2.0);

        let (count, sum) = histogram.get_count_and_sum();
        assert_eq!(count, 3);
        assert!((sum - 4.0).abs() < 1e-6);

        let buckets = histogram.get_buckets();
        let le_1 = buckets.iter().find(|(le, _)| *le == 1.0).unwrap();
        assert_eq!(le_1.1, 1);
        let le_2_5 = buckets.iter().find(|(le, _)| *le == 2.5).unwrap();
        assert_eq!(le_2_5.1, 3);
    }

    #[test]
    fn test_registry_returns_shared_handles() {
        let registry = MetricsRegistry::new();
        registry.counter("shared").inc();
        registry.counter("shared").inc();
        assert_eq!(registry.counter("shared").get(), 2);
    }

    #[test]
    fn test_registries_are_isolated() {
        let a = MetricsRegistry::new();
        let b = MetricsRegistry::new();
        a.counter("isolated").inc();
        assert_eq!(b.counter("isolated").get(), 0);
    }

    #[test]
    fn test_prometheus_format() {
        let registry = MetricsRegistry::new();
        registry.describe("http_requests_total", "Requests served");

        registry.counter("http_requests_total").inc_by(100);
        registry.gauge("memory_usage").set(1024);
        let histogram = registry.histogram("response_time");
        histogram.observe(0.1);
        histogram.observe(0.5);

        let export = registry.export_prometheus();
        let lines: Vec<&str> = export.lines().collect();

        assert!(lines.contains(&"# HELP http_requests_total Requests served"));
        assert!(lines.contains(&"# TYPE http_requests_total counter"));
        assert!(lines.contains(&"http_requests_total 100"));
        assert!(lines.contains(&"# TYPE memory_usage gauge"));
        assert!(lines.contains(&"memory_usage 1024"));
        assert!(lines.contains(&"# TYPE response_time histogram"));
        assert!(lines.contains(&"response_time_count 2"));
        assert!(lines.contains(&"response_time_bucket{le=\"+Inf\"} 2"));
        assert!(lines.contains(&"response_time_bucket{le=\"0.1\"} 1"));
        assert!(lines.iter().any(|line| line.starts_with("response_time_sum")));
    }

    proptest! {
        #[test]
        fn prop_buckets_are_cumulative(values in proptest::collection::vec(0.0f64..60.0, 0..50)) {
            let histogram = Histogram::new("prop");
            for v in &values {
                histogram.observe(*v);
            }

            let buckets = histogram.get_buckets();
            for pair in buckets.windows(2) {
                prop_assert!(pair[0].1 <= pair[1].1);
            }
            let (count, _) = histogram.get_count_and_sum();
            prop_assert_eq!(count, values.len() as u64);
            prop_assert!(buckets.last().map_or(0, |b| b.1) <= count);
        }
    }
}
