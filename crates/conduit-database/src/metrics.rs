//! Pool metrics.

use conduit_common_metrics::{names, Counter, Gauge, Histogram, MetricsRegistry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Handles to every metric the pool updates, registered in one registry.
#[derive(Clone)]
pub struct PoolMetrics {
    registry: Arc<MetricsRegistry>,
    pub(crate) acquisitions: Counter,
    pub(crate) acquire_timeouts: Counter,
    pub(crate) acquire_wait: Histogram,
    pub(crate) connections_opened: Counter,
    pub(crate) connections_closed: Counter,
    pub(crate) connections_recycled: Counter,
    pub(crate) connect_retries: Counter,
    pub(crate) commits: Counter,
    pub(crate) rollbacks: Counter,
    pub(crate) checked_out: Gauge,
    pub(crate) idle: Gauge,
    pub(crate) overflow: Gauge,
}

impl PoolMetrics {
    pub fn new(registry: Arc<MetricsRegistry>) -> Self {
        for (name, help) in [
            (names::DB_ACQUISITIONS, "Connections handed out by the pool"),
            (names::DB_ACQUIRE_TIMEOUTS, "Acquisitions that gave up waiting"),
            (names::DB_ACQUIRE_WAIT, "Time spent waiting for a connection"),
            (names::DB_CONNECTIONS_OPENED, "Physical connections opened"),
            (names::DB_CONNECTIONS_CLOSED, "Physical connections closed"),
            (names::DB_CONNECTIONS_RECYCLED, "Connections replaced for exceeding the recycle age"),
            (names::DB_CONNECT_RETRIES, "Connection attempts after a transient failure"),
            (names::DB_COMMITS, "Transactions committed"),
            (names::DB_ROLLBACKS, "Transactions rolled back"),
            (names::DB_CHECKED_OUT, "Connections currently checked out"),
            (names::DB_IDLE, "Connections idle in the pool"),
            (names::DB_OVERFLOW, "Open connections above the base pool size"),
        ] {
            registry.describe(name, help);
        }

        Self {
            acquisitions: registry.counter(names::DB_ACQUISITIONS),
            acquire_timeouts: registry.counter(names::DB_ACQUIRE_TIMEOUTS),
            acquire_wait: registry.histogram(names::DB_ACQUIRE_WAIT),
            connections_opened: registry.counter(names::DB_CONNECTIONS_OPENED),
            connections_closed: registry.counter(names::DB_CONNECTIONS_CLOSED),
            connections_recycled: registry.counter(names::DB_CONNECTIONS_RECYCLED),
            connect_retries: registry.counter(names::DB_CONNECT_RETRIES),
            commits: registry.counter(names::DB_COMMITS),
            rollbacks: registry.counter(names::DB_ROLLBACKS),
            checked_out: registry.gauge(names::DB_CHECKED_OUT),
            idle: registry.gauge(names::DB_IDLE),
            overflow: registry.gauge(names::DB_OVERFLOW),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }

    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            acquisitions: self.acquisitions.get(),
            acquire_timeouts: self.acquire_timeouts.get(),
            connections_opened: self.connections_opened.get(),
            connections_closed: self.connections_closed.get(),
            connections_recycled: self.connections_recycled.get(),
            connect_retries: self.connect_retries.get(),
            commits: self.commits.get(),
            rollbacks: self.rollbacks.get(),
            checked_out: self.checked_out.get(),
            idle: self.idle.get(),
            overflow: self.overflow.get(),
        }
    }
}

impl Default for PoolMetrics {
    fn default() -> Self {
        Self::new(Arc::new(MetricsRegistry::new()))
    }
}

/// Point-in-time copy of the pool counters and gauges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolMetricsSnapshot {
    pub acquisitions: u64,
    pub acquire_timeouts: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub connections_recycled: u64,
    pub connect_retries: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub checked_out: u64,
    pub idle: u64,
    pub overflow: u64,
}

/// Read-only view over a pool's metrics. Never fails.
#[derive(Clone)]
pub struct MetricsReporter {
    metrics: PoolMetrics,
}

impl MetricsReporter {
    pub fn new(metrics: PoolMetrics) -> Self {
        Self { metrics }
    }

    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Prometheus text exposition of every metric in the registry.
    pub fn export_prometheus(&self) -> String {
        self.metrics.registry().export_prometheus()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_updates() {
        let metrics = PoolMetrics::default();
        metrics.acquisitions.inc_by(3);
        metrics.commits.inc();
        metrics.checked_out.set(2);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.acquisitions, 3);
        assert_eq!(snapshot.commits, 1);
        assert_eq!(snapshot.checked_out, 2);
        assert_eq!(snapshot.rollbacks, 0);
    }

    #[test]
    fn test_export_includes_help_and_values() {
        let metrics = PoolMetrics::default();
        metrics.rollbacks.inc();

        let reporter = MetricsReporter::new(metrics);
        let export = reporter.export_prometheus();

        assert!(export.contains("# HELP conduit_db_rollbacks_total Transactions rolled back"));
        assert!(export.contains("conduit_db_rollbacks_total 1"));
        assert!(export.contains("# TYPE conduit_db_acquire_wait_seconds histogram"));
    }

    #[test]
    fn test_separate_pools_do_not_share_counters() {
        let a = PoolMetrics::default();
        let b = PoolMetrics::default();
        a.acquisitions.inc();
        assert_eq!(b.snapshot().acquisitions, 0);
    }
}
