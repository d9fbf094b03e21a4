//! Database health monitoring.

use chrono::{DateTime, Utc};
use conduit_common_async::with_timeout;
use conduit_common_log::spans::pool_span;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, Instrument};

use crate::connection::{Connection, Connector};
use crate::error::DbResult;
use crate::pool::{ConnectionPool, PoolStatus};
use crate::transaction::TransactionScope;

/// Overall probe outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Reachable, but running on overflow connections or out of free slots.
    Degraded,
    Error,
}

/// Pool counters as reported to orchestrators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub size: u32,
    pub checked_out: u32,
    pub overflow: u32,
    pub idle: u32,
}

impl From<PoolStatus> for PoolSnapshot {
    fn from(status: PoolStatus) -> Self {
        Self {
            size: status.size,
            checked_out: status.checked_out,
            overflow: status.overflow,
            idle: status.idle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub version: Option<String>,
    pub pool: PoolSnapshot,
    pub database_name: String,
    pub host: String,
    /// Set when `status` is `error`.
    pub message: Option<String>,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Liveness probe over a pool. Never fails and never panics.
pub struct HealthProbe<C: Connector> {
    pool: ConnectionPool<C>,
    timeout: Duration,
}

impl<C: Connector> Clone for HealthProbe<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            timeout: self.timeout,
        }
    }
}

impl<C: Connector> fmt::Debug for HealthProbe<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthProbe")
            .field("pool", &self.pool)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<C: Connector> HealthProbe<C> {
    /// Probe with the pool's configured timeout.
    pub fn new(pool: ConnectionPool<C>) -> Self {
        let timeout = pool.options().pool_timeout;
        Self { pool, timeout }
    }

    /// Bound on the whole probe, acquisition included.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `SELECT 1` in a rolled-back transaction.
    pub async fn check_health(&self) -> bool {
        let span = pool_span(&self.pool.config().database, "health");
        let outcome = with_timeout(self.timeout, self.probe(false))
            .instrument(span.clone())
            .await;

        match outcome {
            Ok(Ok(_)) => {
                debug!(parent: &span, "database health check passed");
                true
            }
            Ok(Err(e)) => {
                error!(parent: &span, error = %e, "database health check failed");
                false
            }
            Err(e) => {
                error!(parent: &span, error = %e, "database health check timed out");
                false
            }
        }
    }

    /// Full report: server version, pool counters and probe latency.
    pub async fn get_info(&self) -> HealthReport {
        let span = pool_span(&self.pool.config().database, "info");
        let start = Instant::now();
        let outcome = with_timeout(self.timeout, self.probe(true))
            .instrument(span.clone())
            .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        // Taken after the probe's own connection has been released.
        let status = self.pool.status();
        let config = self.pool.config();

        let (health, version, message) = match outcome {
            Ok(Ok(version)) => {
                let health = if status.overflow > 0 || !status.has_free_slot() {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                };
                debug!(parent: &span, latency_ms, status = ?health, "database info collected");
                (health, version, None)
            }
            Ok(Err(e)) => {
                error!(parent: &span, error = %e, "failed to collect database info");
                (HealthStatus::Error, None, Some(e.to_string()))
            }
            Err(e) => {
                error!(parent: &span, error = %e, "database info probe timed out");
                (HealthStatus::Error, None, Some(e.to_string()))
            }
        };

        HealthReport {
            status: health,
            version,
            pool: status.into(),
            database_name: config.database.clone(),
            host: config.host.clone(),
            message,
            latency_ms,
            timestamp: Utc::now(),
        }
    }

    async fn probe(&self, with_version: bool) -> DbResult<Option<String>> {
        let mut scope = TransactionScope::begin(&self.pool, self.timeout).await?;

        let conn = scope.connection()?;
        let version = if with_version {
            Some(conn.server_version().await?)
        } else {
            conn.ping().await?;
            None
        };

        scope.rollback().await?;
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_config, test_pool, MockConnector, MOCK_VERSION};

    #[tokio::test(start_paused = true)]
    async fn test_healthy_probe_rolls_back() {
        let connector = MockConnector::new();
        let probe = HealthProbe::new(test_pool(connector.clone(), test_config()));

        assert!(probe.check_health().await);
        assert_eq!(connector.statements(), ["BEGIN", "SELECT 1", "ROLLBACK"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_database() {
        let connector = MockConnector::new();
        connector.refuse(true);
        let probe = HealthProbe::new(test_pool(connector, test_config()))
            .with_timeout(Duration::from_secs(60));

        assert!(!probe.check_health().await);

        let report = probe.get_info().await;
        assert_eq!(report.status, HealthStatus::Error);
        assert!(report.message.as_deref().is_some_and(|m| !m.is_empty()));
        assert_eq!(report.version, None);
        assert_eq!(report.pool.size, 2);
        assert_eq!(report.pool.checked_out, 0);
        assert_eq!(report.database_name, "conduit_test");
        assert_eq!(report.host, "localhost");
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_reports_error() {
        let connector = MockConnector::new();
        connector.hang_connects(true);
        let probe = HealthProbe::new(test_pool(connector, test_config()))
            .with_timeout(Duration::from_secs(1));

        assert!(!probe.check_health().await);
        let report = probe.get_info().await;
        assert_eq!(report.status, HealthStatus::Error);
        assert!(report.message.unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_info_reports_version_and_pool() {
        let pool = test_pool(MockConnector::new(), test_config());
        let probe = HealthProbe::new(pool.clone());

        let report = probe.get_info().await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.version.as_deref(), Some(MOCK_VERSION));
        assert_eq!(report.message, None);
        assert_eq!(
            report.pool,
            PoolSnapshot {
                size: 2,
                checked_out: 0,
                overflow: 0,
                idle: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_when_running_on_overflow() {
        let pool = test_pool(MockConnector::new(), test_config());
        let _a = pool.get().await.unwrap();
        let _b = pool.get().await.unwrap();
        let probe = HealthProbe::new(pool.clone());

        let report = probe.get_info().await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.pool.checked_out, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_pool_is_unhealthy() {
        let pool = test_pool(MockConnector::new(), test_config());
        let _held: Vec<_> = futures::future::try_join_all((0..3).map(|_| pool.get()))
            .await
            .unwrap();
        let probe = HealthProbe::new(pool.clone()).with_timeout(Duration::from_millis(100));

        assert!(!probe.check_health().await);
        let report = probe.get_info().await;
        assert_eq!(report.status, HealthStatus::Error);
        assert_eq!(report.pool.checked_out, 3);
        assert_eq!(report.pool.overflow, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_query_discards_probe_connection() {
        let connector = MockConnector::new();
        connector.fail_statement("SELECT 1", true);
        let pool = test_pool(connector.clone(), test_config());
        let probe = HealthProbe::new(pool.clone());

        assert!(!probe.check_health().await);
        assert_eq!(pool.checked_out(), 0);
        assert_eq!(pool.idle(), 0);

        connector.clear_statement_failures();
        assert!(probe.check_health().await);
        assert_eq!(connector.opened(), 2);
        assert_eq!(connector.statements_on(2), ["BEGIN", "SELECT 1", "ROLLBACK"]);
    }

    #[test]
    fn test_report_serialization() {
        let report = HealthReport {
            status: HealthStatus::Degraded,
            version: Some("PostgreSQL 16.2".to_string()),
            pool: PoolSnapshot {
                size: 10,
                checked_out: 12,
                overflow: 2,
                idle: 0,
            },
            database_name: "app".to_string(),
            host: "db".to_string(),
            message: None,
            latency_ms: 3,
            timestamp: Utc::now(),
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["pool"]["overflow"], 2);
        assert_eq!(json["database_name"], "app");

        let back: HealthReport = serde_json::from_value(json).unwrap();
        assert_eq!(back, report);
    }
}
