//! Service object owning the pool for the lifetime of the application.

use conduit_common_metrics::MetricsRegistry;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::ConnectionConfig;
use crate::connection::Connector;
use crate::error::{DbError, DbResult};
use crate::health::{HealthProbe, HealthReport};
use crate::metrics::{MetricsReporter, PoolMetrics};
use crate::pool::ConnectionPool;
use crate::postgres::PgConnector;
use crate::transaction::{with_transaction, TransactionScope};

/// Database handle held by the application.
///
/// Cheap to clone; clones share the pool. Connections are opened lazily
/// on first use, so construction never touches the network.
pub struct DatabaseService<C: Connector = PgConnector> {
    pool: ConnectionPool<C>,
    probe: HealthProbe<C>,
    registry: Arc<MetricsRegistry>,
}

impl DatabaseService<PgConnector> {
    /// Service over PostgreSQL.
    pub fn init(config: ConnectionConfig) -> Self {
        Self::with_connector(config, PgConnector::new())
    }

    /// Resolve configuration from the process environment, then
    /// [`init`](Self::init).
    pub fn from_env() -> DbResult<Self> {
        let config = ConnectionConfig::from_env()?;
        Ok(Self::init(config))
    }
}

impl<C: Connector> DatabaseService<C> {
    pub fn with_connector(config: ConnectionConfig, connector: C) -> Self {
        Self::with_registry(config, connector, Arc::new(MetricsRegistry::new()))
    }

    /// Register pool metrics in an existing registry.
    pub fn with_registry(
        config: ConnectionConfig,
        connector: C,
        registry: Arc<MetricsRegistry>,
    ) -> Self {
        info!(
            url = %config.redacted_url(),
            mode = %config.mode,
            pool_size = config.pool_size,
            max_overflow = config.max_overflow,
            "database service initialised"
        );

        let metrics = PoolMetrics::new(registry.clone());
        let pool = ConnectionPool::new(connector, Arc::new(config), metrics);
        let probe = HealthProbe::new(pool.clone());

        Self {
            pool,
            probe,
            registry,
        }
    }

    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    pub fn config(&self) -> &ConnectionConfig {
        self.pool.config()
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }

    /// Open a transaction scope with the configured pool timeout.
    pub async fn begin(&self) -> DbResult<TransactionScope<C>> {
        self.pool.begin().await
    }

    /// See [`with_transaction`](crate::with_transaction).
    pub async fn with_transaction<T, E, F>(&self, unit_of_work: F) -> Result<T, E>
    where
        E: From<DbError>,
        F: for<'c> FnOnce(&'c mut C::Connection) -> BoxFuture<'c, Result<T, E>>,
    {
        with_transaction(&self.pool, unit_of_work).await
    }

    pub async fn check_health(&self) -> bool {
        self.probe.check_health().await
    }

    pub async fn get_info(&self) -> HealthReport {
        self.probe.get_info().await
    }

    pub fn metrics(&self) -> MetricsReporter {
        MetricsReporter::new(self.pool.metrics().clone())
    }

    /// Close the pool and wait up to `grace` for checked-out connections to
    /// come back. Returns `false` if some were still out when `grace`
    /// elapsed; those are closed whenever their holders release them.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.pool.close().await;

        let drained = self.pool.wait_for_release(grace).await;
        if drained {
            info!("database service shut down");
        } else {
            warn!(
                checked_out = self.pool.checked_out(),
                grace = ?grace,
                "database service shut down with connections still checked out"
            );
        }
        drained
    }
}

impl<C: Connector> Clone for DatabaseService<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            probe: self.probe.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl<C: Connector> fmt::Debug for DatabaseService<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseService")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::health::HealthStatus;
    use crate::testing::{settle, test_config, MockConnector};
    use conduit_common_metrics::names;

    fn service(connector: MockConnector) -> DatabaseService<MockConnector> {
        DatabaseService::with_connector(test_config(), connector)
    }

    #[tokio::test(start_paused = true)]
    async fn test_construction_is_lazy() {
        let connector = MockConnector::new();
        let service = service(connector.clone());

        assert_eq!(connector.connect_attempts(), 0);
        assert_eq!(service.pool().status().open, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transaction_and_metrics() {
        let connector = MockConnector::new();
        let service = service(connector.clone());

        let rows = service
            .with_transaction(|conn| {
                Box::pin(async move { conn.execute("DELETE FROM follows").await })
            })
            .await
            .unwrap();
        assert_eq!(rows, 0);

        let snapshot = service.metrics().snapshot();
        assert_eq!(snapshot.commits, 1);
        assert_eq!(snapshot.acquisitions, 1);
        assert_eq!(snapshot.idle, 1);

        let text = service.metrics().export_prometheus();
        assert!(text.contains(&format!("{} 1", names::DB_COMMITS)));
        assert!(text.contains(&format!("# TYPE {} counter", names::DB_ROLLBACKS)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_through_service() {
        let service = service(MockConnector::new());

        assert!(service.check_health().await);
        let report = service.get_info().await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.database_name, service.config().database);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_registry() {
        let registry = Arc::new(MetricsRegistry::new());
        let service =
            DatabaseService::with_registry(test_config(), MockConnector::new(), registry.clone());

        service.check_health().await;
        assert!(registry
            .export_prometheus()
            .contains(&format!("{} 1", names::DB_ROLLBACKS)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_release() {
        let connector = MockConnector::new();
        let service = service(connector.clone());
        let held = service.pool().get().await.unwrap();

        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            drop(held);
        });

        assert!(service.shutdown(Duration::from_secs(5)).await);
        releaser.await.unwrap();
        settle().await;

        assert_eq!(connector.closed(), 1);
        assert!(matches!(service.begin().await, Err(DbError::PoolClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_grace_elapses() {
        let service = service(MockConnector::new());
        let _held = service.pool().get().await.unwrap();

        assert!(!service.shutdown(Duration::from_secs(1)).await);
        assert!(!service.check_health().await);
    }

    #[test]
    fn test_init_does_not_connect() {
        let service = DatabaseService::init(test_config());
        assert_eq!(service.pool().checked_out(), 0);
        assert_eq!(service.config().user, "conduit");
    }
}
