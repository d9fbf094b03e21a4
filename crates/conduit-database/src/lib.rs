//! Managed PostgreSQL connectivity for Conduit.
//!
//! The layer sits between request handlers and the database server:
//!
//! - [`ConnectionConfig`] resolves connection settings once from the
//!   environment.
//! - [`ConnectionFactory`] opens physical connections, retrying transient
//!   failures with exponential backoff.
//! - [`ConnectionPool`] bounds the number of live connections and hands them
//!   out as [`PooledConnection`] guards that return themselves on drop.
//! - [`TransactionScope`] and [`with_transaction`] run one unit of work
//!   inside a transaction that is always committed or rolled back.
//! - [`HealthProbe`] and [`MetricsReporter`] report on the pool without ever
//!   failing.
//! - [`DatabaseService`] ties these together behind an explicit
//!   `init`/`shutdown` lifecycle.
//!
//! ```no_run
//! use conduit_database::{Connection, DatabaseService, DbError};
//!
//! # async fn run() -> Result<(), DbError> {
//! let service = DatabaseService::from_env()?;
//!
//! service
//!     .with_transaction(|conn| {
//!         Box::pin(async move {
//!             conn.execute("UPDATE users SET bio = '' WHERE bio IS NULL").await?;
//!             Ok::<_, DbError>(())
//!         })
//!     })
//!     .await?;
//!
//! service.shutdown(std::time::Duration::from_secs(5)).await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod factory;
pub mod health;
pub mod metrics;
pub mod pool;
pub mod postgres;
pub mod service;
pub mod transaction;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::{ConfigError, ConnectionConfig, ConnectionConfigBuilder, Password, SslMode};
pub use connection::{Connection, Connector};
pub use error::{BoxError, DbError, DbResult};
pub use factory::ConnectionFactory;
pub use health::{HealthProbe, HealthReport, HealthStatus, PoolSnapshot};
pub use metrics::{MetricsReporter, PoolMetrics, PoolMetricsSnapshot};
pub use pool::{ConnectionPool, PoolOptions, PoolStatus, PooledConnection};
pub use postgres::{classify, PgConnector, PgSession};
pub use service::DatabaseService;
pub use transaction::{with_transaction, ScopeState, TransactionScope};
