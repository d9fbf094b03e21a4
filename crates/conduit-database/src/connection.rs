//! Seams between the pool and the database driver.

use async_trait::async_trait;

use crate::config::ConnectionConfig;
use crate::error::DbResult;

/// A live, exclusively owned database session.
///
/// Driver errors must already be classified into
/// [`DbError::Transient`](crate::DbError::Transient) or
/// [`DbError::Fatal`](crate::DbError::Fatal).
#[async_trait]
pub trait Connection: Send + 'static {
    /// Run a statement that returns no rows; yields rows affected.
    async fn execute(&mut self, sql: &str) -> DbResult<u64>;

    /// Liveness query (`SELECT 1`).
    async fn ping(&mut self) -> DbResult<()>;

    /// Server version string (`SELECT version()`).
    async fn server_version(&mut self) -> DbResult<String>;

    /// Terminate the session gracefully.
    async fn close(self) -> DbResult<()>;

    async fn begin(&mut self) -> DbResult<()> {
        self.execute("BEGIN").await.map(drop)
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.execute("COMMIT").await.map(drop)
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.execute("ROLLBACK").await.map(drop)
    }
}

/// Opens physical connections. One call is one attempt; retry lives in
/// [`ConnectionFactory`](crate::ConnectionFactory).
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    async fn connect(&self, config: &ConnectionConfig) -> DbResult<Self::Connection>;
}
