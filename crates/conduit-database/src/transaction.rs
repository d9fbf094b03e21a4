//! Scoped transactions over a pooled connection.

use conduit_common_log::spans::transaction_span;
use futures::future::BoxFuture;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, warn, Instrument, Span};

use crate::connection::{Connection, Connector};
use crate::error::{DbError, DbResult};
use crate::pool::{ConnectionPool, PooledConnection};

/// Lifecycle of a [`TransactionScope`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    Active,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    Closed,
}

impl ScopeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::RollingBack => "rolling back",
            Self::RolledBack => "rolled back",
            Self::Closed => "closed",
        }
    }

    /// Dropped mid-flight: the server-side transaction may still be open.
    fn is_unresolved(&self) -> bool {
        matches!(self, Self::Active | Self::Committing | Self::RollingBack)
    }
}

impl fmt::Display for ScopeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work on one pooled connection.
///
/// At most one commit or rollback is issued. The connection goes back to
/// the pool exactly once, on [`close`](Self::close) or drop. A scope that
/// is closed while its transaction is unresolved cannot roll back
/// synchronously, so its connection is discarded instead; the server
/// aborts the transaction when the session ends.
pub struct TransactionScope<C: Connector> {
    conn: Option<PooledConnection<C>>,
    state: ScopeState,
    span: Span,
}

impl<C: Connector> TransactionScope<C> {
    /// Acquire a connection and issue `BEGIN`.
    ///
    /// If `BEGIN` fails the connection is discarded and the error returned.
    pub async fn begin(pool: &ConnectionPool<C>, timeout: Duration) -> DbResult<Self> {
        let mut conn = pool.acquire(timeout).await?;
        let span = transaction_span(conn.id());

        if let Err(e) = conn.begin().instrument(span.clone()).await {
            conn.discard();
            span.record("error", tracing::field::display(&e));
            warn!(parent: &span, error = %e, "BEGIN failed; discarding connection");
            return Err(e);
        }

        debug!(parent: &span, "transaction started");
        Ok(Self {
            conn: Some(conn),
            state: ScopeState::Active,
            span,
        })
    }

    pub fn state(&self) -> ScopeState {
        self.state
    }

    fn ensure_active(&self) -> DbResult<()> {
        if self.state == ScopeState::Active && self.conn.is_some() {
            Ok(())
        } else {
            Err(DbError::InvalidScopeState { state: self.state })
        }
    }

    /// The borrowed connection, while the scope is active.
    pub fn connection(&mut self) -> DbResult<&mut C::Connection> {
        self.ensure_active()?;
        match self.conn.as_mut() {
            Some(conn) => Ok(&mut **conn),
            None => Err(DbError::InvalidScopeState { state: self.state }),
        }
    }

    /// Run a statement inside the transaction.
    pub async fn execute(&mut self, sql: &str) -> DbResult<u64> {
        let span = self.span.clone();
        self.connection()?.execute(sql).instrument(span).await
    }

    /// Commit. A failed `COMMIT` is followed by a rollback attempt and the
    /// commit error is returned.
    pub async fn commit(&mut self) -> DbResult<()> {
        self.ensure_active()?;
        self.state = ScopeState::Committing;

        let span = self.span.clone();
        let result = match self.conn.as_mut() {
            Some(conn) => conn.commit().instrument(span.clone()).await,
            None => Err(DbError::InvalidScopeState { state: self.state }),
        };

        match result {
            Ok(()) => {
                self.state = ScopeState::Committed;
                self.record_outcome("committed");
                if let Some(conn) = &self.conn {
                    conn.metrics().commits.inc();
                }
                debug!(parent: &span, "transaction committed");
                Ok(())
            }
            Err(e) => {
                warn!(parent: &span, error = %e, "COMMIT failed; rolling back");
                if let Err(rollback_err) = self.rollback_unchecked().await {
                    error!(parent: &span, error = %rollback_err, "rollback after failed COMMIT also failed");
                }
                span.record("error", tracing::field::display(&e));
                Err(e)
            }
        }
    }

    /// Roll back.
    pub async fn rollback(&mut self) -> DbResult<()> {
        self.ensure_active()?;
        self.rollback_unchecked().await
    }

    async fn rollback_unchecked(&mut self) -> DbResult<()> {
        self.state = ScopeState::RollingBack;

        let span = self.span.clone();
        let Some(conn) = self.conn.as_mut() else {
            return Err(DbError::InvalidScopeState { state: self.state });
        };

        let result = conn.rollback().instrument(span.clone()).await;
        if let Err(e) = &result {
            warn!(parent: &span, error = %e, "ROLLBACK failed; discarding connection");
            conn.discard();
        } else {
            conn.metrics().rollbacks.inc();
            debug!(parent: &span, "transaction rolled back");
        }

        self.state = ScopeState::RolledBack;
        self.record_outcome("rolled_back");
        result
    }

    fn record_outcome(&self, outcome: &'static str) {
        self.span.record("outcome", outcome);
    }

    /// Release the connection. Idempotent.
    pub fn close(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };

        if self.state.is_unresolved() {
            warn!(
                parent: &self.span,
                state = %self.state,
                "transaction scope closed before commit or rollback; discarding connection"
            );
            conn.discard();
            self.record_outcome("abandoned");
        }

        self.state = ScopeState::Closed;
        drop(conn);
    }
}

impl<C: Connector> fmt::Debug for TransactionScope<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionScope")
            .field("state", &self.state)
            .field("conn", &self.conn)
            .finish()
    }
}

impl<C: Connector> Drop for TransactionScope<C> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Run `unit_of_work` in a transaction on a pooled connection.
///
/// `Ok` commits and `Err` rolls back; the unit of work's error is returned
/// even if the rollback also fails. The connection is returned to the pool
/// on every path, including panics and cancellation.
///
/// ```ignore
/// let id: i64 = with_transaction(&pool, |conn| {
///     Box::pin(async move {
///         conn.execute("UPDATE articles SET favorited = true WHERE id = 1").await?;
///         Ok::<_, DbError>(1)
///     })
/// })
/// .await?;
/// ```
pub async fn with_transaction<C, T, E, F>(pool: &ConnectionPool<C>, unit_of_work: F) -> Result<T, E>
where
    C: Connector,
    E: From<DbError>,
    F: for<'c> FnOnce(&'c mut C::Connection) -> BoxFuture<'c, Result<T, E>>,
{
    let mut scope = pool.begin().await?;

    let result = unit_of_work(scope.connection()?).await;

    match result {
        Ok(value) => {
            scope.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = scope.rollback().await {
                error!(error = %rollback_err, "rollback after failed unit of work failed");
            }
            Err(e)
        }
    }
}
