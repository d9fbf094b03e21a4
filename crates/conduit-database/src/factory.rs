//! Opening physical connections with retry.

use conduit_common_async::{retry, with_timeout, BackoffPolicy, CancellationToken, RetryError};
use conduit_common_log::spans::{connection_span, record_error};
use std::sync::Arc;
use tracing::{debug, error, warn, Instrument, Span};

use crate::config::ConnectionConfig;
use crate::connection::Connector;
use crate::error::{DbError, DbResult};
use crate::metrics::PoolMetrics;

/// Opens connections through a [`Connector`], retrying transient failures
/// with exponential backoff.
///
/// Backoff sleeps are cancelled by [`cancel`](Self::cancel), which turns any
/// pending [`open`](Self::open) into [`DbError::PoolClosed`].
pub struct ConnectionFactory<C: Connector> {
    connector: C,
    config: Arc<ConnectionConfig>,
    policy: BackoffPolicy,
    cancel: CancellationToken,
    metrics: PoolMetrics,
}

impl<C: Connector> ConnectionFactory<C> {
    pub fn new(connector: C, config: Arc<ConnectionConfig>, metrics: PoolMetrics) -> Self {
        let policy = BackoffPolicy::new(config.retry_base_delay, config.connect_retries);
        Self {
            connector,
            config,
            policy,
            cancel: CancellationToken::new(),
            metrics,
        }
    }

    pub fn config(&self) -> &Arc<ConnectionConfig> {
        &self.config
    }

    /// Abort pending and future backoff sleeps.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Open one connection.
    ///
    /// Each attempt is bounded by `connect_timeout`; an elapsed attempt is
    /// treated as transient. Fatal errors are returned as-is after the first
    /// attempt, exhausted retries as [`DbError::Connection`].
    pub async fn open(&self) -> DbResult<C::Connection> {
        let span = connection_span(&self.config.host, self.config.port);
        self.open_attempts().instrument(span).await
    }

    async fn open_attempts(&self) -> DbResult<C::Connection> {
        let max_attempts = self.policy.attempts();

        let outcome = retry(&self.policy, &self.cancel, |attempt| async move {
            if attempt > 1 {
                self.metrics.connect_retries.inc();
            }

            let result = match with_timeout(
                self.config.connect_timeout,
                self.connector.connect(&self.config),
            )
            .await
            {
                Ok(result) => result,
                Err(elapsed) => Err(DbError::transient(elapsed)),
            };

            if let Err(e) = &result {
                warn!(
                    attempt,
                    max_attempts,
                    transient = e.is_transient(),
                    error = %e,
                    "database connection attempt failed"
                );
            }
            result
        })
        .await;

        match outcome {
            Ok(conn) => {
                self.metrics.connections_opened.inc();
                debug!(db = %self.config.database, "database connection established");
                Ok(conn)
            }
            Err(RetryError::Fatal(e)) => {
                record_error(&e);
                error!(error = %e, "database connection failed with a non-retryable error");
                Err(e)
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                Span::current().record("attempts", attempts);
                record_error(&last);
                error!(attempts, error = %last, "giving up on database connection");
                Err(DbError::Connection {
                    attempts,
                    source: Box::new(last),
                })
            }
            Err(RetryError::Cancelled { attempts, .. }) => {
                debug!(attempts, "connection attempt cancelled by pool shutdown");
                Err(DbError::PoolClosed)
            }
        }
    }
}
