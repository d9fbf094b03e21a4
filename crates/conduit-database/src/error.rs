//! Database layer errors.

use conduit_common_async::Retryable;
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;
use crate::transaction::ScopeState;

/// Boxed driver-level cause.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("invalid database configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("could not connect to the database after {attempts} attempt(s): {source}")]
    Connection { attempts: u32, source: BoxError },

    #[error("no pooled connection became available within {timeout:?}")]
    PoolExhausted { timeout: Duration },

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("transient database error: {0}")]
    Transient(#[source] BoxError),

    #[error("database error: {0}")]
    Fatal(#[source] BoxError),

    #[error("transaction scope is {state}, expected active")]
    InvalidScopeState { state: ScopeState },
}

impl DbError {
    pub fn transient(cause: impl Into<BoxError>) -> Self {
        Self::Transient(cause.into())
    }

    pub fn fatal(cause: impl Into<BoxError>) -> Self {
        Self::Fatal(cause.into())
    }

    /// Whether retrying the same operation could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl Retryable for DbError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(DbError::transient("connection reset").is_retryable());
        assert!(!DbError::fatal("password authentication failed").is_retryable());
        assert!(!DbError::PoolClosed.is_retryable());
        assert!(!DbError::PoolExhausted {
            timeout: Duration::from_secs(1)
        }
        .is_retryable());
    }

    #[test]
    fn test_connection_error_keeps_cause() {
        let err = DbError::Connection {
            attempts: 3,
            source: Box::new(DbError::transient("connection refused")),
        };

        assert_eq!(
            err.to_string(),
            "could not connect to the database after 3 attempt(s): \
             transient database error: connection refused"
        );
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("connection refused"));
    }

    #[test]
    fn test_scope_state_message() {
        let err = DbError::InvalidScopeState {
            state: ScopeState::Committed,
        };
        assert_eq!(err.to_string(), "transaction scope is committed, expected active");
    }
}
