//! Span helpers for pool and transaction operations.
//!
//! Every span declares an empty `error` field so [`record_error`] has
//! somewhere to write.

use tracing::{field, info_span, Span};

/// Span covering a pool-level operation (acquire, close, health probe).
pub fn pool_span(database: &str, operation: &str) -> Span {
    info_span!("pool", db = %database, op = %operation, error = field::Empty)
}

/// Span covering one transaction scope.
pub fn transaction_span(connection_id: u64) -> Span {
    info_span!(
        "transaction",
        conn = connection_id,
        outcome = field::Empty,
        error = field::Empty
    )
}

/// Span covering the establishment of a physical connection.
pub fn connection_span(host: &str, port: u16) -> Span {
    info_span!(
        "connect",
        host = %host,
        port = port,
        attempts = field::Empty,
        error = field::Empty
    )
}

/// Record an error on the current span.
pub fn record_error(error: &dyn std::error::Error) {
    Span::current().record("error", field::display(error));
}
