//! In-memory connector for exercising the pool without a server.
//!
//! Enabled for this crate's own tests and, through the `test-utils`
//! feature, for downstream test suites.

use async_trait::async_trait;
use conduit_common_config::RunMode;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ConnectionConfig;
use crate::connection::{Connection, Connector};
use crate::error::{DbError, DbResult};
use crate::metrics::PoolMetrics;
use crate::pool::ConnectionPool;

pub const MOCK_VERSION: &str = "PostgreSQL 16.2 (mock)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Transient,
    Fatal,
}

impl Failure {
    fn error(self, what: &str) -> DbError {
        match self {
            Self::Transient => DbError::transient(format!("{}: connection reset by peer", what)),
            Self::Fatal => DbError::fatal(format!("{}: permission denied", what)),
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    connects: AtomicU32,
    opened: AtomicU32,
    closed: AtomicU32,
    hang: AtomicBool,
    refuse: Mutex<Option<Failure>>,
    connect_failures: Mutex<VecDeque<Failure>>,
    statement_failures: Mutex<HashMap<String, Failure>>,
    statements: Mutex<Vec<(u32, String)>>,
}

/// Scripted connector. Clones share state, so a test keeps one handle
/// while the pool owns another.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` connect attempts.
    pub fn fail_connects(&self, count: usize, transient: bool) {
        let failure = if transient { Failure::Transient } else { Failure::Fatal };
        self.state
            .connect_failures
            .lock()
            .extend(std::iter::repeat(failure).take(count));
    }

    /// Fail every connect attempt until [`accept`](Self::accept) is called.
    pub fn refuse(&self, transient: bool) {
        let failure = if transient { Failure::Transient } else { Failure::Fatal };
        *self.state.refuse.lock() = Some(failure);
    }

    pub fn accept(&self) {
        *self.state.refuse.lock() = None;
    }

    /// Make connect attempts never complete.
    pub fn hang_connects(&self, hang: bool) {
        self.state.hang.store(hang, Ordering::SeqCst);
    }

    /// Fail every execution of `sql` (matched exactly).
    pub fn fail_statement(&self, sql: &str, transient: bool) {
        let failure = if transient { Failure::Transient } else { Failure::Fatal };
        self.state
            .statement_failures
            .lock()
            .insert(sql.to_string(), failure);
    }

    pub fn clear_statement_failures(&self) {
        self.state.statement_failures.lock().clear();
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> u32 {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> u32 {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Every statement executed so far, across connections.
    pub fn statements(&self) -> Vec<String> {
        self.state
            .statements
            .lock()
            .iter()
            .map(|(_, sql)| sql.clone())
            .collect()
    }

    /// Statements executed on one connection, by [`MockConnection::id`].
    pub fn statements_on(&self, connection: u32) -> Vec<String> {
        self.state
            .statements
            .lock()
            .iter()
            .filter(|(id, _)| *id == connection)
            .map(|(_, sql)| sql.clone())
            .collect()
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Connection = MockConnection;

    async fn connect(&self, _config: &ConnectionConfig) -> DbResult<MockConnection> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        if self.state.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let refused = *self.state.refuse.lock();
        let failure = match refused {
            Some(failure) => Some(failure),
            None => self.state.connect_failures.lock().pop_front(),
        };
        if let Some(failure) = failure {
            return Err(failure.error("connect"));
        }

        let id = self.state.opened.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MockConnection {
            id,
            state: self.state.clone(),
        })
    }
}

#[derive(Debug)]
pub struct MockConnection {
    id: u32,
    state: Arc<MockState>,
}

impl MockConnection {
    /// 1-based order in which the connector opened this connection.
    pub fn id(&self) -> u32 {
        self.id
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn execute(&mut self, sql: &str) -> DbResult<u64> {
        self.state.statements.lock().push((self.id, sql.to_string()));

        let failure = self.state.statement_failures.lock().get(sql).copied();
        match failure {
            Some(failure) => Err(failure.error(sql)),
            None => Ok(0),
        }
    }

    async fn ping(&mut self) -> DbResult<()> {
        self.execute("SELECT 1").await.map(drop)
    }

    async fn server_version(&mut self) -> DbResult<String> {
        self.execute("SELECT version()").await?;
        Ok(MOCK_VERSION.to_string())
    }

    async fn close(self) -> DbResult<()> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Testing-mode config: pool 2 + 1 overflow, 2s timeout, 1s retry base,
/// 5s connect timeout, 1h recycle age.
pub fn test_config() -> ConnectionConfig {
    test_config_builder()
        .build()
        .unwrap_or_else(|e| panic!("test config is valid: {}", e))
}

pub fn test_config_builder() -> crate::config::ConnectionConfigBuilder {
    ConnectionConfig::builder()
        .mode(RunMode::Testing)
        .user("conduit")
        .password("conduit")
        .database("conduit_test")
        .pool_size(2)
        .max_overflow(1)
        .pool_timeout(Duration::from_secs(2))
        .connect_timeout(Duration::from_secs(5))
        .retry_base_delay(Duration::from_secs(1))
}

pub fn test_pool(connector: MockConnector, config: ConnectionConfig) -> ConnectionPool<MockConnector> {
    ConnectionPool::new(connector, Arc::new(config), PoolMetrics::default())
}

/// Let spawned close tasks run to completion.
pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}
