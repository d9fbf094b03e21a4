//! Bounded connection pool with an overflow allowance.
//!
//! Up to `pool_size` connections are kept open while idle; under load the
//! pool opens up to `max_overflow` more, which are closed again when they
//! are released into a full idle set. Callers beyond that capacity wait
//! until a connection is released, the pool closes, or their deadline
//! passes.
//!
//! All bookkeeping lives under a single mutex that is never held across an
//! `.await`. A slot is reserved under the lock before the slow connect and
//! handed back if the connect fails or the acquiring future is dropped.

use conduit_common_async::{deadline, join_all};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::connection::{Connection, Connector};
use crate::error::{DbError, DbResult};
use crate::factory::ConnectionFactory;
use crate::metrics::PoolMetrics;
use crate::transaction::TransactionScope;

/// Sizing and timing knobs taken from [`ConnectionConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    pub pool_size: u32,
    pub max_overflow: u32,
    pub pool_timeout: Duration,
    pub recycle_age: Duration,
}

impl PoolOptions {
    pub fn capacity(&self) -> u32 {
        self.pool_size.saturating_add(self.max_overflow)
    }
}

impl From<&ConnectionConfig> for PoolOptions {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            pool_size: config.pool_size,
            max_overflow: config.max_overflow,
            pool_timeout: config.pool_timeout,
            recycle_age: config.recycle_age,
        }
    }
}

/// Consistent snapshot of the pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Configured base size.
    pub size: u32,
    pub max_overflow: u32,
    pub checked_out: u32,
    /// Open connections above `size`.
    pub overflow: u32,
    pub idle: u32,
    /// Open connections, idle or checked out, including in-flight opens.
    pub open: u32,
    pub closed: bool,
}

impl PoolStatus {
    pub fn capacity(&self) -> u32 {
        self.size.saturating_add(self.max_overflow)
    }

    /// Whether an acquisition right now would not have to wait.
    pub fn has_free_slot(&self) -> bool {
        !self.closed && (self.idle > 0 || self.checked_out < self.capacity())
    }
}

struct Tracked<T> {
    conn: T,
    id: u64,
    created_at: Instant,
}

struct PoolState<T> {
    idle: VecDeque<Tracked<T>>,
    checked_out: u32,
    open: u32,
    closed: bool,
}

struct PoolInner<C: Connector> {
    factory: ConnectionFactory<C>,
    options: PoolOptions,
    state: Mutex<PoolState<C::Connection>>,
    released: Notify,
    next_id: AtomicU64,
    metrics: PoolMetrics,
}

impl<C: Connector> PoolInner<C> {
    fn status_of(&self, state: &PoolState<C::Connection>) -> PoolStatus {
        PoolStatus {
            size: self.options.pool_size,
            max_overflow: self.options.max_overflow,
            checked_out: state.checked_out,
            overflow: state.open.saturating_sub(self.options.pool_size),
            idle: state.idle.len() as u32,
            open: state.open,
            closed: state.closed,
        }
    }

    fn publish(&self, state: &PoolState<C::Connection>) {
        let status = self.status_of(state);
        self.metrics.checked_out.set(status.checked_out.into());
        self.metrics.idle.set(status.idle.into());
        self.metrics.overflow.set(status.overflow.into());
    }

    fn is_stale(&self, entry: &Tracked<C::Connection>) -> bool {
        let max_age = self.options.recycle_age;
        !max_age.is_zero() && entry.created_at.elapsed() >= max_age
    }

    /// Return a checked-out connection. Never blocks.
    fn release(&self, entry: Tracked<C::Connection>, discard: bool) {
        let closing = {
            let mut state = self.state.lock();
            state.checked_out = state.checked_out.saturating_sub(1);

            let keep = !state.closed
                && !discard
                && state.idle.len() < self.options.pool_size as usize;
            let closing = if keep {
                state.idle.push_back(entry);
                None
            } else {
                state.open = state.open.saturating_sub(1);
                Some(entry)
            };

            self.publish(&state);
            closing
        };

        if let Some(entry) = closing {
            debug!(conn = entry.id, discard, "closing released connection");
            self.spawn_close(entry.conn);
        }
        self.released.notify_waiters();
    }

    /// Give back a slot reserved by an acquisition that did not complete.
    fn unreserve(&self) {
        {
            let mut state = self.state.lock();
            state.checked_out = state.checked_out.saturating_sub(1);
            state.open = state.open.saturating_sub(1);
            self.publish(&state);
        }
        self.released.notify_waiters();
    }

    fn spawn_close(&self, conn: C::Connection) {
        self.metrics.connections_closed.inc();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = conn.close().await {
                        debug!(error = %e, "error while closing connection");
                    }
                });
            }
            // No runtime left: dropping the session closes its socket.
            Err(_) => drop(conn),
        }
    }
}

/// A slot counted in `open` and `checked_out` that has no connection yet.
struct Reservation<'a, C: Connector> {
    inner: &'a PoolInner<C>,
    armed: bool,
}

impl<'a, C: Connector> Reservation<'a, C> {
    fn new(inner: &'a PoolInner<C>) -> Self {
        Self { inner, armed: true }
    }

    fn fulfil(mut self) {
        self.armed = false;
    }
}

impl<C: Connector> Drop for Reservation<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.unreserve();
        }
    }
}

enum Checkout<T> {
    Idle(Tracked<T>),
    Stale(Tracked<T>),
    Open,
    Wait,
}

/// Cheaply cloneable handle to a shared pool.
pub struct ConnectionPool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connector> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("options", &self.inner.options)
            .field("status", &self.status())
            .finish()
    }
}

impl<C: Connector> ConnectionPool<C> {
    /// Create an empty pool. Connections are opened on demand.
    pub fn new(connector: C, config: Arc<ConnectionConfig>, metrics: PoolMetrics) -> Self {
        let options = PoolOptions::from(config.as_ref());
        let factory = ConnectionFactory::new(connector, config, metrics.clone());

        Self {
            inner: Arc::new(PoolInner {
                factory,
                options,
                state: Mutex::new(PoolState {
                    idle: VecDeque::with_capacity(options.pool_size as usize),
                    checked_out: 0,
                    open: 0,
                    closed: false,
                }),
                released: Notify::new(),
                next_id: AtomicU64::new(0),
                metrics,
            }),
        }
    }

    pub fn config(&self) -> &Arc<ConnectionConfig> {
        self.inner.factory.config()
    }

    pub fn options(&self) -> PoolOptions {
        self.inner.options
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.inner.metrics
    }

    /// Acquire with the configured `pool_timeout`.
    pub async fn get(&self) -> DbResult<PooledConnection<C>> {
        self.acquire(self.inner.options.pool_timeout).await
    }

    /// Start a transaction scope with the configured `pool_timeout`.
    pub async fn begin(&self) -> DbResult<TransactionScope<C>> {
        TransactionScope::begin(self, self.inner.options.pool_timeout).await
    }

    /// Acquire a connection, waiting at most `timeout` for one to free up.
    ///
    /// Idle connections are reused first unless older than the recycle age,
    /// in which case they are closed and replaced. Otherwise a new
    /// connection is opened while capacity remains. Time spent opening a
    /// connection is bounded by the factory's retry policy, not `timeout`.
    pub async fn acquire(&self, timeout: Duration) -> DbResult<PooledConnection<C>> {
        let start = Instant::now();
        let deadline = deadline(start, timeout);

        loop {
            let released = self.inner.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let checkout = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(DbError::PoolClosed);
                }

                let checkout = if let Some(entry) = state.idle.pop_front() {
                    state.checked_out += 1;
                    if self.inner.is_stale(&entry) {
                        Checkout::Stale(entry)
                    } else {
                        Checkout::Idle(entry)
                    }
                } else if state.checked_out < self.inner.options.capacity() {
                    state.checked_out += 1;
                    state.open += 1;
                    Checkout::Open
                } else {
                    Checkout::Wait
                };

                self.inner.publish(&state);
                checkout
            };

            match checkout {
                Checkout::Idle(entry) => return Ok(self.hand_out(entry, start)),
                Checkout::Stale(entry) => {
                    let reservation = Reservation::new(&self.inner);
                    debug!(
                        conn = entry.id,
                        age_secs = entry.created_at.elapsed().as_secs(),
                        "recycling stale connection"
                    );
                    self.inner.metrics.connections_recycled.inc();
                    self.inner.spawn_close(entry.conn);
                    return self.open_reserved(reservation, start).await;
                }
                Checkout::Open => {
                    let reservation = Reservation::new(&self.inner);
                    return self.open_reserved(reservation, start).await;
                }
                Checkout::Wait => {
                    if tokio::time::timeout_at(deadline, released).await.is_err() {
                        self.inner.metrics.acquire_timeouts.inc();
                        let status = self.status();
                        warn!(
                            timeout_ms = timeout.as_millis() as u64,
                            checked_out = status.checked_out,
                            capacity = status.capacity(),
                            "timed out waiting for a pooled connection"
                        );
                        return Err(DbError::PoolExhausted { timeout });
                    }
                }
            }
        }
    }

    async fn open_reserved(
        &self,
        reservation: Reservation<'_, C>,
        start: Instant,
    ) -> DbResult<PooledConnection<C>> {
        let conn = self.inner.factory.open().await?;

        if self.is_closed() {
            // Reservation drop hands the slot back.
            self.inner.spawn_close(conn);
            return Err(DbError::PoolClosed);
        }
        reservation.fulfil();

        let entry = Tracked {
            conn,
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            created_at: Instant::now(),
        };
        debug!(conn = entry.id, "opened pooled connection");
        Ok(self.hand_out(entry, start))
    }

    fn hand_out(&self, entry: Tracked<C::Connection>, start: Instant) -> PooledConnection<C> {
        self.inner.metrics.acquisitions.inc();
        self.inner
            .metrics
            .acquire_wait
            .observe(start.elapsed().as_secs_f64());

        PooledConnection {
            pool: self.inner.clone(),
            entry: Some(entry),
            discard: false,
        }
    }

    /// Configured base size.
    pub fn size(&self) -> u32 {
        self.inner.options.pool_size
    }

    pub fn checked_out(&self) -> u32 {
        self.inner.state.lock().checked_out
    }

    /// Open connections above the base size.
    pub fn overflow(&self) -> u32 {
        let state = self.inner.state.lock();
        state.open.saturating_sub(self.inner.options.pool_size)
    }

    pub fn idle(&self) -> u32 {
        self.inner.state.lock().idle.len() as u32
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        self.inner.status_of(&state)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Shut the pool down.
    ///
    /// New acquisitions and current waiters fail with
    /// [`DbError::PoolClosed`], pending connect backoff is cancelled and
    /// idle connections are closed now. Checked-out connections are closed
    /// as they are released. Idempotent.
    pub async fn close(&self) {
        let (idle, in_flight, first) = {
            let mut state = self.inner.state.lock();
            let first = !state.closed;
            state.closed = true;

            let idle: Vec<_> = state.idle.drain(..).collect();
            state.open = state.open.saturating_sub(idle.len() as u32);
            self.inner.publish(&state);
            (idle, state.checked_out, first)
        };

        self.inner.factory.cancel();
        self.inner.released.notify_waiters();

        if first {
            info!(idle = idle.len(), in_flight, "connection pool closed");
        }

        self.inner
            .metrics
            .connections_closed
            .inc_by(idle.len() as u64);
        let results = join_all(idle.into_iter().map(|entry| entry.conn.close())).await;
        for err in results.into_iter().filter_map(Result::err) {
            debug!(error = %err, "error while closing idle connection");
        }
    }

    /// Wait until every checked-out connection has been released.
    ///
    /// Returns `false` if some are still out after `grace`.
    pub async fn wait_for_release(&self, grace: Duration) -> bool {
        let deadline = deadline(Instant::now(), grace);

        loop {
            let released = self.inner.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if self.checked_out() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return self.checked_out() == 0;
            }
        }
    }
}

/// A connection borrowed from the pool.
///
/// Dereferences to the driver connection. Dropping the guard returns the
/// connection, or closes it if it was marked with
/// [`discard`](Self::discard).
pub struct PooledConnection<C: Connector> {
    pool: Arc<PoolInner<C>>,
    entry: Option<Tracked<C::Connection>>,
    discard: bool,
}

impl<C: Connector> PooledConnection<C> {
    fn entry(&self) -> &Tracked<C::Connection> {
        self.entry
            .as_ref()
            .expect("BUG: PooledConnection used after return to pool")
    }

    /// Pool-assigned id, unique for the pool's lifetime.
    pub fn id(&self) -> u64 {
        self.entry().id
    }

    pub fn age(&self) -> Duration {
        self.entry().created_at.elapsed()
    }

    /// Close the connection on release instead of returning it.
    pub fn discard(&mut self) {
        self.discard = true;
    }

    pub fn is_discarded(&self) -> bool {
        self.discard
    }

    pub(crate) fn metrics(&self) -> &PoolMetrics {
        &self.pool.metrics
    }
}

impl<C: Connector> Deref for PooledConnection<C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        &self.entry().conn
    }
}

impl<C: Connector> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self
            .entry
            .as_mut()
            .expect("BUG: PooledConnection used after return to pool")
            .conn
    }
}

impl<C: Connector> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.entry.as_ref().map(|e| e.id))
            .field("discard", &self.discard)
            .finish()
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.pool.release(entry, self.discard);
        }
    }
}
