//! Bounded connection pool with health-checked checkout.
//!
//! The pool tracks two sets under one mutex: idle connections it owns, and
//! the ids of connections currently owned by a caller (or being created for
//! one). `idle + active <= max` holds whenever the lock is released.
//! Probing, connecting and closing happen outside the lock.
//!
//! A checked-out [`PooledConnection`] that is dropped without being released
//! (its caller was cancelled mid-query, say) frees its slot on drop and its
//! handle is closed in the background.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::DbConfig;
use crate::connection::DbConnection;
use crate::error::{DbError, Result};
use crate::factory::ConnectionFactory;
use crate::health;
use crate::metrics;
use crate::types::{RowSet, SqlParam};

/// An open handle as the pool stores it.
struct Slot {
    id: u64,
    created_at: Instant,
    handle: Box<dyn DbConnection>,
}

impl Slot {
    async fn shutdown(self) {
        if let Err(e) = self.handle.close().await {
            debug!(connection_id = self.id, error = %e, "Error while closing connection");
        }
    }
}

/// A connection checked out of the pool.
///
/// Hand it back with [`ConnectionPool::release`] when it is still usable, or
/// [`ConnectionPool::close`] when it is presumed broken. Dropping it instead
/// frees the slot and closes the handle.
pub struct PooledConnection {
    id: u64,
    created_at: Instant,
    handle: Option<Box<dyn DbConnection>>,
    shared: Weak<Shared>,
}

impl PooledConnection {
    fn checked_out(slot: Slot, shared: &Arc<Shared>) -> Self {
        Self {
            id: slot.id,
            created_at: slot.created_at,
            handle: Some(slot.handle),
            shared: Arc::downgrade(shared),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub async fn execute(&mut self, query: &str, params: &[SqlParam]) -> Result<RowSet> {
        match self.handle.as_mut() {
            Some(handle) => handle.execute(query, params).await,
            None => Err(DbError::connection_lost("connection already returned")),
        }
    }

    async fn probe(&mut self, timeout: Duration) -> Result<()> {
        match self.handle.as_mut() {
            Some(handle) => health::probe(handle.as_mut(), timeout).await,
            None => Err(DbError::connection_lost("connection already returned")),
        }
    }

    /// Takes the handle back out; the pool settles the bookkeeping.
    fn into_slot(mut self) -> Option<Slot> {
        self.handle.take().map(|handle| Slot {
            id: self.id,
            created_at: self.created_at,
            handle,
        })
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        if let Some(shared) = self.shared.upgrade() {
            let mut state = shared.state.lock();
            if state.active.remove(&self.id) {
                state.publish();
            }
        }
        debug!(connection_id = self.id, "Checked-out connection dropped; closing it");
        metrics::record_eviction("dropped");

        let id = self.id;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = handle.close().await {
                    debug!(connection_id = id, error = %e, "Error while closing dropped connection");
                }
            });
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("age", &self.created_at.elapsed())
            .finish()
    }
}

/// Pool occupancy, for health endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub active: usize,
    pub idle: usize,
    pub max: usize,
    pub total: usize,
    pub connection_attempts: u64,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<Slot>,
    active: HashSet<u64>,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.active.len()
    }

    fn publish(&self) {
        metrics::record_pool_stats(self.total(), self.idle.len(), self.active.len());
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<PoolState>,
    closed: AtomicBool,
}

/// An active-set entry held while a connection is being opened. Frees the
/// entry on drop unless it was turned into a [`PooledConnection`].
struct Reservation {
    id: u64,
    shared: Weak<Shared>,
}

impl Reservation {
    fn fulfil(mut self, handle: Box<dyn DbConnection>) -> PooledConnection {
        PooledConnection {
            id: self.id,
            created_at: Instant::now(),
            handle: Some(handle),
            shared: std::mem::take(&mut self.shared),
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            let mut state = shared.state.lock();
            if state.active.remove(&self.id) {
                state.publish();
            }
        }
    }
}

enum Checkout {
    Idle(PooledConnection),
    Create(Reservation),
}

/// Bounded pool of database connections.
pub struct ConnectionPool {
    factory: ConnectionFactory,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    min_connections: usize,
    max_connections: usize,
    probe_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(factory: ConnectionFactory, config: &DbConfig) -> Self {
        Self {
            factory,
            shared: Arc::new(Shared::default()),
            next_id: AtomicU64::new(1),
            min_connections: config.min_connections.min(config.max_connections),
            max_connections: config.max_connections,
            probe_timeout: config.probe_timeout(),
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    fn reserve(&self, state: &mut PoolState) -> Reservation {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        state.active.insert(id);
        state.publish();
        Reservation {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Opens up to `min_connections` idle connections.
    ///
    /// Failed connections are skipped; returns how many were added.
    #[instrument(skip(self), fields(target = %self.factory.target()))]
    pub async fn warm_up(&self) -> usize {
        let created = self.fill_to_min().await;
        info!(
            created,
            min_connections = self.min_connections,
            max_connections = self.max_connections,
            "Connection pool warmed up"
        );
        created
    }

    /// Checks out a connection.
    ///
    /// An idle connection is probed first and replaced when the probe fails.
    /// With no idle connection a new one is opened, with the factory's full
    /// retry, if the bound allows; otherwise this fails fast with
    /// [`DbError::PoolExhausted`].
    pub async fn get_connection(&self) -> Result<PooledConnection> {
        self.checkout(true).await
    }

    /// Like [`get_connection`](Self::get_connection), but a new connection
    /// gets a single connect attempt. For callers that run their own retry
    /// loop.
    pub(crate) async fn get_connection_once(&self) -> Result<PooledConnection> {
        self.checkout(false).await
    }

    async fn checkout(&self, retry_connect: bool) -> Result<PooledConnection> {
        if self.is_closed() {
            return Err(DbError::PoolClosed);
        }

        let started = Instant::now();
        loop {
            let checkout = {
                let mut state = self.state_lock();
                if let Some(slot) = state.idle.pop_back() {
                    state.active.insert(slot.id);
                    Checkout::Idle(PooledConnection::checked_out(slot, &self.shared))
                } else if state.total() < self.max_connections {
                    Checkout::Create(self.reserve(&mut state))
                } else {
                    let (active, idle) = (state.active.len(), state.idle.len());
                    warn!(active, idle, max = self.max_connections, "Connection pool exhausted");
                    return Err(DbError::PoolExhausted {
                        active,
                        idle,
                        max: self.max_connections,
                    });
                }
            };

            match checkout {
                Checkout::Idle(mut conn) => match conn.probe(self.probe_timeout).await {
                    Ok(()) => {
                        metrics::record_acquire_duration(started.elapsed());
                        self.state_lock().publish();
                        return Ok(conn);
                    }
                    Err(e) => {
                        debug!(connection_id = conn.id, error = %e, "Evicting idle connection that failed its probe");
                        metrics::record_eviction("checkout_probe");
                        self.close(conn).await;
                    }
                },
                Checkout::Create(reservation) => {
                    let created = if retry_connect {
                        self.factory.create().await
                    } else {
                        self.factory.create_once().await
                    };
                    let id = reservation.id;
                    // An error drops the reservation, which frees the slot.
                    let conn = match created {
                        Ok(handle) => reservation.fulfil(handle),
                        Err(e) => return Err(e),
                    };
                    if self.state_lock().active.contains(&id) {
                        metrics::record_acquire_duration(started.elapsed());
                        debug!(connection_id = id, "Opened new pooled connection");
                        return Ok(conn);
                    }
                    // The pool was reset while this connection was being opened.
                    if let Some(slot) = conn.into_slot() {
                        slot.shutdown().await;
                    }
                    if self.is_closed() {
                        return Err(DbError::PoolClosed);
                    }
                }
            }
        }
    }

    fn state_lock(&self) -> parking_lot::MutexGuard<'_, PoolState> {
        self.shared.state.lock()
    }

    /// Returns a checked-out connection to the idle set.
    ///
    /// A connection the pool no longer tracks (checked out before a reset or
    /// shutdown) is closed instead, leaving the counters untouched.
    pub async fn release(&self, conn: PooledConnection) {
        let Some(slot) = conn.into_slot() else {
            return;
        };
        let stale = {
            let mut state = self.state_lock();
            let tracked = state.active.remove(&slot.id);
            let stale = if tracked && !self.is_closed() {
                state.idle.push_back(slot);
                None
            } else {
                Some(slot)
            };
            state.publish();
            stale
        };

        if let Some(slot) = stale {
            debug!(connection_id = slot.id, "Closing connection released after pool reset");
            slot.shutdown().await;
        }
    }

    /// Closes a checked-out connection and frees its slot.
    pub async fn close(&self, conn: PooledConnection) {
        let Some(slot) = conn.into_slot() else {
            return;
        };
        {
            let mut state = self.state_lock();
            state.active.remove(&slot.id);
            state.publish();
        }
        slot.shutdown().await;
    }

    /// Closes every idle connection, forgets checked-out ones, and warms up
    /// again. Forgotten connections are closed when they are released.
    #[instrument(skip(self))]
    pub async fn reset_pool(&self) -> usize {
        let drained: Vec<Slot> = {
            let mut state = self.state_lock();
            let forgotten = state.active.len();
            state.active.clear();
            let drained = state.idle.drain(..).collect::<Vec<_>>();
            state.publish();
            warn!(
                closed_idle = drained.len(),
                forgotten_active = forgotten,
                "Resetting connection pool"
            );
            drained
        };
        for slot in drained {
            slot.shutdown().await;
        }
        self.warm_up().await
    }

    /// Closes all idle connections and refuses further checkouts.
    pub async fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::Release);
        let drained: Vec<Slot> = {
            let mut state = self.state_lock();
            let drained = state.idle.drain(..).collect::<Vec<_>>();
            state.publish();
            drained
        };
        let count = drained.len();
        for slot in drained {
            slot.shutdown().await;
        }
        info!(closed = count, "Connection pool shut down");
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state_lock();
        PoolStats {
            active: state.active.len(),
            idle: state.idle.len(),
            max: self.max_connections,
            total: state.total(),
            connection_attempts: self.factory.connection_attempts(),
        }
    }

    /// Probes each connection that was idle when the sweep started, one at a
    /// time, closing the ones that fail. Returns how many were pruned.
    pub(crate) async fn sweep_idle(&self) -> usize {
        let budget = self.state_lock().idle.len();
        let mut pruned = 0;

        for _ in 0..budget {
            let mut conn = {
                let mut state = self.state_lock();
                match state.idle.pop_front() {
                    Some(slot) => {
                        state.active.insert(slot.id);
                        PooledConnection::checked_out(slot, &self.shared)
                    }
                    None => break,
                }
            };

            match conn.probe(self.probe_timeout).await {
                Ok(()) => self.release(conn).await,
                Err(e) => {
                    debug!(connection_id = conn.id, error = %e, "Pruning dead idle connection");
                    metrics::record_eviction("keepalive");
                    self.close(conn).await;
                    pruned += 1;
                }
            }
        }

        pruned
    }

    /// Opens connections until `idle + active` reaches `min_connections`.
    /// A connection that cannot be opened is skipped.
    pub(crate) async fn fill_to_min(&self) -> usize {
        let wanted = self
            .min_connections
            .saturating_sub(self.state_lock().total());
        let mut created = 0;

        for _ in 0..wanted {
            if self.is_closed() {
                break;
            }
            let reservation = {
                let mut state = self.state_lock();
                if state.total() >= self.min_connections {
                    break;
                }
                self.reserve(&mut state)
            };

            match self.factory.create().await {
                Ok(handle) => {
                    self.release(reservation.fulfil(handle)).await;
                    created += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Could not open connection for the pool minimum");
                }
            }
        }

        created
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::ScriptedConnector;

    fn pool_with(connector: &ScriptedConnector, min: usize, max: usize) -> ConnectionPool {
        let config = DbConfig::default()
            .with_pool_size(min, max)
            .with_max_retries(3)
            .with_retry_interval_ms(1)
            .with_timezone(None);
        let factory = ConnectionFactory::new(Arc::new(connector.clone()), &config);
        ConnectionPool::new(factory, &config)
    }

    fn assert_bounded(pool: &ConnectionPool) {
        let stats = pool.stats();
        assert!(
            stats.active + stats.idle <= stats.max,
            "pool bound violated: {stats:?}"
        );
    }

    #[tokio::test]
    async fn test_warm_up_creates_min_connections() {
        let connector = ScriptedConnector::new();
        let pool = pool_with(&connector, 3, 5);

        assert_eq!(pool.warm_up().await, 3);
        let stats = pool.stats();
        assert_eq!(stats.idle, 3);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.total, 3);
    }

    #[tokio::test]
    async fn test_warm_up_tolerates_failures() {
        let connector = ScriptedConnector::new();
        connector.fail_next_connects(100);
        let pool = pool_with(&connector, 2, 5);

        assert_eq!(pool.warm_up().await, 0);
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test]
    async fn test_checkout_reuses_idle_connection_after_health_check() {
        let connector = ScriptedConnector::new();
        let pool = pool_with(&connector, 1, 2);
        pool.warm_up().await;

        let conn = pool.get_connection().await.expect("checkout");
        assert_eq!(connector.opened(), 1);
        assert_eq!(pool.stats().active, 1);
        assert_eq!(pool.stats().idle, 0);

        pool.release(conn).await;
        assert_eq!(pool.stats().active, 0);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_checkout_replaces_dead_idle_connections() {
        let connector = ScriptedConnector::new();
        let pool = pool_with(&connector, 2, 4);
        pool.warm_up().await;
        connector.kill_all();

        let mut conn = pool.get_connection().await.expect("checkout");
        let rows = conn.execute("SELECT 2", &[]).await.expect("fresh connection works");
        assert_eq!(rows.len(), 1);

        assert_eq!(connector.closed(), 2);
        assert_eq!(connector.opened(), 3);
        let stats = pool.stats();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.idle, 0);
        pool.release(conn).await;
    }

    #[tokio::test]
    async fn test_exhaustion_reports_counts() {
        let connector = ScriptedConnector::new();
        let pool = pool_with(&connector, 0, 2);

        let a = pool.get_connection().await.expect("first");
        let b = pool.get_connection().await.expect("second");
        let err = pool.get_connection().await.expect_err("bound reached");
        match err {
            DbError::PoolExhausted { active, idle, max } => {
                assert_eq!((active, idle, max), (2, 0, 2));
            }
            other => panic!("unexpected error: {other}"),
        }

        pool.release(a).await;
        pool.close(b).await;
        let stats = pool.stats();
        assert_eq!((stats.active, stats.idle, stats.total), (0, 1, 1));
    }

    #[tokio::test]
    async fn test_bound_holds_across_mixed_operations() {
        let connector = ScriptedConnector::new();
        let pool = pool_with(&connector, 1, 3);
        pool.warm_up().await;
        assert_bounded(&pool);

        let mut held = Vec::new();
        for round in 0..12 {
            match pool.get_connection().await {
                Ok(conn) => held.push(conn),
                Err(DbError::PoolExhausted { .. }) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
            assert_bounded(&pool);

            if round % 3 == 2 {
                if let Some(conn) = held.pop() {
                    pool.release(conn).await;
                }
            }
            if round % 5 == 4 {
                if let Some(conn) = held.pop() {
                    pool.close(conn).await;
                }
            }
            assert_bounded(&pool);
        }

        for conn in held {
            pool.release(conn).await;
            assert_bounded(&pool);
        }
    }

    #[tokio::test]
    async fn test_concurrent_checkouts_respect_bound() {
        let connector = ScriptedConnector::new();
        connector.set_latency(Duration::from_millis(5));
        let pool = Arc::new(pool_with(&connector, 0, 4));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let pool = Arc::clone(&pool);
            tasks.push(tokio::spawn(async move {
                match pool.get_connection().await {
                    Ok(mut conn) => {
                        let _ = conn.execute("SELECT 1", &[]).await;
                        pool.release(conn).await;
                        true
                    }
                    Err(_) => false,
                }
            }));
        }

        for task in tasks {
            task.await.expect("task panicked");
        }

        assert!(connector.opened() <= 4);
        let stats = pool.stats();
        assert_eq!(stats.active, 0);
        assert!(stats.idle <= 4);
    }

    #[tokio::test]
    async fn test_release_after_reset_does_not_double_count() {
        let connector = ScriptedConnector::new();
        let pool = pool_with(&connector, 1, 3);
        pool.warm_up().await;

        let conn = pool.get_connection().await.expect("checkout");
        pool.reset_pool().await;
        let before = pool.stats();

        pool.release(conn).await;
        let after = pool.stats();
        assert_eq!(before.active, after.active);
        assert_eq!(before.idle, after.idle);
        assert_bounded(&pool);
    }

    #[tokio::test]
    async fn test_reset_closes_idle_and_warms_up() {
        let connector = ScriptedConnector::new();
        let pool = pool_with(&connector, 2, 4);
        pool.warm_up().await;

        assert_eq!(pool.reset_pool().await, 2);
        assert_eq!(connector.closed(), 2);
        assert_eq!(pool.stats().idle, 2);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_checkout() {
        let connector = ScriptedConnector::new();
        let pool = pool_with(&connector, 2, 4);
        pool.warm_up().await;

        let conn = pool.get_connection().await.expect("checkout");
        pool.shutdown().await;
        assert!(pool.get_connection().await.is_err());

        pool.release(conn).await;
        assert_eq!(pool.stats().total, 0);
        assert_eq!(connector.closed(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_checkout_frees_slot() {
        let connector = ScriptedConnector::new();
        let config = DbConfig::default()
            .with_pool_size(0, 1)
            .with_max_retries(1)
            .with_retry_interval_ms(1);
        let factory = ConnectionFactory::new(Arc::new(connector.clone()), &config);
        let pool = ConnectionPool::new(factory, &config);

        // Session setup stalls, so the caller gives up mid-create.
        connector.set_latency(Duration::from_secs(1));
        let outcome = tokio::time::timeout(Duration::from_millis(100), pool.get_connection()).await;
        assert!(outcome.is_err());
        assert_eq!(pool.stats().active, 0);

        connector.set_latency(Duration::ZERO);
        let conn = pool.get_connection().await.expect("slot is free again");
        pool.release(conn).await;
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_dropped_connection_frees_slot_and_closes() {
        let connector = ScriptedConnector::new();
        let pool = pool_with(&connector, 0, 1);

        let conn = pool.get_connection().await.expect("checkout");
        drop(conn);
        assert_eq!(pool.stats().active, 0);
        tokio::task::yield_now().await;
        assert_eq!(connector.closed(), 1);

        let conn = pool.get_connection().await.expect("slot is free again");
        pool.release(conn).await;
        assert_bounded(&pool);
    }

    #[tokio::test]
    async fn test_checkout_after_shutdown_is_not_retryable() {
        let connector = ScriptedConnector::new();
        let pool = pool_with(&connector, 1, 2);
        pool.warm_up().await;
        pool.shutdown().await;

        let err = pool.get_connection().await.expect_err("closed");
        assert!(matches!(err, DbError::PoolClosed));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_sweep_prunes_dead_connections() {
        let connector = ScriptedConnector::new();
        let pool = pool_with(&connector, 3, 5);
        pool.warm_up().await;
        connector.kill_all();

        assert_eq!(pool.sweep_idle().await, 3);
        assert_eq!(pool.stats().total, 0);

        assert_eq!(pool.fill_to_min().await, 3);
        assert_eq!(pool.stats().idle, 3);
    }
}
