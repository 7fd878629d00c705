//! Connection pool management.
//!
//! A fixed-capacity set of live connections plus an overflow allowance. The pool has no
//! knowledge of SQL; it only opens connections through a [`Connector`] and hands them
//! out one holder at a time.
//!
//! # Design
//!
//! - **`Semaphore` with `pool_size + max_overflow` permits**: every checked-out connection
//!   holds one permit, so `checked_out <= pool_size + max_overflow` holds by construction and a
//!   blocked checkout waits in FIFO order without blocking other tasks.
//! - **`std::sync::Mutex` for the idle list**: the critical section is a push or a pop and
//!   is never held across an await point.
//! - **`PooledConnection` guard**: checkin happens in `Drop`, so a connection is returned
//!   on every exit path. The permit is released after the connection is back in the idle
//!   list, so the next waiter finds it there.
//! - A checkout that times out or whose connect fails drops its permit with it, leaving no
//!   reservation behind.

use crate::config::RepoConfig;
use crate::db::driver::{Connector, DriverConnection};
use crate::error::{DbError, DbResult};
use crate::models::{QueryOutcome, QueryParam, QueryTimeout};
use serde::Serialize;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info, warn};

/// One live database session owned by the pool or by its current holder.
pub struct Connection {
    id: u64,
    driver: Box<dyn DriverConnection>,
    opened_at: Instant,
}

impl Connection {
    /// Pool-assigned identifier, stable for the life of the session.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Run one statement on this session.
    pub async fn execute(
        &mut self,
        statement: &str,
        params: &[QueryParam],
    ) -> DbResult<QueryOutcome> {
        self.driver.execute(statement, params).await
    }

    async fn close(self) {
        let id = self.id;
        if let Err(e) = self.driver.close().await {
            debug!(connection_id = id, error = %e, "Error while closing connection");
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("age", &self.age())
            .finish_non_exhaustive()
    }
}

/// Snapshot of the pool's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub pool_size: usize,
    pub max_overflow: usize,
    /// Connections open and waiting in the pool
    pub idle: usize,
    /// Checkouts currently holding a reservation
    pub checked_out: usize,
}

struct PoolShared {
    connector: Arc<dyn Connector>,
    idle: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
    pool_size: usize,
    max_overflow: usize,
    next_id: AtomicU64,
}

impl PoolShared {
    fn capacity(&self) -> usize {
        self.pool_size + self.max_overflow
    }

    async fn open(&self) -> DbResult<Connection> {
        let driver = self.connector.connect().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(connection_id = id, "Opened connection");
        Ok(Connection {
            id,
            driver,
            opened_at: Instant::now(),
        })
    }

    fn pop_idle(&self) -> Option<Connection> {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
    }

    /// Turn a reservation into a checked-out connection, reusing an idle one if possible.
    async fn lease(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> DbResult<PooledConnection> {
        let conn = match self.pop_idle() {
            Some(conn) => conn,
            // On failure the permit is dropped here, releasing the reservation
            None => self.open().await?,
        };
        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self),
            broken: false,
            _permit: permit,
        })
    }

    fn checkin(&self, conn: Connection, broken: bool) {
        if broken {
            warn!(connection_id = conn.id, "Discarding broken connection");
            return;
        }
        if self.permits.is_closed() {
            debug!(connection_id = conn.id, "Pool stopped, closing returned connection");
            retire(conn);
            return;
        }

        let overflow = {
            let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
            if idle.len() < self.pool_size {
                idle.push(conn);
                None
            } else {
                Some(conn)
            }
        };

        if let Some(conn) = overflow {
            debug!(connection_id = conn.id, "Closing overflow connection");
            retire(conn);
        }
    }
}

/// Close a connection in the background when a runtime is available; otherwise drop it.
fn retire(conn: Connection) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(conn.close());
        }
        Err(_) => drop(conn),
    }
}

fn pool_closed() -> DbError {
    DbError::connection("Connection pool is closed", "Start the repository again")
}

/// Bounded pool of live connections.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Start a pool. With `lazy = false`, `pool_size` connections are opened up front.
    pub async fn start(config: &RepoConfig, connector: Arc<dyn Connector>) -> DbResult<Self> {
        if config.pool_size == 0 {
            return Err(DbError::invalid_input("pool_size must be greater than 0"));
        }

        let shared = Arc::new(PoolShared {
            connector,
            idle: Mutex::new(Vec::with_capacity(config.pool_size)),
            permits: Arc::new(Semaphore::new(config.capacity())),
            pool_size: config.pool_size,
            max_overflow: config.max_overflow,
            next_id: AtomicU64::new(0),
        });

        if !config.lazy {
            let mut opened = Vec::with_capacity(config.pool_size);
            for _ in 0..config.pool_size {
                match shared.open().await {
                    Ok(conn) => opened.push(conn),
                    Err(e) => {
                        warn!(
                            opened = opened.len(),
                            error = %e,
                            "Eager pool start failed, closing opened connections"
                        );
                        for conn in opened {
                            conn.close().await;
                        }
                        return Err(e);
                    }
                }
            }
            *shared.idle.lock().unwrap_or_else(PoisonError::into_inner) = opened;
        }

        info!(
            pool_size = config.pool_size,
            max_overflow = config.max_overflow,
            lazy = config.lazy,
            "Connection pool started"
        );

        Ok(Self { shared })
    }

    /// Check out a connection, waiting up to `timeout` for one to become available.
    pub async fn acquire(&self, timeout: QueryTimeout) -> DbResult<PooledConnection> {
        match timeout.as_duration() {
            Some(bound) => tokio::time::timeout(bound, self.checkout())
                .await
                .map_err(|_| {
                    warn!(
                        timeout_ms = bound.as_millis() as u64,
                        "Timed out waiting for a connection"
                    );
                    DbError::timeout("pool checkout", bound)
                })?,
            None => self.checkout().await,
        }
    }

    /// Check out a connection without waiting; fails with a timeout when saturated.
    pub async fn try_acquire(&self) -> DbResult<PooledConnection> {
        let permit = Arc::clone(&self.shared.permits)
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::Closed => pool_closed(),
                TryAcquireError::NoPermits => DbError::timeout("pool checkout", Duration::ZERO),
            })?;
        self.shared.lease(permit).await
    }

    async fn checkout(&self) -> DbResult<PooledConnection> {
        let permit = Arc::clone(&self.shared.permits)
            .acquire_owned()
            .await
            .map_err(|_| pool_closed())?;
        self.shared.lease(permit).await
    }

    /// Stop the pool: refuse new checkouts and close every idle connection.
    ///
    /// Connections still checked out are closed when they come back.
    pub async fn stop(&self) {
        self.shared.permits.close();
        let idle = std::mem::take(
            &mut *self
                .shared
                .idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let count = idle.len();
        for conn in idle {
            conn.close().await;
        }
        info!(closed = count, "Connection pool stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.permits.is_closed()
    }

    pub fn status(&self) -> PoolStatus {
        let idle = self
            .shared
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        PoolStatus {
            pool_size: self.shared.pool_size,
            max_overflow: self.shared.max_overflow,
            idle,
            checked_out: self
                .shared
                .capacity()
                .saturating_sub(self.shared.permits.available_permits()),
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// RAII guard for a checked-out connection.
///
/// Returns the connection to the pool when dropped, on success, error and panic paths
/// alike. A guard marked broken discards its connection instead; the pool opens a
/// replacement on a later checkout.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolShared>,
    broken: bool,
    // Declared last: released only after `Drop::drop` has checked the connection in
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Retire this connection instead of returning it to the pool.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Explicitly return the connection to the pool.
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection is present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection is present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.checkin(conn, self.broken);
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connection", &self.conn)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}
