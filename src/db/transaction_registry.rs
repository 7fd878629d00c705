//! Transaction registry: routes operations to connections with transaction affinity.
//!
//! Operations name the logical task they belong to with an explicit [`TaskKey`]. While a
//! transaction is open for a task, every checkout for that key is routed to the one
//! connection held by the transaction; all other checkouts go to the pool and are released
//! when their lease is dropped.

use crate::db::pool::{Connection, ConnectionPool, PooledConnection};
use crate::error::{DbError, DbResult};
use crate::models::QueryTimeout;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMappedMutexGuard, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

/// Identifies one logical execution context (a request, a job, a transaction owner).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKey(String);

impl TaskKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Generate a unique task key.
    pub fn generate() -> Self {
        Self(format!("task_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A connection checked out for one operation.
///
/// `Pooled` leases return their connection to the pool when dropped. `Transaction` leases
/// hold the transaction's connection exclusively and only unlock it when dropped; the
/// connection stays with the transaction until [`TransactionRegistry::end_transaction`].
pub enum ConnectionLease {
    Pooled(PooledConnection),
    Transaction {
        task: TaskKey,
        conn: OwnedMappedMutexGuard<Option<PooledConnection>, PooledConnection>,
    },
}

impl ConnectionLease {
    pub fn is_transactional(&self) -> bool {
        matches!(self, Self::Transaction { .. })
    }

    /// Retire the underlying connection once it is released.
    pub fn mark_broken(&mut self) {
        match self {
            Self::Pooled(conn) => conn.mark_broken(),
            Self::Transaction { conn, .. } => conn.mark_broken(),
        }
    }
}

impl Deref for ConnectionLease {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match self {
            Self::Pooled(conn) => conn,
            Self::Transaction { conn, .. } => conn,
        }
    }
}

impl DerefMut for ConnectionLease {
    fn deref_mut(&mut self) -> &mut Connection {
        match self {
            Self::Pooled(conn) => conn,
            Self::Transaction { conn, .. } => conn,
        }
    }
}

impl fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pooled(conn) => f.debug_tuple("Pooled").field(&conn.id()).finish(),
            Self::Transaction { task, conn } => f
                .debug_struct("Transaction")
                .field("task", task)
                .field("connection_id", &conn.id())
                .finish(),
        }
    }
}

struct HeldConnection {
    // Emptied by `end_transaction`; a checkout that finds it empty lost the race
    conn: Arc<Mutex<Option<PooledConnection>>>,
    connection_id: u64,
    created_at: Instant,
}

/// Metadata about an open transaction (for listing without touching its connection).
#[derive(Debug, Clone, Serialize)]
pub struct TransactionMetadata {
    pub task: TaskKey,
    /// Pool identifier of the held connection
    pub connection_id: u64,
    /// When the transaction started (absolute time)
    pub started_at: DateTime<Utc>,
    /// Seconds since transaction started
    pub duration_secs: u64,
}

#[derive(Clone)]
pub struct TransactionRegistry {
    pool: ConnectionPool,
    transactions: Arc<RwLock<HashMap<TaskKey, HeldConnection>>>,
    /// System start time for converting Instant to DateTime
    system_start_instant: Instant,
    /// System start time as UTC DateTime
    system_start_datetime: DateTime<Utc>,
}

impl TransactionRegistry {
    pub fn new(pool: ConnectionPool) -> Self {
        Self {
            pool,
            transactions: Arc::new(RwLock::new(HashMap::new())),
            system_start_instant: Instant::now(),
            system_start_datetime: Utc::now(),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Check out a connection for one operation.
    ///
    /// Routed to the task's transaction connection when one is open, otherwise to the pool.
    /// `timeout` bounds the wait in both cases.
    pub async fn checkout(
        &self,
        task: Option<&TaskKey>,
        timeout: QueryTimeout,
    ) -> DbResult<ConnectionLease> {
        if let Some(task) = task {
            let held = {
                let txs = self.transactions.read().await;
                txs.get(task).map(|entry| Arc::clone(&entry.conn))
            };
            if let Some(slot) = held {
                let guard = lock_with_timeout(slot, timeout).await?;
                let conn = OwnedMutexGuard::try_map(guard, Option::as_mut).map_err(|_| {
                    DbError::transaction("Transaction ended while waiting for its connection", task.as_str())
                })?;
                // A timed-out statement may still be running server-side
                if conn.is_broken() {
                    return Err(DbError::transaction(
                        "Transaction connection is broken after a failed statement; roll back",
                        task.as_str(),
                    ));
                }
                debug!(task = %task, connection_id = conn.id(), "Routed to transaction connection");
                return Ok(ConnectionLease::Transaction {
                    task: task.clone(),
                    conn,
                });
            }
        }

        Ok(ConnectionLease::Pooled(self.pool.acquire(timeout).await?))
    }

    /// Run `body` with a routed connection.
    ///
    /// A pooled connection is released when `body` finishes, whether it returns `Ok`, `Err`
    /// or panics. A transaction connection stays with its transaction.
    pub async fn with_connection<R, F>(
        &self,
        task: Option<&TaskKey>,
        timeout: QueryTimeout,
        body: F,
    ) -> DbResult<R>
    where
        F: for<'c> FnOnce(&'c mut ConnectionLease) -> BoxFuture<'c, DbResult<R>>,
    {
        let mut lease = self.checkout(task, timeout).await?;
        body(&mut lease).await
    }

    /// Open a transaction context: check out a connection and pin it to `task`.
    pub async fn begin_transaction(&self, task: &TaskKey, timeout: QueryTimeout) -> DbResult<()> {
        if self.is_open(task).await {
            return Err(DbError::transaction("Transaction already open", task.as_str()));
        }

        let conn = self.pool.acquire(timeout).await?;
        let connection_id = conn.id();

        {
            let mut txs = self.transactions.write().await;
            if txs.contains_key(task) {
                // Lost a race with a concurrent begin; `conn` goes back to the pool
                return Err(DbError::transaction("Transaction already open", task.as_str()));
            }
            txs.insert(
                task.clone(),
                HeldConnection {
                    conn: Arc::new(Mutex::new(Some(conn))),
                    connection_id,
                    created_at: Instant::now(),
                },
            );
        }

        info!(task = %task, connection_id, "Transaction context opened");
        Ok(())
    }

    /// Close a transaction context and release its connection to the pool.
    ///
    /// Waits for an operation in flight on the connection to finish first.
    pub async fn end_transaction(&self, task: &TaskKey) -> DbResult<()> {
        let entry = {
            let mut txs = self.transactions.write().await;
            txs.remove(task)
                .ok_or_else(|| DbError::transaction("No transaction open", task.as_str()))?
        };

        let released = entry.conn.lock().await.take();
        if released.is_none() {
            warn!(task = %task, "Transaction connection was already released");
        }
        drop(released);

        info!(
            task = %task,
            connection_id = entry.connection_id,
            duration_ms = entry.created_at.elapsed().as_millis() as u64,
            "Transaction context closed"
        );
        Ok(())
    }

    /// Whether a failed statement retired the task's transaction connection.
    ///
    /// Waits for an operation in flight on the connection to finish first.
    pub async fn is_broken(&self, task: &TaskKey) -> bool {
        let held = {
            let txs = self.transactions.read().await;
            txs.get(task).map(|entry| Arc::clone(&entry.conn))
        };
        match held {
            Some(slot) => slot
                .lock()
                .await
                .as_ref()
                .is_some_and(PooledConnection::is_broken),
            None => false,
        }
    }

    pub async fn is_open(&self, task: &TaskKey) -> bool {
        self.transactions.read().await.contains_key(task)
    }

    /// List all open transactions with their metadata.
    pub async fn list_all(&self) -> Vec<TransactionMetadata> {
        let txs = self.transactions.read().await;
        txs.iter()
            .map(|(task, entry)| {
                // Convert Instant to DateTime by calculating offset from system start
                let offset_from_start = entry.created_at.duration_since(self.system_start_instant);
                TransactionMetadata {
                    task: task.clone(),
                    connection_id: entry.connection_id,
                    started_at: self.system_start_datetime + offset_from_start,
                    duration_secs: entry.created_at.elapsed().as_secs(),
                }
            })
            .collect()
    }

    /// Get the number of open transactions.
    pub async fn count(&self) -> usize {
        self.transactions.read().await.len()
    }
}

impl fmt::Debug for TransactionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionRegistry")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

async fn lock_with_timeout<T>(
    slot: Arc<Mutex<T>>,
    timeout: QueryTimeout,
) -> DbResult<OwnedMutexGuard<T>> {
    match timeout.as_duration() {
        Some(bound) => tokio::time::timeout(bound, slot.lock_owned())
            .await
            .map_err(|_| DbError::timeout("transaction connection wait", bound)),
        None => Ok(slot.lock_owned().await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepoConfig;
    use crate::db::mock::MockConnector;
    use futures_util::FutureExt;
    use std::time::Duration;

    const SHORT: QueryTimeout = QueryTimeout::Finite(Duration::from_millis(100));

    async fn registry(pool_size: usize, max_overflow: usize) -> TransactionRegistry {
        let config = RepoConfig {
            pool_size,
            max_overflow,
            ..RepoConfig::default()
        };
        let pool = ConnectionPool::start(&config, Arc::new(MockConnector::new()))
            .await
            .unwrap();
        TransactionRegistry::new(pool)
    }

    #[test]
    fn test_task_key_format() {
        let key = TaskKey::generate();
        assert!(key.as_str().starts_with("task_"));
        assert_eq!(key.as_str().len(), 5 + 32); // "task_" + 32 hex chars
    }

    #[tokio::test]
    async fn test_registry_creation() {
        let registry = registry(1, 0).await;
        assert_eq!(registry.count().await, 0);
        assert!(registry.list_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_checkout_without_transaction_uses_pool() {
        let registry = registry(2, 0).await;
        let task = TaskKey::generate();
        let lease = registry.checkout(Some(&task), SHORT).await.unwrap();
        assert!(!lease.is_transactional());
        drop(lease);
        assert_eq!(registry.pool().status().checked_out, 0);
        assert_eq!(registry.pool().status().idle, 1);
    }

    #[tokio::test]
    async fn test_transaction_routes_to_same_connection() {
        let registry = registry(2, 0).await;
        let task = TaskKey::generate();
        registry.begin_transaction(&task, SHORT).await.unwrap();

        let first = registry.checkout(Some(&task), SHORT).await.unwrap();
        let first_id = first.id();
        assert!(first.is_transactional());
        drop(first);

        let second = registry.checkout(Some(&task), SHORT).await.unwrap();
        assert_eq!(second.id(), first_id);

        // Another task never sees the held connection
        let other = registry.checkout(None, SHORT).await.unwrap();
        assert_ne!(other.id(), first_id);
    }

    #[tokio::test]
    async fn test_duplicate_begin_rejected() {
        let registry = registry(2, 0).await;
        let task = TaskKey::new("job-1");
        registry.begin_transaction(&task, SHORT).await.unwrap();
        let err = registry.begin_transaction(&task, SHORT).await.unwrap_err();
        assert!(matches!(err, DbError::Transaction { .. }));
        assert_eq!(registry.count().await, 1);
        assert_eq!(registry.pool().status().checked_out, 1);
    }

    #[tokio::test]
    async fn test_end_transaction_releases_connection() {
        let registry = registry(1, 0).await;
        let task = TaskKey::generate();
        registry.begin_transaction(&task, SHORT).await.unwrap();
        assert_eq!(registry.pool().status().checked_out, 1);

        registry.end_transaction(&task).await.unwrap();
        assert!(!registry.is_open(&task).await);
        assert_eq!(registry.pool().status().checked_out, 0);
        assert_eq!(registry.pool().status().idle, 1);
    }

    #[tokio::test]
    async fn test_broken_transaction_connection_refuses_checkout() {
        let registry = registry(2, 0).await;
        let task = TaskKey::generate();
        registry.begin_transaction(&task, SHORT).await.unwrap();
        assert!(!registry.is_broken(&task).await);

        let mut lease = registry.checkout(Some(&task), SHORT).await.unwrap();
        lease.mark_broken();
        drop(lease);

        assert!(registry.is_broken(&task).await);
        let err = registry.checkout(Some(&task), SHORT).await.unwrap_err();
        assert!(matches!(err, DbError::Transaction { .. }));

        // Ending the transaction discards the connection instead of pooling it
        registry.end_transaction(&task).await.unwrap();
        assert_eq!(registry.pool().status().checked_out, 0);
        assert_eq!(registry.pool().status().idle, 0);
        assert!(!registry.is_broken(&task).await);
    }

    #[tokio::test]
    async fn test_end_unknown_transaction() {
        let registry = registry(1, 0).await;
        let result = registry.end_transaction(&TaskKey::new("nope")).await;
        assert!(matches!(result, Err(DbError::Transaction { .. })));
    }

    #[tokio::test]
    async fn test_end_transaction_waits_for_in_flight_operation() {
        let registry = registry(1, 0).await;
        let task = TaskKey::generate();
        registry.begin_transaction(&task, SHORT).await.unwrap();
        let lease = registry.checkout(Some(&task), SHORT).await.unwrap();

        let ending = {
            let registry = registry.clone();
            let task = task.clone();
            tokio::spawn(async move { registry.end_transaction(&task).await })
        };
        tokio::task::yield_now().await;
        assert!(!ending.is_finished());
        assert_eq!(registry.pool().status().checked_out, 1);

        drop(lease);
        ending.await.unwrap().unwrap();
        assert_eq!(registry.pool().status().checked_out, 0);
    }

    #[tokio::test]
    async fn test_with_connection_releases_on_error() {
        let registry = registry(1, 0).await;
        let result: DbResult<()> = registry
            .with_connection(None, SHORT, |_lease| {
                async { Err(DbError::internal("body failed")) }.boxed()
            })
            .await;
        assert!(result.is_err());
        assert_eq!(registry.pool().status().checked_out, 0);
        assert_eq!(registry.pool().status().idle, 1);
    }

    #[tokio::test]
    async fn test_with_connection_keeps_transaction_connection() {
        let registry = registry(1, 0).await;
        let task = TaskKey::generate();
        registry.begin_transaction(&task, SHORT).await.unwrap();

        let id = registry
            .with_connection(Some(&task), SHORT, |lease| {
                async move { Ok(lease.id()) }.boxed()
            })
            .await
            .unwrap();

        assert!(registry.is_open(&task).await);
        assert_eq!(registry.pool().status().checked_out, 1);
        assert_eq!(registry.list_all().await[0].connection_id, id);
    }

    #[tokio::test]
    async fn test_list_all_returns_transaction_metadata() {
        let registry = registry(2, 0).await;
        let task = TaskKey::new("job-7");
        registry.begin_transaction(&task, SHORT).await.unwrap();
        let list = registry.list_all().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].task, task);
        assert!(list[0].started_at <= Utc::now());
    }
}
