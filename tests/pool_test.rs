//! Integration tests for the connection pool under concurrent load.

use mysql_repo::RepoConfig;
use mysql_repo::db::ConnectionPool;
use mysql_repo::db::mock::MockConnector;
use mysql_repo::error::DbError;
use mysql_repo::models::QueryTimeout;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

async fn start_pool(pool_size: usize, max_overflow: usize) -> (ConnectionPool, MockConnector) {
    let mock = MockConnector::new();
    let config = RepoConfig {
        pool_size,
        max_overflow,
        ..RepoConfig::default()
    };
    let pool = ConnectionPool::start(&config, Arc::new(mock.clone()))
        .await
        .unwrap();
    (pool, mock)
}

#[tokio::test]
async fn test_concurrent_checkouts_never_exceed_capacity() {
    let (pool, mock) = start_pool(2, 1).await;
    let in_use = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 0..20 {
        let pool = pool.clone();
        let in_use = in_use.clone();
        let peak = peak.clone();
        handles.push(tokio::spawn(async move {
            let mut conn = pool.acquire(QueryTimeout::Infinite).await?;
            let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            conn.execute(&format!("SLEEP {}", 1 + i % 3), &[]).await?;
            in_use.fetch_sub(1, Ordering::SeqCst);
            Ok::<_, DbError>(())
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(mock.count_of("SLEEP 1"), 7);

    let status = pool.status();
    assert_eq!(status.checked_out, 0);
    assert!(status.idle <= 2);
}

#[tokio::test]
async fn test_saturated_pool_times_out_then_recovers() {
    let (pool, _mock) = start_pool(1, 1).await;
    let first = pool.acquire(QueryTimeout::Infinite).await.unwrap();
    let second = pool.acquire(QueryTimeout::Infinite).await.unwrap();
    assert_eq!(pool.status().checked_out, 2);

    let err = pool
        .acquire(QueryTimeout::from_millis(20))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Timeout { .. }));
    assert!(err.is_retryable());

    // A timed-out wait holds no reservation
    assert_eq!(pool.status().checked_out, 2);

    drop(first);
    let third = pool.acquire(QueryTimeout::from_millis(20)).await.unwrap();
    drop(second);
    drop(third);
    assert_eq!(pool.status().checked_out, 0);
}

#[tokio::test]
async fn test_waiter_is_served_in_turn() {
    let (pool, _mock) = start_pool(1, 0).await;
    let held = pool.acquire(QueryTimeout::Infinite).await.unwrap();
    let held_id = held.id();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(QueryTimeout::Infinite).await.map(|c| c.id()) })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!waiter.is_finished());

    drop(held);
    assert_eq!(waiter.await.unwrap().unwrap(), held_id);
}

#[tokio::test]
async fn test_overflow_connections_are_closed_on_return() {
    let (pool, mock) = start_pool(1, 2).await;
    let conns = vec![
        pool.acquire(QueryTimeout::Infinite).await.unwrap(),
        pool.acquire(QueryTimeout::Infinite).await.unwrap(),
        pool.acquire(QueryTimeout::Infinite).await.unwrap(),
    ];
    assert_eq!(mock.opened(), 3);
    drop(conns);

    for _ in 0..50 {
        if mock.closed() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(mock.closed(), 2);
    assert_eq!(pool.status().idle, 1);
}

#[tokio::test]
async fn test_stopped_pool_refuses_checkouts() {
    let (pool, mock) = start_pool(2, 0).await;
    let conn = pool.acquire(QueryTimeout::Infinite).await.unwrap();
    drop(conn);

    pool.stop().await;
    assert!(pool.is_stopped());
    assert_eq!(mock.closed(), 1);
    assert!(matches!(
        pool.acquire(QueryTimeout::Infinite).await,
        Err(DbError::Connection { .. })
    ));
}
