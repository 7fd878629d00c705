//! In-memory driver for tests and dry runs.
//!
//! [`MockConnector`] hands out connections that record every statement they run and
//! answer from a small built-in vocabulary:
//!
//! - `SELECT CONNECTION_ID()` returns the mock connection's id
//! - `FAIL ...` fails with a driver error
//! - `DISCONNECT` fails with a connection error
//! - `SLEEP <ms>` waits that long, then acknowledges
//! - statements on `schema_migrations` are applied to an in-memory ledger
//! - statements registered with [`MockConnector::on`] return their canned outcome
//!
//! Anything else is acknowledged with zero affected rows.

use crate::db::driver::{Connector, DriverConnection};
use crate::error::{DbError, DbResult};
use crate::models::{Ack, QueryOutcome, QueryParam, RawValue, RowSet};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// One statement as seen by a mock connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedStatement {
    pub connection_id: u64,
    pub statement: String,
    pub params: Vec<QueryParam>,
}

#[derive(Default)]
struct MockState {
    next_id: AtomicU64,
    opened: AtomicUsize,
    closed: AtomicUsize,
    fail_connect: AtomicBool,
    log: Mutex<Vec<ExecutedStatement>>,
    /// None until the ledger table is created
    ledger: Mutex<Option<BTreeSet<i64>>>,
    rules: Mutex<Vec<(String, QueryOutcome)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Connector whose connections live in memory. Clones share state.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections opened so far.
    pub fn opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    /// Connections closed gracefully so far.
    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Make subsequent connects fail (or succeed again).
    pub fn fail_connects(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Answer `statement` (compared after trimming) with `outcome` from now on.
    pub fn on(&self, statement: impl Into<String>, outcome: QueryOutcome) {
        lock(&self.state.rules).push((statement.into().trim().to_string(), outcome));
    }

    /// Every statement executed so far, in execution order.
    pub fn statements(&self) -> Vec<ExecutedStatement> {
        lock(&self.state.log).clone()
    }

    /// How many times `statement` ran, on any connection.
    pub fn count_of(&self, statement: &str) -> usize {
        lock(&self.state.log)
            .iter()
            .filter(|s| s.statement == statement)
            .count()
    }

    /// Versions in the in-memory ledger; None if the ledger table was never created.
    pub fn ledger(&self) -> Option<Vec<i64>> {
        lock(&self.state.ledger)
            .as_ref()
            .map(|versions| versions.iter().copied().collect())
    }
}

impl std::fmt::Debug for MockConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConnector")
            .field("opened", &self.opened())
            .field("closed", &self.closed())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> DbResult<Box<dyn DriverConnection>> {
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(DbError::connection(
                "Can't connect to MySQL server (mock)",
                "Check network connectivity and database server status",
            ));
        }
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(MockConnection {
            id,
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockConnection {
    id: u64,
    state: Arc<MockState>,
}

#[async_trait]
impl DriverConnection for MockConnection {
    async fn execute(
        &mut self,
        statement: &str,
        params: &[QueryParam],
    ) -> DbResult<QueryOutcome> {
        let statement = statement.trim();
        lock(&self.state.log).push(ExecutedStatement {
            connection_id: self.id,
            statement: statement.to_string(),
            params: params.to_vec(),
        });

        let upper = statement.to_ascii_uppercase();
        if upper.starts_with("FAIL") {
            return Err(DbError::driver(
                format!("You have an error in your SQL syntax near '{statement}'"),
                Some("1064".to_string()),
                "Check the SQL syntax and referenced objects",
            ));
        }
        if upper.starts_with("DISCONNECT") {
            return Err(DbError::connection(
                "Lost connection to MySQL server during query",
                "Reconnect to the database",
            ));
        }
        if let Some(ms) = upper.strip_prefix("SLEEP ") {
            let ms: u64 = ms
                .trim()
                .parse()
                .map_err(|_| DbError::invalid_input(format!("bad SLEEP duration: {ms}")))?;
            tokio::time::sleep(Duration::from_millis(ms)).await;
            return Ok(ack(0));
        }
        if upper == "SELECT CONNECTION_ID()" {
            return Ok(QueryOutcome::Rows(RowSet {
                columns: vec!["CONNECTION_ID()".to_string()],
                rows: vec![vec![RawValue::UInt(self.id)]],
            }));
        }

        let rule = lock(&self.state.rules)
            .iter()
            .find(|(s, _)| s == statement)
            .map(|(_, outcome)| outcome.clone());
        if let Some(outcome) = rule {
            return Ok(outcome);
        }

        if upper.contains("SCHEMA_MIGRATIONS") {
            return self.ledger_statement(&upper, params);
        }

        Ok(ack(0))
    }

    async fn close(self: Box<Self>) -> DbResult<()> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl MockConnection {
    fn ledger_statement(&self, upper: &str, params: &[QueryParam]) -> DbResult<QueryOutcome> {
        let mut ledger = lock(&self.state.ledger);

        if upper.starts_with("CREATE TABLE") {
            ledger.get_or_insert_with(BTreeSet::new);
            return Ok(ack(0));
        }

        let versions = ledger.as_mut().ok_or_else(|| {
            DbError::driver(
                "Table 'schema_migrations' doesn't exist",
                Some("1146".to_string()),
                "Check the SQL syntax and referenced objects",
            )
        })?;

        if upper.starts_with("SELECT") {
            let wanted = params.first().map(version_param).transpose()?;
            let rows = versions
                .iter()
                .filter(|v| wanted.is_none_or(|w| w == **v))
                .map(|v| vec![RawValue::Int(*v)])
                .collect();
            return Ok(QueryOutcome::Rows(RowSet {
                columns: vec!["version".to_string()],
                rows,
            }));
        }

        let version = params
            .first()
            .map(version_param)
            .transpose()?
            .ok_or_else(|| DbError::invalid_input("ledger statement without a version"))?;

        if upper.starts_with("INSERT") {
            if !versions.insert(version) {
                return Err(DbError::driver(
                    format!("Duplicate entry '{version}' for key 'PRIMARY'"),
                    Some("1062".to_string()),
                    "Check unique constraints",
                ));
            }
            return Ok(ack(1));
        }
        if upper.starts_with("DELETE") {
            return Ok(ack(u64::from(versions.remove(&version))));
        }

        Ok(ack(0))
    }
}

fn version_param(param: &QueryParam) -> DbResult<i64> {
    match param {
        QueryParam::Int(v) => Ok(*v),
        QueryParam::UInt(v) => i64::try_from(*v)
            .map_err(|_| DbError::invalid_input(format!("version out of range: {v}"))),
        other => Err(DbError::invalid_input(format!(
            "version must be an integer, got {}",
            other.type_name()
        ))),
    }
}

fn ack(affected_rows: u64) -> QueryOutcome {
    QueryOutcome::Ack(Ack {
        inserted_id: None,
        affected_rows: Some(affected_rows),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connection(connector: &MockConnector) -> Box<dyn DriverConnection> {
        connector.connect().await.unwrap()
    }

    #[tokio::test]
    async fn test_connections_get_distinct_ids() {
        let connector = MockConnector::new();
        let mut a = connection(&connector).await;
        let mut b = connection(&connector).await;
        let id_a = a.execute("SELECT CONNECTION_ID()", &[]).await.unwrap();
        let id_b = b.execute("SELECT CONNECTION_ID()", &[]).await.unwrap();
        assert_ne!(id_a, id_b);
        assert_eq!(connector.opened(), 2);
    }

    #[tokio::test]
    async fn test_canned_outcome() {
        let connector = MockConnector::new();
        let canned = QueryOutcome::Rows(RowSet {
            columns: vec!["n".into()],
            rows: vec![vec![RawValue::Int(3)]],
        });
        connector.on("SELECT n FROM t", canned.clone());
        let mut conn = connection(&connector).await;
        assert_eq!(conn.execute("  SELECT n FROM t ", &[]).await.unwrap(), canned);
        assert_eq!(connector.count_of("SELECT n FROM t"), 1);
    }

    #[tokio::test]
    async fn test_ledger_requires_table() {
        let connector = MockConnector::new();
        let mut conn = connection(&connector).await;
        let err = conn
            .execute("SELECT version FROM schema_migrations", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Driver { .. }));
        assert_eq!(connector.ledger(), None);
    }

    #[tokio::test]
    async fn test_ledger_insert_and_delete() {
        let connector = MockConnector::new();
        let mut conn = connection(&connector).await;
        conn.execute("CREATE TABLE IF NOT EXISTS schema_migrations (version BIGINT)", &[])
            .await
            .unwrap();
        conn.execute(
            "INSERT INTO schema_migrations (version) VALUES (?)",
            &[QueryParam::Int(7)],
        )
        .await
        .unwrap();
        assert!(
            conn.execute(
                "INSERT INTO schema_migrations (version) VALUES (?)",
                &[QueryParam::Int(7)],
            )
            .await
            .is_err()
        );
        assert_eq!(connector.ledger(), Some(vec![7]));

        conn.execute(
            "DELETE FROM schema_migrations WHERE version = ?",
            &[QueryParam::Int(7)],
        )
        .await
        .unwrap();
        assert_eq!(connector.ledger(), Some(vec![]));
    }

    #[tokio::test]
    async fn test_close_is_counted() {
        let connector = MockConnector::new();
        let conn = connection(&connector).await;
        conn.close().await.unwrap();
        assert_eq!(connector.closed(), 1);
    }
}
