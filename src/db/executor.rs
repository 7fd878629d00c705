//! Query execution engine.
//!
//! Resolves a connection through the [`TransactionRegistry`], sends one statement to the
//! driver under a timeout, and reports every call to a [`QueryLogger`]. The executor never
//! touches the pool directly.

use crate::db::transaction_registry::{TaskKey, TransactionRegistry};
use crate::error::{DbError, DbResult};
use crate::models::{QueryOptions, QueryOutcome, QueryParam, QueryTimeout};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

/// One executed statement, as reported to a [`QueryLogger`].
#[derive(Debug)]
pub struct QueryLogEntry<'a> {
    pub statement: &'a str,
    pub param_count: usize,
    pub task: Option<&'a TaskKey>,
    /// None when no connection could be checked out
    pub connection_id: Option<u64>,
    pub elapsed: Duration,
    pub result: Result<&'a QueryOutcome, &'a DbError>,
}

/// Receives one entry per executed statement.
pub trait QueryLogger: Send + Sync {
    fn log(&self, entry: &QueryLogEntry<'_>);
}

/// Default logger: `debug` for successful statements, `warn` for failures.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingQueryLogger;

impl QueryLogger for TracingQueryLogger {
    fn log(&self, entry: &QueryLogEntry<'_>) {
        let elapsed_ms = entry.elapsed.as_millis() as u64;
        let task = entry.task.map(TaskKey::as_str);
        match entry.result {
            Ok(outcome) => debug!(
                statement = %entry.statement,
                params = entry.param_count,
                task = ?task,
                connection_id = ?entry.connection_id,
                rows = outcome.row_count(),
                elapsed_ms,
                "Query executed"
            ),
            Err(error) => warn!(
                statement = %entry.statement,
                params = entry.param_count,
                task = ?task,
                connection_id = ?entry.connection_id,
                error = %error,
                elapsed_ms,
                "Query failed"
            ),
        }
    }
}

/// Query executor that handles database query execution.
#[derive(Clone)]
pub struct QueryExecutor {
    router: TransactionRegistry,
    default_timeout: QueryTimeout,
    logger: Arc<dyn QueryLogger>,
}

impl QueryExecutor {
    pub fn new(router: TransactionRegistry, default_timeout: QueryTimeout) -> Self {
        Self {
            router,
            default_timeout,
            logger: Arc::new(TracingQueryLogger),
        }
    }

    /// Replace the query logger.
    pub fn with_logger(mut self, logger: Arc<dyn QueryLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn router(&self) -> &TransactionRegistry {
        &self.router
    }

    pub fn default_timeout(&self) -> QueryTimeout {
        self.default_timeout
    }

    /// Execute one statement for `task`.
    ///
    /// The timeout (from `opts`, else the executor default) bounds the connection wait and
    /// the statement separately. A statement that times out or loses its connection retires
    /// that connection.
    pub async fn execute(
        &self,
        task: Option<&TaskKey>,
        statement: &str,
        params: &[QueryParam],
        opts: &QueryOptions,
    ) -> DbResult<QueryOutcome> {
        let query_timeout = opts.timeout.unwrap_or(self.default_timeout);
        let start = Instant::now();
        let mut connection_id = None;

        let result = self
            .run(task, statement, params, query_timeout, &mut connection_id)
            .await;

        self.logger.log(&QueryLogEntry {
            statement,
            param_count: params.len(),
            task,
            connection_id,
            elapsed: start.elapsed(),
            result: result.as_ref(),
        });

        result
    }

    async fn run(
        &self,
        task: Option<&TaskKey>,
        statement: &str,
        params: &[QueryParam],
        query_timeout: QueryTimeout,
        connection_id: &mut Option<u64>,
    ) -> DbResult<QueryOutcome> {
        let mut lease = self.router.checkout(task, query_timeout).await?;
        *connection_id = Some(lease.id());

        let result = match query_timeout.as_duration() {
            Some(bound) => match timeout(bound, lease.execute(statement, params)).await {
                Ok(result) => result,
                Err(_) => Err(DbError::timeout("query execution", bound)),
            },
            None => lease.execute(statement, params).await,
        };

        if let Err(e) = &result {
            if e.invalidates_connection() {
                lease.mark_broken();
            }
        }

        result
    }
}

impl std::fmt::Debug for QueryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepoConfig;
    use crate::db::mock::MockConnector;
    use crate::db::pool::ConnectionPool;
    use crate::models::RawValue;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingLogger {
        entries: Mutex<Vec<(String, bool)>>,
    }

    impl QueryLogger for RecordingLogger {
        fn log(&self, entry: &QueryLogEntry<'_>) {
            self.entries
                .lock()
                .unwrap()
                .push((entry.statement.to_string(), entry.result.is_ok()));
        }
    }

    async fn executor(pool_size: usize) -> QueryExecutor {
        let config = RepoConfig {
            pool_size,
            max_overflow: 0,
            ..RepoConfig::default()
        };
        let pool = ConnectionPool::start(&config, Arc::new(MockConnector::new()))
            .await
            .unwrap();
        QueryExecutor::new(TransactionRegistry::new(pool), config.timeout)
    }

    fn status(executor: &QueryExecutor) -> crate::db::pool::PoolStatus {
        executor.router().pool().status()
    }

    #[tokio::test]
    async fn test_execute_returns_rows() {
        let executor = executor(1).await;
        let outcome = executor
            .execute(None, "SELECT CONNECTION_ID()", &[], &QueryOptions::default())
            .await
            .unwrap();
        match outcome {
            QueryOutcome::Rows(set) => assert_eq!(set.rows, vec![vec![RawValue::UInt(1)]]),
            other => panic!("expected rows, got {other:?}"),
        }
        assert_eq!(status(&executor).checked_out, 0);
    }

    #[tokio::test]
    async fn test_driver_error_releases_connection() {
        let executor = executor(1).await;
        let err = executor
            .execute(None, "FAIL syntax", &[], &QueryOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Driver { .. }));
        // Driver errors keep the connection usable
        assert_eq!(status(&executor).checked_out, 0);
        assert_eq!(status(&executor).idle, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_statement_timeout_retires_connection() {
        let executor = executor(1).await;
        let opts = QueryOptions::with_timeout(QueryTimeout::from_millis(50));
        let err = executor
            .execute(None, "SLEEP 1000", &[], &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Timeout { .. }));
        assert_eq!(status(&executor).checked_out, 0);
        assert_eq!(status(&executor).idle, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_infinite_timeout_waits() {
        let executor = executor(1).await;
        let opts = QueryOptions::with_timeout(QueryTimeout::Infinite);
        let outcome = executor.execute(None, "SLEEP 10000", &[], &opts).await;
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn test_every_call_is_logged() {
        let logger = Arc::new(RecordingLogger::default());
        let executor = executor(1).await.with_logger(logger.clone());
        let opts = QueryOptions::default();
        executor.execute(None, "SELECT 1", &[], &opts).await.unwrap();
        let _ = executor.execute(None, "FAIL", &[], &opts).await;

        let entries = logger.entries.lock().unwrap();
        assert_eq!(
            *entries,
            vec![("SELECT 1".to_string(), true), ("FAIL".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn test_transaction_statements_share_connection() {
        let executor = executor(2).await;
        let task = TaskKey::generate();
        let opts = QueryOptions::default();
        executor
            .router()
            .begin_transaction(&task, QueryTimeout::default())
            .await
            .unwrap();

        let mut ids = Vec::new();
        for _ in 0..3 {
            let outcome = executor
                .execute(Some(&task), "SELECT CONNECTION_ID()", &[], &opts)
                .await
                .unwrap();
            ids.push(outcome.into_rows().remove(0).remove(0));
        }
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(status(&executor).checked_out, 1);
    }
}
