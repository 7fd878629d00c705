//! Repository facade.
//!
//! A [`Repo`] ties the pieces together: a [`SqlBuilder`] turns query descriptions into
//! statements, the [`QueryExecutor`] runs them with transaction affinity, the materializer
//! rebuilds nested rows, and the optional [`AssociationRunner`] and [`Preloader`] attach
//! related records.
//!
//! Transactions are explicit: [`Repo::begin`] returns a [`Transaction`] handle whose
//! operations all run on the transaction's connection.

use crate::config::RepoConfig;
use crate::db::executor::{QueryExecutor, QueryLogger};
use crate::db::materialize::materialize_rows;
use crate::db::mysql::MySqlConnector;
use crate::db::pool::{ConnectionPool, PoolStatus};
use crate::db::transaction_registry::{TaskKey, TransactionMetadata, TransactionRegistry};
use crate::db::Connector;
use crate::error::{DbError, DbResult};
use crate::models::{
    Ack, Entity, FieldPath, Filter, Materialized, Query, QueryOptions, QueryOutcome, QueryParam,
    Value,
};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A statement and its positional parameters.
pub type Statement = (String, Vec<QueryParam>);

/// Produces SQL for query descriptions and entities.
pub trait SqlBuilder: Send + Sync {
    fn select(&self, query: &Query) -> DbResult<Statement>;
    fn insert(&self, entity: &Entity) -> DbResult<Statement>;
    fn update(&self, entity: &Entity, filters: &[Filter]) -> DbResult<Statement>;
    fn update_all(&self, query: &Query, changes: &[(String, Value)]) -> DbResult<Statement>;
    fn delete(&self, entity: &Entity, filters: &[Filter]) -> DbResult<Statement>;
    fn delete_all(&self, query: &Query) -> DbResult<Statement>;
}

/// Reassembles association structure joined into the main statement.
pub trait AssociationRunner: Send + Sync {
    fn run(&self, query: &Query, rows: Vec<Materialized>) -> DbResult<Vec<Materialized>>;
}

/// Fetches related records for materialized parents and attaches them.
///
/// `position` locates the parent entity inside each row (see
/// [`crate::models::Shape::entity_position`]). `task` is the transaction the parent
/// query ran in, if any; follow-up queries should run there too.
#[async_trait]
pub trait Preloader: Send + Sync {
    async fn run(
        &self,
        repo: &Repo,
        task: Option<&TaskKey>,
        rows: Vec<Materialized>,
        paths: &[FieldPath],
        position: usize,
    ) -> DbResult<Vec<Materialized>>;
}

#[derive(Clone)]
pub struct Repo {
    config: Arc<RepoConfig>,
    executor: QueryExecutor,
    builder: Option<Arc<dyn SqlBuilder>>,
    associations: Option<Arc<dyn AssociationRunner>>,
    preloader: Option<Arc<dyn Preloader>>,
}

impl Repo {
    /// Start a repository over any driver.
    pub async fn start(config: RepoConfig, connector: Arc<dyn Connector>) -> DbResult<Self> {
        config.validate().map_err(DbError::invalid_input)?;
        let pool = ConnectionPool::start(&config, connector).await?;
        let executor = QueryExecutor::new(TransactionRegistry::new(pool), config.timeout);

        info!(
            host = %config.hostname,
            port = config.port,
            database = ?config.database,
            "Repository started"
        );

        Ok(Self {
            config: Arc::new(config),
            executor,
            builder: None,
            associations: None,
            preloader: None,
        })
    }

    /// Start a repository over MySQL.
    pub async fn connect(config: RepoConfig) -> DbResult<Self> {
        let connector = MySqlConnector::new(&config)?;
        Self::start(config, Arc::new(connector)).await
    }

    pub fn with_builder(mut self, builder: Arc<dyn SqlBuilder>) -> Self {
        self.builder = Some(builder);
        self
    }

    pub fn with_association_runner(mut self, runner: Arc<dyn AssociationRunner>) -> Self {
        self.associations = Some(runner);
        self
    }

    pub fn with_preloader(mut self, preloader: Arc<dyn Preloader>) -> Self {
        self.preloader = Some(preloader);
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn QueryLogger>) -> Self {
        self.executor = self.executor.with_logger(logger);
        self
    }

    /// Close every idle connection and refuse new checkouts.
    pub async fn stop(&self) {
        self.pool().stop().await;
        info!("Repository stopped");
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        self.executor.router().pool()
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool().status()
    }

    pub async fn open_transactions(&self) -> Vec<TransactionMetadata> {
        self.executor.router().list_all().await
    }

    /// Run one statement for `task` (or outside any transaction).
    pub async fn execute(
        &self,
        task: Option<&TaskKey>,
        statement: &str,
        params: &[QueryParam],
        opts: &QueryOptions,
    ) -> DbResult<QueryOutcome> {
        self.executor.execute(task, statement, params, opts).await
    }

    fn scope<'a>(&'a self, task: Option<&'a TaskKey>) -> Scope<'a> {
        Scope { repo: self, task }
    }

    /// Run a raw statement.
    pub async fn query(
        &self,
        statement: &str,
        params: &[QueryParam],
        opts: &QueryOptions,
    ) -> DbResult<QueryOutcome> {
        self.execute(None, statement, params, opts).await
    }

    /// Fetch every row of `query`, materialized to its selection shape.
    pub async fn all(&self, query: &Query) -> DbResult<Vec<Materialized>> {
        self.scope(None).all(query).await
    }

    /// Fetch at most one row; more than one is an error.
    pub async fn one(&self, query: &Query) -> DbResult<Option<Materialized>> {
        self.scope(None).one(query).await
    }

    pub async fn insert(&self, entity: &Entity) -> DbResult<Ack> {
        self.scope(None).insert(entity).await
    }

    pub async fn update(&self, entity: &Entity, filters: &[Filter]) -> DbResult<u64> {
        self.scope(None).update(entity, filters).await
    }

    pub async fn update_all(&self, query: &Query, changes: &[(String, Value)]) -> DbResult<u64> {
        self.scope(None).update_all(query, changes).await
    }

    pub async fn delete(&self, entity: &Entity, filters: &[Filter]) -> DbResult<u64> {
        self.scope(None).delete(entity, filters).await
    }

    pub async fn delete_all(&self, query: &Query) -> DbResult<u64> {
        self.scope(None).delete_all(query).await
    }

    /// Open a transaction on a dedicated connection.
    pub async fn begin(&self) -> DbResult<Transaction> {
        let task = TaskKey::generate();
        let router = self.executor.router();
        router.begin_transaction(&task, self.config.timeout).await?;

        if let Err(e) = self
            .execute(Some(&task), "BEGIN", &[], &QueryOptions::default())
            .await
        {
            if let Err(end_err) = router.end_transaction(&task).await {
                warn!(task = %task, error = %end_err, "Failed to release transaction connection");
            }
            return Err(e);
        }

        Ok(Transaction {
            repo: self.clone(),
            task,
            finished: false,
        })
    }

    /// Run `body` in a transaction: commit on `Ok`, roll back on `Err`.
    pub async fn transaction<R, F>(&self, body: F) -> DbResult<R>
    where
        F: for<'t> FnOnce(&'t Transaction) -> BoxFuture<'t, DbResult<R>>,
    {
        let tx = self.begin().await?;
        match body(&tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    fn builder(&self) -> DbResult<&dyn SqlBuilder> {
        self.builder
            .as_deref()
            .ok_or_else(|| DbError::invalid_input("No SQL builder installed on this repository"))
    }
}

impl std::fmt::Debug for Repo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repo")
            .field("config", &self.config)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

/// Repository operations bound to one routing context.
#[derive(Clone, Copy)]
struct Scope<'a> {
    repo: &'a Repo,
    task: Option<&'a TaskKey>,
}

impl Scope<'_> {
    async fn run(&self, (statement, params): Statement) -> DbResult<QueryOutcome> {
        self.repo
            .execute(self.task, &statement, &params, &QueryOptions::default())
            .await
    }

    async fn all(&self, query: &Query) -> DbResult<Vec<Materialized>> {
        let statement = self.repo.builder()?.select(query)?;
        let raw_rows = self.run(statement).await?.into_rows();
        let mut rows = materialize_rows(&query.select, raw_rows, &query.sources)?;

        if !query.assocs.is_empty() {
            let runner = self.repo.associations.as_ref().ok_or_else(|| {
                DbError::invalid_input("Query joins associations but no association runner is installed")
            })?;
            rows = runner.run(query, rows)?;
        }

        if !query.preloads.is_empty() && !rows.is_empty() {
            let preloader = self.repo.preloader.as_ref().ok_or_else(|| {
                DbError::invalid_input("Query declares preloads but no preloader is installed")
            })?;
            let position = query.select.entity_position().ok_or_else(|| {
                DbError::invalid_input("Preloads need an entity in the selection")
            })?;
            debug!(paths = query.preloads.len(), position, rows = rows.len(), "Running preloads");
            rows = preloader
                .run(self.repo, self.task, rows, &query.preloads, position)
                .await?;
        }

        Ok(rows)
    }

    async fn one(&self, query: &Query) -> DbResult<Option<Materialized>> {
        let mut rows = self.all(query).await?;
        match rows.len() {
            0 | 1 => Ok(rows.pop()),
            n => Err(DbError::invalid_input(format!(
                "Expected at most one result but got {n}"
            ))),
        }
    }

    async fn insert(&self, entity: &Entity) -> DbResult<Ack> {
        let statement = self.repo.builder()?.insert(entity)?;
        Ok(match self.run(statement).await? {
            QueryOutcome::Ack(ack) => ack,
            rows @ QueryOutcome::Rows(_) => Ack {
                inserted_id: None,
                affected_rows: Some(rows.affected_rows()),
            },
        })
    }

    async fn update(&self, entity: &Entity, filters: &[Filter]) -> DbResult<u64> {
        let statement = self.repo.builder()?.update(entity, filters)?;
        Ok(self.run(statement).await?.affected_rows())
    }

    async fn update_all(&self, query: &Query, changes: &[(String, Value)]) -> DbResult<u64> {
        let statement = self.repo.builder()?.update_all(query, changes)?;
        Ok(self.run(statement).await?.affected_rows())
    }

    async fn delete(&self, entity: &Entity, filters: &[Filter]) -> DbResult<u64> {
        let statement = self.repo.builder()?.delete(entity, filters)?;
        Ok(self.run(statement).await?.affected_rows())
    }

    async fn delete_all(&self, query: &Query) -> DbResult<u64> {
        let statement = self.repo.builder()?.delete_all(query)?;
        Ok(self.run(statement).await?.affected_rows())
    }
}

/// An open transaction. Every operation runs on the transaction's connection, in order.
///
/// Dropping a handle that was neither committed nor rolled back rolls it back in the
/// background.
pub struct Transaction {
    repo: Repo,
    task: TaskKey,
    finished: bool,
}

impl Transaction {
    pub fn task(&self) -> &TaskKey {
        &self.task
    }

    fn scope(&self) -> Scope<'_> {
        self.repo.scope(Some(&self.task))
    }

    pub async fn query(
        &self,
        statement: &str,
        params: &[QueryParam],
        opts: &QueryOptions,
    ) -> DbResult<QueryOutcome> {
        self.repo.execute(Some(&self.task), statement, params, opts).await
    }

    pub async fn all(&self, query: &Query) -> DbResult<Vec<Materialized>> {
        self.scope().all(query).await
    }

    pub async fn one(&self, query: &Query) -> DbResult<Option<Materialized>> {
        self.scope().one(query).await
    }

    pub async fn insert(&self, entity: &Entity) -> DbResult<Ack> {
        self.scope().insert(entity).await
    }

    pub async fn update(&self, entity: &Entity, filters: &[Filter]) -> DbResult<u64> {
        self.scope().update(entity, filters).await
    }

    pub async fn update_all(&self, query: &Query, changes: &[(String, Value)]) -> DbResult<u64> {
        self.scope().update_all(query, changes).await
    }

    pub async fn delete(&self, entity: &Entity, filters: &[Filter]) -> DbResult<u64> {
        self.scope().delete(entity, filters).await
    }

    pub async fn delete_all(&self, query: &Query) -> DbResult<u64> {
        self.scope().delete_all(query).await
    }

    /// Commit the transaction.
    ///
    /// If a failed statement retired the connection, nothing is committed: the connection
    /// is discarded, which rolls the transaction back, and an error is returned.
    pub async fn commit(mut self) -> DbResult<()> {
        self.finished = true;
        close_transaction(&self.repo, &self.task, true).await
    }

    pub async fn rollback(mut self) -> DbResult<()> {
        self.finished = true;
        close_transaction(&self.repo, &self.task, false).await
    }
}

/// Send COMMIT or ROLLBACK, then release the connection whatever the outcome.
///
/// A broken connection gets no closing statement; releasing discards it and the server
/// rolls the transaction back when the session ends.
async fn close_transaction(repo: &Repo, task: &TaskKey, commit: bool) -> DbResult<()> {
    let router = repo.executor.router();
    let statement = if commit { "COMMIT" } else { "ROLLBACK" };

    let result = if router.is_broken(task).await {
        warn!(task = %task, statement, "Transaction connection is broken, discarding it");
        if commit {
            Err(DbError::transaction(
                "Transaction connection was broken by a failed statement; rolled back instead of committing",
                task.as_str(),
            ))
        } else {
            Ok(())
        }
    } else {
        repo.execute(Some(task), statement, &[], &QueryOptions::default())
            .await
            .map(|_| ())
    };
    let released = router.end_transaction(task).await;

    info!(task = %task, statement, ok = result.is_ok(), "Transaction finished");
    result?;
    released
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        warn!(task = %self.task, "Transaction dropped while open, rolling back");
        let repo = self.repo.clone();
        let task = self.task.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = close_transaction(&repo, &task, false).await {
                        warn!(task = %task, error = %e, "Background rollback failed");
                    }
                });
            }
            Err(_) => {
                warn!(task = %task, "No async runtime available; transaction connection stays held");
            }
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("task", &self.task)
            .field("finished", &self.finished)
            .finish()
    }
}
