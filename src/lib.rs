//! MySQL Repository Runtime Library
//!
//! This library provides the runtime core of a MySQL data-access layer: a bounded
//! connection pool with transaction affinity, a query executor, a materializer that
//! rebuilds nested results from flat rows, and a schema migration ledger.

pub mod config;
pub mod db;
pub mod error;
pub mod migration;
pub mod models;
pub mod repo;
pub mod storage;

pub use config::{Config, RepoConfig};
pub use error::{DbError, DbResult};
pub use migration::{MigrationLedger, MigrationOutcome};
pub use repo::{AssociationRunner, Preloader, Repo, SqlBuilder, Transaction};
pub use storage::{StorageManager, StorageOutcome};
