//! Database layer.
//!
//! This module provides the repository runtime's database machinery:
//! - Driver seam and its MySQL and in-memory implementations
//! - Connection pool management
//! - Transaction-affinity routing
//! - Query execution
//! - Value normalization and result materialization

pub mod driver;
pub mod executor;
pub mod materialize;
pub mod mock;
pub mod mysql;
pub mod normalize;
pub(crate) mod params;
pub mod pool;
pub mod transaction_registry;
pub mod types;

pub use driver::{Connector, DriverConnection};
pub use executor::{QueryExecutor, QueryLogEntry, QueryLogger, TracingQueryLogger};
pub use materialize::{materialize_partial, materialize_row, materialize_rows};
pub use mysql::MySqlConnector;
pub use normalize::normalize;
pub use pool::{Connection, ConnectionPool, PoolStatus, PooledConnection};
pub use transaction_registry::{
    ConnectionLease, TaskKey, TransactionMetadata, TransactionRegistry,
};
