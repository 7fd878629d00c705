//! Driver seam.
//!
//! The pool knows nothing about SQL: it only opens, hands out and closes
//! [`DriverConnection`]s through a [`Connector`]. The MySQL implementation lives in
//! [`super::mysql`]; [`super::mock`] provides an in-memory one for tests.

use crate::error::DbResult;
use crate::models::{QueryOutcome, QueryParam};
use async_trait::async_trait;

/// Opens new live sessions for the pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> DbResult<Box<dyn DriverConnection>>;
}

/// One live database session.
///
/// Never shared: the pool guarantees a single in-flight operation per connection.
#[async_trait]
pub trait DriverConnection: Send + 'static {
    /// Run one statement with positional parameters.
    async fn execute(&mut self, statement: &str, params: &[QueryParam])
    -> DbResult<QueryOutcome>;

    /// Terminate the session gracefully.
    async fn close(self: Box<Self>) -> DbResult<()>;
}
