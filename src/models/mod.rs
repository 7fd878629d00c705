//! Data models for the repository runtime.
//!
//! This module re-exports all model types used throughout the crate.

pub mod query;
pub mod shape;
pub mod value;

// Re-export commonly used types
pub use query::{
    Ack, DEFAULT_QUERY_TIMEOUT_MS, FieldPath, Filter, Query, QueryOptions, QueryOutcome,
    QueryParam, QueryTimeout, RowSet,
};
pub use shape::{Entity, Materialized, Shape, SourceTable};
pub use value::{DateTime, NativeDateTime, RawValue, Value};
