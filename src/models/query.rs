//! Query-related data models.
//!
//! This module defines bind parameters, execution options, driver outcomes, and the
//! query description handed to the SQL builder.

use crate::models::{RawValue, Shape, SourceTable, Value};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default query timeout in milliseconds.
pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 5000;

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Unsigned values above `i64::MAX`
    UInt(u64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
    /// Arbitrary JSON document
    Json(JsonValue),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::UInt(_) => "uint",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
        }
    }

    /// Build a parameter from a JSON literal (used by the CLI `--param` flag).
    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(v) => Self::Bool(v),
            JsonValue::Number(n) => match (n.as_i64(), n.as_u64(), n.as_f64()) {
                (Some(v), _, _) => Self::Int(v),
                (None, Some(v), _) => Self::UInt(v),
                (_, _, Some(v)) => Self::Float(v),
                _ => Self::String(n.to_string()),
            },
            JsonValue::String(v) => Self::String(v),
            other => Self::Json(other),
        }
    }
}

/// Bind a domain value back to the server.
impl From<&Value> for QueryParam {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(v) => Self::Bool(*v),
            Value::Int(v) => Self::Int(*v),
            Value::UInt(v) => Self::UInt(*v),
            Value::Float(v) => Self::Float(*v),
            Value::Decimal(v) | Value::Text(v) => Self::String(v.clone()),
            Value::Bytes(v) => Self::Bytes(v.clone()),
            Value::Json(v) => Self::Json(v.clone()),
            // MySQL parses this literal for DATETIME columns, zero dates included
            Value::DateTime(dt) => Self::String(format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                dt.year, dt.month, dt.day, dt.hour, dt.minute, dt.second
            )),
        }
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Upper bound for a checkout or a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TimeoutRepr", into = "TimeoutRepr")]
pub enum QueryTimeout {
    Finite(Duration),
    /// No bound (`infinity`)
    Infinite,
}

impl QueryTimeout {
    pub fn from_millis(ms: u64) -> Self {
        Self::Finite(Duration::from_millis(ms))
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::Finite(d) => Some(*d),
            Self::Infinite => None,
        }
    }
}

impl Default for QueryTimeout {
    fn default() -> Self {
        Self::from_millis(DEFAULT_QUERY_TIMEOUT_MS)
    }
}

impl fmt::Display for QueryTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Finite(d) => write!(f, "{}", d.as_millis()),
            Self::Infinite => write!(f, "infinity"),
        }
    }
}

impl FromStr for QueryTimeout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("infinity") {
            return Ok(Self::Infinite);
        }
        s.parse::<u64>()
            .map(Self::from_millis)
            .map_err(|_| format!("Invalid timeout '{s}': expected milliseconds or 'infinity'"))
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum TimeoutRepr {
    Millis(u64),
    Text(String),
}

impl TryFrom<TimeoutRepr> for QueryTimeout {
    type Error = String;

    fn try_from(repr: TimeoutRepr) -> Result<Self, Self::Error> {
        match repr {
            TimeoutRepr::Millis(ms) => Ok(Self::from_millis(ms)),
            TimeoutRepr::Text(s) => s.parse(),
        }
    }
}

impl From<QueryTimeout> for TimeoutRepr {
    fn from(timeout: QueryTimeout) -> Self {
        match timeout {
            QueryTimeout::Finite(d) => TimeoutRepr::Millis(d.as_millis() as u64),
            QueryTimeout::Infinite => TimeoutRepr::Text("infinity".to_string()),
        }
    }
}

/// Per-call execution options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Overrides the repository's configured timeout
    pub timeout: Option<QueryTimeout>,
}

impl QueryOptions {
    pub fn with_timeout(timeout: QueryTimeout) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// Rows returned by a statement, in select-list column order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<RawValue>>,
}

/// Acknowledgement for a statement that returns no rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ack {
    pub inserted_id: Option<u64>,
    pub affected_rows: Option<u64>,
}

/// What the driver answers for one statement.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Rows(RowSet),
    Ack(Ack),
}

impl QueryOutcome {
    pub fn row_count(&self) -> usize {
        match self {
            Self::Rows(set) => set.rows.len(),
            Self::Ack(_) => 0,
        }
    }

    /// Rows of a `Rows` outcome; an acknowledgement has none.
    pub fn into_rows(self) -> Vec<Vec<RawValue>> {
        match self {
            Self::Rows(set) => set.rows,
            Self::Ack(_) => Vec::new(),
        }
    }

    pub fn affected_rows(&self) -> u64 {
        match self {
            Self::Rows(set) => set.rows.len() as u64,
            Self::Ack(ack) => ack.affected_rows.unwrap_or(0),
        }
    }
}

/// A chain of association fields, e.g. `["comments", "author"]`.
pub type FieldPath = Vec<String>;

/// Equality condition on a field of the query's first source.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub value: Value,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// A query description as handed to the SQL builder.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub sources: Vec<SourceTable>,
    pub select: Shape,
    pub filters: Vec<Filter>,
    /// Association fields joined in the statement itself
    pub assocs: Vec<FieldPath>,
    /// Association fields fetched after the main query
    pub preloads: Vec<FieldPath>,
}

impl Query {
    /// Select every field of one table.
    pub fn from(source: SourceTable) -> Self {
        Self {
            sources: vec![source],
            select: Shape::Entity(0),
            filters: Vec::new(),
            assocs: Vec::new(),
            preloads: Vec::new(),
        }
    }

    pub fn select(mut self, shape: Shape) -> Self {
        self.select = shape;
        self
    }

    pub fn join(mut self, source: SourceTable) -> Self {
        self.sources.push(source);
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn assoc<I, S>(mut self, path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.assocs.push(path.into_iter().map(Into::into).collect());
        self
    }

    pub fn preload<I, S>(mut self, path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.preloads.push(path.into_iter().map(Into::into).collect());
        self
    }

    /// The query's primary source table.
    pub fn source(&self) -> Option<&SourceTable> {
        self.sources.first()
    }
}
