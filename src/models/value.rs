//! Scalar value models.
//!
//! Two layers of scalars exist:
//! - [`RawValue`]: what the driver decodes off the wire, including its absent-value
//!   sentinel and its native nested date-time pair.
//! - [`Value`]: the domain scalar every materialized row is built from.
//!
//! The mapping between them lives in [`crate::db::normalize`].

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use serde::{Serialize, Serializer};
use serde_json::Value as JsonValue;
use std::fmt;

/// Driver-native date-time: `((year, month, day), (hour, minute, second))`.
pub type NativeDateTime = ((i32, u32, u32), (u32, u32, u32));

/// A scalar exactly as the driver decoded it.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    /// The driver's absent-value sentinel (SQL NULL).
    Undefined,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    /// Exact DECIMAL text as sent by the server
    Decimal(String),
    Text(String),
    Bytes(Vec<u8>),
    Json(JsonValue),
    DateTime(NativeDateTime),
}

/// Domain date-time with the six fields of the native representation.
///
/// MySQL accepts dates chrono cannot represent (e.g. `0000-00-00 00:00:00`), so the
/// fields are kept as-is and [`DateTime::to_naive`] is fallible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DateTime {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

impl DateTime {
    pub fn to_naive(&self) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(self.year, self.month, self.day)?.and_hms_opt(
            self.hour,
            self.minute,
            self.second,
        )
    }

    /// The driver-native nested pair for this date-time.
    pub fn to_native(&self) -> NativeDateTime {
        (
            (self.year, self.month, self.day),
            (self.hour, self.minute, self.second),
        )
    }
}

impl From<NativeDateTime> for DateTime {
    fn from(((year, month, day), (hour, minute, second)): NativeDateTime) -> Self {
        Self {
            year,
            month,
            day,
            hour,
            minute,
            second,
        }
    }
}

impl From<NaiveDateTime> for DateTime {
    fn from(dt: NaiveDateTime) -> Self {
        Self {
            year: dt.year(),
            month: dt.month(),
            day: dt.day(),
            hour: dt.hour(),
            minute: dt.minute(),
            second: dt.second(),
        }
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

impl Serialize for DateTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A normalized scalar.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Decimal(String),
    Text(String),
    #[serde(serialize_with = "serialize_base64")]
    Bytes(Vec<u8>),
    Json(JsonValue),
    DateTime(DateTime),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Integer view of this value, if it holds one that fits in an `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::UInt(v) => i64::try_from(*v).ok(),
            Self::Decimal(v) => v.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) | Self::Decimal(v) => Some(v),
            _ => None,
        }
    }

    /// Get the type name of this value for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::UInt(_) => "uint",
            Self::Float(_) => "float",
            Self::Decimal(_) => "decimal",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
            Self::DateTime(_) => "datetime",
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<DateTime> for Value {
    fn from(v: DateTime) -> Self {
        Self::DateTime(v)
    }
}

/// Lift a domain value back into its driver-native form.
impl From<Value> for RawValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => RawValue::Undefined,
            Value::Bool(v) => RawValue::Bool(v),
            Value::Int(v) => RawValue::Int(v),
            Value::UInt(v) => RawValue::UInt(v),
            Value::Float(v) => RawValue::Float(v),
            Value::Decimal(v) => RawValue::Decimal(v),
            Value::Text(v) => RawValue::Text(v),
            Value::Bytes(v) => RawValue::Bytes(v),
            Value::Json(v) => RawValue::Json(v),
            Value::DateTime(v) => RawValue::DateTime(v.to_native()),
        }
    }
}

fn serialize_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datetime_from_native_pair() {
        let dt = DateTime::from(((2024, 2, 29), (13, 5, 9)));
        assert_eq!(dt.year, 2024);
        assert_eq!(dt.second, 9);
        assert_eq!(dt.to_string(), "2024-02-29T13:05:09");
        assert_eq!(dt.to_native(), ((2024, 2, 29), (13, 5, 9)));
    }

    #[test]
    fn test_zero_date_has_no_naive_form() {
        let dt = DateTime::from(((0, 0, 0), (0, 0, 0)));
        assert!(dt.to_naive().is_none());
    }

    #[test]
    fn test_naive_round_trip() {
        let naive = NaiveDate::from_ymd_opt(2023, 1, 1)
            .unwrap()
            .and_hms_opt(8, 30, 0)
            .unwrap();
        assert_eq!(DateTime::from(naive).to_naive(), Some(naive));
    }

    #[test]
    fn test_value_serializes_to_json() {
        assert_eq!(serde_json::to_value(Value::Null).unwrap(), JsonValue::Null);
        assert_eq!(serde_json::to_value(Value::Int(7)).unwrap(), serde_json::json!(7));
        assert_eq!(
            serde_json::to_value(Value::Bytes(b"hello world".to_vec())).unwrap(),
            serde_json::json!("aGVsbG8gd29ybGQ=")
        );
        assert_eq!(
            serde_json::to_value(Value::DateTime(DateTime::from(((2020, 1, 2), (3, 4, 5)))))
                .unwrap(),
            serde_json::json!("2020-01-02T03:04:05")
        );
    }

    #[test]
    fn test_as_i64() {
        assert_eq!(Value::Int(-3).as_i64(), Some(-3));
        assert_eq!(Value::UInt(20230101).as_i64(), Some(20230101));
        assert_eq!(Value::UInt(u64::MAX).as_i64(), None);
        assert_eq!(Value::Decimal("42".into()).as_i64(), Some(42));
        assert_eq!(Value::Text("42".into()).as_i64(), None);
    }
}
