//! MySQL column decoding.
//!
//! Maps each column of a [`MySqlRow`] to a driver-native [`RawValue`].
//!
//! # Architecture
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies column types into logical categories
//! 2. Category-specific decoders handle the actual value extraction
//!
//! SQL NULL is detected once, before classification, and always becomes the absent-value
//! sentinel [`RawValue::Undefined`].

use crate::error::{DbError, DbResult};
use crate::models::{NativeDateTime, RawValue};
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::{Column, Decode, Row, Type, TypeInfo, ValueRef};

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for MySQL column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    UnsignedInteger,
    Float,
    Decimal,
    Boolean,
    DateTime,
    Date,
    Time,
    Text,
    Binary,
    Json,
}

/// Classify a MySQL type name (as reported by the driver) into a logical category.
pub fn categorize_type(type_name: &str) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Decimal/Numeric - check first as it overlaps with "numeric" in float checks
    if lower.contains("decimal") || lower.contains("numeric") {
        return TypeCategory::Decimal;
    }

    // TINYINT(1) is reported as BOOLEAN
    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    if lower.contains("int") || lower == "year" {
        if lower.contains("unsigned") {
            return TypeCategory::UnsignedInteger;
        }
        return TypeCategory::Integer;
    }

    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }

    if lower == "datetime" || lower == "timestamp" {
        return TypeCategory::DateTime;
    }
    if lower == "date" {
        return TypeCategory::Date;
    }
    if lower == "time" {
        return TypeCategory::Time;
    }

    if lower == "json" {
        return TypeCategory::Json;
    }

    if lower.contains("blob") || lower.contains("binary") || lower == "bit" || lower == "geometry"
    {
        return TypeCategory::Binary;
    }

    // Default to text for everything else (varchar, text, char, enum, set, ...)
    TypeCategory::Text
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// Wrapper type for raw DECIMAL values as strings.
/// This preserves the exact database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

// =============================================================================
// Row Decoding
// =============================================================================

/// Column names of a row, in select-list order.
pub fn column_names(row: &MySqlRow) -> Vec<String> {
    row.columns().iter().map(|c| c.name().to_string()).collect()
}

/// Decode every column of a row, in select-list order.
pub fn decode_row(row: &MySqlRow) -> DbResult<Vec<RawValue>> {
    (0..row.len()).map(|idx| decode_column(row, idx)).collect()
}

/// Decode one column.
pub fn decode_column(row: &MySqlRow, idx: usize) -> DbResult<RawValue> {
    if row.try_get_raw(idx)?.is_null() {
        return Ok(RawValue::Undefined);
    }

    let type_name = row.column(idx).type_info().name();
    let value = match categorize_type(type_name) {
        TypeCategory::Decimal => RawValue::Decimal(row.try_get::<RawDecimal, _>(idx)?.0),
        TypeCategory::Integer => decode_integer(row, idx)?,
        TypeCategory::UnsignedInteger => decode_unsigned(row, idx)?,
        TypeCategory::Boolean => RawValue::Bool(row.try_get::<bool, _>(idx)?),
        TypeCategory::Float => decode_float(row, idx)?,
        TypeCategory::DateTime => decode_datetime(row, idx)?,
        TypeCategory::Date => decode_date(row, idx)?,
        TypeCategory::Time => decode_time(row, idx)?,
        TypeCategory::Json => RawValue::Json(row.try_get::<serde_json::Value, _>(idx)?),
        TypeCategory::Binary => RawValue::Bytes(row.try_get::<Vec<u8>, _>(idx)?),
        TypeCategory::Text => decode_text(row, idx)?,
    };
    Ok(value)
}

fn decode_integer(row: &MySqlRow, idx: usize) -> DbResult<RawValue> {
    match row.try_get::<i64, _>(idx) {
        Ok(v) => Ok(RawValue::Int(v)),
        // YEAR and some legacy widths only decode as unsigned
        Err(_) => decode_unsigned(row, idx),
    }
}

fn decode_unsigned(row: &MySqlRow, idx: usize) -> DbResult<RawValue> {
    let v = row.try_get::<u64, _>(idx)?;
    Ok(i64::try_from(v).map_or(RawValue::UInt(v), RawValue::Int))
}

fn decode_float(row: &MySqlRow, idx: usize) -> DbResult<RawValue> {
    if let Ok(v) = row.try_get::<f64, _>(idx) {
        return Ok(RawValue::Float(v));
    }
    Ok(RawValue::Float(row.try_get::<f32, _>(idx)? as f64))
}

/// DATETIME and TIMESTAMP decode to the native `((y, m, d), (h, mi, s))` pair.
///
/// Zero and partial dates (`0000-00-00 00:00:00`) do not fit chrono; they are read from
/// the raw column bytes instead.
fn decode_datetime(row: &MySqlRow, idx: usize) -> DbResult<RawValue> {
    if let Ok(dt) = row.try_get::<NaiveDateTime, _>(idx) {
        return Ok(RawValue::DateTime((
            (dt.year(), dt.month(), dt.day()),
            (dt.hour(), dt.minute(), dt.second()),
        )));
    }
    let bytes = row.try_get_unchecked::<&[u8], _>(idx)?;
    native_datetime_from_bytes(bytes)
        .map(RawValue::DateTime)
        .ok_or_else(|| DbError::internal(format!("Unreadable date-time value in column {idx}")))
}

fn decode_date(row: &MySqlRow, idx: usize) -> DbResult<RawValue> {
    if let Ok(date) = row.try_get::<NaiveDate, _>(idx) {
        return Ok(RawValue::Text(date.format("%Y-%m-%d").to_string()));
    }
    let bytes = row.try_get_unchecked::<&[u8], _>(idx)?;
    let ((year, month, day), _) = native_datetime_from_bytes(bytes)
        .ok_or_else(|| DbError::internal(format!("Unreadable date value in column {idx}")))?;
    Ok(RawValue::Text(format!("{year:04}-{month:02}-{day:02}")))
}

fn decode_time(row: &MySqlRow, idx: usize) -> DbResult<RawValue> {
    if let Ok(time) = row.try_get::<NaiveTime, _>(idx) {
        return Ok(RawValue::Text(time.format("%H:%M:%S").to_string()));
    }
    // Negative or > 24h intervals do not fit NaiveTime
    let bytes = row.try_get_unchecked::<&[u8], _>(idx)?;
    time_text_from_bytes(bytes)
        .map(RawValue::Text)
        .ok_or_else(|| DbError::internal(format!("Unreadable time value in column {idx}")))
}

/// Parse a DATE, DATETIME or TIMESTAMP column in either wire format.
///
/// Text values start with a digit (`2024-02-29 12:00:00.5`); binary values start with
/// their payload length (0, 4, 7 or 11) followed by little-endian year, month, day and
/// optional hour, minute, second.
fn native_datetime_from_bytes(bytes: &[u8]) -> Option<NativeDateTime> {
    match bytes.first() {
        Some(b) if b.is_ascii_digit() => parse_datetime_text(std::str::from_utf8(bytes).ok()?),
        Some(&len) => {
            let data = bytes.get(1..1 + usize::from(len))?;
            if data.is_empty() {
                return Some(((0, 0, 0), (0, 0, 0)));
            }
            let [lo, hi, month, day] = <[u8; 4]>::try_from(data.get(..4)?).ok()?;
            let (hour, minute, second) = match data.get(4..7) {
                Some(&[h, m, s]) => (h, m, s),
                _ => (0, 0, 0),
            };
            Some((
                (i32::from(u16::from_le_bytes([lo, hi])), month.into(), day.into()),
                (hour.into(), minute.into(), second.into()),
            ))
        }
        None => None,
    }
}

fn parse_datetime_text(text: &str) -> Option<NativeDateTime> {
    let text = text.trim();
    let (date, time) = text.split_once(' ').unwrap_or((text, "00:00:00"));

    let mut date = date.split('-').map(str::parse::<u32>);
    let year = i32::try_from(date.next()?.ok()?).ok()?;
    let month = date.next()?.ok()?;
    let day = date.next()?.ok()?;

    let whole_seconds = time.split('.').next()?;
    let mut time = whole_seconds.split(':').map(str::parse::<u32>);
    let hour = time.next()?.ok()?;
    let minute = time.next()?.ok()?;
    let second = time.next()?.ok()?;

    Some(((year, month, day), (hour, minute, second)))
}

/// Render a TIME column as `[-]H:MM:SS` from either wire format.
///
/// Binary values are a length byte, a sign byte, little-endian days, then hour, minute
/// and second.
fn time_text_from_bytes(bytes: &[u8]) -> Option<String> {
    match bytes.first() {
        Some(b) if b.is_ascii_digit() || *b == b'-' => {
            let text = std::str::from_utf8(bytes).ok()?;
            Some(text.split('.').next()?.to_string())
        }
        Some(&len) => {
            let data = bytes.get(1..1 + usize::from(len))?;
            if data.is_empty() {
                return Some("00:00:00".to_string());
            }
            let [negative, d0, d1, d2, d3, hour, minute, second] =
                <[u8; 8]>::try_from(data.get(..8)?).ok()?;
            let hours = u64::from(u32::from_le_bytes([d0, d1, d2, d3])) * 24 + u64::from(hour);
            let sign = if negative == 1 { "-" } else { "" };
            Some(format!("{sign}{hours:02}:{minute:02}:{second:02}"))
        }
        None => None,
    }
}

fn decode_text(row: &MySqlRow, idx: usize) -> DbResult<RawValue> {
    match row.try_get::<String, _>(idx) {
        Ok(v) => Ok(RawValue::Text(v)),
        Err(_) => Ok(RawValue::Bytes(row.try_get::<Vec<u8>, _>(idx)?)),
    }
}
