//! Value normalization: driver-native scalars to domain scalars.
//!
//! - the absent-value sentinel becomes [`Value::Null`]
//! - the native `((y, m, d), (h, mi, s))` pair becomes [`Value::DateTime`]
//! - everything else passes through unchanged
//!
//! [`normalize`] accepts anything convertible into a [`Value`], a `Value` included, so
//! normalizing an already-normalized value returns it unchanged.

use crate::models::{DateTime, RawValue, Value};

impl From<RawValue> for Value {
    fn from(raw: RawValue) -> Self {
        match raw {
            RawValue::Undefined => Value::Null,
            RawValue::DateTime(native) => Value::DateTime(DateTime::from(native)),
            RawValue::Bool(v) => Value::Bool(v),
            RawValue::Int(v) => Value::Int(v),
            RawValue::UInt(v) => Value::UInt(v),
            RawValue::Float(v) => Value::Float(v),
            RawValue::Decimal(v) => Value::Decimal(v),
            RawValue::Text(v) => Value::Text(v),
            RawValue::Bytes(v) => Value::Bytes(v),
            RawValue::Json(v) => Value::Json(v),
        }
    }
}

/// Map one scalar into the domain representation.
pub fn normalize(value: impl Into<Value>) -> Value {
    value.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_becomes_null() {
        assert_eq!(normalize(RawValue::Undefined), Value::Null);
    }

    #[test]
    fn test_native_datetime_decomposed() {
        let value = normalize(RawValue::DateTime(((2023, 6, 30), (23, 59, 1))));
        match value {
            Value::DateTime(dt) => {
                assert_eq!((dt.year, dt.month, dt.day), (2023, 6, 30));
                assert_eq!((dt.hour, dt.minute, dt.second), (23, 59, 1));
            }
            other => panic!("expected a date-time, got {other:?}"),
        }
    }

    #[test]
    fn test_other_values_pass_through() {
        assert_eq!(normalize(RawValue::Int(-4)), Value::Int(-4));
        assert_eq!(
            normalize(RawValue::Decimal("10.50".into())),
            Value::Decimal("10.50".into())
        );
        assert_eq!(
            normalize(RawValue::Bytes(vec![0, 1])),
            Value::Bytes(vec![0, 1])
        );
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let samples = [
            RawValue::Undefined,
            RawValue::DateTime(((0, 0, 0), (0, 0, 0))),
            RawValue::Text("x".into()),
            RawValue::Float(1.5),
        ];
        for raw in samples {
            let once = normalize(raw);
            assert_eq!(normalize(once.clone()), once);
            // Lifting back and normalizing again also lands on the same value
            assert_eq!(normalize(RawValue::from(once.clone())), once);
        }
    }
}
