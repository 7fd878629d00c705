//! Result materialization.
//!
//! Walks a [`Shape`] in lock-step with one flat row and rebuilds the nested value the query
//! asked for. The row is consumed front to back exactly once, in select-list order; every
//! value is normalized on the way in.
//!
//! A row whose length disagrees with its shape means the statement and the shape were
//! built inconsistently. That is a bug in the caller, reported as
//! [`DbError::ShapeMismatch`] rather than as a data condition.

use crate::db::normalize::normalize;
use crate::error::{DbError, DbResult};
use crate::models::{Entity, Materialized, RawValue, Shape, SourceTable, Value};
use tracing::error;

type Row = std::vec::IntoIter<RawValue>;

/// Materialize a row that must be consumed completely by `shape`.
pub fn materialize_row(
    shape: &Shape,
    row: Vec<RawValue>,
    sources: &[SourceTable],
) -> DbResult<Materialized> {
    let row_len = row.len();
    let (value, rest) = materialize_partial(shape, row, sources)?;
    if !rest.is_empty() {
        return Err(mismatch(format!(
            "row has {row_len} columns but the selection consumed {}",
            row_len - rest.len()
        )));
    }
    Ok(value)
}

/// Materialize the front of `row` and return the unconsumed remainder.
pub fn materialize_partial(
    shape: &Shape,
    row: Vec<RawValue>,
    sources: &[SourceTable],
) -> DbResult<(Materialized, Vec<RawValue>)> {
    let mut values = row.into_iter();
    let value = consume(shape, &mut values, sources)?;
    Ok((value, values.collect()))
}

/// Materialize every row of a result set.
pub fn materialize_rows(
    shape: &Shape,
    rows: Vec<Vec<RawValue>>,
    sources: &[SourceTable],
) -> DbResult<Vec<Materialized>> {
    rows.into_iter()
        .map(|row| materialize_row(shape, row, sources))
        .collect()
}

fn consume(shape: &Shape, row: &mut Row, sources: &[SourceTable]) -> DbResult<Materialized> {
    match shape {
        Shape::Scalar => row
            .next()
            .map(|raw| Materialized::Scalar(normalize(raw)))
            .ok_or_else(|| mismatch("row ended before a scalar column")),
        Shape::Entity(index) => consume_entity(*index, row, sources),
        Shape::Tuple(children) => consume_all(children, row, sources).map(Materialized::Tuple),
        Shape::Compound(children) => {
            consume_all(children, row, sources).map(Materialized::Compound)
        }
        Shape::List(children) => consume_all(children, row, sources).map(Materialized::List),
    }
}

fn consume_all(
    children: &[Shape],
    row: &mut Row,
    sources: &[SourceTable],
) -> DbResult<Vec<Materialized>> {
    children
        .iter()
        .map(|child| consume(child, row, sources))
        .collect()
}

/// Take one source's `k` fields off the row. All-null means an unmatched outer join.
fn consume_entity(index: usize, row: &mut Row, sources: &[SourceTable]) -> DbResult<Materialized> {
    let source = sources
        .get(index)
        .ok_or_else(|| mismatch(format!("selection references unknown source #{index}")))?;

    let k = source.field_count();
    let values: Vec<Value> = row.by_ref().take(k).map(normalize).collect();
    if values.len() < k {
        return Err(mismatch(format!(
            "row ended inside entity '{}': expected {k} fields, found {}",
            source.name,
            values.len()
        )));
    }

    if values.iter().all(Value::is_null) {
        return Ok(Materialized::Entity(None));
    }

    Ok(Materialized::Entity(Some(Entity {
        source: source.name.clone(),
        fields: source.fields.iter().cloned().zip(values).collect(),
    })))
}

fn mismatch(message: impl Into<String>) -> DbError {
    let message = message.into();
    error!(%message, "Selection shape does not match the result row");
    DbError::shape_mismatch(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DateTime;

    fn users() -> Vec<SourceTable> {
        vec![SourceTable::new("users", ["id", "name", "born_at"])]
    }

    #[test]
    fn test_partial_returns_remainder() {
        let (value, rest) = materialize_partial(
            &Shape::Scalar,
            vec![RawValue::Int(1), RawValue::Int(2)],
            &[],
        )
        .unwrap();
        assert_eq!(value, Materialized::Scalar(Value::Int(1)));
        assert_eq!(rest, vec![RawValue::Int(2)]);
    }

    #[test]
    fn test_entity_fields_are_normalized() {
        let row = vec![
            RawValue::Int(7),
            RawValue::Undefined,
            RawValue::DateTime(((1990, 5, 17), (6, 0, 0))),
        ];
        let value = materialize_row(&Shape::Entity(0), row, &users()).unwrap();
        let entity = value.as_entity().unwrap();
        assert_eq!(entity.source, "users");
        assert_eq!(entity.get("name"), Some(&Value::Null));
        assert_eq!(
            entity.get("born_at"),
            Some(&Value::DateTime(DateTime::from(((1990, 5, 17), (6, 0, 0)))))
        );
    }

    #[test]
    fn test_partially_null_entity_is_present() {
        let row = vec![RawValue::Undefined, RawValue::Text("x".into()), RawValue::Undefined];
        let value = materialize_row(&Shape::Entity(0), row, &users()).unwrap();
        assert!(value.as_entity().is_some());
    }

    #[test]
    fn test_leftover_columns_rejected() {
        let err = materialize_row(
            &Shape::Scalar,
            vec![RawValue::Int(1), RawValue::Int(2)],
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, DbError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_short_row_rejected() {
        let err = materialize_row(&Shape::Entity(0), vec![RawValue::Int(1)], &users()).unwrap_err();
        assert!(err.to_string().contains("expected 3 fields, found 1"));
    }

    #[test]
    fn test_unknown_source_rejected() {
        let err = materialize_row(&Shape::Entity(3), vec![RawValue::Int(1)], &users()).unwrap_err();
        assert!(matches!(err, DbError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_compound_keeps_grouping() {
        let shape = Shape::Compound(vec![Shape::Entity(0), Shape::List(vec![Shape::Scalar])]);
        let row = vec![
            RawValue::Undefined,
            RawValue::Undefined,
            RawValue::Undefined,
            RawValue::Text("tag".into()),
        ];
        let value = materialize_row(&shape, row, &users()).unwrap();
        assert_eq!(
            value,
            Materialized::Compound(vec![
                Materialized::Entity(None),
                Materialized::List(vec![Materialized::Scalar(Value::Text("tag".into()))]),
            ])
        );
    }

    #[test]
    fn test_materialize_rows_stops_at_first_mismatch() {
        let rows = vec![vec![RawValue::Int(1)], vec![]];
        assert!(materialize_rows(&Shape::Scalar, rows, &[]).is_err());
    }
}
