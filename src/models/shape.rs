//! Selection shapes and materialized results.
//!
//! A [`Shape`] describes what a query asked for; the materializer walks it in lock-step
//! with a flat row and produces a [`Materialized`] tree of the same structure.

use crate::models::Value;
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

/// A table a query selects from, with its fields in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTable {
    pub name: String,
    pub fields: Vec<String>,
}

impl SourceTable {
    pub fn new<I, S>(name: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }
}

/// What one query selects, as a tree over the columns of its select list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    /// One column.
    Scalar,
    /// An explicitly declared tuple.
    Tuple(Vec<Shape>),
    /// Every field of `sources[index]`, in declaration order.
    Entity(usize),
    /// Structural grouping with no tuple or entity meaning, re-assembled as-is.
    Compound(Vec<Shape>),
    /// An ordered list of shapes.
    List(Vec<Shape>),
}

impl Shape {
    /// Number of columns this shape consumes, or `None` if it references a missing source.
    pub fn width(&self, sources: &[SourceTable]) -> Option<usize> {
        match self {
            Shape::Scalar => Some(1),
            Shape::Entity(index) => sources.get(*index).map(SourceTable::field_count),
            Shape::Tuple(children) | Shape::Compound(children) | Shape::List(children) => children
                .iter()
                .try_fold(0, |acc, child| Some(acc + child.width(sources)?)),
        }
    }

    /// Position of the entity preloads attach to.
    ///
    /// An entity shape is its own position 0; for groupings it is the index of the first
    /// top-level child that is an entity.
    pub fn entity_position(&self) -> Option<usize> {
        match self {
            Shape::Entity(_) => Some(0),
            Shape::Tuple(children) | Shape::Compound(children) | Shape::List(children) => children
                .iter()
                .position(|child| matches!(child, Shape::Entity(_))),
            Shape::Scalar => None,
        }
    }
}

/// A record of one source table, built from a row.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub source: String,
    /// Field name and value pairs in declaration order
    pub fields: Vec<(String, Value)>,
}

impl Entity {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value)
    }

    /// Replace a field's value, appending it if the entity does not have it yet.
    pub fn set(&mut self, field: &str, value: Value) {
        match self.fields.iter_mut().find(|(name, _)| name == field) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((field.to_string(), value)),
        }
    }
}

impl Serialize for Entity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// The nested value produced for one row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Materialized {
    Scalar(Value),
    Tuple(Vec<Materialized>),
    /// `None` when every column of the entity was NULL (an unmatched outer join).
    Entity(Option<Entity>),
    Compound(Vec<Materialized>),
    List(Vec<Materialized>),
}

impl Materialized {
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            Materialized::Scalar(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            Materialized::Entity(entity) => entity.as_ref(),
            _ => None,
        }
    }

    /// Children of a tuple, compound or list.
    pub fn elements(&self) -> Option<&[Materialized]> {
        match self {
            Materialized::Tuple(items)
            | Materialized::Compound(items)
            | Materialized::List(items) => Some(items),
            _ => None,
        }
    }

    /// The entity at `position`, following [`Shape::entity_position`].
    pub fn entity_at(&self, position: usize) -> Option<&Entity> {
        match self {
            Materialized::Entity(entity) if position == 0 => entity.as_ref(),
            _ => self.elements()?.get(position)?.as_entity(),
        }
    }

    pub fn entity_at_mut(&mut self, position: usize) -> Option<&mut Entity> {
        match self {
            Materialized::Entity(entity) if position == 0 => entity.as_mut(),
            Materialized::Entity(_) | Materialized::Scalar(_) => None,
            Materialized::Tuple(items)
            | Materialized::Compound(items)
            | Materialized::List(items) => match items.get_mut(position)? {
                Materialized::Entity(entity) => entity.as_mut(),
                _ => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sources() -> Vec<SourceTable> {
        vec![
            SourceTable::new("posts", ["id", "title", "body"]),
            SourceTable::new("comments", ["id", "text"]),
        ]
    }

    #[test]
    fn test_width_sums_children() {
        let shape = Shape::Tuple(vec![
            Shape::Scalar,
            Shape::Entity(1),
            Shape::List(vec![Shape::Entity(0), Shape::Scalar]),
        ]);
        assert_eq!(shape.width(&sources()), Some(1 + 2 + 3 + 1));
    }

    #[test]
    fn test_width_missing_source() {
        assert_eq!(Shape::Entity(5).width(&sources()), None);
    }

    #[test]
    fn test_entity_position() {
        assert_eq!(Shape::Entity(0).entity_position(), Some(0));
        assert_eq!(
            Shape::Tuple(vec![Shape::Scalar, Shape::Entity(0)]).entity_position(),
            Some(1)
        );
        assert_eq!(Shape::Scalar.entity_position(), None);
    }

    #[test]
    fn test_entity_get_and_set() {
        let mut entity = Entity::new("posts").with_field("id", 1).with_field("title", "a");
        assert_eq!(entity.get("title"), Some(&Value::Text("a".into())));
        entity.set("title", Value::Text("b".into()));
        entity.set("body", Value::Null);
        assert_eq!(entity.get("title"), Some(&Value::Text("b".into())));
        assert_eq!(entity.fields.len(), 3);
    }

    #[test]
    fn test_materialized_serializes_entities_as_objects() {
        let row = Materialized::Tuple(vec![
            Materialized::Scalar(Value::Int(1)),
            Materialized::Entity(Some(Entity::new("c").with_field("id", 2))),
            Materialized::Entity(None),
        ]);
        assert_eq!(
            serde_json::to_value(&row).unwrap(),
            serde_json::json!([1, {"id": 2}, null])
        );
    }

    #[test]
    fn test_entity_at() {
        let row = Materialized::Tuple(vec![
            Materialized::Scalar(Value::Int(1)),
            Materialized::Entity(Some(Entity::new("c").with_field("id", 2))),
        ]);
        assert_eq!(row.entity_at(1).map(|e| e.source.as_str()), Some("c"));
        assert!(row.entity_at(0).is_none());
    }
}
