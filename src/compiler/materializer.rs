//! Row materialization: raw result rows back into typed values.

use chrono::{NaiveDate, NaiveDateTime};

use crate::ast::{EntityInstance, Value, ValueType};
use crate::error::{ArgumentError, CompileError, Result};
use crate::schema::SchemaResolver;

/// Layout of one result row.
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    /// A single column.
    Column {
        ordinal: usize,
        value_type: ValueType,
        nullable: bool,
    },
    /// An entity; `keys` are the ordinals of its primary key columns.
    Entity {
        type_name: String,
        members: Vec<(String, Shape)>,
        keys: Vec<usize>,
    },
    /// A `new { .. }` projection.
    New {
        type_name: String,
        members: Vec<(String, Shape)>,
    },
    /// A row count read as a yes/no answer.
    Quantifier { ordinal: usize, all: bool },
}

impl Shape {
    /// The same layout starting `base` columns further right.
    pub fn shifted(&self, base: usize) -> Shape {
        match self {
            Shape::Column {
                ordinal,
                value_type,
                nullable,
            } => Shape::Column {
                ordinal: ordinal + base,
                value_type: value_type.clone(),
                nullable: *nullable,
            },
            Shape::Entity {
                type_name,
                members,
                keys,
            } => Shape::Entity {
                type_name: type_name.clone(),
                members: shift_members(members, base),
                keys: keys.iter().map(|k| k + base).collect(),
            },
            Shape::New { type_name, members } => Shape::New {
                type_name: type_name.clone(),
                members: shift_members(members, base),
            },
            Shape::Quantifier { ordinal, all } => Shape::Quantifier {
                ordinal: ordinal + base,
                all: *all,
            },
        }
    }

    /// Whether the layout is a single scalar column.
    pub fn is_scalar(&self) -> bool {
        matches!(self, Shape::Column { .. } | Shape::Quantifier { .. })
    }

    /// Member layout by name, for entity and `new` shapes.
    pub fn member(&self, name: &str) -> Option<&Shape> {
        match self {
            Shape::Entity { members, .. } | Shape::New { members, .. } => members
                .iter()
                .find(|(member, _)| member == name)
                .map(|(_, shape)| shape),
            _ => None,
        }
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Shape::Column { value_type, .. } => value_type.clone(),
            Shape::Entity { type_name, .. } | Shape::New { type_name, .. } => {
                ValueType::Entity(type_name.clone())
            }
            Shape::Quantifier { .. } => ValueType::Bool,
        }
    }
}

fn shift_members(members: &[(String, Shape)], base: usize) -> Vec<(String, Shape)> {
    members
        .iter()
        .map(|(name, shape)| (name.clone(), shape.shifted(base)))
        .collect()
}

/// Options applied while reading a row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MappingContext {
    /// Read NULL in a non-nullable column as the type's default value.
    pub null_as_default: bool,
}

/// Compiled converter from one raw row to one value.
#[derive(Debug, Clone, PartialEq)]
pub struct RowMaterializer {
    shape: Shape,
}

impl RowMaterializer {
    pub fn new(shape: Shape) -> Self {
        Self { shape }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Convert one row. Every failing column is reported, not just the first.
    pub fn materialize(&self, row: &[Value], context: &MappingContext) -> Result<Value> {
        let mut errors = Vec::new();
        let value = read_shape(&self.shape, "value", row, context, &mut errors);
        if errors.is_empty() {
            Ok(value)
        } else {
            errors.sort_by_key(|e| e.position);
            Err(CompileError::Conversion(errors))
        }
    }
}

fn read_shape(
    shape: &Shape,
    name: &str,
    row: &[Value],
    context: &MappingContext,
    errors: &mut Vec<ArgumentError>,
) -> Value {
    match shape {
        Shape::Column {
            ordinal,
            value_type,
            nullable,
        } => match row.get(*ordinal) {
            Some(raw) => match convert(raw, value_type, *nullable, context) {
                Ok(value) => value,
                Err(reason) => {
                    errors.push(ArgumentError::new(*ordinal, name, reason));
                    Value::Null
                }
            },
            None => {
                errors.push(ArgumentError::new(*ordinal, name, "missing column"));
                Value::Null
            }
        },
        Shape::Quantifier { ordinal, all } => match row.get(*ordinal) {
            Some(Value::Int(count)) => Value::Bool(if *all { *count == 0 } else { *count > 0 }),
            Some(Value::Bool(flag)) => Value::Bool(*flag),
            Some(other) => {
                errors.push(ArgumentError::new(
                    *ordinal,
                    name,
                    format!("expected a row count, found {}", other.value_type()),
                ));
                Value::Null
            }
            None => {
                errors.push(ArgumentError::new(*ordinal, name, "missing column"));
                Value::Null
            }
        },
        Shape::Entity {
            type_name,
            members,
            keys,
        } => {
            // An outer join that matched nothing leaves every key column null.
            let missing = !keys.is_empty()
                && keys
                    .iter()
                    .all(|k| matches!(row.get(*k), Some(Value::Null) | None));
            if missing {
                return Value::Null;
            }
            Value::Entity(read_members(type_name, members, row, context, errors))
        }
        Shape::New { type_name, members } => {
            Value::Entity(read_members(type_name, members, row, context, errors))
        }
    }
}

fn read_members(
    type_name: &str,
    members: &[(String, Shape)],
    row: &[Value],
    context: &MappingContext,
    errors: &mut Vec<ArgumentError>,
) -> EntityInstance {
    let mut instance = EntityInstance::new(type_name);
    for (member, shape) in members {
        let value = read_shape(shape, member, row, context, errors);
        instance.members.push((member.clone(), value));
    }
    instance
}

fn convert(
    raw: &Value,
    target: &ValueType,
    nullable: bool,
    context: &MappingContext,
) -> std::result::Result<Value, String> {
    match (raw, target) {
        (Value::Null, _) => {
            if nullable || matches!(target, ValueType::Any | ValueType::Null | ValueType::Entity(_)) {
                Ok(Value::Null)
            } else if context.null_as_default {
                Ok(target.default_value())
            } else {
                Err(format!("null in non-nullable {} column", target))
            }
        }
        (value, ValueType::Any) => Ok(value.clone()),
        (Value::Int(i), ValueType::Float) => Ok(Value::Float(*i as f64)),
        (Value::Int(0), ValueType::Bool) => Ok(Value::Bool(false)),
        (Value::Int(1), ValueType::Bool) => Ok(Value::Bool(true)),
        (Value::Bool(_), ValueType::Bool)
        | (Value::Int(_), ValueType::Int)
        | (Value::Float(_), ValueType::Float)
        | (Value::Text(_), ValueType::Text)
        | (Value::DateTime(_), ValueType::DateTime) => Ok(raw.clone()),
        (Value::Text(text), ValueType::DateTime) => parse_date_time(text)
            .map(Value::DateTime)
            .ok_or_else(|| format!("'{}' is not a date-time", text)),
        (Value::List(_), ValueType::Array(_)) => Ok(raw.clone()),
        (value, expected) => Err(format!(
            "expected {}, found {}",
            expected,
            value.value_type()
        )),
    }
}

/// Drivers without a native date-time type hand back ISO-8601 text.
fn parse_date_time(text: &str) -> Option<NaiveDateTime> {
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}

/// Materializer for `entity` over caller-supplied column aliases.
///
/// Members pair with aliases by member or column name, ignoring case.
/// Members with no matching alias are left out of the instance.
pub fn build_materializer(
    schema: &dyn SchemaResolver,
    entity: &str,
    aliases: &[&str],
) -> Result<RowMaterializer> {
    let members = schema
        .members_of(entity)
        .ok_or_else(|| CompileError::mapping(format!("entity '{}' is not mapped", entity)))?;

    let mut shaped = Vec::new();
    let mut keys = Vec::new();
    for member in members {
        let position = aliases.iter().position(|alias| {
            alias.eq_ignore_ascii_case(&member.name) || alias.eq_ignore_ascii_case(member.column_name())
        });
        if let Some(ordinal) = position {
            if member.primary_key {
                keys.push(ordinal);
            }
            shaped.push((
                member.name.clone(),
                Shape::Column {
                    ordinal,
                    value_type: member.value_type.clone(),
                    nullable: member.nullable,
                },
            ));
        }
    }

    Ok(RowMaterializer::new(Shape::Entity {
        type_name: entity.to_string(),
        members: shaped,
        keys,
    }))
}
