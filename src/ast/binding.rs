//! Resolved table and column bindings.

use super::types::{ExpressionNode, ValueType};
use crate::compiler::materializer::Shape;

/// Index of a table binding in its compilation context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId(pub usize);

/// Index of a select scope in its compilation context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum JoinKind {
    /// Plain FROM entry, correlated through WHERE if at all.
    #[default]
    None,
    Inner,
    LeftOuter,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableSource {
    /// A mapped entity table.
    Entity { entity: String, table: String },
    /// The projection of another scope, used as `(SELECT ...) alias`.
    Derived {
        scope: ScopeId,
        columns: Vec<DerivedColumn>,
        shape: Shape,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DerivedColumn {
    pub alias: String,
    pub value_type: ValueType,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableBinding {
    pub id: TableId,
    pub source: TableSource,
    /// Unique across the whole compiled statement.
    pub alias: String,
    pub scope: ScopeId,
    pub join_kind: JoinKind,
    pub join_predicate: Option<ExpressionNode>,
}

impl TableBinding {
    /// Entity type the rows of this table materialize to.
    pub fn entity_type(&self) -> Option<&str> {
        match &self.source {
            TableSource::Entity { entity, .. } => Some(entity),
            TableSource::Derived {
                shape: Shape::Entity { type_name, .. },
                ..
            } => Some(type_name),
            TableSource::Derived { .. } => None,
        }
    }

    pub fn is_derived(&self) -> bool {
        matches!(self.source, TableSource::Derived { .. })
    }

    pub fn derived_column(&self, alias: &str) -> Option<&DerivedColumn> {
        match &self.source {
            TableSource::Derived { columns, .. } => columns.iter().find(|c| c.alias == alias),
            TableSource::Entity { .. } => None,
        }
    }
}

/// A member of a table referenced somewhere in a scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnBinding {
    pub table: TableId,
    pub member: String,
    pub alias: String,
}
