/// Schema model and the resolver interface the analyzer consults.
///
/// All lookups are pure: absence of a mapping is a `None`, never an
/// error. The analyzer decides whether a missing mapping is fatal.
pub mod snapshot;

use serde::{Deserialize, Serialize};

use crate::ast::{JoinKind, TableBinding, ValueType};

pub use snapshot::{SchemaDocument, SchemaSnapshot};

fn any_type() -> ValueType {
    ValueType::Any
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberMapping {
    pub name: String,
    /// Column name; the member name when absent.
    #[serde(default)]
    pub column: Option<String>,
    #[serde(rename = "type", default = "any_type")]
    pub value_type: ValueType,
    #[serde(default)]
    pub primary_key: bool,
    /// Assigned by the database on insert.
    #[serde(default)]
    pub generated: bool,
    #[serde(default)]
    pub nullable: bool,
}

impl MemberMapping {
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            column: None,
            value_type,
            primary_key: false,
            generated: false,
            nullable: false,
        }
    }

    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    pub fn key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn generated(mut self) -> Self {
        self.generated = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn column_name(&self) -> &str {
        self.column.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationMapping {
    pub name: String,
    /// Entity type on the other side.
    pub other: String,
    pub this_keys: Vec<String>,
    pub other_keys: Vec<String>,
    /// To-many (a collection) rather than to-one (a reference).
    #[serde(default)]
    pub many: bool,
    /// Joined and materialized whenever the owning entity is projected.
    #[serde(default)]
    pub eager: bool,
    /// Identifies the foreign key; defaults to `Owner.Member`.
    #[serde(default)]
    pub join_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMapping {
    #[serde(rename = "type")]
    pub type_name: String,
    pub table: String,
    #[serde(rename = "member", default)]
    pub members: Vec<MemberMapping>,
    #[serde(rename = "association", default)]
    pub associations: Vec<AssociationMapping>,
}

impl EntityMapping {
    pub fn new(type_name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            table: table.into(),
            members: Vec::new(),
            associations: Vec::new(),
        }
    }

    pub fn with_member(mut self, member: MemberMapping) -> Self {
        self.members.push(member);
        self
    }

    pub fn with_association(mut self, association: AssociationMapping) -> Self {
        self.associations.push(association);
        self
    }

    pub fn member(&self, name: &str) -> Option<&MemberMapping> {
        self.members.iter().find(|m| m.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionParameter {
    pub name: String,
    #[serde(rename = "type", default = "any_type")]
    pub value_type: ValueType,
    /// Accepts any number of trailing arguments, packed into an array.
    #[serde(default)]
    pub variadic: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionMapping {
    /// Entity type or namespace the function is declared on.
    #[serde(default)]
    pub owner: String,
    pub name: String,
    pub sql_name: String,
    #[serde(default)]
    pub parameters: Vec<FunctionParameter>,
    #[serde(default = "any_type")]
    pub result: ValueType,
}

impl FunctionMapping {
    pub fn key(&self) -> FunctionKey {
        FunctionKey::new(&self.owner, &self.name)
    }
}

/// Composite registry key for mapped functions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionKey {
    pub owner: String,
    pub name: String,
}

impl FunctionKey {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cardinality {
    One,
    Many,
}

/// A resolved association, ready to become a join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Association {
    pub member: String,
    pub other_type: String,
    pub this_keys: Vec<String>,
    pub other_keys: Vec<String>,
    pub join_kind: JoinKind,
    pub join_id: String,
    pub cardinality: Cardinality,
    pub eager: bool,
}

impl Association {
    pub fn is_many(&self) -> bool {
        self.cardinality == Cardinality::Many
    }
}

/// Schema facts the compiler needs, answered from an immutable snapshot.
pub trait SchemaResolver: Send + Sync {
    fn table_name_for(&self, entity: &str) -> Option<&str>;

    /// Column for `member` of the table. Derived tables resolve by alias.
    fn column_name_for<'a>(&'a self, table: &'a TableBinding, member: &str) -> Option<&'a str>;

    /// Primary key members of an entity, in declared order.
    fn primary_keys_for(&self, entity: &str) -> Vec<&str>;

    fn association_for(&self, entity: &str, member: &str) -> Option<Association>;

    fn associations_of(&self, entity: &str) -> Vec<Association>;

    fn member_for(&self, entity: &str, member: &str) -> Option<&MemberMapping>;

    fn members_of(&self, entity: &str) -> Option<&[MemberMapping]>;

    fn function_for(&self, key: &FunctionKey) -> Option<&FunctionMapping>;
}
