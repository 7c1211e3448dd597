//! Compiled query artifacts.
//!
//! Everything here is immutable once built and shared behind `Arc` by the
//! cache. Parameter values are not stored: each descriptor carries a
//! [`ValueExtractor`] that reads the value from whatever the executor binds
//! at run time (the chain, a target instance, or raw arguments).

use std::fmt;
use std::sync::Arc;

use crate::ast::{EntityInstance, OperatorChain, Value, ValueType};
use crate::compiler::materializer::RowMaterializer;
use crate::error::{CompileError, Result};

/// How to find a parameter's value at execution time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueExtractor {
    /// Data constant of the chain, by depth-first ordinal.
    ChainConstant(usize),
    /// One element of a captured list constant.
    ListElement { constant: usize, index: usize },
    /// Member of the bound entity instance.
    Member(String),
    /// Positional argument of a raw SQL call.
    Argument(usize),
}

/// What an extractor reads from.
#[derive(Debug, Clone, Copy)]
pub enum ParameterSource<'a> {
    Chain(&'a OperatorChain),
    Instance(&'a EntityInstance),
    Arguments(&'a [Value]),
}

impl<'a> From<&'a OperatorChain> for ParameterSource<'a> {
    fn from(chain: &'a OperatorChain) -> Self {
        ParameterSource::Chain(chain)
    }
}

impl<'a> From<&'a EntityInstance> for ParameterSource<'a> {
    fn from(instance: &'a EntityInstance) -> Self {
        ParameterSource::Instance(instance)
    }
}

impl<'a> From<&'a [Value]> for ParameterSource<'a> {
    fn from(arguments: &'a [Value]) -> Self {
        ParameterSource::Arguments(arguments)
    }
}

impl ValueExtractor {
    pub fn extract(&self, source: ParameterSource<'_>) -> Result<Value> {
        let found = match (self, source) {
            (ValueExtractor::ChainConstant(ordinal), ParameterSource::Chain(chain)) => {
                chain.constant(*ordinal).cloned()
            }
            (ValueExtractor::ListElement { constant, index }, ParameterSource::Chain(chain)) => {
                match chain.constant(*constant) {
                    Some(Value::List(items)) => items.get(*index).cloned(),
                    _ => None,
                }
            }
            (ValueExtractor::Member(member), ParameterSource::Instance(instance)) => {
                // An unset member binds as NULL.
                Some(instance.get(member).cloned().unwrap_or(Value::Null))
            }
            (ValueExtractor::Argument(index), ParameterSource::Arguments(arguments)) => {
                arguments.get(*index).cloned()
            }
            _ => {
                return Err(CompileError::mapping(format!(
                    "{} cannot read from this parameter source",
                    self
                )))
            }
        };
        found.ok_or_else(|| CompileError::mapping(format!("no value for {}", self)))
    }
}

impl fmt::Display for ValueExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueExtractor::ChainConstant(ordinal) => write!(f, "chain constant #{}", ordinal),
            ValueExtractor::ListElement { constant, index } => {
                write!(f, "element {} of chain constant #{}", index, constant)
            }
            ValueExtractor::Member(member) => write!(f, "member '{}'", member),
            ValueExtractor::Argument(index) => write!(f, "argument #{}", index),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InputParameterDescriptor {
    pub name: String,
    pub extractor: ValueExtractor,
    pub declared_type: ValueType,
}

impl InputParameterDescriptor {
    pub fn value<'a>(&self, source: impl Into<ParameterSource<'a>>) -> Result<Value> {
        self.extractor.extract(source.into())
    }
}

/// A database-generated value read back after an insert.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputParameterDescriptor {
    pub name: String,
    pub member: String,
    pub declared_type: ValueType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    pub sql: String,
    pub input_parameters: Vec<InputParameterDescriptor>,
    pub materializer: RowMaterializer,
    /// Terminal operator name when the query returns one value.
    pub scalar_method_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertQuery {
    pub sql: String,
    /// Run after the statement to fetch generated identity values.
    pub id_query_sql: Option<String>,
    pub input_parameters: Vec<InputParameterDescriptor>,
    pub output_parameters: Vec<OutputParameterDescriptor>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteQuery {
    pub sql: String,
    pub input_parameters: Vec<InputParameterDescriptor>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirectQuery {
    pub sql: String,
    pub input_parameters: Vec<InputParameterDescriptor>,
}

/// Raw SQL bound to one target instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterizedQuery {
    pub sql: String,
    pub input_parameters: Vec<InputParameterDescriptor>,
    pub target: EntityInstance,
}

impl ParameterizedQuery {
    /// Parameter values read from the bound target, in order.
    pub fn values(&self) -> Result<Vec<Value>> {
        self.input_parameters
            .iter()
            .map(|p| p.value(&self.target))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Select,
    Upsert,
    Delete,
    Direct,
    Parameterized,
}

/// Any compiled query, as stored in the cache.
#[derive(Debug, Clone)]
pub enum CompiledQuery {
    Select(Arc<SelectQuery>),
    Upsert(Arc<UpsertQuery>),
    Delete(Arc<DeleteQuery>),
    Direct(Arc<DirectQuery>),
    Parameterized(Arc<ParameterizedQuery>),
}

impl CompiledQuery {
    pub fn kind(&self) -> QueryKind {
        match self {
            CompiledQuery::Select(_) => QueryKind::Select,
            CompiledQuery::Upsert(_) => QueryKind::Upsert,
            CompiledQuery::Delete(_) => QueryKind::Delete,
            CompiledQuery::Direct(_) => QueryKind::Direct,
            CompiledQuery::Parameterized(_) => QueryKind::Parameterized,
        }
    }

    pub fn sql(&self) -> &str {
        match self {
            CompiledQuery::Select(q) => &q.sql,
            CompiledQuery::Upsert(q) => &q.sql,
            CompiledQuery::Delete(q) => &q.sql,
            CompiledQuery::Direct(q) => &q.sql,
            CompiledQuery::Parameterized(q) => &q.sql,
        }
    }

    pub fn input_parameters(&self) -> &[InputParameterDescriptor] {
        match self {
            CompiledQuery::Select(q) => &q.input_parameters,
            CompiledQuery::Upsert(q) => &q.input_parameters,
            CompiledQuery::Delete(q) => &q.input_parameters,
            CompiledQuery::Direct(q) => &q.input_parameters,
            CompiledQuery::Parameterized(q) => &q.input_parameters,
        }
    }

    pub fn as_select(&self) -> Option<&Arc<SelectQuery>> {
        match self {
            CompiledQuery::Select(q) => Some(q),
            _ => None,
        }
    }

    pub fn as_upsert(&self) -> Option<&Arc<UpsertQuery>> {
        match self {
            CompiledQuery::Upsert(q) => Some(q),
            _ => None,
        }
    }

    pub fn as_delete(&self) -> Option<&Arc<DeleteQuery>> {
        match self {
            CompiledQuery::Delete(q) => Some(q),
            _ => None,
        }
    }

    pub fn as_direct(&self) -> Option<&Arc<DirectQuery>> {
        match self {
            CompiledQuery::Direct(q) => Some(q),
            _ => None,
        }
    }

    /// Whether both hold the same shared artifact.
    pub fn ptr_eq(&self, other: &CompiledQuery) -> bool {
        match (self, other) {
            (CompiledQuery::Select(a), CompiledQuery::Select(b)) => Arc::ptr_eq(a, b),
            (CompiledQuery::Upsert(a), CompiledQuery::Upsert(b)) => Arc::ptr_eq(a, b),
            (CompiledQuery::Delete(a), CompiledQuery::Delete(b)) => Arc::ptr_eq(a, b),
            (CompiledQuery::Direct(a), CompiledQuery::Direct(b)) => Arc::ptr_eq(a, b),
            (CompiledQuery::Parameterized(a), CompiledQuery::Parameterized(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}
