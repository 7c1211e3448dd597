//! chainql: compiles declarative operator chains into parameterized SQL.
//!
//! ```text
//! OperatorChain ──► QueryBuilder ──► QueryCache (hit) ──► Arc<SelectQuery>
//!                        │
//!                        └─ miss ──► compiler::compile_select ──► insert-if-absent
//! ```
//!
//! Mutation templates and raw SQL go through the same builder and cache.

pub mod ast;
pub mod builder;
pub mod cache;
pub mod compiler;
pub mod config;
pub mod error;
pub mod query;
pub mod schema;
pub mod sql;

#[cfg(test)]
pub(crate) mod test_support;

pub use ast::{EntityInstance, ExpressionNode, Method, OperatorChain, QueryOperator, Value, ValueType};
pub use builder::QueryBuilder;
pub use cache::{CacheKey, CacheStats, QueryCache};
pub use compiler::{MappingContext, RowMaterializer};
pub use config::{CompilerConfig, Dialect};
pub use error::{CompileError, Result};
pub use query::{
    CompiledQuery, DeleteQuery, DirectQuery, InputParameterDescriptor, ParameterizedQuery,
    SelectQuery, UpsertQuery, ValueExtractor,
};
pub use schema::{SchemaResolver, SchemaSnapshot};
