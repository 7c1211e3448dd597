/// Expression model and operator chains.
///
/// ```text
/// Front end builds
///       ↓
/// OperatorChain of ExpressionNode   (chain.rs, types.rs)
///       ↓
/// Analyzer rewrites into TableRef / ColumnRef / ScopeRef
///       ↓
/// Bindings resolved per scope       (binding.rs)
/// ```
pub mod binding;
pub mod chain;
pub mod types;

pub use binding::{ColumnBinding, DerivedColumn, JoinKind, ScopeId, TableBinding, TableId, TableSource};
pub use chain::OperatorChain;
pub use types::*;
