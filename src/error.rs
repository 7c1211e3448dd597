use std::fmt;

use thiserror::Error;

/// One argument (or result column) that could not be adapted to its declared type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentError {
    pub position: usize,
    pub parameter: String,
    pub reason: String,
}

impl ArgumentError {
    pub fn new(position: usize, parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            position,
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ArgumentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({}): {}", self.position, self.parameter, self.reason)
    }
}

/// Failures raised while compiling an operator chain or a mutation template.
///
/// Every variant aborts the compile it came from; nothing partial is cached.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    /// An entity, member, association or function has no schema mapping.
    #[error("mapping error: {0}")]
    Mapping(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Association expansion revisited a member already being resolved, or
    /// node nesting exceeded the configured depth.
    #[error("recursion detected: {path}")]
    Recursion { path: String },

    /// Every position that failed conversion, in ascending order.
    #[error("conversion failed for {}", join_errors(.0))]
    Conversion(Vec<ArgumentError>),

    /// Raw SQL text could not be tokenized or carries an unusable placeholder.
    #[error("invalid SQL text: {0}")]
    Syntax(String),
}

fn join_errors(errors: &[ArgumentError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl CompileError {
    pub fn mapping(message: impl Into<String>) -> Self {
        CompileError::Mapping(message.into())
    }

    pub fn unsupported(construct: impl Into<String>) -> Self {
        CompileError::UnsupportedOperation(construct.into())
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        CompileError::Syntax(message.into())
    }

    pub fn conversion(position: usize, parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        CompileError::Conversion(vec![ArgumentError::new(position, parameter, reason)])
    }

    /// Positions named by a conversion error; empty for every other kind.
    pub fn positions(&self) -> Vec<usize> {
        match self {
            CompileError::Conversion(errors) => errors.iter().map(|e| e.position).collect(),
            _ => Vec::new(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CompileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_lists_every_position() {
        let err = CompileError::Conversion(vec![
            ArgumentError::new(0, "left", "expected int, found text"),
            ArgumentError::new(2, "values", "expected array<int>, found bool"),
        ]);
        let message = err.to_string();
        assert!(message.contains("#0 (left)"));
        assert!(message.contains("#2 (values)"));
        assert_eq!(err.positions(), vec![0, 2]);
    }

    #[test]
    fn test_positions_empty_for_other_kinds() {
        assert!(CompileError::mapping("Ghost").positions().is_empty());
        assert_eq!(
            CompileError::unsupported("Lambda").to_string(),
            "unsupported operation: Lambda"
        );
    }
}
