use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::ast::ValueType;

/// Compiler settings. Every field falls back to its default when missing
/// from a loaded file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub dialect: Dialect,
    /// Deepest node nesting the analyzer accepts before raising a recursion error.
    pub max_expression_depth: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            dialect: Dialect::default(),
            max_expression_depth: 128,
        }
    }
}

impl CompilerConfig {
    pub fn with_dialect(dialect: Dialect) -> Self {
        Self {
            dialect,
            ..Self::default()
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse compiler config")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read compiler config: {}", path.display()))?;
        Self::from_toml_str(&content)
    }
}

/// How bound parameters are spelled in emitted SQL.
///
/// - `At`: `@p0` (SQL Server, SQLite)
/// - `Colon`: `:p0` (Oracle, SQLite)
/// - `Dollar`: `$1`, numbered from one by ordinal (PostgreSQL)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParameterStyle {
    #[default]
    At,
    Colon,
    Dollar,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LimitStyle {
    /// `LIMIT n OFFSET m`
    #[default]
    LimitOffset,
    /// `OFFSET m ROWS FETCH NEXT n ROWS ONLY`
    OffsetFetch,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConcatStyle {
    /// `a || b`
    #[default]
    Pipes,
    /// `CONCAT(a, b)`
    Function,
}

/// Which family of built-in function names the dialect speaks.
///
/// | | `Standard` | `Postgres` | `SqlServer` |
/// |---|---|---|---|
/// | index of | `INSTR(s, x)` | `STRPOS(s, x)` | `CHARINDEX(x, s)` |
/// | length | `LENGTH` | `LENGTH` | `LEN` |
/// | natural log | `LN(x)` | `LN(x)` | `LOG(x)` |
/// | log to base | `LOG(b, x)` | `LOG(b, x)` | `LOG(x, b)` |
/// | date part | `strftime` | `EXTRACT` | `DATEPART` |
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FunctionStyle {
    /// SQLite spellings.
    #[default]
    Standard,
    Postgres,
    SqlServer,
}

/// How an insert learns the values of generated members.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStrategy {
    /// Append `RETURNING` with the generated columns.
    Returning,
    /// Run this statement after the insert.
    Query(String),
}

impl Default for IdentityStrategy {
    fn default() -> Self {
        IdentityStrategy::Query("SELECT @@IDENTITY".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Dialect {
    pub parameter_style: ParameterStyle,
    pub limit_style: LimitStyle,
    pub concat_style: ConcatStyle,
    pub functions: FunctionStyle,
    pub identity: IdentityStrategy,
    /// SUBSTRING and INSTR count characters from one.
    pub one_based_strings: bool,
}

impl Default for Dialect {
    fn default() -> Self {
        Self {
            parameter_style: ParameterStyle::default(),
            limit_style: LimitStyle::default(),
            concat_style: ConcatStyle::default(),
            functions: FunctionStyle::default(),
            identity: IdentityStrategy::default(),
            one_based_strings: true,
        }
    }
}

impl Dialect {
    pub fn postgres() -> Self {
        Self {
            parameter_style: ParameterStyle::Dollar,
            limit_style: LimitStyle::LimitOffset,
            concat_style: ConcatStyle::Pipes,
            functions: FunctionStyle::Postgres,
            identity: IdentityStrategy::Returning,
            one_based_strings: true,
        }
    }

    pub fn sqlite() -> Self {
        Self {
            parameter_style: ParameterStyle::At,
            limit_style: LimitStyle::LimitOffset,
            concat_style: ConcatStyle::Pipes,
            functions: FunctionStyle::Standard,
            identity: IdentityStrategy::Query("SELECT last_insert_rowid()".to_string()),
            one_based_strings: true,
        }
    }

    pub fn sql_server() -> Self {
        Self {
            parameter_style: ParameterStyle::At,
            limit_style: LimitStyle::OffsetFetch,
            concat_style: ConcatStyle::Function,
            functions: FunctionStyle::SqlServer,
            identity: IdentityStrategy::Query("SELECT SCOPE_IDENTITY()".to_string()),
            one_based_strings: true,
        }
    }

    /// Spell a parameter reference. `ordinal` is the zero-based position in
    /// the descriptor list.
    pub fn parameter(&self, name: &str, ordinal: usize) -> String {
        match self.parameter_style {
            ParameterStyle::At => format!("@{}", name),
            ParameterStyle::Colon => format!(":{}", name),
            ParameterStyle::Dollar => format!("${}", ordinal + 1),
        }
    }

    /// Column type a conversion casts to. `None` for types with no
    /// scalar SQL counterpart.
    pub fn type_name(&self, value_type: &ValueType) -> Option<&'static str> {
        use FunctionStyle::*;
        Some(match (self.functions, value_type) {
            (Postgres, ValueType::Bool) | (Standard, ValueType::Bool) => "BOOLEAN",
            (SqlServer, ValueType::Bool) => "BIT",
            (Postgres, ValueType::Int) | (SqlServer, ValueType::Int) => "BIGINT",
            (Standard, ValueType::Int) => "INTEGER",
            (Postgres, ValueType::Float) => "DOUBLE PRECISION",
            (SqlServer, ValueType::Float) => "FLOAT",
            (Standard, ValueType::Float) => "REAL",
            (SqlServer, ValueType::Text) => "NVARCHAR(MAX)",
            (_, ValueType::Text) => "TEXT",
            (Postgres, ValueType::DateTime) => "TIMESTAMP",
            (SqlServer, ValueType::DateTime) => "DATETIME2",
            (Standard, ValueType::DateTime) => "DATETIME",
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CompilerConfig::default();
        assert_eq!(config.max_expression_depth, 128);
        assert_eq!(config.dialect.parameter_style, ParameterStyle::At);
        assert!(config.dialect.one_based_strings);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = CompilerConfig::from_toml_str(
            r#"
            max_expression_depth = 16

            [dialect]
            parameter_style = "dollar"
            identity = "returning"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_expression_depth, 16);
        assert_eq!(config.dialect.parameter_style, ParameterStyle::Dollar);
        assert_eq!(config.dialect.identity, IdentityStrategy::Returning);
        assert_eq!(config.dialect.limit_style, LimitStyle::LimitOffset);
        assert_eq!(config.dialect.functions, FunctionStyle::Standard);
    }

    #[test]
    fn test_function_style_per_preset() {
        assert_eq!(Dialect::default().functions, FunctionStyle::Standard);
        assert_eq!(Dialect::sqlite().functions, FunctionStyle::Standard);
        assert_eq!(Dialect::postgres().functions, FunctionStyle::Postgres);
        assert_eq!(Dialect::sql_server().functions, FunctionStyle::SqlServer);

        let config = CompilerConfig::from_toml_str(
            r#"
            [dialect]
            functions = "sql_server"
            "#,
        )
        .unwrap();
        assert_eq!(config.dialect.functions, FunctionStyle::SqlServer);
    }

    #[test]
    fn test_cast_type_names() {
        assert_eq!(Dialect::postgres().type_name(&ValueType::Float), Some("DOUBLE PRECISION"));
        assert_eq!(Dialect::sql_server().type_name(&ValueType::Text), Some("NVARCHAR(MAX)"));
        assert_eq!(Dialect::default().type_name(&ValueType::DateTime), Some("DATETIME"));
        assert_eq!(
            Dialect::default().type_name(&ValueType::Entity("Customer".to_string())),
            None
        );
    }

    #[test]
    fn test_identity_query_from_toml() {
        let config = CompilerConfig::from_toml_str(
            r#"
            [dialect.identity]
            query = "SELECT last_insert_rowid()"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.dialect.identity,
            IdentityStrategy::Query("SELECT last_insert_rowid()".to_string())
        );
    }

    #[test]
    fn test_parameter_spelling() {
        assert_eq!(Dialect::default().parameter("p0", 0), "@p0");
        assert_eq!(Dialect::postgres().parameter("p0", 0), "$1");
        let colon = Dialect {
            parameter_style: ParameterStyle::Colon,
            ..Dialect::default()
        };
        assert_eq!(colon.parameter("arg2", 1), ":arg2");
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        assert!(CompilerConfig::from_toml_str("dialect = 3").is_err());
    }
}
