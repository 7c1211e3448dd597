//! Raw SQL with placeholders → named parameters.
//!
//! The text is run through the sqlparser tokenizer so that placeholder
//! look-alikes inside string literals, quoted identifiers and comments are
//! left untouched. Every other token is written back as it was read.

use sqlparser::dialect::GenericDialect;
use sqlparser::tokenizer::{Token, Tokenizer};

use crate::ast::EntityInstance;
use crate::config::Dialect;
use crate::error::{CompileError, Result};
use crate::query::{DirectQuery, InputParameterDescriptor, ParameterizedQuery, ValueExtractor};

#[derive(Debug, Clone, PartialEq)]
enum Placeholder {
    /// `{n}`, `?n` or `$n`, zero-based after parsing.
    Index(usize),
    /// Bare `?`.
    Next,
    /// `{Name}` or `$Name`.
    Named(String),
}

#[derive(Debug)]
enum Piece {
    Text(String),
    Slot(Placeholder),
}

fn one_based(digits: &str, spelled: &str) -> Result<Placeholder> {
    let n: usize = digits
        .parse()
        .map_err(|_| CompileError::syntax(format!("bad placeholder '{}'", spelled)))?;
    n.checked_sub(1)
        .map(Placeholder::Index)
        .ok_or_else(|| CompileError::syntax(format!("placeholder '{}' counts from 1", spelled)))
}

fn scan(sql: &str) -> Result<Vec<Piece>> {
    let dialect = GenericDialect {};
    let tokens = Tokenizer::new(&dialect, sql)
        .with_unescape(false)
        .tokenize()
        .map_err(|e| CompileError::syntax(e.to_string()))?;

    let mut pieces = Vec::new();
    let mut text = String::new();
    let mut i = 0;
    while i < tokens.len() {
        let slot = match (&tokens[i], tokens.get(i + 1), tokens.get(i + 2)) {
            (Token::LBrace, Some(Token::Number(n, _)), Some(Token::RBrace)) => {
                let index = n
                    .parse()
                    .map_err(|_| CompileError::syntax(format!("bad placeholder '{{{}}}'", n)))?;
                i += 3;
                Some(Placeholder::Index(index))
            }
            (Token::LBrace, Some(Token::Word(word)), Some(Token::RBrace))
                if word.quote_style.is_none() =>
            {
                i += 3;
                Some(Placeholder::Named(word.value.clone()))
            }
            (Token::Placeholder(p), _, _) => {
                i += 1;
                Some(match p.split_at(1) {
                    ("?", "") => Placeholder::Next,
                    ("?", digits) => one_based(digits, p)?,
                    ("$", rest) if rest.chars().all(|c| c.is_ascii_digit()) => one_based(rest, p)?,
                    ("$", name) => Placeholder::Named(name.to_string()),
                    _ => return Err(CompileError::syntax(format!("unknown placeholder '{}'", p))),
                })
            }
            (Token::EOF, _, _) => {
                i += 1;
                None
            }
            (token, _, _) => {
                text.push_str(&token.to_string());
                i += 1;
                None
            }
        };
        if let Some(slot) = slot {
            if !text.is_empty() {
                pieces.push(Piece::Text(std::mem::take(&mut text)));
            }
            pieces.push(Piece::Slot(slot));
        }
    }
    if !text.is_empty() {
        pieces.push(Piece::Text(text));
    }
    Ok(pieces)
}

/// Rewrite positional placeholders into `arg{n}` parameters.
///
/// Parameters are listed in order of first appearance; an argument used
/// twice is one parameter.
pub fn compile_direct(sql: &str, dialect: &Dialect) -> Result<DirectQuery> {
    let mut out = String::with_capacity(sql.len());
    let mut parameters: Vec<InputParameterDescriptor> = Vec::new();
    let mut next = 0;

    for piece in scan(sql)? {
        let index = match piece {
            Piece::Text(text) => {
                out.push_str(&text);
                continue;
            }
            Piece::Slot(Placeholder::Index(index)) => index,
            Piece::Slot(Placeholder::Next) => {
                next += 1;
                next - 1
            }
            Piece::Slot(Placeholder::Named(name)) => {
                return Err(CompileError::syntax(format!(
                    "named placeholder '{}' in a direct query",
                    name
                )))
            }
        };
        let extractor = ValueExtractor::Argument(index);
        let ordinal = match parameters.iter().position(|p| p.extractor == extractor) {
            Some(ordinal) => ordinal,
            None => {
                parameters.push(InputParameterDescriptor {
                    name: format!("arg{}", index),
                    extractor,
                    declared_type: crate::ast::ValueType::Any,
                });
                parameters.len() - 1
            }
        };
        out.push_str(&dialect.parameter(&parameters[ordinal].name, ordinal));
    }

    Ok(DirectQuery {
        sql: out,
        input_parameters: parameters,
    })
}

/// Bind `{Member}` placeholders to members of `target`.
pub fn compile_parameterized(
    sql: &str,
    target: &EntityInstance,
    dialect: &Dialect,
) -> Result<ParameterizedQuery> {
    let mut out = String::with_capacity(sql.len());
    let mut parameters: Vec<InputParameterDescriptor> = Vec::new();

    for piece in scan(sql)? {
        let member = match piece {
            Piece::Text(text) => {
                out.push_str(&text);
                continue;
            }
            Piece::Slot(Placeholder::Named(member)) => member,
            Piece::Slot(other) => {
                return Err(CompileError::syntax(format!(
                    "positional placeholder {:?} in a parameterized query",
                    other
                )))
            }
        };
        let value = target.get(&member).ok_or_else(|| {
            CompileError::mapping(format!(
                "'{}' has no member '{}'",
                target.type_name, member
            ))
        })?;
        let ordinal = match parameters.iter().position(|p| p.name == member) {
            Some(ordinal) => ordinal,
            None => {
                parameters.push(InputParameterDescriptor {
                    name: member.clone(),
                    extractor: ValueExtractor::Member(member.clone()),
                    declared_type: value.value_type(),
                });
                parameters.len() - 1
            }
        };
        out.push_str(&dialect.parameter(&member, ordinal));
    }

    Ok(ParameterizedQuery {
        sql: out,
        input_parameters: parameters,
        target: target.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Value;

    fn names(query: &DirectQuery) -> Vec<&str> {
        query.input_parameters.iter().map(|p| p.name.as_str()).collect()
    }

    #[test]
    fn test_format_placeholders_keep_first_appearance_order() {
        let query = compile_direct(
            "SELECT * FROM Orders WHERE Total > {1} AND CustomerId = {0} OR Total < {1}",
            &Dialect::default(),
        )
        .unwrap();
        assert_eq!(
            query.sql,
            "SELECT * FROM Orders WHERE Total > @arg1 AND CustomerId = @arg0 OR Total < @arg1"
        );
        assert_eq!(names(&query), vec!["arg1", "arg0"]);
    }

    #[test]
    fn test_placeholders_in_literals_and_comments_are_ignored() {
        let query = compile_direct(
            "SELECT '{0}', 'it''s ?' FROM t -- {1}\nWHERE a = ?",
            &Dialect::default(),
        )
        .unwrap();
        assert_eq!(query.sql, "SELECT '{0}', 'it''s ?' FROM t -- {1}\nWHERE a = @arg0");
        assert_eq!(names(&query), vec!["arg0"]);
    }

    #[test]
    fn test_question_marks_count_positionally() {
        let query = compile_direct("SELECT * FROM t WHERE a = ? AND b = ?", &Dialect::postgres()).unwrap();
        assert_eq!(query.sql, "SELECT * FROM t WHERE a = $1 AND b = $2");
        assert_eq!(names(&query), vec!["arg0", "arg1"]);
    }

    #[test]
    fn test_dollar_placeholders_are_one_based() {
        let query = compile_direct("SELECT * FROM t WHERE a = $2 AND b = $1", &Dialect::default()).unwrap();
        assert_eq!(query.sql, "SELECT * FROM t WHERE a = @arg1 AND b = @arg0");
        assert!(matches!(
            compile_direct("SELECT $0", &Dialect::default()),
            Err(CompileError::Syntax(_))
        ));
    }

    #[test]
    fn test_arguments_extract_in_parameter_order() {
        let query = compile_direct("SELECT {1}, {0}", &Dialect::default()).unwrap();
        let arguments = [Value::Int(10), Value::Int(20)];
        let values: Vec<Value> = query
            .input_parameters
            .iter()
            .map(|p| p.value(&arguments[..]).unwrap())
            .collect();
        assert_eq!(values, vec![Value::Int(20), Value::Int(10)]);
    }

    #[test]
    fn test_parameterized_binds_target_members() {
        let target = EntityInstance::new("Customer").with("Id", 3).with("Name", "Acme");
        let query = compile_parameterized(
            "UPDATE Customers SET Name = {Name} WHERE Id = {Id}",
            &target,
            &Dialect::default(),
        )
        .unwrap();
        assert_eq!(query.sql, "UPDATE Customers SET Name = @Name WHERE Id = @Id");
        assert_eq!(query.values().unwrap(), vec![Value::text("Acme"), Value::Int(3)]);
    }

    #[test]
    fn test_parameterized_rejects_unknown_members_and_positions() {
        let target = EntityInstance::new("Customer").with("Id", 3);
        assert!(matches!(
            compile_parameterized("SELECT {Name}", &target, &Dialect::default()),
            Err(CompileError::Mapping(_))
        ));
        assert!(matches!(
            compile_parameterized("SELECT {0}", &target, &Dialect::default()),
            Err(CompileError::Syntax(_))
        ));
    }
}
