//! Scope tree → SQL statement AST.
//!
//! One SELECT per non-join scope. Join scopes are inlined into the FROM
//! clause of their parent, derived tables become sub-selects, and
//! `ScopeRef` nodes become scalar, EXISTS or IN sub-queries. Precedence is
//! made explicit with [`Expression::Nested`] since the renderer prints
//! operators verbatim.

use super::scope::{CompilationContext, SetOperator};
use crate::ast::{
    BinaryOperator as NodeOperator, DateTimeMethod, ExpressionNode, JoinKind, MathMethod, Method,
    QueryOperator, ScopeId, SqlOperator, TableBinding, TableSource, TextMethod,
    UnaryOperator as NodeUnary, Value,
};
use crate::config::{ConcatStyle, Dialect, FunctionStyle};
use crate::error::{CompileError, Result};
use crate::schema::SchemaResolver;
use crate::sql::{
    BinaryOperator, Expression, Join, JoinType, Literal, OrderByExpr, SelectItem, SelectStatement,
    SetOperation, SetOperator as SqlSetOperator, TableRef, UnaryOperator,
};

/// Precedence of an expression when used as an operand.
fn operand_precedence(expr: &Expression) -> Option<u8> {
    match expr {
        Expression::BinaryOp { op, .. } => Some(op.precedence()),
        Expression::UnaryOp {
            op: UnaryOperator::Not,
            ..
        } => Some(3),
        Expression::IsNull { .. } | Expression::InList { .. } | Expression::InSubquery { .. } => {
            Some(4)
        }
        _ => None,
    }
}

fn nested(expr: Expression) -> Expression {
    Expression::Nested(Box::new(expr))
}

/// Build `left op right`, parenthesizing operands that would bind looser.
pub fn binary(left: Expression, op: BinaryOperator, right: Expression) -> Expression {
    let wrap = |operand: Expression, right_side: bool| {
        let needs = match (operand_precedence(&operand), &operand) {
            (Some(child), Expression::BinaryOp { op: child_op, .. }) => {
                let parent = op.precedence();
                child < parent
                    || (child == parent
                        && (op.is_comparison()
                            || (right_side && !(op.is_associative() && *child_op == op))))
            }
            (Some(child), _) => child <= op.precedence() && op.precedence() > 2,
            (None, _) => false,
        };
        if needs {
            nested(operand)
        } else {
            operand
        }
    };
    Expression::BinaryOp {
        left: Box::new(wrap(left, false)),
        op,
        right: Box::new(wrap(right, true)),
    }
}

fn unary(op: UnaryOperator, operand: Expression) -> Expression {
    let operand = match operand_precedence(&operand) {
        Some(_) => nested(operand),
        None => operand,
    };
    Expression::UnaryOp {
        op,
        expr: Box::new(operand),
    }
}

/// Operand of IS NULL / IN, which bind tighter than any binary operator.
fn predicate_operand(expr: Expression) -> Box<Expression> {
    Box::new(match operand_precedence(&expr) {
        Some(_) => nested(expr),
        None => expr,
    })
}

fn function(name: &str, args: Vec<Expression>) -> Expression {
    Expression::Function {
        name: name.to_string(),
        args,
    }
}

fn text_literal(value: &str) -> Expression {
    Expression::Literal(Literal::String(value.to_string()))
}

fn integer(value: i64) -> Expression {
    Expression::Literal(Literal::Integer(value))
}

/// Bare keyword argument, such as the unit of `DATEPART(year, x)`.
fn keyword(name: &str) -> Expression {
    Expression::Column {
        table: None,
        name: name.to_string(),
    }
}

fn cast(expr: Expression, data_type: &str) -> Expression {
    Expression::Cast {
        expr: Box::new(expr),
        data_type: data_type.to_string(),
    }
}

fn extract(field: &str, expr: Expression) -> Expression {
    Expression::Extract {
        field: field.to_string(),
        expr: Box::new(expr),
    }
}

/// `EXTRACT` field, `strftime` format and `DATEPART` unit of a calendar part.
fn date_part(method: DateTimeMethod) -> Option<(&'static str, &'static str, &'static str)> {
    Some(match method {
        DateTimeMethod::Year => ("YEAR", "%Y", "year"),
        DateTimeMethod::Month => ("MONTH", "%m", "month"),
        DateTimeMethod::Day => ("DAY", "%d", "day"),
        DateTimeMethod::Hour => ("HOUR", "%H", "hour"),
        DateTimeMethod::Minute => ("MINUTE", "%M", "minute"),
        DateTimeMethod::Second => ("SECOND", "%S", "second"),
        _ => return None,
    })
}

fn conjunction(terms: Vec<Expression>) -> Option<Expression> {
    terms
        .into_iter()
        .reduce(|left, right| binary(left, BinaryOperator::And, right))
}

fn argument<'n>(args: &'n [ExpressionNode], index: usize, method: &Method) -> Result<&'n ExpressionNode> {
    args.get(index).ok_or_else(|| {
        CompileError::unsupported(format!("{} without argument {}", method, index))
    })
}

pub struct Emitter<'c> {
    ctx: &'c CompilationContext,
    schema: &'c dyn SchemaResolver,
    dialect: &'c Dialect,
}

impl<'c> Emitter<'c> {
    pub fn new(ctx: &'c CompilationContext, schema: &'c dyn SchemaResolver, dialect: &'c Dialect) -> Self {
        Self {
            ctx,
            schema,
            dialect,
        }
    }

    pub fn select_statement(&self, id: ScopeId) -> Result<SelectStatement> {
        let scope = self.ctx.scope(id);
        let output = scope
            .output
            .as_ref()
            .ok_or_else(|| CompileError::unsupported(format!("scope {} has no projection", id.0)))?;

        let mut select = SelectStatement {
            distinct: scope.distinct,
            ..SelectStatement::default()
        };
        for column in &output.columns {
            let expr = self.expression(&column.expr)?;
            let alias = match &expr {
                Expression::Column { name, .. } if *name == column.alias => None,
                _ => Some(column.alias.clone()),
            };
            select.projections.push(SelectItem { expr, alias });
        }

        let mut filters = Vec::new();
        for (position, table) in self.ctx.inline_tables(id).into_iter().enumerate() {
            let binding = self.ctx.table(table);
            let source = self.table_source(binding)?;
            let condition = binding
                .join_predicate
                .as_ref()
                .map(|p| self.expression(p))
                .transpose()?;
            if position == 0 {
                select.from.push(source);
                filters.extend(condition);
                continue;
            }
            let join_type = match (binding.join_kind, &condition) {
                (JoinKind::LeftOuter, Some(_)) => JoinType::Left,
                (_, Some(_)) => JoinType::Inner,
                (_, None) => JoinType::Cross,
            };
            select.joins.push(Join {
                join_type,
                table: source,
                condition,
            });
        }

        let mut predicates: Vec<&ExpressionNode> = scope.predicates.iter().collect();
        for child in self.ctx.inline_children(id) {
            predicates.extend(self.ctx.scope(child).predicates.iter());
        }
        for predicate in predicates {
            filters.push(self.expression(predicate)?);
        }
        select.filter = conjunction(filters);

        select.group_by = scope
            .grouping
            .iter()
            .map(|g| self.expression(g))
            .collect::<Result<_>>()?;
        select.having = conjunction(
            scope
                .having
                .iter()
                .map(|h| self.expression(h))
                .collect::<Result<_>>()?,
        );
        for term in &scope.ordering {
            select.order_by.push(OrderByExpr {
                expr: self.expression(&term.expr)?,
                asc: if term.descending { Some(false) } else { None },
            });
        }
        select.limit = scope.limit.as_ref().map(|l| self.expression(l)).transpose()?;
        select.offset = scope.offset.as_ref().map(|o| self.expression(o)).transpose()?;

        if let Some(link) = scope.next {
            let (op, all) = match link.operator {
                SetOperator::Union => (SqlSetOperator::Union, false),
                SetOperator::UnionAll => (SqlSetOperator::Union, true),
                SetOperator::Intersect => (SqlSetOperator::Intersect, false),
                SetOperator::Except => (SqlSetOperator::Except, false),
            };
            select.set_op = Some(Box::new(SetOperation {
                op,
                all,
                right: self.select_statement(link.scope)?,
            }));
        }
        Ok(select)
    }

    fn table_source(&self, binding: &TableBinding) -> Result<TableRef> {
        Ok(match &binding.source {
            TableSource::Entity { table, .. } => TableRef::Table {
                name: table.clone(),
                alias: Some(binding.alias.clone()),
            },
            TableSource::Derived { scope, .. } => TableRef::Subquery {
                query: Box::new(self.select_statement(*scope)?),
                alias: binding.alias.clone(),
            },
        })
    }

    /// Lower one analyzed node.
    pub fn expression(&self, node: &ExpressionNode) -> Result<Expression> {
        match node {
            ExpressionNode::Constant(value) => literal(value).map(Expression::Literal),
            ExpressionNode::InputParameter(index) => {
                let parameter = self.ctx.parameters().get(*index).ok_or_else(|| {
                    CompileError::unsupported(format!("unregistered parameter {}", index))
                })?;
                Ok(Expression::Parameter {
                    name: parameter.name.clone(),
                    ordinal: *index,
                })
            }
            ExpressionNode::ColumnRef { table, member } => {
                let binding = self.ctx.table(*table);
                let name = self.schema.column_name_for(binding, member).ok_or_else(|| {
                    CompileError::mapping(format!("no column for '{}' on {}", member, binding.alias))
                })?;
                Ok(Expression::Column {
                    table: Some(binding.alias.clone()),
                    name: name.to_string(),
                })
            }
            ExpressionNode::ScopeRef(scope) => {
                Ok(Expression::Subquery(Box::new(self.select_statement(*scope)?)))
            }
            ExpressionNode::Binary { op, left, right } => {
                let l = self.expression(left)?;
                let r = self.expression(right)?;
                let op = match op {
                    NodeOperator::Coalesce => return Ok(function("COALESCE", vec![l, r])),
                    NodeOperator::Equal => BinaryOperator::Eq,
                    NodeOperator::NotEqual => BinaryOperator::NotEq,
                    NodeOperator::LessThan => BinaryOperator::Lt,
                    NodeOperator::LessThanOrEqual => BinaryOperator::LtEq,
                    NodeOperator::GreaterThan => BinaryOperator::Gt,
                    NodeOperator::GreaterThanOrEqual => BinaryOperator::GtEq,
                    NodeOperator::AndAlso => BinaryOperator::And,
                    NodeOperator::OrElse => BinaryOperator::Or,
                    NodeOperator::Add => BinaryOperator::Plus,
                    NodeOperator::Subtract => BinaryOperator::Minus,
                    NodeOperator::Multiply => BinaryOperator::Multiply,
                    NodeOperator::Divide => BinaryOperator::Divide,
                    NodeOperator::Modulo => BinaryOperator::Modulo,
                };
                Ok(binary(l, op, r))
            }
            ExpressionNode::Unary { op, operand } => {
                let operand = self.expression(operand)?;
                Ok(match op {
                    NodeUnary::Not => unary(UnaryOperator::Not, operand),
                    NodeUnary::Negate => unary(UnaryOperator::Minus, operand),
                })
            }
            ExpressionNode::Conditional {
                test,
                then,
                otherwise,
            } => Ok(Expression::Case {
                when_clauses: vec![(self.expression(test)?, self.expression(then)?)],
                else_clause: Some(Box::new(self.expression(otherwise)?)),
            }),
            ExpressionNode::Call { method, args, .. } => self.call(method, args),
            ExpressionNode::Grouping { key, .. } => self.expression(key),
            other => Err(CompileError::unsupported(format!(
                "{} in SQL expression",
                other.tag()
            ))),
        }
    }

    fn arguments(&self, args: &[ExpressionNode]) -> Result<Vec<Expression>> {
        let mut out = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                ExpressionNode::Call {
                    method: Method::Sql(SqlOperator::List),
                    args: items,
                    ..
                } => {
                    for item in items {
                        out.push(self.expression(item)?);
                    }
                }
                other => out.push(self.expression(other)?),
            }
        }
        Ok(out)
    }

    fn concat_parts(&self, args: &[ExpressionNode], out: &mut Vec<Expression>) -> Result<()> {
        for arg in args {
            match arg {
                ExpressionNode::Call {
                    method: Method::Sql(SqlOperator::Concat),
                    args: inner,
                    ..
                } => self.concat_parts(inner, out)?,
                other => out.push(self.expression(other)?),
            }
        }
        Ok(())
    }

    fn call(&self, method: &Method, args: &[ExpressionNode]) -> Result<Expression> {
        match method {
            Method::Query(op) => {
                let name = match op {
                    QueryOperator::Count => {
                        return Ok(function("COUNT", vec![Expression::Wildcard]));
                    }
                    QueryOperator::Sum => "SUM",
                    QueryOperator::Min => "MIN",
                    QueryOperator::Max => "MAX",
                    QueryOperator::Average => "AVG",
                    op => {
                        return Err(CompileError::unsupported(format!(
                            "{} in SQL expression",
                            op
                        )))
                    }
                };
                Ok(function(name, self.arguments(args)?))
            }
            Method::Sql(op) => self.sql_operator(*op, method, args),
            Method::Text(m) => self.text_function(*m, self.arguments(args)?),
            Method::Math(m) => self.math_function(*m, self.arguments(args)?),
            Method::DateTime(m) => self.date_time_function(*m, self.arguments(args)?),
            Method::Convert(target) => {
                let data_type = self.dialect.type_name(target).ok_or_else(|| {
                    CompileError::unsupported(format!("conversion to {}", target))
                })?;
                let value = self.expression(argument(args, 0, method)?)?;
                Ok(cast(value, data_type))
            }
            Method::Function(name) => Ok(function(name, self.arguments(args)?)),
        }
    }

    fn text_function(&self, method: TextMethod, mut args: Vec<Expression>) -> Result<Expression> {
        let style = self.dialect.functions;
        let name = match (method, style) {
            (TextMethod::ToUpper, _) => "UPPER",
            (TextMethod::ToLower, _) => "LOWER",
            (TextMethod::Trim, _) => "TRIM",
            (TextMethod::TrimStart, _) => "LTRIM",
            (TextMethod::TrimEnd, _) => "RTRIM",
            (TextMethod::Length, FunctionStyle::SqlServer) => "LEN",
            (TextMethod::Length, _) => "LENGTH",
            (TextMethod::Substring, FunctionStyle::SqlServer) if args.len() == 2 => {
                // SUBSTRING requires a length on SQL Server.
                let rest = function("LEN", vec![args[0].clone()]);
                args.push(rest);
                "SUBSTRING"
            }
            (TextMethod::Substring, _) => "SUBSTRING",
            (TextMethod::Replace, _) => "REPLACE",
            (TextMethod::IndexOf, FunctionStyle::Standard) => "INSTR",
            (TextMethod::IndexOf, FunctionStyle::Postgres) => "STRPOS",
            (TextMethod::IndexOf, FunctionStyle::SqlServer) => {
                args.reverse();
                "CHARINDEX"
            }
            (
                TextMethod::Contains
                | TextMethod::StartsWith
                | TextMethod::EndsWith
                | TextMethod::Insert
                | TextMethod::Remove,
                _,
            ) => return Err(CompileError::unsupported(format!("{:?} without lowering", method))),
        };
        Ok(function(name, args))
    }

    fn math_function(&self, method: MathMethod, mut args: Vec<Expression>) -> Result<Expression> {
        let name = match method {
            MathMethod::Abs => "ABS",
            MathMethod::Floor => "FLOOR",
            MathMethod::Ceiling => "CEILING",
            MathMethod::Round => "ROUND",
            MathMethod::Sqrt => "SQRT",
            MathMethod::Exp => "EXP",
            MathMethod::Pow => "POWER",
            MathMethod::Sign => "SIGN",
            MathMethod::Log10 => "LOG10",
            // SQL Server spells both forms LOG(value [, base]).
            MathMethod::Log if self.dialect.functions == FunctionStyle::SqlServer => "LOG",
            MathMethod::Log if args.len() == 1 => "LN",
            MathMethod::Log => {
                // Log(value, base) is LOG(base, value) elsewhere.
                args.reverse();
                "LOG"
            }
        };
        Ok(function(name, args))
    }

    fn date_time_function(&self, method: DateTimeMethod, args: Vec<Expression>) -> Result<Expression> {
        let style = self.dialect.functions;
        let mut args = args.into_iter();
        let value = args.next().ok_or_else(|| {
            CompileError::unsupported(format!("{:?} without a date-time operand", method))
        })?;

        if method == DateTimeMethod::DiffMilliseconds {
            let earlier = args.next().ok_or_else(|| {
                CompileError::unsupported("date-time difference without a second operand")
            })?;
            return Ok(match style {
                FunctionStyle::Standard => binary(
                    binary(
                        function("julianday", vec![value]),
                        BinaryOperator::Minus,
                        function("julianday", vec![earlier]),
                    ),
                    BinaryOperator::Multiply,
                    integer(86_400_000),
                ),
                FunctionStyle::Postgres => binary(
                    extract("EPOCH", binary(value, BinaryOperator::Minus, earlier)),
                    BinaryOperator::Multiply,
                    integer(1000),
                ),
                FunctionStyle::SqlServer => {
                    function("DATEDIFF", vec![keyword("millisecond"), earlier, value])
                }
            });
        }

        Ok(match (method, style) {
            (DateTimeMethod::Date, FunctionStyle::Standard) => function("DATE", vec![value]),
            (DateTimeMethod::Date, FunctionStyle::Postgres) => {
                function("DATE_TRUNC", vec![text_literal("day"), value])
            }
            (DateTimeMethod::Date, FunctionStyle::SqlServer) => cast(value, "DATE"),
            (DateTimeMethod::Millisecond, FunctionStyle::Standard) => binary(
                cast(
                    binary(
                        function("strftime", vec![text_literal("%f"), value]),
                        BinaryOperator::Multiply,
                        integer(1000),
                    ),
                    "INTEGER",
                ),
                BinaryOperator::Modulo,
                integer(1000),
            ),
            (DateTimeMethod::Millisecond, FunctionStyle::Postgres) => function(
                "MOD",
                vec![
                    function("FLOOR", vec![extract("MILLISECONDS", value)]),
                    integer(1000),
                ],
            ),
            (DateTimeMethod::Millisecond, FunctionStyle::SqlServer) => {
                function("DATEPART", vec![keyword("millisecond"), value])
            }
            (DateTimeMethod::Second, FunctionStyle::Postgres) => {
                function("FLOOR", vec![extract("SECOND", value)])
            }
            (part, style) => {
                let (field, format, unit) = date_part(part).ok_or_else(|| {
                    CompileError::unsupported(format!("{:?} as a calendar part", part))
                })?;
                match style {
                    FunctionStyle::Standard => cast(
                        function("strftime", vec![text_literal(format), value]),
                        "INTEGER",
                    ),
                    FunctionStyle::Postgres => extract(field, value),
                    FunctionStyle::SqlServer => function("DATEPART", vec![keyword(unit), value]),
                }
            }
        })
    }

    fn sql_operator(&self, op: SqlOperator, method: &Method, args: &[ExpressionNode]) -> Result<Expression> {
        match op {
            SqlOperator::Like => {
                let value = self.expression(argument(args, 0, method)?)?;
                let pattern = self.expression(argument(args, 1, method)?)?;
                Ok(binary(value, BinaryOperator::Like, pattern))
            }
            SqlOperator::Concat => {
                let mut parts = Vec::new();
                self.concat_parts(args, &mut parts)?;
                Ok(match self.dialect.concat_style {
                    ConcatStyle::Function => function("CONCAT", parts),
                    ConcatStyle::Pipes => parts
                        .into_iter()
                        .reduce(|left, right| binary(left, BinaryOperator::Concat, right))
                        .unwrap_or(Expression::Literal(Literal::String(String::new()))),
                })
            }
            SqlOperator::In => {
                let value = predicate_operand(self.expression(argument(args, 0, method)?)?);
                match argument(args, 1, method)? {
                    ExpressionNode::ScopeRef(scope) => Ok(Expression::InSubquery {
                        expr: value,
                        subquery: Box::new(self.select_statement(*scope)?),
                        negated: false,
                    }),
                    ExpressionNode::Call {
                        method: Method::Sql(SqlOperator::List),
                        args: items,
                        ..
                    } => Ok(Expression::InList {
                        expr: value,
                        list: items
                            .iter()
                            .map(|item| self.expression(item))
                            .collect::<Result<_>>()?,
                        negated: false,
                    }),
                    other => Err(CompileError::unsupported(format!(
                        "IN over {}",
                        other.tag()
                    ))),
                }
            }
            SqlOperator::IsNull | SqlOperator::IsNotNull => Ok(Expression::IsNull {
                expr: predicate_operand(self.expression(argument(args, 0, method)?)?),
                negated: op == SqlOperator::IsNotNull,
            }),
            SqlOperator::Exists => match argument(args, 0, method)? {
                ExpressionNode::ScopeRef(scope) => {
                    Ok(Expression::Exists(Box::new(self.select_statement(*scope)?)))
                }
                other => Err(CompileError::unsupported(format!(
                    "EXISTS over {}",
                    other.tag()
                ))),
            },
            SqlOperator::List => Err(CompileError::unsupported("value list outside IN or a call")),
        }
    }
}

fn literal(value: &Value) -> Result<Literal> {
    Ok(match value {
        Value::Null => Literal::Null,
        Value::Bool(b) => Literal::Boolean(*b),
        Value::Int(i) => Literal::Integer(*i),
        Value::Float(f) => Literal::Float(*f),
        Value::Text(s) => Literal::String(s.clone()),
        Value::DateTime(t) => Literal::String(t.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
        other => {
            return Err(CompileError::unsupported(format!(
                "{} literal",
                other.value_type()
            )))
        }
    })
}
