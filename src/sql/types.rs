//! SQL statement AST.
//!
//! The emitter lowers a populated scope tree into these nodes and the
//! renderer turns them into text for the configured dialect. Nothing here
//! knows about entities or scopes:
//! - table and column names are already resolved
//! - parameters carry both their name and their ordinal
//! - precedence is explicit through [`Expression::Nested`]

/// Top-level statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(Box<SelectStatement>),
    Insert(InsertStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
}

/// A SELECT with all clauses the compiler emits.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectStatement {
    pub distinct: bool,
    pub projections: Vec<SelectItem>,
    pub from: Vec<TableRef>,
    pub joins: Vec<Join>,
    pub filter: Option<Expression>,
    pub group_by: Vec<Expression>,
    pub having: Option<Expression>,
    pub order_by: Vec<OrderByExpr>,
    pub limit: Option<Expression>,
    pub offset: Option<Expression>,
    /// UNION / INTERSECT / EXCEPT with the next operand.
    pub set_op: Option<Box<SetOperation>>,
}

/// A single item in the SELECT projection list: `expr` or `expr AS alias`.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectItem {
    pub expr: Expression,
    pub alias: Option<String>,
}

/// Table reference in a FROM clause or join.
#[derive(Debug, Clone, PartialEq)]
pub enum TableRef {
    /// `table alias`
    Table { name: String, alias: Option<String> },
    /// `(SELECT ...) alias`
    Subquery {
        query: Box<SelectStatement>,
        alias: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub join_type: JoinType,
    pub table: TableRef,
    pub condition: Option<Expression>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
    Cross,
}

/// Scalar expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// `table.column` or just `column`.
    Column { table: Option<String>, name: String },
    Literal(Literal),
    /// Bound parameter; rendered by the dialect from name or ordinal.
    Parameter { name: String, ordinal: usize },
    BinaryOp {
        left: Box<Expression>,
        op: BinaryOperator,
        right: Box<Expression>,
    },
    UnaryOp {
        op: UnaryOperator,
        expr: Box<Expression>,
    },
    /// Scalar or aggregate function call: `name(args)`.
    Function { name: String, args: Vec<Expression> },
    /// `CAST(expr AS data_type)`
    Cast {
        expr: Box<Expression>,
        data_type: String,
    },
    /// `EXTRACT(field FROM expr)`
    Extract {
        field: String,
        expr: Box<Expression>,
    },
    /// Searched CASE.
    Case {
        when_clauses: Vec<(Expression, Expression)>,
        else_clause: Option<Box<Expression>>,
    },
    Subquery(Box<SelectStatement>),
    Exists(Box<SelectStatement>),
    InList {
        expr: Box<Expression>,
        list: Vec<Expression>,
        negated: bool,
    },
    InSubquery {
        expr: Box<Expression>,
        subquery: Box<SelectStatement>,
        negated: bool,
    },
    IsNull {
        expr: Box<Expression>,
        negated: bool,
    },
    /// `*` inside `COUNT(*)`.
    Wildcard,
    /// Parenthesized expression.
    Nested(Box<Expression>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    // Comparison
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Like,
    // Logical
    And,
    Or,
    // Arithmetic
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
    // String
    Concat,
}

impl BinaryOperator {
    /// Binding strength; higher binds tighter.
    pub fn precedence(self) -> u8 {
        match self {
            BinaryOperator::Or => 1,
            BinaryOperator::And => 2,
            BinaryOperator::Eq
            | BinaryOperator::NotEq
            | BinaryOperator::Lt
            | BinaryOperator::LtEq
            | BinaryOperator::Gt
            | BinaryOperator::GtEq
            | BinaryOperator::Like => 4,
            BinaryOperator::Concat => 5,
            BinaryOperator::Plus | BinaryOperator::Minus => 6,
            BinaryOperator::Multiply | BinaryOperator::Divide | BinaryOperator::Modulo => 7,
        }
    }

    pub fn is_associative(self) -> bool {
        matches!(
            self,
            BinaryOperator::And
                | BinaryOperator::Or
                | BinaryOperator::Plus
                | BinaryOperator::Multiply
                | BinaryOperator::Concat
        )
    }

    pub fn is_comparison(self) -> bool {
        self.precedence() == 4
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Not,
    Minus,
}

/// ORDER BY term. `asc: None` leaves the direction implicit.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderByExpr {
    pub expr: Expression,
    pub asc: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetOperation {
    pub op: SetOperator,
    pub all: bool,
    pub right: SelectStatement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOperator {
    Union,
    Intersect,
    Except,
}

/// INSERT of a single row. An empty column list renders `DEFAULT VALUES`.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    pub table: String,
    pub columns: Vec<String>,
    pub values: Vec<Expression>,
    pub returning: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatement {
    pub table: String,
    pub assignments: Vec<Assignment>,
    pub filter: Option<Expression>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub column: String,
    pub value: Expression,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStatement {
    pub table: String,
    pub filter: Option<Expression>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_select_statement() {
        let q = SelectStatement::default();
        assert!(!q.distinct);
        assert!(q.projections.is_empty());
        assert!(q.from.is_empty());
        assert!(q.filter.is_none());
        assert!(q.limit.is_none());
    }

    #[test]
    fn test_precedence_ordering() {
        assert!(BinaryOperator::Or.precedence() < BinaryOperator::And.precedence());
        assert!(BinaryOperator::And.precedence() < BinaryOperator::Eq.precedence());
        assert!(BinaryOperator::Eq.precedence() < BinaryOperator::Concat.precedence());
        assert!(BinaryOperator::Plus.precedence() < BinaryOperator::Multiply.precedence());
        assert!(BinaryOperator::Like.is_comparison());
        assert!(!BinaryOperator::Minus.is_associative());
    }
}
