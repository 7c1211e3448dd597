/// Expression model shared by the front end and the analyzer.
///
/// Source-side nodes (constants, parameters, member access, calls, lambdas,
/// `new` projections, conditionals, operators) are what a caller builds.
/// The analyzer rewrites them into the SQL-domain nodes (`TableRef`,
/// `ColumnRef`, `ScopeRef`) and the analyzed-only forms
/// (`InputParameter`, `Grouping`). Nodes are never mutated once built.
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::mem;

use super::binding::{ScopeId, TableId};
use super::chain::OperatorChain;

// ---------------------------------------------------------------------------
// Values and types
// ---------------------------------------------------------------------------

/// Static type of a member, parameter or projected column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Null,
    Bool,
    Int,
    Float,
    Text,
    #[serde(rename = "datetime")]
    DateTime,
    Entity(String),
    Array(Box<ValueType>),
    Sequence(Box<ValueType>),
    Any,
}

impl ValueType {
    /// Whether a value of type `other` can be bound where `self` is declared.
    pub fn accepts(&self, other: &ValueType) -> bool {
        match (self, other) {
            (ValueType::Any, _) | (_, ValueType::Any) | (_, ValueType::Null) => true,
            (ValueType::Float, ValueType::Int) => true,
            (ValueType::Array(a), ValueType::Array(b)) => a.accepts(b),
            (ValueType::Sequence(a), ValueType::Sequence(b)) => a.accepts(b),
            (a, b) => a == b,
        }
    }

    /// Element type of an array or sequence.
    pub fn element(&self) -> Option<&ValueType> {
        match self {
            ValueType::Array(inner) | ValueType::Sequence(inner) => Some(inner),
            _ => None,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, ValueType::Array(_))
    }

    /// The value a null column takes when nulls map to defaults.
    pub fn default_value(&self) -> Value {
        match self {
            ValueType::Bool => Value::Bool(false),
            ValueType::Int => Value::Int(0),
            ValueType::Float => Value::Float(0.0),
            ValueType::Text => Value::Text(String::new()),
            ValueType::Array(_) => Value::List(Vec::new()),
            _ => Value::Null,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Null => write!(f, "null"),
            ValueType::Bool => write!(f, "bool"),
            ValueType::Int => write!(f, "int"),
            ValueType::Float => write!(f, "float"),
            ValueType::Text => write!(f, "text"),
            ValueType::DateTime => write!(f, "datetime"),
            ValueType::Entity(name) => write!(f, "{}", name),
            ValueType::Array(inner) => write!(f, "array<{}>", inner),
            ValueType::Sequence(inner) => write!(f, "sequence<{}>", inner),
            ValueType::Any => write!(f, "any"),
        }
    }
}

/// A constant captured in a chain, a row cell, or a materialized result.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    DateTime(NaiveDateTime),
    List(Vec<Value>),
    /// Queryable source for an entity type.
    Table(String),
    /// Nested operator chain.
    Query(Box<OperatorChain>),
    Entity(EntityInstance),
}

impl Value {
    pub fn text(value: impl Into<String>) -> Self {
        Value::Text(value.into())
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Null => ValueType::Null,
            Value::Bool(_) => ValueType::Bool,
            Value::Int(_) => ValueType::Int,
            Value::Float(_) => ValueType::Float,
            Value::Text(_) => ValueType::Text,
            Value::DateTime(_) => ValueType::DateTime,
            Value::List(items) => {
                let element = items
                    .iter()
                    .map(Value::value_type)
                    .find(|t| *t != ValueType::Null)
                    .unwrap_or(ValueType::Any);
                ValueType::Array(Box::new(element))
            }
            Value::Table(entity) => {
                ValueType::Sequence(Box::new(ValueType::Entity(entity.clone())))
            }
            Value::Query(_) => ValueType::Sequence(Box::new(ValueType::Any)),
            Value::Entity(instance) => ValueType::Entity(instance.type_name.clone()),
        }
    }

    /// Data constants are bound as parameters; everything else shapes the query.
    pub fn is_data(&self) -> bool {
        matches!(
            self,
            Value::Bool(_)
                | Value::Int(_)
                | Value::Float(_)
                | Value::Text(_)
                | Value::DateTime(_)
                | Value::List(_)
        )
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Data constants compare by type; shape constants compare by value.
    pub fn same_shape(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(_), Value::Bool(_))
            | (Value::Int(_), Value::Int(_))
            | (Value::Float(_), Value::Float(_))
            | (Value::Text(_), Value::Text(_))
            | (Value::DateTime(_), Value::DateTime(_)) => true,
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_shape(y))
            }
            (Value::Table(a), Value::Table(b)) => a == b,
            (Value::Query(a), Value::Query(b)) => a == b,
            (Value::Entity(a), Value::Entity(b)) => a == b,
            _ => false,
        }
    }

    pub fn hash_shape<H: Hasher>(&self, state: &mut H) {
        mem::discriminant(self).hash(state);
        match self {
            Value::List(items) => {
                items.len().hash(state);
                for item in items {
                    item.hash_shape(state);
                }
            }
            Value::Table(entity) => entity.hash(state),
            Value::Query(chain) => chain.hash(state),
            Value::Entity(instance) => {
                instance.type_name.hash(state);
                for (name, _) in &instance.members {
                    name.hash(state);
                }
            }
            _ => {}
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::DateTime(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

/// A typed record: the target of mutations and the output of materializers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EntityInstance {
    pub type_name: String,
    /// Members in declared order.
    pub members: Vec<(String, Value)>,
}

impl EntityInstance {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            members: Vec::new(),
        }
    }

    pub fn with(mut self, member: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(member, value);
        self
    }

    pub fn get(&self, member: &str) -> Option<&Value> {
        self.members
            .iter()
            .find(|(name, _)| name == member)
            .map(|(_, value)| value)
    }

    pub fn set(&mut self, member: impl Into<String>, value: impl Into<Value>) {
        let member = member.into();
        let value = value.into();
        match self.members.iter_mut().find(|(name, _)| *name == member) {
            Some(slot) => slot.1 = value,
            None => self.members.push((member, value)),
        }
    }
}

// ---------------------------------------------------------------------------
// Operators and methods
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOperator {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    AndAlso,
    OrElse,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    /// `a ?? b`
    Coalesce,
}

impl BinaryOperator {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOperator::Equal
                | BinaryOperator::NotEqual
                | BinaryOperator::LessThan
                | BinaryOperator::LessThanOrEqual
                | BinaryOperator::GreaterThan
                | BinaryOperator::GreaterThanOrEqual
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOperator::AndAlso | BinaryOperator::OrElse)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOperator {
    Not,
    Negate,
}

/// Query operators, usable both as chain elements and inside lambdas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryOperator {
    Where,
    Select,
    SelectMany,
    Join,
    /// Join whose result selector sees the matching inner rows as a group.
    GroupJoin,
    DefaultIfEmpty,
    OrderBy,
    OrderByDescending,
    ThenBy,
    ThenByDescending,
    Take,
    Skip,
    Distinct,
    GroupBy,
    Union,
    Concat,
    Intersect,
    Except,
    Count,
    Sum,
    Min,
    Max,
    Average,
    Any,
    All,
    First,
    FirstOrDefault,
    Single,
    SingleOrDefault,
    Last,
    Contains,
}

impl QueryOperator {
    pub fn name(self) -> &'static str {
        match self {
            QueryOperator::Where => "Where",
            QueryOperator::Select => "Select",
            QueryOperator::SelectMany => "SelectMany",
            QueryOperator::Join => "Join",
            QueryOperator::GroupJoin => "GroupJoin",
            QueryOperator::DefaultIfEmpty => "DefaultIfEmpty",
            QueryOperator::OrderBy => "OrderBy",
            QueryOperator::OrderByDescending => "OrderByDescending",
            QueryOperator::ThenBy => "ThenBy",
            QueryOperator::ThenByDescending => "ThenByDescending",
            QueryOperator::Take => "Take",
            QueryOperator::Skip => "Skip",
            QueryOperator::Distinct => "Distinct",
            QueryOperator::GroupBy => "GroupBy",
            QueryOperator::Union => "Union",
            QueryOperator::Concat => "Concat",
            QueryOperator::Intersect => "Intersect",
            QueryOperator::Except => "Except",
            QueryOperator::Count => "Count",
            QueryOperator::Sum => "Sum",
            QueryOperator::Min => "Min",
            QueryOperator::Max => "Max",
            QueryOperator::Average => "Average",
            QueryOperator::Any => "Any",
            QueryOperator::All => "All",
            QueryOperator::First => "First",
            QueryOperator::FirstOrDefault => "FirstOrDefault",
            QueryOperator::Single => "Single",
            QueryOperator::SingleOrDefault => "SingleOrDefault",
            QueryOperator::Last => "Last",
            QueryOperator::Contains => "Contains",
        }
    }

    pub fn is_aggregate(self) -> bool {
        matches!(
            self,
            QueryOperator::Count
                | QueryOperator::Sum
                | QueryOperator::Min
                | QueryOperator::Max
                | QueryOperator::Average
        )
    }

    pub fn is_quantifier(self) -> bool {
        matches!(
            self,
            QueryOperator::Any | QueryOperator::All | QueryOperator::Contains
        )
    }

    pub fn is_element(self) -> bool {
        matches!(
            self,
            QueryOperator::First
                | QueryOperator::FirstOrDefault
                | QueryOperator::Single
                | QueryOperator::SingleOrDefault
                | QueryOperator::Last
        )
    }

    pub fn is_set(self) -> bool {
        matches!(
            self,
            QueryOperator::Union
                | QueryOperator::Concat
                | QueryOperator::Intersect
                | QueryOperator::Except
        )
    }

    /// Operators that end a chain and yield a single value.
    pub fn is_terminal(self) -> bool {
        self.is_aggregate() || self.is_quantifier() || self.is_element()
    }
}

impl fmt::Display for QueryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextMethod {
    Contains,
    StartsWith,
    EndsWith,
    ToUpper,
    ToLower,
    Trim,
    TrimStart,
    TrimEnd,
    Length,
    Substring,
    Replace,
    IndexOf,
    /// `s.Insert(index, value)`
    Insert,
    /// `s.Remove(index)` or `s.Remove(index, count)`
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MathMethod {
    Abs,
    Floor,
    Ceiling,
    Round,
    Sqrt,
    Exp,
    Pow,
    Sign,
    Log,
    Log10,
}

/// Calendar parts of a date-time, plus the millisecond difference two
/// date-times lower to when a duration member is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DateTimeMethod {
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
    Millisecond,
    /// Midnight of the same day.
    Date,
    /// Milliseconds from the second argument to the first.
    DiffMilliseconds,
}

impl DateTimeMethod {
    /// The calendar part read by a date-time member, if any.
    pub fn from_member(member: &str) -> Option<Self> {
        Some(match member {
            "Year" => DateTimeMethod::Year,
            "Month" => DateTimeMethod::Month,
            "Day" => DateTimeMethod::Day,
            "Hour" => DateTimeMethod::Hour,
            "Minute" => DateTimeMethod::Minute,
            "Second" => DateTimeMethod::Second,
            "Millisecond" => DateTimeMethod::Millisecond,
            "Date" => DateTimeMethod::Date,
            _ => return None,
        })
    }
}

/// SQL-only forms the analyzer lowers source constructs into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlOperator {
    Like,
    Concat,
    In,
    List,
    IsNull,
    IsNotNull,
    Exists,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Query(QueryOperator),
    Text(TextMethod),
    Math(MathMethod),
    DateTime(DateTimeMethod),
    /// `ToString()` on a receiver, or a static `Parse(text)`: the value
    /// converted to the given type.
    Convert(ValueType),
    /// Schema-mapped scalar function, by member name before analysis and by
    /// SQL name after.
    Function(String),
    Sql(SqlOperator),
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Query(op) => write!(f, "{}", op),
            Method::Text(m) => write!(f, "{:?}", m),
            Method::Math(m) => write!(f, "{:?}", m),
            Method::DateTime(m) => write!(f, "{:?}", m),
            Method::Convert(target) => write!(f, "Convert<{}>", target),
            Method::Function(name) => write!(f, "{}", name),
            Method::Sql(op) => write!(f, "{:?}", op),
        }
    }
}

// ---------------------------------------------------------------------------
// Expression nodes
// ---------------------------------------------------------------------------

/// A node of the expression tree.
///
/// Equality and hashing are structural: same variant, same children,
/// recursively. Data constants compare by type only, so two chains that
/// differ only in captured values are the same cache key.
#[derive(Debug, Clone)]
pub enum ExpressionNode {
    Constant(Value),
    /// Lambda parameter reference.
    Parameter(String),
    MemberAccess {
        target: Box<ExpressionNode>,
        member: String,
    },
    /// Method call. Chain operators have no target; nested query operators
    /// and text methods carry their receiver as the target.
    Call {
        target: Option<Box<ExpressionNode>>,
        method: Method,
        args: Vec<ExpressionNode>,
    },
    Lambda {
        params: Vec<String>,
        body: Box<ExpressionNode>,
    },
    /// Object construction. `members[i]` names `args[i]`.
    New {
        type_name: String,
        members: Vec<String>,
        args: Vec<ExpressionNode>,
    },
    Conditional {
        test: Box<ExpressionNode>,
        then: Box<ExpressionNode>,
        otherwise: Box<ExpressionNode>,
    },
    Binary {
        op: BinaryOperator,
        left: Box<ExpressionNode>,
        right: Box<ExpressionNode>,
    },
    Unary {
        op: UnaryOperator,
        operand: Box<ExpressionNode>,
    },
    TableRef(TableId),
    ColumnRef {
        table: TableId,
        member: String,
    },
    ScopeRef(ScopeId),
    /// Index into the compiled query's parameter list.
    InputParameter(usize),
    /// Element of a grouped sequence: the key and the per-row element.
    Grouping {
        key: Box<ExpressionNode>,
        element: Box<ExpressionNode>,
    },
}

impl ExpressionNode {
    // -- constructors -------------------------------------------------------

    pub fn constant(value: impl Into<Value>) -> Self {
        ExpressionNode::Constant(value.into())
    }

    pub fn null() -> Self {
        ExpressionNode::Constant(Value::Null)
    }

    /// Queryable root for an entity type.
    pub fn table(entity: impl Into<String>) -> Self {
        ExpressionNode::Constant(Value::Table(entity.into()))
    }

    /// Nested chain used as a sequence inside a lambda.
    pub fn query(chain: OperatorChain) -> Self {
        ExpressionNode::Constant(Value::Query(Box::new(chain)))
    }

    pub fn param(name: impl Into<String>) -> Self {
        ExpressionNode::Parameter(name.into())
    }

    pub fn member(target: ExpressionNode, member: impl Into<String>) -> Self {
        ExpressionNode::MemberAccess {
            target: Box::new(target),
            member: member.into(),
        }
    }

    /// `param.member`, the most common lambda body leaf.
    pub fn path(param: &str, members: &[&str]) -> Self {
        members
            .iter()
            .fold(ExpressionNode::param(param), |node, m| {
                ExpressionNode::member(node, *m)
            })
    }

    pub fn lambda(params: &[&str], body: ExpressionNode) -> Self {
        ExpressionNode::Lambda {
            params: params.iter().map(|p| p.to_string()).collect(),
            body: Box::new(body),
        }
    }

    /// Static or free call with no receiver.
    pub fn call(method: Method, args: Vec<ExpressionNode>) -> Self {
        ExpressionNode::Call {
            target: None,
            method,
            args,
        }
    }

    /// Call on a receiver: `target.method(args)`.
    pub fn method(target: ExpressionNode, method: Method, args: Vec<ExpressionNode>) -> Self {
        ExpressionNode::Call {
            target: Some(Box::new(target)),
            method,
            args,
        }
    }

    pub fn new_object(type_name: impl Into<String>, fields: Vec<(&str, ExpressionNode)>) -> Self {
        let (members, args) = fields
            .into_iter()
            .map(|(name, arg)| (name.to_string(), arg))
            .unzip();
        ExpressionNode::New {
            type_name: type_name.into(),
            members,
            args,
        }
    }

    pub fn conditional(test: ExpressionNode, then: ExpressionNode, otherwise: ExpressionNode) -> Self {
        ExpressionNode::Conditional {
            test: Box::new(test),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        }
    }

    pub fn binary(op: BinaryOperator, left: ExpressionNode, right: ExpressionNode) -> Self {
        ExpressionNode::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn equal(left: ExpressionNode, right: ExpressionNode) -> Self {
        Self::binary(BinaryOperator::Equal, left, right)
    }

    pub fn not_equal(left: ExpressionNode, right: ExpressionNode) -> Self {
        Self::binary(BinaryOperator::NotEqual, left, right)
    }

    pub fn less_than(left: ExpressionNode, right: ExpressionNode) -> Self {
        Self::binary(BinaryOperator::LessThan, left, right)
    }

    pub fn greater_than(left: ExpressionNode, right: ExpressionNode) -> Self {
        Self::binary(BinaryOperator::GreaterThan, left, right)
    }

    pub fn and_also(left: ExpressionNode, right: ExpressionNode) -> Self {
        Self::binary(BinaryOperator::AndAlso, left, right)
    }

    pub fn or_else(left: ExpressionNode, right: ExpressionNode) -> Self {
        Self::binary(BinaryOperator::OrElse, left, right)
    }

    pub fn plus(left: ExpressionNode, right: ExpressionNode) -> Self {
        Self::binary(BinaryOperator::Add, left, right)
    }

    pub fn minus(left: ExpressionNode, right: ExpressionNode) -> Self {
        Self::binary(BinaryOperator::Subtract, left, right)
    }

    pub fn unary(op: UnaryOperator, operand: ExpressionNode) -> Self {
        ExpressionNode::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn negation(operand: ExpressionNode) -> Self {
        Self::unary(UnaryOperator::Not, operand)
    }

    // -- inspection ---------------------------------------------------------

    /// Variant name, used in diagnostics.
    pub fn tag(&self) -> &'static str {
        match self {
            ExpressionNode::Constant(_) => "Constant",
            ExpressionNode::Parameter(_) => "Parameter",
            ExpressionNode::MemberAccess { .. } => "MemberAccess",
            ExpressionNode::Call { .. } => "Call",
            ExpressionNode::Lambda { .. } => "Lambda",
            ExpressionNode::New { .. } => "New",
            ExpressionNode::Conditional { .. } => "Conditional",
            ExpressionNode::Binary { .. } => "Binary",
            ExpressionNode::Unary { .. } => "Unary",
            ExpressionNode::TableRef(_) => "TableRef",
            ExpressionNode::ColumnRef { .. } => "ColumnRef",
            ExpressionNode::ScopeRef(_) => "ScopeRef",
            ExpressionNode::InputParameter(_) => "InputParameter",
            ExpressionNode::Grouping { .. } => "Grouping",
        }
    }

    /// Direct children in evaluation order.
    pub fn children(&self) -> Vec<&ExpressionNode> {
        match self {
            ExpressionNode::MemberAccess { target, .. } => vec![target.as_ref()],
            ExpressionNode::Call { target, args, .. } => {
                target.iter().map(|t| t.as_ref()).chain(args.iter()).collect()
            }
            ExpressionNode::Lambda { body, .. } => vec![body.as_ref()],
            ExpressionNode::New { args, .. } => args.iter().collect(),
            ExpressionNode::Conditional {
                test,
                then,
                otherwise,
            } => vec![test.as_ref(), then.as_ref(), otherwise.as_ref()],
            ExpressionNode::Binary { left, right, .. } => vec![left.as_ref(), right.as_ref()],
            ExpressionNode::Unary { operand, .. } => vec![operand.as_ref()],
            ExpressionNode::Grouping { key, element } => vec![key.as_ref(), element.as_ref()],
            _ => Vec::new(),
        }
    }

    pub fn as_constant(&self) -> Option<&Value> {
        match self {
            ExpressionNode::Constant(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_null_constant(&self) -> bool {
        matches!(self, ExpressionNode::Constant(Value::Null))
    }

    pub fn structurally_equal(&self, other: &ExpressionNode) -> bool {
        use ExpressionNode as N;
        match (self, other) {
            (N::Constant(a), N::Constant(b)) => a.same_shape(b),
            (N::Parameter(a), N::Parameter(b)) => a == b,
            (
                N::MemberAccess {
                    target: t1,
                    member: m1,
                },
                N::MemberAccess {
                    target: t2,
                    member: m2,
                },
            ) => m1 == m2 && t1.structurally_equal(t2),
            (
                N::Call {
                    target: t1,
                    method: m1,
                    args: a1,
                },
                N::Call {
                    target: t2,
                    method: m2,
                    args: a2,
                },
            ) => {
                let targets = match (t1, t2) {
                    (Some(x), Some(y)) => x.structurally_equal(y),
                    (None, None) => true,
                    _ => false,
                };
                m1 == m2 && targets && all_equal(a1, a2)
            }
            (
                N::Lambda {
                    params: p1,
                    body: b1,
                },
                N::Lambda {
                    params: p2,
                    body: b2,
                },
            ) => p1 == p2 && b1.structurally_equal(b2),
            (
                N::New {
                    type_name: n1,
                    members: m1,
                    args: a1,
                },
                N::New {
                    type_name: n2,
                    members: m2,
                    args: a2,
                },
            ) => n1 == n2 && m1 == m2 && all_equal(a1, a2),
            (
                N::Conditional {
                    test: c1,
                    then: t1,
                    otherwise: e1,
                },
                N::Conditional {
                    test: c2,
                    then: t2,
                    otherwise: e2,
                },
            ) => c1.structurally_equal(c2) && t1.structurally_equal(t2) && e1.structurally_equal(e2),
            (
                N::Binary {
                    op: o1,
                    left: l1,
                    right: r1,
                },
                N::Binary {
                    op: o2,
                    left: l2,
                    right: r2,
                },
            ) => o1 == o2 && l1.structurally_equal(l2) && r1.structurally_equal(r2),
            (
                N::Unary {
                    op: o1,
                    operand: x1,
                },
                N::Unary {
                    op: o2,
                    operand: x2,
                },
            ) => o1 == o2 && x1.structurally_equal(x2),
            (N::TableRef(a), N::TableRef(b)) => a == b,
            (
                N::ColumnRef {
                    table: t1,
                    member: m1,
                },
                N::ColumnRef {
                    table: t2,
                    member: m2,
                },
            ) => t1 == t2 && m1 == m2,
            (N::ScopeRef(a), N::ScopeRef(b)) => a == b,
            (N::InputParameter(a), N::InputParameter(b)) => a == b,
            (
                N::Grouping {
                    key: k1,
                    element: e1,
                },
                N::Grouping {
                    key: k2,
                    element: e2,
                },
            ) => k1.structurally_equal(k2) && e1.structurally_equal(e2),
            _ => false,
        }
    }

    /// Hash consistent with [`structurally_equal`](Self::structurally_equal).
    pub fn hash_shape<H: Hasher>(&self, state: &mut H) {
        mem::discriminant(self).hash(state);
        match self {
            ExpressionNode::Constant(value) => value.hash_shape(state),
            ExpressionNode::Parameter(name) => name.hash(state),
            ExpressionNode::MemberAccess { target, member } => {
                member.hash(state);
                target.hash_shape(state);
            }
            ExpressionNode::Call {
                target,
                method,
                args,
            } => {
                method.hash(state);
                target.is_some().hash(state);
                if let Some(target) = target {
                    target.hash_shape(state);
                }
                hash_all(args, state);
            }
            ExpressionNode::Lambda { params, body } => {
                params.hash(state);
                body.hash_shape(state);
            }
            ExpressionNode::New {
                type_name,
                members,
                args,
            } => {
                type_name.hash(state);
                members.hash(state);
                hash_all(args, state);
            }
            ExpressionNode::TableRef(id) => id.hash(state),
            ExpressionNode::ColumnRef { table, member } => {
                table.hash(state);
                member.hash(state);
            }
            ExpressionNode::ScopeRef(id) => id.hash(state),
            ExpressionNode::InputParameter(index) => index.hash(state),
            ExpressionNode::Binary { op, .. } => {
                op.hash(state);
                self.children().iter().for_each(|c| c.hash_shape(state));
            }
            ExpressionNode::Unary { op, operand } => {
                op.hash(state);
                operand.hash_shape(state);
            }
            ExpressionNode::Conditional { .. } | ExpressionNode::Grouping { .. } => {
                self.children().iter().for_each(|c| c.hash_shape(state));
            }
        }
    }
}

fn all_equal(a: &[ExpressionNode], b: &[ExpressionNode]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.structurally_equal(y))
}

fn hash_all<H: Hasher>(nodes: &[ExpressionNode], state: &mut H) {
    nodes.len().hash(state);
    for node in nodes {
        node.hash_shape(state);
    }
}

impl PartialEq for ExpressionNode {
    fn eq(&self, other: &Self) -> bool {
        self.structurally_equal(other)
    }
}

impl Eq for ExpressionNode {}

impl Hash for ExpressionNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash_shape(state);
    }
}

impl From<Value> for ExpressionNode {
    fn from(value: Value) -> Self {
        ExpressionNode::Constant(value)
    }
}
