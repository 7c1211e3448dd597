use std::hash::{Hash, Hasher};

use super::types::{ExpressionNode, Method, QueryOperator, Value};

/// One logical query: a root source followed by query operators.
///
/// Equality and hashing are structural, position by position, which makes
/// the chain usable as a cache key. Captured values are read back through
/// [`constant`](Self::constant) by their depth-first ordinal.
#[derive(Debug, Clone, Default)]
pub struct OperatorChain {
    nodes: Vec<ExpressionNode>,
}

impl OperatorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chain rooted at the table of `entity`.
    pub fn from_table(entity: impl Into<String>) -> Self {
        Self {
            nodes: vec![ExpressionNode::table(entity)],
        }
    }

    pub fn push(mut self, node: ExpressionNode) -> Self {
        self.nodes.push(node);
        self
    }

    /// Append a query operator with its arguments.
    pub fn then(self, op: QueryOperator, args: Vec<ExpressionNode>) -> Self {
        self.push(ExpressionNode::call(Method::Query(op), args))
    }

    pub fn filter(self, predicate: ExpressionNode) -> Self {
        self.then(QueryOperator::Where, vec![predicate])
    }

    pub fn select(self, selector: ExpressionNode) -> Self {
        self.then(QueryOperator::Select, vec![selector])
    }

    /// `collection` maps an element to a sequence; `result` combines the
    /// outer element with each inner one.
    pub fn select_many(self, collection: ExpressionNode, result: Option<ExpressionNode>) -> Self {
        let mut args = vec![collection];
        args.extend(result);
        self.then(QueryOperator::SelectMany, args)
    }

    pub fn join(
        self,
        inner: OperatorChain,
        outer_key: ExpressionNode,
        inner_key: ExpressionNode,
        result: ExpressionNode,
    ) -> Self {
        self.then(
            QueryOperator::Join,
            vec![ExpressionNode::query(inner), outer_key, inner_key, result],
        )
    }

    /// Like [`join`](Self::join), but `result` receives the outer element
    /// and its group of matching inner elements.
    pub fn group_join(
        self,
        inner: OperatorChain,
        outer_key: ExpressionNode,
        inner_key: ExpressionNode,
        result: ExpressionNode,
    ) -> Self {
        self.then(
            QueryOperator::GroupJoin,
            vec![ExpressionNode::query(inner), outer_key, inner_key, result],
        )
    }

    pub fn default_if_empty(self) -> Self {
        self.then(QueryOperator::DefaultIfEmpty, Vec::new())
    }

    pub fn order_by(self, key: ExpressionNode) -> Self {
        self.then(QueryOperator::OrderBy, vec![key])
    }

    pub fn order_by_descending(self, key: ExpressionNode) -> Self {
        self.then(QueryOperator::OrderByDescending, vec![key])
    }

    pub fn then_by(self, key: ExpressionNode) -> Self {
        self.then(QueryOperator::ThenBy, vec![key])
    }

    pub fn then_by_descending(self, key: ExpressionNode) -> Self {
        self.then(QueryOperator::ThenByDescending, vec![key])
    }

    pub fn take(self, count: i64) -> Self {
        self.then(QueryOperator::Take, vec![ExpressionNode::constant(count)])
    }

    pub fn skip(self, count: i64) -> Self {
        self.then(QueryOperator::Skip, vec![ExpressionNode::constant(count)])
    }

    pub fn distinct(self) -> Self {
        self.then(QueryOperator::Distinct, Vec::new())
    }

    pub fn group_by(self, key: ExpressionNode, element: Option<ExpressionNode>) -> Self {
        let mut args = vec![key];
        args.extend(element);
        self.then(QueryOperator::GroupBy, args)
    }

    pub fn union(self, other: OperatorChain) -> Self {
        self.then(QueryOperator::Union, vec![ExpressionNode::query(other)])
    }

    pub fn concat(self, other: OperatorChain) -> Self {
        self.then(QueryOperator::Concat, vec![ExpressionNode::query(other)])
    }

    pub fn intersect(self, other: OperatorChain) -> Self {
        self.then(QueryOperator::Intersect, vec![ExpressionNode::query(other)])
    }

    pub fn except(self, other: OperatorChain) -> Self {
        self.then(QueryOperator::Except, vec![ExpressionNode::query(other)])
    }

    /// Terminal operator with an optional predicate or selector lambda.
    pub fn finish(self, op: QueryOperator, lambda: Option<ExpressionNode>) -> Self {
        self.then(op, lambda.into_iter().collect())
    }

    pub fn count(self) -> Self {
        self.finish(QueryOperator::Count, None)
    }

    pub fn first(self) -> Self {
        self.finish(QueryOperator::First, None)
    }

    // -- inspection ---------------------------------------------------------

    pub fn nodes(&self) -> &[ExpressionNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Entity type of the root, when the chain starts at a table.
    pub fn root_entity(&self) -> Option<&str> {
        match self.nodes.first() {
            Some(ExpressionNode::Constant(Value::Table(entity))) => Some(entity),
            _ => None,
        }
    }

    /// Data constants in depth-first order, descending into nested chains.
    /// A constant's position in this list is its ordinal.
    pub fn data_constants(&self) -> Vec<&ExpressionNode> {
        let mut out = Vec::new();
        for node in &self.nodes {
            collect_constants(node, &mut out);
        }
        out
    }

    /// Value of the data constant with the given ordinal.
    pub fn constant(&self, ordinal: usize) -> Option<&Value> {
        self.data_constants()
            .get(ordinal)
            .and_then(|node| node.as_constant())
    }
}

fn collect_constants<'a>(node: &'a ExpressionNode, out: &mut Vec<&'a ExpressionNode>) {
    if let ExpressionNode::Constant(value) = node {
        match value {
            Value::Query(chain) => {
                for inner in chain.nodes() {
                    collect_constants(inner, out);
                }
            }
            v if v.is_data() => out.push(node),
            _ => {}
        }
        return;
    }
    for child in node.children() {
        collect_constants(child, out);
    }
}

impl PartialEq for OperatorChain {
    fn eq(&self, other: &Self) -> bool {
        self.nodes.len() == other.nodes.len()
            && self
                .nodes
                .iter()
                .zip(&other.nodes)
                .all(|(a, b)| a.structurally_equal(b))
    }
}

impl Eq for OperatorChain {}

impl Hash for OperatorChain {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.nodes.len().hash(state);
        for node in &self.nodes {
            node.hash_shape(state);
        }
    }
}
