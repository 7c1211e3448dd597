//! Expression analyzer: rewrites an operator chain into scope-relative nodes.
//!
//! Analysis is post-order. Children are rewritten first, then the node is
//! resolved against the schema into a `TableRef`, `ColumnRef`, `ScopeRef`,
//! `InputParameter` or one of the lowered `Method::Sql` forms. Lambda
//! parameters are substituted through the parameter frame of the current
//! [`ScopeView`]; every lambda application gets its own frame.
//!
//! Captured data constants are addressed by their depth-first ordinal in
//! the chain being compiled, so the analyzer borrows that chain for its
//! whole lifetime and never re-analyzes a substituted value.

use std::collections::{HashMap, HashSet};

use super::arguments::{adapt_arguments, Argument};
use super::materializer::Shape;
use super::scope::{
    CompilationContext, OrderingTerm, ScopeKind, ScopeView, SetLink, SetOperator,
};
use crate::ast::{
    BinaryOperator, DateTimeMethod, DerivedColumn, ExpressionNode, JoinKind, MathMethod, Method,
    OperatorChain, QueryOperator, ScopeId, SqlOperator, TableId, TableSource, TextMethod, Value,
    ValueType,
};
use crate::config::CompilerConfig;
use crate::error::{CompileError, Result};
use crate::query::ValueExtractor;
use crate::schema::{Association, FunctionKey, SchemaResolver};

/// A sequence under construction: what one row is, and where it lives.
#[derive(Debug, Clone)]
pub struct Sequence {
    pub element: ExpressionNode,
    pub view: ScopeView,
}

pub struct Analyzer<'a> {
    pub(super) schema: &'a dyn SchemaResolver,
    pub(super) config: &'a CompilerConfig,
    pub(super) ctx: CompilationContext,
    chain: &'a OperatorChain,
    /// Node address of each captured data constant in `chain` to its ordinal.
    slots: HashMap<usize, usize>,
    /// Inner tables of group joins; their group parameter reads as a sequence.
    group_tables: HashSet<TableId>,
    /// Result types of mapped functions, by SQL name.
    pub(super) function_types: HashMap<String, ValueType>,
}

fn address(node: &ExpressionNode) -> usize {
    node as *const ExpressionNode as usize
}

fn sql_call(op: SqlOperator, args: Vec<ExpressionNode>) -> ExpressionNode {
    ExpressionNode::call(Method::Sql(op), args)
}

fn aggregate(op: QueryOperator, args: Vec<ExpressionNode>) -> ExpressionNode {
    ExpressionNode::call(Method::Query(op), args)
}

fn conjoin(nodes: Vec<ExpressionNode>) -> Option<ExpressionNode> {
    nodes.into_iter().reduce(ExpressionNode::and_also)
}

fn lambda_parts(node: &ExpressionNode) -> Result<(&[String], &ExpressionNode)> {
    match node {
        ExpressionNode::Lambda { params, body } => Ok((params.as_slice(), body.as_ref())),
        other => Err(CompileError::unsupported(format!(
            "{} where a lambda was expected",
            other.tag()
        ))),
    }
}

fn argument(args: &[ExpressionNode], index: usize, op: QueryOperator) -> Result<&ExpressionNode> {
    args.get(index)
        .ok_or_else(|| CompileError::unsupported(format!("{} without argument {}", op, index)))
}

/// A member of the duration between two date-times. `Total*` members are
/// fractional; the others are the whole component within the next unit.
fn duration_member(later: ExpressionNode, earlier: ExpressionNode, member: &str) -> Result<ExpressionNode> {
    let millis = ExpressionNode::call(
        Method::DateTime(DateTimeMethod::DiffMilliseconds),
        vec![later, earlier],
    );
    let (total, unit) = match member.strip_prefix("Total") {
        Some(unit) => (true, unit),
        None => (false, member),
    };
    let (per_unit, wrap): (i64, Option<i64>) = match unit {
        "Milliseconds" => (1, Some(1000)),
        "Seconds" => (1000, Some(60)),
        "Minutes" => (60_000, Some(60)),
        "Hours" => (3_600_000, Some(24)),
        "Days" => (86_400_000, None),
        _ => {
            return Err(CompileError::mapping(format!(
                "duration has no member '{}'",
                member
            )))
        }
    };
    if total {
        return Ok(match per_unit {
            1 => millis,
            n => ExpressionNode::binary(BinaryOperator::Divide, millis, ExpressionNode::constant(n as f64)),
        });
    }
    let scaled = match per_unit {
        1 => millis,
        n => ExpressionNode::binary(BinaryOperator::Divide, millis, ExpressionNode::constant(n)),
    };
    let whole = ExpressionNode::call(
        Method::Convert(ValueType::Int),
        vec![ExpressionNode::call(Method::Math(MathMethod::Floor), vec![scaled])],
    );
    Ok(match wrap {
        Some(m) => ExpressionNode::binary(BinaryOperator::Modulo, whole, ExpressionNode::constant(m)),
        None => whole,
    })
}

impl<'a> Analyzer<'a> {
    pub fn new(schema: &'a dyn SchemaResolver, config: &'a CompilerConfig, chain: &'a OperatorChain) -> Self {
        let slots = chain
            .data_constants()
            .into_iter()
            .enumerate()
            .map(|(ordinal, node)| (address(node), ordinal))
            .collect();
        Self {
            schema,
            config,
            ctx: CompilationContext::new(config.max_expression_depth),
            chain,
            slots,
            group_tables: HashSet::new(),
            function_types: HashMap::new(),
        }
    }

    pub fn context(&self) -> &CompilationContext {
        &self.ctx
    }

    pub fn into_context(self) -> CompilationContext {
        self.ctx
    }

    /// Analyze the chain given to [`Analyzer::new`] from a fresh root scope.
    pub fn analyze_root(&mut self) -> Result<Sequence> {
        let chain = self.chain;
        let root = self.ctx.root();
        self.analyze_chain(chain, root)
    }

    // -----------------------------------------------------------------------
    // Chains and sources
    // -----------------------------------------------------------------------

    pub fn analyze_chain(&mut self, chain: &OperatorChain, view: ScopeView) -> Result<Sequence> {
        let mut nodes = chain.nodes().iter();
        let root = nodes
            .next()
            .ok_or_else(|| CompileError::unsupported("empty operator chain"))?;
        let mut seq = self.analyze_source(root, view)?;

        let mut terminal: Option<QueryOperator> = None;
        for node in nodes {
            match node {
                ExpressionNode::Call {
                    target: None,
                    method: Method::Query(op),
                    args,
                } => {
                    if let Some(done) = terminal {
                        return Err(CompileError::unsupported(format!("{} after {}", op, done)));
                    }
                    seq = self.apply_operator(seq, *op, args)?;
                    if op.is_terminal() {
                        terminal = Some(*op);
                    }
                }
                other => {
                    return Err(CompileError::unsupported(format!(
                        "{} in operator chain",
                        other.tag()
                    )))
                }
            }
        }
        Ok(seq)
    }

    fn analyze_source(&mut self, root: &ExpressionNode, view: ScopeView) -> Result<Sequence> {
        match root {
            ExpressionNode::Constant(Value::Table(entity)) => {
                let element = self.register_root_table(entity, view)?;
                Ok(Sequence { element, view })
            }
            ExpressionNode::Constant(Value::Query(chain)) => self.analyze_chain(chain, view),
            other => Err(CompileError::unsupported(format!(
                "{} as query source",
                other.tag()
            ))),
        }
    }

    /// Bind the first occurrence of `entity` in the view's scope.
    pub fn register_root_table(&mut self, entity: &str, view: ScopeView) -> Result<ExpressionNode> {
        let schema = self.schema;
        let table = schema
            .table_name_for(entity)
            .ok_or_else(|| CompileError::mapping(format!("entity '{}' has no table mapping", entity)))?;
        let id = self.ctx.root_table(view.scope, entity, table);
        Ok(ExpressionNode::TableRef(id))
    }

    /// A sequence-valued expression inside a lambda, built into `view`'s scope.
    fn analyze_sequence(&mut self, node: &ExpressionNode, view: ScopeView) -> Result<Sequence> {
        match node {
            ExpressionNode::Constant(Value::Table(_)) | ExpressionNode::Constant(Value::Query(_)) => {
                self.analyze_source(node, view)
            }
            ExpressionNode::Parameter(name) => match self.analyze_node(node, view)? {
                ExpressionNode::TableRef(table) if self.group_tables.contains(&table) => Ok(Sequence {
                    element: ExpressionNode::TableRef(table),
                    view,
                }),
                other => Err(CompileError::unsupported(format!(
                    "'{}' bound to {} as a sequence",
                    name,
                    other.tag()
                ))),
            },
            ExpressionNode::MemberAccess { target, member } => {
                let owner = self.analyze_node(target, view)?;
                let table = match owner {
                    ExpressionNode::TableRef(table) => table,
                    owner @ ExpressionNode::New { .. } => {
                        return match self.resolve_member(owner, member)? {
                            ExpressionNode::TableRef(table) if self.group_tables.contains(&table) => {
                                Ok(Sequence {
                                    element: ExpressionNode::TableRef(table),
                                    view,
                                })
                            }
                            other => Err(CompileError::unsupported(format!(
                                "member '{}' holding {} as a sequence",
                                member,
                                other.tag()
                            ))),
                        }
                    }
                    other => {
                        return Err(CompileError::unsupported(format!(
                            "collection '{}' on {}",
                            member,
                            other.tag()
                        )))
                    }
                };
                let entity = self.entity_of(table)?;
                let assoc = self
                    .schema
                    .association_for(&entity, member)
                    .filter(Association::is_many)
                    .ok_or_else(|| {
                        CompileError::mapping(format!("'{}.{}' is not a collection", entity, member))
                    })?;
                let joined = self.add_association_table(table, &assoc, view.scope, assoc.join_kind)?;
                Ok(Sequence {
                    element: ExpressionNode::TableRef(joined),
                    view,
                })
            }
            ExpressionNode::Call {
                target: Some(source),
                method: Method::Query(op),
                args,
            } if !op.is_terminal() => {
                let seq = self.analyze_sequence(source, view)?;
                self.apply_operator(seq, *op, args)
            }
            other => Err(CompileError::unsupported(format!(
                "{} as a sequence",
                other.tag()
            ))),
        }
    }

    // -----------------------------------------------------------------------
    // Chain operators
    // -----------------------------------------------------------------------

    /// Whether `op` cannot extend the scope in place and needs a wrapper.
    fn needs_wrap(&self, scope: ScopeId, op: QueryOperator) -> bool {
        use QueryOperator::*;
        let s = self.ctx.scope(scope);
        let paged = s.is_paged();
        let set = s.has_set_operation();
        match op {
            Where | Distinct => paged || set,
            // DISTINCT cannot order by columns it does not select.
            OrderBy | OrderByDescending | ThenBy | ThenByDescending => paged || set || s.distinct,
            // A new projection would change what DISTINCT compares.
            Select => set || s.distinct,
            Take => set,
            Skip => s.limit.is_some() || set,
            Union | Concat | Intersect | Except => paged || !s.ordering.is_empty(),
            DefaultIfEmpty => false,
            op if op.is_element() => set,
            _ => paged || set || s.distinct || s.is_grouped(),
        }
    }

    fn apply_operator(
        &mut self,
        seq: Sequence,
        op: QueryOperator,
        args: &[ExpressionNode],
    ) -> Result<Sequence> {
        use QueryOperator::*;
        let seq = if self.needs_wrap(seq.view.scope, op) {
            self.promote(seq)?
        } else {
            seq
        };
        let scope = seq.view.scope;

        match op {
            Where => {
                let predicate = self.apply_lambda(argument(args, 0, op)?, &[seq.element.clone()], seq.view)?;
                self.push_predicate(scope, predicate);
                Ok(seq)
            }
            Select => {
                let element = self.apply_lambda(argument(args, 0, op)?, &[seq.element.clone()], seq.view)?;
                Ok(Sequence {
                    element,
                    view: seq.view,
                })
            }
            SelectMany => self.apply_select_many(seq, args),
            Join | GroupJoin => self.apply_join(seq, op, args),
            DefaultIfEmpty => {
                let mut tables = self.ctx.inline_tables(scope);
                if let ExpressionNode::TableRef(table) = seq.element {
                    if self.group_tables.contains(&table) {
                        tables.push(table);
                    }
                }
                for table in tables {
                    let binding = self.ctx.table_mut(table);
                    if binding.join_predicate.is_some() {
                        binding.join_kind = JoinKind::LeftOuter;
                    }
                }
                Ok(seq)
            }
            OrderBy | OrderByDescending | ThenBy | ThenByDescending => {
                let key = self.apply_lambda(argument(args, 0, op)?, &[seq.element.clone()], seq.view)?;
                let descending = matches!(op, OrderByDescending | ThenByDescending);
                let terms: Vec<OrderingTerm> = self
                    .expand_key(key)?
                    .into_iter()
                    .map(|expr| OrderingTerm { expr, descending })
                    .collect();
                let ordering = &mut self.ctx.scope_mut(scope).ordering;
                if matches!(op, OrderBy | OrderByDescending) {
                    let previous = std::mem::replace(ordering, terms);
                    ordering.extend(previous);
                } else {
                    ordering.extend(terms);
                }
                Ok(seq)
            }
            Take => {
                let count = self.analyze_node(argument(args, 0, op)?, seq.view)?;
                self.limit_to(scope, count);
                Ok(seq)
            }
            Skip => {
                let count = self.analyze_node(argument(args, 0, op)?, seq.view)?;
                let s = self.ctx.scope_mut(scope);
                s.offset = Some(match s.offset.take() {
                    Some(previous) => ExpressionNode::plus(previous, count),
                    None => count,
                });
                Ok(seq)
            }
            Distinct => {
                // Distinct rows come back unordered; an earlier OrderBy is dropped.
                let s = self.ctx.scope_mut(scope);
                s.ordering.clear();
                s.distinct = true;
                Ok(seq)
            }
            GroupBy => {
                let key = self.apply_lambda(argument(args, 0, op)?, &[seq.element.clone()], seq.view)?;
                let element = match args.get(1) {
                    Some(selector) => self.apply_lambda(selector, &[seq.element.clone()], seq.view)?,
                    None => seq.element.clone(),
                };
                let grouping = self.expand_key(key.clone())?;
                self.ctx.scope_mut(scope).grouping = grouping;
                Ok(Sequence {
                    element: ExpressionNode::Grouping {
                        key: Box::new(key),
                        element: Box::new(element),
                    },
                    view: seq.view,
                })
            }
            Union | Concat | Intersect | Except => self.apply_set_operation(seq, op, args),
            op if op.is_terminal() => self.apply_terminal(seq, op, args),
            op => Err(CompileError::unsupported(op.name())),
        }
    }

    /// Wrap the sequence's scope as a derived table of a new outer scope.
    pub fn promote(&mut self, seq: Sequence) -> Result<Sequence> {
        let inner = seq.view.scope;
        self.ctx.scope_mut(inner).projection = Some(seq.element);
        let output = self.build_projection(inner)?;
        self.ctx.scope_mut(inner).output = Some(output.clone());

        let view = self.ctx.promote_to_parent_scope(seq.view);
        let columns = output
            .columns
            .iter()
            .map(|c| DerivedColumn {
                alias: c.alias.clone(),
                value_type: c.value_type.clone(),
                nullable: c.nullable,
            })
            .collect();
        let derived = self.ctx.add_table(
            view.scope,
            TableSource::Derived {
                scope: inner,
                columns,
                shape: output.shape.clone(),
            },
            JoinKind::None,
        );
        let element = match &output.shape {
            Shape::Entity { .. } => ExpressionNode::TableRef(derived),
            shape => self.derived_member(derived, shape)?,
        };
        Ok(Sequence { element, view })
    }

    fn push_predicate(&mut self, scope: ScopeId, predicate: ExpressionNode) {
        let s = self.ctx.scope_mut(scope);
        if s.is_grouped() {
            s.having.push(predicate);
        } else {
            s.predicates.push(predicate);
        }
    }

    fn limit_to(&mut self, scope: ScopeId, count: ExpressionNode) {
        let s = self.ctx.scope_mut(scope);
        s.limit = Some(match s.limit.take() {
            Some(previous) => ExpressionNode::conditional(
                ExpressionNode::less_than(previous.clone(), count.clone()),
                previous,
                count,
            ),
            None => count,
        });
    }

    fn apply_select_many(&mut self, seq: Sequence, args: &[ExpressionNode]) -> Result<Sequence> {
        let (params, body) = lambda_parts(argument(args, 0, QueryOperator::SelectMany)?)?;
        let child = self.ctx.enter_child_scope(seq.view, ScopeKind::Join);
        let local = self.ctx.enter_local_parameter_scope(child);
        if let Some(name) = params.first() {
            self.ctx.bind_parameter(local, name, seq.element.clone());
        }
        let inner = self.analyze_sequence(body, local)?;
        self.close_join_scope(child.scope, &inner, QueryOperator::SelectMany)?;

        let element = match args.get(1) {
            Some(result) => self.apply_lambda(result, &[seq.element.clone(), inner.element], seq.view)?,
            None => inner.element,
        };
        Ok(Sequence {
            element,
            view: seq.view,
        })
    }

    /// Join and GroupJoin share one lowering: an inner join on the key
    /// equality. A group join's group reads as its matching rows and turns
    /// into an outer join under `DefaultIfEmpty`.
    fn apply_join(&mut self, seq: Sequence, op: QueryOperator, args: &[ExpressionNode]) -> Result<Sequence> {
        let child = self.ctx.enter_child_scope(seq.view, ScopeKind::Join);
        let inner = self.analyze_sequence(argument(args, 0, op)?, child)?;

        let outer_key = self.apply_lambda(argument(args, 1, op)?, &[seq.element.clone()], seq.view)?;
        let inner_key = self.apply_lambda(argument(args, 2, op)?, &[inner.element.clone()], inner.view)?;
        let condition = self.key_match(outer_key, inner_key)?;
        self.ctx.scope_mut(child.scope).predicates.push(condition);
        self.close_join_scope(child.scope, &inner, op)?;

        if let Some(&first) = self.ctx.scope(child.scope).tables.first() {
            self.ctx.table_mut(first).join_kind = JoinKind::Inner;
            if op == QueryOperator::GroupJoin {
                self.group_tables.insert(first);
            }
        }
        let element = self.apply_lambda(
            argument(args, 3, op)?,
            &[seq.element.clone(), inner.element],
            seq.view,
        )?;
        Ok(Sequence {
            element,
            view: seq.view,
        })
    }

    /// Fold a join scope's filters into the ON clause of its first table,
    /// or of the group-join table the sequence reads.
    fn close_join_scope(&mut self, child: ScopeId, built: &Sequence, op: QueryOperator) -> Result<()> {
        let scope = self.ctx.scope(child);
        if built.view.scope != child || !scope.is_plain() {
            return Err(CompileError::unsupported(format!(
                "{} over a paged, ordered, grouped or combined sequence",
                op
            )));
        }
        let group = match built.element {
            ExpressionNode::TableRef(table) if self.group_tables.contains(&table) => Some(table),
            _ => None,
        };
        let first = scope
            .tables
            .first()
            .copied()
            .or(group)
            .ok_or_else(|| CompileError::unsupported(format!("{} without a source table", op)))?;
        let predicates = std::mem::take(&mut self.ctx.scope_mut(child).predicates);
        let binding = self.ctx.table_mut(first);
        let mut terms: Vec<ExpressionNode> = binding.join_predicate.take().into_iter().collect();
        terms.extend(predicates);
        binding.join_predicate = conjoin(terms);
        Ok(())
    }

    fn key_match(&mut self, outer: ExpressionNode, inner: ExpressionNode) -> Result<ExpressionNode> {
        match (outer, inner) {
            (
                ExpressionNode::New { args: left, .. },
                ExpressionNode::New { args: right, .. },
            ) => {
                if left.len() != right.len() {
                    return Err(CompileError::unsupported(
                        "join keys with different member counts",
                    ));
                }
                let mut terms = Vec::with_capacity(left.len());
                for (l, r) in left.into_iter().zip(right) {
                    terms.push(self.lower_equality(l, r, false)?);
                }
                conjoin(terms).ok_or_else(|| CompileError::unsupported("empty join key"))
            }
            (outer, inner) => self.lower_equality(outer, inner, false),
        }
    }

    fn apply_set_operation(
        &mut self,
        seq: Sequence,
        op: QueryOperator,
        args: &[ExpressionNode],
    ) -> Result<Sequence> {
        let other = match argument(args, 0, op)? {
            ExpressionNode::Constant(Value::Query(chain)) => chain,
            other => {
                return Err(CompileError::unsupported(format!(
                    "{} with a {} operand",
                    op,
                    other.tag()
                )))
            }
        };
        let operator = SetOperator::from_query(op)
            .ok_or_else(|| CompileError::unsupported(op.name()))?;

        let sibling = self.ctx.enter_sibling_scope(seq.view);
        let mut operand = self.analyze_chain(other, sibling)?;
        let built = self.ctx.scope(operand.view.scope);
        if built.is_paged() || !built.ordering.is_empty() || built.has_set_operation() {
            operand = self.promote(operand)?;
        }
        let operand_scope = operand.view.scope;
        self.ctx.scope_mut(operand_scope).projection = Some(operand.element);

        let mut tail = seq.view.scope;
        while let Some(link) = self.ctx.scope(tail).next {
            tail = link.scope;
        }
        self.ctx.scope_mut(tail).next = Some(SetLink {
            operator,
            scope: operand_scope,
        });
        Ok(seq)
    }

    fn apply_terminal(
        &mut self,
        seq: Sequence,
        op: QueryOperator,
        args: &[ExpressionNode],
    ) -> Result<Sequence> {
        use QueryOperator::*;
        let scope = seq.view.scope;
        let element = match op {
            Count => {
                if let Some(predicate) = args.first() {
                    let p = self.apply_lambda(predicate, &[seq.element.clone()], seq.view)?;
                    self.push_predicate(scope, p);
                }
                aggregate(Count, Vec::new())
            }
            Sum | Min | Max | Average => {
                let value = match args.first() {
                    Some(selector) => self.apply_lambda(selector, &[seq.element.clone()], seq.view)?,
                    None => seq.element.clone(),
                };
                aggregate(op, vec![self.scalar_key(value)?])
            }
            Any | All => {
                match (args.first(), op) {
                    (Some(predicate), _) => {
                        let p = self.apply_lambda(predicate, &[seq.element.clone()], seq.view)?;
                        let p = if op == All { ExpressionNode::negation(p) } else { p };
                        self.push_predicate(scope, p);
                    }
                    (None, All) => return Err(CompileError::unsupported("All without a predicate")),
                    (None, _) => {}
                }
                aggregate(Count, Vec::new())
            }
            Contains => {
                let value = self.analyze_node(argument(args, 0, op)?, seq.view)?;
                let p = self.lower_equality(seq.element.clone(), value, false)?;
                self.push_predicate(scope, p);
                aggregate(Count, Vec::new())
            }
            First | FirstOrDefault | Single | SingleOrDefault | Last => {
                if let Some(predicate) = args.first() {
                    let p = self.apply_lambda(predicate, &[seq.element.clone()], seq.view)?;
                    self.push_predicate(scope, p);
                }
                match op {
                    First | FirstOrDefault => self.limit_to(scope, ExpressionNode::constant(1)),
                    Single | SingleOrDefault => self.limit_to(scope, ExpressionNode::constant(2)),
                    _ => {}
                }
                seq.element.clone()
            }
            op => return Err(CompileError::unsupported(op.name())),
        };

        let s = self.ctx.scope_mut(scope);
        if op.is_aggregate() || op.is_quantifier() {
            s.ordering.clear();
        }
        s.scalar_method = Some(op);
        Ok(Sequence {
            element,
            view: seq.view,
        })
    }

    // -----------------------------------------------------------------------
    // Lambdas and nested queries
    // -----------------------------------------------------------------------

    /// Analyze a lambda body with its parameters bound to `bindings`.
    pub fn apply_lambda(
        &mut self,
        lambda: &ExpressionNode,
        bindings: &[ExpressionNode],
        view: ScopeView,
    ) -> Result<ExpressionNode> {
        let (params, body) = lambda_parts(lambda)?;
        if params.len() != bindings.len() {
            return Err(CompileError::unsupported(format!(
                "lambda with {} parameter(s) where {} were expected",
                params.len(),
                bindings.len()
            )));
        }
        let local = self.ctx.enter_local_parameter_scope(view);
        for (name, value) in params.iter().zip(bindings) {
            self.ctx.bind_parameter(local, name, value.clone());
        }
        self.analyze_node(body, local)
    }

    fn analyze_nested_query(
        &mut self,
        source: &ExpressionNode,
        op: QueryOperator,
        args: &[ExpressionNode],
        view: ScopeView,
    ) -> Result<ExpressionNode> {
        if !op.is_terminal() {
            return Err(CompileError::unsupported(format!("{} as a value", op)));
        }

        if let ExpressionNode::Parameter(name) = source {
            if let Some(ExpressionNode::Grouping { element, .. }) = self.ctx.lookup_parameter(view, name) {
                let element = element.as_ref().clone();
                return self.group_aggregate(element, op, args, view);
            }
        }

        if op == QueryOperator::Contains {
            if let ExpressionNode::Constant(Value::List(items)) = source {
                let value = self.analyze_node(argument(args, 0, op)?, view)?;
                let list = self.list_elements(source, items);
                return Ok(sql_call(SqlOperator::In, vec![value, sql_call(SqlOperator::List, list)]));
            }
        }

        let child = self.ctx.enter_child_scope(view, ScopeKind::Subquery);
        let seq = self.analyze_sequence(source, child)?;
        if let ExpressionNode::TableRef(table) = seq.element {
            if self.group_tables.contains(&table) {
                return Err(CompileError::unsupported(format!("{} over a group-join group", op)));
            }
        }
        self.close_subquery(seq, op, args, view)
    }

    fn list_elements(&mut self, source: &ExpressionNode, items: &[Value]) -> Vec<ExpressionNode> {
        match self.slots.get(&address(source)).copied() {
            Some(constant) => items
                .iter()
                .enumerate()
                .map(|(index, item)| {
                    let slot = self.ctx.register_parameter(
                        ValueExtractor::ListElement { constant, index },
                        item.value_type(),
                    );
                    ExpressionNode::InputParameter(slot)
                })
                .collect(),
            None => items.iter().cloned().map(ExpressionNode::Constant).collect(),
        }
    }

    /// Turn a terminal over a sub-query scope into a value expression.
    fn close_subquery(
        &mut self,
        seq: Sequence,
        op: QueryOperator,
        args: &[ExpressionNode],
        outer: ScopeView,
    ) -> Result<ExpressionNode> {
        use QueryOperator::*;
        match op {
            Any | All => {
                let seq = if self.needs_wrap(seq.view.scope, op) {
                    self.promote(seq)?
                } else {
                    seq
                };
                let scope = seq.view.scope;
                match args.first() {
                    Some(predicate) => {
                        let p = self.apply_lambda(predicate, &[seq.element.clone()], seq.view)?;
                        let p = if op == All { ExpressionNode::negation(p) } else { p };
                        self.push_predicate(scope, p);
                    }
                    None if op == All => {
                        return Err(CompileError::unsupported("All without a predicate"))
                    }
                    None => {}
                }
                self.ctx.scope_mut(scope).projection = Some(ExpressionNode::constant(1));
                let exists = sql_call(SqlOperator::Exists, vec![ExpressionNode::ScopeRef(scope)]);
                Ok(if op == All {
                    ExpressionNode::negation(exists)
                } else {
                    exists
                })
            }
            Contains => {
                let value = self.analyze_node(argument(args, 0, op)?, outer)?;
                let value = self.scalar_key(value)?;
                let seq = if self.needs_wrap(seq.view.scope, op) {
                    self.promote(seq)?
                } else {
                    seq
                };
                let element = self.scalar_key(seq.element)?;
                self.ctx.scope_mut(seq.view.scope).projection = Some(element);
                Ok(sql_call(
                    SqlOperator::In,
                    vec![value, ExpressionNode::ScopeRef(seq.view.scope)],
                ))
            }
            _ => {
                let seq = self.apply_operator(seq, op, args)?;
                if op.is_element() && !self.is_scalar(&seq.element) {
                    return Err(CompileError::unsupported(format!(
                        "{} of a non-scalar sub-query",
                        op
                    )));
                }
                let scope = seq.view.scope;
                self.ctx.scope_mut(scope).projection = Some(seq.element);
                Ok(ExpressionNode::ScopeRef(scope))
            }
        }
    }

    /// Aggregates over the rows of one group.
    fn group_aggregate(
        &mut self,
        element: ExpressionNode,
        op: QueryOperator,
        args: &[ExpressionNode],
        view: ScopeView,
    ) -> Result<ExpressionNode> {
        use QueryOperator::*;
        let counted = |predicate: ExpressionNode, hit: i64, miss: i64| {
            aggregate(
                Sum,
                vec![ExpressionNode::conditional(
                    predicate,
                    ExpressionNode::constant(hit),
                    ExpressionNode::constant(miss),
                )],
            )
        };
        match op {
            Count => match args.first() {
                Some(predicate) => {
                    let p = self.apply_lambda(predicate, &[element], view)?;
                    Ok(counted(p, 1, 0))
                }
                None => Ok(aggregate(Count, Vec::new())),
            },
            Sum | Min | Max | Average => {
                let value = match args.first() {
                    Some(selector) => self.apply_lambda(selector, &[element], view)?,
                    None => element,
                };
                Ok(aggregate(op, vec![self.scalar_key(value)?]))
            }
            Any => {
                let count = match args.first() {
                    Some(predicate) => {
                        let p = self.apply_lambda(predicate, &[element], view)?;
                        counted(p, 1, 0)
                    }
                    None => aggregate(Count, Vec::new()),
                };
                Ok(ExpressionNode::greater_than(count, ExpressionNode::constant(0)))
            }
            All => {
                let predicate = argument(args, 0, op)?;
                let p = self.apply_lambda(predicate, &[element], view)?;
                Ok(ExpressionNode::equal(counted(p, 0, 1), ExpressionNode::constant(0)))
            }
            op => Err(CompileError::unsupported(format!("{} over a group", op))),
        }
    }

    // -----------------------------------------------------------------------
    // Nodes
    // -----------------------------------------------------------------------

    /// Rewrite one node and its children into scope-relative form.
    pub fn analyze_node(&mut self, node: &ExpressionNode, view: ScopeView) -> Result<ExpressionNode> {
        self.ctx.enter_node()?;
        let result = self.analyze_inner(node, view);
        self.ctx.leave_node();
        result
    }

    fn analyze_inner(&mut self, node: &ExpressionNode, view: ScopeView) -> Result<ExpressionNode> {
        match node {
            ExpressionNode::Constant(value) => self.analyze_constant(node, value),
            ExpressionNode::Parameter(name) => {
                let value = self
                    .ctx
                    .lookup_parameter(view, name)
                    .cloned()
                    .ok_or_else(|| CompileError::mapping(format!("unbound parameter '{}'", name)))?;
                if let ExpressionNode::TableRef(table) = value {
                    if !self.ctx.is_visible(view.scope, table) {
                        return Err(CompileError::mapping(format!(
                            "'{}' refers to a table outside the current scope",
                            name
                        )));
                    }
                }
                Ok(value)
            }
            ExpressionNode::MemberAccess { target, member } => {
                let target = self.analyze_node(target, view)?;
                self.resolve_member(target, member)
            }
            ExpressionNode::Call {
                target,
                method,
                args,
            } => self.analyze_call(target.as_deref(), method, args, view),
            ExpressionNode::Lambda { .. } => {
                Err(CompileError::unsupported("Lambda outside a query operator"))
            }
            ExpressionNode::New {
                type_name,
                members,
                args,
            } => {
                let args = args
                    .iter()
                    .map(|arg| self.analyze_node(arg, view))
                    .collect::<Result<Vec<_>>>()?;
                Ok(ExpressionNode::New {
                    type_name: type_name.clone(),
                    members: members.clone(),
                    args,
                })
            }
            ExpressionNode::Conditional {
                test,
                then,
                otherwise,
            } => Ok(ExpressionNode::conditional(
                self.analyze_node(test, view)?,
                self.analyze_node(then, view)?,
                self.analyze_node(otherwise, view)?,
            )),
            ExpressionNode::Binary { op, left, right } => {
                let left = self.analyze_node(left, view)?;
                let right = self.analyze_node(right, view)?;
                self.analyze_binary(*op, left, right)
            }
            ExpressionNode::Unary { op, operand } => {
                let operand = self.analyze_node(operand, view)?;
                Ok(ExpressionNode::unary(*op, operand))
            }
            ExpressionNode::TableRef(_)
            | ExpressionNode::ColumnRef { .. }
            | ExpressionNode::ScopeRef(_)
            | ExpressionNode::InputParameter(_)
            | ExpressionNode::Grouping { .. } => Ok(node.clone()),
        }
    }

    fn analyze_constant(&mut self, node: &ExpressionNode, value: &Value) -> Result<ExpressionNode> {
        match value {
            Value::Table(_) | Value::Query(_) => {
                Err(CompileError::unsupported("sequence constant used as a value"))
            }
            Value::Entity(_) => Err(CompileError::unsupported("entity constant used as a value")),
            v if v.is_data() => match self.slots.get(&address(node)) {
                Some(&ordinal) => {
                    let slot = self
                        .ctx
                        .register_parameter(ValueExtractor::ChainConstant(ordinal), v.value_type());
                    Ok(ExpressionNode::InputParameter(slot))
                }
                None => Ok(node.clone()),
            },
            _ => Ok(node.clone()),
        }
    }

    fn analyze_call(
        &mut self,
        target: Option<&ExpressionNode>,
        method: &Method,
        args: &[ExpressionNode],
        view: ScopeView,
    ) -> Result<ExpressionNode> {
        match method {
            Method::Query(op) => match target {
                Some(source) => self.analyze_nested_query(source, *op, args, view),
                None => Err(CompileError::unsupported(format!(
                    "{} without a source sequence",
                    op
                ))),
            },
            Method::Text(m) => self.analyze_text(target, *m, args, view),
            Method::Math(m) => self.analyze_math(target, *m, args, view),
            Method::DateTime(m) => {
                let operands = target
                    .into_iter()
                    .chain(args)
                    .map(|arg| self.analyze_node(arg, view))
                    .collect::<Result<Vec<_>>>()?;
                Ok(ExpressionNode::call(Method::DateTime(*m), operands))
            }
            Method::Convert(to) => self.analyze_convert(target, to, args, view),
            Method::Function(name) => self.analyze_function(target, name, args, view),
            Method::Sql(_) => Ok(ExpressionNode::Call {
                target: None,
                method: method.clone(),
                args: args.to_vec(),
            }),
        }
    }

    fn analyze_binary(
        &mut self,
        op: BinaryOperator,
        left: ExpressionNode,
        right: ExpressionNode,
    ) -> Result<ExpressionNode> {
        match op {
            BinaryOperator::Equal => self.lower_equality(left, right, false),
            BinaryOperator::NotEqual => self.lower_equality(left, right, true),
            BinaryOperator::Add
                if self.static_type(&left) == ValueType::Text
                    || self.static_type(&right) == ValueType::Text =>
            {
                Ok(sql_call(SqlOperator::Concat, vec![left, right]))
            }
            op => Ok(ExpressionNode::binary(op, left, right)),
        }
    }

    /// `=`/`<>` with null tests and entity comparison by primary key.
    fn lower_equality(
        &mut self,
        left: ExpressionNode,
        right: ExpressionNode,
        negate: bool,
    ) -> Result<ExpressionNode> {
        if left.is_null_constant() || right.is_null_constant() {
            let operand = if right.is_null_constant() { left } else { right };
            let operand = match operand {
                ExpressionNode::TableRef(_) => self.first_key(operand)?,
                other => other,
            };
            let op = if negate {
                SqlOperator::IsNotNull
            } else {
                SqlOperator::IsNull
            };
            return Ok(sql_call(op, vec![operand]));
        }

        if let (ExpressionNode::TableRef(_), ExpressionNode::TableRef(_)) = (&left, &right) {
            let left_keys = self.expand_key(left)?;
            let right_keys = self.expand_key(right)?;
            let terms: Vec<ExpressionNode> = left_keys
                .into_iter()
                .zip(right_keys)
                .map(|(l, r)| ExpressionNode::equal(l, r))
                .collect();
            let equal = conjoin(terms)
                .ok_or_else(|| CompileError::mapping("entity comparison without primary key"))?;
            return Ok(if negate {
                ExpressionNode::negation(equal)
            } else {
                equal
            });
        }

        let op = if negate {
            BinaryOperator::NotEqual
        } else {
            BinaryOperator::Equal
        };
        Ok(ExpressionNode::binary(op, left, right))
    }

    fn analyze_text(
        &mut self,
        target: Option<&ExpressionNode>,
        method: TextMethod,
        args: &[ExpressionNode],
        view: ScopeView,
    ) -> Result<ExpressionNode> {
        let receiver = target.ok_or_else(|| {
            CompileError::conversion(0, "receiver", format!("{:?} needs a text receiver", method))
        })?;
        let receiver = self.analyze_node(receiver, view)?;
        let mut args = args
            .iter()
            .map(|arg| self.analyze_node(arg, view))
            .collect::<Result<Vec<_>>>()?;

        let expected: &[usize] = match method {
            TextMethod::Contains | TextMethod::StartsWith | TextMethod::EndsWith => &[1],
            TextMethod::Substring => &[1, 2],
            TextMethod::Replace | TextMethod::Insert => &[2],
            TextMethod::IndexOf => &[1],
            TextMethod::Remove => &[1, 2],
            _ => &[0],
        };
        if !expected.contains(&args.len()) {
            let found = args.len();
            return Err(CompileError::conversion(
                found.min(expected[0]),
                format!("{:?}", method),
                format!("expected {} argument(s), found {}", expected[0], found),
            ));
        }

        let wildcard = || ExpressionNode::constant("%");
        let like = |receiver: ExpressionNode, parts: Vec<ExpressionNode>| {
            sql_call(
                SqlOperator::Like,
                vec![receiver, sql_call(SqlOperator::Concat, parts)],
            )
        };
        let one_based = self.config.dialect.one_based_strings;
        Ok(match method {
            TextMethod::Contains => like(receiver, vec![wildcard(), args.remove(0), wildcard()]),
            TextMethod::StartsWith => like(receiver, vec![args.remove(0), wildcard()]),
            TextMethod::EndsWith => like(receiver, vec![wildcard(), args.remove(0)]),
            TextMethod::Substring => {
                let start = args.remove(0);
                self.substring(receiver, start, args.pop())
            }
            TextMethod::Insert => {
                let index = args.remove(0);
                let value = args.remove(0);
                let head = self.substring(receiver.clone(), ExpressionNode::constant(0), Some(index.clone()));
                let tail = self.substring(receiver, index, None);
                sql_call(SqlOperator::Concat, vec![head, value, tail])
            }
            TextMethod::Remove => {
                let index = args.remove(0);
                let head = self.substring(receiver.clone(), ExpressionNode::constant(0), Some(index.clone()));
                match args.pop() {
                    Some(count) => {
                        let tail = self.substring(receiver, ExpressionNode::plus(index, count), None);
                        sql_call(SqlOperator::Concat, vec![head, tail])
                    }
                    None => head,
                }
            }
            TextMethod::IndexOf => {
                let position =
                    ExpressionNode::call(Method::Text(method), vec![receiver, args.remove(0)]);
                if one_based {
                    ExpressionNode::binary(
                        BinaryOperator::Subtract,
                        position,
                        ExpressionNode::constant(1),
                    )
                } else {
                    position
                }
            }
            _ => {
                let mut call_args = vec![receiver];
                call_args.extend(args);
                ExpressionNode::call(Method::Text(method), call_args)
            }
        })
    }

    /// SUBSTRING from a zero-based start.
    fn substring(
        &self,
        receiver: ExpressionNode,
        start: ExpressionNode,
        length: Option<ExpressionNode>,
    ) -> ExpressionNode {
        let start = match start {
            ExpressionNode::Constant(Value::Int(n)) if self.config.dialect.one_based_strings => {
                ExpressionNode::constant(n + 1)
            }
            start if self.config.dialect.one_based_strings => {
                ExpressionNode::plus(start, ExpressionNode::constant(1))
            }
            start => start,
        };
        let mut args = vec![receiver, start];
        args.extend(length);
        ExpressionNode::call(Method::Text(TextMethod::Substring), args)
    }

    /// `ToString()` on a receiver or a static `Parse(value)`.
    fn analyze_convert(
        &mut self,
        target: Option<&ExpressionNode>,
        to: &ValueType,
        args: &[ExpressionNode],
        view: ScopeView,
    ) -> Result<ExpressionNode> {
        let name = format!("Convert<{}>", to);
        let mut operands = target.into_iter().chain(args);
        let operand = match (operands.next(), operands.next()) {
            (Some(operand), None) => operand,
            (None, _) => {
                return Err(CompileError::conversion(0, name, "expected 1 argument, found 0"))
            }
            (Some(_), Some(_)) => {
                return Err(CompileError::conversion(
                    1,
                    name,
                    format!("expected 1 argument, found {}", args.len() + usize::from(target.is_some())),
                ))
            }
        };
        if !matches!(
            to,
            ValueType::Bool | ValueType::Int | ValueType::Float | ValueType::Text | ValueType::DateTime
        ) {
            return Err(CompileError::unsupported(format!("conversion to {}", to)));
        }
        let value = self.analyze_node(operand, view)?;
        if !self.is_scalar(&value) {
            return Err(CompileError::unsupported(format!(
                "conversion of {} to {}; only primitive values convert",
                value.tag(),
                to
            )));
        }
        if self.static_type(&value) == *to {
            return Ok(value);
        }
        Ok(ExpressionNode::call(Method::Convert(to.clone()), vec![value]))
    }

    fn analyze_math(
        &mut self,
        target: Option<&ExpressionNode>,
        method: MathMethod,
        args: &[ExpressionNode],
        view: ScopeView,
    ) -> Result<ExpressionNode> {
        let mut analyzed = Vec::with_capacity(args.len() + 1);
        if let Some(target) = target {
            analyzed.push(self.analyze_node(target, view)?);
        }
        for arg in args {
            analyzed.push(self.analyze_node(arg, view)?);
        }
        let expected: &[usize] = match method {
            MathMethod::Pow => &[2],
            MathMethod::Log => &[1, 2],
            _ => &[1],
        };
        if !expected.contains(&analyzed.len()) {
            return Err(CompileError::conversion(
                analyzed.len().min(expected[0]),
                format!("{:?}", method),
                format!(
                    "expected {} argument(s), found {}",
                    expected[0],
                    analyzed.len()
                ),
            ));
        }
        Ok(ExpressionNode::call(Method::Math(method), analyzed))
    }

    /// Schema-mapped function call, with argument adaptation.
    fn analyze_function(
        &mut self,
        target: Option<&ExpressionNode>,
        name: &str,
        args: &[ExpressionNode],
        view: ScopeView,
    ) -> Result<ExpressionNode> {
        let mut prefix = Vec::new();
        let mut supplied = Vec::new();
        let key = match target {
            Some(receiver) => {
                let receiver = self.analyze_node(receiver, view)?;
                match receiver {
                    ExpressionNode::TableRef(table) => {
                        let owner = self.entity_of(table)?;
                        prefix = self.expand_key(receiver)?;
                        FunctionKey::new(owner, name)
                    }
                    other => {
                        let owner = self.static_type(&other).to_string();
                        supplied.push(other);
                        FunctionKey::new(owner, name)
                    }
                }
            }
            None => match name.rsplit_once('.') {
                Some((owner, function)) => FunctionKey::new(owner, function),
                None => FunctionKey::new("", name),
            },
        };
        for arg in args {
            supplied.push(self.analyze_node(arg, view)?);
        }

        let schema = self.schema;
        let mapping = schema.function_for(&key).ok_or_else(|| {
            CompileError::mapping(format!("function '{}.{}' is not mapped", key.owner, key.name))
        })?;
        let arguments = supplied
            .into_iter()
            .map(|node| Argument {
                value_type: self.static_type(&node),
                node,
            })
            .collect();
        let adapted = adapt_arguments(&mapping.parameters, arguments)?;

        self.function_types
            .insert(mapping.sql_name.clone(), mapping.result.clone());
        prefix.extend(adapted);
        Ok(ExpressionNode::call(
            Method::Function(mapping.sql_name.clone()),
            prefix,
        ))
    }

    // -----------------------------------------------------------------------
    // Members and associations
    // -----------------------------------------------------------------------

    pub(super) fn entity_of(&self, table: TableId) -> Result<String> {
        self.ctx
            .table(table)
            .entity_type()
            .map(str::to_string)
            .ok_or_else(|| CompileError::mapping(format!("table t{} is not an entity", table.0)))
    }

    fn resolve_member(&mut self, target: ExpressionNode, member: &str) -> Result<ExpressionNode> {
        match target {
            ExpressionNode::TableRef(table) => self.resolve_table_member(table, member),
            ExpressionNode::New { members, args, .. } => members
                .iter()
                .position(|m| m == member)
                .and_then(|i| args.into_iter().nth(i))
                .ok_or_else(|| CompileError::mapping(format!("projection has no member '{}'", member))),
            ExpressionNode::Grouping { key, .. } if member == "Key" => Ok(*key),
            other if member == "Length" && self.static_type(&other) == ValueType::Text => Ok(
                ExpressionNode::call(Method::Text(TextMethod::Length), vec![other]),
            ),
            ExpressionNode::Binary {
                op: BinaryOperator::Subtract,
                left,
                right,
            } if self.static_type(&left) == ValueType::DateTime
                && self.static_type(&right) == ValueType::DateTime =>
            {
                duration_member(*left, *right, member)
            }
            other if self.static_type(&other) == ValueType::DateTime => {
                match DateTimeMethod::from_member(member) {
                    Some(part) => Ok(ExpressionNode::call(Method::DateTime(part), vec![other])),
                    None => Err(CompileError::mapping(format!(
                        "date-time has no member '{}'",
                        member
                    ))),
                }
            }
            other => Err(CompileError::mapping(format!(
                "cannot resolve member '{}' on {}",
                member,
                other.tag()
            ))),
        }
    }

    /// Column, derived column, or to-one association of a bound table.
    pub(super) fn resolve_table_member(&mut self, table: TableId, member: &str) -> Result<ExpressionNode> {
        let schema = self.schema;
        let binding = self.ctx.table(table).clone();
        let entity = match &binding.source {
            TableSource::Derived { shape, .. } => {
                if let Some(sub) = shape.member(member) {
                    return self.derived_member(table, sub);
                }
                match shape {
                    Shape::Entity { type_name, .. } => type_name.clone(),
                    _ => {
                        return Err(CompileError::mapping(format!(
                            "derived table t{} has no member '{}'",
                            table.0, member
                        )))
                    }
                }
            }
            TableSource::Entity { entity, .. } => {
                if let Some(mapping) = schema.member_for(entity, member) {
                    return Ok(self.ctx.register_column(table, member, mapping.column_name()));
                }
                entity.clone()
            }
        };

        match schema.association_for(&entity, member) {
            Some(assoc) if assoc.is_many() => Err(CompileError::unsupported(format!(
                "collection '{}.{}' used as a value",
                entity, member
            ))),
            Some(assoc) => {
                let joined = self.join_association(table, &assoc)?;
                Ok(ExpressionNode::TableRef(joined))
            }
            None => Err(CompileError::mapping(format!(
                "'{}' has no member '{}'",
                entity, member
            ))),
        }
    }

    /// Reference to part of a derived table's row layout.
    pub(super) fn derived_member(&mut self, table: TableId, shape: &Shape) -> Result<ExpressionNode> {
        match shape {
            Shape::Column { ordinal, .. } | Shape::Quantifier { ordinal, .. } => {
                let alias = match &self.ctx.table(table).source {
                    TableSource::Derived { columns, .. } => columns.get(*ordinal).map(|c| c.alias.clone()),
                    TableSource::Entity { .. } => None,
                }
                .ok_or_else(|| {
                    CompileError::mapping(format!("derived table t{} has no column {}", table.0, ordinal))
                })?;
                Ok(self.ctx.register_column(table, &alias, &alias))
            }
            Shape::Entity {
                type_name, members, ..
            }
            | Shape::New { type_name, members } => {
                let mut names = Vec::with_capacity(members.len());
                let mut args = Vec::with_capacity(members.len());
                for (name, sub) in members {
                    names.push(name.clone());
                    args.push(self.derived_member(table, sub)?);
                }
                Ok(ExpressionNode::New {
                    type_name: type_name.clone(),
                    members: names,
                    args,
                })
            }
        }
    }

    /// Join a to-one association of `table` once, guarded against cycles.
    pub(super) fn join_association(&mut self, table: TableId, assoc: &Association) -> Result<TableId> {
        if let Some(joined) = self.ctx.association_table(table, &assoc.member) {
            return Ok(joined);
        }
        let owner = self.ctx.table(table).clone();
        let entity = self.entity_of(table)?;
        self.ctx.push_resolution(&entity, &assoc.member)?;
        let kind = if owner.join_kind == JoinKind::LeftOuter {
            JoinKind::LeftOuter
        } else {
            assoc.join_kind
        };
        let joined = self.add_association_table(table, assoc, owner.scope, kind);
        self.ctx.pop_resolution();
        let joined = joined?;
        self.ctx.remember_association(table, &assoc.member, joined);
        Ok(joined)
    }

    /// Bind the far side of an association with its key equality as join predicate.
    fn add_association_table(
        &mut self,
        owner: TableId,
        assoc: &Association,
        scope: ScopeId,
        kind: JoinKind,
    ) -> Result<TableId> {
        let schema = self.schema;
        let table = schema.table_name_for(&assoc.other_type).ok_or_else(|| {
            CompileError::mapping(format!("entity '{}' has no table mapping", assoc.other_type))
        })?;
        let joined = self.ctx.add_table(
            scope,
            TableSource::Entity {
                entity: assoc.other_type.clone(),
                table: table.to_string(),
            },
            kind,
        );
        let mut terms = Vec::with_capacity(assoc.this_keys.len());
        for (other_key, this_key) in assoc.other_keys.iter().zip(&assoc.this_keys) {
            let left = self.resolve_table_member(joined, other_key)?;
            let right = self.resolve_table_member(owner, this_key)?;
            terms.push(ExpressionNode::equal(left, right));
        }
        self.ctx.table_mut(joined).join_predicate = conjoin(terms);
        Ok(joined)
    }

    // -----------------------------------------------------------------------
    // Keys
    // -----------------------------------------------------------------------

    /// Flatten a key into comparable columns: `new` members, or an entity's
    /// primary key.
    pub(super) fn expand_key(&mut self, key: ExpressionNode) -> Result<Vec<ExpressionNode>> {
        match key {
            ExpressionNode::New { args, .. } => {
                let mut out = Vec::with_capacity(args.len());
                for arg in args {
                    out.extend(self.expand_key(arg)?);
                }
                Ok(out)
            }
            ExpressionNode::Grouping { key, .. } => self.expand_key(*key),
            ExpressionNode::TableRef(table) => {
                let entity = self.entity_of(table)?;
                let keys: Vec<String> = self
                    .schema
                    .primary_keys_for(&entity)
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                if keys.is_empty() {
                    return Err(CompileError::mapping(format!(
                        "entity '{}' has no primary key",
                        entity
                    )));
                }
                keys.iter()
                    .map(|k| self.resolve_table_member(table, k))
                    .collect()
            }
            other => Ok(vec![other]),
        }
    }

    fn first_key(&mut self, node: ExpressionNode) -> Result<ExpressionNode> {
        self.expand_key(node)?
            .into_iter()
            .next()
            .ok_or_else(|| CompileError::mapping("entity without primary key"))
    }

    /// A single comparable column for an element: itself, or a one-column key.
    fn scalar_key(&mut self, node: ExpressionNode) -> Result<ExpressionNode> {
        if self.is_scalar(&node) {
            return Ok(node);
        }
        let mut keys = self.expand_key(node)?;
        if keys.len() == 1 {
            Ok(keys.remove(0))
        } else {
            Err(CompileError::unsupported("composite value where a scalar is required"))
        }
    }

    pub(super) fn is_scalar(&self, node: &ExpressionNode) -> bool {
        !matches!(
            node,
            ExpressionNode::TableRef(_) | ExpressionNode::New { .. } | ExpressionNode::Grouping { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::UnaryOperator;
    use crate::test_support::sample_schema;

    fn analyze(chain: &OperatorChain) -> Result<(Sequence, CompilationContext)> {
        let schema = sample_schema();
        let config = CompilerConfig::default();
        let mut analyzer = Analyzer::new(&schema, &config, chain);
        let seq = analyzer.analyze_root()?;
        Ok((seq, analyzer.into_context()))
    }

    fn name_is(value: &str) -> ExpressionNode {
        ExpressionNode::lambda(
            &["c"],
            ExpressionNode::equal(ExpressionNode::path("c", &["Name"]), ExpressionNode::constant(value)),
        )
    }

    #[test]
    fn test_where_becomes_parameterized_predicate() {
        let chain = OperatorChain::from_table("Customer").filter(name_is("Acme"));
        let (seq, ctx) = analyze(&chain).unwrap();
        assert_eq!(seq.element, ExpressionNode::TableRef(TableId(0)));
        let scope = ctx.scope(seq.view.scope);
        assert_eq!(
            scope.predicates,
            vec![ExpressionNode::equal(
                ExpressionNode::ColumnRef {
                    table: TableId(0),
                    member: "Name".to_string()
                },
                ExpressionNode::InputParameter(0),
            )]
        );
        assert_eq!(ctx.parameters()[0].extractor, ValueExtractor::ChainConstant(0));
    }

    #[test]
    fn test_null_comparison_lowers_to_is_null() {
        let chain = OperatorChain::from_table("Order").filter(ExpressionNode::lambda(
            &["o"],
            ExpressionNode::not_equal(ExpressionNode::path("o", &["CustomerId"]), ExpressionNode::null()),
        ));
        let (seq, ctx) = analyze(&chain).unwrap();
        match &ctx.scope(seq.view.scope).predicates[0] {
            ExpressionNode::Call {
                method: Method::Sql(SqlOperator::IsNotNull),
                ..
            } => {}
            other => panic!("unexpected predicate {:?}", other),
        }
    }

    #[test]
    fn test_take_after_union_promotes() {
        let chain = OperatorChain::from_table("Customer")
            .union(OperatorChain::from_table("Customer").filter(name_is("Acme")))
            .take(3);
        let (seq, ctx) = analyze(&chain).unwrap();
        let outer = ctx.scope(seq.view.scope);
        assert_eq!(outer.kind, ScopeKind::Wrapper);
        assert!(outer.limit.is_some());
        assert!(ctx.table(outer.tables[0]).is_derived());
        for scope in ctx.scopes().iter().filter(|s| s.id != seq.view.scope) {
            assert_eq!(scope.parent, Some(seq.view.scope));
        }
    }

    #[test]
    fn test_group_where_goes_to_having() {
        let chain = OperatorChain::from_table("Order")
            .group_by(ExpressionNode::lambda(&["o"], ExpressionNode::path("o", &["CustomerId"])), None)
            .filter(ExpressionNode::lambda(
                &["g"],
                ExpressionNode::greater_than(
                    ExpressionNode::method(
                        ExpressionNode::param("g"),
                        Method::Query(QueryOperator::Count),
                        Vec::new(),
                    ),
                    ExpressionNode::constant(2),
                ),
            ));
        let (seq, ctx) = analyze(&chain).unwrap();
        let scope = ctx.scope(seq.view.scope);
        assert_eq!(scope.grouping.len(), 1);
        assert!(scope.predicates.is_empty());
        assert_eq!(scope.having.len(), 1);
    }

    #[test]
    fn test_unbound_parameter_is_mapping_error() {
        let chain = OperatorChain::from_table("Customer").filter(ExpressionNode::lambda(
            &["c"],
            ExpressionNode::equal(ExpressionNode::path("x", &["Name"]), ExpressionNode::constant("a")),
        ));
        assert!(matches!(analyze(&chain), Err(CompileError::Mapping(_))));
    }

    #[test]
    fn test_bare_lambda_is_unsupported() {
        let chain = OperatorChain::from_table("Customer").select(ExpressionNode::lambda(
            &["c"],
            ExpressionNode::lambda(&["d"], ExpressionNode::param("d")),
        ));
        assert!(matches!(
            analyze(&chain),
            Err(CompileError::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn test_operator_after_terminal_is_unsupported() {
        let chain = OperatorChain::from_table("Customer").count().take(1);
        assert!(matches!(
            analyze(&chain),
            Err(CompileError::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn test_entity_inequality_negates_key_comparison() {
        let chain = OperatorChain::from_table("Order").filter(ExpressionNode::lambda(
            &["o"],
            ExpressionNode::not_equal(
                ExpressionNode::path("o", &["Customer"]),
                ExpressionNode::path("o", &["Customer"]),
            ),
        ));
        let (seq, ctx) = analyze(&chain).unwrap();
        match &ctx.scope(seq.view.scope).predicates[0] {
            ExpressionNode::Unary {
                op: UnaryOperator::Not,
                ..
            } => {}
            other => panic!("unexpected predicate {:?}", other),
        }
        // Both sides reuse one join.
        assert_eq!(ctx.tables().len(), 2);
    }

    fn by_name() -> ExpressionNode {
        ExpressionNode::lambda(&["c"], ExpressionNode::path("c", &["Name"]))
    }

    fn select_one(entity: &str, body: ExpressionNode) -> OperatorChain {
        OperatorChain::from_table(entity).select(ExpressionNode::lambda(&["x"], body))
    }

    #[test]
    fn test_select_after_distinct_promotes() {
        let chain = OperatorChain::from_table("Customer").distinct().select(by_name());
        let (seq, ctx) = analyze(&chain).unwrap();
        let outer = ctx.scope(seq.view.scope);
        assert_eq!(outer.kind, ScopeKind::Wrapper);
        assert!(!outer.distinct);
        let inner = ctx.table(outer.tables[0]);
        match &inner.source {
            TableSource::Derived { scope, .. } => assert!(ctx.scope(*scope).distinct),
            other => panic!("unexpected source {:?}", other),
        }
    }

    #[test]
    fn test_order_after_distinct_promotes() {
        let chain = OperatorChain::from_table("Customer").distinct().order_by(by_name());
        let (seq, ctx) = analyze(&chain).unwrap();
        let outer = ctx.scope(seq.view.scope);
        assert_eq!(outer.kind, ScopeKind::Wrapper);
        assert_eq!(outer.ordering.len(), 1);
        assert!(!outer.distinct);
    }

    #[test]
    fn test_distinct_drops_earlier_ordering() {
        let chain = OperatorChain::from_table("Customer")
            .order_by(by_name())
            .select(ExpressionNode::lambda(&["c"], ExpressionNode::path("c", &["Id"])))
            .distinct();
        let (seq, ctx) = analyze(&chain).unwrap();
        let scope = ctx.scope(seq.view.scope);
        assert_eq!(scope.kind, ScopeKind::Root);
        assert!(scope.distinct);
        assert!(scope.ordering.is_empty());
    }

    fn customers_with_order_groups() -> OperatorChain {
        OperatorChain::from_table("Customer").group_join(
            OperatorChain::from_table("Order"),
            ExpressionNode::lambda(&["c"], ExpressionNode::path("c", &["Id"])),
            ExpressionNode::lambda(&["o"], ExpressionNode::path("o", &["CustomerId"])),
            ExpressionNode::lambda(
                &["c", "g"],
                ExpressionNode::new_object(
                    "",
                    vec![("C", ExpressionNode::param("c")), ("G", ExpressionNode::param("g"))],
                ),
            ),
        )
    }

    #[test]
    fn test_group_join_group_turns_outer_under_default_if_empty() {
        let inner_join = customers_with_order_groups().select_many(
            ExpressionNode::lambda(&["x"], ExpressionNode::path("x", &["G"])),
            None,
        );
        let (_, ctx) = analyze(&inner_join).unwrap();
        assert_eq!(ctx.table(TableId(1)).join_kind, JoinKind::Inner);
        assert!(ctx.table(TableId(1)).join_predicate.is_some());

        let outer_join = customers_with_order_groups().select_many(
            ExpressionNode::lambda(
                &["x"],
                ExpressionNode::method(
                    ExpressionNode::path("x", &["G"]),
                    Method::Query(QueryOperator::DefaultIfEmpty),
                    Vec::new(),
                ),
            ),
            None,
        );
        let (seq, ctx) = analyze(&outer_join).unwrap();
        assert_eq!(seq.element, ExpressionNode::TableRef(TableId(1)));
        assert_eq!(ctx.table(TableId(1)).join_kind, JoinKind::LeftOuter);
        assert_eq!(ctx.tables().len(), 2);
    }

    #[test]
    fn test_aggregate_over_group_join_group_is_unsupported() {
        let chain = OperatorChain::from_table("Customer").group_join(
            OperatorChain::from_table("Order"),
            ExpressionNode::lambda(&["c"], ExpressionNode::path("c", &["Id"])),
            ExpressionNode::lambda(&["o"], ExpressionNode::path("o", &["CustomerId"])),
            ExpressionNode::lambda(
                &["c", "g"],
                ExpressionNode::method(
                    ExpressionNode::param("g"),
                    Method::Query(QueryOperator::Count),
                    Vec::new(),
                ),
            ),
        );
        assert!(matches!(
            analyze(&chain),
            Err(CompileError::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn test_text_insert_splices_two_substrings() {
        let chain = select_one(
            "Customer",
            ExpressionNode::method(
                ExpressionNode::path("x", &["Name"]),
                Method::Text(TextMethod::Insert),
                vec![ExpressionNode::constant(2), ExpressionNode::constant("-")],
            ),
        );
        let (seq, _) = analyze(&chain).unwrap();
        let ExpressionNode::Call {
            method: Method::Sql(SqlOperator::Concat),
            args,
            ..
        } = &seq.element
        else {
            panic!("expected a concatenation, got {:?}", seq.element);
        };
        assert_eq!(args.len(), 3);
        assert_eq!(args[1], ExpressionNode::InputParameter(1));
        for part in [&args[0], &args[2]] {
            assert!(matches!(
                part,
                ExpressionNode::Call {
                    method: Method::Text(TextMethod::Substring),
                    ..
                }
            ));
        }
    }

    #[test]
    fn test_text_remove_without_count_keeps_the_head() {
        let chain = select_one(
            "Customer",
            ExpressionNode::method(
                ExpressionNode::path("x", &["Name"]),
                Method::Text(TextMethod::Remove),
                vec![ExpressionNode::constant(3)],
            ),
        );
        let (seq, _) = analyze(&chain).unwrap();
        assert_eq!(
            seq.element,
            ExpressionNode::call(
                Method::Text(TextMethod::Substring),
                vec![
                    ExpressionNode::ColumnRef {
                        table: TableId(0),
                        member: "Name".to_string()
                    },
                    ExpressionNode::constant(1),
                    ExpressionNode::InputParameter(0),
                ],
            )
        );
    }

    #[test]
    fn test_date_member_becomes_calendar_part() {
        let chain = select_one("Shipment", ExpressionNode::path("x", &["PlacedAt", "Month"]));
        let (seq, _) = analyze(&chain).unwrap();
        assert!(matches!(
            seq.element,
            ExpressionNode::Call {
                method: Method::DateTime(DateTimeMethod::Month),
                ..
            }
        ));

        let chain = select_one("Shipment", ExpressionNode::path("x", &["PlacedAt", "Fortnight"]));
        assert!(matches!(analyze(&chain), Err(CompileError::Mapping(_))));
    }

    fn elapsed(member: &str) -> OperatorChain {
        select_one(
            "Shipment",
            ExpressionNode::member(
                ExpressionNode::binary(
                    BinaryOperator::Subtract,
                    ExpressionNode::path("x", &["ShippedAt"]),
                    ExpressionNode::path("x", &["PlacedAt"]),
                ),
                member,
            ),
        )
    }

    #[test]
    fn test_duration_members_scale_the_millisecond_difference() {
        let (seq, _) = analyze(&elapsed("TotalSeconds")).unwrap();
        match seq.element {
            ExpressionNode::Binary {
                op: BinaryOperator::Divide,
                left,
                right,
            } => {
                assert!(matches!(
                    *left,
                    ExpressionNode::Call {
                        method: Method::DateTime(DateTimeMethod::DiffMilliseconds),
                        ..
                    }
                ));
                assert_eq!(*right, ExpressionNode::constant(1000.0));
            }
            other => panic!("unexpected lowering {:?}", other),
        }

        let (seq, _) = analyze(&elapsed("Minutes")).unwrap();
        assert!(matches!(
            seq.element,
            ExpressionNode::Binary {
                op: BinaryOperator::Modulo,
                ..
            }
        ));

        let (seq, _) = analyze(&elapsed("Days")).unwrap();
        assert!(matches!(
            seq.element,
            ExpressionNode::Call {
                method: Method::Convert(ValueType::Int),
                ..
            }
        ));

        assert!(matches!(
            analyze(&elapsed("Weeks")),
            Err(CompileError::Mapping(_))
        ));
    }

    #[test]
    fn test_conversion_to_own_type_is_dropped() {
        let to_text = |member: &str| {
            select_one(
                "Customer",
                ExpressionNode::method(
                    ExpressionNode::path("x", &[member]),
                    Method::Convert(ValueType::Text),
                    Vec::new(),
                ),
            )
        };
        let (seq, _) = analyze(&to_text("Name")).unwrap();
        assert_eq!(
            seq.element,
            ExpressionNode::ColumnRef {
                table: TableId(0),
                member: "Name".to_string()
            }
        );

        let (seq, _) = analyze(&to_text("Id")).unwrap();
        assert!(matches!(
            seq.element,
            ExpressionNode::Call {
                method: Method::Convert(ValueType::Text),
                ..
            }
        ));

        let entity = select_one(
            "Customer",
            ExpressionNode::method(ExpressionNode::param("x"), Method::Convert(ValueType::Text), Vec::new()),
        );
        assert!(matches!(
            analyze(&entity),
            Err(CompileError::UnsupportedOperation(_))
        ));
    }
}
