//! Select scopes and the per-compile context that owns them.
//!
//! Every compile gets a private [`CompilationContext`]. Scopes live in an
//! arena and refer to their parent by [`ScopeId`], so the parent chain is a
//! plain index walk and can never own a cycle. Moving between scopes goes
//! through [`CompilationContext::transition`], which applies one sharing
//! rule per [`ScopeTransition`]:
//!
//! | transition            | new scope | parent of new scope       | parameter frame |
//! |-----------------------|-----------|---------------------------|-----------------|
//! | `ChildScope`          | yes       | current                   | shared          |
//! | `SiblingScope`        | yes       | current's parent          | shared          |
//! | `ParentPromotion`     | yes       | current's former parent   | shared          |
//! | `LocalParameterScope` | no        | -                         | cloned          |
//!
//! The scope list, table list, parameter list and resolution stack are
//! always shared: they belong to the context, not to a view.

use std::collections::HashMap;
use tracing::trace;

use super::projection::Projection;
use crate::query::ValueExtractor;
use crate::ast::{
    ColumnBinding, ExpressionNode, JoinKind, QueryOperator, ScopeId, TableBinding, TableId,
    TableSource, ValueType,
};
use crate::error::{CompileError, Result};

/// What a scope becomes in the emitted statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// The outermost SELECT.
    Root,
    /// Tables joined into the parent's FROM clause.
    Join,
    /// A correlated sub-query in an expression.
    Subquery,
    /// Right-hand operand of a set operation.
    SetOperand,
    /// A SELECT over the derived table of a promoted scope.
    Wrapper,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOperator {
    Union,
    UnionAll,
    Intersect,
    Except,
}

impl SetOperator {
    pub fn from_query(op: QueryOperator) -> Option<Self> {
        match op {
            QueryOperator::Union => Some(SetOperator::Union),
            QueryOperator::Concat => Some(SetOperator::UnionAll),
            QueryOperator::Intersect => Some(SetOperator::Intersect),
            QueryOperator::Except => Some(SetOperator::Except),
            _ => None,
        }
    }
}

/// Link from a set operand to the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetLink {
    pub operator: SetOperator,
    pub scope: ScopeId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderingTerm {
    pub expr: ExpressionNode,
    pub descending: bool,
}

/// One SELECT level.
#[derive(Debug, Clone)]
pub struct SelectScope {
    pub id: ScopeId,
    /// Enclosing scope; never owned.
    pub parent: Option<ScopeId>,
    pub kind: ScopeKind,
    pub tables: Vec<TableId>,
    pub columns: Vec<ColumnBinding>,
    pub predicates: Vec<ExpressionNode>,
    pub grouping: Vec<ExpressionNode>,
    pub having: Vec<ExpressionNode>,
    pub ordering: Vec<OrderingTerm>,
    pub distinct: bool,
    pub limit: Option<ExpressionNode>,
    pub offset: Option<ExpressionNode>,
    /// Analyzed expression the scope returns per row.
    pub projection: Option<ExpressionNode>,
    /// Column layout built from `projection`.
    pub output: Option<Projection>,
    /// Terminal operator that reduced the result to one value.
    pub scalar_method: Option<QueryOperator>,
    pub next: Option<SetLink>,
}

impl SelectScope {
    fn new(id: ScopeId, parent: Option<ScopeId>, kind: ScopeKind) -> Self {
        Self {
            id,
            parent,
            kind,
            tables: Vec::new(),
            columns: Vec::new(),
            predicates: Vec::new(),
            grouping: Vec::new(),
            having: Vec::new(),
            ordering: Vec::new(),
            distinct: false,
            limit: None,
            offset: None,
            projection: None,
            output: None,
            scalar_method: None,
            next: None,
        }
    }

    pub fn is_paged(&self) -> bool {
        self.limit.is_some() || self.offset.is_some()
    }

    pub fn has_set_operation(&self) -> bool {
        self.next.is_some()
    }

    pub fn is_grouped(&self) -> bool {
        !self.grouping.is_empty()
    }

    /// Nothing but tables and filters.
    pub fn is_plain(&self) -> bool {
        !self.is_paged()
            && !self.has_set_operation()
            && !self.is_grouped()
            && !self.distinct
            && self.ordering.is_empty()
            && self.scalar_method.is_none()
    }
}

/// How a view moves to its next scope; see the module table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeTransition {
    ChildScope(ScopeKind),
    SiblingScope,
    ParentPromotion,
    LocalParameterScope,
}

/// Where analysis currently stands: a scope plus a parameter frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeView {
    pub scope: ScopeId,
    pub frame: usize,
}

/// A value the compiled statement binds at execution time.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredParameter {
    pub name: String,
    pub extractor: ValueExtractor,
    pub declared_type: ValueType,
}

#[derive(Debug)]
pub struct CompilationContext {
    scopes: Vec<SelectScope>,
    tables: Vec<TableBinding>,
    root_tables: HashMap<(ScopeId, String), TableId>,
    association_tables: HashMap<(TableId, String), TableId>,
    frames: Vec<HashMap<String, ExpressionNode>>,
    call_stack: Vec<(String, String)>,
    parameters: Vec<RegisteredParameter>,
    depth: usize,
    max_depth: usize,
}

impl CompilationContext {
    pub fn new(max_depth: usize) -> Self {
        Self {
            scopes: Vec::new(),
            tables: Vec::new(),
            root_tables: HashMap::new(),
            association_tables: HashMap::new(),
            frames: Vec::new(),
            call_stack: Vec::new(),
            parameters: Vec::new(),
            depth: 0,
            max_depth,
        }
    }

    /// Create the outermost scope with an empty parameter frame.
    pub fn root(&mut self) -> ScopeView {
        let scope = self.push_scope(None, ScopeKind::Root);
        self.frames.push(HashMap::new());
        ScopeView {
            scope,
            frame: self.frames.len() - 1,
        }
    }

    fn push_scope(&mut self, parent: Option<ScopeId>, kind: ScopeKind) -> ScopeId {
        let id = ScopeId(self.scopes.len());
        self.scopes.push(SelectScope::new(id, parent, kind));
        id
    }

    // -- transitions --------------------------------------------------------

    pub fn transition(&mut self, view: ScopeView, transition: ScopeTransition) -> ScopeView {
        let next = match transition {
            ScopeTransition::ChildScope(kind) => ScopeView {
                scope: self.push_scope(Some(view.scope), kind),
                frame: view.frame,
            },
            ScopeTransition::SiblingScope => {
                let parent = self.scope(view.scope).parent;
                ScopeView {
                    scope: self.push_scope(parent, ScopeKind::SetOperand),
                    frame: view.frame,
                }
            }
            ScopeTransition::ParentPromotion => {
                let parent = self.scope(view.scope).parent;
                let wrapper = self.push_scope(parent, ScopeKind::Wrapper);
                let mut cursor = Some(view.scope);
                while let Some(id) = cursor {
                    let scope = self.scope_mut(id);
                    scope.parent = Some(wrapper);
                    cursor = scope.next.map(|link| link.scope);
                }
                ScopeView {
                    scope: wrapper,
                    frame: view.frame,
                }
            }
            ScopeTransition::LocalParameterScope => {
                let frame = self.frames[view.frame].clone();
                self.frames.push(frame);
                ScopeView {
                    scope: view.scope,
                    frame: self.frames.len() - 1,
                }
            }
        };
        trace!(
            ?transition,
            from = view.scope.0,
            to = next.scope.0,
            frame = next.frame,
            "scope transition"
        );
        next
    }

    pub fn enter_child_scope(&mut self, view: ScopeView, kind: ScopeKind) -> ScopeView {
        self.transition(view, ScopeTransition::ChildScope(kind))
    }

    pub fn enter_sibling_scope(&mut self, view: ScopeView) -> ScopeView {
        self.transition(view, ScopeTransition::SiblingScope)
    }

    pub fn promote_to_parent_scope(&mut self, view: ScopeView) -> ScopeView {
        self.transition(view, ScopeTransition::ParentPromotion)
    }

    pub fn enter_local_parameter_scope(&mut self, view: ScopeView) -> ScopeView {
        self.transition(view, ScopeTransition::LocalParameterScope)
    }

    // -- scopes -------------------------------------------------------------

    pub fn scope(&self, id: ScopeId) -> &SelectScope {
        &self.scopes[id.0]
    }

    pub fn scope_mut(&mut self, id: ScopeId) -> &mut SelectScope {
        &mut self.scopes[id.0]
    }

    pub fn scopes(&self) -> &[SelectScope] {
        &self.scopes
    }

    /// Join-kind children whose tables are emitted in this scope's FROM.
    pub fn inline_children(&self, id: ScopeId) -> Vec<ScopeId> {
        let mut out = Vec::new();
        for scope in &self.scopes {
            if scope.parent == Some(id) && scope.kind == ScopeKind::Join {
                out.push(scope.id);
                out.extend(self.inline_children(scope.id));
            }
        }
        out
    }

    /// Tables of the scope and its inlined children, by creation order.
    pub fn inline_tables(&self, id: ScopeId) -> Vec<TableId> {
        let mut tables = self.scope(id).tables.clone();
        for child in self.inline_children(id) {
            tables.extend(self.scope(child).tables.iter().copied());
        }
        tables.sort();
        tables
    }

    /// Tables visible from a scope, innermost first.
    pub fn visible_tables(&self, id: ScopeId) -> Vec<TableId> {
        let mut out = Vec::new();
        let mut cursor = Some(id);
        while let Some(scope) = cursor {
            out.extend(self.inline_tables(scope));
            cursor = self.scope(scope).parent;
        }
        out
    }

    /// Columns visible from a scope, innermost first.
    pub fn visible_columns(&self, id: ScopeId) -> Vec<&ColumnBinding> {
        let mut out = Vec::new();
        let mut cursor = Some(id);
        while let Some(scope) = cursor {
            out.extend(self.scope(scope).columns.iter());
            for child in self.inline_children(scope) {
                out.extend(self.scope(child).columns.iter());
            }
            cursor = self.scope(scope).parent;
        }
        out
    }

    pub fn is_visible(&self, from: ScopeId, table: TableId) -> bool {
        self.visible_tables(from).contains(&table)
    }

    // -- tables and columns -------------------------------------------------

    pub fn add_table(
        &mut self,
        scope: ScopeId,
        source: TableSource,
        join_kind: JoinKind,
    ) -> TableId {
        let id = TableId(self.tables.len());
        self.tables.push(TableBinding {
            id,
            source,
            alias: format!("t{}", id.0),
            scope,
            join_kind,
            join_predicate: None,
        });
        self.scope_mut(scope).tables.push(id);
        id
    }

    /// The root binding of `entity` in `scope`, created on first use.
    pub fn root_table(&mut self, scope: ScopeId, entity: &str, table: &str) -> TableId {
        let key = (scope, entity.to_string());
        if let Some(&id) = self.root_tables.get(&key) {
            return id;
        }
        let id = self.add_table(
            scope,
            TableSource::Entity {
                entity: entity.to_string(),
                table: table.to_string(),
            },
            JoinKind::None,
        );
        self.root_tables.insert(key, id);
        id
    }

    pub fn association_table(&self, table: TableId, member: &str) -> Option<TableId> {
        self.association_tables
            .get(&(table, member.to_string()))
            .copied()
    }

    pub fn remember_association(&mut self, table: TableId, member: &str, joined: TableId) {
        self.association_tables
            .insert((table, member.to_string()), joined);
    }

    pub fn table(&self, id: TableId) -> &TableBinding {
        &self.tables[id.0]
    }

    pub fn table_mut(&mut self, id: TableId) -> &mut TableBinding {
        &mut self.tables[id.0]
    }

    pub fn tables(&self) -> &[TableBinding] {
        &self.tables
    }

    /// Record a column reference in the scope owning its table.
    pub fn register_column(&mut self, table: TableId, member: &str, column: &str) -> ExpressionNode {
        let scope = self.table(table).scope;
        let columns = &mut self.scope_mut(scope).columns;
        if !columns.iter().any(|c| c.table == table && c.member == member) {
            columns.push(ColumnBinding {
                table,
                member: member.to_string(),
                alias: column.to_string(),
            });
        }
        ExpressionNode::ColumnRef {
            table,
            member: member.to_string(),
        }
    }

    // -- parameter frames ---------------------------------------------------

    pub fn bind_parameter(&mut self, view: ScopeView, name: &str, value: ExpressionNode) {
        self.frames[view.frame].insert(name.to_string(), value);
    }

    pub fn lookup_parameter(&self, view: ScopeView, name: &str) -> Option<&ExpressionNode> {
        self.frames[view.frame].get(name)
    }

    // -- bound parameters ---------------------------------------------------

    /// Index of the parameter reading `extractor`, registering it if new.
    pub fn register_parameter(&mut self, extractor: ValueExtractor, declared_type: ValueType) -> usize {
        if let Some(index) = self.parameters.iter().position(|p| p.extractor == extractor) {
            return index;
        }
        let index = self.parameters.len();
        self.parameters.push(RegisteredParameter {
            name: format!("p{}", index),
            extractor,
            declared_type,
        });
        index
    }

    pub fn parameters(&self) -> &[RegisteredParameter] {
        &self.parameters
    }

    // -- guards -------------------------------------------------------------

    /// Mark `entity.member` as being resolved.
    pub fn push_resolution(&mut self, entity: &str, member: &str) -> Result<()> {
        let pair = (entity.to_string(), member.to_string());
        if self.call_stack.contains(&pair) {
            let mut path: Vec<String> = self
                .call_stack
                .iter()
                .map(|(e, m)| format!("{}.{}", e, m))
                .collect();
            path.push(format!("{}.{}", entity, member));
            return Err(CompileError::Recursion {
                path: path.join(" -> "),
            });
        }
        self.call_stack.push(pair);
        Ok(())
    }

    pub fn pop_resolution(&mut self) {
        self.call_stack.pop();
    }

    pub fn enter_node(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > self.max_depth {
            self.depth -= 1;
            return Err(CompileError::Recursion {
                path: format!("expression nesting deeper than {}", self.max_depth),
            });
        }
        Ok(())
    }

    pub fn leave_node(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(name: &str) -> TableSource {
        TableSource::Entity {
            entity: name.to_string(),
            table: format!("{}s", name),
        }
    }

    #[test]
    fn test_child_and_sibling_parents() {
        let mut ctx = CompilationContext::new(16);
        let root = ctx.root();
        let child = ctx.enter_child_scope(root, ScopeKind::Subquery);
        let sibling = ctx.enter_sibling_scope(child);
        assert_eq!(ctx.scope(child.scope).parent, Some(root.scope));
        assert_eq!(ctx.scope(sibling.scope).parent, Some(root.scope));
        assert_eq!(child.frame, root.frame);
        assert_eq!(sibling.frame, root.frame);
    }

    #[test]
    fn test_promotion_reparents_sibling_chain() {
        let mut ctx = CompilationContext::new(16);
        let root = ctx.root();
        let first = ctx.enter_child_scope(root, ScopeKind::Subquery);
        let second = ctx.enter_sibling_scope(first);
        let third = ctx.enter_sibling_scope(first);
        ctx.scope_mut(first.scope).next = Some(SetLink {
            operator: SetOperator::Union,
            scope: second.scope,
        });
        ctx.scope_mut(second.scope).next = Some(SetLink {
            operator: SetOperator::Except,
            scope: third.scope,
        });

        let before = ctx.scopes().len();
        let wrapper = ctx.promote_to_parent_scope(first);

        assert_eq!(wrapper.scope.0, before);
        assert!(ctx.scopes().iter().all(|s| s.id.0 <= wrapper.scope.0));
        for id in [first.scope, second.scope, third.scope] {
            assert_eq!(ctx.scope(id).parent, Some(wrapper.scope));
        }
        assert_eq!(ctx.scope(wrapper.scope).parent, Some(root.scope));
    }

    #[test]
    fn test_local_parameter_scope_is_independent() {
        let mut ctx = CompilationContext::new(16);
        let root = ctx.root();
        ctx.bind_parameter(root, "c", ExpressionNode::TableRef(TableId(0)));
        let local = ctx.enter_local_parameter_scope(root);
        ctx.bind_parameter(local, "o", ExpressionNode::TableRef(TableId(1)));
        ctx.bind_parameter(local, "c", ExpressionNode::TableRef(TableId(2)));

        assert_eq!(local.scope, root.scope);
        assert!(ctx.lookup_parameter(root, "o").is_none());
        assert_eq!(
            ctx.lookup_parameter(root, "c"),
            Some(&ExpressionNode::TableRef(TableId(0)))
        );
        assert_eq!(
            ctx.lookup_parameter(local, "c"),
            Some(&ExpressionNode::TableRef(TableId(2)))
        );
    }

    #[test]
    fn test_visibility_walks_parents_innermost_first() {
        let mut ctx = CompilationContext::new(16);
        let root = ctx.root();
        let outer = ctx.add_table(root.scope, entity("Customer"), JoinKind::None);
        let joined = ctx.enter_child_scope(root, ScopeKind::Join);
        let order = ctx.add_table(joined.scope, entity("Order"), JoinKind::Inner);
        let sub = ctx.enter_child_scope(root, ScopeKind::Subquery);
        let inner = ctx.add_table(sub.scope, entity("Order"), JoinKind::None);

        assert_eq!(ctx.visible_tables(sub.scope), vec![inner, outer, order]);
        assert!(ctx.is_visible(root.scope, order));
        assert!(!ctx.is_visible(root.scope, inner));
    }

    #[test]
    fn test_aliases_are_global() {
        let mut ctx = CompilationContext::new(16);
        let root = ctx.root();
        let sub = ctx.enter_child_scope(root, ScopeKind::Subquery);
        let a = ctx.root_table(root.scope, "Customer", "Customers");
        let b = ctx.root_table(sub.scope, "Customer", "Customers");
        let again = ctx.root_table(root.scope, "Customer", "Customers");
        assert_eq!(a, again);
        assert_ne!(ctx.table(a).alias, ctx.table(b).alias);
    }

    #[test]
    fn test_resolution_guard_reports_path() {
        let mut ctx = CompilationContext::new(16);
        ctx.push_resolution("Category", "Parent").unwrap();
        let err = ctx.push_resolution("Category", "Parent").unwrap_err();
        assert_eq!(
            err,
            CompileError::Recursion {
                path: "Category.Parent -> Category.Parent".to_string()
            }
        );
        ctx.pop_resolution();
        assert!(ctx.push_resolution("Category", "Parent").is_ok());
    }

    #[test]
    fn test_depth_guard() {
        let mut ctx = CompilationContext::new(2);
        ctx.enter_node().unwrap();
        ctx.enter_node().unwrap();
        assert!(matches!(
            ctx.enter_node(),
            Err(CompileError::Recursion { .. })
        ));
        ctx.leave_node();
        assert!(ctx.enter_node().is_ok());
    }

    #[test]
    fn test_parameters_dedup_by_extractor() {
        let mut ctx = CompilationContext::new(16);
        let a = ctx.register_parameter(ValueExtractor::ChainConstant(0), ValueType::Text);
        let b = ctx.register_parameter(ValueExtractor::ChainConstant(1), ValueType::Int);
        let again = ctx.register_parameter(ValueExtractor::ChainConstant(0), ValueType::Text);
        assert_eq!((a, b, again), (0, 1, 0));
        assert_eq!(ctx.parameters()[1].name, "p1");
    }
}
