//! Projection building: which columns a scope returns and how a row reads back.

use super::analyzer::Analyzer;
use super::materializer::Shape;
use crate::ast::{
    BinaryOperator, DateTimeMethod, ExpressionNode, JoinKind, MathMethod, Method, QueryOperator, ScopeId,
    SqlOperator, TableId, TableSource, TextMethod, UnaryOperator, Value, ValueType,
};
use crate::error::{CompileError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedColumn {
    pub expr: ExpressionNode,
    /// Unique within the projection.
    pub alias: String,
    pub value_type: ValueType,
    pub nullable: bool,
}

/// The SELECT list of one scope plus the row layout it produces.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub columns: Vec<ProjectedColumn>,
    pub shape: Shape,
}

fn unique_alias(columns: &[ProjectedColumn], base: &str) -> String {
    let taken = |alias: &str| columns.iter().any(|c| c.alias.eq_ignore_ascii_case(alias));
    if !taken(base) {
        return base.to_string();
    }
    let mut n = 1;
    loop {
        let candidate = format!("{}{}", base, n);
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

impl<'a> Analyzer<'a> {
    /// Columns for the scope's projection expression, in shape order.
    pub fn build_projection(&mut self, scope: ScopeId) -> Result<Projection> {
        let projection = self
            .ctx
            .scope(scope)
            .projection
            .clone()
            .ok_or_else(|| CompileError::unsupported(format!("scope {} without projection", scope.0)))?;

        let mut columns = Vec::new();
        let mut shape = self.project(&projection, None, &mut columns)?;
        if let Some(op) = self.ctx.scope(scope).scalar_method {
            if op.is_quantifier() {
                if let Shape::Column { ordinal, .. } = shape {
                    shape = Shape::Quantifier {
                        ordinal,
                        all: op == QueryOperator::All,
                    };
                }
            }
        }
        Ok(Projection { columns, shape })
    }

    fn project(
        &mut self,
        node: &ExpressionNode,
        name: Option<&str>,
        columns: &mut Vec<ProjectedColumn>,
    ) -> Result<Shape> {
        match node {
            ExpressionNode::TableRef(table) => self.project_table(*table, columns),
            ExpressionNode::New {
                type_name,
                members,
                args,
            } => {
                let mut shaped = Vec::with_capacity(args.len());
                for (member, arg) in members.iter().zip(args) {
                    shaped.push((member.clone(), self.project(arg, Some(member), columns)?));
                }
                Ok(Shape::New {
                    type_name: type_name.clone(),
                    members: shaped,
                })
            }
            ExpressionNode::Grouping { key, .. } => self.project(key, name, columns),
            scalar => {
                let base = match (name, scalar) {
                    (Some(name), _) => name.to_string(),
                    (None, ExpressionNode::ColumnRef { member, .. }) => member.clone(),
                    (None, _) => format!("c{}", columns.len()),
                };
                Ok(self.push_column(scalar.clone(), &base, columns))
            }
        }
    }

    fn push_column(
        &self,
        expr: ExpressionNode,
        base: &str,
        columns: &mut Vec<ProjectedColumn>,
    ) -> Shape {
        let ordinal = columns.len();
        let value_type = self.static_type(&expr);
        let nullable = self.is_nullable(&expr);
        columns.push(ProjectedColumn {
            alias: unique_alias(columns, base),
            expr,
            value_type: value_type.clone(),
            nullable,
        });
        Shape::Column {
            ordinal,
            value_type,
            nullable,
        }
    }

    /// Every member of a table, with eager associations as nested entities.
    fn project_table(&mut self, table: TableId, columns: &mut Vec<ProjectedColumn>) -> Result<Shape> {
        let binding = self.ctx.table(table).clone();
        let entity = match &binding.source {
            TableSource::Derived {
                columns: derived,
                shape,
                ..
            } => {
                let base = columns.len();
                for column in derived {
                    let expr = self.ctx.register_column(table, &column.alias, &column.alias);
                    self.push_column(expr, &column.alias, columns);
                }
                return Ok(shape.shifted(base));
            }
            TableSource::Entity { entity, .. } => entity.clone(),
        };

        let schema = self.schema;
        let members = schema
            .members_of(&entity)
            .ok_or_else(|| CompileError::mapping(format!("entity '{}' is not mapped", entity)))?;
        let mut shaped = Vec::with_capacity(members.len());
        let mut keys = Vec::new();
        for member in members {
            let expr = self.ctx.register_column(table, &member.name, member.column_name());
            let shape = self.push_column(expr, &member.name, columns);
            if member.primary_key {
                keys.push(columns.len() - 1);
            }
            shaped.push((member.name.clone(), shape));
        }

        for assoc in schema.associations_of(&entity) {
            if !assoc.eager || assoc.is_many() {
                continue;
            }
            let joined = self.join_association(table, &assoc)?;
            self.ctx.push_resolution(&entity, &assoc.member)?;
            let nested = self.project_table(joined, columns);
            self.ctx.pop_resolution();
            shaped.push((assoc.member.clone(), nested?));
        }

        Ok(Shape::Entity {
            type_name: entity,
            members: shaped,
            keys,
        })
    }

    fn column_facts(&self, table: TableId, member: &str) -> (ValueType, bool) {
        let binding = self.ctx.table(table);
        let outer = binding.join_kind == JoinKind::LeftOuter;
        match &binding.source {
            TableSource::Entity { entity, .. } => match self.schema.member_for(entity, member) {
                Some(m) => (m.value_type.clone(), m.nullable || outer),
                None => (ValueType::Any, true),
            },
            TableSource::Derived { .. } => match binding.derived_column(member) {
                Some(c) => (c.value_type.clone(), c.nullable || outer),
                None => (ValueType::Any, true),
            },
        }
    }

    /// Best static type of an analyzed node.
    pub fn static_type(&self, node: &ExpressionNode) -> ValueType {
        match node {
            ExpressionNode::Constant(value) => value.value_type(),
            ExpressionNode::InputParameter(index) => self
                .ctx
                .parameters()
                .get(*index)
                .map(|p| p.declared_type.clone())
                .unwrap_or(ValueType::Any),
            ExpressionNode::ColumnRef { table, member } => self.column_facts(*table, member).0,
            ExpressionNode::TableRef(table) => match self.ctx.table(*table).entity_type() {
                Some(entity) => ValueType::Entity(entity.to_string()),
                None => ValueType::Any,
            },
            ExpressionNode::New { type_name, .. } => ValueType::Entity(type_name.clone()),
            ExpressionNode::Grouping { key, .. } => self.static_type(key),
            ExpressionNode::Conditional { then, .. } => self.static_type(then),
            ExpressionNode::Unary { op, operand } => match op {
                UnaryOperator::Not => ValueType::Bool,
                UnaryOperator::Negate => self.static_type(operand),
            },
            ExpressionNode::Binary { op, left, right } => {
                if op.is_comparison() || op.is_logical() {
                    return ValueType::Bool;
                }
                let l = self.static_type(left);
                let r = self.static_type(right);
                match (*op, l, r) {
                    (BinaryOperator::Coalesce, ValueType::Null, r) => r,
                    (BinaryOperator::Coalesce, l, _) => l,
                    (_, ValueType::Float, _) | (_, _, ValueType::Float) => ValueType::Float,
                    (_, l, _) => l,
                }
            }
            ExpressionNode::ScopeRef(scope) => {
                let scope = self.ctx.scope(*scope);
                match (&scope.output, &scope.projection) {
                    (Some(output), _) => output.shape.value_type(),
                    (None, Some(projection)) => self.static_type(projection),
                    (None, None) => ValueType::Any,
                }
            }
            ExpressionNode::Call { method, args, .. } => match method {
                Method::Sql(SqlOperator::Concat) => ValueType::Text,
                Method::Sql(SqlOperator::List) => ValueType::Array(Box::new(
                    args.first()
                        .map(|a| self.static_type(a))
                        .unwrap_or(ValueType::Any),
                )),
                Method::Sql(_) => ValueType::Bool,
                Method::Text(TextMethod::Length) | Method::Text(TextMethod::IndexOf) => ValueType::Int,
                Method::Text(_) => ValueType::Text,
                Method::Math(MathMethod::Sign) => ValueType::Int,
                Method::Math(MathMethod::Abs)
                | Method::Math(MathMethod::Floor)
                | Method::Math(MathMethod::Ceiling)
                | Method::Math(MathMethod::Round) => args
                    .first()
                    .map(|a| self.static_type(a))
                    .unwrap_or(ValueType::Float),
                Method::Math(_) => ValueType::Float,
                Method::DateTime(DateTimeMethod::Date) => ValueType::DateTime,
                Method::DateTime(DateTimeMethod::DiffMilliseconds) => ValueType::Float,
                Method::DateTime(_) => ValueType::Int,
                Method::Convert(to) => to.clone(),
                Method::Query(QueryOperator::Count) => ValueType::Int,
                Method::Query(QueryOperator::Average) => ValueType::Float,
                Method::Query(_) => args
                    .first()
                    .map(|a| self.static_type(a))
                    .unwrap_or(ValueType::Any),
                Method::Function(name) => self
                    .function_types
                    .get(name)
                    .cloned()
                    .unwrap_or(ValueType::Any),
            },
            ExpressionNode::Parameter(_)
            | ExpressionNode::MemberAccess { .. }
            | ExpressionNode::Lambda { .. } => ValueType::Any,
        }
    }

    /// Whether an analyzed node can read as NULL.
    pub fn is_nullable(&self, node: &ExpressionNode) -> bool {
        match node {
            ExpressionNode::Constant(value) => matches!(value, Value::Null),
            ExpressionNode::ColumnRef { table, member } => self.column_facts(*table, member).1,
            ExpressionNode::ScopeRef(_) => true,
            ExpressionNode::Conditional {
                then, otherwise, ..
            } => self.is_nullable(then) || self.is_nullable(otherwise),
            ExpressionNode::Binary { op, left, right } => match op {
                BinaryOperator::Coalesce => self.is_nullable(right),
                op if op.is_comparison() || op.is_logical() => false,
                _ => self.is_nullable(left) || self.is_nullable(right),
            },
            ExpressionNode::Unary { operand, .. } => self.is_nullable(operand),
            ExpressionNode::Call { method, args, .. } => match method {
                Method::Query(QueryOperator::Count) | Method::Sql(_) => false,
                Method::Query(_) | Method::Function(_) => true,
                Method::Text(_) | Method::Math(_) | Method::DateTime(_) | Method::Convert(_) => {
                    args.iter().any(|a| self.is_nullable(a))
                }
            },
            ExpressionNode::InputParameter(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::OperatorChain;
    use crate::config::CompilerConfig;
    use crate::test_support::sample_schema;

    fn projection_of(chain: &OperatorChain) -> Result<Projection> {
        let schema = sample_schema();
        let config = CompilerConfig::default();
        let mut analyzer = Analyzer::new(&schema, &config, chain);
        let root = analyzer.ctx.root();
        let seq = analyzer.analyze_chain(chain, root)?;
        analyzer.ctx.scope_mut(seq.view.scope).projection = Some(seq.element);
        analyzer.build_projection(seq.view.scope)
    }

    #[test]
    fn test_entity_projection_marks_keys() {
        let projection = projection_of(&OperatorChain::from_table("Customer")).unwrap();
        let aliases: Vec<&str> = projection.columns.iter().map(|c| c.alias.as_str()).collect();
        assert_eq!(aliases, vec!["Id", "Name"]);
        match projection.shape {
            Shape::Entity { keys, .. } => assert_eq!(keys, vec![0]),
            other => panic!("unexpected shape {:?}", other),
        }
    }

    #[test]
    fn test_eager_association_is_nested_and_nullable() {
        let projection = projection_of(&OperatorChain::from_table("Order")).unwrap();
        let customer = match &projection.shape {
            Shape::Entity { members, .. } => members
                .iter()
                .find(|(name, _)| name == "Customer")
                .map(|(_, shape)| shape.clone()),
            _ => None,
        }
        .unwrap();
        match customer {
            Shape::Entity { members, keys, .. } => {
                assert_eq!(keys.len(), 1);
                assert_eq!(members.len(), 2);
            }
            other => panic!("unexpected shape {:?}", other),
        }
        // Customer columns come from an outer join on a nullable key.
        assert!(projection.columns.iter().skip(3).all(|c| c.nullable));
        assert_eq!(projection.columns[3].alias, "Id1");
    }

    #[test]
    fn test_self_referencing_eager_association_is_rejected() {
        let err = projection_of(&OperatorChain::from_table("Category")).unwrap_err();
        assert_eq!(
            err,
            CompileError::Recursion {
                path: "Category.Parent -> Category.Parent".to_string()
            }
        );
    }

    #[test]
    fn test_new_projection_uses_member_names() {
        let chain = OperatorChain::from_table("Customer").select(ExpressionNode::lambda(
            &["c"],
            ExpressionNode::new_object(
                "Summary",
                vec![
                    ("Label", ExpressionNode::path("c", &["Name"])),
                    ("Orders", ExpressionNode::method(
                        ExpressionNode::path("c", &["Orders"]),
                        Method::Query(QueryOperator::Count),
                        Vec::new(),
                    )),
                ],
            ),
        ));
        let projection = projection_of(&chain).unwrap();
        assert_eq!(projection.columns[0].alias, "Label");
        assert_eq!(projection.columns[1].alias, "Orders");
        assert_eq!(projection.columns[1].value_type, ValueType::Int);
    }
}
