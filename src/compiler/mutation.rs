//! Insert, update and delete templates.
//!
//! Mutations are keyed by entity and modified-member set rather than by a
//! chain. Every parameter reads a member of the bound instance, so one
//! template serves every instance of the entity.

use std::collections::BTreeSet;

use crate::config::{Dialect, IdentityStrategy};
use crate::error::{CompileError, Result};
use crate::query::{
    DeleteQuery, InputParameterDescriptor, OutputParameterDescriptor, UpsertQuery, ValueExtractor,
};
use crate::schema::{MemberMapping, SchemaResolver};
use crate::sql::{
    render, Assignment, BinaryOperator, DeleteStatement, Expression, InsertStatement, Statement,
    UpdateStatement,
};

use super::emitter::binary;

/// Parameters collected while building one template.
#[derive(Default)]
struct MemberParameters {
    descriptors: Vec<InputParameterDescriptor>,
}

impl MemberParameters {
    fn bind(&mut self, member: &MemberMapping) -> Expression {
        let ordinal = self.descriptors.len();
        self.descriptors.push(InputParameterDescriptor {
            name: member.name.clone(),
            extractor: ValueExtractor::Member(member.name.clone()),
            declared_type: member.value_type.clone(),
        });
        Expression::Parameter {
            name: member.name.clone(),
            ordinal,
        }
    }
}

fn members<'s>(schema: &'s dyn SchemaResolver, entity: &str) -> Result<(&'s str, &'s [MemberMapping])> {
    let table = schema
        .table_name_for(entity)
        .ok_or_else(|| CompileError::mapping(format!("entity '{}' is not mapped", entity)))?;
    let members = schema
        .members_of(entity)
        .ok_or_else(|| CompileError::mapping(format!("entity '{}' has no members", entity)))?;
    Ok((table, members))
}

/// `key1 = @Key1 AND key2 = @Key2` over unqualified columns.
fn key_filter(
    entity: &str,
    members: &[MemberMapping],
    parameters: &mut MemberParameters,
) -> Result<Expression> {
    members
        .iter()
        .filter(|m| m.primary_key)
        .map(|key| {
            let column = Expression::Column {
                table: None,
                name: key.column_name().to_string(),
            };
            binary(column, BinaryOperator::Eq, parameters.bind(key))
        })
        .reduce(|left, right| binary(left, BinaryOperator::And, right))
        .ok_or_else(|| CompileError::mapping(format!("entity '{}' has no primary key", entity)))
}

pub fn compile_insert(schema: &dyn SchemaResolver, dialect: &Dialect, entity: &str) -> Result<UpsertQuery> {
    let (table, members) = members(schema, entity)?;

    let mut parameters = MemberParameters::default();
    let mut columns = Vec::new();
    let mut values = Vec::new();
    let mut generated = Vec::new();
    for member in members {
        if member.generated {
            generated.push(member);
            continue;
        }
        columns.push(member.column_name().to_string());
        values.push(parameters.bind(member));
    }

    let output_parameters: Vec<OutputParameterDescriptor> = generated
        .iter()
        .map(|m| OutputParameterDescriptor {
            name: m.name.clone(),
            member: m.name.clone(),
            declared_type: m.value_type.clone(),
        })
        .collect();

    let (returning, id_query_sql) = match &dialect.identity {
        _ if generated.is_empty() => (Vec::new(), None),
        IdentityStrategy::Returning => (
            generated.iter().map(|m| m.column_name().to_string()).collect(),
            None,
        ),
        IdentityStrategy::Query(sql) => (Vec::new(), Some(sql.clone())),
    };

    let statement = Statement::Insert(InsertStatement {
        table: table.to_string(),
        columns,
        values,
        returning,
    });
    Ok(UpsertQuery {
        sql: render(&statement, dialect),
        id_query_sql,
        input_parameters: parameters.descriptors,
        output_parameters,
    })
}

pub fn compile_update(
    schema: &dyn SchemaResolver,
    dialect: &Dialect,
    entity: &str,
    modified: &BTreeSet<String>,
) -> Result<UpsertQuery> {
    let (table, members) = members(schema, entity)?;
    if !members.iter().any(|m| m.primary_key) {
        return Err(CompileError::mapping(format!(
            "entity '{}' has no primary key",
            entity
        )));
    }
    if modified.is_empty() {
        return Err(CompileError::unsupported(format!(
            "update of '{}' without modified members",
            entity
        )));
    }
    for name in modified {
        let member = schema.member_for(entity, name).ok_or_else(|| {
            CompileError::mapping(format!("'{}' has no member '{}'", entity, name))
        })?;
        if member.primary_key || member.generated {
            return Err(CompileError::unsupported(format!(
                "update of key or generated member '{}.{}'",
                entity, name
            )));
        }
    }

    let mut parameters = MemberParameters::default();
    let assignments = members
        .iter()
        .filter(|m| modified.contains(&m.name))
        .map(|m| Assignment {
            column: m.column_name().to_string(),
            value: parameters.bind(m),
        })
        .collect();
    let filter = key_filter(entity, members, &mut parameters)?;

    let statement = Statement::Update(UpdateStatement {
        table: table.to_string(),
        assignments,
        filter: Some(filter),
    });
    Ok(UpsertQuery {
        sql: render(&statement, dialect),
        id_query_sql: None,
        input_parameters: parameters.descriptors,
        output_parameters: Vec::new(),
    })
}

pub fn compile_delete(schema: &dyn SchemaResolver, dialect: &Dialect, entity: &str) -> Result<DeleteQuery> {
    let (table, members) = members(schema, entity)?;
    let mut parameters = MemberParameters::default();
    let filter = key_filter(entity, members, &mut parameters)?;

    let statement = Statement::Delete(DeleteStatement {
        table: table.to_string(),
        filter: Some(filter),
    });
    Ok(DeleteQuery {
        sql: render(&statement, dialect),
        input_parameters: parameters.descriptors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{EntityInstance, Value};
    use crate::test_support::sample_schema;

    fn modified(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_insert_skips_generated_and_queries_identity() {
        let schema = sample_schema();
        let query = compile_insert(&schema, &Dialect::sql_server(), "Customer").unwrap();
        assert_eq!(query.sql, "INSERT INTO Customers (Name) VALUES (@Name)");
        assert_eq!(query.id_query_sql.as_deref(), Some("SELECT SCOPE_IDENTITY()"));
        assert_eq!(query.output_parameters.len(), 1);
        assert_eq!(query.output_parameters[0].member, "Id");
    }

    #[test]
    fn test_insert_with_returning() {
        let schema = sample_schema();
        let query = compile_insert(&schema, &Dialect::postgres(), "Customer").unwrap();
        assert_eq!(query.sql, "INSERT INTO Customers (Name) VALUES ($1) RETURNING Id");
        assert_eq!(query.id_query_sql, None);
    }

    #[test]
    fn test_insert_without_generated_members_needs_no_identity() {
        let schema = sample_schema();
        let query = compile_insert(&schema, &Dialect::default(), "Order").unwrap();
        assert_eq!(query.id_query_sql, None);
        assert!(query.output_parameters.is_empty());
        assert_eq!(query.input_parameters.len(), 3);
    }

    #[test]
    fn test_insert_of_only_generated_members_uses_default_values() {
        let schema = sample_schema();
        let query = compile_insert(&schema, &Dialect::default(), "AuditEntry").unwrap();
        assert_eq!(query.sql, "INSERT INTO AuditLog DEFAULT VALUES");
        assert!(query.input_parameters.is_empty());
        assert_eq!(query.id_query_sql.as_deref(), Some("SELECT @@IDENTITY"));

        let query = compile_insert(&schema, &Dialect::postgres(), "AuditEntry").unwrap();
        assert_eq!(query.sql, "INSERT INTO AuditLog DEFAULT VALUES RETURNING Id");
    }

    #[test]
    fn test_update_sets_modified_members_only() {
        let schema = sample_schema();
        let query =
            compile_update(&schema, &Dialect::default(), "Order", &modified(&["Total"])).unwrap();
        assert_eq!(query.sql, "UPDATE Orders SET Total = @Total WHERE Id = @Id");

        let order = EntityInstance::new("Order").with("Id", 9).with("Total", 12.5);
        let values: Vec<Value> = query
            .input_parameters
            .iter()
            .map(|p| p.value(&order).unwrap())
            .collect();
        assert_eq!(values, vec![Value::Float(12.5), Value::Int(9)]);
    }

    #[test]
    fn test_update_rejections() {
        let schema = sample_schema();
        let dialect = Dialect::default();
        assert!(matches!(
            compile_update(&schema, &dialect, "Order", &BTreeSet::new()),
            Err(CompileError::UnsupportedOperation(_))
        ));
        assert!(matches!(
            compile_update(&schema, &dialect, "Order", &modified(&["Id"])),
            Err(CompileError::UnsupportedOperation(_))
        ));
        assert!(matches!(
            compile_update(&schema, &dialect, "Order", &modified(&["Missing"])),
            Err(CompileError::Mapping(_))
        ));
    }

    #[test]
    fn test_delete_filters_on_key() {
        let schema = sample_schema();
        let query = compile_delete(&schema, &Dialect::postgres(), "Customer").unwrap();
        assert_eq!(query.sql, "DELETE FROM Customers WHERE Id = $1");
        assert!(matches!(
            compile_delete(&schema, &Dialect::postgres(), "Ghost"),
            Err(CompileError::Mapping(_))
        ));
    }
}
