//! Shared fixtures for unit tests.

use crate::ast::ValueType;
use crate::schema::{
    AssociationMapping, EntityMapping, FunctionMapping, FunctionParameter, MemberMapping,
    SchemaSnapshot,
};

fn association(name: &str, other: &str, this_key: &str, other_key: &str) -> AssociationMapping {
    AssociationMapping {
        name: name.to_string(),
        other: other.to_string(),
        this_keys: vec![this_key.to_string()],
        other_keys: vec![other_key.to_string()],
        many: false,
        eager: false,
        join_id: None,
    }
}

fn function(owner: &str, name: &str, sql_name: &str, parameters: Vec<FunctionParameter>, result: ValueType) -> FunctionMapping {
    FunctionMapping {
        owner: owner.to_string(),
        name: name.to_string(),
        sql_name: sql_name.to_string(),
        parameters,
        result,
    }
}

fn parameter(name: &str, value_type: ValueType, variadic: bool) -> FunctionParameter {
    FunctionParameter {
        name: name.to_string(),
        value_type,
        variadic,
    }
}

fn int_array() -> ValueType {
    ValueType::Array(Box::new(ValueType::Int))
}

/// Customers with orders, a self-managed employee table, a category
/// tree whose parent link is eager, dated shipments and an audit table
/// whose only column is generated.
pub fn sample_schema() -> SchemaSnapshot {
    let customer = EntityMapping::new("Customer", "Customers")
        .with_member(MemberMapping::new("Id", ValueType::Int).key().generated())
        .with_member(MemberMapping::new("Name", ValueType::Text))
        .with_association(AssociationMapping {
            many: true,
            ..association("Orders", "Order", "Id", "CustomerId")
        });

    let order = EntityMapping::new("Order", "Orders")
        .with_member(MemberMapping::new("Id", ValueType::Int).key())
        .with_member(MemberMapping::new("CustomerId", ValueType::Int).nullable())
        .with_member(MemberMapping::new("Total", ValueType::Float))
        .with_association(AssociationMapping {
            eager: true,
            ..association("Customer", "Customer", "CustomerId", "Id")
        });

    let employee = EntityMapping::new("Employee", "Employees")
        .with_member(MemberMapping::new("Id", ValueType::Int).key())
        .with_member(MemberMapping::new("Name", ValueType::Text))
        .with_member(MemberMapping::new("ManagerId", ValueType::Int).nullable())
        .with_association(association("Manager", "Employee", "ManagerId", "Id"));

    let category = EntityMapping::new("Category", "Categories")
        .with_member(MemberMapping::new("Id", ValueType::Int).key())
        .with_member(MemberMapping::new("ParentId", ValueType::Int).nullable())
        .with_association(AssociationMapping {
            eager: true,
            ..association("Parent", "Category", "ParentId", "Id")
        });

    let shipment = EntityMapping::new("Shipment", "Shipments")
        .with_member(MemberMapping::new("Id", ValueType::Int).key())
        .with_member(MemberMapping::new("PlacedAt", ValueType::DateTime))
        .with_member(MemberMapping::new("ShippedAt", ValueType::DateTime).nullable());

    let audit = EntityMapping::new("AuditEntry", "AuditLog")
        .with_member(MemberMapping::new("Id", ValueType::Int).key().generated());

    let functions = vec![
        function("Customer", "Rank", "customer_rank", Vec::new(), ValueType::Int),
        function(
            "Text",
            "Soundex",
            "SOUNDEX",
            vec![parameter("value", ValueType::Text, false)],
            ValueType::Text,
        ),
        function(
            "Math",
            "Greatest",
            "GREATEST",
            vec![parameter("values", int_array(), true)],
            ValueType::Int,
        ),
        function(
            "Math",
            "Total",
            "array_total",
            vec![parameter("values", int_array(), false)],
            ValueType::Int,
        ),
    ];

    match SchemaSnapshot::new(vec![customer, order, employee, category, shipment, audit], functions) {
        Ok(schema) => schema,
        Err(e) => panic!("sample schema is invalid: {:#}", e),
    }
}
