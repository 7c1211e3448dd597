//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Once};

use chainql::ast::{BinaryOperator, ExpressionNode, Method, QueryOperator};
use chainql::{CompilerConfig, Dialect, QueryBuilder, SchemaSnapshot};

pub const SCHEMA: &str = r#"
[[entity]]
type = "Customer"
table = "Customers"

[[entity.member]]
name = "Id"
type = "int"
primary_key = true
generated = true

[[entity.member]]
name = "Name"
type = "text"

[[entity.association]]
name = "Orders"
other = "Order"
this_keys = ["Id"]
other_keys = ["CustomerId"]
many = true

[[entity]]
type = "Order"
table = "Orders"

[[entity.member]]
name = "Id"
type = "int"
primary_key = true

[[entity.member]]
name = "CustomerId"
type = "int"
nullable = true

[[entity.member]]
name = "Total"
type = "float"

[[entity.association]]
name = "Customer"
other = "Customer"
this_keys = ["CustomerId"]
other_keys = ["Id"]
eager = true

[[entity]]
type = "Employee"
table = "Employees"

[[entity.member]]
name = "Id"
type = "int"
primary_key = true

[[entity.member]]
name = "Name"
type = "text"

[[entity.member]]
name = "ManagerId"
type = "int"
nullable = true

[[entity.association]]
name = "Manager"
other = "Employee"
this_keys = ["ManagerId"]
other_keys = ["Id"]

[[entity]]
type = "Shipment"
table = "Shipments"

[[entity.member]]
name = "Id"
type = "int"
primary_key = true

[[entity.member]]
name = "PlacedAt"
type = "datetime"

[[entity.member]]
name = "ShippedAt"
type = "datetime"
nullable = true

[[entity]]
type = "AuditEntry"
table = "AuditLog"

[[entity.member]]
name = "Id"
type = "int"
primary_key = true
generated = true

[[function]]
owner = "Math"
name = "Greatest"
sql_name = "GREATEST"
result = "int"

[[function.parameters]]
name = "values"
type = { array = "int" }
variadic = true
"#;

static TRACING: Once = Once::new();

/// Route `tracing` output through the test harness.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

pub fn schema() -> SchemaSnapshot {
    SchemaSnapshot::from_toml_str(SCHEMA).expect("fixture schema is valid")
}

pub fn builder() -> QueryBuilder {
    init_tracing();
    QueryBuilder::new(Arc::new(schema()), CompilerConfig::default())
}

pub fn postgres_builder() -> QueryBuilder {
    init_tracing();
    QueryBuilder::new(Arc::new(schema()), CompilerConfig::with_dialect(Dialect::postgres()))
}

pub fn sql_server_builder() -> QueryBuilder {
    init_tracing();
    QueryBuilder::new(Arc::new(schema()), CompilerConfig::with_dialect(Dialect::sql_server()))
}

// -- node shorthands --------------------------------------------------------

pub fn path(param: &str, members: &[&str]) -> ExpressionNode {
    ExpressionNode::path(param, members)
}

pub fn lambda(param: &str, body: ExpressionNode) -> ExpressionNode {
    ExpressionNode::lambda(&[param], body)
}

pub fn eq(left: ExpressionNode, right: ExpressionNode) -> ExpressionNode {
    ExpressionNode::equal(left, right)
}

pub fn gt(left: ExpressionNode, right: ExpressionNode) -> ExpressionNode {
    ExpressionNode::binary(BinaryOperator::GreaterThan, left, right)
}

/// `receiver.op(args)` for a nested query operator.
pub fn nested(receiver: ExpressionNode, op: QueryOperator, args: Vec<ExpressionNode>) -> ExpressionNode {
    ExpressionNode::method(receiver, Method::Query(op), args)
}
