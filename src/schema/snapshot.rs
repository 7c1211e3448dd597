use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use super::{
    Association, Cardinality, EntityMapping, FunctionKey, FunctionMapping, MemberMapping,
    SchemaResolver,
};
use crate::ast::{JoinKind, TableBinding, TableSource};

/// On-disk form of a schema, as TOML or JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDocument {
    #[serde(rename = "entity", default)]
    pub entities: Vec<EntityMapping>,
    #[serde(rename = "function", default)]
    pub functions: Vec<FunctionMapping>,
}

/// Immutable, validated schema with lookup indexes.
#[derive(Debug, Clone)]
pub struct SchemaSnapshot {
    entities: Vec<EntityMapping>,
    functions: Vec<FunctionMapping>,
    entity_index: HashMap<String, usize>,
    function_index: HashMap<FunctionKey, usize>,
}

impl SchemaSnapshot {
    pub fn new(entities: Vec<EntityMapping>, functions: Vec<FunctionMapping>) -> Result<Self> {
        let mut entity_index = HashMap::new();
        for (i, entity) in entities.iter().enumerate() {
            if entity_index.insert(entity.type_name.clone(), i).is_some() {
                bail!("Entity '{}' is declared more than once", entity.type_name);
            }
        }

        let mut function_index = HashMap::new();
        for (i, function) in functions.iter().enumerate() {
            if function_index.insert(function.key(), i).is_some() {
                bail!(
                    "Function '{}.{}' is declared more than once",
                    function.owner,
                    function.name
                );
            }
        }

        let snapshot = Self {
            entities,
            functions,
            entity_index,
            function_index,
        };
        snapshot.validate()?;
        Ok(snapshot)
    }

    pub fn from_document(document: SchemaDocument) -> Result<Self> {
        Self::new(document.entities, document.functions)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let document: SchemaDocument =
            toml::from_str(content).context("Failed to parse schema TOML")?;
        Self::from_document(document)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let document: SchemaDocument =
            serde_json::from_str(content).context("Failed to parse schema JSON")?;
        Self::from_document(document)
    }

    /// Load by extension: `.json` as JSON, anything else as TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read schema file: {}", path.display()))?;
        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let snapshot = if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_toml_str(&content)
        };
        snapshot.with_context(|| format!("Invalid schema: {}", path.display()))
    }

    pub fn entities(&self) -> &[EntityMapping] {
        &self.entities
    }

    pub fn entity(&self, type_name: &str) -> Option<&EntityMapping> {
        self.entity_index.get(type_name).map(|&i| &self.entities[i])
    }

    fn validate(&self) -> Result<()> {
        for entity in &self.entities {
            let mut seen = HashSet::new();
            for member in &entity.members {
                if !seen.insert(member.name.as_str()) {
                    bail!(
                        "Member '{}.{}' is declared more than once",
                        entity.type_name,
                        member.name
                    );
                }
            }

            for assoc in &entity.associations {
                let context = format!("{}.{}", entity.type_name, assoc.name);
                if entity.member(&assoc.name).is_some() {
                    bail!("Association '{}' shadows a member", context);
                }
                let other = match self.entity(&assoc.other) {
                    Some(other) => other,
                    None => bail!(
                        "Association '{}' targets unknown entity '{}'",
                        context,
                        assoc.other
                    ),
                };
                if assoc.this_keys.is_empty() || assoc.this_keys.len() != assoc.other_keys.len() {
                    bail!(
                        "Association '{}' needs non-empty key lists of equal length",
                        context
                    );
                }
                for key in &assoc.this_keys {
                    if entity.member(key).is_none() {
                        bail!("Association '{}' uses unknown key '{}'", context, key);
                    }
                }
                for key in &assoc.other_keys {
                    if other.member(key).is_none() {
                        bail!(
                            "Association '{}' uses unknown key '{}.{}'",
                            context,
                            other.type_name,
                            key
                        );
                    }
                }
                if assoc.eager && assoc.many {
                    bail!("Association '{}' is eager but to-many", context);
                }
            }
        }
        Ok(())
    }

    fn resolve_association(&self, entity: &EntityMapping, name: &str) -> Option<Association> {
        let mapping = entity.associations.iter().find(|a| a.name == name)?;
        let (cardinality, join_kind) = if mapping.many {
            (Cardinality::Many, JoinKind::Inner)
        } else {
            let optional = mapping
                .this_keys
                .iter()
                .any(|k| entity.member(k).map(|m| m.nullable).unwrap_or(false));
            let kind = if optional {
                JoinKind::LeftOuter
            } else {
                JoinKind::Inner
            };
            (Cardinality::One, kind)
        };
        Some(Association {
            member: mapping.name.clone(),
            other_type: mapping.other.clone(),
            this_keys: mapping.this_keys.clone(),
            other_keys: mapping.other_keys.clone(),
            join_kind,
            join_id: mapping
                .join_id
                .clone()
                .unwrap_or_else(|| format!("{}.{}", entity.type_name, mapping.name)),
            cardinality,
            eager: mapping.eager,
        })
    }
}

impl SchemaResolver for SchemaSnapshot {
    fn table_name_for(&self, entity: &str) -> Option<&str> {
        self.entity(entity).map(|e| e.table.as_str())
    }

    fn column_name_for<'a>(&'a self, table: &'a TableBinding, member: &str) -> Option<&'a str> {
        match &table.source {
            TableSource::Entity { entity, .. } => self
                .member_for(entity, member)
                .map(MemberMapping::column_name),
            TableSource::Derived { columns, .. } => columns
                .iter()
                .find(|c| c.alias == member)
                .map(|c| c.alias.as_str()),
        }
    }

    fn primary_keys_for(&self, entity: &str) -> Vec<&str> {
        self.entity(entity)
            .map(|e| {
                e.members
                    .iter()
                    .filter(|m| m.primary_key)
                    .map(|m| m.name.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn association_for(&self, entity: &str, member: &str) -> Option<Association> {
        let mapping = self.entity(entity)?;
        self.resolve_association(mapping, member)
    }

    fn associations_of(&self, entity: &str) -> Vec<Association> {
        match self.entity(entity) {
            Some(mapping) => mapping
                .associations
                .iter()
                .filter_map(|a| self.resolve_association(mapping, &a.name))
                .collect(),
            None => Vec::new(),
        }
    }

    fn member_for(&self, entity: &str, member: &str) -> Option<&MemberMapping> {
        self.entity(entity)?.member(member)
    }

    fn members_of(&self, entity: &str) -> Option<&[MemberMapping]> {
        self.entity(entity).map(|e| e.members.as_slice())
    }

    fn function_for(&self, key: &FunctionKey) -> Option<&FunctionMapping> {
        self.function_index.get(key).map(|&i| &self.functions[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{ScopeId, TableId, ValueType};
    use crate::schema::AssociationMapping;

    const SCHEMA: &str = r#"
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
        column = "cust_name"
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

        [[entity.association]]
        name = "Customer"
        other = "Customer"
        this_keys = ["CustomerId"]
        other_keys = ["Id"]

        [[function]]
        owner = "Customer"
        name = "Rank"
        sql_name = "customer_rank"
        result = "int"
    "#;

    #[test]
    fn test_load_toml() {
        let schema = SchemaSnapshot::from_toml_str(SCHEMA).unwrap();
        assert_eq!(schema.table_name_for("Customer"), Some("Customers"));
        assert_eq!(schema.primary_keys_for("Customer"), vec!["Id"]);
        assert_eq!(
            schema.member_for("Customer", "Name").map(|m| m.column_name()),
            Some("cust_name")
        );
        assert_eq!(schema.table_name_for("Ghost"), None);
        assert!(schema
            .function_for(&FunctionKey::new("Customer", "Rank"))
            .is_some());
    }

    #[test]
    fn test_association_join_kinds() {
        let schema = SchemaSnapshot::from_toml_str(SCHEMA).unwrap();
        let orders = schema.association_for("Customer", "Orders").unwrap();
        assert_eq!(orders.cardinality, Cardinality::Many);
        assert_eq!(orders.join_id, "Customer.Orders");
        // Nullable foreign key makes the reference optional.
        let customer = schema.association_for("Order", "Customer").unwrap();
        assert_eq!(customer.join_kind, JoinKind::LeftOuter);
        assert!(schema.association_for("Order", "Id").is_none());
    }

    #[test]
    fn test_column_name_for_derived_table() {
        let schema = SchemaSnapshot::from_toml_str(SCHEMA).unwrap();
        let binding = TableBinding {
            id: TableId(1),
            source: TableSource::Derived {
                scope: ScopeId(0),
                columns: vec![crate::ast::DerivedColumn {
                    alias: "Total".to_string(),
                    value_type: ValueType::Float,
                    nullable: false,
                }],
                shape: crate::compiler::materializer::Shape::Column {
                    ordinal: 0,
                    value_type: ValueType::Float,
                    nullable: false,
                },
            },
            alias: "t1".to_string(),
            scope: ScopeId(1),
            join_kind: JoinKind::None,
            join_predicate: None,
        };
        assert_eq!(schema.column_name_for(&binding, "Total"), Some("Total"));
        assert_eq!(schema.column_name_for(&binding, "Other"), None);
    }

    #[test]
    fn test_rejects_unknown_association_target() {
        let entity = EntityMapping::new("Customer", "Customers")
            .with_member(MemberMapping::new("Id", ValueType::Int).key())
            .with_association(AssociationMapping {
                name: "Region".to_string(),
                other: "Region".to_string(),
                this_keys: vec!["Id".to_string()],
                other_keys: vec!["Id".to_string()],
                many: false,
                eager: false,
                join_id: None,
            });
        let err = SchemaSnapshot::new(vec![entity], Vec::new()).unwrap_err();
        assert!(err.to_string().contains("unknown entity 'Region'"));
    }

    #[test]
    fn test_rejects_duplicate_entities() {
        let a = EntityMapping::new("Customer", "Customers");
        let b = EntityMapping::new("Customer", "Clients");
        assert!(SchemaSnapshot::new(vec![a, b], Vec::new()).is_err());
    }

    #[test]
    fn test_load_json() {
        let json = r#"{
            "entity": [
                { "type": "Tag", "table": "Tags",
                  "member": [ { "name": "Id", "type": "int", "primary_key": true } ] }
            ]
        }"#;
        let schema = SchemaSnapshot::from_json_str(json).unwrap();
        assert_eq!(schema.members_of("Tag").map(|m| m.len()), Some(1));
    }
}
