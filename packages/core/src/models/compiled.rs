//! Compiled Schema
//!
//! The compiled form of a tenant schema: one table definition per entity and
//! relationship, with typed columns in declared order and per-field
//! validators. The tabular store validates every write against this form;
//! the CSV snapshot codec takes its column order from it.
//!
//! Relationship tables lead with the fixed bookkeeping columns
//! `source_id, target_id, edge_id, created_version, revoked_version`;
//! entity tables lead with `id`. Declared fields follow in schema order.

use crate::models::schema::{
    FieldDefinition, FieldType, RelationKind, RelationshipDefinition, SchemaDefinition,
};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bookkeeping columns prefixed to every relationship table
pub const RELATIONSHIP_SYSTEM_COLUMNS: &[&str] = &[
    "source_id",
    "target_id",
    "edge_id",
    "created_version",
    "revoked_version",
];

/// Row validation failure, reported with the offending column
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RowValidationError {
    #[error("missing required field '{field}'")]
    MissingField { field: String },

    #[error("unknown field '{field}'")]
    UnknownField { field: String },

    #[error("field '{field}' expects {expected}, got {found}")]
    TypeMismatch {
        field: String,
        expected: String,
        found: String,
    },

    #[error("field '{field}' value '{value}' is not one of the declared enum values")]
    NotInEnum { field: String, value: String },

    #[error("field '{field}' value does not match pattern '{pattern}'")]
    PatternMismatch { field: String, pattern: String },

    #[error("field '{field}' is not a valid RFC 3339 timestamp")]
    BadTimestamp { field: String },
}

/// Whether a table stores entity instances or relationship edges
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TableKind {
    Entity,
    #[serde(rename_all = "camelCase")]
    Relationship {
        source_entity: String,
        target_entity: String,
        relation_kind: RelationKind,
    },
}

/// One typed column of a compiled table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDefinition {
    /// Column name
    pub name: String,

    /// Value type
    pub column_type: FieldType,

    /// Whether a value must be present (after defaulting)
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,

    /// Default applied when the field is absent on write
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,

    /// Whether a unique index covers this column
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unique: bool,

    /// Source regex for string values
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    /// Compiled pattern; rebuilt by [`CompiledSchema::rehydrate`] after
    /// deserialization, always present when `pattern` is
    #[serde(skip)]
    pub pattern_re: Option<Regex>,

    /// Bookkeeping column managed by the core rather than declared by the
    /// schema (`id`, `edge_id`, version columns)
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub system: bool,
}

impl ColumnDefinition {
    fn system(name: &str, column_type: FieldType, required: bool) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            required,
            default: None,
            unique: false,
            pattern: None,
            pattern_re: None,
            system: true,
        }
    }

    /// Validate one value against this column's type and pattern
    pub fn validate_value(&self, value: &serde_json::Value) -> Result<(), RowValidationError> {
        let mismatch = |found: &str| RowValidationError::TypeMismatch {
            field: self.name.clone(),
            expected: self.column_type.name().to_string(),
            found: found.to_string(),
        };

        match &self.column_type {
            FieldType::String | FieldType::Reference { .. } => {
                let s = value.as_str().ok_or_else(|| mismatch(type_name(value)))?;
                if let Some(re) = &self.pattern_re {
                    if !re.is_match(s) {
                        return Err(RowValidationError::PatternMismatch {
                            field: self.name.clone(),
                            pattern: self.pattern.clone().unwrap_or_default(),
                        });
                    }
                }
                Ok(())
            }
            FieldType::Number => {
                value.as_f64().ok_or_else(|| mismatch(type_name(value)))?;
                Ok(())
            }
            FieldType::Boolean => {
                value.as_bool().ok_or_else(|| mismatch(type_name(value)))?;
                Ok(())
            }
            FieldType::Timestamp => {
                let s = value.as_str().ok_or_else(|| mismatch(type_name(value)))?;
                chrono::DateTime::parse_from_rfc3339(s).map_err(|_| {
                    RowValidationError::BadTimestamp {
                        field: self.name.clone(),
                    }
                })?;
                Ok(())
            }
            FieldType::Enum { values } => {
                let s = value.as_str().ok_or_else(|| mismatch(type_name(value)))?;
                if !values.iter().any(|v| v == s) {
                    return Err(RowValidationError::NotInEnum {
                        field: self.name.clone(),
                        value: s.to_string(),
                    });
                }
                Ok(())
            }
            FieldType::Json => Ok(()),
        }
    }
}

fn type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Compiled definition of one table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDefinition {
    /// Table name: the entity or relationship name
    pub name: String,

    /// Entity or relationship table
    #[serde(flatten)]
    pub table_kind: TableKind,

    /// Primary key column: `id` for entities, `edge_id` for relationships
    pub primary_key: String,

    /// Columns in canonical (CSV) order
    pub columns: Vec<ColumnDefinition>,
}

impl TableDefinition {
    /// Build the entity table for `name` with the declared fields
    pub fn entity(name: &str, fields: &IndexMap<String, FieldDefinition>) -> Self {
        let mut columns = vec![ColumnDefinition::system("id", FieldType::String, true)];
        columns.extend(fields.iter().map(|(field_name, field)| ColumnDefinition {
            name: field_name.clone(),
            column_type: field.field_type.clone(),
            required: field.required,
            default: field.default.clone(),
            unique: false,
            pattern: field.pattern.clone(),
            pattern_re: None,
            system: false,
        }));

        Self {
            name: name.to_string(),
            table_kind: TableKind::Entity,
            primary_key: "id".to_string(),
            columns,
        }
    }

    /// Build the relationship table for `name`
    pub fn relationship(name: &str, relationship: &RelationshipDefinition) -> Self {
        let mut columns = vec![
            ColumnDefinition::system("source_id", FieldType::String, true),
            ColumnDefinition::system("target_id", FieldType::String, true),
            ColumnDefinition::system("edge_id", FieldType::String, true),
            ColumnDefinition::system("created_version", FieldType::Number, true),
            ColumnDefinition::system("revoked_version", FieldType::Number, false),
        ];
        columns.extend(
            relationship
                .properties
                .iter()
                .map(|(field_name, field)| ColumnDefinition {
                    name: field_name.clone(),
                    column_type: field.field_type.clone(),
                    required: field.required,
                    default: field.default.clone(),
                    unique: false,
                    pattern: field.pattern.clone(),
                    pattern_re: None,
                    system: false,
                }),
        );

        Self {
            name: name.to_string(),
            table_kind: TableKind::Relationship {
                source_entity: relationship.source.clone(),
                target_entity: relationship.target.clone(),
                relation_kind: relationship.kind,
            },
            primary_key: "edge_id".to_string(),
            columns,
        }
    }

    /// Look up a column by name
    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Whether this is an entity table
    pub fn is_entity(&self) -> bool {
        self.table_kind == TableKind::Entity
    }

    /// Validate a row against this table, applying defaults
    ///
    /// Returns the normalized row. Rejects unknown fields, missing required
    /// fields (after defaulting), and any per-column type/pattern failure.
    /// `null` is treated the same as an absent value.
    pub fn normalize_row(
        &self,
        row: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<serde_json::Map<String, serde_json::Value>, RowValidationError> {
        for key in row.keys() {
            if self.column(key).is_none() {
                return Err(RowValidationError::UnknownField { field: key.clone() });
            }
        }

        let mut normalized = serde_json::Map::with_capacity(self.columns.len());
        for column in &self.columns {
            let value = match row.get(&column.name) {
                Some(serde_json::Value::Null) | None => column.default.clone(),
                Some(value) => Some(value.clone()),
            };

            match value {
                Some(value) => {
                    column.validate_value(&value)?;
                    normalized.insert(column.name.clone(), value);
                }
                None if column.required => {
                    return Err(RowValidationError::MissingField {
                        field: column.name.clone(),
                    });
                }
                None => {}
            }
        }

        Ok(normalized)
    }
}

/// A validated, compiled tenant schema
///
/// Keeps the source definition alongside the compiled tables; the source is
/// what forward-compatibility checks and the schema endpoints operate on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledSchema {
    /// Monotone schema version
    pub version: u32,

    /// The validated source this schema was compiled from
    pub source: SchemaDefinition,

    /// Table name -> compiled table, entities first, then relationships,
    /// each in declared order
    pub tables: IndexMap<String, TableDefinition>,
}

impl CompiledSchema {
    /// Compile a validated source definition
    ///
    /// Callers must have run registry validation first; compilation itself
    /// only shapes tables and attaches unique-index markers.
    pub fn compile(mut source: SchemaDefinition, version: u32) -> Result<Self, regex::Error> {
        source.version = Some(version);

        let mut tables = IndexMap::new();
        for (name, entity) in &source.entities {
            tables.insert(name.clone(), TableDefinition::entity(name, &entity.fields));
        }
        for (name, relationship) in &source.relationships {
            tables.insert(name.clone(), TableDefinition::relationship(name, relationship));
        }

        // Attach unique-index markers to entity columns
        for index in source.indexes.values() {
            if let Some(table) = tables.get_mut(&index.entity) {
                if let Some(column) = table
                    .columns
                    .iter_mut()
                    .find(|c| c.name == index.field)
                {
                    column.unique |= index.unique;
                }
            }
        }

        let mut compiled = Self {
            version,
            source,
            tables,
        };
        compiled.rehydrate()?;
        Ok(compiled)
    }

    /// Recompile column regexes after deserialization
    ///
    /// Patterns were validated at upload time, so failures here indicate a
    /// corrupted stored schema.
    pub fn rehydrate(&mut self) -> Result<(), regex::Error> {
        for table in self.tables.values_mut() {
            for column in table.columns.iter_mut() {
                if let Some(pattern) = &column.pattern {
                    column.pattern_re = Some(Regex::new(pattern)?);
                }
            }
        }
        Ok(())
    }

    /// The relationship definition behind a relation name
    pub fn relation(&self, name: &str) -> Option<&RelationshipDefinition> {
        self.source.relationships.get(name)
    }

    /// The table behind an entity or relationship name
    pub fn table(&self, name: &str) -> Option<&TableDefinition> {
        self.tables.get(name)
    }

    /// Whether `name` names a declared entity
    pub fn has_entity(&self, name: &str) -> bool {
        self.source.entities.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::schema::{default_schema, FieldDefinition};
    use serde_json::json;

    fn compiled_default() -> CompiledSchema {
        CompiledSchema::compile(default_schema(), 1).unwrap()
    }

    #[test]
    fn test_compile_builds_all_tables() {
        let schema = compiled_default();

        assert!(schema.table("user").unwrap().is_entity());
        assert!(schema.table("group").unwrap().is_entity());
        assert!(!schema.table("member_of").unwrap().is_entity());
        assert!(schema.table("nonexistent").is_none());
    }

    #[test]
    fn test_entity_table_leads_with_id() {
        let schema = compiled_default();
        let user = schema.table("user").unwrap();

        assert_eq!(user.primary_key, "id");
        assert_eq!(user.columns[0].name, "id");
        assert!(user.columns[0].system);
        assert_eq!(user.columns[1].name, "name");
    }

    #[test]
    fn test_relationship_table_system_columns() {
        let schema = compiled_default();
        let has_permission = schema.table("has_permission").unwrap();

        let names: Vec<&str> = has_permission
            .columns
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(
            &names[..5],
            RELATIONSHIP_SYSTEM_COLUMNS,
            "system columns must prefix declared properties"
        );
        assert_eq!(names[5], "capability");
        assert_eq!(has_permission.primary_key, "edge_id");
    }

    #[test]
    fn test_normalize_row_applies_defaults_and_rejects_unknown() {
        let mut source = default_schema();
        let user = source.entities.get_mut("user").unwrap();
        let mut status = FieldDefinition::of(crate::models::schema::FieldType::Enum {
            values: vec!["active".to_string(), "suspended".to_string()],
        });
        status.default = Some(json!("active"));
        user.fields.insert("status".to_string(), status);

        let schema = CompiledSchema::compile(source, 1).unwrap();
        let table = schema.table("user").unwrap();

        let row = json!({ "id": "user:alice", "name": "Alice" });
        let normalized = table.normalize_row(row.as_object().unwrap()).unwrap();
        assert_eq!(normalized["status"], "active");

        let row = json!({ "id": "user:bob", "nickname": "b" });
        let err = table.normalize_row(row.as_object().unwrap()).unwrap_err();
        assert_eq!(
            err,
            RowValidationError::UnknownField {
                field: "nickname".to_string()
            }
        );
    }

    #[test]
    fn test_normalize_row_missing_required() {
        let schema = compiled_default();
        let table = schema.table("user").unwrap();

        let row = json!({ "name": "no id" });
        let err = table.normalize_row(row.as_object().unwrap()).unwrap_err();
        assert_eq!(
            err,
            RowValidationError::MissingField {
                field: "id".to_string()
            }
        );
    }

    #[test]
    fn test_validate_value_types() {
        let column = ColumnDefinition {
            name: "count".to_string(),
            column_type: crate::models::schema::FieldType::Number,
            required: false,
            default: None,
            unique: false,
            pattern: None,
            pattern_re: None,
            system: false,
        };

        assert!(column.validate_value(&json!(3.5)).is_ok());
        assert!(column.validate_value(&json!("3.5")).is_err());
    }

    #[test]
    fn test_validate_timestamp_and_enum() {
        let ts = ColumnDefinition {
            name: "at".to_string(),
            column_type: crate::models::schema::FieldType::Timestamp,
            required: false,
            default: None,
            unique: false,
            pattern: None,
            pattern_re: None,
            system: false,
        };
        assert!(ts.validate_value(&json!("2026-07-01T12:00:00Z")).is_ok());
        assert!(ts.validate_value(&json!("yesterday")).is_err());

        let level = ColumnDefinition {
            name: "level".to_string(),
            column_type: crate::models::schema::FieldType::Enum {
                values: vec!["low".to_string(), "high".to_string()],
            },
            required: false,
            default: None,
            unique: false,
            pattern: None,
            pattern_re: None,
            system: false,
        };
        assert!(level.validate_value(&json!("low")).is_ok());
        assert!(matches!(
            level.validate_value(&json!("medium")),
            Err(RowValidationError::NotInEnum { .. })
        ));
    }

    #[test]
    fn test_pattern_validation_after_rehydrate() {
        let mut source = default_schema();
        let user = source.entities.get_mut("user").unwrap();
        let mut email = FieldDefinition::of(crate::models::schema::FieldType::String);
        email.pattern = Some("^[^@]+@[^@]+$".to_string());
        user.fields.insert("email".to_string(), email);

        let schema = CompiledSchema::compile(source, 1).unwrap();
        let table = schema.table("user").unwrap();

        let good = json!({ "id": "user:a", "email": "a@example.com" });
        assert!(table.normalize_row(good.as_object().unwrap()).is_ok());

        let bad = json!({ "id": "user:a", "email": "not-an-email" });
        assert!(matches!(
            table.normalize_row(bad.as_object().unwrap()),
            Err(RowValidationError::PatternMismatch { .. })
        ));
    }

    #[test]
    fn test_compiled_schema_serde_round_trip_rehydrates() {
        let mut source = default_schema();
        let user = source.entities.get_mut("user").unwrap();
        let mut email = FieldDefinition::of(crate::models::schema::FieldType::String);
        email.pattern = Some("^[^@]+@[^@]+$".to_string());
        user.fields.insert("email".to_string(), email);

        let schema = CompiledSchema::compile(source, 3).unwrap();
        let bytes = serde_json::to_vec(&schema).unwrap();
        let mut back: CompiledSchema = serde_json::from_slice(&bytes).unwrap();

        // Compiled regexes are not serialized
        let email_col = back.table("user").unwrap().column("email").unwrap();
        assert!(email_col.pattern_re.is_none());

        back.rehydrate().unwrap();
        let email_col = back.table("user").unwrap().column("email").unwrap();
        assert!(email_col.pattern_re.is_some());
        assert_eq!(back.version, 3);
    }
}
