//! Tenant Schema Types
//!
//! This module contains the source form of a tenant's schema: the entity,
//! relationship, and index definitions an operator uploads. The Schema
//! Registry validates and compiles this form into [`crate::models::compiled`]
//! table definitions before anything is allowed to touch tenant data.
//!
//! ## Example Schema Source
//!
//! ```json
//! {
//!   "entities": {
//!     "user":     { "fields": { "email": { "type": "string" } } },
//!     "group":    { "fields": { "name":  { "type": "string", "required": true } } },
//!     "resource": { "fields": { "kind":  { "type": "enum", "values": ["doc", "folder"] } } }
//!   },
//!   "relationships": {
//!     "member_of":      { "source": "user",  "target": "group", "kind": "member_of" },
//!     "has_permission": {
//!       "source": "user", "target": "resource", "kind": "permission",
//!       "properties": { "capability": { "type": "string", "required": true } }
//!     }
//!   },
//!   "indexes": {
//!     "user_email": { "entity": "user", "field": "email", "unique": true }
//!   }
//! }
//! ```
//!
//! ## Authorization Classification
//!
//! Every relationship carries a [`RelationKind`]. The graph traversal in
//! queries and proof validation only ever distinguishes this closed
//! classification, regardless of how many relationship names a schema
//! declares. `Contains` participates in traversal only when the definition
//! opts in with `propagates: true`.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Identifiers reserved for internal bookkeeping columns and key prefixes
pub const RESERVED_NAMES: &[&str] = &[
    "id",
    "edge_id",
    "source_id",
    "target_id",
    "created_version",
    "revoked_version",
    "schema",
    "tenant",
    "mutations",
];

/// A tenant schema in its uploaded source form
///
/// The registry assigns `version` when the schema is persisted; uploaded
/// sources leave it unset.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDefinition {
    /// Monotone schema version, assigned by the registry on upload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,

    /// Entity name -> entity definition
    #[serde(default)]
    pub entities: IndexMap<String, EntityDefinition>,

    /// Relationship name -> relationship definition
    #[serde(default)]
    pub relationships: IndexMap<String, RelationshipDefinition>,

    /// Index name -> index definition
    #[serde(default)]
    pub indexes: IndexMap<String, IndexDefinition>,
}

/// Definition of a single entity type
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EntityDefinition {
    /// Field name -> field definition, in declared (column) order
    #[serde(default)]
    pub fields: IndexMap<String, FieldDefinition>,

    /// Human-readable description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Definition of a single typed field
///
/// The type tag is flattened into the field object, so the wire form reads
/// `{ "type": "enum", "values": [...], "required": true }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDefinition {
    /// Field type drawn from the closed set
    #[serde(flatten)]
    pub field_type: FieldType,

    /// Whether a value must be present on every row
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,

    /// Default applied when the field is absent on write
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,

    /// Regex the (string) value must match
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    /// Human-readable description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FieldDefinition {
    /// Shorthand for a plain optional field of the given type
    pub fn of(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: false,
            default: None,
            pattern: None,
            description: None,
        }
    }

    /// Shorthand for a required field of the given type
    pub fn required(field_type: FieldType) -> Self {
        Self {
            required: true,
            ..Self::of(field_type)
        }
    }
}

/// The closed set of field types
///
/// Anything outside this set is rejected at schema validation time, so the
/// tabular store and the CSV codec only ever deal with these shapes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FieldType {
    /// UTF-8 string
    String,
    /// 64-bit float
    Number,
    /// Boolean
    Boolean,
    /// RFC 3339 timestamp
    Timestamp,
    /// One of a declared set of string values
    Enum { values: Vec<String> },
    /// Foreign key into another entity table of the same schema
    Reference { entity: String },
    /// Arbitrary JSON value
    Json,
}

impl FieldType {
    /// Short name used in validation error messages
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Timestamp => "timestamp",
            FieldType::Enum { .. } => "enum",
            FieldType::Reference { .. } => "reference",
            FieldType::Json => "json",
        }
    }
}

/// Authorization-relevant classification of a relationship
///
/// Traversal for `can` / `accessible` / `accessors` follows `MemberOf`,
/// `InheritsFrom`, and opted-in `Contains` edges; a path terminates on a
/// `Permission` edge. `Plain` relationships are stored and synced but never
/// traversed for authorization.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    /// Subject belongs to a group (user -> group)
    MemberOf,
    /// Group inherits from another group (group -> group)
    InheritsFrom,
    /// Resource containment; traversed only when `propagates` is set
    Contains,
    /// Permission-bearing edge; carries a `capability` property
    Permission,
    /// Data-only relationship, invisible to authorization
    Plain,
}

impl Default for RelationKind {
    fn default() -> Self {
        RelationKind::Plain
    }
}

/// Definition of a relationship between two entity types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipDefinition {
    /// Source entity name
    pub source: String,

    /// Target entity name
    pub target: String,

    /// Authorization classification (defaults to `plain`)
    #[serde(default)]
    pub kind: RelationKind,

    /// For `contains` relationships: whether permissions propagate along
    /// this edge in the same direction as group membership
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub propagates: bool,

    /// Whether deleting a referenced entity revokes edges of this
    /// relationship instead of rejecting the delete
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cascade_on_delete: bool,

    /// Properties stored on each edge, in declared (column) order
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub properties: IndexMap<String, FieldDefinition>,

    /// Human-readable description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl RelationshipDefinition {
    /// Whether edges of this relationship may appear inside the traversal
    /// prefix of an authorization path
    pub fn is_traversable(&self) -> bool {
        match self.kind {
            RelationKind::MemberOf | RelationKind::InheritsFrom => true,
            RelationKind::Contains => self.propagates,
            RelationKind::Permission | RelationKind::Plain => false,
        }
    }

    /// Whether edges of this relationship may terminate an authorization path
    pub fn is_permission(&self) -> bool {
        self.kind == RelationKind::Permission
    }
}

/// Definition of a secondary index on an entity field
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDefinition {
    /// Entity the index applies to
    pub entity: String,

    /// Declared field to index
    pub field: String,

    /// Whether values must be unique across rows
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unique: bool,
}

/// The schema installed for tenants that have never uploaded one
///
/// Ships the Zanzibar-style trio of entity types and the standard
/// authorization relationships. `contains` is declared but does not
/// propagate permissions until an operator opts in.
pub fn default_schema() -> SchemaDefinition {
    let mut entities = IndexMap::new();
    entities.insert(
        "user".to_string(),
        EntityDefinition {
            fields: IndexMap::from([("name".to_string(), FieldDefinition::of(FieldType::String))]),
            description: Some("An end-user subject".to_string()),
        },
    );
    entities.insert(
        "group".to_string(),
        EntityDefinition {
            fields: IndexMap::from([("name".to_string(), FieldDefinition::of(FieldType::String))]),
            description: Some("A group of subjects".to_string()),
        },
    );
    entities.insert(
        "resource".to_string(),
        EntityDefinition {
            fields: IndexMap::from([("name".to_string(), FieldDefinition::of(FieldType::String))]),
            description: Some("A protected object".to_string()),
        },
    );

    let capability_property = (
        "capability".to_string(),
        FieldDefinition::required(FieldType::String),
    );

    let mut relationships = IndexMap::new();
    relationships.insert(
        "member_of".to_string(),
        RelationshipDefinition {
            source: "user".to_string(),
            target: "group".to_string(),
            kind: RelationKind::MemberOf,
            propagates: false,
            cascade_on_delete: false,
            properties: IndexMap::new(),
            description: Some("Subject belongs to a group".to_string()),
        },
    );
    relationships.insert(
        "inherits_from".to_string(),
        RelationshipDefinition {
            source: "group".to_string(),
            target: "group".to_string(),
            kind: RelationKind::InheritsFrom,
            propagates: false,
            cascade_on_delete: false,
            properties: IndexMap::new(),
            description: Some("Group inherits membership of another group".to_string()),
        },
    );
    relationships.insert(
        "contains".to_string(),
        RelationshipDefinition {
            source: "resource".to_string(),
            target: "resource".to_string(),
            kind: RelationKind::Contains,
            propagates: false,
            cascade_on_delete: false,
            properties: IndexMap::new(),
            description: Some("Resource containment hierarchy".to_string()),
        },
    );
    relationships.insert(
        "has_permission".to_string(),
        RelationshipDefinition {
            source: "user".to_string(),
            target: "resource".to_string(),
            kind: RelationKind::Permission,
            propagates: false,
            cascade_on_delete: true,
            properties: IndexMap::from([capability_property.clone()]),
            description: Some("Direct permission grant".to_string()),
        },
    );
    relationships.insert(
        "group_permission".to_string(),
        RelationshipDefinition {
            source: "group".to_string(),
            target: "resource".to_string(),
            kind: RelationKind::Permission,
            propagates: false,
            cascade_on_delete: true,
            properties: IndexMap::from([capability_property]),
            description: Some("Permission granted to every member of a group".to_string()),
        },
    );

    SchemaDefinition {
        version: None,
        entities,
        relationships,
        indexes: IndexMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_type_tagged_serialization() {
        let field = FieldDefinition::required(FieldType::Enum {
            values: vec!["doc".to_string(), "folder".to_string()],
        });

        let json = serde_json::to_value(&field).unwrap();
        assert_eq!(json["type"], "enum");
        assert_eq!(json["values"][1], "folder");
        assert_eq!(json["required"], true);
    }

    #[test]
    fn test_field_definition_deserialization() {
        let json = json!({
            "type": "reference",
            "entity": "user",
            "required": true
        });

        let field: FieldDefinition = serde_json::from_value(json).unwrap();
        assert_eq!(
            field.field_type,
            FieldType::Reference {
                entity: "user".to_string()
            }
        );
        assert!(field.required);
        assert!(field.default.is_none());
    }

    #[test]
    fn test_relation_kind_defaults_to_plain() {
        let json = json!({ "source": "invoice", "target": "customer" });

        let relationship: RelationshipDefinition = serde_json::from_value(json).unwrap();
        assert_eq!(relationship.kind, RelationKind::Plain);
        assert!(!relationship.is_traversable());
        assert!(!relationship.is_permission());
    }

    #[test]
    fn test_contains_traversable_only_when_propagating() {
        let mut relationship = RelationshipDefinition {
            source: "resource".to_string(),
            target: "resource".to_string(),
            kind: RelationKind::Contains,
            propagates: false,
            cascade_on_delete: false,
            properties: IndexMap::new(),
            description: None,
        };
        assert!(!relationship.is_traversable());

        relationship.propagates = true;
        assert!(relationship.is_traversable());
    }

    #[test]
    fn test_default_schema_shape() {
        let schema = default_schema();

        assert_eq!(schema.entities.len(), 3);
        assert!(schema.entities.contains_key("user"));
        assert!(schema.entities.contains_key("group"));
        assert!(schema.entities.contains_key("resource"));

        let member_of = &schema.relationships["member_of"];
        assert_eq!(member_of.kind, RelationKind::MemberOf);
        assert!(member_of.is_traversable());

        let has_permission = &schema.relationships["has_permission"];
        assert!(has_permission.is_permission());
        assert!(has_permission.properties["capability"].required);

        // Containment ships opted out of permission propagation
        assert!(!schema.relationships["contains"].is_traversable());
    }

    #[test]
    fn test_schema_definition_round_trip() {
        let schema = default_schema();
        let json = serde_json::to_value(&schema).unwrap();
        let back: SchemaDefinition = serde_json::from_value(json).unwrap();

        assert_eq!(back.entities.len(), schema.entities.len());
        assert_eq!(back.relationships.len(), schema.relationships.len());
        // IndexMap preserves declared order through serde
        assert_eq!(
            back.relationships.keys().collect::<Vec<_>>(),
            schema.relationships.keys().collect::<Vec<_>>()
        );
    }
}
