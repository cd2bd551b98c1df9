//! Schema Registry
//!
//! Owns a tenant's schema versions and gates every mutation through the
//! active compiled form. Uploads are validated syntactically and
//! semantically, compiled, and stored as a new numbered version without
//! activating; activation (and rollback, which is activation of an earlier
//! version) only succeeds when the candidate schema is forward-compatible
//! with the data and the retained mutation log.
//!
//! ## Validation rules, in order
//!
//! 1. Identifiers are non-empty, well-formed, and off the reserved list
//! 2. Field types come from the closed set (enforced at parse time; enum
//!    value lists must be non-empty)
//! 3. Every `reference` target entity is defined in the same schema
//! 4. Every relationship's endpoints are defined entities
//! 5. Every unique index names a declared field of a declared entity
//! 6. Pattern regexes compile
//! 7. The `reference` dependency graph has no cycle that would prevent
//!    topological instantiation (self-references are allowed, with a warning)
//!
//! Errors carry a JSON-pointer-style path; when an unknown name is close to
//! a defined one, a "did you mean" suggestion is attached.

use crate::models::compiled::CompiledSchema;
use crate::models::mutation::{MutationEntry, MutationPayload};
use crate::models::schema::{
    default_schema, FieldType, RelationKind, SchemaDefinition, RESERVED_NAMES,
};
use crate::services::error::{SchemaIssue, ServiceError};
use crate::services::tabular_store::TabularStore;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Per-tenant schema version store and compiler
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    /// Version -> validated source, including the active one
    versions: BTreeMap<u32, SchemaDefinition>,

    /// The active compiled schema
    active: Option<CompiledSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The active compiled schema
    pub fn active(&self) -> Result<&CompiledSchema, ServiceError> {
        self.active.as_ref().ok_or(ServiceError::SchemaMissing)
    }

    /// The active schema version, if any
    pub fn active_version(&self) -> Option<u32> {
        self.active.as_ref().map(|s| s.version)
    }

    /// All stored versions, oldest first
    pub fn stored_versions(&self) -> Vec<u32> {
        self.versions.keys().copied().collect()
    }

    /// Install the default schema as version 1 and activate it
    ///
    /// Used on first touch of a tenant with no stored schema; not a
    /// mutation, so it consumes no ledger version.
    pub fn install_default(&mut self) -> Result<&CompiledSchema, ServiceError> {
        let source = default_schema();
        let compiled = CompiledSchema::compile(source.clone(), 1)
            .map_err(|e| ServiceError::Serialization(e.to_string()))?;
        self.versions.insert(1, compiled.source.clone());
        self.active = Some(compiled);
        info!("default schema installed as v1");
        self.active()
    }

    /// Adopt a compiled schema recovered from a snapshot
    pub fn restore(&mut self, compiled: CompiledSchema) {
        self.versions
            .insert(compiled.version, compiled.source.clone());
        self.active = Some(compiled);
    }

    /// Re-register a stored version during recovery, without validating or
    /// activating (it was validated when first uploaded)
    pub fn restore_version(&mut self, version: u32, source: SchemaDefinition) {
        self.versions.insert(version, source);
    }

    /// Activate a version while replaying a logged `schema_change`
    ///
    /// The forward-compatibility check already passed when the entry
    /// committed, so replay only recompiles.
    pub fn activate_for_replay(&mut self, version: u32) -> Result<&CompiledSchema, ServiceError> {
        let source = self.version_source(version)?.clone();
        let compiled = CompiledSchema::compile(source, version)
            .map_err(|e| ServiceError::Serialization(e.to_string()))?;
        self.active = Some(compiled);
        self.active()
    }

    /// Validate and store a new schema version; does not activate
    pub fn upload(&mut self, source: SchemaDefinition) -> Result<u32, ServiceError> {
        let warnings = validate_schema(&source)?;
        for warning in &warnings {
            warn!(path = %warning.path, "schema upload warning: {}", warning.message);
        }

        let version = self.versions.keys().next_back().copied().unwrap_or(0) + 1;
        let mut source = source;
        source.version = Some(version);
        self.versions.insert(version, source);
        info!(version, "schema version stored");
        Ok(version)
    }

    /// The stored source for a version
    pub fn version_source(&self, version: u32) -> Result<&SchemaDefinition, ServiceError> {
        self.versions.get(&version).ok_or_else(|| {
            ServiceError::version_conflict(format!("schema version {version} does not exist"))
        })
    }

    /// Activate a stored version, gated by forward compatibility
    ///
    /// `store` is the tenant's current data and `retained_log` the mutation
    /// entries still needed for catch-up and recovery; activation refuses
    /// any change that would orphan a row or render a retained entry
    /// unreplayable. Rollback is the same operation pointed at an earlier
    /// version.
    pub fn activate(
        &mut self,
        version: u32,
        store: &TabularStore,
        retained_log: &[MutationEntry],
    ) -> Result<&CompiledSchema, ServiceError> {
        let source = self.version_source(version)?.clone();
        let compiled = CompiledSchema::compile(source, version)
            .map_err(|e| ServiceError::Serialization(e.to_string()))?;

        let mut issues = check_forward_compatible(&compiled, store);
        issues.extend(check_replayable(&compiled, retained_log));
        if !issues.is_empty() {
            return Err(ServiceError::SchemaValidationFailed { issues });
        }

        info!(version, "schema activated");
        self.active = Some(compiled);
        self.active()
    }
}

// =========================================================================
// Validation
// =========================================================================

/// Validate a schema source; returns warnings, or the full issue list as an
/// error when anything is fatal
pub fn validate_schema(source: &SchemaDefinition) -> Result<Vec<SchemaIssue>, ServiceError> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let entity_names: Vec<&str> = source.entities.keys().map(|s| s.as_str()).collect();

    // Rule 1: identifier shape and reserved names
    for (name, entity) in &source.entities {
        check_identifier(&mut errors, &format!("/entities/{name}"), name);
        for field_name in entity.fields.keys() {
            check_identifier(
                &mut errors,
                &format!("/entities/{name}/fields/{field_name}"),
                field_name,
            );
        }
    }
    for (name, relationship) in &source.relationships {
        check_identifier(&mut errors, &format!("/relationships/{name}"), name);
        for field_name in relationship.properties.keys() {
            check_identifier(
                &mut errors,
                &format!("/relationships/{name}/properties/{field_name}"),
                field_name,
            );
        }
    }
    for name in source.indexes.keys() {
        check_identifier(&mut errors, &format!("/indexes/{name}"), name);
    }

    // Rule 2: enum value lists must be non-empty (the closed type set itself
    // is enforced by parsing)
    for (entity_name, entity) in &source.entities {
        for (field_name, field) in &entity.fields {
            if let FieldType::Enum { values } = &field.field_type {
                if values.is_empty() {
                    errors.push(SchemaIssue::new(
                        format!("/entities/{entity_name}/fields/{field_name}"),
                        "enum fields must declare at least one value",
                    ));
                }
            }
        }
    }

    // Rule 3: reference targets are defined entities
    for (entity_name, entity) in &source.entities {
        for (field_name, field) in &entity.fields {
            if let FieldType::Reference { entity: target } = &field.field_type {
                if !source.entities.contains_key(target) {
                    errors.push(unknown_name_issue(
                        format!("/entities/{entity_name}/fields/{field_name}"),
                        "entity",
                        target,
                        &entity_names,
                    ));
                }
            }
        }
    }

    // Rule 4: relationship endpoints are defined entities
    for (name, relationship) in &source.relationships {
        for (side, endpoint) in [
            ("source", &relationship.source),
            ("target", &relationship.target),
        ] {
            if !source.entities.contains_key(endpoint) {
                errors.push(unknown_name_issue(
                    format!("/relationships/{name}/{side}"),
                    "entity",
                    endpoint,
                    &entity_names,
                ));
            }
        }

        // Permission relationships must carry a capability property, since
        // grants of this kind are meaningless without one
        if relationship.kind == RelationKind::Permission {
            match relationship.properties.get("capability") {
                Some(field) if field.field_type == FieldType::String => {}
                Some(_) => errors.push(SchemaIssue::new(
                    format!("/relationships/{name}/properties/capability"),
                    "the capability property of a permission relationship must be a string",
                )),
                None => errors.push(SchemaIssue::new(
                    format!("/relationships/{name}/properties"),
                    "permission relationships must declare a 'capability' property",
                )),
            }
        }
    }

    // Rule 5: unique indexes name declared fields of declared entities
    for (name, index) in &source.indexes {
        match source.entities.get(&index.entity) {
            None => errors.push(unknown_name_issue(
                format!("/indexes/{name}/entity"),
                "entity",
                &index.entity,
                &entity_names,
            )),
            Some(entity) => {
                if !entity.fields.contains_key(&index.field) {
                    let field_names: Vec<&str> =
                        entity.fields.keys().map(|s| s.as_str()).collect();
                    errors.push(unknown_name_issue(
                        format!("/indexes/{name}/field"),
                        "field",
                        &index.field,
                        &field_names,
                    ));
                }
            }
        }
    }

    // Rule 6: patterns compile
    let all_fields = source
        .entities
        .iter()
        .flat_map(|(entity_name, entity)| {
            entity.fields.iter().map(move |(field_name, field)| {
                (format!("/entities/{entity_name}/fields/{field_name}"), field)
            })
        })
        .chain(source.relationships.iter().flat_map(|(name, relationship)| {
            relationship.properties.iter().map(move |(field_name, field)| {
                (
                    format!("/relationships/{name}/properties/{field_name}"),
                    field,
                )
            })
        }));
    for (path, field) in all_fields {
        if let Some(pattern) = &field.pattern {
            if let Err(e) = regex::Regex::new(pattern) {
                errors.push(SchemaIssue::new(path, format!("pattern does not compile: {e}")));
            }
        }
    }

    // Rule 7: no reference cycle (self-references allowed, warned)
    check_reference_cycles(source, &mut errors, &mut warnings);

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ServiceError::SchemaValidationFailed { issues: errors })
    }
}

fn check_identifier(errors: &mut Vec<SchemaIssue>, path: &str, name: &str) {
    if name.is_empty() {
        errors.push(SchemaIssue::new(path, "identifier must not be empty"));
        return;
    }
    let mut chars = name.chars();
    let head_ok = chars.next().map(|c| c.is_ascii_alphabetic()).unwrap_or(false);
    let tail_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !head_ok || !tail_ok {
        errors.push(SchemaIssue::new(
            path,
            format!("identifier '{name}' must start with a letter and contain only letters, digits, and underscores"),
        ));
    }
    if RESERVED_NAMES.contains(&name) {
        errors.push(SchemaIssue::new(
            path,
            format!("identifier '{name}' is reserved"),
        ));
    }
}

fn unknown_name_issue(
    path: String,
    what: &str,
    name: &str,
    candidates: &[&str],
) -> SchemaIssue {
    let issue = SchemaIssue::new(path, format!("unknown {what} '{name}'"));
    match closest_match(name, candidates) {
        Some(suggestion) => issue.with_suggestion(suggestion),
        None => issue,
    }
}

/// The closest candidate within edit distance 2, for "did you mean" hints
fn closest_match(name: &str, candidates: &[&str]) -> Option<String> {
    candidates
        .iter()
        .map(|c| (edit_distance(name, c), *c))
        .filter(|(distance, _)| *distance <= 2)
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, c)| c.to_string())
}

fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

/// Depth-first cycle check over the entity reference graph
fn check_reference_cycles(
    source: &SchemaDefinition,
    errors: &mut Vec<SchemaIssue>,
    warnings: &mut Vec<SchemaIssue>,
) {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let names: Vec<&String> = source.entities.keys().collect();
    let mut marks: BTreeMap<&str, Mark> =
        names.iter().map(|n| (n.as_str(), Mark::Unvisited)).collect();

    fn references<'a>(
        source: &'a SchemaDefinition,
        entity: &str,
    ) -> impl Iterator<Item = &'a str> {
        source
            .entities
            .get(entity)
            .into_iter()
            .flat_map(|e| e.fields.values())
            .filter_map(|f| match &f.field_type {
                FieldType::Reference { entity } => Some(entity.as_str()),
                _ => None,
            })
    }

    fn visit<'a>(
        source: &'a SchemaDefinition,
        entity: &'a str,
        marks: &mut BTreeMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
        cycles: &mut Vec<Vec<String>>,
        self_refs: &mut Vec<String>,
    ) {
        marks.insert(entity, Mark::InProgress);
        stack.push(entity);
        for target in references(source, entity) {
            if target == entity {
                self_refs.push(entity.to_string());
                continue;
            }
            match marks.get(target).copied() {
                Some(Mark::Unvisited) => {
                    visit(source, target, marks, stack, cycles, self_refs)
                }
                Some(Mark::InProgress) => {
                    let start = stack.iter().position(|&n| n == target).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(target.to_string());
                    cycles.push(cycle);
                }
                _ => {}
            }
        }
        stack.pop();
        marks.insert(entity, Mark::Done);
    }

    let mut cycles = Vec::new();
    let mut self_refs = Vec::new();
    for name in &names {
        if marks.get(name.as_str()) == Some(&Mark::Unvisited) {
            let mut stack = Vec::new();
            visit(
                source,
                name.as_str(),
                &mut marks,
                &mut stack,
                &mut cycles,
                &mut self_refs,
            );
        }
    }

    for entity in self_refs {
        warnings.push(SchemaIssue::new(
            format!("/entities/{entity}"),
            format!("entity '{entity}' references itself"),
        ));
    }
    for cycle in cycles {
        errors.push(SchemaIssue::new(
            format!("/entities/{}", cycle[0]),
            format!("reference cycle prevents instantiation: {}", cycle.join(" -> ")),
        ));
    }
}

// =========================================================================
// Forward compatibility
// =========================================================================

/// Every existing row must fit the candidate schema
fn check_forward_compatible(candidate: &CompiledSchema, store: &TabularStore) -> Vec<SchemaIssue> {
    let mut issues = Vec::new();

    for (name, table) in store.tables() {
        let Some(new_definition) = candidate.table(name) else {
            if !table.is_empty() {
                issues.push(SchemaIssue::new(
                    format!("/tables/{name}"),
                    format!(
                        "table '{name}' holds {} rows but is not declared by the candidate schema",
                        table.len()
                    ),
                ));
            }
            continue;
        };

        for (key, row) in table.iter() {
            if let Err(e) = new_definition.normalize_row(row) {
                issues.push(SchemaIssue::new(
                    format!("/tables/{name}/{key}"),
                    format!("existing row does not fit the candidate schema: {e}"),
                ));
                // One sample per table keeps the error readable
                break;
            }
        }
    }

    issues
}

/// Every retained log entry must stay replayable under the candidate schema
fn check_replayable(candidate: &CompiledSchema, retained_log: &[MutationEntry]) -> Vec<SchemaIssue> {
    let mut issues = Vec::new();

    for entry in retained_log {
        let missing: Option<(&str, String)> = match &entry.payload {
            MutationPayload::Grant { edge } => candidate
                .relation(&edge.relation)
                .is_none()
                .then(|| ("relationship", edge.relation.clone())),
            MutationPayload::Revoke { relation, .. } => candidate
                .relation(relation)
                .is_none()
                .then(|| ("relationship", relation.clone())),
            MutationPayload::UpsertEntity { entity, .. }
            | MutationPayload::DeleteEntity { entity, .. } => {
                (!candidate.has_entity(entity)).then(|| ("entity", entity.clone()))
            }
            MutationPayload::SchemaChange { .. } => None,
        };

        if let Some((what, name)) = missing {
            issues.push(SchemaIssue::new(
                format!("/log/{}", entry.version),
                format!(
                    "retained log entry v{} references {what} '{name}' absent from the candidate schema",
                    entry.version
                ),
            ));
        }
    }

    issues
}
