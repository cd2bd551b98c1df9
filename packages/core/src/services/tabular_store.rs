//! Tabular Store
//!
//! The authoritative typed projection of a tenant's data: one ordered table
//! per entity and relationship declared by the active schema. Rows are
//! validated against the compiled schema on every write; scan order is
//! insertion order; the whole store serializes canonically for snapshots.
//!
//! The store is not durable by itself. Durability comes from the combination
//! of CSV snapshots and the mutation log (see the ledger's durability
//! contract); the store's only job is to be correct and deterministic.

use crate::db::snapshot::{Row, SnapshotData};
use crate::models::compiled::{CompiledSchema, TableDefinition};
use crate::models::mutation::Version;
use crate::services::error::ServiceError;
use indexmap::IndexMap;

/// One in-memory table: a definition plus rows keyed by primary key
#[derive(Debug, Clone)]
pub struct Table {
    /// Compiled definition this table was created from
    pub definition: TableDefinition,

    /// Primary key -> row, in insertion order
    rows: IndexMap<String, Row>,
}

impl Table {
    fn new(definition: TableDefinition) -> Self {
        Self {
            definition,
            rows: IndexMap::new(),
        }
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Row)> {
        self.rows.iter()
    }

    fn primary_key_of(&self, row: &Row) -> Result<String, ServiceError> {
        row.get(&self.definition.primary_key)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                ServiceError::malformed(format!(
                    "row for table '{}' is missing its primary key '{}'",
                    self.definition.name, self.definition.primary_key
                ))
            })
    }

    /// Check unique columns against every other row
    fn check_unique(&self, key: &str, row: &Row) -> Result<(), ServiceError> {
        for column in self.definition.columns.iter().filter(|c| c.unique) {
            let Some(value) = row.get(&column.name) else {
                continue;
            };
            let collision = self
                .rows
                .iter()
                .any(|(other_key, other)| other_key != key && other.get(&column.name) == Some(value));
            if collision {
                return Err(ServiceError::constraint(format!(
                    "unique index on '{}.{}' violated by value {}",
                    self.definition.name, column.name, value
                )));
            }
        }
        Ok(())
    }
}

/// The per-tenant table mapping
#[derive(Debug, Clone, Default)]
pub struct TabularStore {
    tables: IndexMap<String, Table>,
}

impl TabularStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or re-key tables to match a (newly activated) schema
    ///
    /// Existing rows survive: activation already verified they fit the new
    /// definitions. Tables the new schema no longer declares are dropped
    /// (the forward-compatibility check only permits that when they are
    /// empty).
    pub fn apply_schema(&mut self, schema: &CompiledSchema) {
        let mut tables = IndexMap::with_capacity(schema.tables.len());
        for (name, definition) in &schema.tables {
            let table = match self.tables.shift_remove(name) {
                Some(mut existing) => {
                    existing.definition = definition.clone();
                    existing
                }
                None => Table::new(definition.clone()),
            };
            tables.insert(name.clone(), table);
        }
        self.tables = tables;
    }

    /// Look up a table
    pub fn table(&self, name: &str) -> Result<&Table, ServiceError> {
        self.tables
            .get(name)
            .ok_or_else(|| ServiceError::unknown_table(name))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table, ServiceError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| ServiceError::unknown_table(name))
    }

    /// All tables in schema order
    pub fn tables(&self) -> impl Iterator<Item = (&String, &Table)> {
        self.tables.iter()
    }

    /// Insert or replace a row after validating it against the table
    ///
    /// Returns the normalized row as stored. A row with the primary key of
    /// an existing row replaces it in place (upsert), keeping its position
    /// in insertion order.
    pub fn insert(&mut self, table: &str, row: &Row) -> Result<Row, ServiceError> {
        let table = self.table_mut(table)?;
        let normalized = table.definition.normalize_row(row)?;
        let key = table.primary_key_of(&normalized)?;
        table.check_unique(&key, &normalized)?;
        table.rows.insert(key, normalized.clone());
        Ok(normalized)
    }

    /// Patch named fields of an existing row
    ///
    /// The patched row is re-validated as a whole, so a patch can never
    /// produce a row the schema would have rejected.
    pub fn update(&mut self, table: &str, key: &str, patch: &Row) -> Result<Row, ServiceError> {
        let table_name = table.to_string();
        let table = self.table_mut(table)?;
        let Some(existing) = table.rows.get(key) else {
            return Err(ServiceError::unknown_entity(table_name, key));
        };

        let mut merged = existing.clone();
        for (field, value) in patch {
            if value.is_null() {
                merged.remove(field);
            } else {
                merged.insert(field.clone(), value.clone());
            }
        }

        let normalized = table.definition.normalize_row(&merged)?;
        table.check_unique(key, &normalized)?;
        if let Some(slot) = table.rows.get_mut(key) {
            *slot = normalized.clone();
        }
        Ok(normalized)
    }

    /// Delete a row by primary key
    pub fn delete(&mut self, table: &str, key: &str) -> Result<Row, ServiceError> {
        let table_name = table.to_string();
        let table = self.table_mut(table)?;
        table
            .rows
            .shift_remove(key)
            .ok_or_else(|| ServiceError::unknown_entity(table_name, key))
    }

    /// Fetch a row by primary key
    pub fn get(&self, table: &str, key: &str) -> Result<Option<&Row>, ServiceError> {
        Ok(self.table(table)?.rows.get(key))
    }

    /// All rows of a table in insertion order
    pub fn scan(&self, table: &str) -> Result<impl Iterator<Item = &Row>, ServiceError> {
        Ok(self.table(table)?.rows.values())
    }

    /// Whether an entity instance exists
    pub fn entity_exists(&self, entity: &str, id: &str) -> bool {
        self.tables
            .get(entity)
            .map(|t| t.definition.is_entity() && t.rows.contains_key(id))
            .unwrap_or(false)
    }

    /// Total rows across entity tables
    pub fn entity_count(&self) -> usize {
        self.tables
            .values()
            .filter(|t| t.definition.is_entity())
            .map(|t| t.len())
            .sum()
    }

    /// Canonical snapshot projection of every table
    pub fn snapshot(&self, version: Version, schema: &CompiledSchema) -> SnapshotData {
        let mut tables = IndexMap::with_capacity(self.tables.len());
        for (name, table) in &self.tables {
            tables.insert(name.clone(), table.rows.values().cloned().collect());
        }
        SnapshotData {
            version,
            schema: schema.clone(),
            tables,
        }
    }

    /// Rebuild the store from a loaded snapshot
    pub fn load(data: &SnapshotData) -> Result<Self, ServiceError> {
        let mut store = TabularStore::new();
        store.apply_schema(&data.schema);
        for (name, rows) in &data.tables {
            let table = store.table_mut(name)?;
            for row in rows {
                let key = table.primary_key_of(row)?;
                table.rows.insert(key, row.clone());
            }
        }
        Ok(store)
    }

    /// Rough resident size, for the per-tenant memory soft cap
    pub fn estimated_bytes(&self) -> usize {
        self.tables
            .values()
            .flat_map(|t| t.rows.iter())
            .map(|(key, row)| {
                key.len()
                    + row
                        .iter()
                        .map(|(k, v)| k.len() + estimated_value_bytes(v))
                        .sum::<usize>()
                    + 48
            })
            .sum()
    }
}

fn estimated_value_bytes(value: &serde_json::Value) -> usize {
    match value {
        serde_json::Value::Null => 8,
        serde_json::Value::Bool(_) => 8,
        serde_json::Value::Number(_) => 16,
        serde_json::Value::String(s) => s.len() + 24,
        serde_json::Value::Array(items) => {
            items.iter().map(estimated_value_bytes).sum::<usize>() + 24
        }
        serde_json::Value::Object(map) => {
            map.iter()
                .map(|(k, v)| k.len() + estimated_value_bytes(v))
                .sum::<usize>()
                + 24
        }
    }
}
