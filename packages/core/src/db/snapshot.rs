//! CSV Snapshot Codec
//!
//! A snapshot is the canonical tabular serialization of a tenant's state at a
//! specific version: one CSV object per table, the compiled schema document,
//! and a `_manifest.json` sidecar recording the snapshot version and a
//! SHA-256 checksum per table.
//!
//! Column order is the compiled schema's declared order: entity tables lead
//! with `id`, relationship tables with
//! `source_id,target_id,edge_id,created_version,revoked_version`. An empty
//! cell encodes an absent value (`revoked_version` of a live edge, optional
//! fields never written).
//!
//! The manifest is written last with a conditional put, so a competing
//! writer for the same tenant fails loudly instead of interleaving tables
//! from two snapshots.

use crate::db::error::StorageError;
use crate::db::object_store::{keys, ObjectStore};
use crate::models::compiled::{ColumnDefinition, CompiledSchema, TableDefinition};
use crate::models::mutation::Version;
use crate::models::schema::FieldType;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

/// One row, keyed by column name
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Everything a snapshot stores for one tenant
#[derive(Debug, Clone)]
pub struct SnapshotData {
    /// Version the snapshot is up to date with
    pub version: Version,

    /// The active compiled schema at snapshot time
    pub schema: CompiledSchema,

    /// Table name -> rows in insertion order
    pub tables: IndexMap<String, Vec<Row>>,
}

/// Manifest sidecar recording what a snapshot contains
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotManifest {
    /// Version the snapshot is up to date with
    pub snapshot_version: Version,

    /// Active schema version at snapshot time
    pub schema_version: u32,

    /// Wall-clock time the snapshot was taken
    pub taken_at: DateTime<Utc>,

    /// Table name -> digest, in schema table order
    pub tables: IndexMap<String, TableDigest>,
}

/// Integrity record for one snapshot table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDigest {
    /// Hex SHA-256 of the CSV bytes
    pub checksum: String,

    /// Row count, for stats and sanity checks
    pub rows: usize,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Encode one table to CSV bytes in canonical column order
pub fn encode_table(definition: &TableDefinition, rows: &[Row]) -> Result<Vec<u8>, StorageError> {
    let mut writer = csv::Writer::from_writer(Vec::new());

    let header: Vec<&str> = definition.columns.iter().map(|c| c.name.as_str()).collect();
    writer.write_record(&header)?;

    for row in rows {
        let record: Vec<String> = definition
            .columns
            .iter()
            .map(|column| encode_cell(column, row.get(&column.name)))
            .collect();
        writer.write_record(&record)?;
    }

    writer
        .into_inner()
        .map_err(|e| StorageError::unavailable(format!("CSV buffer flush failed: {e}")))
}

/// Decode one table from CSV bytes
pub fn decode_table(
    definition: &TableDefinition,
    bytes: &[u8],
) -> Result<Vec<Row>, StorageError> {
    let mut reader = csv::Reader::from_reader(bytes);
    let headers = reader.headers()?.clone();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let mut row = Row::new();
        for (index, cell) in record.iter().enumerate() {
            let Some(name) = headers.get(index) else {
                continue;
            };
            let Some(column) = definition.column(name) else {
                warn!(table = %definition.name, column = name, "ignoring undeclared snapshot column");
                continue;
            };
            if cell.is_empty() {
                continue;
            }
            row.insert(name.to_string(), decode_cell(column, cell)?);
        }
        rows.push(row);
    }
    Ok(rows)
}

fn encode_cell(column: &ColumnDefinition, value: Option<&serde_json::Value>) -> String {
    let Some(value) = value else {
        return String::new();
    };
    match (&column.column_type, value) {
        (_, serde_json::Value::Null) => String::new(),
        (FieldType::Json, value) => value.to_string(),
        (_, serde_json::Value::String(s)) => s.clone(),
        (_, serde_json::Value::Number(n)) => n.to_string(),
        (_, serde_json::Value::Bool(b)) => b.to_string(),
        // Shapes outside the closed set never pass row validation
        (_, other) => other.to_string(),
    }
}

fn decode_cell(
    column: &ColumnDefinition,
    cell: &str,
) -> Result<serde_json::Value, StorageError> {
    let value = match &column.column_type {
        FieldType::String
        | FieldType::Timestamp
        | FieldType::Enum { .. }
        | FieldType::Reference { .. } => serde_json::Value::String(cell.to_string()),
        FieldType::Number => {
            if let Ok(n) = cell.parse::<u64>() {
                serde_json::Value::from(n)
            } else {
                let n: f64 = cell.parse().map_err(|_| {
                    StorageError::unavailable(format!(
                        "non-numeric cell '{cell}' in column '{}'",
                        column.name
                    ))
                })?;
                serde_json::Value::from(n)
            }
        }
        FieldType::Boolean => serde_json::Value::Bool(cell == "true"),
        FieldType::Json => serde_json::from_str(cell)?,
    };
    Ok(value)
}

/// Write a full snapshot, committing it with a conditional manifest put
///
/// Returns the manifest. On [`StorageError::PreconditionFailed`] another
/// writer owns the tenant; the caller must treat its own state as stale.
#[instrument(skip(store, data), fields(version = %data.version))]
pub async fn write_snapshot(
    store: &dyn ObjectStore,
    tenant: &str,
    data: &SnapshotData,
) -> Result<SnapshotManifest, StorageError> {
    let mut digests = IndexMap::new();

    for (name, definition) in &data.schema.tables {
        let empty = Vec::new();
        let rows = data.tables.get(name).unwrap_or(&empty);
        let bytes = encode_table(definition, rows)?;
        let digest = TableDigest {
            checksum: sha256_hex(&bytes),
            rows: rows.len(),
        };
        store.put(&keys::table_csv(tenant, name), bytes).await?;
        digests.insert(name.clone(), digest);
    }

    let schema_bytes = serde_json::to_vec_pretty(&data.schema)?;
    store
        .put(&keys::schema_current(tenant), schema_bytes)
        .await?;

    let manifest = SnapshotManifest {
        snapshot_version: data.version,
        schema_version: data.schema.version,
        taken_at: Utc::now(),
        tables: digests,
    };
    let manifest_key = keys::manifest(tenant);
    let expected = store.generation(&manifest_key).await?;
    let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;
    store
        .put_if_generation(&manifest_key, manifest_bytes, expected)
        .await?;

    info!(
        tenant,
        version = %data.version,
        tables = manifest.tables.len(),
        "snapshot written"
    );
    Ok(manifest)
}

/// Load the latest snapshot for a tenant, or `None` for a brand-new tenant
///
/// Verifies every table checksum against the manifest before returning.
#[instrument(skip(store))]
pub async fn load_snapshot(
    store: &dyn ObjectStore,
    tenant: &str,
) -> Result<Option<SnapshotData>, StorageError> {
    let manifest_bytes = match store.get(&keys::manifest(tenant)).await? {
        Some(bytes) => bytes,
        None => return Ok(None),
    };
    let manifest: SnapshotManifest = serde_json::from_slice(&manifest_bytes)?;

    let schema_key = keys::schema_current(tenant);
    let schema_bytes = store
        .get(&schema_key)
        .await?
        .ok_or_else(|| StorageError::not_found(&schema_key))?;
    let mut schema: CompiledSchema = serde_json::from_slice(&schema_bytes)?;
    schema
        .rehydrate()
        .map_err(|e| StorageError::unavailable(format!("stored schema is corrupt: {e}")))?;

    let mut tables = IndexMap::new();
    for (name, digest) in &manifest.tables {
        let key = keys::table_csv(tenant, name);
        let bytes = store
            .get(&key)
            .await?
            .ok_or_else(|| StorageError::not_found(&key))?;

        let computed = sha256_hex(&bytes);
        if computed != digest.checksum {
            return Err(StorageError::ChecksumMismatch {
                table: name.clone(),
                expected: digest.checksum.clone(),
                found: computed,
            });
        }

        let definition = schema.table(name).ok_or_else(|| {
            StorageError::unavailable(format!("snapshot table '{name}' missing from schema"))
        })?;
        tables.insert(name.clone(), decode_table(definition, &bytes)?);
    }

    debug!(tenant, version = %manifest.snapshot_version, "snapshot loaded");
    Ok(Some(SnapshotData {
        version: manifest.snapshot_version,
        schema,
        tables,
    }))
}
