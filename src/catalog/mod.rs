#![forbid(unsafe_code)]

//! Bucket catalog: configuration records and physical schema resolution.
//!
//! The authoritative description of a bucket is split between its row in
//! `buckets_config` (declared indexed properties, version) and the physical
//! relation itself. Whether the bucket is in [`IdState::Split`] is never
//! recorded anywhere; resolution reads it from the relation's columns.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::storage::sequence;
use crate::storage::sql::{constraint_violation, now_millis, quote_ident, Constraint};
use crate::types::ident::{NARROW_MAX, NARROW_MIN};
use crate::types::{BucketError, IdColumn, Result};

pub mod cache;

pub use cache::{CacheMetricsSnapshot, SchemaCache};

const MAX_NAME_LEN: usize = 63;
const RESERVED_TABLES: &[&str] = &["buckets_config", "bucket_sequences"];

/// Internal columns present in every bucket relation.
pub(crate) const KEY_COLUMN: &str = "_key";
pub(crate) const VALUE_COLUMN: &str = "_value";
pub(crate) const ETAG_COLUMN: &str = "_etag";
pub(crate) const MTIME_COLUMN: &str = "_mtime";

/// Declared type of an indexed property.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    /// UTF-8 text.
    String,
    /// Integer or floating point number.
    Number,
    /// `true` / `false`.
    Boolean,
}

impl PropertyType {
    fn sql_type(self) -> &'static str {
        match self {
            PropertyType::String => "TEXT",
            PropertyType::Number => "NUMERIC",
            PropertyType::Boolean => "INTEGER",
        }
    }
}

/// Index declaration for one property.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Value type stored in the column.
    #[serde(rename = "type")]
    pub kind: PropertyType,
    /// Whether two objects may share a value.
    #[serde(default)]
    pub unique: bool,
}

impl IndexSpec {
    /// Non-unique index of the given type.
    pub fn new(kind: PropertyType) -> Self {
        Self {
            kind,
            unique: false,
        }
    }

    /// Marks the index unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Declared configuration of a bucket.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Indexed properties by name.
    #[serde(default)]
    pub index: BTreeMap<String, IndexSpec>,
    /// Caller-managed schema version.
    #[serde(default)]
    pub version: u32,
}

impl BucketConfig {
    /// Empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an indexed property.
    pub fn with_index(mut self, name: impl Into<String>, spec: IndexSpec) -> Self {
        self.index.insert(name.into(), spec);
        self
    }

    /// Sets the schema version.
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }
}

/// Identifier-column state of a bucket relation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IdState {
    /// Identifiers live in `_id` only.
    Narrow,
    /// Identifiers live in `_id` (legacy rows) or `_idx` (newer rows).
    Split,
}

impl IdState {
    /// Physical columns that may hold the logical identifier.
    pub fn columns(self) -> &'static [IdColumn] {
        match self {
            IdState::Narrow => &[IdColumn::Legacy],
            IdState::Split => &[IdColumn::Legacy, IdColumn::Wide],
        }
    }
}

/// Summary of a bucket for listing.
#[derive(Clone, Debug, Serialize)]
pub struct BucketInfo {
    /// Bucket name.
    pub name: String,
    /// Declared configuration.
    pub config: BucketConfig,
    /// Identifier-column state.
    pub id_state: IdState,
    /// Last configuration change, in milliseconds since the epoch.
    pub mtime: i64,
}

/// Resolved schema of one bucket, as cached by [`SchemaCache`].
#[derive(Debug)]
pub struct BucketSchema {
    name: String,
    config: BucketConfig,
    id_state: IdState,
    columns: BTreeSet<String>,
    mtime: i64,
    resolved_at: Instant,
}

impl BucketSchema {
    /// Bucket name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared configuration.
    pub fn config(&self) -> &BucketConfig {
        &self.config
    }

    /// Identifier-column state observed at resolution.
    pub fn id_state(&self) -> IdState {
        self.id_state
    }

    /// Index declaration for `name`, if the property is indexed.
    pub fn property(&self, name: &str) -> Option<&IndexSpec> {
        self.config.index.get(name)
    }

    /// Whether the relation had column `name` at resolution.
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains(name)
    }

    /// Time since the schema was read from storage.
    pub fn age(&self) -> Duration {
        self.resolved_at.elapsed()
    }

    /// Listing view of the schema.
    pub fn info(&self) -> BucketInfo {
        BucketInfo {
            name: self.name.clone(),
            config: self.config.clone(),
            id_state: self.id_state,
            mtime: self.mtime,
        }
    }
}

/// Checks a bucket or property name for use as an SQL identifier.
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_head = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
    let valid_tail = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_head || !valid_tail || name.len() > MAX_NAME_LEN {
        return Err(BucketError::InvalidArgument(format!(
            "{kind} name '{name}' must start with a letter and contain only letters, \
             digits and '_' (max {MAX_NAME_LEN} bytes)"
        )));
    }
    if kind == "bucket"
        && (RESERVED_TABLES.contains(&name) || name.to_ascii_lowercase().starts_with("sqlite"))
    {
        return Err(BucketError::InvalidArgument(format!(
            "bucket name '{name}' is reserved"
        )));
    }
    Ok(())
}

pub(crate) fn property_index_name(bucket: &str, prop: &str) -> String {
    format!("{bucket}_{prop}_idx")
}

/// Creates the relation, its indexes, its sequence and its config row.
pub(crate) fn create(conn: &Connection, name: &str, config: &BucketConfig) -> Result<()> {
    validate_name("bucket", name)?;
    for prop in config.index.keys() {
        validate_name("property", prop)?;
    }
    let index_json = serde_json::to_string(&config.index)?;
    conn.execute(
        "INSERT INTO buckets_config (name, index_json, version, mtime) VALUES (?1, ?2, ?3, ?4)",
        params![name, index_json, config.version, now_millis()],
    )
    .map_err(|err| match constraint_violation(&err) {
        Some(Constraint::Unique) => {
            BucketError::schema_conflict(name, "bucket already exists")
        }
        _ => err.into(),
    })?;

    let table = quote_ident(name);
    let mut ddl = format!(
        "CREATE TABLE {table} (\n    \
         \"_id\" INTEGER UNIQUE CHECK (\"_id\" BETWEEN {NARROW_MIN} AND {NARROW_MAX}),\n    \
         \"{KEY_COLUMN}\" TEXT NOT NULL UNIQUE,\n    \
         \"{VALUE_COLUMN}\" TEXT NOT NULL,\n    \
         \"{ETAG_COLUMN}\" TEXT NOT NULL,\n    \
         \"{MTIME_COLUMN}\" INTEGER NOT NULL"
    );
    for (prop, spec) in &config.index {
        ddl.push_str(&format!(",\n    {} {}", quote_ident(prop), spec.kind.sql_type()));
    }
    ddl.push_str("\n);\n");
    for (prop, spec) in &config.index {
        let column = quote_ident(prop);
        ddl.push_str(&format!(
            "CREATE {}INDEX {} ON {table} ({column}) WHERE {column} IS NOT NULL;\n",
            if spec.unique { "UNIQUE " } else { "" },
            quote_ident(&property_index_name(name, prop)),
        ));
    }
    ddl.push_str(&format!(
        "CREATE INDEX {} ON {table} (\"{MTIME_COLUMN}\");\n",
        quote_ident(&format!("{name}__mtime_idx"))
    ));
    conn.execute_batch(&ddl)?;
    sequence::create(conn, name)?;
    info!(bucket = %name, properties = config.index.len(), "created bucket");
    Ok(())
}

/// Drops the relation together with its sequence and config row.
pub(crate) fn drop_bucket(conn: &Connection, name: &str) -> Result<()> {
    let removed = conn.execute("DELETE FROM buckets_config WHERE name = ?1", [name])?;
    if removed == 0 {
        return Err(BucketError::BucketNotFound(name.to_owned()));
    }
    conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(name)))?;
    sequence::drop_sequence(conn, name)?;
    info!(bucket = %name, "deleted bucket");
    Ok(())
}

/// Column name to declared type for the bucket relation.
pub(crate) fn table_columns(conn: &Connection, name: &str) -> Result<BTreeMap<String, String>> {
    let mut stmt = conn.prepare("SELECT name, type FROM pragma_table_xinfo(?1)")?;
    let rows = stmt.query_map([name], |row| Ok((row.get(0)?, row.get(1)?)))?;
    let mut columns = BTreeMap::new();
    for row in rows {
        let (column, kind): (String, String) = row?;
        columns.insert(column, kind);
    }
    Ok(columns)
}

/// Reads authoritative bucket metadata from storage.
pub(crate) fn load(conn: &Connection, name: &str) -> Result<BucketSchema> {
    let row: Option<(String, u32, i64)> = conn
        .query_row(
            "SELECT index_json, version, mtime FROM buckets_config WHERE name = ?1",
            [name],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let (index_json, version, mtime) =
        row.ok_or_else(|| BucketError::BucketNotFound(name.to_owned()))?;
    let index = serde_json::from_str(&index_json).map_err(|err| BucketError::StorageFailure {
        message: format!("config of bucket '{name}' is unreadable: {err}"),
        retryable: false,
    })?;
    let columns: BTreeSet<String> = table_columns(conn, name)?.into_keys().collect();
    if columns.is_empty() {
        return Err(BucketError::BucketNotFound(name.to_owned()));
    }
    let id_state = if columns.contains(IdColumn::Wide.name()) {
        IdState::Split
    } else {
        IdState::Narrow
    };
    Ok(BucketSchema {
        name: name.to_owned(),
        config: BucketConfig { index, version },
        id_state,
        columns,
        mtime,
        resolved_at: Instant::now(),
    })
}

/// Lists every bucket in name order.
pub(crate) fn list(conn: &Connection) -> Result<Vec<BucketInfo>> {
    let mut stmt = conn.prepare("SELECT name FROM buckets_config ORDER BY name")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    names
        .iter()
        .map(|name| load(conn, name).map(|schema| schema.info()))
        .collect()
}
