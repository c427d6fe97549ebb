//! Statement execution for object reads and mutations.
//!
//! Every function here runs against an already-resolved [`BucketSchema`] and
//! a connection (or write transaction) handed in by the facade. Rows are read
//! with `SELECT *` so that row decoding follows the physical columns, not the
//! possibly stale schema.

use std::collections::BTreeMap;
use std::sync::Arc;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;
use tracing::{debug, warn};
use xxhash_rust::xxh64::xxh64;

use crate::catalog::{
    BucketSchema, IdState, ETAG_COLUMN, KEY_COLUMN, MTIME_COLUMN, VALUE_COLUMN,
};
use crate::filter::Filter;
use crate::query::options::FindOptions;
use crate::query::record::{ObjectRecord, RawRow, RecordStream, RowLayout};
use crate::query::translate::{column_value, compile_filter, compile_sort};
use crate::storage::sql::{
    constraint_violation, is_missing_table, now_millis, quote_ident, Constraint,
};
use crate::storage::WriteTxn;
use crate::types::ident::is_representable;
use crate::types::{BucketError, IdColumn, ObjectId, Result};

/// One operation of a [`batch`] request.
#[derive(Clone, Debug)]
pub enum BatchOp {
    /// Insert or replace the object at `key`.
    Put {
        /// Target bucket.
        bucket: String,
        /// Object key.
        key: String,
        /// Document, a JSON object.
        value: serde_json::Value,
    },
    /// Remove the object at `key`.
    Delete {
        /// Target bucket.
        bucket: String,
        /// Object key.
        key: String,
    },
    /// Set indexed fields on every matching object.
    UpdateMany {
        /// Target bucket.
        bucket: String,
        /// Indexed properties and their new values.
        fields: serde_json::Map<String, serde_json::Value>,
        /// Rows to update.
        filter: Filter,
    },
    /// Remove every matching object.
    DeleteMany {
        /// Target bucket.
        bucket: String,
        /// Rows to remove.
        filter: Filter,
    },
}

impl BatchOp {
    /// Bucket the operation targets.
    pub fn bucket(&self) -> &str {
        match self {
            BatchOp::Put { bucket, .. }
            | BatchOp::Delete { bucket, .. }
            | BatchOp::UpdateMany { bucket, .. }
            | BatchOp::DeleteMany { bucket, .. } => bucket,
        }
    }
}

/// Result of one [`BatchOp`], in request order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BatchOutcome {
    /// The object was written under `id`.
    Put {
        /// Identifier of the written object.
        id: ObjectId,
    },
    /// The object was removed.
    Deleted,
    /// `count` objects were updated.
    Updated {
        /// Rows affected.
        count: u64,
    },
    /// `count` objects were removed.
    DeletedMany {
        /// Rows affected.
        count: u64,
    },
}

fn storage_err(bucket: &str, err: rusqlite::Error) -> BucketError {
    if is_missing_table(&err) {
        return BucketError::BucketNotFound(bucket.to_owned());
    }
    match constraint_violation(&err) {
        Some(Constraint::Unique) => BucketError::UniqueViolation {
            bucket: bucket.to_owned(),
            detail: err.to_string(),
        },
        _ => err.into(),
    }
}

fn not_found(bucket: &str, key: &str) -> BucketError {
    BucketError::ObjectNotFound {
        bucket: bucket.to_owned(),
        key: key.to_owned(),
    }
}

fn clamp(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Hex-encoded xxh64 of the serialized document.
pub(crate) fn etag(text: &str) -> String {
    hex::encode(xxh64(text.as_bytes(), 0).to_be_bytes())
}

fn select(conn: &Connection, bucket: &str, sql: &str, params: &[SqlValue]) -> Result<Vec<RawRow>> {
    debug!(bucket = %bucket, sql = %sql, "executing select");
    let mut stmt = conn.prepare(sql).map_err(|err| storage_err(bucket, err))?;
    let layout = RowLayout::of(bucket, &stmt)?;
    let mut rows = stmt
        .query(params_from_iter(params.iter()))
        .map_err(|err| storage_err(bucket, err))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(RawRow::read(row, &layout)?);
    }
    Ok(out)
}

/// Identifier state of the relation as it exists now, read from the columns
/// a `SELECT *` returns rather than from the cached schema.
fn physical_id_state(conn: &Connection, bucket: &str) -> Result<IdState> {
    let sql = format!("SELECT * FROM {} LIMIT 0", quote_ident(bucket));
    let stmt = conn.prepare(&sql).map_err(|err| storage_err(bucket, err))?;
    let split = stmt
        .column_names()
        .iter()
        .any(|name| *name == IdColumn::Wide.name());
    Ok(if split { IdState::Split } else { IdState::Narrow })
}

fn fetch_by_key(conn: &Connection, bucket: &str, key: &str) -> Result<Option<RawRow>> {
    let sql = format!(
        "SELECT * FROM {} WHERE \"{KEY_COLUMN}\" = ?",
        quote_ident(bucket)
    );
    Ok(select(conn, bucket, &sql, &[SqlValue::Text(key.to_owned())])?
        .into_iter()
        .next())
}

fn matching(
    conn: &Connection,
    schema: &BucketSchema,
    filter: &Filter,
    limit: Option<u64>,
) -> Result<Vec<RawRow>> {
    let predicate = compile_filter(schema, filter)?;
    let mut sql = format!(
        "SELECT * FROM {} WHERE {}",
        quote_ident(schema.name()),
        predicate.sql
    );
    let mut params = predicate.params;
    if let Some(limit) = limit {
        sql.push_str(&format!(" ORDER BY \"{KEY_COLUMN}\" LIMIT ?"));
        params.push(SqlValue::Integer(clamp(limit)));
    }
    select(conn, schema.name(), &sql, &params)
}

fn property_values(
    schema: &BucketSchema,
    key: &str,
    document: &serde_json::Value,
) -> Result<Vec<(String, SqlValue)>> {
    let object = document.as_object().ok_or_else(|| {
        BucketError::InvalidArgument(format!("document '{key}' must be a JSON object"))
    })?;
    schema
        .config()
        .index
        .iter()
        .map(|(prop, spec)| {
            let field = object.get(prop).unwrap_or(&serde_json::Value::Null);
            column_value(spec.kind, field)
                .map(|value| (prop.clone(), value))
                .map_err(|reason| {
                    BucketError::InvalidArgument(format!("property '{prop}' of '{key}': {reason}"))
                })
        })
        .collect()
}

/// Rewrites the payload columns of the row at `key`.
fn rewrite(
    conn: &Connection,
    bucket: &str,
    key: &str,
    text: &str,
    columns: &[(String, SqlValue)],
) -> Result<()> {
    let mut sets = vec![
        format!("\"{VALUE_COLUMN}\" = ?"),
        format!("\"{ETAG_COLUMN}\" = ?"),
        format!("\"{MTIME_COLUMN}\" = ?"),
    ];
    let mut params = vec![
        SqlValue::Text(text.to_owned()),
        SqlValue::Text(etag(text)),
        SqlValue::Integer(now_millis()),
    ];
    for (column, value) in columns {
        sets.push(format!("{} = ?", quote_ident(column)));
        params.push(value.clone());
    }
    params.push(SqlValue::Text(key.to_owned()));
    let sql = format!(
        "UPDATE {} SET {} WHERE \"{KEY_COLUMN}\" = ?",
        quote_ident(bucket),
        sets.join(", ")
    );
    conn.execute(&sql, params_from_iter(params.iter()))
        .map_err(|err| storage_err(bucket, err))?;
    Ok(())
}

/// Inserts or replaces the object at `key`.
///
/// A new key draws the next sequence value and writes it to whichever
/// identifier column the sequence default is bound to at that moment. An
/// existing key keeps its identifier and consumes nothing.
pub(crate) fn put(
    txn: &mut WriteTxn<'_>,
    schema: &BucketSchema,
    key: &str,
    document: &serde_json::Value,
) -> Result<ObjectId> {
    let bucket = schema.name();
    if key.is_empty() {
        return Err(BucketError::InvalidArgument("object key must not be empty".into()));
    }
    let columns = property_values(schema, key, document)?;
    let text = serde_json::to_string(document)?;

    if let Some(existing) = fetch_by_key(txn.conn(), bucket, key)? {
        let id = existing.identifier(bucket)?;
        rewrite(txn.conn(), bucket, key, &text, &columns)?;
        return Ok(id);
    }

    let draw = txn.next_value(bucket)?;
    let column = draw.column(bucket)?;
    if !is_representable(draw.value) {
        warn!(
            bucket = %bucket,
            column = column.name(),
            value = draw.value,
            "generated identifier is not representable"
        );
        return Err(BucketError::invalid_identifier(bucket, column.name(), draw.value));
    }

    let mut names = vec![
        quote_ident(column.name()),
        format!("\"{KEY_COLUMN}\""),
        format!("\"{VALUE_COLUMN}\""),
        format!("\"{ETAG_COLUMN}\""),
        format!("\"{MTIME_COLUMN}\""),
    ];
    let tag = etag(&text);
    let mut params = vec![
        SqlValue::Integer(draw.value),
        SqlValue::Text(key.to_owned()),
        SqlValue::Text(text),
        SqlValue::Text(tag),
        SqlValue::Integer(now_millis()),
    ];
    for (prop, value) in columns {
        names.push(quote_ident(&prop));
        params.push(value);
    }
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(bucket),
        names.join(", "),
        vec!["?"; names.len()].join(", ")
    );
    txn.conn()
        .execute(&sql, params_from_iter(params.iter()))
        .map_err(|err| match constraint_violation(&err) {
            Some(Constraint::Check) => {
                warn!(
                    bucket = %bucket,
                    column = column.name(),
                    value = draw.value,
                    "identifier column capacity exhausted"
                );
                BucketError::CapacityExceeded {
                    bucket: bucket.to_owned(),
                    column: column.name(),
                    value: draw.value,
                    max: column.capacity(),
                }
            }
            _ => storage_err(bucket, err),
        })?;
    Ok(ObjectId(draw.value))
}

/// Reads the object at `key`.
pub(crate) fn get(conn: &Connection, schema: &BucketSchema, key: &str) -> Result<ObjectRecord> {
    let bucket = schema.name();
    fetch_by_key(conn, bucket, key)?
        .ok_or_else(|| not_found(bucket, key))?
        .into_record(bucket)
}

/// Removes the object at `key` once its identifier has been validated.
pub(crate) fn delete(conn: &Connection, schema: &BucketSchema, key: &str) -> Result<()> {
    let bucket = schema.name();
    let row = fetch_by_key(conn, bucket, key)?.ok_or_else(|| not_found(bucket, key))?;
    row.identifier(bucket)?;
    remove(conn, bucket, &row.key)
}

fn remove(conn: &Connection, bucket: &str, key: &str) -> Result<()> {
    let sql = format!(
        "DELETE FROM {} WHERE \"{KEY_COLUMN}\" = ?1",
        quote_ident(bucket)
    );
    conn.execute(&sql, [key])
        .map_err(|err| storage_err(bucket, err))?;
    Ok(())
}

/// Runs a filtered, optionally sorted and paginated read.
///
/// Rows are fetched while the connection is held and decoded lazily as the
/// stream is consumed.
pub(crate) fn find(
    conn: &Connection,
    schema: &BucketSchema,
    filter: &Filter,
    opts: &FindOptions,
    default_limit: u64,
) -> Result<RecordStream> {
    let predicate = compile_filter(schema, filter)?;
    let mut sql = format!(
        "SELECT * FROM {} WHERE {}",
        quote_ident(schema.name()),
        predicate.sql
    );
    if let Some(sort) = &opts.sort {
        sql.push_str(" ORDER BY ");
        let physical = physical_id_state(conn, schema.name())?;
        sql.push_str(&compile_sort(schema, sort, physical)?);
    }
    sql.push_str(" LIMIT ? OFFSET ?");
    let mut params = predicate.params;
    params.push(SqlValue::Integer(clamp(opts.limit.unwrap_or(default_limit))));
    params.push(SqlValue::Integer(clamp(opts.offset)));
    let rows = select(conn, schema.name(), &sql, &params)?;
    Ok(RecordStream::new(schema.name(), rows))
}

/// Sets `fields` on every matching object, in both the indexed columns and
/// the stored document. Returns the number of objects updated.
pub(crate) fn update_many(
    conn: &Connection,
    schema: &BucketSchema,
    fields: &serde_json::Map<String, serde_json::Value>,
    filter: &Filter,
    limit: Option<u64>,
) -> Result<u64> {
    let bucket = schema.name();
    if fields.is_empty() {
        return Err(BucketError::InvalidArgument(
            "update requires at least one field".into(),
        ));
    }
    let mut columns = Vec::with_capacity(fields.len());
    for (field, value) in fields {
        let spec = schema.property(field).ok_or_else(|| {
            BucketError::InvalidArgument(format!(
                "field '{field}' is not an indexed property of bucket '{bucket}'"
            ))
        })?;
        let bound = column_value(spec.kind, value)
            .map_err(|reason| BucketError::InvalidArgument(format!("field '{field}': {reason}")))?;
        columns.push((field.clone(), bound));
    }

    let rows = matching(conn, schema, filter, limit)?;
    for row in &rows {
        row.identifier(bucket)?;
    }
    for row in &rows {
        let mut document = row.document(bucket)?;
        let object = document
            .as_object_mut()
            .ok_or_else(|| BucketError::StorageFailure {
                message: format!("document '{}' in bucket '{bucket}' is not an object", row.key),
                retryable: false,
            })?;
        for (field, value) in fields {
            object.insert(field.clone(), value.clone());
        }
        let text = serde_json::to_string(&document)?;
        rewrite(conn, bucket, &row.key, &text, &columns)?;
    }
    debug!(bucket = %bucket, count = rows.len(), "updated objects");
    Ok(rows.len() as u64)
}

/// Removes every matching object. Returns the number removed.
pub(crate) fn delete_many(
    conn: &Connection,
    schema: &BucketSchema,
    filter: &Filter,
    limit: Option<u64>,
) -> Result<u64> {
    let bucket = schema.name();
    let rows = matching(conn, schema, filter, limit)?;
    for row in &rows {
        row.identifier(bucket)?;
    }
    for row in &rows {
        remove(conn, bucket, &row.key)?;
    }
    debug!(bucket = %bucket, count = rows.len(), "deleted objects");
    Ok(rows.len() as u64)
}

/// Applies `ops` in order inside the caller's transaction.
pub(crate) fn batch(
    txn: &mut WriteTxn<'_>,
    schemas: &BTreeMap<String, Arc<BucketSchema>>,
    ops: &[BatchOp],
) -> Result<Vec<BatchOutcome>> {
    let mut outcomes = Vec::with_capacity(ops.len());
    for op in ops {
        let schema = schemas
            .get(op.bucket())
            .ok_or_else(|| BucketError::BucketNotFound(op.bucket().to_owned()))?;
        let outcome = match op {
            BatchOp::Put { key, value, .. } => BatchOutcome::Put {
                id: put(txn, schema, key, value)?,
            },
            BatchOp::Delete { key, .. } => {
                delete(txn.conn(), schema, key)?;
                BatchOutcome::Deleted
            }
            BatchOp::UpdateMany { fields, filter, .. } => BatchOutcome::Updated {
                count: update_many(txn.conn(), schema, fields, filter, None)?,
            },
            BatchOp::DeleteMany { filter, .. } => BatchOutcome::DeletedMany {
                count: delete_many(txn.conn(), schema, filter, None)?,
            },
        };
        outcomes.push(outcome);
    }
    Ok(outcomes)
}
