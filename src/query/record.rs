//! Row decoding and the record stream returned by `find`.
//!
//! Rows are read with `SELECT *`, and the logical identifier is taken from
//! whichever identifier columns the statement actually returned. A caller
//! holding a schema resolved before migration therefore still decodes rows
//! written after it.

use rusqlite::types::ValueRef;
use rusqlite::{Row, Statement};
use serde::Serialize;
use tracing::warn;

use crate::catalog::{ETAG_COLUMN, KEY_COLUMN, MTIME_COLUMN, VALUE_COLUMN};
use crate::types::ident::validate;
use crate::types::{BucketError, IdColumn, ObjectId, Result};

/// Object as returned to callers.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ObjectRecord {
    /// Bucket holding the object.
    pub bucket: String,
    /// Object key.
    pub key: String,
    /// Logical identifier.
    pub id: ObjectId,
    /// Document payload.
    pub value: serde_json::Value,
    /// Content hash of the payload.
    pub etag: String,
    /// Last write, in milliseconds since the epoch.
    pub mtime: i64,
}

pub(crate) struct RowLayout {
    legacy: Option<usize>,
    wide: Option<usize>,
    key: usize,
    value: usize,
    etag: usize,
    mtime: usize,
}

impl RowLayout {
    pub(crate) fn of(bucket: &str, stmt: &Statement<'_>) -> Result<Self> {
        let names = stmt.column_names();
        let find = |name: &str| names.iter().position(|column| *column == name);
        let require = |name: &str| {
            find(name).ok_or_else(|| BucketError::StorageFailure {
                message: format!("bucket '{bucket}' relation lacks column {name}"),
                retryable: false,
            })
        };
        Ok(Self {
            legacy: find(IdColumn::Legacy.name()),
            wide: find(IdColumn::Wide.name()),
            key: require(KEY_COLUMN)?,
            value: require(VALUE_COLUMN)?,
            etag: require(ETAG_COLUMN)?,
            mtime: require(MTIME_COLUMN)?,
        })
    }
}

#[derive(Clone, Debug)]
enum RawId {
    Missing,
    Int(i64),
    Other(String),
}

impl RawId {
    fn read(row: &Row<'_>, idx: Option<usize>) -> rusqlite::Result<Self> {
        let Some(idx) = idx else {
            return Ok(RawId::Missing);
        };
        Ok(match row.get_ref(idx)? {
            ValueRef::Null => RawId::Missing,
            ValueRef::Integer(value) => RawId::Int(value),
            ValueRef::Real(value) => RawId::Other(value.to_string()),
            ValueRef::Text(text) | ValueRef::Blob(text) => {
                RawId::Other(String::from_utf8_lossy(text).into_owned())
            }
        })
    }
}

/// Undecoded row; identifier validation happens on conversion.
#[derive(Clone, Debug)]
pub(crate) struct RawRow {
    pub(crate) key: String,
    value: String,
    etag: String,
    mtime: i64,
    legacy: RawId,
    wide: RawId,
}

impl RawRow {
    pub(crate) fn read(row: &Row<'_>, layout: &RowLayout) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(layout.key)?,
            value: row.get(layout.value)?,
            etag: row.get(layout.etag)?,
            mtime: row.get(layout.mtime)?,
            legacy: RawId::read(row, layout.legacy)?,
            wide: RawId::read(row, layout.wide)?,
        })
    }

    /// Logical identifier: the legacy value when present, else the wide one.
    pub(crate) fn identifier(&self, bucket: &str) -> Result<ObjectId> {
        for (column, raw) in [
            (IdColumn::Legacy, &self.legacy),
            (IdColumn::Wide, &self.wide),
        ] {
            match raw {
                RawId::Int(value) => return validate(bucket, column, *value),
                RawId::Other(text) => {
                    return Err(BucketError::invalid_identifier(bucket, column.name(), text))
                }
                RawId::Missing => {}
            }
        }
        Err(BucketError::invalid_identifier(
            bucket,
            IdColumn::Legacy.name(),
            "null",
        ))
    }

    pub(crate) fn document(&self, bucket: &str) -> Result<serde_json::Value> {
        serde_json::from_str(&self.value).map_err(|err| BucketError::StorageFailure {
            message: format!(
                "document '{}' in bucket '{bucket}' is unreadable: {err}",
                self.key
            ),
            retryable: false,
        })
    }

    pub(crate) fn into_record(self, bucket: &str) -> Result<ObjectRecord> {
        let id = self.identifier(bucket)?;
        let value = self.document(bucket)?;
        Ok(ObjectRecord {
            bucket: bucket.to_owned(),
            key: self.key,
            id,
            value,
            etag: self.etag,
            mtime: self.mtime,
        })
    }
}

/// Finite, non-restartable sequence of matching records.
///
/// Yields one item per row. A row that cannot be surfaced ends the stream
/// with its error; nothing follows it.
#[derive(Debug)]
pub struct RecordStream {
    bucket: String,
    rows: std::vec::IntoIter<RawRow>,
    failed: bool,
}

impl RecordStream {
    pub(crate) fn new(bucket: &str, rows: Vec<RawRow>) -> Self {
        Self {
            bucket: bucket.to_owned(),
            rows: rows.into_iter(),
            failed: false,
        }
    }

    /// Bucket the stream reads from.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Drains the stream, stopping at the first error.
    pub fn into_records(self) -> Result<Vec<ObjectRecord>> {
        self.collect()
    }
}

impl Iterator for RecordStream {
    type Item = Result<ObjectRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let record = self.rows.next()?.into_record(&self.bucket);
        if let Err(err) = &record {
            warn!(bucket = %self.bucket, error = %err, "terminating record stream");
            self.failed = true;
        }
        Some(record)
    }
}
