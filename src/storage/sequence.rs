//! Per-bucket identifier sequences.
//!
//! Each bucket owns one row in `bucket_sequences`. `target_column` plays the
//! role of a column default: it names the identifier column that receives
//! freshly drawn values.

use std::collections::BTreeMap;

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::types::{BucketError, IdColumn, Result};

/// Value handed out by [`draw`].
#[derive(Clone, Debug)]
pub(crate) struct SequenceDraw {
    pub(crate) value: i64,
    pub(crate) target: Option<String>,
}

impl SequenceDraw {
    /// Column the drawn value must be written to.
    pub(crate) fn column(&self, bucket: &str) -> Result<IdColumn> {
        match self.target.as_deref() {
            Some(name) => IdColumn::from_name(name).ok_or_else(|| {
                BucketError::schema_conflict(
                    bucket,
                    format!("sequence default bound to unknown column '{name}'"),
                )
            }),
            None => Err(BucketError::schema_conflict(
                bucket,
                "identifier sequence has no default column",
            )),
        }
    }
}

/// Snapshot of a bucket's sequence row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SequenceState {
    /// Value the next draw returns.
    pub next_value: i64,
    /// Step between draws.
    pub increment: i64,
    /// Column currently fed by the sequence.
    pub target_column: Option<String>,
}

pub(crate) fn create(conn: &Connection, bucket: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO bucket_sequences (bucket, next_value, increment, target_column)
         VALUES (?1, 1, 1, ?2)",
        params![bucket, IdColumn::Legacy.name()],
    )?;
    Ok(())
}

pub(crate) fn drop_sequence(conn: &Connection, bucket: &str) -> Result<()> {
    conn.execute("DELETE FROM bucket_sequences WHERE bucket = ?1", [bucket])?;
    Ok(())
}

pub(crate) fn state(conn: &Connection, bucket: &str) -> Result<SequenceState> {
    conn.query_row(
        "SELECT next_value, increment, target_column FROM bucket_sequences WHERE bucket = ?1",
        [bucket],
        |row| {
            Ok(SequenceState {
                next_value: row.get(0)?,
                increment: row.get(1)?,
                target_column: row.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| BucketError::BucketNotFound(bucket.to_owned()))
}

pub(crate) fn draw(conn: &Connection, bucket: &str) -> Result<SequenceDraw> {
    let current = state(conn, bucket)?;
    let next = current
        .next_value
        .checked_add(current.increment)
        .ok_or_else(|| BucketError::CapacityExceeded {
            bucket: bucket.to_owned(),
            column: IdColumn::Wide.name(),
            value: current.next_value,
            max: i64::MAX,
        })?;
    conn.execute(
        "UPDATE bucket_sequences SET next_value = ?2 WHERE bucket = ?1",
        params![bucket, next],
    )?;
    Ok(SequenceDraw {
        value: current.next_value,
        target: current.target_column,
    })
}

/// Equivalent of `ALTER SEQUENCE .. RESTART WITH next_value`.
///
/// Once the sequence feeds the wide column it may only move forward: the
/// legacy and wide columns carry separate unique indexes, so a backward
/// restart would hand out logical identifiers that already exist.
pub(crate) fn restart(conn: &Connection, bucket: &str, next_value: i64) -> Result<()> {
    let current = state(conn, bucket)?;
    let feeds_wide = current.target_column.as_deref() == Some(IdColumn::Wide.name());
    if feeds_wide && next_value < current.next_value {
        return Err(BucketError::schema_conflict(
            bucket,
            format!(
                "sequence feeds {} and cannot restart backward from {} to {next_value}",
                IdColumn::Wide.name(),
                current.next_value
            ),
        ));
    }
    conn.execute(
        "UPDATE bucket_sequences SET next_value = ?2 WHERE bucket = ?1",
        params![bucket, next_value],
    )?;
    Ok(())
}

/// Rebinds the sequence default from `from` to `to`. Returns `false` when the
/// default was not bound to `from`.
pub(crate) fn move_default(
    conn: &Connection,
    bucket: &str,
    from: IdColumn,
    to: IdColumn,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE bucket_sequences SET target_column = ?3
         WHERE bucket = ?1 AND target_column = ?2",
        params![bucket, from.name(), to.name()],
    )?;
    Ok(changed == 1)
}

/// Moves each sequence past the highest value drawn in a rolled-back write.
pub(crate) fn reapply(conn: &Connection, consumed: &BTreeMap<String, i64>) -> Result<()> {
    let mut stmt = conn.prepare(
        "UPDATE bucket_sequences SET next_value = MAX(next_value, ?2 + increment)
         WHERE bucket = ?1",
    )?;
    for (bucket, high) in consumed {
        stmt.execute(params![bucket, high])?;
    }
    Ok(())
}
