#![forbid(unsafe_code)]

//! Online widening of a bucket's identifier column.
//!
//! The migration is a sequence of additive steps, each run in its own
//! committed transaction:
//!
//! 1. add the nullable `_idx` column,
//! 2. add a partial unique index over its non-null values,
//! 3. rebind the sequence default from `_id` to `_idx`,
//! 4. refresh the local schema cache.
//!
//! Every step re-inspects the physical relation inside its transaction and
//! is skipped when already applied, so an interrupted migration can simply
//! be re-run. Only step 3 changes write behavior.

use std::fmt;

use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info};

use crate::catalog::{table_columns, SchemaCache};
use crate::storage::sequence::{self, SequenceState};
use crate::storage::sql::{is_duplicate_object, is_missing_table, quote_ident};
use crate::storage::Storage;
use crate::types::{BucketError, IdColumn, Result};

/// Position of a bucket in the migration state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    /// Identifiers live in `_id` only.
    Narrow,
    /// The wide column exists but is not indexed.
    ColumnAdded,
    /// The wide column is indexed; inserts still use `_id`.
    IndexAdded,
    /// Inserts populate `_idx`.
    Split,
}

/// One step of the migration protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStep {
    /// `ALTER TABLE .. ADD COLUMN _idx`.
    AddWideColumn,
    /// Partial unique index over non-null `_idx` values.
    AddWideIndex,
    /// Rebind the sequence default to `_idx`.
    MoveSequenceDefault,
    /// Re-resolve the bucket in the local schema cache.
    RefreshSchemaCache,
}

impl fmt::Display for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MigrationStep::AddWideColumn => "add-wide-column",
            MigrationStep::AddWideIndex => "add-wide-index",
            MigrationStep::MoveSequenceDefault => "move-sequence-default",
            MigrationStep::RefreshSchemaCache => "refresh-schema-cache",
        };
        f.write_str(name)
    }
}

/// Outcome of a completed migration run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Migrated bucket.
    pub bucket: String,
    /// Steps this run performed.
    pub applied: Vec<MigrationStep>,
    /// Steps found already in place.
    pub skipped: Vec<MigrationStep>,
    /// Phase after the run.
    pub phase: MigrationPhase,
}

/// Inspection result for `migration-status`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    /// Inspected bucket.
    pub bucket: String,
    /// Current phase.
    pub phase: MigrationPhase,
    /// Identifier sequence state.
    pub sequence: SequenceState,
}

pub(crate) fn wide_index_name(bucket: &str) -> String {
    format!("{bucket}__idx_idx")
}

#[derive(Debug)]
enum IndexShape {
    Missing,
    Expected,
    Unexpected(String),
}

#[derive(Debug)]
struct PhysicalState {
    wide_type: Option<String>,
    wide_index: IndexShape,
    sequence: SequenceState,
}

fn inspect(conn: &Connection, bucket: &str) -> Result<PhysicalState> {
    let columns = table_columns(conn, bucket)?;
    if columns.is_empty() {
        return Err(BucketError::BucketNotFound(bucket.to_owned()));
    }
    let sequence = sequence::state(conn, bucket)?;
    let index_name = wide_index_name(bucket);
    let listed: Option<(bool, bool)> = conn
        .query_row(
            "SELECT \"unique\", partial FROM pragma_index_list(?1) WHERE name = ?2",
            [bucket, index_name.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let wide_index = match listed {
        None => IndexShape::Missing,
        Some((unique, partial)) => {
            let mut stmt = conn.prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")?;
            let indexed = stmt
                .query_map([index_name.as_str()], |row| row.get::<_, Option<String>>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let expected = [Some(IdColumn::Wide.name().to_owned())];
            if indexed == expected && unique && partial {
                IndexShape::Expected
            } else {
                IndexShape::Unexpected(format!(
                    "index {index_name} exists but is not a partial unique index on {}",
                    IdColumn::Wide.name()
                ))
            }
        }
    };
    Ok(PhysicalState {
        wide_type: columns.get(IdColumn::Wide.name()).cloned(),
        wide_index,
        sequence,
    })
}

impl PhysicalState {
    fn target(&self) -> Option<IdColumn> {
        self.sequence
            .target_column
            .as_deref()
            .and_then(IdColumn::from_name)
    }

    /// Rejects physical state no step of the protocol could have produced.
    fn check(&self, bucket: &str) -> Result<()> {
        if let Some(kind) = &self.wide_type {
            if !kind.eq_ignore_ascii_case("INTEGER") {
                return Err(BucketError::schema_conflict(
                    bucket,
                    format!("column {} exists with type '{kind}'", IdColumn::Wide.name()),
                ));
            }
        }
        if let IndexShape::Unexpected(detail) = &self.wide_index {
            return Err(BucketError::schema_conflict(bucket, detail.clone()));
        }
        match (self.target(), &self.sequence.target_column) {
            (Some(IdColumn::Wide), _) if self.wide_type.is_none() => Err(
                BucketError::schema_conflict(bucket, "sequence default bound to a missing column"),
            ),
            (Some(_), _) => Ok(()),
            (None, Some(other)) => Err(BucketError::schema_conflict(
                bucket,
                format!("sequence default bound to unknown column '{other}'"),
            )),
            (None, None) => Err(BucketError::schema_conflict(
                bucket,
                "identifier sequence has no default column",
            )),
        }
    }

    fn phase(&self) -> MigrationPhase {
        let indexed = matches!(self.wide_index, IndexShape::Expected);
        match (self.wide_type.is_some(), indexed, self.target()) {
            (true, true, Some(IdColumn::Wide)) => MigrationPhase::Split,
            (true, true, _) => MigrationPhase::IndexAdded,
            (true, false, _) => MigrationPhase::ColumnAdded,
            _ => MigrationPhase::Narrow,
        }
    }

    fn is_applied(&self, step: MigrationStep) -> bool {
        match step {
            MigrationStep::AddWideColumn => self.wide_type.is_some(),
            MigrationStep::AddWideIndex => matches!(self.wide_index, IndexShape::Expected),
            MigrationStep::MoveSequenceDefault => self.target() == Some(IdColumn::Wide),
            MigrationStep::RefreshSchemaCache => false,
        }
    }
}

fn ddl(conn: &Connection, bucket: &str, sql: &str) -> Result<()> {
    conn.execute_batch(sql).map_err(|err| {
        if is_duplicate_object(&err) {
            BucketError::schema_conflict(bucket, err.to_string())
        } else if is_missing_table(&err) {
            BucketError::BucketNotFound(bucket.to_owned())
        } else {
            err.into()
        }
    })
}

fn apply(conn: &Connection, bucket: &str, step: MigrationStep) -> Result<()> {
    let table = quote_ident(bucket);
    let wide = quote_ident(IdColumn::Wide.name());
    match step {
        MigrationStep::AddWideColumn => {
            ddl(conn, bucket, &format!("ALTER TABLE {table} ADD COLUMN {wide} INTEGER"))
        }
        MigrationStep::AddWideIndex => ddl(
            conn,
            bucket,
            &format!(
                "CREATE UNIQUE INDEX {} ON {table} ({wide}) WHERE {wide} IS NOT NULL",
                quote_ident(&wide_index_name(bucket))
            ),
        ),
        MigrationStep::MoveSequenceDefault => {
            if sequence::move_default(conn, bucket, IdColumn::Legacy, IdColumn::Wide)? {
                Ok(())
            } else {
                Err(BucketError::schema_conflict(
                    bucket,
                    "sequence default is not bound to _id",
                ))
            }
        }
        MigrationStep::RefreshSchemaCache => Ok(()),
    }
}

/// Runs one DDL step in its own transaction. Returns whether it was applied.
fn run_step(storage: &Storage, bucket: &str, step: MigrationStep) -> Result<bool> {
    storage.write(|txn| {
        let state = inspect(txn.conn(), bucket)?;
        state.check(bucket)?;
        if state.is_applied(step) {
            return Ok(false);
        }
        if step == MigrationStep::MoveSequenceDefault && state.phase() != MigrationPhase::IndexAdded
        {
            return Err(BucketError::schema_conflict(
                bucket,
                format!("cannot {step} in phase {:?}", state.phase()),
            ));
        }
        apply(txn.conn(), bucket, step)?;
        Ok(true)
    })
}

/// Migrates `bucket` to the split identifier layout.
pub(crate) fn migrate(
    storage: &Storage,
    cache: &SchemaCache,
    bucket: &str,
) -> Result<MigrationReport> {
    let mut report = MigrationReport {
        bucket: bucket.to_owned(),
        applied: Vec::new(),
        skipped: Vec::new(),
        phase: MigrationPhase::Narrow,
    };
    for step in [
        MigrationStep::AddWideColumn,
        MigrationStep::AddWideIndex,
        MigrationStep::MoveSequenceDefault,
    ] {
        if run_step(storage, bucket, step)? {
            info!(bucket = %bucket, step = %step, "applied migration step");
            report.applied.push(step);
        } else {
            debug!(bucket = %bucket, step = %step, "migration step already applied");
            report.skipped.push(step);
        }
    }

    cache.invalidate(bucket);
    let schema = cache.resolve(storage, bucket, true)?;
    info!(bucket = %bucket, id_state = ?schema.id_state(), "refreshed schema after migration");
    report.applied.push(MigrationStep::RefreshSchemaCache);
    report.phase = phase(storage, bucket)?;
    Ok(report)
}

/// Current phase of `bucket`, read from the relation.
pub(crate) fn phase(storage: &Storage, bucket: &str) -> Result<MigrationPhase> {
    Ok(status(storage, bucket)?.phase)
}

/// Phase plus sequence state of `bucket`.
pub(crate) fn status(storage: &Storage, bucket: &str) -> Result<MigrationStatus> {
    storage.read(|conn| {
        let state = inspect(conn, bucket)?;
        state.check(bucket)?;
        Ok(MigrationStatus {
            bucket: bucket.to_owned(),
            phase: state.phase(),
            sequence: state.sequence,
        })
    })
}
