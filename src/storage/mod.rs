#![forbid(unsafe_code)]

//! Relational substrate the bucket engine issues statements against.
//!
//! A [`Storage`] owns one SQLite connection behind a mutex. Reads run as
//! single statements on the shared connection; writes run inside
//! [`Storage::write`], which wraps the closure in a `BEGIN IMMEDIATE`
//! transaction and commits or rolls back as a unit. Sequence values drawn
//! inside a write survive a rollback, matching the non-transactional
//! behavior of a relational sequence generator.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, warn};

use crate::config::StoreOptions;
use crate::types::{BucketError, Result};

pub(crate) mod sequence;
pub(crate) mod sql;

pub use sequence::SequenceState;

pub(crate) const BOOTSTRAP_SQL: &str = "
CREATE TABLE IF NOT EXISTS buckets_config (
    name TEXT PRIMARY KEY,
    index_json TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 0,
    mtime INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS bucket_sequences (
    bucket TEXT PRIMARY KEY,
    next_value INTEGER NOT NULL,
    increment INTEGER NOT NULL DEFAULT 1,
    target_column TEXT
);
";

/// Shared handle to the relational substrate.
pub struct Storage {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Storage {
    /// Opens (creating if needed) a file-backed database.
    pub fn open(path: impl AsRef<Path>, opts: &StoreOptions) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "synchronous", opts.synchronous.pragma_value())?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(path = %path.display(), journal_mode = %mode, "opened bucket database");
        Self::init(conn, Some(path.to_path_buf()), opts)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory(opts: &StoreOptions) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, None, opts)
    }

    fn init(conn: Connection, path: Option<PathBuf>, opts: &StoreOptions) -> Result<Self> {
        conn.busy_timeout(opts.busy_timeout)?;
        conn.execute_batch(BOOTSTRAP_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Path of the backing file, `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Runs statements outside of an explicit transaction.
    pub(crate) fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Runs `f` inside one immediate transaction.
    ///
    /// The transaction commits when `f` returns `Ok` and rolls back otherwise.
    /// Whenever the write does not commit, including a failed `COMMIT`, every
    /// sequence advanced through [`WriteTxn::next_value`] is moved past the
    /// values it handed out.
    pub(crate) fn write<T>(&self, f: impl FnOnce(&mut WriteTxn<'_>) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock();
        let (outcome, consumed) = {
            let tx = guard.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut txn = WriteTxn {
                tx,
                consumed: BTreeMap::new(),
            };
            let outcome = f(&mut txn);
            let WriteTxn { tx, consumed } = txn;
            let outcome = match outcome {
                Ok(value) => tx.commit().map(|()| value).map_err(|err| {
                    warn!(error = %err, "commit failed");
                    BucketError::from(err)
                }),
                Err(err) => {
                    if let Err(rollback_err) = tx.rollback() {
                        warn!(error = %rollback_err, "rollback failed");
                    }
                    Err(err)
                }
            };
            (outcome, consumed)
        };
        if outcome.is_err() && !consumed.is_empty() {
            if let Err(reapply_err) = sequence::reapply(&guard, &consumed) {
                warn!(error = %reapply_err, "failed to preserve consumed sequence values");
            }
        }
        outcome
    }

    /// Executes raw SQL against the substrate, bypassing every engine check.
    ///
    /// Intended for operators repairing rows out of band.
    pub fn execute_unchecked(&self, sql: &str) -> Result<usize> {
        self.read(|conn| Ok(conn.execute(sql, [])?))
    }
}

/// An open write transaction.
pub(crate) struct WriteTxn<'c> {
    tx: Transaction<'c>,
    consumed: BTreeMap<String, i64>,
}

impl WriteTxn<'_> {
    /// Connection view of the transaction.
    pub(crate) fn conn(&self) -> &Connection {
        &self.tx
    }

    /// Draws the next value from the bucket's sequence.
    pub(crate) fn next_value(&mut self, bucket: &str) -> Result<sequence::SequenceDraw> {
        let draw = sequence::draw(&self.tx, bucket)?;
        self.consumed
            .entry(bucket.to_owned())
            .and_modify(|high| *high = (*high).max(draw.value))
            .or_insert(draw.value);
        Ok(draw)
    }
}
