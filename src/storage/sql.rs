//! Small helpers for building statements and classifying substrate errors.

use rusqlite::ffi;
use time::OffsetDateTime;

/// Quotes an identifier for interpolation into statement text.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Constraint families the engine reports distinctly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Constraint {
    Check,
    Unique,
}

pub(crate) fn constraint_violation(err: &rusqlite::Error) -> Option<Constraint> {
    match err {
        rusqlite::Error::SqliteFailure(inner, _) => match inner.extended_code {
            ffi::SQLITE_CONSTRAINT_CHECK => Some(Constraint::Check),
            ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                Some(Constraint::Unique)
            }
            _ => None,
        },
        _ => None,
    }
}

fn failure_message(err: &rusqlite::Error) -> Option<&str> {
    match err {
        rusqlite::Error::SqliteFailure(_, Some(msg)) => Some(msg.as_str()),
        _ => None,
    }
}

/// Statement referenced a relation that no longer exists.
pub(crate) fn is_missing_table(err: &rusqlite::Error) -> bool {
    failure_message(err).is_some_and(|msg| msg.starts_with("no such table"))
}

/// DDL collided with an existing column or index.
pub(crate) fn is_duplicate_object(err: &rusqlite::Error) -> bool {
    failure_message(err).is_some_and(|msg| {
        msg.starts_with("duplicate column name") || msg.contains("already exists")
    })
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
