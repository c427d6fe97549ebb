//! Identifier representation and range validation.
//!
//! A bucket's logical identifier may live in one of two physical columns. The
//! narrow column (`_id`) is capped at the 32-bit signed range; the wide column
//! (`_idx`) holds any 64-bit value. Regardless of storage capacity, callers
//! only ever receive identifiers within `±(2^53 - 1)`, the range a double can
//! hold exactly.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{BucketError, Result};

/// Largest integer callers can represent without precision loss.
pub const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

/// Smallest integer callers can represent without precision loss.
pub const MIN_SAFE_INTEGER: i64 = -MAX_SAFE_INTEGER;

/// Largest value the narrow identifier column accepts.
pub const NARROW_MAX: i64 = i32::MAX as i64;

/// Smallest value the narrow identifier column accepts.
pub const NARROW_MIN: i64 = i32::MIN as i64;

/// Logical object identifier, already validated against the safe range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub i64);

impl ObjectId {
    /// Raw integer value.
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical column holding a logical identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IdColumn {
    /// Frozen 32-bit column populated before migration.
    Legacy,
    /// 64-bit column populated after migration.
    Wide,
}

impl IdColumn {
    /// Column name in the bucket relation.
    pub const fn name(self) -> &'static str {
        match self {
            IdColumn::Legacy => "_id",
            IdColumn::Wide => "_idx",
        }
    }

    /// Largest value the column can store.
    pub const fn capacity(self) -> i64 {
        match self {
            IdColumn::Legacy => NARROW_MAX,
            IdColumn::Wide => i64::MAX,
        }
    }

    /// Parses a column name as stored in the sequence metadata.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "_id" => Some(IdColumn::Legacy),
            "_idx" => Some(IdColumn::Wide),
            _ => None,
        }
    }
}

/// Returns `true` when `value` lies within the caller-representable range.
pub fn is_representable(value: i64) -> bool {
    (MIN_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&value)
}

/// Checks a raw identifier read from `column` of `bucket`.
pub fn validate(bucket: &str, column: IdColumn, raw: i64) -> Result<ObjectId> {
    if is_representable(raw) {
        Ok(ObjectId(raw))
    } else {
        Err(BucketError::invalid_identifier(bucket, column.name(), raw))
    }
}
