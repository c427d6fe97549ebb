//! Request options shared by the read and mutation paths.

use serde::{Deserialize, Serialize};

/// Sort direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Smallest first.
    #[default]
    Asc,
    /// Largest first.
    Desc,
}

/// Sort specification for `find`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    /// Attribute to order by.
    pub attribute: String,
    /// Direction.
    #[serde(default)]
    pub order: SortOrder,
}

impl Sort {
    /// Ascending sort on `attribute`.
    pub fn asc(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            order: SortOrder::Asc,
        }
    }

    /// Descending sort on `attribute`.
    pub fn desc(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            order: SortOrder::Desc,
        }
    }
}

/// Options for `find`.
#[derive(Clone, Debug, Default)]
pub struct FindOptions {
    /// Result ordering; unspecified when `None`.
    pub sort: Option<Sort>,
    /// Maximum rows returned; the store default applies when `None`.
    pub limit: Option<u64>,
    /// Rows skipped before the first returned row.
    pub offset: u64,
    /// Re-read bucket metadata instead of trusting the schema cache.
    pub no_bucket_cache: bool,
}

impl FindOptions {
    /// Sets the sort.
    pub fn sort(mut self, sort: Sort) -> Self {
        self.sort = Some(sort);
        self
    }

    /// Sets the row limit.
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the row offset.
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Bypasses the schema cache.
    pub fn no_bucket_cache(mut self) -> Self {
        self.no_bucket_cache = true;
        self
    }
}

/// Options for `get`.
#[derive(Clone, Copy, Debug, Default)]
pub struct GetOptions {
    /// Re-read bucket metadata instead of trusting the schema cache.
    pub no_bucket_cache: bool,
}

/// Options for `update_many` and `delete_many`.
#[derive(Clone, Copy, Debug, Default)]
pub struct MutationOptions {
    /// Maximum rows affected; unbounded when `None`.
    pub limit: Option<u64>,
    /// Re-read bucket metadata instead of trusting the schema cache.
    pub no_bucket_cache: bool,
}
