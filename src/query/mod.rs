#![forbid(unsafe_code)]

//! Object reads and mutations over resolved bucket schemas.
//!
//! Filters are compiled by [`translate`] against the schema in hand and run
//! by the executor. Row decoding lives in [`record`].

pub(crate) mod executor;

/// Request options for reads and bulk mutations.
pub mod options;

/// Result rows and the streaming `find` iterator.
pub mod record;

/// Filter and sort compilation to SQL.
pub mod translate;

pub use executor::{BatchOp, BatchOutcome};
pub use options::{FindOptions, GetOptions, MutationOptions, Sort, SortOrder};
pub use record::{ObjectRecord, RecordStream};
pub use translate::{compile_filter, compile_sort, Predicate};

use crate::filter::{self, Filter};
use crate::types::{BucketError, Result};

/// Parses filter text, reporting failures as [`BucketError::PredicateError`].
pub fn parse_filter(text: &str) -> Result<Filter> {
    filter::parse(text).map_err(|err| BucketError::predicate(text, err.to_string()))
}
