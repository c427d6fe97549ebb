//! Document buckets over SQLite with an online, two-column identifier space.
//!
//! A bucket starts with a 32-bit identifier column. [`BucketStore::migrate_identifier_column`]
//! adds a 64-bit column and moves the sequence default to it without
//! rewriting rows. Reads, range filters, sorts and bulk mutations treat the
//! two columns as one identifier space from then on.
//!
//! ```no_run
//! use sombra_bucket::{BucketConfig, BucketStore, FindOptions, Sort, StoreOptions};
//!
//! # fn main() -> sombra_bucket::Result<()> {
//! let store = BucketStore::open("buckets.db", StoreOptions::default())?;
//! store.create_bucket("events", &BucketConfig::new())?;
//! store.put("events", "first", &serde_json::json!({"kind": "boot"}))?;
//! store.migrate_identifier_column("events")?;
//! for record in store.find("events", "_id>=1", &FindOptions::default().sort(Sort::asc("_id")))? {
//!     println!("{}", record?.id);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod catalog;
pub mod config;
pub mod db;
pub mod filter;
pub mod logging;
pub mod migrate;
pub mod query;
pub mod storage;
pub mod types;

pub use catalog::{BucketConfig, BucketInfo, IdState, IndexSpec, PropertyType};
pub use config::{FileConfig, StoreOptions};
pub use db::{AsyncBucketStore, BucketStore};
pub use filter::Filter;
pub use migrate::{MigrationPhase, MigrationReport, MigrationStatus, MigrationStep};
pub use query::{
    BatchOp, BatchOutcome, FindOptions, GetOptions, MutationOptions, ObjectRecord, RecordStream,
    Sort, SortOrder,
};
pub use types::{BucketError, IdColumn, ObjectId, Result};
