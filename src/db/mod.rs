#![forbid(unsafe_code)]

//! Engine facade routing every request through the schema cache.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::catalog::{
    self, BucketConfig, BucketInfo, BucketSchema, CacheMetricsSnapshot, SchemaCache,
};
use crate::config::StoreOptions;
use crate::filter::Filter;
use crate::migrate::{self, MigrationPhase, MigrationReport, MigrationStatus};
use crate::query::executor;
use crate::query::{
    parse_filter, BatchOp, BatchOutcome, FindOptions, GetOptions, MutationOptions, ObjectRecord,
    RecordStream,
};
use crate::storage::{sequence, SequenceState, Storage};
use crate::types::{BucketError, ObjectId, Result};

mod handle;

pub use handle::AsyncBucketStore;

/// Synchronous handle to a bucket database.
///
/// Clones share the storage and the schema cache. Use
/// [`BucketStore::with_storage`] to build a handle that shares only the
/// storage, as a second process attached to the same database would.
#[derive(Clone)]
pub struct BucketStore {
    inner: Arc<Inner>,
}

struct Inner {
    storage: Arc<Storage>,
    cache: SchemaCache,
    options: StoreOptions,
}

impl BucketStore {
    /// Opens the database file at `path`.
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let storage = Storage::open(path, &options)?;
        Ok(Self::with_storage(Arc::new(storage), options))
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory(options: StoreOptions) -> Result<Self> {
        let storage = Storage::open_in_memory(&options)?;
        Ok(Self::with_storage(Arc::new(storage), options))
    }

    /// Wraps existing storage with a fresh schema cache.
    pub fn with_storage(storage: Arc<Storage>, options: StoreOptions) -> Self {
        let cache = SchemaCache::new(options.schema_cache_ttl, options.schema_cache_capacity);
        Self {
            inner: Arc::new(Inner {
                storage,
                cache,
                options,
            }),
        }
    }

    /// Underlying storage.
    pub fn storage(&self) -> &Arc<Storage> {
        &self.inner.storage
    }

    /// Options the handle was built with.
    pub fn options(&self) -> &StoreOptions {
        &self.inner.options
    }

    fn schema(&self, bucket: &str, bypass: bool) -> Result<Arc<BucketSchema>> {
        self.inner.cache.resolve(&self.inner.storage, bucket, bypass)
    }

    /// Drops the cached schema when the relation turned out to be gone.
    fn evict_missing<T>(&self, bucket: &str, outcome: Result<T>) -> Result<T> {
        if let Err(BucketError::BucketNotFound(_)) = &outcome {
            self.inner.cache.invalidate(bucket);
        }
        outcome
    }

    /// Creates a bucket with the given indexed properties.
    pub fn create_bucket(&self, name: &str, config: &BucketConfig) -> Result<BucketInfo> {
        self.inner
            .storage
            .write(|txn| catalog::create(txn.conn(), name, config))?;
        self.inner.cache.invalidate(name);
        Ok(self.schema(name, true)?.info())
    }

    /// Reads a bucket's configuration, bypassing the cache.
    pub fn get_bucket(&self, name: &str) -> Result<BucketInfo> {
        Ok(self.schema(name, true)?.info())
    }

    /// Lists every bucket.
    pub fn list_buckets(&self) -> Result<Vec<BucketInfo>> {
        self.inner.storage.read(catalog::list)
    }

    /// Drops a bucket and all of its objects.
    pub fn delete_bucket(&self, name: &str) -> Result<()> {
        let outcome = self
            .inner
            .storage
            .write(|txn| catalog::drop_bucket(txn.conn(), name));
        self.inner.cache.invalidate(name);
        outcome
    }

    /// Sets the value the bucket's identifier sequence hands out next.
    ///
    /// After migration the sequence only moves forward; a backward restart
    /// is a [`BucketError::SchemaConflict`].
    pub fn restart_identifier_sequence(&self, bucket: &str, next_value: i64) -> Result<()> {
        self.inner
            .storage
            .write(|txn| sequence::restart(txn.conn(), bucket, next_value))?;
        info!(bucket = %bucket, next_value, "restarted identifier sequence");
        Ok(())
    }

    /// Current state of the bucket's identifier sequence.
    pub fn sequence_state(&self, bucket: &str) -> Result<SequenceState> {
        self.inner
            .storage
            .read(|conn| sequence::state(conn, bucket))
    }

    /// Inserts or replaces the object at `key`, returning its identifier.
    pub fn put(&self, bucket: &str, key: &str, document: &serde_json::Value) -> Result<ObjectId> {
        let schema = self.schema(bucket, false)?;
        let outcome = self
            .inner
            .storage
            .write(|txn| executor::put(txn, &schema, key, document));
        self.evict_missing(bucket, outcome)
    }

    /// Reads the object at `key`.
    pub fn get(&self, bucket: &str, key: &str, opts: GetOptions) -> Result<ObjectRecord> {
        let schema = self.schema(bucket, opts.no_bucket_cache)?;
        let outcome = self
            .inner
            .storage
            .read(|conn| executor::get(conn, &schema, key));
        self.evict_missing(bucket, outcome)
    }

    /// Removes the object at `key`.
    pub fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let schema = self.schema(bucket, false)?;
        let outcome = self
            .inner
            .storage
            .write(|txn| executor::delete(txn.conn(), &schema, key));
        self.evict_missing(bucket, outcome)
    }

    /// Runs a filtered read. `filter` uses the textual filter syntax.
    pub fn find(&self, bucket: &str, filter: &str, opts: &FindOptions) -> Result<RecordStream> {
        self.find_filter(bucket, &parse_filter(filter)?, opts)
    }

    /// Runs a filtered read with an already-parsed filter.
    pub fn find_filter(
        &self,
        bucket: &str,
        filter: &Filter,
        opts: &FindOptions,
    ) -> Result<RecordStream> {
        let schema = self.schema(bucket, opts.no_bucket_cache)?;
        let limit = self.inner.options.default_find_limit;
        let outcome = self
            .inner
            .storage
            .read(|conn| executor::find(conn, &schema, filter, opts, limit));
        self.evict_missing(bucket, outcome)
    }

    /// Sets `fields` on every object matching `filter`.
    pub fn update_many(
        &self,
        bucket: &str,
        fields: &serde_json::Map<String, serde_json::Value>,
        filter: &str,
        opts: MutationOptions,
    ) -> Result<u64> {
        let filter = parse_filter(filter)?;
        let schema = self.schema(bucket, opts.no_bucket_cache)?;
        let outcome = self.inner.storage.write(|txn| {
            executor::update_many(txn.conn(), &schema, fields, &filter, opts.limit)
        });
        self.evict_missing(bucket, outcome)
    }

    /// Removes every object matching `filter`.
    pub fn delete_many(&self, bucket: &str, filter: &str, opts: MutationOptions) -> Result<u64> {
        let filter = parse_filter(filter)?;
        let schema = self.schema(bucket, opts.no_bucket_cache)?;
        let outcome = self
            .inner
            .storage
            .write(|txn| executor::delete_many(txn.conn(), &schema, &filter, opts.limit));
        self.evict_missing(bucket, outcome)
    }

    /// Applies `ops` in order as one all-or-nothing unit.
    pub fn batch(&self, ops: &[BatchOp]) -> Result<Vec<BatchOutcome>> {
        let mut schemas = BTreeMap::new();
        for op in ops {
            if !schemas.contains_key(op.bucket()) {
                schemas.insert(op.bucket().to_owned(), self.schema(op.bucket(), false)?);
            }
        }
        let outcome = self
            .inner
            .storage
            .write(|txn| executor::batch(txn, &schemas, ops));
        if let Err(err) = &outcome {
            warn!(operations = ops.len(), error = %err, "batch rolled back");
            if let BucketError::BucketNotFound(missing) = err {
                self.inner.cache.invalidate(missing);
            }
        }
        outcome
    }

    /// Widens the bucket's identifier column; safe to re-run.
    pub fn migrate_identifier_column(&self, bucket: &str) -> Result<MigrationReport> {
        migrate::migrate(&self.inner.storage, &self.inner.cache, bucket)
    }

    /// Migration phase of `bucket`, read from storage.
    pub fn migration_phase(&self, bucket: &str) -> Result<MigrationPhase> {
        migrate::phase(&self.inner.storage, bucket)
    }

    /// Migration phase together with the sequence state.
    pub fn migration_status(&self, bucket: &str) -> Result<MigrationStatus> {
        migrate::status(&self.inner.storage, bucket)
    }

    /// Forgets the cached schema of `bucket`.
    pub fn invalidate_schema(&self, bucket: &str) {
        self.inner.cache.invalidate(bucket);
    }

    /// Schema cache counters.
    pub fn cache_metrics(&self) -> CacheMetricsSnapshot {
        self.inner.cache.metrics_snapshot()
    }
}
