//! Time-bounded cache of resolved bucket schemas.
//!
//! Entries are immutable `Arc<BucketSchema>` values replaced as a whole, so a
//! concurrent resolution can only ever be superseded by a newer one. The
//! mutex is never held while storage is queried.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use super::{load, BucketSchema};
use crate::storage::Storage;
use crate::types::Result;

/// Per-bucket schema cache with expiry and explicit bypass.
pub struct SchemaCache {
    entries: Mutex<LruCache<String, Arc<BucketSchema>>>,
    ttl: Duration,
    metrics: CacheMetrics,
}

#[derive(Default)]
struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    bypassed: AtomicU64,
    refreshes: AtomicU64,
}

/// Point-in-time copy of the cache counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheMetricsSnapshot {
    /// Resolutions answered from the cache.
    pub hits: u64,
    /// Resolutions with no cached entry.
    pub misses: u64,
    /// Resolutions whose cached entry had expired.
    pub expired: u64,
    /// Resolutions that skipped the cache on request.
    pub bypassed: u64,
    /// Successful reads of authoritative metadata.
    pub refreshes: u64,
}

impl CacheMetrics {
    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
        }
    }
}

impl SchemaCache {
    /// Creates a cache holding up to `capacity` buckets for `ttl` each.
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
            metrics: CacheMetrics::default(),
        }
    }

    /// Returns the schema of `bucket`, reading storage when the entry is
    /// missing, expired, or `bypass` is set.
    pub fn resolve(
        &self,
        storage: &Storage,
        bucket: &str,
        bypass: bool,
    ) -> Result<Arc<BucketSchema>> {
        if bypass {
            CacheMetrics::inc(&self.metrics.bypassed);
        } else if let Some(schema) = self.lookup(bucket) {
            return Ok(schema);
        }
        let fresh = match storage.read(|conn| load(conn, bucket)) {
            Ok(schema) => Arc::new(schema),
            Err(err) => {
                if err.is_not_found() {
                    self.invalidate(bucket);
                }
                return Err(err);
            }
        };
        CacheMetrics::inc(&self.metrics.refreshes);
        debug!(
            bucket = %bucket,
            id_state = ?fresh.id_state(),
            bypass,
            "refreshed bucket schema"
        );
        self.entries
            .lock()
            .put(bucket.to_owned(), Arc::clone(&fresh));
        Ok(fresh)
    }

    fn lookup(&self, bucket: &str) -> Option<Arc<BucketSchema>> {
        let mut entries = self.entries.lock();
        match entries.get(bucket) {
            Some(schema) if schema.age() < self.ttl => {
                CacheMetrics::inc(&self.metrics.hits);
                Some(Arc::clone(schema))
            }
            Some(_) => {
                CacheMetrics::inc(&self.metrics.expired);
                None
            }
            None => {
                CacheMetrics::inc(&self.metrics.misses);
                None
            }
        }
    }

    /// Drops the entry for `bucket`.
    pub fn invalidate(&self, bucket: &str) {
        self.entries.lock().pop(bucket);
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of cached buckets, fresh or expired.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no bucket is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current counter values.
    pub fn metrics_snapshot(&self) -> CacheMetricsSnapshot {
        self.metrics.snapshot()
    }
}
