//! Async wrapper running each request on the tokio blocking pool.

use tokio::task;

use super::BucketStore;
use crate::catalog::{BucketConfig, BucketInfo};
use crate::migrate::MigrationReport;
use crate::query::{BatchOp, BatchOutcome, FindOptions, GetOptions, MutationOptions, ObjectRecord};
use crate::types::{ObjectId, Result};

/// Async handle over a [`BucketStore`].
///
/// Every call moves a clone of the store onto `spawn_blocking`, so requests
/// run in parallel up to the substrate's own serialization.
#[derive(Clone)]
pub struct AsyncBucketStore {
    store: BucketStore,
}

impl AsyncBucketStore {
    /// Wraps `store`.
    pub fn new(store: BucketStore) -> Self {
        Self { store }
    }

    /// Synchronous view of the same store.
    pub fn blocking(&self) -> &BucketStore {
        &self.store
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(BucketStore) -> Result<T> + Send + 'static,
    {
        let store = self.store.clone();
        task::spawn_blocking(move || f(store)).await?
    }

    /// See [`BucketStore::create_bucket`].
    pub async fn create_bucket(&self, name: &str, config: BucketConfig) -> Result<BucketInfo> {
        let name = name.to_owned();
        self.run(move |store| store.create_bucket(&name, &config))
            .await
    }

    /// See [`BucketStore::put`].
    pub async fn put(
        &self,
        bucket: &str,
        key: &str,
        document: serde_json::Value,
    ) -> Result<ObjectId> {
        let (bucket, key) = (bucket.to_owned(), key.to_owned());
        self.run(move |store| store.put(&bucket, &key, &document))
            .await
    }

    /// See [`BucketStore::get`].
    pub async fn get(&self, bucket: &str, key: &str, opts: GetOptions) -> Result<ObjectRecord> {
        let (bucket, key) = (bucket.to_owned(), key.to_owned());
        self.run(move |store| store.get(&bucket, &key, opts)).await
    }

    /// See [`BucketStore::delete`].
    pub async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let (bucket, key) = (bucket.to_owned(), key.to_owned());
        self.run(move |store| store.delete(&bucket, &key)).await
    }

    /// See [`BucketStore::find`]. Records are collected before returning; the
    /// first undecodable row fails the call.
    pub async fn find(
        &self,
        bucket: &str,
        filter: &str,
        opts: FindOptions,
    ) -> Result<Vec<ObjectRecord>> {
        let (bucket, filter) = (bucket.to_owned(), filter.to_owned());
        self.run(move |store| store.find(&bucket, &filter, &opts)?.into_records())
            .await
    }

    /// See [`BucketStore::update_many`].
    pub async fn update_many(
        &self,
        bucket: &str,
        fields: serde_json::Map<String, serde_json::Value>,
        filter: &str,
        opts: MutationOptions,
    ) -> Result<u64> {
        let (bucket, filter) = (bucket.to_owned(), filter.to_owned());
        self.run(move |store| store.update_many(&bucket, &fields, &filter, opts))
            .await
    }

    /// See [`BucketStore::delete_many`].
    pub async fn delete_many(
        &self,
        bucket: &str,
        filter: &str,
        opts: MutationOptions,
    ) -> Result<u64> {
        let (bucket, filter) = (bucket.to_owned(), filter.to_owned());
        self.run(move |store| store.delete_many(&bucket, &filter, opts))
            .await
    }

    /// See [`BucketStore::batch`].
    pub async fn batch(&self, ops: Vec<BatchOp>) -> Result<Vec<BatchOutcome>> {
        self.run(move |store| store.batch(&ops)).await
    }

    /// See [`BucketStore::migrate_identifier_column`].
    pub async fn migrate_identifier_column(&self, bucket: &str) -> Result<MigrationReport> {
        let bucket = bucket.to_owned();
        self.run(move |store| store.migrate_identifier_column(&bucket))
            .await
    }
}
