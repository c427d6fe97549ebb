//! Schema cache staleness and bypass, with two handles sharing one database.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sombra_bucket::storage::Storage;
use sombra_bucket::{
    BucketConfig, BucketStore, FindOptions, GetOptions, IdState, Sort, StoreOptions,
};

/// An admin handle and an application handle with independent caches.
fn two_handles(options: StoreOptions) -> (BucketStore, BucketStore) {
    let storage = Arc::new(Storage::open_in_memory(&options).unwrap());
    let admin = BucketStore::with_storage(Arc::clone(&storage), options.clone());
    let app = BucketStore::with_storage(storage, options);
    admin.create_bucket("orders", &BucketConfig::new()).unwrap();
    (admin, app)
}

fn ids(store: &BucketStore, opts: &FindOptions) -> Vec<i64> {
    let mut ids: Vec<i64> = store
        .find("orders", "(_id>=1)", opts)
        .unwrap()
        .map(|record| record.unwrap().id.get())
        .collect();
    ids.sort_unstable();
    ids
}

#[test]
fn stale_handle_stays_correct_after_migration() {
    let (admin, app) = two_handles(StoreOptions::default());
    app.put("orders", "a", &json!({ "total": 1 })).unwrap();
    assert_eq!(
        app.get("orders", "a", GetOptions::default()).unwrap().id.get(),
        1
    );

    admin.migrate_identifier_column("orders").unwrap();
    let wide = admin.put("orders", "b", &json!({ "total": 2 })).unwrap();
    assert_eq!(wide.get(), 2);

    let stale = app.get("orders", "b", GetOptions::default()).unwrap();
    assert_eq!(stale.id.get(), 2);
    assert_eq!(stale.value, json!({ "total": 2 }));
    assert_eq!(ids(&app, &FindOptions::default()), vec![1]);

    let fresh = app
        .get("orders", "b", GetOptions { no_bucket_cache: true })
        .unwrap();
    assert_eq!(fresh.id.get(), 2);
    assert_eq!(ids(&app, &FindOptions::default()), vec![1, 2]);
    assert_eq!(app.cache_metrics().bypassed, 1);
}

#[test]
fn bypassed_find_sees_the_wide_column_immediately() {
    let (admin, app) = two_handles(StoreOptions::default());
    app.put("orders", "a", &json!({})).unwrap();
    assert_eq!(ids(&app, &FindOptions::default()), vec![1]);

    admin.migrate_identifier_column("orders").unwrap();
    admin.put("orders", "b", &json!({})).unwrap();
    assert_eq!(
        ids(&app, &FindOptions::default().no_bucket_cache()),
        vec![1, 2]
    );
}

#[test]
fn stale_writer_still_uses_the_wide_column() {
    let (admin, app) = two_handles(StoreOptions::default());
    app.put("orders", "a", &json!({})).unwrap();
    admin.migrate_identifier_column("orders").unwrap();

    let id = app.put("orders", "b", &json!({})).unwrap();
    assert_eq!(id.get(), 2);
    let placed = admin
        .storage()
        .execute_unchecked("UPDATE orders SET _mtime = _mtime WHERE _id IS NULL AND _idx = 2")
        .unwrap();
    assert_eq!(placed, 1);
}

#[test]
fn expired_entries_pick_up_migration_without_bypass() {
    let options = StoreOptions {
        schema_cache_ttl: Duration::ZERO,
        ..StoreOptions::default()
    };
    let (admin, app) = two_handles(options);
    app.put("orders", "a", &json!({})).unwrap();
    admin.migrate_identifier_column("orders").unwrap();
    admin.put("orders", "b", &json!({})).unwrap();
    assert_eq!(ids(&app, &FindOptions::default()), vec![1, 2]);
    assert!(app.cache_metrics().expired >= 1);
}

#[test]
fn migrating_handle_refreshes_its_own_cache() {
    let (admin, _app) = two_handles(StoreOptions::default());
    admin.put("orders", "a", &json!({})).unwrap();
    admin.migrate_identifier_column("orders").unwrap();
    admin.put("orders", "b", &json!({})).unwrap();
    assert_eq!(ids(&admin, &FindOptions::default()), vec![1, 2]);
    assert_eq!(admin.get_bucket("orders").unwrap().id_state, IdState::Split);
}

#[test]
fn stale_handle_sorts_identifiers_in_creation_order() {
    let (admin, app) = two_handles(StoreOptions::default());
    app.put("orders", "a1", &json!({})).unwrap();
    app.put("orders", "a2", &json!({})).unwrap();
    admin.migrate_identifier_column("orders").unwrap();
    admin.put("orders", "w3", &json!({})).unwrap();

    let sorted = |sort: Sort| -> Vec<i64> {
        app.find("orders", "(_key=*)", &FindOptions::default().sort(sort))
            .unwrap()
            .map(|record| record.unwrap().id.get())
            .collect()
    };
    assert_eq!(sorted(Sort::asc("_id")), vec![1, 2, 3]);
    assert_eq!(sorted(Sort::desc("_id")), vec![3, 2, 1]);
    assert_eq!(app.cache_metrics().bypassed, 0);
}
