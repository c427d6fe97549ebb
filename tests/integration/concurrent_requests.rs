//! Parallel writers and readers, including across a live migration.

#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use rand::Rng;
use serde_json::json;
use sombra_bucket::{
    AsyncBucketStore, BucketConfig, BucketStore, FindOptions, GetOptions, MigrationPhase, Sort,
    StoreOptions,
};
use tempfile::tempdir;

const WRITERS: usize = 4;
const PUTS_PER_WRITER: usize = 60;

fn file_store(dir: &tempfile::TempDir) -> BucketStore {
    let store = BucketStore::open(dir.path().join("buckets.db"), StoreOptions::default()).unwrap();
    store.create_bucket("feed", &BucketConfig::new()).unwrap();
    store
}

#[test]
fn parallel_puts_get_distinct_consecutive_ids() {
    let dir = tempdir().unwrap();
    let store = file_store(&dir);
    let barrier = Arc::new(Barrier::new(WRITERS));
    let handles: Vec<_> = (0..WRITERS)
        .map(|writer| {
            let store = store.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                (0..PUTS_PER_WRITER)
                    .map(|n| {
                        store
                            .put("feed", &format!("w{writer}-{n}"), &json!({ "n": n }))
                            .unwrap()
                            .get()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let ids: BTreeSet<i64> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    let total = (WRITERS * PUTS_PER_WRITER) as i64;
    assert_eq!(ids, (1..=total).collect());
}

#[test]
fn migration_under_load_keeps_the_identifier_space_whole() {
    let dir = tempdir().unwrap();
    let store = file_store(&dir);
    for n in 0..20 {
        store.put("feed", &format!("seed-{n}"), &json!({})).unwrap();
    }

    let done = Arc::new(AtomicBool::new(false));
    let writers: Vec<_> = (0..WRITERS)
        .map(|writer| {
            let store = store.clone();
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for n in 0..PUTS_PER_WRITER {
                    store
                        .put("feed", &format!("w{writer}-{n}"), &json!({ "r": rng.gen::<u32>() }))
                        .unwrap();
                }
            })
        })
        .collect();
    let reader = {
        let store = store.clone();
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut reads = 0usize;
            while !done.load(Ordering::Acquire) {
                let found = store
                    .find("feed", "(_id>=1)", &FindOptions::default().limit(10_000))
                    .unwrap()
                    .into_records()
                    .unwrap();
                assert!(found.len() >= 20);
                reads += 1;
            }
            reads
        })
    };

    let report = store.migrate_identifier_column("feed").unwrap();
    assert_eq!(report.phase, MigrationPhase::Split);
    let after = store.put("feed", "after-migration", &json!({})).unwrap();

    for writer in writers {
        writer.join().unwrap();
    }
    done.store(true, Ordering::Release);
    assert!(reader.join().unwrap() > 0);

    let placed = store
        .storage()
        .execute_unchecked(&format!(
            "UPDATE feed SET _mtime = _mtime WHERE _id IS NULL AND _idx = {}",
            after.get()
        ))
        .unwrap();
    assert_eq!(placed, 1);

    let all = store
        .find(
            "feed",
            "(_id=*)",
            &FindOptions::default()
                .sort(Sort::asc("_id"))
                .limit(10_000)
                .no_bucket_cache(),
        )
        .unwrap()
        .into_records()
        .unwrap();
    let ids: Vec<i64> = all.iter().map(|r| r.id.get()).collect();
    let total = 20 + (WRITERS * PUTS_PER_WRITER) as i64 + 1;
    assert_eq!(ids, (1..=total).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn async_handle_serves_concurrent_requests() {
    let inner = BucketStore::open_in_memory(StoreOptions::default()).unwrap();
    let store = AsyncBucketStore::new(inner);
    store
        .create_bucket("feed", BucketConfig::new())
        .await
        .unwrap();

    let tasks: Vec<_> = (0..16)
        .map(|n| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .put("feed", &format!("k{n}"), json!({ "n": n }))
                    .await
                    .unwrap()
            })
        })
        .collect();
    let mut ids = BTreeSet::new();
    for task in tasks {
        ids.insert(task.await.unwrap().get());
    }
    assert_eq!(ids, (1..=16).collect());

    store.migrate_identifier_column("feed").await.unwrap();
    let wide = store.put("feed", "k16", json!({})).await.unwrap();
    assert_eq!(wide.get(), 17);
    let record = store
        .get("feed", "k16", GetOptions::default())
        .await
        .unwrap();
    assert_eq!(record.id, wide);
    let found = store
        .find("feed", "(_id>=10)", FindOptions::default())
        .await
        .unwrap();
    assert_eq!(found.len(), 8);
    assert!(store
        .delete("feed", "absent")
        .await
        .unwrap_err()
        .is_not_found());
}
