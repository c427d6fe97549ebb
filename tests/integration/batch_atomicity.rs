//! Batches apply in order and commit or roll back as one unit.

#![allow(missing_docs)]

use serde_json::{json, Map, Value};
use sombra_bucket::types::ident::NARROW_MAX;
use sombra_bucket::{
    BatchOp, BatchOutcome, BucketConfig, BucketStore, FindOptions, GetOptions, IndexSpec,
    ObjectId, PropertyType, StoreOptions,
};

fn jobs() -> BucketStore {
    let store = BucketStore::open_in_memory(StoreOptions::default()).unwrap();
    let config = BucketConfig::new()
        .with_index("state", IndexSpec::new(PropertyType::String))
        .with_index("rank", IndexSpec::new(PropertyType::Number));
    store.create_bucket("jobs", &config).unwrap();
    for (key, rank) in [("a", 1), ("b", 2), ("c", 3)] {
        store
            .put("jobs", key, &json!({ "state": "open", "rank": rank }))
            .unwrap();
    }
    store
}

fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), v.clone()))
        .collect()
}

fn filter(text: &str) -> sombra_bucket::Filter {
    text.parse().unwrap()
}

fn keys(store: &BucketStore, bucket: &str) -> Vec<String> {
    let mut keys: Vec<String> = store
        .find(bucket, "(_key=*)", &FindOptions::default())
        .unwrap()
        .map(|r| r.unwrap().key)
        .collect();
    keys.sort();
    keys
}

#[test]
fn update_after_delete_sees_the_deletion() {
    let store = jobs();
    let outcomes = store
        .batch(&[
            BatchOp::DeleteMany {
                bucket: "jobs".into(),
                filter: filter("(rank<=2)"),
            },
            BatchOp::UpdateMany {
                bucket: "jobs".into(),
                fields: fields(&[("state", json!("done"))]),
                filter: filter("(rank>=1)"),
            },
        ])
        .unwrap();
    assert_eq!(
        outcomes,
        vec![
            BatchOutcome::DeletedMany { count: 2 },
            BatchOutcome::Updated { count: 1 },
        ]
    );
    assert_eq!(keys(&store, "jobs"), vec!["c"]);
    let c = store.get("jobs", "c", GetOptions::default()).unwrap();
    assert_eq!(c.value["state"], json!("done"));
}

#[test]
fn failure_discards_every_effect() {
    let store = jobs();
    let err = store
        .batch(&[
            BatchOp::Put {
                bucket: "jobs".into(),
                key: "d".into(),
                value: json!({ "state": "open", "rank": 4 }),
            },
            BatchOp::DeleteMany {
                bucket: "jobs".into(),
                filter: filter("(rank>=3)"),
            },
            BatchOp::Delete {
                bucket: "jobs".into(),
                key: "missing".into(),
            },
        ])
        .unwrap_err();
    assert!(err.is_not_found(), "{err}");
    assert_eq!(keys(&store, "jobs"), vec!["a", "b", "c"]);

    // The identifier drawn for "d" stays consumed.
    let id = store.put("jobs", "e", &json!({ "rank": 5 })).unwrap();
    assert_eq!(id, ObjectId(5));
}

#[test]
fn later_operations_observe_earlier_ones() {
    let store = jobs();
    let outcomes = store
        .batch(&[
            BatchOp::Put {
                bucket: "jobs".into(),
                key: "x".into(),
                value: json!({ "state": "new", "rank": 9 }),
            },
            BatchOp::UpdateMany {
                bucket: "jobs".into(),
                fields: fields(&[("rank", json!(10))]),
                filter: filter("(state=new)"),
            },
            BatchOp::Put {
                bucket: "jobs".into(),
                key: "x".into(),
                value: json!({ "state": "final", "rank": 11 }),
            },
        ])
        .unwrap();
    assert_eq!(
        outcomes,
        vec![
            BatchOutcome::Put { id: ObjectId(4) },
            BatchOutcome::Updated { count: 1 },
            BatchOutcome::Put { id: ObjectId(4) },
        ]
    );
    let x = store.get("jobs", "x", GetOptions::default()).unwrap();
    assert_eq!(x.value, json!({ "state": "final", "rank": 11 }));
}

#[test]
fn spans_several_buckets() {
    let store = jobs();
    store.create_bucket("audit", &BucketConfig::new()).unwrap();
    store
        .batch(&[
            BatchOp::Delete {
                bucket: "jobs".into(),
                key: "a".into(),
            },
            BatchOp::Put {
                bucket: "audit".into(),
                key: "a-deleted".into(),
                value: json!({}),
            },
        ])
        .unwrap();
    assert_eq!(keys(&store, "jobs"), vec!["b", "c"]);
    assert_eq!(keys(&store, "audit"), vec!["a-deleted"]);
}

#[test]
fn unknown_bucket_fails_before_anything_runs() {
    let store = jobs();
    let err = store
        .batch(&[
            BatchOp::Delete {
                bucket: "jobs".into(),
                key: "a".into(),
            },
            BatchOp::Delete {
                bucket: "nope".into(),
                key: "a".into(),
            },
        ])
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(keys(&store, "jobs"), vec!["a", "b", "c"]);
}

#[test]
fn capacity_failure_inside_batch_consumes_both_values() {
    let store = jobs();
    store
        .restart_identifier_sequence("jobs", NARROW_MAX)
        .unwrap();
    let err = store
        .batch(&[
            BatchOp::Put {
                bucket: "jobs".into(),
                key: "last".into(),
                value: json!({}),
            },
            BatchOp::Put {
                bucket: "jobs".into(),
                key: "over".into(),
                value: json!({}),
            },
        ])
        .unwrap_err();
    assert_eq!(err.code(), "CapacityExceeded");
    assert_eq!(keys(&store, "jobs"), vec!["a", "b", "c"]);

    store.migrate_identifier_column("jobs").unwrap();
    let id = store.put("jobs", "after", &json!({})).unwrap();
    assert_eq!(id.get(), NARROW_MAX + 2);
}
