//! Identifier continuity across the narrow-to-wide migration.

#![allow(missing_docs)]

use proptest::prelude::*;
use serde_json::json;
use sombra_bucket::types::ident::NARROW_MAX;
use sombra_bucket::{
    BucketConfig, BucketError, BucketStore, GetOptions, IdState, MigrationPhase, MigrationStep,
    StoreOptions,
};
use tempfile::tempdir;

fn store_with(bucket: &str) -> BucketStore {
    let store = BucketStore::open_in_memory(StoreOptions::default()).expect("open store");
    store
        .create_bucket(bucket, &BucketConfig::new())
        .expect("create bucket");
    store
}

fn put(store: &BucketStore, bucket: &str, key: &str) -> sombra_bucket::Result<i64> {
    store
        .put(bucket, key, &json!({ "key": key }))
        .map(|id| id.get())
}

#[test]
fn exhausted_narrow_sequence_continues_in_wide_column() {
    let store = store_with("events");
    store
        .restart_identifier_sequence("events", NARROW_MAX - 36)
        .unwrap();

    let ids: Vec<i64> = (0..37)
        .map(|n| put(&store, "events", &format!("k{n:02}")).unwrap())
        .collect();
    assert_eq!(ids.first(), Some(&2147483611));
    assert_eq!(ids.last(), Some(&2147483647));

    let err = put(&store, "events", "k37").unwrap_err();
    assert!(
        matches!(err, BucketError::CapacityExceeded { value: 2147483648, column: "_id", .. }),
        "{err}"
    );

    let report = store.migrate_identifier_column("events").unwrap();
    assert_eq!(report.phase, MigrationPhase::Split);
    assert_eq!(put(&store, "events", "k37").unwrap(), 2147483649);

    let old = store.get("events", "k00", GetOptions::default()).unwrap();
    assert_eq!(old.id.get(), 2147483611);
    let new = store.get("events", "k37", GetOptions::default()).unwrap();
    assert_eq!(new.id.get(), 2147483649);

    let placed = store
        .storage()
        .execute_unchecked(
            "UPDATE events SET _mtime = _mtime \
             WHERE _key = 'k37' AND _id IS NULL AND _idx = 2147483649",
        )
        .unwrap();
    assert_eq!(placed, 1);
}

#[test]
fn replacing_a_legacy_object_keeps_its_identifier() {
    let store = store_with("events");
    let first = put(&store, "events", "a").unwrap();
    store.migrate_identifier_column("events").unwrap();
    let again = store
        .put("events", "a", &json!({ "key": "a", "rev": 2 }))
        .unwrap();
    assert_eq!(again.get(), first);
    assert_eq!(put(&store, "events", "b").unwrap(), first + 1);
    let record = store.get("events", "a", GetOptions::default()).unwrap();
    assert_eq!(record.value["rev"], json!(2));
}

#[test]
fn rerunning_a_completed_migration_is_harmless() {
    let store = store_with("events");
    put(&store, "events", "a").unwrap();
    store.migrate_identifier_column("events").unwrap();
    let report = store.migrate_identifier_column("events").unwrap();
    assert_eq!(
        report.skipped,
        vec![
            MigrationStep::AddWideColumn,
            MigrationStep::AddWideIndex,
            MigrationStep::MoveSequenceDefault,
        ]
    );
    assert_eq!(report.phase, MigrationPhase::Split);
    assert_eq!(put(&store, "events", "b").unwrap(), 2);
}

#[test]
fn conflicting_state_aborts_until_repaired() {
    let store = store_with("events");
    put(&store, "events", "a").unwrap();
    store
        .storage()
        .execute_unchecked("ALTER TABLE events ADD COLUMN _idx TEXT")
        .unwrap();

    let err = store.migrate_identifier_column("events").unwrap_err();
    assert_eq!(err.code(), "SchemaConflict");
    let status = store.sequence_state("events").unwrap();
    assert_eq!(status.target_column.as_deref(), Some("_id"));
    assert_eq!(put(&store, "events", "b").unwrap(), 2);

    store
        .storage()
        .execute_unchecked("ALTER TABLE events DROP COLUMN _idx")
        .unwrap();
    let report = store.migrate_identifier_column("events").unwrap();
    assert_eq!(report.phase, MigrationPhase::Split);
    assert_eq!(put(&store, "events", "c").unwrap(), 3);
}

#[test]
fn migration_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("buckets.db");
    {
        let store = BucketStore::open(&path, StoreOptions::default()).unwrap();
        store.create_bucket("events", &BucketConfig::new()).unwrap();
        put(&store, "events", "a").unwrap();
        store.migrate_identifier_column("events").unwrap();
    }
    let store = BucketStore::open(&path, StoreOptions::default()).unwrap();
    assert_eq!(store.migration_phase("events").unwrap(), MigrationPhase::Split);
    assert_eq!(store.get_bucket("events").unwrap().id_state, IdState::Split);
    assert_eq!(put(&store, "events", "b").unwrap(), 2);
    assert_eq!(
        store.get("events", "a", GetOptions::default()).unwrap().id.get(),
        1
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn identifiers_stay_consecutive_across_migration(
        before in 1usize..12,
        failures in 0usize..3,
        after in 0usize..12,
    ) {
        let store = store_with("seq");
        let start = NARROW_MAX - before as i64 + 1;
        store.restart_identifier_sequence("seq", start).unwrap();

        let narrow: Vec<i64> = (0..before)
            .map(|n| put(&store, "seq", &format!("n{n}")).unwrap())
            .collect();
        for n in 0..failures {
            let err = put(&store, "seq", &format!("f{n}")).unwrap_err();
            prop_assert_eq!(err.code(), "CapacityExceeded");
        }
        store.migrate_identifier_column("seq").unwrap();
        let wide: Vec<i64> = (0..after)
            .map(|n| put(&store, "seq", &format!("w{n}")).unwrap())
            .collect();

        prop_assert_eq!(narrow, (start..=NARROW_MAX).collect::<Vec<_>>());
        let wide_start = NARROW_MAX + 1 + failures as i64;
        prop_assert_eq!(wide, (wide_start..wide_start + after as i64).collect::<Vec<_>>());
    }
}
