//! Range filters, sorts and bulk mutations over a bucket whose identifiers
//! straddle the legacy and wide columns.

#![allow(missing_docs)]

use proptest::prelude::*;
use serde_json::json;
use sombra_bucket::types::ident::NARROW_MAX;
use sombra_bucket::{
    BucketConfig, BucketStore, FindOptions, IndexSpec, MutationOptions, ObjectRecord,
    PropertyType, Sort, StoreOptions,
};

const NARROW_ROWS: i64 = 5;
const WIDE_ROWS: i64 = 5;

/// Five objects in `_id` (ending at the narrow maximum), five in `_idx`.
fn straddling_store() -> (BucketStore, Vec<(String, i64)>) {
    let store = BucketStore::open_in_memory(StoreOptions::default()).unwrap();
    store
        .create_bucket(
            "metrics",
            &BucketConfig::new().with_index("n", IndexSpec::new(PropertyType::Number)),
        )
        .unwrap();
    store
        .restart_identifier_sequence("metrics", NARROW_MAX - NARROW_ROWS + 1)
        .unwrap();
    let mut created = Vec::new();
    for n in 0..NARROW_ROWS + WIDE_ROWS {
        if n == NARROW_ROWS {
            store.migrate_identifier_column("metrics").unwrap();
        }
        let key = format!("o{n:02}");
        let id = store.put("metrics", &key, &json!({ "n": n })).unwrap();
        created.push((key, id.get()));
    }
    (store, created)
}

fn find(store: &BucketStore, filter: &str, opts: &FindOptions) -> Vec<ObjectRecord> {
    store
        .find("metrics", filter, opts)
        .unwrap()
        .into_records()
        .unwrap()
}

fn sorted_ids(records: &[ObjectRecord]) -> Vec<i64> {
    let mut ids: Vec<i64> = records.iter().map(|r| r.id.get()).collect();
    ids.sort_unstable();
    ids
}

#[test]
fn lower_bound_near_narrow_maximum_returns_both_columns() {
    let (store, _) = straddling_store();
    let records = find(&store, "_id>=2147483646", &FindOptions::default());
    assert_eq!(
        sorted_ids(&records),
        vec![
            2147483646, 2147483647, 2147483648, 2147483649, 2147483650, 2147483651, 2147483652
        ]
    );
}

#[test]
fn upper_bound_and_equality_cross_the_boundary() {
    let (store, _) = straddling_store();
    let le = find(&store, "(_id<=2147483648)", &FindOptions::default());
    assert_eq!(le.len(), 6);
    let eq = find(&store, "(_id=2147483649)", &FindOptions::default());
    assert_eq!(eq.len(), 1);
    assert_eq!(eq[0].key, "o06");
    let negated = find(&store, "(!(_id<=2147483647))", &FindOptions::default());
    assert_eq!(negated.len() as i64, WIDE_ROWS);
    let combined = find(
        &store,
        "(&(_id>=2147483645)(|(n<=3)(n>=8)))",
        &FindOptions::default(),
    );
    let mut keys: Vec<&str> = combined.iter().map(|r| r.key.as_str()).collect();
    keys.sort_unstable();
    assert_eq!(keys, vec!["o02", "o03", "o08", "o09"]);
}

#[test]
fn identifier_sort_matches_creation_order() {
    let (store, created) = straddling_store();
    let creation: Vec<&str> = created.iter().map(|(k, _)| k.as_str()).collect();

    let asc = find(&store, "(_id=*)", &FindOptions::default().sort(Sort::asc("_id")));
    let asc_keys: Vec<&str> = asc.iter().map(|r| r.key.as_str()).collect();
    assert_eq!(asc_keys, creation);

    let desc = find(&store, "(_id=*)", &FindOptions::default().sort(Sort::desc("_id")));
    let mut desc_keys: Vec<&str> = desc.iter().map(|r| r.key.as_str()).collect();
    desc_keys.reverse();
    assert_eq!(desc_keys, creation);
}

#[test]
fn pages_walk_across_the_boundary() {
    let (store, created) = straddling_store();
    let mut seen = Vec::new();
    for page in 0..4 {
        let opts = FindOptions::default()
            .sort(Sort::asc("_id"))
            .limit(3)
            .offset(page * 3);
        seen.extend(find(&store, "(_id=*)", &opts).into_iter().map(|r| r.id.get()));
    }
    assert_eq!(seen, created.iter().map(|(_, id)| *id).collect::<Vec<_>>());
}

#[test]
fn bulk_mutations_use_the_coalesced_predicate() {
    let (store, _) = straddling_store();
    let mut fields = serde_json::Map::new();
    fields.insert("n".into(), json!(100));
    let updated = store
        .update_many("metrics", &fields, "(_id>=2147483647)", MutationOptions::default())
        .unwrap();
    assert_eq!(updated, 6);
    assert_eq!(find(&store, "(n=100)", &FindOptions::default()).len(), 6);

    let deleted = store
        .delete_many("metrics", "(_id<=2147483648)", MutationOptions::default())
        .unwrap();
    assert_eq!(deleted, 6);
    let rest = find(&store, "(_id=*)", &FindOptions::default());
    assert_eq!(sorted_ids(&rest), vec![2147483649, 2147483650, 2147483651, 2147483652]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn range_filters_match_true_identifiers(
        offset in -8i64..8,
        op in prop::sample::select(vec![">=", "<=", "="]),
    ) {
        let (store, created) = straddling_store();
        let bound = NARROW_MAX + offset;
        let filter = format!("(_id{op}{bound})");
        let expected: Vec<i64> = created
            .iter()
            .map(|(_, id)| *id)
            .filter(|id| match op {
                ">=" => *id >= bound,
                "<=" => *id <= bound,
                _ => *id == bound,
            })
            .collect();
        let records = find(&store, &filter, &FindOptions::default());
        prop_assert_eq!(sorted_ids(&records), expected);
    }
}
