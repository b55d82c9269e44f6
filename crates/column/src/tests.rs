use super::*;
use common::{Config, TupleId};
use proptest::prelude::*;
use std::sync::Arc;
use tempfile::tempdir;
use types::{Type, Value};

fn config() -> Config {
    Config::builder().buffer_pool_frames(8).build()
}

fn fixed_store(dir: &std::path::Path) -> Arc<ColumnStore> {
    let def = ColumnDef::new("feat", Type::FloatVector(2));
    Arc::new(ColumnStore::create(&dir.join("feat.col"), def, &config()).unwrap())
}

fn string_store(dir: &std::path::Path) -> Arc<ColumnStore> {
    let def = ColumnDef::new("id", Type::String);
    Arc::new(ColumnStore::create(&dir.join("id.col"), def, &config()).unwrap())
}

#[test]
fn driver_selection_follows_physical_size() {
    assert_eq!(ColumnDriver::for_type(&Type::Long), ColumnDriver::Fixed);
    assert_eq!(
        ColumnDriver::for_type(&Type::FloatVector(128)),
        ColumnDriver::Fixed
    );
    assert_eq!(ColumnDriver::for_type(&Type::String), ColumnDriver::Variable);
}

#[test]
fn fixed_append_read_round_trip() {
    let dir = tempdir().unwrap();
    let store = fixed_store(dir.path());

    let a = store.append(&Value::FloatVector(vec![1.0, 0.0])).unwrap();
    let b = store.append(&Value::FloatVector(vec![0.0, 1.0])).unwrap();
    assert_eq!(a, TupleId(0));
    assert_eq!(b, TupleId(1));

    assert_eq!(
        store.read(a).unwrap(),
        Some(Value::FloatVector(vec![1.0, 0.0]))
    );
    assert_eq!(
        store.read(b).unwrap(),
        Some(Value::FloatVector(vec![0.0, 1.0]))
    );
    assert_eq!(store.meta().count, 2);
}

#[test]
fn fixed_update_in_place() {
    let dir = tempdir().unwrap();
    let store = fixed_store(dir.path());
    let tid = store.append(&Value::FloatVector(vec![1.0, 1.0])).unwrap();

    store.update(tid, &Value::FloatVector(vec![2.0, 2.0])).unwrap();
    assert_eq!(
        store.read(tid).unwrap(),
        Some(Value::FloatVector(vec![2.0, 2.0]))
    );
}

#[test]
fn fixed_delete_is_logical() {
    let dir = tempdir().unwrap();
    let store = fixed_store(dir.path());
    let a = store.append(&Value::FloatVector(vec![1.0, 0.0])).unwrap();
    let b = store.append(&Value::FloatVector(vec![0.0, 1.0])).unwrap();

    store.delete(a).unwrap();
    assert_eq!(store.read(a).unwrap(), None);
    assert!(store.is_deleted(a).unwrap());
    assert_eq!(store.meta().count, 1);
    assert_eq!(store.meta().deleted, 1);
    // Deleting twice is a validation error.
    assert!(matches!(
        store.delete(a),
        Err(common::DbError::TxValidation(_))
    ));
    // Tuple ids are never reused.
    let c = store.append(&Value::FloatVector(vec![2.0, 2.0])).unwrap();
    assert_eq!(c, TupleId(2));
    let _ = b;
}

#[test]
fn fixed_rejects_type_and_null_violations() {
    let dir = tempdir().unwrap();
    let store = fixed_store(dir.path());

    assert!(matches!(
        store.append(&Value::Long(1)),
        Err(common::DbError::TxValidation(_))
    ));
    assert!(matches!(
        store.append(&Value::Null),
        Err(common::DbError::TxValidation(_))
    ));
    assert!(matches!(
        store.append(&Value::FloatVector(vec![1.0])),
        Err(common::DbError::TxValidation(_))
    ));
}

#[test]
fn nullable_column_stores_null() {
    let dir = tempdir().unwrap();
    let def = ColumnDef::new("score", Type::Double).nullable();
    let store = ColumnStore::create(&dir.path().join("score.col"), def, &config()).unwrap();

    let tid = store.append(&Value::Null).unwrap();
    assert_eq!(store.read(tid).unwrap(), Some(Value::Null));
}

#[test]
fn reader_and_writer_pair_with_a_cursor() {
    let dir = tempdir().unwrap();
    let store = fixed_store(dir.path());
    let writer = store.writer();
    let reader = store.reader();

    let a = writer.append(&Value::FloatVector(vec![1.0, 0.0])).unwrap();
    let b = writer.append(&Value::FloatVector(vec![0.0, 1.0])).unwrap();
    writer.update(b, &Value::FloatVector(vec![2.0, 2.0])).unwrap();
    writer.delete(a).unwrap();

    let mut cursor = store.cursor(None);
    let mut seen = Vec::new();
    while let Some(tid) = cursor.next().unwrap() {
        seen.push(reader.get(tid).unwrap().unwrap());
    }
    assert_eq!(seen, vec![Value::FloatVector(vec![2.0, 2.0])]);
    assert!(reader.is_deleted(a).unwrap());
}

#[test]
fn cursor_skips_deleted_tuples() {
    let dir = tempdir().unwrap();
    let store = fixed_store(dir.path());
    for i in 0..5 {
        store
            .append(&Value::FloatVector(vec![i as f32, 0.0]))
            .unwrap();
    }
    store.delete(TupleId(1)).unwrap();
    store.delete(TupleId(3)).unwrap();

    let mut cursor = store.cursor(None);
    let mut seen = Vec::new();
    while let Some(tid) = cursor.next().unwrap() {
        seen.push(tid.0);
    }
    assert_eq!(seen, vec![0, 2, 4]);
}

#[test]
fn ranged_cursor_respects_bounds() {
    let dir = tempdir().unwrap();
    let store = fixed_store(dir.path());
    for i in 0..10 {
        store
            .append(&Value::FloatVector(vec![i as f32, 0.0]))
            .unwrap();
    }

    let mut cursor = store.cursor(Some((3, 7)));
    let mut seen = Vec::new();
    while let Some(tid) = cursor.next().unwrap() {
        seen.push(tid.0);
    }
    assert_eq!(seen, vec![3, 4, 5, 6]);
}

#[test]
fn fixed_address_bijection() {
    // Many tuples across several pages: every tid maps to a distinct slot
    // and reads back its own value.
    let dir = tempdir().unwrap();
    let def = ColumnDef::new("n", Type::Long);
    let store = Arc::new(ColumnStore::create(&dir.path().join("n.col"), def, &config()).unwrap());

    let total = 2_000u64; // several pages at 9 bytes per entry
    for i in 0..total {
        let tid = store.append(&Value::Long(i as i64)).unwrap();
        assert_eq!(tid.0, i);
    }
    for i in (0..total).step_by(97) {
        assert_eq!(store.read(TupleId(i)).unwrap(), Some(Value::Long(i as i64)));
    }
}

#[test]
fn variable_append_read_round_trip() {
    let dir = tempdir().unwrap();
    let store = string_store(dir.path());

    let a = store.append(&Value::String("a".into())).unwrap();
    let b = store.append(&Value::String("somewhat longer".into())).unwrap();
    assert_eq!(store.read(a).unwrap(), Some(Value::String("a".into())));
    assert_eq!(
        store.read(b).unwrap(),
        Some(Value::String("somewhat longer".into()))
    );
}

#[test]
fn variable_update_relocates_slot() {
    let dir = tempdir().unwrap();
    let store = string_store(dir.path());
    let tid = store.append(&Value::String("short".into())).unwrap();

    let long = "x".repeat(2_000);
    store.update(tid, &Value::String(long.clone())).unwrap();
    assert_eq!(store.read(tid).unwrap(), Some(Value::String(long)));
}

#[test]
fn variable_delete_reclaims_and_counts() {
    let dir = tempdir().unwrap();
    let store = string_store(dir.path());
    let a = store.append(&Value::String("one".into())).unwrap();
    let _b = store.append(&Value::String("two".into())).unwrap();

    store.delete(a).unwrap();
    assert_eq!(store.read(a).unwrap(), None);
    assert_eq!(store.meta().count, 1);
    assert_eq!(store.meta().deleted, 1);
}

#[test]
fn variable_directory_spans_many_pages() {
    // Force several directory pages and verify every tuple stays
    // addressable (directory completeness).
    let dir = tempdir().unwrap();
    let store = string_store(dir.path());

    let total = 1_000u64;
    for i in 0..total {
        store.append(&Value::String(format!("value-{i}"))).unwrap();
    }
    for i in (0..total).step_by(41) {
        assert_eq!(
            store.read(TupleId(i)).unwrap(),
            Some(Value::String(format!("value-{i}")))
        );
    }
}

#[test]
fn variable_payloads_fill_and_spill_pages() {
    let dir = tempdir().unwrap();
    let store = string_store(dir.path());

    // Each payload is a large fraction of a page, forcing regular spills to
    // fresh data pages.
    for i in 0..20 {
        let payload = format!("{i}-").repeat(700);
        let tid = store.append(&Value::String(payload.clone())).unwrap();
        assert_eq!(store.read(tid).unwrap(), Some(Value::String(payload)));
    }
}

#[test]
fn oversized_payload_is_rejected() {
    let dir = tempdir().unwrap();
    let store = string_store(dir.path());
    let huge = "y".repeat(5_000);
    assert!(matches!(
        store.append(&Value::String(huge)),
        Err(common::DbError::TxValidation(_))
    ));
}

#[test]
fn commit_persists_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("id.col");
    {
        let def = ColumnDef::new("id", Type::String);
        let store = ColumnStore::create(&path, def, &config()).unwrap();
        store.append(&Value::String("a".into())).unwrap();
        store.append(&Value::String("b".into())).unwrap();
        store.commit().unwrap();
        store.close().unwrap();
    }

    let def = ColumnDef::new("id", Type::String);
    let store = ColumnStore::open(&path, def, &config()).unwrap();
    assert_eq!(store.meta().count, 2);
    assert_eq!(store.read(TupleId(0)).unwrap(), Some(Value::String("a".into())));
    assert_eq!(store.read(TupleId(1)).unwrap(), Some(Value::String("b".into())));
}

#[test]
fn rollback_reverts_counters() {
    let dir = tempdir().unwrap();
    let store = fixed_store(dir.path());
    store.append(&Value::FloatVector(vec![1.0, 0.0])).unwrap();
    store.commit().unwrap();

    store.append(&Value::FloatVector(vec![9.0, 9.0])).unwrap();
    assert_eq!(store.meta().count, 2);
    store.rollback().unwrap();
    assert_eq!(store.meta().count, 1);
    assert_eq!(store.meta().max_tid, 1);
}

#[test]
fn crash_recovers_to_last_commit() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("id.col");
    {
        let def = ColumnDef::new("id", Type::String);
        let store = ColumnStore::create(&path, def, &config()).unwrap();
        store.append(&Value::String("committed".into())).unwrap();
        store.commit().unwrap();
        // Uncommitted tail, then crash without close.
        store.append(&Value::String("lost".into())).unwrap();
        drop(store);
    }

    let def = ColumnDef::new("id", Type::String);
    let store = ColumnStore::open(&path, def, &config()).unwrap();
    assert_eq!(store.meta().max_tid, 1);
    assert_eq!(
        store.read(TupleId(0)).unwrap(),
        Some(Value::String("committed".into()))
    );
}

#[test]
fn open_with_wrong_declaration_fails() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("id.col");
    {
        let def = ColumnDef::new("id", Type::String);
        let store = ColumnStore::create(&path, def, &config()).unwrap();
        store.close().unwrap();
    }
    // Same driver, different nullability.
    let def = ColumnDef::new("id", Type::String).nullable();
    assert!(matches!(
        ColumnStore::open(&path, def, &config()),
        Err(common::DbError::DataCorruption(_))
    ));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn fixed_values_round_trip(values in proptest::collection::vec(any::<i64>(), 1..64)) {
        let dir = tempdir().unwrap();
        let def = ColumnDef::new("v", Type::Long);
        let store = ColumnStore::create(&dir.path().join("v.col"), def, &config()).unwrap();
        for v in &values {
            store.append(&Value::Long(*v)).unwrap();
        }
        for (i, v) in values.iter().enumerate() {
            prop_assert_eq!(store.read(TupleId(i as u64)).unwrap(), Some(Value::Long(*v)));
        }
    }

    #[test]
    fn variable_strings_round_trip(values in proptest::collection::vec(".{0,64}", 1..32)) {
        let dir = tempdir().unwrap();
        let def = ColumnDef::new("s", Type::String);
        let store = ColumnStore::create(&dir.path().join("s.col"), def, &config()).unwrap();
        for v in &values {
            store.append(&Value::String(v.clone())).unwrap();
        }
        for (i, v) in values.iter().enumerate() {
            prop_assert_eq!(
                store.read(TupleId(i as u64)).unwrap(),
                Some(Value::String(v.clone()))
            );
        }
    }
}
