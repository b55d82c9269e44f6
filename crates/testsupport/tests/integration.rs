//! Integration tests demonstrating testsupport usage.

use common::Distance;
use testsupport::fixtures::{count, knn, seed_vectors, select, vector_entity};
use testsupport::{test_engine, vals};
use txn::TransactionMode;
use types::Value;

#[test]
fn engine_macro_and_fixtures_compose() {
    test_engine!(db);
    let entity = vector_entity(&db);
    seed_vectors(&db, &entity, &[("a", [1.0, 0.0]), ("b", [0.0, 1.0])]);

    let ctx = db.begin(TransactionMode::ReadOnly);
    let result = db.query(&select(&entity, &["id"]), &ctx).unwrap();
    ctx.commit().unwrap();
    assert_eq!(result.len(), 2);
}

#[test]
fn wal_variant_of_the_macro() {
    test_engine!(db, wal);
    let entity = vector_entity(&db);
    seed_vectors(&db, &entity, &[("only", [0.5, 0.5])]);

    let ctx = db.begin(TransactionMode::ReadOnly);
    let result = db.query(&count(&entity), &ctx).unwrap();
    ctx.commit().unwrap();
    assert_eq!(result.records[0].values, vec![Value::Long(1)]);
}

#[test]
fn vals_macro_builds_insert_rows() {
    test_engine!(db);
    let entity = vector_entity(&db);

    let ctx = db.begin(TransactionMode::ReadWrite);
    db.insert(
        &entity,
        &[vals![
            "id" => Value::String("x".into()),
            "feat" => Value::FloatVector(vec![2.0, 3.0])
        ]],
        &ctx,
    )
    .unwrap();
    ctx.commit().unwrap();

    let ctx = db.begin(TransactionMode::ReadOnly);
    let result = db
        .query(&knn(&entity, 1, vec![2.0, 3.0], Distance::L2, &["id"]), &ctx)
        .unwrap();
    ctx.commit().unwrap();
    assert_eq!(result.records[0].values, vec![Value::String("x".into())]);
}
