use super::*;
use catalog::Catalogue;
use column::ColumnDef;
use common::{
    BooleanPredicate, ComparisonOperator, Config, Distance, KnnPredicate, SchemaName, TupleId,
};
use index::IndexKind;
use planner::{AggregateOp, PhysicalPlan};
use tempfile::tempdir;
use txn::TransactionMode;
use types::{Type, Value};

fn entity_name() -> EntityName {
    SchemaName::new("s").entity("e")
}

fn seeded(dir: &std::path::Path, rows: usize, with_indexes: bool) -> Arc<Catalogue> {
    let config = Config::builder()
        .data_dir(dir.to_path_buf())
        .buffer_pool_frames(16)
        .build();
    let catalogue = Catalogue::open(config).unwrap();
    let ctx = catalogue.transactions().begin(TransactionMode::ReadWrite);
    {
        let cat_tx = catalogue.new_tx(Arc::clone(&ctx)).unwrap();
        let schema = cat_tx.create_schema(&SchemaName::new("s")).unwrap();
        let schema_tx = schema.new_tx(Arc::clone(&ctx)).unwrap();
        let entity = schema_tx
            .create_entity(
                "e",
                vec![
                    ColumnDef::new("id", Type::String),
                    ColumnDef::new("feat", Type::FloatVector(2)),
                    ColumnDef::new("score", Type::Double).nullable(),
                ],
            )
            .unwrap();
        let tx = entity.new_tx(Arc::clone(&ctx)).unwrap();
        for i in 0..rows {
            tx.insert(&[
                ("id".into(), Value::String(format!("row-{i}"))),
                (
                    "feat".into(),
                    Value::FloatVector(vec![(i % 10) as f32, (i / 10) as f32]),
                ),
                (
                    "score".into(),
                    if i % 4 == 0 {
                        Value::Null
                    } else {
                        Value::Double(i as f64)
                    },
                ),
            ])
            .unwrap();
        }
        if with_indexes {
            tx.create_index("id_unique", IndexKind::UniqueHash, "id").unwrap();
            tx.create_index("feat_vaf", IndexKind::VaFile, "feat").unwrap();
        }
    }
    ctx.commit().unwrap();
    catalogue
}

fn run(
    catalogue: &Arc<Catalogue>,
    plan: &PhysicalPlan,
) -> DbResult<(Vec<String>, Vec<Record>)> {
    let txn = catalogue.transactions().begin(TransactionMode::ReadWrite);
    let mut ctx = ExecutionContext::new(catalogue, Arc::clone(&txn));
    let result = execute_collect(plan, &mut ctx);
    drop(ctx);
    match &result {
        Ok(_) => txn.commit()?,
        Err(_) => {
            let _ = txn.rollback();
        }
    }
    result
}

fn scan(columns: &[&str]) -> PhysicalPlan {
    PhysicalPlan::EntityScan {
        entity: entity_name(),
        columns: columns.iter().map(|c| c.to_string()).collect(),
    }
}

fn id_equals(value: &str) -> BooleanPredicate {
    BooleanPredicate::Atomic {
        column: entity_name().column("id"),
        op: ComparisonOperator::Equal,
        not: false,
        values: vec![Value::String(value.into())],
    }
}

fn knn(k: usize, query: Vec<f64>) -> KnnPredicate {
    KnnPredicate {
        column: entity_name().column("feat"),
        k,
        queries: vec![query],
        weights: None,
        distance: Distance::L2,
        hint: None,
    }
}

#[test]
fn entity_scan_returns_rows_in_insertion_order() {
    let dir = tempdir().unwrap();
    let catalogue = seeded(dir.path(), 3, false);

    let (schema, records) = run(&catalogue, &scan(&["id"])).unwrap();
    assert_eq!(schema, vec!["id"]);
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].values, vec![Value::String("row-0".into())]);
    assert_eq!(records[2].values, vec![Value::String("row-2".into())]);
}

#[test]
fn ranged_scan_respects_bounds() {
    let dir = tempdir().unwrap();
    let catalogue = seeded(dir.path(), 10, false);

    let plan = PhysicalPlan::RangedEntityScan {
        entity: entity_name(),
        columns: vec!["id".into()],
        range: (2, 5),
    };
    let (_, records) = run(&catalogue, &plan).unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].tid, TupleId(2));
    assert_eq!(records[2].tid, TupleId(4));
}

#[test]
fn linear_filter_keeps_matches_only() {
    let dir = tempdir().unwrap();
    let catalogue = seeded(dir.path(), 10, false);

    let plan = PhysicalPlan::LinearScanFilter {
        input: Box::new(scan(&["id", "feat"])),
        predicate: id_equals("row-7"),
    };
    let (_, records) = run(&catalogue, &plan).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].tid, TupleId(7));
}

#[test]
fn indexed_filter_with_fetch_matches_linear() {
    let dir = tempdir().unwrap();
    let catalogue = seeded(dir.path(), 10, true);

    let indexed = PhysicalPlan::FetchColumns {
        input: Box::new(PhysicalPlan::IndexedFilter {
            entity: entity_name(),
            index: "id_unique".into(),
            predicate: id_equals("row-4"),
        }),
        entity: entity_name(),
        columns: vec!["id".into(), "feat".into()],
    };
    let linear = PhysicalPlan::LinearScanFilter {
        input: Box::new(scan(&["id", "feat"])),
        predicate: id_equals("row-4"),
    };
    let (schema_a, a) = run(&catalogue, &indexed).unwrap();
    let (_, b) = run(&catalogue, &linear).unwrap();
    assert_eq!(a.len(), 1);
    assert_eq!(a[0].tid, b[0].tid);
    // The fetch appends feat behind the probed key column.
    assert_eq!(schema_a, vec!["id", "feat"]);
    assert_eq!(a[0].values[1], b[0].values[1]);
}

fn brute_force(catalogue: &Arc<Catalogue>, query: &[f64], k: usize) -> Vec<(TupleId, f64)> {
    let txn = catalogue.transactions().begin(TransactionMode::ReadOnly);
    let entity = catalogue.entity(&entity_name()).unwrap();
    let tx = entity.new_tx(txn).unwrap();
    let knn = KnnPredicate {
        column: entity_name().column("feat"),
        k,
        queries: vec![query.to_vec()],
        weights: None,
        distance: Distance::L2,
        hint: None,
    };
    tx.knn_filter(&knn).unwrap().remove(0)
}

#[test]
fn knn_fullscan_matches_brute_force_reference() {
    let dir = tempdir().unwrap();
    let catalogue = seeded(dir.path(), 60, false);

    for (query, k) in [(vec![3.0, 2.0], 5), (vec![0.0, 0.0], 1), (vec![9.0, 5.0], 10)] {
        let plan = PhysicalPlan::KnnFullscan {
            entity: entity_name(),
            predicate: knn(k, query.clone()),
            prefilter: None,
        };
        let (schema, records) = run(&catalogue, &plan).unwrap();
        assert_eq!(schema, vec!["feat", "distance"]);

        let expected = brute_force(&catalogue, &query, k);
        let got: Vec<(TupleId, f64)> = records
            .iter()
            .map(|r| match &r.values[1] {
                Value::Double(d) => (r.tid, *d),
                other => panic!("distance column held {other:?}"),
            })
            .collect();
        assert_eq!(got, expected, "query {query:?} k {k}");
        // Ascending distance order.
        for pair in got.windows(2) {
            assert!(pair[0].1 <= pair[1].1);
        }
    }
}

#[test]
fn knn_ties_break_by_ascending_tuple_id() {
    let dir = tempdir().unwrap();
    // Rows 0..10 share feat.y = 0 and x = i % 10, so row-0 is the only
    // zero-distance hit; equidistant pairs exist at x ± 1.
    let catalogue = seeded(dir.path(), 10, false);

    let plan = PhysicalPlan::KnnFullscan {
        entity: entity_name(),
        predicate: knn(3, vec![5.0, 0.0]),
        prefilter: None,
    };
    let (_, records) = run(&catalogue, &plan).unwrap();
    assert_eq!(records[0].tid, TupleId(5));
    // 4 and 6 are both at distance 1; the smaller tuple id wins the order.
    assert_eq!(records[1].tid, TupleId(4));
    assert_eq!(records[2].tid, TupleId(6));
}

#[test]
fn knn_with_prefilter_only_considers_matching_rows() {
    let dir = tempdir().unwrap();
    let catalogue = seeded(dir.path(), 30, false);

    let plan = PhysicalPlan::KnnFullscan {
        entity: entity_name(),
        predicate: knn(1, vec![0.0, 0.0]),
        prefilter: Some(id_equals("row-25")),
    };
    let (_, records) = run(&catalogue, &plan).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].tid, TupleId(25));
}

#[test]
fn knn_indexed_agrees_with_fullscan() {
    let dir = tempdir().unwrap();
    let catalogue = seeded(dir.path(), 60, true);

    let query = vec![4.0, 3.0];
    let fullscan = PhysicalPlan::KnnFullscan {
        entity: entity_name(),
        predicate: knn(5, query.clone()),
        prefilter: None,
    };
    let indexed = PhysicalPlan::KnnIndexed {
        entity: entity_name(),
        index: "feat_vaf".into(),
        predicate: knn(5, query),
    };
    let (_, a) = run(&catalogue, &fullscan).unwrap();
    let (_, b) = run(&catalogue, &indexed).unwrap();
    let tids = |rs: &[Record]| rs.iter().map(|r| r.tid).collect::<Vec<_>>();
    assert_eq!(tids(&a), tids(&b));
}

#[test]
fn knn_weighted_distances_change_the_winner() {
    let dir = tempdir().unwrap();
    let catalogue = seeded(dir.path(), 20, false);

    // Heavy weight on the second dimension pulls the winner toward rows
    // with y close to the query.
    let predicate = KnnPredicate {
        column: entity_name().column("feat"),
        k: 1,
        queries: vec![vec![9.0, 1.0]],
        weights: Some(vec![vec![0.01, 100.0]]),
        distance: Distance::SquaredL2,
        hint: None,
    };
    let plan = PhysicalPlan::KnnFullscan {
        entity: entity_name(),
        predicate,
        prefilter: None,
    };
    let (_, records) = run(&catalogue, &plan).unwrap();
    // y = 1 rows are tids 10..19; the x distance barely matters.
    assert!(records[0].tid.0 >= 10 && records[0].tid.0 < 20);
}

#[test]
fn select_projection_renames_and_reorders() {
    let dir = tempdir().unwrap();
    let catalogue = seeded(dir.path(), 2, false);

    let plan = PhysicalPlan::SelectProjection {
        input: Box::new(scan(&["id", "feat"])),
        columns: vec![("feat".into(), None), ("id".into(), Some("label".into()))],
    };
    let (schema, records) = run(&catalogue, &plan).unwrap();
    assert_eq!(schema, vec!["feat", "label"]);
    assert_eq!(records[0].values[1], Value::String("row-0".into()));
}

#[test]
fn count_exists_and_aggregates() {
    let dir = tempdir().unwrap();
    let catalogue = seeded(dir.path(), 8, false);

    let (_, count) = run(
        &catalogue,
        &PhysicalPlan::CountProjection {
            input: Box::new(scan(&["id"])),
        },
    )
    .unwrap();
    assert_eq!(count[0].values, vec![Value::Long(8)]);

    let (_, exists) = run(
        &catalogue,
        &PhysicalPlan::ExistsProjection {
            input: Box::new(scan(&["id"])),
        },
    )
    .unwrap();
    assert_eq!(exists[0].values, vec![Value::Boolean(true)]);

    // Non-null scores: 1,2,3,5,6,7 (multiples of four are null).
    let (_, sum) = run(
        &catalogue,
        &PhysicalPlan::Aggregate {
            input: Box::new(scan(&["score"])),
            op: AggregateOp::Sum,
            column: "score".into(),
        },
    )
    .unwrap();
    assert_eq!(sum[0].values, vec![Value::Double(24.0)]);

    let (_, mean) = run(
        &catalogue,
        &PhysicalPlan::Aggregate {
            input: Box::new(scan(&["score"])),
            op: AggregateOp::Mean,
            column: "score".into(),
        },
    )
    .unwrap();
    assert_eq!(mean[0].values, vec![Value::Double(4.0)]);

    let (_, max) = run(
        &catalogue,
        &PhysicalPlan::Aggregate {
            input: Box::new(scan(&["score"])),
            op: AggregateOp::Max,
            column: "score".into(),
        },
    )
    .unwrap();
    assert_eq!(max[0].values, vec![Value::Double(7.0)]);
}

#[test]
fn limit_and_skip() {
    let dir = tempdir().unwrap();
    let catalogue = seeded(dir.path(), 10, false);

    let plan = PhysicalPlan::Limit {
        input: Box::new(scan(&["id"])),
        limit: Some(3),
        skip: Some(4),
    };
    let (_, records) = run(&catalogue, &plan).unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].tid, TupleId(4));
    assert_eq!(records[2].tid, TupleId(6));
}

#[test]
fn dml_operators_report_affected_counts() {
    let dir = tempdir().unwrap();
    let catalogue = seeded(dir.path(), 5, false);

    let insert = PhysicalPlan::Insert {
        entity: entity_name(),
        rows: vec![vec![
            ("id".into(), Value::String("fresh".into())),
            ("feat".into(), Value::FloatVector(vec![9.0, 9.0])),
        ]],
    };
    let (_, inserted) = run(&catalogue, &insert).unwrap();
    assert_eq!(inserted[0].values, vec![Value::Long(1)]);

    let update = PhysicalPlan::Update {
        entity: entity_name(),
        predicate: Some(id_equals("fresh")),
        assignments: vec![("id".into(), Value::String("renamed".into()))],
    };
    let (_, updated) = run(&catalogue, &update).unwrap();
    assert_eq!(updated[0].values, vec![Value::Long(1)]);

    let delete = PhysicalPlan::Delete {
        entity: entity_name(),
        predicate: Some(id_equals("renamed")),
    };
    let (_, deleted) = run(&catalogue, &delete).unwrap();
    assert_eq!(deleted[0].values, vec![Value::Long(1)]);

    let (_, count) = run(
        &catalogue,
        &PhysicalPlan::CountProjection {
            input: Box::new(scan(&["id"])),
        },
    )
    .unwrap();
    assert_eq!(count[0].values, vec![Value::Long(5)]);
}

#[test]
fn sampling_is_deterministic_per_seed() {
    let dir = tempdir().unwrap();
    let catalogue = seeded(dir.path(), 50, false);

    let plan = |seed| PhysicalPlan::EntitySample {
        entity: entity_name(),
        columns: vec!["id".into()],
        size: 10,
        seed,
    };
    let (_, a) = run(&catalogue, &plan(7)).unwrap();
    let (_, b) = run(&catalogue, &plan(7)).unwrap();
    let (_, c) = run(&catalogue, &plan(8)).unwrap();
    let tids = |rs: &[Record]| rs.iter().map(|r| r.tid).collect::<Vec<_>>();
    assert_eq!(tids(&a), tids(&b));
    assert!(tids(&a) != tids(&c) || a.len() != c.len());
    assert!(a.len() <= 10);
}

#[test]
fn cancellation_aborts_the_pipeline() {
    let dir = tempdir().unwrap();
    let catalogue = seeded(dir.path(), 5, false);

    let txn = catalogue.transactions().begin(TransactionMode::ReadOnly);
    let mut ctx = ExecutionContext::new(&catalogue, Arc::clone(&txn));
    let mut operator = build_operator(&scan(&["id"]), 1).unwrap();
    operator.open(&mut ctx).unwrap();
    operator.next(&mut ctx).unwrap().unwrap();

    txn.cancel();
    let err = operator.next(&mut ctx).unwrap_err();
    assert!(matches!(err, common::DbError::Cancelled(_)));
    drop(ctx);
    txn.rollback().unwrap();
}

#[test]
fn parallel_fullscan_agrees_with_serial() {
    let dir = tempdir().unwrap();
    let config = Config::builder()
        .data_dir(dir.path().to_path_buf())
        .buffer_pool_frames(32)
        .knn_workers(4)
        .build();
    let catalogue = Catalogue::open(config).unwrap();
    let ctx = catalogue.transactions().begin(TransactionMode::ReadWrite);
    {
        let cat_tx = catalogue.new_tx(Arc::clone(&ctx)).unwrap();
        let schema = cat_tx.create_schema(&SchemaName::new("s")).unwrap();
        let schema_tx = schema.new_tx(Arc::clone(&ctx)).unwrap();
        let entity = schema_tx
            .create_entity("big", vec![ColumnDef::new("feat", Type::FloatVector(2))])
            .unwrap();
        let tx = entity.new_tx(Arc::clone(&ctx)).unwrap();
        // Enough tuples to cross the parallel threshold.
        for i in 0..5000u32 {
            tx.insert(&[(
                "feat".into(),
                Value::FloatVector(vec![(i % 71) as f32, (i % 113) as f32]),
            )])
            .unwrap();
        }
    }
    ctx.commit().unwrap();

    let entity = SchemaName::new("s").entity("big");
    let predicate = KnnPredicate {
        column: entity.column("feat"),
        k: 7,
        queries: vec![vec![35.0, 60.0]],
        weights: None,
        distance: Distance::L2,
        hint: None,
    };
    let plan = PhysicalPlan::KnnFullscan {
        entity: entity.clone(),
        predicate: predicate.clone(),
        prefilter: None,
    };
    let (_, parallel) = run(&catalogue, &plan).unwrap();

    let txn = catalogue.transactions().begin(TransactionMode::ReadOnly);
    let tx = catalogue.entity(&entity).unwrap().new_tx(txn).unwrap();
    let expected = tx.knn_filter(&predicate).unwrap().remove(0);
    let got: Vec<(TupleId, f64)> = parallel
        .iter()
        .map(|r| match &r.values[1] {
            Value::Double(d) => (r.tid, *d),
            other => panic!("distance column held {other:?}"),
        })
        .collect();
    assert_eq!(got, expected);
}

#[test]
fn optimize_entity_operator_runs() {
    let dir = tempdir().unwrap();
    let catalogue = seeded(dir.path(), 10, true);

    let plan = PhysicalPlan::OptimizeEntity {
        entity: entity_name(),
    };
    let (_, records) = run(&catalogue, &plan).unwrap();
    assert_eq!(records[0].values, vec![Value::Boolean(true)]);
}
