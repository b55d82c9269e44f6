use super::*;
use catalog::Catalogue;
use column::ColumnDef;
use common::{
    BooleanPredicate, ComparisonOperator, Config, Distance, ProjectionOp, SchemaName,
};
use index::IndexKind;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tempfile::tempdir;
use txn::TransactionMode;
use types::{Type, Value};

fn entity_name() -> EntityName {
    SchemaName::new("s").entity("e")
}

fn seeded_catalogue(dir: &std::path::Path, with_indexes: bool) -> Arc<Catalogue> {
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
                ],
            )
            .unwrap();
        let tx = entity.new_tx(Arc::clone(&ctx)).unwrap();
        for i in 0..20 {
            tx.insert(&[
                ("id".into(), Value::String(format!("row-{i}"))),
                (
                    "feat".into(),
                    Value::FloatVector(vec![i as f32, (i % 5) as f32]),
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

fn id_equals(value: &str) -> BooleanPredicate {
    BooleanPredicate::Atomic {
        column: entity_name().column("id"),
        op: ComparisonOperator::Equal,
        not: false,
        values: vec![Value::String(value.into())],
    }
}

fn knn_predicate(k: usize) -> common::KnnPredicate {
    common::KnnPredicate {
        column: entity_name().column("feat"),
        k,
        queries: vec![vec![1.0, 0.0]],
        weights: None,
        distance: Distance::L2,
        hint: None,
    }
}

fn select_query(input: LogicalPlan) -> LogicalPlan {
    LogicalPlan::Projection {
        input: Box::new(input),
        op: ProjectionOp::Select,
        columns: vec![("id".into(), None)],
    }
}

mod stage_one {
    use super::*;
    use crate::rules::stage_one;
    use pretty_assertions::assert_eq;

    #[test]
    fn between_with_equal_bounds_folds_to_equality() {
        let plan = LogicalPlan::Filter {
            input: Box::new(LogicalPlan::EntityScan {
                entity: entity_name(),
                columns: vec!["id".into()],
            }),
            predicate: BooleanPredicate::Atomic {
                column: entity_name().column("id"),
                op: ComparisonOperator::Between,
                not: false,
                values: vec![Value::String("a".into()), Value::String("a".into())],
            },
        };
        let rewritten = stage_one(plan);
        match &rewritten[0] {
            LogicalPlan::Filter { predicate, .. } => match predicate {
                BooleanPredicate::Atomic { op, values, .. } => {
                    assert_eq!(*op, ComparisonOperator::Equal);
                    assert_eq!(values.len(), 1);
                }
                other => panic!("unexpected predicate {other:?}"),
            },
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn negations_fold_into_dual_operators() {
        let plan = LogicalPlan::Filter {
            input: Box::new(LogicalPlan::EntityScan {
                entity: entity_name(),
                columns: vec!["id".into()],
            }),
            predicate: BooleanPredicate::Atomic {
                column: entity_name().column("id"),
                op: ComparisonOperator::Less,
                not: true,
                values: vec![Value::String("m".into())],
            },
        };
        match &stage_one(plan)[0] {
            LogicalPlan::Filter { predicate, .. } => match predicate {
                BooleanPredicate::Atomic { op, not, .. } => {
                    assert_eq!(*op, ComparisonOperator::GreaterEqual);
                    assert!(!not);
                }
                other => panic!("unexpected predicate {other:?}"),
            },
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn limit_pushes_through_select_projection() {
        let plan = LogicalPlan::Limit {
            input: Box::new(select_query(LogicalPlan::EntityScan {
                entity: entity_name(),
                columns: vec!["id".into()],
            })),
            limit: Some(5),
            skip: None,
        };
        match &stage_one(plan)[0] {
            LogicalPlan::Projection { input, .. } => {
                assert!(matches!(&**input, LogicalPlan::Limit { .. }));
            }
            other => panic!("limit was not pushed below the projection: {other:?}"),
        }
    }

    #[test]
    fn nested_select_projections_collapse() {
        let plan = select_query(select_query(LogicalPlan::EntityScan {
            entity: entity_name(),
            columns: vec!["id".into()],
        }));
        match &stage_one(plan)[0] {
            LogicalPlan::Projection { input, .. } => {
                assert!(matches!(&**input, LogicalPlan::EntityScan { .. }));
            }
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn projection_pushdown_narrows_the_scan() {
        let plan = select_query(LogicalPlan::Filter {
            input: Box::new(LogicalPlan::EntityScan {
                entity: entity_name(),
                columns: vec!["id".into(), "feat".into(), "unused".into()],
            }),
            predicate: id_equals("row-1"),
        });
        match &stage_one(plan)[0] {
            LogicalPlan::Projection { input, .. } => match &**input {
                LogicalPlan::Filter { input, .. } => match &**input {
                    LogicalPlan::EntityScan { columns, .. } => {
                        assert_eq!(columns, &vec!["id".to_string()]);
                    }
                    other => panic!("unexpected scan {other:?}"),
                },
                other => panic!("unexpected input {other:?}"),
            },
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn knn_over_filter_offers_the_reordered_variant() {
        let plan = LogicalPlan::Knn {
            input: Box::new(LogicalPlan::Filter {
                input: Box::new(LogicalPlan::EntityScan {
                    entity: entity_name(),
                    columns: vec!["feat".into()],
                }),
                predicate: id_equals("row-1"),
            }),
            predicate: knn_predicate(3),
        };
        let variants = stage_one(plan);
        assert_eq!(variants.len(), 2);
        assert!(matches!(&variants[1], LogicalPlan::Filter { input, .. }
            if matches!(&**input, LogicalPlan::Knn { .. })));
    }
}

#[test]
fn filter_plans_include_index_candidates() {
    let dir = tempdir().unwrap();
    let catalogue = seeded_catalogue(dir.path(), true);
    let planner = Planner::new(10);
    let ctx = PlanningContext::new(&catalogue);

    let logical = LogicalPlan::Filter {
        input: Box::new(LogicalPlan::EntityScan {
            entity: entity_name(),
            columns: vec!["id".into()],
        }),
        predicate: id_equals("row-3"),
    };
    let candidates = planner.plan(&logical, &ctx).unwrap();

    assert!(candidates
        .iter()
        .any(|p| matches!(p, PhysicalPlan::LinearScanFilter { .. })));
    assert!(candidates.iter().any(|p| matches!(
        p,
        PhysicalPlan::FetchColumns { input, .. }
            if matches!(&**input, PhysicalPlan::IndexedFilter { index, .. } if index == "id_unique")
    )));
}

#[test]
fn without_indexes_only_the_linear_filter_remains() {
    let dir = tempdir().unwrap();
    let catalogue = seeded_catalogue(dir.path(), false);
    let planner = Planner::new(10);
    let ctx = PlanningContext::new(&catalogue);

    let logical = LogicalPlan::Filter {
        input: Box::new(LogicalPlan::EntityScan {
            entity: entity_name(),
            columns: vec!["id".into()],
        }),
        predicate: id_equals("row-3"),
    };
    let candidates = planner.plan(&logical, &ctx).unwrap();
    assert_eq!(candidates.len(), 1);
    assert!(matches!(&candidates[0], PhysicalPlan::LinearScanFilter { .. }));
}

#[test]
fn knn_plans_offer_fullscan_and_va_file() {
    let dir = tempdir().unwrap();
    let catalogue = seeded_catalogue(dir.path(), true);
    let planner = Planner::new(10);
    let ctx = PlanningContext::new(&catalogue);

    let logical = LogicalPlan::Knn {
        input: Box::new(LogicalPlan::EntityScan {
            entity: entity_name(),
            columns: vec!["id".into(), "feat".into()],
        }),
        predicate: knn_predicate(3),
    };
    let candidates = planner.plan(&logical, &ctx).unwrap();
    assert!(candidates.iter().any(|p| matches!(
        p,
        PhysicalPlan::FetchColumns { input, .. }
            if matches!(&**input, PhysicalPlan::KnnFullscan { .. })
    )));
    assert!(candidates.iter().any(|p| matches!(
        p,
        PhysicalPlan::FetchColumns { input, .. }
            if matches!(&**input, PhysicalPlan::KnnIndexed { index, .. } if index == "feat_vaf")
    )));
}

#[test]
fn plan_cache_returns_the_identical_arc() {
    let dir = tempdir().unwrap();
    let catalogue = seeded_catalogue(dir.path(), false);
    let planner = Planner::new(10);
    let ctx = PlanningContext::new(&catalogue);

    let logical = select_query(LogicalPlan::EntityScan {
        entity: entity_name(),
        columns: vec!["id".into()],
    });
    let first = planner.plan_and_select(&logical, &ctx, false).unwrap();
    let second = planner.plan_and_select(&logical, &ctx, false).unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    // The bypass flag produces a fresh plan object.
    let fresh = planner.plan_and_select(&logical, &ctx, true).unwrap();
    assert!(!Arc::ptr_eq(&first, &fresh));
    assert_eq!(*first, *fresh);
}

#[test]
fn distinct_bind_values_use_distinct_cache_slots() {
    let a = select_query(LogicalPlan::Filter {
        input: Box::new(LogicalPlan::EntityScan {
            entity: entity_name(),
            columns: vec!["id".into()],
        }),
        predicate: id_equals("row-1"),
    });
    let b = select_query(LogicalPlan::Filter {
        input: Box::new(LogicalPlan::EntityScan {
            entity: entity_name(),
            columns: vec!["id".into()],
        }),
        predicate: id_equals("row-2"),
    });
    assert_ne!(digest(&a), digest(&b));
    assert_eq!(digest(&a), digest(&a.clone()));
}

#[test]
fn planner_is_idempotent_on_cost() {
    let dir = tempdir().unwrap();
    let catalogue = seeded_catalogue(dir.path(), true);
    let planner = Planner::new(10);
    let ctx = PlanningContext::new(&catalogue);

    let logical = select_query(LogicalPlan::Filter {
        input: Box::new(LogicalPlan::EntityScan {
            entity: entity_name(),
            columns: vec!["id".into()],
        }),
        predicate: id_equals("row-3"),
    });
    let best = planner.plan_and_select(&logical, &ctx, true).unwrap();
    let best_cost = crate::cost::cost(&best, &ctx).total();

    let replanned = planner.plan(&best.to_logical(), &ctx).unwrap();
    let has_equal_cost = replanned
        .iter()
        .any(|p| (crate::cost::cost(p, &ctx).total() - best_cost).abs() < 1e-6);
    assert!(has_equal_cost);
}

#[test]
fn unplannable_shapes_report_query_planner_errors() {
    let dir = tempdir().unwrap();
    let catalogue = seeded_catalogue(dir.path(), false);
    let planner = Planner::new(10);
    let ctx = PlanningContext::new(&catalogue);

    // kNN over a sample source has no physical implementation.
    let logical = LogicalPlan::Knn {
        input: Box::new(LogicalPlan::Sample {
            entity: entity_name(),
            columns: vec!["feat".into()],
            size: 5,
            seed: 1,
        }),
        predicate: knn_predicate(2),
    };
    let err = planner.plan(&logical, &ctx).unwrap_err();
    assert!(matches!(err, common::DbError::QueryPlanner(_)));
}

#[test]
fn limit_over_clean_scan_gets_a_ranged_variant() {
    let dir = tempdir().unwrap();
    let catalogue = seeded_catalogue(dir.path(), false);
    let planner = Planner::new(10);
    let ctx = PlanningContext::new(&catalogue);

    let logical = LogicalPlan::Limit {
        input: Box::new(select_query(LogicalPlan::EntityScan {
            entity: entity_name(),
            columns: vec!["id".into()],
        })),
        limit: Some(3),
        skip: None,
    };
    let candidates = planner.plan(&logical, &ctx).unwrap();
    let has_ranged = candidates.iter().any(|p| {
        explain_physical(p).contains("RangedEntityScan")
    });
    assert!(has_ranged, "{candidates:#?}");
}
