use super::*;
use crate::query::{BooleanPredicate, ComparisonOperator, Connector, KnnPredicate};
use types::Value;

#[test]
fn names_are_fully_qualified() {
    let schema = SchemaName::new("Cottontail");
    let entity = schema.entity("Test");
    let column = entity.column("Feature");

    assert_eq!(schema.to_string(), "warren.cottontail");
    assert_eq!(entity.to_string(), "warren.cottontail.test");
    assert_eq!(column.to_string(), "warren.cottontail.test.feature");
    assert_eq!(column.simple(), "feature");
}

#[test]
fn predicate_column_collection() {
    let entity = SchemaName::new("s").entity("e");
    let pred = BooleanPredicate::Compound {
        connector: Connector::And,
        left: Box::new(BooleanPredicate::Atomic {
            column: entity.column("a"),
            op: ComparisonOperator::Equal,
            not: false,
            values: vec![Value::Int(1)],
        }),
        right: Box::new(BooleanPredicate::Atomic {
            column: entity.column("b"),
            op: ComparisonOperator::IsNull,
            not: true,
            values: vec![],
        }),
    };

    let columns: Vec<String> = pred.columns().iter().map(|c| c.simple().into()).collect();
    assert_eq!(columns, vec!["a", "b"]);
    assert_eq!(pred.atom_count(), 2);
}

#[test]
fn near_unit_weights_are_dropped() {
    let entity = SchemaName::new("s").entity("e");
    let mut knn = KnnPredicate {
        column: entity.column("feat"),
        k: 3,
        queries: vec![vec![1.0, 0.0]],
        weights: Some(vec![vec![1.0, 1.0 + 1e-12]]),
        distance: Distance::L2,
        hint: None,
    };
    assert!(knn.effective_weights().is_none());

    knn.weights = Some(vec![vec![2.0, 1.0]]);
    assert!(knn.effective_weights().is_some());
}

#[test]
fn cost_total_is_weighted_and_invalid_propagates() {
    let c = Cost::new(2.0, 4.0, 10.0);
    assert!((c.total() - (2.0 + 2.0 + 1.0)).abs() < 1e-6);
    assert!(Cost::INVALID.is_invalid());
    assert!((Cost::ZERO + Cost::INVALID).is_invalid());
    assert!(!(Cost::ZERO + c).is_invalid());
}

#[test]
fn config_defaults() {
    let config = Config::default();
    assert_eq!(config.page_size, 4096);
    assert_eq!(config.buffer_pool_frames, 256);
    assert_eq!(config.plan_cache_capacity, 100);
    assert!(!config.wal);
}

#[test]
fn errors_render_qualified_names() {
    let entity = SchemaName::new("s").entity("e");
    let err = DbError::EntityDoesNotExist(entity.to_string());
    assert_eq!(err.to_string(), "entity 'warren.s.e' does not exist");
}

#[test]
fn queries_serialize_round_trip() {
    let entity = SchemaName::new("s").entity("e");
    let query = Query {
        from: query::QuerySource::Entity(entity.clone()),
        predicate: Some(BooleanPredicate::Atomic {
            column: entity.column("id"),
            op: ComparisonOperator::In,
            not: false,
            values: vec![Value::String("a".into()), Value::String("b".into())],
        }),
        knn: Some(KnnPredicate {
            column: entity.column("feat"),
            k: 10,
            queries: vec![vec![0.25, -1.5]],
            weights: None,
            distance: Distance::Cosine,
            hint: Some("feat_vaf".into()),
        }),
        projection: query::Projection {
            op: query::ProjectionOp::Select,
            columns: vec![(entity.column("id"), Some("label".into()))],
        },
        limit: Some(10),
        skip: None,
    };

    let json = serde_json::to_string(&query).unwrap();
    let back: Query = serde_json::from_str(&json).unwrap();
    assert_eq!(query, back);
}
