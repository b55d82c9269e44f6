//! Canonical fixtures: the two-column vector entity the scenario tests
//! revolve around, plus query constructors.

use column::ColumnDef;
use common::{
    ComparisonOperator, Distance, EntityName, KnnPredicate, Projection, ProjectionOp, Query,
    QuerySource, SchemaName, TupleId,
};
use engine::HareDb;
use txn::TransactionMode;
use types::{Type, Value};

/// Create schema `s` with entity `e(id: string, feat: float_vec[2])`.
pub fn vector_entity(db: &HareDb) -> EntityName {
    let schema = SchemaName::new("s");
    db.create_schema(&schema).unwrap();
    let entity = schema.entity("e");
    db.create_entity(
        &entity,
        vec![
            ColumnDef::new("id", Type::String),
            ColumnDef::new("feat", Type::FloatVector(2)),
        ],
    )
    .unwrap();
    entity
}

/// Insert labelled vectors in one committed transaction.
pub fn seed_vectors(db: &HareDb, entity: &EntityName, rows: &[(&str, [f32; 2])]) -> Vec<TupleId> {
    let ctx = db.begin(TransactionMode::ReadWrite);
    let rows: Vec<Vec<(String, Value)>> = rows
        .iter()
        .map(|(id, feat)| {
            vec![
                ("id".to_string(), Value::String(id.to_string())),
                ("feat".to_string(), Value::FloatVector(feat.to_vec())),
            ]
        })
        .collect();
    let tids = db.insert(entity, &rows, &ctx).unwrap();
    ctx.commit().unwrap();
    tids
}

/// `SELECT <columns> FROM entity`.
pub fn select(entity: &EntityName, columns: &[&str]) -> Query {
    Query {
        from: QuerySource::Entity(entity.clone()),
        predicate: None,
        knn: None,
        projection: Projection {
            op: ProjectionOp::Select,
            columns: columns
                .iter()
                .map(|c| (entity.column(*c), None))
                .collect(),
        },
        limit: None,
        skip: None,
    }
}

/// `SELECT COUNT(*) FROM entity`.
pub fn count(entity: &EntityName) -> Query {
    Query {
        from: QuerySource::Entity(entity.clone()),
        predicate: None,
        knn: None,
        projection: Projection {
            op: ProjectionOp::Count,
            columns: vec![],
        },
        limit: None,
        skip: None,
    }
}

/// `SELECT <columns> FROM entity KNN(feat, distance, query) LIMIT k`.
pub fn knn(
    entity: &EntityName,
    k: usize,
    query: Vec<f64>,
    distance: Distance,
    columns: &[&str],
) -> Query {
    Query {
        from: QuerySource::Entity(entity.clone()),
        predicate: None,
        knn: Some(KnnPredicate {
            column: entity.column("feat"),
            k,
            queries: vec![query],
            weights: None,
            distance,
            hint: None,
        }),
        projection: Projection {
            op: ProjectionOp::Select,
            columns: columns
                .iter()
                .map(|c| (entity.column(*c), None))
                .collect(),
        },
        limit: Some(k as u64),
        skip: None,
    }
}

/// `column = value` equality predicate over a string column.
pub fn id_equals(entity: &EntityName, value: &str) -> common::BooleanPredicate {
    common::BooleanPredicate::Atomic {
        column: entity.column("id"),
        op: ComparisonOperator::Equal,
        not: false,
        values: vec![Value::String(value.to_string())],
    }
}
