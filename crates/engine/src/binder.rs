//! The binder attaches catalogue objects to a wire-level query and lowers
//! it to a logical plan. All name and type errors surface here, before
//! any plan is built or any state is touched.

use catalog::Catalogue;
use column::ColumnDef;
use common::{
    BooleanPredicate, ComparisonOperator, DbError, DbResult, EntityName, KnnPredicate,
    ProjectionOp, Query, QuerySource,
};
use planner::LogicalPlan;
use std::sync::Arc;
use types::Value;

/// Synthetic column produced by the kNN operators.
const DISTANCE_COLUMN: &str = "distance";

pub fn bind(query: &Query, catalogue: &Arc<Catalogue>) -> DbResult<LogicalPlan> {
    let entity_name = query.from.entity().clone();
    let entity = catalogue.entity(&entity_name)?;
    let defs: Vec<ColumnDef> = entity.columns().iter().map(|c| c.def().clone()).collect();

    if let Some(predicate) = &query.predicate {
        check_predicate(predicate, &entity_name, &defs)?;
    }
    if let Some(knn) = &query.knn {
        check_knn(knn, &entity_name, &defs)?;
    }

    // Projection columns resolve against the entity, except the synthetic
    // distance column of a kNN query. An empty SELECT means every column.
    let projection: Vec<(String, Option<String>)> =
        if query.projection.op == ProjectionOp::Select && query.projection.columns.is_empty() {
            defs.iter().map(|d| (d.name.clone(), None)).collect()
        } else {
            query
                .projection
                .columns
                .iter()
                .map(|(column, alias)| {
                    let lowered = column.name.to_lowercase();
                    if lowered != DISTANCE_COLUMN || query.knn.is_none() {
                        find_def(&defs, &lowered).ok_or_else(|| {
                            DbError::ColumnDoesNotExist(
                                entity_name.column(&lowered).to_string(),
                            )
                        })?;
                    }
                    Ok((lowered, alias.clone()))
                })
                .collect::<DbResult<Vec<_>>>()?
        };

    // The scan must produce every column the filter and the projection
    // consume; the kNN vector column is produced by the kNN operator
    // itself.
    let mut scan_columns: Vec<String> = Vec::new();
    for (column, _) in &projection {
        if column != DISTANCE_COLUMN && !scan_columns.contains(column) {
            scan_columns.push(column.clone());
        }
    }
    if let Some(predicate) = &query.predicate {
        for column in predicate.columns() {
            if !scan_columns.contains(&column.name) {
                scan_columns.push(column.name.clone());
            }
        }
    }

    let mut plan = match &query.from {
        QuerySource::Entity(_) => LogicalPlan::EntityScan {
            entity: entity_name.clone(),
            columns: scan_columns,
        },
        QuerySource::Sample { size, seed, .. } => LogicalPlan::Sample {
            entity: entity_name.clone(),
            columns: scan_columns,
            size: *size,
            seed: *seed,
        },
    };
    if let Some(predicate) = &query.predicate {
        plan = LogicalPlan::Filter {
            input: Box::new(plan),
            predicate: predicate.clone(),
        };
    }
    if let Some(knn) = &query.knn {
        plan = LogicalPlan::Knn {
            input: Box::new(plan),
            predicate: knn.clone(),
        };
    }
    plan = LogicalPlan::Projection {
        input: Box::new(plan),
        op: query.projection.op,
        columns: projection,
    };
    if query.limit.is_some() || query.skip.is_some() {
        plan = LogicalPlan::Limit {
            input: Box::new(plan),
            limit: query.limit,
            skip: query.skip,
        };
    }
    Ok(plan)
}

fn find_def<'a>(defs: &'a [ColumnDef], simple: &str) -> Option<&'a ColumnDef> {
    defs.iter().find(|d| d.name == simple)
}

fn check_predicate(
    predicate: &BooleanPredicate,
    entity: &EntityName,
    defs: &[ColumnDef],
) -> DbResult<()> {
    match predicate {
        BooleanPredicate::Compound { left, right, .. } => {
            check_predicate(left, entity, defs)?;
            check_predicate(right, entity, defs)
        }
        BooleanPredicate::Atomic {
            column,
            op,
            values,
            ..
        } => {
            if column.entity != *entity {
                return Err(DbError::QueryBind(format!(
                    "predicate column '{column}' does not belong to entity '{entity}'"
                )));
            }
            let def = find_def(defs, &column.name).ok_or_else(|| {
                DbError::ColumnDoesNotExist(entity.column(&column.name).to_string())
            })?;

            let arity_ok = match op {
                ComparisonOperator::IsNull => values.is_empty(),
                ComparisonOperator::Between => values.len() == 2,
                ComparisonOperator::In => !values.is_empty(),
                _ => values.len() == 1,
            };
            if !arity_ok {
                return Err(DbError::QuerySyntax(format!(
                    "operator {op:?} on '{column}' got {} value(s)",
                    values.len()
                )));
            }
            for value in values {
                if matches!(value, Value::Null) {
                    return Err(DbError::QueryBind(format!(
                        "null literal in predicate on '{column}'; use ISNULL"
                    )));
                }
                if !def.ty.accepts(value) {
                    return Err(DbError::QueryBind(format!(
                        "value {value:?} does not fit column '{column}' ({})",
                        def.ty
                    )));
                }
            }
            Ok(())
        }
    }
}

fn check_knn(knn: &KnnPredicate, entity: &EntityName, defs: &[ColumnDef]) -> DbResult<()> {
    if knn.column.entity != *entity {
        return Err(DbError::QueryBind(format!(
            "kNN column '{}' does not belong to entity '{entity}'",
            knn.column
        )));
    }
    let def = find_def(defs, &knn.column.name).ok_or_else(|| {
        DbError::ColumnDoesNotExist(entity.column(&knn.column.name).to_string())
    })?;
    if !def.ty.is_vector() {
        return Err(DbError::QueryBind(format!(
            "kNN over non-vector column '{}' ({})",
            knn.column, def.ty
        )));
    }
    if knn.k == 0 || knn.queries.is_empty() {
        return Err(DbError::QueryBind(format!(
            "kNN on '{}' needs k > 0 and at least one query vector",
            knn.column
        )));
    }
    let dims = def.ty.logical_size();
    for query in &knn.queries {
        if query.len() != dims {
            return Err(DbError::QueryBind(format!(
                "query vector with {} components against '{}' ({dims} expected)",
                query.len(),
                knn.column
            )));
        }
    }
    if let Some(weights) = &knn.weights {
        if weights.len() != knn.queries.len() || weights.iter().any(|w| w.len() != dims) {
            return Err(DbError::QueryBind(format!(
                "weights on '{}' do not match the query vectors",
                knn.column
            )));
        }
    }
    Ok(())
}
