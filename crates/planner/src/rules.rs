//! The two rule stages.
//!
//! Stage one rewrites the logical tree: constant folding, predicate and
//! projection pushdown, LIMIT through sort-free operators, redundant
//! projection elimination, and the kNN-before-where reordering for
//! selective kNN. It returns the canonical tree plus any semantically
//! admissible alternates.
//!
//! Stage two replaces each logical node by its physical implementations:
//! filters become indexed or linear scans, kNN becomes indexed or
//! parallel fullscan, and a LIMIT directly over a plain scan becomes a
//! ranged scan.

use crate::{AggregateOp, LogicalPlan, PhysicalPlan, PlanningContext};
use common::{BooleanPredicate, ComparisonOperator, DbResult, ProjectionOp};

/// Stage 1: logical → logical. The first element is the canonical
/// rewrite; the rest are alternates the cost model may prefer.
pub(crate) fn stage_one(plan: LogicalPlan) -> Vec<LogicalPlan> {
    let canonical = prune_projections(push_limit(push_predicates(push_projection(
        fold_constants(plan),
    ))));
    let mut variants = vec![canonical.clone()];
    variants.extend(knn_before_where(&canonical));
    variants
}

/// Narrow the scan at the bottom of a select/aggregate pipeline to the
/// columns the pipeline actually consumes.
fn push_projection(plan: LogicalPlan) -> LogicalPlan {
    match plan {
        LogicalPlan::Projection { input, op, columns } => {
            let mut required: Vec<String> = columns
                .iter()
                .map(|(name, _)| name.clone())
                .filter(|name| name != "distance")
                .collect();
            LogicalPlan::Projection {
                input: Box::new(narrow_scan(*input, &mut required)),
                op,
                columns,
            }
        }
        LogicalPlan::Limit { input, limit, skip } => LogicalPlan::Limit {
            input: Box::new(push_projection(*input)),
            limit,
            skip,
        },
        other => other,
    }
}

fn narrow_scan(plan: LogicalPlan, required: &mut Vec<String>) -> LogicalPlan {
    match plan {
        LogicalPlan::Filter { input, predicate } => {
            for column in predicate.columns() {
                if !required.contains(&column.name) {
                    required.push(column.name.clone());
                }
            }
            LogicalPlan::Filter {
                input: Box::new(narrow_scan(*input, required)),
                predicate,
            }
        }
        // The kNN operator produces its own vector column.
        LogicalPlan::Knn { input, predicate } => LogicalPlan::Knn {
            input: Box::new(narrow_scan(*input, required)),
            predicate,
        },
        LogicalPlan::Limit { input, limit, skip } => LogicalPlan::Limit {
            input: Box::new(narrow_scan(*input, required)),
            limit,
            skip,
        },
        LogicalPlan::EntityScan { entity, columns } => LogicalPlan::EntityScan {
            entity,
            columns: columns
                .into_iter()
                .filter(|c| required.contains(c))
                .collect(),
        },
        LogicalPlan::Sample {
            entity,
            columns,
            size,
            seed,
        } => LogicalPlan::Sample {
            entity,
            columns: columns
                .into_iter()
                .filter(|c| required.contains(c))
                .collect(),
            size,
            seed,
        },
        other => other,
    }
}

/// Fold constant-decidable predicate shapes.
fn fold_constants(plan: LogicalPlan) -> LogicalPlan {
    map_predicates(plan, &fold_predicate)
}

fn fold_predicate(pred: BooleanPredicate) -> BooleanPredicate {
    match pred {
        BooleanPredicate::Compound {
            connector,
            left,
            right,
        } => {
            let left = fold_predicate(*left);
            let right = fold_predicate(*right);
            if left == right {
                // X AND X == X OR X == X
                left
            } else {
                BooleanPredicate::Compound {
                    connector,
                    left: Box::new(left),
                    right: Box::new(right),
                }
            }
        }
        BooleanPredicate::Atomic {
            column,
            op,
            not,
            values,
        } => {
            // BETWEEN with equal bounds is an equality probe.
            let (op, values) = if op == ComparisonOperator::Between
                && values.len() == 2
                && values[0] == values[1]
            {
                (ComparisonOperator::Equal, vec![values[0].clone()])
            } else {
                (op, values)
            };
            // Fold a negation into the operator where a dual exists.
            let (op, not) = match (op, not) {
                (ComparisonOperator::Equal, true) => (ComparisonOperator::NotEqual, false),
                (ComparisonOperator::NotEqual, true) => (ComparisonOperator::Equal, false),
                (ComparisonOperator::Less, true) => (ComparisonOperator::GreaterEqual, false),
                (ComparisonOperator::GreaterEqual, true) => (ComparisonOperator::Less, false),
                (ComparisonOperator::Greater, true) => (ComparisonOperator::LessEqual, false),
                (ComparisonOperator::LessEqual, true) => (ComparisonOperator::Greater, false),
                other => other,
            };
            BooleanPredicate::Atomic {
                column,
                op,
                not,
                values,
            }
        }
    }
}

fn map_predicates(
    plan: LogicalPlan,
    f: &dyn Fn(BooleanPredicate) -> BooleanPredicate,
) -> LogicalPlan {
    match plan {
        LogicalPlan::Filter { input, predicate } => LogicalPlan::Filter {
            input: Box::new(map_predicates(*input, f)),
            predicate: f(predicate),
        },
        LogicalPlan::Knn { input, predicate } => LogicalPlan::Knn {
            input: Box::new(map_predicates(*input, f)),
            predicate,
        },
        LogicalPlan::Projection { input, op, columns } => LogicalPlan::Projection {
            input: Box::new(map_predicates(*input, f)),
            op,
            columns,
        },
        LogicalPlan::Limit { input, limit, skip } => LogicalPlan::Limit {
            input: Box::new(map_predicates(*input, f)),
            limit,
            skip,
        },
        LogicalPlan::Update {
            entity,
            predicate,
            assignments,
        } => LogicalPlan::Update {
            entity,
            predicate: predicate.map(f),
            assignments,
        },
        LogicalPlan::Delete { entity, predicate } => LogicalPlan::Delete {
            entity,
            predicate: predicate.map(f),
        },
        leaf => leaf,
    }
}

/// Push filters beneath projections so they run closer to the scan.
fn push_predicates(plan: LogicalPlan) -> LogicalPlan {
    match plan {
        LogicalPlan::Filter { input, predicate } => match *input {
            LogicalPlan::Projection {
                input: inner,
                op,
                columns,
            } => push_predicates(LogicalPlan::Projection {
                input: Box::new(LogicalPlan::Filter {
                    input: inner,
                    predicate,
                }),
                op,
                columns,
            }),
            other => LogicalPlan::Filter {
                input: Box::new(push_predicates(other)),
                predicate,
            },
        },
        LogicalPlan::Projection { input, op, columns } => LogicalPlan::Projection {
            input: Box::new(push_predicates(*input)),
            op,
            columns,
        },
        LogicalPlan::Knn { input, predicate } => LogicalPlan::Knn {
            input: Box::new(push_predicates(*input)),
            predicate,
        },
        LogicalPlan::Limit { input, limit, skip } => LogicalPlan::Limit {
            input: Box::new(push_predicates(*input)),
            limit,
            skip,
        },
        other => other,
    }
}

/// Push LIMIT through sort-free operators (projections). Breakers (kNN,
/// aggregates) stop the descent.
fn push_limit(plan: LogicalPlan) -> LogicalPlan {
    match plan {
        LogicalPlan::Limit { input, limit, skip } => match *input {
            LogicalPlan::Projection {
                input: inner,
                op: ProjectionOp::Select,
                columns,
            } => push_limit(LogicalPlan::Projection {
                input: Box::new(LogicalPlan::Limit {
                    input: inner,
                    limit,
                    skip,
                }),
                op: ProjectionOp::Select,
                columns,
            }),
            other => LogicalPlan::Limit {
                input: Box::new(push_limit(other)),
                limit,
                skip,
            },
        },
        LogicalPlan::Projection { input, op, columns } => LogicalPlan::Projection {
            input: Box::new(push_limit(*input)),
            op,
            columns,
        },
        LogicalPlan::Filter { input, predicate } => LogicalPlan::Filter {
            input: Box::new(push_limit(*input)),
            predicate,
        },
        other => other,
    }
}

/// Collapse directly nested select projections into the outer one.
fn prune_projections(plan: LogicalPlan) -> LogicalPlan {
    match plan {
        LogicalPlan::Projection { input, op, columns } => {
            let input = prune_projections(*input);
            match input {
                LogicalPlan::Projection {
                    input: inner,
                    op: ProjectionOp::Select,
                    ..
                } if op == ProjectionOp::Select => LogicalPlan::Projection {
                    input: inner,
                    op,
                    columns,
                },
                other => LogicalPlan::Projection {
                    input: Box::new(other),
                    op,
                    columns,
                },
            }
        }
        LogicalPlan::Filter { input, predicate } => LogicalPlan::Filter {
            input: Box::new(prune_projections(*input)),
            predicate,
        },
        LogicalPlan::Knn { input, predicate } => LogicalPlan::Knn {
            input: Box::new(prune_projections(*input)),
            predicate,
        },
        LogicalPlan::Limit { input, limit, skip } => LogicalPlan::Limit {
            input: Box::new(prune_projections(*input)),
            limit,
            skip,
        },
        other => other,
    }
}

/// For `Knn(Filter(x))`, also offer `Filter(Knn(x))`: running the kNN
/// first pays off when k is small against a large entity, at the price of
/// post-filtering the k results.
fn knn_before_where(plan: &LogicalPlan) -> Vec<LogicalPlan> {
    match plan {
        LogicalPlan::Knn { input, predicate } => {
            if let LogicalPlan::Filter {
                input: scan,
                predicate: where_pred,
            } = &**input
            {
                return vec![LogicalPlan::Filter {
                    input: Box::new(LogicalPlan::Knn {
                        input: scan.clone(),
                        predicate: predicate.clone(),
                    }),
                    predicate: where_pred.clone(),
                }];
            }
            Vec::new()
        }
        LogicalPlan::Projection { input, op, columns } => knn_before_where(input)
            .into_iter()
            .map(|rewritten| LogicalPlan::Projection {
                input: Box::new(rewritten),
                op: *op,
                columns: columns.clone(),
            })
            .collect(),
        LogicalPlan::Limit { input, limit, skip } => knn_before_where(input)
            .into_iter()
            .map(|rewritten| LogicalPlan::Limit {
                input: Box::new(rewritten),
                limit: *limit,
                skip: *skip,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Stage 2: logical → physical implementations (cross product over
/// children).
pub(crate) fn stage_two(
    plan: &LogicalPlan,
    ctx: &PlanningContext,
) -> DbResult<Vec<PhysicalPlan>> {
    Ok(match plan {
        LogicalPlan::EntityScan { entity, columns } => vec![PhysicalPlan::EntityScan {
            entity: entity.clone(),
            columns: columns.clone(),
        }],
        LogicalPlan::Sample {
            entity,
            columns,
            size,
            seed,
        } => vec![PhysicalPlan::EntitySample {
            entity: entity.clone(),
            columns: columns.clone(),
            size: *size,
            seed: *seed,
        }],
        LogicalPlan::Filter { input, predicate } => {
            // A filter above a kNN is the reordered (approximate) variant:
            // it post-filters an already-truncated top-k and can change
            // results, so it never becomes executable.
            if matches!(&**input, LogicalPlan::Knn { .. }) {
                return Ok(Vec::new());
            }
            let mut out = Vec::new();
            for child in stage_two(input, ctx)? {
                out.push(PhysicalPlan::LinearScanFilter {
                    input: Box::new(child),
                    predicate: predicate.clone(),
                });
            }
            // An index can replace the whole scan+filter only when the
            // input is a plain scan over the same entity.
            if let LogicalPlan::EntityScan { entity, columns } = &**input {
                for idx in ctx.indexes(entity) {
                    if !idx.is_dirty() && idx.can_process(predicate) {
                        out.push(PhysicalPlan::FetchColumns {
                            input: Box::new(PhysicalPlan::IndexedFilter {
                                entity: entity.clone(),
                                index: idx.name().simple().to_string(),
                                predicate: predicate.clone(),
                            }),
                            entity: entity.clone(),
                            columns: columns.clone(),
                        });
                    }
                }
            }
            out
        }
        LogicalPlan::Knn { input, predicate } => {
            let mut out = Vec::new();
            match &**input {
                LogicalPlan::EntityScan { entity, columns } => {
                    out.push(PhysicalPlan::FetchColumns {
                        input: Box::new(PhysicalPlan::KnnFullscan {
                            entity: entity.clone(),
                            predicate: predicate.clone(),
                            prefilter: None,
                        }),
                        entity: entity.clone(),
                        columns: columns.clone(),
                    });
                    for idx in ctx.indexes(entity) {
                        if idx.can_process_knn(predicate) {
                            out.push(PhysicalPlan::FetchColumns {
                                input: Box::new(PhysicalPlan::KnnIndexed {
                                    entity: entity.clone(),
                                    index: idx.name().simple().to_string(),
                                    predicate: predicate.clone(),
                                }),
                                entity: entity.clone(),
                                columns: columns.clone(),
                            });
                        }
                    }
                }
                LogicalPlan::Filter {
                    input: scan,
                    predicate: where_pred,
                } => {
                    if let LogicalPlan::EntityScan { entity, columns } = &**scan {
                        out.push(PhysicalPlan::FetchColumns {
                            input: Box::new(PhysicalPlan::KnnFullscan {
                                entity: entity.clone(),
                                predicate: predicate.clone(),
                                prefilter: Some(where_pred.clone()),
                            }),
                            entity: entity.clone(),
                            columns: columns.clone(),
                        });
                    }
                }
                _ => {}
            }
            out
        }
        LogicalPlan::Projection { input, op, columns } => {
            let mut out = Vec::new();
            for child in stage_two(input, ctx)? {
                let child = Box::new(child);
                out.push(match op {
                    ProjectionOp::Select => PhysicalPlan::SelectProjection {
                        input: child,
                        columns: columns.clone(),
                    },
                    ProjectionOp::Count => PhysicalPlan::CountProjection { input: child },
                    ProjectionOp::Exists => PhysicalPlan::ExistsProjection { input: child },
                    ProjectionOp::Sum
                    | ProjectionOp::Min
                    | ProjectionOp::Max
                    | ProjectionOp::Mean => PhysicalPlan::Aggregate {
                        input: child,
                        op: match op {
                            ProjectionOp::Sum => AggregateOp::Sum,
                            ProjectionOp::Min => AggregateOp::Min,
                            ProjectionOp::Max => AggregateOp::Max,
                            _ => AggregateOp::Mean,
                        },
                        column: columns
                            .first()
                            .map(|(name, _)| name.clone())
                            .unwrap_or_default(),
                    },
                });
            }
            out
        }
        LogicalPlan::Limit { input, limit, skip } => {
            let mut out = Vec::new();
            for child in stage_two(input, ctx)? {
                out.push(PhysicalPlan::Limit {
                    input: Box::new(child),
                    limit: *limit,
                    skip: *skip,
                });
            }
            // A LIMIT straight over a plain scan needs only a tuple-id
            // prefix. Valid only while the entity has no deletions, where
            // tuple ids and row positions coincide.
            if let LogicalPlan::EntityScan { entity, columns } = &**input {
                if let Some(limit) = limit {
                    let stats = ctx.catalogue.entity(entity).map(|e| e.statistics());
                    if let Ok(stats) = stats {
                        if stats.rows == stats.max_tuple_id {
                            let skip = skip.unwrap_or(0);
                            out.push(PhysicalPlan::Limit {
                                input: Box::new(PhysicalPlan::RangedEntityScan {
                                    entity: entity.clone(),
                                    columns: columns.clone(),
                                    range: (0, skip + limit),
                                }),
                                limit: Some(*limit),
                                skip: Some(skip),
                            });
                        }
                    }
                }
            }
            out
        }
        LogicalPlan::Insert { entity, rows } => vec![PhysicalPlan::Insert {
            entity: entity.clone(),
            rows: rows.clone(),
        }],
        LogicalPlan::Update {
            entity,
            predicate,
            assignments,
        } => vec![PhysicalPlan::Update {
            entity: entity.clone(),
            predicate: predicate.clone(),
            assignments: assignments.clone(),
        }],
        LogicalPlan::Delete { entity, predicate } => vec![PhysicalPlan::Delete {
            entity: entity.clone(),
            predicate: predicate.clone(),
        }],
        LogicalPlan::OptimizeEntity { entity } => vec![PhysicalPlan::OptimizeEntity {
            entity: entity.clone(),
        }],
    })
}
