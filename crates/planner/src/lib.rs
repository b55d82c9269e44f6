//! Query planner: a two-stage rule-based rewriter from a logical tree to
//! the cheapest executable physical tree.
//!
//! # Architecture
//!
//! ```text
//! LogicalPlan (from the binder)
//!     ↓ stage 1: logical rewrites
//!       (constant folding, pushdowns, kNN-before-where, ...)
//!     ↓ stage 2: implementation rules
//!       (index selection, ranged scans, parallel kNN)
//! Vec<PhysicalPlan> candidates
//!     ↓ cost model + plan cache
//! Arc<PhysicalPlan>
//! ```
//!
//! `plan` returns every executable candidate; `plan_and_select` digests
//! the logical tree, consults a bounded LRU cache, and on a miss installs
//! the minimum-total-cost candidate. Cache hits return the identical
//! `Arc`, so repeated queries share one plan object.

#[cfg(test)]
mod tests;

mod cache;
mod cost;
mod rules;

pub use cache::{digest, PlanCache};

use catalog::Catalogue;
use common::{
    BooleanPredicate, DbError, DbResult, EntityName, KnnPredicate, ProjectionOp,
};
use std::sync::Arc;
use tracing::debug;
use types::Value;

/// Optimizer-facing plan: names, not handles.
#[derive(Clone, Debug, PartialEq)]
pub enum LogicalPlan {
    EntityScan {
        entity: EntityName,
        columns: Vec<String>,
    },
    Sample {
        entity: EntityName,
        columns: Vec<String>,
        size: u64,
        seed: u64,
    },
    Filter {
        input: Box<LogicalPlan>,
        predicate: BooleanPredicate,
    },
    Knn {
        input: Box<LogicalPlan>,
        predicate: KnnPredicate,
    },
    Projection {
        input: Box<LogicalPlan>,
        op: ProjectionOp,
        columns: Vec<(String, Option<String>)>,
    },
    Limit {
        input: Box<LogicalPlan>,
        limit: Option<u64>,
        skip: Option<u64>,
    },
    Insert {
        entity: EntityName,
        rows: Vec<Vec<(String, Value)>>,
    },
    Update {
        entity: EntityName,
        predicate: Option<BooleanPredicate>,
        assignments: Vec<(String, Value)>,
    },
    Delete {
        entity: EntityName,
        predicate: Option<BooleanPredicate>,
    },
    OptimizeEntity {
        entity: EntityName,
    },
}

/// Aggregate heads below a projection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggregateOp {
    Sum,
    Min,
    Max,
    Mean,
}

/// Executor-facing plan: access methods chosen, indexes named.
#[derive(Clone, Debug, PartialEq)]
pub enum PhysicalPlan {
    EntityScan {
        entity: EntityName,
        columns: Vec<String>,
    },
    RangedEntityScan {
        entity: EntityName,
        columns: Vec<String>,
        range: (u64, u64),
    },
    EntitySample {
        entity: EntityName,
        columns: Vec<String>,
        size: u64,
        seed: u64,
    },
    LinearScanFilter {
        input: Box<PhysicalPlan>,
        predicate: BooleanPredicate,
    },
    IndexedFilter {
        entity: EntityName,
        index: String,
        predicate: BooleanPredicate,
    },
    /// Materialize additional columns for records that carry only a tuple
    /// id (index results).
    FetchColumns {
        input: Box<PhysicalPlan>,
        entity: EntityName,
        columns: Vec<String>,
    },
    KnnFullscan {
        entity: EntityName,
        predicate: KnnPredicate,
        prefilter: Option<BooleanPredicate>,
    },
    KnnIndexed {
        entity: EntityName,
        index: String,
        predicate: KnnPredicate,
    },
    SelectProjection {
        input: Box<PhysicalPlan>,
        columns: Vec<(String, Option<String>)>,
    },
    CountProjection {
        input: Box<PhysicalPlan>,
    },
    ExistsProjection {
        input: Box<PhysicalPlan>,
    },
    Aggregate {
        input: Box<PhysicalPlan>,
        op: AggregateOp,
        column: String,
    },
    Limit {
        input: Box<PhysicalPlan>,
        limit: Option<u64>,
        skip: Option<u64>,
    },
    Insert {
        entity: EntityName,
        rows: Vec<Vec<(String, Value)>>,
    },
    Update {
        entity: EntityName,
        predicate: Option<BooleanPredicate>,
        assignments: Vec<(String, Value)>,
    },
    Delete {
        entity: EntityName,
        predicate: Option<BooleanPredicate>,
    },
    OptimizeEntity {
        entity: EntityName,
    },
}

impl PhysicalPlan {
    /// Map a physical tree back to its logical shape (used for planner
    /// round-trip checks and plan explanation).
    pub fn to_logical(&self) -> LogicalPlan {
        match self {
            PhysicalPlan::EntityScan { entity, columns } => LogicalPlan::EntityScan {
                entity: entity.clone(),
                columns: columns.clone(),
            },
            PhysicalPlan::RangedEntityScan { entity, columns, .. } => LogicalPlan::EntityScan {
                entity: entity.clone(),
                columns: columns.clone(),
            },
            PhysicalPlan::EntitySample {
                entity,
                columns,
                size,
                seed,
            } => LogicalPlan::Sample {
                entity: entity.clone(),
                columns: columns.clone(),
                size: *size,
                seed: *seed,
            },
            PhysicalPlan::LinearScanFilter { input, predicate } => LogicalPlan::Filter {
                input: Box::new(input.to_logical()),
                predicate: predicate.clone(),
            },
            PhysicalPlan::IndexedFilter {
                entity, predicate, ..
            } => LogicalPlan::Filter {
                input: Box::new(LogicalPlan::EntityScan {
                    entity: entity.clone(),
                    columns: predicate.columns().iter().map(|c| c.name.clone()).collect(),
                }),
                predicate: predicate.clone(),
            },
            PhysicalPlan::FetchColumns { input, .. } => input.to_logical(),
            PhysicalPlan::KnnFullscan {
                entity,
                predicate,
                prefilter,
            } => {
                let scan = LogicalPlan::EntityScan {
                    entity: entity.clone(),
                    columns: vec![predicate.column.name.clone()],
                };
                let input = match prefilter {
                    Some(pred) => LogicalPlan::Filter {
                        input: Box::new(scan),
                        predicate: pred.clone(),
                    },
                    None => scan,
                };
                LogicalPlan::Knn {
                    input: Box::new(input),
                    predicate: predicate.clone(),
                }
            }
            PhysicalPlan::KnnIndexed {
                entity, predicate, ..
            } => LogicalPlan::Knn {
                input: Box::new(LogicalPlan::EntityScan {
                    entity: entity.clone(),
                    columns: vec![predicate.column.name.clone()],
                }),
                predicate: predicate.clone(),
            },
            PhysicalPlan::SelectProjection { input, columns } => LogicalPlan::Projection {
                input: Box::new(input.to_logical()),
                op: ProjectionOp::Select,
                columns: columns.clone(),
            },
            PhysicalPlan::CountProjection { input } => LogicalPlan::Projection {
                input: Box::new(input.to_logical()),
                op: ProjectionOp::Count,
                columns: vec![],
            },
            PhysicalPlan::ExistsProjection { input } => LogicalPlan::Projection {
                input: Box::new(input.to_logical()),
                op: ProjectionOp::Exists,
                columns: vec![],
            },
            PhysicalPlan::Aggregate { input, op, column } => LogicalPlan::Projection {
                input: Box::new(input.to_logical()),
                op: match op {
                    AggregateOp::Sum => ProjectionOp::Sum,
                    AggregateOp::Min => ProjectionOp::Min,
                    AggregateOp::Max => ProjectionOp::Max,
                    AggregateOp::Mean => ProjectionOp::Mean,
                },
                columns: vec![(column.clone(), None)],
            },
            PhysicalPlan::Limit { input, limit, skip } => LogicalPlan::Limit {
                input: Box::new(input.to_logical()),
                limit: *limit,
                skip: *skip,
            },
            PhysicalPlan::Insert { entity, rows } => LogicalPlan::Insert {
                entity: entity.clone(),
                rows: rows.clone(),
            },
            PhysicalPlan::Update {
                entity,
                predicate,
                assignments,
            } => LogicalPlan::Update {
                entity: entity.clone(),
                predicate: predicate.clone(),
                assignments: assignments.clone(),
            },
            PhysicalPlan::Delete { entity, predicate } => LogicalPlan::Delete {
                entity: entity.clone(),
                predicate: predicate.clone(),
            },
            PhysicalPlan::OptimizeEntity { entity } => LogicalPlan::OptimizeEntity {
                entity: entity.clone(),
            },
        }
    }
}

/// Planning context: resolves statistics and indexes for costing.
pub struct PlanningContext<'a> {
    pub catalogue: &'a Arc<Catalogue>,
}

impl<'a> PlanningContext<'a> {
    pub fn new(catalogue: &'a Arc<Catalogue>) -> PlanningContext<'a> {
        PlanningContext { catalogue }
    }

    pub(crate) fn entity_rows(&self, entity: &EntityName) -> u64 {
        self.catalogue
            .entity(entity)
            .map(|e| e.statistics().rows)
            .unwrap_or(0)
    }

    pub(crate) fn indexes(&self, entity: &EntityName) -> Vec<Arc<dyn index::Index>> {
        self.catalogue
            .entity(entity)
            .map(|e| e.indexes())
            .unwrap_or_default()
    }
}

/// The planner proper: stateless rules around a shared plan cache.
pub struct Planner {
    cache: PlanCache,
}

impl Planner {
    pub fn new(cache_capacity: usize) -> Planner {
        Planner {
            cache: PlanCache::new(cache_capacity),
        }
    }

    /// Run both stages and return every executable physical candidate.
    pub fn plan(
        &self,
        logical: &LogicalPlan,
        ctx: &PlanningContext,
    ) -> DbResult<Vec<PhysicalPlan>> {
        let rewritten = rules::stage_one(logical.clone());
        let mut candidates = Vec::new();
        for variant in rewritten {
            candidates.extend(rules::stage_two(&variant, ctx)?);
        }
        if candidates.is_empty() {
            return Err(DbError::QueryPlanner(format!(
                "no executable plan for {}",
                explain_logical(logical)
            )));
        }
        Ok(candidates)
    }

    /// Plan, select the cheapest candidate, and cache it by the logical
    /// tree's digest. `bypass_cache` forces a fresh plan and skips
    /// installation (testing hook).
    pub fn plan_and_select(
        &self,
        logical: &LogicalPlan,
        ctx: &PlanningContext,
        bypass_cache: bool,
    ) -> DbResult<Arc<PhysicalPlan>> {
        let key = digest(logical);
        if !bypass_cache {
            if let Some(hit) = self.cache.get(key) {
                debug!(digest = key, "plan cache hit");
                return Ok(hit);
            }
        }

        let candidates = self.plan(logical, ctx)?;
        let best = candidates
            .into_iter()
            .map(|p| {
                let c = cost::cost(&p, ctx);
                (p, c)
            })
            .filter(|(_, c)| !c.is_invalid())
            .min_by(|(_, a), (_, b)| {
                a.total()
                    .partial_cmp(&b.total())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(p, _)| p)
            .ok_or_else(|| {
                DbError::QueryPlanner(format!(
                    "every candidate for {} was disqualified by cost",
                    explain_logical(logical)
                ))
            })?;

        let plan = Arc::new(best);
        if !bypass_cache {
            self.cache.put(key, Arc::clone(&plan));
        }
        Ok(plan)
    }
}

/// Pretty-print a logical plan for debugging.
pub fn explain_logical(p: &LogicalPlan) -> String {
    match p {
        LogicalPlan::EntityScan { entity, columns } => {
            format!("EntityScan entity={entity} cols={columns:?}")
        }
        LogicalPlan::Sample { entity, size, seed, .. } => {
            format!("Sample entity={entity} size={size} seed={seed}")
        }
        LogicalPlan::Filter { input, predicate } => format!(
            "Filter [{predicate:?}]\n  {}",
            indent(&explain_logical(input))
        ),
        LogicalPlan::Knn { input, predicate } => format!(
            "Knn k={} on {} ({:?})\n  {}",
            predicate.k,
            predicate.column,
            predicate.distance,
            indent(&explain_logical(input))
        ),
        LogicalPlan::Projection { input, op, columns } => format!(
            "Projection {op:?} cols={columns:?}\n  {}",
            indent(&explain_logical(input))
        ),
        LogicalPlan::Limit { input, limit, skip } => format!(
            "Limit limit={limit:?} skip={skip:?}\n  {}",
            indent(&explain_logical(input))
        ),
        LogicalPlan::Insert { entity, rows } => {
            format!("Insert entity={entity} rows={}", rows.len())
        }
        LogicalPlan::Update { entity, .. } => format!("Update entity={entity}"),
        LogicalPlan::Delete { entity, .. } => format!("Delete entity={entity}"),
        LogicalPlan::OptimizeEntity { entity } => format!("OptimizeEntity entity={entity}"),
    }
}

/// Pretty-print a physical plan for debugging.
pub fn explain_physical(p: &PhysicalPlan) -> String {
    match p {
        PhysicalPlan::EntityScan { entity, columns } => {
            format!("EntityScan entity={entity} cols={columns:?}")
        }
        PhysicalPlan::RangedEntityScan { entity, range, .. } => {
            format!("RangedEntityScan entity={entity} range={range:?}")
        }
        PhysicalPlan::EntitySample { entity, size, seed, .. } => {
            format!("EntitySample entity={entity} size={size} seed={seed}")
        }
        PhysicalPlan::LinearScanFilter { input, predicate } => format!(
            "LinearScanFilter [{predicate:?}]\n  {}",
            indent(&explain_physical(input))
        ),
        PhysicalPlan::IndexedFilter { entity, index, .. } => {
            format!("IndexedFilter entity={entity} index={index}")
        }
        PhysicalPlan::FetchColumns { input, columns, .. } => format!(
            "FetchColumns cols={columns:?}\n  {}",
            indent(&explain_physical(input))
        ),
        PhysicalPlan::KnnFullscan {
            entity,
            predicate,
            prefilter,
        } => format!(
            "KnnFullscan entity={entity} k={} prefilter={}",
            predicate.k,
            prefilter.is_some()
        ),
        PhysicalPlan::KnnIndexed { entity, index, predicate } => {
            format!("KnnIndexed entity={entity} index={index} k={}", predicate.k)
        }
        PhysicalPlan::SelectProjection { input, columns } => format!(
            "SelectProjection cols={columns:?}\n  {}",
            indent(&explain_physical(input))
        ),
        PhysicalPlan::CountProjection { input } => {
            format!("CountProjection\n  {}", indent(&explain_physical(input)))
        }
        PhysicalPlan::ExistsProjection { input } => {
            format!("ExistsProjection\n  {}", indent(&explain_physical(input)))
        }
        PhysicalPlan::Aggregate { input, op, column } => format!(
            "Aggregate {op:?}({column})\n  {}",
            indent(&explain_physical(input))
        ),
        PhysicalPlan::Limit { input, limit, skip } => format!(
            "Limit limit={limit:?} skip={skip:?}\n  {}",
            indent(&explain_physical(input))
        ),
        PhysicalPlan::Insert { entity, rows } => {
            format!("Insert entity={entity} rows={}", rows.len())
        }
        PhysicalPlan::Update { entity, .. } => format!("Update entity={entity}"),
        PhysicalPlan::Delete { entity, .. } => format!("Delete entity={entity}"),
        PhysicalPlan::OptimizeEntity { entity } => format!("OptimizeEntity entity={entity}"),
    }
}

fn indent(s: &str) -> String {
    s.lines()
        .map(|l| format!("  {l}"))
        .collect::<Vec<_>>()
        .join("\n")
}
