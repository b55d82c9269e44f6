//! Physical plan → operator tree.

use crate::dml::{DeleteOp, InsertOp, OptimizeEntityOp, UpdateOp};
use crate::filter::{FetchColumnsOp, IndexedFilterOp, LinearScanFilterOp};
use crate::knn::{KnnFullscanOp, KnnIndexedOp};
use crate::limit::LimitOp;
use crate::projection::{AggregateExecOp, CountProjectionOp, ExistsProjectionOp, SelectProjectionOp};
use crate::scan::{EntitySampleOp, EntityScanOp};
use crate::Operator;
use common::DbResult;
use planner::PhysicalPlan;

/// Build the operator tree for a plan. `knn_workers` caps the parallel
/// fullscan fan-out.
pub fn build_operator(plan: &PhysicalPlan, knn_workers: usize) -> DbResult<Box<dyn Operator>> {
    Ok(match plan {
        PhysicalPlan::EntityScan { entity, columns } => {
            Box::new(EntityScanOp::new(entity.clone(), columns.clone(), None))
        }
        PhysicalPlan::RangedEntityScan {
            entity,
            columns,
            range,
        } => Box::new(EntityScanOp::new(
            entity.clone(),
            columns.clone(),
            Some(*range),
        )),
        PhysicalPlan::EntitySample {
            entity,
            columns,
            size,
            seed,
        } => Box::new(EntitySampleOp::new(
            entity.clone(),
            columns.clone(),
            *size,
            *seed,
        )),
        PhysicalPlan::LinearScanFilter { input, predicate } => Box::new(LinearScanFilterOp::new(
            build_operator(input, knn_workers)?,
            predicate.clone(),
        )),
        PhysicalPlan::IndexedFilter {
            entity,
            index,
            predicate,
        } => Box::new(IndexedFilterOp::new(
            entity.clone(),
            index.clone(),
            predicate.clone(),
        )),
        PhysicalPlan::FetchColumns {
            input,
            entity,
            columns,
        } => Box::new(FetchColumnsOp::new(
            build_operator(input, knn_workers)?,
            entity.clone(),
            columns.clone(),
        )),
        PhysicalPlan::KnnFullscan {
            entity,
            predicate,
            prefilter,
        } => Box::new(KnnFullscanOp::new(
            entity.clone(),
            predicate.clone(),
            prefilter.clone(),
            knn_workers,
        )),
        PhysicalPlan::KnnIndexed {
            entity,
            index,
            predicate,
        } => Box::new(KnnIndexedOp::new(
            entity.clone(),
            index.clone(),
            predicate.clone(),
        )),
        PhysicalPlan::SelectProjection { input, columns } => Box::new(SelectProjectionOp::new(
            build_operator(input, knn_workers)?,
            columns.clone(),
        )),
        PhysicalPlan::CountProjection { input } => {
            Box::new(CountProjectionOp::new(build_operator(input, knn_workers)?))
        }
        PhysicalPlan::ExistsProjection { input } => {
            Box::new(ExistsProjectionOp::new(build_operator(input, knn_workers)?))
        }
        PhysicalPlan::Aggregate { input, op, column } => Box::new(AggregateExecOp::new(
            build_operator(input, knn_workers)?,
            *op,
            column.clone(),
        )),
        PhysicalPlan::Limit { input, limit, skip } => Box::new(LimitOp::new(
            build_operator(input, knn_workers)?,
            *limit,
            *skip,
        )),
        PhysicalPlan::Insert { entity, rows } => {
            Box::new(InsertOp::new(entity.clone(), rows.clone()))
        }
        PhysicalPlan::Update {
            entity,
            predicate,
            assignments,
        } => Box::new(UpdateOp::new(
            entity.clone(),
            predicate.clone(),
            assignments.clone(),
        )),
        PhysicalPlan::Delete { entity, predicate } => {
            Box::new(DeleteOp::new(entity.clone(), predicate.clone()))
        }
        PhysicalPlan::OptimizeEntity { entity } => Box::new(OptimizeEntityOp::new(entity.clone())),
    })
}
