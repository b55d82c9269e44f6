//! Cost estimation over physical plans. Index nodes delegate to the
//! index's own estimate; scans derive from entity statistics.

use crate::{PhysicalPlan, PlanningContext};
use common::Cost;

const IO_PER_VALUE: f32 = 0.01;
const CPU_PER_VALUE: f32 = 0.001;
const CPU_PER_ATOM: f32 = 0.002;

pub(crate) fn cost(plan: &PhysicalPlan, ctx: &PlanningContext) -> Cost {
    match plan {
        PhysicalPlan::EntityScan { entity, columns } => {
            scan_cost(ctx.entity_rows(entity), columns.len())
        }
        PhysicalPlan::RangedEntityScan { entity, columns, range } => {
            let rows = ctx.entity_rows(entity).min(range.1.saturating_sub(range.0));
            scan_cost(rows, columns.len())
        }
        PhysicalPlan::EntitySample { entity, columns, size, .. } => {
            // Sampling still walks the cursor but materializes fewer rows.
            let rows = ctx.entity_rows(entity);
            scan_cost(rows, 1) + scan_cost(*size.min(&rows), columns.len())
        }
        PhysicalPlan::LinearScanFilter { input, predicate } => {
            let input_cost = cost(input, ctx);
            let rows = output_rows(input, ctx);
            input_cost
                + Cost::new(
                    0.0,
                    rows as f32 * predicate.atom_count() as f32 * CPU_PER_ATOM,
                    0.0,
                )
        }
        PhysicalPlan::IndexedFilter { entity, index, predicate } => {
            lookup_index(ctx, entity, index)
                .map(|idx| idx.cost(predicate))
                .unwrap_or(Cost::INVALID)
        }
        PhysicalPlan::FetchColumns { input, columns, .. } => {
            let input_cost = cost(input, ctx);
            let rows = output_rows(input, ctx);
            input_cost
                + Cost::new(
                    rows as f32 * columns.len() as f32 * IO_PER_VALUE,
                    rows as f32 * columns.len() as f32 * CPU_PER_VALUE,
                    columns.len() as f32,
                )
        }
        PhysicalPlan::KnnFullscan { entity, predicate, prefilter } => {
            let rows = ctx.entity_rows(entity);
            let dims = predicate.queries.first().map(|q| q.len()).unwrap_or(0) as f32;
            let filter_cpu = prefilter
                .as_ref()
                .map(|p| rows as f32 * p.atom_count() as f32 * CPU_PER_ATOM)
                .unwrap_or(0.0);
            Cost::new(
                rows as f32 * dims * IO_PER_VALUE,
                rows as f32 * dims * CPU_PER_VALUE * predicate.queries.len() as f32 + filter_cpu,
                predicate.k as f32 * predicate.queries.len() as f32,
            )
        }
        PhysicalPlan::KnnIndexed { entity, index, predicate } => {
            lookup_index(ctx, entity, index)
                .map(|idx| idx.knn_cost(predicate))
                .unwrap_or(Cost::INVALID)
        }
        PhysicalPlan::SelectProjection { input, columns } => {
            let rows = output_rows(input, ctx);
            cost(input, ctx) + Cost::new(0.0, rows as f32 * columns.len() as f32 * CPU_PER_VALUE, 0.0)
        }
        PhysicalPlan::CountProjection { input } | PhysicalPlan::ExistsProjection { input } => {
            cost(input, ctx)
        }
        PhysicalPlan::Aggregate { input, .. } => {
            let rows = output_rows(input, ctx);
            cost(input, ctx) + Cost::new(0.0, rows as f32 * CPU_PER_VALUE, 0.0)
        }
        PhysicalPlan::Limit { input, limit, .. } => {
            // A pull-based limit stops its child early; scale the child
            // cost by the expected fraction consumed.
            let child = cost(input, ctx);
            let rows = output_rows(input, ctx);
            match limit {
                Some(limit) if rows > 0 => {
                    let fraction = (*limit as f32 / rows as f32).min(1.0);
                    Cost::new(child.io * fraction, child.cpu * fraction, child.memory)
                }
                _ => child,
            }
        }
        PhysicalPlan::Insert { rows, .. } => {
            Cost::new(rows.len() as f32 * IO_PER_VALUE * 10.0, 0.0, 0.0)
        }
        PhysicalPlan::Update { entity, .. } | PhysicalPlan::Delete { entity, .. } => {
            scan_cost(ctx.entity_rows(entity), 1)
        }
        PhysicalPlan::OptimizeEntity { entity } => scan_cost(ctx.entity_rows(entity), 1),
    }
}

/// Rough output cardinality, for costing parents.
fn output_rows(plan: &PhysicalPlan, ctx: &PlanningContext) -> u64 {
    match plan {
        PhysicalPlan::EntityScan { entity, .. } => ctx.entity_rows(entity),
        PhysicalPlan::RangedEntityScan { entity, range, .. } => {
            ctx.entity_rows(entity).min(range.1.saturating_sub(range.0))
        }
        PhysicalPlan::EntitySample { entity, size, .. } => *size.min(&ctx.entity_rows(entity)),
        // Equality-shaped filters are assumed selective.
        PhysicalPlan::LinearScanFilter { input, predicate } => {
            (output_rows(input, ctx) / (1 + predicate.atom_count() as u64 * 2)).max(1)
        }
        PhysicalPlan::IndexedFilter { predicate, .. } => predicate.atom_count() as u64,
        PhysicalPlan::FetchColumns { input, .. } => output_rows(input, ctx),
        PhysicalPlan::KnnFullscan { predicate, .. } | PhysicalPlan::KnnIndexed { predicate, .. } => {
            (predicate.k * predicate.queries.len()) as u64
        }
        PhysicalPlan::SelectProjection { input, .. } => output_rows(input, ctx),
        PhysicalPlan::CountProjection { .. } | PhysicalPlan::ExistsProjection { .. } => 1,
        PhysicalPlan::Aggregate { .. } => 1,
        PhysicalPlan::Limit { input, limit, .. } => {
            let rows = output_rows(input, ctx);
            limit.map(|l| l.min(rows)).unwrap_or(rows)
        }
        PhysicalPlan::Insert { .. }
        | PhysicalPlan::Update { .. }
        | PhysicalPlan::Delete { .. }
        | PhysicalPlan::OptimizeEntity { .. } => 1,
    }
}

fn scan_cost(rows: u64, columns: usize) -> Cost {
    Cost::new(
        rows as f32 * columns as f32 * IO_PER_VALUE,
        rows as f32 * columns as f32 * CPU_PER_VALUE,
        columns as f32,
    )
}

fn lookup_index<'a>(
    ctx: &PlanningContext<'a>,
    entity: &common::EntityName,
    simple: &str,
) -> Option<std::sync::Arc<dyn index::Index>> {
    ctx.indexes(entity)
        .into_iter()
        .find(|idx| idx.name().simple() == simple)
}
