//! Execution engine: a pull-based operator pipeline over physical plans.
//!
//! # Architecture
//!
//! ```text
//! PhysicalPlan
//!     ↓ build_operator
//! Operator tree
//!     ↓ open() → next()* → close()
//! Records
//! ```
//!
//! Operators produce records lazily; *breakers* (kNN, count, aggregates)
//! consume their child fully inside `open` before emitting anything, so a
//! failing producer surfaces before the first record and partial results
//! are never emitted. Cancellation and transaction state are checked at
//! every operator boundary via the execution context.

#[cfg(test)]
mod tests;

mod builder;
mod dml;
mod filter;
mod knn;
mod limit;
mod projection;
mod scan;

pub use builder::build_operator;

use catalog::{Catalogue, EntityTx};
use common::{DbResult, EntityName, Record};
use hashbrown::HashMap;
use planner::PhysicalPlan;
use std::sync::Arc;
use txn::TransactionContext;

/// Pull interface of one operator. `schema` is valid once `open` has
/// returned; it names the produced columns with simple names plus the
/// synthetic `distance` and `score` columns.
pub trait Operator: Send {
    fn open(&mut self, ctx: &mut ExecutionContext) -> DbResult<()>;

    fn next(&mut self, ctx: &mut ExecutionContext) -> DbResult<Option<Record>>;

    fn close(&mut self, ctx: &mut ExecutionContext) -> DbResult<()>;

    fn schema(&self) -> &[String];
}

/// Shared state of one query execution: the catalogue, the transaction,
/// and the entity views opened so far (one per entity, shared by all
/// operators of the pipeline).
pub struct ExecutionContext<'a> {
    pub catalogue: &'a Arc<Catalogue>,
    pub txn: Arc<TransactionContext>,
    entity_txs: HashMap<EntityName, EntityTx>,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(catalogue: &'a Arc<Catalogue>, txn: Arc<TransactionContext>) -> ExecutionContext<'a> {
        ExecutionContext {
            catalogue,
            txn,
            entity_txs: HashMap::new(),
        }
    }

    /// The transactional view of an entity, opened lazily and shared for
    /// the rest of the execution.
    pub fn entity_tx(&mut self, name: &EntityName) -> DbResult<&EntityTx> {
        if !self.entity_txs.contains_key(name) {
            let entity = self.catalogue.entity(name)?;
            let tx = entity.new_tx(Arc::clone(&self.txn))?;
            self.entity_txs.insert(name.clone(), tx);
        }
        Ok(&self.entity_txs[name])
    }
}

/// Run a plan to completion and collect the produced records along with
/// the output schema. The pipeline is closed on both success and failure;
/// a failure yields no records.
pub fn execute_collect(
    plan: &PhysicalPlan,
    ctx: &mut ExecutionContext,
) -> DbResult<(Vec<String>, Vec<Record>)> {
    let mut operator = build_operator(plan, ctx.catalogue.config().knn_workers)?;
    operator.open(ctx)?;
    let schema = operator.schema().to_vec();

    let mut records = Vec::new();
    loop {
        match operator.next(ctx) {
            Ok(Some(record)) => records.push(record),
            Ok(None) => break,
            Err(e) => {
                let _ = operator.close(ctx);
                return Err(e);
            }
        }
    }
    operator.close(ctx)?;
    Ok((schema, records))
}
