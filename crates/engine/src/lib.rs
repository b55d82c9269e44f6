//! Engine facade: the surface external callers (gRPC layer, CLI,
//! importers) program against.
//!
//! A caller opens a [`HareDb`], begins transactions through it, and hands
//! each parsed [`Query`] to [`HareDb::query`] together with the
//! transaction handle. The engine binds the query against the catalogue,
//! plans it through the shared plan cache, executes the chosen operator
//! pipeline, and returns the collected result set. DDL and DML entry
//! points wrap the same transactional machinery.
//!
//! # Example
//!
//! ```no_run
//! use engine::HareDb;
//! use common::{Config, SchemaName};
//! use column::ColumnDef;
//! use types::Type;
//!
//! let db = HareDb::open(Config::default()).unwrap();
//! let schema = SchemaName::new("cottontail");
//! db.create_schema(&schema).unwrap();
//! db.create_entity(
//!     &schema.entity("test"),
//!     vec![
//!         ColumnDef::new("id", Type::String),
//!         ColumnDef::new("feature", Type::FloatVector(128)),
//!     ],
//! )
//! .unwrap();
//! ```

mod binder;

pub use binder::bind;

use catalog::Catalogue;
use column::ColumnDef;
use common::{Config, DbResult, EntityName, Query, Record, SchemaName, TupleId};
use executor::ExecutionContext;
use index::IndexKind;
use planner::{Planner, PlanningContext};
use std::sync::Arc;
use tracing::{debug, info};
use txn::{TransactionContext, TransactionMode};
use types::Value;

/// A materialized query answer: the output column labels and the records.
/// A failed query never yields a partial set; errors surface instead.
#[derive(Clone, Debug)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub records: Vec<Record>,
}

impl ResultSet {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// The engine handle: catalogue plus the process-wide planner. All global
/// state (plan cache, lock manager) hangs off this handle; there are no
/// ambient singletons.
pub struct HareDb {
    catalogue: Arc<Catalogue>,
    planner: Planner,
}

impl HareDb {
    /// Open (or initialize) the database under `config.data_dir`.
    pub fn open(config: Config) -> DbResult<HareDb> {
        let plan_cache_capacity = config.plan_cache_capacity;
        let catalogue = Catalogue::open(config)?;
        info!("engine ready");
        Ok(HareDb {
            catalogue,
            planner: Planner::new(plan_cache_capacity),
        })
    }

    pub fn catalogue(&self) -> &Arc<Catalogue> {
        &self.catalogue
    }

    pub fn begin(&self, mode: TransactionMode) -> Arc<TransactionContext> {
        self.catalogue.transactions().begin(mode)
    }

    /// Create a schema in its own committed transaction.
    pub fn create_schema(&self, name: &SchemaName) -> DbResult<()> {
        self.with_write_tx(|ctx| {
            self.catalogue.new_tx(Arc::clone(ctx))?.create_schema(name)?;
            Ok(())
        })
    }

    pub fn drop_schema(&self, name: &SchemaName) -> DbResult<()> {
        self.with_write_tx(|ctx| {
            self.catalogue.new_tx(Arc::clone(ctx))?.drop_schema(name)
        })
    }

    pub fn create_entity(&self, name: &EntityName, columns: Vec<ColumnDef>) -> DbResult<()> {
        self.with_write_tx(|ctx| {
            let schema = self.catalogue.schema(&name.schema)?;
            schema
                .new_tx(Arc::clone(ctx))?
                .create_entity(name.simple(), columns)?;
            Ok(())
        })
    }

    pub fn drop_entity(&self, name: &EntityName) -> DbResult<()> {
        self.with_write_tx(|ctx| {
            let schema = self.catalogue.schema(&name.schema)?;
            schema.new_tx(Arc::clone(ctx))?.drop_entity(name.simple())
        })
    }

    pub fn create_index(
        &self,
        entity: &EntityName,
        name: &str,
        kind: IndexKind,
        column: &str,
    ) -> DbResult<()> {
        self.with_write_tx(|ctx| {
            let handle = self.catalogue.entity(entity)?;
            handle
                .new_tx(Arc::clone(ctx))?
                .create_index(name, kind, column)
        })
    }

    /// Rebuild (and possibly drop) the indexes of an entity.
    pub fn optimize(&self, entity: &EntityName) -> DbResult<()> {
        self.with_write_tx(|ctx| {
            let handle = self.catalogue.entity(entity)?;
            handle.new_tx(Arc::clone(ctx))?.optimize()
        })
    }

    /// Insert rows through an existing transaction.
    pub fn insert(
        &self,
        entity: &EntityName,
        rows: &[Vec<(String, Value)>],
        txn: &Arc<TransactionContext>,
    ) -> DbResult<Vec<TupleId>> {
        let handle = self.catalogue.entity(entity)?;
        let tx = handle.new_tx(Arc::clone(txn))?;
        let mut tids = Vec::with_capacity(rows.len());
        for row in rows {
            tids.push(tx.insert(row)?);
        }
        Ok(tids)
    }

    /// Bind, plan, and execute a query inside `txn`. Binder and planner
    /// failures leave the transaction untouched; execution failures poison
    /// it (the caller must roll back).
    pub fn query(&self, query: &Query, txn: &Arc<TransactionContext>) -> DbResult<ResultSet> {
        self.query_with_options(query, txn, false)
    }

    /// Like [`HareDb::query`] with an explicit plan-cache bypass, used by
    /// tests that need a fresh plan object.
    pub fn query_with_options(
        &self,
        query: &Query,
        txn: &Arc<TransactionContext>,
        bypass_plan_cache: bool,
    ) -> DbResult<ResultSet> {
        txn.check_open()?;
        let logical = bind(query, &self.catalogue)?;
        let planning = PlanningContext::new(&self.catalogue);
        let plan = self
            .planner
            .plan_and_select(&logical, &planning, bypass_plan_cache)?;
        debug!(plan = %planner::explain_physical(&plan), "executing");

        let mut ctx = ExecutionContext::new(&self.catalogue, Arc::clone(txn));
        match executor::execute_collect(&plan, &mut ctx) {
            Ok((columns, records)) => Ok(ResultSet { columns, records }),
            Err(e) => {
                txn.mark_error();
                Err(e)
            }
        }
    }

    /// Bind and plan a query without executing it. With the cache enabled,
    /// repeated calls for the same query return the identical plan object.
    pub fn plan(
        &self,
        query: &Query,
        bypass_plan_cache: bool,
    ) -> DbResult<Arc<planner::PhysicalPlan>> {
        let logical = bind(query, &self.catalogue)?;
        let planning = PlanningContext::new(&self.catalogue);
        self.planner
            .plan_and_select(&logical, &planning, bypass_plan_cache)
    }

    /// Render the plan the engine would run for a query.
    pub fn explain(&self, query: &Query) -> DbResult<String> {
        Ok(planner::explain_physical(self.plan(query, true)?.as_ref()))
    }

    /// Close the engine: waits for in-flight transactions, then closes
    /// every page file cleanly.
    pub fn close(&self) -> DbResult<()> {
        self.catalogue.close()
    }

    fn with_write_tx(&self, f: impl FnOnce(&Arc<TransactionContext>) -> DbResult<()>) -> DbResult<()> {
        let ctx = self.begin(TransactionMode::ReadWrite);
        match f(&ctx) {
            Ok(()) => ctx.commit(),
            Err(e) => {
                let _ = ctx.rollback();
                Err(e)
            }
        }
    }
}
