//! Writing operators: insert, predicate-driven update and delete, and
//! the index maintenance entry point. Each emits a single record with
//! the affected-row count.

use crate::{ExecutionContext, Operator};
use common::{BooleanPredicate, DbResult, EntityName, Record, TupleId};
use types::Value;

pub struct InsertOp {
    entity: EntityName,
    rows: Vec<Vec<(String, Value)>>,
    schema: Vec<String>,
    done: bool,
}

impl InsertOp {
    pub fn new(entity: EntityName, rows: Vec<Vec<(String, Value)>>) -> InsertOp {
        InsertOp {
            entity,
            rows,
            schema: vec!["inserted".to_string()],
            done: false,
        }
    }
}

impl Operator for InsertOp {
    fn open(&mut self, _ctx: &mut ExecutionContext) -> DbResult<()> {
        self.done = false;
        Ok(())
    }

    fn next(&mut self, ctx: &mut ExecutionContext) -> DbResult<Option<Record>> {
        if self.done {
            return Ok(None);
        }
        ctx.txn.check_open()?;
        let tx = ctx.entity_tx(&self.entity)?;
        let mut count: i64 = 0;
        for row in &self.rows {
            tx.insert(row)?;
            count += 1;
        }
        self.done = true;
        Ok(Some(Record::new(TupleId(0), vec![Value::Long(count)])))
    }

    fn close(&mut self, _ctx: &mut ExecutionContext) -> DbResult<()> {
        Ok(())
    }

    fn schema(&self) -> &[String] {
        &self.schema
    }
}

pub struct UpdateOp {
    entity: EntityName,
    predicate: Option<BooleanPredicate>,
    assignments: Vec<(String, Value)>,
    schema: Vec<String>,
    done: bool,
}

impl UpdateOp {
    pub fn new(
        entity: EntityName,
        predicate: Option<BooleanPredicate>,
        assignments: Vec<(String, Value)>,
    ) -> UpdateOp {
        UpdateOp {
            entity,
            predicate,
            assignments,
            schema: vec!["updated".to_string()],
            done: false,
        }
    }
}

impl Operator for UpdateOp {
    fn open(&mut self, _ctx: &mut ExecutionContext) -> DbResult<()> {
        self.done = false;
        Ok(())
    }

    fn next(&mut self, ctx: &mut ExecutionContext) -> DbResult<Option<Record>> {
        if self.done {
            return Ok(None);
        }
        ctx.txn.check_open()?;
        let tx = ctx.entity_tx(&self.entity)?;
        let tids = affected_tids(tx, &self.predicate)?;
        let mut count: i64 = 0;
        for tid in tids {
            ctx.txn.check_open()?;
            let tx = ctx.entity_tx(&self.entity)?;
            tx.update(tid, &self.assignments)?;
            count += 1;
        }
        self.done = true;
        Ok(Some(Record::new(TupleId(0), vec![Value::Long(count)])))
    }

    fn close(&mut self, _ctx: &mut ExecutionContext) -> DbResult<()> {
        Ok(())
    }

    fn schema(&self) -> &[String] {
        &self.schema
    }
}

pub struct DeleteOp {
    entity: EntityName,
    predicate: Option<BooleanPredicate>,
    schema: Vec<String>,
    done: bool,
}

impl DeleteOp {
    pub fn new(entity: EntityName, predicate: Option<BooleanPredicate>) -> DeleteOp {
        DeleteOp {
            entity,
            predicate,
            schema: vec!["deleted".to_string()],
            done: false,
        }
    }
}

impl Operator for DeleteOp {
    fn open(&mut self, _ctx: &mut ExecutionContext) -> DbResult<()> {
        self.done = false;
        Ok(())
    }

    fn next(&mut self, ctx: &mut ExecutionContext) -> DbResult<Option<Record>> {
        if self.done {
            return Ok(None);
        }
        ctx.txn.check_open()?;
        let tx = ctx.entity_tx(&self.entity)?;
        let tids = affected_tids(tx, &self.predicate)?;
        let mut count: i64 = 0;
        for tid in tids {
            ctx.txn.check_open()?;
            let tx = ctx.entity_tx(&self.entity)?;
            tx.delete(tid)?;
            count += 1;
        }
        self.done = true;
        Ok(Some(Record::new(TupleId(0), vec![Value::Long(count)])))
    }

    fn close(&mut self, _ctx: &mut ExecutionContext) -> DbResult<()> {
        Ok(())
    }

    fn schema(&self) -> &[String] {
        &self.schema
    }
}

fn affected_tids(
    tx: &catalog::EntityTx,
    predicate: &Option<BooleanPredicate>,
) -> DbResult<Vec<TupleId>> {
    match predicate {
        Some(pred) => Ok(tx.filter(pred)?.into_iter().map(|r| r.tid).collect()),
        None => {
            let mut cursor = tx.cursor(None)?;
            let mut tids = Vec::new();
            while let Some(tid) = cursor.next()? {
                tids.push(tid);
            }
            Ok(tids)
        }
    }
}

/// Rebuild the entity's indexes; broken ones are dropped by the entity
/// view (logged there). Emits whether the pass completed.
pub struct OptimizeEntityOp {
    entity: EntityName,
    schema: Vec<String>,
    done: bool,
}

impl OptimizeEntityOp {
    pub fn new(entity: EntityName) -> OptimizeEntityOp {
        OptimizeEntityOp {
            entity,
            schema: vec!["optimized".to_string()],
            done: false,
        }
    }
}

impl Operator for OptimizeEntityOp {
    fn open(&mut self, _ctx: &mut ExecutionContext) -> DbResult<()> {
        self.done = false;
        Ok(())
    }

    fn next(&mut self, ctx: &mut ExecutionContext) -> DbResult<Option<Record>> {
        if self.done {
            return Ok(None);
        }
        ctx.txn.check_open()?;
        let tx = ctx.entity_tx(&self.entity)?;
        tx.optimize()?;
        self.done = true;
        Ok(Some(Record::new(TupleId(0), vec![Value::Boolean(true)])))
    }

    fn close(&mut self, _ctx: &mut ExecutionContext) -> DbResult<()> {
        Ok(())
    }

    fn schema(&self) -> &[String] {
        &self.schema
    }
}
