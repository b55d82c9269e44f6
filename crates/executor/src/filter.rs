//! Filter operators: linear-scan evaluation, index probes, and the
//! column fetch that materializes full records behind index results.

use crate::{ExecutionContext, Operator};
use catalog::predicate::eval_predicate;
use common::{BooleanPredicate, DbError, DbResult, EntityName, Record};
use index::{IndexKind, IndexMatch};
use types::Value;

/// Evaluates the predicate against every input record.
pub struct LinearScanFilterOp {
    input: Box<dyn Operator>,
    predicate: BooleanPredicate,
    schema: Vec<String>,
}

impl LinearScanFilterOp {
    pub fn new(input: Box<dyn Operator>, predicate: BooleanPredicate) -> LinearScanFilterOp {
        LinearScanFilterOp {
            input,
            predicate,
            schema: Vec::new(),
        }
    }
}

impl Operator for LinearScanFilterOp {
    fn open(&mut self, ctx: &mut ExecutionContext) -> DbResult<()> {
        self.input.open(ctx)?;
        self.schema = self.input.schema().to_vec();
        // Every predicate column must be present in the input.
        for column in self.predicate.columns() {
            if !self.schema.iter().any(|c| *c == column.name) {
                return Err(DbError::OperatorSetup(format!(
                    "filter column '{column}' is not produced by its input"
                )));
            }
        }
        Ok(())
    }

    fn next(&mut self, ctx: &mut ExecutionContext) -> DbResult<Option<Record>> {
        loop {
            ctx.txn.check_open()?;
            let record = match self.input.next(ctx)? {
                Some(record) => record,
                None => return Ok(None),
            };
            let schema = &self.schema;
            let lookup = |name: &common::ColumnName| {
                schema
                    .iter()
                    .position(|c| *c == name.name)
                    .map(|i| record.values[i].clone())
            };
            if eval_predicate(&self.predicate, &lookup)? {
                return Ok(Some(record));
            }
        }
    }

    fn close(&mut self, ctx: &mut ExecutionContext) -> DbResult<()> {
        self.input.close(ctx)
    }

    fn schema(&self) -> &[String] {
        &self.schema
    }
}

/// Probes one index and emits its matches as standalone records: the key
/// column for hash probes, a `score` column for text queries.
pub struct IndexedFilterOp {
    entity: EntityName,
    index: String,
    predicate: BooleanPredicate,
    schema: Vec<String>,
    matches: Vec<IndexMatch>,
    position: usize,
}

impl IndexedFilterOp {
    pub fn new(entity: EntityName, index: String, predicate: BooleanPredicate) -> IndexedFilterOp {
        IndexedFilterOp {
            entity,
            index,
            predicate,
            schema: Vec::new(),
            matches: Vec::new(),
            position: 0,
        }
    }
}

impl Operator for IndexedFilterOp {
    fn open(&mut self, ctx: &mut ExecutionContext) -> DbResult<()> {
        let tx = ctx.entity_tx(&self.entity)?;
        let idx = tx.index_for_name(&self.index)?;
        if !idx.can_process(&self.predicate) {
            return Err(DbError::PredicateNotSupportedByIndex(
                idx.name().to_string(),
            ));
        }
        self.schema = match idx.kind() {
            IndexKind::UniqueHash => vec![idx.column().simple().to_string()],
            IndexKind::InvertedText => vec!["score".to_string()],
            IndexKind::VaFile => Vec::new(),
        };
        self.matches = idx.filter(&self.predicate)?;
        self.position = 0;
        Ok(())
    }

    fn next(&mut self, ctx: &mut ExecutionContext) -> DbResult<Option<Record>> {
        ctx.txn.check_open()?;
        let m = match self.matches.get(self.position) {
            Some(m) => m.clone(),
            None => return Ok(None),
        };
        self.position += 1;
        let values = match (&m.key, m.score) {
            (Some(key), _) => vec![key.clone()],
            (None, Some(score)) => vec![Value::Double(score)],
            (None, None) => Vec::new(),
        };
        Ok(Some(Record::new(m.tid, values)))
    }

    fn close(&mut self, _ctx: &mut ExecutionContext) -> DbResult<()> {
        self.matches.clear();
        Ok(())
    }

    fn schema(&self) -> &[String] {
        &self.schema
    }
}

/// Adds entity columns to records that carry only part of their tuple
/// (index matches, kNN results). Input columns come first; requested
/// columns not already present are read from the entity. Records whose
/// tuple vanished (deleted in this transaction) are dropped.
pub struct FetchColumnsOp {
    input: Box<dyn Operator>,
    entity: EntityName,
    columns: Vec<String>,
    schema: Vec<String>,
    missing: Vec<String>,
}

impl FetchColumnsOp {
    pub fn new(input: Box<dyn Operator>, entity: EntityName, columns: Vec<String>) -> FetchColumnsOp {
        FetchColumnsOp {
            input,
            entity,
            columns,
            schema: Vec::new(),
            missing: Vec::new(),
        }
    }
}

impl Operator for FetchColumnsOp {
    fn open(&mut self, ctx: &mut ExecutionContext) -> DbResult<()> {
        self.input.open(ctx)?;
        self.schema = self.input.schema().to_vec();
        self.missing.clear();
        for column in &self.columns {
            let lowered = column.to_lowercase();
            if !self.schema.contains(&lowered) {
                self.schema.push(lowered.clone());
                self.missing.push(lowered);
            }
        }
        let tx = ctx.entity_tx(&self.entity)?;
        for column in &self.missing {
            tx.column_for_name(column)?;
        }
        Ok(())
    }

    fn next(&mut self, ctx: &mut ExecutionContext) -> DbResult<Option<Record>> {
        loop {
            ctx.txn.check_open()?;
            let mut record = match self.input.next(ctx)? {
                Some(record) => record,
                None => return Ok(None),
            };
            if self.missing.is_empty() {
                return Ok(Some(record));
            }
            let tx = ctx.entity_tx(&self.entity)?;
            match tx.read(record.tid, &self.missing)? {
                Some(fetched) => {
                    record.values.extend(fetched.values);
                    return Ok(Some(record));
                }
                None => continue,
            }
        }
    }

    fn close(&mut self, ctx: &mut ExecutionContext) -> DbResult<()> {
        self.input.close(ctx)
    }

    fn schema(&self) -> &[String] {
        &self.schema
    }
}
