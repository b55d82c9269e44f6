//! Projection heads: column selection, COUNT, EXISTS, and the numeric
//! aggregates. Everything except SELECT is a breaker.

use crate::{ExecutionContext, Operator};
use common::{DbError, DbResult, Record, TupleId};
use planner::AggregateOp;
use types::Value;

/// Reorders, subsets, and renames the input columns.
pub struct SelectProjectionOp {
    input: Box<dyn Operator>,
    columns: Vec<(String, Option<String>)>,
    schema: Vec<String>,
    positions: Vec<usize>,
}

impl SelectProjectionOp {
    pub fn new(input: Box<dyn Operator>, columns: Vec<(String, Option<String>)>) -> SelectProjectionOp {
        SelectProjectionOp {
            input,
            columns,
            schema: Vec::new(),
            positions: Vec::new(),
        }
    }
}

impl Operator for SelectProjectionOp {
    fn open(&mut self, ctx: &mut ExecutionContext) -> DbResult<()> {
        self.input.open(ctx)?;
        let input_schema = self.input.schema();
        self.positions.clear();
        self.schema.clear();
        for (name, alias) in &self.columns {
            let lowered = name.to_lowercase();
            let position = input_schema
                .iter()
                .position(|c| *c == lowered)
                .ok_or_else(|| {
                    DbError::OperatorSetup(format!(
                        "projection column '{name}' is not produced by its input"
                    ))
                })?;
            self.positions.push(position);
            self.schema.push(alias.clone().unwrap_or(lowered));
        }
        Ok(())
    }

    fn next(&mut self, ctx: &mut ExecutionContext) -> DbResult<Option<Record>> {
        ctx.txn.check_open()?;
        match self.input.next(ctx)? {
            Some(record) => {
                let values = self
                    .positions
                    .iter()
                    .map(|i| record.values[*i].clone())
                    .collect();
                Ok(Some(Record::new(record.tid, values)))
            }
            None => Ok(None),
        }
    }

    fn close(&mut self, ctx: &mut ExecutionContext) -> DbResult<()> {
        self.input.close(ctx)
    }

    fn schema(&self) -> &[String] {
        &self.schema
    }
}

/// COUNT(*): consumes the input and emits one long.
pub struct CountProjectionOp {
    input: Box<dyn Operator>,
    schema: Vec<String>,
    done: bool,
}

impl CountProjectionOp {
    pub fn new(input: Box<dyn Operator>) -> CountProjectionOp {
        CountProjectionOp {
            input,
            schema: vec!["count".to_string()],
            done: false,
        }
    }
}

impl Operator for CountProjectionOp {
    fn open(&mut self, ctx: &mut ExecutionContext) -> DbResult<()> {
        self.done = false;
        self.input.open(ctx)
    }

    fn next(&mut self, ctx: &mut ExecutionContext) -> DbResult<Option<Record>> {
        if self.done {
            return Ok(None);
        }
        let mut count: i64 = 0;
        while let Some(_) = self.input.next(ctx)? {
            ctx.txn.check_open()?;
            count += 1;
        }
        self.done = true;
        Ok(Some(Record::new(TupleId(0), vec![Value::Long(count)])))
    }

    fn close(&mut self, ctx: &mut ExecutionContext) -> DbResult<()> {
        self.input.close(ctx)
    }

    fn schema(&self) -> &[String] {
        &self.schema
    }
}

/// EXISTS: emits a boolean after seeing at most one input record.
pub struct ExistsProjectionOp {
    input: Box<dyn Operator>,
    schema: Vec<String>,
    done: bool,
}

impl ExistsProjectionOp {
    pub fn new(input: Box<dyn Operator>) -> ExistsProjectionOp {
        ExistsProjectionOp {
            input,
            schema: vec!["exists".to_string()],
            done: false,
        }
    }
}

impl Operator for ExistsProjectionOp {
    fn open(&mut self, ctx: &mut ExecutionContext) -> DbResult<()> {
        self.done = false;
        self.input.open(ctx)
    }

    fn next(&mut self, ctx: &mut ExecutionContext) -> DbResult<Option<Record>> {
        if self.done {
            return Ok(None);
        }
        ctx.txn.check_open()?;
        let exists = self.input.next(ctx)?.is_some();
        self.done = true;
        Ok(Some(Record::new(TupleId(0), vec![Value::Boolean(exists)])))
    }

    fn close(&mut self, ctx: &mut ExecutionContext) -> DbResult<()> {
        self.input.close(ctx)
    }

    fn schema(&self) -> &[String] {
        &self.schema
    }
}

/// SUM/MIN/MAX/MEAN over one numeric column; nulls are skipped.
pub struct AggregateExecOp {
    input: Box<dyn Operator>,
    op: AggregateOp,
    column: String,
    schema: Vec<String>,
    position: usize,
    done: bool,
}

impl AggregateExecOp {
    pub fn new(input: Box<dyn Operator>, op: AggregateOp, column: String) -> AggregateExecOp {
        let label = match op {
            AggregateOp::Sum => "sum",
            AggregateOp::Min => "min",
            AggregateOp::Max => "max",
            AggregateOp::Mean => "mean",
        };
        AggregateExecOp {
            input,
            op,
            schema: vec![format!("{label}({column})")],
            column,
            position: 0,
            done: false,
        }
    }
}

impl Operator for AggregateExecOp {
    fn open(&mut self, ctx: &mut ExecutionContext) -> DbResult<()> {
        self.done = false;
        self.input.open(ctx)?;
        let lowered = self.column.to_lowercase();
        self.position = self
            .input
            .schema()
            .iter()
            .position(|c| *c == lowered)
            .ok_or_else(|| {
                DbError::OperatorSetup(format!(
                    "aggregate column '{}' is not produced by its input",
                    self.column
                ))
            })?;
        Ok(())
    }

    fn next(&mut self, ctx: &mut ExecutionContext) -> DbResult<Option<Record>> {
        if self.done {
            return Ok(None);
        }
        let mut sum = 0.0f64;
        let mut count = 0u64;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        while let Some(record) = self.input.next(ctx)? {
            ctx.txn.check_open()?;
            let value = &record.values[self.position];
            if value.is_null() {
                continue;
            }
            let x = value.as_f64().ok_or_else(|| {
                DbError::OperatorExecution(format!(
                    "aggregate over non-numeric value {value:?} in '{}'",
                    self.column
                ))
            })?;
            sum += x;
            count += 1;
            min = min.min(x);
            max = max.max(x);
        }
        self.done = true;

        let result = if count == 0 {
            Value::Null
        } else {
            match self.op {
                AggregateOp::Sum => Value::Double(sum),
                AggregateOp::Min => Value::Double(min),
                AggregateOp::Max => Value::Double(max),
                AggregateOp::Mean => Value::Double(sum / count as f64),
            }
        };
        Ok(Some(Record::new(TupleId(0), vec![result])))
    }

    fn close(&mut self, ctx: &mut ExecutionContext) -> DbResult<()> {
        self.input.close(ctx)
    }

    fn schema(&self) -> &[String] {
        &self.schema
    }
}
