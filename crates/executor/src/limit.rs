//! LIMIT/SKIP: drop the first `skip` records, then emit at most `limit`.

use crate::{ExecutionContext, Operator};
use common::{DbResult, Record};

pub struct LimitOp {
    input: Box<dyn Operator>,
    limit: Option<u64>,
    skip: Option<u64>,
    skipped: u64,
    emitted: u64,
}

impl LimitOp {
    pub fn new(input: Box<dyn Operator>, limit: Option<u64>, skip: Option<u64>) -> LimitOp {
        LimitOp {
            input,
            limit,
            skip,
            skipped: 0,
            emitted: 0,
        }
    }
}

impl Operator for LimitOp {
    fn open(&mut self, ctx: &mut ExecutionContext) -> DbResult<()> {
        self.skipped = 0;
        self.emitted = 0;
        self.input.open(ctx)
    }

    fn next(&mut self, ctx: &mut ExecutionContext) -> DbResult<Option<Record>> {
        ctx.txn.check_open()?;
        if let Some(limit) = self.limit {
            if self.emitted >= limit {
                return Ok(None);
            }
        }
        let skip = self.skip.unwrap_or(0);
        while self.skipped < skip {
            match self.input.next(ctx)? {
                Some(_) => self.skipped += 1,
                None => return Ok(None),
            }
        }
        match self.input.next(ctx)? {
            Some(record) => {
                self.emitted += 1;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn close(&mut self, ctx: &mut ExecutionContext) -> DbResult<()> {
        self.input.close(ctx)
    }

    fn schema(&self) -> &[String] {
        self.input.schema()
    }
}
