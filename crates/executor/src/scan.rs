//! Source operators: entity scans and seeded sampling.

use crate::{ExecutionContext, Operator};
use column::HareCursor;
use common::{DbError, DbResult, EntityName, Record};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Sequential scan over an entity, optionally restricted to a tuple-id
/// range (half-open). Covers both `EntityScan` and `RangedEntityScan`.
pub struct EntityScanOp {
    entity: EntityName,
    columns: Vec<String>,
    range: Option<(u64, u64)>,
    cursor: Option<HareCursor>,
}

impl EntityScanOp {
    pub fn new(entity: EntityName, columns: Vec<String>, range: Option<(u64, u64)>) -> EntityScanOp {
        EntityScanOp {
            entity,
            columns,
            range,
            cursor: None,
        }
    }
}

impl Operator for EntityScanOp {
    fn open(&mut self, ctx: &mut ExecutionContext) -> DbResult<()> {
        let tx = ctx.entity_tx(&self.entity)?;
        for column in &self.columns {
            tx.column_for_name(column)?;
        }
        self.cursor = Some(tx.cursor(self.range)?);
        Ok(())
    }

    fn next(&mut self, ctx: &mut ExecutionContext) -> DbResult<Option<Record>> {
        ctx.txn.check_open()?;
        loop {
            let tid = {
                let cursor = self.cursor.as_mut().ok_or_else(|| {
                    DbError::OperatorSetup("scan used before open".into())
                })?;
                match cursor.next()? {
                    Some(tid) => tid,
                    None => return Ok(None),
                }
            };
            let tx = ctx.entity_tx(&self.entity)?;
            if let Some(record) = tx.read(tid, &self.columns)? {
                return Ok(Some(record));
            }
            // Deleted between cursor step and read; keep scanning.
        }
    }

    fn close(&mut self, _ctx: &mut ExecutionContext) -> DbResult<()> {
        self.cursor = None;
        Ok(())
    }

    fn schema(&self) -> &[String] {
        &self.columns
    }
}

/// Bernoulli sample of an entity with a deterministic seed: every live
/// tuple is kept with probability `size / count`, stopping at `size`.
pub struct EntitySampleOp {
    entity: EntityName,
    columns: Vec<String>,
    size: u64,
    seed: u64,
    cursor: Option<HareCursor>,
    rng: Option<StdRng>,
    probability: f64,
    emitted: u64,
}

impl EntitySampleOp {
    pub fn new(entity: EntityName, columns: Vec<String>, size: u64, seed: u64) -> EntitySampleOp {
        EntitySampleOp {
            entity,
            columns,
            size,
            seed,
            cursor: None,
            rng: None,
            probability: 0.0,
            emitted: 0,
        }
    }
}

impl Operator for EntitySampleOp {
    fn open(&mut self, ctx: &mut ExecutionContext) -> DbResult<()> {
        let tx = ctx.entity_tx(&self.entity)?;
        for column in &self.columns {
            tx.column_for_name(column)?;
        }
        let count = tx.count();
        self.probability = if count == 0 {
            0.0
        } else {
            (self.size as f64 / count as f64).min(1.0)
        };
        self.cursor = Some(tx.cursor(None)?);
        self.rng = Some(StdRng::seed_from_u64(self.seed));
        self.emitted = 0;
        Ok(())
    }

    fn next(&mut self, ctx: &mut ExecutionContext) -> DbResult<Option<Record>> {
        ctx.txn.check_open()?;
        if self.emitted >= self.size {
            return Ok(None);
        }
        loop {
            let tid = {
                let cursor = self.cursor.as_mut().ok_or_else(|| {
                    DbError::OperatorSetup("sample used before open".into())
                })?;
                match cursor.next()? {
                    Some(tid) => tid,
                    None => return Ok(None),
                }
            };
            let keep = self
                .rng
                .as_mut()
                .map(|rng| rng.gen_bool(self.probability))
                .unwrap_or(false);
            if !keep {
                continue;
            }
            let tx = ctx.entity_tx(&self.entity)?;
            if let Some(record) = tx.read(tid, &self.columns)? {
                self.emitted += 1;
                return Ok(Some(record));
            }
        }
    }

    fn close(&mut self, _ctx: &mut ExecutionContext) -> DbResult<()> {
        self.cursor = None;
        self.rng = None;
        Ok(())
    }

    fn schema(&self) -> &[String] {
        &self.columns
    }
}
