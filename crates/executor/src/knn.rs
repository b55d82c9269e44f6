//! kNN operators: the (optionally parallel) fullscan with a bounded
//! top-k heap per query vector, and the VA-file-backed indexed variant.
//!
//! Both are breakers: the entire candidate set is consumed during `open`
//! and results stream out in ascending distance order, ties broken by
//! ascending tuple id. Output records carry the vector column and a
//! synthetic `distance` column.

use crate::{ExecutionContext, Operator};
use catalog::predicate::eval_predicate;
use column::ColumnStore;
use common::knn::{distance, distance_weighted, KnnHeap};
use common::{
    BooleanPredicate, DbError, DbResult, EntityName, KnnPredicate, Record, TupleId,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;
use types::Value;

/// Rows per cancellation check in the scan loops.
const CANCEL_CHECK_INTERVAL: u64 = 1024;
/// Below this many tuples a parallel scan is not worth the fan-out.
const PARALLEL_THRESHOLD: u64 = 4096;

pub struct KnnFullscanOp {
    entity: EntityName,
    predicate: KnnPredicate,
    prefilter: Option<BooleanPredicate>,
    workers: usize,
    schema: Vec<String>,
    store: Option<Arc<ColumnStore>>,
    results: VecDeque<(TupleId, f64)>,
}

impl KnnFullscanOp {
    pub fn new(
        entity: EntityName,
        predicate: KnnPredicate,
        prefilter: Option<BooleanPredicate>,
        workers: usize,
    ) -> KnnFullscanOp {
        KnnFullscanOp {
            entity,
            predicate,
            prefilter,
            workers: workers.max(1),
            schema: Vec::new(),
            store: None,
            results: VecDeque::new(),
        }
    }

    fn scan_serial(
        &self,
        txn: &Arc<txn::TransactionContext>,
        store: &Arc<ColumnStore>,
        prefilter_stores: &[(String, Arc<ColumnStore>)],
    ) -> DbResult<Vec<KnnHeap>> {
        let weights = self.predicate.effective_weights();
        let mut heaps: Vec<KnnHeap> = self
            .predicate
            .queries
            .iter()
            .map(|_| KnnHeap::new(self.predicate.k))
            .collect();

        let mut cursor = store.cursor(None);
        let mut scanned = 0u64;
        while let Some(tid) = cursor.next()? {
            scanned += 1;
            if scanned % CANCEL_CHECK_INTERVAL == 0 {
                txn.check_open()?;
            }
            if let Some(pred) = &self.prefilter {
                if !matches_prefilter(pred, prefilter_stores, tid)? {
                    continue;
                }
            }
            let vector = match store.read(tid)?.and_then(|v| v.as_f64_vector()) {
                Some(v) => v,
                None => continue,
            };
            offer(&mut heaps, &self.predicate, weights, tid, &vector);
        }
        Ok(heaps)
    }

    fn scan_parallel(
        &self,
        txn: &Arc<txn::TransactionContext>,
        store: &Arc<ColumnStore>,
        max_tid: u64,
    ) -> DbResult<Vec<KnnHeap>> {
        let workers = self.workers.min(max_tid.max(1) as usize).max(1);
        let chunk = max_tid.div_ceil(workers as u64);
        let worker_heaps: Mutex<Vec<Vec<KnnHeap>>> = Mutex::new(Vec::new());
        let failure: Mutex<Option<DbError>> = Mutex::new(None);
        debug!(entity = %self.entity, workers, "parallel knn fullscan");

        rayon::scope(|scope| {
            for w in 0..workers as u64 {
                let store = Arc::clone(store);
                let txn = Arc::clone(txn);
                let predicate = &self.predicate;
                let worker_heaps = &worker_heaps;
                let failure = &failure;
                scope.spawn(move |_| {
                    let start = w * chunk;
                    let end = ((w + 1) * chunk).min(max_tid);
                    let weights = predicate.effective_weights();
                    let mut heaps: Vec<KnnHeap> = predicate
                        .queries
                        .iter()
                        .map(|_| KnnHeap::new(predicate.k))
                        .collect();

                    let mut run = || -> DbResult<()> {
                        let mut cursor = store.cursor(Some((start, end)));
                        let mut scanned = 0u64;
                        while let Some(tid) = cursor.next()? {
                            scanned += 1;
                            if scanned % CANCEL_CHECK_INTERVAL == 0 {
                                txn.check_open()?;
                            }
                            let vector =
                                match store.read(tid)?.and_then(|v| v.as_f64_vector()) {
                                    Some(v) => v,
                                    None => continue,
                                };
                            offer(&mut heaps, predicate, weights, tid, &vector);
                        }
                        Ok(())
                    };
                    match run() {
                        Ok(()) => worker_heaps.lock().push(heaps),
                        Err(e) => {
                            let mut failure = failure.lock();
                            if failure.is_none() {
                                *failure = Some(e);
                            }
                        }
                    }
                });
            }
        });

        if let Some(e) = failure.into_inner() {
            return Err(e);
        }
        let mut merged: Vec<KnnHeap> = self
            .predicate
            .queries
            .iter()
            .map(|_| KnnHeap::new(self.predicate.k))
            .collect();
        for heaps in worker_heaps.into_inner() {
            for (j, heap) in heaps.into_iter().enumerate() {
                merged[j].merge(heap);
            }
        }
        Ok(merged)
    }
}

fn offer(
    heaps: &mut [KnnHeap],
    predicate: &KnnPredicate,
    weights: Option<&Vec<Vec<f64>>>,
    tid: TupleId,
    vector: &[f64],
) {
    for (j, query) in predicate.queries.iter().enumerate() {
        let d = match weights {
            Some(w) => distance_weighted(predicate.distance, query, vector, &w[j]),
            None => distance(predicate.distance, query, vector),
        };
        heaps[j].offer(tid, d);
    }
}

fn matches_prefilter(
    predicate: &BooleanPredicate,
    stores: &[(String, Arc<ColumnStore>)],
    tid: TupleId,
) -> DbResult<bool> {
    let mut values = Vec::with_capacity(stores.len());
    for (name, store) in stores {
        match store.read(tid)? {
            Some(value) => values.push((name.clone(), value)),
            None => return Ok(false),
        }
    }
    let lookup = |column: &common::ColumnName| {
        values
            .iter()
            .find(|(name, _)| *name == column.name)
            .map(|(_, v)| v.clone())
    };
    eval_predicate(predicate, &lookup)
}

impl Operator for KnnFullscanOp {
    fn open(&mut self, ctx: &mut ExecutionContext) -> DbResult<()> {
        let txn = Arc::clone(&ctx.txn);
        check_queries(&self.predicate)?;
        let (store, prefilter_stores, max_tid) = {
            let tx = ctx.entity_tx(&self.entity)?;
            let column = tx.column_for_name(&self.predicate.column.name)?;
            if !column.def().ty.is_vector() {
                return Err(DbError::QueryBind(format!(
                    "kNN over non-vector column '{}'",
                    column.name
                )));
            }
            let mut prefilter_stores = Vec::new();
            if let Some(pred) = &self.prefilter {
                for name in pred.columns() {
                    let col = tx.column_for_name(&name.name)?;
                    prefilter_stores.push((col.def().name.clone(), Arc::clone(&col.store)));
                }
            }
            let max_tid = column.store.meta().max_tid;
            (Arc::clone(&column.store), prefilter_stores, max_tid)
        };

        let heaps = if self.prefilter.is_none()
            && self.workers > 1
            && max_tid >= PARALLEL_THRESHOLD
        {
            self.scan_parallel(&txn, &store, max_tid)?
        } else {
            self.scan_serial(&txn, &store, &prefilter_stores)?
        };

        self.results = heaps
            .into_iter()
            .flat_map(|h| h.into_sorted())
            .collect();
        self.schema = vec![
            self.predicate.column.name.clone(),
            "distance".to_string(),
        ];
        self.store = Some(store);
        Ok(())
    }

    fn next(&mut self, ctx: &mut ExecutionContext) -> DbResult<Option<Record>> {
        ctx.txn.check_open()?;
        let store = self.store.as_ref().ok_or_else(|| {
            DbError::OperatorSetup("knn fullscan used before open".into())
        })?;
        while let Some((tid, d)) = self.results.pop_front() {
            if let Some(vector) = store.read(tid)? {
                return Ok(Some(Record::new(tid, vec![vector, Value::Double(d)])));
            }
        }
        Ok(None)
    }

    fn close(&mut self, _ctx: &mut ExecutionContext) -> DbResult<()> {
        self.results.clear();
        self.store = None;
        Ok(())
    }

    fn schema(&self) -> &[String] {
        &self.schema
    }
}

/// kNN through a vector-approximation index: the index prunes to a
/// candidate set, exact distances decide the winners.
pub struct KnnIndexedOp {
    entity: EntityName,
    index: String,
    predicate: KnnPredicate,
    schema: Vec<String>,
    store: Option<Arc<ColumnStore>>,
    results: VecDeque<(TupleId, f64)>,
}

impl KnnIndexedOp {
    pub fn new(entity: EntityName, index: String, predicate: KnnPredicate) -> KnnIndexedOp {
        KnnIndexedOp {
            entity,
            index,
            predicate,
            schema: Vec::new(),
            store: None,
            results: VecDeque::new(),
        }
    }
}

impl Operator for KnnIndexedOp {
    fn open(&mut self, ctx: &mut ExecutionContext) -> DbResult<()> {
        check_queries(&self.predicate)?;
        let tx = ctx.entity_tx(&self.entity)?;
        let idx = tx.index_for_name(&self.index)?;
        if !idx.can_process_knn(&self.predicate) {
            return Err(DbError::PredicateNotSupportedByIndex(idx.name().to_string()));
        }
        let column = tx.column_for_name(&self.predicate.column.name)?;
        let store = Arc::clone(&column.store);
        let weights = self.predicate.effective_weights();

        let candidates = idx.knn_candidates(&self.predicate)?;
        let mut results = VecDeque::new();
        for (j, query) in self.predicate.queries.iter().enumerate() {
            let mut heap = KnnHeap::new(self.predicate.k);
            for tid in &candidates[j] {
                let vector = match store.read(*tid)?.and_then(|v| v.as_f64_vector()) {
                    Some(v) => v,
                    None => continue,
                };
                let d = match weights {
                    Some(w) => distance_weighted(self.predicate.distance, query, &vector, &w[j]),
                    None => distance(self.predicate.distance, query, &vector),
                };
                heap.offer(*tid, d);
            }
            results.extend(heap.into_sorted());
        }

        self.results = results;
        self.schema = vec![
            self.predicate.column.name.clone(),
            "distance".to_string(),
        ];
        self.store = Some(store);
        Ok(())
    }

    fn next(&mut self, ctx: &mut ExecutionContext) -> DbResult<Option<Record>> {
        ctx.txn.check_open()?;
        let store = self.store.as_ref().ok_or_else(|| {
            DbError::OperatorSetup("knn indexed used before open".into())
        })?;
        while let Some((tid, d)) = self.results.pop_front() {
            if let Some(vector) = store.read(tid)? {
                return Ok(Some(Record::new(tid, vec![vector, Value::Double(d)])));
            }
        }
        Ok(None)
    }

    fn close(&mut self, _ctx: &mut ExecutionContext) -> DbResult<()> {
        self.results.clear();
        self.store = None;
        Ok(())
    }

    fn schema(&self) -> &[String] {
        &self.schema
    }
}

fn check_queries(predicate: &KnnPredicate) -> DbResult<()> {
    if predicate.queries.is_empty() || predicate.k == 0 {
        return Err(DbError::QueryBind(format!(
            "kNN on '{}' needs at least one query vector and k > 0",
            predicate.column
        )));
    }
    if let Some(weights) = &predicate.weights {
        if weights.len() != predicate.queries.len() {
            return Err(DbError::QueryBind(format!(
                "kNN on '{}' has {} weight vectors for {} queries",
                predicate.column,
                weights.len(),
                predicate.queries.len()
            )));
        }
    }
    Ok(())
}
