//! Vector-approximation file (VA-file) index.
//!
//! Each indexed vector is quantized per dimension against equidistant
//! marks into a compact signature. A kNN scan walks the signatures
//! computing lower/upper bounds on the (squared) distance and keeps a
//! threshold equal to the k-th best upper bound seen; signatures whose
//! lower bound exceeds the threshold cannot make the result and are
//! skipped (VA-SSA). Survivors are handed back as candidates for exact
//! distance computation by the caller.

use crate::{data_file, Index, IndexKind, IndexMatch};
use bincode::config;
use bincode::serde::{decode_from_slice, encode_to_vec};
use common::{
    BooleanPredicate, ColumnName, Cost, DataChangeEvent, DbError, DbResult, Distance, IndexName,
    KnnPredicate, TupleId,
};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;
use types::Value;

/// Quantization cells per dimension; signatures store one byte per
/// dimension.
const CELLS: usize = 32;

#[derive(Default)]
struct VafState {
    /// Per-dimension cell boundaries, `CELLS + 1` marks each. Empty until
    /// the first rebuild.
    marks: Vec<Vec<f64>>,
    committed: HashMap<u64, Vec<u8>>,
    delta: HashMap<u64, Option<Vec<u8>>>,
}

/// Per-query bound tables: the contribution of each `(dimension, cell)`
/// pair to the squared-distance lower and upper bounds.
struct Bounds {
    lb: Vec<[f64; CELLS]>,
    ub: Vec<[f64; CELLS]>,
}

impl Bounds {
    fn new(query: &[f64], marks: &[Vec<f64>]) -> Bounds {
        let mut lb = Vec::with_capacity(marks.len());
        let mut ub = Vec::with_capacity(marks.len());
        for (d, dim_marks) in marks.iter().enumerate() {
            let q = query[d];
            let mut lb_row = [0.0; CELLS];
            let mut ub_row = [0.0; CELLS];
            for c in 0..CELLS {
                let lo = dim_marks[c];
                let hi = dim_marks[c + 1];
                if q < lo {
                    lb_row[c] = (lo - q) * (lo - q);
                    ub_row[c] = (hi - q) * (hi - q);
                } else if q > hi {
                    lb_row[c] = (q - hi) * (q - hi);
                    ub_row[c] = (q - lo) * (q - lo);
                } else {
                    lb_row[c] = 0.0;
                    ub_row[c] = (q - lo).max(hi - q).powi(2);
                }
            }
            lb.push(lb_row);
            ub.push(ub_row);
        }
        Bounds { lb, ub }
    }

    /// Squared-distance bounds for one signature.
    fn update(&self, signature: &[u8]) -> (f64, f64) {
        let mut lb = 0.0;
        let mut ub = 0.0;
        for (d, cell) in signature.iter().enumerate() {
            lb += self.lb[d][*cell as usize];
            ub += self.ub[d][*cell as usize];
        }
        (lb, ub)
    }

    fn is_candidate(&self, signature: &[u8], threshold: f64) -> bool {
        self.update(signature).0 <= threshold
    }
}

fn quantize(vector: &[f64], marks: &[Vec<f64>]) -> Vec<u8> {
    vector
        .iter()
        .zip(marks.iter())
        .map(|(x, dim_marks)| {
            let mut cell = 0usize;
            while cell + 1 < CELLS && *x >= dim_marks[cell + 1] {
                cell += 1;
            }
            cell as u8
        })
        .collect()
}

pub struct VafIndex {
    name: IndexName,
    column: ColumnName,
    path: PathBuf,
    state: Mutex<VafState>,
    dirty: AtomicBool,
}

impl VafIndex {
    pub fn create(dir: &Path, name: IndexName, column: ColumnName) -> DbResult<VafIndex> {
        let index = VafIndex {
            name,
            column,
            path: data_file(dir),
            state: Mutex::new(VafState::default()),
            // A VA-file without marks cannot answer anything yet.
            dirty: AtomicBool::new(true),
        };
        index.persist()?;
        Ok(index)
    }

    pub fn open(dir: &Path, name: IndexName, column: ColumnName) -> DbResult<VafIndex> {
        let path = data_file(dir);
        let (marks, committed, dirty): (Vec<Vec<f64>>, HashMap<u64, Vec<u8>>, bool) =
            match std::fs::read(&path) {
                Ok(bytes) => match decode_from_slice(&bytes, config::legacy()) {
                    Ok(((marks, committed), _)) => {
                        let marks: Vec<Vec<f64>> = marks;
                        let dirty = marks.is_empty();
                        (marks, committed, dirty)
                    }
                    Err(_) => (Vec::new(), HashMap::new(), true),
                },
                Err(_) => (Vec::new(), HashMap::new(), true),
            };
        if dirty {
            debug!(index = %name, "va-file needs a rebuild before use");
        }
        Ok(VafIndex {
            name,
            column,
            path,
            state: Mutex::new(VafState {
                marks,
                committed,
                delta: HashMap::new(),
            }),
            dirty: AtomicBool::new(dirty),
        })
    }

    fn persist(&self) -> DbResult<()> {
        let state = self.state.lock();
        let bytes = encode_to_vec((&state.marks, &state.committed), config::legacy())
            .map_err(|e| DbError::DataCorruption(format!("va-file encode failed: {e}")))?;
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }

    fn vector_of(&self, values: &[(ColumnName, Value)]) -> Option<Vec<f64>> {
        values
            .iter()
            .find(|(c, _)| *c == self.column)
            .and_then(|(_, v)| v.as_f64_vector())
    }
}

impl Index for VafIndex {
    fn name(&self) -> &IndexName {
        &self.name
    }

    fn kind(&self) -> IndexKind {
        IndexKind::VaFile
    }

    fn column(&self) -> &ColumnName {
        &self.column
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    fn can_process(&self, _predicate: &BooleanPredicate) -> bool {
        false
    }

    fn cost(&self, _predicate: &BooleanPredicate) -> Cost {
        Cost::INVALID
    }

    fn filter(&self, _predicate: &BooleanPredicate) -> DbResult<Vec<IndexMatch>> {
        Err(DbError::PredicateNotSupportedByIndex(self.name.to_string()))
    }

    fn can_process_knn(&self, knn: &KnnPredicate) -> bool {
        knn.column == self.column
            && matches!(knn.distance, Distance::L2 | Distance::SquaredL2)
            && !self.is_dirty()
            && !self.state.lock().marks.is_empty()
    }

    fn knn_cost(&self, knn: &KnnPredicate) -> Cost {
        if !self.can_process_knn(knn) {
            return Cost::INVALID;
        }
        let state = self.state.lock();
        let n = state.committed.len() as f32;
        let dims = state.marks.len() as f32;
        // One pass over the signatures plus exact reads for a small
        // candidate fraction.
        Cost::new(n * dims * 0.0005, n * dims * 0.001, n * 0.001)
    }

    fn knn_candidates(&self, knn: &KnnPredicate) -> DbResult<Vec<Vec<TupleId>>> {
        if !self.can_process_knn(knn) {
            return Err(DbError::PredicateNotSupportedByIndex(self.name.to_string()));
        }
        let state = self.state.lock();
        let dims = state.marks.len();

        // Effective signature set: committed minus deletions plus the
        // transaction's own pending inserts.
        let mut signatures: Vec<(u64, &Vec<u8>)> = Vec::with_capacity(state.committed.len());
        for (tid, sig) in &state.committed {
            match state.delta.get(tid) {
                Some(None) => {}
                Some(Some(replacement)) => signatures.push((*tid, replacement)),
                None => signatures.push((*tid, sig)),
            }
        }
        for (tid, entry) in &state.delta {
            if let Some(sig) = entry {
                if !state.committed.contains_key(tid) {
                    signatures.push((*tid, sig));
                }
            }
        }
        signatures.sort_by_key(|(tid, _)| *tid);

        let mut result = Vec::with_capacity(knn.queries.len());
        for query in &knn.queries {
            if query.len() != dims {
                return Err(DbError::QueryBind(format!(
                    "query vector has {} dimensions, index '{}' expects {dims}",
                    query.len(),
                    self.name
                )));
            }
            let bounds = Bounds::new(query, &state.marks);

            // VA-SSA: threshold is the k-th smallest upper bound so far.
            let mut best_ubs: Vec<f64> = Vec::with_capacity(knn.k + 1);
            let mut survivors: Vec<(u64, f64, f64)> = Vec::new();
            for (tid, sig) in &signatures {
                let threshold = if best_ubs.len() == knn.k {
                    best_ubs[knn.k - 1]
                } else {
                    f64::INFINITY
                };
                if !bounds.is_candidate(sig, threshold) {
                    continue;
                }
                let (lb, ub) = bounds.update(sig);
                let at = best_ubs.partition_point(|x| *x <= ub);
                best_ubs.insert(at, ub);
                best_ubs.truncate(knn.k);
                survivors.push((*tid, lb, ub));
            }

            let threshold = if best_ubs.len() == knn.k {
                best_ubs[knn.k - 1]
            } else {
                f64::INFINITY
            };
            survivors.retain(|(_, lb, _)| *lb <= threshold);
            survivors.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            result.push(survivors.into_iter().map(|(tid, _, _)| TupleId(tid)).collect());
        }
        Ok(result)
    }

    fn rebuild(
        &self,
        source: &mut dyn Iterator<Item = DbResult<(TupleId, Value)>>,
    ) -> DbResult<()> {
        let mut vectors: Vec<(u64, Vec<f64>)> = Vec::new();
        for item in source {
            let (tid, value) = item?;
            if value.is_null() {
                continue;
            }
            let vector = value.as_f64_vector().ok_or_else(|| {
                DbError::TxValidation(format!(
                    "va-file '{}' over non-vector value {value:?}",
                    self.name
                ))
            })?;
            vectors.push((tid.0, vector));
        }

        let mut state = self.state.lock();
        if vectors.is_empty() {
            state.marks.clear();
            state.committed.clear();
            state.delta.clear();
            drop(state);
            self.persist()?;
            // No marks yet; stays dirty until data arrives.
            self.dirty.store(true, Ordering::SeqCst);
            return Ok(());
        }

        let dims = vectors[0].1.len();
        let mut mins = vec![f64::INFINITY; dims];
        let mut maxs = vec![f64::NEG_INFINITY; dims];
        for (_, v) in &vectors {
            if v.len() != dims {
                return Err(DbError::TxValidation(format!(
                    "inconsistent vector dimensions while rebuilding '{}'",
                    self.name
                )));
            }
            for d in 0..dims {
                mins[d] = mins[d].min(v[d]);
                maxs[d] = maxs[d].max(v[d]);
            }
        }

        let marks: Vec<Vec<f64>> = (0..dims)
            .map(|d| {
                let span = (maxs[d] - mins[d]).max(f64::EPSILON);
                (0..=CELLS)
                    .map(|c| mins[d] + span * c as f64 / CELLS as f64)
                    .collect()
            })
            .collect();
        state.committed = vectors
            .iter()
            .map(|(tid, v)| (*tid, quantize(v, &marks)))
            .collect();
        state.marks = marks;
        state.delta.clear();
        drop(state);

        self.persist()?;
        self.dirty.store(false, Ordering::SeqCst);
        debug!(index = %self.name, "va-file rebuilt");
        Ok(())
    }

    fn update(&self, event: &DataChangeEvent) -> DbResult<()> {
        let mut state = self.state.lock();
        if state.marks.is_empty() {
            // Nothing to quantize against yet; a rebuild will pick the
            // tuple up.
            drop(state);
            self.mark_dirty();
            return Ok(());
        }
        let dims = state.marks.len();
        match event {
            DataChangeEvent::Insert { tid, values, .. }
            | DataChangeEvent::Update {
                tid, new: values, ..
            } => {
                if let Some(vector) = self.vector_of(values) {
                    if vector.len() != dims {
                        return Err(DbError::TxValidation(format!(
                            "vector with {} dimensions for va-file '{}' ({dims} expected)",
                            vector.len(),
                            self.name
                        )));
                    }
                    let sig = quantize(&vector, &state.marks);
                    state.delta.insert(tid.0, Some(sig));
                } else {
                    state.delta.insert(tid.0, None);
                }
            }
            DataChangeEvent::Delete { tid, .. } => {
                state.delta.insert(tid.0, None);
            }
        }
        Ok(())
    }

    fn commit(&self) -> DbResult<()> {
        {
            let mut state = self.state.lock();
            let delta: Vec<(u64, Option<Vec<u8>>)> = state.delta.drain().collect();
            for (tid, entry) in delta {
                match entry {
                    Some(sig) => {
                        state.committed.insert(tid, sig);
                    }
                    None => {
                        state.committed.remove(&tid);
                    }
                }
            }
        }
        self.persist()
    }

    fn rollback(&self) -> DbResult<()> {
        self.state.lock().delta.clear();
        Ok(())
    }
}
