//! Inverted text index over one string column.
//!
//! Two stored views per tuple: the tokenized postings answer `LIKE` and
//! `MATCH`, the raw value map answers `=`. Compound predicates map
//! `AND → MUST` (intersection) and `OR → SHOULD` (union); every hit
//! carries a tf-idf score. The writer buffers change operations and folds
//! them into a staged reader when the buffer overflows; `commit` folds the
//! rest and swaps in the fresh reader atomically.

use crate::{data_file, Index, IndexKind, IndexMatch};
use bincode::config;
use bincode::serde::{decode_from_slice, encode_to_vec};
use common::{
    BooleanPredicate, ColumnName, ComparisonOperator, Connector, Cost, DataChangeEvent, DbError,
    DbResult, IndexName, TupleId,
};
use hashbrown::HashMap;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;
use types::Value;

/// The writer folds its buffer into the staged reader past this many
/// pending operations.
const WRITER_BUFFER_LIMIT: usize = 100_000;

#[derive(Clone, Default, Serialize, Deserialize)]
struct TextReader {
    /// token → (tuple, term frequency)
    postings: HashMap<String, Vec<(u64, u32)>>,
    /// raw value → tuples
    exact: HashMap<String, Vec<u64>>,
    docs: u64,
}

enum TextOp {
    Add { tid: u64, text: String },
    Remove { tid: u64, text: String },
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

impl TextReader {
    fn apply(&mut self, op: &TextOp) {
        match op {
            TextOp::Add { tid, text } => {
                let mut counts: HashMap<String, u32> = HashMap::new();
                for token in tokenize(text) {
                    *counts.entry(token).or_insert(0) += 1;
                }
                for (token, tf) in counts {
                    self.postings.entry(token).or_default().push((*tid, tf));
                }
                self.exact.entry(text.clone()).or_default().push(*tid);
                self.docs += 1;
            }
            TextOp::Remove { tid, text } => {
                for token in tokenize(text) {
                    if let Some(list) = self.postings.get_mut(&token) {
                        list.retain(|(t, _)| t != tid);
                        if list.is_empty() {
                            self.postings.remove(&token);
                        }
                    }
                }
                if let Some(list) = self.exact.get_mut(text) {
                    list.retain(|t| t != tid);
                    if list.is_empty() {
                        self.exact.remove(text);
                    }
                }
                self.docs = self.docs.saturating_sub(1);
            }
        }
    }

    fn idf(&self, token: &str) -> f64 {
        let df = self.postings.get(token).map(|l| l.len()).unwrap_or(0);
        if df == 0 {
            0.0
        } else {
            (1.0 + self.docs as f64 / df as f64).ln()
        }
    }
}

pub struct InvertedTextIndex {
    name: IndexName,
    column: ColumnName,
    path: PathBuf,
    reader: Mutex<Arc<TextReader>>,
    staged: Mutex<Option<TextReader>>,
    pending: Mutex<Vec<TextOp>>,
    dirty: AtomicBool,
}

impl InvertedTextIndex {
    pub fn create(dir: &Path, name: IndexName, column: ColumnName) -> DbResult<InvertedTextIndex> {
        let index = InvertedTextIndex {
            name,
            column,
            path: data_file(dir),
            reader: Mutex::new(Arc::new(TextReader::default())),
            staged: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
            dirty: AtomicBool::new(false),
        };
        index.persist(&index.reader.lock())?;
        Ok(index)
    }

    pub fn open(dir: &Path, name: IndexName, column: ColumnName) -> DbResult<InvertedTextIndex> {
        let path = data_file(dir);
        let (reader, dirty) = match std::fs::read(&path) {
            Ok(bytes) => match decode_from_slice(&bytes, config::legacy()) {
                Ok((reader, _)) => (reader, false),
                Err(_) => (TextReader::default(), true),
            },
            Err(_) => (TextReader::default(), true),
        };
        if dirty {
            debug!(index = %name, "text index data unreadable, marked dirty");
        }
        Ok(InvertedTextIndex {
            name,
            column,
            path,
            reader: Mutex::new(Arc::new(reader)),
            staged: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
            dirty: AtomicBool::new(dirty),
        })
    }

    fn persist(&self, reader: &TextReader) -> DbResult<()> {
        let bytes = encode_to_vec(reader, config::legacy())
            .map_err(|e| DbError::DataCorruption(format!("text index encode failed: {e}")))?;
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }

    fn push_op(&self, op: TextOp) {
        let mut pending = self.pending.lock();
        pending.push(op);
        if pending.len() >= WRITER_BUFFER_LIMIT {
            // Fold the buffer early so memory stays bounded; visibility is
            // unchanged since filters consult the staged reader too.
            let mut staged = self.staged.lock();
            let target = staged.get_or_insert_with(|| (**self.reader.lock()).clone());
            for op in pending.drain(..) {
                target.apply(&op);
            }
        }
    }

    /// Snapshot reflecting the committed state plus this transaction's own
    /// buffered writes.
    fn effective(&self) -> Arc<TextReader> {
        let pending = self.pending.lock();
        let staged = self.staged.lock();
        if staged.is_none() && pending.is_empty() {
            return Arc::clone(&self.reader.lock());
        }
        let mut view = staged
            .clone()
            .unwrap_or_else(|| (**self.reader.lock()).clone());
        for op in pending.iter() {
            view.apply(op);
        }
        Arc::new(view)
    }

    fn text_of<'a>(&self, values: &'a [(ColumnName, Value)]) -> Option<&'a str> {
        values.iter().find(|(c, _)| *c == self.column).and_then(|(_, v)| match v {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        })
    }

    fn eval(&self, reader: &TextReader, predicate: &BooleanPredicate) -> DbResult<HashMap<u64, f64>> {
        match predicate {
            BooleanPredicate::Atomic {
                op, values, not, ..
            } => {
                if *not {
                    return Err(DbError::PredicateNotSupportedByIndex(self.name.to_string()));
                }
                let mut hits: HashMap<u64, f64> = HashMap::new();
                match op {
                    ComparisonOperator::Equal => {
                        for value in values {
                            if let Value::String(s) = value {
                                for tid in reader.exact.get(s).into_iter().flatten() {
                                    *hits.entry(*tid).or_insert(0.0) += 1.0;
                                }
                            }
                        }
                    }
                    ComparisonOperator::Like => {
                        for value in values {
                            if let Value::String(pattern) = value {
                                let re = like_to_regex(pattern)?;
                                for (raw, tids) in &reader.exact {
                                    if re.is_match(raw) {
                                        for tid in tids {
                                            *hits.entry(*tid).or_insert(0.0) += 1.0;
                                        }
                                    }
                                }
                            }
                        }
                    }
                    ComparisonOperator::Match => {
                        for value in values {
                            if let Value::String(query) = value {
                                for token in tokenize(query) {
                                    let idf = reader.idf(&token);
                                    for (tid, tf) in
                                        reader.postings.get(&token).into_iter().flatten()
                                    {
                                        *hits.entry(*tid).or_insert(0.0) += *tf as f64 * idf;
                                    }
                                }
                            }
                        }
                    }
                    _ => {
                        return Err(DbError::PredicateNotSupportedByIndex(
                            self.name.to_string(),
                        ));
                    }
                }
                Ok(hits)
            }
            BooleanPredicate::Compound {
                connector,
                left,
                right,
            } => {
                let l = self.eval(reader, left)?;
                let r = self.eval(reader, right)?;
                Ok(match connector {
                    // AND → MUST: intersection, scores summed.
                    Connector::And => l
                        .into_iter()
                        .filter_map(|(tid, score)| r.get(&tid).map(|s| (tid, score + s)))
                        .collect(),
                    // OR → SHOULD: union, scores summed.
                    Connector::Or => {
                        let mut merged = l;
                        for (tid, score) in r {
                            *merged.entry(tid).or_insert(0.0) += score;
                        }
                        merged
                    }
                })
            }
        }
    }
}

fn like_to_regex(pattern: &str) -> DbResult<Regex> {
    let mut out = String::from("(?i)^");
    for c in pattern.chars() {
        match c {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|e| DbError::QuerySyntax(format!("bad LIKE pattern '{pattern}': {e}")))
}

impl Index for InvertedTextIndex {
    fn name(&self) -> &IndexName {
        &self.name
    }

    fn kind(&self) -> IndexKind {
        IndexKind::InvertedText
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

    fn can_process(&self, predicate: &BooleanPredicate) -> bool {
        match predicate {
            BooleanPredicate::Atomic {
                column,
                op,
                not: false,
                values,
            } => {
                *column == self.column
                    && matches!(
                        op,
                        ComparisonOperator::Equal
                            | ComparisonOperator::Like
                            | ComparisonOperator::Match
                    )
                    && values.iter().all(|v| matches!(v, Value::String(_)))
                    && !values.is_empty()
            }
            BooleanPredicate::Compound { left, right, .. } => {
                self.can_process(left) && self.can_process(right)
            }
            _ => false,
        }
    }

    fn cost(&self, predicate: &BooleanPredicate) -> Cost {
        if self.is_dirty() || !self.can_process(predicate) {
            return Cost::INVALID;
        }
        let atoms = predicate.atom_count() as f32;
        let docs = self.reader.lock().docs as f32;
        Cost::new(atoms * docs.sqrt() * 0.01, atoms * docs * 0.001, docs * 0.01)
    }

    fn filter(&self, predicate: &BooleanPredicate) -> DbResult<Vec<IndexMatch>> {
        if !self.can_process(predicate) {
            return Err(DbError::PredicateNotSupportedByIndex(self.name.to_string()));
        }
        let reader = self.effective();
        let hits = self.eval(&reader, predicate)?;
        let mut matches: Vec<IndexMatch> = hits
            .into_iter()
            .map(|(tid, score)| IndexMatch {
                tid: TupleId(tid),
                score: Some(score),
                key: None,
            })
            .collect();
        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.tid.cmp(&b.tid))
        });
        Ok(matches)
    }

    fn rebuild(
        &self,
        source: &mut dyn Iterator<Item = DbResult<(TupleId, Value)>>,
    ) -> DbResult<()> {
        let mut fresh = TextReader::default();
        for item in source {
            let (tid, value) = item?;
            match value {
                Value::Null => {}
                Value::String(text) => fresh.apply(&TextOp::Add { tid: tid.0, text }),
                other => {
                    self.mark_dirty();
                    return Err(DbError::TxValidation(format!(
                        "text index '{}' over non-string value {other:?}",
                        self.name
                    )));
                }
            }
        }
        self.persist(&fresh)?;
        *self.reader.lock() = Arc::new(fresh);
        self.staged.lock().take();
        self.pending.lock().clear();
        self.dirty.store(false, Ordering::SeqCst);
        debug!(index = %self.name, "text index rebuilt");
        Ok(())
    }

    fn update(&self, event: &DataChangeEvent) -> DbResult<()> {
        match event {
            DataChangeEvent::Insert { tid, values, .. } => {
                if let Some(text) = self.text_of(values) {
                    self.push_op(TextOp::Add {
                        tid: tid.0,
                        text: text.to_string(),
                    });
                }
            }
            DataChangeEvent::Update { tid, old, new, .. } => {
                if let Some(text) = self.text_of(old) {
                    self.push_op(TextOp::Remove {
                        tid: tid.0,
                        text: text.to_string(),
                    });
                }
                if let Some(text) = self.text_of(new) {
                    self.push_op(TextOp::Add {
                        tid: tid.0,
                        text: text.to_string(),
                    });
                }
            }
            DataChangeEvent::Delete { tid, old, .. } => {
                if let Some(text) = self.text_of(old) {
                    self.push_op(TextOp::Remove {
                        tid: tid.0,
                        text: text.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn commit(&self) -> DbResult<()> {
        let mut pending = self.pending.lock();
        let mut staged = self.staged.lock();
        if staged.is_none() && pending.is_empty() {
            return Ok(());
        }
        let mut fresh = staged
            .take()
            .unwrap_or_else(|| (**self.reader.lock()).clone());
        for op in pending.drain(..) {
            fresh.apply(&op);
        }
        self.persist(&fresh)?;
        // Swap in the new reader; the old snapshot dies with its last Arc.
        *self.reader.lock() = Arc::new(fresh);
        Ok(())
    }

    fn rollback(&self) -> DbResult<()> {
        self.staged.lock().take();
        self.pending.lock().clear();
        Ok(())
    }
}
