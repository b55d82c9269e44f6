//! Unique hash index: a persistent map from an encoded scalar key to the
//! tuple holding it. Duplicates are rejected with `TxValidation` during
//! both rebuild and incremental update.

use crate::{data_file, Index, IndexKind, IndexMatch};
use bincode::config;
use bincode::serde::{decode_from_slice, encode_to_vec};
use common::{
    BooleanPredicate, ColumnName, ComparisonOperator, Cost, DataChangeEvent, DbError, DbResult,
    IndexName, TupleId,
};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;
use types::{codec, Value};

pub struct UniqueHashIndex {
    name: IndexName,
    column: ColumnName,
    path: PathBuf,
    /// Committed key → tuple mapping.
    committed: Mutex<HashMap<Vec<u8>, u64>>,
    /// Uncommitted overlay: `Some` inserts, `None` removes.
    delta: Mutex<HashMap<Vec<u8>, Option<u64>>>,
    dirty: AtomicBool,
}

fn encode_key(value: &Value) -> DbResult<Vec<u8>> {
    codec::encode_variable(value).map_err(|e| DbError::DataCorruption(e.to_string()))
}

impl UniqueHashIndex {
    pub fn create(dir: &Path, name: IndexName, column: ColumnName) -> DbResult<UniqueHashIndex> {
        let index = UniqueHashIndex {
            name,
            column,
            path: data_file(dir),
            committed: Mutex::new(HashMap::new()),
            delta: Mutex::new(HashMap::new()),
            dirty: AtomicBool::new(false),
        };
        index.persist()?;
        Ok(index)
    }

    pub fn open(dir: &Path, name: IndexName, column: ColumnName) -> DbResult<UniqueHashIndex> {
        let path = data_file(dir);
        let (map, dirty) = match std::fs::read(&path) {
            Ok(bytes) => match decode_from_slice(&bytes, config::legacy()) {
                Ok((map, _)) => (map, false),
                Err(_) => (HashMap::new(), true),
            },
            Err(_) => (HashMap::new(), true),
        };
        if dirty {
            debug!(index = %name, "hash index data unreadable, marked dirty");
        }
        Ok(UniqueHashIndex {
            name,
            column,
            path,
            committed: Mutex::new(map),
            delta: Mutex::new(HashMap::new()),
            dirty: AtomicBool::new(dirty),
        })
    }

    fn persist(&self) -> DbResult<()> {
        let bytes = encode_to_vec(&*self.committed.lock(), config::legacy())
            .map_err(|e| DbError::DataCorruption(format!("hash index encode failed: {e}")))?;
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }

    /// Probe through the overlay, then the committed map.
    fn probe(&self, key: &[u8]) -> Option<u64> {
        if let Some(entry) = self.delta.lock().get(key) {
            return *entry;
        }
        self.committed.lock().get(key).copied()
    }

    fn insert_unique(&self, key: Vec<u8>, tid: TupleId, value: &Value) -> DbResult<()> {
        if self.probe(&key).is_some() {
            return Err(DbError::TxValidation(format!(
                "duplicate key {value} for unique index '{}'",
                self.name
            )));
        }
        self.delta.lock().insert(key, Some(tid.0));
        Ok(())
    }

    fn keyed_value<'a>(&self, values: &'a [(ColumnName, Value)]) -> Option<&'a Value> {
        values
            .iter()
            .find(|(c, _)| *c == self.column)
            .map(|(_, v)| v)
    }
}

impl Index for UniqueHashIndex {
    fn name(&self) -> &IndexName {
        &self.name
    }

    fn kind(&self) -> IndexKind {
        IndexKind::UniqueHash
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
                    && matches!(op, ComparisonOperator::Equal | ComparisonOperator::In)
                    && !values.is_empty()
            }
            _ => false,
        }
    }

    fn cost(&self, predicate: &BooleanPredicate) -> Cost {
        if self.is_dirty() || !self.can_process(predicate) {
            return Cost::INVALID;
        }
        let probes = match predicate {
            BooleanPredicate::Atomic { values, .. } => values.len() as f32,
            _ => 1.0,
        };
        Cost::new(probes * 0.1, probes * 0.01, probes * 0.001)
    }

    fn filter(&self, predicate: &BooleanPredicate) -> DbResult<Vec<IndexMatch>> {
        if !self.can_process(predicate) {
            return Err(DbError::PredicateNotSupportedByIndex(self.name.to_string()));
        }
        let values = match predicate {
            BooleanPredicate::Atomic { values, .. } => values,
            _ => unreachable!("can_process admits only atomics"),
        };
        let mut matches = Vec::new();
        for value in values {
            let key = encode_key(value)?;
            if let Some(tid) = self.probe(&key) {
                matches.push(IndexMatch {
                    tid: TupleId(tid),
                    score: None,
                    key: Some(value.clone()),
                });
            }
        }
        matches.sort_by_key(|m| m.tid);
        Ok(matches)
    }

    fn rebuild(
        &self,
        source: &mut dyn Iterator<Item = DbResult<(TupleId, Value)>>,
    ) -> DbResult<()> {
        let mut fresh: HashMap<Vec<u8>, u64> = HashMap::new();
        for item in source {
            let (tid, value) = item?;
            if value.is_null() {
                continue;
            }
            let key = encode_key(&value)?;
            if fresh.insert(key, tid.0).is_some() {
                self.mark_dirty();
                return Err(DbError::TxValidation(format!(
                    "duplicate key {value} while rebuilding unique index '{}'",
                    self.name
                )));
            }
        }
        *self.committed.lock() = fresh;
        self.delta.lock().clear();
        self.persist()?;
        self.dirty.store(false, Ordering::SeqCst);
        debug!(index = %self.name, "hash index rebuilt");
        Ok(())
    }

    fn update(&self, event: &DataChangeEvent) -> DbResult<()> {
        match event {
            DataChangeEvent::Insert { tid, values, .. } => {
                if let Some(value) = self.keyed_value(values) {
                    if !value.is_null() {
                        self.insert_unique(encode_key(value)?, *tid, value)?;
                    }
                }
            }
            DataChangeEvent::Update { tid, old, new, .. } => {
                if let Some(old_value) = self.keyed_value(old) {
                    if !old_value.is_null() {
                        self.delta.lock().insert(encode_key(old_value)?, None);
                    }
                }
                if let Some(new_value) = self.keyed_value(new) {
                    if !new_value.is_null() {
                        self.insert_unique(encode_key(new_value)?, *tid, new_value)?;
                    }
                }
            }
            DataChangeEvent::Delete { old, .. } => {
                if let Some(value) = self.keyed_value(old) {
                    if !value.is_null() {
                        self.delta.lock().insert(encode_key(value)?, None);
                    }
                }
            }
        }
        Ok(())
    }

    fn commit(&self) -> DbResult<()> {
        {
            let mut committed = self.committed.lock();
            for (key, entry) in self.delta.lock().drain() {
                match entry {
                    Some(tid) => {
                        committed.insert(key, tid);
                    }
                    None => {
                        committed.remove(&key);
                    }
                }
            }
        }
        self.persist()
    }

    fn rollback(&self) -> DbResult<()> {
        self.delta.lock().clear();
        Ok(())
    }
}
