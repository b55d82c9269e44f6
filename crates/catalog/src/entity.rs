//! Entities: an ordered set of columns sharing one tuple-id space, plus
//! the indexes and statistics attached to them.
//!
//! The entity's `index.db` manifest records each column (declaration,
//! driver, file), the index list, and the statistics; it is rewritten on
//! commit. Writing transactional views emit a [`DataChangeEvent`] per
//! mutation and dispatch it to every incrementally-updatable index before
//! the surrounding transaction commits.

use crate::bincode_config;
use crate::predicate::eval_predicate;
use bincode::serde::{decode_from_slice, encode_to_vec};
use column::{ColumnDef, ColumnDriver, ColumnReader, ColumnStore, HareCursor};
use common::knn::{distance, distance_weighted, KnnHeap};
use common::{
    BooleanPredicate, ColumnName, Config, DataChangeEvent, DbError, DbResult, EntityName,
    KnnPredicate, Record, TupleId,
};
use hashbrown::HashMap;
use index::{Index, IndexKind};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use txn::{CloseGuard, CloseLock, LockMode, TransactionContext};
use types::Value;

const ENTITY_FILE: &str = "index.db";

/// Row count, high-water tuple id, and per-column null counts. Consumed
/// by the cost model and kept current by the writing operators.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityStatistics {
    pub rows: u64,
    pub max_tuple_id: u64,
    pub null_counts: HashMap<String, u64>,
}

/// Catalogue record of one index.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexEntry {
    pub name: String,
    pub kind: IndexKind,
    pub column: String,
    pub dir: String,
}

#[derive(Serialize, Deserialize)]
struct ColumnEntry {
    def: ColumnDef,
    driver: ColumnDriver,
    file: String,
    /// Stable identity of the backing file, surviving renames.
    file_id: uuid::Uuid,
}

#[derive(Serialize, Deserialize)]
struct EntityManifest {
    columns: Vec<ColumnEntry>,
    indexes: Vec<IndexEntry>,
    statistics: EntityStatistics,
}

/// One column of an entity: qualified name plus its backing store.
pub struct EntityColumn {
    pub name: ColumnName,
    pub store: Arc<ColumnStore>,
    file_id: uuid::Uuid,
}

impl std::fmt::Debug for EntityColumn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityColumn")
            .field("name", &self.name)
            .field("file_id", &self.file_id)
            .finish()
    }
}

impl EntityColumn {
    pub fn def(&self) -> &ColumnDef {
        self.store.def()
    }
}

struct IndexSlot {
    entry: IndexEntry,
    index: Arc<dyn Index>,
}

pub struct Entity {
    name: EntityName,
    path: PathBuf,
    config: Config,
    columns: Vec<Arc<EntityColumn>>,
    indexes: RwLock<Vec<IndexSlot>>,
    statistics: RwLock<EntityStatistics>,
    close_lock: Arc<CloseLock>,
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish()
    }
}

impl Entity {
    pub(crate) fn create(
        name: EntityName,
        path: PathBuf,
        defs: Vec<ColumnDef>,
        config: &Config,
    ) -> DbResult<Arc<Entity>> {
        std::fs::create_dir_all(&path)?;
        let mut columns = Vec::with_capacity(defs.len());
        for def in defs {
            let file = format!("{}.col", def.name);
            let store = ColumnStore::create(&path.join(&file), def.clone(), config)?;
            columns.push(Arc::new(EntityColumn {
                name: name.column(&def.name),
                store: Arc::new(store),
                file_id: uuid::Uuid::new_v4(),
            }));
        }
        let entity = Arc::new(Entity {
            name,
            path,
            config: config.clone(),
            columns,
            indexes: RwLock::new(Vec::new()),
            statistics: RwLock::new(EntityStatistics::default()),
            close_lock: CloseLock::new(),
        });
        entity.persist()?;
        Ok(entity)
    }

    pub(crate) fn open(name: EntityName, path: PathBuf, config: &Config) -> DbResult<Arc<Entity>> {
        let file = path.join(ENTITY_FILE);
        let bytes = std::fs::read(&file)?;
        let (manifest, _): (EntityManifest, _) = decode_from_slice(&bytes, bincode_config())
            .map_err(|e| {
                DbError::DataCorruption(format!("entity file '{}' unreadable: {e}", file.display()))
            })?;

        let mut columns = Vec::with_capacity(manifest.columns.len());
        for entry in &manifest.columns {
            let store = ColumnStore::open(&path.join(&entry.file), entry.def.clone(), config)?;
            columns.push(Arc::new(EntityColumn {
                name: name.column(&entry.def.name),
                store: Arc::new(store),
                file_id: entry.file_id,
            }));
        }

        let mut indexes = Vec::with_capacity(manifest.indexes.len());
        for entry in manifest.indexes {
            let idx = index::open_index(
                entry.kind,
                &path.join(&entry.dir),
                name.index(&entry.name),
                name.column(&entry.column),
            )?;
            indexes.push(IndexSlot { entry, index: idx });
        }

        Ok(Arc::new(Entity {
            name,
            path,
            config: config.clone(),
            columns,
            indexes: RwLock::new(indexes),
            statistics: RwLock::new(manifest.statistics),
            close_lock: CloseLock::new(),
        }))
    }

    pub fn name(&self) -> &EntityName {
        &self.name
    }

    pub fn statistics(&self) -> EntityStatistics {
        self.statistics.read().clone()
    }

    pub fn columns(&self) -> &[Arc<EntityColumn>] {
        &self.columns
    }

    pub fn indexes(&self) -> Vec<Arc<dyn Index>> {
        self.indexes.read().iter().map(|s| Arc::clone(&s.index)).collect()
    }

    fn column_by_name(&self, simple: &str) -> DbResult<&Arc<EntityColumn>> {
        let lowered = simple.to_lowercase();
        self.columns
            .iter()
            .find(|c| c.def().name == lowered)
            .ok_or_else(|| DbError::ColumnDoesNotExist(self.name.column(&lowered).to_string()))
    }

    fn persist(&self) -> DbResult<()> {
        let manifest = EntityManifest {
            columns: self
                .columns
                .iter()
                .map(|c| ColumnEntry {
                    def: c.def().clone(),
                    driver: c.store.driver(),
                    file: format!("{}.col", c.def().name),
                    file_id: c.file_id,
                })
                .collect(),
            indexes: self.indexes.read().iter().map(|s| s.entry.clone()).collect(),
            statistics: self.statistics.read().clone(),
        };
        let bytes = encode_to_vec(&manifest, bincode_config())
            .map_err(|e| DbError::DataCorruption(format!("entity encode failed: {e}")))?;
        std::fs::write(self.path.join(ENTITY_FILE), bytes)?;
        Ok(())
    }

    /// Transactional view over this entity; takes the close hold and a
    /// shared logical lock for the transaction's lifetime.
    pub fn new_tx(self: &Arc<Self>, ctx: Arc<TransactionContext>) -> DbResult<EntityTx> {
        ctx.check_open()?;
        let guard = self.close_lock.acquire(&self.name.to_string())?;
        ctx.request_lock(&self.name.to_string(), LockMode::Shared)?;
        Ok(EntityTx {
            entity: Arc::clone(self),
            ctx,
            _guard: guard,
            wrote: AtomicBool::new(false),
        })
    }

    pub(crate) fn close(&self) -> DbResult<()> {
        self.close_lock
            .close(&self.name.to_string(), self.config.lock_timeout)?;
        for column in &self.columns {
            column.store.close()?;
        }
        Ok(())
    }

    fn commit_storage(&self) -> DbResult<()> {
        for column in &self.columns {
            column.store.commit()?;
        }
        for slot in self.indexes.read().iter() {
            slot.index.commit()?;
        }
        self.persist()
    }

    fn rollback_storage(&self, snapshot: EntityStatistics) -> DbResult<()> {
        for column in &self.columns {
            column.store.rollback()?;
        }
        for slot in self.indexes.read().iter() {
            slot.index.rollback()?;
        }
        *self.statistics.write() = snapshot;
        Ok(())
    }
}

/// Iterator feeding index rebuilds from one column.
struct ColumnScan {
    cursor: HareCursor,
    reader: ColumnReader,
}

impl Iterator for ColumnScan {
    type Item = DbResult<(TupleId, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.cursor.next() {
                Err(e) => return Some(Err(e)),
                Ok(None) => return None,
                Ok(Some(tid)) => match self.reader.get(tid) {
                    Err(e) => return Some(Err(e)),
                    Ok(None) => continue,
                    Ok(Some(value)) => return Some(Ok((tid, value))),
                },
            }
        }
    }
}

/// Transactional view of an entity: reads, writes, index maintenance.
pub struct EntityTx {
    entity: Arc<Entity>,
    ctx: Arc<TransactionContext>,
    _guard: CloseGuard,
    wrote: AtomicBool,
}

impl EntityTx {
    pub fn name(&self) -> &EntityName {
        self.entity.name()
    }

    pub fn entity(&self) -> &Arc<Entity> {
        &self.entity
    }

    pub fn list_columns(&self) -> Vec<ColumnDef> {
        self.entity.columns.iter().map(|c| c.def().clone()).collect()
    }

    pub fn column_for_name(&self, simple: &str) -> DbResult<Arc<EntityColumn>> {
        Ok(Arc::clone(self.entity.column_by_name(simple)?))
    }

    pub fn list_indexes(&self) -> Vec<common::IndexName> {
        self.entity
            .indexes
            .read()
            .iter()
            .map(|s| self.entity.name.index(&s.entry.name))
            .collect()
    }

    pub fn index_for_name(&self, simple: &str) -> DbResult<Arc<dyn Index>> {
        let lowered = simple.to_lowercase();
        self.entity
            .indexes
            .read()
            .iter()
            .find(|s| s.entry.name == lowered)
            .map(|s| Arc::clone(&s.index))
            .ok_or_else(|| {
                DbError::IndexDoesNotExist(self.entity.name.index(&lowered).to_string())
            })
    }

    pub fn indexes(&self) -> Vec<Arc<dyn Index>> {
        self.entity.indexes()
    }

    /// Live row count.
    pub fn count(&self) -> u64 {
        self.entity.columns[0].store.meta().count
    }

    pub fn statistics(&self) -> EntityStatistics {
        self.entity.statistics()
    }

    /// Cursor over the entity's tuple ids (all columns share the space).
    pub fn cursor(&self, range: Option<(u64, u64)>) -> DbResult<HareCursor> {
        self.ctx.mark_read()?;
        Ok(self.entity.columns[0].store.cursor(range))
    }

    /// Materialize the named columns of one tuple; `None` if deleted.
    pub fn read(&self, tid: TupleId, columns: &[String]) -> DbResult<Option<Record>> {
        self.ctx.mark_read()?;
        let mut values = Vec::with_capacity(columns.len());
        for column in columns {
            let col = self.entity.column_by_name(column)?;
            match col.store.read(tid)? {
                Some(value) => values.push(value),
                None => return Ok(None),
            }
        }
        Ok(Some(Record::new(tid, values)))
    }

    /// Full scan of the named columns.
    pub fn scan(&self, columns: &[String], range: Option<(u64, u64)>) -> DbResult<Vec<Record>> {
        let mut cursor = self.cursor(range)?;
        let mut records = Vec::new();
        while let Some(tid) = cursor.next()? {
            self.ctx.check_open()?;
            if let Some(record) = self.read(tid, columns)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Linear-scan Boolean filter; records carry the predicate's columns
    /// in first-mention order.
    pub fn filter(&self, predicate: &BooleanPredicate) -> DbResult<Vec<Record>> {
        let mut columns: Vec<String> = Vec::new();
        for c in predicate.columns() {
            if !columns.contains(&c.name) {
                columns.push(c.name.clone());
            }
        }
        let mut cursor = self.cursor(None)?;
        let mut records = Vec::new();
        while let Some(tid) = cursor.next()? {
            self.ctx.check_open()?;
            if let Some(record) = self.read(tid, &columns)? {
                let lookup = |name: &ColumnName| {
                    columns
                        .iter()
                        .position(|c| *c == name.name)
                        .map(|i| record.values[i].clone())
                };
                if eval_predicate(predicate, &lookup)? {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    /// Brute-force kNN over the predicate's vector column: per query, the
    /// k nearest `(tid, distance)` pairs in ascending order.
    pub fn knn_filter(&self, knn: &KnnPredicate) -> DbResult<Vec<Vec<(TupleId, f64)>>> {
        let column = self.column_for_name(&knn.column.name)?;
        let weights = knn.effective_weights();
        let mut heaps: Vec<KnnHeap> = knn.queries.iter().map(|_| KnnHeap::new(knn.k)).collect();

        let mut cursor = self.cursor(None)?;
        while let Some(tid) = cursor.next()? {
            self.ctx.check_open()?;
            let value = match column.store.read(tid)? {
                Some(v) => v,
                None => continue,
            };
            let vector = match value.as_f64_vector() {
                Some(v) => v,
                None => continue, // null
            };
            for (j, query) in knn.queries.iter().enumerate() {
                let d = match weights {
                    Some(w) => distance_weighted(knn.distance, query, &vector, &w[j]),
                    None => distance(knn.distance, query, &vector),
                };
                heaps[j].offer(tid, d);
            }
        }
        Ok(heaps.into_iter().map(|h| h.into_sorted()).collect())
    }

    /// Insert a row given `(column, value)` pairs; absent nullable columns
    /// become null. Emits the insert event to every index before
    /// returning.
    pub fn insert(&self, values: &[(String, Value)]) -> DbResult<TupleId> {
        self.begin_write()?;

        for (name, _) in values {
            self.entity.column_by_name(name)?;
        }
        let mut row: Vec<(Arc<EntityColumn>, Value)> = Vec::with_capacity(self.entity.columns.len());
        for column in &self.entity.columns {
            let value = values
                .iter()
                .find(|(name, _)| name.to_lowercase() == column.def().name)
                .map(|(_, v)| v.clone())
                .unwrap_or(Value::Null);
            column.def().check_value(&value)?;
            row.push((Arc::clone(column), value));
        }

        let mut tid = None;
        for (column, value) in &row {
            let t = column.store.append(value)?;
            match tid {
                None => tid = Some(t),
                Some(expected) => {
                    if t != expected {
                        self.ctx.mark_error();
                        return Err(DbError::DataCorruption(format!(
                            "column '{}' is out of step with its entity (tuple {t} vs {expected})",
                            column.name
                        )));
                    }
                }
            }
        }
        let tid = tid.expect("entities have at least one column");

        {
            let mut stats = self.entity.statistics.write();
            stats.rows += 1;
            stats.max_tuple_id = tid.0 + 1;
            for (column, value) in &row {
                if value.is_null() {
                    *stats.null_counts.entry(column.def().name.clone()).or_insert(0) += 1;
                }
            }
        }

        let event = DataChangeEvent::Insert {
            entity: self.entity.name.clone(),
            tid,
            values: row
                .iter()
                .map(|(c, v)| (c.name.clone(), v.clone()))
                .collect(),
        };
        self.dispatch(&event)?;
        Ok(tid)
    }

    /// Update the given columns of one tuple in place.
    pub fn update(&self, tid: TupleId, values: &[(String, Value)]) -> DbResult<()> {
        self.begin_write()?;

        let old = self.read_all(tid)?.ok_or_else(|| {
            DbError::TxValidation(format!(
                "tuple {tid} does not exist in entity '{}'",
                self.entity.name
            ))
        })?;

        let mut new = old.clone();
        for (name, value) in values {
            let column = self.entity.column_by_name(name)?;
            column.def().check_value(value)?;
            column.store.update(tid, value)?;
            let slot = new
                .iter_mut()
                .find(|(c, _)| *c == column.name)
                .expect("read_all covers every column");
            let old_value = std::mem::replace(&mut slot.1, value.clone());

            let mut stats = self.entity.statistics.write();
            if old_value.is_null() && !value.is_null() {
                let entry = stats.null_counts.entry(column.def().name.clone()).or_insert(0);
                *entry = entry.saturating_sub(1);
            } else if !old_value.is_null() && value.is_null() {
                *stats.null_counts.entry(column.def().name.clone()).or_insert(0) += 1;
            }
        }

        let event = DataChangeEvent::Update {
            entity: self.entity.name.clone(),
            tid,
            old,
            new,
        };
        self.dispatch(&event)?;
        Ok(())
    }

    /// Logically delete one tuple from every column.
    pub fn delete(&self, tid: TupleId) -> DbResult<()> {
        self.begin_write()?;

        let old = self.read_all(tid)?.ok_or_else(|| {
            DbError::TxValidation(format!(
                "tuple {tid} does not exist in entity '{}'",
                self.entity.name
            ))
        })?;
        for column in &self.entity.columns {
            column.store.delete(tid)?;
        }

        {
            let mut stats = self.entity.statistics.write();
            stats.rows = stats.rows.saturating_sub(1);
            for (name, value) in &old {
                if value.is_null() {
                    let entry = stats.null_counts.entry(name.name.clone()).or_insert(0);
                    *entry = entry.saturating_sub(1);
                }
            }
        }

        let event = DataChangeEvent::Delete {
            entity: self.entity.name.clone(),
            tid,
            old,
        };
        self.dispatch(&event)?;
        Ok(())
    }

    /// Create and build an index over one column.
    pub fn create_index(&self, simple: &str, kind: IndexKind, column: &str) -> DbResult<()> {
        self.begin_write()?;
        let lowered = simple.to_lowercase();
        let col = self.entity.column_by_name(column)?;

        if self.entity.indexes.read().iter().any(|s| s.entry.name == lowered) {
            return Err(DbError::TxValidation(format!(
                "index '{}' already exists",
                self.entity.name.index(&lowered)
            )));
        }

        let dir = self.entity.path.join(&lowered);
        let idx = index::create_index(
            kind,
            &dir,
            self.entity.name.index(&lowered),
            col.name.clone(),
        )?;
        let mut source = ColumnScan {
            cursor: col.store.cursor(None),
            reader: col.store.reader(),
        };
        idx.rebuild(&mut source)?;

        self.entity.indexes.write().push(IndexSlot {
            entry: IndexEntry {
                name: lowered.clone(),
                kind,
                column: col.def().name.clone(),
                dir: lowered.clone(),
            },
            index: idx,
        });
        debug!(index = %self.entity.name.index(&lowered), "index created");

        let entity = Arc::clone(&self.entity);
        self.ctx.on_rollback(Box::new(move || {
            entity.indexes.write().retain(|s| s.entry.name != lowered);
            let dir = entity.path.join(&lowered);
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
            Ok(())
        }));
        Ok(())
    }

    /// Drop an index; its directory disappears on commit.
    pub fn drop_index(&self, simple: &str) -> DbResult<()> {
        self.begin_write()?;
        let lowered = simple.to_lowercase();

        let slot_pos = self
            .entity
            .indexes
            .read()
            .iter()
            .position(|s| s.entry.name == lowered)
            .ok_or_else(|| {
                DbError::IndexDoesNotExist(self.entity.name.index(&lowered).to_string())
            })?;
        let slot = self.entity.indexes.write().remove(slot_pos);
        let dir = self.entity.path.join(&slot.entry.dir);

        let committed_dir = dir.clone();
        self.ctx.on_commit(Box::new(move || {
            if committed_dir.exists() {
                std::fs::remove_dir_all(&committed_dir)?;
            }
            Ok(())
        }));

        let entity = Arc::clone(&self.entity);
        self.ctx.on_rollback(Box::new(move || {
            entity.indexes.write().push(slot);
            Ok(())
        }));
        Ok(())
    }

    /// Rebuild every index from its column. An index that fails to
    /// rebuild is dropped and the drop is logged.
    pub fn optimize(&self) -> DbResult<()> {
        self.begin_write()?;

        let slots: Vec<(String, Arc<dyn Index>, String)> = self
            .entity
            .indexes
            .read()
            .iter()
            .map(|s| (s.entry.name.clone(), Arc::clone(&s.index), s.entry.column.clone()))
            .collect();

        for (name, idx, column) in slots {
            let col = self.entity.column_by_name(&column)?;
            let mut source = ColumnScan {
                cursor: col.store.cursor(None),
                reader: col.store.reader(),
            };
            if let Err(e) = idx.rebuild(&mut source) {
                warn!(
                    index = %self.entity.name.index(&name),
                    error = %e,
                    "index failed to rebuild and is dropped"
                );
                self.entity.indexes.write().retain(|s| s.entry.name != name);
                let dir = self.entity.path.join(&name);
                self.ctx.on_commit(Box::new(move || {
                    if dir.exists() {
                        std::fs::remove_dir_all(&dir)?;
                    }
                    Ok(())
                }));
            }
        }
        Ok(())
    }

    fn read_all(&self, tid: TupleId) -> DbResult<Option<Vec<(ColumnName, Value)>>> {
        let max = self.entity.columns[0].store.meta().max_tid;
        if tid.0 >= max {
            return Ok(None);
        }
        let mut row = Vec::with_capacity(self.entity.columns.len());
        for column in &self.entity.columns {
            match column.store.read(tid)? {
                Some(value) => row.push((column.name.clone(), value)),
                None => return Ok(None),
            }
        }
        Ok(Some(row))
    }

    /// First-write bookkeeping: status transition, exclusive entity lock,
    /// and the storage commit/rollback hooks.
    fn begin_write(&self) -> DbResult<()> {
        self.ctx.mark_dirty()?;
        self.ctx
            .request_lock(&self.entity.name.to_string(), LockMode::Exclusive)
            .map_err(|e| match e {
                DbError::Timeout(msg) => DbError::TransactionWriteLockFailed(msg),
                other => other,
            })?;

        if !self.wrote.swap(true, Ordering::SeqCst) {
            let entity = Arc::clone(&self.entity);
            self.ctx.on_commit(Box::new(move || entity.commit_storage()));

            let entity = Arc::clone(&self.entity);
            let snapshot = self.entity.statistics();
            self.ctx
                .on_rollback(Box::new(move || entity.rollback_storage(snapshot)));
        }
        Ok(())
    }

    /// Push a change event into every incrementally-updatable index; the
    /// rest are invalidated instead.
    fn dispatch(&self, event: &DataChangeEvent) -> DbResult<()> {
        for index in self.entity.indexes() {
            if index.supports_incremental_update() {
                index.update(event)?;
            } else {
                index.mark_dirty();
            }
        }
        Ok(())
    }
}
