//! Secondary indexes over entity columns.
//!
//! Three families: [`UniqueHashIndex`] answers `=`/`IN` point probes,
//! [`InvertedTextIndex`] answers `=`/`LIKE`/`MATCH` over strings and
//! yields a score column, and [`VafIndex`] prunes kNN scans with
//! vector-approximation signatures (VA-SSA).
//!
//! Every index is incrementally updatable: writing entity transactions
//! dispatch each [`DataChangeEvent`] to the index before the entity commit
//! returns, and the index buffers the change until its own `commit`.
//! Indexes advertise what they can answer via `can_process`/`cost`; a
//! `dirty` index (never built, or invalidated by a failed update) is
//! excluded from planning until rebuilt.


mod hash;
mod text;
mod vaf;

pub use hash::UniqueHashIndex;
pub use text::InvertedTextIndex;
pub use vaf::VafIndex;

use common::{
    BooleanPredicate, ColumnName, Cost, DataChangeEvent, DbResult, IndexName, KnnPredicate,
    TupleId,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use types::Value;

/// Index family discriminant, persisted in the entity catalogue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    UniqueHash,
    InvertedText,
    VaFile,
}

/// One index hit: the tuple id, an optional score (text indexes), and the
/// probed key (hash indexes), forming a standalone record without touching
/// the entity columns.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexMatch {
    pub tid: TupleId,
    pub score: Option<f64>,
    pub key: Option<Value>,
}

/// Common surface of all index families.
pub trait Index: Send + Sync {
    fn name(&self) -> &IndexName;
    fn kind(&self) -> IndexKind;
    fn column(&self) -> &ColumnName;

    /// All built-in families consume change events incrementally.
    fn supports_incremental_update(&self) -> bool {
        true
    }

    /// Dirty indexes must be rebuilt before they participate in plans.
    fn is_dirty(&self) -> bool;

    fn mark_dirty(&self);

    /// Can this index answer the Boolean predicate entirely on its own?
    fn can_process(&self, predicate: &BooleanPredicate) -> bool;

    /// Estimated cost of answering via this index. `Cost::INVALID` when
    /// `can_process` is false or the index is dirty.
    fn cost(&self, predicate: &BooleanPredicate) -> Cost;

    /// Answer the predicate, emitting matches in index order.
    fn filter(&self, predicate: &BooleanPredicate) -> DbResult<Vec<IndexMatch>>;

    /// Range-restricted variant; the default filters the full answer.
    fn filter_range(
        &self,
        predicate: &BooleanPredicate,
        range: (u64, u64),
    ) -> DbResult<Vec<IndexMatch>> {
        let mut matches = self.filter(predicate)?;
        matches.retain(|m| m.tid.0 >= range.0 && m.tid.0 < range.1);
        Ok(matches)
    }

    /// kNN support (vector-approximation indexes only).
    fn can_process_knn(&self, _knn: &KnnPredicate) -> bool {
        false
    }

    fn knn_cost(&self, _knn: &KnnPredicate) -> Cost {
        Cost::INVALID
    }

    /// Candidate tuple ids per query vector, pruned but unordered by exact
    /// distance; the caller computes exact distances.
    fn knn_candidates(&self, knn: &KnnPredicate) -> DbResult<Vec<Vec<TupleId>>> {
        let _ = knn;
        Err(common::DbError::PredicateNotSupportedByIndex(
            self.name().to_string(),
        ))
    }

    /// Rebuild from a full scan of the indexed column. Clears the dirty
    /// flag on success.
    fn rebuild(
        &self,
        source: &mut dyn Iterator<Item = DbResult<(TupleId, Value)>>,
    ) -> DbResult<()>;

    /// Consume one change event. Buffered until `commit`; `rollback`
    /// discards the buffer.
    fn update(&self, event: &DataChangeEvent) -> DbResult<()>;

    fn commit(&self) -> DbResult<()>;

    fn rollback(&self) -> DbResult<()>;
}

/// Create a fresh index of the given kind inside `dir`.
pub fn create_index(
    kind: IndexKind,
    dir: &Path,
    name: IndexName,
    column: ColumnName,
) -> DbResult<Arc<dyn Index>> {
    std::fs::create_dir_all(dir)?;
    Ok(match kind {
        IndexKind::UniqueHash => Arc::new(UniqueHashIndex::create(dir, name, column)?),
        IndexKind::InvertedText => Arc::new(InvertedTextIndex::create(dir, name, column)?),
        IndexKind::VaFile => Arc::new(VafIndex::create(dir, name, column)?),
    })
}

/// Open an index previously created inside `dir`. An unreadable data file
/// yields a dirty index that plans around itself until rebuilt.
pub fn open_index(
    kind: IndexKind,
    dir: &Path,
    name: IndexName,
    column: ColumnName,
) -> DbResult<Arc<dyn Index>> {
    Ok(match kind {
        IndexKind::UniqueHash => Arc::new(UniqueHashIndex::open(dir, name, column)?),
        IndexKind::InvertedText => Arc::new(InvertedTextIndex::open(dir, name, column)?),
        IndexKind::VaFile => Arc::new(VafIndex::open(dir, name, column)?),
    })
}

pub(crate) fn data_file(dir: &Path) -> std::path::PathBuf {
    dir.join("data.idx")
}
