//! Column files: one page file per column, in two layouts.
//!
//! *Fixed* columns store every tuple in the same number of bytes, so a
//! tuple's location is pure arithmetic over the entry size. *Variable*
//! columns (strings) route through a chain of directory pages that map
//! each tuple id to a packed `(page, slot)` address inside a slotted data
//! page.
//!
//! Both layouts share the file header (page 1, owned by the disk manager)
//! and a column header page (page 2) holding the type descriptor and the
//! tuple counters. Counters are written back only on commit, so after a
//! crash the file recovers to its last committed state and any
//! uncommitted tail becomes unreachable.

#[cfg(test)]
mod tests;

mod cursor;
mod fixed;
mod layout;
mod variable;

pub use cursor::HareCursor;
pub use fixed::FixedColumnFile;
pub use variable::VariableColumnFile;

use common::{DbResult, TupleId};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use types::{Type, Value};

/// Storage layout of a column, recorded in the entity catalogue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnDriver {
    Fixed,
    Variable,
}

impl ColumnDriver {
    /// The natural driver for a type: everything with a fixed physical
    /// size goes to the fixed layout.
    pub fn for_type(ty: &Type) -> ColumnDriver {
        if ty.physical_size().is_some() {
            ColumnDriver::Fixed
        } else {
            ColumnDriver::Variable
        }
    }
}

/// Declaration of a column: simple name, type, and nullability.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub ty: Type,
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, ty: Type) -> ColumnDef {
        ColumnDef {
            name: name.into().to_lowercase(),
            ty,
            nullable: false,
        }
    }

    pub fn nullable(mut self) -> ColumnDef {
        self.nullable = true;
        self
    }

    /// Check a value against this column's type and nullability.
    pub fn check_value(&self, value: &Value) -> DbResult<()> {
        if value.is_null() {
            if !self.nullable {
                return Err(common::DbError::TxValidation(format!(
                    "column '{}' is not nullable",
                    self.name
                )));
            }
            return Ok(());
        }
        if !self.ty.accepts(value) {
            return Err(common::DbError::TxValidation(format!(
                "value of type {:?} does not fit column '{}' ({})",
                value.type_of(),
                self.name,
                self.ty
            )));
        }
        Ok(())
    }
}

/// Tuple counters of a column file, mirrored on the column header page at
/// commit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ColumnMeta {
    /// Live (non-deleted) tuples.
    pub count: u64,
    /// Logically deleted tuples.
    pub deleted: u64,
    /// Next tuple id to assign; also the exclusive scan bound.
    pub max_tid: u64,
}

/// A column file of either layout, behind one dispatching surface.
pub enum ColumnStore {
    Fixed(FixedColumnFile),
    Variable(VariableColumnFile),
}

impl ColumnStore {
    /// Create a new column file at `path` using the natural driver for the
    /// column's type.
    pub fn create(path: &Path, def: ColumnDef, config: &common::Config) -> DbResult<ColumnStore> {
        match ColumnDriver::for_type(&def.ty) {
            ColumnDriver::Fixed => Ok(ColumnStore::Fixed(FixedColumnFile::create(
                path, def, config,
            )?)),
            ColumnDriver::Variable => Ok(ColumnStore::Variable(VariableColumnFile::create(
                path, def, config,
            )?)),
        }
    }

    /// Open an existing column file and verify it matches `def`.
    pub fn open(path: &Path, def: ColumnDef, config: &common::Config) -> DbResult<ColumnStore> {
        match ColumnDriver::for_type(&def.ty) {
            ColumnDriver::Fixed => Ok(ColumnStore::Fixed(FixedColumnFile::open(
                path, def, config,
            )?)),
            ColumnDriver::Variable => Ok(ColumnStore::Variable(VariableColumnFile::open(
                path, def, config,
            )?)),
        }
    }

    pub fn def(&self) -> &ColumnDef {
        match self {
            ColumnStore::Fixed(f) => f.def(),
            ColumnStore::Variable(v) => v.def(),
        }
    }

    pub fn driver(&self) -> ColumnDriver {
        match self {
            ColumnStore::Fixed(_) => ColumnDriver::Fixed,
            ColumnStore::Variable(_) => ColumnDriver::Variable,
        }
    }

    pub fn meta(&self) -> ColumnMeta {
        match self {
            ColumnStore::Fixed(f) => f.meta(),
            ColumnStore::Variable(v) => v.meta(),
        }
    }

    /// Append a value, assigning the next tuple id.
    pub fn append(&self, value: &Value) -> DbResult<TupleId> {
        match self {
            ColumnStore::Fixed(f) => f.append(value),
            ColumnStore::Variable(v) => v.append(value),
        }
    }

    /// Read a tuple; `None` if it is deleted.
    pub fn read(&self, tid: TupleId) -> DbResult<Option<Value>> {
        match self {
            ColumnStore::Fixed(f) => f.read(tid),
            ColumnStore::Variable(v) => v.read(tid),
        }
    }

    pub fn update(&self, tid: TupleId, value: &Value) -> DbResult<()> {
        match self {
            ColumnStore::Fixed(f) => f.update(tid, value),
            ColumnStore::Variable(v) => v.update(tid, value),
        }
    }

    pub fn delete(&self, tid: TupleId) -> DbResult<()> {
        match self {
            ColumnStore::Fixed(f) => f.delete(tid),
            ColumnStore::Variable(v) => v.delete(tid),
        }
    }

    pub fn is_deleted(&self, tid: TupleId) -> DbResult<bool> {
        match self {
            ColumnStore::Fixed(f) => f.is_deleted(tid),
            ColumnStore::Variable(v) => v.is_deleted(tid),
        }
    }

    /// Sequential cursor over non-deleted tuple ids in `range` (half-open),
    /// defaulting to the whole column. Cursors are single-threaded and
    /// release nothing on drop beyond their own state.
    pub fn cursor(self: &Arc<Self>, range: Option<(u64, u64)>) -> HareCursor {
        let meta = self.meta();
        let (start, end) = match range {
            Some((s, e)) => (s, e.min(meta.max_tid)),
            None => (0, meta.max_tid),
        };
        HareCursor::new(Arc::clone(self), start, end)
    }

    /// Read handle, typically paired with a cursor.
    pub fn reader(self: &Arc<Self>) -> ColumnReader {
        ColumnReader {
            store: Arc::clone(self),
        }
    }

    /// Write handle for appends and in-place mutations.
    pub fn writer(self: &Arc<Self>) -> ColumnWriter {
        ColumnWriter {
            store: Arc::clone(self),
        }
    }

    /// Persist counters and page content durably.
    pub fn commit(&self) -> DbResult<()> {
        match self {
            ColumnStore::Fixed(f) => f.commit(),
            ColumnStore::Variable(v) => v.commit(),
        }
    }

    /// Revert counters (and buffered pages) to the last commit.
    pub fn rollback(&self) -> DbResult<()> {
        match self {
            ColumnStore::Fixed(f) => f.rollback(),
            ColumnStore::Variable(v) => v.rollback(),
        }
    }

    pub fn close(&self) -> DbResult<()> {
        match self {
            ColumnStore::Fixed(f) => f.close(),
            ColumnStore::Variable(v) => v.close(),
        }
    }

    /// The disk manager backing this column, for checksum validation.
    pub fn disk(&self) -> &Arc<dyn storage::DiskManager> {
        match self {
            ColumnStore::Fixed(f) => f.disk(),
            ColumnStore::Variable(v) => v.disk(),
        }
    }
}

/// Value access for the tuple ids a cursor produces.
pub struct ColumnReader {
    store: Arc<ColumnStore>,
}

impl ColumnReader {
    /// The value of a tuple; `None` if it is deleted.
    pub fn get(&self, tid: TupleId) -> DbResult<Option<Value>> {
        self.store.read(tid)
    }

    pub fn is_deleted(&self, tid: TupleId) -> DbResult<bool> {
        self.store.is_deleted(tid)
    }
}

/// Mutation handle over one column file.
pub struct ColumnWriter {
    store: Arc<ColumnStore>,
}

impl ColumnWriter {
    pub fn append(&self, value: &Value) -> DbResult<TupleId> {
        self.store.append(value)
    }

    pub fn update(&self, tid: TupleId, value: &Value) -> DbResult<()> {
        self.store.update(tid, value)
    }

    pub fn delete(&self, tid: TupleId) -> DbResult<()> {
        self.store.delete(tid)
    }
}
