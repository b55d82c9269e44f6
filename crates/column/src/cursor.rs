//! Sequential tuple-id cursor over a column file.

use crate::ColumnStore;
use common::{DbResult, TupleId};
use std::sync::Arc;

/// Iterates the non-deleted tuple ids of a column in `[start, end)`.
/// Single-threaded; holds no latches between calls, so a cursor sees
/// writes its own transaction makes while iterating. State is released on
/// drop.
pub struct HareCursor {
    store: Arc<ColumnStore>,
    next: u64,
    end: u64,
}

impl HareCursor {
    pub(crate) fn new(store: Arc<ColumnStore>, start: u64, end: u64) -> HareCursor {
        HareCursor { store, next: start, end }
    }

    /// Advance to the next live tuple, or `None` at the end of the range.
    pub fn next(&mut self) -> DbResult<Option<TupleId>> {
        while self.next < self.end {
            let tid = TupleId(self.next);
            self.next += 1;
            if !self.store.is_deleted(tid)? {
                return Ok(Some(tid));
            }
        }
        Ok(None)
    }

    /// Upper bound on tuples left, ignoring deletions.
    pub fn remaining(&self) -> u64 {
        self.end.saturating_sub(self.next)
    }
}
