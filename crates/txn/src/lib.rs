//! Transaction management: monotonic ids, the status state machine,
//! post-commit/post-rollback action queues, logical DBO locks, and the
//! close locks that keep database objects alive while transactions use
//! them.
//!
//! The status machine:
//!
//! ```text
//! CLEAN → READ → DIRTY → COMMIT → CLOSED
//!    ↘                 ↘ ERROR ↗
//!      ↘ ROLLBACK ──────────────↗
//! ```
//!
//! Structural and data operations register paired actions: the forward
//! effect happens immediately, a post-commit action makes it durable, and
//! a post-rollback action reverses it. `commit` runs the post-commit
//! queue and clears both; `rollback` runs the post-rollback queue and
//! clears both, so a partially failed mutation always resolves to a
//! consistent state.

#[cfg(test)]
mod tests;

mod close;
mod locks;

pub use close::{CloseGuard, CloseLock};
pub use locks::{LockManager, LockMode};

use common::{DbError, DbResult, TransactionId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionStatus {
    Clean,
    Read,
    Dirty,
    Commit,
    Rollback,
    Error,
    Closed,
}

/// Deferred effect queued on a transaction.
pub type TxAction = Box<dyn FnOnce() -> DbResult<()> + Send>;

/// Hands out transaction contexts with monotonically increasing ids and
/// owns the process-wide lock manager.
pub struct TransactionManager {
    next: AtomicU64,
    locks: Arc<LockManager>,
}

impl TransactionManager {
    pub fn new(lock_timeout: Duration) -> TransactionManager {
        TransactionManager {
            next: AtomicU64::new(1),
            locks: Arc::new(LockManager::new(lock_timeout)),
        }
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn begin(&self, mode: TransactionMode) -> Arc<TransactionContext> {
        let id = TransactionId(self.next.fetch_add(1, Ordering::SeqCst));
        debug!(%id, ?mode, "transaction started");
        Arc::new(TransactionContext {
            id,
            mode,
            status: Mutex::new(TransactionStatus::Clean),
            cancelled: AtomicBool::new(false),
            post_commit: Mutex::new(Vec::new()),
            post_rollback: Mutex::new(Vec::new()),
            locks: Arc::clone(&self.locks),
        })
    }
}

/// Per-transaction state shared by every transactional view opened under
/// it.
pub struct TransactionContext {
    id: TransactionId,
    mode: TransactionMode,
    status: Mutex<TransactionStatus>,
    cancelled: AtomicBool,
    post_commit: Mutex<Vec<TxAction>>,
    post_rollback: Mutex<Vec<TxAction>>,
    locks: Arc<LockManager>,
}

impl TransactionContext {
    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    pub fn status(&self) -> TransactionStatus {
        *self.status.lock()
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Checked at every operator boundary and lock wait. Cancellation
    /// poisons the transaction.
    pub fn check_open(&self) -> DbResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            *self.status.lock() = TransactionStatus::Error;
            return Err(DbError::Cancelled(self.id));
        }
        match *self.status.lock() {
            TransactionStatus::Error => Err(DbError::TransactionInError(self.id)),
            TransactionStatus::Commit
            | TransactionStatus::Rollback
            | TransactionStatus::Closed => Err(DbError::TransactionClosed(self.id)),
            _ => Ok(()),
        }
    }

    /// Record the first read: `CLEAN → READ`.
    pub fn mark_read(&self) -> DbResult<()> {
        self.check_open()?;
        let mut status = self.status.lock();
        if *status == TransactionStatus::Clean {
            *status = TransactionStatus::Read;
        }
        Ok(())
    }

    /// Record the first write: `CLEAN/READ → DIRTY`. Read-only
    /// transactions refuse.
    pub fn mark_dirty(&self) -> DbResult<()> {
        self.check_open()?;
        if self.mode == TransactionMode::ReadOnly {
            return Err(DbError::TransactionReadOnly(self.id));
        }
        let mut status = self.status.lock();
        if matches!(*status, TransactionStatus::Clean | TransactionStatus::Read) {
            *status = TransactionStatus::Dirty;
        }
        Ok(())
    }

    /// Unrecoverable storage error: the transaction can only roll back.
    pub fn mark_error(&self) {
        let mut status = self.status.lock();
        if *status != TransactionStatus::Closed {
            *status = TransactionStatus::Error;
        }
    }

    /// External cancellation; observed at the next `check_open` and by
    /// any lock wait in flight.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.locks.wake_all();
    }

    /// Acquire a logical DBO lock on behalf of this transaction. The wait
    /// honours both the configured deadline and cancellation.
    pub fn request_lock(&self, key: &str, mode: LockMode) -> DbResult<()> {
        self.locks.request_lock_with(self.id, key, mode, &|| {
            if self.cancelled.load(Ordering::SeqCst) {
                Some(DbError::Cancelled(self.id))
            } else {
                None
            }
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Queue an action to run when this transaction commits.
    pub fn on_commit(&self, action: TxAction) {
        self.post_commit.lock().push(action);
    }

    /// Queue an action to run when this transaction rolls back.
    pub fn on_rollback(&self, action: TxAction) {
        self.post_rollback.lock().push(action);
    }

    /// Run the post-commit queue, clear both queues, release all logical
    /// locks, and close. A failing action poisons the transaction and
    /// leaves the rollback queue intact for the mandatory rollback.
    pub fn commit(&self) -> DbResult<()> {
        {
            let status = self.status.lock();
            match *status {
                TransactionStatus::Error => return Err(DbError::TransactionInError(self.id)),
                TransactionStatus::Commit
                | TransactionStatus::Rollback
                | TransactionStatus::Closed => {
                    return Err(DbError::TransactionClosed(self.id));
                }
                _ => {}
            }
        }
        if self.cancelled.load(Ordering::SeqCst) {
            self.mark_error();
            return Err(DbError::Cancelled(self.id));
        }
        *self.status.lock() = TransactionStatus::Commit;

        let actions: Vec<TxAction> = std::mem::take(&mut *self.post_commit.lock());
        for action in actions {
            if let Err(e) = action() {
                self.mark_error();
                return Err(e);
            }
        }
        self.post_rollback.lock().clear();
        self.locks.release_all(self.id);
        *self.status.lock() = TransactionStatus::Closed;
        debug!(id = %self.id, "transaction committed");
        Ok(())
    }

    /// Run the post-rollback queue, clear both queues, release all logical
    /// locks, and close. All actions run even if some fail; the first
    /// failure is reported.
    pub fn rollback(&self) -> DbResult<()> {
        {
            let mut status = self.status.lock();
            if *status == TransactionStatus::Closed {
                return Err(DbError::TransactionClosed(self.id));
            }
            *status = TransactionStatus::Rollback;
        }

        let actions: Vec<TxAction> = std::mem::take(&mut *self.post_rollback.lock());
        let mut first_error = None;
        for action in actions.into_iter().rev() {
            if let Err(e) = action() {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        self.post_commit.lock().clear();
        self.locks.release_all(self.id);
        *self.status.lock() = TransactionStatus::Closed;
        debug!(id = %self.id, "transaction rolled back");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for TransactionContext {
    /// A transaction abandoned without commit rolls back, releasing its
    /// locks and undoing its forward effects.
    fn drop(&mut self) {
        if *self.status.lock() != TransactionStatus::Closed {
            let _ = self.rollback();
        }
    }
}
