//! Close locks: every database object holds one, and transactional views
//! keep a guard for their lifetime so teardown cannot pull the object out
//! from under them.

use common::{DbError, DbResult};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct CloseState {
    holders: usize,
    closed: bool,
}

pub struct CloseLock {
    state: Mutex<CloseState>,
    released: Condvar,
}

impl CloseLock {
    pub fn new() -> Arc<CloseLock> {
        Arc::new(CloseLock {
            state: Mutex::new(CloseState {
                holders: 0,
                closed: false,
            }),
            released: Condvar::new(),
        })
    }

    /// Take a hold on the object; fails once the object is closed. `name`
    /// is the object's qualified name, used in the error.
    pub fn acquire(self: &Arc<CloseLock>, name: &str) -> DbResult<CloseGuard> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(DbError::TransactionDboClosed(name.to_string()));
        }
        state.holders += 1;
        Ok(CloseGuard {
            lock: Arc::clone(self),
        })
    }

    /// Block teardown until every holder is gone, then mark closed. Times
    /// out after `timeout`.
    pub fn close(&self, name: &str, timeout: Duration) -> DbResult<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.holders > 0 {
            if self.released.wait_until(&mut state, deadline).timed_out() {
                return Err(DbError::Timeout(format!(
                    "'{name}' still in use by {} transaction(s)",
                    state.holders
                )));
            }
        }
        state.closed = true;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// Hold on a database object; released on drop.
pub struct CloseGuard {
    lock: Arc<CloseLock>,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock();
        state.holders -= 1;
        if state.holders == 0 {
            self.lock.released.notify_all();
        }
    }
}
