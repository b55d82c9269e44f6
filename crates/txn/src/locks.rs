//! Logical shared/exclusive locks on database objects, keyed by their
//! fully-qualified name. Waits are deadline-based; expiry surfaces as
//! `Timeout`, recoverable by outer retry.

use common::{DbError, DbResult, TransactionId};
use hashbrown::{HashMap, HashSet};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Default)]
struct LockEntry {
    shared: HashSet<TransactionId>,
    exclusive: Option<TransactionId>,
}

impl LockEntry {
    fn is_free(&self) -> bool {
        self.shared.is_empty() && self.exclusive.is_none()
    }
}

pub struct LockManager {
    state: Mutex<HashMap<String, LockEntry>>,
    released: Condvar,
    timeout: Duration,
}

impl LockManager {
    pub fn new(timeout: Duration) -> LockManager {
        LockManager {
            state: Mutex::new(HashMap::new()),
            released: Condvar::new(),
            timeout,
        }
    }

    /// Acquire (or upgrade to) `mode` on the object named `key`.
    /// Re-entrant for locks the transaction already holds; a shared holder
    /// upgrades to exclusive once it is the only sharer. Blocks until the
    /// configured deadline.
    pub fn request_lock(&self, tx: TransactionId, key: &str, mode: LockMode) -> DbResult<()> {
        self.request_lock_with(tx, key, mode, &|| None)
    }

    /// Like [`LockManager::request_lock`], probing `should_abort` on every
    /// wakeup so cancellation interrupts the wait.
    pub fn request_lock_with(
        &self,
        tx: TransactionId,
        key: &str,
        mode: LockMode,
        should_abort: &dyn Fn() -> Option<DbError>,
    ) -> DbResult<()> {
        let deadline = Instant::now() + self.timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(e) = should_abort() {
                return Err(e);
            }
            let entry = state.entry(key.to_string()).or_default();
            let granted = match mode {
                LockMode::Shared => {
                    if entry.exclusive.is_none() || entry.exclusive == Some(tx) {
                        entry.shared.insert(tx);
                        true
                    } else {
                        false
                    }
                }
                LockMode::Exclusive => {
                    let only_self_shares =
                        entry.shared.is_empty() || (entry.shared.len() == 1 && entry.shared.contains(&tx));
                    if (entry.exclusive.is_none() || entry.exclusive == Some(tx))
                        && only_self_shares
                    {
                        entry.exclusive = Some(tx);
                        true
                    } else {
                        false
                    }
                }
            };
            if granted {
                return Ok(());
            }
            if self.released.wait_until(&mut state, deadline).timed_out() {
                return Err(DbError::Timeout(format!(
                    "{tx} could not lock '{key}' ({mode:?}) within {:?}",
                    self.timeout
                )));
            }
        }
    }

    /// The mode `tx` currently holds on `key`, if any.
    pub fn holds(&self, tx: TransactionId, key: &str) -> Option<LockMode> {
        let state = self.state.lock();
        let entry = state.get(key)?;
        if entry.exclusive == Some(tx) {
            Some(LockMode::Exclusive)
        } else if entry.shared.contains(&tx) {
            Some(LockMode::Shared)
        } else {
            None
        }
    }

    /// Wake every waiter (used when a transaction is cancelled so its
    /// pending waits can observe the flag).
    pub fn wake_all(&self) {
        let _state = self.state.lock();
        self.released.notify_all();
    }

    /// Release every lock held by `tx` and wake waiters.
    pub fn release_all(&self, tx: TransactionId) {
        let mut state = self.state.lock();
        state.retain(|_, entry| {
            entry.shared.remove(&tx);
            if entry.exclusive == Some(tx) {
                entry.exclusive = None;
            }
            !entry.is_free()
        });
        self.released.notify_all();
    }
}
