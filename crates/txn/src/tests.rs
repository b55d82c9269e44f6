use super::*;
use common::DbError;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::time::Duration;

fn manager() -> TransactionManager {
    TransactionManager::new(Duration::from_millis(100))
}

#[test]
fn ids_are_monotonic() {
    let mgr = manager();
    let a = mgr.begin(TransactionMode::ReadOnly);
    let b = mgr.begin(TransactionMode::ReadWrite);
    assert!(b.id() > a.id());
}

#[test]
fn status_walks_the_state_machine() {
    let mgr = manager();
    let tx = mgr.begin(TransactionMode::ReadWrite);
    assert_eq!(tx.status(), TransactionStatus::Clean);

    tx.mark_read().unwrap();
    assert_eq!(tx.status(), TransactionStatus::Read);
    tx.mark_dirty().unwrap();
    assert_eq!(tx.status(), TransactionStatus::Dirty);
    tx.commit().unwrap();
    assert_eq!(tx.status(), TransactionStatus::Closed);
}

#[test]
fn read_only_transactions_refuse_writes() {
    let mgr = manager();
    let tx = mgr.begin(TransactionMode::ReadOnly);
    tx.mark_read().unwrap();
    assert!(matches!(
        tx.mark_dirty(),
        Err(DbError::TransactionReadOnly(_))
    ));
}

#[test]
fn commit_runs_queued_actions_in_order() {
    let mgr = manager();
    let tx = mgr.begin(TransactionMode::ReadWrite);
    let counter = std::sync::Arc::new(AtomicUsize::new(0));

    for expected in 0..3 {
        let counter = std::sync::Arc::clone(&counter);
        tx.on_commit(Box::new(move || {
            assert_eq!(counter.fetch_add(1, AtomicOrdering::SeqCst), expected);
            Ok(())
        }));
    }
    let rolled = std::sync::Arc::new(AtomicUsize::new(0));
    {
        let rolled = std::sync::Arc::clone(&rolled);
        tx.on_rollback(Box::new(move || {
            rolled.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }));
    }

    tx.commit().unwrap();
    assert_eq!(counter.load(AtomicOrdering::SeqCst), 3);
    // Rollback queue was cleared, not run.
    assert_eq!(rolled.load(AtomicOrdering::SeqCst), 0);
}

#[test]
fn rollback_runs_reversing_actions_in_reverse_order() {
    let mgr = manager();
    let tx = mgr.begin(TransactionMode::ReadWrite);
    let order = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));

    for tag in ["first", "second"] {
        let order = std::sync::Arc::clone(&order);
        tx.on_rollback(Box::new(move || {
            order.lock().push(tag);
            Ok(())
        }));
    }
    tx.rollback().unwrap();
    assert_eq!(*order.lock(), vec!["second", "first"]);
    assert_eq!(tx.status(), TransactionStatus::Closed);
}

#[test]
fn failing_commit_action_poisons_the_transaction() {
    let mgr = manager();
    let tx = mgr.begin(TransactionMode::ReadWrite);
    tx.on_commit(Box::new(|| {
        Err(DbError::TxValidation("boom".into()))
    }));

    assert!(tx.commit().is_err());
    assert_eq!(tx.status(), TransactionStatus::Error);
    // The only way out of ERROR is rollback.
    assert!(matches!(tx.check_open(), Err(DbError::TransactionInError(_))));
    tx.rollback().unwrap();
    assert_eq!(tx.status(), TransactionStatus::Closed);
}

#[test]
fn cancellation_is_observed_and_fatal() {
    let mgr = manager();
    let tx = mgr.begin(TransactionMode::ReadWrite);
    tx.cancel();
    assert!(matches!(tx.check_open(), Err(DbError::Cancelled(_))));
    assert_eq!(tx.status(), TransactionStatus::Error);
    assert!(tx.commit().is_err());
    tx.rollback().unwrap();
}

#[test]
fn closed_transaction_rejects_everything() {
    let mgr = manager();
    let tx = mgr.begin(TransactionMode::ReadWrite);
    tx.commit().unwrap();
    assert!(matches!(tx.check_open(), Err(DbError::TransactionClosed(_))));
    assert!(tx.commit().is_err());
    assert!(tx.rollback().is_err());
}

#[test]
fn shared_locks_coexist_exclusive_does_not() {
    let mgr = manager();
    let locks = mgr.locks();
    let a = mgr.begin(TransactionMode::ReadWrite);
    let b = mgr.begin(TransactionMode::ReadWrite);

    locks.request_lock(a.id(), "warren.s.e", LockMode::Shared).unwrap();
    locks.request_lock(b.id(), "warren.s.e", LockMode::Shared).unwrap();
    assert_eq!(locks.holds(a.id(), "warren.s.e"), Some(LockMode::Shared));

    // Exclusive blocked by the other sharer until it releases.
    let err = locks.request_lock(a.id(), "warren.s.e", LockMode::Exclusive);
    assert!(matches!(err, Err(DbError::Timeout(_))));

    locks.release_all(b.id());
    locks
        .request_lock(a.id(), "warren.s.e", LockMode::Exclusive)
        .unwrap();
    assert_eq!(locks.holds(a.id(), "warren.s.e"), Some(LockMode::Exclusive));
}

#[test]
fn lock_requests_are_reentrant() {
    let mgr = manager();
    let locks = mgr.locks();
    let tx = mgr.begin(TransactionMode::ReadWrite);

    locks.request_lock(tx.id(), "warren.s", LockMode::Exclusive).unwrap();
    locks.request_lock(tx.id(), "warren.s", LockMode::Exclusive).unwrap();
    locks.request_lock(tx.id(), "warren.s", LockMode::Shared).unwrap();
    assert_eq!(locks.holds(tx.id(), "warren.s"), Some(LockMode::Exclusive));
}

#[test]
fn commit_releases_locks() {
    let mgr = manager();
    let locks = std::sync::Arc::clone(mgr.locks());
    let a = mgr.begin(TransactionMode::ReadWrite);
    locks.request_lock(a.id(), "warren.s.e", LockMode::Exclusive).unwrap();
    a.commit().unwrap();

    let b = mgr.begin(TransactionMode::ReadWrite);
    locks.request_lock(b.id(), "warren.s.e", LockMode::Exclusive).unwrap();
}

#[test]
fn cancellation_interrupts_a_lock_wait() {
    let mgr = TransactionManager::new(Duration::from_secs(5));
    let holder = mgr.begin(TransactionMode::ReadWrite);
    holder.request_lock("warren.s.e", LockMode::Exclusive).unwrap();

    let waiter = mgr.begin(TransactionMode::ReadWrite);
    let in_thread = std::sync::Arc::clone(&waiter);
    let join = std::thread::spawn(move || in_thread.request_lock("warren.s.e", LockMode::Exclusive));

    std::thread::sleep(Duration::from_millis(50));
    waiter.cancel();
    let result = join.join().unwrap();
    assert!(matches!(result, Err(DbError::Cancelled(_))));

    holder.commit().unwrap();
    waiter.rollback().unwrap();
}

#[test]
fn close_lock_blocks_teardown_while_held() {
    let lock = CloseLock::new();
    let guard = lock.acquire("warren.s.e").unwrap();

    let err = lock.close("warren.s.e", Duration::from_millis(50));
    assert!(matches!(err, Err(DbError::Timeout(_))));

    drop(guard);
    lock.close("warren.s.e", Duration::from_millis(50)).unwrap();
    assert!(matches!(
        lock.acquire("warren.s.e"),
        Err(DbError::TransactionDboClosed(_))
    ));
}
