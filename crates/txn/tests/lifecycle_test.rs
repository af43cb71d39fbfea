//! Integration tests for the transaction lifecycle over a shared keyspace

use basalt_common::{SiError, Timestamp};
use basalt_store::{FjallRowStore, StoreConfig};
use basalt_txn::{LifecycleAction, LifecycleManager, TimestampOracle, TxnInfo, TxnStatus, TxnStore};
use std::path::Path;
use std::sync::Arc;

fn open_manager(dir: &Path) -> (LifecycleManager, FjallRowStore) {
    let config = StoreConfig::new(dir.to_path_buf());
    let row_store = FjallRowStore::open(&config).unwrap();

    let store = Arc::new(TxnStore::open(row_store.keyspace().clone(), config.txn_buckets).unwrap());
    let oracle = Arc::new(TimestampOracle::open(row_store.keyspace().clone()).unwrap());

    (LifecycleManager::new(store, oracle), row_store)
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[test]
fn test_full_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _row_store) = open_manager(dir.path());

    let txn_id = manager.begin(TxnInfo::default()).unwrap();
    assert_eq!(manager.get_txn(txn_id).unwrap().status, TxnStatus::Active);

    manager.elevate(txn_id, b"orders/").unwrap();
    assert!(manager.keep_alive(txn_id).unwrap());

    let outcome = manager
        .lifecycle_action(txn_id, LifecycleAction::Commit)
        .unwrap();
    assert_eq!(outcome.status, TxnStatus::Committed);

    let record = manager.get_txn(txn_id).unwrap();
    assert!(record.writable);
    assert_eq!(record.commit_ts, outcome.commit_ts);
    assert!(record.commit_ts.unwrap() > txn_id);
}

#[test]
fn test_active_enumeration_sorted_and_deduplicated() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _row_store) = open_manager(dir.path());

    let mut begun = Vec::new();
    for _ in 0..6 {
        begun.push(manager.begin(TxnInfo::default()).unwrap());
    }

    manager
        .lifecycle_action(begun[1], LifecycleAction::Commit)
        .unwrap();
    manager
        .lifecycle_action(begun[4], LifecycleAction::Rollback)
        .unwrap();

    let ids = manager
        .get_active_txn_ids(Timestamp::ZERO, Timestamp::MAX)
        .unwrap();

    // Sorted ascending, each id exactly once, finished ones absent
    let expected = vec![begun[0], begun[2], begun[3], begun[5]];
    assert_eq!(ids, expected);

    // A window excludes ids outside it
    let window = manager.get_active_txn_ids(begun[2], begun[3]).unwrap();
    assert_eq!(window, vec![begun[2], begun[3]]);
}

#[test]
fn test_ids_stay_monotone_across_restart() {
    let dir = tempfile::tempdir().unwrap();

    let highest = {
        let (manager, _row_store) = open_manager(dir.path());
        let mut highest = Timestamp::ZERO;
        for _ in 0..5 {
            highest = manager.begin(TxnInfo::default()).unwrap();
        }
        let outcome = manager
            .lifecycle_action(highest, LifecycleAction::Commit)
            .unwrap();
        outcome.commit_ts.unwrap()
    };

    let (manager, _row_store) = open_manager(dir.path());
    let after_restart = manager.begin(TxnInfo::default()).unwrap();

    assert!(after_restart > highest);
}

#[test]
fn test_records_survive_restart() {
    let dir = tempfile::tempdir().unwrap();

    let (committed, active) = {
        let (manager, _row_store) = open_manager(dir.path());
        let committed = manager.begin(TxnInfo::default()).unwrap();
        let active = manager.begin(TxnInfo::default()).unwrap();
        manager
            .lifecycle_action(committed, LifecycleAction::Commit)
            .unwrap();
        (committed, active)
    };

    let (manager, _row_store) = open_manager(dir.path());

    assert_eq!(
        manager.get_txn(committed).unwrap().status,
        TxnStatus::Committed
    );
    assert_eq!(manager.get_txn(active).unwrap().status, TxnStatus::Active);
    assert!(matches!(
        manager.get_txn(Timestamp::new(u64::MAX - 1)),
        Err(SiError::TransactionNotFound(_))
    ));
}

// ============================================================================
// Watermark and Reaper Tests
// ============================================================================

#[test]
fn test_stale_transaction_pins_watermark_until_reaped() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _row_store) = open_manager(dir.path());

    let stale = manager.begin(TxnInfo::default()).unwrap();

    // Churn some other transactions through
    for _ in 0..3 {
        let txn_id = manager.begin(TxnInfo::default()).unwrap();
        manager
            .lifecycle_action(txn_id, LifecycleAction::Commit)
            .unwrap();
    }

    assert_eq!(manager.oldest_active_ts().unwrap(), stale);

    let reaped = manager.reap_stale(0).unwrap();
    assert_eq!(reaped, vec![stale]);
    assert_eq!(manager.get_txn(stale).unwrap().status, TxnStatus::RolledBack);

    assert!(manager.oldest_active_ts().unwrap() > stale);
}
