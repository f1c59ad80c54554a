//! Transaction engine integration tests: local commit/rollback semantics,
//! the distributed-transaction verb surface, and failure handling.

mod common;

use common::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use amphora::{
    audit, BranchState, ConsumerId, DtxError, MessageHandle, QueueEntryHandle, SessionConfig,
    StoreError, TxnError, TxnKind, Xid,
};

fn xid(tag: u8) -> Xid {
    Xid::new(1, vec![0x51, tag], vec![0x01])
}

#[test]
fn local_commit_fires_all_hooks_in_order() {
    let mut fx = session_fixture("local-commit");
    let destination = TestDestination::new("orders");

    fx.session.select_tx().unwrap();
    assert_eq!(fx.session.transaction_kind(), TxnKind::Local);
    for id in 1..=3u64 {
        fx.session
            .enqueue(TestMessage::new(id, 64), &destination)
            .unwrap();
    }
    // Nothing visible before commit.
    assert!(destination.committed.lock().is_empty());
    assert_eq!(fx.store.journal_len(), 0);
    assert_eq!(fx.session.open_transactions(), 1);

    fx.session.commit().unwrap();
    assert_eq!(*destination.committed.lock(), vec![1, 2, 3]);
    assert!(destination.rolled_back.lock().is_empty());
    assert_eq!(fx.store.journal_len(), 3);
    assert_eq!(fx.session.txn_commits(), 1);
    assert_eq!(fx.session.open_transactions(), 0);
}

#[test]
fn local_rollback_persists_nothing() {
    let mut fx = session_fixture("local-rollback");
    let destination = TestDestination::new("orders");

    fx.session.select_tx().unwrap();
    for id in 1..=3u64 {
        fx.session
            .enqueue(TestMessage::new(id, 64), &destination)
            .unwrap();
    }
    fx.session.rollback().unwrap();

    assert_eq!(*destination.rolled_back.lock(), vec![1, 2, 3]);
    assert!(destination.committed.lock().is_empty());
    assert_eq!(fx.store.journal_len(), 0);
    assert_eq!(fx.session.txn_rejects(), 1);
}

#[test]
fn commit_store_failure_aborts_whole_set() {
    let mut fx = session_fixture("commit-failure");
    let destination = TestDestination::new("orders");

    fx.session.select_tx().unwrap();
    for id in 1..=3u64 {
        fx.session
            .enqueue(TestMessage::new(id, 64), &destination)
            .unwrap();
    }
    fx.store.fail_next_commit("disk full");

    let err = fx.session.commit().unwrap_err();
    assert_eq!(
        err,
        TxnError::Store(StoreError::CommitFailed("disk full".into()))
    );
    // No partial commit: every operation rolled back, none persisted.
    assert!(destination.committed.lock().is_empty());
    assert_eq!(*destination.rolled_back.lock(), vec![1, 2, 3]);
    assert_eq!(fx.store.journal_len(), 0);
    assert_eq!(fx.session.open_transactions(), 0);
}

#[test]
fn acknowledge_commit_deletes_entry() {
    let mut fx = session_fixture("ack-commit");
    fx.session.select_tx().unwrap();

    let entry = TestEntry::new("orders", 11);
    let handle: Arc<dyn QueueEntryHandle> = Arc::clone(&entry) as Arc<dyn QueueEntryHandle>;
    fx.session.acknowledge(ConsumerId(1), &handle).unwrap();
    assert!(!entry.deleted.load(Ordering::SeqCst));

    fx.session.commit().unwrap();
    assert!(entry.deleted.load(Ordering::SeqCst));
    assert!(!entry.redelivered.load(Ordering::SeqCst));
}

#[test]
fn acknowledge_rollback_redelivers_entry() {
    let mut fx = session_fixture("ack-rollback");
    fx.session.select_tx().unwrap();

    let entry = TestEntry::new("orders", 11);
    let handle: Arc<dyn QueueEntryHandle> = Arc::clone(&entry) as Arc<dyn QueueEntryHandle>;
    fx.session.acknowledge(ConsumerId(1), &handle).unwrap();
    fx.session.rollback().unwrap();

    assert!(entry.redelivered.load(Ordering::SeqCst));
    assert!(entry.released.load(Ordering::SeqCst));
    assert!(!entry.deleted.load(Ordering::SeqCst));
}

#[test]
fn dtx_lifecycle_through_session_verbs() {
    let mut fx = session_fixture("dtx-lifecycle");
    let destination = TestDestination::new("orders");
    let x = xid(1);

    fx.session.select_dtx().unwrap();
    fx.session.start_dtx(x.clone(), false, false).unwrap();
    fx.session
        .enqueue(TestMessage::new(5, 64), &destination)
        .unwrap();
    fx.session.end_dtx(&x, false, false).unwrap();

    fx.session.prepare_dtx(&x).unwrap();
    assert_eq!(fx.session.recover_dtx(), vec![x.clone()]);

    fx.session.commit_dtx(&x, false).unwrap();
    assert_eq!(*destination.committed.lock(), vec![5]);
    assert_eq!(fx.store.journal_len(), 1);
    assert!(fx.session.recover_dtx().is_empty());
}

#[test]
fn dtx_verbs_fail_without_selection() {
    let mut fx = session_fixture("dtx-not-selected");
    let x = xid(1);
    assert_eq!(
        fx.session.start_dtx(x.clone(), false, false),
        Err(DtxError::NotSelected)
    );
    assert_eq!(
        fx.session.end_dtx(&x, false, false),
        Err(DtxError::NotSelected)
    );
}

#[test]
fn dtx_branch_errors_are_typed() {
    let mut fx = session_fixture("dtx-errors");
    let x = xid(1);
    fx.session.select_dtx().unwrap();

    // Unknown branch before any start.
    assert_eq!(
        fx.session.end_dtx(&x, false, false),
        Err(DtxError::UnknownBranch(x.clone()))
    );

    fx.session.start_dtx(x.clone(), false, false).unwrap();

    // Duplicate start of the same branch.
    assert_eq!(
        fx.session.start_dtx(x.clone(), false, false),
        Err(DtxError::AlreadyKnown(x.clone()))
    );

    // A second branch without suspending the first.
    assert_eq!(
        fx.session.start_dtx(xid(2), false, false),
        Err(DtxError::BranchActive(x.clone()))
    );

    // A foreign session cannot end someone else's association.
    let mut other = sibling_session(&fx, "dtx-errors-sibling");
    other.select_dtx().unwrap();
    assert_eq!(
        other.end_dtx(&x, false, false),
        Err(DtxError::NotAssociated(x.clone()))
    );

    // end(fail) pins the branch rollback-only.
    fx.session.end_dtx(&x, true, false).unwrap();
    assert_eq!(fx.session.prepare_dtx(&x), Err(DtxError::RollbackOnly(x.clone())));
    assert_eq!(
        fx.session.commit_dtx(&x, true),
        Err(DtxError::RollbackOnly(x.clone()))
    );
    fx.session.rollback_dtx(&x).unwrap();
}

#[test]
fn dtx_branch_times_out_and_rolls_back() {
    let mut fx = session_fixture("dtx-timeout");
    let destination = TestDestination::new("orders");
    let x = xid(1);

    fx.session.select_dtx().unwrap();
    fx.session.start_dtx(x.clone(), false, false).unwrap();
    fx.session
        .enqueue(TestMessage::new(5, 64), &destination)
        .unwrap();
    fx.session.set_dtx_timeout(&x, Duration::from_secs(30)).unwrap();
    assert_eq!(
        fx.session.get_dtx_timeout(&x).unwrap(),
        Duration::from_secs(30)
    );

    fx.clock.advance(Duration::from_secs(31));
    assert_eq!(
        fx.session.end_dtx(&x, false, false),
        Err(DtxError::Timeout(x.clone()))
    );
    assert_eq!(fx.dtx.branch_state(&x), Some(BranchState::RollbackOnly));

    // The expiry was audited and the branch can still be rolled back.
    let timeouts: Vec<_> = audit::snapshot_for(&x.to_string())
        .into_iter()
        .filter(|e| e.event_type == audit::DTX_TIMEOUT)
        .collect();
    assert_eq!(timeouts.len(), 1);

    fx.session.rollback_dtx(&x).unwrap();
    assert_eq!(*destination.rolled_back.lock(), vec![5]);
    assert_eq!(fx.store.journal_len(), 0);
}

#[test]
fn dtx_store_failure_after_prepare_leaves_heuristic_outcome() {
    let mut fx = session_fixture("dtx-heuristic");
    let destination = TestDestination::new("orders");
    let x = xid(1);

    fx.session.select_dtx().unwrap();
    fx.session.start_dtx(x.clone(), false, false).unwrap();
    fx.session
        .enqueue(TestMessage::new(5, 64), &destination)
        .unwrap();
    fx.session.end_dtx(&x, false, false).unwrap();
    fx.session.prepare_dtx(&x).unwrap();

    fx.store.fail_next_commit("disk full");
    assert_eq!(
        fx.session.commit_dtx(&x, false),
        Err(DtxError::Store(StoreError::CommitFailed("disk full".into())))
    );
    assert_eq!(fx.dtx.branch_state(&x), Some(BranchState::HeurRolledBack));

    // Only forget releases a heuristic branch.
    assert!(matches!(
        fx.session.rollback_dtx(&x),
        Err(DtxError::IncorrectState { .. })
    ));
    fx.session.forget_dtx(&x).unwrap();
    assert_eq!(fx.dtx.branch_state(&x), None);
}

#[test]
fn switching_semantics_requires_settled_work() {
    let mut fx = session_fixture("tx-switch");
    let destination = TestDestination::new("orders");

    // Local -> anything with buffered work is rejected.
    fx.session.select_tx().unwrap();
    fx.session
        .enqueue(TestMessage::new(1, 64), &destination)
        .unwrap();
    assert_eq!(fx.session.select_dtx(), Err(TxnError::WorkPending));
    assert_eq!(fx.session.select_auto_commit(), Err(TxnError::WorkPending));
    fx.session.commit().unwrap();
    fx.session.select_dtx().unwrap();

    // Distributed with an active branch holding work is rejected too.
    let x = xid(1);
    fx.session.start_dtx(x.clone(), false, false).unwrap();
    fx.session
        .enqueue(TestMessage::new(2, 64), &destination)
        .unwrap();
    assert_eq!(fx.session.select_tx(), Err(TxnError::WorkPending));

    fx.session.end_dtx(&x, false, false).unwrap();
    fx.session.rollback_dtx(&x).unwrap();
    fx.session.select_tx().unwrap();
    assert_eq!(fx.session.transaction_kind(), TxnKind::Local);
}

#[test]
fn session_commit_is_forbidden_under_dtx() {
    let mut fx = session_fixture("dtx-no-session-commit");
    fx.session.select_dtx().unwrap();
    assert_eq!(fx.session.commit(), Err(TxnError::DistributedSelected));
    assert_eq!(fx.session.rollback(), Err(TxnError::DistributedSelected));
}

#[test]
fn oversized_local_transaction_spills_to_disk() {
    let config = SessionConfig {
        max_uncommitted_in_memory_size: 100,
        ..SessionConfig::default()
    };
    let mut fx = session_fixture_with("tx-spill", config);
    let subject = fx.session.log_subject().to_string();
    let destination = TestDestination::new("orders");

    fx.session.select_tx().unwrap();
    let first = TestMessage::new(1, 70);
    let second = TestMessage::new(2, 70);
    fx.session
        .enqueue(Arc::clone(&first) as Arc<dyn MessageHandle>, &destination)
        .unwrap();
    assert!(!first.flowed_to_disk.load(Ordering::SeqCst));

    fx.session
        .enqueue(Arc::clone(&second) as Arc<dyn MessageHandle>, &destination)
        .unwrap();
    assert!(first.flowed_to_disk.load(Ordering::SeqCst));
    assert!(second.flowed_to_disk.load(Ordering::SeqCst));

    let warnings: Vec<_> = audit::snapshot_for(&subject)
        .into_iter()
        .filter(|e| e.event_type == audit::LARGE_TRANSACTION)
        .collect();
    assert_eq!(warnings.len(), 1);

    // The transaction itself still commits.
    fx.session.commit().unwrap();
    assert_eq!(fx.store.journal_len(), 2);
}
