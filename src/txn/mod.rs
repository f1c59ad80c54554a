//! Transactional units of work.
//!
//! Exactly one transaction object is bound to a session at a time:
//! - `AutoCommitTransaction` - every operation settles immediately through
//!   an asynchronous store write
//! - `LocalTransaction` - operations accumulate until commit or rollback
//! - `DistributedTransaction` - operations accumulate per active XA branch
//!
//! Each registered operation carries a post-commit and an on-rollback hook;
//! commit and rollback run exactly one of the two, in registration order.

use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use crate::store::{EnqueueRecord, MessageHandle, StoreError, StoreOp};

pub mod dtx;
pub mod local;

pub use dtx::*;
pub use local::*;

/// Which transactional semantics a session is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnKind {
    AutoCommit,
    Local,
    Distributed,
}

impl TxnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxnKind::AutoCommit => "auto_commit",
            TxnKind::Local => "local",
            TxnKind::Distributed => "distributed",
        }
    }
}

/// Transaction failures surfaced to the protocol layer.
#[derive(Debug, PartialEq, Error)]
pub enum TxnError {
    /// Switching transaction semantics with uncommitted work buffered.
    #[error("transaction has buffered operations; commit or roll back first")]
    WorkPending,
    /// `commit`/`rollback` used while a distributed transaction is
    /// selected; dtx branches settle through the dtx verbs instead.
    #[error("session commit/rollback are not permitted while a distributed transaction is selected")]
    DistributedSelected,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Dtx(#[from] DtxError),
}

/// Post-commit / on-rollback hook pair for one registered operation.
///
/// Exactly one of the two hooks runs, once, when the owning transaction
/// settles.
pub struct TxnAction {
    commit_hook: Option<Box<dyn FnOnce() + Send>>,
    rollback_hook: Option<Box<dyn FnOnce() + Send>>,
}

impl TxnAction {
    pub fn new(
        post_commit: impl FnOnce() + Send + 'static,
        on_rollback: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            commit_hook: Some(Box::new(post_commit)),
            rollback_hook: Some(Box::new(on_rollback)),
        }
    }

    pub fn noop() -> Self {
        Self {
            commit_hook: None,
            rollback_hook: None,
        }
    }

    pub fn post_commit(mut self) {
        if let Some(hook) = self.commit_hook.take() {
            hook();
        }
    }

    pub fn on_rollback(mut self) {
        if let Some(hook) = self.rollback_hook.take() {
            hook();
        }
    }
}

/// An operation registered with a transaction: the durable store record (if
/// any) plus its settlement hooks.
pub struct PendingOp {
    pub store_op: Option<StoreOp>,
    pub action: TxnAction,
}

/// A session's unit of work.
pub trait Transaction: Send {
    fn kind(&self) -> TxnKind;

    fn is_transactional(&self) -> bool {
        self.kind() != TxnKind::AutoCommit
    }

    /// Register an enqueue of `message` onto `queue`.
    fn enqueue(
        &mut self,
        queue: &str,
        message: &Arc<dyn MessageHandle>,
        action: TxnAction,
    ) -> Result<(), TxnError>;

    /// Register a dequeue of a previously enqueued record.
    fn dequeue(&mut self, record: EnqueueRecord, action: TxnAction) -> Result<(), TxnError>;

    /// Durably persist all accumulated operations as one atomic store
    /// transaction, then run every post-commit hook in registration order.
    /// A store failure aborts the whole set; no post-commit hook runs.
    fn commit(&mut self) -> Result<(), TxnError>;

    /// Discard accumulated operations, running every on-rollback hook in
    /// registration order.
    fn rollback(&mut self) -> Result<(), TxnError>;

    /// Whether operations are buffered and unsettled.
    fn has_pending_work(&self) -> bool;

    fn start_time(&self) -> Option<Instant>;

    fn update_time(&self) -> Option<Instant>;

    /// Downcast hook for the dtx verb surface.
    fn as_distributed_mut(&mut self) -> Option<&mut DistributedTransaction> {
        None
    }
}
