//! Auto-commit and local transactions.

use std::sync::Arc;
use std::time::Instant;

use super::{PendingOp, Transaction, TxnAction, TxnError, TxnKind};
use crate::session::commands::CommandQueue;
use crate::store::{EnqueueRecord, MessageHandle, MessageStore, StoreOp, StoreTransaction};

/// Settles every operation immediately through an asynchronous store write.
///
/// Each enqueue/dequeue commits its own single-op store transaction; the
/// returned acknowledgement and the post-commit hook are recorded with the
/// session's command queue, which completes them in FIFO order as the store
/// acknowledges.
pub struct AutoCommitTransaction {
    store: Arc<dyn MessageStore>,
    commands: CommandQueue,
}

impl AutoCommitTransaction {
    pub fn new(store: Arc<dyn MessageStore>, commands: CommandQueue) -> Self {
        Self { store, commands }
    }

    fn record_async(&self, op: StoreOp, action: TxnAction) {
        let mut tx = self.store.begin();
        match &op {
            StoreOp::Enqueue { queue, message_id } => tx.enqueue(queue, *message_id),
            StoreOp::Dequeue { queue, message_id } => tx.dequeue(queue, *message_id),
        }
        let ack = tx.commit_async();
        self.commands.record(ack, move || action.post_commit());
    }
}

impl Transaction for AutoCommitTransaction {
    fn kind(&self) -> TxnKind {
        TxnKind::AutoCommit
    }

    fn enqueue(
        &mut self,
        queue: &str,
        message: &Arc<dyn MessageHandle>,
        action: TxnAction,
    ) -> Result<(), TxnError> {
        self.record_async(
            StoreOp::Enqueue {
                queue: queue.to_string(),
                message_id: message.message_id(),
            },
            action,
        );
        Ok(())
    }

    fn dequeue(&mut self, record: EnqueueRecord, action: TxnAction) -> Result<(), TxnError> {
        self.record_async(
            StoreOp::Dequeue {
                queue: record.queue,
                message_id: record.message_id,
            },
            action,
        );
        Ok(())
    }

    fn commit(&mut self) -> Result<(), TxnError> {
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), TxnError> {
        Ok(())
    }

    fn has_pending_work(&self) -> bool {
        false
    }

    fn start_time(&self) -> Option<Instant> {
        None
    }

    fn update_time(&self) -> Option<Instant> {
        None
    }
}

/// Buffers operations until an explicit commit or rollback.
pub struct LocalTransaction {
    store: Arc<dyn MessageStore>,
    ops: Vec<PendingOp>,
    started_at: Option<Instant>,
    updated_at: Option<Instant>,
}

impl LocalTransaction {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            store,
            ops: Vec::new(),
            started_at: None,
            updated_at: None,
        }
    }

    fn touch(&mut self) {
        let now = Instant::now();
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.updated_at = Some(now);
    }

    fn reset(&mut self) {
        self.started_at = None;
        self.updated_at = None;
    }

    fn apply_store_ops(&self, tx: &mut dyn StoreTransaction) {
        for op in &self.ops {
            match &op.store_op {
                Some(StoreOp::Enqueue { queue, message_id }) => tx.enqueue(queue, *message_id),
                Some(StoreOp::Dequeue { queue, message_id }) => tx.dequeue(queue, *message_id),
                None => {}
            }
        }
    }
}

impl Transaction for LocalTransaction {
    fn kind(&self) -> TxnKind {
        TxnKind::Local
    }

    fn enqueue(
        &mut self,
        queue: &str,
        message: &Arc<dyn MessageHandle>,
        action: TxnAction,
    ) -> Result<(), TxnError> {
        self.touch();
        self.ops.push(PendingOp {
            store_op: Some(StoreOp::Enqueue {
                queue: queue.to_string(),
                message_id: message.message_id(),
            }),
            action,
        });
        Ok(())
    }

    fn dequeue(&mut self, record: EnqueueRecord, action: TxnAction) -> Result<(), TxnError> {
        self.touch();
        self.ops.push(PendingOp {
            store_op: Some(StoreOp::Dequeue {
                queue: record.queue,
                message_id: record.message_id,
            }),
            action,
        });
        Ok(())
    }

    fn commit(&mut self) -> Result<(), TxnError> {
        if self.ops.is_empty() {
            self.reset();
            return Ok(());
        }

        let mut tx = self.store.begin();
        self.apply_store_ops(tx.as_mut());
        match tx.commit() {
            Ok(()) => {
                for op in self.ops.drain(..) {
                    op.action.post_commit();
                }
                self.reset();
                Ok(())
            }
            Err(err) => {
                // The durable write failed; nothing was applied. Run the
                // rollback hooks so delivered-but-unacked messages return
                // to dispatch instead of dangling.
                for op in self.ops.drain(..) {
                    op.action.on_rollback();
                }
                self.reset();
                Err(err.into())
            }
        }
    }

    fn rollback(&mut self) -> Result<(), TxnError> {
        for op in self.ops.drain(..) {
            op.action.on_rollback();
        }
        self.reset();
        Ok(())
    }

    fn has_pending_work(&self) -> bool {
        !self.ops.is_empty()
    }

    fn start_time(&self) -> Option<Instant> {
        self.started_at
    }

    fn update_time(&self) -> Option<Instant> {
        self.updated_at
    }
}
