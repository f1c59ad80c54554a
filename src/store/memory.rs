//! In-memory message store.
//!
//! Reference [`MessageStore`] implementation used by tests and embedders
//! that do not need durability. Commits append to a journal that can be
//! inspected afterwards; a failure can be injected to exercise the abort
//! paths of the transaction engine.

use parking_lot::Mutex;
use std::sync::Arc;

use super::{MessageStore, StoreAck, StoreError, StoreOp, StoreTransaction};

#[derive(Default)]
struct MemoryStoreState {
    journal: Vec<StoreOp>,
    fail_next_commit: Option<String>,
}

/// Message store keeping every committed operation in memory.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next commit fail with the given reason.
    pub fn fail_next_commit(&self, reason: impl Into<String>) {
        self.inner.lock().fail_next_commit = Some(reason.into());
    }

    /// Copy of every operation committed so far, in commit order.
    pub fn journal(&self) -> Vec<StoreOp> {
        self.inner.lock().journal.clone()
    }

    pub fn journal_len(&self) -> usize {
        self.inner.lock().journal.len()
    }
}

impl MessageStore for MemoryStore {
    fn begin(&self) -> Box<dyn StoreTransaction> {
        Box::new(MemoryTransaction {
            state: Arc::clone(&self.inner),
            ops: Vec::new(),
        })
    }
}

struct MemoryTransaction {
    state: Arc<Mutex<MemoryStoreState>>,
    ops: Vec<StoreOp>,
}

impl MemoryTransaction {
    fn apply(self) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if let Some(reason) = state.fail_next_commit.take() {
            return Err(StoreError::CommitFailed(reason));
        }
        state.journal.extend(self.ops);
        Ok(())
    }
}

impl StoreTransaction for MemoryTransaction {
    fn enqueue(&mut self, queue: &str, message_id: u64) {
        self.ops.push(StoreOp::Enqueue {
            queue: queue.to_string(),
            message_id,
        });
    }

    fn dequeue(&mut self, queue: &str, message_id: u64) {
        self.ops.push(StoreOp::Dequeue {
            queue: queue.to_string(),
            message_id,
        });
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.apply()
    }

    fn commit_async(self: Box<Self>) -> StoreAck {
        StoreAck::ready(self.apply())
    }

    fn abort(self: Box<Self>) {}
}
