//! External store and queue interfaces.
//!
//! The session engine never touches persistence or queue storage directly;
//! it drives them through the narrow traits in this module:
//! - `MessageStore` / `StoreTransaction` - atomic durable batches
//! - `MessageHandle` - an opaque stored message (size, flow-to-disk)
//! - `QueueEntryHandle` - a queued message instance being settled
//! - `MessageDestination` - routing plus per-enqueue capacity feedback
//!
//! `StoreAck` is the acknowledgement future a store returns from an
//! asynchronous commit; it is resolved by storage-layer threads and polled
//! (or blocked on) by the session's I/O thread.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::txn::{Transaction, TxnError};

pub mod memory;

pub use memory::MemoryStore;

/// Identity of a consumer as seen by queues and group assignment.
///
/// Ids are allocated by the embedder and must be nonzero; zero is reserved
/// as the unowned sentinel in group bucket slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(pub u64);

/// Store-level record of a single enqueue, retained for later dequeue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueRecord {
    pub queue: String,
    pub message_id: u64,
}

/// A single durable operation inside a store transaction batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Enqueue { queue: String, message_id: u64 },
    Dequeue { queue: String, message_id: u64 },
}

/// Store failures surfaced to the session engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The durable write for a transaction batch failed; nothing was applied.
    #[error("store commit failed: {0}")]
    CommitFailed(String),
    /// The store dropped an acknowledgement before resolving it.
    #[error("store acknowledgement abandoned before completion")]
    AckAbandoned,
}

/// Resolution side of a pending store write.
///
/// Handed to the storage layer; completing it wakes whoever holds the
/// matching [`StoreAck`]. Dropping the handle unresolved surfaces
/// [`StoreError::AckAbandoned`] on the ack side.
#[derive(Debug)]
pub struct StoreAckHandle {
    tx: oneshot::Sender<Result<(), StoreError>>,
}

impl StoreAckHandle {
    /// Resolve the pending write with the given outcome.
    pub fn resolve(self, result: Result<(), StoreError>) {
        let _ = self.tx.send(result);
    }
}

/// Future for a pending store write.
#[derive(Debug)]
pub struct StoreAck {
    rx: Option<oneshot::Receiver<Result<(), StoreError>>>,
    resolved: Option<Result<(), StoreError>>,
}

impl StoreAck {
    /// Create an unresolved ack plus the handle that resolves it.
    pub fn pending() -> (StoreAckHandle, StoreAck) {
        let (tx, rx) = oneshot::channel();
        (
            StoreAckHandle { tx },
            StoreAck {
                rx: Some(rx),
                resolved: None,
            },
        )
    }

    /// Create an ack that is already resolved.
    pub fn ready(result: Result<(), StoreError>) -> StoreAck {
        StoreAck {
            rx: None,
            resolved: Some(result),
        }
    }

    /// Non-blocking readiness check; caches the outcome once observed.
    pub fn is_ready(&mut self) -> bool {
        if self.resolved.is_some() {
            return true;
        }
        match self.rx.as_mut() {
            None => {
                self.resolved = Some(Err(StoreError::AckAbandoned));
                true
            }
            Some(rx) => match rx.try_recv() {
                Ok(result) => {
                    self.resolved = Some(result);
                    true
                }
                Err(oneshot::error::TryRecvError::Empty) => false,
                Err(oneshot::error::TryRecvError::Closed) => {
                    self.resolved = Some(Err(StoreError::AckAbandoned));
                    true
                }
            },
        }
    }

    /// Block until the write resolves and return its outcome.
    pub fn wait(self) -> Result<(), StoreError> {
        if let Some(result) = self.resolved {
            return result;
        }
        match self.rx {
            None => Err(StoreError::AckAbandoned),
            Some(rx) => rx.blocking_recv().unwrap_or(Err(StoreError::AckAbandoned)),
        }
    }
}

/// Durable message store seen through its transactional surface.
pub trait MessageStore: Send + Sync {
    /// Open a new store transaction.
    fn begin(&self) -> Box<dyn StoreTransaction>;
}

/// A batch of enqueue/dequeue records applied atomically.
pub trait StoreTransaction: Send {
    /// Record an enqueue in the batch.
    fn enqueue(&mut self, queue: &str, message_id: u64);

    /// Record a dequeue in the batch.
    fn dequeue(&mut self, queue: &str, message_id: u64);

    /// Apply the batch durably, blocking until complete.
    fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Apply the batch durably, returning an ack resolved by store threads.
    fn commit_async(self: Box<Self>) -> StoreAck;

    /// Discard the batch.
    fn abort(self: Box<Self>);
}

/// An opaque stored message the session can size and spill.
pub trait MessageHandle: Send + Sync {
    fn message_id(&self) -> u64;

    /// Payload size counted against the uncommitted in-memory cap.
    fn content_size(&self) -> u64;

    /// Move the in-transit payload out of memory onto disk.
    fn flow_to_disk(&self);
}

/// A queued message instance in the middle of settlement.
pub trait QueueEntryHandle: Send + Sync {
    fn queue(&self) -> String;

    fn message_id(&self) -> u64;

    /// Pin acquisition to the consumer so no other consumer can steal the
    /// entry while its dequeue is in flight. Returns false if the entry is
    /// no longer acquired by this consumer.
    fn make_unstealable(&self, consumer: ConsumerId) -> bool;

    /// Remove the entry permanently (post-commit of an acknowledge).
    fn delete(&self);

    /// Flag the entry for redelivery.
    fn set_redelivered(&self);

    /// Return the entry to dispatch, releasing the consumer's acquisition.
    fn release(&self, consumer: ConsumerId);
}

/// Queue-level capacity feedback produced while routing an enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityAlert {
    pub queue: String,
    pub over_capacity: bool,
}

/// Routing target for produced messages.
///
/// `send` registers store work with the supplied transaction and invokes the
/// capacity sink once per enqueued queue so backpressure can feed the
/// session's flow controller. Returns the number of queues enqueued to.
pub trait MessageDestination: Send + Sync {
    fn name(&self) -> String;

    fn send(
        &self,
        message: &Arc<dyn MessageHandle>,
        txn: &mut dyn Transaction,
        capacity: &mut dyn FnMut(CapacityAlert),
    ) -> Result<usize, TxnError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_ready_ack_is_immediately_done() {
        let mut ack = StoreAck::ready(Ok(()));
        assert!(ack.is_ready());
        assert_eq!(ack.wait(), Ok(()));
    }

    #[test]
    fn test_pending_ack_resolves_from_another_thread() {
        let (handle, mut ack) = StoreAck::pending();
        assert!(!ack.is_ready());

        let resolver = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            handle.resolve(Ok(()));
        });

        assert_eq!(ack.wait(), Ok(()));
        resolver.join().unwrap();
    }

    #[test]
    fn test_dropped_handle_surfaces_abandonment() {
        let (handle, mut ack) = StoreAck::pending();
        drop(handle);
        assert!(ack.is_ready());
        assert_eq!(ack.wait(), Err(StoreError::AckAbandoned));
    }

    #[test]
    fn test_is_ready_caches_outcome() {
        let (handle, mut ack) = StoreAck::pending();
        handle.resolve(Err(StoreError::CommitFailed("disk full".into())));
        assert!(ack.is_ready());
        assert!(ack.is_ready());
        assert_eq!(
            ack.wait(),
            Err(StoreError::CommitFailed("disk full".into()))
        );
    }
}
