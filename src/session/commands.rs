//! Ordered completion of asynchronous store commands.
//!
//! Auto-commit transactions persist each operation with an asynchronous
//! store write; the resulting acknowledgement future and its post-commit
//! action queue here. Entries complete strictly in FIFO order even when a
//! later future resolves first, so the client-visible commit order always
//! matches the store's acknowledgement order.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::store::{StoreAck, StoreError};

/// A pending store write paired with the action to run once durable.
struct AsyncCommand {
    seq: u64,
    ack: StoreAck,
    action: Box<dyn FnOnce() + Send>,
}

impl AsyncCommand {
    fn is_ready(&mut self) -> bool {
        self.ack.is_ready()
    }

    /// Block until the write resolves, then run the action. A store
    /// failure is returned after the entry has already been removed from
    /// the queue; the action does not run.
    fn complete(self) -> Result<(), StoreError> {
        self.ack.wait()?;
        (self.action)();
        Ok(())
    }
}

#[derive(Default)]
struct CommandQueueState {
    commands: VecDeque<AsyncCommand>,
    next_seq: u64,
}

/// FIFO queue of unfinished asynchronous store commands.
///
/// Recorded and drained by the session's I/O thread; the underlying acks
/// are resolved by storage threads. Cheap to clone - clones share the same
/// queue, which is how auto-commit transactions record into their session's
/// queue.
#[derive(Clone)]
pub struct CommandQueue {
    state: Arc<Mutex<CommandQueueState>>,
    drain_threshold: usize,
}

impl CommandQueue {
    pub fn new(drain_threshold: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(CommandQueueState::default())),
            drain_threshold,
        }
    }

    /// Append a pending write and its post-commit action.
    pub fn record(&self, ack: StoreAck, action: impl FnOnce() + Send + 'static) {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.commands.push_back(AsyncCommand {
            seq,
            ack,
            action: Box::new(action),
        });
    }

    /// Complete entries from the head while they are already resolved,
    /// then drain forcibly (blocking) while the queue is deeper than the
    /// configured threshold.
    pub fn complete_ready(&self) -> Result<(), StoreError> {
        loop {
            let command = {
                let mut state = self.state.lock();
                let ready = state
                    .commands
                    .front_mut()
                    .map_or(false, |head| head.is_ready());
                if ready {
                    state.commands.pop_front()
                } else {
                    None
                }
            };
            match command {
                Some(command) => command.complete()?,
                None => break,
            }
        }

        loop {
            let command = {
                let mut state = self.state.lock();
                if state.commands.len() > self.drain_threshold {
                    state.commands.pop_front()
                } else {
                    None
                }
            };
            match command {
                Some(command) => command.complete()?,
                None => break,
            }
        }
        Ok(())
    }

    /// Block until every queued command has completed. Used at session
    /// close so no store acknowledgement is lost.
    pub fn drain(&self) -> Result<(), StoreError> {
        loop {
            let command = {
                let mut state = self.state.lock();
                state.commands.pop_front()
            };
            match command {
                Some(command) => command.complete()?,
                None => return Ok(()),
            }
        }
    }

    /// Opaque identity of the newest unfinished command, if any. When a
    /// later `mark()` no longer reports a sequence at or above this one,
    /// every command issued before the mark has completed.
    pub fn mark(&self) -> Option<u64> {
        self.state.lock().commands.back().map(|c| c.seq)
    }

    pub fn len(&self) -> usize {
        self.state.lock().commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
