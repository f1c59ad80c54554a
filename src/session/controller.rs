//! Per-connection-channel session controller.
//!
//! Composes the disposition tracker, transaction engine, credit flow
//! controller and async command queue into the object the protocol layer
//! drives: it issues deliveries, dispatches disposition changes from the
//! wire, runs the transaction verb surface, and advances consumer dispatch
//! once per I/O pass through `process_pending`.
//!
//! The controller's own state (subscription table, pending-work list,
//! transaction binding) is owned by the connection's I/O thread; the
//! embedded trackers are internally synchronized for worker-thread access.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

use crate::core::config::SessionConfig;
use crate::core::time::Clock;
use crate::groups::MessageGroupManager;
use crate::ops::audit;
use crate::session::commands::CommandQueue;
use crate::session::credit::{BlockCause, CreditController, UNLIMITED_CREDIT};
use crate::session::disposition::{
    Disposition, DispositionListener, DispositionRange, DispositionTracker,
};
use crate::store::{
    CapacityAlert, ConsumerId, EnqueueRecord, MessageDestination, MessageHandle, MessageStore,
    QueueEntryHandle, StoreError,
};
use crate::txn::{
    AutoCommitTransaction, DistributedTransaction, DtxError, DtxRegistry, LocalTransaction,
    Transaction, TxnAction, TxnError, TxnKind, Xid,
};

/// Subscription key used when a consumer registers with no destination.
const NULL_DESTINATION: &str = "<null>";

/// Protocol error code reported when a blocked producer session outlasts
/// the flow-control enforcement timeout.
pub const RESOURCE_ERROR_CODE: u16 = 506;

/// A consumer's dispatch surface as seen by the session.
pub trait ConsumerTarget: Send + Sync {
    fn name(&self) -> &str;

    fn consumer_id(&self) -> ConsumerId;

    /// Whether the consumer has deliveries or credit state to flush.
    fn has_pending_work(&self) -> bool;

    /// Perform one unit of pending work; returns whether more remains.
    fn process_pending(&self) -> bool;

    /// Push any buffered credit state to the wire.
    fn flush_credit_state(&self);

    /// Suspend dispatch without tearing the consumer down.
    fn stop(&self);

    fn close(&self);
}

/// The owning connection's I/O facade.
pub trait WireHandle: Send + Sync {
    /// Wake the connection's I/O thread.
    fn notify_work(&self);

    /// Put a flow-stop for this session on the wire.
    fn flow_stop(&self);

    /// Remove flow control, re-advertising the given producer window.
    fn flow_resume(&self, credit: u64);

    /// Advertise a producer credit extension.
    fn grant_credit(&self, amount: u64);

    /// Ask the connection to force-close this session.
    fn request_close(&self, code: u16, reason: &str);
}

/// Consumer lifecycle notifications.
pub trait ConsumerListener: Send + Sync {
    fn consumer_added(&self, name: &str);

    fn consumer_removed(&self, name: &str);
}

struct SubscriptionEntry {
    target: Arc<dyn ConsumerTarget>,
    groups: Option<Arc<MessageGroupManager>>,
}

/// Cloneable capability handle for blocking and unblocking a session.
///
/// Queue capacity checkers run on worker threads processing other consumers
/// of the same queue; they hold one of these instead of the session itself.
/// A transition emits the flow audit event and wakes the connection's I/O
/// thread, which flushes the wire-visible flow state on its next pass.
#[derive(Clone)]
pub struct FlowHandle {
    credit: Arc<CreditController>,
    wire: Arc<dyn WireHandle>,
    subject: Arc<str>,
    closing: Arc<AtomicBool>,
}

impl FlowHandle {
    /// Block the session on behalf of a specific queue.
    pub fn block_queue(&self, queue: &str) {
        self.apply(BlockCause::Queue(queue.to_string()), true);
    }

    /// Block the session for all queues.
    pub fn block(&self) {
        self.apply(BlockCause::Session, true);
    }

    pub fn unblock_queue(&self, queue: &str) {
        self.apply(BlockCause::Queue(queue.to_string()), false);
    }

    pub fn unblock(&self) {
        self.apply(BlockCause::Session, false);
    }

    pub fn is_blocking(&self) -> bool {
        self.credit.blocking()
    }

    fn apply(&self, cause: BlockCause, block: bool) {
        if block {
            let describe = cause.describe().to_string();
            if self.credit.block(cause) {
                audit::emit(audit::FLOW_ENFORCED, &self.subject, &describe);
                if !self.closing.load(Ordering::SeqCst) {
                    self.wire.notify_work();
                }
            }
        } else if self.credit.unblock(&cause) && !self.closing.load(Ordering::SeqCst) {
            audit::emit(audit::FLOW_REMOVED, &self.subject, cause.describe());
            self.wire.notify_work();
        }
    }
}

/// The per-channel session engine.
pub struct SessionController {
    id: Uuid,
    channel: u16,
    log_subject: String,
    created_at: SystemTime,

    wire: Arc<dyn WireHandle>,
    store: Arc<dyn MessageStore>,
    dtx: Arc<DtxRegistry>,
    clock: Arc<dyn Clock>,
    max_uncommitted_size: u64,

    dispositions: DispositionTracker,
    credit: Arc<CreditController>,
    flow: FlowHandle,
    commands: CommandQueue,
    transaction: Box<dyn Transaction>,

    subscriptions: HashMap<String, SubscriptionEntry>,
    pending_consumers: VecDeque<Arc<dyn ConsumerTarget>>,
    consumer_listeners: Vec<Arc<dyn ConsumerListener>>,
    delete_tasks: Vec<Box<dyn FnOnce() + Send>>,

    next_delivery_id: u64,
    wire_blocking: bool,
    closing: Arc<AtomicBool>,
    closed: bool,

    txn_starts: AtomicU64,
    txn_commits: AtomicU64,
    txn_rejects: AtomicU64,
    open_transactions: AtomicU64,

    uncommitted_size: u64,
    uncommitted: Vec<Arc<dyn MessageHandle>>,
}

impl SessionController {
    pub fn new(
        connection_name: &str,
        channel: u16,
        principal: &str,
        wire: Arc<dyn WireHandle>,
        store: Arc<dyn MessageStore>,
        dtx: Arc<DtxRegistry>,
        clock: Arc<dyn Clock>,
        config: &SessionConfig,
    ) -> Self {
        let log_subject = format!("[{connection_name}:{channel}({principal})]");
        let commands = CommandQueue::new(config.unfinished_command_drain_threshold);
        let transaction = Box::new(AutoCommitTransaction::new(
            Arc::clone(&store),
            commands.clone(),
        ));
        let credit = Arc::new(CreditController::new(
            config.producer_credit_low_water,
            config.producer_credit_topup,
            config.flow_control_enforcement_timeout(),
        ));
        let closing = Arc::new(AtomicBool::new(false));
        let flow = FlowHandle {
            credit: Arc::clone(&credit),
            wire: Arc::clone(&wire),
            subject: Arc::from(log_subject.as_str()),
            closing: Arc::clone(&closing),
        };
        audit::emit(audit::CHANNEL_CREATE, &log_subject, "session created");
        Self {
            id: Uuid::new_v4(),
            channel,
            log_subject,
            created_at: SystemTime::now(),
            wire,
            store,
            dtx,
            clock,
            max_uncommitted_size: config.max_uncommitted_in_memory_size,
            dispositions: DispositionTracker::new(),
            credit,
            flow,
            commands,
            transaction,
            subscriptions: HashMap::new(),
            pending_consumers: VecDeque::new(),
            consumer_listeners: Vec::new(),
            delete_tasks: Vec::new(),
            next_delivery_id: 0,
            wire_blocking: false,
            closing,
            closed: false,
            txn_starts: AtomicU64::new(0),
            txn_commits: AtomicU64::new(0),
            txn_rejects: AtomicU64::new(0),
            open_transactions: AtomicU64::new(0),
            uncommitted_size: 0,
            uncommitted: Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Identity and statistics
    // -----------------------------------------------------------------------

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn channel(&self) -> u16 {
        self.channel
    }

    pub fn log_subject(&self) -> &str {
        &self.log_subject
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn consumer_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn unacknowledged_message_count(&self) -> usize {
        self.dispositions.len()
    }

    pub fn is_blocking(&self) -> bool {
        self.credit.blocking()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn txn_starts(&self) -> u64 {
        self.txn_starts.load(Ordering::SeqCst)
    }

    pub fn txn_commits(&self) -> u64 {
        self.txn_commits.load(Ordering::SeqCst)
    }

    pub fn txn_rejects(&self) -> u64 {
        self.txn_rejects.load(Ordering::SeqCst)
    }

    /// Open-transaction gauge: 1 while a transactional unit of work has
    /// unsettled operations.
    pub fn open_transactions(&self) -> u64 {
        self.open_transactions.load(Ordering::SeqCst)
    }

    pub fn transaction_kind(&self) -> TxnKind {
        self.transaction.kind()
    }

    pub fn is_transactional(&self) -> bool {
        self.transaction.is_transactional()
    }

    pub fn transaction_start_time(&self) -> Option<std::time::Instant> {
        self.transaction.start_time()
    }

    pub fn transaction_update_time(&self) -> Option<std::time::Instant> {
        self.transaction.update_time()
    }

    pub fn credit(&self) -> &CreditController {
        &self.credit
    }

    pub fn command_queue(&self) -> &CommandQueue {
        &self.commands
    }

    // -----------------------------------------------------------------------
    // Flow control
    // -----------------------------------------------------------------------

    /// Capability handle queue capacity checkers and worker threads use to
    /// block/unblock this session without holding the session itself.
    pub fn flow_handle(&self) -> FlowHandle {
        self.flow.clone()
    }

    /// Block the session on behalf of a specific queue.
    pub fn block_queue(&self, queue: &str) {
        self.flow.block_queue(queue);
    }

    /// Block the session for all queues.
    pub fn block(&self) {
        self.flow.block();
    }

    pub fn unblock_queue(&self, queue: &str) {
        self.flow.unblock_queue(queue);
    }

    pub fn unblock(&self) {
        self.flow.unblock();
    }

    /// Whether the wire-visible block has outlasted the enforcement
    /// timeout.
    pub fn blocking_timeout_exceeded(&self) -> bool {
        self.credit.blocking_timeout_exceeded(self.clock.now())
    }

    /// Force-close an unresponsive producer session once the enforcement
    /// timeout has elapsed. Returns whether a close was requested.
    pub fn enforce_blocking_timeout(&self) -> bool {
        if self.blocking_timeout_exceeded() {
            self.wire.request_close(
                RESOURCE_ERROR_CODE,
                "flow control enforcement timeout exceeded",
            );
            true
        } else {
            false
        }
    }

    // -----------------------------------------------------------------------
    // Producer intake
    // -----------------------------------------------------------------------

    /// Route a produced message, registering its store work with the bound
    /// transaction. Consumes producer credit, feeds queue capacity alerts
    /// into the flow controller, and tracks uncommitted in-memory size for
    /// local transactions. Returns the number of queues enqueued to.
    pub fn enqueue(
        &mut self,
        message: Arc<dyn MessageHandle>,
        destination: &dyn MessageDestination,
    ) -> Result<usize, TxnError> {
        if let Some(grant) = self.credit.consume_credit() {
            self.wire.grant_credit(grant);
        }

        let enqueues = {
            let flow = &self.flow;
            let mut capacity = |alert: CapacityAlert| {
                flow.apply(BlockCause::Queue(alert.queue), alert.over_capacity);
            };
            destination.send(&message, self.transaction.as_mut(), &mut capacity)?
        };

        if self.transaction.is_transactional() {
            self.open_transactions.store(1, Ordering::SeqCst);
        }
        self.track_uncommitted(message);
        Ok(enqueues)
    }

    fn track_uncommitted(&mut self, message: Arc<dyn MessageHandle>) {
        if self.transaction.kind() != TxnKind::Local {
            return;
        }
        self.uncommitted_size += message.content_size();
        if self.uncommitted_size > self.max_uncommitted_size {
            message.flow_to_disk();
            if !self.uncommitted.is_empty() || self.uncommitted_size == message.content_size() {
                audit::emit(
                    audit::LARGE_TRANSACTION,
                    &self.log_subject,
                    &format!(
                        "{} uncommitted bytes exceed the in-memory cap; flowing to disk",
                        self.uncommitted_size
                    ),
                );
            }
            for handle in self.uncommitted.drain(..) {
                handle.flow_to_disk();
            }
        } else {
            self.uncommitted.push(message);
        }
    }

    fn reset_uncommitted(&mut self) {
        self.uncommitted_size = 0;
        self.uncommitted.clear();
    }

    // -----------------------------------------------------------------------
    // Delivery issue and settlement
    // -----------------------------------------------------------------------

    /// Assign the next delivery id and track the delivery until the client
    /// settles it.
    pub fn send_message(&mut self, listener: Box<dyn DispositionListener>) -> u64 {
        let id = self.next_delivery_id;
        self.next_delivery_id += 1;
        self.dispositions.record(id, listener);
        id
    }

    /// Retract a tracked delivery, e.g. when its transfer failed mid-send.
    pub fn remove_disposition_listener(&self, id: u64) {
        self.dispositions.remove(id);
    }

    /// Register a consumer acknowledgement with the bound transaction: the
    /// entry is deleted post-commit, or marked redelivered and released on
    /// rollback.
    pub fn acknowledge(
        &mut self,
        consumer: ConsumerId,
        entry: &Arc<dyn QueueEntryHandle>,
    ) -> Result<(), TxnError> {
        if !entry.make_unstealable(consumer) {
            return Ok(());
        }
        let record = EnqueueRecord {
            queue: entry.queue(),
            message_id: entry.message_id(),
        };
        let delete_entry = Arc::clone(entry);
        let release_entry = Arc::clone(entry);
        self.transaction.dequeue(
            record,
            TxnAction::new(
                move || delete_entry.delete(),
                move || {
                    // The client saw the message; on rollback it must come
                    // back flagged as redelivered.
                    release_entry.set_redelivered();
                    release_entry.release(consumer);
                },
            ),
        )?;
        if self.transaction.is_transactional() {
            self.open_transactions.store(1, Ordering::SeqCst);
        }
        Ok(())
    }

    pub fn accept(&self, ranges: &[DispositionRange]) -> usize {
        self.dispositions.resolve(ranges, Disposition::Accept)
    }

    pub fn release(&self, ranges: &[DispositionRange], set_redelivered: bool) -> usize {
        self.dispositions
            .resolve(ranges, Disposition::Release { set_redelivered })
    }

    pub fn reject(&self, ranges: &[DispositionRange]) -> usize {
        self.dispositions.resolve(ranges, Disposition::Reject)
    }

    pub fn acquire(&self, ranges: &[DispositionRange]) -> Vec<u64> {
        self.dispositions.acquire(ranges)
    }

    // -----------------------------------------------------------------------
    // Consumer registry
    // -----------------------------------------------------------------------

    pub fn register_consumer(
        &mut self,
        destination: Option<&str>,
        target: Arc<dyn ConsumerTarget>,
        groups: Option<Arc<MessageGroupManager>>,
    ) {
        let key = destination.unwrap_or(NULL_DESTINATION).to_string();
        for listener in &self.consumer_listeners {
            listener.consumer_added(target.name());
        }
        self.subscriptions
            .insert(key, SubscriptionEntry { target, groups });
    }

    /// Close and deregister a consumer, releasing its group assignments.
    pub fn unregister_consumer(&mut self, destination: Option<&str>) -> bool {
        let key = destination.unwrap_or(NULL_DESTINATION);
        match self.subscriptions.remove(key) {
            Some(entry) => {
                if let Some(groups) = &entry.groups {
                    groups.clear_assignments(entry.target.consumer_id());
                }
                entry.target.close();
                for listener in &self.consumer_listeners {
                    listener.consumer_removed(entry.target.name());
                }
                true
            }
            None => false,
        }
    }

    pub fn subscription(&self, destination: Option<&str>) -> Option<Arc<dyn ConsumerTarget>> {
        let key = destination.unwrap_or(NULL_DESTINATION);
        self.subscriptions
            .get(key)
            .map(|entry| Arc::clone(&entry.target))
    }

    /// Suspend dispatch on every consumer without tearing the session down.
    pub fn stop_consumers(&self) {
        for entry in self.subscriptions.values() {
            entry.target.stop();
        }
    }

    pub fn add_consumer_listener(&mut self, listener: Arc<dyn ConsumerListener>) {
        self.consumer_listeners.push(listener);
    }

    /// Register a task to run after the session has fully closed.
    pub fn add_delete_task(&mut self, task: impl FnOnce() + Send + 'static) {
        self.delete_tasks.push(Box::new(task));
    }

    // -----------------------------------------------------------------------
    // Transaction control
    // -----------------------------------------------------------------------

    fn ensure_no_pending_work(&self) -> Result<(), TxnError> {
        if self.transaction.has_pending_work() {
            Err(TxnError::WorkPending)
        } else {
            Ok(())
        }
    }

    /// Bind local transaction semantics to the session.
    pub fn select_tx(&mut self) -> Result<(), TxnError> {
        self.ensure_no_pending_work()?;
        self.transaction = Box::new(LocalTransaction::new(Arc::clone(&self.store)));
        self.txn_starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Bind distributed transaction semantics to the session.
    pub fn select_dtx(&mut self) -> Result<(), TxnError> {
        self.ensure_no_pending_work()?;
        self.transaction = Box::new(DistributedTransaction::new(Arc::clone(&self.dtx), self.id));
        Ok(())
    }

    /// Return the session to auto-commit semantics.
    pub fn select_auto_commit(&mut self) -> Result<(), TxnError> {
        self.ensure_no_pending_work()?;
        self.transaction = Box::new(AutoCommitTransaction::new(
            Arc::clone(&self.store),
            self.commands.clone(),
        ));
        Ok(())
    }

    pub fn commit(&mut self) -> Result<(), TxnError> {
        let result = self.transaction.commit();
        match result {
            Ok(()) => {
                self.txn_commits.fetch_add(1, Ordering::SeqCst);
                self.txn_starts.fetch_add(1, Ordering::SeqCst);
                self.open_transactions.store(0, Ordering::SeqCst);
                self.reset_uncommitted();
                Ok(())
            }
            Err(TxnError::DistributedSelected) => Err(TxnError::DistributedSelected),
            Err(err) => {
                // The buffered set was aborted; nothing remains pending.
                self.open_transactions.store(0, Ordering::SeqCst);
                self.reset_uncommitted();
                Err(err)
            }
        }
    }

    pub fn rollback(&mut self) -> Result<(), TxnError> {
        self.transaction.rollback()?;
        self.txn_rejects.fetch_add(1, Ordering::SeqCst);
        self.txn_starts.fetch_add(1, Ordering::SeqCst);
        self.open_transactions.store(0, Ordering::SeqCst);
        self.reset_uncommitted();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Distributed transaction verbs
    // -----------------------------------------------------------------------

    fn distributed(&mut self) -> Result<&mut DistributedTransaction, DtxError> {
        self.transaction
            .as_distributed_mut()
            .ok_or(DtxError::NotSelected)
    }

    pub fn start_dtx(&mut self, xid: Xid, join: bool, resume: bool) -> Result<(), DtxError> {
        self.distributed()?.start(xid, join, resume)
    }

    pub fn end_dtx(&mut self, xid: &Xid, fail: bool, suspend: bool) -> Result<(), DtxError> {
        self.distributed()?.end(xid, fail, suspend)
    }

    pub fn prepare_dtx(&self, xid: &Xid) -> Result<(), DtxError> {
        self.dtx.prepare(xid)
    }

    pub fn commit_dtx(&self, xid: &Xid, one_phase: bool) -> Result<(), DtxError> {
        self.dtx.commit(xid, one_phase)
    }

    pub fn rollback_dtx(&self, xid: &Xid) -> Result<(), DtxError> {
        self.dtx.rollback(xid)
    }

    pub fn forget_dtx(&self, xid: &Xid) -> Result<(), DtxError> {
        self.dtx.forget(xid)
    }

    pub fn recover_dtx(&self) -> Vec<Xid> {
        self.dtx.recover()
    }

    pub fn get_dtx_timeout(&self, xid: &Xid) -> Result<Duration, DtxError> {
        self.dtx.get_timeout(xid)
    }

    pub fn set_dtx_timeout(&self, xid: &Xid, timeout: Duration) -> Result<(), DtxError> {
        self.dtx.set_timeout(xid, timeout)
    }

    // -----------------------------------------------------------------------
    // I/O pass
    // -----------------------------------------------------------------------

    /// One pass of the connection's I/O loop: flush the wire-visible flow
    /// state, complete ready async commands, and advance one consumer with
    /// pending work. Returns whether more work remains.
    pub fn process_pending(&mut self) -> Result<bool, StoreError> {
        if self.closed {
            return Ok(false);
        }

        let desired_blocking = self.credit.blocking();
        if desired_blocking != self.wire_blocking {
            self.wire_blocking = desired_blocking;
            if desired_blocking {
                self.wire.flow_stop();
                self.credit.mark_wire_blocked(self.clock.now());
            } else {
                self.credit.reset_to_unlimited();
                self.wire.flow_resume(UNLIMITED_CREDIT);
                self.credit.mark_wire_unblocked();
            }
        }

        self.commands.complete_ready()?;

        let consumer_list_needs_refreshing = if self.pending_consumers.is_empty() {
            self.pending_consumers.extend(
                self.subscriptions
                    .values()
                    .map(|entry| Arc::clone(&entry.target)),
            );
            false
        } else {
            true
        };

        let mut consumer_has_more_work = false;
        while let Some(target) = self.pending_consumers.pop_front() {
            if target.has_pending_work() {
                consumer_has_more_work = true;
                target.process_pending();
                break;
            }
        }

        Ok(consumer_has_more_work || consumer_list_needs_refreshing)
    }

    /// Flush consumer credit state and block until every outstanding store
    /// acknowledgement has completed.
    pub fn received_complete(&mut self) -> Result<(), StoreError> {
        for entry in self.subscriptions.values() {
            entry.target.flush_credit_state();
        }
        self.commands.drain()
    }

    // -----------------------------------------------------------------------
    // Close
    // -----------------------------------------------------------------------

    /// Close the session. `forced` carries a reason code and message for a
    /// forced close. Idempotent.
    ///
    /// Teardown order: group assignments are released and consumers closed,
    /// outstanding deliveries are released flagged for redelivery, the
    /// bound transaction is rolled back (local) or disassociated
    /// (distributed), and the command queue is drained - so no dangling
    /// reference to the session remains when this returns.
    pub fn close(&mut self, forced: Option<(u16, String)>) {
        if self.closed {
            return;
        }
        self.closing.store(true, Ordering::SeqCst);

        let subscriptions: Vec<SubscriptionEntry> =
            self.subscriptions.drain().map(|(_, entry)| entry).collect();
        for entry in &subscriptions {
            if let Some(groups) = &entry.groups {
                groups.clear_assignments(entry.target.consumer_id());
            }
        }
        for entry in &subscriptions {
            entry.target.close();
            for listener in &self.consumer_listeners {
                listener.consumer_removed(entry.target.name());
            }
        }
        self.pending_consumers.clear();

        for mut listener in self.dispositions.drain() {
            listener.on_release(true);
        }

        match self.transaction.kind() {
            TxnKind::Local => {
                let _ = self.transaction.rollback();
            }
            TxnKind::Distributed => self.dtx.end_associations(self.id),
            TxnKind::AutoCommit => {}
        }
        self.open_transactions.store(0, Ordering::SeqCst);
        self.reset_uncommitted();

        if let Err(err) = self.commands.drain() {
            tracing::error!(
                session = %self.log_subject,
                %err,
                "store acknowledgement failed while draining at session close"
            );
        }

        for task in self.delete_tasks.drain(..) {
            task();
        }

        match forced {
            Some((code, message)) => audit::emit(
                audit::CHANNEL_CLOSE_FORCED,
                &self.log_subject,
                &format!("code={code} message={message}"),
            ),
            None => audit::emit(audit::CHANNEL_CLOSE, &self.log_subject, "session closed"),
        }
        self.closed = true;
    }
}
