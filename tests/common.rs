//! Common stub collaborators for integration tests.
//!
//! Provides recording implementations of the session engine's external
//! interfaces: wire handle, consumer target, queue entry, message handle
//! and destination. All state is observable so tests can assert on what
//! reached "the wire", "the queue" and "the store".

// Not all test files use all helpers; silence dead_code warnings for unused
// exports.
#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use amphora::{
    CapacityAlert, Clock, ConsumerId, ConsumerTarget, DispositionListener, DtxRegistry,
    ManualClock, MemoryStore, MessageDestination, MessageHandle, QueueEntryHandle, SessionConfig,
    SessionController, Transaction, TxnAction, TxnError, WireHandle,
};

static CONN_SEQ: AtomicUsize = AtomicUsize::new(0);

/// Unique connection name so audit assertions filtered by log subject never
/// see another test's events.
pub fn unique_connection_name(prefix: &str) -> String {
    format!("{prefix}-{}", CONN_SEQ.fetch_add(1, Ordering::SeqCst))
}

/// Install a subscriber once so `RUST_LOG=audit=info cargo test` shows the
/// engine's audit events.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// Wire handle
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingWire {
    pub notifies: AtomicUsize,
    pub flow_stops: AtomicUsize,
    pub flow_resumes: AtomicUsize,
    pub credit_grants: Mutex<Vec<u64>>,
    pub close_requests: Mutex<Vec<(u16, String)>>,
}

impl WireHandle for RecordingWire {
    fn notify_work(&self) {
        self.notifies.fetch_add(1, Ordering::SeqCst);
    }

    fn flow_stop(&self) {
        self.flow_stops.fetch_add(1, Ordering::SeqCst);
    }

    fn flow_resume(&self, _credit: u64) {
        self.flow_resumes.fetch_add(1, Ordering::SeqCst);
    }

    fn grant_credit(&self, amount: u64) {
        self.credit_grants.lock().push(amount);
    }

    fn request_close(&self, code: u16, reason: &str) {
        self.close_requests.lock().push((code, reason.to_string()));
    }
}

// ---------------------------------------------------------------------------
// Consumer target
// ---------------------------------------------------------------------------

pub struct TestTarget {
    name: String,
    id: ConsumerId,
    pub pending: AtomicUsize,
    pub processed: AtomicUsize,
    pub flushed: AtomicUsize,
    pub stopped: AtomicBool,
    pub closed: AtomicBool,
}

impl TestTarget {
    pub fn new(name: &str, id: u64, pending: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            id: ConsumerId(id),
            pending: AtomicUsize::new(pending),
            processed: AtomicUsize::new(0),
            flushed: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }
}

impl ConsumerTarget for TestTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn consumer_id(&self) -> ConsumerId {
        self.id
    }

    fn has_pending_work(&self) -> bool {
        self.pending.load(Ordering::SeqCst) > 0
    }

    fn process_pending(&self) -> bool {
        let remaining = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| {
                Some(p.saturating_sub(1))
            })
            .unwrap();
        self.processed.fetch_add(1, Ordering::SeqCst);
        remaining > 1
    }

    fn flush_credit_state(&self) {
        self.flushed.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Messages and queue entries
// ---------------------------------------------------------------------------

pub struct TestMessage {
    id: u64,
    size: u64,
    pub flowed_to_disk: AtomicBool,
}

impl TestMessage {
    pub fn new(id: u64, size: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            size,
            flowed_to_disk: AtomicBool::new(false),
        })
    }
}

impl MessageHandle for TestMessage {
    fn message_id(&self) -> u64 {
        self.id
    }

    fn content_size(&self) -> u64 {
        self.size
    }

    fn flow_to_disk(&self) {
        self.flowed_to_disk.store(true, Ordering::SeqCst);
    }
}

pub struct TestEntry {
    queue: String,
    message_id: u64,
    pub available: AtomicBool,
    pub unstealable: AtomicBool,
    pub deleted: AtomicBool,
    pub redelivered: AtomicBool,
    pub released: AtomicBool,
    pub rejected: AtomicBool,
}

impl TestEntry {
    pub fn new(queue: &str, message_id: u64) -> Arc<Self> {
        Arc::new(Self {
            queue: queue.to_string(),
            message_id,
            available: AtomicBool::new(true),
            unstealable: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            redelivered: AtomicBool::new(false),
            released: AtomicBool::new(false),
            rejected: AtomicBool::new(false),
        })
    }
}

impl QueueEntryHandle for TestEntry {
    fn queue(&self) -> String {
        self.queue.clone()
    }

    fn message_id(&self) -> u64 {
        self.message_id
    }

    fn make_unstealable(&self, _consumer: ConsumerId) -> bool {
        self.unstealable.store(true, Ordering::SeqCst);
        true
    }

    fn delete(&self) {
        self.deleted.store(true, Ordering::SeqCst);
        self.available.store(false, Ordering::SeqCst);
    }

    fn set_redelivered(&self) {
        self.redelivered.store(true, Ordering::SeqCst);
    }

    fn release(&self, _consumer: ConsumerId) {
        self.released.store(true, Ordering::SeqCst);
        self.available.store(true, Ordering::SeqCst);
    }
}

/// Disposition listener wired to a queue entry, the way a consumer target
/// registers deliveries.
pub struct EntryListener {
    pub entry: Arc<TestEntry>,
}

impl DispositionListener for EntryListener {
    fn on_accept(&mut self) {
        self.entry.delete();
    }

    fn on_release(&mut self, set_redelivered: bool) {
        if set_redelivered {
            self.entry.set_redelivered();
        }
        self.entry.release(ConsumerId(0));
    }

    fn on_reject(&mut self) {
        self.entry.rejected.store(true, Ordering::SeqCst);
        self.entry.available.store(false, Ordering::SeqCst);
    }

    fn acquire(&self) -> bool {
        self.entry.available.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Destination
// ---------------------------------------------------------------------------

/// Routes every message to a single queue, recording which message ids were
/// committed or rolled back, and optionally reporting the queue over
/// capacity after each enqueue.
pub struct TestDestination {
    queue: String,
    over_capacity: AtomicBool,
    pub committed: Arc<Mutex<Vec<u64>>>,
    pub rolled_back: Arc<Mutex<Vec<u64>>>,
}

impl TestDestination {
    pub fn new(queue: &str) -> Self {
        Self {
            queue: queue.to_string(),
            over_capacity: AtomicBool::new(false),
            committed: Arc::new(Mutex::new(Vec::new())),
            rolled_back: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn set_over_capacity(&self, over: bool) {
        self.over_capacity.store(over, Ordering::SeqCst);
    }
}

impl MessageDestination for TestDestination {
    fn name(&self) -> String {
        self.queue.clone()
    }

    fn send(
        &self,
        message: &Arc<dyn MessageHandle>,
        txn: &mut dyn Transaction,
        capacity: &mut dyn FnMut(CapacityAlert),
    ) -> Result<usize, TxnError> {
        let id = message.message_id();
        let committed = Arc::clone(&self.committed);
        let rolled_back = Arc::clone(&self.rolled_back);
        txn.enqueue(
            &self.queue,
            message,
            TxnAction::new(
                move || committed.lock().push(id),
                move || rolled_back.lock().push(id),
            ),
        )?;
        capacity(CapacityAlert {
            queue: self.queue.clone(),
            over_capacity: self.over_capacity.load(Ordering::SeqCst),
        });
        Ok(1)
    }
}

// ---------------------------------------------------------------------------
// Session fixture
// ---------------------------------------------------------------------------

pub struct SessionFixture {
    pub wire: Arc<RecordingWire>,
    pub store: MemoryStore,
    pub clock: ManualClock,
    pub dtx: Arc<DtxRegistry>,
    pub session: SessionController,
}

pub fn session_fixture(prefix: &str) -> SessionFixture {
    session_fixture_with(prefix, SessionConfig::default())
}

pub fn session_fixture_with(prefix: &str, config: SessionConfig) -> SessionFixture {
    init_tracing();
    let wire = Arc::new(RecordingWire::default());
    let store = MemoryStore::new();
    let clock = ManualClock::new();
    let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
    let dtx = Arc::new(DtxRegistry::new(
        Arc::new(store.clone()),
        Arc::clone(&clock_arc),
        config.default_dtx_timeout(),
        config.max_dtx_timeout(),
    ));
    let session = SessionController::new(
        &unique_connection_name(prefix),
        1,
        "guest",
        Arc::clone(&wire) as Arc<dyn WireHandle>,
        Arc::new(store.clone()),
        Arc::clone(&dtx),
        clock_arc,
        &config,
    );
    SessionFixture {
        wire,
        store,
        clock,
        dtx,
        session,
    }
}

/// A second session sharing the fixture's dtx registry and store, for
/// cross-session dtx association tests.
pub fn sibling_session(fx: &SessionFixture, prefix: &str) -> SessionController {
    SessionController::new(
        &unique_connection_name(prefix),
        2,
        "guest",
        Arc::clone(&fx.wire) as Arc<dyn WireHandle>,
        Arc::new(fx.store.clone()),
        Arc::clone(&fx.dtx),
        Arc::new(fx.clock.clone()) as Arc<dyn Clock>,
        &SessionConfig::default(),
    )
}
