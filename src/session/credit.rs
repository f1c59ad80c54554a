//! Credit-based flow control and producer backpressure.
//!
//! A session blocks when any cause (a full queue, or the session itself) is
//! present in its blocking-cause set and unblocks when the set empties; the
//! wire-visible flow state lags behind and is flushed by the session's
//! `process_pending` pass. Producer credit is a saturating counter that is
//! topped up proactively before exhaustion so a healthy producer never
//! stalls mid-stream.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Sentinel meaning the producer window is not being counted.
pub const UNLIMITED_CREDIT: u64 = u64::MAX;

/// Why a session is blocked. Causes are tagged values, not object
/// identities, so the same queue blocking twice collapses into one cause.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BlockCause {
    /// A specific queue reported it is over capacity.
    Queue(String),
    /// The session itself (all queues) is blocked.
    Session,
}

impl BlockCause {
    /// Human-readable cause name for audit events.
    pub fn describe(&self) -> &str {
        match self {
            BlockCause::Queue(name) => name,
            BlockCause::Session => "** All Queues **",
        }
    }
}

/// Tracks outstanding producer credit and consumer blocking state.
///
/// Safe for concurrent use: the cause set is guarded, credit and the
/// blocking flag are atomics. The wire-block timestamp is only written by
/// the session's I/O thread but may be read from management threads.
pub struct CreditController {
    outstanding: AtomicU64,
    low_water: u64,
    topup: u64,
    blocking: AtomicBool,
    causes: Mutex<HashSet<BlockCause>>,
    wire_blocked_since: Mutex<Option<Instant>>,
    enforcement_timeout: Duration,
}

impl CreditController {
    pub fn new(low_water: u64, topup: u64, enforcement_timeout: Duration) -> Self {
        Self {
            outstanding: AtomicU64::new(UNLIMITED_CREDIT),
            low_water,
            topup,
            blocking: AtomicBool::new(false),
            causes: Mutex::new(HashSet::new()),
            wire_blocked_since: Mutex::new(None),
            enforcement_timeout,
        }
    }

    // -----------------------------------------------------------------------
    // Blocking causes
    // -----------------------------------------------------------------------

    /// Add a blocking cause. Returns true when this was the first cause,
    /// i.e. the session just transitioned into the blocked state.
    pub fn block(&self, cause: BlockCause) -> bool {
        let mut causes = self.causes.lock();
        if causes.insert(cause) {
            return self
                .blocking
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok();
        }
        false
    }

    /// Remove a blocking cause. Returns true when the set became empty,
    /// i.e. the session just transitioned out of the blocked state.
    pub fn unblock(&self, cause: &BlockCause) -> bool {
        let mut causes = self.causes.lock();
        if causes.remove(cause) && causes.is_empty() {
            return self
                .blocking
                .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok();
        }
        false
    }

    /// Desired blocking state: true iff the cause set is non-empty.
    pub fn blocking(&self) -> bool {
        self.blocking.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Wire block timing
    // -----------------------------------------------------------------------

    /// Stamp the moment flow-stop actually reached the wire.
    pub fn mark_wire_blocked(&self, now: Instant) {
        *self.wire_blocked_since.lock() = Some(now);
    }

    pub fn mark_wire_unblocked(&self) {
        *self.wire_blocked_since.lock() = None;
    }

    /// Whether the wire-visible block has outlasted the enforcement
    /// timeout, entitling the caller to force-close the producer session.
    /// A zero timeout disables enforcement.
    pub fn blocking_timeout_exceeded(&self, now: Instant) -> bool {
        if self.enforcement_timeout.is_zero() {
            return false;
        }
        let since = *self.wire_blocked_since.lock();
        matches!(since, Some(at) if now.duration_since(at) > self.enforcement_timeout)
    }

    // -----------------------------------------------------------------------
    // Producer credit
    // -----------------------------------------------------------------------

    /// Set a finite producer credit window.
    pub fn set_credit(&self, credit: u64) {
        self.outstanding.store(credit, Ordering::SeqCst);
    }

    /// Stop counting the producer window.
    pub fn reset_to_unlimited(&self) {
        self.outstanding.store(UNLIMITED_CREDIT, Ordering::SeqCst);
    }

    pub fn outstanding_credit(&self) -> u64 {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn is_unlimited(&self) -> bool {
        self.outstanding_credit() == UNLIMITED_CREDIT
    }

    /// Consume one unit of producer credit.
    ///
    /// Saturates at zero under concurrent decrements. Crossing the
    /// low-water mark tops the counter up and returns the extension the
    /// caller must advertise to the producer; this is a throughput
    /// optimization, not a correctness requirement.
    pub fn consume_credit(&self) -> Option<u64> {
        let prev = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |credit| {
                if credit == UNLIMITED_CREDIT {
                    None
                } else {
                    Some(credit.saturating_sub(1))
                }
            });
        match prev {
            // Unlimited: nothing to count.
            Err(_) => None,
            Ok(prev) => {
                let remaining = prev.saturating_sub(1);
                if remaining == self.low_water {
                    self.outstanding.fetch_add(self.topup, Ordering::SeqCst);
                    Some(self.topup)
                } else {
                    None
                }
            }
        }
    }
}
