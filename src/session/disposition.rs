//! Delivery disposition tracking.
//!
//! Every message sent to a consumer is tracked here under its session-scoped
//! delivery id until the client settles it (accept, release, reject) or the
//! session closes. Clients settle by id ranges; ranges arrive in ascending,
//! non-overlapping order per the protocol's own rule, but resolution must
//! tolerate malformed input without settling anything twice.

use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Per-delivery settlement callbacks.
///
/// One listener is registered per delivery; it is removed from tracking and
/// invoked exactly once when the client settles the delivery, or released
/// with the redelivery flag when the session closes underneath it.
pub trait DispositionListener: Send {
    fn on_accept(&mut self);

    fn on_release(&mut self, set_redelivered: bool);

    fn on_reject(&mut self);

    /// Whether the delivery can be exclusively acquired (browsing
    /// semantics). Must not mutate settlement state.
    fn acquire(&self) -> bool;
}

/// Client verdict applied to a range of deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Accept,
    Release { set_redelivered: bool },
    Reject,
}

/// Inclusive range of delivery ids from a disposition frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispositionRange {
    pub lower: u64,
    pub upper: u64,
}

impl DispositionRange {
    pub fn new(lower: u64, upper: u64) -> Self {
        Self { lower, upper }
    }

    pub fn single(id: u64) -> Self {
        Self {
            lower: id,
            upper: id,
        }
    }

    pub fn contains(&self, id: u64) -> bool {
        self.lower <= id && id <= self.upper
    }
}

/// Ordered map of pending deliveries awaiting settlement.
///
/// Ids are assigned by the session controller in strictly increasing order,
/// so `record` always appends at the tail; resolution walks pending ids and
/// ranges in a single linear merge.
#[derive(Default)]
pub struct DispositionTracker {
    pending: Mutex<BTreeMap<u64, Box<dyn DispositionListener>>>,
}

impl DispositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly issued delivery.
    pub fn record(&self, id: u64, listener: Box<dyn DispositionListener>) {
        self.pending.lock().insert(id, listener);
    }

    /// Retract a listener, e.g. when a transfer fails mid-send.
    pub fn remove(&self, id: u64) -> Option<Box<dyn DispositionListener>> {
        self.pending.lock().remove(&id)
    }

    /// Settle every pending delivery matched by `ranges`, returning how many
    /// were settled. Matched listeners are removed before invocation, so a
    /// delivery settles at most once even across overlapping ranges.
    pub fn resolve(&self, ranges: &[DispositionRange], disposition: Disposition) -> usize {
        let matched = self.take_matched(ranges);
        let settled = matched.len();
        for mut listener in matched {
            Self::settle(listener.as_mut(), disposition);
        }
        settled
    }

    /// Ask each matched delivery whether it can be exclusively acquired,
    /// without removing anything. Returns the ids that acquired.
    pub fn acquire(&self, ranges: &[DispositionRange]) -> Vec<u64> {
        let mut acquired = Vec::new();
        let pending = self.pending.lock();
        if pending.is_empty() || ranges.is_empty() {
            return acquired;
        }

        let mut range_iter = ranges.iter();
        let mut current = range_iter.next();
        for (&id, listener) in pending.iter() {
            while let Some(range) = current {
                if id > range.upper {
                    current = range_iter.next();
                } else {
                    break;
                }
            }
            let Some(range) = current else { break };
            if range.contains(id) && listener.acquire() {
                acquired.push(id);
            }
        }
        acquired
    }

    /// Remove and return every pending listener, oldest first. Used at
    /// session close to release all outstanding deliveries.
    pub fn drain(&self) -> Vec<Box<dyn DispositionListener>> {
        let mut pending = self.pending.lock();
        let drained = std::mem::take(&mut *pending);
        drained.into_values().collect()
    }

    /// Number of deliveries still awaiting settlement.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn settle(listener: &mut dyn DispositionListener, disposition: Disposition) {
        match disposition {
            Disposition::Accept => listener.on_accept(),
            Disposition::Release { set_redelivered } => listener.on_release(set_redelivered),
            Disposition::Reject => listener.on_reject(),
        }
    }

    /// Remove matched listeners under the lock; callbacks run outside it.
    fn take_matched(&self, ranges: &[DispositionRange]) -> Vec<Box<dyn DispositionListener>> {
        let mut matched = Vec::new();
        let mut pending = self.pending.lock();
        if pending.is_empty() || ranges.is_empty() {
            return matched;
        }

        if ranges.len() == 1 {
            // Common case: one range settles a contiguous run of ids.
            let range = ranges[0];
            let ids: Vec<u64> = pending
                .range(range.lower..=range.upper)
                .map(|(&id, _)| id)
                .collect();
            for id in ids {
                if let Some(listener) = pending.remove(&id) {
                    matched.push(listener);
                }
            }
            return matched;
        }

        // General case: merge the ordered id walk with the range list. The
        // range list is expected ascending and non-overlapping; if it is
        // not, the walk still terminates once either side is exhausted.
        let ids: Vec<u64> = pending.keys().copied().collect();
        let mut range_iter = ranges.iter();
        let mut current = range_iter.next();
        for id in ids {
            while let Some(range) = current {
                if id > range.upper {
                    current = range_iter.next();
                } else {
                    break;
                }
            }
            let Some(range) = current else { break };
            if range.contains(id) {
                if let Some(listener) = pending.remove(&id) {
                    matched.push(listener);
                }
            }
        }
        matched
    }
}
