//! Sticky consumer assignment for grouped messages.
//!
//! Messages carrying the same group header value are pinned to a single
//! consumer for the lifetime of the group, preserving ordering within the
//! group without serializing unrelated messages. Group keys hash into a
//! fixed power-of-two bucket array; distinct keys sharing a bucket share an
//! owner (false sharing), trading perfect isolation for O(1),
//! allocation-free assignment.

use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;
use twox_hash::XxHash64;

use crate::store::ConsumerId;

/// A queued entry as seen by group assignment.
pub trait GroupedEntry {
    /// Value of the named grouping header, if the message carries one.
    fn group_header(&self, key: &str) -> Option<String>;

    /// Whether the entry is still available (not yet acquired).
    fn is_available(&self) -> bool;

    /// Attempt exclusive acquisition for the consumer.
    fn acquire(&self, consumer: ConsumerId) -> bool;
}

const UNOWNED: u64 = 0;

/// Assigns message groups to consumers via a CAS-claimed bucket array.
///
/// A bucket has at most one owning consumer at a time; ownership is claimed
/// the first time a message in the bucket is offered and released only by
/// `clear_assignments` (consumer close), never by message settlement.
pub struct MessageGroupManager {
    header_key: String,
    mask: u64,
    slots: Vec<AtomicU64>,
}

impl MessageGroupManager {
    /// `max_groups` is rounded up to the next power of two for bucket
    /// indexing.
    pub fn new(header_key: impl Into<String>, max_groups: usize) -> Self {
        let buckets = max_groups.max(1).next_power_of_two();
        let mut slots = Vec::with_capacity(buckets);
        for _ in 0..buckets {
            slots.push(AtomicU64::new(UNOWNED));
        }
        Self {
            header_key: header_key.into(),
            mask: buckets as u64 - 1,
            slots,
        }
    }

    pub fn header_key(&self) -> &str {
        &self.header_key
    }

    pub fn bucket_count(&self) -> usize {
        self.slots.len()
    }

    fn bucket(&self, group: &str) -> usize {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(group.as_bytes());
        (hasher.finish() & self.mask) as usize
    }

    /// Read-only admission check: may this consumer take the entry?
    /// Unkeyed messages go to anyone; keyed messages only to the bucket
    /// owner, or to anyone while the bucket is unowned.
    pub fn might_assign(&self, entry: &dyn GroupedEntry, consumer: ConsumerId) -> bool {
        match entry.group_header(&self.header_key) {
            None => true,
            Some(group) => {
                let owner = self.slots[self.bucket(&group)].load(Ordering::SeqCst);
                owner == UNOWNED || owner == consumer.0
            }
        }
    }

    /// Claim the entry's group for the consumer. Of several consumers
    /// racing for an unowned bucket, exactly one wins.
    pub fn assign(&self, consumer: ConsumerId, entry: &dyn GroupedEntry) -> bool {
        debug_assert!(consumer.0 != UNOWNED, "consumer ids must be nonzero");
        match entry.group_header(&self.header_key) {
            None => true,
            Some(group) => {
                let slot = &self.slots[self.bucket(&group)];
                let owner = slot.load(Ordering::SeqCst);
                if owner == consumer.0 {
                    return true;
                }
                if owner != UNOWNED {
                    return false;
                }
                match slot.compare_exchange(
                    UNOWNED,
                    consumer.0,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => {
                        debug!(group = %group, consumer = consumer.0, "assigned message group");
                        true
                    }
                    Err(current) => current == consumer.0,
                }
            }
        }
    }

    /// Assign and acquire in one step. A lost claim race leaves the entry
    /// unacquired, so it is never falsely marked accepted.
    pub fn accept_message(&self, consumer: ConsumerId, entry: &dyn GroupedEntry) -> bool {
        self.assign(consumer, entry) && entry.acquire(consumer)
    }

    /// First available entry, in delivery order, whose group is assigned to
    /// the consumer. Used to resume delivery to a consumer that already
    /// owns a group after a pause.
    pub fn find_earliest_assigned_available_entry<'a, E>(
        &self,
        consumer: ConsumerId,
        entries: impl IntoIterator<Item = &'a E>,
    ) -> Option<&'a E>
    where
        E: GroupedEntry + 'a,
    {
        entries.into_iter().find(|entry| {
            if !entry.is_available() {
                return false;
            }
            match entry.group_header(&self.header_key) {
                None => false,
                Some(group) => {
                    self.slots[self.bucket(&group)].load(Ordering::SeqCst) == consumer.0
                }
            }
        })
    }

    /// Release every bucket owned by the consumer. This is the only path
    /// that frees a bucket.
    pub fn clear_assignments(&self, consumer: ConsumerId) {
        for slot in &self.slots {
            let _ = slot.compare_exchange(
                consumer.0,
                UNOWNED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
    }

    /// Current owner of the group's bucket, if any.
    pub fn assigned_consumer(&self, group: &str) -> Option<ConsumerId> {
        let owner = self.slots[self.bucket(group)].load(Ordering::SeqCst);
        if owner == UNOWNED {
            None
        } else {
            Some(ConsumerId(owner))
        }
    }
}
