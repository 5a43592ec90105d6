//! ## strom-core::deadline
//! **Per-unit deadline queue**
//!
//! An ordered collection of pending deadlines keyed by absolute time. Ties
//! are broken by insertion order, so entries with equal deadlines pop FIFO.
//! A secondary index by owner makes cancelling a connection's timers cheap
//! when it is finalised.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use strom_proto::{ConnectionId, PacketNumber};

use crate::time::Timestamp;

/// What a deadline belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerOwner {
    Connection(ConnectionId),
    /// The unit's own housekeeping.
    Maintenance,
}

/// Why a deadline was armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerCause {
    Retransmit(PacketNumber),
    Idle,
    Maintenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineEntry {
    pub at: Timestamp,
    pub owner: TimerOwner,
    pub cause: TimerCause,
}

/// Position of an entry in the queue: deadline, then insertion sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerKey {
    at: Timestamp,
    seq: u64,
}

#[derive(Debug, Default)]
pub struct DeadlineQueue {
    entries: BTreeMap<TimerKey, DeadlineEntry>,
    by_owner: HashMap<TimerOwner, BTreeSet<TimerKey>>,
    next_seq: u64,
}

impl DeadlineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, owner: TimerOwner, at: Timestamp, cause: TimerCause) -> TimerKey {
        let key = TimerKey {
            at,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.entries.insert(key, DeadlineEntry { at, owner, cause });
        self.by_owner.entry(owner).or_default().insert(key);
        key
    }

    /// The earliest entry, without removing it.
    pub fn peek(&self) -> Option<&DeadlineEntry> {
        self.entries.first_key_value().map(|(_, entry)| entry)
    }

    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.peek().map(|entry| entry.at)
    }

    /// Removes and returns the earliest entry if it is due at `now`.
    pub fn pop_next_due(&mut self, now: Timestamp) -> Option<DeadlineEntry> {
        let (key, entry) = self.entries.first_key_value()?;
        if entry.at > now {
            return None;
        }
        let key = *key;
        let entry = self.entries.remove(&key)?;
        self.unindex(entry.owner, &key);
        Some(entry)
    }

    /// Removes every entry due at `now`, earliest first.
    pub fn pop_due(&mut self, now: Timestamp) -> Vec<DeadlineEntry> {
        std::iter::from_fn(|| self.pop_next_due(now)).collect()
    }

    /// Removes the entry armed under `key`, if still queued.
    pub fn cancel(&mut self, key: TimerKey) -> Option<DeadlineEntry> {
        let entry = self.entries.remove(&key)?;
        self.unindex(entry.owner, &key);
        Some(entry)
    }

    /// Removes every entry for `owner`. Returns how many were removed.
    pub fn remove(&mut self, owner: TimerOwner) -> usize {
        let Some(keys) = self.by_owner.remove(&owner) else {
            return 0;
        };
        for key in &keys {
            self.entries.remove(key);
        }
        keys.len()
    }

    /// Removes the entries for `owner` armed with `cause`.
    pub fn remove_cause(&mut self, owner: TimerOwner, cause: TimerCause) -> usize {
        let Some(keys) = self.by_owner.get_mut(&owner) else {
            return 0;
        };
        let entries = &mut self.entries;
        let before = keys.len();
        keys.retain(|key| match entries.get(key) {
            Some(entry) if entry.cause == cause => {
                entries.remove(key);
                false
            }
            _ => true,
        });
        let removed = before - keys.len();
        if keys.is_empty() {
            self.by_owner.remove(&owner);
        }
        removed
    }

    pub fn contains(&self, owner: TimerOwner, cause: TimerCause) -> bool {
        self.by_owner.get(&owner).is_some_and(|keys| {
            keys.iter()
                .any(|key| self.entries.get(key).is_some_and(|e| e.cause == cause))
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeadlineEntry> {
        self.entries.values()
    }

    fn unindex(&mut self, owner: TimerOwner, key: &TimerKey) {
        if let Some(keys) = self.by_owner.get_mut(&owner) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_owner.remove(&owner);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cid(raw: u64) -> TimerOwner {
        TimerOwner::Connection(ConnectionId::new(raw).unwrap())
    }

    fn ms(v: u64) -> Timestamp {
        Timestamp::from_millis(v)
    }

    #[test]
    fn equal_deadlines_pop_in_insertion_order() {
        let mut queue = DeadlineQueue::new();
        queue.insert(cid(1), ms(5), TimerCause::Idle);
        queue.insert(cid(2), ms(3), TimerCause::Retransmit(0));
        queue.insert(cid(3), ms(3), TimerCause::Retransmit(1));
        queue.insert(cid(4), ms(9), TimerCause::Idle);

        let due = queue.pop_due(ms(4));
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].owner, cid(2));
        assert_eq!(due[1].owner, cid(3));
        assert_eq!(queue.next_deadline(), Some(ms(5)));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn empty_queue_has_no_deadline() {
        let mut queue = DeadlineQueue::new();
        assert!(queue.peek().is_none());
        assert!(queue.pop_next_due(ms(100)).is_none());
        assert!(queue.pop_due(ms(100)).is_empty());
    }

    #[test]
    fn deadline_equal_to_now_is_due() {
        let mut queue = DeadlineQueue::new();
        queue.insert(TimerOwner::Maintenance, ms(7), TimerCause::Maintenance);
        assert!(queue.pop_next_due(ms(6)).is_none());
        assert!(queue.pop_next_due(ms(7)).is_some());
    }

    #[test]
    fn remove_by_owner_and_cause() {
        let mut queue = DeadlineQueue::new();
        queue.insert(cid(1), ms(1), TimerCause::Retransmit(0));
        queue.insert(cid(1), ms(2), TimerCause::Retransmit(1));
        queue.insert(cid(1), ms(3), TimerCause::Idle);
        queue.insert(cid(2), ms(4), TimerCause::Idle);

        assert_eq!(queue.remove_cause(cid(1), TimerCause::Retransmit(0)), 1);
        assert!(!queue.contains(cid(1), TimerCause::Retransmit(0)));
        assert!(queue.contains(cid(1), TimerCause::Retransmit(1)));
        assert_eq!(queue.next_deadline(), Some(ms(2)));

        assert_eq!(queue.remove(cid(1)), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.remove(cid(1)), 0);
        assert_eq!(queue.peek().map(|e| e.owner), Some(cid(2)));
    }

    #[test]
    fn cancel_by_key() {
        let mut queue = DeadlineQueue::new();
        let key = queue.insert(cid(1), ms(1), TimerCause::Idle);
        assert!(queue.cancel(key).is_some());
        assert!(queue.cancel(key).is_none());
        assert!(queue.is_empty());
    }

    proptest! {
        #[test]
        fn pops_in_deadline_then_insertion_order(
            deadlines in proptest::collection::vec(0u64..50, 0..64),
            now in 0u64..60,
        ) {
            let mut queue = DeadlineQueue::new();
            for (i, d) in deadlines.iter().enumerate() {
                queue.insert(TimerOwner::Maintenance, ms(*d), TimerCause::Retransmit(i as u32));
            }

            let mut expected: Vec<(u64, u32)> = deadlines
                .iter()
                .enumerate()
                .filter(|(_, d)| **d <= now)
                .map(|(i, d)| (*d, i as u32))
                .collect();
            expected.sort();

            let popped: Vec<(u64, u32)> = queue
                .pop_due(ms(now))
                .into_iter()
                .map(|e| match e.cause {
                    TimerCause::Retransmit(i) => (e.at.as_millis(), i),
                    _ => unreachable!(),
                })
                .collect();
            prop_assert_eq!(popped, expected);
            prop_assert!(queue.iter().all(|e| e.at > ms(now)));
        }
    }
}
