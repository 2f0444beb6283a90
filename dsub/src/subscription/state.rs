//! Message lifecycle of one subscription on one destination.
//!
//! Every id the subscription has seen is in exactly one of three partitions, or absent:
//!
//! - at-rest: registered, not yet sent
//! - in-flight: handed to the session, waiting to be committed or rolled back
//! - committed: done; drained by the destination for garbage collection
//!
//! Ids are assigned by the destination in increasing order, so ascending id order is the
//! registration order. Rolled back ids return to their original place in that order.

use std::collections::BTreeSet;

use crate::message::Message;
use crate::types::{DestinationName, MessageId};

#[derive(Debug)]
pub struct MessageStateManager {
    name: DestinationName,
    at_rest: BTreeSet<MessageId>,
    in_flight: BTreeSet<MessageId>,
    committed: BTreeSet<MessageId>,
}

impl MessageStateManager {
    pub fn new(name: DestinationName) -> Self {
        Self { name, at_rest: BTreeSet::new(), in_flight: BTreeSet::new(), committed: BTreeSet::new() }
    }

    /// Browser subscriptions start from a snapshot of what the destination already holds.
    pub fn with_ids<I: IntoIterator<Item = MessageId>>(name: DestinationName, ids: I) -> Self {
        let mut s = Self::new(name);
        s.at_rest.extend(ids);
        s
    }

    #[inline]
    pub fn register(&mut self, msg: &Message) -> bool {
        self.register_id(msg.id)
    }

    /// False if the id is already at rest or in flight.
    #[inline]
    pub fn register_id(&mut self, id: MessageId) -> bool {
        if self.in_flight.contains(&id) {
            return false;
        }
        self.committed.remove(&id);
        self.at_rest.insert(id)
    }

    /// Move an id from at-rest to in-flight.
    #[inline]
    pub fn allocate(&mut self, id: MessageId) -> bool {
        if self.at_rest.remove(&id) {
            self.in_flight.insert(id);
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn commit(&mut self, id: MessageId) -> bool {
        if self.in_flight.remove(&id) {
            self.committed.insert(id);
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn rollback(&mut self, id: MessageId) -> bool {
        if self.in_flight.remove(&id) {
            self.at_rest.insert(id);
            true
        } else {
            false
        }
    }

    /// Forget an id whose content can no longer be resolved.
    #[inline]
    pub fn expired(&mut self, id: MessageId) -> bool {
        let a = self.at_rest.remove(&id);
        let b = self.in_flight.remove(&id);
        let c = self.committed.remove(&id);
        a || b || c
    }

    /// Returns how many ids were moved back.
    #[inline]
    pub fn rollback_in_flight_messages(&mut self) -> usize {
        let n = self.in_flight.len();
        if n > 0 {
            log::debug!("{} rolling back {} in-flight messages", self.name, n);
            self.at_rest.append(&mut self.in_flight);
        }
        n
    }

    /// Oldest at-rest id, without removing it.
    #[inline]
    pub fn next_message_id(&self) -> Option<MessageId> {
        self.at_rest.first().copied()
    }

    #[inline]
    pub fn has_at_rest_messages(&self) -> bool {
        !self.at_rest.is_empty()
    }

    #[inline]
    pub fn has_messages_in_flight(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// Still to be delivered.
    #[inline]
    pub fn pending(&self) -> usize {
        self.at_rest.len()
    }

    /// At-rest plus in-flight.
    #[inline]
    pub fn size(&self) -> usize {
        self.at_rest.len() + self.in_flight.len()
    }

    #[inline]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Whether the id still needs the stored content.
    #[inline]
    pub fn has_message(&self, id: MessageId) -> bool {
        self.at_rest.contains(&id) || self.in_flight.contains(&id)
    }

    #[inline]
    pub fn is_committed(&self, id: MessageId) -> bool {
        self.committed.contains(&id)
    }

    #[inline]
    pub fn take_committed(&mut self) -> Vec<MessageId> {
        std::mem::take(&mut self.committed).into_iter().collect()
    }

    #[inline]
    pub fn at_rest_ids(&self) -> Vec<MessageId> {
        self.at_rest.iter().copied().collect()
    }

    /// Release everything. Returns the ids that were still at rest or in flight.
    pub fn close(&mut self) -> Vec<MessageId> {
        self.committed.clear();
        let mut ids = std::mem::take(&mut self.at_rest);
        ids.append(&mut self.in_flight);
        ids.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partitions(s: &MessageStateManager, id: MessageId) -> usize {
        [s.at_rest.contains(&id), s.in_flight.contains(&id), s.committed.contains(&id)]
            .iter()
            .filter(|b| **b)
            .count()
    }

    #[test]
    fn lifecycle() {
        let mut s = MessageStateManager::new("d".into());
        for id in [3, 1, 2] {
            assert!(s.register_id(id));
        }
        assert!(!s.register_id(2));
        assert_eq!(s.next_message_id(), Some(1));
        assert!(s.allocate(1));
        assert_eq!(s.next_message_id(), Some(2));
        assert_eq!((s.pending(), s.size()), (2, 3));
        assert!(s.commit(1));
        assert!(!s.commit(1));
        assert!(s.is_committed(1));
        assert_eq!(s.take_committed(), vec![1]);
        assert_eq!(s.size(), 2);
    }

    #[test]
    fn rollback_restores_order() {
        let mut s = MessageStateManager::new("d".into());
        for id in 1..=4 {
            s.register_id(id);
        }
        s.allocate(1);
        s.allocate(2);
        assert!(s.rollback(2));
        assert_eq!(s.next_message_id(), Some(2));
        assert_eq!(s.rollback_in_flight_messages(), 1);
        assert_eq!(s.at_rest_ids(), vec![1, 2, 3, 4]);
        assert!(!s.has_messages_in_flight());
    }

    #[test]
    fn never_in_two_partitions() {
        let mut s = MessageStateManager::new("d".into());
        let ops: Vec<(u8, MessageId)> =
            vec![(0, 1), (1, 1), (0, 1), (2, 1), (0, 1), (1, 1), (3, 1), (0, 2), (1, 2), (4, 2), (0, 2), (5, 2)];
        for (op, id) in ops {
            match op {
                0 => {
                    s.register_id(id);
                }
                1 => {
                    s.allocate(id);
                }
                2 => {
                    s.commit(id);
                }
                3 => {
                    s.rollback(id);
                }
                4 => {
                    s.expired(id);
                }
                _ => {
                    s.rollback_in_flight_messages();
                }
            }
            assert!(partitions(&s, id) <= 1, "id {id} in more than one partition");
            assert!(s.next_message_id().map(|n| !s.in_flight.contains(&n)).unwrap_or(true));
        }
    }

    #[test]
    fn expired_and_close() {
        let mut s = MessageStateManager::with_ids("d".into(), [5, 6, 7]);
        s.allocate(5);
        assert!(s.expired(5));
        assert!(!s.has_message(5));
        s.allocate(6);
        assert_eq!(s.close(), vec![6, 7]);
        assert_eq!(s.size(), 0);
        assert!(!s.has_at_rest_messages());
    }
}
