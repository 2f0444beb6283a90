use rust_box::dequemap::DequeBTreeMap as DequeMap;

use dsub_utils::timestamp_millis;

use crate::message::Message;
use crate::types::{AckMode, MessageId, TimestampMillis};
use crate::{Error, Result};

type Outstanding = DequeMap<MessageId, TimestampMillis>;

/// Credit window of one subscription: at most `max_outstanding` messages may be sent and not
/// yet acknowledged. Outstanding ids are kept in send order.
pub struct AcknowledgementController {
    mode: AckMode,
    max_outstanding: usize,
    outstanding: Outstanding,
}

impl AcknowledgementController {
    #[inline]
    pub fn new(mode: AckMode, max_outstanding: usize) -> Self {
        Self { mode, max_outstanding, outstanding: Outstanding::default() }
    }

    #[inline]
    pub fn mode(&self) -> AckMode {
        self.mode
    }

    /// Record `msg` as outstanding. Callers check [`Self::can_send`] first.
    #[inline]
    pub fn sent(&mut self, msg: &Message) -> Result<()> {
        if !self.can_send() {
            return Err(Error::CreditExhausted { outstanding: self.outstanding.len(), max: self.max_outstanding });
        }
        self.outstanding.insert(msg.id, timestamp_millis());
        Ok(())
    }

    /// Called when the transport finished writing message `id`.
    ///
    /// In [`AckMode::Auto`] this releases `id` and returns it so the caller can commit it; an id
    /// that is not outstanding releases nothing. In [`AckMode::Client`] nothing is released
    /// until [`Self::ack`] arrives.
    #[inline]
    pub fn message_sent(&mut self, id: MessageId) -> Option<MessageId> {
        match self.mode {
            AckMode::Auto => self.outstanding.remove(&id).map(|_| id),
            AckMode::Client => None,
        }
    }

    /// Acks may arrive in any order.
    #[inline]
    pub fn ack(&mut self, id: MessageId) -> bool {
        self.outstanding.remove(&id).is_some()
    }

    #[inline]
    pub fn rollback(&mut self, id: MessageId) -> bool {
        self.outstanding.remove(&id).is_some()
    }

    /// Returns true if the window grew.
    ///
    /// Shrinking below the current outstanding count does not recall anything; sending
    /// resumes once enough acks arrive.
    #[inline]
    pub fn set_max_outstanding(&mut self, max: usize) -> bool {
        let increased = max > self.max_outstanding;
        self.max_outstanding = max;
        increased
    }

    #[inline]
    pub fn max_outstanding(&self) -> usize {
        self.max_outstanding
    }

    #[inline]
    pub fn can_send(&self) -> bool {
        self.outstanding.len() < self.max_outstanding
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.outstanding.len()
    }

    #[inline]
    pub fn contains(&self, id: MessageId) -> bool {
        self.outstanding.contains_key(&id)
    }

    /// Outstanding ids in send order.
    #[inline]
    pub fn ids(&self) -> Vec<MessageId> {
        self.outstanding.iter().map(|(id, _)| *id).collect()
    }

    /// Oldest outstanding id with the time it was sent.
    #[inline]
    pub fn front(&self) -> Option<(MessageId, TimestampMillis)> {
        self.outstanding.front().map(|(id, t)| (*id, *t))
    }

    #[inline]
    pub fn clear(&mut self) {
        self.outstanding = Outstanding::default();
    }

    #[inline]
    pub fn close(&mut self) {
        self.clear();
        self.max_outstanding = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: MessageId) -> Message {
        let mut m = Message::new("");
        m.id = id;
        m
    }

    #[test]
    fn credit_never_exceeded() {
        let mut acks = AcknowledgementController::new(AckMode::Client, 2);
        let mut next = 1;
        // sent / ack / rollback in an arbitrary interleaving
        for step in 0..60u32 {
            match step % 5 {
                0 | 1 | 3 => {
                    if acks.can_send() {
                        acks.sent(&msg(next)).unwrap();
                        next += 1;
                    } else {
                        assert!(matches!(acks.sent(&msg(next)), Err(Error::CreditExhausted { .. })));
                    }
                }
                2 => {
                    if let Some((id, _)) = acks.front() {
                        assert!(acks.ack(id));
                    }
                }
                _ => {
                    if let Some((id, _)) = acks.front() {
                        assert!(acks.rollback(id));
                    }
                }
            }
            assert!(acks.size() <= acks.max_outstanding());
            assert_eq!(acks.can_send(), acks.size() < acks.max_outstanding());
        }
    }

    #[test]
    fn auto_mode_releases_in_send_order() {
        let mut acks = AcknowledgementController::new(AckMode::Auto, 3);
        for id in [10, 11, 12] {
            acks.sent(&msg(id)).unwrap();
        }
        assert!(!acks.can_send());
        assert_eq!(acks.ids(), vec![10, 11, 12]);
        assert_eq!(acks.message_sent(10), Some(10));
        assert_eq!(acks.message_sent(11), Some(11));
        assert!(acks.can_send());
        assert_eq!(acks.message_sent(12), Some(12));
        assert_eq!(acks.message_sent(12), None);
    }

    #[test]
    fn auto_mode_ignores_unknown_completion() {
        let mut acks = AcknowledgementController::new(AckMode::Auto, 2);
        acks.sent(&msg(5)).unwrap();
        acks.sent(&msg(6)).unwrap();
        assert_eq!(acks.message_sent(4), None);
        assert_eq!(acks.message_sent(6), Some(6));
        assert_eq!(acks.front().map(|(id, _)| id), Some(5));
        assert_eq!(acks.size(), 1);
    }

    #[test]
    fn client_mode_waits_for_ack() {
        let mut acks = AcknowledgementController::new(AckMode::Client, 2);
        acks.sent(&msg(1)).unwrap();
        acks.sent(&msg(2)).unwrap();
        assert_eq!(acks.message_sent(1), None);
        assert!(acks.ack(2));
        assert!(!acks.ack(2));
        assert!(acks.contains(1));
        assert_eq!(acks.size(), 1);
    }

    #[test]
    fn window_changes() {
        let mut acks = AcknowledgementController::new(AckMode::Client, 1);
        acks.sent(&msg(1)).unwrap();
        assert!(!acks.can_send());
        assert!(acks.set_max_outstanding(3));
        assert!(acks.can_send());
        assert!(!acks.set_max_outstanding(3));
        assert!(!acks.set_max_outstanding(1));
        assert!(!acks.can_send());
        acks.clear();
        assert!(acks.can_send());
        acks.close();
        assert!(!acks.can_send());
    }
}
