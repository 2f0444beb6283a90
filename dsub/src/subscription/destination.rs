//! The per-destination subscription and its delivery loop.

use serde::{Deserialize, Serialize};

use crate::destination::DestinationCore;
use crate::message::Message;
use crate::session::Session;
use crate::types::{DestinationMode, MessageId, SessionId, SubscriptionKey};

use super::ack::AcknowledgementController;
use super::context::{ContextList, SubscriptionContext};
use super::state::MessageStateManager;
use super::SubscriptionState;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DeliveryStats {
    pub sent: u64,
    pub registered: u64,
    pub ignored: u64,
    pub expired: u64,
    pub acked: u64,
    pub rolled_back: u64,
}

/// Binds one session to one destination.
///
/// Owns the message state and the credit window of that pair. Only ever touched from
/// inside the destination's task serializer.
pub struct DestinationSubscription {
    key: SubscriptionKey,
    session_id: SessionId,
    session: Option<Session>,
    contexts: ContextList,
    state: MessageStateManager,
    acks: AcknowledgementController,
    paused: bool,
    hibernating: bool,
    sync: bool,
    browser: bool,
    scheduled: bool,
    closed: bool,
    /// Bumped on every detach; completions sent under an older value are stale.
    generation: u64,
    pub(crate) stats: DeliveryStats,
}

impl DestinationSubscription {
    pub fn new(
        core: &DestinationCore,
        key: SubscriptionKey,
        session_id: SessionId,
        session: Option<Session>,
        contexts: ContextList,
        credit: usize,
    ) -> Self {
        let (ack_mode, sync) = contexts
            .first()
            .map(|c| (c.ack_mode(), c.is_sync()))
            .unwrap_or((crate::types::AckMode::Auto, false));
        Self {
            key,
            hibernating: session.is_none(),
            session_id,
            session,
            contexts,
            state: MessageStateManager::new(core.name().clone()),
            acks: AcknowledgementController::new(ack_mode, credit),
            paused: false,
            sync,
            browser: false,
            scheduled: false,
            closed: false,
            generation: 0,
            stats: DeliveryStats::default(),
        }
    }

    /// Non-consuming: starts from what the destination holds right now.
    pub fn browser(
        core: &DestinationCore,
        key: SubscriptionKey,
        session_id: SessionId,
        session: Option<Session>,
        contexts: ContextList,
        credit: usize,
    ) -> Self {
        let mut sub = Self::new(core, key, session_id, session, contexts, credit);
        sub.state = MessageStateManager::with_ids(core.name().clone(), core.stored_ids());
        sub.stats.registered = sub.state.pending() as u64;
        sub.browser = true;
        sub
    }

    #[inline]
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    #[inline]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    #[inline]
    pub fn contexts(&self) -> &ContextList {
        &self.contexts
    }

    #[inline]
    pub fn add_context(&mut self, ctx: std::sync::Arc<SubscriptionContext>) -> bool {
        self.contexts.add(ctx)
    }

    #[inline]
    pub fn remove_context(&mut self, key: &str) -> bool {
        self.contexts.remove(key)
    }

    #[inline]
    pub fn is_context_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    #[inline]
    pub fn is_hibernating(&self) -> bool {
        self.hibernating
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    #[inline]
    pub fn state_manager(&self) -> &MessageStateManager {
        &self.state
    }

    #[inline]
    pub fn ack_controller(&self) -> &AcknowledgementController {
        &self.acks
    }

    /// Take a newly stored message. Returns true if it was queued for delivery.
    pub fn register(&mut self, core: &mut DestinationCore, msg: &Message) -> bool {
        if self.closed {
            return false;
        }
        if self.hibernating && !msg.store_offline {
            return false;
        }
        if self.state.register(msg) {
            self.stats.registered += 1;
            self.schedule(core);
            true
        } else {
            false
        }
    }

    /// Queue an already stored message, the retained one on subscribe or wake.
    pub fn register_id(&mut self, core: &mut DestinationCore, id: MessageId) -> bool {
        if self.closed || self.hibernating {
            return false;
        }
        if self.state.register_id(id) {
            self.stats.registered += 1;
            self.schedule(core);
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        !self.closed
            && !self.paused
            && !self.sync
            && !self.hibernating
            && self.session.is_some()
            && !self.contexts.is_empty()
            && self.state.has_at_rest_messages()
            && self.acks.can_send()
    }

    /// Request a delivery pass. No-op when one is already queued or nothing can be sent.
    #[inline]
    pub fn schedule(&mut self, core: &DestinationCore) {
        if self.scheduled || !self.is_ready() {
            return;
        }
        self.scheduled = true;
        core.schedule(&self.key);
    }

    /// Send at-rest messages in registration order while credit allows.
    pub fn deliver(&mut self, core: &mut DestinationCore) {
        self.scheduled = false;
        while self.is_ready() {
            let Some(id) = self.state.next_message_id() else {
                break;
            };
            let msg = match core.get_message(id) {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    self.expire(core, id);
                    continue;
                }
                Err(e) => {
                    log::warn!("{}/{} message {} unresolvable, treated as expired, {}", self.key, core.name(), id, e);
                    self.expire(core, id);
                    continue;
                }
            };
            if !self.send(core, msg) {
                break;
            }
        }
    }

    fn expire(&mut self, core: &mut DestinationCore, id: MessageId) {
        self.state.expired(id);
        self.stats.expired += 1;
        core.stats().expired.inc();
        core.release([id]);
    }

    /// A session that refuses the message is detached: the message goes back to at-rest and
    /// the subscription hibernates, so nothing is resent until it is woken.
    fn send(&mut self, core: &mut DestinationCore, msg: Message) -> bool {
        let Some(session) = self.session.as_ref() else {
            return false;
        };
        let id = msg.id;
        if let Err(e) = self.acks.sent(&msg) {
            log::error!("{}/{} {}", self.key, core.name(), e);
            return false;
        }
        self.state.allocate(id);
        self.stats.sent += 1;
        if core.send(session, &self.key, &self.session_id, msg, self.generation) {
            return true;
        }
        log::warn!("{}/{} session refused message {}, hibernating", self.key, core.name(), id);
        self.acks.rollback(id);
        self.state.rollback(id);
        self.hibernate();
        false
    }

    /// The transport finished writing message `id`.
    pub fn delivery_complete(&mut self, core: &mut DestinationCore, id: MessageId, generation: u64) {
        if generation != self.generation {
            log::debug!("{}/{} stale completion of {} ignored", self.key, core.name(), id);
            return;
        }
        if let Some(id) = self.acks.message_sent(id) {
            self.complete(core, id);
        }
        self.schedule(core);
    }

    fn complete(&mut self, core: &mut DestinationCore, id: MessageId) {
        if self.state.commit(id) {
            self.stats.acked += 1;
            core.stats().acked.inc();
            core.release(self.state.take_committed());
        }
    }

    pub fn ack(&mut self, core: &mut DestinationCore, id: MessageId) {
        if self.acks.ack(id) {
            self.complete(core, id);
        }
        self.schedule(core);
    }

    pub fn rollback(&mut self, core: &mut DestinationCore, id: MessageId) {
        self.acks.rollback(id);
        if self.state.rollback(id) {
            self.stats.rolled_back += 1;
            core.stats().rolled_back.inc();
        }
        self.schedule(core);
    }

    pub fn update_credit(&mut self, core: &mut DestinationCore, credit: usize) {
        if self.acks.set_max_outstanding(credit) {
            self.schedule(core);
        }
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Also releases a sync hold.
    pub fn resume(&mut self, core: &mut DestinationCore) {
        self.paused = false;
        self.sync = false;
        self.schedule(core);
    }

    /// Detach the session. In-flight messages go back to at-rest for redelivery on wake.
    pub fn hibernate(&mut self) {
        self.acks.clear();
        self.state.rollback_in_flight_messages();
        self.session = None;
        self.hibernating = true;
        self.scheduled = false;
        self.generation += 1;
    }

    /// Returns false if the subscription was not hibernating. A pause does not survive the
    /// session it was requested by.
    pub fn wake_up(&mut self, core: &mut DestinationCore, session: Session) -> bool {
        if !self.hibernating {
            return false;
        }
        self.session = Some(session);
        self.hibernating = false;
        self.paused = false;
        self.schedule(core);
        true
    }

    #[inline]
    pub fn has_message(&self, id: MessageId) -> bool {
        self.state.has_message(id)
    }

    /// Release all state; the subscription is terminal afterwards.
    pub fn close(&mut self, core: &mut DestinationCore) {
        self.acks.close();
        self.state.rollback_in_flight_messages();
        core.release(self.state.close());
        self.session = None;
        self.closed = true;
    }

    pub fn state(&self, core: &DestinationCore, mode: DestinationMode) -> SubscriptionState {
        SubscriptionState {
            destination: core.name().clone(),
            key: self.key.clone(),
            session_id: self.session_id.clone(),
            mode,
            filters: self.contexts.filters(),
            share: None,
            browser: self.browser,
            paused: self.paused,
            hibernating: self.hibernating,
            sync: self.sync,
            pending: self.state.pending(),
            size: self.state.size(),
            in_flight: self.state.in_flight(),
            has_at_rest: self.state.has_at_rest_messages(),
            has_in_flight: self.state.has_messages_in_flight(),
            outstanding: self.acks.size(),
            credit: self.acks.max_outstanding(),
            stats: self.stats,
        }
    }
}
