//! Shared subscriptions: `$share/<name>/<filter>`.
//!
//! All sessions subscribed under one share name on a destination form a group. The group owns
//! a single [`MessageStateManager`], so each message goes to exactly one member. Members take
//! turns; a member without a session or without credit is skipped. Each member keeps its own
//! credit window and its own generation for completions.
//!
//! The groups of a destination live in its share registry, keyed by share name. What a
//! destination keeps per session is a [`SharedMember`] that forwards to the group.

use std::sync::Arc;

use crate::destination::DestinationCore;
use crate::message::Message;
use crate::selector::Selector;
use crate::session::Session;
use crate::types::{AckMode, DestinationMode, DestinationName, MessageId, SessionId, SubscriptionKey};

use super::ack::AcknowledgementController;
use super::context::{ContextList, SubscriptionContext};
use super::destination::DeliveryStats;
use super::state::MessageStateManager;
use super::SubscriptionState;

struct Member {
    key: SubscriptionKey,
    session_id: SessionId,
    session: Option<Session>,
    acks: AcknowledgementController,
    generation: u64,
}

impl Member {
    #[inline]
    fn can_take(&self) -> bool {
        self.session.is_some() && self.acks.can_send()
    }

    /// Drop the session; everything it still holds goes back to the group.
    fn detach(&mut self, state: &mut MessageStateManager) -> usize {
        let ids = self.acks.ids();
        for id in ids.iter() {
            state.rollback(*id);
        }
        self.acks.clear();
        self.session = None;
        self.generation += 1;
        ids.len()
    }
}

/// One share group on one destination.
pub struct SharedSubscription {
    name: String,
    selector: Option<Selector>,
    state: MessageStateManager,
    members: Vec<Member>,
    next: usize,
    scheduled: bool,
    closed: bool,
    stats: DeliveryStats,
}

impl SharedSubscription {
    /// The group takes the selector of the context that created it.
    pub fn new(destination: DestinationName, name: String, selector: Option<Selector>) -> Self {
        Self {
            name,
            selector,
            state: MessageStateManager::new(destination),
            members: Vec::new(),
            next: 0,
            scheduled: false,
            closed: false,
            stats: DeliveryStats::default(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    #[inline]
    fn position(&self, key: &SubscriptionKey) -> Option<usize> {
        self.members.iter().position(|m| &m.key == key)
    }

    #[inline]
    fn member_mut(&mut self, key: &SubscriptionKey) -> Option<&mut Member> {
        self.members.iter_mut().find(|m| &m.key == key)
    }

    /// Add a member, or refresh the credit of an existing one.
    pub fn join(
        &mut self,
        core: &DestinationCore,
        key: SubscriptionKey,
        session_id: SessionId,
        session: Option<Session>,
        ack_mode: AckMode,
        credit: usize,
    ) {
        match self.member_mut(&key) {
            Some(m) => {
                if m.session.is_none() {
                    m.session = session;
                }
                m.acks.set_max_outstanding(credit);
            }
            None => {
                log::debug!("{}/{} joined share group {}", key, core.name(), self.name);
                self.members.push(Member {
                    key,
                    session_id,
                    session,
                    acks: AcknowledgementController::new(ack_mode, credit),
                    generation: 0,
                });
            }
        }
        self.schedule(core);
    }

    /// Remove a member. Its outstanding messages go to the others; the last one out closes
    /// the group.
    pub fn leave(&mut self, core: &mut DestinationCore, key: &SubscriptionKey) {
        let Some(idx) = self.position(key) else {
            return;
        };
        let mut m = self.members.remove(idx);
        let returned = m.detach(&mut self.state);
        log::debug!("{}/{} left share group {}, {} returned", key, core.name(), self.name, returned);
        if self.next > idx {
            self.next -= 1;
        }
        if self.next >= self.members.len() {
            self.next = 0;
        }
        if self.members.is_empty() {
            self.close(core);
        } else {
            self.schedule(core);
        }
    }

    pub fn register(&mut self, core: &mut DestinationCore, msg: &Message) -> bool {
        if self.closed {
            return false;
        }
        if let Some(selector) = self.selector.as_ref() {
            let accepted = selector.evaluate(msg).unwrap_or_else(|e| {
                log::warn!("{}/{} message {} skipped, {}", self.name, core.name(), msg.id, e);
                false
            });
            if !accepted {
                self.stats.ignored += 1;
                core.stats().ignored.inc();
                return false;
            }
        }
        if !msg.store_offline && self.members.iter().all(|m| m.session.is_none()) {
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

    #[inline]
    pub fn is_ready(&self) -> bool {
        !self.closed && self.state.has_at_rest_messages() && self.members.iter().any(Member::can_take)
    }

    pub fn schedule(&mut self, core: &DestinationCore) {
        if self.scheduled || !self.is_ready() {
            return;
        }
        self.scheduled = true;
        core.schedule_share(&self.name);
    }

    /// Next member that can take a message, starting after the last one served.
    fn poll_next(&mut self) -> Option<usize> {
        let len = self.members.len();
        let idx = (0..len).map(|i| (self.next + i) % len).find(|idx| self.members[*idx].can_take())?;
        self.next = (idx + 1) % len;
        Some(idx)
    }

    /// Send at-rest messages in registration order, one member per message. A message no
    /// member can take stays at rest.
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
                    log::warn!("{}/{} message {} unresolvable, treated as expired, {}", self.name, core.name(), id, e);
                    self.expire(core, id);
                    continue;
                }
            };
            let Some(idx) = self.poll_next() else {
                break;
            };
            let m = &mut self.members[idx];
            let Some(session) = m.session.clone() else {
                break;
            };
            if let Err(e) = m.acks.sent(&msg) {
                log::error!("{}/{} {}", m.key, core.name(), e);
                break;
            }
            self.state.allocate(id);
            self.stats.sent += 1;
            if !core.send(&session, &m.key, &m.session_id, msg, m.generation) {
                log::warn!("{}/{} session refused message {}, member detached", m.key, core.name(), id);
                m.detach(&mut self.state);
            }
        }
    }

    fn expire(&mut self, core: &mut DestinationCore, id: MessageId) {
        self.state.expired(id);
        self.stats.expired += 1;
        core.stats().expired.inc();
        core.release([id]);
    }

    fn complete(&mut self, core: &mut DestinationCore, id: MessageId) {
        if self.state.commit(id) {
            self.stats.acked += 1;
            core.stats().acked.inc();
            core.release(self.state.take_committed());
        }
    }

    pub fn delivery_complete(
        &mut self,
        core: &mut DestinationCore,
        key: &SubscriptionKey,
        id: MessageId,
        generation: u64,
    ) {
        let done = match self.member_mut(key) {
            Some(m) if m.generation == generation => m.acks.message_sent(id),
            Some(_) => {
                log::debug!("{}/{} stale completion of {} ignored", key, core.name(), id);
                return;
            }
            None => return,
        };
        if let Some(id) = done {
            self.complete(core, id);
        }
        self.schedule(core);
    }

    pub fn ack(&mut self, core: &mut DestinationCore, key: &SubscriptionKey, id: MessageId) {
        if self.member_mut(key).map(|m| m.acks.ack(id)).unwrap_or(false) {
            self.complete(core, id);
        }
        self.schedule(core);
    }

    /// Only ids the member itself holds are rolled back.
    pub fn rollback(&mut self, core: &mut DestinationCore, key: &SubscriptionKey, id: MessageId) {
        if self.member_mut(key).map(|m| m.acks.rollback(id)).unwrap_or(false) && self.state.rollback(id) {
            self.stats.rolled_back += 1;
            core.stats().rolled_back.inc();
        }
        self.schedule(core);
    }

    pub fn update_credit(&mut self, core: &mut DestinationCore, key: &SubscriptionKey, credit: usize) {
        if self.member_mut(key).map(|m| m.acks.set_max_outstanding(credit)).unwrap_or(false) {
            self.schedule(core);
        }
    }

    /// Detach one member; the rest of the group picks up its messages.
    pub fn hibernate(&mut self, core: &mut DestinationCore, key: &SubscriptionKey) {
        if let Some(idx) = self.position(key) {
            self.members[idx].detach(&mut self.state);
        }
        self.schedule(core);
    }

    pub fn wake_up(&mut self, core: &mut DestinationCore, key: &SubscriptionKey, session: Session) -> bool {
        let woken = match self.member_mut(key) {
            Some(m) if m.session.is_none() => {
                m.session = Some(session);
                true
            }
            _ => false,
        };
        self.schedule(core);
        woken
    }

    #[inline]
    pub fn has_message(&self, id: MessageId) -> bool {
        self.state.has_message(id)
    }

    pub fn close(&mut self, core: &mut DestinationCore) {
        for m in self.members.iter_mut() {
            m.acks.close();
            m.session = None;
        }
        self.members.clear();
        self.state.rollback_in_flight_messages();
        core.release(self.state.close());
        self.closed = true;
    }

    fn member(&self, key: &SubscriptionKey) -> Option<&Member> {
        self.members.iter().find(|m| &m.key == key)
    }
}

/// What a destination keeps for one session of a share group.
pub struct SharedMember {
    key: SubscriptionKey,
    share: String,
    contexts: ContextList,
    hibernating: bool,
}

impl SharedMember {
    /// Join the group `share`, creating it in the destination's share registry first if needed.
    pub fn create(
        core: &mut DestinationCore,
        share: String,
        key: SubscriptionKey,
        session_id: SessionId,
        session: Option<Session>,
        contexts: ContextList,
        credit: usize,
    ) -> Self {
        let (selector, ack_mode) =
            contexts.first().map(|c| (c.selector().cloned(), c.ack_mode())).unwrap_or((None, AckMode::Auto));
        if !core.has_share(&share) {
            core.add_share(SharedSubscription::new(core.name().clone(), share.clone(), selector));
        }
        let hibernating = session.is_none();
        core.with_share(&share, |group, core| group.join(core, key.clone(), session_id, session, ack_mode, credit));
        Self { key, share, contexts, hibernating }
    }

    #[inline]
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    #[inline]
    pub fn share(&self) -> &str {
        &self.share
    }

    #[inline]
    pub fn contexts(&self) -> &ContextList {
        &self.contexts
    }

    #[inline]
    pub fn add_context(&mut self, ctx: Arc<SubscriptionContext>) -> bool {
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
    fn group<R, F>(&self, core: &mut DestinationCore, f: F) -> Option<R>
    where
        F: FnOnce(&mut SharedSubscription, &mut DestinationCore) -> R,
    {
        core.with_share(&self.share, f)
    }

    pub fn schedule(&self, core: &mut DestinationCore) {
        self.group(core, |g, core| g.schedule(core));
    }

    pub fn delivery_complete(&self, core: &mut DestinationCore, id: MessageId, generation: u64) {
        let key = &self.key;
        self.group(core, |g, core| g.delivery_complete(core, key, id, generation));
    }

    pub fn ack(&self, core: &mut DestinationCore, id: MessageId) {
        let key = &self.key;
        self.group(core, |g, core| g.ack(core, key, id));
    }

    pub fn rollback(&self, core: &mut DestinationCore, id: MessageId) {
        let key = &self.key;
        self.group(core, |g, core| g.rollback(core, key, id));
    }

    pub fn update_credit(&self, core: &mut DestinationCore, credit: usize) {
        let key = &self.key;
        self.group(core, |g, core| g.update_credit(core, key, credit));
    }

    pub fn hibernate(&mut self, core: &mut DestinationCore) {
        self.hibernating = true;
        let key = &self.key;
        self.group(core, |g, core| g.hibernate(core, key));
    }

    pub fn wake_up(&mut self, core: &mut DestinationCore, session: Session) -> bool {
        let key = &self.key;
        let woken = self.group(core, |g, core| g.wake_up(core, key, session)).unwrap_or(false);
        if woken {
            self.hibernating = false;
        }
        woken
    }

    /// Leave the group; the group closes with its last member.
    pub fn delete(&mut self, core: &mut DestinationCore) {
        let key = &self.key;
        self.group(core, |g, core| g.leave(core, key));
    }

    /// Message counts are the group's, credit and outstanding this member's.
    pub fn state(&self, core: &DestinationCore) -> SubscriptionState {
        let group = core.share(&self.share);
        let member = group.and_then(|g| g.member(&self.key));
        SubscriptionState {
            destination: core.name().clone(),
            key: self.key.clone(),
            session_id: member.map(|m| m.session_id.clone()).unwrap_or_default(),
            mode: DestinationMode::Normal,
            filters: self.contexts.filters(),
            share: Some(self.share.clone()),
            browser: false,
            paused: false,
            hibernating: self.hibernating,
            sync: false,
            pending: group.map(|g| g.state.pending()).unwrap_or(0),
            size: group.map(|g| g.state.size()).unwrap_or(0),
            in_flight: group.map(|g| g.state.in_flight()).unwrap_or(0),
            has_at_rest: group.map(|g| g.state.has_at_rest_messages()).unwrap_or(false),
            has_in_flight: group.map(|g| g.state.has_messages_in_flight()).unwrap_or(false),
            outstanding: member.map(|m| m.acks.size()).unwrap_or(0),
            credit: member.map(|m| m.acks.max_outstanding()).unwrap_or(0),
            stats: group.map(|g| g.stats).unwrap_or_default(),
        }
    }
}
