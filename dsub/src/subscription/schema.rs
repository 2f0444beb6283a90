use std::sync::Arc;

use crate::destination::DestinationCore;
use crate::message::Message;
use crate::session::Session;
use crate::types::{DestinationMode, SessionId, SubscriptionKey};

use super::context::{ContextList, SubscriptionContext};
use super::destination::DeliveryStats;
use super::SubscriptionState;

/// Pushes the destination's schema, and every change to it, straight to the session.
///
/// No message state, no credit, nothing to acknowledge.
pub struct SchemaSubscription {
    key: SubscriptionKey,
    session_id: SessionId,
    session: Option<Session>,
    contexts: ContextList,
    closed: bool,
    sent: u64,
}

impl SchemaSubscription {
    pub fn new(key: SubscriptionKey, session_id: SessionId, session: Option<Session>, contexts: ContextList) -> Self {
        Self { key, session_id, session, contexts, closed: false, sent: 0 }
    }

    #[inline]
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
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
        self.session.is_none()
    }

    /// Send the current schema, if the destination has one.
    pub fn send_current(&mut self, core: &mut DestinationCore) {
        if let Some(schema) = core.schema().cloned() {
            self.schema_updated(core, &schema);
        }
    }

    pub fn schema_updated(&mut self, core: &mut DestinationCore, schema: &Message) {
        if self.closed {
            return;
        }
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if core.send(session, &self.key, &self.session_id, schema.clone(), 0) {
            self.sent += 1;
        } else {
            log::warn!("{}/{} session refused schema, hibernating", self.key, core.name());
            self.session = None;
        }
    }

    pub fn hibernate(&mut self) {
        self.session = None;
    }

    pub fn wake_up(&mut self, core: &mut DestinationCore, session: Session) -> bool {
        if self.session.is_some() {
            return false;
        }
        self.session = Some(session);
        self.send_current(core);
        true
    }

    pub fn close(&mut self) {
        self.session = None;
        self.closed = true;
    }

    pub fn state(&self, core: &DestinationCore) -> SubscriptionState {
        SubscriptionState {
            destination: core.name().clone(),
            key: self.key.clone(),
            session_id: self.session_id.clone(),
            mode: DestinationMode::Schema,
            filters: self.contexts.filters(),
            share: None,
            browser: false,
            paused: false,
            hibernating: self.session.is_none(),
            sync: false,
            pending: 0,
            size: 0,
            in_flight: 0,
            has_at_rest: false,
            has_in_flight: false,
            outstanding: 0,
            credit: 0,
            stats: DeliveryStats { sent: self.sent, ..Default::default() },
        }
    }
}
