//! Subscriptions and the machinery that keeps them in line with the destination catalog.
//!
//! - [`SubscriptionContext`]: one immutable subscribe request
//! - [`DestinationSet`]: destinations currently matching one context
//! - [`Subscription`]: what a destination keeps per subscriber, one of a closed set of variants
//! - [`SharedSubscription`]: a share group spreading one message stream over its members
//! - [`SubscriptionModeManager`]: subscribe/unsubscribe/hibernate/wake across destinations
//! - [`SubscriptionController`]: everything one session has subscribed to

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::destination::DestinationCore;
use crate::message::Message;
use crate::session::Session;
use crate::types::{DestinationMode, DestinationName, MessageId, RetainHandling, SessionId, SubscriptionKey};

pub mod ack;
pub mod context;
pub mod controller;
pub mod destination;
pub mod event;
pub mod modes;
pub mod schema;
pub mod selector;
pub mod set;
pub mod shared;
pub mod state;

pub use self::ack::AcknowledgementController;
pub use self::context::{ContextList, SubscriptionContext, SubscriptionContextBuilder, SubscriptionFlags};
pub use self::controller::{SubscriptionController, SubscriptionInformation};
pub use self::destination::{DeliveryStats, DestinationSubscription};
pub use self::event::SubscribedEventManager;
pub use self::modes::SubscriptionModeManager;
pub use self::schema::SchemaSubscription;
pub use self::selector::SelectorSubscription;
pub use self::set::DestinationSet;
pub use self::shared::{SharedMember, SharedSubscription};
pub use self::state::MessageStateManager;

/// Read-only snapshot of one subscription for monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionState {
    pub destination: DestinationName,
    pub key: SubscriptionKey,
    pub session_id: SessionId,
    pub mode: DestinationMode,
    pub filters: Vec<String>,
    /// Share group name of a shared subscription.
    pub share: Option<String>,
    pub browser: bool,
    pub paused: bool,
    pub hibernating: bool,
    pub sync: bool,
    /// At-rest messages.
    pub pending: usize,
    /// At-rest plus in-flight.
    pub size: usize,
    pub in_flight: usize,
    pub has_at_rest: bool,
    pub has_in_flight: bool,
    pub outstanding: usize,
    pub credit: usize,
    pub stats: DeliveryStats,
}

pub enum Subscription {
    Destination(DestinationSubscription),
    Selector(SelectorSubscription),
    Schema(SchemaSubscription),
    Shared(SharedMember),
}

impl Subscription {
    /// Pick the variant for `contexts`: schema mode, a share group member, or a destination
    /// subscription, wrapped in a filter when some context drops messages.
    pub(crate) fn create(
        core: &mut DestinationCore,
        key: SubscriptionKey,
        session_id: SessionId,
        session: Option<Session>,
        mode: DestinationMode,
        contexts: ContextList,
        credit: usize,
    ) -> Subscription {
        if mode == DestinationMode::Schema {
            return Subscription::Schema(SchemaSubscription::new(key, session_id, session, contexts));
        }
        let (browser, share) =
            contexts.first().map(|c| (c.is_browser(), c.share_name().map(str::to_owned))).unwrap_or((false, None));
        if let Some(share) = share {
            return Subscription::Shared(SharedMember::create(core, share, key, session_id, session, contexts, credit));
        }
        let filtered = contexts.any(|c| c.filters_messages());
        let base = if browser {
            DestinationSubscription::browser(core, key, session_id, session, contexts, credit)
        } else {
            DestinationSubscription::new(core, key, session_id, session, contexts, credit)
        };
        if filtered {
            Subscription::Selector(SelectorSubscription::new(base))
        } else {
            Subscription::Destination(base)
        }
    }

    #[inline]
    fn base(&self) -> Option<&DestinationSubscription> {
        match self {
            Subscription::Destination(s) => Some(s),
            Subscription::Selector(s) => Some(s.inner()),
            Subscription::Schema(_) | Subscription::Shared(_) => None,
        }
    }

    #[inline]
    fn base_mut(&mut self) -> Option<&mut DestinationSubscription> {
        match self {
            Subscription::Destination(s) => Some(s),
            Subscription::Selector(s) => Some(s.inner_mut()),
            Subscription::Schema(_) | Subscription::Shared(_) => None,
        }
    }

    #[inline]
    pub fn key(&self) -> &SubscriptionKey {
        match self {
            Subscription::Destination(s) => s.key(),
            Subscription::Selector(s) => s.inner().key(),
            Subscription::Schema(s) => s.key(),
            Subscription::Shared(s) => s.key(),
        }
    }

    #[inline]
    pub fn contexts(&self) -> &ContextList {
        match self {
            Subscription::Destination(s) => s.contexts(),
            Subscription::Selector(s) => s.inner().contexts(),
            Subscription::Schema(s) => s.contexts(),
            Subscription::Shared(s) => s.contexts(),
        }
    }

    #[inline]
    pub fn mode(&self) -> DestinationMode {
        match self {
            Subscription::Schema(_) => DestinationMode::Schema,
            _ => DestinationMode::Normal,
        }
    }

    /// Attach another context. A plain subscription that gains a filtering context is wrapped
    /// so every context keeps its own verdict.
    pub fn merge(self, ctx: Arc<SubscriptionContext>) -> Subscription {
        match self {
            Subscription::Destination(mut s) => {
                let filtered = ctx.filters_messages();
                s.add_context(ctx);
                if filtered {
                    Subscription::Selector(SelectorSubscription::new(s))
                } else {
                    Subscription::Destination(s)
                }
            }
            Subscription::Selector(mut s) => {
                s.add_context(ctx);
                Subscription::Selector(s)
            }
            Subscription::Schema(mut s) => {
                s.add_context(ctx);
                Subscription::Schema(s)
            }
            Subscription::Shared(mut s) => {
                s.add_context(ctx);
                Subscription::Shared(s)
            }
        }
    }

    #[inline]
    pub fn remove_context(&mut self, key: &str) -> bool {
        match self {
            Subscription::Destination(s) => s.remove_context(key),
            Subscription::Selector(s) => s.remove_context(key),
            Subscription::Schema(s) => s.remove_context(key),
            Subscription::Shared(s) => s.remove_context(key),
        }
    }

    #[inline]
    pub fn is_context_empty(&self) -> bool {
        match self {
            Subscription::Schema(s) => s.is_context_empty(),
            Subscription::Shared(s) => s.is_context_empty(),
            _ => self.base().map(|s| s.is_context_empty()).unwrap_or(true),
        }
    }

    #[inline]
    pub fn is_hibernating(&self) -> bool {
        match self {
            Subscription::Schema(s) => s.is_hibernating(),
            Subscription::Shared(s) => s.is_hibernating(),
            _ => self.base().map(|s| s.is_hibernating()).unwrap_or(false),
        }
    }

    /// Seed a new subscription: the retained message, or the current schema. Share group
    /// members get no retained message.
    pub(crate) fn on_created(&mut self, core: &mut DestinationCore) {
        match self {
            Subscription::Schema(s) => return s.send_current(core),
            Subscription::Shared(_) => return,
            _ => {}
        }
        let wants = self.contexts().first().map(|c| c.wants_retained_on_create()).unwrap_or(false);
        if let (true, Some(id)) = (wants, core.retained_message_id()) {
            self.register_id(core, id);
        }
    }

    /// Offer a newly stored message. Schema subscriptions only see schema updates; share groups
    /// are offered messages through the destination's share registry.
    #[inline]
    pub fn register(&mut self, core: &mut DestinationCore, msg: &Message) -> bool {
        match self {
            Subscription::Destination(s) => s.register(core, msg),
            Subscription::Selector(s) => s.register(core, msg),
            Subscription::Schema(_) | Subscription::Shared(_) => false,
        }
    }

    #[inline]
    pub fn register_id(&mut self, core: &mut DestinationCore, id: MessageId) -> bool {
        match self {
            Subscription::Destination(s) => s.register_id(core, id),
            Subscription::Selector(s) => s.register_id(core, id),
            Subscription::Schema(_) | Subscription::Shared(_) => false,
        }
    }

    #[inline]
    pub(crate) fn schema_updated(&mut self, core: &mut DestinationCore, schema: &Message) {
        if let Subscription::Schema(s) = self {
            s.schema_updated(core, schema);
        }
    }

    #[inline]
    pub fn has_message(&self, id: MessageId) -> bool {
        self.base().map(|s| s.has_message(id)).unwrap_or(false)
    }

    #[inline]
    pub fn schedule(&mut self, core: &mut DestinationCore) {
        match self {
            Subscription::Shared(s) => s.schedule(core),
            _ => {
                if let Some(s) = self.base_mut() {
                    s.schedule(core);
                }
            }
        }
    }

    #[inline]
    pub(crate) fn deliver(&mut self, core: &mut DestinationCore) {
        if let Some(s) = self.base_mut() {
            s.deliver(core);
        }
    }

    #[inline]
    pub(crate) fn delivery_complete(&mut self, core: &mut DestinationCore, id: MessageId, generation: u64) {
        match self {
            Subscription::Shared(s) => s.delivery_complete(core, id, generation),
            _ => {
                if let Some(s) = self.base_mut() {
                    s.delivery_complete(core, id, generation);
                }
            }
        }
    }

    #[inline]
    pub fn ack(&mut self, core: &mut DestinationCore, id: MessageId) {
        match self {
            Subscription::Shared(s) => s.ack(core, id),
            _ => {
                if let Some(s) = self.base_mut() {
                    s.ack(core, id);
                }
            }
        }
    }

    #[inline]
    pub fn rollback(&mut self, core: &mut DestinationCore, id: MessageId) {
        match self {
            Subscription::Shared(s) => s.rollback(core, id),
            _ => {
                if let Some(s) = self.base_mut() {
                    s.rollback(core, id);
                }
            }
        }
    }

    #[inline]
    pub fn update_credit(&mut self, core: &mut DestinationCore, credit: usize) {
        match self {
            Subscription::Shared(s) => s.update_credit(core, credit),
            _ => {
                if let Some(s) = self.base_mut() {
                    s.update_credit(core, credit);
                }
            }
        }
    }

    #[inline]
    pub fn pause(&mut self) {
        if let Some(s) = self.base_mut() {
            s.pause();
        }
    }

    #[inline]
    pub fn resume(&mut self, core: &mut DestinationCore) {
        if let Some(s) = self.base_mut() {
            s.resume(core);
        }
    }

    #[inline]
    pub fn hibernate(&mut self, core: &mut DestinationCore) {
        match self {
            Subscription::Schema(s) => s.hibernate(),
            Subscription::Shared(s) => s.hibernate(core),
            _ => {
                if let Some(s) = self.base_mut() {
                    s.hibernate();
                }
            }
        }
    }

    /// Reattach a session. With `SEND_IF_NEW` the retained message is queued again.
    pub fn wake_up(&mut self, core: &mut DestinationCore, session: Session) -> bool {
        let woken = match self {
            Subscription::Schema(s) => return s.wake_up(core, session),
            Subscription::Shared(s) => return s.wake_up(core, session),
            _ => self.base_mut().map(|s| s.wake_up(core, session)).unwrap_or(false),
        };
        if woken && self.contexts().any(|c| c.retain_handling() == RetainHandling::SendIfNew) {
            if let Some(id) = core.retained_message_id() {
                self.register_id(core, id);
            }
        }
        woken
    }

    /// Terminal: release all message state.
    pub fn delete(&mut self, core: &mut DestinationCore) {
        match self {
            Subscription::Schema(s) => s.close(),
            Subscription::Shared(s) => s.delete(core),
            _ => {
                if let Some(s) = self.base_mut() {
                    s.close(core);
                }
            }
        }
    }

    pub fn state(&self, core: &DestinationCore) -> SubscriptionState {
        match self {
            Subscription::Destination(s) => s.state(core, DestinationMode::Normal),
            Subscription::Selector(s) => s.inner().state(core, DestinationMode::Normal),
            Subscription::Schema(s) => s.state(core),
            Subscription::Shared(s) => s.state(core),
        }
    }
}
