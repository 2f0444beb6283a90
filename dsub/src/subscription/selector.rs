use std::sync::Arc;

use crate::destination::DestinationCore;
use crate::message::Message;
use crate::types::MessageId;

use super::context::SubscriptionContext;
use super::destination::DestinationSubscription;

/// Filters registrations before they reach the wrapped subscription.
///
/// Each attached context judges a message on its own, by its selector and its no-local flag.
/// The message is taken if any context accepts it.
pub struct SelectorSubscription {
    inner: DestinationSubscription,
    /// `None` while some attached context takes every message.
    filters: Option<Vec<Arc<SubscriptionContext>>>,
}

impl SelectorSubscription {
    pub fn new(inner: DestinationSubscription) -> Self {
        let mut s = Self { inner, filters: None };
        s.refresh();
        s
    }

    #[inline]
    pub fn inner(&self) -> &DestinationSubscription {
        &self.inner
    }

    #[inline]
    pub fn inner_mut(&mut self) -> &mut DestinationSubscription {
        &mut self.inner
    }

    pub fn add_context(&mut self, ctx: Arc<SubscriptionContext>) -> bool {
        let added = self.inner.add_context(ctx);
        self.refresh();
        added
    }

    pub fn remove_context(&mut self, key: &str) -> bool {
        let removed = self.inner.remove_context(key);
        self.refresh();
        removed
    }

    fn refresh(&mut self) {
        let contexts = self.inner.contexts();
        self.filters = if contexts.any(|c| !c.filters_messages()) {
            None
        } else {
            Some(contexts.iter().cloned().collect())
        };
    }

    fn accepts(&mut self, core: &DestinationCore, msg: &Message) -> bool {
        let Some(filters) = self.filters.as_ref() else {
            return true;
        };
        let key = self.inner.key();
        let session_id = self.inner.session_id();
        let accepted = filters.iter().any(|ctx| match ctx.accepts(msg, session_id) {
            Ok(yes) => yes,
            Err(e) => {
                log::warn!("{}/{} message {} skipped by {}, {}", key, core.name(), msg.id, ctx.raw_filter(), e);
                false
            }
        });
        if !accepted {
            self.inner.stats.ignored += 1;
            core.stats().ignored.inc();
        }
        accepted
    }

    pub fn register(&mut self, core: &mut DestinationCore, msg: &Message) -> bool {
        self.accepts(core, msg) && self.inner.register(core, msg)
    }

    pub fn register_id(&mut self, core: &mut DestinationCore, id: MessageId) -> bool {
        match core.get_message(id) {
            Ok(Some(msg)) => self.accepts(core, &msg) && self.inner.register_id(core, id),
            Ok(None) => false,
            Err(e) => {
                log::warn!("{}/{} message {} unresolvable, {}", self.inner.key(), core.name(), id, e);
                false
            }
        }
    }
}
