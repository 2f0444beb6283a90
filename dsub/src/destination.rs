//! Destinations: named topics/queues that store messages and own their subscriptions.
//!
//! All state of a destination lives in a [`DestinationState`] owned by the destination's
//! [`TaskSerializer`]. Callers reach it only through submitted tasks.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use dsub_utils::timestamp_millis;

use crate::executor::{TaskHandle, TaskSerializer};
use crate::message::{Message, MessageStore};
use crate::session::{CompletionTask, Session};
use crate::stats::Stats;
use crate::subscription::{
    ContextList, SharedSubscription, SubscribedEventManager, Subscription, SubscriptionContext, SubscriptionState,
};
use crate::types::{DestinationMode, DestinationName, MessageId, SessionId, SubscriptionKey, TimestampMillis};
use crate::{Error, Result};

#[derive(Clone)]
pub struct Destination {
    inner: Arc<DestinationInner>,
}

pub struct DestinationInner {
    name: DestinationName,
    exec: TaskSerializer<DestinationState>,
    create_time: TimestampMillis,
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Destination({})", self.inner.name)
    }
}

impl PartialEq for Destination {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Destination {}

impl Destination {
    /// Create a destination and start its task serializer. Must be called inside a tokio runtime.
    pub fn new(
        name: DestinationName,
        store: Box<dyn MessageStore>,
        schema: Option<Message>,
        stats: Arc<Stats>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<DestinationInner>| {
            let state = DestinationState {
                core: DestinationCore {
                    name: name.clone(),
                    this: weak.clone(),
                    store,
                    next_id: 1,
                    retained: None,
                    schema,
                    released: Vec::new(),
                    shares: BTreeMap::new(),
                    stats,
                },
                subscriptions: BTreeMap::new(),
            };
            DestinationInner {
                exec: TaskSerializer::spawn(name.clone(), state),
                name,
                create_time: timestamp_millis(),
            }
        });
        Destination { inner }
    }

    #[inline]
    pub fn name(&self) -> &DestinationName {
        &self.inner.name
    }

    #[inline]
    pub fn create_time(&self) -> TimestampMillis {
        self.inner.create_time
    }

    #[inline]
    pub fn execute<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut DestinationState) + Send + 'static,
    {
        self.inner.exec.execute(f)
    }

    #[inline]
    pub fn submit<F, R>(&self, f: F) -> TaskHandle<R>
    where
        F: FnOnce(&mut DestinationState) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.inner.exec.submit(f)
    }

    /// Store and fan out to every subscription; resolves to the assigned id.
    #[inline]
    pub fn store_message(&self, msg: Message) -> TaskHandle<MessageId> {
        self.submit(move |st| st.store_message(msg))
    }

    #[inline]
    pub fn get_message(&self, id: MessageId) -> TaskHandle<Option<Message>> {
        self.submit(move |st| st.core.get_message(id))
    }

    #[inline]
    pub fn retained_message_id(&self) -> TaskHandle<Option<MessageId>> {
        self.submit(|st| Ok(st.core.retained_message_id()))
    }

    /// Replace the schema and push it to schema-mode subscribers.
    #[inline]
    pub fn update_schema(&self, schema: Message) -> Result<()> {
        self.execute(move |st| st.update_schema(schema))
    }

    #[inline]
    pub fn details(&self) -> TaskHandle<Vec<SubscriptionState>> {
        self.submit(|st| Ok(st.details()))
    }

    /// Close every subscription, then stop the serializer.
    pub fn close(&self) {
        if let Err(e) = self.execute(|st| st.close()) {
            log::debug!("{} already closed, {}", self.name(), e);
        }
        self.inner.exec.close();
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.exec.is_closed()
    }
}

/// Serializer-owned part of a destination that subscriptions get mutable access to.
pub struct DestinationCore {
    name: DestinationName,
    this: Weak<DestinationInner>,
    store: Box<dyn MessageStore>,
    next_id: MessageId,
    retained: Option<MessageId>,
    schema: Option<Message>,
    released: Vec<MessageId>,
    shares: BTreeMap<String, SharedSubscription>,
    stats: Arc<Stats>,
}

impl DestinationCore {
    #[inline]
    pub fn name(&self) -> &DestinationName {
        &self.name
    }

    #[inline]
    pub fn destination(&self) -> Option<Destination> {
        self.this.upgrade().map(|inner| Destination { inner })
    }

    #[inline]
    pub fn get_message(&mut self, id: MessageId) -> Result<Option<Message>> {
        self.store.get(id)
    }

    #[inline]
    pub fn retained_message_id(&self) -> Option<MessageId> {
        self.retained
    }

    #[inline]
    pub fn schema(&self) -> Option<&Message> {
        self.schema.as_ref()
    }

    #[inline]
    pub fn stored_ids(&self) -> Vec<MessageId> {
        self.store.ids()
    }

    #[inline]
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// The caller no longer needs these ids; the store drops them once nobody does.
    #[inline]
    pub fn release<I: IntoIterator<Item = MessageId>>(&mut self, ids: I) {
        self.released.extend(ids);
    }

    /// Queue a delivery pass for `key`.
    pub fn schedule(&self, key: &SubscriptionKey) {
        let Some(destination) = self.destination() else {
            return;
        };
        let k = key.clone();
        if let Err(e) = destination.execute(move |st| st.deliver(&k)) {
            log::debug!("{}/{} schedule dropped, {}", key, self.name, e);
        }
    }

    /// Queue a delivery pass for the share group `name`.
    pub(crate) fn schedule_share(&self, name: &str) {
        let Some(destination) = self.destination() else {
            return;
        };
        let n = name.to_owned();
        if let Err(e) = destination.execute(move |st| st.deliver_share(&n)) {
            log::debug!("{}/{} share schedule dropped, {}", name, self.name, e);
        }
    }

    /// Hand `msg` to `session`, wiring up the completion and the subscription handle.
    /// Returns false if the session did not take it.
    pub(crate) fn send(
        &self,
        session: &Session,
        key: &SubscriptionKey,
        session_id: &SessionId,
        msg: Message,
        generation: u64,
    ) -> bool {
        let Some(destination) = self.destination() else {
            return false;
        };
        let handle = SubscribedEventManager::new(destination.clone(), key.clone(), session_id.clone());
        let completion = CompletionTask::new(destination.clone(), key.clone(), msg.id, generation);
        let sent = session.send_message(&destination, handle, msg, completion);
        if sent {
            self.stats.delivered.inc();
        }
        sent
    }

    #[inline]
    pub(crate) fn has_share(&self, name: &str) -> bool {
        self.shares.contains_key(name)
    }

    #[inline]
    pub(crate) fn add_share(&mut self, share: SharedSubscription) {
        self.shares.insert(share.name().to_owned(), share);
    }

    #[inline]
    pub(crate) fn share(&self, name: &str) -> Option<&SharedSubscription> {
        self.shares.get(name)
    }

    /// Run `f` on the share group `name`. The group is taken out of the registry for the call
    /// and put back unless it closed.
    pub(crate) fn with_share<R, F>(&mut self, name: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut SharedSubscription, &mut DestinationCore) -> R,
    {
        let mut share = self.shares.remove(name)?;
        let res = f(&mut share, self);
        if share.is_closed() {
            log::debug!("{}/{} share group closed", name, self.name);
        } else {
            self.shares.insert(name.to_owned(), share);
        }
        Some(res)
    }

    /// Offer a newly stored message to every share group; returns how many took it.
    fn register_shares(&mut self, msg: &Message) -> usize {
        let names = self.shares.keys().cloned().collect::<Vec<_>>();
        names
            .iter()
            .filter(|name| self.with_share(name, |share, core| share.register(core, msg)).unwrap_or(false))
            .count()
    }
}

pub struct DestinationState {
    pub(crate) core: DestinationCore,
    subscriptions: BTreeMap<SubscriptionKey, Subscription>,
}

impl DestinationState {
    #[inline]
    pub fn name(&self) -> &DestinationName {
        &self.core.name
    }

    #[inline]
    pub fn core(&self) -> &DestinationCore {
        &self.core
    }

    /// Assign an id, keep track of the retained message and register with every subscription.
    pub fn store_message(&mut self, mut msg: Message) -> Result<MessageId> {
        let id = self.core.next_id;
        self.core.next_id += 1;
        msg.id = id;

        if msg.retain {
            let prev = if msg.payload.is_empty() { self.core.retained.take() } else { self.core.retained.replace(id) };
            if let Some(prev) = prev {
                self.core.release([prev]);
            }
        }

        self.core.store.put(msg.clone())?;

        let mut interested = self.core.register_shares(&msg);
        for sub in self.subscriptions.values_mut() {
            if sub.register(&mut self.core, &msg) {
                interested += 1;
            }
        }
        log::trace!("{} stored message {}, {} interested", self.core.name, id, interested);
        if interested == 0 {
            self.core.release([id]);
        }
        self.collect_garbage();
        Ok(id)
    }

    pub fn update_schema(&mut self, mut schema: Message) {
        schema.id = self.core.next_id;
        self.core.next_id += 1;
        self.core.schema = Some(schema.clone());
        for sub in self.subscriptions.values_mut() {
            sub.schema_updated(&mut self.core, &schema);
        }
    }

    #[inline]
    pub fn subscription(&self, key: &SubscriptionKey) -> Option<&Subscription> {
        self.subscriptions.get(key)
    }

    #[inline]
    pub fn subscription_keys(&self) -> Vec<SubscriptionKey> {
        self.subscriptions.keys().cloned().collect()
    }

    #[inline]
    pub fn add_subscription(&mut self, sub: Subscription) -> Option<Subscription> {
        self.core.stats.subscriptions.inc();
        let prev = self.subscriptions.insert(sub.key().clone(), sub);
        if prev.is_some() {
            self.core.stats.subscriptions.dec();
        }
        prev
    }

    #[inline]
    pub fn remove_subscription(&mut self, key: &SubscriptionKey) -> Option<Subscription> {
        let sub = self.subscriptions.remove(key);
        if sub.is_some() {
            self.core.stats.subscriptions.dec();
        }
        sub
    }

    /// Run `f` on one subscription, then drop stored messages nobody needs any more.
    pub fn with_subscription<R, F>(&mut self, key: &SubscriptionKey, f: F) -> Option<R>
    where
        F: FnOnce(&mut Subscription, &mut DestinationCore) -> R,
    {
        let core = &mut self.core;
        let res = self.subscriptions.get_mut(key).map(|sub| f(sub, core));
        self.collect_garbage();
        res
    }

    /// Create the subscription for `key`, or merge `contexts` into the existing one.
    pub(crate) fn subscribe(
        &mut self,
        key: SubscriptionKey,
        session_id: SessionId,
        session: Option<Session>,
        mode: DestinationMode,
        contexts: Vec<Arc<SubscriptionContext>>,
        credit: usize,
    ) -> Result<SubscribedEventManager> {
        let Some(destination) = self.core.destination() else {
            return Err(Error::DestinationClosed(self.core.name.clone()));
        };
        let mut contexts = contexts.into_iter();
        let Some(first) = contexts.next() else {
            return Err(Error::msg(format!("{}/{} subscribe without context", key, self.core.name)));
        };

        if let Some(sub) = self.subscriptions.remove(&key) {
            let mut sub = std::iter::once(first).chain(contexts).fold(sub, Subscription::merge);
            sub.schedule(&mut self.core);
            self.subscriptions.insert(key.clone(), sub);
            log::debug!("{}/{} merged into existing subscription", key, self.core.name);
        } else {
            let mut list = ContextList::new(first);
            for ctx in contexts {
                list.add(ctx);
            }
            let mut sub =
                Subscription::create(&mut self.core, key.clone(), session_id.clone(), session, mode, list, credit);
            sub.on_created(&mut self.core);
            self.add_subscription(sub);
            log::debug!("{}/{} subscription created, mode: {}", key, self.core.name, mode);
        }
        Ok(SubscribedEventManager::new(destination, key, session_id))
    }

    /// Remove one context; the subscription itself goes once no context is left.
    /// Returns true if the subscription was removed.
    pub(crate) fn unsubscribe(&mut self, key: &SubscriptionKey, context_key: &str) -> bool {
        let empty = self
            .subscriptions
            .get_mut(key)
            .map(|sub| {
                sub.remove_context(context_key);
                sub.is_context_empty()
            })
            .unwrap_or(false);
        if empty {
            self.delete_subscription(key)
        } else {
            false
        }
    }

    /// Remove and delete regardless of remaining contexts.
    pub(crate) fn delete_subscription(&mut self, key: &SubscriptionKey) -> bool {
        match self.remove_subscription(key) {
            Some(mut sub) => {
                sub.delete(&mut self.core);
                self.collect_garbage();
                log::debug!("{}/{} subscription deleted", key, self.core.name);
                true
            }
            None => false,
        }
    }

    pub(crate) fn deliver(&mut self, key: &SubscriptionKey) {
        self.with_subscription(key, |sub, core| sub.deliver(core));
    }

    pub(crate) fn delivery_complete(&mut self, key: &SubscriptionKey, id: MessageId, generation: u64) {
        self.with_subscription(key, |sub, core| sub.delivery_complete(core, id, generation));
    }

    pub(crate) fn deliver_share(&mut self, name: &str) {
        self.core.with_share(name, |share, core| share.deliver(core));
        self.collect_garbage();
    }

    pub fn details(&self) -> Vec<SubscriptionState> {
        self.subscriptions.values().map(|s| s.state(&self.core)).collect()
    }

    /// Stored content no subscription holds and that is not retained is dropped.
    fn collect_garbage(&mut self) {
        if self.core.released.is_empty() {
            return;
        }
        for id in std::mem::take(&mut self.core.released) {
            if self.core.retained == Some(id)
                || self.subscriptions.values().any(|s| s.has_message(id))
                || self.core.shares.values().any(|s| s.has_message(id))
            {
                continue;
            }
            self.core.store.remove(id);
        }
    }

    fn close(&mut self) {
        let keys = self.subscription_keys();
        for key in keys.iter() {
            self.delete_subscription(key);
        }
        let names = self.core.shares.keys().cloned().collect::<Vec<_>>();
        for name in names {
            self.core.with_share(&name, |share, core| share.close(core));
        }
        self.collect_garbage();
        log::debug!("{} closed, {} subscriptions deleted", self.core.name, keys.len());
    }

    #[cfg(test)]
    pub(crate) fn stored_len(&self) -> usize {
        self.core.store.len()
    }
}
