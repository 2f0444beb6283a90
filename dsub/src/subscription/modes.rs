//! Subscribe, unsubscribe, hibernate and wake across every destination a subscription covers.
//!
//! One [`SubscriptionModeManager`] exists per [`DestinationMode`] per controller. The mode
//! decides how subscribe tasks are built (credit, subscription key, which subscription
//! variant) and which unsubscribe ids it owns; everything else is shared.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use itertools::Itertools;
use tokio::time::Instant;

use crate::destination::Destination;
use crate::executor::TaskHandle;
use crate::session::Session;
use crate::types::{ContextKey, DashMap, DestinationMode, DestinationName, SubscriptionKey};
use crate::{Error, Result};

use super::context::{normalize_key, SubscriptionContext};
use super::controller::SubscriptionController;
use super::event::SubscribedEventManager;
use super::set::DestinationSet;
use super::SubscriptionState;

pub type Subscriptions = DashMap<ContextKey, Arc<DestinationSet>>;

type ActiveKey = (DestinationName, SubscriptionKey);

pub struct SubscriptionModeManager {
    mode: DestinationMode,
    active: DashMap<ActiveKey, SubscribedEventManager>,
}

impl SubscriptionModeManager {
    pub fn new(mode: DestinationMode) -> Self {
        Self { mode, active: DashMap::default() }
    }

    #[inline]
    pub fn mode(&self) -> DestinationMode {
        self.mode
    }

    #[inline]
    pub fn add(&self, handle: SubscribedEventManager) {
        self.active.insert((handle.destination().name().clone(), handle.key().clone()), handle);
    }

    #[inline]
    pub fn remove(&self, name: &DestinationName, key: &SubscriptionKey) -> Option<SubscribedEventManager> {
        self.active.remove(&(name.clone(), key.clone())).map(|(_, h)| h)
    }

    #[inline]
    pub fn get(&self, name: &DestinationName, key: &SubscriptionKey) -> Option<SubscribedEventManager> {
        self.active.get(&(name.clone(), key.clone())).map(|h| h.value().clone())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.active.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    #[inline]
    pub fn handles(&self) -> Vec<SubscribedEventManager> {
        self.active.iter().map(|h| h.value().clone()).collect()
    }

    /// The context key this mode owns for an unsubscribe id, `None` if the id is another mode's.
    pub fn adjust_unsubscribe_id(&self, id: &str) -> Option<ContextKey> {
        let id = normalize_key(id);
        let owned = match self.mode {
            DestinationMode::Normal => DestinationMode::parse(&id).0 == DestinationMode::Normal,
            DestinationMode::Schema => id.starts_with(DestinationMode::Schema.namespace()),
        };
        owned.then_some(id)
    }

    /// Submit one subscribe task to `destination`. The first context creates the subscription
    /// if needed, later ones merge into it.
    pub fn schedule_subscription(
        &self,
        controller: &SubscriptionController,
        contexts: Vec<Arc<SubscriptionContext>>,
        destination: &Destination,
    ) -> TaskHandle<SubscribedEventManager> {
        let Some(first) = contexts.first() else {
            return TaskHandle::ready(Err(Error::msg("subscribe task without context")));
        };
        let mode = self.mode;
        let key = controller.subscription_key(mode, first);
        let credit = match mode {
            DestinationMode::Normal => controller.credit(first),
            DestinationMode::Schema => 0,
        };
        let controller = controller.clone();
        destination.submit(move |st| {
            let handle =
                st.subscribe(key, controller.session_id().clone(), controller.session(), mode, contexts, credit)?;
            controller.mode_manager(mode).add(handle.clone());
            Ok(handle)
        })
    }

    /// Remove `context` from the subscription on `destination`; resolves to true when that
    /// removed the subscription itself.
    pub fn create_unsubscribe_task(
        &self,
        controller: &SubscriptionController,
        context: &SubscriptionContext,
        destination: &Destination,
    ) -> TaskHandle<bool> {
        let mode = self.mode;
        let key = controller.subscription_key(mode, context);
        let context_key = context.key();
        let controller = controller.clone();
        destination.submit(move |st| {
            let removed = st.unsubscribe(&key, &context_key);
            if removed {
                controller.mode_manager(mode).remove(st.name(), &key);
            }
            Ok(removed)
        })
    }

    /// A destination appeared: add it to every matching set of this mode and subscribe.
    ///
    /// All contexts matching the destination go into a single task per subscription key; the
    /// first one creates the subscription and the rest merge into it.
    pub async fn created(
        &self,
        controller: &SubscriptionController,
        destination: &Destination,
        subscriptions: &Subscriptions,
    ) {
        let contexts = subscriptions
            .iter()
            .filter(|set| set.context().mode() == self.mode && set.add(destination))
            .map(|set| set.context().clone())
            .collect::<Vec<_>>();
        if contexts.is_empty() {
            return;
        }

        let groups = contexts.into_iter().into_group_map_by(|c| controller.subscription_key(self.mode, c));
        let handles = groups
            .into_values()
            .map(|group| (destination.name().clone(), self.schedule_subscription(controller, group, destination)))
            .collect::<Vec<_>>();
        wait_all("subscribe", controller.session_id(), handles, controller.task_timeout()).await;
    }

    /// A destination went away: drop it from every set. Emptied sets without wildcard go too.
    pub fn deleted(&self, destination: &Destination, subscriptions: &Subscriptions) {
        let name = destination.name();
        let emptied = subscriptions
            .iter()
            .filter(|set| set.context().mode() == self.mode)
            .filter_map(|set| {
                let removed = set.remove(name).is_some();
                (removed && set.is_empty() && !set.context().has_wildcard()).then(|| set.key().clone())
            })
            .collect::<Vec<_>>();
        for key in emptied {
            subscriptions.remove_if(&key, |_, set| set.is_empty());
        }
        self.active.retain(|(n, _), _| n != name);
    }

    /// Subscribe `context` on every destination in `set`, including destinations that join
    /// the set while this is running.
    ///
    /// Each pass subscribes the destinations that are new since the previous snapshot, until a
    /// snapshot brings nothing new. On reload no handles are collected and `None` is returned.
    pub async fn process_subscriptions(
        &self,
        controller: &SubscriptionController,
        context: Arc<SubscriptionContext>,
        set: &DestinationSet,
        is_reload: bool,
    ) -> Result<Option<SubscribedEventManager>> {
        let mut interested = set.snapshot();
        let mut work = interested.clone();
        let mut handles = Vec::new();
        loop {
            for destination in work.iter() {
                let handle = self.schedule_subscription(controller, vec![context.clone()], destination);
                if !is_reload {
                    handles.push((destination.name().clone(), handle));
                }
            }
            let changed = set.snapshot();
            let diff = changed.iter().filter(|d| !interested.contains(d)).cloned().collect::<Vec<_>>();
            interested = changed;
            if diff.is_empty() {
                break;
            }
            log::debug!(
                "{} {} picked up {} destinations while subscribing",
                controller.session_id(),
                context.raw_filter(),
                diff.len()
            );
            work = diff;
        }

        let deadline = Instant::now() + controller.task_timeout();
        let mut first = None;
        for (name, handle) in handles {
            match handle.wait(deadline.saturating_duration_since(Instant::now())).await {
                Ok(h) => {
                    if first.is_none() {
                        first = Some(h);
                    }
                }
                Err(e) if e.is_cancelled() => {
                    log::debug!("{}/{} subscribe cancelled", controller.session_id(), name);
                }
                Err(e) => {
                    log::warn!("{}/{} subscribe {} failed, {}", controller.session_id(), name, context.raw_filter(), e);
                    return Err(e);
                }
            }
        }
        Ok(first)
    }

    /// Unsubscribe `id` from every destination of its set. Returns false if this mode does not
    /// know the id.
    pub async fn del_subscription(
        &self,
        controller: &SubscriptionController,
        id: &str,
        subscriptions: &Subscriptions,
    ) -> bool {
        let Some(key) = self.adjust_unsubscribe_id(id) else {
            return false;
        };
        let Some((_, set)) = subscriptions.remove(&key) else {
            return false;
        };
        let handles = set
            .snapshot()
            .iter()
            .map(|d| (d.name().clone(), self.create_unsubscribe_task(controller, set.context(), d)))
            .collect::<Vec<_>>();
        set.clear();
        wait_all("unsubscribe", controller.session_id(), handles, controller.task_timeout()).await;
        true
    }

    /// Reattach `session` on one destination.
    pub async fn wake(
        &self,
        controller: &SubscriptionController,
        session: Session,
        destination: &Destination,
        subscriptions: &Subscriptions,
    ) -> Option<SubscribedEventManager> {
        let handles = self
            .targets(controller, subscriptions)
            .into_iter()
            .filter(|(d, _)| d == destination)
            .map(|(d, key)| (d.name().clone(), wake_task(&d, key, session.clone())))
            .collect::<Vec<_>>();
        wait_all("wake", controller.session_id(), handles, controller.task_timeout()).await.into_iter().flatten().next()
    }

    pub async fn wake_all(&self, controller: &SubscriptionController, session: Session, subscriptions: &Subscriptions) {
        let handles = self
            .targets(controller, subscriptions)
            .into_iter()
            .map(|(d, key)| (d.name().clone(), wake_task(&d, key, session.clone())))
            .collect::<Vec<_>>();
        let woken = wait_all("wake", controller.session_id(), handles, controller.task_timeout()).await;
        let woken = woken.iter().flatten().count();
        log::debug!("{} {} mode woke {} subscriptions", controller.session_id(), self.mode, woken);
    }

    pub async fn hibernate(&self, controller: &SubscriptionController, subscriptions: &Subscriptions) {
        let handles = self
            .targets(controller, subscriptions)
            .into_iter()
            .map(|(d, key)| (d.name().clone(), hibernate_task(&d, key)))
            .collect::<Vec<_>>();
        wait_all("hibernate", controller.session_id(), handles, controller.task_timeout()).await;
    }

    /// Hibernate only the subscriptions created from `id`.
    pub async fn hibernate_subscription(
        &self,
        controller: &SubscriptionController,
        id: &str,
        subscriptions: &Subscriptions,
    ) -> bool {
        let Some(key) = self.adjust_unsubscribe_id(id) else {
            return false;
        };
        let Some(set) = subscriptions.get(&key).map(|s| s.value().clone()) else {
            return false;
        };
        let sub_key = controller.subscription_key(self.mode, set.context());
        let handles =
            set.snapshot().iter().map(|d| (d.name().clone(), hibernate_task(d, sub_key.clone()))).collect::<Vec<_>>();
        wait_all("hibernate", controller.session_id(), handles, controller.task_timeout()).await;
        true
    }

    /// Soft close: detach the session but keep every subscription and its state in the
    /// destinations, for a later reload.
    pub async fn shutdown(&self, controller: &SubscriptionController, subscriptions: &Subscriptions) {
        self.hibernate(controller, subscriptions).await;
        self.active.clear();
    }

    /// Hard close: delete every subscription of this mode. Failures are logged and skipped.
    pub async fn close(&self, controller: &SubscriptionController, subscriptions: &Subscriptions) {
        let handles = self
            .targets(controller, subscriptions)
            .into_iter()
            .map(|(d, key)| (d.name().clone(), d.submit(move |st| Ok(st.delete_subscription(&key)))))
            .collect::<Vec<_>>();
        let deleted = wait_all("close", controller.session_id(), handles, controller.task_timeout()).await;
        subscriptions.retain(|_, set| set.context().mode() != self.mode);
        self.active.clear();
        log::debug!(
            "{} {} mode closed {} subscriptions",
            controller.session_id(),
            self.mode,
            deleted.into_iter().filter(|d| *d).count()
        );
    }

    pub async fn details(&self, timeout: Duration) -> Vec<SubscriptionState> {
        let handles =
            self.handles().into_iter().map(|h| (h.destination().name().clone(), h.state())).collect::<Vec<_>>();
        wait_all("details", "", handles, timeout).await.into_iter().flatten().collect()
    }

    /// Every (destination, subscription key) this mode may have a subscription on.
    fn targets(
        &self,
        controller: &SubscriptionController,
        subscriptions: &Subscriptions,
    ) -> Vec<(Destination, SubscriptionKey)> {
        let mut targets = BTreeMap::new();
        for set in subscriptions.iter().filter(|set| set.context().mode() == self.mode) {
            let key = controller.subscription_key(self.mode, set.context());
            for d in set.snapshot() {
                targets.insert((d.name().clone(), key.clone()), d);
            }
        }
        for h in self.active.iter() {
            targets.insert(h.key().clone(), h.destination().clone());
        }
        targets.into_iter().map(|((_, key), d)| (d, key)).collect()
    }
}

fn wake_task(
    destination: &Destination,
    key: SubscriptionKey,
    session: Session,
) -> TaskHandle<Option<SubscribedEventManager>> {
    let session_id = session.id().clone();
    destination.submit(move |st| {
        let Some(destination) = st.core().destination() else {
            return Ok(None);
        };
        Ok(st
            .with_subscription(&key, |sub, core| sub.wake_up(core, session))
            .map(|_| SubscribedEventManager::new(destination, key, session_id)))
    })
}

fn hibernate_task(destination: &Destination, key: SubscriptionKey) -> TaskHandle<bool> {
    destination.submit(move |st| Ok(st.with_subscription(&key, |sub, core| sub.hibernate(core)).is_some()))
}

/// Wait for every handle concurrently, all against the same deadline. Failures are logged,
/// not returned.
async fn wait_all<R, S: std::fmt::Display>(
    what: &str,
    session_id: S,
    handles: Vec<(DestinationName, TaskHandle<R>)>,
    timeout: Duration,
) -> Vec<R> {
    let waits = handles.into_iter().map(|(name, handle)| async move { (name, handle.wait(timeout).await) });
    future::join_all(waits)
        .await
        .into_iter()
        .filter_map(|(name, res)| match res {
            Ok(r) => Some(r),
            Err(e) if e.is_cancelled() => {
                log::debug!("{}/{} {} cancelled", session_id, name, what);
                None
            }
            Err(e) => {
                log::warn!("{}/{} {} failed, {}", session_id, name, what, e);
                None
            }
        })
        .collect()
}
