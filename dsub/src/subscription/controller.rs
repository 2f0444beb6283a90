use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::context::EngineContext;
use crate::destination::Destination;
use crate::manager::DestinationListener;
use crate::session::Session;
use crate::types::{ContextKey, DashMap, DestinationMode, SessionId, SubscriptionKey};
use crate::Result;

use super::context::SubscriptionContext;
use super::event::SubscribedEventManager;
use super::modes::SubscriptionModeManager;
use super::set::DestinationSet;
use super::SubscriptionState;

/// Monitoring view of one controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionInformation {
    pub session_id: SessionId,
    pub hibernating: bool,
    pub persistent: bool,
    pub filters: Vec<String>,
    pub subscriptions: Vec<SubscriptionState>,
}

/// Everything one session has subscribed to, across all destinations.
///
/// Registers itself with the destination catalog so wildcard subscriptions follow
/// destinations that are created or deleted later. Call [`SubscriptionController::shutdown`]
/// or [`SubscriptionController::close`] to unregister.
#[derive(Clone)]
pub struct SubscriptionController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    scx: EngineContext,
    session_id: SessionId,
    persistent: bool,
    session: RwLock<Option<Session>>,
    subscriptions: DashMap<ContextKey, Arc<DestinationSet>>,
    normal: SubscriptionModeManager,
    schema: SubscriptionModeManager,
    closed: AtomicBool,
}

impl std::fmt::Debug for SubscriptionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SubscriptionController({}, subscriptions: {}, hibernating: {})",
            self.inner.session_id,
            self.inner.subscriptions.len(),
            self.is_hibernating()
        )
    }
}

impl SubscriptionController {
    pub fn new(scx: EngineContext, session: Session, persistent: bool) -> Self {
        let session_id = session.id().clone();
        Self::build(scx, session_id, Some(session), persistent)
    }

    /// Rebuild a persistent session's subscriptions without a live session. Messages are kept
    /// for it until [`SubscriptionController::wake_all`].
    pub async fn reload(scx: EngineContext, session_id: SessionId, contexts: Vec<SubscriptionContext>) -> Result<Self> {
        let c = Self::build(scx, session_id, None, true);
        for ctx in contexts {
            c.subscribe(ctx, true).await?;
        }
        log::debug!("{} reloaded {} subscriptions", c.session_id(), c.inner.subscriptions.len());
        Ok(c)
    }

    fn build(scx: EngineContext, session_id: SessionId, session: Option<Session>, persistent: bool) -> Self {
        let c = Self {
            inner: Arc::new(ControllerInner {
                scx,
                session_id,
                persistent,
                session: RwLock::new(session),
                subscriptions: DashMap::default(),
                normal: SubscriptionModeManager::new(DestinationMode::Normal),
                schema: SubscriptionModeManager::new(DestinationMode::Schema),
                closed: AtomicBool::new(false),
            }),
        };
        c.inner.scx.destinations.add_listener(c.inner.session_id.clone(), Arc::new(c.clone()));
        c
    }

    /// Subscribe on every destination matching `ctx`, including ones created while this runs.
    ///
    /// An existing subscription with the same filter is replaced. Returns the handle of the
    /// first destination subscribed, `None` if nothing matches yet.
    pub async fn add_subscription(&self, ctx: SubscriptionContext) -> Result<Option<SubscribedEventManager>> {
        self.subscribe(ctx, false).await
    }

    async fn subscribe(&self, ctx: SubscriptionContext, is_reload: bool) -> Result<Option<SubscribedEventManager>> {
        let key = ctx.key();
        let ctx = if self.inner.subscriptions.contains_key(&key) {
            self.del_subscription(&key).await;
            ctx.replaced()
        } else {
            ctx
        };
        let ctx = Arc::new(ctx);

        if ctx.mode() == DestinationMode::Normal && !ctx.has_wildcard() {
            self.inner.scx.destinations.find_or_create(ctx.filter()).await;
        }

        let set = Arc::new(DestinationSet::new(ctx.clone()));
        self.inner.subscriptions.insert(key, set.clone());
        for destination in self.inner.scx.destinations.matching(|name| ctx.matches(name)) {
            set.add(&destination);
        }

        self.mode_manager(ctx.mode()).process_subscriptions(self, ctx, &set, is_reload).await
    }

    /// Unsubscribe by filter. Returns false if nothing was subscribed under it.
    pub async fn del_subscription(&self, filter: &str) -> bool {
        for mode in DestinationMode::ALL {
            if self.mode_manager(mode).del_subscription(self, filter, &self.inner.subscriptions).await {
                return true;
            }
        }
        false
    }

    /// Detach the session from every subscription; in-flight messages go back to at-rest.
    pub async fn hibernate_all(&self) {
        self.inner.session.write().take();
        for mode in DestinationMode::ALL {
            self.mode_manager(mode).hibernate(self, &self.inner.subscriptions).await;
        }
    }

    pub async fn wake_all(&self, session: Session) {
        self.inner.session.write().replace(session.clone());
        for mode in DestinationMode::ALL {
            self.mode_manager(mode).wake_all(self, session.clone(), &self.inner.subscriptions).await;
        }
    }

    /// Reattach `session` to the subscriptions on one destination.
    pub async fn wake(&self, session: Session, destination: &Destination) -> Option<SubscribedEventManager> {
        self.inner.session.write().replace(session.clone());
        let mut first = None;
        for mode in DestinationMode::ALL {
            let woken =
                self.mode_manager(mode).wake(self, session.clone(), destination, &self.inner.subscriptions).await;
            first = first.or(woken);
        }
        first
    }

    pub async fn hibernate_subscription(&self, filter: &str) -> bool {
        for mode in DestinationMode::ALL {
            if self.mode_manager(mode).hibernate_subscription(self, filter, &self.inner.subscriptions).await {
                return true;
            }
        }
        false
    }

    /// The session went away. Persistent sessions keep their subscriptions hibernating in the
    /// destinations, the rest are deleted.
    pub async fn shutdown(&self) {
        if !self.persistent() {
            return self.close().await;
        }
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.scx.destinations.remove_listener(&self.inner.session_id);
        self.inner.session.write().take();
        for mode in DestinationMode::ALL {
            self.mode_manager(mode).shutdown(self, &self.inner.subscriptions).await;
        }
        log::debug!("{} subscriptions hibernated on shutdown", self.session_id());
    }

    /// Delete every subscription of this session.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.scx.destinations.remove_listener(&self.inner.session_id);
        self.inner.session.write().take();
        for mode in DestinationMode::ALL {
            self.mode_manager(mode).close(self, &self.inner.subscriptions).await;
        }
        self.inner.subscriptions.clear();
        log::debug!("{} subscriptions closed", self.session_id());
    }

    pub async fn information(&self) -> SubscriptionInformation {
        let mut subscriptions = Vec::new();
        for mode in DestinationMode::ALL {
            subscriptions.extend(self.mode_manager(mode).details(self.task_timeout()).await);
        }
        let mut filters =
            self.inner.subscriptions.iter().map(|s| s.context().raw_filter().to_owned()).collect::<Vec<_>>();
        filters.sort();
        SubscriptionInformation {
            session_id: self.inner.session_id.clone(),
            hibernating: self.is_hibernating(),
            persistent: self.persistent(),
            filters,
            subscriptions,
        }
    }

    #[inline]
    pub fn session(&self) -> Option<Session> {
        self.inner.session.read().clone()
    }

    #[inline]
    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    #[inline]
    pub fn persistent(&self) -> bool {
        self.inner.persistent
    }

    #[inline]
    pub fn is_hibernating(&self) -> bool {
        self.inner.session.read().is_none()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn context(&self) -> &EngineContext {
        &self.inner.scx
    }

    #[inline]
    pub fn destination_set(&self, filter: &str) -> Option<Arc<DestinationSet>> {
        self.inner.subscriptions.get(filter).map(|s| s.value().clone())
    }

    #[inline]
    pub fn filters(&self) -> Vec<ContextKey> {
        self.inner.subscriptions.iter().map(|s| s.key().clone()).collect()
    }

    /// Key of this session's subscription inside a destination for `ctx`: the session id,
    /// with a suffix for schema, browser and share group subscriptions.
    pub fn subscription_key(&self, mode: DestinationMode, ctx: &SubscriptionContext) -> SubscriptionKey {
        let session_id = &self.inner.session_id;
        match mode {
            DestinationMode::Schema => SubscriptionKey::from(format!("{session_id}$schema")),
            DestinationMode::Normal => match ctx.share_name() {
                Some(share) => SubscriptionKey::from(format!("{session_id}$share/{share}")),
                None if ctx.is_browser() => SubscriptionKey::from(format!(
                    "{}{}",
                    session_id, self.inner.scx.settings.subscription.browser_suffix
                )),
                None => session_id.clone(),
            },
        }
    }

    #[inline]
    pub fn credit(&self, ctx: &SubscriptionContext) -> usize {
        self.inner.scx.credit(ctx.receive_maximum())
    }

    #[inline]
    pub fn task_timeout(&self) -> Duration {
        self.inner.scx.task_timeout()
    }

    #[inline]
    pub fn mode_manager(&self, mode: DestinationMode) -> &SubscriptionModeManager {
        match mode {
            DestinationMode::Normal => &self.inner.normal,
            DestinationMode::Schema => &self.inner.schema,
        }
    }
}

#[async_trait]
impl DestinationListener for SubscriptionController {
    async fn created(&self, destination: &Destination) {
        if self.is_closed() {
            return;
        }
        for mode in DestinationMode::ALL {
            self.mode_manager(mode).created(self, destination, &self.inner.subscriptions).await;
        }
    }

    async fn deleted(&self, destination: &Destination) {
        for mode in DestinationMode::ALL {
            self.mode_manager(mode).deleted(destination, &self.inner.subscriptions);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::session::{ChannelCallback, Delivery};
    use crate::types::{QoS, RetainHandling};
    use dsub_conf::Settings;
    use tokio::sync::mpsc::UnboundedReceiver;

    const T: Duration = Duration::from_secs(5);

    fn scx() -> EngineContext {
        EngineContext::new(Settings::from_toml("[subscription]\ntask_timeout = \"5s\"").unwrap())
    }

    fn session(id: &str) -> (Session, UnboundedReceiver<Delivery>) {
        let (cb, rx) = ChannelCallback::channel();
        (Session::new(SessionId::from(id), cb), rx)
    }

    fn ctx(filter: &str, qos: QoS, receive_maximum: u16) -> SubscriptionContext {
        SubscriptionContext::builder(filter).qos(qos).receive_maximum(receive_maximum).build().unwrap()
    }

    async fn publish(scx: &EngineContext, name: &str, payload: &'static str) -> u64 {
        let d = scx.destinations.find_or_create(name).await;
        d.store_message(Message::new(payload)).wait(T).await.unwrap()
    }

    async fn recv(rx: &mut UnboundedReceiver<Delivery>) -> Delivery {
        tokio::time::timeout(T, rx.recv()).await.unwrap().unwrap()
    }

    async fn nothing(rx: &mut UnboundedReceiver<Delivery>) {
        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn delivers_in_store_order() {
        let scx = scx();
        let (s, mut rx) = session("s1");
        let c = SubscriptionController::new(scx.clone(), s, false);
        c.add_subscription(ctx("a/b", QoS::AtMostOnce, 10)).await.unwrap().unwrap();

        let mut ids = Vec::new();
        for p in ["1", "2", "3", "4", "5"] {
            ids.push(publish(&scx, "a/b", p).await);
        }
        let mut got = Vec::new();
        for _ in 0..5 {
            let d = recv(&mut rx).await;
            got.push(d.message.id);
            d.completion.run();
        }
        assert_eq!(got, ids);
        nothing(&mut rx).await;
    }

    #[tokio::test]
    async fn credit_holds_back_until_ack() {
        let scx = scx();
        let (s, mut rx) = session("s1");
        let c = SubscriptionController::new(scx.clone(), s, false);
        c.add_subscription(ctx("q", QoS::AtLeastOnce, 2)).await.unwrap();

        for p in ["1", "2", "3"] {
            publish(&scx, "q", p).await;
        }
        let first = recv(&mut rx).await;
        let second = recv(&mut rx).await;
        first.completion.run();
        second.completion.run();
        nothing(&mut rx).await;

        first.handle.ack_received(first.message.id);
        let third = recv(&mut rx).await;
        assert!(third.message.id > second.message.id);

        let state = third.handle.state().wait(T).await.unwrap().unwrap();
        assert_eq!(state.outstanding, 2);
        assert_eq!(state.credit, 2);
        assert_eq!(state.stats.acked, 1);
    }

    #[tokio::test]
    async fn hibernate_then_wake_redelivers_once_in_order() {
        let scx = scx();
        let (s, mut rx) = session("s1");
        let c = SubscriptionController::new(scx.clone(), s, true);
        c.add_subscription(ctx("q", QoS::AtLeastOnce, 2)).await.unwrap();

        let mut ids = Vec::new();
        for p in ["1", "2", "3"] {
            ids.push(publish(&scx, "q", p).await);
        }
        recv(&mut rx).await;
        recv(&mut rx).await;

        c.hibernate_all().await;
        assert!(c.is_hibernating());
        let info = c.information().await;
        assert_eq!(info.subscriptions[0].in_flight, 0);
        assert_eq!(info.subscriptions[0].pending, 3);

        let (s2, mut rx2) = session("s1");
        c.wake_all(s2).await;
        let mut got = Vec::new();
        for _ in 0..3 {
            let d = recv(&mut rx2).await;
            d.completion.run();
            d.handle.ack_received(d.message.id);
            got.push(d.message.id);
        }
        assert_eq!(got, ids);
        nothing(&mut rx2).await;
    }

    #[tokio::test]
    async fn hibernating_subscription_keeps_only_offline_messages() {
        let scx = scx();
        let (s, _rx) = session("s1");
        let c = SubscriptionController::new(scx.clone(), s, true);
        c.add_subscription(ctx("q", QoS::AtLeastOnce, 5)).await.unwrap();
        c.hibernate_all().await;

        let d = scx.destinations.find_or_create("q").await;
        d.store_message(Message::new("dropped")).wait(T).await.unwrap();
        let kept = d.store_message(Message::new("kept").store_offline(true)).wait(T).await.unwrap();

        let (s2, mut rx2) = session("s1");
        c.wake_all(s2).await;
        assert_eq!(recv(&mut rx2).await.message.id, kept);
        nothing(&mut rx2).await;
    }

    #[tokio::test]
    async fn unsubscribe_removes_from_registry() {
        let scx = scx();
        let (s, _rx) = session("s1");
        let c = SubscriptionController::new(scx.clone(), s, false);
        c.add_subscription(ctx("a", QoS::AtMostOnce, 0)).await.unwrap();
        let d = scx.destinations.find("a").unwrap();
        assert_eq!(d.details().wait(T).await.unwrap().len(), 1);

        assert!(c.del_subscription("a").await);
        assert!(!c.del_subscription("a").await);
        assert!(d.details().wait(T).await.unwrap().is_empty());
        assert!(c.information().await.subscriptions.is_empty());
        assert!(c.destination_set("a").is_none());
    }

    #[tokio::test]
    async fn deleted_destination_drops_exact_set_keeps_wildcard() {
        let scx = scx();
        let (s, _rx) = session("s1");
        let c = SubscriptionController::new(scx.clone(), s, false);
        c.add_subscription(ctx("a/1", QoS::AtMostOnce, 0)).await.unwrap();
        c.add_subscription(ctx("a/+", QoS::AtMostOnce, 0)).await.unwrap();
        assert_eq!(c.destination_set("a/+").unwrap().len(), 1);

        scx.destinations.delete("a/1").await.unwrap();
        assert!(c.destination_set("a/1").is_none());
        let wildcard = c.destination_set("a/+").unwrap();
        assert!(wildcard.is_empty());

        scx.destinations.find_or_create("a/2").await;
        assert!(wildcard.contains("a/2"));
        assert_eq!(c.information().await.subscriptions.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn wildcard_converges_with_concurrent_creates() {
        let scx = scx();
        for i in 0..5 {
            scx.destinations.find_or_create(&format!("sensors/{i}")).await;
        }
        let (s, _rx) = session("s1");
        let c = SubscriptionController::new(scx.clone(), s, false);

        let creators = (5..40)
            .map(|i| {
                let scx = scx.clone();
                tokio::spawn(async move {
                    scx.destinations.find_or_create(&format!("sensors/{i}")).await;
                    scx.destinations.find_or_create(&format!("other/{i}")).await;
                })
            })
            .collect::<Vec<_>>();
        c.add_subscription(ctx("sensors/+", QoS::AtLeastOnce, 0)).await.unwrap();
        for r in futures::future::join_all(creators).await {
            r.unwrap();
        }

        for i in 0..40 {
            let d = scx.destinations.find(&format!("sensors/{i}")).unwrap();
            let details = d.details().wait(T).await.unwrap();
            assert_eq!(details.len(), 1, "sensors/{i}");
            assert_eq!(details[0].filters, vec!["sensors/+".to_owned()]);
        }
        for i in 5..40 {
            let d = scx.destinations.find(&format!("other/{i}")).unwrap();
            assert!(d.details().wait(T).await.unwrap().is_empty());
        }
        assert_eq!(c.information().await.subscriptions.len(), 40);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sensors_scenario() {
        let scx = scx();
        scx.destinations.find_or_create("/sensors/1").await;
        scx.destinations.find_or_create("/sensors/2").await;
        let (s, mut rx) = session("s1");
        let c = SubscriptionController::new(scx.clone(), s, false);

        let creator = {
            let scx = scx.clone();
            tokio::spawn(async move { scx.destinations.find_or_create("/sensors/3").await })
        };
        c.add_subscription(ctx("/sensors/#", QoS::AtLeastOnce, 2)).await.unwrap().unwrap();
        creator.await.unwrap();

        let set = c.destination_set("/sensors/#").unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(c.information().await.subscriptions.len(), 3);

        for p in ["1", "2", "3"] {
            publish(&scx, "/sensors/3", p).await;
        }
        let first = recv(&mut rx).await;
        let _second = recv(&mut rx).await;
        nothing(&mut rx).await;
        first.handle.ack_received(first.message.id);
        let third = recv(&mut rx).await;
        assert_eq!(*third.destination.name(), "/sensors/3");
    }

    #[tokio::test]
    async fn merged_contexts_share_one_subscription() {
        let scx = scx();
        let (s, mut rx) = session("s1");
        let c = SubscriptionController::new(scx.clone(), s, false);
        c.add_subscription(ctx("x/+", QoS::AtMostOnce, 5)).await.unwrap();
        c.add_subscription(ctx("x/#", QoS::AtMostOnce, 5)).await.unwrap();
        c.add_subscription(ctx("x/1", QoS::AtMostOnce, 5)).await.unwrap();

        let d = scx.destinations.find("x/1").unwrap();
        let details = d.details().wait(T).await.unwrap();
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].filters.len(), 3);

        publish(&scx, "x/1", "once").await;
        recv(&mut rx).await.completion.run();
        nothing(&mut rx).await;

        // one context gone, the subscription stays
        assert!(c.del_subscription("x/#").await);
        assert_eq!(d.details().wait(T).await.unwrap()[0].filters.len(), 2);
    }

    #[tokio::test]
    async fn no_local_skips_own_messages() {
        let scx = scx();
        let (s, mut rx) = session("s1");
        let c = SubscriptionController::new(scx.clone(), s, false);
        let nl = SubscriptionContext::builder("chat").no_local(true).receive_maximum(5).build().unwrap();
        c.add_subscription(nl).await.unwrap();

        let d = scx.destinations.find("chat").unwrap();
        d.store_message(Message::new("mine").from_session(&SessionId::from("s1"))).wait(T).await.unwrap();
        let theirs = d.store_message(Message::new("theirs").from_session(&SessionId::from("s2"))).wait(T).await.unwrap();
        assert_eq!(recv(&mut rx).await.message.id, theirs);
        nothing(&mut rx).await;
    }

    #[tokio::test]
    async fn selector_filters_messages() {
        let scx = scx();
        let (s, mut rx) = session("s1");
        let c = SubscriptionController::new(scx.clone(), s, false);
        let sel = SubscriptionContext::builder("orders").selector("region = 'eu'").receive_maximum(5).build().unwrap();
        c.add_subscription(sel).await.unwrap();

        let d = scx.destinations.find("orders").unwrap();
        d.store_message(Message::new("1").meta("region", "us")).wait(T).await.unwrap();
        let eu = d.store_message(Message::new("2").meta("region", "eu")).wait(T).await.unwrap();
        d.store_message(Message::new("3")).wait(T).await.unwrap();
        assert_eq!(recv(&mut rx).await.message.id, eu);
        nothing(&mut rx).await;

        let state = c.information().await.subscriptions.remove(0);
        assert_eq!(state.stats.ignored, 2);
    }

    #[tokio::test]
    async fn retained_message_follows_retain_handling() {
        let scx = scx();
        let d = scx.destinations.find_or_create("r").await;
        let retained = d.store_message(Message::new("last").retain(true)).wait(T).await.unwrap();

        let (s, mut rx) = session("s1");
        let c = SubscriptionController::new(scx.clone(), s, false);
        c.add_subscription(ctx("r", QoS::AtMostOnce, 5)).await.unwrap();
        assert_eq!(recv(&mut rx).await.message.id, retained);

        let (s2, mut rx2) = session("s2");
        let c2 = SubscriptionController::new(scx.clone(), s2, false);
        let none =
            SubscriptionContext::builder("r").retain_handling(RetainHandling::DoNotSend).build().unwrap();
        c2.add_subscription(none).await.unwrap();
        nothing(&mut rx2).await;

        // resubscribing with SEND_IF_NEW does not replay
        let (s3, mut rx3) = session("s3");
        let c3 = SubscriptionController::new(scx.clone(), s3, false);
        let if_new = || SubscriptionContext::builder("r").retain_handling(RetainHandling::SendIfNew).build().unwrap();
        c3.add_subscription(if_new()).await.unwrap();
        recv(&mut rx3).await.completion.run();
        c3.add_subscription(if_new()).await.unwrap();
        nothing(&mut rx3).await;
    }

    #[tokio::test]
    async fn browser_reads_without_consuming() {
        let scx = scx();
        let d = scx.destinations.find_or_create("log").await;
        let (s, mut rx) = session("s1");
        let c = SubscriptionController::new(scx.clone(), s, false);
        c.add_subscription(ctx("log", QoS::AtLeastOnce, 5)).await.unwrap();
        let first = d.store_message(Message::new("1")).wait(T).await.unwrap();
        recv(&mut rx).await;

        let (b, mut brx) = session("b1");
        let browser = SubscriptionController::new(scx.clone(), b, false);
        let h = browser
            .add_subscription(SubscriptionContext::builder("log").browser(true).receive_maximum(5).build().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*h.key(), "b1$browse");
        assert_eq!(recv(&mut brx).await.message.id, first);
        assert_eq!(d.details().wait(T).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn schema_subscription_gets_updates() {
        let scx = scx();
        scx.destinations.find_or_create("dev/1").await;
        scx.destinations.update_schema("dev/1", Message::new("v1"));

        let (s, mut rx) = session("s1");
        let c = SubscriptionController::new(scx.clone(), s, false);
        let h = c
            .add_subscription(SubscriptionContext::builder("$schema/dev/+").build().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*h.key(), "s1$schema");
        assert_eq!(&recv(&mut rx).await.message.payload[..], b"v1");

        scx.destinations.update_schema("dev/1", Message::new("v2"));
        assert_eq!(&recv(&mut rx).await.message.payload[..], b"v2");

        publish(&scx, "dev/1", "data").await;
        nothing(&mut rx).await;

        assert!(!c.del_subscription("dev/+").await);
        assert!(c.del_subscription("$schema/dev/+").await);
    }

    #[tokio::test]
    async fn reload_then_wake_delivers_offline_messages() {
        let scx = scx();
        let contexts = vec![ctx("jobs", QoS::AtLeastOnce, 5)];
        let c = SubscriptionController::reload(scx.clone(), SessionId::from("p1"), contexts).await.unwrap();
        assert!(c.is_hibernating());

        let d = scx.destinations.find("jobs").unwrap();
        let id = d.store_message(Message::new("job").store_offline(true)).wait(T).await.unwrap();

        let (s, mut rx) = session("p1");
        c.wake_all(s).await;
        assert_eq!(recv(&mut rx).await.message.id, id);
    }

    #[tokio::test]
    async fn shutdown_and_close() {
        let scx = scx();
        let (s, _rx) = session("p1");
        let persistent = SubscriptionController::new(scx.clone(), s, true);
        persistent.add_subscription(ctx("k", QoS::AtLeastOnce, 0)).await.unwrap();
        persistent.shutdown().await;
        let d = scx.destinations.find("k").unwrap();
        let details = d.details().wait(T).await.unwrap();
        assert_eq!(details.len(), 1);
        assert!(details[0].hibernating);

        let (s, _rx) = session("t1");
        let transient = SubscriptionController::new(scx.clone(), s, false);
        transient.add_subscription(ctx("k", QoS::AtLeastOnce, 0)).await.unwrap();
        assert_eq!(d.details().wait(T).await.unwrap().len(), 2);
        transient.shutdown().await;
        assert_eq!(d.details().wait(T).await.unwrap().len(), 1);
        assert!(transient.is_closed());
        assert!(transient.information().await.subscriptions.is_empty());
    }

    #[tokio::test]
    async fn refused_delivery_hibernates_instead_of_resending() {
        let scx = scx();
        let (s, rx) = session("s1");
        let c = SubscriptionController::new(scx.clone(), s, true);
        let h = c.add_subscription(ctx("q", QoS::AtLeastOnce, 1)).await.unwrap().unwrap();
        drop(rx);

        let id = publish(&scx, "q", "1").await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let state = h.state().wait(T).await.unwrap().unwrap();
        assert_eq!(state.stats.sent, 1);
        assert!(state.hibernating);
        assert_eq!(state.pending, 1);
        assert_eq!(state.outstanding, 0);

        let (s2, mut rx2) = session("s1");
        c.wake_all(s2).await;
        assert_eq!(recv(&mut rx2).await.message.id, id);
    }

    #[tokio::test]
    async fn merged_selector_does_not_filter_other_contexts() {
        let scx = scx();
        let eu = || SubscriptionContext::builder("x/1").selector("region = 'eu'").receive_maximum(5).build().unwrap();

        // filtered context first, plain one merged in
        let (s, mut rx) = session("s1");
        let c = SubscriptionController::new(scx.clone(), s, false);
        c.add_subscription(eu()).await.unwrap();
        c.add_subscription(ctx("x/+", QoS::AtMostOnce, 5)).await.unwrap();

        // plain context first, filtered one merged in
        let (s2, mut rx2) = session("s2");
        let c2 = SubscriptionController::new(scx.clone(), s2, false);
        c2.add_subscription(ctx("x/+", QoS::AtMostOnce, 5)).await.unwrap();
        c2.add_subscription(eu()).await.unwrap();

        let d = scx.destinations.find("x/1").unwrap();
        let us = d.store_message(Message::new("us").meta("region", "us")).wait(T).await.unwrap();
        let d1 = recv(&mut rx).await;
        assert_eq!(d1.message.id, us);
        d1.completion.run();
        let d2 = recv(&mut rx2).await;
        assert_eq!(d2.message.id, us);
        d2.completion.run();

        // without the plain context the selector applies again
        assert!(c.del_subscription("x/+").await);
        let next = d.store_message(Message::new("us").meta("region", "us")).wait(T).await.unwrap();
        nothing(&mut rx).await;
        assert_eq!(recv(&mut rx2).await.message.id, next);
    }

    #[tokio::test]
    async fn no_local_applies_to_its_own_context_only() {
        let scx = scx();
        scx.destinations.find_or_create("chat/1").await;
        let (s, mut rx) = session("s1");
        let c = SubscriptionController::new(scx.clone(), s, false);
        let nl = SubscriptionContext::builder("chat/#").no_local(true).receive_maximum(5).build().unwrap();
        c.add_subscription(nl).await.unwrap();
        c.add_subscription(ctx("chat/1", QoS::AtMostOnce, 5)).await.unwrap();

        let d = scx.destinations.find("chat/1").unwrap();
        let mine =
            d.store_message(Message::new("mine").from_session(&SessionId::from("s1"))).wait(T).await.unwrap();
        assert_eq!(recv(&mut rx).await.message.id, mine);
    }

    fn shared(credit: u16) -> SubscriptionContext {
        SubscriptionContext::builder("$share/g/jobs").qos(QoS::AtLeastOnce).receive_maximum(credit).build().unwrap()
    }

    #[tokio::test]
    async fn shared_group_takes_turns() {
        let scx = scx();
        let (s1, mut rx1) = session("s1");
        let (s2, mut rx2) = session("s2");
        let c1 = SubscriptionController::new(scx.clone(), s1, false);
        let c2 = SubscriptionController::new(scx.clone(), s2, false);
        let h1 = c1.add_subscription(shared(5)).await.unwrap().unwrap();
        c2.add_subscription(shared(5)).await.unwrap();
        assert_eq!(*h1.key(), "s1$share/g");

        let mut ids = Vec::new();
        for p in ["1", "2", "3", "4"] {
            ids.push(publish(&scx, "jobs", p).await);
        }
        let got = vec![
            recv(&mut rx1).await.message.id,
            recv(&mut rx2).await.message.id,
            recv(&mut rx1).await.message.id,
            recv(&mut rx2).await.message.id,
        ];
        assert_eq!(got, ids);
        nothing(&mut rx1).await;
        nothing(&mut rx2).await;

        let state = h1.state().wait(T).await.unwrap().unwrap();
        assert_eq!(state.share.as_deref(), Some("g"));
        assert_eq!(state.outstanding, 2);
        assert_eq!(state.in_flight, 4);
        let d = scx.destinations.find("jobs").unwrap();
        assert_eq!(d.details().wait(T).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn shared_group_member_credit_and_leave() {
        let scx = scx();
        let (s1, mut rx1) = session("s1");
        let (s2, mut rx2) = session("s2");
        let c1 = SubscriptionController::new(scx.clone(), s1, false);
        let c2 = SubscriptionController::new(scx.clone(), s2, false);
        c1.add_subscription(shared(1)).await.unwrap();
        c2.add_subscription(shared(5)).await.unwrap();

        let mut ids = Vec::new();
        for p in ["1", "2", "3"] {
            ids.push(publish(&scx, "jobs", p).await);
        }
        // s1 is out of credit after the first, s2 takes the rest
        let first = recv(&mut rx1).await;
        assert_eq!(first.message.id, ids[0]);
        assert_eq!(recv(&mut rx2).await.message.id, ids[1]);
        assert_eq!(recv(&mut rx2).await.message.id, ids[2]);

        // s2 leaves with two unacked; nobody can take them until s1 acks
        assert!(c2.del_subscription("$share/g/jobs").await);
        nothing(&mut rx1).await;
        first.handle.ack_received(first.message.id);
        let next = recv(&mut rx1).await;
        assert_eq!(next.message.id, ids[1]);
        next.handle.ack_received(next.message.id);
        assert_eq!(recv(&mut rx1).await.message.id, ids[2]);

        // last member out closes the group
        assert!(c1.del_subscription("$share/g/jobs").await);
        let d = scx.destinations.find("jobs").unwrap();
        assert!(d.details().wait(T).await.unwrap().is_empty());
        assert!(d.submit(|st| Ok(st.core().share("g").is_none())).wait(T).await.unwrap());
    }

    #[tokio::test]
    async fn update_credit_widens_window() {
        let scx = scx();
        let (s, mut rx) = session("s1");
        let c = SubscriptionController::new(scx.clone(), s, false);
        let h = c.add_subscription(ctx("q", QoS::AtLeastOnce, 1)).await.unwrap().unwrap();
        publish(&scx, "q", "1").await;
        publish(&scx, "q", "2").await;
        let first = recv(&mut rx).await;
        nothing(&mut rx).await;

        h.update_credit(2);
        let second = recv(&mut rx).await;
        assert!(second.message.id > first.message.id);
        let state = h.state().wait(T).await.unwrap().unwrap();
        assert_eq!(state.credit, 2);
        assert_eq!(state.outstanding, 2);
    }

    #[tokio::test]
    async fn pause_resume_and_sync_hold() {
        let scx = scx();
        let (s, mut rx) = session("s1");
        let c = SubscriptionController::new(scx.clone(), s, false);
        let sync = SubscriptionContext::builder("s").sync(true).receive_maximum(5).build().unwrap();
        let h = c.add_subscription(sync).await.unwrap().unwrap();

        let held = publish(&scx, "s", "1").await;
        nothing(&mut rx).await;
        assert!(h.state().wait(T).await.unwrap().unwrap().sync);
        h.resume();
        let d = recv(&mut rx).await;
        assert_eq!(d.message.id, held);
        d.completion.run();

        h.pause();
        let paused = publish(&scx, "s", "2").await;
        nothing(&mut rx).await;
        let state = h.state().wait(T).await.unwrap().unwrap();
        assert!(state.paused && !state.sync);
        assert_eq!(state.pending, 1);
        h.resume();
        assert_eq!(recv(&mut rx).await.message.id, paused);
    }

    #[tokio::test]
    async fn hibernate_subscription_by_filter() {
        let scx = scx();
        let (s, mut rx) = session("s1");
        let c = SubscriptionController::new(scx.clone(), s, true);
        c.add_subscription(ctx("a", QoS::AtLeastOnce, 5)).await.unwrap();
        c.add_subscription(ctx("b", QoS::AtLeastOnce, 5)).await.unwrap();

        assert!(c.hibernate_subscription("a").await);
        assert!(!c.hibernate_subscription("nope").await);
        let a = scx.destinations.find("a").unwrap();
        let b = scx.destinations.find("b").unwrap();
        assert!(a.details().wait(T).await.unwrap()[0].hibernating);
        assert!(!b.details().wait(T).await.unwrap()[0].hibernating);

        publish(&scx, "a", "dropped").await;
        let id = publish(&scx, "b", "kept").await;
        assert_eq!(recv(&mut rx).await.message.id, id);
        nothing(&mut rx).await;
    }

    #[tokio::test]
    async fn wake_one_destination() {
        let scx = scx();
        let (s, _rx) = session("s1");
        let c = SubscriptionController::new(scx.clone(), s, true);
        c.add_subscription(ctx("a", QoS::AtLeastOnce, 5)).await.unwrap();
        c.add_subscription(ctx("b", QoS::AtLeastOnce, 5)).await.unwrap();
        c.hibernate_all().await;

        let a = scx.destinations.find("a").unwrap();
        let b = scx.destinations.find("b").unwrap();
        let (s2, mut rx2) = session("s1");
        let h = c.wake(s2, &a).await.unwrap();
        assert_eq!(h.destination(), &a);
        assert!(!c.is_hibernating());
        assert!(!a.details().wait(T).await.unwrap()[0].hibernating);
        assert!(b.details().wait(T).await.unwrap()[0].hibernating);

        let id = publish(&scx, "a", "1").await;
        publish(&scx, "b", "2").await;
        assert_eq!(recv(&mut rx2).await.message.id, id);
        nothing(&mut rx2).await;
    }

    #[tokio::test]
    async fn send_if_new_replays_retained_on_wake() {
        let scx = scx();
        let d = scx.destinations.find_or_create("r").await;
        let retained = d.store_message(Message::new("last").retain(true)).wait(T).await.unwrap();

        let (s, mut rx) = session("s1");
        let c = SubscriptionController::new(scx.clone(), s, true);
        let if_new = SubscriptionContext::builder("r")
            .retain_handling(RetainHandling::SendIfNew)
            .receive_maximum(5)
            .build()
            .unwrap();
        c.add_subscription(if_new).await.unwrap();
        let first = recv(&mut rx).await;
        assert_eq!(first.message.id, retained);
        first.completion.run();

        c.hibernate_all().await;
        let (s2, mut rx2) = session("s1");
        c.wake_all(s2).await;
        assert_eq!(recv(&mut rx2).await.message.id, retained);
        nothing(&mut rx2).await;
    }

    #[tokio::test]
    async fn rollback_redelivers_in_store_order() {
        let scx = scx();
        let (s, mut rx) = session("s1");
        let c = SubscriptionController::new(scx.clone(), s, false);
        c.add_subscription(ctx("q", QoS::AtLeastOnce, 2)).await.unwrap();
        let mut ids = Vec::new();
        for p in ["1", "2", "3"] {
            ids.push(publish(&scx, "q", p).await);
        }
        let first = recv(&mut rx).await;
        recv(&mut rx).await;
        nothing(&mut rx).await;

        first.handle.rollback_received(first.message.id);
        let again = recv(&mut rx).await;
        assert_eq!(again.message.id, ids[0]);
        nothing(&mut rx).await;
        let state = again.handle.state().wait(T).await.unwrap().unwrap();
        assert_eq!(state.stats.rolled_back, 1);
        assert_eq!(state.pending, 1);
    }

    #[tokio::test]
    async fn expired_message_skipped_and_delivery_continues() {
        let scx = scx();
        let (s, mut rx) = session("s1");
        let c = SubscriptionController::new(scx.clone(), s, false);
        c.add_subscription(ctx("q", QoS::AtLeastOnce, 1)).await.unwrap();
        let d = scx.destinations.find("q").unwrap();

        d.store_message(Message::new("1")).wait(T).await.unwrap();
        let first = recv(&mut rx).await;
        d.store_message(Message::new("2").expiry_interval(Duration::from_millis(20))).wait(T).await.unwrap();
        let live = d.store_message(Message::new("3")).wait(T).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        first.handle.ack_received(first.message.id);
        let next = recv(&mut rx).await;
        assert_eq!(next.message.id, live);
        let state = next.handle.state().wait(T).await.unwrap().unwrap();
        assert_eq!(state.stats.expired, 1);
        assert_eq!(state.pending, 0);
    }

    #[tokio::test]
    async fn stale_completion_after_wake_is_ignored() {
        let scx = scx();
        let (s, mut rx) = session("s1");
        let c = SubscriptionController::new(scx.clone(), s, true);
        c.add_subscription(ctx("z", QoS::AtMostOnce, 1)).await.unwrap();
        let id = publish(&scx, "z", "1").await;
        let old = recv(&mut rx).await;

        c.hibernate_all().await;
        let (s2, mut rx2) = session("s1");
        c.wake_all(s2).await;
        let again = recv(&mut rx2).await;
        assert_eq!(again.message.id, id);

        let second = publish(&scx, "z", "2").await;
        old.completion.run();
        nothing(&mut rx2).await;
        assert_eq!(again.handle.state().wait(T).await.unwrap().unwrap().outstanding, 1);

        again.completion.run();
        assert_eq!(recv(&mut rx2).await.message.id, second);
    }

    #[tokio::test]
    async fn wake_clears_pause() {
        let scx = scx();
        let (s, _rx) = session("s1");
        let c = SubscriptionController::new(scx.clone(), s, true);
        let h = c.add_subscription(ctx("p", QoS::AtLeastOnce, 5)).await.unwrap().unwrap();
        h.pause();
        c.hibernate_all().await;

        let (s2, mut rx2) = session("s1");
        c.wake_all(s2).await;
        let id = publish(&scx, "p", "1").await;
        assert_eq!(recv(&mut rx2).await.message.id, id);
        assert!(!h.state().wait(T).await.unwrap().unwrap().paused);
    }
}
