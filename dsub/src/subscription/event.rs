use std::fmt;

use crate::destination::{Destination, DestinationState};
use crate::executor::TaskHandle;
use crate::session::Session;
use crate::types::{MessageId, SessionId, SubscriptionKey};

use super::{Subscription, SubscriptionState};

/// Handle the protocol layer holds for one per-destination subscription.
///
/// Every call becomes a fire-and-forget task on the destination's serializer.
#[derive(Clone)]
pub struct SubscribedEventManager {
    destination: Destination,
    key: SubscriptionKey,
    session_id: SessionId,
}

impl fmt::Debug for SubscribedEventManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscribedEventManager({}/{})", self.key, self.destination.name())
    }
}

impl PartialEq for SubscribedEventManager {
    fn eq(&self, other: &Self) -> bool {
        self.destination == other.destination && self.key == other.key
    }
}

impl SubscribedEventManager {
    #[inline]
    pub(crate) fn new(destination: Destination, key: SubscriptionKey, session_id: SessionId) -> Self {
        Self { destination, key, session_id }
    }

    #[inline]
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    #[inline]
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    #[inline]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    fn exec<F>(&self, what: &str, f: F)
    where
        F: FnOnce(&mut Subscription, &mut crate::destination::DestinationCore) + Send + 'static,
    {
        let key = self.key.clone();
        if let Err(e) = self.destination.execute(move |st: &mut DestinationState| {
            st.with_subscription(&key, f);
        }) {
            log::debug!("{}/{} {} dropped, {}", self.key, self.destination.name(), what, e);
        }
    }

    pub fn ack_received(&self, id: MessageId) {
        self.exec("ack", move |sub, core| sub.ack(core, id));
    }

    pub fn rollback_received(&self, id: MessageId) {
        self.exec("rollback", move |sub, core| sub.rollback(core, id));
    }

    pub fn update_credit(&self, credit: usize) {
        self.exec("update credit", move |sub, core| sub.update_credit(core, credit));
    }

    pub fn wake_up(&self, session: Session) {
        self.exec("wake up", move |sub, core| {
            sub.wake_up(core, session);
        });
    }

    pub fn pause(&self) {
        self.exec("pause", |sub, _| sub.pause());
    }

    pub fn resume(&self) {
        self.exec("resume", |sub, core| sub.resume(core));
    }

    pub fn hibernate(&self) {
        self.exec("hibernate", |sub, core| sub.hibernate(core));
    }

    /// Snapshot, `None` if the subscription is gone.
    pub fn state(&self) -> TaskHandle<Option<SubscriptionState>> {
        let key = self.key.clone();
        self.destination.submit(move |st| Ok(st.subscription(&key).map(|s| s.state(st.core()))))
    }
}
