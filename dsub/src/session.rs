use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::destination::Destination;
use crate::message::Message;
use crate::subscription::SubscribedEventManager;
use crate::types::{MessageId, SessionId, SubscriptionKey};

/// Protocol-layer sink for deliveries.
///
/// Called from inside the destination's task serializer, so implementations must not block.
/// Once the message has been written out, `completion.run()` must be called exactly once.
///
/// Returns false when the session can no longer take deliveries. The subscription then rolls
/// the message back and hibernates until the session is woken again.
pub trait MessageCallback: Send + Sync + 'static {
    fn send_message(
        &self,
        destination: &Destination,
        handle: SubscribedEventManager,
        message: Message,
        completion: CompletionTask,
    ) -> bool;
}

#[derive(Clone)]
pub struct Session {
    id: SessionId,
    callback: Arc<dyn MessageCallback>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session({})", self.id)
    }
}

impl Session {
    #[inline]
    pub fn new<C: MessageCallback>(id: SessionId, callback: C) -> Self {
        Self { id, callback: Arc::new(callback) }
    }

    #[inline]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    #[inline]
    pub(crate) fn send_message(
        &self,
        destination: &Destination,
        handle: SubscribedEventManager,
        message: Message,
        completion: CompletionTask,
    ) -> bool {
        self.callback.send_message(destination, handle, message, completion)
    }
}

/// Signals that a delivered message left the transport. Consumed by [`CompletionTask::run`],
/// so it can fire at most once.
///
/// Carries the generation of the session attachment it was sent under; a completion that
/// outlives a hibernate is ignored.
#[must_use = "the subscription stalls if a completion is never run"]
pub struct CompletionTask {
    destination: Destination,
    key: SubscriptionKey,
    id: MessageId,
    generation: u64,
}

impl fmt::Debug for CompletionTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompletionTask({}/{}, {})", self.key, self.destination.name(), self.id)
    }
}

impl CompletionTask {
    #[inline]
    pub(crate) fn new(destination: Destination, key: SubscriptionKey, id: MessageId, generation: u64) -> Self {
        Self { destination, key, id, generation }
    }

    #[inline]
    pub fn message_id(&self) -> MessageId {
        self.id
    }

    pub fn run(self) {
        let CompletionTask { destination, key, id, generation } = self;
        let k = key.clone();
        if let Err(e) = destination.execute(move |st| st.delivery_complete(&k, id, generation)) {
            log::debug!("{}/{} completion of {} dropped, {}", key, destination.name(), id, e);
        }
    }
}

/// One delivery as seen by a channel-driven protocol layer.
pub struct Delivery {
    pub destination: Destination,
    pub handle: SubscribedEventManager,
    pub message: Message,
    pub completion: CompletionTask,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Delivery({}, {})", self.destination.name(), self.message.id)
    }
}

/// Forwards every delivery into an unbounded channel.
pub struct ChannelCallback {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl ChannelCallback {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl MessageCallback for ChannelCallback {
    fn send_message(
        &self,
        destination: &Destination,
        handle: SubscribedEventManager,
        message: Message,
        completion: CompletionTask,
    ) -> bool {
        let delivery = Delivery { destination: destination.clone(), handle, message, completion };
        match self.tx.send(delivery) {
            Ok(()) => true,
            Err(mpsc::error::SendError(d)) => {
                log::warn!("{}/{} delivery receiver is gone", d.handle.key(), d.destination.name());
                false
            }
        }
    }
}
