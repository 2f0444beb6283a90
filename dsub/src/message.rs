use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use dsub_utils::timestamp_millis;

use crate::types::{HashMap, MessageId, SessionId, TimestampMillis};
use crate::Result;

/// Meta key carrying the publisher's session id.
pub const META_SESSION_ID: &str = "sessionId";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Assigned by the destination when the message is stored.
    pub id: MessageId,
    pub payload: Bytes,
    pub meta: HashMap<String, String>,
    pub retain: bool,
    /// Keep for subscriptions whose session is currently detached.
    pub store_offline: bool,
    pub create_time: TimestampMillis,
    /// Absolute expiry, after which the store no longer resolves the message.
    pub expiry_time: Option<TimestampMillis>,
}

impl Message {
    #[inline]
    pub fn new<P: Into<Bytes>>(payload: P) -> Self {
        Message {
            id: 0,
            payload: payload.into(),
            meta: HashMap::default(),
            retain: false,
            store_offline: false,
            create_time: timestamp_millis(),
            expiry_time: None,
        }
    }

    #[inline]
    pub fn from_session(mut self, session_id: &SessionId) -> Self {
        self.meta.insert(META_SESSION_ID.into(), session_id.to_string());
        self
    }

    #[inline]
    pub fn meta<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    #[inline]
    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    #[inline]
    pub fn store_offline(mut self, store_offline: bool) -> Self {
        self.store_offline = store_offline;
        self
    }

    #[inline]
    pub fn expiry_interval(mut self, interval: std::time::Duration) -> Self {
        self.expiry_time = Some(self.create_time + interval.as_millis() as TimestampMillis);
        self
    }

    #[inline]
    pub fn session_id(&self) -> Option<&str> {
        self.meta.get(META_SESSION_ID).map(|s| s.as_str())
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        self.expiry_time.map(|t| t <= timestamp_millis()).unwrap_or(false)
    }
}

/// Minimal storage contract of a destination: fetch and drop messages by id.
///
/// Only ever touched from inside the owning destination's task serializer.
pub trait MessageStore: Send + 'static {
    fn put(&mut self, msg: Message) -> Result<()>;

    /// `Ok(None)` when the message is gone (removed or expired). An `Err` is a store anomaly.
    fn get(&mut self, id: MessageId) -> Result<Option<Message>>;

    fn remove(&mut self, id: MessageId) -> Option<Message>;

    fn ids(&self) -> Vec<MessageId>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct MemoryMessageStore {
    messages: BTreeMap<MessageId, Message>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageStore for MemoryMessageStore {
    #[inline]
    fn put(&mut self, msg: Message) -> Result<()> {
        self.messages.insert(msg.id, msg);
        Ok(())
    }

    #[inline]
    fn get(&mut self, id: MessageId) -> Result<Option<Message>> {
        match self.messages.get(&id) {
            Some(msg) if msg.is_expired() => {
                self.messages.remove(&id);
                Ok(None)
            }
            Some(msg) => Ok(Some(msg.clone())),
            None => Ok(None),
        }
    }

    #[inline]
    fn remove(&mut self, id: MessageId) -> Option<Message> {
        self.messages.remove(&id)
    }

    #[inline]
    fn ids(&self) -> Vec<MessageId> {
        self.messages.keys().copied().collect()
    }

    #[inline]
    fn len(&self) -> usize {
        self.messages.len()
    }
}
