use std::fmt;

use serde::{Deserialize, Serialize};

pub use dsub_utils::TimestampMillis;

pub type MessageId = u64;
pub type SessionId = bytestring::ByteString;
pub type DestinationName = bytestring::ByteString;
pub type TopicFilter = bytestring::ByteString;
/// Identity of one subscription inside a destination's registry: the session id, with a
/// suffix for browser and schema subscriptions.
pub type SubscriptionKey = bytestring::ByteString;
/// Key of a subscribe request inside a controller, namespace plus filter.
pub type ContextKey = String;
pub type SubscriptionIdentifier = u32;

pub type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;
pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    #[inline]
    pub fn value(&self) -> u8 {
        *self as u8
    }
}

impl TryFrom<u8> for QoS {
    type Error = crate::Error;
    fn try_from(v: u8) -> crate::Result<Self> {
        match v {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(crate::Error::msg(format!("invalid QoS value {v}"))),
        }
    }
}

/// What a new subscription does with the destination's retained message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RetainHandling {
    SendAlways,
    SendIfNew,
    DoNotSend,
}

/// How an outstanding message gets committed.
///
/// `Auto` commits when the transport reports the write complete, `Client` waits for an
/// explicit ack from the subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AckMode {
    Auto,
    Client,
}

impl From<QoS> for AckMode {
    #[inline]
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => AckMode::Auto,
            QoS::AtLeastOnce | QoS::ExactlyOnce => AckMode::Client,
        }
    }
}

/// Family of subscriptions a filter belongs to, picked by its namespace prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DestinationMode {
    Normal,
    Schema,
}

impl DestinationMode {
    pub const ALL: [DestinationMode; 2] = [DestinationMode::Normal, DestinationMode::Schema];

    #[inline]
    pub fn namespace(&self) -> &'static str {
        match self {
            DestinationMode::Normal => "",
            DestinationMode::Schema => "$schema/",
        }
    }

    /// Mode of a raw filter and the filter with the namespace stripped.
    #[inline]
    pub fn parse(filter: &str) -> (DestinationMode, &str) {
        match filter.strip_prefix(DestinationMode::Schema.namespace()) {
            Some(rest) => (DestinationMode::Schema, rest),
            None => (DestinationMode::Normal, filter),
        }
    }
}

impl fmt::Display for DestinationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationMode::Normal => write!(f, "normal"),
            DestinationMode::Schema => write!(f, "schema"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_from_namespace() {
        assert_eq!(DestinationMode::parse("$schema/a/b"), (DestinationMode::Schema, "a/b"));
        assert_eq!(DestinationMode::parse("/a/b"), (DestinationMode::Normal, "/a/b"));
        assert_eq!(DestinationMode::parse("$SYS/x"), (DestinationMode::Normal, "$SYS/x"));
    }

    #[test]
    fn ack_mode_follows_qos() {
        assert_eq!(AckMode::from(QoS::AtMostOnce), AckMode::Auto);
        assert_eq!(AckMode::from(QoS::ExactlyOnce), AckMode::Client);
        assert_eq!(QoS::try_from(1u8).unwrap(), QoS::AtLeastOnce);
        assert!(QoS::try_from(3u8).is_err());
    }
}
