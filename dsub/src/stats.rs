//! Engine-wide counters, updated from inside destination serializers.

use serde::Serialize;
use serde_json::json;

use dsub_utils::Counter;

#[derive(Debug, Default, Clone, Serialize)]
pub struct Stats {
    pub destinations: Counter,
    pub subscriptions: Counter,
    pub delivered: Counter,
    pub acked: Counter,
    pub rolled_back: Counter,
    pub expired: Counter,
    pub ignored: Counter,
}

impl Stats {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "destinations.count": self.destinations.count(),
            "destinations.max": self.destinations.max(),
            "subscriptions.count": self.subscriptions.count(),
            "subscriptions.max": self.subscriptions.max(),
            "messages.delivered": self.delivered.count(),
            "messages.acked": self.acked.count(),
            "messages.rolled_back": self.rolled_back.count(),
            "messages.expired": self.expired.count(),
            "messages.ignored": self.ignored.count(),
        })
    }
}
