use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::destination::Destination;
use crate::types::DestinationName;

use super::context::SubscriptionContext;

/// The destinations that currently match one subscribe request.
///
/// Membership only ever holds destinations whose name matches the context's filter.
pub struct DestinationSet {
    context: Arc<SubscriptionContext>,
    destinations: RwLock<BTreeMap<DestinationName, Destination>>,
}

impl std::fmt::Debug for DestinationSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DestinationSet({}, {:?})", self.context.raw_filter(), self.names())
    }
}

impl DestinationSet {
    #[inline]
    pub fn new(context: Arc<SubscriptionContext>) -> Self {
        Self { context, destinations: RwLock::new(BTreeMap::new()) }
    }

    #[inline]
    pub fn context(&self) -> &Arc<SubscriptionContext> {
        &self.context
    }

    #[inline]
    pub fn matches(&self, name: &str) -> bool {
        self.context.matches(name)
    }

    /// Returns false if the destination does not match or is already a member.
    #[inline]
    pub fn add(&self, destination: &Destination) -> bool {
        if !self.matches(destination.name()) {
            return false;
        }
        let mut destinations = self.destinations.write();
        if destinations.contains_key(destination.name()) {
            return false;
        }
        destinations.insert(destination.name().clone(), destination.clone());
        true
    }

    #[inline]
    pub fn remove(&self, name: &str) -> Option<Destination> {
        self.destinations.write().remove(name)
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.destinations.read().contains_key(name)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.destinations.read().is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.destinations.read().len()
    }

    #[inline]
    pub fn snapshot(&self) -> Vec<Destination> {
        self.destinations.read().values().cloned().collect()
    }

    #[inline]
    pub fn names(&self) -> Vec<DestinationName> {
        self.destinations.read().keys().cloned().collect()
    }

    #[inline]
    pub fn clear(&self) {
        self.destinations.write().clear()
    }
}
