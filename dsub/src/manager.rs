//! Catalog of live destinations.
//!
//! Controllers register as [`DestinationListener`]s so wildcard subscriptions pick up
//! destinations created after the subscribe, and drop ones that are deleted.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;

use crate::destination::Destination;
use crate::message::{MemoryMessageStore, Message};
use crate::stats::Stats;
use crate::types::{DashMap, DestinationName, SessionId};

#[async_trait]
pub trait DestinationListener: Send + Sync {
    async fn created(&self, destination: &Destination);

    async fn deleted(&self, destination: &Destination);
}

/// Latest schema per destination name, kept even while the destination does not exist.
#[derive(Default)]
pub struct SchemaRegistry {
    schemas: DashMap<DestinationName, Message>,
}

impl SchemaRegistry {
    #[inline]
    pub fn get(&self, name: &str) -> Option<Message> {
        self.schemas.get(name).map(|s| s.value().clone())
    }

    #[inline]
    pub fn set(&self, name: DestinationName, schema: Message) {
        self.schemas.insert(name, schema);
    }

    #[inline]
    pub fn remove(&self, name: &str) -> Option<Message> {
        self.schemas.remove(name).map(|(_, s)| s)
    }
}

pub struct DestinationManager {
    destinations: DashMap<DestinationName, Destination>,
    listeners: DashMap<SessionId, Arc<dyn DestinationListener>>,
    schemas: Arc<SchemaRegistry>,
    stats: Arc<Stats>,
}

impl DestinationManager {
    pub fn new(schemas: Arc<SchemaRegistry>, stats: Arc<Stats>) -> Self {
        Self { destinations: DashMap::default(), listeners: DashMap::default(), schemas, stats }
    }

    #[inline]
    pub fn find(&self, name: &str) -> Option<Destination> {
        self.destinations.get(name).map(|d| d.value().clone())
    }

    /// Existing destination, or a new one announced to every listener before returning.
    pub async fn find_or_create(&self, name: &str) -> Destination {
        let created = match self.destinations.entry(DestinationName::from(name)) {
            Entry::Occupied(e) => return e.get().clone(),
            Entry::Vacant(e) => {
                let destination = Destination::new(
                    e.key().clone(),
                    Box::new(MemoryMessageStore::new()),
                    self.schemas.get(name),
                    self.stats.clone(),
                );
                e.insert(destination.clone());
                destination
            }
        };
        self.stats.destinations.inc();
        log::debug!("{} destination created", name);
        for listener in self.listeners() {
            listener.created(&created).await;
        }
        created
    }

    /// Remove from the catalog, tell every listener, then close it.
    pub async fn delete(&self, name: &str) -> Option<Destination> {
        let (_, destination) = self.destinations.remove(name)?;
        self.stats.destinations.dec();
        for listener in self.listeners() {
            listener.deleted(&destination).await;
        }
        destination.close();
        log::debug!("{} destination deleted", name);
        Some(destination)
    }

    /// Record the schema and push it to the destination if it exists.
    pub fn update_schema(&self, name: &str, schema: Message) {
        self.schemas.set(DestinationName::from(name), schema.clone());
        if let Some(destination) = self.find(name) {
            if let Err(e) = destination.update_schema(schema) {
                log::warn!("{} schema update failed, {}", name, e);
            }
        }
    }

    #[inline]
    pub fn matching<F: Fn(&str) -> bool>(&self, f: F) -> Vec<Destination> {
        self.destinations.iter().filter(|d| f(d.key())).map(|d| d.value().clone()).collect()
    }

    #[inline]
    pub fn names(&self) -> Vec<DestinationName> {
        self.destinations.iter().map(|d| d.key().clone()).collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }

    #[inline]
    pub fn add_listener(&self, id: SessionId, listener: Arc<dyn DestinationListener>) {
        self.listeners.insert(id, listener);
    }

    #[inline]
    pub fn remove_listener(&self, id: &SessionId) {
        self.listeners.remove(id);
    }

    #[inline]
    fn listeners(&self) -> Vec<Arc<dyn DestinationListener>> {
        self.listeners.iter().map(|l| l.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        created: AtomicUsize,
        deleted: AtomicUsize,
    }

    #[async_trait]
    impl DestinationListener for Recorder {
        async fn created(&self, _destination: &Destination) {
            self.created.fetch_add(1, Ordering::SeqCst);
        }

        async fn deleted(&self, _destination: &Destination) {
            self.deleted.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn create_once_and_notify() {
        let m = DestinationManager::new(Arc::default(), Arc::default());
        let rec = Arc::new(Recorder::default());
        m.add_listener("s1".into(), rec.clone());

        let a = m.find_or_create("/a").await;
        let a2 = m.find_or_create("/a").await;
        assert_eq!(a, a2);
        m.find_or_create("/b/c").await;
        assert_eq!(rec.created.load(Ordering::SeqCst), 2);
        assert_eq!(m.matching(|n| n.starts_with("/b")).len(), 1);

        assert!(m.delete("/a").await.is_some());
        assert!(m.delete("/a").await.is_none());
        assert_eq!(rec.deleted.load(Ordering::SeqCst), 1);
        assert!(m.find("/a").is_none());
        assert_eq!(m.len(), 1);

        m.remove_listener(&"s1".into());
        m.find_or_create("/d").await;
        assert_eq!(rec.created.load(Ordering::SeqCst), 2);
    }
}
