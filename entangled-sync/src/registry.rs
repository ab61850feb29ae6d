//! Registry of live topics.
//!
//! Topic names are `base` or `base#suffix` (`orders#42`); a name is valid when
//! its base was registered. Topics are started on first reference and live
//! until evicted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use entangled_core::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::protocol::SyncTopicParams;
use crate::storage::Datastore;
use crate::topic::{Connection, TopicConfig, TopicError, TopicHandle};

/// Text before the first `#`.
pub fn base_name(name: &str) -> &str {
    name.split('#').next().unwrap_or(name)
}

pub struct TopicRegistry {
    datastore: Arc<dyn Datastore>,
    config: TopicConfig,
    registered: RwLock<HashSet<String>>,
    topics: RwLock<HashMap<String, TopicHandle>>,
}

impl TopicRegistry {
    pub fn new(datastore: Arc<dyn Datastore>, config: TopicConfig) -> Self {
        Self {
            datastore,
            config,
            registered: RwLock::new(HashSet::new()),
            topics: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &TopicConfig {
        &self.config
    }

    /// Allow topics named `base` and `base#…`.
    pub async fn register(&self, base: impl Into<String>) {
        let base = base.into();
        log::debug!("Registered topic base {base}");
        self.registered.write().await.insert(base);
    }

    pub async fn is_registered(&self, name: &str) -> bool {
        self.registered.read().await.contains(base_name(name))
    }

    /// Get a live topic, starting it if needed. `None` for unregistered names.
    pub async fn find(&self, name: &str) -> Option<TopicHandle> {
        // Fast path: read lock
        {
            let topics = self.topics.read().await;
            if let Some(topic) = topics.get(name).filter(|topic| !topic.is_closed()) {
                return Some(topic.clone());
            }
        }

        if !self.is_registered(name).await {
            return None;
        }

        // Slow path: write lock to create
        let mut topics = self.topics.write().await;
        // Double-check after acquiring write lock
        if let Some(topic) = topics.get(name).filter(|topic| !topic.is_closed()) {
            return Some(topic.clone());
        }

        log::debug!("Starting topic {name}");
        let topic = TopicHandle::spawn(name, self.datastore.clone(), self.config.clone());
        topics.insert(name.to_owned(), topic.clone());
        Some(topic)
    }

    /// Live topic without starting one.
    pub async fn get(&self, name: &str) -> Option<TopicHandle> {
        self.topics.read().await.get(name).cloned()
    }

    /// Publish a new value on a topic.
    pub async fn send(&self, name: &str, value: impl Into<Value>) -> Result<(), TopicError> {
        match self.find(name).await {
            Some(topic) => topic.send(value),
            None => Err(TopicError::UnknownTopic(name.to_owned())),
        }
    }

    /// Subscribe `connection` to one topic. Returns `false` for unknown topics.
    pub async fn sync_topic(
        &self,
        connection: &Connection,
        params: &SyncTopicParams,
    ) -> Result<bool, TopicError> {
        match self.find(&params.topic).await {
            Some(topic) => {
                topic
                    .subscribe(connection.clone(), params.last_received_seq)
                    .await?;
                Ok(true)
            }
            None => {
                log::debug!("Ignoring sync for unknown topic {}", params.topic);
                Ok(false)
            }
        }
    }

    /// Make `params` the exact subscription set of `connection`: listed topics
    /// are subscribed (and started if needed), every other live topic drops it.
    pub async fn sync_topics(
        &self,
        connection: &Connection,
        params: &[SyncTopicParams],
    ) -> Result<(), TopicError> {
        for item in params {
            self.find(&item.topic).await;
        }

        let topics: Vec<TopicHandle> = self.topics.read().await.values().cloned().collect();
        for topic in topics {
            let listed = params.iter().find(|item| item.topic == topic.name());
            let result = match listed {
                Some(item) => {
                    topic
                        .subscribe(connection.clone(), item.last_received_seq)
                        .await
                }
                None => topic.unsubscribe(connection.id()).await,
            };
            match result {
                Err(TopicError::Closed(name)) => log::debug!("Skipping closed topic {name}"),
                other => other?,
            }
        }
        Ok(())
    }

    /// Remove a connection from every live topic.
    pub async fn unsubscribe_all(&self, connection_id: Uuid) {
        let topics: Vec<TopicHandle> = self.topics.read().await.values().cloned().collect();
        for topic in topics {
            if let Err(e) = topic.unsubscribe(connection_id).await {
                log::debug!("Unsubscribe from {} skipped: {e}", topic.name());
            }
        }
    }

    /// Drop a live topic. Its task stops once outstanding handles are gone;
    /// the next reference reloads it from the datastore.
    pub async fn evict(&self, name: &str) -> bool {
        self.topics.write().await.remove(name).is_some()
    }

    /// Names of live topics, sorted.
    pub async fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryDatastore;
    use serde_json::json;
    use tokio::sync::mpsc;

    async fn registry(bases: &[&str]) -> (TopicRegistry, Arc<MemoryDatastore>) {
        let store = Arc::new(MemoryDatastore::new());
        let registry = TopicRegistry::new(store.clone(), TopicConfig::default());
        for base in bases {
            registry.register(*base).await;
        }
        (registry, store)
    }

    fn connection() -> (Connection, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(16);
        (Connection::new(tx), rx)
    }

    async fn subscribers(registry: &TopicRegistry, name: &str) -> usize {
        let topic = registry.get(name).await.unwrap();
        topic.snapshot().await.unwrap().subscribers
    }

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("orders"), "orders");
        assert_eq!(base_name("orders#42"), "orders");
        assert_eq!(base_name("a#b#c"), "a");
        assert_eq!(base_name(""), "");
    }

    #[tokio::test]
    async fn test_find_only_registered_names() {
        let (registry, _) = registry(&["orders"]).await;
        assert!(registry.find("orders").await.is_some());
        assert!(registry.find("orders#7").await.is_some());
        assert!(registry.find("users").await.is_none());
        assert!(registry.find("ordersX").await.is_none());
        assert_eq!(registry.topic_names().await, ["orders", "orders#7"]);
    }

    #[tokio::test]
    async fn test_find_reuses_live_topic() {
        let (registry, _) = registry(&["orders"]).await;
        let (conn, _rx) = connection();
        let first = registry.find("orders").await.unwrap();
        first.subscribe(conn, 0).await.unwrap();

        let again = registry.find("orders").await.unwrap();
        assert_eq!(again.snapshot().await.unwrap().subscribers, 1);
    }

    #[tokio::test]
    async fn test_send_to_unknown_topic() {
        let (registry, _) = registry(&["orders"]).await;
        let err = registry.send("users", json!({"a": 1})).await.unwrap_err();
        assert!(matches!(err, TopicError::UnknownTopic(name) if name == "users"));

        registry.send("orders#1", json!({"a": 1})).await.unwrap();
        let topic = registry.get("orders#1").await.unwrap();
        assert_eq!(topic.snapshot().await.unwrap().seq, 1);
    }

    #[tokio::test]
    async fn test_sync_topics_replaces_subscription_set() {
        let (registry, _) = registry(&["a", "b"]).await;
        let (conn, _rx) = connection();

        registry
            .sync_topics(&conn, &[SyncTopicParams::new("a", 0), SyncTopicParams::new("b", 0)])
            .await
            .unwrap();
        registry
            .sync_topics(&conn, &[SyncTopicParams::new("b#1", 0), SyncTopicParams::new("zzz", 0)])
            .await
            .unwrap();

        assert_eq!(subscribers(&registry, "a").await, 0);
        assert_eq!(subscribers(&registry, "b").await, 0);
        assert_eq!(subscribers(&registry, "b#1").await, 1);
        assert!(registry.get("zzz").await.is_none());
    }

    #[tokio::test]
    async fn test_sync_topic_and_unsubscribe_all() {
        let (registry, _) = registry(&["a", "b"]).await;
        let (conn, _rx) = connection();
        assert!(registry.sync_topic(&conn, &SyncTopicParams::new("a", 0)).await.unwrap());
        assert!(registry.sync_topic(&conn, &SyncTopicParams::new("b", 0)).await.unwrap());
        assert!(!registry.sync_topic(&conn, &SyncTopicParams::new("c", 0)).await.unwrap());

        registry.unsubscribe_all(conn.id()).await;
        assert_eq!(subscribers(&registry, "a").await, 0);
        assert_eq!(subscribers(&registry, "b").await, 0);
    }

    #[tokio::test]
    async fn test_evicted_topic_reloads_from_store() {
        let (registry, store) = registry(&["orders"]).await;
        registry.send("orders", json!({"n": 1})).await.unwrap();
        registry.send("orders", json!({"n": 2})).await.unwrap();
        let topic = registry.get("orders").await.unwrap();
        let before = topic.snapshot().await.unwrap();
        drop(topic);

        assert!(registry.evict("orders").await);
        assert!(!registry.evict("orders").await);
        assert!(registry.topic_names().await.is_empty());

        let reloaded = registry.find("orders").await.unwrap();
        let after = reloaded.snapshot().await.unwrap();
        assert_eq!(after.seq, before.seq);
        assert_eq!(after.value, before.value);
        assert_eq!(store.get("orders").await.unwrap().seq, before.seq);
    }
}
