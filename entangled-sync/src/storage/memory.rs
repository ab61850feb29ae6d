//! In-memory datastore.
//!
//! Used by tests and by the server when no storage path is configured.
//! Failures can be injected and upserts can be held back, which lets tests
//! drive a topic through its retry and coalescing paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{watch, RwLock};

use super::{Datastore, StoreError, TopicRecord};

pub struct MemoryDatastore {
    records: RwLock<HashMap<String, TopicRecord>>,
    fail_upserts: AtomicUsize,
    fail_loads: AtomicUsize,
    upsert_calls: AtomicUsize,
    /// `true` while upserts may proceed.
    gate: watch::Sender<bool>,
}

impl Default for MemoryDatastore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            fail_upserts: AtomicUsize::new(0),
            fail_loads: AtomicUsize::new(0),
            upsert_calls: AtomicUsize::new(0),
            gate: watch::Sender::new(true),
        }
    }

    /// Make the next `count` upserts fail.
    pub fn fail_next_upserts(&self, count: usize) {
        self.fail_upserts.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` loads fail.
    pub fn fail_next_loads(&self, count: usize) {
        self.fail_loads.store(count, Ordering::SeqCst);
    }

    /// Block upserts until [`MemoryDatastore::release_upserts`] is called.
    pub fn hold_upserts(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_upserts(&self) {
        self.gate.send_replace(true);
    }

    /// Number of upsert attempts so far, failed ones included.
    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub async fn get(&self, name: &str) -> Option<TopicRecord> {
        self.records.read().await.get(name).cloned()
    }

    pub async fn insert(&self, record: TopicRecord) {
        self.records.write().await.insert(record.name.clone(), record);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn find_one(&self, name: &str) -> Result<Option<TopicRecord>, StoreError> {
        if Self::take_failure(&self.fail_loads) {
            return Err(StoreError::Unavailable(format!("injected load failure for {name}")));
        }
        Ok(self.get(name).await)
    }

    async fn upsert(&self, record: &TopicRecord) -> Result<(), StoreError> {
        let mut gate = self.gate.subscribe();
        // The sender lives in `self`, so the wait only ends when the gate opens.
        let _ = gate.wait_for(|open| *open).await;

        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.fail_upserts) {
            return Err(StoreError::Unavailable(format!(
                "injected upsert failure for {}",
                record.name
            )));
        }
        self.insert(record.clone()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::sample_record;
    use std::sync::Arc;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_upsert_and_find() {
        let store = MemoryDatastore::new();
        assert!(store.find_one("t").await.unwrap().is_none());

        store.upsert(&sample_record("t", 1)).await.unwrap();
        store.upsert(&sample_record("t", 2)).await.unwrap();
        let found = store.find_one("t").await.unwrap().unwrap();
        assert_eq!(found.seq, 2);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.upsert_calls(), 2);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = MemoryDatastore::new();
        store.fail_next_upserts(2);
        store.fail_next_loads(1);

        assert!(store.upsert(&sample_record("t", 1)).await.is_err());
        assert!(store.upsert(&sample_record("t", 1)).await.is_err());
        assert!(store.upsert(&sample_record("t", 1)).await.is_ok());

        assert!(matches!(store.find_one("t").await, Err(StoreError::Unavailable(_))));
        assert!(store.find_one("t").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_held_upserts_wait_for_release() {
        let store = Arc::new(MemoryDatastore::new());
        store.hold_upserts();

        let writer = {
            let store = store.clone();
            tokio::spawn(async move { store.upsert(&sample_record("t", 1)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.is_empty().await);

        store.release_upserts();
        timeout(Duration::from_secs(1), writer).await.unwrap().unwrap().unwrap();
        assert_eq!(store.len().await, 1);
    }
}
