//! Persistence integration tests.
//!
//! Topics run on a RocksDB store; state must survive the topic layer (and
//! the database) being torn down and opened again.

use std::path::Path;
use std::sync::Arc;

use entangled_core::{Dto, Value};
use entangled_sync::registry::TopicRegistry;
use entangled_sync::storage::{Datastore, RocksDatastore, StoreConfig};
use entangled_sync::topic::{Connection, TopicConfig};
use serde_json::json;
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant};

async fn registry_on(store: &RocksDatastore) -> TopicRegistry {
    let registry = TopicRegistry::new(Arc::new(store.clone()), TopicConfig::default());
    registry.register("inventory").await;
    registry
}

/// Send each value and wait until it is persisted.
async fn publish_all(registry: &TopicRegistry, name: &str, values: &[serde_json::Value]) {
    let topic = registry.find(name).await.unwrap();
    for (i, value) in values.iter().enumerate() {
        topic.send(value.clone()).unwrap();
        timeout(Duration::from_secs(5), async {
            while topic.snapshot().await.unwrap().seq < i as u64 + 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}

/// Reopen a database whose previous handle may still be shutting down.
async fn reopen(path: &Path) -> RocksDatastore {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match RocksDatastore::open(StoreConfig::for_testing(path)) {
            Ok(store) => return store,
            Err(_) if Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => panic!("failed to reopen store: {e}"),
        }
    }
}

fn values(count: usize) -> Vec<serde_json::Value> {
    (1..=count)
        .map(|i| json!({"sku": "A-1", "stock": i, "bins": [{"id": "x", "qty": i * 2}]}))
        .collect()
}

#[tokio::test]
async fn test_topic_state_is_persisted() {
    let dir = tempdir().unwrap();
    let store = RocksDatastore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let registry = registry_on(&store).await;
    let values = values(3);
    publish_all(&registry, "inventory#1", &values).await;

    let record = store.find_one("inventory#1").await.unwrap().unwrap();
    assert_eq!(record.seq, 3);
    let current = Dto::from_compressed(record.data.clone());
    assert_eq!(current.value().unwrap(), &Value::from(values[2].clone()));

    // Every stored delta leads from its version to the current value.
    let seqs: Vec<u64> = record.deltas.iter().map(|entry| entry.seq).collect();
    assert_eq!(seqs, [2, 1]);
    for entry in &record.deltas {
        let old = Dto::from_compressed(entry.data_compressed.clone());
        let patched = old.patch_compressed(&entry.diff_compressed).unwrap();
        assert!(patched.same_as(&current).unwrap());
    }
}

#[tokio::test]
async fn test_registry_restart_resumes_sequence() {
    let dir = tempdir().unwrap();
    let store = RocksDatastore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let values = values(7);
    {
        let registry = registry_on(&store).await;
        publish_all(&registry, "inventory", &values[..4]).await;
    }

    let registry = registry_on(&store).await;
    let topic = registry.find("inventory").await.unwrap();
    let snapshot = topic.snapshot().await.unwrap();
    assert_eq!(snapshot.seq, 4);
    assert_eq!(snapshot.value, Some(Value::from(values[3].clone())));
    assert_eq!(snapshot.history, [3, 2, 1]);

    publish_all(&registry, "inventory", &values[4..]).await;
    let snapshot = topic.snapshot().await.unwrap();
    assert_eq!(snapshot.seq, 7);
    assert_eq!(snapshot.history, [6, 5, 4, 3, 2]);
}

#[tokio::test]
async fn test_reopened_database_serves_deltas() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let values = values(3);
    {
        let store = RocksDatastore::open(StoreConfig::for_testing(&path)).unwrap();
        let registry = registry_on(&store).await;
        publish_all(&registry, "inventory#9", &values).await;
        store.flush().unwrap();
    }

    let store = reopen(&path).await;
    assert_eq!(store.list_topics().unwrap(), ["inventory#9"]);
    let registry = registry_on(&store).await;

    // A subscriber that already holds seq 2 only needs the last delta.
    let (tx, mut rx) = mpsc::channel(8);
    let connection = Connection::new(tx);
    registry.find("inventory#9").await.unwrap().subscribe(connection, 2).await.unwrap();

    let text = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    let message: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(message["topic"], "inventory#9");
    assert_eq!(message["seq"], 3);
    assert_eq!(message["deltaSeq"], 2);

    let v2 = Dto::new(values[1].clone()).unwrap();
    let delta = message["delta"].as_str().unwrap();
    assert_eq!(
        v2.patch_compressed(delta).unwrap().value().unwrap(),
        &Value::from(values[2].clone())
    );
}
