//! Persistence port for topic state, with in-memory and RocksDB adapters.
//!
//! ```text
//! ┌─────────────┐  find_one / upsert  ┌──────────────────┐
//! │ Topic actor │ ──────────────────► │ dyn Datastore    │
//! └─────────────┘                     ├──────────────────┤
//!                                     │ MemoryDatastore  │ tests, default
//!                                     │ RocksDatastore   │ CF "topics"
//!                                     └──────────────────┘
//! ```
//!
//! A stored record holds only compact strings; the actor re-hydrates them
//! lazily through DTOs.

pub mod memory;
pub mod rocks;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryDatastore;
pub use rocks::{RocksDatastore, StoreConfig};

/// One entry of the persisted delta history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub seq: u64,
    /// Compact value as it was at `seq`.
    #[serde(rename = "dataCompressed")]
    pub data_compressed: String,
    /// Compact delta from that value to the record's current value.
    #[serde(rename = "diffCompressed")]
    pub diff_compressed: String,
}

/// Durable state of one topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicRecord {
    pub name: String,
    pub seq: u64,
    pub data: String,
    pub deltas: Vec<HistoryRecord>,
}

impl TopicRecord {
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(record)
    }
}

/// Asynchronous storage used by topics to load and persist their state.
///
/// Implementations must make `upsert` atomic per topic name.
#[async_trait]
pub trait Datastore: Send + Sync + 'static {
    async fn find_one(&self, name: &str) -> Result<Option<TopicRecord>, StoreError>;

    async fn upsert(&self, record: &TopicRecord) -> Result<(), StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage task failed: {0}")]
    Join(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Join(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_record(name: &str, seq: u64) -> TopicRecord {
        TopicRecord {
            name: name.to_string(),
            seq,
            data: "||||#$".to_string(),
            deltas: vec![HistoryRecord {
                seq: seq.saturating_sub(1),
                data_compressed: "||||#$".to_string(),
                diff_compressed: "abc".to_string(),
            }],
        }
    }

    #[test]
    fn test_record_json_field_names() {
        let json = serde_json::to_value(sample_record("t", 2)).unwrap();
        assert_eq!(json["name"], "t");
        assert_eq!(json["deltas"][0]["dataCompressed"], "||||#$");
        assert_eq!(json["deltas"][0]["diffCompressed"], "abc");
    }

    #[test]
    fn test_record_binary_encoding() {
        let record = sample_record("orders#1", 9);
        let bytes = record.encode().unwrap();
        assert_eq!(TopicRecord::decode(&bytes).unwrap(), record);
        assert!(matches!(
            TopicRecord::decode(&[0xFF]),
            Err(StoreError::Deserialization(_))
        ));
    }
}
