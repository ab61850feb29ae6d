//! # entangled-sync — topic synchronization over WebSocket
//!
//! Topics hold a versioned value. Publishers replace it; subscribers get the
//! full value once and deltas afterwards, and acknowledge what they applied.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (replicas)  │     JSON actions    │             │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                     ┌──────┴──────┐
//!                                     │TopicRegistry│
//!                                     └──────┬──────┘
//!                                            │ one task per topic
//!                                     ┌──────┴──────┐
//!                                     │ Topic actor │ ──► Datastore
//!                                     └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON action requests, responses and topic messages
//! - [`topic`] — per-topic state machine (coalescing, history, resend)
//! - [`registry`] — registered topic bases and live topic handles
//! - [`storage`] — persistence port with memory and RocksDB adapters
//! - [`server`] — WebSocket sync server
//! - [`client`] — WebSocket sync client with local replicas

pub mod client;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod storage;
pub mod topic;

// Re-exports for convenience
pub use client::{ClientEvent, ConnectionState, SyncClient};
pub use protocol::{
    ActionRequest, ActionResponse, ProtocolError, ServerFrame, SyncTopicParams, TopicMessage,
    TopicPayload, ACTION_SYNC_TOPIC, ACTION_SYNC_TOPICS,
};
pub use registry::{base_name, TopicRegistry};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{
    Datastore, HistoryRecord, MemoryDatastore, RocksDatastore, StoreConfig, StoreError,
    TopicRecord,
};
pub use topic::{Connection, TopicConfig, TopicError, TopicHandle, TopicSnapshot};
