//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                ┌── Topic "orders"     ──┐
//!             ├── actions ────┤                          ├── Datastore
//! Client B ──┘  (JSON text)   └── Topic "orders#42"  ──┘
//!      ▲                                 │
//!      └──── outbound queue ◄─── TopicMessage (data | delta)
//! ```
//!
//! Each connection gets a bounded outbound queue that topics write into; the
//! connection task forwards it to the socket alongside incoming frames.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{
    ActionRequest, ActionResponse, ProtocolError, SyncTopicParams, ACTION_SYNC_TOPIC,
    ACTION_SYNC_TOPICS,
};
use crate::registry::TopicRegistry;
use crate::storage::{Datastore, MemoryDatastore};
use crate::topic::{Connection, TopicConfig, TopicError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound queue capacity per connection
    pub outbound_capacity: usize,
    /// Settings applied to every topic
    pub topic: TopicConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbound_capacity: 256,
            topic: TopicConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Frames received from clients
    pub total_messages: u64,
    /// Bytes received from clients
    pub total_bytes: u64,
    /// Topic messages written to clients
    pub sent_messages: u64,
    /// Frames that could not be decoded
    pub rejected_frames: u64,
}

#[derive(Debug, Error)]
enum ActionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Topic(#[from] TopicError),
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<TopicRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, datastore: Arc<dyn Datastore>) -> Self {
        let registry = Arc::new(TopicRegistry::new(datastore, config.topic.clone()));
        Self::with_registry(config, registry)
    }

    /// Serve topics from an existing registry.
    pub fn with_registry(config: ServerConfig, registry: Arc<TopicRegistry>) -> Self {
        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Server backed by a [`MemoryDatastore`].
    pub fn in_memory(config: ServerConfig) -> Self {
        Self::new(config, Arc::new(MemoryDatastore::new()))
    }

    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.registry
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(&self.config.bind_addr).await
    }

    /// Bind and accept connections until the task is dropped.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let capacity = self.config.outbound_capacity.max(1);

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, registry, stats, capacity).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<TopicRegistry>,
        stats: Arc<RwLock<ServerStats>>,
        capacity: usize,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let connection = Connection::new(outbound_tx);

        log::info!("WebSocket connection {} established from {addr}", connection.id());
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let outcome =
            Self::pump(ws_stream, outbound_rx, &connection, addr, &registry, &stats).await;

        // Cleanup: leave every topic
        registry.unsubscribe_all(connection.id()).await;
        stats.write().await.active_connections -= 1;
        log::info!("Connection {} from {addr} closed", connection.id());
        outcome
    }

    async fn pump(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        mut outbound_rx: mpsc::Receiver<Arc<str>>,
        connection: &Connection,
        addr: SocketAddr,
        registry: &TopicRegistry,
        stats: &RwLock<ServerStats>,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                        Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                            Ok(text) => text,
                            Err(_) => {
                                log::warn!("Non UTF-8 binary frame from {addr}");
                                stats.write().await.rejected_frames += 1;
                                continue;
                            }
                        },
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        Some(Ok(_)) => continue,
                    };

                    {
                        let mut s = stats.write().await;
                        s.total_messages += 1;
                        s.total_bytes += text.len() as u64;
                    }

                    match Self::dispatch(registry, connection, &text).await {
                        Some(reply) => ws_sender.send(Message::text(reply)).await?,
                        None => stats.write().await.rejected_frames += 1,
                    }
                }

                // Outgoing topic message
                Some(message) = outbound_rx.recv() => {
                    ws_sender.send(Message::text(message.to_string())).await?;
                    stats.write().await.sent_messages += 1;
                }
            }
        }
        Ok(())
    }

    /// Run one client frame. Returns the encoded reply, or `None` when the
    /// frame is not a decodable action request.
    async fn dispatch(
        registry: &TopicRegistry,
        connection: &Connection,
        text: &str,
    ) -> Option<String> {
        let request = match ActionRequest::decode(text) {
            Ok(request) => request,
            Err(e) => {
                log::warn!("Failed to decode frame from {}: {e}", connection.id());
                return None;
            }
        };

        let response = match Self::execute(registry, connection, &request).await {
            Ok(()) => {
                log::trace!("Action {} ({}) done", request.action, request.id);
                ActionResponse::ok(&request.id)
            }
            Err(e) => {
                log::warn!("Action {} ({}) failed: {e}", request.action, request.id);
                ActionResponse::error(&request.id, e)
            }
        };
        match response.encode() {
            Ok(reply) => Some(reply),
            Err(e) => {
                log::error!("Failed to encode reply for {}: {e}", request.id);
                None
            }
        }
    }

    async fn execute(
        registry: &TopicRegistry,
        connection: &Connection,
        request: &ActionRequest,
    ) -> Result<(), ActionError> {
        match request.action.as_str() {
            ACTION_SYNC_TOPIC => {
                let params: SyncTopicParams = request.params()?;
                registry.sync_topic(connection, &params).await?;
            }
            ACTION_SYNC_TOPICS => {
                let params: Vec<SyncTopicParams> = request.params()?;
                registry.sync_topics(connection, &params).await?;
            }
            other => return Err(ProtocolError::UnknownAction(other.to_owned()).into()),
        }
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ServerFrame, TopicPayload};
    use serde_json::json;

    async fn registry() -> TopicRegistry {
        let registry = TopicRegistry::new(Arc::new(MemoryDatastore::new()), TopicConfig::default());
        registry.register("orders").await;
        registry
    }

    fn response(reply: Option<String>) -> ActionResponse {
        match ServerFrame::decode(&reply.unwrap()).unwrap() {
            ServerFrame::Response(response) => response,
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.outbound_capacity, 256);
        assert_eq!(config.topic.history_depth, 5);
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = SyncServer::in_memory(ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        });
        let listener = server.bind().await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
        assert_eq!(server.bind_addr(), "127.0.0.1:0");
        assert_eq!(server.stats().await.total_connections, 0);
    }

    #[tokio::test]
    async fn test_dispatch_sync_topic() {
        let registry = registry().await;
        registry.send("orders", json!({"n": 1})).await.unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let connection = Connection::new(tx);

        let request = ActionRequest::sync_topic(&SyncTopicParams::new("orders", 0));
        let reply = SyncServer::dispatch(&registry, &connection, &request.encode().unwrap()).await;
        let reply = response(reply);
        assert_eq!(reply.id, request.id);
        assert!(!reply.is_error());

        let pushed = rx.recv().await.unwrap();
        match ServerFrame::decode(&pushed).unwrap() {
            ServerFrame::Topic(message) => {
                assert_eq!(message.seq, 1);
                assert!(matches!(message.payload, TopicPayload::Full { .. }));
            }
            other => panic!("expected topic message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_unknown_action() {
        let registry = registry().await;
        let (tx, _rx) = mpsc::channel(4);
        let connection = Connection::new(tx);

        let request = ActionRequest::new("publish", json!({}));
        let reply = response(
            SyncServer::dispatch(&registry, &connection, &request.encode().unwrap()).await,
        );
        assert_eq!(reply.error.as_deref(), Some("unknown action: publish"));
    }

    #[tokio::test]
    async fn test_dispatch_invalid_params() {
        let registry = registry().await;
        let (tx, _rx) = mpsc::channel(4);
        let connection = Connection::new(tx);

        let request = ActionRequest::new(ACTION_SYNC_TOPICS, json!({"topic": "orders"}));
        let reply = response(
            SyncServer::dispatch(&registry, &connection, &request.encode().unwrap()).await,
        );
        assert!(reply.is_error());
    }

    #[tokio::test]
    async fn test_dispatch_ignores_garbage() {
        let registry = registry().await;
        let (tx, _rx) = mpsc::channel(4);
        let connection = Connection::new(tx);
        assert!(SyncServer::dispatch(&registry, &connection, "{not json").await.is_none());
        assert!(SyncServer::dispatch(&registry, &connection, r#"{"id":"1"}"#).await.is_none());
    }
}
