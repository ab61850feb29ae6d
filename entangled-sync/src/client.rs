//! WebSocket sync client.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Topic subscription with `syncTopic` / `syncTopics`
//! - Local replicas: full values replace, deltas patch the held version
//! - Acknowledgement of every applied sequence

use std::collections::HashMap;
use std::sync::Arc;

use entangled_core::{Dto, DtoError, Value};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{
    ActionRequest, ProtocolError, ServerFrame, SyncTopicParams, TopicMessage, TopicPayload,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// A topic's local value changed
    Updated {
        topic: String,
        seq: u64,
        value: Value,
    },
    /// The server rejected an action
    ActionFailed { id: String, error: String },
    /// A topic message could not be applied
    DecodeFailed { topic: String, error: String },
}

/// Local replica of one topic.
#[derive(Debug, Default)]
struct Replica {
    seq: u64,
    dto: Option<Dto>,
}

#[derive(Debug, PartialEq)]
enum Applied {
    Updated(Value),
    /// Nothing changed locally; the current seq is re-acknowledged.
    Unchanged,
}

impl Replica {
    fn apply(&mut self, message: &TopicMessage) -> Result<Applied, DtoError> {
        if message.seq <= self.seq && self.dto.is_some() {
            return Ok(Applied::Unchanged);
        }
        let next = match &message.payload {
            TopicPayload::Full { data } => Dto::from_compressed(data.clone()),
            TopicPayload::Delta { delta, delta_seq } => match &self.dto {
                Some(dto) if *delta_seq == self.seq => dto.patch_compressed(delta)?,
                // Wrong base: acknowledging our seq lets the server pick a usable delta.
                _ => return Ok(Applied::Unchanged),
            },
        };
        let value = next.value()?.clone();
        self.seq = message.seq;
        self.dto = Some(next);
        Ok(Applied::Updated(value))
    }
}

type Replicas = Arc<RwLock<HashMap<String, Replica>>>;

/// The sync client.
pub struct SyncClient {
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    replicas: Replicas,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    event_tx: mpsc::Sender<ClientEvent>,
}

impl SyncClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            replicas: Arc::new(RwLock::new(HashMap::new())),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Connect to the server.
    ///
    /// Spawns the reader and writer tasks. Topics already tracked (from an
    /// earlier connection) are re-synced with their current seqs.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });
        self.outgoing_tx = Some(out_tx.clone());

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;

        // Reader task: apply incoming topic messages. It holds the outgoing
        // channel weakly so `disconnect` can close the writer.
        let ack_tx = out_tx.downgrade();
        drop(out_tx);
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let replicas = self.replicas.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerFrame::decode(text.as_str()) {
                        Ok(ServerFrame::Topic(message)) => {
                            Self::on_topic_message(message, &replicas, &ack_tx, &event_tx).await;
                        }
                        Ok(ServerFrame::Response(response)) => {
                            if let Some(error) = response.error {
                                let event = ClientEvent::ActionFailed {
                                    id: response.id,
                                    error,
                                };
                                let _ = event_tx.send(event).await;
                            }
                        }
                        Err(e) => log::warn!("Undecodable server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        let tracked = self.tracked().await;
        if !tracked.is_empty() {
            self.send_request(ActionRequest::sync_topics(&tracked)).await?;
        }
        Ok(())
    }

    async fn on_topic_message(
        message: TopicMessage,
        replicas: &Replicas,
        ack_tx: &mpsc::WeakSender<String>,
        event_tx: &mpsc::Sender<ClientEvent>,
    ) {
        let (result, seq) = {
            let mut replicas = replicas.write().await;
            let Some(replica) = replicas.get_mut(&message.topic) else {
                log::debug!("Message for untracked topic {}", message.topic);
                return;
            };
            (replica.apply(&message), replica.seq)
        };

        let event = match result {
            Ok(Applied::Updated(value)) => Some(ClientEvent::Updated {
                topic: message.topic.clone(),
                seq,
                value,
            }),
            Ok(Applied::Unchanged) => None,
            Err(e) => {
                log::warn!("Failed to apply seq {} of {}: {e}", message.seq, message.topic);
                Some(ClientEvent::DecodeFailed {
                    topic: message.topic.clone(),
                    error: e.to_string(),
                })
            }
        };

        let ack = ActionRequest::sync_topic(&SyncTopicParams::new(&message.topic, seq));
        match (ack.encode(), ack_tx.upgrade()) {
            (Ok(text), Some(out_tx)) => {
                let _ = out_tx.send(text).await;
            }
            (Ok(_), None) => log::debug!("Not acknowledging {}: disconnected", message.topic),
            (Err(e), _) => log::error!("Failed to encode ack: {e}"),
        }
        if let Some(event) = event {
            let _ = event_tx.send(event).await;
        }
    }

    /// Start tracking `topic` and ask the server for it.
    pub async fn subscribe(&self, topic: impl Into<String>) -> Result<(), ProtocolError> {
        let topic = topic.into();
        let seq = {
            let mut replicas = self.replicas.write().await;
            replicas.entry(topic.clone()).or_default().seq
        };
        self.send_request(ActionRequest::sync_topic(&SyncTopicParams::new(topic, seq)))
            .await
    }

    /// Track exactly `topics`; the server drops this connection from any other.
    pub async fn sync_topics<S: AsRef<str>>(&self, topics: &[S]) -> Result<(), ProtocolError> {
        {
            let mut replicas = self.replicas.write().await;
            replicas.retain(|name, _| topics.iter().any(|topic| topic.as_ref() == name));
            for topic in topics {
                replicas.entry(topic.as_ref().to_owned()).or_default();
            }
        }
        let tracked = self.tracked().await;
        self.send_request(ActionRequest::sync_topics(&tracked)).await
    }

    /// Local value of a topic, once received.
    pub async fn value(&self, topic: &str) -> Option<Value> {
        let replicas = self.replicas.read().await;
        let dto = replicas.get(topic)?.dto.as_ref()?;
        dto.value().ok().cloned()
    }

    /// Last applied seq of a topic (0 when nothing was received).
    pub async fn seq(&self, topic: &str) -> u64 {
        self.replicas.read().await.get(topic).map_or(0, |replica| replica.seq)
    }

    /// Close the connection. Tracked topics are kept for the next `connect`.
    pub fn disconnect(&mut self) {
        self.outgoing_tx = None;
    }

    async fn send_request(&self, request: ActionRequest) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(request.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    async fn tracked(&self) -> Vec<SyncTopicParams> {
        let replicas = self.replicas.read().await;
        let mut tracked: Vec<SyncTopicParams> = replicas
            .iter()
            .map(|(name, replica)| SyncTopicParams::new(name, replica.seq))
            .collect();
        tracked.sort_by(|a, b| a.topic.cmp(&b.topic));
        tracked
    }
}
