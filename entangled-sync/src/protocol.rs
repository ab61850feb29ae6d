//! JSON wire protocol between topic clients and the sync server.
//!
//! Frames are WebSocket text messages:
//!
//! ```text
//! client ── ActionRequest  {id, action, data}            ──► server
//! client ◄── ActionResponse {id, data?, error?}           ── server
//! client ◄── TopicMessage   {topic, seq, data}            ── server
//! client ◄── TopicMessage   {topic, seq, delta, deltaSeq} ── server
//! ```
//!
//! `data` and `delta` carry compact strings produced by `entangled-core`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Subscribe to (or acknowledge) a single topic.
pub const ACTION_SYNC_TOPIC: &str = "syncTopic";
/// Replace the connection's subscription set.
pub const ACTION_SYNC_TOPICS: &str = "syncTopics";

/// Request sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub id: String,
    pub action: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ActionRequest {
    /// New request with a fresh random id.
    pub fn new(action: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            action: action.into(),
            data,
        }
    }

    pub fn sync_topic(params: &SyncTopicParams) -> Self {
        Self::new(ACTION_SYNC_TOPIC, params.to_json())
    }

    pub fn sync_topics(params: &[SyncTopicParams]) -> Self {
        let list = params.iter().map(SyncTopicParams::to_json).collect();
        Self::new(ACTION_SYNC_TOPICS, serde_json::Value::Array(list))
    }

    /// Decode the `data` member into the parameters of the action.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        T::deserialize(&self.data).map_err(|e| ProtocolError::InvalidParams(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Reply to an [`ActionRequest`], matched by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResponse {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResponse {
    pub fn ok(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data: None,
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, error: impl ToString) -> Self {
        Self {
            id: id.into(),
            data: None,
            error: Some(error.to_string()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Parameters of `syncTopic`, and the elements of `syncTopics`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTopicParams {
    pub topic: String,
    /// Last sequence the client has applied; 0 when it holds nothing.
    #[serde(rename = "lastReceivedSeq", default)]
    pub last_received_seq: u64,
}

impl SyncTopicParams {
    pub fn new(topic: impl Into<String>, last_received_seq: u64) -> Self {
        Self {
            topic: topic.into(),
            last_received_seq,
        }
    }

    fn to_json(&self) -> serde_json::Value {
        json!({"topic": self.topic, "lastReceivedSeq": self.last_received_seq})
    }
}

/// Update pushed to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicMessage {
    pub topic: String,
    pub seq: u64,
    #[serde(flatten)]
    pub payload: TopicPayload,
}

/// Either the full compact value or a compact delta against `delta_seq`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TopicPayload {
    Full {
        data: String,
    },
    Delta {
        delta: String,
        #[serde(rename = "deltaSeq")]
        delta_seq: u64,
    },
}

impl TopicMessage {
    pub fn full(topic: impl Into<String>, seq: u64, data: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            seq,
            payload: TopicPayload::Full { data: data.into() },
        }
    }

    pub fn delta(
        topic: impl Into<String>,
        seq: u64,
        delta_seq: u64,
        delta: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            seq,
            payload: TopicPayload::Delta {
                delta: delta.into(),
                delta_seq,
            },
        }
    }

    /// The sequence the delta applies to, `None` for full messages.
    pub fn delta_seq(&self) -> Option<u64> {
        match self.payload {
            TopicPayload::Full { .. } => None,
            TopicPayload::Delta { delta_seq, .. } => Some(delta_seq),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Anything the server may send to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Topic(TopicMessage),
    Response(ActionResponse),
}

impl ServerFrame {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("invalid action parameters: {0}")]
    InvalidParams(String),
    #[error("connection closed")]
    ConnectionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_message_shapes() {
        let full = TopicMessage::full("orders", 3, "||||#$");
        let text = full.encode().unwrap();
        assert_eq!(text, r#"{"topic":"orders","seq":3,"data":"||||#$"}"#);

        let delta = TopicMessage::delta("orders", 4, 3, "abc");
        let text = delta.encode().unwrap();
        assert_eq!(text, r#"{"topic":"orders","seq":4,"delta":"abc","deltaSeq":3}"#);
        assert_eq!(delta.delta_seq(), Some(3));
        assert_eq!(full.delta_seq(), None);
    }

    #[test]
    fn test_server_frame_discrimination() {
        let frame = ServerFrame::decode(r#"{"topic":"t","seq":1,"data":"x"}"#).unwrap();
        assert_eq!(frame, ServerFrame::Topic(TopicMessage::full("t", 1, "x")));

        let frame =
            ServerFrame::decode(r#"{"topic":"t","seq":2,"delta":"y","deltaSeq":1}"#).unwrap();
        assert_eq!(frame, ServerFrame::Topic(TopicMessage::delta("t", 2, 1, "y")));

        let frame = ServerFrame::decode(r#"{"id":"42"}"#).unwrap();
        assert_eq!(frame, ServerFrame::Response(ActionResponse::ok("42")));

        let frame = ServerFrame::decode(r#"{"id":"42","error":"boom"}"#).unwrap();
        assert!(matches!(frame, ServerFrame::Response(r) if r.is_error()));
    }

    #[test]
    fn test_request_params() {
        let request = ActionRequest::decode(
            r#"{"id":"1","action":"syncTopic","data":{"topic":"orders#7","lastReceivedSeq":5}}"#,
        )
        .unwrap();
        let params: SyncTopicParams = request.params().unwrap();
        assert_eq!(params, SyncTopicParams::new("orders#7", 5));

        let request = ActionRequest::sync_topics(&[
            SyncTopicParams::new("a", 0),
            SyncTopicParams::new("b", 2),
        ]);
        let params: Vec<SyncTopicParams> = request.params().unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[1].last_received_seq, 2);
    }

    #[test]
    fn test_missing_seq_defaults_to_zero() {
        let request =
            ActionRequest::decode(r#"{"id":"1","action":"syncTopic","data":{"topic":"t"}}"#)
                .unwrap();
        let params: SyncTopicParams = request.params().unwrap();
        assert_eq!(params.last_received_seq, 0);
    }

    #[test]
    fn test_bad_frames() {
        assert!(matches!(
            ActionRequest::decode("not json"),
            Err(ProtocolError::Deserialization(_))
        ));
        let request = ActionRequest::new(ACTION_SYNC_TOPIC, json!({"seq": 1}));
        assert!(matches!(
            request.params::<SyncTopicParams>(),
            Err(ProtocolError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_response_omits_empty_members() {
        assert_eq!(ActionResponse::ok("7").encode().unwrap(), r#"{"id":"7"}"#);
        assert_eq!(
            ActionResponse::error("7", "nope").encode().unwrap(),
            r#"{"id":"7","error":"nope"}"#
        );
    }
}
