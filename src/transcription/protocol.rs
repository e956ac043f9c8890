//! # Context Boundary Protocol
//!
//! The model host and the rest of the process share no memory. They talk
//! through a pair of channels that only carry serialized JSON strings.
//!
//! ## Messages:
//! - `{"type":"READY"}`: host → caller, the model is loaded
//! - `{"type":"REQUEST","requestId":1,"audioUrl":"..."}`: caller → host
//! - `{"type":"RESPONSE","requestId":1,"success":true,"text":"..."}`: host → caller
//!   (`"error"` replaces `"text"` when `success` is false)

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContextMessage {
    Ready,

    #[serde(rename_all = "camelCase")]
    Request { request_id: u64, audio_url: String },

    #[serde(rename_all = "camelCase")]
    Response {
        request_id: u64,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Why an inbound string could not be turned into a `ContextMessage`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),
}

const KNOWN_TYPES: [&str; 3] = ["READY", "REQUEST", "RESPONSE"];

impl ContextMessage {
    pub fn ok(request_id: u64, text: String) -> Self {
        ContextMessage::Response {
            request_id,
            success: true,
            text: Some(text),
            error: None,
        }
    }

    pub fn failed(request_id: u64, error: impl Into<String>) -> Self {
        ContextMessage::Response {
            request_id,
            success: false,
            text: None,
            error: Some(error.into()),
        }
    }

    /// Parse a raw message, separating unknown tags from broken payloads.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let tag = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| ProtocolError::Malformed("missing \"type\" field".to_string()))?;

        if !KNOWN_TYPES.contains(&tag) {
            return Err(ProtocolError::UnknownType(tag.to_string()));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn encode(&self) -> String {
        // A plain enum of strings, numbers and bools always serializes
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// One side of the boundary.
pub struct ContextEndpoint {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Create a connected pair of endpoints: (caller side, host side).
pub fn context_channel() -> (ContextEndpoint, ContextEndpoint) {
    let (to_host, host_inbound) = mpsc::unbounded_channel();
    let (to_caller, caller_inbound) = mpsc::unbounded_channel();

    (
        ContextEndpoint {
            outbound: to_host,
            inbound: caller_inbound,
        },
        ContextEndpoint {
            outbound: to_caller,
            inbound: host_inbound,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_field_names() {
        let request = ContextMessage::Request {
            request_id: 7,
            audio_url: "https://x/a.mp3".into(),
        };
        assert_eq!(
            request.encode(),
            r#"{"type":"REQUEST","requestId":7,"audioUrl":"https://x/a.mp3"}"#
        );
        assert_eq!(ContextMessage::Ready.encode(), r#"{"type":"READY"}"#);
        assert_eq!(
            ContextMessage::ok(3, "hi".into()).encode(),
            r#"{"type":"RESPONSE","requestId":3,"success":true,"text":"hi"}"#
        );
    }

    #[test]
    fn test_response_without_text() {
        let msg = ContextMessage::decode(r#"{"type":"RESPONSE","requestId":2,"success":true}"#).unwrap();
        assert_eq!(
            msg,
            ContextMessage::Response {
                request_id: 2,
                success: true,
                text: None,
                error: None
            }
        );
    }

    #[test]
    fn test_unknown_and_malformed() {
        assert_eq!(
            ContextMessage::decode(r#"{"type":"PING"}"#),
            Err(ProtocolError::UnknownType("PING".into()))
        );
        assert!(matches!(ContextMessage::decode("not json"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(
            ContextMessage::decode(r#"{"type":"REQUEST","requestId":"x"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_channel_pairs_cross() {
        let (caller, mut host) = context_channel();
        caller.outbound.send("hello".into()).unwrap();
        assert_eq!(host.inbound.recv().await.as_deref(), Some("hello"));
    }
}
