//! Wire protocol
//!
//! Two layers travel over one WebSocket text frame:
//!
//! ## Transport frames
//! - client → server: `{"event": "message", "data": "<envelope>", "ack": 7}`
//! - server → client: `ack`, `event` and `error` frames tagged by `type`
//!
//! ## Message envelope
//! The `data` of a routed event is itself a JSON document
//! `{"route": <string>, "params": <object>}` naming the route to invoke.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Routed message carried in a transport frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub route: String,
    pub params: Map<String, Value>,
}

impl Envelope {
    pub fn new(route: &str, params: Map<String, Value>) -> Self {
        Self {
            route: route.to_string(),
            params,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Client-to-server transport frame
#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    pub event: String,
    pub data: String,
    #[serde(default)]
    pub ack: Option<u64>,
}

/// Server-to-client transport frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Ack {
        ack: u64,
        #[serde(default)]
        data: Value,
    },
    Event {
        event: String,
        #[serde(default)]
        data: Value,
    },
    Error {
        message: String,
    },
}

impl ServerFrame {
    pub fn encode(&self) -> String {
        // string keys and `Value` payloads always serialize
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decode a server frame (client side)
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::MalformedFrame)
    }
}

/// Parse a client transport frame
pub fn parse_frame(text: &str) -> Result<ClientFrame, ProtocolError> {
    serde_json::from_str(text).map_err(ProtocolError::MalformedFrame)
}

/// Parse a message envelope
pub fn parse_envelope(data: &str) -> Result<Envelope, ProtocolError> {
    serde_json::from_str(data).map_err(ProtocolError::MalformedEnvelope)
}

/// Error payload delivered through the acknowledgement channel
pub fn error_reply(code: &str, message: &str) -> Value {
    json!({
        "error": {
            "code": code,
            "message": message,
        }
    })
}

/// Extract the error code from a reply, if it is an error reply
pub fn reply_error_code(reply: &Value) -> Option<&str> {
    reply.get("error")?.get("code")?.as_str()
}

/// Protocol errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(#[source] serde_json::Error),
    #[error("malformed message: {0}")]
    MalformedEnvelope(#[source] serde_json::Error),
    #[error("route not found: {0}")]
    RouteNotFound(String),
    #[error("route {route} is not served on namespace {namespace}")]
    NamespaceMismatch { route: String, namespace: String },
    #[error("event {event} is not routed on namespace {namespace}")]
    UnroutedEvent { event: String, namespace: String },
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::MalformedFrame(_) => "malformed_frame",
            ProtocolError::MalformedEnvelope(_) => "malformed_message",
            ProtocolError::RouteNotFound(_) => "route_not_found",
            ProtocolError::NamespaceMismatch { .. } => "namespace_mismatch",
            ProtocolError::UnroutedEvent { .. } => "unrouted_event",
        }
    }

    pub fn to_reply(&self) -> Value {
        error_reply(self.code(), &self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_envelope() {
        let envelope = parse_envelope(r#"{"route":"echo","params":{"x":1}}"#).unwrap();
        assert_eq!(envelope.route, "echo");
        assert_eq!(envelope.params["x"], 1);
    }

    #[test]
    fn test_parse_envelope_rejects_missing_fields() {
        let err = parse_envelope(r#"{"route":"echo"}"#).unwrap_err();
        assert_eq!(err.code(), "malformed_message");

        let err = parse_envelope(r#"{"params":{}}"#).unwrap_err();
        assert_eq!(err.code(), "malformed_message");
    }

    #[test]
    fn test_parse_envelope_rejects_bad_json() {
        let err = parse_envelope("{route:").unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedEnvelope(_)));
    }

    #[test]
    fn test_parse_frame_with_ack() {
        let frame =
            parse_frame(r#"{"event":"message","data":"{\"route\":\"echo\"}","ack":7}"#).unwrap();
        assert_eq!(frame.event, "message");
        assert_eq!(frame.ack, Some(7));
        assert!(frame.data.contains("echo"));
    }

    #[test]
    fn test_parse_frame_without_ack() {
        let frame = parse_frame(r#"{"event":"message","data":"{}"}"#).unwrap();
        assert!(frame.ack.is_none());
    }

    #[test]
    fn test_encode_ack() {
        let frame = ServerFrame::Ack {
            ack: 3,
            data: json!({"y": 2}),
        };
        let json: Value = serde_json::from_str(&frame.encode()).unwrap();
        assert_eq!(json["type"], "ack");
        assert_eq!(json["ack"], 3);
        assert_eq!(json["data"]["y"], 2);
    }

    #[test]
    fn test_encode_event() {
        let frame = ServerFrame::Event {
            event: "chat.said".to_string(),
            data: json!({"text": "hi"}),
        };
        let json: Value = serde_json::from_str(&frame.encode()).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["event"], "chat.said");
        assert_eq!(json["data"]["text"], "hi");
    }

    #[test]
    fn test_encode_error_frame() {
        let frame = ServerFrame::Error {
            message: "binary frames are not supported".to_string(),
        };
        assert_eq!(
            frame.encode(),
            r#"{"type":"error","message":"binary frames are not supported"}"#
        );
    }

    #[test]
    fn test_decode_ack_without_data() {
        assert_eq!(
            ServerFrame::decode(r#"{"type":"ack","ack":4}"#).unwrap(),
            ServerFrame::Ack {
                ack: 4,
                data: Value::Null
            }
        );
        assert!(ServerFrame::decode(r#"{"type":"welcome"}"#).is_err());
    }

    #[test]
    fn test_decode_server_frames() {
        let ack = ServerFrame::decode(r#"{"type":"ack","ack":9,"data":{"ok":true}}"#).unwrap();
        assert_eq!(
            ack,
            ServerFrame::Ack {
                ack: 9,
                data: json!({"ok": true})
            }
        );

        let error = ServerFrame::decode(r#"{"type":"error","message":"bad"}"#).unwrap();
        assert_eq!(
            error,
            ServerFrame::Error {
                message: "bad".to_string()
            }
        );
    }

    #[test]
    fn test_error_reply_shape() {
        let reply = ProtocolError::RouteNotFound("nope".to_string()).to_reply();
        assert_eq!(reply_error_code(&reply), Some("route_not_found"));
        assert!(reply["error"]["message"].as_str().unwrap().contains("nope"));
        assert_eq!(reply_error_code(&json!({"y": 2})), None);
    }
}
