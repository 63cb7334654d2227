//! Wire format for the relay: a JSON-RPC 2.0 message set plus the
//! tool/content types exchanged once a call actually reaches a provider.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC protocol version string accepted on the wire.
pub const PROTOCOL_VERSION: &str = "2.0";

/// A message id. JSON-RPC allows string or integer; we keep both and treat
/// them as opaque outside the relay's own id-rewriting boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Number(i64),
    String(String),
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

/// Raw shape of a message as it appears on the wire, before classification.
///
/// All fields are optional at this stage; `classify` below turns this into
/// a [`Message`] or reports why it refuses to.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawMessage {
    #[serde(rename = "jsonrpc")]
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

/// A classified message: exactly one of the three JSON-RPC shapes.
#[derive(Debug)]
pub enum Message {
    Request {
        id: MessageId,
        method: String,
        params: Option<Value>,
    },
    Response {
        id: MessageId,
        result: Option<Value>,
        error: Option<ErrorObject>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

impl Message {
    /// Classification rule (spec §3): id+method -> request, id alone ->
    /// response, method alone -> notification.
    pub fn classify(raw: RawMessage) -> Result<Self, crate::error::RelayError> {
        if raw.protocol != PROTOCOL_VERSION {
            return Err(crate::error::RelayError::new(
                crate::error::ErrorKind::InvalidRequest,
                format!("unsupported protocol version: {}", raw.protocol),
            ));
        }
        match (raw.id, raw.method) {
            (Some(id), Some(method)) => Ok(Self::Request { id, method, params: raw.params }),
            (Some(id), None) => Ok(Self::Response { id, result: raw.result, error: raw.error }),
            (None, Some(method)) => Ok(Self::Notification { method, params: raw.params }),
            (None, None) => Err(crate::error::RelayError::new(
                crate::error::ErrorKind::InvalidRequest,
                "message has neither id nor method".to_string(),
            )),
        }
    }

    #[must_use]
    pub fn request(id: MessageId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request { id, method: method.into(), params }
    }

    #[must_use]
    pub fn success(id: MessageId, result: Value) -> Self {
        Self::Response { id, result: Some(result), error: None }
    }

    #[must_use]
    pub fn failure(id: MessageId, error: ErrorObject) -> Self {
        Self::Response { id, result: None, error: Some(error) }
    }

    #[must_use]
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification { method: method.into(), params }
    }

    #[must_use]
    pub fn id(&self) -> Option<&MessageId> {
        match self {
            Self::Request { id, .. } | Self::Response { id, .. } => Some(id),
            Self::Notification { .. } => None,
        }
    }

    /// Reassign the id carried by a request or response, leaving method,
    /// params, result, and error untouched. Used at the relay's id-rewrite
    /// boundary (spec §4.2).
    #[must_use]
    pub fn with_id(self, new_id: MessageId) -> Self {
        match self {
            Self::Request { method, params, .. } => Self::Request { id: new_id, method, params },
            Self::Response { result, error, .. } => Self::Response { id: new_id, result, error },
            notification @ Self::Notification { .. } => notification,
        }
    }
}

impl Serialize for Message {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let raw = match self.clone() {
            Self::Request { id, method, params } => RawMessage {
                protocol: PROTOCOL_VERSION.to_string(),
                id: Some(id),
                method: Some(method),
                params,
                result: None,
                error: None,
            },
            Self::Response { id, result, error } => RawMessage {
                protocol: PROTOCOL_VERSION.to_string(),
                id: Some(id),
                method: None,
                params: None,
                result,
                error,
            },
            Self::Notification { method, params } => RawMessage {
                protocol: PROTOCOL_VERSION.to_string(),
                id: None,
                method: Some(method),
                params,
                result: None,
                error: None,
            },
        };
        raw.serialize(serializer)
    }
}

impl Clone for Message {
    fn clone(&self) -> Self {
        match self {
            Self::Request { id, method, params } => {
                Self::Request { id: id.clone(), method: method.clone(), params: params.clone() }
            }
            Self::Response { id, result, error } => {
                Self::Response { id: id.clone(), result: result.clone(), error: error.clone() }
            }
            Self::Notification { method, params } => {
                Self::Notification { method: method.clone(), params: params.clone() }
            }
        }
    }
}

/// `error` field of a JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    #[must_use]
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }
}

/// A callable tool published by a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// A single item in a tool-call result payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentItem {
    Text { text: String },
    Image { data: String, #[serde(rename = "mimeType")] mime_type: Cow<'static, str> },
    Resource {
        uri: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        blob: Option<String>,
    },
}

impl ContentItem {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_request_response_notification() {
        let req: RawMessage = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"method":"ping","params":{}}"#,
        )
        .unwrap();
        assert!(matches!(Message::classify(req).unwrap(), Message::Request { .. }));

        let resp: RawMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#).unwrap();
        assert!(matches!(Message::classify(resp).unwrap(), Message::Response { .. }));

        let notif: RawMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"tools/updated","params":{}}"#)
                .unwrap();
        assert!(matches!(Message::classify(notif).unwrap(), Message::Notification { .. }));
    }

    #[test]
    fn classify_rejects_wrong_protocol_and_empty_shape() {
        let wrong: RawMessage = serde_json::from_str(
            r#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#,
        )
        .unwrap();
        assert!(Message::classify(wrong).is_err());

        let empty: RawMessage = serde_json::from_str(r#"{"jsonrpc":"2.0"}"#).unwrap();
        assert!(Message::classify(empty).is_err());
    }

    #[test]
    fn serialize_then_parse_then_classify_round_trips() {
        let original = Message::request(
            MessageId::String("caller-1".to_string()),
            "tools/call",
            Some(serde_json::json!({"name": "echo"})),
        );
        let json = serde_json::to_string(&original).unwrap();
        let raw: RawMessage = serde_json::from_str(&json).unwrap();
        let classified = Message::classify(raw).unwrap();
        assert_eq!(classified.id(), original.id());
    }

    #[test]
    fn with_id_rewrites_only_the_id() {
        let req = Message::request(MessageId::Number(1), "tools/call", None);
        let rewritten = req.with_id(MessageId::Number(42));
        assert_eq!(rewritten.id(), Some(&MessageId::Number(42)));
        match rewritten {
            Message::Request { method, .. } => assert_eq!(method, "tools/call"),
            _ => panic!("expected request"),
        }
    }
}
