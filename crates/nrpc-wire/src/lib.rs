// JSON envelope exchanged between nrpc clients and servers.
//
// Every subject carries exactly one `Message` encoded as a JSON object. Field
// names are part of the compatibility surface: new fields may be added, never
// renamed, and receivers ignore fields they do not know.
use bytes::Bytes;
use chrono::{DateTime, Utc};
use nrpc_common::{ErrorCode, clock, ids};
use serde::{Deserialize, Deserializer, Serialize};

pub mod subjects;

pub use serde_json::Value;
pub use subjects::{CONTROL_SERVICE, ControlCommand, RESERVED_SERVICE_NAMES, Subjects};

/// Order-irrelevant key/value payload used for `data`, `metadata` and error details.
pub type DataMap = serde_json::Map<String, Value>;

pub type Result<T> = std::result::Result<T, Error>;

// Default cap applied by `decode_limited` callers that have no better number.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to serialize message")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to deserialize message")]
    Deserialize(#[source] serde_json::Error),
    #[error("message too large ({len} > {max} bytes)")]
    TooLarge { len: usize, max: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Request,
    Response,
    Error,
    Event,
    Stream,
    Ping,
    Pong,
}

impl MessageType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Error => "error",
            MessageType::Event => "event",
            MessageType::Stream => "stream",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "DataMap::is_empty"
    )]
    pub details: DataMap,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_str().to_string(),
            message: message.into(),
            details: DataMap::new(),
        }
    }

    pub fn with_details(mut self, details: DataMap) -> Self {
        self.details = details;
        self
    }

    /// Known code, if the peer sent one this build understands.
    pub fn known_code(&self) -> Option<ErrorCode> {
        self.code.parse().ok()
    }
}

/// The single wire type.
///
/// ```
/// use nrpc_wire::{DataMap, Message, MessageType, Value};
///
/// let mut data = DataMap::new();
/// data.insert("text".into(), Value::from("hi"));
/// let request = Message::request("echo", "upper", data, DataMap::new());
/// let bytes = nrpc_wire::encode(&request).expect("encode");
/// let decoded = nrpc_wire::decode(&bytes).expect("decode");
/// assert_eq!(decoded.kind, MessageType::Request);
/// assert_eq!(decoded.data["text"], "hi");
/// assert!(decoded.request_id.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub method: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub data: DataMap,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub metadata: DataMap,
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
    // Empty on standalone requests/events/pings; the originating id otherwise.
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub stream_index: u64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub stream_end: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl Message {
    fn base(kind: MessageType) -> Self {
        Self {
            id: ids::new_message_id(),
            kind,
            service: String::new(),
            method: String::new(),
            data: DataMap::new(),
            metadata: DataMap::new(),
            timestamp: clock::now(),
            request_id: None,
            stream_index: 0,
            stream_end: false,
            error: None,
        }
    }

    pub fn request(
        service: impl Into<String>,
        method: impl Into<String>,
        data: DataMap,
        metadata: DataMap,
    ) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            data,
            metadata,
            ..Self::base(MessageType::Request)
        }
    }

    pub fn event(data: DataMap, metadata: DataMap) -> Self {
        Self {
            data,
            metadata,
            ..Self::base(MessageType::Event)
        }
    }

    pub fn ping() -> Self {
        Self::base(MessageType::Ping)
    }

    // Replies keep the addressing of the request so logs on either side line up.
    fn reply(kind: MessageType, request: &Message) -> Self {
        Self {
            service: request.service.clone(),
            method: request.method.clone(),
            request_id: Some(request.id.clone()),
            ..Self::base(kind)
        }
    }

    pub fn response_to(request: &Message, data: DataMap, metadata: DataMap) -> Self {
        Self {
            data,
            metadata,
            ..Self::reply(MessageType::Response, request)
        }
    }

    pub fn pong_to(request: &Message, data: DataMap) -> Self {
        Self {
            data,
            ..Self::reply(MessageType::Pong, request)
        }
    }

    pub fn error_to(request: &Message, error: ErrorInfo) -> Self {
        Self {
            error: Some(error),
            ..Self::reply(MessageType::Error, request)
        }
    }

    /// Error reply for an inbound payload that could not be decoded at all.
    pub fn uncorrelated_error(error: ErrorInfo) -> Self {
        Self {
            error: Some(error),
            ..Self::base(MessageType::Error)
        }
    }

    pub fn stream_item(request: &Message, index: u64, data: DataMap) -> Self {
        Self {
            data,
            stream_index: index,
            ..Self::reply(MessageType::Stream, request)
        }
    }

    /// Terminal stream message. `index` is the number of items sent before it.
    pub fn stream_end(request: &Message, index: u64, data: DataMap, metadata: DataMap) -> Self {
        Self {
            data,
            metadata,
            stream_index: index,
            stream_end: true,
            ..Self::reply(MessageType::Stream, request)
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == MessageType::Error
    }

    pub fn error_info(&self) -> Option<&ErrorInfo> {
        self.error.as_ref()
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

pub fn encode(message: &Message) -> Result<Bytes> {
    let payload = serde_json::to_vec(message).map_err(Error::Serialize)?;
    Ok(Bytes::from(payload))
}

pub fn decode(payload: &[u8]) -> Result<Message> {
    serde_json::from_slice(payload).map_err(Error::Deserialize)
}

/// Decode with a size guard so a hostile peer cannot make us parse huge bodies.
pub fn decode_limited(payload: &[u8], max: usize) -> Result<Message> {
    if payload.len() > max {
        return Err(Error::TooLarge {
            len: payload.len(),
            max,
        });
    }
    decode(payload)
}

// Go-style peers encode nil maps as `null`.
fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<DataMap, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<DataMap>::deserialize(deserializer)?.unwrap_or_default())
}

fn empty_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.filter(|value| !value.is_empty()))
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

fn is_false(value: &bool) -> bool {
    !*value
}
