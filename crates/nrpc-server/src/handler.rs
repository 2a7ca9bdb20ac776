// Service-side request/response types and the handler capability trait.
use crate::context::CallContext;
use crate::error::HandlerError;
use async_trait::async_trait;
use nrpc_wire::{DataMap, Message, Value};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;

pub type HandlerResult = Result<Response, HandlerError>;

/// Describes one method for introspection via the `info` control command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MethodInfo {
    pub name: String,
    pub description: String,
    pub streaming: bool,
    pub metadata: DataMap,
}

impl MethodInfo {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            streaming: false,
            metadata: DataMap::new(),
        }
    }

    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: String,
    pub service: String,
    pub method: String,
    pub data: DataMap,
    pub metadata: DataMap,
}

impl Request {
    pub fn new(service: impl Into<String>, method: impl Into<String>, data: DataMap) -> Self {
        Self {
            id: nrpc_common::ids::new_message_id(),
            service: service.into(),
            method: method.into(),
            data,
            metadata: DataMap::new(),
        }
    }

    pub(crate) fn from_message(message: Message) -> Self {
        Self {
            id: message.id,
            service: message.service,
            method: message.method,
            data: message.data,
            metadata: message.metadata,
        }
    }

    pub fn with_metadata(mut self, metadata: DataMap) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// Decode `data` into a handler-owned type instead of poking at the map.
    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        Ok(serde_json::from_value(Value::Object(self.data.clone()))?)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Response {
    pub data: DataMap,
    pub metadata: DataMap,
}

impl Response {
    pub fn new(data: DataMap) -> Self {
        Self {
            data,
            metadata: DataMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: DataMap) -> Self {
        self.metadata = metadata;
        self
    }

    /// Build a response from any type that serializes to a JSON object.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self, HandlerError> {
        match serde_json::to_value(value) {
            Ok(Value::Object(data)) => Ok(Self::new(data)),
            Ok(other) => Err(HandlerError::internal(format!(
                "response must serialize to an object, got {other}"
            ))),
            Err(err) => Err(HandlerError::internal(err.to_string())),
        }
    }
}

/// A named service the server can route requests to.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    fn name(&self) -> &str;

    fn methods(&self) -> BTreeMap<String, MethodInfo>;

    async fn handle(&self, ctx: CallContext, req: Request) -> HandlerResult;
}
