// Replies for the always-on `<ns>.control.{ping,info,health}` subjects.
use crate::config::ServerConfig;
use crate::handler::ServiceHandler;
use nrpc_common::clock;
use nrpc_wire::{ControlCommand, DataMap, Message, MessageType, Value};
use serde_json::json;
use std::sync::Arc;

pub(crate) struct ControlView<'a> {
    pub config: &'a ServerConfig,
    // Sorted by name.
    pub services: Vec<Arc<dyn ServiceHandler>>,
    pub started: bool,
    pub transport_ready: bool,
}

pub(crate) fn reply(command: ControlCommand, request: Option<&Message>, view: &ControlView<'_>) -> Message {
    match command {
        ControlCommand::Ping => {
            let mut data = DataMap::new();
            data.insert("pong".into(), Value::from(clock::unix_seconds()));
            match request {
                Some(request) => Message::pong_to(request, data),
                None => standalone(MessageType::Pong, data),
            }
        }
        ControlCommand::Info => respond(request, info(view)),
        ControlCommand::Health => respond(request, health(view)),
    }
}

fn respond(request: Option<&Message>, data: DataMap) -> Message {
    match request {
        Some(request) => Message::response_to(request, data, DataMap::new()),
        None => standalone(MessageType::Response, data),
    }
}

// Undecodable control payloads are still answered, just without correlation.
fn standalone(kind: MessageType, data: DataMap) -> Message {
    let mut message = Message::event(data, DataMap::new());
    message.kind = kind;
    message
}

fn info(view: &ControlView<'_>) -> DataMap {
    let services: serde_json::Map<String, Value> = view
        .services
        .iter()
        .map(|service| {
            let methods: serde_json::Map<String, Value> = service
                .methods()
                .into_iter()
                .map(|(name, info)| {
                    let entry = json!({
                        "name": info.name,
                        "description": info.description,
                        "streaming": info.streaming,
                        "metadata": info.metadata,
                    });
                    (name, entry)
                })
                .collect();
            let entry = json!({ "name": service.name(), "methods": methods });
            (service.name().to_string(), entry)
        })
        .collect();

    let mut data = DataMap::new();
    data.insert("name".into(), Value::from(view.config.name.clone()));
    data.insert("version".into(), Value::from(view.config.version.clone()));
    data.insert("namespace".into(), Value::from(view.config.namespace.clone()));
    data.insert("services".into(), Value::Object(services));
    data.insert("started".into(), Value::from(view.started));
    data.insert("timestamp".into(), Value::from(clock::now().to_rfc3339()));
    data
}

fn health(view: &ControlView<'_>) -> DataMap {
    let status = if view.transport_ready {
        "healthy"
    } else {
        "unhealthy"
    };
    let mut data = DataMap::new();
    data.insert("status".into(), Value::from(status));
    data.insert("transport_ready".into(), Value::from(view.transport_ready));
    data.insert("timestamp".into(), Value::from(clock::now().to_rfc3339()));
    data
}
