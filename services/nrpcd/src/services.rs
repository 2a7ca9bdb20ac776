// Services bundled with the daemon.
use anyhow::Result;
use nrpc_server::{
    CallContext, HandlerError, HandlerResult, Request, Response, ServiceBuilder, ServiceRegistry,
};
use nrpc_wire::{DataMap, Value};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

// Upper bound on items a single count stream may request.
const MAX_COUNT: u64 = 10_000;

#[derive(Deserialize)]
struct TextRequest {
    text: String,
}

#[derive(Serialize)]
struct TextReply {
    text: String,
}

#[derive(Deserialize)]
struct CountRequest {
    n: u64,
}

async fn echo(_ctx: CallContext, req: Request) -> HandlerResult {
    Ok(Response::new(req.data).with_metadata(req.metadata))
}

async fn upper(_ctx: CallContext, req: Request) -> HandlerResult {
    let TextRequest { text } = req.decode_data()?;
    Response::from_serialize(&TextReply {
        text: text.to_uppercase(),
    })
}

async fn ping(_ctx: CallContext, _req: Request) -> HandlerResult {
    let mut data = DataMap::new();
    data.insert("pong".into(), Value::Bool(true));
    Ok(Response::new(data))
}

async fn count(ctx: CallContext, req: Request) -> HandlerResult {
    let CountRequest { n } = req.decode_data()?;
    if n > MAX_COUNT {
        return Err(HandlerError::invalid_argument(format!(
            "n must be at most {MAX_COUNT}"
        )));
    }
    let sink = ctx
        .stream()
        .ok_or_else(|| HandlerError::invalid_argument("count must be called as a stream"))?;
    for i in 0..n {
        if ctx.is_cancelled() {
            return Err(HandlerError::unavailable("server stopping"));
        }
        let mut item = DataMap::new();
        item.insert("i".into(), Value::from(i));
        sink.send(item).await?;
    }
    let mut done = DataMap::new();
    done.insert("total".into(), Value::from(n));
    Ok(Response::new(done))
}

/// Echo and health services keyed by name.
pub fn registry(server_name: &str) -> Result<ServiceRegistry> {
    let registry = ServiceRegistry::new();
    let echo = ServiceBuilder::new("echo")
        .method("echo", "returns data and metadata unchanged", echo)
        .method("upper", "uppercases the text field", upper)
        .method("ping", "answers pong", ping)
        .streaming_method("count", "streams n numbered items", count)
        .build()?;
    registry.register(Arc::new(echo))?;

    let started = Instant::now();
    let name = server_name.to_string();
    let health = ServiceBuilder::new("health")
        .method("check", "reports status and uptime", move |_ctx, _req| async move {
            let mut data = DataMap::new();
            data.insert("status".into(), Value::from("ok"));
            data.insert(
                "uptime_ms".into(),
                Value::from(started.elapsed().as_millis() as u64),
            );
            Ok::<_, HandlerError>(Response::new(data))
        })
        .method("version", "reports build version", move |_ctx, _req| {
            let name = name.clone();
            async move {
                let mut data = DataMap::new();
                data.insert("name".into(), Value::from(name));
                data.insert("version".into(), Value::from(env!("CARGO_PKG_VERSION")));
                Ok::<_, HandlerError>(Response::new(data))
            }
        })
        .build()?;
    registry.register(Arc::new(health))?;
    Ok(registry)
}
