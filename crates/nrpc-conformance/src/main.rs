// Runs the protocol checks end to end over the in-process broker.
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use nrpc_broker::Broker;
use nrpc_client::{CallOptions, Client, ClientConfig, ClientError};
use nrpc_server::{
    CallContext, HandlerError, HandlerResult, Middleware, Next, Request, Response, Server,
    ServerConfig, ServiceBuilder,
};
use nrpc_wire::{DataMap, Value};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "conformance";
const STREAM_ITEMS: u64 = 8;

#[tokio::main]
async fn main() -> Result<()> {
    println!("== nrpc Conformance Runner ==");
    let broker = Arc::new(Broker::new());
    let trace = Arc::new(Mutex::new(Vec::new()));
    let server = Server::new(
        broker.clone(),
        ServerConfig::default().with_namespace(NAMESPACE),
    );
    server.use_middleware(Arc::new(Trace::new("A", &trace)));
    server.use_middleware(Arc::new(Trace::new("B", &trace)));
    server
        .register_handler(Arc::new(echo_service(&trace)?))
        .context("register echo")?;
    server.start().await.context("start server")?;

    let config = ClientConfig::default()
        .with_namespace(NAMESPACE)
        .with_timeout(Duration::from_secs(2))
        .with_retry_delay(Duration::from_millis(10));
    let client = Client::new(broker.clone(), config);

    run_round_trip(&client).await?;
    run_middleware_order(&client, &trace).await?;
    run_timeout(&broker, &client).await?;
    run_cancellation(&broker, &client).await?;
    run_stream(&client).await?;
    run_cleanup(&server, &client).await?;

    broker.close();
    println!("Conformance checks passed.");
    Ok(())
}

type TraceLog = Arc<Mutex<Vec<String>>>;

struct Trace {
    name: &'static str,
    log: TraceLog,
}

impl Trace {
    fn new(name: &'static str, log: &TraceLog) -> Self {
        Self {
            name,
            log: Arc::clone(log),
        }
    }
}

#[async_trait]
impl Middleware for Trace {
    async fn handle(&self, ctx: CallContext, req: Request, next: Next<'_>) -> HandlerResult {
        if req.method != "traced" {
            return next.run(ctx, req).await;
        }
        self.log.lock().push(format!("{}-enter", self.name));
        let result = next.run(ctx, req).await;
        self.log.lock().push(format!("{}-exit", self.name));
        result
    }
}

fn text(value: &str) -> DataMap {
    let mut data = DataMap::new();
    data.insert("text".into(), Value::from(value));
    data
}

async fn upper(_ctx: CallContext, req: Request) -> HandlerResult {
    let upper = req.data_str("text").unwrap_or_default().to_uppercase();
    Ok(Response::new(text(&upper)))
}

async fn park(ctx: CallContext, _req: Request) -> HandlerResult {
    ctx.cancelled().await;
    Err(HandlerError::unavailable("stopped"))
}

async fn count(ctx: CallContext, req: Request) -> HandlerResult {
    let n = req.data.get("n").and_then(Value::as_u64).unwrap_or(0);
    let sink = ctx
        .stream()
        .ok_or_else(|| HandlerError::invalid_argument("streaming required"))?;
    for i in 0..n {
        let mut item = DataMap::new();
        item.insert("i".into(), Value::from(i));
        sink.send(item).await?;
    }
    Ok(Response::default())
}

fn echo_service(trace: &TraceLog) -> Result<nrpc_server::Service> {
    let trace = Arc::clone(trace);
    let service = ServiceBuilder::new("echo")
        .method("upper", "uppercases text", upper)
        .method("park", "waits for cancellation", park)
        .method("traced", "records handler entry", move |_ctx, _req| {
            let trace = Arc::clone(&trace);
            async move {
                trace.lock().push("handler".to_string());
                Ok::<_, HandlerError>(Response::default())
            }
        })
        .streaming_method("count", "streams n numbers", count)
        .build()?;
    Ok(service)
}

async fn run_round_trip(client: &Client) -> Result<()> {
    println!("Running round-trip checks...");
    let response = client
        .call("echo", "upper", text("hi"), DataMap::new())
        .await?;
    if response.data != text("HI") {
        return Err(anyhow!("unexpected echo reply: {:?}", response.data));
    }
    let health = client.health_check().await?;
    if health.get("status") != Some(&Value::from("healthy")) {
        return Err(anyhow!("unexpected health reply: {health:?}"));
    }
    client.ping().await.context("ping")?;
    Ok(())
}

async fn run_middleware_order(client: &Client, trace: &TraceLog) -> Result<()> {
    println!("Running middleware ordering checks...");
    trace.lock().clear();
    client
        .call("echo", "traced", DataMap::new(), DataMap::new())
        .await?;
    let observed = trace.lock().clone();
    let expected = ["A-enter", "B-enter", "handler", "B-exit", "A-exit"];
    if observed != expected {
        return Err(anyhow!("unexpected middleware order: {observed:?}"));
    }
    Ok(())
}

async fn run_timeout(broker: &Arc<Broker>, client: &Client) -> Result<()> {
    println!("Running timeout checks...");
    let baseline = broker.subscriber_count();
    let options = CallOptions::default()
        .with_timeout(Duration::from_millis(50))
        .with_max_retries(1);
    match client
        .call_with("missing", "call", DataMap::new(), DataMap::new(), options)
        .await
    {
        Err(ClientError::Timeout { attempts: 2, .. }) => {}
        other => return Err(anyhow!("expected timeout, got {other:?}")),
    }
    if client.pending_count() != 0 {
        return Err(anyhow!("pending entries leaked after timeout"));
    }
    if broker.subscriber_count() != baseline {
        return Err(anyhow!("reply subscription leaked after timeout"));
    }
    Ok(())
}

async fn run_cancellation(broker: &Arc<Broker>, client: &Client) -> Result<()> {
    println!("Running cancellation checks...");
    let baseline = broker.subscriber_count();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });
    let started = Instant::now();
    let outcome = client
        .call_with(
            "echo",
            "park",
            DataMap::new(),
            DataMap::new(),
            CallOptions::default().with_cancel(cancel),
        )
        .await;
    if !matches!(outcome, Err(ClientError::Cancelled)) {
        return Err(anyhow!("expected cancellation, got {outcome:?}"));
    }
    if started.elapsed() > Duration::from_millis(500) {
        return Err(anyhow!("cancellation took {:?}", started.elapsed()));
    }
    if client.pending_count() != 0 || broker.subscriber_count() != baseline {
        return Err(anyhow!("cancelled call leaked resources"));
    }
    Ok(())
}

async fn run_stream(client: &Client) -> Result<()> {
    println!("Running stream checks...");
    let mut data = DataMap::new();
    data.insert("n".into(), Value::from(STREAM_ITEMS));
    let mut stream = client.stream("echo", "count", data, DataMap::new()).await?;
    // Start consuming only after everything was buffered.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut received = 0;
    while let Some(item) = stream.next().await {
        item.context("stream item")?;
        received += 1;
    }
    if received != STREAM_ITEMS || stream.trailer().is_none() {
        return Err(anyhow!("expected {STREAM_ITEMS} items, got {received}"));
    }
    Ok(())
}

async fn run_cleanup(server: &Server, client: &Client) -> Result<()> {
    println!("Running cleanup checks...");
    server.stop().await;
    server.stop().await;
    client.close();
    client.close();
    match client
        .call("echo", "upper", text("late"), DataMap::new())
        .await
    {
        Err(ClientError::Closed) => Ok(()),
        other => Err(anyhow!("expected closed client, got {other:?}")),
    }
}
