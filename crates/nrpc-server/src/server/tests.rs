use super::*;
use crate::handler::{MethodInfo, Response};
use crate::middleware::{Logging, Recovery};
use crate::service::ServiceBuilder;
use async_trait::async_trait;
use bytes::Bytes;
use nrpc_broker::Broker;
use nrpc_transport::{MessageHandler, TransportError};
use nrpc_wire::{DataMap, MessageType, Value};
use std::collections::BTreeMap;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;
use tokio::sync::{Notify, mpsc};

const NS: &str = "test";

fn text(value: &str) -> DataMap {
    let mut data = DataMap::new();
    data.insert("text".into(), Value::from(value));
    data
}

async fn upper(_ctx: CallContext, req: Request) -> HandlerResult {
    let upper = req.data_str("text").unwrap_or_default().to_uppercase();
    Ok(Response::new(text(&upper)))
}

async fn explode(_ctx: CallContext, _req: Request) -> HandlerResult {
    panic!("boom")
}

async fn slow(_ctx: CallContext, _req: Request) -> HandlerResult {
    tokio::time::sleep(Duration::from_secs(5)).await;
    Ok(Response::default())
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
    if req.data.contains_key("fail") {
        return Err(HandlerError::internal("stream failed"));
    }
    let mut done = DataMap::new();
    done.insert("total".into(), Value::from(n));
    Ok(Response::new(done))
}

fn echo_service() -> Arc<dyn ServiceHandler> {
    let service = ServiceBuilder::new("echo")
        .method("upper", "uppercases text", upper)
        .method("panic", "always panics", explode)
        .method("slow", "sleeps past the deadline", slow)
        .streaming_method("count", "streams n numbers", count)
        .build()
        .expect("echo service");
    Arc::new(service)
}

fn config() -> ServerConfig {
    ServerConfig::default().with_namespace(NS)
}

async fn started(broker: &Arc<Broker>, config: ServerConfig) -> Server {
    let server = Server::new(broker.clone(), config);
    server.register_handler(echo_service()).expect("register echo");
    server.start().await.expect("start");
    server
}

// Publishes `payload` to `subject` with a reply inbox and collects `count` replies.
async fn exchange(
    broker: &Arc<Broker>,
    subject: &str,
    reply_to: &str,
    payload: Bytes,
    count: usize,
) -> Vec<Message> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _inbox = broker
        .subscribe(
            reply_to,
            handler_fn(move |delivery: Delivery| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(delivery.payload);
                }
            }),
        )
        .await
        .expect("subscribe inbox");
    broker
        .publish_request(subject, reply_to, payload)
        .await
        .expect("publish");
    let mut replies = Vec::with_capacity(count);
    for _ in 0..count {
        let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("reply timeout")
            .expect("inbox open");
        replies.push(nrpc_wire::decode(&payload).expect("decode reply"));
    }
    replies
}

fn request(method: &str, data: DataMap) -> Message {
    Message::request("echo", method, data, DataMap::new())
}

async fn call(broker: &Arc<Broker>, message: &Message) -> Message {
    let subject = format!("{NS}.{}.{}", message.service, message.method);
    let reply_to = format!("{NS}.reply.{}", message.id);
    let payload = nrpc_wire::encode(message).expect("encode");
    exchange(broker, &subject, &reply_to, payload, 1)
        .await
        .remove(0)
}

#[tokio::test]
async fn register_rejects_duplicates_reserved_and_invalid_names() {
    let server = Server::new(Arc::new(Broker::new()), config());
    server.register_handler(echo_service()).expect("first");
    let err = server.register_handler(echo_service()).expect_err("duplicate");
    assert!(matches!(err, ServerError::DuplicateHandler(ref name) if name == "echo"));

    for reserved in ["control", "reply", "stream"] {
        let service = ServiceBuilder::new(reserved).build().expect("service");
        let err = server
            .register_handler(Arc::new(service))
            .expect_err("reserved");
        assert!(matches!(err, ServerError::ReservedName(_)));
    }
    assert_eq!(server.handler_names(), vec!["echo"]);
}

#[tokio::test]
async fn start_and_stop_are_idempotent_and_restartable() {
    let broker = Arc::new(Broker::new());
    let server = started(&broker, config()).await;
    // One service wildcard plus three control subjects.
    assert_eq!(broker.subscriber_count(), 4);
    server.start().await.expect("second start");
    assert_eq!(broker.subscriber_count(), 4);

    server.stop().await;
    server.stop().await;
    assert!(!server.is_started());
    assert_eq!(broker.subscriber_count(), 0);

    server.start().await.expect("restart");
    assert!(server.is_started());
    let reply = call(&broker, &request("upper", text("again"))).await;
    assert_eq!(reply.data["text"], "AGAIN");
    server.stop().await;
}

#[tokio::test]
async fn start_requires_ready_transport() {
    let broker = Arc::new(Broker::new());
    broker.close();
    let server = Server::new(broker.clone(), config());
    let err = server.start().await.expect_err("closed broker");
    assert!(matches!(err, ServerError::TransportNotReady));
    assert!(!server.is_started());
}

/// Fails the `fail_at`-th subscribe (1-based) once, then delegates.
struct FailingSubscribe {
    inner: Arc<Broker>,
    fail_at: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl Transport for FailingSubscribe {
    async fn publish(&self, subject: &str, payload: Bytes) -> nrpc_transport::Result<()> {
        self.inner.publish(subject, payload).await
    }

    async fn publish_request(
        &self,
        subject: &str,
        reply_to: &str,
        payload: Bytes,
    ) -> nrpc_transport::Result<()> {
        self.inner.publish_request(subject, reply_to, payload).await
    }

    async fn subscribe(
        &self,
        pattern: &str,
        handler: MessageHandler,
    ) -> nrpc_transport::Result<Subscription> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_at {
            return Err(TransportError::Other("subscribe refused".into()));
        }
        self.inner.subscribe(pattern, handler).await
    }

    fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }
}

#[tokio::test]
async fn failed_subscribe_rolls_back_start() {
    let broker = Arc::new(Broker::new());
    let transport = Arc::new(FailingSubscribe {
        inner: broker.clone(),
        fail_at: 3,
        calls: AtomicUsize::new(0),
    });
    let server = Server::new(transport.clone(), config());
    server.register_handler(echo_service()).expect("register");

    let err = server.start().await.expect_err("third subscribe fails");
    assert!(matches!(err, ServerError::Subscribe { .. }));
    assert_eq!(broker.subscriber_count(), 0);
    assert!(!server.is_started());

    server.start().await.expect("second start succeeds");
    assert!(server.is_started());
    assert!(broker.subscriber_count() > 0);
    server.stop().await;
    assert_eq!(broker.subscriber_count(), 0);
}

#[tokio::test]
async fn request_gets_correlated_response() {
    let broker = Arc::new(Broker::new());
    let _server = started(&broker, config()).await;
    let message = request("upper", text("hi"));
    let reply = call(&broker, &message).await;
    assert_eq!(reply.kind, MessageType::Response);
    assert_eq!(reply.request_id.as_deref(), Some(message.id.as_str()));
    assert_eq!(reply.data["text"], "HI");
}

#[tokio::test]
async fn garbage_payload_gets_parse_error() {
    let broker = Arc::new(Broker::new());
    let _server = started(&broker, config()).await;
    let replies = exchange(
        &broker,
        "test.echo.upper",
        "test.reply.garbage",
        Bytes::from_static(b"not json"),
        1,
    )
    .await;
    let reply = &replies[0];
    assert_eq!(reply.kind, MessageType::Error);
    assert!(reply.request_id.is_none());
    assert_eq!(reply.error_info().expect("error").code, "parse_error");
}

#[tokio::test]
async fn unknown_method_and_panics_become_error_messages() {
    let broker = Arc::new(Broker::new());
    let _server = started(&broker, config()).await;

    let missing = request("missing", DataMap::new());
    let reply = call(&broker, &missing).await;
    assert_eq!(reply.kind, MessageType::Error);
    assert_eq!(reply.request_id.as_deref(), Some(missing.id.as_str()));
    assert_eq!(reply.error_info().expect("error").code, "method_not_found");

    let reply = call(&broker, &request("panic", DataMap::new())).await;
    let error = reply.error_info().expect("error");
    assert_eq!(error.code, "internal_error");
    assert!(error.message.contains("boom"));

    // The subscription survives a panicking handler.
    let reply = call(&broker, &request("upper", text("still"))).await;
    assert_eq!(reply.data["text"], "STILL");
}

#[tokio::test]
async fn slow_handler_times_out() {
    let broker = Arc::new(Broker::new());
    let _server = started(&broker, config().with_timeout(Duration::from_millis(50))).await;
    let reply = call(&broker, &request("slow", DataMap::new())).await;
    assert_eq!(reply.error_info().expect("error").code, "timeout");
}

#[tokio::test]
async fn middleware_wraps_dispatch_in_installation_order() {
    struct Tag(&'static str, Arc<parking_lot::Mutex<Vec<String>>>);

    #[async_trait]
    impl Middleware for Tag {
        async fn handle(&self, ctx: CallContext, req: Request, next: Next<'_>) -> HandlerResult {
            self.1.lock().push(format!("{}-enter", self.0));
            let result = next.run(ctx, req).await;
            self.1.lock().push(format!("{}-exit", self.0));
            result
        }
    }

    let broker = Arc::new(Broker::new());
    let trace = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let server = Server::new(broker.clone(), config());
    server.use_middleware(Arc::new(Tag("A", trace.clone())));
    server.use_middleware(Arc::new(Tag("B", trace.clone())));
    server.use_middleware(Arc::new(Recovery));
    server.use_middleware(Arc::new(Logging));
    server.register_handler(echo_service()).expect("register");
    server.start().await.expect("start");

    call(&broker, &request("upper", text("x"))).await;
    assert_eq!(*trace.lock(), vec!["A-enter", "B-enter", "B-exit", "A-exit"]);
}

#[tokio::test]
async fn streaming_call_sends_items_then_end_marker() {
    let broker = Arc::new(Broker::new());
    let _server = started(&broker, config()).await;
    let mut data = DataMap::new();
    data.insert("n".into(), Value::from(3));
    let message = request("count", data);
    let reply_to = format!("{NS}.stream.{}", message.id);
    let payload = nrpc_wire::encode(&message).expect("encode");
    let mut replies = exchange(&broker, "test.echo.count", &reply_to, payload, 4).await;
    replies.sort_by_key(|reply| (reply.stream_end, reply.stream_index));

    assert!(replies.iter().all(|reply| reply.kind == MessageType::Stream));
    let indexes: Vec<u64> = replies[..3].iter().map(|reply| reply.stream_index).collect();
    assert_eq!(indexes, vec![0, 1, 2]);
    let end = &replies[3];
    assert!(end.stream_end);
    assert_eq!(end.stream_index, 3);
    assert_eq!(end.data["total"], 3);
    assert_eq!(end.request_id.as_deref(), Some(message.id.as_str()));
}

#[tokio::test]
async fn failing_stream_terminates_with_error() {
    let broker = Arc::new(Broker::new());
    let _server = started(&broker, config()).await;
    let mut data = DataMap::new();
    data.insert("n".into(), Value::from(1));
    data.insert("fail".into(), Value::from(true));
    let message = request("count", data);
    let reply_to = format!("{NS}.stream.{}", message.id);
    let payload = nrpc_wire::encode(&message).expect("encode");
    let replies = exchange(&broker, "test.echo.count", &reply_to, payload, 2).await;
    let error = replies
        .iter()
        .find(|reply| reply.is_error())
        .expect("error terminator");
    assert_eq!(error.error_info().expect("info").message, "stream failed");
    assert_eq!(error.stream_index, 1);
    assert!(replies.iter().all(|reply| !reply.stream_end));
}

#[tokio::test]
async fn streaming_method_without_stream_inbox_is_rejected() {
    let broker = Arc::new(Broker::new());
    let _server = started(&broker, config()).await;
    let reply = call(&broker, &request("count", DataMap::new())).await;
    assert_eq!(reply.error_info().expect("error").code, "invalid_argument");
}

#[tokio::test]
async fn control_plane_answers_ping_info_health() {
    let broker = Arc::new(Broker::new());
    let _server = started(&broker, config()).await;

    let ping = Message::ping();
    let replies = exchange(
        &broker,
        "test.control.ping",
        "test.reply.ping",
        nrpc_wire::encode(&ping).expect("encode"),
        1,
    )
    .await;
    assert_eq!(replies[0].kind, MessageType::Pong);
    assert_eq!(replies[0].request_id.as_deref(), Some(ping.id.as_str()));

    let info = Message::request("control", "info", DataMap::new(), DataMap::new());
    let replies = exchange(
        &broker,
        "test.control.info",
        "test.reply.info",
        nrpc_wire::encode(&info).expect("encode"),
        1,
    )
    .await;
    let data = &replies[0].data;
    assert_eq!(data["namespace"], NS);
    assert_eq!(data["started"], true);
    assert_eq!(data["services"]["echo"]["methods"]["count"]["streaming"], true);

    let replies = exchange(
        &broker,
        "test.control.health",
        "test.reply.health",
        Bytes::from_static(b"{}"),
        1,
    )
    .await;
    assert_eq!(replies[0].data["status"], "healthy");
    assert!(replies[0].request_id.is_none());
}

struct Waiter {
    entered: Arc<Notify>,
    cancelled: Arc<AtomicUsize>,
}

#[async_trait]
impl ServiceHandler for Waiter {
    fn name(&self) -> &str {
        "waiter"
    }

    fn methods(&self) -> BTreeMap<String, MethodInfo> {
        BTreeMap::from([("wait".to_string(), MethodInfo::new("wait", "waits for stop"))])
    }

    async fn handle(&self, ctx: CallContext, _req: Request) -> HandlerResult {
        self.entered.notify_one();
        ctx.cancelled().await;
        self.cancelled.fetch_add(1, Ordering::SeqCst);
        Ok(Response::default())
    }
}

#[tokio::test]
async fn stop_cancels_in_flight_contexts() {
    let broker = Arc::new(Broker::new());
    let entered = Arc::new(Notify::new());
    let cancelled = Arc::new(AtomicUsize::new(0));
    let server = Server::new(broker.clone(), config());
    server
        .register_handler(Arc::new(Waiter {
            entered: entered.clone(),
            cancelled: cancelled.clone(),
        }))
        .expect("register");
    server.start().await.expect("start");

    let message = Message::request("waiter", "wait", DataMap::new(), DataMap::new());
    // Fire-and-forget: no reply inbox.
    broker
        .publish("test.waiter.wait", nrpc_wire::encode(&message).expect("encode"))
        .await
        .expect("publish");
    tokio::time::timeout(Duration::from_secs(1), entered.notified())
        .await
        .expect("handler entered");

    server.stop().await;
    tokio::time::timeout(Duration::from_secs(1), async {
        while cancelled.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("handler observed cancellation");
}
