// Per-call context handed to middleware and handlers.
use crate::error::HandlerError;
use crate::handler::HandlerResult;
use nrpc_common::ErrorCode;
use nrpc_transport::{Transport, TransportError};
use nrpc_wire::{DataMap, Message, Value};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
struct Extensions {
    // Copy-on-write so cloned contexts never observe each other's inserts.
    map: Option<Arc<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>>,
}

impl Extensions {
    fn insert<T: Send + Sync + 'static>(&mut self, value: T) {
        let mut map = self.map.as_deref().cloned().unwrap_or_default();
        map.insert(TypeId::of::<T>(), Arc::new(value));
        self.map = Some(Arc::new(map));
    }

    fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.map
            .as_ref()?
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }
}

/// Carries the deadline, request metadata, transport addressing and
/// cancellation for one inbound call.
///
/// ```
/// use nrpc_server::CallContext;
/// use std::time::Duration;
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let mut ctx = CallContext::new("req-1", "app.echo.upper").with_timeout(Duration::from_secs(5));
///     ctx.insert_value(42u32);
///     assert_eq!(ctx.value::<u32>(), Some(&42));
///     assert!(ctx.remaining().expect("deadline") <= Duration::from_secs(5));
/// });
/// ```
#[derive(Clone)]
pub struct CallContext {
    request_id: Arc<str>,
    deadline: Option<Instant>,
    metadata: Arc<DataMap>,
    // Addressing is kept for diagnostics only.
    subject: Arc<str>,
    reply_to: Option<Arc<str>>,
    cancel: CancellationToken,
    stream: Option<StreamSink>,
    extensions: Extensions,
}

impl CallContext {
    pub fn new(request_id: impl Into<Arc<str>>, subject: impl Into<Arc<str>>) -> Self {
        Self {
            request_id: request_id.into(),
            deadline: None,
            metadata: Arc::new(DataMap::new()),
            subject: subject.into(),
            reply_to: None,
            cancel: CancellationToken::new(),
            stream: None,
            extensions: Extensions::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: DataMap) -> Self {
        self.metadata = Arc::new(metadata);
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<Arc<str>>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Tighten the deadline; an earlier existing deadline wins.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub(crate) fn with_stream(mut self, sink: StreamSink) -> Self {
        self.stream = Some(sink);
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata(key).and_then(Value::as_str)
    }

    pub fn metadata_map(&self) -> &DataMap {
        &self.metadata
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the server stops.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Token handlers can derive child tokens from for their own work.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Present when the caller opened a stream and streaming is enabled.
    pub fn stream(&self) -> Option<&StreamSink> {
        self.stream.as_ref()
    }

    pub fn insert_value<T: Send + Sync + 'static>(&mut self, value: T) {
        self.extensions.insert(value);
    }

    pub fn value<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.extensions.get::<T>()
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("request_id", &self.request_id)
            .field("subject", &self.subject)
            .field("reply_to", &self.reply_to)
            .field("deadline", &self.deadline)
            .field("streaming", &self.stream.is_some())
            .finish()
    }
}

struct SinkState {
    next_index: u64,
    finished: bool,
}

struct StreamSinkInner {
    transport: Arc<dyn Transport>,
    subject: String,
    // Request header (id/service/method) used to address stream messages.
    origin: Message,
    state: tokio::sync::Mutex<SinkState>,
}

/// Publishes `stream` messages for one streaming call.
///
/// Indexes start at 0 and increase by one per item. The server sends the
/// terminal message once the handler returns.
#[derive(Clone)]
pub struct StreamSink {
    inner: Arc<StreamSinkInner>,
}

impl StreamSink {
    pub(crate) fn new(transport: Arc<dyn Transport>, subject: String, request: &Message) -> Self {
        let origin = Message {
            data: DataMap::new(),
            metadata: DataMap::new(),
            ..request.clone()
        };
        Self {
            inner: Arc::new(StreamSinkInner {
                transport,
                subject,
                origin,
                state: tokio::sync::Mutex::new(SinkState {
                    next_index: 0,
                    finished: false,
                }),
            }),
        }
    }

    pub fn subject(&self) -> &str {
        &self.inner.subject
    }

    /// Publish one item; returns its stream index.
    pub async fn send(&self, data: DataMap) -> Result<u64, HandlerError> {
        let mut state = self.inner.state.lock().await;
        if state.finished {
            return Err(HandlerError::new(
                ErrorCode::Closed,
                "stream already finished",
            ));
        }
        let index = state.next_index;
        let message = Message::stream_item(&self.inner.origin, index, data);
        self.publish(&message)
            .await
            .map_err(|err| HandlerError::new(ErrorCode::TransportError, err.to_string()))?;
        state.next_index += 1;
        Ok(index)
    }

    /// Number of items published so far.
    pub async fn sent(&self) -> u64 {
        self.inner.state.lock().await.next_index
    }

    // Terminal message: end marker on success, error message otherwise.
    pub(crate) async fn finish(&self, outcome: HandlerResult) -> Result<(), TransportError> {
        let mut state = self.inner.state.lock().await;
        if state.finished {
            return Ok(());
        }
        state.finished = true;
        let message = match outcome {
            Ok(response) => Message::stream_end(
                &self.inner.origin,
                state.next_index,
                response.data,
                response.metadata,
            ),
            // Carries the item count too; items may still be in flight.
            Err(err) => Message {
                stream_index: state.next_index,
                ..Message::error_to(&self.inner.origin, err.into_error_info())
            },
        };
        self.publish(&message).await
    }

    async fn publish(&self, message: &Message) -> Result<(), TransportError> {
        let payload =
            nrpc_wire::encode(message).map_err(|err| TransportError::Other(err.to_string()))?;
        self.inner
            .transport
            .publish(&self.inner.subject, payload)
            .await
    }
}

impl fmt::Debug for StreamSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSink")
            .field("subject", &self.inner.subject)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Response;
    use nrpc_broker::Broker;
    use nrpc_transport::{Delivery, handler_fn};
    use nrpc_wire::MessageType;
    use tokio::sync::mpsc;

    #[test]
    fn extensions_are_copy_on_write() {
        let mut parent = CallContext::new("r", "s");
        parent.insert_value(String::from("parent"));
        let mut child = parent.clone();
        child.insert_value(7u8);
        assert_eq!(parent.value::<u8>(), None);
        assert_eq!(child.value::<String>().map(String::as_str), Some("parent"));
        assert_eq!(child.value::<u8>(), Some(&7));
    }

    #[tokio::test]
    async fn deadline_only_tightens() {
        let ctx = CallContext::new("r", "s").with_timeout(Duration::from_secs(1));
        let tightened = ctx.clone().with_timeout(Duration::from_secs(60));
        assert_eq!(tightened.deadline(), ctx.deadline());
        let shorter = ctx.clone().with_timeout(Duration::from_millis(10));
        assert!(shorter.deadline() < ctx.deadline());
    }

    #[test]
    fn metadata_lookup() {
        let mut metadata = DataMap::new();
        metadata.insert("tenant".into(), Value::from("t1"));
        let ctx = CallContext::new("r", "s")
            .with_metadata(metadata)
            .with_reply_to("ns.reply.r");
        assert_eq!(ctx.metadata_str("tenant"), Some("t1"));
        assert_eq!(ctx.reply_to(), Some("ns.reply.r"));
        assert!(ctx.metadata("missing").is_none());
    }

    #[tokio::test]
    async fn stream_sink_numbers_items_and_refuses_after_finish() {
        let broker: Arc<dyn Transport> = Arc::new(Broker::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = broker
            .subscribe(
                "ns.stream.r1",
                handler_fn(move |delivery: Delivery| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(delivery.payload);
                    }
                }),
            )
            .await
            .expect("subscribe");
        let request = Message::request("svc", "count", DataMap::new(), DataMap::new());
        let sink = StreamSink::new(Arc::clone(&broker), "ns.stream.r1".into(), &request);

        assert_eq!(sink.send(DataMap::new()).await.expect("send"), 0);
        assert_eq!(sink.send(DataMap::new()).await.expect("send"), 1);
        assert_eq!(sink.sent().await, 2);
        sink.finish(Ok(Response::default())).await.expect("finish");
        let err = sink.send(DataMap::new()).await.expect_err("finished");
        assert_eq!(err.code, "closed");

        let mut messages = Vec::new();
        for _ in 0..3 {
            let payload = rx.recv().await.expect("payload");
            messages.push(nrpc_wire::decode(&payload).expect("decode"));
        }
        assert!(messages.iter().all(|m| m.kind == MessageType::Stream));
        assert!(
            messages
                .iter()
                .all(|m| m.request_id.as_deref() == Some(request.id.as_str()))
        );
        let end = messages.iter().find(|m| m.stream_end).expect("end marker");
        assert_eq!(end.stream_index, 2);
    }
}
