use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::pending::{PendingGuard, PendingRegistry};
use crate::stream::{MessageStream, StreamParts, StreamShared, cancelled, inbox_handler};
use nrpc_transport::{Delivery, MessageHandler, Subscription, Transport, handler_fn};
use nrpc_wire::{ControlCommand, DataMap, Message, MessageType, Subjects, Value};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use slab::Slab;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Metadata key carrying [`CallOptions::idempotency_key`].
pub const IDEMPOTENCY_KEY: &str = "idempotency_key";

type EventSlab = Mutex<Slab<Vec<Subscription>>>;

/// Per-call overrides of the client defaults.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub idempotency_key: Option<String>,
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Successful reply to a call.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Id of the reply message.
    pub id: String,
    pub data: DataMap,
    pub metadata: DataMap,
}

impl Response {
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(Value::Object(self.data.clone()))
    }

    fn from_reply(reply: Message) -> Result<Self> {
        match reply.kind {
            MessageType::Response | MessageType::Pong => Ok(Self {
                id: reply.id,
                data: reply.data,
                metadata: reply.metadata,
            }),
            MessageType::Error => match reply.error {
                Some(info) => Err(ClientError::Remote {
                    code: info.code,
                    message: info.message,
                    details: info.details,
                }),
                None => Err(ClientError::UnexpectedReply(MessageType::Error)),
            },
            other => Err(ClientError::UnexpectedReply(other)),
        }
    }
}

/// Handle for a durable event subscription.
///
/// Dropping the handle leaves the subscription in place until
/// [`unsubscribe`](Self::unsubscribe) or [`Client::close`].
#[derive(Debug)]
pub struct EventSubscription {
    subject: String,
    key: Option<usize>,
    events: Weak<EventSlab>,
}

impl EventSubscription {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn is_active(&self) -> bool {
        match (self.key, self.events.upgrade()) {
            (Some(key), Some(events)) => events.lock().contains(key),
            _ => false,
        }
    }

    /// Stop delivery. Calling it again is a no-op.
    pub fn unsubscribe(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        let Some(events) = self.events.upgrade() else {
            return;
        };
        // Subscriptions unsubscribe on drop, outside the lock.
        let removed = events.lock().try_remove(key);
        drop(removed);
    }
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    subjects: Subjects,
    pending: Arc<PendingRegistry>,
    events: Arc<EventSlab>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Makes calls, streams and events against any server on the same namespace.
///
/// Cloning is cheap; clones share the pending registry and subscriptions.
/// Construction spawns the pending-request sweeper, so it must happen inside
/// a Tokio runtime.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        let subjects = Subjects::new(config.namespace.as_str());
        let pending = Arc::new(PendingRegistry::new());
        let shutdown = CancellationToken::new();
        let sweeper = spawn_sweeper(
            Arc::clone(&pending),
            config.sweep_interval,
            shutdown.clone(),
            config.enable_metrics,
        );
        Self {
            inner: Arc::new(ClientInner {
                transport,
                config,
                subjects,
                pending,
                events: Arc::new(Mutex::new(Slab::new())),
                shutdown,
                closed: AtomicBool::new(false),
                sweeper: Mutex::new(Some(sweeper)),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn subjects(&self) -> &Subjects {
        &self.inner.subjects
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Calls waiting on a reply right now.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    pub async fn call(
        &self,
        service: &str,
        method: &str,
        data: DataMap,
        metadata: DataMap,
    ) -> Result<Response> {
        self.call_with(service, method, data, metadata, CallOptions::default())
            .await
    }

    /// Request/reply with retries.
    ///
    /// Each attempt republishes the same request and waits up to the call
    /// timeout for a reply; attempt `n` is preceded by a `retry_delay * n`
    /// pause. Cancellation and close abort immediately.
    pub async fn call_with(
        &self,
        service: &str,
        method: &str,
        data: DataMap,
        mut metadata: DataMap,
        options: CallOptions,
    ) -> Result<Response> {
        self.ensure_open()?;
        if let Some(key) = &options.idempotency_key {
            metadata.insert(IDEMPOTENCY_KEY.to_string(), Value::String(key.clone()));
        }
        let request = Message::request(service, method, data, metadata);
        let started = Instant::now();
        let outcome = if self.inner.config.enable_tracing {
            let span = tracing::info_span!(
                "nrpc.call",
                service = %service,
                method = %method,
                request_id = %request.id
            );
            self.exchange(&request, &options).instrument(span).await
        } else {
            self.exchange(&request, &options).await
        };
        if self.inner.config.enable_metrics {
            let result = match &outcome {
                Ok(_) => "ok",
                Err(err) => err.code(),
            };
            metrics::counter!("nrpc_client_calls_total", "result" => result.to_string())
                .increment(1);
            metrics::histogram!("nrpc_client_call_duration_seconds")
                .record(started.elapsed().as_secs_f64());
        }
        Response::from_reply(outcome?)
    }

    async fn exchange(&self, request: &Message, options: &CallOptions) -> Result<Message> {
        let inner = &self.inner;
        let timeout = options.timeout.unwrap_or(inner.config.timeout);
        let max_retries = options.max_retries.unwrap_or(inner.config.max_retries);
        let attempts = max_retries.saturating_add(1);
        let payload = nrpc_wire::encode(request)?;
        let subject = inner.subjects.request(&request.service, &request.method);
        let reply_to = inner.subjects.reply(&request.id);

        let mut rx = inner
            .pending
            .register(&request.id, tokio::time::Instant::now() + timeout)?;
        let _guard = PendingGuard::new(&inner.pending, &request.id);
        let _reply_subscription = inner
            .transport
            .subscribe(&reply_to, reply_handler(&inner.pending, &request.id))
            .await?;

        let mut last_transport_error = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                if inner.config.enable_metrics {
                    metrics::counter!("nrpc_client_retries_total").increment(1);
                }
                let delay = inner.config.retry_delay.saturating_mul(attempt);
                tokio::select! {
                    biased;
                    _ = cancelled(options.cancel.as_ref()) => return Err(ClientError::Cancelled),
                    _ = inner.shutdown.cancelled() => return Err(ClientError::Closed),
                    _ = tokio::time::sleep(delay) => {}
                }
                let deadline = tokio::time::Instant::now() + timeout;
                if !inner.pending.extend(&request.id, deadline) {
                    // Entry is gone: either a late reply landed in `rx` during
                    // the delay, or the sweeper evicted it.
                    match rx.try_recv() {
                        Ok(reply) => return reply,
                        Err(_) => rx = inner.pending.register(&request.id, deadline)?,
                    }
                }
                tracing::debug!(request_id = %request.id, attempt, "retrying call");
            }

            if let Err(err) = inner
                .transport
                .publish_request(&subject, &reply_to, payload.clone())
                .await
            {
                tracing::debug!(request_id = %request.id, attempt, error = %err, "publish failed");
                last_transport_error = Some(err);
                continue;
            }

            tokio::select! {
                biased;
                _ = cancelled(options.cancel.as_ref()) => return Err(ClientError::Cancelled),
                _ = inner.shutdown.cancelled() => return Err(ClientError::Closed),
                waited = tokio::time::timeout(timeout, &mut rx) => match waited {
                    Ok(Ok(reply)) => return reply,
                    // Swept while waiting; treat as a timed out attempt.
                    Ok(Err(_)) => {}
                    Err(_) => {}
                },
            }
            last_transport_error = None;
        }

        match last_transport_error {
            Some(err) => Err(ClientError::Transport(err)),
            None => Err(ClientError::Timeout {
                service: request.service.clone(),
                method: request.method.clone(),
                attempts,
            }),
        }
    }

    /// Fire-and-forget event on `<ns>.<subject>`.
    pub async fn publish(&self, subject: &str, data: DataMap, metadata: DataMap) -> Result<()> {
        self.ensure_open()?;
        let message = Message::event(data, metadata);
        let payload = nrpc_wire::encode(&message)?;
        self.inner
            .transport
            .publish(&self.inner.subjects.event(subject), payload)
            .await?;
        Ok(())
    }

    /// Deliver every message on `<ns>.<subject>` and its children to `handler`.
    pub async fn subscribe<F, Fut>(&self, subject: &str, handler: F) -> Result<EventSubscription>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.ensure_open()?;
        let handler = Arc::new(handler);
        let on_delivery = handler_fn(move |delivery: Delivery| {
            let handler = Arc::clone(&handler);
            async move {
                match nrpc_wire::decode(&delivery.payload) {
                    Ok(message) => handler(message).await,
                    Err(err) => {
                        tracing::warn!(subject = %delivery.subject, error = %err, "undecodable event")
                    }
                }
            }
        });

        let transport = &self.inner.transport;
        let exact = transport
            .subscribe(&self.inner.subjects.event(subject), Arc::clone(&on_delivery))
            .await?;
        let children = transport
            .subscribe(&self.inner.subjects.event_children(subject), on_delivery)
            .await?;

        let mut events = self.inner.events.lock();
        // close() may have run while subscribing.
        if self.is_closed() {
            drop(events);
            return Err(ClientError::Closed);
        }
        let key = events.insert(vec![exact, children]);
        drop(events);
        tracing::debug!(subject = %subject, "event subscription added");
        Ok(EventSubscription {
            subject: subject.to_string(),
            key: Some(key),
            events: Arc::downgrade(&self.inner.events),
        })
    }

    pub async fn stream(
        &self,
        service: &str,
        method: &str,
        data: DataMap,
        metadata: DataMap,
    ) -> Result<MessageStream> {
        self.stream_with(service, method, data, metadata, CallOptions::default())
            .await
    }

    /// Start a streaming call.
    ///
    /// The request is published once. `options.timeout` bounds the wait
    /// for each next item; `max_retries` is ignored.
    pub async fn stream_with(
        &self,
        service: &str,
        method: &str,
        data: DataMap,
        mut metadata: DataMap,
        options: CallOptions,
    ) -> Result<MessageStream> {
        self.ensure_open()?;
        let inner = &self.inner;
        if let Some(key) = &options.idempotency_key {
            metadata.insert(IDEMPOTENCY_KEY.to_string(), Value::String(key.clone()));
        }
        let request = Message::request(service, method, data, metadata);
        let payload = nrpc_wire::encode(&request)?;
        let inbox = inner.subjects.stream(&request.id);

        let (tx, rx) = mpsc::channel(inner.config.stream_queue_capacity.max(1));
        let shared = Arc::new(StreamShared::default());
        let subscription = inner
            .transport
            .subscribe(
                &inbox,
                inbox_handler(
                    request.id.clone(),
                    tx,
                    Arc::clone(&shared),
                    inner.config.enable_metrics,
                ),
            )
            .await?;
        inner
            .transport
            .publish_request(&inner.subjects.request(service, method), &inbox, payload)
            .await?;
        tracing::debug!(request_id = %request.id, service, method, "stream started");

        Ok(MessageStream::new(StreamParts {
            items: rx,
            shared,
            subscription,
            cancel: options.cancel,
            shutdown: inner.shutdown.clone(),
            idle_timeout: options.timeout.unwrap_or(inner.config.timeout),
            service: service.to_string(),
            method: method.to_string(),
        }))
    }

    /// Round trip to the control plane.
    pub async fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        self.control(ControlCommand::Ping).await?;
        Ok(started.elapsed())
    }

    pub async fn get_info(&self) -> Result<DataMap> {
        Ok(self.control(ControlCommand::Info).await?.data)
    }

    pub async fn health_check(&self) -> Result<DataMap> {
        Ok(self.control(ControlCommand::Health).await?.data)
    }

    async fn control(&self, command: ControlCommand) -> Result<Response> {
        self.call(
            nrpc_wire::CONTROL_SERVICE,
            command.as_str(),
            DataMap::new(),
            DataMap::new(),
        )
        .await
    }

    /// Release everything and fail in-flight calls with `Closed`.
    /// Calling it again is a no-op.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();
        let cancelled = self.inner.pending.cancel_all();
        let subscriptions = std::mem::take(&mut *self.inner.events.lock());
        let released = subscriptions.len();
        drop(subscriptions);
        if let Some(sweeper) = self.inner.sweeper.lock().take() {
            sweeper.abort();
        }
        tracing::info!(cancelled, released, "client closed");
    }
}

// Completes by the id this inbox was created for, so uncorrelated error
// replies on the inbox still resolve the call.
fn reply_handler(pending: &Arc<PendingRegistry>, request_id: &str) -> MessageHandler {
    let pending = Arc::downgrade(pending);
    let request_id: Arc<str> = Arc::from(request_id);
    handler_fn(move |delivery: Delivery| {
        let pending = pending.clone();
        let request_id = Arc::clone(&request_id);
        async move {
            let message = match nrpc_wire::decode(&delivery.payload) {
                Ok(message) => message,
                Err(err) => {
                    tracing::warn!(subject = %delivery.subject, error = %err, "undecodable reply");
                    return;
                }
            };
            if message
                .request_id
                .as_deref()
                .is_some_and(|id| id != &*request_id)
            {
                tracing::debug!(%request_id, "reply for another request");
                return;
            }
            let Some(pending) = pending.upgrade() else {
                return;
            };
            if !pending.complete(&request_id, message) {
                tracing::debug!(%request_id, "late reply dropped");
            }
        }
    })
}

fn spawn_sweeper(
    pending: Arc<PendingRegistry>,
    every: Duration,
    shutdown: CancellationToken,
    enable_metrics: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = pending.sweep(tokio::time::Instant::now());
                    if evicted > 0 {
                        tracing::debug!(evicted, "expired pending calls evicted");
                        if enable_metrics {
                            metrics::counter!("nrpc_client_pending_evicted_total")
                                .increment(evicted as u64);
                        }
                    }
                }
            }
        }
    })
}
