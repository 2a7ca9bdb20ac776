use crate::config::ServerConfig;
use crate::context::{CallContext, StreamSink};
use crate::control::{self, ControlView};
use crate::error::{HandlerError, Result, ServerError};
use crate::handler::{HandlerResult, Request, ServiceHandler};
use crate::is_valid_token;
use crate::middleware::{Middleware, Next, panic_message};
use ahash::RandomState;
use futures::FutureExt;
use hashbrown::HashMap;
use nrpc_common::ErrorCode;
use nrpc_transport::{Delivery, Subscription, Transport, handler_fn};
use nrpc_wire::{ControlCommand, ErrorInfo, Message, RESERVED_SERVICE_NAMES, Subjects};
use parking_lot::RwLock;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

#[derive(Clone)]
enum Route {
    Service(Arc<str>),
    Control(ControlCommand),
}

struct RunState {
    subscriptions: Vec<Subscription>,
    dispatch: CancellationToken,
}

struct ServerInner {
    transport: Arc<dyn Transport>,
    config: ServerConfig,
    subjects: Subjects,
    handlers: RwLock<HashMap<String, Arc<dyn ServiceHandler>, RandomState>>,
    middleware: RwLock<Vec<Arc<dyn Middleware>>>,
    run: Mutex<RunState>,
    started: AtomicBool,
    permits: Semaphore,
}

/// Exposes registered services on `<ns>.<service>.>` and answers the
/// control subjects.
///
/// Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(transport: Arc<dyn Transport>, config: ServerConfig) -> Self {
        let subjects = Subjects::new(config.namespace.as_str());
        let permits = Semaphore::new(config.max_concurrency.max(1));
        Self {
            inner: Arc::new(ServerInner {
                transport,
                config,
                subjects,
                handlers: RwLock::new(HashMap::with_hasher(RandomState::new())),
                middleware: RwLock::new(Vec::new()),
                run: Mutex::new(RunState {
                    subscriptions: Vec::new(),
                    dispatch: CancellationToken::new(),
                }),
                started: AtomicBool::new(false),
                permits,
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn subjects(&self) -> &Subjects {
        &self.inner.subjects
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Registered service names, sorted.
    pub fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Store a service. It is subscribed on the next `start`.
    pub fn register_handler(&self, handler: Arc<dyn ServiceHandler>) -> Result<()> {
        let name = handler.name().to_string();
        if !is_valid_token(&name) {
            return Err(ServerError::InvalidName(name));
        }
        if RESERVED_SERVICE_NAMES.contains(&name.as_str()) {
            return Err(ServerError::ReservedName(name));
        }
        let mut handlers = self.inner.handlers.write();
        if handlers.contains_key(&name) {
            return Err(ServerError::DuplicateHandler(name));
        }
        if self.is_started() {
            tracing::warn!(service = %name, "handler registered after start; served after restart");
        }
        handlers.insert(name.clone(), handler);
        drop(handlers);
        tracing::info!(service = %name, "registered handler");
        Ok(())
    }

    /// Append a middleware; the first one added runs outermost.
    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.inner.middleware.write().push(middleware);
    }

    pub async fn start(&self) -> Result<()> {
        let mut run = self.inner.run.lock().await;
        if self.is_started() {
            return Ok(());
        }
        if !self.inner.transport.is_ready() {
            return Err(ServerError::TransportNotReady);
        }

        let dispatch = CancellationToken::new();
        let mut routes: Vec<(String, Route)> = self
            .handler_names()
            .into_iter()
            .map(|name| {
                let subject = self.inner.subjects.service_wildcard(&name);
                (subject, Route::Service(Arc::from(name)))
            })
            .collect();
        routes.extend(
            ControlCommand::ALL
                .into_iter()
                .map(|command| (self.inner.subjects.control(command), Route::Control(command))),
        );

        // On failure the partial list is dropped, which unsubscribes it.
        let mut subscriptions = Vec::with_capacity(routes.len());
        for (subject, route) in routes {
            subscriptions.push(self.subscribe(subject, route, &dispatch).await?);
        }

        run.subscriptions = subscriptions;
        run.dispatch = dispatch;
        self.inner.started.store(true, Ordering::Release);
        tracing::info!(
            name = %self.inner.config.name,
            version = %self.inner.config.version,
            namespace = %self.inner.config.namespace,
            subscriptions = run.subscriptions.len(),
            "nrpc server started"
        );
        Ok(())
    }

    /// Unsubscribe everything and cancel in-flight call contexts.
    pub async fn stop(&self) {
        let mut run = self.inner.run.lock().await;
        if !self.inner.started.swap(false, Ordering::AcqRel) {
            return;
        }
        run.dispatch.cancel();
        for mut subscription in run.subscriptions.drain(..) {
            if let Err(err) = subscription.unsubscribe() {
                tracing::warn!(
                    subject = %subscription.pattern(),
                    error = %err,
                    "failed to unsubscribe"
                );
            }
        }
        tracing::info!(name = %self.inner.config.name, "nrpc server stopped");
    }

    async fn subscribe(
        &self,
        subject: String,
        route: Route,
        dispatch: &CancellationToken,
    ) -> Result<Subscription> {
        let weak = Arc::downgrade(&self.inner);
        let dispatch = dispatch.clone();
        let handler = handler_fn(move |delivery: Delivery| {
            let weak = weak.clone();
            let dispatch = dispatch.clone();
            let route = route.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if dispatch.is_cancelled() {
                    return;
                }
                match route {
                    Route::Service(service) => inner.serve(&service, delivery, &dispatch).await,
                    Route::Control(command) => inner.control(command, delivery).await,
                }
            }
        });
        match self.inner.transport.subscribe(&subject, handler).await {
            Ok(subscription) => {
                tracing::debug!(%subject, "subscribed");
                Ok(subscription)
            }
            Err(source) => {
                tracing::warn!(%subject, error = %source, "subscribe failed");
                Err(ServerError::Subscribe { subject, source })
            }
        }
    }
}

impl ServerInner {
    async fn serve(&self, service: &str, delivery: Delivery, dispatch: &CancellationToken) {
        if self.config.enable_tracing {
            let span = tracing::info_span!("nrpc.dispatch", service, subject = %delivery.subject);
            self.dispatch(service, delivery, dispatch).instrument(span).await
        } else {
            self.dispatch(service, delivery, dispatch).await
        }
    }

    async fn dispatch(&self, service: &str, delivery: Delivery, dispatch: &CancellationToken) {
        let Delivery {
            subject,
            reply_to,
            payload,
        } = delivery;

        let mut header = match nrpc_wire::decode(&payload) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(%subject, error = %err, "failed to decode request");
                self.record(service, "", "parse_error", None);
                if let Some(reply_to) = reply_to.as_deref() {
                    let info = ErrorInfo::new(ErrorCode::ParseError, "failed to parse message");
                    self.send(reply_to, &Message::uncorrelated_error(info)).await;
                }
                return;
            }
        };

        let Some(handler) = self.handlers.read().get(service).cloned() else {
            tracing::warn!(%service, %subject, "no handler for subscribed service");
            return;
        };

        // Take the payload maps out so `header` only addresses replies.
        let mut request = Request {
            id: header.id.clone(),
            service: header.service.clone(),
            method: header.method.clone(),
            data: std::mem::take(&mut header.data),
            metadata: std::mem::take(&mut header.metadata),
        };
        if request.service.is_empty() {
            request.service = service.to_string();
        }
        let method = request.method.clone();

        let mut ctx = CallContext::new(request.id.as_str(), subject.as_str())
            .with_metadata(request.metadata.clone())
            .with_cancellation(dispatch.child_token());
        if let Some(reply_to) = reply_to.as_deref() {
            ctx = ctx.with_reply_to(reply_to);
        }
        let timeout = self.config.timeout;
        if !timeout.is_zero() {
            ctx = ctx.with_timeout(timeout);
        }
        let sink = match reply_to.as_deref() {
            Some(reply_to)
                if self.config.enable_streaming && self.subjects.is_stream_inbox(reply_to) =>
            {
                Some(StreamSink::new(
                    Arc::clone(&self.transport),
                    reply_to.to_string(),
                    &header,
                ))
            }
            _ => None,
        };
        if let Some(sink) = &sink {
            ctx = ctx.with_stream(sink.clone());
        }

        let Ok(_permit) = self.permits.acquire().await else {
            return;
        };
        let started = Instant::now();
        let middleware = self.middleware.read().clone();
        let result = self
            .invoke(&middleware, handler.as_ref(), ctx, request)
            .await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) => err.code.as_str(),
        };
        self.record(service, &method, outcome, Some(started));
        if let Err(err) = &result {
            tracing::debug!(%service, %method, code = %err.code, error = %err.message, "handler failed");
        }

        match (reply_to, sink) {
            (_, Some(sink)) => {
                if let Err(err) = sink.finish(result).await {
                    tracing::warn!(%service, %method, error = %err, "failed to finish stream");
                }
            }
            (Some(reply_to), None) => {
                let reply = match result {
                    Ok(response) => Message::response_to(&header, response.data, response.metadata),
                    Err(err) => Message::error_to(&header, err.into_error_info()),
                };
                self.send(&reply_to, &reply).await;
            }
            (None, None) => {}
        }
    }

    // Runs the chain under the server timeout; panics become `internal_error`.
    async fn invoke(
        &self,
        middleware: &[Arc<dyn Middleware>],
        handler: &dyn ServiceHandler,
        ctx: CallContext,
        request: Request,
    ) -> HandlerResult {
        let call = AssertUnwindSafe(Next::new(middleware, handler).run(ctx, request)).catch_unwind();
        let timeout = self.config.timeout;
        let outcome = if timeout.is_zero() {
            call.await
        } else {
            match tokio::time::timeout(timeout, call).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(HandlerError::timeout(format!(
                        "handler exceeded {}ms",
                        timeout.as_millis()
                    )));
                }
            }
        };
        outcome.unwrap_or_else(|payload| {
            let message = panic_message(payload.as_ref());
            tracing::error!(panic = %message, "handler panicked");
            Err(HandlerError::internal(format!("handler panicked: {message}")))
        })
    }

    async fn control(&self, command: ControlCommand, delivery: Delivery) {
        let Some(reply_to) = delivery.reply_to.as_deref() else {
            return;
        };
        let request = nrpc_wire::decode(&delivery.payload).ok();
        let mut services: Vec<Arc<dyn ServiceHandler>> =
            self.handlers.read().values().cloned().collect();
        services.sort_by(|a, b| a.name().cmp(b.name()));
        let view = ControlView {
            config: &self.config,
            services,
            started: self.started.load(Ordering::Acquire),
            transport_ready: self.transport.is_ready(),
        };
        let reply = control::reply(command, request.as_ref(), &view);
        if self.config.enable_metrics {
            metrics::counter!("nrpc_server_control_total", "command" => command.as_str())
                .increment(1);
        }
        self.send(reply_to, &reply).await;
    }

    async fn send(&self, subject: &str, message: &Message) {
        let payload = match nrpc_wire::encode(message) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(%subject, error = %err, "failed to encode reply");
                return;
            }
        };
        if let Err(err) = self.transport.publish(subject, payload).await {
            tracing::warn!(%subject, error = %err, "failed to publish reply");
        }
    }

    fn record(&self, service: &str, method: &str, outcome: &str, started: Option<Instant>) {
        if !self.config.enable_metrics {
            return;
        }
        metrics::counter!(
            "nrpc_server_requests_total",
            "service" => service.to_string(),
            "method" => method.to_string(),
            "result" => outcome.to_string()
        )
        .increment(1);
        if let Some(started) = started {
            metrics::histogram!(
                "nrpc_server_request_duration_seconds",
                "service" => service.to_string(),
                "method" => method.to_string()
            )
            .record(started.elapsed().as_secs_f64());
        }
    }
}

#[cfg(test)]
mod tests;
