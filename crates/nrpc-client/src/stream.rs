//! Client side of a streaming call.
use crate::error::ClientError;
use futures::Stream;
use nrpc_transport::{Delivery, MessageHandler, Subscription, handler_fn};
use nrpc_wire::{Message, MessageType};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

enum Terminal {
    End(Message),
    // Error after `sent` items.
    Failed { error: ClientError, sent: u64 },
}

#[derive(Default)]
pub(crate) struct StreamShared {
    terminal: Mutex<Option<Terminal>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl StreamShared {
    fn finish(&self, terminal: Terminal) {
        let mut slot = self.terminal.lock();
        if slot.is_none() {
            *slot = Some(terminal);
        }
        drop(slot);
        self.notify.notify_one();
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Acquire)
    }
}

/// Subscription callback for a stream inbox. Items go through a bounded queue;
/// when it is full the newest item is dropped and counted.
pub(crate) fn inbox_handler(
    request_id: String,
    items: mpsc::Sender<Message>,
    shared: Arc<StreamShared>,
    enable_metrics: bool,
) -> MessageHandler {
    let request_id: Arc<str> = Arc::from(request_id);
    handler_fn(move |delivery: Delivery| {
        let request_id = Arc::clone(&request_id);
        let items = items.clone();
        let shared = Arc::clone(&shared);
        async move {
            let message = match nrpc_wire::decode(&delivery.payload) {
                Ok(message) => message,
                Err(err) => {
                    tracing::warn!(subject = %delivery.subject, error = %err, "undecodable stream message");
                    return;
                }
            };
            if message
                .request_id
                .as_deref()
                .is_some_and(|id| id != &*request_id)
            {
                tracing::debug!(%request_id, "stream message for another request");
                return;
            }
            match message.kind {
                MessageType::Stream if message.stream_end => shared.finish(Terminal::End(message)),
                MessageType::Stream => {
                    if let Err(mpsc::error::TrySendError::Full(_)) = items.try_send(message) {
                        shared.dropped.fetch_add(1, Ordering::AcqRel);
                        if enable_metrics {
                            metrics::counter!("nrpc_client_stream_dropped_total").increment(1);
                        }
                        // Wake the reader: the drop may complete the stream.
                        shared.notify.notify_one();
                    }
                }
                MessageType::Error => {
                    let error = match message.error {
                        Some(info) => ClientError::Remote {
                            code: info.code,
                            message: info.message,
                            details: info.details,
                        },
                        None => ClientError::UnexpectedReply(MessageType::Error),
                    };
                    shared.finish(Terminal::Failed {
                        error,
                        sent: message.stream_index,
                    });
                }
                other => tracing::debug!(kind = other.as_str(), "ignoring non-stream message"),
            }
        }
    })
}

/// Items of a streaming call, in arrival order.
///
/// The end marker is not yielded; it is available from
/// [`trailer`](Self::trailer) once the stream completes. A remote error is
/// yielded as the last item. Dropping the stream releases its subscription.
pub struct MessageStream {
    items: mpsc::Receiver<Message>,
    shared: Arc<StreamShared>,
    subscription: Option<Subscription>,
    cancel: Option<CancellationToken>,
    shutdown: CancellationToken,
    idle_timeout: Duration,
    service: String,
    method: String,
    delivered: u64,
    trailer: Option<Message>,
    done: bool,
}

pub(crate) struct StreamParts {
    pub items: mpsc::Receiver<Message>,
    pub shared: Arc<StreamShared>,
    pub subscription: Subscription,
    pub cancel: Option<CancellationToken>,
    pub shutdown: CancellationToken,
    pub idle_timeout: Duration,
    pub service: String,
    pub method: String,
}

impl MessageStream {
    pub(crate) fn new(parts: StreamParts) -> Self {
        Self {
            items: parts.items,
            shared: parts.shared,
            subscription: Some(parts.subscription),
            cancel: parts.cancel,
            shutdown: parts.shutdown,
            idle_timeout: parts.idle_timeout,
            service: parts.service,
            method: parts.method,
            delivered: 0,
            trailer: None,
            done: false,
        }
    }

    pub async fn next(&mut self) -> Option<Result<Message, ClientError>> {
        if self.done {
            return None;
        }
        let cancel = self.cancel.clone();
        let shutdown = self.shutdown.clone();
        loop {
            if let Ok(message) = self.items.try_recv() {
                self.delivered += 1;
                return Some(Ok(message));
            }
            if let Some(outcome) = self.take_terminal() {
                return outcome;
            }
            tokio::select! {
                item = self.items.recv() => match item {
                    Some(message) => {
                        self.delivered += 1;
                        return Some(Ok(message));
                    }
                    None => {
                        self.finish();
                        return None;
                    }
                },
                _ = self.shared.notify.notified() => continue,
                _ = cancelled(cancel.as_ref()) => {
                    self.finish();
                    return Some(Err(ClientError::Cancelled));
                }
                _ = shutdown.cancelled() => {
                    self.finish();
                    return Some(Err(ClientError::Closed));
                }
                _ = tokio::time::sleep(self.idle_timeout) => {
                    self.finish();
                    return Some(Err(ClientError::Timeout {
                        service: self.service.clone(),
                        method: self.method.clone(),
                        attempts: 1,
                    }));
                }
            }
        }
    }

    // None while the stream is still open.
    fn take_terminal(&mut self) -> Option<Option<Result<Message, ClientError>>> {
        let mut slot = self.shared.terminal.lock();
        let accounted = self.delivered + self.shared.dropped();
        // Items can race the terminal message; wait until every item is
        // accounted for as delivered or dropped.
        match slot.take()? {
            Terminal::Failed { error, sent } if accounted >= sent => {
                drop(slot);
                self.finish();
                Some(Some(Err(error)))
            }
            Terminal::End(end) if accounted >= end.stream_index => {
                drop(slot);
                self.trailer = Some(end);
                self.finish();
                Some(None)
            }
            terminal => {
                *slot = Some(terminal);
                None
            }
        }
    }

    fn finish(&mut self) {
        self.done = true;
        self.items.close();
        if let Some(mut subscription) = self.subscription.take()
            && let Err(err) = subscription.unsubscribe()
        {
            tracing::debug!(error = %err, "stream unsubscribe failed");
        }
    }

    /// The end marker, once the stream completed normally.
    pub fn trailer(&self) -> Option<&Message> {
        self.trailer.as_ref()
    }

    /// Items lost because the local queue was full.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn close(&mut self) {
        self.finish();
    }

    /// Adapt into a [`futures::Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Result<Message, ClientError>> + Send {
        futures::stream::unfold(self, |mut stream| async move {
            let item = stream.next().await?;
            Some((item, stream))
        })
    }
}

pub(crate) async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}
