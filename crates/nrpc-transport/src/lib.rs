// Publish/subscribe contract the nrpc client and server are written against.
//
// A transport moves opaque payloads between dot-delimited subjects. It must
// deliver every published payload to each currently active matching
// subscriber at least once, and it runs each delivery on its own task so
// handlers for independent messages execute concurrently. Ordering across
// subjects is not guaranteed.
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

mod subject;

pub use subject::{SubjectPattern, validate_subject};

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("transport not ready")]
    NotReady,
    #[error("subscriber queue full for {subject}")]
    QueueFull { subject: String },
    #[error("payload too large ({len} > {max} bytes)")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("invalid subject: {0}")]
    InvalidSubject(String),
    #[error("transport error: {0}")]
    Other(String),
}

/// Transport-level configuration defaults.
///
/// ```
/// use nrpc_transport::TransportConfig;
///
/// let config = TransportConfig::default();
/// assert!(config.queue_capacity > 0);
/// assert!(config.max_payload_bytes > 0);
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    // Per-subscriber queue depth between publish and dispatch.
    pub queue_capacity: usize,
    // Largest payload accepted by publish.
    pub max_payload_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_payload_bytes: 1024 * 1024,
        }
    }
}

/// One payload as seen by a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub subject: String,
    pub reply_to: Option<String>,
    pub payload: Bytes,
}

/// Subscription callback. The returned future is spawned per delivery.
pub type MessageHandler = Arc<dyn Fn(Delivery) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |delivery| Box::pin(f(delivery)))
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;

    /// Publish carrying a reply-to address for the receiver to answer on.
    async fn publish_request(&self, subject: &str, reply_to: &str, payload: Bytes) -> Result<()>;

    async fn subscribe(&self, pattern: &str, handler: MessageHandler) -> Result<Subscription>;

    fn is_ready(&self) -> bool;
}

type UnsubscribeFn = Box<dyn FnOnce() -> Result<()> + Send>;

/// Handle for one live subscription. Dropping it unsubscribes.
pub struct Subscription {
    pattern: String,
    unsubscribe: Option<UnsubscribeFn>,
}

impl Subscription {
    pub fn new<F>(pattern: impl Into<String>, unsubscribe: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        Self {
            pattern: pattern.into(),
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_active(&self) -> bool {
        self.unsubscribe.is_some()
    }

    /// Stop delivery. Calling it again is a no-op.
    pub fn unsubscribe(&mut self) -> Result<()> {
        match self.unsubscribe.take() {
            Some(unsubscribe) => unsubscribe(),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("pattern", &self.pattern)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Err(err) = self.unsubscribe() {
            tracing::debug!(pattern = %self.pattern, error = %err, "unsubscribe on drop failed");
        }
    }
}
