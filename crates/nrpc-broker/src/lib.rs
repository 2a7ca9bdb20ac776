// In-process pub/sub broker implementing the nrpc transport contract.
// Used for embedded deployments and as the default transport in tests.
use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use nrpc_transport::{
    Delivery, MessageHandler, SubjectPattern, Subscription, Transport, TransportConfig,
    TransportError, validate_subject,
};
use parking_lot::Mutex;
use slab::Slab;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(feature = "telemetry")]
macro_rules! t_histogram {
    ($($tt:tt)*) => {
        metrics::histogram!($($tt)*)
    };
}

#[cfg(not(feature = "telemetry"))]
macro_rules! t_histogram {
    ($($tt:tt)*) => {
        NoopHistogram
    };
}

#[cfg(not(feature = "telemetry"))]
#[derive(Copy, Clone)]
struct NoopHistogram;

#[cfg(not(feature = "telemetry"))]
impl NoopHistogram {
    fn record(&self, _value: f64) {}
}

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("queue capacity must be non-zero")]
    ZeroCapacity,
    #[error("max payload size must be non-zero")]
    ZeroPayloadLimit,
}

const DEFAULT_SUB_QUEUE_POLICY: SubQueuePolicy = SubQueuePolicy::DropNew;

/// What publish does when a subscriber queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubQueuePolicy {
    // Wait for room; a slow subscriber slows its publishers.
    Block,
    // Drop the message for that subscriber only.
    DropNew,
}

#[derive(Debug, Clone)]
struct SubscriberEntry {
    id: usize,
    // Guards against slab key reuse after removal.
    token: u64,
    pattern: Arc<SubjectPattern>,
    sender: mpsc::Sender<Delivery>,
}

#[derive(Debug)]
struct Subscribers {
    // Snapshot used by the publish hot path: lock-free read.
    snapshot: ArcSwap<Vec<SubscriberEntry>>,
    // Mutated only on subscribe/unsubscribe.
    registry: Mutex<Slab<SubscriberEntry>>,
    next_token: AtomicU64,
}

impl Subscribers {
    fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Vec::new()),
            registry: Mutex::new(Slab::new()),
            next_token: AtomicU64::new(1),
        }
    }

    fn insert(&self, pattern: Arc<SubjectPattern>, sender: mpsc::Sender<Delivery>) -> (usize, u64) {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut registry = self.registry.lock();
        let slot = registry.vacant_entry();
        let id = slot.key();
        slot.insert(SubscriberEntry {
            id,
            token,
            pattern,
            sender,
        });
        self.rebuild_snapshot(&registry);
        (id, token)
    }

    fn remove(&self, keys: &[(usize, u64)]) {
        let mut registry = self.registry.lock();
        let mut removed = false;
        for (id, token) in keys {
            if registry.get(*id).is_some_and(|entry| entry.token == *token) {
                registry.remove(*id);
                removed = true;
            }
        }
        if removed {
            self.rebuild_snapshot(&registry);
        }
    }

    fn clear(&self) {
        let mut registry = self.registry.lock();
        registry.clear();
        self.rebuild_snapshot(&registry);
    }

    fn len(&self) -> usize {
        self.registry.lock().len()
    }

    #[inline]
    fn snapshot(&self) -> Arc<Vec<SubscriberEntry>> {
        self.snapshot.load_full()
    }

    fn rebuild_snapshot(&self, registry: &Slab<SubscriberEntry>) {
        let snapshot: Vec<SubscriberEntry> =
            registry.iter().map(|(_, entry)| entry.clone()).collect();
        self.snapshot.store(Arc::new(snapshot));
    }
}

/// In-process broker for nrpc traffic.
///
/// ```
/// use bytes::Bytes;
/// use nrpc_broker::Broker;
/// use nrpc_transport::{Delivery, Transport, handler_fn};
/// use tokio::sync::mpsc;
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let broker = Broker::new();
///     let (tx, mut rx) = mpsc::unbounded_channel();
///     let _sub = broker
///         .subscribe(
///             "app.orders.>",
///             handler_fn(move |delivery: Delivery| {
///                 let tx = tx.clone();
///                 async move {
///                     let _ = tx.send(delivery.payload);
///                 }
///             }),
///         )
///         .await
///         .expect("subscribe");
///     broker
///         .publish("app.orders.created", Bytes::from_static(b"hello"))
///         .await
///         .expect("publish");
///     assert_eq!(rx.recv().await.expect("recv"), Bytes::from_static(b"hello"));
/// });
/// ```
#[derive(Debug)]
pub struct Broker {
    subscribers: Arc<Subscribers>,
    // Per-subscriber queue depth.
    queue_capacity: usize,
    // Queue admission policy when a subscriber queue is full.
    queue_policy: SubQueuePolicy,
    max_payload_bytes: usize,
    closed: AtomicBool,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        let defaults = TransportConfig::default();
        Self {
            subscribers: Arc::new(Subscribers::new()),
            queue_capacity: defaults.queue_capacity,
            queue_policy: DEFAULT_SUB_QUEUE_POLICY,
            max_payload_bytes: defaults.max_payload_bytes,
            closed: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &TransportConfig) -> Result<Self> {
        Self::new()
            .with_queue_capacity(config.queue_capacity)?
            .with_max_payload_bytes(config.max_payload_bytes)
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(BrokerError::ZeroCapacity);
        }
        self.queue_capacity = capacity;
        Ok(self)
    }

    pub fn with_max_payload_bytes(mut self, max: usize) -> Result<Self> {
        if max == 0 {
            return Err(BrokerError::ZeroPayloadLimit);
        }
        self.max_payload_bytes = max;
        Ok(self)
    }

    pub fn with_queue_policy(mut self, policy: SubQueuePolicy) -> Self {
        self.queue_policy = policy;
        self
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reject further traffic and drop every subscriber. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.subscribers.clear();
        tracing::info!("broker closed");
    }

    // Returns how many subscribers accepted the delivery.
    async fn fanout(&self, delivery: Delivery) -> nrpc_transport::Result<usize> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        validate_subject(&delivery.subject)?;
        if delivery.payload.len() > self.max_payload_bytes {
            return Err(TransportError::PayloadTooLarge {
                len: delivery.payload.len(),
                max: self.max_payload_bytes,
            });
        }

        let start = std::time::Instant::now();
        let snapshot = self.subscribers.snapshot();
        let mut closed_subscribers = Vec::new();
        let mut delivered = 0usize;
        for subscriber in snapshot.iter() {
            if !subscriber.pattern.matches(&delivery.subject) {
                continue;
            }
            match self.queue_policy {
                SubQueuePolicy::Block => {
                    if subscriber.sender.send(delivery.clone()).await.is_ok() {
                        delivered += 1;
                    } else {
                        closed_subscribers.push((subscriber.id, subscriber.token));
                    }
                }
                SubQueuePolicy::DropNew => match subscriber.sender.try_reserve() {
                    Ok(permit) => {
                        permit.send(delivery.clone());
                        delivered += 1;
                    }
                    Err(mpsc::error::TrySendError::Full(())) => {
                        metrics::counter!("nrpc_broker_dropped_total").increment(1);
                        tracing::debug!(
                            subject = %delivery.subject,
                            pattern = subscriber.pattern.as_str(),
                            "subscriber queue full; dropping message"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(())) => {
                        closed_subscribers.push((subscriber.id, subscriber.token));
                    }
                },
            }
        }
        if !closed_subscribers.is_empty() {
            self.subscribers.remove(&closed_subscribers);
        }
        metrics::counter!("nrpc_broker_published_total").increment(1);
        t_histogram!("nrpc_broker_fanout_ns").record(start.elapsed().as_nanos() as f64);
        Ok(delivered)
    }
}

#[async_trait]
impl Transport for Broker {
    async fn publish(&self, subject: &str, payload: Bytes) -> nrpc_transport::Result<()> {
        self.fanout(Delivery {
            subject: subject.to_string(),
            reply_to: None,
            payload,
        })
        .await
        .map(|_| ())
    }

    async fn publish_request(
        &self,
        subject: &str,
        reply_to: &str,
        payload: Bytes,
    ) -> nrpc_transport::Result<()> {
        validate_subject(reply_to)?;
        self.fanout(Delivery {
            subject: subject.to_string(),
            reply_to: Some(reply_to.to_string()),
            payload,
        })
        .await
        .map(|_| ())
    }

    async fn subscribe(
        &self,
        pattern: &str,
        handler: MessageHandler,
    ) -> nrpc_transport::Result<Subscription> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let compiled = Arc::new(SubjectPattern::parse(pattern)?);
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let active = Arc::new(AtomicBool::new(true));
        let key = self.subscribers.insert(compiled, tx);
        tokio::spawn(run_dispatch_loop(rx, handler, Arc::clone(&active)));
        tracing::debug!(pattern, "subscribed");

        let subscribers = Arc::downgrade(&self.subscribers);
        Ok(Subscription::new(pattern, move || {
            active.store(false, Ordering::Release);
            if let Some(subscribers) = subscribers.upgrade() {
                subscribers.remove(&[key]);
            }
            Ok(())
        }))
    }

    fn is_ready(&self) -> bool {
        !self.is_closed()
    }
}

// Drains one subscriber queue, running each delivery on its own task.
async fn run_dispatch_loop(
    mut rx: mpsc::Receiver<Delivery>,
    handler: MessageHandler,
    active: Arc<AtomicBool>,
) {
    while let Some(delivery) = rx.recv().await {
        if !active.load(Ordering::Acquire) {
            break;
        }
        tokio::spawn(handler(delivery));
    }
}
