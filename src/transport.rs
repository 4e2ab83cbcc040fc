// ABOUTME: Resilient wrapper around the broker that degrades instead of failing
// ABOUTME: Queues publishes while degraded and replays them once health returns

use anyhow::Result;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

use crate::broker::Broker;
use crate::message::Message;
use crate::metrics;

/// Snapshot of transport health for status reporting.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TransportStatus {
    pub connected: bool,
    pub degraded: bool,
    pub queue_depth: usize,
    pub cache_size: usize,
}

struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

struct QueuedPublish {
    channel: String,
    payload: String,
}

struct TransportInner {
    cache: HashMap<String, CacheEntry>,
    // Insertion order for size-based eviction. Keys re-set while present
    // keep their original slot.
    cache_order: VecDeque<String>,
    offline_queue: VecDeque<QueuedPublish>,
}

/// A caller-facing channel subscription. `active` tracks whether a live
/// broker stream is currently feeding `tx`; the health check
/// re-establishes inactive ones.
struct Subscription {
    channel: String,
    tx: mpsc::Sender<Message>,
    active: Arc<AtomicBool>,
}

/// Broker client that never lets an outage propagate to callers. While
/// the broker is down the transport serves reads from a local cache,
/// buffers writes, queues publishes for replay, and keeps subscription
/// receivers alive until the stream can be re-established.
pub struct ResilientTransport {
    broker: Arc<dyn Broker>,
    connected: AtomicBool,
    degraded: Arc<AtomicBool>,
    inner: Mutex<TransportInner>,
    subscriptions: Mutex<Vec<Subscription>>,
    max_cache_size: usize,
    max_queue_size: usize,
    health_interval: Duration,
}

impl ResilientTransport {
    pub fn new(
        broker: Arc<dyn Broker>,
        max_cache_size: usize,
        max_queue_size: usize,
        health_interval: Duration,
    ) -> Self {
        Self {
            broker,
            connected: AtomicBool::new(false),
            degraded: Arc::new(AtomicBool::new(false)),
            inner: Mutex::new(TransportInner {
                cache: HashMap::new(),
                cache_order: VecDeque::new(),
                offline_queue: VecDeque::new(),
            }),
            subscriptions: Mutex::new(Vec::new()),
            max_cache_size,
            max_queue_size,
            health_interval,
        }
    }

    /// Initial connect. Failure here degrades rather than aborting; the
    /// health loop will keep trying.
    pub async fn connect(&self) -> Result<()> {
        match self.broker.connect().await {
            Ok(()) => {
                self.connected.store(true, Ordering::SeqCst);
                self.degraded.store(false, Ordering::SeqCst);
                tracing::info!("Transport connected");
            }
            Err(e) => {
                self.connected.store(true, Ordering::SeqCst);
                self.degraded.store(true, Ordering::SeqCst);
                tracing::warn!(error = %e, "Broker unreachable at startup, entering degraded mode");
            }
        }
        Ok(())
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Publish a payload. Returns true only if it was delivered to the
    /// broker now; false means it was queued (or dropped) for later.
    pub async fn publish(&self, channel: &str, payload: &str) -> bool {
        if self.is_degraded() {
            // Recovery flushes the backlog while holding the queue lock,
            // so re-check once we have it: a publish that was waiting out
            // a flush must go to the broker, not into the drained queue
            let mut inner = self.inner.lock().await;
            if self.is_degraded() {
                self.push_queued(&mut inner, channel, payload);
                return false;
            }
        }
        match self.broker.publish(channel, payload).await {
            Ok(()) => {
                metrics::publish_ok();
                true
            }
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "Publish failed, entering degraded mode");
                self.degraded.store(true, Ordering::SeqCst);
                self.enqueue(channel, payload).await;
                false
            }
        }
    }

    /// Publish a message as JSON on `channel`.
    pub async fn publish_message(&self, channel: &str, msg: &Message) -> bool {
        match serde_json::to_string(msg) {
            Ok(json) => self.publish(channel, &json).await,
            Err(e) => {
                tracing::error!(message_id = %msg.id, error = %e, "Failed to encode message");
                false
            }
        }
    }

    async fn enqueue(&self, channel: &str, payload: &str) {
        let mut inner = self.inner.lock().await;
        self.push_queued(&mut inner, channel, payload);
    }

    fn push_queued(&self, inner: &mut TransportInner, channel: &str, payload: &str) {
        if inner.offline_queue.len() >= self.max_queue_size {
            inner.offline_queue.pop_front();
            metrics::queue_dropped();
            tracing::warn!(channel = %channel, "Offline queue full, dropping oldest publish");
        }
        inner.offline_queue.push_back(QueuedPublish {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        metrics::queue_depth(inner.offline_queue.len());
    }

    /// Read a key. Degraded mode serves only the local cache; healthy
    /// reads refresh the cache on the way through.
    pub async fn get(&self, key: &str) -> Option<String> {
        if self.is_degraded() {
            return self.cache_get(key).await;
        }
        match self.broker.get(key).await {
            Ok(Some(value)) => {
                self.cache_put(key, &value, None).await;
                Some(value)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Broker get failed, entering degraded mode");
                self.degraded.store(true, Ordering::SeqCst);
                self.cache_get(key).await
            }
        }
    }

    /// Write a key. Always lands in the local cache; degraded writes
    /// report success so callers don't stall on an outage.
    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> bool {
        self.cache_put(key, value, ttl).await;
        if self.is_degraded() {
            return true;
        }
        match self.broker.set(key, value, ttl).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Broker set failed, entering degraded mode");
                self.degraded.store(true, Ordering::SeqCst);
                true
            }
        }
    }

    async fn cache_get(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock().await;
        let expired = match inner.cache.get(key) {
            Some(entry) => match entry.expires_at {
                Some(expires) => expires <= Instant::now(),
                None => false,
            },
            None => return None,
        };
        if expired {
            inner.cache.remove(key);
            inner.cache_order.retain(|k| k != key);
            return None;
        }
        inner.cache.get(key).map(|e| e.value.clone())
    }

    async fn cache_put(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let mut inner = self.inner.lock().await;
        if !inner.cache.contains_key(key) {
            if inner.cache.len() >= self.max_cache_size {
                if let Some(oldest) = inner.cache_order.pop_front() {
                    inner.cache.remove(&oldest);
                }
            }
            inner.cache_order.push_back(key.to_string());
        }
        inner.cache.insert(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
    }

    /// Subscribe to a channel of JSON-encoded messages. The receiver is
    /// returned immediately; if the broker is unreachable the transport
    /// degrades and the health check establishes the stream once the
    /// broker is back. Payloads that fail to decode are logged and
    /// skipped.
    pub async fn subscribe(&self, channel: &str) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(256);
        let sub = Subscription {
            channel: channel.to_string(),
            tx,
            active: Arc::new(AtomicBool::new(false)),
        };
        if let Err(e) = self.establish(&sub).await {
            tracing::warn!(channel = %channel, error = %e, "Subscription deferred, entering degraded mode");
            self.degraded.store(true, Ordering::SeqCst);
        }
        self.subscriptions.lock().await.push(sub);
        rx
    }

    /// Open the broker stream for one subscription and pump it into the
    /// caller's receiver. The pump marks the subscription inactive (and
    /// the transport degraded) when the stream dies.
    async fn establish(&self, sub: &Subscription) -> Result<()> {
        let mut raw = self.broker.subscribe(&sub.channel).await?;
        sub.active.store(true, Ordering::SeqCst);
        let tx = sub.tx.clone();
        let active = Arc::clone(&sub.active);
        let degraded = Arc::clone(&self.degraded);
        let channel = sub.channel.clone();
        tokio::spawn(async move {
            while let Some(payload) = raw.recv().await {
                match serde_json::from_str::<Message>(&payload) {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            active.store(false, Ordering::SeqCst);
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(channel = %channel, error = %e, "Skipping undecodable message");
                    }
                }
            }
            active.store(false, Ordering::SeqCst);
            degraded.store(true, Ordering::SeqCst);
            tracing::warn!(channel = %channel, "Subscription stream died, entering degraded mode");
        });
        Ok(())
    }

    /// Re-open any subscription whose broker stream has died, dropping
    /// ones whose receiver is gone.
    async fn resubscribe(&self) {
        let mut subs = self.subscriptions.lock().await;
        subs.retain(|s| !s.tx.is_closed());
        for sub in subs.iter() {
            if sub.active.load(Ordering::SeqCst) {
                continue;
            }
            match self.establish(sub).await {
                Ok(()) => {
                    tracing::info!(channel = %sub.channel, "Subscription re-established");
                }
                Err(e) => {
                    tracing::warn!(channel = %sub.channel, error = %e, "Resubscribe failed, staying degraded");
                    self.degraded.store(true, Ordering::SeqCst);
                    return;
                }
            }
        }
    }

    /// One health probe. On recovery, replays the offline queue in FIFO
    /// order before new publishes are allowed through, then restores any
    /// dead subscription streams.
    pub async fn check_health(&self) {
        match self.broker.ping().await {
            Ok(()) => {
                if self.is_degraded() {
                    self.recover().await;
                }
                self.resubscribe().await;
            }
            Err(e) => {
                if !self.is_degraded() {
                    tracing::warn!(error = %e, "Health check failed, entering degraded mode");
                    self.degraded.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    async fn recover(&self) {
        // Hold the queue lock across the whole flush so publishes issued
        // during recovery can't jump ahead of the backlog.
        let mut inner = self.inner.lock().await;
        let total = inner.offline_queue.len();
        let mut flushed = 0usize;
        while let Some(queued) = inner.offline_queue.pop_front() {
            if let Err(e) = self
                .broker
                .publish(&queued.channel, &queued.payload)
                .await
            {
                tracing::warn!(error = %e, flushed, total, "Recovery flush interrupted, staying degraded");
                inner.offline_queue.push_front(queued);
                metrics::queue_depth(inner.offline_queue.len());
                return;
            }
            flushed += 1;
        }
        self.degraded.store(false, Ordering::SeqCst);
        metrics::queue_depth(0);
        tracing::info!(flushed, "Broker recovered, offline queue flushed");
    }

    /// Background health check loop.
    pub fn spawn_health_check(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let transport = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(transport.health_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                transport.check_health().await;
            }
        })
    }

    pub async fn status(&self) -> TransportStatus {
        let inner = self.inner.lock().await;
        TransportStatus {
            connected: self.connected.load(Ordering::SeqCst),
            degraded: self.is_degraded(),
            queue_depth: inner.offline_queue.len(),
            cache_size: inner.cache.len(),
        }
    }
}
