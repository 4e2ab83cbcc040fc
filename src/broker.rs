// ABOUTME: Pub/sub broker seam with a Redis-backed production implementation
// ABOUTME: Ships an in-memory broker for tests with a controllable health toggle

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

/// What the transport needs from a broker: pub/sub channels plus a small
/// key-value surface. Implementations must be safe to call concurrently.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    async fn ping(&self) -> Result<()>;
}

/// Redis-backed broker. Publish/get/set share one multiplexed connection;
/// each subscription holds its own pubsub connection.
pub struct RedisBroker {
    client: redis::Client,
    conn: Mutex<Option<redis::aio::MultiplexedConnection>>,
}

impl RedisBroker {
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("Invalid broker url: {}", url))?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to connect to broker")?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Drop the cached connection so the next call reconnects.
    async fn invalidate(&self) {
        *self.conn.lock().await = None;
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn connect(&self) -> Result<()> {
        self.connection().await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let result: redis::RedisResult<()> = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            self.invalidate().await;
            return Err(e).context("Broker publish failed");
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("Failed to open broker subscription")?;
        pubsub
            .subscribe(channel)
            .await
            .with_context(|| format!("Failed to subscribe to {}", channel))?;

        let (tx, rx) = mpsc::channel(256);
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(channel = %channel, error = %e, "Undecodable broker payload");
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
            tracing::warn!(channel = %channel, "Broker subscription stream ended");
        });
        Ok(rx)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        let result: redis::RedisResult<Option<String>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await;
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                self.invalidate().await;
                Err(e).context("Broker get failed")
            }
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        let result: redis::RedisResult<()> = cmd.query_async(&mut conn).await;
        if let Err(e) = result {
            self.invalidate().await;
            return Err(e).context("Broker set failed");
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let result: redis::RedisResult<String> =
            redis::cmd("PING").query_async(&mut conn).await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                self.invalidate().await;
                Err(e).context("Broker ping failed")
            }
        }
    }
}

#[derive(Default)]
struct MemoryState {
    subscribers: HashMap<String, Vec<mpsc::Sender<String>>>,
    kv: HashMap<String, (String, Option<Instant>)>,
}

/// In-process broker for tests. `set_healthy(false)` makes every
/// operation fail, simulating a broker outage.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<MemoryState>,
    healthy: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            healthy: AtomicBool::new(true),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            anyhow::bail!("broker unavailable")
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<()> {
        self.check()
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock().await;
        if let Some(senders) = state.subscribers.get_mut(channel) {
            senders.retain(|tx| tx.try_send(payload.to_string()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        self.check()?;
        let (tx, rx) = mpsc::channel(256);
        let mut state = self.state.lock().await;
        state
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        let mut state = self.state.lock().await;
        match state.kv.get(key) {
            Some((_, Some(expires))) if *expires <= Instant::now() => {
                state.kv.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.check()?;
        let expires = ttl.map(|t| Instant::now() + t);
        let mut state = self.state.lock().await;
        state.kv.insert(key.to_string(), (value.to_string(), expires));
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }
}
