// ABOUTME: Central relay wiring the store, transport, fan-out, and trigger together
// ABOUTME: Owns ingest, reply forwarding, catch-up, and the background loops

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use crate::agent::AgentInvoker;
use crate::broker::Broker;
use crate::config::Config;
use crate::fanout::{FanoutHub, PushEvent, SinkKind};
use crate::gateway::ImGateway;
use crate::message::{self, Message, MessageKind, MessageSource};
use crate::metrics;
use crate::store::{MessageStore, StoreStats};
use crate::transport::{ResilientTransport, TransportStatus};
use crate::trigger::BotTrigger;

/// A message as submitted by an ingress surface. Producers that carry
/// their own message id (the IM webhook does) supply it so retries
/// deduplicate; everything left `None` is filled in by the hub.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub id: Option<String>,
    pub sender: String,
    pub content: String,
    pub kind: MessageKind,
    pub source: MessageSource,
    pub timestamp: Option<i64>,
    pub at_targets: Option<Vec<String>>,
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HubStatus {
    pub transport: TransportStatus,
    pub online: Vec<String>,
    pub conversations: usize,
    pub messages_total: i64,
    pub messages_today: i64,
}

pub struct RelayHub {
    config: Config,
    store: MessageStore,
    transport: Arc<ResilientTransport>,
    fanout: FanoutHub,
    trigger: Arc<BotTrigger>,
    gateway: Option<ImGateway>,
    reply_rx: Mutex<Option<mpsc::Receiver<String>>>,
}

impl RelayHub {
    pub fn new(
        config: Config,
        broker: Arc<dyn Broker>,
        invoker: Arc<dyn AgentInvoker>,
    ) -> Result<Self> {
        let store = MessageStore::new(&config.store.dir)?;
        let transport = Arc::new(ResilientTransport::new(
            broker,
            config.broker.max_cache_size,
            config.broker.max_queue_size,
            Duration::from_secs(config.broker.health_check_secs),
        ));
        let fanout = FanoutHub::new(
            config.fanout.sink_buffer,
            Duration::from_secs(config.fanout.heartbeat_secs),
        );
        let (reply_tx, reply_rx) = mpsc::channel(64);
        let trigger = Arc::new(BotTrigger::new(
            config.trigger.clone(),
            invoker,
            reply_tx,
        )?);
        let gateway = config
            .gateway
            .as_ref()
            .map(ImGateway::new)
            .transpose()
            .context("Failed to build IM gateway")?;

        Ok(Self {
            config,
            store,
            transport,
            fanout,
            trigger,
            gateway,
            reply_rx: Mutex::new(Some(reply_rx)),
        })
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn fanout(&self) -> &FanoutHub {
        &self.fanout
    }

    pub fn transport(&self) -> &Arc<ResilientTransport> {
        &self.transport
    }

    /// Accept a message from an ingress surface. The message is stored,
    /// pushed to connected clients, and published to the broker. Returns
    /// the finished message and whether it was new (false means a
    /// duplicate id arrived and everything was skipped).
    pub async fn ingest(&self, incoming: IncomingMessage) -> Result<(Message, bool)> {
        // Caller-supplied mentions win; otherwise parse them from the text
        let at_targets = incoming.at_targets.filter(|t| !t.is_empty()).or_else(|| {
            let mentions = message::parse_at_mentions(&incoming.content);
            if mentions.is_empty() {
                None
            } else {
                Some(mentions)
            }
        });
        let msg = Message {
            id: incoming
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            kind: incoming.kind,
            sender: incoming.sender,
            content: incoming.content,
            timestamp: incoming.timestamp.unwrap_or_else(message::now_ms),
            source: incoming.source,
            at_targets,
            reply_to: incoming.reply_to,
            forwarded: None,
        };
        let stored = self.store.add_message(&msg)?;
        if !stored {
            metrics::messages_deduplicated();
            return Ok((msg, false));
        }
        metrics::messages_ingested();
        tracing::info!(message_id = %msg.id, sender = %msg.sender, source = %msg.source, "Message ingested");

        // Local clients see the message even if the broker is down
        self.fanout.broadcast(
            "message",
            serde_json::to_value(&msg).context("Failed to encode message")?,
            None,
        );
        self.transport
            .publish_message(&self.config.channels.messages, &msg)
            .await;
        Ok((msg, true))
    }

    /// Store and distribute a reply produced by the local agent.
    pub async fn post_reply(&self, content: String) -> Result<Message> {
        let msg = Message {
            id: uuid::Uuid::new_v4().to_string(),
            kind: MessageKind::Bot,
            sender: self.config.trigger.agent_name.clone(),
            content,
            timestamp: message::now_ms(),
            source: MessageSource::Agent,
            at_targets: None,
            reply_to: None,
            forwarded: None,
        };
        self.store.add_message(&msg)?;
        tracing::info!(message_id = %msg.id, "Agent reply posted");
        self.fanout.broadcast(
            "message",
            serde_json::to_value(&msg).context("Failed to encode reply")?,
            None,
        );
        self.transport
            .publish_message(&self.config.channels.replies, &msg)
            .await;
        Ok(msg)
    }

    /// Register a client sink and immediately push everything they
    /// missed since their last acknowledged sync position.
    pub fn attach_client(
        &self,
        participant: &str,
        kind: SinkKind,
        rooms: &[&str],
    ) -> Result<mpsc::Receiver<PushEvent>> {
        let backlog = self.store.get_unsynced_messages(participant)?;
        let rx = self.fanout.register(participant, kind, rooms);
        for msg in &backlog {
            self.fanout.push(
                participant,
                "message",
                serde_json::to_value(msg).context("Failed to encode backlog message")?,
            );
        }
        if !backlog.is_empty() {
            tracing::info!(participant = %participant, count = backlog.len(), "Backlog replayed");
        }
        Ok(rx)
    }

    pub fn detach_client(&self, participant: &str) {
        self.fanout.deregister(participant);
    }

    /// Advance a participant's sync position.
    pub fn acknowledge(&self, participant: &str, timestamp: i64) -> Result<()> {
        self.store.mark_synced(participant, timestamp)
    }

    pub async fn status(&self) -> Result<HubStatus> {
        let stats: StoreStats = self.store.get_stats()?;
        Ok(HubStatus {
            transport: self.transport.status().await,
            online: self.fanout.online_participants(),
            conversations: self.trigger.conversation_count().await,
            messages_total: stats.total,
            messages_today: stats.today,
        })
    }

    /// Connect the transport and start every background loop. Returns
    /// once the loops are spawned.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.transport.connect().await?;
        Arc::clone(&self.transport).spawn_health_check();
        self.fanout.spawn_heartbeat();
        Arc::clone(&self.trigger).run();

        Arc::clone(&self).spawn_message_loop().await;
        Arc::clone(&self).spawn_reply_loop().await;
        self.spawn_agent_reply_loop().await?;
        tracing::info!("Relay hub running");
        Ok(())
    }

    /// Broker messages channel: replays from other nodes and our own
    /// publishes. New ids get fanned out; everything feeds the trigger.
    async fn spawn_message_loop(self: Arc<Self>) {
        let mut rx = self
            .transport
            .subscribe(&self.config.channels.messages)
            .await;
        let hub = self;
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match hub.store.add_message(&msg) {
                    Ok(true) => {
                        tracing::debug!(message_id = %msg.id, "Message received from broker");
                        if let Ok(payload) = serde_json::to_value(&msg) {
                            hub.fanout.broadcast("message", payload, None);
                        }
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::error!(message_id = %msg.id, error = %e, "Failed to store broker message");
                        continue;
                    }
                }
                hub.trigger.observe(&msg).await;
            }
            tracing::warn!("Message subscription closed");
        });
    }

    /// Broker replies channel: store, fan out, and forward the local
    /// agent's replies to the IM group.
    async fn spawn_reply_loop(self: Arc<Self>) {
        let mut rx = self
            .transport
            .subscribe(&self.config.channels.replies)
            .await;
        let hub = self;
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = hub.handle_reply(&msg).await {
                    tracing::warn!(message_id = %msg.id, error = %e, "Failed to handle reply");
                }
            }
            tracing::warn!("Reply subscription closed");
        });
    }

    async fn handle_reply(&self, msg: &Message) -> Result<()> {
        let stored = self.store.add_message(msg)?;
        if stored {
            self.fanout.broadcast(
                "message",
                serde_json::to_value(msg).context("Failed to encode reply")?,
                None,
            );
        }
        if msg.is_forwarded() || msg.sender != self.config.trigger.agent_name {
            return Ok(());
        }

        if let Some(gateway) = &self.gateway {
            let at = msg.at_targets.clone().unwrap_or_default();
            match gateway.send_text(&msg.content, &msg.sender, &at).await {
                Ok(()) => {
                    metrics::replies_forwarded();
                    // Re-publish the forwarded copy so every node sees it
                    // without triggering on it again
                    let forwarded = Message {
                        id: uuid::Uuid::new_v4().to_string(),
                        source: MessageSource::Relay,
                        forwarded: Some(true),
                        ..msg.clone()
                    };
                    self.transport
                        .publish_message(&self.config.channels.messages, &forwarded)
                        .await;
                }
                Err(e) => {
                    tracing::warn!(message_id = %msg.id, error = %e, "IM forwarding failed");
                }
            }
        }
        Ok(())
    }

    /// Drains the trigger's reply channel into the reply pipeline.
    async fn spawn_agent_reply_loop(self: Arc<Self>) -> Result<()> {
        let mut rx = self
            .reply_rx
            .lock()
            .await
            .take()
            .context("Hub already running")?;
        let hub = self;
        tokio::spawn(async move {
            while let Some(content) = rx.recv().await {
                if let Err(e) = hub.post_reply(content).await {
                    tracing::error!(error = %e, "Failed to post agent reply");
                }
            }
        });
        Ok(())
    }
}
