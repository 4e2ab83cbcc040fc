// ABOUTME: Bot trigger state machine deciding when the reply agent speaks
// ABOUTME: Tracks per-sender conversations, cooldowns, turn limits, and topic closes

use anyhow::{Context, Result};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

use crate::agent::AgentInvoker;
use crate::config::TriggerConfig;
use crate::message::Message;
use crate::metrics;

const RECENT_REPLY_WINDOW: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Pending,
    Processing,
}

struct ConversationState {
    phase: Phase,
    pending: Vec<Message>,
    turns: u32,
    is_bot_origin: bool,
    topic_closed: bool,
    last_activity: Instant,
    last_reply: Option<Instant>,
}

impl ConversationState {
    fn new(now: Instant) -> Self {
        Self {
            phase: Phase::Idle,
            pending: Vec::new(),
            turns: 0,
            is_bot_origin: false,
            topic_closed: false,
            last_activity: now,
            last_reply: None,
        }
    }
}

/// Watches the message flow and decides when to hand a conversation to
/// the reply agent. Conversations are keyed by sender; replies come out
/// on the channel passed to `new`, at most one in flight per sender.
pub struct BotTrigger {
    config: TriggerConfig,
    closing_phrases: Vec<regex::Regex>,
    reply_signals: Vec<regex::Regex>,
    invoker: Arc<dyn AgentInvoker>,
    reply_tx: mpsc::Sender<String>,
    conversations: Mutex<HashMap<String, ConversationState>>,
    recent_replies: Mutex<VecDeque<String>>,
}

impl BotTrigger {
    pub fn new(
        config: TriggerConfig,
        invoker: Arc<dyn AgentInvoker>,
        reply_tx: mpsc::Sender<String>,
    ) -> Result<Self> {
        let closing_phrases = compile_patterns(&config.closing_phrases)
            .context("Invalid closing phrase pattern")?;
        let reply_signals =
            compile_patterns(&config.reply_signals).context("Invalid reply signal pattern")?;
        Ok(Self {
            config,
            closing_phrases,
            reply_signals,
            invoker,
            reply_tx,
            conversations: Mutex::new(HashMap::new()),
            recent_replies: Mutex::new(VecDeque::new()),
        })
    }

    /// Feed one observed message through the trigger policy.
    pub async fn observe(&self, msg: &Message) {
        // The agent's own output and forwarded re-broadcasts never trigger
        if msg.sender == self.config.agent_name || msg.is_forwarded() {
            return;
        }

        let mentioned = self.is_mentioned(msg);
        let is_bot = msg.is_bot() || self.config.bot_names.iter().any(|n| n == &msg.sender);
        let now = Instant::now();

        let mut conversations = self.conversations.lock().await;
        let state = conversations
            .entry(msg.sender.clone())
            .or_insert_with(|| ConversationState::new(now));
        state.last_activity = now;

        // A closing phrase ends the topic unless the agent is being
        // addressed directly in the same breath
        if !mentioned && self.is_closing(&msg.content) {
            tracing::debug!(sender = %msg.sender, "Topic closed");
            state.topic_closed = true;
            state.pending.clear();
            if state.phase == Phase::Pending {
                state.phase = Phase::Idle;
            }
            return;
        }

        if mentioned {
            // Mention reopens a closed topic and overrides the turn limit
            state.topic_closed = false;
            state.turns = 0;
        } else {
            if state.topic_closed {
                return;
            }
            if state.turns >= self.config.max_turns {
                tracing::debug!(sender = %msg.sender, turns = state.turns, "Turn limit reached");
                return;
            }
            let has_signal = self.has_reply_signal(&msg.content);
            let qualifies = if is_bot {
                // Bot chatter only qualifies when it asks for something,
                // and even then mostly gets ignored
                has_signal && self.sample(self.config.bot_reply_probability)
            } else if has_signal {
                true
            } else {
                self.sample(self.config.human_reply_probability)
            };
            if !qualifies {
                return;
            }
        }

        state.is_bot_origin = is_bot;
        state.pending.push(msg.clone());
        if state.phase == Phase::Idle {
            state.phase = Phase::Pending;
        }
        tracing::debug!(sender = %msg.sender, pending = state.pending.len(), "Message queued for reply");
    }

    /// One pass over all conversations: evict idle ones, dispatch those
    /// whose cooldown has elapsed. Called by the sweep loop and directly
    /// from tests.
    pub async fn sweep(&self) {
        let idle_ttl = Duration::from_millis(self.config.idle_ttl_ms);
        let now = Instant::now();

        let due: Vec<(String, Vec<Message>)> = {
            let mut conversations = self.conversations.lock().await;
            conversations.retain(|sender, state| {
                let keep = state.phase == Phase::Processing
                    || now.duration_since(state.last_activity) < idle_ttl;
                if !keep {
                    tracing::debug!(sender = %sender, "Evicting idle conversation");
                }
                keep
            });
            metrics::conversations_active(conversations.len());

            let mut due = Vec::new();
            for (sender, state) in conversations.iter_mut() {
                if state.phase != Phase::Pending || state.pending.is_empty() {
                    continue;
                }
                let cooldown = Duration::from_millis(if state.is_bot_origin {
                    self.config.bot_cooldown_ms
                } else {
                    self.config.human_cooldown_ms
                });
                let since_reply = state
                    .last_reply
                    .map(|t| now.duration_since(t))
                    .unwrap_or(cooldown);
                if since_reply < cooldown {
                    continue;
                }
                state.phase = Phase::Processing;
                due.push((sender.clone(), std::mem::take(&mut state.pending)));
            }
            due
        };

        for (sender, pending) in due {
            self.dispatch(&sender, pending).await;
        }
    }

    /// Invoke the agent for one conversation. Exactly one attempt: a
    /// timeout or error abandons this batch rather than retrying it.
    async fn dispatch(&self, sender: &str, pending: Vec<Message>) {
        let transcript = render_transcript(&pending);
        let timeout = Duration::from_millis(self.config.dispatch_timeout_ms);
        tracing::info!(sender = %sender, batch = pending.len(), "Dispatching to reply agent");
        metrics::trigger_dispatched();

        let outcome = tokio::time::timeout(timeout, self.invoker.invoke(&transcript)).await;

        let reply = match outcome {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                tracing::warn!(sender = %sender, error = %e, "Agent invocation failed");
                None
            }
            Err(_) => {
                tracing::warn!(sender = %sender, timeout_ms = self.config.dispatch_timeout_ms, "Agent invocation timed out");
                metrics::trigger_timeout();
                None
            }
        };

        let reply = match reply {
            Some(r) if self.is_repetition(&r).await => {
                tracing::debug!(sender = %sender, "Suppressing repeated reply");
                None
            }
            other => other,
        };

        {
            let mut conversations = self.conversations.lock().await;
            if let Some(state) = conversations.get_mut(sender) {
                // A dispatch consumes a turn and starts the cooldown even
                // when it failed or produced nothing
                state.turns += 1;
                state.last_reply = Some(Instant::now());
                state.phase = if state.pending.is_empty() {
                    Phase::Idle
                } else {
                    Phase::Pending
                };
            }
        }

        if let Some(reply) = reply {
            self.remember_reply(&reply).await;
            if self.reply_tx.send(reply).await.is_err() {
                tracing::warn!("Reply channel closed, dropping agent reply");
            }
        }
    }

    /// Background sweep loop.
    pub fn run(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let trigger = self;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(trigger.config.sweep_interval_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                trigger.sweep().await;
            }
        })
    }

    fn is_mentioned(&self, msg: &Message) -> bool {
        if let Some(targets) = &msg.at_targets {
            if targets.iter().any(|t| t == &self.config.agent_name) {
                return true;
            }
        }
        msg.content.contains(&format!("@{}", self.config.agent_name))
    }

    fn is_closing(&self, content: &str) -> bool {
        let trimmed = content.trim();
        self.closing_phrases.iter().any(|re| re.is_match(trimmed))
    }

    fn has_reply_signal(&self, content: &str) -> bool {
        self.reply_signals.iter().any(|re| re.is_match(content))
    }

    fn sample(&self, probability: f64) -> bool {
        if probability >= 1.0 {
            return true;
        }
        if probability <= 0.0 {
            return false;
        }
        rand::thread_rng().gen::<f64>() < probability
    }

    async fn is_repetition(&self, reply: &str) -> bool {
        self.recent_replies
            .lock()
            .await
            .iter()
            .any(|r| r == reply)
    }

    async fn remember_reply(&self, reply: &str) {
        let mut recent = self.recent_replies.lock().await;
        if recent.len() >= RECENT_REPLY_WINDOW {
            recent.pop_front();
        }
        recent.push_back(reply.to_string());
    }

    pub async fn conversation_count(&self) -> usize {
        self.conversations.lock().await.len()
    }

    #[cfg(test)]
    async fn pending_count(&self, sender: &str) -> usize {
        self.conversations
            .lock()
            .await
            .get(sender)
            .map(|s| s.pending.len())
            .unwrap_or(0)
    }
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<regex::Regex>> {
    patterns
        .iter()
        .map(|p| regex::Regex::new(p).with_context(|| format!("Bad pattern: {}", p)))
        .collect()
}

fn render_transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.sender, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockInvoker;
    use crate::message::{MessageKind, MessageSource};

    fn msg(sender: &str, content: &str) -> Message {
        let mentions = crate::message::parse_at_mentions(content);
        Message {
            id: uuid::Uuid::new_v4().to_string(),
            kind: MessageKind::Human,
            sender: sender.to_string(),
            content: content.to_string(),
            timestamp: crate::message::now_ms(),
            source: MessageSource::Web,
            at_targets: if mentions.is_empty() { None } else { Some(mentions) },
            reply_to: None,
            forwarded: None,
        }
    }

    fn bot_msg(sender: &str, content: &str) -> Message {
        let mut m = msg(sender, content);
        m.kind = MessageKind::Bot;
        m
    }

    fn config() -> TriggerConfig {
        TriggerConfig {
            agent_name: "lin".to_string(),
            human_cooldown_ms: 0,
            bot_cooldown_ms: 0,
            human_reply_probability: 0.0, // deterministic: only signals/mentions
            bot_reply_probability: 0.0,
            dispatch_timeout_ms: 1_000,
            ..TriggerConfig::default()
        }
    }

    fn trigger_with(
        config: TriggerConfig,
        invoker: Arc<MockInvoker>,
    ) -> (Arc<BotTrigger>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(16);
        let trigger = BotTrigger::new(config, invoker, tx).unwrap();
        (Arc::new(trigger), rx)
    }

    #[tokio::test]
    async fn test_mention_triggers_reply() {
        let invoker = Arc::new(MockInvoker::new());
        invoker.push_reply(Some("hello alice"));
        let (trigger, mut rx) = trigger_with(config(), Arc::clone(&invoker));

        trigger.observe(&msg("alice", "@lin are you there")).await;
        trigger.sweep().await;

        assert_eq!(rx.recv().await.unwrap(), "hello alice");
        assert_eq!(invoker.call_count(), 1);
        assert!(invoker.calls()[0].contains("alice: @lin are you there"));
    }

    #[tokio::test]
    async fn test_question_triggers_without_mention() {
        let invoker = Arc::new(MockInvoker::new());
        let (trigger, mut rx) = trigger_with(config(), invoker);

        trigger.observe(&msg("alice", "how do I restart the service?")).await;
        trigger.sweep().await;
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_plain_statement_ignored_at_zero_probability() {
        let invoker = Arc::new(MockInvoker::new());
        let (trigger, _rx) = trigger_with(config(), Arc::clone(&invoker));

        trigger.observe(&msg("alice", "just deployed the fix")).await;
        trigger.sweep().await;
        assert_eq!(invoker.call_count(), 0);
    }

    #[tokio::test]
    async fn test_plain_statement_sampled_at_full_probability() {
        let invoker = Arc::new(MockInvoker::new());
        let mut cfg = config();
        cfg.human_reply_probability = 1.0;
        let (trigger, mut rx) = trigger_with(cfg, invoker);

        trigger.observe(&msg("alice", "just deployed the fix")).await;
        trigger.sweep().await;
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_own_and_forwarded_messages_ignored() {
        let invoker = Arc::new(MockInvoker::new());
        let (trigger, _rx) = trigger_with(config(), Arc::clone(&invoker));

        trigger.observe(&msg("lin", "I am the agent, @lin?")).await;
        let mut fwd = msg("alice", "@lin hello?");
        fwd.forwarded = Some(true);
        trigger.observe(&fwd).await;
        trigger.sweep().await;
        assert_eq!(invoker.call_count(), 0);
        assert_eq!(trigger.conversation_count().await, 0);
    }

    #[tokio::test]
    async fn test_bot_question_needs_probability() {
        let invoker = Arc::new(MockInvoker::new());
        let (trigger, _rx) = trigger_with(config(), Arc::clone(&invoker));
        trigger.observe(&bot_msg("otherbot", "what is the status?")).await;
        trigger.sweep().await;
        assert_eq!(invoker.call_count(), 0);

        let invoker2 = Arc::new(MockInvoker::new());
        let mut cfg = config();
        cfg.bot_reply_probability = 1.0;
        let (trigger2, mut rx2) = trigger_with(cfg, Arc::clone(&invoker2));
        trigger2.observe(&bot_msg("otherbot", "what is the status?")).await;
        trigger2.sweep().await;
        assert!(rx2.recv().await.is_some());

        // Bot statement without a signal never qualifies, even at p=1
        let invoker3 = Arc::new(MockInvoker::new());
        let mut cfg3 = config();
        cfg3.bot_reply_probability = 1.0;
        let (trigger3, _rx3) = trigger_with(cfg3, Arc::clone(&invoker3));
        trigger3.observe(&bot_msg("otherbot", "status is green")).await;
        trigger3.sweep().await;
        assert_eq!(invoker3.call_count(), 0);
    }

    #[tokio::test]
    async fn test_bot_names_list_marks_bot_origin() {
        let invoker = Arc::new(MockInvoker::new());
        let mut cfg = config();
        cfg.bot_names = vec!["deploybot".to_string()];
        let (trigger, _rx) = trigger_with(cfg, Arc::clone(&invoker));

        // Human-kind message from a configured bot name gets bot policy
        trigger.observe(&msg("deploybot", "how is the rollout going?")).await;
        trigger.sweep().await;
        assert_eq!(invoker.call_count(), 0);
    }

    #[tokio::test]
    async fn test_closing_phrase_closes_topic() {
        let invoker = Arc::new(MockInvoker::new());
        let (trigger, _rx) = trigger_with(config(), Arc::clone(&invoker));

        trigger.observe(&msg("alice", "thanks")).await;
        trigger.observe(&msg("alice", "can you check the logs?")).await;
        trigger.sweep().await;
        assert_eq!(invoker.call_count(), 0);
    }

    #[tokio::test]
    async fn test_mention_reopens_closed_topic() {
        let invoker = Arc::new(MockInvoker::new());
        let (trigger, mut rx) = trigger_with(config(), invoker);

        trigger.observe(&msg("alice", "ok")).await;
        trigger.observe(&msg("alice", "@lin one more thing")).await;
        trigger.sweep().await;
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_turn_limit_blocks_then_mention_overrides() {
        let invoker = Arc::new(MockInvoker::new());
        let mut cfg = config();
        cfg.max_turns = 2;
        let (trigger, mut rx) = trigger_with(cfg, Arc::clone(&invoker));

        for i in 0..2 {
            invoker.push_reply(Some(&format!("reply {}", i)));
            trigger.observe(&msg("alice", &format!("question {}?", i))).await;
            trigger.sweep().await;
            assert!(rx.recv().await.is_some());
        }

        // Limit reached: plain questions no longer qualify
        trigger.observe(&msg("alice", "question 3?")).await;
        trigger.sweep().await;
        assert_eq!(invoker.call_count(), 2);

        // Direct mention resets the turn counter
        invoker.push_reply(Some("back again"));
        trigger.observe(&msg("alice", "@lin please answer")).await;
        trigger.sweep().await;
        assert_eq!(rx.recv().await.unwrap(), "back again");
    }

    #[tokio::test]
    async fn test_cooldown_defers_dispatch() {
        let invoker = Arc::new(MockInvoker::new());
        let mut cfg = config();
        cfg.human_cooldown_ms = 60_000;
        let (trigger, mut rx) = trigger_with(cfg, Arc::clone(&invoker));

        invoker.push_reply(Some("first"));
        trigger.observe(&msg("alice", "first question?")).await;
        trigger.sweep().await;
        assert_eq!(rx.recv().await.unwrap(), "first");

        // Within cooldown the next batch stays pending
        trigger.observe(&msg("alice", "second question?")).await;
        trigger.sweep().await;
        assert_eq!(invoker.call_count(), 1);
        assert_eq!(trigger.pending_count("alice").await, 1);
    }

    #[tokio::test]
    async fn test_batch_accumulates_between_sweeps() {
        let invoker = Arc::new(MockInvoker::new());
        let (trigger, mut rx) = trigger_with(config(), Arc::clone(&invoker));

        trigger.observe(&msg("alice", "can you look at this?")).await;
        trigger.observe(&msg("alice", "why is it failing?")).await;
        trigger.sweep().await;
        assert!(rx.recv().await.is_some());
        assert_eq!(invoker.call_count(), 1);
        let transcript = &invoker.calls()[0];
        assert!(transcript.contains("can you look at this?"));
        assert!(transcript.contains("why is it failing?"));
    }

    #[tokio::test]
    async fn test_dispatch_timeout_abandons_batch() {
        let invoker = Arc::new(MockInvoker::with_delay(Duration::from_millis(200)));
        let mut cfg = config();
        cfg.dispatch_timeout_ms = 20;
        let (trigger, mut rx) = trigger_with(cfg, Arc::clone(&invoker));

        trigger.observe(&msg("alice", "slow question?")).await;
        trigger.sweep().await;
        // One attempt, no reply, no retry on the next sweep
        trigger.sweep().await;
        assert_eq!(invoker.call_count(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_repetition_suppressed() {
        let invoker = Arc::new(MockInvoker::new());
        invoker.push_reply(Some("same answer"));
        invoker.push_reply(Some("same answer"));
        let (trigger, mut rx) = trigger_with(config(), Arc::clone(&invoker));

        trigger.observe(&msg("alice", "first question?")).await;
        trigger.sweep().await;
        assert_eq!(rx.recv().await.unwrap(), "same answer");

        trigger.observe(&msg("alice", "second question?")).await;
        trigger.sweep().await;
        assert_eq!(invoker.call_count(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_idle_conversations_evicted() {
        let invoker = Arc::new(MockInvoker::new());
        let mut cfg = config();
        cfg.idle_ttl_ms = 0;
        let (trigger, _rx) = trigger_with(cfg, invoker);

        trigger.observe(&msg("alice", "hello there")).await;
        assert_eq!(trigger.conversation_count().await, 1);
        tokio::time::sleep(Duration::from_millis(5)).await;
        trigger.sweep().await;
        assert_eq!(trigger.conversation_count().await, 0);
    }

    #[tokio::test]
    async fn test_conversations_keyed_by_sender() {
        let invoker = Arc::new(MockInvoker::new());
        invoker.push_reply(Some("for alice"));
        invoker.push_reply(Some("for bob"));
        let (trigger, mut rx) = trigger_with(config(), Arc::clone(&invoker));

        trigger.observe(&msg("alice", "alice question?")).await;
        trigger.observe(&msg("bob", "bob question?")).await;
        trigger.sweep().await;

        let mut replies = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        replies.sort();
        assert_eq!(replies, vec!["for alice", "for bob"]);
        assert_eq!(invoker.call_count(), 2);
    }
}
