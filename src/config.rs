// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Validates required fields and provides sensible defaults for optional ones
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub fanout: FanoutConfig,
    #[serde(default)]
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,
    #[serde(default)]
    pub lock: LockConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_dir")]
    pub dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_url")]
    pub url: String,
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: usize,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_health_check_secs")]
    pub health_check_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default = "default_messages_channel")]
    pub messages: String,
    #[serde(default = "default_replies_channel")]
    pub replies: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutConfig {
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_sink_buffer")]
    pub sink_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Display name of the reply agent this hub triggers for.
    #[serde(default = "default_agent_name")]
    pub agent_name: String,
    /// Senders treated as bot-originated regardless of message kind.
    #[serde(default)]
    pub bot_names: Vec<String>,
    #[serde(default = "default_human_cooldown_ms")]
    pub human_cooldown_ms: u64,
    #[serde(default = "default_bot_cooldown_ms")]
    pub bot_cooldown_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_idle_ttl_ms")]
    pub idle_ttl_ms: u64,
    #[serde(default = "default_human_reply_probability")]
    pub human_reply_probability: f64,
    #[serde(default = "default_bot_reply_probability")]
    pub bot_reply_probability: f64,
    #[serde(default = "default_dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,
    /// Whole-message patterns that close a topic (anchored regexes).
    #[serde(default = "default_closing_phrases")]
    pub closing_phrases: Vec<String>,
    /// Patterns that mark a message as asking for a reply.
    #[serde(default = "default_reply_signals")]
    pub reply_signals: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_binary")]
    pub binary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub webhook_base: String,
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_pid_file")]
    pub pid_file: String,
}

fn default_store_dir() -> String {
    "./data".to_string()
}

fn default_broker_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_max_cache_size() -> usize {
    1000
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_health_check_secs() -> u64 {
    30
}

fn default_messages_channel() -> String {
    "messages".to_string()
}

fn default_replies_channel() -> String {
    "replies".to_string()
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_sink_buffer() -> usize {
    64
}

fn default_agent_name() -> String {
    "bot".to_string()
}

fn default_human_cooldown_ms() -> u64 {
    3_000
}

fn default_bot_cooldown_ms() -> u64 {
    30_000
}

fn default_sweep_interval_ms() -> u64 {
    10_000
}

fn default_max_turns() -> u32 {
    5
}

fn default_idle_ttl_ms() -> u64 {
    5 * 60 * 1000
}

fn default_human_reply_probability() -> f64 {
    0.3
}

fn default_bot_reply_probability() -> f64 {
    0.1
}

fn default_dispatch_timeout_ms() -> u64 {
    15_000
}

fn default_closing_phrases() -> Vec<String> {
    [
        r"^(?i)ok[.!]*$",
        r"^(?i)okay[.!]*$",
        r"^(?i)got it[.!]*$",
        r"^(?i)thanks[.!]*$",
        r"^(?i)thank you[.!]*$",
        r"^(?i)understood[.!]*$",
        r"^(?i)roger[.!]*$",
        r"^(?i)good night[.!]*$",
        r"^(?i)bye[.!]*$",
        r"^(?i)goodbye[.!]*$",
        r"^(?i)see you[.!]*$",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_reply_signals() -> Vec<String> {
    [
        r"\?$",
        r"？$",
        r"(?i)\bhow\b",
        r"(?i)\bwhy\b",
        r"(?i)\bwhat\b",
        r"(?i)\bcould you\b",
        r"(?i)\bcan you\b",
        r"(?i)\bplease\b",
        r"(?i)\bhelp me\b",
        r"(?i)\bwhat do you think\b",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_agent_binary() -> String {
    "openclaw".to_string()
}

fn default_pid_file() -> String {
    "./chathub.pid".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: default_store_dir(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            max_cache_size: default_max_cache_size(),
            max_queue_size: default_max_queue_size(),
            health_check_secs: default_health_check_secs(),
        }
    }
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            messages: default_messages_channel(),
            replies: default_replies_channel(),
        }
    }
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            sink_buffer: default_sink_buffer(),
        }
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            agent_name: default_agent_name(),
            bot_names: Vec::new(),
            human_cooldown_ms: default_human_cooldown_ms(),
            bot_cooldown_ms: default_bot_cooldown_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            max_turns: default_max_turns(),
            idle_ttl_ms: default_idle_ttl_ms(),
            human_reply_probability: default_human_reply_probability(),
            bot_reply_probability: default_bot_reply_probability(),
            dispatch_timeout_ms: default_dispatch_timeout_ms(),
            closing_phrases: default_closing_phrases(),
            reply_signals: default_reply_signals(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: default_agent_binary(),
            gateway_url: None,
            gateway_token: None,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
        }
    }
}

impl Config {
    /// Load configuration from config.toml with environment variable overrides
    pub fn load() -> Result<Self> {
        Self::load_from("config.toml")
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str::<Config>(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            Config::default()
        };

        // Override with environment variables if present
        if let Ok(val) = std::env::var("CHATHUB_STORE_DIR") {
            config.store.dir = val;
        }
        if let Ok(val) = std::env::var("CHATHUB_BROKER_URL") {
            config.broker.url = val;
        }
        if let Ok(val) = std::env::var("CHATHUB_AGENT_NAME") {
            config.trigger.agent_name = val;
        }
        if let Ok(val) = std::env::var("CHATHUB_BOT_NAMES") {
            config.trigger.bot_names = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(val) = std::env::var("CHATHUB_AGENT_BINARY") {
            config.agent.binary = val;
        }
        if let Ok(val) = std::env::var("CHATHUB_GATEWAY_WEBHOOK") {
            let secret = std::env::var("CHATHUB_GATEWAY_SECRET").unwrap_or_default();
            config.gateway = Some(GatewayConfig {
                webhook_base: val,
                secret,
            });
        }
        if let Ok(val) = std::env::var("CHATHUB_PID_FILE") {
            config.lock.pid_file = val;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.trigger.agent_name.trim().is_empty() {
            anyhow::bail!("trigger.agent_name must not be empty");
        }
        if !(0.0..=1.0).contains(&self.trigger.human_reply_probability) {
            anyhow::bail!("trigger.human_reply_probability must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.trigger.bot_reply_probability) {
            anyhow::bail!("trigger.bot_reply_probability must be within [0, 1]");
        }
        if self.trigger.max_turns == 0 {
            anyhow::bail!("trigger.max_turns must be at least 1");
        }
        if self.broker.max_cache_size == 0 || self.broker.max_queue_size == 0 {
            anyhow::bail!("broker cache and queue sizes must be at least 1");
        }
        for pattern in self
            .trigger
            .closing_phrases
            .iter()
            .chain(self.trigger.reply_signals.iter())
        {
            regex::Regex::new(pattern)
                .with_context(|| format!("Invalid trigger pattern: {}", pattern))?;
        }
        if let Some(gateway) = &self.gateway {
            if gateway.webhook_base.trim().is_empty() {
                anyhow::bail!("gateway.webhook_base must not be empty");
            }
            if gateway.secret.trim().is_empty() {
                anyhow::bail!("gateway.secret must not be empty");
            }
        }
        Ok(())
    }
}
