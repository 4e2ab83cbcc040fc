// ABOUTME: Core message types shared by the store, transport, fan-out, and trigger.
// ABOUTME: Defines the broker wire format (JSON, camelCase) and @-mention parsing.

use serde::{Deserialize, Serialize};

/// A single conversation message. This is both the stored shape and the
/// broker wire format (UTF-8 JSON on the `messages`/`replies` channels).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Globally unique id — the idempotency key for the store.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Display name of whoever sent the message.
    pub sender: String,
    pub content: String,
    /// Milliseconds since epoch, producer-assigned.
    pub timestamp: i64,
    pub source: MessageSource,
    /// Participants explicitly @-mentioned, in order of appearance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at_targets: Option<Vec<String>>,
    /// Id of the message this one replies to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Set when a reply is re-broadcast after being forwarded to the
    /// external group surface, so triggers don't react to it twice.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forwarded: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Human,
    Bot,
    Image,
}

/// Where a message entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSource {
    /// Inbound from the external IM webhook.
    Webhook,
    /// Submitted by the web client.
    Web,
    /// Produced by a reply agent.
    Agent,
    /// Re-broadcast by the relay-forwarding path.
    Relay,
}

impl std::fmt::Display for MessageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageSource::Webhook => "webhook",
            MessageSource::Web => "web",
            MessageSource::Agent => "agent",
            MessageSource::Relay => "relay",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for MessageSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "webhook" => Ok(MessageSource::Webhook),
            "web" => Ok(MessageSource::Web),
            "agent" => Ok(MessageSource::Agent),
            "relay" => Ok(MessageSource::Relay),
            _ => anyhow::bail!("Unknown message source: {}", s),
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageKind::Human => "human",
            MessageKind::Bot => "bot",
            MessageKind::Image => "image",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for MessageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "human" => Ok(MessageKind::Human),
            "bot" => Ok(MessageKind::Bot),
            "image" => Ok(MessageKind::Image),
            _ => anyhow::bail!("Unknown message kind: {}", s),
        }
    }
}

impl Message {
    pub fn is_bot(&self) -> bool {
        self.kind == MessageKind::Bot
    }

    pub fn is_forwarded(&self) -> bool {
        self.forwarded.unwrap_or(false)
    }
}

/// Current wall-clock time in milliseconds since epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Extract @-mentioned names from message text, preserving first-seen
/// order and dropping duplicates. A mention runs until whitespace,
/// punctuation that can't appear in a display name, or another '@'.
pub fn parse_at_mentions(content: &str) -> Vec<String> {
    static PATTERN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        regex::Regex::new(r"@([\w\-]+)").expect("mention pattern is valid")
    });

    let mut seen = std::collections::HashSet::new();
    let mut targets = Vec::new();
    for cap in re.captures_iter(content) {
        let name = cap[1].to_string();
        if seen.insert(name.clone()) {
            targets.push(name);
        }
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_camel_case() {
        let msg = Message {
            id: "m1".to_string(),
            kind: MessageKind::Human,
            sender: "alice".to_string(),
            content: "hi".to_string(),
            timestamp: 1000,
            source: MessageSource::Web,
            at_targets: Some(vec!["bot".to_string()]),
            reply_to: Some("m0".to_string()),
            forwarded: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"human\""));
        assert!(json.contains("\"atTargets\":[\"bot\"]"));
        assert!(json.contains("\"replyTo\":\"m0\""));
        assert!(json.contains("\"source\":\"web\""));
        assert!(!json.contains("forwarded"));
    }

    #[test]
    fn test_wire_format_round_trip() {
        let json = r#"{"id":"m2","type":"bot","sender":"lin","content":"done","timestamp":5,"source":"agent","forwarded":true}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.kind, MessageKind::Bot);
        assert_eq!(msg.source, MessageSource::Agent);
        assert!(msg.is_forwarded());
        assert!(msg.at_targets.is_none());
    }

    #[test]
    fn test_parse_mentions_order_and_dedup() {
        let targets = parse_at_mentions("@bob hey @alice, ping @bob again");
        assert_eq!(targets, vec!["bob", "alice"]);
    }

    #[test]
    fn test_parse_mentions_none() {
        assert!(parse_at_mentions("no mentions here").is_empty());
    }
}
