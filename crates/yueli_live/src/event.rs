//! Wire envelopes and the validated events built from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use yueli_core::{analyze_sentiment, SemanticSignal};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LiveError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("envelope has no source")]
    MissingSource,
    #[error("unknown event type `{0}`")]
    UnknownType(String),
    #[error("invalid {kind} payload: {reason}")]
    Payload { kind: LiveEventKind, reason: String },
    #[error("line longer than {0} bytes")]
    LineTooLong(usize),
}

/// One line on the wire.
///
/// ```json
/// {"source":"bilibili:22637261","type":"danmaku","sequence":42,
///  "timestamp":"2026-03-01T12:00:00Z","payload":{"user":"阿白","content":"月璃晚上好？"}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveEnvelope {
    pub source: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub sequence: u64,
    /// When the source saw the event, if it says.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl LiveEnvelope {
    pub fn parse(line: &str) -> Result<Self, LiveError> {
        serde_json::from_str(line).map_err(|e| LiveError::Malformed(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveEventKind {
    Danmaku,
    Gift,
    SuperChat,
    Guard,
    Heartbeat,
}

impl LiveEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LiveEventKind::Danmaku => "danmaku",
            LiveEventKind::Gift => "gift",
            LiveEventKind::SuperChat => "super_chat",
            LiveEventKind::Guard => "guard",
            LiveEventKind::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for LiveEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LiveEventKind {
    type Err = LiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "danmaku" => Ok(LiveEventKind::Danmaku),
            "gift" => Ok(LiveEventKind::Gift),
            "super_chat" => Ok(LiveEventKind::SuperChat),
            "guard" => Ok(LiveEventKind::Guard),
            "heartbeat" => Ok(LiveEventKind::Heartbeat),
            other => Err(LiveError::UnknownType(other.to_string())),
        }
    }
}

fn one() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Danmaku {
    pub user: String,
    pub content: String,
    #[serde(default)]
    pub uid: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gift {
    pub user: String,
    pub gift_name: String,
    #[serde(default = "one")]
    pub num: u32,
    /// Total value in the platform's smallest unit.
    #[serde(default)]
    pub price: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperChat {
    pub user: String,
    pub content: String,
    #[serde(default)]
    pub price: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guard {
    pub user: String,
    #[serde(default)]
    pub gift_name: String,
    #[serde(default = "one")]
    pub num: u32,
    #[serde(default)]
    pub price: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum LivePayload {
    Danmaku(Danmaku),
    Gift(Gift),
    SuperChat(SuperChat),
    Guard(Guard),
    Heartbeat,
}

impl LivePayload {
    fn parse(kind: LiveEventKind, value: serde_json::Value) -> Result<Self, LiveError> {
        fn typed<T: serde::de::DeserializeOwned>(kind: LiveEventKind, value: serde_json::Value) -> Result<T, LiveError> {
            serde_json::from_value(value).map_err(|e| LiveError::Payload {
                kind,
                reason: e.to_string(),
            })
        }
        Ok(match kind {
            LiveEventKind::Danmaku => LivePayload::Danmaku(typed(kind, value)?),
            LiveEventKind::Gift => LivePayload::Gift(typed(kind, value)?),
            LiveEventKind::SuperChat => LivePayload::SuperChat(typed(kind, value)?),
            LiveEventKind::Guard => LivePayload::Guard(typed(kind, value)?),
            LiveEventKind::Heartbeat => LivePayload::Heartbeat,
        })
    }
}

/// Validated, normalized live event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveEvent {
    pub source: String,
    pub kind: LiveEventKind,
    pub payload: LivePayload,
    pub sequence: u64,
    pub arrived_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    /// Scheduling hint for consumers; higher is more urgent.
    pub priority: i32,
}

impl LiveEvent {
    /// Validate an envelope. Priority is left at 0 for the hub to fill in.
    pub fn from_envelope(envelope: LiveEnvelope) -> Result<Self, LiveError> {
        let source = envelope.source.trim();
        if source.is_empty() {
            return Err(LiveError::MissingSource);
        }
        let kind: LiveEventKind = envelope.kind.parse()?;
        let payload = LivePayload::parse(kind, envelope.payload)?;
        Ok(Self {
            source: source.to_string(),
            kind,
            payload,
            sequence: envelope.sequence,
            arrived_at: Utc::now(),
            sent_at: envelope.timestamp,
            priority: 0,
        })
    }

    pub fn user(&self) -> Option<&str> {
        match &self.payload {
            LivePayload::Danmaku(d) => Some(&d.user),
            LivePayload::Gift(g) => Some(&g.user),
            LivePayload::SuperChat(s) => Some(&s.user),
            LivePayload::Guard(g) => Some(&g.user),
            LivePayload::Heartbeat => None,
        }
    }

    /// Text for the dialogue core, in the room's language.
    pub fn content(&self) -> Option<String> {
        match &self.payload {
            LivePayload::Danmaku(d) => Some(d.content.clone()),
            LivePayload::SuperChat(s) => Some(s.content.clone()),
            LivePayload::Gift(g) => Some(format!("赠送了 {} x {}", g.gift_name, g.num)),
            LivePayload::Guard(g) => Some(format!("开通了 {}", g.gift_name)),
            LivePayload::Heartbeat => None,
        }
    }

    /// Semantic signal for the decision engine, if the event carries one.
    ///
    /// Chat only yields a signal when its sentiment is clear; paid events map
    /// to fixed intents.
    pub fn to_signal(&self) -> Option<SemanticSignal> {
        let mut signal = match &self.payload {
            LivePayload::Danmaku(d) => {
                let (tag, confidence) = analyze_sentiment(&d.content).intent()?;
                SemanticSignal::new(tag, confidence)
            }
            LivePayload::Gift(_) => SemanticSignal::new("thanks", 0.7),
            LivePayload::SuperChat(_) => SemanticSignal::new("excited", 0.9),
            LivePayload::Guard(_) => SemanticSignal::new("celebrate", 1.0),
            LivePayload::Heartbeat => return None,
        };
        signal.timestamp = self.arrived_at;
        Some(signal)
    }
}
