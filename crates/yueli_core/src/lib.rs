//! Shared vocabulary of the YueLi core: sessions, signals, intents, dispatch
//! results, the action catalog, configuration and operator counters.

pub mod affect;
pub mod catalog;
pub mod config;
pub mod counters;
pub mod error;
pub mod intent;
pub mod sentiment;

pub use affect::{DimensionSpec, EmotionDelta, EmotionState};
pub use catalog::{
    shared_catalog, ActionCatalog, ActionDefinition, ActionKind, CatalogRules, SharedCatalog,
    TriggerBinding,
};
pub use config::YueliConfig;
pub use counters::{CounterSnapshot, PipelineCounters};
pub use error::YueliError;
pub use intent::{
    ActionIntent, Decision, DispatchResult, DispatchStatus, NoOp, NoOpReason, SemanticSignal,
};
pub use sentiment::{analyze_sentiment, Sentiment};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one conversation stream (a chat room, a private chat, the terminal).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}
