//! Messages passed between the decision engine and the dispatcher.

use crate::error::YueliError;
use crate::SessionId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// What the dialogue core (or the live hub) believes the current turn is about.
#[derive(Debug, Clone, PartialEq)]
pub struct SemanticSignal {
    /// Free-form intent tag, matched against action ids, labels and aliases.
    pub intent: String,
    /// Confidence in `[0.0, 1.0]`.
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
}

impl SemanticSignal {
    pub fn new(intent: impl Into<String>, confidence: f32) -> Self {
        Self {
            intent: intent.into(),
            confidence: if confidence.is_finite() {
                confidence.clamp(0.0, 1.0)
            } else {
                0.0
            },
            timestamp: Utc::now(),
        }
    }

    /// A signal carrying no intent; only emotion and novelty can select.
    pub fn ambient() -> Self {
        Self::new("", 0.0)
    }
}

/// A selected action, ready for dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionIntent {
    pub action: String,
    pub score: f32,
    pub timestamp: DateTime<Utc>,
    pub session: SessionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoOpReason {
    /// Every candidate was cooling down, blocked by its group, or the catalog is empty.
    NoEligibleCandidate,
    /// The best candidate scored under the minimum threshold.
    BelowThreshold,
}

/// An explicit decision to do nothing this turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoOp {
    pub session: SessionId,
    pub reason: NoOpReason,
    /// Best eligible candidate and its score, if there was one.
    pub best: Option<(String, f32)>,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of one evaluation. Never an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Act(ActionIntent),
    NoOp(NoOp),
}

impl Decision {
    pub fn intent(&self) -> Option<&ActionIntent> {
        match self {
            Decision::Act(intent) => Some(intent),
            Decision::NoOp(_) => None,
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, Decision::NoOp(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    /// Every trigger was acknowledged.
    Acked,
    /// A trigger went unacknowledged after its retry.
    Timeout,
    /// The control target reported an error.
    Failed,
    /// Removed from the group queue by session teardown before it ran.
    Cancelled,
}

impl DispatchStatus {
    /// Failures count toward score dampening.
    pub fn is_failure(self) -> bool {
        matches!(self, DispatchStatus::Timeout | DispatchStatus::Failed)
    }

    /// Whether the target was actually driven (and the cooldown window starts).
    pub fn was_attempted(self) -> bool {
        !matches!(self, DispatchStatus::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchResult {
    pub action: String,
    pub session: SessionId,
    pub status: DispatchStatus,
    /// From the first trigger sent to the final acknowledgment or give-up.
    pub latency: Duration,
    /// Trigger calls made, retries included.
    pub attempts: u32,
    #[serde(skip)]
    pub error: Option<YueliError>,
}
