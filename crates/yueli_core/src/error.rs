//! Error taxonomy shared by every pipeline stage.
//!
//! Only [`YueliError::Validation`] and [`YueliError::UnknownDimension`] are
//! ever fatal, and only while loading the catalog. The remaining variants are
//! carried inside structured results (dispatch results, audio outcomes) and
//! counted; they are never raised through the pipeline.

use crate::SessionId;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum YueliError {
    /// Malformed catalog entry.
    #[error("invalid catalog entry `{id}`: {reason}")]
    Validation { id: String, reason: String },

    /// An affinity or delta names a dimension the store does not track.
    #[error("unknown emotion dimension `{0}`")]
    UnknownDimension(String),

    /// Trigger or audio device did not answer in time (after local retries).
    #[error("{what} did not respond within {timeout_ms} ms")]
    TransientDevice { what: String, timeout_ms: u64 },

    /// Hard device failure; not retried.
    #[error("{what} unavailable: {reason}")]
    Unavailable { what: String, reason: String },

    /// A bounded queue or rate limit refused the work.
    #[error("{queue} is full")]
    Overflow { queue: String },

    #[error("session `{0}` not found")]
    SessionNotFound(SessionId),
}

impl YueliError {
    pub fn validation(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error must abort startup.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::UnknownDimension(_))
    }
}
