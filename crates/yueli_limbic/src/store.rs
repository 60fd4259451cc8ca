//! Emotion store implementation.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use yueli_core::affect::decay_toward;
use yueli_core::config::EmotionConfig;
use yueli_core::{DimensionSpec, EmotionDelta, EmotionState, PipelineCounters, SessionId};

/// Stored emotion of one session, exact as of `updated`.
#[derive(Debug)]
struct SessionAffect {
    state: EmotionState,
    updated: Instant,
}

impl SessionAffect {
    fn new(dimensions: &[DimensionSpec], now: Instant) -> Self {
        Self {
            state: EmotionState::at_baseline(dimensions),
            updated: now,
        }
    }

    /// The stored state relaxed to `now`.
    fn decayed(&self, dimensions: &[DimensionSpec], now: Instant) -> EmotionState {
        let elapsed = now.saturating_duration_since(self.updated);
        let mut state = self.state.clone();
        if elapsed.is_zero() {
            return state;
        }
        for dim in dimensions {
            let v = decay_toward(state.get(&dim.name), dim.baseline, elapsed, dim.half_life());
            state.set(&dim.name, v);
        }
        state
    }
}

/// Per-session emotion vectors with lazy exponential decay.
pub struct EmotionStore {
    dimensions: Arc<[DimensionSpec]>,
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<SessionAffect>>>>,
    counters: Arc<PipelineCounters>,
}

impl EmotionStore {
    pub fn new(config: &EmotionConfig, counters: Arc<PipelineCounters>) -> Self {
        Self {
            dimensions: config.dimensions.clone().into(),
            sessions: RwLock::new(HashMap::new()),
            counters,
        }
    }

    pub fn dimensions(&self) -> &[DimensionSpec] {
        &self.dimensions
    }

    /// Entry for a session, created at baseline on first use.
    async fn entry(&self, session: &SessionId) -> Arc<Mutex<SessionAffect>> {
        if let Some(entry) = self.sessions.read().await.get(session) {
            return Arc::clone(entry);
        }
        let mut sessions = self.sessions.write().await;
        let entry = sessions.entry(session.clone()).or_insert_with(|| {
            tracing::debug!(session = %session, "Emotion state created");
            Arc::new(Mutex::new(SessionAffect::new(&self.dimensions, Instant::now())))
        });
        Arc::clone(entry)
    }

    /// Decay to now, add `delta`, clamp, and return the new state.
    ///
    /// Unknown dimensions are skipped with a warning and counted; the rest of
    /// the delta still applies.
    pub async fn apply_delta(&self, session: &SessionId, delta: &EmotionDelta) -> EmotionState {
        let entry = self.entry(session).await;
        let mut affect = entry.lock().await;

        let now = Instant::now();
        let mut state = affect.decayed(&self.dimensions, now);
        for (dim, amount) in delta.iter() {
            if !state.contains(dim) {
                PipelineCounters::bump(&self.counters.unknown_dimensions);
                tracing::warn!(session = %session, dimension = dim, "Ignoring unknown emotion dimension");
                continue;
            }
            let current = state.get(dim);
            state.set(dim, current + amount);
        }

        affect.state = state.clone();
        affect.updated = now;
        tracing::trace!(session = %session, ?state, "Emotion updated");
        state
    }

    /// Immutable copy of the session's emotion as of now.
    pub async fn snapshot(&self, session: &SessionId) -> Option<EmotionState> {
        let entry = self.sessions.read().await.get(session).cloned()?;
        let affect = entry.lock().await;
        Some(affect.decayed(&self.dimensions, Instant::now()))
    }

    /// Forget a session. Returns whether it existed.
    pub async fn reset(&self, session: &SessionId) -> bool {
        let removed = self.sessions.write().await.remove(session).is_some();
        if removed {
            tracing::debug!(session = %session, "Emotion state reset");
        }
        removed
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
