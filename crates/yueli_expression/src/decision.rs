//! Action decision engine.
//!
//! Every catalog entry that is neither cooling down nor blocked by a busy
//! exclusivity group is scored as
//!
//! ```text
//! score = w_emotion · cosine(emotion, affinity)
//!       + w_intent  · intent_match(signal, action)
//!       + w_novelty · novelty(time since last use)
//!       − min(failure_penalty · consecutive_failures, max_failure_penalty)
//! ```
//!
//! The best candidate at or above `min_score` is selected and reserved;
//! otherwise the engine answers with an explicit no-op.

use crate::ledger::{ActionLedger, SessionBook};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use yueli_core::config::DecisionConfig;
use yueli_core::{
    ActionDefinition, ActionIntent, Decision, EmotionState, NoOp, NoOpReason, PipelineCounters,
    SemanticSignal, SessionId, SharedCatalog,
};

/// Scores closer than this are treated as tied.
const SCORE_EPSILON: f32 = 1e-6;

pub struct DecisionEngine {
    catalog: SharedCatalog,
    ledger: Arc<ActionLedger>,
    config: DecisionConfig,
    counters: Arc<PipelineCounters>,
}

#[derive(Debug, Clone, Copy)]
struct Candidate<'a> {
    action: &'a ActionDefinition,
    score: f32,
}

impl Candidate<'_> {
    /// Higher score, then higher priority, then earlier registration.
    fn beats(&self, other: &Candidate<'_>) -> bool {
        if (self.score - other.score).abs() > SCORE_EPSILON {
            return self.score > other.score;
        }
        if (self.action.priority - other.action.priority).abs() > f32::EPSILON {
            return self.action.priority > other.action.priority;
        }
        self.action.order < other.action.order
    }
}

impl DecisionEngine {
    pub fn new(
        catalog: SharedCatalog,
        ledger: Arc<ActionLedger>,
        config: DecisionConfig,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        Self {
            catalog,
            ledger,
            config,
            counters,
        }
    }

    pub fn ledger(&self) -> &Arc<ActionLedger> {
        &self.ledger
    }

    /// Decide what (if anything) the avatar does for this signal.
    ///
    /// `emotion` is the session's current snapshot; without one the emotion
    /// term is dropped and the decision is made on intent and novelty alone.
    /// Never fails: the absence of a good action is a [`Decision::NoOp`].
    pub async fn evaluate(
        &self,
        session: &SessionId,
        signal: &SemanticSignal,
        emotion: Option<&EmotionState>,
    ) -> Decision {
        let book = self.ledger.book(session).await;
        let mut book = book.lock().await;
        let busy = self.ledger.busy_groups().await;
        let catalog = self.catalog.load();
        let now = Instant::now();

        if emotion.is_none() {
            tracing::debug!(session = %session, "No emotion snapshot, scoring without emotion term");
        }

        let mut best: Option<Candidate<'_>> = None;
        for action in catalog.iter() {
            if book.is_cooling(&action.id, action.cooldown, now) || busy.contains(&action.group) {
                continue;
            }
            let candidate = Candidate {
                action,
                score: self.score(action, signal, emotion, &book, now),
            };
            tracing::trace!(session = %session, action = %action.id, score = candidate.score, "Candidate scored");
            if best.as_ref().map_or(true, |b| candidate.beats(b)) {
                best = Some(candidate);
            }
        }

        let decision = match best {
            Some(c) if c.score >= self.config.min_score => {
                book.reserve(&c.action.id, now);
                Decision::Act(ActionIntent {
                    action: c.action.id.clone(),
                    score: c.score,
                    timestamp: Utc::now(),
                    session: session.clone(),
                })
            }
            Some(c) => self.noop(session, NoOpReason::BelowThreshold, Some((c.action.id.clone(), c.score))),
            None => self.noop(session, NoOpReason::NoEligibleCandidate, None),
        };

        match &decision {
            Decision::Act(intent) => {
                PipelineCounters::bump(&self.counters.decisions_selected);
                tracing::debug!(session = %session, action = %intent.action, score = intent.score, "Action selected");
            }
            Decision::NoOp(noop) => {
                PipelineCounters::bump(&self.counters.decisions_noop);
                tracing::debug!(session = %session, reason = ?noop.reason, best = ?noop.best, "No action");
            }
        }
        decision
    }

    fn score(
        &self,
        action: &ActionDefinition,
        signal: &SemanticSignal,
        emotion: Option<&EmotionState>,
        book: &SessionBook,
        now: Instant,
    ) -> f32 {
        let cfg = &self.config;

        let emotion_term = emotion.map_or(0.0, |e| e.cosine(&action.affinity));
        let intent_term = if action.answers_to(&signal.intent) {
            signal.confidence
        } else {
            0.0
        };
        let novelty = novelty(book.since_last_use(&action.id, now), cfg.novelty_horizon());
        let penalty = (cfg.failure_penalty * book.consecutive_failures(&action.id) as f32)
            .min(cfg.max_failure_penalty);

        cfg.emotion_weight * emotion_term + cfg.intent_weight * intent_term + cfg.novelty_weight * novelty
            - penalty
    }

    fn noop(&self, session: &SessionId, reason: NoOpReason, best: Option<(String, f32)>) -> Decision {
        Decision::NoOp(NoOp {
            session: session.clone(),
            reason,
            best,
            timestamp: Utc::now(),
        })
    }
}

/// 1 for never-used actions, rising from 0 back toward 1 after each use.
fn novelty(since_last_use: Option<Duration>, horizon: Duration) -> f32 {
    match since_last_use {
        None => 1.0,
        Some(_) if horizon.is_zero() => 1.0,
        Some(t) => 1.0 - (-(t.as_secs_f64() / horizon.as_secs_f64())).exp() as f32,
    }
}
