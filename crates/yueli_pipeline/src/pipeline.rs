//! Turn handling and session teardown.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedRwLockReadGuard;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use yueli_core::{
    analyze_sentiment, shared_catalog, ActionCatalog, CatalogRules, Decision, DispatchResult, DispatchStatus,
    EmotionDelta, EmotionState, NoOp, PipelineCounters, SemanticSignal, SessionId, SharedCatalog, YueliConfig,
    YueliError,
};
use yueli_expression::{ActionLedger, AvatarControl, DecisionEngine, DispatchRejection, Dispatcher};
use yueli_limbic::EmotionStore;
use yueli_live::{LiveEvent, LiveReceiver};
use yueli_voice::{
    AudioOutcome, AudioOutput, AudioPayload, AudioRequest, AudioRouter, AudioTicket, PriorityClass, Speaker,
    TextToSpeech,
};

/// Assumed length of a reaction sound file.
pub const REACTION_SOUND_LENGTH: Duration = Duration::from_secs(2);

/// Result of one decision turn.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Idle(NoOp),
    /// Selected, but the dispatcher refused it.
    Rejected { action: String, reason: DispatchRejection },
    /// Dispatched; `sound` tells whether a reaction sound was queued.
    Dispatched { result: DispatchResult, sound: bool },
}

impl TurnOutcome {
    pub fn action(&self) -> Option<&str> {
        match self {
            TurnOutcome::Idle(_) => None,
            TurnOutcome::Rejected { action, .. } => Some(action),
            TurnOutcome::Dispatched { result, .. } => Some(&result.action),
        }
    }
}

#[derive(Debug)]
pub struct ReplyOutcome {
    /// Emotion after self-feedback; `None` when the reply was neutral.
    pub emotion: Option<EmotionState>,
    pub turn: TurnOutcome,
    /// One ticket per queued sentence.
    pub speech: Vec<AudioTicket>,
}

/// Work in progress on a live session. Holding one keeps `end_session`
/// waiting.
struct SessionWork {
    cancel: CancellationToken,
    _gate: OwnedRwLockReadGuard<()>,
}

impl SessionWork {
    /// Stop holding up teardown, keeping the session's token.
    fn release(self) -> CancellationToken {
        self.cancel
    }
}

/// What ending a session cleaned up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Teardown {
    pub audio_cancelled: usize,
    pub intents_cancelled: usize,
    pub had_emotion: bool,
}

pub struct Pipeline {
    catalog: SharedCatalog,
    rules: CatalogRules,
    emotion: EmotionStore,
    ledger: Arc<ActionLedger>,
    engine: DecisionEngine,
    dispatcher: Dispatcher,
    audio: AudioRouter,
    speaker: Speaker,
    sessions: crate::SessionRegistry,
    live_idle: Option<Duration>,
    counters: Arc<PipelineCounters>,
}

impl Pipeline {
    /// Build every stage and start the audio consumer loop.
    pub fn new(
        config: &YueliConfig,
        catalog: ActionCatalog,
        avatar: Arc<dyn AvatarControl>,
        output: Arc<dyn AudioOutput>,
        tts: Arc<dyn TextToSpeech>,
    ) -> Self {
        let counters = Arc::new(PipelineCounters::default());
        let catalog = shared_catalog(catalog);
        let ledger = Arc::new(ActionLedger::new());
        let engine = DecisionEngine::new(
            Arc::clone(&catalog),
            Arc::clone(&ledger),
            config.decision.clone(),
            Arc::clone(&counters),
        );
        let dispatcher = Dispatcher::new(
            Arc::clone(&catalog),
            Arc::clone(&ledger),
            avatar,
            config.dispatch.clone(),
            Arc::clone(&counters),
        );
        let audio = AudioRouter::start(output, config.audio.clone(), Arc::clone(&counters));
        let speaker = Speaker::new(tts, audio.clone());

        Self {
            catalog,
            rules: config.catalog_rules(),
            emotion: EmotionStore::new(&config.emotion, Arc::clone(&counters)),
            ledger,
            engine,
            dispatcher,
            audio,
            speaker,
            sessions: crate::SessionRegistry::new(),
            live_idle: config.live.session_idle(),
            counters,
        }
    }

    pub fn counters(&self) -> Arc<PipelineCounters> {
        Arc::clone(&self.counters)
    }

    pub fn catalog(&self) -> &SharedCatalog {
        &self.catalog
    }

    pub fn ledger(&self) -> &Arc<ActionLedger> {
        &self.ledger
    }

    pub fn sessions(&self) -> &crate::SessionRegistry {
        &self.sessions
    }

    pub async fn start_session(&self, session: &SessionId) -> CancellationToken {
        self.sessions.start(session).await
    }

    fn not_found(&self, session: &SessionId) -> YueliError {
        PipelineCounters::bump(&self.counters.session_not_found);
        warn!(session = %session, "Unknown session");
        YueliError::SessionNotFound(session.clone())
    }

    /// Begin work on a running session. Fails if the session is unknown or
    /// was ended while waiting for its gate.
    async fn enter(&self, session: &SessionId) -> Result<SessionWork, YueliError> {
        if let Some(handle) = self.sessions.handle(session).await {
            let gate = Arc::clone(&handle.gate).read_owned().await;
            if !handle.cancel.is_cancelled() {
                return Ok(SessionWork {
                    cancel: handle.cancel,
                    _gate: gate,
                });
            }
        }
        Err(self.not_found(session))
    }

    /// Decide on the signal, dispatch the selected action and wait for its
    /// result. An acknowledged action with a reaction sound queues it.
    ///
    /// Ending the session concurrently waits until the intent is submitted,
    /// so teardown either sees it queued or the turn sees the session gone.
    pub async fn handle_turn(&self, session: &SessionId, signal: &SemanticSignal) -> Result<TurnOutcome, YueliError> {
        let work = self.enter(session).await?;
        let emotion = self.emotion.snapshot(session).await;

        let intent = match self.engine.evaluate(session, signal, emotion.as_ref()).await {
            Decision::Act(intent) => intent,
            Decision::NoOp(noop) => return Ok(TurnOutcome::Idle(noop)),
        };
        let action = intent.action.clone();
        let submitted = self.dispatcher.submit(intent).await;
        let cancel = work.release();
        let ticket = match submitted {
            Ok(ticket) => ticket,
            Err(reason) => return Ok(TurnOutcome::Rejected { action, reason }),
        };

        let result = ticket.result().await;
        let sound = result.status == DispatchStatus::Acked && self.play_reaction(session, &action, &cancel);
        Ok(TurnOutcome::Dispatched { result, sound })
    }

    /// Queue the action's reaction sound, if it has one. Failing to deliver it
    /// counts against the action like a failed dispatch.
    fn play_reaction(&self, session: &SessionId, action: &str, cancel: &CancellationToken) -> bool {
        let Some(path) = self.catalog.load().get(action).and_then(|a| a.sound.clone()) else {
            return false;
        };
        let payload = AudioPayload::File {
            path: PathBuf::from(path),
            duration: REACTION_SOUND_LENGTH,
        };
        let ticket = self
            .audio
            .enqueue(AudioRequest::new(payload, PriorityClass::Reaction, session.clone()).cancelled_by(cancel));

        let ledger = Arc::clone(&self.ledger);
        let (session, action) = (session.clone(), action.to_string());
        tokio::spawn(async move {
            if ticket.outcome().await == AudioOutcome::DeliveryFailed {
                warn!(session = %session, action = %action, "Reaction sound not delivered");
                ledger.note_failure(&session, &action).await;
            }
        });
        true
    }

    pub async fn apply_emotion(&self, session: &SessionId, delta: &EmotionDelta) -> Result<EmotionState, YueliError> {
        let _work = self.enter(session).await?;
        Ok(self.emotion.apply_delta(session, delta).await)
    }

    pub async fn emotion(&self, session: &SessionId) -> Option<EmotionState> {
        self.emotion.snapshot(session).await
    }

    /// The avatar says `text`.
    ///
    /// The reply's sentiment feeds back into the session's emotion, then the
    /// turn is decided on `suggested` (the dialogue core's own action hint) or
    /// else on the sentiment's intent, while the reply is queued for speech.
    pub async fn observe_reply(
        &self,
        session: &SessionId,
        text: &str,
        suggested: Option<&str>,
    ) -> Result<ReplyOutcome, YueliError> {
        let work = self.enter(session).await?;

        let sentiment = analyze_sentiment(text);
        let emotion = if sentiment.is_neutral() {
            None
        } else {
            Some(self.emotion.apply_delta(session, &sentiment.to_delta()).await)
        };
        // The turn below enters the session again.
        let cancel = work.release();

        let signal = match suggested.map(str::trim).filter(|s| !s.is_empty()) {
            Some(tag) => SemanticSignal::new(tag, 1.0),
            None => sentiment
                .intent()
                .map(|(tag, confidence)| SemanticSignal::new(tag, confidence))
                .unwrap_or_else(SemanticSignal::ambient),
        };
        let tone = sentiment.intent().map(|(tag, _)| tag);

        let (turn, speech) = tokio::join!(
            self.handle_turn(session, &signal),
            self.speaker.speak(session, text, tone, &cancel),
        );
        Ok(ReplyOutcome {
            emotion,
            turn: turn?,
            speech,
        })
    }

    /// Validate the catalog at `path` and swap it in. On error the current
    /// catalog stays.
    pub async fn reload_catalog(&self, path: impl AsRef<Path>) -> anyhow::Result<usize> {
        let catalog = ActionCatalog::load(path, &self.rules)?;
        let count = catalog.len();
        self.catalog.store(Arc::new(catalog));
        info!("Catalog reloaded: {} actions", count);
        Ok(count)
    }

    /// Tear a session down: its audio and queued intents are cancelled, its
    /// cooldown reservations released and its emotion forgotten. In-flight
    /// dispatches finish but their results are no longer booked.
    pub async fn end_session(&self, session: &SessionId) -> Result<Teardown, YueliError> {
        let Some(handle) = self.sessions.handle(session).await else {
            return Err(self.not_found(session));
        };
        let _teardown = handle.gate.write().await;
        if handle.cancel.is_cancelled() {
            return Err(self.not_found(session));
        }

        let audio_cancelled = self.audio.cancel_session(session);
        let intents_cancelled = self.dispatcher.cancel_session(session).await;
        self.sessions.end(session).await;
        self.ledger.drop_session(session).await;
        let had_emotion = self.emotion.reset(session).await;

        info!(session = %session, audio_cancelled, intents_cancelled, "Session ended");
        Ok(Teardown {
            audio_cancelled,
            intents_cancelled,
            had_emotion,
        })
    }

    /// Run a decision turn for a live event that carries a signal. The
    /// event's source is its session, started on first sight.
    pub async fn live_turn(&self, event: &LiveEvent) -> Option<TurnOutcome> {
        let signal = event.to_signal()?;
        let session = SessionId::from(event.source.as_str());
        self.sessions.start(&session).await;
        match self.handle_turn(&session, &signal).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(source = %event.source, "Live turn failed: {}", e);
                None
            }
        }
    }

    /// Consume the hub's decision mailbox until it closes or `shutdown`
    /// fires. Events are handled one at a time, most urgent first; the
    /// mailbox bounds the backlog. Live sessions that go quiet for the
    /// configured idle time are ended.
    pub fn spawn_live_decisions(self: &Arc<Self>, mut events: LiveReceiver, shutdown: CancellationToken) -> JoinHandle<()> {
        let pipeline = Arc::clone(self);
        let idle = self.live_idle;
        tokio::spawn(async move {
            let mut heard: HashMap<SessionId, Instant> = HashMap::new();
            let period = idle.map_or(Duration::from_secs(3600), |d| (d / 2).max(Duration::from_secs(1)));
            let mut sweep = tokio::time::interval(period);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sweep.tick(), if idle.is_some() => {
                        if let Some(idle) = idle {
                            pipeline.end_idle_live(&mut heard, idle).await;
                        }
                        continue;
                    }
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                heard.insert(SessionId::from(event.source.as_str()), Instant::now());
                if let Some(outcome) = pipeline.live_turn(&event).await {
                    debug!(source = %event.source, action = ?outcome.action(), "Live turn done");
                }
            }
            debug!("Live decision worker stopped");
        })
    }

    async fn end_idle_live(&self, heard: &mut HashMap<SessionId, Instant>, idle: Duration) {
        let now = Instant::now();
        let quiet: Vec<SessionId> = heard
            .iter()
            .filter(|(_, at)| now.saturating_duration_since(**at) >= idle)
            .map(|(session, _)| session.clone())
            .collect();
        for session in quiet {
            heard.remove(&session);
            if self.sessions.handle(&session).await.is_some() && self.end_session(&session).await.is_ok() {
                info!(session = %session, "Idle live session ended");
            }
        }
    }

    pub fn shutdown(&self) {
        self.audio.shutdown();
    }
}
