//! Priority audio router.
//!
//! Producers call [`AudioRouter::enqueue`], which never waits. A single
//! consumer task per device pops the highest-priority request (FIFO within a
//! class), plays it, and resolves its [`AudioTicket`]. A higher-class arrival
//! interrupts a preemptible lower-class playback through a cancellation token;
//! non-preemptible playback is left to finish.

use crate::output::{AudioOutput, AudioPayload};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use yueli_core::config::AudioConfig;
use yueli_core::{PipelineCounters, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    Ambient = 0,
    Reaction = 1,
    Speech = 2,
}

impl PriorityClass {
    /// Highest first.
    const DESCENDING: [PriorityClass; 3] = [PriorityClass::Speech, PriorityClass::Reaction, PriorityClass::Ambient];

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioOutcome {
    Played,
    /// Interrupted by a higher-priority request.
    Preempted,
    Cancelled,
    /// Evicted from a full queue before it started.
    Dropped,
    DeliveryFailed,
}

#[derive(Debug, Clone)]
pub struct AudioRequest {
    pub payload: AudioPayload,
    pub class: PriorityClass,
    pub session: SessionId,
    pub cancel: CancellationToken,
    pub preemptible: bool,
}

impl AudioRequest {
    /// Speech defaults to non-preemptible, everything else to preemptible.
    pub fn new(payload: AudioPayload, class: PriorityClass, session: SessionId) -> Self {
        Self {
            payload,
            class,
            session,
            cancel: CancellationToken::new(),
            preemptible: class != PriorityClass::Speech,
        }
    }

    pub fn preemptible(mut self, preemptible: bool) -> Self {
        self.preemptible = preemptible;
        self
    }

    /// Tie the request to an outer token, e.g. the session's.
    pub fn cancelled_by(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }
}

/// Handle to an enqueued request.
#[derive(Debug)]
pub struct AudioTicket {
    id: u64,
    cancel: CancellationToken,
    router: Weak<Shared>,
    outcome: oneshot::Receiver<AudioOutcome>,
}

impl AudioTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cancel the request. Queued: removed without playing. Playing: stopped.
    /// Already finished: nothing happens.
    pub fn cancel(&self) {
        self.cancel.cancel();
        if let Some(shared) = self.router.upgrade() {
            shared.remove_queued(self.id);
        }
    }

    pub async fn outcome(self) -> AudioOutcome {
        self.outcome.await.unwrap_or(AudioOutcome::Cancelled)
    }
}

struct Pending {
    id: u64,
    request: AudioRequest,
    reply: oneshot::Sender<AudioOutcome>,
}

struct Playing {
    id: u64,
    class: PriorityClass,
    session: SessionId,
    preemptible: bool,
    cancel: CancellationToken,
    interrupt: CancellationToken,
}

#[derive(Default)]
struct State {
    queues: [VecDeque<Pending>; 3],
    playing: Option<Playing>,
    next_id: u64,
}

impl State {
    fn queued(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    fn lowest_queued_class(&self) -> Option<PriorityClass> {
        PriorityClass::DESCENDING
            .iter()
            .rev()
            .copied()
            .find(|c| !self.queues[c.index()].is_empty())
    }

    fn pop_highest(&mut self) -> Option<Pending> {
        PriorityClass::DESCENDING
            .iter()
            .find_map(|c| self.queues[c.index()].pop_front())
    }
}

struct Shared {
    state: Mutex<State>,
    wake: Notify,
    output: Arc<dyn AudioOutput>,
    config: AudioConfig,
    counters: Arc<PipelineCounters>,
    shutdown: CancellationToken,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, pending: Pending, outcome: AudioOutcome) {
        self.count(outcome);
        let _ = pending.reply.send(outcome);
    }

    fn count(&self, outcome: AudioOutcome) {
        let c = &self.counters;
        let counter = match outcome {
            AudioOutcome::Played => &c.audio_played,
            AudioOutcome::Preempted => &c.audio_preempted,
            AudioOutcome::Cancelled => &c.audio_cancelled,
            AudioOutcome::Dropped => &c.audio_dropped,
            AudioOutcome::DeliveryFailed => &c.audio_delivery_failed,
        };
        PipelineCounters::bump(counter);
    }

    fn remove_queued(&self, id: u64) {
        let removed = {
            let mut state = self.state();
            state.queues.iter_mut().find_map(|q| {
                let pos = q.iter().position(|p| p.id == id)?;
                q.remove(pos)
            })
        };
        if let Some(pending) = removed {
            tracing::debug!(id, "Queued audio cancelled");
            self.resolve(pending, AudioOutcome::Cancelled);
        }
    }
}

/// Router for one output device.
#[derive(Clone)]
pub struct AudioRouter {
    shared: Arc<Shared>,
}

impl AudioRouter {
    /// Create the router and spawn its consumer loop.
    pub fn start(output: Arc<dyn AudioOutput>, config: AudioConfig, counters: Arc<PipelineCounters>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            wake: Notify::new(),
            output,
            config,
            counters,
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(consume(Arc::clone(&shared)));
        tracing::info!(device = %shared.output.device(), "Audio router started");
        Self { shared }
    }

    /// Queue a request without waiting.
    pub fn enqueue(&self, request: AudioRequest) -> AudioTicket {
        let shared = &self.shared;
        let (tx, rx) = oneshot::channel();
        let mut state = shared.state();
        let id = state.next_id;
        state.next_id += 1;

        let ticket = AudioTicket {
            id,
            cancel: request.cancel.clone(),
            router: Arc::downgrade(shared),
            outcome: rx,
        };
        let class = request.class;
        let pending = Pending {
            id,
            request,
            reply: tx,
        };

        if !shared.output.is_available() {
            drop(state);
            tracing::warn!(device = %shared.output.device(), "Audio device unavailable, request failed");
            shared.resolve(pending, AudioOutcome::DeliveryFailed);
            return ticket;
        }
        if pending.request.cancel.is_cancelled() || shared.shutdown.is_cancelled() {
            drop(state);
            shared.resolve(pending, AudioOutcome::Cancelled);
            return ticket;
        }

        let mut evicted = None;
        if state.queued() >= shared.config.max_queued.max(1) {
            let lowest = state.lowest_queued_class();
            match lowest {
                Some(lowest) if lowest <= class => evicted = state.queues[lowest.index()].pop_front(),
                _ => {
                    drop(state);
                    tracing::warn!(class = ?class, "Audio queue full, request dropped");
                    shared.resolve(pending, AudioOutcome::Dropped);
                    return ticket;
                }
            }
        }

        if let Some(playing) = &state.playing {
            if playing.preemptible && playing.class < class {
                tracing::debug!(playing = playing.id, by = id, "Preempting playback");
                playing.interrupt.cancel();
            }
        }
        state.queues[class.index()].push_back(pending);
        drop(state);

        if let Some(evicted) = evicted {
            tracing::warn!(id = evicted.id, class = ?evicted.request.class, "Audio queue full, oldest lowest-priority request dropped");
            shared.resolve(evicted, AudioOutcome::Dropped);
        }
        shared.wake.notify_one();
        ticket
    }

    /// Cancel every queued and playing request of a session.
    pub fn cancel_session(&self, session: &SessionId) -> usize {
        let shared = &self.shared;
        let mut removed = Vec::new();
        let mut count = 0;
        {
            let mut state = shared.state();
            for queue in state.queues.iter_mut() {
                for pending in std::mem::take(queue) {
                    if &pending.request.session == session {
                        removed.push(pending);
                    } else {
                        queue.push_back(pending);
                    }
                }
            }
            if let Some(playing) = &state.playing {
                if &playing.session == session {
                    playing.cancel.cancel();
                    count += 1;
                }
            }
        }
        count += removed.len();
        for pending in removed {
            shared.resolve(pending, AudioOutcome::Cancelled);
        }
        if count > 0 {
            tracing::debug!(session = %session, count, "Session audio cancelled");
        }
        count
    }

    pub fn queued(&self) -> usize {
        self.shared.state().queued()
    }

    /// Stop the consumer loop; playing and queued requests resolve cancelled.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }
}

async fn consume(shared: Arc<Shared>) {
    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }
        let next = {
            let mut state = shared.state();
            state.pop_highest().map(|pending| {
                let interrupt = CancellationToken::new();
                state.playing = Some(Playing {
                    id: pending.id,
                    class: pending.request.class,
                    session: pending.request.session.clone(),
                    preemptible: pending.request.preemptible,
                    cancel: pending.request.cancel.clone(),
                    interrupt: interrupt.clone(),
                });
                (pending, interrupt)
            })
        };

        let Some((pending, interrupt)) = next else {
            tokio::select! {
                _ = shared.wake.notified() => {}
                _ = shared.shutdown.cancelled() => break,
            }
            continue;
        };

        let outcome = play(&shared, &pending, &interrupt).await;
        shared.state().playing = None;
        tracing::trace!(id = pending.id, ?outcome, "Audio request finished");
        shared.resolve(pending, outcome);
    }

    let leftovers: Vec<Pending> = {
        let mut state = shared.state();
        state.queues.iter_mut().flat_map(std::mem::take).collect()
    };
    for pending in leftovers {
        shared.resolve(pending, AudioOutcome::Cancelled);
    }
    tracing::info!(device = %shared.output.device(), "Audio router stopped");
}

async fn play(shared: &Shared, pending: &Pending, interrupt: &CancellationToken) -> AudioOutcome {
    let request = &pending.request;
    if request.cancel.is_cancelled() {
        return AudioOutcome::Cancelled;
    }

    let playback = match shared.output.play(&request.payload).await {
        Ok(playback) => playback,
        Err(e) => {
            tracing::error!(id = pending.id, "Audio delivery failed: {}", e);
            return AudioOutcome::DeliveryFailed;
        }
    };

    let (outcome, stop) = tokio::select! {
        biased;
        _ = request.cancel.cancelled() => (AudioOutcome::Cancelled, true),
        _ = shared.shutdown.cancelled() => (AudioOutcome::Cancelled, true),
        _ = interrupt.cancelled() => (AudioOutcome::Preempted, true),
        done = playback.finished => match done {
            Ok(()) => (AudioOutcome::Played, false),
            Err(_) => (AudioOutcome::DeliveryFailed, false),
        },
    };

    if stop {
        let started = Instant::now();
        shared.output.stop(playback.handle).await;
        let took = started.elapsed();
        if took > shared.config.preempt_budget() {
            tracing::warn!(id = pending.id, ?took, "Stopping playback exceeded the preemption budget");
        }
    }
    outcome
}
