//! Action dispatcher.
//!
//! Each exclusivity group owns one logical slot: the first intent for an idle
//! group spawns a worker task that sends the action's trigger bindings in
//! order, then drains the group's bounded queue before exiting. Submitting
//! returns a [`DispatchTicket`] that always resolves to a [`DispatchResult`].

use crate::ledger::ActionLedger;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use yueli_core::config::DispatchConfig;
use yueli_core::{
    ActionDefinition, ActionIntent, DispatchResult, DispatchStatus, PipelineCounters, SessionId,
    SharedCatalog, TriggerBinding, YueliError,
};

/// First try plus one retry after a timeout.
const MAX_ATTEMPTS: u32 = 2;

/// External avatar-control target (e.g. VTube Studio).
///
/// Implementations only report hard failures; the dispatcher enforces the
/// acknowledgment timeout around each call.
#[async_trait]
pub trait AvatarControl: Send + Sync {
    /// Fire one binding and wait for the target to acknowledge it.
    async fn trigger(&self, binding: &TriggerBinding) -> Result<(), AvatarError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AvatarError {
    #[error("avatar target unavailable: {0}")]
    Unavailable(String),
    #[error("avatar target rejected the request: {0}")]
    Rejected(String),
}

/// Why an intent was refused at submission. Refusal is final.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchRejection {
    #[error("exclusivity group `{group}` is busy and its queue is full")]
    Backpressure { group: String },
    /// The same action is already queued or in flight for the session.
    #[error("action `{action}` is already queued or in flight")]
    Duplicate { action: String },
    #[error(transparent)]
    Invalid(#[from] YueliError),
}

impl DispatchRejection {
    pub fn to_error(&self) -> YueliError {
        match self {
            DispatchRejection::Backpressure { group } => YueliError::Overflow {
                queue: format!("dispatch queue `{group}`"),
            },
            DispatchRejection::Duplicate { action } => YueliError::validation(action, "already queued or in flight"),
            DispatchRejection::Invalid(e) => e.clone(),
        }
    }
}

/// Handle to a submitted intent.
#[derive(Debug)]
pub struct DispatchTicket {
    action: String,
    session: SessionId,
    reply: oneshot::Receiver<DispatchResult>,
}

impl DispatchTicket {
    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Wait for the outcome. A dispatcher that went away counts as cancelled.
    pub async fn result(self) -> DispatchResult {
        match self.reply.await {
            Ok(result) => result,
            Err(_) => DispatchResult {
                action: self.action,
                session: self.session,
                status: DispatchStatus::Cancelled,
                latency: Duration::ZERO,
                attempts: 0,
                error: None,
            },
        }
    }
}

struct Job {
    intent: ActionIntent,
    action: ActionDefinition,
    reply: oneshot::Sender<DispatchResult>,
    queued_at: Instant,
}

impl Job {
    fn finish(self, result: DispatchResult) {
        // The submitter may have dropped its ticket.
        let _ = self.reply.send(result);
    }
}

#[derive(Default)]
struct GroupSlot {
    current: Option<(SessionId, String)>,
    pending: VecDeque<Job>,
}

impl GroupSlot {
    fn holds(&self, session: &SessionId, action: &str) -> bool {
        let same = |s: &SessionId, a: &str| s == session && a == action;
        self.current.as_ref().is_some_and(|(s, a)| same(s, a.as_str()))
            || self
                .pending
                .iter()
                .any(|j| same(&j.intent.session, j.intent.action.as_str()))
    }
}

struct Shared {
    catalog: SharedCatalog,
    ledger: Arc<ActionLedger>,
    target: Arc<dyn AvatarControl>,
    config: DispatchConfig,
    counters: Arc<PipelineCounters>,
    groups: Mutex<HashMap<String, GroupSlot>>,
}

#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    pub fn new(
        catalog: SharedCatalog,
        ledger: Arc<ActionLedger>,
        target: Arc<dyn AvatarControl>,
        config: DispatchConfig,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                catalog,
                ledger,
                target,
                config,
                counters,
                groups: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Hand an intent to its group's slot.
    ///
    /// On rejection the intent's cooldown reservation is released, since no
    /// result will ever be recorded for it. A duplicate leaves it alone: the
    /// reservation belongs to the copy already admitted.
    pub async fn submit(&self, intent: ActionIntent) -> Result<DispatchTicket, DispatchRejection> {
        let session = intent.session.clone();
        let action = intent.action.clone();

        let admitted = self.admit(intent).await;
        if let Err(rejection) = &admitted {
            if !matches!(rejection, DispatchRejection::Duplicate { .. }) {
                self.shared.ledger.release(&session, &action).await;
            }
            PipelineCounters::bump(&self.shared.counters.dispatch_rejected);
            tracing::warn!(session = %session, action = %action, "Intent rejected: {}", rejection);
        }
        admitted
    }

    async fn admit(&self, intent: ActionIntent) -> Result<DispatchTicket, DispatchRejection> {
        let shared = &self.shared;
        let action = shared
            .catalog
            .load()
            .get(&intent.action)
            .cloned()
            .ok_or_else(|| YueliError::validation(&intent.action, "not in catalog"))?;

        if shared
            .ledger
            .in_result_cooldown(&intent.session, &action.id, action.cooldown)
            .await
        {
            return Err(YueliError::validation(&action.id, "still cooling down").into());
        }

        let (tx, rx) = oneshot::channel();
        let ticket = DispatchTicket {
            action: action.id.clone(),
            session: intent.session.clone(),
            reply: rx,
        };

        let group = action.group.clone();
        let mut groups = shared.groups.lock().await;
        let slot = groups.entry(group.clone()).or_default();
        if slot.holds(&intent.session, &action.id) {
            return Err(DispatchRejection::Duplicate { action: action.id });
        }

        let job = Job {
            intent,
            action,
            reply: tx,
            queued_at: Instant::now(),
        };

        if slot.current.is_none() {
            slot.current = Some((job.intent.session.clone(), job.action.id.clone()));
            shared.ledger.enter_group(&group).await;
            drop(groups);
            tokio::spawn(run_group(Arc::clone(shared), group, job));
        } else if slot.pending.len() < shared.config.queue_depth {
            tracing::debug!(
                session = %job.intent.session,
                action = %job.action.id,
                group = %group,
                depth = slot.pending.len() + 1,
                "Intent queued behind busy group"
            );
            slot.pending.push_back(job);
        } else {
            return Err(DispatchRejection::Backpressure { group });
        }
        Ok(ticket)
    }

    /// Drop every queued intent of a session; their tickets resolve as
    /// cancelled. In-flight intents run to completion.
    pub async fn cancel_session(&self, session: &SessionId) -> usize {
        let removed: Vec<Job> = {
            let mut groups = self.shared.groups.lock().await;
            let mut removed = Vec::new();
            for slot in groups.values_mut() {
                for job in std::mem::take(&mut slot.pending) {
                    if &job.intent.session == session {
                        removed.push(job);
                    } else {
                        slot.pending.push_back(job);
                    }
                }
            }
            removed
        };

        let count = removed.len();
        for job in removed {
            self.shared.ledger.release(session, &job.action.id).await;
            PipelineCounters::bump(&self.shared.counters.dispatch_cancelled);
            let result = DispatchResult {
                action: job.action.id.clone(),
                session: session.clone(),
                status: DispatchStatus::Cancelled,
                latency: job.queued_at.elapsed(),
                attempts: 0,
                error: None,
            };
            job.finish(result);
        }
        if count > 0 {
            tracing::debug!(session = %session, count, "Queued intents cancelled");
        }
        count
    }

    /// Intents waiting behind the in-flight one of `group`.
    pub async fn queued(&self, group: &str) -> usize {
        self.shared
            .groups
            .lock()
            .await
            .get(group)
            .map_or(0, |slot| slot.pending.len())
    }
}

/// Worker owning a group's slot until its queue is empty.
async fn run_group(shared: Arc<Shared>, group: String, first: Job) {
    let mut job = first;
    loop {
        let result = shared.execute(&job).await;
        shared.ledger.record(&result).await;
        shared.count(&result);
        job.finish(result);

        let mut groups = shared.groups.lock().await;
        let next = groups.get_mut(&group).and_then(|slot| {
            let next = slot.pending.pop_front()?;
            slot.current = Some((next.intent.session.clone(), next.action.id.clone()));
            Some(next)
        });
        match next {
            Some(next) => job = next,
            None => {
                groups.remove(&group);
                shared.ledger.leave_group(&group).await;
                return;
            }
        }
    }
}

impl Shared {
    async fn execute(&self, job: &Job) -> DispatchResult {
        let started = Instant::now();
        let mut attempts = 0;
        let mut failure = None;

        for (i, binding) in job.action.triggers.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.inter_trigger_delay()).await;
            }
            if let Err(f) = self.fire(job, binding, &mut attempts).await {
                failure = Some(f);
                break;
            }
        }

        let (status, error) = match failure {
            None => (DispatchStatus::Acked, None),
            Some((status, error)) => (status, Some(error)),
        };
        DispatchResult {
            action: job.action.id.clone(),
            session: job.intent.session.clone(),
            status,
            latency: started.elapsed(),
            attempts,
            error,
        }
    }

    /// Send one binding, retrying once on a missing acknowledgment.
    async fn fire(
        &self,
        job: &Job,
        binding: &TriggerBinding,
        attempts: &mut u32,
    ) -> Result<(), (DispatchStatus, YueliError)> {
        let timeout = self.config.ack_timeout();
        let what = format!("hotkey `{}`", binding.hotkey);

        for attempt in 1..=MAX_ATTEMPTS {
            *attempts += 1;
            match tokio::time::timeout(timeout, self.target.trigger(binding)).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => {
                    tracing::error!(action = %job.action.id, hotkey = %binding.hotkey, "Trigger failed: {}", e);
                    return Err((
                        DispatchStatus::Failed,
                        YueliError::Unavailable {
                            what,
                            reason: e.to_string(),
                        },
                    ));
                }
                Err(_) if attempt < MAX_ATTEMPTS => {
                    PipelineCounters::bump(&self.counters.dispatch_retries);
                    tracing::warn!(
                        action = %job.action.id,
                        hotkey = %binding.hotkey,
                        "No acknowledgment within {:?}, retrying",
                        timeout
                    );
                }
                Err(_) => {}
            }
        }

        Err((
            DispatchStatus::Timeout,
            YueliError::TransientDevice {
                what,
                timeout_ms: timeout.as_millis() as u64,
            },
        ))
    }

    fn count(&self, result: &DispatchResult) {
        let c = &self.counters;
        match result.status {
            DispatchStatus::Acked => {
                PipelineCounters::bump(&c.dispatch_acked);
                tracing::debug!(session = %result.session, action = %result.action, latency = ?result.latency, "Action acknowledged");
            }
            DispatchStatus::Timeout => {
                PipelineCounters::bump(&c.dispatch_timeouts);
                tracing::warn!(session = %result.session, action = %result.action, "Action timed out");
            }
            DispatchStatus::Failed => {
                PipelineCounters::bump(&c.dispatch_failed);
                tracing::warn!(session = %result.session, action = %result.action, "Action failed");
            }
            DispatchStatus::Cancelled => PipelineCounters::bump(&c.dispatch_cancelled),
        }
    }
}
