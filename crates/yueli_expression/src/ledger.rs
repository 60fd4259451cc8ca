//! Action history shared by the decision engine and the dispatcher.
//!
//! Per session the ledger remembers, for each action: when its last dispatch
//! result arrived, when it was last selected, whether a selection is still
//! outstanding (the optimistic cooldown reservation), and how many results in
//! a row were failures. Globally it tracks which exclusivity groups have an
//! intent in flight.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use yueli_core::{DispatchResult, DispatchStatus, SessionId};

#[derive(Debug, Default, Clone)]
struct ActionHistory {
    last_result: Option<Instant>,
    last_selected: Option<Instant>,
    reserved: bool,
    consecutive_failures: u32,
}

/// History of one session. Holding its lock serializes decisions for the
/// session.
#[derive(Debug, Default)]
pub struct SessionBook {
    actions: HashMap<String, ActionHistory>,
}

impl SessionBook {
    /// Reserved, or still inside `cooldown` of its last result.
    pub fn is_cooling(&self, action: &str, cooldown: Duration, now: Instant) -> bool {
        match self.actions.get(action) {
            Some(h) => h.reserved || within(h.last_result, cooldown, now),
            None => false,
        }
    }

    pub fn since_last_use(&self, action: &str, now: Instant) -> Option<Duration> {
        self.actions
            .get(action)
            .and_then(|h| h.last_selected)
            .map(|t| now.saturating_duration_since(t))
    }

    pub fn consecutive_failures(&self, action: &str) -> u32 {
        self.actions
            .get(action)
            .map(|h| h.consecutive_failures)
            .unwrap_or(0)
    }

    pub fn reserve(&mut self, action: &str, now: Instant) {
        let h = self.actions.entry(action.to_string()).or_default();
        h.reserved = true;
        h.last_selected = Some(now);
    }

    fn release(&mut self, action: &str) -> bool {
        match self.actions.get_mut(action) {
            Some(h) if h.reserved => {
                h.reserved = false;
                true
            }
            _ => false,
        }
    }
}

fn within(at: Option<Instant>, window: Duration, now: Instant) -> bool {
    at.is_some_and(|t| now.saturating_duration_since(t) < window)
}

#[derive(Debug, Default)]
pub struct ActionLedger {
    books: RwLock<HashMap<SessionId, Arc<Mutex<SessionBook>>>>,
    busy_groups: Mutex<HashSet<String>>,
}

impl ActionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// The session's book, created on first use.
    pub async fn book(&self, session: &SessionId) -> Arc<Mutex<SessionBook>> {
        if let Some(book) = self.books.read().await.get(session) {
            return Arc::clone(book);
        }
        let mut books = self.books.write().await;
        Arc::clone(books.entry(session.clone()).or_default())
    }

    async fn existing(&self, session: &SessionId) -> Option<Arc<Mutex<SessionBook>>> {
        self.books.read().await.get(session).cloned()
    }

    /// Give back a reservation whose intent never produced a result.
    pub async fn release(&self, session: &SessionId, action: &str) {
        if let Some(book) = self.existing(session).await {
            if book.lock().await.release(action) {
                tracing::debug!(session = %session, action, "Cooldown reservation released");
            }
        }
    }

    /// Book a dispatch result: starts the cooldown window and updates the
    /// failure streak. Results for sessions already torn down are ignored.
    pub async fn record(&self, result: &DispatchResult) {
        let Some(book) = self.existing(&result.session).await else {
            return;
        };
        let mut book = book.lock().await;
        let h = book.actions.entry(result.action.clone()).or_default();
        h.reserved = false;
        if !result.status.was_attempted() {
            return;
        }
        h.last_result = Some(Instant::now());
        match result.status {
            DispatchStatus::Acked => h.consecutive_failures = 0,
            s if s.is_failure() => h.consecutive_failures += 1,
            _ => {}
        }
    }

    /// A failure reported after the result, e.g. its reaction sound could not
    /// be delivered.
    pub async fn note_failure(&self, session: &SessionId, action: &str) {
        if let Some(book) = self.existing(session).await {
            let mut book = book.lock().await;
            book.actions.entry(action.to_string()).or_default().consecutive_failures += 1;
        }
    }

    /// Whether the action's last result for this session is younger than
    /// `cooldown`. Reservations do not count.
    pub async fn in_result_cooldown(&self, session: &SessionId, action: &str, cooldown: Duration) -> bool {
        let Some(book) = self.existing(session).await else {
            return false;
        };
        let book = book.lock().await;
        book.actions
            .get(action)
            .is_some_and(|h| within(h.last_result, cooldown, Instant::now()))
    }

    pub async fn consecutive_failures(&self, session: &SessionId, action: &str) -> u32 {
        match self.existing(session).await {
            Some(book) => book.lock().await.consecutive_failures(action),
            None => 0,
        }
    }

    pub async fn busy_groups(&self) -> HashSet<String> {
        self.busy_groups.lock().await.clone()
    }

    pub async fn group_busy(&self, group: &str) -> bool {
        self.busy_groups.lock().await.contains(group)
    }

    pub async fn enter_group(&self, group: &str) {
        self.busy_groups.lock().await.insert(group.to_string());
    }

    pub async fn leave_group(&self, group: &str) {
        self.busy_groups.lock().await.remove(group);
    }

    pub async fn has_session(&self, session: &SessionId) -> bool {
        self.books.read().await.contains_key(session)
    }

    /// Forget everything about a session, outstanding reservations included.
    pub async fn drop_session(&self, session: &SessionId) -> bool {
        self.books.write().await.remove(session).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(session: &str, action: &str, status: DispatchStatus) -> DispatchResult {
        DispatchResult {
            action: action.into(),
            session: SessionId::from(session),
            status,
            latency: Duration::from_millis(5),
            attempts: 1,
            error: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reservation_blocks_until_released() {
        let ledger = ActionLedger::new();
        let session = SessionId::from("room");
        let cooldown = Duration::from_secs(5);

        let book = ledger.book(&session).await;
        book.lock().await.reserve("angry", Instant::now());
        assert!(book.lock().await.is_cooling("angry", cooldown, Instant::now()));

        ledger.release(&session, "angry").await;
        assert!(!book.lock().await.is_cooling("angry", cooldown, Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_starts_cooldown() {
        let ledger = ActionLedger::new();
        let session = SessionId::from("room");
        let cooldown = Duration::from_secs(5);

        let book = ledger.book(&session).await;
        book.lock().await.reserve("angry", Instant::now());
        ledger.record(&result("room", "angry", DispatchStatus::Acked)).await;

        assert!(ledger.in_result_cooldown(&session, "angry", cooldown).await);
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(book.lock().await.is_cooling("angry", cooldown, Instant::now()));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!book.lock().await.is_cooling("angry", cooldown, Instant::now()));
        assert!(!ledger.in_result_cooldown(&session, "angry", cooldown).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_result_also_cools_down() {
        let ledger = ActionLedger::new();
        let session = SessionId::from("room");
        ledger.book(&session).await;
        ledger.record(&result("room", "angry", DispatchStatus::Timeout)).await;
        assert!(ledger.in_result_cooldown(&session, "angry", Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_failure_streak_resets_on_ack() {
        let ledger = ActionLedger::new();
        let session = SessionId::from("room");
        ledger.book(&session).await;

        ledger.record(&result("room", "angry", DispatchStatus::Failed)).await;
        ledger.record(&result("room", "angry", DispatchStatus::Timeout)).await;
        ledger.note_failure(&session, "angry").await;
        assert_eq!(ledger.consecutive_failures(&session, "angry").await, 3);

        ledger.record(&result("room", "angry", DispatchStatus::Acked)).await;
        assert_eq!(ledger.consecutive_failures(&session, "angry").await, 0);
    }

    #[tokio::test]
    async fn test_cancelled_result_only_releases() {
        let ledger = ActionLedger::new();
        let session = SessionId::from("room");
        let book = ledger.book(&session).await;
        book.lock().await.reserve("angry", Instant::now());

        ledger.record(&result("room", "angry", DispatchStatus::Cancelled)).await;
        assert!(!ledger.in_result_cooldown(&session, "angry", Duration::from_secs(60)).await);
        assert!(!book
            .lock()
            .await
            .is_cooling("angry", Duration::from_secs(60), Instant::now()));
    }

    #[tokio::test]
    async fn test_results_for_dropped_session_are_ignored() {
        let ledger = ActionLedger::new();
        let session = SessionId::from("room");
        ledger.book(&session).await;
        assert!(ledger.drop_session(&session).await);

        ledger.record(&result("room", "angry", DispatchStatus::Acked)).await;
        assert!(!ledger.in_result_cooldown(&session, "angry", Duration::from_secs(60)).await);
        assert!(!ledger.drop_session(&session).await);
    }

    #[tokio::test]
    async fn test_groups() {
        let ledger = ActionLedger::new();
        assert!(!ledger.group_busy("face").await);
        ledger.enter_group("face").await;
        assert!(ledger.group_busy("face").await);
        assert_eq!(ledger.busy_groups().await.len(), 1);
        ledger.leave_group("face").await;
        assert!(!ledger.group_busy("face").await);
    }
}
