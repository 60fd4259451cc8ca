use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use yueli_core::SessionId;

#[derive(Debug, Clone)]
struct SessionEntry {
    cancel: CancellationToken,
    gate: Arc<RwLock<()>>,
    started_at: DateTime<Utc>,
}

/// A running session's token and its teardown gate. Work on the session
/// holds the gate for reading; teardown takes it for writing, so it waits
/// for that work and nothing new starts once the token is cancelled.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub cancel: CancellationToken,
    pub gate: Arc<RwLock<()>>,
}

/// Live sessions and the cancellation token each one's work hangs off.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, or return the token of the one already running.
    pub async fn start(&self, session: &SessionId) -> CancellationToken {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.entry(session.clone()).or_insert_with(|| {
            tracing::info!(session = %session, "Session started");
            SessionEntry {
                cancel: CancellationToken::new(),
                gate: Arc::new(RwLock::new(())),
                started_at: Utc::now(),
            }
        });
        entry.cancel.clone()
    }

    pub async fn token(&self, session: &SessionId) -> Option<CancellationToken> {
        self.sessions.read().await.get(session).map(|e| e.cancel.clone())
    }

    pub async fn handle(&self, session: &SessionId) -> Option<SessionHandle> {
        self.sessions.read().await.get(session).map(|e| SessionHandle {
            cancel: e.cancel.clone(),
            gate: Arc::clone(&e.gate),
        })
    }

    pub async fn started_at(&self, session: &SessionId) -> Option<DateTime<Utc>> {
        self.sessions.read().await.get(session).map(|e| e.started_at)
    }

    /// Remove a session and cancel its token. `false` if it was not running.
    pub async fn end(&self, session: &SessionId) -> bool {
        match self.sessions.write().await.remove(session) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
