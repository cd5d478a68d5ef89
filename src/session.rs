//! Per-customer conversational state.
//!
//! One session per customer, stored as a single JSON blob under
//! `session:{customerId}` with a reverse index `session-index:{sessionId}`
//! for O(1) lookup by session id. Both keys share one TTL and are written in
//! one atomic multi-set so they never diverge.
//!
//! Reads never rewrite: only actual mutations (state change, message append,
//! entity update) go through `update`, which is the single place that
//! refreshes the TTL and truncates history. Concurrent writers are caught by
//! the optimistic `version` field.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SessionSettings;
use crate::entities::ExtractedInfo;
use crate::error::{CoreError, CoreResult};
use crate::intent::Intent;
use crate::store::KvStore;
use crate::types::MessageContent;

// ─── Keys ───────────────────────────────────────────────────────────────────

fn session_key(customer_id: &str) -> String {
    format!("session:{customer_id}")
}

fn index_key(session_id: &str) -> String {
    format!("session-index:{session_id}")
}

// ─── Model ──────────────────────────────────────────────────────────────────

/// Session lifecycle state. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    New,
    Active,
    Idle,
    WaitingAgent,
    Closed,
}

impl SessionState {
    /// Whether `self -> to` is a legal move. Self-transitions always are.
    pub fn can_transition(self, to: SessionState) -> bool {
        use SessionState::*;
        if self == to {
            return true;
        }
        matches!(
            (self, to),
            (New, Active)
                | (Active, Idle)
                | (Active, WaitingAgent)
                | (Active, Closed)
                | (Idle, Active)
                | (Idle, Closed)
                | (WaitingAgent, Active)
                | (WaitingAgent, Closed)
        )
    }
}

/// Who authored a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    Agent,
}

/// One entry in the bounded message history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    pub role: MessageRole,
    pub content: MessageContent,
    /// Epoch milliseconds, UTC.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl SessionMessage {
    pub fn text(role: MessageRole, body: impl Into<String>) -> Self {
        SessionMessage {
            role,
            content: MessageContent::Text { body: body.into() },
            timestamp: Utc::now().timestamp_millis(),
            message_id: None,
        }
    }

    /// The textual body, if this entry is a text message.
    pub fn text_body(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text { body } => Some(body),
            _ => None,
        }
    }
}

/// The per-customer conversational state container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    /// Canonical customer phone.
    pub customer_id: String,
    pub agent_id: String,
    /// Epoch milliseconds, UTC.
    pub start_time: i64,
    pub state: SessionState,
    #[serde(default)]
    pub message_history: Vec<SessionMessage>,
    #[serde(default)]
    pub extracted_info: ExtractedInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_intent: Option<Intent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_topic: Option<String>,
    /// Epoch milliseconds, UTC. Monotonically non-decreasing.
    pub last_activity: i64,
    /// Detected language: "ar", "en", or "mixed".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_preference: Option<String>,
    /// Opaque viewing-scheduling sub-state carried across turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduling: Option<serde_json::Value>,
    /// Optimistic-concurrency counter, bumped on every persisted write.
    #[serde(default)]
    pub version: u64,
}

impl Session {
    fn new(customer_id: &str, agent_id: &str) -> Self {
        let now = Utc::now().timestamp_millis();
        Session {
            session_id: Uuid::new_v4().to_string(),
            customer_id: customer_id.to_string(),
            agent_id: agent_id.to_string(),
            start_time: now,
            state: SessionState::New,
            message_history: Vec::new(),
            extracted_info: ExtractedInfo::default(),
            current_intent: None,
            current_topic: None,
            last_activity: now,
            language_preference: None,
            scheduling: None,
            version: 0,
        }
    }

    /// The last `n` user-authored text messages, oldest first.
    pub fn recent_user_texts(&self, n: usize) -> Vec<&str> {
        let mut texts: Vec<&str> = self
            .message_history
            .iter()
            .rev()
            .filter(|m| m.role == MessageRole::User)
            .filter_map(|m| m.text_body())
            .take(n)
            .collect();
        texts.reverse();
        texts
    }
}

// ─── Store ──────────────────────────────────────────────────────────────────

/// Durable session store over the shared KV capability.
pub struct SessionStore {
    store: Arc<dyn KvStore>,
    settings: SessionSettings,
}

impl SessionStore {
    pub fn new(store: Arc<dyn KvStore>, settings: SessionSettings) -> Self {
        SessionStore { store, settings }
    }

    /// Load the customer's open session, or create one in `New` state.
    ///
    /// Creation is in-memory only; a read must not write. The fresh session
    /// first hits the store when the worker persists its mutations.
    pub async fn get(&self, customer_id: &str, agent_id: &str) -> CoreResult<Session> {
        match self.store.get(&session_key(customer_id)).await? {
            Some(blob) => Ok(serde_json::from_str(&blob)?),
            None => Ok(Session::new(customer_id, agent_id)),
        }
    }

    /// O(1) lookup by session id via the reverse index.
    pub async fn get_by_session_id(&self, session_id: &str) -> CoreResult<Session> {
        let customer_id = self
            .store
            .get(&index_key(session_id))
            .await?
            .ok_or_else(|| CoreError::not_found("session", session_id))?;
        let blob = self
            .store
            .get(&session_key(&customer_id))
            .await?
            .ok_or_else(|| CoreError::not_found("session", session_id))?;
        Ok(serde_json::from_str(&blob)?)
    }

    /// Persist the session: one atomic write of blob + reverse index, TTL
    /// refreshed, history truncated to the ring size, version bumped.
    ///
    /// Fails with `VersionConflict` when another worker persisted a newer
    /// blob since this one was loaded.
    pub async fn update(&self, session: &mut Session) -> CoreResult<()> {
        if let Some(blob) = self.store.get(&session_key(&session.customer_id)).await? {
            let stored: Session = serde_json::from_str(&blob)?;
            if stored.version != session.version {
                return Err(CoreError::VersionConflict {
                    customer_id: session.customer_id.clone(),
                    stored: stored.version,
                    ours: session.version,
                });
            }
        }

        // Only update may truncate; size <= max_history after any persist.
        let max = self.settings.max_history;
        if session.message_history.len() > max {
            let excess = session.message_history.len() - max;
            session.message_history.drain(..excess);
        }

        // last_activity never goes backwards.
        session.last_activity = session.last_activity.max(Utc::now().timestamp_millis());
        session.version += 1;

        let blob = serde_json::to_string(session)?;
        self.store
            .mset_ex(
                &[
                    (session_key(&session.customer_id), blob),
                    (
                        index_key(&session.session_id),
                        session.customer_id.clone(),
                    ),
                ],
                self.settings.timeout,
            )
            .await
    }

    /// Append a message to the in-memory history. Persisted by `update`.
    pub fn add_message(&self, session: &mut Session, message: SessionMessage) {
        session.last_activity = session.last_activity.max(message.timestamp);
        session.message_history.push(message);
    }

    /// Validate and apply a state transition in memory. Persisted by `update`.
    pub fn update_state(&self, session: &mut Session, to: SessionState) -> CoreResult<()> {
        if !session.state.can_transition(to) {
            return Err(CoreError::InvalidTransition {
                from: session.state,
                to,
            });
        }
        session.state = to;
        Ok(())
    }

    /// Record the classified intent (and topic) in memory.
    pub fn update_intent(&self, session: &mut Session, intent: Intent) {
        session.current_intent = Some(intent);
        session.current_topic = Some(intent.topic().to_string());
    }

    /// Close and destroy a session by id.
    pub async fn close(&self, session_id: &str) -> CoreResult<()> {
        let mut session = self.get_by_session_id(session_id).await?;
        self.update_state(&mut session, SessionState::Closed)?;
        self.store.del(&session_key(&session.customer_id)).await?;
        self.store.del(&index_key(session_id)).await?;
        Ok(())
    }

    /// Sweep `Active` sessions whose `last_activity` is older than the
    /// session timeout into `Idle`. Returns the number transitioned.
    pub async fn check_idle_sessions(&self) -> CoreResult<usize> {
        let keys = self.store.scan_match("session:*").await?;
        let threshold_ms = self.settings.timeout.as_millis() as i64;
        let now = Utc::now().timestamp_millis();
        let mut idled = 0usize;

        for key in keys {
            // The reverse index shares the "session" prefix family; only the
            // blob keys are scanned here.
            if key.starts_with("session-index:") {
                continue;
            }
            let Some(blob) = self.store.get(&key).await? else {
                continue;
            };
            let mut session: Session = match serde_json::from_str(&blob) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "skipping unreadable session blob");
                    continue;
                }
            };
            if session.state == SessionState::Active && now - session.last_activity > threshold_ms
            {
                self.update_state(&mut session, SessionState::Idle)?;
                if let Err(e) = self.update(&mut session).await {
                    tracing::warn!(
                        customer = %session.customer_id,
                        error = %e,
                        "idle sweep failed to persist transition"
                    );
                    continue;
                }
                idled += 1;
            }
        }

        if idled > 0 {
            tracing::info!(count = idled, "idle sweep transitioned sessions");
        }
        Ok(idled)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn test_store() -> SessionStore {
        SessionStore::new(Arc::new(MemoryStore::new()), SessionSettings::default())
    }

    fn small_history_store(max_history: usize) -> SessionStore {
        SessionStore::new(
            Arc::new(MemoryStore::new()),
            SessionSettings {
                max_history,
                ..SessionSettings::default()
            },
        )
    }

    #[tokio::test]
    async fn test_get_creates_new_without_writing() {
        let store = test_store();
        let session = store.get("+20100", "agent-1").await.unwrap();
        assert_eq!(session.state, SessionState::New);

        // A read must not persist anything.
        let again = store.get("+20100", "agent-1").await.unwrap();
        assert_ne!(session.session_id, again.session_id);
    }

    #[tokio::test]
    async fn test_update_persists_and_indexes() {
        let store = test_store();
        let mut session = store.get("+20100", "agent-1").await.unwrap();
        store.update_state(&mut session, SessionState::Active).unwrap();
        store.update(&mut session).await.unwrap();

        let loaded = store.get("+20100", "agent-1").await.unwrap();
        assert_eq!(loaded.session_id, session.session_id);
        assert_eq!(loaded.state, SessionState::Active);

        let via_index = store.get_by_session_id(&session.session_id).await.unwrap();
        assert_eq!(via_index.customer_id, "+20100");
    }

    #[tokio::test]
    async fn test_history_bounded_by_update() {
        let store = small_history_store(3);
        let mut session = store.get("+20100", "agent-1").await.unwrap();
        for i in 0..6 {
            store.add_message(
                &mut session,
                SessionMessage::text(MessageRole::User, format!("msg {i}")),
            );
        }
        assert_eq!(session.message_history.len(), 6);

        store.update(&mut session).await.unwrap();
        assert_eq!(session.message_history.len(), 3);
        // Oldest evicted first.
        assert_eq!(session.message_history[0].text_body(), Some("msg 3"));
    }

    #[tokio::test]
    async fn test_closed_is_terminal() {
        let store = test_store();
        let mut session = store.get("+20100", "agent-1").await.unwrap();
        store.update_state(&mut session, SessionState::Active).unwrap();
        store.update_state(&mut session, SessionState::Closed).unwrap();

        let err = store
            .update_state(&mut session, SessionState::Active)
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
    }

    #[test]
    fn test_transition_table() {
        use SessionState::*;
        assert!(New.can_transition(Active));
        assert!(!New.can_transition(Idle));
        assert!(Active.can_transition(Idle));
        assert!(Active.can_transition(WaitingAgent));
        assert!(Active.can_transition(Closed));
        assert!(Idle.can_transition(Active));
        assert!(Idle.can_transition(Closed));
        assert!(!Idle.can_transition(WaitingAgent));
        assert!(WaitingAgent.can_transition(Active));
        assert!(WaitingAgent.can_transition(Closed));
        assert!(!Closed.can_transition(Active));
        // Self-transitions always legal.
        assert!(Closed.can_transition(Closed));
        assert!(Active.can_transition(Active));
    }

    #[tokio::test]
    async fn test_version_conflict_detected() {
        let store = test_store();
        let mut first = store.get("+20100", "agent-1").await.unwrap();
        store.update_state(&mut first, SessionState::Active).unwrap();
        store.update(&mut first).await.unwrap();

        let mut a = store.get("+20100", "agent-1").await.unwrap();
        let mut b = store.get("+20100", "agent-1").await.unwrap();

        store.add_message(&mut a, SessionMessage::text(MessageRole::User, "hi"));
        store.update(&mut a).await.unwrap();

        store.add_message(&mut b, SessionMessage::text(MessageRole::User, "race"));
        let err = store.update(&mut b).await.unwrap_err();
        assert!(matches!(err, CoreError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn test_idle_sweep_transitions_stale_active() {
        let store = SessionStore::new(
            Arc::new(MemoryStore::new()),
            SessionSettings {
                timeout: Duration::from_secs(1800),
                ..SessionSettings::default()
            },
        );
        let mut session = store.get("+20100", "agent-1").await.unwrap();
        store.update_state(&mut session, SessionState::Active).unwrap();
        store.update(&mut session).await.unwrap();

        // Age the persisted blob past the threshold by hand.
        let mut stale = store.get("+20100", "agent-1").await.unwrap();
        stale.last_activity = Utc::now().timestamp_millis() - 31 * 60 * 1000;
        let blob = serde_json::to_string(&stale).unwrap();
        let kv = MemoryStore::new();
        kv.set_ex("session:+20100", &blob, Duration::from_secs(1800))
            .await
            .unwrap();
        let store = SessionStore::new(Arc::new(kv), SessionSettings::default());

        let idled = store.check_idle_sessions().await.unwrap();
        assert_eq!(idled, 1);
        let after = store.get("+20100", "agent-1").await.unwrap();
        assert_eq!(after.state, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_last_activity_monotonic() {
        let store = test_store();
        let mut session = store.get("+20100", "agent-1").await.unwrap();
        let past = SessionMessage {
            role: MessageRole::User,
            content: MessageContent::Text { body: "old".into() },
            timestamp: 1_000,
            message_id: None,
        };
        let before = session.last_activity;
        store.add_message(&mut session, past);
        assert_eq!(session.last_activity, before);
    }

    #[tokio::test]
    async fn test_close_destroys_both_keys() {
        let store = test_store();
        let mut session = store.get("+20100", "agent-1").await.unwrap();
        store.update_state(&mut session, SessionState::Active).unwrap();
        store.update(&mut session).await.unwrap();

        store.close(&session.session_id).await.unwrap();
        let fresh = store.get("+20100", "agent-1").await.unwrap();
        assert_eq!(fresh.state, SessionState::New);
        assert!(store.get_by_session_id(&session.session_id).await.is_err());
    }
}
