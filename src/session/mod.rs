//! Session Store: live session records, the lifecycle state machine, and
//! the idle-timeout sweep.
//!
//! Grounded on the `other_examples` session manager's
//! `Arc<RwLock<HashMap<String, SessionEntry>>>` + "check-and-insert under
//! one write-lock" shape, adapted to `dashmap` for the same per-key critical
//! section discipline used by [`crate::rate_limit::RateLimiter`]: the Store
//! is process-wide mutable state, guarded by its own critical section, and
//! no other component reaches into it directly.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::rate_limit::Tier;

/// Globally unique session identifier.
pub type SessionId = Uuid;

/// Lifecycle state. Transitions follow:
///
/// ```text
/// CREATING ──► RUNNING ──► DESTROYING ──► DESTROYED
///       │                        ▲
///       └────────────────────────┘  (create failure)
/// RUNNING ──► EXPIRED  (idle reaper)
/// ```
///
/// `DESTROYED` and `EXPIRED` are terminal and sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Container is being provisioned.
    Creating,
    /// Session is live and attachable.
    Running,
    /// Teardown in progress.
    Destroying,
    /// Terminal: explicitly destroyed.
    Destroyed,
    /// Terminal: reaped for inactivity.
    Expired,
}

impl SessionState {
    /// Whether this state is terminal (sticky — no further transitions out).
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Destroyed | SessionState::Expired)
    }

    fn can_transition_to(self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Creating, Running)
                | (Creating, Destroyed) // create-failure rollback
                | (Running, Destroying)
                | (Running, Expired)
                | (Destroying, Destroyed)
        )
    }
}

/// A live (or just-torn-down) sandbox session.
#[derive(Debug, Clone)]
pub struct Session {
    /// Globally unique id.
    pub id: SessionId,
    /// Opaque content-domain label; affects only welcome banner and container labels.
    pub tool_pair: String,
    /// Environment name this session was created with.
    pub environment: String,
    /// Runtime-opaque container handle. `None` only while `Creating`.
    pub container_id: Option<String>,
    /// Tracking identity: user id for authenticated, client ip otherwise.
    pub owner_key: String,
    /// Identity class for rate-limit and authorization purposes.
    pub tier: Tier,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the most recent inbound activity. Always `>= created_at`.
    pub last_activity_at: DateTime<Utc>,
    /// Idle timeout in milliseconds before the reaper expires this session.
    pub timeout_ms: u64,
}

impl Session {
    /// Whether `now - last_activity_at >= timeout_ms`.
    pub fn is_idle(&self, now: DateTime<Utc>) -> bool {
        let elapsed = now
            .signed_duration_since(self.last_activity_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        elapsed >= Duration::from_millis(self.timeout_ms)
    }
}

/// Session Store errors.
#[derive(Debug, Error)]
pub enum SessionStoreError {
    /// No session exists for the given id, or it is in a terminal state
    /// (terminal sessions are not observable by id — see the data-model
    /// invariant in the external contract).
    #[error("session not found: {0}")]
    NotFound(SessionId),
    /// The requested `from -> to` transition is not in the state graph.
    #[error("invalid transition for session {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        /// Session the transition was attempted on.
        id: SessionId,
        /// Observed current state.
        from: SessionState,
        /// Requested new state.
        to: SessionState,
    },
}

/// Aggregate counts by state, for the admin/health surface.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    /// Total sessions currently tracked (including terminal ones not yet pruned).
    pub total: usize,
    /// Count per state.
    pub by_state: HashMap<&'static str, usize>,
}

/// Indexed set of live sessions.
///
/// A session in a terminal state (`Destroyed`/`Expired`) is pruned from the
/// map entirely on its final transition, so "observable from the Store by id
/// iff its state is non-terminal" holds by construction rather than by a
/// visibility filter.
pub struct SessionStore {
    sessions: dashmap::DashMap<SessionId, Session>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    /// Construct an empty store.
    pub fn new() -> Self {
        Self {
            sessions: dashmap::DashMap::new(),
        }
    }

    /// Insert a newly created session. Overwrites nothing — callers are
    /// expected to pass a fresh id.
    pub fn create(&self, session: Session) {
        self.sessions.insert(session.id, session);
    }

    /// Fetch a session snapshot by id.
    ///
    /// # Errors
    ///
    /// Returns [`SessionStoreError::NotFound`] if absent.
    pub fn get(&self, id: SessionId) -> Result<Session, SessionStoreError> {
        self.sessions
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(SessionStoreError::NotFound(id))
    }

    /// Bump `last_activity_at` to `now`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionStoreError::NotFound`] if absent.
    pub fn update_activity(&self, id: SessionId, now: DateTime<Utc>) -> Result<(), SessionStoreError> {
        let mut entry = self.sessions.get_mut(&id).ok_or(SessionStoreError::NotFound(id))?;
        entry.last_activity_at = now;
        Ok(())
    }

    /// Attempt a state transition, validated against the lifecycle graph.
    /// A session that lands in a terminal state is pruned from the map.
    ///
    /// # Errors
    ///
    /// Returns [`SessionStoreError::NotFound`] if absent, or
    /// [`SessionStoreError::InvalidTransition`] if `from` doesn't match the
    /// recorded state or the edge isn't in the graph.
    pub fn transition_state(
        &self,
        id: SessionId,
        from: SessionState,
        to: SessionState,
    ) -> Result<(), SessionStoreError> {
        let mut entry = self.sessions.get_mut(&id).ok_or(SessionStoreError::NotFound(id))?;

        if entry.state != from || !from.can_transition_to(to) {
            return Err(SessionStoreError::InvalidTransition {
                id,
                from: entry.state,
                to,
            });
        }
        entry.state = to;
        let is_terminal = to.is_terminal();
        drop(entry);
        if is_terminal {
            self.sessions.remove(&id);
        }
        Ok(())
    }

    /// Remove a session outright, regardless of state. Used for direct
    /// cleanup paths (e.g. compensating a failed create).
    pub fn remove(&self, id: SessionId) {
        self.sessions.remove(&id);
    }

    /// Snapshot every tracked (non-terminal, by construction) session.
    pub fn list(&self) -> Vec<Session> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    /// Count of currently tracked sessions.
    pub fn container_count(&self) -> u32 {
        self.sessions.len() as u32
    }

    /// Aggregate stats by state.
    pub fn stats(&self) -> SessionStats {
        let mut by_state = HashMap::new();
        for entry in self.sessions.iter() {
            let key = match entry.state {
                SessionState::Creating => "creating",
                SessionState::Running => "running",
                SessionState::Destroying => "destroying",
                SessionState::Destroyed => "destroyed",
                SessionState::Expired => "expired",
            };
            *by_state.entry(key).or_insert(0) += 1;
        }
        SessionStats {
            total: self.sessions.len(),
            by_state,
        }
    }

    /// Scan `Running` sessions for idle timeout and transition each to
    /// `Expired`, returning the sessions that were reaped (pre-transition
    /// snapshot, with `id` still valid for teardown). Never removes
    /// `Destroying` sessions — the Coordinator already owns their teardown.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<Session> {
        let expired_ids: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|e| e.state == SessionState::Running && e.is_idle(now))
            .map(|e| e.id)
            .collect();

        let mut reaped = Vec::new();
        for id in expired_ids {
            if let Some(mut entry) = self.sessions.get_mut(&id) {
                if entry.state == SessionState::Running {
                    let snapshot = entry.value().clone();
                    entry.state = SessionState::Expired;
                    reaped.push(snapshot);
                }
            }
        }
        for session in &reaped {
            self.sessions.remove(&session.id);
        }
        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_session(state: SessionState, timeout_ms: u64) -> Session {
        let now = Utc::now();
        Session {
            id: Uuid::new_v4(),
            tool_pair: "jj-git".to_string(),
            environment: "bash".to_string(),
            container_id: Some("c1".to_string()),
            owner_key: "ip:198.51.100.7".to_string(),
            tier: Tier::Anonymous,
            state,
            created_at: now,
            last_activity_at: now,
            timeout_ms,
        }
    }

    #[test]
    fn test_create_and_get() {
        let store = SessionStore::new();
        let session = new_session(SessionState::Running, 60_000);
        let id = session.id;
        store.create(session);
        assert_eq!(store.get(id).unwrap().state, SessionState::Running);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let store = SessionStore::new();
        assert!(matches!(
            store.get(Uuid::new_v4()),
            Err(SessionStoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_valid_transition_sequence() {
        let store = SessionStore::new();
        let session = new_session(SessionState::Creating, 60_000);
        let id = session.id;
        store.create(session);

        store
            .transition_state(id, SessionState::Creating, SessionState::Running)
            .unwrap();
        store
            .transition_state(id, SessionState::Running, SessionState::Destroying)
            .unwrap();
        store
            .transition_state(id, SessionState::Destroying, SessionState::Destroyed)
            .unwrap();

        assert!(matches!(store.get(id), Err(SessionStoreError::NotFound(_))));
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let store = SessionStore::new();
        let session = new_session(SessionState::Creating, 60_000);
        let id = session.id;
        store.create(session);

        let result = store.transition_state(id, SessionState::Creating, SessionState::Destroying);
        assert!(matches!(
            result,
            Err(SessionStoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_terminal_state_is_pruned_from_store() {
        let store = SessionStore::new();
        let session = new_session(SessionState::Running, 60_000);
        let id = session.id;
        store.create(session);
        store
            .transition_state(id, SessionState::Running, SessionState::Expired)
            .unwrap();
        assert!(matches!(store.get(id), Err(SessionStoreError::NotFound(_))));
    }

    #[test]
    fn test_sweep_expired_only_touches_idle_running_sessions() {
        let store = SessionStore::new();
        let now = Utc::now();

        let mut idle = new_session(SessionState::Running, 1);
        idle.last_activity_at = now - chrono::Duration::seconds(5);
        let idle_id = idle.id;

        let mut fresh = new_session(SessionState::Running, 60_000);
        fresh.last_activity_at = now;

        let destroying = new_session(SessionState::Destroying, 1);
        let destroying_id = destroying.id;

        store.create(idle);
        store.create(fresh);
        store.create(destroying);

        let reaped = store.sweep_expired(now);
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].id, idle_id);
        assert!(matches!(store.get(idle_id), Err(SessionStoreError::NotFound(_))));
        // Destroying session untouched by the reaper.
        assert!(store.get(destroying_id).is_ok());
    }

    #[test]
    fn test_container_count_and_stats() {
        let store = SessionStore::new();
        store.create(new_session(SessionState::Running, 60_000));
        store.create(new_session(SessionState::Creating, 60_000));
        assert_eq!(store.container_count(), 2);
        let stats = store.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_state.get("running"), Some(&1));
        assert_eq!(stats.by_state.get("creating"), Some(&1));
    }
}
