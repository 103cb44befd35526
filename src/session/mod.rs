//! Session State Types
//!
//! One session per user, at most one active (non-terminal) at a time.
//! The session records the workflow subject being worked on, a free-form
//! metadata bag for in-flight flags, and timestamps driving the
//! inactivity timeout. Transition records are append-only and retained
//! independently of their parent session for audit.

pub mod store;

pub use store::{resolve_duplicate_actives, InMemorySessionStore, SessionStore};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Workflow state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    SubjectSelection,
    AwaitingAction,
    CollectingData,
    ConfirmationPending,
    Completed,
    Abandoned,
}

impl SessionState {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Abandoned)
    }

    /// Partition used to bias (or refuse to bias) intent classification.
    ///
    /// Only ACTIVE states may push the classifier toward "continue the
    /// current workflow". In an IDLE state the user has been shown
    /// options but committed to nothing, and is free to state an
    /// entirely new intent; biasing there misattributes intent.
    pub fn class(self) -> StateClass {
        match self {
            SessionState::Idle | SessionState::SubjectSelection | SessionState::AwaitingAction => {
                StateClass::Idle
            }
            SessionState::CollectingData | SessionState::ConfirmationPending => StateClass::Active,
            // Terminal sessions should not reach the classifier, but the
            // unbiased answer is the safe one.
            SessionState::Completed | SessionState::Abandoned => StateClass::Idle,
        }
    }
}

/// IDLE vs ACTIVE partition of session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateClass {
    Idle,
    Active,
}

/// Why a session was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosureReason {
    Completed,
    Cancelled,
    TimedOut,
    /// Lost a duplicate-active race; a newer session is authoritative.
    Superseded,
    RecoveredOnStartup,
    ForceAbandoned,
}

/// A user's workflow session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub state: SessionState,
    /// The domain entity being worked on (e.g. task id).
    pub subject_id: Option<Uuid>,
    /// Parent container (e.g. project id).
    pub container_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// In-flight flags (pending patch, chosen action, ...).
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub closure_reason: Option<ClosureReason>,
    /// Optimistic-concurrency counter, bumped by the store on every
    /// committed write. A save carrying a stale version is rejected.
    #[serde(default)]
    pub version: i64,
}

impl Session {
    /// Create a new session in `Idle` with the given inactivity window.
    pub fn new(user_id: Uuid, inactivity_ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            state: SessionState::Idle,
            subject_id: None,
            container_id: None,
            created_at: now,
            last_activity_at: now,
            expires_at: now + ChronoDuration::from_std(inactivity_ttl).unwrap_or_default(),
            metadata: HashMap::new(),
            closure_reason: None,
            version: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Refresh the activity timestamps, pushing out the expiry.
    pub fn touch(&mut self, inactivity_ttl: Duration) {
        let now = Utc::now();
        self.last_activity_at = now;
        self.expires_at = now + ChronoDuration::from_std(inactivity_ttl).unwrap_or_default();
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.is_terminal() && now >= self.expires_at
    }

    /// Close the session into a terminal state.
    pub fn close(&mut self, state: SessionState, reason: ClosureReason) {
        debug_assert!(state.is_terminal());
        self.state = state;
        self.closure_reason = Some(reason);
        self.last_activity_at = Utc::now();
    }
}

/// Immutable record of one attempted transition. Appended for both
/// successful and rejected executions; never deleted with the session
/// (weak reference by session id, not ownership).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub session_id: Uuid,
    pub from_state: SessionState,
    pub to_state: SessionState,
    pub trigger: String,
    pub success: bool,
    pub error: Option<String>,
    pub context_snapshot: Value,
    pub correlation_id: Uuid,
    pub occurred_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_partition() {
        assert_eq!(SessionState::Idle.class(), StateClass::Idle);
        assert_eq!(SessionState::SubjectSelection.class(), StateClass::Idle);
        assert_eq!(SessionState::AwaitingAction.class(), StateClass::Idle);
        assert_eq!(SessionState::CollectingData.class(), StateClass::Active);
        assert_eq!(SessionState::ConfirmationPending.class(), StateClass::Active);
    }

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Completed.is_terminal());
        assert!(SessionState::Abandoned.is_terminal());
        assert!(!SessionState::CollectingData.is_terminal());
    }

    #[test]
    fn test_touch_extends_expiry() {
        let mut session = Session::new(Uuid::new_v4(), Duration::from_secs(7200));
        let original_expiry = session.expires_at;
        session.touch(Duration::from_secs(7200));
        assert!(session.expires_at >= original_expiry);
        assert!(!session.is_expired(Utc::now()));
    }

    #[test]
    fn test_expiry() {
        let mut session = Session::new(Uuid::new_v4(), Duration::from_secs(0));
        assert!(session.is_expired(Utc::now() + ChronoDuration::seconds(1)));

        session.close(SessionState::Completed, ClosureReason::Completed);
        // Terminal sessions are never "expired"; they are already closed.
        assert!(!session.is_expired(Utc::now() + ChronoDuration::seconds(1)));
    }
}
