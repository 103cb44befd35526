//! Session Store
//!
//! Persistence boundary for sessions and their transition log. The
//! one-active-session-per-user invariant is enforced *structurally* by
//! the store, not by callers: `create` fails with `SessionRaceConflict`
//! if the user already has a non-terminal session. The in-memory
//! implementation checks and inserts inside one write-lock critical
//! section so racing creates cannot both succeed; the Postgres
//! implementation uses a partial unique index for the same guarantee.
//!
//! Session writes are serialized by an optimistic version counter:
//! `save` commits only when the caller's `version` matches the stored
//! one, so of two handlers racing on the same session exactly one
//! commits and the other gets [`EngineError::StaleSession`] and must
//! re-read.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ClosureReason, Session, SessionState, TransitionRecord};
use crate::error::EngineError;

/// Persistence contract for sessions and the transition log.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session. Fails with [`EngineError::SessionRaceConflict`]
    /// if the user already has a non-terminal session.
    async fn create(&self, session: Session) -> Result<Session, EngineError>;

    /// The user's current non-terminal session, if any.
    async fn find_active(&self, user_id: Uuid) -> Result<Option<Session>, EngineError>;

    async fn get(&self, session_id: Uuid) -> Result<Option<Session>, EngineError>;

    /// Persist an updated session (state write). Commits only when
    /// `session.version` matches the stored version and returns the
    /// session with the incremented version; a mismatch is
    /// [`EngineError::StaleSession`]. Inserts when the id is absent.
    async fn save(&self, session: &Session) -> Result<Session, EngineError>;

    /// Move a session into a terminal state with a recorded reason.
    async fn close(
        &self,
        session_id: Uuid,
        state: SessionState,
        reason: ClosureReason,
    ) -> Result<(), EngineError>;

    /// Append to the transition log. Records survive session closure.
    async fn append_transition(&self, record: TransitionRecord) -> Result<(), EngineError>;

    /// Full transition history for a session, in append order.
    async fn transitions(&self, session_id: Uuid) -> Result<Vec<TransitionRecord>, EngineError>;

    /// All non-terminal sessions (startup recovery, sweeper).
    async fn all_active(&self) -> Result<Vec<Session>, EngineError>;
}

/// In-memory store backed by tokio RwLocks.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<Uuid, Session>>,
    // Kept separately from sessions so closing or dropping a session
    // never cascades into the audit log.
    transition_log: RwLock<Vec<TransitionRecord>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, session: Session) -> Result<Session, EngineError> {
        let mut sessions = self.sessions.write().await;
        let conflict = sessions
            .values()
            .any(|s| s.user_id == session.user_id && !s.is_terminal());
        if conflict {
            return Err(EngineError::SessionRaceConflict(session.user_id));
        }
        sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn find_active(&self, user_id: Uuid) -> Result<Option<Session>, EngineError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .filter(|s| s.user_id == user_id && !s.is_terminal())
            .max_by_key(|s| s.last_activity_at)
            .cloned())
    }

    async fn get(&self, session_id: Uuid) -> Result<Option<Session>, EngineError> {
        Ok(self.sessions.read().await.get(&session_id).cloned())
    }

    async fn save(&self, session: &Session) -> Result<Session, EngineError> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&session.id) {
            if existing.version != session.version {
                return Err(EngineError::StaleSession(session.id));
            }
        }
        let mut updated = session.clone();
        updated.version += 1;
        sessions.insert(updated.id, updated.clone());
        Ok(updated)
    }

    async fn close(
        &self,
        session_id: Uuid,
        state: SessionState,
        reason: ClosureReason,
    ) -> Result<(), EngineError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&session_id)
            .ok_or(EngineError::SessionNotFound(session_id))?;
        session.close(state, reason);
        // Any in-flight handler holding the old version must CAS-miss
        // rather than resurrect a closed session.
        session.version += 1;
        Ok(())
    }

    async fn append_transition(&self, record: TransitionRecord) -> Result<(), EngineError> {
        self.transition_log.write().await.push(record);
        Ok(())
    }

    async fn transitions(&self, session_id: Uuid) -> Result<Vec<TransitionRecord>, EngineError> {
        let log = self.transition_log.read().await;
        Ok(log
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn all_active(&self) -> Result<Vec<Session>, EngineError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.values().filter(|s| !s.is_terminal()).cloned().collect())
    }
}

/// Resolve duplicate active sessions deterministically: keep the most
/// recently active one, close the rest as superseded. Used by startup
/// recovery and by the create-race fallback.
pub async fn resolve_duplicate_actives(
    store: &dyn SessionStore,
    user_id: Uuid,
) -> Result<Option<Session>, EngineError> {
    let mut actives: Vec<Session> = store
        .all_active()
        .await?
        .into_iter()
        .filter(|s| s.user_id == user_id)
        .collect();
    actives.sort_by_key(|s| s.last_activity_at);

    let winner = actives.pop();
    for loser in actives {
        tracing::warn!(
            session_id = %loser.id,
            user_id = %user_id,
            "closing duplicate active session"
        );
        store
            .close(loser.id, SessionState::Abandoned, ClosureReason::Superseded)
            .await?;
    }
    Ok(winner)
}
