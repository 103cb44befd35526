//! Engine Error Taxonomy
//!
//! Errors surfaced by the pipeline and its components. Duplicate messages
//! and ambiguous intents are control flow, not errors, and never appear
//! here: the idempotency guard resolves duplicates silently, the
//! conflict resolver turns ambiguity into a clarification prompt, and
//! an expired clarification lapses back to ordinary routing.

use thiserror::Error;
use uuid::Uuid;

use crate::session::SessionState;

/// Errors produced by the workflow engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The requested trigger is not legal from the current state.
    /// Recovered locally: the caller falls back to unbiased
    /// re-classification and the session is left untouched.
    #[error("invalid transition: {trigger} not allowed from {from:?}")]
    InvalidTransition { from: SessionState, trigger: String },

    /// A guard predicate on an otherwise-valid transition rejected it.
    #[error("transition guard rejected {trigger} from {from:?}: {reason}")]
    GuardRejected {
        from: SessionState,
        trigger: String,
        reason: String,
    },

    /// The transition's side effect (call to the subject directory)
    /// failed. The session keeps its prior state; retryable.
    #[error("side effect failed: {0}")]
    SideEffect(String),

    /// Structural-uniqueness violation on session creation. The caller
    /// reads back the winning session and retries against it.
    #[error("user {0} already has an active session")]
    SessionRaceConflict(Uuid),

    /// A session write lost the version compare-and-swap: another
    /// message committed between this handler's read and write. The
    /// caller re-reads the session and falls back.
    #[error("session {0} was modified concurrently")]
    StaleSession(Uuid),

    /// Session lookup by id failed.
    #[error("session not found: {0}")]
    SessionNotFound(Uuid),

    /// Persistence-layer failure.
    #[error("store error: {0}")]
    Store(String),
}

impl EngineError {
    /// Whether the user should be told to simply retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::SideEffect(_) | EngineError::Store(_))
    }
}
