//! FSM Engine
//!
//! Validates and executes session transitions as a single unit:
//! guard check, side effect through the subject directory, state write,
//! transition-log append. A failed side effect rejects the transition
//! and leaves the persisted session in its prior state; the failed
//! attempt is still logged with its correlation id.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{lookup_rule, GuardKind, SideEffectKind, TransitionRule, Trigger, TriggerInput};
use crate::domain::{SubjectDirectory, SubjectRecord};
use crate::error::EngineError;
use crate::session::{ClosureReason, Session, SessionState, SessionStore, TransitionRecord};

/// Result of a successful transition execution.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub session: Session,
    /// Subjects listed by a `LoadSubjects` side effect, for response
    /// composition and Tier-2 tool memory.
    pub listed_subjects: Option<Vec<SubjectRecord>>,
    pub correlation_id: Uuid,
}

/// The workflow engine. All session mutations go through here (or the
/// session store's `close`, for sweeper/recovery paths).
pub struct FsmEngine {
    store: Arc<dyn SessionStore>,
    directory: Arc<dyn SubjectDirectory>,
    session_inactivity_ttl: Duration,
}

impl FsmEngine {
    pub fn new(
        store: Arc<dyn SessionStore>,
        directory: Arc<dyn SubjectDirectory>,
        session_inactivity_ttl: Duration,
    ) -> Self {
        Self {
            store,
            directory,
            session_inactivity_ttl,
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Check whether `trigger` is legal from `state`, without executing.
    pub fn validate(
        &self,
        state: SessionState,
        trigger: Trigger,
    ) -> Result<&'static TransitionRule, EngineError> {
        if trigger == Trigger::ForceAbandon {
            // Not in the table; legal from any non-terminal state.
            if state.is_terminal() {
                return Err(EngineError::InvalidTransition {
                    from: state,
                    trigger: trigger.to_string(),
                });
            }
            return Ok(&FORCE_ABANDON_RULE);
        }
        lookup_rule(state, trigger).ok_or(EngineError::InvalidTransition {
            from: state,
            trigger: trigger.to_string(),
        })
    }

    /// Execute a trigger against a session.
    ///
    /// On any rejection (invalid, guard, side effect) the stored session
    /// is untouched and a failed transition record is appended.
    pub async fn execute(
        &self,
        session: &Session,
        trigger: Trigger,
        input: TriggerInput,
    ) -> Result<TransitionOutcome, EngineError> {
        let correlation_id = Uuid::new_v4();

        let rule = match self.validate(session.state, trigger) {
            Ok(rule) => rule,
            Err(err) => {
                warn!(
                    session_id = %session.id,
                    state = ?session.state,
                    %trigger,
                    %correlation_id,
                    "rejected invalid transition"
                );
                self.log_attempt(
                    session,
                    session.state,
                    session.state,
                    trigger,
                    false,
                    Some(&err),
                    &input,
                    correlation_id,
                )
                .await?;
                return Err(err);
            }
        };

        if let Err(reason) = rule.guard.evaluate(session, &input) {
            let err = EngineError::GuardRejected {
                from: session.state,
                trigger: trigger.to_string(),
                reason: reason.clone(),
            };
            debug!(session_id = %session.id, %trigger, reason, "transition guard rejected");
            self.log_attempt(
                session,
                session.state,
                rule.to,
                trigger,
                false,
                Some(&err),
                &input,
                correlation_id,
            )
            .await?;
            return Err(err);
        }

        // Side effect before any state write. If it fails the session
        // keeps its prior state.
        let listed_subjects = match self.run_side_effect(rule, session, &input).await {
            Ok(listed) => listed,
            Err(err) => {
                warn!(
                    session_id = %session.id,
                    %trigger,
                    %correlation_id,
                    error = %err,
                    "transition side effect failed"
                );
                self.log_attempt(
                    session,
                    session.state,
                    rule.to,
                    trigger,
                    false,
                    Some(&err),
                    &input,
                    correlation_id,
                )
                .await?;
                return Err(err);
            }
        };

        let mut updated = session.clone();
        self.apply_input(&mut updated, trigger, &input);
        updated.touch(self.session_inactivity_ttl);

        if rule.to.is_terminal() {
            updated.close(rule.to, closure_reason_for(trigger));
        } else {
            updated.state = rule.to;
        }

        let updated = self.store.save(&updated).await?;
        self.log_attempt(
            &updated,
            session.state,
            rule.to,
            trigger,
            true,
            None,
            &input,
            correlation_id,
        )
        .await?;

        debug!(
            session_id = %updated.id,
            from = ?session.state,
            to = ?updated.state,
            %trigger,
            "transition executed"
        );

        Ok(TransitionOutcome {
            session: updated,
            listed_subjects,
            correlation_id,
        })
    }

    /// Force-abandon a session. Legal from every non-terminal state and
    /// always succeeds (no guard, no side effect).
    pub async fn force_abandon(
        &self,
        session: &Session,
        reason: ClosureReason,
    ) -> Result<Session, EngineError> {
        let mut current = session.clone();
        // A concurrent message may move the session between our read
        // and write; re-read and retry until the close commits (or the
        // session turns out to be terminal already).
        for _ in 0..3 {
            if current.is_terminal() {
                return Ok(current);
            }
            let correlation_id = Uuid::new_v4();
            let from_state = current.state;
            let mut updated = current.clone();
            updated.close(SessionState::Abandoned, reason);
            match self.store.save(&updated).await {
                Ok(saved) => {
                    self.log_attempt(
                        &saved,
                        from_state,
                        SessionState::Abandoned,
                        Trigger::ForceAbandon,
                        true,
                        None,
                        &TriggerInput::default(),
                        correlation_id,
                    )
                    .await?;
                    return Ok(saved);
                }
                Err(EngineError::StaleSession(_)) => {
                    current = self
                        .store
                        .get(session.id)
                        .await?
                        .ok_or(EngineError::SessionNotFound(session.id))?;
                }
                Err(other) => return Err(other),
            }
        }
        Err(EngineError::StaleSession(session.id))
    }

    async fn run_side_effect(
        &self,
        rule: &TransitionRule,
        session: &Session,
        input: &TriggerInput,
    ) -> Result<Option<Vec<SubjectRecord>>, EngineError> {
        match rule.side_effect {
            SideEffectKind::None => Ok(None),
            SideEffectKind::LoadSubjects => {
                let container_id = input
                    .container_id
                    .or(session.container_id)
                    .ok_or_else(|| EngineError::SideEffect("no container to list".to_string()))?;
                let subjects = self.directory.list_subjects(container_id).await?;
                Ok(Some(subjects))
            }
            SideEffectKind::UpdateSubject => {
                let subject_id = input
                    .subject_id
                    .or(session.subject_id)
                    .ok_or_else(|| EngineError::SideEffect("no subject to update".to_string()))?;
                let patch = input
                    .patch
                    .clone()
                    .or_else(|| session.metadata.get("pending_patch").cloned())
                    .unwrap_or_else(|| json!({ "status": "done" }));
                self.directory.update_subject(subject_id, patch).await?;
                Ok(None)
            }
        }
    }

    /// Fold trigger input into the session (subject/container/metadata).
    fn apply_input(&self, session: &mut Session, trigger: Trigger, input: &TriggerInput) {
        if let Some(subject_id) = input.subject_id {
            session.subject_id = Some(subject_id);
        }
        if let Some(container_id) = input.container_id {
            session.container_id = Some(container_id);
        }
        if let Some(action) = &input.action {
            session
                .metadata
                .insert("chosen_action".to_string(), json!(action));
        }
        if let Some(patch) = &input.patch {
            // Accumulate collected fields across ProvideData turns.
            let merged = match (session.metadata.get("pending_patch"), patch) {
                (Some(Value::Object(existing)), Value::Object(incoming)) => {
                    let mut merged = existing.clone();
                    for (k, v) in incoming {
                        merged.insert(k.clone(), v.clone());
                    }
                    Value::Object(merged)
                }
                _ => patch.clone(),
            };
            session.metadata.insert("pending_patch".to_string(), merged);
        }
        if trigger == Trigger::Complete || trigger == Trigger::Confirm {
            session.metadata.remove("pending_patch");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn log_attempt(
        &self,
        session: &Session,
        from_state: SessionState,
        to_state: SessionState,
        trigger: Trigger,
        success: bool,
        error: Option<&EngineError>,
        input: &TriggerInput,
        correlation_id: Uuid,
    ) -> Result<(), EngineError> {
        self.store
            .append_transition(TransitionRecord {
                session_id: session.id,
                from_state,
                to_state,
                trigger: trigger.to_string(),
                success,
                error: error.map(|e| e.to_string()),
                context_snapshot: json!({
                    "subject_id": session.subject_id,
                    "container_id": session.container_id,
                    "input": serde_json::to_value(input).unwrap_or(Value::Null),
                }),
                correlation_id,
                occurred_at: chrono::Utc::now(),
            })
            .await
    }
}

fn closure_reason_for(trigger: Trigger) -> ClosureReason {
    match trigger {
        Trigger::Cancel => ClosureReason::Cancelled,
        Trigger::Timeout => ClosureReason::TimedOut,
        Trigger::ForceAbandon => ClosureReason::ForceAbandoned,
        _ => ClosureReason::Completed,
    }
}

const FORCE_ABANDON_RULE: TransitionRule = TransitionRule {
    from: SessionState::Idle,
    trigger: Trigger::ForceAbandon,
    to: SessionState::Abandoned,
    guard: GuardKind::None,
    side_effect: SideEffectKind::None,
};
