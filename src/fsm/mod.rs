//! Workflow State Machine
//!
//! The authoritative transition table for workflow sessions. A fixed set
//! of `(from_state, trigger) -> to_state` rules, each with an optional
//! guard predicate and an optional typed side effect. Side effects are a
//! closed set of variants dispatched on the trigger, never free-form
//! tool names resolved at runtime.

pub mod engine;

pub use engine::{FsmEngine, TransitionOutcome};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::session::{Session, SessionState};

/// Triggers that drive session transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    StartWorkflow,
    SelectSubject,
    ChooseAction,
    ProvideData,
    RequestConfirmation,
    Confirm,
    Reject,
    Complete,
    Cancel,
    Timeout,
    /// Reserved: valid from every non-terminal state, always succeeds.
    /// Used for explicit cancellation and administrative cleanup.
    ForceAbandon,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::StartWorkflow => "start_workflow",
            Trigger::SelectSubject => "select_subject",
            Trigger::ChooseAction => "choose_action",
            Trigger::ProvideData => "provide_data",
            Trigger::RequestConfirmation => "request_confirmation",
            Trigger::Confirm => "confirm",
            Trigger::Reject => "reject",
            Trigger::Complete => "complete",
            Trigger::Cancel => "cancel",
            Trigger::Timeout => "timeout",
            Trigger::ForceAbandon => "force_abandon",
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Data carried by a trigger into `execute`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerInput {
    pub subject_id: Option<Uuid>,
    pub container_id: Option<Uuid>,
    /// Field patch collected so far (for update/complete actions).
    pub patch: Option<Value>,
    /// The action the user chose (e.g. "update", "close").
    pub action: Option<String>,
}

/// Typed side effect attached to a transition rule. Each variant carries
/// its own input contract; the engine resolves concrete values from the
/// session and trigger input before calling the subject directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffectKind {
    None,
    /// List subjects in the session's container.
    LoadSubjects,
    /// Apply the collected patch to the session's subject.
    UpdateSubject,
}

/// Guard predicates evaluated before a transition executes. Pure checks
/// over the session and trigger input; side effects come after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardKind {
    None,
    /// A subject id must be resolved (on session or input).
    SubjectResolved,
    /// A container id must be resolved (on session or input).
    ContainerResolved,
    /// A patch must have been collected (on input or session metadata).
    PatchCollected,
}

impl GuardKind {
    /// Evaluate the guard. `Err` carries the human-readable reason.
    pub fn evaluate(self, session: &Session, input: &TriggerInput) -> Result<(), String> {
        match self {
            GuardKind::None => Ok(()),
            GuardKind::SubjectResolved => {
                if input.subject_id.or(session.subject_id).is_some() {
                    Ok(())
                } else {
                    Err("no subject resolved".to_string())
                }
            }
            GuardKind::ContainerResolved => {
                if input.container_id.or(session.container_id).is_some() {
                    Ok(())
                } else {
                    Err("no container resolved".to_string())
                }
            }
            GuardKind::PatchCollected => {
                let in_metadata = session.metadata.contains_key("pending_patch");
                if input.patch.is_some() || in_metadata {
                    Ok(())
                } else {
                    Err("no data collected yet".to_string())
                }
            }
        }
    }
}

/// One row of the transition table.
#[derive(Debug, Clone, Copy)]
pub struct TransitionRule {
    pub from: SessionState,
    pub trigger: Trigger,
    pub to: SessionState,
    pub guard: GuardKind,
    pub side_effect: SideEffectKind,
}

/// The fixed transition table. `ForceAbandon` is handled outside the
/// table (valid from any non-terminal state).
pub const TRANSITION_TABLE: &[TransitionRule] = &[
    // Entering a workflow
    TransitionRule {
        from: SessionState::Idle,
        trigger: Trigger::StartWorkflow,
        to: SessionState::SubjectSelection,
        guard: GuardKind::ContainerResolved,
        side_effect: SideEffectKind::LoadSubjects,
    },
    TransitionRule {
        from: SessionState::Idle,
        trigger: Trigger::SelectSubject,
        to: SessionState::AwaitingAction,
        guard: GuardKind::SubjectResolved,
        side_effect: SideEffectKind::None,
    },
    // Picking a subject
    TransitionRule {
        from: SessionState::SubjectSelection,
        trigger: Trigger::SelectSubject,
        to: SessionState::AwaitingAction,
        guard: GuardKind::SubjectResolved,
        side_effect: SideEffectKind::None,
    },
    TransitionRule {
        from: SessionState::SubjectSelection,
        trigger: Trigger::StartWorkflow,
        to: SessionState::SubjectSelection,
        guard: GuardKind::ContainerResolved,
        side_effect: SideEffectKind::LoadSubjects,
    },
    // Choosing what to do with it
    TransitionRule {
        from: SessionState::AwaitingAction,
        trigger: Trigger::ChooseAction,
        to: SessionState::CollectingData,
        guard: GuardKind::SubjectResolved,
        side_effect: SideEffectKind::None,
    },
    TransitionRule {
        from: SessionState::AwaitingAction,
        trigger: Trigger::SelectSubject,
        to: SessionState::AwaitingAction,
        guard: GuardKind::SubjectResolved,
        side_effect: SideEffectKind::None,
    },
    // Collecting data
    TransitionRule {
        from: SessionState::CollectingData,
        trigger: Trigger::ProvideData,
        to: SessionState::CollectingData,
        guard: GuardKind::None,
        side_effect: SideEffectKind::None,
    },
    TransitionRule {
        from: SessionState::CollectingData,
        trigger: Trigger::RequestConfirmation,
        to: SessionState::ConfirmationPending,
        guard: GuardKind::PatchCollected,
        side_effect: SideEffectKind::None,
    },
    TransitionRule {
        from: SessionState::CollectingData,
        trigger: Trigger::Complete,
        to: SessionState::Completed,
        guard: GuardKind::SubjectResolved,
        side_effect: SideEffectKind::UpdateSubject,
    },
    // Confirmation
    TransitionRule {
        from: SessionState::ConfirmationPending,
        trigger: Trigger::Confirm,
        to: SessionState::Completed,
        guard: GuardKind::PatchCollected,
        side_effect: SideEffectKind::UpdateSubject,
    },
    TransitionRule {
        from: SessionState::ConfirmationPending,
        trigger: Trigger::Reject,
        to: SessionState::CollectingData,
        guard: GuardKind::None,
        side_effect: SideEffectKind::None,
    },
    // Explicit cancellation
    TransitionRule {
        from: SessionState::Idle,
        trigger: Trigger::Cancel,
        to: SessionState::Abandoned,
        guard: GuardKind::None,
        side_effect: SideEffectKind::None,
    },
    TransitionRule {
        from: SessionState::SubjectSelection,
        trigger: Trigger::Cancel,
        to: SessionState::Abandoned,
        guard: GuardKind::None,
        side_effect: SideEffectKind::None,
    },
    TransitionRule {
        from: SessionState::AwaitingAction,
        trigger: Trigger::Cancel,
        to: SessionState::Abandoned,
        guard: GuardKind::None,
        side_effect: SideEffectKind::None,
    },
    TransitionRule {
        from: SessionState::CollectingData,
        trigger: Trigger::Cancel,
        to: SessionState::Abandoned,
        guard: GuardKind::None,
        side_effect: SideEffectKind::None,
    },
    TransitionRule {
        from: SessionState::ConfirmationPending,
        trigger: Trigger::Cancel,
        to: SessionState::Abandoned,
        guard: GuardKind::None,
        side_effect: SideEffectKind::None,
    },
    // Inactivity timeout
    TransitionRule {
        from: SessionState::Idle,
        trigger: Trigger::Timeout,
        to: SessionState::Abandoned,
        guard: GuardKind::None,
        side_effect: SideEffectKind::None,
    },
    TransitionRule {
        from: SessionState::SubjectSelection,
        trigger: Trigger::Timeout,
        to: SessionState::Abandoned,
        guard: GuardKind::None,
        side_effect: SideEffectKind::None,
    },
    TransitionRule {
        from: SessionState::AwaitingAction,
        trigger: Trigger::Timeout,
        to: SessionState::Abandoned,
        guard: GuardKind::None,
        side_effect: SideEffectKind::None,
    },
    TransitionRule {
        from: SessionState::CollectingData,
        trigger: Trigger::Timeout,
        to: SessionState::Abandoned,
        guard: GuardKind::None,
        side_effect: SideEffectKind::None,
    },
    TransitionRule {
        from: SessionState::ConfirmationPending,
        trigger: Trigger::Timeout,
        to: SessionState::Abandoned,
        guard: GuardKind::None,
        side_effect: SideEffectKind::None,
    },
];

/// Find the rule for a `(state, trigger)` pair.
pub fn lookup_rule(from: SessionState, trigger: Trigger) -> Option<&'static TransitionRule> {
    TRANSITION_TABLE
        .iter()
        .find(|r| r.from == from && r.trigger == trigger)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_has_no_duplicate_rows() {
        for (i, a) in TRANSITION_TABLE.iter().enumerate() {
            for b in &TRANSITION_TABLE[i + 1..] {
                assert!(
                    !(a.from == b.from && a.trigger == b.trigger),
                    "duplicate rule for ({:?}, {:?})",
                    a.from,
                    a.trigger
                );
            }
        }
    }

    #[test]
    fn test_table_never_leaves_terminal_states() {
        for rule in TRANSITION_TABLE {
            assert!(!rule.from.is_terminal(), "rule departs terminal {:?}", rule.from);
        }
    }

    #[test]
    fn test_cancel_and_timeout_cover_all_non_terminal_states() {
        let non_terminal = [
            SessionState::Idle,
            SessionState::SubjectSelection,
            SessionState::AwaitingAction,
            SessionState::CollectingData,
            SessionState::ConfirmationPending,
        ];
        for state in non_terminal {
            assert!(lookup_rule(state, Trigger::Cancel).is_some());
            assert!(lookup_rule(state, Trigger::Timeout).is_some());
        }
    }

    #[test]
    fn test_guard_subject_resolved() {
        let session = Session::new(Uuid::new_v4(), std::time::Duration::from_secs(60));
        let empty = TriggerInput::default();
        assert!(GuardKind::SubjectResolved.evaluate(&session, &empty).is_err());

        let with_subject = TriggerInput {
            subject_id: Some(Uuid::new_v4()),
            ..Default::default()
        };
        assert!(GuardKind::SubjectResolved
            .evaluate(&session, &with_subject)
            .is_ok());
    }

    #[test]
    fn test_guard_patch_collected_reads_metadata() {
        let mut session = Session::new(Uuid::new_v4(), std::time::Duration::from_secs(60));
        let empty = TriggerInput::default();
        assert!(GuardKind::PatchCollected.evaluate(&session, &empty).is_err());

        session
            .metadata
            .insert("pending_patch".to_string(), serde_json::json!({"x": 1}));
        assert!(GuardKind::PatchCollected.evaluate(&session, &empty).is_ok());
    }
}
