//! Message Pipeline
//!
//! One invocation per inbound message: idempotency reservation, P0
//! handling, pending-clarification resolution, context resolution,
//! classification, conflict resolution, FSM execution, response
//! composition, idempotency completion. The key is reserved before any
//! work runs, so concurrent duplicates never compute twice. Many
//! messages may be in flight concurrently; correctness rests on the
//! structural invariants in the stores, not on any global lock.

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::context::{ActiveEntityStore, ContextStateBuilder, ResolvedContext, ToolMemory};
use crate::domain::{SubjectDirectory, SubjectRecord};
use crate::error::EngineError;
use crate::fsm::{FsmEngine, Trigger, TriggerInput};
use crate::idempotency::{GuardOutcome, IdempotencyGuard, IdempotencyStore};
use crate::intent::{
    ClarificationStore, ClassificationContext, ClassifiedIntent, ConflictDecision,
    ConflictResolver, IntentClassifier, IntentKind,
};
use crate::message::{
    EngineResponse, InboundMessage, ResponseOption, SelectionPayload, ToolOutputRecord,
};
use crate::session::{ClosureReason, Session, SessionState, SessionStore, StateClass};

/// The engine's front door.
pub struct MessagePipeline {
    config: EngineConfig,
    guard: IdempotencyGuard<Arc<dyn IdempotencyStore>>,
    classifier: IntentClassifier,
    resolver: ConflictResolver<Arc<dyn ClarificationStore>>,
    context: ContextStateBuilder,
    engine: FsmEngine,
    sessions: Arc<dyn SessionStore>,
    directory: Arc<dyn SubjectDirectory>,
    tool_memory: Arc<ToolMemory>,
}

impl MessagePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        sessions: Arc<dyn SessionStore>,
        idempotency: Arc<dyn IdempotencyStore>,
        clarifications: Arc<dyn ClarificationStore>,
        entity_state: Arc<dyn ActiveEntityStore>,
        tool_memory: Arc<ToolMemory>,
        directory: Arc<dyn SubjectDirectory>,
    ) -> Self {
        let guard = IdempotencyGuard::new(idempotency, config.idempotency_ttl);
        let resolver =
            ConflictResolver::new(clarifications, config.ambiguity_gap, config.clarification_ttl);
        let context = ContextStateBuilder::new(
            entity_state,
            tool_memory.clone(),
            directory.clone(),
            config.entity_state_ttl,
        );
        let engine = FsmEngine::new(
            sessions.clone(),
            directory.clone(),
            config.session_inactivity_ttl,
        );
        Self {
            config,
            guard,
            classifier: IntentClassifier::new(),
            resolver,
            context,
            engine,
            sessions,
            directory,
            tool_memory,
        }
    }

    /// Process one inbound message end to end.
    pub async fn handle(&self, message: &InboundMessage) -> Result<EngineResponse, EngineError> {
        // Reserve the key before any work runs: of N concurrent
        // deliveries of this message, exactly one computes. The only
        // path allowed to short-circuit the whole pipeline.
        match self
            .guard
            .acquire(message.user_id, &message.message_id)
            .await?
        {
            GuardOutcome::Replay(cached) => return Ok(cached),
            GuardOutcome::Busy => {
                return Ok(EngineResponse::retryable_error(
                    "I'm still working on that message. Please try again in a moment.",
                ))
            }
            GuardOutcome::Acquired => {}
        }

        match self.compute(message).await {
            Ok(response) => {
                // Durably recorded before the response counts as sent;
                // waiting duplicates pick it up from here.
                self.guard
                    .complete(message.user_id, &message.message_id, response)
                    .await
            }
            Err(error) if error.is_retryable() => {
                // Released, not recorded: a redelivery of this message
                // id should get a fresh attempt.
                self.guard
                    .release(message.user_id, &message.message_id)
                    .await?;
                warn!(user_id = %message.user_id, %error, "pipeline failed; asking user to retry");
                Ok(EngineResponse::retryable_error(
                    "Something went wrong on my end. Please try that again.",
                ))
            }
            Err(error) => {
                self.guard
                    .release(message.user_id, &message.message_id)
                    .await?;
                Err(error)
            }
        }
    }

    async fn compute(&self, message: &InboundMessage) -> Result<EngineResponse, EngineError> {
        let user_id = message.user_id;
        let session = self.sessions.find_active(user_id).await?;
        let state_class = session
            .as_ref()
            .map(|s| s.state.class())
            .unwrap_or(StateClass::Idle);

        let resolved = self.resolve_context(message).await?;
        let ctx = ClassificationContext {
            state_class,
            has_active_subject: resolved.subject_id.is_some(),
        };
        let candidates = self.gather_candidates(message, &ctx);
        debug!(%user_id, top = ?candidates.first(), "classified message");

        // P0 pre-empts everything, including a pending clarification.
        if let Some(top) = candidates.first() {
            if top.kind == IntentKind::Cancel {
                return self.handle_cancel(user_id, session).await;
            }
            if top.kind == IntentKind::Help {
                return Ok(self.help_response(session.as_ref()));
            }
        }

        // A pending clarification intercepts the message: answer it,
        // explicitly replace it, or re-ask.
        if let Some(pending) = self.resolver.pending(user_id).await? {
            let selection_id = match &message.selection {
                Some(SelectionPayload::Option { option_id }) => Some(option_id.as_str()),
                _ => None,
            };
            if let Some(chosen) = self
                .resolver
                .answer(&pending, selection_id, &message.text)
                .await?
            {
                info!(%user_id, kind = ?chosen.kind, "clarification answered");
                return self
                    .route(user_id, session, chosen, &resolved, &message.text)
                    .await;
            }
            // A confident, explicit new request replaces the pending
            // question (the resolver cancels it when a new one opens;
            // here the user simply moved on).
            let replaces = candidates
                .first()
                .map(|c| c.kind.priority() <= crate::intent::Priority::P1 && c.confidence >= 0.75)
                .unwrap_or(false);
            if !replaces {
                return Ok(EngineResponse::clarification(
                    pending.prompt.clone(),
                    pending.options(),
                ));
            }
            self.resolver
                .store()
                .set_status(
                    pending.id,
                    crate::intent::ClarificationStatus::Cancelled,
                    None,
                )
                .await?;
        }

        let snapshot = json!({
            "state": session.as_ref().map(|s| s.state),
            "subject_id": resolved.subject_id,
            "container_id": resolved.container_id,
        });
        match self.resolver.decide(user_id, &candidates, snapshot).await? {
            ConflictDecision::Clarify(request) => {
                info!(%user_id, "intent ambiguous; asking for clarification");
                Ok(EngineResponse::clarification(
                    request.prompt.clone(),
                    request.options(),
                ))
            }
            ConflictDecision::Accept(intent) => {
                self.route(user_id, session, intent, &resolved, &message.text)
                    .await
            }
        }
    }

    /// Resolve entity context, letting a structured selection override
    /// free text (it is an explicit user action).
    async fn resolve_context(
        &self,
        message: &InboundMessage,
    ) -> Result<ResolvedContext, EngineError> {
        if let Some(SelectionPayload::Subject { subject_id }) = &message.selection {
            let container_id = self
                .directory
                .get_subject(*subject_id)
                .await?
                .map(|s| s.container_id);
            self.context
                .set_active_subject(message.user_id, *subject_id, container_id)
                .await?;
            return Ok(ResolvedContext {
                container_id,
                subject_id: Some(*subject_id),
                tier: Some(crate::context::Tier::Explicit),
            });
        }
        self.context.resolve(message.user_id, &message.text).await
    }

    fn gather_candidates(
        &self,
        message: &InboundMessage,
        ctx: &ClassificationContext,
    ) -> Vec<ClassifiedIntent> {
        if let Some(SelectionPayload::Position { index }) = &message.selection {
            let mut intent = ClassifiedIntent::new(IntentKind::SelectSubject, 0.95);
            intent.argument = Some(index.to_string());
            return vec![intent];
        }
        if matches!(message.selection, Some(SelectionPayload::Subject { .. })) {
            return vec![ClassifiedIntent::new(IntentKind::SelectSubject, 0.95)];
        }
        self.classifier.candidates(&message.text, ctx)
    }

    async fn handle_cancel(
        &self,
        user_id: Uuid,
        session: Option<Session>,
    ) -> Result<EngineResponse, EngineError> {
        // Cancel beats any pending clarification.
        let mut had_pending = false;
        if let Some(pending) = self.resolver.store().find_pending(user_id).await? {
            self.resolver
                .store()
                .set_status(
                    pending.id,
                    crate::intent::ClarificationStatus::Cancelled,
                    None,
                )
                .await?;
            had_pending = true;
        }
        if let Some(session) = session {
            self.engine
                .force_abandon(&session, ClosureReason::Cancelled)
                .await?;
            self.context.clear_active(user_id).await?;
            return Ok(EngineResponse::reply(
                "Okay, I've cancelled that. Nothing was changed.",
            ));
        }
        if had_pending {
            return Ok(EngineResponse::reply("Okay, never mind that question."));
        }
        Ok(EngineResponse::reply("Nothing in progress to cancel."))
    }

    fn help_response(&self, session: Option<&Session>) -> EngineResponse {
        let text = match session.map(|s| s.state) {
            Some(SessionState::ConfirmationPending) => {
                "You have a change waiting for confirmation. Say 'yes' to apply it, 'no' to go back, or 'cancel' to drop it."
            }
            Some(SessionState::CollectingData) => {
                "Tell me what to change, then confirm. You can also say 'cancel' to stop."
            }
            _ => {
                "I can show your work items ('show my tasks'), update one ('update <name>'), or mark one done ('mark <name> done')."
            }
        };
        EngineResponse::reply(text)
    }

    /// Route an accepted intent into the FSM.
    async fn route(
        &self,
        user_id: Uuid,
        session: Option<Session>,
        intent: ClassifiedIntent,
        resolved: &ResolvedContext,
        text: &str,
    ) -> Result<EngineResponse, EngineError> {
        match self
            .route_inner(user_id, session, &intent, resolved, text)
            .await
        {
            Ok(response) => Ok(response),
            Err(EngineError::InvalidTransition { from, trigger }) => {
                // Never fatal: report as a no-op and fall back to an
                // unbiased next-step prompt.
                warn!(%user_id, ?from, trigger, "transition rejected; falling back");
                let session = self.sessions.find_active(user_id).await?;
                Ok(self.help_response(session.as_ref()))
            }
            Err(EngineError::GuardRejected { reason, .. }) => {
                Ok(EngineResponse::reply(format!("I can't do that yet: {reason}.")))
            }
            Err(EngineError::StaleSession(_)) => {
                // Another message committed first; its write stands.
                warn!(%user_id, "session changed under this message; falling back");
                let session = self.sessions.find_active(user_id).await?;
                Ok(self.help_response(session.as_ref()))
            }
            Err(other) => Err(other),
        }
    }

    async fn route_inner(
        &self,
        user_id: Uuid,
        session: Option<Session>,
        intent: &ClassifiedIntent,
        resolved: &ResolvedContext,
        text: &str,
    ) -> Result<EngineResponse, EngineError> {
        match intent.kind {
            IntentKind::ListSubjects => {
                let container_id = resolved.container_id.or_else(|| {
                    session.as_ref().and_then(|s| s.container_id)
                });
                let Some(container_id) = container_id else {
                    return Ok(EngineResponse::reply(
                        "Which project should I look in? Tell me its name.",
                    ));
                };
                let session = self
                    .session_for_new_flow(user_id, session, Trigger::StartWorkflow)
                    .await?;
                let outcome = self
                    .engine
                    .execute(
                        &session,
                        Trigger::StartWorkflow,
                        TriggerInput {
                            container_id: Some(container_id),
                            ..Default::default()
                        },
                    )
                    .await?;
                let subjects = outcome.listed_subjects.unwrap_or_default();
                self.remember_listing(user_id, container_id, &subjects).await;
                Ok(listing_response(&subjects))
            }

            IntentKind::SelectSubject => {
                let subject_id = match resolved.subject_id {
                    Some(id) => Some(id),
                    None => {
                        // Positional argument against the recent window.
                        let reference = intent.argument.as_deref().unwrap_or(text);
                        self.tool_memory
                            .resolve_reference(user_id, reference)
                            .await
                            .1
                    }
                };
                let Some(subject_id) = subject_id else {
                    return Ok(EngineResponse::reply(
                        "I couldn't tell which item you meant. Try 'show my tasks' first.",
                    ));
                };
                let subject = self.directory.get_subject(subject_id).await?;
                let container_id = subject.as_ref().map(|s| s.container_id);
                let session = self
                    .session_for_new_flow(user_id, session, Trigger::SelectSubject)
                    .await?;
                self.engine
                    .execute(
                        &session,
                        Trigger::SelectSubject,
                        TriggerInput {
                            subject_id: Some(subject_id),
                            container_id,
                            ..Default::default()
                        },
                    )
                    .await?;
                self.context
                    .set_active_subject(user_id, subject_id, container_id)
                    .await?;
                let title = subject.map(|s| s.title).unwrap_or_else(|| "that item".to_string());
                Ok(EngineResponse::reply(format!(
                    "Working on \"{title}\". You can update it, mark it done, or report an issue."
                )))
            }

            IntentKind::UpdateSubject => {
                self.begin_action(user_id, session, resolved, "update", intent, text)
                    .await
            }

            IntentKind::ReportIssue => {
                self.begin_action(user_id, session, resolved, "report_issue", intent, text)
                    .await
            }

            IntentKind::CompleteSubject => {
                self.complete_subject(user_id, session, resolved).await
            }

            IntentKind::Affirm => match session {
                Some(session) if session.state == SessionState::ConfirmationPending => {
                    self.engine
                        .execute(&session, Trigger::Confirm, TriggerInput::default())
                        .await?;
                    self.context.clear_active(user_id).await?;
                    Ok(EngineResponse::reply("Done. The item has been updated."))
                }
                _ => Ok(EngineResponse::reply("There's nothing waiting for a yes right now.")),
            },

            IntentKind::Deny => match session {
                Some(session) if session.state == SessionState::ConfirmationPending => {
                    self.engine
                        .execute(&session, Trigger::Reject, TriggerInput::default())
                        .await?;
                    Ok(EngineResponse::reply(
                        "Okay, not applied. What should it be instead?",
                    ))
                }
                _ => Ok(EngineResponse::reply("There's nothing to undo right now.")),
            },

            IntentKind::ContinueWorkflow => match session {
                Some(session) if session.state == SessionState::CollectingData => {
                    let patch = json!({ "details": text.trim() });
                    let outcome = self
                        .engine
                        .execute(
                            &session,
                            Trigger::ProvideData,
                            TriggerInput {
                                patch: Some(patch),
                                ..Default::default()
                            },
                        )
                        .await?;
                    self.engine
                        .execute(
                            &outcome.session,
                            Trigger::RequestConfirmation,
                            TriggerInput::default(),
                        )
                        .await?;
                    Ok(EngineResponse::reply(
                        "Got it. Apply that change? (yes/no)",
                    ))
                }
                Some(session) if session.state == SessionState::ConfirmationPending => Ok(
                    self.help_response(Some(&session)),
                ),
                _ => Ok(EngineResponse::reply(
                    "We weren't in the middle of anything. Try 'show my tasks'.",
                )),
            },

            IntentKind::General => Ok(EngineResponse::reply(
                "Hi! I can show your work items, update one, or mark one done.",
            )),

            IntentKind::Unknown => Ok(EngineResponse::reply(
                "I didn't catch that. Try 'show my tasks', or 'help' for what I can do.",
            )),

            // P0 kinds are handled before routing.
            IntentKind::Cancel | IntentKind::Help => Ok(self.help_response(None)),
        }
    }

    /// Drive a session to `CollectingData` for a chosen action.
    async fn begin_action(
        &self,
        user_id: Uuid,
        session: Option<Session>,
        resolved: &ResolvedContext,
        action: &str,
        intent: &ClassifiedIntent,
        text: &str,
    ) -> Result<EngineResponse, EngineError> {
        let Some(subject_id) = resolved.subject_id else {
            return Ok(EngineResponse::reply(
                "Which item is that about? Pick one from 'show my tasks' or name it.",
            ));
        };
        let container_id = self
            .directory
            .get_subject(subject_id)
            .await?
            .map(|s| s.container_id);

        let session = self
            .session_for_new_flow(user_id, session, Trigger::SelectSubject)
            .await?;

        // Idle-family states walk subject selection first; a session
        // already collecting keeps its position.
        if session.state.class() == StateClass::Idle {
            let outcome = self
                .engine
                .execute(
                    &session,
                    Trigger::SelectSubject,
                    TriggerInput {
                        subject_id: Some(subject_id),
                        container_id,
                        ..Default::default()
                    },
                )
                .await?;
            self.engine
                .execute(
                    &outcome.session,
                    Trigger::ChooseAction,
                    TriggerInput {
                        action: Some(action.to_string()),
                        ..Default::default()
                    },
                )
                .await?;
        }
        self.context
            .set_active_subject(user_id, subject_id, container_id)
            .await?;

        let prompt = match action {
            "report_issue" => "Okay, describe the problem and I'll attach it to the item.",
            _ => {
                // An inline argument like "set status to blocked" can
                // seed the collection turn.
                if intent.argument.is_some() && text.len() > 12 {
                    "Tell me the new value, or say 'done' when finished."
                } else {
                    "What should I change?"
                }
            }
        };
        Ok(EngineResponse::reply(prompt))
    }

    /// "Mark it done": walk the session to `Completed`, applying the
    /// completion patch through the FSM side effect.
    async fn complete_subject(
        &self,
        user_id: Uuid,
        session: Option<Session>,
        resolved: &ResolvedContext,
    ) -> Result<EngineResponse, EngineError> {
        let subject_id = resolved
            .subject_id
            .or_else(|| session.as_ref().and_then(|s| s.subject_id));
        let Some(subject_id) = subject_id else {
            return Ok(EngineResponse::reply(
                "Which item should I mark done? Pick one from 'show my tasks' or name it.",
            ));
        };
        let container_id = self
            .directory
            .get_subject(subject_id)
            .await?
            .map(|s| s.container_id);

        let session = self
            .session_for_new_flow(user_id, session, Trigger::SelectSubject)
            .await?;

        let session = if session.state.class() == StateClass::Idle {
            let outcome = self
                .engine
                .execute(
                    &session,
                    Trigger::SelectSubject,
                    TriggerInput {
                        subject_id: Some(subject_id),
                        container_id,
                        ..Default::default()
                    },
                )
                .await?;
            let outcome = self
                .engine
                .execute(
                    &outcome.session,
                    Trigger::ChooseAction,
                    TriggerInput {
                        action: Some("complete".to_string()),
                        ..Default::default()
                    },
                )
                .await?;
            outcome.session
        } else {
            session
        };

        self.engine
            .execute(
                &session,
                Trigger::Complete,
                TriggerInput {
                    subject_id: Some(subject_id),
                    patch: Some(json!({ "status": "done" })),
                    ..Default::default()
                },
            )
            .await?;
        self.context.clear_active(user_id).await?;
        Ok(EngineResponse::reply("Done. The item is marked complete."))
    }

    /// Get a session the new flow can run on. If the current session
    /// cannot accept the entry trigger, an IDLE session is abandoned in
    /// favor of a fresh one (a user in an IDLE state is free to state a
    /// new intent); an ACTIVE session is abandoned too, since an
    /// explicitly accepted new P1 intent outranks continuation.
    async fn session_for_new_flow(
        &self,
        user_id: Uuid,
        session: Option<Session>,
        entry: Trigger,
    ) -> Result<Session, EngineError> {
        if let Some(session) = session {
            if self.engine.validate(session.state, entry).is_ok() {
                return Ok(session);
            }
            info!(
                %user_id,
                session_id = %session.id,
                state = ?session.state,
                "abandoning session for a new flow"
            );
            self.engine
                .force_abandon(&session, ClosureReason::ForceAbandoned)
                .await?;
        }
        self.create_session(user_id).await
    }

    /// Create a session, recovering from the structural race: if
    /// another in-flight message won the create, read back the winning
    /// session and use it.
    async fn create_session(&self, user_id: Uuid) -> Result<Session, EngineError> {
        let fresh = Session::new(user_id, self.config.session_inactivity_ttl);
        match self.sessions.create(fresh).await {
            Ok(session) => Ok(session),
            Err(EngineError::SessionRaceConflict(_)) => {
                debug!(%user_id, "lost session-create race; adopting winner");
                self.sessions
                    .find_active(user_id)
                    .await?
                    .ok_or(EngineError::SessionRaceConflict(user_id))
            }
            Err(other) => Err(other),
        }
    }

    async fn remember_listing(
        &self,
        user_id: Uuid,
        container_id: Uuid,
        subjects: &[SubjectRecord],
    ) {
        let record = ToolOutputRecord::new(
            "list_subjects",
            json!({ "container_id": container_id.to_string() }),
            json!({
                "subjects": subjects
                    .iter()
                    .map(|s| json!({ "id": s.id.to_string(), "title": s.title }))
                    .collect::<Vec<Value>>()
            }),
        );
        self.tool_memory.record(user_id, record).await;
    }
}

fn listing_response(subjects: &[SubjectRecord]) -> EngineResponse {
    if subjects.is_empty() {
        return EngineResponse::reply("That project has no open items.");
    }
    let lines: Vec<String> = subjects
        .iter()
        .enumerate()
        .map(|(i, s)| format!("{}. {}", i + 1, s.title))
        .collect();
    let options = subjects
        .iter()
        .map(|s| ResponseOption {
            id: s.id.to_string(),
            label: s.title.clone(),
        })
        .collect();
    EngineResponse::reply(format!(
        "Here's what's open:\n{}\nSay 'item N' to pick one.",
        lines.join("\n")
    ))
    .with_options(options)
}
