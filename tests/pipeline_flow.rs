//! End-to-end pipeline tests: full conversations through the message
//! pipeline with in-memory stores and a seeded subject directory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use convoflow::config::EngineConfig;
use convoflow::context::{ActiveEntityStore, InMemoryActiveEntityStore, ToolMemory};
use convoflow::domain::{InMemorySubjectDirectory, NameLookup, SubjectDirectory, SubjectRecord};
use convoflow::idempotency::InMemoryIdempotencyStore;
use convoflow::intent::{ClarificationStore, InMemoryClarificationStore};
use convoflow::message::{InboundMessage, ResponseKind};
use convoflow::pipeline::MessagePipeline;
use convoflow::session::{ClosureReason, InMemorySessionStore, SessionState, SessionStore};
use convoflow::EngineError;

struct Harness {
    pipeline: MessagePipeline,
    sessions: Arc<InMemorySessionStore>,
    clarifications: Arc<InMemoryClarificationStore>,
    entity_state: Arc<InMemoryActiveEntityStore>,
    directory: Arc<InMemorySubjectDirectory>,
    container: Uuid,
    /// Seeded subjects in listing order (sorted by title).
    subjects: Vec<SubjectRecord>,
}

async fn harness() -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let sessions = Arc::new(InMemorySessionStore::new());
    let idempotency = Arc::new(InMemoryIdempotencyStore::new());
    let clarifications = Arc::new(InMemoryClarificationStore::new());
    let entity_state = Arc::new(InMemoryActiveEntityStore::new());
    let tool_memory = Arc::new(ToolMemory::new());
    let directory = Arc::new(InMemorySubjectDirectory::new());

    let container = Uuid::new_v4();
    let mut subjects = Vec::new();
    for title in ["Deploy website", "Review budget", "Write blog post"] {
        let record = SubjectRecord {
            id: Uuid::new_v4(),
            container_id: container,
            title: title.to_string(),
            fields: HashMap::new(),
        };
        directory.insert(record.clone()).await;
        subjects.push(record);
    }

    let pipeline = MessagePipeline::new(
        EngineConfig::default(),
        sessions.clone(),
        idempotency,
        clarifications.clone(),
        entity_state.clone(),
        tool_memory,
        directory.clone(),
    );

    Harness {
        pipeline,
        sessions,
        clarifications,
        entity_state,
        directory,
        container,
        subjects,
    }
}

fn msg(user: Uuid, id: &str, text: &str) -> InboundMessage {
    InboundMessage::new(user, id, text)
}

#[tokio::test]
async fn test_list_select_complete_conversation() {
    let h = harness().await;
    let user = Uuid::new_v4();
    h.entity_state.set_container(user, h.container).await.unwrap();

    // List.
    let listing = h
        .pipeline
        .handle(&msg(user, "m1", "show my tasks"))
        .await
        .unwrap();
    assert_eq!(listing.kind, ResponseKind::Reply);
    assert_eq!(listing.options.len(), 3);
    assert!(listing.text.contains("Deploy website"));

    let active = h.sessions.find_active(user).await.unwrap().unwrap();
    assert_eq!(active.state, SessionState::SubjectSelection);

    // Pick positionally against what was just shown.
    let picked = h.pipeline.handle(&msg(user, "m2", "item 2")).await.unwrap();
    assert!(picked.text.contains("Review budget"));

    let active = h.sessions.find_active(user).await.unwrap().unwrap();
    assert_eq!(active.state, SessionState::AwaitingAction);
    assert_eq!(active.subject_id, Some(h.subjects[1].id));

    // Complete it; "it" resolves from explicit entity state.
    let done = h
        .pipeline
        .handle(&msg(user, "m3", "mark it done"))
        .await
        .unwrap();
    assert_eq!(done.kind, ResponseKind::Reply);
    assert!(done.text.to_lowercase().contains("done"));

    let updated = h
        .directory
        .get_subject(h.subjects[1].id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.fields.get("status"), Some(&json!("done")));

    // The workflow is over; no active session remains.
    assert!(h.sessions.find_active(user).await.unwrap().is_none());
}

#[tokio::test]
async fn test_duplicate_message_replays_cached_response() {
    let h = harness().await;
    let user = Uuid::new_v4();
    h.entity_state.set_container(user, h.container).await.unwrap();

    let first = h
        .pipeline
        .handle(&msg(user, "dup-1", "show my tasks"))
        .await
        .unwrap();
    let replay = h
        .pipeline
        .handle(&msg(user, "dup-1", "show my tasks"))
        .await
        .unwrap();
    assert_eq!(first, replay);

    // The replay short-circuited: the workflow only started once.
    let session = h.sessions.find_active(user).await.unwrap().unwrap();
    let transitions = h.sessions.transitions(session.id).await.unwrap();
    let starts = transitions
        .iter()
        .filter(|t| t.trigger == "start_workflow")
        .count();
    assert_eq!(starts, 1);
}

#[tokio::test]
async fn test_concurrent_duplicates_converge_on_one_response() {
    let h = Arc::new(harness().await);
    let user = Uuid::new_v4();
    h.entity_state.set_container(user, h.container).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let h = h.clone();
        handles.push(tokio::spawn(async move {
            h.pipeline
                .handle(&msg(user, "race-1", "show my tasks"))
                .await
                .unwrap()
        }));
    }

    let mut responses = Vec::new();
    for handle in handles {
        responses.push(handle.await.unwrap());
    }
    // Whatever interleaving happened, every delivery carries the same
    // payload (the first writer's).
    for response in &responses[1..] {
        assert_eq!(response, &responses[0]);
    }
}

/// Delegates to the in-memory directory, counting mutating calls.
struct CountingDirectory {
    inner: Arc<InMemorySubjectDirectory>,
    updates: AtomicUsize,
}

#[async_trait]
impl SubjectDirectory for CountingDirectory {
    async fn list_subjects(&self, container_id: Uuid) -> Result<Vec<SubjectRecord>, EngineError> {
        self.inner.list_subjects(container_id).await
    }

    async fn get_subject(&self, id: Uuid) -> Result<Option<SubjectRecord>, EngineError> {
        self.inner.get_subject(id).await
    }

    async fn update_subject(&self, id: Uuid, patch: Value) -> Result<(), EngineError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.inner.update_subject(id, patch).await
    }

    async fn find_by_name(
        &self,
        container_id: Option<Uuid>,
        name: &str,
    ) -> Result<NameLookup, EngineError> {
        self.inner.find_by_name(container_id, name).await
    }
}

#[tokio::test]
async fn test_concurrent_duplicate_confirms_apply_update_once() {
    let sessions = Arc::new(InMemorySessionStore::new());
    let inner = Arc::new(InMemorySubjectDirectory::new());
    inner
        .insert(SubjectRecord {
            id: Uuid::new_v4(),
            container_id: Uuid::new_v4(),
            title: "Deploy website".to_string(),
            fields: HashMap::new(),
        })
        .await;
    let directory = Arc::new(CountingDirectory {
        inner,
        updates: AtomicUsize::new(0),
    });

    let pipeline = Arc::new(MessagePipeline::new(
        EngineConfig::default(),
        sessions.clone(),
        Arc::new(InMemoryIdempotencyStore::new()),
        Arc::new(InMemoryClarificationStore::new()),
        Arc::new(InMemoryActiveEntityStore::new()),
        Arc::new(ToolMemory::new()),
        directory.clone(),
    ));

    let user = Uuid::new_v4();
    pipeline
        .handle(&msg(user, "m1", "update the website"))
        .await
        .unwrap();
    pipeline
        .handle(&msg(user, "m2", "the new deadline is friday"))
        .await
        .unwrap();
    let session = sessions.find_active(user).await.unwrap().unwrap();
    assert_eq!(session.state, SessionState::ConfirmationPending);

    // The transport redelivers the confirmation while the first copy is
    // still being processed.
    let mut handles = Vec::new();
    for _ in 0..4 {
        let pipeline = pipeline.clone();
        handles.push(tokio::spawn(async move {
            pipeline.handle(&msg(user, "dup-yes", "yes")).await.unwrap()
        }));
    }
    let mut responses = Vec::new();
    for handle in handles {
        responses.push(handle.await.unwrap());
    }

    // One logical message, one applied update; every delivery carries
    // the same payload.
    assert_eq!(directory.updates.load(Ordering::SeqCst), 1);
    for response in &responses[1..] {
        assert_eq!(response, &responses[0]);
    }
    assert!(sessions.find_active(user).await.unwrap().is_none());
}

#[tokio::test]
async fn test_concurrent_messages_yield_single_active_session() {
    let h = Arc::new(harness().await);
    let user = Uuid::new_v4();
    h.entity_state.set_container(user, h.container).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let h = h.clone();
        handles.push(tokio::spawn(async move {
            h.pipeline
                .handle(&msg(user, &format!("c-{i}"), "show my tasks"))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let actives: Vec<_> = h
        .sessions
        .all_active()
        .await
        .unwrap()
        .into_iter()
        .filter(|s| s.user_id == user)
        .collect();
    assert_eq!(actives.len(), 1);
}

#[tokio::test]
async fn test_new_intent_from_idle_state_abandons_old_session() {
    let h = harness().await;
    let user = Uuid::new_v4();
    h.entity_state.set_container(user, h.container).await.unwrap();

    h.pipeline
        .handle(&msg(user, "m1", "show my tasks"))
        .await
        .unwrap();
    h.pipeline.handle(&msg(user, "m2", "item 1")).await.unwrap();

    let old = h.sessions.find_active(user).await.unwrap().unwrap();
    assert_eq!(old.state, SessionState::AwaitingAction);

    // AwaitingAction is IDLE-class: a brand-new listing request is a new
    // flow, not a continuation.
    let listing = h
        .pipeline
        .handle(&msg(user, "m3", "show my tasks"))
        .await
        .unwrap();
    assert_eq!(listing.options.len(), 3);

    let old = h.sessions.get(old.id).await.unwrap().unwrap();
    assert_eq!(old.state, SessionState::Abandoned);
    assert_eq!(old.closure_reason, Some(ClosureReason::ForceAbandoned));

    let new = h.sessions.find_active(user).await.unwrap().unwrap();
    assert_ne!(new.id, old.id);
}

#[tokio::test]
async fn test_ambiguous_message_clarifies_then_routes_answer() {
    let h = harness().await;
    let user = Uuid::new_v4();
    // "the bug" should refer to something concrete.
    h.entity_state
        .set_subject(user, h.subjects[0].id)
        .await
        .unwrap();

    // "fix the bug" is ambiguous between editing and reporting.
    let question = h
        .pipeline
        .handle(&msg(user, "m1", "fix the bug in checkout"))
        .await
        .unwrap();
    assert_eq!(question.kind, ResponseKind::Clarification);
    assert_eq!(question.options.len(), 2);
    assert!(h.clarifications.find_pending(user).await.unwrap().is_some());

    // An ordinal answer picks the first offered intent.
    let routed = h
        .pipeline
        .handle(&msg(user, "m2", "the first one"))
        .await
        .unwrap();
    assert_eq!(routed.kind, ResponseKind::Reply);
    assert!(h.clarifications.find_pending(user).await.unwrap().is_none());

    // The chosen intent actually started a flow.
    let session = h.sessions.find_active(user).await.unwrap().unwrap();
    assert_eq!(session.state, SessionState::CollectingData);
}

#[tokio::test]
async fn test_cancel_preempts_pending_clarification() {
    let h = harness().await;
    let user = Uuid::new_v4();
    h.entity_state
        .set_subject(user, h.subjects[0].id)
        .await
        .unwrap();

    h.pipeline
        .handle(&msg(user, "m1", "fix the bug in checkout"))
        .await
        .unwrap();
    assert!(h.clarifications.find_pending(user).await.unwrap().is_some());

    let cancelled = h.pipeline.handle(&msg(user, "m2", "cancel")).await.unwrap();
    assert_eq!(cancelled.kind, ResponseKind::Reply);
    assert!(h.clarifications.find_pending(user).await.unwrap().is_none());
}

#[tokio::test]
async fn test_update_flow_with_confirmation_and_retry() {
    let h = harness().await;
    let user = Uuid::new_v4();

    // Tier-3 name lookup resolves "the website" to the seeded subject.
    let started = h
        .pipeline
        .handle(&msg(user, "m1", "update the website"))
        .await
        .unwrap();
    assert_eq!(started.kind, ResponseKind::Reply);
    let session = h.sessions.find_active(user).await.unwrap().unwrap();
    assert_eq!(session.state, SessionState::CollectingData);
    assert_eq!(session.subject_id, Some(h.subjects[0].id));

    // Free text in an ACTIVE state is workflow data.
    let staged = h
        .pipeline
        .handle(&msg(user, "m2", "the new deadline is friday"))
        .await
        .unwrap();
    assert!(staged.text.contains("yes/no"));
    let session = h.sessions.find_active(user).await.unwrap().unwrap();
    assert_eq!(session.state, SessionState::ConfirmationPending);

    // Confirmation hits a directory outage; the state must not move.
    h.directory.fail_next_update();
    let failed = h.pipeline.handle(&msg(user, "m3", "yes")).await.unwrap();
    assert_eq!(failed.kind, ResponseKind::RetryableError);
    let session = h.sessions.find_active(user).await.unwrap().unwrap();
    assert_eq!(session.state, SessionState::ConfirmationPending);

    // A fresh delivery retries and lands the patch.
    let confirmed = h.pipeline.handle(&msg(user, "m4", "yes")).await.unwrap();
    assert_eq!(confirmed.kind, ResponseKind::Reply);
    assert!(h.sessions.find_active(user).await.unwrap().is_none());

    let updated = h
        .directory
        .get_subject(h.subjects[0].id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        updated.fields.get("details"),
        Some(&json!("the new deadline is friday"))
    );
}

#[tokio::test]
async fn test_cancel_abandons_active_session() {
    let h = harness().await;
    let user = Uuid::new_v4();

    h.pipeline
        .handle(&msg(user, "m1", "update the website"))
        .await
        .unwrap();
    let session = h.sessions.find_active(user).await.unwrap().unwrap();

    let cancelled = h.pipeline.handle(&msg(user, "m2", "cancel")).await.unwrap();
    assert!(cancelled.text.to_lowercase().contains("cancelled"));

    let session = h.sessions.get(session.id).await.unwrap().unwrap();
    assert_eq!(session.state, SessionState::Abandoned);
    assert_eq!(session.closure_reason, Some(ClosureReason::Cancelled));
    assert!(h.sessions.find_active(user).await.unwrap().is_none());

    // Nothing was written to the subject.
    let subject = h
        .directory
        .get_subject(h.subjects[0].id)
        .await
        .unwrap()
        .unwrap();
    assert!(subject.fields.is_empty());
}

#[tokio::test]
async fn test_help_is_state_aware() {
    let h = harness().await;
    let user = Uuid::new_v4();

    let idle_help = h.pipeline.handle(&msg(user, "m1", "help")).await.unwrap();
    assert!(idle_help.text.contains("show my tasks"));

    h.pipeline
        .handle(&msg(user, "m2", "update the website"))
        .await
        .unwrap();
    h.pipeline
        .handle(&msg(user, "m3", "the priority should be high"))
        .await
        .unwrap();

    let confirm_help = h.pipeline.handle(&msg(user, "m4", "help")).await.unwrap();
    assert!(confirm_help.text.to_lowercase().contains("confirmation"));
}

#[tokio::test]
async fn test_unknown_message_gets_safe_reply() {
    let h = harness().await;
    let user = Uuid::new_v4();

    let response = h
        .pipeline
        .handle(&msg(user, "m1", "what's the weather like"))
        .await
        .unwrap();
    assert_eq!(response.kind, ResponseKind::Reply);
    assert!(h.sessions.find_active(user).await.unwrap().is_none());
}

#[tokio::test]
async fn test_affirm_without_pending_confirmation_is_harmless() {
    let h = harness().await;
    let user = Uuid::new_v4();

    let response = h.pipeline.handle(&msg(user, "m1", "yes")).await.unwrap();
    assert_eq!(response.kind, ResponseKind::Reply);
    assert!(h.sessions.find_active(user).await.unwrap().is_none());
}
