//! Conflict Resolver / Clarification Manager
//!
//! When the top two intent candidates are too close in confidence, the
//! engine must not silently pick a winner. It suspends routing by
//! asking the user which one they meant; the "suspension" spans the
//! next inbound message, not a blocked thread. At most one pending
//! clarification exists per user, enforced structurally by the store:
//! creating a new one cancels the previous one, never a second pending
//! row.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{ClassifiedIntent, IntentKind, Priority};
use crate::error::EngineError;
use crate::message::ResponseOption;

/// Lifecycle of a clarification request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClarificationStatus {
    Pending,
    Answered,
    Expired,
    Cancelled,
}

/// A suspend-and-ask record. At most one `Pending` per user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClarificationRequest {
    pub id: Uuid,
    pub user_id: Uuid,
    pub prompt: String,
    /// Candidate intents offered, in the order presented.
    pub candidates: Vec<ClassifiedIntent>,
    pub context_snapshot: Value,
    pub status: ClarificationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub answer: Option<IntentKind>,
}

impl ClarificationRequest {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == ClarificationStatus::Pending && now >= self.expires_at
    }

    /// Options to present to the user, ids stable across turns.
    pub fn options(&self) -> Vec<ResponseOption> {
        self.candidates
            .iter()
            .map(|c| ResponseOption {
                id: option_id(c.kind),
                label: c.kind.label().to_string(),
            })
            .collect()
    }
}

fn option_id(kind: IntentKind) -> String {
    // snake_case serde rename gives stable ids like "update_subject".
    serde_json::to_value(kind)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

fn kind_from_option_id(id: &str) -> Option<IntentKind> {
    serde_json::from_value(Value::String(id.to_string())).ok()
}

/// Persistence contract for clarifications.
#[async_trait]
pub trait ClarificationStore: Send + Sync {
    /// Insert a new pending clarification. Any existing pending one for
    /// the same user is cancelled first (structural uniqueness).
    async fn create(&self, request: ClarificationRequest) -> Result<(), EngineError>;

    /// The user's pending clarification, if any (may be expired).
    async fn find_pending(&self, user_id: Uuid)
        -> Result<Option<ClarificationRequest>, EngineError>;

    async fn set_status(
        &self,
        id: Uuid,
        status: ClarificationStatus,
        answer: Option<IntentKind>,
    ) -> Result<(), EngineError>;

    /// Mark all pending clarifications past their deadline as expired.
    /// Returns how many were expired. Sweeper entry point.
    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<usize, EngineError>;
}

#[async_trait]
impl<T: ClarificationStore + ?Sized> ClarificationStore for std::sync::Arc<T> {
    async fn create(&self, request: ClarificationRequest) -> Result<(), EngineError> {
        (**self).create(request).await
    }

    async fn find_pending(
        &self,
        user_id: Uuid,
    ) -> Result<Option<ClarificationRequest>, EngineError> {
        (**self).find_pending(user_id).await
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: ClarificationStatus,
        answer: Option<IntentKind>,
    ) -> Result<(), EngineError> {
        (**self).set_status(id, status, answer).await
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        (**self).expire_overdue(now).await
    }
}

/// In-memory clarification store.
#[derive(Default)]
pub struct InMemoryClarificationStore {
    requests: RwLock<HashMap<Uuid, ClarificationRequest>>,
}

impl InMemoryClarificationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClarificationStore for InMemoryClarificationStore {
    async fn create(&self, request: ClarificationRequest) -> Result<(), EngineError> {
        let mut requests = self.requests.write().await;
        for existing in requests.values_mut() {
            if existing.user_id == request.user_id
                && existing.status == ClarificationStatus::Pending
            {
                existing.status = ClarificationStatus::Cancelled;
            }
        }
        requests.insert(request.id, request);
        Ok(())
    }

    async fn find_pending(
        &self,
        user_id: Uuid,
    ) -> Result<Option<ClarificationRequest>, EngineError> {
        let requests = self.requests.read().await;
        Ok(requests
            .values()
            .find(|r| r.user_id == user_id && r.status == ClarificationStatus::Pending)
            .cloned())
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: ClarificationStatus,
        answer: Option<IntentKind>,
    ) -> Result<(), EngineError> {
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(&id)
            .ok_or_else(|| EngineError::Store(format!("clarification {id} not found")))?;
        request.status = status;
        request.answer = answer;
        Ok(())
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let mut requests = self.requests.write().await;
        let mut expired = 0;
        for request in requests.values_mut() {
            if request.is_expired(now) {
                request.status = ClarificationStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }
}

/// Decision for a set of candidate intents.
#[derive(Debug, Clone)]
pub enum ConflictDecision {
    /// Unambiguous winner; route it.
    Accept(ClassifiedIntent),
    /// Too close to call; a clarification was created and should be
    /// asked.
    Clarify(ClarificationRequest),
}

/// Applies the ambiguity rule over classifier candidates.
pub struct ConflictResolver<S: ClarificationStore> {
    store: S,
    ambiguity_gap: f32,
    ttl: Duration,
}

impl<S: ClarificationStore> ConflictResolver<S> {
    pub fn new(store: S, ambiguity_gap: f32, ttl: Duration) -> Self {
        Self {
            store,
            ambiguity_gap,
            ttl,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Accept the winner or create a clarification.
    ///
    /// P0 candidates are never ambiguous: they win outright. Candidates
    /// of different priority classes do not clash either; ambiguity only
    /// applies within the same priority class, where confidence is the
    /// sole signal.
    pub async fn decide(
        &self,
        user_id: Uuid,
        candidates: &[ClassifiedIntent],
        context_snapshot: Value,
    ) -> Result<ConflictDecision, EngineError> {
        let top = candidates
            .first()
            .cloned()
            .unwrap_or_else(|| ClassifiedIntent::new(IntentKind::Unknown, 0.0));

        if top.kind.priority() == Priority::P0 {
            return Ok(ConflictDecision::Accept(top));
        }

        let runner_up = candidates
            .get(1)
            .filter(|c| c.kind.priority() == top.kind.priority());

        match runner_up {
            Some(second) if (top.confidence - second.confidence).abs() < self.ambiguity_gap => {
                let request = self
                    .open_clarification(user_id, &top, second, context_snapshot)
                    .await?;
                Ok(ConflictDecision::Clarify(request))
            }
            _ => Ok(ConflictDecision::Accept(top)),
        }
    }

    async fn open_clarification(
        &self,
        user_id: Uuid,
        top: &ClassifiedIntent,
        second: &ClassifiedIntent,
        context_snapshot: Value,
    ) -> Result<ClarificationRequest, EngineError> {
        let now = Utc::now();
        let request = ClarificationRequest {
            id: Uuid::new_v4(),
            user_id,
            prompt: format!(
                "I'm not sure which you meant. Did you want to {} or {}?",
                top.kind.label(),
                second.kind.label()
            ),
            candidates: vec![top.clone(), second.clone()],
            context_snapshot,
            status: ClarificationStatus::Pending,
            created_at: now,
            expires_at: now + ChronoDuration::from_std(self.ttl).unwrap_or_default(),
            answer: None,
        };
        debug!(%user_id, top = ?top.kind, second = ?second.kind, "opening clarification");
        self.store.create(request.clone()).await?;
        Ok(request)
    }

    /// The user's pending clarification, expiring it lazily if overdue.
    pub async fn pending(
        &self,
        user_id: Uuid,
    ) -> Result<Option<ClarificationRequest>, EngineError> {
        match self.store.find_pending(user_id).await? {
            Some(request) if request.is_expired(Utc::now()) => {
                self.store
                    .set_status(request.id, ClarificationStatus::Expired, None)
                    .await?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    /// Try to interpret a message (or structured selection) as the
    /// answer to a pending clarification. Returns the chosen intent.
    pub async fn answer(
        &self,
        request: &ClarificationRequest,
        selection: Option<&str>,
        text: &str,
    ) -> Result<Option<ClassifiedIntent>, EngineError> {
        let chosen = selection
            .and_then(kind_from_option_id)
            .or_else(|| self.match_answer_text(request, text));

        match chosen {
            Some(kind) => {
                let intent = request
                    .candidates
                    .iter()
                    .find(|c| c.kind == kind)
                    .cloned()
                    // The answer names the intent directly, so route it
                    // with full confidence.
                    .map(|mut c| {
                        c.confidence = 0.95;
                        c
                    });
                if intent.is_some() {
                    self.store
                        .set_status(request.id, ClarificationStatus::Answered, Some(kind))
                        .await?;
                }
                Ok(intent)
            }
            None => Ok(None),
        }
    }

    /// Match free text against the offered options: a 1-based ordinal
    /// ("1", "the first one") or a word from the option label.
    fn match_answer_text(&self, request: &ClarificationRequest, text: &str) -> Option<IntentKind> {
        let lowered = text.trim().to_lowercase();

        let ordinal = match lowered.as_str() {
            "1" | "one" | "first" | "the first" | "the first one" => Some(0),
            "2" | "two" | "second" | "the second" | "the second one" => Some(1),
            _ => None,
        };
        if let Some(index) = ordinal {
            return request.candidates.get(index).map(|c| c.kind);
        }

        request
            .candidates
            .iter()
            .find(|c| {
                c.kind
                    .label()
                    .split_whitespace()
                    .any(|word| word.len() > 3 && lowered.contains(word))
            })
            .map(|c| c.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolver() -> ConflictResolver<InMemoryClarificationStore> {
        ConflictResolver::new(
            InMemoryClarificationStore::new(),
            0.15,
            Duration::from_secs(300),
        )
    }

    fn intents(pairs: &[(IntentKind, f32)]) -> Vec<ClassifiedIntent> {
        pairs
            .iter()
            .map(|(kind, confidence)| ClassifiedIntent::new(*kind, *confidence))
            .collect()
    }

    #[tokio::test]
    async fn test_close_candidates_trigger_clarification() {
        let resolver = resolver();
        let user = Uuid::new_v4();

        // Gap 4% < 15% threshold.
        let candidates = intents(&[
            (IntentKind::UpdateSubject, 0.52),
            (IntentKind::ReportIssue, 0.48),
        ]);
        let decision = resolver.decide(user, &candidates, json!({})).await.unwrap();

        match decision {
            ConflictDecision::Clarify(request) => {
                assert_eq!(request.candidates.len(), 2);
                assert_eq!(request.status, ClarificationStatus::Pending);
                assert_eq!(request.options().len(), 2);
            }
            ConflictDecision::Accept(_) => panic!("expected clarification"),
        }
    }

    #[tokio::test]
    async fn test_clear_winner_accepted() {
        let resolver = resolver();
        let candidates = intents(&[
            (IntentKind::UpdateSubject, 0.85),
            (IntentKind::ReportIssue, 0.45),
        ]);
        let decision = resolver
            .decide(Uuid::new_v4(), &candidates, json!({}))
            .await
            .unwrap();
        assert!(matches!(
            decision,
            ConflictDecision::Accept(intent) if intent.kind == IntentKind::UpdateSubject
        ));
    }

    #[tokio::test]
    async fn test_p0_never_clarifies() {
        let resolver = resolver();
        let candidates = intents(&[(IntentKind::Cancel, 0.5), (IntentKind::Help, 0.49)]);
        let decision = resolver
            .decide(Uuid::new_v4(), &candidates, json!({}))
            .await
            .unwrap();
        assert!(matches!(
            decision,
            ConflictDecision::Accept(intent) if intent.kind == IntentKind::Cancel
        ));
    }

    #[tokio::test]
    async fn test_cross_priority_gap_not_ambiguous() {
        let resolver = resolver();
        // A P1 narrowly ahead of a P2 continuation is not a conflict;
        // confidence only arbitrates within a priority class.
        let candidates = intents(&[
            (IntentKind::UpdateSubject, 0.6),
            (IntentKind::ContinueWorkflow, 0.55),
        ]);
        let decision = resolver
            .decide(Uuid::new_v4(), &candidates, json!({}))
            .await
            .unwrap();
        assert!(matches!(decision, ConflictDecision::Accept(_)));
    }

    #[tokio::test]
    async fn test_second_clarification_replaces_first() {
        let resolver = resolver();
        let user = Uuid::new_v4();
        let candidates = intents(&[
            (IntentKind::UpdateSubject, 0.52),
            (IntentKind::ReportIssue, 0.48),
        ]);

        let first = match resolver.decide(user, &candidates, json!({})).await.unwrap() {
            ConflictDecision::Clarify(r) => r,
            _ => panic!(),
        };
        let second = match resolver.decide(user, &candidates, json!({})).await.unwrap() {
            ConflictDecision::Clarify(r) => r,
            _ => panic!(),
        };
        assert_ne!(first.id, second.id);

        // Only one pending, and it's the newest.
        let pending = resolver.pending(user).await.unwrap().unwrap();
        assert_eq!(pending.id, second.id);
    }

    #[tokio::test]
    async fn test_expired_clarification_resolves_to_expired() {
        let store = InMemoryClarificationStore::new();
        let resolver = ConflictResolver::new(store, 0.15, Duration::from_secs(0));
        let user = Uuid::new_v4();
        let candidates = intents(&[
            (IntentKind::UpdateSubject, 0.52),
            (IntentKind::ReportIssue, 0.48),
        ]);

        assert!(matches!(
            resolver.decide(user, &candidates, json!({})).await.unwrap(),
            ConflictDecision::Clarify(_)
        ));

        // TTL zero: pending() must lazily expire it, never return it.
        assert!(resolver.pending(user).await.unwrap().is_none());
        let stored = resolver.store().find_pending(user).await.unwrap();
        assert!(stored.is_none());
    }

    #[tokio::test]
    async fn test_answer_by_option_id_and_ordinal() {
        let resolver = resolver();
        let user = Uuid::new_v4();
        let candidates = intents(&[
            (IntentKind::UpdateSubject, 0.52),
            (IntentKind::ReportIssue, 0.48),
        ]);
        let request = match resolver.decide(user, &candidates, json!({})).await.unwrap() {
            ConflictDecision::Clarify(r) => r,
            _ => panic!(),
        };

        let chosen = resolver
            .answer(&request, Some("report_issue"), "")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chosen.kind, IntentKind::ReportIssue);
        assert!(chosen.confidence >= 0.9);

        // Ordinal answer against a fresh request.
        let request = match resolver.decide(user, &candidates, json!({})).await.unwrap() {
            ConflictDecision::Clarify(r) => r,
            _ => panic!(),
        };
        let chosen = resolver
            .answer(&request, None, "the first one")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chosen.kind, IntentKind::UpdateSubject);
    }

    #[tokio::test]
    async fn test_unrecognized_answer_returns_none() {
        let resolver = resolver();
        let user = Uuid::new_v4();
        let candidates = intents(&[
            (IntentKind::UpdateSubject, 0.52),
            (IntentKind::ReportIssue, 0.48),
        ]);
        let request = match resolver.decide(user, &candidates, json!({})).await.unwrap() {
            ConflictDecision::Clarify(r) => r,
            _ => panic!(),
        };
        assert!(resolver
            .answer(&request, None, "what's the weather")
            .await
            .unwrap()
            .is_none());
    }
}
