//! Session Recovery and Cleanup Sweeper
//!
//! Two operational surfaces: a startup hook that reconciles sessions
//! left non-terminal by a previous process lifetime, and a periodic
//! sweep that purges expired idempotency records, expires overdue
//! clarifications, times out inactive sessions, and drops expired
//! Tier-1 entity pairs. Purging happens here so the message hot path
//! never pays for it.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::context::ActiveEntityStore;
use crate::error::EngineError;
use crate::idempotency::IdempotencyStore;
use crate::intent::ClarificationStore;
use crate::session::{ClosureReason, Session, SessionState, SessionStore};

/// Reconcile sessions after a process restart: every non-terminal
/// session from before this lifetime is force-abandoned with reason
/// `RecoveredOnStartup`; if a user somehow has several actives, the
/// most recently active one is the one kept for dedup accounting before
/// all are closed.
pub async fn recover_on_startup(store: &dyn SessionStore) -> Result<usize, EngineError> {
    let actives = store.all_active().await?;

    // Group per user so duplicate actives are resolved deterministically.
    let mut by_user: HashMap<Uuid, Vec<Session>> = HashMap::new();
    for session in actives {
        by_user.entry(session.user_id).or_default().push(session);
    }

    let mut recovered = 0;
    for (user_id, mut sessions) in by_user {
        sessions.sort_by_key(|s| s.last_activity_at);
        // Duplicates lose as Superseded; the newest is closed as
        // recovered so the audit trail distinguishes the two cases.
        let newest = sessions.pop();
        for stale in sessions {
            store
                .close(stale.id, SessionState::Abandoned, ClosureReason::Superseded)
                .await?;
            recovered += 1;
        }
        if let Some(session) = newest {
            store
                .close(
                    session.id,
                    SessionState::Abandoned,
                    ClosureReason::RecoveredOnStartup,
                )
                .await?;
            recovered += 1;
        }
        info!(%user_id, "recovered stale sessions on startup");
    }
    Ok(recovered)
}

/// What one sweep pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub idempotency_purged: usize,
    pub clarifications_expired: usize,
    pub sessions_timed_out: usize,
    pub entity_pairs_cleared: usize,
}

/// Periodic cleanup job over the shared stores.
pub struct Sweeper {
    config: EngineConfig,
    sessions: Arc<dyn SessionStore>,
    idempotency: Arc<dyn IdempotencyStore>,
    clarifications: Arc<dyn ClarificationStore>,
    entity_state: Arc<dyn ActiveEntityStore>,
}

impl Sweeper {
    pub fn new(
        config: EngineConfig,
        sessions: Arc<dyn SessionStore>,
        idempotency: Arc<dyn IdempotencyStore>,
        clarifications: Arc<dyn ClarificationStore>,
        entity_state: Arc<dyn ActiveEntityStore>,
    ) -> Self {
        Self {
            config,
            sessions,
            idempotency,
            clarifications,
            entity_state,
        }
    }

    /// One sweep pass. Exposed separately so tests and operators can
    /// drive it without the interval loop.
    pub async fn sweep_once(&self) -> Result<SweepReport, EngineError> {
        let now = Utc::now();
        let mut report = SweepReport {
            idempotency_purged: self.idempotency.purge_expired(now).await?,
            clarifications_expired: self.clarifications.expire_overdue(now).await?,
            sessions_timed_out: 0,
            entity_pairs_cleared: self
                .entity_state
                .sweep_expired(self.config.entity_state_ttl)
                .await?,
        };

        for session in self.sessions.all_active().await? {
            if session.is_expired(now) {
                self.sessions
                    .close(session.id, SessionState::Abandoned, ClosureReason::TimedOut)
                    .await?;
                report.sessions_timed_out += 1;
            }
        }

        if report != SweepReport::default() {
            info!(
                idempotency = report.idempotency_purged,
                clarifications = report.clarifications_expired,
                sessions = report.sessions_timed_out,
                entity_pairs = report.entity_pairs_cleared,
                "cleanup sweep"
            );
        }
        Ok(report)
    }

    /// Run forever on the configured interval. Errors are logged and do
    /// not stop the loop.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(error) = self.sweep_once().await {
                tracing::warn!(%error, "cleanup sweep failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InMemoryActiveEntityStore;
    use crate::idempotency::{IdempotencyGuard, InMemoryIdempotencyStore};
    use crate::intent::{
        ClarificationRequest, ClarificationStatus, ClassifiedIntent, InMemoryClarificationStore,
    };
    use crate::intent::IntentKind;
    use crate::message::EngineResponse;
    use crate::session::InMemorySessionStore;
    use std::time::Duration;

    fn sweeper_with_stores() -> (
        Sweeper,
        Arc<InMemorySessionStore>,
        Arc<InMemoryIdempotencyStore>,
        Arc<InMemoryClarificationStore>,
    ) {
        let sessions = Arc::new(InMemorySessionStore::new());
        let idempotency = Arc::new(InMemoryIdempotencyStore::new());
        let clarifications = Arc::new(InMemoryClarificationStore::new());
        let entity_state = Arc::new(InMemoryActiveEntityStore::new());
        let sweeper = Sweeper::new(
            EngineConfig::default(),
            sessions.clone(),
            idempotency.clone(),
            clarifications.clone(),
            entity_state,
        );
        (sweeper, sessions, idempotency, clarifications)
    }

    #[tokio::test]
    async fn test_recover_on_startup_closes_all_actives() {
        let store = InMemorySessionStore::new();
        let user_a = Uuid::new_v4();
        let user_b = Uuid::new_v4();
        store
            .create(Session::new(user_a, Duration::from_secs(7200)))
            .await
            .unwrap();
        store
            .create(Session::new(user_b, Duration::from_secs(7200)))
            .await
            .unwrap();

        let recovered = recover_on_startup(&store).await.unwrap();
        assert_eq!(recovered, 2);
        assert!(store.all_active().await.unwrap().is_empty());
        assert!(store.find_active(user_a).await.unwrap().is_none());
        assert!(store.find_active(user_b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recover_marks_duplicates_superseded() {
        let store = InMemorySessionStore::new();
        let user = Uuid::new_v4();

        let mut older = Session::new(user, Duration::from_secs(7200));
        older.last_activity_at = Utc::now() - chrono::Duration::hours(1);
        let newer = Session::new(user, Duration::from_secs(7200));
        store.save(&older).await.unwrap();
        store.save(&newer).await.unwrap();

        recover_on_startup(&store).await.unwrap();

        let older = store.get(older.id).await.unwrap().unwrap();
        let newer = store.get(newer.id).await.unwrap().unwrap();
        assert_eq!(older.closure_reason, Some(ClosureReason::Superseded));
        assert_eq!(newer.closure_reason, Some(ClosureReason::RecoveredOnStartup));
    }

    #[tokio::test]
    async fn test_sweep_times_out_inactive_sessions() {
        let (sweeper, sessions, _, _) = sweeper_with_stores();
        let user = Uuid::new_v4();

        // Already past its expiry.
        let session = Session::new(user, Duration::from_secs(0));
        sessions.create(session.clone()).await.unwrap();

        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report.sessions_timed_out, 1);

        let closed = sessions.get(session.id).await.unwrap().unwrap();
        assert_eq!(closed.state, SessionState::Abandoned);
        assert_eq!(closed.closure_reason, Some(ClosureReason::TimedOut));
    }

    #[tokio::test]
    async fn test_sweep_purges_idempotency_and_expires_clarifications() {
        let (sweeper, _, idempotency, clarifications) = sweeper_with_stores();

        // Expired idempotency record via zero TTL.
        let guard = IdempotencyGuard::new(idempotency.clone(), Duration::from_secs(0));
        let user_m1 = Uuid::new_v4();
        guard.acquire(user_m1, "m1").await.unwrap();
        guard
            .complete(user_m1, "m1", EngineResponse::reply("x"))
            .await
            .unwrap();

        // Overdue pending clarification.
        let user = Uuid::new_v4();
        let now = Utc::now();
        clarifications
            .create(ClarificationRequest {
                id: Uuid::new_v4(),
                user_id: user,
                prompt: "which one?".to_string(),
                candidates: vec![ClassifiedIntent::new(IntentKind::UpdateSubject, 0.5)],
                context_snapshot: serde_json::json!({}),
                status: ClarificationStatus::Pending,
                created_at: now - chrono::Duration::minutes(10),
                expires_at: now - chrono::Duration::minutes(5),
                answer: None,
            })
            .await
            .unwrap();

        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report.idempotency_purged, 1);
        assert_eq!(report.clarifications_expired, 1);
        assert!(clarifications.find_pending(user).await.unwrap().is_none());
    }
}
