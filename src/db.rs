//! Postgres Persistence
//!
//! Database-backed implementations of the engine's store traits, behind
//! the `database` feature. The structural invariants the in-memory
//! stores enforce with write locks are enforced here with partial
//! unique indexes:
//!
//! - at most one non-terminal session per user
//! - at most one pending clarification per user
//! - first-writer-wins idempotency reservations
//! - session writes guarded by a version column compare-and-swap
//!
//! Enum columns are stored as their snake_case serde tags so the
//! database stays readable and the Rust types remain the source of
//! truth.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::context::{ActiveEntityState, ActiveEntityStore};
use crate::error::EngineError;
use crate::idempotency::{IdempotencyRecord, IdempotencyStore};
use crate::intent::{ClarificationRequest, ClarificationStatus, ClarificationStore, IntentKind};
use crate::message::EngineResponse;
use crate::session::{ClosureReason, Session, SessionState, SessionStore, TransitionRecord};

/// Create the engine's tables and invariant indexes. Idempotent.
pub async fn initialize_schema(pool: &PgPool) -> Result<(), EngineError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS wf_sessions (
            id UUID PRIMARY KEY,
            user_id UUID NOT NULL,
            state TEXT NOT NULL,
            subject_id UUID,
            container_id UUID,
            created_at TIMESTAMPTZ NOT NULL,
            last_activity_at TIMESTAMPTZ NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL,
            metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
            closure_reason TEXT,
            version BIGINT NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(store_err)?;

    // One active session per user, enforced by the database itself.
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS wf_sessions_one_active
        ON wf_sessions (user_id)
        WHERE state NOT IN ('completed', 'abandoned')
        "#,
    )
    .execute(pool)
    .await
    .map_err(store_err)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS wf_transitions (
            id BIGSERIAL PRIMARY KEY,
            session_id UUID NOT NULL,
            from_state TEXT NOT NULL,
            to_state TEXT NOT NULL,
            trigger TEXT NOT NULL,
            success BOOLEAN NOT NULL,
            error TEXT,
            context_snapshot JSONB NOT NULL DEFAULT '{}'::jsonb,
            correlation_id UUID NOT NULL,
            occurred_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(store_err)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS wf_idempotency (
            key TEXT PRIMARY KEY,
            cached_result JSONB,
            processed_at TIMESTAMPTZ NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(store_err)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS wf_clarifications (
            id UUID PRIMARY KEY,
            user_id UUID NOT NULL,
            prompt TEXT NOT NULL,
            candidates JSONB NOT NULL,
            context_snapshot JSONB NOT NULL DEFAULT '{}'::jsonb,
            status TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL,
            answer TEXT
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(store_err)?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS wf_clarifications_one_pending
        ON wf_clarifications (user_id)
        WHERE status = 'pending'
        "#,
    )
    .execute(pool)
    .await
    .map_err(store_err)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS wf_active_entities (
            user_id UUID PRIMARY KEY,
            container_id UUID,
            container_touched_at TIMESTAMPTZ,
            subject_id UUID,
            subject_touched_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(store_err)?;

    Ok(())
}

fn store_err(err: sqlx::Error) -> EngineError {
    EngineError::Store(err.to_string())
}

/// Serde tag for a unit enum variant ("collecting_data" etc).
fn to_tag<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn from_tag<T: DeserializeOwned>(tag: &str) -> Result<T, EngineError> {
    serde_json::from_value(Value::String(tag.to_string()))
        .map_err(|e| EngineError::Store(format!("bad enum tag {tag:?}: {e}")))
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    user_id: Uuid,
    state: String,
    subject_id: Option<Uuid>,
    container_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    metadata: Value,
    closure_reason: Option<String>,
    version: i64,
}

impl SessionRow {
    fn into_session(self) -> Result<Session, EngineError> {
        Ok(Session {
            id: self.id,
            user_id: self.user_id,
            state: from_tag(&self.state)?,
            subject_id: self.subject_id,
            container_id: self.container_id,
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            expires_at: self.expires_at,
            metadata: serde_json::from_value(self.metadata)
                .map_err(|e| EngineError::Store(e.to_string()))?,
            closure_reason: self
                .closure_reason
                .as_deref()
                .map(from_tag::<ClosureReason>)
                .transpose()?,
            version: self.version,
        })
    }
}

pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_row(&self, session: &Session) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO wf_sessions
                (id, user_id, state, subject_id, container_id,
                 created_at, last_activity_at, expires_at, metadata, closure_reason, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(session.id)
        .bind(session.user_id)
        .bind(to_tag(&session.state))
        .bind(session.subject_id)
        .bind(session.container_id)
        .bind(session.created_at)
        .bind(session.last_activity_at)
        .bind(session.expires_at)
        .bind(serde_json::to_value(&session.metadata).unwrap_or_else(|_| Value::Object(Default::default())))
        .bind(session.closure_reason.as_ref().map(to_tag))
        .bind(session.version)
        .execute(&self.pool)
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn create(&self, session: Session) -> Result<Session, EngineError> {
        match self.insert_row(&session).await {
            Ok(()) => Ok(session),
            // The partial unique index caught a racing create.
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(EngineError::SessionRaceConflict(session.user_id))
            }
            Err(err) => Err(store_err(err)),
        }
    }

    async fn find_active(&self, user_id: Uuid) -> Result<Option<Session>, EngineError> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT * FROM wf_sessions
            WHERE user_id = $1 AND state NOT IN ('completed', 'abandoned')
            ORDER BY last_activity_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.map(SessionRow::into_session).transpose()
    }

    async fn get(&self, session_id: Uuid) -> Result<Option<Session>, EngineError> {
        let row = sqlx::query_as::<_, SessionRow>("SELECT * FROM wf_sessions WHERE id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(SessionRow::into_session).transpose()
    }

    async fn save(&self, session: &Session) -> Result<Session, EngineError> {
        let mut updated = session.clone();
        updated.version += 1;

        let rows = sqlx::query(
            r#"
            UPDATE wf_sessions SET
                state = $2,
                subject_id = $3,
                container_id = $4,
                last_activity_at = $5,
                expires_at = $6,
                metadata = $7,
                closure_reason = $8,
                version = $9
            WHERE id = $1 AND version = $10
            "#,
        )
        .bind(session.id)
        .bind(to_tag(&updated.state))
        .bind(updated.subject_id)
        .bind(updated.container_id)
        .bind(updated.last_activity_at)
        .bind(updated.expires_at)
        .bind(serde_json::to_value(&updated.metadata).unwrap_or_else(|_| Value::Object(Default::default())))
        .bind(updated.closure_reason.as_ref().map(to_tag))
        .bind(updated.version)
        .bind(session.version)
        .execute(&self.pool)
        .await
        .map_err(store_err)?
        .rows_affected();

        if rows > 0 {
            return Ok(updated);
        }
        // No row at this version: either the session is absent (insert
        // it) or a concurrent write moved the version (stale).
        if self.get(session.id).await?.is_some() {
            return Err(EngineError::StaleSession(session.id));
        }
        match self.insert_row(&updated).await {
            Ok(()) => Ok(updated),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(EngineError::StaleSession(session.id))
            }
            Err(err) => Err(store_err(err)),
        }
    }

    async fn close(
        &self,
        session_id: Uuid,
        state: SessionState,
        reason: ClosureReason,
    ) -> Result<(), EngineError> {
        let rows = sqlx::query(
            r#"
            UPDATE wf_sessions
            SET state = $2, closure_reason = $3, last_activity_at = $4,
                version = version + 1
            WHERE id = $1
            "#,
        )
        .bind(session_id)
        .bind(to_tag(&state))
        .bind(to_tag(&reason))
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(store_err)?
        .rows_affected();
        if rows == 0 {
            return Err(EngineError::SessionNotFound(session_id));
        }
        Ok(())
    }

    async fn append_transition(&self, record: TransitionRecord) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO wf_transitions
                (session_id, from_state, to_state, trigger, success, error,
                 context_snapshot, correlation_id, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.session_id)
        .bind(to_tag(&record.from_state))
        .bind(to_tag(&record.to_state))
        .bind(&record.trigger)
        .bind(record.success)
        .bind(&record.error)
        .bind(&record.context_snapshot)
        .bind(record.correlation_id)
        .bind(record.occurred_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn transitions(&self, session_id: Uuid) -> Result<Vec<TransitionRecord>, EngineError> {
        #[derive(sqlx::FromRow)]
        struct TransitionRow {
            session_id: Uuid,
            from_state: String,
            to_state: String,
            trigger: String,
            success: bool,
            error: Option<String>,
            context_snapshot: Value,
            correlation_id: Uuid,
            occurred_at: DateTime<Utc>,
        }

        let rows = sqlx::query_as::<_, TransitionRow>(
            r#"
            SELECT session_id, from_state, to_state, trigger, success, error,
                   context_snapshot, correlation_id, occurred_at
            FROM wf_transitions
            WHERE session_id = $1
            ORDER BY id
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.into_iter()
            .map(|r| {
                Ok(TransitionRecord {
                    session_id: r.session_id,
                    from_state: from_tag(&r.from_state)?,
                    to_state: from_tag(&r.to_state)?,
                    trigger: r.trigger,
                    success: r.success,
                    error: r.error,
                    context_snapshot: r.context_snapshot,
                    correlation_id: r.correlation_id,
                    occurred_at: r.occurred_at,
                })
            })
            .collect()
    }

    async fn all_active(&self) -> Result<Vec<Session>, EngineError> {
        let rows = sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM wf_sessions WHERE state NOT IN ('completed', 'abandoned')",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.into_iter().map(SessionRow::into_session).collect()
    }
}

// ---------------------------------------------------------------------------
// Idempotency
// ---------------------------------------------------------------------------

pub struct PgIdempotencyStore {
    pool: PgPool,
}

impl PgIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct IdempotencyRow {
    key: String,
    cached_result: Option<Value>,
    processed_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl IdempotencyRow {
    fn into_record(self) -> Result<IdempotencyRecord, EngineError> {
        Ok(IdempotencyRecord {
            key: self.key,
            // NULL means the owning delivery is still computing.
            cached_result: self
                .cached_result
                .map(serde_json::from_value::<EngineResponse>)
                .transpose()
                .map_err(|e| EngineError::Store(e.to_string()))?,
            processed_at: self.processed_at,
            expires_at: self.expires_at,
        })
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, EngineError> {
        let row = sqlx::query_as::<_, IdempotencyRow>(
            "SELECT * FROM wf_idempotency WHERE key = $1 AND expires_at > $2",
        )
        .bind(key)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.map(IdempotencyRow::into_record).transpose()
    }

    async fn insert(
        &self,
        record: IdempotencyRecord,
    ) -> Result<Option<IdempotencyRecord>, EngineError> {
        let cached = record
            .cached_result
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| EngineError::Store(e.to_string()))?;

        // First writer wins; a writer landing on an *expired* row takes
        // it over (the sweeper may not have purged it yet).
        let rows = sqlx::query(
            r#"
            INSERT INTO wf_idempotency (key, cached_result, processed_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (key) DO UPDATE
                SET cached_result = $2, processed_at = $3, expires_at = $4
                WHERE wf_idempotency.expires_at <= $3
            "#,
        )
        .bind(&record.key)
        .bind(&cached)
        .bind(record.processed_at)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?
        .rows_affected();

        if rows > 0 {
            return Ok(None);
        }
        self.get(&record.key).await
    }

    async fn complete(
        &self,
        key: &str,
        result: EngineResponse,
        expires_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let cached =
            serde_json::to_value(&result).map_err(|e| EngineError::Store(e.to_string()))?;
        // The owner overwrites its own reservation unconditionally.
        sqlx::query(
            r#"
            INSERT INTO wf_idempotency (key, cached_result, processed_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (key) DO UPDATE
                SET cached_result = $2, processed_at = $3, expires_at = $4
            "#,
        )
        .bind(key)
        .bind(&cached)
        .bind(Utc::now())
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn release(&self, key: &str) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM wf_idempotency WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let rows = sqlx::query("DELETE FROM wf_idempotency WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(store_err)?
            .rows_affected();
        Ok(rows as usize)
    }
}

// ---------------------------------------------------------------------------
// Clarifications
// ---------------------------------------------------------------------------

pub struct PgClarificationStore {
    pool: PgPool,
}

impl PgClarificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ClarificationRow {
    id: Uuid,
    user_id: Uuid,
    prompt: String,
    candidates: Value,
    context_snapshot: Value,
    status: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    answer: Option<String>,
}

impl ClarificationRow {
    fn into_request(self) -> Result<ClarificationRequest, EngineError> {
        Ok(ClarificationRequest {
            id: self.id,
            user_id: self.user_id,
            prompt: self.prompt,
            candidates: serde_json::from_value(self.candidates)
                .map_err(|e| EngineError::Store(e.to_string()))?,
            context_snapshot: self.context_snapshot,
            status: from_tag(&self.status)?,
            created_at: self.created_at,
            expires_at: self.expires_at,
            answer: self
                .answer
                .as_deref()
                .map(from_tag::<IntentKind>)
                .transpose()?,
        })
    }
}

#[async_trait]
impl ClarificationStore for PgClarificationStore {
    async fn create(&self, request: ClarificationRequest) -> Result<(), EngineError> {
        let candidates = serde_json::to_value(&request.candidates)
            .map_err(|e| EngineError::Store(e.to_string()))?;

        // Cancel-then-insert in one transaction so the partial unique
        // index never sees two pending rows for the user.
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        sqlx::query(
            "UPDATE wf_clarifications SET status = 'cancelled' WHERE user_id = $1 AND status = 'pending'",
        )
        .bind(request.user_id)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        sqlx::query(
            r#"
            INSERT INTO wf_clarifications
                (id, user_id, prompt, candidates, context_snapshot,
                 status, created_at, expires_at, answer)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(request.id)
        .bind(request.user_id)
        .bind(&request.prompt)
        .bind(&candidates)
        .bind(&request.context_snapshot)
        .bind(to_tag(&request.status))
        .bind(request.created_at)
        .bind(request.expires_at)
        .bind(request.answer.as_ref().map(to_tag))
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    async fn find_pending(
        &self,
        user_id: Uuid,
    ) -> Result<Option<ClarificationRequest>, EngineError> {
        let row = sqlx::query_as::<_, ClarificationRow>(
            "SELECT * FROM wf_clarifications WHERE user_id = $1 AND status = 'pending'",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.map(ClarificationRow::into_request).transpose()
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: ClarificationStatus,
        answer: Option<IntentKind>,
    ) -> Result<(), EngineError> {
        let rows = sqlx::query(
            "UPDATE wf_clarifications SET status = $2, answer = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(to_tag(&status))
        .bind(answer.as_ref().map(to_tag))
        .execute(&self.pool)
        .await
        .map_err(store_err)?
        .rows_affected();
        if rows == 0 {
            return Err(EngineError::Store(format!("clarification {id} not found")));
        }
        Ok(())
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let rows = sqlx::query(
            "UPDATE wf_clarifications SET status = 'expired' WHERE status = 'pending' AND expires_at <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(store_err)?
        .rows_affected();
        Ok(rows as usize)
    }
}

// ---------------------------------------------------------------------------
// Active-entity state
// ---------------------------------------------------------------------------

pub struct PgActiveEntityStore {
    pool: PgPool,
}

impl PgActiveEntityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ActiveEntityRow {
    container_id: Option<Uuid>,
    container_touched_at: Option<DateTime<Utc>>,
    subject_id: Option<Uuid>,
    subject_touched_at: Option<DateTime<Utc>>,
}

#[async_trait]
impl ActiveEntityStore for PgActiveEntityStore {
    async fn get(
        &self,
        user_id: Uuid,
        ttl: std::time::Duration,
    ) -> Result<ActiveEntityState, EngineError> {
        let row = sqlx::query_as::<_, ActiveEntityRow>(
            r#"
            SELECT container_id, container_touched_at, subject_id, subject_touched_at
            FROM wf_active_entities WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        let mut state = match row {
            Some(r) => ActiveEntityState {
                container_id: r.container_id,
                container_touched_at: r.container_touched_at,
                subject_id: r.subject_id,
                subject_touched_at: r.subject_touched_at,
            },
            None => ActiveEntityState::default(),
        };
        // Lazy clear on read, same as the in-memory store; the row
        // itself is cleaned up by the sweeper.
        state.clear_expired(Utc::now(), ttl);
        Ok(state)
    }

    async fn set_subject(&self, user_id: Uuid, subject_id: Uuid) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO wf_active_entities (user_id, subject_id, subject_touched_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE SET subject_id = $2, subject_touched_at = $3
            "#,
        )
        .bind(user_id)
        .bind(subject_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn set_container(&self, user_id: Uuid, container_id: Uuid) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO wf_active_entities (user_id, container_id, container_touched_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE SET container_id = $2, container_touched_at = $3
            "#,
        )
        .bind(user_id)
        .bind(container_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn clear(&self, user_id: Uuid) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM wf_active_entities WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn sweep_expired(&self, ttl: std::time::Duration) -> Result<usize, EngineError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());

        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let cleared = sqlx::query(
            r#"
            UPDATE wf_active_entities
            SET subject_id = CASE WHEN subject_touched_at <= $1 THEN NULL ELSE subject_id END,
                subject_touched_at = CASE WHEN subject_touched_at <= $1 THEN NULL ELSE subject_touched_at END,
                container_id = CASE WHEN container_touched_at <= $1 THEN NULL ELSE container_id END,
                container_touched_at = CASE WHEN container_touched_at <= $1 THEN NULL ELSE container_touched_at END
            WHERE subject_touched_at <= $1 OR container_touched_at <= $1
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?
        .rows_affected();

        sqlx::query("DELETE FROM wf_active_entities WHERE subject_id IS NULL AND container_id IS NULL")
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;

        Ok(cleared as usize)
    }
}
