//! Idempotency Guard
//!
//! The chat transport delivers messages at least once, so the same
//! message may arrive twice (or concurrently). The guard deduplicates
//! processing on a `(user_id, message_id)` key, and is the only path
//! allowed to short-circuit the whole pipeline.
//!
//! The key is reserved *before* any work runs: `acquire` inserts an
//! in-progress marker first-writer-wins, so of N concurrent deliveries
//! exactly one computes and runs side effects. The losers wait for the
//! winner's result and replay it; if the winner fails and releases the
//! key, the next delivery gets a fresh attempt. Expired records are
//! purged by the cleanup sweeper, never on the hot path.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::EngineError;
use crate::message::EngineResponse;

/// How long an in-progress reservation blocks the key before another
/// delivery may take it over (crash cover, well above any compute time).
const IN_PROGRESS_TTL: Duration = Duration::from_secs(30);

/// Polling cadence while waiting on a concurrent duplicate's result.
const REPLAY_POLL_INTERVAL: Duration = Duration::from_millis(25);
const REPLAY_POLL_ATTEMPTS: usize = 40;

/// One inbound message's processing record. `cached_result` is `None`
/// while the owning delivery is still computing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub cached_result: Option<EngineResponse>,
    pub processed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn is_in_progress(&self) -> bool {
        self.cached_result.is_none()
    }
}

/// Build the dedup key for a message.
pub fn idempotency_key(user_id: Uuid, message_id: &str) -> String {
    format!("{user_id}:{message_id}")
}

/// Persistence contract for idempotency records.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Look up an unexpired record by key.
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, EngineError>;

    /// Insert a record; first writer wins. Returns the already-stored
    /// record if an unexpired one held the key.
    async fn insert(
        &self,
        record: IdempotencyRecord,
    ) -> Result<Option<IdempotencyRecord>, EngineError>;

    /// Fill in the result on a reserved key and extend its expiry.
    async fn complete(
        &self,
        key: &str,
        result: EngineResponse,
        expires_at: DateTime<Utc>,
    ) -> Result<(), EngineError>;

    /// Drop a reservation so a later delivery can retry.
    async fn release(&self, key: &str) -> Result<(), EngineError>;

    /// Remove all records expired as of `now`. Returns how many were
    /// purged. Called by the sweeper only.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, EngineError>;
}

#[async_trait]
impl<T: IdempotencyStore + ?Sized> IdempotencyStore for std::sync::Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, EngineError> {
        (**self).get(key).await
    }

    async fn insert(
        &self,
        record: IdempotencyRecord,
    ) -> Result<Option<IdempotencyRecord>, EngineError> {
        (**self).insert(record).await
    }

    async fn complete(
        &self,
        key: &str,
        result: EngineResponse,
        expires_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        (**self).complete(key, result, expires_at).await
    }

    async fn release(&self, key: &str) -> Result<(), EngineError> {
        (**self).release(key).await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        (**self).purge_expired(now).await
    }
}

/// In-memory idempotency store.
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    records: RwLock<HashMap<String, IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, EngineError> {
        let records = self.records.read().await;
        // Expired records are treated as absent but left for the sweeper.
        Ok(records
            .get(key)
            .filter(|r| r.expires_at > Utc::now())
            .cloned())
    }

    async fn insert(
        &self,
        record: IdempotencyRecord,
    ) -> Result<Option<IdempotencyRecord>, EngineError> {
        let mut records = self.records.write().await;
        if let Some(existing) = records.get(&record.key) {
            if existing.expires_at > Utc::now() {
                return Ok(Some(existing.clone()));
            }
        }
        records.insert(record.key.clone(), record);
        Ok(None)
    }

    async fn complete(
        &self,
        key: &str,
        result: EngineResponse,
        expires_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let mut records = self.records.write().await;
        records.insert(
            key.to_string(),
            IdempotencyRecord {
                key: key.to_string(),
                cached_result: Some(result),
                processed_at: Utc::now(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn release(&self, key: &str) -> Result<(), EngineError> {
        self.records.write().await.remove(key);
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| r.expires_at > now);
        Ok(before - records.len())
    }
}

/// What `acquire` decided about a delivery.
#[derive(Debug)]
pub enum GuardOutcome {
    /// This delivery owns the key and must compute, then call
    /// `complete` (or `release` on failure).
    Acquired,
    /// A finished duplicate: send its payload again, compute nothing.
    Replay(EngineResponse),
    /// A concurrent duplicate holds the key and did not finish within
    /// the wait window.
    Busy,
}

/// Pipeline-facing guard over an [`IdempotencyStore`].
pub struct IdempotencyGuard<S: IdempotencyStore> {
    store: S,
    ttl: Duration,
}

impl<S: IdempotencyStore> IdempotencyGuard<S> {
    pub fn new(store: S, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Reserve the key for this delivery, or resolve it as a duplicate.
    ///
    /// When the key is held in-progress by a concurrent duplicate, this
    /// waits for the holder to finish and replays its result; a holder
    /// that releases (failed) hands the reservation over instead.
    pub async fn acquire(
        &self,
        user_id: Uuid,
        message_id: &str,
    ) -> Result<GuardOutcome, EngineError> {
        let key = idempotency_key(user_id, message_id);
        for _ in 0..REPLAY_POLL_ATTEMPTS {
            let now = Utc::now();
            let marker = IdempotencyRecord {
                key: key.clone(),
                cached_result: None,
                processed_at: now,
                expires_at: now + ChronoDuration::from_std(IN_PROGRESS_TTL).unwrap_or_default(),
            };
            match self.store.insert(marker).await? {
                None => return Ok(GuardOutcome::Acquired),
                Some(existing) => match existing.cached_result {
                    Some(result) => {
                        tracing::debug!(%user_id, message_id, "duplicate message short-circuited");
                        return Ok(GuardOutcome::Replay(result));
                    }
                    // The winner is still computing.
                    None => tokio::time::sleep(REPLAY_POLL_INTERVAL).await,
                },
            }
        }
        tracing::warn!(%user_id, message_id, "duplicate still in flight after wait window");
        Ok(GuardOutcome::Busy)
    }

    /// Record the final result on a key this delivery acquired. Called
    /// exactly once per computed result, after the response is composed
    /// and before it is considered sent.
    pub async fn complete(
        &self,
        user_id: Uuid,
        message_id: &str,
        result: EngineResponse,
    ) -> Result<EngineResponse, EngineError> {
        let expires_at = Utc::now() + ChronoDuration::from_std(self.ttl).unwrap_or_default();
        self.store
            .complete(&idempotency_key(user_id, message_id), result.clone(), expires_at)
            .await?;
        Ok(result)
    }

    /// Give up an acquired key without a result; the next delivery of
    /// this message id gets a fresh attempt.
    pub async fn release(&self, user_id: Uuid, message_id: &str) -> Result<(), EngineError> {
        self.store
            .release(&idempotency_key(user_id, message_id))
            .await
    }
}
