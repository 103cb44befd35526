//! Explicit Active-Entity State (Tier 1)
//!
//! One row per user holding the container and subject the user is
//! explicitly working on, each with its own last-activity timestamp.
//! The two pairs expire independently after a fixed inactivity window
//! and are cleared lazily on read when expired (the sweeper also clears
//! them eagerly). All access goes through this accessor; there is no
//! process-wide "current entity" variable anywhere.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::EngineError;

/// Per-user explicit entity state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActiveEntityState {
    pub container_id: Option<Uuid>,
    pub container_touched_at: Option<DateTime<Utc>>,
    pub subject_id: Option<Uuid>,
    pub subject_touched_at: Option<DateTime<Utc>>,
}

impl ActiveEntityState {
    /// Drop whichever pairs are past the inactivity window. Returns
    /// whether anything was cleared.
    pub fn clear_expired(&mut self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let ttl = ChronoDuration::from_std(ttl).unwrap_or_default();
        let mut cleared = false;

        if let Some(touched) = self.container_touched_at {
            if now - touched >= ttl {
                self.container_id = None;
                self.container_touched_at = None;
                cleared = true;
            }
        }
        if let Some(touched) = self.subject_touched_at {
            if now - touched >= ttl {
                self.subject_id = None;
                self.subject_touched_at = None;
                cleared = true;
            }
        }
        cleared
    }

    pub fn is_empty(&self) -> bool {
        self.container_id.is_none() && self.subject_id.is_none()
    }
}

/// Persistence contract for Tier-1 state.
#[async_trait]
pub trait ActiveEntityStore: Send + Sync {
    /// The user's state with expired pairs already cleared.
    async fn get(&self, user_id: Uuid, ttl: Duration) -> Result<ActiveEntityState, EngineError>;

    /// Set (and touch) the active subject.
    async fn set_subject(&self, user_id: Uuid, subject_id: Uuid) -> Result<(), EngineError>;

    /// Set (and touch) the active container.
    async fn set_container(&self, user_id: Uuid, container_id: Uuid) -> Result<(), EngineError>;

    /// Explicitly clear both pairs (e.g. when a workflow ends).
    async fn clear(&self, user_id: Uuid) -> Result<(), EngineError>;

    /// Sweep expired pairs for all users. Returns users touched.
    async fn sweep_expired(&self, ttl: Duration) -> Result<usize, EngineError>;
}

/// In-memory Tier-1 store.
#[derive(Default)]
pub struct InMemoryActiveEntityStore {
    state: RwLock<HashMap<Uuid, ActiveEntityState>>,
}

impl InMemoryActiveEntityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ActiveEntityStore for InMemoryActiveEntityStore {
    async fn get(&self, user_id: Uuid, ttl: Duration) -> Result<ActiveEntityState, EngineError> {
        let mut state = self.state.write().await;
        let entry = state.entry(user_id).or_default();
        // Lazy clear on read keeps the invariant even without a sweeper.
        entry.clear_expired(Utc::now(), ttl);
        Ok(entry.clone())
    }

    async fn set_subject(&self, user_id: Uuid, subject_id: Uuid) -> Result<(), EngineError> {
        let mut state = self.state.write().await;
        let entry = state.entry(user_id).or_default();
        entry.subject_id = Some(subject_id);
        entry.subject_touched_at = Some(Utc::now());
        Ok(())
    }

    async fn set_container(&self, user_id: Uuid, container_id: Uuid) -> Result<(), EngineError> {
        let mut state = self.state.write().await;
        let entry = state.entry(user_id).or_default();
        entry.container_id = Some(container_id);
        entry.container_touched_at = Some(Utc::now());
        Ok(())
    }

    async fn clear(&self, user_id: Uuid) -> Result<(), EngineError> {
        self.state.write().await.remove(&user_id);
        Ok(())
    }

    async fn sweep_expired(&self, ttl: Duration) -> Result<usize, EngineError> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let mut touched = 0;
        state.retain(|_, entry| {
            if entry.clear_expired(now, ttl) {
                touched += 1;
            }
            !entry.is_empty()
        });
        Ok(touched)
    }
}
