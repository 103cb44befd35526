//! Engine Configuration
//!
//! TTLs and thresholds for the pipeline. The four TTLs serve different
//! purposes and are deliberately separate fields: idempotency records
//! outlive clarifications by orders of magnitude, and the explicit
//! active-entity window outlives the session inactivity window.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunable parameters for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long a processed (user, message-id) pair stays deduplicated.
    #[serde(default = "default_idempotency_ttl")]
    pub idempotency_ttl: Duration,

    /// How long a pending clarification waits for an answer.
    #[serde(default = "default_clarification_ttl")]
    pub clarification_ttl: Duration,

    /// Inactivity window after which a session times out.
    #[serde(default = "default_session_inactivity_ttl")]
    pub session_inactivity_ttl: Duration,

    /// Inactivity window for each explicit active-entity pair (Tier 1).
    #[serde(default = "default_entity_state_ttl")]
    pub entity_state_ttl: Duration,

    /// Minimum confidence gap between the top two intent candidates
    /// before the winner is accepted without clarification.
    #[serde(default = "default_ambiguity_gap")]
    pub ambiguity_gap: f32,

    /// Interval between cleanup sweeps.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: Duration,
}

fn default_idempotency_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_clarification_ttl() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_session_inactivity_ttl() -> Duration {
    Duration::from_secs(2 * 60 * 60)
}

fn default_entity_state_ttl() -> Duration {
    Duration::from_secs(7 * 60 * 60)
}

fn default_ambiguity_gap() -> f32 {
    0.15
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idempotency_ttl: default_idempotency_ttl(),
            clarification_ttl: default_clarification_ttl(),
            session_inactivity_ttl: default_session_inactivity_ttl(),
            entity_state_ttl: default_entity_state_ttl(),
            ambiguity_gap: default_ambiguity_gap(),
            sweep_interval: default_sweep_interval(),
        }
    }
}
