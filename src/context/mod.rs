//! Context State Builder
//!
//! Resolves "what entity is the user talking about" from three ordered
//! sources. Tier 1 is the explicit per-user active-entity state and is
//! authoritative: when populated, lower tiers are never consulted and
//! no identifier may be invented to override it. Tier 2 scans a bounded
//! window of recent structured tool outputs. Tier 3 falls back to a
//! name lookup in the external subject directory and, on a unique hit,
//! populates Tier 1 for subsequent turns.
//!
//! Invariant: every identifier used for a side-effecting operation
//! originates from one of these tiers; none is ever synthesized from
//! natural language.

pub mod active_entity;
pub mod builder;
pub mod tool_memory;

pub use active_entity::{ActiveEntityState, ActiveEntityStore, InMemoryActiveEntityStore};
pub use builder::ContextStateBuilder;
pub use tool_memory::{ToolMemory, TOOL_MEMORY_WINDOW};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which tier produced the resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Explicit per-user active-entity state.
    Explicit,
    /// Recent structured tool output.
    ToolMemory,
    /// Name lookup against the subject directory.
    Lookup,
}

/// Result of context resolution for one message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedContext {
    pub container_id: Option<Uuid>,
    pub subject_id: Option<Uuid>,
    /// Absent when nothing could be resolved.
    pub tier: Option<Tier>,
}

impl ResolvedContext {
    pub fn empty() -> Self {
        Self::default()
    }
}
