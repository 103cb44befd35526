//! Three-Tier Context Resolution
//!
//! Order is load-bearing: explicit state wins outright, the recent tool
//! window is only consulted when explicit state is empty, and the name
//! lookup only runs when both are empty. A unique Tier-3 hit promotes
//! the id into Tier 1 so later turns resolve from explicit state.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::active_entity::ActiveEntityStore;
use super::tool_memory::ToolMemory;
use super::{ResolvedContext, Tier};
use crate::domain::{NameLookup, SubjectDirectory};
use crate::error::EngineError;

pub struct ContextStateBuilder {
    entity_store: Arc<dyn ActiveEntityStore>,
    tool_memory: Arc<ToolMemory>,
    directory: Arc<dyn SubjectDirectory>,
    entity_state_ttl: Duration,
}

impl ContextStateBuilder {
    pub fn new(
        entity_store: Arc<dyn ActiveEntityStore>,
        tool_memory: Arc<ToolMemory>,
        directory: Arc<dyn SubjectDirectory>,
        entity_state_ttl: Duration,
    ) -> Self {
        Self {
            entity_store,
            tool_memory,
            directory,
            entity_state_ttl,
        }
    }

    /// Resolve the entity context for a message.
    pub async fn resolve(
        &self,
        user_id: Uuid,
        text: &str,
    ) -> Result<ResolvedContext, EngineError> {
        // Tier 1: explicit state is authoritative. Expired pairs were
        // already cleared on read.
        let explicit = self.entity_store.get(user_id, self.entity_state_ttl).await?;
        if !explicit.is_empty() {
            debug!(%user_id, subject = ?explicit.subject_id, "context resolved from explicit state");
            return Ok(ResolvedContext {
                container_id: explicit.container_id,
                subject_id: explicit.subject_id,
                tier: Some(Tier::Explicit),
            });
        }

        // Tier 2: the bounded recent tool window.
        let (container_id, subject_id) = self.tool_memory.resolve_reference(user_id, text).await;
        if subject_id.is_some() || container_id.is_some() {
            debug!(%user_id, ?subject_id, "context resolved from tool memory");
            return Ok(ResolvedContext {
                container_id,
                subject_id,
                tier: Some(Tier::ToolMemory),
            });
        }

        // Tier 3: name lookup, and promote a unique hit into Tier 1.
        if let Some(name) = lookup_candidate(text) {
            if let NameLookup::Found(id) = self.directory.find_by_name(None, &name).await? {
                let container_id = self
                    .directory
                    .get_subject(id)
                    .await?
                    .map(|s| s.container_id);
                self.entity_store.set_subject(user_id, id).await?;
                if let Some(container) = container_id {
                    self.entity_store.set_container(user_id, container).await?;
                }
                debug!(%user_id, subject = %id, "context resolved from name lookup");
                return Ok(ResolvedContext {
                    container_id,
                    subject_id: Some(id),
                    tier: Some(Tier::Lookup),
                });
            }
        }

        Ok(ResolvedContext::empty())
    }

    /// Record an explicit subject selection (Tier-1 write path used by
    /// the pipeline when the user picks an item).
    pub async fn set_active_subject(
        &self,
        user_id: Uuid,
        subject_id: Uuid,
        container_id: Option<Uuid>,
    ) -> Result<(), EngineError> {
        self.entity_store.set_subject(user_id, subject_id).await?;
        if let Some(container) = container_id {
            self.entity_store.set_container(user_id, container).await?;
        }
        Ok(())
    }

    /// Clear Tier-1 state (workflow finished or abandoned the subject).
    pub async fn clear_active(&self, user_id: Uuid) -> Result<(), EngineError> {
        self.entity_store.clear(user_id).await
    }
}

/// Extract a plausible entity name from free text for Tier-3 lookup.
/// Deliberately conservative: only text the user plainly used as a name
/// (quoted, or following a referring verb) is eligible; the engine
/// never fabricates an identifier from arbitrary words.
fn lookup_candidate(text: &str) -> Option<String> {
    let trimmed = text.trim();

    if let Some(start) = trimmed.find('"') {
        if let Some(end) = trimmed[start + 1..].find('"') {
            let quoted = &trimmed[start + 1..start + 1 + end];
            if !quoted.is_empty() {
                return Some(quoted.to_string());
            }
        }
    }

    let lowered = trimmed.to_lowercase();
    for prefix in [
        "work on ", "open ", "update ", "switch to ", "select ", "pick ", "about ",
    ] {
        if let Some(pos) = lowered.find(prefix) {
            let candidate = trimmed[pos + prefix.len()..].trim();
            let candidate = candidate
                .trim_start_matches("the ")
                .trim_end_matches(['.', '?', '!']);
            if candidate.len() > 2 {
                return Some(candidate.to_string());
            }
        }
    }
    None
}
