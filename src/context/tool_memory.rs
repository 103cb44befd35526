//! Short-Term Tool Memory (Tier 2)
//!
//! A per-user bounded window of the most recent structured tool
//! outputs, used to reconstruct "what was the user just shown". Only
//! the newest `TOOL_MEMORY_WINDOW` records are ever consulted; older
//! ones fall off and are never loaded back into working context.

use regex::Regex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::message::ToolOutputRecord;

/// How many recent turns Tier 2 may consult.
pub const TOOL_MEMORY_WINDOW: usize = 3;

/// Per-user rolling window of tool outputs.
pub struct ToolMemory {
    records: RwLock<HashMap<Uuid, VecDeque<ToolOutputRecord>>>,
    positions: PositionPatterns,
}

impl Default for ToolMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolMemory {
    pub fn new() -> Self {
        Self {
            records: RwLock::default(),
            positions: PositionPatterns::compile(),
        }
    }

    /// Record a tool output for a user, evicting beyond the window.
    pub async fn record(&self, user_id: Uuid, record: ToolOutputRecord) {
        let mut records = self.records.write().await;
        let window = records.entry(user_id).or_default();
        window.push_front(record);
        window.truncate(TOOL_MEMORY_WINDOW);
    }

    /// The user's window, newest first.
    pub async fn recent(&self, user_id: Uuid) -> Vec<ToolOutputRecord> {
        let records = self.records.read().await;
        records
            .get(&user_id)
            .map(|w| w.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Resolve a message against the window: a positional reference
    /// ("item 2", "the second one") maps into the most recent listing
    /// output, and a name mentioned in the message matches a listed
    /// title. Returns `(container_id, subject_id)` halves as found.
    pub async fn resolve_reference(
        &self,
        user_id: Uuid,
        text: &str,
    ) -> (Option<Uuid>, Option<Uuid>) {
        let records = self.recent(user_id).await;
        for record in &records {
            let Some(items) = record.output.get("subjects").and_then(Value::as_array) else {
                continue;
            };
            if items.is_empty() {
                continue;
            }

            if let Some(index) = self.positions.index_of(text) {
                if let Some(item) = items.get(index) {
                    return (container_of(record), id_of(item));
                }
            }

            let lowered = text.to_lowercase();
            let by_name = items.iter().find(|item| {
                item.get("title")
                    .and_then(Value::as_str)
                    .map(|t| {
                        let t = t.to_lowercase();
                        lowered.contains(&t) || t.contains(lowered.trim())
                    })
                    .unwrap_or(false)
            });
            if let Some(item) = by_name {
                return (container_of(record), id_of(item));
            }
        }
        (None, None)
    }
}

fn id_of(item: &Value) -> Option<Uuid> {
    item.get("id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
}

fn container_of(record: &ToolOutputRecord) -> Option<Uuid> {
    record
        .input
        .get("container_id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
}

const ORDINALS: [(&str, usize); 4] = [("first", 0), ("second", 1), ("third", 2), ("fourth", 3)];

/// Positional-reference patterns, compiled once at construction.
struct PositionPatterns {
    /// "the second", "first one", "third item". A bare ordinal with no
    /// article or noun ("mark it done first") is not a reference.
    ordinal: Option<Regex>,
    /// "item 2", "number 2", "#2", or a bare number.
    numeric: Option<Regex>,
}

impl PositionPatterns {
    fn compile() -> Self {
        Self {
            ordinal: Regex::new(
                r"\bthe\s+(first|second|third|fourth)\b|\b(first|second|third|fourth)\s+(?:one|item|task)\b",
            )
            .ok(),
            numeric: Regex::new(r"(?:item|number|#)\s*(\d+)|^\s*(\d+)\s*$").ok(),
        }
    }

    /// Parse a 1-based positional reference out of free text, returning
    /// a 0-based index.
    fn index_of(&self, text: &str) -> Option<usize> {
        let lowered = text.to_lowercase();
        if let Some(captures) = self.ordinal.as_ref().and_then(|re| re.captures(&lowered)) {
            let word = captures.get(1).or_else(|| captures.get(2))?.as_str();
            return ORDINALS.iter().find(|(w, _)| *w == word).map(|(_, i)| *i);
        }
        let captures = self.numeric.as_ref()?.captures(&lowered)?;
        let digits = captures.get(1).or_else(|| captures.get(2))?;
        let position: usize = digits.as_str().parse().ok()?;
        position.checked_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn listing(container: Uuid, ids: &[Uuid]) -> ToolOutputRecord {
        ToolOutputRecord::new(
            "list_subjects",
            json!({ "container_id": container.to_string() }),
            json!({
                "subjects": ids
                    .iter()
                    .enumerate()
                    .map(|(i, id)| json!({ "id": id.to_string(), "title": format!("Task {}", i + 1) }))
                    .collect::<Vec<_>>()
            }),
        )
    }

    #[test]
    fn test_positional_index_parsing() {
        let positions = PositionPatterns::compile();
        assert_eq!(positions.index_of("item 2"), Some(1));
        assert_eq!(positions.index_of("the second one"), Some(1));
        assert_eq!(positions.index_of("the first"), Some(0));
        assert_eq!(positions.index_of("first one"), Some(0));
        assert_eq!(positions.index_of("#3"), Some(2));
        assert_eq!(positions.index_of("2"), Some(1));
        assert_eq!(positions.index_of("item 0"), None);
        assert_eq!(positions.index_of("mark it done"), None);
        // An ordinal used as an adverb is not a reference.
        assert_eq!(positions.index_of("mark it done first"), None);
    }

    #[tokio::test]
    async fn test_window_is_bounded() {
        let memory = ToolMemory::new();
        let user = Uuid::new_v4();
        for i in 0..5 {
            memory
                .record(
                    user,
                    ToolOutputRecord::new(format!("tool_{i}"), json!({}), json!({})),
                )
                .await;
        }
        let recent = memory.recent(user).await;
        assert_eq!(recent.len(), TOOL_MEMORY_WINDOW);
        // Newest first; the oldest two fell off.
        assert_eq!(recent[0].tool_name, "tool_4");
        assert_eq!(recent[2].tool_name, "tool_2");
    }

    #[tokio::test]
    async fn test_positional_resolution_against_last_listing() {
        let memory = ToolMemory::new();
        let user = Uuid::new_v4();
        let container = Uuid::new_v4();
        let ids = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        memory.record(user, listing(container, &ids)).await;

        let (resolved_container, resolved_subject) =
            memory.resolve_reference(user, "item 2").await;
        assert_eq!(resolved_container, Some(container));
        assert_eq!(resolved_subject, Some(ids[1]));
    }

    #[tokio::test]
    async fn test_name_resolution() {
        let memory = ToolMemory::new();
        let user = Uuid::new_v4();
        let container = Uuid::new_v4();
        let ids = [Uuid::new_v4(), Uuid::new_v4()];
        memory.record(user, listing(container, &ids)).await;

        let (_, resolved) = memory.resolve_reference(user, "open task 2 please").await;
        assert_eq!(resolved, Some(ids[1]));
    }

    #[tokio::test]
    async fn test_no_window_no_resolution() {
        let memory = ToolMemory::new();
        let (container, subject) = memory.resolve_reference(Uuid::new_v4(), "item 1").await;
        assert!(container.is_none());
        assert!(subject.is_none());
    }
}
