//! Subject Directory Collaborator
//!
//! Contract for the external task/project data store. The engine only
//! ever calls this from FSM side effects and Tier-3 name lookup; it
//! never owns the domain data.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::EngineError;

/// A domain entity the user works on (task, ticket, work item).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectRecord {
    pub id: Uuid,
    pub container_id: Uuid,
    pub title: String,
    #[serde(default)]
    pub fields: HashMap<String, Value>,
}

/// Outcome of a name-based lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameLookup {
    Found(Uuid),
    Ambiguous(Vec<Uuid>),
    NotFound,
}

/// External domain store interface.
///
/// Called only from within FSM transition side effects or Tier-3
/// context lookup; no other component touches domain data.
#[async_trait]
pub trait SubjectDirectory: Send + Sync {
    async fn list_subjects(&self, container_id: Uuid) -> Result<Vec<SubjectRecord>, EngineError>;

    async fn get_subject(&self, id: Uuid) -> Result<Option<SubjectRecord>, EngineError>;

    async fn update_subject(&self, id: Uuid, patch: Value) -> Result<(), EngineError>;

    /// Name lookup, optionally scoped to a container.
    async fn find_by_name(
        &self,
        container_id: Option<Uuid>,
        name: &str,
    ) -> Result<NameLookup, EngineError>;
}

/// In-memory directory for tests and demos. `fail_next` makes the next
/// mutating call fail, to exercise the side-effect failure path.
#[derive(Default)]
pub struct InMemorySubjectDirectory {
    subjects: RwLock<HashMap<Uuid, SubjectRecord>>,
    fail_next: AtomicBool,
}

impl InMemorySubjectDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, subject: SubjectRecord) {
        self.subjects.write().await.insert(subject.id, subject);
    }

    /// Arm a one-shot failure on the next `update_subject` call.
    pub fn fail_next_update(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SubjectDirectory for InMemorySubjectDirectory {
    async fn list_subjects(&self, container_id: Uuid) -> Result<Vec<SubjectRecord>, EngineError> {
        let subjects = self.subjects.read().await;
        let mut matching: Vec<SubjectRecord> = subjects
            .values()
            .filter(|s| s.container_id == container_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.title.cmp(&b.title));
        Ok(matching)
    }

    async fn get_subject(&self, id: Uuid) -> Result<Option<SubjectRecord>, EngineError> {
        Ok(self.subjects.read().await.get(&id).cloned())
    }

    async fn update_subject(&self, id: Uuid, patch: Value) -> Result<(), EngineError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(EngineError::SideEffect(
                "subject directory unavailable".to_string(),
            ));
        }

        let mut subjects = self.subjects.write().await;
        let subject = subjects
            .get_mut(&id)
            .ok_or_else(|| EngineError::SideEffect(format!("unknown subject {id}")))?;

        if let Value::Object(map) = patch {
            for (key, value) in map {
                if key == "title" {
                    if let Value::String(title) = &value {
                        subject.title = title.clone();
                    }
                }
                subject.fields.insert(key, value);
            }
        }
        Ok(())
    }

    async fn find_by_name(
        &self,
        container_id: Option<Uuid>,
        name: &str,
    ) -> Result<NameLookup, EngineError> {
        let needle = name.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(NameLookup::NotFound);
        }

        let subjects = self.subjects.read().await;
        let hits: Vec<Uuid> = subjects
            .values()
            .filter(|s| container_id.map(|c| s.container_id == c).unwrap_or(true))
            .filter(|s| s.title.to_lowercase().contains(&needle))
            .map(|s| s.id)
            .collect();

        Ok(match hits.len() {
            0 => NameLookup::NotFound,
            1 => NameLookup::Found(hits[0]),
            _ => NameLookup::Ambiguous(hits),
        })
    }
}
