//! Intent Types
//!
//! Intent labels with a priority hierarchy. P0 intents (cancel/help)
//! always win regardless of confidence; P1 are explicit domain actions;
//! P2 implicit continuations of an in-flight workflow; P3 general
//! navigation; P4 is the fallback.

pub mod classifier;
pub mod conflict;

pub use classifier::{ClassificationContext, IntentClassifier};
pub use conflict::{
    ClarificationRequest, ClarificationStatus, ClarificationStore, ConflictDecision,
    ConflictResolver, InMemoryClarificationStore,
};

use serde::{Deserialize, Serialize};

/// Priority class of an intent. Lower numeric rank wins ties; P0 wins
/// outright regardless of confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
    P4,
}

/// Intent labels the classifier can assign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    // P0: always win
    Cancel,
    Help,
    // P1: explicit domain actions
    UpdateSubject,
    CompleteSubject,
    ListSubjects,
    SelectSubject,
    ReportIssue,
    // P2: implicit continuations
    Affirm,
    Deny,
    ContinueWorkflow,
    // P3: general/navigational
    General,
    // P4: fallback
    Unknown,
}

impl IntentKind {
    pub fn priority(self) -> Priority {
        match self {
            IntentKind::Cancel | IntentKind::Help => Priority::P0,
            IntentKind::UpdateSubject
            | IntentKind::CompleteSubject
            | IntentKind::ListSubjects
            | IntentKind::SelectSubject
            | IntentKind::ReportIssue => Priority::P1,
            IntentKind::Affirm | IntentKind::Deny | IntentKind::ContinueWorkflow => Priority::P2,
            IntentKind::General => Priority::P3,
            IntentKind::Unknown => Priority::P4,
        }
    }

    /// Label shown in clarification options.
    pub fn label(self) -> &'static str {
        match self {
            IntentKind::Cancel => "cancel",
            IntentKind::Help => "help",
            IntentKind::UpdateSubject => "update the item",
            IntentKind::CompleteSubject => "mark the item done",
            IntentKind::ListSubjects => "show the list",
            IntentKind::SelectSubject => "pick an item",
            IntentKind::ReportIssue => "report an issue",
            IntentKind::Affirm => "confirm",
            IntentKind::Deny => "go back",
            IntentKind::ContinueWorkflow => "continue what we were doing",
            IntentKind::General => "something else",
            IntentKind::Unknown => "not sure",
        }
    }
}

/// A classified intent with its confidence in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedIntent {
    pub kind: IntentKind,
    pub confidence: f32,
    /// Free-text argument captured by the trigger phrase, if any
    /// (e.g. the item name in "work on <name>").
    pub argument: Option<String>,
}

impl ClassifiedIntent {
    pub fn new(kind: IntentKind, confidence: f32) -> Self {
        Self {
            kind,
            confidence,
            argument: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::P0 < Priority::P1);
        assert!(Priority::P1 < Priority::P4);
        assert_eq!(IntentKind::Cancel.priority(), Priority::P0);
        assert_eq!(IntentKind::UpdateSubject.priority(), Priority::P1);
        assert_eq!(IntentKind::ContinueWorkflow.priority(), Priority::P2);
        assert_eq!(IntentKind::Unknown.priority(), Priority::P4);
    }
}
