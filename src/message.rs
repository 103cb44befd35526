//! Message Types
//!
//! The inbound and outbound surface of the engine. The transport
//! delivers [`InboundMessage`]s at-least-once (duplicates possible) and
//! the engine produces [`EngineResponse`]s; formatting and delivery of
//! responses belong to the transport collaborator, not to this crate.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A message delivered by the chat transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub user_id: Uuid,
    /// Transport-assigned message id; combined with `user_id` it forms
    /// the idempotency key.
    pub message_id: String,
    pub text: String,
    /// Structured selection (button tap, list pick) if the transport
    /// captured one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionPayload>,
}

impl InboundMessage {
    pub fn new(user_id: Uuid, message_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            user_id,
            message_id: message_id.into(),
            text: text.into(),
            selection: None,
        }
    }

    pub fn with_selection(mut self, selection: SelectionPayload) -> Self {
        self.selection = Some(selection);
        self
    }
}

/// A structured choice attached to an inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum SelectionPayload {
    /// Positional pick from the options last shown (1-based).
    Position { index: usize },
    /// Direct entity reference.
    Subject { subject_id: Uuid },
    /// Identifier of a clarification option.
    Option { option_id: String },
}

/// What kind of reply the engine is producing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    /// Normal conversational reply.
    Reply,
    /// A clarification question the user is expected to answer.
    Clarification,
    /// A recoverable external failure; the user may retry.
    RetryableError,
}

/// One selectable option presented to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseOption {
    /// Stable identifier echoed back in a [`SelectionPayload::Option`].
    pub id: String,
    pub label: String,
}

/// The engine's outbound payload. Text plus optional structured options;
/// the transport decides how to render them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineResponse {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<ResponseOption>,
    pub kind: ResponseKind,
}

impl EngineResponse {
    pub fn reply(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            options: Vec::new(),
            kind: ResponseKind::Reply,
        }
    }

    pub fn clarification(text: impl Into<String>, options: Vec<ResponseOption>) -> Self {
        Self {
            text: text.into(),
            options,
            kind: ResponseKind::Clarification,
        }
    }

    pub fn retryable_error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            options: Vec::new(),
            kind: ResponseKind::RetryableError,
        }
    }

    pub fn with_options(mut self, options: Vec<ResponseOption>) -> Self {
        self.options = options;
        self
    }
}

/// Compact record of a structured tool output attached to an outbound
/// turn. Tier-2 context resolution reads only a bounded window of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutputRecord {
    pub tool_name: String,
    pub input: Value,
    pub output: Value,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

impl ToolOutputRecord {
    pub fn new(tool_name: impl Into<String>, input: Value, output: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            input,
            output,
            recorded_at: chrono::Utc::now(),
        }
    }
}
