//! Conversational workflow engine for multi-turn chat sessions.
//!
//! The engine receives transport-delivered messages (at-least-once, so
//! duplicates happen) and drives per-user workflow sessions through an
//! explicit state machine. The load-bearing pieces:
//!
//! - [`idempotency`]: dedup of inbound messages on `(user, message_id)`
//!   so side effects run at most once per logical message.
//! - [`session`]: one active session per user, enforced structurally in
//!   the store, with a full transition audit log.
//! - [`fsm`]: the fixed transition table, typed guards and side effects,
//!   executed by [`fsm::FsmEngine`].
//! - [`intent`]: trigger-phrase classification with a priority
//!   hierarchy, plus clarification when candidates are too close.
//! - [`context`]: three-tier resolution of "which entity is the user
//!   talking about"; identifiers are never invented from free text.
//! - [`pipeline`]: the per-message orchestration of all of the above.
//! - [`recovery`]: startup reconciliation and the periodic cleanup
//!   sweeper.
//!
//! Persistence is behind `async` store traits with in-memory
//! implementations; the `database` feature adds Postgres-backed ones.

pub mod config;
pub mod context;
pub mod domain;
pub mod error;
pub mod fsm;
pub mod idempotency;
pub mod intent;
pub mod message;
pub mod pipeline;
pub mod recovery;
pub mod session;

#[cfg(feature = "database")]
pub mod db;

pub use config::EngineConfig;
pub use error::EngineError;
pub use fsm::{FsmEngine, Trigger, TriggerInput};
pub use message::{EngineResponse, InboundMessage, ResponseKind, SelectionPayload};
pub use pipeline::MessagePipeline;
pub use session::{Session, SessionState, SessionStore};
