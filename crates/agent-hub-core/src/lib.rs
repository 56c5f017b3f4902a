//! Core building blocks of the agent hub.
//!
//! This crate provides:
//! - `model` - Agents, messages, conversations
//! - `EventLog` - Bounded per-stream history for reconnection support
//! - `Transport` - The delivery channel trait and lifecycle signals
//! - `HubConfig` and the error taxonomy

pub mod config;
pub mod error;
pub mod event_log;
pub mod model;
pub mod traits;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::HubConfig;
pub use error::{ConfigError, ErrorKind, HubError, TransportError};
pub use event_log::{EventId, EventLog, StoredEvent, StreamId};
pub use model::{
    Agent, AgentId, AgentSnapshot, AgentStatus, ClientInfo, Conversation, ConversationId,
    ConversationStatus, ConversationSummary, DeliveryPath, DeliveryResult, Message, MessageId,
    Payload, SendRequest, SessionId,
};
pub use traits::{Delivery, Transport, TransportEvent, TransportKind, TransportSignals};
