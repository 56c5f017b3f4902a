//! Error taxonomy shared by the hub crates.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{AgentId, ConversationId, SessionId};

/// Coarse error class, stable on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    BadRequest,
    Unavailable,
    UnknownOperation,
    Internal,
}

/// Errors surfaced synchronously by hub operations.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),
    #[error("Conversation not found: {0}")]
    ConversationNotFound(ConversationId),
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HubError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::AgentNotFound(_) | Self::ConversationNotFound(_) | Self::SessionNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::UnknownOperation(_) => ErrorKind::UnknownOperation,
            Self::Serialization(_) => ErrorKind::Internal,
        }
    }
}

/// Delivery failure on a transport. Never surfaced to `send_message` callers.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport unavailable: {0}")]
    Unavailable(String),
    #[error("Transport closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::Unavailable
    }
}

/// Invalid configuration value.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(HubError::AgentNotFound("a".into()).kind(), ErrorKind::NotFound);
        assert_eq!(HubError::SessionNotFound("s".into()).kind(), ErrorKind::NotFound);
        assert_eq!(HubError::bad_request("x").kind(), ErrorKind::BadRequest);
        assert_eq!(TransportError::Closed.kind(), ErrorKind::Unavailable);
    }

    #[test]
    fn test_error_kind_wire_names() {
        let json = serde_json::to_string(&ErrorKind::UnknownOperation).unwrap();
        assert_eq!(json, "\"unknown_operation\"");
    }
}
