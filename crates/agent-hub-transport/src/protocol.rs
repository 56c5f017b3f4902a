//! Wire protocol for client-hub communication.

use std::{fmt, str::FromStr};

use agent_hub_core::{
    ClientInfo, ErrorKind, EventId, HubError, Message, SessionId, StreamId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message from client to hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open a session. Must be the first frame.
    Initialize {
        #[serde(default)]
        client_info: Option<ClientInfo>,
    },
    /// Invoke a hub operation.
    Call {
        id: u64,
        operation: String,
        #[serde(default)]
        args: Value,
    },
    /// Keepalive.
    Ping,
    /// End the session.
    Terminate,
}

/// Message from hub to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Session opened.
    Initialized { session_id: SessionId },
    /// Successful call.
    Result { id: u64, result: Value },
    /// Failed call, or a frame that could not be handled.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        code: ErrorKind,
        message: String,
    },
    /// A message pushed to the agent bound to this session.
    Message {
        /// Stream cursor, set on streaming transports.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
        message: Message,
    },
    /// Keepalive response.
    Pong,
}

impl ServerMessage {
    /// Error frame for a failed hub call.
    #[must_use]
    pub fn error(id: Option<u64>, error: &HubError) -> Self {
        Self::Error {
            id,
            code: error.kind(),
            message: error.to_string(),
        }
    }

    /// Reply frame for the call with the given id.
    #[must_use]
    pub fn reply(id: u64, result: Result<Value, HubError>) -> Self {
        match result {
            Ok(result) => Self::Result { id, result },
            Err(e) => Self::error(Some(id), &e),
        }
    }
}

/// Position in an event stream, `<stream_id>:<event_id>` on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCursor {
    pub stream_id: StreamId,
    pub event_id: EventId,
}

impl StreamCursor {
    #[must_use]
    pub fn new(stream_id: impl Into<StreamId>, event_id: EventId) -> Self {
        Self {
            stream_id: stream_id.into(),
            event_id,
        }
    }
}

impl fmt::Display for StreamCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.stream_id, self.event_id)
    }
}

impl FromStr for StreamCursor {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || HubError::bad_request(format!("invalid stream cursor: {s:?}"));
        let (stream_id, event_id) = s.rsplit_once(':').ok_or_else(invalid)?;
        if stream_id.is_empty() {
            return Err(invalid());
        }
        let event_id = event_id.parse::<EventId>().map_err(|_| invalid())?;
        Ok(Self::new(stream_id, event_id))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_client_frames() {
        let frame: ClientMessage = serde_json::from_value(json!({
            "type": "call",
            "id": 7,
            "operation": "list_agents"
        }))
        .unwrap();
        assert_eq!(
            frame,
            ClientMessage::Call {
                id: 7,
                operation: "list_agents".into(),
                args: Value::Null,
            }
        );

        let frame: ClientMessage = serde_json::from_str(r#"{"type":"initialize"}"#).unwrap();
        assert_eq!(frame, ClientMessage::Initialize { client_info: None });
    }

    #[test]
    fn test_error_frame_shape() {
        let frame = ServerMessage::error(Some(3), &HubError::AgentNotFound("ghost".into()));
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["id"], 3);
        assert_eq!(json["code"], "not_found");
        assert_eq!(json["message"], "Agent not found: ghost");

        let json = serde_json::to_value(ServerMessage::Pong).unwrap();
        assert_eq!(json, json!({"type": "pong"}));
    }

    #[test]
    fn test_cursor_parsing() {
        let cursor: StreamCursor = "session-1:42".parse().unwrap();
        assert_eq!(cursor.stream_id, "session-1");
        assert_eq!(cursor.event_id, EventId::new(42));
        assert_eq!(cursor.to_string(), "session-1:42");

        // Only the last colon separates the event id.
        let cursor: StreamCursor = "a:b:3".parse().unwrap();
        assert_eq!(cursor.stream_id, "a:b");

        for bad in ["", "42", ":4", "s1:", "s1:x"] {
            assert!(bad.parse::<StreamCursor>().is_err(), "{bad} should not parse");
        }
    }
}
