//! Agents, messages and conversations shared by every hub crate.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Caller-supplied agent identifier.
pub type AgentId = String;
/// Conversation identifier (caller-supplied or hub-generated).
pub type ConversationId = String;
/// Hub-generated message identifier.
pub type MessageId = String;
/// Session identifier.
pub type SessionId = String;
/// Opaque structured message body.
pub type Payload = Map<String, Value>;

/// Version recorded when a registration does not name one.
pub const DEFAULT_AGENT_VERSION: &str = "1.0.0";

/// Agent status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Agent is idle and accepting work.
    #[default]
    Ready,
    /// Agent is processing.
    Busy,
    /// Agent reported a failure.
    Error,
    /// Agent is known but unreachable.
    Offline,
}

/// Registry record of an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: AgentId,
    pub agent_type: String,
    pub version: String,
    pub status: AgentStatus,
    /// Number of messages this agent has sent through the hub.
    pub messages_processed: u64,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl Agent {
    /// Create a fresh record in the `ready` state.
    #[must_use]
    pub fn new(
        agent_id: impl Into<AgentId>,
        agent_type: impl Into<String>,
        version: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            version: version.unwrap_or_else(|| DEFAULT_AGENT_VERSION.to_string()),
            status: AgentStatus::Ready,
            messages_processed: 0,
            registered_at: now,
            last_heartbeat: now,
        }
    }

    /// Refresh the heartbeat timestamp.
    pub fn beat(&mut self) {
        self.last_heartbeat = Utc::now();
    }
}

/// Read-only view of an agent handed out by `list_agents`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    #[serde(flatten)]
    pub agent: Agent,
    /// Messages waiting in the agent's inbound queue.
    pub queued_messages: usize,
    /// Whether a live session is bound to the agent.
    pub online: bool,
}

/// A routed message. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub from_agent: AgentId,
    pub to_agent: AgentId,
    pub timestamp: DateTime<Utc>,
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default)]
    pub requires_response: bool,
}

impl Message {
    /// Build a message with a fresh id and the current timestamp.
    #[must_use]
    pub fn new(conversation_id: ConversationId, request: &SendRequest) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            conversation_id,
            from_agent: request.from_agent.clone(),
            to_agent: request.to_agent.clone(),
            timestamp: Utc::now(),
            payload: request.payload.clone(),
            reply_to: request.reply_to.clone(),
            requires_response: request.requires_response,
        }
    }
}

/// Arguments of a `send_message` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRequest {
    pub from_agent: AgentId,
    pub to_agent: AgentId,
    pub payload: Payload,
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
    #[serde(default)]
    pub requires_response: bool,
}

impl SendRequest {
    /// Fire-and-forget request with no conversation hint.
    #[must_use]
    pub fn new(from_agent: impl Into<AgentId>, to_agent: impl Into<AgentId>, payload: Payload) -> Self {
        Self {
            from_agent: from_agent.into(),
            to_agent: to_agent.into(),
            payload,
            conversation_id: None,
            reply_to: None,
            requires_response: false,
        }
    }

    /// Route into a specific conversation.
    #[must_use]
    pub fn in_conversation(mut self, conversation_id: impl Into<ConversationId>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    /// Mark as a reply to an earlier message.
    #[must_use]
    pub fn replying_to(mut self, message_id: impl Into<MessageId>) -> Self {
        self.reply_to = Some(message_id.into());
        self
    }

    /// Set the `requires_response` flag.
    #[must_use]
    pub const fn expecting_response(mut self, requires_response: bool) -> Self {
        self.requires_response = requires_response;
        self
    }
}

/// Conversation status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    #[default]
    Active,
    /// The latest message asked for a response.
    Waiting,
    Completed,
    Failed,
}

impl ConversationStatus {
    /// `completed` and `failed` are never left once entered.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Ordered exchange of messages between a pair of agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: ConversationId,
    pub participants: BTreeSet<AgentId>,
    pub messages: Vec<Message>,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Start an empty conversation between `a` and `b`.
    #[must_use]
    pub fn new(conversation_id: impl Into<ConversationId>, a: &str, b: &str) -> Self {
        let now = Utc::now();
        Self {
            conversation_id: conversation_id.into(),
            participants: [a.to_string(), b.to_string()].into_iter().collect(),
            messages: Vec::new(),
            status: ConversationStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the participants are exactly `{a, b}`.
    #[must_use]
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        let expected: BTreeSet<&str> = [a, b].into_iter().collect();
        self.participants.len() == expected.len()
            && self.participants.iter().all(|p| expected.contains(p.as_str()))
    }

    /// Append a message and apply the waiting/active transition.
    pub fn append(&mut self, message: Message) {
        if !self.status.is_terminal() {
            if message.requires_response {
                self.status = ConversationStatus::Waiting;
            } else if self.status == ConversationStatus::Waiting {
                self.status = ConversationStatus::Active;
            }
        }
        self.updated_at = message.timestamp;
        self.messages.push(message);
    }

    /// Summary without the message history.
    #[must_use]
    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            conversation_id: self.conversation_id.clone(),
            participants: self.participants.clone(),
            message_count: self.messages.len(),
            status: self.status,
            updated_at: self.updated_at,
        }
    }
}

/// Conversation listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub participants: BTreeSet<AgentId>,
    pub message_count: usize,
    pub status: ConversationStatus,
    pub updated_at: DateTime<Utc>,
}

/// How a sent message reached (or did not yet reach) its recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "path", rename_all = "snake_case")]
pub enum DeliveryPath {
    /// Pushed as a notification on a duplex channel.
    Pushed,
    /// Logged and handed to a live event stream.
    Streamed { event_id: String },
    /// Left in the inbound queue only.
    Queued,
}

/// Outcome of `send_message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    /// Recipient queue length after the append (1-indexed position).
    pub queue_position: usize,
    pub delivery: DeliveryPath,
}

/// Client identity announced during the transport handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl ClientInfo {
    #[must_use]
    pub fn new(name: impl Into<String>, version: Option<String>) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn message(conversation: &Conversation, from: &str, to: &str, requires_response: bool) -> Message {
        let request = SendRequest::new(from, to, payload(json!({"n": 1})))
            .expecting_response(requires_response);
        Message::new(conversation.conversation_id.clone(), &request)
    }

    #[test]
    fn test_agent_defaults() {
        let agent = Agent::new("agent1", "worker", None);
        assert_eq!(agent.version, DEFAULT_AGENT_VERSION);
        assert_eq!(agent.status, AgentStatus::Ready);
        assert_eq!(agent.messages_processed, 0);
    }

    #[test]
    fn test_waiting_then_active() {
        let mut conv = Conversation::new("c1", "a", "b");
        conv.append(message(&conv, "a", "b", true));
        assert_eq!(conv.status, ConversationStatus::Waiting);

        conv.append(message(&conv, "b", "a", false));
        assert_eq!(conv.status, ConversationStatus::Active);
        assert_eq!(conv.messages.len(), 2);
    }

    #[test]
    fn test_terminal_status_is_kept() {
        let mut conv = Conversation::new("c1", "a", "b");
        conv.status = ConversationStatus::Completed;
        conv.append(message(&conv, "a", "b", true));
        assert_eq!(conv.status, ConversationStatus::Completed);
    }

    #[test]
    fn test_is_between() {
        let conv = Conversation::new("c1", "a", "b");
        assert!(conv.is_between("b", "a"));
        assert!(!conv.is_between("a", "c"));
        assert!(!conv.is_between("a", "a"));

        let solo = Conversation::new("c2", "a", "a");
        assert_eq!(solo.participants.len(), 1);
        assert!(solo.is_between("a", "a"));
    }

    #[test]
    fn test_delivery_path_serialization() {
        let path = DeliveryPath::Streamed {
            event_id: "s1:4".to_string(),
        };
        let json = serde_json::to_value(&path).unwrap();
        assert_eq!(json, json!({"path": "streamed", "event_id": "s1:4"}));
    }

    #[test]
    fn test_send_request_defaults() {
        let request: SendRequest = serde_json::from_value(json!({
            "from_agent": "a",
            "to_agent": "b",
            "payload": {"msg": "hi"}
        }))
        .unwrap();
        assert!(!request.requires_response);
        assert!(request.conversation_id.is_none());
    }
}
