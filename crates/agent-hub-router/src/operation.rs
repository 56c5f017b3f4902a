//! Named hub operations with JSON arguments, as carried by transports.

use std::{fmt, str::FromStr};

use agent_hub_core::{AgentStatus, ConversationStatus, HubError, SendRequest};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;

use crate::hub::Hub;

/// Operations exposed to remote clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    RegisterAgent,
    SendMessage,
    ListAgents,
    GetConversation,
    ReceiveMessages,
    Heartbeat,
    SetConversationStatus,
    ListConversations,
}

impl Operation {
    pub const ALL: [Self; 8] = [
        Self::RegisterAgent,
        Self::SendMessage,
        Self::ListAgents,
        Self::GetConversation,
        Self::ReceiveMessages,
        Self::Heartbeat,
        Self::SetConversationStatus,
        Self::ListConversations,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::RegisterAgent => "register_agent",
            Self::SendMessage => "send_message",
            Self::ListAgents => "list_agents",
            Self::GetConversation => "get_conversation",
            Self::ReceiveMessages => "receive_messages",
            Self::Heartbeat => "heartbeat",
            Self::SetConversationStatus => "set_conversation_status",
            Self::ListConversations => "list_conversations",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Operation {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|op| op.name() == s)
            .ok_or_else(|| HubError::UnknownOperation(s.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct RegisterAgentArgs {
    agent_id: String,
    agent_type: String,
    #[serde(default)]
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConversationArgs {
    conversation_id: String,
}

#[derive(Debug, Deserialize)]
struct ReceiveArgs {
    agent_id: String,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct HeartbeatArgs {
    agent_id: String,
    #[serde(default)]
    status: Option<AgentStatus>,
}

#[derive(Debug, Deserialize)]
struct SetStatusArgs {
    conversation_id: String,
    status: ConversationStatus,
}

#[derive(Debug, Default, Deserialize)]
struct ListConversationsArgs {
    #[serde(default)]
    agent_id: Option<String>,
}

/// Decode operation arguments. `null` stands for an empty object.
fn parse_args<T: DeserializeOwned>(operation: Operation, args: Value) -> Result<T, HubError> {
    let args = if args.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        args
    };
    serde_json::from_value(args)
        .map_err(|e| HubError::bad_request(format!("invalid arguments for {operation}: {e}")))
}

impl Hub {
    /// Run a named operation on behalf of `session_id`.
    ///
    /// Agents registered through a session are bound to it.
    ///
    /// # Errors
    /// `BadRequest` for missing or ill-typed arguments, plus whatever the
    /// operation itself returns.
    pub async fn dispatch(
        &self,
        session_id: Option<&str>,
        operation: Operation,
        args: Value,
    ) -> Result<Value, HubError> {
        tracing::debug!(%operation, session_id, "Dispatching operation");

        let result = match operation {
            Operation::RegisterAgent => {
                let args: RegisterAgentArgs = parse_args(operation, args)?;
                let snapshot = match session_id {
                    Some(session_id) => {
                        self.register_agent_in_session(
                            session_id,
                            &args.agent_id,
                            &args.agent_type,
                            args.version,
                        )
                        .await?
                    }
                    None => {
                        self.register_agent(&args.agent_id, &args.agent_type, args.version)
                            .await?
                    }
                };
                serde_json::to_value(snapshot)?
            }
            Operation::SendMessage => {
                let request: SendRequest = parse_args(operation, args)?;
                serde_json::to_value(self.send_message(request).await?)?
            }
            Operation::ListAgents => serde_json::to_value(self.list_agents().await)?,
            Operation::GetConversation => {
                let args: ConversationArgs = parse_args(operation, args)?;
                serde_json::to_value(self.get_conversation(&args.conversation_id).await?)?
            }
            Operation::ReceiveMessages => {
                let args: ReceiveArgs = parse_args(operation, args)?;
                serde_json::to_value(self.receive_messages(&args.agent_id, args.limit).await?)?
            }
            Operation::Heartbeat => {
                let args: HeartbeatArgs = parse_args(operation, args)?;
                serde_json::to_value(self.heartbeat(&args.agent_id, args.status).await?)?
            }
            Operation::SetConversationStatus => {
                let args: SetStatusArgs = parse_args(operation, args)?;
                serde_json::to_value(
                    self.set_conversation_status(&args.conversation_id, args.status)
                        .await?,
                )?
            }
            Operation::ListConversations => {
                let args: ListConversationsArgs = parse_args(operation, args)?;
                serde_json::to_value(self.list_conversations(args.agent_id.as_deref()).await)?
            }
        };
        Ok(result)
    }
}
