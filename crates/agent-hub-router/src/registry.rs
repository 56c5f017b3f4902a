//! Agent, queue and conversation bookkeeping behind the hub lock.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use agent_hub_core::{
    Agent, AgentId, AgentSnapshot, AgentStatus, Conversation, ConversationId, ConversationStatus,
    ConversationSummary, HubError, Message, MessageId, SendRequest, SessionId,
};
use chrono::Utc;
use uuid::Uuid;

use crate::lane::PushLane;

/// Unordered pair of agents, smallest id first.
type PairKey = (AgentId, AgentId);

fn pair_key(a: &str, b: &str) -> PairKey {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Mutable hub state. Every method is synchronous and leaves the state
/// untouched when it returns an error.
#[derive(Default)]
pub struct Registry {
    agents: HashMap<AgentId, Agent>,
    queues: HashMap<AgentId, VecDeque<Message>>,
    conversations: HashMap<ConversationId, Conversation>,
    /// Most recent conversation of each pair.
    pairs: HashMap<PairKey, ConversationId>,
    session_agents: HashMap<SessionId, AgentId>,
    agent_sessions: HashMap<AgentId, SessionId>,
    lanes: HashMap<SessionId, Arc<PushLane>>,
}

impl Registry {
    /// Insert or replace an agent record. An existing queue is kept.
    pub fn register(&mut self, agent: Agent) -> AgentSnapshot {
        let agent_id = agent.agent_id.clone();
        self.queues.entry(agent_id.clone()).or_default();
        self.agents.insert(agent_id.clone(), agent.clone());
        self.snapshot_of(agent)
    }

    /// Bind `agent_id` to `session_id`, replacing either side's old binding.
    pub fn bind(&mut self, session_id: &str, agent_id: &str) {
        let previous_agent = self
            .session_agents
            .insert(session_id.to_string(), agent_id.to_string());
        if let Some(previous) = previous_agent.filter(|p| p != agent_id) {
            self.agent_sessions.remove(&previous);
        }

        let previous_session = self
            .agent_sessions
            .insert(agent_id.to_string(), session_id.to_string());
        if let Some(previous) = previous_session.filter(|p| p != session_id) {
            self.session_agents.remove(&previous);
        }
    }

    /// Remove an agent with its queue and session binding.
    pub fn unregister(&mut self, agent_id: &str) -> Option<Agent> {
        let agent = self.agents.remove(agent_id)?;
        self.queues.remove(agent_id);
        if let Some(session_id) = self.agent_sessions.remove(agent_id) {
            self.session_agents.remove(&session_id);
        }
        Some(agent)
    }

    /// Unregister the agent bound to an ended session, if any.
    pub fn release_session(&mut self, session_id: &str) -> Option<Agent> {
        let agent_id = self.session_agents.remove(session_id)?;
        self.agent_sessions.remove(&agent_id);
        self.unregister(&agent_id)
    }

    /// Push lane of a session, created on first use.
    pub fn lane(&mut self, session_id: &str) -> Arc<PushLane> {
        Arc::clone(self.lanes.entry(session_id.to_string()).or_default())
    }

    /// Forget an ended session's lane. Pushes already in line keep their
    /// handle and finish in order.
    pub fn close_lane(&mut self, session_id: &str) {
        self.lanes.remove(session_id);
    }

    /// Take a message back out of an agent's queue once it was pushed.
    /// Returns false if the agent already received it.
    pub fn withdraw(&mut self, agent_id: &str, message_id: &MessageId) -> bool {
        let Some(queue) = self.queues.get_mut(agent_id) else {
            return false;
        };
        match queue.iter().position(|m| &m.message_id == message_id) {
            Some(index) => queue.remove(index).is_some(),
            None => false,
        }
    }

    /// Session the agent is reachable through.
    pub fn session_of(&self, agent_id: &str) -> Option<&SessionId> {
        self.agent_sessions.get(agent_id)
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    fn snapshot_of(&self, agent: Agent) -> AgentSnapshot {
        let queued_messages = self.queues.get(&agent.agent_id).map_or(0, VecDeque::len);
        let online = self.agent_sessions.contains_key(&agent.agent_id);
        AgentSnapshot {
            agent,
            queued_messages,
            online,
        }
    }

    pub fn snapshot(&self, agent_id: &str) -> Option<AgentSnapshot> {
        self.agents
            .get(agent_id)
            .map(|agent| self.snapshot_of(agent.clone()))
    }

    /// All agents, ordered by id.
    pub fn snapshots(&self) -> Vec<AgentSnapshot> {
        let mut agents: Vec<AgentSnapshot> = self
            .agents
            .values()
            .map(|agent| self.snapshot_of(agent.clone()))
            .collect();
        agents.sort_by(|a, b| a.agent.agent_id.cmp(&b.agent.agent_id));
        agents
    }

    /// Record a message: conversation, recipient queue and sender counter.
    ///
    /// Returns the message and its 1-indexed queue position.
    pub fn record(&mut self, request: &SendRequest) -> Result<(Message, usize), HubError> {
        for agent_id in [&request.from_agent, &request.to_agent] {
            if !self.agents.contains_key(agent_id) {
                return Err(HubError::AgentNotFound(agent_id.clone()));
            }
        }

        let conversation_id = self.resolve_conversation(request)?;
        let message = Message::new(conversation_id.clone(), request);

        if let Some(conversation) = self.conversations.get_mut(&conversation_id) {
            conversation.append(message.clone());
        }
        self.pairs.insert(
            pair_key(&request.from_agent, &request.to_agent),
            conversation_id,
        );

        let queue = self.queues.entry(request.to_agent.clone()).or_default();
        queue.push_back(message.clone());
        let position = queue.len();

        if let Some(sender) = self.agents.get_mut(&request.from_agent) {
            sender.messages_processed += 1;
        }

        Ok((message, position))
    }

    /// Pick the conversation for a message, creating it when needed.
    fn resolve_conversation(&mut self, request: &SendRequest) -> Result<ConversationId, HubError> {
        let (from, to) = (&request.from_agent, &request.to_agent);

        if let Some(id) = &request.conversation_id {
            return match self.conversations.get(id) {
                Some(conversation) if conversation.is_between(from, to) => Ok(id.clone()),
                Some(_) => Err(HubError::bad_request(format!(
                    "conversation {id} is not between {from} and {to}"
                ))),
                None => {
                    self.conversations
                        .insert(id.clone(), Conversation::new(id.clone(), from, to));
                    Ok(id.clone())
                }
            };
        }

        let existing = self
            .pairs
            .get(&pair_key(from, to))
            .filter(|id| self.conversations.contains_key(*id));
        if let Some(id) = existing {
            return Ok(id.clone());
        }

        let id = Uuid::new_v4().to_string();
        self.conversations
            .insert(id.clone(), Conversation::new(id.clone(), from, to));
        Ok(id)
    }

    /// Take up to `limit` queued messages, oldest first.
    pub fn drain(&mut self, agent_id: &str, limit: Option<usize>) -> Result<Vec<Message>, HubError> {
        let agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| HubError::AgentNotFound(agent_id.to_string()))?;
        agent.beat();

        let queue = self.queues.entry(agent_id.to_string()).or_default();
        let count = limit.map_or(queue.len(), |limit| limit.min(queue.len()));
        Ok(queue.drain(..count).collect())
    }

    pub fn heartbeat(
        &mut self,
        agent_id: &str,
        status: Option<AgentStatus>,
    ) -> Result<AgentSnapshot, HubError> {
        let agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| HubError::AgentNotFound(agent_id.to_string()))?;
        agent.beat();
        if let Some(status) = status {
            agent.status = status;
        }
        let agent = agent.clone();
        Ok(self.snapshot_of(agent))
    }

    pub fn conversation(&self, conversation_id: &str) -> Result<Conversation, HubError> {
        self.conversations
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| HubError::ConversationNotFound(conversation_id.to_string()))
    }

    /// Close a conversation as completed or failed.
    pub fn set_conversation_status(
        &mut self,
        conversation_id: &str,
        status: ConversationStatus,
    ) -> Result<Conversation, HubError> {
        if !status.is_terminal() {
            return Err(HubError::bad_request(
                "conversation status can only be set to completed or failed",
            ));
        }
        let conversation = self
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| HubError::ConversationNotFound(conversation_id.to_string()))?;
        conversation.status = status;
        conversation.updated_at = Utc::now();
        Ok(conversation.clone())
    }

    /// Conversation summaries, most recently updated first.
    pub fn conversations(&self, agent_id: Option<&str>) -> Vec<ConversationSummary> {
        let mut summaries: Vec<ConversationSummary> = self
            .conversations
            .values()
            .filter(|c| agent_id.is_none_or(|id| c.participants.contains(id)))
            .map(Conversation::summary)
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries
    }
}
