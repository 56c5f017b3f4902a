//! The hub: agent registry, router and conversation tracker.

use std::{
    fmt,
    future::Future,
    sync::{Arc, Weak},
};

use agent_hub_core::{
    Agent, AgentSnapshot, AgentStatus, Conversation, ConversationStatus, ConversationSummary,
    Delivery, DeliveryPath, DeliveryResult, EventId, EventLog, HubConfig, HubError, Message,
    SendRequest, SessionId, TransportKind,
};
use agent_hub_session::{EndedSession, SessionConfig, SessionManager, SessionObserver};
use async_trait::async_trait;
use tokio::{sync::Mutex, task::JoinHandle};

use crate::registry::Registry;

/// Agent registry and message router.
///
/// All registry state sits behind one lock, so messages reach a given
/// recipient's queue in the order their `send_message` calls returned.
/// Delivery is best-effort-immediate: a recipient with a live session gets
/// a push, and the queue holds what could not be pushed. Pushes to one
/// session go out in recording order through its
/// [`PushLane`](crate::lane::PushLane).
pub struct Hub {
    config: HubConfig,
    registry: Mutex<Registry>,
    sessions: SessionManager,
    events: EventLog<Message>,
}

impl Hub {
    /// Build a hub and subscribe it to session removals.
    pub async fn new(config: HubConfig) -> Arc<Self> {
        let hub = Arc::new(Self {
            registry: Mutex::new(Registry::default()),
            sessions: SessionManager::new(SessionConfig::from(&config)),
            events: EventLog::new(config.max_events_per_stream, config.max_streams),
            config,
        });

        let observer: Weak<Self> = Arc::downgrade(&hub);
        hub.sessions.add_observer(observer).await;
        hub
    }

    /// Start background work (the session sweep).
    pub async fn start(&self) {
        self.sessions.start_sweeper().await;
    }

    #[must_use]
    pub const fn config(&self) -> &HubConfig {
        &self.config
    }

    #[must_use]
    pub const fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    #[must_use]
    pub const fn events(&self) -> &EventLog<Message> {
        &self.events
    }

    /// Register (or re-register) an agent.
    ///
    /// Re-registering replaces the record and resets it to `ready`.
    ///
    /// # Errors
    /// Returns `BadRequest` for an empty id or type.
    pub async fn register_agent(
        &self,
        agent_id: &str,
        agent_type: &str,
        version: Option<String>,
    ) -> Result<AgentSnapshot, HubError> {
        let agent = new_agent(agent_id, agent_type, version)?;
        let snapshot = self.registry.lock().await.register(agent);
        tracing::info!(agent_id, agent_type, "Agent registered");
        Ok(snapshot)
    }

    /// Register an agent and bind it to a live session.
    ///
    /// # Errors
    /// Returns `BadRequest` for an empty id or type, `SessionNotFound` if
    /// the session is gone.
    pub async fn register_agent_in_session(
        &self,
        session_id: &str,
        agent_id: &str,
        agent_type: &str,
        version: Option<String>,
    ) -> Result<AgentSnapshot, HubError> {
        let agent = new_agent(agent_id, agent_type, version)?;

        let mut registry = self.registry.lock().await;
        if !self.sessions.contains(session_id).await {
            return Err(HubError::SessionNotFound(session_id.to_string()));
        }
        registry.register(agent);
        registry.bind(session_id, agent_id);
        let snapshot = registry
            .snapshot(agent_id)
            .ok_or_else(|| HubError::AgentNotFound(agent_id.to_string()))?;
        drop(registry);

        tracing::info!(agent_id, agent_type, %session_id, "Agent registered");
        Ok(snapshot)
    }

    /// Remove an agent, its queue and its session binding.
    pub async fn unregister_agent(&self, agent_id: &str) -> bool {
        let removed = self.registry.lock().await.unregister(agent_id).is_some();
        if removed {
            tracing::info!(agent_id, "Agent unregistered");
        }
        removed
    }

    /// Route a message.
    ///
    /// The message is queued for the recipient and recorded in its
    /// conversation. If the recipient has a live session it is pushed
    /// right away and taken back out of the queue; a failed push leaves
    /// it queued. Pushes run after the hub lock is released, so a slow
    /// recipient only delays its own senders.
    ///
    /// # Errors
    /// Returns `AgentNotFound` if either end is not registered and
    /// `BadRequest` for malformed arguments. Nothing changes on error.
    pub async fn send_message(&self, request: SendRequest) -> Result<DeliveryResult, HubError> {
        if request.from_agent.trim().is_empty() || request.to_agent.trim().is_empty() {
            return Err(HubError::bad_request("from_agent and to_agent are required"));
        }

        let mut registry = self.registry.lock().await;
        let (message, queue_position) = registry.record(&request)?;
        let push = match registry.session_of(&request.to_agent).cloned() {
            Some(session_id) => self.start_push(&mut registry, session_id, &message).await,
            None => None,
        };
        drop(registry);

        let delivery = match push {
            Some(push) => push.await.unwrap_or_else(|e| {
                tracing::warn!(message_id = %message.message_id, "Push task failed: {e}");
                DeliveryPath::Queued
            }),
            None => DeliveryPath::Queued,
        };
        if delivery != DeliveryPath::Queued {
            self.registry
                .lock()
                .await
                .withdraw(&message.to_agent, &message.message_id);
        }

        tracing::debug!(
            message_id = %message.message_id,
            from = %message.from_agent,
            to = %message.to_agent,
            queue_position,
            ?delivery,
            "Message routed"
        );

        Ok(DeliveryResult {
            message_id: message.message_id,
            conversation_id: message.conversation_id,
            queue_position,
            delivery,
        })
    }

    /// Line up a push of `message` over the recipient's live session.
    ///
    /// Runs under the hub lock: the stream event and the lane ticket are
    /// taken in recording order, and the push task is spawned before the
    /// lock is released so a cancelled caller cannot leave a gap.
    async fn start_push(
        &self,
        registry: &mut Registry,
        session_id: SessionId,
        message: &Message,
    ) -> Option<JoinHandle<DeliveryPath>> {
        let transport = self.sessions.get_transport(&session_id).await?;

        let (event_id, cursor) = match transport.kind() {
            TransportKind::Duplex => (None, None),
            TransportKind::Streaming { stream_id } => {
                let id = self.events.store_event(&stream_id, message.clone()).await;
                (Some(id), Some(format!("{stream_id}:{id}")))
            }
        };

        let lane = registry.lane(&session_id);
        let ticket = lane.ticket();
        let delivery = Delivery {
            event_id,
            message: message.clone(),
        };
        let timeout = self.config.push_timeout();

        Some(tokio::spawn(async move {
            let message_id = delivery.message.message_id.clone();
            let _turn = lane.turn(ticket).await;
            match tokio::time::timeout(timeout, transport.deliver(delivery)).await {
                Ok(Ok(())) => cursor.map_or(DeliveryPath::Pushed, |event_id| {
                    DeliveryPath::Streamed { event_id }
                }),
                Ok(Err(e)) => {
                    tracing::debug!(%session_id, %message_id, "Push failed, message stays queued: {e}");
                    DeliveryPath::Queued
                }
                Err(_) => {
                    tracing::warn!(%session_id, %message_id, "Push timed out, message stays queued");
                    DeliveryPath::Queued
                }
            }
        }))
    }

    /// Snapshot of every registered agent, ordered by id.
    pub async fn list_agents(&self) -> Vec<AgentSnapshot> {
        self.registry.lock().await.snapshots()
    }

    /// Full history of a conversation.
    ///
    /// # Errors
    /// Returns `ConversationNotFound` for unknown ids.
    pub async fn get_conversation(&self, conversation_id: &str) -> Result<Conversation, HubError> {
        self.registry.lock().await.conversation(conversation_id)
    }

    /// Conversations, optionally only those `agent_id` takes part in.
    pub async fn list_conversations(&self, agent_id: Option<&str>) -> Vec<ConversationSummary> {
        self.registry.lock().await.conversations(agent_id)
    }

    /// Take queued messages for an agent, oldest first.
    ///
    /// # Errors
    /// Returns `AgentNotFound` for unknown agents.
    pub async fn receive_messages(
        &self,
        agent_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, HubError> {
        self.registry.lock().await.drain(agent_id, limit)
    }

    /// Record an agent heartbeat, optionally with a new status.
    ///
    /// # Errors
    /// Returns `AgentNotFound` for unknown agents.
    pub async fn heartbeat(
        &self,
        agent_id: &str,
        status: Option<AgentStatus>,
    ) -> Result<AgentSnapshot, HubError> {
        self.registry.lock().await.heartbeat(agent_id, status)
    }

    /// Mark a conversation completed or failed.
    ///
    /// # Errors
    /// Returns `ConversationNotFound` for unknown ids and `BadRequest` for
    /// a non-terminal status.
    pub async fn set_conversation_status(
        &self,
        conversation_id: &str,
        status: ConversationStatus,
    ) -> Result<Conversation, HubError> {
        let conversation = self
            .registry
            .lock()
            .await
            .set_conversation_status(conversation_id, status)?;
        tracing::info!(conversation_id, ?status, "Conversation closed");
        Ok(conversation)
    }

    /// Replay a stream's events after `last_event_id` through `send`.
    pub async fn resume_stream<F, Fut, E>(
        &self,
        stream_id: &str,
        last_event_id: Option<EventId>,
        send: F,
    ) -> Option<EventId>
    where
        F: FnMut(EventId, Message) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: fmt::Display,
    {
        self.events
            .replay_events_after(stream_id, last_event_id, send)
            .await
    }

    /// End every session and drop all stream history.
    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
        self.events.clear_all().await;
        tracing::info!("Hub shut down");
    }
}

fn new_agent(agent_id: &str, agent_type: &str, version: Option<String>) -> Result<Agent, HubError> {
    if agent_id.trim().is_empty() {
        return Err(HubError::bad_request("agent_id is required"));
    }
    if agent_type.trim().is_empty() {
        return Err(HubError::bad_request("agent_type is required"));
    }
    Ok(Agent::new(agent_id, agent_type, version))
}

#[async_trait]
impl SessionObserver for Hub {
    async fn session_removed(&self, ended: &EndedSession) {
        let released = {
            let mut registry = self.registry.lock().await;
            registry.close_lane(&ended.session_id);
            registry.release_session(&ended.session_id)
        };
        if let Some(agent) = released {
            tracing::info!(
                agent_id = %agent.agent_id,
                session_id = %ended.session_id,
                reason = %ended.reason,
                "Unregistered agent of ended session"
            );
        }

        // Streaming sessions log under their session id. Keep the buffer
        // unless the client is known not to come back.
        if ended.reason.is_final() {
            self.events.clear_session(&ended.session_id).await;
        }
    }
}
