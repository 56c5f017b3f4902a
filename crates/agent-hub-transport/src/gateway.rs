//! Entry point shared by every transport adapter.

use std::{fmt, future::Future, sync::Arc};

use agent_hub_core::{ClientInfo, EventId, HubError, Message, SessionId, Transport};
use agent_hub_router::{Hub, Operation};
use agent_hub_session::RemovalReason;
use serde_json::Value;
use uuid::Uuid;

use crate::protocol::StreamCursor;

/// Agent type given to clients registered on session open.
pub const CLIENT_AGENT_TYPE: &str = "client";

/// Session handling and operation dispatch on top of a [`Hub`].
#[derive(Clone)]
pub struct Gateway {
    hub: Arc<Hub>,
}

impl Gateway {
    #[must_use]
    pub const fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }

    #[must_use]
    pub const fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Fresh session id.
    #[must_use]
    pub fn new_session_id() -> SessionId {
        Uuid::new_v4().to_string()
    }

    /// Register a session for `transport`.
    ///
    /// With `auto_register_clients` on, a client that announces itself is
    /// registered as an agent and bound to the session.
    ///
    /// # Errors
    /// Returns `BadRequest` if auto-registration rejects the client name.
    /// The session is removed again in that case.
    pub async fn open_session(
        &self,
        session_id: &str,
        transport: Arc<dyn Transport>,
        client_info: Option<ClientInfo>,
    ) -> Result<(), HubError> {
        self.hub
            .sessions()
            .register_session(session_id, transport, client_info.clone())
            .await;

        let client = client_info.as_ref().map_or("unknown", |c| c.name.as_str());
        tracing::info!(%session_id, client, "Session opened");

        let Some(info) = client_info.filter(|_| self.hub.config().auto_register_clients) else {
            return Ok(());
        };
        if let Err(e) = self
            .hub
            .register_agent_in_session(session_id, &info.name, CLIENT_AGENT_TYPE, info.version)
            .await
        {
            self.close_session(session_id, RemovalReason::Closed(e.to_string()))
                .await;
            return Err(e);
        }
        Ok(())
    }

    /// End a session. Returns false if it was already gone.
    pub async fn close_session(&self, session_id: &str, reason: RemovalReason) -> bool {
        self.hub.sessions().remove_session(session_id, reason).await
    }

    /// Refresh a session. Returns false if it is gone.
    pub async fn ping(&self, session_id: &str) -> bool {
        self.hub.sessions().touch(session_id).await
    }

    /// Invoke a named operation on behalf of a live session.
    ///
    /// # Errors
    /// Returns `SessionNotFound` for unknown sessions, `UnknownOperation`
    /// for unknown names, and whatever the operation itself returns.
    pub async fn call(
        &self,
        session_id: &str,
        operation: &str,
        args: Value,
    ) -> Result<Value, HubError> {
        if !self.hub.sessions().touch(session_id).await {
            return Err(HubError::SessionNotFound(session_id.to_string()));
        }
        let operation: Operation = operation.parse()?;
        self.hub.dispatch(Some(session_id), operation, args).await
    }

    /// Replay events after `cursor` through `send`.
    pub async fn resume<F, Fut, E>(&self, cursor: &StreamCursor, send: F) -> Option<EventId>
    where
        F: FnMut(EventId, Message) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: fmt::Display,
    {
        self.hub
            .resume_stream(&cursor.stream_id, Some(cursor.event_id), send)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use agent_hub_core::{HubConfig, SendRequest, testing::RecordingTransport};
    use serde_json::json;
    use tokio_test::assert_ok;

    use super::*;

    async fn gateway(config: HubConfig) -> Gateway {
        Gateway::new(Hub::new(config).await)
    }

    #[tokio::test]
    async fn test_call_requires_live_session() {
        let gateway = gateway(HubConfig::default()).await;
        let err = gateway
            .call("missing", "list_agents", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_call_binds_registered_agent() {
        let gateway = gateway(HubConfig::default()).await;
        gateway
            .open_session("s1", Arc::new(RecordingTransport::duplex()), None)
            .await
            .unwrap();

        let err = gateway
            .call("s1", "launch_rockets", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::UnknownOperation(_)));

        let snapshot = gateway
            .call(
                "s1",
                "register_agent",
                json!({"agent_id": "a", "agent_type": "worker"}),
            )
            .await
            .unwrap();
        assert_eq!(snapshot["online"], json!(true));

        assert!(gateway.close_session("s1", RemovalReason::Terminated).await);
        assert!(!gateway.close_session("s1", RemovalReason::Terminated).await);
        assert!(gateway.hub().list_agents().await.is_empty());
    }

    #[tokio::test]
    async fn test_auto_register_clients() {
        let gateway = gateway(HubConfig {
            auto_register_clients: true,
            ..HubConfig::default()
        })
        .await;
        assert_ok!(
            gateway
                .open_session(
                    "s1",
                    Arc::new(RecordingTransport::duplex()),
                    Some(ClientInfo::new("planner", Some("0.3.0".into()))),
                )
                .await
        );

        let agents = gateway.hub().list_agents().await;
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].agent.agent_id, "planner");
        assert_eq!(agents[0].agent.agent_type, CLIENT_AGENT_TYPE);
        assert_eq!(agents[0].agent.version, "0.3.0");
        assert!(agents[0].online);
    }

    #[tokio::test]
    async fn test_auto_register_rejects_blank_name() {
        let gateway = gateway(HubConfig {
            auto_register_clients: true,
            ..HubConfig::default()
        })
        .await;
        let err = gateway
            .open_session(
                "s1",
                Arc::new(RecordingTransport::duplex()),
                Some(ClientInfo::new("  ", None)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::BadRequest(_)));
        assert!(!gateway.hub().sessions().contains("s1").await);
    }

    #[tokio::test]
    async fn test_resume_from_cursor() {
        let gateway = gateway(HubConfig::default()).await;
        let hub = gateway.hub();
        for n in 1..=3 {
            let message = Message::new(
                "c1".into(),
                &SendRequest::new("a", "b", json!({"n": n}).as_object().cloned().unwrap()),
            );
            hub.events().store_event("s1", message).await;
        }

        let mut seen = Vec::new();
        let last = gateway
            .resume(&"s1:1".parse().unwrap(), |id, _| {
                seen.push(id.seq());
                async { Ok::<(), Infallible>(()) }
            })
            .await;
        assert_eq!(seen, vec![2, 3]);
        assert_eq!(last, Some(EventId::new(3)));
    }
}
