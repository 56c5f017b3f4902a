//! Session metadata, removal reasons and teardown observers.

use std::{fmt, time::Duration};

use agent_hub_core::{ClientInfo, HubConfig, SessionId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Timing knobs of the session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Idle time after which the sweep removes a session.
    pub session_timeout: Duration,
    /// Period of the sweep.
    pub sweep_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&HubConfig::default())
    }
}

impl From<&HubConfig> for SessionConfig {
    fn from(config: &HubConfig) -> Self {
        Self {
            session_timeout: config.session_timeout(),
            sweep_interval: config.sweep_interval(),
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovalReason {
    /// No activity for longer than the session timeout.
    Timeout { idle: Duration },
    /// The transport reported it is gone.
    Closed(String),
    /// The client ended the session explicitly.
    Terminated,
    /// The manager is shutting down.
    Shutdown,
}

impl RemovalReason {
    /// Whether the client will not come back for this session's stream.
    #[must_use]
    pub const fn is_final(&self) -> bool {
        matches!(self, Self::Terminated | Self::Shutdown)
    }
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { idle } => write!(f, "timeout (inactive for {}s)", idle.as_secs()),
            Self::Closed(reason) => write!(f, "transport closed: {reason}"),
            Self::Terminated => f.write_str("terminated by client"),
            Self::Shutdown => f.write_str("server shutdown"),
        }
    }
}

/// What observers learn about a removed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndedSession {
    pub session_id: SessionId,
    pub client_info: Option<ClientInfo>,
    pub reason: RemovalReason,
}

/// Receives a notification after a session has left the manager.
///
/// The session is already gone when this runs, so calling back into
/// `remove_session` for the same id is a no-op.
#[async_trait]
pub trait SessionObserver: Send + Sync {
    async fn session_removed(&self, ended: &EndedSession);
}

/// Snapshot of a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub client_info: Option<ClientInfo>,
    pub created_at: DateTime<Utc>,
    pub idle_secs: u64,
}
