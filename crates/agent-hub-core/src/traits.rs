//! Transport abstraction the hub delivers through.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{
    error::TransportError,
    event_log::{EventId, StreamId},
    model::Message,
};

/// How a transport delivers pushes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportKind {
    /// Point-to-point channel; pushes are plain notifications.
    Duplex,
    /// Resumable stream; pushes are logged under `stream_id` first.
    Streaming { stream_id: StreamId },
}

/// A message pushed to a live recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    /// Set for streaming transports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,
    pub message: Message,
}

/// Lifecycle state published by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    /// A transient error. Does not end the session.
    Error(String),
    /// The transport is gone. Ends the session.
    Closed(String),
}

/// Trait for delivery channels bound to a session.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Delivery flavour of this transport.
    fn kind(&self) -> TransportKind;

    /// Push a message to the remote end.
    async fn deliver(&self, delivery: Delivery) -> Result<(), TransportError>;

    /// Watch lifecycle changes. The current state is visible immediately.
    fn subscribe(&self) -> watch::Receiver<TransportEvent>;

    /// Close the transport. Calling it twice is harmless.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Lifecycle publisher shared by transport implementations.
#[derive(Debug)]
pub struct TransportSignals {
    tx: watch::Sender<TransportEvent>,
}

impl Default for TransportSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportSignals {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(TransportEvent::Open);
        Self { tx }
    }

    /// Report a transient error unless already closed.
    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        self.tx.send_if_modified(|state| {
            if matches!(state, TransportEvent::Closed(_)) {
                false
            } else {
                *state = TransportEvent::Error(message);
                true
            }
        });
    }

    /// Mark closed. Only the first reason is kept.
    pub fn closed(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.tx.send_if_modified(|state| {
            if matches!(state, TransportEvent::Closed(_)) {
                false
            } else {
                *state = TransportEvent::Closed(reason);
                true
            }
        });
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(*self.tx.borrow(), TransportEvent::Closed(_))
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<TransportEvent> {
        self.tx.subscribe()
    }
}
