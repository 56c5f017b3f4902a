//! In-memory transport double for tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};

use crate::{
    error::TransportError,
    traits::{Delivery, Transport, TransportEvent, TransportKind, TransportSignals},
};

/// Records every delivery; can be told to fail or to hold deliveries.
#[derive(Debug)]
pub struct RecordingTransport {
    kind: TransportKind,
    signals: TransportSignals,
    deliveries: Mutex<Vec<Delivery>>,
    failing: AtomicBool,
    failing_close: AtomicBool,
    open: watch::Sender<bool>,
    closes: AtomicUsize,
}

impl RecordingTransport {
    #[must_use]
    pub fn duplex() -> Self {
        Self::with_kind(TransportKind::Duplex)
    }

    #[must_use]
    pub fn streaming(stream_id: impl Into<String>) -> Self {
        Self::with_kind(TransportKind::Streaming {
            stream_id: stream_id.into(),
        })
    }

    fn with_kind(kind: TransportKind) -> Self {
        Self {
            kind,
            signals: TransportSignals::new(),
            deliveries: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            failing_close: AtomicBool::new(false),
            open: watch::Sender::new(true),
            closes: AtomicUsize::new(0),
        }
    }

    /// Make subsequent deliveries fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make `close` report an error (it still counts and signals).
    pub fn set_close_failing(&self, failing: bool) {
        self.failing_close.store(failing, Ordering::SeqCst);
    }

    /// Park deliveries until [`release`](Self::release) is called.
    pub fn hold(&self) {
        self.open.send_replace(false);
    }

    pub fn release(&self) {
        self.open.send_replace(true);
    }

    /// Lifecycle publisher, for simulating errors and closes.
    #[must_use]
    pub const fn signals(&self) -> &TransportSignals {
        &self.signals
    }

    pub async fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().await.clone()
    }

    /// Times `close` was called.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn kind(&self) -> TransportKind {
        self.kind.clone()
    }

    async fn deliver(&self, delivery: Delivery) -> Result<(), TransportError> {
        let mut open = self.open.subscribe();
        let _ = open.wait_for(|open| *open).await;
        if self.failing.load(Ordering::SeqCst) || self.signals.is_closed() {
            return Err(TransportError::Unavailable("recording transport offline".into()));
        }
        self.deliveries.lock().await.push(delivery);
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<TransportEvent> {
        self.signals.subscribe()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.signals.closed("closed by hub");
        if self.failing_close.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("close failed".into()));
        }
        Ok(())
    }
}
