//! Per-stream event history for resumable delivery.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    future::Future,
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Identifier of a resumable delivery stream.
pub type StreamId = String;

/// Default number of events kept per stream.
pub const DEFAULT_STREAM_CAPACITY: usize = 1000;

/// Default number of stream buffers kept.
pub const DEFAULT_MAX_STREAMS: usize = 1024;

/// Position of an event within its stream. Starts at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(u64);

impl EventId {
    #[must_use]
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    #[must_use]
    pub const fn seq(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Event id that is not a decimal integer.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Invalid event id: {0}")]
pub struct ParseEventIdError(String);

impl FromStr for EventId {
    type Err = ParseEventIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|_| ParseEventIdError(s.to_string()))
    }
}

/// An event as stored in a stream buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent<T> {
    pub event_id: EventId,
    pub stream_id: StreamId,
    pub message: T,
}

struct StreamBuffer<T> {
    last_seq: u64,
    events: VecDeque<StoredEvent<T>>,
}

impl<T> StreamBuffer<T> {
    fn new() -> Self {
        Self {
            last_seq: 0,
            events: VecDeque::with_capacity(32),
        }
    }
}

struct Inner<T> {
    streams: HashMap<StreamId, StreamBuffer<T>>,
    /// Stream creation order, oldest first.
    order: VecDeque<StreamId>,
}

/// Bounded, append-only event history keyed by stream.
///
/// A client whose stream dropped reconnects with the last event id it saw
/// and receives everything stored after it. Delivery to long-disconnected
/// clients is best-effort: once a buffer is full the oldest event goes.
pub struct EventLog<T> {
    inner: RwLock<Inner<T>>,
    capacity: usize,
    max_streams: usize,
}

impl<T: Clone + Send + Sync> Default for EventLog<T> {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_CAPACITY, DEFAULT_MAX_STREAMS)
    }
}

impl<T: Clone + Send + Sync> EventLog<T> {
    /// Create a log keeping `capacity` events per stream and at most
    /// `max_streams` streams. Zero limits are raised to one.
    #[must_use]
    pub fn new(capacity: usize, max_streams: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                streams: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
            max_streams: max_streams.max(1),
        }
    }

    /// Append `message` to `stream_id`, returning its event id.
    pub async fn store_event(&self, stream_id: &str, message: T) -> EventId {
        let mut inner = self.inner.write().await;

        if !inner.streams.contains_key(stream_id) {
            while inner.order.len() >= self.max_streams {
                let Some(oldest) = inner.order.pop_front() else {
                    break;
                };
                inner.streams.remove(&oldest);
                tracing::debug!(stream_id = %oldest, "Dropped oldest event stream");
            }
            inner.order.push_back(stream_id.to_string());
        }

        let buffer = inner
            .streams
            .entry(stream_id.to_string())
            .or_insert_with(StreamBuffer::new);
        buffer.last_seq += 1;
        let event_id = EventId(buffer.last_seq);
        buffer.events.push_back(StoredEvent {
            event_id,
            stream_id: stream_id.to_string(),
            message,
        });
        while buffer.events.len() > self.capacity {
            buffer.events.pop_front();
        }

        event_id
    }

    /// Events of `stream_id` stored after `last_event_id`.
    ///
    /// An absent id, or one no longer (or never) in the buffer, selects the
    /// whole buffer.
    pub async fn events_after(
        &self,
        stream_id: &str,
        last_event_id: Option<EventId>,
    ) -> Vec<StoredEvent<T>> {
        let inner = self.inner.read().await;
        let Some(buffer) = inner.streams.get(stream_id) else {
            return Vec::new();
        };

        let start = last_event_id
            .and_then(|last| buffer.events.iter().position(|e| e.event_id == last))
            .map_or(0, |pos| pos + 1);

        buffer.events.iter().skip(start).cloned().collect()
    }

    /// Replay `stream_id` after `last_event_id` through `send`, in order.
    ///
    /// Returns the highest event id sent, or `last_event_id` when nothing
    /// newer exists. A failing `send` stops the replay.
    pub async fn replay_events_after<F, Fut, E>(
        &self,
        stream_id: &str,
        last_event_id: Option<EventId>,
        mut send: F,
    ) -> Option<EventId>
    where
        F: FnMut(EventId, T) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: fmt::Display,
    {
        // Snapshot first so `send` never runs under the lock.
        let pending = self.events_after(stream_id, last_event_id).await;

        let mut last_sent = None;
        for event in pending {
            let event_id = event.event_id;
            if let Err(e) = send(event_id, event.message).await {
                tracing::warn!(%stream_id, %event_id, "Replay stopped: {e}");
                break;
            }
            last_sent = Some(event_id);
        }

        last_sent.or(last_event_id)
    }

    /// Id of the newest event still buffered for `stream_id`.
    pub async fn latest_event_id(&self, stream_id: &str) -> Option<EventId> {
        self.inner
            .read()
            .await
            .streams
            .get(stream_id)
            .and_then(|b| b.events.back().map(|e| e.event_id))
    }

    /// Number of events buffered for `stream_id`.
    pub async fn len(&self, stream_id: &str) -> usize {
        self.inner
            .read()
            .await
            .streams
            .get(stream_id)
            .map_or(0, |b| b.events.len())
    }

    /// Number of streams with a buffer.
    pub async fn stream_count(&self) -> usize {
        self.inner.read().await.streams.len()
    }

    /// Drop the buffer of a finished stream.
    pub async fn clear_session(&self, stream_id: &str) {
        let mut inner = self.inner.write().await;
        if inner.streams.remove(stream_id).is_some() {
            inner.order.retain(|s| s != stream_id);
        }
    }

    /// Drop every buffer.
    pub async fn clear_all(&self) {
        let mut inner = self.inner.write().await;
        inner.streams.clear();
        inner.order.clear();
    }
}
