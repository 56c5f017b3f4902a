//! Session manager: live sessions, idle expiry and teardown.

use std::{
    collections::HashMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use agent_hub_core::{ClientInfo, SessionId, Transport, TransportEvent};
use chrono::{DateTime, Utc};
use tokio::{
    sync::{Mutex, RwLock, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

use crate::session::{EndedSession, RemovalReason, SessionConfig, SessionInfo, SessionObserver};

/// Live session state.
struct SessionEntry {
    transport: Arc<dyn Transport>,
    client_info: Option<ClientInfo>,
    created_at: DateTime<Utc>,
    last_activity: Instant,
    /// Distinguishes re-registrations of the same id.
    generation: u64,
}

struct Inner {
    config: SessionConfig,
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    observers: RwLock<Vec<Weak<dyn SessionObserver>>>,
    generation: AtomicU64,
}

impl Inner {
    /// Take the entry out of the map. With `generation`, only that
    /// registration is taken.
    async fn take(&self, session_id: &str, generation: Option<u64>) -> Option<SessionEntry> {
        let mut sessions = self.sessions.write().await;
        match (sessions.get(session_id), generation) {
            (Some(entry), Some(expected)) if entry.generation != expected => None,
            (Some(_), _) => sessions.remove(session_id),
            (None, _) => None,
        }
    }

    async fn remove(
        &self,
        session_id: &str,
        generation: Option<u64>,
        reason: RemovalReason,
    ) -> bool {
        // The entry leaves the map before any teardown runs.
        let Some(entry) = self.take(session_id, generation).await else {
            return false;
        };
        self.teardown(session_id.to_string(), entry, reason).await;
        true
    }

    async fn teardown(&self, session_id: SessionId, entry: SessionEntry, reason: RemovalReason) {
        tracing::info!(%session_id, %reason, "Session removed");

        if let Err(e) = entry.transport.close().await {
            tracing::warn!(%session_id, "Transport close failed: {e}");
        }

        let observers: Vec<Arc<dyn SessionObserver>> = {
            let mut observers = self.observers.write().await;
            observers.retain(|o| o.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };

        let ended = EndedSession {
            session_id,
            client_info: entry.client_info,
            reason,
        };
        for observer in observers {
            observer.session_removed(&ended).await;
        }
    }

    /// Remove every session idle for longer than the timeout at `now`.
    async fn sweep_at(&self, now: Instant) -> usize {
        let timeout = self.config.session_timeout;

        let expired: Vec<(SessionId, SessionEntry, RemovalReason)> = {
            let mut sessions = self.sessions.write().await;
            let idle: Vec<_> = sessions
                .iter()
                .filter_map(|(id, entry)| {
                    let idle = now.saturating_duration_since(entry.last_activity);
                    (idle > timeout).then(|| (id.clone(), idle))
                })
                .collect();
            idle.into_iter()
                .filter_map(|(id, idle)| {
                    sessions
                        .remove(&id)
                        .map(|entry| (id, entry, RemovalReason::Timeout { idle }))
                })
                .collect()
        };

        let count = expired.len();
        for (id, entry, reason) in expired {
            self.teardown(id, entry, reason).await;
        }
        count
    }
}

struct Sweeper {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Tracks which clients are alive and reclaims the ones that are not.
///
/// A session ends through exactly one of: explicit removal, its transport
/// closing, or the idle sweep. Removal is idempotent and observers are
/// notified once, after the session has left the map.
pub struct SessionManager {
    inner: Arc<Inner>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl SessionManager {
    /// Create a session manager. The sweep starts with `start_sweeper`.
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                sessions: RwLock::new(HashMap::new()),
                observers: RwLock::new(Vec::new()),
                generation: AtomicU64::new(0),
            }),
            sweeper: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Subscribe to session removals. Only a weak reference is kept.
    pub async fn add_observer(&self, observer: Weak<dyn SessionObserver>) {
        self.inner.observers.write().await.push(observer);
    }

    /// Register a session bound to `transport`.
    ///
    /// The transport's close signal removes the session; its error signal
    /// is only logged. An existing session with the same id is removed
    /// first.
    pub async fn register_session(
        &self,
        session_id: impl Into<SessionId>,
        transport: Arc<dyn Transport>,
        client_info: Option<ClientInfo>,
    ) {
        let session_id = session_id.into();
        self.inner
            .remove(
                &session_id,
                None,
                RemovalReason::Closed("superseded by a new registration".into()),
            )
            .await;

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let events = transport.subscribe();

        self.inner.sessions.write().await.insert(
            session_id.clone(),
            SessionEntry {
                transport,
                client_info,
                created_at: Utc::now(),
                last_activity: Instant::now(),
                generation,
            },
        );

        spawn_watcher(Arc::downgrade(&self.inner), session_id, generation, events);
    }

    /// Refresh the activity timestamp. Returns false for unknown sessions.
    pub async fn touch(&self, session_id: &str) -> bool {
        self.inner
            .sessions
            .write()
            .await
            .get_mut(session_id)
            .map(|entry| entry.last_activity = Instant::now())
            .is_some()
    }

    /// Transport of a live session. Counts as activity.
    pub async fn get_transport(&self, session_id: &str) -> Option<Arc<dyn Transport>> {
        let mut sessions = self.inner.sessions.write().await;
        let entry = sessions.get_mut(session_id)?;
        entry.last_activity = Instant::now();
        Some(Arc::clone(&entry.transport))
    }

    /// Client info announced by a live session.
    pub async fn client_info(&self, session_id: &str) -> Option<ClientInfo> {
        self.inner
            .sessions
            .read()
            .await
            .get(session_id)
            .and_then(|entry| entry.client_info.clone())
    }

    /// Remove a session. Returns false if it was already gone.
    pub async fn remove_session(&self, session_id: &str, reason: RemovalReason) -> bool {
        self.inner.remove(session_id, None, reason).await
    }

    /// Run one expiry pass now.
    pub async fn sweep_expired(&self) -> usize {
        self.inner.sweep_at(Instant::now()).await
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.inner.sessions.read().await.contains_key(session_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.sessions.read().await.is_empty()
    }

    /// Snapshot of live sessions, oldest first.
    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let now = Instant::now();
        let mut sessions: Vec<SessionInfo> = self
            .inner
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, entry)| SessionInfo {
                session_id: id.clone(),
                client_info: entry.client_info.clone(),
                created_at: entry.created_at,
                idle_secs: now.saturating_duration_since(entry.last_activity).as_secs(),
            })
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    /// Start the periodic expiry sweep. Calling it again is a no-op.
    pub async fn start_sweeper(&self) {
        let mut slot = self.sweeper.lock().await;
        if slot.is_some() {
            return;
        }

        let (shutdown, mut stop) = watch::channel(false);
        let inner = Arc::downgrade(&self.inner);
        let period = self.inner.config.sweep_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let Some(inner) = inner.upgrade() else {
                            break;
                        };
                        let removed = inner.sweep_at(Instant::now()).await;
                        if removed > 0 {
                            tracing::debug!(removed, "Expired idle sessions");
                        }
                    }
                }
            }
        });

        *slot = Some(Sweeper { shutdown, handle });
    }

    /// Stop the sweep and remove every remaining session.
    pub async fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.lock().await.take() {
            let _ = sweeper.shutdown.send(true);
            if let Err(e) = sweeper.handle.await {
                tracing::warn!("Session sweeper ended abnormally: {e}");
            }
        }

        let remaining: Vec<(SessionId, SessionEntry)> =
            self.inner.sessions.write().await.drain().collect();
        for (id, entry) in remaining {
            self.inner.teardown(id, entry, RemovalReason::Shutdown).await;
        }
    }
}

/// Follow a transport's lifecycle until it closes.
fn spawn_watcher(
    inner: Weak<Inner>,
    session_id: SessionId,
    generation: u64,
    mut events: watch::Receiver<TransportEvent>,
) {
    tokio::spawn(async move {
        loop {
            let event = events.borrow_and_update().clone();
            let reason = match event {
                TransportEvent::Open => None,
                TransportEvent::Error(message) => {
                    // Left to the idle sweep.
                    tracing::warn!(%session_id, "Transport error: {message}");
                    None
                }
                TransportEvent::Closed(reason) => Some(reason),
            };

            let reason = match reason {
                Some(reason) => reason,
                None => {
                    if events.changed().await.is_ok() {
                        continue;
                    }
                    "transport dropped".to_string()
                }
            };

            if let Some(inner) = inner.upgrade() {
                inner
                    .remove(&session_id, Some(generation), RemovalReason::Closed(reason))
                    .await;
            }
            return;
        }
    });
}
