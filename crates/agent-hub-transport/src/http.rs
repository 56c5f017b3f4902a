//! HTTP transport: JSON calls over `POST /rpc`, pushes over SSE.
//!
//! A session starts with an `initialize` frame posted without a session
//! header; the response carries the new id in `hub-session-id`. Pushes for
//! the session's agent are logged under the session id and streamed from
//! `GET /events`. A reconnecting client sends `Last-Event-ID` with the
//! last cursor it saw and gets the missed events first.

use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{Arc, Weak},
    time::Duration,
};

use agent_hub_core::{
    ClientInfo, Delivery, ErrorKind, EventId, HubError, Message, SessionId, StreamId, Transport,
    TransportError, TransportEvent, TransportKind, TransportSignals,
};
use agent_hub_session::RemovalReason;
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::{Stream, StreamExt, future, stream};
use tokio::sync::{
    Mutex, RwLock,
    mpsc::{self, error::TrySendError},
    watch,
};
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    gateway::Gateway,
    protocol::{ClientMessage, ServerMessage, StreamCursor},
};

/// Header carrying the session id.
pub const SESSION_HEADER: &str = "hub-session-id";
/// Header carrying the SSE resume cursor.
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

const STREAM_CAPACITY: usize = 64;
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

type Pushed = (EventId, Message);

/// Push side of an HTTP session. Live only while an event stream is
/// attached; events are logged by the hub either way.
#[derive(Debug)]
pub struct HttpTransport {
    stream_id: StreamId,
    listener: Mutex<Option<mpsc::Sender<Pushed>>>,
    signals: TransportSignals,
}

impl HttpTransport {
    #[must_use]
    pub fn new(stream_id: impl Into<StreamId>) -> Self {
        Self {
            stream_id: stream_id.into(),
            listener: Mutex::new(None),
            signals: TransportSignals::new(),
        }
    }

    /// Attach a new event stream, replacing any previous one.
    pub async fn attach(&self) -> mpsc::Receiver<Pushed> {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        if self.listener.lock().await.replace(tx).is_some() {
            tracing::debug!(stream_id = %self.stream_id, "Replaced attached event stream");
        }
        rx
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Streaming {
            stream_id: self.stream_id.clone(),
        }
    }

    async fn deliver(&self, delivery: Delivery) -> Result<(), TransportError> {
        let Some(event_id) = delivery.event_id else {
            return Err(TransportError::Unavailable("event id required".into()));
        };
        let Some(tx) = self.listener.lock().await.clone() else {
            return Err(TransportError::Unavailable("no event stream attached".into()));
        };

        match tx.try_send((event_id, delivery.message)) {
            Ok(()) => Ok(()),
            // The event stays in the log for the next resume.
            Err(TrySendError::Full(_)) => {
                Err(TransportError::Unavailable("event stream full".into()))
            }
            Err(TrySendError::Closed(_)) => {
                let mut listener = self.listener.lock().await;
                if listener.as_ref().is_some_and(|current| current.same_channel(&tx)) {
                    listener.take();
                }
                drop(listener);
                self.signals.error("event stream detached");
                Err(TransportError::Unavailable("event stream detached".into()))
            }
        }
    }

    fn subscribe(&self) -> watch::Receiver<TransportEvent> {
        self.signals.subscribe()
    }

    async fn close(&self) -> Result<(), TransportError> {
        // Dropping the sender ends the attached stream.
        self.listener.lock().await.take();
        self.signals.closed("closed by hub");
        Ok(())
    }
}

/// Shared handler state.
#[derive(Clone)]
pub struct HttpState {
    gateway: Gateway,
    transports: Arc<RwLock<HashMap<SessionId, Weak<HttpTransport>>>>,
}

impl HttpState {
    #[must_use]
    pub fn new(gateway: Gateway) -> Self {
        Self {
            gateway,
            transports: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn open(&self, client_info: Option<ClientInfo>) -> Result<SessionId, HubError> {
        let session_id = Gateway::new_session_id();
        let transport = Arc::new(HttpTransport::new(session_id.clone()));
        {
            let mut transports = self.transports.write().await;
            // The session manager owns transports; dead entries are ended sessions.
            transports.retain(|_, t| t.strong_count() > 0);
            transports.insert(session_id.clone(), Arc::downgrade(&transport));
        }
        self.gateway
            .open_session(&session_id, transport, client_info)
            .await?;
        Ok(session_id)
    }

    async fn transport(&self, session_id: &str) -> Option<Arc<HttpTransport>> {
        self.transports
            .read()
            .await
            .get(session_id)
            .and_then(Weak::upgrade)
    }
}

/// Error response: status from the error kind, body is an `error` frame.
#[derive(Debug)]
pub struct HttpError {
    id: Option<u64>,
    error: HubError,
}

impl HttpError {
    const fn for_call(id: u64, error: HubError) -> Self {
        Self {
            id: Some(id),
            error,
        }
    }
}

impl From<HubError> for HttpError {
    fn from(error: HubError) -> Self {
        Self { id: None, error }
    }
}

/// HTTP status for an error kind.
#[must_use]
pub const fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::BadRequest | ErrorKind::UnknownOperation => StatusCode::BAD_REQUEST,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let kind = self.error.kind();
        match kind {
            ErrorKind::Internal => tracing::error!(error = %self.error, "Request failed"),
            ErrorKind::Unavailable => tracing::warn!(error = %self.error, "Request failed"),
            _ => tracing::debug!(error = %self.error, "Client error"),
        }
        let frame = ServerMessage::error(self.id, &self.error);
        (status_for(kind), Json(frame)).into_response()
    }
}

/// Build the HTTP router.
pub fn router(gateway: Gateway) -> Router {
    Router::new()
        .route("/rpc", post(post_rpc).delete(delete_rpc))
        .route("/events", get(get_events))
        .with_state(HttpState::new(gateway))
}

fn session_header(headers: &HeaderMap) -> Result<SessionId, HubError> {
    headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| HubError::bad_request(format!("missing {SESSION_HEADER} header")))
}

async fn post_rpc(
    State(state): State<HttpState>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, HttpError> {
    let frame: ClientMessage = serde_json::from_str(&body)
        .map_err(|e| HubError::bad_request(format!("Invalid frame: {e}")))?;

    match frame {
        ClientMessage::Initialize { client_info } => {
            let session_id = state.open(client_info).await?;
            let frame = ServerMessage::Initialized {
                session_id: session_id.clone(),
            };
            Ok(([(SESSION_HEADER, session_id)], Json(frame)).into_response())
        }
        ClientMessage::Call {
            id,
            operation,
            args,
        } => {
            let session_id = session_header(&headers).map_err(|e| HttpError::for_call(id, e))?;
            let result = state
                .gateway
                .call(&session_id, &operation, args)
                .await
                .map_err(|e| HttpError::for_call(id, e))?;
            Ok(Json(ServerMessage::Result { id, result }).into_response())
        }
        ClientMessage::Ping => {
            let session_id = session_header(&headers)?;
            if !state.gateway.ping(&session_id).await {
                return Err(HubError::SessionNotFound(session_id).into());
            }
            Ok(Json(ServerMessage::Pong).into_response())
        }
        ClientMessage::Terminate => Ok(terminate(&state, &headers).await?.into_response()),
    }
}

async fn delete_rpc(
    State(state): State<HttpState>,
    headers: HeaderMap,
) -> Result<StatusCode, HttpError> {
    terminate(&state, &headers).await
}

async fn terminate(state: &HttpState, headers: &HeaderMap) -> Result<StatusCode, HttpError> {
    let session_id = session_header(headers)?;
    if state
        .gateway
        .close_session(&session_id, RemovalReason::Terminated)
        .await
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(HubError::SessionNotFound(session_id).into())
    }
}

async fn get_events(
    State(state): State<HttpState>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, HttpError> {
    let session_id = session_header(&headers)?;
    let cursor = match headers.get(LAST_EVENT_ID_HEADER) {
        None => None,
        Some(value) => {
            let raw = value
                .to_str()
                .map_err(|_| HubError::bad_request("invalid Last-Event-ID header"))?;
            Some(raw.parse::<StreamCursor>()?)
        }
    };

    let transport = state
        .transport(&session_id)
        .await
        .ok_or_else(|| HubError::SessionNotFound(session_id.clone()))?;
    if !state.gateway.ping(&session_id).await {
        return Err(HubError::SessionNotFound(session_id).into());
    }

    // Attach before replaying so nothing logged in between is missed.
    let live = transport.attach().await;

    let mut replayed: Vec<(StreamCursor, Message)> = Vec::new();
    let mut floor = None;
    if let Some(cursor) = &cursor {
        let last = state
            .gateway
            .resume(cursor, |event_id, message| {
                replayed.push((StreamCursor::new(cursor.stream_id.clone(), event_id), message));
                future::ready(Ok::<(), Infallible>(()))
            })
            .await;
        if cursor.stream_id == session_id {
            floor = last;
        }
    }
    tracing::debug!(%session_id, replayed = replayed.len(), "Event stream attached");

    let stream_id = session_id;
    let live = ReceiverStream::new(live)
        .filter(move |(event_id, _)| future::ready(floor.is_none_or(|floor| *event_id > floor)))
        .map(move |(event_id, message)| (StreamCursor::new(stream_id.clone(), event_id), message));

    let events = stream::iter(replayed)
        .chain(live)
        .map(|(cursor, message)| sse_event(&cursor, message));

    Ok(Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("keepalive"),
    ))
}

fn sse_event(cursor: &StreamCursor, message: Message) -> Result<Event, axum::Error> {
    let id = cursor.to_string();
    Event::default()
        .id(&id)
        .event("message")
        .json_data(ServerMessage::Message {
            event_id: Some(id),
            message,
        })
}

#[cfg(test)]
mod tests {
    use agent_hub_core::HubConfig;
    use agent_hub_router::Hub;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;

    struct TestApp {
        router: Router,
        gateway: Gateway,
    }

    impl TestApp {
        async fn new() -> Self {
            let gateway = Gateway::new(Hub::new(HubConfig::default()).await);
            Self {
                router: router(gateway.clone()),
                gateway,
            }
        }

        async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let headers = response.headers().clone();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            let body = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap()
            };
            (status, headers, body)
        }

        async fn post(&self, session: Option<&str>, frame: Value) -> (StatusCode, HeaderMap, Value) {
            let mut request = Request::builder()
                .method("POST")
                .uri("/rpc")
                .header("content-type", "application/json");
            if let Some(session) = session {
                request = request.header(SESSION_HEADER, session);
            }
            self.send(request.body(Body::from(frame.to_string())).unwrap())
                .await
        }

        async fn initialize(&self) -> String {
            let (status, headers, body) = self.post(None, json!({"type": "initialize"})).await;
            assert_eq!(status, StatusCode::OK);
            let session_id = headers[SESSION_HEADER].to_str().unwrap().to_string();
            assert_eq!(body["session_id"], json!(session_id));
            session_id
        }

        async fn call(&self, session: &str, operation: &str, args: Value) -> (StatusCode, Value) {
            let (status, _, body) = self
                .post(
                    Some(session),
                    json!({"type": "call", "id": 1, "operation": operation, "args": args}),
                )
                .await;
            (status, body)
        }

        async fn open_events(&self, session: &str, last_event_id: Option<&str>) -> Response {
            let mut request = Request::builder()
                .method("GET")
                .uri("/events")
                .header(SESSION_HEADER, session);
            if let Some(cursor) = last_event_id {
                request = request.header(LAST_EVENT_ID_HEADER, cursor);
            }
            self.router
                .clone()
                .oneshot(request.body(Body::empty()).unwrap())
                .await
                .unwrap()
        }
    }

    async fn next_event(body: &mut Body) -> String {
        let frame = body.frame().await.unwrap().unwrap();
        String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap()
    }

    fn greeting(n: u32) -> Value {
        json!({"from_agent": "a", "to_agent": "b", "payload": {"n": n}})
    }

    #[tokio::test]
    async fn test_call_flow_and_errors() {
        let app = TestApp::new().await;
        let session = app.initialize().await;

        let (status, body) = app
            .call(&session, "register_agent", json!({"agent_id": "a", "agent_type": "worker"}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["type"], "result");
        assert_eq!(body["result"]["agent_id"], "a");

        let (status, body) = app.call(&session, "teleport", Value::Null).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "unknown_operation");
        assert_eq!(body["id"], 1);

        let (status, body) = app.call("no-such-session", "list_agents", Value::Null).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");

        let (status, _, body) = app
            .post(None, json!({"type": "call", "id": 4, "operation": "list_agents"}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["id"], 4);

        let (status, _, body) = app.post(Some(&session), json!({"type": "ping"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"type": "pong"}));
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let app = TestApp::new().await;
        let request = Request::builder()
            .method("POST")
            .uri("/rpc")
            .body(Body::from("{oops"))
            .unwrap();
        let (status, _, body) = app.send(request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "bad_request");
    }

    #[tokio::test]
    async fn test_delete_terminates_session() {
        let app = TestApp::new().await;
        let session = app.initialize().await;
        app.call(&session, "register_agent", json!({"agent_id": "a", "agent_type": "worker"}))
            .await;

        let delete = || {
            Request::builder()
                .method("DELETE")
                .uri("/rpc")
                .header(SESSION_HEADER, session.as_str())
                .body(Body::empty())
                .unwrap()
        };
        let (status, _, _) = app.send(delete()).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(app.gateway.hub().list_agents().await.is_empty());

        let (status, _, body) = app.send(delete()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn test_events_requires_known_session_and_valid_cursor() {
        let app = TestApp::new().await;
        let response = app.open_events("ghost", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let session = app.initialize().await;
        let response = app.open_events(&session, Some("no-cursor-here")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missed_events_replay_then_live() {
        let app = TestApp::new().await;
        let sender = app.initialize().await;
        let receiver = app.initialize().await;
        app.call(&sender, "register_agent", json!({"agent_id": "a", "agent_type": "worker"}))
            .await;
        app.call(&receiver, "register_agent", json!({"agent_id": "b", "agent_type": "worker"}))
            .await;

        // No stream attached yet: queued, but logged for replay.
        let (_, body) = app.call(&sender, "send_message", greeting(1)).await;
        assert_eq!(body["result"]["delivery"]["path"], "queued");

        let response = app
            .open_events(&receiver, Some(&format!("{receiver}:0")))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let mut body = response.into_body();

        let replayed = next_event(&mut body).await;
        assert!(replayed.contains(&format!("id: {receiver}:1")), "{replayed}");
        assert!(replayed.contains(r#""n":1"#), "{replayed}");

        let (_, sent) = app.call(&sender, "send_message", greeting(2)).await;
        assert_eq!(sent["result"]["delivery"]["path"], "streamed");
        assert_eq!(
            sent["result"]["delivery"]["event_id"],
            json!(format!("{receiver}:2"))
        );

        let live = next_event(&mut body).await;
        assert!(live.contains(&format!("id: {receiver}:2")), "{live}");
        assert!(live.contains(r#""n":2"#), "{live}");
    }

    #[tokio::test]
    async fn test_reconnect_resumes_old_stream_then_new() {
        let app = TestApp::new().await;
        let sender = app.initialize().await;
        app.call(&sender, "register_agent", json!({"agent_id": "a", "agent_type": "worker"}))
            .await;

        let first = app.initialize().await;
        app.call(&first, "register_agent", json!({"agent_id": "b", "agent_type": "worker"}))
            .await;
        for n in 1..=2 {
            let (_, body) = app.call(&sender, "send_message", greeting(n)).await;
            assert_eq!(body["result"]["delivery"]["path"], "queued");
        }

        // The connection drops; its stream stays resumable.
        assert!(
            app.gateway
                .close_session(&first, RemovalReason::Closed("network".into()))
                .await
        );
        assert!(app.gateway.hub().list_agents().await.iter().all(|a| a.agent.agent_id != "b"));

        let second = app.initialize().await;
        app.call(&second, "register_agent", json!({"agent_id": "b", "agent_type": "worker"}))
            .await;
        let response = app
            .open_events(&second, Some(&format!("{first}:1")))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let mut body = response.into_body();

        let missed = next_event(&mut body).await;
        assert!(missed.contains(&format!("id: {first}:2")), "{missed}");
        assert!(missed.contains(r#""n":2"#), "{missed}");

        let (_, sent) = app.call(&sender, "send_message", greeting(3)).await;
        assert_eq!(
            sent["result"]["delivery"]["event_id"],
            json!(format!("{second}:1"))
        );
        let live = next_event(&mut body).await;
        assert!(live.contains(&format!("id: {second}:1")), "{live}");
        assert!(live.contains(r#""n":3"#), "{live}");

        // An explicit terminate drops the stream: nothing is replayed.
        let (status, _, _) = app.post(Some(&second), json!({"type": "terminate"})).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(app.gateway.hub().events().len(&second).await, 0);

        let third = app.initialize().await;
        app.call(&third, "register_agent", json!({"agent_id": "b", "agent_type": "worker"}))
            .await;
        let mut body = app
            .open_events(&third, Some(&format!("{second}:0")))
            .await
            .into_body();
        app.call(&sender, "send_message", greeting(4)).await;
        let next = next_event(&mut body).await;
        assert!(next.contains(&format!("id: {third}:1")), "{next}");
        assert!(next.contains(r#""n":4"#), "{next}");
    }

    #[tokio::test]
    async fn test_terminate_ends_event_stream() {
        let app = TestApp::new().await;
        let session = app.initialize().await;
        let mut body = app.open_events(&session, None).await.into_body();

        let (status, _, _) = app.post(Some(&session), json!({"type": "terminate"})).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(body.frame().await.is_none());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::UnknownOperation), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::Unavailable), StatusCode::SERVICE_UNAVAILABLE);
    }
}
