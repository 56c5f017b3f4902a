//! Newline-delimited JSON transport over a byte stream.
//!
//! One connection carries one session. The first frame must be
//! `initialize`; end of input closes the session.

use std::sync::Arc;

use agent_hub_core::{
    Delivery, HubError, SessionId, Transport, TransportError, TransportEvent, TransportKind,
    TransportSignals,
};
use agent_hub_session::RemovalReason;
use async_trait::async_trait;
use tokio::{
    io::{self, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
};

use crate::{
    gateway::Gateway,
    protocol::{ClientMessage, ServerMessage},
};

/// Frames queued for the writer before pushes are refused.
const OUTBOUND_CAPACITY: usize = 64;

/// Push side of a duplex connection.
#[derive(Debug)]
pub struct DuplexTransport {
    tx: mpsc::Sender<ServerMessage>,
    signals: TransportSignals,
}

impl DuplexTransport {
    /// Create a transport and the receiver its pushes arrive on.
    #[must_use]
    pub fn channel() -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let transport = Self {
            tx,
            signals: TransportSignals::new(),
        };
        (transport, rx)
    }
}

#[async_trait]
impl Transport for DuplexTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Duplex
    }

    async fn deliver(&self, delivery: Delivery) -> Result<(), TransportError> {
        if self.signals.is_closed() {
            return Err(TransportError::Closed);
        }
        // A reader that stopped draining gets queued messages instead.
        self.tx
            .try_send(ServerMessage::Message {
                event_id: None,
                message: delivery.message,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => TransportError::Unavailable("outbound buffer full".into()),
                TrySendError::Closed(_) => TransportError::Closed,
            })
    }

    fn subscribe(&self) -> watch::Receiver<TransportEvent> {
        self.signals.subscribe()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.signals.closed("closed by hub");
        Ok(())
    }
}

/// Serve one session over `reader`/`writer` until end of input, a
/// `terminate` frame, or the hub closing the session.
///
/// # Errors
/// Returns I/O errors from the underlying stream. The session is removed
/// in every case.
pub async fn serve_duplex<R, W>(gateway: Gateway, reader: R, writer: W) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (transport, outbound) = DuplexTransport::channel();
    let transport = Arc::new(transport);
    let mut connection = Connection {
        gateway,
        transport,
        session_id: None,
    };

    let result = connection.run(reader, writer, outbound).await;

    if let Some(session_id) = connection.session_id.take() {
        let reason = match &result {
            Ok(()) => "end of input".to_string(),
            Err(e) => format!("I/O error: {e}"),
        };
        connection
            .gateway
            .close_session(&session_id, RemovalReason::Closed(reason))
            .await;
    }
    result
}

struct Connection {
    gateway: Gateway,
    transport: Arc<DuplexTransport>,
    session_id: Option<SessionId>,
}

/// What to do after handling a frame.
enum Flow {
    Continue,
    Stop,
}

impl Connection {
    async fn run<R, W>(
        &mut self,
        reader: R,
        mut writer: W,
        mut outbound: mpsc::Receiver<ServerMessage>,
    ) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        let mut lifecycle = self.transport.subscribe();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        tracing::debug!(session_id = ?self.session_id, "Duplex input ended");
                        return Ok(());
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let (reply, flow) = self.handle_line(&line).await;
                    if let Some(reply) = reply {
                        write_frame(&mut writer, &reply).await?;
                    }
                    if matches!(flow, Flow::Stop) {
                        return Ok(());
                    }
                }
                Some(frame) = outbound.recv() => {
                    write_frame(&mut writer, &frame).await?;
                }
                changed = lifecycle.changed() => {
                    let closed = changed.is_err()
                        || matches!(*lifecycle.borrow_and_update(), TransportEvent::Closed(_));
                    if closed {
                        // Flush pushes accepted before the close.
                        while let Ok(frame) = outbound.try_recv() {
                            write_frame(&mut writer, &frame).await?;
                        }
                        tracing::debug!(session_id = ?self.session_id, "Duplex session closed by hub");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_line(&mut self, line: &str) -> (Option<ServerMessage>, Flow) {
        let frame = match serde_json::from_str::<ClientMessage>(line) {
            Ok(frame) => frame,
            Err(e) => {
                let err = HubError::bad_request(format!("Invalid frame: {e}"));
                return (Some(ServerMessage::error(None, &err)), Flow::Continue);
            }
        };

        let Some(session_id) = self.session_id.clone() else {
            return self.handle_first(frame).await;
        };

        match frame {
            ClientMessage::Initialize { .. } => {
                let err = HubError::bad_request("session already initialized");
                (Some(ServerMessage::error(None, &err)), Flow::Continue)
            }
            ClientMessage::Call { id, operation, args } => {
                let result = self.gateway.call(&session_id, &operation, args).await;
                let session_gone = matches!(&result, Err(HubError::SessionNotFound(gone)) if *gone == session_id);
                let reply = ServerMessage::reply(id, result);
                if session_gone {
                    self.session_id = None;
                    return (Some(reply), Flow::Stop);
                }
                (Some(reply), Flow::Continue)
            }
            ClientMessage::Ping => {
                if self.gateway.ping(&session_id).await {
                    (Some(ServerMessage::Pong), Flow::Continue)
                } else {
                    self.session_id = None;
                    let err = HubError::SessionNotFound(session_id);
                    (Some(ServerMessage::error(None, &err)), Flow::Stop)
                }
            }
            ClientMessage::Terminate => {
                self.session_id = None;
                self.gateway
                    .close_session(&session_id, RemovalReason::Terminated)
                    .await;
                (None, Flow::Stop)
            }
        }
    }

    async fn handle_first(&mut self, frame: ClientMessage) -> (Option<ServerMessage>, Flow) {
        match frame {
            ClientMessage::Initialize { client_info } => {
                let session_id = Gateway::new_session_id();
                let transport: Arc<dyn Transport> = self.transport.clone();
                match self
                    .gateway
                    .open_session(&session_id, transport, client_info)
                    .await
                {
                    Ok(()) => {
                        self.session_id = Some(session_id.clone());
                        (Some(ServerMessage::Initialized { session_id }), Flow::Continue)
                    }
                    Err(e) => (Some(ServerMessage::error(None, &e)), Flow::Stop),
                }
            }
            ClientMessage::Terminate => (None, Flow::Stop),
            ClientMessage::Call { id, .. } => {
                let err = HubError::bad_request("initialize must come first");
                (Some(ServerMessage::error(Some(id), &err)), Flow::Continue)
            }
            ClientMessage::Ping => {
                let err = HubError::bad_request("initialize must come first");
                (Some(ServerMessage::error(None, &err)), Flow::Continue)
            }
        }
    }
}

async fn write_frame<W>(writer: &mut W, frame: &ServerMessage) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(frame).map_err(io::Error::other)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use agent_hub_core::{HubConfig, Message, SendRequest};
    use agent_hub_router::Hub;
    use serde_json::{Value, json};
    use tokio::{
        io::{DuplexStream, Lines, ReadHalf, WriteHalf},
        task::JoinHandle,
    };

    use super::*;

    struct Client {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
        server: JoinHandle<io::Result<()>>,
    }

    impl Client {
        fn connect(gateway: &Gateway) -> Self {
            let (client, server) = io::duplex(4096);
            let (server_read, server_write) = io::split(server);
            let gateway = gateway.clone();
            let server = tokio::spawn(serve_duplex(gateway, server_read, server_write));

            let (client_read, writer) = io::split(client);
            Self {
                lines: BufReader::new(client_read).lines(),
                writer,
                server,
            }
        }

        async fn send(&mut self, frame: Value) {
            let mut line = frame.to_string();
            line.push('\n');
            self.writer.write_all(line.as_bytes()).await.unwrap();
        }

        async fn send_raw(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
        }

        async fn recv(&mut self) -> Value {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn initialize(&mut self) -> String {
            self.send(json!({"type": "initialize", "client_info": {"name": "test"}}))
                .await;
            let reply = self.recv().await;
            assert_eq!(reply["type"], "initialized");
            reply["session_id"].as_str().unwrap().to_string()
        }

        async fn register(&mut self, agent_id: &str) {
            self.send(json!({
                "type": "call",
                "id": 1,
                "operation": "register_agent",
                "args": {"agent_id": agent_id, "agent_type": "worker"}
            }))
            .await;
            let reply = self.recv().await;
            assert_eq!(reply["type"], "result", "{reply}");
        }
    }

    async fn gateway() -> Gateway {
        Gateway::new(Hub::new(HubConfig::default()).await)
    }

    #[tokio::test]
    async fn test_full_outbound_refuses_push() {
        let (transport, mut outbound) = DuplexTransport::channel();
        let delivery = || Delivery {
            event_id: None,
            message: Message::new(
                "c1".into(),
                &SendRequest::new("a", "b", json!({}).as_object().cloned().unwrap()),
            ),
        };

        for _ in 0..OUTBOUND_CAPACITY {
            transport.deliver(delivery()).await.unwrap();
        }
        let err = transport.deliver(delivery()).await.unwrap_err();
        assert!(matches!(err, TransportError::Unavailable(_)), "{err}");

        outbound.recv().await.unwrap();
        transport.deliver(delivery()).await.unwrap();

        drop(outbound);
        let err = transport.deliver(delivery()).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed), "{err}");
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let gateway = gateway().await;
        let mut client = Client::connect(&gateway);

        let session_id = client.initialize().await;
        assert!(gateway.hub().sessions().contains(&session_id).await);

        client.register("agent1").await;
        client.send(json!({"type": "ping"})).await;
        assert_eq!(client.recv().await, json!({"type": "pong"}));

        client
            .send(json!({"type": "call", "id": 9, "operation": "no_such_thing"}))
            .await;
        let reply = client.recv().await;
        assert_eq!(reply["id"], 9);
        assert_eq!(reply["code"], "unknown_operation");

        // Closing the client ends the session and its agent.
        client.writer.shutdown().await.unwrap();
        drop(client.writer);
        client.server.await.unwrap().unwrap();
        assert!(!gateway.hub().sessions().contains(&session_id).await);
        assert!(gateway.hub().list_agents().await.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_line_is_skipped() {
        let gateway = gateway().await;
        let mut client = Client::connect(&gateway);
        client.initialize().await;

        client.send_raw("{not json\n").await;
        let reply = client.recv().await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["code"], "bad_request");

        client.send(json!({"type": "ping"})).await;
        assert_eq!(client.recv().await["type"], "pong");
    }

    #[tokio::test]
    async fn test_initialize_must_come_first() {
        let gateway = gateway().await;
        let mut client = Client::connect(&gateway);

        client
            .send(json!({"type": "call", "id": 1, "operation": "list_agents"}))
            .await;
        let reply = client.recv().await;
        assert_eq!(reply["code"], "bad_request");
        assert_eq!(reply["id"], 1);
        assert!(gateway.hub().sessions().is_empty().await);
    }

    #[tokio::test]
    async fn test_push_reaches_recipient() {
        let gateway = gateway().await;
        let mut alice = Client::connect(&gateway);
        let mut bob = Client::connect(&gateway);
        alice.initialize().await;
        bob.initialize().await;
        alice.register("alice").await;
        bob.register("bob").await;

        alice
            .send(json!({
                "type": "call",
                "id": 2,
                "operation": "send_message",
                "args": {"from_agent": "alice", "to_agent": "bob", "payload": {"msg": "hi"}}
            }))
            .await;
        let reply = alice.recv().await;
        assert_eq!(reply["result"]["delivery"]["path"], "pushed");

        let pushed = bob.recv().await;
        assert_eq!(pushed["type"], "message");
        assert_eq!(pushed["message"]["from_agent"], "alice");
        assert_eq!(pushed["message"]["payload"], json!({"msg": "hi"}));
    }

    #[tokio::test]
    async fn test_terminate_ends_connection() {
        let gateway = gateway().await;
        let mut client = Client::connect(&gateway);
        let session_id = client.initialize().await;

        client.send(json!({"type": "terminate"})).await;
        client.server.await.unwrap().unwrap();
        assert!(!gateway.hub().sessions().contains(&session_id).await);
    }

    #[tokio::test]
    async fn test_hub_close_ends_connection() {
        let gateway = gateway().await;
        let mut client = Client::connect(&gateway);
        let session_id = client.initialize().await;

        gateway
            .close_session(&session_id, RemovalReason::Shutdown)
            .await;
        client.server.await.unwrap().unwrap();
        assert!(client.lines.next_line().await.unwrap().is_none());
    }
}
