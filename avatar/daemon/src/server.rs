//! Daemon Server Implementation
//!
//! This module provides the network side of the avatar daemon:
//! - Accepts TCP connections and upgrades them to WebSockets
//! - Registers each connection and opens its session
//! - Pumps frames between the socket and the session coordinator
//! - Supports graceful shutdown
//!
//! # Connection Lifecycle
//!
//! ```text
//!   TCP accept ─▶ handshake (/ws/{client_id}) ─▶ register ─▶ open session
//!                                                              │
//!     reader loop                        writer task ◀─────────┘
//!     inbound frame ─▶ submit            outbound channel ─▶ socket
//!                                        close signal     ─▶ close frame
//!           │                                  │
//!           └──────────── either ends ─────────┘
//!                              ▼
//!             coordinator.disconnect (the only exit)
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn, Instrument};

use avatar_core::config::ServerConfig;
use avatar_core::{
    CloseReason, CloseSignal, ConnectionHandle, ConnectionId, InboundMessage, OutboundMessage,
    SessionCoordinator,
};

/// How long connections get to finish after shutdown is requested
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// How long the writer gets to flush after the reader stops
const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// How often stale registry entries are swept
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

const MAX_CLIENT_ID_LEN: usize = 128;

/// Client id requested in the upgrade path, if it is usable
///
/// Accepts `/ws/{client_id}` with an optional trailing slash. Ids are limited
/// to ASCII alphanumerics, `-` and `_`.
fn client_id_from_path(path: &str) -> Option<String> {
    let id = path.strip_prefix("/ws/")?.trim_end_matches('/');
    let valid = !id.is_empty()
        && id.len() <= MAX_CLIENT_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    valid.then(|| id.to_string())
}

/// The WebSocket server
pub struct AvatarServer {
    listener: TcpListener,
    config: ServerConfig,
    coordinator: SessionCoordinator,
}

impl AvatarServer {
    /// Bind the listen socket
    pub async fn bind(config: &ServerConfig, coordinator: SessionCoordinator) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind)
            .await
            .with_context(|| format!("Failed to bind to {}", config.bind))?;

        Ok(Self {
            listener,
            config: config.clone(),
            coordinator,
        })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    /// Accept connections until `shutdown` resolves, then drain them
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let mut connections = JoinSet::new();

        info!(addr = %self.local_addr()?, "Listening for connections");

        // Periodically sweep handles whose socket task died without a disconnect
        let registry = self.coordinator.registry().clone();
        let sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = registry.cleanup_disconnected();
                if removed > 0 {
                    debug!(removed, "Swept disconnected connections");
                }
            }
        });

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("Shutdown requested, stopping accept loop");
                    break;
                }

                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "Accept failed");
                            continue;
                        }
                    };

                    // reap finished handlers so the limit counts live ones
                    while connections.try_join_next().is_some() {}

                    if connections.len() >= self.config.max_connections {
                        warn!(
                            peer = %peer,
                            max_connections = self.config.max_connections,
                            "Connection limit reached, rejecting new connection"
                        );
                        drop(stream);
                        continue;
                    }

                    connections.spawn(serve_connection(
                        stream,
                        peer,
                        self.coordinator.clone(),
                        self.config.outbound_buffer,
                    ));
                }
            }
        }

        sweeper.abort();
        self.shutdown(connections).await;
        Ok(())
    }

    async fn shutdown(&self, mut connections: JoinSet<()>) {
        info!(
            active_connections = connections.len(),
            "Initiating graceful shutdown"
        );

        self.coordinator.close_all();
        let closed = self.coordinator.registry().close_all(CloseReason::Shutdown);
        debug!(closed, "Closed registered connections");

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = connections.len(),
                "Connections still open after grace period, aborting"
            );
            connections.shutdown().await;
        }

        info!("Shutdown complete");
    }
}

/// Handshake, then run the connection inside its span
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    coordinator: SessionCoordinator,
    outbound_buffer: usize,
) {
    let mut requested = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        requested = client_id_from_path(request.uri().path());
        Ok(response)
    };

    let socket = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let id = requested.map_or_else(ConnectionId::generate, ConnectionId::new);
    let span = tracing::info_span!("connection", connection_id = %id, peer = %peer);
    handle_connection(id, socket, coordinator, outbound_buffer)
        .instrument(span)
        .await;
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Read frames until the client leaves or the writer stops
///
/// Nothing here waits on the outbound channel; the writer task drains it
/// on its own, so a client that floods the socket cannot stall delivery.
async fn handle_connection(
    id: ConnectionId,
    socket: WebSocketStream<TcpStream>,
    coordinator: SessionCoordinator,
    outbound_buffer: usize,
) {
    let connected_at = Instant::now();
    let (sink, mut source) = socket.split();

    let (tx, outbound) = mpsc::channel(outbound_buffer);
    let (handle, close) = ConnectionHandle::new(id.clone(), tx);
    let registration = coordinator.registry().register(handle);
    coordinator.open_session(&registration);

    info!(
        generation = registration.generation,
        active_connections = coordinator.registry().count(),
        "Client connected"
    );
    coordinator
        .registry()
        .send_to(&id, OutboundMessage::connected(id.as_str()));

    let mut writer = tokio::spawn(write_frames(sink, outbound, close).in_current_span());
    let mut writer_done = false;

    loop {
        tokio::select! {
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if !forward_text(&coordinator, &id, &text) {
                        break;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    warn!(len = bytes.len(), "Ignoring binary frame");
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("Client closed connection");
                    break;
                }
                // ping and pong frames are answered by the library
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Read error");
                    break;
                }
            },

            _ = &mut writer => {
                writer_done = true;
                break;
            }
        }
    }

    // removal closes the handle, which stops the writer
    coordinator.disconnect(&registration);
    if !writer_done && tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        debug!("Writer did not stop in time, aborting");
        writer.abort();
    }

    info!(
        uptime_secs = connected_at.elapsed().as_secs(),
        active_connections = coordinator.registry().count(),
        "Connection handler finished"
    );
}

/// Drain the outbound channel into the socket until closed
async fn write_frames(
    mut sink: WsSink,
    mut outbound: mpsc::Receiver<OutboundMessage>,
    mut close: CloseSignal,
) {
    loop {
        tokio::select! {
            message = outbound.recv() => {
                let Some(message) = message else {
                    debug!("Outbound channel closed");
                    break;
                };
                let kind = message.kind();
                let json = match message.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(kind, error = %e, "Failed to encode message");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json)).await {
                    warn!(kind, error = %e, "Write error");
                    break;
                }
            }

            reason = &mut close => {
                let reason = reason.unwrap_or(CloseReason::Disconnected);
                info!(reason = reason.as_str(), "Closing connection");
                if let Err(e) = sink.send(Message::Close(None)).await {
                    debug!(error = %e, "Failed to send close frame");
                }
                break;
            }
        }
    }

    if let Err(e) = sink.close().await {
        debug!(error = %e, "Socket already closed");
    }
}

/// Parse and submit one text frame; false once the session is gone
fn forward_text(coordinator: &SessionCoordinator, id: &ConnectionId, text: &str) -> bool {
    let message = match InboundMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "Rejected inbound frame");
            coordinator
                .registry()
                .send_to(id, OutboundMessage::error(e.to_string()));
            return true;
        }
    };

    let kind = message.kind();
    match coordinator.submit(id, message) {
        Ok(()) => true,
        Err(e) => {
            warn!(kind, error = %e, "Session no longer accepts messages");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use avatar_core::backend::{ClientRelay, CommandRenderer, CommandSpec, CommandStt, CommandTts};
    use avatar_core::{ConnectionRegistry, CoordinatorConfig, PhonemeTimeline, Services};
    use serde_json::Value;
    use tokio::sync::oneshot;
    use tokio_tungstenite::connect_async;

    fn coordinator(output_dir: &std::path::Path) -> SessionCoordinator {
        let timeout = Duration::from_secs(5);
        let services = Services {
            stt: Arc::new(CommandStt::new(CommandSpec::new("true"), 16_000, timeout)),
            tts: Arc::new(CommandTts::new(CommandSpec::new("true"), "test", 16_000, timeout)),
            generator: Arc::new(ClientRelay),
            renderer: Arc::new(CommandRenderer::new(
                CommandSpec::new("true"),
                output_dir,
                timeout,
            )),
            timeline: PhonemeTimeline::default(),
        };
        SessionCoordinator::new(
            CoordinatorConfig::default(),
            services,
            ConnectionRegistry::new(),
        )
    }

    struct Running {
        addr: SocketAddr,
        stop: oneshot::Sender<()>,
        task: tokio::task::JoinHandle<Result<()>>,
        _dir: tempfile::TempDir,
    }

    impl Running {
        async fn stop(self) {
            self.stop.send(()).unwrap();
            self.task.await.unwrap().unwrap();
        }
    }

    async fn start(max_connections: usize) -> Running {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            bind: "127.0.0.1:0".into(),
            max_connections,
            ..ServerConfig::default()
        };
        let server = AvatarServer::bind(&config, coordinator(dir.path()))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run(async {
            let _ = stop_rx.await;
        }));
        Running {
            addr,
            stop: stop_tx,
            task,
            _dir: dir,
        }
    }

    async fn next_json<S>(ws: &mut S) -> Value
    where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out")
                .expect("stream ended")
                .expect("read error");
            if let Message::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[test]
    fn test_client_id_from_path() {
        assert_eq!(client_id_from_path("/ws/abc-123"), Some("abc-123".into()));
        assert_eq!(client_id_from_path("/ws/user_7/"), Some("user_7".into()));
        assert_eq!(client_id_from_path("/ws/"), None);
        assert_eq!(client_id_from_path("/"), None);
        assert_eq!(client_id_from_path("/ws/../etc"), None);
        assert_eq!(client_id_from_path(&format!("/ws/{}", "a".repeat(129))), None);
    }

    #[tokio::test]
    async fn test_websocket_session_round_trip() {
        let server = start(10).await;

        let (mut ws, _) = connect_async(format!("ws://{}/ws/tester", server.addr)).await.unwrap();

        let connected = next_json(&mut ws).await;
        assert_eq!(connected["type"], "connected");
        assert_eq!(connected["client_id"], "tester");

        ws.send(Message::Text("not json".into())).await.unwrap();
        assert_eq!(next_json(&mut ws).await["type"], "error");

        ws.send(Message::Text(r#"{"type":"ping"}"#.into())).await.unwrap();
        assert_eq!(next_json(&mut ws).await["type"], "pong");

        ws.send(Message::Text(r#"{"type":"text","text":"namaste","callback_id":"cb-9"}"#.into()))
            .await
            .unwrap();
        let received = next_json(&mut ws).await;
        assert_eq!(received["type"], "text_received");
        let request = next_json(&mut ws).await;
        assert_eq!(request["type"], "llm_request");
        assert_eq!(request["callback_id"], "cb-9");

        server.stop().await;

        // the server closes the socket on shutdown
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(Ok(frame)) = ws.next().await {
                if frame.is_close() {
                    break;
                }
            }
        })
        .await;
        assert!(drained.is_ok());
    }

    #[tokio::test]
    async fn test_generated_id_without_path() {
        let server = start(10).await;

        let (mut ws, _) = connect_async(format!("ws://{}/", server.addr)).await.unwrap();
        let connected = next_json(&mut ws).await;
        let id = connected["client_id"].as_str().unwrap();
        assert_eq!(id.len(), 36, "expected a UUID, got {id}");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let server = start(1).await;

        let (mut first, _) = connect_async(format!("ws://{}/ws/one", server.addr))
            .await
            .unwrap();
        assert_eq!(next_json(&mut first).await["type"], "connected");

        assert!(connect_async(format!("ws://{}/ws/two", server.addr))
            .await
            .is_err());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_flooding_client_keeps_connection_alive() {
        let server = start(10).await;

        let (ws, _) = connect_async(format!("ws://{}/ws/flood", server.addr)).await.unwrap();
        let (mut write, mut read) = ws.split();
        assert_eq!(next_json(&mut read).await["type"], "connected");

        write
            .send(Message::Text(r#"{"type":"text","text":"start"}"#.into()))
            .await
            .unwrap();
        assert_eq!(next_json(&mut read).await["type"], "text_received");
        assert_eq!(next_json(&mut read).await["type"], "llm_request");

        let mut reader = tokio::spawn(async move {
            let mut seen = 0usize;
            loop {
                let message = next_json(&mut read).await;
                seen += 1;
                if message["type"] == "pong" {
                    return seen;
                }
            }
        });

        for i in 0..3000 {
            write
                .send(Message::Text(format!(r#"{{"type":"text","text":"flood {i}"}}"#)))
                .await
                .unwrap();
        }

        // a pong may be shed while the outbound queue is full, so keep asking
        let seen = tokio::time::timeout(Duration::from_secs(20), async {
            loop {
                write
                    .send(Message::Text(r#"{"type":"ping"}"#.into()))
                    .await
                    .unwrap();
                tokio::select! {
                    seen = &mut reader => return seen.unwrap(),
                    () = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
            }
        })
        .await
        .expect("connection stopped answering");

        assert!(seen > 1, "flood should have produced busy replies");
        server.stop().await;
    }
}
