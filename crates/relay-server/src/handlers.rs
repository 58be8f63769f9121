//! Connection handlers for the relay server.
//!
//! This module composes the registry, the broadcast engine and one session
//! handler per WebSocket connection behind an axum router.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard, MeteredSink, MeteredStream};
use crate::shutdown;
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocket, ConnectInfo, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Router,
};
use relay_core::{BroadcastEngine, ClientRegistry, SessionHandler};
use relay_transport::websocket::{self, WebSocketConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Shared server state.
pub struct AppState {
    /// Sessions currently connected.
    pub registry: Arc<ClientRegistry>,
    /// Fan-out engine over `registry`.
    pub engine: BroadcastEngine,
    /// Server configuration.
    pub config: Config,
    /// Root cancellation token; every session runs under a child of it.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config, shutdown: CancellationToken) -> Self {
        let registry = Arc::new(ClientRegistry::new());
        Self {
            engine: BroadcastEngine::new(Arc::clone(&registry)),
            registry,
            config,
            shutdown,
        }
    }

    fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig {
            max_message_size: self.config.limits.max_message_size,
            wire_format: self.config.transport.wire_format,
        }
    }
}

/// Run the HTTP/WebSocket server until a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to listen on {}", addr))?;

    let token = CancellationToken::new();
    tokio::spawn(shutdown::cancel_on_signal(token.clone()));

    serve(listener, Arc::new(AppState::new(config, token))).await
}

/// Serve on an already bound listener until `state.shutdown` is cancelled,
/// then wait for sessions to drain.
///
/// # Errors
///
/// Returns an error if the listener fails.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    let addr = listener.local_addr()?;
    let app = Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::clone(&state));

    info!("Relay server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, state.config.transport.websocket_path
    );

    let token = state.shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { token.cancelled().await })
    .await?;

    shutdown::drain(&state.registry, state.config.shutdown_timeout()).await;
    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.registry.count(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, addr, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, addr: SocketAddr, state: Arc<AppState>) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection = websocket::accept(socket, &state.websocket_config())
        .with_remote_addr(addr.to_string())
        .map_sink(MeteredSink::wrap)
        .map_stream(MeteredStream::wrap);
    let id = connection.id().clone();
    let sink = Arc::clone(connection.sink());

    debug!(
        connection = %id,
        remote = connection.remote_addr().unwrap_or("unknown"),
        "WebSocket connected"
    );

    let handler = SessionHandler::new(
        connection,
        state.engine.clone(),
        state.shutdown.child_token(),
    );
    let result = handler.run().await;
    metrics::record_session_closed(&result);

    if let Err(e) = sink.close().await {
        debug!(connection = %id, error = %e, "Close after session end failed");
    }

    debug!(connection = %id, reason = metrics::close_reason(&result), "WebSocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use futures_util::{SinkExt, StreamExt};
    use relay_protocol::{codec, ChatMessage, WireFormat};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start(config: Config) -> (SocketAddr, Arc<AppState>, JoinHandle<Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(AppState::new(config, CancellationToken::new()));
        let server = tokio::spawn(serve(listener, Arc::clone(&state)));
        (addr, state, server)
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (client, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        client
    }

    async fn wait_for_count(registry: &ClientRegistry, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.count() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("registry never reached expected count");
    }

    async fn next_message(client: &mut Client) -> ChatMessage {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("stream ended")
                .unwrap();
            match frame {
                Message::Binary(data) => return codec::decode(&data).unwrap(),
                Message::Text(text) => return codec::decode_json(&text).unwrap(),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_three_clients_receive_broadcast() {
        let (addr, state, server) = start(Config::default()).await;

        let mut alice = connect(addr).await;
        let mut bob = connect(addr).await;
        let mut carol = connect(addr).await;
        wait_for_count(&state.registry, 3).await;

        let hi = ChatMessage::new("alice", "hi");
        alice
            .send(Message::Binary(codec::encode(&hi).unwrap().to_vec()))
            .await
            .unwrap();

        assert_eq!(next_message(&mut alice).await, hi);
        assert_eq!(next_message(&mut bob).await, hi);
        assert_eq!(next_message(&mut carol).await, hi);

        state.shutdown.cancel();
        server.await.unwrap().unwrap();
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn test_json_wire_format() {
        let mut config = Config::default();
        config.transport.wire_format = WireFormat::Json;
        let (addr, state, server) = start(config).await;

        let mut alice = connect(addr).await;
        let mut bob = connect(addr).await;
        wait_for_count(&state.registry, 2).await;

        alice
            .send(Message::Text(
                r#"{"sender":"alice","message":"hi"}"#.to_string(),
            ))
            .await
            .unwrap();

        match tokio::time::timeout(Duration::from_secs(5), bob.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                assert_eq!(codec::decode_json(&text).unwrap(), ChatMessage::new("alice", "hi"));
            }
            other => panic!("expected a text frame, got {:?}", other),
        }
        assert_eq!(next_message(&mut alice).await.message, "hi");

        state.shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_client_close_deregisters() {
        let (addr, state, server) = start(Config::default()).await;

        let mut alice = connect(addr).await;
        let mut bob = connect(addr).await;
        wait_for_count(&state.registry, 2).await;

        bob.close(None).await.unwrap();
        wait_for_count(&state.registry, 1).await;

        let ping = ChatMessage::new("alice", "anyone?");
        alice
            .send(Message::Binary(codec::encode(&ping).unwrap().to_vec()))
            .await
            .unwrap();
        assert_eq!(next_message(&mut alice).await, ping);
        assert_eq!(state.registry.count(), 1);

        state.shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_only_sender() {
        let (addr, state, server) = start(Config::default()).await;

        let mut alice = connect(addr).await;
        let mut bob = connect(addr).await;
        wait_for_count(&state.registry, 2).await;

        bob.send(Message::Text("not json".to_string())).await.unwrap();
        wait_for_count(&state.registry, 1).await;

        let hi = ChatMessage::new("alice", "hi");
        alice
            .send(Message::Binary(codec::encode(&hi).unwrap().to_vec()))
            .await
            .unwrap();
        assert_eq!(next_message(&mut alice).await, hi);

        state.shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    async fn send_binary(client: &mut Client, data: &[u8]) {
        client.send(Message::Binary(data.to_vec())).await.unwrap();
    }

    #[tokio::test]
    async fn test_message_split_across_frames_respects_size_limit() {
        let mut config = Config::default();
        config.limits.max_message_size = 1024;
        let (addr, state, server) = start(config).await;

        let mut alice = connect(addr).await;
        let mut bob = connect(addr).await;
        wait_for_count(&state.registry, 2).await;

        // Every frame is under the limit; the message they carry is not.
        let big = codec::encode(&ChatMessage::new("alice", "x".repeat(8000))).unwrap();
        for chunk in big.chunks(1000) {
            if alice.send(Message::Binary(chunk.to_vec())).await.is_err() {
                break;
            }
        }
        wait_for_count(&state.registry, 1).await;

        // Bob never saw the oversized message.
        let small = ChatMessage::new("bob", "still here");
        send_binary(&mut bob, &codec::encode(&small).unwrap()).await;
        assert_eq!(next_message(&mut bob).await, small);

        state.shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_only_sender() {
        let mut config = Config::default();
        config.limits.max_message_size = 1024;
        let (addr, state, server) = start(config).await;

        let mut alice = connect(addr).await;
        let mut bob = connect(addr).await;
        wait_for_count(&state.registry, 2).await;

        let big = codec::encode(&ChatMessage::new("bob", "x".repeat(2000))).unwrap();
        let _ = bob.send(Message::Binary(big.to_vec())).await;
        wait_for_count(&state.registry, 1).await;

        let hi = ChatMessage::new("alice", "hi");
        send_binary(&mut alice, &codec::encode(&hi).unwrap()).await;
        assert_eq!(next_message(&mut alice).await, hi);

        state.shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_frame_with_two_messages_broadcasts_both() {
        let (addr, state, server) = start(Config::default()).await;

        let mut alice = connect(addr).await;
        let mut bob = connect(addr).await;
        wait_for_count(&state.registry, 2).await;

        let first = ChatMessage::new("alice", "one");
        let second = ChatMessage::new("alice", "two");
        let mut frame = BytesMut::new();
        codec::encode_into(&first, &mut frame).unwrap();
        codec::encode_into(&second, &mut frame).unwrap();
        send_binary(&mut alice, &frame).await;

        assert_eq!(next_message(&mut bob).await, first);
        assert_eq!(next_message(&mut bob).await, second);
        assert_eq!(next_message(&mut alice).await, first);
        assert_eq!(next_message(&mut alice).await, second);

        state.shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_ping_keeps_session_open() {
        let (addr, state, server) = start(Config::default()).await;

        let mut alice = connect(addr).await;
        let mut bob = connect(addr).await;
        wait_for_count(&state.registry, 2).await;

        alice.send(Message::Ping(vec![1, 2, 3])).await.unwrap();
        let hi = ChatMessage::new("alice", "hi");
        send_binary(&mut alice, &codec::encode(&hi).unwrap()).await;

        assert_eq!(next_message(&mut bob).await, hi);
        assert_eq!(next_message(&mut alice).await, hi);
        assert_eq!(state.registry.count(), 2);

        state.shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_health_reports_connections() {
        let (addr, state, server) = start(Config::default()).await;
        let _alice = connect(addr).await;
        wait_for_count(&state.registry, 1).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        let body = response.split("\r\n\r\n").nth(1).unwrap();
        let health: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["connections"], 1);

        state.shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
