//! Connection handlers for Parley server.
//!
//! This module handles the WebSocket upgrade, the per-connection task and
//! inbound frame dispatch.

use crate::api::{self, bearer_token, error_response};
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parley_core::{
    ConnectionHandle, ConnectionId, Hub, JwtVerifier, LifecycleEvent, MemoryArchive,
    MessageArchive, Outgoing, Session, SignalKind,
};
use parley_protocol::{
    codec, codes, DeliveryStatus, Encoding, Frame, ProtocolError, PROTOCOL_VERSION,
};
use serde::Deserialize;
use std::borrow::Cow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Presence, lifecycle, routing and relay.
    pub hub: Hub,
    /// Message history, when enabled.
    pub archive: Option<Arc<dyn MessageArchive>>,
    /// Server configuration.
    pub config: Config,
    connections: Arc<AtomicUsize>,
}

impl AppState {
    /// Create new app state.
    ///
    /// # Errors
    ///
    /// Returns an error if no JWT secret is configured.
    pub fn new(config: Config) -> Result<Self> {
        let verifier = JwtVerifier::new(config.jwt_secret()?.as_bytes())
            .with_leeway(Duration::from_secs(config.auth.leeway_secs));

        let archive = config.archive.enabled.then(|| {
            Arc::new(MemoryArchive::new(config.archive.capacity)) as Arc<dyn MessageArchive>
        });

        Ok(Self {
            hub: Hub::with_config(Arc::new(verifier), config.hub_config()),
            archive,
            config,
            connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Number of open WebSocket connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }
}

/// A reserved connection slot, released on drop.
struct ConnectionSlot(Arc<AtomicUsize>);

impl ConnectionSlot {
    fn acquire(state: &AppState) -> Option<Self> {
        let max = state.config.limits.max_connections;
        state
            .connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()
            .map(|_| Self(Arc::clone(&state.connections)))
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Build the HTTP router.
pub fn build_app(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();

    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/presence", get(api::presence_handler))
        .route("/api/messages/:peer", get(api::history_handler))
        .layer(cors_layer(&state.config.transport.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// CORS for browser clients served from another origin.
///
/// An empty origin list allows any origin without credentials.
fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    debug!(origins = ?allowed, "Configured CORS origins");

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone())?);

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Parley server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, build_app(state)).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION.to_string(),
        "online": state.hub.registry().len(),
    }))
}

/// Query parameters accepted on the WebSocket endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Bearer token, for clients that cannot set headers.
    pub token: Option<String>,
    /// Frame encoding for this connection.
    pub encoding: Option<Encoding>,
    /// Protocol major version the client speaks.
    pub version: Option<u8>,
}

/// WebSocket upgrade handler.
///
/// Everything that can refuse the connection happens here, before the
/// upgrade and before the registry is touched.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
) -> Response {
    if let Some(version) = params.version {
        if !PROTOCOL_VERSION.accepts_major(version) {
            metrics::record_rejection("version");
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("Unsupported protocol version {version}, server speaks {PROTOCOL_VERSION}"),
            );
        }
    }

    let Some(slot) = ConnectionSlot::acquire(&state) else {
        warn!("Connection limit reached");
        metrics::record_rejection("capacity");
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Connection limit reached");
    };

    let credential = bearer_token(&headers).or(params.token.as_deref());
    let mut session = state.hub.session();
    if let Err(e) = session.authenticate(credential) {
        metrics::record_rejection("auth");
        return error_response(StatusCode::UNAUTHORIZED, e.to_string());
    }

    let encoding = params
        .encoding
        .unwrap_or(state.config.transport.default_encoding);

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, session, encoding, slot))
}

/// Failure to write a frame to the socket.
#[derive(Debug, Error)]
enum SendError {
    #[error(transparent)]
    Encode(#[from] ProtocolError),

    #[error("WebSocket error: {0}")]
    Socket(#[from] axum::Error),

    #[error("Write timed out")]
    Timeout,
}

/// The write half of a connection, encoding frames as negotiated.
struct FrameSink {
    sink: SplitSink<WebSocket, WsMessage>,
    encoding: Encoding,
    timeout: Duration,
}

impl FrameSink {
    async fn send(&mut self, frame: &Frame) -> Result<(), SendError> {
        let message = match self.encoding {
            Encoding::Msgpack => WsMessage::Binary(codec::encode(frame)?.to_vec()),
            Encoding::Json => WsMessage::Text(codec::encode_json(frame)?),
        };
        self.write(message).await
    }

    async fn write(&mut self, message: WsMessage) -> Result<(), SendError> {
        tokio::time::timeout(self.timeout, self.sink.send(message))
            .await
            .map_err(|_| SendError::Timeout)??;
        Ok(())
    }

    /// Send an application close frame. Errors are irrelevant at this point.
    async fn close(&mut self, code: u16) {
        let frame = CloseFrame {
            code,
            reason: Cow::Borrowed(codes::close_reason(code)),
        };
        let _ = self.write(WsMessage::Close(Some(frame))).await;
    }
}

/// Handle a WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    mut session: Session,
    encoding: Encoding,
    _slot: ConnectionSlot,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let mut outbound = match session.activate() {
        Ok(outbound) => outbound,
        Err(e) => {
            error!(error = %e, "Failed to activate session");
            return;
        }
    };
    let Some(handle) = session.handle().cloned() else {
        return;
    };
    metrics::set_online_users(state.hub.registry().len());

    let connection = handle.id();
    debug!(connection = %connection, user = %handle.user(), ?encoding, "WebSocket connected");

    let (sink, mut receiver) = socket.split();
    let mut sink = FrameSink {
        sink,
        encoding,
        timeout: state.config.send_timeout(),
    };

    let heartbeat = &state.config.heartbeat;
    let connected = Frame::connected(
        connection.to_string(),
        handle.user().as_str(),
        PROTOCOL_VERSION.major,
        heartbeat.interval_ms as u32,
    );
    if let Err(e) = sink.send(&connected).await {
        error!(connection = %connection, error = %e, "Failed to send Connected frame");
        finish(&state, session, LifecycleEvent::TransportError);
        return;
    }

    let heartbeat_timeout = Duration::from_millis(heartbeat.timeout_ms);
    let mut ticker = tokio::time::interval(Duration::from_millis(
        heartbeat.interval_ms.min(heartbeat.timeout_ms).max(10),
    ));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();

    // Read buffer for partial binary frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    let cause = loop {
        tokio::select! {
            biased;

            out = outbound.next() => match out {
                Outgoing::Frame(frame) => {
                    if let Err(e) = sink.send(&frame).await {
                        warn!(connection = %connection, error = %e, "Write failed");
                        metrics::record_error("send");
                        break LifecycleEvent::TransportError;
                    }
                }
                Outgoing::Close(reason) => {
                    let code = reason.code();
                    info!(connection = %connection, ?reason, "Closing connection");
                    let _ = sink.send(&Frame::error(code, codes::close_reason(code))).await;
                    sink.close(code).await;
                    break LifecycleEvent::from(reason);
                }
            },

            _ = ticker.tick() => {
                if last_seen.elapsed() >= heartbeat_timeout {
                    info!(connection = %connection, "Heartbeat timeout");
                    sink.close(codes::HEARTBEAT_TIMEOUT).await;
                    break LifecycleEvent::TransportError;
                }
            }

            msg = receiver.next() => {
                last_seen = Instant::now();
                match msg {
                    Some(Ok(WsMessage::Binary(data))) => {
                        let start = Instant::now();
                        read_buffer.extend_from_slice(&data);

                        loop {
                            match codec::decode_from(&mut read_buffer) {
                                Ok(Some(frame)) => {
                                    if let Err(e) = handle_frame(frame, &handle, &state, &mut sink).await {
                                        warn!(connection = %connection, error = %e, "Frame handling error");
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    read_buffer.clear();
                                    reject_frame(&mut sink, connection, &e).await;
                                    break;
                                }
                            }
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(WsMessage::Text(text))) => {
                        let start = Instant::now();
                        match codec::decode_json(&text) {
                            Ok(frame) => {
                                if let Err(e) = handle_frame(frame, &handle, &state, &mut sink).await {
                                    warn!(connection = %connection, error = %e, "Frame handling error");
                                }
                            }
                            Err(e) => reject_frame(&mut sink, connection, &e).await,
                        }
                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if sink.write(WsMessage::Pong(data)).await.is_err() {
                            break LifecycleEvent::TransportError;
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => {}
                    Some(Ok(WsMessage::Close(_))) => {
                        debug!(connection = %connection, "Received close frame");
                        break LifecycleEvent::Disconnected;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break LifecycleEvent::TransportError;
                    }
                    None => {
                        debug!(connection = %connection, "WebSocket stream ended");
                        break LifecycleEvent::Disconnected;
                    }
                }
            }
        }
    };

    finish(&state, session, cause);
    debug!(connection = %connection, ?cause, "WebSocket disconnected");
}

/// Close the session and publish the resulting counts.
fn finish(state: &AppState, mut session: Session, cause: LifecycleEvent) {
    if let Err(e) = session.close(cause) {
        debug!(error = %e, "Session already closed");
    }
    let stats = state.hub.stats();
    metrics::set_online_users(stats.online_users);
    metrics::set_evictions(stats.lifecycle.evictions);
}

async fn reject_frame(sink: &mut FrameSink, connection: ConnectionId, e: &ProtocolError) {
    debug!(connection = %connection, error = %e, "Invalid frame");
    metrics::record_error("decode");
    let _ = sink
        .send(&Frame::error(codes::INVALID_FRAME, e.to_string()))
        .await;
}

/// Handle a decoded frame.
async fn handle_frame(
    frame: Frame,
    handle: &Arc<ConnectionHandle>,
    state: &AppState,
    sink: &mut FrameSink,
) -> Result<(), SendError> {
    if !frame.is_client_frame() {
        warn!(connection = %handle.id(), frame_type = ?frame.frame_type(), "Unexpected frame type");
        sink.send(&Frame::error(
            codes::UNEXPECTED_FRAME,
            format!("Clients may not send {:?} frames", frame.frame_type()),
        ))
        .await?;
        return Ok(());
    }

    match frame {
        Frame::SendMessage { id, to, content } => {
            match state.hub.router().route(handle, &to, &content, id) {
                Ok(routed) => {
                    metrics::record_message(routed.message.status);
                    if let Some(archive) = &state.archive {
                        if let Err(e) = archive.append(&routed.message).await {
                            warn!(user = %handle.user(), error = %e, "Failed to archive message");
                            metrics::record_error("archive");
                        }
                    }
                }
                Err(_) => metrics::record_message(DeliveryStatus::Error),
            }
            metrics::set_evictions(state.hub.stats().lifecycle.evictions);
        }

        Frame::Typing { to } => {
            let relayed = state
                .hub
                .relay()
                .relay(handle.user(), &to, SignalKind::Typing);
            metrics::record_signal(relayed);
        }

        Frame::Ping { timestamp } => {
            sink.send(&Frame::pong(timestamp)).await?;
        }

        // Pong
        _ => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::UserId;
    use std::net::SocketAddr;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::{self, Message as ClientMessage};
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
    use tower::ServiceExt;

    const SECRET: &str = "e2e-secret";

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.host = "127.0.0.1".into();
        config.port = 0;
        config.auth.jwt_secret = Some(SECRET.into());
        config.metrics.enabled = false;
        config
    }

    async fn spawn_server(config: Config) -> (SocketAddr, Arc<AppState>) {
        let state = Arc::new(AppState::new(config).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_app(Arc::clone(&state));
        tokio::spawn(async move { axum::serve(listener, app).await });
        (addr, state)
    }

    fn token(user: &str) -> String {
        JwtVerifier::new(SECRET.as_bytes())
            .issue(&UserId::new(user), Duration::from_secs(60))
            .unwrap()
    }

    async fn connect(addr: SocketAddr, user: &str) -> Client {
        let url = format!("ws://{addr}/ws?encoding=json&token={}", token(user));
        let (ws, _) = connect_async(url).await.unwrap();
        ws
    }

    async fn send(ws: &mut Client, frame: &Frame) {
        let text = codec::encode_json(frame).unwrap();
        ws.send(ClientMessage::Text(text)).await.unwrap();
    }

    async fn next_message(ws: &mut Client) -> ClientMessage {
        tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for server")
            .expect("stream ended")
            .expect("websocket error")
    }

    async fn recv(ws: &mut Client) -> Frame {
        match next_message(ws).await {
            ClientMessage::Text(text) => codec::decode_json(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    /// Connect and consume the `connected` and `online_users` frames.
    async fn join(addr: SocketAddr, user: &str) -> (Client, Vec<String>) {
        let mut ws = connect(addr, user).await;
        assert!(matches!(
            recv(&mut ws).await,
            Frame::Connected { user_id, .. } if user_id == user
        ));
        let Frame::OnlineUsers { users } = recv(&mut ws).await else {
            panic!("expected online_users");
        };
        (ws, users)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn http_status(err: tungstenite::Error) -> u16 {
        match err {
            tungstenite::Error::Http(response) => response.status().as_u16(),
            other => panic!("expected HTTP rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unauthenticated_upgrade_is_rejected() {
        let (addr, state) = spawn_server(test_config()).await;

        let err = connect_async(format!("ws://{addr}/ws?token=forged"))
            .await
            .unwrap_err();
        assert_eq!(http_status(err), 401);

        let err = connect_async(format!("ws://{addr}/ws")).await.unwrap_err();
        assert_eq!(http_status(err), 401);

        assert!(state.hub.registry().is_empty());
        assert_eq!(state.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_incompatible_version_is_rejected() {
        let (addr, _state) = spawn_server(test_config()).await;

        let url = format!("ws://{addr}/ws?version=9&token={}", token("alice"));
        assert_eq!(http_status(connect_async(url).await.unwrap_err()), 400);
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let mut config = test_config();
        config.limits.max_connections = 1;
        let (addr, _state) = spawn_server(config).await;

        let (_alice, _) = join(addr, "alice").await;
        let url = format!("ws://{addr}/ws?token={}", token("bob"));
        assert_eq!(http_status(connect_async(url).await.unwrap_err()), 503);
    }

    #[tokio::test]
    async fn test_bearer_header_and_msgpack() {
        let (addr, _state) = spawn_server(test_config()).await;

        let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
        request.headers_mut().insert(
            "authorization",
            format!("Bearer {}", token("alice")).parse().unwrap(),
        );
        let (mut ws, _) = connect_async(request).await.unwrap();

        match next_message(&mut ws).await {
            ClientMessage::Binary(data) => {
                let frame = codec::decode(&data).unwrap();
                assert!(matches!(frame, Frame::Connected { user_id, .. } if user_id == "alice"));
            }
            other => panic!("expected binary frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_chat_between_two_users() {
        let (addr, state) = spawn_server(test_config()).await;

        let (mut alice, users) = join(addr, "alice").await;
        assert_eq!(users, vec!["alice"]);

        let (mut bob, users) = join(addr, "bob").await;
        assert_eq!(users, vec!["alice", "bob"]);
        assert_eq!(recv(&mut alice).await, Frame::user_online("bob"));

        send(&mut alice, &Frame::send_message_with_id(1, "bob", "hi")).await;

        let Frame::ReceiveMessage { message: received } = recv(&mut bob).await else {
            panic!("expected receive_message");
        };
        assert_eq!(received.from, "alice");
        assert_eq!(received.content, "hi");
        assert_eq!(received.status, DeliveryStatus::Delivered);

        let Frame::MessageSent { id, message: echoed } = recv(&mut alice).await else {
            panic!("expected message_sent");
        };
        assert_eq!(id, Some(1));
        assert_eq!(echoed, received);

        // Bob leaves; Alice hears about it and later messages stay `sent`.
        bob.close(None).await.unwrap();
        assert_eq!(recv(&mut alice).await, Frame::user_offline("bob"));

        send(&mut alice, &Frame::send_message("bob", "still there?")).await;
        let Frame::MessageSent { message, .. } = recv(&mut alice).await else {
            panic!("expected message_sent");
        };
        assert_eq!(message.status, DeliveryStatus::Sent);

        // Both messages are in the history, oldest first. Archiving follows
        // the echo, so poll until the second one lands.
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            format!("Bearer {}", token("bob")).parse().unwrap(),
        );
        let mut contents = Vec::new();
        for _ in 0..100 {
            let history = api::history_handler(
                State(Arc::clone(&state)),
                axum::extract::Path("alice".to_string()),
                headers.clone(),
            )
            .await
            .unwrap();
            contents = history.0.messages.into_iter().map(|m| m.content).collect();
            if contents.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(contents, vec!["hi", "still there?"]);
    }

    #[tokio::test]
    async fn test_second_connection_supersedes_first() {
        let (addr, state) = spawn_server(test_config()).await;

        let (mut first, _) = join(addr, "alice").await;
        let (mut second, users) = join(addr, "alice").await;
        assert_eq!(users, vec!["alice"]);

        assert_eq!(
            recv(&mut first).await,
            Frame::error(codes::SUPERSEDED, codes::close_reason(codes::SUPERSEDED))
        );
        match next_message(&mut first).await {
            ClientMessage::Close(Some(frame)) => assert_eq!(u16::from(frame.code), codes::SUPERSEDED),
            other => panic!("expected close frame, got {other:?}"),
        }
        drop(first);

        // The superseded connection's exit leaves the newer route in place.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(state.hub.registry().is_online(&UserId::new("alice")));

        let (mut bob, _) = join(addr, "bob").await;
        assert_eq!(recv(&mut second).await, Frame::user_online("bob"));

        send(&mut bob, &Frame::send_message("alice", "which one?")).await;
        assert!(matches!(recv(&mut second).await, Frame::ReceiveMessage { .. }));
    }

    #[tokio::test]
    async fn test_typing_is_relayed_or_dropped() {
        let (addr, _state) = spawn_server(test_config()).await;

        let (mut alice, _) = join(addr, "alice").await;
        let (mut bob, _) = join(addr, "bob").await;
        recv(&mut alice).await; // user_online(bob)

        send(&mut alice, &Frame::typing("bob")).await;
        assert_eq!(recv(&mut bob).await, Frame::user_typing("alice"));

        // Nobody named carol: silently dropped, nothing comes back.
        send(&mut alice, &Frame::typing("carol")).await;
        send(&mut alice, &Frame::ping_with_timestamp(42)).await;
        assert_eq!(recv(&mut alice).await, Frame::pong(Some(42)));
    }

    #[tokio::test]
    async fn test_bad_frames_keep_connection_open() {
        let (addr, _state) = spawn_server(test_config()).await;
        let (mut alice, _) = join(addr, "alice").await;

        alice
            .send(ClientMessage::Text("{not json".into()))
            .await
            .unwrap();
        assert!(matches!(
            recv(&mut alice).await,
            Frame::Error { code, .. } if code == codes::INVALID_FRAME
        ));

        send(&mut alice, &Frame::user_online("mallory")).await;
        assert!(matches!(
            recv(&mut alice).await,
            Frame::Error { code, .. } if code == codes::UNEXPECTED_FRAME
        ));

        send(&mut alice, &Frame::send_message("", "hi")).await;
        assert!(matches!(recv(&mut alice).await, Frame::MessageError { .. }));

        send(&mut alice, &Frame::ping()).await;
        assert!(matches!(recv(&mut alice).await, Frame::Pong { .. }));
    }

    #[tokio::test]
    async fn test_heartbeat_timeout_closes_connection() {
        let mut config = test_config();
        config.heartbeat.interval_ms = 20;
        config.heartbeat.timeout_ms = 100;
        let (addr, state) = spawn_server(config).await;

        let (mut alice, _) = join(addr, "alice").await;

        match next_message(&mut alice).await {
            ClientMessage::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), codes::HEARTBEAT_TIMEOUT);
            }
            other => panic!("expected close frame, got {other:?}"),
        }

        let registry = Arc::clone(state.hub.registry());
        wait_until(|| registry.is_empty()).await;
    }

    #[tokio::test]
    async fn test_presence_endpoint() {
        let (addr, state) = spawn_server(test_config()).await;
        let (_alice, _) = join(addr, "alice").await;

        let mut headers = HeaderMap::new();
        let denied = api::presence_handler(State(Arc::clone(&state)), headers.clone()).await;
        assert!(denied.is_err());

        headers.insert(
            "authorization",
            format!("Bearer {}", token("bob")).parse().unwrap(),
        );
        let presence = api::presence_handler(State(state), headers).await.unwrap();
        assert_eq!(presence.0.users, vec!["alice"]);
        assert_eq!(presence.0.count, 1);
    }

    async fn preflight(app: Router, origin: &str) -> Response {
        let request = axum::http::Request::builder()
            .method(Method::OPTIONS)
            .uri("/api/messages/alice")
            .header(header::ORIGIN, origin)
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
            .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "authorization")
            .body(axum::body::Body::empty())
            .unwrap();
        app.oneshot(request).await.unwrap()
    }

    #[tokio::test]
    async fn test_cors_preflight_for_configured_origin() {
        let state = Arc::new(AppState::new(test_config()).unwrap());

        let allowed = preflight(build_app(Arc::clone(&state)), "http://localhost:3000").await;
        assert!(allowed.status().is_success());
        let headers = allowed.headers();
        assert_eq!(
            headers[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://localhost:3000"
        );
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
        assert!(headers[header::ACCESS_CONTROL_ALLOW_HEADERS]
            .to_str()
            .unwrap()
            .contains("authorization"));

        let foreign = preflight(build_app(state), "https://evil.example").await;
        assert!(foreign
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .is_none());
    }

    #[tokio::test]
    async fn test_cors_any_origin_when_unconfigured() {
        let mut config = test_config();
        config.transport.cors_origins.clear();
        let state = Arc::new(AppState::new(config).unwrap());

        let response = preflight(build_app(state), "https://anywhere.example").await;
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }
}
