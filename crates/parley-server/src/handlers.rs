//! Connection handlers for the Parley server.
//!
//! This module owns the WebSocket boundary: it upgrades connections, feeds
//! their frames into the lifecycle manager, drains their mailboxes onto the
//! socket, and coordinates graceful shutdown.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parley_core::{ConnectionId, Handled, Lifecycle, Mailbox, Registry, Session};
use parley_protocol::events::{self, fields};
use parley_protocol::{codec, Encoded, Envelope, Format, ProtocolError, PROTOCOL_VERSION};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

/// How often shutdown checks whether every session has closed.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Shared server state.
pub struct AppState {
    /// Session lifecycle, registry and router.
    pub lifecycle: Lifecycle,
    /// Server configuration.
    pub config: Config,
    /// Cancelled when the server starts shutting down.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config, shutdown: CancellationToken) -> Self {
        Self {
            lifecycle: Lifecycle::new(Arc::new(Registry::new())),
            config,
            shutdown,
        }
    }
}

/// Build the HTTP router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();

    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Run the relay until an interrupt signal arrives.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        signal_token.cancel();
    });

    serve(listener, Arc::new(AppState::new(config, shutdown))).await
}

/// Serve connections on `listener` until `state.shutdown` is cancelled, then
/// wait for open sessions to tear down.
///
/// # Errors
///
/// Returns an error if the listener fails.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    let addr = listener.local_addr()?;
    let app = build_router(Arc::clone(&state));

    info!("Parley relay listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, state.config.transport.websocket_path
    );
    warn!("CORS is fully permissive; restrict origins before exposing this relay publicly");

    let token = state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;

    // The listener is closed. Sessions watch the same token and close
    // themselves; wait for their cleanup to run.
    let drain_timeout = state.config.shutdown.drain_timeout();
    let drained = async {
        while state.lifecycle.session_count() > 0 {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    };
    if tokio::time::timeout(drain_timeout, drained).await.is_err() {
        warn!(
            sessions = state.lifecycle.session_count(),
            "Drain timeout elapsed with sessions still open"
        );
    }

    info!("Parley relay stopped");
    Ok(())
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.lifecycle.registry().stats();

    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION,
        "sessions": state.lifecycle.session_count(),
        "registeredUsers": stats.registered_users,
        "boundConnections": stats.bound_connections,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    if state.shutdown.is_cancelled() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Shutting down").into_response();
    }

    if state.lifecycle.session_count() >= state.config.limits.max_connections {
        warn!(
            limit = state.config.limits.max_connections,
            "Rejecting connection at capacity"
        );
        metrics::record_rejected_connection();
        return (StatusCode::SERVICE_UNAVAILABLE, "Server at capacity").into_response();
    }

    let max_size = state.config.limits.max_message_size;
    ws.max_message_size(max_size)
        .max_frame_size(max_size)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

type WsSender = SplitSink<WebSocket, Message>;

/// Owns a session for the life of its socket task and tears it down on drop,
/// including when the task unwinds.
struct SessionGuard {
    state: Arc<AppState>,
    session: Session,
}

impl SessionGuard {
    fn open(state: Arc<AppState>) -> (Self, Mailbox) {
        let (session, mailbox) = state.lifecycle.open();
        (Self { state, session }, mailbox)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.state.lifecycle.close(&mut self.session);
        metrics::set_registered_users(self.state.lifecycle.registry().len());
    }
}

/// Handle a WebSocket connection from accept to teardown.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (mut guard, mut mailbox) = SessionGuard::open(Arc::clone(&state));
    let session = &mut guard.session;
    let connection_id = session.id().clone();
    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    // Replies follow the format of the most recent inbound frame.
    let mut format = Format::Json;

    let connected = Envelope::new(
        events::CONNECTED,
        json!({
            (fields::CONNECTION_ID): connection_id.as_str(),
            (fields::VERSION): PROTOCOL_VERSION,
        }),
    );
    if send_envelope(&mut sender, format, &connected).await.is_err() {
        error!(connection = %connection_id, "Failed to send connected event");
        return;
    }

    let heartbeat = &state.config.heartbeat;
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + heartbeat.interval(),
        heartbeat.interval(),
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            biased;

            _ = state.shutdown.cancelled() => {
                debug!(connection = %connection_id, "Closing for shutdown");
                let _ = sender.send(Message::Close(None)).await;
                break;
            }

            // Events routed to this session by other sessions
            Some(envelope) = mailbox.recv() => {
                if send_envelope(&mut sender, format, &envelope).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        format = Format::Json;
                        metrics::record_bytes(text.len(), "inbound");

                        match codec::decode_json(&text) {
                            Ok(envelope) => {
                                if dispatch(&state, session, &mut sender, format, envelope).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(connection = %connection_id, error = %e, "Dropping undecodable text frame");
                                metrics::record_error("decode");
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        last_seen = Instant::now();
                        format = Format::MessagePack;
                        metrics::record_bytes(data.len(), "inbound");

                        let mut failed = false;
                        for envelope in decode_binary(&connection_id, &data) {
                            if dispatch(&state, session, &mut sender, format, envelope).await.is_err() {
                                failed = true;
                                break;
                            }
                        }
                        if failed {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        // Pings are answered by the WebSocket layer.
                        last_seen = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                if last_seen.elapsed() > heartbeat.timeout() {
                    warn!(connection = %connection_id, "Heartbeat timeout");
                    metrics::record_error("heartbeat_timeout");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Decode the MessagePack frames carried by one binary message.
///
/// A message holds whole frames only; nothing carries over to the next
/// message. Undecodable frames are logged and skipped. A truncated or
/// oversized frame ends the batch, since the frames after it cannot be
/// located.
fn decode_binary(connection_id: &ConnectionId, data: &[u8]) -> Vec<Envelope> {
    let mut buf = BytesMut::from(data);
    let mut envelopes = Vec::new();

    loop {
        match codec::decode_from(&mut buf) {
            Ok(Some(envelope)) => envelopes.push(envelope),
            Ok(None) => {
                if !buf.is_empty() {
                    warn!(connection = %connection_id, trailing = buf.len(), "Dropping truncated binary frame");
                    metrics::record_error("decode");
                }
                break;
            }
            Err(e @ ProtocolError::FrameTooLarge(_)) => {
                warn!(connection = %connection_id, error = %e, "Dropping rest of binary message");
                metrics::record_error("decode");
                break;
            }
            Err(e) => {
                warn!(connection = %connection_id, error = %e, "Dropping undecodable binary frame");
                metrics::record_error("decode");
            }
        }
    }

    envelopes
}

/// Hand one decoded envelope to the lifecycle manager and send any reply.
///
/// Only a failed socket write is an error; everything else is handled and
/// logged here so one bad event never ends the session.
async fn dispatch(
    state: &AppState,
    session: &mut Session,
    sender: &mut WsSender,
    format: Format,
    envelope: Envelope,
) -> Result<()> {
    let start = Instant::now();
    let event = envelope.event.clone();

    let handled = state.lifecycle.handle(session, envelope);

    let event_label = match handled {
        Handled::Unknown => "unknown",
        _ => event.as_str(),
    };
    metrics::record_event(event_label, handled.label());

    if matches!(handled, Handled::Registered { .. }) {
        metrics::record_registration();
        metrics::set_registered_users(state.lifecycle.registry().len());
    }

    if let Some(reply) = handled.into_reply() {
        send_envelope(sender, format, &reply).await?;
    }

    metrics::record_latency(start.elapsed().as_secs_f64());
    Ok(())
}

/// Send an envelope to the WebSocket.
///
/// An envelope that cannot be encoded is logged and skipped.
async fn send_envelope(sender: &mut WsSender, format: Format, envelope: &Envelope) -> Result<()> {
    let encoded = match codec::encode_as(format, envelope) {
        Ok(encoded) => encoded,
        Err(e) => {
            warn!(event = %envelope.event, error = %e, "Failed to encode envelope");
            metrics::record_error("encode");
            return Ok(());
        }
    };

    metrics::record_bytes(encoded.len(), "outbound");
    let message = match encoded {
        Encoded::Text(text) => Message::Text(text),
        Encoded::Binary(data) => Message::Binary(data.to_vec()),
    };

    sender.send(message).await?;
    Ok(())
}
