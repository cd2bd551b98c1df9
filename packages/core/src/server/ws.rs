//! WebSocket Endpoint
//!
//! Bridges one socket to the tenant's sync hub. The hub owns ordering and
//! back-pressure; this task owns the wire: it forwards queued frames out,
//! parses client frames in, and runs the heartbeat.
//!
//! Heartbeats are protocol-level pings every 30 seconds; three unanswered
//! pings close the connection as half-open. The JSON `ping`/`pong` frames
//! are separate and client-initiated.

use crate::server::handlers::ApiError;
use crate::server::AppState;
use crate::sync::frames::{ClientFrame, ServerFrame};
use crate::sync::hub::{CloseReason, ConnectionId};
use crate::tenant::TenantHandle;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// `GET /{tenant}/ws`
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let handle = state.registry.tenant(&tenant).await?;
    // Registration is refused while the tenant is over its memory cap
    let (id, receiver) = handle.connect().await?;
    let config = state.registry.config().clone();

    Ok(upgrade.on_upgrade(move |socket| {
        run_connection(
            handle,
            id,
            receiver,
            socket,
            config.heartbeat_interval,
            config.max_missed_pongs,
        )
    }))
}

async fn run_connection(
    handle: Arc<TenantHandle>,
    id: ConnectionId,
    mut outbound: mpsc::Receiver<ServerFrame>,
    socket: WebSocket,
    heartbeat_interval: std::time::Duration,
    max_missed_pongs: u8,
) {
    let (mut sink, mut stream) = socket.split();
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // Swallow the interval's immediate first tick so the first ping goes
    // out one full period after the upgrade
    heartbeat.tick().await;
    let mut missed_pongs: u8 = 0;

    let reason = loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    // The hub dropped the sender (slow consumer or idle
                    // eviction); say goodbye and stop
                    break CloseReason::ServerShutdown;
                };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(connection = %id, "frame serialization failed: {e}");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break CloseReason::ClientDisconnected;
                }
            }

            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(frame) => dispatch(&handle, id, frame).await,
                            Err(e) => {
                                debug!(connection = %id, "unparseable frame: {e}");
                                let error = ServerFrame::Error {
                                    message: "unparseable frame".to_string(),
                                };
                                if let Ok(text) = serde_json::to_string(&error) {
                                    let _ = sink.send(Message::Text(text)).await;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break CloseReason::ClientDisconnected;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        missed_pongs = 0;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break CloseReason::ClientDisconnected;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(connection = %id, "socket error: {e}");
                        break CloseReason::ClientDisconnected;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if missed_pongs >= max_missed_pongs {
                    debug!(connection = %id, "heartbeat lost; closing half-open socket");
                    break CloseReason::IdleEvicted;
                }
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break CloseReason::ClientDisconnected;
                }
                missed_pongs += 1;
            }
        }
    };

    let _ = sink.send(Message::Close(None)).await;
    handle.disconnect(id, reason).await;
    debug!(connection = %id, ?reason, "socket task ended");
}

async fn dispatch(handle: &Arc<TenantHandle>, id: ConnectionId, frame: ClientFrame) {
    match frame {
        ClientFrame::Version { version } => {
            handle.handshake(id, version).await;
        }
        ClientFrame::Mutate { op, client_id } => {
            handle.client_mutate(id, op, client_id).await;
        }
        ClientFrame::Ping => {
            handle.client_ping(id).await;
        }
    }
}
