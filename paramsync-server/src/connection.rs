//! The per-socket connection state machine: upgrade, authenticate, then
//! pump client frames into the session hub and hub frames back out to the
//! socket until either side closes.

use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use paramsync_core::{
    AuthFailedPayload, AuthSuccessPayload, ClientMessage, CurrentStatePayload, RawFrame,
    ServerMessage, User,
};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::http::AppState;

/// Transport-level keep-alive interval. A missed pong inside one interval
/// closes the connection (spec: "20s ping/pong; timeout on pong closes").
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

pub async fn upgrade(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, state))
}

/// Default color assigned when a client doesn't request one: violet for
/// anonymous users, cyan for authenticated ones.
fn default_color(anonymous: bool) -> &'static str {
    if anonymous {
        "#8b5cf6"
    } else {
        "#06b6d4"
    }
}

async fn handle_socket(socket: WebSocket, session_id: String, state: AppState) {
    let hub = state.hubs.get_or_create(&session_id).await;
    let (mut sink, mut stream) = socket.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let (ping_tx, mut ping_rx) = mpsc::unbounded_channel::<()>();
    let Some(conn_id) = hub.join(out_tx).await else {
        warn!(session_id = %session_id, "hub unavailable, dropping connection");
        return;
    };
    info!(session_id = %session_id, conn_id, "websocket connected");

    let forward_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = out_rx.recv() => {
                    let Some(frame) = frame else { break };
                    if sink.send(WsMessage::Text(frame.to_string().into())).await.is_err() {
                        break;
                    }
                }
                ping = ping_rx.recv() => {
                    if ping.is_none() {
                        break;
                    }
                    if sink.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut authenticated = false;
    let mut awaiting_pong = false;
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = keepalive.tick() => {
                if awaiting_pong {
                    debug!(session_id = %session_id, conn_id, "keepalive timed out, closing");
                    break;
                }
                awaiting_pong = true;
                if ping_tx.send(()).is_err() {
                    break;
                }
            }
            msg = stream.next() => {
                let Some(msg) = msg else { break };
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!(session_id = %session_id, conn_id, error = %e, "websocket read error");
                        break;
                    }
                };

                let text = match msg {
                    WsMessage::Text(text) => text,
                    WsMessage::Pong(_) => {
                        awaiting_pong = false;
                        continue;
                    }
                    WsMessage::Close(_) => break,
                    _ => continue,
                };

                let raw: RawFrame = match serde_json::from_str(&text) {
                    Ok(raw) => raw,
                    Err(e) => {
                        debug!(session_id = %session_id, conn_id, error = %e, "dropped malformed frame");
                        continue;
                    }
                };

                let client_msg = match ClientMessage::parse(raw) {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!(session_id = %session_id, conn_id, error = %e, "dropped unrecognized frame");
                        continue;
                    }
                };

                match client_msg {
                    ClientMessage::Auth(req) => {
                        match state.verifier.verify(&req.token) {
                            Ok(principal) => {
                                let user = User {
                                    id: principal.user_id.clone(),
                                    name: principal.display_name.clone(),
                                    color: Some(
                                        req.color.unwrap_or_else(|| {
                                            default_color(principal.anonymous).to_string()
                                        }),
                                    ),
                                    avatar: None,
                                };

                                let Some(snapshot) = hub.authenticate(conn_id, user.clone()).await else {
                                    break;
                                };
                                authenticated = true;

                                let payload = AuthSuccessPayload {
                                    session_id: session_id.clone(),
                                    user_id: user.id.clone(),
                                    users: snapshot.users,
                                    current_state: CurrentStatePayload {
                                        params: snapshot.state,
                                        seq: snapshot.seq,
                                    },
                                };
                                hub.unicast(conn_id, ServerMessage::AuthSuccess(payload)).await;
                            }
                            Err(_) => {
                                hub.unicast(
                                    conn_id,
                                    ServerMessage::AuthFailed(AuthFailedPayload {
                                        error: "invalid or missing authentication token".to_string(),
                                    }),
                                )
                                .await;
                                // Resolution: close the socket after one failed
                                // attempt rather than let the client retry forever.
                                break;
                            }
                        }
                    }
                    ClientMessage::ParamUpdate(update) => {
                        if authenticated {
                            hub.propose_update(conn_id, update);
                        }
                    }
                    ClientMessage::ConflictResolved(req) => {
                        if authenticated {
                            if let Some(param) = req.param_name() {
                                hub.resolve_conflict(conn_id, param, req.resolved_value);
                            }
                        }
                    }
                    ClientMessage::Resync(_) => {
                        if let Some(payload) = hub.resync().await {
                            hub.unicast(conn_id, ServerMessage::SessionState(payload)).await;
                        }
                    }
                    ClientMessage::Ping => {
                        hub.unicast(conn_id, ServerMessage::Pong).await;
                    }
                }
            }
        }
    }

    hub.leave(conn_id);
    forward_task.abort();
    info!(session_id = %session_id, conn_id, "websocket disconnected");
}
