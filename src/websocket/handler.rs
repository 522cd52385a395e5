use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use axum_extra::extract::CookieJar;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};

use super::connection::Connection;
use super::events::{is_signaling_event, Envelope};
use super::router::route_message;
use crate::{
    auth::{validate_token, TokenType},
    state::AppState,
};

/// Deadline for a single socket write.
const WRITE_WAIT: Duration = Duration::from_secs(10);
/// A connection missing pongs (or any traffic) this long is evicted.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);
/// Ping cadence, kept inside the pong window with margin to spare.
const PING_INTERVAL: Duration = Duration::from_secs(PONG_TIMEOUT.as_secs() * 9 / 10);
/// Chat control frames are tiny; anything bigger is malformed.
const MAX_CONTROL_FRAME: usize = 512;
/// SDP offers routinely run to a few KiB; cap the whole socket here.
const MAX_SIGNAL_FRAME: usize = 16 * 1024;
/// Tolerated decode failures before the connection is closed.
const MAX_MALFORMED_FRAMES: u32 = 8;

/// Cookie consulted when no `token` query parameter is present.
const TOKEN_COOKIE: &str = "hermes_token";

// ============================================================================
// Upgrade handler
// ============================================================================

/// The bearer token rides in the query string because WebSocket upgrades are
/// plain GET requests; browser clients that hold the token in an HttpOnly
/// cookie are covered by the cookie fallback.
#[derive(Debug, serde::Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

/// GET /ws?token=<access_token> — upgrade to a gateway connection.
///
/// Authentication precedes the upgrade: invalid tokens get a plain 401 with
/// no upgrade attempt. Memberships are loaded before registration so the hub
/// indexes the connection into the right server rooms from the first event.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    jar: CookieJar,
    State(state): State<AppState>,
) -> Response {
    let token = match params
        .token
        .or_else(|| jar.get(TOKEN_COOKIE).map(|c| c.value().to_owned()))
    {
        Some(t) => t,
        None => return (StatusCode::UNAUTHORIZED, "Missing token").into_response(),
    };

    let claims = match validate_token(&token, &state.jwt_secret) {
        Ok(c) => c,
        Err(_) => {
            return (StatusCode::UNAUTHORIZED, "Invalid or expired token").into_response();
        }
    };

    // Reject refresh tokens used as WebSocket credentials.
    if claims.token_type != TokenType::Access {
        return (StatusCode::UNAUTHORIZED, "Access token required").into_response();
    }

    let user_id = match claims.user_id() {
        Ok(id) => id,
        Err(_) => {
            return (StatusCode::UNAUTHORIZED, "Invalid token subject").into_response();
        }
    };

    let server_ids = match state.store.load_membership(user_id).await {
        Ok(ids) => ids,
        Err(e) => {
            tracing::error!(
                user_id,
                error = ?e,
                "Failed to load memberships for gateway connection"
            );
            return (StatusCode::SERVICE_UNAVAILABLE, "Try again later").into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, user_id, server_ids, state))
}

// ============================================================================
// Connection lifecycle
// ============================================================================

async fn handle_socket(socket: WebSocket, user_id: u64, server_ids: Vec<u64>, state: AppState) {
    let (ws_sender, ws_receiver) = socket.split();
    let (conn, rx) = Connection::new(user_id, server_ids);
    let conn = Arc::new(conn);

    state.hub.register(conn.clone()).await;
    tracing::debug!(user_id, conn_id = %conn.conn_id(), "Gateway connection registered");

    let mut send_task = tokio::spawn(write_pump(ws_sender, rx));

    let read_conn = conn.clone();
    let read_state = state.clone();
    let mut recv_task = tokio::spawn(read_pump(ws_receiver, read_conn, read_state));

    // Wait for either pump to finish — then abort the other.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Voice sessions owned by this connection leave their rooms first so the
    // departure is announced while routing state is still intact.
    state.sfu.disconnect(user_id, conn.conn_id()).await;
    state.hub.unregister(conn.clone()).await;
    tracing::debug!(user_id, conn_id = %conn.conn_id(), "Gateway connection closed");
}

// ============================================================================
// Read pump
// ============================================================================

/// Decode one envelope per turn and hand it to the router synchronously —
/// per-connection ordering is part of the contract, so no task-per-message.
async fn read_pump(mut receiver: SplitStream<WebSocket>, conn: Arc<Connection>, state: AppState) {
    let mut malformed: u32 = 0;

    loop {
        // Any inbound frame (data, pong, ping) refreshes the read deadline.
        let frame = match timeout(PONG_TIMEOUT, receiver.next()).await {
            Err(_) => {
                tracing::debug!(user_id = conn.user_id(), "Pong timeout; closing connection");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::debug!(
                    user_id = conn.user_id(),
                    error = ?e,
                    "WebSocket receive error; closing connection"
                );
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) => {
                if text.len() > MAX_SIGNAL_FRAME {
                    tracing::warn!(
                        user_id = conn.user_id(),
                        size = text.len(),
                        "Oversized frame; closing connection"
                    );
                    break;
                }

                let envelope = match serde_json::from_str::<Envelope>(&text) {
                    Ok(env) => env,
                    Err(e) => {
                        tracing::debug!(
                            user_id = conn.user_id(),
                            error = %e,
                            "Ignoring malformed frame"
                        );
                        malformed += 1;
                        if malformed >= MAX_MALFORMED_FRAMES {
                            tracing::warn!(
                                user_id = conn.user_id(),
                                "Too many malformed frames; closing connection"
                            );
                            break;
                        }
                        continue;
                    }
                };

                // Only SDP/ICE payloads may exceed the control-frame cap.
                if !is_signaling_event(&envelope.event) && text.len() > MAX_CONTROL_FRAME {
                    tracing::debug!(
                        user_id = conn.user_id(),
                        event = %envelope.event,
                        size = text.len(),
                        "Ignoring oversized control frame"
                    );
                    malformed += 1;
                    if malformed >= MAX_MALFORMED_FRAMES {
                        break;
                    }
                    continue;
                }

                route_message(&state.hub, &state.sfu, &state.store, &conn, envelope).await;
            }
            Message::Close(_) => break,
            // Axum answers Ping frames automatically; Pongs only matter for
            // the deadline refresh handled above.
            _ => {}
        }
    }
}

// ============================================================================
// Write pump
// ============================================================================

/// Drain the outbound queue onto the socket and keep the heartbeat going.
/// Exits when the queue is closed (hub eviction or unregister) or on the
/// first write error; the socket drops with the sink.
async fn write_pump(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Envelope>,
) {
    let mut ping = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(envelope) => {
                    let text = match serde_json::to_string(&envelope) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::error!(
                                error = ?e,
                                "Failed to serialize envelope; this is a programming error"
                            );
                            continue;
                        }
                    };
                    match timeout(WRITE_WAIT, sender.send(Message::Text(text))).await {
                        Ok(Ok(())) => {}
                        _ => break,
                    }
                }
                None => {
                    // Queue closed — tell the client before hanging up.
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = ping.tick() => {
                match timeout(WRITE_WAIT, sender.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
        }
    }
}
