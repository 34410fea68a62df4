//! WebSocket endpoint for agents and controllers.
//!
//! Flow:
//! 1. Peer connects to `/v1/ws?role=agent|controller&token=<token>`
//! 2. The verifier checks `(role, token)` once; rejection is a 401 before
//!    the upgrade
//! 3. Each frame is a JSON [`ClientMessage`]; replies, relayed traffic and
//!    presence events all flow back through one writer task

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;

use rb_broker::dispatch::invalid_message;
use rb_broker::TransportId;
use rb_protocol::{ClientMessage, Role, ServerMessage};

use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Query params
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub role: Role,
    /// Pre-shared token for the claimed role.
    pub token: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// GET /v1/ws: upgrade to WebSocket.
pub async fn broker_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Response {
    if !state.broker.verify(query.role, query.token.as_deref()) {
        tracing::warn!(role = %query.role, "connection rejected by verifier");
        return (StatusCode::UNAUTHORIZED, "invalid or missing token").into_response();
    }

    let max_message = state.broker.config().max_message_bytes;
    let role = query.role;
    ws.max_message_size(max_message)
        .on_upgrade(move |socket| handle_socket(socket, state, role))
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Socket handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn handle_socket(socket: WebSocket, state: AppState, role: Role) {
    let broker = state.broker.clone();
    let transport = TransportId::generate();
    let (mut ws_sink, mut ws_stream) = socket.split();

    let mut outbound = broker.on_connect(&transport, role);
    let mut presence = broker.subscribe_presence();

    // Writer task: queue and presence fan-out into the socket.
    let writer_transport = transport.clone();
    let writer = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                msg = outbound.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
                ev = presence.recv() => match ev {
                    Ok(ev) => ServerMessage::from(ev),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            transport = %writer_transport,
                            skipped,
                            "presence subscriber lagged"
                        );
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };
            if send_ws_message(&mut ws_sink, &msg).await.is_err() {
                break;
            }
        }
    });

    // Reader loop.
    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => {
                let reply = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(msg) => broker.handle_message(&transport, role, msg),
                    Err(e) => {
                        tracing::debug!(transport = %transport, error = %e, "unparseable frame");
                        Some(invalid_message(e))
                    }
                };
                if let Some(reply) = reply {
                    broker.connections().notify(&transport, reply);
                }
            }
            Message::Close(_) => break,
            // axum answers WS-level pings itself.
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Binary(_) => {
                broker
                    .connections()
                    .notify(&transport, invalid_message("binary frames are not supported"));
            }
        }
    }

    writer.abort();
    broker.on_disconnect(&transport);
}

async fn send_ws_message(
    sink: &mut (impl SinkExt<Message> + Unpin),
    msg: &ServerMessage,
) -> Result<(), ()> {
    let json = serde_json::to_string(msg).map_err(|_| ())?;
    sink.send(Message::Text(json)).await.map_err(|_| ())
}
