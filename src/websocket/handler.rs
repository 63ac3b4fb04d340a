//! WebSocket endpoint.
//!
//! Clients authenticate with their bearer token in the first frame, then
//! subscribe to channels. Outbound traffic drains from the per-client
//! bounded outbox; the connection closes when the outbox does.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::types::{ClientMessage, ServerMessage};
use crate::AppState;

/// How long a fresh connection may take to authenticate.
const AUTH_DEADLINE: Duration = Duration::from_secs(10);

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // First frame must be an auth message with a valid token.
    let user = match authenticate(&state, &mut receiver).await {
        Some(user) => user,
        None => {
            let frame = ServerMessage::Error {
                error: "authentication required".to_string(),
            };
            if let Ok(json) = serde_json::to_string(&frame) {
                let _ = sender.send(Message::Text(json)).await;
            }
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    let conn = state.rooms.register(user.id.clone());
    let client_id = conn.id;
    info!(client = %client_id, user_id = %user.id, "websocket client connected");

    if let Ok(json) = serde_json::to_string(&ServerMessage::Authenticated {
        user_id: user.id.clone(),
    }) {
        let _ = sender.send(Message::Text(json)).await;
    }

    // Writer: drain the outbox until it closes (disconnect or overflow of a
    // lossless channel).
    let writer_conn = conn.clone();
    let send_task = tokio::spawn(async move {
        while let Some(json) = writer_conn.outbox.next().await {
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Text(text)) => handle_message(&state, &conn, &text),
            Ok(Message::Close(_)) => {
                debug!(client = %client_id, "client closed connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(client = %client_id, error = %e, "websocket error");
                break;
            }
        }
        if conn.outbox.is_closed() {
            break;
        }
    }

    state.rooms.unregister(client_id);
    send_task.abort();
    info!(client = %client_id, "websocket client disconnected");
}

async fn authenticate(
    state: &AppState,
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
) -> Option<crate::types::User> {
    let first = tokio::time::timeout(AUTH_DEADLINE, receiver.next())
        .await
        .ok()??
        .ok()?;
    let Message::Text(text) = first else {
        return None;
    };
    let Ok(ClientMessage::Auth { token }) = serde_json::from_str(&text) else {
        return None;
    };
    state.auth.authenticate(&token).ok()
}

fn handle_message(state: &AppState, conn: &crate::websocket::ClientConn, text: &str) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            send(conn, &ServerMessage::Error {
                error: format!("invalid message: {e}"),
            });
            return;
        }
    };

    match message {
        ClientMessage::Auth { .. } => {
            send(conn, &ServerMessage::Error {
                error: "already authenticated".to_string(),
            });
        }
        ClientMessage::Subscribe { channel, symbol } => {
            let ok = state.rooms.subscribe(conn.id, channel, symbol.as_deref());
            if ok {
                send(conn, &ServerMessage::Subscribed { channel, symbol });
            } else {
                send(conn, &ServerMessage::Error {
                    error: "subscription failed".to_string(),
                });
            }
        }
        ClientMessage::Unsubscribe { channel, symbol } => {
            state.rooms.unsubscribe(conn.id, channel, symbol.as_deref());
            send(conn, &ServerMessage::Unsubscribed { channel, symbol });
        }
        ClientMessage::Ping => send(conn, &ServerMessage::Pong),
    }
}

fn send(conn: &crate::websocket::ClientConn, message: &ServerMessage) {
    if let Ok(json) = serde_json::to_string(message) {
        let _ = conn.outbox.push_reliable(json);
    }
}
