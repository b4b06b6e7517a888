use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::connection::ConnectionHandle;
use crate::error::BrokerError;
use crate::server::AppState;
use crate::stats::BandwidthCounters;

use super::message::{ClientMessage, OutboundMessage, ServerMessage};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub credential: Option<String>,
}

/// WebSocket upgrade handler
#[tracing::instrument(
    name = "ws.upgrade",
    skip(ws, state, query, headers),
    fields(has_query_credential = query.credential.is_some())
)]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    if !state.lifecycle.is_accepting() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Broker is stopped").into_response();
    }

    // An absent credential is not an error: the connection is admitted
    // anonymously at the lowest tier.
    let credential = extract_credential(&query, &headers);

    ws.on_upgrade(move |socket| handle_socket(socket, state, credential))
}

/// Extract the credential from the query parameter or Authorization header.
fn extract_credential(query: &WsQuery, headers: &HeaderMap) -> Option<String> {
    if let Some(ref credential) = query.credential {
        return Some(credential.clone());
    }

    if let Some(auth_header) = headers.get(header::AUTHORIZATION) {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(token) = auth_str.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }

    None
}

/// Handle an established WebSocket connection
#[tracing::instrument(name = "ws.connection", skip(socket, state, credential))]
async fn handle_socket(socket: WebSocket, state: AppState, credential: Option<String>) {
    let (tx, mut rx) =
        mpsc::channel::<OutboundMessage>(state.settings.websocket.outbound_queue_size.max(1));

    let handle = match state
        .connection_manager
        .connect(credential.as_deref(), tx)
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            tracing::warn!(error = %e, "Handshake rejected");
            // Acknowledge with a structured error, then close.
            let (mut ws_sender, _) = socket.split();
            if let Ok(json) = serde_json::to_string(&ServerMessage::error(&e)) {
                let _ = ws_sender.send(Message::Text(json.into())).await;
            }
            let _ = ws_sender.close().await;
            return;
        }
    };
    let connection_id = handle.id;
    let connection_start = std::time::Instant::now();

    let _ = handle
        .send(ServerMessage::Connected {
            connection_id,
            tier: handle.tier,
        })
        .await;

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Task for sending queued messages to the WebSocket
    let bandwidth_out = state.bandwidth.clone();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match msg.to_json() {
                Ok(t) => t,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize message");
                    continue;
                }
            };

            bandwidth_out.record_out(text.len());
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Task for receiving messages from the WebSocket
    let state_clone = state.clone();
    let handle_clone = handle.clone();
    let bandwidth_in = state.bandwidth.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(msg) => {
                    if !process_message(msg, &state_clone, &handle_clone, &bandwidth_in).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    });

    // Wait for either task to complete
    tokio::select! {
        _ = send_task => {
            tracing::debug!(connection_id = %connection_id, "Send task completed");
        }
        _ = recv_task => {
            tracing::debug!(connection_id = %connection_id, "Receive task completed");
        }
    }

    state.connection_manager.disconnect(connection_id);

    tracing::info!(
        connection_id = %connection_id,
        duration_secs = connection_start.elapsed().as_secs_f64(),
        "WebSocket connection closed"
    );
}

/// Process a received WebSocket message.
/// Returns false if the connection should be closed.
async fn process_message(
    msg: Message,
    state: &AppState,
    handle: &Arc<ConnectionHandle>,
    bandwidth: &BandwidthCounters,
) -> bool {
    match msg {
        Message::Text(text) => {
            handle.update_activity();
            bandwidth.record_in(text.len());

            let client_msg: ClientMessage = match serde_json::from_str(&text) {
                Ok(m) => m,
                Err(e) => {
                    let err = BrokerError::InvalidEvent(format!("unparseable event: {e}"));
                    let _ = handle.send(ServerMessage::error(&err)).await;
                    return true;
                }
            };

            handle_client_message(client_msg, state, handle).await;
            true
        }
        Message::Binary(_) => {
            let err = BrokerError::InvalidEvent("binary messages are not supported".to_string());
            let _ = handle.send(ServerMessage::error(&err)).await;
            true
        }
        Message::Ping(_) | Message::Pong(_) => {
            handle.update_activity();
            true
        }
        Message::Close(_) => {
            tracing::debug!(connection_id = %handle.id, "Received close frame");
            false
        }
    }
}

/// Handle a parsed client message. Every failure is acknowledged to this
/// connection only, as a structured error event.
#[tracing::instrument(
    name = "ws.message",
    skip(msg, state, handle),
    fields(connection_id = %handle.id)
)]
async fn handle_client_message(
    msg: ClientMessage,
    state: &AppState,
    handle: &Arc<ConnectionHandle>,
) {
    match msg {
        ClientMessage::Subscribe { channel } => {
            match state.connection_manager.subscribe(handle.id, &channel) {
                Ok(()) => {
                    let _ = handle.send(ServerMessage::Subscribed { channel }).await;
                }
                Err(e) => {
                    let _ = handle.send(ServerMessage::error(&e)).await;
                }
            }
        }
        ClientMessage::Unsubscribe { channel } => {
            match state.connection_manager.unsubscribe(handle.id, &channel) {
                Ok(()) => {
                    let _ = handle.send(ServerMessage::Unsubscribed { channel }).await;
                }
                Err(e) => {
                    let _ = handle.send(ServerMessage::error(&e)).await;
                }
            }
        }
        ClientMessage::Join { room } => {
            if state.connection_manager.join_room(handle.id, &room) {
                let _ = handle.send(ServerMessage::Joined { room }).await;
            } else {
                let err = BrokerError::InvalidEvent(format!("cannot join room: {room}"));
                let _ = handle.send(ServerMessage::error(&err)).await;
            }
        }
        ClientMessage::Leave { room } => {
            state.connection_manager.leave_room(handle.id, &room);
            let _ = handle.send(ServerMessage::Left { room }).await;
        }
        ClientMessage::Publish { channel, event } => {
            if let Err(e) = state.connection_manager.route_event(handle.id, &channel, &event) {
                let _ = handle.send(ServerMessage::error(&e)).await;
            }
        }
        ClientMessage::Ping => {
            let _ = handle.send(ServerMessage::Pong).await;
        }
    }
}
