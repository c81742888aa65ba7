//! WebSocket endpoint: one connection per socket, frames dispatched in order.

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::broadcast::{Payload, PUBLIC_TOPIC};
use crate::config::AppState;
use crate::error::{Error, Result};
use crate::models::{ClientFrame, ErrorFrame, Frame};
use crate::protocol::InboundEvent;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

/// GET /ws
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Result<Response> {
    let identity = if state.config.require_auth {
        let token = params
            .token
            .ok_or_else(|| Error::Unauthorized("Missing token".to_string()))?;
        Some(state.auth.resolve(&token).await?)
    } else {
        None
    };

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, identity)))
}

async fn handle_socket(socket: WebSocket, state: AppState, identity: Option<String>) {
    let connection_id = Uuid::new_v4().to_string();
    let rx = state.bus.register(&connection_id);
    state.bus.subscribe(&connection_id, PUBLIC_TOPIC);

    let _ = state
        .dispatcher
        .dispatch(InboundEvent::Connect {
            connection_id: connection_id.clone(),
            identity,
        })
        .await;

    let (ws_tx, mut ws_rx) = socket.split();
    let mut writer = tokio::spawn(write_frames(connection_id.clone(), ws_tx, rx));

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_text(&state, &connection_id, text.as_str()).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(connection_id = %connection_id, error = %e, "socket read failed");
                        break;
                    }
                }
            }
            _ = &mut writer => break,
        }
    }

    // Unregister before DISCONNECT so the LEAVE never targets this socket.
    state.bus.unregister(&connection_id);
    writer.abort();

    let _ = state
        .dispatcher
        .dispatch(InboundEvent::Disconnect {
            connection_id: connection_id.clone(),
        })
        .await;
    info!(connection_id = %connection_id, "connection closed");
}

async fn handle_text(state: &AppState, connection_id: &str, text: &str) {
    let event = match serde_json::from_str::<ClientFrame>(text) {
        Ok(ClientFrame::Join(message)) => InboundEvent::Join {
            connection_id: connection_id.to_string(),
            message,
        },
        Ok(ClientFrame::Send(message)) => InboundEvent::Send {
            connection_id: connection_id.to_string(),
            message,
        },
        Err(e) => {
            warn!(connection_id, error = %e, "malformed client frame");
            state.bus.send_to_connection(
                connection_id,
                &Frame::from(ErrorFrame::new(format!("Malformed frame: {}", e))),
            );
            return;
        }
    };

    // Failures were already reported to the client by the dispatcher.
    let _ = state.dispatcher.dispatch(event).await;
}

/// Drain the connection's queue to the socket, pinging every heartbeat interval.
async fn write_frames(
    connection_id: String,
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<Payload>,
) {
    let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    ping_interval.tick().await;

    loop {
        tokio::select! {
            payload = rx.recv() => {
                let Some(payload) = payload else { break };
                if ws_tx.send(WsMessage::Text(String::clone(&payload).into())).await.is_err() {
                    break;
                }
            }
            _ = ping_interval.tick() => {
                if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                trace!(connection_id = %connection_id, "sent ping");
            }
        }
    }

    let _ = ws_tx.close().await;
    debug!(connection_id = %connection_id, "writer stopped");
}
