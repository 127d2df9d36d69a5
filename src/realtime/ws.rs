// src/realtime/ws.rs
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;

use super::RealtimeHub;

/// GET /ws: every admitted story as a text frame, plus periodic pings.
pub async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<Arc<RealtimeHub>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<RealtimeHub>) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = hub.subscribe();
    let mut ping = tokio::time::interval(hub.cfg().ping);
    // first tick fires immediately
    ping.tick().await;

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Ok(json) => {
                    if sender.send(Message::Text(json.to_string().into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(target: "realtime", skipped, "ws client lagging; messages dropped");
                }
                Err(RecvError::Closed) => break,
            },
            _ = ping.tick() => {
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!(target: "realtime", error = %e, "ws receive error");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }
    tracing::debug!(target: "realtime", "ws client disconnected");
}
