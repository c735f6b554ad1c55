//! WebSocket transport for the relay.

use super::protocol::ClientEvent;
use super::Relay;
use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::debug;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let relay = state.relay.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, relay))
}

async fn handle_socket(socket: WebSocket, relay: Arc<Relay>) {
    let (mut sender, mut receiver) = socket.split();
    let (conn, mut outbound) = relay.connect().await;

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sender.send(Message::Text(frame.to_json())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => relay.handle(conn, event).await,
                Err(e) => debug!(conn, error = %e, "Ignoring malformed relay frame"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    relay.disconnect(conn).await;
    writer.abort();
}
