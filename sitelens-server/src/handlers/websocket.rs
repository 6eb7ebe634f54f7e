use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};

use sitelens_core::broadcast::ReportFrame;

use crate::infra::app_state::AppState;

/// Upgrades to a socket that streams `{ "response": RouteReport }` frames.
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn encode(frame: &ReportFrame) -> Option<Message> {
    match serde_json::to_string(frame) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(err) => {
            warn!(error = %err, "failed to encode report frame");
            None
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    // Register before taking the snapshot so no transition falls in between.
    let (observer, mut rx) = state.live.connect(state.observer_queue());

    let snapshot = state.runtime.reports();
    let mut send_task = tokio::spawn(async move {
        for report in snapshot {
            let Some(message) = encode(&ReportFrame { response: report }) else {
                continue;
            };
            if ws_sender.send(message).await.is_err() {
                return;
            }
        }
        while let Some(frame) = rx.recv().await {
            let Some(message) = encode(&frame) else {
                continue;
            };
            if ws_sender.send(message).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut send_task => break,
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(error = %err, "websocket receive failed");
                    break;
                }
            },
        }
    }

    state.live.disconnect(&observer);
    send_task.abort();
    debug!(%observer, "websocket observer closed");
}
