//! WebSocket endpoint for dashboard observers: an initial full-fleet
//! snapshot followed by the node-event broadcast stream.

use std::sync::Arc;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, Utf8Bytes, WebSocket},
    },
    response::IntoResponse,
};
use futures_util::stream::StreamExt;
use tracing::{debug, error, info};

use crate::protocol::{FullNodeListPush, WsMessage};
use crate::web::AppState;

pub async fn ws_dashboard_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state))
}

async fn handle_socket(mut socket: WebSocket, app_state: Arc<AppState>) {
    info!("Dashboard observer connected.");

    let nodes = match app_state.node_context.store.list_nodes().await {
        Ok(nodes) => nodes,
        Err(e) => {
            error!(error = %e, "Failed to load fleet snapshot for dashboard; closing.");
            return;
        }
    };
    let snapshot = WsMessage::FullNodeList(FullNodeListPush { nodes });
    match serde_json::to_string(&snapshot) {
        Ok(text) => {
            if socket.send(Message::Text(Utf8Bytes::from(text))).await.is_err() {
                return;
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to serialize fleet snapshot; closing.");
            return;
        }
    }

    let mut rx = app_state.node_context.broadcaster.subscribe();

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(message) => {
                        match serde_json::to_string(&message) {
                            Ok(text) => {
                                if socket.send(Message::Text(Utf8Bytes::from(text))).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => error!(error = %e, "Failed to serialize node event."),
                        }
                    }
                    Err(e) => {
                        // Lagged or closed; either way this observer is done.
                        debug!("Dashboard broadcast receive ended: {e}");
                        break;
                    }
                }
            }
            frame = socket.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if text == "ping"
                            && socket
                                .send(Message::Text(Utf8Bytes::from("pong")))
                                .await
                                .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("Dashboard WebSocket error: {e}");
                        break;
                    }
                }
            }
        }
    }
    info!("Dashboard observer disconnected.");
}
