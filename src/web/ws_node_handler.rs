//! WebSocket endpoint for mining-node connections. The socket is split: the
//! read half is adapted into the generic frame stream consumed by
//! `process_node_stream`, the write half is drained by a writer task fed
//! from the connection's outbound queue.

use std::{
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use axum::{
    extract::{
        ConnectInfo, State, WebSocketUpgrade,
        ws::{Message, Utf8Bytes, WebSocket},
    },
    response::Response,
};
use futures_util::{
    SinkExt,
    stream::{SplitSink, SplitStream, Stream, StreamExt},
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::protocol::TransportError;
use crate::server::{core_services, registry::Outbound};
use crate::web::AppState;

pub async fn ws_node_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(app_state): State<Arc<AppState>>,
) -> Response {
    info!(%remote_addr, "New node WebSocket connection request.");
    ws.on_upgrade(move |socket| handle_socket(socket, remote_addr, app_state))
}

async fn handle_socket(socket: WebSocket, remote_addr: SocketAddr, app_state: Arc<AppState>) {
    let (ws_sender, ws_receiver) = socket.split();

    let (tx, rx) = mpsc::channel::<Outbound>(128);
    tokio::spawn(run_writer(ws_sender, rx));

    let adapter = NodeSocketStream {
        receiver: ws_receiver,
    };
    core_services::process_node_stream(adapter, tx, remote_addr, app_state.node_context.clone())
        .await;
}

/// Serializes queued messages onto the socket; a `Close` item or a send
/// failure ends the connection from the server side.
async fn run_writer(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
) {
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Message(message) => match serde_json::to_string(&message) {
                Ok(text) => {
                    if ws_sender
                        .send(Message::Text(Utf8Bytes::from(text)))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to serialize outbound node message.");
                }
            },
            Outbound::Close => {
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            }
        }
    }
    let _ = ws_sender.close().await;
}

/// Adapts the WebSocket read half to the raw frame stream the core
/// processor expects. Non-text frames are skipped; close frames and
/// transport errors end or fault the stream.
struct NodeSocketStream {
    receiver: SplitStream<WebSocket>,
}

impl Stream for NodeSocketStream {
    type Item = Result<String, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.receiver).poll_next(cx) {
                Poll::Ready(Some(Ok(Message::Text(text)))) => {
                    return Poll::Ready(Some(Ok(text.to_string())));
                }
                Poll::Ready(Some(Ok(Message::Close(_)))) => {
                    return Poll::Ready(None);
                }
                Poll::Ready(Some(Ok(_))) => continue,
                Poll::Ready(Some(Err(e))) => {
                    warn!("Node WebSocket receive error: {e}");
                    return Poll::Ready(Some(Err(TransportError::WebSocket(e.to_string()))));
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
