use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::connection_manager::{Admission, ConnectionHandle};
use crate::error::AppError;
use crate::server::AppState;

use super::message::OutboundMessage;
use super::router::PeerRouter;

/// WebSocket upgrade handler
#[tracing::instrument(name = "ws.upgrade", skip_all)]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
) -> Response {
    if state.hub.is_closing() {
        tracing::info!("Server closing, refusing WebSocket upgrade");
        return AppError::Unavailable("Server is shutting down".to_string()).into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

/// Handle an established WebSocket connection
#[tracing::instrument(name = "ws.connection", skip(socket, state))]
async fn handle_socket(socket: WebSocket, state: AppState, remote_addr: SocketAddr) {
    let (tx, rx) = mpsc::channel::<OutboundMessage>(state.settings.signaling.outbound_buffer);

    let handle = match state.hub.admit(Some(remote_addr), tx) {
        Admission::Admitted(handle) => handle,
        Admission::Refused { .. } | Admission::Closing => {
            let (mut ws_sender, _) = socket.split();
            let _ = ws_sender.send(Message::Close(None)).await;
            let _ = ws_sender.close().await;
            return;
        }
    };
    let connection_id = handle.id;

    let (ws_sender, mut ws_receiver) = socket.split();

    // Frames leave in queue order; a closed handle flushes what is queued first
    let mut send_task = tokio::spawn(write_loop(ws_sender, rx, handle.clone()));

    let router = state.router.clone();
    let reader_handle = handle.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(msg) => {
                    if !process_message(msg, &router, &reader_handle).await {
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

    let send_finished = tokio::select! {
        _ = &mut send_task => {
            tracing::debug!(connection_id = %connection_id, "Send task completed");
            true
        }
        _ = &mut recv_task => {
            tracing::debug!(connection_id = %connection_id, "Receive task completed");
            false
        }
    };
    recv_task.abort();

    let removed = state.hub.disconnect(&handle).await;

    if !send_finished {
        let flush = state.settings.signaling.send_timeout();
        if tokio::time::timeout(flush, send_task).await.is_err() {
            tracing::debug!(connection_id = %connection_id, "Timed out flushing outbound frames");
        }
    }

    tracing::info!(
        connection_id = %connection_id,
        removed = ?removed,
        "WebSocket connection closed"
    );
}

async fn write_loop<S>(
    mut ws_sender: S,
    mut rx: mpsc::Receiver<OutboundMessage>,
    handle: Arc<ConnectionHandle>,
) where
    S: Sink<Message> + Unpin,
{
    loop {
        tokio::select! {
            biased;
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                if write_frame(&mut ws_sender, &msg).await.is_err() {
                    return;
                }
            }
            _ = handle.closed() => {
                while let Ok(msg) = rx.try_recv() {
                    if write_frame(&mut ws_sender, &msg).await.is_err() {
                        return;
                    }
                }
                break;
            }
        }
    }

    let _ = ws_sender.send(Message::Close(None)).await;
    let _ = ws_sender.close().await;
}

async fn write_frame<S>(ws_sender: &mut S, msg: &OutboundMessage) -> Result<(), S::Error>
where
    S: Sink<Message> + Unpin,
{
    let text = match msg.to_json() {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize message");
            return Ok(());
        }
    };
    ws_sender.send(Message::Text(text.into())).await
}

/// Process a received WebSocket message
/// Returns false if the connection should be closed
async fn process_message(
    msg: Message,
    router: &PeerRouter,
    handle: &Arc<ConnectionHandle>,
) -> bool {
    match msg {
        Message::Text(text) => {
            router.handle_text(handle, text.as_str()).await;
            true
        }
        Message::Binary(_) => {
            tracing::debug!(connection_id = %handle.id, "Ignoring binary frame");
            true
        }
        // Transport keepalives are answered by axum and do not count as activity
        Message::Ping(_) | Message::Pong(_) => true,
        Message::Close(_) => {
            tracing::debug!(connection_id = %handle.id, "Received close frame");
            false
        }
    }
}
