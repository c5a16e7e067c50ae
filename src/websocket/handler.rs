use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::AppState;

/// WebSocket upgrade handler for the push channel.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // Channel carrying supervisor-produced frames to this client
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let session = state.supervisor.register(tx);
    let supervisor = state.supervisor.clone();

    // Forward outbound frames onto the socket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    // Inbound loop; the supervisor signals `closed` when it tears the
    // session down (auth deadline, heartbeat timeout, session cap).
    loop {
        tokio::select! {
            _ = session.closed.notified() => {
                debug!("Session {} closed by supervisor", session.connection_id);
                break;
            }
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    supervisor.handle_message(&session, &text).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    supervisor.handle_disconnect(&session, "client-closed");
                    break;
                }
                Some(Ok(Message::Ping(_))) => {
                    // Pong is handled automatically by axum
                    debug!("Received transport ping from {}", session.connection_id);
                }
                Some(Err(e)) => {
                    error!("WebSocket error for {}: {}", session.connection_id, e);
                    supervisor.handle_disconnect(&session, "transport-error");
                    break;
                }
                _ => {}
            }
        }
    }

    send_task.abort();
}
