//! WebSocket handler streaming alarm output records

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, stream::StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::actors::messages::AlarmOutput;
use crate::api::state::ApiState;

/// WebSocket upgrade handler
///
/// GET /api/v1/stream
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<ApiState>) -> Response {
    // Records emitted after the handshake must reach the client
    let output_rx = state.output.subscribe();
    ws.on_upgrade(|socket| handle_websocket(socket, output_rx))
}

/// Forward every emitted `AlarmOutput` as a JSON text frame
async fn handle_websocket(socket: WebSocket, mut output_rx: broadcast::Receiver<AlarmOutput>) {
    info!("WebSocket client connected");

    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        loop {
            let output = match output_rx.recv().await {
                Ok(output) => output,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("WebSocket client lagging, skipped {skipped} records");
                    continue;
                }
                Err(RecvError::Closed) => {
                    debug!("output stream closed");
                    break;
                }
            };

            if let Ok(text) = serde_json::to_string(&output)
                && sender.send(Message::Text(text)).await.is_err()
            {
                debug!("WebSocket send failed, client disconnected");
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => {
            recv_task.abort();
        }
        _ = (&mut recv_task) => {
            send_task.abort();
        }
    }

    info!("WebSocket client disconnected");
}
