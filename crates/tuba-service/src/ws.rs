//! WebSocket handler for the live monitoring feed.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use tuba_core::MonitorSnapshot;

use crate::state::AppState;

/// Create the WebSocket router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/api/ws", get(ws_handler))
}

/// First message sent on every connection.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Greeting {
    Snapshot { snapshot: MonitorSnapshot },
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before taking the snapshot so no event falls between them.
    let mut events = Box::pin(state.poller.event_stream());

    info!("WebSocket client connected");

    let greeting = Greeting::Snapshot {
        snapshot: state.poller.snapshot().await,
    };
    match serde_json::to_string(&greeting) {
        Ok(json) => {
            if sender.send(Message::Text(json.into())).await.is_err() {
                info!("WebSocket client disconnected during initial snapshot");
                return;
            }
        }
        Err(e) => warn!("Failed to serialize snapshot: {}", e),
    }

    debug!("Sent initial snapshot to WebSocket client");

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let json = match serde_json::to_string(&event) {
                Ok(j) => j,
                Err(e) => {
                    warn!("Failed to serialize event: {}", e);
                    continue;
                }
            };

            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Client messages are only read to notice pings and closes.
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(_)) => debug!("Received ping"),
                Ok(_) => {}
                Err(e) => {
                    warn!("WebSocket receive error: {}", e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        },
        _ = &mut recv_task => {
            send_task.abort();
        },
    }

    info!("WebSocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tuba_core::PollState;

    #[tokio::test]
    async fn test_greeting_is_tagged_snapshot() {
        let state = AppState::with_source(
            tuba_store::Store::open_in_memory().unwrap(),
            crate::Config::default(),
            Arc::new(tuba_core::MockTelemetrySource::new()),
        )
        .unwrap();
        let greeting = Greeting::Snapshot {
            snapshot: state.poller.snapshot().await,
        };

        let json = serde_json::to_value(&greeting).unwrap();
        assert_eq!(json["type"], "snapshot");
        assert_eq!(json["snapshot"]["state"], "idle");
        assert!(json["snapshot"]["batch_id"].is_null());

        let Greeting::Snapshot { snapshot } = greeting;
        assert_eq!(snapshot.state, PollState::Idle);
    }
}
