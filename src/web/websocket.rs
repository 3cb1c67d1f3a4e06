use axum::{
    extract::{ws::{Message, WebSocket, WebSocketUpgrade}, State},
    response::Response,
    routing::get,
    Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, warn};

use crate::api::AppState;
use crate::backup::{BackupManager, Event};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(websocket_handler))
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state.manager))
}

fn status_message(manager: &BackupManager) -> String {
    json!({
        "type": "status",
        "payload": manager.get_status()
    })
    .to_string()
}

fn event_message(event: &Event) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(text) => Some(text),
        Err(e) => {
            error!("Failed to serialize event: {}", e);
            None
        }
    }
}

async fn handle_socket(socket: WebSocket, manager: BackupManager) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before the first snapshot so nothing falls in between
    let mut event_rx = manager.subscribe_events();

    if let Err(e) = sender.send(Message::Text(status_message(&manager))).await {
        error!("Failed to send initial status: {}", e);
        return;
    }

    // Forward engine events and a periodic snapshot
    let mut send_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(1));

        loop {
            let text = tokio::select! {
                event = event_rx.recv() => match event {
                    Ok(event) => match event_message(&event) {
                        Some(text) => text,
                        None => continue,
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        // The snapshot carries everything that was missed
                        warn!("WebSocket client lagged, skipped {} events", skipped);
                        status_message(&manager)
                    }
                    Err(RecvError::Closed) => break,
                },

                _ = interval.tick() => status_message(&manager),
            };

            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Handle incoming messages
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    debug!("Ignoring WebSocket message: {}", text);
                }
                Message::Close(_) => {
                    debug!("WebSocket closed by client");
                    break;
                }
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = (&mut send_task) => {
            recv_task.abort();
        }
        _ = (&mut recv_task) => {
            send_task.abort();
        }
    }

    debug!("WebSocket connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupState;

    #[test]
    fn events_are_tagged_by_type() {
        let event = Event::StateChanged {
            generation: 3,
            state: BackupState::AwaitingConfirmation,
        };
        let value: serde_json::Value = serde_json::from_str(&event_message(&event).unwrap()).unwrap();
        assert_eq!(value["type"], "state_changed");
        assert_eq!(value["generation"], 3);
        assert_eq!(value["state"], "awaiting_confirmation");
    }
}
