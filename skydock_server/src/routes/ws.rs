//! WebSocket endpoint feeding the realtime hub.

use axum::extract::ws::{Message, WebSocket};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::hub::HubMessage;
use crate::routes::AppState;

pub async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let (tx, mut rx) = mpsc::unbounded_channel::<HubMessage>();
    let hub = state.orchestrator.hub.clone();
    let conn_id = hub.register(tx.clone());

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(message) = outbound else { break };
                let Ok(text) = serde_json::to_string(&message) else { continue };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&hub, conn_id, &tx, &text);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(conn = %conn_id, error = %e, "websocket receive error");
                        break;
                    }
                }
            }
        }
    }

    hub.disconnect(conn_id);
    tracing::debug!(conn = %conn_id, "websocket closed");
}

/// Inbound frames are `{"type": ..., "data": {...}}`. A malformed frame
/// gets an error message back, the connection stays open.
fn handle_client_message(
    hub: &crate::hub::Hub,
    conn_id: uuid::Uuid,
    tx: &mpsc::UnboundedSender<HubMessage>,
    text: &str,
) {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        let _ = tx.send(HubMessage::error("message is not valid JSON"));
        return;
    };
    let message_type = frame["type"].as_str().unwrap_or("");
    match message_type {
        "ping" => {
            let _ = tx.send(HubMessage::pong());
        }
        "subscribe" | "unsubscribe" => {
            let Some(app) = app_of(&frame["data"]) else {
                let _ = tx.send(HubMessage::error("subscription needs an app key"));
                return;
            };
            if message_type == "subscribe" {
                hub.subscribe(conn_id, &app);
            } else {
                hub.unsubscribe(conn_id, &app);
            }
        }
        _ => {
            let _ = tx.send(HubMessage::error("unknown message type"));
        }
    }
}

/// App key as `"app": "owner/repo"` or separate owner/repo fields.
fn app_of(data: &Value) -> Option<String> {
    if let Some(app) = data["app"].as_str() {
        return Some(app.to_string());
    }
    match (data["owner"].as_str(), data["repo"].as_str()) {
        (Some(owner), Some(repo)) => Some(crate::hub::app_key(owner, repo)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn app_key_accepted_in_both_shapes() {
        assert_eq!(app_of(&json!({"app": "acme/web"})).as_deref(), Some("acme/web"));
        assert_eq!(
            app_of(&json!({"owner": "acme", "repo": "web"})).as_deref(),
            Some("acme/web")
        );
        assert!(app_of(&json!({"owner": "acme"})).is_none());
    }
}
