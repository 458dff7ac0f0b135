//! Realtime progress hub.
//!
//! Browser connections subscribe to `owner/repo` keys and receive pipeline
//! events as they happen. State is process-local: two maps, connection to
//! subscribed apps and app to subscribed connections, kept mutually
//! consistent behind one mutex. A send to a closed connection prunes it
//! from both maps; an app entry with no subscribers is dropped.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct HubMessage {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    pub timestamp: String,
}

impl HubMessage {
    pub fn new(event_type: &str, data: Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            data,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn progress(app: &str, run_id: i64, stage: &str, stage_status: &str) -> Self {
        Self::new(
            "deployment_progress",
            json!({
                "app": app,
                "runId": run_id,
                "stage": stage,
                "status": stage_status,
            }),
        )
    }

    pub fn complete(app: &str, run_id: i64, image_url: Option<&str>) -> Self {
        Self::new(
            "deployment_complete",
            json!({"app": app, "runId": run_id, "imageUrl": image_url}),
        )
    }

    pub fn failed(app: &str, run_id: i64, stage: &str, error: &str) -> Self {
        Self::new(
            "deployment_failed",
            json!({"app": app, "runId": run_id, "stage": stage, "error": error}),
        )
    }

    pub fn pong() -> Self {
        Self::new("pong", json!({}))
    }

    pub fn error(detail: &str) -> Self {
        Self::new("error", json!({"detail": detail}))
    }
}

struct Connection {
    tx: UnboundedSender<HubMessage>,
    apps: HashSet<String>,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<Uuid, Connection>,
    apps: HashMap<String, HashSet<Uuid>>,
}

#[derive(Default)]
pub struct Hub {
    state: Mutex<HubState>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tx: UnboundedSender<HubMessage>) -> Uuid {
        let id = Uuid::new_v4();
        let mut state = self.lock();
        state.connections.insert(
            id,
            Connection {
                tx,
                apps: HashSet::new(),
            },
        );
        tracing::debug!(conn = %id, total = state.connections.len(), "hub connection registered");
        crate::metrics::set_hub_connections(state.connections.len());
        id
    }

    pub fn subscribe(&self, conn_id: Uuid, app: &str) -> bool {
        let mut state = self.lock();
        let Some(conn) = state.connections.get_mut(&conn_id) else {
            return false;
        };
        conn.apps.insert(app.to_string());
        state.apps.entry(app.to_string()).or_default().insert(conn_id);
        true
    }

    pub fn unsubscribe(&self, conn_id: Uuid, app: &str) {
        let mut state = self.lock();
        if let Some(conn) = state.connections.get_mut(&conn_id) {
            conn.apps.remove(app);
        }
        Self::drop_app_member(&mut state, app, conn_id);
    }

    pub fn disconnect(&self, conn_id: Uuid) {
        let mut state = self.lock();
        if let Some(conn) = state.connections.remove(&conn_id) {
            for app in conn.apps {
                Self::drop_app_member(&mut state, &app, conn_id);
            }
        }
        crate::metrics::set_hub_connections(state.connections.len());
    }

    /// Deliver `message` to every subscriber of `app`. Connections whose
    /// receiving task is gone are pruned on the spot.
    pub fn broadcast(&self, app: &str, message: HubMessage) {
        let mut state = self.lock();
        let Some(subscribers) = state.apps.get(app) else {
            return;
        };
        let mut dead: Vec<Uuid> = Vec::new();
        for conn_id in subscribers.iter() {
            match state.connections.get(conn_id) {
                Some(conn) if conn.tx.send(message.clone()).is_ok() => {}
                _ => dead.push(*conn_id),
            }
        }
        for conn_id in dead {
            tracing::debug!(conn = %conn_id, app, "pruning dead hub connection");
            if let Some(conn) = state.connections.remove(&conn_id) {
                for subscribed in conn.apps {
                    Self::drop_app_member(&mut state, &subscribed, conn_id);
                }
            } else {
                Self::drop_app_member(&mut state, app, conn_id);
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn subscriber_count(&self, app: &str) -> usize {
        self.lock().apps.get(app).map_or(0, |s| s.len())
    }

    fn drop_app_member(state: &mut HubState, app: &str, conn_id: Uuid) {
        if let Some(members) = state.apps.get_mut(app) {
            members.remove(&conn_id);
            if members.is_empty() {
                state.apps.remove(app);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubState> {
        // Hub operations never panic while holding the lock.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// App key used for hub routing.
pub fn app_key(owner: &str, repo: &str) -> String {
    format!("{owner}/{repo}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn subscribe_and_broadcast_delivers() {
        let hub = Hub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = hub.register(tx);
        assert!(hub.subscribe(conn, "acme/web"));

        hub.broadcast("acme/web", HubMessage::progress("acme/web", 1, "build", "running"));
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.event_type, "deployment_progress");
        assert_eq!(msg.data["stage"], "build");
    }

    #[test]
    fn broadcast_to_other_app_is_not_delivered() {
        let hub = Hub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = hub.register(tx);
        hub.subscribe(conn, "acme/web");
        hub.broadcast("acme/api", HubMessage::pong());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unsubscribe_removes_empty_app_entry() {
        let hub = Hub::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = hub.register(tx);
        hub.subscribe(conn, "acme/web");
        assert_eq!(hub.subscriber_count("acme/web"), 1);
        hub.unsubscribe(conn, "acme/web");
        assert_eq!(hub.subscriber_count("acme/web"), 0);
    }

    #[test]
    fn disconnect_clears_both_indexes() {
        let hub = Hub::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = hub.register(tx);
        hub.subscribe(conn, "acme/web");
        hub.subscribe(conn, "acme/api");
        hub.disconnect(conn);
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.subscriber_count("acme/web"), 0);
        assert_eq!(hub.subscriber_count("acme/api"), 0);
        // subscribing after disconnect is a no-op
        assert!(!hub.subscribe(conn, "acme/web"));
    }

    #[test]
    fn dead_connections_are_pruned_on_broadcast() {
        let hub = Hub::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = hub.register(tx);
        hub.subscribe(conn, "acme/web");
        drop(rx);

        hub.broadcast("acme/web", HubMessage::pong());
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.subscriber_count("acme/web"), 0);
    }
}
