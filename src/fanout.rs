// ABOUTME: Real-time fan-out hub tracking connected clients and their rooms
// ABOUTME: Handles last-connect-wins registration, presence events, and heartbeats

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::metrics;

/// How a client is attached. Sockets are bidirectional; streams are
/// server-push only, but both receive the same events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Socket,
    Stream,
}

/// One event pushed to a client sink.
#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    pub event: String,
    pub payload: serde_json::Value,
}

struct ClientConnection {
    kind: SinkKind,
    rooms: HashSet<String>,
    sink: mpsc::Sender<PushEvent>,
}

/// Registry of live client connections keyed by participant id.
#[derive(Clone)]
pub struct FanoutHub {
    clients: Arc<Mutex<HashMap<String, ClientConnection>>>,
    sink_buffer: usize,
    heartbeat_interval: Duration,
}

impl FanoutHub {
    pub fn new(sink_buffer: usize, heartbeat_interval: Duration) -> Self {
        Self {
            clients: Arc::new(Mutex::new(HashMap::new())),
            sink_buffer,
            heartbeat_interval,
        }
    }

    /// Register a client and return its event receiver. A participant
    /// reconnecting replaces their previous sink; the old receiver just
    /// stops getting events. The new client receives a `connected` event
    /// first, and everyone else is told the user is online.
    pub fn register(
        &self,
        participant: &str,
        kind: SinkKind,
        rooms: &[&str],
    ) -> mpsc::Receiver<PushEvent> {
        let (tx, rx) = mpsc::channel(self.sink_buffer);

        let replaced = {
            let mut clients = lock_clients(&self.clients);
            let replaced = clients
                .insert(
                    participant.to_string(),
                    ClientConnection {
                        kind,
                        rooms: rooms.iter().map(|r| r.to_string()).collect(),
                        sink: tx.clone(),
                    },
                )
                .is_some();
            metrics::clients_online(clients.len());
            replaced
        };

        let _ = tx.try_send(PushEvent {
            event: "connected".to_string(),
            payload: serde_json::json!({ "participant": participant }),
        });

        if replaced {
            tracing::debug!(participant = %participant, "Replaced existing connection");
        } else {
            self.broadcast_except(
                participant,
                "user-online",
                serde_json::json!({ "user": participant }),
                None,
            );
        }
        tracing::info!(participant = %participant, kind = ?kind, "Client connected");
        rx
    }

    /// Remove a client and announce they went offline. A no-op if the
    /// participant has already been replaced or removed.
    pub fn deregister(&self, participant: &str) {
        let removed = {
            let mut clients = lock_clients(&self.clients);
            let removed = clients.remove(participant).is_some();
            metrics::clients_online(clients.len());
            removed
        };
        if removed {
            tracing::info!(participant = %participant, "Client disconnected");
            self.broadcast_except(
                participant,
                "user-offline",
                serde_json::json!({ "user": participant }),
                None,
            );
        }
    }

    /// Send an event to every connected client, optionally restricted to
    /// a room. Closed sinks are deregistered on the spot; full sinks drop
    /// this event but stay connected.
    pub fn broadcast(&self, event: &str, payload: serde_json::Value, room: Option<&str>) {
        self.broadcast_except("", event, payload, room)
    }

    fn broadcast_except(
        &self,
        skip: &str,
        event: &str,
        payload: serde_json::Value,
        room: Option<&str>,
    ) {
        let mut dead = Vec::new();
        {
            let clients = lock_clients(&self.clients);
            for (id, conn) in clients.iter() {
                if id == skip {
                    continue;
                }
                if let Some(room) = room {
                    if !conn.rooms.contains(room) {
                        continue;
                    }
                }
                match conn.sink.try_send(PushEvent {
                    event: event.to_string(),
                    payload: payload.clone(),
                }) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id.clone()),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(participant = %id, event = %event, "Sink full, dropping event");
                    }
                }
            }
        }
        for id in dead {
            self.deregister(&id);
        }
    }

    /// Push an event to one participant. Returns false if they're not
    /// connected or their sink is gone.
    pub fn push(&self, participant: &str, event: &str, payload: serde_json::Value) -> bool {
        let result = {
            let clients = lock_clients(&self.clients);
            match clients.get(participant) {
                Some(conn) => conn.sink.try_send(PushEvent {
                    event: event.to_string(),
                    payload,
                }),
                None => return false,
            }
        };
        match result {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.deregister(participant);
                false
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(participant = %participant, event = %event, "Sink full, dropping event");
                false
            }
        }
    }

    pub fn join_room(&self, participant: &str, room: &str) -> bool {
        let mut clients = lock_clients(&self.clients);
        match clients.get_mut(participant) {
            Some(conn) => {
                conn.rooms.insert(room.to_string());
                true
            }
            None => false,
        }
    }

    pub fn leave_room(&self, participant: &str, room: &str) -> bool {
        let mut clients = lock_clients(&self.clients);
        match clients.get_mut(participant) {
            Some(conn) => conn.rooms.remove(room),
            None => false,
        }
    }

    pub fn is_online(&self, participant: &str) -> bool {
        lock_clients(&self.clients).contains_key(participant)
    }

    pub fn online_count(&self) -> usize {
        lock_clients(&self.clients).len()
    }

    pub fn online_participants(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock_clients(&self.clients).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Periodic ping to every sink. Sinks that have gone away get
    /// deregistered, which is what evicts silently-dead stream clients.
    pub fn spawn_heartbeat(&self) -> tokio::task::JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(hub.heartbeat_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                hub.broadcast("ping", serde_json::json!({}), None);
            }
        })
    }
}

fn lock_clients(
    clients: &Arc<Mutex<HashMap<String, ClientConnection>>>,
) -> std::sync::MutexGuard<'_, HashMap<String, ClientConnection>> {
    // A poisoned client map only happens if a broadcast panicked; the map
    // itself is still structurally sound, so keep serving.
    clients.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub() -> FanoutHub {
        FanoutHub::new(8, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_register_sends_connected_first() {
        let hub = hub();
        let mut rx = hub.register("alice", SinkKind::Socket, &["main"]);
        let first = rx.recv().await.unwrap();
        assert_eq!(first.event, "connected");
        assert!(hub.is_online("alice"));
    }

    #[tokio::test]
    async fn test_online_event_excludes_self() {
        let hub = hub();
        let mut alice = hub.register("alice", SinkKind::Socket, &["main"]);
        assert_eq!(alice.recv().await.unwrap().event, "connected");

        let mut bob = hub.register("bob", SinkKind::Stream, &["main"]);
        assert_eq!(bob.recv().await.unwrap().event, "connected");

        let seen = alice.recv().await.unwrap();
        assert_eq!(seen.event, "user-online");
        assert_eq!(seen.payload["user"], "bob");
        // Bob himself must not see his own online event
        assert!(bob.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_last_connect_wins() {
        let hub = hub();
        let mut old = hub.register("alice", SinkKind::Socket, &["main"]);
        assert_eq!(old.recv().await.unwrap().event, "connected");

        let mut new = hub.register("alice", SinkKind::Socket, &["main"]);
        assert_eq!(new.recv().await.unwrap().event, "connected");
        assert_eq!(hub.online_count(), 1);

        hub.broadcast("message", serde_json::json!({"id": "m1"}), None);
        assert_eq!(new.recv().await.unwrap().event, "message");
        assert!(old.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_room_scoped_broadcast() {
        let hub = hub();
        let mut alice = hub.register("alice", SinkKind::Socket, &["main"]);
        let mut bob = hub.register("bob", SinkKind::Socket, &["ops"]);
        // Drain registration chatter
        while alice.try_recv().is_ok() {}
        while bob.try_recv().is_ok() {}

        hub.broadcast("message", serde_json::json!({"id": "m1"}), Some("main"));
        assert_eq!(alice.recv().await.unwrap().event, "message");
        assert!(bob.try_recv().is_err());

        assert!(hub.join_room("bob", "main"));
        hub.broadcast("message", serde_json::json!({"id": "m2"}), Some("main"));
        assert_eq!(bob.recv().await.unwrap().event, "message");
    }

    #[tokio::test]
    async fn test_closed_sink_deregistered_on_broadcast() {
        let hub = hub();
        let mut bob = hub.register("bob", SinkKind::Socket, &["main"]);
        let rx = hub.register("alice", SinkKind::Stream, &["main"]);
        drop(rx);
        while bob.try_recv().is_ok() {}
        assert!(hub.is_online("alice"));

        hub.broadcast("message", serde_json::json!({}), None);
        assert!(!hub.is_online("alice"));
        assert!(hub.is_online("bob"));
        // Bob gets the broadcast and then alice's offline notice
        let events: Vec<String> = std::iter::from_fn(|| bob.try_recv().ok())
            .map(|e| e.event)
            .collect();
        assert!(events.contains(&"message".to_string()));
        assert!(events.contains(&"user-offline".to_string()));
    }

    #[tokio::test]
    async fn test_heartbeat_evicts_dead_sinks() {
        let hub = FanoutHub::new(8, Duration::from_millis(10));
        let rx = hub.register("alice", SinkKind::Stream, &["main"]);
        let task = hub.spawn_heartbeat();
        drop(rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!hub.is_online("alice"));
        task.abort();
    }

    #[tokio::test]
    async fn test_push_to_missing_participant() {
        let hub = hub();
        assert!(!hub.push("ghost", "message", serde_json::json!({})));
    }

    #[tokio::test]
    async fn test_deregister_announces_offline() {
        let hub = hub();
        let _alice = hub.register("alice", SinkKind::Socket, &["main"]);
        let mut bob = hub.register("bob", SinkKind::Socket, &["main"]);
        while bob.try_recv().is_ok() {}

        hub.deregister("alice");
        let event = bob.recv().await.unwrap();
        assert_eq!(event.event, "user-offline");
        assert_eq!(event.payload["user"], "alice");
        assert_eq!(hub.online_participants(), vec!["bob"]);
    }
}
