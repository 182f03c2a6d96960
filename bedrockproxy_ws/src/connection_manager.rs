//! Connection Manager (component F, §4.3/§4.4).
//!
//! Owns the table of connected WebSocket clients: subscriptions, heartbeat
//! liveness, and event fan-out. Grounded on the teacher's `BackendState`
//! shape (an `Arc<RwLock<HashMap<..>>>` mutated on connect/disconnect) with
//! the membership snapshotted before sends, matching §5's requirement that
//! broadcast not hold the map across a send.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::Message;
use bedrockproxy_api::envelope::{DaemonEvent, EventEnvelope, ResponseEnvelope};
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

struct ClientRecord {
    #[allow(dead_code)]
    connected_at: OffsetDateTime,
    subscriptions: HashSet<String>,
    last_pong: Instant,
    last_ping_sent: Option<Instant>,
    rtt_ms: Option<u64>,
    sender: mpsc::UnboundedSender<Message>,
}

/// `GET /health` snapshot (§4.4).
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub clients: usize,
    pub alive_clients: usize,
    pub avg_latency: f64,
    pub timestamp: i64,
}

/// Transient table of connected clients. Never references the
/// `ServerManager`; it is handed events to fan out, not the other way
/// around (DESIGN NOTES §9's cycle-breaking rule applies symmetrically).
pub struct ConnectionManager {
    clients: RwLock<HashMap<Uuid, ClientRecord>>,
    heartbeat_interval: Duration,
    client_timeout: Duration,
}

impl ConnectionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            client_timeout: CLIENT_TIMEOUT,
        })
    }

    pub async fn register(&self, sender: mpsc::UnboundedSender<Message>) -> Uuid {
        let id = Uuid::new_v4();
        self.clients.write().await.insert(
            id,
            ClientRecord {
                connected_at: OffsetDateTime::now_utc(),
                subscriptions: HashSet::new(),
                last_pong: Instant::now(),
                last_ping_sent: None,
                rtt_ms: None,
                sender,
            },
        );
        id
    }

    pub async fn unregister(&self, id: Uuid) {
        self.clients.write().await.remove(&id);
    }

    pub async fn subscribe(&self, id: Uuid, topics: Vec<String>) {
        if let Some(client) = self.clients.write().await.get_mut(&id) {
            client.subscriptions.extend(topics);
        }
    }

    pub async fn unsubscribe(&self, id: Uuid, topics: Vec<String>) {
        if let Some(client) = self.clients.write().await.get_mut(&id) {
            for topic in &topics {
                client.subscriptions.remove(topic);
            }
        }
    }

    /// Records a liveness `pong`, measuring round-trip if a `ping` is
    /// outstanding for this client.
    pub async fn record_pong(&self, id: Uuid) {
        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get_mut(&id) {
            let now = Instant::now();
            if let Some(sent) = client.last_ping_sent.take() {
                client.rtt_ms = Some(now.saturating_duration_since(sent).as_millis() as u64);
            }
            client.last_pong = now;
        }
    }

    /// Sends a single response envelope to one client (request/response,
    /// not fan-out).
    pub async fn send_to(&self, id: Uuid, envelope: ResponseEnvelope) {
        let text = match serde_json::to_string(&envelope) {
            Ok(text) => text,
            Err(err) => {
                log::error!("failed to serialize response for {}: {}", id, err);
                return;
            }
        };
        if let Some(client) = self.clients.read().await.get(&id) {
            let _ = client.sender.send(Message::Text(text));
        }
    }

    /// Fans `event` out to every client subscribed to its topic or `"*"`
    /// (§4.4 `broadcastToSubscribers`). A send that fails removes the
    /// client, mirroring the source's "sends that throw cause removal".
    pub async fn broadcast(&self, event: DaemonEvent) {
        let topic = event.topic();
        let envelope = EventEnvelope {
            kind: "event",
            timestamp: now_millis(),
            event: topic.to_owned(),
            data: event.payload(),
        };
        let text = match serde_json::to_string(&envelope) {
            Ok(text) => text,
            Err(err) => {
                log::error!("failed to serialize event {}: {}", topic, err);
                return;
            }
        };
        let message = Message::Text(text);

        let targets: Vec<(Uuid, mpsc::UnboundedSender<Message>)> = {
            let clients = self.clients.read().await;
            clients
                .iter()
                .filter(|(_, client)| {
                    client.subscriptions.contains(topic) || client.subscriptions.contains("*")
                })
                .map(|(id, client)| (*id, client.sender.clone()))
                .collect()
        };

        let mut dead = Vec::new();
        for (id, sender) in targets {
            if sender.send(message.clone()).is_err() {
                dead.push(id);
            }
        }
        if !dead.is_empty() {
            let mut clients = self.clients.write().await;
            for id in dead {
                clients.remove(&id);
            }
        }
    }

    /// Spawns the heartbeat sweeper: every `heartbeat_interval`, pings every
    /// client and evicts any whose last `pong` predates `client_timeout`.
    pub fn start_heartbeat(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.heartbeat_interval);
            loop {
                interval.tick().await;
                self.heartbeat_tick().await;
            }
        });
    }

    async fn heartbeat_tick(&self) {
        let message = Message::Text(json!({"type": "ping", "timestamp": now_millis()}).to_string());

        let (evicted, to_ping): (Vec<Uuid>, Vec<(Uuid, mpsc::UnboundedSender<Message>)>) = {
            let clients = self.clients.read().await;
            let mut evicted = Vec::new();
            let mut to_ping = Vec::new();
            for (id, client) in clients.iter() {
                if client.last_pong.elapsed() > self.client_timeout {
                    evicted.push(*id);
                } else {
                    to_ping.push((*id, client.sender.clone()));
                }
            }
            (evicted, to_ping)
        };

        if !evicted.is_empty() {
            let mut clients = self.clients.write().await;
            for id in &evicted {
                clients.remove(id);
            }
        }
        for id in &evicted {
            log::debug!("evicting client {} after heartbeat timeout", id);
        }

        let now = Instant::now();
        for (id, sender) in to_ping {
            if sender.send(message.clone()).is_ok() {
                if let Some(client) = self.clients.write().await.get_mut(&id) {
                    client.last_ping_sent = Some(now);
                }
            }
        }
    }

    pub async fn health_snapshot(&self) -> HealthSnapshot {
        let clients = self.clients.read().await;
        let timeout = self.client_timeout;
        let alive = clients
            .values()
            .filter(|client| client.last_pong.elapsed() <= timeout)
            .count();
        let latencies: Vec<u64> = clients.values().filter_map(|client| client.rtt_ms).collect();
        let avg_latency = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<u64>() as f64 / latencies.len() as f64
        };
        HealthSnapshot {
            clients: clients.len(),
            alive_clients: alive,
            avg_latency,
            timestamp: now_millis(),
        }
    }

    /// Closes every client connection (daemon shutdown sequence, §4.4).
    pub async fn cleanup(&self) {
        let mut clients = self.clients.write().await;
        for (_, client) in clients.drain() {
            let _ = client.sender.send(Message::Close(None));
        }
    }
}

fn now_millis() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp() * 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recv_text(rx: &mut mpsc::UnboundedReceiver<Message>) -> String {
        match rx.try_recv().expect("expected a queued message") {
            Message::Text(text) => text,
            other => panic!("expected a text message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn register_then_unregister_drops_client() {
        let manager = ConnectionManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = manager.register(tx).await;
        assert_eq!(manager.health_snapshot().await.clients, 1);
        manager.unregister(id).await;
        assert_eq!(manager.health_snapshot().await.clients, 0);
    }

    #[tokio::test]
    async fn broadcast_only_reaches_subscribed_clients() {
        let manager = ConnectionManager::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = manager.register(tx_a).await;
        let _b = manager.register(tx_b).await;

        manager.subscribe(a, vec!["server.deleted".to_owned()]).await;
        manager
            .broadcast(DaemonEvent::ServerDeleted { id: Uuid::nil() })
            .await;

        let text = recv_text(&mut rx_a);
        assert!(text.contains("\"event\":\"server.deleted\""));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn wildcard_subscription_receives_every_topic() {
        let manager = ConnectionManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = manager.register(tx).await;
        manager.subscribe(id, vec!["*".to_owned()]).await;

        manager.broadcast(DaemonEvent::ServerShutdown).await;
        let text = recv_text(&mut rx);
        assert!(text.contains("\"event\":\"server.shutdown\""));
    }

    #[tokio::test]
    async fn unsubscribe_removes_a_single_topic() {
        let manager = ConnectionManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = manager.register(tx).await;
        manager
            .subscribe(id, vec!["server.deleted".to_owned(), "server.shutdown".to_owned()])
            .await;
        manager.unsubscribe(id, vec!["server.deleted".to_owned()]).await;

        manager
            .broadcast(DaemonEvent::ServerDeleted { id: Uuid::nil() })
            .await;
        assert!(rx.try_recv().is_err());

        manager.broadcast(DaemonEvent::ServerShutdown).await;
        assert!(recv_text(&mut rx).contains("server.shutdown"));
    }

    #[tokio::test]
    async fn send_to_disconnected_client_is_a_no_op() {
        let manager = ConnectionManager::new();
        let response = ResponseEnvelope::ok(Uuid::nil().to_string(), 0, serde_json::Value::Null);
        manager.send_to(Uuid::new_v4(), response).await;
    }

    #[tokio::test]
    async fn record_pong_measures_round_trip() {
        let manager = ConnectionManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = manager.register(tx).await;
        manager.heartbeat_tick().await;
        manager.record_pong(id).await;
        let snapshot = manager.health_snapshot().await;
        assert_eq!(snapshot.alive_clients, 1);
    }

    #[tokio::test]
    async fn cleanup_closes_every_connection() {
        let manager = ConnectionManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.register(tx).await;
        manager.cleanup().await;
        assert!(matches!(rx.try_recv(), Ok(Message::Close(None))));
        assert_eq!(manager.health_snapshot().await.clients, 0);
    }
}
