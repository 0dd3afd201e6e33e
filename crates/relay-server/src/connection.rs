use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use relay_core::errors::PushError;
use relay_core::ids::ConnectionId;
use relay_core::registry::ConnectionRegistry;
use relay_core::wire::OutboundMessage;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(90);

/// Frames queued for a connection's writer task.
#[derive(Debug, PartialEq, Eq)]
pub enum Outgoing {
    Text(String),
    Close,
}

/// A live WebSocket connection.
struct Connection {
    tx: mpsc::Sender<Outgoing>,
    connected_at: DateTime<Utc>,
    last_pong: AtomicU64,
}

impl Connection {
    fn new(tx: mpsc::Sender<Outgoing>) -> Self {
        Self {
            tx,
            connected_at: Utc::now(),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    fn is_alive(&self) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < CLIENT_TIMEOUT.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Connections owned by the embedded gateway.
///
/// Each connection has a bounded queue drained by its writer task. Pushes
/// wait for queue space rather than dropping, so frames arrive in push order.
pub struct LocalRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    max_send_queue: usize,
}

impl LocalRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            connections: DashMap::new(),
            max_send_queue: max_send_queue.max(1),
        }
    }

    /// Register a new connection and return its id + outgoing queue.
    pub fn register(&self) -> (ConnectionId, mpsc::Receiver<Outgoing>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        self.connections.insert(id.clone(), Arc::new(Connection::new(tx)));
        (id, rx)
    }

    /// Forget a connection. Returns false if it was already gone.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        self.connections.remove(id).is_some()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Number of open connections.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn connected_at(&self, id: &ConnectionId) -> Option<DateTime<Utc>> {
        self.connections.get(id).map(|c| c.connected_at)
    }

    pub fn record_pong(&self, id: &ConnectionId) {
        if let Some(conn) = self.connections.get(id) {
            conn.record_pong();
        }
    }

    /// Queue raw text for a connection.
    pub async fn send_text(&self, id: &ConnectionId, text: String) -> Result<(), PushError> {
        let tx = match self.connections.get(id) {
            Some(conn) => conn.tx.clone(),
            None => return Err(PushError::Gone),
        };
        if tx.send(Outgoing::Text(text)).await.is_err() {
            // Writer task has exited; the peer is gone
            self.unregister(id);
            return Err(PushError::Gone);
        }
        Ok(())
    }

    /// Remove a connection and ask its writer to close the socket.
    pub async fn close(&self, id: &ConnectionId) -> Result<(), PushError> {
        let conn = match self.connections.remove(id) {
            Some((_, conn)) => conn,
            None => return Err(PushError::Gone),
        };
        let _ = conn.tx.send(Outgoing::Close).await;
        tracing::info!(connection_id = %id, "Connection deleted");
        Ok(())
    }

    /// Remove connections that haven't responded to pings within the timeout.
    pub fn cleanup_dead_connections(&self) -> usize {
        let dead: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| !entry.value().is_alive())
            .map(|entry| entry.key().clone())
            .collect();

        for id in &dead {
            if let Some((_, conn)) = self.connections.remove(id) {
                let _ = conn.tx.try_send(Outgoing::Close);
            }
            tracing::info!(connection_id = %id, "Cleaned up dead connection");
        }
        dead.len()
    }
}

#[async_trait]
impl ConnectionRegistry for LocalRegistry {
    async fn push(
        &self,
        connection_id: &ConnectionId,
        message: &OutboundMessage,
    ) -> Result<(), PushError> {
        self.send_text(connection_id, message.to_json()).await
    }

    async fn delete(&self, connection_id: &ConnectionId) -> Result<(), PushError> {
        self.close(connection_id).await
    }
}

/// Handle a WebSocket connection: split into reader/writer, manage lifecycle with heartbeat.
pub async fn handle_ws_connection(
    socket: WebSocket,
    connection_id: ConnectionId,
    mut rx: mpsc::Receiver<Outgoing>,
    registry: Arc<LocalRegistry>,
    on_message: mpsc::Sender<(ConnectionId, String)>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer task: forward queued frames to the socket + periodic ping
    let writer_id = connection_id.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(Outgoing::Text(text)) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        Some(Outgoing::Close) | None => {
                            let _ = ws_tx.send(WsMessage::Close(None)).await;
                            break;
                        }
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(connection_id = %writer_id, "Sent ping");
                }
            }
        }
    });

    // Reader task: forward text frames to the dispatcher, track pongs
    let reader_id = connection_id.clone();
    let reader_registry = Arc::clone(&registry);
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    if on_message.send((reader_id.clone(), text.as_str().to_string())).await.is_err() {
                        break;
                    }
                }
                WsMessage::Pong(_) => reader_registry.record_pong(&reader_id),
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    if registry.unregister(&connection_id) {
        tracing::info!(connection_id = %connection_id, "WebSocket client disconnected");
    }
}

/// Start a background task that periodically cleans up dead connections.
pub fn start_cleanup_task(
    registry: Arc<LocalRegistry>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = registry.cleanup_dead_connections();
            if removed > 0 {
                tracing::info!(removed = removed, "Dead connection cleanup");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister() {
        let registry = LocalRegistry::new(32);
        assert_eq!(registry.count(), 0);

        let (id1, _rx1) = registry.register();
        let (id2, _rx2) = registry.register();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
        assert_eq!(registry.count(), 2);
        assert!(registry.connected_at(&id1).is_some());

        assert!(registry.unregister(&id1));
        assert!(!registry.unregister(&id1));
        assert_eq!(registry.count(), 1);
        assert!(registry.contains(&id2));
    }

    #[tokio::test]
    async fn push_serializes_frames_in_order() {
        let registry = LocalRegistry::new(32);
        let (id, mut rx) = registry.register();

        registry.push(&id, &OutboundMessage::content("Hi")).await.unwrap();
        registry.push(&id, &OutboundMessage::content(" there")).await.unwrap();
        registry.push(&id, &OutboundMessage::Done).await.unwrap();

        assert_eq!(rx.recv().await, Some(Outgoing::Text(r#"{"message":"Hi"}"#.into())));
        assert_eq!(rx.recv().await, Some(Outgoing::Text(r#"{"message":" there"}"#.into())));
        assert_eq!(rx.recv().await, Some(Outgoing::Text(r#"{"type":"done"}"#.into())));
    }

    #[tokio::test]
    async fn push_to_unknown_connection_is_gone() {
        let registry = LocalRegistry::new(32);
        let err = registry
            .push(&ConnectionId::new(), &OutboundMessage::Done)
            .await
            .unwrap_err();
        assert!(err.is_gone());
    }

    #[tokio::test]
    async fn push_after_writer_exit_is_gone() {
        let registry = LocalRegistry::new(32);
        let (id, rx) = registry.register();
        drop(rx);

        let err = registry.send_text(&id, "x".into()).await.unwrap_err();
        assert!(err.is_gone());
        assert!(!registry.contains(&id));
    }

    #[tokio::test]
    async fn full_queue_waits_instead_of_dropping() {
        let registry = Arc::new(LocalRegistry::new(1));
        let (id, mut rx) = registry.register();

        registry.send_text(&id, "first".into()).await.unwrap();
        let pusher = {
            let registry = Arc::clone(&registry);
            let id = id.clone();
            tokio::spawn(async move { registry.send_text(&id, "second".into()).await })
        };

        assert_eq!(rx.recv().await, Some(Outgoing::Text("first".into())));
        assert_eq!(rx.recv().await, Some(Outgoing::Text("second".into())));
        assert!(pusher.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn delete_closes_once_then_gone() {
        let registry = LocalRegistry::new(32);
        let (id, mut rx) = registry.register();

        registry.delete(&id).await.unwrap();
        assert_eq!(rx.recv().await, Some(Outgoing::Close));

        let err = registry.delete(&id).await.unwrap_err();
        assert_eq!(err, PushError::Gone);
    }

    #[test]
    fn cleanup_dead_connections_removes_expired() {
        let registry = LocalRegistry::new(32);
        let (id, _rx) = registry.register();
        let (live, _live_rx) = registry.register();

        if let Some(conn) = registry.connections.get(&id) {
            conn.last_pong.store(0, Ordering::Relaxed);
        }
        registry.record_pong(&live);

        assert_eq!(registry.cleanup_dead_connections(), 1);
        assert!(!registry.contains(&id));
        assert!(registry.contains(&live));
    }
}
