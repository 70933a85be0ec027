use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use rewind_core::ConnectionId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broker::RelayBroker;
use crate::registry::Role;
use crate::router;

/// A connected WebSocket peer.
pub struct Connection {
    pub id: ConnectionId,
    pub role: Role,
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
    last_pong: AtomicU64,
}

impl Connection {
    fn new(id: ConnectionId, role: Role, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            role,
            tx,
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < timeout.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Every live connection on both endpoints, with its outbound queue.
pub struct ConnectionHub {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    max_send_queue: usize,
}

impl ConnectionHub {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            connections: DashMap::new(),
            max_send_queue,
        }
    }

    pub fn register(&self, role: Role) -> (ConnectionId, mpsc::Receiver<String>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue.max(1));
        self.connections
            .insert(id.clone(), Arc::new(Connection::new(id.clone(), role, tx)));
        (id, rx)
    }

    /// Returns whether the connection was still registered.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        match self.connections.remove(id) {
            Some((_, conn)) => {
                conn.connected.store(false, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|c| Arc::clone(c.value()))
    }

    /// Queue `message` for `id` without waiting. A full queue drops the message.
    pub fn send_to(&self, id: &ConnectionId, message: String) -> bool {
        let Some(conn) = self.get(id) else {
            return false;
        };
        if !conn.is_connected() {
            return false;
        }
        match conn.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(
                    connection_id = %id,
                    msg_len = msg.len(),
                    "send queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn count_role(&self, role: Role) -> usize {
        self.connections.iter().filter(|c| c.role == role).count()
    }

    /// Drop connections that have not answered a ping within `timeout`.
    pub fn cleanup_dead(&self, timeout: Duration) -> Vec<ConnectionId> {
        let dead: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|c| !c.is_alive(timeout))
            .map(|c| c.id.clone())
            .collect();
        for id in &dead {
            self.unregister(id);
            tracing::info!(connection_id = %id, "cleaned up dead connection");
        }
        dead
    }
}

pub struct ConnectionContext {
    pub id: ConnectionId,
    pub role: Role,
    pub hub: Arc<ConnectionHub>,
    pub broker: Arc<RelayBroker>,
    pub heartbeat_interval: Duration,
    pub shutdown: CancellationToken,
}

/// Run one WebSocket connection until either side closes.
///
/// Inbound frames are routed one at a time, in arrival order. Replies and
/// forwarded frames share the connection's bounded send queue.
pub async fn handle_ws_connection(socket: WebSocket, mut rx: mpsc::Receiver<String>, ctx: ConnectionContext) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let ConnectionContext {
        id,
        role,
        hub,
        broker,
        heartbeat_interval,
        shutdown,
    } = ctx;

    let writer_id = id.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat_interval);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(connection_id = %writer_id, "sent ping");
                }
            }
        }
        let _ = ws_tx.send(WsMessage::Close(None)).await;
    });

    let reader_id = id.clone();
    let reader_hub = Arc::clone(&hub);
    let reader_broker = Arc::clone(&broker);
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    if let Some(reply) = router::route(&reader_broker, &reader_id, role, text.as_str()) {
                        match reply.to_text() {
                            Ok(json) => {
                                reader_hub.send_to(&reader_id, json);
                            }
                            Err(e) => tracing::warn!(error = %e, "failed to encode completion"),
                        }
                    }
                }
                WsMessage::Pong(_) => {
                    if let Some(conn) = reader_hub.get(&reader_id) {
                        conn.record_pong();
                    }
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
        () = shutdown.cancelled() => {
            reader.abort();
            writer.abort();
        }
    }

    hub.unregister(&id);
    broker.disconnect(&id);
    tracing::info!(connection_id = %id, role = %role, "connection closed");
}

/// Periodically sweep connections that stopped answering pings.
pub fn start_cleanup_task(
    hub: Arc<ConnectionHub>,
    broker: Arc<RelayBroker>,
    interval: Duration,
    timeout: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = hub.cleanup_dead(timeout);
                    for id in &removed {
                        broker.disconnect(id);
                    }
                    if !removed.is_empty() {
                        tracing::info!(removed = removed.len(), "dead connection cleanup");
                    }
                }
                () = shutdown.cancelled() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister() {
        let hub = ConnectionHub::new(32);
        assert_eq!(hub.count(), 0);

        let (a, _rx1) = hub.register(Role::App);
        let (b, _rx2) = hub.register(Role::Inspector);
        assert_eq!(hub.count(), 2);
        assert_eq!(hub.count_role(Role::App), 1);
        assert_eq!(hub.count_role(Role::Inspector), 1);

        assert!(hub.unregister(&a));
        assert!(!hub.unregister(&a));
        assert_eq!(hub.count(), 1);
        hub.unregister(&b);
        assert_eq!(hub.count(), 0);
    }

    #[tokio::test]
    async fn send_to_specific_connection() {
        let hub = ConnectionHub::new(32);
        let (id, mut rx) = hub.register(Role::App);
        assert!(hub.send_to(&id, "hello".into()));
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[test]
    fn send_to_unknown_connection() {
        let hub = ConnectionHub::new(32);
        assert!(!hub.send_to(&ConnectionId::new(), "x".into()));
    }

    #[test]
    fn full_queue_drops() {
        let hub = ConnectionHub::new(2);
        let (id, _rx) = hub.register(Role::Inspector);
        assert!(hub.send_to(&id, "1".into()));
        assert!(hub.send_to(&id, "2".into()));
        assert!(!hub.send_to(&id, "3".into()));
    }

    #[test]
    fn cleanup_removes_silent_connections() {
        let hub = ConnectionHub::new(8);
        let (stale, _rx1) = hub.register(Role::App);
        let (_fresh, _rx2) = hub.register(Role::App);
        hub.get(&stale).unwrap().last_pong.store(0, Ordering::Relaxed);

        let removed = hub.cleanup_dead(Duration::from_secs(90));
        assert_eq!(removed, vec![stale]);
        assert_eq!(hub.count(), 1);
    }

    #[test]
    fn pong_keeps_connection_alive() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = Connection::new(ConnectionId::new(), Role::App, tx);
        conn.last_pong.store(0, Ordering::Relaxed);
        assert!(!conn.is_alive(Duration::from_secs(90)));
        conn.record_pong();
        assert!(conn.is_alive(Duration::from_secs(90)));
    }
}
