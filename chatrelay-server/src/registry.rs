//! Registry of live client connections.
//!
//! Requests never hold a connection directly: they carry a [`ConnectionId`]
//! that is resolved here at send time, so output for a connection that has
//! gone away is dropped without any explicit invalidation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chatrelay_core::{ConnectionId, ServerMessage};
use dashmap::DashMap;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::metrics;

/// A frame queued for a connection's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Text frame, sent as-is
    Text(String),
    /// Liveness probe
    Ping,
}

/// Registry-side state of one connection
struct Connection {
    alive: AtomicBool,
    outbound: mpsc::UnboundedSender<Outbound>,
    terminate: Arc<Notify>,
    connected_at: Instant,
}

/// What the socket task needs to serve a freshly registered connection
pub struct ConnectionHandle {
    pub id: ConnectionId,
    /// Frames to write to the socket, in order
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
    /// Fires when the heartbeat gives up on this connection
    pub terminated: Arc<Notify>,
}

/// Set of open connections
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection, initially alive
    pub fn register(&self) -> ConnectionHandle {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let terminate = Arc::new(Notify::new());

        self.connections.insert(
            id,
            Connection {
                alive: AtomicBool::new(true),
                outbound: tx,
                terminate: Arc::clone(&terminate),
                connected_at: Instant::now(),
            },
        );
        metrics::set_open_connections(self.connections.len());
        debug!(connection = %id, "Connection registered");

        ConnectionHandle { id, outbound: rx, terminated: terminate }
    }

    /// Remove a connection. Dropping its sender ends the writer task.
    ///
    /// Returns `false` if it was already gone.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        let removed = self.connections.remove(id);
        metrics::set_open_connections(self.connections.len());
        if let Some((_, conn)) = &removed {
            debug!(
                connection = %id,
                age_secs = conn.connected_at.elapsed().as_secs(),
                "Connection unregistered"
            );
        }
        removed.is_some()
    }

    /// Whether output can still be delivered to `id`
    pub fn is_open(&self, id: &ConnectionId) -> bool {
        self.connections
            .get(id)
            .is_some_and(|conn| !conn.outbound.is_closed())
    }

    /// Best-effort delivery; returns `false` if the connection is gone.
    pub fn send(&self, id: &ConnectionId, frame: Outbound) -> bool {
        match self.connections.get(id) {
            Some(conn) => conn.outbound.send(frame).is_ok(),
            None => false,
        }
    }

    /// Send one of the relay's own messages
    pub fn send_message(&self, id: &ConnectionId, message: &ServerMessage) -> bool {
        self.send(id, Outbound::Text(message.to_json()))
    }

    /// Record a pong from `id`
    pub fn mark_alive(&self, id: &ConnectionId) {
        if let Some(conn) = self.connections.get(id) {
            conn.alive.store(true, Ordering::Relaxed);
        }
    }

    /// One heartbeat round.
    ///
    /// Connections that did not answer the previous probe are terminated;
    /// the rest are marked pending and probed again. Returns the terminated ids.
    pub fn sweep(&self) -> Vec<ConnectionId> {
        let mut dead = Vec::new();
        for entry in self.connections.iter() {
            let conn = entry.value();
            if conn.alive.swap(false, Ordering::Relaxed) {
                let _ = conn.outbound.send(Outbound::Ping);
            } else {
                dead.push(*entry.key());
            }
        }

        for id in &dead {
            self.terminate(id);
        }
        dead
    }

    /// Forcibly drop a connection and wake its socket task so it runs the
    /// normal disconnect cleanup.
    pub fn terminate(&self, id: &ConnectionId) {
        if let Some((_, conn)) = self.connections.remove(id) {
            conn.terminate.notify_one();
            metrics::set_open_connections(self.connections.len());
            metrics::record_connection_terminated();
            warn!(connection = %id, "Terminated unresponsive connection");
        }
    }

    /// Number of open connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Close every connection (shutdown)
    pub fn clear(&self) {
        let count = self.connections.len();
        for entry in self.connections.iter() {
            entry.value().terminate.notify_one();
        }
        self.connections.clear();
        metrics::set_open_connections(0);
        if count > 0 {
            info!(count, "Closed all connections");
        }
    }
}
