use std::net::SocketAddr;

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::ServerMessage;

/// One item in a connection's outbound queue. `Close` tells the writer task
/// to drop the transport, used when a new registration supersedes an old
/// session or the reaper kills a silent one.
#[derive(Debug, Clone)]
pub enum Outbound {
    Message(ServerMessage),
    Close,
}

/// Outbound handle for one node connection. Messages queued here are drained
/// by the connection's writer task.
pub type NodeSender = mpsc::Sender<Outbound>;

/// Queues a message on a node connection. `false` means the connection's
/// writer is gone and nothing was delivered.
pub async fn deliver(sender: &NodeSender, message: ServerMessage) -> bool {
    sender.send(Outbound::Message(message)).await.is_ok()
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Connection {0} is gone")]
    ConnectionGone(Uuid),
}

#[derive(Debug)]
struct ConnectionEntry {
    sender: NodeSender,
    remote_addr: SocketAddr,
    last_seen_ms: i64,
    /// Set once registration completes.
    node_id: Option<String>,
    /// Close-once guard: whichever of close, transport error, or reap gets
    /// here first wins; the others see a closed entry and back off.
    closed: bool,
}

/// Snapshot handed to the disconnect path by [`ConnectionRegistry::begin_close`].
#[derive(Debug)]
pub struct ClosedConnection {
    pub connection_id: Uuid,
    pub node_id: Option<String>,
    pub remote_addr: SocketAddr,
}

/// Process-wide map of live node connections. This is the only shared
/// mutable structure besides the durable store; feature code goes through
/// register/touch/bind/begin_close and never read-modify-writes entries
/// directly. Lookups never touch the store, so dispatch stays fast while
/// persistence is slow elsewhere.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<Uuid, ConnectionEntry>,
    by_node: DashMap<String, Uuid>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sender: NodeSender, remote_addr: SocketAddr) -> Uuid {
        let connection_id = Uuid::new_v4();
        self.connections.insert(
            connection_id,
            ConnectionEntry {
                sender,
                remote_addr,
                last_seen_ms: Utc::now().timestamp_millis(),
                node_id: None,
                closed: false,
            },
        );
        connection_id
    }

    /// Refreshes the freshness stamp. Called for every inbound message, not
    /// only explicit heartbeats.
    pub fn touch(&self, connection_id: Uuid) {
        if let Some(mut entry) = self.connections.get_mut(&connection_id) {
            entry.last_seen_ms = Utc::now().timestamp_millis();
        }
    }

    /// Associates a registered connection with its node id. Returns the id
    /// of any superseded connection for the same node so the caller can
    /// close it. Fails when the connection disappeared mid-handshake; the
    /// caller must abort rather than resurrect a dead mapping.
    pub fn bind(&self, connection_id: Uuid, system_id: &str) -> Result<Option<Uuid>, RegistryError> {
        let mut entry = self
            .connections
            .get_mut(&connection_id)
            .ok_or(RegistryError::ConnectionGone(connection_id))?;
        entry.node_id = Some(system_id.to_owned());
        drop(entry);

        let previous = self.by_node.insert(system_id.to_owned(), connection_id);
        Ok(previous.filter(|prev| *prev != connection_id))
    }

    /// Connection currently mapped to a node, if any.
    pub fn node_connection(&self, system_id: &str) -> Option<Uuid> {
        self.by_node.get(system_id).map(|entry| *entry)
    }

    pub fn sender_for_node(&self, system_id: &str) -> Option<NodeSender> {
        let connection_id = *self.by_node.get(system_id)?;
        self.connections
            .get(&connection_id)
            .map(|entry| entry.sender.clone())
    }

    pub fn sender_for_connection(&self, connection_id: Uuid) -> Option<NodeSender> {
        self.connections
            .get(&connection_id)
            .map(|entry| entry.sender.clone())
    }

    pub fn remote_addr(&self, connection_id: Uuid) -> Option<SocketAddr> {
        self.connections
            .get(&connection_id)
            .map(|entry| entry.remote_addr)
    }

    /// Marks the connection closed and removes it from the maps. Returns
    /// `None` when another path already closed it, which is what makes the
    /// disconnect logic run exactly once whether triggered by a clean close,
    /// a transport error, or the reaper.
    pub fn begin_close(&self, connection_id: Uuid) -> Option<ClosedConnection> {
        let (node_id, remote_addr) = {
            let mut entry = self.connections.get_mut(&connection_id)?;
            if entry.closed {
                return None;
            }
            entry.closed = true;
            (entry.node_id.clone(), entry.remote_addr)
        };
        self.connections.remove(&connection_id);
        if let Some(system_id) = &node_id {
            // Only unmap if the index still points at this connection; a new
            // registration may have superseded it already.
            self.by_node
                .remove_if(system_id, |_, mapped| *mapped == connection_id);
        }
        Some(ClosedConnection {
            connection_id,
            node_id,
            remote_addr,
        })
    }

    /// Connections silent for longer than `threshold_ms`, as of `now_ms`.
    pub fn stale_connections(&self, now_ms: i64, threshold_ms: i64) -> Vec<Uuid> {
        self.connections
            .iter()
            .filter(|entry| now_ms - entry.last_seen_ms > threshold_ms)
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    fn sender() -> NodeSender {
        mpsc::channel(8).0
    }

    #[test]
    fn bind_supersedes_previous_connection_for_same_node() {
        let registry = ConnectionRegistry::new();
        let first = registry.register(sender(), addr());
        let second = registry.register(sender(), addr());

        assert_eq!(registry.bind(first, "AA:BB").unwrap(), None);
        assert_eq!(registry.bind(second, "AA:BB").unwrap(), Some(first));
        // The live lookup now resolves to the second connection.
        assert!(registry.sender_for_node("AA:BB").is_some());
    }

    #[test]
    fn bind_fails_for_a_connection_that_already_closed() {
        let registry = ConnectionRegistry::new();
        let connection_id = registry.register(sender(), addr());
        registry.begin_close(connection_id).unwrap();
        assert!(registry.bind(connection_id, "AA:BB").is_err());
    }

    #[test]
    fn begin_close_runs_exactly_once() {
        let registry = ConnectionRegistry::new();
        let connection_id = registry.register(sender(), addr());
        registry.bind(connection_id, "AA:BB").unwrap();

        let closed = registry.begin_close(connection_id).unwrap();
        assert_eq!(closed.node_id.as_deref(), Some("AA:BB"));
        assert!(registry.begin_close(connection_id).is_none());
        assert!(registry.sender_for_node("AA:BB").is_none());
    }

    #[test]
    fn close_of_superseded_connection_keeps_new_mapping() {
        let registry = ConnectionRegistry::new();
        let first = registry.register(sender(), addr());
        let second = registry.register(sender(), addr());
        registry.bind(first, "AA:BB").unwrap();
        registry.bind(second, "AA:BB").unwrap();

        registry.begin_close(first);
        assert!(registry.sender_for_node("AA:BB").is_some());
    }

    #[test]
    fn stale_scan_picks_only_quiet_connections() {
        let registry = ConnectionRegistry::new();
        let quiet = registry.register(sender(), addr());
        let chatty = registry.register(sender(), addr());

        let now = Utc::now().timestamp_millis();
        // Backdate the quiet connection past the threshold.
        registry
            .connections
            .get_mut(&quiet)
            .unwrap()
            .last_seen_ms = now - 100_000;
        registry.touch(chatty);

        let stale = registry.stale_connections(now, 90_000);
        assert_eq!(stale, vec![quiet]);
    }
}
