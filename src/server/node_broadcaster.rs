use tokio::sync::broadcast;
use tracing::debug;

use crate::protocol::WsMessage;
use crate::store::FleetNode;

/// Fan-out of node state changes to dashboard observers. The reconciler and
/// message handlers publish here and never call presentation code directly;
/// each dashboard WebSocket holds its own subscription.
#[derive(Clone, Debug)]
pub struct NodeEventBroadcaster {
    tx: broadcast::Sender<WsMessage>,
}

impl NodeEventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WsMessage> {
        self.tx.subscribe()
    }

    pub fn node_connected(&self, node: &FleetNode) {
        self.send(WsMessage::NodeConnected(Box::new(node.clone())));
    }

    pub fn node_disconnected(&self, node: &FleetNode) {
        self.send(WsMessage::NodeDisconnected(Box::new(node.clone())));
    }

    pub fn node_status_update(&self, node: &FleetNode) {
        self.send(WsMessage::NodeStatusUpdate(Box::new(node.clone())));
    }

    pub fn node_unbound(&self, node: &FleetNode) {
        self.send(WsMessage::NodeUnbound(Box::new(node.clone())));
    }

    fn send(&self, message: WsMessage) {
        if let Err(e) = self.tx.send(message) {
            // No subscribers is the normal idle state, keep it quiet.
            debug!("No dashboard observers for node event: {e}");
        }
    }
}
