use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::protocol::{CommandAction, CommandPayload, ServerMessage};
use crate::server::node_broadcaster::NodeEventBroadcaster;
use crate::server::registry::{ConnectionRegistry, deliver};
use crate::store::{DeviceType, FleetNode, NodeStore, StoreError};

#[derive(Error, Debug)]
pub enum DispatcherError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),
    #[error("Node is not bound to remote control: {0}")]
    NodeNotBound(String),
    #[error("Node not connected: {0}")]
    NodeNotConnected(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Who a command is addressed to.
#[derive(Clone, Debug)]
pub enum CommandTarget {
    Node(String),
    Nodes(Vec<String>),
    AllBound,
}

/// Pushes command envelopes to live node connections. Lookups go through the
/// connection registry only, so dispatch never waits on store writes
/// happening elsewhere.
#[derive(Clone)]
pub struct CommandDispatcher {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn NodeStore>,
    configs: Arc<RwLock<serde_json::Value>>,
    broadcaster: NodeEventBroadcaster,
}

impl CommandDispatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn NodeStore>,
        configs: Arc<RwLock<serde_json::Value>>,
        broadcaster: NodeEventBroadcaster,
    ) -> Self {
        Self {
            registry,
            store,
            configs,
            broadcaster,
        }
    }

    /// Resolves the target set and pushes the command to every bound node
    /// with a live connection. Unbound or disconnected nodes contribute 0 to
    /// the count; deciding whether 0 is an error is the caller's job (the
    /// single-node operations below treat it as one).
    pub async fn dispatch(
        &self,
        target: CommandTarget,
        command: CommandPayload,
    ) -> Result<usize, DispatcherError> {
        let nodes: Vec<FleetNode> = match target {
            CommandTarget::Node(system_id) => {
                self.store.get_node(&system_id).await?.into_iter().collect()
            }
            CommandTarget::Nodes(system_ids) => {
                let mut nodes = Vec::with_capacity(system_ids.len());
                for system_id in system_ids {
                    if let Some(node) = self.store.get_node(&system_id).await? {
                        nodes.push(node);
                    }
                }
                nodes
            }
            CommandTarget::AllBound => self
                .store
                .list_nodes()
                .await?
                .into_iter()
                .filter(|node| node.bound)
                .collect(),
        };

        let mut delivered = 0;
        for node in nodes {
            if !node.bound {
                debug!(system_id = %node.system_id, "Skipping unbound node for command dispatch.");
                continue;
            }
            let Some(sender) = self.registry.sender_for_node(&node.system_id) else {
                debug!(system_id = %node.system_id, "Skipping node with no live connection.");
                continue;
            };
            let mut payload = command.clone();
            match payload.action {
                CommandAction::ConfigUpdate => {
                    payload.configs = Some(self.configs.read().await.clone());
                }
                CommandAction::DeviceEnable | CommandAction::DeviceDisable => {
                    // Attach the current snapshot so the client reconciles
                    // idempotently.
                    payload.devices = Some(node.devices.clone());
                }
                _ => {}
            }
            if deliver(&sender, ServerMessage::Command(payload)).await {
                delivered += 1;
            } else {
                warn!(system_id = %node.system_id, "Command lost: connection writer already gone.");
            }
        }
        Ok(delivered)
    }

    pub async fn restart(&self, system_id: &str) -> Result<usize, DispatcherError> {
        self.command_node(system_id, CommandPayload::new(CommandAction::Restart))
            .await
    }

    pub async fn stop(&self, system_id: &str) -> Result<usize, DispatcherError> {
        self.command_node(system_id, CommandPayload::new(CommandAction::Stop))
            .await
    }

    pub async fn start(
        &self,
        system_id: &str,
        device_type: Option<DeviceType>,
    ) -> Result<usize, DispatcherError> {
        let mut payload = CommandPayload::new(CommandAction::Start);
        payload.device_type = device_type;
        self.command_node(system_id, payload).await
    }

    /// Persists the sticky `enabled` flag and dispatches the enable/disable
    /// command. Disabling a device that is currently running also sends a
    /// best-effort stop whose delivery does not gate the toggle result.
    pub async fn toggle_device(
        &self,
        system_id: &str,
        device_type: DeviceType,
        enabled: bool,
        gpu_id: Option<usize>,
    ) -> Result<usize, DispatcherError> {
        let was_running = {
            let node = self
                .store
                .get_node(system_id)
                .await?
                .ok_or_else(|| DispatcherError::NodeNotFound(system_id.to_owned()))?;
            if !node.bound {
                return Err(DispatcherError::NodeNotBound(system_id.to_owned()));
            }
            match (device_type, gpu_id) {
                (DeviceType::Cpu, _) => node.devices.cpu.running,
                (DeviceType::Gpu, Some(id)) => {
                    node.devices.gpus.get(id).is_some_and(|g| g.running)
                }
                (DeviceType::Gpu, None) => node.devices.gpus.iter().any(|g| g.running),
            }
        };

        let node = self
            .store
            .update_node(
                system_id,
                Box::new(move |node| {
                    match (device_type, gpu_id) {
                        (DeviceType::Cpu, _) => node.devices.cpu.enabled = enabled,
                        (DeviceType::Gpu, Some(id)) => {
                            if let Some(gpu) = node.devices.gpus.get_mut(id) {
                                gpu.enabled = enabled;
                            }
                        }
                        (DeviceType::Gpu, None) => {
                            for gpu in &mut node.devices.gpus {
                                gpu.enabled = enabled;
                            }
                        }
                    }
                    node.recompute_status();
                }),
            )
            .await?;
        self.broadcaster.node_status_update(&node);

        let action = if enabled {
            CommandAction::DeviceEnable
        } else {
            CommandAction::DeviceDisable
        };
        let mut payload = CommandPayload::new(action);
        payload.device_type = Some(device_type);
        payload.gpu_id = gpu_id;
        payload.enabled = Some(enabled);
        let delivered = self
            .dispatch(CommandTarget::Node(system_id.to_owned()), payload)
            .await?;
        if delivered == 0 {
            return Err(DispatcherError::NodeNotConnected(system_id.to_owned()));
        }

        if !enabled && was_running {
            let stop_action = match device_type {
                DeviceType::Cpu => CommandAction::StopCpu,
                DeviceType::Gpu => CommandAction::StopGpu,
            };
            let mut stop = CommandPayload::new(stop_action);
            stop.gpu_id = gpu_id;
            let follow_up = self
                .dispatch(CommandTarget::Node(system_id.to_owned()), stop)
                .await;
            if let Err(e) = follow_up {
                warn!(%system_id, error = %e, "Best-effort stop after disable was not delivered.");
            }
        }

        Ok(delivered)
    }

    /// Pushes the current global configuration set to every bound node.
    /// Zero delivered is fine here: an empty or fully offline fleet is not
    /// an error for a broadcast.
    pub async fn push_configs(&self) -> Result<usize, DispatcherError> {
        let delivered = self
            .dispatch(
                CommandTarget::AllBound,
                CommandPayload::new(CommandAction::ConfigUpdate),
            )
            .await?;
        info!(delivered, "Pushed config update to bound nodes.");
        Ok(delivered)
    }

    async fn command_node(
        &self,
        system_id: &str,
        payload: CommandPayload,
    ) -> Result<usize, DispatcherError> {
        let node = self
            .store
            .get_node(system_id)
            .await?
            .ok_or_else(|| DispatcherError::NodeNotFound(system_id.to_owned()))?;
        if !node.bound {
            return Err(DispatcherError::NodeNotBound(system_id.to_owned()));
        }
        let delivered = self
            .dispatch(CommandTarget::Node(system_id.to_owned()), payload)
            .await?;
        if delivered == 0 {
            // Callers must be able to distinguish "accepted but offline"
            // from "succeeded".
            return Err(DispatcherError::NodeNotConnected(system_id.to_owned()));
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::sync::mpsc;

    use super::*;
    use crate::server::registry::Outbound;
    use crate::store::{DeviceState, GpuDeviceState, MemoryStore};

    fn addr() -> SocketAddr {
        "10.0.0.1:4000".parse().unwrap()
    }

    async fn setup() -> (CommandDispatcher, Arc<ConnectionRegistry>, Arc<MemoryStore>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let configs = Arc::new(RwLock::new(serde_json::json!({"pool": "stratum+tcp://x"})));
        let dispatcher = CommandDispatcher::new(
            registry.clone(),
            store.clone(),
            configs,
            NodeEventBroadcaster::new(16),
        );
        (dispatcher, registry, store)
    }

    async fn seed_node(store: &MemoryStore, system_id: &str, bound: bool) {
        store
            .update_or_insert_node(
                system_id,
                Box::new(move |node, _| {
                    node.bound = bound;
                    node.devices = DeviceState {
                        gpus: vec![GpuDeviceState::fresh(0, "RTX 3080".to_owned())],
                        ..DeviceState::default()
                    };
                }),
            )
            .await
            .unwrap();
    }

    fn connect(registry: &ConnectionRegistry, system_id: &str) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(16);
        let connection_id = registry.register(tx, addr());
        registry.bind(connection_id, system_id).unwrap();
        rx
    }

    async fn next_command(rx: &mut mpsc::Receiver<Outbound>) -> CommandPayload {
        match rx.recv().await.unwrap() {
            Outbound::Message(ServerMessage::Command(payload)) => payload,
            other => panic!("expected a command, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dispatch_to_unbound_node_delivers_nothing() {
        let (dispatcher, registry, store) = setup().await;
        seed_node(&store, "AA:BB", false).await;
        let _rx = connect(&registry, "AA:BB");

        let delivered = dispatcher
            .dispatch(
                CommandTarget::Node("AA:BB".to_owned()),
                CommandPayload::new(CommandAction::Stop),
            )
            .await
            .unwrap();
        assert_eq!(delivered, 0);

        // The single-node operation surfaces it as an explicit failure.
        let err = dispatcher.stop("AA:BB").await.unwrap_err();
        assert!(matches!(err, DispatcherError::NodeNotBound(_)));
    }

    #[tokio::test]
    async fn dispatch_to_connected_bound_node_delivers_one() {
        let (dispatcher, registry, store) = setup().await;
        seed_node(&store, "AA:BB", true).await;
        let mut rx = connect(&registry, "AA:BB");

        let delivered = dispatcher.restart("AA:BB").await.unwrap();
        assert_eq!(delivered, 1);
        let command = next_command(&mut rx).await;
        assert_eq!(command.action, CommandAction::Restart);
    }

    #[tokio::test]
    async fn bound_but_disconnected_node_is_a_visible_failure() {
        let (dispatcher, _registry, store) = setup().await;
        seed_node(&store, "AA:BB", true).await;

        let err = dispatcher.stop("AA:BB").await.unwrap_err();
        assert!(matches!(err, DispatcherError::NodeNotConnected(_)));
    }

    #[tokio::test]
    async fn config_update_attaches_the_global_config_payload() {
        let (dispatcher, registry, store) = setup().await;
        seed_node(&store, "AA:BB", true).await;
        let mut rx = connect(&registry, "AA:BB");

        let delivered = dispatcher.push_configs().await.unwrap();
        assert_eq!(delivered, 1);
        let command = next_command(&mut rx).await;
        assert_eq!(command.action, CommandAction::ConfigUpdate);
        assert_eq!(command.configs.unwrap()["pool"], "stratum+tcp://x");
    }

    #[tokio::test]
    async fn disabling_a_running_gpu_sends_disable_then_stop() {
        let (dispatcher, registry, store) = setup().await;
        seed_node(&store, "AA:BB", true).await;
        store
            .update_node(
                "AA:BB",
                Box::new(|node| {
                    node.devices.gpus[0].running = true;
                }),
            )
            .await
            .unwrap();
        let mut rx = connect(&registry, "AA:BB");

        let delivered = dispatcher
            .toggle_device("AA:BB", DeviceType::Gpu, false, None)
            .await
            .unwrap();
        assert_eq!(delivered, 1);

        let disable = next_command(&mut rx).await;
        assert_eq!(disable.action, CommandAction::DeviceDisable);
        assert_eq!(disable.enabled, Some(false));
        assert!(disable.devices.is_some(), "snapshot attached for idempotent reconcile");

        let stop = next_command(&mut rx).await;
        assert_eq!(stop.action, CommandAction::StopGpu);

        // The sticky flag is persisted server-side.
        let node = store.get_node("AA:BB").await.unwrap().unwrap();
        assert!(!node.devices.gpus[0].enabled);
    }

    #[tokio::test]
    async fn all_bound_target_skips_unbound_nodes() {
        let (dispatcher, registry, store) = setup().await;
        seed_node(&store, "AA:BB", true).await;
        seed_node(&store, "CC:DD", false).await;
        let mut rx_bound = connect(&registry, "AA:BB");
        let _rx_unbound = connect(&registry, "CC:DD");

        let delivered = dispatcher
            .dispatch(
                CommandTarget::AllBound,
                CommandPayload::new(CommandAction::Stop),
            )
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(next_command(&mut rx_bound).await.action, CommandAction::Stop);
    }
}
