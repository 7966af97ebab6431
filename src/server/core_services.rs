//! Inbound message processing for node connections. Transport adapters
//! (WebSocket, test harnesses) feed raw JSON frames into
//! [`process_node_stream`], which owns the connection's lifecycle from
//! registration through the single shared disconnect path.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::Stream;
use tokio::sync::RwLock;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::protocol::{
    ClientMessage, HashratePayload, RawEnvelope, RegisterPayload, ServerMessage,
    StatusUpdatePayload, TransportError,
};
use crate::server::node_broadcaster::NodeEventBroadcaster;
use crate::server::reconciler::{apply_hashrate, normalize_gpus, reconcile_devices};
use crate::server::registry::{ConnectionRegistry, NodeSender, Outbound, RegistryError, deliver};
use crate::store::{FleetNode, HashrateSample, NodeStore, StoreError};

/// Raw inbound frames from one node connection.
pub trait NodeStream: Stream<Item = Result<String, TransportError>> + Send {}

impl<S> NodeStream for S where S: Stream<Item = Result<String, TransportError>> + Send {}

/// Shared state and channels needed by the stream processor.
#[derive(Clone)]
pub struct NodeStreamContext {
    pub registry: Arc<ConnectionRegistry>,
    pub store: Arc<dyn NodeStore>,
    pub broadcaster: NodeEventBroadcaster,
    /// Current global configuration set, pushed to nodes on registration and
    /// on `config-update` commands.
    pub configs: Arc<RwLock<serde_json::Value>>,
    pub hashrate_retention: usize,
}

/// Drives one node connection: registers it, routes every inbound message,
/// and runs the disconnect path when the stream ends for any reason.
pub async fn process_node_stream<S>(
    stream: S,
    sender: NodeSender,
    remote_addr: SocketAddr,
    context: Arc<NodeStreamContext>,
) where
    S: NodeStream,
{
    tokio::pin!(stream);

    let connection_id = context.registry.register(sender.clone(), remote_addr);
    info!(%connection_id, %remote_addr, "Node connection established.");
    deliver(&sender, ServerMessage::Connected { connection_id }).await;

    // Set once registration completes; gates all node-scoped messages.
    let mut bound_node: Option<String> = None;

    while let Some(result) = stream.next().await {
        match result {
            Ok(text) => {
                context.registry.touch(connection_id);

                let envelope = match serde_json::from_str::<RawEnvelope>(&text) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(%connection_id, error = %e, "Discarding frame that is not a message envelope.");
                        deliver(
                            &sender,
                            ServerMessage::Error {
                                message: format!("Invalid message envelope: {e}"),
                            },
                        )
                        .await;
                        continue;
                    }
                };
                let message = match ClientMessage::from_envelope(envelope) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(%connection_id, error = %e, "Protocol fault on node connection.");
                        deliver(
                            &sender,
                            ServerMessage::Error {
                                message: e.to_string(),
                            },
                        )
                        .await;
                        continue;
                    }
                };

                match message {
                    ClientMessage::Register(payload) => {
                        match handle_register(&context, connection_id, remote_addr, &sender, payload)
                            .await
                        {
                            Ok(Some(system_id)) => bound_node = Some(system_id),
                            Ok(None) => {
                                // Connection died mid-handshake; the stream
                                // will end on its own.
                            }
                            Err(e) => {
                                error!(%connection_id, error = %e, "Registration failed.");
                                deliver(
                                    &sender,
                                    ServerMessage::Error {
                                        message: format!("Registration failed: {e}"),
                                    },
                                )
                                .await;
                            }
                        }
                    }
                    ClientMessage::StatusUpdate(payload) => {
                        if let Some(system_id) = &bound_node {
                            handle_status_update(&context, system_id, payload).await;
                        } else {
                            warn!(%connection_id, "Ignoring status-update before registration.");
                        }
                    }
                    ClientMessage::HashrateUpdate(payload) => {
                        if let Some(system_id) = &bound_node {
                            handle_hashrate_update(&context, system_id, payload).await;
                        } else {
                            warn!(%connection_id, "Ignoring hashrate-update before registration.");
                        }
                    }
                    ClientMessage::Heartbeat => {
                        if let Some(system_id) = &bound_node {
                            let result = context
                                .store
                                .update_node(
                                    system_id,
                                    Box::new(|node| {
                                        node.last_seen = Utc::now();
                                    }),
                                )
                                .await;
                            if let Err(e) = result {
                                error!(%connection_id, error = %e, "Failed to persist heartbeat.");
                            }
                        }
                        deliver(&sender, ServerMessage::Pong {}).await;
                    }
                    ClientMessage::RequestConfigs => {
                        let configs = context.configs.read().await.clone();
                        deliver(&sender, ServerMessage::ConfigUpdate { configs }).await;
                    }
                    ClientMessage::Unbound(payload) => {
                        if let Some(system_id) = &bound_node {
                            if *system_id != payload.system_id {
                                warn!(
                                    %connection_id,
                                    claimed = %payload.system_id,
                                    bound = %system_id,
                                    "Unbind request for a different node; using the bound id."
                                );
                            }
                            handle_unbound(&context, system_id, &sender).await;
                        } else {
                            warn!(%connection_id, "Ignoring unbind before registration.");
                        }
                    }
                    ClientMessage::Unknown(message_type) => {
                        // Forward compatibility: future node software may
                        // send types we do not know yet.
                        debug!(%connection_id, %message_type, "Acknowledging unknown message type.");
                        deliver(&sender, ServerMessage::Pong {}).await;
                    }
                }
            }
            Err(e) => {
                warn!(%connection_id, error = %e, "Transport error on node connection.");
                break;
            }
        }
    }

    handle_disconnect(&context, connection_id).await;
    info!(%connection_id, "Node connection task finished.");
}

/// Registration handshake: fetch-or-create the node record, normalize the
/// hardware report, reconcile device state, persist, bind the live
/// connection, then claim the record for it. Returns the bound system id, or
/// `None` when the connection vanished or was superseded mid-handshake.
async fn handle_register(
    context: &NodeStreamContext,
    connection_id: Uuid,
    remote_addr: SocketAddr,
    sender: &NodeSender,
    payload: RegisterPayload,
) -> Result<Option<String>, StoreError> {
    let system_id = payload.system_id.clone();
    let silent = payload.silent;

    let canonical_gpus = normalize_gpus(&payload.hardware_report.gpus);
    let mut hardware = payload.hardware_report;
    hardware.gpus = canonical_gpus.clone();
    let report = payload.devices;
    let remote = remote_addr.to_string();

    context
        .store
        .update_or_insert_node(
            &system_id,
            Box::new(move |node, inserted| {
                let persisted = if inserted {
                    None
                } else {
                    Some(node.devices.clone())
                };
                node.devices =
                    reconcile_devices(persisted.as_ref(), report.as_ref(), &canonical_gpus);
                if let Some(hostname) = hardware.hostname.clone() {
                    if node.name == node.system_id {
                        node.name = hostname.clone();
                    }
                    node.hostname = Some(hostname);
                }
                if let Some(os) = hardware.os.clone() {
                    node.os = Some(os);
                }
                node.hardware = hardware;
                node.remote_addr = Some(remote);
                // Registering is itself consent to remote control.
                node.bound = true;
                node.last_seen = Utc::now();
            }),
        )
        .await?;

    match context.registry.bind(connection_id, &system_id) {
        Ok(superseded) => {
            if let Some(previous) = superseded {
                info!(%system_id, old_connection = %previous, "New registration supersedes a previous session.");
                if let Some(old_sender) = context.registry.sender_for_connection(previous) {
                    let _ = old_sender.try_send(Outbound::Close);
                }
            }
        }
        Err(RegistryError::ConnectionGone(_)) => {
            // Client disconnected between persist and bind. The record never
            // held this connection id, so there is nothing to roll back and
            // no connected event to announce.
            warn!(%system_id, %connection_id, "Connection vanished mid-handshake; leaving the node offline.");
            return Ok(None);
        }
    }

    let node = claim_node_connection(context, &system_id, connection_id).await?;
    if node.connection_id != Some(connection_id) {
        // Another registration for the same node bound in the meantime; the
        // winner announces itself and this connection will be closed.
        warn!(%system_id, %connection_id, "Registration superseded mid-handshake.");
        return Ok(None);
    }

    let configs = context.configs.read().await.clone();
    let reply = if silent {
        ServerMessage::Registered {
            node: Box::new(node.clone()),
            configs,
        }
    } else {
        ServerMessage::Bound {
            node: Box::new(node.clone()),
            configs,
        }
    };
    deliver(sender, reply).await;
    context.broadcaster.node_connected(&node);
    info!(%system_id, %connection_id, silent, "Node registered.");

    Ok(Some(system_id))
}

/// Writes the live connection id into the node record, but only while the
/// registry index still points at this connection. Two registrations for the
/// same node can interleave between persist and bind; a write from the losing
/// one must not overwrite the winner's mapping, and its own stale id is
/// cleared instead. The registry check runs inside the store closure, under
/// the per-node lock. `connection_id` and `status` change together.
pub async fn claim_node_connection(
    context: &NodeStreamContext,
    system_id: &str,
    connection_id: Uuid,
) -> Result<FleetNode, StoreError> {
    let registry = context.registry.clone();
    let owner = system_id.to_owned();
    context
        .store
        .update_node(
            system_id,
            Box::new(move |node| {
                if registry.node_connection(&owner) == Some(connection_id) {
                    node.connection_id = Some(connection_id);
                } else if node.connection_id == Some(connection_id) {
                    node.connection_id = None;
                }
                node.recompute_status();
            }),
        )
        .await
}

async fn handle_status_update(
    context: &NodeStreamContext,
    system_id: &str,
    payload: StatusUpdatePayload,
) {
    let report = payload.devices;
    let result = context
        .store
        .update_node(
            system_id,
            Box::new(move |node| {
                let persisted = node.devices.clone();
                let canonical_gpus = node.hardware.gpus.clone();
                node.devices =
                    reconcile_devices(Some(&persisted), report.as_ref(), &canonical_gpus);
                node.last_seen = Utc::now();
                node.recompute_status();
            }),
        )
        .await;
    match result {
        Ok(node) => context.broadcaster.node_status_update(&node),
        // Failed writes are not broadcast: observers must never see a
        // snapshot the store does not hold.
        Err(e) => error!(%system_id, error = %e, "Failed to persist status update."),
    }
}

async fn handle_hashrate_update(
    context: &NodeStreamContext,
    system_id: &str,
    payload: HashratePayload,
) {
    let sample = HashrateSample {
        time: Utc::now(),
        device_type: payload.device_type,
        algorithm: payload.algorithm.clone(),
        hashrate: payload.hashrate,
    };
    if let Err(e) = context
        .store
        .append_hashrate(system_id, sample, context.hashrate_retention)
        .await
    {
        error!(%system_id, error = %e, "Failed to append hashrate sample.");
    }

    let device_type = payload.device_type;
    let algorithm = payload.algorithm;
    let hashrate = payload.hashrate;
    let result = context
        .store
        .update_node(
            system_id,
            Box::new(move |node| {
                apply_hashrate(&mut node.devices, device_type, &algorithm, hashrate);
                node.last_seen = Utc::now();
                node.recompute_status();
            }),
        )
        .await;
    match result {
        Ok(node) => context.broadcaster.node_status_update(&node),
        Err(e) => error!(%system_id, error = %e, "Failed to fold hashrate into device state."),
    }
}

async fn handle_unbound(context: &NodeStreamContext, system_id: &str, sender: &NodeSender) {
    let result = context
        .store
        .update_node(
            system_id,
            Box::new(|node| {
                node.bound = false;
            }),
        )
        .await;
    match result {
        Ok(node) => {
            deliver(sender, ServerMessage::Unbound {}).await;
            context.broadcaster.node_unbound(&node);
            info!(%system_id, "Node unbound from remote control.");
            // The transport stays open; the client usually disconnects on
            // its own afterwards.
        }
        Err(e) => error!(%system_id, error = %e, "Failed to persist unbind."),
    }
}

/// The single disconnect path shared by clean close, transport error, and
/// the reaper. Idempotent: the registry's close-once guard makes repeat
/// calls no-ops. Clears `connection_id` and recomputes `status` in one
/// atomic store update.
pub async fn handle_disconnect(context: &NodeStreamContext, connection_id: Uuid) {
    let Some(closed) = context.registry.begin_close(connection_id) else {
        return;
    };
    info!(%connection_id, remote_addr = %closed.remote_addr, "Node connection closed.");

    let Some(system_id) = closed.node_id else {
        return;
    };
    let result = context
        .store
        .update_node(
            &system_id,
            Box::new(move |node| {
                if node.connection_id == Some(connection_id) {
                    node.connection_id = None;
                    node.recompute_status();
                }
            }),
        )
        .await;
    match result {
        Ok(node) => {
            if node.connection_id.is_none() {
                context.broadcaster.node_disconnected(&node);
            }
            // Otherwise a newer session already owns the record; nothing to
            // announce.
        }
        Err(e) => {
            error!(%system_id, error = %e, "Failed to persist disconnect; not broadcasting.");
        }
    }
}

/// Background sweep that force-closes connections that stopped
/// communicating. Reaped connections go through the same disconnect path as
/// a normal close.
pub fn spawn_reaper(
    context: Arc<NodeStreamContext>,
    sweep_interval: Duration,
    stale_threshold: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let threshold_ms = i64::try_from(stale_threshold.as_millis()).unwrap_or(i64::MAX);
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            let now_ms = Utc::now().timestamp_millis();
            for connection_id in context.registry.stale_connections(now_ms, threshold_ms) {
                warn!(%connection_id, "Reaping stale connection.");
                if let Some(sender) = context.registry.sender_for_connection(connection_id) {
                    let _ = sender.try_send(Outbound::Close);
                }
                handle_disconnect(&context, connection_id).await;
            }
        }
    })
}
