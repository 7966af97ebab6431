//! Wire protocol between the coordinator, its mining nodes, and dashboard
//! observers. Everything is a JSON envelope `{type, data?}` in both
//! directions.
//!
//! Inbound messages are first read as a [`RawEnvelope`] and then narrowed to
//! the closed [`ClientMessage`] variants, so an unknown `type` degrades to a
//! lightweight acknowledgment instead of a deserialization error. Legacy
//! field spellings from older node software are accepted through
//! `#[serde(alias)]` here at the boundary only; handlers never see them.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::store::{DeviceState, DeviceType, FleetNode, HardwareInfo};

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed payload for '{message_type}': {source}")]
    MalformedPayload {
        message_type: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Message '{0}' requires a data payload")]
    MissingData(String),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

/// The untyped envelope as it arrives off the wire.
#[derive(Deserialize, Debug)]
pub struct RawEnvelope {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub system_id: String,
    #[serde(alias = "hardware")]
    pub hardware_report: HardwareInfo,
    #[serde(default)]
    pub devices: Option<DeviceReport>,
    /// True for an automatic reconnect, false for an explicit user action.
    #[serde(default)]
    pub silent: bool,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// Node-self-reported device block. Every field is optional: older clients
/// send sparse updates and the reconciler keeps persisted values for
/// anything omitted.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeviceReport {
    #[serde(default)]
    pub cpu: Option<CpuReport>,
    #[serde(default)]
    pub gpus: Option<Vec<GpuReport>>,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct CpuReport {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub running: Option<bool>,
    #[serde(default, alias = "hashRate")]
    pub hashrate: Option<f64>,
    #[serde(default, alias = "algo")]
    pub algorithm: Option<String>,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct GpuReport {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub running: Option<bool>,
    #[serde(default, alias = "hashRate")]
    pub hashrate: Option<f64>,
    #[serde(default, alias = "algo")]
    pub algorithm: Option<String>,
}

/// `stats`, `systemInfo`, and `miners` are accepted for wire compatibility
/// with node software that still sends them; only `devices` is folded into
/// the node record.
#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdatePayload {
    #[serde(default)]
    pub devices: Option<DeviceReport>,
    #[serde(default)]
    pub stats: Option<serde_json::Value>,
    #[serde(default)]
    pub system_info: Option<serde_json::Value>,
    #[serde(default)]
    pub miners: Option<serde_json::Value>,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct HashratePayload {
    #[serde(alias = "device")]
    pub device_type: DeviceType,
    #[serde(alias = "algo")]
    pub algorithm: String,
    #[serde(alias = "rate")]
    pub hashrate: f64,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UnboundPayload {
    pub system_id: String,
}

/// Closed set of node-to-server messages.
#[derive(Debug)]
pub enum ClientMessage {
    Register(RegisterPayload),
    StatusUpdate(StatusUpdatePayload),
    HashrateUpdate(HashratePayload),
    Heartbeat,
    RequestConfigs,
    Unbound(UnboundPayload),
    /// Unrecognized `type`. Not an error: unknown messages are acknowledged
    /// with a `pong` to stay forward compatible with newer node software.
    Unknown(String),
}

impl ClientMessage {
    pub fn from_envelope(envelope: RawEnvelope) -> Result<Self, ProtocolError> {
        fn payload<T: serde::de::DeserializeOwned>(
            message_type: &str,
            data: Option<serde_json::Value>,
        ) -> Result<T, ProtocolError> {
            let data = data.ok_or_else(|| ProtocolError::MissingData(message_type.to_owned()))?;
            serde_json::from_value(data).map_err(|source| ProtocolError::MalformedPayload {
                message_type: message_type.to_owned(),
                source,
            })
        }

        let message_type = envelope.message_type;
        let data = envelope.data;
        match message_type.as_str() {
            "register" => Ok(Self::Register(payload(&message_type, data)?)),
            // "status_update" is the legacy spelling kept for older clients.
            "status-update" | "status_update" => {
                Ok(Self::StatusUpdate(payload(&message_type, data)?))
            }
            "hashrate-update" | "hashrate_update" => {
                Ok(Self::HashrateUpdate(payload(&message_type, data)?))
            }
            "heartbeat" => Ok(Self::Heartbeat),
            "request-configs" | "request_configs" => Ok(Self::RequestConfigs),
            "unbound" => Ok(Self::Unbound(payload(&message_type, data)?)),
            other => Ok(Self::Unknown(other.to_owned())),
        }
    }
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CommandAction {
    Restart,
    Stop,
    Start,
    StopCpu,
    StopGpu,
    DeviceEnable,
    DeviceDisable,
    ConfigUpdate,
}

/// Command envelope pushed to one node over its live connection.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CommandPayload {
    pub action: CommandAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_type: Option<DeviceType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_id: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Current device snapshot, attached to enable/disable commands so the
    /// client can reconcile idempotently.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub devices: Option<DeviceState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configs: Option<serde_json::Value>,
}

impl CommandPayload {
    pub fn new(action: CommandAction) -> Self {
        Self {
            action,
            device_type: None,
            gpu_id: None,
            enabled: None,
            devices: None,
            configs: None,
        }
    }
}

/// Server-to-node messages.
#[derive(Serialize, Clone, Debug)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "kebab-case")]
pub enum ServerMessage {
    Connected {
        #[serde(rename = "connectionId")]
        connection_id: Uuid,
    },
    /// Reply to a silent re-registration.
    Registered {
        node: Box<FleetNode>,
        configs: serde_json::Value,
    },
    /// Reply to an explicit bind.
    Bound {
        node: Box<FleetNode>,
        configs: serde_json::Value,
    },
    ConfigUpdate {
        configs: serde_json::Value,
    },
    Command(CommandPayload),
    Unbound {},
    Error {
        message: String,
    },
    Pong {},
}

#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct FullNodeListPush {
    pub nodes: Vec<FleetNode>,
}

/// Server-to-dashboard messages, each carrying the full node snapshot.
#[derive(Serialize, Clone, Debug)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum WsMessage {
    FullNodeList(FullNodeListPush),
    NodeConnected(Box<FleetNode>),
    NodeDisconnected(Box<FleetNode>),
    NodeStatusUpdate(Box<FleetNode>),
    NodeUnbound(Box<FleetNode>),
}
