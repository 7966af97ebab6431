pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Derived node status. Never set independently of the device states: use
/// [`FleetNode::recompute_status`] after any mutation of `devices` or
/// `connection_id`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
    Mining,
    Error,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Cpu,
    Gpu,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CpuInfo {
    pub model: String,
    #[serde(default)]
    pub cores: u32,
}

/// One physical adapter as reported by the node, before normalization.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GpuInfo {
    pub vendor: String,
    pub model: String,
    /// Dedicated VRAM in MiB. Zero when the node could not determine it.
    #[serde(default, alias = "vram")]
    pub vram_mb: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HardwareInfo {
    #[serde(default)]
    pub cpu: Option<CpuInfo>,
    #[serde(default)]
    pub gpus: Vec<GpuInfo>,
    #[serde(default)]
    pub ram_mb: u64,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CpuDeviceState {
    pub enabled: bool,
    pub running: bool,
    pub hashrate: f64,
    pub algorithm: Option<String>,
}

impl Default for CpuDeviceState {
    fn default() -> Self {
        Self {
            enabled: true,
            running: false,
            hashrate: 0.0,
            algorithm: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GpuDeviceState {
    /// Stable index into the normalized GPU list; the addressing key for
    /// per-GPU commands.
    pub id: usize,
    pub model: String,
    pub enabled: bool,
    pub running: bool,
    pub hashrate: f64,
    pub algorithm: Option<String>,
}

impl GpuDeviceState {
    pub fn fresh(id: usize, model: String) -> Self {
        Self {
            id,
            model,
            enabled: true,
            running: false,
            hashrate: 0.0,
            algorithm: None,
        }
    }
}

/// Per-node device snapshot. An empty `gpus` list means "no eligible
/// discrete GPU", not "all GPUs disabled".
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    pub cpu: CpuDeviceState,
    pub gpus: Vec<GpuDeviceState>,
}

impl DeviceState {
    pub fn any_running(&self) -> bool {
        self.cpu.running || self.gpus.iter().any(|g| g.running)
    }
}

/// One persisted document per fleet node, keyed by `system_id`.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct FleetNode {
    pub system_id: String,
    pub name: String,
    pub hostname: Option<String>,
    pub os: Option<String>,
    pub remote_addr: Option<String>,
    /// Administrative opt-in to remote control. Survives disconnects; only
    /// an explicit `unbound` message clears it.
    pub bound: bool,
    pub status: NodeStatus,
    /// Set only while a live connection exists. Always written together
    /// with `status` in the same store update.
    pub connection_id: Option<Uuid>,
    pub hardware: HardwareInfo,
    pub devices: DeviceState,
    pub mining_start_time: Option<DateTime<Utc>>,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FleetNode {
    pub fn new(system_id: &str) -> Self {
        let now = Utc::now();
        Self {
            system_id: system_id.to_owned(),
            name: system_id.to_owned(),
            hostname: None,
            os: None,
            remote_addr: None,
            bound: false,
            status: NodeStatus::Offline,
            connection_id: None,
            hardware: HardwareInfo::default(),
            devices: DeviceState::default(),
            mining_start_time: None,
            last_seen: now,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn connected(&self) -> bool {
        self.connection_id.is_some()
    }

    /// Re-derives `status` from the device running flags and connection
    /// presence, and keeps `mining_start_time` in step.
    pub fn recompute_status(&mut self) {
        self.status = if !self.connected() {
            NodeStatus::Offline
        } else if self.devices.any_running() {
            NodeStatus::Mining
        } else {
            NodeStatus::Online
        };
        if self.status == NodeStatus::Mining {
            if self.mining_start_time.is_none() {
                self.mining_start_time = Some(Utc::now());
            }
        } else {
            self.mining_start_time = None;
        }
    }

    pub fn uptime_seconds(&self) -> Option<i64> {
        self.mining_start_time
            .map(|start| (Utc::now() - start).num_seconds().max(0))
    }
}

/// One telemetry sample as appended to the store.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct HashrateSample {
    pub time: DateTime<Utc>,
    pub device_type: DeviceType,
    pub algorithm: String,
    pub hashrate: f64,
}

/// Read/write contract of the durable document store. The storage engine
/// itself is an external collaborator; the coordinator only relies on this
/// trait. `update_node` must serialize concurrent mutations of the same
/// node, which is what lets handler code on different connections touch the
/// same node without corrupting the merged device state.
#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn get_node(&self, system_id: &str) -> Result<Option<FleetNode>, StoreError>;

    async fn list_nodes(&self) -> Result<Vec<FleetNode>, StoreError>;

    /// Applies `mutate` to the node under a per-node lock and returns the
    /// updated snapshot. Fails with `NodeNotFound` for unknown ids.
    async fn update_node(
        &self,
        system_id: &str,
        mutate: Box<dyn for<'a> FnOnce(&'a mut FleetNode) + Send>,
    ) -> Result<FleetNode, StoreError>;

    /// Like `update_node`, but inserts a fresh record first when the id is
    /// unknown. Used by the registration path; the closure's second argument
    /// tells it whether the record was just created (a fresh record has no
    /// persisted device policy to preserve).
    async fn update_or_insert_node(
        &self,
        system_id: &str,
        mutate: Box<dyn for<'a> FnOnce(&'a mut FleetNode, bool) + Send>,
    ) -> Result<FleetNode, StoreError>;

    /// Appends a telemetry sample, evicting oldest-first beyond `cap`.
    async fn append_hashrate(
        &self,
        system_id: &str,
        sample: HashrateSample,
        cap: usize,
    ) -> Result<(), StoreError>;

    async fn hashrate_history(&self, system_id: &str) -> Result<Vec<HashrateSample>, StoreError>;
}
