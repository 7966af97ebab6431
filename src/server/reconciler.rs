//! Device-state reconciliation: the single place where persisted state,
//! node-self-reported state, and fresh hardware discovery are merged. Every
//! inbound path (register, status-update, hashrate-update) goes through
//! these functions; none of them reimplement the precedence rules.

use tracing::debug;

use crate::protocol::DeviceReport;
use crate::store::{CpuDeviceState, DeviceState, DeviceType, GpuDeviceState, GpuInfo};

/// Adapters with less dedicated VRAM than this are not mining-eligible.
const MIN_GPU_VRAM_MB: u64 = 1024;

/// Model substrings that mark integrated or virtual adapters.
const INELIGIBLE_MODEL_MARKERS: &[&str] = &[
    "integrated",
    "iris",
    "uhd graphics",
    "hd graphics",
    "vega 3",
    "vega 8",
    "microsoft basic",
    "virtio",
    "vmware",
    "virtualbox",
    "hyper-v",
    "parsec",
];

fn gpu_is_eligible(gpu: &GpuInfo) -> bool {
    let vendor = gpu.vendor.to_lowercase();
    let model = gpu.model.to_lowercase();

    if INELIGIBLE_MODEL_MARKERS.iter().any(|m| model.contains(m)) {
        return false;
    }
    // Intel iGPUs slip through the model markers on some drivers; discrete
    // Arc cards are the only Intel adapters we accept.
    if vendor.contains("intel") && !model.contains("arc") {
        return false;
    }
    // A reported VRAM size below the floor disqualifies; zero means the node
    // could not read it, which we tolerate for discrete vendors.
    if gpu.vram_mb > 0 && gpu.vram_mb < MIN_GPU_VRAM_MB {
        return false;
    }
    true
}

/// Produces the canonical GPU list from a raw hardware report: ineligible
/// adapters dropped, duplicates (same vendor+model) collapsed to the first
/// occurrence, report order preserved. The output order is the index
/// assignment used to address per-GPU commands, so the same input must
/// always yield the same output.
pub fn normalize_gpus(raw: &[GpuInfo]) -> Vec<GpuInfo> {
    let mut seen: Vec<(String, String)> = Vec::new();
    let mut normalized = Vec::new();
    for gpu in raw {
        if !gpu_is_eligible(gpu) {
            debug!(vendor = %gpu.vendor, model = %gpu.model, "Dropping ineligible GPU from report");
            continue;
        }
        let key = (gpu.vendor.to_lowercase(), gpu.model.to_lowercase());
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        normalized.push(gpu.clone());
    }
    normalized
}

/// Merge rule per device, by stable index:
/// - `enabled` is sticky policy: persisted wins, else node-reported, else
///   `true`. A reconnect alone never flips it.
/// - `running`/`hashrate`/`algorithm` are point-in-time facts: the freshest
///   node-reported value wins; persisted values are kept only where the
///   report omits the field.
/// - `gpus` follows the canonical hardware list: zero eligible GPUs clears
///   the array, newly appearing GPUs get fresh entries with `enabled=true`.
///
/// `persisted` is `None` for a node record that was just created.
pub fn reconcile_devices(
    persisted: Option<&DeviceState>,
    reported: Option<&DeviceReport>,
    canonical_gpus: &[GpuInfo],
) -> DeviceState {
    let reported_cpu = reported.and_then(|r| r.cpu.as_ref());
    let persisted_cpu = persisted.map(|p| &p.cpu);

    let cpu = CpuDeviceState {
        enabled: persisted_cpu
            .map(|c| c.enabled)
            .or_else(|| reported_cpu.and_then(|c| c.enabled))
            .unwrap_or(true),
        running: reported_cpu
            .and_then(|c| c.running)
            .or_else(|| persisted_cpu.map(|c| c.running))
            .unwrap_or(false),
        hashrate: reported_cpu
            .and_then(|c| c.hashrate)
            .or_else(|| persisted_cpu.map(|c| c.hashrate))
            .unwrap_or(0.0),
        algorithm: reported_cpu
            .and_then(|c| c.algorithm.clone())
            .or_else(|| persisted_cpu.and_then(|c| c.algorithm.clone())),
    };

    let reported_gpus = reported.and_then(|r| r.gpus.as_ref());
    let gpus = canonical_gpus
        .iter()
        .enumerate()
        .map(|(id, hw)| {
            let persisted_gpu = persisted.and_then(|p| p.gpus.get(id));
            let reported_gpu = reported_gpus.and_then(|v| v.get(id));
            GpuDeviceState {
                id,
                model: hw.model.clone(),
                enabled: persisted_gpu
                    .map(|g| g.enabled)
                    .or_else(|| reported_gpu.and_then(|g| g.enabled))
                    .unwrap_or(true),
                running: reported_gpu
                    .and_then(|g| g.running)
                    .or_else(|| persisted_gpu.map(|g| g.running))
                    .unwrap_or(false),
                hashrate: reported_gpu
                    .and_then(|g| g.hashrate)
                    .or_else(|| persisted_gpu.map(|g| g.hashrate))
                    .unwrap_or(0.0),
                algorithm: reported_gpu
                    .and_then(|g| g.algorithm.clone())
                    .or_else(|| persisted_gpu.and_then(|g| g.algorithm.clone())),
            }
        })
        .collect();

    DeviceState { cpu, gpus }
}

/// Folds one telemetry sample into the live device snapshot. An aggregate
/// "gpu" rate without per-GPU breakdown is written to GPU slot 0 only, so a
/// fleet-wide sum never double-counts it; dashboards must treat that slot as
/// the aggregate, not a per-card value.
pub fn apply_hashrate(
    devices: &mut DeviceState,
    device_type: DeviceType,
    algorithm: &str,
    hashrate: f64,
) {
    match device_type {
        DeviceType::Cpu => {
            devices.cpu.running = true;
            devices.cpu.hashrate = hashrate;
            devices.cpu.algorithm = Some(algorithm.to_owned());
        }
        DeviceType::Gpu => {
            if let Some(slot) = devices.gpus.first_mut() {
                slot.running = true;
                slot.hashrate = hashrate;
                slot.algorithm = Some(algorithm.to_owned());
            } else {
                debug!("Dropping GPU hashrate sample for a node with no eligible GPUs");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CpuReport, GpuReport};

    fn gpu(vendor: &str, model: &str, vram_mb: u64) -> GpuInfo {
        GpuInfo {
            vendor: vendor.to_owned(),
            model: model.to_owned(),
            vram_mb,
        }
    }

    #[test]
    fn normalization_filters_integrated_virtual_and_small_adapters() {
        let raw = vec![
            gpu("intel", "Intel UHD Graphics 630", 128),
            gpu("nvidia", "RTX 3080", 10240),
            gpu("microsoft", "Microsoft Basic Display Adapter", 0),
            gpu("amd", "Radeon RX 550", 512),
        ];
        let normalized = normalize_gpus(&raw);
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized[0].model, "RTX 3080");
    }

    #[test]
    fn normalization_is_deterministic_for_index_stability() {
        let raw = vec![
            gpu("nvidia", "RTX 3080", 10240),
            gpu("nvidia", "RTX 3070", 8192),
        ];
        let first = normalize_gpus(&raw);
        let second = normalize_gpus(&raw);
        let pairs =
            |list: &[GpuInfo]| list.iter().map(|g| g.model.clone()).collect::<Vec<_>>();
        assert_eq!(pairs(&first), pairs(&second));
        assert_eq!(pairs(&first), vec!["RTX 3080", "RTX 3070"]);
    }

    #[test]
    fn normalization_deduplicates_by_vendor_and_model() {
        let raw = vec![
            gpu("nvidia", "RTX 3080", 10240),
            gpu("NVIDIA", "rtx 3080", 10240),
        ];
        assert_eq!(normalize_gpus(&raw).len(), 1);
    }

    #[test]
    fn intel_arc_counts_as_discrete() {
        let raw = vec![gpu("intel", "Arc A770", 16384)];
        assert_eq!(normalize_gpus(&raw).len(), 1);
    }

    #[test]
    fn persisted_enabled_survives_a_reconnect_report() {
        let persisted = DeviceState {
            cpu: CpuDeviceState::default(),
            gpus: vec![GpuDeviceState {
                enabled: false,
                ..GpuDeviceState::fresh(0, "RTX 3080".to_owned())
            }],
        };
        let report = DeviceReport {
            cpu: None,
            gpus: Some(vec![GpuReport {
                enabled: Some(true),
                running: Some(false),
                ..GpuReport::default()
            }]),
        };
        let hw = vec![gpu("nvidia", "RTX 3080", 10240)];

        let merged = reconcile_devices(Some(&persisted), Some(&report), &hw);
        assert!(!merged.gpus[0].enabled, "enabled flag must stay sticky");
    }

    #[test]
    fn reported_enabled_is_used_when_no_persisted_value_exists() {
        let report = DeviceReport {
            cpu: Some(CpuReport {
                enabled: Some(false),
                ..CpuReport::default()
            }),
            gpus: None,
        };
        let merged = reconcile_devices(None, Some(&report), &[]);
        assert!(!merged.cpu.enabled);
    }

    #[test]
    fn running_and_hashrate_always_track_the_report() {
        let persisted = DeviceState {
            cpu: CpuDeviceState {
                running: true,
                hashrate: 1200.0,
                algorithm: Some("randomx".to_owned()),
                ..CpuDeviceState::default()
            },
            gpus: vec![],
        };
        let report = DeviceReport {
            cpu: Some(CpuReport {
                running: Some(false),
                hashrate: Some(0.0),
                ..CpuReport::default()
            }),
            gpus: None,
        };
        let merged = reconcile_devices(Some(&persisted), Some(&report), &[]);
        assert!(!merged.cpu.running);
        assert_eq!(merged.cpu.hashrate, 0.0);
        // Omitted field keeps the persisted value.
        assert_eq!(merged.cpu.algorithm.as_deref(), Some("randomx"));
    }

    #[test]
    fn zero_eligible_gpus_clears_the_array() {
        let persisted = DeviceState {
            cpu: CpuDeviceState::default(),
            gpus: vec![GpuDeviceState::fresh(0, "RTX 3080".to_owned())],
        };
        let merged = reconcile_devices(Some(&persisted), None, &[]);
        assert!(merged.gpus.is_empty());
    }

    #[test]
    fn first_time_gpus_default_to_enabled() {
        let hw = vec![
            gpu("nvidia", "RTX 3080", 10240),
            gpu("nvidia", "RTX 3070", 8192),
        ];
        let merged = reconcile_devices(None, None, &hw);
        assert_eq!(merged.gpus.len(), 2);
        assert!(merged.gpus.iter().all(|g| g.enabled && !g.running));
        assert_eq!(merged.gpus[1].id, 1);
    }

    #[test]
    fn aggregate_gpu_hashrate_lands_in_slot_zero_only() {
        let mut devices = DeviceState {
            cpu: CpuDeviceState::default(),
            gpus: vec![
                GpuDeviceState::fresh(0, "RTX 3080".to_owned()),
                GpuDeviceState::fresh(1, "RTX 3070".to_owned()),
            ],
        };
        apply_hashrate(&mut devices, DeviceType::Gpu, "kawpow", 55_000_000.0);
        assert_eq!(devices.gpus[0].hashrate, 55_000_000.0);
        assert!(devices.gpus[0].running);
        assert_eq!(devices.gpus[1].hashrate, 0.0);
        assert!(!devices.gpus[1].running);
    }
}
