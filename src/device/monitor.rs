use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{parse_free_memory, run_nvidia_smi, DeviceInventory};
use crate::config::ResourceSettings;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryReading {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl MemoryReading {
    pub fn available_gb(&self) -> f64 {
        self.available_bytes as f64 / BYTES_PER_GB
    }

    pub fn used_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        let used = self.total_bytes.saturating_sub(self.available_bytes);
        used as f64 * 100.0 / self.total_bytes as f64
    }
}

/// Source of raw utilization readings.
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    async fn system_memory(&self) -> Option<MemoryReading>;
    /// Free memory per device id, in MiB.
    async fn device_free_memory_mb(&self) -> HashMap<u32, u64>;
}

/// Reads `/proc/meminfo` and queries `nvidia-smi`.
pub struct HostProbe {
    nvidia_smi: String,
}

impl HostProbe {
    pub fn new(nvidia_smi: impl Into<String>) -> Self {
        Self {
            nvidia_smi: nvidia_smi.into(),
        }
    }
}

#[async_trait]
impl ResourceProbe for HostProbe {
    async fn system_memory(&self) -> Option<MemoryReading> {
        let content = tokio::fs::read_to_string("/proc/meminfo").await.ok()?;
        parse_meminfo(&content)
    }

    async fn device_free_memory_mb(&self) -> HashMap<u32, u64> {
        match run_nvidia_smi(&self.nvidia_smi, "index,memory.free").await {
            Ok(stdout) => parse_free_memory(&stdout).into_iter().collect(),
            Err(e) => {
                debug!("Device memory query failed: {}", e);
                HashMap::new()
            }
        }
    }
}

fn parse_meminfo(content: &str) -> Option<MemoryReading> {
    let mut total = None;
    let mut available = None;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = parse_kb(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = parse_kb(rest);
        }
        if total.is_some() && available.is_some() {
            break;
        }
    }
    Some(MemoryReading {
        total_bytes: total?,
        available_bytes: available?,
    })
}

fn parse_kb(value: &str) -> Option<u64> {
    let trimmed = value.trim();
    let numeric = trimmed.strip_suffix("kB").unwrap_or(trimmed).trim();
    numeric.parse::<u64>().ok().map(|kb| kb * 1024)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureThresholds {
    pub min_available_memory_gb: f64,
    pub max_memory_percent: f64,
    pub min_device_free_memory_gb: f64,
}

impl From<&ResourceSettings> for PressureThresholds {
    fn from(settings: &ResourceSettings) -> Self {
        Self {
            min_available_memory_gb: settings.min_available_memory_gb,
            max_memory_percent: settings.max_memory_percent,
            min_device_free_memory_gb: settings.min_device_free_memory_gb,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceSample {
    pub system_pressure: bool,
    pub per_device_pressure: BTreeMap<u32, bool>,
    pub memory_available_gb: Option<f64>,
    pub memory_percent: Option<f64>,
}

impl ResourceSample {
    pub fn under_pressure(&self) -> bool {
        self.system_pressure || self.per_device_pressure.values().any(|pressured| *pressured)
    }
}

/// Samples memory on demand and is the single writer of device liveness.
pub struct ResourceMonitor {
    inventory: Arc<DeviceInventory>,
    probe: Arc<dyn ResourceProbe>,
    thresholds: PressureThresholds,
}

impl ResourceMonitor {
    pub fn new(inventory: Arc<DeviceInventory>, probe: Arc<dyn ResourceProbe>, thresholds: PressureThresholds) -> Self {
        Self {
            inventory,
            probe,
            thresholds,
        }
    }

    pub fn inventory(&self) -> &Arc<DeviceInventory> {
        &self.inventory
    }

    pub async fn sample(&self) -> ResourceSample {
        let mut sample = ResourceSample::default();

        if let Some(memory) = self.probe.system_memory().await {
            let available_gb = memory.available_gb();
            let percent = memory.used_percent();
            sample.memory_available_gb = Some(available_gb);
            sample.memory_percent = Some(percent);
            sample.system_pressure =
                available_gb < self.thresholds.min_available_memory_gb || percent > self.thresholds.max_memory_percent;
            if sample.system_pressure {
                warn!("System memory pressure - Available: {:.2}GB, Used: {:.1}%", available_gb, percent);
            }
        }

        if !self.inventory.is_empty() {
            let free = self.probe.device_free_memory_mb().await;
            for device in self.inventory.devices() {
                let Some(free_mb) = free.get(&device.id) else {
                    continue;
                };
                let pressured = (*free_mb as f64 / 1024.0) < self.thresholds.min_device_free_memory_gb;
                sample.per_device_pressure.insert(device.id, pressured);
                if device.set_live(!pressured) {
                    if pressured {
                        warn!("GPU {} under memory pressure ({}MiB free), excluding from allocation", device.id, free_mb);
                    } else {
                        info!("GPU {} recovered ({}MiB free), available for allocation", device.id, free_mb);
                    }
                }
            }
        }

        sample
    }
}
