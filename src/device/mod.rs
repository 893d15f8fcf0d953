pub mod allocator;
pub mod monitor;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::process::Command;
use tracing::{info, warn};

pub use allocator::DeviceAllocator;
pub use monitor::{HostProbe, PressureThresholds, ResourceMonitor, ResourceProbe, ResourceSample};

const NVIDIA_SMI_TIMEOUT: Duration = Duration::from_secs(5);

/// An accelerator discovered at startup.
#[derive(Debug)]
pub struct Device {
    pub id: u32,
    pub name: String,
    pub total_memory_mb: u64,
    live: AtomicBool,
}

impl Device {
    pub fn new(id: u32, name: impl Into<String>, total_memory_mb: u64) -> Self {
        Self {
            id,
            name: name.into(),
            total_memory_mb,
            live: AtomicBool::new(true),
        }
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Returns true when the flag actually changed.
    pub fn set_live(&self, live: bool) -> bool {
        self.live.swap(live, Ordering::AcqRel) != live
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.id,
            name: self.name.clone(),
            total_memory_gb: self.total_memory_mb as f64 / 1024.0,
            live: self.is_live(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub id: u32,
    pub name: String,
    pub total_memory_gb: f64,
    pub live: bool,
}

/// Devices enumerated once at startup. Only liveness changes afterwards.
#[derive(Debug, Default)]
pub struct DeviceInventory {
    devices: Vec<Device>,
}

impl DeviceInventory {
    pub fn from_devices(devices: Vec<Device>) -> Self {
        Self { devices }
    }

    /// Enumerate accelerators through `nvidia-smi`. A missing or failing tool
    /// yields an empty inventory, meaning every job runs on the CPU path.
    pub async fn discover(nvidia_smi: &str) -> Self {
        match run_nvidia_smi(nvidia_smi, "index,name,memory.total").await {
            Ok(stdout) => {
                let devices = parse_device_listing(&stdout);
                for device in &devices {
                    info!("  GPU {}: {} ({:.1}GB)", device.id, device.name, device.total_memory_mb as f64 / 1024.0);
                }
                info!("Discovered {} accelerator device(s)", devices.len());
                Self { devices }
            }
            Err(e) => {
                info!("No accelerator devices detected ({}), using CPU path", e);
                Self::default()
            }
        }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn get(&self, id: u32) -> Option<&Device> {
        self.devices.iter().find(|device| device.id == id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Ids of devices currently marked live, in discovery order.
    pub fn live_ids(&self) -> Vec<u32> {
        self.devices
            .iter()
            .filter(|device| device.is_live())
            .map(|device| device.id)
            .collect()
    }

    pub fn info(&self) -> Vec<DeviceInfo> {
        self.devices.iter().map(Device::info).collect()
    }
}

pub(crate) async fn run_nvidia_smi(program: &str, fields: &str) -> Result<String> {
    let output = Command::new(program)
        .arg(format!("--query-gpu={}", fields))
        .arg("--format=csv,noheader,nounits")
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(NVIDIA_SMI_TIMEOUT, output)
        .await
        .map_err(|_| anyhow::anyhow!("{} timed out after {:?}", program, NVIDIA_SMI_TIMEOUT))??;

    if !output.status.success() {
        return Err(anyhow::anyhow!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parses `index, name, memory.total` rows (MiB, no header, no units).
fn parse_device_listing(stdout: &str) -> Vec<Device> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            match fields.as_slice() {
                [index, name @ .., memory] if !name.is_empty() => {
                    let id = index.parse::<u32>().ok()?;
                    let memory = memory.parse::<f64>().ok()?;
                    Some(Device::new(id, name.join(","), memory as u64))
                }
                _ => {
                    warn!("Skipping unparseable nvidia-smi row: {:?}", line);
                    None
                }
            }
        })
        .collect()
}

/// Parses `index, memory.free` rows into (device id, free MiB).
pub(crate) fn parse_free_memory(stdout: &str) -> Vec<(u32, u64)> {
    stdout
        .lines()
        .filter_map(|line| {
            let (index, free) = line.split_once(',')?;
            let id = index.trim().parse::<u32>().ok()?;
            let free = free.trim().parse::<f64>().ok()?;
            Some((id, free as u64))
        })
        .collect()
}

/// Worker pool size derived from the hardware: half the cores (at most 8),
/// one worker per 16GB of available memory (at least 4), four per device.
pub fn optimal_workers(cpu_count: usize, available_memory_gb: f64, device_count: usize) -> usize {
    let cpu_based = (cpu_count / 2).min(8);
    let memory_based = ((available_memory_gb / 16.0) as usize).max(4);
    let mut optimal = cpu_based.min(memory_based);
    if device_count > 0 {
        optimal = optimal.min(device_count * 4);
    }
    let optimal = optimal.max(1);
    info!(
        "Optimal workers: {} (CPU: {}, Memory: {}, Devices: {})",
        optimal, cpu_based, memory_based, device_count
    );
    optimal
}
