use std::sync::Arc;

use tracing::debug;

use super::DeviceInventory;

/// Picks a device per job by hashing the job id over the live devices.
///
/// Assignment is deterministic and ignores actual per-device load; a device
/// the resource monitor has marked down drops out of the modulo set until it
/// comes back.
#[derive(Debug, Clone)]
pub struct DeviceAllocator {
    inventory: Arc<DeviceInventory>,
}

impl DeviceAllocator {
    pub fn new(inventory: Arc<DeviceInventory>) -> Self {
        Self { inventory }
    }

    /// `None` means the general-purpose (CPU) path.
    pub fn pick_device(&self, job_id: &str) -> Option<u32> {
        let live = self.inventory.live_ids();
        let picked = match live.len() {
            0 => None,
            1 => Some(live[0]),
            count => Some(live[(stable_hash(job_id) % count as u64) as usize]),
        };
        debug!("Job {} assigned to device {:?} ({} live)", job_id, picked, live.len());
        picked
    }
}

// FNV-1a, stable across processes and builds.
fn stable_hash(value: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    value
        .bytes()
        .fold(OFFSET, |hash, byte| (hash ^ u64::from(byte)).wrapping_mul(PRIME))
}
