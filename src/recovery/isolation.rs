//! Per-device fault containment.
//!
//! Every guest-induced device fault (bad DMA descriptor, poisoned lock,
//! malformed command block) is charged to the device by name. Once a device
//! reaches the threshold it is isolated for the lifetime of the VM and the
//! [`DeviceBus`](crate::devices::DeviceBus) stops dispatching to it.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tracing::{info, warn};

use crate::devices::lock;

#[derive(Debug, Default)]
struct IsolationState {
    counts: HashMap<String, u32>,
    isolated: HashSet<String>,
}

/// Fault tally shared between the bus and the platform.
#[derive(Debug)]
pub struct FaultIsolation {
    threshold: u32,
    state: Mutex<IsolationState>,
}

impl FaultIsolation {
    /// `threshold` faults isolate a device. A threshold of 0 is treated as 1.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            state: Mutex::new(IsolationState::default()),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Charge one fault to `device`. Returns true once the device is isolated.
    pub fn track_device_fault(&self, device: &str) -> bool {
        let mut state = lock(&self.state);
        let count = state.counts.entry(device.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        let count = *count;
        warn!("device {} fault {}/{}", device, count, self.threshold);

        if count >= self.threshold && state.isolated.insert(device.to_string()) {
            info!("isolating device {} after {} faults", device, count);
        }
        state.isolated.contains(device)
    }

    pub fn is_isolated(&self, device: &str) -> bool {
        lock(&self.state).isolated.contains(device)
    }

    pub fn fault_count(&self, device: &str) -> u32 {
        lock(&self.state).counts.get(device).copied().unwrap_or(0)
    }

    /// Names of all isolated devices, sorted.
    pub fn isolated_devices(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.state).isolated.iter().cloned().collect();
        names.sort();
        names
    }
}

impl Default for FaultIsolation {
    fn default() -> Self {
        Self::new(8)
    }
}
