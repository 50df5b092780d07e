//! Miscellaneous motherboard ports: POST code (0x80), System Control Port A
//! (0x92) and the reset control register logic behind 0xCF9.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{AccessWidth, Device, DeviceSnapshot, PowerCallback, PowerEvent, SnapshotError};

pub const POST_PORT: u16 = 0x80;
pub const PORT_A: u16 = 0x92;

/// POST codes kept for inspection.
const POST_HISTORY: usize = 256;

// Port 0x92
const PORT_A_FAST_RESET: u8 = 1 << 0;
const PORT_A_A20: u8 = 1 << 1;

// Reset control (0xCF9)
const RC_SYS_RST: u8 = 1 << 1;
const RC_RST_CPU: u8 = 1 << 2;
const RC_FULL_RST: u8 = 1 << 3;

/// Reset control register at 0xCF9.
///
/// Writing RST_CPU requests a reset; SYS_RST selects a hard (platform)
/// rather than a soft (CPU only) reset.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResetControl {
    value: u8,
}

impl ResetControl {
    pub fn read(&self) -> u8 {
        self.value
    }

    /// Latch a guest write. Returns the requested reset, if any.
    pub fn write(&mut self, value: u8) -> Option<PowerEvent> {
        self.value = value & (RC_SYS_RST | RC_FULL_RST);
        if value & RC_RST_CPU == 0 {
            return None;
        }
        let event = if value & RC_SYS_RST != 0 {
            PowerEvent::HardReset
        } else {
            PowerEvent::SoftReset
        };
        info!("reset control requested {:?}", event);
        Some(event)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SystemState {
    post_codes: VecDeque<u8>,
    port_a: u8,
}

impl Default for SystemState {
    fn default() -> Self {
        Self {
            post_codes: VecDeque::new(),
            port_a: PORT_A_A20,
        }
    }
}

/// POST diagnostics and fast A20 / fast reset.
pub struct SystemPorts {
    state: SystemState,
    power: Option<PowerCallback>,
}

impl Default for SystemPorts {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemPorts {
    pub fn new() -> Self {
        Self {
            state: SystemState::default(),
            power: None,
        }
    }

    pub fn set_power_callback(&mut self, cb: PowerCallback) {
        self.power = Some(cb);
    }

    pub fn last_post_code(&self) -> Option<u8> {
        self.state.post_codes.back().copied()
    }

    /// POST codes in the order the guest wrote them.
    pub fn post_codes(&self) -> impl Iterator<Item = u8> + '_ {
        self.state.post_codes.iter().copied()
    }

    pub fn a20_enabled(&self) -> bool {
        self.state.port_a & PORT_A_A20 != 0
    }

    fn write_port_a(&mut self, value: u8) {
        let rising = value & PORT_A_FAST_RESET != 0 && self.state.port_a & PORT_A_FAST_RESET == 0;
        self.state.port_a = value & (PORT_A_FAST_RESET | PORT_A_A20);
        if rising {
            info!("fast reset through port 0x92");
            if let Some(cb) = &self.power {
                cb(PowerEvent::SoftReset);
            }
        }
    }
}

impl Device for SystemPorts {
    fn name(&self) -> &str {
        "system"
    }

    fn io_read(&mut self, port: u16, width: AccessWidth) -> u32 {
        match port {
            POST_PORT => self.last_post_code().unwrap_or(0) as u32,
            PORT_A => self.state.port_a as u32,
            _ => width.mask(),
        }
    }

    fn io_write(&mut self, port: u16, _width: AccessWidth, value: u32) {
        match port {
            POST_PORT => {
                let code = value as u8;
                debug!("POST code {:#04x}", code);
                if self.state.post_codes.len() == POST_HISTORY {
                    self.state.post_codes.pop_front();
                }
                self.state.post_codes.push_back(code);
            }
            PORT_A => self.write_port_a(value as u8),
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.state.port_a = PORT_A_A20;
    }

    fn snapshot(&self) -> Result<DeviceSnapshot, SnapshotError> {
        DeviceSnapshot::capture(self.name(), &self.state)
    }

    fn restore(&mut self, snapshot: &DeviceSnapshot) -> Result<(), SnapshotError> {
        self.state = snapshot.decode(self.name())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_reset_control_hard_vs_soft() {
        let mut rc = ResetControl::default();
        assert_eq!(rc.write(RC_SYS_RST), None);
        assert_eq!(rc.read(), RC_SYS_RST);
        assert_eq!(rc.write(RC_SYS_RST | RC_RST_CPU), Some(PowerEvent::HardReset));
        assert_eq!(rc.write(RC_RST_CPU), Some(PowerEvent::SoftReset));
        assert_eq!(rc.read() & RC_RST_CPU, 0);
    }

    #[test]
    fn test_post_codes() {
        let mut sys = SystemPorts::new();
        for code in [0x01u32, 0x02, 0x55] {
            sys.io_write(POST_PORT, AccessWidth::Byte, code);
        }
        assert_eq!(sys.post_codes().collect::<Vec<_>>(), vec![0x01, 0x02, 0x55]);
        assert_eq!(sys.io_read(POST_PORT, AccessWidth::Byte), 0x55);

        for _ in 0..POST_HISTORY {
            sys.io_write(POST_PORT, AccessWidth::Byte, 0xAA);
        }
        assert_eq!(sys.post_codes().count(), POST_HISTORY);
        assert!(sys.post_codes().all(|c| c == 0xAA));
    }

    #[test]
    fn test_port_a_fast_reset_and_a20() {
        let mut sys = SystemPorts::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let seen = events.clone();
        sys.set_power_callback(Arc::new(move |e: PowerEvent| seen.lock().unwrap().push(e)));

        assert!(sys.a20_enabled());
        sys.io_write(PORT_A, AccessWidth::Byte, 0x00);
        assert!(!sys.a20_enabled());

        sys.io_write(PORT_A, AccessWidth::Byte, 0x03);
        sys.io_write(PORT_A, AccessWidth::Byte, 0x03);
        assert_eq!(*events.lock().unwrap(), vec![PowerEvent::SoftReset]);
    }
}
