//! Intel 8254 Programmable Interval Timer (PIT) emulation.
//!
//! Three 16-bit down-counters driven by the 1.193182 MHz PIT clock:
//! - **Channel 0**: system timer, output wired to IRQ 0
//! - **Channel 1**: DRAM refresh (unused by modern guests)
//! - **Channel 2**: PC speaker, gated through port 0x61
//!
//! # I/O Ports
//!
//! | Port | Description |
//! |------|-------------|
//! | 0x40-0x42 | Channel 0-2 count register |
//! | 0x43 | Mode/command register (write only) |
//! | 0x61 | System control port B: gate 2 (bit 0), speaker enable (bit 1), refresh toggle (bit 4), OUT2 (bit 5) |
//!
//! # Control Word (port 0x43)
//!
//! ```text
//!   7   6    5   4    3  2  1    0
//! [ SC1 SC0 ][ RW1 RW0 ][ M2 M1 M0 ][ BCD ]
//!   channel   access      mode       BCD
//!   (11 = read-back)  (00 = latch)
//! ```
//!
//! [`Pit::tick`] advances every channel by one PIT clock and returns true when
//! channel 0 produces an interrupt edge.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AccessWidth, Device, DeviceSnapshot, IrqLine, SnapshotError};

/// PIT input clock in Hz.
pub const PIT_FREQUENCY: u64 = 1_193_182;

pub const CHANNEL0: u16 = 0x40;
pub const CHANNEL1: u16 = 0x41;
pub const CHANNEL2: u16 = 0x42;
pub const COMMAND: u16 = 0x43;
pub const PORT_B: u16 = 0x61;

/// Which byte(s) of the counter a port access transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
enum Access {
    Low,
    High,
    #[default]
    LowHigh,
}

impl Access {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits & 3 {
            1 => Some(Self::Low),
            2 => Some(Self::High),
            3 => Some(Self::LowHigh),
            _ => None,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Self::Low => 1,
            Self::High => 2,
            Self::LowHigh => 3,
        }
    }
}

/// State of a single counter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PitChannel {
    mode: u8,
    access: Access,
    bcd: bool,
    /// Reload value as written (BCD digits when `bcd`).
    reload: u16,
    /// Counts remaining, in clocks.
    current: u32,
    output: bool,
    gate: bool,
    /// Counting is active (a full count has been loaded).
    armed: bool,
    /// Count written but not yet loaded into the counter.
    null_count: bool,
    /// One-shot modes: terminal count already reached.
    expired: bool,
    write_high_next: bool,
    read_high_next: bool,
    latch: Option<u16>,
    status_latch: Option<u8>,
}

fn bcd_to_bin(value: u16) -> u32 {
    let mut result = 0u32;
    for shift in [12, 8, 4, 0] {
        result = result * 10 + ((value >> shift) & 0xF).min(9) as u32;
    }
    result
}

fn bin_to_bcd(mut value: u32) -> u16 {
    let mut result = 0u16;
    for shift in [0, 4, 8, 12] {
        result |= ((value % 10) as u16) << shift;
        value /= 10;
    }
    result
}

impl PitChannel {
    fn new(gate: bool) -> Self {
        Self {
            gate,
            ..Default::default()
        }
    }

    /// Full count in clocks: 0 means 65536 (binary) or 10000 (BCD).
    fn period(&self) -> u32 {
        let n = if self.bcd {
            bcd_to_bin(self.reload)
        } else {
            self.reload as u32
        };
        match (n, self.bcd) {
            (0, false) => 0x10000,
            (0, true) => 10_000,
            (n, _) => n,
        }
    }

    /// Current count as the guest sees it.
    fn visible_count(&self) -> u16 {
        let count = if self.armed { self.current } else { 0 };
        if self.bcd {
            bin_to_bcd(count % 10_000)
        } else {
            count as u16
        }
    }

    fn status(&self) -> u8 {
        ((self.output as u8) << 7)
            | ((self.null_count as u8) << 6)
            | (self.access.bits() << 4)
            | (self.mode << 1)
            | self.bcd as u8
    }

    fn program(&mut self, access: Access, mode: u8, bcd: bool) {
        self.access = access;
        // Modes 6 and 7 alias 2 and 3.
        self.mode = if mode >= 6 { mode - 4 } else { mode };
        self.bcd = bcd;
        self.armed = false;
        self.expired = false;
        self.null_count = true;
        self.write_high_next = false;
        self.read_high_next = false;
        self.latch = None;
        self.status_latch = None;
        // Mode 0 drives OUT low after programming; all others drive it high.
        self.output = self.mode != 0;
    }

    fn load(&mut self) {
        self.current = self.period();
        self.null_count = false;
        self.expired = false;
        match self.mode {
            0 => {
                self.output = false;
                self.armed = true;
            }
            // Hardware-triggered modes wait for a gate edge.
            1 | 5 => self.armed = false,
            _ => self.armed = true,
        }
    }

    fn write_count(&mut self, value: u8) {
        match self.access {
            Access::Low => {
                self.reload = value as u16;
                self.load();
            }
            Access::High => {
                self.reload = (value as u16) << 8;
                self.load();
            }
            Access::LowHigh => {
                if self.write_high_next {
                    self.reload = (self.reload & 0x00FF) | ((value as u16) << 8);
                    self.write_high_next = false;
                    self.load();
                } else {
                    self.reload = (self.reload & 0xFF00) | value as u16;
                    self.write_high_next = true;
                    if self.mode == 0 {
                        // First byte in mode 0 stops the count.
                        self.armed = false;
                        self.output = false;
                    }
                }
            }
        }
    }

    fn read_count(&mut self) -> u8 {
        if let Some(status) = self.status_latch.take() {
            return status;
        }
        let value = self.latch.unwrap_or_else(|| self.visible_count());
        let (byte, done) = match self.access {
            Access::Low => (value as u8, true),
            Access::High => ((value >> 8) as u8, true),
            Access::LowHigh => {
                if self.read_high_next {
                    self.read_high_next = false;
                    ((value >> 8) as u8, true)
                } else {
                    self.read_high_next = true;
                    (value as u8, false)
                }
            }
        };
        if done {
            self.latch = None;
        }
        byte
    }

    fn latch_count(&mut self) {
        if self.latch.is_none() {
            self.latch = Some(self.visible_count());
        }
    }

    fn set_gate(&mut self, gate: bool) {
        let rising = gate && !self.gate;
        self.gate = gate;
        if rising {
            match self.mode {
                1 | 5 => {
                    self.current = self.period();
                    self.armed = true;
                    self.expired = false;
                    if self.mode == 1 {
                        self.output = false;
                    }
                }
                2 | 3 => self.current = self.period(),
                _ => {}
            }
        }
        if !gate && matches!(self.mode, 2 | 3) {
            self.output = true;
        }
    }

    /// Advance one clock. Returns true on an interrupt-producing OUT edge.
    fn tick(&mut self) -> bool {
        if !self.armed {
            return false;
        }
        let gated = matches!(self.mode, 0 | 2 | 3 | 4);
        if gated && !self.gate {
            return false;
        }

        match self.mode {
            // Interrupt on terminal count / hardware one-shot.
            0 | 1 => {
                self.current = self.current.saturating_sub(1);
                if self.current == 0 {
                    self.current = self.period();
                    if !self.expired {
                        self.expired = true;
                        self.output = true;
                        return true;
                    }
                }
                false
            }
            // Rate generator: one edge per period.
            2 => {
                self.current = self.current.saturating_sub(1);
                if self.current == 1 {
                    self.output = false;
                    false
                } else if self.current == 0 {
                    self.current = self.period();
                    self.output = true;
                    true
                } else {
                    false
                }
            }
            // Square wave: toggles every half period, edge on the rising half.
            3 => {
                let period = self.period();
                let half = if self.output {
                    period.div_ceil(2)
                } else {
                    period / 2
                };
                self.current = self.current.saturating_sub(1);
                if period.saturating_sub(self.current) >= half.max(1) {
                    self.output = !self.output;
                    self.current = period;
                    return self.output;
                }
                false
            }
            // Software / hardware strobe: one low pulse at terminal count.
            4 | 5 => {
                self.current = self.current.saturating_sub(1);
                if self.current == 0 {
                    self.current = self.period();
                    if !self.expired {
                        self.expired = true;
                        return true;
                    }
                }
                false
            }
            _ => false,
        }
    }
}

/// Serialized PIT state.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PitState {
    channels: [PitChannel; 3],
    speaker_enabled: bool,
    /// Port B bits 2-3 (parity / channel check enables).
    port_b_misc: u8,
    refresh_toggle: bool,
}

impl Default for PitState {
    fn default() -> Self {
        Self {
            // Channels 0 and 1 have their gates tied high.
            channels: [PitChannel::new(true), PitChannel::new(true), PitChannel::new(false)],
            speaker_enabled: false,
            port_b_misc: 0,
            refresh_toggle: false,
        }
    }
}

pub struct Pit {
    state: PitState,
    irq: IrqLine,
}

impl Pit {
    pub fn new(irq: IrqLine) -> Self {
        Self {
            state: PitState::default(),
            irq,
        }
    }

    /// Advance all channels by one PIT clock. Returns true if channel 0 fired
    /// (and pulses IRQ 0).
    pub fn tick(&mut self) -> bool {
        let fired = self.state.channels[0].tick();
        self.state.channels[1].tick();
        self.state.channels[2].tick();
        if fired {
            self.irq.pulse();
        }
        fired
    }

    /// Advance `clocks` PIT clocks, returning the number of channel 0 interrupts.
    pub fn advance(&mut self, clocks: u64) -> u32 {
        (0..clocks).filter(|_| self.tick()).count() as u32
    }

    /// Output pin of channel `n` (0-2).
    pub fn output(&self, n: usize) -> bool {
        self.state.channels.get(n).is_some_and(|c| c.output)
    }

    /// Programmed period of channel `n` in PIT clocks, if it is counting.
    pub fn period(&self, n: usize) -> Option<u32> {
        self.state
            .channels
            .get(n)
            .filter(|c| c.armed)
            .map(|c| c.period())
    }

    fn write_command(&mut self, value: u8) {
        let select = value >> 6;
        if select == 3 {
            self.read_back(value);
            return;
        }
        let channel = &mut self.state.channels[select as usize];
        match Access::from_bits(value >> 4) {
            None => channel.latch_count(),
            Some(access) => channel.program(access, (value >> 1) & 7, value & 1 != 0),
        }
    }

    /// Read-back command: bit 5 clear latches counts, bit 4 clear latches status.
    fn read_back(&mut self, value: u8) {
        for (n, channel) in self.state.channels.iter_mut().enumerate() {
            if value & (2 << n) == 0 {
                continue;
            }
            if value & 0x20 == 0 {
                channel.latch_count();
            }
            if value & 0x10 == 0 && channel.status_latch.is_none() {
                channel.status_latch = Some(channel.status());
            }
        }
    }

    fn read_port_b(&mut self) -> u8 {
        // Refresh request toggles on every read; guests spin on it for delays.
        self.state.refresh_toggle = !self.state.refresh_toggle;
        let ch2 = &self.state.channels[2];
        (ch2.gate as u8)
            | ((self.state.speaker_enabled as u8) << 1)
            | self.state.port_b_misc
            | ((self.state.refresh_toggle as u8) << 4)
            | ((ch2.output as u8) << 5)
    }

    fn write_port_b(&mut self, value: u8) {
        self.state.channels[2].set_gate(value & 1 != 0);
        self.state.speaker_enabled = value & 2 != 0;
        self.state.port_b_misc = value & 0x0C;
    }
}

impl Device for Pit {
    fn name(&self) -> &str {
        "pit"
    }

    fn io_read(&mut self, port: u16, _width: AccessWidth) -> u32 {
        let value = match port {
            CHANNEL0..=CHANNEL2 => self.state.channels[(port - CHANNEL0) as usize].read_count(),
            PORT_B => self.read_port_b(),
            _ => 0xFF,
        };
        value as u32
    }

    fn io_write(&mut self, port: u16, _width: AccessWidth, value: u32) {
        let byte = value as u8;
        match port {
            CHANNEL0..=CHANNEL2 => {
                self.state.channels[(port - CHANNEL0) as usize].write_count(byte)
            }
            COMMAND => self.write_command(byte),
            PORT_B => self.write_port_b(byte),
            _ => debug!("PIT ignoring write to port {:#x}", port),
        }
    }

    fn reset(&mut self) {
        self.state = PitState::default();
    }

    fn snapshot(&self) -> Result<DeviceSnapshot, SnapshotError> {
        DeviceSnapshot::capture(self.name(), &self.state)
    }

    fn restore(&mut self, snapshot: &DeviceSnapshot) -> Result<(), SnapshotError> {
        self.state = snapshot.decode(self.name())?;
        Ok(())
    }
}
