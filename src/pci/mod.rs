//! PCI function model: type 0 configuration header, BARs and the MSI
//! capability.
//!
//! Every concrete PCI device embeds a [`PciDevice`] and implements
//! [`PciFunction`] to expose it to the host bridge in [`config`].
//!
//! # Header layout
//!
//! ```text
//! 0x00 vendor | device       0x10-0x24 BAR0-BAR5
//! 0x04 command | status      0x2C subsystem vendor | subsystem
//! 0x08 rev | class code      0x34 capability pointer (0x50 when MSI present)
//! 0x0C cache | lat | hdr     0x3C interrupt line | pin
//! ```
//!
//! # MSI capability (offset 0x50)
//!
//! ```text
//! 0x50 cap id 0x05 | next | message control (bit 0 enable, bit 7 64-bit)
//! 0x54 message address low
//! 0x58 message address high
//! 0x5C message data
//! ```

pub mod config;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub use config::{Bdf, HostBridge, PciConfigSpace, SharedPciFunction};

use crate::devices::{deposit, extract, AccessWidth, Device, IrqLine, SnapshotError};
use crate::interrupts::MsiMessage;

pub const CONFIG_SPACE_SIZE: usize = 256;
pub const NUM_BARS: usize = 6;
pub const MSI_CAP_OFFSET: u16 = 0x50;
pub const MSI_CAP_ID: u8 = 0x05;

pub mod regs {
    pub const VENDOR_ID: u16 = 0x00;
    pub const DEVICE_ID: u16 = 0x02;
    pub const COMMAND: u16 = 0x04;
    pub const STATUS: u16 = 0x06;
    pub const REVISION: u16 = 0x08;
    pub const PROG_IF: u16 = 0x09;
    pub const SUBCLASS: u16 = 0x0A;
    pub const CLASS: u16 = 0x0B;
    pub const HEADER_TYPE: u16 = 0x0E;
    pub const BAR0: u16 = 0x10;
    pub const SUBSYSTEM_VENDOR_ID: u16 = 0x2C;
    pub const SUBSYSTEM_ID: u16 = 0x2E;
    pub const CAP_PTR: u16 = 0x34;
    pub const INTERRUPT_LINE: u16 = 0x3C;
    pub const INTERRUPT_PIN: u16 = 0x3D;
}

pub const CMD_IO: u16 = 1 << 0;
pub const CMD_MEMORY: u16 = 1 << 1;
pub const CMD_BUS_MASTER: u16 = 1 << 2;
pub const CMD_INTX_DISABLE: u16 = 1 << 10;

const STATUS_INTX: u16 = 1 << 3;
const STATUS_CAP_LIST: u16 = 1 << 4;

const MSI_CTRL_ENABLE: u16 = 1 << 0;
const MSI_CTRL_64BIT: u16 = 1 << 7;

/// PCI setup errors.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PciError {
    #[error("PCI address {0} is already occupied")]
    DuplicateBdf(Bdf),

    #[error("Invalid PCI address {bus:02x}:{device:02x}.{function}")]
    InvalidBdf { bus: u8, device: u8, function: u8 },

    #[error("BAR index {0} out of range")]
    InvalidBar(usize),

    #[error("BAR {index} size {size:#x} is not a power of two of at least {min:#x}")]
    InvalidBarSize { index: usize, size: u32, min: u32 },

    #[error("PCI {0} window exhausted")]
    WindowExhausted(&'static str),
}

/// Address space a BAR decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BarKind {
    Io,
    Memory { prefetchable: bool },
}

impl BarKind {
    /// Read-only low bits of the BAR register.
    fn flags(self) -> u32 {
        match self {
            BarKind::Io => 0x1,
            BarKind::Memory { prefetchable } => (prefetchable as u32) << 3,
        }
    }

    fn flag_mask(self) -> u32 {
        match self {
            BarKind::Io => 0x3,
            BarKind::Memory { .. } => 0xF,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Bar {
    kind: BarKind,
    size: u32,
    /// Address bits as last written.
    address: u32,
    /// The guest wrote all ones and is reading back the size mask.
    probing: bool,
}

impl Bar {
    fn read(&self) -> u32 {
        if self.probing {
            !(self.size - 1) | self.kind.flags()
        } else {
            self.address | self.kind.flags()
        }
    }

    fn write(&mut self, value: u32) {
        if value == 0xFFFF_FFFF {
            self.probing = true;
        } else {
            self.probing = false;
            self.address = value & !self.kind.flag_mask();
        }
    }
}

/// Architectural configuration state of one function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PciState {
    config: Vec<u8>,
    bars: [Option<Bar>; NUM_BARS],
    has_msi: bool,
    intx_asserted: bool,
}

/// Type 0 configuration header with BARs and an optional MSI capability.
pub struct PciDevice {
    state: PciState,
    irq: IrqLine,
}

impl PciDevice {
    pub fn new(vendor_id: u16, device_id: u16, class: u8, subclass: u8, prog_if: u8) -> Self {
        let mut config = vec![0u8; CONFIG_SPACE_SIZE];
        config[0..2].copy_from_slice(&vendor_id.to_le_bytes());
        config[2..4].copy_from_slice(&device_id.to_le_bytes());
        config[regs::PROG_IF as usize] = prog_if;
        config[regs::SUBCLASS as usize] = subclass;
        config[regs::CLASS as usize] = class;
        Self {
            state: PciState {
                config,
                bars: [None; NUM_BARS],
                has_msi: false,
                intx_asserted: false,
            },
            irq: IrqLine::default(),
        }
    }

    pub fn with_subsystem(mut self, vendor_id: u16, id: u16) -> Self {
        self.set_u16(regs::SUBSYSTEM_VENDOR_ID, vendor_id);
        self.set_u16(regs::SUBSYSTEM_ID, id);
        self
    }

    pub fn with_revision(mut self, revision: u8) -> Self {
        self.state.config[regs::REVISION as usize] = revision;
        self
    }

    /// Attach the INTx / MSI interrupt line. `pin` is 1 for INTA#.
    pub fn set_interrupt(&mut self, irq: IrqLine, pin: u8) {
        self.state.config[regs::INTERRUPT_LINE as usize] = irq.line() as u8;
        self.state.config[regs::INTERRUPT_PIN as usize] = pin;
        self.irq = irq;
    }

    /// Declare BAR `index`. Sizes must be powers of two; memory BARs are at
    /// least 16 bytes, I/O BARs at least 4.
    pub fn add_bar(&mut self, index: usize, kind: BarKind, size: u32) -> Result<(), PciError> {
        if index >= NUM_BARS {
            return Err(PciError::InvalidBar(index));
        }
        let min = match kind {
            BarKind::Io => 4,
            BarKind::Memory { .. } => 16,
        };
        if !size.is_power_of_two() || size < min {
            return Err(PciError::InvalidBarSize { index, size, min });
        }
        self.state.bars[index] = Some(Bar {
            kind,
            size,
            address: 0,
            probing: false,
        });
        Ok(())
    }

    /// Add the 64-bit MSI capability at 0x50.
    pub fn add_msi_capability(&mut self) {
        let off = MSI_CAP_OFFSET as usize;
        self.state.config[off] = MSI_CAP_ID;
        self.state.config[off + 1] = 0;
        self.set_u16(MSI_CAP_OFFSET + 2, MSI_CTRL_64BIT);
        self.state.config[regs::CAP_PTR as usize] = MSI_CAP_OFFSET as u8;
        let status = self.u16_at(regs::STATUS) | STATUS_CAP_LIST;
        self.set_u16(regs::STATUS, status);
        self.state.has_msi = true;
    }

    pub fn vendor_id(&self) -> u16 {
        self.u16_at(regs::VENDOR_ID)
    }

    pub fn device_id(&self) -> u16 {
        self.u16_at(regs::DEVICE_ID)
    }

    pub fn command(&self) -> u16 {
        self.u16_at(regs::COMMAND)
    }

    pub fn bus_master(&self) -> bool {
        self.command() & CMD_BUS_MASTER != 0
    }

    /// Decoded BAR window, if the BAR exists and its space is enabled.
    pub fn bar_window(&self, index: usize) -> Option<(BarKind, u64, u64)> {
        let bar = self.state.bars.get(index)?.as_ref()?;
        let enabled = match bar.kind {
            BarKind::Io => self.command() & CMD_IO != 0,
            BarKind::Memory { .. } => self.command() & CMD_MEMORY != 0,
        };
        (enabled && bar.address != 0).then_some((bar.kind, bar.address as u64, bar.size as u64))
    }

    /// BAR size and kind regardless of decode state.
    pub fn bar_layout(&self, index: usize) -> Option<(BarKind, u32)> {
        let bar = self.state.bars.get(index)?.as_ref()?;
        Some((bar.kind, bar.size))
    }

    /// Program a BAR address as firmware would.
    pub fn set_bar_address(&mut self, index: usize, address: u32) {
        if let Some(Some(bar)) = self.state.bars.get_mut(index) {
            bar.write(address);
        }
    }

    pub fn enable_decode(&mut self, bits: u16) {
        let cmd = self.command() | (bits & (CMD_IO | CMD_MEMORY | CMD_BUS_MASTER));
        self.set_u16(regs::COMMAND, cmd);
    }

    pub fn msi_enabled(&self) -> bool {
        self.state.has_msi && self.u16_at(MSI_CAP_OFFSET + 2) & MSI_CTRL_ENABLE != 0
    }

    /// Current MSI message, if MSI is enabled.
    pub fn msi_message(&self) -> Option<MsiMessage> {
        if !self.msi_enabled() {
            return None;
        }
        let lo = self.u32_at(MSI_CAP_OFFSET + 4) as u64;
        let hi = self.u32_at(MSI_CAP_OFFSET + 8) as u64;
        let data = self.u16_at(MSI_CAP_OFFSET + 12) as u32;
        Some(MsiMessage::new((hi << 32) | lo, data))
    }

    /// Send the programmed MSI. Returns false (and sends nothing) while the
    /// capability is disabled.
    pub fn send_msi(&self) -> bool {
        match self.msi_message() {
            Some(msg) => {
                self.irq.send_msi(msg);
                true
            }
            None => false,
        }
    }

    /// Signal the function's interrupt: MSI when enabled, otherwise INTx
    /// unless the command register disables it.
    pub fn raise_interrupt(&mut self) {
        if self.send_msi() {
            return;
        }
        self.state.intx_asserted = true;
        self.sync_intx();
    }

    /// Deassert INTx.
    pub fn lower_interrupt(&mut self) {
        self.state.intx_asserted = false;
        self.sync_intx();
    }

    fn sync_intx(&mut self) {
        let level = self.state.intx_asserted && self.command() & CMD_INTX_DISABLE == 0;
        let status = self.u16_at(regs::STATUS);
        let status = if self.state.intx_asserted {
            status | STATUS_INTX
        } else {
            status & !STATUS_INTX
        };
        self.set_u16(regs::STATUS, status);
        self.irq.set_level(level);
    }

    /// Writable bits of each configuration byte.
    fn writable_mask(&self, offset: u16) -> u8 {
        let msi = MSI_CAP_OFFSET;
        match offset {
            0x04 => 0x47,
            0x05 => 0x05,
            0x0C | 0x0D => 0xFF,
            regs::INTERRUPT_LINE => 0xFF,
            o if self.state.has_msi && o == msi + 2 => 0x71,
            o if self.state.has_msi && o == msi + 4 => 0xFC,
            o if self.state.has_msi && (msi + 5..msi + 14).contains(&o) => 0xFF,
            _ => 0,
        }
    }

    fn bar_index(offset: u16) -> Option<usize> {
        (regs::BAR0..regs::BAR0 + 4 * NUM_BARS as u16)
            .contains(&offset)
            .then(|| ((offset - regs::BAR0) / 4) as usize)
    }

    fn read_dword(&self, reg: u16) -> u32 {
        if let Some(index) = Self::bar_index(reg) {
            return self.state.bars[index].map_or(0, |bar| bar.read());
        }
        self.u32_at(reg)
    }

    /// Configuration read of `width` bytes at `offset`.
    pub fn config_read(&self, offset: u16, width: AccessWidth) -> u32 {
        if offset as usize + width.bytes() > CONFIG_SPACE_SIZE {
            return width.mask();
        }
        let reg = offset & !3;
        extract(self.read_dword(reg) as u64, (offset & 3) as u64, width)
    }

    /// Configuration write of `width` bytes at `offset`. Read-only bits are
    /// preserved.
    pub fn config_write(&mut self, offset: u16, width: AccessWidth, value: u32) {
        if offset as usize + width.bytes() > CONFIG_SPACE_SIZE {
            return;
        }
        if let Some(index) = Self::bar_index(offset & !3) {
            if let Some(bar) = self.state.bars[index].as_mut() {
                let current = bar.read() as u64;
                let merged = deposit(current, (offset & 3) as u64, width, value) as u32;
                bar.write(merged);
            }
            return;
        }

        let old_cmd = self.command();
        for i in 0..width.bytes() as u16 {
            let addr = offset + i;
            let mask = self.writable_mask(addr);
            if mask == 0 {
                continue;
            }
            let byte = (value >> (8 * i)) as u8;
            let old = self.state.config[addr as usize];
            self.state.config[addr as usize] = (old & !mask) | (byte & mask);
        }
        if (old_cmd ^ self.command()) & CMD_INTX_DISABLE != 0 {
            debug!("INTx disable toggled to {}", self.command() & CMD_INTX_DISABLE != 0);
            self.sync_intx();
        }
    }

    pub fn save(&self) -> PciState {
        self.state.clone()
    }

    pub fn load(&mut self, state: PciState) -> Result<(), SnapshotError> {
        if state.config.len() != CONFIG_SPACE_SIZE {
            return Err(SnapshotError::Malformed("PCI configuration space size".into()));
        }
        self.state = state;
        self.sync_intx();
        Ok(())
    }

    /// Return to power-on state: decode disabled, BARs unassigned, MSI off.
    pub fn reset(&mut self) {
        self.set_u16(regs::COMMAND, 0);
        for bar in self.state.bars.iter_mut().flatten() {
            bar.address = 0;
            bar.probing = false;
        }
        if self.state.has_msi {
            let ctrl = self.u16_at(MSI_CAP_OFFSET + 2) & !MSI_CTRL_ENABLE & !0x70;
            self.set_u16(MSI_CAP_OFFSET + 2, ctrl);
        }
        self.state.intx_asserted = false;
        self.sync_intx();
    }

    fn u16_at(&self, offset: u16) -> u16 {
        let o = offset as usize;
        u16::from_le_bytes([self.state.config[o], self.state.config[o + 1]])
    }

    fn u32_at(&self, offset: u16) -> u32 {
        let o = offset as usize;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.state.config[o..o + 4]);
        u32::from_le_bytes(bytes)
    }

    fn set_u16(&mut self, offset: u16, value: u16) {
        let o = offset as usize;
        self.state.config[o..o + 2].copy_from_slice(&value.to_le_bytes());
    }
}

/// A device that sits behind the PCI host bridge.
///
/// Configuration accesses go through [`PciFunction::config_read`] and
/// [`PciFunction::config_write`]; accesses that hit an enabled BAR arrive at
/// [`PciFunction::bar_read`] / [`PciFunction::bar_write`] with the offset
/// into that BAR.
pub trait PciFunction: Device {
    fn pci(&self) -> &PciDevice;

    fn pci_mut(&mut self) -> &mut PciDevice;

    fn config_read(&mut self, offset: u16, width: AccessWidth) -> u32 {
        self.pci().config_read(offset, width)
    }

    fn config_write(&mut self, offset: u16, width: AccessWidth, value: u32) {
        self.pci_mut().config_write(offset, width, value);
    }

    fn bar_read(&mut self, _bar: usize, _offset: u64, width: AccessWidth) -> u32 {
        width.mask()
    }

    fn bar_write(&mut self, _bar: usize, _offset: u64, _width: AccessWidth, _value: u32) {}
}
