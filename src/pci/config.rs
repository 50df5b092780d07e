//! PCI host bridge: configuration mechanism #1 and BAR decoding.
//!
//! ```text
//! 0xCF8  CONFIG_ADDRESS  E000_0000 BBBB_BBBB DDDD_DFFF RRRR_RR00
//!                        E = enable, B = bus, D = device, F = function, R = register
//! 0xCF9  reset control (byte access only)
//! 0xCFC  CONFIG_DATA     0xCFC-0xCFF, byte lane selects the register byte
//! ```
//!
//! The host bridge also claims the PCI memory and I/O windows on the
//! [`DeviceBus`](crate::devices::DeviceBus) and forwards each access to the
//! function whose enabled BAR contains the address.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{BarKind, PciDevice, PciError, PciFunction, CMD_BUS_MASTER, CMD_IO, CMD_MEMORY, NUM_BARS};
use crate::devices::system::ResetControl;
use crate::devices::{
    deposit, extract, lock, AccessWidth, Device, DeviceSnapshot, PowerCallback, SnapshotError,
};
use crate::recovery::FaultIsolation;

pub const CONFIG_ADDRESS_PORT: u16 = 0xCF8;
pub const CONFIG_DATA_PORT: u16 = 0xCFC;
pub const RESET_CONTROL_PORT: u16 = 0xCF9;
/// Ports 0xCF8-0xCFF.
pub const CONFIG_PORTS_LEN: u16 = 8;

pub const PCI_MMIO_BASE: u64 = 0xE000_0000;
pub const PCI_MMIO_END: u64 = 0xFEC0_0000;
pub const PCI_IO_BASE: u16 = 0xC000;
pub const PCI_IO_LEN: u16 = 0x4000;

const ENABLE_BIT: u32 = 1 << 31;

/// A function shared between the host bridge and its owner.
pub type SharedPciFunction = Arc<Mutex<dyn PciFunction>>;

/// Bus/device/function triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bdf {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl Bdf {
    pub fn new(bus: u8, device: u8, function: u8) -> Result<Self, PciError> {
        if device >= 32 || function >= 8 {
            return Err(PciError::InvalidBdf {
                bus,
                device,
                function,
            });
        }
        Ok(Self {
            bus,
            device,
            function,
        })
    }

    /// Decode the BDF fields of a CONFIG_ADDRESS value.
    pub fn from_address(address: u32) -> Self {
        Self {
            bus: (address >> 16) as u8,
            device: ((address >> 11) & 0x1F) as u8,
            function: ((address >> 8) & 0x7) as u8,
        }
    }
}

impl fmt::Display for Bdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct HostState {
    address: u32,
    reset_control: ResetControl,
}

/// Configuration-space mechanism and BAR decoder.
pub struct PciConfigSpace {
    state: HostState,
    functions: BTreeMap<Bdf, SharedPciFunction>,
    isolation: Option<Arc<FaultIsolation>>,
    power: Option<PowerCallback>,
}

impl Default for PciConfigSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl PciConfigSpace {
    /// Host bridge with nothing behind it, not even 00:00.0.
    pub fn new() -> Self {
        Self {
            state: HostState::default(),
            functions: BTreeMap::new(),
            isolation: None,
            power: None,
        }
    }

    /// Host bridge with the 440FX-style bridge function at 00:00.0.
    pub fn with_host_bridge() -> Self {
        let mut space = Self::new();
        let bdf = Bdf {
            bus: 0,
            device: 0,
            function: 0,
        };
        space
            .functions
            .insert(bdf, Arc::new(Mutex::new(HostBridge::new())));
        space
    }

    pub fn set_isolation(&mut self, isolation: Arc<FaultIsolation>) {
        self.isolation = Some(isolation);
    }

    /// Receives resets requested through 0xCF9.
    pub fn set_power_callback(&mut self, cb: PowerCallback) {
        self.power = Some(cb);
    }

    /// Place `function` at `bdf`. Each address holds at most one function.
    pub fn register(&mut self, bdf: Bdf, function: SharedPciFunction) -> Result<(), PciError> {
        let bdf = Bdf::new(bdf.bus, bdf.device, bdf.function)?;
        if self.functions.contains_key(&bdf) {
            return Err(PciError::DuplicateBdf(bdf));
        }
        info!("pci {} registered at {}", lock(&function).name(), bdf);
        self.functions.insert(bdf, function);
        Ok(())
    }

    pub fn function(&self, bdf: Bdf) -> Option<&SharedPciFunction> {
        self.functions.get(&bdf)
    }

    /// Registered functions in BDF order.
    pub fn functions(&self) -> impl Iterator<Item = (Bdf, &SharedPciFunction)> {
        self.functions.iter().map(|(bdf, f)| (*bdf, f))
    }

    pub fn config_address(&self) -> u32 {
        self.state.address
    }

    /// Assign naturally aligned BAR addresses from the PCI windows and enable
    /// decoding, standing in for firmware enumeration.
    pub fn assign_bars(&mut self) -> Result<(), PciError> {
        let mut mmio = PCI_MMIO_BASE;
        let mut io = PCI_IO_BASE as u64;
        let io_end = PCI_IO_BASE as u64 + PCI_IO_LEN as u64;

        for (bdf, function) in &self.functions {
            let mut function = lock(function);
            let pci = function.pci_mut();
            let mut decode = 0;
            for index in 0..NUM_BARS {
                let Some((kind, size)) = pci.bar_layout(index) else {
                    continue;
                };
                let size = size as u64;
                let (cursor, end, space, bit) = match kind {
                    BarKind::Io => (&mut io, io_end, "I/O", CMD_IO),
                    BarKind::Memory { .. } => (&mut mmio, PCI_MMIO_END, "memory", CMD_MEMORY),
                };
                let base = cursor.next_multiple_of(size);
                if base + size > end {
                    return Err(PciError::WindowExhausted(space));
                }
                *cursor = base + size;
                pci.set_bar_address(index, base as u32);
                decode |= bit;
                debug!("pci {} BAR{} {} at {:#x}+{:#x}", bdf, index, space, base, size);
            }
            pci.enable_decode(decode | CMD_BUS_MASTER);
        }
        Ok(())
    }

    fn data_read(&self, port: u16, width: AccessWidth) -> u32 {
        let address = self.state.address;
        if address & ENABLE_BIT == 0 {
            return width.mask();
        }
        let Some(function) = self.functions.get(&Bdf::from_address(address)) else {
            return width.mask();
        };
        let offset = (address & 0xFC) as u16 + (port - CONFIG_DATA_PORT);
        lock(function).config_read(offset, width)
    }

    fn data_write(&self, port: u16, width: AccessWidth, value: u32) {
        let address = self.state.address;
        if address & ENABLE_BIT == 0 {
            return;
        }
        let Some(function) = self.functions.get(&Bdf::from_address(address)) else {
            debug!("config write to empty slot {}", Bdf::from_address(address));
            return;
        };
        let offset = (address & 0xFC) as u16 + (port - CONFIG_DATA_PORT);
        lock(function).config_write(offset, width, value);
    }

    /// Run `access` against the function whose BAR of `kind` contains `addr`.
    fn with_bar<R>(
        &self,
        addr: u64,
        io: bool,
        access: impl FnOnce(&mut dyn PciFunction, usize, u64) -> R,
    ) -> Option<R> {
        for function in self.functions.values() {
            let mut function = lock(function);
            let hit = (0..NUM_BARS).find_map(|index| {
                let (kind, base, size) = function.pci().bar_window(index)?;
                let matches_space = matches!(kind, BarKind::Io) == io;
                (matches_space && addr >= base && addr - base < size).then(|| (index, addr - base))
            });
            let Some((index, offset)) = hit else {
                continue;
            };

            let name = function.name().to_string();
            if let Some(isolation) = &self.isolation {
                if isolation.is_isolated(&name) {
                    return None;
                }
            }
            let result = access(&mut *function, index, offset);
            let faults = function.take_faults();
            drop(function);
            if let Some(isolation) = &self.isolation {
                for _ in 0..faults {
                    isolation.track_device_fault(&name);
                }
            }
            return Some(result);
        }
        None
    }
}

impl Device for PciConfigSpace {
    fn name(&self) -> &str {
        "pci-host"
    }

    fn io_read(&mut self, port: u16, width: AccessWidth) -> u32 {
        match port {
            RESET_CONTROL_PORT if width == AccessWidth::Byte => {
                self.state.reset_control.read() as u32
            }
            0xCF8..=0xCFB => extract(
                self.state.address as u64,
                (port - CONFIG_ADDRESS_PORT) as u64,
                width,
            ),
            0xCFC..=0xCFF => self.data_read(port, width),
            _ => {
                let port = port as u64;
                self.with_bar(port, true, |f, bar, offset| f.bar_read(bar, offset, width))
                    .map_or(width.mask(), |v| v & width.mask())
            }
        }
    }

    fn io_write(&mut self, port: u16, width: AccessWidth, value: u32) {
        match port {
            RESET_CONTROL_PORT if width == AccessWidth::Byte => {
                if let Some(event) = self.state.reset_control.write(value as u8) {
                    if let Some(cb) = &self.power {
                        cb(event);
                    }
                }
            }
            0xCF8..=0xCFB => {
                let offset = (port - CONFIG_ADDRESS_PORT) as u64;
                let address = deposit(self.state.address as u64, offset, width, value) as u32;
                // Low two bits are hardwired to zero.
                self.state.address = address & !0x3;
            }
            0xCFC..=0xCFF => self.data_write(port, width, value),
            _ => {
                let hit = self.with_bar(port as u64, true, |f, bar, offset| {
                    f.bar_write(bar, offset, width, value)
                });
                if hit.is_none() {
                    debug!("PCI I/O write to unclaimed port {:#x}", port);
                }
            }
        }
    }

    fn mmio_read(&mut self, offset: u64, width: AccessWidth) -> u32 {
        self.with_bar(PCI_MMIO_BASE + offset, false, |f, bar, off| {
            f.bar_read(bar, off, width)
        })
        .map_or(width.mask(), |v| v & width.mask())
    }

    fn mmio_write(&mut self, offset: u64, width: AccessWidth, value: u32) {
        let addr = PCI_MMIO_BASE + offset;
        let hit = self.with_bar(addr, false, |f, bar, off| f.bar_write(bar, off, width, value));
        if hit.is_none() {
            debug!("PCI MMIO write to unclaimed address {:#x}", addr);
        }
    }

    /// Resets the mechanism and every function behind it.
    fn reset(&mut self) {
        self.state = HostState::default();
        for function in self.functions.values() {
            lock(function).reset();
        }
    }

    fn snapshot(&self) -> Result<DeviceSnapshot, SnapshotError> {
        DeviceSnapshot::capture(self.name(), &self.state)
    }

    fn restore(&mut self, snapshot: &DeviceSnapshot) -> Result<(), SnapshotError> {
        self.state = snapshot.decode(self.name())?;
        Ok(())
    }
}

/// Host bridge function at 00:00.0 (Intel 82441FX PMC).
pub struct HostBridge {
    pci: PciDevice,
}

impl Default for HostBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBridge {
    pub fn new() -> Self {
        Self {
            pci: PciDevice::new(0x8086, 0x1237, 0x06, 0x00, 0x00).with_revision(0x02),
        }
    }
}

impl Device for HostBridge {
    fn name(&self) -> &str {
        "host-bridge"
    }

    fn reset(&mut self) {
        self.pci.reset();
    }

    fn snapshot(&self) -> Result<DeviceSnapshot, SnapshotError> {
        DeviceSnapshot::capture(self.name(), &self.pci.save())
    }

    fn restore(&mut self, snapshot: &DeviceSnapshot) -> Result<(), SnapshotError> {
        self.pci.load(snapshot.decode(self.name())?)
    }
}

impl PciFunction for HostBridge {
    fn pci(&self) -> &PciDevice {
        &self.pci
    }

    fn pci_mut(&mut self) -> &mut PciDevice {
        &mut self.pci
    }
}
