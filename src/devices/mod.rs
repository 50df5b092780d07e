//! Device emulation for the VMM.
//!
//! Every emulated chip implements [`Device`]. Devices are created once while the
//! platform is built, registered on the [`bus::DeviceBus`] (and, for PCI
//! functions, on [`crate::pci::PciConfigSpace`]), mutated only by guest traps
//! and periodic ticks, and reset rather than destroyed on reboot.
//!
//! ```text
//!  VCPU trap ──► DeviceBus ──► Device::io_write / mmio_write
//!                                   │
//!                                   │ IrqLine::raise
//!                                   ▼
//!                            InterruptSink (InterruptRouter)
//!                              │                  │
//!                              ▼                  ▼
//!                         PicController        IoApic ──► LocalApic ──► VCPU
//! ```

pub mod acpi;
pub mod ahci;
pub mod bochs;
pub mod bus;
pub mod disk;
pub mod dma;
pub mod e1000;
pub mod hpet;
pub mod ioapic;
pub mod lapic;
pub mod pic;
pub mod pit;
pub mod ps2;
pub mod rtc;
pub mod serial;
pub mod system;
pub mod tpm;
pub mod vga;
pub mod virtio;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::interrupts::MsiMessage;

pub use bus::{BusError, DeviceBus};

/// Access width of a trapped I/O or MMIO transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessWidth {
    Byte,
    Word,
    Dword,
}

impl AccessWidth {
    /// Width for an access of `len` bytes, if the CPU can generate it.
    pub fn from_len(len: usize) -> Option<Self> {
        match len {
            1 => Some(Self::Byte),
            2 => Some(Self::Word),
            4 => Some(Self::Dword),
            _ => None,
        }
    }

    /// Number of bytes transferred.
    pub fn bytes(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::Dword => 4,
        }
    }

    /// All-ones value of this width; what a floating bus returns.
    pub fn mask(self) -> u32 {
        match self {
            Self::Byte => 0xFF,
            Self::Word => 0xFFFF,
            Self::Dword => 0xFFFF_FFFF,
        }
    }
}

/// Direction (and payload) of a trapped access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write(u32),
}

/// A trapped port I/O transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRequest {
    pub port: u16,
    pub width: AccessWidth,
    pub kind: RequestKind,
}

impl IoRequest {
    pub fn read(port: u16, width: AccessWidth) -> Self {
        Self {
            port,
            width,
            kind: RequestKind::Read,
        }
    }

    pub fn write(port: u16, width: AccessWidth, value: u32) -> Self {
        Self {
            port,
            width,
            kind: RequestKind::Write(value & width.mask()),
        }
    }
}

/// A trapped memory-mapped I/O transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioRequest {
    pub addr: u64,
    pub width: AccessWidth,
    pub kind: RequestKind,
}

impl MmioRequest {
    pub fn read(addr: u64, width: AccessWidth) -> Self {
        Self {
            addr,
            width,
            kind: RequestKind::Read,
        }
    }

    pub fn write(addr: u64, width: AccessWidth, value: u32) -> Self {
        Self {
            addr,
            width,
            kind: RequestKind::Write(value & width.mask()),
        }
    }
}

/// Capability contract every emulated chip implements.
///
/// Port I/O handlers receive the absolute port number, because several chips
/// answer on more than one port range (the PIC on 0x20, 0xA0 and 0x4D0). MMIO
/// handlers receive the offset from the base of the registered window.
///
/// Reads of registers a device does not implement return the floating-bus
/// value for the access width; writes are dropped. Neither is an error.
pub trait Device: Send {
    /// Stable name used for logging, snapshots and fault isolation.
    fn name(&self) -> &str;

    fn io_read(&mut self, _port: u16, width: AccessWidth) -> u32 {
        width.mask()
    }

    fn io_write(&mut self, _port: u16, _width: AccessWidth, _value: u32) {}

    fn mmio_read(&mut self, _offset: u64, width: AccessWidth) -> u32 {
        width.mask()
    }

    fn mmio_write(&mut self, _offset: u64, _width: AccessWidth, _value: u32) {}

    /// Return to power-on state. Host attachments (disk, memory, IRQ wiring)
    /// survive a reset.
    fn reset(&mut self);

    /// Capture the architectural register state.
    fn snapshot(&self) -> Result<DeviceSnapshot, SnapshotError>;

    /// Replace the architectural register state.
    fn restore(&mut self, snapshot: &DeviceSnapshot) -> Result<(), SnapshotError>;

    /// Number of guest-induced faults (bad DMA descriptors and the like) since
    /// the last call. The bus feeds these into fault isolation.
    fn take_faults(&mut self) -> u32 {
        0
    }
}

/// A device shared between the bus, the tick scheduler and its owner.
pub type SharedDevice = Arc<Mutex<dyn Device>>;

/// Lock a device mutex, recovering the state if a previous holder panicked.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("recovering poisoned device lock");
        poisoned.into_inner()
    })
}

/// Receiver of interrupt assertions; implemented by the interrupt router.
pub trait InterruptSink: Send + Sync {
    /// Drive a legacy IRQ / GSI line.
    fn set_irq(&self, irq: u32, level: bool);

    /// Deliver a message-signaled interrupt.
    fn send_msi(&self, msg: MsiMessage);
}

/// Interrupt line owned by a device.
///
/// An unconnected line silently drops assertions, which lets devices be unit
/// tested without a router.
#[derive(Clone, Default)]
pub struct IrqLine {
    line: u32,
    sink: Option<Arc<dyn InterruptSink>>,
}

impl IrqLine {
    pub fn new(line: u32, sink: Arc<dyn InterruptSink>) -> Self {
        Self {
            line,
            sink: Some(sink),
        }
    }

    /// A line with a number but no receiver.
    pub fn disconnected(line: u32) -> Self {
        Self { line, sink: None }
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn is_connected(&self) -> bool {
        self.sink.is_some()
    }

    pub fn set_level(&self, level: bool) {
        if let Some(sink) = &self.sink {
            sink.set_irq(self.line, level);
        }
    }

    pub fn raise(&self) {
        self.set_level(true);
    }

    pub fn lower(&self) {
        self.set_level(false);
    }

    /// Edge: assert then immediately deassert.
    pub fn pulse(&self) {
        self.raise();
        self.lower();
    }

    /// Send an MSI through the same receiver as the pin.
    pub fn send_msi(&self, msg: MsiMessage) {
        if let Some(sink) = &self.sink {
            sink.send_msi(msg);
        }
    }
}

impl fmt::Debug for IrqLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IrqLine")
            .field("line", &self.line)
            .field("connected", &self.sink.is_some())
            .finish()
    }
}

/// Platform power requests raised by guest writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerEvent {
    /// ACPI S5 soft-off.
    Shutdown,
    /// ACPI sleep with a SLP_TYP other than soft-off; bookkeeping only.
    Sleep(u8),
    /// Full platform reset (0xCF9 with SYS_RST).
    HardReset,
    /// CPU-only reset (0xCF9 without SYS_RST, 8042 pulse, port 0x92).
    SoftReset,
}

/// Callback through which devices report [`PowerEvent`]s.
pub type PowerCallback = Arc<dyn Fn(PowerEvent) + Send + Sync>;

/// Snapshot/restore failures.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Snapshot belongs to device {found}, expected {expected}")]
    DeviceMismatch { expected: String, found: String },

    #[error("Failed to encode or decode device state: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Snapshot is inconsistent: {0}")]
    Malformed(String),
}

/// Serialized architectural state of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    /// Name of the device that produced the snapshot.
    pub device: String,
    /// `serde_json` encoding of the device's register file.
    pub data: Vec<u8>,
}

impl DeviceSnapshot {
    pub fn capture<T: Serialize>(device: &str, state: &T) -> Result<Self, SnapshotError> {
        Ok(Self {
            device: device.to_string(),
            data: serde_json::to_vec(state)?,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self, device: &str) -> Result<T, SnapshotError> {
        if self.device != device {
            return Err(SnapshotError::DeviceMismatch {
                expected: device.to_string(),
                found: self.device.clone(),
            });
        }
        Ok(serde_json::from_slice(&self.data)?)
    }
}

/// Extract the `width`-byte field at byte `offset_in_reg` of a wider register.
#[inline]
pub(crate) fn extract(reg: u64, offset_in_reg: u64, width: AccessWidth) -> u32 {
    ((reg >> (offset_in_reg * 8)) as u32) & width.mask()
}

/// Merge a `width`-byte write at byte `offset_in_reg` into a wider register.
#[inline]
pub(crate) fn deposit(reg: u64, offset_in_reg: u64, width: AccessWidth, value: u32) -> u64 {
    let shift = offset_in_reg * 8;
    let mask = (width.mask() as u64) << shift;
    (reg & !mask) | (((value & width.mask()) as u64) << shift)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Test doubles shared by device unit tests.

    use super::*;

    /// Records every interrupt assertion it receives.
    #[derive(Default)]
    pub struct RecordingSink {
        pub irqs: Mutex<Vec<(u32, bool)>>,
        pub msis: Mutex<Vec<MsiMessage>>,
    }

    impl RecordingSink {
        pub fn raises(&self, line: u32) -> usize {
            self.irqs
                .lock()
                .unwrap()
                .iter()
                .filter(|&&(l, level)| l == line && level)
                .count()
        }

        pub fn level(&self, line: u32) -> bool {
            self.irqs
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|&&(l, _)| l == line)
                .map(|&(_, level)| level)
                .unwrap_or(false)
        }
    }

    impl InterruptSink for RecordingSink {
        fn set_irq(&self, irq: u32, level: bool) {
            self.irqs.lock().unwrap().push((irq, level));
        }

        fn send_msi(&self, msg: MsiMessage) {
            self.msis.lock().unwrap().push(msg);
        }
    }

    pub fn recording_line(line: u32) -> (IrqLine, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (IrqLine::new(line, sink.clone()), sink)
    }

    /// Rewrite the encoded register file of `snapshot`.
    pub fn edit_snapshot(
        snapshot: &DeviceSnapshot,
        edit: impl FnOnce(&mut serde_json::Value),
    ) -> DeviceSnapshot {
        let mut value: serde_json::Value = serde_json::from_slice(&snapshot.data).unwrap();
        edit(&mut value);
        DeviceSnapshot {
            device: snapshot.device.clone(),
            data: serde_json::to_vec(&value).unwrap(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_width_mask() {
        assert_eq!(AccessWidth::Byte.mask(), 0xFF);
        assert_eq!(AccessWidth::Word.mask(), 0xFFFF);
        assert_eq!(AccessWidth::Dword.mask(), 0xFFFF_FFFF);
        assert_eq!(AccessWidth::from_len(3), None);
    }

    #[test]
    fn test_write_request_truncates_value() {
        let req = IoRequest::write(0x80, AccessWidth::Byte, 0x1234);
        assert_eq!(req.kind, RequestKind::Write(0x34));
    }

    #[test]
    fn test_deposit_extract() {
        let reg = deposit(0x1122_3344_5566_7788, 4, AccessWidth::Word, 0xABCD);
        assert_eq!(reg, 0x1122_ABCD_5566_7788);
        assert_eq!(extract(reg, 4, AccessWidth::Dword), 0x1122_ABCD);
        assert_eq!(extract(reg, 1, AccessWidth::Byte), 0x77);
    }

    #[test]
    fn test_disconnected_line_is_silent() {
        let line = IrqLine::disconnected(4);
        line.raise();
        assert!(!line.is_connected());
        assert_eq!(line.line(), 4);
    }

    #[test]
    fn test_snapshot_mismatch() {
        let snap = DeviceSnapshot::capture("pit", &42u32).unwrap();
        assert_eq!(snap.decode::<u32>("pit").unwrap(), 42);
        assert!(matches!(
            snap.decode::<u32>("rtc"),
            Err(SnapshotError::DeviceMismatch { .. })
        ));
    }
}
