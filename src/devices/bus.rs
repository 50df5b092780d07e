//! Port and memory bus that routes trapped accesses to devices.
//!
//! When the guest executes `IN`/`OUT` or touches an MMIO window, the VCPU trap
//! source hands the transaction to [`DeviceBus`], which finds the device that
//! owns the address and forwards the access to it.
//!
//! # Address Spaces
//!
//! ```text
//! port space    0x0000 - 0xFFFF        PIC, PIT, RTC, 8042, UART, DMA, PCI host, ...
//! memory space  0x0000_0000 - 2^64-1   PCI BARs, IOAPIC, HPET, TPM CRB
//! ```
//!
//! Each space keeps its bindings sorted by base address and looks them up with
//! a binary search. Ranges are checked for overlap at registration time, so a
//! lookup can never match two devices.
//!
//! A miss behaves like an unterminated bus on real hardware: reads return all
//! ones for the access width and writes vanish.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use super::{lock, IoRequest, MmioRequest, RequestKind, SharedDevice};
use crate::recovery::FaultIsolation;

/// Setup-time bus errors. These are fatal: the VM must not start.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum BusError {
    #[error("{space} range {base:#x}+{len:#x} for {device} overlaps {existing}")]
    Overlap {
        space: AddressSpace,
        base: u64,
        len: u64,
        device: String,
        existing: String,
    },

    #[error("{space} range at {base:#x} for {device} is empty or wraps")]
    InvalidRange {
        space: AddressSpace,
        base: u64,
        device: String,
    },
}

/// Which bus a binding lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpace {
    Port,
    Memory,
}

impl std::fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressSpace::Port => f.write_str("port"),
            AddressSpace::Memory => f.write_str("memory"),
        }
    }
}

/// A registered range on one of the buses.
struct Binding {
    /// First address of the range.
    base: u64,
    /// One past the last address of the range.
    end: u64,
    /// Device name, cached so lookups don't need the device lock.
    name: String,
    device: SharedDevice,
}

/// Public description of a binding, for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusRange {
    pub space: AddressSpace,
    pub base: u64,
    pub len: u64,
    pub device: String,
}

/// Bus that routes accesses to registered devices.
#[derive(Default)]
pub struct DeviceBus {
    /// Port space bindings sorted by base.
    io: Vec<Binding>,
    /// Memory space bindings sorted by base.
    mmio: Vec<Binding>,
    /// When set, isolated devices are skipped and device faults are tracked.
    isolation: Option<Arc<FaultIsolation>>,
}

impl DeviceBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consult `isolation` before every dispatch.
    pub fn with_isolation(isolation: Arc<FaultIsolation>) -> Self {
        Self {
            isolation: Some(isolation),
            ..Self::default()
        }
    }

    /// Register `device` for ports `base..base + len`.
    pub fn register_io(&mut self, base: u16, len: u16, device: SharedDevice) -> Result<(), BusError> {
        let end = base as u64 + len as u64;
        Self::insert(&mut self.io, AddressSpace::Port, base as u64, end, device)
    }

    /// Register `device` for guest physical addresses `base..base + len`.
    pub fn register_mmio(&mut self, base: u64, len: u64, device: SharedDevice) -> Result<(), BusError> {
        let name = lock(&device).name().to_string();
        let end = base.checked_add(len).ok_or_else(|| BusError::InvalidRange {
            space: AddressSpace::Memory,
            base,
            device: name,
        })?;
        Self::insert(&mut self.mmio, AddressSpace::Memory, base, end, device)
    }

    fn insert(
        bindings: &mut Vec<Binding>,
        space: AddressSpace,
        base: u64,
        end: u64,
        device: SharedDevice,
    ) -> Result<(), BusError> {
        let name = lock(&device).name().to_string();
        if end <= base {
            return Err(BusError::InvalidRange {
                space,
                base,
                device: name,
            });
        }

        if let Some(existing) = bindings.iter().find(|b| base < b.end && b.base < end) {
            return Err(BusError::Overlap {
                space,
                base,
                len: end - base,
                device: name,
                existing: existing.name.clone(),
            });
        }

        info!("{} {} registered at {:#x}..{:#x}", space, name, base, end);
        let pos = bindings.partition_point(|b| b.base < base);
        bindings.insert(
            pos,
            Binding {
                base,
                end,
                name,
                device,
            },
        );
        Ok(())
    }

    /// Binary search for the binding containing `addr`.
    fn find(bindings: &[Binding], addr: u64) -> Option<&Binding> {
        let idx = bindings.partition_point(|b| b.base <= addr);
        let candidate = bindings.get(idx.checked_sub(1)?)?;
        (addr < candidate.end).then_some(candidate)
    }

    fn dispatchable<'a>(&self, binding: Option<&'a Binding>) -> Option<&'a Binding> {
        let binding = binding?;
        match &self.isolation {
            Some(isolation) if isolation.is_isolated(&binding.name) => None,
            _ => Some(binding),
        }
    }

    fn collect_faults(&self, binding: &Binding, faults: u32) {
        if faults == 0 {
            return;
        }
        if let Some(isolation) = &self.isolation {
            for _ in 0..faults {
                isolation.track_device_fault(&binding.name);
            }
        }
    }

    /// Dispatch a port access. Returns the value for reads, `None` for writes.
    pub fn handle_io(&self, req: &IoRequest) -> Option<u32> {
        let Some(binding) = self.dispatchable(Self::find(&self.io, req.port as u64)) else {
            return match req.kind {
                RequestKind::Read => {
                    debug!("IN port={:#x} -> unclaimed", req.port);
                    Some(req.width.mask())
                }
                RequestKind::Write(value) => {
                    debug!("OUT port={:#x} <- {:#x} unclaimed", req.port, value);
                    None
                }
            };
        };

        let (result, faults) = {
            let mut device = lock(&binding.device);
            let result = match req.kind {
                RequestKind::Read => Some(device.io_read(req.port, req.width) & req.width.mask()),
                RequestKind::Write(value) => {
                    device.io_write(req.port, req.width, value);
                    None
                }
            };
            (result, device.take_faults())
        };
        self.collect_faults(binding, faults);
        result
    }

    /// Dispatch an MMIO access. Returns the value for reads, `None` for writes.
    pub fn handle_mmio(&self, req: &MmioRequest) -> Option<u32> {
        let Some(binding) = self.dispatchable(Self::find(&self.mmio, req.addr)) else {
            return match req.kind {
                RequestKind::Read => Some(req.width.mask()),
                RequestKind::Write(_) => None,
            };
        };

        let offset = req.addr - binding.base;
        let (result, faults) = {
            let mut device = lock(&binding.device);
            let result = match req.kind {
                RequestKind::Read => Some(device.mmio_read(offset, req.width) & req.width.mask()),
                RequestKind::Write(value) => {
                    device.mmio_write(offset, req.width, value);
                    None
                }
            };
            (result, device.take_faults())
        };
        self.collect_faults(binding, faults);
        result
    }

    /// All registered ranges, port space first.
    pub fn ranges(&self) -> Vec<BusRange> {
        let describe = |space, b: &Binding| BusRange {
            space,
            base: b.base,
            len: b.end - b.base,
            device: b.name.clone(),
        };
        self.io
            .iter()
            .map(|b| describe(AddressSpace::Port, b))
            .chain(self.mmio.iter().map(|b| describe(AddressSpace::Memory, b)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{AccessWidth, Device, DeviceSnapshot, SnapshotError};
    use std::sync::Mutex;

    struct MockDevice {
        name: &'static str,
        value: u32,
        faults: u32,
    }

    impl MockDevice {
        fn shared(name: &'static str, value: u32) -> Arc<Mutex<MockDevice>> {
            Arc::new(Mutex::new(MockDevice {
                name,
                value,
                faults: 0,
            }))
        }
    }

    impl Device for MockDevice {
        fn name(&self) -> &str {
            self.name
        }

        fn io_read(&mut self, _port: u16, _width: AccessWidth) -> u32 {
            self.value
        }

        fn io_write(&mut self, _port: u16, _width: AccessWidth, value: u32) {
            self.value = value;
            if value == 0xBAD {
                self.faults += 1;
            }
        }

        fn mmio_read(&mut self, offset: u64, _width: AccessWidth) -> u32 {
            if offset == 0 {
                self.value
            } else {
                offset as u32
            }
        }

        fn mmio_write(&mut self, offset: u64, _width: AccessWidth, value: u32) {
            if offset == 0 {
                self.value = value;
            }
        }

        fn reset(&mut self) {
            self.value = 0;
        }

        fn snapshot(&self) -> Result<DeviceSnapshot, SnapshotError> {
            DeviceSnapshot::capture(self.name, &self.value)
        }

        fn restore(&mut self, snapshot: &DeviceSnapshot) -> Result<(), SnapshotError> {
            self.value = snapshot.decode(self.name)?;
            Ok(())
        }

        fn take_faults(&mut self) -> u32 {
            std::mem::take(&mut self.faults)
        }
    }

    #[test]
    fn test_mmio_bus() {
        let mut bus = DeviceBus::new();
        bus.register_mmio(0x1000, 0x100, MockDevice::shared("mock", 0x12345678))
            .unwrap();

        let read = MmioRequest::read(0x1000, AccessWidth::Dword);
        assert_eq!(bus.handle_mmio(&read), Some(0x12345678));

        bus.handle_mmio(&MmioRequest::write(0x1000, AccessWidth::Dword, 0xDEADBEEF));
        assert_eq!(bus.handle_mmio(&read), Some(0xDEADBEEF));

        // Offsets are relative to the window base.
        let inner = MmioRequest::read(0x1010, AccessWidth::Dword);
        assert_eq!(bus.handle_mmio(&inner), Some(0x10));

        // Read from unmapped region returns all ones
        let miss = MmioRequest::read(0x2000, AccessWidth::Dword);
        assert_eq!(bus.handle_mmio(&miss), Some(0xFFFF_FFFF));
    }

    #[test]
    fn test_io_miss_returns_ff() {
        let bus = DeviceBus::new();
        let req = IoRequest::read(0x3f8, AccessWidth::Byte);
        assert_eq!(bus.handle_io(&req), Some(0xFF));
        let req = IoRequest::read(0x3f8, AccessWidth::Word);
        assert_eq!(bus.handle_io(&req), Some(0xFFFF));
        assert_eq!(bus.handle_io(&IoRequest::write(0x3f8, AccessWidth::Byte, 1)), None);
    }

    #[test]
    fn test_overlap_rejected() {
        let mut bus = DeviceBus::new();
        bus.register_io(0x20, 2, MockDevice::shared("pic", 0)).unwrap();
        bus.register_io(0x40, 4, MockDevice::shared("pit", 0)).unwrap();

        let err = bus
            .register_io(0x21, 4, MockDevice::shared("bad", 0))
            .unwrap_err();
        assert!(matches!(err, BusError::Overlap { ref existing, .. } if existing == "pic"));

        // Adjacent ranges are fine.
        bus.register_io(0x22, 2, MockDevice::shared("next", 0)).unwrap();
        assert_eq!(bus.ranges().len(), 3);
    }

    #[test]
    fn test_empty_range_rejected() {
        let mut bus = DeviceBus::new();
        assert!(matches!(
            bus.register_io(0x80, 0, MockDevice::shared("post", 0)),
            Err(BusError::InvalidRange { .. })
        ));
        assert!(bus
            .register_mmio(u64::MAX, 2, MockDevice::shared("wrap", 0))
            .is_err());
    }

    #[test]
    fn test_lookup_picks_containing_range() {
        let mut bus = DeviceBus::new();
        bus.register_io(0x60, 1, MockDevice::shared("kbd", 0x11)).unwrap();
        bus.register_io(0x40, 4, MockDevice::shared("pit", 0x22)).unwrap();
        bus.register_io(0x20, 2, MockDevice::shared("pic", 0x33)).unwrap();

        assert_eq!(bus.handle_io(&IoRequest::read(0x43, AccessWidth::Byte)), Some(0x22));
        assert_eq!(bus.handle_io(&IoRequest::read(0x21, AccessWidth::Byte)), Some(0x33));
        assert_eq!(bus.handle_io(&IoRequest::read(0x44, AccessWidth::Byte)), Some(0xFF));
        assert_eq!(bus.handle_io(&IoRequest::read(0x60, AccessWidth::Byte)), Some(0x11));
    }

    #[test]
    fn test_isolated_device_is_skipped() {
        let isolation = Arc::new(FaultIsolation::new(2));
        let mut bus = DeviceBus::with_isolation(isolation.clone());
        let dev = MockDevice::shared("flaky", 7);
        bus.register_io(0x80, 1, dev.clone()).unwrap();

        bus.handle_io(&IoRequest::write(0x80, AccessWidth::Dword, 0xBAD));
        assert!(!isolation.is_isolated("flaky"));
        bus.handle_io(&IoRequest::write(0x80, AccessWidth::Dword, 0xBAD));
        assert!(isolation.is_isolated("flaky"));

        // Further accesses never reach the device.
        bus.handle_io(&IoRequest::write(0x80, AccessWidth::Dword, 5));
        assert_eq!(dev.lock().unwrap().value, 0xBAD);
        assert_eq!(
            bus.handle_io(&IoRequest::read(0x80, AccessWidth::Byte)),
            Some(0xFF)
        );
    }
}
