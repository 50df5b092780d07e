//! I/O APIC (82093AA) emulation.
//!
//! Translates the 24 global system interrupt (GSI) inputs into APIC bus
//! messages through a redirection table.
//!
//! # MMIO Layout
//!
//! | Offset | Register |
//! |--------|----------|
//! | 0x00 | IOREGSEL (index) |
//! | 0x10 | IOWIN (data for the selected index) |
//! | 0x40 | EOI (write a vector to clear remote IRR) |
//!
//! # Indirect Registers
//!
//! | Index | Register |
//! |-------|----------|
//! | 0x00 | IOAPICID (bits 27:24) |
//! | 0x01 | IOAPICVER (version 0x11, max entry 23) |
//! | 0x02 | IOAPICARB |
//! | 0x10 + 2n | redirection entry n, low dword |
//! | 0x11 + 2n | redirection entry n, high dword (destination in 31:24) |
//!
//! # Redirection Entry (low dword)
//!
//! ```text
//! 16      15       14          13        12       11       10:8      7:0
//! mask  trigger  remote IRR  polarity  status  dest mode  delivery  vector
//! ```
//!
//! Inputs are logical assertions: the polarity bit is stored for the guest
//! but the line level passed to [`IoApic::set_irq`] is already "asserted".

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AccessWidth, Device, DeviceSnapshot, SnapshotError};
use crate::interrupts::{ApicMessage, DeliveryMode, DestinationMode, Shorthand};

pub const IOAPIC_BASE: u64 = 0xFEC0_0000;
pub const IOAPIC_SIZE: u64 = 0x1000;
pub const NUM_PINS: usize = 24;

pub mod regs {
    pub const IOREGSEL: u64 = 0x00;
    pub const IOWIN: u64 = 0x10;
    pub const EOI: u64 = 0x40;

    pub const ID: u32 = 0x00;
    pub const VERSION: u32 = 0x01;
    pub const ARBITRATION: u32 = 0x02;
    pub const REDIRECTION_BASE: u32 = 0x10;
}

const VERSION: u32 = 0x11;

const ENTRY_MASKED: u64 = 1 << 16;
const ENTRY_LEVEL: u64 = 1 << 15;
const ENTRY_REMOTE_IRR: u64 = 1 << 14;
const ENTRY_DELIVERY_STATUS: u64 = 1 << 12;
const ENTRY_LOGICAL: u64 = 1 << 11;
/// Bits the guest may write: everything except remote IRR and delivery status.
const ENTRY_WRITABLE: u64 = 0xFF00_0000_0001_AFFF;

/// Receives every message the IOAPIC sends.
pub type DeliveryCallback = Box<dyn FnMut(ApicMessage) + Send>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IoApicRegs {
    id: u8,
    select: u8,
    redirection: [u64; NUM_PINS],
    /// Current input levels, one bit per pin.
    levels: u32,
}

impl Default for IoApicRegs {
    fn default() -> Self {
        Self {
            id: 0,
            select: 0,
            redirection: [ENTRY_MASKED; NUM_PINS],
            levels: 0,
        }
    }
}

pub struct IoApic {
    regs: IoApicRegs,
    deliver: Option<DeliveryCallback>,
}

impl IoApic {
    pub fn new(deliver: DeliveryCallback) -> Self {
        Self {
            regs: IoApicRegs::default(),
            deliver: Some(deliver),
        }
    }

    /// An IOAPIC whose messages go nowhere until a callback is attached.
    pub fn disconnected() -> Self {
        Self {
            regs: IoApicRegs::default(),
            deliver: None,
        }
    }

    pub fn set_delivery_callback(&mut self, deliver: DeliveryCallback) {
        self.deliver = Some(deliver);
    }

    pub fn redirection_entry(&self, pin: usize) -> Option<u64> {
        self.regs.redirection.get(pin).copied()
    }

    /// Drive input `gsi`.
    ///
    /// Edge entries fire on the rising edge. Level entries fire while
    /// asserted and remote IRR is clear. Masked entries never fire.
    pub fn set_irq(&mut self, gsi: u32, level: bool) {
        let pin = gsi as usize;
        if pin >= NUM_PINS {
            debug!("IOAPIC ignoring GSI {}", gsi);
            return;
        }
        let bit = 1u32 << pin;
        let was_high = self.regs.levels & bit != 0;
        if !level {
            self.regs.levels &= !bit;
            return;
        }
        self.regs.levels |= bit;

        let entry = self.regs.redirection[pin];
        if entry & ENTRY_LEVEL != 0 {
            if entry & ENTRY_REMOTE_IRR == 0 {
                self.fire(pin);
            }
        } else if !was_high {
            self.fire(pin);
        }
    }

    fn fire(&mut self, pin: usize) {
        let entry = self.regs.redirection[pin];
        if entry & ENTRY_MASKED != 0 {
            return;
        }
        let Some(delivery) = DeliveryMode::from_bits((entry >> 8) as u32) else {
            debug!("IOAPIC pin {} has reserved delivery mode", pin);
            return;
        };
        let level_triggered = entry & ENTRY_LEVEL != 0;
        if level_triggered {
            self.regs.redirection[pin] |= ENTRY_REMOTE_IRR;
        }
        let msg = ApicMessage {
            vector: entry as u8,
            delivery,
            dest_mode: if entry & ENTRY_LOGICAL != 0 {
                DestinationMode::Logical
            } else {
                DestinationMode::Physical
            },
            dest: (entry >> 56) as u8,
            shorthand: Shorthand::None,
            source: 0,
            level_triggered,
            assert: true,
        };
        if let Some(deliver) = self.deliver.as_mut() {
            deliver(msg);
        }
    }

    /// Level-triggered EOI for `vector`: clear remote IRR and re-deliver any
    /// line that is still asserted.
    pub fn eoi(&mut self, vector: u8) {
        for pin in 0..NUM_PINS {
            let entry = self.regs.redirection[pin];
            if entry as u8 != vector || entry & ENTRY_REMOTE_IRR == 0 {
                continue;
            }
            self.regs.redirection[pin] &= !ENTRY_REMOTE_IRR;
            if entry & ENTRY_LEVEL != 0 && self.regs.levels & (1 << pin) != 0 {
                self.fire(pin);
            }
        }
    }

    fn read_indirect(&self) -> u32 {
        let index = self.regs.select as u32;
        match index {
            regs::ID | regs::ARBITRATION => (self.regs.id as u32 & 0xF) << 24,
            regs::VERSION => VERSION | ((NUM_PINS as u32 - 1) << 16),
            _ => match Self::entry_index(index) {
                Some((pin, high)) => {
                    let entry = self.regs.redirection[pin] & !ENTRY_DELIVERY_STATUS;
                    if high {
                        (entry >> 32) as u32
                    } else {
                        entry as u32
                    }
                }
                None => 0,
            },
        }
    }

    fn write_indirect(&mut self, value: u32) {
        let index = self.regs.select as u32;
        if index == regs::ID {
            self.regs.id = ((value >> 24) & 0xF) as u8;
            return;
        }
        let Some((pin, high)) = Self::entry_index(index) else {
            return;
        };
        let old = self.regs.redirection[pin];
        let merged = if high {
            (old & 0xFFFF_FFFF) | ((value as u64) << 32)
        } else {
            (old & !0xFFFF_FFFF) | value as u64
        };
        let new = (merged & ENTRY_WRITABLE) | (old & ENTRY_REMOTE_IRR);
        // Edge-triggered entries have no remote IRR.
        let new = if new & ENTRY_LEVEL == 0 {
            new & !ENTRY_REMOTE_IRR
        } else {
            new
        };
        self.regs.redirection[pin] = new;

        // Unmasking an asserted level line delivers it now.
        let unmasked = old & ENTRY_MASKED != 0 && new & ENTRY_MASKED == 0;
        if unmasked
            && new & ENTRY_LEVEL != 0
            && new & ENTRY_REMOTE_IRR == 0
            && self.regs.levels & (1 << pin) != 0
        {
            self.fire(pin);
        }
    }

    fn entry_index(index: u32) -> Option<(usize, bool)> {
        let offset = index.checked_sub(regs::REDIRECTION_BASE)? as usize;
        let pin = offset / 2;
        (pin < NUM_PINS).then_some((pin, offset % 2 == 1))
    }
}

impl Device for IoApic {
    fn name(&self) -> &str {
        "ioapic"
    }

    fn mmio_read(&mut self, offset: u64, width: AccessWidth) -> u32 {
        match offset & !3 {
            regs::IOREGSEL => self.regs.select as u32 & width.mask(),
            regs::IOWIN => self.read_indirect() & width.mask(),
            _ => 0,
        }
    }

    fn mmio_write(&mut self, offset: u64, _width: AccessWidth, value: u32) {
        match offset & !3 {
            regs::IOREGSEL => self.regs.select = value as u8,
            regs::IOWIN => self.write_indirect(value),
            regs::EOI => self.eoi(value as u8),
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.regs = IoApicRegs::default();
    }

    fn snapshot(&self) -> Result<DeviceSnapshot, SnapshotError> {
        DeviceSnapshot::capture(self.name(), &self.regs)
    }

    fn restore(&mut self, snapshot: &DeviceSnapshot) -> Result<(), SnapshotError> {
        self.regs = snapshot.decode(self.name())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};

    fn recording() -> (IoApic, Arc<Mutex<Vec<ApicMessage>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let ioapic = IoApic::new(Box::new(move |msg| sink.lock().unwrap().push(msg)));
        (ioapic, log)
    }

    fn program(ioapic: &mut IoApic, pin: u32, low: u32, high: u32) {
        ioapic.mmio_write(regs::IOREGSEL, AccessWidth::Dword, regs::REDIRECTION_BASE + pin * 2 + 1);
        ioapic.mmio_write(regs::IOWIN, AccessWidth::Dword, high);
        ioapic.mmio_write(regs::IOREGSEL, AccessWidth::Dword, regs::REDIRECTION_BASE + pin * 2);
        ioapic.mmio_write(regs::IOWIN, AccessWidth::Dword, low);
    }

    fn read_index(ioapic: &mut IoApic, index: u32) -> u32 {
        ioapic.mmio_write(regs::IOREGSEL, AccessWidth::Dword, index);
        ioapic.mmio_read(regs::IOWIN, AccessWidth::Dword)
    }

    #[test]
    fn test_version_and_reset_masks() {
        let (mut ioapic, _) = recording();
        assert_eq!(read_index(&mut ioapic, regs::VERSION), 0x0017_0011);
        for pin in 0..NUM_PINS as u32 {
            let low = read_index(&mut ioapic, regs::REDIRECTION_BASE + pin * 2);
            assert_eq!(low & (1 << 16), 1 << 16);
        }
    }

    #[test]
    fn test_edge_delivery() {
        let (mut ioapic, log) = recording();
        program(&mut ioapic, 4, 0x34, 0x0100_0000);
        ioapic.set_irq(4, true);
        ioapic.set_irq(4, true); // no new edge
        ioapic.set_irq(4, false);
        ioapic.set_irq(4, true);
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].vector, 0x34);
        assert_eq!(log[0].dest, 1);
        assert!(!log[0].level_triggered);
    }

    #[test]
    fn test_level_remote_irr_and_eoi() {
        let (mut ioapic, log) = recording();
        program(&mut ioapic, 10, 0x8000 | 0x45, 0);
        ioapic.set_irq(10, true);
        ioapic.set_irq(10, true);
        assert_eq!(log.lock().unwrap().len(), 1);
        let low = read_index(&mut ioapic, regs::REDIRECTION_BASE + 20);
        assert_ne!(low & (1 << 14), 0);

        // Still asserted at EOI: re-delivered.
        ioapic.eoi(0x45);
        assert_eq!(log.lock().unwrap().len(), 2);

        ioapic.set_irq(10, false);
        ioapic.mmio_write(regs::EOI, AccessWidth::Dword, 0x45);
        assert_eq!(log.lock().unwrap().len(), 2);
        let low = read_index(&mut ioapic, regs::REDIRECTION_BASE + 20);
        assert_eq!(low & (1 << 14), 0);
    }

    #[test]
    fn test_unmask_delivers_pending_level() {
        let (mut ioapic, log) = recording();
        program(&mut ioapic, 9, 0x1_8000 | 0x29, 0);
        ioapic.set_irq(9, true);
        assert!(log.lock().unwrap().is_empty());
        program(&mut ioapic, 9, 0x8000 | 0x29, 0);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_read_only_bits_preserved() {
        let (mut ioapic, _) = recording();
        program(&mut ioapic, 0, 0x0000_7030, 0xFFFF_FFFF);
        let low = read_index(&mut ioapic, regs::REDIRECTION_BASE);
        let high = read_index(&mut ioapic, regs::REDIRECTION_BASE + 1);
        assert_eq!(low, 0x0000_2030);
        assert_eq!(high, 0xFF00_0000);
    }

    #[test]
    fn test_id_register() {
        let (mut ioapic, _) = recording();
        ioapic.mmio_write(regs::IOREGSEL, AccessWidth::Dword, regs::ID);
        ioapic.mmio_write(regs::IOWIN, AccessWidth::Dword, 0x0200_0000);
        assert_eq!(read_index(&mut ioapic, regs::ID), 0x0200_0000);
    }

    proptest! {
        #[test]
        fn prop_masked_entry_never_delivers(
            pin in 0u32..24,
            vector in 0x20u32..0xFF,
            level_triggered in any::<bool>(),
            toggles in proptest::collection::vec(any::<bool>(), 1..32),
        ) {
            let (mut ioapic, log) = recording();
            let trigger = if level_triggered { 0x8000 } else { 0 };
            program(&mut ioapic, pin, 0x1_0000 | trigger | vector, 0);
            for level in toggles {
                ioapic.set_irq(pin, level);
                ioapic.eoi(vector as u8);
            }
            prop_assert!(log.lock().unwrap().is_empty());
        }
    }
}
