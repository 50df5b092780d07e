//! Intel 8259A Programmable Interrupt Controller (PIC) emulation.
//!
//! Two cascaded 8259A chips as wired in the PC/AT: the master handles IRQ 0-7,
//! the slave handles IRQ 8-15 and drives the master's IRQ 2 input.
//!
//! # I/O Ports
//!
//! | Port  | Description |
//! |-------|-------------|
//! | 0x20  | Master command (ICW1, OCW2, OCW3) / IRR, ISR or poll read |
//! | 0x21  | Master data (ICW2-4, OCW1 mask) |
//! | 0xA0  | Slave command |
//! | 0xA1  | Slave data |
//! | 0x4D0 | ELCR master (edge/level select for IRQ 0-7) |
//! | 0x4D1 | ELCR slave (IRQ 8-15) |
//!
//! # Initialization
//!
//! ```text
//! ICW1 (cmd, bit 4 set) ──► ICW2 (vector base) ──► ICW3 (unless SNGL) ──► ICW4 (if IC4)
//!                                                                          │
//!        steady state: OCW1 (data) mask, OCW2 (cmd) EOI, OCW3 (cmd) read/poll/SMM
//! ```
//!
//! Reference: Intel 8259A datasheet (order number 231468).

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AccessWidth, Device, DeviceSnapshot, SnapshotError};

pub const MASTER_CMD: u16 = 0x20;
pub const MASTER_DATA: u16 = 0x21;
pub const SLAVE_CMD: u16 = 0xA0;
pub const SLAVE_DATA: u16 = 0xA1;
pub const ELCR_MASTER: u16 = 0x4D0;
pub const ELCR_SLAVE: u16 = 0x4D1;

/// IRQ line on the master that the slave's INT output is wired to.
const CASCADE_IRQ: u8 = 2;

/// ELCR bits that may be set. IRQ 0, 1, 2, 8 and 13 are always edge.
const ELCR_MASTER_WRITABLE: u8 = 0xF8;
const ELCR_SLAVE_WRITABLE: u8 = 0xDE;

/// Position in the ICW sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
enum InitState {
    #[default]
    Ready,
    Icw2,
    Icw3,
    Icw4,
}

/// State for a single 8259A chip.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pic8259 {
    /// Interrupt Request Register.
    irr: u8,
    /// In-Service Register.
    isr: u8,
    /// Interrupt Mask Register (OCW1).
    imr: u8,
    /// Edge/Level Control Register; set bits are level triggered.
    elcr: u8,
    /// Last level seen on each input, for edge detection.
    last_level: u8,
    /// ICW2 vector base, low three bits clear.
    vector_base: u8,
    init: InitState,
    /// ICW1 bit 0: ICW4 follows.
    needs_icw4: bool,
    /// ICW1 bit 1: single chip, no ICW3.
    single: bool,
    auto_eoi: bool,
    rotate_on_auto_eoi: bool,
    /// Lowest-priority line is `priority_base - 1` (mod 8); 0 means IRQ 0 highest.
    priority_base: u8,
    special_mask: bool,
    /// OCW3 RIS: command port reads return ISR instead of IRR.
    read_isr: bool,
    /// OCW3 P: next command port read is a poll.
    poll: bool,
}

impl Pic8259 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn irr(&self) -> u8 {
        self.irr
    }

    pub fn isr(&self) -> u8 {
        self.isr
    }

    pub fn imr(&self) -> u8 {
        self.imr
    }

    pub fn elcr(&self) -> u8 {
        self.elcr
    }

    pub fn vector_base(&self) -> u8 {
        self.vector_base
    }

    /// Power-on state. ELCR is a chipset register and survives ICW1.
    fn reset(&mut self) {
        let elcr = self.elcr;
        *self = Self::default();
        self.elcr = elcr;
    }

    /// Drive input `irq` (0-7).
    ///
    /// Edge-triggered lines latch into IRR on a rising edge and stay latched
    /// until acknowledged; level-triggered lines follow the input and
    /// re-assert after acknowledge while held high.
    pub fn set_irq(&mut self, irq: u8, level: bool) {
        let bit = 1u8 << (irq & 7);
        if level {
            if self.elcr & bit != 0 || self.last_level & bit == 0 {
                self.irr |= bit;
            }
            self.last_level |= bit;
        } else {
            if self.elcr & bit != 0 {
                self.irr &= !bit;
            }
            self.last_level &= !bit;
        }
    }

    /// Priority index of `irq` under the current rotation (0 = highest).
    fn priority_of(&self, irq: u8) -> u8 {
        irq.wrapping_sub(self.priority_base) & 7
    }

    /// Highest-priority bit set in `mask`, as an IRQ number.
    fn highest(&self, mask: u8) -> Option<u8> {
        (0..8)
            .map(|p| (p + self.priority_base) & 7)
            .find(|&irq| mask & (1 << irq) != 0)
    }

    /// The IRQ the chip would present to the CPU, if any.
    ///
    /// A request wins when it is unmasked, not already in service and of
    /// strictly higher priority than every in-service line. In special mask
    /// mode the in-service priority block is bypassed.
    pub fn get_pending_irq(&self) -> Option<u8> {
        let candidate = self.highest(self.irr & !self.imr & !self.isr)?;
        if self.special_mask {
            return Some(candidate);
        }
        match self.highest(self.isr) {
            Some(in_service) if self.priority_of(in_service) <= self.priority_of(candidate) => {
                None
            }
            _ => Some(candidate),
        }
    }

    /// INTA cycle for `irq`: IRR → ISR (unless auto-EOI), returns the vector.
    pub fn acknowledge(&mut self, irq: u8) -> u8 {
        let bit = 1u8 << (irq & 7);
        self.irr &= !bit;
        if self.elcr & bit != 0 && self.last_level & bit != 0 {
            // Level input still held: the request stays pending behind ISR.
            self.irr |= bit;
        }
        if self.auto_eoi {
            if self.rotate_on_auto_eoi {
                self.priority_base = (irq + 1) & 7;
            }
        } else {
            self.isr |= bit;
        }
        self.vector_base.wrapping_add(irq & 7)
    }

    fn write_command(&mut self, value: u8) {
        if value & 0x10 != 0 {
            // ICW1
            self.reset();
            self.needs_icw4 = value & 0x01 != 0;
            self.single = value & 0x02 != 0;
            self.init = InitState::Icw2;
        } else if value & 0x08 != 0 {
            // OCW3
            if value & 0x40 != 0 {
                self.special_mask = value & 0x20 != 0;
            }
            if value & 0x02 != 0 {
                self.read_isr = value & 0x01 != 0;
            }
            self.poll = value & 0x04 != 0;
        } else {
            self.write_ocw2(value);
        }
    }

    fn write_ocw2(&mut self, value: u8) {
        let level = value & 0x07;
        match value >> 5 {
            // Non-specific EOI, optionally rotating.
            0b001 | 0b101 => {
                if let Some(irq) = self.highest(self.isr) {
                    self.isr &= !(1 << irq);
                    if value >> 5 == 0b101 {
                        self.priority_base = (irq + 1) & 7;
                    }
                }
            }
            // Specific EOI, optionally rotating.
            0b011 | 0b111 => {
                self.isr &= !(1 << level);
                if value >> 5 == 0b111 {
                    self.priority_base = (level + 1) & 7;
                }
            }
            0b100 => self.rotate_on_auto_eoi = true,
            0b000 => self.rotate_on_auto_eoi = false,
            // Set priority: `level` becomes lowest.
            0b110 => self.priority_base = (level + 1) & 7,
            _ => {}
        }
    }

    fn write_data(&mut self, value: u8) {
        match self.init {
            InitState::Ready => self.imr = value,
            InitState::Icw2 => {
                self.vector_base = value & 0xF8;
                self.init = if !self.single {
                    InitState::Icw3
                } else if self.needs_icw4 {
                    InitState::Icw4
                } else {
                    InitState::Ready
                };
            }
            InitState::Icw3 => {
                self.init = if self.needs_icw4 {
                    InitState::Icw4
                } else {
                    InitState::Ready
                };
            }
            InitState::Icw4 => {
                self.auto_eoi = value & 0x02 != 0;
                self.init = InitState::Ready;
            }
        }
    }

    /// Command port read: IRR/ISR per OCW3, or a poll acknowledge.
    fn read_command(&mut self) -> u8 {
        if self.poll {
            self.poll = false;
            return match self.get_pending_irq() {
                Some(irq) => {
                    self.acknowledge(irq);
                    0x80 | irq
                }
                None => 0,
            };
        }
        if self.read_isr {
            self.isr
        } else {
            self.irr
        }
    }
}

/// Master/slave pair plus the chipset ELCR ports.
///
/// The controller owns both chips by value; cascading is done by passing the
/// slave's output level to the master's IRQ 2 input after every slave state
/// change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PicController {
    master: Pic8259,
    slave: Pic8259,
}

impl PicController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn master(&self) -> &Pic8259 {
        &self.master
    }

    pub fn slave(&self) -> &Pic8259 {
        &self.slave
    }

    /// Drive legacy IRQ `irq` (0-15).
    pub fn set_irq(&mut self, irq: u8, level: bool) {
        match irq {
            0..=7 => self.master.set_irq(irq, level),
            8..=15 => {
                self.slave.set_irq(irq - 8, level);
                self.update_cascade();
            }
            _ => debug!("PIC ignoring out-of-range IRQ {}", irq),
        }
    }

    /// Mirror the slave's INT output onto master IRQ 2.
    fn update_cascade(&mut self) {
        let bit = 1u8 << CASCADE_IRQ;
        if self.slave.get_pending_irq().is_some() {
            self.master.irr |= bit;
        } else {
            self.master.irr &= !bit;
        }
    }

    /// Whether an interrupt would be delivered on the next INTA.
    pub fn has_pending(&self) -> bool {
        match self.master.get_pending_irq() {
            Some(CASCADE_IRQ) => self.slave.get_pending_irq().is_some(),
            Some(_) => true,
            None => false,
        }
    }

    /// The vector [`get_vector`](Self::get_vector) would return, without
    /// acknowledging anything.
    pub fn peek_vector(&self) -> Option<u8> {
        let irq = self.master.get_pending_irq()?;
        if irq != CASCADE_IRQ {
            return Some(self.master.vector_base.wrapping_add(irq));
        }
        let slave_irq = self.slave.get_pending_irq().unwrap_or(7);
        Some(self.slave.vector_base.wrapping_add(slave_irq))
    }

    /// INTA cycle: pick and acknowledge the highest-priority request.
    ///
    /// When the master's winner is the cascade input, the slave is consulted
    /// and both chips are acknowledged. A cascade with nothing left on the
    /// slave yields the slave's spurious IRQ 7 vector, as on real hardware.
    pub fn get_vector(&mut self) -> Option<u8> {
        let irq = self.master.get_pending_irq()?;
        if irq != CASCADE_IRQ {
            return Some(self.master.acknowledge(irq));
        }

        self.master.acknowledge(CASCADE_IRQ);
        let vector = match self.slave.get_pending_irq() {
            Some(slave_irq) => self.slave.acknowledge(slave_irq),
            None => self.slave.vector_base.wrapping_add(7),
        };
        self.update_cascade();
        Some(vector)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl Device for PicController {
    fn name(&self) -> &str {
        "pic"
    }

    fn io_read(&mut self, port: u16, _width: AccessWidth) -> u32 {
        let value = match port {
            MASTER_CMD => self.master.read_command(),
            MASTER_DATA => self.master.imr,
            SLAVE_CMD => {
                let v = self.slave.read_command();
                self.update_cascade();
                v
            }
            SLAVE_DATA => self.slave.imr,
            ELCR_MASTER => self.master.elcr,
            ELCR_SLAVE => self.slave.elcr,
            _ => 0xFF,
        };
        value as u32
    }

    fn io_write(&mut self, port: u16, _width: AccessWidth, value: u32) {
        let byte = value as u8;
        match port {
            MASTER_CMD => self.master.write_command(byte),
            MASTER_DATA => self.master.write_data(byte),
            SLAVE_CMD => {
                self.slave.write_command(byte);
                self.update_cascade();
            }
            SLAVE_DATA => {
                self.slave.write_data(byte);
                self.update_cascade();
            }
            ELCR_MASTER => self.master.elcr = byte & ELCR_MASTER_WRITABLE,
            ELCR_SLAVE => self.slave.elcr = byte & ELCR_SLAVE_WRITABLE,
            _ => {}
        }
    }

    fn reset(&mut self) {
        PicController::reset(self);
    }

    fn snapshot(&self) -> Result<DeviceSnapshot, SnapshotError> {
        DeviceSnapshot::capture(self.name(), self)
    }

    fn restore(&mut self, snapshot: &DeviceSnapshot) -> Result<(), SnapshotError> {
        *self = snapshot.decode(self.name())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn write(pic: &mut PicController, port: u16, value: u8) {
        pic.io_write(port, AccessWidth::Byte, value as u32);
    }

    fn read(pic: &mut PicController, port: u16) -> u8 {
        pic.io_read(port, AccessWidth::Byte) as u8
    }

    /// Standard PC/AT programming: master at 0x08, slave at 0x70.
    fn init_legacy_pc(pic: &mut PicController) {
        write(pic, MASTER_CMD, 0x11);
        write(pic, MASTER_DATA, 0x08);
        write(pic, MASTER_DATA, 0x04);
        write(pic, MASTER_DATA, 0x01);
        write(pic, SLAVE_CMD, 0x11);
        write(pic, SLAVE_DATA, 0x70);
        write(pic, SLAVE_DATA, 0x02);
        write(pic, SLAVE_DATA, 0x01);
        write(pic, MASTER_DATA, 0x00);
        write(pic, SLAVE_DATA, 0x00);
    }

    #[test]
    fn test_icw_sequence_sets_vector_base() {
        let mut pic = PicController::new();
        init_legacy_pc(&mut pic);
        assert_eq!(pic.master().vector_base(), 0x08);
        assert_eq!(pic.slave().vector_base(), 0x70);
        assert_eq!(pic.master().imr(), 0);
    }

    #[test]
    fn test_single_mode_skips_icw3() {
        let mut pic = PicController::new();
        write(&mut pic, MASTER_CMD, 0x13); // SNGL | IC4
        write(&mut pic, MASTER_DATA, 0x20);
        write(&mut pic, MASTER_DATA, 0x03); // ICW4: AEOI
        write(&mut pic, MASTER_DATA, 0xFE); // OCW1
        assert_eq!(pic.master().imr(), 0xFE);
        assert!(pic.master.auto_eoi);
    }

    #[test]
    fn test_acknowledge_returns_base_plus_irq() {
        let mut pic = PicController::new();
        init_legacy_pc(&mut pic);
        pic.set_irq(1, true);
        assert!(pic.has_pending());
        assert_eq!(pic.get_vector(), Some(0x09));
        assert_eq!(pic.master().isr(), 0x02);
        assert_eq!(pic.master().irr(), 0x00);
        assert!(!pic.has_pending());
    }

    #[test]
    fn test_in_service_blocks_lower_priority() {
        let mut pic = PicController::new();
        init_legacy_pc(&mut pic);
        pic.set_irq(0, true);
        assert_eq!(pic.get_vector(), Some(0x08));
        pic.set_irq(4, true);
        assert_eq!(pic.master().get_pending_irq(), None);

        // Non-specific EOI releases IRQ 0.
        write(&mut pic, MASTER_CMD, 0x20);
        assert_eq!(pic.master().get_pending_irq(), Some(4));
    }

    #[test]
    fn test_special_mask_mode_bypasses_priority() {
        let mut pic = PicController::new();
        init_legacy_pc(&mut pic);
        pic.set_irq(0, true);
        pic.get_vector();
        pic.set_irq(4, true);
        write(&mut pic, MASTER_DATA, 0x01); // mask IRQ 0
        write(&mut pic, MASTER_CMD, 0x68); // OCW3: set special mask
        assert_eq!(pic.master().get_pending_irq(), Some(4));
    }

    #[test]
    fn test_cascade_through_slave() {
        let mut pic = PicController::new();
        init_legacy_pc(&mut pic);
        pic.set_irq(12, true);
        assert_eq!(pic.master().irr() & 0x04, 0x04);
        assert_eq!(pic.get_vector(), Some(0x74));
        assert_eq!(pic.slave().isr(), 0x10);
        assert_eq!(pic.master().isr(), 0x04);

        // EOI both chips.
        write(&mut pic, SLAVE_CMD, 0x20);
        write(&mut pic, MASTER_CMD, 0x20);
        assert_eq!(pic.slave().isr(), 0);
        assert_eq!(pic.master().isr(), 0);
    }

    #[test]
    fn test_edge_requires_new_rising_edge() {
        let mut pic = PicController::new();
        init_legacy_pc(&mut pic);
        pic.set_irq(3, true);
        pic.get_vector();
        write(&mut pic, MASTER_CMD, 0x20);
        // Line still high: no new edge, nothing pending.
        pic.set_irq(3, true);
        assert!(!pic.has_pending());
        pic.set_irq(3, false);
        pic.set_irq(3, true);
        assert!(pic.has_pending());
    }

    #[test]
    fn test_edge_pulse_stays_latched_until_acknowledge() {
        let mut pic = PicController::new();
        init_legacy_pc(&mut pic);
        pic.set_irq(0, true);
        pic.set_irq(0, false);
        assert_eq!(pic.get_vector(), Some(0x08));
        assert_eq!(pic.master().isr(), 0x01);
        assert_eq!(pic.get_vector(), None);

        // Same on the slave, through the cascade.
        write(&mut pic, MASTER_CMD, 0x20);
        pic.set_irq(12, true);
        pic.set_irq(12, false);
        assert_eq!(pic.get_vector(), Some(0x74));
    }

    #[test]
    fn test_level_reasserts_while_held() {
        let mut pic = PicController::new();
        init_legacy_pc(&mut pic);
        write(&mut pic, ELCR_SLAVE, 0x02); // IRQ 9 level
        pic.set_irq(9, true);
        assert_eq!(pic.get_vector(), Some(0x71));
        write(&mut pic, SLAVE_CMD, 0x20);
        write(&mut pic, MASTER_CMD, 0x20);
        // Still asserted, so it comes right back.
        assert_eq!(pic.get_vector(), Some(0x71));
    }

    #[test]
    fn test_elcr_fixed_edge_bits() {
        let mut pic = PicController::new();
        write(&mut pic, ELCR_MASTER, 0xFF);
        write(&mut pic, ELCR_SLAVE, 0xFF);
        assert_eq!(read(&mut pic, ELCR_MASTER), 0xF8);
        assert_eq!(read(&mut pic, ELCR_SLAVE), 0xDE);
    }

    #[test]
    fn test_ocw3_read_isr_and_poll() {
        let mut pic = PicController::new();
        init_legacy_pc(&mut pic);
        pic.set_irq(5, true);
        assert_eq!(read(&mut pic, MASTER_CMD), 0x20); // IRR by default
        write(&mut pic, MASTER_CMD, 0x0C); // poll
        assert_eq!(read(&mut pic, MASTER_CMD), 0x85);
        write(&mut pic, MASTER_CMD, 0x0B); // read ISR
        assert_eq!(read(&mut pic, MASTER_CMD), 0x20);
    }

    #[test]
    fn test_specific_eoi_and_rotation() {
        let mut pic = PicController::new();
        init_legacy_pc(&mut pic);
        pic.set_irq(6, true);
        pic.get_vector();
        write(&mut pic, MASTER_CMD, 0x66); // specific EOI IRQ 6
        assert_eq!(pic.master().isr(), 0);

        write(&mut pic, MASTER_CMD, 0xC3); // set priority: IRQ 3 lowest
        pic.set_irq(2, true);
        pic.set_irq(5, false);
        pic.set_irq(4, true);
        // IRQ 4 is now highest priority.
        assert_eq!(pic.master().get_pending_irq(), Some(4));
    }

    #[test]
    fn test_snapshot_restore() {
        let mut pic = PicController::new();
        init_legacy_pc(&mut pic);
        pic.set_irq(7, true);
        let snap = Device::snapshot(&pic).unwrap();

        let mut other = PicController::new();
        other.restore(&snap).unwrap();
        assert_eq!(other.get_vector(), Some(0x0F));
    }

    proptest! {
        #[test]
        fn prop_pending_is_lowest_unmasked_request(irr in any::<u8>(), imr in any::<u8>()) {
            let mut chip = Pic8259::new();
            chip.irr = irr;
            chip.imr = imr;
            let pending = irr & !imr;
            let expected = (pending != 0).then(|| pending.trailing_zeros() as u8);
            prop_assert_eq!(chip.get_pending_irq(), expected);
        }

        #[test]
        fn prop_in_service_lines_never_pending(irr in any::<u8>(), isr in any::<u8>()) {
            let mut chip = Pic8259::new();
            chip.irr = irr;
            chip.isr = isr;
            chip.special_mask = true;
            if let Some(irq) = chip.get_pending_irq() {
                prop_assert_eq!(isr & (1 << irq), 0);
                prop_assert_ne!(irr & (1 << irq), 0);
            }
        }
    }
}
