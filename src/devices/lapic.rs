//! Local APIC emulation (one per vCPU).
//!
//! The LAPIC accepts interrupts from the IOAPIC, MSIs and other LAPICs, keeps
//! them in 256-bit IRR/ISR/TMR registers and hands the highest-priority one
//! to its vCPU. It also owns the per-CPU timer.
//!
//! # Register Map (offset from 0xFEE00000)
//!
//! | Offset | Register | Access |
//! |--------|----------|--------|
//! | 0x020 | ID | RW |
//! | 0x030 | Version | RO |
//! | 0x080 | TPR (task priority) | RW |
//! | 0x0A0 | PPR (processor priority) | RO |
//! | 0x0B0 | EOI | WO |
//! | 0x0D0 | LDR (logical destination) | RW |
//! | 0x0E0 | DFR (destination format) | RW |
//! | 0x0F0 | SVR (spurious vector, bit 8 = enable) | RW |
//! | 0x100-0x170 | ISR | RO |
//! | 0x180-0x1F0 | TMR | RO |
//! | 0x200-0x270 | IRR | RO |
//! | 0x280 | ESR | RW |
//! | 0x300/0x310 | ICR low/high | RW |
//! | 0x320-0x370 | LVT timer, thermal, perf, LINT0, LINT1, error | RW |
//! | 0x380 | Timer initial count | RW |
//! | 0x390 | Timer current count | RO |
//! | 0x3E0 | Timer divide configuration | RW |
//!
//! Writes to the ICR and EOI registers have effects outside this LAPIC. They
//! are returned as [`LapicEvent`]s so the caller can deliver them after the
//! LAPIC lock is released.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AccessWidth, Device, DeviceSnapshot, SnapshotError};
use crate::interrupts::{ApicMessage, DeliveryMode, DestinationMode, Shorthand, BROADCAST_ID};

/// Default physical base of the LAPIC window.
pub const LAPIC_BASE: u64 = 0xFEE0_0000;
pub const LAPIC_SIZE: u64 = 0x1000;

pub mod regs {
    pub const ID: u64 = 0x020;
    pub const VERSION: u64 = 0x030;
    pub const TPR: u64 = 0x080;
    pub const APR: u64 = 0x090;
    pub const PPR: u64 = 0x0A0;
    pub const EOI: u64 = 0x0B0;
    pub const LDR: u64 = 0x0D0;
    pub const DFR: u64 = 0x0E0;
    pub const SVR: u64 = 0x0F0;
    pub const ISR: u64 = 0x100;
    pub const TMR: u64 = 0x180;
    pub const IRR: u64 = 0x200;
    pub const ESR: u64 = 0x280;
    pub const ICR_LOW: u64 = 0x300;
    pub const ICR_HIGH: u64 = 0x310;
    pub const LVT_TIMER: u64 = 0x320;
    pub const LVT_THERMAL: u64 = 0x330;
    pub const LVT_PERF: u64 = 0x340;
    pub const LVT_LINT0: u64 = 0x350;
    pub const LVT_LINT1: u64 = 0x360;
    pub const LVT_ERROR: u64 = 0x370;
    pub const TIMER_INITIAL: u64 = 0x380;
    pub const TIMER_CURRENT: u64 = 0x390;
    pub const TIMER_DIVIDE: u64 = 0x3E0;
}

const VERSION: u32 = 0x14;
const LVT_COUNT: usize = 6;
const LVT_MASKED: u32 = 1 << 16;
const SVR_ENABLE: u32 = 1 << 8;
const TIMER_PERIODIC: u32 = 1 << 17;
const DFR_FLAT: u32 = 0xF;

/// Side effects of a register write that leave the LAPIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LapicEvent {
    /// ICR write: send this message on the APIC bus.
    Ipi(ApicMessage),
    /// EOI of a level-triggered vector: notify the IOAPIC.
    Eoi(u8),
}

/// Non-vectored interrupts waiting for the vCPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialInterrupts {
    pub nmis: u32,
    pub smi: bool,
    pub init: bool,
    pub startup: Option<u8>,
}

/// Architectural register state.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LapicRegs {
    id: u8,
    tpr: u32,
    ldr: u32,
    dfr: u32,
    svr: u32,
    esr: u32,
    isr: [u32; 8],
    tmr: [u32; 8],
    irr: [u32; 8],
    icr_low: u32,
    icr_high: u32,
    lvt: [u32; LVT_COUNT],
    timer_initial: u32,
    timer_current: u32,
    timer_divide: u32,
    /// Bus cycles not yet consumed by the divider.
    timer_prescale: u64,
    special: SpecialInterrupts,
}

impl LapicRegs {
    fn new(id: u8) -> Self {
        Self {
            id,
            tpr: 0,
            ldr: 0,
            dfr: 0xFFFF_FFFF,
            svr: 0xFF,
            esr: 0,
            isr: [0; 8],
            tmr: [0; 8],
            irr: [0; 8],
            icr_low: 0,
            icr_high: 0,
            lvt: [LVT_MASKED; LVT_COUNT],
            timer_initial: 0,
            timer_current: 0,
            timer_divide: 0,
            timer_prescale: 0,
            special: SpecialInterrupts::default(),
        }
    }
}

fn set_bit(reg: &mut [u32; 8], vector: u8) {
    reg[(vector >> 5) as usize] |= 1 << (vector & 31);
}

fn clear_bit(reg: &mut [u32; 8], vector: u8) {
    reg[(vector >> 5) as usize] &= !(1 << (vector & 31));
}

fn test_bit(reg: &[u32; 8], vector: u8) -> bool {
    reg[(vector >> 5) as usize] & (1 << (vector & 31)) != 0
}

fn highest_bit(reg: &[u32; 8]) -> Option<u8> {
    reg.iter()
        .enumerate()
        .rev()
        .find(|&(_, &word)| word != 0)
        .map(|(i, &word)| (i as u32 * 32 + 31 - word.leading_zeros()) as u8)
}

/// One vCPU's local APIC.
#[derive(Debug)]
pub struct LocalApic {
    name: String,
    regs: LapicRegs,
    /// Events produced through the `Device` interface, drained by the owner.
    outbox: Vec<LapicEvent>,
}

impl LocalApic {
    pub fn new(id: u8) -> Self {
        Self {
            name: format!("lapic{}", id),
            regs: LapicRegs::new(id),
            outbox: Vec::new(),
        }
    }

    pub fn id(&self) -> u8 {
        self.regs.id
    }

    pub fn is_enabled(&self) -> bool {
        self.regs.svr & SVR_ENABLE != 0
    }

    /// PPR: the greater of TPR and the highest in-service vector.
    pub fn processor_priority(&self) -> u8 {
        let tpr = self.regs.tpr as u8;
        let isrv = highest_bit(&self.regs.isr).unwrap_or(0);
        tpr.max(isrv)
    }

    /// Whether `msg` addresses this LAPIC.
    pub fn matches_destination(&self, msg: &ApicMessage) -> bool {
        let id = self.regs.id;
        match msg.shorthand {
            Shorthand::All => true,
            Shorthand::SelfOnly => msg.source == id,
            Shorthand::AllExcludingSelf => msg.source != id,
            Shorthand::None => match msg.dest_mode {
                DestinationMode::Physical => msg.dest == BROADCAST_ID || msg.dest == id,
                DestinationMode::Logical => self.matches_logical(msg.dest),
            },
        }
    }

    fn matches_logical(&self, dest: u8) -> bool {
        if dest == BROADCAST_ID {
            return true;
        }
        let logical_id = (self.regs.ldr >> 24) as u8;
        if self.regs.dfr >> 28 == DFR_FLAT {
            logical_id & dest != 0
        } else {
            // Cluster model: high nibble is the cluster, low nibble a member mask.
            logical_id >> 4 == dest >> 4 && logical_id & dest & 0x0F != 0
        }
    }

    /// Accept a message that matched this LAPIC.
    pub fn accept(&mut self, msg: &ApicMessage) {
        match msg.delivery {
            DeliveryMode::Fixed | DeliveryMode::LowestPriority => {
                self.set_irr(msg.vector, msg.level_triggered)
            }
            DeliveryMode::Nmi => self.regs.special.nmis += 1,
            DeliveryMode::Smi => self.regs.special.smi = true,
            DeliveryMode::Init => {
                if msg.assert {
                    self.regs.special.init = true;
                }
            }
            DeliveryMode::Startup => self.regs.special.startup = Some(msg.vector),
            DeliveryMode::ExtInt => debug!("{}: ExtINT is taken from the PIC", self.name),
        }
    }

    fn set_irr(&mut self, vector: u8, level_triggered: bool) {
        if vector < 16 {
            // Vectors 0-15 are illegal; report a receive-illegal-vector error.
            self.regs.esr |= 1 << 6;
            return;
        }
        set_bit(&mut self.regs.irr, vector);
        if level_triggered {
            set_bit(&mut self.regs.tmr, vector);
        } else {
            clear_bit(&mut self.regs.tmr, vector);
        }
    }

    /// Highest IRR vector strictly above PPR, if the LAPIC is enabled.
    pub fn pending_vector(&self) -> Option<u8> {
        if !self.is_enabled() {
            return None;
        }
        let irrv = highest_bit(&self.regs.irr)?;
        (irrv > self.processor_priority()).then_some(irrv)
    }

    /// Move the pending vector from IRR to ISR and return it.
    pub fn acknowledge(&mut self) -> Option<u8> {
        let vector = self.pending_vector()?;
        clear_bit(&mut self.regs.irr, vector);
        set_bit(&mut self.regs.isr, vector);
        Some(vector)
    }

    pub fn is_in_service(&self, vector: u8) -> bool {
        test_bit(&self.regs.isr, vector)
    }

    pub fn is_requested(&self, vector: u8) -> bool {
        test_bit(&self.regs.irr, vector)
    }

    /// Drain NMI/SMI/INIT/SIPI requests.
    pub fn take_special(&mut self) -> SpecialInterrupts {
        std::mem::take(&mut self.regs.special)
    }

    fn eoi(&mut self) -> Option<LapicEvent> {
        let vector = highest_bit(&self.regs.isr)?;
        clear_bit(&mut self.regs.isr, vector);
        test_bit(&self.regs.tmr, vector).then_some(LapicEvent::Eoi(vector))
    }

    fn decode_icr(&self) -> Option<ApicMessage> {
        let low = self.regs.icr_low;
        let delivery = DeliveryMode::from_bits(low >> 8)?;
        Some(ApicMessage {
            vector: low as u8,
            delivery,
            dest_mode: if low & (1 << 11) != 0 {
                DestinationMode::Logical
            } else {
                DestinationMode::Physical
            },
            dest: (self.regs.icr_high >> 24) as u8,
            shorthand: Shorthand::from_bits(low >> 18),
            source: self.regs.id,
            level_triggered: low & (1 << 15) != 0,
            assert: low & (1 << 14) != 0,
        })
    }

    fn timer_divisor(&self) -> u64 {
        let d = self.regs.timer_divide;
        let code = ((d & 8) >> 1) | (d & 3);
        if code == 7 {
            1
        } else {
            2 << code
        }
    }

    /// Read a 32-bit register.
    pub fn read_register(&self, offset: u64) -> u32 {
        let r = &self.regs;
        match offset {
            regs::ID => (r.id as u32) << 24,
            regs::VERSION => VERSION | ((LVT_COUNT as u32 - 1) << 16),
            regs::TPR => r.tpr,
            regs::APR => 0,
            regs::PPR => self.processor_priority() as u32,
            regs::LDR => r.ldr,
            regs::DFR => r.dfr,
            regs::SVR => r.svr,
            0x100..=0x170 => r.isr[((offset - regs::ISR) >> 4) as usize],
            0x180..=0x1F0 => r.tmr[((offset - regs::TMR) >> 4) as usize],
            0x200..=0x270 => r.irr[((offset - regs::IRR) >> 4) as usize],
            regs::ESR => r.esr,
            regs::ICR_LOW => r.icr_low,
            regs::ICR_HIGH => r.icr_high,
            regs::LVT_TIMER..=regs::LVT_ERROR => {
                r.lvt[((offset - regs::LVT_TIMER) >> 4) as usize]
            }
            regs::TIMER_INITIAL => r.timer_initial,
            regs::TIMER_CURRENT => r.timer_current,
            regs::TIMER_DIVIDE => r.timer_divide,
            _ => 0,
        }
    }

    /// Write a 32-bit register, returning any bus-visible side effect.
    pub fn write_register(&mut self, offset: u64, value: u32) -> Option<LapicEvent> {
        match offset {
            regs::ID => self.regs.id = (value >> 24) as u8,
            regs::TPR => self.regs.tpr = value & 0xFF,
            regs::EOI => return self.eoi(),
            regs::LDR => self.regs.ldr = value & 0xFF00_0000,
            regs::DFR => self.regs.dfr = value | 0x0FFF_FFFF,
            regs::SVR => {
                self.regs.svr = value & 0x3FF;
                if !self.is_enabled() {
                    for lvt in self.regs.lvt.iter_mut() {
                        *lvt |= LVT_MASKED;
                    }
                }
            }
            regs::ESR => self.regs.esr = 0,
            regs::ICR_LOW => {
                // Delivery status always reads idle.
                self.regs.icr_low = value & !(1 << 12);
                return self.decode_icr().map(LapicEvent::Ipi);
            }
            regs::ICR_HIGH => self.regs.icr_high = value & 0xFF00_0000,
            regs::LVT_TIMER..=regs::LVT_ERROR if offset & 0xF == 0 => {
                let index = ((offset - regs::LVT_TIMER) >> 4) as usize;
                let value = if self.is_enabled() {
                    value
                } else {
                    value | LVT_MASKED
                };
                self.regs.lvt[index] = value;
            }
            regs::TIMER_INITIAL => {
                self.regs.timer_initial = value;
                self.regs.timer_current = value;
                self.regs.timer_prescale = 0;
            }
            regs::TIMER_DIVIDE => self.regs.timer_divide = value & 0xB,
            _ => debug!("{}: ignoring write to {:#x}", self.name, offset),
        }
        None
    }

    /// Advance the timer by `cycles` bus clocks. Returns true if it expired.
    ///
    /// An unmasked expiry sets the LVT timer vector in IRR. Periodic mode
    /// reloads the initial count; one-shot mode stops at zero.
    pub fn tick(&mut self, cycles: u64) -> bool {
        if self.regs.timer_current == 0 {
            return false;
        }
        let total = self.regs.timer_prescale + cycles;
        let divisor = self.timer_divisor();
        let steps = total / divisor;
        self.regs.timer_prescale = total % divisor;

        if steps < self.regs.timer_current as u64 {
            self.regs.timer_current -= steps as u32;
            return false;
        }

        let lvt = self.regs.lvt[0];
        if lvt & TIMER_PERIODIC != 0 && self.regs.timer_initial != 0 {
            let overrun = (steps - self.regs.timer_current as u64) % self.regs.timer_initial as u64;
            self.regs.timer_current = self.regs.timer_initial - overrun as u32;
        } else {
            self.regs.timer_current = 0;
        }
        if lvt & LVT_MASKED == 0 {
            self.set_irr(lvt as u8, false);
        }
        true
    }

    /// Events produced by writes made through the [`Device`] interface.
    pub fn take_events(&mut self) -> Vec<LapicEvent> {
        std::mem::take(&mut self.outbox)
    }
}

impl Device for LocalApic {
    fn name(&self) -> &str {
        &self.name
    }

    fn mmio_read(&mut self, offset: u64, width: AccessWidth) -> u32 {
        let value = self.read_register(offset & !0xF);
        (value >> ((offset & 3) * 8)) & width.mask()
    }

    fn mmio_write(&mut self, offset: u64, width: AccessWidth, value: u32) {
        if width != AccessWidth::Dword || offset & 0xF != 0 {
            debug!("{}: ignoring {:?} write at {:#x}", self.name, width, offset);
            return;
        }
        if let Some(event) = self.write_register(offset, value) {
            self.outbox.push(event);
        }
    }

    fn reset(&mut self) {
        self.regs = LapicRegs::new(self.regs.id);
        self.outbox.clear();
    }

    fn snapshot(&self) -> Result<DeviceSnapshot, SnapshotError> {
        DeviceSnapshot::capture(&self.name, &self.regs)
    }

    fn restore(&mut self, snapshot: &DeviceSnapshot) -> Result<(), SnapshotError> {
        self.regs = snapshot.decode(&self.name)?;
        Ok(())
    }
}
