//! High Precision Event Timer (HPET) emulation.
//!
//! A 64-bit up-counter at 100 MHz (10 ns period) with N comparators. Each
//! comparator can interrupt once (one-shot) or every `period` ticks, through
//! an IOAPIC pin, the legacy replacement route or an FSB (MSI) message.
//!
//! # MMIO Layout (base 0xFED00000)
//!
//! | Offset | Register |
//! |--------|----------|
//! | 0x000 | GCAP_ID: period (63:32), vendor (31:16), LEG_RT_CAP (15), COUNT_SIZE_CAP (13), NUM_TIM_CAP (12:8), revision |
//! | 0x010 | GEN_CONF: ENABLE_CNF (0), LEG_RT_CNF (1) |
//! | 0x020 | GINTR_STA: level interrupt status, write 1 to clear |
//! | 0x0F0 | MAIN_CNT |
//! | 0x100 + 0x20*n | Tn_CONF_CAP |
//! | 0x108 + 0x20*n | Tn_COMPARATOR |
//! | 0x110 + 0x20*n | Tn_FSB_ROUTE: data (31:0), address (63:32) |
//!
//! All 64-bit registers can be accessed as two 32-bit halves.
//!
//! With LEG_RT_CNF set, timer 0 drives IRQ 0 (PIC) / GSI 2 (IOAPIC) and
//! timer 1 drives IRQ 8.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{deposit, extract, AccessWidth, Device, DeviceSnapshot, InterruptSink, SnapshotError};
use crate::interrupts::MsiMessage;

pub const HPET_BASE: u64 = 0xFED0_0000;
pub const HPET_SIZE: u64 = 0x400;

/// Counter period in femtoseconds (100 MHz).
pub const PERIOD_FS: u64 = 10_000_000;
const VENDOR_ID: u64 = 0x8086;
const REVISION: u64 = 0x01;
pub const MAX_TIMERS: usize = 32;

pub mod regs {
    pub const GCAP_ID: u64 = 0x000;
    pub const GEN_CONF: u64 = 0x010;
    pub const GINTR_STA: u64 = 0x020;
    pub const MAIN_CNT: u64 = 0x0F0;
    pub const TIMER_BASE: u64 = 0x100;
    pub const TIMER_STRIDE: u64 = 0x20;
    pub const TIMER_CONF: u64 = 0x00;
    pub const TIMER_CMP: u64 = 0x08;
    pub const TIMER_FSB: u64 = 0x10;
}

const CONF_ENABLE: u64 = 1 << 0;
const CONF_LEGACY: u64 = 1 << 1;

const TN_INT_LEVEL: u64 = 1 << 1;
const TN_INT_ENABLE: u64 = 1 << 2;
const TN_PERIODIC: u64 = 1 << 3;
const TN_PERIODIC_CAP: u64 = 1 << 4;
const TN_SIZE_CAP: u64 = 1 << 5;
const TN_SETVAL: u64 = 1 << 6;
const TN_32MODE: u64 = 1 << 8;
const TN_ROUTE_SHIFT: u64 = 9;
const TN_ROUTE_MASK: u64 = 0x1F << TN_ROUTE_SHIFT;
const TN_FSB_ENABLE: u64 = 1 << 14;
const TN_FSB_CAP: u64 = 1 << 15;
/// IOAPIC pins 0-23 except pin 2, which carries ISA IRQ 0.
const TN_ROUTE_CAP: u64 = 0x00FF_FFFB << 32;

const TN_WRITABLE: u64 = TN_INT_LEVEL
    | TN_INT_ENABLE
    | TN_PERIODIC
    | TN_SETVAL
    | TN_32MODE
    | TN_ROUTE_MASK
    | TN_FSB_ENABLE;
const TN_READ_ONLY: u64 = TN_PERIODIC_CAP | TN_SIZE_CAP | TN_FSB_CAP | TN_ROUTE_CAP;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct HpetTimer {
    config: u64,
    comparator: u64,
    period: u64,
    fsb: u64,
    /// Line currently driven high (level mode).
    asserted: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct HpetRegs {
    config: u64,
    isr: u64,
    counter: u64,
    timers: Vec<HpetTimer>,
}

pub struct Hpet {
    regs: HpetRegs,
    sink: Option<Arc<dyn InterruptSink>>,
}

impl Hpet {
    /// An HPET with `timers` comparators (clamped to 1..=32).
    pub fn new(timers: usize, sink: Option<Arc<dyn InterruptSink>>) -> Self {
        let count = timers.clamp(1, MAX_TIMERS);
        Self {
            regs: HpetRegs {
                timers: vec![Self::timer_reset_state(); count],
                ..Default::default()
            },
            sink,
        }
    }

    fn timer_reset_state() -> HpetTimer {
        HpetTimer {
            config: TN_READ_ONLY,
            comparator: u64::MAX,
            ..Default::default()
        }
    }

    pub fn num_timers(&self) -> usize {
        self.regs.timers.len()
    }

    pub fn counter(&self) -> u64 {
        self.regs.counter
    }

    pub fn is_enabled(&self) -> bool {
        self.regs.config & CONF_ENABLE != 0
    }

    fn capabilities(&self) -> u64 {
        (PERIOD_FS << 32)
            | (VENDOR_ID << 16)
            | (1 << 15)
            | (1 << 13)
            | (((self.num_timers() - 1) as u64) << 8)
            | REVISION
    }

    /// GSI (or legacy IRQ) timer `n` is currently routed to.
    fn route(&self, n: usize) -> u32 {
        if self.regs.config & CONF_LEGACY != 0 {
            match n {
                0 => return 0,
                1 => return 8,
                _ => {}
            }
        }
        ((self.regs.timers[n].config & TN_ROUTE_MASK) >> TN_ROUTE_SHIFT) as u32
    }

    /// Advance the main counter by `ticks` (10 ns each) and fire any
    /// comparators crossed. Does nothing while ENABLE_CNF is clear.
    pub fn tick(&mut self, ticks: u64) {
        if !self.is_enabled() || ticks == 0 {
            return;
        }
        let old = self.regs.counter;
        let new = old.wrapping_add(ticks);
        self.regs.counter = new;

        let span = new.wrapping_sub(old);
        for n in 0..self.num_timers() {
            let timer = &self.regs.timers[n];
            let mask = if timer.config & TN_32MODE != 0 {
                0xFFFF_FFFF
            } else {
                u64::MAX
            };
            let cmp = timer.comparator;
            // Crossed when cmp lies in (old, new] modulo the comparator width.
            if cmp.wrapping_sub(old).wrapping_sub(1) & mask >= span {
                continue;
            }
            if timer.config & TN_PERIODIC != 0 && timer.period != 0 {
                let behind = new.wrapping_sub(cmp) & mask;
                let periods = behind / timer.period + 1;
                let next = cmp.wrapping_add(periods.wrapping_mul(timer.period)) & mask;
                self.regs.timers[n].comparator = next;
            }
            self.fire(n);
        }
    }

    fn fire(&mut self, n: usize) {
        let config = self.regs.timers[n].config;
        if config & TN_INT_ENABLE == 0 {
            return;
        }
        let Some(sink) = self.sink.clone() else {
            return;
        };
        if config & TN_FSB_ENABLE != 0 {
            let fsb = self.regs.timers[n].fsb;
            sink.send_msi(MsiMessage::new(fsb >> 32, fsb as u32));
            return;
        }
        let line = self.route(n);
        if config & TN_INT_LEVEL != 0 {
            self.regs.isr |= 1 << n;
            self.regs.timers[n].asserted = true;
            sink.set_irq(line, true);
        } else {
            sink.set_irq(line, true);
            sink.set_irq(line, false);
        }
    }

    fn clear_status(&mut self, mask: u64) {
        for n in 0..self.num_timers() {
            if mask & (1 << n) == 0 || self.regs.isr & (1 << n) == 0 {
                continue;
            }
            self.regs.isr &= !(1 << n);
            if self.regs.timers[n].asserted {
                self.regs.timers[n].asserted = false;
                let line = self.route(n);
                if let Some(sink) = &self.sink {
                    sink.set_irq(line, false);
                }
            }
        }
    }

    fn read_reg(&self, reg: u64) -> u64 {
        match reg {
            regs::GCAP_ID => self.capabilities(),
            regs::GEN_CONF => self.regs.config,
            regs::GINTR_STA => self.regs.isr,
            regs::MAIN_CNT => self.regs.counter,
            _ => match self.timer_reg(reg) {
                Some((n, regs::TIMER_CONF)) => self.regs.timers[n].config,
                Some((n, regs::TIMER_CMP)) => self.regs.timers[n].comparator,
                Some((n, regs::TIMER_FSB)) => self.regs.timers[n].fsb,
                _ => 0,
            },
        }
    }

    fn write_reg(&mut self, reg: u64, value: u64) {
        match reg {
            regs::GEN_CONF => {
                let old = self.regs.config;
                self.regs.config = value & (CONF_ENABLE | CONF_LEGACY);
                if old & CONF_ENABLE != self.regs.config & CONF_ENABLE {
                    debug!("HPET {}", if self.is_enabled() { "enabled" } else { "halted" });
                }
            }
            regs::GINTR_STA => self.clear_status(value),
            regs::MAIN_CNT => self.regs.counter = value,
            _ => match self.timer_reg(reg) {
                Some((n, regs::TIMER_CONF)) => {
                    let timer = &mut self.regs.timers[n];
                    timer.config = (value & TN_WRITABLE) | TN_READ_ONLY;
                    if timer.config & TN_INT_LEVEL == 0 {
                        self.clear_status(1 << n);
                    }
                }
                Some((n, regs::TIMER_CMP)) => {
                    let timer = &mut self.regs.timers[n];
                    let value = if timer.config & TN_32MODE != 0 {
                        value & 0xFFFF_FFFF
                    } else {
                        value
                    };
                    let periodic = timer.config & TN_PERIODIC != 0;
                    if !periodic || timer.config & TN_SETVAL != 0 {
                        timer.comparator = value;
                    }
                    timer.period = value;
                    timer.config &= !TN_SETVAL;
                }
                Some((n, regs::TIMER_FSB)) => self.regs.timers[n].fsb = value,
                _ => {}
            },
        }
    }

    /// `(timer index, register within the timer block)` for a timer register.
    fn timer_reg(&self, reg: u64) -> Option<(usize, u64)> {
        let offset = reg.checked_sub(regs::TIMER_BASE)?;
        let n = (offset / regs::TIMER_STRIDE) as usize;
        (n < self.num_timers()).then_some((n, offset % regs::TIMER_STRIDE))
    }
}

impl Device for Hpet {
    fn name(&self) -> &str {
        "hpet"
    }

    fn mmio_read(&mut self, offset: u64, width: AccessWidth) -> u32 {
        let reg = offset & !7;
        extract(self.read_reg(reg), offset & 7, width)
    }

    fn mmio_write(&mut self, offset: u64, width: AccessWidth, value: u32) {
        let reg = offset & !7;
        let merged = deposit(self.read_reg(reg), offset & 7, width, value);
        self.write_reg(reg, merged);
    }

    fn reset(&mut self) {
        let count = self.num_timers();
        self.regs = HpetRegs {
            timers: vec![Self::timer_reset_state(); count],
            ..Default::default()
        };
    }

    fn snapshot(&self) -> Result<DeviceSnapshot, SnapshotError> {
        DeviceSnapshot::capture(self.name(), &self.regs)
    }

    fn restore(&mut self, snapshot: &DeviceSnapshot) -> Result<(), SnapshotError> {
        let regs: HpetRegs = snapshot.decode(self.name())?;
        if regs.timers.len() != self.num_timers() {
            return Err(SnapshotError::Malformed(format!(
                "HPET has {} comparators, snapshot has {}",
                self.num_timers(),
                regs.timers.len()
            )));
        }
        self.regs = regs;
        Ok(())
    }
}
