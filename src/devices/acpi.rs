//! ACPI power-management register block, SMI command port and SCI.
//!
//! | Port | Register | Width |
//! |------|----------|-------|
//! | PM_BASE + 0x00 | PM1_STS (write 1 to clear) | 16 |
//! | PM_BASE + 0x02 | PM1_EN | 16 |
//! | PM_BASE + 0x04 | PM1_CNT | 16 |
//! | PM_BASE + 0x08 | PM_TMR (24-bit, read only) | 32 |
//! | PM_BASE + 0x20 | GPE0_STS (write 1 to clear) | 32 |
//! | PM_BASE + 0x24 | GPE0_EN | 32 |
//! | 0xB2 | SMI_CMD | 8 |
//! | 0xB3 | APM status scratch | 8 |
//!
//! The SCI (IRQ 9, level triggered) is asserted while SCI_EN is set and any
//! enabled status bit is set.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
    deposit, extract, AccessWidth, Device, DeviceSnapshot, IrqLine, PowerCallback, PowerEvent,
    SnapshotError,
};

pub const PM_BASE: u16 = 0x600;
pub const PM_LEN: u16 = 0x40;
pub const SMI_CMD_PORT: u16 = 0xB2;
pub const SCI_IRQ: u32 = 9;

/// PM timer frequency in Hz.
pub const PM_TIMER_FREQUENCY: u64 = 3_579_545;

/// SMI_CMD values advertised in the FADT.
pub const ACPI_ENABLE: u8 = 0xF1;
pub const ACPI_DISABLE: u8 = 0xF0;

/// SLP_TYP value meaning soft-off (S5).
pub const SLP_TYP_S5: u8 = 5;

pub mod regs {
    pub const PM1_STS: u16 = 0x00;
    pub const PM1_EN: u16 = 0x02;
    pub const PM1_CNT: u16 = 0x04;
    pub const PM_TMR: u16 = 0x08;
    pub const GPE0_STS: u16 = 0x20;
    pub const GPE0_EN: u16 = 0x24;
}

// PM1_STS / PM1_EN
pub const TMR_STS: u16 = 1 << 0;
pub const GBL_STS: u16 = 1 << 5;
pub const PWRBTN_STS: u16 = 1 << 8;
pub const RTC_STS: u16 = 1 << 10;
pub const WAK_STS: u16 = 1 << 15;
const PM1_EN_MASK: u16 = TMR_STS | GBL_STS | PWRBTN_STS | RTC_STS;

// PM1_CNT
pub const SCI_EN: u16 = 1 << 0;
const SLP_TYP_SHIFT: u16 = 10;
const SLP_TYP_MASK: u16 = 7 << SLP_TYP_SHIFT;
const SLP_EN: u16 = 1 << 13;

const PM_TMR_MASK: u32 = 0x00FF_FFFF;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PmState {
    pm1_sts: u16,
    pm1_en: u16,
    pm1_cnt: u16,
    pm_tmr: u32,
    gpe0_sts: u32,
    gpe0_en: u32,
    apm_status: u8,
    /// Last SLP_TYP written with SLP_EN.
    sleep_type: Option<u8>,
}

/// ACPI PM block.
pub struct AcpiPm {
    state: PmState,
    sci: IrqLine,
    sci_level: bool,
    power: Option<PowerCallback>,
}

impl AcpiPm {
    pub fn new(sci: IrqLine) -> Self {
        Self {
            state: PmState::default(),
            sci,
            sci_level: false,
            power: None,
        }
    }

    pub fn set_power_callback(&mut self, cb: PowerCallback) {
        self.power = Some(cb);
    }

    /// ACPI mode is active (SCI_EN set).
    pub fn acpi_enabled(&self) -> bool {
        self.state.pm1_cnt & SCI_EN != 0
    }

    pub fn pm1_status(&self) -> u16 {
        self.state.pm1_sts
    }

    pub fn timer(&self) -> u32 {
        self.state.pm_tmr
    }

    /// Last sleep state the guest entered, if any.
    pub fn sleep_type(&self) -> Option<u8> {
        self.state.sleep_type
    }

    /// Advance the PM timer by `ticks` 3.58 MHz clocks.
    pub fn advance_timer(&mut self, ticks: u64) {
        let next = self.state.pm_tmr as u64 + ticks;
        if next > PM_TMR_MASK as u64 {
            self.state.pm1_sts |= TMR_STS;
        }
        self.state.pm_tmr = (next & PM_TMR_MASK as u64) as u32;
        self.update_sci();
    }

    /// Host power button press.
    pub fn press_power_button(&mut self) {
        self.state.pm1_sts |= PWRBTN_STS;
        self.update_sci();
    }

    /// Latch general-purpose event `bit`.
    pub fn raise_gpe(&mut self, bit: u32) {
        self.state.gpe0_sts |= 1 << (bit & 31);
        self.update_sci();
    }

    fn update_sci(&mut self) {
        let s = &self.state;
        let pending = s.pm1_sts & s.pm1_en & PM1_EN_MASK != 0 || s.gpe0_sts & s.gpe0_en != 0;
        let level = pending && self.acpi_enabled();
        if level != self.sci_level {
            self.sci_level = level;
            self.sci.set_level(level);
        }
    }

    fn write_pm1_cnt(&mut self, value: u16) {
        self.state.pm1_cnt = value & !SLP_EN;
        if value & SLP_EN == 0 {
            return;
        }
        let slp_typ = ((value & SLP_TYP_MASK) >> SLP_TYP_SHIFT) as u8;
        self.state.sleep_type = Some(slp_typ);
        let event = if slp_typ == SLP_TYP_S5 {
            info!("ACPI soft-off requested");
            PowerEvent::Shutdown
        } else {
            info!("ACPI sleep type {} requested", slp_typ);
            // Sleep is bookkeeping only; the guest wakes immediately.
            self.state.pm1_sts |= WAK_STS;
            PowerEvent::Sleep(slp_typ)
        };
        if let Some(cb) = &self.power {
            cb(event);
        }
    }

    fn smi_command(&mut self, value: u8) {
        match value {
            ACPI_ENABLE => {
                info!("ACPI mode enabled");
                self.state.pm1_cnt |= SCI_EN;
            }
            ACPI_DISABLE => {
                info!("ACPI mode disabled");
                self.state.pm1_cnt &= !SCI_EN;
            }
            _ => debug!("ignoring SMI command {:#x}", value),
        }
    }

    fn read_pm(&self, offset: u16, width: AccessWidth) -> u32 {
        let s = &self.state;
        let (base, reg) = match offset {
            0x00..=0x01 => (regs::PM1_STS, s.pm1_sts as u64),
            0x02..=0x03 => (regs::PM1_EN, s.pm1_en as u64),
            0x04..=0x05 => (regs::PM1_CNT, s.pm1_cnt as u64),
            0x08..=0x0B => (regs::PM_TMR, s.pm_tmr as u64),
            0x20..=0x23 => (regs::GPE0_STS, s.gpe0_sts as u64),
            0x24..=0x27 => (regs::GPE0_EN, s.gpe0_en as u64),
            _ => return width.mask(),
        };
        extract(reg, (offset - base) as u64, width)
    }

    fn write_pm(&mut self, offset: u16, width: AccessWidth, value: u32) {
        let s = &mut self.state;
        match offset {
            0x00..=0x01 => {
                let clear = deposit(0, (offset - regs::PM1_STS) as u64, width, value) as u16;
                s.pm1_sts &= !clear;
            }
            0x02..=0x03 => {
                let en = deposit(s.pm1_en as u64, (offset - regs::PM1_EN) as u64, width, value);
                s.pm1_en = en as u16 & PM1_EN_MASK;
            }
            0x04..=0x05 => {
                let cnt = deposit(s.pm1_cnt as u64, (offset - regs::PM1_CNT) as u64, width, value);
                self.write_pm1_cnt(cnt as u16);
            }
            0x20..=0x23 => {
                let clear = deposit(0, (offset - regs::GPE0_STS) as u64, width, value) as u32;
                s.gpe0_sts &= !clear;
            }
            0x24..=0x27 => {
                let en = deposit(s.gpe0_en as u64, (offset - regs::GPE0_EN) as u64, width, value);
                s.gpe0_en = en as u32;
            }
            _ => debug!("ACPI PM: ignoring write to offset {:#x}", offset),
        }
    }
}

impl Device for AcpiPm {
    fn name(&self) -> &str {
        "acpi-pm"
    }

    fn io_read(&mut self, port: u16, width: AccessWidth) -> u32 {
        match port {
            SMI_CMD_PORT => 0,
            0xB3 => self.state.apm_status as u32,
            p if (PM_BASE..PM_BASE + PM_LEN).contains(&p) => self.read_pm(p - PM_BASE, width),
            _ => width.mask(),
        }
    }

    fn io_write(&mut self, port: u16, width: AccessWidth, value: u32) {
        match port {
            SMI_CMD_PORT => self.smi_command(value as u8),
            0xB3 => self.state.apm_status = value as u8,
            p if (PM_BASE..PM_BASE + PM_LEN).contains(&p) => {
                self.write_pm(p - PM_BASE, width, value)
            }
            _ => {}
        }
        self.update_sci();
    }

    fn reset(&mut self) {
        self.state = PmState::default();
        self.update_sci();
    }

    fn snapshot(&self) -> Result<DeviceSnapshot, SnapshotError> {
        DeviceSnapshot::capture(self.name(), &self.state)
    }

    fn restore(&mut self, snapshot: &DeviceSnapshot) -> Result<(), SnapshotError> {
        self.state = snapshot.decode(self.name())?;
        self.update_sci();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::testing::recording_line;
    use std::sync::{Arc, Mutex};

    fn pm_with_events() -> (AcpiPm, Arc<Mutex<Vec<PowerEvent>>>) {
        let mut pm = AcpiPm::new(IrqLine::disconnected(SCI_IRQ));
        let events = Arc::new(Mutex::new(Vec::new()));
        let seen = events.clone();
        pm.set_power_callback(Arc::new(move |e: PowerEvent| seen.lock().unwrap().push(e)));
        (pm, events)
    }

    fn outw(pm: &mut AcpiPm, offset: u16, value: u16) {
        pm.io_write(PM_BASE + offset, AccessWidth::Word, value as u32);
    }

    fn inw(pm: &mut AcpiPm, offset: u16) -> u16 {
        pm.io_read(PM_BASE + offset, AccessWidth::Word) as u16
    }

    #[test]
    fn test_s5_shuts_down() {
        let (mut pm, events) = pm_with_events();
        outw(&mut pm, regs::PM1_CNT, (5 << 10) | SLP_EN);
        assert_eq!(*events.lock().unwrap(), vec![PowerEvent::Shutdown]);
        assert_eq!(inw(&mut pm, regs::PM1_CNT) & SLP_EN, 0, "SLP_EN reads as zero");
    }

    #[test]
    fn test_other_sleep_types_are_inert() {
        let (mut pm, events) = pm_with_events();
        outw(&mut pm, regs::PM1_CNT, (3 << 10) | SLP_EN);
        assert_eq!(*events.lock().unwrap(), vec![PowerEvent::Sleep(3)]);
        assert_eq!(pm.sleep_type(), Some(3));
        // Without SLP_EN nothing happens.
        outw(&mut pm, regs::PM1_CNT, 5 << 10);
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_status_write_one_to_clear() {
        let mut pm = AcpiPm::new(IrqLine::disconnected(SCI_IRQ));
        pm.press_power_button();
        pm.advance_timer(0x0100_0000);
        assert_eq!(inw(&mut pm, regs::PM1_STS), PWRBTN_STS | TMR_STS);
        outw(&mut pm, regs::PM1_STS, TMR_STS);
        assert_eq!(inw(&mut pm, regs::PM1_STS), PWRBTN_STS);
        outw(&mut pm, regs::PM1_STS, 0);
        assert_eq!(inw(&mut pm, regs::PM1_STS), PWRBTN_STS);
    }

    #[test]
    fn test_timer_is_24_bit() {
        let mut pm = AcpiPm::new(IrqLine::disconnected(SCI_IRQ));
        pm.advance_timer(0x00FF_FFF0);
        assert_eq!(pm.io_read(PM_BASE + regs::PM_TMR, AccessWidth::Dword), 0x00FF_FFF0);
        assert_eq!(pm.pm1_status() & TMR_STS, 0);
        pm.advance_timer(0x20);
        assert_eq!(pm.timer(), 0x10);
        assert_ne!(pm.pm1_status() & TMR_STS, 0);
    }

    #[test]
    fn test_sci_requires_acpi_mode() {
        let (line, sink) = recording_line(SCI_IRQ);
        let mut pm = AcpiPm::new(line);
        outw(&mut pm, regs::PM1_EN, PWRBTN_STS);
        pm.press_power_button();
        assert!(!sink.level(SCI_IRQ));

        pm.io_write(SMI_CMD_PORT, AccessWidth::Byte, ACPI_ENABLE as u32);
        assert!(pm.acpi_enabled());
        assert!(sink.level(SCI_IRQ));

        outw(&mut pm, regs::PM1_STS, PWRBTN_STS);
        assert!(!sink.level(SCI_IRQ));
    }

    #[test]
    fn test_gpe_and_byte_access() {
        let (line, sink) = recording_line(SCI_IRQ);
        let mut pm = AcpiPm::new(line);
        pm.io_write(SMI_CMD_PORT, AccessWidth::Byte, ACPI_ENABLE as u32);
        pm.io_write(PM_BASE + regs::GPE0_EN + 1, AccessWidth::Byte, 0x01);
        pm.raise_gpe(8);
        assert!(sink.level(SCI_IRQ));
        assert_eq!(pm.io_read(PM_BASE + regs::GPE0_STS + 1, AccessWidth::Byte), 0x01);
        pm.io_write(PM_BASE + regs::GPE0_STS + 1, AccessWidth::Byte, 0x01);
        assert!(!sink.level(SCI_IRQ));
    }

    #[test]
    fn test_acpi_disable() {
        let mut pm = AcpiPm::new(IrqLine::disconnected(SCI_IRQ));
        pm.io_write(SMI_CMD_PORT, AccessWidth::Byte, ACPI_ENABLE as u32);
        pm.io_write(SMI_CMD_PORT, AccessWidth::Byte, ACPI_DISABLE as u32);
        assert!(!pm.acpi_enabled());
    }
}
