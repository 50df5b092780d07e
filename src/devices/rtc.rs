//! MC146818 real-time clock and CMOS configuration memory.
//!
//! The guest writes a register index to port 0x70 (bit 7 disables NMI) and then
//! reads or writes the selected byte through port 0x71.
//!
//! # Register map
//!
//! | Index | Contents |
//! |-------|----------|
//! | 0x00, 0x02, 0x04 | seconds, minutes, hours |
//! | 0x01, 0x03, 0x05 | seconds, minutes, hours alarm |
//! | 0x06 - 0x09 | day of week, day of month, month, year |
//! | 0x0A | status A: UIP, divider, periodic rate |
//! | 0x0B | status B: SET, PIE, AIE, UIE, SQWE, DM, 24/12, DSE |
//! | 0x0C | status C: IRQF, PF, AF, UF (read clears) |
//! | 0x0D | status D: VRT |
//! | 0x32 | century |
//!
//! Time fields are kept in binary and encoded on access according to the
//! DM (binary/BCD) and 24/12 bits of status B.
//!
//! Reference: <https://wiki.osdev.org/CMOS>

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AccessWidth, Device, DeviceSnapshot, IrqLine, SnapshotError};

pub const RTC_PORT_INDEX: u16 = 0x70;
pub const RTC_PORT_DATA: u16 = 0x71;

/// RTC interrupt line on the PIC.
pub const RTC_IRQ: u32 = 8;

const CMOS_SIZE: usize = 128;

pub mod regs {
    pub const SECONDS: u8 = 0x00;
    pub const SECONDS_ALARM: u8 = 0x01;
    pub const MINUTES: u8 = 0x02;
    pub const MINUTES_ALARM: u8 = 0x03;
    pub const HOURS: u8 = 0x04;
    pub const HOURS_ALARM: u8 = 0x05;
    pub const DAY_OF_WEEK: u8 = 0x06;
    pub const DAY_OF_MONTH: u8 = 0x07;
    pub const MONTH: u8 = 0x08;
    pub const YEAR: u8 = 0x09;
    pub const STATUS_A: u8 = 0x0A;
    pub const STATUS_B: u8 = 0x0B;
    pub const STATUS_C: u8 = 0x0C;
    pub const STATUS_D: u8 = 0x0D;
    pub const BASE_MEM_LO: u8 = 0x15;
    pub const BASE_MEM_HI: u8 = 0x16;
    pub const EXT_MEM_LO: u8 = 0x17;
    pub const EXT_MEM_HI: u8 = 0x18;
    pub const CHECKSUM_HI: u8 = 0x2E;
    pub const CHECKSUM_LO: u8 = 0x2F;
    pub const EXT_MEM2_LO: u8 = 0x30;
    pub const EXT_MEM2_HI: u8 = 0x31;
    pub const CENTURY: u8 = 0x32;
    pub const HIGH_MEM_LO: u8 = 0x34;
    pub const HIGH_MEM_HI: u8 = 0x35;
}

// Status A
const A_UIP: u8 = 1 << 7;
// Status B
const B_SET: u8 = 1 << 7;
const B_PIE: u8 = 1 << 6;
const B_AIE: u8 = 1 << 5;
const B_UIE: u8 = 1 << 4;
const B_BINARY: u8 = 1 << 2;
const B_24H: u8 = 1 << 1;
// Status C
const C_IRQF: u8 = 1 << 7;
const C_PF: u8 = 1 << 6;
const C_AF: u8 = 1 << 5;
const C_UF: u8 = 1 << 4;
// Status D
const D_VRT: u8 = 1 << 7;

/// Alarm byte that matches any value.
const ALARM_DONT_CARE: u8 = 0xC0;

fn is_leap(year: u16) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn days_in_month(year: u16, month: u8) -> u8 {
    match month {
        2 if is_leap(year) => 29,
        2 => 28,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

fn to_bcd(value: u8) -> u8 {
    ((value / 10) << 4) | (value % 10)
}

fn from_bcd(value: u8) -> u8 {
    ((value >> 4) & 0xF).min(9) * 10 + (value & 0xF).min(9)
}

/// Calendar time in binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcTime {
    pub second: u8,
    pub minute: u8,
    /// 0-23.
    pub hour: u8,
    /// 1 = Sunday.
    pub weekday: u8,
    pub day: u8,
    pub month: u8,
    pub year: u16,
}

impl Default for RtcTime {
    /// Saturday, 2000-01-01 00:00:00.
    fn default() -> Self {
        Self {
            second: 0,
            minute: 0,
            hour: 0,
            weekday: 7,
            day: 1,
            month: 1,
            year: 2000,
        }
    }
}

impl RtcTime {
    /// Convert seconds since the UNIX epoch to UTC calendar time.
    pub fn from_unix(secs: u64) -> Self {
        let days = (secs / 86_400) as i64;
        let rem = secs % 86_400;

        // Days-to-civil over 400-year eras, March-based years.
        let z = days + 719_468;
        let era = z.div_euclid(146_097);
        let doe = z.rem_euclid(146_097);
        let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
        let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
        let mp = (5 * doy + 2) / 153;
        let day = (doy - (153 * mp + 2) / 5 + 1) as u8;
        let month = if mp < 10 { mp + 3 } else { mp - 9 } as u8;
        let year = (yoe + era * 400 + (month <= 2) as i64) as u16;

        Self {
            second: (rem % 60) as u8,
            minute: (rem / 60 % 60) as u8,
            hour: (rem / 3600) as u8,
            // 1970-01-01 was a Thursday.
            weekday: ((days + 4).rem_euclid(7) + 1) as u8,
            day,
            month,
            year,
        }
    }

    /// Advance by one second, carrying into every field.
    pub fn advance_second(&mut self) {
        self.second += 1;
        if self.second < 60 {
            return;
        }
        self.second = 0;
        self.minute += 1;
        if self.minute < 60 {
            return;
        }
        self.minute = 0;
        self.hour += 1;
        if self.hour < 24 {
            return;
        }
        self.hour = 0;
        self.weekday = self.weekday % 7 + 1;
        self.day += 1;
        if self.day <= days_in_month(self.year, self.month) {
            return;
        }
        self.day = 1;
        self.month += 1;
        if self.month <= 12 {
            return;
        }
        self.month = 1;
        self.year = self.year.wrapping_add(1);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RtcState {
    cmos: Vec<u8>,
    index: u8,
    nmi_disabled: bool,
    time: RtcTime,
}

impl RtcState {
    fn new(time: RtcTime) -> Self {
        let mut cmos = vec![0u8; CMOS_SIZE];
        cmos[regs::STATUS_A as usize] = 0x26;
        cmos[regs::STATUS_B as usize] = B_24H;
        cmos[regs::STATUS_D as usize] = D_VRT;
        Self {
            cmos,
            index: 0,
            nmi_disabled: false,
            time,
        }
    }
}

/// Real-time clock device.
pub struct Rtc {
    state: RtcState,
    irq: IrqLine,
}

impl Rtc {
    pub fn new(time: RtcTime, irq: IrqLine) -> Self {
        Self {
            state: RtcState::new(time),
            irq,
        }
    }

    pub fn time(&self) -> RtcTime {
        self.state.time
    }

    pub fn nmi_disabled(&self) -> bool {
        self.state.nmi_disabled
    }

    /// Raw CMOS byte, bypassing time-field encoding.
    pub fn cmos(&self, index: u8) -> u8 {
        self.state.cmos[(index & 0x7F) as usize]
    }

    /// Store guest RAM size in the firmware-visible CMOS fields.
    pub fn set_memory_size(&mut self, bytes: u64) {
        let kb = bytes / 1024;
        let ext_kb = kb.saturating_sub(1024).min(0xFFFF) as u16;
        let high_64k = (bytes.saturating_sub(16 << 20) >> 16).min(0xFFFF) as u16;
        let base_kb = kb.min(640) as u16;

        let cmos = &mut self.state.cmos;
        for (lo, hi, value) in [
            (regs::BASE_MEM_LO, regs::BASE_MEM_HI, base_kb),
            (regs::EXT_MEM_LO, regs::EXT_MEM_HI, ext_kb),
            (regs::EXT_MEM2_LO, regs::EXT_MEM2_HI, ext_kb),
            (regs::HIGH_MEM_LO, regs::HIGH_MEM_HI, high_64k),
        ] {
            cmos[lo as usize] = value as u8;
            cmos[hi as usize] = (value >> 8) as u8;
        }

        let sum: u16 = cmos[0x10..=0x2D].iter().map(|&b| b as u16).sum();
        cmos[regs::CHECKSUM_HI as usize] = (sum >> 8) as u8;
        cmos[regs::CHECKSUM_LO as usize] = sum as u8;
    }

    /// Periodic interrupt rate selected by status A, in Hz.
    pub fn periodic_frequency(&self) -> Option<u32> {
        match self.state.cmos[regs::STATUS_A as usize] & 0x0F {
            0 => None,
            1 => Some(256),
            2 => Some(128),
            rate => Some(32_768 >> (rate - 1)),
        }
    }

    /// One-second update cycle: advance the clock, then latch UF and AF.
    pub fn tick_second(&mut self) {
        let a = self.state.cmos[regs::STATUS_A as usize];
        let b = self.state.cmos[regs::STATUS_B as usize];
        // Updates stop while SET is held or the divider chain is in reset.
        if b & B_SET != 0 || (a >> 4) & 7 != 2 {
            return;
        }
        self.state.time.advance_second();

        let mut flags = C_UF;
        if self.alarm_matches() {
            flags |= C_AF;
        }
        self.state.cmos[regs::STATUS_C as usize] |= flags;
        self.update_irq();
    }

    /// One period of the periodic interrupt: latch PF.
    pub fn tick_periodic(&mut self) {
        if self.periodic_frequency().is_none() {
            return;
        }
        self.state.cmos[regs::STATUS_C as usize] |= C_PF;
        self.update_irq();
    }

    fn alarm_matches(&self) -> bool {
        [
            (regs::SECONDS_ALARM, regs::SECONDS),
            (regs::MINUTES_ALARM, regs::MINUTES),
            (regs::HOURS_ALARM, regs::HOURS),
        ]
        .iter()
        .all(|&(alarm, field)| {
            let want = self.state.cmos[alarm as usize];
            want & ALARM_DONT_CARE == ALARM_DONT_CARE || want == self.read_time_field(field)
        })
    }

    fn update_irq(&mut self) {
        let b = self.state.cmos[regs::STATUS_B as usize];
        let c = &mut self.state.cmos[regs::STATUS_C as usize];
        let pending = *c & b & (B_PIE | B_AIE | B_UIE) != 0;
        if pending && *c & C_IRQF == 0 {
            *c |= C_IRQF;
            self.irq.raise();
        }
    }

    fn binary(&self) -> bool {
        self.state.cmos[regs::STATUS_B as usize] & B_BINARY != 0
    }

    fn encode(&self, value: u8) -> u8 {
        if self.binary() {
            value
        } else {
            to_bcd(value)
        }
    }

    fn decode(&self, value: u8) -> u8 {
        if self.binary() {
            value
        } else {
            from_bcd(value)
        }
    }

    fn read_time_field(&self, index: u8) -> u8 {
        let t = &self.state.time;
        match index {
            regs::SECONDS => self.encode(t.second),
            regs::MINUTES => self.encode(t.minute),
            regs::HOURS => {
                if self.state.cmos[regs::STATUS_B as usize] & B_24H != 0 {
                    self.encode(t.hour)
                } else {
                    let h12 = match t.hour % 12 {
                        0 => 12,
                        h => h,
                    };
                    let pm = if t.hour >= 12 { 0x80 } else { 0 };
                    self.encode(h12) | pm
                }
            }
            regs::DAY_OF_WEEK => self.encode(t.weekday),
            regs::DAY_OF_MONTH => self.encode(t.day),
            regs::MONTH => self.encode(t.month),
            regs::YEAR => self.encode((t.year % 100) as u8),
            regs::CENTURY => self.encode((t.year / 100) as u8),
            _ => self.state.cmos[index as usize],
        }
    }

    fn write_time_field(&mut self, index: u8, value: u8) {
        let twelve_hour = self.state.cmos[regs::STATUS_B as usize] & B_24H == 0;
        let mask = if index == regs::HOURS && twelve_hour { 0x7F } else { 0xFF };
        let v = self.decode(value & mask);
        let t = &mut self.state.time;
        match index {
            regs::SECONDS => t.second = v.min(59),
            regs::MINUTES => t.minute = v.min(59),
            regs::HOURS if twelve_hour => {
                let pm = value & 0x80 != 0;
                t.hour = (v.clamp(1, 12) % 12) + if pm { 12 } else { 0 };
            }
            regs::HOURS => t.hour = v.min(23),
            regs::DAY_OF_WEEK => t.weekday = v.clamp(1, 7),
            regs::DAY_OF_MONTH => t.day = v.clamp(1, 31),
            regs::MONTH => t.month = v.clamp(1, 12),
            regs::YEAR => t.year = t.year / 100 * 100 + v.min(99) as u16,
            regs::CENTURY => t.year = v.min(99) as u16 * 100 + t.year % 100,
            _ => {}
        }
    }

    fn read_data(&mut self) -> u8 {
        let index = self.state.index;
        match index {
            regs::STATUS_A => self.state.cmos[index as usize] & !A_UIP,
            regs::STATUS_C => {
                let value = self.state.cmos[index as usize];
                self.state.cmos[index as usize] = 0;
                if value & C_IRQF != 0 {
                    self.irq.lower();
                }
                value
            }
            _ => self.read_time_field(index),
        }
    }

    fn write_data(&mut self, value: u8) {
        let index = self.state.index;
        match index {
            regs::SECONDS
            | regs::MINUTES
            | regs::HOURS
            | regs::DAY_OF_WEEK
            | regs::DAY_OF_MONTH
            | regs::MONTH
            | regs::YEAR
            | regs::CENTURY => self.write_time_field(index, value),
            regs::STATUS_A => self.state.cmos[index as usize] = value & !A_UIP,
            regs::STATUS_B => {
                // Setting SET also clears UIE.
                let value = if value & B_SET != 0 { value & !B_UIE } else { value };
                self.state.cmos[index as usize] = value;
                self.update_irq();
            }
            regs::STATUS_C | regs::STATUS_D => {
                debug!("RTC ignoring write {:#x} to read-only register {:#x}", value, index)
            }
            _ => self.state.cmos[index as usize] = value,
        }
    }
}

impl Device for Rtc {
    fn name(&self) -> &str {
        "rtc"
    }

    fn io_read(&mut self, port: u16, _width: AccessWidth) -> u32 {
        match port {
            RTC_PORT_DATA => self.read_data() as u32,
            _ => 0xFF,
        }
    }

    fn io_write(&mut self, port: u16, _width: AccessWidth, value: u32) {
        let value = value as u8;
        match port {
            RTC_PORT_INDEX => {
                self.state.index = value & 0x7F;
                self.state.nmi_disabled = value & 0x80 != 0;
            }
            RTC_PORT_DATA => self.write_data(value),
            _ => {}
        }
    }

    /// Control state returns to power-on defaults; the clock and CMOS RAM are
    /// battery backed and survive.
    fn reset(&mut self) {
        let cmos = &mut self.state.cmos;
        cmos[regs::STATUS_B as usize] &= !(B_PIE | B_AIE | B_UIE);
        cmos[regs::STATUS_C as usize] = 0;
        self.state.index = 0;
        self.state.nmi_disabled = false;
        self.irq.lower();
    }

    fn snapshot(&self) -> Result<DeviceSnapshot, SnapshotError> {
        DeviceSnapshot::capture(self.name(), &self.state)
    }

    fn restore(&mut self, snapshot: &DeviceSnapshot) -> Result<(), SnapshotError> {
        let state: RtcState = snapshot.decode(self.name())?;
        if state.cmos.len() != CMOS_SIZE || state.index as usize >= CMOS_SIZE {
            return Err(SnapshotError::Malformed("CMOS size or index".into()));
        }
        self.state = state;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::testing::{edit_snapshot, recording_line};

    fn read(rtc: &mut Rtc, index: u8) -> u8 {
        rtc.io_write(RTC_PORT_INDEX, AccessWidth::Byte, index as u32);
        rtc.io_read(RTC_PORT_DATA, AccessWidth::Byte) as u8
    }

    fn write(rtc: &mut Rtc, index: u8, value: u8) {
        rtc.io_write(RTC_PORT_INDEX, AccessWidth::Byte, index as u32);
        rtc.io_write(RTC_PORT_DATA, AccessWidth::Byte, value as u32);
    }

    fn rtc() -> Rtc {
        Rtc::new(RtcTime::default(), IrqLine::disconnected(RTC_IRQ))
    }

    #[test]
    fn test_sixty_seconds_is_one_minute() {
        let mut rtc = rtc();
        for _ in 0..60 {
            rtc.tick_second();
        }
        assert_eq!(read(&mut rtc, regs::SECONDS), 0x00);
        assert_eq!(read(&mut rtc, regs::MINUTES), 0x01);
    }

    #[test]
    fn test_bcd_seconds_carry() {
        let mut rtc = rtc();
        for _ in 0..19 {
            rtc.tick_second();
        }
        assert_eq!(read(&mut rtc, regs::SECONDS), 0x19);
        rtc.tick_second();
        assert_eq!(read(&mut rtc, regs::SECONDS), 0x20);
    }

    #[test]
    fn test_leap_day_and_century_rollover() {
        let mut rtc = rtc();
        // 2024-02-28 23:59:59
        write(&mut rtc, regs::YEAR, 0x24);
        write(&mut rtc, regs::CENTURY, 0x20);
        write(&mut rtc, regs::MONTH, 0x02);
        write(&mut rtc, regs::DAY_OF_MONTH, 0x28);
        write(&mut rtc, regs::HOURS, 0x23);
        write(&mut rtc, regs::MINUTES, 0x59);
        write(&mut rtc, regs::SECONDS, 0x59);
        rtc.tick_second();
        assert_eq!(read(&mut rtc, regs::DAY_OF_MONTH), 0x29);
        assert_eq!(read(&mut rtc, regs::MONTH), 0x02);

        // 2099-12-31 23:59:59
        write(&mut rtc, regs::YEAR, 0x99);
        write(&mut rtc, regs::MONTH, 0x12);
        write(&mut rtc, regs::DAY_OF_MONTH, 0x31);
        write(&mut rtc, regs::HOURS, 0x23);
        write(&mut rtc, regs::MINUTES, 0x59);
        write(&mut rtc, regs::SECONDS, 0x59);
        rtc.tick_second();
        assert_eq!(read(&mut rtc, regs::YEAR), 0x00);
        assert_eq!(read(&mut rtc, regs::CENTURY), 0x21);
        assert_eq!(rtc.time().year, 2100);
    }

    #[test]
    fn test_non_leap_century() {
        let mut t = RtcTime {
            second: 59,
            minute: 59,
            hour: 23,
            weekday: 1,
            day: 28,
            month: 2,
            year: 2100,
        };
        t.advance_second();
        assert_eq!((t.month, t.day, t.weekday), (3, 1, 2));
    }

    #[test]
    fn test_from_unix() {
        assert_eq!(
            RtcTime::from_unix(0),
            RtcTime {
                second: 0,
                minute: 0,
                hour: 0,
                weekday: 5,
                day: 1,
                month: 1,
                year: 1970
            }
        );
        // 2024-02-29 12:34:56 UTC, a Thursday.
        let t = RtcTime::from_unix(1_709_210_096);
        assert_eq!((t.year, t.month, t.day), (2024, 2, 29));
        assert_eq!((t.hour, t.minute, t.second), (12, 34, 56));
        assert_eq!(t.weekday, 5);
    }

    #[test]
    fn test_binary_and_twelve_hour_modes() {
        let mut rtc = Rtc::new(RtcTime::from_unix(13 * 3600 + 5 * 60), IrqLine::disconnected(8));
        write(&mut rtc, regs::STATUS_B, B_BINARY); // binary, 12-hour
        assert_eq!(read(&mut rtc, regs::HOURS), 0x81);
        assert_eq!(read(&mut rtc, regs::MINUTES), 5);

        write(&mut rtc, regs::HOURS, 12); // 12 AM
        assert_eq!(rtc.time().hour, 0);
        write(&mut rtc, regs::HOURS, 0x80 | 12); // 12 PM
        assert_eq!(rtc.time().hour, 12);
    }

    #[test]
    fn test_status_registers() {
        let mut rtc = rtc();
        assert_eq!(read(&mut rtc, regs::STATUS_A), 0x26);
        assert_eq!(read(&mut rtc, regs::STATUS_B), 0x02);
        assert_eq!(read(&mut rtc, regs::STATUS_D), 0x80);
        write(&mut rtc, regs::STATUS_D, 0x00);
        assert_eq!(read(&mut rtc, regs::STATUS_D), 0x80);
    }

    #[test]
    fn test_update_interrupt_and_c_read_clears() {
        let (line, sink) = recording_line(RTC_IRQ);
        let mut rtc = Rtc::new(RtcTime::default(), line);
        write(&mut rtc, regs::STATUS_B, B_24H | B_UIE);
        rtc.tick_second();
        assert!(sink.level(RTC_IRQ));
        assert_eq!(read(&mut rtc, regs::STATUS_C), C_IRQF | C_UF);
        assert!(!sink.level(RTC_IRQ));
        assert_eq!(read(&mut rtc, regs::STATUS_C), 0);
    }

    #[test]
    fn test_alarm() {
        let (line, sink) = recording_line(RTC_IRQ);
        let mut rtc = Rtc::new(RtcTime::default(), line);
        write(&mut rtc, regs::STATUS_B, B_24H | B_AIE);
        write(&mut rtc, regs::SECONDS_ALARM, 0x03);
        write(&mut rtc, regs::MINUTES_ALARM, ALARM_DONT_CARE);
        write(&mut rtc, regs::HOURS_ALARM, ALARM_DONT_CARE);
        rtc.tick_second();
        rtc.tick_second();
        assert_eq!(sink.raises(RTC_IRQ), 0);
        rtc.tick_second();
        assert_eq!(sink.raises(RTC_IRQ), 1);
        assert_ne!(read(&mut rtc, regs::STATUS_C) & C_AF, 0);
    }

    #[test]
    fn test_periodic_interrupt() {
        let (line, sink) = recording_line(RTC_IRQ);
        let mut rtc = Rtc::new(RtcTime::default(), line);
        assert_eq!(rtc.periodic_frequency(), Some(1024));
        rtc.tick_periodic();
        assert_eq!(sink.raises(RTC_IRQ), 0, "PIE clear");
        write(&mut rtc, regs::STATUS_B, B_24H | B_PIE);
        assert_eq!(sink.raises(RTC_IRQ), 1, "pending PF asserts on enable");
    }

    #[test]
    fn test_set_halts_updates() {
        let mut rtc = rtc();
        write(&mut rtc, regs::STATUS_B, B_SET | B_24H);
        rtc.tick_second();
        assert_eq!(rtc.time().second, 0);
    }

    #[test]
    fn test_nmi_bit_and_memory_size() {
        let mut rtc = rtc();
        rtc.io_write(RTC_PORT_INDEX, AccessWidth::Byte, 0x80 | regs::SECONDS as u32);
        assert!(rtc.nmi_disabled());
        rtc.set_memory_size(64 << 20);
        assert_eq!(rtc.cmos(regs::EXT_MEM_LO), (63 * 1024 & 0xFF) as u8);
        assert_eq!(rtc.cmos(regs::EXT_MEM_HI), (63 * 1024 >> 8) as u8);
        assert_eq!(rtc.cmos(regs::HIGH_MEM_LO), 0x00);
        assert_eq!(rtc.cmos(regs::HIGH_MEM_HI), 0x03);
    }

    #[test]
    fn test_snapshot_restore() {
        let mut rtc = rtc();
        rtc.tick_second();
        let snap = rtc.snapshot().unwrap();
        let mut other = Rtc::new(RtcTime::from_unix(0), IrqLine::disconnected(8));
        other.restore(&snap).unwrap();
        assert_eq!(other.time(), rtc.time());
    }

    #[test]
    fn test_restore_rejects_bad_cmos() {
        let mut rtc = rtc();
        let snap = rtc.snapshot().unwrap();
        let short = edit_snapshot(&snap, |v| v["cmos"].as_array_mut().unwrap().truncate(14));
        assert!(matches!(rtc.restore(&short), Err(SnapshotError::Malformed(_))));
        let bad_index = edit_snapshot(&snap, |v| v["index"] = serde_json::json!(200));
        assert!(matches!(rtc.restore(&bad_index), Err(SnapshotError::Malformed(_))));
        rtc.restore(&snap).unwrap();
    }
}
