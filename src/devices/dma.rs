//! Dual Intel 8237 DMA controllers with page registers.
//!
//! Controller 1 (ports 0x00-0x0F) moves bytes on channels 0-3. Controller 2
//! (ports 0xC0-0xDE, even addresses) moves 16-bit words on channels 4-7;
//! channel 4 cascades controller 1. Each channel has a 16-bit base address
//! and count, loaded one byte at a time through a shared flip-flop, and a page
//! register in 0x81-0x8F that supplies the upper address bits.
//!
//! | Register | Read | Write |
//! |----------|------|-------|
//! | 0-7 | channel address / count | channel address / count |
//! | 8 | status | command |
//! | 9 | | request |
//! | 10 | | single mask |
//! | 11 | | mode |
//! | 12 | | clear flip-flop |
//! | 13 | temporary | master clear |
//! | 14 | | clear masks |
//! | 15 | mask | write masks |

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{AccessWidth, Device, DeviceSnapshot, SnapshotError};
use crate::memory::GuestMemory;

pub const DMA1_BASE: u16 = 0x00;
pub const DMA2_BASE: u16 = 0xC0;
pub const PAGE_BASE: u16 = 0x80;

/// Page register port for each channel.
const PAGE_PORTS: [u16; 8] = [0x87, 0x83, 0x81, 0x82, 0x8F, 0x8B, 0x89, 0x8A];

// Mode register
const MODE_TYPE_MASK: u8 = 0x0C;
const MODE_WRITE: u8 = 0x04;
const MODE_READ: u8 = 0x08;
const MODE_AUTOINIT: u8 = 0x10;
const MODE_DECREMENT: u8 = 0x20;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct DmaChannel {
    base_addr: u16,
    base_count: u16,
    cur_addr: u16,
    cur_count: u16,
    mode: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Controller {
    channels: [DmaChannel; 4],
    command: u8,
    /// Terminal count reached (bits 3:0) and software requests (bits 7:4).
    status: u8,
    mask: u8,
    flip_flop: bool,
    temp: u8,
}

impl Default for Controller {
    fn default() -> Self {
        Self {
            channels: [DmaChannel::default(); 4],
            command: 0,
            status: 0,
            mask: 0x0F,
            flip_flop: false,
            temp: 0,
        }
    }
}

impl Controller {
    fn read(&mut self, reg: u16) -> u8 {
        match reg {
            0..=7 => {
                let ch = &self.channels[(reg / 2) as usize];
                let value = if reg % 2 == 0 { ch.cur_addr } else { ch.cur_count };
                let high = self.flip_flop;
                self.flip_flop = !self.flip_flop;
                if high {
                    (value >> 8) as u8
                } else {
                    value as u8
                }
            }
            8 => {
                let status = self.status;
                // Terminal-count bits clear on read.
                self.status &= 0xF0;
                status
            }
            13 => self.temp,
            15 => self.mask | 0xF0,
            _ => 0xFF,
        }
    }

    fn write(&mut self, reg: u16, value: u8) {
        match reg {
            0..=7 => {
                let high = self.flip_flop;
                self.flip_flop = !self.flip_flop;
                let ch = &mut self.channels[(reg / 2) as usize];
                let merge = |old: u16| {
                    if high {
                        (old & 0x00FF) | ((value as u16) << 8)
                    } else {
                        (old & 0xFF00) | value as u16
                    }
                };
                // Programming the base also loads the current register.
                if reg % 2 == 0 {
                    ch.base_addr = merge(ch.base_addr);
                    ch.cur_addr = ch.base_addr;
                } else {
                    ch.base_count = merge(ch.base_count);
                    ch.cur_count = ch.base_count;
                }
            }
            8 => self.command = value,
            9 => {
                let bit = 0x10 << (value & 3);
                if value & 4 != 0 {
                    self.status |= bit;
                } else {
                    self.status &= !bit;
                }
            }
            10 => {
                let bit = 1 << (value & 3);
                if value & 4 != 0 {
                    self.mask |= bit;
                } else {
                    self.mask &= !bit;
                }
            }
            11 => self.channels[(value & 3) as usize].mode = value,
            12 => self.flip_flop = false,
            13 => *self = Controller::default(),
            14 => self.mask = 0,
            15 => self.mask = value & 0x0F,
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DmaState {
    controllers: [Controller; 2],
    pages: [u8; 16],
}

/// Both 8237 controllers and the page register file.
#[derive(Default)]
pub struct Dma {
    state: DmaState,
    faults: u32,
}

/// Direction a transfer moves data in, from the device's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ToMemory,
    FromMemory,
}

impl Dma {
    pub fn new() -> Self {
        Self::default()
    }

    fn split(channel: usize) -> (usize, usize) {
        (channel / 4, channel % 4)
    }

    pub fn is_masked(&self, channel: usize) -> bool {
        let (c, n) = Self::split(channel & 7);
        self.state.controllers[c].mask & (1 << n) != 0
    }

    /// Page register value for `channel`.
    pub fn page(&self, channel: usize) -> u8 {
        self.state.pages[(PAGE_PORTS[channel & 7] - PAGE_BASE) as usize]
    }

    /// Terminal count reached on `channel` since the status was last read.
    pub fn terminal_count(&self, channel: usize) -> bool {
        let (c, n) = Self::split(channel & 7);
        self.state.controllers[c].status & (1 << n) != 0
    }

    /// Device-to-memory transfer (a "write" transfer in 8237 terms). Returns
    /// the number of bytes moved.
    pub fn transfer_to_memory(&mut self, channel: usize, mem: &GuestMemory, data: &[u8]) -> usize {
        let mut buf = data.to_vec();
        self.transfer(channel, mem, &mut buf, Direction::ToMemory)
    }

    /// Memory-to-device transfer (a "read" transfer). Returns the number of
    /// bytes placed in `data`.
    pub fn transfer_from_memory(
        &mut self,
        channel: usize,
        mem: &GuestMemory,
        data: &mut [u8],
    ) -> usize {
        self.transfer(channel, mem, data, Direction::FromMemory)
    }

    fn transfer(
        &mut self,
        channel: usize,
        mem: &GuestMemory,
        data: &mut [u8],
        dir: Direction,
    ) -> usize {
        if channel > 7 || channel == 4 || self.is_masked(channel) {
            return 0;
        }
        let page = self.page(channel) as u64;
        let (c, n) = Self::split(channel);
        let ctrl = &mut self.state.controllers[c];
        let ch = &mut ctrl.channels[n];

        let expected = match dir {
            Direction::ToMemory => MODE_WRITE,
            Direction::FromMemory => MODE_READ,
        };
        if ch.mode & MODE_TYPE_MASK != expected {
            debug!("DMA channel {} mode {:#x} does not match transfer", channel, ch.mode);
            return 0;
        }

        let wide = c == 1;
        let unit = if wide { 2 } else { 1 };
        let decrement = ch.mode & MODE_DECREMENT != 0;
        let mut moved = 0;
        let mut reached_tc = false;

        while moved + unit <= data.len() {
            let addr = if wide {
                ((page & 0xFE) << 16) | ((ch.cur_addr as u64) << 1)
            } else {
                (page << 16) | ch.cur_addr as u64
            };
            let chunk = &mut data[moved..moved + unit];
            let result = match dir {
                Direction::ToMemory => mem.write(addr, chunk),
                Direction::FromMemory => mem.read(addr, chunk),
            };
            if let Err(e) = result {
                warn!("DMA channel {}: {}", channel, e);
                self.faults += 1;
                break;
            }
            moved += unit;
            ch.cur_addr = if decrement {
                ch.cur_addr.wrapping_sub(1)
            } else {
                ch.cur_addr.wrapping_add(1)
            };
            let (count, wrapped) = ch.cur_count.overflowing_sub(1);
            ch.cur_count = count;
            if wrapped {
                reached_tc = true;
                break;
            }
        }

        if reached_tc {
            ctrl.status |= 1 << n;
            ctrl.status &= !(0x10 << n);
            if ch.mode & MODE_AUTOINIT != 0 {
                ch.cur_addr = ch.base_addr;
                ch.cur_count = ch.base_count;
            } else {
                ctrl.mask |= 1 << n;
            }
        }
        moved
    }
}

impl Device for Dma {
    fn name(&self) -> &str {
        "dma"
    }

    fn io_read(&mut self, port: u16, _width: AccessWidth) -> u32 {
        let value = match port {
            0x00..=0x0F => self.state.controllers[0].read(port),
            0x81..=0x8F => self.state.pages[(port - PAGE_BASE) as usize],
            0xC0..=0xDF if port % 2 == 0 => self.state.controllers[1].read((port - DMA2_BASE) / 2),
            _ => 0xFF,
        };
        value as u32
    }

    fn io_write(&mut self, port: u16, _width: AccessWidth, value: u32) {
        let value = value as u8;
        match port {
            0x00..=0x0F => self.state.controllers[0].write(port, value),
            0x81..=0x8F => self.state.pages[(port - PAGE_BASE) as usize] = value,
            0xC0..=0xDF if port % 2 == 0 => {
                self.state.controllers[1].write((port - DMA2_BASE) / 2, value)
            }
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.state = DmaState::default();
    }

    fn snapshot(&self) -> Result<DeviceSnapshot, SnapshotError> {
        DeviceSnapshot::capture(self.name(), &self.state)
    }

    fn restore(&mut self, snapshot: &DeviceSnapshot) -> Result<(), SnapshotError> {
        self.state = snapshot.decode(self.name())?;
        Ok(())
    }

    fn take_faults(&mut self) -> u32 {
        std::mem::take(&mut self.faults)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn out(dma: &mut Dma, port: u16, value: u8) {
        dma.io_write(port, AccessWidth::Byte, value as u32);
    }

    fn inb(dma: &mut Dma, port: u16) -> u8 {
        dma.io_read(port, AccessWidth::Byte) as u8
    }

    /// Program channel 2 the way a floppy driver does.
    fn program_ch2(dma: &mut Dma, mode: u8, addr: u16, count: u16, page: u8) {
        out(dma, 0x0A, 0x06); // mask channel 2
        out(dma, 0x0C, 0x00);
        out(dma, 0x04, addr as u8);
        out(dma, 0x04, (addr >> 8) as u8);
        out(dma, 0x81, page);
        out(dma, 0x0C, 0x00);
        out(dma, 0x05, count as u8);
        out(dma, 0x05, (count >> 8) as u8);
        out(dma, 0x0B, mode | 2);
        out(dma, 0x0A, 0x02); // unmask
    }

    #[test]
    fn test_flip_flop_address_readback() {
        let mut dma = Dma::new();
        program_ch2(&mut dma, MODE_WRITE, 0x1234, 0x00FF, 0x01);
        out(&mut dma, 0x0C, 0);
        assert_eq!(inb(&mut dma, 0x04), 0x34);
        assert_eq!(inb(&mut dma, 0x04), 0x12);
        assert_eq!(inb(&mut dma, 0x05), 0xFF);
        assert_eq!(inb(&mut dma, 0x05), 0x00);
        assert_eq!(dma.page(2), 0x01);
        assert!(!dma.is_masked(2));
    }

    #[test]
    fn test_transfer_to_memory_uses_page() {
        let mem = GuestMemory::new(0x40000).unwrap();
        let mut dma = Dma::new();
        // count 3 means 4 bytes
        program_ch2(&mut dma, MODE_WRITE, 0x0100, 3, 0x02);
        let moved = dma.transfer_to_memory(2, &mem, &[1, 2, 3, 4, 5, 6]);
        assert_eq!(moved, 4);
        assert_eq!(mem.read_u32(0x20100).unwrap(), 0x0403_0201);
        assert!(dma.terminal_count(2));
        assert!(dma.is_masked(2), "single-cycle channel masks at TC");
        assert_eq!(inb(&mut dma, 0x08) & 0x04, 0x04);
        assert!(!dma.terminal_count(2), "status read clears TC");
    }

    #[test]
    fn test_autoinit_reloads() {
        let mem = GuestMemory::new(0x20000).unwrap();
        let mut dma = Dma::new();
        program_ch2(&mut dma, MODE_WRITE | MODE_AUTOINIT, 0x0010, 1, 0x00);
        assert_eq!(dma.transfer_to_memory(2, &mem, &[0xAA, 0xBB]), 2);
        assert!(!dma.is_masked(2));
        assert_eq!(dma.transfer_to_memory(2, &mem, &[0xCC]), 1);
        assert_eq!(mem.read_u16(0x10).unwrap(), 0xBBCC);
    }

    #[test]
    fn test_transfer_from_memory_sixteen_bit() {
        let mem = GuestMemory::new(0x40000).unwrap();
        mem.write(0x20200, &[9, 8, 7, 6]).unwrap();
        let mut dma = Dma::new();
        // Channel 5: word address 0x100 on page 0x02 is byte 0x20200.
        out(&mut dma, 0xD4, 0x05); // mask ch5
        out(&mut dma, 0xD8, 0);
        out(&mut dma, 0xC4, 0x00);
        out(&mut dma, 0xC4, 0x01);
        out(&mut dma, 0xC6, 0x01);
        out(&mut dma, 0xC6, 0x00);
        out(&mut dma, 0x8B, 0x02);
        out(&mut dma, 0xD6, MODE_READ | 1);
        out(&mut dma, 0xD4, 0x01);
        let mut buf = [0u8; 4];
        assert_eq!(dma.transfer_from_memory(5, &mem, &mut buf), 4);
        assert_eq!(buf, [9, 8, 7, 6]);
    }

    #[test]
    fn test_mode_mismatch_and_mask() {
        let mem = GuestMemory::new(0x10000).unwrap();
        let mut dma = Dma::new();
        assert_eq!(dma.transfer_to_memory(1, &mem, &[1]), 0, "masked at reset");
        program_ch2(&mut dma, MODE_READ, 0, 10, 0);
        assert_eq!(dma.transfer_to_memory(2, &mem, &[1]), 0);
    }

    #[test]
    fn test_bad_address_counts_fault() {
        let mem = GuestMemory::new(0x10000).unwrap();
        let mut dma = Dma::new();
        program_ch2(&mut dma, MODE_WRITE, 0, 10, 0x80);
        assert_eq!(dma.transfer_to_memory(2, &mem, &[1, 2]), 0);
        assert_eq!(dma.take_faults(), 1);
        assert_eq!(dma.take_faults(), 0);
    }

    #[test]
    fn test_master_clear() {
        let mut dma = Dma::new();
        out(&mut dma, 0x0E, 0);
        assert_eq!(inb(&mut dma, 0x0F) & 0x0F, 0);
        out(&mut dma, 0x0D, 0);
        assert_eq!(inb(&mut dma, 0x0F) & 0x0F, 0x0F);
    }
}
