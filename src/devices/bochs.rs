//! Bochs/QEMU "stdvga" display adapter (1234:1111) with an embedded VGA.
//!
//! # VBE Interface
//!
//! Index port 0x1CE selects a register, data port 0x1CF reads or writes it.
//! The same registers appear in BAR2 at `0x500 + index * 2`, and the VGA
//! ports 0x3C0-0x3DF at `0x400 + (port - 0x3C0)`.
//!
//! | Index | Register |
//! |-------|----------|
//! | 0 | ID (0xB0C0-0xB0C5) |
//! | 1 | XRES |
//! | 2 | YRES |
//! | 3 | BPP |
//! | 4 | ENABLE: enabled (0), getcaps (1), 8-bit DAC (5), LFB (6), no-clear (7) |
//! | 5 | BANK |
//! | 6 | VIRT_WIDTH |
//! | 7 | VIRT_HEIGHT |
//! | 8 | X_OFFSET |
//! | 9 | Y_OFFSET |
//! | 10 | VIDEO_MEMORY_64K |
//!
//! BAR0 is the linear framebuffer. Mode registers are only writable while
//! the adapter is disabled. Framebuffer contents are not snapshotted.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::vga::{Vga, VGA_MEMORY_SIZE};
use super::{AccessWidth, Device, DeviceSnapshot, SnapshotError};
use crate::pci::{BarKind, PciDevice, PciFunction, PciState};

pub const VBE_INDEX_PORT: u16 = 0x1CE;
pub const VBE_DATA_PORT: u16 = 0x1CF;
pub const VBE_ID_LATEST: u16 = 0xB0C5;
const VBE_ID_FIRST: u16 = 0xB0C0;

pub const FRAMEBUFFER_BAR: usize = 0;
pub const MMIO_BAR: usize = 2;
const MMIO_BAR_SIZE: u32 = 0x1000;
const MMIO_VGA_BASE: u64 = 0x400;
const MMIO_VBE_BASE: u64 = 0x500;

pub const MAX_XRES: u16 = 2560;
pub const MAX_YRES: u16 = 1600;
pub const MAX_BPP: u16 = 32;

pub mod index {
    pub const ID: u16 = 0;
    pub const XRES: u16 = 1;
    pub const YRES: u16 = 2;
    pub const BPP: u16 = 3;
    pub const ENABLE: u16 = 4;
    pub const BANK: u16 = 5;
    pub const VIRT_WIDTH: u16 = 6;
    pub const VIRT_HEIGHT: u16 = 7;
    pub const X_OFFSET: u16 = 8;
    pub const Y_OFFSET: u16 = 9;
    pub const VIDEO_MEMORY_64K: u16 = 10;
}

pub const ENABLED: u16 = 0x01;
pub const GETCAPS: u16 = 0x02;
pub const DAC_8BIT: u16 = 0x20;
pub const LFB_ENABLED: u16 = 0x40;
pub const NOCLEARMEM: u16 = 0x80;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VbeState {
    index: u16,
    id: u16,
    xres: u16,
    yres: u16,
    bpp: u16,
    enable: u16,
    bank: u16,
    virt_width: u16,
    virt_height: u16,
    x_offset: u16,
    y_offset: u16,
}

impl Default for VbeState {
    fn default() -> Self {
        Self {
            index: 0,
            id: VBE_ID_LATEST,
            xres: 640,
            yres: 480,
            bpp: 32,
            enable: 0,
            bank: 0,
            virt_width: 640,
            virt_height: 480,
            x_offset: 0,
            y_offset: 0,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct BochsSnapshot {
    pci: PciState,
    vbe: VbeState,
    vga: DeviceSnapshot,
}

/// Current display mode as programmed through VBE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayMode {
    pub width: u16,
    pub height: u16,
    pub bpp: u16,
    pub stride: u32,
}

/// Bochs VBE display with a linear framebuffer.
pub struct BochsDisplay {
    pci: PciDevice,
    vbe: VbeState,
    vga: Vga,
    vram: Vec<u8>,
}

impl BochsDisplay {
    /// `vram_size` is rounded down to 64 KiB and up to the next power of two
    /// for the BAR.
    pub fn new(vram_size: usize) -> Self {
        let vram_size = (vram_size & !0xFFFF).max(0x10000);
        let mut pci = PciDevice::new(0x1234, 0x1111, 0x03, 0x00, 0x00)
            .with_subsystem(0x1AF4, 0x1100)
            .with_revision(2);
        let bar_size = (vram_size as u32).next_power_of_two();
        let _ = pci.add_bar(FRAMEBUFFER_BAR, BarKind::Memory { prefetchable: true }, bar_size);
        let _ = pci.add_bar(MMIO_BAR, BarKind::Memory { prefetchable: false }, MMIO_BAR_SIZE);
        info!("bochs display with {} KiB vram", vram_size / 1024);
        Self {
            pci,
            vbe: VbeState::default(),
            vga: Vga::new(),
            vram: vec![0; vram_size],
        }
    }

    pub fn vga(&self) -> &Vga {
        &self.vga
    }

    pub fn framebuffer(&self) -> &[u8] {
        &self.vram
    }

    pub fn is_enabled(&self) -> bool {
        self.vbe.enable & ENABLED != 0
    }

    /// Active mode, if the adapter is enabled.
    pub fn mode(&self) -> Option<DisplayMode> {
        if !self.is_enabled() {
            return None;
        }
        Some(DisplayMode {
            width: self.vbe.xres,
            height: self.vbe.yres,
            bpp: self.vbe.bpp,
            stride: self.line_bytes(self.vbe.virt_width),
        })
    }

    fn line_bytes(&self, width: u16) -> u32 {
        let bits = width as u32 * self.vbe.bpp as u32;
        bits.div_ceil(8)
    }

    fn recompute_virtual(&mut self) {
        let line = self.line_bytes(self.vbe.virt_width).max(1);
        let lines = (self.vram.len() as u32 / line).min(u16::MAX as u32) as u16;
        self.vbe.virt_height = lines;
    }

    pub fn vbe_read(&self, reg: u16) -> u16 {
        let v = &self.vbe;
        let caps = v.enable & GETCAPS != 0;
        match reg {
            index::ID => v.id,
            index::XRES if caps => MAX_XRES,
            index::XRES => v.xres,
            index::YRES if caps => MAX_YRES,
            index::YRES => v.yres,
            index::BPP if caps => MAX_BPP,
            index::BPP => v.bpp,
            index::ENABLE => v.enable,
            index::BANK => v.bank,
            index::VIRT_WIDTH => v.virt_width,
            index::VIRT_HEIGHT => v.virt_height,
            index::X_OFFSET => v.x_offset,
            index::Y_OFFSET => v.y_offset,
            index::VIDEO_MEMORY_64K => (self.vram.len() / 0x10000) as u16,
            _ => 0,
        }
    }

    pub fn vbe_write(&mut self, reg: u16, value: u16) {
        let enabled = self.is_enabled();
        match reg {
            index::ID => {
                if (VBE_ID_FIRST..=VBE_ID_LATEST).contains(&value) {
                    self.vbe.id = value;
                }
            }
            index::XRES if !enabled => {
                if value <= MAX_XRES && value % 8 == 0 {
                    self.vbe.xres = value;
                }
            }
            index::YRES if !enabled => {
                if value <= MAX_YRES {
                    self.vbe.yres = value;
                }
            }
            index::BPP if !enabled => {
                let value = if value == 0 { 8 } else { value };
                if matches!(value, 4 | 8 | 15 | 16 | 24 | 32) {
                    self.vbe.bpp = value;
                }
            }
            index::XRES | index::YRES | index::BPP => {
                debug!("vbe mode register {} write while enabled ignored", reg)
            }
            index::ENABLE => self.write_enable(value),
            index::BANK => {
                let banks = (self.vram.len() / 0x10000) as u16;
                if value < banks {
                    self.vbe.bank = value;
                }
            }
            index::VIRT_WIDTH => {
                if value >= self.vbe.xres {
                    self.vbe.virt_width = value;
                    self.recompute_virtual();
                }
            }
            index::X_OFFSET => self.vbe.x_offset = value,
            index::Y_OFFSET => self.vbe.y_offset = value,
            _ => debug!("vbe write to read-only register {}", reg),
        }
    }

    fn write_enable(&mut self, value: u16) {
        let was_enabled = self.is_enabled();
        if value & ENABLED != 0 && !was_enabled {
            self.vbe.virt_width = self.vbe.xres;
            self.vbe.x_offset = 0;
            self.vbe.y_offset = 0;
            self.vbe.bank = 0;
            self.recompute_virtual();
            if value & NOCLEARMEM == 0 {
                let used = (self.line_bytes(self.vbe.xres) as usize * self.vbe.yres as usize).min(self.vram.len());
                self.vram[..used].fill(0);
            }
            info!("vbe mode {}x{}x{}", self.vbe.xres, self.vbe.yres, self.vbe.bpp);
        }
        self.vbe.enable = value;
    }

    fn read_vram(&self, offset: usize, width: AccessWidth) -> u32 {
        (0..width.bytes()).fold(0, |acc, i| {
            acc | (self.vram.get(offset + i).copied().unwrap_or(0xFF) as u32) << (8 * i)
        })
    }

    fn write_vram(&mut self, offset: usize, width: AccessWidth, value: u32) {
        for i in 0..width.bytes() {
            if let Some(byte) = self.vram.get_mut(offset + i) {
                *byte = (value >> (8 * i)) as u8;
            }
        }
    }
}

impl Device for BochsDisplay {
    fn name(&self) -> &str {
        "bochs-display"
    }

    fn io_read(&mut self, port: u16, width: AccessWidth) -> u32 {
        match port {
            VBE_INDEX_PORT => self.vbe.index as u32 & width.mask(),
            VBE_DATA_PORT => self.vbe_read(self.vbe.index) as u32 & width.mask(),
            _ => self.vga.io_read(port, width),
        }
    }

    fn io_write(&mut self, port: u16, width: AccessWidth, value: u32) {
        match port {
            VBE_INDEX_PORT => self.vbe.index = value as u16,
            VBE_DATA_PORT => self.vbe_write(self.vbe.index, value as u16),
            _ => self.vga.io_write(port, width, value),
        }
    }

    /// Legacy window at 0xA0000. With VBE enabled it maps the selected bank.
    fn mmio_read(&mut self, offset: u64, width: AccessWidth) -> u32 {
        if self.is_enabled() && self.vbe.enable & LFB_ENABLED == 0 && offset < 0x10000 {
            let at = self.vbe.bank as usize * 0x10000 + offset as usize;
            return self.read_vram(at, width);
        }
        self.vga.mmio_read(offset % VGA_MEMORY_SIZE, width)
    }

    fn mmio_write(&mut self, offset: u64, width: AccessWidth, value: u32) {
        if self.is_enabled() && self.vbe.enable & LFB_ENABLED == 0 && offset < 0x10000 {
            let at = self.vbe.bank as usize * 0x10000 + offset as usize;
            self.write_vram(at, width, value);
            return;
        }
        self.vga.mmio_write(offset % VGA_MEMORY_SIZE, width, value);
    }

    fn reset(&mut self) {
        self.pci.reset();
        self.vbe = VbeState::default();
        self.vga.reset();
    }

    fn snapshot(&self) -> Result<DeviceSnapshot, SnapshotError> {
        let state = BochsSnapshot {
            pci: self.pci.save(),
            vbe: self.vbe.clone(),
            vga: self.vga.snapshot()?,
        };
        DeviceSnapshot::capture(self.name(), &state)
    }

    fn restore(&mut self, snapshot: &DeviceSnapshot) -> Result<(), SnapshotError> {
        let state: BochsSnapshot = snapshot.decode(self.name())?;
        self.pci.load(state.pci)?;
        self.vga.restore(&state.vga)?;
        self.vbe = state.vbe;
        Ok(())
    }
}

impl PciFunction for BochsDisplay {
    fn pci(&self) -> &PciDevice {
        &self.pci
    }

    fn pci_mut(&mut self) -> &mut PciDevice {
        &mut self.pci
    }

    fn bar_read(&mut self, bar: usize, offset: u64, width: AccessWidth) -> u32 {
        match bar {
            FRAMEBUFFER_BAR => self.read_vram(offset as usize, width),
            MMIO_BAR if (MMIO_VBE_BASE..MMIO_VBE_BASE + 0x16).contains(&offset) => {
                let value = self.vbe_read(((offset - MMIO_VBE_BASE) / 2) as u16) as u32;
                (value >> (8 * (offset & 1))) & width.mask()
            }
            MMIO_BAR if (MMIO_VGA_BASE..MMIO_VGA_BASE + 0x20).contains(&offset) => {
                self.vga.io_read(0x3C0 + (offset - MMIO_VGA_BASE) as u16, width)
            }
            _ => width.mask(),
        }
    }

    fn bar_write(&mut self, bar: usize, offset: u64, width: AccessWidth, value: u32) {
        match bar {
            FRAMEBUFFER_BAR => self.write_vram(offset as usize, width, value),
            MMIO_BAR if (MMIO_VBE_BASE..MMIO_VBE_BASE + 0x16).contains(&offset) => {
                if width == AccessWidth::Word && offset & 1 == 0 {
                    self.vbe_write(((offset - MMIO_VBE_BASE) / 2) as u16, value as u16);
                }
            }
            MMIO_BAR if (MMIO_VGA_BASE..MMIO_VGA_BASE + 0x20).contains(&offset) => {
                self.vga.io_write(0x3C0 + (offset - MMIO_VGA_BASE) as u16, width, value)
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VRAM: usize = 16 << 20;

    fn set(dev: &mut BochsDisplay, index: u16, value: u16) {
        dev.io_write(VBE_INDEX_PORT, AccessWidth::Word, index as u32);
        dev.io_write(VBE_DATA_PORT, AccessWidth::Word, value as u32);
    }

    fn get(dev: &mut BochsDisplay, index: u16) -> u16 {
        dev.io_write(VBE_INDEX_PORT, AccessWidth::Word, index as u32);
        dev.io_read(VBE_DATA_PORT, AccessWidth::Word) as u16
    }

    #[test]
    fn test_id_and_memory_size() {
        let mut dev = BochsDisplay::new(VRAM);
        assert_eq!(get(&mut dev, index::ID), 0xB0C5);
        set(&mut dev, index::ID, 0xB0C2);
        assert_eq!(get(&mut dev, index::ID), 0xB0C2);
        set(&mut dev, index::ID, 0x1234);
        assert_eq!(get(&mut dev, index::ID), 0xB0C2);
        assert_eq!(get(&mut dev, index::VIDEO_MEMORY_64K), 256);
    }

    #[test]
    fn test_mode_set() {
        let mut dev = BochsDisplay::new(VRAM);
        set(&mut dev, index::XRES, 1024);
        set(&mut dev, index::YRES, 768);
        set(&mut dev, index::BPP, 32);
        assert!(dev.mode().is_none());
        set(&mut dev, index::ENABLE, ENABLED | LFB_ENABLED);
        assert_eq!(
            dev.mode(),
            Some(DisplayMode {
                width: 1024,
                height: 768,
                bpp: 32,
                stride: 4096
            })
        );
        assert_eq!(get(&mut dev, index::VIRT_WIDTH), 1024);
        assert_eq!(get(&mut dev, index::VIRT_HEIGHT), (VRAM / 4096) as u16);

        set(&mut dev, index::XRES, 800);
        assert_eq!(get(&mut dev, index::XRES), 1024, "locked while enabled");
    }

    #[test]
    fn test_invalid_mode_values_ignored() {
        let mut dev = BochsDisplay::new(VRAM);
        set(&mut dev, index::BPP, 12);
        assert_eq!(get(&mut dev, index::BPP), 32);
        set(&mut dev, index::XRES, 4096);
        set(&mut dev, index::XRES, 801);
        assert_eq!(get(&mut dev, index::XRES), 640);
    }

    #[test]
    fn test_getcaps() {
        let mut dev = BochsDisplay::new(VRAM);
        set(&mut dev, index::ENABLE, GETCAPS);
        assert_eq!(get(&mut dev, index::XRES), MAX_XRES);
        assert_eq!(get(&mut dev, index::BPP), MAX_BPP);
        set(&mut dev, index::ENABLE, 0);
        assert_eq!(get(&mut dev, index::XRES), 640);
    }

    #[test]
    fn test_enable_clears_framebuffer() {
        let mut dev = BochsDisplay::new(VRAM);
        dev.bar_write(FRAMEBUFFER_BAR, 0, AccessWidth::Dword, 0xDEAD_BEEF);
        set(&mut dev, index::ENABLE, ENABLED | LFB_ENABLED);
        assert_eq!(dev.bar_read(FRAMEBUFFER_BAR, 0, AccessWidth::Dword), 0);
    }

    #[test]
    fn test_enable_noclear_keeps_framebuffer() {
        let mut dev = BochsDisplay::new(VRAM);
        dev.bar_write(FRAMEBUFFER_BAR, 0, AccessWidth::Dword, 0xDEAD_BEEF);
        set(&mut dev, index::ENABLE, ENABLED | LFB_ENABLED | NOCLEARMEM);
        assert_eq!(dev.bar_read(FRAMEBUFFER_BAR, 0, AccessWidth::Dword), 0xDEAD_BEEF);

        // Already enabled: no transition, no clear.
        set(&mut dev, index::ENABLE, ENABLED | LFB_ENABLED);
        assert_eq!(dev.framebuffer()[0], 0xEF);
    }

    #[test]
    fn test_banked_window() {
        let mut dev = BochsDisplay::new(VRAM);
        set(&mut dev, index::ENABLE, ENABLED);
        set(&mut dev, index::BANK, 2);
        dev.mmio_write(0x10, AccessWidth::Byte, 0x5A);
        assert_eq!(dev.framebuffer()[0x20010], 0x5A);
        set(&mut dev, index::BANK, 1000);
        assert_eq!(get(&mut dev, index::BANK), 2);
    }

    #[test]
    fn test_vga_delegation() {
        let mut dev = BochsDisplay::new(VRAM);
        dev.io_write(0x3C8, AccessWidth::Byte, 5);
        for c in [1, 2, 3] {
            dev.io_write(0x3C9, AccessWidth::Byte, c);
        }
        assert_eq!(dev.vga().palette(5), [1, 2, 3]);
        dev.mmio_write(0x18000, AccessWidth::Byte, b'X' as u32);
        assert_eq!(dev.vga().text_cell(0, 0).map(|c| c.0), Some(b'X'));
    }

    #[test]
    fn test_mmio_bar_mirrors_vbe() {
        let mut dev = BochsDisplay::new(VRAM);
        dev.bar_write(MMIO_BAR, MMIO_VBE_BASE + 2 * index::XRES as u64, AccessWidth::Word, 800);
        assert_eq!(get(&mut dev, index::XRES), 800);
        assert_eq!(dev.bar_read(MMIO_BAR, MMIO_VBE_BASE, AccessWidth::Word), 0xB0C5);
    }

    #[test]
    fn test_bar_sizes() {
        let dev = BochsDisplay::new(VRAM);
        assert_eq!(dev.pci().bar_layout(FRAMEBUFFER_BAR).map(|b| b.1), Some(VRAM as u32));
        assert_eq!(dev.pci().bar_layout(MMIO_BAR).map(|b| b.1), Some(MMIO_BAR_SIZE));
    }

    #[test]
    fn test_snapshot_restore() {
        let mut dev = BochsDisplay::new(VRAM);
        set(&mut dev, index::XRES, 800);
        dev.io_write(0x3C4, AccessWidth::Byte, 2);
        let snap = dev.snapshot().unwrap();
        let mut other = BochsDisplay::new(VRAM);
        other.restore(&snap).unwrap();
        assert_eq!(get(&mut other, index::XRES), 800);
        assert_eq!(other.io_read(0x3C4, AccessWidth::Byte), 2);
    }
}
