//! Legacy VGA register file and the 128 KiB memory window at 0xA0000.
//!
//! # I/O Ports
//!
//! | Port | Register |
//! |------|----------|
//! | 0x3C0 | Attribute controller index/data (flip-flop) |
//! | 0x3C1 | Attribute controller data read |
//! | 0x3C2 | Miscellaneous output (write) / input status 0 (read) |
//! | 0x3C4-0x3C5 | Sequencer index/data |
//! | 0x3C6 | DAC pixel mask |
//! | 0x3C7 | DAC read index (write) / DAC state (read) |
//! | 0x3C8 | DAC write index |
//! | 0x3C9 | DAC data, three 6-bit components per entry |
//! | 0x3CC | Miscellaneous output read |
//! | 0x3CE-0x3CF | Graphics controller index/data |
//! | 0x3D4-0x3D5 | CRTC index/data (0x3B4-0x3B5 in mono mode) |
//! | 0x3DA | Input status 1 (0x3BA in mono mode); resets the flip-flop |
//!
//! Display memory is a flat byte array; planar addressing is not modeled.
//! It is not part of the snapshot.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AccessWidth, Device, DeviceSnapshot, SnapshotError};

pub const VGA_MEMORY_BASE: u64 = 0xA0000;
pub const VGA_MEMORY_SIZE: u64 = 0x20000;
pub const VGA_PORT_BASE: u16 = 0x3B0;
pub const VGA_PORT_LEN: u16 = 0x30;

const SEQ_REGS: usize = 5;
const GC_REGS: usize = 9;
const CRTC_REGS: usize = 25;
const ATTR_REGS: usize = 21;
const PALETTE_ENTRIES: usize = 256;

const MISC_COLOR: u8 = 1 << 0;
const CRTC_PROTECT: u8 = 1 << 7;
/// Attribute index bit 5: palette address source (display enabled).
const ATTR_PAS: u8 = 1 << 5;
const STATUS1_DISPLAY: u8 = 1 << 0;
const STATUS1_VRETRACE: u8 = 1 << 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum DacMode {
    Read,
    Write,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VgaState {
    misc: u8,
    seq_index: u8,
    seq: [u8; SEQ_REGS],
    gc_index: u8,
    gc: [u8; GC_REGS],
    crtc_index: u8,
    crtc: [u8; CRTC_REGS],
    attr_index: u8,
    attr: [u8; ATTR_REGS],
    attr_flip_flop: bool,
    dac_mask: u8,
    dac_read_index: u8,
    dac_write_index: u8,
    dac_component: u8,
    dac_mode: DacMode,
    palette: Vec<[u8; 3]>,
    retrace: bool,
}

impl VgaState {
    fn power_on() -> Self {
        let mut palette = vec![[0u8; 3]; PALETTE_ENTRIES];
        for (i, entry) in palette.iter_mut().take(16).enumerate() {
            *entry = ega_color(i as u8);
        }
        Self {
            misc: MISC_COLOR,
            seq_index: 0,
            seq: [0x03, 0x00, 0x03, 0x00, 0x02],
            gc_index: 0,
            gc: [0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x0E, 0x00, 0xFF],
            crtc_index: 0,
            crtc: [0; CRTC_REGS],
            attr_index: 0,
            attr: [0; ATTR_REGS],
            attr_flip_flop: false,
            dac_mask: 0xFF,
            dac_read_index: 0,
            dac_write_index: 0,
            dac_component: 0,
            dac_mode: DacMode::Write,
            palette,
            retrace: false,
        }
    }
}

/// 6-bit RGB of the 16 standard EGA colors.
fn ega_color(i: u8) -> [u8; 3] {
    let hi = |bit: u8| if i & bit != 0 { 0x2A } else { 0 };
    let lo = if i & 8 != 0 { 0x15 } else { 0 };
    let mut rgb = [hi(4) + lo, hi(2) + lo, hi(1) + lo];
    // Brown rather than dark yellow.
    if i == 6 {
        rgb[1] = 0x15;
    }
    rgb
}

/// Standard VGA adapter.
pub struct Vga {
    state: VgaState,
    memory: Vec<u8>,
}

impl Default for Vga {
    fn default() -> Self {
        Self::new()
    }
}

impl Vga {
    pub fn new() -> Self {
        Self {
            state: VgaState::power_on(),
            memory: vec![0; VGA_MEMORY_SIZE as usize],
        }
    }

    /// Palette entry `index` as 6-bit RGB.
    pub fn palette(&self, index: u8) -> [u8; 3] {
        self.state.palette[index as usize]
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    /// Text-mode cell at `row`, `col` of an 80-column screen at 0xB8000.
    pub fn text_cell(&self, row: usize, col: usize) -> Option<(u8, u8)> {
        let at = 0x18000 + (row * 80 + col) * 2;
        Some((*self.memory.get(at)?, *self.memory.get(at + 1)?))
    }

    fn color_mode(&self) -> bool {
        self.state.misc & MISC_COLOR != 0
    }

    /// Whether `port` belongs to the CRTC block selected by the misc register.
    fn crtc_port(&self, port: u16) -> Option<u16> {
        let base = if self.color_mode() { 0x3D0 } else { 0x3B0 };
        match port.checked_sub(base) {
            Some(off @ (0x4 | 0x5 | 0xA)) => Some(off),
            _ => None,
        }
    }

    /// Read a single-byte VGA port.
    pub fn read_port(&mut self, port: u16) -> u8 {
        if let Some(off) = self.crtc_port(port) {
            return match off {
                0x4 => self.state.crtc_index,
                0x5 => self.state.crtc.get(self.state.crtc_index as usize).copied().unwrap_or(0xFF),
                _ => self.input_status_1(),
            };
        }
        let s = &mut self.state;
        match port {
            0x3C0 => s.attr_index,
            0x3C1 => s.attr.get((s.attr_index & 0x1F) as usize).copied().unwrap_or(0),
            0x3C2 => 0x10,
            0x3C4 => s.seq_index,
            0x3C5 => s.seq.get(s.seq_index as usize).copied().unwrap_or(0xFF),
            0x3C6 => s.dac_mask,
            0x3C7 => {
                if s.dac_mode == DacMode::Read {
                    0x03
                } else {
                    0x00
                }
            }
            0x3C8 => s.dac_write_index,
            0x3C9 => {
                let value = s.palette[s.dac_read_index as usize][s.dac_component as usize];
                s.dac_component += 1;
                if s.dac_component == 3 {
                    s.dac_component = 0;
                    s.dac_read_index = s.dac_read_index.wrapping_add(1);
                }
                value
            }
            0x3CC => s.misc,
            0x3CE => s.gc_index,
            0x3CF => s.gc.get(s.gc_index as usize).copied().unwrap_or(0xFF),
            _ => 0xFF,
        }
    }

    /// Write a single-byte VGA port.
    pub fn write_port(&mut self, port: u16, value: u8) {
        if let Some(off) = self.crtc_port(port) {
            let s = &mut self.state;
            match off {
                0x4 => s.crtc_index = value,
                0x5 => {
                    let index = s.crtc_index as usize;
                    let protected = index < 8 && s.crtc[0x11] & CRTC_PROTECT != 0;
                    if protected {
                        // Bit 4 of the overflow register stays writable.
                        if index == 7 {
                            s.crtc[7] = (s.crtc[7] & !0x10) | (value & 0x10);
                        }
                    } else if let Some(reg) = s.crtc.get_mut(index) {
                        *reg = value;
                    }
                }
                _ => {}
            }
            return;
        }
        let s = &mut self.state;
        match port {
            0x3C0 => {
                if s.attr_flip_flop {
                    if let Some(reg) = s.attr.get_mut((s.attr_index & 0x1F) as usize) {
                        *reg = value;
                    }
                } else {
                    s.attr_index = value & 0x3F;
                }
                s.attr_flip_flop = !s.attr_flip_flop;
            }
            0x3C2 => s.misc = value,
            0x3C4 => s.seq_index = value,
            0x3C5 => {
                if let Some(reg) = s.seq.get_mut(s.seq_index as usize) {
                    *reg = value;
                }
            }
            0x3C6 => s.dac_mask = value,
            0x3C7 => {
                s.dac_read_index = value;
                s.dac_component = 0;
                s.dac_mode = DacMode::Read;
            }
            0x3C8 => {
                s.dac_write_index = value;
                s.dac_component = 0;
                s.dac_mode = DacMode::Write;
            }
            0x3C9 => {
                s.palette[s.dac_write_index as usize][s.dac_component as usize] = value & 0x3F;
                s.dac_component += 1;
                if s.dac_component == 3 {
                    s.dac_component = 0;
                    s.dac_write_index = s.dac_write_index.wrapping_add(1);
                }
            }
            0x3CE => s.gc_index = value,
            0x3CF => {
                if let Some(reg) = s.gc.get_mut(s.gc_index as usize) {
                    *reg = value;
                }
            }
            _ => debug!("vga write to unhandled port {:#x}", port),
        }
    }

    /// Input status 1: alternates retrace on and off on every read.
    fn input_status_1(&mut self) -> u8 {
        self.state.attr_flip_flop = false;
        self.state.retrace = !self.state.retrace;
        if self.state.retrace {
            STATUS1_DISPLAY | STATUS1_VRETRACE
        } else {
            0
        }
    }

    /// Whether the attribute controller drives the display (index bit 5).
    pub fn display_enabled(&self) -> bool {
        self.state.attr_index & ATTR_PAS != 0
    }
}

impl Device for Vga {
    fn name(&self) -> &str {
        "vga"
    }

    fn io_read(&mut self, port: u16, width: AccessWidth) -> u32 {
        (0..width.bytes() as u16).fold(0, |acc, i| acc | (self.read_port(port + i) as u32) << (8 * i))
    }

    fn io_write(&mut self, port: u16, width: AccessWidth, value: u32) {
        for i in 0..width.bytes() as u16 {
            self.write_port(port + i, (value >> (8 * i)) as u8);
        }
    }

    fn mmio_read(&mut self, offset: u64, width: AccessWidth) -> u32 {
        let start = offset as usize;
        (0..width.bytes()).fold(0, |acc, i| {
            acc | (self.memory.get(start + i).copied().unwrap_or(0xFF) as u32) << (8 * i)
        })
    }

    fn mmio_write(&mut self, offset: u64, width: AccessWidth, value: u32) {
        let start = offset as usize;
        for i in 0..width.bytes() {
            if let Some(byte) = self.memory.get_mut(start + i) {
                *byte = (value >> (8 * i)) as u8;
            }
        }
    }

    fn reset(&mut self) {
        self.state = VgaState::power_on();
        self.memory.fill(0);
    }

    fn snapshot(&self) -> Result<DeviceSnapshot, SnapshotError> {
        DeviceSnapshot::capture(self.name(), &self.state)
    }

    fn restore(&mut self, snapshot: &DeviceSnapshot) -> Result<(), SnapshotError> {
        let state: VgaState = snapshot.decode(self.name())?;
        if state.palette.len() != PALETTE_ENTRIES || state.dac_component >= 3 {
            return Err(SnapshotError::Malformed("VGA DAC state".into()));
        }
        self.state = state;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::testing::edit_snapshot;

    #[test]
    fn test_attribute_flip_flop() {
        let mut vga = Vga::new();
        vga.write_port(0x3C0, 0x21);
        vga.write_port(0x3C0, 0x0F);
        assert_eq!(vga.read_port(0x3C1), 0x0F);
        assert!(vga.display_enabled());

        // Leave the flip-flop in the data state, then reset it via 0x3DA.
        vga.write_port(0x3C0, 0x02);
        vga.read_port(0x3DA);
        vga.write_port(0x3C0, 0x03);
        vga.write_port(0x3C0, 0x33);
        vga.write_port(0x3C0, 0x23);
        assert_eq!(vga.read_port(0x3C1), 0x33);
    }

    #[test]
    fn test_dac_palette_is_six_bit() {
        let mut vga = Vga::new();
        vga.write_port(0x3C8, 0x10);
        for v in [0xFF, 0x20, 0x3F, 0x01, 0x02, 0x03] {
            vga.write_port(0x3C9, v);
        }
        assert_eq!(vga.palette(0x10), [0x3F, 0x20, 0x3F]);
        assert_eq!(vga.palette(0x11), [0x01, 0x02, 0x03]);
        assert_eq!(vga.read_port(0x3C8), 0x12);

        vga.write_port(0x3C7, 0x11);
        assert_eq!(vga.read_port(0x3C7), 0x03);
        let rgb: Vec<u8> = (0..3).map(|_| vga.read_port(0x3C9)).collect();
        assert_eq!(rgb, vec![1, 2, 3]);
    }

    #[test]
    fn test_default_palette() {
        let vga = Vga::new();
        assert_eq!(vga.palette(0), [0, 0, 0]);
        assert_eq!(vga.palette(1), [0, 0, 0x2A]);
        assert_eq!(vga.palette(6), [0x2A, 0x15, 0]);
        assert_eq!(vga.palette(15), [0x3F, 0x3F, 0x3F]);
    }

    #[test]
    fn test_retrace_toggles() {
        let mut vga = Vga::new();
        let a = vga.read_port(0x3DA) & STATUS1_VRETRACE;
        let b = vga.read_port(0x3DA) & STATUS1_VRETRACE;
        assert_ne!(a, b);
    }

    #[test]
    fn test_crtc_follows_misc_and_protect() {
        let mut vga = Vga::new();
        vga.write_port(0x3D4, 0x0E);
        vga.write_port(0x3D5, 0x07);
        assert_eq!(vga.read_port(0x3D5), 0x07);
        assert_eq!(vga.read_port(0x3B5), 0xFF, "mono alias inactive");

        vga.write_port(0x3D4, 0x11);
        vga.write_port(0x3D5, CRTC_PROTECT);
        vga.write_port(0x3D4, 0x01);
        vga.write_port(0x3D5, 0x4F);
        assert_eq!(vga.read_port(0x3D5), 0x00, "protected");

        vga.write_port(0x3C2, 0x00);
        vga.write_port(0x3B4, 0x0E);
        assert_eq!(vga.read_port(0x3B5), 0x07);
    }

    #[test]
    fn test_sequencer_and_graphics() {
        let mut vga = Vga::new();
        vga.io_write(0x3C4, AccessWidth::Word, 0x0F02);
        assert_eq!(vga.read_port(0x3C5), 0x0F);
        vga.io_write(0x3CE, AccessWidth::Word, 0x4005);
        assert_eq!(vga.io_read(0x3CE, AccessWidth::Word), 0x4005);
    }

    #[test]
    fn test_text_memory() {
        let mut vga = Vga::new();
        vga.mmio_write(0x18000, AccessWidth::Word, 0x0741);
        assert_eq!(vga.text_cell(0, 0), Some((b'A', 0x07)));
        assert_eq!(vga.mmio_read(0x18000, AccessWidth::Byte), 0x41);
    }

    #[test]
    fn test_restore_rejects_bad_dac_state() {
        let mut vga = Vga::new();
        let snap = Device::snapshot(&vga).unwrap();
        let short = edit_snapshot(&snap, |v| v["palette"].as_array_mut().unwrap().truncate(16));
        assert!(matches!(vga.restore(&short), Err(SnapshotError::Malformed(_))));
        let component = edit_snapshot(&snap, |v| v["dac_component"] = serde_json::json!(7));
        assert!(matches!(vga.restore(&component), Err(SnapshotError::Malformed(_))));
        vga.restore(&snap).unwrap();
    }
}
