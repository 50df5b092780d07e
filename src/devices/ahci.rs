//! AHCI 1.3 SATA host bus adapter with six ports.
//!
//! # Register map (ABAR, BAR5)
//!
//! ```text
//! 0x00 CAP   0x04 GHC   0x08 IS   0x0C PI   0x10 VS   0x24 CAP2   0x28 BOHC
//! 0x100 + port * 0x80:
//!   0x00 CLB  0x04 CLBU  0x08 FB  0x0C FBU  0x10 IS  0x14 IE  0x18 CMD
//!   0x20 TFD  0x24 SIG   0x28 SSTS 0x2C SCTL 0x30 SERR 0x34 SACT 0x38 CI
//! ```
//!
//! Writing PxCI completes the issued slots synchronously. With guest memory
//! and a disk attached and PxCMD.ST set, each slot's command table is walked
//! and the ATA command executed; otherwise the slots are completed without a
//! transfer. Either way PxCI ends at 0, PxIS.DHRS is set and the controller
//! interrupt fires once if GHC.IE and PxIE.DHRE allow it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::disk::{DiskBackend, SECTOR_SIZE};
use super::{extract, AccessWidth, Device, DeviceSnapshot, IrqLine, SnapshotError};
use crate::memory::{GuestMemory, MemoryError};
use crate::pci::{BarKind, PciDevice, PciFunction, PciState};

pub const NUM_PORTS: usize = 6;
pub const ABAR_INDEX: usize = 5;
pub const ABAR_SIZE: u32 = 0x1000;
const PORT_BASE: u64 = 0x100;
const PORT_STRIDE: u64 = 0x80;

pub mod regs {
    pub const CAP: u64 = 0x00;
    pub const GHC: u64 = 0x04;
    pub const IS: u64 = 0x08;
    pub const PI: u64 = 0x0C;
    pub const VS: u64 = 0x10;
    pub const CAP2: u64 = 0x24;
    pub const BOHC: u64 = 0x28;

    pub const PX_CLB: u64 = 0x00;
    pub const PX_CLBU: u64 = 0x04;
    pub const PX_FB: u64 = 0x08;
    pub const PX_FBU: u64 = 0x0C;
    pub const PX_IS: u64 = 0x10;
    pub const PX_IE: u64 = 0x14;
    pub const PX_CMD: u64 = 0x18;
    pub const PX_TFD: u64 = 0x20;
    pub const PX_SIG: u64 = 0x24;
    pub const PX_SSTS: u64 = 0x28;
    pub const PX_SCTL: u64 = 0x2C;
    pub const PX_SERR: u64 = 0x30;
    pub const PX_SACT: u64 = 0x34;
    pub const PX_CI: u64 = 0x38;
}

const CAP_S64A: u32 = 1 << 31;
const CAP_SAM: u32 = 1 << 18;
const CAP_ISS_GEN2: u32 = 2 << 20;
const CAP_NCS: u32 = 31 << 8;
const VERSION_1_3: u32 = 0x0001_0300;

const GHC_HR: u32 = 1 << 0;
const GHC_IE: u32 = 1 << 1;
const GHC_AE: u32 = 1 << 31;

const PX_IS_DHRS: u32 = 1 << 0;
const PX_IS_TFES: u32 = 1 << 30;

const PX_CMD_ST: u32 = 1 << 0;
const PX_CMD_SUD: u32 = 1 << 1;
const PX_CMD_POD: u32 = 1 << 2;
const PX_CMD_FRE: u32 = 1 << 4;
const PX_CMD_FR: u32 = 1 << 14;
const PX_CMD_CR: u32 = 1 << 15;

const ATA_SR_ERR: u8 = 0x01;
const ATA_SR_DSC: u8 = 0x10;
const ATA_SR_DRDY: u8 = 0x40;
const ATA_ER_ABRT: u8 = 0x04;

const SATA_SIG_ATA: u32 = 0x0000_0101;
/// DET=3 (device present, PHY up), SPD=2, IPM=1.
const SSTS_ONLINE: u32 = 0x123;

const FIS_TYPE_H2D: u8 = 0x27;
const FIS_TYPE_D2H: u8 = 0x34;
const D2H_FIS_OFFSET: u64 = 0x40;

const CMD_HEADER_SIZE: u64 = 32;
const PRDT_OFFSET: u64 = 0x80;
const PRD_SIZE: u64 = 16;

const ATA_READ_DMA: u8 = 0xC8;
const ATA_READ_DMA_EXT: u8 = 0x25;
const ATA_WRITE_DMA: u8 = 0xCA;
const ATA_WRITE_DMA_EXT: u8 = 0x35;
const ATA_FLUSH_CACHE: u8 = 0xE7;
const ATA_FLUSH_CACHE_EXT: u8 = 0xEA;
const ATA_IDENTIFY: u8 = 0xEC;
const ATA_SET_FEATURES: u8 = 0xEF;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct PortRegs {
    clb: u64,
    fb: u64,
    is: u32,
    ie: u32,
    cmd: u32,
    tfd: u32,
    sig: u32,
    ssts: u32,
    sctl: u32,
    serr: u32,
    sact: u32,
    ci: u32,
}

impl PortRegs {
    fn power_on(present: bool) -> Self {
        let mut port = Self {
            cmd: PX_CMD_SUD | PX_CMD_POD,
            ..Self::default()
        };
        port.link(present);
        port
    }

    fn link(&mut self, present: bool) {
        if present {
            self.ssts = SSTS_ONLINE;
            self.sig = SATA_SIG_ATA;
            self.tfd = (ATA_SR_DRDY | ATA_SR_DSC) as u32;
        } else {
            self.ssts = 0;
            self.sig = 0xFFFF_FFFF;
            self.tfd = 0x7F;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AhciState {
    ghc: u32,
    is: u32,
    ports: [PortRegs; NUM_PORTS],
}

#[derive(Serialize, Deserialize)]
struct AhciSnapshot {
    pci: PciState,
    hba: AhciState,
}

/// Result of one ATA command.
enum AtaStatus {
    Ok,
    Abort,
}

/// Decoded register host-to-device FIS.
struct H2dFis {
    command: u8,
    lba: u64,
    count: u32,
}

impl H2dFis {
    fn parse(raw: &[u8; 20]) -> Option<Self> {
        if raw[0] != FIS_TYPE_H2D {
            return None;
        }
        let lba = raw[4] as u64
            | (raw[5] as u64) << 8
            | (raw[6] as u64) << 16
            | (raw[8] as u64) << 24
            | (raw[9] as u64) << 32
            | (raw[10] as u64) << 40;
        let count = u16::from_le_bytes([raw[12], raw[13]]) as u32;
        Some(Self {
            command: raw[2],
            lba,
            count,
        })
    }

    /// LBA and sector count honoring the 28-bit forms.
    fn extent(&self) -> (u64, u64) {
        match self.command {
            ATA_READ_DMA_EXT | ATA_WRITE_DMA_EXT => {
                let count = if self.count == 0 { 65536 } else { self.count };
                (self.lba, count as u64)
            }
            _ => {
                let count = self.count & 0xFF;
                let count = if count == 0 { 256 } else { count };
                (self.lba & 0x0FFF_FFFF, count as u64)
            }
        }
    }
}

/// AHCI controller as a PCI function (8086:2922).
pub struct Ahci {
    pci: PciDevice,
    state: AhciState,
    disks: [Option<Box<dyn DiskBackend>>; NUM_PORTS],
    memory: Option<Arc<GuestMemory>>,
    faults: u32,
}

impl Default for Ahci {
    fn default() -> Self {
        Self::new()
    }
}

impl Ahci {
    pub fn new() -> Self {
        let mut pci = PciDevice::new(0x8086, 0x2922, 0x01, 0x06, 0x01).with_revision(2);
        let _ = pci.add_bar(ABAR_INDEX, BarKind::Memory { prefetchable: false }, ABAR_SIZE);
        pci.add_msi_capability();
        let mut ahci = Self {
            pci,
            state: AhciState {
                ghc: GHC_AE,
                is: 0,
                ports: [PortRegs::default(); NUM_PORTS],
            },
            disks: Default::default(),
            memory: None,
            faults: 0,
        };
        ahci.hba_reset();
        ahci
    }

    pub fn set_memory(&mut self, memory: Arc<GuestMemory>) {
        self.memory = Some(memory);
    }

    pub fn set_interrupt(&mut self, irq: IrqLine) {
        self.pci.set_interrupt(irq, 1);
    }

    /// Connect `disk` to `port`. Out-of-range ports are ignored.
    pub fn attach_disk(&mut self, port: usize, disk: Box<dyn DiskBackend>) {
        if let Some(slot) = self.disks.get_mut(port) {
            info!("ahci port {}: {} sectors", port, disk.sectors());
            *slot = Some(disk);
            self.state.ports[port].link(true);
        }
    }

    pub fn port_is(&self, port: usize) -> u32 {
        self.state.ports.get(port).map_or(0, |p| p.is)
    }

    pub fn port_ci(&self, port: usize) -> u32 {
        self.state.ports.get(port).map_or(0, |p| p.ci)
    }

    pub fn port_tfd(&self, port: usize) -> u32 {
        self.state.ports.get(port).map_or(0, |p| p.tfd)
    }

    fn capabilities() -> u32 {
        CAP_S64A | CAP_SAM | CAP_ISS_GEN2 | CAP_NCS | (NUM_PORTS as u32 - 1)
    }

    /// GHC.HR: every port back to power-on, interrupts cleared.
    fn hba_reset(&mut self) {
        info!("ahci HBA reset");
        self.state.ghc = GHC_AE;
        self.state.is = 0;
        for (port, regs) in self.state.ports.iter_mut().enumerate() {
            *regs = PortRegs::power_on(self.disks[port].is_some());
        }
        self.pci.lower_interrupt();
    }

    fn update_irq(&mut self) {
        if self.state.ghc & GHC_IE == 0 || self.state.is == 0 {
            self.pci.lower_interrupt();
        } else {
            self.pci.raise_interrupt();
        }
    }

    fn global_read(&self, offset: u64) -> u32 {
        match offset {
            regs::CAP => Self::capabilities(),
            regs::GHC => self.state.ghc,
            regs::IS => self.state.is,
            regs::PI => (1 << NUM_PORTS) - 1,
            regs::VS => VERSION_1_3,
            _ => 0,
        }
    }

    fn global_write(&mut self, offset: u64, value: u32) {
        match offset {
            regs::GHC => {
                if value & GHC_HR != 0 {
                    self.hba_reset();
                    return;
                }
                self.state.ghc = GHC_AE | (value & GHC_IE);
                self.update_irq();
            }
            regs::IS => {
                self.state.is &= !value;
                self.update_irq();
            }
            regs::CAP2 | regs::BOHC => {}
            _ => debug!("ahci write to read-only global register {:#x}", offset),
        }
    }

    fn port_read(&self, port: usize, offset: u64) -> u32 {
        let p = &self.state.ports[port];
        match offset {
            regs::PX_CLB => p.clb as u32,
            regs::PX_CLBU => (p.clb >> 32) as u32,
            regs::PX_FB => p.fb as u32,
            regs::PX_FBU => (p.fb >> 32) as u32,
            regs::PX_IS => p.is,
            regs::PX_IE => p.ie,
            regs::PX_CMD => p.cmd,
            regs::PX_TFD => p.tfd,
            regs::PX_SIG => p.sig,
            regs::PX_SSTS => p.ssts,
            regs::PX_SCTL => p.sctl,
            regs::PX_SERR => p.serr,
            regs::PX_SACT => p.sact,
            regs::PX_CI => p.ci,
            _ => 0,
        }
    }

    fn port_write(&mut self, port: usize, offset: u64, value: u32) {
        let present = self.disks[port].is_some();
        let p = &mut self.state.ports[port];
        match offset {
            regs::PX_CLB => p.clb = (p.clb & !0xFFFF_FFFF) | (value & !0x3FF) as u64,
            regs::PX_CLBU => p.clb = (p.clb & 0xFFFF_FFFF) | (value as u64) << 32,
            regs::PX_FB => p.fb = (p.fb & !0xFFFF_FFFF) | (value & !0xFF) as u64,
            regs::PX_FBU => p.fb = (p.fb & 0xFFFF_FFFF) | (value as u64) << 32,
            regs::PX_IS => {
                p.is &= !value;
                if p.is & p.ie == 0 {
                    self.state.is &= !(1 << port);
                }
                self.update_irq();
            }
            regs::PX_IE => p.ie = value,
            regs::PX_CMD => {
                let mut cmd = value & !(PX_CMD_CR | PX_CMD_FR);
                if cmd & PX_CMD_ST != 0 {
                    cmd |= PX_CMD_CR;
                } else {
                    p.ci = 0;
                    p.sact = 0;
                }
                if cmd & PX_CMD_FRE != 0 {
                    cmd |= PX_CMD_FR;
                }
                p.cmd = cmd;
            }
            regs::PX_SCTL => {
                p.sctl = value;
                // DET=1 holds COMRESET; releasing it brings the link back.
                if value & 0xF == 1 {
                    p.link(false);
                } else {
                    p.link(present);
                }
            }
            regs::PX_SERR => p.serr &= !value,
            regs::PX_SACT => p.sact |= value,
            regs::PX_CI => {
                p.ci |= value;
                self.issue(port);
            }
            _ => debug!("ahci port {} write to read-only register {:#x}", port, offset),
        }
    }

    /// Complete every issued slot on `port`.
    fn issue(&mut self, port: usize) {
        let slots = self.state.ports[port].ci;
        if slots == 0 {
            return;
        }
        let execute = self.state.ports[port].cmd & PX_CMD_ST != 0 && self.disks[port].is_some();
        let mut failed = false;
        if let (true, Some(memory)) = (execute, self.memory.clone()) {
            for slot in (0..32).filter(|s| slots & (1 << s) != 0) {
                match self.execute_slot(&memory, port, slot) {
                    Ok(AtaStatus::Ok) => {}
                    Ok(AtaStatus::Abort) => failed = true,
                    Err(e) => {
                        warn!("ahci port {} slot {}: {}", port, slot, e);
                        self.faults += 1;
                        failed = true;
                    }
                }
            }
        }

        let p = &mut self.state.ports[port];
        p.ci = 0;
        p.sact = 0;
        if failed {
            p.tfd = ((ATA_ER_ABRT as u32) << 8) | (ATA_SR_DRDY | ATA_SR_ERR) as u32;
            p.is |= PX_IS_TFES;
        } else {
            p.tfd = (ATA_SR_DRDY | ATA_SR_DSC) as u32;
        }
        p.is |= PX_IS_DHRS;
        if p.is & p.ie != 0 {
            self.state.is |= 1 << port;
            if self.state.ghc & GHC_IE != 0 {
                self.pci.raise_interrupt();
            }
        }
    }

    fn execute_slot(&mut self, memory: &GuestMemory, port: usize, slot: u32) -> Result<AtaStatus, MemoryError> {
        let header = self.state.ports[port].clb + slot as u64 * CMD_HEADER_SIZE;
        let dw0 = memory.read_u32(header)?;
        let prdtl = (dw0 >> 16) as u64;
        let table = memory.read_u64(header + 8)? & !0x7F;

        let mut raw = [0u8; 20];
        memory.read(table, &mut raw)?;
        let Some(fis) = H2dFis::parse(&raw) else {
            debug!("ahci port {}: not a register H2D FIS", port);
            return Ok(AtaStatus::Abort);
        };

        let prds = (0..prdtl)
            .map(|i| {
                let at = table + PRDT_OFFSET + i * PRD_SIZE;
                let dba = memory.read_u64(at)?;
                let dbc = (memory.read_u32(at + 12)? & 0x3F_FFFF) + 1;
                Ok((dba, dbc as usize))
            })
            .collect::<Result<Vec<_>, MemoryError>>()?;

        let (status, transferred) = self.run_ata(memory, port, &fis, &prds)?;
        memory.write_u32(header + 4, transferred)?;
        self.post_d2h(memory, port, &fis, &status)?;
        Ok(status)
    }

    fn run_ata(
        &mut self,
        memory: &GuestMemory,
        port: usize,
        fis: &H2dFis,
        prds: &[(u64, usize)],
    ) -> Result<(AtaStatus, u32), MemoryError> {
        let Some(disk) = self.disks[port].as_mut() else {
            return Ok((AtaStatus::Abort, 0));
        };
        match fis.command {
            ATA_IDENTIFY => {
                let data = identify_data(disk.sectors());
                let n = scatter_prds(memory, prds, &data)?;
                Ok((AtaStatus::Ok, n as u32))
            }
            ATA_READ_DMA | ATA_READ_DMA_EXT => {
                let (lba, count) = fis.extent();
                if lba.checked_add(count).map_or(true, |end| end > disk.sectors()) {
                    return Ok((AtaStatus::Abort, 0));
                }
                let mut data = vec![0u8; (count * SECTOR_SIZE) as usize];
                if let Err(e) = disk.read_at(&mut data, lba * SECTOR_SIZE) {
                    warn!("ahci port {} read: {}", port, e);
                    return Ok((AtaStatus::Abort, 0));
                }
                let n = scatter_prds(memory, prds, &data)?;
                Ok((AtaStatus::Ok, n as u32))
            }
            ATA_WRITE_DMA | ATA_WRITE_DMA_EXT => {
                let (lba, count) = fis.extent();
                if lba.checked_add(count).map_or(true, |end| end > disk.sectors()) {
                    return Ok((AtaStatus::Abort, 0));
                }
                let data = gather_prds(memory, prds, (count * SECTOR_SIZE) as usize)?;
                if let Err(e) = disk.write_at(&data, lba * SECTOR_SIZE) {
                    warn!("ahci port {} write: {}", port, e);
                    return Ok((AtaStatus::Abort, 0));
                }
                Ok((AtaStatus::Ok, data.len() as u32))
            }
            ATA_FLUSH_CACHE | ATA_FLUSH_CACHE_EXT => match disk.flush() {
                Ok(()) => Ok((AtaStatus::Ok, 0)),
                Err(_) => Ok((AtaStatus::Abort, 0)),
            },
            ATA_SET_FEATURES => Ok((AtaStatus::Ok, 0)),
            other => {
                debug!("ahci port {}: unsupported ATA command {:#04x}", port, other);
                Ok((AtaStatus::Abort, 0))
            }
        }
    }

    /// Post a D2H register FIS into the received-FIS area if FRE is set.
    fn post_d2h(&self, memory: &GuestMemory, port: usize, fis: &H2dFis, status: &AtaStatus) -> Result<(), MemoryError> {
        let p = &self.state.ports[port];
        if p.cmd & PX_CMD_FRE == 0 {
            return Ok(());
        }
        let (sr, er) = match status {
            AtaStatus::Ok => (ATA_SR_DRDY | ATA_SR_DSC, 0),
            AtaStatus::Abort => (ATA_SR_DRDY | ATA_SR_ERR, ATA_ER_ABRT),
        };
        let mut d2h = [0u8; 20];
        d2h[0] = FIS_TYPE_D2H;
        d2h[1] = 1 << 6;
        d2h[2] = sr;
        d2h[3] = er;
        d2h[4..7].copy_from_slice(&fis.lba.to_le_bytes()[0..3]);
        d2h[8..11].copy_from_slice(&fis.lba.to_le_bytes()[3..6]);
        d2h[12..14].copy_from_slice(&(fis.count as u16).to_le_bytes());
        memory.write(p.fb + D2H_FIS_OFFSET, &d2h)
    }
}

fn scatter_prds(memory: &GuestMemory, prds: &[(u64, usize)], data: &[u8]) -> Result<usize, MemoryError> {
    let mut done = 0;
    for &(addr, len) in prds {
        if done == data.len() {
            break;
        }
        let n = len.min(data.len() - done);
        memory.write(addr, &data[done..done + n])?;
        done += n;
    }
    Ok(done)
}

fn gather_prds(memory: &GuestMemory, prds: &[(u64, usize)], want: usize) -> Result<Vec<u8>, MemoryError> {
    let mut out = vec![0u8; want];
    let mut done = 0;
    for &(addr, len) in prds {
        if done == want {
            break;
        }
        let n = len.min(want - done);
        memory.read(addr, &mut out[done..done + n])?;
        done += n;
    }
    out.truncate(done);
    Ok(out)
}

/// Copy an ATA string into identify words (byte-swapped, space padded).
fn ata_string(words: &mut [u16], text: &str) {
    let mut bytes = vec![b' '; words.len() * 2];
    for (dst, src) in bytes.iter_mut().zip(text.bytes()) {
        *dst = src;
    }
    for (word, pair) in words.iter_mut().zip(bytes.chunks(2)) {
        *word = (pair[0] as u16) << 8 | pair[1] as u16;
    }
}

/// IDENTIFY DEVICE response for a disk of `sectors` sectors.
fn identify_data(sectors: u64) -> [u8; 512] {
    let mut w = [0u16; 256];
    w[0] = 0x0040;
    ata_string(&mut w[10..20], "CARBON0001");
    ata_string(&mut w[23..27], "1.0");
    ata_string(&mut w[27..47], "CARBON SATA DISK");
    w[47] = 0x8001;
    w[49] = (1 << 9) | (1 << 8);
    w[53] = 0x0006;
    let lba28 = sectors.min(0x0FFF_FFFF) as u32;
    w[60] = lba28 as u16;
    w[61] = (lba28 >> 16) as u16;
    w[75] = 31;
    w[76] = 1 << 2;
    w[80] = 0x00F0;
    w[82] = 1 << 5;
    w[83] = (1 << 14) | (1 << 13) | (1 << 12) | (1 << 10);
    w[84] = 1 << 14;
    w[85] = 1 << 5;
    w[86] = (1 << 13) | (1 << 12) | (1 << 10);
    w[87] = 1 << 14;
    w[88] = 0x203F;
    for (i, word) in w[100..104].iter_mut().enumerate() {
        *word = (sectors >> (16 * i)) as u16;
    }
    w[106] = 0x4000;

    let mut out = [0u8; 512];
    for (i, word) in w.iter().enumerate() {
        out[2 * i..2 * i + 2].copy_from_slice(&word.to_le_bytes());
    }
    out[510] = 0xA5;
    let sum = out[..511].iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    out[511] = sum.wrapping_neg();
    out
}

impl Device for Ahci {
    fn name(&self) -> &str {
        "ahci"
    }

    fn reset(&mut self) {
        self.pci.reset();
        self.hba_reset();
    }

    fn snapshot(&self) -> Result<DeviceSnapshot, SnapshotError> {
        let state = AhciSnapshot {
            pci: self.pci.save(),
            hba: self.state.clone(),
        };
        DeviceSnapshot::capture(self.name(), &state)
    }

    fn restore(&mut self, snapshot: &DeviceSnapshot) -> Result<(), SnapshotError> {
        let state: AhciSnapshot = snapshot.decode(self.name())?;
        self.pci.load(state.pci)?;
        self.state = state.hba;
        Ok(())
    }

    fn take_faults(&mut self) -> u32 {
        std::mem::take(&mut self.faults)
    }
}

impl PciFunction for Ahci {
    fn pci(&self) -> &PciDevice {
        &self.pci
    }

    fn pci_mut(&mut self) -> &mut PciDevice {
        &mut self.pci
    }

    fn bar_read(&mut self, _bar: usize, offset: u64, width: AccessWidth) -> u32 {
        let aligned = offset & !3;
        let value = if aligned < PORT_BASE {
            self.global_read(aligned)
        } else {
            let port = ((aligned - PORT_BASE) / PORT_STRIDE) as usize;
            if port < NUM_PORTS {
                self.port_read(port, (aligned - PORT_BASE) % PORT_STRIDE)
            } else {
                0
            }
        };
        extract(value as u64, offset & 3, width)
    }

    fn bar_write(&mut self, _bar: usize, offset: u64, width: AccessWidth, value: u32) {
        if width != AccessWidth::Dword || offset & 3 != 0 {
            debug!("ahci ignoring {:?} write at {:#x}", width, offset);
            return;
        }
        if offset < PORT_BASE {
            self.global_write(offset, value);
            return;
        }
        let port = ((offset - PORT_BASE) / PORT_STRIDE) as usize;
        if port < NUM_PORTS {
            self.port_write(port, (offset - PORT_BASE) % PORT_STRIDE, value);
        }
    }
}
