//! Intel 82540EM (8086:100E) gigabit NIC with legacy descriptors.
//!
//! # MMIO Layout (BAR0, 128 KiB)
//!
//! | Offset | Name | Description |
//! |--------|------|-------------|
//! | 0x0000 | CTRL | Device control, RST (26) self-clears |
//! | 0x0008 | STATUS | Link up, full duplex, 1000 Mb/s |
//! | 0x0010 | EECD | EEPROM control |
//! | 0x0014 | EERD | EEPROM read: start (0), done (4), address (15:8), data (31:16) |
//! | 0x0020 | MDIC | PHY access through MDI |
//! | 0x00C0 | ICR | Interrupt cause, cleared on read |
//! | 0x00C8 | ICS | Interrupt cause set |
//! | 0x00D0 | IMS | Interrupt mask set |
//! | 0x00D8 | IMC | Interrupt mask clear |
//! | 0x0100 | RCTL | Receive control |
//! | 0x0400 | TCTL | Transmit control |
//! | 0x2800 | RDBAL/RDBAH/RDLEN/RDH/RDT | Receive ring |
//! | 0x3800 | TDBAL/TDBAH/TDLEN/TDH/TDT | Transmit ring |
//! | 0x4000 | statistics, cleared on read |
//! | 0x5200 | MTA | Multicast table array, 128 entries |
//! | 0x5400 | RAL0/RAH0 | Receive address 0 |
//!
//! Writing TDT transmits descriptors up to the new tail; writing RDT hands
//! buffers to the device and drains packets queued by [`E1000::receive_packet`].
//! The interrupt line follows `ICR & IMS`.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{deposit, extract, AccessWidth, Device, DeviceSnapshot, IrqLine, SnapshotError};
use crate::memory::{GuestMemory, MemoryError};
use crate::pci::{BarKind, PciDevice, PciFunction, PciState};

pub const MMIO_SIZE: u32 = 0x20000;
const REG_SPACE_DWORDS: usize = MMIO_SIZE as usize / 4;
const EEPROM_WORDS: usize = 64;
const EEPROM_CHECKSUM: u16 = 0xBABA;
const PHY_ADDRESS: u32 = 1;
const DESC_SIZE: u64 = 16;
const RX_BACKLOG: usize = 256;
const TX_BACKLOG: usize = 256;
/// Largest frame assembled from TX fragments (TSO segment limit).
const MAX_TX_PACKET: usize = 0x10000;

pub mod regs {
    pub const CTRL: u64 = 0x0000;
    pub const STATUS: u64 = 0x0008;
    pub const EECD: u64 = 0x0010;
    pub const EERD: u64 = 0x0014;
    pub const CTRL_EXT: u64 = 0x0018;
    pub const MDIC: u64 = 0x0020;
    pub const ICR: u64 = 0x00C0;
    pub const ITR: u64 = 0x00C4;
    pub const ICS: u64 = 0x00C8;
    pub const IMS: u64 = 0x00D0;
    pub const IMC: u64 = 0x00D8;
    pub const RCTL: u64 = 0x0100;
    pub const TCTL: u64 = 0x0400;
    pub const TIPG: u64 = 0x0410;
    pub const RDBAL: u64 = 0x2800;
    pub const RDBAH: u64 = 0x2804;
    pub const RDLEN: u64 = 0x2808;
    pub const RDH: u64 = 0x2810;
    pub const RDT: u64 = 0x2818;
    pub const RDTR: u64 = 0x2820;
    pub const TDBAL: u64 = 0x3800;
    pub const TDBAH: u64 = 0x3804;
    pub const TDLEN: u64 = 0x3808;
    pub const TDH: u64 = 0x3810;
    pub const TDT: u64 = 0x3818;
    pub const GPRC: u64 = 0x4074;
    pub const GPTC: u64 = 0x4080;
    pub const TPR: u64 = 0x40D0;
    pub const TPT: u64 = 0x40D4;
    pub const MTA: u64 = 0x5200;
    pub const RAL0: u64 = 0x5400;
    pub const RAH0: u64 = 0x5404;
}

pub mod icr {
    pub const TXDW: u32 = 1 << 0;
    pub const TXQE: u32 = 1 << 1;
    pub const LSC: u32 = 1 << 2;
    pub const RXO: u32 = 1 << 6;
    pub const RXT0: u32 = 1 << 7;
}

const CTRL_SLU: u32 = 1 << 6;
const CTRL_RST: u32 = 1 << 26;
const CTRL_PHY_RST: u32 = 1 << 31;

const STATUS_FD: u32 = 1 << 0;
const STATUS_LU: u32 = 1 << 1;
const STATUS_SPEED_1000: u32 = 0b10 << 6;

const EECD_REQ: u32 = 1 << 6;
const EECD_GNT: u32 = 1 << 7;
const EECD_PRES: u32 = 1 << 8;

const EERD_START: u32 = 1 << 0;
const EERD_DONE: u32 = 1 << 4;

const MDIC_OP_WRITE: u32 = 0b01 << 26;
const MDIC_OP_READ: u32 = 0b10 << 26;
const MDIC_READY: u32 = 1 << 28;
const MDIC_ERROR: u32 = 1 << 30;

const RCTL_EN: u32 = 1 << 1;
const RCTL_BSEX: u32 = 1 << 25;
const TCTL_EN: u32 = 1 << 1;

const RAH_AV: u32 = 1 << 31;

const DESC_DD: u8 = 1 << 0;
const DESC_EOP: u8 = 1 << 1;
const TX_CMD_EOP: u8 = 1 << 0;
const TX_CMD_RS: u8 = 1 << 3;
const TX_CMD_DEXT: u8 = 1 << 5;

/// Power-on PHY registers: autonegotiation complete, link up, 1000BASE-T.
const PHY_DEFAULTS: [(usize, u16); 8] = [
    (0, 0x1140),
    (1, 0x796D),
    (2, 0x0141),
    (3, 0x0C20),
    (4, 0x01E1),
    (5, 0x45E1),
    (9, 0x0E00),
    (10, 0x3C00),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NicState {
    regs: Vec<u32>,
    phy: [u16; 32],
    /// Bytes of a transmit packet whose EOP descriptor has not been seen.
    tx_partial: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct E1000Snapshot {
    pci: PciState,
    nic: NicState,
}

/// E1000-compatible network controller.
pub struct E1000 {
    pci: PciDevice,
    mac: [u8; 6],
    eeprom: [u16; EEPROM_WORDS],
    state: NicState,
    rx_pending: VecDeque<Vec<u8>>,
    tx_packets: VecDeque<Vec<u8>>,
    memory: Option<Arc<GuestMemory>>,
    faults: u32,
}

impl E1000 {
    pub fn new(mac: [u8; 6]) -> Self {
        let mut pci = PciDevice::new(0x8086, 0x100E, 0x02, 0x00, 0x00).with_subsystem(0x8086, 0x001E);
        let _ = pci.add_bar(0, BarKind::Memory { prefetchable: false }, MMIO_SIZE);
        let mut nic = Self {
            pci,
            mac,
            eeprom: eeprom_image(mac),
            state: NicState {
                regs: vec![0; REG_SPACE_DWORDS],
                phy: [0; 32],
                tx_partial: Vec::new(),
            },
            rx_pending: VecDeque::new(),
            tx_packets: VecDeque::new(),
            memory: None,
            faults: 0,
        };
        nic.power_on();
        nic
    }

    pub fn set_memory(&mut self, memory: Arc<GuestMemory>) {
        self.memory = Some(memory);
    }

    pub fn set_interrupt(&mut self, irq: IrqLine) {
        self.pci.set_interrupt(irq, 1);
    }

    pub fn mac(&self) -> [u8; 6] {
        self.mac
    }

    pub fn eeprom_word(&self, index: usize) -> Option<u16> {
        self.eeprom.get(index).copied()
    }

    /// Packets the guest has transmitted since the last call.
    pub fn take_transmitted(&mut self) -> Vec<Vec<u8>> {
        self.tx_packets.drain(..).collect()
    }

    /// Queue a frame from the host network and deliver what fits the ring.
    pub fn receive_packet(&mut self, frame: &[u8]) {
        if self.rx_pending.len() >= RX_BACKLOG {
            debug!("e1000 rx backlog full, dropping frame");
            self.set_cause(icr::RXO);
            return;
        }
        self.rx_pending.push_back(frame.to_vec());
        self.process_rx();
    }

    /// Frames still waiting for receive descriptors.
    pub fn rx_backlog(&self) -> usize {
        self.rx_pending.len()
    }

    fn reg(&self, offset: u64) -> u32 {
        self.state.regs[(offset / 4) as usize]
    }

    fn set_reg(&mut self, offset: u64, value: u32) {
        self.state.regs[(offset / 4) as usize] = value;
    }

    fn power_on(&mut self) {
        self.state.regs.iter_mut().for_each(|r| *r = 0);
        self.state.tx_partial.clear();
        self.state.phy = [0; 32];
        for (reg, value) in PHY_DEFAULTS {
            self.state.phy[reg] = value;
        }
        self.set_reg(regs::CTRL, CTRL_SLU);
        self.set_reg(regs::STATUS, STATUS_FD | STATUS_LU | STATUS_SPEED_1000);
        self.set_reg(regs::EECD, EECD_PRES);
        let mac = self.mac;
        self.set_reg(regs::RAL0, u32::from_le_bytes([mac[0], mac[1], mac[2], mac[3]]));
        self.set_reg(regs::RAH0, u32::from_le_bytes([mac[4], mac[5], 0, 0]) | RAH_AV);
        self.rx_pending.clear();
        self.pci.lower_interrupt();
    }

    fn set_cause(&mut self, cause: u32) {
        let value = self.reg(regs::ICR) | cause;
        self.set_reg(regs::ICR, value);
        self.check_interrupts();
    }

    /// Drive the interrupt line from `ICR & IMS`.
    pub fn check_interrupts(&mut self) {
        if self.reg(regs::ICR) & self.reg(regs::IMS) != 0 {
            self.pci.raise_interrupt();
        } else {
            self.pci.lower_interrupt();
        }
    }

    fn ring(&self, bal: u64) -> (u64, u32) {
        let base = (self.reg(bal + 4) as u64) << 32 | self.reg(bal) as u64;
        let count = self.reg(bal + 8) / DESC_SIZE as u32;
        (base & !0xF, count)
    }

    fn rx_buffer_size(&self) -> usize {
        let rctl = self.reg(regs::RCTL);
        let size = 2048 >> ((rctl >> 16) & 3);
        if rctl & RCTL_BSEX != 0 && size != 2048 {
            size * 16
        } else {
            size
        }
    }

    fn process_tx(&mut self) {
        if self.reg(regs::TCTL) & TCTL_EN == 0 {
            return;
        }
        let Some(memory) = self.memory.clone() else {
            return;
        };
        let (base, count) = self.ring(regs::TDBAL);
        if count == 0 {
            return;
        }
        let tail = self.reg(regs::TDT) % count;
        let mut head = self.reg(regs::TDH) % count;
        let mut sent = false;
        while head != tail {
            let desc = base + head as u64 * DESC_SIZE;
            if let Err(e) = self.transmit_descriptor(&memory, desc) {
                warn!("e1000 tx descriptor {}: {}", head, e);
                self.faults += 1;
                self.state.tx_partial.clear();
            }
            head = (head + 1) % count;
            sent = true;
        }
        self.set_reg(regs::TDH, head);
        if sent {
            self.set_cause(icr::TXDW | icr::TXQE);
        }
    }

    fn transmit_descriptor(&mut self, memory: &GuestMemory, desc: u64) -> Result<(), MemoryError> {
        let buffer = memory.read_u64(desc)?;
        let lower = memory.read_u32(desc + 8)?;
        let cmd = (lower >> 24) as u8;
        let length = if cmd & TX_CMD_DEXT != 0 {
            // Context descriptors carry offload parameters only.
            if (lower >> 20) & 0xF == 0 {
                return memory.write_u8(desc + 12, DESC_DD);
            }
            (lower & 0xF_FFFF) as usize
        } else {
            (lower & 0xFFFF) as usize
        };

        let start = self.state.tx_partial.len();
        if start + length > MAX_TX_PACKET {
            warn!("e1000 tx packet exceeds {} bytes, dropping", MAX_TX_PACKET);
            self.faults += 1;
            self.state.tx_partial.clear();
            if cmd & TX_CMD_RS != 0 {
                memory.write_u8(desc + 12, DESC_DD)?;
            }
            return Ok(());
        }
        self.state.tx_partial.resize(start + length, 0);
        memory.read(buffer, &mut self.state.tx_partial[start..])?;
        if cmd & TX_CMD_EOP != 0 {
            let packet = std::mem::take(&mut self.state.tx_partial);
            self.count_stat(regs::GPTC);
            self.count_stat(regs::TPT);
            if self.tx_packets.len() < TX_BACKLOG {
                self.tx_packets.push_back(packet);
            } else {
                debug!("e1000 tx backlog full, dropping packet");
            }
        }
        if cmd & TX_CMD_RS != 0 {
            memory.write_u8(desc + 12, DESC_DD)?;
        }
        Ok(())
    }

    fn count_stat(&mut self, reg: u64) {
        let value = self.reg(reg).wrapping_add(1);
        self.set_reg(reg, value);
    }

    fn process_rx(&mut self) {
        if self.reg(regs::RCTL) & RCTL_EN == 0 {
            return;
        }
        let Some(memory) = self.memory.clone() else {
            return;
        };
        let (base, count) = self.ring(regs::RDBAL);
        if count == 0 {
            return;
        }
        let buf_size = self.rx_buffer_size();
        let tail = self.reg(regs::RDT) % count;
        let mut head = self.reg(regs::RDH) % count;
        let mut delivered = false;

        while let Some(frame) = self.rx_pending.front() {
            let needed = frame.len().div_ceil(buf_size).max(1) as u32;
            let free = (tail + count - head) % count;
            if free < needed {
                break;
            }
            let Some(frame) = self.rx_pending.pop_front() else {
                break;
            };
            let chunks: Vec<&[u8]> = if frame.is_empty() {
                vec![&frame[..]]
            } else {
                frame.chunks(buf_size).collect()
            };
            let last = chunks.len() - 1;
            for (i, chunk) in chunks.into_iter().enumerate() {
                let desc = base + head as u64 * DESC_SIZE;
                let status = if i == last { DESC_DD | DESC_EOP } else { DESC_DD };
                if let Err(e) = write_rx_descriptor(&memory, desc, chunk, status) {
                    warn!("e1000 rx descriptor {}: {}", head, e);
                    self.faults += 1;
                }
                head = (head + 1) % count;
            }
            self.count_stat(regs::GPRC);
            self.count_stat(regs::TPR);
            delivered = true;
        }
        self.set_reg(regs::RDH, head);
        if delivered {
            self.set_cause(icr::RXT0);
        }
    }

    fn mdic_write(&mut self, value: u32) {
        let phy = (value >> 21) & 0x1F;
        let reg = ((value >> 16) & 0x1F) as usize;
        let data = value & 0xFFFF;
        let op = value & (0b11 << 26);
        let result = if phy != PHY_ADDRESS {
            value | MDIC_READY | MDIC_ERROR
        } else if op == MDIC_OP_READ {
            (value & !0xFFFF) | self.state.phy[reg] as u32 | MDIC_READY
        } else if op == MDIC_OP_WRITE {
            // BMCR reset bit self-clears.
            self.state.phy[reg] = if reg == 0 { data as u16 & !0x8000 } else { data as u16 };
            value | MDIC_READY
        } else {
            value | MDIC_READY | MDIC_ERROR
        };
        self.set_reg(regs::MDIC, result);
    }

    fn read_register(&mut self, offset: u64) -> u32 {
        match offset {
            regs::ICR => {
                let value = self.reg(regs::ICR);
                self.set_reg(regs::ICR, 0);
                self.check_interrupts();
                value
            }
            regs::GPRC | regs::GPTC | regs::TPR | regs::TPT => {
                let value = self.reg(offset);
                self.set_reg(offset, 0);
                value
            }
            regs::ICS | regs::IMC => 0,
            _ if (offset as usize) < MMIO_SIZE as usize => self.reg(offset),
            _ => 0,
        }
    }

    fn write_register(&mut self, offset: u64, value: u32) {
        match offset {
            regs::CTRL => {
                if value & CTRL_RST != 0 {
                    info!("e1000 device reset");
                    self.power_on();
                    return;
                }
                if value & CTRL_PHY_RST != 0 {
                    for (reg, v) in PHY_DEFAULTS {
                        self.state.phy[reg] = v;
                    }
                }
                self.set_reg(regs::CTRL, value & !CTRL_PHY_RST);
            }
            regs::STATUS => {}
            regs::EECD => {
                let mut eecd = (value & !(EECD_GNT | EECD_PRES)) | EECD_PRES;
                if value & EECD_REQ != 0 {
                    eecd |= EECD_GNT;
                }
                self.set_reg(regs::EECD, eecd);
            }
            regs::EERD => {
                if value & EERD_START != 0 {
                    let addr = ((value >> 8) & 0xFF) as usize;
                    let data = self.eeprom_word(addr).unwrap_or(0xFFFF);
                    self.set_reg(regs::EERD, (data as u32) << 16 | (value & 0xFF00) | EERD_DONE);
                } else {
                    self.set_reg(regs::EERD, value);
                }
            }
            regs::MDIC => self.mdic_write(value),
            regs::ICR => {
                let icr = self.reg(regs::ICR) & !value;
                self.set_reg(regs::ICR, icr);
                self.check_interrupts();
            }
            regs::ICS => self.set_cause(value),
            regs::IMS => {
                let ims = self.reg(regs::IMS) | value;
                self.set_reg(regs::IMS, ims);
                self.check_interrupts();
            }
            regs::IMC => {
                let ims = self.reg(regs::IMS) & !value;
                self.set_reg(regs::IMS, ims);
                self.check_interrupts();
            }
            regs::RCTL => {
                self.set_reg(regs::RCTL, value);
                self.process_rx();
            }
            regs::RDLEN | regs::TDLEN => self.set_reg(offset, value & 0xF_FF80),
            regs::RDH | regs::RDT | regs::TDH | regs::TDT => {
                self.set_reg(offset, value & 0xFFFF);
                match offset {
                    regs::RDT => self.process_rx(),
                    regs::TDT => self.process_tx(),
                    _ => {}
                }
            }
            regs::TCTL => {
                self.set_reg(regs::TCTL, value);
                self.process_tx();
            }
            regs::GPRC | regs::GPTC | regs::TPR | regs::TPT => {}
            _ if (offset as usize) < MMIO_SIZE as usize => self.set_reg(offset, value),
            _ => {}
        }
    }
}

fn write_rx_descriptor(memory: &GuestMemory, desc: u64, data: &[u8], status: u8) -> Result<(), MemoryError> {
    let buffer = memory.read_u64(desc)?;
    memory.write(buffer, data)?;
    memory.write_u16(desc + 8, data.len() as u16)?;
    memory.write_u16(desc + 10, 0)?;
    memory.write_u8(desc + 13, 0)?;
    memory.write_u8(desc + 12, status)
}

/// EEPROM holding the MAC, with word 0x3F making the sum 0xBABA.
fn eeprom_image(mac: [u8; 6]) -> [u16; EEPROM_WORDS] {
    let mut eeprom = [0u16; EEPROM_WORDS];
    eeprom[0] = u16::from_le_bytes([mac[0], mac[1]]);
    eeprom[1] = u16::from_le_bytes([mac[2], mac[3]]);
    eeprom[2] = u16::from_le_bytes([mac[4], mac[5]]);
    eeprom[0x0A] = 0x4408;
    eeprom[0x0B] = 0x001E;
    eeprom[0x0C] = 0x8086;
    eeprom[0x0D] = 0x100E;
    eeprom[0x0E] = 0x8086;
    let sum = eeprom[..EEPROM_WORDS - 1].iter().fold(0u16, |acc, &w| acc.wrapping_add(w));
    eeprom[EEPROM_WORDS - 1] = EEPROM_CHECKSUM.wrapping_sub(sum);
    eeprom
}

impl Device for E1000 {
    fn name(&self) -> &str {
        "e1000"
    }

    fn reset(&mut self) {
        self.pci.reset();
        self.power_on();
        self.tx_packets.clear();
    }

    fn snapshot(&self) -> Result<DeviceSnapshot, SnapshotError> {
        let state = E1000Snapshot {
            pci: self.pci.save(),
            nic: self.state.clone(),
        };
        DeviceSnapshot::capture(self.name(), &state)
    }

    fn restore(&mut self, snapshot: &DeviceSnapshot) -> Result<(), SnapshotError> {
        let state: E1000Snapshot = snapshot.decode(self.name())?;
        if state.nic.regs.len() != REG_SPACE_DWORDS {
            return Err(SnapshotError::Malformed("e1000 register file size".into()));
        }
        self.pci.load(state.pci)?;
        self.state = state.nic;
        Ok(())
    }

    fn take_faults(&mut self) -> u32 {
        std::mem::take(&mut self.faults)
    }
}

impl PciFunction for E1000 {
    fn pci(&self) -> &PciDevice {
        &self.pci
    }

    fn pci_mut(&mut self) -> &mut PciDevice {
        &mut self.pci
    }

    fn bar_read(&mut self, _bar: usize, offset: u64, width: AccessWidth) -> u32 {
        let value = self.read_register(offset & !3);
        extract(value as u64, offset & 3, width)
    }

    fn bar_write(&mut self, _bar: usize, offset: u64, width: AccessWidth, value: u32) {
        let reg = offset & !3;
        let value = if width == AccessWidth::Dword {
            value
        } else if (reg as usize) < MMIO_SIZE as usize {
            deposit(self.reg(reg) as u64, offset & 3, width, value) as u32
        } else {
            return;
        };
        self.write_register(reg, value);
    }
}
