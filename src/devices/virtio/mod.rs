//! Virtio over PCI: split virtqueues and the common configuration window.
//!
//! Each virtio function exposes a single 4 KiB memory BAR:
//!
//! ```text
//! 0x000  DEVICE_FEATURES     device features, word chosen by FEATURES_SELECT
//! 0x004  DRIVER_FEATURES     driver features, word chosen by FEATURES_SELECT
//! 0x008  QUEUE_SELECT
//! 0x00C  QUEUE_SIZE          reads the current size, writes are capped at the max
//! 0x010  QUEUE_ENABLE
//! 0x014  DEVICE_STATUS       writing 0 resets the device
//! 0x018  ISR_STATUS          read to clear
//! 0x01C  FEATURES_SELECT
//! 0x020  QUEUE_DESC          low / high
//! 0x028  QUEUE_AVAIL         low / high
//! 0x030  QUEUE_USED          low / high
//! 0x100  device-specific configuration
//! 0xF00  queue notify        any write at or above; the value is the queue index
//! ```
//!
//! # Split virtqueue
//!
//! ```text
//! descriptor table   16 bytes each: addr u64, len u32, flags u16, next u16
//! available ring     flags u16, idx u16, ring[size] u16
//! used ring          flags u16, idx u16, ring[size] { id u32, len u32 }
//! ```
//!
//! Reference: <https://docs.oasis-open.org/virtio/virtio/v1.1/virtio-v1.1.html>

pub mod blk;
pub mod net;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::memory::{GuestMemory, MemoryError};

pub use blk::VirtioBlk;
pub use net::VirtioNet;

pub const VIRTIO_VENDOR_ID: u16 = 0x1AF4;
/// Modern PCI device IDs are 0x1040 + virtio device type.
pub const VIRTIO_PCI_DEVICE_BASE: u16 = 0x1040;

/// Size of the register BAR.
pub const BAR_SIZE: u32 = 0x1000;

pub mod regs {
    pub const DEVICE_FEATURES: u64 = 0x00;
    pub const DRIVER_FEATURES: u64 = 0x04;
    pub const QUEUE_SELECT: u64 = 0x08;
    pub const QUEUE_SIZE: u64 = 0x0C;
    pub const QUEUE_ENABLE: u64 = 0x10;
    pub const DEVICE_STATUS: u64 = 0x14;
    pub const ISR_STATUS: u64 = 0x18;
    pub const FEATURES_SELECT: u64 = 0x1C;
    pub const QUEUE_DESC_LO: u64 = 0x20;
    pub const QUEUE_DESC_HI: u64 = 0x24;
    pub const QUEUE_AVAIL_LO: u64 = 0x28;
    pub const QUEUE_AVAIL_HI: u64 = 0x2C;
    pub const QUEUE_USED_LO: u64 = 0x30;
    pub const QUEUE_USED_HI: u64 = 0x34;
    pub const DEVICE_CONFIG: u64 = 0x100;
    pub const NOTIFY: u64 = 0xF00;
}

pub const STATUS_ACKNOWLEDGE: u8 = 1;
pub const STATUS_DRIVER: u8 = 2;
pub const STATUS_DRIVER_OK: u8 = 4;
pub const STATUS_FEATURES_OK: u8 = 8;
pub const STATUS_FAILED: u8 = 0x80;

/// ISR bit 0: a used buffer was returned.
pub const ISR_QUEUE: u8 = 1 << 0;
/// ISR bit 1: the device configuration changed.
pub const ISR_CONFIG: u8 = 1 << 1;

pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;

pub const VIRTQ_DESC_F_NEXT: u16 = 1;
pub const VIRTQ_DESC_F_WRITE: u16 = 2;

/// Guest-caused virtqueue errors. Devices count these as faults.
#[derive(Error, Debug)]
pub enum VirtioError {
    #[error("Virtqueue memory access failed: {0}")]
    Memory(#[from] MemoryError),

    #[error("Descriptor index {index} out of range for queue of size {size}")]
    DescriptorIndex { index: u16, size: u16 },

    #[error("Descriptor chain longer than the queue")]
    ChainLoop,

    #[error("Malformed request: {0}")]
    Malformed(&'static str),
}

/// One entry of the descriptor table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtqDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl VirtqDesc {
    pub const SIZE: u64 = 16;

    pub fn read_from(memory: &GuestMemory, addr: u64) -> Result<Self, MemoryError> {
        let mut buf = [0u8; Self::SIZE as usize];
        memory.read(addr, &mut buf)?;
        let mut addr_bytes = [0u8; 8];
        addr_bytes.copy_from_slice(&buf[0..8]);
        Ok(Self {
            addr: u64::from_le_bytes(addr_bytes),
            len: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            flags: u16::from_le_bytes([buf[12], buf[13]]),
            next: u16::from_le_bytes([buf[14], buf[15]]),
        })
    }

    pub fn is_write_only(&self) -> bool {
        self.flags & VIRTQ_DESC_F_WRITE != 0
    }

    fn has_next(&self) -> bool {
        self.flags & VIRTQ_DESC_F_NEXT != 0
    }
}

/// Device-side state of one split virtqueue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Virtqueue {
    pub size: u16,
    pub ready: bool,
    pub desc_table: u64,
    pub avail_ring: u64,
    pub used_ring: u64,
    /// Next available-ring slot the device will consume.
    pub last_avail_idx: u16,
}

impl Virtqueue {
    fn usable(&self) -> bool {
        self.ready && self.size > 0
    }

    /// Take the next chain head the driver made available.
    pub fn pop_avail(&mut self, memory: &GuestMemory) -> Result<Option<u16>, VirtioError> {
        if !self.usable() {
            return Ok(None);
        }
        let avail_idx = memory.read_u16(self.avail_ring + 2)?;
        if avail_idx == self.last_avail_idx {
            return Ok(None);
        }
        let slot = (self.last_avail_idx % self.size) as u64;
        let head = memory.read_u16(self.avail_ring + 4 + slot * 2)?;
        self.last_avail_idx = self.last_avail_idx.wrapping_add(1);
        Ok(Some(head))
    }

    /// Walk the chain starting at `head`.
    pub fn read_chain(&self, memory: &GuestMemory, head: u16) -> Result<Vec<VirtqDesc>, VirtioError> {
        let mut chain = Vec::new();
        let mut index = head;
        loop {
            if index >= self.size {
                return Err(VirtioError::DescriptorIndex {
                    index,
                    size: self.size,
                });
            }
            if chain.len() >= self.size as usize {
                return Err(VirtioError::ChainLoop);
            }
            let desc = VirtqDesc::read_from(memory, self.desc_table + index as u64 * VirtqDesc::SIZE)?;
            chain.push(desc);
            if !desc.has_next() {
                return Ok(chain);
            }
            index = desc.next;
        }
    }

    /// Return chain `head` to the driver with `len` bytes written.
    pub fn push_used(&self, memory: &GuestMemory, head: u16, len: u32) -> Result<(), VirtioError> {
        let used_idx = memory.read_u16(self.used_ring + 2)?;
        let elem = self.used_ring + 4 + (used_idx % self.size) as u64 * 8;
        memory.write_u32(elem, head as u32)?;
        memory.write_u32(elem + 4, len)?;
        memory.write_u16(self.used_ring + 2, used_idx.wrapping_add(1))?;
        Ok(())
    }
}

/// Copy the device-readable part of `chain` into one buffer.
pub fn gather(memory: &GuestMemory, chain: &[VirtqDesc]) -> Result<Vec<u8>, VirtioError> {
    let mut out = Vec::new();
    for desc in chain.iter().filter(|d| !d.is_write_only()) {
        if desc.len as u64 > memory.size() {
            return Err(VirtioError::Malformed("buffer larger than guest memory"));
        }
        let start = out.len();
        out.resize(start + desc.len as usize, 0);
        memory.read(desc.addr, &mut out[start..])?;
    }
    Ok(out)
}

/// Spread `data` over the device-writable part of `chain`. Returns the
/// number of bytes written.
pub fn scatter(memory: &GuestMemory, chain: &[VirtqDesc], data: &[u8]) -> Result<u32, VirtioError> {
    let mut done = 0usize;
    for desc in chain.iter().filter(|d| d.is_write_only()) {
        if done == data.len() {
            break;
        }
        let n = (desc.len as usize).min(data.len() - done);
        memory.write(desc.addr, &data[done..done + n])?;
        done += n;
    }
    Ok(done as u32)
}

/// What a common-configuration write asks the device to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommonAction {
    None,
    /// DEVICE_STATUS was written with 0.
    Reset,
    /// A queue was enabled.
    QueueEnabled(u16),
}

/// Feature negotiation, device status, ISR and queue registers shared by
/// every virtio function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtioCommon {
    device_features: u64,
    driver_features: u64,
    features_select: u32,
    queue_select: u16,
    max_queue_size: u16,
    status: u8,
    isr: u8,
    queues: Vec<Virtqueue>,
}

impl VirtioCommon {
    pub fn new(device_features: u64, num_queues: usize, max_queue_size: u16) -> Self {
        Self {
            device_features: device_features | VIRTIO_F_VERSION_1,
            driver_features: 0,
            features_select: 0,
            queue_select: 0,
            max_queue_size,
            status: 0,
            isr: 0,
            queues: vec![Virtqueue::default(); num_queues],
        }
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn driver_ok(&self) -> bool {
        self.status & STATUS_DRIVER_OK != 0
    }

    pub fn driver_features(&self) -> u64 {
        self.driver_features
    }

    pub fn isr(&self) -> u8 {
        self.isr
    }

    pub fn set_isr(&mut self, bits: u8) {
        self.isr |= bits;
    }

    pub fn queue(&self, index: usize) -> Option<&Virtqueue> {
        self.queues.get(index)
    }

    pub fn queue_mut(&mut self, index: usize) -> Option<&mut Virtqueue> {
        self.queues.get_mut(index)
    }

    pub fn queues(&self) -> &[Virtqueue] {
        &self.queues
    }

    fn selected(&self) -> Option<&Virtqueue> {
        self.queues.get(self.queue_select as usize)
    }

    /// Read the dword register at `offset` without side effects.
    pub fn peek(&self, offset: u64) -> u32 {
        let word = |v: u64| {
            if self.features_select == 0 {
                v as u32
            } else if self.features_select == 1 {
                (v >> 32) as u32
            } else {
                0
            }
        };
        let queue = self.selected().copied().unwrap_or_default();
        match offset {
            regs::DEVICE_FEATURES => word(self.device_features),
            regs::DRIVER_FEATURES => word(self.driver_features),
            regs::QUEUE_SELECT => self.queue_select as u32,
            regs::QUEUE_SIZE => {
                if self.selected().is_some() {
                    queue.size as u32
                } else {
                    0
                }
            }
            regs::QUEUE_ENABLE => queue.ready as u32,
            regs::DEVICE_STATUS => self.status as u32,
            regs::ISR_STATUS => self.isr as u32,
            regs::FEATURES_SELECT => self.features_select,
            regs::QUEUE_DESC_LO => queue.desc_table as u32,
            regs::QUEUE_DESC_HI => (queue.desc_table >> 32) as u32,
            regs::QUEUE_AVAIL_LO => queue.avail_ring as u32,
            regs::QUEUE_AVAIL_HI => (queue.avail_ring >> 32) as u32,
            regs::QUEUE_USED_LO => queue.used_ring as u32,
            regs::QUEUE_USED_HI => (queue.used_ring >> 32) as u32,
            _ => 0,
        }
    }

    /// Guest read: ISR_STATUS clears on read.
    pub fn read(&mut self, offset: u64) -> u32 {
        let value = self.peek(offset);
        if offset == regs::ISR_STATUS {
            self.isr = 0;
        }
        value
    }

    pub fn write(&mut self, offset: u64, value: u32) -> CommonAction {
        let select = self.features_select;
        let set_word = |reg: &mut u64| match select {
            0 => *reg = (*reg & !0xFFFF_FFFF) | value as u64,
            1 => *reg = (*reg & 0xFFFF_FFFF) | (value as u64) << 32,
            _ => {}
        };
        match offset {
            regs::DRIVER_FEATURES => {
                set_word(&mut self.driver_features);
                self.driver_features &= self.device_features;
            }
            regs::FEATURES_SELECT => self.features_select = value,
            regs::QUEUE_SELECT => self.queue_select = value as u16,
            regs::DEVICE_STATUS => {
                if value as u8 == 0 {
                    return CommonAction::Reset;
                }
                self.status = value as u8;
                debug!("virtio status {:#04x}", self.status);
            }
            regs::QUEUE_SIZE => {
                let max = self.max_queue_size;
                if let Some(q) = self.queues.get_mut(self.queue_select as usize) {
                    q.size = (value as u16).min(max);
                }
            }
            regs::QUEUE_ENABLE => {
                let index = self.queue_select;
                if let Some(q) = self.queues.get_mut(index as usize) {
                    q.ready = value & 1 != 0;
                    if q.ready {
                        info!(
                            "virtqueue {} enabled: size={} desc={:#x} avail={:#x} used={:#x}",
                            index, q.size, q.desc_table, q.avail_ring, q.used_ring
                        );
                        return CommonAction::QueueEnabled(index);
                    }
                }
            }
            regs::QUEUE_DESC_LO..=regs::QUEUE_USED_HI => {
                let Some(q) = self.queues.get_mut(self.queue_select as usize) else {
                    return CommonAction::None;
                };
                let (reg, high) = match offset {
                    regs::QUEUE_DESC_LO => (&mut q.desc_table, false),
                    regs::QUEUE_DESC_HI => (&mut q.desc_table, true),
                    regs::QUEUE_AVAIL_LO => (&mut q.avail_ring, false),
                    regs::QUEUE_AVAIL_HI => (&mut q.avail_ring, true),
                    regs::QUEUE_USED_LO => (&mut q.used_ring, false),
                    _ => (&mut q.used_ring, true),
                };
                *reg = if high {
                    (*reg & 0xFFFF_FFFF) | (value as u64) << 32
                } else {
                    (*reg & !0xFFFF_FFFF) | value as u64
                };
            }
            _ => debug!("virtio write to read-only register {:#x}", offset),
        }
        CommonAction::None
    }

    /// Device reset: status, features, ISR and every queue return to zero.
    pub fn reset(&mut self) {
        self.driver_features = 0;
        self.features_select = 0;
        self.queue_select = 0;
        self.status = 0;
        self.isr = 0;
        for q in &mut self.queues {
            *q = Virtqueue::default();
        }
    }
}
