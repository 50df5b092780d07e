//! virtio-blk PCI function.
//!
//! # Request layout
//!
//! ```text
//! header   16 bytes, device-readable: type u32, reserved u32, sector u64
//! data     device-writable for IN / GET_ID, device-readable for OUT
//! status   1 byte, device-writable: 0 OK, 1 IOERR, 2 UNSUPP
//! ```
//!
//! # Device configuration (BAR offset 0x100)
//!
//! ```text
//! 0x100  capacity in sectors (u64)
//! 0x108  size_max
//! 0x10C  seg_max
//! 0x110  geometry
//! 0x114  blk_size
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    regs, scatter, CommonAction, VirtioCommon, VirtioError, VirtqDesc, BAR_SIZE, ISR_QUEUE,
    VIRTIO_PCI_DEVICE_BASE, VIRTIO_VENDOR_ID,
};
use crate::devices::disk::{DiskBackend, SECTOR_SIZE};
use crate::devices::{deposit, extract, AccessWidth, Device, DeviceSnapshot, IrqLine, SnapshotError};
use crate::memory::GuestMemory;
use crate::pci::{BarKind, PciDevice, PciFunction, PciState};

const VIRTIO_ID_BLOCK: u16 = 2;
const QUEUE_SIZE_MAX: u16 = 128;

const VIRTIO_BLK_F_SIZE_MAX: u64 = 1 << 1;
const VIRTIO_BLK_F_SEG_MAX: u64 = 1 << 2;
const VIRTIO_BLK_F_BLK_SIZE: u64 = 1 << 6;
const VIRTIO_BLK_F_FLUSH: u64 = 1 << 9;

const SIZE_MAX: u32 = 1 << 20;
const SEG_MAX: u32 = 126;
const BLK_SIZE: u32 = 512;

const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;
const VIRTIO_BLK_T_FLUSH: u32 = 4;
const VIRTIO_BLK_T_GET_ID: u32 = 8;

const VIRTIO_BLK_S_OK: u8 = 0;
const VIRTIO_BLK_S_IOERR: u8 = 1;
const VIRTIO_BLK_S_UNSUPP: u8 = 2;

const ID_BYTES: usize = 20;
const DEVICE_ID: &[u8] = b"carbon-virtio-blk";

mod config {
    pub const CAPACITY_LO: u64 = 0x100;
    pub const CAPACITY_HI: u64 = 0x104;
    pub const SIZE_MAX: u64 = 0x108;
    pub const SEG_MAX: u64 = 0x10C;
    pub const BLK_SIZE: u64 = 0x114;
}

#[derive(Serialize, Deserialize)]
struct BlkState {
    pci: PciState,
    common: VirtioCommon,
}

/// Block device over a flat disk image.
pub struct VirtioBlk {
    pci: PciDevice,
    common: VirtioCommon,
    disk: Option<Box<dyn DiskBackend>>,
    /// Capacity in sectors.
    capacity: u64,
    memory: Option<Arc<GuestMemory>>,
    faults: u32,
    requests: u64,
}

impl VirtioBlk {
    pub fn new(disk: Option<Box<dyn DiskBackend>>) -> Self {
        let mut pci = PciDevice::new(
            VIRTIO_VENDOR_ID,
            VIRTIO_PCI_DEVICE_BASE + VIRTIO_ID_BLOCK,
            0x01,
            0x00,
            0x00,
        )
        .with_revision(1)
        .with_subsystem(VIRTIO_VENDOR_ID, VIRTIO_ID_BLOCK);
        // Constant BAR size, cannot fail.
        let _ = pci.add_bar(0, BarKind::Memory { prefetchable: false }, BAR_SIZE);
        pci.add_msi_capability();

        let capacity = disk.as_ref().map_or(0, |d| d.sectors());
        let features = VIRTIO_BLK_F_SIZE_MAX | VIRTIO_BLK_F_SEG_MAX | VIRTIO_BLK_F_BLK_SIZE | VIRTIO_BLK_F_FLUSH;
        Self {
            pci,
            common: VirtioCommon::new(features, 1, QUEUE_SIZE_MAX),
            disk,
            capacity,
            memory: None,
            faults: 0,
            requests: 0,
        }
    }

    pub fn set_memory(&mut self, memory: Arc<GuestMemory>) {
        self.memory = Some(memory);
    }

    pub fn set_interrupt(&mut self, irq: IrqLine) {
        self.pci.set_interrupt(irq, 1);
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn common(&self) -> &VirtioCommon {
        &self.common
    }

    /// Requests completed since creation.
    pub fn requests(&self) -> u64 {
        self.requests
    }

    fn device_config(&self, offset: u64) -> u32 {
        match offset {
            config::CAPACITY_LO => self.capacity as u32,
            config::CAPACITY_HI => (self.capacity >> 32) as u32,
            config::SIZE_MAX => SIZE_MAX,
            config::SEG_MAX => SEG_MAX,
            config::BLK_SIZE => BLK_SIZE,
            _ => 0,
        }
    }

    fn device_reset(&mut self) {
        info!("virtio-blk reset by driver");
        self.common.reset();
        self.pci.lower_interrupt();
    }

    fn notify(&mut self) {
        if let Some(memory) = self.memory.clone() {
            self.process_queue(&memory);
        }
        self.common.set_isr(ISR_QUEUE);
        self.pci.raise_interrupt();
    }

    fn process_queue(&mut self, memory: &GuestMemory) {
        loop {
            let Some(queue) = self.common.queue_mut(0) else {
                return;
            };
            let head = match queue.pop_avail(memory) {
                Ok(Some(head)) => head,
                Ok(None) => return,
                Err(e) => {
                    warn!("virtio-blk: {}", e);
                    self.faults += 1;
                    return;
                }
            };
            let queue = *queue;
            let written = match queue.read_chain(memory, head) {
                Ok(chain) => self.process_request(memory, &chain),
                Err(e) => Err(e),
            };
            let written = written.unwrap_or_else(|e| {
                warn!("virtio-blk request {}: {}", head, e);
                self.faults += 1;
                0
            });
            if let Err(e) = queue.push_used(memory, head, written) {
                warn!("virtio-blk used ring: {}", e);
                self.faults += 1;
                return;
            }
            self.requests += 1;
        }
    }

    /// Execute one request. Returns bytes written to device-writable buffers.
    fn process_request(&mut self, memory: &GuestMemory, chain: &[VirtqDesc]) -> Result<u32, VirtioError> {
        let (header, rest) = chain
            .split_first()
            .ok_or(VirtioError::Malformed("empty chain"))?;
        let (status_desc, data) = rest
            .split_last()
            .ok_or(VirtioError::Malformed("missing status descriptor"))?;
        if header.is_write_only() || header.len < 16 {
            return Err(VirtioError::Malformed("bad request header"));
        }
        if !status_desc.is_write_only() || status_desc.len < 1 {
            return Err(VirtioError::Malformed("status descriptor not writable"));
        }

        let req_type = memory.read_u32(header.addr)?;
        let sector = memory.read_u64(header.addr + 8)?;

        let mut written = 0u32;
        let status = match req_type {
            VIRTIO_BLK_T_IN => self.read_sectors(memory, sector, data, &mut written)?,
            VIRTIO_BLK_T_OUT => self.write_sectors(memory, sector, data)?,
            VIRTIO_BLK_T_FLUSH => match self.disk.as_mut().map(|d| d.flush()) {
                Some(Ok(())) => VIRTIO_BLK_S_OK,
                _ => VIRTIO_BLK_S_IOERR,
            },
            VIRTIO_BLK_T_GET_ID => {
                let mut id = [0u8; ID_BYTES];
                id[..DEVICE_ID.len()].copy_from_slice(DEVICE_ID);
                written += scatter(memory, data, &id)?;
                VIRTIO_BLK_S_OK
            }
            other => {
                debug!("virtio-blk unsupported request type {}", other);
                VIRTIO_BLK_S_UNSUPP
            }
        };
        memory.write_u8(status_desc.addr, status)?;
        Ok(written + 1)
    }

    fn in_range(&self, sector: u64, bytes: u64) -> bool {
        let sectors = bytes.div_ceil(SECTOR_SIZE);
        sector
            .checked_add(sectors)
            .is_some_and(|end| end <= self.capacity)
    }

    fn read_sectors(
        &mut self,
        memory: &GuestMemory,
        sector: u64,
        data: &[VirtqDesc],
        written: &mut u32,
    ) -> Result<u8, VirtioError> {
        let total: u64 = data.iter().filter(|d| d.is_write_only()).map(|d| d.len as u64).sum();
        if !self.in_range(sector, total) {
            return Ok(VIRTIO_BLK_S_IOERR);
        }
        let Some(disk) = self.disk.as_mut() else {
            return Ok(VIRTIO_BLK_S_IOERR);
        };
        let mut offset = sector * SECTOR_SIZE;
        for desc in data.iter().filter(|d| d.is_write_only()) {
            let mut buf = vec![0u8; desc.len as usize];
            if let Err(e) = disk.read_at(&mut buf, offset) {
                warn!("virtio-blk read at {:#x}: {}", offset, e);
                return Ok(VIRTIO_BLK_S_IOERR);
            }
            memory.write(desc.addr, &buf)?;
            offset += desc.len as u64;
            *written += desc.len;
        }
        Ok(VIRTIO_BLK_S_OK)
    }

    fn write_sectors(&mut self, memory: &GuestMemory, sector: u64, data: &[VirtqDesc]) -> Result<u8, VirtioError> {
        let total: u64 = data.iter().filter(|d| !d.is_write_only()).map(|d| d.len as u64).sum();
        if self.disk.is_none() || !self.in_range(sector, total) {
            return Ok(VIRTIO_BLK_S_IOERR);
        }
        let buf = super::gather(memory, data)?;
        let offset = sector * SECTOR_SIZE;
        let Some(disk) = self.disk.as_mut() else {
            return Ok(VIRTIO_BLK_S_IOERR);
        };
        if let Err(e) = disk.write_at(&buf, offset) {
            warn!("virtio-blk write at {:#x}: {}", offset, e);
            return Ok(VIRTIO_BLK_S_IOERR);
        }
        Ok(VIRTIO_BLK_S_OK)
    }
}

impl Device for VirtioBlk {
    fn name(&self) -> &str {
        "virtio-blk"
    }

    fn reset(&mut self) {
        self.pci.reset();
        self.common.reset();
    }

    fn snapshot(&self) -> Result<DeviceSnapshot, SnapshotError> {
        let state = BlkState {
            pci: self.pci.save(),
            common: self.common.clone(),
        };
        DeviceSnapshot::capture(self.name(), &state)
    }

    fn restore(&mut self, snapshot: &DeviceSnapshot) -> Result<(), SnapshotError> {
        let state: BlkState = snapshot.decode(self.name())?;
        self.pci.load(state.pci)?;
        self.common = state.common;
        Ok(())
    }

    fn take_faults(&mut self) -> u32 {
        std::mem::take(&mut self.faults)
    }
}

impl PciFunction for VirtioBlk {
    fn pci(&self) -> &PciDevice {
        &self.pci
    }

    fn pci_mut(&mut self) -> &mut PciDevice {
        &mut self.pci
    }

    fn bar_read(&mut self, _bar: usize, offset: u64, width: AccessWidth) -> u32 {
        let aligned = offset & !3;
        let value = if aligned < regs::DEVICE_CONFIG {
            let value = self.common.read(aligned);
            if aligned == regs::ISR_STATUS {
                self.pci.lower_interrupt();
            }
            value
        } else if aligned < regs::NOTIFY {
            self.device_config(aligned)
        } else {
            0
        };
        extract(value as u64, offset & 3, width)
    }

    fn bar_write(&mut self, _bar: usize, offset: u64, width: AccessWidth, value: u32) {
        if offset >= regs::NOTIFY {
            self.notify();
            return;
        }
        if offset >= regs::DEVICE_CONFIG {
            return;
        }
        let aligned = offset & !3;
        let merged = deposit(self.common.peek(aligned) as u64, offset & 3, width, value) as u32;
        if self.common.write(aligned, merged) == CommonAction::Reset {
            self.device_reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::STATUS_DRIVER_OK;
    use super::*;
    use crate::devices::disk::testing::SharedDisk;
    use crate::devices::testing::recording_line;
    use crate::pci::regs as pci_regs;

    const HEADER: u64 = 0x4000;
    const DATA: u64 = 0x5000;
    const STATUS: u64 = 0x6000;

    struct Rig {
        blk: VirtioBlk,
        mem: Arc<GuestMemory>,
        queue: DriverQueue,
        disk: SharedDisk,
    }

    fn rig() -> Rig {
        let disk = SharedDisk::patterned(16);
        let mem = Arc::new(GuestMemory::new(0x10000).unwrap());
        let mut blk = VirtioBlk::new(Some(Box::new(disk.clone())));
        blk.set_memory(mem.clone());
        let queue = DriverQueue::new(DESC, AVAIL, USED, 16);
        {
            let mut writer = bar_writer(&mut blk);
            program_queue(&mut writer, 0, &queue);
        }
        Rig {
            blk,
            mem,
            queue,
            disk,
        }
    }

    fn header(mem: &GuestMemory, req_type: u32, sector: u64) {
        mem.write_u32(HEADER, req_type).unwrap();
        mem.write_u64(HEADER + 8, sector).unwrap();
        mem.write_u8(STATUS, 0xFF).unwrap();
    }

    fn kick(blk: &mut VirtioBlk) {
        blk.bar_write(0, regs::NOTIFY, AccessWidth::Word, 0);
    }

    #[test]
    fn test_pci_identity() {
        let blk = VirtioBlk::new(None);
        assert_eq!(blk.pci().vendor_id(), 0x1AF4);
        assert_eq!(blk.pci().device_id(), 0x1042);
        assert_eq!(blk.pci().config_read(pci_regs::CLASS, AccessWidth::Byte), 0x01);
        assert_eq!(blk.pci().bar_layout(0), Some((BarKind::Memory { prefetchable: false }, 0x1000)));
    }

    #[test]
    fn test_capacity_config() {
        let mut blk = VirtioBlk::new(Some(Box::new(SharedDisk::patterned(2048))));
        assert_eq!(blk.bar_read(0, config::CAPACITY_LO, AccessWidth::Dword), 2048);
        assert_eq!(blk.bar_read(0, config::CAPACITY_HI, AccessWidth::Dword), 0);
        assert_eq!(blk.bar_read(0, config::BLK_SIZE, AccessWidth::Dword), 512);
        assert_eq!(blk.bar_read(0, config::CAPACITY_LO + 1, AccessWidth::Byte), 0x08);
    }

    #[test]
    fn test_status_zero_resets_queues_and_isr() {
        let mut r = rig();
        assert_eq!(r.blk.bar_read(0, regs::QUEUE_ENABLE, AccessWidth::Dword), 1);
        kick(&mut r.blk);
        assert_eq!(r.blk.common().isr() & ISR_QUEUE, ISR_QUEUE);

        r.blk.bar_write(0, regs::DEVICE_STATUS, AccessWidth::Byte, 0);
        assert!(r.blk.common().queues().iter().all(|q| !q.ready));
        assert_eq!(r.blk.common().isr(), 0);
        assert_eq!(r.blk.bar_read(0, regs::DEVICE_STATUS, AccessWidth::Byte), 0);
    }

    #[test]
    fn test_kick_without_memory_raises_isr() {
        let (line, sink) = recording_line(11);
        let mut blk = VirtioBlk::new(None);
        blk.set_interrupt(line);
        blk.bar_write(0, 0xF80, AccessWidth::Dword, 0);
        assert!(sink.level(11));
        assert_eq!(blk.bar_read(0, regs::ISR_STATUS, AccessWidth::Byte), 1);
        assert!(!sink.level(11));
        assert_eq!(blk.bar_read(0, regs::ISR_STATUS, AccessWidth::Byte), 0);
    }

    #[test]
    fn test_read_request() {
        let mut r = rig();
        header(&r.mem, VIRTIO_BLK_T_IN, 3);
        r.queue.add_chain(
            &r.mem,
            &[(HEADER, 16, false), (DATA, 1024, true), (STATUS, 1, true)],
        );
        kick(&mut r.blk);

        let mut data = vec![0u8; 1024];
        r.mem.read(DATA, &mut data).unwrap();
        assert_eq!(data, r.disk.bytes(3 * 512, 1024));
        assert_eq!(data[0], 3);
        assert_eq!(data[512], 4);
        assert_eq!(r.mem.read_u8(STATUS).unwrap(), VIRTIO_BLK_S_OK);
        assert_eq!(r.queue.used_idx(&r.mem), 1);
        assert_eq!(r.queue.used_elem(&r.mem, 0), (0, 1025));
        assert_eq!(r.blk.requests(), 1);
    }

    #[test]
    fn test_write_then_flush() {
        let mut r = rig();
        r.mem.fill(DATA, 512, 0xAB).unwrap();
        header(&r.mem, VIRTIO_BLK_T_OUT, 5);
        r.queue.add_chain(
            &r.mem,
            &[(HEADER, 16, false), (DATA, 512, false), (STATUS, 1, true)],
        );
        kick(&mut r.blk);
        assert_eq!(r.mem.read_u8(STATUS).unwrap(), VIRTIO_BLK_S_OK);
        assert!(r.disk.bytes(5 * 512, 512).iter().all(|&b| b == 0xAB));
        assert_eq!(r.disk.bytes(6 * 512, 1), vec![6]);

        header(&r.mem, VIRTIO_BLK_T_FLUSH, 0);
        r.queue.add_chain(&r.mem, &[(HEADER, 16, false), (STATUS, 1, true)]);
        kick(&mut r.blk);
        assert_eq!(r.mem.read_u8(STATUS).unwrap(), VIRTIO_BLK_S_OK);
        assert_eq!(r.disk.flushes(), 1);
        assert_eq!(r.queue.used_idx(&r.mem), 2);
    }

    #[test]
    fn test_out_of_range_and_unsupported() {
        let mut r = rig();
        header(&r.mem, VIRTIO_BLK_T_IN, 15);
        r.queue.add_chain(
            &r.mem,
            &[(HEADER, 16, false), (DATA, 1024, true), (STATUS, 1, true)],
        );
        kick(&mut r.blk);
        assert_eq!(r.mem.read_u8(STATUS).unwrap(), VIRTIO_BLK_S_IOERR);

        header(&r.mem, 0x42, 0);
        r.queue.add_chain(&r.mem, &[(HEADER, 16, false), (STATUS, 1, true)]);
        kick(&mut r.blk);
        assert_eq!(r.mem.read_u8(STATUS).unwrap(), VIRTIO_BLK_S_UNSUPP);
    }

    #[test]
    fn test_get_id() {
        let mut r = rig();
        header(&r.mem, VIRTIO_BLK_T_GET_ID, 0);
        r.queue.add_chain(
            &r.mem,
            &[(HEADER, 16, false), (DATA, 20, true), (STATUS, 1, true)],
        );
        kick(&mut r.blk);
        let mut id = [0u8; 20];
        r.mem.read(DATA, &mut id).unwrap();
        assert!(id.starts_with(b"carbon-virtio-blk"));
        assert_eq!(r.queue.used_elem(&r.mem, 0).1, 21);
    }

    #[test]
    fn test_malformed_chain_is_fault() {
        let mut r = rig();
        r.queue.add_chain(&r.mem, &[(HEADER, 16, false)]);
        kick(&mut r.blk);
        assert_eq!(r.blk.take_faults(), 1);
        assert_eq!(r.blk.take_faults(), 0);
        // The chain is still returned so the driver does not hang.
        assert_eq!(r.queue.used_idx(&r.mem), 1);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let r = rig();
        let snap = r.blk.snapshot().unwrap();
        let mut other = VirtioBlk::new(None);
        other.restore(&snap).unwrap();
        assert_eq!(other.common().queue(0), r.blk.common().queue(0));
        assert_ne!(other.common().status() & STATUS_DRIVER_OK, 0);
    }
}
