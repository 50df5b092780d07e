//! virtio-net PCI function.
//!
//! Queue 0 receives, queue 1 transmits. Every buffer starts with the 12-byte
//! `virtio_net_hdr`; the device strips it on transmit and writes a zeroed one
//! (with `num_buffers = 1`) on receive. Packet switching is not modelled:
//! transmitted frames wait in [`VirtioNet::take_transmitted`] and received
//! frames arrive through [`VirtioNet::receive_packet`].

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    gather, regs, scatter, CommonAction, VirtioCommon, VirtioError, BAR_SIZE, ISR_QUEUE,
    VIRTIO_PCI_DEVICE_BASE, VIRTIO_VENDOR_ID,
};
use crate::devices::{deposit, extract, AccessWidth, Device, DeviceSnapshot, IrqLine, SnapshotError};
use crate::memory::GuestMemory;
use crate::pci::{BarKind, PciDevice, PciFunction, PciState};

const VIRTIO_ID_NET: u16 = 1;
const QUEUE_SIZE_MAX: u16 = 256;

pub const RX_QUEUE: usize = 0;
pub const TX_QUEUE: usize = 1;

pub const NET_HDR_LEN: usize = 12;

const VIRTIO_NET_F_MAC: u64 = 1 << 5;
const VIRTIO_NET_F_STATUS: u64 = 1 << 16;

const LINK_UP: u16 = 1;

/// Frames kept for the host before the oldest is dropped.
const TX_BACKLOG: usize = 256;

#[derive(Serialize, Deserialize)]
struct NetState {
    pci: PciState,
    common: VirtioCommon,
}

/// Network device with a fixed MAC address and the link always up.
pub struct VirtioNet {
    pci: PciDevice,
    common: VirtioCommon,
    mac: [u8; 6],
    memory: Option<Arc<GuestMemory>>,
    transmitted: VecDeque<Vec<u8>>,
    faults: u32,
}

impl VirtioNet {
    pub fn new(mac: [u8; 6]) -> Self {
        let mut pci = PciDevice::new(VIRTIO_VENDOR_ID, VIRTIO_PCI_DEVICE_BASE + VIRTIO_ID_NET, 0x02, 0x00, 0x00)
            .with_revision(1)
            .with_subsystem(VIRTIO_VENDOR_ID, VIRTIO_ID_NET);
        let _ = pci.add_bar(0, BarKind::Memory { prefetchable: false }, BAR_SIZE);
        pci.add_msi_capability();
        Self {
            pci,
            common: VirtioCommon::new(VIRTIO_NET_F_MAC | VIRTIO_NET_F_STATUS, 2, QUEUE_SIZE_MAX),
            mac,
            memory: None,
            transmitted: VecDeque::new(),
            faults: 0,
        }
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

    pub fn common(&self) -> &VirtioCommon {
        &self.common
    }

    /// Frames the guest sent, oldest first.
    pub fn take_transmitted(&mut self) -> Vec<Vec<u8>> {
        self.transmitted.drain(..).collect()
    }

    /// Deliver `frame` into the next receive buffer. Returns false when the
    /// driver has not posted one; the frame is dropped.
    pub fn receive_packet(&mut self, frame: &[u8]) -> bool {
        let Some(memory) = self.memory.clone() else {
            return false;
        };
        if !self.common.driver_ok() {
            return false;
        }
        match self.fill_rx(&memory, frame) {
            Ok(true) => {
                self.interrupt();
                true
            }
            Ok(false) => {
                debug!("virtio-net: no receive buffer, dropping {} bytes", frame.len());
                false
            }
            Err(e) => {
                warn!("virtio-net receive: {}", e);
                self.faults += 1;
                false
            }
        }
    }

    fn fill_rx(&mut self, memory: &GuestMemory, frame: &[u8]) -> Result<bool, VirtioError> {
        let Some(queue) = self.common.queue_mut(RX_QUEUE) else {
            return Ok(false);
        };
        let Some(head) = queue.pop_avail(memory)? else {
            return Ok(false);
        };
        let queue = *queue;
        let chain = queue.read_chain(memory, head)?;

        let mut packet = vec![0u8; NET_HDR_LEN];
        // num_buffers
        packet[10] = 1;
        packet.extend_from_slice(frame);
        let written = scatter(memory, &chain, &packet)?;
        queue.push_used(memory, head, written)?;
        Ok(true)
    }

    fn drain_tx(&mut self, memory: &GuestMemory) -> Result<usize, VirtioError> {
        let mut sent = 0;
        loop {
            let Some(queue) = self.common.queue_mut(TX_QUEUE) else {
                return Ok(sent);
            };
            let Some(head) = queue.pop_avail(memory)? else {
                return Ok(sent);
            };
            let queue = *queue;
            let chain = queue.read_chain(memory, head)?;
            let packet = gather(memory, &chain)?;
            queue.push_used(memory, head, 0)?;
            if packet.len() < NET_HDR_LEN {
                return Err(VirtioError::Malformed("transmit buffer shorter than header"));
            }
            if self.transmitted.len() == TX_BACKLOG {
                self.transmitted.pop_front();
            }
            self.transmitted.push_back(packet[NET_HDR_LEN..].to_vec());
            sent += 1;
        }
    }

    fn notify(&mut self, queue: u32) {
        if queue as usize == TX_QUEUE {
            if let Some(memory) = self.memory.clone() {
                match self.drain_tx(&memory) {
                    Ok(n) => debug!("virtio-net transmitted {} frames", n),
                    Err(e) => {
                        warn!("virtio-net transmit: {}", e);
                        self.faults += 1;
                    }
                }
            }
            self.interrupt();
        }
    }

    fn interrupt(&mut self) {
        self.common.set_isr(ISR_QUEUE);
        self.pci.raise_interrupt();
    }

    fn device_config(&self, offset: u64) -> u32 {
        let mut bytes = [0u8; 8];
        bytes[..6].copy_from_slice(&self.mac);
        bytes[6..8].copy_from_slice(&LINK_UP.to_le_bytes());
        let index = (offset - regs::DEVICE_CONFIG) as usize;
        match index {
            0 | 4 => u32::from_le_bytes([
                bytes[index],
                bytes[index + 1],
                bytes[index + 2],
                bytes[index + 3],
            ]),
            _ => 0,
        }
    }
}

impl Device for VirtioNet {
    fn name(&self) -> &str {
        "virtio-net"
    }

    fn reset(&mut self) {
        self.pci.reset();
        self.common.reset();
        self.transmitted.clear();
    }

    fn snapshot(&self) -> Result<DeviceSnapshot, SnapshotError> {
        let state = NetState {
            pci: self.pci.save(),
            common: self.common.clone(),
        };
        DeviceSnapshot::capture(self.name(), &state)
    }

    fn restore(&mut self, snapshot: &DeviceSnapshot) -> Result<(), SnapshotError> {
        let state: NetState = snapshot.decode(self.name())?;
        self.pci.load(state.pci)?;
        self.common = state.common;
        Ok(())
    }

    fn take_faults(&mut self) -> u32 {
        std::mem::take(&mut self.faults)
    }
}

impl PciFunction for VirtioNet {
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
            self.notify(value & width.mask());
            return;
        }
        if offset >= regs::DEVICE_CONFIG {
            return;
        }
        let aligned = offset & !3;
        let merged = deposit(self.common.peek(aligned) as u64, offset & 3, width, value) as u32;
        if self.common.write(aligned, merged) == CommonAction::Reset {
            info!("virtio-net reset by driver");
            self.common.reset();
            self.transmitted.clear();
            self.pci.lower_interrupt();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::devices::testing::recording_line;

    const MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];
    const RX_DESC: u64 = 0x1000;
    const RX_AVAIL: u64 = 0x2000;
    const RX_USED: u64 = 0x3000;
    const TX_DESC: u64 = 0x4000;
    const TX_AVAIL: u64 = 0x5000;
    const TX_USED: u64 = 0x6000;

    struct Rig {
        net: VirtioNet,
        mem: Arc<GuestMemory>,
        rx: DriverQueue,
        tx: DriverQueue,
    }

    fn rig() -> Rig {
        let mem = Arc::new(GuestMemory::new(0x20000).unwrap());
        let mut net = VirtioNet::new(MAC);
        net.set_memory(mem.clone());
        let rx = DriverQueue::new(RX_DESC, RX_AVAIL, RX_USED, 8);
        let tx = DriverQueue::new(TX_DESC, TX_AVAIL, TX_USED, 8);
        {
            let mut writer = bar_writer(&mut net);
            program_queue(&mut writer, RX_QUEUE as u16, &rx);
            program_queue(&mut writer, TX_QUEUE as u16, &tx);
        }
        Rig { net, mem, rx, tx }
    }

    #[test]
    fn test_mac_and_link_in_config() {
        let mut net = VirtioNet::new(MAC);
        assert_eq!(net.pci().device_id(), 0x1041);
        assert_eq!(net.bar_read(0, regs::DEVICE_CONFIG, AccessWidth::Dword), 0x1200_5452);
        assert_eq!(net.bar_read(0, regs::DEVICE_CONFIG + 4, AccessWidth::Word), 0x5634);
        assert_eq!(net.bar_read(0, regs::DEVICE_CONFIG + 6, AccessWidth::Word), 1);
    }

    #[test]
    fn test_two_queues() {
        let r = rig();
        assert_eq!(r.net.common().queues().len(), 2);
        assert!(r.net.common().queues().iter().all(|q| q.ready && q.size == 8));
    }

    #[test]
    fn test_transmit_strips_header() {
        let (line, sink) = recording_line(10);
        let mut r = rig();
        r.net.set_interrupt(line);
        r.mem.fill(0x8000, NET_HDR_LEN, 0).unwrap();
        r.mem.write(0x8100, b"hello frame").unwrap();
        r.tx.add_chain(&r.mem, &[(0x8000, NET_HDR_LEN as u32, false), (0x8100, 11, false)]);

        r.net.bar_write(0, regs::NOTIFY, AccessWidth::Word, TX_QUEUE as u32);
        assert_eq!(r.net.take_transmitted(), vec![b"hello frame".to_vec()]);
        assert!(r.net.take_transmitted().is_empty());
        assert_eq!(r.tx.used_idx(&r.mem), 1);
        assert_eq!(r.net.common().isr() & ISR_QUEUE, ISR_QUEUE);
        assert!(sink.level(10));
    }

    #[test]
    fn test_rx_kick_does_not_interrupt() {
        let (line, sink) = recording_line(10);
        let mut r = rig();
        r.net.set_interrupt(line);
        r.net.bar_write(0, regs::NOTIFY, AccessWidth::Word, RX_QUEUE as u32);
        assert_eq!(sink.raises(10), 0);
    }

    #[test]
    fn test_receive_packet() {
        let mut r = rig();
        assert!(!r.net.receive_packet(b"early"), "no buffer posted yet");

        r.rx.add_chain(&r.mem, &[(0x9000, 1514, true)]);
        assert!(r.net.receive_packet(b"payload"));
        assert_eq!(r.mem.read_u8(0x9000 + 10).unwrap(), 1);
        let mut frame = [0u8; 7];
        r.mem.read(0x9000 + NET_HDR_LEN as u64, &mut frame).unwrap();
        assert_eq!(&frame, b"payload");
        assert_eq!(r.rx.used_elem(&r.mem, 0), (0, (NET_HDR_LEN + 7) as u32));
        assert!(!r.net.receive_packet(b"again"));
    }

    #[test]
    fn test_status_zero_disables_both_queues() {
        let mut r = rig();
        r.net.bar_write(0, regs::NOTIFY, AccessWidth::Word, TX_QUEUE as u32);
        r.net.bar_write(0, regs::DEVICE_STATUS, AccessWidth::Dword, 0);
        assert!(r.net.common().queues().iter().all(|q| !q.ready));
        assert_eq!(r.net.common().isr(), 0);
        assert!(!r.net.receive_packet(b"x"));
    }

    #[test]
    fn test_short_tx_buffer_is_fault() {
        let mut r = rig();
        r.tx.add_chain(&r.mem, &[(0x8000, 4, false)]);
        r.net.bar_write(0, regs::NOTIFY, AccessWidth::Word, TX_QUEUE as u32);
        assert_eq!(r.net.take_faults(), 1);
        assert!(r.net.take_transmitted().is_empty());
    }
}
