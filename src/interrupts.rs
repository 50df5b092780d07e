//! Interrupt routing between devices, the legacy PIC and the APIC complex.
//!
//! ```text
//!   IrqLine::raise(irq)                     IrqLine::send_msi(msg)
//!          │                                         │
//!          ▼                                         ▼
//!   InterruptRouter::route_irq            InterruptRouter::route_msi
//!      │            │                                │ decode address/data
//!      ▼            ▼                                ▼
//!  PicController  IoApic ──redirection entry──► ApicMessage
//!  (irq < 16)     (GSI)                              │
//!      │                                             ▼
//!      │ ExtINT (vCPU 0)                  LocalApic::accept (one or more)
//!      └──────────────► acknowledge(vcpu) ◄──────────┘
//! ```
//!
//! ISA IRQ 0 is wired to IOAPIC input 2, matching the interrupt source
//! override every PC firmware publishes. All other ISA IRQs map one-to-one.
//!
//! # MSI Format
//!
//! ```text
//! address: 0xFEE | dest[19:12] | rsvd | RH[3] | DM[2] | xx
//! data:    trigger[15] | level[14] | rsvd | delivery[10:8] | vector[7:0]
//! ```

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::devices::ioapic::IoApic;
use crate::devices::lapic::LocalApic;
use crate::devices::pic::PicController;
use crate::devices::{lock, InterruptSink};

/// Physical destination ID addressing every LAPIC.
pub const BROADCAST_ID: u8 = 0xFF;

/// Base of the MSI address window.
pub const MSI_ADDRESS_BASE: u64 = 0xFEE0_0000;

/// How the destination field is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DestinationMode {
    /// Destination is an APIC ID.
    Physical,
    /// Destination is a logical bitmask matched against each LDR.
    Logical,
}

/// Delivery mode field shared by ICR, IOAPIC entries and MSI data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryMode {
    Fixed,
    LowestPriority,
    Smi,
    Nmi,
    Init,
    Startup,
    ExtInt,
}

impl DeliveryMode {
    /// Decode a 3-bit delivery mode. Mode 3 is reserved.
    pub fn from_bits(bits: u32) -> Option<Self> {
        Some(match bits & 7 {
            0 => Self::Fixed,
            1 => Self::LowestPriority,
            2 => Self::Smi,
            4 => Self::Nmi,
            5 => Self::Init,
            6 => Self::Startup,
            7 => Self::ExtInt,
            _ => return None,
        })
    }

    pub fn bits(self) -> u32 {
        match self {
            Self::Fixed => 0,
            Self::LowestPriority => 1,
            Self::Smi => 2,
            Self::Nmi => 4,
            Self::Init => 5,
            Self::Startup => 6,
            Self::ExtInt => 7,
        }
    }
}

/// ICR destination shorthand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Shorthand {
    None,
    SelfOnly,
    All,
    AllExcludingSelf,
}

impl Shorthand {
    pub fn from_bits(bits: u32) -> Self {
        match bits & 3 {
            0 => Self::None,
            1 => Self::SelfOnly,
            2 => Self::All,
            _ => Self::AllExcludingSelf,
        }
    }
}

/// An interrupt travelling on the APIC bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApicMessage {
    pub vector: u8,
    pub delivery: DeliveryMode,
    pub dest_mode: DestinationMode,
    pub dest: u8,
    pub shorthand: Shorthand,
    /// APIC ID of the sender, for IPI shorthands.
    pub source: u8,
    pub level_triggered: bool,
    /// Level for INIT assert/deassert.
    pub assert: bool,
}

impl ApicMessage {
    /// A fixed, edge-triggered, physically addressed interrupt.
    pub fn fixed(dest: u8, vector: u8) -> Self {
        Self {
            vector,
            delivery: DeliveryMode::Fixed,
            dest_mode: DestinationMode::Physical,
            dest,
            shorthand: Shorthand::None,
            source: 0,
            level_triggered: false,
            assert: true,
        }
    }
}

/// A message-signaled interrupt as written by a PCI function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MsiMessage {
    pub address: u64,
    pub data: u32,
}

impl MsiMessage {
    pub fn new(address: u64, data: u32) -> Self {
        Self { address, data }
    }

    /// Decode into an APIC bus message. Addresses outside 0xFEEx_xxxx and
    /// reserved delivery modes are rejected.
    pub fn decode(&self) -> Option<ApicMessage> {
        if self.address & 0xFFF0_0000 != MSI_ADDRESS_BASE {
            return None;
        }
        let delivery = DeliveryMode::from_bits(self.data >> 8)?;
        Some(ApicMessage {
            vector: self.data as u8,
            delivery,
            dest_mode: if self.address & (1 << 2) != 0 {
                DestinationMode::Logical
            } else {
                DestinationMode::Physical
            },
            dest: (self.address >> 12) as u8,
            shorthand: Shorthand::None,
            source: 0,
            level_triggered: self.data & (1 << 15) != 0,
            assert: true,
        })
    }
}

/// Deliver `msg` to every matching LAPIC in `lapics`. Returns the number of
/// LAPICs that accepted it.
///
/// Lowest-priority messages go to the single matching LAPIC with the lowest
/// processor priority, lowest index on ties. Each LAPIC is locked on its own,
/// never two at once.
pub fn deliver_to_lapics(lapics: &[Arc<Mutex<LocalApic>>], msg: &ApicMessage) -> usize {
    if msg.delivery == DeliveryMode::LowestPriority && msg.shorthand == Shorthand::None {
        let target = lapics
            .iter()
            .filter_map(|lapic| {
                let apic = lock(lapic);
                apic.matches_destination(msg)
                    .then(|| (apic.processor_priority(), lapic))
            })
            .min_by_key(|&(priority, _)| priority);
        return match target {
            Some((_, lapic)) => {
                lock(lapic).accept(msg);
                1
            }
            None => {
                debug!("lowest-priority message to {:#x} matched no LAPIC", msg.dest);
                0
            }
        };
    }

    let mut delivered = 0;
    for lapic in lapics {
        let mut apic = lock(lapic);
        if apic.matches_destination(msg) {
            apic.accept(msg);
            delivered += 1;
        }
    }
    if delivered == 0 {
        debug!("APIC message {:?} matched no LAPIC", msg);
    }
    delivered
}

/// Routes device interrupts to the PIC, IOAPIC and LAPICs.
#[derive(Clone, Default)]
pub struct InterruptRouter {
    pic: Option<Arc<Mutex<PicController>>>,
    ioapic: Option<Arc<Mutex<IoApic>>>,
    lapics: Vec<Arc<Mutex<LocalApic>>>,
}

impl InterruptRouter {
    pub fn new(
        pic: Option<Arc<Mutex<PicController>>>,
        ioapic: Option<Arc<Mutex<IoApic>>>,
        lapics: Vec<Arc<Mutex<LocalApic>>>,
    ) -> Self {
        Self { pic, ioapic, lapics }
    }

    pub fn lapic(&self, vcpu: usize) -> Option<&Arc<Mutex<LocalApic>>> {
        self.lapics.get(vcpu)
    }

    pub fn lapics(&self) -> &[Arc<Mutex<LocalApic>>] {
        &self.lapics
    }

    /// Drive a legacy IRQ / GSI line on every controller that has it.
    pub fn route_irq(&self, irq: u32, level: bool) {
        if irq < 16 {
            if let Some(pic) = &self.pic {
                lock(pic).set_irq(irq as u8, level);
            }
        }
        if let Some(ioapic) = &self.ioapic {
            // ISA IRQ 0 is overridden onto GSI 2; IRQ 2 is the PIC cascade.
            let gsi = match irq {
                0 => 2,
                2 => return,
                n => n,
            };
            lock(ioapic).set_irq(gsi, level);
        }
    }

    /// Decode and deliver an MSI. Returns the number of LAPICs reached.
    pub fn route_msi(&self, msi: MsiMessage) -> usize {
        match msi.decode() {
            Some(msg) => self.deliver(&msg),
            None => {
                warn!(
                    "dropping malformed MSI address={:#x} data={:#x}",
                    msi.address, msi.data
                );
                0
            }
        }
    }

    /// Deliver an APIC bus message (IPI, IOAPIC or MSI originated).
    pub fn deliver(&self, msg: &ApicMessage) -> usize {
        deliver_to_lapics(&self.lapics, msg)
    }

    /// Forward a level-triggered EOI to the IOAPIC so it clears remote IRR.
    pub fn eoi_broadcast(&self, vector: u8) {
        if let Some(ioapic) = &self.ioapic {
            lock(ioapic).eoi(vector);
        }
    }

    /// Whether `vcpu` has an interrupt ready for injection.
    pub fn has_pending(&self, vcpu: usize) -> bool {
        self.pending_vector(vcpu).is_some()
    }

    /// The vector that [`acknowledge`](Self::acknowledge) would return.
    ///
    /// The LAPIC wins over the PIC; the PIC is only wired to vCPU 0.
    pub fn pending_vector(&self, vcpu: usize) -> Option<u8> {
        if let Some(vector) = self.lapic(vcpu).and_then(|l| lock(l).pending_vector()) {
            return Some(vector);
        }
        if vcpu == 0 {
            if let Some(pic) = &self.pic {
                return lock(pic).peek_vector();
            }
        }
        None
    }

    /// INTA: take the highest-priority pending interrupt for `vcpu`.
    pub fn acknowledge(&self, vcpu: usize) -> Option<u8> {
        if let Some(vector) = self.lapic(vcpu).and_then(|l| lock(l).acknowledge()) {
            return Some(vector);
        }
        if vcpu == 0 {
            if let Some(pic) = &self.pic {
                return lock(pic).get_vector();
            }
        }
        None
    }
}

impl InterruptSink for InterruptRouter {
    fn set_irq(&self, irq: u32, level: bool) {
        self.route_irq(irq, level);
    }

    fn send_msi(&self, msg: MsiMessage) {
        self.route_msi(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::lapic::regs as lapic_regs;
    use crate::devices::AccessWidth;

    fn enabled_lapic(id: u8) -> Arc<Mutex<LocalApic>> {
        let mut apic = LocalApic::new(id);
        apic.write_register(lapic_regs::SVR, 0x1FF);
        Arc::new(Mutex::new(apic))
    }

    fn router(cpus: u8) -> InterruptRouter {
        let lapics: Vec<_> = (0..cpus).map(enabled_lapic).collect();
        let pic = Arc::new(Mutex::new(PicController::new()));
        let targets = lapics.clone();
        let ioapic = Arc::new(Mutex::new(IoApic::new(Box::new(move |msg| {
            deliver_to_lapics(&targets, &msg);
        }))));
        InterruptRouter::new(Some(pic), Some(ioapic), lapics)
    }

    #[test]
    fn test_msi_decode() {
        let msg = MsiMessage::new(0xFEE0_1000, 0x0000_4041).decode().unwrap();
        assert_eq!(msg.dest, 1);
        assert_eq!(msg.vector, 0x41);
        assert_eq!(msg.delivery, DeliveryMode::Fixed);
        assert_eq!(msg.dest_mode, DestinationMode::Physical);
        assert!(!msg.level_triggered);

        let logical = MsiMessage::new(0xFEE0_3004, 0x0000_8130).decode().unwrap();
        assert_eq!(logical.dest_mode, DestinationMode::Logical);
        assert_eq!(logical.delivery, DeliveryMode::LowestPriority);
        assert!(logical.level_triggered);
    }

    #[test]
    fn test_msi_rejects_bad_address() {
        assert_eq!(MsiMessage::new(0xFED0_0000, 0x41).decode(), None);
        assert_eq!(MsiMessage::new(0xFEE0_0000, 0x300).decode(), None);
    }

    #[test]
    fn test_msi_reaches_target_lapic_only() {
        let r = router(2);
        assert_eq!(r.route_msi(MsiMessage::new(0xFEE0_1000, 0x51)), 1);
        assert_eq!(r.pending_vector(1), Some(0x51));
        assert_eq!(lock(&r.lapics()[0]).pending_vector(), None);
    }

    #[test]
    fn test_msi_broadcast() {
        let r = router(3);
        assert_eq!(r.route_msi(MsiMessage::new(0xFEEF_F000, 0x60)), 3);
        for cpu in 0..3 {
            assert_eq!(r.acknowledge(cpu), Some(0x60));
        }
    }

    #[test]
    fn test_lowest_priority_picks_idle_cpu() {
        let r = router(2);
        // CPU 0 is busy at TPR 0x80.
        lock(&r.lapics()[0]).write_register(lapic_regs::TPR, 0x80);
        // Logical flat: both CPUs in group 0x3.
        for (i, lapic) in r.lapics().iter().enumerate() {
            let mut apic = lock(lapic);
            apic.write_register(lapic_regs::DFR, 0xFFFF_FFFF);
            apic.write_register(lapic_regs::LDR, 1 << (24 + i));
        }
        let delivered = r.route_msi(MsiMessage::new(0xFEE0_3004, 0x0000_0145));
        assert_eq!(delivered, 1);
        assert_eq!(r.pending_vector(1), Some(0x45));
    }

    #[test]
    fn test_legacy_irq_reaches_pic_for_vcpu0() {
        let r = router(1);
        {
            let pic = r.pic.as_ref().unwrap();
            let mut pic = lock(pic);
            use crate::devices::Device;
            for (port, value) in [(0x20, 0x11), (0x21, 0x20), (0x21, 0x04), (0x21, 0x01), (0x21, 0x00)] {
                pic.io_write(port, AccessWidth::Byte, value);
            }
        }
        r.set_irq(1, true);
        assert_eq!(r.pending_vector(0), Some(0x21));
        assert_eq!(r.acknowledge(0), Some(0x21));
        assert_eq!(r.pending_vector(0), None);
    }

    #[test]
    fn test_irq_routes_through_ioapic() {
        let r = router(1);
        {
            use crate::devices::Device;
            let mut ioapic = lock(r.ioapic.as_ref().unwrap());
            // GSI 2 (ISA IRQ 0) → vector 0x30, unmasked, dest 0.
            ioapic.mmio_write(0x00, AccessWidth::Dword, 0x14);
            ioapic.mmio_write(0x10, AccessWidth::Dword, 0x30);
        }
        r.route_irq(0, true);
        assert_eq!(lock(&r.lapics()[0]).pending_vector(), Some(0x30));
    }

    #[test]
    fn test_isa_irq2_does_not_reach_gsi2() {
        let r = router(1);
        {
            use crate::devices::Device;
            let mut ioapic = lock(r.ioapic.as_ref().unwrap());
            ioapic.mmio_write(0x00, AccessWidth::Dword, 0x14);
            ioapic.mmio_write(0x10, AccessWidth::Dword, 0x30);
        }
        r.route_irq(2, true);
        assert_eq!(lock(&r.lapics()[0]).pending_vector(), None);
    }
}
