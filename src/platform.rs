//! One VM's complete device model.
//!
//! [`Platform`] builds the chipset, the APIC complex and the PCI functions
//! from a [`PlatformConfig`], registers them on a [`DeviceBus`], and is the
//! single entry point for a VCPU trap source:
//!
//! ```text
//! port I/O   ──► handle_io   ──► DeviceBus ──► PIC, PIT, RTC, 8042, UART, DMA, PM, PCI host
//! MMIO       ──► handle_mmio ──► LAPIC of the trapping vCPU
//!                                └► DeviceBus ──► IOAPIC, HPET, TPM, PCI BARs, VGA window
//! scheduler  ──► tick / tick_second
//! exception  ──► handle_exception ──► ExceptionHandler ──► SafeStateTransition
//! ```
//!
//! # Interrupt wiring
//!
//! | Source       | ISA IRQ | PCI address |
//! |--------------|---------|-------------|
//! | PIT ch0      | 0 (GSI 2) | |
//! | keyboard     | 1  | |
//! | COM1         | 4  | |
//! | RTC          | 8  | |
//! | ACPI SCI     | 9  | |
//! | virtio-blk   | 10 | 00:05.0 |
//! | virtio-net   | 11 | 00:04.0 |
//! | mouse        | 12 | |
//! | AHCI         | 14 | 00:1f.2 |
//! | e1000        | 15 | 00:03.0 |
//! | Bochs VGA    |    | 00:02.0 |

use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::devices::acpi::{self, AcpiPm};
use crate::devices::ahci::Ahci;
use crate::devices::bochs::{BochsDisplay, VBE_INDEX_PORT};
use crate::devices::disk::{open_image, DiskBackend};
use crate::devices::dma::{self, Dma};
use crate::devices::e1000::E1000;
use crate::devices::hpet::{Hpet, HPET_BASE, HPET_SIZE};
use crate::devices::ioapic::{IoApic, IOAPIC_BASE, IOAPIC_SIZE};
use crate::devices::lapic::{LapicEvent, LocalApic, LAPIC_BASE, LAPIC_SIZE};
use crate::devices::pic::{self, PicController};
use crate::devices::pit::{self, Pit};
use crate::devices::ps2::{Ps2Controller, PS2_DATA, PS2_STATUS};
use crate::devices::rtc::{Rtc, RtcTime, RTC_PORT_INDEX};
use crate::devices::serial::{Serial, COM1_BASE};
use crate::devices::system::{SystemPorts, PORT_A, POST_PORT};
use crate::devices::tpm::{Tpm, TPM_BASE, TPM_SIZE};
use crate::devices::vga::{VGA_MEMORY_BASE, VGA_MEMORY_SIZE, VGA_PORT_BASE, VGA_PORT_LEN};
use crate::devices::virtio::blk::VirtioBlk;
use crate::devices::virtio::net::VirtioNet;
use crate::devices::{
    lock, BusError, Device, DeviceBus, DeviceSnapshot, InterruptSink, IoRequest, IrqLine, MmioRequest,
    PowerCallback, PowerEvent, RequestKind, SharedDevice, SnapshotError,
};
use crate::interrupts::{deliver_to_lapics, InterruptRouter};
use crate::memory::{GuestMemory, MemoryError};
use crate::pci::config::{
    Bdf, PciConfigSpace, SharedPciFunction, CONFIG_ADDRESS_PORT, CONFIG_PORTS_LEN, PCI_IO_BASE,
    PCI_IO_LEN, PCI_MMIO_BASE, PCI_MMIO_END,
};
use crate::pci::PciError;
use crate::recovery::{
    CycleCounter, ErrorContext, ExceptionHandler, ExceptionInfo, FaultIsolation, MonotonicCycles,
    RecoveryAction, SafeStateTransition, StateValidator, VmState, WatchdogTimer,
};

/// PIT input clock in Hz; the unit of [`Platform::tick`].
pub const PIT_HZ: u64 = 1_193_182;

/// ACPI PM timer clocks per PIT clock (3.579545 MHz).
const PM_TIMER_RATIO: u64 = 3;
/// HPET counter ticks per PIT clock (10 ns period).
const HPET_RATIO: u64 = 84;
/// LAPIC bus clocks per PIT clock.
const LAPIC_RATIO: u64 = 84;

const IRQ_KEYBOARD: u32 = 1;
const IRQ_COM1: u32 = 4;
const IRQ_RTC: u32 = 8;
const IRQ_SCI: u32 = 9;
const IRQ_VIRTIO_BLK: u32 = 10;
const IRQ_VIRTIO_NET: u32 = 11;
const IRQ_MOUSE: u32 = 12;
const IRQ_AHCI: u32 = 14;
const IRQ_E1000: u32 = 15;

const MAX_VCPUS: usize = 255;
const MAX_VRAM_MB: usize = 256;
const MAX_HPET_TIMERS: usize = 32;

/// Rejected [`PlatformConfig`] values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("At least one vCPU is required")]
    NoVcpus,

    #[error("{0} vCPUs requested, at most 255 are addressable")]
    TooManyVcpus(usize),

    #[error("Guest memory size must be non-zero")]
    NoMemory,

    #[error("Guest memory of {0} MiB overlaps the PCI hole")]
    MemoryTooLarge(u64),

    #[error("Invalid MAC address: {0}")]
    InvalidMac(String),

    #[error("Display memory must be 1-256 MiB, got {0}")]
    InvalidVram(usize),

    #[error("HPET must have 1-32 timers, got {0}")]
    InvalidHpetTimers(usize),

    #[error("Fault isolation threshold must be non-zero")]
    ZeroFaultThreshold,

    #[error("Error log capacity must be non-zero")]
    ZeroLogCapacity,
}

/// Platform construction and state-transfer failures.
#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Guest memory setup failed: {0}")]
    Memory(#[from] MemoryError),

    #[error("Failed to register device: {0}")]
    Bus(#[from] BusError),

    #[error("Failed to set up PCI: {0}")]
    Pci(#[from] PciError),

    #[error("Device state transfer failed: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Failed to open disk image {path}: {source}")]
    Disk {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Parse `aa:bb:cc:dd:ee:ff`.
pub fn parse_mac(s: &str) -> Result<[u8; 6], ConfigError> {
    let invalid = || ConfigError::InvalidMac(s.to_string());
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for byte in mac.iter_mut() {
        let part = parts.next().ok_or_else(invalid)?;
        if part.len() != 2 {
            return Err(invalid());
        }
        *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
    }
    if parts.next().is_some() {
        return Err(invalid());
    }
    Ok(mac)
}

/// Shape of the emulated machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformConfig {
    /// Number of vCPUs, one LAPIC each.
    pub vcpus: usize,
    pub memory_mb: u64,
    /// Raw disk image for virtio-blk and AHCI port 0.
    pub disk: Option<PathBuf>,
    pub mac: [u8; 6],
    pub vram_mb: usize,
    pub hpet_timers: usize,
    /// Initial RTC time in UNIX seconds; the host clock when unset.
    pub rtc_epoch: Option<u64>,
    pub fault_threshold: u32,
    pub error_log_capacity: usize,
    /// Per-vCPU watchdog deadline in cycles. Zero disables the watchdog.
    pub watchdog_cycles: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            vcpus: 1,
            memory_mb: 64,
            disk: None,
            mac: [0x52, 0x54, 0x00, 0x12, 0x34, 0x56],
            vram_mb: 16,
            hpet_timers: 3,
            rtc_epoch: None,
            fault_threshold: 8,
            error_log_capacity: 64,
            watchdog_cycles: 0,
        }
    }
}

impl PlatformConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vcpus == 0 {
            return Err(ConfigError::NoVcpus);
        }
        if self.vcpus > MAX_VCPUS {
            return Err(ConfigError::TooManyVcpus(self.vcpus));
        }
        if self.memory_mb == 0 {
            return Err(ConfigError::NoMemory);
        }
        if self.memory_mb > PCI_MMIO_BASE >> 20 {
            return Err(ConfigError::MemoryTooLarge(self.memory_mb));
        }
        if self.mac[0] & 1 != 0 {
            return Err(ConfigError::InvalidMac(format_mac(&self.mac)));
        }
        if self.vram_mb == 0 || self.vram_mb > MAX_VRAM_MB {
            return Err(ConfigError::InvalidVram(self.vram_mb));
        }
        if self.hpet_timers == 0 || self.hpet_timers > MAX_HPET_TIMERS {
            return Err(ConfigError::InvalidHpetTimers(self.hpet_timers));
        }
        if self.fault_threshold == 0 {
            return Err(ConfigError::ZeroFaultThreshold);
        }
        if self.error_log_capacity == 0 {
            return Err(ConfigError::ZeroLogCapacity);
        }
        Ok(())
    }
}

pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Architectural state of every device in the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformSnapshot {
    pub devices: Vec<DeviceSnapshot>,
}

impl PlatformSnapshot {
    fn find(&self, name: &str) -> Result<&DeviceSnapshot, SnapshotError> {
        self.devices
            .iter()
            .find(|s| s.device == name)
            .ok_or_else(|| SnapshotError::Malformed(format!("no state for {}", name)))
    }
}

/// A fully wired PC platform.
pub struct Platform {
    config: PlatformConfig,
    memory: Arc<GuestMemory>,
    bus: DeviceBus,
    router: Arc<InterruptRouter>,
    isolation: Arc<FaultIsolation>,

    pit: Arc<Mutex<Pit>>,
    rtc: Arc<Mutex<Rtc>>,
    ps2: Arc<Mutex<Ps2Controller>>,
    serial: Arc<Mutex<Serial>>,
    acpi: Arc<Mutex<AcpiPm>>,
    system: Arc<Mutex<SystemPorts>>,
    hpet: Arc<Mutex<Hpet>>,
    tpm: Arc<Mutex<Tpm>>,
    pci: Arc<Mutex<PciConfigSpace>>,
    virtio_blk: Arc<Mutex<VirtioBlk>>,
    virtio_net: Arc<Mutex<VirtioNet>>,
    ahci: Arc<Mutex<Ahci>>,
    e1000: Arc<Mutex<E1000>>,
    bochs: Arc<Mutex<BochsDisplay>>,
    /// Everything reset and snapshotted through the `Device` interface, except
    /// PCI functions and LAPICs.
    devices: Vec<SharedDevice>,

    exceptions: ExceptionHandler,
    lifecycle: SafeStateTransition,
    watchdog: WatchdogTimer,
    power_queue: Arc<Mutex<VecDeque<PowerEvent>>>,
    power_log: Vec<PowerEvent>,
    /// PIT clocks since the last RTC periodic interrupt.
    rtc_phase: u64,
}

impl Platform {
    /// Build a platform timed by the host cycle counter.
    pub fn new(config: PlatformConfig) -> Result<Self, PlatformError> {
        Self::with_clock(config, Arc::new(MonotonicCycles::new()))
    }

    /// Build a platform whose watchdog and error log use `clock`.
    pub fn with_clock(
        config: PlatformConfig,
        clock: Arc<dyn CycleCounter>,
    ) -> Result<Self, PlatformError> {
        config.validate()?;
        let disks = match &config.disk {
            Some(path) => Some(open_disks(path)?),
            None => None,
        };
        Self::build(config, clock, disks)
    }

    fn build(
        config: PlatformConfig,
        clock: Arc<dyn CycleCounter>,
        disks: Option<(File, File)>,
    ) -> Result<Self, PlatformError> {
        let memory = Arc::new(GuestMemory::new(config.memory_mb << 20)?);
        let isolation = Arc::new(FaultIsolation::new(config.fault_threshold));

        // APIC complex.
        let lapics: Vec<_> = (0..config.vcpus)
            .map(|id| Arc::new(Mutex::new(LocalApic::new(id as u8))))
            .collect();
        let targets = lapics.clone();
        let ioapic = Arc::new(Mutex::new(IoApic::new(Box::new(move |msg| {
            deliver_to_lapics(&targets, &msg);
        }))));
        let pic = Arc::new(Mutex::new(PicController::new()));
        let router = Arc::new(InterruptRouter::new(
            Some(pic.clone()),
            Some(ioapic.clone()),
            lapics,
        ));
        let sink: Arc<dyn InterruptSink> = router.clone();
        let line = |irq: u32| IrqLine::new(irq, sink.clone());

        let power_queue = Arc::new(Mutex::new(VecDeque::new()));
        let queue = power_queue.clone();
        let power: PowerCallback = Arc::new(move |event| lock(&queue).push_back(event));

        // Legacy chipset.
        let pit = Arc::new(Mutex::new(Pit::new(line(0))));
        let epoch = config.rtc_epoch.unwrap_or_else(host_time);
        let mut rtc = Rtc::new(RtcTime::from_unix(epoch), line(IRQ_RTC));
        rtc.set_memory_size(memory.size());
        let rtc = Arc::new(Mutex::new(rtc));
        let mut ps2 = Ps2Controller::new(line(IRQ_KEYBOARD), line(IRQ_MOUSE));
        ps2.set_power_callback(power.clone());
        let ps2 = Arc::new(Mutex::new(ps2));
        let serial = Arc::new(Mutex::new(Serial::new(COM1_BASE, line(IRQ_COM1))));
        let dma = Arc::new(Mutex::new(Dma::new()));
        let mut system = SystemPorts::new();
        system.set_power_callback(power.clone());
        let system = Arc::new(Mutex::new(system));
        let mut acpi = AcpiPm::new(line(IRQ_SCI));
        acpi.set_power_callback(power.clone());
        let acpi = Arc::new(Mutex::new(acpi));

        let hpet = Arc::new(Mutex::new(Hpet::new(config.hpet_timers, Some(sink.clone()))));
        let tpm = Arc::new(Mutex::new(Tpm::new()));

        // PCI functions.
        let (blk_disk, ahci_disk) = match disks {
            Some((a, b)) => (
                Some(Box::new(a) as Box<dyn DiskBackend>),
                Some(Box::new(b) as Box<dyn DiskBackend>),
            ),
            None => (None, None),
        };

        let mut blk = VirtioBlk::new(blk_disk);
        blk.set_memory(memory.clone());
        blk.set_interrupt(line(IRQ_VIRTIO_BLK));
        let virtio_blk = Arc::new(Mutex::new(blk));

        let mut net = VirtioNet::new(config.mac);
        net.set_memory(memory.clone());
        net.set_interrupt(line(IRQ_VIRTIO_NET));
        let virtio_net = Arc::new(Mutex::new(net));

        let mut sata = Ahci::new();
        sata.set_memory(memory.clone());
        sata.set_interrupt(line(IRQ_AHCI));
        if let Some(disk) = ahci_disk {
            sata.attach_disk(0, disk);
        }
        let ahci = Arc::new(Mutex::new(sata));

        let mut nic = E1000::new(config.mac);
        nic.set_memory(memory.clone());
        nic.set_interrupt(line(IRQ_E1000));
        let e1000 = Arc::new(Mutex::new(nic));

        let bochs = Arc::new(Mutex::new(BochsDisplay::new(config.vram_mb << 20)));

        let mut host = PciConfigSpace::with_host_bridge();
        host.set_isolation(isolation.clone());
        host.set_power_callback(power);
        let functions: [(Bdf, SharedPciFunction); 5] = [
            (Bdf::new(0, 2, 0)?, bochs.clone()),
            (Bdf::new(0, 3, 0)?, e1000.clone()),
            (Bdf::new(0, 4, 0)?, virtio_net.clone()),
            (Bdf::new(0, 5, 0)?, virtio_blk.clone()),
            (Bdf::new(0, 0x1F, 2)?, ahci.clone()),
        ];
        for (bdf, function) in functions {
            host.register(bdf, function)?;
        }
        host.assign_bars()?;
        let pci = Arc::new(Mutex::new(host));

        // Address map.
        let mut bus = DeviceBus::with_isolation(isolation.clone());
        bus.register_io(pic::MASTER_CMD, 2, pic.clone())?;
        bus.register_io(pic::SLAVE_CMD, 2, pic.clone())?;
        bus.register_io(pic::ELCR_MASTER, 2, pic.clone())?;
        bus.register_io(pit::CHANNEL0, 4, pit.clone())?;
        bus.register_io(pit::PORT_B, 1, pit.clone())?;
        bus.register_io(RTC_PORT_INDEX, 2, rtc.clone())?;
        bus.register_io(PS2_DATA, 1, ps2.clone())?;
        bus.register_io(PS2_STATUS, 1, ps2.clone())?;
        bus.register_io(COM1_BASE, 8, serial.clone())?;
        bus.register_io(dma::DMA1_BASE, 16, dma.clone())?;
        bus.register_io(dma::PAGE_BASE + 1, 15, dma.clone())?;
        bus.register_io(dma::DMA2_BASE, 32, dma.clone())?;
        bus.register_io(POST_PORT, 1, system.clone())?;
        bus.register_io(PORT_A, 1, system.clone())?;
        bus.register_io(acpi::PM_BASE, acpi::PM_LEN, acpi.clone())?;
        bus.register_io(acpi::SMI_CMD_PORT, 1, acpi.clone())?;
        bus.register_io(CONFIG_ADDRESS_PORT, CONFIG_PORTS_LEN, pci.clone())?;
        bus.register_io(PCI_IO_BASE, PCI_IO_LEN, pci.clone())?;
        bus.register_io(VBE_INDEX_PORT, 2, bochs.clone())?;
        bus.register_io(VGA_PORT_BASE, VGA_PORT_LEN, bochs.clone())?;
        bus.register_mmio(VGA_MEMORY_BASE, VGA_MEMORY_SIZE, bochs.clone())?;
        bus.register_mmio(PCI_MMIO_BASE, PCI_MMIO_END - PCI_MMIO_BASE, pci.clone())?;
        bus.register_mmio(IOAPIC_BASE, IOAPIC_SIZE, ioapic.clone())?;
        bus.register_mmio(HPET_BASE, HPET_SIZE, hpet.clone())?;
        bus.register_mmio(TPM_BASE, TPM_SIZE, tpm.clone())?;

        let devices: Vec<SharedDevice> = vec![
            pic,
            pit.clone(),
            rtc.clone(),
            ps2.clone(),
            serial.clone(),
            dma,
            system.clone(),
            acpi.clone(),
            ioapic,
            hpet.clone(),
            tpm.clone(),
            pci.clone(),
        ];

        info!(
            "platform ready: {} vCPU(s), {} MiB, {} bus ranges",
            config.vcpus,
            config.memory_mb,
            bus.ranges().len()
        );

        Ok(Self {
            exceptions: ExceptionHandler::new(clock.clone(), config.error_log_capacity),
            lifecycle: SafeStateTransition::new(),
            watchdog: WatchdogTimer::new(clock),
            config,
            memory,
            bus,
            router,
            isolation,
            pit,
            rtc,
            ps2,
            serial,
            acpi,
            system,
            hpet,
            tpm,
            pci,
            virtio_blk,
            virtio_net,
            ahci,
            e1000,
            bochs,
            devices,
            power_queue,
            power_log: Vec::new(),
            rtc_phase: 0,
        })
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    pub fn memory(&self) -> &Arc<GuestMemory> {
        &self.memory
    }

    pub fn bus(&self) -> &DeviceBus {
        &self.bus
    }

    pub fn router(&self) -> &Arc<InterruptRouter> {
        &self.router
    }

    pub fn isolation(&self) -> &Arc<FaultIsolation> {
        &self.isolation
    }

    pub fn rtc(&self) -> &Arc<Mutex<Rtc>> {
        &self.rtc
    }

    pub fn ps2(&self) -> &Arc<Mutex<Ps2Controller>> {
        &self.ps2
    }

    pub fn serial(&self) -> &Arc<Mutex<Serial>> {
        &self.serial
    }

    pub fn acpi(&self) -> &Arc<Mutex<AcpiPm>> {
        &self.acpi
    }

    pub fn system(&self) -> &Arc<Mutex<SystemPorts>> {
        &self.system
    }

    pub fn hpet(&self) -> &Arc<Mutex<Hpet>> {
        &self.hpet
    }

    pub fn tpm(&self) -> &Arc<Mutex<Tpm>> {
        &self.tpm
    }

    pub fn pci(&self) -> &Arc<Mutex<PciConfigSpace>> {
        &self.pci
    }

    pub fn virtio_blk(&self) -> &Arc<Mutex<VirtioBlk>> {
        &self.virtio_blk
    }

    pub fn virtio_net(&self) -> &Arc<Mutex<VirtioNet>> {
        &self.virtio_net
    }

    pub fn ahci(&self) -> &Arc<Mutex<Ahci>> {
        &self.ahci
    }

    pub fn e1000(&self) -> &Arc<Mutex<E1000>> {
        &self.e1000
    }

    pub fn bochs(&self) -> &Arc<Mutex<BochsDisplay>> {
        &self.bochs
    }

    // Lifecycle.

    pub fn state(&self) -> VmState {
        self.lifecycle.state()
    }

    /// Request a lifecycle transition; illegal or vetoed ones return false.
    pub fn transition(&mut self, to: VmState) -> bool {
        self.lifecycle.transition(to)
    }

    pub fn lifecycle_mut(&mut self) -> &mut SafeStateTransition {
        &mut self.lifecycle
    }

    /// Enter `running` and arm the per-vCPU watchdogs.
    pub fn start(&mut self) -> bool {
        if !self.lifecycle.transition(VmState::Running) {
            return false;
        }
        if self.config.watchdog_cycles > 0 {
            for vcpu in 0..self.config.vcpus as u32 {
                self.watchdog.arm(vcpu, self.config.watchdog_cycles);
            }
        }
        true
    }

    // Trap dispatch.

    /// Port access from `vcpu`. Returns the value for reads.
    pub fn handle_io(&mut self, vcpu: usize, req: &IoRequest) -> Option<u32> {
        self.watchdog.kick(vcpu as u32);
        let result = self.bus.handle_io(req);
        self.process_power_events();
        result
    }

    /// Memory access from `vcpu`. The LAPIC window resolves to that vCPU's
    /// own LAPIC.
    pub fn handle_mmio(&mut self, vcpu: usize, req: &MmioRequest) -> Option<u32> {
        self.watchdog.kick(vcpu as u32);
        let result = if (LAPIC_BASE..LAPIC_BASE + LAPIC_SIZE).contains(&req.addr) {
            self.lapic_access(vcpu, req)
        } else {
            self.bus.handle_mmio(req)
        };
        self.process_power_events();
        result
    }

    fn lapic_access(&self, vcpu: usize, req: &MmioRequest) -> Option<u32> {
        let Some(lapic) = self.router.lapic(vcpu) else {
            return match req.kind {
                RequestKind::Read => Some(req.width.mask()),
                RequestKind::Write(_) => None,
            };
        };
        let offset = req.addr - LAPIC_BASE;
        let (result, events) = {
            let mut apic = lock(lapic);
            let result = match req.kind {
                RequestKind::Read => Some(apic.mmio_read(offset, req.width)),
                RequestKind::Write(value) => {
                    apic.mmio_write(offset, req.width, value);
                    None
                }
            };
            (result, apic.take_events())
        };
        for event in events {
            match event {
                LapicEvent::Ipi(msg) => {
                    self.router.deliver(&msg);
                }
                LapicEvent::Eoi(vector) => self.router.eoi_broadcast(vector),
            }
        }
        result
    }

    /// Interrupt vector ready for `vcpu`, without acknowledging it.
    pub fn pending_vector(&self, vcpu: usize) -> Option<u8> {
        self.router.pending_vector(vcpu)
    }

    /// INTA cycle for `vcpu`.
    pub fn acknowledge_interrupt(&self, vcpu: usize) -> Option<u8> {
        self.router.acknowledge(vcpu)
    }

    // Time.

    /// Advance every timer by `clocks` PIT input clocks. Returns the number
    /// of PIT channel 0 interrupts.
    pub fn tick(&mut self, clocks: u64) -> u32 {
        let fired = lock(&self.pit).advance(clocks);
        lock(&self.acpi).advance_timer(clocks * PM_TIMER_RATIO);
        lock(&self.hpet).tick(clocks * HPET_RATIO);
        for lapic in self.router.lapics() {
            lock(lapic).tick(clocks * LAPIC_RATIO);
        }

        let frequency = lock(&self.rtc).periodic_frequency();
        match frequency {
            Some(hz) => {
                let period = (PIT_HZ / hz as u64).max(1);
                self.rtc_phase += clocks;
                let periods = self.rtc_phase / period;
                self.rtc_phase %= period;
                if periods > 0 {
                    lock(&self.rtc).tick_periodic();
                }
            }
            None => self.rtc_phase = 0,
        }
        fired
    }

    /// One RTC update cycle.
    pub fn tick_second(&mut self) {
        lock(&self.rtc).tick_second();
    }

    // Recovery.

    /// Classify a VCPU exception and apply its recovery action.
    pub fn handle_exception(&mut self, info: ExceptionInfo) -> ErrorContext {
        let ctx = self.exceptions.handle_exception(info);
        match ctx.action {
            RecoveryAction::Ignore | RecoveryAction::Retry | RecoveryAction::InjectGuest => {}
            RecoveryAction::ResetDevice => self.reset_isolated_devices(),
            RecoveryAction::ResetVcpu => {
                // Restarting the vCPU needs a sane page-table root.
                match StateValidator::validate_cr3_in(info.cr3, self.memory.size()) {
                    Ok(()) => self.reset_vcpu(info.vcpu as usize),
                    Err(e) => {
                        warn!("vCPU {} not restartable: {}", info.vcpu, e);
                        self.lifecycle.transition(VmState::Paused);
                    }
                }
            }
            RecoveryAction::ResetVm => {
                if self.lifecycle.transition(VmState::Stopped) {
                    self.reset_or_fault();
                    self.start();
                }
            }
            RecoveryAction::PauseVm => {
                self.lifecycle.transition(VmState::Paused);
            }
            RecoveryAction::Shutdown => {
                self.lifecycle.transition(VmState::Faulted);
            }
        }
        ctx
    }

    pub fn exception_handler(&self) -> &ExceptionHandler {
        &self.exceptions
    }

    /// Register custom per-vector policies here.
    pub fn exception_handler_mut(&mut self) -> &mut ExceptionHandler {
        &mut self.exceptions
    }

    /// Oldest-first view of the bounded error log.
    pub fn error_log(&self) -> impl Iterator<Item = &ErrorContext> {
        self.exceptions.error_log()
    }

    /// Poll every armed watchdog. A running VM with an expired vCPU faults.
    pub fn poll_watchdog(&mut self) -> Vec<u32> {
        let expired = self.watchdog.check_all();
        if !expired.is_empty() && self.state() == VmState::Running {
            warn!("vCPU(s) {:?} stopped making progress", expired);
            self.lifecycle.transition(VmState::Faulted);
        }
        expired
    }

    fn reset_vcpu(&mut self, vcpu: usize) {
        if let Some(lapic) = self.router.lapic(vcpu) {
            info!("resetting vCPU {}", vcpu);
            lock(lapic).reset();
        }
        self.watchdog.kick(vcpu as u32);
    }

    fn reset_isolated_devices(&mut self) {
        let isolated = self.isolation.isolated_devices();
        for device in &self.devices {
            let mut device = lock(device);
            if isolated.iter().any(|name| name == device.name()) {
                info!("resetting isolated device {}", device.name());
                device.reset();
            }
        }
        for function in self.pci_functions() {
            let mut function = lock(&function);
            if isolated.iter().any(|name| name == function.name()) {
                info!("resetting isolated device {}", function.name());
                function.reset();
            }
        }
    }

    // Power.

    fn process_power_events(&mut self) {
        loop {
            let Some(event) = lock(&self.power_queue).pop_front() else {
                return;
            };
            info!("power event {:?}", event);
            match event {
                PowerEvent::Shutdown => {
                    self.lifecycle.transition(VmState::Stopped);
                }
                PowerEvent::Sleep(_) => {}
                PowerEvent::HardReset => self.reset_or_fault(),
                PowerEvent::SoftReset => {
                    for vcpu in 0..self.config.vcpus {
                        self.reset_vcpu(vcpu);
                    }
                }
            }
            self.power_log.push(event);
        }
    }

    /// Power events applied since the last call, oldest first.
    pub fn take_power_events(&mut self) -> Vec<PowerEvent> {
        std::mem::take(&mut self.power_log)
    }

    /// Host power button.
    pub fn press_power_button(&mut self) {
        lock(&self.acpi).press_power_button();
    }

    // Whole-platform operations.

    /// Power-on reset of every device, then firmware-style BAR assignment.
    /// Host attachments survive. The lifecycle state is unchanged.
    pub fn reset(&mut self) -> Result<(), PlatformError> {
        info!("platform reset");
        for device in &self.devices {
            lock(device).reset();
        }
        for lapic in self.router.lapics() {
            lock(lapic).reset();
        }
        lock(&self.pci).assign_bars()?;
        self.rtc_phase = 0;
        Ok(())
    }

    fn reset_or_fault(&mut self) {
        if let Err(e) = self.reset() {
            error!("platform reset failed: {}", e);
            self.lifecycle.transition(VmState::Faulted);
        }
    }

    fn pci_functions(&self) -> Vec<SharedPciFunction> {
        lock(&self.pci).functions().map(|(_, f)| f.clone()).collect()
    }

    pub fn snapshot(&self) -> Result<PlatformSnapshot, PlatformError> {
        let mut devices = Vec::new();
        for device in &self.devices {
            devices.push(lock(device).snapshot()?);
        }
        for lapic in self.router.lapics() {
            devices.push(lock(lapic).snapshot()?);
        }
        for function in self.pci_functions() {
            devices.push(lock(&function).snapshot()?);
        }
        Ok(PlatformSnapshot { devices })
    }

    /// Restore every device. A snapshot missing any device is rejected
    /// before anything is modified.
    pub fn restore(&mut self, snapshot: &PlatformSnapshot) -> Result<(), PlatformError> {
        let functions = self.pci_functions();
        let mut names: Vec<String> = self
            .devices
            .iter()
            .map(|d| lock(d).name().to_string())
            .collect();
        names.extend(self.router.lapics().iter().map(|l| lock(l).name().to_string()));
        names.extend(functions.iter().map(|f| lock(f).name().to_string()));
        for name in &names {
            snapshot.find(name)?;
        }

        for device in &self.devices {
            let mut device = lock(device);
            let state = snapshot.find(device.name())?;
            device.restore(state)?;
        }
        for lapic in self.router.lapics() {
            let mut apic = lock(lapic);
            let state = snapshot.find(apic.name())?;
            apic.restore(state)?;
        }
        for function in &functions {
            let mut function = lock(function);
            let state = snapshot.find(function.name())?;
            function.restore(state)?;
        }
        self.rtc_phase = 0;
        info!("restored {} devices", snapshot.devices.len());
        Ok(())
    }
}

fn open_disks(path: &Path) -> Result<(File, File), PlatformError> {
    let wrap = |source| PlatformError::Disk {
        path: path.to_path_buf(),
        source,
    };
    let file = open_image(path).map_err(wrap)?;
    let clone = file.try_clone().map_err(wrap)?;
    Ok((file, clone))
}

fn host_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
