//! carbon-platform: the PC platform device model of the carbon hypervisor.
//!
//! Legacy chipset, APIC complex, PCI functions and the fault-recovery layer
//! that keeps one misbehaving device or vCPU from taking the VM down. A VCPU
//! trap source drives everything through [`platform::Platform`].

pub mod devices;
pub mod interrupts;
pub mod memory;
pub mod pci;
pub mod platform;
pub mod recovery;
pub mod trace;
