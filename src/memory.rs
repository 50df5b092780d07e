//! Guest physical memory access for device models.
//!
//! Devices never see host pointers. Everything that touches guest RAM (virtqueue
//! walks, AHCI command tables, e1000 descriptor rings, DMA transfers) goes through
//! this thin wrapper around `vm_memory::GuestMemoryMmap`, the standard
//! abstraction used across the rust-vmm ecosystem.
//!
//! # Access Primitives
//!
//! ```text
//! peek/poke    read_u8/u16/u32, write_u8/u16/u32   (little-endian)
//! bulk copy    read(addr, &mut buf), write(addr, &buf)
//! bulk set     fill(addr, len, byte)
//! ```
//!
//! The region starts at guest physical address 0 and is a single contiguous
//! mapping. Out-of-range accesses fail with [`MemoryError::OutOfBounds`]; device
//! models treat that as a guest protocol error (bad descriptor) and never panic.
//!
//! # Usage
//!
//! ```ignore
//! let memory = GuestMemory::new(64 * 1024 * 1024)?;
//! memory.write_u32(0x1000, 0xDEAD_BEEF)?;
//! assert_eq!(memory.read_u32(0x1000)?, 0xDEAD_BEEF);
//! ```

use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

/// Errors raised by guest memory accesses.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// The mmap backing could not be created.
    #[error("Failed to allocate guest memory: {0}")]
    Allocation(String),

    /// Access outside the guest physical address space.
    #[error("Guest memory access out of bounds: {len} bytes at {addr:#x}")]
    OutOfBounds { addr: u64, len: usize },
}

/// Guest physical memory region backed by vm-memory.
///
/// Cloning the inner `GuestMemoryMmap` only bumps region reference counts, but
/// device models share the wrapper through an `Arc` so there is exactly one
/// owner per VM.
pub struct GuestMemory {
    /// The underlying vm-memory guest memory.
    inner: GuestMemoryMmap,
    /// Size of the memory region in bytes.
    size: u64,
}

impl GuestMemory {
    /// Allocate a zero-filled region of `size` bytes at guest address 0.
    pub fn new(size: u64) -> Result<Self, MemoryError> {
        let regions = vec![(GuestAddress(0), size as usize)];

        let inner = GuestMemoryMmap::from_ranges(&regions)
            .map_err(|e| MemoryError::Allocation(e.to_string()))?;

        Ok(Self { inner, size })
    }

    /// Size of guest RAM in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bulk copy from guest memory into `data`.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), MemoryError> {
        self.inner
            .read_slice(data, GuestAddress(addr))
            .map_err(|_| MemoryError::OutOfBounds {
                addr,
                len: data.len(),
            })
    }

    /// Bulk copy `data` into guest memory.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.inner
            .write_slice(data, GuestAddress(addr))
            .map_err(|_| MemoryError::OutOfBounds {
                addr,
                len: data.len(),
            })
    }

    /// Bulk set `len` bytes starting at `addr` to `value`.
    pub fn fill(&self, addr: u64, len: usize, value: u8) -> Result<(), MemoryError> {
        const CHUNK: usize = 4096;
        let chunk = [value; CHUNK];
        let mut done = 0;
        while done < len {
            let n = (len - done).min(CHUNK);
            self.write(addr + done as u64, &chunk[..n])?;
            done += n;
        }
        Ok(())
    }

    pub fn read_u8(&self, addr: u64) -> Result<u8, MemoryError> {
        let mut buf = [0u8; 1];
        self.read(addr, &mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&self, addr: u64) -> Result<u16, MemoryError> {
        let mut buf = [0u8; 2];
        self.read(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64, MemoryError> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u8(&self, addr: u64, value: u8) -> Result<(), MemoryError> {
        self.write(addr, &[value])
    }

    pub fn write_u16(&self, addr: u64, value: u16) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn write_u32(&self, addr: u64, value: u32) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn write_u64(&self, addr: u64, value: u64) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }
}
