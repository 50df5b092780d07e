//! Flat byte-addressable disk images behind virtio-blk and AHCI.
//!
//! Image formats are out of scope; a disk is a raw array of bytes. I/O is
//! synchronous positional I/O on the trapping thread.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use tracing::info;

pub const SECTOR_SIZE: u64 = 512;

/// Storage behind a block device.
pub trait DiskBackend: Send {
    /// Size in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fill `buf` from byte `offset`. Short reads are errors.
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()>;

    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;

    /// Capacity in 512-byte sectors.
    fn sectors(&self) -> u64 {
        self.len() / SECTOR_SIZE
    }
}

/// Open a raw image read-write.
pub fn open_image(path: impl AsRef<Path>) -> io::Result<File> {
    let path = path.as_ref();
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    info!(
        "opened disk image {} ({} bytes)",
        path.display(),
        file.metadata()?.len()
    );
    Ok(file)
}

impl DiskBackend for File {
    fn len(&self) -> u64 {
        self.metadata().map(|m| m.len()).unwrap_or(0)
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        FileExt::read_exact_at(self, buf, offset)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
        FileExt::write_all_at(self, buf, offset)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

/// Disk held entirely in host memory.
#[derive(Debug, Clone, Default)]
pub struct MemDisk {
    data: Vec<u8>,
    flushes: u64,
}

impl MemDisk {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
            flushes: 0,
        }
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data, flushes: 0 }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Number of completed flushes.
    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    fn range(&self, offset: u64, len: usize) -> io::Result<std::ops::Range<usize>> {
        let start = usize::try_from(offset).map_err(|_| io::ErrorKind::UnexpectedEof)?;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(io::ErrorKind::UnexpectedEof)?;
        Ok(start..end)
    }
}

impl DiskBackend for MemDisk {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
        let range = self.range(offset, buf.len())?;
        self.data[range].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flushes += 1;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// A [`MemDisk`] the test keeps a handle to after giving it to a device.
    #[derive(Clone)]
    pub struct SharedDisk(pub Arc<Mutex<MemDisk>>);

    impl SharedDisk {
        pub fn new(data: Vec<u8>) -> Self {
            Self(Arc::new(Mutex::new(MemDisk::from_bytes(data))))
        }

        /// Disk whose sector `n` is filled with byte `n`.
        pub fn patterned(sectors: usize) -> Self {
            let data = (0..sectors * SECTOR_SIZE as usize)
                .map(|i| (i / SECTOR_SIZE as usize) as u8)
                .collect();
            Self::new(data)
        }

        pub fn bytes(&self, offset: usize, len: usize) -> Vec<u8> {
            self.0.lock().unwrap().bytes()[offset..offset + len].to_vec()
        }

        pub fn flushes(&self) -> u64 {
            self.0.lock().unwrap().flushes()
        }
    }

    impl DiskBackend for SharedDisk {
        fn len(&self) -> u64 {
            self.0.lock().unwrap().len()
        }

        fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()> {
            self.0.lock().unwrap().read_at(buf, offset)
        }

        fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
            self.0.lock().unwrap().write_at(buf, offset)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.0.lock().unwrap().flush()
        }
    }
}
