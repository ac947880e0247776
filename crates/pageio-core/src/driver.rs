//! File driver abstraction
//!
//! The page buffer performs all file I/O through a block-level driver.
//! The driver distinguishes the logical end of allocation (EOA), managed by
//! the allocator above, from the physical end of file (EOF): allocation
//! always covers resident entries, while EOF may lag behind when freshly
//! allocated pages have not been written yet.

use crate::entry::PageClass;
use pageio_common::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Block-level driver the page buffer reads and writes through
pub trait FileDriver {
    /// Read `buf.len()` bytes at `addr`
    fn read(&mut self, class: PageClass, addr: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` at `addr`
    fn write(&mut self, class: PageClass, addr: u64, buf: &[u8]) -> Result<()>;

    /// Logical end of allocation for the given class
    fn eoa(&self, class: PageClass) -> Result<u64>;

    /// Move the logical end of allocation
    fn set_eoa(&mut self, class: PageClass, addr: u64) -> Result<()>;

    /// Physical end of file
    fn eof(&self) -> Result<u64>;

    /// Acquire an advisory lock on the file
    fn lock(&mut self, exclusive: bool) -> Result<()>;

    /// Release the advisory lock
    fn unlock(&mut self) -> Result<()>;

    /// Bring the physical size in line with the EOA
    fn truncate(&mut self, closing: bool) -> Result<()>;
}

/// SWMR write-delay oracle.
///
/// When the writer dirties a metadata page that was loaded from the file,
/// the SWMR subsystem may require its write-back to wait a number of ticks
/// so that no reader observes an image newer than the index it holds.
pub trait WriteDelayPolicy {
    /// Ticks to delay the write of `page`; 0 means no delay required
    fn required_delay(&self, page: u64) -> u64;
}

/// Policy that never delays writes
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDelay;

impl WriteDelayPolicy for NoDelay {
    fn required_delay(&self, _page: u64) -> u64 {
        0
    }
}

/// Driver backed by a plain file
///
/// EOA is tracked in memory and initialized from the file length; EOF comes
/// from file metadata. Reads past EOF zero-fill the tail, matching how a
/// freshly grown file reads back.
pub struct FileBackedDriver {
    file: File,
    path: String,
    eoa: u64,
}

impl FileBackedDriver {
    /// Create (or truncate) a file for read/write access
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            file,
            path: path_str,
            eoa: 0,
        })
    }

    /// Open an existing file
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)?;
        let eoa = file.metadata()?.len();
        Ok(Self {
            file,
            path: path_str,
            eoa,
        })
    }

    /// Path this driver was opened with
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl FileDriver for FileBackedDriver {
    fn read(&mut self, _class: PageClass, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(addr))?;

        let mut filled = 0;
        while filled < buf.len() {
            let n = self.file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        // Anything past EOF reads back as zeros
        buf[filled..].fill(0);
        Ok(())
    }

    fn write(&mut self, _class: PageClass, addr: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(addr))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn eoa(&self, _class: PageClass) -> Result<u64> {
        Ok(self.eoa)
    }

    fn set_eoa(&mut self, _class: PageClass, addr: u64) -> Result<()> {
        self.eoa = addr;
        Ok(())
    }

    fn eof(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn lock(&mut self, _exclusive: bool) -> Result<()> {
        // Advisory locking is not load-bearing for the single-process model
        Ok(())
    }

    fn unlock(&mut self) -> Result<()> {
        Ok(())
    }

    fn truncate(&mut self, _closing: bool) -> Result<()> {
        if self.file.metadata()?.len() < self.eoa {
            self.file.set_len(self.eoa)?;
        }
        Ok(())
    }
}

/// Fully in-memory driver
///
/// The backing store grows on write. Useful for tests and for files that
/// never touch disk.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    data: Vec<u8>,
    eoa: u64,
}

impl MemoryDriver {
    /// Create an empty in-memory file
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrow the raw backing store
    #[must_use]
    pub fn contents(&self) -> &[u8] {
        &self.data
    }
}

impl FileDriver for MemoryDriver {
    fn read(&mut self, _class: PageClass, addr: u64, buf: &mut [u8]) -> Result<()> {
        let start = usize::try_from(addr)
            .map_err(|_| Error::config(format!("address {addr} out of range")))?;
        let avail = self.data.len().saturating_sub(start);
        let n = avail.min(buf.len());
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        buf[n..].fill(0);
        Ok(())
    }

    fn write(&mut self, _class: PageClass, addr: u64, buf: &[u8]) -> Result<()> {
        let start = usize::try_from(addr)
            .map_err(|_| Error::config(format!("address {addr} out of range")))?;
        let end = start + buf.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn eoa(&self, _class: PageClass) -> Result<u64> {
        Ok(self.eoa)
    }

    fn set_eoa(&mut self, _class: PageClass, addr: u64) -> Result<()> {
        self.eoa = addr;
        Ok(())
    }

    fn eof(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn lock(&mut self, _exclusive: bool) -> Result<()> {
        Ok(())
    }

    fn unlock(&mut self) -> Result<()> {
        Ok(())
    }

    fn truncate(&mut self, _closing: bool) -> Result<()> {
        let eoa = usize::try_from(self.eoa)
            .map_err(|_| Error::config("EOA out of range".to_string()))?;
        if self.data.len() < eoa {
            self.data.resize(eoa, 0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_memory_driver_roundtrip() {
        let mut drv = MemoryDriver::new();
        drv.write(PageClass::RawData, 4096, b"payload").unwrap();

        let mut buf = [0u8; 7];
        drv.read(PageClass::RawData, 4096, &mut buf).unwrap();
        assert_eq!(&buf, b"payload");
        assert_eq!(drv.eof().unwrap(), 4096 + 7);
    }

    #[test]
    fn test_memory_driver_read_past_eof_zero_fills() {
        let mut drv = MemoryDriver::new();
        drv.write(PageClass::RawData, 0, b"abc").unwrap();

        let mut buf = [0xFFu8; 8];
        drv.read(PageClass::RawData, 0, &mut buf).unwrap();
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(&buf[3..], &[0u8; 5]);
    }

    #[test]
    fn test_memory_driver_eoa_independent_of_eof() {
        let mut drv = MemoryDriver::new();
        drv.set_eoa(PageClass::Metadata, 8192).unwrap();
        assert_eq!(drv.eoa(PageClass::Metadata).unwrap(), 8192);
        assert_eq!(drv.eof().unwrap(), 0);

        drv.truncate(false).unwrap();
        assert_eq!(drv.eof().unwrap(), 8192);
    }

    #[test]
    fn test_file_backed_driver_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.dat");

        {
            let mut drv = FileBackedDriver::create(&path).unwrap();
            drv.write(PageClass::Metadata, 4096, b"on disk").unwrap();
        }

        let mut drv = FileBackedDriver::open(&path, true).unwrap();
        let mut buf = [0u8; 7];
        drv.read(PageClass::Metadata, 4096, &mut buf).unwrap();
        assert_eq!(&buf, b"on disk");
    }

    #[test]
    fn test_file_backed_driver_short_read_zero_fills() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.dat");

        let mut drv = FileBackedDriver::create(&path).unwrap();
        drv.write(PageClass::RawData, 0, b"xy").unwrap();

        let mut buf = [0xAAu8; 6];
        drv.read(PageClass::RawData, 0, &mut buf).unwrap();
        assert_eq!(&buf, &[b'x', b'y', 0, 0, 0, 0]);
    }
}
