//! Reader-side metadata-file decoder
//!
//! A reader intercepts file reads and redirects any page listed in the
//! shared metadata-file index into the metadata file; everything else goes
//! to the real driver underneath. The writer updates the metadata file
//! without locks, so every load here must tolerate torn state: magic and
//! checksum failures are retried with exponential back-off, and the tick
//! number carried by both the header and the index decides whether a
//! snapshot is coherent.
//!
//! Load protocol:
//! - wait (bounded) for the file to reach the expected size
//! - read the header; verify magic, then checksum
//! - on reload, a tick equal to the cached one means no new work, and a
//!   tick below it is corruption
//! - read the index; verify magic, then checksum
//! - equal ticks install the snapshot; a header more than one tick ahead
//!   of the index is corruption; anything else is a torn update to retry

use crate::driver::FileDriver;
use crate::entry::PageClass;
use crate::meta_file::{MetadataFileHeader, MetadataFileIndex, HEADER_SIZE};
use pageio_common::{verify_crc32c, Error, PageBufferConfig, RetryBounds, Result};
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, warn};

/// Reader-side driver that resolves reads through the metadata-file index
#[derive(Debug)]
pub struct SwmrReader<D: FileDriver> {
    md_file: File,
    inner: D,
    md_pages_reserved: usize,
    retry: RetryBounds,
    header: MetadataFileHeader,
    index: MetadataFileIndex,
    pb_configured: bool,
}

impl<D: FileDriver> SwmrReader<D> {
    /// Open the metadata file at `md_path` and load its header and index.
    ///
    /// The writer may still be creating the file, so the open itself is
    /// retried within the configured bound.
    pub fn open(md_path: impl AsRef<Path>, inner: D, config: &PageBufferConfig) -> Result<Self> {
        config.validate()?;

        let mut backoff = config.retry.file_stat.backoff();
        let md_file = loop {
            match File::open(&md_path) {
                Ok(file) => break file,
                Err(err) => {
                    if !backoff.sleep() {
                        return Err(Error::retry_exhausted(format!(
                            "unable to open the metadata file after all retry attempts: {err}"
                        )));
                    }
                }
            }
        };

        let mut reader = Self {
            md_file,
            inner,
            md_pages_reserved: config.md_pages_reserved,
            retry: config.retry,
            header: MetadataFileHeader {
                fs_page_size: 0,
                tick_num: 0,
                index_offset: 0,
                index_length: 0,
            },
            index: MetadataFileIndex::default(),
            pb_configured: false,
        };
        reader.load_header_and_index(true)?;
        Ok(reader)
    }

    /// Tick of the currently cached snapshot
    #[must_use]
    pub fn tick(&self) -> u64 {
        self.header.tick_num
    }

    /// Number of pages in the cached index
    #[must_use]
    pub fn num_index_entries(&self) -> usize {
        self.index.entries.len()
    }

    /// True when the cached index lists `page`
    #[must_use]
    pub fn contains_page(&self, page: u64) -> bool {
        self.index.lookup(page).is_some()
    }

    /// Mark the page buffer as configured.
    ///
    /// From here on every read of a listed page must request the full
    /// published image and passes checksum verification. Before this
    /// point, the file-open machinery probes the file signature with short
    /// reads that cannot be checksummed.
    pub fn set_pb_configured(&mut self) {
        self.pb_configured = true;
    }

    /// Refresh the cached header and index from the metadata file.
    ///
    /// Returns quickly when the writer has not published a new tick since
    /// the last load.
    pub fn reload(&mut self) -> Result<()> {
        self.load_header_and_index(false)
    }

    /// Borrow the underlying driver
    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    /// Borrow the underlying driver mutably
    pub fn inner_mut(&mut self) -> &mut D {
        &mut self.inner
    }

    /// Tear down the reader and hand the underlying driver back
    #[must_use]
    pub fn into_inner(self) -> D {
        self.inner
    }

    /// Serve a read, redirecting through the metadata file when the target
    /// page is listed in the cached index.
    pub fn read(&mut self, class: PageClass, addr: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }

        let ps = u64::from(self.header.fs_page_size);
        let target_page = addr / ps;

        let Some(entry) = self.index.lookup(target_page).copied() else {
            return self.inner.read(class, addr, buf);
        };

        let page_offset = addr - target_page * ps;
        if self.pb_configured {
            if page_offset != 0 {
                return Err(Error::corrupt(format!(
                    "read of published page {target_page} at {addr:#x} is not page aligned"
                )));
            }
            if buf.len() != entry.length as usize {
                return Err(Error::corrupt(format!(
                    "read of {} bytes does not match published length {} for page {target_page}",
                    buf.len(),
                    entry.length
                )));
            }
        } else if page_offset != 0 && page_offset + buf.len() as u64 > ps {
            return Err(Error::corrupt(format!(
                "sub-page read at {addr:#x} crosses a page boundary"
            )));
        }

        let mut backoff = self.retry.entry_page.backoff();
        loop {
            self.md_file
                .seek(SeekFrom::Start(u64::from(entry.md_page) * ps + page_offset))?;
            self.md_file.read_exact(buf)?;

            // Pre-configuration probes read fragments the image checksum
            // cannot cover
            if !self.pb_configured {
                return Ok(());
            }
            if verify_crc32c(buf, entry.checksum) {
                return Ok(());
            }

            warn!(
                page = target_page,
                "published page failed checksum, retrying"
            );
            if !backoff.sleep() {
                return Err(Error::retry_exhausted(format!(
                    "published page {target_page} never verified"
                )));
            }
        }
    }

    fn load_header_and_index(&mut self, initial: bool) -> Result<()> {
        let mut backoff = self.retry.index.backoff();
        loop {
            if self.try_load(initial)? {
                return Ok(());
            }
            if !backoff.sleep() {
                return Err(Error::retry_exhausted(
                    "metadata-file header and index never stabilized",
                ));
            }
        }
    }

    /// One coherence attempt. `Ok(true)` installs or keeps a snapshot,
    /// `Ok(false)` means a torn state worth retrying, and `Err` is a hard
    /// failure.
    fn try_load(&mut self, initial: bool) -> Result<bool> {
        let header = match self.read_header() {
            Ok(header) => header,
            // A half-written header clears up on a later attempt
            Err(_) => return Ok(false),
        };

        let reserved = self.md_pages_reserved as u64 * u64::from(header.fs_page_size);
        if HEADER_SIZE as u64 + header.index_length > reserved {
            return Err(Error::corrupt(format!(
                "header + index ({} bytes) does not fit within the {} reserved metadata-file pages",
                HEADER_SIZE as u64 + header.index_length,
                self.md_pages_reserved
            )));
        }

        if !initial {
            if header.tick_num == self.header.tick_num {
                // Nothing new has been published
                return Ok(true);
            }
            if header.tick_num < self.header.tick_num {
                return Err(Error::corrupt(format!(
                    "metadata-file tick went backwards: cached {}, read {}",
                    self.header.tick_num, header.tick_num
                )));
            }
        }

        let index = match self.read_index(&header) {
            Ok(index) => index,
            Err(_) => return Ok(false),
        };

        if header.tick_num == index.tick_num {
            debug!(
                tick = header.tick_num,
                entries = index.entries.len(),
                "installed metadata-file snapshot"
            );
            self.header = header;
            self.index = index;
            return Ok(true);
        }
        if header.tick_num > index.tick_num + 1 {
            return Err(Error::corrupt(format!(
                "header tick {} is more than one ahead of index tick {}",
                header.tick_num, index.tick_num
            )));
        }

        // The writer is mid-publish; the index will catch up
        Ok(false)
    }

    fn read_header(&mut self) -> Result<MetadataFileHeader> {
        // Wait for the file to reach header size
        let mut backoff = self.retry.file_stat.backoff();
        loop {
            if self.md_file.metadata()?.len() >= HEADER_SIZE as u64 {
                break;
            }
            if !backoff.sleep() {
                return Err(Error::retry_exhausted(
                    "metadata file never reached header size",
                ));
            }
        }

        let mut backoff = self.retry.header.backoff();
        loop {
            let mut image = [0u8; HEADER_SIZE];
            self.md_file.seek(SeekFrom::Start(0))?;
            let outcome = match self.md_file.read_exact(&mut image) {
                Ok(()) => MetadataFileHeader::from_bytes(&image),
                Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                    Err(Error::corrupt("metadata file shrank under the header read"))
                }
                Err(err) => return Err(err.into()),
            };

            match outcome {
                Ok(header) => return Ok(header),
                Err(_) => {
                    if !backoff.sleep() {
                        return Err(Error::retry_exhausted(
                            "metadata-file header never verified",
                        ));
                    }
                }
            }
        }
    }

    fn read_index(&mut self, header: &MetadataFileHeader) -> Result<MetadataFileIndex> {
        // Wait for the file to cover header + index
        let need = HEADER_SIZE as u64 + header.index_length;
        let mut backoff = self.retry.file_stat.backoff();
        loop {
            if self.md_file.metadata()?.len() >= need {
                break;
            }
            if !backoff.sleep() {
                return Err(Error::retry_exhausted(
                    "metadata file never reached header + index size",
                ));
            }
        }

        let mut image = vec![0u8; header.index_length as usize];
        let mut backoff = self.retry.index.backoff();
        loop {
            self.md_file.seek(SeekFrom::Start(header.index_offset))?;
            let outcome = match self.md_file.read_exact(&mut image) {
                Ok(()) => MetadataFileIndex::from_bytes(&image),
                Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                    Err(Error::corrupt("metadata file shrank under the index read"))
                }
                Err(err) => return Err(err.into()),
            };

            match outcome {
                Ok(index) => return Ok(index),
                Err(_) => {
                    if !backoff.sleep() {
                        return Err(Error::retry_exhausted(
                            "metadata-file index never verified",
                        ));
                    }
                }
            }
        }
    }
}

impl<D: FileDriver> FileDriver for SwmrReader<D> {
    fn read(&mut self, class: PageClass, addr: u64, buf: &mut [u8]) -> Result<()> {
        SwmrReader::read(self, class, addr, buf)
    }

    fn write(&mut self, _class: PageClass, _addr: u64, _buf: &[u8]) -> Result<()> {
        Err(Error::invariant("SWMR reader is read-only"))
    }

    fn eoa(&self, class: PageClass) -> Result<u64> {
        self.inner.eoa(class)
    }

    fn set_eoa(&mut self, class: PageClass, addr: u64) -> Result<()> {
        self.inner.set_eoa(class, addr)
    }

    fn eof(&self) -> Result<u64> {
        self.inner.eof()
    }

    fn lock(&mut self, exclusive: bool) -> Result<()> {
        self.inner.lock(exclusive)
    }

    fn unlock(&mut self) -> Result<()> {
        self.inner.unlock()
    }

    fn truncate(&mut self, _closing: bool) -> Result<()> {
        Err(Error::invariant("SWMR reader is read-only"))
    }
}
