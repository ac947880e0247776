//! Page buffer engine
//!
//! A page-granular write-back cache between the typed upper layers and the
//! block-level file driver. Metadata and raw data are admitted separately,
//! each with a configurable minimum share of the buffer. Single pages live
//! on an LRU; multi-page metadata entries (SWMR writer only) live in the
//! index alone, or on the delayed-write list while their write-back must
//! wait for readers to catch up.
//!
//! Request routing:
//! - Raw reads/writes of a page or more bypass the cache and reconcile with
//!   resident pages in place (dirty overlays on read, patch-or-evict on
//!   write).
//! - Sub-page raw traffic is served from resident pages, loading on miss.
//! - Metadata traffic is clipped to page boundaries; page-aligned requests
//!   of a page or more may bypass, serve from a resident page, or address a
//!   multi-page metadata entry depending on residency and SWMR mode.
//!
//! In SWMR-writer mode every metadata write also lands on the tick list,
//! and dirtying a page that was loaded from the file may move it to the
//! delayed-write list so readers never observe an image newer than the
//! index they hold.

use crate::driver::{FileDriver, NoDelay, WriteDelayPolicy};
use crate::entry::{PageClass, PageEntry};
use crate::index::EntryIndex;
use crate::lists::EntryList;
use crate::publisher::{IndexUpdateCounts, WriterIndex};
use crate::stats::PageBufferStats;
use pageio_common::{Error, PageBufferConfig, Result};
use tracing::{debug, trace};

/// Page-granular write-back cache over a file driver
pub struct PageBuffer<D: FileDriver> {
    driver: D,
    page_size: usize,
    max_pages: usize,
    curr_pages: usize,
    curr_md_pages: usize,
    curr_rd_pages: usize,
    min_md_pages: usize,
    min_rd_pages: usize,
    index: EntryIndex,
    lru: EntryList,
    /// Dirty entries whose write-back waits for a future tick, sorted by
    /// decreasing deadline
    dwl: EntryList,
    /// Entries modified during the current tick
    tl: EntryList,
    swmr_writer: bool,
    mpmde_count: usize,
    cur_tick: u64,
    delay_policy: Box<dyn WriteDelayPolicy>,
    /// Address of the previous metadata read; disambiguates the metadata
    /// cache's speculative-then-exact read pairs
    last_meta_read_addr: Option<u64>,
    stats: PageBufferStats,
}

impl<D: FileDriver> PageBuffer<D> {
    /// Create a page buffer over `driver`.
    ///
    /// `config.max_size` is rounded down to a page multiple when larger
    /// than one page; any other non-multiple is rejected. The per-class
    /// minimum page counts are derived from the configured percentages.
    pub fn create(driver: D, config: &PageBufferConfig) -> Result<Self> {
        config.validate()?;

        let page_size = config.page_size;
        let size = if config.max_size > page_size {
            (config.max_size / page_size) * page_size
        } else if config.max_size % page_size != 0 {
            return Err(Error::config(
                "page buffer size must be at least the page size",
            ));
        } else {
            config.max_size
        };

        let max_pages = size / page_size;
        let min_md_pages = size * config.min_meta_pct as usize / (page_size * 100);
        let min_rd_pages = size * config.min_raw_pct as usize / (page_size * 100);
        debug_assert!(min_md_pages + min_rd_pages <= max_pages);

        debug!(
            max_pages,
            min_md_pages,
            min_rd_pages,
            swmr_writer = config.swmr_writer,
            "creating page buffer"
        );

        Ok(Self {
            driver,
            page_size,
            max_pages,
            curr_pages: 0,
            curr_md_pages: 0,
            curr_rd_pages: 0,
            min_md_pages,
            min_rd_pages,
            index: EntryIndex::new(),
            lru: EntryList::new(),
            dwl: EntryList::new(),
            tl: EntryList::new(),
            swmr_writer: config.swmr_writer,
            mpmde_count: 0,
            cur_tick: 0,
            delay_policy: Box::new(NoDelay),
            last_meta_read_addr: None,
            stats: PageBufferStats::default(),
        })
    }

    /// Install the SWMR write-delay oracle (writer mode)
    pub fn set_delay_policy(&mut self, policy: Box<dyn WriteDelayPolicy>) {
        self.delay_policy = policy;
    }

    /// Page size in bytes
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Capacity in pages
    #[must_use]
    pub fn max_pages(&self) -> usize {
        self.max_pages
    }

    /// Resident entries (multi-page metadata entries count once)
    #[must_use]
    pub fn curr_pages(&self) -> usize {
        self.curr_pages
    }

    /// Resident single metadata pages
    #[must_use]
    pub fn curr_md_pages(&self) -> usize {
        self.curr_md_pages
    }

    /// Resident raw data pages
    #[must_use]
    pub fn curr_rd_pages(&self) -> usize {
        self.curr_rd_pages
    }

    /// Resident multi-page metadata entries
    #[must_use]
    pub fn mpmde_count(&self) -> usize {
        self.mpmde_count
    }

    /// Current tick (SWMR writer)
    #[must_use]
    pub fn current_tick(&self) -> u64 {
        self.cur_tick
    }

    /// True in SWMR-writer mode
    #[must_use]
    pub fn is_swmr_writer(&self) -> bool {
        self.swmr_writer
    }

    /// Dirty resident entries
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.index.dirty_len()
    }

    /// Entries on the LRU
    #[must_use]
    pub fn lru_len(&self) -> usize {
        self.lru.len()
    }

    /// Entries on the tick list
    #[must_use]
    pub fn tick_list_len(&self) -> usize {
        self.tl.len()
    }

    /// Entries on the delayed-write list
    #[must_use]
    pub fn delayed_write_len(&self) -> usize {
        self.dwl.len()
    }

    /// Access counters
    #[must_use]
    pub fn stats(&self) -> &PageBufferStats {
        &self.stats
    }

    /// Reset the access counters
    pub fn reset_stats(&mut self) {
        self.stats.reset();
    }

    /// Borrow the underlying driver
    #[must_use]
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Borrow the underlying driver mutably
    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Test whether a page-aligned address is resident
    #[must_use]
    pub fn page_exists(&self, addr: u64) -> bool {
        let page = addr / self.page_size as u64;
        debug_assert_eq!(addr, page * self.page_size as u64);
        self.index.contains(page)
    }

    /// Satisfy a read from the page buffer if possible.
    ///
    /// Requests for a class the configuration excludes bypass straight to
    /// the driver; everything else follows the admission rules in the
    /// module documentation.
    pub fn read(&mut self, class: PageClass, addr: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }

        let bypass = match class {
            PageClass::RawData => self.min_md_pages == self.max_pages,
            PageClass::Metadata => self.min_rd_pages == self.max_pages,
        };

        if bypass {
            self.driver.read(class, addr, buf)?;
            self.stats.record_bypass(class, buf.len());
            return Ok(());
        }

        match class {
            PageClass::RawData => self.read_raw(addr, buf),
            PageClass::Metadata => self.read_meta(addr, buf),
        }
    }

    /// Write through the page buffer if practical, and to the file
    /// otherwise.
    pub fn write(&mut self, class: PageClass, addr: u64, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }

        let bypass = match class {
            PageClass::RawData => self.min_md_pages == self.max_pages,
            PageClass::Metadata => {
                self.min_rd_pages == self.max_pages
                    || (buf.len() > self.page_size && !self.swmr_writer)
            }
        };

        if bypass {
            self.driver.write(class, addr, buf)?;
            self.stats.record_bypass(class, buf.len());
            return Ok(());
        }

        match class {
            PageClass::RawData => self.write_raw(addr, buf),
            PageClass::Metadata => self.write_meta(addr, buf),
        }
    }

    /// Write back every dirty entry. Entries stay resident and become
    /// clean; nothing is evicted.
    ///
    /// Fails when an entry is still subject to a delayed write: such
    /// entries must be released by the tick machinery first.
    pub fn flush(&mut self) -> Result<()> {
        let mut dirty: Vec<u64> = Vec::new();
        for entry in self.index.entries() {
            if entry.delay_write_until > 0 {
                return Err(Error::invariant(format!(
                    "cannot flush page {}: delayed write outstanding",
                    entry.page
                )));
            }
            if entry.is_dirty {
                dirty.push(entry.page);
            }
        }

        for page in dirty {
            self.flush_entry(page)?;
        }
        Ok(())
    }

    /// Flush and evict everything, verify all lists drained, and hand the
    /// driver back.
    ///
    /// Outstanding delayed writes are released (flushed with everything
    /// else) rather than rejected, so a writer can close mid-delay without
    /// leaking buffered state.
    pub fn close(mut self) -> Result<D> {
        // Release delayed writes and the tick list up front so the
        // eviction preconditions hold for every entry.
        let delayed: Vec<u64> = self.dwl.iter().collect();
        for page in delayed {
            self.dwl.remove(page);
            if let Some(entry) = self.index.get_mut(page) {
                entry.delay_write_until = 0;
                if !entry.is_mpmde(self.page_size) {
                    self.lru.push_head(page);
                }
            }
        }

        let ticked: Vec<u64> = self.tl.iter().collect();
        for page in ticked {
            self.tl.remove(page);
            if let Some(entry) = self.index.get_mut(page) {
                entry.modified_this_tick = false;
            }
        }

        let pages: Vec<u64> = self.index.pages().collect();
        for page in pages {
            let dirty = self.index.get(page).is_some_and(|e| e.is_dirty);
            if dirty {
                self.flush_entry(page)?;
            }
            self.evict_entry(page, true)?;
        }

        if !self.index.is_empty()
            || !self.lru.is_empty()
            || !self.dwl.is_empty()
            || !self.tl.is_empty()
        {
            return Err(Error::invariant(
                "page buffer lists not empty after teardown",
            ));
        }
        debug_assert_eq!(self.curr_pages, 0);
        debug_assert_eq!(self.curr_md_pages, 0);
        debug_assert_eq!(self.curr_rd_pages, 0);
        debug_assert_eq!(self.mpmde_count, 0);

        Ok(self.driver)
    }

    /// Insert a fresh zeroed page for a newly allocated address.
    ///
    /// Called by the allocator: the page cannot have an earlier version in
    /// the file, so no read is needed and no write delay will ever apply.
    /// Inserts without making space, so the buffer may temporarily exceed
    /// its maximum; the next page load brings it back down.
    pub fn add_new_page(&mut self, class: PageClass, page_addr: u64) -> Result<()> {
        let can_insert = match class {
            PageClass::RawData => self.min_md_pages < self.max_pages,
            PageClass::Metadata => self.min_rd_pages < self.max_pages,
        };
        if can_insert {
            self.create_new_page(page_addr, self.page_size, class, true)?;
        }
        Ok(())
    }

    /// Discard the entry at `addr`, if resident, regardless of dirtiness.
    ///
    /// Called when the allocator frees the page. The entry is detached
    /// from the tick and delayed-write lists first; its image is dropped
    /// without write-back.
    pub fn remove_entry(&mut self, addr: u64) -> Result<()> {
        let page = addr / self.page_size as u64;
        debug_assert_eq!(addr, page * self.page_size as u64);

        let Some(entry) = self.index.get(page) else {
            return Ok(());
        };

        let mpmde = entry.is_mpmde(self.page_size);
        let modified = entry.modified_this_tick;
        let delayed = entry.delay_write_until > 0;
        let dirty = entry.is_dirty;

        if mpmde && !self.swmr_writer {
            return Err(Error::corrupt(format!(
                "multi-page metadata entry at page {page} outside SWMR-writer mode"
            )));
        }

        if modified {
            self.tl.remove(page);
            if let Some(entry) = self.index.get_mut(page) {
                entry.modified_this_tick = false;
            }
        }

        if delayed {
            self.dwl.remove(page);
            if let Some(entry) = self.index.get_mut(page) {
                entry.delay_write_until = 0;
            }
            if !mpmde {
                self.lru.push_head(page);
            }
        }

        if dirty {
            self.index.set_clean(page);
        }

        self.evict_entry(page, true)
    }

    /// Patch a resident metadata page in place without dirtying it.
    ///
    /// Keeps the page image consistent with a peer's write when entries
    /// are marked clean out-of-band.
    pub fn update_entry(&mut self, addr: u64, buf: &[u8]) -> Result<()> {
        if buf.len() > self.page_size {
            return Err(Error::config(
                "update must not exceed one page",
            ));
        }

        if self.min_rd_pages >= self.max_pages {
            // not configured to accept metadata pages
            return Ok(());
        }

        let page = addr / self.page_size as u64;
        let page_addr = page * self.page_size as u64;

        if let Some(entry) = self.index.get_mut(page) {
            if !entry.class.is_metadata() || entry.size != self.page_size {
                return Err(Error::invariant(format!(
                    "update targets page {page} which is not a metadata page"
                )));
            }
            let offset = (addr - page_addr) as usize;
            if offset + buf.len() > self.page_size {
                return Err(Error::invariant(
                    "update crosses a page boundary",
                ));
            }
            entry.image[offset..offset + buf.len()].copy_from_slice(buf);
            self.lru.move_to_head(page);
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // SWMR writer operations
    // ---------------------------------------------------------------

    /// Synchronize the buffer's tick with the file's at the start of a
    /// tick. The tick must advance by exactly 1.
    pub fn set_tick(&mut self, tick: u64) -> Result<()> {
        self.require_writer()?;
        if tick != self.cur_tick + 1 {
            return Err(Error::invariant(format!(
                "tick must advance by 1: current {}, requested {tick}",
                self.cur_tick
            )));
        }
        self.cur_tick = tick;
        Ok(())
    }

    /// Merge the tick list into the writer's persistent index.
    ///
    /// Tick-list entries update their index records (or append new ones);
    /// index records absent from the tick list are marked clean once the
    /// page buffer no longer holds them dirty. See
    /// [`WriterIndex`](crate::publisher::WriterIndex) for the record
    /// layout.
    pub fn update_index(&self, widx: &mut WriterIndex) -> Result<IndexUpdateCounts> {
        self.require_writer()?;

        let mut counts = IndexUpdateCounts::default();

        for page in self.tl.iter() {
            let entry = self
                .index
                .get(page)
                .ok_or_else(|| Error::invariant(format!("tick list names page {page} not in index")))?;

            let record = match widx.position(page) {
                Some(pos) => {
                    counts.modified += 1;
                    widx.entry_at_mut(pos)
                }
                None => {
                    counts.added += 1;
                    widx.insert_new(page, entry.size as u32, entry.delay_write_until)
                }
            };

            record.image = Some(entry.image.clone());
            record.tick_of_last_change = self.cur_tick;
            record.clean = !entry.is_dirty;
            record.tick_of_last_flush = if record.clean { self.cur_tick } else { 0 };
        }

        for record in widx.entries_mut() {
            if record.tick_of_last_change >= self.cur_tick {
                continue;
            }
            counts.not_in_tl += 1;
            if record.clean {
                continue;
            }
            let still_dirty = self
                .index
                .get(record.data_page)
                .is_some_and(|e| e.is_dirty);
            if !still_dirty {
                counts.not_in_tl_flushed += 1;
                record.clean = true;
                record.tick_of_last_flush = self.cur_tick;
            }
        }

        Ok(counts)
    }

    /// Drain the tick list after the index has been published.
    ///
    /// Multi-page metadata entries not subject to a delayed write are
    /// flushed and evicted immediately; everything else already sits on
    /// the LRU or the delayed-write list and is handled there.
    pub fn release_tick_list(&mut self) -> Result<()> {
        self.require_writer()?;

        while let Some(page) = self.tl.head() {
            self.tl.remove(page);

            let Some(entry) = self.index.get_mut(page) else {
                return Err(Error::invariant(format!(
                    "tick list names page {page} not in index"
                )));
            };
            entry.modified_this_tick = false;

            let mpmde = entry.is_mpmde(self.page_size);
            let delayed = entry.delay_write_until > 0;
            debug_assert!(!mpmde || entry.is_dirty);

            if mpmde && !delayed {
                self.flush_entry(page)?;
                self.evict_entry(page, true)?;
            }
        }

        debug_assert!(self.tl.is_empty());
        Ok(())
    }

    /// Release delayed writes whose deadline has passed.
    ///
    /// The delayed-write list is sorted by decreasing deadline, so the
    /// scan starts at the tail and stops at the first unexpired entry.
    /// Released multi-page metadata entries are flushed and evicted;
    /// released pages rejoin the LRU at the tail.
    pub fn release_delayed_writes(&mut self) -> Result<()> {
        self.require_writer()?;

        while let Some(page) = self.dwl.tail() {
            let Some(entry) = self.index.get_mut(page) else {
                return Err(Error::invariant(format!(
                    "delayed-write list names page {page} not in index"
                )));
            };
            if entry.delay_write_until >= self.cur_tick {
                break;
            }
            debug_assert!(entry.is_dirty);
            entry.delay_write_until = 0;
            let mpmde = entry.is_mpmde(self.page_size);
            self.dwl.remove(page);

            if mpmde {
                self.flush_entry(page)?;
                self.evict_entry(page, true)?;
            } else {
                self.lru.push_tail(page);
            }
            trace!(page, "released delayed write");
        }
        Ok(())
    }

    fn require_writer(&self) -> Result<()> {
        if !self.swmr_writer {
            return Err(Error::invariant(
                "operation requires SWMR-writer mode",
            ));
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Metadata paths
    // ---------------------------------------------------------------

    fn read_meta(&mut self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let size = buf.len();
        let page = addr / self.page_size as u64;
        let page_addr = page * self.page_size as u64;

        if addr != page_addr {
            // Not page aligned: clip to the end of the page and serve from
            // the containing page. The free-space manager guarantees a
            // multi-page metadata entry is page aligned, so the target must
            // be a regular page.
            let offset = (addr - page_addr) as usize;
            let clipped = size.min(self.page_size - offset);

            let hit = self.index.contains(page);
            self.stats.record_access(PageClass::Metadata, hit);
            if !hit {
                self.load_page(page_addr, PageClass::Metadata)?;
            }

            let entry = self.entry(page)?;
            if entry.is_mpmde(self.page_size) {
                return Err(Error::corrupt(format!(
                    "unaligned metadata read at {addr:#x} targets a multi-page entry"
                )));
            }
            buf[..clipped].copy_from_slice(&entry.image[offset..offset + clipped]);

            if self.entry(page)?.on_lru(self.page_size) {
                self.lru.move_to_head(page);
            }
        } else if size >= self.page_size {
            let target = self
                .index
                .get(page)
                .map(|e| (e.is_mpmde(self.page_size), e.is_dirty, e.size));

            match target {
                None => {
                    // No resident entry: the read is (or may turn out to
                    // be) a multi-page metadata entry, which is not
                    // buffered outside SWMR-writer mode. Satisfy from the
                    // file.
                    self.stats.record_access(PageClass::Metadata, false);
                    self.driver.read(PageClass::Metadata, addr, buf)?;
                    self.stats.record_bypass(PageClass::Metadata, size);
                }
                Some((false, dirty, _)) => {
                    if self.last_meta_read_addr == Some(addr) {
                        // Second read of a speculative-then-exact pair: the
                        // first read loaded the page, and the caller now
                        // knows the entry is multi-page. Drop the stale
                        // page and read the full entry from the file.
                        if dirty {
                            return Err(Error::invariant(format!(
                                "re-read of page {page} would discard a dirty page"
                            )));
                        }
                        self.evict_entry(page, true)?;
                        self.driver.read(PageClass::Metadata, addr, buf)?;
                        self.stats.record_bypass(PageClass::Metadata, size);
                    } else {
                        // Speculative over-read: clip to one page and
                        // serve from the resident entry.
                        self.stats.record_access(PageClass::Metadata, true);
                        let entry = self.entry(page)?;
                        buf[..self.page_size].copy_from_slice(&entry.image);
                        if self.entry(page)?.on_lru(self.page_size) {
                            self.lru.move_to_head(page);
                        }
                    }
                }
                Some((true, _, entry_size)) => {
                    // Multi-page metadata entry
                    if !self.swmr_writer {
                        return Err(Error::corrupt(format!(
                            "multi-page metadata entry at page {page} outside SWMR-writer mode"
                        )));
                    }
                    self.stats.record_access(PageClass::Metadata, true);
                    let clipped = size.min(entry_size);
                    let entry = self.entry(page)?;
                    buf[..clipped].copy_from_slice(&entry.image[..clipped]);
                }
            }
        } else {
            // Page aligned, smaller than a page
            let hit = self.index.contains(page);
            self.stats.record_access(PageClass::Metadata, hit);
            if !hit {
                self.load_page(page_addr, PageClass::Metadata)?;
            }

            let entry = self.entry(page)?;
            if entry.is_mpmde(self.page_size) && !self.swmr_writer {
                return Err(Error::corrupt(format!(
                    "multi-page metadata entry at page {page} outside SWMR-writer mode"
                )));
            }
            buf.copy_from_slice(&entry.image[..size]);

            if self.entry(page)?.on_lru(self.page_size) {
                self.lru.move_to_head(page);
            }
        }

        self.last_meta_read_addr = Some(addr);
        Ok(())
    }

    fn write_meta(&mut self, addr: u64, buf: &[u8]) -> Result<()> {
        let size = buf.len();
        let page = addr / self.page_size as u64;
        let page_addr = page * self.page_size as u64;

        if size > self.page_size {
            // Multi-page metadata entry; only reachable in SWMR-writer
            // mode, where it is buffered until the end of the tick.
            debug_assert!(self.swmr_writer);
            if addr != page_addr {
                return Err(Error::invariant(format!(
                    "multi-page metadata write at {addr:#x} is not page aligned"
                )));
            }

            let hit = self.index.contains(page);
            self.stats.record_access(PageClass::Metadata, hit);
            if !hit {
                self.create_new_page(addr, size, PageClass::Metadata, false)?;
                // A multi-page entry is always written in full, so it never
                // loads from the file; still, an earlier version may exist
                // there, so the delay test below must run.
                self.entry_mut(page)?.loaded = true;
            }

            let ps = self.page_size;
            let entry = self.entry_mut(page)?;
            if !entry.is_mpmde(ps) || entry.size != size {
                return Err(Error::invariant(format!(
                    "multi-page metadata write of {size} bytes does not match entry at page {page}"
                )));
            }
            entry.image.copy_from_slice(buf);

            self.mark_entry_dirty(page)?;
            self.insert_in_tick_list(page);
        } else {
            let offset = (addr - page_addr) as usize;
            if offset + size > self.page_size {
                return Err(Error::invariant(format!(
                    "metadata write at {addr:#x} crosses a page boundary"
                )));
            }

            let hit = self.index.contains(page);
            self.stats.record_access(PageClass::Metadata, hit);
            if !hit {
                self.load_page(page_addr, PageClass::Metadata)?;
            }

            let ps = self.page_size;
            let entry = self.entry_mut(page)?;
            if !entry.class.is_metadata() {
                return Err(Error::invariant(format!(
                    "metadata write targets raw page {page}"
                )));
            }
            if entry.is_mpmde(ps) {
                return Err(Error::invariant(format!(
                    "sub-page metadata write targets multi-page entry at page {page}"
                )));
            }
            entry.image[offset..offset + size].copy_from_slice(buf);

            self.mark_entry_dirty(page)?;
            if self.swmr_writer {
                self.insert_in_tick_list(page);
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Raw data paths
    // ---------------------------------------------------------------

    fn read_raw(&mut self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let size = buf.len();
        let ps = self.page_size as u64;
        let first_page = addr / ps;
        let last_page = (addr + size as u64 - 1) / ps;

        if size >= self.page_size {
            // Read straight from the file, then lay any resident dirty
            // pages over the result so buffered updates win.
            self.driver.read(PageClass::RawData, addr, buf)?;
            self.stats.record_bypass(PageClass::RawData, size);

            for page in first_page..=last_page {
                let dirty = match self.index.get(page) {
                    Some(entry) => {
                        debug_assert!(!entry.class.is_metadata());
                        debug_assert_eq!(entry.delay_write_until, 0);
                        entry.is_dirty
                    }
                    None => {
                        self.stats.record_access(PageClass::RawData, false);
                        continue;
                    }
                };
                self.stats.record_access(PageClass::RawData, true);

                if dirty {
                    let page_start = page * ps;
                    let copy_start = if page == first_page {
                        (addr - page_start) as usize
                    } else {
                        0
                    };
                    let copy_end = if page == last_page {
                        (addr + size as u64 - page_start) as usize
                    } else {
                        self.page_size
                    };
                    let buf_off = (page_start + copy_start as u64 - addr) as usize;

                    let entry = self.entry(page)?;
                    buf[buf_off..buf_off + (copy_end - copy_start)]
                        .copy_from_slice(&entry.image[copy_start..copy_end]);

                    self.lru.move_to_head(page);
                }
            }
        } else {
            // Sub-page read: touches at most two pages; load on miss.
            let first_addr = first_page * ps;
            let offset = (addr - first_addr) as usize;
            let first_len = size.min(self.page_size - offset);

            self.read_raw_fragment(first_page, offset, &mut buf[..first_len])?;

            if first_len < size {
                debug_assert_eq!(last_page, first_page + 1);
                self.read_raw_fragment(last_page, 0, &mut buf[first_len..])?;
            }
        }
        Ok(())
    }

    fn read_raw_fragment(&mut self, page: u64, offset: usize, buf: &mut [u8]) -> Result<()> {
        let hit = self.index.contains(page);
        self.stats.record_access(PageClass::RawData, hit);
        if !hit {
            self.load_page(page * self.page_size as u64, PageClass::RawData)?;
        }

        let entry = self.entry(page)?;
        debug_assert!(!entry.class.is_metadata());
        buf.copy_from_slice(&entry.image[offset..offset + buf.len()]);
        self.lru.move_to_head(page);
        Ok(())
    }

    fn write_raw(&mut self, addr: u64, buf: &[u8]) -> Result<()> {
        let size = buf.len();
        let ps = self.page_size as u64;
        let first_page = addr / ps;
        let last_page = (addr + size as u64 - 1) / ps;

        if size >= self.page_size {
            // Write straight to the file. Resident pages the write fully
            // covers are now stale: discard them. Partially covered edge
            // pages are patched and left dirty.
            self.driver.write(PageClass::RawData, addr, buf)?;
            self.stats.record_bypass(PageClass::RawData, size);

            for page in first_page..=last_page {
                let exists = self.index.contains(page);
                self.stats.record_access(PageClass::RawData, exists);
                if !exists {
                    continue;
                }

                let page_start = page * ps;
                let fully_covered =
                    addr <= page_start && page_start + ps <= addr + size as u64;

                if fully_covered {
                    self.index.set_clean(page);
                    self.evict_entry(page, true)?;
                } else if page == first_page {
                    let offset = (addr - page_start) as usize;
                    let len = self.page_size - offset;
                    let entry = self.entry_mut(page)?;
                    entry.image[offset..].copy_from_slice(&buf[..len]);
                    self.mark_entry_dirty(page)?;
                } else {
                    debug_assert_eq!(page, last_page);
                    let len = (addr + size as u64 - page_start) as usize;
                    let entry = self.entry_mut(page)?;
                    entry.image[..len].copy_from_slice(&buf[size - len..]);
                    self.mark_entry_dirty(page)?;
                }
            }
        } else {
            // Sub-page write: touches at most two pages; load on miss.
            let first_addr = first_page * ps;
            let offset = (addr - first_addr) as usize;
            let first_len = size.min(self.page_size - offset);

            self.write_raw_fragment(first_page, offset, &buf[..first_len])?;

            if first_len < size {
                debug_assert_eq!(last_page, first_page + 1);
                self.write_raw_fragment(last_page, 0, &buf[first_len..])?;
            }
        }
        Ok(())
    }

    fn write_raw_fragment(&mut self, page: u64, offset: usize, buf: &[u8]) -> Result<()> {
        let hit = self.index.contains(page);
        self.stats.record_access(PageClass::RawData, hit);
        if !hit {
            self.load_page(page * self.page_size as u64, PageClass::RawData)?;
        }

        let entry = self.entry_mut(page)?;
        debug_assert!(!entry.class.is_metadata());
        entry.image[offset..offset + buf.len()].copy_from_slice(buf);
        self.mark_entry_dirty(page)
    }

    // ---------------------------------------------------------------
    // Entry lifecycle
    // ---------------------------------------------------------------

    fn entry(&self, page: u64) -> Result<&PageEntry> {
        self.index
            .get(page)
            .ok_or_else(|| Error::invariant(format!("page {page} vanished from index")))
    }

    fn entry_mut(&mut self, page: u64) -> Result<&mut PageEntry> {
        self.index
            .get_mut(page)
            .ok_or_else(|| Error::invariant(format!("page {page} vanished from index")))
    }

    /// Create a new entry and insert it into the index (and the LRU for
    /// single pages). Refuses when the page is already resident.
    fn create_new_page(
        &mut self,
        addr: u64,
        size: usize,
        class: PageClass,
        clean_image: bool,
    ) -> Result<()> {
        let page = addr / self.page_size as u64;
        if addr != page * self.page_size as u64 {
            return Err(Error::invariant(format!(
                "page creation at unaligned address {addr:#x}"
            )));
        }
        debug_assert!(size >= self.page_size);
        debug_assert!(size == self.page_size || (self.swmr_writer && class.is_metadata()));

        if self.index.contains(page) {
            return Err(Error::invariant(format!(
                "page buffer already contains a page at {addr:#x}"
            )));
        }

        let entry = PageEntry::new(page, addr, size, class, clean_image);
        let mpmde = entry.is_mpmde(self.page_size);
        self.index.insert(entry)?;

        if !mpmde {
            self.lru.push_head(page);
        }

        self.curr_pages += 1;
        if mpmde {
            self.mpmde_count += 1;
        } else if class.is_metadata() {
            self.curr_md_pages += 1;
        } else {
            self.curr_rd_pages += 1;
        }
        self.stats.insertions += 1;
        Ok(())
    }

    /// Load the page at `page_addr` from the file and insert it.
    ///
    /// The load is always a single page: multi-page metadata entries are
    /// written in full and only ever enter the buffer through a write.
    /// A page past EOF has been allocated but never written; its image is
    /// zeroed without touching the file, and `loaded` stays false so the
    /// SWMR delay machinery knows no earlier version exists on disk.
    fn load_page(&mut self, page_addr: u64, class: PageClass) -> Result<()> {
        let eof = self.driver.eof()?;
        let skip_read = page_addr >= eof;

        if self.curr_pages >= self.max_pages {
            self.make_space(class)?;
        }

        self.create_new_page(page_addr, self.page_size, class, skip_read)?;
        let page = page_addr / self.page_size as u64;

        if !skip_read {
            let read_result = match self.index.get_mut(page) {
                Some(entry) => self.driver.read(class, page_addr, &mut entry.image),
                None => Err(Error::invariant(format!(
                    "page {page} vanished from index"
                ))),
            };
            if let Err(err) = read_result {
                // Roll back the partially constructed entry
                self.lru.remove(page);
                self.index.remove(page);
                self.curr_pages -= 1;
                if class.is_metadata() {
                    self.curr_md_pages -= 1;
                } else {
                    self.curr_rd_pages -= 1;
                }
                return Err(err);
            }
            self.entry_mut(page)?.loaded = true;
        }

        self.stats.loads += 1;
        trace!(page, skip_read, "loaded page");
        Ok(())
    }

    /// Evict entries until the buffer is below its maximum.
    ///
    /// Walks the LRU tail to head. Candidates on the tick list are
    /// skipped, as are candidates whose class is already at its minimum
    /// reservation (relative to the class being inserted). Dirty
    /// candidates are flushed in place and re-examined; clean ones are
    /// evicted. In SWMR-writer mode the tick and delayed-write lists can
    /// pin enough pages that the buffer stays over its maximum; that
    /// overshoot is accepted.
    fn make_space(&mut self, inserted_class: PageClass) -> Result<()> {
        debug_assert!(self.min_md_pages + self.min_rd_pages <= self.max_pages);
        let inserting_md = inserted_class.is_metadata();

        if inserting_md && self.min_rd_pages == self.max_pages {
            return Err(Error::capacity(
                "cannot make space for metadata: buffer configured for raw data only",
            ));
        }
        if !inserting_md && self.min_md_pages == self.max_pages {
            return Err(Error::capacity(
                "cannot make space for raw data: buffer configured for metadata only",
            ));
        }

        let mut cursor = self.lru.tail();
        while let Some(page) = cursor {
            if self.curr_pages < self.max_pages {
                break;
            }

            let entry = self.entry(page)?;
            let is_meta = entry.class.is_metadata();
            let on_tick_list = entry.modified_this_tick;
            let dirty = entry.is_dirty;

            if on_tick_list {
                self.stats.lru_tl_skips += 1;
                cursor = self.lru.prev_of(page);
            } else if inserting_md && !is_meta && self.curr_rd_pages <= self.min_rd_pages {
                self.stats.lru_rd_skips += 1;
                cursor = self.lru.prev_of(page);
            } else if !inserting_md && is_meta && self.curr_md_pages <= self.min_md_pages {
                self.stats.lru_md_skips += 1;
                cursor = self.lru.prev_of(page);
            } else if dirty {
                // Flush moves the entry to the LRU head; continue from its
                // predecessor, or re-examine it when it was the only entry.
                let pred = self.lru.prev_of(page);
                self.flush_entry(page)?;
                cursor = pred.or(Some(page));
            } else {
                let pred = self.lru.prev_of(page);
                self.evict_entry(page, false)?;
                cursor = pred;
            }
        }

        debug_assert!(cursor.is_none() || self.curr_pages < self.max_pages);
        Ok(())
    }

    /// Write a dirty entry back to the file and mark it clean.
    fn flush_entry(&mut self, page: u64) -> Result<()> {
        let entry = self.entry(page)?;
        debug_assert!(entry.is_dirty);
        if entry.delay_write_until != 0 {
            return Err(Error::invariant(format!(
                "flush of page {page} while its write is delayed"
            )));
        }

        let class = entry.class;
        let addr = entry.addr;
        let size = entry.size as u64;

        // Allocation always covers resident entries
        let eoa = self.driver.eoa(class)?;
        if eoa < addr + size {
            return Err(Error::invariant(format!(
                "entry at {addr:#x}+{size} extends past the end of allocation {eoa:#x}"
            )));
        }

        let Some(entry) = self.index.get(page) else {
            return Err(Error::invariant(format!("page {page} vanished from index")));
        };
        self.driver.write(class, addr, &entry.image)?;

        self.index.set_clean(page);

        let on_lru = self.entry(page)?.on_lru(self.page_size);
        if on_lru {
            self.lru.move_to_head(page);
        }

        self.stats.flushes += 1;
        trace!(page, "flushed entry");
        Ok(())
    }

    /// Remove an entry from the buffer and drop its image.
    ///
    /// Without `force`, the entry must be clean and its class must stay at
    /// or above its minimum reservation. With `force`, a dirty image is
    /// discarded. Entries on the tick or delayed-write lists can never be
    /// evicted; callers detach them first.
    fn evict_entry(&mut self, page: u64, force: bool) -> Result<()> {
        let entry = self.entry(page)?;
        let is_meta = entry.class.is_metadata();
        let mpmde = entry.is_mpmde(self.page_size);
        let dirty = entry.is_dirty;

        if entry.modified_this_tick || entry.delay_write_until != 0 {
            return Err(Error::invariant(format!(
                "eviction of page {page} while on the tick or delayed-write list"
            )));
        }

        if !force {
            if dirty {
                return Err(Error::invariant(format!(
                    "attempt to evict dirty page {page}"
                )));
            }
            if is_meta && self.curr_md_pages < self.min_md_pages {
                return Err(Error::capacity(
                    "eviction would violate the metadata page minimum",
                ));
            }
            if !is_meta && self.curr_rd_pages < self.min_rd_pages {
                return Err(Error::capacity(
                    "eviction would violate the raw data page minimum",
                ));
            }
        } else if dirty {
            self.index.set_clean(page);
        }

        if !mpmde {
            self.lru.remove(page);
        }
        self.index.remove(page);

        self.curr_pages -= 1;
        if mpmde {
            self.mpmde_count -= 1;
        } else if is_meta {
            self.curr_md_pages -= 1;
        } else {
            self.curr_rd_pages -= 1;
        }
        self.stats.evictions += 1;
        trace!(page, force, "evicted entry");
        Ok(())
    }

    /// Mark an entry dirty and place it where its write-back policy says.
    ///
    /// In SWMR-writer mode a metadata entry whose image was loaded from
    /// the file may need its write delayed so readers never see a page
    /// newer than their index; such entries move from the LRU to the
    /// delayed-write list, sorted by decreasing deadline.
    fn mark_entry_dirty(&mut self, page: u64) -> Result<()> {
        let entry = self.entry(page)?;
        let was_dirty = entry.is_dirty;
        let loaded = entry.loaded;
        let is_meta = entry.class.is_metadata();
        let mpmde = entry.is_mpmde(self.page_size);
        let delayed = entry.delay_write_until;

        if !was_dirty {
            self.index.set_dirty(page);
            debug_assert_eq!(delayed, 0);

            let mut delay_until = 0;
            if self.swmr_writer && loaded && is_meta {
                let delta = self.delay_policy.required_delay(page);
                if delta > 0 {
                    delay_until = self.cur_tick + delta;
                }
            }

            if delay_until > 0 {
                if !mpmde {
                    self.lru.remove(page);
                }
                self.entry_mut(page)?.delay_write_until = delay_until;

                let index = &self.index;
                let depth = self.dwl.insert_sorted_desc(page, delay_until, |p| {
                    index.get(p).map_or(0, |e| e.delay_write_until)
                });
                self.stats.dwl_insertions += 1;
                self.stats.dwl_total_depth += depth as u64;
                debug!(page, delay_until, "write delayed");
            } else if !mpmde {
                self.lru.move_to_head(page);
            }
            // A multi-page entry with no delay stays off the LRU; it is
            // flushed and evicted when the tick list is released.
        } else if !mpmde && delayed == 0 {
            self.lru.move_to_head(page);
        }
        Ok(())
    }

    fn insert_in_tick_list(&mut self, page: u64) {
        let Some(entry) = self.index.get_mut(page) else {
            return;
        };
        if !entry.modified_this_tick {
            entry.modified_this_tick = true;
            self.tl.push_tail(page);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;
    use pageio_common::PageBufferConfig;

    const PAGE: usize = 4096;

    /// Delay policy returning a fixed tick delta for every page
    struct FixedDelay(u64);

    impl WriteDelayPolicy for FixedDelay {
        fn required_delay(&self, _page: u64) -> u64 {
            self.0
        }
    }

    fn make_pb(
        max_pages: usize,
        min_meta_pct: u32,
        min_raw_pct: u32,
        writer: bool,
    ) -> PageBuffer<MemoryDriver> {
        let config = PageBufferConfig {
            max_size: max_pages * PAGE,
            page_size: PAGE,
            min_meta_pct,
            min_raw_pct,
            swmr_writer: writer,
            ..Default::default()
        };
        let mut driver = MemoryDriver::new();
        driver
            .set_eoa(PageClass::Metadata, (256 * PAGE) as u64)
            .unwrap();
        PageBuffer::create(driver, &config).unwrap()
    }

    /// Fill the first `pages` pages of the file with a deterministic byte
    /// pattern
    fn prefill(pb: &mut PageBuffer<MemoryDriver>, pages: usize) -> Vec<u8> {
        let data: Vec<u8> = (0..pages * PAGE).map(|i| (i % 251) as u8).collect();
        pb.driver_mut()
            .write(PageClass::RawData, 0, &data)
            .unwrap();
        data
    }

    #[test]
    fn test_create_rounds_size_down_to_page_multiple() {
        let config = PageBufferConfig {
            max_size: 3 * PAGE + 100,
            page_size: PAGE,
            ..Default::default()
        };
        let pb = PageBuffer::create(MemoryDriver::new(), &config).unwrap();
        assert_eq!(pb.max_pages(), 3);
    }

    #[test]
    fn test_create_rejects_size_below_one_page() {
        let config = PageBufferConfig {
            max_size: PAGE / 2,
            page_size: PAGE,
            ..Default::default()
        };
        assert!(matches!(
            PageBuffer::create(MemoryDriver::new(), &config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_small_meta_write_then_read_same_page() {
        let mut pb = make_pb(4, 25, 25, false);

        let pattern: Vec<u8> = (0..64u8).collect();
        pb.write(PageClass::Metadata, 0x2000, &pattern).unwrap();

        let mut buf = [0u8; 64];
        pb.read(PageClass::Metadata, 0x2000, &mut buf).unwrap();
        assert_eq!(&buf[..], &pattern[..]);

        // Exactly one resident page, dirty, nothing on disk yet
        assert!(pb.page_exists(0x2000));
        assert_eq!(pb.curr_pages(), 1);
        assert_eq!(pb.dirty_count(), 1);
        assert!(pb.driver().contents().len() <= 0x2000);

        pb.flush().unwrap();
        assert_eq!(pb.dirty_count(), 0);
        assert_eq!(&pb.driver().contents()[0x2000..0x2040], &pattern[..]);
    }

    #[test]
    fn test_raw_full_page_write_evicts_overlapped_dirty_page() {
        let mut pb = make_pb(4, 0, 0, false);

        // Dirty the page at 0x1000 through a sub-page write
        pb.write(PageClass::RawData, 0x1000, &[0xAAu8; 100]).unwrap();
        assert!(pb.page_exists(0x1000));
        assert_eq!(pb.dirty_count(), 1);

        // Overwrite the whole page
        let full = vec![0xBBu8; PAGE];
        pb.write(PageClass::RawData, 0x1000, &full).unwrap();

        assert!(!pb.page_exists(0x1000));
        assert_eq!(pb.dirty_count(), 0);
        assert_eq!(&pb.driver().contents()[0x1000..0x2000], &full[..]);
    }

    #[test]
    fn test_speculative_then_exact_read_force_evicts() {
        let mut pb = make_pb(4, 0, 0, false);
        let data = prefill(&mut pb, 8);

        // Speculative read loads page 0 and serves from it
        let mut small = [0u8; 64];
        pb.read(PageClass::Metadata, 0, &mut small).unwrap();
        assert_eq!(&small[..], &data[..64]);
        assert!(pb.page_exists(0));

        // Exact re-read at the same address: the entry turned out to be
        // multi-page, so the stale page is dropped and the file serves it
        let mut big = vec![0u8; 4 * PAGE];
        pb.read(PageClass::Metadata, 0, &mut big).unwrap();
        assert_eq!(&big[..], &data[..4 * PAGE]);
        assert!(!pb.page_exists(0));
    }

    #[test]
    fn test_aligned_over_read_clips_to_resident_page() {
        let mut pb = make_pb(4, 0, 0, false);
        let data = prefill(&mut pb, 8);

        let mut small = [0u8; 32];
        pb.read(PageClass::Metadata, 0, &mut small).unwrap();
        // A read elsewhere so the previous-address scalar differs
        pb.read(PageClass::Metadata, PAGE as u64, &mut small).unwrap();

        // Over-read at page 0 with a different previous address: clipped
        // to one page and served from the entry
        let mut big = vec![0xEEu8; 2 * PAGE];
        pb.read(PageClass::Metadata, 0, &mut big).unwrap();
        assert_eq!(&big[..PAGE], &data[..PAGE]);
        assert_eq!(&big[PAGE..], &vec![0xEEu8; PAGE][..]);
        assert!(pb.page_exists(0));
    }

    #[test]
    fn test_aligned_page_sized_read_with_no_entry_bypasses() {
        let mut pb = make_pb(4, 0, 0, false);
        let data = prefill(&mut pb, 4);

        let mut buf = vec![0u8; PAGE];
        pb.read(PageClass::Metadata, 2 * PAGE as u64, &mut buf).unwrap();
        assert_eq!(&buf[..], &data[2 * PAGE..3 * PAGE]);

        // Served from the file without creating an entry
        assert!(!pb.page_exists(2 * PAGE as u64));
        assert_eq!(pb.stats().metadata.bypasses, 1);
    }

    #[test]
    fn test_eviction_honors_class_minimums() {
        let mut pb = make_pb(4, 25, 25, false);
        let mut buf = [0u8; 16];

        // One metadata page first (LRU tail), then three raw pages
        let meta_addr = 3 * PAGE as u64;
        pb.read(PageClass::Metadata, meta_addr, &mut buf).unwrap();
        for page in 0..3u64 {
            pb.read(PageClass::RawData, page * PAGE as u64 + 8, &mut buf)
                .unwrap();
        }
        assert_eq!(pb.curr_pages(), 4);

        // A fifth (raw) insertion must evict a raw page, never the single
        // metadata page
        pb.read(PageClass::RawData, 4 * PAGE as u64 + 8, &mut buf)
            .unwrap();

        assert_eq!(pb.curr_pages(), 4);
        assert!(pb.page_exists(meta_addr));
        assert!(!pb.page_exists(0));
        assert_eq!(pb.curr_md_pages(), 1);
        assert_eq!(pb.curr_rd_pages(), 3);
        assert!(pb.stats().lru_md_skips >= 1);
    }

    #[test]
    fn test_delayed_write_lifecycle() {
        let mut pb = make_pb(4, 0, 0, true);
        prefill(&mut pb, 8);
        pb.set_tick(1).unwrap();
        pb.set_delay_policy(Box::new(FixedDelay(3)));

        // Load page 2 from the file so the delay machinery applies
        let addr = 2 * PAGE as u64;
        let mut buf = [0u8; 32];
        pb.read(PageClass::Metadata, addr, &mut buf).unwrap();
        assert_eq!(pb.lru_len(), 1);

        pb.write(PageClass::Metadata, addr, &[0x11u8; 32]).unwrap();

        // Dirtying moved the entry from the LRU to the delayed-write list
        // and onto the tick list
        assert_eq!(pb.lru_len(), 0);
        assert_eq!(pb.delayed_write_len(), 1);
        assert_eq!(pb.tick_list_len(), 1);

        // Flushing is refused while the delay is outstanding
        assert!(matches!(pb.flush(), Err(Error::Invariant(_))));

        // Ticks 2..=4: the deadline (tick 4) has not passed yet
        pb.release_tick_list().unwrap();
        for tick in 2..=4 {
            pb.set_tick(tick).unwrap();
            pb.release_delayed_writes().unwrap();
            assert_eq!(pb.delayed_write_len(), 1, "still delayed at tick {tick}");
        }

        // Tick 5: released back onto the LRU and flushable again
        pb.set_tick(5).unwrap();
        pb.release_delayed_writes().unwrap();
        assert_eq!(pb.delayed_write_len(), 0);
        assert_eq!(pb.lru_len(), 1);

        pb.flush().unwrap();
        assert_eq!(pb.dirty_count(), 0);
        assert_eq!(
            &pb.driver().contents()[2 * PAGE..2 * PAGE + 32],
            &[0x11u8; 32]
        );
    }

    #[test]
    fn test_unaligned_meta_read_clips_to_page_end() {
        let mut pb = make_pb(4, 0, 0, false);
        let data = prefill(&mut pb, 4);

        let mut buf = vec![0u8; 200];
        pb.read(PageClass::Metadata, 4000, &mut buf).unwrap();

        // Only the 96 bytes up to the page boundary are served
        assert_eq!(&buf[..96], &data[4000..4096]);
        assert_eq!(&buf[96..], &vec![0u8; 104][..]);
        assert!(pb.page_exists(0));
        assert!(!pb.page_exists(PAGE as u64));
    }

    #[test]
    fn test_meta_write_crossing_page_boundary_rejected() {
        let mut pb = make_pb(4, 0, 0, false);
        let err = pb
            .write(PageClass::Metadata, 4000, &[0u8; 200])
            .unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
    }

    #[test]
    fn test_raw_subpage_read_spans_two_pages() {
        let mut pb = make_pb(4, 0, 0, false);
        let data = prefill(&mut pb, 4);

        let addr = PAGE as u64 - 8;
        let mut buf = [0u8; 16];
        pb.read(PageClass::RawData, addr, &mut buf).unwrap();

        assert_eq!(&buf[..], &data[PAGE - 8..PAGE + 8]);
        // Touched exactly the two pages around the boundary
        assert!(pb.page_exists(0));
        assert!(pb.page_exists(PAGE as u64));
        assert_eq!(pb.curr_pages(), 2);
    }

    #[test]
    fn test_raw_large_read_overlays_dirty_pages() {
        let mut pb = make_pb(4, 0, 0, false);
        let data = prefill(&mut pb, 4);

        // Dirty part of page 1 in the buffer only
        pb.write(PageClass::RawData, PAGE as u64 + 100, &[0xCCu8; 50])
            .unwrap();

        let mut buf = vec![0u8; 3 * PAGE];
        pb.read(PageClass::RawData, 0, &mut buf).unwrap();

        // The buffered update wins over the file contents
        assert_eq!(&buf[..PAGE], &data[..PAGE]);
        assert_eq!(&buf[PAGE + 100..PAGE + 150], &[0xCCu8; 50]);
        assert_eq!(&buf[PAGE + 150..2 * PAGE], &data[PAGE + 150..2 * PAGE]);
        assert_eq!(&buf[2 * PAGE..], &data[2 * PAGE..3 * PAGE]);
    }

    #[test]
    fn test_raw_large_write_patches_partially_covered_pages() {
        let mut pb = make_pb(4, 0, 0, false);
        prefill(&mut pb, 4);

        // Make pages 0 and 1 resident
        let mut buf = [0u8; 8];
        pb.read(PageClass::RawData, 8, &mut buf).unwrap();
        pb.read(PageClass::RawData, PAGE as u64 + 8, &mut buf).unwrap();

        // A page-sized write covering the back half of page 0 and the
        // front half of page 1
        let payload = vec![0xDDu8; PAGE];
        pb.write(PageClass::RawData, PAGE as u64 / 2, &payload).unwrap();

        // Both pages were patched in place and stay resident dirty
        assert!(pb.page_exists(0));
        assert!(pb.page_exists(PAGE as u64));
        assert_eq!(pb.dirty_count(), 2);

        let mut readback = vec![0u8; PAGE];
        pb.read(PageClass::RawData, PAGE as u64 / 2, &mut readback)
            .unwrap();
        assert_eq!(readback, payload);
    }

    #[test]
    fn test_add_new_page_may_overshoot_until_next_load() {
        let mut pb = make_pb(4, 0, 0, false);

        for page in 0..5u64 {
            pb.add_new_page(PageClass::RawData, page * PAGE as u64)
                .unwrap();
        }
        // Insertion never makes space, so the maximum is exceeded
        assert_eq!(pb.curr_pages(), 5);

        // The next load brings the buffer back under its maximum
        let mut buf = [0u8; 8];
        pb.read(PageClass::RawData, 6 * PAGE as u64, &mut buf).unwrap();
        assert!(pb.curr_pages() <= pb.max_pages());
    }

    #[test]
    fn test_add_new_page_rejects_duplicate() {
        let mut pb = make_pb(4, 0, 0, false);
        pb.add_new_page(PageClass::Metadata, 0).unwrap();
        assert!(pb.add_new_page(PageClass::Metadata, 0).is_err());
    }

    #[test]
    fn test_flush_is_idempotent() {
        let mut pb = make_pb(4, 0, 0, false);

        pb.write(PageClass::Metadata, 0, &[1u8; 10]).unwrap();
        pb.write(PageClass::RawData, PAGE as u64, &[2u8; 10]).unwrap();
        assert_eq!(pb.dirty_count(), 2);

        pb.flush().unwrap();
        assert_eq!(pb.dirty_count(), 0);
        assert_eq!(pb.curr_pages(), 2);

        let flushes = pb.stats().flushes;
        pb.flush().unwrap();
        assert_eq!(pb.stats().flushes, flushes);
    }

    #[test]
    fn test_close_flushes_and_releases_everything() {
        let mut pb = make_pb(4, 0, 0, true);
        prefill(&mut pb, 8);
        pb.set_tick(1).unwrap();
        pb.set_delay_policy(Box::new(FixedDelay(5)));

        // A delayed metadata page and a plain dirty raw page
        let mut buf = [0u8; 16];
        pb.read(PageClass::Metadata, 0, &mut buf).unwrap();
        pb.write(PageClass::Metadata, 0, &[0x21u8; 16]).unwrap();
        pb.write(PageClass::RawData, 3 * PAGE as u64, &[0x22u8; 16])
            .unwrap();
        assert_eq!(pb.delayed_write_len(), 1);

        let driver = pb.close().unwrap();
        assert_eq!(&driver.contents()[..16], &[0x21u8; 16]);
        assert_eq!(&driver.contents()[3 * PAGE..3 * PAGE + 16], &[0x22u8; 16]);
    }

    #[test]
    fn test_remove_entry_detaches_from_all_lists() {
        let mut pb = make_pb(4, 0, 0, true);
        prefill(&mut pb, 8);
        pb.set_tick(1).unwrap();
        pb.set_delay_policy(Box::new(FixedDelay(4)));

        let addr = PAGE as u64;
        let mut buf = [0u8; 16];
        pb.read(PageClass::Metadata, addr, &mut buf).unwrap();
        pb.write(PageClass::Metadata, addr, &[9u8; 16]).unwrap();
        assert_eq!(pb.tick_list_len(), 1);
        assert_eq!(pb.delayed_write_len(), 1);

        pb.remove_entry(addr).unwrap();
        assert!(!pb.page_exists(addr));
        assert_eq!(pb.tick_list_len(), 0);
        assert_eq!(pb.delayed_write_len(), 0);
        assert_eq!(pb.lru_len(), 0);

        // The discarded image was never written back
        let mut readback = [0u8; 16];
        pb.driver_mut()
            .read(PageClass::Metadata, addr, &mut readback)
            .unwrap();
        assert_ne!(&readback, &[9u8; 16]);
    }

    #[test]
    fn test_update_entry_patches_without_dirtying() {
        let mut pb = make_pb(4, 0, 0, false);
        prefill(&mut pb, 4);

        let mut buf = [0u8; 32];
        pb.read(PageClass::Metadata, 0, &mut buf).unwrap();
        assert_eq!(pb.dirty_count(), 0);

        pb.update_entry(16, &[0x5Au8; 8]).unwrap();
        assert_eq!(pb.dirty_count(), 0);

        let mut readback = [0u8; 8];
        pb.read(PageClass::Metadata, 16, &mut readback).unwrap();
        assert_eq!(&readback, &[0x5Au8; 8]);
    }

    #[test]
    fn test_excluded_class_bypasses_to_driver() {
        // The whole buffer is reserved for metadata; raw traffic bypasses
        let mut pb = make_pb(4, 100, 0, false);

        pb.write(PageClass::RawData, 0, &[7u8; 32]).unwrap();
        assert_eq!(pb.curr_pages(), 0);
        assert_eq!(&pb.driver().contents()[..32], &[7u8; 32]);

        let mut buf = [0u8; 32];
        pb.read(PageClass::RawData, 0, &mut buf).unwrap();
        assert_eq!(&buf, &[7u8; 32]);
        assert_eq!(pb.stats().raw.bypasses, 2);
    }

    #[test]
    fn test_mpmde_write_and_read_roundtrip() {
        let mut pb = make_pb(4, 0, 0, true);
        pb.set_tick(1).unwrap();

        let addr = 4 * PAGE as u64;
        let payload: Vec<u8> = (0..2 * PAGE).map(|i| (i % 241) as u8).collect();
        pb.write(PageClass::Metadata, addr, &payload).unwrap();

        assert_eq!(pb.mpmde_count(), 1);
        assert_eq!(pb.lru_len(), 0);
        assert_eq!(pb.tick_list_len(), 1);

        let mut buf = vec![0u8; 2 * PAGE];
        pb.read(PageClass::Metadata, addr, &mut buf).unwrap();
        assert_eq!(buf, payload);

        // An over-read is clipped to the entry size
        let mut over = vec![0xEEu8; 3 * PAGE];
        pb.read(PageClass::Metadata, addr, &mut over).unwrap();
        assert_eq!(&over[..2 * PAGE], &payload[..]);
        assert_eq!(&over[2 * PAGE..], &vec![0xEEu8; PAGE][..]);

        // An aligned sub-page read is served from the entry's first bytes
        let mut head = [0u8; 64];
        pb.read(PageClass::Metadata, addr, &mut head).unwrap();
        assert_eq!(&head[..], &payload[..64]);
    }

    #[test]
    fn test_large_meta_write_bypasses_outside_writer_mode() {
        let mut pb = make_pb(4, 0, 0, false);

        let payload = vec![0x33u8; 2 * PAGE];
        pb.write(PageClass::Metadata, 0, &payload).unwrap();

        assert_eq!(pb.curr_pages(), 0);
        assert_eq!(pb.mpmde_count(), 0);
        assert_eq!(&pb.driver().contents()[..2 * PAGE], &payload[..]);
    }

    #[test]
    fn test_page_sized_meta_write_is_buffered_outside_writer_mode() {
        let mut pb = make_pb(4, 0, 0, false);

        // Exactly one page: only writes larger than a page bypass
        let payload = vec![0x44u8; PAGE];
        pb.write(PageClass::Metadata, PAGE as u64, &payload).unwrap();

        assert!(pb.page_exists(PAGE as u64));
        assert_eq!(pb.curr_pages(), 1);
        assert_eq!(pb.dirty_count(), 1);
        assert_eq!(pb.stats().metadata.bypasses, 0);
        assert!(pb.driver().contents().len() <= PAGE);

        let mut readback = vec![0u8; PAGE];
        pb.read(PageClass::Metadata, PAGE as u64, &mut readback).unwrap();
        assert_eq!(readback, payload);

        pb.flush().unwrap();
        assert_eq!(&pb.driver().contents()[PAGE..2 * PAGE], &payload[..]);
    }

    #[test]
    fn test_set_tick_must_advance_by_one() {
        let mut pb = make_pb(4, 0, 0, true);
        assert!(pb.set_tick(2).is_err());
        pb.set_tick(1).unwrap();
        assert!(pb.set_tick(3).is_err());
        pb.set_tick(2).unwrap();
        assert_eq!(pb.current_tick(), 2);
    }

    #[test]
    fn test_tick_operations_require_writer_mode() {
        let mut pb = make_pb(4, 0, 0, false);
        assert!(pb.set_tick(1).is_err());
        assert!(pb.release_tick_list().is_err());
        assert!(pb.release_delayed_writes().is_err());
    }

    #[test]
    fn test_page_accounting_invariant() {
        let mut pb = make_pb(8, 0, 0, true);
        prefill(&mut pb, 8);
        pb.set_tick(1).unwrap();

        let mut buf = [0u8; 16];
        pb.read(PageClass::Metadata, 0, &mut buf).unwrap();
        pb.read(PageClass::RawData, PAGE as u64 + 4, &mut buf).unwrap();
        pb.write(PageClass::Metadata, 16 * PAGE as u64, &vec![1u8; 2 * PAGE])
            .unwrap();

        assert_eq!(
            pb.curr_md_pages() + pb.curr_rd_pages(),
            pb.curr_pages() - pb.mpmde_count()
        );
    }
}

