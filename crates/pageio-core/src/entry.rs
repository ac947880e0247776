//! In-memory page buffer entries
//!
//! An entry holds the image of either a single page or a multi-page
//! metadata entry (MPMDE). Raw data is always managed in single pages;
//! only metadata in SWMR-writer mode may span multiple pages.

/// Access class of a request or a resident entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageClass {
    /// File metadata: always read and written atomically by the layer above
    Metadata,
    /// Raw data: may be accessed at arbitrary offsets and lengths
    RawData,
}

impl PageClass {
    /// True for the metadata class
    #[must_use]
    pub fn is_metadata(self) -> bool {
        matches!(self, PageClass::Metadata)
    }
}

/// One resident page or multi-page metadata entry
#[derive(Debug)]
pub struct PageEntry {
    /// Page number: `addr / page_size`
    pub page: u64,
    /// Absolute byte offset, always a page multiple
    pub addr: u64,
    /// Image length: the page size, or a larger page multiple for an MPMDE
    pub size: usize,
    /// Owned image of exactly `size` bytes
    pub image: Vec<u8>,
    /// Access class this entry was created under
    pub class: PageClass,
    /// True when the image differs from the file (or was never written)
    pub is_dirty: bool,
    /// True when the image was filled from the file; false for pages that
    /// were freshly allocated or write-created
    pub loaded: bool,
    /// True while the entry sits on the current tick list
    pub modified_this_tick: bool,
    /// Tick before which the entry must not be written back; 0 = no delay
    pub delay_write_until: u64,
}

impl PageEntry {
    /// Create a new entry with an image of `size` bytes.
    ///
    /// The image is zeroed when `clean_image` is set; callers that overwrite
    /// the whole image immediately pass `false` and still get a zeroed
    /// buffer (uninitialized page images are never exposed).
    pub(crate) fn new(
        page: u64,
        addr: u64,
        size: usize,
        class: PageClass,
        _clean_image: bool,
    ) -> Self {
        Self {
            page,
            addr,
            size,
            image: vec![0u8; size],
            class,
            is_dirty: false,
            loaded: false,
            modified_this_tick: false,
            delay_write_until: 0,
        }
    }

    /// True for a multi-page metadata entry
    #[must_use]
    pub fn is_mpmde(&self, page_size: usize) -> bool {
        self.class.is_metadata() && self.size > page_size
    }

    /// True when the entry may sit on the LRU: single pages not subject to
    /// a delayed write
    #[must_use]
    pub fn on_lru(&self, page_size: usize) -> bool {
        !self.is_mpmde(page_size) && self.delay_write_until == 0
    }
}
