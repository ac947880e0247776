//! Ordered entry lists
//!
//! The engine tracks entries on up to three lists at once: the LRU
//! (replacement order), the tick list (modified this tick), and the
//! delayed-write list (sorted by decreasing deadline). Entries are owned by
//! the index; the lists hold page numbers only, so there are no back
//! pointers to keep consistent.

/// Ordered list of page numbers, head first
#[derive(Debug, Default)]
pub struct EntryList {
    pages: Vec<u64>,
}

impl EntryList {
    /// Create an empty list
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries on the list
    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// True when the list is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// True when `page` is on the list
    #[must_use]
    pub fn contains(&self, page: u64) -> bool {
        self.pages.contains(&page)
    }

    /// Page at the head, if any
    #[must_use]
    pub fn head(&self) -> Option<u64> {
        self.pages.first().copied()
    }

    /// Page at the tail, if any
    #[must_use]
    pub fn tail(&self) -> Option<u64> {
        self.pages.last().copied()
    }

    /// Insert at the head
    pub fn push_head(&mut self, page: u64) {
        debug_assert!(!self.contains(page));
        self.pages.insert(0, page);
    }

    /// Insert at the tail
    pub fn push_tail(&mut self, page: u64) {
        debug_assert!(!self.contains(page));
        self.pages.push(page);
    }

    /// Remove `page` from the list; returns false when it was not present
    pub fn remove(&mut self, page: u64) -> bool {
        match self.pages.iter().position(|&p| p == page) {
            Some(pos) => {
                self.pages.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Move `page` to the head (most recently used position)
    pub fn move_to_head(&mut self, page: u64) {
        if self.remove(page) {
            self.pages.insert(0, page);
        }
    }

    /// Neighbor of `page` toward the head, if any
    #[must_use]
    pub fn prev_of(&self, page: u64) -> Option<u64> {
        let pos = self.pages.iter().position(|&p| p == page)?;
        if pos == 0 {
            None
        } else {
            Some(self.pages[pos - 1])
        }
    }

    /// Insert maintaining decreasing order of the key returned by `key_of`.
    ///
    /// Existing entries with a key greater than or equal to `key` stay
    /// toward the head. Returns the insertion depth from the head, which the
    /// engine records for statistics.
    pub fn insert_sorted_desc(&mut self, page: u64, key: u64, key_of: impl Fn(u64) -> u64) -> usize {
        debug_assert!(!self.contains(page));
        let pos = self
            .pages
            .iter()
            .position(|&p| key_of(p) < key)
            .unwrap_or(self.pages.len());
        self.pages.insert(pos, page);
        pos
    }

    /// Iterate head to tail
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.pages.iter().copied()
    }
}
