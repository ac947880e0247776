//! Page buffer statistics
//!
//! Plain counters; the engine mutates them under `&mut self`, so no
//! synchronization is needed.

use crate::entry::PageClass;

/// Per-class access counters
#[derive(Debug, Default, Clone, Copy)]
pub struct ClassStats {
    /// Requests routed through the page buffer
    pub accesses: u64,
    /// Requests satisfied from a resident entry
    pub hits: u64,
    /// Requests that missed the cache
    pub misses: u64,
    /// Requests passed straight to the file driver
    pub bypasses: u64,
    /// Bytes passed straight to the file driver
    pub bypassed_bytes: u64,
}

/// Counters maintained by the page buffer engine
#[derive(Debug, Default, Clone, Copy)]
pub struct PageBufferStats {
    /// Metadata access counters
    pub metadata: ClassStats,
    /// Raw data access counters
    pub raw: ClassStats,
    /// Pages loaded from the file
    pub loads: u64,
    /// Entries inserted into the index
    pub insertions: u64,
    /// Entries evicted from the index
    pub evictions: u64,
    /// Dirty entries written back
    pub flushes: u64,
    /// LRU scan skips: candidate was on the tick list
    pub lru_tl_skips: u64,
    /// LRU scan skips: metadata candidate protected by the minimum
    pub lru_md_skips: u64,
    /// LRU scan skips: raw candidate protected by the minimum
    pub lru_rd_skips: u64,
    /// Entries placed on the delayed-write list
    pub dwl_insertions: u64,
    /// Cumulative insertion depth into the delayed-write list
    pub dwl_total_depth: u64,
}

impl PageBufferStats {
    /// Counters for one access class
    #[must_use]
    pub fn class(&self, class: PageClass) -> &ClassStats {
        match class {
            PageClass::Metadata => &self.metadata,
            PageClass::RawData => &self.raw,
        }
    }

    pub(crate) fn class_mut(&mut self, class: PageClass) -> &mut ClassStats {
        match class {
            PageClass::Metadata => &mut self.metadata,
            PageClass::RawData => &mut self.raw,
        }
    }

    pub(crate) fn record_access(&mut self, class: PageClass, hit: bool) {
        let stats = self.class_mut(class);
        stats.accesses += 1;
        if hit {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
    }

    pub(crate) fn record_bypass(&mut self, class: PageClass, bytes: usize) {
        let stats = self.class_mut(class);
        stats.bypasses += 1;
        stats.bypassed_bytes += bytes as u64;
    }

    /// Hit ratio over both classes (0.0 to 1.0)
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.metadata.hits + self.raw.hits;
        let total = self.metadata.accesses + self.raw.accesses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    /// Reset all counters
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_ratio() {
        let mut stats = PageBufferStats::default();
        stats.record_access(PageClass::Metadata, true);
        stats.record_access(PageClass::Metadata, false);
        stats.record_access(PageClass::RawData, true);
        stats.record_access(PageClass::RawData, true);

        assert!((stats.hit_ratio() - 0.75).abs() < 1e-9);
        assert_eq!(stats.class(PageClass::Metadata).misses, 1);
    }

    #[test]
    fn test_reset() {
        let mut stats = PageBufferStats::default();
        stats.record_bypass(PageClass::RawData, 8192);
        assert_eq!(stats.raw.bypassed_bytes, 8192);

        stats.reset();
        assert_eq!(stats.raw.bypasses, 0);
        assert_eq!(stats.hit_ratio(), 0.0);
    }
}
