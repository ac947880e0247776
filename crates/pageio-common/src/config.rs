//! Configuration types for pageio
//!
//! The page buffer is configured through a plain record rather than argv.
//! Sizes are expressed in bytes; the buffer capacity must work out to a
//! whole number of pages.

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};

/// Page buffer configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PageBufferConfig {
    /// Total capacity in bytes; rounded down to a page multiple when larger
    /// than one page
    pub max_size: usize,
    /// Page size in bytes, fixed by the file's page allocation strategy
    pub page_size: usize,
    /// Minimum share of pages reserved for metadata, percent (0..=100)
    pub min_meta_pct: u32,
    /// Minimum share of pages reserved for raw data, percent (0..=100)
    pub min_raw_pct: u32,
    /// True when the file is open read/write under SWMR configuration
    pub swmr_writer: bool,
    /// Pages at the start of the metadata file reserved for header + index
    pub md_pages_reserved: usize,
    /// Retry bounds for the reader-side decoder
    pub retry: RetryBounds,
}

impl Default for PageBufferConfig {
    fn default() -> Self {
        Self {
            max_size: 64 * 4096,
            page_size: 4096,
            min_meta_pct: 0,
            min_raw_pct: 0,
            swmr_writer: false,
            md_pages_reserved: 1,
            retry: RetryBounds::default(),
        }
    }
}

impl PageBufferConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(Error::config("page size must be nonzero"));
        }
        if self.max_size == 0 {
            return Err(Error::config("page buffer size must be nonzero"));
        }
        if self.min_meta_pct > 100 {
            return Err(Error::config(format!(
                "min_meta_pct {} out of range 0..=100",
                self.min_meta_pct
            )));
        }
        if self.min_raw_pct > 100 {
            return Err(Error::config(format!(
                "min_raw_pct {} out of range 0..=100",
                self.min_raw_pct
            )));
        }
        if self.min_meta_pct + self.min_raw_pct > 100 {
            return Err(Error::config(format!(
                "min_meta_pct {} + min_raw_pct {} exceeds 100",
                self.min_meta_pct, self.min_raw_pct
            )));
        }
        if self.md_pages_reserved == 0 {
            return Err(Error::config("md_pages_reserved must be at least 1"));
        }
        Ok(())
    }
}

/// Retry bounds for the four reader-side retry loops
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct RetryBounds {
    /// Waiting for the metadata file to reach the expected size
    pub file_stat: RetryPolicy,
    /// Re-reading the metadata-file header after a magic/checksum mismatch
    pub header: RetryPolicy,
    /// Re-reading the metadata-file index after a magic/checksum mismatch
    pub index: RetryPolicy,
    /// Re-reading a published page image after a checksum mismatch
    pub entry_page: RetryPolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PageBufferConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.page_size, 4096);
    }

    #[test]
    fn test_rejects_zero_page_size() {
        let config = PageBufferConfig {
            page_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_percentages_over_100() {
        let config = PageBufferConfig {
            min_meta_pct: 60,
            min_raw_pct: 50,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = PageBufferConfig {
            min_meta_pct: 101,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_zero_reserved_pages() {
        let config = PageBufferConfig {
            md_pages_reserved: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
