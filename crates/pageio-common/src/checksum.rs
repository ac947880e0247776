//! Checksum utilities for pageio
//!
//! Every persisted record (metadata-file header, index, published page
//! images) carries a CRC32C over its payload so readers can detect torn
//! writes without locks.

/// Quick CRC32C computation
#[inline]
#[must_use]
pub fn compute_crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Quick CRC32C verification
#[inline]
#[must_use]
pub fn verify_crc32c(data: &[u8], expected: u32) -> bool {
    crc32c::crc32c(data) == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_verify() {
        let data = b"hello, world!";
        let sum = compute_crc32c(data);

        assert!(verify_crc32c(data, sum));

        // Corrupted data should fail
        let corrupted = b"hello, world?";
        assert!(!verify_crc32c(corrupted, sum));
    }

    #[test]
    fn test_checksum_empty() {
        assert!(verify_crc32c(b"", compute_crc32c(b"")));
    }
}
