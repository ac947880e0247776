//! Shared metadata-file layout
//!
//! The writer publishes metadata to readers through a separate file that is
//! updated without locks. Readers detect torn states via magic numbers and
//! CRC32C checksums on every record, and via the tick number carried by
//! both the header and the index.
//!
//! File layout:
//! ```text
//! +------------------+  offset 0
//! |   Header (36B)   |  magic, page size, tick, index offset/length, CRC
//! +------------------+  offset HEADER_SIZE
//! |   Index          |  magic, tick, entry table, CRC
//! +------------------+  md_pages_reserved * page_size
//! |   Page images    |  published page / multi-page entry images
//! +------------------+
//! ```
//!
//! Record formats (all integers little-endian):
//! ```text
//! HEADER: | "VHDR" | fs_page_size u32 | tick u64 | index_offset u64 |
//!         | index_length u64 | checksum u32 |
//! INDEX:  | "VIDX" | tick u64 | num_entries u32 | entries[] | checksum u32 |
//! ENTRY:  | data_page u32 | md_page u32 | length u32 | checksum u32 |
//! ```

use bytes::{Buf, BufMut, BytesMut};
use pageio_common::{compute_crc32c, Error, Result};

/// Magic number identifying the metadata-file header
pub const HEADER_MAGIC: [u8; 4] = *b"VHDR";

/// Magic number identifying the metadata-file index
pub const INDEX_MAGIC: [u8; 4] = *b"VIDX";

/// Encoded header size in bytes
pub const HEADER_SIZE: usize = 36;

/// Encoded size of one index entry in bytes
pub const INDEX_ENTRY_SIZE: usize = 16;

/// Fixed part of the encoded index (magic + tick + count + checksum)
pub const INDEX_FIXED_SIZE: usize = 20;

/// Metadata-file header
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetadataFileHeader {
    /// Page size of the data file
    pub fs_page_size: u32,
    /// Tick this header was published at
    pub tick_num: u64,
    /// Byte offset of the index record
    pub index_offset: u64,
    /// Encoded length of the index record
    pub index_length: u64,
}

impl MetadataFileHeader {
    /// Offset of the checksum field: magic(4) + fs_page_size(4) + tick(8) +
    /// index_offset(8) + index_length(8) = 32
    const CHECKSUM_OFFSET: usize = 32;

    /// Serialize the header, computing its checksum
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        buf.put_slice(&HEADER_MAGIC);
        buf.put_u32_le(self.fs_page_size);
        buf.put_u64_le(self.tick_num);
        buf.put_u64_le(self.index_offset);
        buf.put_u64_le(self.index_length);

        let checksum = compute_crc32c(&buf[..Self::CHECKSUM_OFFSET]);
        buf.put_u32_le(checksum);
        buf.to_vec()
    }

    /// Parse and verify a header
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::corrupt("metadata-file header too small"));
        }

        let mut buf = &data[..HEADER_SIZE];

        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != HEADER_MAGIC {
            return Err(Error::corrupt("invalid metadata-file header magic"));
        }

        let fs_page_size = buf.get_u32_le();
        let tick_num = buf.get_u64_le();
        let index_offset = buf.get_u64_le();
        let index_length = buf.get_u64_le();
        let stored_checksum = buf.get_u32_le();

        let computed = compute_crc32c(&data[..Self::CHECKSUM_OFFSET]);
        if computed != stored_checksum {
            return Err(Error::corrupt(format!(
                "metadata-file header checksum mismatch: computed={computed:#010x}, stored={stored_checksum:#010x}"
            )));
        }

        Ok(Self {
            fs_page_size,
            tick_num,
            index_offset,
            index_length,
        })
    }
}

/// One published page in the metadata-file index
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    /// Page number in the data file
    pub data_page: u32,
    /// Page number of the image inside the metadata file
    pub md_page: u32,
    /// Image length in bytes (a page, or a page multiple for a multi-page
    /// metadata entry)
    pub length: u32,
    /// CRC32C over the image as laid out in the metadata file
    pub checksum: u32,
}

/// Metadata-file index record
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetadataFileIndex {
    /// Tick this index was published at
    pub tick_num: u64,
    /// Published entries, sorted by `data_page`
    pub entries: Vec<IndexEntry>,
}

impl MetadataFileIndex {
    /// Encoded length of an index with `num_entries` entries
    #[must_use]
    pub fn encoded_len(num_entries: usize) -> usize {
        INDEX_FIXED_SIZE + num_entries * INDEX_ENTRY_SIZE
    }

    /// Serialize the index, computing its checksum
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(Self::encoded_len(self.entries.len()));
        buf.put_slice(&INDEX_MAGIC);
        buf.put_u64_le(self.tick_num);
        buf.put_u32_le(self.entries.len() as u32);
        for entry in &self.entries {
            buf.put_u32_le(entry.data_page);
            buf.put_u32_le(entry.md_page);
            buf.put_u32_le(entry.length);
            buf.put_u32_le(entry.checksum);
        }

        let checksum = compute_crc32c(&buf);
        buf.put_u32_le(checksum);
        buf.to_vec()
    }

    /// Parse and verify an index record
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < INDEX_FIXED_SIZE {
            return Err(Error::corrupt("metadata-file index too small"));
        }

        let mut buf = &data[..];

        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != INDEX_MAGIC {
            return Err(Error::corrupt("invalid metadata-file index magic"));
        }

        let tick_num = buf.get_u64_le();
        let num_entries = buf.get_u32_le() as usize;

        let total = Self::encoded_len(num_entries);
        if data.len() < total {
            return Err(Error::corrupt(format!(
                "metadata-file index truncated: need {total} bytes, have {}",
                data.len()
            )));
        }

        let mut entries = Vec::with_capacity(num_entries);
        for _ in 0..num_entries {
            entries.push(IndexEntry {
                data_page: buf.get_u32_le(),
                md_page: buf.get_u32_le(),
                length: buf.get_u32_le(),
                checksum: buf.get_u32_le(),
            });
        }
        let stored_checksum = buf.get_u32_le();

        let computed = compute_crc32c(&data[..total - 4]);
        if computed != stored_checksum {
            return Err(Error::corrupt(format!(
                "metadata-file index checksum mismatch: computed={computed:#010x}, stored={stored_checksum:#010x}"
            )));
        }

        Ok(Self { tick_num, entries })
    }

    /// Binary search on `data_page`
    #[must_use]
    pub fn lookup(&self, data_page: u64) -> Option<&IndexEntry> {
        self.entries
            .binary_search_by_key(&data_page, |e| u64::from(e.data_page))
            .ok()
            .map(|pos| &self.entries[pos])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> MetadataFileHeader {
        MetadataFileHeader {
            fs_page_size: 4096,
            tick_num: 17,
            index_offset: HEADER_SIZE as u64,
            index_length: MetadataFileIndex::encoded_len(2) as u64,
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let header = sample_header();
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);

        let decoded = MetadataFileHeader::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut bytes = sample_header().to_bytes();
        bytes[0] = b'X';
        assert!(MetadataFileHeader::from_bytes(&bytes)
            .unwrap_err()
            .is_corrupt());
    }

    #[test]
    fn test_header_rejects_bad_checksum() {
        let mut bytes = sample_header().to_bytes();
        // Flip a payload byte after the magic
        bytes[6] ^= 0xFF;
        assert!(MetadataFileHeader::from_bytes(&bytes)
            .unwrap_err()
            .is_corrupt());
    }

    fn sample_index() -> MetadataFileIndex {
        MetadataFileIndex {
            tick_num: 17,
            entries: vec![
                IndexEntry {
                    data_page: 2,
                    md_page: 1,
                    length: 4096,
                    checksum: 0xDEAD,
                },
                IndexEntry {
                    data_page: 9,
                    md_page: 2,
                    length: 8192,
                    checksum: 0xBEEF,
                },
            ],
        }
    }

    #[test]
    fn test_index_roundtrip() {
        let index = sample_index();
        let bytes = index.to_bytes();
        assert_eq!(bytes.len(), MetadataFileIndex::encoded_len(2));

        let decoded = MetadataFileIndex::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, index);
    }

    #[test]
    fn test_empty_index_roundtrip() {
        let index = MetadataFileIndex {
            tick_num: 1,
            entries: vec![],
        };
        let decoded = MetadataFileIndex::from_bytes(&index.to_bytes()).unwrap();
        assert_eq!(decoded, index);
    }

    #[test]
    fn test_index_rejects_corruption() {
        let mut bytes = sample_index().to_bytes();
        bytes[INDEX_FIXED_SIZE] ^= 0x01;
        assert!(MetadataFileIndex::from_bytes(&bytes)
            .unwrap_err()
            .is_corrupt());

        let mut bytes = sample_index().to_bytes();
        bytes[0] = b'?';
        assert!(MetadataFileIndex::from_bytes(&bytes)
            .unwrap_err()
            .is_corrupt());
    }

    #[test]
    fn test_index_lookup() {
        let index = sample_index();
        assert_eq!(index.lookup(9).unwrap().md_page, 2);
        assert!(index.lookup(3).is_none());
    }
}
