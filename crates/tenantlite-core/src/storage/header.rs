use crate::error::StorageError;
use crate::types::{HEADER_SIZE, is_valid_page_size};

/// Magic bytes at the start of every SQLite database file.
pub const MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// The 100-byte SQLite database header stored at the start of page 0.
///
/// All multi-byte fields are big-endian:
/// ```text
/// [0..16]   magic: "SQLite format 3\0"
/// [16..18]  page_size: u16 (1 means 65536)
/// [18]      write_version
/// [19]      read_version
/// [20]      reserved_space
/// [21..24]  max/min embedded payload fraction, leaf payload fraction
/// [24..28]  change_counter: u32
/// [28..32]  total_pages: u32
/// [32..36]  first freelist trunk page: u32
/// [36..40]  freelist page count: u32
/// [40..44]  schema_cookie: u32
/// [44..48]  schema_format: u32
/// [48..52]  default cache size: u32
/// [52..56]  largest root b-tree page: u32
/// [56..60]  text_encoding: u32
/// [60..64]  user_version: u32
/// [64..68]  incremental vacuum mode: u32
/// [68..72]  application_id: u32
/// [72..92]  reserved for expansion
/// [92..96]  version-valid-for: u32
/// [96..100] sqlite version number: u32
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseHeader {
    pub page_size: u32,
    pub write_version: u8,
    pub read_version: u8,
    pub reserved_space: u8,
    pub max_payload_fraction: u8,
    pub min_payload_fraction: u8,
    pub leaf_payload_fraction: u8,
    pub change_counter: u32,
    pub total_pages: u32,
    pub freelist_trunk: u32,
    pub freelist_count: u32,
    pub schema_cookie: u32,
    pub schema_format: u32,
    pub default_cache_size: u32,
    pub largest_root: u32,
    pub text_encoding: u32,
    pub user_version: u32,
    pub incremental_vacuum: u32,
    pub application_id: u32,
    pub version_valid_for: u32,
    pub sqlite_version: u32,
}

fn be_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

impl DatabaseHeader {
    /// A header for an empty single-page database with the given page size.
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size,
            write_version: 1,
            read_version: 1,
            reserved_space: 0,
            max_payload_fraction: 64,
            min_payload_fraction: 32,
            leaf_payload_fraction: 32,
            change_counter: 0,
            total_pages: 1,
            freelist_trunk: 0,
            freelist_count: 0,
            schema_cookie: 0,
            schema_format: 4,
            default_cache_size: 0,
            largest_root: 0,
            text_encoding: 1,
            user_version: 0,
            incremental_vacuum: 0,
            application_id: 0,
            version_valid_for: 0,
            sqlite_version: 0,
        }
    }

    /// Parse the header from the first bytes of page 0, validating the magic
    /// string and the page size.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, StorageError> {
        if buf.len() < HEADER_SIZE {
            return Err(StorageError::TruncatedHeader(buf.len()));
        }
        if &buf[0..16] != MAGIC {
            return Err(StorageError::InvalidMagic);
        }

        let raw_page_size = u16::from_be_bytes([buf[16], buf[17]]);
        let page_size = match raw_page_size {
            1 => 65536,
            v => u32::from(v),
        };
        if !is_valid_page_size(page_size) {
            return Err(StorageError::InvalidPageSize(page_size));
        }

        Ok(Self {
            page_size,
            write_version: buf[18],
            read_version: buf[19],
            reserved_space: buf[20],
            max_payload_fraction: buf[21],
            min_payload_fraction: buf[22],
            leaf_payload_fraction: buf[23],
            change_counter: be_u32(buf, 24),
            total_pages: be_u32(buf, 28),
            freelist_trunk: be_u32(buf, 32),
            freelist_count: be_u32(buf, 36),
            schema_cookie: be_u32(buf, 40),
            schema_format: be_u32(buf, 44),
            default_cache_size: be_u32(buf, 48),
            largest_root: be_u32(buf, 52),
            text_encoding: be_u32(buf, 56),
            user_version: be_u32(buf, 60),
            incremental_vacuum: be_u32(buf, 64),
            application_id: be_u32(buf, 68),
            version_valid_for: be_u32(buf, 92),
            sqlite_version: be_u32(buf, 96),
        })
    }

    /// Serialize this header into the first 100 bytes of `buf`.
    pub fn write_to(&self, buf: &mut [u8]) {
        let header = &mut buf[..HEADER_SIZE];
        header.fill(0);
        header[0..16].copy_from_slice(MAGIC);
        let raw_page_size: u16 = if self.page_size == 65536 {
            1
        } else {
            self.page_size as u16
        };
        header[16..18].copy_from_slice(&raw_page_size.to_be_bytes());
        header[18] = self.write_version;
        header[19] = self.read_version;
        header[20] = self.reserved_space;
        header[21] = self.max_payload_fraction;
        header[22] = self.min_payload_fraction;
        header[23] = self.leaf_payload_fraction;

        let words = [
            (24, self.change_counter),
            (28, self.total_pages),
            (32, self.freelist_trunk),
            (36, self.freelist_count),
            (40, self.schema_cookie),
            (44, self.schema_format),
            (48, self.default_cache_size),
            (52, self.largest_root),
            (56, self.text_encoding),
            (60, self.user_version),
            (64, self.incremental_vacuum),
            (68, self.application_id),
            (92, self.version_valid_for),
            (96, self.sqlite_version),
        ];
        for (offset, value) in words {
            header[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
        }
    }

    /// Size in bytes the header claims the database occupies.
    pub fn database_size(&self) -> u64 {
        u64::from(self.page_size) * u64::from(self.total_pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut header = DatabaseHeader::new(4096);
        header.change_counter = 7;
        header.total_pages = 12;
        header.schema_cookie = 3;

        let mut buf = [0u8; HEADER_SIZE];
        header.write_to(&mut buf);

        let parsed = DatabaseHeader::from_bytes(&buf).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.database_size(), 12 * 4096);
    }

    #[test]
    fn test_field_offsets_are_big_endian() {
        let mut header = DatabaseHeader::new(1024);
        header.total_pages = 0x0102_0304;
        header.schema_cookie = 0x0A0B_0C0D;
        header.schema_format = 4;
        header.text_encoding = 1;

        let mut buf = [0u8; HEADER_SIZE];
        header.write_to(&mut buf);

        assert_eq!(&buf[16..18], &[0x04, 0x00]);
        assert_eq!(&buf[28..32], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&buf[40..44], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(&buf[44..48], &[0, 0, 0, 4]);
        assert_eq!(&buf[56..60], &[0, 0, 0, 1]);
    }

    #[test]
    fn test_page_size_one_means_65536() {
        let header = DatabaseHeader::new(65536);
        let mut buf = [0u8; HEADER_SIZE];
        header.write_to(&mut buf);
        assert_eq!(&buf[16..18], &[0x00, 0x01]);

        let parsed = DatabaseHeader::from_bytes(&buf).unwrap();
        assert_eq!(parsed.page_size, 65536);
    }

    #[test]
    fn test_invalid_magic() {
        let mut buf = [0u8; HEADER_SIZE];
        DatabaseHeader::new(4096).write_to(&mut buf);
        buf[0] = b'X';
        match DatabaseHeader::from_bytes(&buf) {
            Err(StorageError::InvalidMagic) => {}
            other => panic!("expected InvalidMagic, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_page_size() {
        let mut buf = [0u8; HEADER_SIZE];
        DatabaseHeader::new(4096).write_to(&mut buf);
        buf[16..18].copy_from_slice(&1000u16.to_be_bytes());
        match DatabaseHeader::from_bytes(&buf) {
            Err(StorageError::InvalidPageSize(1000)) => {}
            other => panic!("expected InvalidPageSize(1000), got {other:?}"),
        }
    }

    #[test]
    fn test_truncated_header() {
        let buf = [0u8; 40];
        match DatabaseHeader::from_bytes(&buf) {
            Err(StorageError::TruncatedHeader(40)) => {}
            other => panic!("expected TruncatedHeader, got {other:?}"),
        }
    }
}
