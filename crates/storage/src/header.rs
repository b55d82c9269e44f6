//! The file header occupies page 1 of every page file.
//!
//! Layout (little-endian):
//!
//! | bytes  | field                                    |
//! |--------|------------------------------------------|
//! | 0..8   | identifier, four 16-bit chars `H A R E`  |
//! | 8..12  | file-type discriminant (i32)             |
//! | 12     | format version (u8)                      |
//! | 13     | consistency flag (`0x00` OK, `0xFF` CHECK) |
//! | 14..22 | page count (i64)                         |
//! | 22..26 | freed-page count (i32)                   |
//! | 26..34 | CRC32C checksum (i64)                    |
//! | 34..42 | free-list head page id (i64, 0 = none)   |
//! | 42..46 | page size (u32)                          |

use crate::page::Page;
use common::{DbError, DbResult, PageId};

pub const HEADER_VERSION: u8 = 1;

const IDENTIFIER: [u16; 4] = [b'H' as u16, b'A' as u16, b'R' as u16, b'E' as u16];

const OFFSET_IDENTIFIER: usize = 0;
const OFFSET_FILE_TYPE: usize = 8;
const OFFSET_VERSION: usize = 12;
const OFFSET_CONSISTENCY: usize = 13;
const OFFSET_PAGES: usize = 14;
const OFFSET_FREED: usize = 22;
const OFFSET_CHECKSUM: usize = 26;
const OFFSET_FREELIST: usize = 34;
const OFFSET_PAGE_SIZE: usize = 42;

const CONSISTENCY_OK: u8 = 0x00;
const CONSISTENCY_CHECK: u8 = 0xFF;

/// What kind of data the page file holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    FixedColumn,
    VariableColumn,
    Index,
}

impl FileType {
    pub fn discriminant(&self) -> i32 {
        match self {
            FileType::FixedColumn => 0,
            FileType::VariableColumn => 1,
            FileType::Index => 2,
        }
    }

    pub fn from_discriminant(d: i32) -> Option<FileType> {
        Some(match d {
            0 => FileType::FixedColumn,
            1 => FileType::VariableColumn,
            2 => FileType::Index,
            _ => return None,
        })
    }
}

/// Close state recorded in the header. `Ok` iff the file was cleanly
/// closed; anything else forces a recovery scan on open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Consistency {
    Ok,
    Check,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FileHeader {
    pub file_type: FileType,
    pub version: u8,
    pub consistency: Consistency,
    /// Highest valid page id; the header page itself counts.
    pub pages: u64,
    pub freed: u32,
    pub checksum: u64,
    /// Head of the linked free list, `PageId(0)` when empty.
    pub freelist: PageId,
    pub page_size: u32,
}

impl FileHeader {
    pub fn new(file_type: FileType, page_size: u32) -> FileHeader {
        FileHeader {
            file_type,
            version: HEADER_VERSION,
            consistency: Consistency::Check,
            pages: 1,
            freed: 0,
            checksum: 0,
            freelist: PageId::RESERVED,
            page_size,
        }
    }

    /// Parse a header page. Identifier or version mismatches are fatal
    /// corruption; a stale consistency flag is not (the caller recovers).
    pub fn read(page: &Page, path: &str) -> DbResult<FileHeader> {
        for (i, expected) in IDENTIFIER.iter().enumerate() {
            if page.get_u16(OFFSET_IDENTIFIER + 2 * i) != *expected {
                return Err(DbError::DataCorruption(format!(
                    "'{path}' is not a hare page file (bad identifier)"
                )));
            }
        }
        let version = page.get_u8(OFFSET_VERSION);
        if version != HEADER_VERSION {
            return Err(DbError::DataCorruption(format!(
                "'{path}' has unsupported format version {version}"
            )));
        }
        let file_type = FileType::from_discriminant(page.get_i32(OFFSET_FILE_TYPE))
            .ok_or_else(|| {
                DbError::DataCorruption(format!("'{path}' has an unknown file-type discriminant"))
            })?;
        let consistency = match page.get_u8(OFFSET_CONSISTENCY) {
            CONSISTENCY_OK => Consistency::Ok,
            _ => Consistency::Check,
        };
        Ok(FileHeader {
            file_type,
            version,
            consistency,
            pages: page.get_u64(OFFSET_PAGES),
            freed: page.get_u32(OFFSET_FREED),
            checksum: page.get_u64(OFFSET_CHECKSUM),
            freelist: PageId(page.get_u64(OFFSET_FREELIST)),
            page_size: page.get_u32(OFFSET_PAGE_SIZE),
        })
    }

    pub fn write(&self, page: &mut Page) {
        page.clear();
        for (i, c) in IDENTIFIER.iter().enumerate() {
            page.put_u16(OFFSET_IDENTIFIER + 2 * i, *c);
        }
        page.put_i32(OFFSET_FILE_TYPE, self.file_type.discriminant());
        page.put_u8(OFFSET_VERSION, self.version);
        page.put_u8(
            OFFSET_CONSISTENCY,
            match self.consistency {
                Consistency::Ok => CONSISTENCY_OK,
                Consistency::Check => CONSISTENCY_CHECK,
            },
        );
        page.put_u64(OFFSET_PAGES, self.pages);
        page.put_u32(OFFSET_FREED, self.freed);
        page.put_u64(OFFSET_CHECKSUM, self.checksum);
        page.put_u64(OFFSET_FREELIST, self.freelist.0);
        page.put_u32(OFFSET_PAGE_SIZE, self.page_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let mut header = FileHeader::new(FileType::VariableColumn, 4096);
        header.pages = 17;
        header.freed = 3;
        header.checksum = 0xDEADBEEF;
        header.freelist = PageId(9);
        header.consistency = Consistency::Ok;

        let mut page = Page::new(4096);
        header.write(&mut page);
        let back = FileHeader::read(&page, "test.db").unwrap();
        assert_eq!(back, header);
    }

    #[test]
    fn bad_identifier_is_fatal() {
        let page = Page::new(4096);
        let err = FileHeader::read(&page, "junk.db").unwrap_err();
        assert!(matches!(err, common::DbError::DataCorruption(_)));
        assert!(err.to_string().contains("junk.db"));
    }

    #[test]
    fn stale_consistency_parses_as_check() {
        let header = FileHeader::new(FileType::FixedColumn, 4096);
        let mut page = Page::new(4096);
        header.write(&mut page);
        let back = FileHeader::read(&page, "t.db").unwrap();
        assert_eq!(back.consistency, Consistency::Check);
    }
}
