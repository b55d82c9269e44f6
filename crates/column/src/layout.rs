//! Byte-level layouts of the column-internal page kinds.
//!
//! Column header page (always page 2):
//!
//! | bytes  | field                                        |
//! |--------|----------------------------------------------|
//! | 0..3   | page-type tag                                |
//! | 4..7   | type ordinal (i32)                           |
//! | 8..11  | logical size (i32, vector element count)     |
//! | 12..15 | physical entry size in bytes (i32)           |
//! | 16..23 | flag bits (bit 0 = nullable)                 |
//! | 24..31 | live tuple count (i64)                       |
//! | 32..39 | deleted tuple count (i64)                    |
//! | 40..47 | max tuple id (i64)                           |
//! | 48..55 | tail directory page id (variable only)       |
//! | 56..63 | current data page id (variable only)         |
//!
//! Variable-column directory page:
//!
//! | bytes  | field                                        |
//! |--------|----------------------------------------------|
//! | 0..3   | page-type tag                                |
//! | 4..11  | previous directory page id (-1 = none)       |
//! | 12..19 | next directory page id (-1 = none)           |
//! | 20..27 | first tuple id on this page                  |
//! | 28..35 | last tuple id on this page (-1 = empty)      |
//! | 36..   | entries of `(flags: i32, address: i64)`      |
//!
//! Slotted data page:
//!
//! | bytes  | field                                        |
//! |--------|----------------------------------------------|
//! | 0..3   | page-type tag                                |
//! | 4..5   | slot count (u16)                             |
//! | 6..7   | free offset (u16, payloads grow downward)    |
//! | 8..    | slot directory of `(offset: u16, len: u16)`  |

use common::{PageId, TupleId};
use storage::Page;

use crate::ColumnMeta;

pub const TAG_FIXED_HEADER: u32 = 0x4843_0001;
pub const TAG_VARIABLE_HEADER: u32 = 0x4843_0002;
pub const TAG_DIRECTORY: u32 = 0x4843_0003;
pub const TAG_SLOTTED: u32 = 0x4843_0004;

/// The column header always lives on page 2, right after the file header.
pub const COLUMN_HEADER_PAGE: PageId = PageId(2);
/// Fixed layout: data pages start right after the column header.
pub const FIRST_DATA_PAGE: u64 = 3;
/// Variable layout: the head of the directory chain is created with the
/// file and never moves.
pub const FIRST_DIRECTORY_PAGE: PageId = PageId(3);

/// Entry flag bits shared by the fixed entry header and the directory
/// entries of the variable layout.
pub const FLAG_DELETED: u8 = 0b0000_0001;
pub const FLAG_NULL: u8 = 0b0000_0010;

/// Fixed layout: one byte of flags in front of every payload.
pub const ENTRY_HEADER_SIZE: usize = 1;

pub const DIRECTORY_HEADER_SIZE: usize = 36;
pub const DIRECTORY_ENTRY_SIZE: usize = 12;

pub const SLOTTED_HEADER_SIZE: usize = 8;
pub const SLOT_SIZE: usize = 4;
/// Sentinel offset marking a reclaimed slot. Limits slotted pages to
/// offsets below `u16::MAX`, which any supported page size satisfies.
pub const SLOT_DELETED: u16 = u16::MAX;

pub struct ColumnHeader {
    pub tag: u32,
    pub type_ordinal: i32,
    pub logical_size: i32,
    pub entry_size: i32,
    pub nullable: bool,
    pub meta: ColumnMeta,
    pub tail_directory: PageId,
    pub current_data_page: PageId,
}

impl ColumnHeader {
    pub fn read(page: &Page) -> ColumnHeader {
        let flags = page.get_u64(16);
        ColumnHeader {
            tag: page.get_u32(0),
            type_ordinal: page.get_i32(4),
            logical_size: page.get_i32(8),
            entry_size: page.get_i32(12),
            nullable: flags & 1 != 0,
            meta: ColumnMeta {
                count: page.get_i64(24) as u64,
                deleted: page.get_i64(32) as u64,
                max_tid: page.get_i64(40) as u64,
            },
            tail_directory: PageId(page.get_u64(48)),
            current_data_page: PageId(page.get_u64(56)),
        }
    }

    pub fn write(&self, page: &mut Page) {
        page.clear();
        page.put_u32(0, self.tag);
        page.put_i32(4, self.type_ordinal);
        page.put_i32(8, self.logical_size);
        page.put_i32(12, self.entry_size);
        page.put_u64(16, if self.nullable { 1 } else { 0 });
        page.put_i64(24, self.meta.count as i64);
        page.put_i64(32, self.meta.deleted as i64);
        page.put_i64(40, self.meta.max_tid as i64);
        page.put_u64(48, self.tail_directory.0);
        page.put_u64(56, self.current_data_page.0);
    }
}

/// Packed `(page, slot)` pointer into a slotted data page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Address(pub i64);

impl Address {
    pub fn new(page: PageId, slot: u16) -> Address {
        Address(((page.0 as i64) << 16) | slot as i64)
    }

    pub fn page(&self) -> PageId {
        PageId((self.0 >> 16) as u64)
    }

    pub fn slot(&self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }
}

/// View over a directory page.
pub struct Directory;

impl Directory {
    pub fn capacity(page_size: usize) -> u64 {
        ((page_size - DIRECTORY_HEADER_SIZE) / DIRECTORY_ENTRY_SIZE) as u64
    }

    pub fn init(page: &mut Page, prev: i64, first: TupleId) {
        page.clear();
        page.put_u32(0, TAG_DIRECTORY);
        page.put_i64(4, prev);
        page.put_i64(12, -1);
        page.put_i64(20, first.0 as i64);
        page.put_i64(28, -1);
    }

    pub fn prev(page: &Page) -> i64 {
        page.get_i64(4)
    }

    pub fn next(page: &Page) -> i64 {
        page.get_i64(12)
    }

    pub fn set_next(page: &mut Page, next: i64) {
        page.put_i64(12, next);
    }

    pub fn first(page: &Page) -> u64 {
        page.get_i64(20) as u64
    }

    pub fn last(page: &Page) -> i64 {
        page.get_i64(28)
    }

    pub fn set_last(page: &mut Page, last: i64) {
        page.put_i64(28, last);
    }

    pub fn entry_offset(page: &Page, tid: TupleId) -> usize {
        let first = Self::first(page);
        DIRECTORY_HEADER_SIZE + ((tid.0 - first) as usize) * DIRECTORY_ENTRY_SIZE
    }

    pub fn entry(page: &Page, tid: TupleId) -> (u8, Address) {
        let off = Self::entry_offset(page, tid);
        (page.get_i32(off) as u8, Address(page.get_i64(off + 4)))
    }

    pub fn set_entry(page: &mut Page, tid: TupleId, flags: u8, address: Address) {
        let off = Self::entry_offset(page, tid);
        page.put_i32(off, flags as i32);
        page.put_i64(off + 4, address.0);
    }

    /// True if this page can still take an entry for `tid`.
    pub fn has_room(page: &Page, tid: TupleId, page_size: usize) -> bool {
        tid.0 - Self::first(page) < Self::capacity(page_size)
    }
}

/// View over a slotted data page.
pub struct Slotted;

impl Slotted {
    pub fn init(page: &mut Page) {
        let size = page.size();
        page.clear();
        page.put_u32(0, TAG_SLOTTED);
        page.put_u16(4, 0);
        page.put_u16(6, size as u16);
    }

    pub fn slot_count(page: &Page) -> u16 {
        page.get_u16(4)
    }

    pub fn free_offset(page: &Page) -> u16 {
        page.get_u16(6)
    }

    pub fn slot(page: &Page, slot: u16) -> (u16, u16) {
        let off = SLOTTED_HEADER_SIZE + slot as usize * SLOT_SIZE;
        (page.get_u16(off), page.get_u16(off + 2))
    }

    fn set_slot(page: &mut Page, slot: u16, offset: u16, len: u16) {
        let off = SLOTTED_HEADER_SIZE + slot as usize * SLOT_SIZE;
        page.put_u16(off, offset);
        page.put_u16(off + 2, len);
    }

    /// Contiguous free bytes between the slot directory and the payloads.
    pub fn free_space(page: &Page) -> usize {
        let slots_end = SLOTTED_HEADER_SIZE + Self::slot_count(page) as usize * SLOT_SIZE;
        (Self::free_offset(page) as usize).saturating_sub(slots_end)
    }

    /// Bytes held by reclaimed slots, recoverable by compaction.
    pub fn reclaimable(page: &Page) -> usize {
        let mut total = 0;
        for s in 0..Self::slot_count(page) {
            let (offset, len) = Self::slot(page, s);
            if offset == SLOT_DELETED {
                total += len as usize;
            }
        }
        total
    }

    /// Append a payload, returning its slot. Fails with `None` when the
    /// page lacks contiguous room even for a fresh slot entry.
    pub fn push(page: &mut Page, payload: &[u8]) -> Option<u16> {
        if Self::free_space(page) < payload.len() + SLOT_SIZE {
            return None;
        }
        let slot = Self::slot_count(page);
        let new_offset = Self::free_offset(page) as usize - payload.len();
        page.put_bytes(new_offset, payload);
        Self::set_slot(page, slot, new_offset as u16, payload.len() as u16);
        page.put_u16(4, slot + 1);
        page.put_u16(6, new_offset as u16);
        Some(slot)
    }

    pub fn get(page: &Page, slot: u16) -> Option<Vec<u8>> {
        if slot >= Self::slot_count(page) {
            return None;
        }
        let (offset, len) = Self::slot(page, slot);
        if offset == SLOT_DELETED {
            return None;
        }
        Some(page.get_bytes(offset as usize, len as usize).to_vec())
    }

    /// Mark a slot reclaimed; its extent is recovered on the next
    /// compaction. The stored length is kept for accounting.
    pub fn remove(page: &mut Page, slot: u16) {
        let (_, len) = Self::slot(page, slot);
        Self::set_slot(page, slot, SLOT_DELETED, len);
    }

    /// Repack live payloads against the top of the page, preserving slot
    /// indices. Reclaimed slots drop their accounted length.
    pub fn compact(page: &mut Page) {
        let count = Self::slot_count(page);
        let mut live: Vec<(u16, Vec<u8>)> = Vec::new();
        for s in 0..count {
            if let Some(bytes) = Self::get(page, s) {
                live.push((s, bytes));
            }
        }
        let mut offset = page.size();
        for (slot, bytes) in live {
            offset -= bytes.len();
            page.put_bytes(offset, &bytes);
            Self::set_slot(page, slot, offset as u16, bytes.len() as u16);
        }
        for s in 0..count {
            let (off, _) = Self::slot(page, s);
            if off == SLOT_DELETED {
                Self::set_slot(page, s, SLOT_DELETED, 0);
            }
        }
        page.put_u16(6, offset as u16);
    }
}
