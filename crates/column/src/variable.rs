//! Variable-layout column file: a doubly-linked chain of directory pages
//! maps each tuple id to `(flags, address)`, where the address points into
//! a slotted data page. Updates relocate slots; deletes reclaim the slot
//! extent; slotted pages compact opportunistically when an insert fails
//! for fragmentation.

use crate::layout::{
    Address, ColumnHeader, Directory, Slotted, COLUMN_HEADER_PAGE, FIRST_DIRECTORY_PAGE,
    FLAG_DELETED, FLAG_NULL, SLOTTED_HEADER_SIZE, SLOT_SIZE, TAG_VARIABLE_HEADER,
};
use crate::{ColumnDef, ColumnMeta};
use buffer::{BufferPool, PageRef, Priority};
use common::{Config, DbError, DbResult, PageId, TupleId};
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::Arc;
use storage::{create_disk_manager, open_disk_manager, DiskManager, FileType, Page};
use tracing::debug;
use types::{codec, Value};

pub struct VariableColumnFile {
    def: ColumnDef,
    disk: Arc<dyn DiskManager>,
    pool: BufferPool,
    page_size: usize,
    latch: RwLock<()>,
    state: Mutex<StatePair>,
}

#[derive(Clone, Copy)]
struct VarState {
    meta: ColumnMeta,
    /// Directory page receiving new entries.
    tail_directory: PageId,
    /// Slotted page receiving new payloads; `RESERVED` before the first.
    current_data: PageId,
}

struct StatePair {
    current: VarState,
    committed: VarState,
}

impl VariableColumnFile {
    pub fn create(path: &Path, def: ColumnDef, config: &Config) -> DbResult<VariableColumnFile> {
        let disk = create_disk_manager(path, FileType::VariableColumn, config)?;
        let header_page = disk.allocate(None)?;
        debug_assert_eq!(header_page, COLUMN_HEADER_PAGE);

        let mut dir = Page::new(config.page_size);
        Directory::init(&mut dir, -1, TupleId(0));
        let dir_page = disk.allocate(Some(&dir))?;
        debug_assert_eq!(dir_page, FIRST_DIRECTORY_PAGE);

        let state = VarState {
            meta: ColumnMeta::default(),
            tail_directory: FIRST_DIRECTORY_PAGE,
            current_data: PageId::RESERVED,
        };
        let file = VariableColumnFile {
            pool: BufferPool::new(Arc::clone(&disk), config.buffer_pool_frames)
                .with_eviction_timeout(config.eviction_timeout),
            disk,
            def,
            page_size: config.page_size,
            latch: RwLock::new(()),
            state: Mutex::new(StatePair {
                current: state,
                committed: state,
            }),
        };
        file.write_column_header()?;
        file.disk.commit()?;
        debug!(column = %file.def.name, path = %path.display(), "created variable column");
        Ok(file)
    }

    pub fn open(path: &Path, def: ColumnDef, config: &Config) -> DbResult<VariableColumnFile> {
        let disk = open_disk_manager(path, config)?;
        let mut page = Page::new(config.page_size);
        disk.read(COLUMN_HEADER_PAGE, &mut page)?;
        let header = ColumnHeader::read(&page);
        if header.tag != TAG_VARIABLE_HEADER {
            return Err(DbError::DataCorruption(format!(
                "'{}' is not a variable column file",
                path.display()
            )));
        }
        if header.type_ordinal != def.ty.ordinal() || header.nullable != def.nullable {
            return Err(DbError::DataCorruption(format!(
                "column file '{}' does not match declaration of '{}'",
                path.display(),
                def.name
            )));
        }

        let state = VarState {
            meta: header.meta,
            tail_directory: header.tail_directory,
            current_data: header.current_data_page,
        };
        Ok(VariableColumnFile {
            pool: BufferPool::new(Arc::clone(&disk), config.buffer_pool_frames)
                .with_eviction_timeout(config.eviction_timeout),
            disk,
            def,
            page_size: config.page_size,
            latch: RwLock::new(()),
            state: Mutex::new(StatePair {
                current: state,
                committed: state,
            }),
        })
    }

    pub fn def(&self) -> &ColumnDef {
        &self.def
    }

    pub fn meta(&self) -> ColumnMeta {
        self.state.lock().current.meta
    }

    pub fn disk(&self) -> &Arc<dyn DiskManager> {
        &self.disk
    }

    fn check_bounds(&self, tid: TupleId) -> DbResult<()> {
        let max = self.state.lock().current.meta.max_tid;
        if tid.0 >= max {
            return Err(DbError::TxValidation(format!(
                "tuple {tid} does not exist in column '{}'",
                self.def.name
            )));
        }
        Ok(())
    }

    /// Walk the directory chain to the page holding `tid`.
    fn find_directory(&self, tid: TupleId) -> DbResult<PageRef> {
        let mut id = FIRST_DIRECTORY_PAGE;
        loop {
            let page_ref = self.pool.get(id, Priority::High)?;
            let (last, next, in_range) = {
                let page = page_ref.read();
                let first = Directory::first(&page);
                let last = Directory::last(&page);
                let in_range = tid.0 >= first && last >= 0 && tid.0 <= last as u64;
                (last, Directory::next(&page), in_range)
            };
            if in_range {
                return Ok(page_ref);
            }
            if next >= 0 && (last < 0 || tid.0 > last as u64) {
                id = PageId(next as u64);
                continue;
            }
            return Err(DbError::DataCorruption(format!(
                "no directory entry for tuple {tid} in column '{}'",
                self.def.name
            )));
        }
    }

    /// Store a payload in the current slotted page, compacting or
    /// allocating a fresh page as needed.
    fn store_payload(&self, bytes: &[u8]) -> DbResult<Address> {
        if bytes.len() + SLOT_SIZE + SLOTTED_HEADER_SIZE > self.page_size {
            return Err(DbError::TxValidation(format!(
                "value of {} bytes exceeds the data page capacity of column '{}'",
                bytes.len(),
                self.def.name
            )));
        }

        let current = self.state.lock().current.current_data;
        if current.is_valid() {
            let page_ref = self.pool.get(current, Priority::Normal)?;
            let mut page = page_ref.write();
            if let Some(slot) = Slotted::push(&mut page, bytes) {
                return Ok(Address::new(current, slot));
            }
            // Compaction is worth it only when the reclaimed extents cover
            // the shortfall.
            if Slotted::reclaimable(&page) >= bytes.len() + SLOT_SIZE {
                Slotted::compact(&mut page);
                if let Some(slot) = Slotted::push(&mut page, bytes) {
                    return Ok(Address::new(current, slot));
                }
            }
        }

        let mut fresh = Page::new(self.page_size);
        Slotted::init(&mut fresh);
        let slot = Slotted::push(&mut fresh, bytes)
            .expect("fresh slotted page always fits a checked payload");
        let id = self.disk.allocate(Some(&fresh))?;
        self.state.lock().current.current_data = id;
        Ok(Address::new(id, slot))
    }

    /// Encode and place a non-null value, returning its directory entry.
    fn place(&self, value: &Value) -> DbResult<(u8, Address)> {
        if value.is_null() {
            return Ok((FLAG_NULL, Address(0)));
        }
        let bytes =
            codec::encode_variable(value).map_err(|e| DbError::DataCorruption(e.to_string()))?;
        let address = self.store_payload(&bytes)?;
        Ok((0, address))
    }

    fn release_slot(&self, address: Address) -> DbResult<()> {
        if address.0 == 0 {
            return Ok(());
        }
        let page_ref = self.pool.get(address.page(), Priority::Normal)?;
        let mut page = page_ref.write();
        Slotted::remove(&mut page, address.slot());
        Ok(())
    }

    pub fn append(&self, value: &Value) -> DbResult<TupleId> {
        let _latch = self.latch.write();
        self.def.check_value(value)?;

        let tid = TupleId(self.state.lock().current.meta.max_tid);
        let (flags, address) = self.place(value)?;

        let tail = self.state.lock().current.tail_directory;
        let tail_ref = self.pool.get(tail, Priority::High)?;
        let has_room = Directory::has_room(&tail_ref.read(), tid, self.page_size);
        let dir_ref = if has_room {
            tail_ref
        } else {
            // Chain a fresh directory page for this tuple id range.
            let mut fresh = Page::new(self.page_size);
            Directory::init(&mut fresh, tail.0 as i64, tid);
            let new_id = self.disk.allocate(Some(&fresh))?;
            Directory::set_next(&mut tail_ref.write(), new_id.0 as i64);
            self.state.lock().current.tail_directory = new_id;
            self.pool.get(new_id, Priority::High)?
        };
        {
            let mut page = dir_ref.write();
            Directory::set_entry(&mut page, tid, flags, address);
            Directory::set_last(&mut page, tid.0 as i64);
        }

        let mut state = self.state.lock();
        state.current.meta.max_tid += 1;
        state.current.meta.count += 1;
        Ok(tid)
    }

    pub fn read(&self, tid: TupleId) -> DbResult<Option<Value>> {
        let _latch = self.latch.read();
        self.check_bounds(tid)?;

        let dir_ref = self.find_directory(tid)?;
        let (flags, address) = Directory::entry(&dir_ref.read(), tid);
        if flags & FLAG_DELETED != 0 {
            return Ok(None);
        }
        if flags & FLAG_NULL != 0 {
            return Ok(Some(Value::Null));
        }

        let page_ref = self.pool.get(address.page(), Priority::Normal)?;
        let bytes = Slotted::get(&page_ref.read(), address.slot()).ok_or_else(|| {
            DbError::DataCorruption(format!(
                "dangling slot for tuple {tid} in column '{}'",
                self.def.name
            ))
        })?;
        let value = codec::decode_variable(&self.def.ty, &bytes)
            .map_err(|e| DbError::DataCorruption(e.to_string()))?;
        Ok(Some(value))
    }

    pub fn update(&self, tid: TupleId, value: &Value) -> DbResult<()> {
        let _latch = self.latch.write();
        self.check_bounds(tid)?;
        self.def.check_value(value)?;

        let dir_ref = self.find_directory(tid)?;
        let (old_flags, old_address) = Directory::entry(&dir_ref.read(), tid);
        if old_flags & FLAG_DELETED != 0 {
            return Err(DbError::TxValidation(format!(
                "tuple {tid} in column '{}' is deleted",
                self.def.name
            )));
        }
        if old_flags & FLAG_NULL == 0 {
            self.release_slot(old_address)?;
        }
        let (flags, address) = self.place(value)?;
        Directory::set_entry(&mut dir_ref.write(), tid, flags, address);
        Ok(())
    }

    pub fn delete(&self, tid: TupleId) -> DbResult<()> {
        let _latch = self.latch.write();
        self.check_bounds(tid)?;

        let dir_ref = self.find_directory(tid)?;
        let (flags, address) = Directory::entry(&dir_ref.read(), tid);
        if flags & FLAG_DELETED != 0 {
            return Err(DbError::TxValidation(format!(
                "tuple {tid} in column '{}' is already deleted",
                self.def.name
            )));
        }
        if flags & FLAG_NULL == 0 {
            self.release_slot(address)?;
        }
        Directory::set_entry(&mut dir_ref.write(), tid, FLAG_DELETED, Address(0));

        let mut state = self.state.lock();
        state.current.meta.deleted += 1;
        state.current.meta.count = state.current.meta.count.saturating_sub(1);
        Ok(())
    }

    pub fn is_deleted(&self, tid: TupleId) -> DbResult<bool> {
        let _latch = self.latch.read();
        self.check_bounds(tid)?;
        let dir_ref = self.find_directory(tid)?;
        let (flags, _) = Directory::entry(&dir_ref.read(), tid);
        Ok(flags & FLAG_DELETED != 0)
    }

    fn write_column_header(&self) -> DbResult<()> {
        let state = self.state.lock().current;
        let header = ColumnHeader {
            tag: TAG_VARIABLE_HEADER,
            type_ordinal: self.def.ty.ordinal(),
            logical_size: self.def.ty.logical_size() as i32,
            entry_size: 0,
            nullable: self.def.nullable,
            meta: state.meta,
            tail_directory: state.tail_directory,
            current_data_page: state.current_data,
        };
        let mut page = Page::new(self.disk.page_size());
        header.write(&mut page);
        self.disk.update(COLUMN_HEADER_PAGE, &page)
    }

    pub fn commit(&self) -> DbResult<()> {
        let _latch = self.latch.write();
        self.pool.flush()?;
        self.write_column_header()?;
        self.disk.commit()?;
        let mut state = self.state.lock();
        state.committed = state.current;
        Ok(())
    }

    pub fn rollback(&self) -> DbResult<()> {
        let _latch = self.latch.write();
        self.pool.discard();
        self.disk.rollback()?;
        let mut state = self.state.lock();
        state.current = state.committed;
        Ok(())
    }

    pub fn close(&self) -> DbResult<()> {
        let _latch = self.latch.write();
        self.pool.flush()?;
        self.write_column_header()?;
        self.disk.close()
    }
}
