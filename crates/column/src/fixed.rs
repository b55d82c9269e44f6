//! Fixed-layout column file: every tuple occupies `ENTRY_HEADER_SIZE +
//! physical_size(type)` bytes, so tuple addresses are arithmetic and
//! entries never straddle pages.

use crate::layout::{
    ColumnHeader, COLUMN_HEADER_PAGE, ENTRY_HEADER_SIZE, FIRST_DATA_PAGE, FLAG_DELETED, FLAG_NULL,
    TAG_FIXED_HEADER,
};
use crate::{ColumnDef, ColumnMeta};
use buffer::{BufferPool, Priority};
use common::{Config, DbError, DbResult, PageId, TupleId};
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::Arc;
use storage::{create_disk_manager, open_disk_manager, DiskManager, FileType, Page};
use tracing::debug;
use types::{codec, Value};

pub struct FixedColumnFile {
    def: ColumnDef,
    disk: Arc<dyn DiskManager>,
    pool: BufferPool,
    entry_size: usize,
    entries_per_page: u64,
    latch: RwLock<()>,
    meta: Mutex<MetaPair>,
}

struct MetaPair {
    current: ColumnMeta,
    committed: ColumnMeta,
}

impl FixedColumnFile {
    pub fn create(path: &Path, def: ColumnDef, config: &Config) -> DbResult<FixedColumnFile> {
        let physical = def.ty.physical_size().ok_or_else(|| {
            DbError::TxValidation(format!("type {} has no fixed layout", def.ty))
        })?;
        let entry_size = ENTRY_HEADER_SIZE + physical;
        if entry_size > config.page_size {
            return Err(DbError::TxValidation(format!(
                "entry of type {} exceeds the page size",
                def.ty
            )));
        }

        let disk = create_disk_manager(path, FileType::FixedColumn, config)?;
        let header_page = disk.allocate(None)?;
        debug_assert_eq!(header_page, COLUMN_HEADER_PAGE);

        let file = FixedColumnFile {
            entry_size,
            entries_per_page: (config.page_size / entry_size) as u64,
            pool: BufferPool::new(Arc::clone(&disk), config.buffer_pool_frames)
                .with_eviction_timeout(config.eviction_timeout),
            disk,
            def,
            latch: RwLock::new(()),
            meta: Mutex::new(MetaPair {
                current: ColumnMeta::default(),
                committed: ColumnMeta::default(),
            }),
        };
        file.write_column_header()?;
        file.disk.commit()?;
        debug!(column = %file.def.name, path = %path.display(), "created fixed column");
        Ok(file)
    }

    pub fn open(path: &Path, def: ColumnDef, config: &Config) -> DbResult<FixedColumnFile> {
        let disk = open_disk_manager(path, config)?;
        let mut page = Page::new(config.page_size);
        disk.read(COLUMN_HEADER_PAGE, &mut page)?;
        let header = ColumnHeader::read(&page);
        if header.tag != TAG_FIXED_HEADER {
            return Err(DbError::DataCorruption(format!(
                "'{}' is not a fixed column file",
                path.display()
            )));
        }
        if header.type_ordinal != def.ty.ordinal()
            || header.logical_size as usize != def.ty.logical_size()
            || header.nullable != def.nullable
        {
            return Err(DbError::DataCorruption(format!(
                "column file '{}' does not match declaration of '{}'",
                path.display(),
                def.name
            )));
        }

        let entry_size = header.entry_size as usize;
        Ok(FixedColumnFile {
            entry_size,
            entries_per_page: (config.page_size / entry_size) as u64,
            pool: BufferPool::new(Arc::clone(&disk), config.buffer_pool_frames)
                .with_eviction_timeout(config.eviction_timeout),
            disk,
            def,
            latch: RwLock::new(()),
            meta: Mutex::new(MetaPair {
                current: header.meta,
                committed: header.meta,
            }),
        })
    }

    pub fn def(&self) -> &ColumnDef {
        &self.def
    }

    pub fn meta(&self) -> ColumnMeta {
        self.meta.lock().current
    }

    pub fn disk(&self) -> &Arc<dyn DiskManager> {
        &self.disk
    }

    /// Tuple id → (page, byte offset); the bijective address computation of
    /// the fixed layout.
    fn locate(&self, tid: TupleId) -> (PageId, usize) {
        let page = PageId(FIRST_DATA_PAGE + tid.0 / self.entries_per_page);
        let offset = (tid.0 % self.entries_per_page) as usize * self.entry_size;
        (page, offset)
    }

    fn check_bounds(&self, tid: TupleId) -> DbResult<()> {
        let max = self.meta.lock().current.max_tid;
        if tid.0 >= max {
            return Err(DbError::TxValidation(format!(
                "tuple {tid} does not exist in column '{}'",
                self.def.name
            )));
        }
        Ok(())
    }

    fn write_entry(&self, page: &mut Page, offset: usize, value: &Value) -> DbResult<()> {
        if value.is_null() {
            page.put_u8(offset, FLAG_NULL);
            for i in 0..self.entry_size - ENTRY_HEADER_SIZE {
                page.put_u8(offset + ENTRY_HEADER_SIZE + i, 0);
            }
        } else {
            page.put_u8(offset, 0);
            let payload =
                &mut page.as_mut_slice()[offset + ENTRY_HEADER_SIZE..offset + self.entry_size];
            codec::encode_fixed(value, payload)
                .map_err(|e| DbError::DataCorruption(e.to_string()))?;
        }
        Ok(())
    }

    pub fn append(&self, value: &Value) -> DbResult<TupleId> {
        let _latch = self.latch.write();
        self.def.check_value(value)?;

        let tid = TupleId(self.meta.lock().current.max_tid);
        let (page_id, offset) = self.locate(tid);
        while self.disk.pages() < page_id.0 {
            self.disk.allocate(None)?;
        }
        let page_ref = self.pool.get(page_id, Priority::Normal)?;
        {
            let mut page = page_ref.write();
            self.write_entry(&mut page, offset, value)?;
        }

        let mut meta = self.meta.lock();
        meta.current.max_tid += 1;
        meta.current.count += 1;
        Ok(tid)
    }

    pub fn read(&self, tid: TupleId) -> DbResult<Option<Value>> {
        let _latch = self.latch.read();
        self.check_bounds(tid)?;

        let (page_id, offset) = self.locate(tid);
        let page_ref = self.pool.get(page_id, Priority::Normal)?;
        let page = page_ref.read();
        let flags = page.get_u8(offset);
        if flags & FLAG_DELETED != 0 {
            return Ok(None);
        }
        if flags & FLAG_NULL != 0 {
            return Ok(Some(Value::Null));
        }
        let payload = page.get_bytes(offset + ENTRY_HEADER_SIZE, self.entry_size - ENTRY_HEADER_SIZE);
        let value = codec::decode_fixed(&self.def.ty, payload)
            .map_err(|e| DbError::DataCorruption(e.to_string()))?;
        Ok(Some(value))
    }

    pub fn update(&self, tid: TupleId, value: &Value) -> DbResult<()> {
        let _latch = self.latch.write();
        self.check_bounds(tid)?;
        self.def.check_value(value)?;

        let (page_id, offset) = self.locate(tid);
        let page_ref = self.pool.get(page_id, Priority::Normal)?;
        let mut page = page_ref.write();
        if page.get_u8(offset) & FLAG_DELETED != 0 {
            return Err(DbError::TxValidation(format!(
                "tuple {tid} in column '{}' is deleted",
                self.def.name
            )));
        }
        self.write_entry(&mut page, offset, value)
    }

    pub fn delete(&self, tid: TupleId) -> DbResult<()> {
        let _latch = self.latch.write();
        self.check_bounds(tid)?;

        let (page_id, offset) = self.locate(tid);
        let page_ref = self.pool.get(page_id, Priority::Normal)?;
        {
            let mut page = page_ref.write();
            let flags = page.get_u8(offset);
            if flags & FLAG_DELETED != 0 {
                return Err(DbError::TxValidation(format!(
                    "tuple {tid} in column '{}' is already deleted",
                    self.def.name
                )));
            }
            page.put_u8(offset, flags | FLAG_DELETED);
        }

        let mut meta = self.meta.lock();
        meta.current.deleted += 1;
        meta.current.count = meta.current.count.saturating_sub(1);
        Ok(())
    }

    pub fn is_deleted(&self, tid: TupleId) -> DbResult<bool> {
        let _latch = self.latch.read();
        self.check_bounds(tid)?;
        let (page_id, offset) = self.locate(tid);
        let page_ref = self.pool.get(page_id, Priority::Normal)?;
        let deleted = page_ref.read().get_u8(offset) & FLAG_DELETED != 0;
        Ok(deleted)
    }

    fn write_column_header(&self) -> DbResult<()> {
        let meta = self.meta.lock().current;
        let header = ColumnHeader {
            tag: TAG_FIXED_HEADER,
            type_ordinal: self.def.ty.ordinal(),
            logical_size: self.def.ty.logical_size() as i32,
            entry_size: self.entry_size as i32,
            nullable: self.def.nullable,
            meta,
            tail_directory: PageId::RESERVED,
            current_data_page: PageId::RESERVED,
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
        let mut meta = self.meta.lock();
        meta.committed = meta.current;
        Ok(())
    }

    pub fn rollback(&self) -> DbResult<()> {
        let _latch = self.latch.write();
        self.pool.discard();
        self.disk.rollback()?;
        let mut meta = self.meta.lock();
        meta.current = meta.committed;
        Ok(())
    }

    pub fn close(&self) -> DbResult<()> {
        let _latch = self.latch.write();
        self.pool.flush()?;
        self.write_column_header()?;
        self.disk.close()
    }
}
