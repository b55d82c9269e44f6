//! Page layer: fixed-size pages, the page file header, and the disk
//! managers that move pages between memory and a single page file.
//!
//! # Architecture
//!
//! ```text
//! BufferPool (crate `buffer`)
//!     ↓ read / update / allocate / free
//! DiskManager (trait)
//!     ├── DirectDiskManager   every update hits the file synchronously
//!     └── WalDiskManager      updates append to a log, applied on commit
//! ```
//!
//! A page file starts with a header page (page 1) carrying the `HARE`
//! identifier, a consistency flag, page counters, and a CRC32C checksum
//! over the data pages. Page ids are 1-based; the byte position of page
//! `p` is `p << log2(page_size)`. Freed pages form a linked list threaded
//! through the freed pages themselves, headed from the file header.

#[cfg(test)]
mod tests;

mod direct;
mod header;
mod page;
mod wal;

pub use direct::DirectDiskManager;
pub use header::{Consistency, FileHeader, FileType, HEADER_VERSION};
pub use page::Page;
pub use wal::WalDiskManager;

use common::{Config, DbResult, PageId};
use std::path::Path;
use std::sync::Arc;

/// Access to a single page file. Calls bypass any caching layer and
/// synchronize on the file channel internally.
pub trait DiskManager: Send + Sync {
    fn page_size(&self) -> usize;

    /// Highest valid page id (the header page counts, so an empty file
    /// reports 1).
    fn pages(&self) -> u64;

    fn file_type(&self) -> FileType;

    /// True if the file was cleanly closed before this open (no recovery
    /// scan was needed).
    fn opened_clean(&self) -> bool;

    /// Read page `id` into `page`.
    fn read(&self, id: PageId, page: &mut Page) -> DbResult<()>;

    /// Write `page` as the new content of page `id`.
    fn update(&self, id: PageId, page: &Page) -> DbResult<()>;

    /// Allocate a page, reusing the lowest freed page if any, and write
    /// `page` (or zeroes) as its initial content.
    fn allocate(&self, page: Option<&Page>) -> DbResult<PageId>;

    /// Release page `id` onto the free list.
    fn free(&self, id: PageId) -> DbResult<()>;

    /// Make all changes durable: refresh the checksum, mark the header
    /// consistent, and fsync.
    fn commit(&self) -> DbResult<()>;

    /// Revert in-memory header state (and any unapplied writes) to the
    /// last committed snapshot.
    fn rollback(&self) -> DbResult<()>;

    /// CRC32C over all data pages (everything but the header page).
    fn calculate_checksum(&self) -> DbResult<u64>;

    /// True iff the stored checksum matches [`Self::calculate_checksum`].
    fn validate(&self) -> DbResult<bool> {
        Ok(self.calculate_checksum()? == self.stored_checksum())
    }

    fn stored_checksum(&self) -> u64;

    /// Commit and release the file lock. Idempotent.
    fn close(&self) -> DbResult<()>;
}

/// Create a new page file, choosing the manager variant from `config.wal`.
pub fn create_disk_manager(
    path: &Path,
    file_type: FileType,
    config: &Config,
) -> DbResult<Arc<dyn DiskManager>> {
    if config.wal {
        Ok(Arc::new(WalDiskManager::create(path, file_type, config)?))
    } else {
        Ok(Arc::new(DirectDiskManager::create(path, file_type, config)?))
    }
}

/// Open an existing page file, choosing the manager variant from
/// `config.wal`.
pub fn open_disk_manager(path: &Path, config: &Config) -> DbResult<Arc<dyn DiskManager>> {
    if config.wal {
        Ok(Arc::new(WalDiskManager::open(path, config)?))
    } else {
        Ok(Arc::new(DirectDiskManager::open(path, config)?))
    }
}

/// Remove a page file (and its log, if any) from disk. The file must be
/// closed.
pub fn delete_page_file(path: &Path) -> DbResult<()> {
    std::fs::remove_file(path)?;
    let log = wal::log_path(path);
    if log.exists() {
        std::fs::remove_file(log)?;
    }
    Ok(())
}
