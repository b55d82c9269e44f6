//! Disk manager that appends page updates to a write-ahead log and applies
//! them to the data file on commit.
//!
//! Records are length-prefixed (4-byte LE) bincode frames, so replay can
//! iterate forward safely and truncate at the first incomplete record. A
//! `Commit` marker closes each batch; on open, only complete batches are
//! replayed and the log tail is discarded.

use crate::direct::{checksum_of, lock_file, read_and_check_header, validated_page_size};
use crate::header::{Consistency, FileHeader, FileType};
use crate::page::Page;
use crate::DiskManager;
use bincode::config;
use bincode::serde::{decode_from_slice, encode_to_vec};
use common::{Config, DbError, DbResult, PageId};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Sibling log file of a page file.
pub(crate) fn log_path(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_os_string();
    p.push(".wal");
    PathBuf::from(p)
}

#[derive(Serialize, Deserialize)]
enum LogEntry {
    /// New content for a page (also covers allocations and free-list links).
    Update { id: u64, data: Vec<u8> },
    /// Batch terminator carrying the header counters valid at commit.
    Commit { pages: u64, freed: u32, freelist: u64 },
}

pub struct WalDiskManager {
    path: PathBuf,
    page_size: usize,
    shift: u32,
    file_type: FileType,
    opened_clean: bool,
    inner: Mutex<WalInner>,
}

struct WalInner {
    file: File,
    log: File,
    log_path: PathBuf,
    header: FileHeader,
    committed: FileHeader,
    /// Uncommitted page images, so a transaction reads its own writes.
    overlay: HashMap<u64, Box<[u8]>>,
    closed: bool,
}

impl WalDiskManager {
    pub fn create(path: &Path, file_type: FileType, config: &Config) -> DbResult<WalDiskManager> {
        let page_size = validated_page_size(config.page_size)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        lock_file(&file, config.file_lock_timeout, path)?;
        let log_path = log_path(path);
        let log = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&log_path)?;

        let header = FileHeader::new(file_type, page_size as u32);
        let mut page = Page::new(page_size);
        header.write(&mut page);
        let mut handle = &file;
        handle.seek(SeekFrom::Start(page_size as u64))?;
        handle.write_all(page.as_slice())?;
        file.sync_all()?;

        debug!(path = %path.display(), "created page file (wal)");
        Ok(WalDiskManager {
            path: path.to_path_buf(),
            page_size,
            shift: page_size.trailing_zeros(),
            file_type,
            opened_clean: true,
            inner: Mutex::new(WalInner {
                file,
                log,
                log_path,
                header: header.clone(),
                committed: header,
                overlay: HashMap::new(),
                closed: false,
            }),
        })
    }

    pub fn open(path: &Path, config: &Config) -> DbResult<WalDiskManager> {
        let page_size = validated_page_size(config.page_size)?;
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        lock_file(&file, config.file_lock_timeout, path)?;
        let log_path = log_path(path);
        let mut log = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&log_path)?;

        let (mut header, mut clean) = read_and_check_header(&file, page_size, path)?;

        // Redo complete batches left behind by a crash between log force and
        // checkpoint, then discard the tail.
        let replayed = replay_committed(&mut log, &file, page_size)?;
        if let Some(counters) = replayed {
            warn!(path = %path.display(), "replayed write-ahead log");
            header.pages = counters.0;
            header.freed = counters.1;
            header.freelist = PageId(counters.2);
            header.checksum = checksum_of(&file, page_size, page_size.trailing_zeros(), header.pages)?;
            clean = false;
        }
        log.set_len(0)?;
        log.seek(SeekFrom::Start(0))?;

        let shift = page_size.trailing_zeros();
        header.consistency = Consistency::Check;
        write_data_header(&file, &header, page_size)?;
        file.sync_all()?;

        debug!(path = %path.display(), clean, "opened page file (wal)");
        Ok(WalDiskManager {
            path: path.to_path_buf(),
            page_size,
            shift,
            file_type: header.file_type,
            opened_clean: clean,
            inner: Mutex::new(WalInner {
                file,
                log,
                log_path,
                header: header.clone(),
                committed: header,
                overlay: HashMap::new(),
                closed: false,
            }),
        })
    }

    fn locked(&self) -> DbResult<parking_lot::MutexGuard<'_, WalInner>> {
        let inner = self.inner.lock();
        if inner.closed {
            return Err(DbError::TransactionDboClosed(
                self.path.display().to_string(),
            ));
        }
        Ok(inner)
    }

    fn log_update(&self, inner: &mut WalInner, id: PageId, data: &[u8]) -> DbResult<()> {
        let entry = LogEntry::Update {
            id: id.0,
            data: data.to_vec(),
        };
        append_entry(&mut inner.log, &entry)?;
        inner.overlay.insert(id.0, data.to_vec().into_boxed_slice());
        Ok(())
    }

    /// Current content of a page: the transaction's own overlay image wins
    /// over the committed data file.
    fn page_image(&self, inner: &WalInner, id: PageId) -> DbResult<Box<[u8]>> {
        if let Some(image) = inner.overlay.get(&id.0) {
            return Ok(image.clone());
        }
        if id.0 > inner.committed.pages {
            return Err(DbError::DataCorruption(format!(
                "page {id} missing from '{}'",
                self.path.display()
            )));
        }
        let mut handle = &inner.file;
        let mut buf = vec![0u8; self.page_size];
        handle.seek(SeekFrom::Start(id.0 << self.shift))?;
        handle.read_exact(&mut buf)?;
        Ok(buf.into_boxed_slice())
    }
}

impl DiskManager for WalDiskManager {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn pages(&self) -> u64 {
        self.inner.lock().header.pages
    }

    fn file_type(&self) -> FileType {
        self.file_type
    }

    fn opened_clean(&self) -> bool {
        self.opened_clean
    }

    fn read(&self, id: PageId, page: &mut Page) -> DbResult<()> {
        let inner = self.locked()?;
        if !id.is_valid() || id.0 > inner.header.pages {
            return Err(DbError::DataCorruption(format!(
                "page {id} out of bounds in '{}' (1..={})",
                self.path.display(),
                inner.header.pages
            )));
        }
        let image = self.page_image(&inner, id)?;
        page.as_mut_slice().copy_from_slice(&image);
        Ok(())
    }

    fn update(&self, id: PageId, page: &Page) -> DbResult<()> {
        let mut inner = self.locked()?;
        if !id.is_valid() || id.0 > inner.header.pages {
            return Err(DbError::DataCorruption(format!(
                "page {id} out of bounds in '{}' (1..={})",
                self.path.display(),
                inner.header.pages
            )));
        }
        self.log_update(&mut inner, id, page.as_slice())
    }

    fn allocate(&self, page: Option<&Page>) -> DbResult<PageId> {
        let mut inner = self.locked()?;
        let id = if inner.header.freelist.is_valid() {
            // Unlink the lowest freed page from the chain (see the direct
            // manager for the layout).
            let mut cursor = inner.header.freelist;
            let mut prev = PageId::RESERVED;
            let mut best = cursor;
            let mut best_prev = PageId::RESERVED;
            let mut best_next = PageId::RESERVED;
            while cursor.is_valid() {
                let image = self.page_image(&inner, cursor)?;
                let next = PageId(u64::from_le_bytes(image[..8].try_into().unwrap()));
                if cursor <= best {
                    best = cursor;
                    best_prev = prev;
                    best_next = next;
                }
                prev = cursor;
                cursor = next;
            }
            if best_prev.is_valid() {
                let mut image = self.page_image(&inner, best_prev)?;
                image[..8].copy_from_slice(&best_next.0.to_le_bytes());
                self.log_update(&mut inner, best_prev, &image)?;
            } else {
                inner.header.freelist = best_next;
            }
            inner.header.freed = inner.header.freed.saturating_sub(1);
            best
        } else {
            inner.header.pages += 1;
            PageId(inner.header.pages)
        };

        let zero;
        let content = match page {
            Some(p) => p.as_slice(),
            None => {
                zero = vec![0u8; self.page_size];
                &zero
            }
        };
        self.log_update(&mut inner, id, content)?;
        Ok(id)
    }

    fn free(&self, id: PageId) -> DbResult<()> {
        let mut inner = self.locked()?;
        if !id.is_valid() || id.0 > inner.header.pages {
            return Err(DbError::DataCorruption(format!(
                "page {id} out of bounds in '{}' (1..={})",
                self.path.display(),
                inner.header.pages
            )));
        }
        let mut link = vec![0u8; self.page_size];
        link[..8].copy_from_slice(&inner.header.freelist.0.to_le_bytes());
        self.log_update(&mut inner, id, &link)?;
        inner.header.freelist = id;
        inner.header.freed += 1;
        Ok(())
    }

    fn commit(&self) -> DbResult<()> {
        let mut inner = self.locked()?;

        // Force the log before touching the data file.
        let marker = LogEntry::Commit {
            pages: inner.header.pages,
            freed: inner.header.freed,
            freelist: inner.header.freelist.0,
        };
        append_entry(&mut inner.log, &marker)?;
        inner.log.sync_all()?;

        // Checkpoint: apply the overlay, refresh the checksum, publish the
        // header, then drop the log.
        let mut ids: Vec<u64> = inner.overlay.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let image = inner.overlay[&id].clone();
            let mut handle = &inner.file;
            handle.seek(SeekFrom::Start(id << self.shift))?;
            handle.write_all(&image)?;
        }
        let checksum = checksum_of(&inner.file, self.page_size, self.shift, inner.header.pages)?;
        inner.header.checksum = checksum;
        inner.header.consistency = Consistency::Ok;
        write_data_header(&inner.file, &inner.header, self.page_size)?;
        inner.file.sync_all()?;

        inner.log.set_len(0)?;
        inner.log.seek(SeekFrom::Start(0))?;
        inner.overlay.clear();
        inner.committed = inner.header.clone();
        debug!(path = %self.path.display(), pages = inner.header.pages, "committed page file (wal)");
        Ok(())
    }

    fn rollback(&self) -> DbResult<()> {
        let mut inner = self.locked()?;
        inner.log.set_len(0)?;
        inner.log.seek(SeekFrom::Start(0))?;
        inner.overlay.clear();
        inner.header = inner.committed.clone();
        Ok(())
    }

    fn calculate_checksum(&self) -> DbResult<u64> {
        let inner = self.locked()?;
        checksum_of(&inner.file, self.page_size, self.shift, inner.committed.pages)
    }

    fn stored_checksum(&self) -> u64 {
        self.inner.lock().committed.checksum
    }

    fn close(&self) -> DbResult<()> {
        {
            let inner = self.inner.lock();
            if inner.closed {
                return Ok(());
            }
        }
        self.commit()?;
        let mut inner = self.inner.lock();
        let _ = inner.file.unlock();
        let _ = std::fs::remove_file(&inner.log_path);
        inner.closed = true;
        debug!(path = %self.path.display(), "closed page file (wal)");
        Ok(())
    }
}

fn append_entry(log: &mut File, entry: &LogEntry) -> DbResult<()> {
    let bytes = encode_to_vec(entry, config::legacy())
        .map_err(|e| DbError::DataCorruption(format!("wal encode failed: {e}")))?;
    log.write_all(&(bytes.len() as u32).to_le_bytes())?;
    log.write_all(&bytes)?;
    Ok(())
}

/// Replay complete committed batches onto the data file. Returns the header
/// counters of the last applied batch, or `None` if nothing was applied.
fn replay_committed(
    log: &mut File,
    file: &File,
    page_size: usize,
) -> DbResult<Option<(u64, u32, u64)>> {
    log.seek(SeekFrom::Start(0))?;
    let shift = page_size.trailing_zeros();
    let mut batch: Vec<(u64, Vec<u8>)> = Vec::new();
    let mut applied = None;

    loop {
        let mut len_buf = [0u8; 4];
        match log.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        if log.read_exact(&mut buf).is_err() {
            break; // torn tail
        }
        let entry: LogEntry = match decode_from_slice(&buf, config::legacy()) {
            Ok((entry, _)) => entry,
            Err(_) => break, // torn tail
        };
        match entry {
            LogEntry::Update { id, data } => batch.push((id, data)),
            LogEntry::Commit {
                pages,
                freed,
                freelist,
            } => {
                let mut handle = file;
                for (id, data) in batch.drain(..) {
                    handle.seek(SeekFrom::Start(id << shift))?;
                    handle.write_all(&data)?;
                }
                applied = Some((pages, freed, freelist));
            }
        }
    }
    if applied.is_some() {
        file.sync_all()?;
    }
    Ok(applied)
}

fn write_data_header(file: &File, header: &FileHeader, page_size: usize) -> DbResult<()> {
    let mut page = Page::new(page_size);
    header.write(&mut page);
    let mut handle = file;
    handle.seek(SeekFrom::Start(page_size as u64))?;
    handle.write_all(page.as_slice())?;
    Ok(())
}
