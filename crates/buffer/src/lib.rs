//! Buffer pool: a fixed set of page frames over one disk manager, with pin
//! counting and a pluggable eviction policy.
//!
//! # Architecture
//!
//! ```text
//! caller ── get(page, priority) ──▶ BufferPool ──▶ DiskManager
//!              ▲                        │
//!              └── PageRef (pinned) ◀───┘
//! ```
//!
//! `get` pins a frame; the returned [`PageRef`] unpins on drop. A frame
//! whose pin count reaches zero becomes an eviction candidate; candidates
//! are ranked by the [`EvictionQueue`] (the default orders by priority,
//! then recency, then access count). When every frame is pinned, `get`
//! parks until a pin is released or the eviction deadline expires.
//!
//! The pool offers no snapshot isolation: readers see the latest committed
//! pages plus their own transaction's writes; cross-transaction write
//! interleaving is prevented by entity-level locks above this layer.


mod eviction;

pub use eviction::{Candidate, EvictionQueue, LruEvictionQueue};

use common::{DbError, DbResult, PageId};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use storage::{DiskManager, Page};

/// Eviction priority hint attached to a pin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
}

impl Priority {
    fn from_u8(v: u8) -> Priority {
        match v {
            0 => Priority::Low,
            2 => Priority::High,
            _ => Priority::Normal,
        }
    }
}

struct Frame {
    page: RwLock<Page>,
    pins: AtomicUsize,
    dirty: AtomicBool,
    accessed: AtomicU64,
    last_access: AtomicU64,
    priority: AtomicU8,
}

struct PoolState {
    /// Page id → frame index for every bound frame.
    table: HashMap<PageId, usize>,
    /// Frame index → bound page id.
    bindings: Vec<Option<PageId>>,
    queue: Box<dyn EvictionQueue>,
}

struct Shared {
    disk: Arc<dyn DiskManager>,
    frames: Vec<Frame>,
    state: Mutex<PoolState>,
    released: Condvar,
    clock: AtomicU64,
    eviction_timeout: Duration,
}

/// A fixed-capacity buffer pool bound to one page file.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<Shared>,
}

impl BufferPool {
    /// Create a pool with `frames` resident frames and the default
    /// LRU-with-priority eviction policy.
    pub fn new(disk: Arc<dyn DiskManager>, frames: usize) -> BufferPool {
        BufferPool::with_queue(disk, frames, Box::new(LruEvictionQueue::new()))
    }

    /// Create a pool with a caller-supplied eviction policy.
    pub fn with_queue(
        disk: Arc<dyn DiskManager>,
        frames: usize,
        queue: Box<dyn EvictionQueue>,
    ) -> BufferPool {
        assert!(frames > 0, "buffer pool needs at least one frame");
        let page_size = disk.page_size();
        let mut pool_frames = Vec::with_capacity(frames);
        let mut state = PoolState {
            table: HashMap::new(),
            bindings: vec![None; frames],
            queue,
        };
        for i in 0..frames {
            pool_frames.push(Frame {
                page: RwLock::new(Page::new(page_size)),
                pins: AtomicUsize::new(0),
                dirty: AtomicBool::new(false),
                accessed: AtomicU64::new(0),
                last_access: AtomicU64::new(0),
                priority: AtomicU8::new(Priority::Normal as u8),
            });
            // Unbound frames are immediately disposable.
            state.queue.offer_candidate(Candidate {
                frame: i,
                priority: Priority::Low,
                last_access: 0,
                accessed: 0,
            });
        }
        BufferPool {
            shared: Arc::new(Shared {
                disk,
                frames: pool_frames,
                state: Mutex::new(state),
                released: Condvar::new(),
                clock: AtomicU64::new(1),
                eviction_timeout: Duration::from_secs(5),
            }),
        }
    }

    pub fn with_eviction_timeout(mut self, timeout: Duration) -> BufferPool {
        // Pools are cheap to configure before the first get.
        let shared = Arc::get_mut(&mut self.shared).expect("configure before sharing");
        shared.eviction_timeout = timeout;
        self
    }

    pub fn capacity(&self) -> usize {
        self.shared.frames.len()
    }

    /// Pin the given page, loading it from disk on a miss. Evicts the best
    /// candidate frame when the pool is full; parks until the configured
    /// deadline when every frame is pinned.
    pub fn get(&self, id: PageId, priority: Priority) -> DbResult<PageRef> {
        let shared = &self.shared;
        let deadline = Instant::now() + shared.eviction_timeout;
        let mut state = shared.state.lock();
        loop {
            if let Some(&idx) = state.table.get(&id) {
                let frame = &shared.frames[idx];
                if frame.pins.fetch_add(1, Ordering::SeqCst) == 0 {
                    state.queue.remove_candidate(idx);
                }
                self.touch(frame, priority);
                return Ok(PageRef {
                    shared: Arc::clone(shared),
                    frame: idx,
                    id,
                });
            }

            match state.queue.poll() {
                Some(victim) => {
                    let frame = &shared.frames[victim];
                    debug_assert_eq!(frame.pins.load(Ordering::SeqCst), 0);
                    // On any I/O failure the frame goes back into the
                    // queue unbound, so the pool never leaks capacity.
                    let io = (|| {
                        if let Some(old) = state.bindings[victim].take() {
                            state.table.remove(&old);
                            if frame.dirty.swap(false, Ordering::SeqCst) {
                                shared.disk.update(old, &frame.page.read())?;
                            }
                        }
                        let mut page = frame.page.write();
                        shared.disk.read(id, &mut page)
                    })();
                    if let Err(e) = io {
                        state.queue.offer_candidate(Candidate {
                            frame: victim,
                            priority: Priority::Low,
                            last_access: 0,
                            accessed: 0,
                        });
                        return Err(e);
                    }
                    frame.pins.store(1, Ordering::SeqCst);
                    frame.accessed.store(0, Ordering::SeqCst);
                    state.bindings[victim] = Some(id);
                    state.table.insert(id, victim);
                    self.touch(frame, priority);
                    return Ok(PageRef {
                        shared: Arc::clone(shared),
                        frame: victim,
                        id,
                    });
                }
                None => {
                    // Every frame is pinned; park until a release or the
                    // deadline.
                    if shared
                        .released
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        return Err(DbError::Timeout(format!(
                            "no evictable frame for page {id} within {:?}",
                            shared.eviction_timeout
                        )));
                    }
                }
            }
        }
    }

    /// Load a page into the pool without keeping it pinned.
    pub fn prefetch(&self, id: PageId) -> DbResult<()> {
        let _ = self.get(id, Priority::Low)?;
        Ok(())
    }

    /// Write back every dirty frame. Pages stay bound and pinned state is
    /// untouched.
    pub fn flush(&self) -> DbResult<()> {
        let state = self.shared.state.lock();
        for (idx, binding) in state.bindings.iter().enumerate() {
            if let Some(id) = binding {
                let frame = &self.shared.frames[idx];
                if frame.dirty.swap(false, Ordering::SeqCst) {
                    self.shared.disk.update(*id, &frame.page.read())?;
                }
            }
        }
        Ok(())
    }

    /// Drop every unpinned binding without writing anything back. Used on
    /// rollback, where dirty frames hold images the caller has abandoned.
    pub fn discard(&self) {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        for (i, binding) in state.bindings.iter_mut().enumerate() {
            let frame = &self.shared.frames[i];
            if frame.pins.load(Ordering::SeqCst) != 0 {
                continue;
            }
            if let Some(id) = binding.take() {
                state.table.remove(&id);
                frame.dirty.store(false, Ordering::SeqCst);
                state.queue.remove_candidate(i);
                state.queue.offer_candidate(Candidate {
                    frame: i,
                    priority: Priority::Low,
                    last_access: 0,
                    accessed: 0,
                });
            }
        }
    }

    /// Flush and drop all bindings. The underlying disk manager stays open;
    /// it is owned by the caller.
    pub fn close(&self) -> DbResult<()> {
        self.flush()?;
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        for (i, binding) in state.bindings.iter_mut().enumerate() {
            // Pinned frames stay bound; their refs still point at them.
            if self.shared.frames[i].pins.load(Ordering::SeqCst) != 0 {
                continue;
            }
            if let Some(id) = binding.take() {
                state.table.remove(&id);
                state.queue.remove_candidate(i);
                state.queue.offer_candidate(Candidate {
                    frame: i,
                    priority: Priority::Low,
                    last_access: 0,
                    accessed: 0,
                });
            }
        }
        Ok(())
    }

    fn touch(&self, frame: &Frame, priority: Priority) {
        let now = self.shared.clock.fetch_add(1, Ordering::SeqCst);
        frame.last_access.store(now, Ordering::SeqCst);
        frame.accessed.fetch_add(1, Ordering::SeqCst);
        frame.priority.store(priority as u8, Ordering::SeqCst);
    }
}

/// A pinned reference to a buffered page. Dropping it releases the pin;
/// when the count reaches zero the frame becomes an eviction candidate.
pub struct PageRef {
    shared: Arc<Shared>,
    frame: usize,
    id: PageId,
}

impl std::fmt::Debug for PageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageRef")
            .field("frame", &self.frame)
            .field("id", &self.id)
            .finish()
    }
}

impl PageRef {
    pub fn id(&self) -> PageId {
        self.id
    }

    /// Shared latch on the page content.
    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.shared.frames[self.frame].page.read()
    }

    /// Exclusive latch on the page content; marks the frame dirty.
    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        let frame = &self.shared.frames[self.frame];
        frame.dirty.store(true, Ordering::SeqCst);
        frame.page.write()
    }

    pub fn is_dirty(&self) -> bool {
        self.shared.frames[self.frame].dirty.load(Ordering::SeqCst)
    }
}

impl Drop for PageRef {
    fn drop(&mut self) {
        let frame = &self.shared.frames[self.frame];
        if frame.pins.fetch_sub(1, Ordering::SeqCst) == 1 {
            let mut state = self.shared.state.lock();
            // Re-check under the lock; a concurrent get may have re-pinned.
            if frame.pins.load(Ordering::SeqCst) == 0 && state.bindings[self.frame] == Some(self.id)
            {
                state.queue.offer_candidate(Candidate {
                    frame: self.frame,
                    priority: Priority::from_u8(frame.priority.load(Ordering::SeqCst)),
                    last_access: frame.last_access.load(Ordering::SeqCst),
                    accessed: frame.accessed.load(Ordering::SeqCst),
                });
                self.shared.released.notify_one();
            }
        }
    }
}
