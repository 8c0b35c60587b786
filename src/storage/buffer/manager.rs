use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use parking_lot::{Mutex, RwLock};

use crate::common::types::{FrameId, Page, PageId, PagePtr, INVALID_PAGE_ID};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::replacer::LruReplacer;
use crate::storage::disk::DiskManager;

/// Per-frame bookkeeping. The bytes themselves live in the frame's `PagePtr`
/// behind the page latch; pin count and dirty flag are only touched under
/// the pool mutex.
struct FrameInfo {
    page_id: PageId,
    pin_count: u32,
    is_dirty: bool,
}

impl FrameInfo {
    fn reset(&mut self) {
        self.page_id = INVALID_PAGE_ID;
        self.pin_count = 0;
        self.is_dirty = false;
    }
}

struct PoolState {
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
    replacer: LruReplacer,
    frames: Vec<FrameInfo>,
}

/// The buffer pool: the single source of truth for page residency and
/// pinning. All bookkeeping is serialised by one mutex; page bytes are
/// guarded by the per-frame latch in `PagePtr`.
///
/// The pool mutex is held only for table bookkeeping. Page latches and disk
/// I/O happen with the mutex released: an operation claims a frame (or a
/// transient pin) under the mutex, does its latch-and-I/O work, then takes
/// the mutex again to commit the bookkeeping.
pub struct BufferPoolManager {
    pool_size: usize,
    pages: Vec<PagePtr>,
    state: Mutex<PoolState>,
    disk_manager: Arc<DiskManager>,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, db_path: impl AsRef<Path>) -> Result<Self, BufferPoolError> {
        let disk_manager = Arc::new(DiskManager::new(db_path)?);
        Ok(Self::with_disk_manager(pool_size, disk_manager))
    }

    pub fn with_disk_manager(pool_size: usize, disk_manager: Arc<DiskManager>) -> Self {
        let mut pages = Vec::with_capacity(pool_size);
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);

        for i in 0..pool_size {
            pages.push(Arc::new(RwLock::new(Page::new(INVALID_PAGE_ID))));
            frames.push(FrameInfo {
                page_id: INVALID_PAGE_ID,
                pin_count: 0,
                is_dirty: false,
            });
            free_list.push_back(i as FrameId);
        }

        Self {
            pool_size,
            pages,
            state: Mutex::new(PoolState {
                page_table: HashMap::new(),
                free_list,
                replacer: LruReplacer::new(pool_size),
                frames,
            }),
            disk_manager,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }

    /// Fetch a page, pinning its frame. Resident pages are returned
    /// directly; otherwise a frame is taken from the free list or evicted
    /// from the replacer and the page is read from disk.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr, BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidOperation(
                "cannot fetch the invalid page id".to_string(),
            ));
        }

        {
            let mut state = self.state.lock();
            if let Some(&frame_id) = state.page_table.get(&page_id) {
                state.frames[frame_id as usize].pin_count += 1;
                state.replacer.pin(frame_id);
                return Ok(self.pages[frame_id as usize].clone());
            }
        }

        // Miss: claim a frame nothing else can reach, then load it with the
        // pool mutex released.
        let frame_id = self.acquire_frame()?;

        let read_result = {
            let mut page = self.pages[frame_id as usize].write();
            self.disk_manager.read_page(page_id, &mut page)
        };

        let mut state = self.state.lock();
        if let Err(e) = read_result {
            state.free_list.push_back(frame_id);
            return Err(e.into());
        }

        // Another thread may have loaded the same page while we were off
        // the mutex; its frame wins and ours goes back to the free list.
        if let Some(&winner) = state.page_table.get(&page_id) {
            state.free_list.push_back(frame_id);
            state.frames[winner as usize].pin_count += 1;
            state.replacer.pin(winner);
            return Ok(self.pages[winner as usize].clone());
        }

        let info = &mut state.frames[frame_id as usize];
        info.page_id = page_id;
        info.pin_count = 1;
        info.is_dirty = false;
        state.page_table.insert(page_id, frame_id);

        Ok(self.pages[frame_id as usize].clone())
    }

    /// Allocate a brand-new page, pinned, zero-filled, and written through
    /// to disk so a later fetch after eviction finds it.
    pub fn new_page(&self) -> Result<(PagePtr, PageId), BufferPoolError> {
        let frame_id = self.acquire_frame()?;

        let page_id = match self.disk_manager.allocate_page() {
            Ok(id) => id,
            Err(e) => {
                self.state.lock().free_list.push_back(frame_id);
                return Err(e.into());
            }
        };

        // The claimed frame is unreachable; zero and write it through with
        // the pool mutex released.
        let write_result = {
            let mut page = self.pages[frame_id as usize].write();
            page.data.fill(0);
            page.page_id = page_id;
            page.lsn = 0;
            self.disk_manager.write_page(&page)
        };

        let mut state = self.state.lock();
        if let Err(e) = write_result {
            state.free_list.push_back(frame_id);
            return Err(e.into());
        }

        let info = &mut state.frames[frame_id as usize];
        info.page_id = page_id;
        info.pin_count = 1;
        info.is_dirty = false;
        state.page_table.insert(page_id, frame_id);

        Ok((self.pages[frame_id as usize].clone(), page_id))
    }

    /// Drop one pin on a page, recording whether the caller dirtied it.
    /// When the pin count reaches zero the frame becomes evictable.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<(), BufferPoolError> {
        let mut state = self.state.lock();

        let frame_id = match state.page_table.get(&page_id) {
            Some(&id) => id,
            None => return Err(BufferPoolError::PageNotFound(page_id)),
        };

        let info = &mut state.frames[frame_id as usize];
        if info.pin_count == 0 {
            return Err(BufferPoolError::PageNotPinned(page_id));
        }

        info.is_dirty = info.is_dirty || is_dirty;
        info.pin_count -= 1;
        if info.pin_count == 0 {
            state.replacer.unpin(frame_id);
        }

        Ok(())
    }

    /// Write a resident page back to disk and clear its dirty flag. Pin
    /// state is untouched.
    pub fn flush_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        // Take a transient pin so the frame cannot be recycled, then wait on
        // the page latch with the pool mutex released.
        let frame_id = {
            let mut state = self.state.lock();
            let frame_id = match state.page_table.get(&page_id) {
                Some(&id) => id,
                None => return Err(BufferPoolError::PageNotFound(page_id)),
            };
            state.frames[frame_id as usize].pin_count += 1;
            state.replacer.pin(frame_id);
            frame_id
        };

        let result = {
            let page = self.pages[frame_id as usize].read();
            self.disk_manager.write_page(&page)
        };

        let mut state = self.state.lock();
        let info = &mut state.frames[frame_id as usize];
        info.pin_count -= 1;
        if result.is_ok() {
            info.is_dirty = false;
        }
        if info.pin_count == 0 {
            state.replacer.unpin(frame_id);
        }

        result.map_err(BufferPoolError::from)
    }

    /// Flush every resident dirty page.
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        let dirty_pages: Vec<PageId> = {
            let state = self.state.lock();
            state
                .page_table
                .iter()
                .filter(|&(_, &frame_id)| state.frames[frame_id as usize].is_dirty)
                .map(|(&page_id, _)| page_id)
                .collect()
        };

        for page_id in dirty_pages {
            match self.flush_page(page_id) {
                Ok(()) | Err(BufferPoolError::PageNotFound(_)) => {} // evicted meanwhile
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Delete a page. Non-resident pages succeed trivially; a pinned page
    /// refuses deletion. The frame returns to the free list.
    pub fn delete_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let mut state = self.state.lock();

        self.disk_manager.deallocate_page(page_id);

        let frame_id = match state.page_table.get(&page_id) {
            Some(&id) => id,
            None => return Ok(()),
        };

        if state.frames[frame_id as usize].pin_count > 0 {
            return Err(BufferPoolError::PagePinned(page_id));
        }

        state.replacer.pin(frame_id);
        state.frames[frame_id as usize].reset();
        state.page_table.remove(&page_id);
        state.free_list.push_back(frame_id);

        Ok(())
    }

    /// Claim a frame for reuse: free list first, otherwise evict the LRU
    /// victim. The returned frame is unmapped, unpinned, and outside both
    /// the free list and the replacer, so no other thread can reach it.
    ///
    /// A dirty victim is written back before it is unmapped, under a
    /// transient pin with the pool mutex released (the `flush_page`
    /// pattern). If the page is pinned or dirtied again while the mutex is
    /// down, the frame is no longer evictable and another victim is tried.
    fn acquire_frame(&self) -> Result<FrameId, BufferPoolError> {
        loop {
            let (frame_id, old_page_id) = {
                let mut state = self.state.lock();

                if let Some(frame_id) = state.free_list.pop_front() {
                    return Ok(frame_id);
                }

                let frame_id = state.replacer.victim().ok_or(BufferPoolError::BufferPoolFull)?;
                let info = &mut state.frames[frame_id as usize];
                debug_assert_eq!(info.pin_count, 0);
                let old_page_id = info.page_id;

                if !info.is_dirty {
                    info.page_id = INVALID_PAGE_ID;
                    state.page_table.remove(&old_page_id);
                    return Ok(frame_id);
                }

                // Clear the flag before flushing: anyone who dirties the
                // page while the mutex is down sets it again, and the
                // recheck below refuses the frame.
                info.pin_count = 1;
                info.is_dirty = false;
                (frame_id, old_page_id)
            };

            let result = {
                let page = self.pages[frame_id as usize].read();
                self.disk_manager.write_page(&page)
            };

            let mut state = self.state.lock();
            let pin_count = {
                let info = &mut state.frames[frame_id as usize];
                info.pin_count -= 1;
                info.pin_count
            };

            if let Err(e) = result {
                state.frames[frame_id as usize].is_dirty = true;
                if pin_count == 0 {
                    state.replacer.unpin(frame_id);
                }
                return Err(e.into());
            }

            if pin_count == 0 && !state.frames[frame_id as usize].is_dirty {
                // An unpin may have put the frame back in the replacer
                // while we flushed; take it out again before claiming.
                state.replacer.pin(frame_id);
                state.frames[frame_id as usize].page_id = INVALID_PAGE_ID;
                state.page_table.remove(&old_page_id);
                return Ok(frame_id);
            }

            // The victim is in use again; leave it resident and retry.
            if pin_count == 0 {
                state.replacer.unpin(frame_id);
            }
        }
    }
}
