use std::sync::Arc;

use crate::common::types::{PageId, Rid, SlotId, INVALID_PAGE_ID};
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::{PageError, PageManager};
use super::heap::TableHeapError;

/// Forward scan over a table heap's page chain, skipping tombstoned slots.
/// Pages are pinned only while a slot is being read.
pub struct TableIterator {
    buffer_pool: Arc<BufferPoolManager>,
    page_manager: PageManager,
    current_page_id: PageId,
    current_slot: SlotId,
}

impl TableIterator {
    pub(crate) fn new(buffer_pool: Arc<BufferPoolManager>, first_page_id: PageId) -> Self {
        Self {
            buffer_pool,
            page_manager: PageManager::new(),
            current_page_id: first_page_id,
            current_slot: 0,
        }
    }
}

impl Iterator for TableIterator {
    type Item = Result<(Rid, Vec<u8>), TableHeapError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current_page_id == INVALID_PAGE_ID {
                return None;
            }

            let page = match self.buffer_pool.fetch_page(self.current_page_id) {
                Ok(page) => page,
                Err(e) => {
                    self.current_page_id = INVALID_PAGE_ID;
                    return Some(Err(e.into()));
                }
            };

            let (item, next_page) = {
                let guard = page.read();
                let record_count = self.page_manager.record_count(&guard);
                let mut found = None;
                while self.current_slot < record_count {
                    let slot = self.current_slot;
                    self.current_slot += 1;
                    match self.page_manager.get_record(&guard, slot) {
                        Ok(data) => {
                            found = Some(Ok((Rid::new(self.current_page_id, slot), data)));
                            break;
                        }
                        Err(PageError::RecordNotFound) => continue, // tombstone
                        Err(e) => {
                            found = Some(Err(e.into()));
                            break;
                        }
                    }
                }
                (found, self.page_manager.next_page_id(&guard))
            };

            if self
                .buffer_pool
                .unpin_page(self.current_page_id, false)
                .is_err()
            {
                self.current_page_id = INVALID_PAGE_ID;
                return item;
            }

            match item {
                Some(result) => return Some(result),
                None => {
                    // page exhausted: move down the chain
                    self.current_page_id = next_page.unwrap_or(INVALID_PAGE_ID);
                    self.current_slot = 0;
                }
            }
        }
    }
}
