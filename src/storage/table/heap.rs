use std::sync::Arc;
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{PageId, Rid, TxnId, INVALID_PAGE_ID, PAGE_SIZE};
use crate::storage::buffer::{BufferPoolError, BufferPoolManager};
use crate::storage::page::{PageError, PageManager};
use crate::transaction::{Transaction, TransactionState};
use super::iterator::TableIterator;

#[derive(Error, Debug)]
pub enum TableHeapError {
    #[error("Tuple {0:?} not found")]
    TupleNotFound(Rid),

    #[error("Tuple does not fit in a page")]
    TupleTooLarge,

    #[error("Tuple update does not fit in its page")]
    NoSpaceForUpdate(Rid),

    #[error("Transaction {0} is aborted")]
    TransactionAborted(TxnId),

    #[error("Buffer pool error: {0}")]
    BufferPool(#[from] BufferPoolError),

    #[error("Page error: {0}")]
    Page(#[from] PageError),
}

// A tuple must fit on one page beside the header and its slot entry.
const MAX_TUPLE_SIZE: usize = PAGE_SIZE - 28;

/// A table heap: a doubly linked chain of slotted pages over the buffer
/// pool. Tuples are opaque byte slices addressed by `(page id, slot)`;
/// logical tuple locks are the executors' concern, physical consistency is
/// guaranteed by the page latches.
pub struct TableHeap {
    buffer_pool: Arc<BufferPoolManager>,
    page_manager: PageManager,
    first_page_id: PageId,
    /// Tail of the chain; also serialises chain extension.
    last_page_id: Mutex<PageId>,
}

impl TableHeap {
    /// Create a new table heap with one empty page.
    pub fn new(buffer_pool: Arc<BufferPoolManager>) -> Result<Self, TableHeapError> {
        let page_manager = PageManager::new();
        let (page, page_id) = buffer_pool.new_page()?;
        {
            let mut guard = page.write();
            page_manager.init_page(&mut guard);
        }
        buffer_pool.unpin_page(page_id, true)?;

        Ok(Self {
            buffer_pool,
            page_manager,
            first_page_id: page_id,
            last_page_id: Mutex::new(page_id),
        })
    }

    /// Reopen a table heap rooted at an existing first page.
    pub fn open(
        buffer_pool: Arc<BufferPoolManager>,
        first_page_id: PageId,
    ) -> Result<Self, TableHeapError> {
        let page_manager = PageManager::new();

        // Walk to the tail so inserts resume there.
        let mut last_page_id = first_page_id;
        loop {
            let page = buffer_pool.fetch_page(last_page_id)?;
            let next = {
                let guard = page.read();
                page_manager.next_page_id(&guard)
            };
            buffer_pool.unpin_page(last_page_id, false)?;
            match next {
                Some(next_id) => last_page_id = next_id,
                None => break,
            }
        }

        Ok(Self {
            buffer_pool,
            page_manager,
            first_page_id,
            last_page_id: Mutex::new(last_page_id),
        })
    }

    pub fn first_page_id(&self) -> PageId {
        self.first_page_id
    }

    /// Insert a tuple at the tail of the chain, extending it when the tail
    /// page is full. Returns the new tuple's rid.
    pub fn insert_tuple(&self, data: &[u8], txn: &Transaction) -> Result<Rid, TableHeapError> {
        self.check_active(txn)?;
        if data.len() > MAX_TUPLE_SIZE {
            return Err(TableHeapError::TupleTooLarge);
        }

        let mut last_page_id = self.last_page_id.lock();
        let mut current_id = *last_page_id;

        loop {
            let page = self.buffer_pool.fetch_page(current_id)?;
            let inserted = {
                let mut guard = page.write();
                match self.page_manager.insert_record(&mut guard, data) {
                    Ok(slot) => Some(slot),
                    Err(PageError::InsufficientSpace) => None,
                    Err(e) => {
                        drop(guard);
                        self.buffer_pool.unpin_page(current_id, false)?;
                        return Err(e.into());
                    }
                }
            };

            if let Some(slot) = inserted {
                self.buffer_pool.unpin_page(current_id, true)?;
                return Ok(Rid::new(current_id, slot));
            }

            // The tail is full: grow the chain by one page.
            let (new_page, new_page_id) = self.buffer_pool.new_page()?;
            {
                let mut guard = new_page.write();
                self.page_manager.init_page(&mut guard);
                self.page_manager.set_prev_page_id(&mut guard, Some(current_id));
            }
            {
                let mut guard = page.write();
                self.page_manager.set_next_page_id(&mut guard, Some(new_page_id));
            }
            self.buffer_pool.unpin_page(current_id, true)?;
            self.buffer_pool.unpin_page(new_page_id, true)?;

            *last_page_id = new_page_id;
            current_id = new_page_id;
        }
    }

    /// Read a tuple by rid.
    pub fn get_tuple(&self, rid: Rid, txn: &Transaction) -> Result<Vec<u8>, TableHeapError> {
        self.check_active(txn)?;
        if rid.page_id == INVALID_PAGE_ID {
            return Err(TableHeapError::TupleNotFound(rid));
        }

        let page = self.buffer_pool.fetch_page(rid.page_id)?;
        let result = {
            let guard = page.read();
            self.page_manager.get_record(&guard, rid.slot_num)
        };
        self.buffer_pool.unpin_page(rid.page_id, false)?;

        result.map_err(|e| match e {
            PageError::RecordNotFound | PageError::InvalidRecordId => {
                TableHeapError::TupleNotFound(rid)
            }
            other => other.into(),
        })
    }

    /// Overwrite a tuple in place. The rid stays stable; an image that no
    /// longer fits in the page is refused.
    pub fn update_tuple(&self, data: &[u8], rid: Rid, txn: &Transaction) -> Result<(), TableHeapError> {
        self.check_active(txn)?;

        let page = self.buffer_pool.fetch_page(rid.page_id)?;
        let result = {
            let mut guard = page.write();
            self.page_manager.update_record(&mut guard, rid.slot_num, data)
        };
        self.buffer_pool.unpin_page(rid.page_id, result.is_ok())?;

        result.map_err(|e| match e {
            PageError::RecordNotFound | PageError::InvalidRecordId => {
                TableHeapError::TupleNotFound(rid)
            }
            PageError::InsufficientSpace => TableHeapError::NoSpaceForUpdate(rid),
            other => other.into(),
        })
    }

    /// Delete a tuple. The slot is tombstoned so other rids stay valid.
    pub fn mark_delete(&self, rid: Rid, txn: &Transaction) -> Result<(), TableHeapError> {
        self.check_active(txn)?;

        let page = self.buffer_pool.fetch_page(rid.page_id)?;
        let result = {
            let mut guard = page.write();
            self.page_manager.delete_record(&mut guard, rid.slot_num)
        };
        self.buffer_pool.unpin_page(rid.page_id, result.is_ok())?;

        result.map_err(|e| match e {
            PageError::RecordNotFound | PageError::InvalidRecordId => {
                TableHeapError::TupleNotFound(rid)
            }
            other => other.into(),
        })
    }

    /// Iterate over every live tuple, first page to last, slot order.
    pub fn iter(&self, txn: &Transaction) -> Result<TableIterator, TableHeapError> {
        self.check_active(txn)?;
        Ok(TableIterator::new(
            self.buffer_pool.clone(),
            self.first_page_id,
        ))
    }

    fn check_active(&self, txn: &Transaction) -> Result<(), TableHeapError> {
        if txn.state() == TransactionState::Aborted {
            return Err(TableHeapError::TransactionAborted(txn.id()));
        }
        Ok(())
    }
}
