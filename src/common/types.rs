use std::sync::Arc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Page size in bytes (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Page ID type
pub type PageId = u32;

/// Reserved page id meaning "no page"
pub const INVALID_PAGE_ID: PageId = PageId::MAX;

/// Page id 0 holds the index directory (index name -> root page id)
pub const HEADER_PAGE_ID: PageId = 0;

/// Transaction ID type
pub type TxnId = u32;

/// Buffer pool frame ID type
pub type FrameId = u32;

/// Slot index within a page
pub type SlotId = u32;

/// LSN (Log Sequence Number) type
pub type Lsn = u64;

/// Record ID - the logical identity of a tuple: (page id, slot)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Rid {
    pub page_id: PageId,
    pub slot_num: SlotId,
}

impl Rid {
    pub fn new(page_id: PageId, slot_num: SlotId) -> Self {
        Self { page_id, slot_num }
    }
}

/// Page structure
#[derive(Debug, Clone)]
pub struct Page {
    pub data: [u8; PAGE_SIZE],
    pub page_id: PageId,
    pub lsn: Lsn,
}

impl Page {
    pub fn new(page_id: PageId) -> Self {
        Self {
            data: [0; PAGE_SIZE],
            page_id,
            lsn: 0,
        }
    }
}

/// Smart pointer to a page; the RwLock is the page latch
pub type PagePtr = Arc<RwLock<Page>>;
