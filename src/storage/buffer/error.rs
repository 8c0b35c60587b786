use thiserror::Error;

use crate::common::types::PageId;
use crate::storage::disk::DiskManagerError;

#[derive(Error, Debug)]
pub enum BufferPoolError {
    #[error("Page {0} is not resident")]
    PageNotFound(PageId),

    #[error("Page {0} is not pinned")]
    PageNotPinned(PageId),

    #[error("Page {0} is pinned")]
    PagePinned(PageId),

    #[error("Buffer pool is full: all frames are pinned")]
    BufferPoolFull,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Disk manager error: {0}")]
    DiskManagerError(#[from] DiskManagerError),
}
