use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Page, PageId, INVALID_PAGE_ID, PAGE_SIZE};

#[derive(Error, Debug)]
pub enum DiskManagerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),
}

/// DiskManager is responsible for the actual page-granular disk I/O.
///
/// Page 0 is reserved for the index directory and is never handed out by
/// `allocate_page`; it comes into existence the first time it is read.
pub struct DiskManager {
    db_file: Mutex<File>,
    next_page_id: AtomicU32,
}

impl DiskManager {
    /// Create a new DiskManager over the specified database file
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, DiskManagerError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_path)?;

        // Resume allocation after the last page already in the file.
        let pages_on_disk = (file.metadata()?.len() as usize / PAGE_SIZE) as PageId;
        let next_page_id = pages_on_disk.max(1);

        Ok(Self {
            db_file: Mutex::new(file),
            next_page_id: AtomicU32::new(next_page_id),
        })
    }

    /// Read a page from disk. Reading a page that has never been written
    /// yields a zeroed page, so freshly allocated ids are always readable.
    pub fn read_page(&self, page_id: PageId, page: &mut Page) -> Result<(), DiskManagerError> {
        if page_id == INVALID_PAGE_ID {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }

        let offset = Self::page_offset(page_id);
        let mut buffer = [0u8; PAGE_SIZE];

        {
            let mut file = self.db_file.lock();
            let file_size = file.metadata()?.len();

            if offset as u64 >= file_size {
                page.data.fill(0);
                page.page_id = page_id;
                return Ok(());
            }

            file.seek(SeekFrom::Start(offset as u64))?;
            file.read_exact(&mut buffer)?;
        }

        page.data.copy_from_slice(&buffer);
        page.page_id = page_id;

        Ok(())
    }

    /// Write a page to disk
    pub fn write_page(&self, page: &Page) -> Result<(), DiskManagerError> {
        if page.page_id == INVALID_PAGE_ID {
            return Err(DiskManagerError::InvalidPageId(page.page_id));
        }

        let offset = Self::page_offset(page.page_id);

        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(offset as u64))?;
        file.write_all(&page.data)?;
        file.flush()?;

        Ok(())
    }

    /// Allocate a new page id. Ids are handed out monotonically; the file is
    /// extended lazily when the page is first written.
    pub fn allocate_page(&self) -> Result<PageId, DiskManagerError> {
        Ok(self.next_page_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Release a page id. Space is not reclaimed; the id simply becomes dead.
    pub fn deallocate_page(&self, page_id: PageId) {
        log::trace!("deallocate page {}", page_id);
    }

    fn page_offset(page_id: PageId) -> usize {
        page_id as usize * PAGE_SIZE
    }
}
