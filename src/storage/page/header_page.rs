use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Page, PageId, PAGE_SIZE};
use crate::storage::page::error::PageError;

const RECORD_COUNT_OFFSET: usize = 0;
const RECORDS_OFFSET: usize = 4;
const NAME_SIZE: usize = 32;
const RECORD_SIZE: usize = NAME_SIZE + 4;

/// Codec for the index directory stored on `HEADER_PAGE_ID`.
///
/// The page holds `(index name -> root page id)` records: a u32 record count
/// followed by fixed-width entries of a zero-padded 32-byte name and the
/// root page id. A freshly zeroed page decodes as an empty directory.
pub struct HeaderPage;

impl Default for HeaderPage {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderPage {
    pub fn new() -> Self {
        Self {}
    }

    pub fn record_count(&self, page: &Page) -> u32 {
        LittleEndian::read_u32(&page.data[RECORD_COUNT_OFFSET..RECORD_COUNT_OFFSET + 4])
    }

    /// Register a new index. Fails if the name is already present.
    pub fn insert_record(&self, page: &mut Page, name: &str, root_id: PageId) -> Result<(), PageError> {
        if name.len() > NAME_SIZE {
            // the name must fit the fixed-width record
            return Err(PageError::InsufficientSpace);
        }
        if self.find_record(page, name).is_some() {
            return Err(PageError::DuplicateRecord);
        }

        let count = self.record_count(page) as usize;
        let offset = RECORDS_OFFSET + count * RECORD_SIZE;
        if offset + RECORD_SIZE > PAGE_SIZE {
            return Err(PageError::InsufficientSpace);
        }

        page.data[offset..offset + NAME_SIZE].fill(0);
        page.data[offset..offset + name.len()].copy_from_slice(name.as_bytes());
        LittleEndian::write_u32(&mut page.data[offset + NAME_SIZE..offset + RECORD_SIZE], root_id);
        LittleEndian::write_u32(
            &mut page.data[RECORD_COUNT_OFFSET..RECORD_COUNT_OFFSET + 4],
            count as u32 + 1,
        );

        Ok(())
    }

    /// Update the root page id of a registered index.
    pub fn update_record(&self, page: &mut Page, name: &str, root_id: PageId) -> Result<(), PageError> {
        match self.find_record(page, name) {
            Some(offset) => {
                LittleEndian::write_u32(
                    &mut page.data[offset + NAME_SIZE..offset + RECORD_SIZE],
                    root_id,
                );
                Ok(())
            }
            None => Err(PageError::RecordNotFound),
        }
    }

    /// Look up the root page id of an index by name.
    pub fn get_record(&self, page: &Page, name: &str) -> Option<PageId> {
        self.find_record(page, name).map(|offset| {
            LittleEndian::read_u32(&page.data[offset + NAME_SIZE..offset + RECORD_SIZE])
        })
    }

    fn find_record(&self, page: &Page, name: &str) -> Option<usize> {
        if name.len() > NAME_SIZE {
            return None;
        }
        let count = self.record_count(page) as usize;
        let mut padded = [0u8; NAME_SIZE];
        padded[..name.len()].copy_from_slice(name.as_bytes());

        (0..count)
            .map(|i| RECORDS_OFFSET + i * RECORD_SIZE)
            .find(|&offset| page.data[offset..offset + NAME_SIZE] == padded)
    }
}
