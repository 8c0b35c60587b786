use crate::common::types::{Page, PageId, SlotId, PAGE_SIZE};
use crate::storage::page::error::PageError;
use crate::storage::page::header::PageHeader;
use crate::storage::page::layout::{RecordLocation, HEADER_SIZE, RECORD_OFFSET_SIZE};

/// Codec for slotted heap pages.
///
/// Record data is stored from the beginning of the page (after the header);
/// the slot array grows backwards from the end of the page. Deleted records
/// keep their slot with length 0 so record ids stay stable.
pub struct PageManager;

impl Default for PageManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PageManager {
    pub fn new() -> Self {
        Self {}
    }

    pub fn init_page(&self, page: &mut Page) {
        page.data.fill(0);
        let header = PageHeader::new();
        page.data[0..HEADER_SIZE].copy_from_slice(&header.to_bytes());
    }

    pub fn get_header(&self, page: &Page) -> PageHeader {
        PageHeader::from_bytes(&page.data[0..HEADER_SIZE])
    }

    fn set_header(&self, page: &mut Page, header: &PageHeader) {
        page.data[0..HEADER_SIZE].copy_from_slice(&header.to_bytes());
    }

    pub fn record_count(&self, page: &Page) -> u32 {
        self.get_header(page).record_count
    }

    pub fn next_page_id(&self, page: &Page) -> Option<PageId> {
        self.get_header(page).next_page_id
    }

    pub fn set_next_page_id(&self, page: &mut Page, next: Option<PageId>) {
        let mut header = self.get_header(page);
        header.next_page_id = next;
        self.set_header(page, &header);
    }

    pub fn prev_page_id(&self, page: &Page) -> Option<PageId> {
        self.get_header(page).prev_page_id
    }

    pub fn set_prev_page_id(&self, page: &mut Page, prev: Option<PageId>) {
        let mut header = self.get_header(page);
        header.prev_page_id = prev;
        self.set_header(page, &header);
    }

    pub fn insert_record(&self, page: &mut Page, data: &[u8]) -> Result<SlotId, PageError> {
        let mut header = self.get_header(page);

        // Record size plus the slot entry for the record
        let record_size = data.len() as u32;
        let total_space_needed = record_size + RECORD_OFFSET_SIZE as u32;

        if header.free_space_size < total_space_needed {
            return Err(PageError::InsufficientSpace);
        }

        // Slot location for the record, counted from the end of the page
        let slot_array_pos = PAGE_SIZE - RECORD_OFFSET_SIZE * (header.record_count as usize + 1);

        let record_loc = RecordLocation {
            offset: header.free_space_offset,
            length: record_size,
        };

        // Write record data
        let data_end = header.free_space_offset as usize + data.len();
        page.data[header.free_space_offset as usize..data_end].copy_from_slice(data);

        // Write slot entry
        page.data[slot_array_pos..slot_array_pos + RECORD_OFFSET_SIZE]
            .copy_from_slice(&record_loc.to_bytes());

        header.free_space_offset += record_size;
        header.free_space_size -= total_space_needed;
        header.record_count += 1;
        self.set_header(page, &header);

        Ok(header.record_count - 1)
    }

    pub fn get_record(&self, page: &Page, slot: SlotId) -> Result<Vec<u8>, PageError> {
        let header = self.get_header(page);

        if slot >= header.record_count {
            return Err(PageError::InvalidRecordId);
        }

        let slot_pos = self.get_slot_position(slot, header.record_count);
        let record_loc = self.get_record_location(page, slot_pos);

        if record_loc.length == 0 {
            return Err(PageError::RecordNotFound); // Deleted record
        }

        let start = record_loc.offset as usize;
        let end = start + record_loc.length as usize;
        Ok(page.data[start..end].to_vec())
    }

    pub fn update_record(&self, page: &mut Page, slot: SlotId, data: &[u8]) -> Result<(), PageError> {
        let mut header = self.get_header(page);

        if slot >= header.record_count {
            return Err(PageError::InvalidRecordId);
        }

        let slot_pos = self.get_slot_position(slot, header.record_count);
        let record_loc = self.get_record_location(page, slot_pos);

        if record_loc.length == 0 {
            return Err(PageError::RecordNotFound); // Deleted record
        }

        let new_size = data.len() as u32;

        if new_size > record_loc.length {
            // The record grew: write the new image at the end of the data
            // section and repoint the slot, keeping the Rid stable.
            let space_needed = new_size - record_loc.length;
            if header.free_space_size < space_needed {
                return Err(PageError::InsufficientSpace);
            }

            let new_offset = header.free_space_offset;
            let new_end = new_offset as usize + data.len();
            page.data[new_offset as usize..new_end].copy_from_slice(data);

            let new_record_loc = RecordLocation {
                offset: new_offset,
                length: new_size,
            };
            page.data[slot_pos..slot_pos + RECORD_OFFSET_SIZE]
                .copy_from_slice(&new_record_loc.to_bytes());

            header.free_space_offset += new_size;
            header.free_space_size -= space_needed;
            self.set_header(page, &header);

            return Ok(());
        }

        // New image fits in place
        let start = record_loc.offset as usize;
        page.data[start..start + data.len()].copy_from_slice(data);

        if new_size < record_loc.length {
            let new_record_loc = RecordLocation {
                offset: record_loc.offset,
                length: new_size,
            };
            page.data[slot_pos..slot_pos + RECORD_OFFSET_SIZE]
                .copy_from_slice(&new_record_loc.to_bytes());
        }

        Ok(())
    }

    pub fn delete_record(&self, page: &mut Page, slot: SlotId) -> Result<(), PageError> {
        let mut header = self.get_header(page);

        if slot >= header.record_count {
            return Err(PageError::InvalidRecordId);
        }

        let slot_pos = self.get_slot_position(slot, header.record_count);
        let mut record_loc = self.get_record_location(page, slot_pos);

        if record_loc.length == 0 {
            return Err(PageError::RecordNotFound); // Already deleted
        }

        // Tombstone: the slot survives with length 0, space is reclaimed by
        // compaction, which never runs on a page with live pins.
        record_loc.length = 0;
        page.data[slot_pos..slot_pos + RECORD_OFFSET_SIZE].copy_from_slice(&record_loc.to_bytes());

        header.free_space_size += RECORD_OFFSET_SIZE as u32;
        self.set_header(page, &header);

        Ok(())
    }

    fn get_slot_position(&self, slot: SlotId, record_count: u32) -> usize {
        debug_assert!(slot < record_count);
        PAGE_SIZE - RECORD_OFFSET_SIZE * (slot as usize + 1)
    }

    fn get_record_location(&self, page: &Page, slot_pos: usize) -> RecordLocation {
        RecordLocation::from_bytes(&page.data[slot_pos..slot_pos + RECORD_OFFSET_SIZE])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::Page;

    #[test]
    fn test_insert_and_get() {
        let pm = PageManager::new();
        let mut page = Page::new(1);
        pm.init_page(&mut page);

        let slot_a = pm.insert_record(&mut page, b"first record").unwrap();
        let slot_b = pm.insert_record(&mut page, b"second").unwrap();
        assert_eq!(slot_a, 0);
        assert_eq!(slot_b, 1);

        assert_eq!(pm.get_record(&page, slot_a).unwrap(), b"first record");
        assert_eq!(pm.get_record(&page, slot_b).unwrap(), b"second");
        assert_eq!(pm.record_count(&page), 2);
    }

    #[test]
    fn test_delete_tombstones_slot() {
        let pm = PageManager::new();
        let mut page = Page::new(1);
        pm.init_page(&mut page);

        let slot_a = pm.insert_record(&mut page, b"aaa").unwrap();
        let slot_b = pm.insert_record(&mut page, b"bbb").unwrap();

        pm.delete_record(&mut page, slot_a).unwrap();
        assert!(matches!(pm.get_record(&page, slot_a), Err(PageError::RecordNotFound)));
        // Later slots keep their ids
        assert_eq!(pm.get_record(&page, slot_b).unwrap(), b"bbb");
        // Double delete reports the tombstone
        assert!(matches!(pm.delete_record(&mut page, slot_a), Err(PageError::RecordNotFound)));
    }

    #[test]
    fn test_update_in_place_and_grow() {
        let pm = PageManager::new();
        let mut page = Page::new(1);
        pm.init_page(&mut page);

        let slot = pm.insert_record(&mut page, b"short").unwrap();
        pm.update_record(&mut page, slot, b"tiny").unwrap();
        assert_eq!(pm.get_record(&page, slot).unwrap(), b"tiny");

        pm.update_record(&mut page, slot, b"a much longer record image").unwrap();
        assert_eq!(pm.get_record(&page, slot).unwrap(), b"a much longer record image");
    }

    #[test]
    fn test_page_fills_up() {
        let pm = PageManager::new();
        let mut page = Page::new(1);
        pm.init_page(&mut page);

        let blob = vec![7u8; 1000];
        let mut inserted = 0;
        loop {
            match pm.insert_record(&mut page, &blob) {
                Ok(_) => inserted += 1,
                Err(PageError::InsufficientSpace) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(inserted >= 3);
        assert!(inserted < 5);
    }
}
