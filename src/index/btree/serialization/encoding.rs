use std::any::TypeId;
use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

use crate::common::types::{Page, PAGE_SIZE};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::{BTreeNode, NodeType};

// Header layout:
// - node_type: u8 (1 = leaf, 2 = internal)
// - lsn: u64
// - key_count: u16
// - max_size: u16
// - parent_page_id: u32
// - page_id: u32
// - next_page_id: u32 (leaf chain; INVALID_PAGE_ID on internal nodes)
pub(crate) const HEADER_SIZE: usize = 25;
// A u16 slot after the header records where values/children start.
pub(crate) const KEYS_OFFSET: usize = HEADER_SIZE + 2;

pub(crate) const LEAF_PAGE_TYPE: u8 = 1;
pub(crate) const INTERNAL_PAGE_TYPE: u8 = 2;

/// Serialize a B+ tree node into a page frame
pub fn serialize_node<K>(node: &BTreeNode<K>, page: &mut Page) -> Result<(), BTreeError>
where
    K: Serialize + Clone + Ord + 'static,
{
    page.data.fill(0);

    page.data[0] = match node.node_type {
        NodeType::Leaf => LEAF_PAGE_TYPE,
        NodeType::Internal => INTERNAL_PAGE_TYPE,
    };
    LittleEndian::write_u64(&mut page.data[1..9], page.lsn);
    LittleEndian::write_u16(&mut page.data[9..11], node.keys.len() as u16);
    LittleEndian::write_u16(&mut page.data[11..13], node.max_size as u16);
    LittleEndian::write_u32(&mut page.data[13..17], node.parent_page_id);
    LittleEndian::write_u32(&mut page.data[17..21], node.page_id);
    LittleEndian::write_u32(&mut page.data[21..25], node.next_page_id);

    // Serialize the keys
    let mut offset = KEYS_OFFSET;

    // Special case for i32 keys to avoid bincode overhead
    if TypeId::of::<K>() == TypeId::of::<i32>() {
        let keys = unsafe { &*(node.keys.as_slice() as *const [K] as *const [i32]) };
        for &key in keys {
            if offset + 4 > PAGE_SIZE {
                return Err(BTreeError::NodeTooLarge);
            }
            LittleEndian::write_i32(&mut page.data[offset..offset + 4], key);
            offset += 4;
        }
    } else {
        for key in &node.keys {
            let key_bytes = bincode::serialize(key)
                .map_err(|_| BTreeError::SerializationError("Failed to serialize key".to_string()))?;

            if offset + key_bytes.len() + 2 > PAGE_SIZE {
                return Err(BTreeError::NodeTooLarge);
            }

            // Key length prefix (2 bytes), then key data
            LittleEndian::write_u16(&mut page.data[offset..offset + 2], key_bytes.len() as u16);
            offset += 2;
            page.data[offset..offset + key_bytes.len()].copy_from_slice(&key_bytes);
            offset += key_bytes.len();
        }
    }

    // Record where values/children start
    let values_offset = offset;
    LittleEndian::write_u16(
        &mut page.data[HEADER_SIZE..HEADER_SIZE + 2],
        values_offset as u16,
    );

    match node.node_type {
        NodeType::Leaf => {
            // Rids: page_id and slot_num, 8 bytes each
            for value in &node.values {
                if offset + 8 > PAGE_SIZE {
                    return Err(BTreeError::NodeTooLarge);
                }
                LittleEndian::write_u32(&mut page.data[offset..offset + 4], value.page_id);
                offset += 4;
                LittleEndian::write_u32(&mut page.data[offset..offset + 4], value.slot_num);
                offset += 4;
            }
        }
        NodeType::Internal => {
            for child in &node.children {
                if offset + 4 > PAGE_SIZE {
                    return Err(BTreeError::NodeTooLarge);
                }
                LittleEndian::write_u32(&mut page.data[offset..offset + 4], *child);
                offset += 4;
            }
        }
    }

    Ok(())
}
