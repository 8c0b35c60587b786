use std::any::TypeId;
use byteorder::{ByteOrder, LittleEndian};
use serde::Deserialize;

use crate::common::types::{Page, Rid, PAGE_SIZE};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::{BTreeNode, NodeType};
use super::encoding::{HEADER_SIZE, INTERNAL_PAGE_TYPE, KEYS_OFFSET, LEAF_PAGE_TYPE};

/// Deserialize a B+ tree node from a page frame
pub fn deserialize_node<K>(page: &Page) -> Result<BTreeNode<K>, BTreeError>
where
    K: for<'de> Deserialize<'de> + Clone + Ord + 'static,
{
    let node_type = match page.data[0] {
        LEAF_PAGE_TYPE => NodeType::Leaf,
        INTERNAL_PAGE_TYPE => NodeType::Internal,
        _ => return Err(BTreeError::InvalidPageFormat),
    };
    let key_count = LittleEndian::read_u16(&page.data[9..11]) as usize;
    let max_size = LittleEndian::read_u16(&page.data[11..13]) as usize;
    let parent_page_id = LittleEndian::read_u32(&page.data[13..17]);
    let page_id = LittleEndian::read_u32(&page.data[17..21]);
    let next_page_id = LittleEndian::read_u32(&page.data[21..25]);

    let values_offset = LittleEndian::read_u16(&page.data[HEADER_SIZE..HEADER_SIZE + 2]) as usize;

    // Read keys
    let mut offset = KEYS_OFFSET;
    let mut keys = Vec::with_capacity(key_count);

    // Special case for i32 keys to avoid bincode overhead
    if TypeId::of::<K>() == TypeId::of::<i32>() {
        for _ in 0..key_count {
            let key_value = LittleEndian::read_i32(&page.data[offset..offset + 4]);
            // Safety: the TypeId check above guarantees K is i32
            let key = unsafe { std::mem::transmute_copy::<i32, K>(&key_value) };
            keys.push(key);
            offset += 4;
        }
    } else {
        for _ in 0..key_count {
            let key_len = LittleEndian::read_u16(&page.data[offset..offset + 2]) as usize;
            offset += 2;

            let key_bytes = &page.data[offset..offset + key_len];
            let key = bincode::deserialize(key_bytes).map_err(|_| {
                BTreeError::DeserializationError("Failed to deserialize key".to_string())
            })?;
            keys.push(key);
            offset += key_len;
        }
    }

    let is_leaf = node_type == NodeType::Leaf;
    let mut values = Vec::with_capacity(if is_leaf { key_count } else { 0 });
    let mut children = Vec::with_capacity(if is_leaf { 0 } else { key_count + 1 });

    offset = values_offset;

    if is_leaf {
        for _ in 0..key_count {
            if offset + 8 > PAGE_SIZE {
                return Err(BTreeError::DeserializationError(
                    "Not enough data for Rid".to_string(),
                ));
            }
            let rid_page_id = LittleEndian::read_u32(&page.data[offset..offset + 4]);
            offset += 4;
            let slot_num = LittleEndian::read_u32(&page.data[offset..offset + 4]);
            offset += 4;
            values.push(Rid::new(rid_page_id, slot_num));
        }
    } else {
        // Internal nodes have key_count + 1 children
        for _ in 0..key_count + 1 {
            if offset + 4 > PAGE_SIZE {
                return Err(BTreeError::DeserializationError(
                    "Not enough data for child pointer".to_string(),
                ));
            }
            children.push(LittleEndian::read_u32(&page.data[offset..offset + 4]));
            offset += 4;
        }
    }

    Ok(BTreeNode {
        node_type,
        page_id,
        parent_page_id,
        max_size,
        keys,
        values,
        children,
        next_page_id,
    })
}
