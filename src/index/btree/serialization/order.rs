use std::mem;

use crate::common::types::PAGE_SIZE;
use super::encoding::KEYS_OFFSET;

// Rid on a leaf: page id + slot, child pointer on an internal node: page id.
const LEAF_VALUE_SIZE: usize = 8;
const CHILD_POINTER_SIZE: usize = 4;

/// Estimate how many entries of key type `K` fit in a leaf page.
pub fn calculate_leaf_max_size<K>() -> usize {
    let key_size = encoded_key_size::<K>();
    let capacity = (PAGE_SIZE - KEYS_OFFSET) / (key_size + LEAF_VALUE_SIZE);
    clamp_fanout(capacity)
}

/// Estimate how many children fit in an internal page.
pub fn calculate_internal_max_size<K>() -> usize {
    let key_size = encoded_key_size::<K>();
    let capacity = (PAGE_SIZE - KEYS_OFFSET) / (key_size + CHILD_POINTER_SIZE);
    clamp_fanout(capacity)
}

// Rough estimate: in-memory size plus the 2-byte length prefix the codec
// writes for bincode keys. Fixed-width keys only waste the prefix bytes.
fn encoded_key_size<K>() -> usize {
    mem::size_of::<K>().max(1) + 2
}

// Split math needs at least 3 entries, and the on-page size field is a u16.
fn clamp_fanout(capacity: usize) -> usize {
    capacity.clamp(3, u16::MAX as usize)
}
