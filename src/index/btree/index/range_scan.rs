use std::sync::Arc;

use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::RawRwLock;
use serde::{Deserialize, Serialize};

use crate::common::types::{Page, PageId, Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::BTreeNode;
use crate::index::btree::serialization::deserialize_node;
use crate::storage::buffer::BufferPoolManager;
use super::base::BPlusTree;

/// Forward iterator over the leaf chain, yielding entries in key order.
///
/// The iterator owns a shared latch and a pin on the current leaf. Moving
/// past the last slot latches the next leaf before the current one is
/// released (hand over hand), so a concurrent split cannot slip between.
pub struct TreeIterator<K> {
    buffer_pool: Arc<BufferPoolManager>,
    guard: Option<ArcRwLockReadGuard<RawRwLock, Page>>,
    node: Option<BTreeNode<K>>,
    page_id: PageId,
    index: usize,
}

impl<K> TreeIterator<K>
where
    K: Clone + Ord + for<'de> Deserialize<'de> + 'static,
{
    fn empty(buffer_pool: Arc<BufferPoolManager>) -> Self {
        Self {
            buffer_pool,
            guard: None,
            node: None,
            page_id: INVALID_PAGE_ID,
            index: 0,
        }
    }

    fn release(&mut self) {
        if self.guard.take().is_some() {
            let _ = self.buffer_pool.unpin_page(self.page_id, false);
        }
        self.node = None;
    }
}

impl<K> Iterator for TreeIterator<K>
where
    K: Clone + Ord + for<'de> Deserialize<'de> + 'static,
{
    type Item = Result<(K, Rid), BTreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let node = self.node.as_ref()?;

            if self.index < node.keys.len() {
                let item = (node.keys[self.index].clone(), node.values[self.index]);
                self.index += 1;
                return Some(Ok(item));
            }

            let next_id = node.next_page_id;
            if next_id == INVALID_PAGE_ID {
                self.release();
                return None;
            }

            // Latch the next leaf before letting go of the current one.
            let next_page = match self.buffer_pool.fetch_page(next_id) {
                Ok(page) => page,
                Err(e) => {
                    self.release();
                    return Some(Err(e.into()));
                }
            };
            let next_guard = next_page.read_arc();
            let next_node = match deserialize_node::<K>(&next_guard) {
                Ok(node) => node,
                Err(e) => {
                    drop(next_guard);
                    let _ = self.buffer_pool.unpin_page(next_id, false);
                    self.release();
                    return Some(Err(e));
                }
            };

            self.release();
            self.guard = Some(next_guard);
            self.node = Some(next_node);
            self.page_id = next_id;
            self.index = 0;
        }
    }
}

impl<K> Drop for TreeIterator<K> {
    fn drop(&mut self) {
        if self.guard.take().is_some() {
            let _ = self.buffer_pool.unpin_page(self.page_id, false);
        }
    }
}

impl<K> BPlusTree<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    /// Iterate from the leftmost leaf.
    pub fn iter(&self) -> Result<TreeIterator<K>, BTreeError> {
        self.seeded_iterator(None)
    }

    /// Iterate from the first key >= `key`.
    pub fn iter_from(&self, key: &K) -> Result<TreeIterator<K>, BTreeError> {
        self.seeded_iterator(Some(key))
    }

    /// Collect every rid with `start <= key <= end`.
    pub fn range_scan(&self, start: &K, end: &K) -> Result<Vec<Rid>, BTreeError> {
        if start > end {
            return Ok(Vec::new());
        }
        let mut result = Vec::new();
        for entry in self.iter_from(start)? {
            let (key, rid) = entry?;
            if &key > end {
                break;
            }
            result.push(rid);
        }
        Ok(result)
    }

    /// Descend with read-latch coupling to the starting leaf: the leftmost
    /// one, or the leaf covering `key`.
    fn seeded_iterator(&self, key: Option<&K>) -> Result<TreeIterator<K>, BTreeError> {
        let root_guard = self.root_page_id.lock();
        let root_id = *root_guard;
        if root_id == INVALID_PAGE_ID {
            return Ok(TreeIterator::empty(self.buffer_pool.clone()));
        }

        let page = self.buffer_pool.fetch_page(root_id)?;
        let mut guard = page.read_arc();
        drop(root_guard);
        let mut current_id = root_id;

        loop {
            let node: BTreeNode<K> = deserialize_node(&guard)?;

            if node.is_leaf() {
                let index = key.map(|k| node.key_index(k)).unwrap_or(0);
                return Ok(TreeIterator {
                    buffer_pool: self.buffer_pool.clone(),
                    guard: Some(guard),
                    node: Some(node),
                    page_id: current_id,
                    index,
                });
            }

            let child_id = match key {
                Some(k) => node.child_at(node.child_index(k)),
                None => node.child_at(0),
            };
            let child_page = self.buffer_pool.fetch_page(child_id)?;
            let child_guard = child_page.read_arc();

            drop(guard);
            self.buffer_pool.unpin_page(current_id, false)?;

            guard = child_guard;
            current_id = child_id;
        }
    }
}
