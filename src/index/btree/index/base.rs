use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::common::types::{PageId, Rid, HEADER_PAGE_ID, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::{BTreeNode, TreeOp};
use crate::index::btree::serialization::{
    calculate_internal_max_size, calculate_leaf_max_size, deserialize_node, serialize_node,
};
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::HeaderPage;
use super::context::{Context, Level};

/// A clustered B+ tree mapping fixed-width keys to record ids, with every
/// node stored as a buffer-pool page.
///
/// Lookups couple shared latches down the tree; mutations crab write
/// latches, releasing all ancestors as soon as a safe child is reached. The
/// root pointer has its own mutex, conceptually the parent of the root.
pub struct BPlusTree<K> {
    name: String,
    pub(crate) buffer_pool: Arc<BufferPoolManager>,
    pub(crate) root_page_id: Arc<Mutex<PageId>>,
    pub(crate) leaf_max_size: usize,
    pub(crate) internal_max_size: usize,
    _phantom: PhantomData<K>,
}

impl<K> BPlusTree<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    /// Open (or register) the index `name`, sizing nodes from the key width.
    pub fn new(name: impl Into<String>, buffer_pool: Arc<BufferPoolManager>) -> Result<Self, BTreeError> {
        Self::with_max_sizes(
            name,
            buffer_pool,
            calculate_leaf_max_size::<K>(),
            calculate_internal_max_size::<K>(),
        )
    }

    /// Open (or register) the index `name` with explicit fanouts. The root
    /// page id is looked up in the header page so an index survives reopen.
    pub fn with_max_sizes(
        name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self, BTreeError> {
        assert!(leaf_max_size >= 3, "leaf fanout must be at least 3");
        assert!(internal_max_size >= 3, "internal fanout must be at least 3");
        let name = name.into();

        let header = HeaderPage::new();
        let page = buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        let (root_page_id, registered) = {
            let mut guard = page.write();
            match header.get_record(&guard, &name) {
                Some(root) => (root, false),
                None => {
                    header.insert_record(&mut guard, &name, INVALID_PAGE_ID)?;
                    (INVALID_PAGE_ID, true)
                }
            }
        };
        buffer_pool.unpin_page(HEADER_PAGE_ID, registered)?;

        Ok(Self {
            name,
            buffer_pool,
            root_page_id: Arc::new(Mutex::new(root_page_id)),
            leaf_max_size,
            internal_max_size,
            _phantom: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_empty(&self) -> bool {
        *self.root_page_id.lock() == INVALID_PAGE_ID
    }

    /// Point lookup. Latch-couples shared latches from the root down:
    /// the child is latched before the parent is released.
    pub fn find(&self, key: &K) -> Result<Option<Rid>, BTreeError> {
        let root_guard = self.root_page_id.lock();
        let root_id = *root_guard;
        if root_id == INVALID_PAGE_ID {
            return Ok(None);
        }

        let page = self.buffer_pool.fetch_page(root_id)?;
        let mut guard = page.read_arc();
        drop(root_guard);
        let mut current_id = root_id;

        loop {
            let node: BTreeNode<K> = deserialize_node(&guard)?;

            if node.is_leaf() {
                let result = node.lookup(key);
                drop(guard);
                self.buffer_pool.unpin_page(current_id, false)?;
                return Ok(result);
            }

            let child_id = node.child_at(node.child_index(key));
            let child_page = self.buffer_pool.fetch_page(child_id)?;
            let child_guard = child_page.read_arc();

            drop(guard);
            self.buffer_pool.unpin_page(current_id, false)?;

            guard = child_guard;
            current_id = child_id;
        }
    }

    /// Descend to the leaf covering `key` in write mode, crabbing write
    /// latches: ancestors are released as a block whenever the newly
    /// latched child is safe for `op`, then the child joins the held path.
    pub(crate) fn find_leaf_write(
        &self,
        key: &K,
        op: TreeOp,
        ctx: &mut Context<K>,
    ) -> Result<(), BTreeError> {
        let mut current_id = ctx.root_page_id();
        debug_assert_ne!(current_id, INVALID_PAGE_ID);

        loop {
            let page = self.buffer_pool.fetch_page(current_id)?;
            let guard = page.write_arc();
            let node: BTreeNode<K> = deserialize_node(&guard)?;

            if node.is_safe(op) {
                ctx.release_ancestors(&self.buffer_pool)?;
            }

            let next = if node.is_leaf() {
                None
            } else {
                Some(node.child_at(node.child_index(key)))
            };

            ctx.levels.push(Level {
                page_id: current_id,
                guard,
                node,
                dirty: false,
            });

            match next {
                Some(child_id) => current_id = child_id,
                None => return Ok(()),
            }
        }
    }

    /// Point the given children at a new parent. Pages latched by this very
    /// operation are patched in memory; everything else is fetched and
    /// rewritten under a short write latch (contention-free: any other path
    /// to these pages goes through latches we hold).
    pub(crate) fn reparent_children(
        &self,
        children: &[PageId],
        new_parent: PageId,
        ctx: &mut Context<K>,
    ) -> Result<(), BTreeError> {
        for &child_id in children {
            if let Some(level) = ctx.level_of(child_id) {
                level.node.parent_page_id = new_parent;
                level.dirty = true;
                continue;
            }

            let page = self.buffer_pool.fetch_page(child_id)?;
            {
                let mut guard = page.write();
                let mut node: BTreeNode<K> = deserialize_node(&guard)?;
                node.parent_page_id = new_parent;
                serialize_node(&node, &mut guard)?;
            }
            self.buffer_pool.unpin_page(child_id, true)?;
        }
        Ok(())
    }

    /// Install a new root page id under the held root-pointer lock and
    /// persist it in the header page.
    pub(crate) fn publish_root(&self, new_root: PageId, ctx: &mut Context<K>) -> Result<(), BTreeError> {
        ctx.set_root_page_id(new_root);
        log::debug!("index {}: root is now page {}", self.name, new_root);

        let header = HeaderPage::new();
        let page = self.buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        {
            let mut guard = page.write();
            header.update_record(&mut guard, &self.name, new_root)?;
        }
        self.buffer_pool.unpin_page(HEADER_PAGE_ID, true)?;
        Ok(())
    }

    /// Delete the pages queued during coalescing. Must run after
    /// `release_all`: nothing may still hold these frames latched or pinned.
    pub(crate) fn delete_marked_pages(&self, ctx: &mut Context<K>) -> Result<(), BTreeError> {
        for page_id in ctx.deleted.drain(..) {
            self.buffer_pool.delete_page(page_id)?;
        }
        Ok(())
    }
}
