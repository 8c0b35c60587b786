use parking_lot::lock_api::{ArcMutexGuard, ArcRwLockWriteGuard};
use parking_lot::{RawMutex, RawRwLock};
use serde::Serialize;

use crate::common::types::{Page, PageId};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::BTreeNode;
use crate::index::btree::serialization::serialize_node;
use crate::storage::buffer::BufferPoolManager;

/// One write-latched node on the root-to-leaf path: the owned page guard
/// (latch + pin), the decoded node image, and whether the image diverged
/// from the page bytes.
pub(crate) struct Level<K> {
    pub page_id: PageId,
    pub guard: ArcRwLockWriteGuard<RawRwLock, Page>,
    pub node: BTreeNode<K>,
    pub dirty: bool,
}

/// Held-latch state of one tree write operation.
///
/// `root_guard` is the root-pointer lock, conceptually the parent of the
/// real root; `levels` is the chain of write-latched ancestors that have not
/// been proven safe, ending at the current node. Pages coalesced away are
/// collected in `deleted` and only deleted after every latch is released,
/// so no other thread can still hold them pinned through an ancestor.
pub(crate) struct Context<K> {
    pub root_guard: Option<ArcMutexGuard<RawMutex, PageId>>,
    pub levels: Vec<Level<K>>,
    pub deleted: Vec<PageId>,
}

impl<K> Context<K>
where
    K: Clone + Ord + Serialize + 'static,
{
    pub fn new() -> Self {
        Self {
            root_guard: None,
            levels: Vec::new(),
            deleted: Vec::new(),
        }
    }

    pub fn root_page_id(&self) -> PageId {
        **self
            .root_guard
            .as_ref()
            .expect("root pointer lock is not held")
    }

    pub fn set_root_page_id(&mut self, page_id: PageId) {
        **self
            .root_guard
            .as_mut()
            .expect("root pointer lock is not held") = page_id;
    }

    /// Release every latch held above the current node: the traversal
    /// reached a safe child. Ancestors are clean by construction.
    pub fn release_ancestors(&mut self, buffer_pool: &BufferPoolManager) -> Result<(), BTreeError> {
        for level in self.levels.drain(..) {
            debug_assert!(!level.dirty);
            let page_id = level.page_id;
            drop(level.guard);
            buffer_pool.unpin_page(page_id, false)?;
        }
        self.root_guard = None;
        Ok(())
    }

    /// Write back every modified node, then unlatch and unpin the whole
    /// path and drop the root-pointer lock.
    pub fn release_all(&mut self, buffer_pool: &BufferPoolManager) -> Result<(), BTreeError> {
        for mut level in self.levels.drain(..) {
            if level.dirty {
                serialize_node(&level.node, &mut level.guard)?;
            }
            let page_id = level.page_id;
            let dirty = level.dirty;
            drop(level.guard);
            buffer_pool.unpin_page(page_id, dirty)?;
        }
        self.root_guard = None;
        Ok(())
    }

    /// Stack position of a page, if it is latched by this operation.
    pub fn level_of(&mut self, page_id: PageId) -> Option<&mut Level<K>> {
        self.levels.iter_mut().find(|level| level.page_id == page_id)
    }
}
