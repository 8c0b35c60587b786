use parking_lot::lock_api::ArcRwLockWriteGuard;
use parking_lot::RawRwLock;
use serde::{Deserialize, Serialize};

use crate::common::types::{Page, PageId, Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::{BTreeNode, TreeOp};
use crate::index::btree::serialization::serialize_node;
use super::base::BPlusTree;
use super::context::Context;

/// A freshly split-off right sibling whose final parent is not yet known.
/// The page guard (latch + pin) and the in-memory node travel together
/// until the parent link settles and the node is written out.
struct SplitChild<K> {
    page_id: PageId,
    guard: ArcRwLockWriteGuard<RawRwLock, Page>,
    node: BTreeNode<K>,
}

impl<K> BPlusTree<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    /// Insert a key/rid pair. Returns false if the key already exists:
    /// the tree only supports unique keys.
    pub fn insert(&self, key: K, rid: Rid) -> Result<bool, BTreeError> {
        let mut ctx = Context::new();
        ctx.root_guard = Some(self.root_page_id.lock_arc());

        if ctx.root_page_id() == INVALID_PAGE_ID {
            self.start_new_tree(key, rid, &mut ctx)?;
            ctx.release_all(&self.buffer_pool)?;
            return Ok(true);
        }

        self.find_leaf_write(&key, TreeOp::Insert, &mut ctx)?;
        let leaf_level = ctx.levels.len() - 1;

        {
            let leaf = &mut ctx.levels[leaf_level];
            if !leaf.node.leaf_insert(key, rid) {
                ctx.release_all(&self.buffer_pool)?;
                return Ok(false);
            }
            leaf.dirty = true;
        }

        let leaf_is_full = {
            let leaf = &ctx.levels[leaf_level].node;
            leaf.size() == leaf.max_size
        };
        if leaf_is_full {
            self.split_leaf(leaf_level, &mut ctx)?;
        }

        ctx.release_all(&self.buffer_pool)?;
        Ok(true)
    }

    /// First insert into an empty tree: allocate the root leaf and publish it.
    fn start_new_tree(&self, key: K, rid: Rid, ctx: &mut Context<K>) -> Result<(), BTreeError> {
        let (page, page_id) = self.buffer_pool.new_page()?;
        let mut root = BTreeNode::new_leaf(page_id, INVALID_PAGE_ID, self.leaf_max_size);
        root.leaf_insert(key, rid);
        {
            let mut guard = page.write();
            serialize_node(&root, &mut guard)?;
        }
        self.buffer_pool.unpin_page(page_id, true)?;
        self.publish_root(page_id, ctx)
    }

    /// The leaf reached `max_size`: carve off a right sibling and push its
    /// first key into the parent.
    fn split_leaf(&self, leaf_level: usize, ctx: &mut Context<K>) -> Result<(), BTreeError> {
        let (sibling_page, sibling_id) = self.buffer_pool.new_page()?;
        let sibling_guard = sibling_page.write_arc();
        let sibling_node = ctx.levels[leaf_level].node.split_leaf(sibling_id);
        let separator = sibling_node.keys[0].clone();

        self.insert_into_parent(
            leaf_level,
            separator,
            SplitChild {
                page_id: sibling_id,
                guard: sibling_guard,
                node: sibling_node,
            },
            ctx,
        )
    }

    /// Install `(separator, right)` above the node at `level`, growing a new
    /// root or splitting the parent as needed. The crabbing invariant
    /// guarantees every node that may split here is still on the held path.
    fn insert_into_parent(
        &self,
        level: usize,
        separator: K,
        mut right: SplitChild<K>,
        ctx: &mut Context<K>,
    ) -> Result<(), BTreeError> {
        let left_id = ctx.levels[level].page_id;

        if ctx.levels[level].node.is_root() {
            debug_assert_eq!(level, 0);
            let (root_page, root_id) = self.buffer_pool.new_page()?;
            let mut root_node =
                BTreeNode::new_internal(root_id, INVALID_PAGE_ID, self.internal_max_size);
            root_node.keys.push(separator);
            root_node.children.push(left_id);
            root_node.children.push(right.page_id);
            {
                let mut guard = root_page.write();
                serialize_node(&root_node, &mut guard)?;
            }
            self.buffer_pool.unpin_page(root_id, true)?;

            {
                let left = &mut ctx.levels[level];
                left.node.parent_page_id = root_id;
                left.dirty = true;
            }
            right.node.parent_page_id = root_id;
            self.finish_split_child(right)?;
            return self.publish_root(root_id, ctx);
        }

        let parent_level = level - 1;
        debug_assert_eq!(
            ctx.levels[parent_level].page_id,
            ctx.levels[level].node.parent_page_id
        );

        if ctx.levels[parent_level].node.size() < ctx.levels[parent_level].node.max_size {
            let parent = &mut ctx.levels[parent_level];
            parent.node.internal_insert_after(left_id, separator, right.page_id);
            parent.dirty = true;
            right.node.parent_page_id = parent.page_id;
            return self.finish_split_child(right);
        }

        // The parent is full: host the entry anyway, then split the parent
        // and propagate its middle key one level up.
        let (sibling_page, sibling_id) = self.buffer_pool.new_page()?;
        let sibling_guard = sibling_page.write_arc();
        let (push_key, sibling_node) = {
            let parent = &mut ctx.levels[parent_level];
            parent.node.internal_insert_after(left_id, separator, right.page_id);
            parent.dirty = true;
            parent.node.split_internal(sibling_id)
        };

        // Children that moved into the new sibling point at the old parent;
        // the just-split right child is still in our hands, the rest are
        // patched through the pool.
        let parent_id = ctx.levels[parent_level].page_id;
        right.node.parent_page_id = if sibling_node.children.contains(&right.page_id) {
            sibling_id
        } else {
            parent_id
        };
        let moved: Vec<PageId> = sibling_node
            .children
            .iter()
            .copied()
            .filter(|&child| child != right.page_id)
            .collect();
        self.reparent_children(&moved, sibling_id, ctx)?;
        self.finish_split_child(right)?;

        self.insert_into_parent(
            parent_level,
            push_key,
            SplitChild {
                page_id: sibling_id,
                guard: sibling_guard,
                node: sibling_node,
            },
            ctx,
        )
    }

    /// The split child's parent link is final: write it out, unlatch, unpin.
    fn finish_split_child(&self, child: SplitChild<K>) -> Result<(), BTreeError> {
        let SplitChild {
            page_id,
            mut guard,
            node,
        } = child;
        serialize_node(&node, &mut guard)?;
        drop(guard);
        self.buffer_pool.unpin_page(page_id, true)?;
        Ok(())
    }
}
