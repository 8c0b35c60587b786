use serde::{Deserialize, Serialize};

use crate::common::types::{PageId, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::{BTreeNode, TreeOp};
use crate::index::btree::serialization::{deserialize_node, serialize_node};
use super::base::BPlusTree;
use super::context::Context;

impl<K> BPlusTree<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    /// Remove a key. Returns false if the key was not present. Underflowing
    /// nodes redistribute with or coalesce into a sibling; emptied pages are
    /// deleted only after every latch has been released.
    pub fn remove(&self, key: &K) -> Result<bool, BTreeError> {
        let mut ctx = Context::new();
        ctx.root_guard = Some(self.root_page_id.lock_arc());

        if ctx.root_page_id() == INVALID_PAGE_ID {
            ctx.release_all(&self.buffer_pool)?;
            return Ok(false);
        }

        self.find_leaf_write(key, TreeOp::Remove, &mut ctx)?;
        let leaf_level = ctx.levels.len() - 1;

        let removed = {
            let leaf = &mut ctx.levels[leaf_level];
            let removed = leaf.node.leaf_remove(key);
            if removed {
                leaf.dirty = true;
            }
            removed
        };

        if removed && ctx.levels[leaf_level].node.size() < ctx.levels[leaf_level].node.min_size() {
            self.coalesce_or_redistribute(leaf_level, &mut ctx)?;
        }

        ctx.release_all(&self.buffer_pool)?;
        self.delete_marked_pages(&mut ctx)?;
        Ok(removed)
    }

    /// Fix an underflowing node at `level`: borrow one entry from a sibling
    /// when the pair can afford it, otherwise merge the pair into its left
    /// member and recurse into the parent.
    fn coalesce_or_redistribute(&self, level: usize, ctx: &mut Context<K>) -> Result<(), BTreeError> {
        if ctx.levels[level].node.is_root() {
            return self.adjust_root(level, ctx);
        }

        // The node underflowed, so it was never safe on the way down and its
        // parent is still write-latched right above it.
        let parent_level = level - 1;
        let node_id = ctx.levels[level].page_id;
        let index = ctx.levels[parent_level]
            .node
            .value_index(node_id)
            .ok_or(BTreeError::InvalidPageFormat)?;
        let sibling_index = if index == 0 { 1 } else { index - 1 };
        let sibling_id = ctx.levels[parent_level].node.child_at(sibling_index);

        let sibling_page = self.buffer_pool.fetch_page(sibling_id)?;
        let mut sibling_guard = sibling_page.write_arc();
        let mut sibling_node: BTreeNode<K> = deserialize_node(&sibling_guard)?;

        let is_leaf = ctx.levels[level].node.is_leaf();
        let max_size = ctx.levels[level].node.max_size;
        let combined = ctx.levels[level].node.size() + sibling_node.size();
        let can_redistribute = if is_leaf {
            combined >= max_size
        } else {
            combined > max_size
        };

        if can_redistribute {
            let mut moved_child: Option<PageId> = None;
            {
                let (upper, lower) = ctx.levels.split_at_mut(level);
                let parent = &mut upper[parent_level];
                let node = &mut lower[0];

                if index == 0 {
                    // The sibling is right-adjacent: its first entry moves over.
                    if is_leaf {
                        sibling_node.leaf_move_first_to_end_of(&mut node.node);
                        parent.node.set_key_at(0, sibling_node.keys[0].clone());
                    } else {
                        let separator = parent.node.key_at(0).clone();
                        let new_separator =
                            sibling_node.internal_move_first_to_end_of(&mut node.node, separator);
                        parent.node.set_key_at(0, new_separator);
                        moved_child = node.node.children.last().copied();
                    }
                } else {
                    // The sibling is left-adjacent: its last entry moves over.
                    if is_leaf {
                        sibling_node.leaf_move_last_to_front_of(&mut node.node);
                        parent.node.set_key_at(index - 1, node.node.keys[0].clone());
                    } else {
                        let separator = parent.node.key_at(index - 1).clone();
                        let new_separator =
                            sibling_node.internal_move_last_to_front_of(&mut node.node, separator);
                        parent.node.set_key_at(index - 1, new_separator);
                        moved_child = node.node.children.first().copied();
                    }
                }
                node.dirty = true;
                parent.dirty = true;
            }

            if let Some(child) = moved_child {
                self.reparent_children(&[child], node_id, ctx)?;
            }
            serialize_node(&sibling_node, &mut sibling_guard)?;
            drop(sibling_guard);
            self.buffer_pool.unpin_page(sibling_id, true)?;
            return Ok(());
        }

        // Coalesce: the right member of the pair empties into the left one.
        if index == 0 {
            // This node survives; the right sibling is emptied into it.
            let adopted: Vec<PageId>;
            {
                let (upper, lower) = ctx.levels.split_at_mut(level);
                let parent = &mut upper[parent_level];
                let node = &mut lower[0];
                if is_leaf {
                    sibling_node.leaf_merge_into(&mut node.node);
                    adopted = Vec::new();
                } else {
                    let separator = parent.node.key_at(0).clone();
                    adopted = sibling_node.children.clone();
                    sibling_node.internal_merge_into(&mut node.node, separator);
                }
                parent.node.remove_entry(1);
                node.dirty = true;
                parent.dirty = true;
            }
            self.reparent_children(&adopted, node_id, ctx)?;
            drop(sibling_guard);
            self.buffer_pool.unpin_page(sibling_id, false)?;
            ctx.deleted.push(sibling_id);
        } else {
            // The left sibling survives; this node is emptied into it.
            let adopted: Vec<PageId>;
            {
                let (upper, lower) = ctx.levels.split_at_mut(level);
                let parent = &mut upper[parent_level];
                let node = &mut lower[0];
                if is_leaf {
                    node.node.leaf_merge_into(&mut sibling_node);
                    adopted = Vec::new();
                } else {
                    let separator = parent.node.key_at(index - 1).clone();
                    adopted = node.node.children.clone();
                    node.node.internal_merge_into(&mut sibling_node, separator);
                }
                parent.node.remove_entry(index);
                node.dirty = false; // the page dies with the operation
                parent.dirty = true;
            }
            self.reparent_children(&adopted, sibling_id, ctx)?;
            serialize_node(&sibling_node, &mut sibling_guard)?;
            drop(sibling_guard);
            self.buffer_pool.unpin_page(sibling_id, true)?;
            ctx.deleted.push(node_id);
        }

        if ctx.levels[parent_level].node.size() < ctx.levels[parent_level].node.min_size() {
            self.coalesce_or_redistribute(parent_level, ctx)?;
        }
        Ok(())
    }

    /// Shrink the root: an internal root left with a single child hands the
    /// root over to that child; an empty root leaf empties the tree.
    fn adjust_root(&self, level: usize, ctx: &mut Context<K>) -> Result<(), BTreeError> {
        debug_assert_eq!(level, 0);
        let (is_leaf, size, root_id) = {
            let root = &ctx.levels[level];
            (root.node.is_leaf(), root.node.size(), root.page_id)
        };

        if !is_leaf && size == 1 {
            let child_id = ctx.levels[level].node.child_at(0);
            self.reparent_children(&[child_id], INVALID_PAGE_ID, ctx)?;
            ctx.levels[level].dirty = false;
            ctx.deleted.push(root_id);
            self.publish_root(child_id, ctx)?;
        } else if is_leaf && size == 0 {
            ctx.levels[level].dirty = false;
            ctx.deleted.push(root_id);
            self.publish_root(INVALID_PAGE_ID, ctx)?;
        }
        Ok(())
    }
}
