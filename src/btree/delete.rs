use std::sync::Arc;

use log::debug;

use super::{
    node::{ChildSlot, NodeBody},
    tree::BPlusTree,
};
use crate::{
    cache::manager::{AccessSet, WriteLatch},
    error::StoreError,
    types::{Key, StoreResult},
};

/// delete-related methods
impl BPlusTree {
    /// The delete descent mirrors the insert descent; an index node is
    /// safe once losing a pivot cannot push it below minimum occupancy
    /// (for the root: once it keeps at least one pivot after a child
    /// merge).
    pub(crate) fn remove_unlogged(&self, key: Key) -> StoreResult {
        let mut access = AccessSet::new(&self.cache);
        let (root_slot, root_latch) = self.latch_root_for_write(&mut access)?;
        let mut root_slot = Some(root_slot);
        let mut chain: Vec<WriteLatch> = vec![root_latch];

        loop {
            let is_root = root_slot.is_some() && chain.len() == 1;
            let safe = match chain.last().expect("chain is never empty").body() {
                NodeBody::Index(node) => {
                    if is_root {
                        node.pivot_count() >= 2
                    } else {
                        node.pivot_count() > self.min_keys()
                    }
                }
                NodeBody::Data(_) => break,
            };

            if safe {
                if chain.len() > 1 {
                    chain.drain(..chain.len() - 1);
                }
                root_slot = None;
            }

            let (child, parent_dirtied) = {
                let tail = chain.last_mut().expect("chain is never empty");
                let node = tail
                    .guard
                    .as_mut()
                    .and_then(|body| body.as_index_mut())
                    .expect("checked to be an index node");
                let idx = node.child_index(key);
                self.cache.pin_child_for_write(node.child_mut(idx), &mut access)?
            };
            if parent_dirtied {
                chain.last().expect("chain is never empty").obj.set_dirty(true);
            }
            chain.push(child);
        }

        // the mutation; an absent key aborts here with nothing changed
        {
            let leaf = chain.last_mut().expect("chain is never empty");
            let node = leaf
                .guard
                .as_mut()
                .and_then(|body| body.as_data_mut())
                .expect("descent ends at a data node");
            node.remove(key)?;
            leaf.obj.set_dirty(true);
        }

        // resolve underflows bottom-up through the retained chain
        let mut level = chain.len() - 1;
        while level > 0 {
            let underflow = chain[level].body().key_count() < self.min_keys();
            if !underflow {
                break;
            }
            self.rebalance_level(&mut chain, level, key, &mut access)?;
            level -= 1;
        }

        if let Some(slot) = root_slot.as_mut() {
            self.maybe_collapse_root(&mut chain, slot)?;
        }
        Ok(())
    }

    /// A root index node left with no pivots has a single child; that
    /// child becomes the new root and the old root is dropped.
    fn maybe_collapse_root(
        &self,
        chain: &mut Vec<WriteLatch>,
        root_slot: &mut ChildSlot,
    ) -> StoreResult {
        let root = chain.first_mut().expect("chain is never empty");
        let collapse = match root.guard.as_ref() {
            Some(NodeBody::Index(node)) => node.pivot_count() == 0,
            _ => false,
        };
        if !collapse {
            return Ok(());
        }

        let sole_child = {
            let node = root
                .guard
                .as_mut()
                .and_then(|body| body.as_index_mut())
                .expect("checked to be an index node");
            node.remove_child(0)
        };
        root_slot.uid = sole_child.uid;
        if let Some(ptr) = &sole_child.ptr {
            // absorb a rename pending from the child's last flush
            if let Some(new_uid) = ptr.uid_updated() {
                let old_uid = ptr.uid();
                ptr.set_uid(new_uid);
                ptr.clear_uid_updated();
                self.cache.rekey(old_uid, new_uid, ptr);
                root_slot.uid = new_uid;
            }
        }
        root_slot.ptr = sole_child.ptr;
        self.cache.discard(&root.obj, &mut root.guard);
        debug!("tree shrank a level, new root {:?}", root_slot.uid);
        Ok(())
    }

    /// Fix an underflowing node at `chain[level]` with its sibling under
    /// the (still latched) parent at `chain[level - 1]`: borrow one entry
    /// through the separator when the sibling has spare keys, merge the
    /// sibling in otherwise. The left sibling is preferred for both.
    fn rebalance_level(
        &self,
        chain: &mut Vec<WriteLatch>,
        level: usize,
        key: Key,
        access: &mut AccessSet,
    ) -> StoreResult {
        let (upper, lower) = chain.split_at_mut(level);
        let parent = upper.last_mut().expect("level > 0");
        let cur = &mut lower[0];

        let pnode = parent
            .guard
            .as_mut()
            .and_then(|body| body.as_index_mut())
            .ok_or_else(|| StoreError::internal("ancestor is not an index node"))?;

        let child_idx = pnode.child_index(key);
        debug_assert!(
            pnode
                .child(child_idx)
                .ptr
                .as_ref()
                .map_or(false, |ptr| Arc::ptr_eq(ptr, &cur.obj)),
            "descent position does not match the latched child"
        );

        let from_left = child_idx > 0;
        let sib_idx = if from_left { child_idx - 1 } else { child_idx + 1 };
        let sep_idx = if from_left { child_idx - 1 } else { child_idx };

        let (mut sibling, parent_dirtied) =
            self.cache.pin_child_for_write(pnode.child_mut(sib_idx), access)?;
        if parent_dirtied {
            parent.obj.set_dirty(true);
        }

        if sibling.body().key_count() > self.min_keys() {
            self.rotate(pnode, sep_idx, from_left, cur, &mut sibling)?;
            debug!(
                "rotated between {:?} and {:?}",
                cur.obj.uid(),
                sibling.obj.uid()
            );
        } else {
            self.merge(pnode, sep_idx, from_left, child_idx, cur, &mut sibling)?;
            debug!("merged {:?} into {:?}", sibling.obj.uid(), cur.obj.uid());
        }

        cur.obj.set_dirty(true);
        parent.obj.set_dirty(true);
        Ok(())
    }

    /// Move one entry from the sibling through the parent's separator.
    fn rotate(
        &self,
        pnode: &mut super::node::IndexNode,
        sep_idx: usize,
        from_left: bool,
        cur: &mut WriteLatch,
        sibling: &mut WriteLatch,
    ) -> StoreResult {
        sibling.obj.set_dirty(true);
        let cur_body = cur
            .guard
            .as_mut()
            .ok_or_else(|| StoreError::internal("latched node lost its core"))?;
        let sib_body = sibling
            .guard
            .as_mut()
            .ok_or_else(|| StoreError::internal("latched sibling lost its core"))?;

        match (cur_body, sib_body) {
            (NodeBody::Data(cur), NodeBody::Data(sib)) => {
                if from_left {
                    // the moved key is larger than everything left behind
                    // and becomes the new separator
                    let entry = sib
                        .pop_last()
                        .ok_or_else(|| StoreError::internal("sibling with spare keys is empty"))?;
                    pnode.set_pivot(sep_idx, entry.0);
                    cur.push_front(entry);
                } else {
                    let entry = sib
                        .pop_first()
                        .ok_or_else(|| StoreError::internal("sibling with spare keys is empty"))?;
                    cur.push_back(entry);
                    // the separator is the sibling's new smallest key
                    let new_sep = sib
                        .first_key()
                        .ok_or_else(|| StoreError::internal("sibling drained below minimum"))?;
                    pnode.set_pivot(sep_idx, new_sep);
                }
            }
            (NodeBody::Index(cur), NodeBody::Index(sib)) => {
                if from_left {
                    // rotate through the parent: the sibling's last pivot
                    // goes up, the old separator comes down
                    let moved_child = sib.remove_child(sib.child_count() - 1);
                    let promoted = sib.remove_pivot(sib.pivot_count() - 1);
                    let demoted = pnode.pivot(sep_idx);
                    pnode.set_pivot(sep_idx, promoted);
                    cur.insert_pivot(0, demoted);
                    cur.insert_child(0, moved_child);
                } else {
                    let moved_child = sib.remove_child(0);
                    let promoted = sib.remove_pivot(0);
                    let demoted = pnode.pivot(sep_idx);
                    pnode.set_pivot(sep_idx, promoted);
                    cur.insert_pivot(cur.pivot_count(), demoted);
                    cur.insert_child(cur.child_count(), moved_child);
                }
            }
            _ => {
                return Err(StoreError::internal(
                    "siblings disagree on their node kind",
                ))
            }
        }
        Ok(())
    }

    /// Absorb the sibling (and, for index nodes, the separator) into the
    /// current node. The emptied sibling is dropped from the cache and its
    /// slot and separator leave the parent.
    fn merge(
        &self,
        pnode: &mut super::node::IndexNode,
        sep_idx: usize,
        from_left: bool,
        child_idx: usize,
        cur: &mut WriteLatch,
        sibling: &mut WriteLatch,
    ) -> StoreResult {
        let separator = pnode.remove_pivot(sep_idx);
        let sib_slot_idx = if from_left { child_idx - 1 } else { child_idx + 1 };
        pnode.remove_child(sib_slot_idx);

        let sib_body = self
            .cache
            .discard(&sibling.obj, &mut sibling.guard)
            .ok_or_else(|| StoreError::internal("latched sibling lost its core"))?;
        let cur_body = cur
            .guard
            .as_mut()
            .ok_or_else(|| StoreError::internal("latched node lost its core"))?;

        match (cur_body, sib_body) {
            (NodeBody::Data(cur), NodeBody::Data(sib)) => {
                // plain concatenation; leaves carry no separators
                if from_left {
                    cur.absorb_front(sib);
                } else {
                    cur.absorb_back(sib);
                }
            }
            (NodeBody::Index(cur), NodeBody::Index(sib)) => {
                if from_left {
                    cur.absorb_front(separator, sib);
                } else {
                    cur.absorb_back(separator, sib);
                }
            }
            _ => {
                return Err(StoreError::internal(
                    "siblings disagree on their node kind",
                ))
            }
        }
        Ok(())
    }
}
