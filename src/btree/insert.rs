use log::debug;

use super::{
    node::{ChildSlot, NodeBody},
    tree::BPlusTree,
};
use crate::{
    cache::manager::{AccessSet, WriteLatch},
    types::{Key, StoreResult, Value},
};

/// insert-related methods
impl BPlusTree {
    /// The write descent. The latch chain holds the root slot plus every
    /// node between the deepest "unsafe" ancestor and the current node;
    /// whenever the current index node has room for one more pivot, no
    /// split can propagate past it and every ancestor latch is released.
    pub(crate) fn insert_unlogged(&self, key: Key, value: Value) -> StoreResult {
        let mut access = AccessSet::new(&self.cache);
        let (root_slot, root_latch) = self.latch_root_for_write(&mut access)?;
        let mut root_slot = Some(root_slot);
        let mut chain: Vec<WriteLatch> = vec![root_latch];

        // descend to the leaf
        loop {
            let tail_is_safe_index = match chain.last().expect("chain is never empty").body() {
                NodeBody::Index(node) => Some(node.pivot_count() < self.max_keys()),
                NodeBody::Data(_) => None,
            };
            let safe = match tail_is_safe_index {
                Some(safe) => safe,
                None => break,
            };

            if safe {
                // ancestors can no longer be touched by a split below here
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

        // the mutation itself; a duplicate key aborts with all state intact
        {
            let leaf = chain.last_mut().expect("chain is never empty");
            let node = leaf
                .guard
                .as_mut()
                .and_then(|body| body.as_data_mut())
                .expect("descent ends at a data node");
            node.insert(key, value)?;
            leaf.obj.set_dirty(true);
        }

        // resolve overflows bottom-up through the retained chain
        let mut level = chain.len() - 1;
        loop {
            if chain[level].body().key_count() <= self.max_keys() {
                break;
            }

            let (pivot, right_body) = self.split_node(&mut chain[level]);
            let (right_uid, right_obj) = self.cache.allocate(right_body);
            access.track(&right_obj);
            let right_slot = ChildSlot::new(right_uid, right_obj);
            debug!("split {:?}, pivot {}", chain[level].obj.uid(), pivot);

            if level == 0 {
                // the root itself split: grow a level
                let left_slot = ChildSlot::new(chain[0].obj.uid(), chain[0].obj.clone());
                let (new_root_uid, new_root_obj) = self.cache.allocate(NodeBody::Index(
                    super::node::IndexNode::new_root(pivot, left_slot, right_slot),
                ));
                access.track(&new_root_obj);

                let slot = root_slot
                    .as_mut()
                    .expect("root slot latch is retained while the root is unsafe");
                slot.uid = new_root_uid;
                slot.ptr = Some(new_root_obj);
                debug!("tree grew a level, new root {:?}", new_root_uid);
                break;
            }

            let parent = &mut chain[level - 1];
            let node = parent
                .guard
                .as_mut()
                .and_then(|body| body.as_index_mut())
                .expect("ancestors are index nodes");
            let idx = node.child_index(pivot);
            node.insert_split(idx, pivot, right_slot);
            parent.obj.set_dirty(true);
            level -= 1;
        }

        Ok(())
    }

    /// Split an overfull node in half per the pivot conventions: a data
    /// node keeps `[0, d)` and moves `[d, ..)` right (the pivot is the
    /// first moved key); an index node promotes pivot `d` and moves
    /// everything above it right.
    fn split_node(&self, latch: &mut WriteLatch) -> (Key, NodeBody) {
        let at = self.degree() as usize;
        match latch.body_mut() {
            NodeBody::Data(node) => {
                let (pivot, right) = node.split_upper(at);
                (pivot, NodeBody::Data(right))
            }
            NodeBody::Index(node) => {
                let (pivot, right) = node.split_upper(at);
                (pivot, NodeBody::Index(right))
            }
        }
    }
}
