use std::sync::Arc;

use crate::{
    cache::{object::CacheObject, uid::ObjectUid},
    error::{ErrorKind, StoreError},
    io::{BlockReader, BlockWriter},
    types::Key,
};

/// One child reference inside an index node.
///
/// The UID is authoritative for identity; the pointer is a resident
/// shortcut that may be absent. A slot whose UID is still in-cache must
/// carry the pointer, since an in-cache locator cannot be resolved through
/// the backing store.
pub struct ChildSlot {
    pub uid: ObjectUid,
    pub ptr: Option<Arc<CacheObject>>,
}

impl ChildSlot {
    pub fn new(uid: ObjectUid, ptr: Arc<CacheObject>) -> ChildSlot {
        ChildSlot {
            uid,
            ptr: Some(ptr),
        }
    }

    pub fn unresolved(uid: ObjectUid) -> ChildSlot {
        ChildSlot { uid, ptr: None }
    }

    /// The UID to emit when the owning node serializes: a rename minted by
    /// the child's last flush wins over the stored one.
    pub fn emit_uid(&self) -> ObjectUid {
        match &self.ptr {
            Some(ptr) => ptr.uid_updated().unwrap_or(self.uid),
            None => self.uid,
        }
    }
}

impl Clone for ChildSlot {
    fn clone(&self) -> ChildSlot {
        ChildSlot {
            uid: self.uid,
            ptr: self.ptr.clone(),
        }
    }
}

/// Interior node: `n` sorted pivots and `n + 1` child slots. For pivot `i`,
/// keys below it live under child `i`, keys at or above it under child
/// `i + 1`.
///
/// # Format
///
/// - 2 bytes: pivot count
/// - n * 8 bytes: pivots
/// - (n + 1) * 8 bytes: child UIDs
pub struct IndexNode {
    pivots: Vec<Key>,
    children: Vec<ChildSlot>,
}

impl IndexNode {
    pub fn new_root(pivot: Key, left: ChildSlot, right: ChildSlot) -> IndexNode {
        IndexNode {
            pivots: vec![pivot],
            children: vec![left, right],
        }
    }

    pub fn pivot_count(&self) -> usize {
        self.pivots.len()
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// The slot a key descends into: the first pivot greater than the key
    /// bounds it.
    pub fn child_index(&self, key: Key) -> usize {
        self.pivots.partition_point(|p| *p <= key)
    }

    pub fn pivot(&self, idx: usize) -> Key {
        self.pivots[idx]
    }

    pub fn pivots(&self) -> &[Key] {
        &self.pivots
    }

    pub fn set_pivot(&mut self, idx: usize, key: Key) {
        self.pivots[idx] = key;
    }

    pub fn child(&self, idx: usize) -> &ChildSlot {
        &self.children[idx]
    }

    pub fn child_mut(&mut self, idx: usize) -> &mut ChildSlot {
        &mut self.children[idx]
    }

    pub fn children(&self) -> &[ChildSlot] {
        &self.children
    }

    /// Record a split of child `idx`: the new pivot and the new right
    /// sibling land immediately after it.
    pub fn insert_split(&mut self, idx: usize, pivot: Key, right: ChildSlot) {
        self.pivots.insert(idx, pivot);
        self.children.insert(idx + 1, right);
    }

    pub fn remove_pivot(&mut self, idx: usize) -> Key {
        self.pivots.remove(idx)
    }

    pub fn remove_child(&mut self, idx: usize) -> ChildSlot {
        self.children.remove(idx)
    }

    pub fn insert_pivot(&mut self, idx: usize, key: Key) {
        self.pivots.insert(idx, key);
    }

    pub fn insert_child(&mut self, idx: usize, slot: ChildSlot) {
        self.children.insert(idx, slot);
    }

    /// Split for an overfull node: pivots `[at + 1, ..)` and children
    /// `[at + 1, ..)` move to a new right sibling, pivot `at` is promoted.
    pub fn split_upper(&mut self, at: usize) -> (Key, IndexNode) {
        let upper_pivots = self.pivots.split_off(at + 1);
        let promoted = self.pivots.pop().expect("split point out of range");
        let upper_children = self.children.split_off(at + 1);
        (
            promoted,
            IndexNode {
                pivots: upper_pivots,
                children: upper_children,
            },
        )
    }

    /// Merge a left sibling in, absorbing the parent's separator pivot.
    pub fn absorb_front(&mut self, separator: Key, mut left: IndexNode) {
        left.pivots.push(separator);
        left.pivots.append(&mut self.pivots);
        self.pivots = left.pivots;
        left.children.append(&mut self.children);
        self.children = left.children;
    }

    /// Merge a right sibling in, absorbing the parent's separator pivot.
    pub fn absorb_back(&mut self, separator: Key, mut right: IndexNode) {
        self.pivots.push(separator);
        self.pivots.append(&mut right.pivots);
        self.children.append(&mut right.children);
    }

    /// Any resident child carrying a rename from its last flush? If so this
    /// node's stored block is stale even when its own contents are clean.
    pub fn has_renamed_children(&self) -> bool {
        self.children.iter().any(|slot| match &slot.ptr {
            Some(ptr) => ptr.uid_updated().is_some(),
            None => false,
        })
    }

    /// Any child whose serialized UID would still be an in-cache locator?
    /// Such a node must not be written out (the block would be
    /// unresolvable after a restart), so eviction skips it until the
    /// children have been persisted.
    pub fn has_unpersisted_children(&self) -> bool {
        self.children.iter().any(|slot| !slot.emit_uid().persisted())
    }

    pub fn encode_into(&self, w: &mut BlockWriter) {
        w.write(&(self.pivots.len() as u16));
        for pivot in &self.pivots {
            w.write(pivot);
        }
        for slot in &self.children {
            w.write(&slot.emit_uid());
        }
    }

    pub fn decode_from(r: &mut BlockReader) -> Result<IndexNode, StoreError> {
        let n: u16 = r.read()?;
        let mut pivots = Vec::with_capacity(n as usize);
        for _ in 0..n {
            pivots.push(r.read::<Key>()?);
        }
        let mut children = Vec::with_capacity(n as usize + 1);
        for _ in 0..n + 1 {
            let uid: ObjectUid = r.read()?;
            uid.check()?;
            if !uid.persisted() {
                return Err(StoreError::new(
                    ErrorKind::Serialization,
                    &format!("stored block carries an in-cache child uid: {:?}", uid),
                ));
            }
            children.push(ChildSlot::unresolved(uid));
        }
        Ok(IndexNode { pivots, children })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::uid::{Media, NodeKind};

    fn slot(block: u64) -> ChildSlot {
        ChildSlot::unresolved(ObjectUid::new(Media::Volatile, NodeKind::Data, block))
    }

    fn node(pivots: Vec<Key>) -> IndexNode {
        let children = (0..pivots.len() as u64 + 1).map(slot).collect();
        IndexNode { pivots, children }
    }

    #[test]
    fn test_child_index_is_upper_bound() {
        let n = node(vec![10, 20, 30]);
        assert_eq!(n.child_index(5), 0);
        assert_eq!(n.child_index(10), 1); // equal keys descend right
        assert_eq!(n.child_index(15), 1);
        assert_eq!(n.child_index(30), 3);
        assert_eq!(n.child_index(99), 3);
    }

    #[test]
    fn test_split_upper() {
        let mut n = node(vec![1, 2, 3, 4, 5, 6, 7, 8]);
        // degree 4: split an eight-pivot node at pivot index 4
        let (promoted, right) = n.split_upper(4);
        assert_eq!(promoted, 5);
        assert_eq!(n.pivots(), &[1, 2, 3, 4]);
        assert_eq!(n.child_count(), 5);
        assert_eq!(right.pivots(), &[6, 7, 8]);
        assert_eq!(right.child_count(), 4);
    }

    #[test]
    fn test_insert_split_keeps_shape() {
        let mut n = node(vec![10, 30]);
        n.insert_split(1, 20, slot(99));
        assert_eq!(n.pivots(), &[10, 20, 30]);
        assert_eq!(n.child_count(), 4);
        assert_eq!(n.child(2).uid.locator(), 99);
    }

    #[test]
    fn test_absorb_front_and_back() {
        let mut cur = node(vec![50, 60]);
        let left = node(vec![10, 20]);
        cur.absorb_front(30, left);
        assert_eq!(cur.pivots(), &[10, 20, 30, 50, 60]);
        assert_eq!(cur.child_count(), 6);

        let right = node(vec![90]);
        cur.absorb_back(80, right);
        assert_eq!(cur.pivots(), &[10, 20, 30, 50, 60, 80, 90]);
        assert_eq!(cur.child_count(), 8);
    }
}
