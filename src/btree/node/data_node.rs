use crate::{
    error::{ErrorKind, StoreError},
    io::{BlockReader, BlockWriter},
    types::{Key, StoreResult, Value},
};

/// Leaf node: entries kept sorted by key.
///
/// # Format
///
/// - 2 bytes: entry count
/// - n * 8 bytes: keys
/// - n * 8 bytes: values
pub struct DataNode {
    entries: Vec<(Key, Value)>,
}

impl DataNode {
    pub fn new() -> DataNode {
        DataNode {
            entries: Vec::new(),
        }
    }

    pub fn from_entries(entries: Vec<(Key, Value)>) -> DataNode {
        debug_assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
        DataNode { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn search(&self, key: Key) -> Option<Value> {
        match self.entries.binary_search_by_key(&key, |e| e.0) {
            Ok(pos) => Some(self.entries[pos].1),
            Err(_) => None,
        }
    }

    pub fn insert(&mut self, key: Key, value: Value) -> StoreResult {
        match self.entries.binary_search_by_key(&key, |e| e.0) {
            Ok(_) => Err(StoreError::new(
                ErrorKind::KeyAlreadyExists,
                &format!("key {} is already present", key),
            )),
            Err(pos) => {
                self.entries.insert(pos, (key, value));
                Ok(())
            }
        }
    }

    pub fn remove(&mut self, key: Key) -> Result<Value, StoreError> {
        match self.entries.binary_search_by_key(&key, |e| e.0) {
            Ok(pos) => Ok(self.entries.remove(pos).1),
            Err(_) => Err(StoreError::new(
                ErrorKind::KeyDoesNotExist,
                &format!("key {} is not present", key),
            )),
        }
    }

    /// Move entries `[at, ..)` into a new right sibling. Returns the pivot
    /// (the first key of the sibling; keys below the pivot stay left, keys
    /// at or above it go right) and the sibling.
    pub fn split_upper(&mut self, at: usize) -> (Key, DataNode) {
        let upper = self.entries.split_off(at);
        let pivot = upper[0].0;
        (pivot, DataNode { entries: upper })
    }

    pub fn first_key(&self) -> Option<Key> {
        self.entries.first().map(|e| e.0)
    }

    pub fn last_key(&self) -> Option<Key> {
        self.entries.last().map(|e| e.0)
    }

    pub fn pop_first(&mut self) -> Option<(Key, Value)> {
        if self.entries.is_empty() {
            return None;
        }
        Some(self.entries.remove(0))
    }

    pub fn pop_last(&mut self) -> Option<(Key, Value)> {
        self.entries.pop()
    }

    pub fn push_front(&mut self, entry: (Key, Value)) {
        debug_assert!(self.first_key().map_or(true, |k| entry.0 < k));
        self.entries.insert(0, entry);
    }

    pub fn push_back(&mut self, entry: (Key, Value)) {
        debug_assert!(self.last_key().map_or(true, |k| k < entry.0));
        self.entries.push(entry);
    }

    /// Merge a left sibling in: its entries all sort before ours.
    pub fn absorb_front(&mut self, mut left: DataNode) {
        left.entries.append(&mut self.entries);
        self.entries = left.entries;
    }

    /// Merge a right sibling in: its entries all sort after ours.
    pub fn absorb_back(&mut self, mut right: DataNode) {
        self.entries.append(&mut right.entries);
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Key, Value)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.entries.iter().map(|e| e.0)
    }

    pub fn encode_into(&self, w: &mut BlockWriter) {
        w.write(&(self.entries.len() as u16));
        for (key, _) in &self.entries {
            w.write(key);
        }
        for (_, value) in &self.entries {
            w.write(value);
        }
    }

    pub fn decode_from(r: &mut BlockReader) -> Result<DataNode, StoreError> {
        let n: u16 = r.read()?;
        let mut keys = Vec::with_capacity(n as usize);
        for _ in 0..n {
            keys.push(r.read::<Key>()?);
        }
        let mut entries = Vec::with_capacity(n as usize);
        for key in keys {
            entries.push((key, r.read::<Value>()?));
        }
        Ok(DataNode { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_sorted_insert_and_search() {
        let mut node = DataNode::new();
        for key in [5u64, 1, 9, 3].iter() {
            node.insert(*key, key * 10).unwrap();
        }
        assert_eq!(node.keys().collect::<Vec<_>>(), vec![1, 3, 5, 9]);
        assert_eq!(node.search(9), Some(90));
        assert_eq!(node.search(2), None);
    }

    #[test]
    fn test_duplicate_insert_is_rejected() {
        let mut node = DataNode::new();
        node.insert(1, 10).unwrap();
        let err = node.insert(1, 20).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KeyAlreadyExists);
        assert_eq!(node.search(1), Some(10));
    }

    #[test]
    fn test_split_upper() {
        let mut node = DataNode::from_entries((0..8).map(|k| (k, k)).collect());
        let (pivot, right) = node.split_upper(4);
        assert_eq!(pivot, 4);
        assert_eq!(node.keys().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(right.keys().collect::<Vec<_>>(), vec![4, 5, 6, 7]);
    }
}
