use std::collections::HashMap;

use parking_lot::Mutex;

use super::{check_uid_for, StorageBackend, StoreHeader, WriteHint};
use crate::{
    cache::uid::{Media, NodeKind, ObjectUid},
    error::{ErrorKind, StoreError},
    types::StoreResult,
};

struct VolatileInner {
    blocks: HashMap<u64, Vec<u8>>,
    free: Vec<u64>,
    next_block: u64,
    header: Option<StoreHeader>,
}

/// Heap-backed store: an in-memory block map with O(1) admission. Vanishes
/// with the process; the header is kept in memory for symmetry with the
/// persistent backends.
pub struct VolatileStorage {
    block_size: usize,
    max_blocks: u64,
    inner: Mutex<VolatileInner>,
}

impl VolatileStorage {
    pub fn new(block_size: u16, backing_bytes: u64) -> VolatileStorage {
        VolatileStorage {
            block_size: block_size as usize,
            max_blocks: backing_bytes / block_size as u64,
            inner: Mutex::new(VolatileInner {
                blocks: HashMap::new(),
                free: Vec::new(),
                // block 0 is reserved for the header on every backend
                next_block: 1,
                header: None,
            }),
        }
    }
}

impl StorageBackend for VolatileStorage {
    fn media(&self) -> Media {
        Media::Volatile
    }

    fn get(&self, uid: ObjectUid) -> Result<Vec<u8>, StoreError> {
        check_uid_for(self.media(), uid)?;
        let inner = self.inner.lock();
        match inner.blocks.get(&uid.locator()) {
            Some(bytes) => Ok(bytes.clone()),
            None => Err(StoreError::new(
                ErrorKind::StorageIo,
                &format!("block not found: {:?}", uid),
            )),
        }
    }

    fn put(&self, kind: NodeKind, bytes: &[u8], hint: WriteHint) -> Result<ObjectUid, StoreError> {
        if bytes.len() != self.block_size {
            return Err(StoreError::new(
                ErrorKind::Serialization,
                "image does not match the block size",
            ));
        }

        let mut inner = self.inner.lock();
        let (block, uid) = match hint {
            WriteHint::Overwrite(old) => {
                check_uid_for(self.media(), old)?;
                (old.locator(), old)
            }
            WriteHint::Fresh => {
                let block = match inner.free.pop() {
                    Some(block) => block,
                    None => {
                        if inner.next_block >= self.max_blocks {
                            return Err(StoreError::new(
                                ErrorKind::StorageIo,
                                "backing store is full",
                            ));
                        }
                        let block = inner.next_block;
                        inner.next_block += 1;
                        block
                    }
                };
                (block, ObjectUid::new(self.media(), kind, block))
            }
        };

        inner.blocks.insert(block, bytes.to_vec());
        Ok(uid)
    }

    fn remove(&self, uid: ObjectUid) -> StoreResult {
        check_uid_for(self.media(), uid)?;
        let mut inner = self.inner.lock();
        if inner.blocks.remove(&uid.locator()).is_some() {
            inner.free.push(uid.locator());
        }
        Ok(())
    }

    fn read_header(&self) -> Result<Option<StoreHeader>, StoreError> {
        Ok(self.inner.lock().header)
    }

    fn write_header(&self, root_uid: ObjectUid) -> StoreResult {
        let mut inner = self.inner.lock();
        let next_block = inner.next_block;
        inner.header = Some(StoreHeader {
            root_uid,
            block_size: self.block_size as u16,
            next_block,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_remove() {
        let storage = VolatileStorage::new(64, 64 * 16);
        let image = vec![7u8; 64];

        let uid = storage
            .put(NodeKind::Data, &image, WriteHint::Fresh)
            .unwrap();
        assert_eq!(uid.media(), Media::Volatile);
        assert_eq!(storage.get(uid).unwrap(), image);

        storage.remove(uid).unwrap();
        assert!(storage.get(uid).is_err());
    }

    #[test]
    fn test_overwrite_keeps_the_uid() {
        let storage = VolatileStorage::new(64, 64 * 16);
        let uid = storage
            .put(NodeKind::Data, &vec![1u8; 64], WriteHint::Fresh)
            .unwrap();
        let uid2 = storage
            .put(NodeKind::Data, &vec![2u8; 64], WriteHint::Overwrite(uid))
            .unwrap();
        assert_eq!(uid, uid2);
        assert_eq!(storage.get(uid).unwrap(), vec![2u8; 64]);
    }

    #[test]
    fn test_budget_is_enforced() {
        let storage = VolatileStorage::new(64, 64 * 2);
        // block 0 is the header, so a two-block budget leaves one data block
        storage
            .put(NodeKind::Data, &vec![0u8; 64], WriteHint::Fresh)
            .unwrap();
        assert!(storage
            .put(NodeKind::Data, &vec![0u8; 64], WriteHint::Fresh)
            .is_err());
    }
}
