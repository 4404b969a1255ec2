use std::path::Path;

use super::{file::BlockFile, StorageBackend, StoreHeader, WriteHint};
use crate::{
    cache::uid::{Media, NodeKind, ObjectUid},
    error::StoreError,
    types::StoreResult,
};

/// Persistent-memory store. Shares the file backend's block layout; every
/// write is synced through so a completed `put` is durable on return.
pub struct PmemStorage {
    blocks: BlockFile,
}

impl PmemStorage {
    pub fn open<P: AsRef<Path>>(
        path: P,
        block_size: u16,
        backing_bytes: u64,
    ) -> Result<PmemStorage, StoreError> {
        Ok(PmemStorage {
            blocks: BlockFile::open(path, Media::Pmem, true, block_size, backing_bytes)?,
        })
    }

    pub fn next_block(&self) -> u64 {
        self.blocks.next_block()
    }
}

impl StorageBackend for PmemStorage {
    fn media(&self) -> Media {
        self.blocks.media()
    }

    fn get(&self, uid: ObjectUid) -> Result<Vec<u8>, StoreError> {
        self.blocks.get(uid)
    }

    fn put(&self, kind: NodeKind, bytes: &[u8], hint: WriteHint) -> Result<ObjectUid, StoreError> {
        self.blocks.put(kind, bytes, hint)
    }

    fn remove(&self, uid: ObjectUid) -> StoreResult {
        self.blocks.remove(uid)
    }

    fn read_header(&self) -> Result<Option<StoreHeader>, StoreError> {
        self.blocks.read_header()
    }

    fn write_header(&self, root_uid: ObjectUid) -> StoreResult {
        self.blocks.write_header(root_uid)
    }
}
