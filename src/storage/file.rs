use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

use bit_vec::BitVec;
use log::debug;
use parking_lot::Mutex;

use super::{check_uid_for, StorageBackend, StoreHeader, WriteHint};
use crate::{
    cache::uid::{Media, NodeKind, ObjectUid},
    error::{ErrorKind, StoreError},
    types::StoreResult,
};

pub(super) struct BlockFileInner {
    file: File,
    /// One bit per block; set means allocated. Block 0 (the header) is
    /// always set.
    alloc: BitVec,
    next_block: u64,
}

/// Fixed-size blocks in a flat file with a bump allocator and a free map.
/// Shared by the file and pmem backends, which differ only in media tag and
/// write-through behavior.
pub(super) struct BlockFile {
    media: Media,
    /// Sync every write (the pmem backend's write-through durability).
    durable: bool,
    block_size: usize,
    max_blocks: u64,
    inner: Mutex<BlockFileInner>,
}

impl BlockFile {
    pub(super) fn open<P: AsRef<Path>>(
        path: P,
        media: Media,
        durable: bool,
        block_size: u16,
        backing_bytes: u64,
    ) -> Result<BlockFile, StoreError> {
        let max_blocks = backing_bytes / block_size as u64;
        if max_blocks < 2 {
            return Err(StoreError::new(
                ErrorKind::Serialization,
                "backing_bytes must cover at least two blocks",
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let mut alloc = BitVec::from_elem(max_blocks as usize, false);
        alloc.set(0, true);

        let storage = BlockFile {
            media,
            durable,
            block_size: block_size as usize,
            max_blocks,
            inner: Mutex::new(BlockFileInner {
                file,
                alloc,
                next_block: 1,
            }),
        };

        // Everything the file already covers is treated as live: evictions
        // may have written blocks past the last recorded watermark, and a
        // reachable block must never be handed out again.
        if let Some(header) = storage.read_header()? {
            if header.block_size != block_size {
                return Err(StoreError::new(
                    ErrorKind::Serialization,
                    &format!(
                        "block size mismatch: store has {}, configured {}",
                        header.block_size, block_size
                    ),
                ));
            }
            let mut inner = storage.inner.lock();
            let covered = inner.file.metadata()?.len() / block_size as u64;
            inner.next_block = header.next_block.max(covered).max(1);
            let watermark = (inner.next_block as usize).min(max_blocks as usize);
            for block in 0..watermark {
                inner.alloc.set(block, true);
            }
        }

        Ok(storage)
    }

    fn read_block(&self, inner: &mut BlockFileInner, block: u64) -> Result<Vec<u8>, StoreError> {
        let mut buf = vec![0u8; self.block_size];
        inner
            .file
            .seek(SeekFrom::Start(block * self.block_size as u64))?;
        inner.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write_block(&self, inner: &mut BlockFileInner, block: u64, bytes: &[u8]) -> StoreResult {
        inner
            .file
            .seek(SeekFrom::Start(block * self.block_size as u64))?;
        inner.file.write_all(bytes)?;
        if self.durable {
            inner.file.sync_all()?;
        }
        Ok(())
    }

    fn allocate_block(&self, inner: &mut BlockFileInner) -> Result<u64, StoreError> {
        // reuse a freed block below the watermark before bumping it
        for block in 1..inner.next_block {
            if !inner.alloc.get(block as usize).unwrap_or(true) {
                inner.alloc.set(block as usize, true);
                return Ok(block);
            }
        }

        if inner.next_block >= self.max_blocks {
            return Err(StoreError::new(
                ErrorKind::StorageIo,
                "backing store is full",
            ));
        }
        let block = inner.next_block;
        inner.next_block += 1;
        inner.alloc.set(block as usize, true);
        Ok(block)
    }

    pub(super) fn media(&self) -> Media {
        self.media
    }

    pub(super) fn get(&self, uid: ObjectUid) -> Result<Vec<u8>, StoreError> {
        check_uid_for(self.media, uid)?;
        let mut inner = self.inner.lock();
        let block = uid.locator();
        if block >= inner.next_block || !inner.alloc.get(block as usize).unwrap_or(false) {
            return Err(StoreError::new(
                ErrorKind::StorageIo,
                &format!("block not found: {:?}", uid),
            ));
        }
        self.read_block(&mut inner, block)
    }

    pub(super) fn put(
        &self,
        kind: NodeKind,
        bytes: &[u8],
        hint: WriteHint,
    ) -> Result<ObjectUid, StoreError> {
        if bytes.len() != self.block_size {
            return Err(StoreError::new(
                ErrorKind::Serialization,
                "image does not match the block size",
            ));
        }

        let mut inner = self.inner.lock();
        let (block, uid) = match hint {
            WriteHint::Overwrite(old) => {
                check_uid_for(self.media, old)?;
                (old.locator(), old)
            }
            WriteHint::Fresh => {
                let block = self.allocate_block(&mut inner)?;
                (block, ObjectUid::new(self.media, kind, block))
            }
        };

        self.write_block(&mut inner, block, bytes)?;
        debug!("wrote block {} -> {:?}", block, uid);
        Ok(uid)
    }

    pub(super) fn remove(&self, uid: ObjectUid) -> StoreResult {
        check_uid_for(self.media, uid)?;
        let mut inner = self.inner.lock();
        let block = uid.locator() as usize;
        inner.alloc.set(block, false);
        Ok(())
    }

    pub(super) fn read_header(&self) -> Result<Option<StoreHeader>, StoreError> {
        let mut inner = self.inner.lock();
        if inner.file.metadata()?.len() < self.block_size as u64 {
            return Ok(None);
        }
        let bytes = self.read_block(&mut inner, 0)?;
        StoreHeader::decode_block(&bytes)
    }

    pub(super) fn write_header(&self, root_uid: ObjectUid) -> StoreResult {
        let mut inner = self.inner.lock();
        let header = StoreHeader {
            root_uid,
            block_size: self.block_size as u16,
            next_block: inner.next_block,
        };
        let bytes = header.encode_block(self.block_size)?;
        self.write_block(&mut inner, 0, &bytes)?;
        inner.file.sync_all()?;
        Ok(())
    }

    pub(super) fn next_block(&self) -> u64 {
        self.inner.lock().next_block
    }
}

/// File-backed store: bump-allocated fixed-size blocks with a free map.
pub struct FileStorage {
    blocks: BlockFile,
}

impl FileStorage {
    pub fn open<P: AsRef<Path>>(
        path: P,
        block_size: u16,
        backing_bytes: u64,
    ) -> Result<FileStorage, StoreError> {
        Ok(FileStorage {
            blocks: BlockFile::open(path, Media::File, false, block_size, backing_bytes)?,
        })
    }

    pub fn next_block(&self) -> u64 {
        self.blocks.next_block()
    }
}

impl StorageBackend for FileStorage {
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_blocks_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocks.db");

        let uid;
        {
            let storage = FileStorage::open(&path, 64, 64 * 64).unwrap();
            uid = storage
                .put(NodeKind::Data, &vec![9u8; 64], WriteHint::Fresh)
                .unwrap();
            storage.write_header(uid).unwrap();
        }

        let storage = FileStorage::open(&path, 64, 64 * 64).unwrap();
        let header = storage.read_header().unwrap().unwrap();
        assert_eq!(header.root_uid, uid);
        assert_eq!(storage.get(uid).unwrap(), vec![9u8; 64]);
    }

    #[test]
    fn test_freed_blocks_are_reused() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::open(dir.path().join("f.db"), 64, 64 * 8).unwrap();

        let a = storage
            .put(NodeKind::Data, &vec![1u8; 64], WriteHint::Fresh)
            .unwrap();
        storage.remove(a).unwrap();
        let b = storage
            .put(NodeKind::Index, &vec![2u8; 64], WriteHint::Fresh)
            .unwrap();
        assert_eq!(a.locator(), b.locator());
    }
}
