//! Backing stores. A backend hands out blocks addressed by opaque UIDs; the
//! cache manager is its only client.

use std::path::PathBuf;

use crate::{
    cache::uid::{Media, NodeKind, ObjectUid},
    error::{ErrorKind, StoreError},
    io::{BlockReader, BlockWriter},
    types::StoreResult,
};

mod file;
mod pmem;
mod volatile;

pub use file::FileStorage;
pub use pmem::PmemStorage;
pub use volatile::VolatileStorage;

/// Which backend a tree is built on.
#[derive(Debug, Clone)]
pub enum StorageKind {
    Volatile,
    File(PathBuf),
    Pmem(PathBuf),
}

/// Placement request for [`StorageBackend::put`].
#[derive(Debug, Clone, Copy)]
pub enum WriteHint {
    /// Allocate a fresh block.
    Fresh,
    /// Rewrite the named block in place; the returned UID equals the hint.
    Overwrite(ObjectUid),
}

/// Block 0 of a persistent backend. Lets a flushed tree be reopened from the
/// same file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreHeader {
    pub root_uid: ObjectUid,
    pub block_size: u16,
    /// Allocation watermark: blocks below this number may be live.
    pub next_block: u64,
}

const HEADER_MAGIC: u32 = 0x4250_5452;

impl StoreHeader {
    pub fn encode_block(&self, block_size: usize) -> Result<Vec<u8>, StoreError> {
        let mut w = BlockWriter::new();
        w.write(&HEADER_MAGIC);
        w.write(&self.block_size);
        w.write(&self.root_uid);
        w.write(&self.next_block);
        w.to_padded_bytes(block_size)
    }

    pub fn decode_block(bytes: &[u8]) -> Result<Option<StoreHeader>, StoreError> {
        let mut r = BlockReader::new(bytes);
        let magic: u32 = r.read()?;
        if magic != HEADER_MAGIC {
            // A fresh or foreign file; not an error.
            return Ok(None);
        }
        Ok(Some(StoreHeader {
            block_size: r.read()?,
            root_uid: r.read()?,
            next_block: r.read()?,
        }))
    }
}

/// The contract the cache manager programs against.
pub trait StorageBackend: Send + Sync {
    fn media(&self) -> Media;

    /// Read the block the UID names.
    fn get(&self, uid: ObjectUid) -> Result<Vec<u8>, StoreError>;

    /// Write one block and return its UID. `WriteHint::Overwrite` re-writes
    /// in place and returns the hinted UID unchanged.
    fn put(&self, kind: NodeKind, bytes: &[u8], hint: WriteHint) -> Result<ObjectUid, StoreError>;

    /// Free the block; at most once per UID.
    fn remove(&self, uid: ObjectUid) -> StoreResult;

    /// `None` when the store has never been flushed.
    fn read_header(&self) -> Result<Option<StoreHeader>, StoreError>;

    /// Persist the root UID (and the backend's own allocation watermark)
    /// into block 0.
    fn write_header(&self, root_uid: ObjectUid) -> StoreResult;
}

pub fn open_backend(
    kind: &StorageKind,
    block_size: u16,
    backing_bytes: u64,
) -> Result<Box<dyn StorageBackend>, StoreError> {
    match kind {
        StorageKind::Volatile => Ok(Box::new(VolatileStorage::new(block_size, backing_bytes))),
        StorageKind::File(path) => Ok(Box::new(FileStorage::open(
            path,
            block_size,
            backing_bytes,
        )?)),
        StorageKind::Pmem(path) => Ok(Box::new(PmemStorage::open(
            path,
            block_size,
            backing_bytes,
        )?)),
    }
}

pub(crate) fn check_uid_for(media: Media, uid: ObjectUid) -> Result<(), StoreError> {
    uid.check()?;
    if uid.media() != media {
        return Err(StoreError::new(
            ErrorKind::StorageIo,
            &format!("uid {:?} does not belong to a {:?} backend", uid, media),
        ));
    }
    Ok(())
}
