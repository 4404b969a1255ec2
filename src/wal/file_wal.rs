use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    mem,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use log::{debug, info};
use parking_lot::Mutex;

use crate::{
    error::{ErrorKind, StoreError},
    io::{read_into, BlockWriter},
    types::{Key, StoreResult, Value},
};

const WAL_BUFFER_SIZE: usize = 4096;
const FLUSH_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalOp {
    Insert,
    Remove,
}

impl WalOp {
    fn discriminant(self) -> u8 {
        match self {
            WalOp::Insert => 0,
            WalOp::Remove => 1,
        }
    }

    fn from_discriminant(value: u8) -> Option<WalOp> {
        match value {
            0 => Some(WalOp::Insert),
            1 => Some(WalOp::Remove),
            _ => None,
        }
    }
}

/// One logged mutation: `u8 op | key | value`, the value absent for
/// removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalRecord {
    pub op: WalOp,
    pub key: Key,
    pub value: Option<Value>,
}

impl WalRecord {
    pub fn insert(key: Key, value: Value) -> WalRecord {
        WalRecord {
            op: WalOp::Insert,
            key,
            value: Some(value),
        }
    }

    pub fn remove(key: Key) -> WalRecord {
        WalRecord {
            op: WalOp::Remove,
            key,
            value: None,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut w = BlockWriter::new();
        w.write(&self.op.discriminant());
        w.write(&self.key);
        if let Some(value) = self.value {
            w.write(&value);
        }
        w.to_bytes()
    }

    /// `None` on a clean end of log; a torn tail is also treated as the
    /// end (the record never fully made it to disk).
    fn decode_from(file: &mut File) -> Option<WalRecord> {
        let mut tag = [0u8; 1];
        if file.read_exact(&mut tag).is_err() {
            return None;
        }
        let op = WalOp::from_discriminant(tag[0])?;
        let key: Key = read_into(file).ok()?;
        let value = match op {
            WalOp::Insert => Some(read_into(file).ok()?),
            WalOp::Remove => None,
        };
        Some(WalRecord { op, key, value })
    }
}

struct WalShared {
    file: Mutex<File>,
    buffers: [Mutex<Vec<u8>>; 2],
    active: AtomicUsize,
    appended: AtomicU64,
    stop: AtomicBool,
}

impl WalShared {
    /// Swap the active buffer, then drain the retired one. The buffer lock
    /// is dropped before any I/O happens.
    fn flush_once(&self) -> StoreResult {
        let retired = self.active.load(Ordering::Acquire);
        self.active.store(1 - retired, Ordering::Release);

        let data = {
            let mut buf = self.buffers[retired].lock();
            if buf.is_empty() {
                return Ok(());
            }
            mem::replace(&mut *buf, Vec::with_capacity(WAL_BUFFER_SIZE))
        };

        let mut file = self.file.lock();
        file.write_all(&data)?;
        file.sync_data()?;
        debug!("wal flushed {} bytes", data.len());
        Ok(())
    }
}

/// Append-only log over one file with two alternating in-memory buffers
/// and a background fsync thread. Appends are synchronous from the tree's
/// view but only touch a buffer; the flusher swaps buffers and writes the
/// retired one out without holding any append-side lock during I/O.
pub struct FileWal {
    shared: Arc<WalShared>,
    path: PathBuf,
    flusher: Option<thread::JoinHandle<()>>,
}

impl FileWal {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<FileWal, StoreError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let len = file.seek(SeekFrom::End(0))?;

        let shared = Arc::new(WalShared {
            file: Mutex::new(file),
            buffers: [
                Mutex::new(Vec::with_capacity(WAL_BUFFER_SIZE)),
                Mutex::new(Vec::with_capacity(WAL_BUFFER_SIZE)),
            ],
            active: AtomicUsize::new(0),
            appended: AtomicU64::new(len),
            stop: AtomicBool::new(false),
        });

        let flush_shared = shared.clone();
        let flusher = thread::Builder::new()
            .name("wal-flush".to_string())
            .spawn(move || {
                info!("wal flusher started");
                loop {
                    thread::sleep(FLUSH_INTERVAL);
                    if let Err(e) = flush_shared.flush_once() {
                        log::error!("wal flush failed: {}", e);
                    }
                    if flush_shared.stop.load(Ordering::Acquire) {
                        // one final swap drains whatever the last appends left
                        let _ = flush_shared.flush_once();
                        break;
                    }
                }
                info!("wal flusher stopped");
            })
            .map_err(|e| {
                StoreError::new(
                    ErrorKind::Internal,
                    &format!("failed to spawn the wal flusher: {}", e),
                )
            })?;

        Ok(FileWal {
            shared,
            path: path.as_ref().to_path_buf(),
            flusher: Some(flusher),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes appended since the last truncation (including not-yet-synced
    /// buffer content).
    pub fn size(&self) -> u64 {
        self.shared.appended.load(Ordering::Relaxed)
    }

    /// Append one record. Spins under backpressure when both buffers are
    /// full; order among appenders is the order the buffer lock was won.
    pub fn append(&self, record: &WalRecord) -> StoreResult {
        let bytes = record.encode();
        loop {
            let active = self.shared.active.load(Ordering::Acquire);
            let mut buf = self.shared.buffers[active].lock();
            if active != self.shared.active.load(Ordering::Acquire) {
                // the flusher retired this buffer while we were waiting
                continue;
            }
            if buf.len() + bytes.len() > WAL_BUFFER_SIZE {
                drop(buf);
                thread::yield_now();
                continue;
            }
            buf.extend_from_slice(&bytes);
            self.shared
                .appended
                .fetch_add(bytes.len() as u64, Ordering::Relaxed);
            return Ok(());
        }
    }

    /// Read every record from the start of the log. Only sound before the
    /// tree starts appending (the open/recovery path).
    pub fn replay(&self) -> Result<Vec<WalRecord>, StoreError> {
        let mut file = self.shared.file.lock();
        file.seek(SeekFrom::Start(0))?;

        let mut records = Vec::new();
        let mut clean_end = 0u64;
        while let Some(record) = WalRecord::decode_from(&mut file) {
            records.push(record);
            clean_end = file.seek(SeekFrom::Current(0))?;
        }

        // chop a torn tail so later appends don't land behind garbage
        if file.metadata()?.len() > clean_end {
            file.set_len(clean_end)?;
            self.shared.appended.store(clean_end, Ordering::Relaxed);
        }
        file.seek(SeekFrom::Start(clean_end))?;
        Ok(records)
    }

    /// Throw away the log. The caller guarantees every logged op is
    /// durable in the tree's storage image (the full-flush hook).
    pub fn truncate(&self) -> StoreResult {
        // park both buffers so no appended record is lost
        self.shared.flush_once()?;
        self.shared.flush_once()?;

        let mut file = self.shared.file.lock();
        file.set_len(0)?;
        file.sync_all()?;
        file.seek(SeekFrom::Start(0))?;
        drop(file);
        self.shared.appended.store(0, Ordering::Relaxed);
        info!("wal truncated");
        Ok(())
    }
}

impl Drop for FileWal {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(flusher) = self.flusher.take() {
            let _ = flusher.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_append_flush_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        {
            let wal = FileWal::open(&path).unwrap();
            wal.append(&WalRecord::insert(1, 10)).unwrap();
            wal.append(&WalRecord::insert(2, 20)).unwrap();
            wal.append(&WalRecord::remove(1)).unwrap();
            // dropping joins the flusher, which drains the buffers
        }

        let wal = FileWal::open(&path).unwrap();
        let records = wal.replay().unwrap();
        assert_eq!(
            records,
            vec![
                WalRecord::insert(1, 10),
                WalRecord::insert(2, 20),
                WalRecord::remove(1),
            ]
        );
    }

    #[test]
    fn test_truncate_empties_the_log(){
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        let wal = FileWal::open(&path).unwrap();
        wal.append(&WalRecord::insert(7, 70)).unwrap();
        wal.truncate().unwrap();
        assert_eq!(wal.replay().unwrap(), vec![]);
        assert_eq!(wal.size(), 0);

        // still appendable after truncation
        wal.append(&WalRecord::insert(8, 80)).unwrap();
        wal.truncate().unwrap();
        assert_eq!(wal.replay().unwrap(), vec![]);
    }
}
