//! Write-ahead log. Every mutation appends a record before the tree is
//! touched; replay re-applies the records after a restart. The log is
//! truncated on a full flush, when every logged op is durable in the
//! tree's storage image.

mod file_wal;

pub use file_wal::{FileWal, WalOp, WalRecord};
