use std::sync::{Arc, RwLock};

use crate::error::StoreError;

/// Fixed-size key and value types served by the tree. Both serialize to
/// exactly eight little-endian bytes.
pub type Key = u64;
pub type Value = u64;

// Type alias, not a new type, cannot define methods on it
pub type Pod<T> = Arc<RwLock<T>>;

pub type ResultPod<T> = Result<Pod<T>, StoreError>;
pub type StoreResult = Result<(), StoreError>;
