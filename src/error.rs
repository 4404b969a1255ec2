use std::{error::Error, fmt};

/// Flat error taxonomy. Every fallible operation in the crate reports one of
/// these kinds; callers discriminate on the kind, the details string is for
/// humans only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Insert collided on an equal key; the operation had no effect.
    KeyAlreadyExists,
    /// Search or remove target is absent.
    KeyDoesNotExist,
    /// Structural precondition of an insert was violated.
    InsertFailed,
    /// Structural precondition of a remove was violated.
    RemoveFailed,
    /// Backend read/write failed.
    StorageIo,
    /// The codec refused its input (node does not fit the block, bad block
    /// image, invalid configuration).
    Serialization,
    /// An internal invariant was violated.
    Internal,
}

#[derive(Debug)]
pub struct StoreError {
    kind: ErrorKind,
    details: String,
}

impl StoreError {
    pub fn new(kind: ErrorKind, msg: &str) -> StoreError {
        StoreError {
            kind,
            details: msg.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn internal(msg: &str) -> StoreError {
        StoreError::new(ErrorKind::Internal, msg)
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.details)
    }
}

impl Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> StoreError {
        StoreError::new(ErrorKind::StorageIo, &e.to_string())
    }
}
