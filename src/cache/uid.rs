use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{
    error::{ErrorKind, StoreError},
    io::{Decodeable, Encodeable},
};

/// Where the object a UID names currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Media {
    /// The locator is a process-unique serial naming a resident wrapper.
    InCache,
    Volatile,
    File,
    Pmem,
}

impl Media {
    fn from_bits(bits: u64) -> Media {
        match bits {
            0 => Media::InCache,
            1 => Media::Volatile,
            2 => Media::File,
            _ => Media::Pmem,
        }
    }

    fn to_bits(self) -> u64 {
        match self {
            Media::InCache => 0,
            Media::Volatile => 1,
            Media::File => 2,
            Media::Pmem => 3,
        }
    }
}

/// Node kind discriminator, duplicated into the UID so a parent can tell
/// what a child is without loading its block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Data,
    Index,
}

impl NodeKind {
    pub fn discriminant(self) -> u8 {
        match self {
            NodeKind::Data => 1,
            NodeKind::Index => 2,
        }
    }

    pub fn from_discriminant(value: u8) -> Option<NodeKind> {
        match value {
            1 => Some(NodeKind::Data),
            2 => Some(NodeKind::Index),
            _ => None,
        }
    }
}

const MEDIA_SHIFT: u64 = 62;
const KIND_SHIFT: u64 = 56;
const KIND_MASK: u64 = 0x3f;
const LOCATOR_MASK: u64 = (1 << KIND_SHIFT) - 1;

// In-cache serials start at 1 so that a zero raw value never names a live
// wrapper.
static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// 64-bit tagged page identifier: media (2 bits) | kind (6 bits) |
/// locator (56 bits). For on-storage media the locator is the block number,
/// for `Media::InCache` it is a serial minted by [`ObjectUid::for_new`].
///
/// The all-ones value is reserved as the nil sentinel and never minted.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectUid(u64);

impl ObjectUid {
    pub const NIL: ObjectUid = ObjectUid(u64::MAX);

    pub fn new(media: Media, kind: NodeKind, locator: u64) -> ObjectUid {
        debug_assert!(locator <= LOCATOR_MASK);
        ObjectUid(
            (media.to_bits() << MEDIA_SHIFT)
                | ((kind.discriminant() as u64) << KIND_SHIFT)
                | (locator & LOCATOR_MASK),
        )
    }

    /// Mint an in-cache UID for a freshly allocated wrapper.
    pub fn for_new(kind: NodeKind) -> ObjectUid {
        let serial = NEXT_SERIAL.fetch_add(1, Ordering::Relaxed);
        ObjectUid::new(Media::InCache, kind, serial)
    }

    pub fn media(&self) -> Media {
        Media::from_bits(self.0 >> MEDIA_SHIFT)
    }

    pub fn kind(&self) -> Option<NodeKind> {
        NodeKind::from_discriminant(((self.0 >> KIND_SHIFT) & KIND_MASK) as u8)
    }

    pub fn locator(&self) -> u64 {
        self.0 & LOCATOR_MASK
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn from_raw(raw: u64) -> ObjectUid {
        ObjectUid(raw)
    }

    pub fn is_nil(&self) -> bool {
        *self == ObjectUid::NIL
    }

    pub fn in_cache(&self) -> bool {
        !self.is_nil() && self.media() == Media::InCache
    }

    /// A UID that may legally appear inside a stored block image.
    pub fn persisted(&self) -> bool {
        !self.is_nil() && self.media() != Media::InCache
    }

    pub fn check(&self) -> Result<(), StoreError> {
        if self.is_nil() || self.kind().is_none() {
            return Err(StoreError::new(
                ErrorKind::Serialization,
                &format!("malformed uid {:?}", self),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for ObjectUid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_nil() {
            return write!(f, "uid(nil)");
        }
        write!(
            f,
            "uid({:?}:{:?}:{:#x})",
            self.media(),
            self.kind(),
            self.locator()
        )
    }
}

impl Encodeable for ObjectUid {
    fn encode(&self) -> Vec<u8> {
        self.0.encode()
    }
}

impl Decodeable for ObjectUid {
    fn decode_from<R: std::io::Read>(reader: &mut R) -> Result<Self, StoreError> {
        Ok(ObjectUid(u64::decode_from(reader)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack() {
        let uid = ObjectUid::new(Media::File, NodeKind::Index, 0x0123_4567_89ab);
        assert_eq!(uid.media(), Media::File);
        assert_eq!(uid.kind(), Some(NodeKind::Index));
        assert_eq!(uid.locator(), 0x0123_4567_89ab);
        assert!(uid.persisted());
    }

    #[test]
    fn test_minted_serials_are_unique() {
        let a = ObjectUid::for_new(NodeKind::Data);
        let b = ObjectUid::for_new(NodeKind::Data);
        assert_ne!(a, b);
        assert!(a.in_cache());
        assert!(!a.persisted());
    }

    #[test]
    fn test_nil_is_recognizable() {
        assert!(ObjectUid::NIL.is_nil());
        assert!(ObjectUid::NIL.check().is_err());
        assert!(!ObjectUid::NIL.in_cache());
    }
}
