//! In-memory node bodies and their block codecs.
//!
//! A stored block is `u8 kind | u16 n | payload`, zero-padded to the block
//! size. The kind byte duplicates the discriminator carried in the node's
//! UID; decoding validates the two against each other.

mod data_node;
mod index_node;

pub use data_node::DataNode;
pub use index_node::{ChildSlot, IndexNode};

use crate::{
    cache::uid::NodeKind,
    error::{ErrorKind, StoreError},
    io::{BlockReader, BlockWriter},
};

/// The cache-managed sum of the two node variants.
pub enum NodeBody {
    Data(DataNode),
    Index(IndexNode),
}

impl NodeBody {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeBody::Data(_) => NodeKind::Data,
            NodeBody::Index(_) => NodeKind::Index,
        }
    }

    pub fn key_count(&self) -> usize {
        match self {
            NodeBody::Data(node) => node.len(),
            NodeBody::Index(node) => node.pivot_count(),
        }
    }

    pub fn as_data(&self) -> Option<&DataNode> {
        match self {
            NodeBody::Data(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_data_mut(&mut self) -> Option<&mut DataNode> {
        match self {
            NodeBody::Data(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_index(&self) -> Option<&IndexNode> {
        match self {
            NodeBody::Index(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_index_mut(&mut self) -> Option<&mut IndexNode> {
        match self {
            NodeBody::Index(node) => Some(node),
            _ => None,
        }
    }

    /// Serialize into exactly one block.
    pub fn encode_block(&self, block_size: usize) -> Result<Vec<u8>, StoreError> {
        let mut w = BlockWriter::new();
        w.write(&self.kind().discriminant());
        match self {
            NodeBody::Data(node) => node.encode_into(&mut w),
            NodeBody::Index(node) => node.encode_into(&mut w),
        }
        w.to_padded_bytes(block_size)
    }

    /// Decode a block image. `expected` comes from the UID the block was
    /// fetched by.
    pub fn decode_block(bytes: &[u8], expected: NodeKind) -> Result<NodeBody, StoreError> {
        let mut r = BlockReader::new(bytes);
        let tag: u8 = r.read()?;
        let kind = NodeKind::from_discriminant(tag).ok_or_else(|| {
            StoreError::new(
                ErrorKind::Serialization,
                &format!("unknown node kind tag: {}", tag),
            )
        })?;
        if kind != expected {
            return Err(StoreError::new(
                ErrorKind::Serialization,
                &format!("block kind {:?} does not match uid kind {:?}", kind, expected),
            ));
        }

        match kind {
            NodeKind::Data => Ok(NodeBody::Data(DataNode::decode_from(&mut r)?)),
            NodeKind::Index => Ok(NodeBody::Index(IndexNode::decode_from(&mut r)?)),
        }
    }
}
