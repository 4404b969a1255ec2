//! The B+ tree: node layout plus the descent, split and merge algorithms,
//! all running against the cache manager.

pub mod node;

mod delete;
mod insert;
mod tree;

pub use tree::{BPlusTree, TreeConfig};
