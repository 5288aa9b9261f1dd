//! Merkle-sum sparse Merkle tree (MS-SMT).
//!
//! An MS-SMT is an authenticated map from 256-bit keys to byte values, where
//! every branch additionally commits to the sum of the values below it. The
//! tree has a fixed depth of 256; unpopulated subtrees collapse to a
//! precomputed table of empty hashes, which keeps proofs and storage linear
//! in the number of populated leaves.
//!
//! Two tree flavors are provided: [`FullTree`] materializes every branch on
//! the path to a leaf, while [`CompactedTree`] stores lone leaves at their
//! highest empty ancestor and only expands them when a neighboring key is
//! inserted. Both produce identical roots and proofs for the same contents.

mod compact;
mod empty_tree;
mod node;
mod proof;
mod store;
mod tree;

pub use compact::CompactedTree;
pub use empty_tree::{empty_leaf_hash, empty_tree, empty_tree_root};
pub use node::{
    bit_index, Branch, CompactedLeaf, ComputedNode, Leaf, Node, NodeHash, MAX_TREE_LEVELS,
};
pub use proof::{CompressedProof, Proof};
pub use store::{MemoryStore, TreeStore};
pub use tree::{FullTree, Tree};

use thiserror::Error;

/// Errors returned by MS-SMT operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    /// A branch sum exceeded the maximum representable value.
    #[error("merkle sum overflows uint64")]
    IntegerOverflow,

    /// A proof did not contain exactly one sibling per tree level.
    #[error("proof has {0} nodes, expected {MAX_TREE_LEVELS}")]
    InvalidProofLength(usize),

    /// A subtree prefix was deeper than the tree itself.
    #[error("subtree prefix depth {0} exceeds tree depth {MAX_TREE_LEVELS}")]
    InvalidPrefixDepth(usize),

    /// A compressed proof failed structural validation.
    #[error("invalid compressed proof: {0}")]
    InvalidCompressedProof(String),

    /// A node referenced by the tree was not found in the store.
    #[error("node {0} not found in store")]
    NodeNotFound(String),

    /// The backing store failed.
    #[error("tree store: {0}")]
    Store(String),
}
