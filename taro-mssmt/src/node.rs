use bitcoin::hashes::{sha256, Hash, HashEngine};
use serde::{Deserialize, Serialize};

use crate::empty_tree::empty_tree;
use crate::TreeError;

/// The depth of an MS-SMT: one level per key bit.
pub const MAX_TREE_LEVELS: usize = 256;

/// The hash of an MS-SMT node.
pub type NodeHash = [u8; 32];

/// Returns the bit of `key` consumed at tree level `idx`, most significant
/// bit first. Level 0 is the root.
#[inline]
pub fn bit_index(idx: usize, key: &[u8; 32]) -> u8 {
    (key[idx / 8] >> (7 - idx % 8)) & 1
}

/// Hashes a left/right child pair into the parent digest:
/// `SHA256(l_hash || l_sum_be64 || r_hash || r_sum_be64)`.
pub(crate) fn branch_hash(l_hash: &NodeHash, l_sum: u64, r_hash: &NodeHash, r_sum: u64) -> NodeHash {
    let mut engine = sha256::Hash::engine();
    engine.input(l_hash);
    engine.input(&l_sum.to_be_bytes());
    engine.input(r_hash);
    engine.input(&r_sum.to_be_bytes());
    sha256::Hash::from_engine(engine).to_byte_array()
}

/// A leaf node committing to an opaque value and a sum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leaf {
    /// The value stored in the leaf.
    pub value: Vec<u8>,
    /// The sum the leaf contributes to its ancestors.
    pub sum: u64,
}

impl Leaf {
    /// Creates a new leaf node.
    pub fn new(value: Vec<u8>, sum: u64) -> Self {
        Leaf { value, sum }
    }

    /// The canonical empty leaf: no value, zero sum.
    pub fn empty() -> Self {
        Leaf {
            value: Vec::new(),
            sum: 0,
        }
    }

    /// Returns true if this is the empty leaf.
    pub fn is_empty(&self) -> bool {
        self.value.is_empty() && self.sum == 0
    }

    /// The node hash of the leaf: `SHA256(value || sum_be64)`.
    pub fn hash(&self) -> NodeHash {
        let mut engine = sha256::Hash::engine();
        engine.input(&self.value);
        engine.input(&self.sum.to_be_bytes());
        sha256::Hash::from_engine(engine).to_byte_array()
    }
}

/// An internal branch committing to two children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    /// Left child.
    pub left: Box<Node>,
    /// Right child.
    pub right: Box<Node>,
    hash: NodeHash,
    sum: u64,
}

impl Branch {
    /// Creates a branch over the given children, failing if their sums
    /// overflow a u64.
    pub fn new(left: Node, right: Node) -> Result<Self, TreeError> {
        let sum = left
            .sum()
            .checked_add(right.sum())
            .ok_or(TreeError::IntegerOverflow)?;
        let hash = branch_hash(&left.hash(), left.sum(), &right.hash(), right.sum());
        Ok(Branch {
            left: Box::new(left),
            right: Box::new(right),
            hash,
            sum,
        })
    }

    /// The node hash of the branch.
    pub fn hash(&self) -> NodeHash {
        self.hash
    }

    /// The merkle sum of the branch.
    pub fn sum(&self) -> u64 {
        self.sum
    }

    /// Reduces the branch to its hash and sum.
    pub fn to_computed(&self) -> ComputedNode {
        ComputedNode {
            hash: self.hash,
            sum: self.sum,
        }
    }
}

/// A leaf stored at the root of an otherwise-empty subtree. Compacted trees
/// use this to avoid materializing up to 256 branches per key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactedLeaf {
    leaf: Leaf,
    key: [u8; 32],
    height: usize,
    hash: NodeHash,
}

impl CompactedLeaf {
    /// Creates a compacted leaf standing in for `key`'s subtree rooted at
    /// `height`. The node hash is the leaf hashed up through empty siblings
    /// from the bottom of the tree to `height`.
    pub fn new(height: usize, key: [u8; 32], leaf: Leaf) -> Self {
        let mut hash = leaf.hash();
        let sum = leaf.sum;
        for level in (height..MAX_TREE_LEVELS).rev() {
            let empty = empty_tree()[level + 1];
            hash = if bit_index(level, &key) == 0 {
                branch_hash(&hash, sum, &empty.hash, empty.sum)
            } else {
                branch_hash(&empty.hash, empty.sum, &hash, sum)
            };
        }

        CompactedLeaf {
            leaf,
            key,
            height,
            hash,
        }
    }

    /// The key the stored leaf belongs to.
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// The height the compacted leaf is stored at.
    pub fn height(&self) -> usize {
        self.height
    }

    /// The stored leaf.
    pub fn leaf(&self) -> &Leaf {
        &self.leaf
    }

    /// Consumes the compacted leaf, returning the stored leaf.
    pub fn into_leaf(self) -> Leaf {
        self.leaf
    }

    /// The node hash at the compacted leaf's height.
    pub fn hash(&self) -> NodeHash {
        self.hash
    }

    /// The merkle sum, equal to the stored leaf's sum.
    pub fn sum(&self) -> u64 {
        self.leaf.sum
    }
}

/// A node known only by its digest and sum, used for parsed proofs and for
/// the precomputed empty-subtree table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputedNode {
    /// The node hash.
    pub hash: NodeHash,
    /// The merkle sum.
    pub sum: u64,
}

/// Any MS-SMT node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// An internal branch.
    Branch(Branch),
    /// A stored leaf at the bottom of the tree.
    Leaf(Leaf),
    /// A leaf compacted into a higher level.
    Compacted(CompactedLeaf),
    /// A node known only by hash and sum.
    Computed(ComputedNode),
}

impl Node {
    /// The node hash.
    pub fn hash(&self) -> NodeHash {
        match self {
            Node::Branch(b) => b.hash(),
            Node::Leaf(l) => l.hash(),
            Node::Compacted(c) => c.hash(),
            Node::Computed(c) => c.hash,
        }
    }

    /// The merkle sum.
    pub fn sum(&self) -> u64 {
        match self {
            Node::Branch(b) => b.sum(),
            Node::Leaf(l) => l.sum,
            Node::Compacted(c) => c.sum(),
            Node::Computed(c) => c.sum,
        }
    }

    /// Reduces the node to its hash and sum.
    pub fn to_computed(&self) -> ComputedNode {
        ComputedNode {
            hash: self.hash(),
            sum: self.sum(),
        }
    }

    /// Returns true if the node equals the empty subtree at `height`.
    pub fn is_empty_at(&self, height: usize) -> bool {
        self.hash() == empty_tree()[height].hash
    }
}

impl From<ComputedNode> for Node {
    fn from(node: ComputedNode) -> Self {
        Node::Computed(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_hash_commits_to_sums() {
        let left = Leaf::new(vec![1], 10);
        let right = Leaf::new(vec![2], 20);
        let branch = Branch::new(Node::Leaf(left.clone()), Node::Leaf(right.clone())).unwrap();
        assert_eq!(branch.sum(), 30);

        let other = Branch::new(Node::Leaf(Leaf::new(vec![1], 11)), Node::Leaf(right)).unwrap();
        assert_ne!(branch.hash(), other.hash());
    }

    #[test]
    fn branch_sum_overflow() {
        let left = Leaf::new(vec![1], u64::MAX);
        let right = Leaf::new(vec![2], 1);
        let err = Branch::new(Node::Leaf(left), Node::Leaf(right)).unwrap_err();
        assert_eq!(err, TreeError::IntegerOverflow);
    }

    #[test]
    fn bit_index_is_msb_first() {
        let mut key = [0u8; 32];
        key[0] = 0b1000_0000;
        assert_eq!(bit_index(0, &key), 1);
        assert_eq!(bit_index(1, &key), 0);

        key[0] = 0b0000_0001;
        assert_eq!(bit_index(7, &key), 1);
    }

    #[test]
    fn compacted_leaf_matches_manual_path() {
        let key = [0xffu8; 32];
        let leaf = Leaf::new(vec![42], 7);

        // Hash the leaf up by hand through two levels of empty siblings.
        let e = empty_tree();
        let mut hash = leaf.hash();
        hash = branch_hash(&e[256].hash, 0, &hash, leaf.sum);
        hash = branch_hash(&e[255].hash, 0, &hash, leaf.sum);

        let compacted = CompactedLeaf::new(254, key, leaf);
        assert_eq!(compacted.hash(), hash);
    }
}
