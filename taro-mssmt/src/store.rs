use std::collections::HashMap;

use crate::node::{Branch, CompactedLeaf, ComputedNode, Leaf, Node, NodeHash};
use crate::TreeError;

/// Storage backend for MS-SMT nodes. The tree algorithms are store-agnostic:
/// they only ever address nodes by hash and replace the root wholesale, so a
/// database-backed implementation can map each method onto a single keyed
/// read or write inside one transaction.
pub trait TreeStore {
    /// Returns the current root branch, or `None` for an empty tree.
    fn root_node(&self) -> Result<Option<Branch>, TreeError>;

    /// Replaces the current root branch. `None` resets the tree to empty.
    fn update_root(&mut self, root: Option<Branch>) -> Result<(), TreeError>;

    /// Fetches a branch by hash.
    fn get_branch(&self, hash: &NodeHash) -> Result<Option<Branch>, TreeError>;

    /// Fetches a leaf by hash.
    fn get_leaf(&self, hash: &NodeHash) -> Result<Option<Leaf>, TreeError>;

    /// Fetches a compacted leaf by hash.
    fn get_compacted_leaf(&self, hash: &NodeHash) -> Result<Option<CompactedLeaf>, TreeError>;

    /// Inserts a branch keyed by its hash.
    fn insert_branch(&mut self, branch: &Branch) -> Result<(), TreeError>;

    /// Inserts a leaf keyed by its hash.
    fn insert_leaf(&mut self, leaf: &Leaf) -> Result<(), TreeError>;

    /// Inserts a compacted leaf keyed by its hash.
    fn insert_compacted_leaf(&mut self, leaf: &CompactedLeaf) -> Result<(), TreeError>;

    /// Deletes the branch with the given hash, if present.
    fn delete_branch(&mut self, hash: &NodeHash) -> Result<(), TreeError>;

    /// Deletes the leaf with the given hash, if present.
    fn delete_leaf(&mut self, hash: &NodeHash) -> Result<(), TreeError>;

    /// Deletes the compacted leaf with the given hash, if present.
    fn delete_compacted_leaf(&mut self, hash: &NodeHash) -> Result<(), TreeError>;
}

/// Record of a branch as persisted: the children are reduced to their hash
/// and sum, and re-resolved on read.
#[derive(Debug, Clone)]
struct StoredBranch {
    left: ComputedNode,
    right: ComputedNode,
}

/// An in-memory [`TreeStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    root: Option<StoredBranch>,
    branches: HashMap<NodeHash, StoredBranch>,
    leaves: HashMap<NodeHash, Leaf>,
    compacted: HashMap<NodeHash, CompactedLeaf>,
}

impl MemoryStore {
    /// Creates an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    fn rebuild(&self, stored: &StoredBranch) -> Result<Branch, TreeError> {
        Branch::new(
            Node::Computed(stored.left),
            Node::Computed(stored.right),
        )
    }
}

impl TreeStore for MemoryStore {
    fn root_node(&self) -> Result<Option<Branch>, TreeError> {
        self.root.as_ref().map(|r| self.rebuild(r)).transpose()
    }

    fn update_root(&mut self, root: Option<Branch>) -> Result<(), TreeError> {
        self.root = root.map(|b| StoredBranch {
            left: b.left.to_computed(),
            right: b.right.to_computed(),
        });
        Ok(())
    }

    fn get_branch(&self, hash: &NodeHash) -> Result<Option<Branch>, TreeError> {
        self.branches
            .get(hash)
            .map(|b| self.rebuild(b))
            .transpose()
    }

    fn get_leaf(&self, hash: &NodeHash) -> Result<Option<Leaf>, TreeError> {
        Ok(self.leaves.get(hash).cloned())
    }

    fn get_compacted_leaf(&self, hash: &NodeHash) -> Result<Option<CompactedLeaf>, TreeError> {
        Ok(self.compacted.get(hash).cloned())
    }

    fn insert_branch(&mut self, branch: &Branch) -> Result<(), TreeError> {
        self.branches.insert(
            branch.hash(),
            StoredBranch {
                left: branch.left.to_computed(),
                right: branch.right.to_computed(),
            },
        );
        Ok(())
    }

    fn insert_leaf(&mut self, leaf: &Leaf) -> Result<(), TreeError> {
        self.leaves.insert(leaf.hash(), leaf.clone());
        Ok(())
    }

    fn insert_compacted_leaf(&mut self, leaf: &CompactedLeaf) -> Result<(), TreeError> {
        self.compacted.insert(leaf.hash(), leaf.clone());
        Ok(())
    }

    fn delete_branch(&mut self, hash: &NodeHash) -> Result<(), TreeError> {
        self.branches.remove(hash);
        Ok(())
    }

    fn delete_leaf(&mut self, hash: &NodeHash) -> Result<(), TreeError> {
        self.leaves.remove(hash);
        Ok(())
    }

    fn delete_compacted_leaf(&mut self, hash: &NodeHash) -> Result<(), TreeError> {
        self.compacted.remove(hash);
        Ok(())
    }
}
