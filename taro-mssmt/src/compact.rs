use crate::empty_tree::{empty_tree, empty_tree_root};
use crate::node::{bit_index, Branch, CompactedLeaf, ComputedNode, Leaf, Node, MAX_TREE_LEVELS};
use crate::proof::Proof;
use crate::store::TreeStore;
use crate::tree::Tree;
use crate::TreeError;

/// An MS-SMT that compacts subtrees containing a single leaf: the leaf is
/// stored at its highest empty-above ancestor and only expanded when a
/// neighboring key arrives. Roots and proofs are identical to the ones a
/// [`crate::FullTree`] produces for the same contents.
#[derive(Debug, Clone, Default)]
pub struct CompactedTree<S: TreeStore> {
    store: S,
}

impl<S: TreeStore> CompactedTree<S> {
    /// Creates a compacted tree over the given store.
    pub fn new(store: S) -> Self {
        CompactedTree { store }
    }

    fn root_branch(&self) -> Result<Branch, TreeError> {
        match self.store.root_node()? {
            Some(branch) => Ok(branch),
            // The empty root: two empty subtrees at height 1.
            None => Branch::new(
                Node::Computed(empty_tree()[1]),
                Node::Computed(empty_tree()[1]),
            ),
        }
    }

    /// Resolves a computed child at `height` against the store. Compacted
    /// leaves are looked up before branches since both live above the
    /// bottom level.
    fn resolve(&self, node: Node, height: usize) -> Result<Node, TreeError> {
        let computed = match node {
            Node::Computed(c) => c,
            other => return Ok(other),
        };

        if computed.hash == empty_tree()[height].hash {
            return Ok(Node::Computed(computed));
        }
        if let Some(leaf) = self.store.get_compacted_leaf(&computed.hash)? {
            return Ok(Node::Compacted(leaf));
        }
        if let Some(branch) = self.store.get_branch(&computed.hash)? {
            return Ok(Node::Branch(branch));
        }

        Err(TreeError::NodeNotFound(hex::encode(computed.hash)))
    }

    /// Moves a compacted leaf to a new (higher) height.
    fn lift(&mut self, leaf: CompactedLeaf, height: usize) -> Result<CompactedLeaf, TreeError> {
        self.store.delete_compacted_leaf(&leaf.hash())?;
        let key = *leaf.key();
        let lifted = CompactedLeaf::new(height, key, leaf.into_leaf());
        self.store.insert_compacted_leaf(&lifted)?;
        Ok(lifted)
    }

    /// Splits two diverging keys below `height` into a pair of compacted
    /// leaves under a chain of single-child branches.
    fn merge(
        &mut self,
        key: &[u8; 32],
        leaf: &Leaf,
        old: &CompactedLeaf,
        height: usize,
    ) -> Result<Node, TreeError> {
        let mut divergence = height;
        while bit_index(divergence, key) == bit_index(divergence, old.key()) {
            divergence += 1;
        }

        let new_leaf = CompactedLeaf::new(divergence + 1, *key, leaf.clone());
        let old_leaf = CompactedLeaf::new(divergence + 1, *old.key(), old.leaf().clone());
        self.store.insert_compacted_leaf(&new_leaf)?;
        self.store.insert_compacted_leaf(&old_leaf)?;

        let branch = if bit_index(divergence, key) == 0 {
            Branch::new(Node::Compacted(new_leaf), Node::Compacted(old_leaf))?
        } else {
            Branch::new(Node::Compacted(old_leaf), Node::Compacted(new_leaf))?
        };
        self.store.insert_branch(&branch)?;

        // Wrap the divergence branch in empty-sibling branches back up to
        // the height the compacted leaf previously occupied.
        let mut current = Node::Branch(branch);
        for level in (height..divergence).rev() {
            let empty = Node::Computed(empty_tree()[level + 1]);
            let parent = if bit_index(level, key) == 0 {
                Branch::new(current, empty)?
            } else {
                Branch::new(empty, current)?
            };
            self.store.insert_branch(&parent)?;
            current = Node::Branch(parent);
        }

        Ok(current)
    }

    /// Inserts `leaf` into the subtree rooted at `node` (height `height`).
    fn insert_at(
        &mut self,
        key: &[u8; 32],
        leaf: &Leaf,
        height: usize,
        node: Node,
    ) -> Result<Node, TreeError> {
        match node {
            Node::Computed(c) => {
                // Only empty subtrees survive resolution as computed nodes.
                if leaf.is_empty() {
                    return Ok(Node::Computed(c));
                }
                let compacted = CompactedLeaf::new(height, *key, leaf.clone());
                self.store.insert_compacted_leaf(&compacted)?;
                Ok(Node::Compacted(compacted))
            }
            Node::Compacted(existing) => {
                if existing.key() == key {
                    self.store.delete_compacted_leaf(&existing.hash())?;
                    if leaf.is_empty() {
                        return Ok(Node::Computed(empty_tree()[height]));
                    }
                    let replacement = CompactedLeaf::new(height, *key, leaf.clone());
                    self.store.insert_compacted_leaf(&replacement)?;
                    Ok(Node::Compacted(replacement))
                } else if leaf.is_empty() {
                    // Deleting a key that was never inserted.
                    Ok(Node::Compacted(existing))
                } else {
                    self.store.delete_compacted_leaf(&existing.hash())?;
                    self.merge(key, leaf, &existing, height)
                }
            }
            Node::Branch(branch) => self.insert_below(key, leaf, height, branch),
            Node::Leaf(_) => Err(TreeError::Store(
                "uncompacted leaf in compacted tree".into(),
            )),
        }
    }

    /// Recurses into the child of `branch` on `key`'s path and rebuilds (or
    /// collapses) the branch afterwards.
    fn insert_below(
        &mut self,
        key: &[u8; 32],
        leaf: &Leaf,
        height: usize,
        branch: Branch,
    ) -> Result<Node, TreeError> {
        let bit = bit_index(height, key);
        let (child, sibling) = if bit == 0 {
            (*branch.left.clone(), *branch.right.clone())
        } else {
            (*branch.right.clone(), *branch.left.clone())
        };

        let resolved = self.resolve(child, height + 1)?;
        let new_child = self.insert_at(key, leaf, height + 1, resolved)?;
        self.store.delete_branch(&branch.hash())?;

        let sibling = self.resolve(sibling, height + 1)?;
        let child_empty = new_child.is_empty_at(height + 1);
        let sibling_empty = sibling.is_empty_at(height + 1);

        // A branch must always cover at least two keys; collapse otherwise.
        if child_empty && sibling_empty {
            return Ok(Node::Computed(empty_tree()[height]));
        }
        if child_empty {
            if let Node::Compacted(lone) = sibling {
                return Ok(Node::Compacted(self.lift(lone, height)?));
            }
        }
        if sibling_empty {
            if let Node::Compacted(lone) = new_child {
                return Ok(Node::Compacted(self.lift(lone, height)?));
            }
        }

        let rebuilt = if bit == 0 {
            Branch::new(new_child, sibling)?
        } else {
            Branch::new(sibling, new_child)?
        };
        self.store.insert_branch(&rebuilt)?;
        Ok(Node::Branch(rebuilt))
    }

    fn apply(&mut self, key: &[u8; 32], leaf: Leaf) -> Result<ComputedNode, TreeError> {
        // Pre-check the new root sum so an overflow cannot leave the store
        // partially rewritten: every branch sum is bounded by the root sum.
        let existing = self.get(key)?;
        let root_sum = self.root()?.sum - existing.sum;
        root_sum
            .checked_add(leaf.sum)
            .ok_or(TreeError::IntegerOverflow)?;

        let root = self.root_branch()?;
        let new_root = self.insert_below(key, &leaf, 0, root)?;
        match new_root {
            Node::Branch(branch) => {
                let computed = branch.to_computed();
                self.store.update_root(Some(branch))?;
                Ok(computed)
            }
            node if node.is_empty_at(0) => {
                self.store.update_root(None)?;
                Ok(empty_tree()[0])
            }
            // A lone compacted leaf at height 0 still hangs below the root
            // branch pair, so this cannot be reached.
            _ => Err(TreeError::Store("unexpected compacted root".into())),
        }
    }
}

impl<S: TreeStore> Tree for CompactedTree<S> {
    fn root(&self) -> Result<ComputedNode, TreeError> {
        Ok(match self.store.root_node()? {
            Some(branch) => branch.to_computed(),
            None => empty_tree()[0],
        })
    }

    fn insert(&mut self, key: &[u8; 32], leaf: Leaf) -> Result<ComputedNode, TreeError> {
        self.apply(key, leaf)
    }

    fn delete(&mut self, key: &[u8; 32]) -> Result<ComputedNode, TreeError> {
        self.apply(key, Leaf::empty())
    }

    fn get(&self, key: &[u8; 32]) -> Result<Leaf, TreeError> {
        let mut current = Node::Branch(self.root_branch()?);
        for height in 0..MAX_TREE_LEVELS {
            let branch = match current {
                Node::Branch(branch) => branch,
                Node::Compacted(compacted) => {
                    return Ok(if compacted.key() == key {
                        compacted.into_leaf()
                    } else {
                        Leaf::empty()
                    });
                }
                _ => return Ok(Leaf::empty()),
            };

            let child = if bit_index(height, key) == 0 {
                *branch.left
            } else {
                *branch.right
            };
            current = self.resolve(child, height + 1)?;
        }

        match current {
            Node::Compacted(compacted) if compacted.key() == key => Ok(compacted.into_leaf()),
            _ => Ok(Leaf::empty()),
        }
    }

    fn merkle_proof(&self, key: &[u8; 32]) -> Result<Proof, TreeError> {
        let mut siblings = Vec::with_capacity(MAX_TREE_LEVELS);
        let mut current = Node::Branch(self.root_branch()?);
        let mut height = 0;

        while siblings.len() < MAX_TREE_LEVELS {
            match current {
                Node::Branch(branch) => {
                    let (child, sibling) = if bit_index(height, key) == 0 {
                        (*branch.left, *branch.right)
                    } else {
                        (*branch.right, *branch.left)
                    };
                    siblings.push(sibling.to_computed());
                    current = self.resolve(child, height + 1)?;
                    height += 1;
                }
                Node::Compacted(compacted) => {
                    // Expand the compacted subtree into per-level siblings:
                    // everything below it is empty except, for a diverging
                    // key, the stored leaf's own path.
                    if compacted.key() == key {
                        for level in height..MAX_TREE_LEVELS {
                            siblings.push(empty_tree()[level + 1]);
                        }
                    } else {
                        let mut divergence = height;
                        while bit_index(divergence, key)
                            == bit_index(divergence, compacted.key())
                        {
                            divergence += 1;
                        }
                        for level in height..MAX_TREE_LEVELS {
                            if level == divergence {
                                let other = CompactedLeaf::new(
                                    level + 1,
                                    *compacted.key(),
                                    compacted.leaf().clone(),
                                );
                                siblings.push(ComputedNode {
                                    hash: other.hash(),
                                    sum: other.sum(),
                                });
                            } else {
                                siblings.push(empty_tree()[level + 1]);
                            }
                        }
                    }
                    break;
                }
                _ => {
                    // Empty subtree: all remaining siblings are empty.
                    for level in height..MAX_TREE_LEVELS {
                        siblings.push(empty_tree()[level + 1]);
                    }
                    break;
                }
            }
        }

        Proof::new(siblings)
    }

    fn subtree_root(&self, prefix: &[u8; 32], bit_len: usize) -> Result<ComputedNode, TreeError> {
        if bit_len > MAX_TREE_LEVELS {
            return Err(TreeError::InvalidPrefixDepth(bit_len));
        }

        let mut current = Node::Branch(self.root_branch()?);
        let mut height = 0;
        while height < bit_len {
            match current {
                Node::Branch(branch) => {
                    let child = if bit_index(height, prefix) == 0 {
                        *branch.left
                    } else {
                        *branch.right
                    };
                    current = self.resolve(child, height + 1)?;
                    height += 1;
                }
                Node::Compacted(compacted) => {
                    // The lone leaf below this point. It sits inside the
                    // prefix subtree only if its key follows the remaining
                    // prefix bits; re-anchoring the leaf at the prefix
                    // depth then yields that subtree's root.
                    let on_prefix_path = (height..bit_len)
                        .all(|level| bit_index(level, prefix) == bit_index(level, compacted.key()));
                    if !on_prefix_path {
                        return Ok(empty_tree()[bit_len]);
                    }
                    let key = *compacted.key();
                    let projected = CompactedLeaf::new(bit_len, key, compacted.into_leaf());
                    return Ok(ComputedNode {
                        hash: projected.hash(),
                        sum: projected.sum(),
                    });
                }
                _ => return Ok(empty_tree()[bit_len]),
            }
        }

        Ok(current.to_computed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::tree::FullTree;

    fn leaf(n: u8) -> Leaf {
        Leaf::new(vec![n; 8], n as u64 + 1)
    }

    fn test_keys() -> Vec<[u8; 32]> {
        // Includes pairs sharing long prefixes to exercise merging.
        let mut keys: Vec<[u8; 32]> = (0u8..8).map(|i| [i; 32]).collect();
        let mut near = [0u8; 32];
        near[31] = 1;
        keys.push(near);
        let mut far = [0u8; 32];
        far[0] = 0x80;
        keys.push(far);
        keys
    }

    #[test]
    fn matches_full_tree_roots_and_proofs() {
        let mut full = FullTree::new(MemoryStore::new());
        let mut compact = CompactedTree::new(MemoryStore::new());

        for (i, key) in test_keys().iter().enumerate() {
            full.insert(key, leaf(i as u8)).unwrap();
            compact.insert(key, leaf(i as u8)).unwrap();
            assert_eq!(full.root().unwrap(), compact.root().unwrap());
        }

        let root = compact.root().unwrap();
        for (i, key) in test_keys().iter().enumerate() {
            let full_proof = full.merkle_proof(key).unwrap();
            let compact_proof = compact.merkle_proof(key).unwrap();
            assert_eq!(
                full_proof.root(key, &leaf(i as u8)).unwrap(),
                compact_proof.root(key, &leaf(i as u8)).unwrap(),
            );
            assert!(compact_proof.verify(key, &leaf(i as u8), &root));
        }
    }

    #[test]
    fn deletion_collapses_to_full_tree_root() {
        let mut full = FullTree::new(MemoryStore::new());
        let mut compact = CompactedTree::new(MemoryStore::new());
        let keys = test_keys();

        for (i, key) in keys.iter().enumerate() {
            full.insert(key, leaf(i as u8)).unwrap();
            compact.insert(key, leaf(i as u8)).unwrap();
        }
        for key in &keys {
            full.delete(key).unwrap();
            compact.delete(key).unwrap();
            assert_eq!(full.root().unwrap(), compact.root().unwrap());
        }

        assert_eq!(compact.root().unwrap().hash, empty_tree_root());
    }

    #[test]
    fn get_returns_inserted_leaves() {
        let mut compact = CompactedTree::new(MemoryStore::new());
        let keys = test_keys();
        for (i, key) in keys.iter().enumerate() {
            compact.insert(key, leaf(i as u8)).unwrap();
        }
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(compact.get(key).unwrap(), leaf(i as u8));
        }
        assert!(compact.get(&[0xee; 32]).unwrap().is_empty());
    }

    #[test]
    fn subtree_roots_match_full_tree() {
        let mut full = FullTree::new(MemoryStore::new());
        let mut compact = CompactedTree::new(MemoryStore::new());
        for (i, key) in test_keys().iter().enumerate() {
            full.insert(key, leaf(i as u8)).unwrap();
            compact.insert(key, leaf(i as u8)).unwrap();
        }

        // Compare along every inserted key's path and along a vacant one,
        // at depths shallower and deeper than the compacted leaves.
        let mut prefixes = test_keys();
        prefixes.push([0xaa; 32]);
        for prefix in &prefixes {
            for bit_len in [0usize, 1, 3, 8, 16, 64, 256] {
                assert_eq!(
                    full.subtree_root(prefix, bit_len).unwrap(),
                    compact.subtree_root(prefix, bit_len).unwrap(),
                    "prefix {:02x} depth {bit_len}",
                    prefix[0]
                );
            }
        }
    }

    #[test]
    fn non_membership_proof_against_compacted_leaf() {
        let mut compact = CompactedTree::new(MemoryStore::new());
        let key = [0x11u8; 32];
        compact.insert(&key, leaf(1)).unwrap();
        let root = compact.root().unwrap();

        // A key sharing a prefix with the stored leaf but absent.
        let mut absent = key;
        absent[31] ^= 0x01;
        let proof = compact.merkle_proof(&absent).unwrap();
        assert!(proof.verify(&absent, &Leaf::empty(), &root));
        assert!(!proof.verify(&absent, &leaf(1), &root));
    }

    #[test]
    fn overflow_precheck_preserves_state() {
        let mut compact = CompactedTree::new(MemoryStore::new());
        compact
            .insert(&[1; 32], Leaf::new(vec![1], u64::MAX - 10))
            .unwrap();
        let before = compact.root().unwrap();

        let err = compact
            .insert(&[2; 32], Leaf::new(vec![2], 11))
            .unwrap_err();
        assert_eq!(err, TreeError::IntegerOverflow);
        assert_eq!(compact.root().unwrap(), before);
        assert_eq!(compact.get(&[1; 32]).unwrap().sum, u64::MAX - 10);
    }
}
