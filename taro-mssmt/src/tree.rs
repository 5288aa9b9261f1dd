use crate::empty_tree::{empty_tree, empty_tree_root};
use crate::node::{bit_index, Branch, ComputedNode, Leaf, Node, NodeHash, MAX_TREE_LEVELS};
use crate::proof::Proof;
use crate::store::TreeStore;
use crate::TreeError;

/// Common interface of the full and compacted MS-SMT flavors. Both flavors
/// are deterministic: the root only depends on the set of populated leaves.
pub trait Tree {
    /// Returns the root of the tree.
    fn root(&self) -> Result<ComputedNode, TreeError>;

    /// Inserts (or overwrites) the leaf at `key` and returns the new root.
    /// Inserting the empty leaf is equivalent to [`Tree::delete`].
    fn insert(&mut self, key: &[u8; 32], leaf: Leaf) -> Result<ComputedNode, TreeError>;

    /// Deletes the leaf at `key` and returns the new root.
    fn delete(&mut self, key: &[u8; 32]) -> Result<ComputedNode, TreeError>;

    /// Returns the leaf at `key`, or the empty leaf if unpopulated.
    fn get(&self, key: &[u8; 32]) -> Result<Leaf, TreeError>;

    /// Produces a merkle (non-)inclusion proof for `key`.
    fn merkle_proof(&self, key: &[u8; 32]) -> Result<Proof, TreeError>;

    /// Returns the root of the subtree reached by following the first
    /// `bit_len` bits of `prefix` from the root. Remote tree comparison
    /// descends with this to find diverging branches without enumerating
    /// leaves.
    fn subtree_root(&self, prefix: &[u8; 32], bit_len: usize) -> Result<ComputedNode, TreeError>;
}

fn node_not_found(hash: &NodeHash) -> TreeError {
    TreeError::NodeNotFound(hex::encode(hash))
}

/// An MS-SMT that materializes every branch on the path to each populated
/// leaf.
#[derive(Debug, Clone, Default)]
pub struct FullTree<S: TreeStore> {
    store: S,
}

impl<S: TreeStore> FullTree<S> {
    /// Creates a full tree over the given store.
    pub fn new(store: S) -> Self {
        FullTree { store }
    }

    fn root_or_empty(&self) -> Result<Node, TreeError> {
        Ok(match self.store.root_node()? {
            Some(branch) => Node::Branch(branch),
            None => Node::Computed(empty_tree()[0]),
        })
    }

    /// Resolves a computed node at `height` into its stored representation.
    fn resolve(&self, node: Node, height: usize) -> Result<Node, TreeError> {
        let computed = match node {
            Node::Computed(c) => c,
            other => return Ok(other),
        };

        if computed.hash == empty_tree()[height].hash {
            return Ok(Node::Computed(computed));
        }

        if height == MAX_TREE_LEVELS {
            let leaf = self
                .store
                .get_leaf(&computed.hash)?
                .ok_or_else(|| node_not_found(&computed.hash))?;
            Ok(Node::Leaf(leaf))
        } else {
            let branch = self
                .store
                .get_branch(&computed.hash)?
                .ok_or_else(|| node_not_found(&computed.hash))?;
            Ok(Node::Branch(branch))
        }
    }

    /// Walks from the root to the leaf of `key`, returning the siblings
    /// (root-to-leaf), the hashes of the stored branches on the path, and
    /// the current leaf.
    fn walk_down(&self, key: &[u8; 32]) -> Result<(Vec<ComputedNode>, Vec<NodeHash>, Leaf), TreeError> {
        let mut siblings = Vec::with_capacity(MAX_TREE_LEVELS);
        let mut path = Vec::new();
        let mut current = self.root_or_empty()?;

        for height in 0..MAX_TREE_LEVELS {
            let branch = match current {
                Node::Branch(b) => {
                    path.push(b.hash());
                    b
                }
                // An empty subtree: every node below is empty too.
                Node::Computed(_) => {
                    for level in height..MAX_TREE_LEVELS {
                        siblings.push(empty_tree()[level + 1]);
                    }
                    return Ok((siblings, path, Leaf::empty()));
                }
                Node::Leaf(_) | Node::Compacted(_) => {
                    return Err(TreeError::Store(
                        "leaf encountered above the bottom level".into(),
                    ));
                }
            };

            let (next, sibling) = if bit_index(height, key) == 0 {
                (*branch.left, *branch.right)
            } else {
                (*branch.right, *branch.left)
            };
            siblings.push(sibling.to_computed());
            current = self.resolve(next, height + 1)?;
        }

        let leaf = match current {
            Node::Leaf(leaf) => leaf,
            Node::Computed(_) => Leaf::empty(),
            _ => return Err(TreeError::Store("branch at the bottom level".into())),
        };

        Ok((siblings, path, leaf))
    }

    fn insert_leaf(&mut self, key: &[u8; 32], leaf: Leaf) -> Result<ComputedNode, TreeError> {
        let (siblings, old_path, old_leaf) = self.walk_down(key)?;

        // Build the replacement path bottom-up before touching the store so
        // a sum overflow leaves the tree untouched.
        let mut new_branches = Vec::with_capacity(MAX_TREE_LEVELS);
        let mut current = if leaf.is_empty() {
            Node::Computed(empty_tree()[MAX_TREE_LEVELS])
        } else {
            Node::Leaf(leaf.clone())
        };
        for height in (0..MAX_TREE_LEVELS).rev() {
            let sibling = Node::Computed(siblings[height]);
            let branch = if bit_index(height, key) == 0 {
                Branch::new(current, sibling)?
            } else {
                Branch::new(sibling, current)?
            };
            current = Node::Computed(branch.to_computed());
            new_branches.push(branch);
        }

        // The last branch built is the new root.
        let root = new_branches
            .last()
            .map(|b| b.to_computed())
            .unwrap_or(empty_tree()[0]);

        for hash in &old_path {
            self.store.delete_branch(hash)?;
        }
        if !old_leaf.is_empty() {
            self.store.delete_leaf(&old_leaf.hash())?;
        }
        if !leaf.is_empty() {
            self.store.insert_leaf(&leaf)?;
        }

        if root.hash == empty_tree_root() {
            self.store.update_root(None)?;
            return Ok(empty_tree()[0]);
        }

        let mut root_branch = None;
        for (idx, branch) in new_branches.into_iter().enumerate() {
            let height = MAX_TREE_LEVELS - 1 - idx;
            if branch.hash() == empty_tree()[height].hash {
                continue;
            }
            if height == 0 {
                root_branch = Some(branch);
            } else {
                self.store.insert_branch(&branch)?;
            }
        }
        self.store.update_root(root_branch)?;

        Ok(root)
    }

}

impl<S: TreeStore> Tree for FullTree<S> {
    fn root(&self) -> Result<ComputedNode, TreeError> {
        Ok(match self.store.root_node()? {
            Some(branch) => branch.to_computed(),
            None => empty_tree()[0],
        })
    }

    fn insert(&mut self, key: &[u8; 32], leaf: Leaf) -> Result<ComputedNode, TreeError> {
        self.insert_leaf(key, leaf)
    }

    fn delete(&mut self, key: &[u8; 32]) -> Result<ComputedNode, TreeError> {
        self.insert_leaf(key, Leaf::empty())
    }

    fn get(&self, key: &[u8; 32]) -> Result<Leaf, TreeError> {
        let (_, _, leaf) = self.walk_down(key)?;
        Ok(leaf)
    }

    fn merkle_proof(&self, key: &[u8; 32]) -> Result<Proof, TreeError> {
        let (siblings, _, _) = self.walk_down(key)?;
        Proof::new(siblings)
    }

    fn subtree_root(&self, prefix: &[u8; 32], bit_len: usize) -> Result<ComputedNode, TreeError> {
        if bit_len > MAX_TREE_LEVELS {
            return Err(TreeError::InvalidPrefixDepth(bit_len));
        }

        let mut current = self.root_or_empty()?;
        for height in 0..bit_len {
            let branch = match current {
                Node::Branch(branch) => branch,
                // An empty subtree stays empty at every depth below.
                Node::Computed(_) => return Ok(empty_tree()[bit_len]),
                _ => {
                    return Err(TreeError::Store(
                        "leaf encountered above the bottom level".into(),
                    ))
                }
            };

            let next = if bit_index(height, prefix) == 0 {
                *branch.left
            } else {
                *branch.right
            };
            current = self.resolve(next, height + 1)?;
        }

        Ok(current.to_computed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn key(byte: u8) -> [u8; 32] {
        [byte; 32]
    }

    #[test]
    fn empty_tree_root_matches_table() {
        let tree = FullTree::new(MemoryStore::new());
        assert_eq!(tree.root().unwrap().hash, empty_tree_root());
        assert_eq!(tree.root().unwrap().sum, 0);
    }

    #[test]
    fn insert_get_delete() {
        let mut tree = FullTree::new(MemoryStore::new());
        let leaf = Leaf::new(vec![1, 2, 3], 100);

        tree.insert(&key(1), leaf.clone()).unwrap();
        assert_eq!(tree.get(&key(1)).unwrap(), leaf);
        assert_eq!(tree.root().unwrap().sum, 100);

        tree.delete(&key(1)).unwrap();
        assert!(tree.get(&key(1)).unwrap().is_empty());
        assert_eq!(tree.root().unwrap().hash, empty_tree_root());
    }

    #[test]
    fn overwrite_replaces_sum() {
        let mut tree = FullTree::new(MemoryStore::new());
        tree.insert(&key(7), Leaf::new(vec![1], 10)).unwrap();
        tree.insert(&key(7), Leaf::new(vec![2], 25)).unwrap();
        assert_eq!(tree.root().unwrap().sum, 25);
    }

    #[test]
    fn sum_overflow_leaves_tree_unchanged() {
        let mut tree = FullTree::new(MemoryStore::new());
        tree.insert(&key(1), Leaf::new(vec![1], u64::MAX)).unwrap();
        let before = tree.root().unwrap();

        let err = tree.insert(&key(2), Leaf::new(vec![2], 1)).unwrap_err();
        assert_eq!(err, TreeError::IntegerOverflow);
        assert_eq!(tree.root().unwrap(), before);
    }

    #[test]
    fn subtree_roots_partition_the_sum() {
        let mut tree = FullTree::new(MemoryStore::new());
        tree.insert(&key(1), Leaf::new(vec![1], 10)).unwrap();
        tree.insert(&key(2), Leaf::new(vec![2], 20)).unwrap();
        tree.insert(&[0x80; 32], Leaf::new(vec![3], 30)).unwrap();

        // Depth zero is the root itself.
        assert_eq!(tree.subtree_root(&[0; 32], 0).unwrap(), tree.root().unwrap());

        // The two depth-one children account for the full sum.
        let left = tree.subtree_root(&[0x00; 32], 1).unwrap();
        let right = tree.subtree_root(&[0x80; 32], 1).unwrap();
        assert_eq!(left.sum + right.sum, tree.root().unwrap().sum);
        assert_eq!(right.sum, 30);

        // A prefix covering no keys yields the empty subtree.
        let vacant = [0x40u8; 32];
        assert_eq!(
            tree.subtree_root(&vacant, 8).unwrap(),
            empty_tree()[8],
            "no inserted key starts with 0x40"
        );

        assert!(matches!(
            tree.subtree_root(&[0; 32], MAX_TREE_LEVELS + 1),
            Err(TreeError::InvalidPrefixDepth(_))
        ));
    }

    #[test]
    fn proofs_verify_for_members_and_non_members() {
        let mut tree = FullTree::new(MemoryStore::new());
        let leaf = Leaf::new(vec![9; 16], 42);
        tree.insert(&key(3), leaf.clone()).unwrap();
        let root = tree.root().unwrap();

        let proof = tree.merkle_proof(&key(3)).unwrap();
        assert!(proof.verify(&key(3), &leaf, &root));

        // Non-membership: the proof for an absent key commits to the empty
        // leaf.
        let absent = tree.merkle_proof(&key(4)).unwrap();
        assert!(absent.verify(&key(4), &Leaf::empty(), &root));
        assert!(!absent.verify(&key(4), &leaf, &root));
    }
}
