use std::sync::OnceLock;

use crate::node::{branch_hash, ComputedNode, Leaf, NodeHash, MAX_TREE_LEVELS};

static EMPTY_TREE: OnceLock<Vec<ComputedNode>> = OnceLock::new();

/// Returns the precomputed table of empty subtrees. Entry `i` is the root of
/// an empty subtree whose leaves sit `MAX_TREE_LEVELS - i` levels below it;
/// entry 0 is the root of a fully empty tree and entry 256 the empty leaf.
pub fn empty_tree() -> &'static [ComputedNode] {
    EMPTY_TREE.get_or_init(|| {
        let mut nodes = vec![
            ComputedNode {
                hash: [0u8; 32],
                sum: 0,
            };
            MAX_TREE_LEVELS + 1
        ];
        nodes[MAX_TREE_LEVELS] = ComputedNode {
            hash: Leaf::empty().hash(),
            sum: 0,
        };
        for level in (0..MAX_TREE_LEVELS).rev() {
            let child = nodes[level + 1];
            nodes[level] = ComputedNode {
                hash: branch_hash(&child.hash, 0, &child.hash, 0),
                sum: 0,
            };
        }
        nodes
    })
}

/// The root hash of a fully empty tree.
pub fn empty_tree_root() -> NodeHash {
    empty_tree()[0].hash
}

/// The hash of the empty leaf.
pub fn empty_leaf_hash() -> NodeHash {
    empty_tree()[MAX_TREE_LEVELS].hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_has_one_entry_per_level_plus_leaf() {
        assert_eq!(empty_tree().len(), MAX_TREE_LEVELS + 1);
    }

    #[test]
    fn empty_root_is_stable() {
        // The empty root only depends on the hash function, so it must be
        // identical across calls and processes.
        assert_eq!(empty_tree_root(), empty_tree_root());
        assert_ne!(empty_tree_root(), [0u8; 32]);
        assert_eq!(empty_tree()[MAX_TREE_LEVELS].hash, Leaf::empty().hash());
    }

    #[test]
    fn all_levels_are_distinct() {
        let tree = empty_tree();
        for window in tree.windows(2) {
            assert_ne!(window[0].hash, window[1].hash);
        }
    }
}
