use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::taproot::{LeafVersion, TapLeafHash, TapNodeHash};
use bitcoin::ScriptBuf;
use serde::{Deserialize, Serialize};

use crate::AssetError;

/// A single tapscript leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapLeaf {
    /// The leaf script.
    pub script: ScriptBuf,
}

impl TapLeaf {
    /// Wraps a script into a BIP-341 leaf.
    pub fn new(script: ScriptBuf) -> Self {
        TapLeaf { script }
    }

    /// The BIP-341 leaf hash, using the base tapscript leaf version.
    pub fn leaf_hash(&self) -> TapNodeHash {
        TapNodeHash::from(TapLeafHash::from_script(
            &self.script,
            LeafVersion::TapScript,
        ))
    }
}

/// A tapscript branch: exactly two child node hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapBranch {
    /// Hash of the left child.
    pub left: [u8; 32],
    /// Hash of the right child.
    pub right: [u8; 32],
}

impl TapBranch {
    /// Builds a branch from encoded child nodes, which must be exactly two
    /// 32-byte slices.
    pub fn from_slices(nodes: &[Vec<u8>]) -> Result<Self, AssetError> {
        if nodes.len() != 2 || nodes.iter().any(|n| n.len() != 32) {
            return Err(AssetError::InvalidTapBranch);
        }
        let mut left = [0u8; 32];
        left.copy_from_slice(&nodes[0]);
        let mut right = [0u8; 32];
        right.copy_from_slice(&nodes[1]);
        Ok(TapBranch { left, right })
    }

    /// The BIP-341 branch hash over the two children (lexicographically
    /// ordered).
    pub fn branch_hash(&self) -> TapNodeHash {
        TapNodeHash::from_node_hashes(
            TapNodeHash::from_byte_array(self.left),
            TapNodeHash::from_byte_array(self.right),
        )
    }
}

/// A stored tapscript tree: either a list of leaves or a single branch of
/// two child hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TapscriptTreeNodes {
    /// The tree given as its full list of leaves.
    Leaves(Vec<TapLeaf>),
    /// The tree given as a single branch of two node hashes.
    Branch(TapBranch),
}

/// Persists tapscript trees addressed by their root hash, so the root can be
/// used as a key tweak and the tree recovered later. Implemented by the
/// database collaborator.
#[async_trait]
pub trait TapscriptTreeManager: Send + Sync {
    /// Stores a tapscript tree and returns its root hash.
    async fn store_tree(&self, nodes: TapscriptTreeNodes) -> Result<TapNodeHash, AssetError>;

    /// Loads the tapscript tree with the given root hash.
    async fn load_tree(&self, root: TapNodeHash) -> Result<TapscriptTreeNodes, AssetError>;

    /// Deletes the tapscript tree with the given root hash.
    async fn delete_tree(&self, root: TapNodeHash) -> Result<(), AssetError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_requires_two_32_byte_nodes() {
        assert_eq!(
            TapBranch::from_slices(&[vec![0u8; 32]]),
            Err(AssetError::InvalidTapBranch)
        );
        assert_eq!(
            TapBranch::from_slices(&[vec![0u8; 32], vec![0u8; 31]]),
            Err(AssetError::InvalidTapBranch)
        );
        assert!(TapBranch::from_slices(&[vec![1u8; 32], vec![2u8; 32]]).is_ok());
    }

    #[test]
    fn branch_hash_is_order_independent() {
        let a = TapBranch::from_slices(&[vec![1u8; 32], vec![2u8; 32]]).unwrap();
        let b = TapBranch::from_slices(&[vec![2u8; 32], vec![1u8; 32]]).unwrap();
        assert_eq!(a.branch_hash(), b.branch_hash());
    }
}
