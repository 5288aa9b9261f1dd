use std::collections::BTreeMap;

use bitcoin::hashes::{sha256, Hash, HashEngine};
use serde::{Deserialize, Serialize};
use taro_asset::{Asset, AssetId, SerializedKey};
use taro_mssmt::{CompactedTree, ComputedNode, Leaf, MemoryStore, Tree};

use crate::CommitmentError;

/// Addresses one split output within a split commitment: which anchor
/// output the split lands on, which asset it is, who controls it, and how
/// many units it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SplitLocator {
    /// The anchor output index the split output is committed at.
    pub output_index: u32,
    /// The asset id being split.
    pub asset_id: AssetId,
    /// The script key of the split output.
    pub script_key: SerializedKey,
    /// The unit amount of the split output.
    pub amount: u64,
}

impl SplitLocator {
    /// The MS-SMT key of the locator within the split tree:
    /// `SHA256(output_index_be || asset_id || script_key)`.
    pub fn key(&self) -> [u8; 32] {
        split_locator_key(self.output_index, self.asset_id, &self.script_key)
    }
}

/// Computes a split locator key from its parts.
pub fn split_locator_key(
    output_index: u32,
    asset_id: AssetId,
    script_key: &SerializedKey,
) -> [u8; 32] {
    let mut engine = sha256::Hash::engine();
    engine.input(&output_index.to_be_bytes());
    engine.input(asset_id.as_ref());
    engine.input(&script_key.bytes);
    sha256::Hash::from_engine(engine).to_byte_array()
}

/// The MS-SMT leaf a split output contributes to the split tree: the asset
/// encoded with its split-commitment witness data stripped (the tree cannot
/// contain itself), summing to the split amount.
pub fn split_leaf(asset: &Asset) -> Result<Leaf, CommitmentError> {
    let mut stripped = asset.clone();
    for witness in &mut stripped.prev_witnesses {
        witness.split_commitment = None;
    }

    let mut value = Vec::new();
    stripped.encode(&mut value)?;
    Ok(Leaf::new(value, asset.amount))
}

/// The split commitment tree of a transfer: every output locator mapped to
/// its split leaf. The root is stored on the split-root asset; each split
/// output carries its own inclusion proof.
#[derive(Debug, Clone)]
pub struct SplitCommitmentTree {
    tree: CompactedTree<MemoryStore>,
    root: ComputedNode,
    leaves: BTreeMap<[u8; 32], Leaf>,
}

impl SplitCommitmentTree {
    /// Builds the split tree over the given split outputs.
    pub fn new<'a>(
        splits: impl IntoIterator<Item = (&'a SplitLocator, &'a Asset)>,
    ) -> Result<Self, CommitmentError> {
        let mut tree = CompactedTree::new(MemoryStore::new());
        let mut leaves = BTreeMap::new();
        let mut root = taro_mssmt::empty_tree()[0];

        for (locator, asset) in splits {
            if locator.amount != asset.amount {
                return Err(CommitmentError::InvalidProof(format!(
                    "split locator amount {} does not match asset amount {}",
                    locator.amount, asset.amount
                )));
            }
            let leaf = split_leaf(asset)?;
            let key = locator.key();
            root = tree.insert(&key, leaf.clone())?;
            leaves.insert(key, leaf);
        }

        Ok(SplitCommitmentTree { tree, root, leaves })
    }

    /// The split commitment root.
    pub fn root(&self) -> ComputedNode {
        self.root
    }

    /// The inclusion proof for one locator.
    pub fn proof(&self, locator: &SplitLocator) -> Result<taro_mssmt::Proof, CommitmentError> {
        Ok(self.tree.merkle_proof(&locator.key())?)
    }

    /// Returns true if the tree holds a leaf for the locator.
    pub fn contains(&self, locator: &SplitLocator) -> bool {
        self.leaves.contains_key(&locator.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};
    use bitcoin::OutPoint;
    use taro_asset::{AssetType, Genesis, ScriptKey};

    fn asset(amount: u64, key: u8) -> Asset {
        let secp = Secp256k1::new();
        let script_key =
            ScriptKey::new(SecretKey::from_slice(&[key; 32]).unwrap().public_key(&secp));
        Asset::new_genesis(
            Genesis {
                first_prev_out: OutPoint::null(),
                tag: "split".into(),
                meta_hash: sha256::Hash::hash(b"split"),
                output_index: 0,
                asset_type: AssetType::Normal,
            },
            amount,
            script_key,
            None,
        )
        .unwrap()
    }

    fn locator(asset: &Asset, output_index: u32) -> SplitLocator {
        SplitLocator {
            output_index,
            asset_id: asset.id(),
            script_key: asset.script_key.serialize(),
            amount: asset.amount,
        }
    }

    #[test]
    fn root_sums_split_amounts() {
        let receiver = asset(400, 1);
        let change = asset(600, 2);
        let tree = SplitCommitmentTree::new([
            (&locator(&receiver, 1), &receiver),
            (&locator(&change, 0), &change),
        ])
        .unwrap();
        assert_eq!(tree.root().sum, 1_000);
    }

    #[test]
    fn proofs_verify_against_root() {
        let receiver = asset(400, 1);
        let change = asset(600, 2);
        let receiver_locator = locator(&receiver, 1);
        let tree = SplitCommitmentTree::new([
            (&receiver_locator, &receiver),
            (&locator(&change, 0), &change),
        ])
        .unwrap();

        let proof = tree.proof(&receiver_locator).unwrap();
        let leaf = split_leaf(&receiver).unwrap();
        assert!(proof.verify(&receiver_locator.key(), &leaf, &tree.root()));
    }

    #[test]
    fn amount_mismatch_rejected() {
        let receiver = asset(400, 1);
        let mut bad = locator(&receiver, 1);
        bad.amount = 399;
        assert!(SplitCommitmentTree::new([(&bad, &receiver)]).is_err());
    }

    #[test]
    fn locator_key_commits_to_all_fields() {
        let receiver = asset(400, 1);
        let base = locator(&receiver, 1);
        let mut other = base;
        other.output_index = 2;
        assert_ne!(base.key(), other.key());
    }
}
