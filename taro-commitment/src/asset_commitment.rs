use std::collections::BTreeMap;

use taro_asset::{Asset, AssetVersion};
use taro_mssmt::{CompactedTree, ComputedNode, Leaf, MemoryStore, Tree};

use crate::CommitmentError;

/// The inner commitment: an MS-SMT over all assets sharing one Taro
/// commitment key (a single asset id, or a whole asset group). Leaves are
/// keyed by each asset's script-key digest and sum to the total unit count.
#[derive(Debug, Clone)]
pub struct AssetCommitment {
    /// The Taro commitment key all members share.
    tap_key: [u8; 32],
    tree: CompactedTree<MemoryStore>,
    assets: BTreeMap<[u8; 32], Asset>,
    root: ComputedNode,
}

impl AssetCommitment {
    /// Creates a commitment seeded with a first asset.
    pub fn new(asset: Asset) -> Result<Self, CommitmentError> {
        let mut commitment = AssetCommitment {
            tap_key: asset.tap_commitment_key(),
            tree: CompactedTree::new(MemoryStore::new()),
            assets: BTreeMap::new(),
            root: taro_mssmt::empty_tree()[0],
        };
        commitment.upsert(asset)?;
        Ok(commitment)
    }

    /// Creates a commitment over a set of assets, which must all share one
    /// Taro commitment key.
    pub fn from_assets(
        assets: impl IntoIterator<Item = Asset>,
    ) -> Result<Self, CommitmentError> {
        let mut iter = assets.into_iter();
        let first = iter
            .next()
            .ok_or(CommitmentError::MissingAssetCommitment)?;
        let mut commitment = Self::new(first)?;
        for asset in iter {
            commitment.upsert(asset)?;
        }
        Ok(commitment)
    }

    /// Inserts or replaces the given asset's leaf.
    pub fn upsert(&mut self, asset: Asset) -> Result<(), CommitmentError> {
        if asset.tap_commitment_key() != self.tap_key {
            return Err(CommitmentError::CommitmentKeyMismatch(format!(
                "asset {} does not belong to this commitment",
                asset.id()
            )));
        }

        let key = asset.asset_commitment_key();
        let leaf = asset.leaf()?;
        self.root = self.tree.insert(&key, leaf)?;
        self.assets.insert(key, asset);
        Ok(())
    }

    /// Deletes the given asset's leaf, if present.
    pub fn delete(&mut self, asset: &Asset) -> Result<(), CommitmentError> {
        let key = asset.asset_commitment_key();
        self.root = self.tree.delete(&key)?;
        self.assets.remove(&key);
        Ok(())
    }

    /// Merges all of `other`'s assets into this commitment.
    pub fn merge(&mut self, other: &AssetCommitment) -> Result<(), CommitmentError> {
        for asset in other.assets.values() {
            self.upsert(asset.clone())?;
        }
        Ok(())
    }

    /// The Taro commitment key of this commitment.
    pub fn tap_commitment_key(&self) -> [u8; 32] {
        self.tap_key
    }

    /// The root of the inner MS-SMT.
    pub fn root(&self) -> ComputedNode {
        self.root
    }

    /// The maximum asset version among the committed assets.
    pub fn version(&self) -> AssetVersion {
        self.assets
            .values()
            .map(|a| a.version)
            .max()
            .unwrap_or(AssetVersion::V0)
    }

    /// Returns true if the inner tree is empty.
    pub fn is_empty(&self) -> bool {
        self.root.hash == taro_mssmt::empty_tree_root()
    }

    /// The outer-tree leaf summarizing this commitment:
    /// `version(1) || root_hash(32) || root_sum_be64(8)`, summing to the
    /// inner root sum.
    pub fn tap_commitment_leaf(&self) -> Leaf {
        let mut value = Vec::with_capacity(1 + 32 + 8);
        value.push(self.version() as u8);
        value.extend_from_slice(&self.root.hash);
        value.extend_from_slice(&self.root.sum.to_be_bytes());
        Leaf::new(value, self.root.sum)
    }

    /// Produces the asset at `key` (if any) along with its inner-tree
    /// (non-)inclusion proof.
    pub fn asset_proof(
        &self,
        key: [u8; 32],
    ) -> Result<(Option<Asset>, taro_mssmt::Proof), CommitmentError> {
        let proof = self.tree.merkle_proof(&key)?;
        Ok((self.assets.get(&key).cloned(), proof))
    }

    /// The committed assets, keyed by asset-commitment key.
    pub fn assets(&self) -> &BTreeMap<[u8; 32], Asset> {
        &self.assets
    }
}
