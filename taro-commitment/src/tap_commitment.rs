use std::collections::BTreeMap;
use std::sync::OnceLock;

use bitcoin::hashes::{sha256, Hash};
use bitcoin::taproot::TapNodeHash;
use bitcoin::ScriptBuf;
use taro_asset::{Asset, AssetVersion, TapLeaf};
use taro_mssmt::{CompactedTree, ComputedNode, MemoryStore, Tree};

use crate::asset_commitment::AssetCommitment;
use crate::CommitmentError;

/// Size of a Taro commitment tapscript leaf script: version (1), marker
/// (32), root hash (32) and root sum (8).
pub const TARO_COMMITMENT_SCRIPT_SIZE: usize = 1 + 32 + 32 + 8;

static TARO_MARKER: OnceLock<[u8; 32]> = OnceLock::new();

/// The static marker identifying a tapscript leaf as a Taro commitment:
/// `SHA256("taro")`.
pub fn taro_marker() -> [u8; 32] {
    *TARO_MARKER.get_or_init(|| sha256::Hash::hash(b"taro").to_byte_array())
}

/// Returns true if the script is a well-formed Taro commitment leaf script.
pub fn is_taro_commitment_script(script: &[u8]) -> bool {
    script.len() == TARO_COMMITMENT_SCRIPT_SIZE
        && script[0] == AssetVersion::V0 as u8
        && script[1..33] == taro_marker()
}

/// The outer Taro commitment: an MS-SMT over asset commitments, keyed by
/// their Taro commitment keys.
#[derive(Debug, Clone)]
pub struct TapCommitment {
    tree: CompactedTree<MemoryStore>,
    commitments: BTreeMap<[u8; 32], AssetCommitment>,
    root: ComputedNode,
}

impl TapCommitment {
    /// Creates a Taro commitment over the given asset commitments.
    pub fn new(
        commitments: impl IntoIterator<Item = AssetCommitment>,
    ) -> Result<Self, CommitmentError> {
        let mut commitment = TapCommitment {
            tree: CompactedTree::new(MemoryStore::new()),
            commitments: BTreeMap::new(),
            root: taro_mssmt::empty_tree()[0],
        };
        for inner in commitments {
            commitment.upsert(inner)?;
        }
        Ok(commitment)
    }

    /// Creates a Taro commitment from raw assets, bucketing them into inner
    /// commitments by their Taro commitment keys.
    pub fn from_assets(
        assets: impl IntoIterator<Item = Asset>,
    ) -> Result<Self, CommitmentError> {
        let mut inner: BTreeMap<[u8; 32], AssetCommitment> = BTreeMap::new();
        for asset in assets {
            match inner.get_mut(&asset.tap_commitment_key()) {
                Some(commitment) => commitment.upsert(asset)?,
                None => {
                    let commitment = AssetCommitment::new(asset)?;
                    inner.insert(commitment.tap_commitment_key(), commitment);
                }
            }
        }
        Self::new(inner.into_values())
    }

    /// Inserts or replaces an inner commitment. Inserting a commitment whose
    /// tree is empty deletes the outer entry instead: an empty inner tree
    /// hashes differently from an absent one, and the outer root must not
    /// distinguish the two. A tree holding only zero-amount tombstones is
    /// not empty and keeps its entry.
    pub fn upsert(&mut self, inner: AssetCommitment) -> Result<(), CommitmentError> {
        let key = inner.tap_commitment_key();
        if inner.is_empty() {
            self.root = self.tree.delete(&key)?;
            self.commitments.remove(&key);
        } else {
            let leaf = inner.tap_commitment_leaf();
            self.root = self.tree.insert(&key, leaf)?;
            self.commitments.insert(key, inner);
        }
        Ok(())
    }

    /// Deletes an inner commitment from the outer tree.
    pub fn delete(&mut self, key: [u8; 32]) -> Result<(), CommitmentError> {
        self.root = self.tree.delete(&key)?;
        self.commitments.remove(&key);
        Ok(())
    }

    /// The inner commitment an asset would live in, if present.
    pub fn commitment_for(&self, asset: &Asset) -> Option<&AssetCommitment> {
        self.commitments.get(&asset.tap_commitment_key())
    }

    /// The set of inner commitments, keyed by Taro commitment key.
    pub fn commitments(&self) -> &BTreeMap<[u8; 32], AssetCommitment> {
        &self.commitments
    }

    /// All committed assets across inner commitments.
    pub fn committed_assets(&self) -> Vec<&Asset> {
        self.commitments
            .values()
            .flat_map(|c| c.assets().values())
            .collect()
    }

    /// The root of the outer MS-SMT.
    pub fn root(&self) -> ComputedNode {
        self.root
    }

    /// The maximum asset version across inner commitments.
    pub fn version(&self) -> AssetVersion {
        self.commitments
            .values()
            .map(|c| c.version())
            .max()
            .unwrap_or(AssetVersion::V0)
    }

    /// The tapscript leaf committing to this tree on chain.
    pub fn tap_leaf(&self) -> TapLeaf {
        tap_leaf_for_root(self.version(), &self.root)
    }

    /// The tapscript root for this commitment and an optional sibling hash.
    pub fn tapscript_root(&self, sibling: Option<TapNodeHash>) -> TapNodeHash {
        tapscript_root_for_leaf(self.tap_leaf(), sibling)
    }

    /// Computes the full two-level merkle proof for the asset leaf at
    /// `asset_key` within the inner commitment at `tap_key`. A missing inner
    /// commitment yields only the outer (non-inclusion) proof.
    pub fn proof(
        &self,
        tap_key: [u8; 32],
        asset_key: [u8; 32],
    ) -> Result<(Option<Asset>, crate::Proof), CommitmentError> {
        let outer_proof = self.tree.merkle_proof(&tap_key)?;
        let taproot_asset_proof = crate::TaprootAssetProof {
            proof: outer_proof,
            version: self.version(),
        };

        let inner = match self.commitments.get(&tap_key) {
            Some(inner) => inner,
            None => {
                return Ok((
                    None,
                    crate::Proof {
                        asset_proof: None,
                        taproot_asset_proof,
                    },
                ));
            }
        };

        let (asset, inner_proof) = inner.asset_proof(asset_key)?;
        Ok((
            asset,
            crate::Proof {
                asset_proof: Some(crate::AssetProof {
                    proof: inner_proof,
                    version: inner.version(),
                    tap_key,
                }),
                taproot_asset_proof,
            },
        ))
    }

    /// Merges the other commitment into this one, inner tree by inner tree.
    pub fn merge(&mut self, other: &TapCommitment) -> Result<(), CommitmentError> {
        for (key, other_inner) in &other.commitments {
            match self.commitments.get_mut(key) {
                Some(existing) => {
                    let mut merged = existing.clone();
                    merged.merge(other_inner)?;
                    self.upsert(merged)?;
                }
                None => self.upsert(other_inner.clone())?,
            }
        }
        Ok(())
    }

    /// Reduces the commitment to its root-only form.
    pub fn to_root_commitment(&self) -> TapCommitmentRoot {
        TapCommitmentRoot {
            version: self.version(),
            root: self.root,
        }
    }
}

/// A Taro commitment known only by its root: enough to recompute the
/// tapscript leaf and root, but incapable of proofs, upserts or merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapCommitmentRoot {
    /// The maximum committed asset version.
    pub version: AssetVersion,
    /// The outer MS-SMT root.
    pub root: ComputedNode,
}

impl TapCommitmentRoot {
    /// Creates a root-only commitment.
    pub fn new(version: AssetVersion, root: ComputedNode) -> Self {
        TapCommitmentRoot { version, root }
    }

    /// The tapscript leaf committing to this root on chain.
    pub fn tap_leaf(&self) -> TapLeaf {
        tap_leaf_for_root(self.version, &self.root)
    }

    /// The tapscript root for this commitment and an optional sibling hash.
    pub fn tapscript_root(&self, sibling: Option<TapNodeHash>) -> TapNodeHash {
        tapscript_root_for_leaf(self.tap_leaf(), sibling)
    }
}

/// A Taro commitment as reconstructed from storage: the full tree when the
/// node originated it, or just the root when only the anchor was observed.
#[derive(Debug, Clone)]
pub enum AnchorCommitment {
    /// The full commitment with all inner trees.
    Full(TapCommitment),
    /// Only the commitment root.
    RootOnly(TapCommitmentRoot),
}

impl AnchorCommitment {
    /// The outer root.
    pub fn root(&self) -> ComputedNode {
        match self {
            AnchorCommitment::Full(full) => full.root(),
            AnchorCommitment::RootOnly(root) => root.root,
        }
    }

    /// The tapscript leaf for the commitment.
    pub fn tap_leaf(&self) -> TapLeaf {
        match self {
            AnchorCommitment::Full(full) => full.tap_leaf(),
            AnchorCommitment::RootOnly(root) => root.tap_leaf(),
        }
    }

    /// The tapscript root for the commitment and optional sibling.
    pub fn tapscript_root(&self, sibling: Option<TapNodeHash>) -> TapNodeHash {
        match self {
            AnchorCommitment::Full(full) => full.tapscript_root(sibling),
            AnchorCommitment::RootOnly(root) => root.tapscript_root(sibling),
        }
    }

    /// Borrows the full commitment, failing for root-only values.
    pub fn require_full(&self) -> Result<&TapCommitment, CommitmentError> {
        match self {
            AnchorCommitment::Full(full) => Ok(full),
            AnchorCommitment::RootOnly(_) => Err(CommitmentError::CannotMergeRootOnly),
        }
    }

    /// Merges this commitment into `target`. Root-only commitments cannot
    /// be merged.
    pub fn merge_into(&self, target: &mut TapCommitment) -> Result<(), CommitmentError> {
        target.merge(self.require_full()?)
    }
}

fn tap_leaf_for_root(version: AssetVersion, root: &ComputedNode) -> TapLeaf {
    let mut script = Vec::with_capacity(TARO_COMMITMENT_SCRIPT_SIZE);
    script.push(version as u8);
    script.extend_from_slice(&taro_marker());
    script.extend_from_slice(&root.hash);
    script.extend_from_slice(&root.sum.to_be_bytes());
    TapLeaf::new(ScriptBuf::from_bytes(script))
}

fn tapscript_root_for_leaf(leaf: TapLeaf, sibling: Option<TapNodeHash>) -> TapNodeHash {
    let leaf_hash = leaf.leaf_hash();
    match sibling {
        // TapNodeHash orders the operands lexicographically per BIP-341.
        Some(sibling) => TapNodeHash::from_node_hashes(leaf_hash, sibling),
        None => leaf_hash,
    }
}

/// Finds the sibling of the Taro commitment leaf among the tapscript leaves
/// of an anchor output. Only trees of one or two leaves are supported;
/// deeper trees would need branch-preimage siblings.
pub fn identify_tapscript_sibling(
    leaves: &[TapLeaf],
) -> Result<(TapNodeHash, Option<TapLeaf>), CommitmentError> {
    match leaves {
        [lone] => Ok((lone.leaf_hash(), None)),
        [first, second] => {
            let root = TapNodeHash::from_node_hashes(first.leaf_hash(), second.leaf_hash());
            let sibling = if is_taro_commitment_script(first.script.as_bytes()) {
                second
            } else {
                first
            };
            Ok((root, Some(sibling.clone())))
        }
        other => Err(CommitmentError::InvalidTapscriptSibling(other.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};
    use bitcoin::OutPoint;
    use taro_asset::{AssetType, Genesis, ScriptKey};

    fn script_key(byte: u8) -> ScriptKey {
        let secp = Secp256k1::new();
        ScriptKey::new(SecretKey::from_slice(&[byte; 32]).unwrap().public_key(&secp))
    }

    fn genesis(tag: &str) -> Genesis {
        Genesis {
            first_prev_out: OutPoint::null(),
            tag: tag.into(),
            meta_hash: sha256::Hash::hash(tag.as_bytes()),
            output_index: 0,
            asset_type: AssetType::Normal,
        }
    }

    fn asset(tag: &str, amount: u64, key: u8) -> Asset {
        Asset::new_genesis(genesis(tag), amount, script_key(key), None).unwrap()
    }

    #[test]
    fn from_assets_buckets_by_tap_commitment_key() {
        let commitment = TapCommitment::from_assets([
            asset("alpha", 10, 1),
            asset("alpha", 20, 2),
            asset("beta", 5, 3),
        ])
        .unwrap();

        assert_eq!(commitment.commitments().len(), 2);
        assert_eq!(commitment.root().sum, 35);
    }

    #[test]
    fn tap_leaf_is_73_bytes_and_recognized() {
        let commitment = TapCommitment::from_assets([asset("leaf", 1_000, 1)]).unwrap();
        let leaf = commitment.tap_leaf();

        let script = leaf.script.as_bytes();
        assert_eq!(script.len(), TARO_COMMITMENT_SCRIPT_SIZE);
        assert_eq!(script[0], AssetVersion::V0 as u8);
        assert_eq!(&script[1..33], &taro_marker());
        assert!(is_taro_commitment_script(script));

        // The sum is carried in the trailing eight bytes.
        assert_eq!(&script[65..], &1_000u64.to_be_bytes());
    }

    #[test]
    fn copy_preserves_tap_leaf() {
        let commitment =
            TapCommitment::from_assets([asset("copy", 77, 1), asset("copy2", 3, 2)]).unwrap();
        let copy = commitment.clone();
        assert_eq!(copy.tap_leaf(), commitment.tap_leaf());
        assert_eq!(copy.root(), commitment.root());
    }

    #[test]
    fn upsert_empty_inner_equals_delete() {
        let a = asset("del", 50, 1);
        let key = a.tap_commitment_key();

        let mut left = TapCommitment::from_assets([a.clone(), asset("other", 9, 2)]).unwrap();
        let mut right = left.clone();

        // Left: upsert an emptied inner commitment.
        let mut emptied = AssetCommitment::new(a.clone()).unwrap();
        emptied.delete(&a).unwrap();
        left.upsert(emptied).unwrap();

        // Right: delete the outer entry directly.
        right.delete(key).unwrap();

        assert_eq!(left.root(), right.root());
        assert!(left.commitment_for(&a).is_none());
    }

    #[test]
    fn tombstone_only_inner_tree_keeps_outer_entry() {
        let mut tombstone = asset("tomb", 1, 1);
        tombstone.amount = 0;
        tombstone.script_key = ScriptKey::tombstone();
        let key = tombstone.tap_commitment_key();

        let mut commitment = TapCommitment::from_assets([asset("other", 9, 2)]).unwrap();
        let with_other_only = commitment.root();

        commitment
            .upsert(AssetCommitment::new(tombstone).unwrap())
            .unwrap();
        assert_ne!(commitment.root(), with_other_only);
        assert!(commitment.commitments().contains_key(&key));
    }

    #[test]
    fn tapscript_root_with_and_without_sibling() {
        let commitment = TapCommitment::from_assets([asset("sib", 5, 1)]).unwrap();
        let leaf_hash = commitment.tap_leaf().leaf_hash();

        assert_eq!(commitment.tapscript_root(None), leaf_hash);

        let sibling = TapLeaf::new(ScriptBuf::from_bytes(vec![0x51])).leaf_hash();
        let branch = commitment.tapscript_root(Some(sibling));
        assert_eq!(branch, TapNodeHash::from_node_hashes(leaf_hash, sibling));
        // Lexicographic ordering makes the branch orientation-independent.
        assert_eq!(branch, TapNodeHash::from_node_hashes(sibling, leaf_hash));
    }

    #[test]
    fn proof_for_absent_inner_commitment_has_outer_only() {
        let commitment = TapCommitment::from_assets([asset("p", 5, 1)]).unwrap();
        let (found, proof) = commitment.proof([0xaa; 32], [0xbb; 32]).unwrap();
        assert!(found.is_none());
        assert!(proof.asset_proof.is_none());
    }

    #[test]
    fn merge_unions_assets() {
        let mut left = TapCommitment::from_assets([asset("m1", 10, 1)]).unwrap();
        let right =
            TapCommitment::from_assets([asset("m1", 5, 2), asset("m2", 7, 3)]).unwrap();

        left.merge(&right).unwrap();
        assert_eq!(left.root().sum, 22);
        assert_eq!(
            left.committed_assets().len(),
            3,
            "merge must union across inner commitments"
        );

        let expected = TapCommitment::from_assets([
            asset("m1", 10, 1),
            asset("m1", 5, 2),
            asset("m2", 7, 3),
        ])
        .unwrap();
        assert_eq!(left.root(), expected.root());
    }

    #[test]
    fn root_only_cannot_merge() {
        let full = TapCommitment::from_assets([asset("r", 2, 1)]).unwrap();
        let root_only = AnchorCommitment::RootOnly(full.to_root_commitment());

        let mut target = TapCommitment::from_assets([asset("t", 2, 2)]).unwrap();
        assert!(matches!(
            root_only.merge_into(&mut target),
            Err(CommitmentError::CannotMergeRootOnly)
        ));

        // The root-only view still maps to the same tapscript leaf.
        assert_eq!(root_only.tap_leaf(), full.tap_leaf());
    }

    #[test]
    fn sibling_identification_limits() {
        let taro_leaf = TapCommitment::from_assets([asset("s", 1, 1)])
            .unwrap()
            .tap_leaf();
        let other = TapLeaf::new(ScriptBuf::from_bytes(vec![0x51]));

        let (root, sibling) = identify_tapscript_sibling(&[taro_leaf.clone()]).unwrap();
        assert_eq!(root, taro_leaf.leaf_hash());
        assert!(sibling.is_none());

        let (_, sibling) =
            identify_tapscript_sibling(&[taro_leaf.clone(), other.clone()]).unwrap();
        assert_eq!(sibling, Some(other.clone()));

        let (_, sibling) = identify_tapscript_sibling(&[other.clone(), taro_leaf.clone()]).unwrap();
        assert_eq!(sibling, Some(other.clone()));

        assert!(matches!(
            identify_tapscript_sibling(&[taro_leaf, other.clone(), other]),
            Err(CommitmentError::InvalidTapscriptSibling(3))
        ));
    }
}
