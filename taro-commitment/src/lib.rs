//! The two-level Taro commitment: per-asset MS-SMTs (inner) aggregated into
//! a single Taro MS-SMT (outer), which maps onto one tapscript leaf of the
//! anchor output.

mod asset_commitment;
mod proof;
mod split;
mod tap_commitment;

pub use asset_commitment::AssetCommitment;
pub use proof::{AssetProof, Proof, TaprootAssetProof, TapscriptPreimage, TapscriptPreimageType};
pub use split::{split_leaf, split_locator_key, SplitCommitmentTree, SplitLocator};
pub use tap_commitment::{
    identify_tapscript_sibling, is_taro_commitment_script, taro_marker, AnchorCommitment,
    TapCommitment, TapCommitmentRoot, TARO_COMMITMENT_SCRIPT_SIZE,
};

use thiserror::Error;

/// Errors returned by the commitment layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommitmentError {
    /// An update referenced a missing asset commitment.
    #[error("missing asset commitment")]
    MissingAssetCommitment,

    /// A root-only commitment cannot be merged, proven against or updated.
    #[error("cannot merge or prove against a root-only commitment")]
    CannotMergeRootOnly,

    /// An asset does not belong to the commitment it was inserted into.
    #[error("asset commitment key mismatch: {0}")]
    CommitmentKeyMismatch(String),

    /// A tapscript sibling is itself a Taro commitment.
    #[error("tapscript sibling is a taro commitment")]
    SiblingIsTaroCommitment,

    /// Tapscript sibling identification only supports one or two leaves.
    #[error("unsupported tapscript sibling: {0} leaves")]
    InvalidTapscriptSibling(usize),

    /// A tapscript preimage failed validation.
    #[error("invalid tapscript preimage: {0}")]
    InvalidTapscriptPreimage(String),

    /// The underlying MS-SMT failed.
    #[error(transparent)]
    Tree(#[from] taro_mssmt::TreeError),

    /// The asset model failed.
    #[error(transparent)]
    Asset(#[from] taro_asset::AssetError),

    /// A TLV record failed to decode.
    #[error("invalid commitment proof: {0}")]
    InvalidProof(String),
}
