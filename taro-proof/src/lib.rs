//! Client-side transition proofs.
//!
//! Ownership of a Taro asset is established entirely off chain: a proof file
//! carries one link per state transition, each binding the asset to an
//! anchor transaction in a block, proving its inclusion in that anchor's
//! Taro commitment and its exclusion from every other anchor output. An
//! offline verifier only needs a chain oracle answering height and
//! timestamp queries.

mod create;
mod file;
mod records;
mod tx;
mod verify;

pub use create::{
    add_bip86_exclusion_proofs, create_transition_proof, update_transition_proof,
    SplitRootParams, TransitionParams,
};
pub use file::File;
pub use records::{
    CommitmentProof, MetaReveal, MetaType, Proof, TapscriptProof, TaprootProof, PROOF_MAGIC_BYTES,
};
pub use tx::TxMerkleProof;
pub use verify::{
    ownership_challenge_digest, verify_file, verify_ownership_proof, verify_proof,
    verify_proof_standalone, ChainLookup,
};

use thiserror::Error;

/// The version of transition proofs produced by this crate.
pub const TRANSITION_VERSION: u32 = 0;

/// Errors returned while building, encoding or verifying proofs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProofError {
    /// The anchor transaction is not bound to the claimed block.
    #[error("proof block mismatch: {0}")]
    BlockMismatch(String),

    /// The anchor output key does not match the committed Taro root.
    #[error("proof anchor mismatch: {0}")]
    AnchorMismatch(String),

    /// The inclusion proof does not place the new asset in the commitment.
    #[error("proof inclusion failed: {0}")]
    InclusionFail(String),

    /// An exclusion proof is missing or does not exclude the asset.
    #[error("proof exclusion failed: {0}")]
    ExclusionFail(String),

    /// The proof chain does not link back to its predecessor.
    #[error("proof chain break: {0}")]
    ChainBreak(String),

    /// Split commitment data is inconsistent.
    #[error("proof split incoherent: {0}")]
    SplitIncoherent(String),

    /// The group witness signature is invalid.
    #[error("group signature invalid")]
    GroupSigInvalid,

    /// A proof or file failed to decode.
    #[error("invalid proof encoding: {0}")]
    InvalidProof(String),

    /// The chain oracle failed or returned no data.
    #[error("chain oracle: {0}")]
    ChainOracle(String),

    /// The requested transaction is unknown to the chain oracle.
    #[error("transaction not found on chain")]
    TxNotFound,

    /// Commitment layer failure.
    #[error(transparent)]
    Commitment(#[from] taro_commitment::CommitmentError),

    /// Asset model failure.
    #[error(transparent)]
    Asset(#[from] taro_asset::AssetError),

    /// MS-SMT failure.
    #[error(transparent)]
    Tree(#[from] taro_mssmt::TreeError),
}
