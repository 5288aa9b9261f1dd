//! The send machine: drives an outbound asset parcel from coin selection
//! through virtual signing, anchor construction, broadcast, confirmation,
//! proof storage and receiver delivery. One task owns each in-flight
//! parcel; everything the machine touches outside its own state goes
//! through an injected collaborator trait.

pub mod backoff;
mod guard;
mod parcel;
mod porter;
mod wallet;

pub use backoff::Backoff;
pub use guard::{ContextGuard, GuardOutcome, TaskHandle};
pub use parcel::{
    create_proof_suffix, create_re_anchor_proof, output_commitments, passive_packet_for,
    prepare_for_storage, prepare_passive_asset, AddressParcel, Anchor, AnchorTransaction,
    Destination, OutboundParcel, Parcel, PassiveAssetReAnchor, PreSignedParcel, SendPackage,
    SendState, TransferInput, TransferOutput,
};
pub use porter::{ChainPorter, PorterConfig};
pub use wallet::{
    AnnotatedProof, ChainBridge, CoinSelector, ConfirmationEvent, FundedPsbt, ProofArchive,
    ProofCourier, SelectedCommitment, TransferLog, TxConfirmation, WalletAnchor,
};

use thiserror::Error;

/// Errors surfaced by the send machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FreighterError {
    /// Coin selection could not satisfy the requested amount.
    #[error("input coin selection insufficient: {0}")]
    InputCoinSelectInsufficient(String),

    /// The requested inputs are locked by another in-flight parcel.
    #[error("input locked: {0}")]
    InputLocked(String),

    /// Virtual witness generation failed.
    #[error("virtual sign failed: {0}")]
    VirtualSignFail(String),

    /// The anchor PSBT could not be built or funded.
    #[error("anchor psbt invalid: {0}")]
    AnchorPsbtInvalid(String),

    /// Signing or finalizing the anchor transaction failed.
    #[error("anchor sign failed: {0}")]
    AnchorSignFail(String),

    /// The network rejected the anchor transaction after all retries.
    #[error("broadcast rejected: {0}")]
    BroadcastRejected(String),

    /// A reorg invalidated the confirmation being waited on.
    #[error("reorg detected")]
    ReorgDetected,

    /// A receiver proof could not be delivered.
    #[error("proof delivery failed: {0}")]
    ProofDeliveryFail(String),

    /// The wallet collaborator failed.
    #[error("wallet: {0}")]
    Wallet(String),

    /// The chain bridge collaborator failed.
    #[error("chain bridge: {0}")]
    ChainBridge(String),

    /// Durable storage failed.
    #[error("transfer storage: {0}")]
    Storage(String),

    /// The porter is shutting down.
    #[error("shutting down")]
    Shutdown,

    /// Asset model failure.
    #[error(transparent)]
    Asset(#[from] taro_asset::AssetError),

    /// Commitment layer failure.
    #[error(transparent)]
    Commitment(#[from] taro_commitment::CommitmentError),

    /// Proof layer failure.
    #[error(transparent)]
    Proof(#[from] taro_proof::ProofError),

    /// Virtual packet failure.
    #[error(transparent)]
    Packet(#[from] taro_vpsbt::VPacketError),

    /// MS-SMT failure.
    #[error(transparent)]
    Tree(#[from] taro_mssmt::TreeError),
}
