//! Virtual packets: the asset-level transaction, independent of BTC fees
//! and inputs. A packet maps asset inputs to asset outputs, carries the
//! anchor metadata needed to later fund and sign the BTC-level transaction,
//! and holds the split commitment tying non-root outputs to the split root.

mod packet;
mod wire;

pub use packet::{
    signing_digest, InputAnchor, KeyDescriptor, OutputType, VInput, VOutput, VPacket,
};

use thiserror::Error;

/// Errors returned by virtual packet handling.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VPacketError {
    /// The packet has no inputs or outputs where they are required.
    #[error("incomplete packet: {0}")]
    IncompletePacket(String),

    /// Input and output amounts do not balance.
    #[error("amount mismatch: inputs {input_sum}, outputs {output_sum}")]
    AmountMismatch {
        /// Sum of all input amounts.
        input_sum: u64,
        /// Sum of all output amounts.
        output_sum: u64,
    },

    /// The packet needs exactly one split root output.
    #[error("expected exactly one split root output, found {0}")]
    SplitRootCount(usize),

    /// Two active outputs claim the same anchor output index.
    #[error("anchor index {0} carries more than one active asset output")]
    DuplicateAnchorIndex(u32),

    /// An output is missing its committed asset.
    #[error("output {0} has no asset")]
    MissingAsset(usize),

    /// Packet encoding or decoding failed.
    #[error("packet encoding: {0}")]
    Encoding(String),

    /// Asset model failure.
    #[error(transparent)]
    Asset(#[from] taro_asset::AssetError),

    /// Commitment layer failure.
    #[error(transparent)]
    Commitment(#[from] taro_commitment::CommitmentError),
}
