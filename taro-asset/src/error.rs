use thiserror::Error;

/// Errors returned by the asset model.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssetError {
    /// I/O failed while encoding or decoding.
    #[error("i/o error: {0}")]
    Io(String),

    /// A TLV stream could not be parsed.
    #[error("tlv stream error: {0}")]
    TlvStream(String),

    /// A required TLV field was absent.
    #[error("missing tlv field: {0}")]
    MissingTlvField(&'static str),

    /// An unknown even TLV type was encountered.
    #[error("unknown even tlv type: {0}")]
    UnknownTlvType(u64),

    /// A TLV value failed validation.
    #[error("invalid tlv value for type {0}: {1}")]
    InvalidTlvValue(u64, String),

    /// A public key could not be parsed or tweaked.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// An asset violates a structural rule.
    #[error("invalid asset: {0}")]
    InvalidAsset(String),

    /// Bitcoin consensus (de)serialization failed.
    #[error("bitcoin serialization: {0}")]
    BitcoinSerialization(String),

    /// No tapscript tree is stored under the requested root hash.
    #[error("tapscript tree not found")]
    TreeNotFound,

    /// A tapscript branch must consist of exactly two 32-byte nodes.
    #[error("tapscript tree branch must be 2 nodes")]
    InvalidTapBranch,

    /// Signing the virtual genesis transaction failed.
    #[error("genesis signer: {0}")]
    GenesisSigner(String),
}
