//! The Universe: an authenticated log of issuance, transfer and burn
//! events for one asset (or asset group). Each universe is an MS-SMT whose
//! leaves carry raw proofs; universes aggregate into per-proof-type
//! multiverse trees whose roots peers compare to find and fetch the leaves
//! they are missing.

mod addr;
mod federation;
mod multiverse;
mod sync;

pub use addr::{ServerAddr, DEFAULT_UNIVERSE_RPC_PORT};
pub use federation::{
    FederationEnvoy, FederationEnvoyConfig, FederationProofSyncLog, GlobalSyncConfig,
    MemProofSyncLog, ProofSyncLogEntry, ProofSyncStatus, SyncConfigs, SyncDirection,
    UniSyncConfig,
};
pub use multiverse::{MemMultiverse, MultiverseArchive, UpsertItem};
pub use sync::{AssetSyncDiff, RemoteUniverse, SyncType, UniverseSyncer};

use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::secp256k1::PublicKey;
use bitcoin::OutPoint;
use serde::{Deserialize, Serialize};
use taro_asset::{Asset, AssetId, Genesis, GroupKey, SerializedKey};
use taro_mssmt::ComputedNode;
use thiserror::Error;

/// Maximum page size accepted when querying roots, keys and leaves.
pub const MAX_PAGE_SIZE: usize = 16384;

/// Universe-wide tunables.
#[derive(Debug, Clone)]
pub struct UniverseConfig {
    /// Page size used when a query does not specify one.
    pub default_page_size: usize,
}

impl Default for UniverseConfig {
    fn default() -> Self {
        UniverseConfig {
            default_page_size: 512,
        }
    }
}

/// Errors returned by universe operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UniverseError {
    /// No root exists for the requested universe.
    #[error("no universe root found")]
    NoUniverseRoot,

    /// The requested key points at the empty leaf.
    #[error("no universe proof found")]
    NoUniverseProofFound,

    /// No federation servers are configured.
    #[error("no active federation servers")]
    NoUniverseServers,

    /// The server being added is already part of the federation.
    #[error("universe server already added")]
    DuplicateUniverse,

    /// A leaf's proof type does not match its universe identifier.
    #[error("sync proof type mismatch: expected {expected}, got {actual}")]
    SyncProofTypeMismatch {
        /// The identifier's proof type.
        expected: ProofType,
        /// The proof type derived from the leaf.
        actual: ProofType,
    },

    /// The embedded proof failed verification.
    #[error("universe proof rejected: {0}")]
    ProofVerification(String),

    /// A universe inclusion proof does not match the claimed root.
    #[error("universe root mismatch")]
    RootMismatch,

    /// A server address could not be parsed or resolved.
    #[error("invalid universe address: {0}")]
    InvalidServerAddr(String),

    /// A proof type string could not be parsed.
    #[error("unknown proof type: {0}")]
    UnknownProofType(String),

    /// A page size beyond the maximum was requested.
    #[error("page size {0} exceeds maximum {MAX_PAGE_SIZE}")]
    PageSizeTooLarge(usize),

    /// Sync with a remote failed.
    #[error("federation sync: {0}")]
    Sync(String),

    /// The storage backend failed.
    #[error("universe storage: {0}")]
    Storage(String),

    /// MS-SMT failure.
    #[error(transparent)]
    Tree(#[from] taro_mssmt::TreeError),

    /// Proof layer failure.
    #[error(transparent)]
    Proof(#[from] taro_proof::ProofError),
}

/// The event class a universe stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ProofType {
    /// Unspecified, only valid transiently.
    Unspecified = 0,
    /// Asset issuance events.
    Issuance = 1,
    /// Asset transfer events.
    Transfer = 2,
    /// Ignored-outpoint events.
    Ignore = 3,
    /// Burn events.
    Burn = 4,
    /// Mint supply commitments.
    MintSupply = 5,
}

impl std::fmt::Display for ProofType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProofType::Unspecified => "unspecified",
            ProofType::Issuance => "issuance",
            ProofType::Transfer => "transfer",
            ProofType::Ignore => "ignore",
            ProofType::Burn => "burn",
            ProofType::MintSupply => "mint_supply",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for ProofType {
    type Err = UniverseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unspecified" => Ok(ProofType::Unspecified),
            "issuance" => Ok(ProofType::Issuance),
            "transfer" => Ok(ProofType::Transfer),
            "ignore" => Ok(ProofType::Ignore),
            "burn" => Ok(ProofType::Burn),
            "mint_supply" => Ok(ProofType::MintSupply),
            other => Err(UniverseError::UnknownProofType(other.to_string())),
        }
    }
}

/// The proof type a leaf belongs to, derived from its asset.
pub fn proof_type_for_leaf(asset: &Asset, is_burn: bool) -> ProofType {
    if is_burn {
        ProofType::Burn
    } else if asset.is_genesis_asset() {
        ProofType::Issuance
    } else {
        ProofType::Transfer
    }
}

/// What a universe is keyed over: a single asset id, or a whole asset
/// group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UniverseScope {
    /// One ungrouped asset.
    AssetId(AssetId),
    /// All assets under a group key.
    GroupKey(PublicKey),
}

/// Names one universe tree: the asset (or group) plus the proof type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    /// The asset or group the universe tracks.
    pub scope: UniverseScope,
    /// The event class the universe stores.
    pub proof_type: ProofType,
}

impl Identifier {
    /// The 32-byte digest naming the universe: the asset id directly, or
    /// the hash of the x-only group key.
    pub fn bytes(&self) -> [u8; 32] {
        match &self.scope {
            UniverseScope::AssetId(asset_id) => asset_id.to_byte_array(),
            UniverseScope::GroupKey(group_key) => {
                let (xonly, _) = group_key.x_only_public_key();
                sha256::Hash::hash(&xonly.serialize()).to_byte_array()
            }
        }
    }

    /// The 33-byte compact key: the digest with the proof type appended.
    pub fn key(&self) -> [u8; 33] {
        let mut key = [0u8; 33];
        key[..32].copy_from_slice(&self.bytes());
        key[32] = self.proof_type as u8;
        key
    }

    /// The identifier for an asset's natural universe.
    pub fn for_asset(asset: &Asset, proof_type: ProofType) -> Self {
        let scope = match &asset.group_key {
            Some(group) => UniverseScope::GroupKey(group.group_pub_key),
            None => UniverseScope::AssetId(asset.id()),
        };
        Identifier { scope, proof_type }
    }
}

impl std::fmt::Display for Identifier {
    /// Formats as `proof_type-hex(bytes)`, the universe namespace form.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.proof_type, hex::encode(self.bytes()))
    }
}

/// An asset genesis together with its group key, if grouped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisWithGroup {
    /// The asset genesis.
    pub genesis: Genesis,
    /// The group key, for grouped assets.
    pub group_key: Option<GroupKey>,
}

/// A universe leaf: one issuance, transfer or burn event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leaf {
    /// Genesis and group information for the event's asset.
    pub genesis_with_group: GenesisWithGroup,
    /// The encoded proof establishing the event.
    pub raw_proof: Vec<u8>,
    /// The asset after the event.
    pub asset: Asset,
    /// The unit amount of the event.
    pub amount: u64,
    /// True for burn events.
    pub is_burn: bool,
}

impl Leaf {
    /// The MS-SMT leaf for this event. Issuance and burn leaves sum their
    /// amounts; transfer leaves sum 1 each so the tree root counts
    /// transfers.
    pub fn smt_leaf(&self) -> taro_mssmt::Leaf {
        let sum = if self.asset.is_genesis_asset() || self.is_burn {
            self.amount
        } else {
            1
        };
        taro_mssmt::Leaf::new(self.raw_proof.clone(), sum)
    }
}

/// Addresses a leaf within a universe tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeafKey {
    /// Keyed by anchor outpoint and script key.
    Base {
        /// The anchor outpoint of the event.
        out_point: OutPoint,
        /// The event's script key.
        script_key: SerializedKey,
    },
    /// Additionally keyed by asset id, disambiguating grouped assets
    /// sharing an outpoint.
    Asset {
        /// The anchor outpoint of the event.
        out_point: OutPoint,
        /// The event's script key.
        script_key: SerializedKey,
        /// The asset id of the event.
        asset_id: AssetId,
    },
}

impl LeafKey {
    /// The MS-SMT key: `SHA256(out_point || script_key[ || asset_id])`.
    pub fn universe_key(&self) -> [u8; 32] {
        let mut engine = sha256::Hash::engine();
        match self {
            LeafKey::Base {
                out_point,
                script_key,
            } => {
                engine.input(&bitcoin::consensus::encode::serialize(out_point));
                engine.input(&script_key.x_only());
            }
            LeafKey::Asset {
                out_point,
                script_key,
                asset_id,
            } => {
                engine.input(&bitcoin::consensus::encode::serialize(out_point));
                engine.input(&script_key.x_only());
                engine.input(asset_id.as_ref());
            }
        }
        sha256::Hash::from_engine(engine).to_byte_array()
    }

    /// The anchor outpoint of the leaf.
    pub fn out_point(&self) -> OutPoint {
        match self {
            LeafKey::Base { out_point, .. } | LeafKey::Asset { out_point, .. } => *out_point,
        }
    }

    /// The script key of the leaf.
    pub fn script_key(&self) -> SerializedKey {
        match self {
            LeafKey::Base { script_key, .. } | LeafKey::Asset { script_key, .. } => *script_key,
        }
    }
}

/// A universe leaf with the inclusion proofs authenticating it against both
/// the universe root and the multiverse root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniverseProof {
    /// The leaf itself.
    pub leaf: Leaf,
    /// The key the leaf is stored at.
    pub leaf_key: LeafKey,
    /// The universe root at insertion time.
    pub universe_root: ComputedNode,
    /// Inclusion proof of the leaf in the universe tree.
    pub universe_inclusion_proof: taro_mssmt::Proof,
    /// The multiverse root at insertion time.
    pub multiverse_root: ComputedNode,
    /// Inclusion proof of the universe root in the multiverse tree.
    pub multiverse_inclusion_proof: taro_mssmt::Proof,
}

impl UniverseProof {
    /// Verifies the universe-level inclusion proof against an expected
    /// root: the reconstructed root and the carried root must both equal
    /// it.
    pub fn verify_root(&self, expected: ComputedNode) -> bool {
        let reconstructed = match self
            .universe_inclusion_proof
            .root(&self.leaf_key.universe_key(), &self.leaf.smt_leaf())
        {
            Ok(root) => root,
            Err(_) => return false,
        };

        self.universe_root == expected && reconstructed == expected
    }

    /// Verifies the multiverse-level inclusion proof analogously: the
    /// multiverse leaf is the universe root.
    pub fn verify_multiverse_root(&self, id: &Identifier, expected: ComputedNode) -> bool {
        let leaf = multiverse_leaf(&self.universe_root);
        let key = multiverse_key(id);
        let reconstructed = match self.multiverse_inclusion_proof.root(&key, &leaf) {
            Ok(root) => root,
            Err(_) => return false,
        };

        self.multiverse_root == expected && reconstructed == expected
    }
}

/// A prefix of universe-key bits, addressing one subtree of a universe
/// tree. Sync bisection descends these, most significant bit first,
/// matching the MS-SMT key walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TreePrefix {
    bits: [u8; 32],
    bit_len: u16,
}

impl TreePrefix {
    /// The empty prefix: the whole tree.
    pub fn root() -> Self {
        TreePrefix {
            bits: [0u8; 32],
            bit_len: 0,
        }
    }

    /// The number of significant bits.
    pub fn bit_len(&self) -> usize {
        self.bit_len as usize
    }

    /// The prefix bits; only the first [`Self::bit_len`] are significant.
    pub fn bits(&self) -> &[u8; 32] {
        &self.bits
    }

    /// Extends the prefix by one bit. Must not be called on a prefix that
    /// already spans the full tree depth.
    pub fn child(&self, bit: u8) -> TreePrefix {
        let mut bits = self.bits;
        if bit != 0 {
            let index = self.bit_len as usize;
            bits[index / 8] |= 1 << (7 - index % 8);
        }
        TreePrefix {
            bits,
            bit_len: self.bit_len + 1,
        }
    }

    /// Returns true if `key` starts with this prefix.
    pub fn contains(&self, key: &[u8; 32]) -> bool {
        (0..self.bit_len as usize)
            .all(|index| taro_mssmt::bit_index(index, key) == taro_mssmt::bit_index(index, &self.bits))
    }
}

/// The multiverse key of a universe: `SHA256(id.bytes)`.
pub fn multiverse_key(id: &Identifier) -> [u8; 32] {
    sha256::Hash::hash(&id.bytes()).to_byte_array()
}

/// The multiverse leaf for a universe root: the root hash as the value,
/// the root sum as the sum.
pub fn multiverse_leaf(universe_root: &ComputedNode) -> taro_mssmt::Leaf {
    taro_mssmt::Leaf::new(universe_root.hash.to_vec(), universe_root.sum)
}
