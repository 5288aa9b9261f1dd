use std::io::{Read, Write};

use bitcoin::consensus::Encodable;
use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::secp256k1::{PublicKey, Secp256k1};
use bitcoin::OutPoint;
use serde::{Deserialize, Serialize};

use crate::keys::{ScriptKey, SerializedKey};
use crate::tlv::{self, Record, Stream, Type};
use crate::AssetError;

/// A 32-byte digest uniquely fixing a genesis record.
pub type AssetId = sha256::Hash;

/// The version of an asset. V1 assets leave the witness vector out of their
/// MS-SMT leaf encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum AssetVersion {
    /// Default version; the full witness vector is part of the leaf.
    V0 = 0,
    /// Leaf encoding omits the witness vector.
    V1 = 1,
}

impl AssetVersion {
    pub(crate) fn from_u8(value: u8) -> Result<Self, AssetError> {
        match value {
            0 => Ok(AssetVersion::V0),
            1 => Ok(AssetVersion::V1),
            other => Err(AssetError::InvalidTlvValue(
                ASSET_VERSION_TYPE.0,
                format!("unknown asset version {other}"),
            )),
        }
    }
}

/// The type of an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum AssetType {
    /// Fungible units that can be split and merged.
    Normal = 0,
    /// A collectible: a single indivisible unit.
    Collectible = 1,
}

impl AssetType {
    pub(crate) fn from_u8(value: u8) -> Result<Self, AssetError> {
        match value {
            0 => Ok(AssetType::Normal),
            1 => Ok(AssetType::Collectible),
            other => Err(AssetError::InvalidTlvValue(
                GENESIS_TYPE.0,
                format!("unknown asset type {other}"),
            )),
        }
    }
}

/// The immutable genesis record of an asset. Its digest is the asset id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Genesis {
    /// The first previous outpoint of the genesis transaction.
    pub first_prev_out: OutPoint,
    /// The human-readable asset tag.
    pub tag: String,
    /// Digest of the asset meta data.
    pub meta_hash: sha256::Hash,
    /// The index of the genesis output carrying the commitment.
    pub output_index: u32,
    /// The asset type.
    pub asset_type: AssetType,
}

impl Genesis {
    /// Computes the asset id:
    /// `SHA256(first_prev_out || SHA256(tag) || meta_hash || output_index_be || type)`.
    pub fn asset_id(&self) -> AssetId {
        let tag_hash = sha256::Hash::hash(self.tag.as_bytes());
        let mut engine = sha256::Hash::engine();
        engine.input(&bitcoin::consensus::encode::serialize(&self.first_prev_out));
        engine.input(tag_hash.as_ref());
        engine.input(self.meta_hash.as_ref());
        engine.input(&self.output_index.to_be_bytes());
        engine.input(&[self.asset_type as u8]);
        sha256::Hash::from_engine(engine)
    }

    fn encode<W: Write>(&self, w: &mut W) -> Result<(), AssetError> {
        w.write_all(&bitcoin::consensus::encode::serialize(&self.first_prev_out))
            .map_err(|e| AssetError::Io(e.to_string()))?;
        tlv::write_var_bytes(w, self.tag.as_bytes())?;
        w.write_all(self.meta_hash.as_ref())
            .map_err(|e| AssetError::Io(e.to_string()))?;
        w.write_all(&self.output_index.to_be_bytes())
            .map_err(|e| AssetError::Io(e.to_string()))?;
        w.write_all(&[self.asset_type as u8])
            .map_err(|e| AssetError::Io(e.to_string()))?;
        Ok(())
    }

    fn decode<R: Read>(r: &mut R) -> Result<Self, AssetError> {
        let mut out_point_bytes = [0u8; 36];
        r.read_exact(&mut out_point_bytes)
            .map_err(|e| AssetError::Io(e.to_string()))?;
        let first_prev_out: OutPoint =
            bitcoin::consensus::encode::deserialize(&out_point_bytes)
                .map_err(|e| AssetError::BitcoinSerialization(e.to_string()))?;

        let tag_bytes = tlv::read_var_bytes(r, 256)?;
        let tag = String::from_utf8(tag_bytes)
            .map_err(|e| AssetError::InvalidTlvValue(GENESIS_TYPE.0, e.to_string()))?;

        let mut meta_hash = [0u8; 32];
        r.read_exact(&mut meta_hash)
            .map_err(|e| AssetError::Io(e.to_string()))?;

        let mut index_bytes = [0u8; 4];
        r.read_exact(&mut index_bytes)
            .map_err(|e| AssetError::Io(e.to_string()))?;

        let mut type_byte = [0u8; 1];
        r.read_exact(&mut type_byte)
            .map_err(|e| AssetError::Io(e.to_string()))?;

        Ok(Genesis {
            first_prev_out,
            tag,
            meta_hash: sha256::Hash::from_byte_array(meta_hash),
            output_index: u32::from_be_bytes(index_bytes),
            asset_type: AssetType::from_u8(type_byte[0])?,
        })
    }
}

/// The key material tying an asset to an asset group: the raw internal key,
/// the tweaked group key, and the witness authorizing this asset's
/// membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupKey {
    /// The untweaked internal group key.
    pub raw_key: PublicKey,
    /// The group key tweaked with the group anchor's asset id.
    pub group_pub_key: PublicKey,
    /// Witness authorizing the asset's membership in the group.
    pub witness: bitcoin::Witness,
}

impl GroupKey {
    /// Derives the tweaked group key for a raw key and the group anchor
    /// genesis.
    pub fn derive(raw_key: PublicKey, anchor_genesis: &Genesis) -> Result<PublicKey, AssetError> {
        let secp = Secp256k1::verification_only();
        let tweak = bitcoin::secp256k1::Scalar::from_be_bytes(
            anchor_genesis.asset_id().to_byte_array(),
        )
        .map_err(|e| AssetError::InvalidKey(e.to_string()))?;
        raw_key
            .add_exp_tweak(&secp, &tweak)
            .map_err(|e| AssetError::InvalidKey(e.to_string()))
    }

    /// The x-only serialization of the tweaked group key.
    pub fn x_only_bytes(&self) -> [u8; 32] {
        self.group_pub_key.x_only_public_key().0.serialize()
    }
}

/// Reference to a previously anchored asset: the outpoint it was committed
/// at, its asset id and its script key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrevId {
    /// The anchor outpoint of the input asset.
    pub out_point: OutPoint,
    /// The asset id of the input asset.
    pub asset_id: AssetId,
    /// The script key of the input asset.
    pub script_key: SerializedKey,
}

impl PrevId {
    fn encode<W: Write>(&self, w: &mut W) -> Result<(), AssetError> {
        w.write_all(&bitcoin::consensus::encode::serialize(&self.out_point))
            .map_err(|e| AssetError::Io(e.to_string()))?;
        w.write_all(self.asset_id.as_ref())
            .map_err(|e| AssetError::Io(e.to_string()))?;
        w.write_all(&self.script_key.bytes)
            .map_err(|e| AssetError::Io(e.to_string()))?;
        Ok(())
    }

    fn decode<R: Read>(r: &mut R) -> Result<Self, AssetError> {
        let mut out_point_bytes = [0u8; 36];
        r.read_exact(&mut out_point_bytes)
            .map_err(|e| AssetError::Io(e.to_string()))?;
        let out_point: OutPoint = bitcoin::consensus::encode::deserialize(&out_point_bytes)
            .map_err(|e| AssetError::BitcoinSerialization(e.to_string()))?;

        let mut id = [0u8; 32];
        r.read_exact(&mut id)
            .map_err(|e| AssetError::Io(e.to_string()))?;

        let mut key = [0u8; 33];
        r.read_exact(&mut key)
            .map_err(|e| AssetError::Io(e.to_string()))?;

        Ok(PrevId {
            out_point,
            asset_id: sha256::Hash::from_byte_array(id),
            script_key: SerializedKey { bytes: key },
        })
    }
}

/// The split-commitment data a non-root split output carries: a proof
/// locating its split leaf under the root asset's split tree, and the root
/// asset itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitCommitment {
    /// Inclusion proof of the split leaf in the root's split tree.
    pub proof: taro_mssmt::Proof,
    /// The root asset carrying the split commitment root.
    pub root_asset: Box<Asset>,
}

/// A state-transition witness. The witness list of an asset forms a chain
/// back to its genesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Witness {
    /// The input asset being spent; `None` only for the genesis witness.
    pub prev_id: Option<PrevId>,
    /// The transaction witness authorizing the transition.
    pub tx_witness: bitcoin::Witness,
    /// Present on split outputs created by this transition.
    pub split_commitment: Option<SplitCommitment>,
}

impl Witness {
    /// The genesis witness: no previous input, no witness data.
    pub fn genesis() -> Self {
        Witness {
            prev_id: None,
            tx_witness: bitcoin::Witness::new(),
            split_commitment: None,
        }
    }
}

/// A Taro asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// The asset version.
    pub version: AssetVersion,
    /// The genesis record; never changes across transfers.
    pub genesis: Genesis,
    /// The number of units held.
    pub amount: u64,
    /// Optional absolute lock time.
    pub lock_time: u64,
    /// Optional relative lock time.
    pub relative_lock_time: u64,
    /// The script version; only 0 is defined.
    pub script_version: u16,
    /// The script key controlling the asset.
    pub script_key: ScriptKey,
    /// The asset group, if the asset belongs to one.
    pub group_key: Option<GroupKey>,
    /// The witness chain back to genesis.
    pub prev_witnesses: Vec<Witness>,
    /// The root of the split-commitment tree, present on split roots.
    pub split_commitment_root: Option<taro_mssmt::ComputedNode>,
}

impl Asset {
    /// Creates a genesis asset: a single genesis witness and no split data.
    pub fn new_genesis(
        genesis: Genesis,
        amount: u64,
        script_key: ScriptKey,
        group_key: Option<GroupKey>,
    ) -> Result<Self, AssetError> {
        if genesis.asset_type == AssetType::Collectible && amount != 1 {
            return Err(AssetError::InvalidAsset(format!(
                "collectible amount must be 1, got {amount}"
            )));
        }

        Ok(Asset {
            version: AssetVersion::V0,
            genesis,
            amount,
            lock_time: 0,
            relative_lock_time: 0,
            script_version: 0,
            script_key,
            group_key,
            prev_witnesses: vec![Witness::genesis()],
            split_commitment_root: None,
        })
    }

    /// The asset id, fixed by the genesis record.
    pub fn id(&self) -> AssetId {
        self.genesis.asset_id()
    }

    /// The key this asset's leaf is stored at inside its asset commitment:
    /// `SHA256(script_key.x_only)`.
    pub fn asset_commitment_key(&self) -> [u8; 32] {
        sha256::Hash::hash(&self.script_key.x_only().serialize()).to_byte_array()
    }

    /// The key the enclosing asset commitment is stored at inside the Taro
    /// commitment: the group key digest for grouped assets, the asset id
    /// otherwise.
    pub fn tap_commitment_key(&self) -> [u8; 32] {
        match &self.group_key {
            Some(group) => sha256::Hash::hash(&group.x_only_bytes()).to_byte_array(),
            None => self.id().to_byte_array(),
        }
    }

    /// Returns true if the asset still carries its genesis witness, i.e. it
    /// has never been transferred.
    pub fn is_genesis_asset(&self) -> bool {
        self.prev_witnesses.len() == 1
            && self.prev_witnesses[0].prev_id.is_none()
            && self.prev_witnesses[0].tx_witness.is_empty()
            && self.prev_witnesses[0].split_commitment.is_none()
    }

    /// Returns true if any witness carries a split commitment, meaning the
    /// asset is a split output rather than a split root.
    pub fn has_split_commitment_witness(&self) -> bool {
        self.prev_witnesses
            .iter()
            .any(|w| w.split_commitment.is_some())
    }

    /// The first previous input of the asset, if it has one.
    pub fn first_prev_id(&self) -> Option<&PrevId> {
        self.prev_witnesses.iter().find_map(|w| w.prev_id.as_ref())
    }

    /// Returns true if this asset is provably burnt: its script key is the
    /// burn key derived from its first previous input.
    pub fn is_burn(&self) -> bool {
        let secp = Secp256k1::verification_only();
        match self.first_prev_id() {
            Some(prev_id) => self.script_key.is_burn_for(&secp, prev_id),
            None => false,
        }
    }

    /// Produces the MS-SMT leaf for this asset: the TLV encoding as the
    /// value, the amount as the sum. V1 assets omit the witness vector from
    /// the encoding.
    pub fn leaf(&self) -> Result<taro_mssmt::Leaf, AssetError> {
        let mut value = Vec::new();
        self.encode_inner(&mut value, self.version == AssetVersion::V0)?;
        Ok(taro_mssmt::Leaf::new(value, self.amount))
    }

    /// Encodes the asset as a TLV stream.
    pub fn encode<W: Write>(&self, w: &mut W) -> Result<(), AssetError> {
        self.encode_inner(w, true)
    }

    fn encode_inner<W: Write>(&self, w: &mut W, with_witnesses: bool) -> Result<(), AssetError> {
        tlv::write_record(w, ASSET_VERSION_TYPE, &[self.version as u8])?;

        let mut genesis_bytes = Vec::new();
        self.genesis.encode(&mut genesis_bytes)?;
        tlv::write_record(w, GENESIS_TYPE, &genesis_bytes)?;

        tlv::write_record(w, AMOUNT_TYPE, &self.amount.to_be_bytes())?;
        if self.lock_time != 0 {
            tlv::write_record(w, LOCK_TIME_TYPE, &self.lock_time.to_be_bytes())?;
        }
        if self.relative_lock_time != 0 {
            tlv::write_record(
                w,
                RELATIVE_LOCK_TIME_TYPE,
                &self.relative_lock_time.to_be_bytes(),
            )?;
        }

        if with_witnesses && !self.prev_witnesses.is_empty() {
            let mut witnesses = Vec::new();
            tlv::write_varint(&mut witnesses, self.prev_witnesses.len() as u64)?;
            for witness in &self.prev_witnesses {
                let mut bytes = Vec::new();
                encode_witness(&mut bytes, witness)?;
                tlv::write_var_bytes(&mut witnesses, &bytes)?;
            }
            tlv::write_record(w, PREV_WITNESSES_TYPE, &witnesses)?;
        }

        if let Some(root) = &self.split_commitment_root {
            let mut bytes = Vec::with_capacity(40);
            bytes.extend_from_slice(&root.hash);
            bytes.extend_from_slice(&root.sum.to_be_bytes());
            tlv::write_record(w, SPLIT_COMMITMENT_ROOT_TYPE, &bytes)?;
        }

        tlv::write_record(w, SCRIPT_VERSION_TYPE, &self.script_version.to_be_bytes())?;
        tlv::write_record(w, SCRIPT_KEY_TYPE, &self.script_key.serialize().bytes)?;

        if let Some(group) = &self.group_key {
            let mut bytes = Vec::new();
            bytes.extend_from_slice(&group.raw_key.serialize());
            bytes.extend_from_slice(&group.group_pub_key.serialize());
            group
                .witness
                .consensus_encode(&mut bytes)
                .map_err(|e| AssetError::Io(e.to_string()))?;
            tlv::write_record(w, GROUP_KEY_TYPE, &bytes)?;
        }

        Ok(())
    }

    /// Decodes an asset from a TLV stream.
    pub fn decode<R: Read>(r: R) -> Result<Self, AssetError> {
        let mut stream = Stream::new(r);

        let mut version = None;
        let mut genesis = None;
        let mut amount = None;
        let mut lock_time = 0u64;
        let mut relative_lock_time = 0u64;
        let mut prev_witnesses = Vec::new();
        let mut split_commitment_root = None;
        let mut script_version = None;
        let mut script_key = None;
        let mut group_key = None;

        while let Some(record) = stream.next_record()? {
            match record.tlv_type() {
                ASSET_VERSION_TYPE => {
                    version = Some(AssetVersion::from_u8(single_byte(&record)?)?);
                }
                GENESIS_TYPE => {
                    genesis = Some(Genesis::decode(&mut record.value_reader())?);
                }
                AMOUNT_TYPE => amount = Some(be_u64(&record)?),
                LOCK_TIME_TYPE => lock_time = be_u64(&record)?,
                RELATIVE_LOCK_TIME_TYPE => relative_lock_time = be_u64(&record)?,
                PREV_WITNESSES_TYPE => {
                    let mut reader = record.value_reader();
                    let count = tlv::read_varint(&mut reader)?;
                    for _ in 0..count {
                        let bytes = tlv::read_var_bytes(&mut reader, 1 << 20)?;
                        prev_witnesses.push(decode_witness(&mut bytes.as_slice())?);
                    }
                }
                SPLIT_COMMITMENT_ROOT_TYPE => {
                    let value = record.value();
                    if value.len() != 40 {
                        return Err(AssetError::InvalidTlvValue(
                            SPLIT_COMMITMENT_ROOT_TYPE.0,
                            format!("length must be 40, got {}", value.len()),
                        ));
                    }
                    let mut hash = [0u8; 32];
                    hash.copy_from_slice(&value[..32]);
                    let mut sum = [0u8; 8];
                    sum.copy_from_slice(&value[32..]);
                    split_commitment_root = Some(taro_mssmt::ComputedNode {
                        hash,
                        sum: u64::from_be_bytes(sum),
                    });
                }
                SCRIPT_VERSION_TYPE => {
                    let value = record.value();
                    if value.len() != 2 {
                        return Err(AssetError::InvalidTlvValue(
                            SCRIPT_VERSION_TYPE.0,
                            "length must be 2".into(),
                        ));
                    }
                    script_version = Some(u16::from_be_bytes([value[0], value[1]]));
                }
                SCRIPT_KEY_TYPE => {
                    let value = record.value();
                    if value.len() != 33 {
                        return Err(AssetError::InvalidTlvValue(
                            SCRIPT_KEY_TYPE.0,
                            "length must be 33".into(),
                        ));
                    }
                    let mut bytes = [0u8; 33];
                    bytes.copy_from_slice(value);
                    script_key = Some(ScriptKey::new(
                        SerializedKey { bytes }.parse()?,
                    ));
                }
                GROUP_KEY_TYPE => {
                    group_key = Some(decode_group_key(record.value())?);
                }
                other if other.is_odd() => {
                    // Unknown optional types are skipped.
                }
                other => return Err(AssetError::UnknownTlvType(other.0)),
            }
        }

        Ok(Asset {
            version: version.ok_or(AssetError::MissingTlvField("Asset.version"))?,
            genesis: genesis.ok_or(AssetError::MissingTlvField("Asset.genesis"))?,
            amount: amount.ok_or(AssetError::MissingTlvField("Asset.amount"))?,
            lock_time,
            relative_lock_time,
            script_version: script_version
                .ok_or(AssetError::MissingTlvField("Asset.script_version"))?,
            script_key: script_key.ok_or(AssetError::MissingTlvField("Asset.script_key"))?,
            group_key,
            prev_witnesses,
            split_commitment_root,
        })
    }

    /// Encodes the asset into a fresh byte vector.
    pub fn to_bytes(&self) -> Result<Vec<u8>, AssetError> {
        let mut bytes = Vec::new();
        self.encode(&mut bytes)?;
        Ok(bytes)
    }

    /// Decodes an asset from a byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AssetError> {
        Self::decode(bytes)
    }
}

// Asset TLV types.
const ASSET_VERSION_TYPE: Type = Type(0);
const GENESIS_TYPE: Type = Type(2);
const AMOUNT_TYPE: Type = Type(4);
const LOCK_TIME_TYPE: Type = Type(6);
const RELATIVE_LOCK_TIME_TYPE: Type = Type(8);
const PREV_WITNESSES_TYPE: Type = Type(10);
const SPLIT_COMMITMENT_ROOT_TYPE: Type = Type(12);
const SCRIPT_VERSION_TYPE: Type = Type(14);
const SCRIPT_KEY_TYPE: Type = Type(16);
const GROUP_KEY_TYPE: Type = Type(18);

// Witness sub-TLV types.
const WITNESS_PREV_ID_TYPE: Type = Type(0);
const WITNESS_TX_WITNESS_TYPE: Type = Type(2);
const WITNESS_SPLIT_COMMITMENT_TYPE: Type = Type(4);

fn single_byte(record: &Record) -> Result<u8, AssetError> {
    let value = record.value();
    if value.len() != 1 {
        return Err(AssetError::InvalidTlvValue(
            record.tlv_type().0,
            "length must be 1".into(),
        ));
    }
    Ok(value[0])
}

fn be_u64(record: &Record) -> Result<u64, AssetError> {
    let value = record.value();
    if value.len() != 8 {
        return Err(AssetError::InvalidTlvValue(
            record.tlv_type().0,
            "length must be 8".into(),
        ));
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(value);
    Ok(u64::from_be_bytes(bytes))
}

fn encode_witness<W: Write>(w: &mut W, witness: &Witness) -> Result<(), AssetError> {
    if let Some(prev_id) = &witness.prev_id {
        let mut bytes = Vec::with_capacity(36 + 32 + 33);
        prev_id.encode(&mut bytes)?;
        tlv::write_record(w, WITNESS_PREV_ID_TYPE, &bytes)?;
    }

    if !witness.tx_witness.is_empty() {
        let mut bytes = Vec::new();
        witness
            .tx_witness
            .consensus_encode(&mut bytes)
            .map_err(|e| AssetError::Io(e.to_string()))?;
        tlv::write_record(w, WITNESS_TX_WITNESS_TYPE, &bytes)?;
    }

    if let Some(split) = &witness.split_commitment {
        let mut bytes = Vec::new();
        let mut proof_bytes = Vec::new();
        split
            .proof
            .compress()
            .encode(&mut proof_bytes)
            .map_err(|e| AssetError::TlvStream(e.to_string()))?;
        tlv::write_var_bytes(&mut bytes, &proof_bytes)?;

        let mut asset_bytes = Vec::new();
        split.root_asset.encode(&mut asset_bytes)?;
        tlv::write_var_bytes(&mut bytes, &asset_bytes)?;

        tlv::write_record(w, WITNESS_SPLIT_COMMITMENT_TYPE, &bytes)?;
    }

    Ok(())
}

fn decode_witness<R: Read>(r: &mut R) -> Result<Witness, AssetError> {
    let mut stream = Stream::new(r);
    let mut prev_id = None;
    let mut tx_witness = bitcoin::Witness::new();
    let mut split_commitment = None;

    while let Some(record) = stream.next_record()? {
        match record.tlv_type() {
            WITNESS_PREV_ID_TYPE => {
                prev_id = Some(PrevId::decode(&mut record.value_reader())?);
            }
            WITNESS_TX_WITNESS_TYPE => {
                tx_witness = bitcoin::consensus::encode::deserialize(record.value())
                    .map_err(|e| AssetError::BitcoinSerialization(e.to_string()))?;
            }
            WITNESS_SPLIT_COMMITMENT_TYPE => {
                let mut reader = record.value_reader();
                let proof_bytes = tlv::read_var_bytes(&mut reader, 1 << 20)?;
                let proof = taro_mssmt::CompressedProof::decode(&mut proof_bytes.as_slice())
                    .map_err(|e| AssetError::TlvStream(e.to_string()))?
                    .decompress()
                    .map_err(|e| AssetError::TlvStream(e.to_string()))?;

                let asset_bytes = tlv::read_var_bytes(&mut reader, 1 << 20)?;
                let root_asset = Asset::decode(asset_bytes.as_slice())?;

                split_commitment = Some(SplitCommitment {
                    proof,
                    root_asset: Box::new(root_asset),
                });
            }
            other if other.is_odd() => {}
            other => return Err(AssetError::UnknownTlvType(other.0)),
        }
    }

    Ok(Witness {
        prev_id,
        tx_witness,
        split_commitment,
    })
}

fn decode_group_key(bytes: &[u8]) -> Result<GroupKey, AssetError> {
    if bytes.len() < 66 {
        return Err(AssetError::InvalidTlvValue(
            GROUP_KEY_TYPE.0,
            format!("group key record too short: {}", bytes.len()),
        ));
    }

    let witness = bitcoin::consensus::encode::deserialize(&bytes[66..])
        .map_err(|e| AssetError::BitcoinSerialization(e.to_string()))?;

    Ok(GroupKey {
        raw_key: PublicKey::from_slice(&bytes[..33])
            .map_err(|e| AssetError::InvalidKey(e.to_string()))?,
        group_pub_key: PublicKey::from_slice(&bytes[33..66])
            .map_err(|e| AssetError::InvalidKey(e.to_string()))?,
        witness,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::SecretKey;

    fn test_script_key(byte: u8) -> ScriptKey {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[byte; 32]).unwrap();
        ScriptKey::new(secret.public_key(&secp))
    }

    pub(crate) fn test_genesis(tag: &str) -> Genesis {
        Genesis {
            first_prev_out: OutPoint::null(),
            tag: tag.to_string(),
            meta_hash: sha256::Hash::hash(tag.as_bytes()),
            output_index: 0,
            asset_type: AssetType::Normal,
        }
    }

    #[test]
    fn asset_id_depends_on_every_genesis_field() {
        let base = test_genesis("asset");
        let id = base.asset_id();

        let mut tagged = base.clone();
        tagged.tag = "other".into();
        assert_ne!(tagged.asset_id(), id);

        let mut indexed = base.clone();
        indexed.output_index = 1;
        assert_ne!(indexed.asset_id(), id);

        let mut typed = base;
        typed.asset_type = AssetType::Collectible;
        assert_ne!(typed.asset_id(), id);
    }

    #[test]
    fn commitment_keys() {
        let genesis = test_genesis("asset");
        let asset =
            Asset::new_genesis(genesis.clone(), 100, test_script_key(1), None).unwrap();

        assert_eq!(
            asset.asset_commitment_key(),
            sha256::Hash::hash(&asset.script_key.x_only().serialize()).to_byte_array(),
        );
        // Ungrouped assets bucket under the asset id.
        assert_eq!(asset.tap_commitment_key(), genesis.asset_id().to_byte_array());
    }

    #[test]
    fn grouped_asset_buckets_under_group_key() {
        let genesis = test_genesis("grouped");
        let raw = test_script_key(2).pub_key;
        let group_pub_key = GroupKey::derive(raw, &genesis).unwrap();
        let group = GroupKey {
            raw_key: raw,
            group_pub_key,
            witness: bitcoin::Witness::new(),
        };

        let asset = Asset::new_genesis(genesis, 5, test_script_key(3), Some(group.clone()))
            .unwrap();
        assert_eq!(
            asset.tap_commitment_key(),
            sha256::Hash::hash(&group.x_only_bytes()).to_byte_array(),
        );
    }

    #[test]
    fn genesis_asset_detection() {
        let mut asset =
            Asset::new_genesis(test_genesis("g"), 10, test_script_key(4), None).unwrap();
        assert!(asset.is_genesis_asset());

        asset.prev_witnesses = vec![Witness {
            prev_id: Some(PrevId {
                out_point: OutPoint::null(),
                asset_id: asset.id(),
                script_key: asset.script_key.serialize(),
            }),
            tx_witness: bitcoin::Witness::new(),
            split_commitment: None,
        }];
        assert!(!asset.is_genesis_asset());
    }

    #[test]
    fn collectible_amount_enforced() {
        let mut genesis = test_genesis("nft");
        genesis.asset_type = AssetType::Collectible;
        assert!(Asset::new_genesis(genesis.clone(), 2, test_script_key(5), None).is_err());
        assert!(Asset::new_genesis(genesis, 1, test_script_key(5), None).is_ok());
    }

    #[test]
    fn tlv_round_trip() {
        let mut asset =
            Asset::new_genesis(test_genesis("round"), 1_000, test_script_key(6), None).unwrap();
        asset.lock_time = 144;
        asset.split_commitment_root = Some(taro_mssmt::ComputedNode {
            hash: [7u8; 32],
            sum: 1_000,
        });

        let bytes = asset.to_bytes().unwrap();
        let decoded = Asset::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, asset);
    }

    #[test]
    fn tlv_round_trip_with_transfer_witness() {
        let mut asset =
            Asset::new_genesis(test_genesis("xfer"), 400, test_script_key(7), None).unwrap();
        let mut tx_witness = bitcoin::Witness::new();
        tx_witness.push([0xab; 64]);
        asset.prev_witnesses = vec![Witness {
            prev_id: Some(PrevId {
                out_point: OutPoint::null(),
                asset_id: asset.id(),
                script_key: test_script_key(8).serialize(),
            }),
            tx_witness,
            split_commitment: None,
        }];

        let decoded = Asset::from_bytes(&asset.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, asset);
    }

    #[test]
    fn v1_leaf_omits_witnesses() {
        let mut asset =
            Asset::new_genesis(test_genesis("v1"), 10, test_script_key(9), None).unwrap();
        let v0_leaf = asset.leaf().unwrap();

        asset.version = AssetVersion::V1;
        let v1_leaf = asset.leaf().unwrap();

        assert_eq!(v0_leaf.sum, v1_leaf.sum);
        assert_ne!(v0_leaf.value, v1_leaf.value);
    }

    #[test]
    fn unknown_even_type_rejected_odd_skipped() {
        let asset =
            Asset::new_genesis(test_genesis("tlv"), 10, test_script_key(10), None).unwrap();
        let mut bytes = asset.to_bytes().unwrap();

        // Appending an odd record keeps the stream decodable.
        crate::tlv::write_record(&mut bytes, Type(99), b"future").unwrap();
        assert!(Asset::from_bytes(&bytes).is_ok());

        // An even record does not.
        crate::tlv::write_record(&mut bytes, Type(98), b"future").unwrap();
        assert!(matches!(
            Asset::from_bytes(&bytes),
            Err(AssetError::UnknownTlvType(98))
        ));
    }
}
