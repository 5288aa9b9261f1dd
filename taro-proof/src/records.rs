use std::io::{Read, Write};

use bitcoin::block::Header;
use bitcoin::consensus::Encodable;
use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::secp256k1::PublicKey;
use bitcoin::{OutPoint, Transaction, Witness};
use serde::{Deserialize, Serialize};
use taro_asset::tlv::{self, Stream, Type};
use taro_asset::Asset;
use taro_commitment::TapscriptPreimage;

use crate::tx::TxMerkleProof;
use crate::{ProofError, TRANSITION_VERSION};

/// Magic bytes prefixing a single encoded proof ("TAPP").
pub const PROOF_MAGIC_BYTES: [u8; 4] = [0x54, 0x41, 0x50, 0x50];

/// Maximum number of taproot proofs within one record list.
const MAX_NUM_TAPROOT_PROOFS: u64 = 1_000_000 / 43;
/// Maximum encoded size of one taproot proof.
const MAX_TAPROOT_PROOF_SIZE_BYTES: u64 = 65_535;

/// The encoding of asset meta data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MetaType {
    /// Opaque bytes.
    Opaque = 0,
    /// UTF-8 JSON.
    Json = 1,
}

/// The meta data revealed alongside a genesis proof, preimage of the
/// genesis meta hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaReveal {
    /// The meta data encoding.
    pub meta_type: MetaType,
    /// The raw meta data.
    pub data: Vec<u8>,
}

impl MetaReveal {
    /// The digest the genesis record commits to:
    /// `SHA256(meta_type || data)`.
    pub fn meta_hash(&self) -> sha256::Hash {
        let mut engine = sha256::Hash::engine();
        engine.input(&[self.meta_type as u8]);
        engine.input(&self.data);
        sha256::Hash::from_engine(engine)
    }
}

/// Proof of the contents of a taproot output without a Taro commitment:
/// either a BIP-86 keyspend, or a tapscript tree revealed through one or
/// two preimages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapscriptProof {
    /// Preimage at depth 0 or 1.
    pub tap_preimage1: Option<TapscriptPreimage>,
    /// Pair preimage for `tap_preimage1` at depth 1.
    pub tap_preimage2: Option<TapscriptPreimage>,
    /// True for a plain BIP-86 output with no script tree at all.
    pub bip86: bool,
}

/// Commitment proof for one anchor output: the two-level MS-SMT proof plus
/// the optional tapscript sibling needed to rebuild the tapscript root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentProof {
    /// The two-level commitment proof.
    pub proof: taro_commitment::Proof,
    /// Sibling preimage hashed with the commitment leaf, if any.
    pub tap_sibling_preimage: Option<TapscriptPreimage>,
}

/// Proof about one taproot output of the anchor transaction: either that it
/// commits (or does not commit) to an asset, or that it carries no Taro
/// commitment at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaprootProof {
    /// The output index the proof speaks about.
    pub output_index: u32,
    /// The internal key of that output.
    pub internal_key: PublicKey,
    /// Commitment (non-)inclusion proof, when the output carries a Taro
    /// commitment.
    pub commitment_proof: Option<CommitmentProof>,
    /// Tapscript proof, when the output provably carries none.
    pub tapscript_proof: Option<TapscriptProof>,
}

/// One link of a proof file: a full state transition anchored in a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    /// Proof format version.
    pub version: u32,
    /// The outpoint the transition spends; the first on-chain input.
    pub prev_out: OutPoint,
    /// Header of the block confirming the anchor transaction.
    pub block_header: Header,
    /// Height of that block.
    pub block_height: u32,
    /// The anchor transaction performing the transition.
    pub anchor_tx: Transaction,
    /// Merkle proof binding the anchor transaction to the block header.
    pub tx_merkle_proof: TxMerkleProof,
    /// The asset as it exists after the transition.
    pub asset: Asset,
    /// Inclusion proof of the new asset within the anchor transaction.
    pub inclusion_proof: TaprootProof,
    /// Exclusion proofs for every other taproot output.
    pub exclusion_proofs: Vec<TaprootProof>,
    /// Inclusion proof for the split root asset, when this asset resulted
    /// from a split.
    pub split_root_proof: Option<TaprootProof>,
    /// Meta data reveal, only for genesis proofs.
    pub meta_reveal: Option<MetaReveal>,
    /// Virtual-transaction witness proving asset ownership, for challenge
    /// proofs only.
    pub challenge_witness: Option<Witness>,
}

// Proof TLV types.
const PROOF_VERSION_TYPE: Type = Type(0);
const PROOF_PREV_OUT_TYPE: Type = Type(2);
const PROOF_BLOCK_HEADER_TYPE: Type = Type(4);
const PROOF_ANCHOR_TX_TYPE: Type = Type(6);
const PROOF_TX_MERKLE_PROOF_TYPE: Type = Type(8);
const PROOF_ASSET_LEAF_TYPE: Type = Type(10);
const PROOF_INCLUSION_PROOF_TYPE: Type = Type(12);
const PROOF_EXCLUSION_PROOFS_TYPE: Type = Type(13);
const PROOF_SPLIT_ROOT_PROOF_TYPE: Type = Type(15);
const PROOF_META_REVEAL_TYPE: Type = Type(17);
const PROOF_CHALLENGE_WITNESS_TYPE: Type = Type(21);
const PROOF_BLOCK_HEIGHT_TYPE: Type = Type(22);

// TaprootProof TLV types.
const TAPROOT_PROOF_OUTPUT_INDEX_TYPE: Type = Type(0);
const TAPROOT_PROOF_INTERNAL_KEY_TYPE: Type = Type(2);
const TAPROOT_PROOF_COMMITMENT_PROOF_TYPE: Type = Type(3);
const TAPROOT_PROOF_TAPSCRIPT_PROOF_TYPE: Type = Type(5);

// CommitmentProof TLV types.
const COMMITMENT_PROOF_PROOF_TYPE: Type = Type(0);
const COMMITMENT_PROOF_SIBLING_TYPE: Type = Type(5);

// TapscriptProof TLV types.
const TAPSCRIPT_PROOF_PREIMAGE1_TYPE: Type = Type(1);
const TAPSCRIPT_PROOF_PREIMAGE2_TYPE: Type = Type(3);
const TAPSCRIPT_PROOF_BIP86_TYPE: Type = Type(4);

// MetaReveal TLV types.
const META_REVEAL_ENCODING_TYPE: Type = Type(0);
const META_REVEAL_DATA_TYPE: Type = Type(2);

fn io_err(e: impl std::fmt::Display) -> ProofError {
    ProofError::InvalidProof(e.to_string())
}

impl TapscriptProof {
    fn encode<W: Write>(&self, w: &mut W) -> Result<(), ProofError> {
        if let Some(preimage) = &self.tap_preimage1 {
            let mut bytes = Vec::new();
            preimage.encode(&mut bytes)?;
            tlv::write_record(w, TAPSCRIPT_PROOF_PREIMAGE1_TYPE, &bytes).map_err(io_err)?;
        }
        if let Some(preimage) = &self.tap_preimage2 {
            let mut bytes = Vec::new();
            preimage.encode(&mut bytes)?;
            tlv::write_record(w, TAPSCRIPT_PROOF_PREIMAGE2_TYPE, &bytes).map_err(io_err)?;
        }
        tlv::write_record(w, TAPSCRIPT_PROOF_BIP86_TYPE, &[self.bip86 as u8]).map_err(io_err)?;
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<Self, ProofError> {
        let mut stream = Stream::new(bytes);
        let mut tap_preimage1 = None;
        let mut tap_preimage2 = None;
        let mut bip86 = None;

        while let Some(record) = stream.next_record().map_err(io_err)? {
            match record.tlv_type() {
                TAPSCRIPT_PROOF_PREIMAGE1_TYPE => {
                    tap_preimage1 = Some(TapscriptPreimage::decode(record.value())?);
                }
                TAPSCRIPT_PROOF_PREIMAGE2_TYPE => {
                    tap_preimage2 = Some(TapscriptPreimage::decode(record.value())?);
                }
                TAPSCRIPT_PROOF_BIP86_TYPE => {
                    if record.value().len() != 1 {
                        return Err(ProofError::InvalidProof("bip86 flag must be 1 byte".into()));
                    }
                    bip86 = Some(record.value()[0] != 0);
                }
                other if other.is_odd() => {}
                other => {
                    return Err(ProofError::InvalidProof(format!(
                        "unknown even tlv type {}",
                        other.0
                    )))
                }
            }
        }

        Ok(TapscriptProof {
            tap_preimage1,
            tap_preimage2,
            bip86: bip86
                .ok_or_else(|| ProofError::InvalidProof("missing bip86 flag".into()))?,
        })
    }
}

impl CommitmentProof {
    fn encode<W: Write>(&self, w: &mut W) -> Result<(), ProofError> {
        let mut bytes = Vec::new();
        self.proof.encode(&mut bytes)?;
        tlv::write_record(w, COMMITMENT_PROOF_PROOF_TYPE, &bytes).map_err(io_err)?;

        if let Some(preimage) = &self.tap_sibling_preimage {
            let mut bytes = Vec::new();
            preimage.encode(&mut bytes)?;
            tlv::write_record(w, COMMITMENT_PROOF_SIBLING_TYPE, &bytes).map_err(io_err)?;
        }
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<Self, ProofError> {
        let mut stream = Stream::new(bytes);
        let mut proof = None;
        let mut tap_sibling_preimage = None;

        while let Some(record) = stream.next_record().map_err(io_err)? {
            match record.tlv_type() {
                COMMITMENT_PROOF_PROOF_TYPE => {
                    proof = Some(taro_commitment::Proof::decode(record.value())?);
                }
                COMMITMENT_PROOF_SIBLING_TYPE => {
                    tap_sibling_preimage = Some(TapscriptPreimage::decode(record.value())?);
                }
                other if other.is_odd() => {}
                other => {
                    return Err(ProofError::InvalidProof(format!(
                        "unknown even tlv type {}",
                        other.0
                    )))
                }
            }
        }

        Ok(CommitmentProof {
            proof: proof
                .ok_or_else(|| ProofError::InvalidProof("missing commitment proof".into()))?,
            tap_sibling_preimage,
        })
    }
}

impl TaprootProof {
    /// Encodes the taproot proof as a TLV stream.
    pub fn encode<W: Write>(&self, w: &mut W) -> Result<(), ProofError> {
        tlv::write_record(
            w,
            TAPROOT_PROOF_OUTPUT_INDEX_TYPE,
            &self.output_index.to_be_bytes(),
        )
        .map_err(io_err)?;
        tlv::write_record(w, TAPROOT_PROOF_INTERNAL_KEY_TYPE, &self.internal_key.serialize())
            .map_err(io_err)?;

        if let Some(commitment_proof) = &self.commitment_proof {
            let mut bytes = Vec::new();
            commitment_proof.encode(&mut bytes)?;
            tlv::write_record(w, TAPROOT_PROOF_COMMITMENT_PROOF_TYPE, &bytes).map_err(io_err)?;
        }
        if let Some(tapscript_proof) = &self.tapscript_proof {
            let mut bytes = Vec::new();
            tapscript_proof.encode(&mut bytes)?;
            tlv::write_record(w, TAPROOT_PROOF_TAPSCRIPT_PROOF_TYPE, &bytes).map_err(io_err)?;
        }
        Ok(())
    }

    /// Decodes a taproot proof from raw TLV bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProofError> {
        let mut stream = Stream::new(bytes);
        let mut output_index = None;
        let mut internal_key = None;
        let mut commitment_proof = None;
        let mut tapscript_proof = None;

        while let Some(record) = stream.next_record().map_err(io_err)? {
            match record.tlv_type() {
                TAPROOT_PROOF_OUTPUT_INDEX_TYPE => {
                    let value = record.value();
                    if value.len() != 4 {
                        return Err(ProofError::InvalidProof(
                            "output index must be 4 bytes".into(),
                        ));
                    }
                    output_index =
                        Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]));
                }
                TAPROOT_PROOF_INTERNAL_KEY_TYPE => {
                    internal_key = Some(
                        PublicKey::from_slice(record.value())
                            .map_err(|e| ProofError::InvalidProof(e.to_string()))?,
                    );
                }
                TAPROOT_PROOF_COMMITMENT_PROOF_TYPE => {
                    commitment_proof = Some(CommitmentProof::decode(record.value())?);
                }
                TAPROOT_PROOF_TAPSCRIPT_PROOF_TYPE => {
                    tapscript_proof = Some(TapscriptProof::decode(record.value())?);
                }
                other if other.is_odd() => {}
                other => {
                    return Err(ProofError::InvalidProof(format!(
                        "unknown even tlv type {}",
                        other.0
                    )))
                }
            }
        }

        Ok(TaprootProof {
            output_index: output_index
                .ok_or_else(|| ProofError::InvalidProof("missing output index".into()))?,
            internal_key: internal_key
                .ok_or_else(|| ProofError::InvalidProof("missing internal key".into()))?,
            commitment_proof,
            tapscript_proof,
        })
    }
}

fn encode_meta_reveal<W: Write>(w: &mut W, meta: &MetaReveal) -> Result<(), ProofError> {
    tlv::write_record(w, META_REVEAL_ENCODING_TYPE, &[meta.meta_type as u8]).map_err(io_err)?;
    tlv::write_record(w, META_REVEAL_DATA_TYPE, &meta.data).map_err(io_err)?;
    Ok(())
}

fn decode_meta_reveal(bytes: &[u8]) -> Result<MetaReveal, ProofError> {
    let mut stream = Stream::new(bytes);
    let mut meta_type = None;
    let mut data = None;

    while let Some(record) = stream.next_record().map_err(io_err)? {
        match record.tlv_type() {
            META_REVEAL_ENCODING_TYPE => {
                if record.value().len() != 1 {
                    return Err(ProofError::InvalidProof("meta type must be 1 byte".into()));
                }
                meta_type = Some(match record.value()[0] {
                    0 => MetaType::Opaque,
                    1 => MetaType::Json,
                    other => {
                        return Err(ProofError::InvalidProof(format!(
                            "unknown meta type {other}"
                        )))
                    }
                });
            }
            META_REVEAL_DATA_TYPE => data = Some(record.value().to_vec()),
            other if other.is_odd() => {}
            other => {
                return Err(ProofError::InvalidProof(format!(
                    "unknown even tlv type {}",
                    other.0
                )))
            }
        }
    }

    Ok(MetaReveal {
        meta_type: meta_type
            .ok_or_else(|| ProofError::InvalidProof("missing meta type".into()))?,
        data: data.ok_or_else(|| ProofError::InvalidProof("missing meta data".into()))?,
    })
}

impl Proof {
    /// Creates a proof shell with the transition version.
    pub fn new_transition(
        prev_out: OutPoint,
        block_header: Header,
        block_height: u32,
        anchor_tx: Transaction,
        tx_merkle_proof: TxMerkleProof,
        asset: Asset,
        inclusion_proof: TaprootProof,
    ) -> Self {
        Proof {
            version: TRANSITION_VERSION,
            prev_out,
            block_header,
            block_height,
            anchor_tx,
            tx_merkle_proof,
            asset,
            inclusion_proof,
            exclusion_proofs: Vec::new(),
            split_root_proof: None,
            meta_reveal: None,
            challenge_witness: None,
        }
    }

    /// The anchor outpoint this proof's asset now resides at.
    pub fn out_point(&self) -> OutPoint {
        OutPoint {
            txid: self.anchor_tx.compute_txid(),
            vout: self.inclusion_proof.output_index,
        }
    }

    /// Encodes the proof, prefixed with the proof magic.
    pub fn encode<W: Write>(&self, w: &mut W) -> Result<(), ProofError> {
        w.write_all(&PROOF_MAGIC_BYTES).map_err(io_err)?;

        tlv::write_record(w, PROOF_VERSION_TYPE, &self.version.to_be_bytes()).map_err(io_err)?;

        let mut prev_out = Vec::with_capacity(36);
        self.prev_out.consensus_encode(&mut prev_out).map_err(io_err)?;
        tlv::write_record(w, PROOF_PREV_OUT_TYPE, &prev_out).map_err(io_err)?;

        let mut header = Vec::with_capacity(80);
        self.block_header.consensus_encode(&mut header).map_err(io_err)?;
        tlv::write_record(w, PROOF_BLOCK_HEADER_TYPE, &header).map_err(io_err)?;

        let mut tx_bytes = Vec::new();
        self.anchor_tx.consensus_encode(&mut tx_bytes).map_err(io_err)?;
        tlv::write_record(w, PROOF_ANCHOR_TX_TYPE, &tx_bytes).map_err(io_err)?;

        let mut merkle = Vec::new();
        self.tx_merkle_proof.encode(&mut merkle)?;
        tlv::write_record(w, PROOF_TX_MERKLE_PROOF_TYPE, &merkle).map_err(io_err)?;

        let mut asset_bytes = Vec::new();
        self.asset.encode(&mut asset_bytes)?;
        tlv::write_record(w, PROOF_ASSET_LEAF_TYPE, &asset_bytes).map_err(io_err)?;

        let mut inclusion = Vec::new();
        self.inclusion_proof.encode(&mut inclusion)?;
        tlv::write_record(w, PROOF_INCLUSION_PROOF_TYPE, &inclusion).map_err(io_err)?;

        if !self.exclusion_proofs.is_empty() {
            let mut list = Vec::new();
            tlv::write_varint(&mut list, self.exclusion_proofs.len() as u64).map_err(io_err)?;
            for proof in &self.exclusion_proofs {
                let mut bytes = Vec::new();
                proof.encode(&mut bytes)?;
                tlv::write_var_bytes(&mut list, &bytes).map_err(io_err)?;
            }
            tlv::write_record(w, PROOF_EXCLUSION_PROOFS_TYPE, &list).map_err(io_err)?;
        }

        if let Some(split_root_proof) = &self.split_root_proof {
            let mut bytes = Vec::new();
            split_root_proof.encode(&mut bytes)?;
            tlv::write_record(w, PROOF_SPLIT_ROOT_PROOF_TYPE, &bytes).map_err(io_err)?;
        }

        if let Some(meta_reveal) = &self.meta_reveal {
            let mut bytes = Vec::new();
            encode_meta_reveal(&mut bytes, meta_reveal)?;
            tlv::write_record(w, PROOF_META_REVEAL_TYPE, &bytes).map_err(io_err)?;
        }

        if let Some(challenge_witness) = &self.challenge_witness {
            let mut bytes = Vec::new();
            challenge_witness.consensus_encode(&mut bytes).map_err(io_err)?;
            tlv::write_record(w, PROOF_CHALLENGE_WITNESS_TYPE, &bytes).map_err(io_err)?;
        }

        tlv::write_record(w, PROOF_BLOCK_HEIGHT_TYPE, &self.block_height.to_be_bytes())
            .map_err(io_err)?;

        Ok(())
    }

    /// Encodes the proof into a fresh byte vector.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProofError> {
        let mut bytes = Vec::new();
        self.encode(&mut bytes)?;
        Ok(bytes)
    }

    /// Decodes a proof from bytes, checking the magic prefix.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProofError> {
        let mut reader = bytes;
        Self::decode(&mut reader)
    }

    /// Decodes a proof from a reader, checking the magic prefix.
    pub fn decode<R: Read>(r: &mut R) -> Result<Self, ProofError> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic).map_err(io_err)?;
        if magic != PROOF_MAGIC_BYTES {
            return Err(ProofError::InvalidProof(format!(
                "bad proof magic {magic:02x?}"
            )));
        }

        let mut stream = Stream::new(r);
        let mut version = None;
        let mut prev_out = None;
        let mut block_header = None;
        let mut block_height = None;
        let mut anchor_tx = None;
        let mut tx_merkle_proof = None;
        let mut asset = None;
        let mut inclusion_proof = None;
        let mut exclusion_proofs = Vec::new();
        let mut split_root_proof = None;
        let mut meta_reveal = None;
        let mut challenge_witness = None;

        while let Some(record) = stream.next_record().map_err(io_err)? {
            match record.tlv_type() {
                PROOF_VERSION_TYPE => {
                    let value = record.value();
                    if value.len() != 4 {
                        return Err(ProofError::InvalidProof("version must be 4 bytes".into()));
                    }
                    version = Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]));
                }
                PROOF_PREV_OUT_TYPE => {
                    prev_out = Some(
                        bitcoin::consensus::encode::deserialize(record.value())
                            .map_err(io_err)?,
                    );
                }
                PROOF_BLOCK_HEADER_TYPE => {
                    block_header = Some(
                        bitcoin::consensus::encode::deserialize(record.value())
                            .map_err(io_err)?,
                    );
                }
                PROOF_BLOCK_HEIGHT_TYPE => {
                    let value = record.value();
                    if value.len() != 4 {
                        return Err(ProofError::InvalidProof(
                            "block height must be 4 bytes".into(),
                        ));
                    }
                    block_height =
                        Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]));
                }
                PROOF_ANCHOR_TX_TYPE => {
                    anchor_tx = Some(
                        bitcoin::consensus::encode::deserialize(record.value())
                            .map_err(io_err)?,
                    );
                }
                PROOF_TX_MERKLE_PROOF_TYPE => {
                    tx_merkle_proof = Some(TxMerkleProof::decode(&mut record.value_reader())?);
                }
                PROOF_ASSET_LEAF_TYPE => {
                    asset = Some(Asset::decode(record.value())?);
                }
                PROOF_INCLUSION_PROOF_TYPE => {
                    inclusion_proof = Some(TaprootProof::decode(record.value())?);
                }
                PROOF_EXCLUSION_PROOFS_TYPE => {
                    let mut reader = record.value_reader();
                    let count = tlv::read_varint(&mut reader).map_err(io_err)?;
                    if count > MAX_NUM_TAPROOT_PROOFS {
                        return Err(ProofError::InvalidProof(format!(
                            "too many exclusion proofs: {count}"
                        )));
                    }
                    for _ in 0..count {
                        let bytes =
                            tlv::read_var_bytes(&mut reader, MAX_TAPROOT_PROOF_SIZE_BYTES)
                                .map_err(io_err)?;
                        exclusion_proofs.push(TaprootProof::decode(&bytes)?);
                    }
                }
                PROOF_SPLIT_ROOT_PROOF_TYPE => {
                    split_root_proof = Some(TaprootProof::decode(record.value())?);
                }
                PROOF_META_REVEAL_TYPE => {
                    meta_reveal = Some(decode_meta_reveal(record.value())?);
                }
                PROOF_CHALLENGE_WITNESS_TYPE => {
                    challenge_witness = Some(
                        bitcoin::consensus::encode::deserialize(record.value())
                            .map_err(io_err)?,
                    );
                }
                other if other.is_odd() => {}
                other => {
                    return Err(ProofError::InvalidProof(format!(
                        "unknown even tlv type {}",
                        other.0
                    )))
                }
            }
        }

        Ok(Proof {
            version: version
                .ok_or_else(|| ProofError::InvalidProof("missing version".into()))?,
            prev_out: prev_out
                .ok_or_else(|| ProofError::InvalidProof("missing prev out".into()))?,
            block_header: block_header
                .ok_or_else(|| ProofError::InvalidProof("missing block header".into()))?,
            block_height: block_height
                .ok_or_else(|| ProofError::InvalidProof("missing block height".into()))?,
            anchor_tx: anchor_tx
                .ok_or_else(|| ProofError::InvalidProof("missing anchor tx".into()))?,
            tx_merkle_proof: tx_merkle_proof
                .ok_or_else(|| ProofError::InvalidProof("missing merkle proof".into()))?,
            asset: asset.ok_or_else(|| ProofError::InvalidProof("missing asset".into()))?,
            inclusion_proof: inclusion_proof
                .ok_or_else(|| ProofError::InvalidProof("missing inclusion proof".into()))?,
            exclusion_proofs,
            split_root_proof,
            meta_reveal,
            challenge_witness,
        })
    }
}
