use std::io::{Read, Write};

use bitcoin::hashes::Hash as _;
use bitcoin::taproot::TapNodeHash;
use bitcoin::ScriptBuf;
use serde::{Deserialize, Serialize};
use taro_asset::tlv::{self, Stream, Type};
use taro_asset::{Asset, AssetVersion, TapLeaf};
use taro_mssmt::Leaf;

use crate::tap_commitment::{is_taro_commitment_script, TapCommitmentRoot};
use crate::CommitmentError;

/// Type of a tapscript sibling preimage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TapscriptPreimageType {
    /// The preimage is a leaf script.
    Leaf = 0,
    /// The preimage is a branch: two 32-byte child hashes.
    Branch = 1,
}

/// A tapscript sibling preimage: the data hashed together with the Taro
/// commitment leaf to arrive at the anchor output's tapscript root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapscriptPreimage {
    /// The preimage bytes: a script, or 64 bytes of child hashes.
    pub sibling_preimage: Vec<u8>,
    /// How to interpret the preimage.
    pub sibling_type: TapscriptPreimageType,
}

impl TapscriptPreimage {
    /// Wraps a leaf script as a sibling preimage. The script must not
    /// itself be a Taro commitment, which would allow committing to the
    /// same asset twice.
    pub fn from_leaf_script(script: ScriptBuf) -> Result<Self, CommitmentError> {
        if is_taro_commitment_script(script.as_bytes()) {
            return Err(CommitmentError::SiblingIsTaroCommitment);
        }
        Ok(TapscriptPreimage {
            sibling_preimage: script.into_bytes(),
            sibling_type: TapscriptPreimageType::Leaf,
        })
    }

    /// Wraps two child node hashes as a branch preimage.
    pub fn from_branch(left: TapNodeHash, right: TapNodeHash) -> Self {
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(left.as_ref());
        bytes.extend_from_slice(right.as_ref());
        TapscriptPreimage {
            sibling_preimage: bytes,
            sibling_type: TapscriptPreimageType::Branch,
        }
    }

    /// Computes the tap hash the preimage stands for.
    pub fn to_tap_hash(&self) -> Result<TapNodeHash, CommitmentError> {
        match self.sibling_type {
            TapscriptPreimageType::Leaf => {
                if self.sibling_preimage.is_empty() {
                    return Err(CommitmentError::InvalidTapscriptPreimage(
                        "empty leaf preimage".into(),
                    ));
                }
                if is_taro_commitment_script(&self.sibling_preimage) {
                    return Err(CommitmentError::SiblingIsTaroCommitment);
                }
                let leaf = TapLeaf::new(ScriptBuf::from_bytes(self.sibling_preimage.clone()));
                Ok(leaf.leaf_hash())
            }
            TapscriptPreimageType::Branch => {
                if self.sibling_preimage.len() != 64 {
                    return Err(CommitmentError::InvalidTapscriptPreimage(format!(
                        "branch preimage must be 64 bytes, got {}",
                        self.sibling_preimage.len()
                    )));
                }
                let mut left = [0u8; 32];
                left.copy_from_slice(&self.sibling_preimage[..32]);
                let mut right = [0u8; 32];
                right.copy_from_slice(&self.sibling_preimage[32..]);
                Ok(TapNodeHash::from_node_hashes(
                    TapNodeHash::from_byte_array(left),
                    TapNodeHash::from_byte_array(right),
                ))
            }
        }
    }

    /// Encodes the preimage: one type byte followed by the raw bytes.
    pub fn encode<W: Write>(&self, w: &mut W) -> Result<(), CommitmentError> {
        w.write_all(&[self.sibling_type as u8])
            .map_err(|e| CommitmentError::InvalidProof(e.to_string()))?;
        w.write_all(&self.sibling_preimage)
            .map_err(|e| CommitmentError::InvalidProof(e.to_string()))?;
        Ok(())
    }

    /// Decodes a preimage from raw bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, CommitmentError> {
        let (&type_byte, preimage) = bytes
            .split_first()
            .ok_or_else(|| CommitmentError::InvalidProof("empty preimage record".into()))?;
        let sibling_type = match type_byte {
            0 => TapscriptPreimageType::Leaf,
            1 => TapscriptPreimageType::Branch,
            other => {
                return Err(CommitmentError::InvalidProof(format!(
                    "unknown preimage type {other}"
                )))
            }
        };

        if sibling_type == TapscriptPreimageType::Branch && preimage.len() != 64 {
            return Err(CommitmentError::InvalidTapscriptPreimage(format!(
                "branch preimage must be 64 bytes, got {}",
                preimage.len()
            )));
        }

        Ok(TapscriptPreimage {
            sibling_preimage: preimage.to_vec(),
            sibling_type,
        })
    }
}

/// Proof locating an asset leaf inside its inner asset commitment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetProof {
    /// The inner MS-SMT proof.
    pub proof: taro_mssmt::Proof,
    /// The maximum version of the committed assets.
    pub version: AssetVersion,
    /// The Taro commitment key of the inner commitment.
    pub tap_key: [u8; 32],
}

/// Proof locating an inner commitment's summary leaf inside the outer Taro
/// tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaprootAssetProof {
    /// The outer MS-SMT proof.
    pub proof: taro_mssmt::Proof,
    /// The Taro commitment version.
    pub version: AssetVersion,
}

/// A full two-level commitment (non-)inclusion proof for one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    /// Inner proof; absent when the inner commitment itself is not part of
    /// the outer tree.
    pub asset_proof: Option<AssetProof>,
    /// Outer proof; always present.
    pub taproot_asset_proof: TaprootAssetProof,
}

impl Proof {
    /// Derives the Taro commitment root implied by including `asset` under
    /// this proof.
    pub fn derive_by_asset_inclusion(
        &self,
        asset: &Asset,
    ) -> Result<TapCommitmentRoot, CommitmentError> {
        let asset_proof = self
            .asset_proof
            .as_ref()
            .ok_or(CommitmentError::MissingAssetCommitment)?;

        let leaf = asset.leaf()?;
        let inner_root = asset_proof
            .proof
            .root(&asset.asset_commitment_key(), &leaf)?;

        let outer_leaf = inner_leaf(asset_proof.version, inner_root);
        let outer_root = self
            .taproot_asset_proof
            .proof
            .root(&asset_proof.tap_key, &outer_leaf)?;

        Ok(TapCommitmentRoot::new(
            self.taproot_asset_proof.version,
            outer_root,
        ))
    }

    /// Derives the Taro commitment root implied by this proof excluding the
    /// asset addressed by the two commitment keys.
    pub fn derive_by_asset_exclusion(
        &self,
        asset_commitment_key: [u8; 32],
        tap_commitment_key: [u8; 32],
    ) -> Result<TapCommitmentRoot, CommitmentError> {
        let outer_root = match &self.asset_proof {
            // The inner commitment exists but does not contain the asset.
            Some(asset_proof) => {
                let inner_root = asset_proof
                    .proof
                    .root(&asset_commitment_key, &Leaf::empty())?;
                let outer_leaf = inner_leaf(asset_proof.version, inner_root);
                self.taproot_asset_proof
                    .proof
                    .root(&asset_proof.tap_key, &outer_leaf)?
            }
            // The inner commitment is absent from the outer tree entirely.
            None => self
                .taproot_asset_proof
                .proof
                .root(&tap_commitment_key, &Leaf::empty())?,
        };

        Ok(TapCommitmentRoot::new(
            self.taproot_asset_proof.version,
            outer_root,
        ))
    }

    /// Encodes the proof as a TLV stream.
    pub fn encode<W: Write>(&self, w: &mut W) -> Result<(), CommitmentError> {
        if let Some(asset_proof) = &self.asset_proof {
            let mut bytes = Vec::new();
            tlv::write_record(&mut bytes, ASSET_PROOF_VERSION_TYPE, &[asset_proof.version as u8])
                .map_err(CommitmentError::Asset)?;
            tlv::write_record(&mut bytes, ASSET_PROOF_TAP_KEY_TYPE, &asset_proof.tap_key)
                .map_err(CommitmentError::Asset)?;
            let mut proof_bytes = Vec::new();
            asset_proof.proof.compress().encode(&mut proof_bytes)?;
            tlv::write_record(&mut bytes, ASSET_PROOF_MSSMT_TYPE, &proof_bytes)
                .map_err(CommitmentError::Asset)?;
            tlv::write_record(w, PROOF_ASSET_PROOF_TYPE, &bytes).map_err(CommitmentError::Asset)?;
        }

        let mut bytes = Vec::new();
        tlv::write_record(
            &mut bytes,
            TAPROOT_ASSET_PROOF_VERSION_TYPE,
            &[self.taproot_asset_proof.version as u8],
        )
        .map_err(CommitmentError::Asset)?;
        let mut proof_bytes = Vec::new();
        self.taproot_asset_proof
            .proof
            .compress()
            .encode(&mut proof_bytes)?;
        tlv::write_record(&mut bytes, TAPROOT_ASSET_PROOF_MSSMT_TYPE, &proof_bytes)
            .map_err(CommitmentError::Asset)?;
        tlv::write_record(w, PROOF_TAPROOT_ASSET_PROOF_TYPE, &bytes)
            .map_err(CommitmentError::Asset)?;

        Ok(())
    }

    /// Decodes a proof from a TLV stream.
    pub fn decode<R: Read>(r: R) -> Result<Self, CommitmentError> {
        let mut stream = Stream::new(r);
        let mut asset_proof = None;
        let mut taproot_asset_proof = None;

        while let Some(record) = stream.next_record().map_err(CommitmentError::Asset)? {
            match record.tlv_type() {
                PROOF_ASSET_PROOF_TYPE => {
                    asset_proof = Some(decode_asset_proof(record.value())?);
                }
                PROOF_TAPROOT_ASSET_PROOF_TYPE => {
                    taproot_asset_proof = Some(decode_taproot_asset_proof(record.value())?);
                }
                other if other.is_odd() => {}
                other => {
                    return Err(CommitmentError::InvalidProof(format!(
                        "unknown even tlv type {}",
                        other.0
                    )))
                }
            }
        }

        Ok(Proof {
            asset_proof,
            taproot_asset_proof: taproot_asset_proof.ok_or_else(|| {
                CommitmentError::InvalidProof("missing taproot asset proof".into())
            })?,
        })
    }
}

/// Rebuilds the outer-tree leaf for an inner commitment root.
fn inner_leaf(version: AssetVersion, root: taro_mssmt::ComputedNode) -> Leaf {
    let mut value = Vec::with_capacity(1 + 32 + 8);
    value.push(version as u8);
    value.extend_from_slice(&root.hash);
    value.extend_from_slice(&root.sum.to_be_bytes());
    Leaf::new(value, root.sum)
}

// commitment::Proof TLV types.
const PROOF_ASSET_PROOF_TYPE: Type = Type(0);
const PROOF_TAPROOT_ASSET_PROOF_TYPE: Type = Type(2);

// AssetProof TLV types.
const ASSET_PROOF_VERSION_TYPE: Type = Type(0);
const ASSET_PROOF_TAP_KEY_TYPE: Type = Type(2);
const ASSET_PROOF_MSSMT_TYPE: Type = Type(4);

// TaprootAssetProof TLV types.
const TAPROOT_ASSET_PROOF_VERSION_TYPE: Type = Type(0);
const TAPROOT_ASSET_PROOF_MSSMT_TYPE: Type = Type(2);

fn decode_mssmt_proof(bytes: &[u8]) -> Result<taro_mssmt::Proof, CommitmentError> {
    let compressed = taro_mssmt::CompressedProof::decode(&mut &bytes[..])?;
    Ok(compressed.decompress()?)
}

fn decode_asset_proof(bytes: &[u8]) -> Result<AssetProof, CommitmentError> {
    let mut stream = Stream::new(bytes);
    let mut version = None;
    let mut tap_key = None;
    let mut proof = None;

    while let Some(record) = stream.next_record().map_err(CommitmentError::Asset)? {
        match record.tlv_type() {
            ASSET_PROOF_VERSION_TYPE => {
                let value = record.value();
                if value.len() != 1 {
                    return Err(CommitmentError::InvalidProof(
                        "asset proof version must be 1 byte".into(),
                    ));
                }
                version = Some(match value[0] {
                    0 => AssetVersion::V0,
                    1 => AssetVersion::V1,
                    other => {
                        return Err(CommitmentError::InvalidProof(format!(
                            "unknown asset version {other}"
                        )))
                    }
                });
            }
            ASSET_PROOF_TAP_KEY_TYPE => {
                let value = record.value();
                if value.len() != 32 {
                    return Err(CommitmentError::InvalidProof(
                        "tap key must be 32 bytes".into(),
                    ));
                }
                let mut key = [0u8; 32];
                key.copy_from_slice(value);
                tap_key = Some(key);
            }
            ASSET_PROOF_MSSMT_TYPE => {
                proof = Some(decode_mssmt_proof(record.value())?);
            }
            other if other.is_odd() => {}
            other => {
                return Err(CommitmentError::InvalidProof(format!(
                    "unknown even tlv type {}",
                    other.0
                )))
            }
        }
    }

    Ok(AssetProof {
        proof: proof
            .ok_or_else(|| CommitmentError::InvalidProof("missing asset proof nodes".into()))?,
        version: version
            .ok_or_else(|| CommitmentError::InvalidProof("missing asset proof version".into()))?,
        tap_key: tap_key
            .ok_or_else(|| CommitmentError::InvalidProof("missing asset proof tap key".into()))?,
    })
}

fn decode_taproot_asset_proof(bytes: &[u8]) -> Result<TaprootAssetProof, CommitmentError> {
    let mut stream = Stream::new(bytes);
    let mut version = None;
    let mut proof = None;

    while let Some(record) = stream.next_record().map_err(CommitmentError::Asset)? {
        match record.tlv_type() {
            TAPROOT_ASSET_PROOF_VERSION_TYPE => {
                let value = record.value();
                if value.len() != 1 {
                    return Err(CommitmentError::InvalidProof(
                        "taproot asset proof version must be 1 byte".into(),
                    ));
                }
                version = Some(match value[0] {
                    0 => AssetVersion::V0,
                    1 => AssetVersion::V1,
                    other => {
                        return Err(CommitmentError::InvalidProof(format!(
                            "unknown commitment version {other}"
                        )))
                    }
                });
            }
            TAPROOT_ASSET_PROOF_MSSMT_TYPE => {
                proof = Some(decode_mssmt_proof(record.value())?);
            }
            other if other.is_odd() => {}
            other => {
                return Err(CommitmentError::InvalidProof(format!(
                    "unknown even tlv type {}",
                    other.0
                )))
            }
        }
    }

    Ok(TaprootAssetProof {
        proof: proof.ok_or_else(|| {
            CommitmentError::InvalidProof("missing taproot asset proof nodes".into())
        })?,
        version: version.ok_or_else(|| {
            CommitmentError::InvalidProof("missing taproot asset proof version".into())
        })?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TapCommitment;
    use bitcoin::hashes::{sha256, Hash};
    use bitcoin::secp256k1::{Secp256k1, SecretKey};
    use bitcoin::OutPoint;
    use taro_asset::{AssetType, Genesis, ScriptKey};

    fn asset(tag: &str, amount: u64, key: u8) -> Asset {
        let secp = Secp256k1::new();
        let script_key =
            ScriptKey::new(SecretKey::from_slice(&[key; 32]).unwrap().public_key(&secp));
        Asset::new_genesis(
            Genesis {
                first_prev_out: OutPoint::null(),
                tag: tag.into(),
                meta_hash: sha256::Hash::hash(tag.as_bytes()),
                output_index: 0,
                asset_type: AssetType::Normal,
            },
            amount,
            script_key,
            None,
        )
        .unwrap()
    }

    #[test]
    fn inclusion_proof_derives_commitment_root() {
        let a = asset("inc", 100, 1);
        let commitment = TapCommitment::from_assets([a.clone(), asset("other", 5, 2)]).unwrap();

        let (found, proof) = commitment
            .proof(a.tap_commitment_key(), a.asset_commitment_key())
            .unwrap();
        assert_eq!(found.as_ref(), Some(&a));

        let derived = proof.derive_by_asset_inclusion(&a).unwrap();
        assert_eq!(derived.root, commitment.root());
        assert_eq!(derived.tap_leaf(), commitment.tap_leaf());
    }

    #[test]
    fn exclusion_proof_derives_commitment_root() {
        let a = asset("exc", 100, 1);
        let absent = asset("absent", 5, 2);
        let commitment = TapCommitment::from_assets([a]).unwrap();

        let (found, proof) = commitment
            .proof(absent.tap_commitment_key(), absent.asset_commitment_key())
            .unwrap();
        assert!(found.is_none());

        let derived = proof
            .derive_by_asset_exclusion(
                absent.asset_commitment_key(),
                absent.tap_commitment_key(),
            )
            .unwrap();
        assert_eq!(derived.root, commitment.root());
    }

    #[test]
    fn proof_tlv_round_trip() {
        let a = asset("tlv", 9, 1);
        let commitment = TapCommitment::from_assets([a.clone()]).unwrap();
        let (_, proof) = commitment
            .proof(a.tap_commitment_key(), a.asset_commitment_key())
            .unwrap();

        let mut bytes = Vec::new();
        proof.encode(&mut bytes).unwrap();
        let decoded = Proof::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, proof);
    }

    #[test]
    fn preimage_validation() {
        let taro_script = TapCommitment::from_assets([asset("p", 1, 1)])
            .unwrap()
            .tap_leaf()
            .script;
        assert!(matches!(
            TapscriptPreimage::from_leaf_script(taro_script),
            Err(CommitmentError::SiblingIsTaroCommitment)
        ));

        let preimage =
            TapscriptPreimage::from_leaf_script(ScriptBuf::from_bytes(vec![0x51])).unwrap();
        let mut bytes = Vec::new();
        preimage.encode(&mut bytes).unwrap();
        let decoded = TapscriptPreimage::decode(&bytes).unwrap();
        assert_eq!(decoded, preimage);
        assert_eq!(decoded.to_tap_hash().unwrap(), preimage.to_tap_hash().unwrap());

        let bad_branch = TapscriptPreimage {
            sibling_preimage: vec![0u8; 63],
            sibling_type: TapscriptPreimageType::Branch,
        };
        assert!(bad_branch.to_tap_hash().is_err());
    }
}
