use bitcoin::block::Header;
use bitcoin::hashes::Hash;
use bitcoin::key::Parity;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{OutPoint, Psbt, Transaction, TxMerkleNode, Txid};
use taro_asset::Asset;
use taro_commitment::{TapCommitment, TapscriptPreimage};

use crate::records::{CommitmentProof, Proof, TaprootProof, TapscriptProof};
use crate::tx::TxMerkleProof;
use crate::ProofError;

/// Anchor data for the split-root output, needed when building the proof of
/// a non-root split output.
#[derive(Debug, Clone)]
pub struct SplitRootParams {
    /// Anchor output index of the split root.
    pub output_index: u32,
    /// Internal key of the split-root anchor output.
    pub internal_key: PublicKey,
    /// The split-root output's Taro commitment.
    pub tap_commitment: TapCommitment,
    /// Tapscript sibling of the split-root commitment leaf, if any.
    pub tapscript_sibling: Option<TapscriptPreimage>,
}

/// Everything needed to assemble the proof suffix for one transition
/// output. The chain portion (block header, height, merkle proof) is filled
/// with placeholder data until the anchor transaction confirms.
#[derive(Debug, Clone)]
pub struct TransitionParams {
    /// The anchor transaction performing the transition.
    pub anchor_tx: Transaction,
    /// The anchor output index the new asset is committed at.
    pub output_index: u32,
    /// The internal key of that anchor output.
    pub internal_key: PublicKey,
    /// The Taro commitment of that anchor output.
    pub tap_commitment: TapCommitment,
    /// Tapscript sibling of the commitment leaf, if any.
    pub tapscript_sibling: Option<TapscriptPreimage>,
    /// The asset as it exists after the transition.
    pub new_asset: Asset,
    /// Pre-assembled exclusion proofs for other anchor outputs.
    pub exclusion_proofs: Vec<TaprootProof>,
    /// Split-root anchor data, required when `new_asset` carries a split
    /// commitment witness.
    pub split_root: Option<SplitRootParams>,
}

/// Assembles a transition proof suffix from the given parameters. The block
/// binding carries a synthetic single-transaction block until
/// [`update_transition_proof`] patches in the confirmed block.
pub fn create_transition_proof(
    prev_out: OutPoint,
    params: &TransitionParams,
) -> Result<Proof, ProofError> {
    let asset = &params.new_asset;
    let (_, commitment_proof) = params.tap_commitment.proof(
        asset.tap_commitment_key(),
        asset.asset_commitment_key(),
    )?;

    let inclusion_proof = TaprootProof {
        output_index: params.output_index,
        internal_key: params.internal_key,
        commitment_proof: Some(CommitmentProof {
            proof: commitment_proof,
            tap_sibling_preimage: params.tapscript_sibling.clone(),
        }),
        tapscript_proof: None,
    };

    // A single-transaction block: the txid is the merkle root and the
    // merkle proof is empty.
    let txid = params.anchor_tx.compute_txid();
    let placeholder_header = Header {
        version: bitcoin::block::Version::TWO,
        prev_blockhash: bitcoin::BlockHash::all_zeros(),
        merkle_root: TxMerkleNode::from_byte_array(txid.to_byte_array()),
        time: 0,
        bits: bitcoin::CompactTarget::from_consensus(0),
        nonce: 0,
    };

    let mut proof = Proof::new_transition(
        prev_out,
        placeholder_header,
        0,
        params.anchor_tx.clone(),
        TxMerkleProof {
            nodes: Vec::new(),
            bits: Vec::new(),
        },
        asset.clone(),
        inclusion_proof,
    );
    proof.exclusion_proofs = params.exclusion_proofs.clone();

    // Split outputs additionally prove the root asset's inclusion at the
    // split-root anchor output.
    if asset.has_split_commitment_witness() {
        let split_root = params.split_root.as_ref().ok_or_else(|| {
            ProofError::SplitIncoherent("split asset without split root params".into())
        })?;
        let root_asset = asset
            .prev_witnesses
            .iter()
            .find_map(|w| w.split_commitment.as_ref())
            .map(|split| split.root_asset.as_ref())
            .ok_or_else(|| {
                ProofError::SplitIncoherent("split asset without root asset".into())
            })?;

        let (_, root_proof) = split_root.tap_commitment.proof(
            root_asset.tap_commitment_key(),
            root_asset.asset_commitment_key(),
        )?;
        proof.split_root_proof = Some(TaprootProof {
            output_index: split_root.output_index,
            internal_key: split_root.internal_key,
            commitment_proof: Some(CommitmentProof {
                proof: root_proof,
                tap_sibling_preimage: split_root.tapscript_sibling.clone(),
            }),
            tapscript_proof: None,
        });
    }

    Ok(proof)
}

/// Adds BIP-86 exclusion proofs for every taproot output of the funded PSBT
/// that is not an anchor output of the transfer. The wallet's change
/// outputs carry no script tree, so revealing their internal key proves
/// they cannot hold a Taro commitment.
pub fn add_bip86_exclusion_proofs(
    proof: &mut Proof,
    funded_psbt: &Psbt,
    is_anchor: impl Fn(u32) -> bool,
) -> Result<(), ProofError> {
    for (index, tx_out) in funded_psbt.unsigned_tx.output.iter().enumerate() {
        let index = index as u32;
        if is_anchor(index) || !tx_out.script_pubkey.is_p2tr() {
            continue;
        }

        let psbt_output = funded_psbt
            .outputs
            .get(index as usize)
            .ok_or_else(|| {
                ProofError::InvalidProof(format!("psbt missing output {index}"))
            })?;
        let internal_key = psbt_output.tap_internal_key.ok_or_else(|| {
            ProofError::InvalidProof(format!(
                "psbt output {index} has no taproot internal key"
            ))
        })?;

        proof.exclusion_proofs.push(TaprootProof {
            output_index: index,
            // Parity is irrelevant: verification re-derives the x-only key.
            internal_key: PublicKey::from_x_only_public_key(internal_key, Parity::Even),
            commitment_proof: None,
            tapscript_proof: Some(TapscriptProof {
                tap_preimage1: None,
                tap_preimage2: None,
                bip86: true,
            }),
        });
    }

    Ok(())
}

/// Patches the confirmed block data into a proof suffix: the real header,
/// height, and the merkle proof for the anchor transaction's position in
/// the block.
pub fn update_transition_proof(
    proof: &mut Proof,
    block_header: Header,
    block_height: u32,
    block_txids: &[Txid],
) -> Result<(), ProofError> {
    let txid = proof.anchor_tx.compute_txid();
    let tx_index = block_txids
        .iter()
        .position(|id| *id == txid)
        .ok_or_else(|| {
            ProofError::BlockMismatch("anchor tx not part of the confirmed block".into())
        })?;

    proof.block_header = block_header;
    proof.block_height = block_height;
    proof.tx_merkle_proof = TxMerkleProof::from_block_txids(block_txids, tx_index)?;
    Ok(())
}
