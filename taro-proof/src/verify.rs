use std::collections::BTreeSet;

use async_trait::async_trait;
use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::key::TapTweak;
use bitcoin::secp256k1::schnorr::Signature;
use bitcoin::secp256k1::{Message, Secp256k1, Verification, XOnlyPublicKey};
use bitcoin::taproot::TapNodeHash;
use bitcoin::{Transaction, Txid};
use taro_asset::{genesis_tx_digest, Asset, GenesisTxBuilder, VirtualGenesisTxBuilder};
use taro_commitment::TapCommitmentRoot;

use crate::file::File;
use crate::records::{Proof, TaprootProof};
use crate::ProofError;

/// The chain oracle an offline verifier consumes. Answers are authoritative:
/// a proof rejected against the oracle is never retried.
#[async_trait]
pub trait ChainLookup: Send + Sync {
    /// The height of the block containing `txid`, or [`ProofError::TxNotFound`].
    async fn tx_block_height(&self, txid: Txid) -> Result<u32, ProofError>;

    /// The mean timestamp (unix seconds) over the blocks preceding `height`.
    async fn mean_block_timestamp(&self, height: u32) -> Result<u64, ProofError>;

    /// The current chain tip height.
    async fn current_height(&self) -> Result<u32, ProofError>;
}

/// Verifies a single proof link against the chain oracle.
///
/// `prev_asset` is the asset produced by the preceding link, absent only for
/// the genesis link. On success the verified asset is returned so callers
/// can thread it into the next link.
pub async fn verify_proof(
    proof: &Proof,
    prev_asset: Option<&Asset>,
    chain: &(impl ChainLookup + ?Sized),
) -> Result<Asset, ProofError> {
    verify_block_binding(proof, chain).await?;
    verify_transition(proof, Predecessor::Required(prev_asset))
}

/// Verifies a proof link without knowledge of its predecessor, as a
/// universe server does for submitted leaves. The witness chain's identity
/// check is reduced to the anchor transaction spending the claimed
/// previous outpoint.
pub async fn verify_proof_standalone(
    proof: &Proof,
    chain: &(impl ChainLookup + ?Sized),
) -> Result<Asset, ProofError> {
    verify_block_binding(proof, chain).await?;
    verify_transition(proof, Predecessor::Unknown)
}

/// Verifies an ownership (challenge) proof: a transition proof with a
/// synthetic anchor, so every check except the block binding applies. The
/// challenge witness must be a valid schnorr signature by the asset's
/// script key over the ownership challenge digest.
pub fn verify_ownership_proof(
    proof: &Proof,
    prev_asset: Option<&Asset>,
) -> Result<Asset, ProofError> {
    let witness = proof.challenge_witness.as_ref().ok_or_else(|| {
        ProofError::InvalidProof("ownership proof lacks a challenge witness".into())
    })?;
    let sig_bytes = witness.nth(0).ok_or_else(|| {
        ProofError::InvalidProof("ownership proof challenge witness is empty".into())
    })?;
    let signature = Signature::from_slice(sig_bytes)
        .map_err(|e| ProofError::InvalidProof(e.to_string()))?;

    let secp = Secp256k1::verification_only();
    let digest = ownership_challenge_digest(&proof.asset);
    secp.verify_schnorr(
        &signature,
        &Message::from_digest(digest),
        &proof.asset.script_key.x_only(),
    )
    .map_err(|e| ProofError::InvalidProof(format!("challenge signature: {e}")))?;

    verify_transition(proof, Predecessor::Required(prev_asset))
}

/// The digest an ownership challenge signs: a tagged commitment to the
/// asset's identity and controlling key.
pub fn ownership_challenge_digest(asset: &Asset) -> [u8; 32] {
    let mut engine = sha256::Hash::engine();
    engine.input(b"taro-ownership");
    engine.input(asset.id().as_ref());
    engine.input(&asset.script_key.x_only().serialize());
    sha256::Hash::from_engine(engine).to_byte_array()
}

/// Verifies an entire proof file, walking from genesis to the newest link.
/// Returns the asset established by the final link.
pub async fn verify_file(
    file: &File,
    chain: &(impl ChainLookup + ?Sized),
) -> Result<Asset, ProofError> {
    if file.is_empty() {
        return Err(ProofError::InvalidProof("proof file is empty".into()));
    }

    let mut prev_asset: Option<Asset> = None;
    for index in 0..file.num_proofs() {
        let proof = file.proof_at(index)?;
        let asset = verify_proof(&proof, prev_asset.as_ref(), chain).await?;
        prev_asset = Some(asset);
    }

    prev_asset.ok_or_else(|| ProofError::InvalidProof("proof file is empty".into()))
}

/// Check 1: the anchor transaction is committed to by the claimed block at
/// the claimed height.
async fn verify_block_binding(
    proof: &Proof,
    chain: &(impl ChainLookup + ?Sized),
) -> Result<(), ProofError> {
    if !proof
        .tx_merkle_proof
        .verify(&proof.anchor_tx, proof.block_header.merkle_root)
    {
        return Err(ProofError::BlockMismatch(
            "anchor tx not under block merkle root".into(),
        ));
    }

    let txid = proof.anchor_tx.compute_txid();
    let height = chain.tx_block_height(txid).await?;
    if height != proof.block_height {
        return Err(ProofError::BlockMismatch(format!(
            "anchor tx confirmed at height {height}, proof claims {}",
            proof.block_height
        )));
    }

    let tip = chain.current_height().await?;
    if height > tip {
        return Err(ProofError::BlockMismatch(format!(
            "claimed height {height} above tip {tip}"
        )));
    }

    // The header timestamp must respect the median-time-past of its
    // predecessors.
    let mean_timestamp = chain.mean_block_timestamp(height).await?;
    if (proof.block_header.time as u64) < mean_timestamp {
        return Err(ProofError::BlockMismatch(format!(
            "header time {} below mean block time {mean_timestamp}",
            proof.block_header.time
        )));
    }

    Ok(())
}

/// How much the verifier knows about the preceding link.
enum Predecessor<'a> {
    /// The predecessor asset must be linked exactly (absent only for a
    /// genesis link).
    Required(Option<&'a Asset>),
    /// No predecessor available; only the prev-outpoint spend is checked.
    Unknown,
}

/// Checks 2 through 7: everything that does not require the chain oracle.
fn verify_transition(proof: &Proof, predecessor: Predecessor<'_>) -> Result<Asset, ProofError> {
    let secp = Secp256k1::verification_only();
    let asset = &proof.asset;

    // Check 3 happens inside check 2: deriving the commitment root from the
    // inclusion proof also proves the asset leaf is part of it.
    let commitment = verify_inclusion_proof(&secp, proof, asset)?;
    verify_exclusion_proofs(&secp, proof, asset, &commitment)?;
    verify_split_coherence(&secp, proof, asset)?;
    verify_chain_link(proof, predecessor, asset)?;
    verify_group_witness(&secp, asset)?;

    Ok(asset.clone())
}

/// Check 2 + 3: the inclusion proof places the new asset's leaf under a
/// commitment root whose tweak reproduces the anchor output key.
fn verify_inclusion_proof<C: Verification>(
    secp: &Secp256k1<C>,
    proof: &Proof,
    asset: &Asset,
) -> Result<TapCommitmentRoot, ProofError> {
    let inclusion = &proof.inclusion_proof;
    let commitment_proof = inclusion
        .commitment_proof
        .as_ref()
        .ok_or_else(|| ProofError::InclusionFail("inclusion proof has no commitment".into()))?;

    let commitment = commitment_proof
        .proof
        .derive_by_asset_inclusion(asset)
        .map_err(|e| ProofError::InclusionFail(e.to_string()))?;

    verify_anchor_output(
        secp,
        &proof.anchor_tx,
        inclusion,
        &commitment,
        commitment_proof.tap_sibling_preimage.as_ref(),
    )?;

    Ok(commitment)
}

/// Check 4: every other taproot output either proves a different commitment
/// that excludes the asset's keys, or proves it carries no commitment.
fn verify_exclusion_proofs<C: Verification>(
    secp: &Secp256k1<C>,
    proof: &Proof,
    asset: &Asset,
    inclusion_commitment: &TapCommitmentRoot,
) -> Result<(), ProofError> {
    let mut proven: BTreeSet<u32> = BTreeSet::new();

    for exclusion in &proof.exclusion_proofs {
        if exclusion.output_index == proof.inclusion_proof.output_index {
            return Err(ProofError::ExclusionFail(format!(
                "exclusion proof for the inclusion output {}",
                exclusion.output_index
            )));
        }

        match (&exclusion.commitment_proof, &exclusion.tapscript_proof) {
            (Some(commitment_proof), None) => {
                let commitment = commitment_proof
                    .proof
                    .derive_by_asset_exclusion(
                        asset.asset_commitment_key(),
                        asset.tap_commitment_key(),
                    )
                    .map_err(|e| ProofError::ExclusionFail(e.to_string()))?;

                if commitment.root == inclusion_commitment.root {
                    return Err(ProofError::ExclusionFail(format!(
                        "output {} claims the inclusion commitment",
                        exclusion.output_index
                    )));
                }

                verify_anchor_output(
                    secp,
                    &proof.anchor_tx,
                    exclusion,
                    &commitment,
                    commitment_proof.tap_sibling_preimage.as_ref(),
                )
                .map_err(|e| ProofError::ExclusionFail(e.to_string()))?;
            }
            (None, Some(tapscript_proof)) => {
                let merkle_root =
                    tapscript_merkle_root(tapscript_proof).map_err(|e| {
                        ProofError::ExclusionFail(e.to_string())
                    })?;
                verify_output_key(
                    secp,
                    &proof.anchor_tx,
                    exclusion.output_index,
                    &exclusion.internal_key,
                    merkle_root,
                )
                .map_err(|e| ProofError::ExclusionFail(e.to_string()))?;
            }
            _ => {
                return Err(ProofError::ExclusionFail(format!(
                    "output {} has no usable proof method",
                    exclusion.output_index
                )));
            }
        }

        proven.insert(exclusion.output_index);
    }

    // Every other P2TR output of the anchor transaction must be covered.
    for (index, tx_out) in proof.anchor_tx.output.iter().enumerate() {
        let index = index as u32;
        if index == proof.inclusion_proof.output_index {
            continue;
        }
        if tx_out.script_pubkey.is_p2tr() && !proven.contains(&index) {
            return Err(ProofError::ExclusionFail(format!(
                "taproot output {index} has no exclusion proof"
            )));
        }
    }

    Ok(())
}

/// Check 5: split outputs must carry a split-root proof that includes the
/// root asset, and their split leaf must sit under the root's split
/// commitment at the locator key.
fn verify_split_coherence<C: Verification>(
    secp: &Secp256k1<C>,
    proof: &Proof,
    asset: &Asset,
) -> Result<(), ProofError> {
    let split = match asset
        .prev_witnesses
        .iter()
        .find_map(|w| w.split_commitment.as_ref())
    {
        Some(split) => split,
        None => return Ok(()),
    };

    let split_root_proof = proof
        .split_root_proof
        .as_ref()
        .ok_or_else(|| ProofError::SplitIncoherent("missing split root proof".into()))?;

    let root_asset = &split.root_asset;
    let root_commitment_root = split_root_proof
        .commitment_proof
        .as_ref()
        .ok_or_else(|| {
            ProofError::SplitIncoherent("split root proof has no commitment".into())
        })?
        .proof
        .derive_by_asset_inclusion(root_asset)
        .map_err(|e| ProofError::SplitIncoherent(e.to_string()))?;

    verify_anchor_output(
        secp,
        &proof.anchor_tx,
        split_root_proof,
        &root_commitment_root,
        split_root_proof
            .commitment_proof
            .as_ref()
            .and_then(|c| c.tap_sibling_preimage.as_ref()),
    )
    .map_err(|e| ProofError::SplitIncoherent(e.to_string()))?;

    // The split leaf of this asset must verify against the root asset's
    // split commitment root at the locator key.
    let split_commitment_root = root_asset
        .split_commitment_root
        .ok_or_else(|| ProofError::SplitIncoherent("root asset has no split root".into()))?;

    let locator_key = taro_commitment::split_locator_key(
        proof.inclusion_proof.output_index,
        asset.id(),
        &asset.script_key.serialize(),
    );
    let split_leaf = taro_commitment::split_leaf(asset)?;
    if !split.proof.verify(&locator_key, &split_leaf, &split_commitment_root) {
        return Err(ProofError::SplitIncoherent(
            "split leaf not under the root split commitment".into(),
        ));
    }

    Ok(())
}

/// Check 6: this link spends exactly the predecessor the previous link
/// produced.
fn verify_chain_link(
    proof: &Proof,
    predecessor: Predecessor<'_>,
    asset: &Asset,
) -> Result<(), ProofError> {
    let prev_asset = match predecessor {
        Predecessor::Required(prev_asset) => prev_asset,
        Predecessor::Unknown => {
            if asset.is_genesis_asset() {
                return Ok(());
            }
            let spends_prev_out = proof
                .anchor_tx
                .input
                .iter()
                .any(|input| input.previous_output == proof.prev_out);
            if !spends_prev_out {
                return Err(ProofError::ChainBreak(
                    "anchor tx does not spend the claimed prev out".into(),
                ));
            }
            return Ok(());
        }
    };

    if asset.is_genesis_asset() {
        if prev_asset.is_some() {
            return Err(ProofError::ChainBreak(
                "genesis link cannot have a predecessor".into(),
            ));
        }
        return Ok(());
    }

    let prev_asset =
        prev_asset.ok_or_else(|| ProofError::ChainBreak("missing predecessor asset".into()))?;

    let spends_prev_out = proof
        .anchor_tx
        .input
        .iter()
        .any(|input| input.previous_output == proof.prev_out);
    if !spends_prev_out {
        return Err(ProofError::ChainBreak(
            "anchor tx does not spend the claimed prev out".into(),
        ));
    }

    // The witness chain must reference the predecessor by id, script key
    // and outpoint. For split assets, the witness lives on the root asset.
    let witness_source = asset
        .prev_witnesses
        .iter()
        .find_map(|w| w.split_commitment.as_ref())
        .map(|split| split.root_asset.as_ref())
        .unwrap_or(asset);

    let linked = witness_source.prev_witnesses.iter().any(|witness| {
        witness.prev_id.as_ref().is_some_and(|prev_id| {
            prev_id.out_point == proof.prev_out
                && prev_id.asset_id == prev_asset.id()
                && prev_id.script_key == prev_asset.script_key.serialize()
        })
    });
    if !linked {
        return Err(ProofError::ChainBreak(
            "no witness references the predecessor asset".into(),
        ));
    }

    Ok(())
}

/// Check 7: for grouped genesis assets, the group witness must be a valid
/// schnorr signature over the virtual genesis transaction.
fn verify_group_witness<C: Verification>(
    secp: &Secp256k1<C>,
    asset: &Asset,
) -> Result<(), ProofError> {
    let group = match (&asset.group_key, asset.is_genesis_asset()) {
        (Some(group), true) => group,
        _ => return Ok(()),
    };

    let sig_bytes = group
        .witness
        .nth(0)
        .ok_or(ProofError::GroupSigInvalid)?;
    let signature = Signature::from_slice(sig_bytes).map_err(|_| ProofError::GroupSigInvalid)?;

    let (tx, prev_out) = VirtualGenesisTxBuilder
        .build_genesis_tx(asset)
        .map_err(|_| ProofError::GroupSigInvalid)?;
    let digest = genesis_tx_digest(&tx, &prev_out).map_err(|_| ProofError::GroupSigInvalid)?;

    let (group_xonly, _) = group.group_pub_key.x_only_public_key();
    secp.verify_schnorr(&signature, &digest, &group_xonly)
        .map_err(|_| ProofError::GroupSigInvalid)?;
    Ok(())
}

/// Verifies that the anchor output addressed by `taproot_proof` pays to the
/// internal key tweaked with the commitment's tapscript root.
fn verify_anchor_output<C: Verification>(
    secp: &Secp256k1<C>,
    anchor_tx: &Transaction,
    taproot_proof: &TaprootProof,
    commitment: &TapCommitmentRoot,
    sibling: Option<&taro_commitment::TapscriptPreimage>,
) -> Result<(), ProofError> {
    let sibling_hash = sibling
        .map(|preimage| preimage.to_tap_hash())
        .transpose()
        .map_err(|e| ProofError::AnchorMismatch(e.to_string()))?;
    let merkle_root = commitment.tapscript_root(sibling_hash);
    verify_output_key(
        secp,
        anchor_tx,
        taproot_proof.output_index,
        &taproot_proof.internal_key,
        Some(merkle_root),
    )
}

/// Recomputes a taproot output key and compares it to the anchor output's
/// witness program.
fn verify_output_key<C: Verification>(
    secp: &Secp256k1<C>,
    anchor_tx: &Transaction,
    output_index: u32,
    internal_key: &bitcoin::secp256k1::PublicKey,
    merkle_root: Option<TapNodeHash>,
) -> Result<(), ProofError> {
    let tx_out = anchor_tx
        .output
        .get(output_index as usize)
        .ok_or_else(|| {
            ProofError::AnchorMismatch(format!(
                "output index {output_index} out of range for {} outputs",
                anchor_tx.output.len()
            ))
        })?;

    if !tx_out.script_pubkey.is_p2tr() {
        return Err(ProofError::AnchorMismatch(format!(
            "output {output_index} is not a taproot output"
        )));
    }
    let script_bytes = tx_out.script_pubkey.as_bytes();
    let claimed = XOnlyPublicKey::from_slice(&script_bytes[2..34])
        .map_err(|e| ProofError::AnchorMismatch(e.to_string()))?;

    let (internal_xonly, _) = internal_key.x_only_public_key();
    let (tweaked, _) = internal_xonly.tap_tweak(secp, merkle_root);

    if tweaked.to_x_only_public_key() != claimed {
        return Err(ProofError::AnchorMismatch(format!(
            "output {output_index} key does not match committed root"
        )));
    }

    Ok(())
}

/// Derives the tapscript merkle root a tapscript proof stands for: nothing
/// for BIP-86, or the root built from one or two revealed preimages.
fn tapscript_merkle_root(
    tapscript_proof: &crate::records::TapscriptProof,
) -> Result<Option<TapNodeHash>, ProofError> {
    if tapscript_proof.bip86 {
        return Ok(None);
    }

    match (&tapscript_proof.tap_preimage1, &tapscript_proof.tap_preimage2) {
        (Some(first), None) => Ok(Some(first.to_tap_hash()?)),
        (Some(first), Some(second)) => Ok(Some(TapNodeHash::from_node_hashes(
            first.to_tap_hash()?,
            second.to_tap_hash()?,
        ))),
        _ => Err(ProofError::InvalidProof(
            "tapscript proof reveals no preimages".into(),
        )),
    }
}
