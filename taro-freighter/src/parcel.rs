use std::collections::BTreeMap;
use std::fmt;

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{OutPoint, Transaction, Txid};
use serde::{Deserialize, Serialize};
use taro_asset::{Asset, AssetId, PrevId, ScriptKey, SerializedKey, Witness};
use taro_commitment::TapCommitment;
use taro_proof::{
    add_bip86_exclusion_proofs, create_transition_proof, CommitmentProof, Proof, SplitRootParams,
    TaprootProof, TransitionParams,
};
use taro_vpsbt::{KeyDescriptor, OutputType, VInput, VOutput, VPacket};

use crate::wallet::{FundedPsbt, TxConfirmation};
use crate::FreighterError;

/// The states of an outbound parcel. A parcel only ever advances, except
/// for the explicit reorg step back from [`SendState::WaitTxConf`] to
/// [`SendState::Broadcast`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SendState {
    /// Coin-select the asset inputs for the requested destinations.
    VirtualCommitmentSelect,
    /// Produce the virtual witness data and split commitment.
    VirtualSign,
    /// Fund, sign and finalize the BTC-level anchor transaction.
    AnchorSign,
    /// Derive and persist the outbound parcel; the durable checkpoint.
    LogCommit,
    /// Publish the anchor transaction and re-import the anchor outputs.
    Broadcast,
    /// Wait for on-chain confirmation.
    WaitTxConf,
    /// Assemble and archive the final proofs.
    StoreProofs,
    /// Deliver receiver proofs until acknowledged.
    ReceiverProofTransfer,
    /// Terminal state.
    Complete,
}

impl fmt::Display for SendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SendState::VirtualCommitmentSelect => "VirtualCommitmentSelect",
            SendState::VirtualSign => "VirtualSign",
            SendState::AnchorSign => "AnchorSign",
            SendState::LogCommit => "LogCommit",
            SendState::Broadcast => "Broadcast",
            SendState::WaitTxConf => "WaitTxConf",
            SendState::StoreProofs => "StoreProofs",
            SendState::ReceiverProofTransfer => "ReceiverProofTransfer",
            SendState::Complete => "Complete",
        };
        f.write_str(name)
    }
}

/// One requested destination of an address parcel.
#[derive(Debug, Clone)]
pub struct Destination {
    /// The asset to send.
    pub asset_id: AssetId,
    /// The unit amount to send.
    pub amount: u64,
    /// The receiver's script key.
    pub script_key: ScriptKey,
    /// The receiver's anchor internal key.
    pub anchor_internal_key: PublicKey,
}

/// A transfer request addressed by destination set; enters the machine at
/// coin selection.
#[derive(Debug, Clone)]
pub struct AddressParcel {
    /// The destinations to satisfy.
    pub destinations: Vec<Destination>,
}

/// A transfer request carrying an externally signed virtual packet; enters
/// the machine at anchor signing.
#[derive(Debug, Clone)]
pub struct PreSignedParcel {
    /// The signed virtual packet.
    pub packet: VPacket,
    /// The full commitment of the spent input anchor.
    pub input_commitment: TapCommitment,
}

/// A transfer request.
#[derive(Debug, Clone)]
pub enum Parcel {
    /// Destination-addressed transfer.
    Address(AddressParcel),
    /// Pre-signed virtual packet.
    PreSigned(PreSignedParcel),
}

impl Parcel {
    /// The state the parcel enters the machine at.
    pub fn initial_state(&self) -> SendState {
        match self {
            Parcel::Address(_) => SendState::VirtualCommitmentSelect,
            Parcel::PreSigned(_) => SendState::AnchorSign,
        }
    }
}

/// The BTC-level anchor transaction of an in-flight parcel, with the Taro
/// commitments of each of its anchor outputs.
#[derive(Debug, Clone)]
pub struct AnchorTransaction {
    /// The funded PSBT as returned by the wallet.
    pub funded_psbt: FundedPsbt,
    /// The fully signed transaction.
    pub final_tx: Transaction,
    /// Chain fees paid, in satoshis.
    pub chain_fees: u64,
    /// Taro commitment per anchor output index.
    pub output_commitments: BTreeMap<u32, TapCommitment>,
}

/// A passive asset being re-anchored to the split-root output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassiveAssetReAnchor {
    /// The single-input single-output packet moving the passive asset.
    pub packet: VPacket,
    /// The anchor outpoint the asset previously lived at.
    pub prev_anchor_point: OutPoint,
    /// The passive asset's script key.
    pub script_key: SerializedKey,
    /// The encoded re-anchor proof suffix.
    pub new_proof: Vec<u8>,
}

/// One spent input of an outbound parcel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferInput {
    /// The spent asset's previous id.
    pub prev_id: PrevId,
    /// The spent amount.
    pub amount: u64,
}

/// On-chain anchor data of one transfer output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    /// The anchor outpoint.
    pub out_point: OutPoint,
    /// BTC value of the anchor output in satoshis.
    pub value: u64,
    /// The anchor output's internal key with derivation info.
    pub internal_key: KeyDescriptor,
    /// The taproot merkle root committed by the output.
    pub merkle_root: [u8; 32],
    /// Encoded tapscript sibling preimage, if any.
    pub tapscript_sibling: Option<Vec<u8>>,
    /// Number of passive assets re-anchored to this output.
    pub num_passive_assets: u32,
}

/// One output of an outbound parcel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOutput {
    /// On-chain anchor data.
    pub anchor: Anchor,
    /// The output's script key.
    pub script_key: SerializedKey,
    /// True if the local wallet controls the script key.
    pub script_key_is_local: bool,
    /// The unit amount.
    pub amount: u64,
    /// The split commitment root carried by the output asset, if any.
    pub split_commitment_root: Option<taro_mssmt::ComputedNode>,
    /// The encoded proof suffix for the output.
    pub proof_suffix: Vec<u8>,
    /// True when the output only carries re-anchored passive assets.
    pub passive_assets_only: bool,
}

/// The durable record of an in-flight transfer, written at
/// [`SendState::LogCommit`]. Replaying the machine from this record must
/// reproduce byte-identical proofs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundParcel {
    /// The signed anchor transaction.
    pub anchor_tx: Transaction,
    /// Chain height when the parcel was committed; confirmation rescans
    /// start here.
    pub anchor_tx_height_hint: u32,
    /// Unix timestamp of the transfer.
    pub transfer_time_unix: u64,
    /// Chain fees paid, in satoshis.
    pub chain_fees: u64,
    /// The spent inputs.
    pub inputs: Vec<TransferInput>,
    /// The created outputs.
    pub outputs: Vec<TransferOutput>,
    /// The re-anchored passive assets.
    pub passive_assets: Vec<PassiveAssetReAnchor>,
}

impl OutboundParcel {
    /// The parcel identity: the anchor transaction id.
    pub fn anchor_txid(&self) -> Txid {
        self.anchor_tx.compute_txid()
    }
}

/// In-memory state of one parcel moving through the machine. The owning
/// task holds it exclusively between states.
#[derive(Debug)]
pub struct SendPackage {
    /// Current machine state.
    pub state: SendState,
    /// The originating request; absent for parcels resumed from disk.
    pub parcel: Option<Parcel>,
    /// The active virtual packet.
    pub packet: Option<VPacket>,
    /// The input anchor's full commitment.
    pub input_commitment: Option<TapCommitment>,
    /// Passive re-anchor packets.
    pub passive_packets: Vec<VPacket>,
    /// The funded and signed anchor transaction.
    pub anchor_tx: Option<AnchorTransaction>,
    /// The durable outbound record, set at LogCommit.
    pub outbound: Option<OutboundParcel>,
    /// Confirmation data, set at WaitTxConf.
    pub confirmation: Option<TxConfirmation>,
    /// The finalized proof files, set at StoreProofs.
    pub final_proofs: Vec<crate::wallet::AnnotatedProof>,
}

impl SendPackage {
    /// Wraps a fresh request.
    pub fn from_parcel(parcel: Parcel) -> Self {
        let state = parcel.initial_state();
        let (packet, input_commitment) = match &parcel {
            Parcel::PreSigned(pre_signed) => (
                Some(pre_signed.packet.clone()),
                Some(pre_signed.input_commitment.clone()),
            ),
            Parcel::Address(_) => (None, None),
        };

        SendPackage {
            state,
            parcel: Some(parcel),
            packet,
            input_commitment,
            passive_packets: Vec::new(),
            anchor_tx: None,
            outbound: None,
            confirmation: None,
            final_proofs: Vec::new(),
        }
    }

    /// Re-enters the machine from a stored parcel. Everything after the
    /// durable checkpoint is derivable from the record, so the machine
    /// resumes at broadcast.
    pub fn from_stored(outbound: OutboundParcel) -> Self {
        SendPackage {
            state: SendState::Broadcast,
            parcel: None,
            packet: None,
            input_commitment: None,
            passive_packets: Vec::new(),
            anchor_tx: None,
            outbound: Some(outbound),
            confirmation: None,
            final_proofs: Vec::new(),
        }
    }
}

/// Builds the per-anchor-index Taro commitments for the transfer: the
/// active outputs' assets plus every passive asset, bucketed by anchor
/// output index.
pub fn output_commitments(
    packet: &VPacket,
    passive_packets: &[VPacket],
) -> Result<BTreeMap<u32, TapCommitment>, FreighterError> {
    let mut assets_by_index: BTreeMap<u32, Vec<Asset>> = BTreeMap::new();

    for (index, output) in packet.outputs.iter().enumerate() {
        let asset = output
            .asset
            .as_ref()
            .ok_or_else(|| FreighterError::VirtualSignFail(format!("output {index} unsigned")))?;
        assets_by_index
            .entry(output.anchor_output_index)
            .or_default()
            .push(asset.clone());
    }

    for passive in passive_packets {
        let output = passive
            .outputs
            .first()
            .ok_or_else(|| FreighterError::VirtualSignFail("empty passive packet".into()))?;
        let asset = output.asset.as_ref().ok_or_else(|| {
            FreighterError::VirtualSignFail("passive packet unsigned".into())
        })?;
        assets_by_index
            .entry(output.anchor_output_index)
            .or_default()
            .push(asset.clone());
    }

    let mut commitments = BTreeMap::new();
    for (index, assets) in assets_by_index {
        commitments.insert(index, TapCommitment::from_assets(assets)?);
    }
    Ok(commitments)
}

/// Builds exclusion proofs for `target_asset` from every anchor output
/// commitment except the ones `skip` selects. Each proof shows the other
/// output's commitment does not contain the asset's keys.
fn other_output_exclusions(
    packet: &VPacket,
    commitments: &BTreeMap<u32, TapCommitment>,
    target_asset: &Asset,
    skip: impl Fn(&VOutput) -> bool,
) -> Result<Vec<TaprootProof>, FreighterError> {
    let mut proofs: Vec<TaprootProof> = Vec::new();

    for output in &packet.outputs {
        let already_proven = proofs
            .iter()
            .any(|proof| proof.output_index == output.anchor_output_index);
        if skip(output) || already_proven {
            continue;
        }

        let commitment = commitments
            .get(&output.anchor_output_index)
            .ok_or_else(|| {
                FreighterError::VirtualSignFail(format!(
                    "no commitment for anchor index {}",
                    output.anchor_output_index
                ))
            })?;

        let (_, exclusion) = commitment.proof(
            target_asset.tap_commitment_key(),
            target_asset.asset_commitment_key(),
        )?;
        proofs.push(TaprootProof {
            output_index: output.anchor_output_index,
            internal_key: output.anchor_internal_key,
            commitment_proof: Some(CommitmentProof {
                proof: exclusion,
                tap_sibling_preimage: output.anchor_tapscript_sibling.clone(),
            }),
            tapscript_proof: None,
        });
    }

    Ok(proofs)
}

/// Creates the proof suffix for one output of the active transfer.
pub fn create_proof_suffix(
    anchor_tx: &AnchorTransaction,
    packet: &VPacket,
    output_index: usize,
) -> Result<Proof, FreighterError> {
    let output = packet
        .outputs
        .get(output_index)
        .ok_or_else(|| FreighterError::VirtualSignFail(format!("no output {output_index}")))?;
    let asset = output.asset.as_ref().ok_or_else(|| {
        FreighterError::VirtualSignFail(format!("output {output_index} unsigned"))
    })?;
    let commitments = &anchor_tx.output_commitments;
    let commitment = commitments
        .get(&output.anchor_output_index)
        .ok_or_else(|| {
            FreighterError::VirtualSignFail(format!(
                "no commitment for anchor index {}",
                output.anchor_output_index
            ))
        })?;

    let is_split = packet.has_split_commitment();
    let mut params = TransitionParams {
        anchor_tx: anchor_tx.final_tx.clone(),
        output_index: output.anchor_output_index,
        internal_key: output.anchor_internal_key,
        tap_commitment: commitment.clone(),
        tapscript_sibling: output.anchor_tapscript_sibling.clone(),
        new_asset: asset.clone(),
        exclusion_proofs: Vec::new(),
        split_root: None,
    };

    if output.is_split_root() || !is_split {
        // The root (or interactive full-value) output needs exclusions
        // from every other anchor output.
        params.exclusion_proofs = other_output_exclusions(packet, commitments, asset, |other| {
            other.anchor_output_index == output.anchor_output_index
        })?;
    } else {
        // A split output: exclusion from the split root plus all other
        // anchor outputs, and the split root inclusion parameters.
        let split_root_output = packet.split_root_output()?;
        let split_root_commitment = commitments
            .get(&split_root_output.anchor_output_index)
            .ok_or_else(|| {
                FreighterError::VirtualSignFail("split root commitment missing".into())
            })?;

        params.exclusion_proofs =
            other_output_exclusions(packet, commitments, asset, |other| {
                other.anchor_output_index == output.anchor_output_index
            })?;
        params.split_root = Some(SplitRootParams {
            output_index: split_root_output.anchor_output_index,
            internal_key: split_root_output.anchor_internal_key,
            tap_commitment: split_root_commitment.clone(),
            tapscript_sibling: split_root_output.anchor_tapscript_sibling.clone(),
        });
    }

    let input = packet
        .inputs
        .first()
        .ok_or_else(|| FreighterError::VirtualSignFail("packet has no inputs".into()))?;
    let mut proof = create_transition_proof(input.prev_id.out_point, &params)?;

    // Wallet change outputs carry no commitment; prove them BIP-86.
    add_bip86_exclusion_proofs(&mut proof, &anchor_tx.funded_psbt.psbt, |index| {
        packet
            .outputs
            .iter()
            .any(|output| output.anchor_output_index == index)
    })?;

    Ok(proof)
}

/// Creates the re-anchor proof suffix for one passive asset: an inclusion
/// proof at the split-root output plus exclusions for every other anchor
/// output.
pub fn create_re_anchor_proof(
    anchor_tx: &AnchorTransaction,
    packet: &VPacket,
    passive_packet: &VPacket,
) -> Result<Proof, FreighterError> {
    let passive_input = passive_packet
        .inputs
        .first()
        .ok_or_else(|| FreighterError::VirtualSignFail("passive packet has no input".into()))?;
    let passive_output = passive_packet
        .outputs
        .first()
        .ok_or_else(|| FreighterError::VirtualSignFail("passive packet has no output".into()))?;
    let passive_asset = passive_output.asset.as_ref().ok_or_else(|| {
        FreighterError::VirtualSignFail("passive packet unsigned".into())
    })?;

    // Passive assets always land on the split root output.
    let split_root_output = packet.split_root_output()?;
    let commitments = &anchor_tx.output_commitments;
    let commitment = commitments
        .get(&passive_output.anchor_output_index)
        .ok_or_else(|| {
            FreighterError::VirtualSignFail("passive anchor commitment missing".into())
        })?;

    let mut params = TransitionParams {
        anchor_tx: anchor_tx.final_tx.clone(),
        output_index: passive_output.anchor_output_index,
        internal_key: split_root_output.anchor_internal_key,
        tap_commitment: commitment.clone(),
        tapscript_sibling: split_root_output.anchor_tapscript_sibling.clone(),
        new_asset: passive_asset.clone(),
        exclusion_proofs: Vec::new(),
        split_root: None,
    };
    params.exclusion_proofs =
        other_output_exclusions(packet, commitments, passive_asset, |other| {
            other.anchor_output_index == passive_output.anchor_output_index
        })?;

    let mut proof = create_transition_proof(passive_input.prev_id.out_point, &params)?;
    add_bip86_exclusion_proofs(&mut proof, &anchor_tx.funded_psbt.psbt, |index| {
        packet
            .outputs
            .iter()
            .any(|output| output.anchor_output_index == index)
    })?;

    Ok(proof)
}

/// Builds the single-input single-output re-anchor packet for one passive
/// asset.
pub fn passive_packet_for(
    input: &VInput,
    passive_asset: &Asset,
    split_root_output: &VOutput,
) -> VPacket {
    let prev_id = PrevId {
        out_point: input.anchor.out_point,
        asset_id: passive_asset.id(),
        script_key: passive_asset.script_key.serialize(),
    };

    VPacket {
        inputs: vec![VInput {
            prev_id,
            asset: passive_asset.clone(),
            anchor: input.anchor.clone(),
        }],
        outputs: vec![VOutput {
            amount: passive_asset.amount,
            output_type: OutputType::PassiveAssetsOnly,
            interactive: true,
            anchor_output_index: split_root_output.anchor_output_index,
            anchor_internal_key: split_root_output.anchor_internal_key,
            anchor_key_desc: split_root_output.anchor_key_desc,
            anchor_tapscript_sibling: split_root_output.anchor_tapscript_sibling.clone(),
            script_key: passive_asset.script_key.clone(),
            asset: None,
        }],
    }
}

/// Populates a passive packet's output asset: the same asset with a fresh
/// transfer witness pointing at its old anchor.
pub fn prepare_passive_asset(packet: &mut VPacket) -> Result<(), FreighterError> {
    let input = packet
        .inputs
        .first()
        .ok_or_else(|| FreighterError::VirtualSignFail("passive packet has no input".into()))?
        .clone();

    let mut asset = input.asset.clone();
    asset.prev_witnesses = vec![Witness {
        prev_id: Some(input.prev_id),
        tx_witness: bitcoin::Witness::new(),
        split_commitment: None,
    }];
    asset.split_commitment_root = None;

    packet
        .outputs
        .first_mut()
        .ok_or_else(|| FreighterError::VirtualSignFail("passive packet has no output".into()))?
        .asset = Some(asset);
    Ok(())
}

/// Derives the durable [`OutboundParcel`] from the signed anchor
/// transaction and the virtual packets, generating every proof suffix.
/// This runs exactly once, at the durable checkpoint.
pub fn prepare_for_storage(
    current_height: u32,
    transfer_time_unix: u64,
    anchor_tx: &AnchorTransaction,
    packet: &VPacket,
    passive_packets: &[VPacket],
    local_script_keys: &[bool],
) -> Result<OutboundParcel, FreighterError> {
    let anchor_txid = anchor_tx.final_tx.compute_txid();

    // Passive re-anchor proofs first.
    let mut passive_assets = Vec::with_capacity(passive_packets.len());
    for passive_packet in passive_packets {
        let proof = create_re_anchor_proof(anchor_tx, packet, passive_packet)?;
        let input = &passive_packet.inputs[0];
        passive_assets.push(PassiveAssetReAnchor {
            packet: passive_packet.clone(),
            prev_anchor_point: input.anchor.out_point,
            script_key: input.asset.script_key.serialize(),
            new_proof: proof.to_bytes()?,
        });
    }

    let inputs = packet
        .inputs
        .iter()
        .map(|input| TransferInput {
            prev_id: input.prev_id,
            amount: input.asset.amount,
        })
        .collect();

    let mut outputs = Vec::with_capacity(packet.outputs.len());
    for (index, output) in packet.outputs.iter().enumerate() {
        let commitment = anchor_tx
            .output_commitments
            .get(&output.anchor_output_index)
            .ok_or_else(|| {
                FreighterError::VirtualSignFail(format!(
                    "no commitment for anchor index {}",
                    output.anchor_output_index
                ))
            })?;

        let sibling_hash = output
            .anchor_tapscript_sibling
            .as_ref()
            .map(|preimage| preimage.to_tap_hash())
            .transpose()?;
        let merkle_root = commitment.tapscript_root(sibling_hash);

        let passive_assets_only = output.output_type == OutputType::PassiveAssetsOnly;
        let num_passive_assets = if output.is_split_root() {
            passive_assets.len() as u32
        } else {
            0
        };

        let (proof_suffix, split_commitment_root) = if passive_assets_only {
            (Vec::new(), None)
        } else {
            let proof = create_proof_suffix(anchor_tx, packet, index)?;
            let asset = output.asset.as_ref().ok_or_else(|| {
                FreighterError::VirtualSignFail(format!("output {index} unsigned"))
            })?;
            (proof.to_bytes()?, asset.split_commitment_root)
        };

        let tx_out = anchor_tx
            .final_tx
            .output
            .get(output.anchor_output_index as usize)
            .ok_or_else(|| {
                FreighterError::AnchorPsbtInvalid(format!(
                    "anchor output {} missing from final tx",
                    output.anchor_output_index
                ))
            })?;

        let mut sibling_bytes = None;
        if let Some(preimage) = &output.anchor_tapscript_sibling {
            let mut bytes = Vec::new();
            preimage.encode(&mut bytes)?;
            sibling_bytes = Some(bytes);
        }

        outputs.push(TransferOutput {
            anchor: Anchor {
                out_point: OutPoint {
                    txid: anchor_txid,
                    vout: output.anchor_output_index,
                },
                value: tx_out.value.to_sat(),
                internal_key: output.anchor_key_desc(),
                merkle_root: merkle_root.to_byte_array(),
                tapscript_sibling: sibling_bytes,
                num_passive_assets,
            },
            script_key: output.script_key.serialize(),
            script_key_is_local: local_script_keys.get(index).copied().unwrap_or(false),
            amount: output.amount,
            split_commitment_root,
            proof_suffix,
            passive_assets_only,
        });
    }

    Ok(OutboundParcel {
        anchor_tx: anchor_tx.final_tx.clone(),
        anchor_tx_height_hint: current_height,
        transfer_time_unix,
        chain_fees: anchor_tx.chain_fees,
        inputs,
        outputs,
        passive_assets,
    })
}
