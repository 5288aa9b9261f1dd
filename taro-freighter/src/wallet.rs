use async_trait::async_trait;
use bitcoin::block::Header;
use bitcoin::secp256k1::schnorr::Signature;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{OutPoint, Psbt, Transaction, Txid};
use serde::{Deserialize, Serialize};
use taro_asset::{AssetId, ScriptKey, SerializedKey};
use taro_commitment::TapCommitment;
use taro_vpsbt::{KeyDescriptor, VInput};

use crate::parcel::OutboundParcel;
use crate::FreighterError;

/// A PSBT the wallet has funded with BTC-level inputs (and possibly a
/// change output).
#[derive(Debug, Clone)]
pub struct FundedPsbt {
    /// The funded but unsigned packet.
    pub psbt: Psbt,
    /// Index of the wallet's change output, if one was added.
    pub change_output_index: Option<u32>,
    /// Chain fees paid by the transaction, in satoshis.
    pub chain_fees: u64,
}

/// Confirmation data for a broadcast anchor transaction.
#[derive(Debug, Clone)]
pub struct TxConfirmation {
    /// Header of the confirming block.
    pub block_header: Header,
    /// Height of the confirming block.
    pub block_height: u32,
    /// All txids of the confirming block, in block order.
    pub block_txids: Vec<Txid>,
}

/// Outcome of waiting for a confirmation.
#[derive(Debug, Clone)]
pub enum ConfirmationEvent {
    /// The transaction confirmed.
    Confirmed(TxConfirmation),
    /// The chain reorganized below the height hint; the transaction must
    /// be re-broadcast.
    Reorg,
}

/// An input commitment chosen by coin selection: the asset input to spend
/// plus the full Taro tree currently anchored at its outpoint.
#[derive(Debug, Clone)]
pub struct SelectedCommitment {
    /// The asset input to spend.
    pub input: VInput,
    /// The full commitment of the spent anchor output.
    pub commitment: TapCommitment,
}

/// Selects and locks asset inputs. Locks are held until the parcel reaches
/// its durable checkpoint or aborts.
#[async_trait]
pub trait CoinSelector: Send + Sync {
    /// Selects an input commitment holding at least `min_amount` units of
    /// `asset_id`, locking its anchor outpoint.
    async fn select_commitment(
        &self,
        asset_id: AssetId,
        min_amount: u64,
    ) -> Result<SelectedCommitment, FreighterError>;

    /// Releases the lock on a previously selected outpoint.
    async fn release_coins(&self, out_point: OutPoint) -> Result<(), FreighterError>;
}

/// The single-writer BTC wallet collaborator.
#[async_trait]
pub trait WalletAnchor: Send + Sync {
    /// Funds the template PSBT with wallet inputs at the given fee rate.
    async fn fund_psbt(
        &self,
        template: Psbt,
        fee_rate_sat_per_kw: u64,
    ) -> Result<FundedPsbt, FreighterError>;

    /// Signs and finalizes a funded PSBT.
    async fn sign_and_finalize_psbt(&self, psbt: Psbt) -> Result<Psbt, FreighterError>;

    /// Imports a taproot output key so the wallet tracks the anchor UTXO.
    async fn import_taproot_output(&self, output_key: PublicKey) -> Result<(), FreighterError>;

    /// Derives the next internal key under the given family.
    async fn next_internal_key(&self, family: u32) -> Result<KeyDescriptor, FreighterError>;

    /// Derives the next script key under the given family.
    async fn next_script_key(&self, family: u32) -> Result<ScriptKey, FreighterError>;

    /// Returns true if the wallet controls the given key.
    async fn is_local_key(&self, desc: &KeyDescriptor) -> bool;

    /// Signs a virtual transaction digest with the key behind the script
    /// key.
    async fn sign_virtual_tx(
        &self,
        script_key: &ScriptKey,
        digest: [u8; 32],
    ) -> Result<Signature, FreighterError>;
}

/// Chain access for broadcasting and confirmation tracking.
#[async_trait]
pub trait ChainBridge: Send + Sync {
    /// Publishes the transaction to the network.
    async fn broadcast(&self, tx: &Transaction) -> Result<(), FreighterError>;

    /// Waits for the transaction to confirm, or signals a reorg below the
    /// height hint.
    async fn wait_for_confirmation(
        &self,
        txid: Txid,
        height_hint: u32,
    ) -> Result<ConfirmationEvent, FreighterError>;

    /// The current chain tip height.
    async fn current_height(&self) -> Result<u32, FreighterError>;
}

/// A finalized proof destined for the local archive, keyed by the serialized
/// script key of its output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotatedProof {
    /// The script key of the proven output.
    pub script_key: SerializedKey,
    /// The anchor outpoint of the proven output.
    pub out_point: OutPoint,
    /// The encoded proof file.
    pub file_bytes: Vec<u8>,
}

/// The local proof archive.
#[async_trait]
pub trait ProofArchive: Send + Sync {
    /// Stores the given proofs transactionally.
    async fn import_proofs(&self, proofs: &[AnnotatedProof]) -> Result<(), FreighterError>;
}

/// Delivers receiver proofs. An `Ok` return means confirmed receipt.
#[async_trait]
pub trait ProofCourier: Send + Sync {
    /// Delivers one proof file to the receiver identified by the script
    /// key.
    async fn deliver_proof(
        &self,
        recipient: SerializedKey,
        file_bytes: &[u8],
    ) -> Result<(), FreighterError>;
}

/// Durable parcel storage with read-after-write consistency. Writing the
/// pending parcel is the state machine's durable checkpoint.
#[async_trait]
pub trait TransferLog: Send + Sync {
    /// Atomically records a pending outbound parcel.
    async fn log_pending_parcel(&self, parcel: &OutboundParcel) -> Result<(), FreighterError>;

    /// Records confirmed delivery of one receiver proof.
    async fn confirm_proof_delivery(
        &self,
        anchor_txid: Txid,
        recipient: SerializedKey,
    ) -> Result<(), FreighterError>;

    /// Marks a parcel as fully completed.
    async fn mark_parcel_complete(&self, anchor_txid: Txid) -> Result<(), FreighterError>;

    /// Returns all parcels logged but not yet completed.
    async fn pending_parcels(&self) -> Result<Vec<OutboundParcel>, FreighterError>;
}
