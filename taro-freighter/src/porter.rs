use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::key::TapTweak;
use bitcoin::secp256k1::{PublicKey, Secp256k1};
use bitcoin::taproot::TapNodeHash;
use bitcoin::transaction::Version;
use bitcoin::{Amount, Psbt, ScriptBuf, Sequence, Transaction, TxIn, TxOut};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};

use taro_proof::{update_transition_proof, File, Proof};
use taro_vpsbt::{signing_digest, KeyDescriptor, OutputType, VOutput, VPacket};

use crate::backoff::{retry, Backoff};
use crate::guard::ContextGuard;
use crate::parcel::{
    output_commitments, passive_packet_for, prepare_for_storage, prepare_passive_asset,
    AnchorTransaction, Parcel, SendPackage, SendState,
};
use crate::wallet::{
    AnnotatedProof, ChainBridge, CoinSelector, ConfirmationEvent, ProofArchive, ProofCourier,
    TransferLog, WalletAnchor,
};
use crate::{FreighterError, OutboundParcel};

/// Tunables of the chain porter.
#[derive(Debug, Clone)]
pub struct PorterConfig {
    /// Fee rate handed to the wallet when funding the anchor PSBT.
    pub fee_rate_sat_per_kw: u64,
    /// Key family for anchor internal keys.
    pub anchor_key_family: u32,
    /// Key family for asset script keys.
    pub script_key_family: u32,
    /// BTC value given to each anchor output before funding.
    pub anchor_output_value_sats: u64,
    /// Retry policy for coin-selection lock conflicts.
    pub coin_select_backoff: Backoff,
    /// Bounded retry policy for broadcasting.
    pub broadcast_backoff: Backoff,
    /// Unbounded retry policy for receiver proof delivery.
    pub delivery_backoff: Backoff,
    /// Default timeout of guarded operations.
    pub default_timeout: Duration,
}

impl Default for PorterConfig {
    fn default() -> Self {
        PorterConfig {
            fee_rate_sat_per_kw: 253,
            anchor_key_family: 212,
            script_key_family: 213,
            anchor_output_value_sats: 1_000,
            coin_select_backoff: Backoff::bounded(
                Duration::from_millis(100),
                Duration::from_secs(2),
                5,
            ),
            broadcast_backoff: Backoff::bounded(
                Duration::from_millis(500),
                Duration::from_secs(30),
                6,
            ),
            delivery_backoff: Backoff::forever(
                Duration::from_millis(500),
                Duration::from_secs(60),
            ),
            default_timeout: Duration::from_secs(30),
        }
    }
}

/// Drives outbound parcels through the send state machine: one task per
/// in-flight parcel, collaborators reached through the injected traits.
pub struct ChainPorter {
    cfg: PorterConfig,
    coin_selector: Arc<dyn CoinSelector>,
    wallet: Arc<dyn WalletAnchor>,
    chain: Arc<dyn ChainBridge>,
    proof_archive: Arc<dyn ProofArchive>,
    courier: Arc<dyn ProofCourier>,
    transfer_log: Arc<dyn TransferLog>,
    guard: ContextGuard,
}

impl ChainPorter {
    /// Creates a porter over the given collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: PorterConfig,
        coin_selector: Arc<dyn CoinSelector>,
        wallet: Arc<dyn WalletAnchor>,
        chain: Arc<dyn ChainBridge>,
        proof_archive: Arc<dyn ProofArchive>,
        courier: Arc<dyn ProofCourier>,
        transfer_log: Arc<dyn TransferLog>,
    ) -> Arc<Self> {
        let guard = ContextGuard::new(cfg.default_timeout);
        Arc::new(ChainPorter {
            cfg,
            coin_selector,
            wallet,
            chain,
            proof_archive,
            courier,
            transfer_log,
            guard,
        })
    }

    /// The porter's context guard; quit it to shut the porter down.
    pub fn guard(&self) -> &ContextGuard {
        &self.guard
    }

    /// Resumes every parcel that was committed but not completed before a
    /// restart. Each resumes at [`SendState::Broadcast`] from its stored
    /// record.
    pub async fn resume_pending(self: &Arc<Self>) -> Result<usize, FreighterError> {
        let pending = self.transfer_log.pending_parcels().await?;
        let count = pending.len();
        for outbound in pending {
            let txid = outbound.anchor_txid();
            info!(%txid, "resuming pending parcel");
            self.spawn_package(SendPackage::from_stored(outbound));
        }
        Ok(count)
    }

    /// Requests an asset shipment, spawning a dedicated parcel task. The
    /// returned receiver resolves once the parcel completes (or fails).
    pub fn spawn_shipment(
        self: &Arc<Self>,
        parcel: Parcel,
    ) -> oneshot::Receiver<Result<OutboundParcel, FreighterError>> {
        self.spawn_package(SendPackage::from_parcel(parcel))
    }

    /// Ships a parcel and waits for its completion.
    pub async fn ship(self: &Arc<Self>, parcel: Parcel) -> Result<OutboundParcel, FreighterError> {
        self.spawn_shipment(parcel)
            .await
            .map_err(|_| FreighterError::Shutdown)?
    }

    fn spawn_package(
        self: &Arc<Self>,
        pkg: SendPackage,
    ) -> oneshot::Receiver<Result<OutboundParcel, FreighterError>> {
        let (response_tx, response_rx) = oneshot::channel();
        let porter = Arc::clone(self);
        let task = self.guard.task();

        let span = info_span!("parcel", state = %pkg.state);
        tokio::spawn(
            async move {
                let _task = task;
                let result = porter.deliver(pkg).await;
                if let Err(err) = &result {
                    warn!(%err, "parcel failed");
                }
                // The requester may have gone away; that does not affect
                // the parcel outcome.
                let _ = response_tx.send(result);
            }
            .instrument(span),
        );

        response_rx
    }

    /// Runs a package to completion.
    async fn deliver(&self, mut pkg: SendPackage) -> Result<OutboundParcel, FreighterError> {
        loop {
            debug!(state = %pkg.state, "advancing parcel");
            let result = self.advance(&mut pkg).await;

            if let Err(err) = result {
                // Locks taken by coin selection are only held until the
                // durable checkpoint; release them on earlier failures.
                if pkg.outbound.is_none() {
                    if let Some(packet) = &pkg.packet {
                        if let Some(input) = packet.inputs.first() {
                            let _ = self
                                .coin_selector
                                .release_coins(input.anchor.out_point)
                                .await;
                        }
                    }
                }
                return Err(err);
            }

            if pkg.state == SendState::Complete {
                return pkg
                    .outbound
                    .take()
                    .ok_or_else(|| FreighterError::Storage("completed without record".into()));
            }
        }
    }

    /// Advances the package by exactly one state.
    async fn advance(&self, pkg: &mut SendPackage) -> Result<(), FreighterError> {
        match pkg.state {
            SendState::VirtualCommitmentSelect => {
                self.virtual_commitment_select(pkg).await?;
                pkg.state = SendState::VirtualSign;
            }
            SendState::VirtualSign => {
                self.virtual_sign(pkg).await?;
                pkg.state = SendState::AnchorSign;
            }
            SendState::AnchorSign => {
                self.anchor_sign(pkg).await?;
                pkg.state = SendState::LogCommit;
            }
            SendState::LogCommit => {
                self.log_commit(pkg).await?;
                pkg.state = SendState::Broadcast;
            }
            SendState::Broadcast => {
                self.broadcast(pkg).await?;
                pkg.state = SendState::WaitTxConf;
            }
            SendState::WaitTxConf => {
                // May step back to Broadcast on a reorg.
                pkg.state = self.wait_tx_conf(pkg).await?;
            }
            SendState::StoreProofs => {
                self.store_proofs(pkg).await?;
                pkg.state = SendState::ReceiverProofTransfer;
            }
            SendState::ReceiverProofTransfer => {
                self.transfer_receiver_proofs(pkg).await?;
                pkg.state = SendState::Complete;
            }
            SendState::Complete => {
                let txid = pkg
                    .outbound
                    .as_ref()
                    .map(|outbound| outbound.anchor_txid());
                if let Some(txid) = txid {
                    self.transfer_log.mark_parcel_complete(txid).await?;
                }
            }
        }
        Ok(())
    }

    /// State 1: coin-select the input commitment and lay out the virtual
    /// packet, including passive re-anchor packets.
    async fn virtual_commitment_select(
        &self,
        pkg: &mut SendPackage,
    ) -> Result<(), FreighterError> {
        let destinations = match &pkg.parcel {
            Some(Parcel::Address(parcel)) => parcel.destinations.clone(),
            _ => {
                return Err(FreighterError::InputCoinSelectInsufficient(
                    "no destinations for coin selection".into(),
                ))
            }
        };
        let first = destinations.first().ok_or_else(|| {
            FreighterError::InputCoinSelectInsufficient("empty destination set".into())
        })?;
        let asset_id = first.asset_id;
        let total: u64 = destinations.iter().map(|d| d.amount).sum();

        // Lock conflicts are transient; anything else is authoritative.
        let mut attempt = 1u32;
        let selected = loop {
            match self.coin_selector.select_commitment(asset_id, total).await {
                Ok(selected) => break selected,
                Err(FreighterError::InputLocked(reason)) => {
                    let max_attempts = self.cfg.coin_select_backoff.max_attempts.unwrap_or(1);
                    if attempt >= max_attempts {
                        return Err(FreighterError::InputLocked(reason));
                    }
                    debug!(attempt, %reason, "input locked, retrying coin selection");
                    tokio::time::sleep(self.cfg.coin_select_backoff.delay(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        };

        let input_amount = selected.input.asset.amount;
        let change_amount = input_amount.checked_sub(total).ok_or_else(|| {
            FreighterError::InputCoinSelectInsufficient(format!(
                "selected {input_amount} units, need {total}"
            ))
        })?;

        let change_internal = self
            .wallet
            .next_internal_key(self.cfg.anchor_key_family)
            .await?;
        let change_script_key = self
            .wallet
            .next_script_key(self.cfg.script_key_family)
            .await?;

        let mut outputs = vec![VOutput {
            amount: change_amount,
            output_type: OutputType::SplitRoot,
            interactive: false,
            anchor_output_index: 0,
            anchor_internal_key: change_internal.pub_key,
            anchor_key_desc: Some(change_internal),
            anchor_tapscript_sibling: None,
            script_key: change_script_key,
            asset: None,
        }];
        for (index, destination) in destinations.iter().enumerate() {
            outputs.push(VOutput {
                amount: destination.amount,
                output_type: OutputType::Simple,
                interactive: false,
                anchor_output_index: index as u32 + 1,
                anchor_internal_key: destination.anchor_internal_key,
                anchor_key_desc: None,
                anchor_tapscript_sibling: None,
                script_key: destination.script_key.clone(),
                asset: None,
            });
        }

        let packet = VPacket {
            inputs: vec![selected.input.clone()],
            outputs,
        };

        // Everything in the spent commitment that is not the active input
        // must be re-anchored to the split root.
        let active_key = selected.input.asset.asset_commitment_key();
        let active_tap_key = selected.input.asset.tap_commitment_key();
        let mut passive_packets = Vec::new();
        for asset in selected.commitment.committed_assets() {
            if asset.asset_commitment_key() == active_key
                && asset.tap_commitment_key() == active_tap_key
            {
                continue;
            }
            passive_packets.push(passive_packet_for(&selected.input, asset, &packet.outputs[0]));
        }

        info!(
            input_amount,
            num_destinations = destinations.len(),
            num_passive = passive_packets.len(),
            "selected input commitment"
        );

        pkg.packet = Some(packet);
        pkg.input_commitment = Some(selected.commitment);
        pkg.passive_packets = passive_packets;
        Ok(())
    }

    /// State 2: produce witness data for the active packet and every
    /// passive packet.
    async fn virtual_sign(&self, pkg: &mut SendPackage) -> Result<(), FreighterError> {
        let packet = pkg
            .packet
            .as_mut()
            .ok_or_else(|| FreighterError::VirtualSignFail("no packet to sign".into()))?;

        packet.prepare_output_assets()?;
        let digest = signing_digest(packet)?;
        let input_script_key = packet.inputs[0].asset.script_key.clone();
        let signature = self
            .wallet
            .sign_virtual_tx(&input_script_key, digest)
            .await
            .map_err(|e| FreighterError::VirtualSignFail(e.to_string()))?;
        let mut witness = bitcoin::Witness::new();
        witness.push(signature.as_ref());
        packet.update_transfer_witness(witness)?;

        for passive in &mut pkg.passive_packets {
            prepare_passive_asset(passive)?;
            let digest = signing_digest(passive)?;
            let script_key = passive.inputs[0].asset.script_key.clone();
            let signature = self
                .wallet
                .sign_virtual_tx(&script_key, digest)
                .await
                .map_err(|e| FreighterError::VirtualSignFail(e.to_string()))?;
            let mut witness = bitcoin::Witness::new();
            witness.push(signature.as_ref());
            passive.update_transfer_witness(witness)?;
        }

        Ok(())
    }

    /// State 3: build, fund, sign and finalize the anchor transaction.
    async fn anchor_sign(&self, pkg: &mut SendPackage) -> Result<(), FreighterError> {
        let packet = pkg
            .packet
            .as_ref()
            .ok_or_else(|| FreighterError::AnchorPsbtInvalid("no packet".into()))?;
        let commitments = output_commitments(packet, &pkg.passive_packets)?;

        let secp = Secp256k1::verification_only();
        let mut template_outputs = Vec::with_capacity(commitments.len());
        for (anchor_index, commitment) in &commitments {
            let output = packet
                .outputs
                .iter()
                .find(|output| output.anchor_output_index == *anchor_index)
                .ok_or_else(|| {
                    FreighterError::AnchorPsbtInvalid(format!(
                        "no virtual output claims anchor index {anchor_index}"
                    ))
                })?;

            let sibling_hash = output
                .anchor_tapscript_sibling
                .as_ref()
                .map(|preimage| preimage.to_tap_hash())
                .transpose()?;
            let merkle_root = commitment.tapscript_root(sibling_hash);
            let (internal_xonly, _) = output.anchor_internal_key.x_only_public_key();
            let (output_key, _) = internal_xonly.tap_tweak(&secp, Some(merkle_root));

            template_outputs.push(TxOut {
                value: Amount::from_sat(self.cfg.anchor_output_value_sats),
                script_pubkey: ScriptBuf::new_p2tr_tweaked(output_key),
            });
        }

        let template_tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: packet
                .inputs
                .iter()
                .map(|input| TxIn {
                    previous_output: input.anchor.out_point,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: bitcoin::Witness::new(),
                })
                .collect(),
            output: template_outputs,
        };

        let mut template = Psbt::from_unsigned_tx(template_tx)
            .map_err(|e| FreighterError::AnchorPsbtInvalid(e.to_string()))?;
        for (anchor_index, _) in &commitments {
            let output = packet
                .outputs
                .iter()
                .find(|output| output.anchor_output_index == *anchor_index)
                .ok_or_else(|| {
                    FreighterError::AnchorPsbtInvalid("anchor index vanished".into())
                })?;
            let (internal_xonly, _) = output.anchor_internal_key.x_only_public_key();
            if let Some(psbt_output) = template.outputs.get_mut(*anchor_index as usize) {
                psbt_output.tap_internal_key = Some(internal_xonly);
            }
        }

        let funded = self
            .wallet
            .fund_psbt(template, self.cfg.fee_rate_sat_per_kw)
            .await?;
        let chain_fees = funded.chain_fees;
        let signed = self
            .wallet
            .sign_and_finalize_psbt(funded.psbt.clone())
            .await
            .map_err(|e| FreighterError::AnchorSignFail(e.to_string()))?;
        // Fee sanity is the funding wallet's responsibility.
        let final_tx = signed.extract_tx_unchecked_fee_rate();

        pkg.anchor_tx = Some(AnchorTransaction {
            funded_psbt: funded,
            final_tx,
            chain_fees,
            output_commitments: commitments,
        });
        Ok(())
    }

    /// State 4: derive the outbound record and persist it. This is the
    /// durable checkpoint; the write runs in a blocking guard scope so a
    /// shutdown cannot tear it.
    async fn log_commit(&self, pkg: &mut SendPackage) -> Result<(), FreighterError> {
        let anchor_tx = pkg
            .anchor_tx
            .as_ref()
            .ok_or_else(|| FreighterError::AnchorSignFail("no signed anchor".into()))?;
        let packet = pkg
            .packet
            .as_ref()
            .ok_or_else(|| FreighterError::VirtualSignFail("no packet".into()))?;

        let current_height = self.chain.current_height().await?;
        let transfer_time_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        let mut local_script_keys = Vec::with_capacity(packet.outputs.len());
        for output in &packet.outputs {
            let desc = KeyDescriptor {
                family: self.cfg.script_key_family,
                index: 0,
                pub_key: output
                    .script_key
                    .raw_internal_key
                    .unwrap_or(output.script_key.pub_key),
            };
            local_script_keys.push(self.wallet.is_local_key(&desc).await);
        }

        let outbound = prepare_for_storage(
            current_height,
            transfer_time_unix,
            anchor_tx,
            packet,
            &pkg.passive_packets,
            &local_script_keys,
        )?;

        self.guard
            .ctx_blocking(self.transfer_log.log_pending_parcel(&outbound))
            .await
            .or_cancelled(|| FreighterError::Storage("log commit timed out".into()))??;

        info!(txid = %outbound.anchor_txid(), "parcel committed to disk");
        pkg.outbound = Some(outbound);
        Ok(())
    }

    /// State 5: broadcast the anchor transaction (bounded retries) and
    /// re-import the anchor outputs into the wallet.
    async fn broadcast(&self, pkg: &mut SendPackage) -> Result<(), FreighterError> {
        let outbound = pkg
            .outbound
            .as_ref()
            .ok_or_else(|| FreighterError::Storage("no outbound record".into()))?;

        let anchor_tx = outbound.anchor_tx.clone();
        let chain = Arc::clone(&self.chain);
        retry(
            self.cfg.broadcast_backoff,
            |attempt, err: &FreighterError| {
                warn!(attempt, %err, "broadcast rejected, retrying");
            },
            move || {
                let chain = Arc::clone(&chain);
                let tx = anchor_tx.clone();
                async move { chain.broadcast(&tx).await }
            },
        )
        .await
        .map_err(|e| FreighterError::BroadcastRejected(e.to_string()))?;

        let secp = Secp256k1::verification_only();
        for output in &outbound.outputs {
            let (internal_xonly, _) = output.anchor.internal_key.pub_key.x_only_public_key();
            let merkle_root = TapNodeHash::from_byte_array(output.anchor.merkle_root);
            let (tweaked, parity) = internal_xonly.tap_tweak(&secp, Some(merkle_root));
            let output_key =
                PublicKey::from_x_only_public_key(tweaked.to_x_only_public_key(), parity);
            self.wallet.import_taproot_output(output_key).await?;
        }

        info!(txid = %outbound.anchor_txid(), "anchor transaction broadcast");
        Ok(())
    }

    /// State 6: wait for confirmation; a reorg below the height hint steps
    /// the machine back to broadcast.
    async fn wait_tx_conf(&self, pkg: &mut SendPackage) -> Result<SendState, FreighterError> {
        let outbound = pkg
            .outbound
            .as_ref()
            .ok_or_else(|| FreighterError::Storage("no outbound record".into()))?;

        match self
            .chain
            .wait_for_confirmation(outbound.anchor_txid(), outbound.anchor_tx_height_hint)
            .await?
        {
            ConfirmationEvent::Confirmed(confirmation) => {
                info!(
                    txid = %outbound.anchor_txid(),
                    height = confirmation.block_height,
                    "anchor transaction confirmed"
                );
                pkg.confirmation = Some(confirmation);
                Ok(SendState::StoreProofs)
            }
            ConfirmationEvent::Reorg => {
                warn!(txid = %outbound.anchor_txid(), "reorg detected, re-broadcasting");
                Ok(SendState::Broadcast)
            }
        }
    }

    /// State 7: patch the confirmed block into every proof suffix and
    /// archive the resulting files.
    async fn store_proofs(&self, pkg: &mut SendPackage) -> Result<(), FreighterError> {
        let outbound = pkg
            .outbound
            .as_ref()
            .ok_or_else(|| FreighterError::Storage("no outbound record".into()))?;
        let confirmation = pkg
            .confirmation
            .as_ref()
            .ok_or_else(|| FreighterError::Storage("no confirmation data".into()))?;

        let mut proofs = Vec::new();
        for output in &outbound.outputs {
            if output.passive_assets_only || output.proof_suffix.is_empty() {
                continue;
            }
            let mut proof = Proof::from_bytes(&output.proof_suffix)?;
            update_transition_proof(
                &mut proof,
                confirmation.block_header,
                confirmation.block_height,
                &confirmation.block_txids,
            )?;

            let mut file = File::new();
            file.append(&proof)?;
            proofs.push(AnnotatedProof {
                script_key: output.script_key,
                out_point: output.anchor.out_point,
                file_bytes: file.to_bytes()?,
            });
        }

        for passive in &outbound.passive_assets {
            let mut proof = Proof::from_bytes(&passive.new_proof)?;
            update_transition_proof(
                &mut proof,
                confirmation.block_header,
                confirmation.block_height,
                &confirmation.block_txids,
            )?;

            let mut file = File::new();
            file.append(&proof)?;
            proofs.push(AnnotatedProof {
                script_key: passive.script_key,
                out_point: proof.out_point(),
                file_bytes: file.to_bytes()?,
            });
        }

        self.guard
            .ctx_blocking(self.proof_archive.import_proofs(&proofs))
            .await
            .or_cancelled(|| FreighterError::Storage("proof archival timed out".into()))??;

        pkg.final_proofs = proofs;
        Ok(())
    }

    /// State 8: deliver each receiver proof over an independent retry loop
    /// until confirmed received.
    async fn transfer_receiver_proofs(&self, pkg: &mut SendPackage) -> Result<(), FreighterError> {
        let outbound = pkg
            .outbound
            .as_ref()
            .ok_or_else(|| FreighterError::Storage("no outbound record".into()))?;
        let anchor_txid = outbound.anchor_txid();

        let mut deliveries = JoinSet::new();
        for output in &outbound.outputs {
            if output.script_key_is_local || output.passive_assets_only {
                continue;
            }
            let proof = pkg
                .final_proofs
                .iter()
                .find(|proof| proof.script_key == output.script_key)
                .ok_or_else(|| {
                    FreighterError::ProofDeliveryFail("missing final proof for receiver".into())
                })?
                .clone();

            let courier = Arc::clone(&self.courier);
            let transfer_log = Arc::clone(&self.transfer_log);
            let policy = self.cfg.delivery_backoff;
            deliveries.spawn(async move {
                let recipient = proof.script_key;
                let delivery_courier = Arc::clone(&courier);
                let file_bytes = proof.file_bytes.clone();
                retry(
                    policy,
                    |attempt, err: &FreighterError| {
                        warn!(attempt, %err, "proof delivery failed, retrying");
                    },
                    move || {
                        let courier = Arc::clone(&delivery_courier);
                        let file_bytes = file_bytes.clone();
                        async move { courier.deliver_proof(recipient, &file_bytes).await }
                    },
                )
                .await?;
                transfer_log
                    .confirm_proof_delivery(anchor_txid, recipient)
                    .await
            });
        }

        while let Some(result) = deliveries.join_next().await {
            result
                .map_err(|e| FreighterError::ProofDeliveryFail(e.to_string()))?
                .map_err(|e| FreighterError::ProofDeliveryFail(e.to_string()))?;
        }

        Ok(())
    }
}
