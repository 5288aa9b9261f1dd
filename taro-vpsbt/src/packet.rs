use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::secp256k1::PublicKey;
use bitcoin::OutPoint;
use serde::{Deserialize, Serialize};
use taro_asset::{Asset, PrevId, ScriptKey, SplitCommitment, Witness};
use taro_commitment::{SplitCommitmentTree, SplitLocator, TapscriptPreimage};

use crate::VPacketError;

/// A wallet key with its derivation coordinates, used to re-derive anchor
/// internal keys after a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDescriptor {
    /// The key family the key was derived under.
    pub family: u32,
    /// The index within the family.
    pub index: u32,
    /// The derived public key.
    pub pub_key: PublicKey,
}

/// The role of a virtual output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum OutputType {
    /// A plain asset output.
    Simple = 0,
    /// The output carrying the split commitment root, change and any
    /// re-anchored passive assets.
    SplitRoot = 1,
    /// An output that exists only to re-anchor passive assets.
    PassiveAssetsOnly = 2,
}

/// Where the spent asset was anchored on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputAnchor {
    /// The anchor outpoint being spent.
    pub out_point: OutPoint,
    /// The anchor output's internal key.
    pub internal_key: PublicKey,
    /// The anchor output's pk script.
    pub pk_script: Vec<u8>,
    /// Tapscript sibling of the commitment leaf, if any.
    pub tapscript_sibling: Option<TapscriptPreimage>,
    /// The anchor output's BTC value in satoshis.
    pub value: u64,
}

/// One asset input of a virtual packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VInput {
    /// The previous asset being spent.
    pub prev_id: PrevId,
    /// The full input asset.
    pub asset: Asset,
    /// On-chain anchor information for the input.
    pub anchor: InputAnchor,
}

/// One asset output of a virtual packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VOutput {
    /// Unit amount committed to this output.
    pub amount: u64,
    /// The role of this output.
    pub output_type: OutputType,
    /// True for interactive sends, where the receiver participates and no
    /// tombstone bookkeeping is required.
    pub interactive: bool,
    /// Index of the BTC-level anchor output this asset output lands on.
    pub anchor_output_index: u32,
    /// Internal key of that anchor output.
    pub anchor_internal_key: PublicKey,
    /// Derivation info for the anchor internal key, when locally derived.
    pub anchor_key_desc: Option<KeyDescriptor>,
    /// Tapscript sibling for the anchor commitment leaf, if any.
    pub anchor_tapscript_sibling: Option<TapscriptPreimage>,
    /// The script key the asset is sent to.
    pub script_key: ScriptKey,
    /// The output asset, populated by [`VPacket::prepare_output_assets`].
    pub asset: Option<Asset>,
}

impl VOutput {
    /// Returns true if this is the split root output.
    pub fn is_split_root(&self) -> bool {
        self.output_type == OutputType::SplitRoot
    }

    /// The anchor key descriptor, or a bare descriptor wrapping the
    /// internal key when no derivation info is attached.
    pub fn anchor_key_desc(&self) -> KeyDescriptor {
        self.anchor_key_desc.unwrap_or(KeyDescriptor {
            family: 0,
            index: 0,
            pub_key: self.anchor_internal_key,
        })
    }
}

/// A virtual packet: the asset-level transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VPacket {
    /// The asset inputs being spent.
    pub inputs: Vec<VInput>,
    /// The asset outputs being created.
    pub outputs: Vec<VOutput>,
}

impl VPacket {
    /// The sum of all input amounts.
    pub fn input_sum(&self) -> u64 {
        self.inputs.iter().map(|input| input.asset.amount).sum()
    }

    /// The sum of all output amounts.
    pub fn output_sum(&self) -> u64 {
        self.outputs.iter().map(|output| output.amount).sum()
    }

    /// Returns true if any output asset carries a split commitment witness.
    pub fn has_split_commitment(&self) -> bool {
        self.outputs.iter().any(|output| {
            output
                .asset
                .as_ref()
                .map(|asset| asset.has_split_commitment_witness())
                .unwrap_or(false)
        })
    }

    /// The split root output of the packet.
    pub fn split_root_output(&self) -> Result<&VOutput, VPacketError> {
        let mut roots = self.outputs.iter().filter(|output| output.is_split_root());
        let root = roots
            .next()
            .ok_or(VPacketError::SplitRootCount(0))?;
        if roots.next().is_some() {
            return Err(VPacketError::SplitRootCount(2));
        }
        Ok(root)
    }

    /// Returns true if this is an interactive full-value send: one
    /// interactive output consuming the whole input sum, needing no split.
    pub fn is_interactive_full_value(&self) -> bool {
        self.outputs.len() == 1
            && self.outputs[0].interactive
            && self.outputs[0].amount == self.input_sum()
    }

    /// Validates the packet's structural invariants.
    pub fn validate(&self) -> Result<(), VPacketError> {
        if self.inputs.is_empty() || self.outputs.is_empty() {
            return Err(VPacketError::IncompletePacket(
                "packet needs at least one input and one output".into(),
            ));
        }

        let input_sum = self.input_sum();
        let output_sum = self.output_sum();
        if input_sum != output_sum {
            return Err(VPacketError::AmountMismatch {
                input_sum,
                output_sum,
            });
        }

        // Exactly one split root, except for interactive full-value sends.
        let split_roots = self
            .outputs
            .iter()
            .filter(|output| output.is_split_root())
            .count();
        if self.is_interactive_full_value() {
            if split_roots > 1 {
                return Err(VPacketError::SplitRootCount(split_roots));
            }
        } else if split_roots != 1 {
            return Err(VPacketError::SplitRootCount(split_roots));
        }

        // At most one active asset output per anchor index; co-located
        // outputs must be passive-only.
        let mut active_indexes = std::collections::BTreeSet::new();
        for output in &self.outputs {
            if output.output_type == OutputType::PassiveAssetsOnly {
                continue;
            }
            if !active_indexes.insert(output.anchor_output_index) {
                return Err(VPacketError::DuplicateAnchorIndex(
                    output.anchor_output_index,
                ));
            }
        }

        Ok(())
    }

    /// Populates every output's asset, constructing the split commitment
    /// when the transfer is not an interactive full-value send.
    ///
    /// The split root output receives a copy of the input asset carrying
    /// the transfer witness and the split commitment root; every other
    /// output receives a split asset whose witness embeds its inclusion
    /// proof in that root.
    pub fn prepare_output_assets(&mut self) -> Result<(), VPacketError> {
        self.validate()?;

        let input = self
            .inputs
            .first()
            .ok_or_else(|| VPacketError::IncompletePacket("no inputs".into()))?
            .clone();

        let transfer_witness = Witness {
            prev_id: Some(input.prev_id),
            tx_witness: bitcoin::Witness::new(),
            split_commitment: None,
        };

        if self.is_interactive_full_value() {
            let output = &mut self.outputs[0];
            let mut asset = input.asset.clone();
            asset.amount = output.amount;
            asset.script_key = output.script_key.clone();
            asset.prev_witnesses = vec![transfer_witness];
            asset.split_commitment_root = None;
            output.asset = Some(asset);
            return Ok(());
        }

        // Non-interactive sends leaving no change still need the split
        // root: a zero-amount tombstone keeps the split structure provable.
        let root_index = self
            .outputs
            .iter()
            .position(|output| output.is_split_root())
            .ok_or(VPacketError::SplitRootCount(0))?;
        if self.outputs[root_index].amount == 0 && !self.outputs[root_index].interactive {
            self.outputs[root_index].script_key = ScriptKey::tombstone();
        }

        // Build every split output's bare asset first.
        let mut split_parts: Vec<(usize, SplitLocator, Asset)> = Vec::new();
        for (index, output) in self.outputs.iter().enumerate() {
            if index == root_index {
                continue;
            }
            let mut split_asset = input.asset.clone();
            split_asset.amount = output.amount;
            split_asset.script_key = output.script_key.clone();
            split_asset.prev_witnesses = vec![Witness {
                prev_id: Some(input.prev_id),
                tx_witness: bitcoin::Witness::new(),
                split_commitment: None,
            }];
            split_asset.split_commitment_root = None;

            let locator = SplitLocator {
                output_index: output.anchor_output_index,
                asset_id: split_asset.id(),
                script_key: split_asset.script_key.serialize(),
                amount: split_asset.amount,
            };
            split_parts.push((index, locator, split_asset));
        }

        let tree =
            SplitCommitmentTree::new(split_parts.iter().map(|(_, loc, asset)| (loc, asset)))?;

        // The root asset: the input asset re-keyed to the change script
        // key, carrying the transfer witness and the split root.
        let mut root_asset = input.asset.clone();
        root_asset.amount = self.outputs[root_index].amount;
        root_asset.script_key = self.outputs[root_index].script_key.clone();
        root_asset.prev_witnesses = vec![transfer_witness];
        root_asset.split_commitment_root = Some(tree.root());
        self.outputs[root_index].asset = Some(root_asset.clone());

        // Attach each split output's proof and the root asset.
        for (index, locator, mut split_asset) in split_parts {
            let proof = tree.proof(&locator)?;
            split_asset.prev_witnesses[0].split_commitment = Some(SplitCommitment {
                proof,
                root_asset: Box::new(root_asset.clone()),
            });
            self.outputs[index].asset = Some(split_asset);
        }

        Ok(())
    }
}

impl VPacket {
    /// Attaches the signed transfer witness to every output asset. The
    /// split outputs embed a copy of the root asset, so their copies are
    /// refreshed with the updated witness as well.
    pub fn update_transfer_witness(
        &mut self,
        tx_witness: bitcoin::Witness,
    ) -> Result<(), VPacketError> {
        if self.is_interactive_full_value() {
            let asset = self.outputs[0]
                .asset
                .as_mut()
                .ok_or(VPacketError::MissingAsset(0))?;
            if let Some(witness) = asset.prev_witnesses.first_mut() {
                witness.tx_witness = tx_witness;
            }
            return Ok(());
        }

        let root_index = self
            .outputs
            .iter()
            .position(|output| output.is_split_root())
            .ok_or(VPacketError::SplitRootCount(0))?;

        let root_asset = {
            let asset = self.outputs[root_index]
                .asset
                .as_mut()
                .ok_or(VPacketError::MissingAsset(root_index))?;
            if let Some(witness) = asset.prev_witnesses.first_mut() {
                witness.tx_witness = tx_witness;
            }
            asset.clone()
        };

        for (index, output) in self.outputs.iter_mut().enumerate() {
            if index == root_index {
                continue;
            }
            let asset = output
                .asset
                .as_mut()
                .ok_or(VPacketError::MissingAsset(index))?;
            for witness in &mut asset.prev_witnesses {
                if let Some(split) = witness.split_commitment.as_mut() {
                    split.root_asset = Box::new(root_asset.clone());
                }
            }
        }

        Ok(())
    }
}

/// The digest a virtual input's transfer witness signs: commits to the
/// spent asset and the full output set.
pub fn signing_digest(packet: &VPacket) -> Result<[u8; 32], VPacketError> {
    let input = packet
        .inputs
        .first()
        .ok_or_else(|| VPacketError::IncompletePacket("no inputs".into()))?;

    let mut engine = sha256::Hash::engine();
    engine.input(&bitcoin::consensus::encode::serialize(
        &input.prev_id.out_point,
    ));
    engine.input(input.prev_id.asset_id.as_ref());
    engine.input(&input.prev_id.script_key.bytes);
    for output in &packet.outputs {
        engine.input(&output.anchor_output_index.to_be_bytes());
        engine.input(&output.amount.to_be_bytes());
        engine.input(&output.script_key.serialize().bytes);
    }
    Ok(sha256::Hash::from_engine(engine).to_byte_array())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};
    use taro_asset::{AssetType, Genesis};

    fn key(byte: u8) -> PublicKey {
        let secp = Secp256k1::new();
        SecretKey::from_slice(&[byte; 32]).unwrap().public_key(&secp)
    }

    fn input_asset(amount: u64) -> Asset {
        Asset::new_genesis(
            Genesis {
                first_prev_out: OutPoint::null(),
                tag: "vpsbt".into(),
                meta_hash: sha256::Hash::hash(b"vpsbt"),
                output_index: 0,
                asset_type: AssetType::Normal,
            },
            amount,
            ScriptKey::new(key(1)),
            None,
        )
        .unwrap()
    }

    fn input(amount: u64) -> VInput {
        let asset = input_asset(amount);
        VInput {
            prev_id: PrevId {
                out_point: OutPoint::null(),
                asset_id: asset.id(),
                script_key: asset.script_key.serialize(),
            },
            anchor: InputAnchor {
                out_point: OutPoint::null(),
                internal_key: key(9),
                pk_script: vec![0x51],
                tapscript_sibling: None,
                value: 1_000,
            },
            asset,
        }
    }

    fn output(
        amount: u64,
        output_type: OutputType,
        interactive: bool,
        anchor_index: u32,
        key_byte: u8,
    ) -> VOutput {
        VOutput {
            amount,
            output_type,
            interactive,
            anchor_output_index: anchor_index,
            anchor_internal_key: key(key_byte),
            anchor_key_desc: None,
            anchor_tapscript_sibling: None,
            script_key: ScriptKey::new(key(key_byte + 1)),
            asset: None,
        }
    }

    fn split_packet() -> VPacket {
        VPacket {
            inputs: vec![input(1_000)],
            outputs: vec![
                output(600, OutputType::SplitRoot, false, 0, 10),
                output(400, OutputType::Simple, false, 1, 20),
            ],
        }
    }

    #[test]
    fn amount_balance_enforced() {
        let mut packet = split_packet();
        packet.outputs[1].amount = 399;
        assert!(matches!(
            packet.validate(),
            Err(VPacketError::AmountMismatch { .. })
        ));
    }

    #[test]
    fn split_root_required_for_non_interactive() {
        let mut packet = split_packet();
        packet.outputs[0].output_type = OutputType::Simple;
        assert!(matches!(
            packet.validate(),
            Err(VPacketError::SplitRootCount(0))
        ));
    }

    #[test]
    fn duplicate_active_anchor_index_rejected() {
        let mut packet = split_packet();
        packet.outputs[1].anchor_output_index = 0;
        assert!(matches!(
            packet.validate(),
            Err(VPacketError::DuplicateAnchorIndex(0))
        ));

        // Passive-only outputs may share an anchor index.
        packet.outputs[1].output_type = OutputType::PassiveAssetsOnly;
        packet.validate().unwrap();
    }

    #[test]
    fn prepare_builds_split_commitment() {
        let mut packet = split_packet();
        packet.prepare_output_assets().unwrap();

        assert!(packet.has_split_commitment());

        let root_asset = packet.outputs[0].asset.as_ref().unwrap();
        let split_root = root_asset.split_commitment_root.unwrap();
        assert_eq!(split_root.sum, 400, "only non-root outputs enter the tree");

        // The receiver output proof verifies against the split root.
        let receiver = packet.outputs[1].asset.as_ref().unwrap();
        let split = receiver.prev_witnesses[0].split_commitment.as_ref().unwrap();
        let locator = SplitLocator {
            output_index: packet.outputs[1].anchor_output_index,
            asset_id: receiver.id(),
            script_key: receiver.script_key.serialize(),
            amount: receiver.amount,
        };
        let leaf = taro_commitment::split_leaf(receiver).unwrap();
        assert!(split.proof.verify(&locator.key(), &leaf, &split_root));

        // Sum preservation across the packet.
        assert_eq!(packet.input_sum(), packet.output_sum());
    }

    #[test]
    fn interactive_full_value_has_no_split() {
        let mut packet = VPacket {
            inputs: vec![input(500)],
            outputs: vec![output(500, OutputType::Simple, true, 0, 10)],
        };
        packet.prepare_output_assets().unwrap();

        assert!(!packet.has_split_commitment());
        let asset = packet.outputs[0].asset.as_ref().unwrap();
        assert!(asset.split_commitment_root.is_none());
        assert_eq!(asset.amount, 500);
        assert!(!asset.script_key.is_tombstone());
    }

    #[test]
    fn zero_change_root_becomes_tombstone() {
        let mut packet = VPacket {
            inputs: vec![input(1_000)],
            outputs: vec![
                output(0, OutputType::SplitRoot, false, 0, 10),
                output(1_000, OutputType::Simple, false, 1, 20),
            ],
        };
        packet.prepare_output_assets().unwrap();

        let root_asset = packet.outputs[0].asset.as_ref().unwrap();
        assert_eq!(root_asset.amount, 0);
        assert!(root_asset.script_key.is_tombstone());
    }

    #[test]
    fn signing_digest_commits_to_outputs() {
        let mut packet = split_packet();
        let before = signing_digest(&packet).unwrap();
        packet.outputs[1].amount += 1;
        assert_ne!(before, signing_digest(&packet).unwrap());
    }
}
