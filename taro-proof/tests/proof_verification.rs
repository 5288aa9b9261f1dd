//! End-to-end proof tests: mint an asset, commit it to a taproot output,
//! assemble the transition proof and verify it against a mock chain oracle.

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::block::{Header, Version as BlockVersion};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::key::TapTweak;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, BlockHash, CompactTarget, OutPoint, ScriptBuf, Sequence, Transaction, TxIn,
    TxMerkleNode, TxOut, Txid, Witness,
};
use taro_asset::{Asset, AssetType, Genesis, ScriptKey};
use taro_commitment::TapCommitment;
use taro_proof::{
    create_transition_proof, update_transition_proof, verify_proof, ChainLookup, Proof,
    ProofError, TaprootProof, TapscriptProof, TransitionParams,
};

struct MockChain {
    confirmed_height: u32,
}

#[async_trait]
impl ChainLookup for MockChain {
    async fn tx_block_height(&self, _txid: Txid) -> Result<u32, ProofError> {
        Ok(self.confirmed_height)
    }

    async fn mean_block_timestamp(&self, _height: u32) -> Result<u64, ProofError> {
        Ok(1_000)
    }

    async fn current_height(&self) -> Result<u32, ProofError> {
        Ok(self.confirmed_height + 6)
    }
}

fn secret_key(byte: u8) -> SecretKey {
    SecretKey::from_slice(&[byte; 32]).unwrap()
}

fn key_pair(byte: u8) -> (SecretKey, PublicKey) {
    let secp = Secp256k1::new();
    let secret = secret_key(byte);
    (secret, secret.public_key(&secp))
}

fn p2tr_script(internal_key: &PublicKey, merkle_root: Option<bitcoin::TapNodeHash>) -> ScriptBuf {
    let secp = Secp256k1::new();
    let (xonly, _) = internal_key.x_only_public_key();
    let (tweaked, _) = xonly.tap_tweak(&secp, merkle_root);
    ScriptBuf::new_p2tr_tweaked(tweaked)
}

fn genesis_prev_out() -> OutPoint {
    OutPoint {
        txid: Txid::from_byte_array(sha256::Hash::hash(b"funding").to_byte_array()),
        vout: 0,
    }
}

fn mint_asset(amount: u64, script_key_byte: u8) -> Asset {
    let (_, script_pub) = key_pair(script_key_byte);
    Asset::new_genesis(
        Genesis {
            first_prev_out: genesis_prev_out(),
            tag: "integration".into(),
            meta_hash: sha256::Hash::hash(b"meta"),
            output_index: 0,
            asset_type: AssetType::Normal,
        },
        amount,
        ScriptKey::new(script_pub),
        None,
    )
    .unwrap()
}

/// Builds the anchor transaction plus the proof suffix for a freshly minted
/// asset, optionally with extra outputs.
fn build_proof(asset: &Asset, extra_outputs: Vec<TxOut>) -> (Proof, TapCommitment) {
    let commitment = TapCommitment::from_assets([asset.clone()]).unwrap();
    let (_, internal_key) = key_pair(0x21);

    let mut outputs = vec![TxOut {
        value: Amount::from_sat(1_000),
        script_pubkey: p2tr_script(&internal_key, Some(commitment.tapscript_root(None))),
    }];
    outputs.extend(extra_outputs);

    let anchor_tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: genesis_prev_out(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: outputs,
    };

    let params = TransitionParams {
        anchor_tx: anchor_tx.clone(),
        output_index: 0,
        internal_key,
        tap_commitment: commitment.clone(),
        tapscript_sibling: None,
        new_asset: asset.clone(),
        exclusion_proofs: Vec::new(),
        split_root: None,
    };

    let mut proof = create_transition_proof(genesis_prev_out(), &params).unwrap();

    // "Confirm" the anchor transaction in a single-transaction block.
    let txid = anchor_tx.compute_txid();
    let header = Header {
        version: BlockVersion::TWO,
        prev_blockhash: BlockHash::all_zeros(),
        merkle_root: TxMerkleNode::from_byte_array(txid.to_byte_array()),
        time: 2_000,
        bits: CompactTarget::from_consensus(0x207fffff),
        nonce: 7,
    };
    update_transition_proof(&mut proof, header, 100, &[txid]).unwrap();

    (proof, commitment)
}

#[tokio::test]
async fn mint_and_verify() {
    let asset = mint_asset(1_000, 0x01);
    let (proof, commitment) = build_proof(&asset, vec![]);

    let chain = MockChain {
        confirmed_height: 100,
    };
    let verified = verify_proof(&proof, None, &chain).await.unwrap();

    assert_eq!(verified.amount, 1_000);
    assert_eq!(commitment.root().sum, 1_000);
}

#[tokio::test]
async fn wrong_height_is_a_block_mismatch() {
    let asset = mint_asset(1_000, 0x01);
    let (proof, _) = build_proof(&asset, vec![]);

    let chain = MockChain {
        confirmed_height: 99,
    };
    assert!(matches!(
        verify_proof(&proof, None, &chain).await,
        Err(ProofError::BlockMismatch(_))
    ));
}

#[tokio::test]
async fn tampered_anchor_output_rejected() {
    let asset = mint_asset(1_000, 0x01);
    let (mut proof, _) = build_proof(&asset, vec![]);

    // Swap the anchor output for an unrelated key and rebind the block so
    // only the anchor check can fail.
    let (_, other_key) = key_pair(0x33);
    proof.anchor_tx.output[0].script_pubkey = p2tr_script(&other_key, None);
    let txid = proof.anchor_tx.compute_txid();
    proof.block_header.merkle_root = TxMerkleNode::from_byte_array(txid.to_byte_array());

    let chain = MockChain {
        confirmed_height: 100,
    };
    assert!(matches!(
        verify_proof(&proof, None, &chain).await,
        Err(ProofError::AnchorMismatch(_))
    ));
}

#[tokio::test]
async fn unproven_taproot_output_fails_exclusion() {
    let asset = mint_asset(1_000, 0x01);
    let (_, change_key) = key_pair(0x44);
    let change = TxOut {
        value: Amount::from_sat(5_000),
        script_pubkey: p2tr_script(&change_key, None),
    };
    let (mut proof, _) = build_proof(&asset, vec![change]);

    let chain = MockChain {
        confirmed_height: 100,
    };
    assert!(matches!(
        verify_proof(&proof, None, &chain).await,
        Err(ProofError::ExclusionFail(_))
    ));

    // A BIP-86 exclusion proof for the change output fixes it.
    proof.exclusion_proofs.push(TaprootProof {
        output_index: 1,
        internal_key: change_key,
        commitment_proof: None,
        tapscript_proof: Some(TapscriptProof {
            tap_preimage1: None,
            tap_preimage2: None,
            bip86: true,
        }),
    });
    verify_proof(&proof, None, &chain).await.unwrap();
}

#[tokio::test]
async fn grouped_genesis_requires_valid_group_signature() {
    use bitcoin::secp256k1::Scalar;
    use taro_asset::{
        genesis_tx_digest, GenesisTxBuilder, GroupKey, VirtualGenesisTxBuilder,
    };

    let secp = Secp256k1::new();
    let genesis = Genesis {
        first_prev_out: genesis_prev_out(),
        tag: "grouped".into(),
        meta_hash: sha256::Hash::hash(b"meta"),
        output_index: 0,
        asset_type: AssetType::Normal,
    };

    // Derive the tweaked group secret alongside the public derivation.
    let raw_secret = secret_key(0x51);
    let raw_key = raw_secret.public_key(&secp);
    let tweak = Scalar::from_be_bytes(genesis.asset_id().to_byte_array()).unwrap();
    let group_secret = raw_secret.add_tweak(&tweak).unwrap();
    let group_pub_key = GroupKey::derive(raw_key, &genesis).unwrap();
    assert_eq!(group_secret.public_key(&secp), group_pub_key);

    let (_, script_pub) = key_pair(0x01);
    let mut asset = Asset::new_genesis(
        genesis,
        1_000,
        ScriptKey::new(script_pub),
        Some(GroupKey {
            raw_key,
            group_pub_key,
            witness: bitcoin::Witness::new(),
        }),
    )
    .unwrap();

    // Sign the deterministic virtual genesis transaction.
    let (tx, prev_out) = VirtualGenesisTxBuilder.build_genesis_tx(&asset).unwrap();
    let digest = genesis_tx_digest(&tx, &prev_out).unwrap();
    let keypair = bitcoin::secp256k1::Keypair::from_secret_key(&secp, &group_secret);
    let signature = secp.sign_schnorr_no_aux_rand(&digest, &keypair);
    let mut witness = bitcoin::Witness::new();
    witness.push(signature.as_ref());
    if let Some(group) = asset.group_key.as_mut() {
        group.witness = witness;
    }

    let (proof, _) = build_proof(&asset, vec![]);
    let chain = MockChain {
        confirmed_height: 100,
    };
    verify_proof(&proof, None, &chain).await.unwrap();

    // A signature by the wrong key is rejected. The witness is part of the
    // committed leaf, so the forged proof is rebuilt around the forged
    // asset to keep the inclusion proof consistent.
    let wrong_keypair =
        bitcoin::secp256k1::Keypair::from_secret_key(&secp, &secret_key(0x52));
    let forged_sig = secp.sign_schnorr_no_aux_rand(&digest, &wrong_keypair);
    let mut forged_witness = bitcoin::Witness::new();
    forged_witness.push(forged_sig.as_ref());
    let mut forged_asset = asset.clone();
    if let Some(group) = forged_asset.group_key.as_mut() {
        group.witness = forged_witness;
    }
    let (forged_proof, _) = build_proof(&forged_asset, vec![]);
    assert!(matches!(
        verify_proof(&forged_proof, None, &chain).await,
        Err(ProofError::GroupSigInvalid)
    ));
}

#[test]
fn ownership_proof_requires_challenge_signature() {
    use taro_proof::{ownership_challenge_digest, verify_ownership_proof};

    let secp = Secp256k1::new();
    let owner_secret = secret_key(0x01);
    let asset = mint_asset(1_000, 0x01);
    let (mut proof, _) = build_proof(&asset, vec![]);

    // Without a witness the proof is rejected outright.
    assert!(verify_ownership_proof(&proof, None).is_err());

    let digest = ownership_challenge_digest(&asset);
    let keypair = bitcoin::secp256k1::Keypair::from_secret_key(&secp, &owner_secret);
    let signature =
        secp.sign_schnorr_no_aux_rand(&Message::from_digest(digest), &keypair);
    let mut witness = bitcoin::Witness::new();
    witness.push(signature.as_ref());
    proof.challenge_witness = Some(witness);

    verify_ownership_proof(&proof, None).unwrap();

    // A signature from a different key does not prove ownership.
    let other = bitcoin::secp256k1::Keypair::from_secret_key(&secp, &secret_key(0x33));
    let forged = secp.sign_schnorr_no_aux_rand(&Message::from_digest(digest), &other);
    let mut forged_witness = bitcoin::Witness::new();
    forged_witness.push(forged.as_ref());
    proof.challenge_witness = Some(forged_witness);
    assert!(verify_ownership_proof(&proof, None).is_err());
}

#[tokio::test]
async fn proof_encoding_round_trip() {
    let asset = mint_asset(1_000, 0x01);
    let (proof, _) = build_proof(&asset, vec![]);

    let bytes = proof.to_bytes().unwrap();
    let decoded = Proof::from_bytes(&bytes).unwrap();
    assert_eq!(decoded, proof);

    let mut file = taro_proof::File::new();
    file.append(&proof).unwrap();
    let decoded_file = taro_proof::File::from_bytes(&file.to_bytes().unwrap()).unwrap();
    assert_eq!(decoded_file.last_proof().unwrap(), proof);
}
