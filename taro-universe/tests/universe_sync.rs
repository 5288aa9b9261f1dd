//! Universe tests: leaf insertion with verification, root authentication,
//! batch semantics, federation sync convergence and the proof-sync log.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::block::{Header, Version as BlockVersion};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::key::TapTweak;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, BlockHash, CompactTarget, OutPoint, ScriptBuf, Sequence, Transaction, TxIn,
    TxMerkleNode, TxOut, Txid, Witness,
};
use taro_asset::{Asset, AssetType, Genesis, ScriptKey};
use taro_commitment::TapCommitment;
use taro_proof::{
    create_transition_proof, update_transition_proof, ChainLookup, ProofError, TransitionParams,
};
use taro_universe::{
    FederationEnvoy, FederationEnvoyConfig, FederationProofSyncLog, GlobalSyncConfig, Identifier,
    Leaf, LeafKey, MemMultiverse, MemProofSyncLog, MultiverseArchive, ProofSyncStatus, ProofType,
    RemoteUniverse, ServerAddr, SyncConfigs, SyncDirection, SyncType, TreePrefix, UniverseConfig,
    UniverseError, UniverseProof, UniverseScope, UniverseSyncer, UpsertItem,
};

struct MockChain;

#[async_trait]
impl ChainLookup for MockChain {
    async fn tx_block_height(&self, _txid: Txid) -> Result<u32, ProofError> {
        Ok(101)
    }

    async fn mean_block_timestamp(&self, _height: u32) -> Result<u64, ProofError> {
        Ok(1_000)
    }

    async fn current_height(&self) -> Result<u32, ProofError> {
        Ok(106)
    }
}

fn pubkey(byte: u8) -> PublicKey {
    let secp = Secp256k1::new();
    SecretKey::from_slice(&[byte; 32]).unwrap().public_key(&secp)
}

/// Builds a fully verifiable issuance leaf: a genesis asset committed to a
/// single-output anchor transaction confirmed in a synthetic block.
fn issuance_leaf(tag: &str, amount: u64, key_byte: u8) -> (Identifier, LeafKey, Leaf) {
    issuance_leaf_with_nonce(tag, amount, key_byte, 0)
}

/// Same, with a chosen block header nonce. The nonce changes neither the
/// anchor outpoint nor the script key, so two leaves built with different
/// nonces occupy the same universe key with different contents.
fn issuance_leaf_with_nonce(
    tag: &str,
    amount: u64,
    key_byte: u8,
    nonce: u32,
) -> (Identifier, LeafKey, Leaf) {
    let genesis_prev_out = OutPoint {
        txid: Txid::from_byte_array(sha256::Hash::hash(tag.as_bytes()).to_byte_array()),
        vout: 0,
    };
    let asset = Asset::new_genesis(
        Genesis {
            first_prev_out: genesis_prev_out,
            tag: tag.into(),
            meta_hash: sha256::Hash::hash(tag.as_bytes()),
            output_index: 0,
            asset_type: AssetType::Normal,
        },
        amount,
        ScriptKey::new(pubkey(key_byte)),
        None,
    )
    .unwrap();

    let commitment = TapCommitment::from_assets([asset.clone()]).unwrap();
    let internal_key = pubkey(key_byte.wrapping_add(1));
    let secp = Secp256k1::new();
    let (internal_xonly, _) = internal_key.x_only_public_key();
    let (output_key, _) =
        internal_xonly.tap_tweak(&secp, Some(commitment.tapscript_root(None)));

    let anchor_tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: genesis_prev_out,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(1_000),
            script_pubkey: ScriptBuf::new_p2tr_tweaked(output_key),
        }],
    };

    let params = TransitionParams {
        anchor_tx: anchor_tx.clone(),
        output_index: 0,
        internal_key,
        tap_commitment: commitment,
        tapscript_sibling: None,
        new_asset: asset.clone(),
        exclusion_proofs: Vec::new(),
        split_root: None,
    };
    let mut proof = create_transition_proof(genesis_prev_out, &params).unwrap();

    let txid = anchor_tx.compute_txid();
    let header = Header {
        version: BlockVersion::TWO,
        prev_blockhash: BlockHash::all_zeros(),
        merkle_root: TxMerkleNode::from_byte_array(txid.to_byte_array()),
        time: 2_000,
        bits: CompactTarget::from_consensus(0x207fffff),
        nonce,
    };
    update_transition_proof(&mut proof, header, 101, &[txid]).unwrap();

    let id = Identifier {
        scope: UniverseScope::AssetId(asset.id()),
        proof_type: ProofType::Issuance,
    };
    let key = LeafKey::Base {
        out_point: OutPoint { txid, vout: 0 },
        script_key: asset.script_key.serialize(),
    };
    let leaf = Leaf {
        genesis_with_group: taro_universe::GenesisWithGroup {
            genesis: asset.genesis.clone(),
            group_key: None,
        },
        raw_proof: proof.to_bytes().unwrap(),
        amount: asset.amount,
        asset,
        is_burn: false,
    };

    (id, key, leaf)
}

fn new_node() -> Arc<MemMultiverse> {
    Arc::new(MemMultiverse::new(
        UniverseConfig::default(),
        Arc::new(MockChain),
    ))
}

/// Lets one archive act as another node's remote peer.
struct RemoteNode(Arc<MemMultiverse>);

#[async_trait]
impl RemoteUniverse for RemoteNode {
    async fn universe_root(
        &self,
        id: &Identifier,
    ) -> Result<Option<taro_mssmt::ComputedNode>, UniverseError> {
        self.0.universe_root(id).await
    }

    async fn universe_subtree_root(
        &self,
        id: &Identifier,
        prefix: TreePrefix,
    ) -> Result<taro_mssmt::ComputedNode, UniverseError> {
        self.0.universe_subtree_root(id, prefix).await
    }

    async fn universe_subtree_keys(
        &self,
        id: &Identifier,
        prefix: TreePrefix,
    ) -> Result<Vec<LeafKey>, UniverseError> {
        self.0.universe_subtree_keys(id, prefix).await
    }

    async fn universe_leaf_keys(
        &self,
        id: &Identifier,
        offset: usize,
        page_size: usize,
    ) -> Result<Vec<LeafKey>, UniverseError> {
        match self.0.universe_leaf_keys(id, offset, page_size).await {
            Err(UniverseError::NoUniverseRoot) => Ok(Vec::new()),
            other => other,
        }
    }

    async fn fetch_proof_leaf(
        &self,
        id: &Identifier,
        key: &LeafKey,
    ) -> Result<UniverseProof, UniverseError> {
        self.0.fetch_proof_leaf(id, key).await
    }

    async fn push_proof_leaf(
        &self,
        id: &Identifier,
        key: &LeafKey,
        leaf: &Leaf,
    ) -> Result<(), UniverseError> {
        self.0
            .upsert_proof_leaf(*id, *key, leaf.clone(), None)
            .await
            .map(|_| ())
    }
}

#[tokio::test]
async fn upsert_returns_verifiable_proofs() {
    let node = new_node();
    let (id, key, leaf) = issuance_leaf("mint", 1_000, 0x10);

    let proof = node
        .upsert_proof_leaf(id, key, leaf, None)
        .await
        .unwrap();

    // Issuance leaves sum their amount into the universe root.
    let root = node.universe_root(&id).await.unwrap().unwrap();
    assert_eq!(root.sum, 1_000);
    assert!(proof.verify_root(root));

    let multiverse_root = node
        .multiverse_root(ProofType::Issuance)
        .await
        .unwrap()
        .unwrap();
    assert!(proof.verify_multiverse_root(&id, multiverse_root));

    // A different root must not authenticate.
    let mut wrong = root;
    wrong.sum += 1;
    assert!(!proof.verify_root(wrong));
}

#[tokio::test]
async fn proof_type_mismatch_rejected() {
    let node = new_node();
    let (id, key, leaf) = issuance_leaf("mismatch", 5, 0x12);

    let wrong_id = Identifier {
        scope: id.scope,
        proof_type: ProofType::Transfer,
    };
    let err = node
        .upsert_proof_leaf(wrong_id, key, leaf, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        UniverseError::SyncProofTypeMismatch {
            expected: ProofType::Transfer,
            actual: ProofType::Issuance,
        }
    ));
}

#[tokio::test]
async fn tampered_leaf_rejected() {
    let node = new_node();
    let (id, key, mut leaf) = issuance_leaf("tamper", 5, 0x13);
    leaf.raw_proof[40] ^= 0xFF;

    assert!(node.upsert_proof_leaf(id, key, leaf, None).await.is_err());
}

#[tokio::test]
async fn batch_upsert_matches_sequential() {
    let leaves: Vec<_> = [("b1", 10, 0x20), ("b2", 20, 0x22), ("b3", 30, 0x24)]
        .into_iter()
        .map(|(tag, amount, byte)| issuance_leaf(tag, amount, byte))
        .collect();

    let sequential = new_node();
    for (id, key, leaf) in &leaves {
        sequential
            .upsert_proof_leaf(*id, *key, leaf.clone(), None)
            .await
            .unwrap();
    }

    let batched = new_node();
    batched
        .upsert_proof_leaf_batch(
            leaves
                .iter()
                .map(|(id, key, leaf)| UpsertItem {
                    id: *id,
                    key: *key,
                    leaf: leaf.clone(),
                    meta_reveal: None,
                })
                .collect(),
        )
        .await
        .unwrap();

    for (id, _, _) in &leaves {
        assert_eq!(
            sequential.universe_root(id).await.unwrap(),
            batched.universe_root(id).await.unwrap(),
        );
    }
    assert_eq!(
        sequential.multiverse_root(ProofType::Issuance).await.unwrap(),
        batched.multiverse_root(ProofType::Issuance).await.unwrap(),
    );
}

#[tokio::test]
async fn bidirectional_sync_converges() {
    // L1 and L2 live on node A; L2 and L3 on node B. The three leaves
    // share one universe (same asset id requires same genesis), so build
    // them from the same asset tag with different script keys.
    let (id, key1, leaf1) = issuance_leaf("shared", 100, 0x30);
    let (_, key2, leaf2) = issuance_leaf("shared", 100, 0x32);
    let (_, key3, leaf3) = issuance_leaf("shared", 100, 0x34);

    let node_a = new_node();
    let node_b = new_node();
    for (key, leaf) in [(key1, &leaf1), (key2, &leaf2)] {
        node_a
            .upsert_proof_leaf(id, key, leaf.clone(), None)
            .await
            .unwrap();
    }
    for (key, leaf) in [(key2, &leaf2), (key3, &leaf3)] {
        node_b
            .upsert_proof_leaf(id, key, leaf.clone(), None)
            .await
            .unwrap();
    }

    let configs = SyncConfigs::default();
    let syncer_a = UniverseSyncer::new(node_a.clone() as Arc<dyn MultiverseArchive>);
    let syncer_b = UniverseSyncer::new(node_b.clone() as Arc<dyn MultiverseArchive>);

    // A pulls from B, then B pulls from A.
    let diffs = syncer_a
        .sync_universe(&RemoteNode(node_b.clone()), SyncType::Full, &configs, &[id])
        .await
        .unwrap();
    assert_eq!(diffs.len(), 1);
    assert_eq!(diffs[0].new_leaf_count, 1);

    syncer_b
        .sync_universe(&RemoteNode(node_a.clone()), SyncType::Full, &configs, &[id])
        .await
        .unwrap();

    // Both nodes converge on the {L1, L2, L3} root.
    let root_a = node_a.universe_root(&id).await.unwrap().unwrap();
    let root_b = node_b.universe_root(&id).await.unwrap().unwrap();
    assert_eq!(root_a, root_b);
    assert_eq!(root_a.sum, 300);

    // Insertion-order independence: a fresh node with all three leaves
    // reaches the same root.
    let reference = new_node();
    for (key, leaf) in [(key3, &leaf3), (key1, &leaf1), (key2, &leaf2)] {
        reference
            .upsert_proof_leaf(id, key, leaf.clone(), None)
            .await
            .unwrap();
    }
    assert_eq!(
        reference.universe_root(&id).await.unwrap().unwrap(),
        root_a
    );

    // Re-running the sync is a no-op: roots already match.
    let diffs = syncer_a
        .sync_universe(&RemoteNode(node_b.clone()), SyncType::Full, &configs, &[id])
        .await
        .unwrap();
    assert!(diffs.is_empty());
}

#[tokio::test]
async fn sync_config_gates_insert() {
    let (id, key, leaf) = issuance_leaf("gated", 50, 0x40);

    let node_a = new_node();
    let node_b = new_node();
    node_b.upsert_proof_leaf(id, key, leaf, None).await.unwrap();

    let configs = SyncConfigs {
        global: vec![GlobalSyncConfig {
            proof_type: ProofType::Issuance,
            allow_sync_insert: false,
            allow_sync_export: true,
        }],
        per_universe: vec![],
    };

    let syncer = UniverseSyncer::new(node_a.clone() as Arc<dyn MultiverseArchive>);
    let diffs = syncer
        .sync_universe(&RemoteNode(node_b.clone()), SyncType::Full, &configs, &[id])
        .await
        .unwrap();
    assert!(diffs.is_empty());
    assert!(node_a.universe_root(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn issuance_sync_skips_transfer_universes() {
    let (issuance_id, key, leaf) = issuance_leaf("modes", 50, 0x42);
    let transfer_id = Identifier {
        scope: issuance_id.scope,
        proof_type: ProofType::Transfer,
    };

    let node_a = new_node();
    let node_b = new_node();
    node_b
        .upsert_proof_leaf(issuance_id, key, leaf, None)
        .await
        .unwrap();

    let syncer = UniverseSyncer::new(node_a.clone() as Arc<dyn MultiverseArchive>);
    let diffs = syncer
        .sync_universe(
            &RemoteNode(node_b.clone()),
            SyncType::Issuance,
            &SyncConfigs::default(),
            &[issuance_id, transfer_id],
        )
        .await
        .unwrap();
    assert_eq!(diffs.len(), 1);
    assert_eq!(diffs[0].id, issuance_id);
}

#[tokio::test]
async fn proof_sync_log_lifecycle() {
    let log = MemProofSyncLog::new();
    let (id, key, leaf) = issuance_leaf("log", 10, 0x44);
    let server = ServerAddr::from_str_addr("127.0.0.1:10029");

    // Two failed attempts bump the counter.
    for expected in 1..=2 {
        let attempts = log
            .upsert_proof_sync_log(
                id,
                key,
                leaf.clone(),
                server.clone(),
                SyncDirection::Push,
                ProofSyncStatus::Pending,
                true,
            )
            .await
            .unwrap();
        assert_eq!(attempts, expected);
    }

    let pending = log
        .pending_proof_sync_log(Some(SyncDirection::Push))
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempt_counter, 2);

    // Completion empties the pending view; pruning removes the entry.
    log.upsert_proof_sync_log(
        id,
        key,
        leaf,
        server.clone(),
        SyncDirection::Push,
        ProofSyncStatus::Complete,
        false,
    )
    .await
    .unwrap();
    assert!(log
        .pending_proof_sync_log(None)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(log.delete_completed_entries(&[server]).await.unwrap(), 1);
}

#[tokio::test]
async fn federation_push_reaches_all_servers() {
    let local = new_node();
    let remote_node = new_node();
    let log = Arc::new(MemProofSyncLog::new());

    let envoy = FederationEnvoy::new(
        FederationEnvoyConfig {
            sync_interval: std::time::Duration::from_secs(3600),
            ..FederationEnvoyConfig::default()
        },
        local.clone() as Arc<dyn MultiverseArchive>,
        log.clone() as Arc<dyn FederationProofSyncLog>,
        SyncConfigs::default(),
    );

    let (id, key, leaf) = issuance_leaf("fed", 9, 0x46);
    local
        .upsert_proof_leaf(id, key, leaf.clone(), None)
        .await
        .unwrap();

    // No servers yet: pushing fails loudly.
    assert!(matches!(
        envoy.push_proof_to_federation(id, key, leaf.clone()).await,
        Err(UniverseError::NoUniverseServers)
    ));

    let addr = ServerAddr::from_str_addr("127.0.0.1:10030");
    envoy
        .add_server(addr.clone(), Arc::new(RemoteNode(remote_node.clone())), vec![id])
        .await
        .unwrap();
    assert!(matches!(
        envoy
            .add_server(addr, Arc::new(RemoteNode(remote_node.clone())), vec![id])
            .await,
        Err(UniverseError::DuplicateUniverse)
    ));

    envoy
        .push_proof_to_federation(id, key, leaf)
        .await
        .unwrap();
    envoy.stop();

    // The remote now has the leaf, and the log entry is complete.
    assert_eq!(
        remote_node.universe_root(&id).await.unwrap(),
        local.universe_root(&id).await.unwrap(),
    );
    assert!(log.pending_proof_sync_log(None).await.unwrap().is_empty());
}

/// A remote wrapper counting how many leaves the syncer actually fetched.
struct CountingRemote {
    inner: RemoteNode,
    proof_fetches: AtomicUsize,
}

#[async_trait]
impl RemoteUniverse for CountingRemote {
    async fn universe_root(
        &self,
        id: &Identifier,
    ) -> Result<Option<taro_mssmt::ComputedNode>, UniverseError> {
        self.inner.universe_root(id).await
    }

    async fn universe_subtree_root(
        &self,
        id: &Identifier,
        prefix: TreePrefix,
    ) -> Result<taro_mssmt::ComputedNode, UniverseError> {
        self.inner.universe_subtree_root(id, prefix).await
    }

    async fn universe_subtree_keys(
        &self,
        id: &Identifier,
        prefix: TreePrefix,
    ) -> Result<Vec<LeafKey>, UniverseError> {
        self.inner.universe_subtree_keys(id, prefix).await
    }

    async fn universe_leaf_keys(
        &self,
        id: &Identifier,
        offset: usize,
        page_size: usize,
    ) -> Result<Vec<LeafKey>, UniverseError> {
        self.inner.universe_leaf_keys(id, offset, page_size).await
    }

    async fn fetch_proof_leaf(
        &self,
        id: &Identifier,
        key: &LeafKey,
    ) -> Result<UniverseProof, UniverseError> {
        self.proof_fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_proof_leaf(id, key).await
    }

    async fn push_proof_leaf(
        &self,
        id: &Identifier,
        key: &LeafKey,
        leaf: &Leaf,
    ) -> Result<(), UniverseError> {
        self.inner.push_proof_leaf(id, key, leaf).await
    }
}

#[tokio::test]
async fn differing_leaf_at_same_key_is_reconciled() {
    // Two valid proofs for the same anchor outpoint and script key,
    // differing only in the confirmed header's nonce: same universe key,
    // different leaf content.
    let (id, key, leaf_a) = issuance_leaf_with_nonce("conflict", 40, 0x60, 0);
    let (_, key_b, leaf_b) = issuance_leaf_with_nonce("conflict", 40, 0x60, 1);
    assert_eq!(key, key_b);
    assert_ne!(leaf_a, leaf_b);

    let node_a = new_node();
    let node_b = new_node();
    node_a
        .upsert_proof_leaf(id, key, leaf_a, None)
        .await
        .unwrap();
    node_b
        .upsert_proof_leaf(id, key, leaf_b.clone(), None)
        .await
        .unwrap();
    assert_ne!(
        node_a.universe_root(&id).await.unwrap(),
        node_b.universe_root(&id).await.unwrap(),
    );

    // A pulls from B: the key exists on both sides but the leaves differ,
    // so the remote leaf must be imported.
    let syncer = UniverseSyncer::new(node_a.clone() as Arc<dyn MultiverseArchive>);
    let diffs = syncer
        .sync_universe(
            &RemoteNode(node_b.clone()),
            SyncType::Full,
            &SyncConfigs::default(),
            &[id],
        )
        .await
        .unwrap();
    assert_eq!(diffs.len(), 1);
    assert_eq!(diffs[0].new_leaf_count, 1);

    assert_eq!(
        node_a.universe_root(&id).await.unwrap(),
        node_b.universe_root(&id).await.unwrap(),
    );
    let stored = node_a.fetch_proof_leaf(&id, &key).await.unwrap();
    assert_eq!(stored.leaf, leaf_b);

    // The reverse direction is now a no-op: both roots already match.
    let syncer_b = UniverseSyncer::new(node_b.clone() as Arc<dyn MultiverseArchive>);
    let diffs = syncer_b
        .sync_universe(
            &RemoteNode(node_a.clone()),
            SyncType::Full,
            &SyncConfigs::default(),
            &[id],
        )
        .await
        .unwrap();
    assert!(diffs.is_empty());
}

#[tokio::test]
async fn bisection_fetches_only_divergent_leaves() {
    let (id, key1, leaf1) = issuance_leaf("sparse", 10, 0x70);
    let (_, key2, leaf2) = issuance_leaf("sparse", 10, 0x72);
    let (_, key3, leaf3) = issuance_leaf("sparse", 10, 0x74);

    // The remote holds all three leaves; the local node two of them.
    let node_a = new_node();
    let node_b = new_node();
    for (key, leaf) in [(key1, &leaf1), (key2, &leaf2)] {
        node_a
            .upsert_proof_leaf(id, key, leaf.clone(), None)
            .await
            .unwrap();
    }
    for (key, leaf) in [(key1, &leaf1), (key2, &leaf2), (key3, &leaf3)] {
        node_b
            .upsert_proof_leaf(id, key, leaf.clone(), None)
            .await
            .unwrap();
    }

    let remote = CountingRemote {
        inner: RemoteNode(node_b.clone()),
        proof_fetches: AtomicUsize::new(0),
    };
    let syncer = UniverseSyncer::new(node_a.clone() as Arc<dyn MultiverseArchive>);
    let diffs = syncer
        .sync_universe(&remote, SyncType::Full, &SyncConfigs::default(), &[id])
        .await
        .unwrap();

    assert_eq!(diffs.len(), 1);
    assert_eq!(diffs[0].new_leaf_count, 1);
    assert_eq!(
        node_a.universe_root(&id).await.unwrap(),
        node_b.universe_root(&id).await.unwrap(),
    );

    // Walking differing branches must not re-fetch the leaves both sides
    // already share.
    assert!(
        remote.proof_fetches.load(Ordering::SeqCst) < 3,
        "bisection fetched every remote leaf"
    );
}
