use std::sync::Arc;

use async_trait::async_trait;
use taro_mssmt::ComputedNode;
use tracing::{debug, info};

use crate::federation::SyncConfigs;
use crate::multiverse::{MultiverseArchive, UpsertItem};
use crate::{Identifier, LeafKey, ProofType, TreePrefix, UniverseError, UniverseProof};

/// Bisection depth at which a differing branch is enumerated instead of
/// descended further. A slice at this depth covers 1/65536th of the key
/// space, so the work stays proportional to the divergence rather than to
/// the remote tree size.
const BISECTION_MAX_DEPTH: usize = 16;

/// How much of a remote universe to synchronize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncType {
    /// Only issuance universes.
    Issuance,
    /// Issuance and transfer universes.
    Full,
}

impl SyncType {
    fn covers(&self, proof_type: ProofType) -> bool {
        match self {
            SyncType::Issuance => proof_type == ProofType::Issuance,
            SyncType::Full => {
                proof_type == ProofType::Issuance || proof_type == ProofType::Transfer
            }
        }
    }
}

/// Client view of a remote universe server.
#[async_trait]
pub trait RemoteUniverse: Send + Sync {
    /// The remote root for one universe, if it exists there.
    async fn universe_root(
        &self,
        id: &Identifier,
    ) -> Result<Option<ComputedNode>, UniverseError>;

    /// The remote root of one subtree of the universe tree; the empty
    /// subtree when the universe or prefix is vacant.
    async fn universe_subtree_root(
        &self,
        id: &Identifier,
        prefix: TreePrefix,
    ) -> Result<ComputedNode, UniverseError>;

    /// The remote leaf keys beneath one subtree prefix.
    async fn universe_subtree_keys(
        &self,
        id: &Identifier,
        prefix: TreePrefix,
    ) -> Result<Vec<LeafKey>, UniverseError>;

    /// Pages through the remote universe's leaf keys.
    async fn universe_leaf_keys(
        &self,
        id: &Identifier,
        offset: usize,
        page_size: usize,
    ) -> Result<Vec<LeafKey>, UniverseError>;

    /// Fetches one remote leaf with its inclusion proofs.
    async fn fetch_proof_leaf(
        &self,
        id: &Identifier,
        key: &LeafKey,
    ) -> Result<UniverseProof, UniverseError>;

    /// Pushes one leaf to the remote.
    async fn push_proof_leaf(
        &self,
        id: &Identifier,
        key: &LeafKey,
        leaf: &crate::Leaf,
    ) -> Result<(), UniverseError>;
}

/// The per-universe result of a sync run.
#[derive(Debug, Clone)]
pub struct AssetSyncDiff {
    /// The universe that was synced.
    pub id: Identifier,
    /// The local root before the sync, if the universe existed.
    pub old_universe_root: Option<ComputedNode>,
    /// The local root after the sync.
    pub new_universe_root: ComputedNode,
    /// The number of leaves imported.
    pub new_leaf_count: usize,
}

/// Pull-syncs local universes against a remote peer by root bisection:
/// equal roots short-circuit, differing roots are walked top-down with
/// both sides comparing subtree roots and descending only into the
/// branches that diverge. Keys found in a diverging slice are imported
/// when absent locally or when the local leaf differs from the remote's.
pub struct UniverseSyncer {
    local: Arc<dyn MultiverseArchive>,
}

impl UniverseSyncer {
    /// Creates a syncer over the local archive.
    pub fn new(local: Arc<dyn MultiverseArchive>) -> Self {
        UniverseSyncer { local }
    }

    /// Synchronizes the given universes from the remote, honoring the sync
    /// mode and the per-universe insert gating of `configs`. Returns one
    /// diff per universe that changed.
    pub async fn sync_universe(
        &self,
        remote: &dyn RemoteUniverse,
        sync_type: SyncType,
        configs: &SyncConfigs,
        ids: &[Identifier],
    ) -> Result<Vec<AssetSyncDiff>, UniverseError> {
        let mut diffs = Vec::new();

        for id in ids {
            if !sync_type.covers(id.proof_type) {
                debug!(universe = %id, "skipping universe outside sync mode");
                continue;
            }
            if !configs.allows_insert(id) {
                debug!(universe = %id, "sync insert disallowed by config");
                continue;
            }

            if let Some(diff) = self.sync_one(remote, id).await? {
                diffs.push(diff);
            }
        }

        Ok(diffs)
    }

    /// Syncs a single universe; `None` when already in sync.
    async fn sync_one(
        &self,
        remote: &dyn RemoteUniverse,
        id: &Identifier,
    ) -> Result<Option<AssetSyncDiff>, UniverseError> {
        let remote_root = match remote.universe_root(id).await? {
            Some(root) => root,
            None => {
                debug!(universe = %id, "remote has no root for universe");
                return Ok(None);
            }
        };

        let local_root = self.local.universe_root(id).await?;
        if local_root == Some(remote_root) {
            debug!(universe = %id, "roots equal, universes in sync");
            return Ok(None);
        }

        let candidates = self.bisect_diff(remote, id).await?;
        let mut items = Vec::new();
        for key in candidates {
            let remote_proof = remote.fetch_proof_leaf(id, &key).await?;
            // The remote must prove the leaf against the root it
            // advertised.
            if !remote_proof.verify_root(remote_root) {
                return Err(UniverseError::RootMismatch);
            }

            // Import keys absent locally, and keys whose local leaf
            // differs from the remote's.
            match self.local.fetch_proof_leaf(id, &key).await {
                Ok(local_proof) if local_proof.leaf == remote_proof.leaf => continue,
                _ => items.push(UpsertItem {
                    id: *id,
                    key,
                    leaf: remote_proof.leaf,
                    meta_reveal: None,
                }),
            }
        }

        if items.is_empty() {
            return Ok(None);
        }

        let new_leaf_count = items.len();
        self.local.upsert_proof_leaf_batch(items).await?;

        let new_universe_root = self
            .local
            .universe_root(id)
            .await?
            .ok_or(UniverseError::NoUniverseRoot)?;
        info!(
            universe = %id,
            new_leaf_count,
            "universe synced from remote"
        );

        Ok(Some(AssetSyncDiff {
            id: *id,
            old_universe_root: local_root,
            new_universe_root,
            new_leaf_count,
        }))
    }

    /// Walks both trees top-down and collects the remote leaf keys of
    /// every diverging branch. Branches whose subtree roots match are
    /// never descended; empty remote branches hold nothing to import (a
    /// pull sync never deletes local leaves). A branch new to this node,
    /// or one still diverging at the depth cutoff, is enumerated.
    async fn bisect_diff(
        &self,
        remote: &dyn RemoteUniverse,
        id: &Identifier,
    ) -> Result<Vec<LeafKey>, UniverseError> {
        let mut candidates = Vec::new();
        let mut pending = vec![TreePrefix::root()];

        while let Some(prefix) = pending.pop() {
            let remote_node = remote.universe_subtree_root(id, prefix).await?;
            let local_node = self.local.universe_subtree_root(id, prefix).await?;
            if remote_node == local_node {
                continue;
            }

            let empty = taro_mssmt::empty_tree()[prefix.bit_len()];
            if remote_node == empty {
                continue;
            }
            if local_node == empty || prefix.bit_len() >= BISECTION_MAX_DEPTH {
                candidates.extend(remote.universe_subtree_keys(id, prefix).await?);
                continue;
            }

            pending.push(prefix.child(0));
            pending.push(prefix.child(1));
        }

        debug!(
            universe = %id,
            candidates = candidates.len(),
            "bisection finished"
        );
        Ok(candidates)
    }
}
