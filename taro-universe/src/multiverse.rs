use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use taro_mssmt::{CompactedTree, ComputedNode, MemoryStore, Tree};
use taro_proof::{verify_proof_standalone, ChainLookup, MetaReveal, Proof};
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    multiverse_key, multiverse_leaf, proof_type_for_leaf, Identifier, Leaf, LeafKey, ProofType,
    TreePrefix, UniverseConfig, UniverseError, UniverseProof, MAX_PAGE_SIZE,
};

/// One leaf destined for insertion, as used by the batch path.
#[derive(Debug, Clone)]
pub struct UpsertItem {
    /// The universe to insert into.
    pub id: Identifier,
    /// The key the leaf is stored at.
    pub key: LeafKey,
    /// The leaf itself.
    pub leaf: Leaf,
    /// Meta reveal for genesis proofs committing to a non-zero meta hash.
    pub meta_reveal: Option<MetaReveal>,
}

/// Aggregate storage across all universes: per-identifier universe trees
/// plus one multiverse tree per proof type, keyed by the universe
/// identifier digest.
#[async_trait]
pub trait MultiverseArchive: Send + Sync {
    /// Verifies and inserts one proof leaf, returning inclusion proofs from
    /// both the universe and its multiverse.
    async fn upsert_proof_leaf(
        &self,
        id: Identifier,
        key: LeafKey,
        leaf: Leaf,
        meta_reveal: Option<MetaReveal>,
    ) -> Result<UniverseProof, UniverseError>;

    /// Inserts a batch of leaves in one transaction. The resulting roots
    /// are identical to performing the equivalent singleton calls.
    async fn upsert_proof_leaf_batch(
        &self,
        items: Vec<UpsertItem>,
    ) -> Result<(), UniverseError>;

    /// The root of one universe tree, if it exists.
    async fn universe_root(&self, id: &Identifier)
        -> Result<Option<ComputedNode>, UniverseError>;

    /// The multiverse root for a proof type.
    async fn multiverse_root(
        &self,
        proof_type: ProofType,
    ) -> Result<Option<ComputedNode>, UniverseError>;

    /// Pages through the leaf keys of one universe.
    async fn universe_leaf_keys(
        &self,
        id: &Identifier,
        offset: usize,
        page_size: usize,
    ) -> Result<Vec<LeafKey>, UniverseError>;

    /// The root of one subtree of a universe tree. A missing universe (or
    /// a vacant prefix) yields the empty subtree at that depth, so sync
    /// bisection can compare without existence checks.
    async fn universe_subtree_root(
        &self,
        id: &Identifier,
        prefix: TreePrefix,
    ) -> Result<taro_mssmt::ComputedNode, UniverseError>;

    /// The leaf keys whose universe keys start with the given prefix.
    async fn universe_subtree_keys(
        &self,
        id: &Identifier,
        prefix: TreePrefix,
    ) -> Result<Vec<LeafKey>, UniverseError>;

    /// Pages through the leaves of one universe.
    async fn universe_leaves(
        &self,
        id: &Identifier,
        offset: usize,
        page_size: usize,
    ) -> Result<Vec<Leaf>, UniverseError>;

    /// Fetches the proof for one leaf key.
    async fn fetch_proof_leaf(
        &self,
        id: &Identifier,
        key: &LeafKey,
    ) -> Result<UniverseProof, UniverseError>;

    /// Deletes one universe and its multiverse entry, returning the
    /// deleted namespace.
    async fn delete_universe(&self, id: &Identifier) -> Result<String, UniverseError>;
}

struct UniverseTree {
    tree: CompactedTree<MemoryStore>,
    leaves: BTreeMap<[u8; 32], (LeafKey, Leaf)>,
}

impl UniverseTree {
    fn new() -> Self {
        UniverseTree {
            tree: CompactedTree::new(MemoryStore::new()),
            leaves: BTreeMap::new(),
        }
    }
}

#[derive(Default)]
struct MultiverseState {
    universes: HashMap<[u8; 33], UniverseTree>,
    multiverses: HashMap<ProofType, CompactedTree<MemoryStore>>,
}

/// An in-memory [`MultiverseArchive`] backed by compacted MS-SMTs. Writes
/// take the state lock exclusively, serializing mutations per process;
/// reads share it.
pub struct MemMultiverse {
    cfg: UniverseConfig,
    chain: Arc<dyn ChainLookup>,
    state: RwLock<MultiverseState>,
}

impl MemMultiverse {
    /// Creates an empty archive verifying proofs against the given chain
    /// oracle.
    pub fn new(cfg: UniverseConfig, chain: Arc<dyn ChainLookup>) -> Self {
        MemMultiverse {
            cfg,
            chain,
            state: RwLock::new(MultiverseState::default()),
        }
    }

    /// The configured default page size.
    pub fn default_page_size(&self) -> usize {
        self.cfg.default_page_size
    }

    /// Validates a leaf before insertion: the embedded proof must verify
    /// against the chain oracle and the derived proof type must match the
    /// universe identifier.
    async fn validate_leaf(&self, id: &Identifier, leaf: &Leaf) -> Result<(), UniverseError> {
        let proof = Proof::from_bytes(&leaf.raw_proof)
            .map_err(|e| UniverseError::ProofVerification(e.to_string()))?;
        verify_proof_standalone(&proof, self.chain.as_ref())
            .await
            .map_err(|e| UniverseError::ProofVerification(e.to_string()))?;

        let actual = proof_type_for_leaf(&leaf.asset, leaf.is_burn);
        if actual != id.proof_type {
            return Err(UniverseError::SyncProofTypeMismatch {
                expected: id.proof_type,
                actual,
            });
        }

        Ok(())
    }

    /// Inserts one validated leaf under an already-held write lock.
    fn insert_locked(
        state: &mut MultiverseState,
        id: Identifier,
        key: LeafKey,
        leaf: Leaf,
    ) -> Result<UniverseProof, UniverseError> {
        let universe = state
            .universes
            .entry(id.key())
            .or_insert_with(UniverseTree::new);

        let universe_key = key.universe_key();
        let smt_leaf = leaf.smt_leaf();
        let universe_root = universe.tree.insert(&universe_key, smt_leaf)?;
        universe.leaves.insert(universe_key, (key, leaf.clone()));
        let universe_inclusion_proof = universe.tree.merkle_proof(&universe_key)?;

        let multiverse = state
            .multiverses
            .entry(id.proof_type)
            .or_insert_with(|| CompactedTree::new(MemoryStore::new()));
        let m_key = multiverse_key(&id);
        let multiverse_root = multiverse.insert(&m_key, multiverse_leaf(&universe_root))?;
        let multiverse_inclusion_proof = multiverse.merkle_proof(&m_key)?;

        Ok(UniverseProof {
            leaf,
            leaf_key: key,
            universe_root,
            universe_inclusion_proof,
            multiverse_root,
            multiverse_inclusion_proof,
        })
    }
}

#[async_trait]
impl MultiverseArchive for MemMultiverse {
    async fn upsert_proof_leaf(
        &self,
        id: Identifier,
        key: LeafKey,
        leaf: Leaf,
        _meta_reveal: Option<MetaReveal>,
    ) -> Result<UniverseProof, UniverseError> {
        self.validate_leaf(&id, &leaf).await?;

        let mut state = self.state.write().await;
        let proof = Self::insert_locked(&mut state, id, key, leaf)?;
        debug!(universe = %id, root = %hex::encode(proof.universe_root.hash), "leaf upserted");
        Ok(proof)
    }

    async fn upsert_proof_leaf_batch(
        &self,
        items: Vec<UpsertItem>,
    ) -> Result<(), UniverseError> {
        // Validate everything before taking the write lock, so a bad item
        // cannot leave a half-applied batch.
        for item in &items {
            self.validate_leaf(&item.id, &item.leaf).await?;
        }

        let mut state = self.state.write().await;
        for item in items {
            Self::insert_locked(&mut state, item.id, item.key, item.leaf)?;
        }
        Ok(())
    }

    async fn universe_root(
        &self,
        id: &Identifier,
    ) -> Result<Option<ComputedNode>, UniverseError> {
        let state = self.state.read().await;
        match state.universes.get(&id.key()) {
            Some(universe) => Ok(Some(universe.tree.root()?)),
            None => Ok(None),
        }
    }

    async fn multiverse_root(
        &self,
        proof_type: ProofType,
    ) -> Result<Option<ComputedNode>, UniverseError> {
        let state = self.state.read().await;
        match state.multiverses.get(&proof_type) {
            Some(tree) => Ok(Some(tree.root()?)),
            None => Ok(None),
        }
    }

    async fn universe_leaf_keys(
        &self,
        id: &Identifier,
        offset: usize,
        page_size: usize,
    ) -> Result<Vec<LeafKey>, UniverseError> {
        if page_size > MAX_PAGE_SIZE {
            return Err(UniverseError::PageSizeTooLarge(page_size));
        }
        let page_size = if page_size == 0 {
            self.cfg.default_page_size
        } else {
            page_size
        };

        let state = self.state.read().await;
        let universe = state
            .universes
            .get(&id.key())
            .ok_or(UniverseError::NoUniverseRoot)?;
        Ok(universe
            .leaves
            .values()
            .skip(offset)
            .take(page_size)
            .map(|(key, _)| *key)
            .collect())
    }

    async fn universe_subtree_root(
        &self,
        id: &Identifier,
        prefix: TreePrefix,
    ) -> Result<ComputedNode, UniverseError> {
        let state = self.state.read().await;
        match state.universes.get(&id.key()) {
            Some(universe) => Ok(universe
                .tree
                .subtree_root(prefix.bits(), prefix.bit_len())?),
            None => Ok(taro_mssmt::empty_tree()[prefix.bit_len()]),
        }
    }

    async fn universe_subtree_keys(
        &self,
        id: &Identifier,
        prefix: TreePrefix,
    ) -> Result<Vec<LeafKey>, UniverseError> {
        let state = self.state.read().await;
        match state.universes.get(&id.key()) {
            Some(universe) => Ok(universe
                .leaves
                .iter()
                .filter(|(universe_key, _)| prefix.contains(universe_key))
                .map(|(_, (key, _))| *key)
                .collect()),
            None => Ok(Vec::new()),
        }
    }

    async fn universe_leaves(
        &self,
        id: &Identifier,
        offset: usize,
        page_size: usize,
    ) -> Result<Vec<Leaf>, UniverseError> {
        if page_size > MAX_PAGE_SIZE {
            return Err(UniverseError::PageSizeTooLarge(page_size));
        }
        let page_size = if page_size == 0 {
            self.cfg.default_page_size
        } else {
            page_size
        };

        let state = self.state.read().await;
        let universe = state
            .universes
            .get(&id.key())
            .ok_or(UniverseError::NoUniverseRoot)?;
        Ok(universe
            .leaves
            .values()
            .skip(offset)
            .take(page_size)
            .map(|(_, leaf)| leaf.clone())
            .collect())
    }

    async fn fetch_proof_leaf(
        &self,
        id: &Identifier,
        key: &LeafKey,
    ) -> Result<UniverseProof, UniverseError> {
        let state = self.state.read().await;
        let universe = state
            .universes
            .get(&id.key())
            .ok_or(UniverseError::NoUniverseRoot)?;

        let universe_key = key.universe_key();
        let (leaf_key, leaf) = universe
            .leaves
            .get(&universe_key)
            .cloned()
            .ok_or(UniverseError::NoUniverseProofFound)?;

        let universe_root = universe.tree.root()?;
        let universe_inclusion_proof = universe.tree.merkle_proof(&universe_key)?;

        let multiverse = state
            .multiverses
            .get(&id.proof_type)
            .ok_or(UniverseError::NoUniverseRoot)?;
        let m_key = multiverse_key(id);
        let multiverse_root = multiverse.root()?;
        let multiverse_inclusion_proof = multiverse.merkle_proof(&m_key)?;

        Ok(UniverseProof {
            leaf,
            leaf_key,
            universe_root,
            universe_inclusion_proof,
            multiverse_root,
            multiverse_inclusion_proof,
        })
    }

    async fn delete_universe(&self, id: &Identifier) -> Result<String, UniverseError> {
        let mut state = self.state.write().await;
        state
            .universes
            .remove(&id.key())
            .ok_or(UniverseError::NoUniverseRoot)?;

        if let Some(multiverse) = state.multiverses.get_mut(&id.proof_type) {
            multiverse.delete(&multiverse_key(id))?;
        }

        Ok(id.to_string())
    }
}
