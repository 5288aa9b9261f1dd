use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::addr::ServerAddr;
use crate::multiverse::MultiverseArchive;
use crate::sync::{RemoteUniverse, SyncType, UniverseSyncer};
use crate::{Identifier, Leaf, LeafKey, ProofType, UniverseError};

/// Default federation sync behavior for one proof type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalSyncConfig {
    /// The proof type the config applies to.
    pub proof_type: ProofType,
    /// Whether leaves of this type may be inserted via federation sync.
    pub allow_sync_insert: bool,
    /// Whether leaves of this type may be exported via federation sync.
    pub allow_sync_export: bool,
}

/// Per-universe override of the federation sync behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniSyncConfig {
    /// The universe the config applies to.
    pub universe_id: Identifier,
    /// Whether leaves of this universe may be inserted via federation sync.
    pub allow_sync_insert: bool,
    /// Whether leaves of this universe may be exported via federation sync.
    pub allow_sync_export: bool,
}

/// The combined sync gating: per-universe configs override the per-type
/// defaults; anything unconfigured is allowed.
#[derive(Debug, Clone, Default)]
pub struct SyncConfigs {
    /// Per-proof-type defaults.
    pub global: Vec<GlobalSyncConfig>,
    /// Per-universe overrides.
    pub per_universe: Vec<UniSyncConfig>,
}

impl SyncConfigs {
    fn lookup(&self, id: &Identifier) -> (bool, bool) {
        if let Some(config) = self
            .per_universe
            .iter()
            .find(|config| config.universe_id == *id)
        {
            return (config.allow_sync_insert, config.allow_sync_export);
        }
        if let Some(config) = self
            .global
            .iter()
            .find(|config| config.proof_type == id.proof_type)
        {
            return (config.allow_sync_insert, config.allow_sync_export);
        }
        (true, true)
    }

    /// Whether pull-importing into the given universe is allowed.
    pub fn allows_insert(&self, id: &Identifier) -> bool {
        self.lookup(id).0
    }

    /// Whether push-exporting from the given universe is allowed.
    pub fn allows_export(&self, id: &Identifier) -> bool {
        self.lookup(id).1
    }
}

/// The direction of a proof sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncDirection {
    /// Local to remote.
    Push,
    /// Remote to local.
    Pull,
}

impl std::fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncDirection::Push => f.write_str("push"),
            SyncDirection::Pull => f.write_str("pull"),
        }
    }
}

/// The status of a logged proof sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProofSyncStatus {
    /// Still being retried.
    Pending,
    /// Confirmed synced.
    Complete,
}

/// One entry of the proof-sync log.
#[derive(Debug, Clone)]
pub struct ProofSyncLogEntry {
    /// Status of the sync.
    pub status: ProofSyncStatus,
    /// Direction of the sync.
    pub direction: SyncDirection,
    /// How many times the sync has been attempted.
    pub attempt_counter: u64,
    /// The counterparty server.
    pub server: ServerAddr,
    /// The universe the leaf belongs to.
    pub universe_id: Identifier,
    /// The leaf key being synced.
    pub leaf_key: LeafKey,
    /// The leaf being synced.
    pub leaf: Leaf,
}

/// Durable log backing retry-until-success proof sync. Keyed by universe,
/// leaf key, server and direction.
#[async_trait]
pub trait FederationProofSyncLog: Send + Sync {
    /// Inserts or updates a log entry, optionally bumping the attempt
    /// counter. Returns the current counter value.
    async fn upsert_proof_sync_log(
        &self,
        universe_id: Identifier,
        leaf_key: LeafKey,
        leaf: Leaf,
        server: ServerAddr,
        direction: SyncDirection,
        status: ProofSyncStatus,
        bump_attempt_counter: bool,
    ) -> Result<u64, UniverseError>;

    /// All pending entries for the given direction, or every direction
    /// when `None`.
    async fn pending_proof_sync_log(
        &self,
        direction: Option<SyncDirection>,
    ) -> Result<Vec<ProofSyncLogEntry>, UniverseError>;

    /// Deletes completed entries for the given servers (all servers when
    /// empty).
    async fn delete_completed_entries(
        &self,
        servers: &[ServerAddr],
    ) -> Result<usize, UniverseError>;
}

type LogKey = ([u8; 33], [u8; 32], String, SyncDirection);

/// In-memory [`FederationProofSyncLog`].
#[derive(Default)]
pub struct MemProofSyncLog {
    entries: Mutex<HashMap<LogKey, ProofSyncLogEntry>>,
}

impl MemProofSyncLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FederationProofSyncLog for MemProofSyncLog {
    async fn upsert_proof_sync_log(
        &self,
        universe_id: Identifier,
        leaf_key: LeafKey,
        leaf: Leaf,
        server: ServerAddr,
        direction: SyncDirection,
        status: ProofSyncStatus,
        bump_attempt_counter: bool,
    ) -> Result<u64, UniverseError> {
        let mut entries = self.entries.lock().await;
        let log_key = (
            universe_id.key(),
            leaf_key.universe_key(),
            server.host_str().to_string(),
            direction,
        );

        let entry = entries.entry(log_key).or_insert_with(|| ProofSyncLogEntry {
            status,
            direction,
            attempt_counter: 0,
            server: server.clone(),
            universe_id,
            leaf_key,
            leaf,
        });
        entry.status = status;
        if bump_attempt_counter {
            entry.attempt_counter += 1;
        }
        Ok(entry.attempt_counter)
    }

    async fn pending_proof_sync_log(
        &self,
        direction: Option<SyncDirection>,
    ) -> Result<Vec<ProofSyncLogEntry>, UniverseError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .values()
            .filter(|entry| entry.status == ProofSyncStatus::Pending)
            .filter(|entry| direction.map(|d| d == entry.direction).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn delete_completed_entries(
        &self,
        servers: &[ServerAddr],
    ) -> Result<usize, UniverseError> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|(_, _, host, _), entry| {
            let matches_server =
                servers.is_empty() || servers.iter().any(|server| server.host_str() == host);
            !(entry.status == ProofSyncStatus::Complete && matches_server)
        });
        Ok(before - entries.len())
    }
}

/// Configuration of the federation envoy.
#[derive(Debug, Clone)]
pub struct FederationEnvoyConfig {
    /// Interval between background sync rounds per server.
    pub sync_interval: Duration,
    /// Base wait between push retries.
    pub push_retry_base: Duration,
}

impl Default for FederationEnvoyConfig {
    fn default() -> Self {
        FederationEnvoyConfig {
            sync_interval: Duration::from_secs(600),
            push_retry_base: Duration::from_millis(500),
        }
    }
}

/// Keeps the local archive in sync with a set of federation servers: one
/// task per server runs periodic pull syncs, and new local proofs are
/// pushed to every server with retry-until-success semantics tracked in
/// the proof-sync log.
pub struct FederationEnvoy<R: RemoteUniverse + 'static> {
    cfg: FederationEnvoyConfig,
    archive: Arc<dyn MultiverseArchive>,
    sync_log: Arc<dyn FederationProofSyncLog>,
    configs: SyncConfigs,
    servers: Mutex<Vec<(ServerAddr, Arc<R>)>>,
    quit: broadcast::Sender<()>,
}

impl<R: RemoteUniverse + 'static> FederationEnvoy<R> {
    /// Creates an envoy over the local archive.
    pub fn new(
        cfg: FederationEnvoyConfig,
        archive: Arc<dyn MultiverseArchive>,
        sync_log: Arc<dyn FederationProofSyncLog>,
        configs: SyncConfigs,
    ) -> Arc<Self> {
        let (quit, _) = broadcast::channel(1);
        Arc::new(FederationEnvoy {
            cfg,
            archive,
            sync_log,
            configs,
            servers: Mutex::new(Vec::new()),
            quit,
        })
    }

    /// Signals every server task to stop.
    pub fn stop(&self) {
        let _ = self.quit.send(());
    }

    /// Adds a federation server and spawns its background sync task.
    pub async fn add_server(
        self: &Arc<Self>,
        addr: ServerAddr,
        remote: Arc<R>,
        ids: Vec<Identifier>,
    ) -> Result<(), UniverseError> {
        {
            let mut servers = self.servers.lock().await;
            if servers.iter().any(|(existing, _)| *existing == addr) {
                return Err(UniverseError::DuplicateUniverse);
            }
            servers.push((addr.clone(), Arc::clone(&remote)));
        }

        let envoy = Arc::clone(self);
        let mut quit = self.quit.subscribe();
        tokio::spawn(async move {
            let syncer = UniverseSyncer::new(Arc::clone(&envoy.archive));
            loop {
                let result = syncer
                    .sync_universe(remote.as_ref(), SyncType::Full, &envoy.configs, &ids)
                    .await;
                match result {
                    Ok(diffs) if !diffs.is_empty() => {
                        info!(server = addr.host_str(), synced = diffs.len(), "pull sync done");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(server = addr.host_str(), %err, "pull sync failed");
                    }
                }

                tokio::select! {
                    _ = quit.recv() => return,
                    _ = tokio::time::sleep(envoy.cfg.sync_interval) => {}
                }
            }
        });

        Ok(())
    }

    /// The current federation servers.
    pub async fn federation_servers(&self) -> Vec<ServerAddr> {
        self.servers
            .lock()
            .await
            .iter()
            .map(|(addr, _)| addr.clone())
            .collect()
    }

    /// Pushes a new proof leaf to every federation server, logging each
    /// delivery and retrying until every server has acknowledged it.
    pub async fn push_proof_to_federation(
        &self,
        id: Identifier,
        key: LeafKey,
        leaf: Leaf,
    ) -> Result<(), UniverseError> {
        if !self.configs.allows_export(&id) {
            debug!(universe = %id, "push export disallowed by config");
            return Ok(());
        }

        let servers = self.servers.lock().await.clone();
        if servers.is_empty() {
            return Err(UniverseError::NoUniverseServers);
        }

        for (addr, remote) in servers {
            self.push_to_server(&id, &key, &leaf, &addr, remote.as_ref())
                .await?;
        }
        Ok(())
    }

    /// Pushes one leaf to one server, tracking attempts in the sync log.
    async fn push_to_server(
        &self,
        id: &Identifier,
        key: &LeafKey,
        leaf: &Leaf,
        addr: &ServerAddr,
        remote: &R,
    ) -> Result<(), UniverseError> {
        let mut quit = self.quit.subscribe();
        let mut attempt: u64 = 0;
        loop {
            attempt = self
                .sync_log
                .upsert_proof_sync_log(
                    *id,
                    *key,
                    leaf.clone(),
                    addr.clone(),
                    SyncDirection::Push,
                    ProofSyncStatus::Pending,
                    true,
                )
                .await?;

            match remote.push_proof_leaf(id, key, leaf).await {
                Ok(()) => {
                    self.sync_log
                        .upsert_proof_sync_log(
                            *id,
                            *key,
                            leaf.clone(),
                            addr.clone(),
                            SyncDirection::Push,
                            ProofSyncStatus::Complete,
                            false,
                        )
                        .await?;
                    return Ok(());
                }
                Err(err) => {
                    warn!(server = addr.host_str(), attempt, %err, "proof push failed");
                }
            }

            // Linear-capped wait; the durable attempt counter is what
            // backs resumption after a restart.
            let wait = self.cfg.push_retry_base.saturating_mul(attempt.min(10) as u32);
            tokio::select! {
                _ = quit.recv() => return Err(UniverseError::Sync("shutting down".into())),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}
