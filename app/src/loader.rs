//! Cold start, rebuilds and catch-up with the network.

use crate::{
    bus::{EventBus, LoaderHook, NodeEvent},
    chain::{BlockChain, ChainError},
    metrics::{LOADER_NETWORK_HEIGHT, LOADER_REBUILDS, LOADER_SYNC_TOTALS},
    network::{Broadcaster, PeerRequest, PeerTransport, TransportError},
    peers::{Peer, PeerDirectory, PeerState},
    pool::{SignatureBundle, TransactionPool},
    retry::{retry, RetryPolicy},
    schema::{self, Validator},
    sequence::{JobsError, JobsQueue, Sequence},
    spec::ChainSpec,
    store::{Storage, StorageError},
};
use futures::future::join_all;
use rand::seq::SliceRandom;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::*;

pub const SYNC_TIMER_JOB: &str = "loaderSyncTimer";

/// Height buckets are this wide when clustering peers.
const AGGREGATION: u64 = 2;

const TRANSACTION_BATCH: usize = 25;

const SYNC_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("No acceptable peers for the operation")]
    NoAcceptablePeers,
    #[error("Failed to match genesis block with database")]
    GenesisMismatch,
    #[error("{0}")]
    Consistency(String),
    #[error("Invalid response from {peer}: {reason}")]
    InvalidResponse { peer: String, reason: String },
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Jobs(#[from] JobsError),
}

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Blocks replayed per storage read during a rebuild
    pub load_per_iteration: u64,
    /// Attempts for one periodic block sync
    pub retries: u32,
    pub sync_interval: Duration,
    pub max_peers: usize,
    /// Backoff around one block catch-up iteration
    pub block_retry: RetryPolicy,
    pub sync_transactions: bool,
    pub sync_signatures: bool,
}

impl LoaderConfig {
    pub fn from_spec(spec: &ChainSpec) -> Self {
        Self {
            load_per_iteration: spec.load_per_iteration,
            retries: spec.retries,
            sync_interval: Duration::from_millis(spec.sync_interval_ms()),
            max_peers: spec.max_peers,
            block_retry: RetryPolicy::attempts(3).with_max_delay(Duration::from_secs(2)),
            sync_transactions: true,
            sync_signatures: true,
        }
    }
}

/// Peers believed to be at the network's tip, and that tip's height.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkView {
    pub height: u64,
    pub peers: Vec<Peer>,
}

/// Clusters peers at or above `local_height` by height and keeps the most
/// populated cluster. Ties go to the higher cluster.
pub fn find_good_peers(peers: &[Peer], local_height: u64) -> NetworkView {
    let mut candidates: Vec<&Peer> = peers.iter().filter(|peer| peer.height >= local_height).collect();
    candidates.sort_by(|a, b| b.height.cmp(&a.height));

    let mut counts: HashMap<u64, usize> = HashMap::new();
    let mut best: Option<(u64, usize)> = None;
    for peer in &candidates {
        let bucket = peer.height / AGGREGATION * AGGREGATION;
        let count = counts.entry(bucket).or_default();
        *count += 1;
        if best.map_or(true, |(_, max)| *count > max) {
            best = Some((bucket, *count));
        }
    }

    let Some((height, _)) = best else {
        return NetworkView::default();
    };
    let peers = candidates
        .into_iter()
        .filter(|peer| peer.height.abs_diff(height) < AGGREGATION + 1)
        .cloned()
        .collect();
    NetworkView { height, peers }
}

pub struct Loader {
    config: LoaderConfig,
    spec: Arc<ChainSpec>,
    chain: Arc<BlockChain>,
    storage: Arc<dyn Storage>,
    pool: Arc<TransactionPool>,
    peers: Arc<tokio::sync::RwLock<PeerDirectory>>,
    transport: Arc<dyn PeerTransport>,
    broadcaster: Arc<dyn Broadcaster>,
    validator: Arc<dyn Validator>,
    hook: Arc<dyn LoaderHook>,
    bus: EventBus,
    blocks_sequence: Sequence,
    signatures_sequence: Sequence,
    jobs: JobsQueue,
    network: tokio::sync::Mutex<NetworkView>,
    loaded: AtomicBool,
    syncing: AtomicBool,
    blocks_to_sync: Arc<AtomicU64>,
    sync_progress: Mutex<Option<JoinHandle<()>>>,
}

impl Loader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: LoaderConfig,
        spec: Arc<ChainSpec>,
        chain: Arc<BlockChain>,
        storage: Arc<dyn Storage>,
        pool: Arc<TransactionPool>,
        peers: Arc<tokio::sync::RwLock<PeerDirectory>>,
        transport: Arc<dyn PeerTransport>,
        broadcaster: Arc<dyn Broadcaster>,
        validator: Arc<dyn Validator>,
        hook: Arc<dyn LoaderHook>,
        bus: EventBus,
    ) -> Self {
        Self {
            config,
            spec,
            chain,
            storage,
            pool,
            peers,
            transport,
            broadcaster,
            validator,
            hook,
            bus,
            blocks_sequence: Sequence::new("blocks"),
            signatures_sequence: Sequence::new("signatures"),
            jobs: JobsQueue::new(),
            network: tokio::sync::Mutex::new(NetworkView::default()),
            loaded: AtomicBool::new(false),
            syncing: AtomicBool::new(false),
            blocks_to_sync: Arc::new(AtomicU64::new(0)),
            sync_progress: Mutex::new(None),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    pub fn blocks_to_sync(&self) -> u64 {
        self.blocks_to_sync.load(Ordering::SeqCst)
    }

    /// Asks `peer` for its height and records the answer in the directory.
    /// Peers that cannot answer are left out of the network view.
    async fn refresh_peer(&self, mut peer: Peer) -> Option<Peer> {
        let body = match self.transport.request(&peer, PeerRequest::Height).await {
            Ok(body) => body,
            Err(err) => {
                debug!(peer = %peer.key(), "Failed to get height: {err}");
                return None;
            }
        };
        if let Err(err) = self.validator.check(&body, &schema::LOADER_HEIGHT) {
            warn!(peer = %peer.key(), "Invalid height response: {err}");
            return None;
        }
        peer.height = body.get("height").and_then(Value::as_u64)?;
        self.peers.write().await.upsert(peer.clone(), false);
        Some(peer)
    }

    /// The cached network view while it is one block off our height,
    /// otherwise a fresh clustering of the peer directory after asking each
    /// peer for its height.
    pub async fn get_network(&self) -> Result<NetworkView, SyncError> {
        let local_height = self.chain.height().await;
        let mut network = self.network.lock().await;
        if network.height > 0 && network.height.abs_diff(local_height) == 1 {
            return Ok(network.clone());
        }

        let listed = {
            let directory = self.peers.read().await;
            let connected = directory
                .list(true)
                .into_iter()
                .filter(|peer| peer.state == PeerState::Connected)
                .take(self.config.max_peers)
                .collect();
            directory.acceptable(connected)
        };
        let listed: Vec<Peer> = join_all(listed.into_iter().map(|peer| self.refresh_peer(peer)))
            .await
            .into_iter()
            .flatten()
            .collect();
        *network = find_good_peers(&listed, local_height);
        LOADER_NETWORK_HEIGHT.set(network.height as i64);
        debug!(
            height = network.height,
            peers = network.peers.len(),
            listed = listed.len(),
            "Computed network view"
        );
        Ok(network.clone())
    }

    pub async fn get_random_peer(&self) -> Result<Peer, SyncError> {
        let network = self.get_network().await?;
        network
            .peers
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(SyncError::NoAcceptablePeers)
    }

    /// Drops `peer` from the cached network view so the next pick avoids it.
    async fn deprioritize(&self, peer: &Peer) {
        let key = peer.key();
        self.network.lock().await.peers.retain(|known| known.key() != key);
        debug!(peer = %key, "Deprioritized peer");
    }

    /// Single catch-up iteration against a random peer. Returns true once
    /// there is nothing more to load from it.
    async fn inner_load(&self) -> Result<bool, SyncError> {
        let peer = self.get_random_peer().await?;
        let last = self.chain.last_block().await.header;

        if last.height != 1 {
            info!(peer = %peer.key(), height = last.height, "Looking for common block");
            if let Err(err) = self.chain.get_common_block(&peer, last.height).await {
                warn!(peer = %peer.key(), "Failed to find common block: {err}");
                self.deprioritize(&peer).await;
                return Err(err.into());
            }
        }

        self.blocks_to_sync.store(peer.height, Ordering::SeqCst);
        match self.chain.load_blocks_from_peer(&peer).await {
            Ok(last_valid) => {
                self.chain
                    .last_receipt()
                    .update(self.spec.epoch_time + u64::from(last_valid.timestamp));
                Ok(last_valid.id == last.id || last_valid.height >= peer.height)
            }
            Err(err) => {
                if let Some((id, height)) = err.failed_block() {
                    error!(peer = %peer.key(), id, height, "Failed to process block: {err}");
                    let last_valid = self.chain.last_block().await;
                    self.chain.delete_after_block(last_valid.id()).await?;
                } else {
                    warn!(peer = %peer.key(), "Failed to load blocks: {err}");
                }
                self.deprioritize(&peer).await;
                Err(err.into())
            }
        }
    }

    /// Catches up until a peer has nothing newer. An iteration that keeps
    /// failing counts as loaded so one bad peer cannot stall the node.
    async fn load_blocks_from_network(&self) {
        let mut loaded = false;
        while !loaded && !self.chain.is_cleaning() {
            loaded = match retry(&self.config.block_retry, "load blocks", |_| self.inner_load()).await {
                Ok(done) => done,
                Err(err) => {
                    warn!("Failed to load blocks from network: {err}");
                    true
                }
            };
        }
    }

    /// Runs one full block sync. Only one sync is in flight at a time.
    pub async fn sync(&self) -> Result<(), SyncError> {
        self.blocks_sequence.add_and_promise(|| self.sync_once()).await
    }

    async fn sync_once(&self) -> Result<(), SyncError> {
        info!("Starting sync");
        self.bus.emit(NodeEvent::SyncStarted);
        self.syncing.store(true, Ordering::SeqCst);
        self.sync_trigger(true);

        let result = async {
            let consensus = self.broadcaster.refresh_consensus(self.config.max_peers).await?;
            debug!(consensus, "Broadhash consensus before sync");
            self.load_blocks_from_network().await;
            let consensus = self.broadcaster.refresh_consensus(self.config.max_peers).await?;
            debug!(consensus, "Broadhash consensus after sync");
            Ok::<_, SyncError>(())
        }
        .await;

        self.sync_trigger(false);
        self.syncing.store(false, Ordering::SeqCst);
        self.blocks_to_sync.store(0, Ordering::SeqCst);
        let status = if result.is_ok() { "ok" } else { "failed" };
        LOADER_SYNC_TOTALS.with_label_values(&[status]).inc();
        let height = self.chain.height().await;
        info!(height, "Finished sync");
        self.bus.emit(NodeEvent::SyncFinished);
        result
    }

    /// Starts or stops the once-a-second progress announcement of a running sync.
    fn sync_trigger(&self, turn_on: bool) {
        let mut slot = self.sync_progress.lock().unwrap_or_else(PoisonError::into_inner);
        match (turn_on, slot.take()) {
            (false, Some(handle)) => {
                handle.abort();
                trace!("Sync trigger off");
            }
            (true, None) => {
                let bus = self.bus.clone();
                let chain = self.chain.clone();
                let blocks = self.blocks_to_sync.clone();
                *slot = Some(tokio::spawn(async move {
                    loop {
                        tokio::time::sleep(SYNC_PROGRESS_INTERVAL).await;
                        bus.emit(NodeEvent::SyncProgress {
                            blocks: blocks.load(Ordering::SeqCst),
                            height: chain.height().await,
                        });
                    }
                }));
                trace!("Sync trigger on");
            }
            (_, existing) => *slot = existing,
        }
    }

    /// Periodic entry point: block sync when our tip is stale, then the
    /// unconfirmed transaction and signature backfill.
    pub async fn do_sync(&self) -> Result<(), SyncError> {
        if !self.is_loaded() || self.is_syncing() {
            trace!(loaded = self.is_loaded(), syncing = self.is_syncing(), "Skipping sync");
            return Ok(());
        }

        if self.chain.last_receipt().is_stale() {
            let policy = RetryPolicy::attempts(self.config.retries).with_max_delay(Duration::from_secs(2));
            retry(&policy, "sync blocks", |_| self.sync()).await?;
        }

        if self.config.sync_transactions {
            if let Err(err) = self.load_transactions().await {
                warn!("Failed to load transactions: {err}");
            }
        }
        if self.config.sync_signatures {
            if let Err(err) = self.load_signatures().await {
                warn!("Failed to load signatures: {err}");
            }
        }
        Ok(())
    }

    fn invalid_response(peer: &Peer, reason: impl ToString) -> SyncError {
        SyncError::InvalidResponse {
            peer: peer.key(),
            reason: reason.to_string(),
        }
    }

    /// Pulls unconfirmed transactions from a random peer into the pool, 25 at
    /// a time. A peer that sends a malformed transaction is removed.
    pub async fn load_transactions(&self) -> Result<usize, SyncError> {
        let peer = self.get_random_peer().await?;
        debug!(peer = %peer.key(), "Loading transactions");
        let body = self.transport.request(&peer, PeerRequest::Transactions).await?;
        self.validator
            .check(&body, &schema::LOADER_TRANSACTIONS)
            .map_err(|e| Self::invalid_response(&peer, e))?;

        let transactions = body
            .get("transactions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for raw in &transactions {
            if let Err(e) = self.validator.check(raw, &schema::TRANSACTION) {
                warn!(peer = %peer.key(), "Transaction is not valid, removing peer: {e}");
                self.peers.write().await.remove(&peer);
                self.deprioritize(&peer).await;
                return Err(Self::invalid_response(&peer, e));
            }
        }

        let mut queued = 0;
        for batch in transactions.chunks(TRANSACTION_BATCH) {
            match self.pool.receive_transactions(batch, Some(&peer)).await {
                Ok(count) => queued += count,
                Err(err) => warn!(peer = %peer.key(), size = batch.len(), "Failed to process transactions batch: {err}"),
            }
        }
        if queued > 0 {
            info!(peer = %peer.key(), queued, "Loaded transactions");
        }
        Ok(queued)
    }

    /// Pulls member signatures from a random peer and attaches them one by one.
    pub async fn load_signatures(&self) -> Result<usize, SyncError> {
        let peer = self.get_random_peer().await?;
        debug!(peer = %peer.key(), "Loading signatures");
        let body = self.transport.request(&peer, PeerRequest::Signatures).await?;
        self.validator
            .check(&body, &schema::LOADER_SIGNATURES)
            .map_err(|e| Self::invalid_response(&peer, e))?;
        let bundles: Vec<SignatureBundle> =
            serde_json::from_value(body.get("signatures").cloned().unwrap_or(Value::Array(Vec::new())))
                .map_err(|e| Self::invalid_response(&peer, e))?;

        let mut attached = 0;
        for bundle in &bundles {
            for signature in &bundle.signatures {
                let result = self
                    .signatures_sequence
                    .add_and_promise(|| self.pool.process_signature(&bundle.transaction, *signature))
                    .await;
                match result {
                    Ok(_) => attached += 1,
                    Err(err) => warn!(peer = %peer.key(), transaction = %bundle.transaction, "Failed to process signature: {err}"),
                }
            }
        }
        Ok(attached)
    }

    /// Brings the stored chain up on startup, rebuilding account state when
    /// it disagrees with the blocks.
    pub async fn load_block_chain(&self) -> Result<(), SyncError> {
        let limit = self.config.load_per_iteration;
        let count = self.storage.count_blocks().await?;
        info!(count, "Blocks in storage");

        if count == 0 {
            self.chain.save_genesis().await?;
            return self.load(1, limit, None, true).await;
        }
        if count == 1 {
            return self.load(1, limit, None, true).await;
        }

        let stored = self
            .storage
            .block_by_height(1)
            .await?
            .ok_or_else(|| SyncError::Consistency("Genesis block missing from storage".to_string()))?;
        let expected = &self.spec.genesis_block.header;
        if stored.header.id != expected.id
            || stored.header.payload_hash != expected.payload_hash
            || stored.header.block_signature != expected.block_signature
        {
            error!(stored = %stored.header.id, expected = %expected.id, "Failed to match genesis block with database");
            return Err(SyncError::GenesisMismatch);
        }

        if let Err(err) = self.hook.perform_integrity_checks().await {
            return self.load(count, limit, Some(&err.to_string()), true).await;
        }

        let last = self.storage.last_block().await?.ok_or(ChainError::Empty)?;
        if self.storage.count_accounts_for_block(last.id()).await? == 0 {
            return self
                .load(count, limit, Some("Detected missed blocks in mem_accounts"), true)
                .await;
        }

        let orphaned = self.storage.orphaned_accounts().await?;
        if !orphaned.is_empty() {
            debug!(accounts = orphaned.len(), "Orphaned accounts");
            return self
                .load(count, limit, Some("Detected orphaned blocks in mem_accounts"), true)
                .await;
        }

        if let Err(err) = self.chain.load_last_block().await {
            return self.load(count, limit, Some(&err.to_string()), true).await;
        }

        if let Err(err) = self.hook.check_integrity(count).await {
            return self.load(count, limit, Some(&err.to_string()), true).await;
        }

        let height = self.chain.height().await;
        info!(height, "Blockchain ready");
        self.on_blockchain_ready().await;
        Ok(())
    }

    /// Recreates account state and replays `count` stored blocks, `limit` at
    /// a time. A block that fails replay clips the chain right before it.
    pub async fn load(&self, count: u64, limit: u64, reason: Option<&str>, announce_ready: bool) -> Result<(), SyncError> {
        let limit = limit.max(1);
        if let Some(reason) = reason {
            warn!("{reason}");
            warn!("Recreating memory tables");
            LOADER_REBUILDS.inc();
        }
        self.chain.recreate_accounts().await?;

        let mut offset = 0;
        while count >= offset {
            if count > 1 {
                info!("Rebuilding blockchain, current block height: {}", offset + 1);
            }
            if let Err(err) = self
                .chain
                .load_blocks_offset(limit.min(count + 1 - offset), offset, true)
                .await
            {
                let Some((_, height)) = err.failed_block() else {
                    return Err(err.into());
                };
                error!("Blockchain failed at: {height}: {err}");
                let last_valid = self.chain.last_block().await;
                self.chain.delete_after_block(last_valid.id()).await?;
                error!(height = last_valid.height(), "Blockchain clipped");
                if announce_ready {
                    self.on_blockchain_ready().await;
                }
                return Ok(());
            }
            offset += limit;
        }

        let height = self.chain.height().await;
        info!(height, "Blockchain ready");
        if announce_ready {
            self.on_blockchain_ready().await;
        }
        Ok(())
    }

    pub async fn on_blockchain_ready(&self) {
        self.loaded.store(true, Ordering::SeqCst);
        self.bus.emit(NodeEvent::BlockchainReady);
        self.hook.on_blockchain_ready().await;
    }

    /// Schedules the periodic sync.
    pub fn on_peers_ready(self: &Arc<Self>) -> Result<(), SyncError> {
        let loader = Arc::downgrade(self);
        self.jobs.register(SYNC_TIMER_JOB, self.config.sync_interval, move || {
            let loader = loader.clone();
            async move {
                let Some(loader) = loader.upgrade() else {
                    return;
                };
                trace!("Sync timer tick");
                if let Err(err) = loader.do_sync().await {
                    warn!("Periodic sync failed: {err}");
                }
            }
        })?;
        info!(interval = ?self.config.sync_interval, "Sync timer registered");
        Ok(())
    }

    pub fn cleanup(&self) {
        self.loaded.store(false, Ordering::SeqCst);
        self.jobs.unregister_all();
        self.sync_trigger(false);
        self.chain.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers_at(heights: &[u64]) -> Vec<Peer> {
        heights
            .iter()
            .enumerate()
            .map(|(i, height)| crate::testing::peer(&format!("10.0.0.{}", i + 1), *height))
            .collect()
    }

    #[test]
    fn clusters_around_the_most_common_height() {
        let view = find_good_peers(&peers_at(&[100, 101, 100, 50]), 1);
        assert_eq!(view.height, 100);
        let mut heights: Vec<u64> = view.peers.iter().map(|peer| peer.height).collect();
        heights.sort();
        assert_eq!(heights, vec![100, 100, 101]);
    }

    #[test]
    fn ignores_peers_below_local_height() {
        let view = find_good_peers(&peers_at(&[10, 12, 12, 13]), 12);
        assert_eq!(view.height, 12);
        assert_eq!(view.peers.len(), 3);
        assert_eq!(find_good_peers(&peers_at(&[3, 4]), 5), NetworkView::default());
    }

    #[test]
    fn first_cluster_to_lead_wins_ties() {
        let view = find_good_peers(&peers_at(&[20, 21, 10, 11]), 1);
        assert_eq!(view.height, 20);
        assert_eq!(view.peers.len(), 2);
    }
}
