use crate::{
    account::{normalize_address, Account, AccountDiff, AccountError, AccountLogic},
    block::{Block, BlockError, BlockHeader, BlockLogic},
    bus::{EventBus, NodeEvent},
    metrics::{CHAIN_BLOCK_HEIGHT, CHAIN_PROCESS_BLOCK_TOTALS, CHAIN_REVERTED_BLOCKS},
    network::{PeerRequest, PeerTransport, TransportError},
    peers::Peer,
    pool::{Claimed, TransactionPool},
    schema::{self, Validator},
    spec::ChainSpec,
    store::{self, DbOp, Storage, StorageError},
    system::SystemInfo,
    transaction::{TransactionError, TransactionLogic, VerifyError},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::{SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::*;

/// Distance between the heights sampled when looking for a common block.
pub const ROUND_LENGTH: u64 = 101;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error("Transaction {id} failed verification: {source}")]
    Verify {
        id: String,
        #[source]
        source: VerifyError,
    },
    #[error(transparent)]
    Account(#[from] AccountError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Block {id} at height {height} failed: {source}")]
    InvalidBlock {
        id: String,
        height: u64,
        #[source]
        source: Box<ChainError>,
    },
    #[error("Invalid response from {peer}: {reason}")]
    InvalidResponse { peer: String, reason: String },
    #[error("Failed to find common block with {0}")]
    NoCommonBlock(String),
    #[error("Chain comparison failed with {0}")]
    ChainComparisonFailed(String),
    #[error("Transaction is already confirmed: {0}")]
    AlreadyConfirmed(String),
    #[error("No blocks stored")]
    Empty,
    #[error("Cannot undo the genesis block")]
    UndoGenesis,
}

impl ChainError {
    /// Id and height of the block this failure is bound to, if any.
    pub fn failed_block(&self) -> Option<(&str, u64)> {
        match self {
            ChainError::InvalidBlock { id, height, .. } => Some((id.as_str(), *height)),
            _ => None,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            ChainError::Block(_) => "block",
            ChainError::Transaction(_) | ChainError::Verify { .. } | ChainError::AlreadyConfirmed(_) => {
                "transaction"
            }
            ChainError::Account(_) => "account",
            ChainError::Storage(_) => "storage",
            ChainError::InvalidBlock { source, .. } => source.reason(),
            _ => "other",
        }
    }
}

/// Minimal header the peer returns for a shared block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonBlock {
    pub id: String,
    pub previous_block: String,
    pub height: u64,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

/// When the last block was received, in unix seconds.
#[derive(Debug)]
pub struct LastReceipt {
    received_at: Mutex<Option<u64>>,
    stale_after: u64,
}

impl LastReceipt {
    pub fn new(stale_after: u64) -> Self {
        Self {
            received_at: Mutex::new(None),
            stale_after,
        }
    }

    pub fn update(&self, unix_secs: u64) {
        *self.received_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(unix_secs);
    }

    pub fn get(&self) -> Option<u64> {
        *self.received_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale_at(unix_now())
    }

    pub fn is_stale_at(&self, now: u64) -> bool {
        match self.get() {
            None => true,
            Some(received) => now.saturating_sub(received) > self.stale_after,
        }
    }
}

/// Account rows touched while applying or undoing one block, with the
/// operations that persist them.
struct Ledger<'a> {
    accounts: &'a AccountLogic,
    rows: HashMap<String, Account>,
    unstored: HashSet<String>,
    ops: Vec<DbOp>,
}

impl<'a> Ledger<'a> {
    fn new(accounts: &'a AccountLogic) -> Self {
        Self {
            accounts,
            rows: HashMap::new(),
            unstored: HashSet::new(),
            ops: Vec::new(),
        }
    }

    /// Current view of `address`, including changes staged by earlier transactions.
    async fn load(&mut self, address: &str) -> Result<Account, ChainError> {
        let address = normalize_address(address);
        if let Some(row) = self.rows.get(&address) {
            return Ok(row.clone());
        }
        let row = match self.accounts.get_by_address(&address).await? {
            Some(row) => row,
            None => {
                self.unstored.insert(address.clone());
                Account::new(&address)
            }
        };
        self.rows.insert(address, row.clone());
        Ok(row)
    }

    async fn apply(&mut self, address: &str, diff: &AccountDiff) -> Result<(), ChainError> {
        let mut row = self.load(address).await?;
        if self.unstored.remove(&row.address) {
            self.ops.push(DbOp::EnsureAccount(Account::new(&row.address)));
        }
        let ops = self.accounts.merge(&row.address, diff)?;
        for op in &ops {
            if let DbOp::UpdateAccount { changes, .. } = op {
                for change in changes {
                    store::apply_change(&mut row, change)?;
                }
            }
        }
        self.rows.insert(row.address.clone(), row);
        self.ops.extend(ops);
        Ok(())
    }

    fn into_ops(self) -> Vec<DbOp> {
        self.ops
    }
}

pub struct BlockChain {
    spec: Arc<ChainSpec>,
    storage: Arc<dyn Storage>,
    accounts: Arc<AccountLogic>,
    transactions: Arc<TransactionLogic>,
    blocks: Arc<BlockLogic>,
    system: Arc<SystemInfo>,
    transport: Arc<dyn PeerTransport>,
    validator: Arc<dyn Validator>,
    pool: Arc<TransactionPool>,
    bus: EventBus,
    last_block: RwLock<Block>,
    last_receipt: LastReceipt,
    cleaning: AtomicBool,
}

impl BlockChain {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        spec: Arc<ChainSpec>,
        storage: Arc<dyn Storage>,
        accounts: Arc<AccountLogic>,
        transactions: Arc<TransactionLogic>,
        blocks: Arc<BlockLogic>,
        system: Arc<SystemInfo>,
        transport: Arc<dyn PeerTransport>,
        validator: Arc<dyn Validator>,
        pool: Arc<TransactionPool>,
        bus: EventBus,
    ) -> Self {
        let genesis = spec.genesis_block.clone();
        let stale_after = spec.block_time;
        Self {
            spec,
            storage,
            accounts,
            transactions,
            blocks,
            system,
            transport,
            validator,
            pool,
            bus,
            last_block: RwLock::new(genesis),
            last_receipt: LastReceipt::new(stale_after),
            cleaning: AtomicBool::new(false),
        }
    }

    pub async fn last_block(&self) -> Block {
        self.last_block.read().await.clone()
    }

    pub async fn height(&self) -> u64 {
        self.last_block.read().await.height()
    }

    pub fn last_receipt(&self) -> &LastReceipt {
        &self.last_receipt
    }

    pub fn is_cleaning(&self) -> bool {
        self.cleaning.load(Ordering::SeqCst)
    }

    /// Stops block loading loops at their next block boundary.
    pub fn cleanup(&self) {
        self.cleaning.store(true, Ordering::SeqCst);
    }

    async fn set_last_block(&self, block: Block) {
        self.system.update(&block.header);
        CHAIN_BLOCK_HEIGHT.set(block.height() as i64);
        *self.last_block.write().await = block;
    }

    /// Stores the configured genesis block unless it is already present.
    /// Account state is built later, when the chain is replayed.
    pub async fn save_genesis(&self) -> Result<(), ChainError> {
        let genesis = &self.spec.genesis_block;
        if self.storage.block_by_id(genesis.id()).await?.is_some() {
            return Ok(());
        }
        self.blocks.verify_payload(genesis)?;
        if !self.blocks.verify_signature(&genesis.header) {
            return Err(BlockError::InvalidSignature.into());
        }
        let mut ops = vec![self.blocks.db_save_op(genesis)];
        ops.extend(
            genesis
                .transactions
                .iter()
                .map(|tx| self.transactions.db_save_op(tx, genesis.id())),
        );
        self.storage.commit(ops).await?;
        info!(id = %genesis.id(), "Saved genesis block");
        Ok(())
    }

    /// Applies `block` on top of the current last block. Ledger changes, and
    /// with `save` the block itself, are committed in one batch; on error
    /// nothing is written.
    pub async fn apply_block(&self, block: &Block, verify: bool, save: bool) -> Result<(), ChainError> {
        match self.apply_block_inner(block, verify, save).await {
            Ok(()) => {
                CHAIN_PROCESS_BLOCK_TOTALS.with_label_values(&["applied"]).inc();
                self.set_last_block(block.clone()).await;
                self.bus.emit(NodeEvent::BlockApplied {
                    id: block.id().to_string(),
                    height: block.height(),
                    transactions: block.transactions.iter().map(|tx| tx.id.clone()).collect(),
                });
                debug!(id = %block.id(), height = block.height(), "Applied block");
                Ok(())
            }
            Err(source) => {
                CHAIN_PROCESS_BLOCK_TOTALS
                    .with_label_values(&[source.reason()])
                    .inc();
                warn!(id = %block.id(), height = block.height(), "Block rejected: {source}");
                Err(ChainError::InvalidBlock {
                    id: block.id().to_string(),
                    height: block.height(),
                    source: Box::new(source),
                })
            }
        }
    }

    async fn apply_block_inner(&self, block: &Block, verify: bool, save: bool) -> Result<(), ChainError> {
        let genesis = block.is_genesis();
        if genesis {
            if block.id() != self.spec.genesis_block.id() {
                return Err(BlockError::GenesisMismatch.into());
            }
        } else if verify {
            let last = self.last_block.read().await.header.clone();
            self.blocks.verify_block(block, &last)?;
        }
        if save && !genesis {
            for tx in &block.transactions {
                if self.storage.transaction_exists(&tx.id).await? {
                    return Err(ChainError::AlreadyConfirmed(tx.id.clone()));
                }
            }
        }

        let ids: Vec<String> = block.transactions.iter().map(|tx| tx.id.clone()).collect();
        let claimed = self.pool.claim(&ids).await;
        match self.commit_block(block, verify, save, &claimed).await {
            Ok(()) => Ok(()),
            Err(error) => {
                self.pool.restore(claimed).await;
                Err(error)
            }
        }
    }

    /// Stages the ledger effects of `block` and commits them. Reservations
    /// held by `claimed` pool entries are released in the same batch.
    async fn commit_block(&self, block: &Block, verify: bool, save: bool, claimed: &Claimed) -> Result<(), ChainError> {
        let genesis = block.is_genesis();
        let block_id = block.id().to_string();
        let mut ledger = Ledger::new(&self.accounts);
        for tx in claimed.reserved() {
            let effect = self.transactions.undo_unconfirmed_effect(tx);
            ledger.apply(&effect.address, &effect.diff).await?;
        }
        for tx in &block.transactions {
            if verify && !genesis {
                let sender = ledger
                    .load(&self.transactions.generate_address(&tx.sender_public_key))
                    .await?;
                let requester = match &tx.requester_public_key {
                    Some(key) => Some(ledger.load(&self.transactions.generate_address(key)).await?),
                    None => None,
                };
                self.transactions
                    .verify(tx, &sender, requester.as_ref(), block.height())
                    .map_err(|source| ChainError::Verify {
                        id: tx.id.clone(),
                        source,
                    })?;
            }
            for effect in self.transactions.apply_effects(tx, genesis)? {
                let diff = AccountDiff {
                    block_id: Some(block_id.clone()),
                    ..effect.diff
                };
                ledger.apply(&effect.address, &diff).await?;
            }
        }

        let generator = &block.header.generator_public_key;
        let earned = i128::from(block.header.reward) + i128::from(block.header.total_fee);
        ledger
            .apply(
                &self.accounts.generate_address(generator),
                &AccountDiff {
                    public_key: Some(*generator),
                    balance: Some(earned),
                    u_balance: Some(earned),
                    block_id: Some(block_id.clone()),
                    ..Default::default()
                },
            )
            .await?;

        let mut ops = Vec::new();
        if save {
            ops.push(self.blocks.db_save_op(block));
            ops.extend(
                block
                    .transactions
                    .iter()
                    .map(|tx| self.transactions.db_save_op(tx, &block_id)),
            );
        }
        ops.extend(ledger.into_ops());
        self.storage.commit(ops).await?;
        Ok(())
    }

    /// Reverts the last block's ledger changes and deletes it. Returns the new last block.
    pub async fn undo_block(&self) -> Result<BlockHeader, ChainError> {
        let last = self.last_block().await;
        let previous_id = match (&last.header.previous_block, last.is_genesis()) {
            (Some(previous_id), false) => previous_id.clone(),
            _ => return Err(ChainError::UndoGenesis),
        };
        let previous = self
            .storage
            .block_by_id(&previous_id)
            .await?
            .ok_or_else(|| StorageError::BlockNotFound(previous_id.clone()))?;

        let mut ledger = Ledger::new(&self.accounts);
        let generator = &last.header.generator_public_key;
        let earned = i128::from(last.header.reward) + i128::from(last.header.total_fee);
        ledger
            .apply(
                &self.accounts.generate_address(generator),
                &AccountDiff {
                    balance: Some(-earned),
                    u_balance: Some(-earned),
                    block_id: Some(previous_id.clone()),
                    ..Default::default()
                },
            )
            .await?;
        for tx in last.transactions.iter().rev() {
            for effect in self.transactions.undo_effects(tx, false)? {
                let diff = AccountDiff {
                    block_id: Some(previous_id.clone()),
                    ..effect.diff
                };
                ledger.apply(&effect.address, &diff).await?;
            }
        }

        let mut ops = ledger.into_ops();
        ops.push(DbOp::DeleteBlock {
            id: last.id().to_string(),
        });
        self.storage.commit(ops).await?;

        CHAIN_REVERTED_BLOCKS.inc();
        self.bus.emit(NodeEvent::BlockReverted {
            id: last.id().to_string(),
            height: last.height(),
        });
        info!(id = %last.id(), height = last.height(), "Undid block");
        let header = previous.header.clone();
        self.set_last_block(previous).await;
        Ok(header)
    }

    /// Truncates the chain to end at block `id`: applied blocks above it are
    /// undone, stored blocks above it are deleted.
    pub async fn delete_after_block(&self, id: &str) -> Result<usize, ChainError> {
        let target = self
            .storage
            .block_by_id(id)
            .await?
            .ok_or_else(|| StorageError::BlockNotFound(id.to_string()))?;
        let mut removed = 0;
        while self.height().await > target.height() {
            self.undo_block().await?;
            removed += 1;
        }
        removed += self.storage.delete_blocks_after(target.height()).await?;
        info!(id, height = target.height(), removed, "Deleted blocks after");
        Ok(removed)
    }

    /// Ids of the block at `height`, blocks up to five rounds below it, and genesis.
    async fn id_sequence(&self, height: u64) -> Result<Vec<String>, ChainError> {
        let mut heights = vec![height];
        let mut current = height;
        for _ in 0..5 {
            if current <= ROUND_LENGTH {
                break;
            }
            current -= ROUND_LENGTH;
            heights.push(current);
        }
        heights.push(1);
        heights.dedup();

        let mut ids = Vec::with_capacity(heights.len());
        for height in heights {
            if let Some(block) = self.storage.block_by_height(height).await? {
                ids.push(block.header.id);
            }
        }
        Ok(ids)
    }

    /// Highest block shared with `peer`, cross-checked against our own copy.
    pub async fn get_common_block(&self, peer: &Peer, height: u64) -> Result<CommonBlock, ChainError> {
        let ids = self.id_sequence(height).await?;
        let body = self
            .transport
            .request(peer, PeerRequest::CommonBlock { ids })
            .await?;
        self.validator
            .check(&body, &schema::COMMON_BLOCK_RESPONSE)
            .map_err(|e| ChainError::InvalidResponse {
                peer: peer.key(),
                reason: e.to_string(),
            })?;
        let common: Option<CommonBlock> = serde_json::from_value(body.get("common").cloned().unwrap_or(Value::Null))
            .map_err(|e| ChainError::InvalidResponse {
                peer: peer.key(),
                reason: e.to_string(),
            })?;
        let common = common.ok_or_else(|| ChainError::NoCommonBlock(peer.key()))?;

        match self.storage.block_by_id(&common.id).await? {
            Some(local)
                if local.height() == common.height
                    && local.header.previous_block.as_deref() == Some(common.previous_block.as_str()) =>
            {
                debug!(peer = %peer.key(), id = %common.id, height = common.height, "Found common block");
                Ok(common)
            }
            _ => Err(ChainError::ChainComparisonFailed(peer.key())),
        }
    }

    /// Fetches the blocks following our last block from `peer` and applies
    /// them in order. Returns the last block that applied cleanly; blocks
    /// applied before a failure stay applied.
    pub async fn load_blocks_from_peer(&self, peer: &Peer) -> Result<BlockHeader, ChainError> {
        let mut last_valid = self.last_block.read().await.header.clone();
        info!(peer = %peer.key(), "Loading blocks");
        let body = self
            .transport
            .request(
                peer,
                PeerRequest::BlocksAfter {
                    last_block_id: last_valid.id.clone(),
                    limit: self.spec.blocks_per_request,
                },
            )
            .await?;
        let raw_blocks = body
            .get("blocks")
            .and_then(Value::as_array)
            .ok_or_else(|| ChainError::InvalidResponse {
                peer: peer.key(),
                reason: "missing blocks".to_string(),
            })?;

        for raw in raw_blocks {
            if self.is_cleaning() {
                break;
            }
            let block = self.blocks.object_normalize(raw).map_err(|e| ChainError::InvalidBlock {
                id: raw.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
                height: raw.get("height").and_then(Value::as_u64).unwrap_or_default(),
                source: Box::new(e.into()),
            })?;
            self.apply_block(&block, true, true).await?;
            info!(id = %block.id(), height = block.height(), peer = %peer.key(), "Block loaded");
            last_valid = block.header;
        }
        Ok(last_valid)
    }

    /// Replays stored blocks `offset + 1 ..= offset + limit` into the ledger.
    pub async fn load_blocks_offset(&self, limit: u64, offset: u64, verify: bool) -> Result<BlockHeader, ChainError> {
        let blocks = self.storage.blocks_in_range(offset + 1, limit).await?;
        trace!(offset, limit, count = blocks.len(), "Replaying blocks");
        for block in &blocks {
            if self.is_cleaning() {
                break;
            }
            self.apply_block(block, verify, false).await?;
        }
        Ok(self.last_block.read().await.header.clone())
    }

    pub async fn load_last_block(&self) -> Result<Block, ChainError> {
        let block = self.storage.last_block().await?.ok_or(ChainError::Empty)?;
        self.set_last_block(block.clone()).await;
        debug!(id = %block.id(), height = block.height(), "Loaded last block");
        Ok(block)
    }

    pub async fn recreate_accounts(&self) -> Result<(), ChainError> {
        self.accounts.recreate_tables().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        account::AccountFilter,
        crypto::{self, Keypair},
        testing::{self, MockTransport, COIN, SEND_FEE},
    };

    async fn booted() -> (testing::TestNode, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::default());
        let node = testing::boot(transport.clone()).await;
        (node, transport)
    }

    async fn balance(node: &testing::TestNode, keypair: &Keypair) -> u64 {
        let address = crypto::address_from_public_key(&keypair.public_key(), crypto::ADDRESS_SUFFIX);
        node.accounts
            .get(&AccountFilter::by_address(&address))
            .await
            .unwrap()
            .map_or(0, |account| account.balance)
    }

    #[tokio::test]
    async fn applies_transfers_and_generator_income() {
        let (node, _) = booted().await;
        let alice = Keypair::from_passphrase("alice");
        let alice_address = crypto::address_from_public_key(&alice.public_key(), "R");
        let blocks = testing::extend(&node.spec, &node.chain.last_block().await.header, 1, |_| {
            vec![testing::send(&testing::faucet(), &alice_address, 10 * COIN, 10)]
        });
        node.chain.apply_block(&blocks[0], true, true).await.unwrap();

        let reward = node.spec.reward_at(2);
        assert_eq!(balance(&node, &alice).await, 10 * COIN);
        assert_eq!(
            balance(&node, &testing::faucet()).await,
            crate::spec::DEV_FAUCET_SUPPLY - 10 * COIN - SEND_FEE
        );
        assert_eq!(balance(&node, &testing::generator()).await, reward + SEND_FEE);
        assert_eq!(node.chain.height().await, 2);
        assert_eq!(node.system.height(), 2);

        let faucet = node
            .accounts
            .get_by_address(&crypto::address_from_public_key(&testing::faucet().public_key(), "R"))
            .await
            .unwrap()
            .unwrap();
        assert!(!faucet.virgin);
        assert_eq!(faucet.block_id.as_deref(), Some(blocks[0].id()));
    }

    #[tokio::test]
    async fn failing_transaction_rejects_whole_block() {
        let (node, _) = booted().await;
        let broke = Keypair::from_passphrase("broke");
        let blocks = testing::extend(&node.spec, &node.chain.last_block().await.header, 1, |_| {
            vec![
                testing::send(&testing::faucet(), "1R", COIN, 10),
                testing::send(&broke, "1R", COIN, 10),
            ]
        });
        let error = node.chain.apply_block(&blocks[0], true, true).await.unwrap_err();
        assert_eq!(error.failed_block(), Some((blocks[0].id(), 2)));
        assert!(matches!(
            error,
            ChainError::InvalidBlock { ref source, .. } if matches!(**source, ChainError::Verify { .. })
        ));
        assert_eq!(node.storage.count_blocks().await.unwrap(), 1);
        assert_eq!(node.chain.height().await, 1);
        assert_eq!(balance(&node, &testing::generator()).await, 0);
    }

    #[tokio::test]
    async fn replayed_transactions_are_rejected() {
        let (node, _) = booted().await;
        let alice = crypto::address_from_public_key(&Keypair::from_passphrase("alice").public_key(), "R");
        let tx = testing::send(&testing::faucet(), &alice, COIN, 10);
        let blocks = testing::extend(&node.spec, &node.chain.last_block().await.header, 2, |_| vec![tx.clone()]);
        node.chain.apply_block(&blocks[0], true, true).await.unwrap();

        let error = node.chain.apply_block(&blocks[1], true, true).await.unwrap_err();
        assert!(matches!(
            error,
            ChainError::InvalidBlock { ref source, .. }
                if matches!(**source, ChainError::AlreadyConfirmed(ref id) if *id == tx.id)
        ));
        assert_eq!(node.chain.height().await, 2);
        assert_eq!(balance(&node, &Keypair::from_passphrase("alice")).await, COIN);
    }

    #[tokio::test]
    async fn relabelled_copies_are_rejected() {
        let (node, _) = booted().await;
        let alice = crypto::address_from_public_key(&Keypair::from_passphrase("alice").public_key(), "R");
        let tx = testing::send(&testing::faucet(), &alice, COIN, 10);
        let mut copy = tx.clone();
        copy.id = "1".into();
        let blocks = testing::extend(&node.spec, &node.chain.last_block().await.header, 1, |_| {
            vec![tx.clone(), copy.clone()]
        });

        let error = node.chain.apply_block(&blocks[0], true, true).await.unwrap_err();
        assert!(matches!(
            error,
            ChainError::InvalidBlock { ref source, .. } if matches!(
                **source,
                ChainError::Verify {
                    ref id,
                    source: VerifyError::Transaction(TransactionError::IdMismatch { .. }),
                } if id == "1"
            )
        ));
        assert_eq!(node.chain.height().await, 1);
        assert_eq!(balance(&node, &Keypair::from_passphrase("alice")).await, 0);
    }

    #[tokio::test]
    async fn confirmation_releases_pool_reservations() {
        let (node, _) = booted().await;
        let faucet_address = crypto::address_from_public_key(&testing::faucet().public_key(), "R");
        let tx = testing::send(&testing::faucet(), "1R", COIN, 10);
        let queued = testing::send(&testing::faucet(), "1R", 2 * COIN, 11);
        node.pool
            .receive_transactions(
                &[serde_json::to_value(&tx).unwrap(), serde_json::to_value(&queued).unwrap()],
                None,
            )
            .await
            .unwrap();

        let blocks = testing::extend(&node.spec, &node.chain.last_block().await.header, 1, |_| vec![tx.clone()]);
        node.chain.apply_block(&blocks[0], true, true).await.unwrap();

        assert!(!node.pool.contains(&tx.id).await);
        assert!(node.pool.contains(&queued.id).await);
        let faucet = node.accounts.get_by_address(&faucet_address).await.unwrap().unwrap();
        assert_eq!(faucet.balance, crate::spec::DEV_FAUCET_SUPPLY - COIN - SEND_FEE);
        assert_eq!(faucet.u_balance, faucet.balance - 2 * COIN - SEND_FEE);
    }

    #[tokio::test]
    async fn failed_block_hands_transactions_back_to_the_pool() {
        let (node, _) = booted().await;
        let tx = testing::send(&testing::faucet(), "1R", COIN, 10);
        node.pool
            .receive_transactions(&[serde_json::to_value(&tx).unwrap()], None)
            .await
            .unwrap();
        let broke = testing::send(&Keypair::from_passphrase("broke"), "1R", COIN, 10);
        let blocks = testing::extend(&node.spec, &node.chain.last_block().await.header, 1, |_| {
            vec![tx.clone(), broke.clone()]
        });

        assert!(node.chain.apply_block(&blocks[0], true, true).await.is_err());
        assert_eq!(node.pool.unconfirmed().await, vec![tx]);
    }

    #[tokio::test]
    async fn undo_restores_balances() {
        let (node, _) = booted().await;
        let alice = Keypair::from_passphrase("alice");
        let alice_address = crypto::address_from_public_key(&alice.public_key(), "R");
        let genesis = node.chain.last_block().await.header;
        let blocks = testing::extend(&node.spec, &genesis, 2, |height| {
            vec![testing::send(&testing::faucet(), &alice_address, COIN, height as u32)]
        });
        for block in &blocks {
            node.chain.apply_block(block, true, true).await.unwrap();
        }
        assert_eq!(balance(&node, &alice).await, 2 * COIN);

        let previous = node.chain.undo_block().await.unwrap();
        assert_eq!(previous.id, blocks[0].header.id);
        assert_eq!(balance(&node, &alice).await, COIN);
        assert_eq!(node.storage.count_blocks().await.unwrap(), 2);

        assert_eq!(node.chain.delete_after_block(&genesis.id).await.unwrap(), 1);
        assert_eq!(balance(&node, &alice).await, 0);
        assert_eq!(balance(&node, &testing::generator()).await, 0);
        assert_eq!(
            balance(&node, &testing::faucet()).await,
            crate::spec::DEV_FAUCET_SUPPLY
        );
        assert!(matches!(node.chain.undo_block().await, Err(ChainError::UndoGenesis)));
    }

    #[tokio::test]
    async fn common_block_is_cross_checked() {
        let (node, transport) = booted().await;
        let blocks = testing::extend(&node.spec, &node.chain.last_block().await.header, 3, |_| Vec::new());
        for block in &blocks {
            node.chain.apply_block(block, true, true).await.unwrap();
        }
        let peer = testing::peer("10.0.0.1", 4);
        transport.serve_chain(&peer, testing::with_genesis(&node.spec, &blocks));

        let common = node.chain.get_common_block(&peer, 4).await.unwrap();
        assert_eq!(common.id, blocks[2].header.id);

        let stranger = testing::peer("10.0.0.2", 4);
        transport.serve_chain(&stranger, Vec::new());
        assert!(matches!(
            node.chain.get_common_block(&stranger, 4).await,
            Err(ChainError::NoCommonBlock(_))
        ));
    }

    #[tokio::test]
    async fn loads_blocks_from_peer_until_first_invalid() {
        let (node, transport) = booted().await;
        let mut blocks = testing::extend(&node.spec, &node.chain.last_block().await.header, 3, |_| Vec::new());
        blocks[2].header.reward += 1;
        let peer = testing::peer("10.0.0.1", 4);
        transport.serve_chain(&peer, testing::with_genesis(&node.spec, &blocks));

        let error = node.chain.load_blocks_from_peer(&peer).await.unwrap_err();
        assert_eq!(error.failed_block().map(|(_, height)| height), Some(4));
        assert_eq!(node.chain.height().await, 3);
        assert_eq!(node.chain.last_block().await.header, blocks[1].header);
    }

    #[tokio::test]
    async fn replays_stored_blocks_after_account_reset() {
        let (node, _) = booted().await;
        let alice = Keypair::from_passphrase("alice");
        let alice_address = crypto::address_from_public_key(&alice.public_key(), "R");
        let blocks = testing::extend(&node.spec, &node.chain.last_block().await.header, 2, |height| {
            vec![testing::send(&testing::faucet(), &alice_address, COIN, height as u32)]
        });
        for block in &blocks {
            node.chain.apply_block(block, true, true).await.unwrap();
        }

        node.chain.recreate_accounts().await.unwrap();
        assert_eq!(balance(&node, &alice).await, 0);
        let last = node.chain.load_blocks_offset(10, 0, true).await.unwrap();
        assert_eq!(last.id, blocks[1].header.id);
        assert_eq!(balance(&node, &alice).await, 2 * COIN);
        assert_eq!(node.storage.count_blocks().await.unwrap(), 3);
    }

    #[test]
    fn last_receipt_goes_stale() {
        let receipt = LastReceipt::new(30);
        assert!(receipt.is_stale_at(100));
        receipt.update(100);
        assert!(!receipt.is_stale_at(130));
        assert!(receipt.is_stale_at(131));
    }
}
