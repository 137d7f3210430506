//! Unconfirmed transactions and multisignature transactions still collecting
//! member signatures. Queued transactions reserve their spend in the sender's
//! `u_balance` until they are confirmed or dropped.

use crate::{
    account::{Account, AccountError, AccountLogic},
    bus::{EventBus, NodeEvent},
    crypto::{PublicKey, Signature},
    metrics::{POOL_SIGNATURE_TOTALS, POOL_TRANSACTION_TOTALS},
    peers::Peer,
    serde_utils::hex_array_vec,
    store::{Storage, StorageError},
    system::SystemInfo,
    transaction::{self, KeysgroupEntry, Transaction, TransactionError, TransactionLogic, TransactionType, VerifyError},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::*;

/// How long a ready transaction may wait for a block.
pub const UNCONFIRMED_TIMEOUT: Duration = Duration::from_secs(3 * 60 * 60);
/// Upper bound on each of the two queues.
pub const MAX_QUEUED: usize = 1000;
pub const EXPIRY_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error("Transaction {id} rejected: {source}")]
    Verify {
        id: String,
        #[source]
        source: VerifyError,
    },
    #[error(transparent)]
    Account(#[from] AccountError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Transaction is already confirmed: {0}")]
    AlreadyConfirmed(String),
    #[error("Transaction pool is full")]
    Full,
    #[error("Transaction not found: {0}")]
    UnknownTransaction(String),
    #[error("Signature already attached to {0}")]
    DuplicateSignature(String),
    #[error("Failed to verify signature for {0}")]
    InvalidSignature(String),
}

/// Member signatures gathered by a peer for one pending transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureBundle {
    pub transaction: String,
    #[serde(with = "hex_array_vec")]
    pub signatures: Vec<Signature>,
}

#[derive(Debug, Clone)]
struct Queued {
    tx: Transaction,
    received: Instant,
    ttl: Duration,
}

impl Queued {
    fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.received) >= self.ttl
    }
}

#[derive(Default)]
struct Queues {
    unconfirmed: Vec<Queued>,
    pending: Vec<Queued>,
}

impl Queues {
    fn contains(&self, id: &str) -> bool {
        self.unconfirmed.iter().chain(&self.pending).any(|queued| queued.tx.id == id)
    }
}

/// Pool entries taken out by a block being applied. Transactions in
/// [`reserved`](Self::reserved) still hold their `u_balance` reservation;
/// the block's ledger batch must release it.
#[derive(Default)]
pub struct Claimed {
    unconfirmed: Vec<Queued>,
    pending: Vec<Queued>,
}

impl Claimed {
    pub fn reserved(&self) -> impl Iterator<Item = &Transaction> {
        self.unconfirmed.iter().map(|queued| &queued.tx)
    }

    pub fn is_empty(&self) -> bool {
        self.unconfirmed.is_empty() && self.pending.is_empty()
    }
}

pub struct TransactionPool {
    transactions: Arc<TransactionLogic>,
    accounts: Arc<AccountLogic>,
    storage: Arc<dyn Storage>,
    system: Arc<SystemInfo>,
    bus: EventBus,
    queues: RwLock<Queues>,
}

impl TransactionPool {
    pub fn new(
        transactions: Arc<TransactionLogic>,
        accounts: Arc<AccountLogic>,
        storage: Arc<dyn Storage>,
        system: Arc<SystemInfo>,
        bus: EventBus,
    ) -> Self {
        Self {
            transactions,
            accounts,
            storage,
            system,
            bus,
            queues: RwLock::new(Queues::default()),
        }
    }

    async fn account_for(&self, public_key: &PublicKey) -> Result<Account, AccountError> {
        let address = self.transactions.generate_address(public_key);
        Ok(self
            .accounts
            .get_by_address(&address)
            .await?
            .unwrap_or_else(|| Account::new(&address)))
    }

    async fn reserve(&self, tx: &Transaction) -> Result<(), PoolError> {
        let effect = self.transactions.unconfirmed_effect(tx);
        let ops = self.accounts.merge(&effect.address, &effect.diff)?;
        self.storage.commit(ops).await?;
        Ok(())
    }

    async fn release(&self, tx: &Transaction) -> Result<(), PoolError> {
        let effect = self.transactions.undo_unconfirmed_effect(tx);
        let ops = self.accounts.merge(&effect.address, &effect.diff)?;
        self.storage.commit(ops).await?;
        Ok(())
    }

    /// How long a parked multisignature transaction may collect signatures.
    fn pending_lifetime(tx: &Transaction, sender: &Account) -> Duration {
        let hours = match tx.multisignature() {
            Some(asset) => u64::from(asset.lifetime),
            None => u64::from(sender.multilifetime),
        };
        Duration::from_secs(hours * 60 * 60)
    }

    /// Normalizes, verifies and queues `batch`, stopping at the first invalid
    /// transaction. Already known transactions are skipped. Returns how many
    /// were newly queued or parked.
    pub async fn receive_transactions(&self, batch: &[Value], peer: Option<&Peer>) -> Result<usize, PoolError> {
        let origin = peer.map_or_else(|| "local".to_string(), Peer::key);
        let height = self.system.height() + 1;
        let mut queued = 0;

        for raw in batch {
            let tx = self.transactions.object_normalize(raw).map_err(|e| {
                POOL_TRANSACTION_TOTALS.with_label_values(&["malformed"]).inc();
                e
            })?;
            let mut queues = self.queues.write().await;
            if queues.contains(&tx.id) {
                trace!(id = %tx.id, "Transaction already queued");
                continue;
            }
            if self.storage.transaction_exists(&tx.id).await? {
                POOL_TRANSACTION_TOTALS.with_label_values(&["rejected"]).inc();
                debug!(id = %tx.id, peer = %origin, "Rejected confirmed transaction");
                return Err(PoolError::AlreadyConfirmed(tx.id));
            }

            let sender = self.account_for(&tx.sender_public_key).await?;
            let requester = match &tx.requester_public_key {
                Some(key) => Some(self.account_for(key).await?),
                None => None,
            };

            let verdict = match self.transactions.verify(&tx, &sender, requester.as_ref(), height) {
                Ok(()) => self.transactions.verify_unconfirmed_balance(&tx, &sender).map(|()| false),
                Err(VerifyError::MultisigNotReady) => Ok(true),
                Err(source) => Err(source),
            };
            let parked = match verdict {
                Ok(parked) => parked,
                Err(source) => {
                    POOL_TRANSACTION_TOTALS.with_label_values(&["rejected"]).inc();
                    debug!(id = %tx.id, peer = %origin, "Rejected transaction: {source}");
                    return Err(PoolError::Verify { id: tx.id, source });
                }
            };

            let now = Instant::now();
            if parked {
                if queues.pending.len() >= MAX_QUEUED {
                    return Err(PoolError::Full);
                }
                POOL_TRANSACTION_TOTALS.with_label_values(&["pending"]).inc();
                debug!(id = %tx.id, peer = %origin, "Parked multisignature transaction");
                let ttl = Self::pending_lifetime(&tx, &sender);
                queues.pending.push(Queued { tx, received: now, ttl });
            } else {
                if queues.unconfirmed.len() >= MAX_QUEUED {
                    return Err(PoolError::Full);
                }
                self.reserve(&tx).await?;
                POOL_TRANSACTION_TOTALS.with_label_values(&["accepted"]).inc();
                debug!(id = %tx.id, peer = %origin, "Queued transaction");
                queues.unconfirmed.push(Queued {
                    tx,
                    received: now,
                    ttl: UNCONFIRMED_TIMEOUT,
                });
            }
            queued += 1;
        }

        if queued > 0 {
            self.bus.emit(NodeEvent::TransactionsQueued { count: queued });
        }
        Ok(queued)
    }

    /// Attaches a member signature to a parked transaction. Returns true once
    /// the transaction is ready and has moved to the unconfirmed queue.
    pub async fn process_signature(&self, tx_id: &str, signature: Signature) -> Result<bool, PoolError> {
        let result = self.attach_signature(tx_id, signature).await;
        let status = match &result {
            Ok(true) => "promoted",
            Ok(false) => "accepted",
            Err(_) => "rejected",
        };
        POOL_SIGNATURE_TOTALS.with_label_values(&[status]).inc();
        result
    }

    async fn attach_signature(&self, tx_id: &str, signature: Signature) -> Result<bool, PoolError> {
        let mut queues = self.queues.write().await;
        let index = queues
            .pending
            .iter()
            .position(|pending| pending.tx.id == tx_id)
            .ok_or_else(|| PoolError::UnknownTransaction(tx_id.to_string()))?;
        let mut tx = queues.pending[index].tx.clone();
        if tx.signatures.contains(&signature) {
            return Err(PoolError::DuplicateSignature(tx_id.to_string()));
        }

        let sender = self.account_for(&tx.sender_public_key).await?;
        let members: Vec<PublicKey> = match (tx.kind, tx.multisignature()) {
            (TransactionType::Multisignature, Some(asset)) => {
                asset.keysgroup.iter().filter_map(KeysgroupEntry::public_key).collect()
            }
            _ => sender.multisignature_keys(),
        };
        if !members
            .iter()
            .any(|key| transaction::verify_member_signature(&tx, &signature, key))
        {
            return Err(PoolError::InvalidSignature(tx_id.to_string()));
        }
        tx.signatures.push(signature);
        if !self.transactions.ready(&tx, &sender) {
            queues.pending[index].tx = tx;
            debug!(id = tx_id, "Attached member signature");
            return Ok(false);
        }

        let entry = queues.pending.remove(index);
        if let Err(source) = self.transactions.verify_unconfirmed_balance(&tx, &sender) {
            warn!(id = tx_id, "Dropped ready transaction: {source}");
            return Err(PoolError::Verify {
                id: tx_id.to_string(),
                source,
            });
        }
        if let Err(error) = self.reserve(&tx).await {
            queues.pending.insert(index, entry);
            return Err(error);
        }
        queues.unconfirmed.push(Queued {
            tx,
            received: entry.received,
            ttl: UNCONFIRMED_TIMEOUT,
        });
        drop(queues);
        info!(id = tx_id, "Multisignature transaction is ready");
        self.bus.emit(NodeEvent::TransactionsQueued { count: 1 });
        Ok(true)
    }

    /// Takes every entry whose id is in `ids` out of the pool. The caller
    /// owns the reservations of the returned ready transactions and must
    /// either release them or hand the entries back with [`restore`](Self::restore).
    pub async fn claim(&self, ids: &[String]) -> Claimed {
        let ids: HashSet<&String> = ids.iter().collect();
        let mut queues = self.queues.write().await;
        let (unconfirmed, kept): (Vec<_>, Vec<_>) = queues
            .unconfirmed
            .drain(..)
            .partition(|queued| ids.contains(&queued.tx.id));
        queues.unconfirmed = kept;
        let (pending, kept): (Vec<_>, Vec<_>) = queues
            .pending
            .drain(..)
            .partition(|queued| ids.contains(&queued.tx.id));
        queues.pending = kept;
        if !unconfirmed.is_empty() || !pending.is_empty() {
            trace!(
                unconfirmed = unconfirmed.len(),
                pending = pending.len(),
                "Claimed pool transactions"
            );
        }
        Claimed { unconfirmed, pending }
    }

    /// Puts back entries whose block failed to apply.
    pub async fn restore(&self, claimed: Claimed) {
        if claimed.is_empty() {
            return;
        }
        let mut queues = self.queues.write().await;
        queues.unconfirmed.extend(claimed.unconfirmed);
        queues.pending.extend(claimed.pending);
    }

    /// Drops entries that outlived their queue's timeout and releases the
    /// reservations of dropped ready transactions. Returns how many were dropped.
    pub async fn expire(&self, now: Instant) -> usize {
        let mut queues = self.queues.write().await;
        let (expired, kept): (Vec<_>, Vec<_>) = queues.unconfirmed.drain(..).partition(|queued| queued.expired(now));
        queues.unconfirmed = kept;
        let before = queues.pending.len();
        queues.pending.retain(|queued| !queued.expired(now));
        let mut dropped = before - queues.pending.len();

        for queued in expired {
            if let Err(error) = self.release(&queued.tx).await {
                warn!(id = %queued.tx.id, "Failed to release expired transaction: {error}");
            }
            debug!(id = %queued.tx.id, "Expired transaction");
            dropped += 1;
        }
        if dropped > 0 {
            POOL_TRANSACTION_TOTALS
                .with_label_values(&["expired"])
                .inc_by(dropped as u64);
        }
        dropped
    }

    pub async fn unconfirmed(&self) -> Vec<Transaction> {
        self.queues.read().await.unconfirmed.iter().map(|queued| queued.tx.clone()).collect()
    }

    pub async fn pending(&self) -> Vec<Transaction> {
        self.queues.read().await.pending.iter().map(|queued| queued.tx.clone()).collect()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.queues.read().await.contains(id)
    }

    pub async fn count(&self) -> usize {
        let queues = self.queues.read().await;
        queues.unconfirmed.len() + queues.pending.len()
    }
}
