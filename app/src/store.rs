use crate::{
    account::{Account, AccountField, AccountPatch},
    block::{Block, BlockHeader},
    crypto::PublicKey,
    transaction::Transaction,
};
use async_trait::async_trait;
use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
    fmt,
};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::*;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("account {address} not found")]
    AccountNotFound { address: String },
    #[error("{field} of account {address} would become negative")]
    NegativeBalance { address: String, field: &'static str },
    #[error("{field} of account {address} overflowed")]
    Overflow { address: String, field: &'static str },
    #[error("cannot apply `{change}` to account {address}")]
    InvalidChange { address: String, change: String },
    #[error("block {0} already exists")]
    DuplicateBlock(String),
    #[error("block {0} not found")]
    BlockNotFound(String),
    #[error("transaction {0} already exists")]
    DuplicateTransaction(String),
}

/// A single field change inside an account update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountChange {
    PublicKey(PublicKey),
    BlockId(String),
    Virgin(bool),
    Add(AccountField, u64),
    Sub(AccountField, u64),
    AddMember(String),
    RemoveMember(String),
}

impl fmt::Display for AccountChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountChange::PublicKey(key) => write!(f, "public_key = '{}'", hex::encode(key)),
            AccountChange::BlockId(id) => write!(f, "block_id = '{id}'"),
            AccountChange::Virgin(virgin) => write!(f, "virgin = {}", u8::from(*virgin)),
            AccountChange::Add(field, n) => write!(f, "{} + {n}", <&str>::from(field)),
            AccountChange::Sub(field, n) => write!(f, "{} - {n}", <&str>::from(field)),
            AccountChange::AddMember(key) => write!(f, "multisignatures += '{key}'"),
            AccountChange::RemoveMember(key) => write!(f, "multisignatures -= '{key}'"),
        }
    }
}

/// Pending storage operation. Nothing touches storage until a batch of these
/// is handed to [`Storage::commit`].
#[derive(Debug, Clone, PartialEq)]
pub enum DbOp {
    CreateBlock(BlockHeader),
    CreateTransaction {
        block_id: String,
        transaction: Transaction,
    },
    DeleteBlock {
        id: String,
    },
    /// Inserts the account unless a row with the same address exists.
    EnsureAccount(Account),
    UpdateAccount {
        address: String,
        changes: Vec<AccountChange>,
    },
    RemoveAccount {
        address: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountCondition {
    Address(String),
    AddressIn(Vec<String>),
    PublicKey(PublicKey),
    BlockId(String),
    IsMultisignature(bool),
}

impl AccountCondition {
    fn matches(&self, account: &Account) -> bool {
        match self {
            AccountCondition::Address(address) => &account.address == address,
            AccountCondition::AddressIn(addresses) => addresses.contains(&account.address),
            AccountCondition::PublicKey(key) => account.public_key.as_ref() == Some(key),
            AccountCondition::BlockId(id) => account.block_id.as_ref() == Some(id),
            AccountCondition::IsMultisignature(flag) => account.is_multisignature() == *flag,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountQuery {
    pub conditions: Vec<AccountCondition>,
    pub order: Vec<(AccountField, SortDirection)>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn find_accounts(&self, query: &AccountQuery) -> Result<Vec<Account>, StorageError>;
    /// Creates the row if missing, otherwise overwrites only the fields present in `patch`.
    async fn upsert_account(&self, address: &str, patch: &AccountPatch) -> Result<(), StorageError>;
    async fn remove_account(&self, address: &str) -> Result<usize, StorageError>;
    async fn clear_accounts(&self) -> Result<(), StorageError>;
    async fn count_accounts_for_block(&self, block_id: &str) -> Result<usize, StorageError>;
    /// Accounts whose `block_id` names a block that is not stored.
    async fn orphaned_accounts(&self) -> Result<Vec<Account>, StorageError>;

    async fn count_blocks(&self) -> Result<u64, StorageError>;
    async fn block_by_id(&self, id: &str) -> Result<Option<Block>, StorageError>;
    async fn block_by_height(&self, height: u64) -> Result<Option<Block>, StorageError>;
    async fn last_block(&self) -> Result<Option<Block>, StorageError>;
    /// Blocks with `from_height <= height < from_height + limit`, ascending.
    async fn blocks_in_range(&self, from_height: u64, limit: u64) -> Result<Vec<Block>, StorageError>;
    async fn delete_blocks_after(&self, height: u64) -> Result<usize, StorageError>;
    /// Whether a stored block already carries transaction `id`.
    async fn transaction_exists(&self, id: &str) -> Result<bool, StorageError>;

    /// Applies every op or none of them.
    async fn commit(&self, ops: Vec<DbOp>) -> Result<(), StorageError>;
}

#[derive(Debug, Default)]
struct Tables {
    accounts: BTreeMap<String, Account>,
    blocks: BTreeMap<u64, BlockHeader>,
    heights: HashMap<String, u64>,
    transactions: HashMap<String, Vec<Transaction>>,
    /// Transaction id to the id of the block carrying it.
    confirmed: HashMap<String, String>,
}

impl Tables {
    fn assemble(&self, header: &BlockHeader) -> Block {
        Block {
            header: header.clone(),
            transactions: self.transactions.get(&header.id).cloned().unwrap_or_default(),
        }
    }

    fn remove_block(&mut self, id: &str) -> bool {
        match self.heights.remove(id) {
            Some(height) => {
                self.blocks.remove(&height);
                for tx in self.transactions.remove(id).unwrap_or_default() {
                    self.confirmed.remove(&tx.id);
                }
                true
            }
            None => false,
        }
    }
}

/// Staged writes of one commit, layered over the committed tables.
#[derive(Default)]
struct Batch {
    accounts: HashMap<String, Option<Account>>,
    deleted_blocks: Vec<String>,
    blocks: Vec<BlockHeader>,
    transactions: Vec<(String, Transaction)>,
}

impl Batch {
    fn account(&self, tables: &Tables, address: &str) -> Option<Account> {
        match self.accounts.get(address) {
            Some(staged) => staged.clone(),
            None => tables.accounts.get(address).cloned(),
        }
    }

    fn stage(&mut self, tables: &Tables, op: DbOp) -> Result<(), StorageError> {
        match op {
            DbOp::CreateBlock(header) => {
                let exists = (tables.heights.contains_key(&header.id)
                    && !self.deleted_blocks.contains(&header.id))
                    || self.blocks.iter().any(|b| b.id == header.id);
                if exists {
                    return Err(StorageError::DuplicateBlock(header.id));
                }
                self.blocks.push(header);
            }
            DbOp::CreateTransaction { block_id, transaction } => {
                let committed = tables
                    .confirmed
                    .get(&transaction.id)
                    .map_or(false, |owner| !self.deleted_blocks.contains(owner));
                let duplicate = committed || self.transactions.iter().any(|(_, tx)| tx.id == transaction.id);
                if duplicate {
                    return Err(StorageError::DuplicateTransaction(transaction.id));
                }
                self.transactions.push((block_id, transaction));
            }
            DbOp::DeleteBlock { id } => {
                if !tables.heights.contains_key(&id) {
                    return Err(StorageError::BlockNotFound(id));
                }
                self.deleted_blocks.push(id);
            }
            DbOp::EnsureAccount(account) => {
                if self.account(tables, &account.address).is_none() {
                    self.accounts.insert(account.address.clone(), Some(account));
                }
            }
            DbOp::UpdateAccount { address, changes } => {
                let mut account = self
                    .account(tables, &address)
                    .ok_or_else(|| StorageError::AccountNotFound {
                        address: address.clone(),
                    })?;
                for change in &changes {
                    apply_change(&mut account, change)?;
                }
                self.accounts.insert(address, Some(account));
            }
            DbOp::RemoveAccount { address } => {
                self.accounts.insert(address, None);
            }
        }
        Ok(())
    }

    fn write(self, tables: &mut Tables) {
        for id in &self.deleted_blocks {
            tables.remove_block(id);
        }
        for header in self.blocks {
            tables.heights.insert(header.id.clone(), header.height);
            tables.transactions.entry(header.id.clone()).or_default();
            tables.blocks.insert(header.height, header);
        }
        for (block_id, transaction) in self.transactions {
            tables.confirmed.insert(transaction.id.clone(), block_id.clone());
            tables.transactions.entry(block_id).or_default().push(transaction);
        }
        for (address, account) in self.accounts {
            match account {
                Some(account) => {
                    tables.accounts.insert(address, account);
                }
                None => {
                    tables.accounts.remove(&address);
                }
            }
        }
    }
}

/// Applies one change to an in-memory row, with the same checks a commit performs.
pub fn apply_change(account: &mut Account, change: &AccountChange) -> Result<(), StorageError> {
    let address = account.address.clone();
    let invalid = || StorageError::InvalidChange {
        address: address.clone(),
        change: change.to_string(),
    };
    match change {
        AccountChange::PublicKey(key) => account.public_key = Some(*key),
        AccountChange::BlockId(id) => account.block_id = Some(id.clone()),
        AccountChange::Virgin(virgin) => account.virgin = *virgin,
        AccountChange::AddMember(key) => {
            if !account.multisignatures.contains(key) {
                account.multisignatures.push(key.clone());
            }
        }
        AccountChange::RemoveMember(key) => account.multisignatures.retain(|k| k != key),
        AccountChange::Add(field, n) | AccountChange::Sub(field, n) => {
            let name: &'static str = field.into();
            let current = match field {
                AccountField::Balance => account.balance,
                AccountField::UBalance => account.u_balance,
                AccountField::Multimin => u64::from(account.multimin),
                AccountField::Multilifetime => u64::from(account.multilifetime),
                _ => return Err(invalid()),
            };
            let next = if matches!(change, AccountChange::Add(..)) {
                current.checked_add(*n).ok_or_else(|| StorageError::Overflow {
                    address: address.clone(),
                    field: name,
                })?
            } else {
                current.checked_sub(*n).ok_or_else(|| StorageError::NegativeBalance {
                    address: address.clone(),
                    field: name,
                })?
            };
            let narrow = |value: u64| {
                u32::try_from(value).map_err(|_| StorageError::Overflow {
                    address: address.clone(),
                    field: name,
                })
            };
            match field {
                AccountField::Balance => account.balance = next,
                AccountField::UBalance => account.u_balance = next,
                AccountField::Multimin => account.multimin = narrow(next)?,
                AccountField::Multilifetime => account.multilifetime = narrow(next)?,
                _ => return Err(invalid()),
            }
        }
    }
    Ok(())
}

fn compare(a: &Account, b: &Account, field: AccountField) -> Ordering {
    match field {
        AccountField::Address => a.address.cmp(&b.address),
        AccountField::PublicKey => a.public_key.cmp(&b.public_key),
        AccountField::Balance => a.balance.cmp(&b.balance),
        AccountField::UBalance => a.u_balance.cmp(&b.u_balance),
        AccountField::Virgin => a.virgin.cmp(&b.virgin),
        AccountField::Multimin => a.multimin.cmp(&b.multimin),
        AccountField::Multilifetime => a.multilifetime.cmp(&b.multilifetime),
        AccountField::BlockId => a.block_id.cmp(&b.block_id),
    }
}

/// In-memory [`Storage`] backend.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn find_accounts(&self, query: &AccountQuery) -> Result<Vec<Account>, StorageError> {
        let tables = self.tables.read().await;
        let mut accounts: Vec<Account> = tables
            .accounts
            .values()
            .filter(|account| query.conditions.iter().all(|c| c.matches(account)))
            .cloned()
            .collect();
        if !query.order.is_empty() {
            accounts.sort_by(|a, b| {
                query
                    .order
                    .iter()
                    .map(|(field, direction)| match direction {
                        SortDirection::Asc => compare(a, b, *field),
                        SortDirection::Desc => compare(b, a, *field),
                    })
                    .find(|ordering| ordering.is_ne())
                    .unwrap_or(Ordering::Equal)
            });
        }
        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(accounts.into_iter().skip(offset).take(limit).collect())
    }

    async fn upsert_account(&self, address: &str, patch: &AccountPatch) -> Result<(), StorageError> {
        let mut tables = self.tables.write().await;
        let account = tables
            .accounts
            .entry(address.to_string())
            .or_insert_with(|| Account::new(address));
        patch.apply_to(account);
        Ok(())
    }

    async fn remove_account(&self, address: &str) -> Result<usize, StorageError> {
        let mut tables = self.tables.write().await;
        Ok(usize::from(tables.accounts.remove(address).is_some()))
    }

    async fn clear_accounts(&self) -> Result<(), StorageError> {
        self.tables.write().await.accounts.clear();
        Ok(())
    }

    async fn count_accounts_for_block(&self, block_id: &str) -> Result<usize, StorageError> {
        let tables = self.tables.read().await;
        Ok(tables
            .accounts
            .values()
            .filter(|account| account.block_id.as_deref() == Some(block_id))
            .count())
    }

    async fn orphaned_accounts(&self) -> Result<Vec<Account>, StorageError> {
        let tables = self.tables.read().await;
        Ok(tables
            .accounts
            .values()
            .filter(|account| {
                account
                    .block_id
                    .as_ref()
                    .map_or(false, |id| !tables.heights.contains_key(id))
            })
            .cloned()
            .collect())
    }

    async fn count_blocks(&self) -> Result<u64, StorageError> {
        Ok(self.tables.read().await.blocks.len() as u64)
    }

    async fn block_by_id(&self, id: &str) -> Result<Option<Block>, StorageError> {
        let tables = self.tables.read().await;
        Ok(tables
            .heights
            .get(id)
            .and_then(|height| tables.blocks.get(height))
            .map(|header| tables.assemble(header)))
    }

    async fn block_by_height(&self, height: u64) -> Result<Option<Block>, StorageError> {
        let tables = self.tables.read().await;
        Ok(tables.blocks.get(&height).map(|header| tables.assemble(header)))
    }

    async fn last_block(&self) -> Result<Option<Block>, StorageError> {
        let tables = self.tables.read().await;
        Ok(tables
            .blocks
            .values()
            .next_back()
            .map(|header| tables.assemble(header)))
    }

    async fn blocks_in_range(&self, from_height: u64, limit: u64) -> Result<Vec<Block>, StorageError> {
        let tables = self.tables.read().await;
        let to_height = from_height.saturating_add(limit);
        Ok(tables
            .blocks
            .range(from_height..to_height)
            .map(|(_, header)| tables.assemble(header))
            .collect())
    }

    async fn delete_blocks_after(&self, height: u64) -> Result<usize, StorageError> {
        let mut tables = self.tables.write().await;
        let doomed: Vec<String> = tables
            .blocks
            .range(height.saturating_add(1)..)
            .map(|(_, header)| header.id.clone())
            .collect();
        for id in &doomed {
            tables.remove_block(id);
        }
        debug!(height, deleted = doomed.len(), "Deleted blocks");
        Ok(doomed.len())
    }

    async fn transaction_exists(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.tables.read().await.confirmed.contains_key(id))
    }

    async fn commit(&self, ops: Vec<DbOp>) -> Result<(), StorageError> {
        let mut tables = self.tables.write().await;
        let mut batch = Batch::default();
        let count = ops.len();
        for op in ops {
            batch.stage(&tables, op)?;
        }
        batch.write(&mut tables);
        trace!(ops = count, "Committed batch");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(address: &str, changes: Vec<AccountChange>) -> DbOp {
        DbOp::UpdateAccount {
            address: address.to_string(),
            changes,
        }
    }

    #[test]
    fn changes_render_as_field_expressions() {
        assert_eq!(AccountChange::Add(AccountField::Balance, 5).to_string(), "balance + 5");
        assert_eq!(AccountChange::Sub(AccountField::UBalance, 3).to_string(), "u_balance - 3");
        assert_eq!(AccountChange::Virgin(false).to_string(), "virgin = 0");
    }

    #[tokio::test]
    async fn commit_is_all_or_nothing() {
        let store = MemoryStore::new();
        store
            .commit(vec![
                DbOp::EnsureAccount(Account::new("1R")),
                update("1R", vec![AccountChange::Add(AccountField::Balance, 10)]),
            ])
            .await
            .unwrap();

        let result = store
            .commit(vec![
                update("1R", vec![AccountChange::Add(AccountField::Balance, 5)]),
                update("1R", vec![AccountChange::Sub(AccountField::Balance, 100)]),
            ])
            .await;
        assert_eq!(
            result,
            Err(StorageError::NegativeBalance {
                address: "1R".into(),
                field: "balance"
            })
        );

        let accounts = store.find_accounts(&AccountQuery::default()).await.unwrap();
        assert_eq!(accounts[0].balance, 10);
    }

    #[tokio::test]
    async fn concurrent_updates_compose() {
        let store = std::sync::Arc::new(MemoryStore::new());
        store
            .commit(vec![
                DbOp::EnsureAccount(Account::new("1R")),
                update("1R", vec![AccountChange::Add(AccountField::Balance, 10)]),
            ])
            .await
            .unwrap();

        let a = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .commit(vec![update("1R", vec![AccountChange::Add(AccountField::Balance, 5)])])
                    .await
            })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .commit(vec![update("1R", vec![AccountChange::Sub(AccountField::Balance, 3)])])
                    .await
            })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let accounts = store.find_accounts(&AccountQuery::default()).await.unwrap();
        assert_eq!(accounts[0].balance, 12);
    }

    #[tokio::test]
    async fn confirmed_transaction_ids_are_unique() {
        let store = MemoryStore::new();
        let tx = crate::testing::send(&crate::testing::faucet(), "1R", 1, 0);
        let save = |block_id: &str| DbOp::CreateTransaction {
            block_id: block_id.to_string(),
            transaction: tx.clone(),
        };
        assert!(!store.transaction_exists(&tx.id).await.unwrap());
        store.commit(vec![save("7")]).await.unwrap();
        assert!(store.transaction_exists(&tx.id).await.unwrap());

        let result = store.commit(vec![save("8")]).await;
        assert_eq!(result, Err(StorageError::DuplicateTransaction(tx.id.clone())));
        assert_eq!(
            store.commit(vec![save("8"), save("9")]).await,
            Err(StorageError::DuplicateTransaction(tx.id.clone()))
        );
    }

    #[tokio::test]
    async fn update_of_missing_account_fails() {
        let store = MemoryStore::new();
        let result = store
            .commit(vec![update("9R", vec![AccountChange::Virgin(false)])])
            .await;
        assert!(matches!(result, Err(StorageError::AccountNotFound { .. })));
    }
}
