//! Account ledger: typed reads over storage and conversion of field diffs into
//! atomic update operations.

use crate::{
    crypto::{self, PublicKey},
    serde_utils::hex_array_opt,
    store::{AccountChange, AccountCondition, AccountQuery, DbOp, SortDirection, Storage, StorageError},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum::{EnumString, IntoStaticStr};
use thiserror::Error;
use tracing::*;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AccountError {
    #[error("insane number {value} for {field}")]
    InvalidAmount { field: &'static str, value: String },
    #[error("invalid multisignature member change {0}")]
    InvalidMemberChange(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoStaticStr, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum AccountField {
    Address,
    PublicKey,
    Balance,
    UBalance,
    Virgin,
    Multimin,
    Multilifetime,
    BlockId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub address: String,
    #[serde(default, with = "hex_array_opt", skip_serializing_if = "Option::is_none")]
    pub public_key: Option<PublicKey>,
    pub balance: u64,
    #[serde(rename = "u_balance")]
    pub u_balance: u64,
    /// Cleared by the first outgoing debit and never re-armed.
    pub virgin: bool,
    /// Hex public keys of the multisignature group.
    pub multisignatures: Vec<String>,
    pub multimin: u32,
    pub multilifetime: u32,
    /// Last block that touched this account.
    pub block_id: Option<String>,
}

impl Account {
    pub fn new(address: &str) -> Self {
        Self {
            address: normalize_address(address),
            public_key: None,
            balance: 0,
            u_balance: 0,
            virgin: true,
            multisignatures: Vec::new(),
            multimin: 0,
            multilifetime: 0,
            block_id: None,
        }
    }

    pub fn is_multisignature(&self) -> bool {
        self.multilifetime > 0
    }

    /// Group members as raw keys; malformed entries are skipped.
    pub fn multisignature_keys(&self) -> Vec<PublicKey> {
        self.multisignatures
            .iter()
            .filter_map(|key| hex::decode(key).ok()?.try_into().ok())
            .collect()
    }
}

/// Partial row used by [`AccountLogic::set`]; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountPatch {
    pub public_key: Option<PublicKey>,
    pub balance: Option<u64>,
    pub u_balance: Option<u64>,
    pub virgin: Option<bool>,
    pub multisignatures: Option<Vec<String>>,
    pub multimin: Option<u32>,
    pub multilifetime: Option<u32>,
    pub block_id: Option<String>,
}

impl AccountPatch {
    pub fn apply_to(&self, account: &mut Account) {
        if let Some(key) = self.public_key {
            account.public_key = Some(key);
        }
        if let Some(balance) = self.balance {
            account.balance = balance;
        }
        if let Some(u_balance) = self.u_balance {
            account.u_balance = u_balance;
        }
        if let Some(virgin) = self.virgin {
            account.virgin = virgin;
        }
        if let Some(members) = &self.multisignatures {
            account.multisignatures = members.clone();
        }
        if let Some(multimin) = self.multimin {
            account.multimin = multimin;
        }
        if let Some(multilifetime) = self.multilifetime {
            account.multilifetime = multilifetime;
        }
        if let Some(block_id) = &self.block_id {
            account.block_id = Some(block_id.clone());
        }
    }
}

/// Field diff for [`AccountLogic::merge`]. Balances are additive, the
/// multisignature parameters are additive after flooring their magnitude,
/// `public_key` and `block_id` overwrite, and member entries are `+hex` or `-hex`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountDiff {
    pub public_key: Option<PublicKey>,
    pub balance: Option<i128>,
    pub u_balance: Option<i128>,
    pub multimin: Option<f64>,
    pub multilifetime: Option<f64>,
    pub multisignatures: Option<Vec<String>>,
    pub block_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountSort {
    Field(AccountField, SortDirection),
    Fields(Vec<(AccountField, SortDirection)>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountFilter {
    pub address: Option<String>,
    pub addresses: Option<Vec<String>>,
    pub public_key: Option<PublicKey>,
    pub block_id: Option<String>,
    pub is_multisignature: Option<bool>,
    pub sort: Option<AccountSort>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl AccountFilter {
    pub fn by_address(address: &str) -> Self {
        Self {
            address: Some(address.to_string()),
            ..Default::default()
        }
    }

    fn to_query(&self) -> AccountQuery {
        let mut conditions = Vec::new();
        if let Some(address) = &self.address {
            conditions.push(AccountCondition::Address(normalize_address(address)));
        }
        if let Some(addresses) = &self.addresses {
            conditions.push(AccountCondition::AddressIn(
                addresses.iter().map(|a| normalize_address(a)).collect(),
            ));
        }
        if let Some(key) = self.public_key {
            conditions.push(AccountCondition::PublicKey(key));
        }
        if let Some(id) = &self.block_id {
            conditions.push(AccountCondition::BlockId(id.clone()));
        }
        if let Some(flag) = self.is_multisignature {
            conditions.push(AccountCondition::IsMultisignature(flag));
        }
        let order = match &self.sort {
            None => Vec::new(),
            Some(AccountSort::Field(field, direction)) => vec![(*field, *direction)],
            Some(AccountSort::Fields(fields)) => fields.clone(),
        };
        AccountQuery {
            conditions,
            order,
            limit: self.limit.filter(|limit| *limit > 0),
            offset: self.offset.filter(|offset| *offset > 0),
        }
    }
}

pub fn normalize_address(address: &str) -> String {
    address.to_uppercase()
}

pub struct AccountLogic {
    storage: Arc<dyn Storage>,
    address_suffix: String,
}

impl AccountLogic {
    pub fn new(storage: Arc<dyn Storage>, address_suffix: &str) -> Self {
        Self {
            storage,
            address_suffix: address_suffix.to_string(),
        }
    }

    pub fn generate_address(&self, public_key: &PublicKey) -> String {
        crypto::address_from_public_key(public_key, &self.address_suffix)
    }

    pub async fn get(&self, filter: &AccountFilter) -> Result<Option<Account>, AccountError> {
        let mut filter = filter.clone();
        filter.limit = Some(1);
        Ok(self.get_all(&filter).await?.into_iter().next())
    }

    pub async fn get_all(&self, filter: &AccountFilter) -> Result<Vec<Account>, AccountError> {
        Ok(self.storage.find_accounts(&filter.to_query()).await?)
    }

    pub async fn get_by_address(&self, address: &str) -> Result<Option<Account>, AccountError> {
        self.get(&AccountFilter::by_address(address)).await
    }

    /// Existing account for `public_key`, or a fresh virgin row bound to it.
    pub async fn get_or_create(&self, public_key: &PublicKey) -> Result<Account, AccountError> {
        let address = self.generate_address(public_key);
        match self.get_by_address(&address).await? {
            Some(account) => Ok(account),
            None => {
                let patch = AccountPatch {
                    public_key: Some(*public_key),
                    ..Default::default()
                };
                self.set(&address, &patch).await?;
                let mut account = Account::new(&address);
                account.public_key = Some(*public_key);
                Ok(account)
            }
        }
    }

    pub async fn set(&self, address: &str, patch: &AccountPatch) -> Result<(), AccountError> {
        let address = normalize_address(address);
        self.storage.upsert_account(&address, patch).await?;
        trace!(%address, "Account set");
        Ok(())
    }

    /// Converts `diff` into pending update operations. Nothing is written;
    /// a diff that changes nothing yields no operation.
    pub fn merge(&self, address: &str, diff: &AccountDiff) -> Result<Vec<DbOp>, AccountError> {
        let address = normalize_address(address);
        let mut changes = Vec::new();

        if let Some(key) = diff.public_key {
            changes.push(AccountChange::PublicKey(key));
        }

        for (field, value) in [
            (AccountField::Balance, diff.balance),
            (AccountField::UBalance, diff.u_balance),
        ] {
            let Some(value) = value else { continue };
            if value == 0 {
                continue;
            }
            let magnitude = u64::try_from(value.unsigned_abs()).map_err(|_| AccountError::InvalidAmount {
                field: field.into(),
                value: value.to_string(),
            })?;
            if value > 0 {
                changes.push(AccountChange::Add(field, magnitude));
            } else {
                changes.push(AccountChange::Sub(field, magnitude));
                if field == AccountField::UBalance {
                    changes.push(AccountChange::Virgin(false));
                }
            }
        }

        for (field, value) in [
            (AccountField::Multimin, diff.multimin),
            (AccountField::Multilifetime, diff.multilifetime),
        ] {
            let Some(value) = value else { continue };
            let insane = || AccountError::InvalidAmount {
                field: field.into(),
                value: value.to_string(),
            };
            if !value.is_finite() {
                return Err(insane());
            }
            let magnitude = value.abs().floor();
            if magnitude == 0.0 {
                continue;
            }
            if magnitude > f64::from(u32::MAX) {
                return Err(insane());
            }
            let magnitude = magnitude as u64;
            if value > 0.0 {
                changes.push(AccountChange::Add(field, magnitude));
            } else {
                changes.push(AccountChange::Sub(field, magnitude));
            }
        }

        for entry in diff.multisignatures.iter().flatten() {
            if let Some(key) = entry.strip_prefix('+') {
                changes.push(AccountChange::AddMember(key.to_string()));
            } else if let Some(key) = entry.strip_prefix('-') {
                changes.push(AccountChange::RemoveMember(key.to_string()));
            } else {
                return Err(AccountError::InvalidMemberChange(entry.clone()));
            }
        }

        if let Some(block_id) = &diff.block_id {
            changes.push(AccountChange::BlockId(block_id.clone()));
        }

        if changes.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![DbOp::UpdateAccount { address, changes }])
    }

    /// Deletes by address, case-insensitively. Returns the number of rows removed.
    pub async fn remove(&self, address: &str) -> Result<usize, AccountError> {
        let address = normalize_address(address);
        let removed = self.storage.remove_account(&address).await?;
        debug!(%address, removed, "Account removed");
        Ok(removed)
    }

    pub async fn recreate_tables(&self) -> Result<(), AccountError> {
        self.storage.clear_accounts().await?;
        info!("Recreated account tables");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn logic() -> (Arc<MemoryStore>, AccountLogic) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), AccountLogic::new(store, crypto::ADDRESS_SUFFIX))
    }

    fn changes(ops: &[DbOp]) -> Vec<String> {
        match ops {
            [DbOp::UpdateAccount { changes, .. }] => changes.iter().map(|c| c.to_string()).collect(),
            _ => panic!("expected a single update, got {ops:?}"),
        }
    }

    #[test]
    fn merge_renders_additive_changes() {
        let (_, accounts) = logic();
        let diff = AccountDiff {
            balance: Some(100),
            u_balance: Some(-100),
            ..Default::default()
        };
        let ops = accounts.merge("1r", &diff).unwrap();
        assert!(matches!(&ops[0], DbOp::UpdateAccount { address, .. } if address == "1R"));
        assert_eq!(changes(&ops), vec!["balance + 100", "u_balance - 100", "virgin = 0"]);
    }

    #[test]
    fn merge_floors_numbers_and_rejects_insane_ones() {
        let (_, accounts) = logic();
        let ops = accounts
            .merge(
                "1R",
                &AccountDiff {
                    multimin: Some(2.7),
                    multilifetime: Some(-1.5),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(changes(&ops), vec!["multimin + 2", "multilifetime - 1"]);

        for value in [f64::NAN, f64::INFINITY] {
            let diff = AccountDiff {
                multimin: Some(value),
                ..Default::default()
            };
            assert!(matches!(
                accounts.merge("1R", &diff),
                Err(AccountError::InvalidAmount { field: "multimin", .. })
            ));
        }
    }

    #[test]
    fn merge_of_zero_is_a_no_op() {
        let (_, accounts) = logic();
        let diff = AccountDiff {
            balance: Some(0),
            multimin: Some(0.4),
            ..Default::default()
        };
        assert!(accounts.merge("1R", &diff).unwrap().is_empty());
    }

    #[test]
    fn merge_membership_changes() {
        let (_, accounts) = logic();
        let diff = AccountDiff {
            multisignatures: Some(vec!["+aa".into(), "-bb".into()]),
            ..Default::default()
        };
        assert_eq!(
            changes(&accounts.merge("1R", &diff).unwrap()),
            vec!["multisignatures += 'aa'", "multisignatures -= 'bb'"]
        );
        let bad = AccountDiff {
            multisignatures: Some(vec!["aa".into()]),
            ..Default::default()
        };
        assert!(matches!(
            accounts.merge("1R", &bad),
            Err(AccountError::InvalidMemberChange(_))
        ));
    }

    #[tokio::test]
    async fn merge_ops_commit_and_clear_virgin_once() {
        let (store, accounts) = logic();
        accounts
            .set(
                "1R",
                &AccountPatch {
                    balance: Some(50),
                    u_balance: Some(50),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let debit = AccountDiff {
            balance: Some(-20),
            u_balance: Some(-20),
            ..Default::default()
        };
        store.commit(accounts.merge("1R", &debit).unwrap()).await.unwrap();
        let credit = AccountDiff {
            balance: Some(20),
            u_balance: Some(20),
            ..Default::default()
        };
        store.commit(accounts.merge("1R", &credit).unwrap()).await.unwrap();

        let account = accounts.get_by_address("1R").await.unwrap().unwrap();
        assert_eq!(account.balance, 50);
        assert!(!account.virgin);
    }

    #[tokio::test]
    async fn get_all_filters_sorts_and_pages() {
        let (_, accounts) = logic();
        for (address, balance) in [("1R", 30), ("2R", 10), ("3R", 20)] {
            accounts
                .set(
                    address,
                    &AccountPatch {
                        balance: Some(balance),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }

        let sorted = accounts
            .get_all(&AccountFilter {
                sort: Some(AccountSort::Field(AccountField::Balance, SortDirection::Desc)),
                ..Default::default()
            })
            .await
            .unwrap();
        let balances: Vec<u64> = sorted.iter().map(|a| a.balance).collect();
        assert_eq!(balances, vec![30, 20, 10]);

        let page = accounts
            .get_all(&AccountFilter {
                addresses: Some(vec!["1r".into(), "3R".into()]),
                sort: Some(AccountSort::Field(AccountField::Balance, SortDirection::Asc)),
                limit: Some(1),
                offset: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].address, "1R");

        let unlimited = accounts
            .get_all(&AccountFilter {
                limit: Some(0),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(unlimited.len(), 3);
    }

    #[tokio::test]
    async fn set_overwrites_only_listed_fields_and_remove_ignores_case() {
        let (_, accounts) = logic();
        accounts
            .set(
                "7r",
                &AccountPatch {
                    balance: Some(5),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        accounts
            .set(
                "7R",
                &AccountPatch {
                    multimin: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let account = accounts.get_by_address("7R").await.unwrap().unwrap();
        assert_eq!((account.balance, account.multimin), (5, 2));
        assert!(account.virgin);

        assert_eq!(accounts.remove("7r").await.unwrap(), 1);
        assert_eq!(accounts.remove("7R").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn get_or_create_binds_public_key() {
        let (_, accounts) = logic();
        let keypair = crypto::Keypair::from_passphrase("alice");
        let account = accounts.get_or_create(&keypair.public_key()).await.unwrap();
        assert_eq!(account.public_key, Some(keypair.public_key()));
        let again = accounts
            .get(&AccountFilter {
                public_key: Some(keypair.public_key()),
                ..Default::default()
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.address, account.address);
    }
}
