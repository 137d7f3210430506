//! Ordered readiness checks deciding whether a transaction has gathered the
//! signatures it needs. Each check sees the verdict so far; the chain keeps
//! `ready && check`, so a `false` can never be turned back into `true`.

use crate::{
    account::Account,
    crypto::{self, PublicKey},
    transaction::{self, Transaction, TransactionType},
};
use std::{collections::HashSet, sync::Arc};
use tracing::*;

pub type ReadinessCheck = Arc<dyn Fn(&Transaction, &Account, bool) -> bool + Send + Sync>;

#[derive(Clone, Default)]
pub struct ReadinessChain {
    checks: Vec<(&'static str, ReadinessCheck)>,
}

impl ReadinessChain {
    pub fn register<F>(&mut self, name: &'static str, check: F)
    where
        F: Fn(&Transaction, &Account, bool) -> bool + Send + Sync + 'static,
    {
        self.checks.push((name, Arc::new(check)));
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    pub fn evaluate(&self, tx: &Transaction, sender: &Account, initial: bool) -> bool {
        self.checks.iter().fold(initial, |ready, (name, check)| {
            let verdict = check(tx, sender, ready);
            if ready && !verdict {
                trace!(tx = %tx.id, check = name, "Transaction not ready");
            }
            ready && verdict
        })
    }
}

fn distinct_signers(tx: &Transaction, members: &[PublicKey]) -> usize {
    let Ok(digest) = transaction::hash(tx, false) else {
        return 0;
    };
    let mut signed = HashSet::new();
    for signature in &tx.signatures {
        let signer = members
            .iter()
            .find(|key| !signed.contains(*key) && crypto::verify(&digest, signature, key));
        if let Some(key) = signer {
            signed.insert(*key);
        }
    }
    signed.len()
}

/// Transactions from an existing group, or sent on its behalf by a requester,
/// need `multimin` distinct member signatures.
pub fn multisignature_ready(tx: &Transaction, sender: &Account, _ready: bool) -> bool {
    if !sender.is_multisignature() && tx.requester_public_key.is_none() {
        return true;
    }
    distinct_signers(tx, &sender.multisignature_keys()) >= sender.multimin as usize
}

/// A registration needs a signature from every prospective member.
pub fn registration_ready(tx: &Transaction, sender: &Account, _ready: bool) -> bool {
    if tx.kind != TransactionType::Multisignature || sender.is_multisignature() {
        return true;
    }
    let Some(asset) = tx.multisignature() else {
        return false;
    };
    let members: Option<Vec<PublicKey>> = asset.keysgroup.iter().map(|entry| entry.public_key()).collect();
    match members {
        Some(members) => !members.is_empty() && distinct_signers(tx, &members) == members.len(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{crypto::Keypair, testing};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn group(owner: &Keypair, members: &[&Keypair], min: u32) -> Account {
        let mut account = Account::new(&crypto::address_from_public_key(
            &owner.public_key(),
            crypto::ADDRESS_SUFFIX,
        ));
        account.multisignatures = members.iter().map(|k| hex::encode(k.public_key())).collect();
        account.multimin = min;
        account.multilifetime = 24;
        account
    }

    #[test]
    fn false_is_never_upgraded() {
        let owner = Keypair::from_passphrase("owner");
        let tx = testing::send(&owner, "1R", 1, 0);
        let sender = Account::new("1R");
        let mut chain = ReadinessChain::default();
        chain.register("always", |_, _, _| true);
        chain.register("upgrade", |_, _, _| true);
        assert!(!chain.evaluate(&tx, &sender, false));
        assert!(chain.evaluate(&tx, &sender, true));
    }

    #[test]
    fn checks_run_in_registration_order_and_see_prior_verdict() {
        let owner = Keypair::from_passphrase("owner");
        let tx = testing::send(&owner, "1R", 1, 0);
        let sender = Account::new("1R");
        let calls = Arc::new(AtomicUsize::new(0));
        let mut chain = ReadinessChain::default();
        chain.register("deny", |_, _, _| false);
        let seen = calls.clone();
        chain.register("observer", move |_, _, ready| {
            assert!(!ready);
            seen.fetch_add(1, Ordering::SeqCst);
            true
        });
        assert!(!chain.evaluate(&tx, &sender, true));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn repeated_signatures_from_one_member_count_once() {
        let owner = Keypair::from_passphrase("owner");
        let first = Keypair::from_passphrase("first");
        let second = Keypair::from_passphrase("second");
        let sender = group(&owner, &[&first, &second], 2);
        let mut tx = testing::send(&owner, "1R", 1, 0);
        let signature = transaction::sign(&tx, &first).unwrap();
        tx.signatures = vec![signature, signature];
        assert!(!multisignature_ready(&tx, &sender, true));
        tx.signatures = vec![signature, transaction::sign(&tx, &second).unwrap()];
        assert!(multisignature_ready(&tx, &sender, true));
    }

    #[test]
    fn plain_accounts_are_always_ready() {
        let owner = Keypair::from_passphrase("owner");
        let tx = testing::send(&owner, "1R", 1, 0);
        assert!(multisignature_ready(&tx, &Account::new("1R"), true));
        assert!(registration_ready(&tx, &Account::new("1R"), true));
    }
}
