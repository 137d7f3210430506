//! Transactions: canonical bytes, signing, verification against the sender's
//! account and the ledger effects of applying or undoing them.

use crate::{
    account::{normalize_address, Account, AccountDiff},
    crypto::{self, Hash, Keypair, PublicKey, Signature},
    readiness::{self, ReadinessChain},
    schema::{self, Validator},
    serde_utils::{amount, hex_array, hex_array_opt, hex_array_vec},
    spec::ChainSpec,
    store::DbOp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashSet, sync::Arc};
use thiserror::Error;
use tracing::*;

pub const KEYSGROUP_MAX: usize = 15;
pub const MULTISIG_LIFETIME_MAX: u8 = 72;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Failed to validate transaction schema: {0}")]
    Schema(String),
    #[error("Invalid transaction body: {0}")]
    Malformed(String),
    #[error("Unknown transaction type {0}")]
    UnknownType(u8),
    #[error("Invalid recipient {0}")]
    InvalidRecipient(String),
    #[error("Transaction is not signed")]
    Unsigned,
    #[error("Transaction amounts overflow")]
    Overflow,
    #[error("Invalid transaction id: expected {computed}, found {claimed}")]
    IdMismatch { claimed: String, computed: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("Encountered duplicate signature in transaction")]
    DuplicateSignature,
    #[error("Invalid sender address")]
    SenderMismatch,
    #[error("Invalid sender public key")]
    PublicKeyMismatch,
    #[error("Invalid transaction fee: expected {expected}, found {actual}")]
    InvalidFee { expected: u64, actual: u64 },
    #[error("Invalid recipient")]
    MissingRecipient,
    #[error("Account or requester account is not multisignature")]
    NotMultisignature,
    #[error("Account does not belong to multisignature group")]
    RequesterNotMember,
    #[error("Requester multisignature policy differs from the sender's")]
    DivergentRequesterPolicy,
    #[error("Failed to verify signature")]
    InvalidSignature,
    #[error("Failed to verify multisignature")]
    InvalidMultisigSignature,
    #[error("Invalid member in keysgroup")]
    InvalidKeysgroupMember,
    #[error("Invalid multisignature: {0}")]
    InvalidMultisigAsset(String),
    #[error("Account already has multisignatures enabled")]
    AlreadyMultisignature,
    #[error("Account does not have enough currency: {address} balance {balance}, needs {required}")]
    InsufficientBalance {
        address: String,
        balance: u64,
        required: u64,
    },
    #[error("MultiSig Transaction is not ready")]
    MultisigNotReady,
    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(try_from = "u8", into = "u8")]
pub enum TransactionType {
    Send,
    Multisignature,
}

impl From<TransactionType> for u8 {
    fn from(kind: TransactionType) -> u8 {
        match kind {
            TransactionType::Send => 0,
            TransactionType::Multisignature => 4,
        }
    }
}

impl TryFrom<u8> for TransactionType {
    type Error = TransactionError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TransactionType::Send),
            4 => Ok(TransactionType::Multisignature),
            other => Err(TransactionError::UnknownType(other)),
        }
    }
}

/// One entry of a registration keysgroup. Well-formed entries are `+` followed
/// by a hex public key; anything else is kept so verification can reject it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeysgroupEntry {
    Key(String),
    Other(Value),
}

impl KeysgroupEntry {
    fn as_text(&self) -> String {
        match self {
            KeysgroupEntry::Key(key) => key.clone(),
            KeysgroupEntry::Other(value) => value.to_string(),
        }
    }

    /// Member key when the entry has the `+<hex key>` form.
    pub fn public_key(&self) -> Option<PublicKey> {
        match self {
            KeysgroupEntry::Key(key) => hex::decode(key.strip_prefix('+')?).ok()?.try_into().ok(),
            KeysgroupEntry::Other(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultisignatureAsset {
    pub min: u8,
    pub lifetime: u8,
    pub keysgroup: Vec<KeysgroupEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionAsset {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multisignature: Option<MultisignatureAsset>,
}

impl TransactionAsset {
    pub fn is_empty(&self) -> bool {
        self.multisignature.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub timestamp: u32,
    #[serde(with = "hex_array")]
    pub sender_public_key: PublicKey,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    #[serde(default, with = "hex_array_opt", skip_serializing_if = "Option::is_none")]
    pub requester_public_key: Option<PublicKey>,
    #[serde(with = "amount")]
    pub amount: u64,
    #[serde(with = "amount")]
    pub fee: u64,
    #[serde(default, with = "hex_array_opt", skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
    #[serde(default, with = "hex_array_vec", skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<Signature>,
    #[serde(default, skip_serializing_if = "TransactionAsset::is_empty")]
    pub asset: TransactionAsset,
}

impl Transaction {
    /// Unsigned transfer; call [`seal`] to sign it and assign its id.
    pub fn send(sender: &PublicKey, recipient: &str, amount: u64, fee: u64, timestamp: u32) -> Self {
        Self {
            id: String::new(),
            kind: TransactionType::Send,
            timestamp,
            sender_public_key: *sender,
            sender_id: String::new(),
            recipient_id: Some(normalize_address(recipient)),
            requester_public_key: None,
            amount,
            fee,
            signature: None,
            signatures: Vec::new(),
            asset: TransactionAsset::default(),
        }
    }

    /// Unsigned multisignature registration for `members`.
    pub fn register_multisignature(
        sender: &PublicKey,
        members: &[PublicKey],
        min: u8,
        lifetime: u8,
        fee: u64,
        timestamp: u32,
    ) -> Self {
        let keysgroup = members
            .iter()
            .map(|key| KeysgroupEntry::Key(format!("+{}", hex::encode(key))))
            .collect();
        Self {
            id: String::new(),
            kind: TransactionType::Multisignature,
            timestamp,
            sender_public_key: *sender,
            sender_id: String::new(),
            recipient_id: None,
            requester_public_key: None,
            amount: 0,
            fee,
            signature: None,
            signatures: Vec::new(),
            asset: TransactionAsset {
                multisignature: Some(MultisignatureAsset {
                    min,
                    lifetime,
                    keysgroup,
                }),
            },
        }
    }

    pub fn multisignature(&self) -> Option<&MultisignatureAsset> {
        self.asset.multisignature.as_ref()
    }
}

/// Canonical byte layout. Member signatures are never part of it.
pub fn bytes(tx: &Transaction, include_signature: bool) -> Result<Vec<u8>, TransactionError> {
    let mut out = Vec::with_capacity(125);
    out.push(u8::from(tx.kind));
    out.extend_from_slice(&tx.timestamp.to_le_bytes());
    out.extend_from_slice(&tx.sender_public_key);
    if let Some(requester) = &tx.requester_public_key {
        out.extend_from_slice(requester);
    }
    match &tx.recipient_id {
        Some(recipient) => {
            let number = crypto::address_to_u64(recipient)
                .ok_or_else(|| TransactionError::InvalidRecipient(recipient.clone()))?;
            out.extend_from_slice(&number.to_be_bytes());
        }
        None => out.extend_from_slice(&[0u8; 8]),
    }
    out.extend_from_slice(&tx.amount.to_le_bytes());
    out.extend_from_slice(&tx.fee.to_le_bytes());
    if let Some(asset) = tx.multisignature() {
        out.push(asset.min);
        out.push(asset.lifetime);
        let keys: String = asset.keysgroup.iter().map(KeysgroupEntry::as_text).collect();
        out.extend_from_slice(keys.as_bytes());
    }
    if include_signature {
        if let Some(signature) = &tx.signature {
            out.extend_from_slice(signature);
        }
    }
    Ok(out)
}

pub fn hash(tx: &Transaction, include_signature: bool) -> Result<Hash, TransactionError> {
    Ok(crypto::sha256(&bytes(tx, include_signature)?))
}

pub fn id(tx: &Transaction) -> Result<String, TransactionError> {
    Ok(crypto::id_from_hash(&hash(tx, true)?))
}

/// Signature over the unsigned digest. Primary and member signatures use the same digest.
pub fn sign(tx: &Transaction, keypair: &Keypair) -> Result<Signature, TransactionError> {
    Ok(keypair.sign(&hash(tx, false)?))
}

/// Signs `tx` with `keypair` and fills in its sender address and id.
pub fn seal(mut tx: Transaction, keypair: &Keypair, address_suffix: &str) -> Result<Transaction, TransactionError> {
    tx.sender_id = crypto::address_from_public_key(&tx.sender_public_key, address_suffix);
    tx.signature = Some(sign(&tx, keypair)?);
    tx.id = id(&tx)?;
    Ok(tx)
}

pub fn verify_member_signature(tx: &Transaction, signature: &Signature, public_key: &PublicKey) -> bool {
    match hash(tx, false) {
        Ok(digest) => crypto::verify(&digest, signature, public_key),
        Err(_) => false,
    }
}

/// Balance change applied to one account by a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEffect {
    pub address: String,
    pub public_key: Option<PublicKey>,
    pub diff: AccountDiff,
}

pub struct TransactionLogic {
    spec: Arc<ChainSpec>,
    validator: Arc<dyn Validator>,
    readiness: ReadinessChain,
}

impl TransactionLogic {
    /// Starts with the multisignature readiness checks registered.
    pub fn new(spec: Arc<ChainSpec>, validator: Arc<dyn Validator>) -> Self {
        let mut readiness = ReadinessChain::default();
        readiness.register("multisignatures", readiness::multisignature_ready);
        readiness.register("multisignature_registration", readiness::registration_ready);
        Self {
            spec,
            validator,
            readiness,
        }
    }

    pub fn readiness_mut(&mut self) -> &mut ReadinessChain {
        &mut self.readiness
    }

    pub fn generate_address(&self, public_key: &PublicKey) -> String {
        crypto::address_from_public_key(public_key, &self.spec.address_suffix)
    }

    pub fn get_bytes(&self, tx: &Transaction, include_signature: bool) -> Result<Vec<u8>, TransactionError> {
        bytes(tx, include_signature)
    }

    pub fn get_hash(&self, tx: &Transaction, include_signature: bool) -> Result<Hash, TransactionError> {
        hash(tx, include_signature)
    }

    pub fn get_id(&self, tx: &Transaction) -> Result<String, TransactionError> {
        id(tx)
    }

    pub fn sign(&self, tx: &Transaction, keypair: &Keypair) -> Result<Signature, TransactionError> {
        sign(tx, keypair)
    }

    pub fn multi_sign(&self, tx: &Transaction, keypair: &Keypair) -> Result<Signature, TransactionError> {
        sign(tx, keypair)
    }

    pub fn seal(&self, tx: Transaction, keypair: &Keypair) -> Result<Transaction, TransactionError> {
        seal(tx, keypair, &self.spec.address_suffix)
    }

    /// Primary signature, checked against the requester key when one is set.
    pub fn verify_signature(&self, tx: &Transaction) -> bool {
        let Some(signature) = &tx.signature else {
            return false;
        };
        let signer = tx.requester_public_key.unwrap_or(tx.sender_public_key);
        verify_member_signature(tx, signature, &signer)
    }

    pub fn ready(&self, tx: &Transaction, sender: &Account) -> bool {
        self.readiness.evaluate(tx, sender, true)
    }

    pub fn verify(
        &self,
        tx: &Transaction,
        sender: &Account,
        requester: Option<&Account>,
        height: u64,
    ) -> Result<(), VerifyError> {
        let mut seen = HashSet::new();
        if !tx.signatures.iter().all(|signature| seen.insert(*signature)) {
            return Err(VerifyError::DuplicateSignature);
        }

        let address = self.generate_address(&tx.sender_public_key);
        let claimed_mismatch = !tx.sender_id.is_empty() && normalize_address(&tx.sender_id) != address;
        if sender.address != address || claimed_mismatch {
            return Err(VerifyError::SenderMismatch);
        }
        if sender.public_key.map_or(false, |key| key != tx.sender_public_key) {
            return Err(VerifyError::PublicKeyMismatch);
        }

        let expected = self.spec.fee_for(tx.kind, height);
        if tx.fee != expected {
            return Err(VerifyError::InvalidFee {
                expected,
                actual: tx.fee,
            });
        }
        if tx.kind == TransactionType::Send && tx.recipient_id.is_none() {
            return Err(VerifyError::MissingRecipient);
        }

        if let Some(requester_key) = &tx.requester_public_key {
            let requester = match requester {
                Some(requester) if sender.is_multisignature() || requester.is_multisignature() => requester,
                _ => return Err(VerifyError::NotMultisignature),
            };
            if !sender.multisignatures.contains(&hex::encode(requester_key)) {
                return Err(VerifyError::RequesterNotMember);
            }
            let diverges = requester.is_multisignature()
                && (requester.multimin, requester.multilifetime) != (sender.multimin, sender.multilifetime);
            if diverges {
                return Err(VerifyError::DivergentRequesterPolicy);
            }
        }

        if !self.verify_signature(tx) {
            return Err(VerifyError::InvalidSignature);
        }
        let computed = id(tx)?;
        if tx.id != computed {
            return Err(TransactionError::IdMismatch {
                claimed: tx.id.clone(),
                computed,
            }
            .into());
        }

        let group = if tx.kind == TransactionType::Multisignature {
            if sender.is_multisignature() {
                return Err(VerifyError::AlreadyMultisignature);
            }
            self.keysgroup(tx)?
        } else {
            sender.multisignature_keys()
        };

        let digest = hash(tx, false)?;
        for signature in &tx.signatures {
            if !group.iter().any(|key| crypto::verify(&digest, signature, key)) {
                return Err(VerifyError::InvalidMultisigSignature);
            }
        }

        let required = tx.amount.checked_add(tx.fee).ok_or(TransactionError::Overflow)?;
        if sender.balance < required {
            return Err(VerifyError::InsufficientBalance {
                address: sender.address.clone(),
                balance: sender.balance,
                required,
            });
        }

        if !self.ready(tx, sender) {
            return Err(VerifyError::MultisigNotReady);
        }
        Ok(())
    }

    fn keysgroup(&self, tx: &Transaction) -> Result<Vec<PublicKey>, VerifyError> {
        let asset = tx
            .multisignature()
            .ok_or_else(|| VerifyError::InvalidMultisigAsset("missing multisignature asset".into()))?;
        if asset.keysgroup.is_empty() || asset.keysgroup.len() > KEYSGROUP_MAX {
            return Err(VerifyError::InvalidMultisigAsset(format!(
                "keysgroup must have between 1 and {KEYSGROUP_MAX} members"
            )));
        }
        let mut keys = Vec::with_capacity(asset.keysgroup.len());
        for entry in &asset.keysgroup {
            let key = entry.public_key().ok_or(VerifyError::InvalidKeysgroupMember)?;
            if key == tx.sender_public_key {
                return Err(VerifyError::InvalidMultisigAsset("keysgroup contains the sender".into()));
            }
            if keys.contains(&key) {
                return Err(VerifyError::InvalidMultisigAsset("duplicate keysgroup member".into()));
            }
            keys.push(key);
        }
        if asset.min == 0 || usize::from(asset.min) > keys.len() {
            return Err(VerifyError::InvalidMultisigAsset(format!("invalid min {}", asset.min)));
        }
        if asset.lifetime == 0 || asset.lifetime > MULTISIG_LIFETIME_MAX {
            return Err(VerifyError::InvalidMultisigAsset(format!(
                "invalid lifetime {}",
                asset.lifetime
            )));
        }
        Ok(keys)
    }

    /// Checks `tx` against what the sender can still spend once queued
    /// transactions are accounted for.
    pub fn verify_unconfirmed_balance(&self, tx: &Transaction, sender: &Account) -> Result<(), VerifyError> {
        let required = tx.amount.checked_add(tx.fee).ok_or(TransactionError::Overflow)?;
        if sender.u_balance < required {
            return Err(VerifyError::InsufficientBalance {
                address: sender.address.clone(),
                balance: sender.u_balance,
                required,
            });
        }
        Ok(())
    }

    /// Spendable balance reserved by `tx` while it waits in the pool.
    pub fn unconfirmed_effect(&self, tx: &Transaction) -> LedgerEffect {
        let spent = i128::from(tx.amount) + i128::from(tx.fee);
        LedgerEffect {
            address: self.generate_address(&tx.sender_public_key),
            public_key: Some(tx.sender_public_key),
            diff: AccountDiff {
                u_balance: Some(-spent),
                ..Default::default()
            },
        }
    }

    /// Releases the reservation made by [`unconfirmed_effect`](Self::unconfirmed_effect).
    pub fn undo_unconfirmed_effect(&self, tx: &Transaction) -> LedgerEffect {
        let mut effect = self.unconfirmed_effect(tx);
        effect.public_key = None;
        effect.diff.u_balance = effect.diff.u_balance.map(|n| -n);
        effect
    }

    /// Validates untrusted JSON and returns the typed transaction with its
    /// sender address and id filled in when absent. A present id must match
    /// the transaction body.
    pub fn object_normalize(&self, raw: &Value) -> Result<Transaction, TransactionError> {
        self.validator
            .check(raw, &schema::TRANSACTION)
            .map_err(|error| TransactionError::Schema(error.message))?;
        let mut tx: Transaction =
            serde_json::from_value(raw.clone()).map_err(|e| TransactionError::Malformed(e.to_string()))?;
        if tx.sender_id.is_empty() {
            tx.sender_id = self.generate_address(&tx.sender_public_key);
        } else {
            tx.sender_id = normalize_address(&tx.sender_id);
        }
        if let Some(recipient) = tx.recipient_id.take() {
            tx.recipient_id = Some(normalize_address(&recipient));
        }
        let computed = id(&tx)?;
        if tx.id.is_empty() {
            tx.id = computed;
        } else if tx.id != computed {
            return Err(TransactionError::IdMismatch {
                claimed: tx.id,
                computed,
            });
        }
        Ok(tx)
    }

    /// Effects of applying `tx`. Genesis transactions only credit.
    pub fn apply_effects(&self, tx: &Transaction, genesis: bool) -> Result<Vec<LedgerEffect>, TransactionError> {
        let spent = i128::from(tx.amount) + i128::from(tx.fee);
        let mut sender = AccountDiff {
            public_key: Some(tx.sender_public_key),
            ..Default::default()
        };
        if !genesis {
            sender.balance = Some(-spent);
            sender.u_balance = Some(-spent);
        }
        if let Some(asset) = tx.multisignature() {
            sender.multisignatures = Some(asset.keysgroup.iter().map(KeysgroupEntry::as_text).collect());
            sender.multimin = Some(f64::from(asset.min));
            sender.multilifetime = Some(f64::from(asset.lifetime));
        }

        let mut effects = vec![LedgerEffect {
            address: self.generate_address(&tx.sender_public_key),
            public_key: Some(tx.sender_public_key),
            diff: sender,
        }];
        if let Some(recipient) = &tx.recipient_id {
            let credit = i128::from(tx.amount);
            effects.push(LedgerEffect {
                address: normalize_address(recipient),
                public_key: None,
                diff: AccountDiff {
                    balance: Some(credit),
                    u_balance: Some(credit),
                    ..Default::default()
                },
            });
        }
        Ok(effects)
    }

    /// Exact inverse of [`apply_effects`](Self::apply_effects) apart from the
    /// sender key binding and the virgin flag, which stay as they are.
    pub fn undo_effects(&self, tx: &Transaction, genesis: bool) -> Result<Vec<LedgerEffect>, TransactionError> {
        let mut effects = self.apply_effects(tx, genesis)?;
        for effect in &mut effects {
            let diff = &mut effect.diff;
            diff.public_key = None;
            diff.balance = diff.balance.map(|n| -n);
            diff.u_balance = diff.u_balance.map(|n| -n);
            diff.multimin = diff.multimin.map(|n| -n);
            diff.multilifetime = diff.multilifetime.map(|n| -n);
            diff.multisignatures = diff.multisignatures.take().map(|members| {
                members
                    .into_iter()
                    .map(|member| match member.strip_prefix('+') {
                        Some(key) => format!("-{key}"),
                        None => member,
                    })
                    .collect()
            });
        }
        Ok(effects)
    }

    pub fn db_save_op(&self, tx: &Transaction, block_id: &str) -> DbOp {
        trace!(id = %tx.id, block_id, "Staging transaction");
        DbOp::CreateTransaction {
            block_id: block_id.to_string(),
            transaction: tx.clone(),
        }
    }
}
