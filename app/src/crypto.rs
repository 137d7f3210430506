//! Hashing, ed25519 signing and the numeric id/address derivations shared by
//! blocks, transactions and accounts.

use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use std::fmt;

pub type Hash = [u8; 32];
pub type PublicKey = [u8; 32];
pub type Signature = [u8; 64];

pub const ADDRESS_SUFFIX: &str = "R";

pub fn sha256(data: &[u8]) -> Hash {
    Sha256::digest(data).into()
}

#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Deterministic keypair whose secret seed is the sha256 of the passphrase.
    pub fn from_passphrase(passphrase: &str) -> Self {
        Self::from_seed(sha256(passphrase.as_bytes()))
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.signing.verifying_key().to_bytes()
    }

    pub fn sign(&self, digest: &Hash) -> Signature {
        self.signing.sign(digest).to_bytes()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &hex::encode(self.public_key()))
            .finish()
    }
}

pub fn verify(digest: &Hash, signature: &Signature, public_key: &PublicKey) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    key.verify(digest, &DalekSignature::from_bytes(signature)).is_ok()
}

/// Little-endian u64 over the first eight bytes of the hash, rendered in decimal.
pub fn id_from_hash(hash: &Hash) -> String {
    let mut head = [0u8; 8];
    head.copy_from_slice(&hash[..8]);
    u64::from_le_bytes(head).to_string()
}

pub fn address_from_public_key(public_key: &PublicKey, suffix: &str) -> String {
    format!("{}{}", id_from_hash(&sha256(public_key)), suffix)
}

/// Numeric part of an address such as `15256762582730568272R`.
pub fn address_to_u64(address: &str) -> Option<u64> {
    let digits = address.trim_end_matches(|c: char| c.is_ascii_alphabetic());
    if digits.is_empty() || digits.len() == address.len() {
        return None;
    }
    digits.parse().ok()
}

pub fn id_to_u64(id: &str) -> Option<u64> {
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    id.parse().ok()
}

pub fn is_valid_address(address: &str) -> bool {
    address_to_u64(address).is_some()
}

pub fn is_valid_id(id: &str) -> bool {
    id_to_u64(id).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSPHRASE: &str =
        "oath polypody manumit effector half sigmoid abound osmium jewfish weed sunproof ramose";

    #[test]
    fn passphrase_derives_known_key_and_address() {
        let keypair = Keypair::from_passphrase(PASSPHRASE);
        assert_eq!(
            hex::encode(keypair.public_key()),
            "cb8d857f33f6d330b2de6b9d2f0e6bf004bc0e2e3f3c7e6b2f5b763312ee2c7c"
        );
        assert_eq!(
            address_from_public_key(&keypair.public_key(), ADDRESS_SUFFIX),
            "16944811833341261198R"
        );
    }

    #[test]
    fn signatures_verify_only_for_signer() {
        let keypair = Keypair::from_passphrase(PASSPHRASE);
        let other = Keypair::from_passphrase("other");
        let digest = sha256(b"payload");
        let signature = keypair.sign(&digest);
        assert!(verify(&digest, &signature, &keypair.public_key()));
        assert!(!verify(&digest, &signature, &other.public_key()));
        assert!(!verify(&sha256(b"tampered"), &signature, &keypair.public_key()));
    }

    #[test]
    fn address_parsing() {
        assert_eq!(address_to_u64("6781920633453960895R"), Some(6781920633453960895));
        assert_eq!(address_to_u64("6781920633453960895"), None);
        assert_eq!(address_to_u64("R"), None);
        assert_eq!(address_to_u64("12x4R"), None);
        assert!(is_valid_id("15158714392463150213"));
        assert!(!is_valid_id("a1a"));
        assert!(!is_valid_id(""));
    }
}
