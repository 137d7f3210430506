use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::block::{self, Block};
use crate::crypto::{self, Keypair};
use crate::transaction::{self, Transaction, TransactionType};

pub const COIN: u64 = 100_000_000;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardMilestone {
    pub height: u64,
    pub reward: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeMilestone {
    pub height: u64,
    pub send: u64,
    pub multisignature: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionMilestone {
    pub height: u64,
    /// Semver range such as `^0.1.2`, optionally with a trailing letter build tag.
    pub version: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChainSpec {
    /// Unix time, seconds, of the chain epoch
    pub epoch_time: u64,
    /// Block slot duration, seconds
    pub block_time: u64,
    pub address_suffix: String,
    pub block_version: u32,
    /// Ordered by height; the last milestone at or below a height applies
    pub rewards: Vec<RewardMilestone>,
    pub fees: Vec<FeeMilestone>,
    pub min_version: Vec<VersionMilestone>,
    pub max_peers: usize,
    /// Cool-down after a peer is removed, seconds
    pub ban_time: u64,
    /// Blocks per rebuild batch
    pub load_per_iteration: u64,
    /// Blocks requested from a peer per round trip
    pub blocks_per_request: usize,
    /// Attempts for each periodic sync job
    pub retries: u32,
    pub genesis_block: Block,
}

pub const DEV_GENESIS_PASSPHRASE: &str = "genesis account of the development chain";

pub const DEV_FAUCET_PASSPHRASE: &str = "faucet account of the development chain";

pub const DEV_FAUCET_SUPPLY: u64 = 100_000_000 * COIN;

/// Deterministic genesis: one transfer of the whole supply to `recipient`.
pub fn build_genesis(genesis: &Keypair, recipient: &str, supply: u64, suffix: &str) -> Block {
    let transfer = Transaction::send(&genesis.public_key(), recipient, supply, 0, 0);
    let transfer = transaction::seal(transfer, genesis, suffix).expect("genesis transfer has a valid recipient");
    block::forge(genesis, None, 0, 0, 0, vec![transfer]).expect("genesis totals fit in u64")
}

pub static DEV: Lazy<ChainSpec> = Lazy::new(|| {
    let faucet = Keypair::from_passphrase(DEV_FAUCET_PASSPHRASE);
    let faucet_address = crypto::address_from_public_key(&faucet.public_key(), crypto::ADDRESS_SUFFIX);
    ChainSpec {
        epoch_time: 1_464_109_200,
        block_time: 30,
        address_suffix: crypto::ADDRESS_SUFFIX.to_string(),
        block_version: 0,
        rewards: vec![
            RewardMilestone {
                height: 1,
                reward: 0,
            },
            RewardMilestone {
                height: 10,
                reward: 15 * COIN,
            },
            RewardMilestone {
                height: 10_000_000,
                reward: 12 * COIN,
            },
        ],
        fees: vec![FeeMilestone {
            height: 1,
            send: COIN / 10,
            multisignature: 5 * COIN,
        }],
        min_version: vec![VersionMilestone {
            height: 1,
            version: "^0.1.0".to_string(),
        }],
        max_peers: 100,
        ban_time: 600,
        load_per_iteration: 1000,
        blocks_per_request: 34,
        retries: 5,
        genesis_block: build_genesis(
            &Keypair::from_passphrase(DEV_GENESIS_PASSPHRASE),
            &faucet_address,
            DEV_FAUCET_SUPPLY,
            crypto::ADDRESS_SUFFIX,
        ),
    }
});

impl Default for ChainSpec {
    fn default() -> Self {
        DEV.clone()
    }
}

impl ChainSpec {
    pub fn reward_at(&self, height: u64) -> u64 {
        self.rewards
            .iter()
            .filter(|milestone| milestone.height <= height)
            .last()
            .map_or(0, |milestone| milestone.reward)
    }

    pub fn fee_for(&self, kind: TransactionType, height: u64) -> u64 {
        let milestone = self.fees.iter().filter(|milestone| milestone.height <= height).last();
        match (milestone, kind) {
            (None, _) => 0,
            (Some(fees), TransactionType::Send) => fees.send,
            (Some(fees), TransactionType::Multisignature) => fees.multisignature,
        }
    }

    pub fn min_version_at(&self, height: u64) -> Option<&str> {
        self.min_version
            .iter()
            .filter(|milestone| milestone.height <= height)
            .last()
            .map(|milestone| milestone.version.as_str())
    }

    /// Milliseconds between periodic sync attempts.
    pub fn sync_interval_ms(&self) -> u64 {
        (self.block_time * 1000 / 50).max(1000)
    }
}

pub fn genesis_value_parser(s: &str) -> eyre::Result<ChainSpec, eyre::Error> {
    Ok(match s {
        "dev" => DEV.clone(),
        _ => {
            let raw = std::fs::read_to_string(PathBuf::from(s))?;
            serde_json::from_str(&raw)?
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn milestones_pick_last_reached_entry() {
        let spec = DEV.clone();
        assert_eq!(spec.reward_at(0), 0);
        assert_eq!(spec.reward_at(9), 0);
        assert_eq!(spec.reward_at(10), 15 * COIN);
        assert_eq!(spec.reward_at(20_000_000), 12 * COIN);
        assert_eq!(spec.fee_for(TransactionType::Send, 5), COIN / 10);
        assert_eq!(spec.fee_for(TransactionType::Send, 0), 0);
        assert_eq!(spec.min_version_at(1), Some("^0.1.0"));
        assert_eq!(spec.min_version_at(0), None);
    }

    #[test]
    fn sync_interval_has_a_floor() {
        let mut spec = DEV.clone();
        assert_eq!(spec.sync_interval_ms(), 1000);
        spec.block_time = 100;
        assert_eq!(spec.sync_interval_ms(), 2000);
    }

    #[test]
    fn dev_genesis_is_deterministic() {
        let genesis = &DEV.genesis_block;
        assert_eq!(genesis.header.height, 1);
        assert_eq!(genesis.header.previous_block, None);
        assert_eq!(genesis.transactions.len(), 1);
        assert_eq!(genesis.header.total_amount, DEV_FAUCET_SUPPLY);
        let rebuilt = build_genesis(
            &Keypair::from_passphrase(DEV_GENESIS_PASSPHRASE),
            &genesis.transactions[0].recipient_id.clone().unwrap(),
            DEV_FAUCET_SUPPLY,
            crypto::ADDRESS_SUFFIX,
        );
        assert_eq!(&rebuilt, genesis);
    }

    #[test]
    fn parses_spec_files_with_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"blockTime": 10, "maxPeers": 7}}"#).unwrap();
        let spec = genesis_value_parser(file.path().to_str().unwrap()).unwrap();
        assert_eq!(spec.block_time, 10);
        assert_eq!(spec.max_peers, 7);
        assert_eq!(spec.genesis_block, DEV.genesis_block);

        let round_trip: ChainSpec = serde_json::from_str(&serde_json::to_string(&*DEV).unwrap()).unwrap();
        assert_eq!(round_trip.genesis_block, DEV.genesis_block);
        assert!(genesis_value_parser("/definitely/not/here.json").is_err());
    }
}
