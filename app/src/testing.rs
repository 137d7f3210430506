//! Fixtures for unit and integration tests: deterministic keys, reference
//! transactions, chain builders and scripted collaborators.

use crate::{
    block::{self, Block, BlockHeader},
    context::NodeContext,
    crypto::{self, Keypair},
    loader::LoaderConfig,
    network::{Broadcaster, PeerRequest, PeerTransport, TransportError},
    peers::{Peer, PeerState},
    pool::SignatureBundle,
    retry::RetryPolicy,
    spec::{self, ChainSpec, RewardMilestone, DEV, DEV_FAUCET_PASSPHRASE},
    system::{self, SystemInfo},
    transaction::{self, Transaction},
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

pub const COIN: u64 = spec::COIN;
pub const SEND_FEE: u64 = COIN / 10;
pub const MULTISIG_FEE: u64 = 5 * COIN;
pub const GENERATOR_PASSPHRASE: &str =
    "oath polypody manumit effector half sigmoid abound osmium jewfish weed sunproof ramose";

/// The development chain, paying a 5 coin reward from height 2.
pub fn spec() -> ChainSpec {
    ChainSpec {
        rewards: vec![
            RewardMilestone { height: 1, reward: 0 },
            RewardMilestone {
                height: 2,
                reward: 5 * COIN,
            },
        ],
        ..DEV.clone()
    }
}

pub fn generator() -> Keypair {
    Keypair::from_passphrase(GENERATOR_PASSPHRASE)
}

/// Holds the whole development supply after genesis.
pub fn faucet() -> Keypair {
    Keypair::from_passphrase(DEV_FAUCET_PASSPHRASE)
}

/// Signed transfer paying the standard fee.
pub fn send(keypair: &Keypair, recipient: &str, amount: u64, timestamp: u32) -> Transaction {
    let tx = Transaction::send(&keypair.public_key(), recipient, amount, SEND_FEE, timestamp);
    transaction::seal(tx, keypair, crypto::ADDRESS_SUFFIX).expect("fixture recipient is valid")
}

fn hex_bytes<const N: usize>(hex: &str) -> [u8; N] {
    let mut out = [0u8; N];
    hex::decode_to_slice(hex, &mut out).expect("fixture hex is valid");
    out
}

/// Three recorded transfers; the last two are identical.
pub fn reference_transactions() -> [Transaction; 3] {
    let sender = hex_bytes::<32>("35526f8a1e2f482264e5d4982fc07e73f4ab9f4794b110ceefecd8f880d51892");
    let first_signature = hex_bytes::<64>(
        "f8fbf9b8433bf1bbea971dc8b14c6772d33c7dd285d84c5e6c984b10c4141e9fa56ace902b910e05e98b55898d982b3d5b9bf8bd897083a7d1ca1d5028703e03",
    );
    let second_signature = hex_bytes::<64>(
        "e26edb739d93bb415af72f1c288b06560c0111c4505f11076ca20e2f6e8903d3b007309c0e04362bfeb8bf2021d0e67ce3c943bfe0c0193f6c9503eb6dfe750c",
    );
    let build = |recipient: &str, fee: u64, signature| {
        let mut tx = Transaction::send(&sender, recipient, 108_910_891_000_000, fee, 0);
        tx.sender_id = "14709573872795067383R".to_string();
        tx.signature = Some(signature);
        tx.id = transaction::id(&tx).expect("fixture transaction serializes");
        tx
    };
    [
        build("15256762582730568272R", 5, first_signature),
        build("6781920633453960895R", 3, second_signature),
        build("6781920633453960895R", 3, second_signature),
    ]
}

/// Header with every field zeroed, for struct update syntax.
pub fn reference_header() -> BlockHeader {
    BlockHeader {
        id: String::new(),
        version: 0,
        timestamp: 0,
        height: 1,
        previous_block: None,
        number_of_transactions: 0,
        total_amount: 0,
        total_fee: 0,
        reward: 0,
        payload_length: 0,
        payload_hash: [0u8; 32],
        generator_public_key: [0u8; 32],
        block_signature: [0u8; 64],
    }
}

/// Node headers for [`spec`], already at the genesis height.
pub fn system() -> Arc<SystemInfo> {
    let spec = spec();
    let system = SystemInfo::for_spec(&spec, "0.1.0", 5555);
    system.update(&spec.genesis_block.header);
    Arc::new(system)
}

pub fn peer(ip: &str, height: u64) -> Peer {
    Peer {
        height,
        nonce: system::random_nonce(),
        version: "0.1.0".to_string(),
        state: PeerState::Connected,
        ..Peer::new(ip, 5555)
    }
}

/// `count` blocks forged by [`generator`] on top of `previous`, one slot
/// apart. `transactions_at` supplies each block's transactions by height.
pub fn extend<F>(spec: &ChainSpec, previous: &BlockHeader, count: usize, mut transactions_at: F) -> Vec<Block>
where
    F: FnMut(u64) -> Vec<Transaction>,
{
    let generator = generator();
    let mut previous = previous.clone();
    let mut blocks = Vec::with_capacity(count);
    for _ in 0..count {
        let height = previous.height + 1;
        let block = block::forge(
            &generator,
            Some(&previous),
            spec.block_version,
            previous.timestamp + spec.block_time as u32,
            spec.reward_at(height),
            transactions_at(height),
        )
        .expect("fixture block totals fit");
        previous = block.header.clone();
        blocks.push(block);
    }
    blocks
}

/// `blocks` preceded by the genesis block of `spec`.
pub fn with_genesis(spec: &ChainSpec, blocks: &[Block]) -> Vec<Block> {
    let mut chain = vec![spec.genesis_block.clone()];
    chain.extend_from_slice(blocks);
    chain
}

pub type TestNode = NodeContext;

/// Loader settings with millisecond backoff.
pub fn loader_config() -> LoaderConfig {
    LoaderConfig {
        block_retry: RetryPolicy::attempts(3)
            .with_min_delay(Duration::from_millis(5))
            .with_max_delay(Duration::from_millis(20)),
        ..LoaderConfig::from_spec(&spec())
    }
}

/// A node on [`spec`] over `transport`, with its genesis block loaded.
pub async fn boot(transport: Arc<MockTransport>) -> TestNode {
    let node = NodeContext::builder(spec())
        .version("0.1.0")
        .port(5555)
        .transport(transport)
        .broadcaster(Arc::new(RecordingBroadcaster::default()))
        .loader_config(loader_config())
        .build();
    node.loader.load_block_chain().await.expect("genesis loads");
    node
}

#[derive(Default)]
struct Script {
    chains: HashMap<String, Vec<Block>>,
    transactions: HashMap<String, Vec<Value>>,
    signatures: HashMap<String, Vec<SignatureBundle>>,
    failures: HashMap<String, TransportError>,
    requests: Vec<(String, PeerRequest)>,
}

/// Answers peer requests from scripted per-peer chains and pools. Height
/// requests report the scripted chain's tip, or the height the caller
/// already holds for the peer.
#[derive(Default)]
pub struct MockTransport {
    script: Mutex<Script>,
}

impl MockTransport {
    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serves `chain`, genesis first, as `peer`'s blocks.
    pub fn serve_chain(&self, peer: &Peer, chain: Vec<Block>) {
        self.script().chains.insert(peer.key(), chain);
    }

    pub fn serve_transactions(&self, peer: &Peer, transactions: Vec<Value>) {
        self.script().transactions.insert(peer.key(), transactions);
    }

    pub fn serve_signatures(&self, peer: &Peer, bundles: Vec<SignatureBundle>) {
        self.script().signatures.insert(peer.key(), bundles);
    }

    /// Every later request to `peer` fails with `error`.
    pub fn fail(&self, peer: &Peer, error: TransportError) {
        self.script().failures.insert(peer.key(), error);
    }

    pub fn requests(&self) -> Vec<(String, PeerRequest)> {
        self.script().requests.clone()
    }

    fn common_block(chain: &[Block], ids: &[String]) -> Value {
        let common = chain.iter().rev().find(|block| ids.contains(&block.header.id));
        json!({
            "common": common.map(|block| json!({
                "id": block.header.id,
                "previousBlock": block.header.previous_block,
                "height": block.header.height,
            })),
        })
    }

    fn blocks_after(chain: &[Block], last_block_id: &str, limit: usize) -> Value {
        let start = chain
            .iter()
            .position(|block| block.header.id == last_block_id)
            .map_or(chain.len(), |index| index + 1);
        let blocks: Vec<Value> = chain[start..]
            .iter()
            .take(limit)
            .map(|block| serde_json::to_value(block).expect("fixture block serializes"))
            .collect();
        json!({ "blocks": blocks })
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn request(&self, peer: &Peer, request: PeerRequest) -> Result<Value, TransportError> {
        let key = peer.key();
        let mut script = self.script();
        script.requests.push((key.clone(), request.clone()));
        if let Some(error) = script.failures.get(&key) {
            return Err(error.clone());
        }
        let unreachable = || TransportError::Unreachable {
            peer: key.clone(),
            reason: "no scripted response".to_string(),
        };
        match request {
            PeerRequest::Height => {
                let height = script
                    .chains
                    .get(&key)
                    .and_then(|chain| chain.last())
                    .map_or(peer.height, |block| block.header.height);
                Ok(json!({ "height": height }))
            }
            PeerRequest::CommonBlock { ids } => {
                let chain = script.chains.get(&key).ok_or_else(unreachable)?;
                Ok(Self::common_block(chain, &ids))
            }
            PeerRequest::BlocksAfter { last_block_id, limit } => {
                let chain = script.chains.get(&key).ok_or_else(unreachable)?;
                Ok(Self::blocks_after(chain, &last_block_id, limit))
            }
            PeerRequest::Transactions => Ok(json!({
                "transactions": script.transactions.get(&key).cloned().unwrap_or_default(),
            })),
            PeerRequest::Signatures => {
                let bundles = script.signatures.get(&key).cloned().unwrap_or_default();
                Ok(json!({ "signatures": bundles }))
            }
        }
    }
}

/// Records every consensus refresh and reports full agreement.
#[derive(Default)]
pub struct RecordingBroadcaster {
    calls: Mutex<Vec<usize>>,
}

impl RecordingBroadcaster {
    pub fn calls(&self) -> Vec<usize> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl Broadcaster for RecordingBroadcaster {
    async fn refresh_consensus(&self, limit: usize) -> Result<f64, TransportError> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(limit);
        Ok(100.0)
    }
}
