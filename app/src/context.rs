//! One instance of every component, wired together explicitly.

use crate::{
    account::AccountLogic,
    block::BlockLogic,
    bus::{EventBus, LoaderHook},
    chain::BlockChain,
    loader::{Loader, LoaderConfig},
    network::{Broadcaster, DirectoryBroadcaster, HttpTransport, PeerTransport, DEFAULT_REQUEST_TIMEOUT},
    peers::PeerDirectory,
    pool::{TransactionPool, EXPIRY_INTERVAL},
    schema::{SchemaValidator, Validator},
    spec::ChainSpec,
    store::{MemoryStore, Storage},
    system::SystemInfo,
    transaction::TransactionLogic,
};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{sync::RwLock, task::JoinHandle};
use tracing::*;

/// Hook with no extra integrity checks.
pub struct DefaultHook;

impl LoaderHook for DefaultHook {}

pub struct NodeContext {
    pub spec: Arc<ChainSpec>,
    pub storage: Arc<dyn Storage>,
    pub validator: Arc<dyn Validator>,
    pub accounts: Arc<AccountLogic>,
    pub transactions: Arc<TransactionLogic>,
    pub blocks: Arc<BlockLogic>,
    pub system: Arc<SystemInfo>,
    pub peers: Arc<RwLock<PeerDirectory>>,
    pub transport: Arc<dyn PeerTransport>,
    pub chain: Arc<BlockChain>,
    pub pool: Arc<TransactionPool>,
    pub loader: Arc<Loader>,
    pub bus: EventBus,
}

pub struct NodeContextBuilder {
    spec: ChainSpec,
    version: String,
    port: u16,
    request_timeout: Duration,
    storage: Option<Arc<dyn Storage>>,
    transport: Option<Arc<dyn PeerTransport>>,
    broadcaster: Option<Arc<dyn Broadcaster>>,
    hook: Option<Arc<dyn LoaderHook>>,
    loader_config: Option<LoaderConfig>,
}

impl NodeContext {
    pub fn builder(spec: ChainSpec) -> NodeContextBuilder {
        NodeContextBuilder {
            spec,
            version: env!("CARGO_PKG_VERSION").to_string(),
            port: 0,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            storage: None,
            transport: None,
            broadcaster: None,
            hook: None,
            loader_config: None,
        }
    }

    /// Drops pool entries that waited too long, every [`EXPIRY_INTERVAL`].
    pub fn spawn_pool_expiry(&self) -> JoinHandle<()> {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EXPIRY_INTERVAL);
            loop {
                ticker.tick().await;
                let expired = pool.expire(Instant::now()).await;
                if expired > 0 {
                    debug!(expired, "Expired pool transactions");
                }
            }
        })
    }
}

impl NodeContextBuilder {
    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn PeerTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn hook(mut self, hook: Arc<dyn LoaderHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn loader_config(mut self, config: LoaderConfig) -> Self {
        self.loader_config = Some(config);
        self
    }

    pub fn build(self) -> NodeContext {
        let system = Arc::new(SystemInfo::for_spec(&self.spec, &self.version, self.port));
        let loader_config = self.loader_config.unwrap_or_else(|| LoaderConfig::from_spec(&self.spec));
        let ban_time = Duration::from_secs(self.spec.ban_time);
        let spec = Arc::new(self.spec);
        let bus = EventBus::default();

        let validator: Arc<dyn Validator> = Arc::new(SchemaValidator);
        let storage = self.storage.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let accounts = Arc::new(AccountLogic::new(storage.clone(), &spec.address_suffix));
        let transactions = Arc::new(TransactionLogic::new(spec.clone(), validator.clone()));
        let blocks = Arc::new(BlockLogic::new(spec.clone(), transactions.clone(), validator.clone()));
        let peers = Arc::new(RwLock::new(PeerDirectory::new(system.clone(), ban_time)));
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HttpTransport::new(system.clone(), self.request_timeout)));
        let broadcaster = self
            .broadcaster
            .unwrap_or_else(|| Arc::new(DirectoryBroadcaster::new(peers.clone(), system.clone())));
        let hook = self.hook.unwrap_or_else(|| Arc::new(DefaultHook));

        let pool = Arc::new(TransactionPool::new(
            transactions.clone(),
            accounts.clone(),
            storage.clone(),
            system.clone(),
            bus.clone(),
        ));
        let chain = Arc::new(BlockChain::new(
            spec.clone(),
            storage.clone(),
            accounts.clone(),
            transactions.clone(),
            blocks.clone(),
            system.clone(),
            transport.clone(),
            validator.clone(),
            pool.clone(),
            bus.clone(),
        ));
        let loader = Arc::new(Loader::new(
            loader_config,
            spec.clone(),
            chain.clone(),
            storage.clone(),
            pool.clone(),
            peers.clone(),
            transport.clone(),
            broadcaster,
            validator.clone(),
            hook,
            bus.clone(),
        ));
        debug!(nethash = %system.headers().nethash, "Node context built");

        NodeContext {
            spec,
            storage,
            validator,
            accounts,
            transactions,
            blocks,
            system,
            peers,
            transport,
            chain,
            pool,
            loader,
            bus,
        }
    }
}
