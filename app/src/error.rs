use crate::{
    account::AccountError,
    block::BlockError,
    chain::ChainError,
    loader::SyncError,
    network::TransportError,
    peers::PeerError,
    pool::PoolError,
    sequence::JobsError,
    store::StorageError,
    transaction::{TransactionError, VerifyError},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Account(#[from] AccountError),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Jobs(#[from] JobsError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
