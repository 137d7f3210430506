mod app;

pub mod account;
pub mod block;
pub mod bus;
pub mod chain;
pub mod context;
pub mod crypto;
pub mod error;
pub mod loader;
pub mod metrics;
pub mod network;
pub mod peers;
pub mod pool;
pub mod readiness;
pub mod retry;
pub mod schema;
pub mod sequence;
mod serde_utils;
pub mod spec;
pub mod store;
pub mod system;
pub mod testing;
pub mod transaction;

// for main.rs
pub use app::run;

pub use context::NodeContext;
pub use error::{Error, Result};
