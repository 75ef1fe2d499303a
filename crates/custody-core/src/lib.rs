//! Settlement core of a custodial BTC and Omni token wallet.
//!
//! Deposits are discovered by scanning confirmed blocks, swept to the cold
//! wallet, and reported to the owning product. Withdrawals are batched into
//! signed transactions from the hot wallet, broadcast, and tracked to their
//! first confirmation. Every step runs as a named periodic job that never
//! overlaps with itself.

pub mod address_pool;
pub mod batcher;
pub mod broadcast;
pub mod config;
pub mod consolidation;
pub mod context;
pub mod error;
pub mod fee_rate;
pub mod jobs;
pub mod ledger;
pub mod notify;
pub mod rpc;
pub mod scanner;
pub mod settings;
pub mod store;
pub mod telemetry;
pub mod token_scanner;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use config::CustodyConfig;
pub use context::CustodyContext;
pub use error::CustodyError;
pub use jobs::{Custodian, JobName, JobRun};
pub use rpc::{JsonRpcClient, NodeRpc, RpcError};
pub use settings::{MemorySettings, Settings};
pub use store::{MemoryStore, Store, StoreError};
