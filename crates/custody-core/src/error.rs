use thiserror::Error;

use crate::rpc::RpcError;
use crate::store::StoreError;
use crate::types::WalletAddress;

#[derive(Debug, Error)]
pub enum CustodyError {
    #[error("node rpc: {0}")]
    Rpc(#[from] RpcError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("btc: {0}")]
    Btc(#[from] chain_btc::BtcError),

    #[error("key store: {0}")]
    Crypto(#[from] crypto_utils::CryptoError),

    #[error("missing setting: {0}")]
    MissingSetting(String),

    #[error("invalid setting {key}: {reason}")]
    InvalidSetting { key: String, reason: String },

    #[error("no key for address {0}")]
    MissingKey(WalletAddress),

    #[error("no token config for index {0}")]
    MissingTokenConfig(u32),

    #[error("unknown cursor {0}")]
    MissingCursor(String),

    #[error("malformed chain data: {0}")]
    ChainData(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("fee source: {0}")]
    FeeSource(String),

    #[error("config: {0}")]
    Config(String),
}

impl CustodyError {
    /// Errors that leave state untouched and are expected to clear on a later
    /// run: node and fee-source failures, key decryption.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CustodyError::Rpc(_) | CustodyError::Crypto(_) | CustodyError::FeeSource(_)
        )
    }
}
