use thiserror::Error;

/// Bitcoin chain operation errors.
#[derive(Debug, Error)]
pub enum BtcError {
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid script: {0}")]
    InvalidScript(String),

    #[error("output of {value} sat is below the dust limit of {limit} sat")]
    DustOutput { value: u64, limit: u64 },

    #[error("change of {value} sat is below the dust limit of {limit} sat")]
    DustChange { value: u64, limit: u64 },

    #[error("insufficient funds: have {available} sat, need {required} sat")]
    InsufficientFunds { available: u64, required: u64 },

    #[error("transaction build error: {0}")]
    TransactionBuildError(String),

    #[error("signing error: {0}")]
    SigningError(String),
}
