use thiserror::Error;

/// Key store errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("key derivation failed: {0}")]
    KdfFailed(String),

    #[error("invalid key length")]
    InvalidKeyLength,

    #[error("invalid input: {0}")]
    InvalidInput(String),
}
