//! # crypto-utils
//!
//! At-rest protection for custodial private keys: AES-256-GCM sealing of WIF
//! strings and Argon2id derivation of the sealing key.

pub mod encryption;
pub mod error;
pub mod kdf;

pub use encryption::KeyCipher;
pub use error::CryptoError;
