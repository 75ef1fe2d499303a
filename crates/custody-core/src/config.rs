//! Static process configuration, loaded once from TOML at start-up.
//!
//! Values that operators change at runtime (fee rates, addresses, depths) are
//! not here; they live behind [`crate::settings::Settings`].

use std::fmt;
use std::path::Path;
use std::time::Duration;

use chain_btc::BtcNetwork;
use crypto_utils::{kdf, KeyCipher};
use serde::Deserialize;

use crate::error::CustodyError;

#[derive(Debug, Clone, Deserialize)]
pub struct CustodyConfig {
    #[serde(default = "default_network")]
    pub network: BtcNetwork,
    pub node: NodeConfig,
    pub keys: KeysConfig,
    #[serde(default)]
    pub fee_source: FeeSourceConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub url: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_rpc_timeout")]
    pub timeout_secs: u64,
}

/// Passphrase and salt for the at-rest key cipher.
#[derive(Clone, Deserialize)]
pub struct KeysConfig {
    pub passphrase: String,
    /// 16 bytes, hex.
    pub salt: String,
}

impl fmt::Debug for KeysConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeysConfig")
            .field("passphrase", &"..")
            .field("salt", &self.salt)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeeSourceConfig {
    #[serde(default = "default_fee_url")]
    pub url: String,
    #[serde(default = "default_fee_timeout")]
    pub timeout_secs: u64,
}

impl Default for FeeSourceConfig {
    fn default() -> Self {
        Self {
            url: default_fee_url(),
            timeout_secs: default_fee_timeout(),
        }
    }
}

/// Per-job period in seconds. `0` disables the job.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub address_pool_secs: u64,
    pub scan_secs: u64,
    pub token_scan_secs: u64,
    pub withdraw_secs: u64,
    pub sweep_secs: u64,
    pub token_sweep_secs: u64,
    pub broadcast_secs: u64,
    pub confirm_secs: u64,
    pub notify_secs: u64,
    pub fee_rate_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            address_pool_secs: 60,
            scan_secs: 30,
            token_scan_secs: 30,
            withdraw_secs: 60,
            sweep_secs: 600,
            token_sweep_secs: 600,
            broadcast_secs: 30,
            confirm_secs: 60,
            notify_secs: 10,
            fee_rate_secs: 300,
        }
    }
}

fn default_network() -> BtcNetwork {
    BtcNetwork::Mainnet
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_rpc_timeout() -> u64 {
    30
}

fn default_fee_url() -> String {
    "https://mempool.space/api/v1/fees/recommended".to_string()
}

fn default_fee_timeout() -> u64 {
    120
}

impl CustodyConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CustodyError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CustodyError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, CustodyError> {
        let config: Self =
            toml::from_str(text).map_err(|e| CustodyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CustodyError> {
        if self.node.url.is_empty() {
            return Err(CustodyError::Config("node.url is empty".into()));
        }
        if self.node.timeout_secs == 0 {
            return Err(CustodyError::Config("node.timeout_secs must be > 0".into()));
        }
        if self.keys.passphrase.is_empty() {
            return Err(CustodyError::Config("keys.passphrase is empty".into()));
        }
        kdf::parse_salt(&self.keys.salt)
            .map_err(|e| CustodyError::Config(format!("keys.salt: {e}")))?;
        Ok(())
    }

    /// Derive the at-rest key cipher. Argon2id, so this is slow on purpose
    /// and should run once per process.
    pub fn key_cipher(&self) -> Result<KeyCipher, CustodyError> {
        let salt = kdf::parse_salt(&self.keys.salt)?;
        Ok(KeyCipher::from_passphrase(
            self.keys.passphrase.as_bytes(),
            &salt,
        )?)
    }
}

impl JobsConfig {
    /// Period of a job, `None` when disabled.
    pub fn interval(&self, secs: u64) -> Option<Duration> {
        (secs > 0).then(|| Duration::from_secs(secs))
    }
}
